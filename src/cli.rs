use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "skyhook-operator")]
#[command(about = "Node package lifecycle operator for Kubernetes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
    Wide,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display client version, and the cluster version unless --client-only
    Version {
        #[arg(long)]
        client_only: bool,

        /// Timeout for the apiserver version call (e.g. 5s, 1m)
        #[arg(long, default_value = "5s")]
        timeout: String,
    },

    /// Check cluster connectivity and CRD installation
    Check,

    /// Start the reconcile loop
    Operator,

    /// Manage the Skyhook and DeploymentPolicy CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Manage the validating admission webhook
    Webhook {
        #[command(subcommand)]
        action: WebhookAction,
    },

    /// Pause a Skyhook (halts it and lower priorities on every node)
    Pause {
        skyhook: String,
        #[arg(long)]
        confirm: bool,
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume a paused Skyhook
    Resume {
        skyhook: String,
        #[arg(long)]
        confirm: bool,
        #[arg(long)]
        dry_run: bool,
    },

    /// Disable a Skyhook (successors treat it as absent)
    Disable {
        skyhook: String,
        #[arg(long)]
        confirm: bool,
        #[arg(long)]
        dry_run: bool,
    },

    /// Re-enable a disabled Skyhook
    Enable {
        skyhook: String,
        #[arg(long)]
        confirm: bool,
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect and manage nodes
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },

    /// Inspect and manage packages
    Package {
        #[command(subcommand)]
        action: PackageAction,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install (or update) the CRDs in the connected cluster
    Install,
}

#[derive(Subcommand)]
pub enum WebhookAction {
    /// Start the admission webhook HTTPS server
    Serve {
        #[arg(long, default_value = "0.0.0.0:8443")]
        addr: String,
        #[arg(long, default_value = "tls.crt")]
        tls_cert: String,
        #[arg(long, default_value = "tls.key")]
        tls_key: String,
    },

    /// Generate self-signed TLS certificates for development
    CertGenerate {
        #[arg(long, default_value = "skyhook-webhook")]
        service_name: String,
        #[arg(long, default_value = "skyhook")]
        namespace: String,
        #[arg(long, default_value = ".")]
        output_dir: String,
    },

    /// Print the ValidatingWebhookConfiguration YAML
    InstallConfig {
        #[arg(long, default_value = "skyhook-webhook")]
        service_name: String,
        #[arg(long, default_value = "skyhook")]
        namespace: String,
        #[arg(long)]
        ca_bundle_path: String,
    },
}

#[derive(Subcommand)]
pub enum NodeAction {
    /// List nodes targeted by a Skyhook
    List {
        #[arg(long)]
        skyhook: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },

    /// Per-node package status; patterns are regexes, union-matched
    Status {
        patterns: Vec<String>,
        #[arg(long)]
        skyhook: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },

    /// Strip a Skyhook's recorded state from matched nodes
    Reset {
        #[arg(required = true)]
        patterns: Vec<String>,
        #[arg(long)]
        skyhook: String,
        #[arg(long)]
        confirm: bool,
        #[arg(long)]
        dry_run: bool,
    },

    /// Exclude matched nodes from all processing
    Ignore {
        #[arg(required = true)]
        patterns: Vec<String>,
        #[arg(long)]
        dry_run: bool,
    },

    /// Re-include matched nodes
    Unignore {
        #[arg(required = true)]
        patterns: Vec<String>,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
pub enum PackageAction {
    /// Per-node status of one package
    Status {
        package: String,
        #[arg(long)]
        skyhook: String,
        #[arg(long = "node")]
        nodes: Vec<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },

    /// Clear recorded state at/after a stage so the engine re-dispatches
    Rerun {
        package: String,
        #[arg(long)]
        skyhook: String,
        #[arg(long = "node", required = true)]
        nodes: Vec<String>,
        #[arg(long)]
        stage: Option<String>,
        #[arg(long)]
        confirm: bool,
        #[arg(long)]
        dry_run: bool,
    },

    /// Stream or dump runner logs for one package
    Logs {
        package: String,
        #[arg(long)]
        skyhook: String,
        #[arg(long)]
        node: Option<String>,
        #[arg(long)]
        stage: Option<String>,
        #[arg(short, long)]
        follow: bool,
        #[arg(long)]
        tail: Option<i64>,
    },
}

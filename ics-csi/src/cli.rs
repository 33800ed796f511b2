use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// ICS CSI driver tooling: node discovery and volume operations against
/// the configured virtual centers.
#[derive(Parser, Debug)]
#[command(name = "ics-csi-driver", version, about)]
pub struct Cli {
    /// Driver configuration file. Overrides `ICS_CSI_CONFIG`
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Skip TLS certificate verification for every virtual center
    #[arg(long, global = true)]
    pub insecure: bool,

    /// Do not ask the Kubernetes API for node UUIDs
    #[arg(long, global = true)]
    pub no_kube: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search every datacenter for a VM by name or UUID
    Resolve(ResolveArgs),

    /// Node registry operations
    #[command(subcommand)]
    Nodes(NodesCommand),

    /// Volume lifecycle operations
    #[command(subcommand)]
    Volume(VolumeCommand),

    /// Remote task operations
    #[command(subcommand)]
    Task(TaskCommand),

    /// Print plugin identity and probe the backend
    Info,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// VM name
    #[arg(short, long, default_value = "")]
    pub name: String,

    /// VM UUID, matched exactly
    #[arg(short, long, default_value = "")]
    pub uuid: String,
}

#[derive(Subcommand, Debug)]
pub enum NodesCommand {
    /// Discover a node and print its VM
    Get {
        /// Kubernetes node name
        #[arg(short, long)]
        name: String,

        /// VM UUID. Looked up in Kubernetes when omitted
        #[arg(short, long, default_value = "")]
        uuid: String,
    },

    /// Discover nodes and print all of them, renewed
    List {
        /// Node to register (format: NAME[=UUID]), can be set multiple times
        #[arg(long = "node", value_name = "NAME[=UUID]", required = true)]
        nodes: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum VolumeCommand {
    /// Create a volume
    Create {
        #[arg(short, long)]
        name: String,

        /// Capacity in bytes. Zero selects the default size
        #[arg(long, default_value_t = 0)]
        capacity_bytes: u64,

        /// Target datastore id
        #[arg(long)]
        datastore: String,

        /// Filesystem type recorded in the volume context
        #[arg(long)]
        fs_type: Option<String>,
    },

    /// Delete a volume and its data
    Delete {
        #[arg(long)]
        id: String,
    },

    /// Grow a volume
    Expand {
        #[arg(long)]
        id: String,

        /// New capacity in bytes
        #[arg(long)]
        capacity_bytes: u64,

        /// The volume is consumed as a raw block device
        #[arg(long)]
        block: bool,
    },

    /// Attach a volume to a node's VM
    Attach {
        #[arg(long)]
        id: String,

        /// Kubernetes node name
        #[arg(long)]
        node: String,

        /// VM UUID of the node. Looked up in Kubernetes when omitted
        #[arg(long, default_value = "")]
        node_uuid: String,
    },

    /// Detach a volume from a node's VM
    Detach {
        #[arg(long)]
        id: String,

        #[arg(long)]
        node: String,

        #[arg(long, default_value = "")]
        node_uuid: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    /// Poll a task until it finishes or polling gives up
    Wait {
        /// Virtual center host that owns the task
        #[arg(long)]
        host: String,

        #[arg(long)]
        id: String,
    },
}

/// Split a `NAME[=UUID]` argument.
pub fn parse_node(arg: &str) -> (&str, &str) {
    match arg.split_once('=') {
        Some((name, uuid)) => (name.trim(), uuid.trim()),
        None => (arg.trim(), ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_arguments() {
        assert_eq!(parse_node("worker-1=abc"), ("worker-1", "abc"));
        assert_eq!(parse_node("worker-1"), ("worker-1", ""));
        assert_eq!(parse_node(" worker-1 = abc "), ("worker-1", "abc"));
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "ics-csi-driver",
            "resolve",
            "--uuid",
            "abc",
            "--log-format",
            "json",
            "--insecure",
        ]);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(cli.insecure);
        assert!(matches!(cli.command, Command::Resolve(ResolveArgs { ref uuid, .. }) if uuid == "abc"));
    }

    #[test]
    fn nodes_list_requires_a_node() {
        assert!(Cli::try_parse_from(["ics-csi-driver", "nodes", "list"]).is_err());
    }
}

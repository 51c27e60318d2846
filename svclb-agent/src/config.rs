use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about = "Socket level load balancing for service addresses", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Load the connect4 program and keep the service maps in sync
    Agent(AgentArgs),

    /// List the services programmed in the pinned maps
    List(MapArgs),

    /// Resolve a destination against the pinned maps the way connect4 would
    Translate(TranslateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct MapArgs {
    /// Path to the bpf fs for bpf maps
    #[arg(long, env = "SVCLB_BPF_FS", default_value = "/sys/fs/bpf")]
    pub bpf_fs: PathBuf,

    /// Directory under the bpf fs the maps are pinned in
    #[arg(long, env = "SVCLB_PIN_DIR", default_value = "svclb")]
    pub pin_dir: String,
}

impl MapArgs {
    pub fn pin_path(&self) -> PathBuf {
        self.bpf_fs.join(&self.pin_dir)
    }
}

#[derive(Args, Debug, Clone)]
pub struct AgentArgs {
    #[command(flatten)]
    pub maps: MapArgs,

    /// Compiled connect4 object
    #[arg(
        long,
        env = "SVCLB_BPF_OBJECT",
        default_value = "/usr/lib/svclb/svclb.bpf.o"
    )]
    pub bpf_object: PathBuf,

    /// Path to the cgroup fs
    #[arg(long, env = "SVCLB_CGROUP_FS", default_value = "/sys/fs/cgroup")]
    pub cgroup_fs: PathBuf,

    /// Services and their endpoints to program
    #[arg(
        long,
        env = "SVCLB_SERVICES_FILE",
        default_value = "/etc/svclb/services.yaml"
    )]
    pub services_file: PathBuf,

    /// Seconds between two syncs of the services file
    #[arg(long, env = "SVCLB_SYNC_INTERVAL", default_value_t = 10)]
    pub sync_interval: u64,

    /// Metrics listener for agent
    #[arg(long, env = "SVCLB_METRICS_ADDRESS", default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct TranslateArgs {
    #[command(flatten)]
    pub maps: MapArgs,

    /// Destination address of the connect
    #[arg(long)]
    pub address: Ipv4Addr,

    /// Destination port of the connect
    #[arg(long)]
    pub port: u16,

    /// TCP, UDP or SCTP
    #[arg(long, default_value = "TCP")]
    pub protocol: String,
}

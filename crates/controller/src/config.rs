use clap::Parser;
use clap::Subcommand;

use crate::channel::ChannelMode;

#[derive(Parser)]
#[command(name = "controller", about = "GPU compute-unit and power-budget controller")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the controller daemon
    Daemon(DaemonArgs),
    /// Build and send one control command
    Send(SendArgs),
    /// Attach to the shared resource table and print its contents
    ShowTable(ShowTableArgs),
}

/// Control-channel settings shared by the daemon and the client. The
/// addressing mode is a deployment choice; both sides must be started with
/// the same one.
#[derive(Parser, Clone)]
pub struct ChannelArgs {
    #[arg(
        long,
        env = "CONTROL_ENDPOINT",
        default_value = "127.0.0.1:9090",
        help = "Control channel endpoint, host:port"
    )]
    pub endpoint: String,

    #[arg(
        long,
        env = "CONTROL_APP_NAME",
        default_value = "gpu-controller",
        help = "Application name used as the topic filter in subscribe mode"
    )]
    pub app_name: String,

    #[arg(
        long,
        env = "CONTROL_MODE",
        value_enum,
        default_value_t = ChannelMode::Subscribe,
        help = "Channel addressing mode"
    )]
    pub mode: ChannelMode,
}

#[derive(Parser)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub channel: ChannelArgs,

    #[arg(
        long,
        env = "CU_TABLE_NAME",
        default_value = "gpu_cu_table",
        help = "Name of the shared resource table region"
    )]
    pub table_name: String,

    #[arg(
        long,
        default_value = "50",
        help = "Poll timeout in milliseconds for the control loop"
    )]
    pub poll_interval_ms: u64,

    #[arg(
        long,
        help = "Run the poll loop on the calling thread instead of a worker",
        default_value_t = false
    )]
    pub inline: bool,
}

#[derive(Parser)]
pub struct SendArgs {
    #[command(flatten)]
    pub channel: ChannelArgs,

    #[command(subcommand)]
    pub command: SendCommand,
}

#[derive(Subcommand)]
pub enum SendCommand {
    /// Cap a GPU's power draw, in watts
    SetPowerCap {
        #[arg(long)]
        gpu: u32,
        #[arg(long)]
        watts: u32,
    },
    /// Restore the device default power cap
    ResetPowerCap {
        #[arg(long)]
        gpu: u32,
    },
    /// Publish a compute-unit mask, as two 8-character hex words
    SetCuMask {
        #[arg(long)]
        gpu: u32,
        word0: String,
        word1: String,
    },
    /// Restore the all-units-enabled mask
    ResetCuMask {
        #[arg(long)]
        gpu: u32,
    },
}

#[derive(Parser)]
pub struct ShowTableArgs {
    #[arg(
        long,
        env = "CU_TABLE_NAME",
        default_value = "gpu_cu_table",
        help = "Name of the shared resource table region"
    )]
    pub table_name: String,
}

//! fusegridd: the FuseGrid daemon.
//!
//! Single binary that assembles the control plane:
//! - Platform driver (Nuclio via nuctl, or in-memory)
//! - Fuser + group mapper, recovered from the platform at startup
//! - Optimizer loop, when a strategy is configured
//! - REST API
//!
//! # Usage
//!
//! ```text
//! fusegridd serve --config fusegrid.toml --listen 0.0.0.0:8000
//! ```

mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use fuse_core::PlatformKind;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,fusegrid=debug,fusegridd=debug";

#[derive(Parser)]
#[command(name = "fusegridd", about = "FuseGrid control plane daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane: API, mapper and optimizer.
    Serve {
        /// Path to fusegrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address for the REST API, overriding the config file.
        #[arg(long)]
        listen: Option<String>,

        /// Platform driver, overriding the config file.
        #[arg(long, value_enum)]
        platform: Option<PlatformArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PlatformArg {
    Nuctl,
    Memory,
}

impl From<PlatformArg> for PlatformKind {
    fn from(arg: PlatformArg) -> Self {
        match arg {
            PlatformArg::Nuctl => PlatformKind::Nuctl,
            PlatformArg::Memory => PlatformKind::Memory,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            listen,
            platform,
        } => {
            let mut config = fuse_core::FusionConfig::load(config.as_deref())?;
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(platform) = platform {
                config.platform.kind = platform.into();
            }
            serve::run(config).await
        }
    }
}

//! Mount a directory pair as one filesystem: served from the fast tier, mirrored to the slow tier.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, error};

mod app_config;
mod daemon;
mod fuse_check;
mod trc;

use crate::app_config::Config;
use crate::daemon::MountSpec;
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "A dual-tier filesystem: a fast directory in front, a slow directory behind."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        env = "HYCACHE_CONFIG",
        help = "Optional path to a hycache config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the filesystem in the foreground until interrupted.
    Mount {
        /// Where the unified namespace appears.
        mount_point: PathBuf,

        /// Existing directory on fast storage. Every call is served from here.
        fast_tier_path: PathBuf,

        /// Existing directory on slow storage. Structural changes are mirrored here.
        slow_tier_path: PathBuf,

        /// Allow other users to access the mount. Overrides the configuration file.
        #[arg(long)]
        allow_other: bool,
    },
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let mut config = Config::load(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    Trc::default().init().unwrap_or_else(|e| {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    });

    match args.command {
        Command::Mount {
            mount_point,
            fast_tier_path,
            slow_tier_path,
            allow_other,
        } => {
            if let Err(e) = fuse_check::ensure_fuse() {
                error!("{e}");
                std::process::exit(1);
            }

            config.allow_other |= allow_other;
            debug!(config = ?config, "Mounting with configuration...");

            let spec = MountSpec {
                mount_point,
                fast_tier: fast_tier_path,
                slow_tier: slow_tier_path,
            };
            if let Err(e) = daemon::spawn(config, spec) {
                error!("hycache failed: {e}");
                std::process::exit(1);
            }
        }
    }
}

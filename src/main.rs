//! portsync - firewall port reconciliation
//!
//! Keeps the host's iptables chain and the OCI security list in front of
//! it in step with the ports the host actually serves.
//!
//! # Usage
//!
//! ```bash
//! portsync sync --security-list ocid1.securitylist.oc1..xyz   # One cycle, confirm each store
//! portsync sync --yes                  # Unattended, list id from the config file
//! portsync sync --dry-run              # Show what would change
//! portsync status                      # Coverage per store and the last recorded run
//! portsync dedupe                      # Remove duplicate rules (always asks)
//! portsync daemon --interval 600       # Foreground scheduler
//! portsync install-daemon              # systemd timer running `sync --yes`
//! portsync uninstall-daemon
//! ```
//!
//! # Exit codes
//!
//! `0` success, `1` discovery or configuration failure, `2` a store failed,
//! `3` confirmation declined, `4` another cycle is running.

use clap::{Parser, Subcommand};
use portsync::config::{self, Config};
use portsync::core::confirm::{AutoConfirm, Confirm, TerminalConfirm};
use portsync::core::dedupe::dedupe_stores;
use portsync::core::error::IptablesErrorPattern;
use portsync::core::lock::RunLock;
use portsync::core::reconcile::{CycleOptions, CycleReport, ExitStatus, Reconciler};
use portsync::core::runner::SystemRunner;
use portsync::core::schedule::{install_daemon, run_daemon, uninstall_daemon, watch_shutdown};
use portsync::run_log::{RunKind, RunLog, RunRecord};
use portsync::utils::{ensure_state_dir, get_state_dir};
use portsync::{Error, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::watch;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "portsync")]
#[command(version = build::CLAP_LONG_VERSION)]
#[command(about = "Keep iptables and the OCI security list in step with the ports this host serves", long_about = None)]
struct Cli {
    /// Configuration file (default: <XDG config dir>/portsync/config.json)
    #[arg(long, global = true, env = "PORTSYNC_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug logging (PORTSYNC_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation cycle
    Sync {
        /// Security list OCID (overrides the configuration)
        #[arg(long, value_name = "OCID")]
        security_list: Option<String>,
        /// Apply without asking
        #[arg(short, long)]
        yes: bool,
        /// Show proposed changes without applying them
        #[arg(long)]
        dry_run: bool,
    },
    /// Show discovered ports and their coverage in each store, without changing anything
    Status {
        /// Security list OCID (overrides the configuration)
        #[arg(long, value_name = "OCID")]
        security_list: Option<String>,
    },
    /// Remove duplicate rules from both stores (always asks first)
    Dedupe {
        /// Security list OCID (overrides the configuration)
        #[arg(long, value_name = "OCID")]
        security_list: Option<String>,
    },
    /// Run cycles periodically in the foreground
    Daemon {
        /// Seconds between cycles (default from configuration)
        #[arg(long, value_name = "SECONDS")]
        interval: Option<u64>,
    },
    /// Install and enable a systemd timer that runs `sync --yes`
    InstallDaemon {
        /// Seconds between cycles (default from configuration)
        #[arg(long, value_name = "SECONDS")]
        interval: Option<u64>,
    },
    /// Disable the systemd timer and remove its units
    UninstallDaemon,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env("PORTSYNC_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start the async runtime: {e}");
            return ExitCode::from(ExitStatus::DiscoveryFailed.code());
        }
    };

    let status = match runtime.block_on(handle_cli(cli)) {
        Ok(status) => status,
        Err(e) => {
            print_error(&e);
            ExitStatus::for_error(&e)
        }
    };
    ExitCode::from(status.code())
}

fn print_error(e: &Error) {
    eprintln!("Error: {e}");
    if let Error::Command {
        program,
        stderr: Some(stderr),
        ..
    } = e
        && program.starts_with("iptables")
    {
        for suggestion in IptablesErrorPattern::match_error(stderr).suggestions {
            eprintln!("  hint: {suggestion}");
        }
    }
}

/// Validates a `--security-list` flag before anything runs
fn cycle_options(security_list: Option<String>, dry_run: bool) -> Result<CycleOptions> {
    if let Some(id) = &security_list {
        portsync::validators::validate_security_list_id(id)
            .map_err(|e| Error::config("--security-list", e))?;
    }
    Ok(CycleOptions {
        security_list_id: security_list,
        dry_run,
    })
}

fn with_interval(mut config: Config, interval: Option<u64>) -> Result<Config> {
    if let Some(secs) = interval {
        config.interval_secs = secs;
        config.validate()?;
    }
    Ok(config)
}

fn runner(config: &Config) -> SystemRunner {
    SystemRunner::new(config.command_timeout(), config.oci_cli.clone())
}

async fn run_cycle<C: Confirm>(
    runner: &SystemRunner,
    confirm: &C,
    config: &Config,
    options: CycleOptions,
    shutdown: watch::Receiver<bool>,
) -> CycleReport {
    Reconciler::new(runner, confirm, config, options, shutdown)
        .run_cycle()
        .await
}

async fn handle_cli(cli: Cli) -> Result<ExitStatus> {
    let config = config::load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Sync {
            security_list,
            yes,
            dry_run,
        } => {
            let options = cycle_options(security_list, dry_run)?;
            let state_dir = ensure_state_dir()?;
            let _lock = RunLock::acquire(&state_dir)?;
            let runner = runner(&config);
            let shutdown = watch_shutdown();

            let report = if yes || dry_run {
                run_cycle(&runner, &AutoConfirm, &config, options, shutdown).await
            } else {
                run_cycle(&runner, &TerminalConfirm, &config, options, shutdown).await
            };
            print!("{report}");
            if !dry_run {
                RunLog::new(&state_dir)
                    .record(&RunRecord::from_cycle(&report, RunKind::Sync))
                    .await;
            }
            Ok(report.exit_status())
        }
        Commands::Status { security_list } => {
            let options = cycle_options(security_list, true)?;
            let runner = runner(&config);
            let report = run_cycle(&runner, &AutoConfirm, &config, options, watch_shutdown()).await;
            print!("{report}");

            let log = RunLog::new(&get_state_dir());
            match log.latest().await {
                Ok(Some(record)) => println!("Last run: {}", record.summary()),
                Ok(None) => println!("Last run: none recorded"),
                Err(e) => tracing::warn!("Cannot read run log {}: {e}", log.path().display()),
            }
            Ok(report.exit_status())
        }
        Commands::Dedupe { security_list } => {
            let options = cycle_options(security_list, false)?;
            let state_dir = ensure_state_dir()?;
            let _lock = RunLock::acquire(&state_dir)?;
            let runner = runner(&config);

            let run = dedupe_stores(
                &runner,
                &TerminalConfirm,
                &config,
                options.security_list_id.as_deref(),
            )
            .await;
            let stores = run.stores();
            for (store, outcome) in &stores {
                match outcome {
                    Ok(report) if report.declined => {
                        println!("{store}: {} duplicate(s) found, declined", report.found);
                    }
                    Ok(report) => {
                        println!(
                            "{store}: {} duplicate(s) found, {} removed",
                            report.found, report.removed
                        );
                        for failure in &report.failed {
                            println!("  failed {failure}");
                        }
                    }
                    Err(e) => println!("{store}: failed: {e}"),
                }
            }

            let status = run.exit_status();
            RunLog::new(&state_dir)
                .record(&RunRecord::from_dedupe(&stores, status.code()))
                .await;
            Ok(status)
        }
        Commands::Daemon { interval } => {
            let config = with_interval(config, interval)?;
            let state_dir = ensure_state_dir()?;
            let runner = runner(&config);
            run_daemon(
                &runner,
                &config,
                config.interval(),
                &state_dir,
                watch_shutdown(),
            )
            .await;
            Ok(ExitStatus::Success)
        }
        Commands::InstallDaemon { interval } => {
            let config = with_interval(config, interval)?;
            let exe = std::env::current_exe()?;
            // The unit runs from /, so a relative --config must be made absolute
            let config_path = cli.config.as_deref().map(std::path::absolute).transpose()?;
            let runner = runner(&config);
            install_daemon(
                &runner,
                &exe,
                config_path.as_deref(),
                config.interval(),
                config.retries,
            )
            .await?;
            println!("Installed portsync.timer (every {}s)", config.interval_secs);
            Ok(ExitStatus::Success)
        }
        Commands::UninstallDaemon => {
            uninstall_daemon(&runner(&config), config.retries).await?;
            println!("Removed portsync.timer");
            Ok(ExitStatus::Success)
        }
    }
}

//! Periodic scheduling
//!
//! Two ways to run cycles on an interval:
//!
//! - `portsync daemon`: a foreground loop ([`run_daemon`]) for service
//!   managers that supervise long-running processes
//! - `portsync install-daemon`: a systemd timer that starts a one-shot
//!   `portsync sync --yes` ([`install_daemon`])
//!
//! Either way cycles never overlap: each one holds the run lock, and a tick
//! that finds the lock taken is skipped.

use crate::config::Config;
use crate::core::confirm::AutoConfirm;
use crate::core::error::{Error, Result};
use crate::core::lock::RunLock;
use crate::core::reconcile::{CycleOptions, Reconciler};
use crate::core::runner::{CommandRunner, Invocation, Program, run_with_retry};
use crate::elevation::PrivilegedProgram;
use crate::run_log::{RunKind, RunLog, RunRecord};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const SERVICE_UNIT: &str = "portsync.service";
pub const TIMER_UNIT: &str = "portsync.timer";
pub const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

/// Receiver that flips to `true` on SIGINT or SIGTERM
///
/// Must be called from within the tokio runtime.
pub fn watch_shutdown() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                info!("Shutdown requested; finishing the current step");
                let _ = tx.send(true);
            }
            Err(e) => {
                warn!("Cannot listen for shutdown signals: {e}");
                // Keep the sender alive so receivers don't read a closed channel as shutdown
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = terminate.recv() => debug!("SIGTERM received"),
        _ = interrupt.recv() => debug!("SIGINT received"),
    }
    Ok(())
}

/// Runs a cycle every `interval` until shutdown. Returns the number of
/// cycles that ran.
///
/// The first cycle starts immediately. Ticks missed while a cycle ran long
/// are skipped, not replayed.
pub async fn run_daemon<R: CommandRunner>(
    runner: &R,
    config: &Config,
    interval: Duration,
    state_dir: &Path,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let log = RunLog::new(state_dir);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycles = 0;

    info!("Scheduler started; interval {}s", interval.as_secs());
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if *shutdown.borrow() {
            break;
        }

        match RunLock::acquire(state_dir) {
            Ok(_lock) => {
                let reconciler = Reconciler::new(
                    runner,
                    &AutoConfirm,
                    config,
                    CycleOptions::default(),
                    shutdown.clone(),
                );
                let report = reconciler.run_cycle().await;
                log.record(&RunRecord::from_cycle(&report, RunKind::DaemonTick))
                    .await;
                cycles += 1;
            }
            Err(Error::Busy) => warn!("Previous cycle still running; skipping this tick"),
            Err(e) => warn!("Cannot take the run lock, skipping this tick: {e}"),
        }
    }
    info!("Scheduler stopped after {cycles} cycle(s)");
    cycles
}

fn quote_arg(arg: &str) -> String {
    if arg.contains(char::is_whitespace) || arg.contains('"') {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Contents of `portsync.service`
pub fn service_unit(exe: &Path, config_path: Option<&Path>) -> String {
    let mut command = vec![quote_arg(&exe.to_string_lossy())];
    if let Some(path) = config_path {
        command.push("--config".to_string());
        command.push(quote_arg(&path.to_string_lossy()));
    }
    command.extend(["sync".to_string(), "--yes".to_string()]);

    format!(
        "[Unit]\n\
         Description=Reconcile firewall rules with discovered ports\n\
         After=network-online.target docker.service\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         ExecStart={}\n",
        command.join(" ")
    )
}

/// Contents of `portsync.timer`
pub fn timer_unit(interval: Duration) -> String {
    format!(
        "[Unit]\n\
         Description=Run portsync periodically\n\
         \n\
         [Timer]\n\
         OnBootSec=2min\n\
         OnUnitActiveSec={}s\n\
         Unit={SERVICE_UNIT}\n\
         \n\
         [Install]\n\
         WantedBy=timers.target\n",
        interval.as_secs()
    )
}

async fn systemctl<R: CommandRunner>(runner: &R, args: &[&str], retries: u32) -> Result<()> {
    let invocation = Invocation::new(Program::Privileged(PrivilegedProgram::Systemctl), args.iter().copied());
    run_with_retry(runner, &invocation, retries, Error::is_transient).await?;
    Ok(())
}

async fn install_unit<R: CommandRunner>(runner: &R, name: &str, contents: &str, retries: u32) -> Result<PathBuf> {
    use std::io::Write;

    let mut temp = tempfile::NamedTempFile::new()?;
    temp.write_all(contents.as_bytes())?;
    temp.as_file().sync_all()?;

    let target = Path::new(SYSTEMD_UNIT_DIR).join(name);
    let source = temp.path().to_string_lossy().into_owned();
    let target_arg = target.to_string_lossy().into_owned();
    let install = Invocation::new(
        Program::Privileged(PrivilegedProgram::Install),
        ["-D", "-m", "644", source.as_str(), target_arg.as_str()],
    );
    run_with_retry(runner, &install, retries, Error::is_transient).await?;
    Ok(target)
}

/// Installs and starts the systemd timer
pub async fn install_daemon<R: CommandRunner>(
    runner: &R,
    exe: &Path,
    config_path: Option<&Path>,
    interval: Duration,
    retries: u32,
) -> Result<()> {
    let service = install_unit(runner, SERVICE_UNIT, &service_unit(exe, config_path), retries).await?;
    let timer = install_unit(runner, TIMER_UNIT, &timer_unit(interval), retries).await?;
    debug!("Installed {} and {}", service.display(), timer.display());

    systemctl(runner, &["daemon-reload"], retries).await?;
    systemctl(runner, &["enable", "--now", TIMER_UNIT], retries).await?;
    info!(
        "Enabled {TIMER_UNIT}: every {}s, first run 2 minutes after boot",
        interval.as_secs()
    );
    Ok(())
}

/// Stops the timer and removes both units. Missing units are not an error.
pub async fn uninstall_daemon<R: CommandRunner>(runner: &R, retries: u32) -> Result<()> {
    if let Err(e) = systemctl(runner, &["disable", "--now", TIMER_UNIT], retries).await {
        warn!("Could not disable {TIMER_UNIT} (continuing): {e}");
    }

    let service = Path::new(SYSTEMD_UNIT_DIR).join(SERVICE_UNIT);
    let timer = Path::new(SYSTEMD_UNIT_DIR).join(TIMER_UNIT);
    let service = service.to_string_lossy();
    let timer = timer.to_string_lossy();
    let remove = Invocation::new(
        Program::Privileged(PrivilegedProgram::Remove),
        ["-f", &*service, &*timer],
    );
    run_with_retry(runner, &remove, retries, Error::is_transient).await?;

    systemctl(runner, &["daemon-reload"], retries).await?;
    info!("Removed {SERVICE_UNIT} and {TIMER_UNIT}");
    Ok(())
}

//! Operator confirmation before any mutating call
//!
//! Interactive runs ask on the terminal; the daemon and `sync --yes` use
//! [`AutoConfirm`]. Tests script answers with their own implementations.

use crate::core::error::{Error, Result};
use std::future::Future;
use std::io::Write;
use tracing::warn;

/// Decides whether a batch of proposed changes may be applied
pub trait Confirm: Sync {
    /// `changes` are human-readable lines, one per rule.
    fn confirm(&self, store: &str, changes: &[String]) -> impl Future<Output = Result<bool>> + Send;
}

/// Approves everything (daemon mode, `--yes`)
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

impl Confirm for AutoConfirm {
    async fn confirm(&self, _store: &str, _changes: &[String]) -> Result<bool> {
        Ok(true)
    }
}

/// Asks on the controlling terminal with a single `y`/`n` key press
///
/// Without a terminal nothing can be confirmed and the answer is "no".
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    async fn confirm(&self, store: &str, changes: &[String]) -> Result<bool> {
        use std::os::fd::AsFd;

        if !nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false) {
            warn!("No terminal to confirm changes to {store}; use --yes to apply unattended");
            return Ok(false);
        }

        println!("Proposed changes to {store}:");
        for change in changes {
            println!("  + {change}");
        }
        print!("Apply {} change(s)? [y/N] ", changes.len());
        std::io::stdout().flush()?;

        let answer = tokio::task::spawn_blocking(read_yes_no)
            .await
            .map_err(|e| Error::Internal(format!("confirmation prompt failed: {e}")))??;
        println!("{}", if answer { "yes" } else { "no" });
        Ok(answer)
    }
}

fn read_yes_no() -> Result<bool> {
    use crossterm::event::{self, Event, KeyCode, KeyEventKind};

    crossterm::terminal::enable_raw_mode()?;
    let answer = loop {
        match event::read() {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => match key.code {
                KeyCode::Char('y' | 'Y') => break Ok(true),
                KeyCode::Char('n' | 'N') | KeyCode::Enter | KeyCode::Esc => break Ok(false),
                // Ctrl+C arrives as a key press while in raw mode
                KeyCode::Char('c')
                    if key.modifiers.contains(crossterm::event::KeyModifiers::CONTROL) =>
                {
                    break Ok(false);
                }
                _ => {}
            },
            Ok(_) => {}
            Err(e) => break Err(Error::Io(e)),
        }
    };
    // Always restore terminal to normal mode
    let _ = crossterm::terminal::disable_raw_mode();
    answer
}

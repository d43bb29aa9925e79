//! Core reconciliation functionality
//!
//! - [`firewall`]: port specs, rule records and the desired port set
//! - [`runner`]: external command execution with timeouts and retries
//! - [`discovery`]: container, gateway and baseline port sources
//! - [`iptables`]: the local filter store (dedicated iptables chain)
//! - [`security_list`]: the cloud store (OCI VCN security list)
//! - [`coverage`]: decides whether an existing rule already permits a port
//! - [`reconcile`]: one discover → analyze → apply cycle over both stores
//! - [`dedupe`]: duplicate rule elimination
//! - [`confirm`]: operator confirmation before mutating a store
//! - [`lock`]: the exclusive run lock
//! - [`schedule`]: periodic cycles (foreground loop and systemd timer)
//! - [`error`]: error types

pub mod confirm;
pub mod coverage;
pub mod dedupe;
pub mod discovery;
pub mod error;
pub mod firewall;
pub mod iptables;
pub mod lock;
pub mod reconcile;
pub mod runner;
pub mod schedule;
pub mod security_list;

#[cfg(test)]
pub mod test_helpers;

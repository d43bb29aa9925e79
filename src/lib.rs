//! portsync - keep firewall rules in step with the ports a host serves
//!
//! Each reconciliation cycle discovers the ports the host should expose
//! (published container ports, listeners registered with the local Caddy
//! gateway, configured baseline ports) and makes sure both rule stores
//! permit them:
//!
//! - the host packet filter, via a dedicated iptables chain
//! - the OCI VCN security list in front of the instance
//!
//! Rules are only ever added by a cycle. Removing duplicates is a separate,
//! confirmed maintenance operation.
//!
//! # Architecture
//!
//! - [`core`] - Discovery, store adapters, coverage analysis and the reconciler
//! - [`run_log`] - Last-run summary log
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration loading and validation
//! - [`elevation`] - Privilege escalation for firewall commands
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - Existing rules are never removed or rewritten by a sync
//! - Security list updates are guarded by the list's etag
//! - Every change needs confirmation unless running unattended
//! - A run lock keeps cycles from overlapping

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;
pub mod elevation;
pub mod run_log;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::firewall::{DesiredPortSet, PortSpec, Protocol, RuleRecord};
pub use core::reconcile::{CycleReport, ExitStatus, Reconciler};

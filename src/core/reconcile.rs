//! One reconciliation cycle across both rule stores
//!
//! A cycle walks `Idle → Discovering → AnalyzingLocal → ApplyingLocal →
//! AnalyzingCloud → ApplyingCloud → Reporting → Idle`. Each store is
//! synced in isolation: a failure in the local filter ends the local
//! section and the cloud store is still attempted. Only a discovery
//! failure or a shutdown request skips straight to `Reporting`.
//!
//! Every store snapshot is fetched live; nothing from a previous cycle is
//! reused.

use crate::config::Config;
use crate::core::confirm::Confirm;
use crate::core::coverage::{self, CoveragePlan};
use crate::core::discovery::{ContainerSource, Discoverer, GatewaySource, SourceReport};
use crate::core::error::{Error, Result};
use crate::core::firewall::{DesiredPortSet, PortSpec, Scope};
use crate::core::iptables::{AddOutcome, HookOutcome, LocalFilter, PersistOutcome};
use crate::core::runner::CommandRunner;
use crate::core::security_list::{CloudPlan, CloudSecurityList, OciOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const LOCAL_STORE: &str = "local filter";
pub const CLOUD_STORE: &str = "security list";

/// Step of a reconciliation cycle
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Phase {
    Idle,
    Discovering,
    AnalyzingLocal,
    ApplyingLocal,
    AnalyzingCloud,
    ApplyingCloud,
    Reporting,
}

/// Process exit status of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitStatus {
    Success,
    /// Discovery or configuration failure
    DiscoveryFailed,
    /// At least one store failed
    StoreFailed,
    Declined,
    /// Another cycle holds the run lock
    Busy,
}

impl ExitStatus {
    pub const fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::DiscoveryFailed => 1,
            Self::StoreFailed => 2,
            Self::Declined => 3,
            Self::Busy => 4,
        }
    }

    /// Exit status for an error that ended a command before any store ran
    pub fn for_error(error: &Error) -> Self {
        match error {
            Error::Busy => Self::Busy,
            Error::ConfirmationDeclined => Self::Declined,
            Error::StoreUnreachable { .. }
            | Error::InvalidRuleData { .. }
            | Error::ApplyRejected { .. }
            | Error::Command { .. }
            | Error::Timeout { .. }
            | Error::Elevation(_) => Self::StoreFailed,
            _ => Self::DiscoveryFailed,
        }
    }
}

/// How one store's section of a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StoreStatus {
    /// Everything desired was already covered
    Converged,
    Applied,
    /// Some or all changes failed
    Failed,
    Declined,
    /// Changes were computed but not applied (`--dry-run`, `status`)
    Planned,
    /// Not configured, or not started because of shutdown
    Skipped,
}

/// Per-store summary. Every port appears by name in one of the lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReport {
    pub store: &'static str,
    pub status: StoreStatus,
    pub added: Vec<String>,
    pub covered: Vec<String>,
    /// Changes that were planned but not applied (dry run, declined)
    pub pending: Vec<String>,
    /// Changes that failed, with the reason
    pub failed: Vec<String>,
    pub error: Option<String>,
    pub notes: Vec<String>,
}

impl StoreReport {
    fn new(store: &'static str) -> Self {
        Self {
            store,
            status: StoreStatus::Converged,
            added: Vec::new(),
            covered: Vec::new(),
            pending: Vec::new(),
            failed: Vec::new(),
            error: None,
            notes: Vec::new(),
        }
    }

    fn skipped(store: &'static str, reason: impl Into<String>) -> Self {
        let mut report = Self::new(store);
        report.status = StoreStatus::Skipped;
        report.notes.push(reason.into());
        report
    }

    fn fail(mut self, error: &Error) -> Self {
        error!("{}: {error}", self.store);
        self.status = StoreStatus::Failed;
        self.error = Some(error.to_string());
        self
    }

    fn decline(mut self, pending: Vec<String>) -> Self {
        let declined = Error::ConfirmationDeclined;
        info!("{}: {declined}", self.store);
        self.status = StoreStatus::Declined;
        self.pending = pending;
        self.notes.push(declined.to_string());
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == StoreStatus::Failed
    }
}

/// Outcome of one full cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub desired: Vec<PortSpec>,
    pub sources: Vec<SourceReport>,
    pub discovery_error: Option<String>,
    pub local: Option<StoreReport>,
    pub cloud: Option<StoreReport>,
    /// Fingerprint of the cloud snapshot the cycle worked from
    pub cloud_fingerprint: Option<String>,
    pub interrupted: bool,
    /// Phases entered, in order
    pub phases: Vec<Phase>,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            started_at: Utc::now(),
            desired: Vec::new(),
            sources: Vec::new(),
            discovery_error: None,
            local: None,
            cloud: None,
            cloud_fingerprint: None,
            interrupted: false,
            phases: vec![Phase::Idle],
        }
    }

    pub fn stores(&self) -> impl Iterator<Item = &StoreReport> {
        self.local.iter().chain(self.cloud.iter())
    }

    pub fn exit_status(&self) -> ExitStatus {
        if self.discovery_error.is_some() {
            ExitStatus::DiscoveryFailed
        } else if self.stores().any(StoreReport::is_failed) {
            ExitStatus::StoreFailed
        } else if self.stores().any(|s| s.status == StoreStatus::Declined) {
            ExitStatus::Declined
        } else {
            ExitStatus::Success
        }
    }

    /// Total rules added across both stores
    pub fn added(&self) -> usize {
        self.stores().map(|s| s.added.len()).sum()
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cycle {} ({})", self.cycle_id, self.started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;

        for source in &self.sources {
            match &source.skipped {
                Some(reason) => writeln!(f, "  source {}: skipped ({reason})", source.name)?,
                None => writeln!(f, "  source {}: {} port(s)", source.name, source.found)?,
            }
        }
        if let Some(e) = &self.discovery_error {
            writeln!(f, "  discovery failed: {e}")?;
        } else {
            let desired: Vec<String> = self.desired.iter().map(ToString::to_string).collect();
            writeln!(f, "  desired: {}", desired.join(", "))?;
        }

        for store in self.stores() {
            writeln!(f, "{}: {}", store.store, store.status)?;
            for item in &store.added {
                writeln!(f, "  added {item}")?;
            }
            for item in &store.covered {
                writeln!(f, "  already covered {item}")?;
            }
            for item in &store.pending {
                writeln!(f, "  not applied {item}")?;
            }
            for item in &store.failed {
                writeln!(f, "  failed {item}")?;
            }
            if let Some(e) = &store.error {
                writeln!(f, "  error: {e}")?;
            }
            for note in &store.notes {
                writeln!(f, "  note: {note}")?;
            }
        }
        if self.interrupted {
            writeln!(f, "Interrupted by shutdown request; remaining steps were not started")?;
        }
        Ok(())
    }
}

/// Switches that change what a cycle is allowed to do
#[derive(Debug, Clone, Default)]
pub struct CycleOptions {
    /// Target list; overrides the configured one
    pub security_list_id: Option<String>,
    /// Compute changes but apply nothing
    pub dry_run: bool,
}

/// Runs reconciliation cycles against the configured stores
pub struct Reconciler<'a, R, C> {
    runner: &'a R,
    confirm: &'a C,
    config: &'a Config,
    options: CycleOptions,
    shutdown: watch::Receiver<bool>,
}

fn local_item(spec: &PortSpec) -> String {
    spec.to_string()
}

fn cloud_item(scope: Scope, spec: &PortSpec) -> String {
    format!("{scope} {spec}")
}

impl<'a, R: CommandRunner, C: Confirm> Reconciler<'a, R, C> {
    pub fn new(
        runner: &'a R,
        confirm: &'a C,
        config: &'a Config,
        options: CycleOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            runner,
            confirm,
            config,
            options,
            shutdown,
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn security_list_id(&self) -> Option<&str> {
        self.options
            .security_list_id
            .as_deref()
            .or(self.config.security_list_id.as_deref())
    }

    fn enter(&self, report: &mut CycleReport, phase: Phase) {
        debug!("Cycle {}: {phase}", report.cycle_id);
        report.phases.push(phase);
    }

    fn discoverer(&self) -> Result<Discoverer<'a, R>> {
        let containers = self
            .config
            .discover_containers
            .then(|| ContainerSource::new(self.runner, self.config.retries));
        let gateway = self
            .config
            .gateway_endpoint
            .as_deref()
            .map(|endpoint| GatewaySource::new(endpoint, self.config.http_timeout()))
            .transpose()?;
        Ok(Discoverer::new(containers, gateway, self.config.baseline_ports.clone()))
    }

    fn local_filter(&self) -> Result<LocalFilter<'a, R>> {
        LocalFilter::new(
            self.runner,
            &self.config.chain,
            &self.config.parent_chain,
            self.config.retries,
            self.config.persist_path.clone(),
        )
    }

    /// Runs one full cycle. Never returns early without a report.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::new();
        info!(
            "Starting reconciliation cycle {}{}",
            report.cycle_id,
            if self.options.dry_run { " (dry run)" } else { "" }
        );

        self.enter(&mut report, Phase::Discovering);
        let discovery = match self.discoverer() {
            Ok(discoverer) => discoverer.discover().await,
            Err(e) => Err(e),
        };
        let desired = match discovery {
            Ok(discovery) => {
                report.sources = discovery.sources;
                discovery.desired
            }
            Err(e) => {
                error!("Discovery failed: {e}");
                report.discovery_error = Some(e.to_string());
                self.finish(&mut report);
                return report;
            }
        };
        report.desired = desired.iter().copied().collect();

        if self.shutdown_requested() {
            report.interrupted = true;
        } else {
            report.local = Some(self.sync_local(&desired, &mut report).await);
        }

        if report.interrupted || self.shutdown_requested() {
            report.interrupted = true;
        } else if let Some(list_id) = self.security_list_id() {
            report.cloud = Some(self.sync_cloud(list_id, &desired, &mut report).await);
        } else {
            debug!("No security list configured; cloud store skipped");
            report.cloud = Some(StoreReport::skipped(CLOUD_STORE, "no security list configured"));
        }

        self.finish(&mut report);
        report
    }

    fn finish(&self, report: &mut CycleReport) {
        self.enter(report, Phase::Reporting);
        let status = report.exit_status();
        if status == ExitStatus::Success {
            info!(
                "Cycle {} finished: {} rule(s) added",
                report.cycle_id,
                report.added()
            );
        } else {
            warn!("Cycle {} finished with {status:?}", report.cycle_id);
        }
        report.phases.push(Phase::Idle);
    }

    async fn sync_local(&self, desired: &DesiredPortSet, cycle: &mut CycleReport) -> StoreReport {
        self.enter(cycle, Phase::AnalyzingLocal);
        let mut report = StoreReport::new(LOCAL_STORE);
        let filter = match self.local_filter() {
            Ok(filter) => filter,
            Err(e) => return report.fail(&e),
        };

        let mut listing = match filter.list_rules().await {
            Ok(listing) => listing,
            Err(e) => return report.fail(&e),
        };
        let plan: CoveragePlan = coverage::plan(desired, &listing.rules(), Scope::Ingress);
        report.covered = plan.covered.iter().map(|c| local_item(&c.spec)).collect();

        let hooked = match filter.is_hooked().await {
            Ok(hooked) => hooked,
            Err(e) => return report.fail(&e),
        };

        let mut changes: Vec<String> = plan
            .missing
            .iter()
            .map(|spec| format!("{} accept {spec}", filter.chain()))
            .collect();
        if !hooked {
            changes.push(format!(
                "jump from {} to {}",
                self.config.parent_chain,
                filter.chain()
            ));
        }
        if changes.is_empty() {
            info!("{LOCAL_STORE}: all {} desired port(s) covered", desired.len());
            return report;
        }

        let pending: Vec<String> = plan.missing.iter().map(local_item).collect();
        if self.options.dry_run {
            report.status = StoreStatus::Planned;
            report.pending = pending;
            if !hooked {
                report
                    .notes
                    .push(format!("{} is not hooked from {}", filter.chain(), self.config.parent_chain));
            }
            return report;
        }
        match self.confirm.confirm(LOCAL_STORE, &changes).await {
            Ok(true) => {}
            Ok(false) => return report.decline(pending),
            Err(e) => return report.fail(&e),
        }
        if self.shutdown_requested() {
            cycle.interrupted = true;
            report.status = StoreStatus::Skipped;
            report.pending = pending;
            return report;
        }

        // Apply: runs to completion once started
        self.enter(cycle, Phase::ApplyingLocal);
        let hook_changed = match filter.ensure_hooked(&mut listing).await {
            Ok(outcome) => {
                debug!("{LOCAL_STORE}: {outcome:?}");
                outcome != HookOutcome::AlreadyHooked
            }
            Err(e) => {
                // Rules in an unhooked chain would have no effect
                report.pending = pending;
                return report.fail(&e);
            }
        };
        if hook_changed {
            report.notes.push(format!(
                "hooked {} from {}",
                filter.chain(),
                self.config.parent_chain
            ));
        }

        for spec in &plan.missing {
            match filter.add_rule(*spec, &mut listing).await {
                Ok(AddOutcome::Added) => report.added.push(local_item(spec)),
                Ok(AddOutcome::AlreadyPresent) => report.covered.push(local_item(spec)),
                Err(e) => {
                    warn!("{LOCAL_STORE}: could not add {spec}: {e}");
                    report.failed.push(format!("{spec}: {e}"));
                }
            }
        }

        // A new jump alone must survive a reload too
        if self.config.persist && (hook_changed || !report.added.is_empty()) {
            match filter.persist().await {
                PersistOutcome::Saved(how) => debug!("{LOCAL_STORE}: persisted via {how}"),
                PersistOutcome::Failed(e) => {
                    report.notes.push(format!("rules not persisted: {e}"));
                }
            }
        }

        report.status = if report.failed.is_empty() {
            StoreStatus::Applied
        } else {
            StoreStatus::Failed
        };
        report
    }

    async fn sync_cloud(
        &self,
        list_id: &str,
        desired: &DesiredPortSet,
        cycle: &mut CycleReport,
    ) -> StoreReport {
        self.enter(cycle, Phase::AnalyzingCloud);
        let mut report = StoreReport::new(CLOUD_STORE);

        let options = OciOptions {
            profile: self.config.oci_profile.clone(),
            auth: self.config.oci_auth.clone(),
        };
        let list = match CloudSecurityList::new(self.runner, list_id, self.config.retries, options) {
            Ok(list) => list,
            Err(e) => return report.fail(&e),
        };
        let snapshot = match list.fetch_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => return report.fail(&e),
        };
        cycle.cloud_fingerprint = Some(snapshot.fingerprint.clone());

        let plan = CloudPlan::analyze(desired, &snapshot, self.config.sync_egress);
        let additions = plan.additions();
        report.covered = covered_items(&plan);
        let pending: Vec<String> = pending_items(&plan);

        if additions.is_empty() {
            info!("{CLOUD_STORE}: all desired ports covered in {list_id}");
            return report;
        }
        if self.options.dry_run {
            report.status = StoreStatus::Planned;
            report.pending = pending;
            return report;
        }

        let changes: Vec<String> = additions.iter().map(|r| r.describe()).collect();
        match self.confirm.confirm(list_id, &changes).await {
            Ok(true) => {}
            Ok(false) => return report.decline(pending),
            Err(e) => return report.fail(&e),
        }
        if self.shutdown_requested() {
            cycle.interrupted = true;
            report.status = StoreStatus::Skipped;
            report.pending = pending;
            return report;
        }

        self.enter(cycle, Phase::ApplyingCloud);
        match list.apply_update(&snapshot, &additions).await {
            Ok(outcome) => {
                info!(
                    "{CLOUD_STORE}: added {} rule(s); {} ingress, {} egress in total",
                    outcome.added, outcome.ingress_total, outcome.egress_total
                );
                report.added = pending;
                report.status = StoreStatus::Applied;
                report
            }
            Err(e) => {
                // A single update call: nothing was applied
                report.failed = pending.iter().map(|item| format!("{item}: {e}")).collect();
                report.fail(&e)
            }
        }
    }
}

fn covered_items(plan: &CloudPlan) -> Vec<String> {
    let ingress = plan
        .ingress
        .covered
        .iter()
        .map(|c| cloud_item(Scope::Ingress, &c.spec));
    let egress = plan
        .egress
        .iter()
        .flat_map(|p| &p.covered)
        .map(|c| cloud_item(Scope::Egress, &c.spec));
    ingress.chain(egress).collect()
}

fn pending_items(plan: &CloudPlan) -> Vec<String> {
    let ingress = plan
        .ingress
        .missing
        .iter()
        .map(|spec| cloud_item(Scope::Ingress, spec));
    let egress = plan
        .egress
        .iter()
        .flat_map(|p| &p.missing)
        .map(|spec| cloud_item(Scope::Egress, spec));
    ingress.chain(egress).collect()
}

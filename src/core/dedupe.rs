//! Duplicate elimination (maintenance, never part of a sync cycle)
//!
//! Duplicates are found structurally, so two rules that differ only in
//! comment, description or textual layout are still duplicates. The first
//! rule of each group is kept. Nothing is removed without confirmation.

use crate::core::confirm::Confirm;
use crate::core::error::{Error, Result};
use crate::core::firewall::{Endpoint, PortRange, RawRule, RuleProtocol, RuleRecord};
use crate::core::iptables::{ChainListing, LocalFilter, PersistOutcome};
use crate::core::runner::CommandRunner;
use crate::config::Config;
use crate::core::reconcile::{CLOUD_STORE, ExitStatus, LOCAL_STORE};
use crate::core::security_list::{CloudSecurityList, OciOptions, Snapshot};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{info, warn};

#[derive(Debug, PartialEq, Eq, Hash)]
struct LocalKey {
    protocol: RuleProtocol,
    ports: Option<PortRange>,
    endpoint: Endpoint,
    source_ports: Option<PortRange>,
}

/// Chain rules whose (protocol, port, source) repeats an earlier rule.
///
/// Multiport rules are never removed: a single line covers several ports
/// and deleting it would drop the others.
pub fn local_duplicates(listing: &ChainListing) -> Vec<RuleRecord> {
    let mut seen = HashSet::new();
    listing
        .entries
        .iter()
        .filter_map(|entry| match entry.records.as_slice() {
            [record] => Some(record),
            _ => None,
        })
        .filter(|record| {
            !seen.insert(LocalKey {
                protocol: record.protocol.clone(),
                ports: record.ports,
                endpoint: record.endpoint.clone(),
                source_ports: record.source_ports,
            })
        })
        .cloned()
        .collect()
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct CloudKey {
    protocol: RuleProtocol,
    endpoint: Endpoint,
    stateless: bool,
    ports: Option<PortRange>,
    source_ports: Option<PortRange>,
    /// ICMP type/code; two ICMP rules for different types are distinct
    icmp: Option<String>,
}

fn cloud_key(record: &RuleRecord) -> CloudKey {
    let icmp = match &record.raw {
        RawRule::Cloud { json } => json
            .get("icmp-options")
            .filter(|v| !v.is_null())
            .map(Value::to_string),
        _ => None,
    };
    CloudKey {
        protocol: record.protocol.clone(),
        endpoint: record.endpoint.clone(),
        stateless: record.stateless,
        ports: record.ports,
        source_ports: record.source_ports,
        icmp,
    }
}

/// One direction of a security list after structural deduplication
#[derive(Debug, Clone, Default)]
pub struct CloudDedupe {
    pub keep: Vec<Value>,
    pub remove: Vec<RuleRecord>,
}

/// Splits rules into the unique set (original order) and the duplicates.
pub fn cloud_duplicates(rules: &[RuleRecord]) -> Result<CloudDedupe> {
    let mut seen = HashSet::new();
    let mut out = CloudDedupe::default();
    for record in rules {
        let RawRule::Cloud { json } = &record.raw else {
            return Err(Error::Internal(
                "security list rule without JSON".to_string(),
            ));
        };
        if seen.insert(cloud_key(record)) {
            out.keep.push(json.clone());
        } else {
            out.remove.push(record.clone());
        }
    }
    Ok(out)
}

/// Outcome of one store's dedupe pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupeReport {
    pub found: usize,
    pub removed: usize,
    /// Rules that could not be removed, with the reason
    pub failed: Vec<String>,
    pub declined: bool,
}

/// Removes local duplicates one by one; a failed removal doesn't stop the rest.
pub async fn dedupe_local<R: CommandRunner, C: Confirm>(
    filter: &LocalFilter<'_, R>,
    confirm: &C,
    persist: bool,
) -> Result<DedupeReport> {
    let listing = filter.list_rules().await?;
    let duplicates = local_duplicates(&listing);
    let mut report = DedupeReport {
        found: duplicates.len(),
        ..DedupeReport::default()
    };
    if duplicates.is_empty() {
        info!("No duplicate rules in {}", filter.chain());
        return Ok(report);
    }

    let changes: Vec<String> = duplicates
        .iter()
        .map(|r| format!("remove duplicate {}", r.describe()))
        .collect();
    if !confirm.confirm(filter.chain(), &changes).await? {
        report.declined = true;
        return Ok(report);
    }

    for rule in &duplicates {
        match filter.remove_rule(rule).await {
            Ok(()) => report.removed += 1,
            Err(e) => {
                warn!("Could not remove {}: {e}", rule.describe());
                report.failed.push(format!("{}: {e}", rule.describe()));
            }
        }
    }

    if persist
        && report.removed > 0
        && let PersistOutcome::Failed(e) = filter.persist().await
    {
        warn!("Removed duplicates are not persisted: {e}");
    }
    Ok(report)
}

/// Rewrites the security list without its duplicates in a single replace.
pub async fn dedupe_cloud<R: CommandRunner, C: Confirm>(
    list: &CloudSecurityList<'_, R>,
    confirm: &C,
) -> Result<DedupeReport> {
    let snapshot: Snapshot = list.fetch_snapshot().await?;
    let ingress = cloud_duplicates(&snapshot.ingress)?;
    let egress = cloud_duplicates(&snapshot.egress)?;

    let duplicates: Vec<&RuleRecord> = ingress.remove.iter().chain(&egress.remove).collect();
    let mut report = DedupeReport {
        found: duplicates.len(),
        ..DedupeReport::default()
    };
    if duplicates.is_empty() {
        info!("No duplicate rules in security list {}", list.list_id());
        return Ok(report);
    }

    let changes: Vec<String> = duplicates
        .iter()
        .map(|r| format!("remove duplicate {}", r.describe()))
        .collect();
    if !confirm.confirm(list.list_id(), &changes).await? {
        report.declined = true;
        return Ok(report);
    }

    list.replace(&snapshot, &ingress.keep, &egress.keep).await?;
    report.removed = duplicates.len();
    info!(
        "Removed {} duplicate rule(s) from security list {}",
        report.removed,
        list.list_id()
    );
    Ok(report)
}

/// Outcome of a dedupe pass over both stores
#[derive(Debug, Clone)]
pub struct DedupeRun {
    pub local: std::result::Result<DedupeReport, String>,
    /// `None` when no security list is configured
    pub cloud: Option<std::result::Result<DedupeReport, String>>,
}

impl DedupeRun {
    pub fn stores(&self) -> Vec<(&'static str, std::result::Result<DedupeReport, String>)> {
        let mut stores = vec![(LOCAL_STORE, self.local.clone())];
        if let Some(cloud) = &self.cloud {
            stores.push((CLOUD_STORE, cloud.clone()));
        }
        stores
    }

    pub fn exit_status(&self) -> ExitStatus {
        let results: Vec<_> = std::iter::once(&self.local).chain(self.cloud.iter()).collect();
        if results
            .iter()
            .any(|r| match r {
                Ok(report) => !report.failed.is_empty(),
                Err(_) => true,
            })
        {
            ExitStatus::StoreFailed
        } else if results
            .iter()
            .any(|r| r.as_ref().is_ok_and(|report| report.declined))
        {
            ExitStatus::Declined
        } else {
            ExitStatus::Success
        }
    }
}

/// Deduplicates the local chain, then the security list. A failure in one
/// store does not stop the other.
pub async fn dedupe_stores<R: CommandRunner, C: Confirm>(
    runner: &R,
    confirm: &C,
    config: &Config,
    security_list_id: Option<&str>,
) -> DedupeRun {
    let local = match LocalFilter::new(
        runner,
        &config.chain,
        &config.parent_chain,
        config.retries,
        config.persist_path.clone(),
    ) {
        Ok(filter) => dedupe_local(&filter, confirm, config.persist).await,
        Err(e) => Err(e),
    };

    let cloud = match security_list_id.or(config.security_list_id.as_deref()) {
        Some(id) => {
            let options = OciOptions {
                profile: config.oci_profile.clone(),
                auth: config.oci_auth.clone(),
            };
            let result = match CloudSecurityList::new(runner, id, config.retries, options) {
                Ok(list) => dedupe_cloud(&list, confirm).await,
                Err(e) => Err(e),
            };
            Some(result)
        }
        None => None,
    };

    let log_failure = |store: &str, result: Result<DedupeReport>| {
        result.map_err(|e| {
            warn!("{store}: dedupe failed: {e}");
            e.to_string()
        })
    };
    DedupeRun {
        local: log_failure(LOCAL_STORE, local),
        cloud: cloud.map(|r| log_failure(CLOUD_STORE, r)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::confirm::AutoConfirm;
    use crate::core::test_helpers::{FakeRunner, oci_egress, oci_ingress};
    use serde_json::json;

    const LIST: &str = "ocid1.securitylist.oc1.iad.aaaaaaaexample";

    struct Decline;

    impl Confirm for Decline {
        async fn confirm(&self, _store: &str, _changes: &[String]) -> Result<bool> {
            Ok(false)
        }
    }

    fn filter(runner: &FakeRunner) -> LocalFilter<'_, FakeRunner> {
        LocalFilter::new(runner, "PORTSYNC", "INPUT", 1, "/tmp/portsync-test-rules.v4").unwrap()
    }

    #[tokio::test]
    async fn test_local_duplicates_ignore_comments() {
        let runner = FakeRunner::new();
        runner.seed_chain(
            "PORTSYNC",
            &[
                "-p tcp -m tcp --dport 80 -m comment --comment portsync:80/tcp -j ACCEPT",
                "-p tcp -m tcp --dport 443 -j ACCEPT",
                "-p tcp --dport 80 -m comment --comment \"added by hand\" -j ACCEPT",
                "-p udp -m udp --dport 80 -j ACCEPT",
                "-s 10.0.0.0/8 -p tcp -m tcp --dport 80 -j ACCEPT",
            ],
        );
        let listing = filter(&runner).list_rules().await.unwrap();
        let duplicates = local_duplicates(&listing);
        assert_eq!(duplicates.len(), 1);
        assert_eq!(
            duplicates[0].raw,
            RawRule::Local {
                spec: listing.entries[2].spec.clone()
            }
        );
    }

    #[tokio::test]
    async fn test_multiport_lines_are_never_removed() {
        let runner = FakeRunner::new();
        runner.seed_chain(
            "PORTSYNC",
            &[
                "-p tcp -m multiport --dports 80,443 -j ACCEPT",
                "-p tcp -m tcp --dport 80 -j ACCEPT",
                "-p tcp -m tcp --dport 80 -j ACCEPT",
            ],
        );
        let listing = filter(&runner).list_rules().await.unwrap();
        let duplicates = local_duplicates(&listing);
        assert_eq!(duplicates.len(), 1);
    }

    #[tokio::test]
    async fn test_dedupe_local_removes_after_confirmation() {
        let runner = FakeRunner::new();
        runner.seed_chain(
            "PORTSYNC",
            &[
                "-p tcp -m tcp --dport 22 -j ACCEPT",
                "-p tcp -m tcp --dport 22 -m comment --comment old -j ACCEPT",
            ],
        );
        let filter = filter(&runner);

        let report = dedupe_local(&filter, &AutoConfirm, false).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(
            runner.chain_rules("PORTSYNC"),
            vec!["-p tcp -m tcp --dport 22 -j ACCEPT".to_string()]
        );
    }

    #[tokio::test]
    async fn test_dedupe_local_declined_changes_nothing() {
        let runner = FakeRunner::new();
        runner.seed_chain(
            "PORTSYNC",
            &["-p tcp --dport 22 -j ACCEPT", "-p tcp --dport 22 -j ACCEPT"],
        );
        let report = dedupe_local(&filter(&runner), &Decline, false).await.unwrap();
        assert!(report.declined);
        assert_eq!(report.found, 1);
        assert_eq!(runner.chain_rules("PORTSYNC").len(), 2);
        assert!(runner.iptables_writes().is_empty());
    }

    #[test]
    fn test_cloud_duplicates_ignore_description() {
        let mut described = oci_ingress("6", "0.0.0.0/0", Some((443, 443)));
        described["description"] = json!("https for the web tier");
        let body = json!({
            "data": {
                "ingress-security-rules": [
                    oci_ingress("6", "0.0.0.0/0", Some((443, 443))),
                    described,
                    oci_ingress("6", "0.0.0.0/0", Some((444, 444))),
                ],
                "egress-security-rules": []
            }
        });
        let snapshot = Snapshot::parse(LIST, &body.to_string()).unwrap();
        let result = cloud_duplicates(&snapshot.ingress).unwrap();
        assert_eq!(result.keep.len(), 2);
        assert_eq!(result.remove.len(), 1);
    }

    #[test]
    fn test_cloud_icmp_types_are_distinct() {
        let mut echo = oci_ingress("1", "0.0.0.0/0", None);
        echo["icmp-options"] = json!({"type": 8, "code": null});
        let mut unreachable = oci_ingress("1", "0.0.0.0/0", None);
        unreachable["icmp-options"] = json!({"type": 3, "code": 4});
        let body = json!({
            "data": {"ingress-security-rules": [echo, unreachable], "egress-security-rules": []}
        });
        let snapshot = Snapshot::parse(LIST, &body.to_string()).unwrap();
        assert!(cloud_duplicates(&snapshot.ingress).unwrap().remove.is_empty());
    }

    #[tokio::test]
    async fn test_dedupe_cloud_single_replace() {
        let runner = FakeRunner::new();
        runner.seed_security_list(
            LIST,
            vec![
                oci_ingress("6", "0.0.0.0/0", Some((22, 22))),
                oci_ingress("6", "0.0.0.0/0", Some((22, 22))),
                oci_ingress("6", "10.0.0.0/8", Some((22, 22))),
            ],
            vec![oci_egress("all", "0.0.0.0/0"), oci_egress("all", "0.0.0.0/0")],
        );
        let list = CloudSecurityList::new(&runner, LIST, 1, OciOptions::default()).unwrap();

        let report = dedupe_cloud(&list, &AutoConfirm).await.unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(runner.security_list_updates(), 1);
        assert_eq!(runner.security_list_ingress().len(), 2);
        assert_eq!(runner.security_list_egress().len(), 1);
    }

    #[tokio::test]
    async fn test_dedupe_cloud_declined() {
        let runner = FakeRunner::new();
        runner.seed_security_list(
            LIST,
            vec![
                oci_ingress("6", "0.0.0.0/0", Some((22, 22))),
                oci_ingress("6", "0.0.0.0/0", Some((22, 22))),
            ],
            vec![],
        );
        let list = CloudSecurityList::new(&runner, LIST, 1, OciOptions::default()).unwrap();

        let report = dedupe_cloud(&list, &Decline).await.unwrap();
        assert!(report.declined);
        assert_eq!(runner.security_list_updates(), 0);
    }

    #[tokio::test]
    async fn test_dedupe_stores_isolates_failures() {
        let runner = FakeRunner::new();
        runner.seed_chain(
            "PORTSYNC",
            &["-p tcp --dport 22 -j ACCEPT", "-p tcp --dport 22 -j ACCEPT"],
        );
        // No security list seeded: the get fails with a 404
        let config = Config {
            persist: false,
            ..Config::default()
        };

        let run = dedupe_stores(&runner, &AutoConfirm, &config, Some(LIST)).await;
        assert_eq!(run.local.as_ref().unwrap().removed, 1);
        assert!(run.cloud.as_ref().unwrap().is_err());
        assert_eq!(run.exit_status(), ExitStatus::StoreFailed);
        assert_eq!(run.stores().len(), 2);
    }

    #[tokio::test]
    async fn test_dedupe_stores_declined() {
        let runner = FakeRunner::new();
        runner.seed_chain(
            "PORTSYNC",
            &["-p tcp --dport 22 -j ACCEPT", "-p tcp --dport 22 -j ACCEPT"],
        );
        let run = dedupe_stores(&runner, &Decline, &Config::default(), None).await;
        assert!(run.cloud.is_none());
        assert_eq!(run.exit_status(), ExitStatus::Declined);
    }
}

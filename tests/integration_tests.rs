//! Integration tests for portsync
//!
//! These tests drive full reconciliation cycles through the public API with
//! an in-process command runner, so they need neither privileges nor a
//! cloud account:
//! ```bash
//! cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use portsync::config::{Config, load_config};
use portsync::core::confirm::AutoConfirm;
use portsync::core::coverage;
use portsync::core::firewall::{DesiredPortSet, PortSpec, RuleProtocol, Scope};
use portsync::core::reconcile::{CycleOptions, ExitStatus, Reconciler, StoreStatus};
use portsync::core::runner::{CommandOutput, CommandRunner, Invocation, Program};
use portsync::core::security_list::{Snapshot, propose_additions};
use portsync::run_log::{RunKind, RunLog, RunRecord};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;
use tokio::sync::watch;

const LIST: &str = "ocid1.securitylist.oc1.phx.aaaaaaaaintegration";

#[derive(Default)]
struct HostState {
    chains: BTreeMap<String, Vec<String>>,
    ingress: Vec<Value>,
    egress: Vec<Value>,
    etag: u32,
    /// Raw `--ingress-security-rules` payloads sent by updates
    payloads: Vec<String>,
    update_args: Vec<Vec<String>>,
}

/// Just enough iptables and OCI CLI behavior for a cycle
struct HostRunner {
    state: Mutex<HostState>,
}

impl HostRunner {
    fn new(ingress: Vec<Value>, egress: Vec<Value>) -> Self {
        let mut chains = BTreeMap::new();
        chains.insert("INPUT".to_string(), vec!["-j REJECT --reject-with icmp-host-prohibited".to_string()]);
        Self {
            state: Mutex::new(HostState {
                chains,
                ingress,
                egress,
                ..HostState::default()
            }),
        }
    }

    fn handle(&self, inv: &Invocation) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        let args: Vec<&str> = inv.args.iter().map(String::as_str).collect();
        match inv.program {
            Program::Docker => CommandOutput::failed(1, "Cannot connect to the Docker daemon"),
            Program::Oci => match args.as_slice() {
                ["network", "security-list", "get", ..] => CommandOutput::ok(
                    json!({
                        "data": {
                            "id": LIST,
                            "ingress-security-rules": state.ingress,
                            "egress-security-rules": state.egress,
                        },
                        "etag": format!("W/{}", state.etag),
                    })
                    .to_string(),
                ),
                ["network", "security-list", "update", ..] => {
                    let file = args
                        .windows(2)
                        .find(|w| w[0] == "--ingress-security-rules")
                        .and_then(|w| w[1].strip_prefix("file://"))
                        .unwrap();
                    let payload = std::fs::read_to_string(file).unwrap();
                    state.payloads.push(payload);
                    state.update_args.push(inv.args.clone());
                    state.etag += 1;
                    CommandOutput::ok("{}")
                }
                _ => CommandOutput::failed(2, "unexpected oci call"),
            },
            Program::Privileged(_) if inv.program == Program::IPTABLES => match args.as_slice() {
                ["-S", chain] => match state.chains.get(*chain) {
                    Some(rules) => {
                        let mut out = vec![format!("-N {chain}")];
                        out.extend(rules.iter().map(|r| format!("-A {chain} {r}")));
                        CommandOutput::ok(out.join("\n"))
                    }
                    None => CommandOutput::failed(1, "iptables: No chain/target/match by that name."),
                },
                ["-N", chain] => {
                    state.chains.insert((*chain).to_string(), Vec::new());
                    CommandOutput::ok("")
                }
                ["-A", chain, spec @ ..] => {
                    state
                        .chains
                        .entry((*chain).to_string())
                        .or_default()
                        .push(spec.join(" "));
                    CommandOutput::ok("")
                }
                ["-I", chain, pos, spec @ ..] => {
                    let rules = state.chains.entry((*chain).to_string()).or_default();
                    let idx = pos.parse::<usize>().unwrap() - 1;
                    rules.insert(idx, spec.join(" "));
                    CommandOutput::ok("")
                }
                _ => CommandOutput::failed(2, "unexpected iptables call"),
            },
            Program::Privileged(_) => CommandOutput::ok(""),
        }
    }
}

impl CommandRunner for HostRunner {
    async fn run(&self, invocation: &Invocation) -> portsync::Result<CommandOutput> {
        Ok(self.handle(invocation))
    }
}

fn test_config(baseline: &[PortSpec]) -> Config {
    Config {
        security_list_id: Some(LIST.to_string()),
        baseline_ports: baseline.to_vec(),
        gateway_endpoint: None,
        discover_containers: true,
        persist: false,
        ..Config::default()
    }
}

fn snapshot(ingress: Value, egress: Value) -> Snapshot {
    let body = json!({
        "data": {"ingress-security-rules": ingress, "egress-security-rules": egress},
        "etag": "abc"
    });
    Snapshot::parse(LIST, &body.to_string()).unwrap()
}

#[tokio::test]
async fn test_full_cycle_hooks_ahead_of_reject_and_updates_list() {
    let runner = HostRunner::new(
        vec![json!({"protocol": "6", "source": "0.0.0.0/0", "is-stateless": false,
                    "tcp-options": {"destination-port-range": {"min": 22, "max": 22}}})],
        vec![json!({"protocol": "all", "destination": "0.0.0.0/0", "is-stateless": false})],
    );
    let config = test_config(&[PortSpec::tcp(22), PortSpec::tcp(443)]);
    let (_tx, rx) = watch::channel(false);

    let report = Reconciler::new(&runner, &AutoConfirm, &config, CycleOptions::default(), rx)
        .run_cycle()
        .await;

    assert_eq!(report.exit_status(), ExitStatus::Success);
    let local = report.local.as_ref().unwrap();
    assert_eq!(local.status, StoreStatus::Applied);
    assert_eq!(local.added, vec!["22/tcp", "443/tcp"]);

    let state = runner.state.lock().unwrap();
    // The jump lands in front of the catch-all reject
    assert_eq!(state.chains["INPUT"][0], "-j PORTSYNC");
    assert_eq!(state.chains["PORTSYNC"].len(), 2);

    let cloud = report.cloud.as_ref().unwrap();
    assert_eq!(cloud.added, vec!["ingress 443/tcp"]);
    assert_eq!(cloud.covered, vec!["ingress 22/tcp", "egress 22/tcp", "egress 443/tcp"]);
    assert_eq!(state.update_args.len(), 1);
    let args = &state.update_args[0];
    assert!(args.windows(2).any(|w| w[0] == "--if-match" && w[1] == "W/0"));
    assert!(args.contains(&"--force".to_string()));

    // Sent in the CLI's camelCase input form, existing rule first
    let sent: Vec<Value> = serde_json::from_str(&state.payloads[0]).unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1]["tcpOptions"]["destinationPortRange"]["min"], 443);
    assert_eq!(sent[1]["sourceType"], "CIDR_BLOCK");
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let runner = HostRunner::new(vec![], vec![]);
    let config = test_config(&[PortSpec::udp(51820)]);
    let (_tx, rx) = watch::channel(false);
    let options = CycleOptions {
        dry_run: true,
        ..CycleOptions::default()
    };

    let report = Reconciler::new(&runner, &AutoConfirm, &config, options, rx)
        .run_cycle()
        .await;

    assert_eq!(report.local.as_ref().unwrap().status, StoreStatus::Planned);
    assert_eq!(report.cloud.as_ref().unwrap().pending, vec!["ingress 51820/udp", "egress 51820/udp"]);
    let state = runner.state.lock().unwrap();
    assert!(!state.chains.contains_key("PORTSYNC"));
    assert!(state.update_args.is_empty());
}

#[test]
fn test_range_containment() {
    let snapshot = snapshot(
        json!([{"protocol": "6", "source": "0.0.0.0/0",
                "tcp-options": {"destination-port-range": {"min": 8000, "max": 8010}}}]),
        json!([]),
    );
    let covered = coverage::analyze(PortSpec::tcp(8005), &snapshot.ingress, Scope::Ingress);
    assert!(covered.covered);
    let outside = coverage::analyze(PortSpec::tcp(8011), &snapshot.ingress, Scope::Ingress);
    assert!(!outside.covered);
    let udp = coverage::analyze(PortSpec::udp(8005), &snapshot.ingress, Scope::Ingress);
    assert!(!udp.covered);
}

#[test]
fn test_proposals_never_shrink_the_list() {
    let snapshot = snapshot(
        json!([
            {"protocol": "17", "source": "0.0.0.0/0", "udp-options": {"destination-port-range": {"min": 53, "max": 53}}},
            {"protocol": "6", "source": "192.168.0.0/16"}
        ]),
        json!([{"protocol": "all", "destination": "0.0.0.0/0"}]),
    );
    let desired: DesiredPortSet = [PortSpec::udp(53), PortSpec::tcp(80)].into_iter().collect();

    let additions = propose_additions(&desired, &snapshot, true);

    assert_eq!(additions.len(), 1);
    assert_eq!(additions.ingress[0].protocol, RuleProtocol::Tcp);
    assert!(additions.egress.is_empty());
}

#[tokio::test]
async fn test_config_file_and_run_log() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"security_list_id": "{LIST}", "baseline_ports": ["22", "8443/tcp"], "retries": 0}}"#
    )
    .unwrap();
    let config = load_config(Some(file.path())).await.unwrap();
    assert_eq!(config.baseline_ports, vec![PortSpec::tcp(22), PortSpec::tcp(8443)]);

    let runner = HostRunner::new(vec![], vec![]);
    let config = Config {
        gateway_endpoint: None,
        persist: false,
        ..config
    };
    let (_tx, rx) = watch::channel(false);
    let report = Reconciler::new(&runner, &AutoConfirm, &config, CycleOptions::default(), rx)
        .run_cycle()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log = RunLog::new(dir.path());
    log.append(&RunRecord::from_cycle(&report, RunKind::Sync))
        .await
        .unwrap();

    let latest = log.latest().await.unwrap().unwrap();
    assert_eq!(latest.cycle_id, report.cycle_id);
    assert_eq!(latest.desired, 2);
    assert_eq!(latest.stores.len(), 2);
    assert_eq!(latest.stores[1].added, 4);
    assert_eq!(latest.cloud_fingerprint.as_ref().map(String::len), Some(64));
}

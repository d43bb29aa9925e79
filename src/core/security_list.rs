//! Cloud store: an OCI VCN security list, driven through the `oci` CLI
//!
//! The management API replaces both rule arrays wholesale on update. A
//! request that carried only the new rules would silently delete every
//! rule a person added, so [`CloudSecurityList::apply_update`] always
//! builds `existing ∪ proposed` itself from the snapshot and refuses to
//! send a payload that drops anything.
//!
//! Existing rules are kept as the exact JSON the API returned; the typed
//! [`RuleRecord`] view is only used for coverage decisions.

use crate::core::coverage::{self, CoveragePlan};
use crate::core::error::{Error, Result};
use crate::core::firewall::{
    DesiredPortSet, Endpoint, PortRange, PortSpec, Protocol, RawRule, RuleProtocol, RuleRecord,
    Scope, UNIVERSAL_CIDR,
};
use crate::core::runner::{CommandRunner, Invocation, Program, run_with_retry};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::io::Write;
use tracing::{debug, info, warn};

const STORE: &str = "security list";

/// Description stamped on every rule portsync creates
pub const DESCRIPTION_PREFIX: &str = "portsync";

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidRuleData {
        store: STORE.to_string(),
        reason: reason.into(),
    }
}

fn unreachable(reason: impl Into<String>) -> Error {
    Error::StoreUnreachable {
        store: STORE.to_string(),
        reason: reason.into(),
    }
}

// --- Wire types -------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GetResponse {
    data: Option<RawSecurityList>,
    etag: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawSecurityList {
    id: Option<String>,
    ingress_security_rules: Option<Vec<Value>>,
    egress_security_rules: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct OciRule {
    protocol: String,
    source: Option<String>,
    destination: Option<String>,
    is_stateless: Option<bool>,
    tcp_options: Option<PortOptions>,
    udp_options: Option<PortOptions>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct PortOptions {
    destination_port_range: Option<OciRange>,
    source_port_range: Option<OciRange>,
}

#[derive(Debug, Deserialize)]
struct OciRange {
    min: u16,
    max: u16,
}

impl OciRange {
    fn to_range(&self) -> Result<PortRange> {
        PortRange::new(self.min, self.max).map_err(invalid)
    }
}

/// `ServiceError` body the CLI prints on stderr
#[derive(Debug, Deserialize)]
struct ServiceError {
    status: Option<u16>,
    code: Option<String>,
    message: Option<String>,
}

fn parse_service_error(stderr: &str) -> Option<ServiceError> {
    let start = stderr.find('{')?;
    let end = stderr.rfind('}')?;
    serde_json::from_str(stderr.get(start..=end)?).ok()
}

fn parse_protocol(code: &str) -> RuleProtocol {
    match code.to_ascii_lowercase().as_str() {
        "6" => RuleProtocol::Tcp,
        "17" => RuleProtocol::Udp,
        "all" => RuleProtocol::All,
        other => RuleProtocol::Other(other.to_string()),
    }
}

/// Parses one rule as returned by the API, keeping the original JSON.
fn record_from_json(value: &Value, scope: Scope) -> Result<RuleRecord> {
    let rule: OciRule = serde_json::from_value(value.clone())
        .map_err(|e| invalid(format!("{scope} rule {value}: {e}")))?;

    let endpoint = match scope {
        Scope::Ingress => rule.source.as_deref(),
        Scope::Egress => rule.destination.as_deref(),
    }
    .ok_or_else(|| invalid(format!("{scope} rule without endpoint: {value}")))?;

    let protocol = parse_protocol(&rule.protocol);
    // The API only accepts options matching the protocol; "all" with any
    // options is still recorded so it can't pass as unrestricted
    let options = match protocol {
        RuleProtocol::Tcp => rule.tcp_options.as_ref(),
        RuleProtocol::Udp => rule.udp_options.as_ref(),
        _ => rule.tcp_options.as_ref().or(rule.udp_options.as_ref()),
    };

    let (ports, source_ports) = match options {
        Some(opts) => (
            opts.destination_port_range
                .as_ref()
                .map(OciRange::to_range)
                .transpose()?,
            opts.source_port_range
                .as_ref()
                .map(OciRange::to_range)
                .transpose()?,
        ),
        None => (None, None),
    };

    // "all" with an options object but no range is still a restricted rule
    let ports = match (&protocol, options, ports) {
        (RuleProtocol::All, Some(_), None) => Some(PortRange { min: 1, max: 65535 }),
        (_, _, ports) => ports,
    };

    Ok(RuleRecord {
        scope,
        endpoint: Endpoint::parse(endpoint),
        protocol,
        ports,
        source_ports,
        stateless: rule.is_stateless.unwrap_or(false),
        raw: RawRule::Cloud {
            json: value.clone(),
        },
    })
}

/// JSON for a rule portsync proposes, in the API's response shape
fn proposed_json(spec: PortSpec, scope: Scope) -> Value {
    let options_key = match spec.protocol {
        Protocol::Tcp => "tcp-options",
        Protocol::Udp => "udp-options",
    };
    let mut rule = Map::new();
    match scope {
        Scope::Ingress => {
            rule.insert("source".into(), json!(UNIVERSAL_CIDR));
            rule.insert("source-type".into(), json!("CIDR_BLOCK"));
        }
        Scope::Egress => {
            rule.insert("destination".into(), json!(UNIVERSAL_CIDR));
            rule.insert("destination-type".into(), json!("CIDR_BLOCK"));
        }
    }
    rule.insert("protocol".into(), json!(spec.protocol.number().to_string()));
    rule.insert("is-stateless".into(), json!(false));
    rule.insert(
        "description".into(),
        json!(format!("{DESCRIPTION_PREFIX} {spec}")),
    );
    rule.insert(
        options_key.into(),
        json!({"destination-port-range": {"min": spec.port, "max": spec.port}}),
    );
    Value::Object(rule)
}

fn kebab_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for c in key.chars() {
        if c == '-' {
            upper = true;
        } else if upper {
            out.push(c.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// The CLI reads complex parameters in camelCase while `get` prints
/// kebab-case; nulls are dropped since absent and null mean the same.
fn to_cli_input(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (kebab_to_camel(k), to_cli_input(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(to_cli_input).collect()),
        other => other.clone(),
    }
}

fn raw_json(rule: &RuleRecord) -> Result<&Value> {
    match &rule.raw {
        RawRule::Cloud { json } => Ok(json),
        _ => Err(Error::Internal(format!(
            "rule '{}' carries no security list JSON",
            rule.describe()
        ))),
    }
}

// --- Snapshot and planning --------------------------------------------------

/// One read of the security list
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub list_id: String,
    /// Guards the replace against concurrent edits
    pub etag: Option<String>,
    pub ingress: Vec<RuleRecord>,
    pub egress: Vec<RuleRecord>,
    /// SHA-256 of both rule arrays as fetched
    pub fingerprint: String,
}

impl Snapshot {
    /// Parses `oci network security-list get` output.
    ///
    /// An empty body, `null` data or missing rule arrays mean the list's
    /// identity could not be confirmed; that is an error, unlike a list
    /// with zero rules.
    pub fn parse(list_id: &str, stdout: &str) -> Result<Self> {
        if stdout.trim().is_empty() {
            return Err(invalid("empty response"));
        }
        let response: GetResponse =
            serde_json::from_str(stdout).map_err(|e| invalid(format!("unparseable response: {e}")))?;
        let data = response.data.ok_or_else(|| invalid("response has no data"))?;

        if let Some(id) = &data.id
            && id != list_id
        {
            return Err(invalid(format!("asked for {list_id}, got {id}")));
        }

        let raw_ingress = data
            .ingress_security_rules
            .ok_or_else(|| invalid("response has no ingress-security-rules"))?;
        let raw_egress = data
            .egress_security_rules
            .ok_or_else(|| invalid("response has no egress-security-rules"))?;

        let ingress = raw_ingress
            .iter()
            .map(|v| record_from_json(v, Scope::Ingress))
            .collect::<Result<Vec<_>>>()?;
        let egress = raw_egress
            .iter()
            .map(|v| record_from_json(v, Scope::Egress))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            list_id: list_id.to_string(),
            etag: response.etag,
            fingerprint: compute_fingerprint(&raw_ingress, &raw_egress),
            ingress,
            egress,
        })
    }

    fn rules(&self, scope: Scope) -> &[RuleRecord] {
        match scope {
            Scope::Ingress => &self.ingress,
            Scope::Egress => &self.egress,
        }
    }
}

/// SHA-256 of the canonical JSON of both rule arrays.
pub fn compute_fingerprint(ingress: &[Value], egress: &[Value]) -> String {
    let canonical = json!({"ingress": ingress, "egress": egress}).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Rules to add, per direction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Additions {
    pub ingress: Vec<RuleRecord>,
    pub egress: Vec<RuleRecord>,
}

impl Additions {
    pub fn is_empty(&self) -> bool {
        self.ingress.is_empty() && self.egress.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ingress.len() + self.egress.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleRecord> {
        self.ingress.iter().chain(&self.egress)
    }
}

/// Coverage of the desired set against both directions of a snapshot
#[derive(Debug, Clone, Default)]
pub struct CloudPlan {
    pub ingress: CoveragePlan,
    /// `None` when egress sync is disabled
    pub egress: Option<CoveragePlan>,
}

impl CloudPlan {
    /// Ingress and egress are independent permission sets and are
    /// analyzed separately.
    pub fn analyze(desired: &DesiredPortSet, snapshot: &Snapshot, sync_egress: bool) -> Self {
        Self {
            ingress: coverage::plan(desired, snapshot.rules(Scope::Ingress), Scope::Ingress),
            egress: sync_egress
                .then(|| coverage::plan(desired, snapshot.rules(Scope::Egress), Scope::Egress)),
        }
    }

    /// Net-new rules for every uncovered spec.
    pub fn additions(&self) -> Additions {
        let build = |specs: &[PortSpec], scope: Scope| -> Vec<RuleRecord> {
            specs
                .iter()
                .map(|spec| RuleRecord {
                    raw: RawRule::Cloud {
                        json: proposed_json(*spec, scope),
                    },
                    ..RuleRecord::proposed(*spec, scope)
                })
                .collect()
        };
        Additions {
            ingress: build(&self.ingress.missing, Scope::Ingress),
            egress: self
                .egress
                .as_ref()
                .map(|p| build(&p.missing, Scope::Egress))
                .unwrap_or_default(),
        }
    }
}

/// Pure: the rules needed so that every desired spec is covered.
pub fn propose_additions(desired: &DesiredPortSet, snapshot: &Snapshot, sync_egress: bool) -> Additions {
    CloudPlan::analyze(desired, snapshot, sync_egress).additions()
}

/// Builds `existing ∪ proposed` for one direction and checks that nothing
/// already present is lost.
fn merge(existing: &[RuleRecord], proposed: &[RuleRecord]) -> Result<Vec<Value>> {
    let existing: Vec<&Value> = existing.iter().map(raw_json).collect::<Result<_>>()?;
    let mut merged: Vec<Value> = existing.iter().map(|v| (*v).clone()).collect();
    for rule in proposed {
        merged.push(raw_json(rule)?.clone());
    }

    if merged.len() < existing.len() || !existing.iter().all(|v| merged.contains(v)) {
        return Err(invalid(
            "merged payload would drop existing rules; refusing to update",
        ));
    }
    Ok(merged)
}

/// Counts after a successful update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub ingress_total: usize,
    pub egress_total: usize,
    pub added: usize,
}

// --- Adapter ----------------------------------------------------------------

/// CLI options shared by every call
#[derive(Debug, Clone, Default)]
pub struct OciOptions {
    pub profile: Option<String>,
    pub auth: Option<String>,
}

/// Adapter for one security list
pub struct CloudSecurityList<'a, R> {
    runner: &'a R,
    list_id: String,
    retries: u32,
    options: OciOptions,
}

impl<'a, R: CommandRunner> CloudSecurityList<'a, R> {
    pub fn new(runner: &'a R, list_id: &str, retries: u32, options: OciOptions) -> Result<Self> {
        let list_id = crate::validators::validate_security_list_id(list_id)
            .map_err(|e| Error::config("security_list_id", e))?;
        Ok(Self {
            runner,
            list_id,
            retries,
            options,
        })
    }

    pub fn list_id(&self) -> &str {
        &self.list_id
    }

    fn invocation(&self, tail: Vec<String>) -> Invocation {
        let mut args = Vec::new();
        if let Some(profile) = &self.options.profile {
            args.extend(["--profile".to_string(), profile.clone()]);
        }
        if let Some(auth) = &self.options.auth {
            args.extend(["--auth".to_string(), auth.clone()]);
        }
        args.extend(
            ["network", "security-list"]
                .into_iter()
                .map(str::to_string),
        );
        args.extend(tail);
        Invocation::new(Program::Oci, args)
    }

    /// Reads the list once. Never cached across cycles.
    pub async fn fetch_snapshot(&self) -> Result<Snapshot> {
        let inv = self.invocation(vec![
            "get".into(),
            "--security-list-id".into(),
            self.list_id.clone(),
        ]);
        let output = run_with_retry(self.runner, &inv, self.retries, Error::is_transient)
            .await
            .map_err(|e| classify(e, false))?;

        let snapshot = Snapshot::parse(&self.list_id, &output.stdout)?;
        debug!(
            "Security list {}: {} ingress, {} egress rule(s), etag {:?}",
            self.list_id,
            snapshot.ingress.len(),
            snapshot.egress.len(),
            snapshot.etag
        );
        Ok(snapshot)
    }

    /// Sends `existing ∪ additions` as a single replace. No call is made
    /// when there is nothing to add.
    pub async fn apply_update(&self, snapshot: &Snapshot, additions: &Additions) -> Result<UpdateOutcome> {
        let ingress = merge(&snapshot.ingress, &additions.ingress)?;
        let egress = merge(&snapshot.egress, &additions.egress)?;
        let outcome = UpdateOutcome {
            ingress_total: ingress.len(),
            egress_total: egress.len(),
            added: additions.len(),
        };

        if additions.is_empty() {
            debug!("Security list {} already covers every desired port", self.list_id);
            return Ok(outcome);
        }

        self.replace(snapshot, &ingress, &egress).await?;
        info!(
            "Updated security list {}: +{} rule(s) ({} ingress, {} egress total)",
            self.list_id, outcome.added, outcome.ingress_total, outcome.egress_total
        );
        Ok(outcome)
    }

    /// Replaces both arrays verbatim. Only duplicate elimination calls this
    /// with shorter arrays than the snapshot.
    pub async fn replace(&self, snapshot: &Snapshot, ingress: &[Value], egress: &[Value]) -> Result<()> {
        let write = |rules: &[Value]| -> Result<tempfile::NamedTempFile> {
            let mut file = tempfile::Builder::new()
                .prefix("portsync-rules-")
                .suffix(".json")
                .tempfile()?;
            let input: Vec<Value> = rules.iter().map(to_cli_input).collect();
            file.write_all(serde_json::to_string(&input)?.as_bytes())?;
            file.as_file().sync_all()?;
            Ok(file)
        };
        // Both files must outlive the command
        let ingress_file = write(ingress)?;
        let egress_file = write(egress)?;

        let mut tail = vec![
            "update".to_string(),
            "--security-list-id".to_string(),
            self.list_id.clone(),
            "--ingress-security-rules".to_string(),
            format!("file://{}", ingress_file.path().display()),
            "--egress-security-rules".to_string(),
            format!("file://{}", egress_file.path().display()),
            "--force".to_string(),
        ];
        match &snapshot.etag {
            Some(etag) => tail.extend(["--if-match".to_string(), etag.clone()]),
            None => warn!("No etag on snapshot; update is not guarded against concurrent edits"),
        }

        // A replace is not retried: the etag already changed if it landed
        let inv = self.invocation(tail);
        run_with_retry(self.runner, &inv, 0, |_| false)
            .await
            .map_err(|e| classify(e, true))?;
        Ok(())
    }
}

/// Maps a CLI failure onto the store error taxonomy.
fn classify(e: Error, mutating: bool) -> Error {
    match e {
        Error::Command {
            stderr, message, ..
        } => {
            let stderr = stderr.unwrap_or(message);
            match parse_service_error(&stderr) {
                Some(service) => {
                    let cause = format!(
                        "{} ({}): {}",
                        service.code.as_deref().unwrap_or("ServiceError"),
                        service.status.map_or_else(|| "?".to_string(), |s| s.to_string()),
                        service.message.as_deref().unwrap_or("no message")
                    );
                    match service.status {
                        Some(400 | 409 | 412) if mutating => Error::ApplyRejected {
                            store: STORE.to_string(),
                            cause,
                        },
                        _ => unreachable(cause),
                    }
                }
                None => unreachable(stderr.trim().to_string()),
            }
        }
        Error::Timeout { .. } | Error::Io(_) | Error::Elevation(_) => unreachable(e.to_string()),
        other => other,
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::core::test_helpers::oci_ingress;
    use proptest::prelude::*;

    fn arb_rule() -> impl Strategy<Value = Value> {
        (
            prop_oneof![Just("6"), Just("17"), Just("all"), Just("1")],
            prop_oneof![Just("0.0.0.0/0"), Just("10.0.0.0/8")],
            proptest::option::of((1u16..=1000, 0u16..=50)),
        )
            .prop_map(|(proto, source, ports)| {
                let ports = ports.map(|(min, width)| (min, min + width));
                oci_ingress(proto, source, if proto == "all" { None } else { ports })
            })
    }

    proptest! {
        #[test]
        fn test_union_never_shrinks(
            existing in proptest::collection::vec(arb_rule(), 0..12),
            ports in proptest::collection::btree_set(1u16..=2000, 0..8),
        ) {
            let body = json!({
                "data": {"ingress-security-rules": existing, "egress-security-rules": []},
                "etag": "e"
            });
            let snapshot = Snapshot::parse("ocid1.securitylist.oc1.iad.x", &body.to_string()).unwrap();
            let want: DesiredPortSet = ports.into_iter().map(PortSpec::tcp).collect();
            let additions = propose_additions(&want, &snapshot, false);

            let merged = merge(&snapshot.ingress, &additions.ingress).unwrap();
            prop_assert_eq!(merged.len(), snapshot.ingress.len() + additions.ingress.len());
            prop_assert!(existing.iter().all(|rule| merged.contains(rule)));
        }
    }
}

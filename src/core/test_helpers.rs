//! Shared test utilities for core module tests
//!
//! Provides [`FakeRunner`], an in-memory stand-in for every external
//! program portsync launches, so tests never touch real iptables, docker or
//! the cloud CLI. This module is only compiled in test mode.

use crate::core::error::Result;
use crate::core::runner::{CommandOutput, CommandRunner, Invocation, Program};
use crate::elevation::PrivilegedProgram;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("PORTSYNC_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("PORTSYNC_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

const BUILTIN_CHAINS: [&str; 3] = ["INPUT", "FORWARD", "OUTPUT"];
const NO_CHAIN: &str = "iptables: No chain/target/match by that name.";
const DOCKER_DOWN: &str =
    "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?";

/// Renders an OCI CLI `ServiceError` as it appears on stderr
pub fn service_error(status: u16, code: &str, message: &str) -> String {
    let body = json!({
        "code": code,
        "message": message,
        "opc-request-id": "FAKE/REQUEST",
        "status": status,
    });
    format!("ServiceError:\n{}\n", serde_json::to_string_pretty(&body).unwrap())
}

/// An ingress rule as `oci network security-list get` prints it
pub fn oci_ingress(protocol: &str, source: &str, ports: Option<(u16, u16)>) -> Value {
    let options = ports.map(|(min, max)| {
        json!({"destination-port-range": {"min": min, "max": max}, "source-port-range": null})
    });
    json!({
        "description": null,
        "icmp-options": null,
        "is-stateless": false,
        "protocol": protocol,
        "source": source,
        "source-type": "CIDR_BLOCK",
        "tcp-options": if protocol == "6" { options.clone() } else { None },
        "udp-options": if protocol == "17" { options } else { None },
    })
}

/// An egress rule as `oci network security-list get` prints it
pub fn oci_egress(protocol: &str, destination: &str) -> Value {
    json!({
        "description": null,
        "destination": destination,
        "destination-type": "CIDR_BLOCK",
        "icmp-options": null,
        "is-stateless": false,
        "protocol": protocol,
        "tcp-options": null,
        "udp-options": null,
    })
}

fn camel_to_kebab(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('-');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Mirrors the service echoing camelCase input back in kebab-case
fn to_kebab_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (camel_to_kebab(&k), to_kebab_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(to_kebab_keys).collect()),
        other => other,
    }
}

#[derive(Debug)]
struct SecurityList {
    id: String,
    ingress: Vec<Value>,
    egress: Vec<Value>,
    etag: u64,
}

#[derive(Debug, Default)]
struct FakeState {
    chains: BTreeMap<String, Vec<String>>,
    failures: HashMap<Program, (u32, String)>,
    append_failures: (u32, String),
    calls: Vec<Invocation>,
    containers: Option<Vec<Value>>,
    security_list: Option<SecurityList>,
    updates: u32,
}

/// Scripted in-memory command runner
///
/// Simulates the iptables chains, the docker CLI and the OCI security list.
/// Builtin `INPUT`, `FORWARD` and `OUTPUT` chains exist from the start.
#[derive(Debug)]
pub struct FakeRunner {
    state: Mutex<FakeState>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRunner {
    pub fn new() -> Self {
        let mut state = FakeState::default();
        for chain in BUILTIN_CHAINS {
            state.chains.insert(chain.to_string(), Vec::new());
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// The next `times` calls to `program` exit 1 with `stderr`.
    pub fn fail_next(&self, program: Program, times: u32, stderr: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(program, (times, stderr.to_string()));
    }

    /// The next `times` `iptables -A` calls exit 1 with `stderr`.
    pub fn fail_iptables_append(&self, times: u32, stderr: &str) {
        self.state.lock().unwrap().append_failures = (times, stderr.to_string());
    }

    /// Creates (or replaces) a chain holding the given rule specifications.
    pub fn seed_chain(&self, name: &str, rules: &[&str]) {
        self.state.lock().unwrap().chains.insert(
            name.to_string(),
            rules.iter().map(|r| (*r).to_string()).collect(),
        );
    }

    pub fn chain_exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().chains.contains_key(name)
    }

    pub fn chain_rules(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .chains
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Containers as `docker inspect` prints them; each needs an `Id`.
    pub fn set_docker_containers(&self, containers: Value) {
        let list = match containers {
            Value::Array(items) => items,
            other => vec![other],
        };
        self.state.lock().unwrap().containers = Some(list);
    }

    pub fn seed_security_list(&self, id: &str, ingress: Vec<Value>, egress: Vec<Value>) {
        self.state.lock().unwrap().security_list = Some(SecurityList {
            id: id.to_string(),
            ingress,
            egress,
            etag: 1,
        });
    }

    /// Simulates someone else editing the list (changes the etag).
    pub fn touch_security_list(&self) {
        if let Some(list) = self.state.lock().unwrap().security_list.as_mut() {
            list.etag += 1;
        }
    }

    pub fn security_list_ingress(&self) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .security_list
            .as_ref()
            .map(|l| l.ingress.clone())
            .unwrap_or_default()
    }

    pub fn security_list_egress(&self) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .security_list
            .as_ref()
            .map(|l| l.egress.clone())
            .unwrap_or_default()
    }

    /// Number of successful security list updates
    pub fn security_list_updates(&self) -> u32 {
        self.state.lock().unwrap().updates
    }

    pub fn calls_for(&self, program: Program) -> Vec<Invocation> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.program == program)
            .cloned()
            .collect()
    }

    /// Every `iptables` call that changed a chain
    pub fn iptables_writes(&self) -> Vec<Invocation> {
        self.calls_for(Program::IPTABLES)
            .into_iter()
            .filter(|c| c.args.first().is_some_and(|a| a != "-S"))
            .collect()
    }

    fn handle(&self, invocation: &Invocation) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        state.calls.push(invocation.clone());

        if let Some((remaining, stderr)) = state.failures.get_mut(&invocation.program)
            && *remaining > 0
        {
            *remaining -= 1;
            return CommandOutput::failed(1, stderr.clone());
        }

        let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
        match invocation.program {
            Program::Privileged(PrivilegedProgram::Iptables) => iptables(&mut state, &args),
            Program::Privileged(PrivilegedProgram::IptablesSave) => {
                CommandOutput::ok(iptables_save(&state))
            }
            Program::Privileged(_) => CommandOutput::ok(""),
            Program::Docker => docker(&state, &args),
            Program::Oci => oci(&mut state, &args),
        }
    }
}

impl CommandRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        Ok(self.handle(invocation))
    }
}

fn iptables(state: &mut FakeState, args: &[&str]) -> CommandOutput {
    let join = |spec: &[&str]| {
        spec.iter()
            .map(|t| {
                if t.contains(char::is_whitespace) {
                    format!("\"{t}\"")
                } else {
                    (*t).to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    };

    match args {
        ["-S", chain] => match state.chains.get(*chain) {
            Some(rules) => {
                let header = if BUILTIN_CHAINS.contains(chain) {
                    format!("-P {chain} ACCEPT")
                } else {
                    format!("-N {chain}")
                };
                let mut out = vec![header];
                out.extend(rules.iter().map(|r| format!("-A {chain} {r}")));
                CommandOutput::ok(out.join("\n") + "\n")
            }
            None => CommandOutput::failed(1, NO_CHAIN),
        },
        ["-N", chain] => {
            if state.chains.contains_key(*chain) {
                CommandOutput::failed(1, "iptables: Chain already exists.")
            } else {
                state.chains.insert((*chain).to_string(), Vec::new());
                CommandOutput::ok("")
            }
        }
        ["-A", chain, spec @ ..] => {
            if state.append_failures.0 > 0 {
                state.append_failures.0 -= 1;
                return CommandOutput::failed(1, state.append_failures.1.clone());
            }
            match state.chains.get_mut(*chain) {
                Some(rules) => {
                    rules.push(join(spec));
                    CommandOutput::ok("")
                }
                None => CommandOutput::failed(1, NO_CHAIN),
            }
        }
        ["-I", chain, pos, spec @ ..] => match (state.chains.get_mut(*chain), pos.parse::<usize>()) {
            (Some(rules), Ok(pos)) if pos >= 1 => {
                let idx = (pos - 1).min(rules.len());
                rules.insert(idx, join(spec));
                CommandOutput::ok("")
            }
            (Some(_), _) => CommandOutput::failed(2, "iptables v1.8.7 (legacy): Invalid rule number"),
            (None, _) => CommandOutput::failed(1, NO_CHAIN),
        },
        ["-D", chain, spec @ ..] => {
            let wanted = join(spec);
            match state.chains.get_mut(*chain) {
                Some(rules) => match rules.iter().position(|r| *r == wanted) {
                    Some(idx) => {
                        rules.remove(idx);
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed(
                        1,
                        "iptables: Bad rule (does a matching rule exist in that chain?).",
                    ),
                },
                None => CommandOutput::failed(1, NO_CHAIN),
            }
        }
        _ => CommandOutput::failed(2, format!("iptables: unknown option \"{}\"", args.join(" "))),
    }
}

fn iptables_save(state: &FakeState) -> String {
    let mut out = vec!["*filter".to_string()];
    for chain in state.chains.keys() {
        let policy = if BUILTIN_CHAINS.contains(&chain.as_str()) {
            "ACCEPT"
        } else {
            "-"
        };
        out.push(format!(":{chain} {policy} [0:0]"));
    }
    for (chain, rules) in &state.chains {
        out.extend(rules.iter().map(|r| format!("-A {chain} {r}")));
    }
    out.push("COMMIT".to_string());
    out.join("\n") + "\n"
}

fn docker(state: &FakeState, args: &[&str]) -> CommandOutput {
    let Some(containers) = state.containers.as_ref() else {
        return CommandOutput::failed(1, DOCKER_DOWN);
    };
    match args {
        ["ps", "-q"] => {
            let ids: Vec<&str> = containers
                .iter()
                .filter_map(|c| c.get("Id").and_then(Value::as_str))
                .collect();
            CommandOutput::ok(ids.join("\n"))
        }
        ["inspect", ids @ ..] => {
            let found: Vec<Value> = ids
                .iter()
                .filter_map(|id| {
                    containers
                        .iter()
                        .find(|c| c.get("Id").and_then(Value::as_str) == Some(*id))
                        .cloned()
                })
                .collect();
            CommandOutput::ok(Value::Array(found).to_string())
        }
        _ => CommandOutput::failed(125, "docker: unknown command"),
    }
}

fn flag<'a>(args: &[&'a str], name: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == name).map(|w| w[1])
}

fn read_payload(arg: Option<&str>) -> std::result::Result<Vec<Value>, String> {
    let path = arg
        .and_then(|a| a.strip_prefix("file://"))
        .ok_or_else(|| "missing file:// payload".to_string())?;
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let value: Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;
    match to_kebab_keys(value) {
        Value::Array(items) => Ok(items),
        _ => Err("payload is not a JSON array".to_string()),
    }
}

fn oci(state: &mut FakeState, args: &[&str]) -> CommandOutput {
    let not_found = || {
        CommandOutput::failed(
            1,
            service_error(404, "NotAuthorizedOrNotFound", "Authorization failed or requested resource not found."),
        )
    };
    // Global options such as --profile precede the service name
    let args = args
        .iter()
        .position(|a| *a == "network")
        .map_or(args, |idx| &args[idx..]);
    let requested = flag(args, "--security-list-id");

    match args {
        ["network", "security-list", "get", ..] => match state.security_list.as_ref() {
            Some(list) if Some(list.id.as_str()) == requested => CommandOutput::ok(
                json!({
                    "data": {
                        "id": list.id,
                        "display-name": "Default Security List",
                        "lifecycle-state": "AVAILABLE",
                        "ingress-security-rules": list.ingress,
                        "egress-security-rules": list.egress,
                    },
                    "etag": format!("etag-{}", list.etag),
                })
                .to_string(),
            ),
            _ => not_found(),
        },
        ["network", "security-list", "update", ..] => {
            let Some(list) = state.security_list.as_mut() else {
                return not_found();
            };
            if Some(list.id.as_str()) != requested {
                return not_found();
            }
            if let Some(etag) = flag(args, "--if-match")
                && etag != format!("etag-{}", list.etag)
            {
                return CommandOutput::failed(
                    1,
                    service_error(412, "PreconditionFailed", "The If-Match header does not match"),
                );
            }
            let ingress = read_payload(flag(args, "--ingress-security-rules"));
            let egress = read_payload(flag(args, "--egress-security-rules"));
            match (ingress, egress) {
                (Ok(ingress), Ok(egress)) => {
                    list.ingress = ingress;
                    list.egress = egress;
                    list.etag += 1;
                    state.updates += 1;
                    CommandOutput::ok(json!({"etag": format!("etag-{}", list.etag)}).to_string())
                }
                (Err(e), _) | (_, Err(e)) => {
                    CommandOutput::failed(2, service_error(400, "InvalidParameter", &e))
                }
            }
        }
        _ => CommandOutput::failed(2, "Error: No such command."),
    }
}

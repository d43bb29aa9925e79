//! Port discovery
//!
//! Builds the [`DesiredPortSet`] for one cycle from three sources:
//!
//! - published container ports (`docker ps` + `docker inspect`)
//! - listener addresses registered with the local Caddy gateway (admin API)
//! - the configured baseline ports, which are always present
//!
//! A source that cannot be consulted is skipped with an info-level log;
//! discovery only fails when nothing at all was found.

use crate::core::error::{Error, Result};
use crate::core::firewall::{DesiredPortSet, PortRange, PortSpec, Protocol};
use crate::core::runner::{CommandRunner, Invocation, Program, run_with_retry};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Widest port range accepted from any source. Each port becomes its own
/// rule in both stores.
pub const MAX_PORT_RANGE: u32 = 256;

/// Port Caddy serves HTTPS on unless configured otherwise
const DEFAULT_HTTPS_PORT: u16 = 443;

fn unavailable(source_name: &str, reason: impl ToString) -> Error {
    Error::DiscoverySourceUnavailable {
        source_name: source_name.to_string(),
        reason: reason.to_string(),
    }
}

/// Empty, wildcard and unparseable hosts count as public.
fn is_loopback_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

/// Parses `80` or `8000-8010`.
fn parse_dash_range(text: &str) -> Option<PortRange> {
    match text.split_once('-') {
        Some((min, max)) => PortRange::new(min.parse().ok()?, max.parse().ok()?).ok(),
        None => text.parse().ok().and_then(|p| PortRange::new(p, p).ok()),
    }
}

fn expand(range: PortRange, protocol: Protocol) -> impl Iterator<Item = PortSpec> {
    (range.min..=range.max).map(move |port| PortSpec { port, protocol })
}

// --- Containers -------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    #[serde(default)]
    name: String,
    network_settings: Option<NetworkSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<HostBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

/// Extracts published host ports from `docker inspect` output.
///
/// Bindings to loopback addresses are not reachable from outside and are
/// skipped, as are SCTP ports and container ports with no host binding.
pub fn parse_container_ports(inspect_json: &str) -> Result<Vec<PortSpec>> {
    let containers: Vec<InspectedContainer> = serde_json::from_str(inspect_json)?;
    let mut specs = Vec::new();

    for container in containers {
        let Some(ports) = container.network_settings.and_then(|n| n.ports) else {
            continue;
        };
        for (key, bindings) in ports {
            let proto_text = key.split_once('/').map_or("tcp", |(_, proto)| proto);
            let Ok(protocol) = proto_text.parse::<Protocol>() else {
                debug!("{}: ignoring {key} (unsupported protocol)", container.name);
                continue;
            };
            for binding in bindings.unwrap_or_default() {
                if is_loopback_host(&binding.host_ip) {
                    debug!("{}: {key} bound to loopback only", container.name);
                    continue;
                }
                match parse_dash_range(&binding.host_port) {
                    Some(range) if range.len() > MAX_PORT_RANGE => warn!(
                        "{}: skipping {key} host range {range}, wider than {MAX_PORT_RANGE} ports",
                        container.name
                    ),
                    Some(range) => specs.extend(expand(range, protocol)),
                    None => warn!(
                        "{}: unparseable host port '{}' for {key}",
                        container.name, binding.host_port
                    ),
                }
            }
        }
    }
    Ok(specs)
}

const CONTAINERS: &str = "containers";

/// Published ports of running containers
pub struct ContainerSource<'a, R> {
    runner: &'a R,
    retries: u32,
}

impl<'a, R: CommandRunner> ContainerSource<'a, R> {
    pub fn new(runner: &'a R, retries: u32) -> Self {
        Self { runner, retries }
    }

    pub async fn discover(&self) -> Result<Vec<PortSpec>> {
        let ps = Invocation::new(Program::Docker, ["ps", "-q"]);
        let ids = run_with_retry(self.runner, &ps, self.retries, Error::is_transient)
            .await
            .map_err(|e| unavailable(CONTAINERS, e))?;

        let ids: Vec<&str> = ids.stdout.split_whitespace().collect();
        if ids.is_empty() {
            debug!("No running containers");
            return Ok(Vec::new());
        }

        let mut args = vec!["inspect"];
        args.extend(ids.iter().copied());
        let inspect = Invocation::new(Program::Docker, args);
        let output = run_with_retry(self.runner, &inspect, self.retries, Error::is_transient)
            .await
            .map_err(|e| unavailable(CONTAINERS, e))?;

        parse_container_ports(&output.stdout).map_err(|e| unavailable(CONTAINERS, e))
    }
}

// --- Gateway ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CaddyServer {
    #[serde(default)]
    listen: Vec<String>,
    /// Absent means Caddy's default of h1, h2 and h3
    #[serde(default)]
    protocols: Vec<String>,
    tls_connection_policies: Option<serde_json::Value>,
}

impl CaddyServer {
    /// Whether the server answers HTTP/3, which runs over UDP.
    ///
    /// With no explicit protocol list, h3 is on wherever the server speaks
    /// TLS: it has connection policies or listens on the HTTPS port.
    fn serves_h3(&self, listeners: &[(Protocol, PortRange)]) -> bool {
        if !self.protocols.is_empty() {
            return self.protocols.iter().any(|p| p == "h3");
        }
        self.tls_connection_policies.is_some()
            || listeners
                .iter()
                .any(|(_, range)| range.contains(DEFAULT_HTTPS_PORT))
    }
}

/// Parses one Caddy listener address (`[network/]host:port[-port]`).
///
/// Returns `Ok(None)` for listeners that never need a firewall opening
/// (loopback binds, unix sockets).
pub fn parse_listen_address(addr: &str) -> std::result::Result<Option<(Protocol, PortRange)>, String> {
    let (network, hostport) = match addr.split_once('/') {
        Some((net, rest)) if !net.contains(':') => (net, rest),
        _ => ("tcp", addr),
    };

    let protocol = match network {
        "tcp" | "tcp4" | "tcp6" => Protocol::Tcp,
        "udp" | "udp4" | "udp6" => Protocol::Udp,
        "unix" | "unixgram" | "unixpacket" | "fd" | "fdgram" => return Ok(None),
        other => return Err(format!("unsupported network '{other}' in '{addr}'")),
    };

    let (host, port) = hostport
        .rsplit_once(':')
        .ok_or_else(|| format!("missing port in '{addr}'"))?;
    if is_loopback_host(host) {
        return Ok(None);
    }

    let range = parse_dash_range(port).ok_or_else(|| format!("invalid port '{port}' in '{addr}'"))?;
    if range.len() > MAX_PORT_RANGE {
        return Err(format!(
            "range {range} in '{addr}' is wider than {MAX_PORT_RANGE} ports"
        ));
    }
    Ok(Some((protocol, range)))
}

/// Extracts listener ports from the `apps/http/servers` config object.
///
/// A server that speaks HTTP/3 also needs its TCP ports open over UDP.
pub fn parse_gateway_servers(servers: &serde_json::Value) -> Result<Vec<PortSpec>> {
    if servers.is_null() {
        return Ok(Vec::new());
    }
    let servers: HashMap<String, CaddyServer> = serde_json::from_value(servers.clone())?;
    let mut specs = Vec::new();

    for (name, server) in servers {
        let mut listeners = Vec::new();
        for addr in &server.listen {
            match parse_listen_address(addr) {
                Ok(Some(listener)) => listeners.push(listener),
                Ok(None) => debug!("Server {name}: skipping local listener {addr}"),
                Err(e) => warn!("Server {name}: {e}"),
            }
        }

        let h3 = server.serves_h3(&listeners);
        for (protocol, range) in listeners {
            specs.extend(expand(range, protocol));
            if h3 && protocol == Protocol::Tcp {
                specs.extend(expand(range, Protocol::Udp));
            }
        }
    }
    Ok(specs)
}

/// Listener ports registered with the local Caddy gateway
pub struct GatewaySource {
    client: reqwest::Client,
    url: String,
}

impl GatewaySource {
    pub const NAME: &'static str = "gateway";

    /// `endpoint` is the admin API `host:port`.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| unavailable(Self::NAME, e))?;
        Ok(Self {
            client,
            url: format!("http://{endpoint}/config/apps/http/servers"),
        })
    }

    pub async fn discover(&self) -> Result<Vec<PortSpec>> {
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_connect() {
                unavailable(Self::NAME, format!("cannot connect to {}", self.url))
            } else {
                unavailable(Self::NAME, e)
            }
        })?;

        if !response.status().is_success() {
            return Err(unavailable(
                Self::NAME,
                format!("{} returned {}", self.url, response.status()),
            ));
        }

        let servers: serde_json::Value = response
            .json()
            .await
            .map_err(|e| unavailable(Self::NAME, e))?;
        parse_gateway_servers(&servers).map_err(|e| unavailable(Self::NAME, e))
    }
}

// --- Discoverer -------------------------------------------------------------

/// What one source contributed to a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub name: &'static str,
    pub found: usize,
    /// Reason the source was skipped
    pub skipped: Option<String>,
}

/// Result of discovery: the desired set plus per-source detail for reports
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub desired: DesiredPortSet,
    pub sources: Vec<SourceReport>,
}

impl Discovery {
    fn record(&mut self, name: &'static str, result: Result<Vec<PortSpec>>) {
        match result {
            Ok(specs) => {
                debug!("{name}: {} port(s)", specs.len());
                self.sources.push(SourceReport {
                    name,
                    found: specs.len(),
                    skipped: None,
                });
                self.desired.extend(specs);
            }
            Err(e) => {
                info!("Skipping discovery source: {e}");
                self.sources.push(SourceReport {
                    name,
                    found: 0,
                    skipped: Some(e.to_string()),
                });
            }
        }
    }
}

/// Runs every configured source and merges the results
pub struct Discoverer<'a, R> {
    containers: Option<ContainerSource<'a, R>>,
    gateway: Option<GatewaySource>,
    baseline: Vec<PortSpec>,
}

impl<'a, R: CommandRunner> Discoverer<'a, R> {
    pub fn new(
        containers: Option<ContainerSource<'a, R>>,
        gateway: Option<GatewaySource>,
        baseline: Vec<PortSpec>,
    ) -> Self {
        Self {
            containers,
            gateway,
            baseline,
        }
    }

    /// Computes the desired set from scratch. Never consults a previous run.
    pub async fn discover(&self) -> Result<Discovery> {
        let mut discovery = Discovery::default();

        discovery.record("baseline", Ok(self.baseline.clone()));
        if let Some(containers) = &self.containers {
            discovery.record(CONTAINERS, containers.discover().await);
        }
        if let Some(gateway) = &self.gateway {
            discovery.record(GatewaySource::NAME, gateway.discover().await);
        }

        if discovery.desired.is_empty() {
            return Err(unavailable("all", "no ports discovered and no baseline configured"));
        }
        info!("Discovered {} desired port(s)", discovery.desired.len());
        Ok(discovery)
    }
}

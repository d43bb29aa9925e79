//! Port and rule data structures shared by every rule store
//!
//! This module defines the vocabulary of a reconciliation cycle:
//!
//! - [`PortSpec`]: one desired `(port, protocol)` pair
//! - [`DesiredPortSet`]: the deduplicated set of specs a cycle wants open
//! - [`RuleRecord`]: one existing rule, parsed by a store adapter
//!
//! Store adapters never let raw command output or API text escape; they
//! produce [`RuleRecord`]s and keep their store-specific identity in
//! [`RawRule`] so the rule can be removed or re-sent later.
//!
//! # Example
//!
//! ```
//! use portsync::core::firewall::{PortSpec, Protocol};
//!
//! let spec: PortSpec = "8080/tcp".parse().unwrap();
//! assert_eq!(spec.port, 8080);
//! assert_eq!(spec.protocol, Protocol::Tcp);
//! assert_eq!(spec.to_string(), "8080/tcp");
//! ```

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Transport protocol of a desired port
///
/// `Copy` trait allows efficient passing by value for this small enum.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    /// Transmission Control Protocol
    #[strum(serialize = "tcp")]
    Tcp,
    /// User Datagram Protocol
    #[strum(serialize = "udp")]
    Udp,
}

impl Protocol {
    /// Returns lowercase protocol name as static string
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// IANA protocol number, as used by cloud security lists
    pub const fn number(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }
}

/// Protocol field of an existing rule
///
/// Unlike [`Protocol`], a rule may match every protocol (`all`) or a
/// protocol this system never asks for (ICMP, GRE, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuleProtocol {
    Tcp,
    Udp,
    /// Wildcard rule
    All,
    /// Any other protocol, kept verbatim (never covers a desired port)
    Other(String),
}

impl RuleProtocol {
    /// Exact (non-wildcard) match against a desired protocol
    pub fn is(&self, protocol: Protocol) -> bool {
        matches!(
            (self, protocol),
            (RuleProtocol::Tcp, Protocol::Tcp) | (RuleProtocol::Udp, Protocol::Udp)
        )
    }
}

impl From<Protocol> for RuleProtocol {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => RuleProtocol::Tcp,
            Protocol::Udp => RuleProtocol::Udp,
        }
    }
}

impl fmt::Display for RuleProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleProtocol::Tcp => f.write_str("tcp"),
            RuleProtocol::Udp => f.write_str("udp"),
            RuleProtocol::All => f.write_str("all"),
            RuleProtocol::Other(p) => f.write_str(p),
        }
    }
}

/// Inclusive port range `[min, max]`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            min: port,
            max: port,
        }
    }

    /// Builds a range, rejecting port 0 and inverted bounds.
    pub fn new(min: u16, max: u16) -> Result<Self, String> {
        let (min, max) = crate::validators::validate_port_range(min, max)?;
        Ok(Self { min, max })
    }

    pub fn contains(&self, port: u16) -> bool {
        self.min <= port && port <= self.max
    }

    pub fn is_single(&self) -> bool {
        self.min == self.max
    }

    /// Number of ports in the range
    pub fn len(&self) -> u32 {
        u32::from(self.max) - u32::from(self.min) + 1
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

/// A desired `(port, protocol)` pair
///
/// Serialized as `"<port>/<protocol>"` (e.g. `"443/tcp"`) so configuration
/// files stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    /// Creates a spec, rejecting port 0.
    pub fn new(port: u16, protocol: Protocol) -> Result<Self, String> {
        let port = crate::validators::validate_port(port)?;
        Ok(Self { port, protocol })
    }

    pub const fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub const fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl FromStr for PortSpec {
    type Err = String;

    /// Parses `"80/tcp"`, `"53/udp"` or a bare `"22"` (TCP).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (port, protocol) = match s.split_once('/') {
            Some((port, proto)) => {
                let protocol = proto
                    .parse::<Protocol>()
                    .map_err(|_| format!("Unknown protocol '{proto}' (use tcp or udp)"))?;
                (port, protocol)
            }
            None => (s, Protocol::Tcp),
        };
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("Invalid port '{port}'"))?;
        Self::new(port, protocol)
    }
}

impl TryFrom<String> for PortSpec {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortSpec> for String {
    fn from(spec: PortSpec) -> Self {
        spec.to_string()
    }
}

/// The set of ports a cycle wants reachable
///
/// Recomputed from scratch every cycle. Backed by a `BTreeSet` so equal
/// specs coalesce and iteration order is stable for reports and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredPortSet {
    specs: BTreeSet<PortSpec>,
}

impl DesiredPortSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a spec; returns `false` if it was already present.
    pub fn insert(&mut self, spec: PortSpec) -> bool {
        self.specs.insert(spec)
    }

    pub fn extend(&mut self, specs: impl IntoIterator<Item = PortSpec>) {
        self.specs.extend(specs);
    }

    pub fn contains(&self, spec: &PortSpec) -> bool {
        self.specs.contains(spec)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortSpec> {
        self.specs.iter()
    }
}

impl FromIterator<PortSpec> for DesiredPortSet {
    fn from_iter<I: IntoIterator<Item = PortSpec>>(iter: I) -> Self {
        Self {
            specs: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a DesiredPortSet {
    type Item = &'a PortSpec;
    type IntoIter = std::collections::btree_set::Iter<'a, PortSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.specs.iter()
    }
}

/// Traffic direction a rule governs
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    #[strum(serialize = "ingress")]
    Ingress,
    #[strum(serialize = "egress")]
    Egress,
}

/// The only endpoint that counts as "anyone"
pub const UNIVERSAL_CIDR: &str = "0.0.0.0/0";

/// Source (ingress) or destination (egress) of a rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Cidr(IpNetwork),
    /// Non-CIDR endpoint such as a cloud service label
    Other(String),
}

impl Endpoint {
    /// `0.0.0.0/0`
    pub fn any() -> Self {
        Self::parse(UNIVERSAL_CIDR)
    }

    /// Parses a CIDR, keeping unparseable text as an opaque endpoint.
    pub fn parse(text: &str) -> Self {
        text.parse::<IpNetwork>()
            .map_or_else(|_| Endpoint::Other(text.to_string()), Endpoint::Cidr)
    }

    /// True only for the IPv4 universal CIDR `0.0.0.0/0`.
    pub fn is_universal(&self) -> bool {
        matches!(self, Endpoint::Cidr(IpNetwork::V4(net)) if net.prefix() == 0)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Cidr(net) => write!(f, "{net}"),
            Endpoint::Other(label) => f.write_str(label),
        }
    }
}

/// Store-specific identity of a rule
#[derive(Debug, Clone, PartialEq)]
pub enum RawRule {
    /// iptables rule specification after `-A <chain>`, tokenized
    Local { spec: Vec<String> },
    /// Cloud rule exactly as returned by the management API
    Cloud { json: serde_json::Value },
    /// A rule this cycle intends to create
    Proposed,
}

/// One rule in either store
#[derive(Debug, Clone, PartialEq)]
pub struct RuleRecord {
    pub scope: Scope,
    /// Source for ingress rules, destination for egress rules
    pub endpoint: Endpoint,
    pub protocol: RuleProtocol,
    /// Destination port restriction; `None` means every port
    pub ports: Option<PortRange>,
    /// Source port restriction; such rules never count as coverage
    pub source_ports: Option<PortRange>,
    /// Cloud stateless flag (always `false` for local rules)
    pub stateless: bool,
    pub raw: RawRule,
}

impl RuleRecord {
    /// The rule this system proposes for a missing spec.
    pub fn proposed(spec: PortSpec, scope: Scope) -> Self {
        Self {
            scope,
            endpoint: Endpoint::any(),
            protocol: spec.protocol.into(),
            ports: Some(PortRange::single(spec.port)),
            source_ports: None,
            stateless: false,
            raw: RawRule::Proposed,
        }
    }

    /// Short human-readable form used in reports and prompts
    pub fn describe(&self) -> String {
        let ports = self
            .ports
            .map_or_else(|| "all ports".to_string(), |p| format!("port {p}"));
        let direction = match self.scope {
            Scope::Ingress => "from",
            Scope::Egress => "to",
        };
        format!(
            "{} {} {} {} {}",
            self.scope, self.protocol, ports, direction, self.endpoint
        )
    }
}

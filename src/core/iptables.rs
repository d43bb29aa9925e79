//! Local filter store: a dedicated iptables chain
//!
//! portsync owns one chain (default `PORTSYNC`) and jumps to it from the
//! parent chain (default `INPUT`). Rules are read back with `iptables -S`,
//! tokenized by a small lexer and turned into [`RuleRecord`]s here; nothing
//! past this module ever sees iptables text.
//!
//! The live chain listing is the source of truth. There is no state file:
//! a rule deleted by hand is simply re-added on the next cycle.

use crate::core::error::{Error, IptablesErrorPattern, Result};
use crate::core::firewall::{
    Endpoint, PortRange, PortSpec, RawRule, RuleProtocol, RuleRecord, Scope,
};
use crate::core::runner::{CommandRunner, Invocation, Program, run_with_retry};
use crate::elevation::PrivilegedProgram;
use logos::Logos;
use std::path::PathBuf;
use tracing::{debug, info, warn};

const STORE: &str = "local filter";

/// Comment prefix on every rule portsync adds
pub const COMMENT_PREFIX: &str = "portsync";

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    #[regex(r#""([^"\\]|\\.)*""#, |lex| unquote(lex.slice()))]
    Quoted(String),

    #[regex(r#"[^ \t\r\n"]+"#, |lex| lex.slice().to_string())]
    Word(String),
}

fn unquote(text: &str) -> String {
    let inner = &text[1..text.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Splits one `iptables -S` line into arguments, honoring quotes.
fn tokenize(line: &str) -> Result<Vec<String>> {
    Token::lexer(line)
        .map(|token| match token {
            Ok(Token::Quoted(s) | Token::Word(s)) => Ok(s),
            Err(()) => Err(Error::InvalidRuleData {
                store: STORE.to_string(),
                reason: format!("unterminated quote in '{line}'"),
            }),
        })
        .collect()
}

/// One `-A <chain> ...` line
#[derive(Debug, Clone, PartialEq, Eq)]
struct AppendLine {
    chain: String,
    spec: Vec<String>,
}

/// Parsed `iptables -S <chain>` output
#[derive(Debug, Default)]
struct ChainDump {
    declared: bool,
    rules: Vec<AppendLine>,
}

fn parse_dump(text: &str, chain: &str) -> Result<ChainDump> {
    let mut dump = ChainDump::default();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let tokens = tokenize(line)?;
        match tokens.as_slice() {
            [flag, name, ..] if (flag == "-N" || flag == "-P") && name == chain => {
                dump.declared = true;
            }
            [flag, name, rest @ ..] if flag == "-A" => {
                dump.rules.push(AppendLine {
                    chain: name.clone(),
                    spec: rest.to_vec(),
                });
            }
            _ => debug!("Ignoring iptables line: {line}"),
        }
    }
    Ok(dump)
}

/// Matches pulled out of one rule specification
#[derive(Debug, Default)]
struct Matches {
    protocol: Option<String>,
    source: Option<String>,
    dports: Vec<String>,
    sports: Vec<String>,
    target: Option<String>,
    /// Anything that narrows the rule beyond protocol/source/ports
    qualified: bool,
}

fn parse_matches(spec: &[String]) -> Matches {
    let mut m = Matches::default();
    let mut iter = spec.iter();
    while let Some(token) = iter.next() {
        match token.as_str() {
            "!" => m.qualified = true,
            "-p" | "--protocol" => m.protocol = iter.next().cloned(),
            "-s" | "--source" => m.source = iter.next().cloned(),
            "--dport" | "--destination-port" => m.dports.extend(iter.next().cloned()),
            "--dports" | "--destination-ports" => {
                if let Some(list) = iter.next() {
                    m.dports.extend(list.split(',').map(str::to_string));
                }
            }
            "--sport" | "--source-port" => m.sports.extend(iter.next().cloned()),
            "--sports" | "--source-ports" => {
                if let Some(list) = iter.next() {
                    m.sports.extend(list.split(',').map(str::to_string));
                }
            }
            "-j" | "--jump" => m.target = iter.next().cloned(),
            // Module loads and comments don't narrow the match
            "-m" | "--match" | "--comment" | "--reject-with" => {
                iter.next();
            }
            "--ctstate" | "--state" => {
                // NEW is how people spell "new connections to this port"
                if iter.next().is_some_and(|s| s != "NEW") {
                    m.qualified = true;
                }
            }
            _ => m.qualified = true,
        }
    }
    m
}

/// Parses `80`, `8000:8010`, `8000:` (to 65535) or `:1024` (from 1).
fn parse_port_range(text: &str) -> Option<PortRange> {
    match text.split_once(':') {
        Some((min, max)) => {
            let min = if min.is_empty() { 1 } else { min.parse().ok()? };
            let max = if max.is_empty() { 65535 } else { max.parse().ok()? };
            PortRange::new(min, max).ok()
        }
        None => text.parse().ok().and_then(|p| PortRange::new(p, p).ok()),
    }
}

fn parse_protocol(text: Option<&str>) -> RuleProtocol {
    match text.map(str::to_lowercase).as_deref() {
        None | Some("all" | "0") => RuleProtocol::All,
        Some("tcp" | "6") => RuleProtocol::Tcp,
        Some("udp" | "17") => RuleProtocol::Udp,
        Some(other) => RuleProtocol::Other(other.to_string()),
    }
}

/// Converts one rule specification into records.
///
/// Returns an empty list for rules that are not plain ACCEPTs (other
/// targets, negations, interface or state qualifiers); those can never
/// stand in for a desired port. A multiport rule yields one record per
/// port element, all sharing the same raw specification.
fn records_from_spec(spec: &[String]) -> Result<Vec<RuleRecord>> {
    let m = parse_matches(spec);

    if m.target.as_deref() != Some("ACCEPT") || m.qualified {
        debug!("Skipping non-coverage rule: {}", spec.join(" "));
        return Ok(Vec::new());
    }

    let invalid = |what: &str, value: &str| Error::InvalidRuleData {
        store: STORE.to_string(),
        reason: format!("invalid {what} '{value}' in '{}'", spec.join(" ")),
    };

    let endpoint = m
        .source
        .as_deref()
        .map_or_else(Endpoint::any, Endpoint::parse);

    // Any source port match disqualifies coverage; the first element records it
    let source_ports = m
        .sports
        .first()
        .map(|text| parse_port_range(text).ok_or_else(|| invalid("source port", text.as_str())))
        .transpose()?;

    let protocol = parse_protocol(m.protocol.as_deref());
    let raw = RawRule::Local {
        spec: spec.to_vec(),
    };

    let base = RuleRecord {
        scope: Scope::Ingress,
        endpoint,
        protocol,
        ports: None,
        source_ports,
        stateless: false,
        raw,
    };

    if m.dports.is_empty() {
        return Ok(vec![base]);
    }

    m.dports
        .iter()
        .map(|text| {
            let range = parse_port_range(text).ok_or_else(|| invalid("port", text.as_str()))?;
            Ok(RuleRecord {
                ports: Some(range),
                ..base.clone()
            })
        })
        .collect()
}

/// Whether a parent-chain rule is a catch-all deny (`-j REJECT`/`-j DROP`
/// with nothing else but reject options)
fn is_default_deny(spec: &[String]) -> bool {
    let mut iter = spec.iter();
    let mut target = None;
    while let Some(token) = iter.next() {
        match token.as_str() {
            "-j" | "--jump" => target = iter.next().map(String::as_str),
            "--reject-with" => {
                iter.next();
            }
            _ => return false,
        }
    }
    matches!(target, Some("REJECT" | "DROP"))
}

fn jumps_to(spec: &[String], chain: &str) -> bool {
    spec.windows(2)
        .any(|w| (w[0] == "-j" || w[0] == "--jump") && w[1] == chain)
}

/// The rule arguments portsync uses for a spec (everything after `-A <chain>`)
pub fn rule_args(spec: PortSpec) -> Vec<String> {
    let proto = spec.protocol.as_str();
    let comment = crate::validators::sanitize_comment(&format!("{COMMENT_PREFIX}:{spec}"));
    vec![
        "-p".into(),
        proto.into(),
        "-m".into(),
        proto.into(),
        "--dport".into(),
        spec.port.to_string(),
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        comment,
        "-j".into(),
        "ACCEPT".into(),
    ]
}

/// One `-A` line of the dedicated chain
#[derive(Debug, Clone, PartialEq)]
pub struct ChainEntry {
    pub spec: Vec<String>,
    /// Empty for rules that never count as coverage; several for multiport
    pub records: Vec<RuleRecord>,
}

/// Live contents of the dedicated chain
#[derive(Debug, Clone, Default)]
pub struct ChainListing {
    pub exists: bool,
    pub entries: Vec<ChainEntry>,
}

impl ChainListing {
    /// Every coverage record, in chain order
    pub fn rules(&self) -> Vec<RuleRecord> {
        self.entries
            .iter()
            .flat_map(|e| e.records.iter().cloned())
            .collect()
    }
}

/// Result of [`LocalFilter::add_rule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyPresent,
}

/// Result of [`LocalFilter::ensure_hooked`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    AlreadyHooked,
    /// Inserted before the parent chain's default-deny rule (1-based position)
    Inserted(usize),
    Appended,
}

/// Result of [`LocalFilter::persist`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Saved(&'static str),
    Failed(String),
}

/// Adapter for the dedicated iptables chain
pub struct LocalFilter<'a, R> {
    runner: &'a R,
    chain: String,
    parent: String,
    retries: u32,
    persist_path: PathBuf,
}

impl<'a, R: CommandRunner> LocalFilter<'a, R> {
    /// Creates the adapter after validating both chain names.
    pub fn new(
        runner: &'a R,
        chain: &str,
        parent: &str,
        retries: u32,
        persist_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let chain =
            crate::validators::validate_chain_name(chain).map_err(|e| Error::config("chain", e))?;
        let parent = crate::validators::validate_chain_name(parent)
            .map_err(|e| Error::config("parent_chain", e))?;
        if chain == parent {
            return Err(Error::config("chain", "must differ from parent_chain"));
        }
        Ok(Self {
            runner,
            chain,
            parent,
            retries,
            persist_path: persist_path.into(),
        })
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    fn unreachable(&self, e: &Error) -> Error {
        let detail = match e {
            Error::Command {
                stderr: Some(stderr),
                ..
            } if !stderr.is_empty() => IptablesErrorPattern::match_error(stderr).user_message,
            other => other.to_string(),
        };
        Error::StoreUnreachable {
            store: STORE.to_string(),
            reason: detail,
        }
    }

    async fn dump(&self, chain: &str) -> Result<Option<ChainDump>> {
        let inv = Invocation::new(Program::IPTABLES, ["-S", chain]);
        match run_with_retry(self.runner, &inv, self.retries, Error::is_transient).await {
            Ok(output) => parse_dump(&output.stdout, chain).map(Some),
            Err(Error::Command {
                stderr: Some(stderr),
                ..
            }) if stderr.contains("No chain/target/match by that name") => Ok(None),
            Err(e) => Err(self.unreachable(&e)),
        }
    }

    /// Lists the dedicated chain. A missing chain is an empty listing.
    pub async fn list_rules(&self) -> Result<ChainListing> {
        let Some(dump) = self.dump(&self.chain).await? else {
            info!("Chain {} does not exist yet", self.chain);
            return Ok(ChainListing::default());
        };

        let exists = dump.declared || !dump.rules.is_empty();
        let entries = dump
            .rules
            .into_iter()
            .filter(|l| l.chain == self.chain)
            .map(|line| {
                Ok(ChainEntry {
                    records: records_from_spec(&line.spec)?,
                    spec: line.spec,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Chain {} has {} rule(s)", self.chain, entries.len());
        Ok(ChainListing { exists, entries })
    }

    async fn ensure_chain(&self, listing: &mut ChainListing) -> Result<()> {
        if listing.exists {
            return Ok(());
        }
        info!("Creating chain {}", self.chain);
        let inv = Invocation::new(Program::IPTABLES, ["-N", self.chain.as_str()]);
        match run_with_retry(self.runner, &inv, self.retries, Error::is_transient).await {
            Ok(_) => {}
            // Created out-of-band since we listed
            Err(Error::Command {
                stderr: Some(stderr),
                ..
            }) if stderr.contains("Chain already exists") => {}
            Err(e) => return Err(self.unreachable(&e)),
        }
        listing.exists = true;
        Ok(())
    }

    /// Adds an ACCEPT rule for `spec` unless the listing already holds an
    /// identical one. Creates the chain on first write. Execution failures
    /// are retried once before being reported.
    pub async fn add_rule(&self, spec: PortSpec, listing: &mut ChainListing) -> Result<AddOutcome> {
        let identical = RuleRecord::proposed(spec, Scope::Ingress);
        if listing.entries.iter().flat_map(|e| &e.records).any(|r| {
            r.endpoint == identical.endpoint
                && r.protocol == identical.protocol
                && r.ports == identical.ports
                && r.source_ports.is_none()
        }) {
            debug!("Rule for {spec} already present in {}", self.chain);
            return Ok(AddOutcome::AlreadyPresent);
        }

        self.ensure_chain(listing).await?;

        let args = rule_args(spec);
        let mut full = vec!["-A".to_string(), self.chain.clone()];
        full.extend(args.iter().cloned());
        let inv = Invocation::new(Program::IPTABLES, full);

        run_with_retry(self.runner, &inv, self.retries, |_| true).await?;
        info!("Added {spec} to {}", self.chain);

        listing.entries.push(ChainEntry {
            records: vec![RuleRecord {
                raw: RawRule::Local { spec: args.clone() },
                ..identical
            }],
            spec: args,
        });
        Ok(AddOutcome::Added)
    }

    /// Removes one rule by its raw specification.
    pub async fn remove_rule(&self, rule: &RuleRecord) -> Result<()> {
        let RawRule::Local { spec } = &rule.raw else {
            return Err(Error::Internal(
                "cannot remove a rule that did not come from the local chain".to_string(),
            ));
        };
        let mut args = vec!["-D".to_string(), self.chain.clone()];
        args.extend(spec.iter().cloned());
        let inv = Invocation::new(Program::IPTABLES, args);
        run_with_retry(self.runner, &inv, self.retries, Error::is_transient)
            .await
            .map_err(|e| Error::ApplyRejected {
                store: STORE.to_string(),
                cause: e.to_string(),
            })?;
        info!("Removed '{}' from {}", spec.join(" "), self.chain);
        Ok(())
    }

    async fn parent_rules(&self) -> Result<Vec<Vec<String>>> {
        let parent = self.dump(&self.parent).await?.ok_or_else(|| Error::StoreUnreachable {
            store: STORE.to_string(),
            reason: format!("parent chain {} does not exist", self.parent),
        })?;
        Ok(parent
            .rules
            .into_iter()
            .filter(|l| l.chain == self.parent)
            .map(|l| l.spec)
            .collect())
    }

    /// Whether the parent chain already jumps to the dedicated chain.
    pub async fn is_hooked(&self) -> Result<bool> {
        Ok(self
            .parent_rules()
            .await?
            .iter()
            .any(|spec| jumps_to(spec, &self.chain)))
    }

    /// Makes sure the parent chain jumps to the dedicated chain, ahead of
    /// any catch-all deny rule.
    pub async fn ensure_hooked(&self, listing: &mut ChainListing) -> Result<HookOutcome> {
        self.ensure_chain(listing).await?;

        let rules = self.parent_rules().await?;
        if rules.iter().any(|spec| jumps_to(spec, &self.chain)) {
            return Ok(HookOutcome::AlreadyHooked);
        }

        let deny_position = rules
            .iter()
            .position(|spec| is_default_deny(spec))
            .map(|idx| idx + 1);

        let (args, outcome) = match deny_position {
            Some(pos) => (
                vec![
                    "-I".to_string(),
                    self.parent.clone(),
                    pos.to_string(),
                    "-j".to_string(),
                    self.chain.clone(),
                ],
                HookOutcome::Inserted(pos),
            ),
            None => (
                vec![
                    "-A".to_string(),
                    self.parent.clone(),
                    "-j".to_string(),
                    self.chain.clone(),
                ],
                HookOutcome::Appended,
            ),
        };

        let inv = Invocation::new(Program::IPTABLES, args);
        run_with_retry(self.runner, &inv, self.retries, |_| true)
            .await
            .map_err(|e| self.unreachable(&e))?;
        info!("Hooked {} from {}: {:?}", self.chain, self.parent, outcome);
        Ok(outcome)
    }

    /// Saves the running ruleset so it survives a reboot. Never fails the
    /// cycle: the in-kernel rules are active either way.
    pub async fn persist(&self) -> PersistOutcome {
        let helper = Invocation::new(
            Program::Privileged(PrivilegedProgram::NetfilterPersistent),
            ["save"],
        );
        match run_with_retry(self.runner, &helper, self.retries, Error::is_transient).await {
            Ok(_) => return PersistOutcome::Saved("netfilter-persistent"),
            Err(e) => debug!("netfilter-persistent unavailable ({e}), falling back to iptables-save"),
        }

        match self.save_rules_file().await {
            Ok(()) => PersistOutcome::Saved("iptables-save"),
            Err(e) => {
                warn!("Failed to persist iptables rules: {e}");
                PersistOutcome::Failed(e.to_string())
            }
        }
    }

    async fn save_rules_file(&self) -> Result<()> {
        use std::io::Write;

        let save = Invocation::new(
            Program::Privileged(PrivilegedProgram::IptablesSave),
            Vec::<String>::new(),
        );
        let dump = run_with_retry(self.runner, &save, self.retries, Error::is_transient).await?;
        if dump.stdout.trim().is_empty() {
            return Err(Error::Internal("iptables-save produced no output".to_string()));
        }

        let mut temp = tempfile::NamedTempFile::new()?;
        temp.write_all(dump.stdout.as_bytes())?;
        temp.as_file().sync_all()?;

        let source = temp.path().to_string_lossy().into_owned();
        let target = self.persist_path.to_string_lossy().into_owned();
        let install = Invocation::new(
            Program::Privileged(PrivilegedProgram::Install),
            ["-D", "-m", "600", source.as_str(), target.as_str()],
        );
        run_with_retry(self.runner, &install, self.retries, Error::is_transient).await?;
        info!("Saved iptables rules to {target}");
        Ok(())
    }
}

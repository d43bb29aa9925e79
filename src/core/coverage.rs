//! Coverage analysis: does an existing rule already permit a desired port?
//!
//! A rule covers a [`PortSpec`] only when all of the following hold, checked
//! in this order:
//!
//! 1. Its endpoint is the universal CIDR `0.0.0.0/0`. Narrowly scoped rules
//!    written by people or other tooling never count.
//! 2. Its protocol equals the desired protocol, **or** it is the `all`
//!    wildcard *and* carries no port restriction. A wildcard rule that
//!    restricts ports is not blanket coverage.
//! 3. For an exact protocol match with a port range, the port lies inside
//!    `[min, max]`.
//!
//! Rules that restrict the source port never cover anything.
//!
//! Everything here is pure; adapters supply the rules, the reconciler acts
//! on the results.

use crate::core::firewall::{DesiredPortSet, PortSpec, RuleProtocol, RuleRecord, Scope};

/// Coverage verdict for one desired spec against one store
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageResult {
    pub spec: PortSpec,
    pub covered: bool,
    pub matching_rule: Option<RuleRecord>,
}

/// Whether `rule` already permits traffic for `spec`.
pub fn is_covering(rule: &RuleRecord, spec: PortSpec) -> bool {
    if !rule.endpoint.is_universal() || rule.source_ports.is_some() {
        return false;
    }

    if rule.protocol.is(spec.protocol) {
        return rule.ports.is_none_or(|range| range.contains(spec.port));
    }

    rule.protocol == RuleProtocol::All && rule.ports.is_none()
}

/// Checks one spec against every rule of one scope.
pub fn analyze(spec: PortSpec, rules: &[RuleRecord], scope: Scope) -> CoverageResult {
    let matching_rule = rules
        .iter()
        .filter(|r| r.scope == scope)
        .find(|r| is_covering(r, spec))
        .cloned();

    CoverageResult {
        spec,
        covered: matching_rule.is_some(),
        matching_rule,
    }
}

/// Coverage of a whole desired set against one scope of a store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoveragePlan {
    pub covered: Vec<CoverageResult>,
    pub missing: Vec<PortSpec>,
}

impl CoveragePlan {
    pub fn is_converged(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Splits the desired set into covered specs and add-candidates.
pub fn plan(desired: &DesiredPortSet, rules: &[RuleRecord], scope: Scope) -> CoveragePlan {
    let mut plan = CoveragePlan::default();
    for spec in desired {
        let result = analyze(*spec, rules, scope);
        if result.covered {
            plan.covered.push(result);
        } else {
            plan.missing.push(*spec);
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::firewall::{Endpoint, PortRange, RawRule};

    fn rule(protocol: RuleProtocol, ports: Option<(u16, u16)>, endpoint: &str) -> RuleRecord {
        RuleRecord {
            scope: Scope::Ingress,
            endpoint: Endpoint::parse(endpoint),
            protocol,
            ports: ports.map(|(min, max)| PortRange { min, max }),
            source_ports: None,
            stateless: false,
            raw: RawRule::Proposed,
        }
    }

    #[test]
    fn test_exact_port_match() {
        let r = rule(RuleProtocol::Tcp, Some((22, 22)), "0.0.0.0/0");
        assert!(is_covering(&r, PortSpec::tcp(22)));
        assert!(!is_covering(&r, PortSpec::tcp(23)));
        assert!(!is_covering(&r, PortSpec::udp(22)));
    }

    #[test]
    fn test_range_containment() {
        let r = rule(RuleProtocol::Tcp, Some((8000, 8010)), "0.0.0.0/0");
        assert!(is_covering(&r, PortSpec::tcp(8005)));
        assert!(is_covering(&r, PortSpec::tcp(8000)));
        assert!(is_covering(&r, PortSpec::tcp(8010)));
        assert!(!is_covering(&r, PortSpec::tcp(8011)));
    }

    #[test]
    fn test_protocol_without_ports_covers_all_ports() {
        let r = rule(RuleProtocol::Udp, None, "0.0.0.0/0");
        assert!(is_covering(&r, PortSpec::udp(53)));
        assert!(!is_covering(&r, PortSpec::tcp(53)));
    }

    #[test]
    fn test_unrestricted_wildcard_covers_everything() {
        let r = rule(RuleProtocol::All, None, "0.0.0.0/0");
        assert!(is_covering(&r, PortSpec::tcp(443)));
        assert!(is_covering(&r, PortSpec::udp(51820)));
    }

    #[test]
    fn test_restricted_wildcard_is_not_blanket_coverage() {
        let r = rule(RuleProtocol::All, Some((8000, 8010)), "0.0.0.0/0");
        assert!(!is_covering(&r, PortSpec::tcp(9000)));
        // Not even inside its own range: wildcard-with-range is ambiguous
        assert!(!is_covering(&r, PortSpec::tcp(8005)));
    }

    #[test]
    fn test_scoped_source_never_covers() {
        let r = rule(RuleProtocol::Tcp, Some((22, 22)), "10.0.0.0/8");
        assert!(!is_covering(&r, PortSpec::tcp(22)));
        let r = rule(RuleProtocol::All, None, "192.168.0.0/16");
        assert!(!is_covering(&r, PortSpec::tcp(22)));
        let r = rule(RuleProtocol::All, None, "all-iad-services-in-oracle-services-network");
        assert!(!is_covering(&r, PortSpec::tcp(22)));
    }

    #[test]
    fn test_source_port_restriction_never_covers() {
        let mut r = rule(RuleProtocol::Tcp, None, "0.0.0.0/0");
        r.source_ports = Some(PortRange::single(1024));
        assert!(!is_covering(&r, PortSpec::tcp(80)));
    }

    #[test]
    fn test_other_protocol_never_covers() {
        let r = rule(RuleProtocol::Other("1".into()), None, "0.0.0.0/0");
        assert!(!is_covering(&r, PortSpec::tcp(80)));
    }

    #[test]
    fn test_analyze_respects_scope() {
        let mut egress = rule(RuleProtocol::All, None, "0.0.0.0/0");
        egress.scope = Scope::Egress;
        let rules = vec![egress];

        assert!(!analyze(PortSpec::tcp(443), &rules, Scope::Ingress).covered);
        let result = analyze(PortSpec::tcp(443), &rules, Scope::Egress);
        assert!(result.covered);
        assert_eq!(result.matching_rule.unwrap().protocol, RuleProtocol::All);
    }

    #[test]
    fn test_plan_scenario_two_missing() {
        let desired: DesiredPortSet = [PortSpec::tcp(22), PortSpec::tcp(80), PortSpec::tcp(8080)]
            .into_iter()
            .collect();
        let rules = vec![rule(RuleProtocol::Tcp, Some((22, 22)), "0.0.0.0/0")];

        let plan = plan(&desired, &rules, Scope::Ingress);
        assert_eq!(plan.missing, vec![PortSpec::tcp(80), PortSpec::tcp(8080)]);
        assert_eq!(plan.covered.len(), 1);
        assert_eq!(plan.covered[0].spec, PortSpec::tcp(22));
        assert!(!plan.is_converged());
    }
}

//! Selection engine - picks the best eligible candidate per address family
//!
//! `evaluate` is a pure function of the state model and the policy; it is
//! recomputed from scratch on every relevant change and never patched.

use crate::policy::{PriorityPolicy, Rank};
use crate::state::StateModel;
use crate::types::Candidate;
use defaultconf_types::AddressFamily;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

/// Knobs that affect eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionOptions {
    /// Require the gateway to be on-link: inside an address prefix or a
    /// non-default route of the candidate's interface.
    pub require_reachable_gateway: bool,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self {
            require_reachable_gateway: true,
        }
    }
}

/// Why a candidate can or cannot be selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Eligibility {
    Eligible,
    /// Matched by a disabled selector
    Disabled,
    /// No link with the candidate's interface name
    LinkMissing,
    LinkDown,
    /// The candidate's source address is not configured on its link
    SourceAddressMissing,
    /// The gateway is not on-link
    GatewayUnreachable,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Eligibility::Eligible => "eligible",
            Eligibility::Disabled => "disabled",
            Eligibility::LinkMissing => "link missing",
            Eligibility::LinkDown => "link down",
            Eligibility::SourceAddressMissing => "source address missing",
            Eligibility::GatewayUnreachable => "gateway unreachable",
        };
        f.write_str(s)
    }
}

/// The selected candidate for one address family, or none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub family: AddressFamily,
    pub winner: Option<Candidate>,
}

impl Decision {
    pub fn none(family: AddressFamily) -> Self {
        Self {
            family,
            winner: None,
        }
    }

    pub fn is_none(&self) -> bool {
        self.winner.is_none()
    }

    pub fn gateway(&self) -> Option<IpAddr> {
        self.winner.as_ref().map(|c| c.gateway)
    }

    /// Same selected route target, ignoring registration versions.
    pub fn same_target(&self, other: &Decision) -> bool {
        match (&self.winner, &other.winner) {
            (Some(a), Some(b)) => a.same_target(b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.winner {
            Some(winner) => write!(f, "{}", winner),
            None => write!(f, "{} none", self.family),
        }
    }
}

/// A candidate with its rank and eligibility, as shown by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct RankedCandidate {
    pub candidate: Candidate,
    #[serde(serialize_with = "serialize_rank")]
    pub rank: Rank,
    pub eligibility: Eligibility,
}

fn serialize_rank<S: serde::Serializer>(rank: &Rank, serializer: S) -> Result<S::Ok, S::Error> {
    match rank {
        Rank::Ranked(index) => serializer.serialize_some(index),
        Rank::Unranked => serializer.serialize_none(),
    }
}

pub fn eligibility(
    state: &StateModel,
    options: &SelectionOptions,
    candidate: &Candidate,
) -> Eligibility {
    if state.is_disabled(candidate) {
        return Eligibility::Disabled;
    }
    let Some(link) = state.link_by_name(&candidate.interface) else {
        return Eligibility::LinkMissing;
    };
    if !link.up {
        return Eligibility::LinkDown;
    }
    if let Some(source) = &candidate.source {
        if !state.has_address(link.index, source) {
            return Eligibility::SourceAddressMissing;
        }
    }
    if options.require_reachable_gateway && !gateway_on_link(state, link.index, &candidate.gateway) {
        return Eligibility::GatewayUnreachable;
    }
    Eligibility::Eligible
}

fn gateway_on_link(state: &StateModel, index: u32, gateway: &IpAddr) -> bool {
    // Link-local gateways (router advertisements) are on-link by definition.
    if let IpAddr::V6(v6) = gateway {
        if v6.is_unicast_link_local() {
            return true;
        }
    }
    state.addresses_on(index).any(|a| a.prefix.contains(gateway))
        || state.routes_on(index).any(|r| r.destination.contains(gateway))
}

/// Computes the decision for one family.
pub fn evaluate(
    state: &StateModel,
    policy: &PriorityPolicy,
    options: &SelectionOptions,
    family: AddressFamily,
) -> Decision {
    let winner = state
        .candidates_for(family)
        .filter(|c| eligibility(state, options, c).is_eligible())
        .max_by(|a, b| policy.compare(a, b))
        .cloned();
    Decision { family, winner }
}

/// Every candidate of a family, best first, with eligibility.
pub fn ranked(
    state: &StateModel,
    policy: &PriorityPolicy,
    options: &SelectionOptions,
    family: AddressFamily,
) -> Vec<RankedCandidate> {
    let mut candidates: Vec<Candidate> = state.candidates_for(family).cloned().collect();
    policy.sort(&mut candidates);
    candidates
        .into_iter()
        .map(|candidate| RankedCandidate {
            rank: policy.rank(&candidate),
            eligibility: eligibility(state, options, &candidate),
            candidate,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Selector;
    use crate::types::{AddressState, KernelEvent, KernelRoute, LinkState};
    use defaultconf_types::ProtocolTag;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn candidate(protocol: ProtocolTag, link: &str, gw: &str, version: u64) -> Candidate {
        let gateway: IpAddr = gw.parse().unwrap();
        Candidate {
            protocol,
            family: AddressFamily::of(&gateway),
            interface: link.to_string(),
            gateway,
            source: None,
            version,
        }
    }

    fn state_with_link(index: u32, name: &str, up: bool, prefix: &str) -> StateModel {
        let mut state = StateModel::new(254);
        state.apply_event(&KernelEvent::LinkAdd(LinkState::new(index, name, up)));
        state.apply_event(&KernelEvent::AddressAdd(AddressState::new(
            index,
            prefix.parse().unwrap(),
        )));
        state
    }

    #[test]
    fn test_only_candidate_on_down_link_is_not_selected() {
        let mut state = state_with_link(2, "tmnet", false, "192.168.8.10/24");
        state.register_candidate(candidate(ProtocolTag::Dhcp, "tmnet", "192.168.8.1", 1));
        let decision = evaluate(
            &state,
            &PriorityPolicy::default(),
            &SelectionOptions::default(),
            AddressFamily::Inet,
        );
        assert!(decision.is_none());
    }

    #[test]
    fn test_source_address_gate() {
        let mut state = state_with_link(2, "tmnet", true, "192.168.8.10/24");
        let mut c = candidate(ProtocolTag::Static, "tmnet", "192.168.8.1", 1);
        c.source = Some("192.168.8.77".parse().unwrap());
        state.register_candidate(c.clone());
        let options = SelectionOptions::default();
        assert_eq!(eligibility(&state, &options, &c), Eligibility::SourceAddressMissing);

        c.source = Some("192.168.8.10".parse().unwrap());
        assert_eq!(eligibility(&state, &options, &c), Eligibility::Eligible);
    }

    #[test]
    fn test_gateway_reachability() {
        let mut state = state_with_link(2, "tmnet", true, "192.168.8.10/24");
        let far = candidate(ProtocolTag::Static, "tmnet", "172.16.0.1", 1);
        let options = SelectionOptions::default();
        assert_eq!(eligibility(&state, &options, &far), Eligibility::GatewayUnreachable);

        // Reachable through a connected route on the link
        state.apply_event(&KernelEvent::RouteAdd(KernelRoute {
            destination: "172.16.0.0/16".parse().unwrap(),
            gateway: None,
            oif: Some(2),
            table: 254,
            metric: 0,
        }));
        assert_eq!(eligibility(&state, &options, &far), Eligibility::Eligible);

        let lax = SelectionOptions {
            require_reachable_gateway: false,
        };
        let other = candidate(ProtocolTag::Static, "tmnet", "10.9.9.9", 1);
        assert_eq!(eligibility(&state, &lax, &other), Eligibility::Eligible);
    }

    #[test]
    fn test_link_local_gateway_is_on_link() {
        let state = state_with_link(4, "cltun", true, "2001:db8::2/64");
        let ra = candidate(ProtocolTag::Ra, "cltun", "fe80::1", 1);
        assert_eq!(eligibility(&state, &SelectionOptions::default(), &ra), Eligibility::Eligible);
    }

    #[test]
    fn test_disabled_candidate() {
        let mut state = state_with_link(2, "tmnet", true, "192.168.8.10/24");
        let c = candidate(ProtocolTag::Dhcp, "tmnet", "192.168.8.1", 1);
        state.register_candidate(c.clone());
        state.set_disabled(BTreeSet::from([Selector::new(
            None,
            Some("tmnet".to_string()),
            None,
        )]));
        assert_eq!(eligibility(&state, &SelectionOptions::default(), &c), Eligibility::Disabled);
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let mut state = state_with_link(2, "tmnet", true, "192.168.8.10/24");
        state.register_candidate(candidate(ProtocolTag::Dhcp, "tmnet", "192.168.8.1", 3));
        state.register_candidate(candidate(ProtocolTag::Static, "tmnet", "192.168.8.254", 3));
        let policy = PriorityPolicy::default();
        let options = SelectionOptions::default();
        let first = evaluate(&state, &policy, &options, AddressFamily::Inet);
        let second = evaluate(&state, &policy, &options, AddressFamily::Inet);
        assert_eq!(first, second);
        assert_eq!(first.winner.unwrap().protocol, ProtocolTag::Dhcp);
    }

    #[test]
    fn test_ranked_lists_ineligible_candidates() {
        let mut state = state_with_link(2, "tmnet", true, "192.168.8.10/24");
        state.register_candidate(candidate(ProtocolTag::Dhcp, "tmnet", "192.168.8.1", 1));
        state.register_candidate(candidate(ProtocolTag::Ppp, "ppp0", "10.64.0.1", 2));
        let list = ranked(
            &state,
            &PriorityPolicy::default(),
            &SelectionOptions::default(),
            AddressFamily::Inet,
        );
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].candidate.interface, "ppp0");
        assert_eq!(list[0].eligibility, Eligibility::LinkMissing);
        assert_eq!(list[1].eligibility, Eligibility::Eligible);
    }
}

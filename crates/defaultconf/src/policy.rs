//! Priority policy - ranks candidates against the administrator's rule list

use crate::types::Candidate;
use defaultconf_types::{AddressFamily, ProtocolTag};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Matches candidates on any combination of family, interface and protocol.
///
/// Unset fields match any value. Used for priority rules, for disabled
/// entries and for store queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Selector {
    #[serde(default, alias = "family", skip_serializing_if = "Option::is_none")]
    pub af: Option<AddressFamily>,
    #[serde(default, alias = "iface", alias = "interface", skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ProtocolTag>,
}

/// One entry of the ordered priority list.
pub type PriorityRule = Selector;

impl Selector {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn new(
        af: Option<AddressFamily>,
        link: Option<String>,
        protocol: Option<ProtocolTag>,
    ) -> Self {
        Self { af, link, protocol }
    }

    pub fn family(af: AddressFamily) -> Self {
        Self {
            af: Some(af),
            ..Self::default()
        }
    }

    /// Field-wise match against raw values.
    pub fn matches_fields(&self, af: AddressFamily, link: &str, protocol: &ProtocolTag) -> bool {
        self.af.is_none_or(|want| want == af)
            && self.link.as_deref().is_none_or(|want| want == link)
            && self.protocol.as_ref().is_none_or(|want| want == protocol)
    }

    pub fn matches(&self, candidate: &Candidate) -> bool {
        self.matches_fields(candidate.family, &candidate.interface, &candidate.protocol)
    }

    /// True if every candidate this selector matches is also matched by
    /// `other` (i.e. `other` is at least as broad on every set field).
    pub fn is_covered_by(&self, other: &Selector) -> bool {
        fn covered<T: PartialEq>(mine: &Option<T>, theirs: &Option<T>) -> bool {
            match (mine, theirs) {
                (_, None) => true,
                (Some(a), Some(b)) => a == b,
                (None, Some(_)) => false,
            }
        }
        covered(&self.af, &other.af)
            && covered(&self.link, &other.link)
            && covered(&self.protocol, &other.protocol)
    }

    pub fn is_wildcard(&self) -> bool {
        self.af.is_none() && self.link.is_none() && self.protocol.is_none()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let af = self.af.map(|af| af.to_string());
        let protocol = self.protocol.as_ref().map(|p| p.to_string());
        write!(
            f,
            "{{af: {}, link: {}, protocol: {}}}",
            af.as_deref().unwrap_or("*"),
            self.link.as_deref().unwrap_or("*"),
            protocol.as_deref().unwrap_or("*")
        )
    }
}

/// Position of a candidate in the priority list.
///
/// `Ranked(0)` is the best rank; `Unranked` sorts after every ranked value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Rank {
    Ranked(usize),
    Unranked,
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rank::Ranked(index) => write!(f, "rule#{}", index),
            Rank::Unranked => f.write_str("unranked"),
        }
    }
}

/// Immutable, ordered rule list.
///
/// Cheap to clone; a reload builds a new policy instead of mutating this one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityPolicy {
    rules: Arc<[PriorityRule]>,
}

impl PriorityPolicy {
    pub fn new(rules: Vec<PriorityRule>) -> Self {
        Self {
            rules: rules.into(),
        }
    }

    pub fn rules(&self) -> &[PriorityRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Index of the first matching rule.
    pub fn rank(&self, candidate: &Candidate) -> Rank {
        self.rules
            .iter()
            .position(|rule| rule.matches(candidate))
            .map_or(Rank::Unranked, Rank::Ranked)
    }

    /// Total order over candidates; `Greater` means `a` is preferred.
    ///
    /// Keys, most significant first: rank (lower index wins), registration
    /// version (higher wins), protocol tag (lexicographically smaller wins),
    /// then interface name and gateway so identical inputs always produce
    /// the same answer.
    pub fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        self.rank(b)
            .cmp(&self.rank(a))
            .then_with(|| a.version.cmp(&b.version))
            .then_with(|| b.protocol.cmp(&a.protocol))
            .then_with(|| b.interface.cmp(&a.interface))
            .then_with(|| b.gateway.cmp(&a.gateway))
    }

    /// Sorts candidates best-first.
    pub fn sort(&self, candidates: &mut [Candidate]) {
        candidates.sort_by(|a, b| self.compare(b, a));
    }
}

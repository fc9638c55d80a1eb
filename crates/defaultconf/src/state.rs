//! In-memory mirror of kernel link/address/route facts and registered
//! candidates
//!
//! The model is only ever mutated through the `apply_*` entry points (kernel
//! facts) and `register_candidate`/`withdraw_candidate` (protocol handlers).
//! Each entry point reports whether anything actually changed so duplicate
//! notifications do not cause re-evaluation.

use crate::policy::Selector;
use crate::types::{
    AddressState, Candidate, CandidateKey, IfIndex, KernelEvent, KernelRoute, KernelSnapshot,
    LinkState,
};
use defaultconf_types::AddressFamily;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tracing::{debug, trace};

/// Kernel local table; its host routes never make a gateway reachable.
const RT_TABLE_LOCAL: u32 = 255;

#[derive(Debug, Clone)]
pub struct StateModel {
    /// Routing table whose default routes we manage
    table: u32,
    links: BTreeMap<IfIndex, LinkState>,
    addresses: BTreeSet<AddressState>,
    /// Non-default routes bound to an interface, used for gateway reachability
    link_routes: BTreeSet<KernelRoute>,
    /// Default routes present in the managed table (RouteState)
    default_routes: BTreeMap<AddressFamily, BTreeSet<KernelRoute>>,
    candidates: BTreeMap<CandidateKey, Candidate>,
    disabled: BTreeSet<Selector>,
}

impl StateModel {
    pub fn new(table: u32) -> Self {
        Self {
            table,
            links: BTreeMap::new(),
            addresses: BTreeSet::new(),
            link_routes: BTreeSet::new(),
            default_routes: BTreeMap::new(),
            candidates: BTreeMap::new(),
            disabled: BTreeSet::new(),
        }
    }

    pub fn table(&self) -> u32 {
        self.table
    }

    /// Applies any kernel event, dispatching on its kind.
    pub fn apply_event(&mut self, event: &KernelEvent) -> bool {
        match event {
            KernelEvent::LinkAdd(_)
            | KernelEvent::LinkUp(_)
            | KernelEvent::LinkDown(_)
            | KernelEvent::LinkDelete { .. } => self.apply_link_event(event),
            KernelEvent::AddressAdd(_) | KernelEvent::AddressDelete(_) => {
                self.apply_address_event(event)
            }
            KernelEvent::RouteAdd(_) | KernelEvent::RouteChange(_) | KernelEvent::RouteDelete(_) => {
                self.apply_route_event(event)
            }
        }
    }

    pub fn apply_link_event(&mut self, event: &KernelEvent) -> bool {
        match event {
            KernelEvent::LinkAdd(link) | KernelEvent::LinkUp(link) | KernelEvent::LinkDown(link) => {
                let was_up = self.links.get(&link.index).is_some_and(|l| l.up);
                let changed = self.upsert_link(link.clone());
                if was_up && !link.up {
                    // The kernel flushes routes through a downed device
                    // without sending a deletion for each of them.
                    self.flush_routes_on(link.index);
                }
                changed
            }
            KernelEvent::LinkDelete { index } => {
                let Some(link) = self.links.remove(index) else {
                    return false;
                };
                debug!(index, name = ?link.name, "Link removed");
                self.addresses.retain(|a| a.index != *index);
                self.flush_routes_on(*index);
                true
            }
            _ => false,
        }
    }

    pub fn apply_address_event(&mut self, event: &KernelEvent) -> bool {
        match event {
            KernelEvent::AddressAdd(addr) => {
                self.ensure_link(addr.index);
                self.addresses.insert(*addr)
            }
            KernelEvent::AddressDelete(addr) => self.addresses.remove(addr),
            _ => false,
        }
    }

    pub fn apply_route_event(&mut self, event: &KernelEvent) -> bool {
        match event {
            KernelEvent::RouteAdd(route) => self.insert_route(*route, false),
            KernelEvent::RouteChange(route) => self.insert_route(*route, true),
            KernelEvent::RouteDelete(route) => self.remove_route(route),
            _ => false,
        }
    }

    /// Registers or replaces the candidate for its key. Returns the value it
    /// replaced, if any.
    pub fn register_candidate(&mut self, candidate: Candidate) -> Option<Candidate> {
        self.candidates.insert(candidate.key(), candidate)
    }

    pub fn withdraw_candidate(&mut self, key: &CandidateKey) -> Option<Candidate> {
        self.candidates.remove(key)
    }

    /// Replaces the whole disabled set; returns true if it differs.
    pub fn set_disabled(&mut self, disabled: BTreeSet<Selector>) -> bool {
        if self.disabled == disabled {
            return false;
        }
        self.disabled = disabled;
        true
    }

    pub fn is_disabled(&self, candidate: &Candidate) -> bool {
        self.disabled.iter().any(|s| s.matches(candidate))
    }

    pub fn disabled(&self) -> &BTreeSet<Selector> {
        &self.disabled
    }

    /// Replaces every kernel fact with a fresh dump. Candidates and the
    /// disabled set are kept.
    pub fn replace_kernel_snapshot(&mut self, snapshot: KernelSnapshot) -> bool {
        let mut fresh = StateModel::new(self.table);
        for link in snapshot.links {
            fresh.upsert_link(link);
        }
        for addr in snapshot.addresses {
            fresh.ensure_link(addr.index);
            fresh.addresses.insert(addr);
        }
        for route in snapshot.routes {
            fresh.insert_route(route, false);
        }

        let changed = fresh.links != self.links
            || fresh.addresses != self.addresses
            || fresh.link_routes != self.link_routes
            || fresh.default_routes != self.default_routes;
        self.links = fresh.links;
        self.addresses = fresh.addresses;
        self.link_routes = fresh.link_routes;
        self.default_routes = fresh.default_routes;
        changed
    }

    /// Replaces the RouteState of one family with what the kernel reports.
    pub fn resync_routes(&mut self, family: AddressFamily, routes: &[KernelRoute]) -> bool {
        let fresh: BTreeSet<KernelRoute> = routes
            .iter()
            .filter(|r| r.is_default() && r.family() == family && r.table == self.table)
            .copied()
            .collect();
        let current = self.default_routes.remove(&family).unwrap_or_default();
        let changed = current != fresh;
        if !fresh.is_empty() {
            self.default_routes.insert(family, fresh);
        }
        changed
    }

    /// Optimistic update after a successful install.
    pub fn record_installed(&mut self, route: KernelRoute) {
        self.insert_route(route, true);
    }

    /// Optimistic update after a successful withdrawal.
    pub fn record_withdrawn(&mut self, route: &KernelRoute) {
        self.remove_route(route);
    }

    pub fn link(&self, index: IfIndex) -> Option<&LinkState> {
        self.links.get(&index)
    }

    /// Candidates name their interface; placeholders never match.
    pub fn link_by_name(&self, name: &str) -> Option<&LinkState> {
        self.links
            .values()
            .find(|l| l.name.as_deref() == Some(name))
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkState> {
        self.links.values()
    }

    pub fn addresses_on(&self, index: IfIndex) -> impl Iterator<Item = &AddressState> {
        self.addresses.iter().filter(move |a| a.index == index)
    }

    pub fn has_address(&self, index: IfIndex, address: &IpAddr) -> bool {
        self.addresses_on(index).any(|a| a.address() == *address)
    }

    /// Non-default routes whose output interface is `index`.
    pub fn routes_on(&self, index: IfIndex) -> impl Iterator<Item = &KernelRoute> {
        self.link_routes
            .iter()
            .filter(move |r| r.oif == Some(index))
    }

    /// Default routes currently present in the managed table.
    pub fn default_routes(&self, family: AddressFamily) -> Vec<KernelRoute> {
        self.default_routes
            .get(&family)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.values()
    }

    pub fn candidates_for(&self, family: AddressFamily) -> impl Iterator<Item = &Candidate> {
        self.candidates.values().filter(move |c| c.family == family)
    }

    pub fn candidate(&self, key: &CandidateKey) -> Option<&Candidate> {
        self.candidates.get(key)
    }

    fn upsert_link(&mut self, link: LinkState) -> bool {
        match self.links.get_mut(&link.index) {
            Some(existing) if *existing == link => false,
            Some(existing) => {
                if existing.is_placeholder() {
                    debug!(index = link.index, name = ?link.name, "Placeholder link resolved");
                }
                *existing = link;
                true
            }
            None => {
                self.links.insert(link.index, link);
                true
            }
        }
    }

    /// Makes sure a link entry exists for an index referenced by an address
    /// or route; notifications may arrive before the link's own.
    fn ensure_link(&mut self, index: IfIndex) {
        self.links.entry(index).or_insert_with(|| {
            trace!(index, "Creating placeholder link");
            LinkState::placeholder(index)
        });
    }

    fn flush_routes_on(&mut self, index: IfIndex) {
        self.link_routes.retain(|r| r.oif != Some(index));
        for routes in self.default_routes.values_mut() {
            routes.retain(|r| r.oif != Some(index));
        }
        self.default_routes.retain(|_, routes| !routes.is_empty());
    }

    fn insert_route(&mut self, route: KernelRoute, replace: bool) -> bool {
        if let Some(oif) = route.oif {
            self.ensure_link(oif);
        }

        if !route.is_default() {
            if route.oif.is_none() || route.table == RT_TABLE_LOCAL {
                return false;
            }
            if replace {
                self.link_routes.retain(|r| {
                    !(r.destination == route.destination
                        && r.table == route.table
                        && r.metric == route.metric)
                });
            }
            return self.link_routes.insert(route);
        }

        if route.table != self.table {
            return false;
        }
        let routes = self.default_routes.entry(route.family()).or_default();
        if routes.contains(&route) {
            return false;
        }
        if replace {
            // A replace swaps the route sharing destination and metric.
            routes.retain(|r| r.metric != route.metric);
        }
        routes.insert(route)
    }

    fn remove_route(&mut self, route: &KernelRoute) -> bool {
        if !route.is_default() {
            return self.link_routes.remove(route);
        }
        if route.table != self.table {
            return false;
        }
        let family = route.family();
        let Some(routes) = self.default_routes.get_mut(&family) else {
            return false;
        };
        let before = routes.len();
        // Deletions may omit the output interface; match on what was given.
        routes.retain(|r| {
            !(r.metric == route.metric
                && route.gateway.is_none_or(|gw| r.gateway == Some(gw))
                && route.oif.is_none_or(|oif| r.oif == Some(oif)))
        });
        let changed = routes.len() != before;
        if routes.is_empty() {
            self.default_routes.remove(&family);
        }
        changed
    }
}

//! Shared fixtures for defaultconf integration tests

#![allow(dead_code)]

use defaultconf::{
    AddressFamily, AddressState, Candidate, DefaultconfError, Engine, EngineSettings, KernelError,
    KernelEvent, KernelRoute, LinkState, PriorityPolicy, ProtocolTag, Result, RouteChannel,
    Selector,
};
use std::collections::VecDeque;
use std::net::IpAddr;

pub const MAIN: u32 = 254;

/// A request as seen by the fake kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Add(KernelRoute),
    Replace(KernelRoute),
    Delete(KernelRoute),
    DumpRoutes(Option<AddressFamily>),
}

/// A failure to inject into the next mutating request or reopen.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// The kernel replies with this errno without applying the request
    Errno(i32),
    /// The socket fails
    Transport,
}

/// In-memory routing table implementing [`RouteChannel`].
#[derive(Debug, Default)]
pub struct FakeKernel {
    pub links: Vec<LinkState>,
    pub addresses: Vec<AddressState>,
    pub routes: Vec<KernelRoute>,
    pub requests: Vec<Request>,
    pub faults: VecDeque<Fault>,
    pub reopened: usize,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_link(mut self, index: u32, name: &str, up: bool, prefix: &str) -> Self {
        self.links.push(LinkState::new(index, name, up));
        self.addresses.push(AddressState::new(index, prefix.parse().unwrap()));
        self
    }

    pub fn fail_next(&mut self, fault: Fault) {
        self.faults.push_back(fault);
    }

    /// Default routes in `table`, in insertion order.
    pub fn defaults(&self, family: AddressFamily) -> Vec<KernelRoute> {
        self.routes
            .iter()
            .filter(|r| r.is_default() && r.family() == family && r.table == MAIN)
            .copied()
            .collect()
    }

    /// Mutating requests only.
    pub fn mutations(&self) -> Vec<Request> {
        self.requests
            .iter()
            .filter(|r| !matches!(r, Request::DumpRoutes(_)))
            .cloned()
            .collect()
    }

    fn check_fault(&mut self, operation: &'static str) -> Result<()> {
        match self.faults.pop_front() {
            None => Ok(()),
            Some(Fault::Errno(code)) => Err(DefaultconfError::Kernel {
                operation,
                error: KernelError::new(code),
            }),
            Some(Fault::Transport) => Err(DefaultconfError::Netlink("connection reset".to_string())),
        }
    }

    fn same_slot(a: &KernelRoute, b: &KernelRoute) -> bool {
        a.destination == b.destination && a.table == b.table && a.metric == b.metric
    }
}

impl RouteChannel for FakeKernel {
    fn dump_links(&mut self) -> Result<Vec<LinkState>> {
        Ok(self.links.clone())
    }

    fn dump_addresses(&mut self) -> Result<Vec<AddressState>> {
        Ok(self.addresses.clone())
    }

    fn dump_routes(&mut self, family: Option<AddressFamily>) -> Result<Vec<KernelRoute>> {
        self.requests.push(Request::DumpRoutes(family));
        Ok(self
            .routes
            .iter()
            .filter(|r| family.is_none_or(|f| r.family() == f))
            .copied()
            .collect())
    }

    fn add_route(&mut self, route: &KernelRoute) -> Result<()> {
        self.requests.push(Request::Add(*route));
        self.check_fault("add route")?;
        let route = &route.as_stored();
        if self.routes.iter().any(|r| Self::same_slot(r, route)) {
            return Err(DefaultconfError::Kernel {
                operation: "add route",
                error: KernelError::new(libc::EEXIST),
            });
        }
        self.routes.push(*route);
        Ok(())
    }

    fn replace_route(&mut self, route: &KernelRoute) -> Result<()> {
        self.requests.push(Request::Replace(*route));
        self.check_fault("replace route")?;
        let route = &route.as_stored();
        match self.routes.iter_mut().find(|r| Self::same_slot(r, route)) {
            Some(existing) => *existing = *route,
            None => self.routes.push(*route),
        }
        Ok(())
    }

    fn delete_route(&mut self, route: &KernelRoute) -> Result<()> {
        self.requests.push(Request::Delete(*route));
        self.check_fault("delete route")?;
        let route = &route.as_stored();
        let position = self.routes.iter().position(|r| {
            Self::same_slot(r, route)
                && route.gateway.is_none_or(|gw| r.gateway == Some(gw))
                && route.oif.is_none_or(|oif| r.oif == Some(oif))
        });
        match position {
            Some(index) => {
                self.routes.remove(index);
                Ok(())
            }
            None => Err(DefaultconfError::Kernel {
                operation: "delete route",
                error: KernelError::new(libc::ESRCH),
            }),
        }
    }

    /// Consumes the next fault, so a queued `Fault::Transport` makes the
    /// reopen fail too.
    fn reopen(&mut self) -> Result<()> {
        self.reopened += 1;
        self.check_fault("reopen")
    }
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn default_route(gateway: &str, oif: u32) -> KernelRoute {
    let gateway = ip(gateway);
    KernelRoute::default_via(AddressFamily::of(&gateway), gateway, Some(oif), MAIN, 0)
}

pub fn candidate(protocol: ProtocolTag, interface: &str, gateway: &str, version: u64) -> Candidate {
    let gateway = ip(gateway);
    Candidate {
        protocol,
        family: AddressFamily::of(&gateway),
        interface: interface.to_string(),
        gateway,
        source: None,
        version,
    }
}

/// `[{af: inet6, link: cltun}, {link: tmnet}]`
pub fn tunnel_first_policy() -> PriorityPolicy {
    PriorityPolicy::new(vec![
        Selector::new(Some(AddressFamily::Inet6), Some("cltun".to_string()), None),
        Selector::new(None, Some("tmnet".to_string()), None),
    ])
}

/// Two IPv4 uplinks and a dual-stack tunnel, all up.
pub fn dual_uplink_kernel() -> FakeKernel {
    let mut kernel = FakeKernel::new()
        .with_link(2, "tmnet", true, "10.0.0.5/24")
        .with_link(3, "eth1", true, "192.168.1.20/24")
        .with_link(4, "cltun", true, "2001:db8::5/64");
    kernel.addresses.push(AddressState::new(2, "2001:db8:1::5/64".parse().unwrap()));
    kernel
}

pub fn engine(kernel: FakeKernel, policy: PriorityPolicy) -> Engine<FakeKernel> {
    let mut engine = Engine::new(kernel, EngineSettings::default(), policy);
    engine.seed().unwrap();
    engine
}

pub fn link_down(index: u32, name: &str) -> KernelEvent {
    KernelEvent::LinkDown(LinkState::new(index, name, false))
}

pub fn link_up(index: u32, name: &str) -> KernelEvent {
    KernelEvent::LinkUp(LinkState::new(index, name, true))
}

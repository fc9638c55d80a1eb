//! Core types for default route selection
//!
//! Kernel facts (links, addresses, routes) are mirrored as plain owned values
//! decoded from netlink; candidates are the gateways registered by protocol
//! handlers.

use defaultconf_types::{AddressFamily, IpPrefix, ProtocolTag};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Kernel interface index (`ifindex`).
pub type IfIndex = u32;

/// A network interface as seen by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkState {
    pub index: IfIndex,
    /// Interface name; `None` for a placeholder created before the link
    /// notification arrived.
    pub name: Option<String>,
    /// IFF_UP
    pub up: bool,
}

impl LinkState {
    pub fn new(index: IfIndex, name: impl Into<String>, up: bool) -> Self {
        Self {
            index,
            name: Some(name.into()),
            up,
        }
    }

    /// A stand-in for a link we have only seen referenced by index.
    pub fn placeholder(index: IfIndex) -> Self {
        Self {
            index,
            name: None,
            up: false,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.name.is_none()
    }
}

/// An address configured on an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressState {
    pub index: IfIndex,
    /// Address with its prefix length, host bits kept (e.g. `10.0.0.5/24`).
    pub prefix: IpPrefix,
}

impl AddressState {
    pub fn new(index: IfIndex, prefix: IpPrefix) -> Self {
        Self { index, prefix }
    }

    pub fn family(&self) -> AddressFamily {
        self.prefix.family()
    }

    pub fn address(&self) -> IpAddr {
        *self.prefix.address()
    }
}

/// Metric the kernel gives an IPv6 route added without RTA_PRIORITY
pub const IP6_RT_PRIO_USER: u32 = 1024;

/// A route in the kernel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelRoute {
    pub destination: IpPrefix,
    pub gateway: Option<IpAddr>,
    /// Output interface
    pub oif: Option<IfIndex>,
    /// Routing table id
    pub table: u32,
    /// Route metric (RTA_PRIORITY)
    pub metric: u32,
}

impl KernelRoute {
    /// A default route through `gateway` on `oif`, carrying the metric the
    /// kernel will actually record for it.
    pub fn default_via(
        family: AddressFamily,
        gateway: IpAddr,
        oif: Option<IfIndex>,
        table: u32,
        metric: u32,
    ) -> Self {
        Self {
            destination: IpPrefix::default_route(family),
            gateway: Some(gateway),
            oif,
            table,
            metric: Self::kernel_metric(family, metric),
        }
    }

    /// Metric the kernel stores for a route requested with `metric`.
    /// IPv6 has no metric 0; it becomes `IP6_RT_PRIO_USER`.
    pub fn kernel_metric(family: AddressFamily, metric: u32) -> u32 {
        match (family, metric) {
            (AddressFamily::Inet6, 0) => IP6_RT_PRIO_USER,
            _ => metric,
        }
    }

    /// This route as the kernel would store it.
    pub fn as_stored(&self) -> Self {
        Self {
            metric: Self::kernel_metric(self.family(), self.metric),
            ..*self
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.destination.family()
    }

    pub fn is_default(&self) -> bool {
        self.destination.is_default()
    }

    /// True if this route forwards through `gateway` on `oif`. An unknown
    /// output interface on either side matches any interface.
    pub fn forwards_via(&self, gateway: &IpAddr, oif: Option<IfIndex>) -> bool {
        self.gateway.as_ref() == Some(gateway)
            && match (self.oif, oif) {
                (Some(ours), Some(theirs)) => ours == theirs,
                _ => true,
            }
    }
}

impl fmt::Display for KernelRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gw) = &self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(oif) = self.oif {
            write!(f, " oif {}", oif)?;
        }
        write!(f, " table {} metric {}", self.table, self.metric)
    }
}

/// Identity of a registration: one live candidate per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateKey {
    pub protocol: ProtocolTag,
    pub interface: String,
    pub family: AddressFamily,
}

impl CandidateKey {
    pub fn new(protocol: ProtocolTag, interface: impl Into<String>, family: AddressFamily) -> Self {
        Self {
            protocol,
            interface: interface.into(),
            family,
        }
    }
}

impl fmt::Display for CandidateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.protocol, self.interface, self.family)
    }
}

/// A default gateway proposed by a protocol handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub protocol: ProtocolTag,
    pub family: AddressFamily,
    pub interface: String,
    pub gateway: IpAddr,
    /// Local address the candidate depends on; when set, the candidate is
    /// only eligible while this address is configured on its interface.
    pub source: Option<IpAddr>,
    /// Registration version; higher means more recently (re)registered.
    pub version: u64,
}

impl Candidate {
    pub fn key(&self) -> CandidateKey {
        CandidateKey::new(self.protocol.clone(), self.interface.clone(), self.family)
    }

    /// Same route target, ignoring the version.
    pub fn same_target(&self, other: &Candidate) -> bool {
        self.key() == other.key() && self.gateway == other.gateway && self.source == other.source
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} dev {} ({}, v{})",
            self.family, self.gateway, self.interface, self.protocol, self.version
        )
    }
}

/// A decoded kernel change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    /// New link, or a link change that did not touch IFF_UP
    LinkAdd(LinkState),
    /// IFF_UP was set
    LinkUp(LinkState),
    /// IFF_UP was cleared
    LinkDown(LinkState),
    LinkDelete { index: IfIndex },
    AddressAdd(AddressState),
    AddressDelete(AddressState),
    RouteAdd(KernelRoute),
    /// A route replaced in place (NLM_F_REPLACE)
    RouteChange(KernelRoute),
    RouteDelete(KernelRoute),
}

impl KernelEvent {
    /// Families whose decision may change because of this event.
    pub fn affected_families(&self) -> Vec<AddressFamily> {
        match self {
            KernelEvent::LinkAdd(_)
            | KernelEvent::LinkUp(_)
            | KernelEvent::LinkDown(_)
            | KernelEvent::LinkDelete { .. } => AddressFamily::ALL.to_vec(),
            KernelEvent::AddressAdd(addr) | KernelEvent::AddressDelete(addr) => {
                vec![addr.family()]
            }
            KernelEvent::RouteAdd(route)
            | KernelEvent::RouteChange(route)
            | KernelEvent::RouteDelete(route) => vec![route.family()],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            KernelEvent::LinkAdd(_) => "link-add",
            KernelEvent::LinkUp(_) => "link-up",
            KernelEvent::LinkDown(_) => "link-down",
            KernelEvent::LinkDelete { .. } => "link-delete",
            KernelEvent::AddressAdd(_) => "address-add",
            KernelEvent::AddressDelete(_) => "address-delete",
            KernelEvent::RouteAdd(_) => "route-add",
            KernelEvent::RouteChange(_) => "route-change",
            KernelEvent::RouteDelete(_) => "route-delete",
        }
    }
}

/// A full kernel snapshot, as returned by the startup/resync dumps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelSnapshot {
    pub links: Vec<LinkState>,
    pub addresses: Vec<AddressState>,
    pub routes: Vec<KernelRoute>,
}

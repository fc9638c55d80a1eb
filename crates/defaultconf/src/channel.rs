//! Kernel route channel abstraction
//!
//! The engine talks to the kernel only through [`RouteChannel`]; the netlink
//! implementation lives in `netlink.rs` and tests substitute an in-memory
//! table.

use crate::error::Result;
use crate::types::{AddressState, KernelRoute, KernelSnapshot, LinkState};
use defaultconf_types::AddressFamily;

/// Correlated reply to a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    Ack,
    /// Negative errno carried by an NLMSG_ERROR
    Error(i32),
    /// Records returned by a dump, in arrival order
    Records(Vec<T>),
}

/// Request/reply access to the kernel routing tables.
///
/// Every call sends one request and blocks until its sequence-numbered reply
/// (or a timeout) arrives. Kernel rejections surface as
/// [`DefaultconfError::Kernel`](crate::error::DefaultconfError::Kernel).
pub trait RouteChannel: Send {
    fn dump_links(&mut self) -> Result<Vec<LinkState>>;

    fn dump_addresses(&mut self) -> Result<Vec<AddressState>>;

    /// Dumps routes of every table, optionally limited to one family.
    fn dump_routes(&mut self, family: Option<AddressFamily>) -> Result<Vec<KernelRoute>>;

    /// Adds a route; fails with EEXIST if an equal route exists.
    fn add_route(&mut self, route: &KernelRoute) -> Result<()>;

    /// Adds a route, replacing the one sharing its destination and metric.
    fn replace_route(&mut self, route: &KernelRoute) -> Result<()>;

    /// Deletes a route; fails with ESRCH if it does not exist.
    fn delete_route(&mut self, route: &KernelRoute) -> Result<()>;

    /// Drops the current socket and opens a fresh one.
    fn reopen(&mut self) -> Result<()>;

    /// Links, addresses and routes in one pass.
    fn snapshot(&mut self) -> Result<KernelSnapshot> {
        Ok(KernelSnapshot {
            links: self.dump_links()?,
            addresses: self.dump_addresses()?,
            routes: self.dump_routes(None)?,
        })
    }
}

impl<C: RouteChannel + ?Sized> RouteChannel for Box<C> {
    fn dump_links(&mut self) -> Result<Vec<LinkState>> {
        (**self).dump_links()
    }

    fn dump_addresses(&mut self) -> Result<Vec<AddressState>> {
        (**self).dump_addresses()
    }

    fn dump_routes(&mut self, family: Option<AddressFamily>) -> Result<Vec<KernelRoute>> {
        (**self).dump_routes(family)
    }

    fn add_route(&mut self, route: &KernelRoute) -> Result<()> {
        (**self).add_route(route)
    }

    fn replace_route(&mut self, route: &KernelRoute) -> Result<()> {
        (**self).replace_route(route)
    }

    fn delete_route(&mut self, route: &KernelRoute) -> Result<()> {
        (**self).delete_route(route)
    }

    fn reopen(&mut self) -> Result<()> {
        (**self).reopen()
    }
}

//! Default Route Selection Daemon
//!
//! Protocol handlers (DHCP, router advertisements, PPP, static config)
//! register candidate default gateways instead of installing routes
//! themselves. defaultconf mirrors the kernel's links, addresses and routes
//! over netlink, picks the best eligible candidate per address family
//! according to an ordered priority policy, and keeps exactly one managed
//! default route per family in the kernel table.
//!
//! # Architecture
//!
//! ```text
//! +-----------------+     +---------------------------+     +--------------+
//! |  Linux Kernel   |     |        defaultconf        |     |   Handlers   |
//! |                 |     |                           |     |              |
//! |  RTM_NEWLINK    |---->| EventStream -> StateModel |<----| Registrar    |
//! |  RTM_NEWADDR    |     |                |          |     | (in-process) |
//! |  RTM_NEWROUTE   |     |                v          |     |              |
//! |                 |     |   selection::evaluate     |<----| store (JSON) |
//! |  default routes |<----| Reconciler (RouteChannel) |     | + SIGUSR1    |
//! +-----------------+     +---------------------------+     +--------------+
//! ```

pub mod channel;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod netlink;
pub mod policy;
pub mod reconciler;
pub mod registration;
pub mod selection;
pub mod state;
pub mod status;
pub mod store;
pub mod types;

pub use channel::{Reply, RouteChannel};
pub use config::{DEFAULT_CONFIG_PATH, DaemonConfig};
pub use engine::{Engine, EngineSettings, SharedEngine};
pub use error::{DefaultconfError, KernelError, Result};
pub use netlink::{EventStream, NetlinkChannel};
pub use policy::{PriorityPolicy, PriorityRule, Rank, Selector};
pub use reconciler::{ActionStatus, PendingFailure, ReconcileAction, ReconcileReport, Reconciler};
pub use registration::{Registrar, RegistrationHandle};
pub use selection::{Decision, Eligibility, RankedCandidate, SelectionOptions};
pub use state::StateModel;
pub use status::StatusReport;
pub use store::{RegistrationStore, StoreSync, StoredGateway};
pub use types::{AddressState, Candidate, CandidateKey, KernelEvent, KernelRoute, KernelSnapshot, LinkState};

pub use defaultconf_types::{AddressFamily, IpPrefix, ProtocolTag};

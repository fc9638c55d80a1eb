//! Read-only status report
//!
//! Recomputes what the daemon would select from a fresh kernel dump and the
//! registration store, without touching the routing table.

use crate::channel::RouteChannel;
use crate::config::DaemonConfig;
use crate::error::Result;
use crate::policy::PriorityPolicy;
use crate::selection::{self, RankedCandidate, SelectionOptions};
use crate::state::StateModel;
use crate::store::RegistrationStore;
use crate::types::{Candidate, KernelRoute, LinkState};
use defaultconf_types::AddressFamily;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct FamilyStatus {
    pub family: AddressFamily,
    /// Default routes currently in the managed table
    pub installed: Vec<KernelRoute>,
    pub selected: Option<Candidate>,
    pub candidates: Vec<RankedCandidate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub table: u32,
    pub links: Vec<LinkState>,
    pub families: Vec<FamilyStatus>,
}

impl StatusReport {
    pub fn build(state: &StateModel, policy: &PriorityPolicy, options: &SelectionOptions) -> Self {
        let families = AddressFamily::ALL
            .iter()
            .map(|&family| FamilyStatus {
                family,
                installed: state.default_routes(family),
                selected: selection::evaluate(state, policy, options, family).winner,
                candidates: selection::ranked(state, policy, options, family),
            })
            .collect();
        Self {
            table: state.table(),
            links: state.links().filter(|l| !l.is_placeholder()).cloned().collect(),
            families,
        }
    }
}

/// Loads the kernel state through `channel` and the stored registrations,
/// then reports the resulting decisions.
pub fn query<C: RouteChannel>(channel: &mut C, config: &DaemonConfig) -> Result<StatusReport> {
    let store = RegistrationStore::load(&config.state_path)?;
    let mut state = StateModel::new(config.table);
    state.replace_kernel_snapshot(channel.snapshot()?);
    for gateway in &store.gateways {
        state.register_candidate(gateway.to_candidate());
    }
    state.set_disabled(store.disabled.clone());

    let settings = config.engine_settings();
    Ok(StatusReport::build(&state, &config.priority_policy(), &settings.selection))
}

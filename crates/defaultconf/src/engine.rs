//! Engine - the single owner of the state model and decisions
//!
//! Kernel events and registrations both end in [`Engine::reevaluate`], which
//! recomputes the affected families' decisions and hands each one to the
//! reconciler. Callers sharing an engine across threads go through
//! [`SharedEngine`], whose mutex covers mutation, re-evaluation and the
//! kernel requests as one unit.

use crate::channel::RouteChannel;
use crate::error::Result;
use crate::policy::{PriorityPolicy, Selector};
use crate::reconciler::{PendingFailure, ReconcileReport, Reconciler};
use crate::selection::{self, Decision, RankedCandidate, SelectionOptions};
use crate::state::StateModel;
use crate::types::{Candidate, CandidateKey, KernelEvent};
use defaultconf_types::AddressFamily;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Engine shared between the daemon loop and registration callers.
pub type SharedEngine<C> = Arc<Mutex<Engine<C>>>;

/// Static engine parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Routing table holding the managed default routes
    pub table: u32,
    /// Metric given to installed default routes
    pub metric: u32,
    pub selection: SelectionOptions,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            table: 254,
            metric: 0,
            selection: SelectionOptions::default(),
        }
    }
}

pub struct Engine<C> {
    channel: C,
    state: StateModel,
    policy: PriorityPolicy,
    options: SelectionOptions,
    reconciler: Reconciler,
    decisions: BTreeMap<AddressFamily, Decision>,
    last_version: u64,
}

impl<C: RouteChannel> Engine<C> {
    pub fn new(channel: C, settings: EngineSettings, policy: PriorityPolicy) -> Self {
        Self {
            channel,
            state: StateModel::new(settings.table),
            policy,
            options: settings.selection,
            reconciler: Reconciler::new(settings.table, settings.metric),
            decisions: AddressFamily::ALL
                .iter()
                .map(|&family| (family, Decision::none(family)))
                .collect(),
            last_version: 0,
        }
    }

    pub fn into_shared(self) -> SharedEngine<C> {
        Arc::new(Mutex::new(self))
    }

    /// Loads the current kernel links, addresses and routes and reconciles
    /// both families. Must run before live events are processed.
    #[instrument(skip(self))]
    pub fn seed(&mut self) -> Result<Vec<ReconcileReport>> {
        let snapshot = self.channel.snapshot()?;
        info!(
            links = snapshot.links.len(),
            addresses = snapshot.addresses.len(),
            routes = snapshot.routes.len(),
            "Seeding state from kernel dump"
        );
        self.state.replace_kernel_snapshot(snapshot);
        self.reevaluate(&AddressFamily::ALL)
    }

    /// Full resync; the periodic backstop against lost notifications.
    #[instrument(skip(self))]
    pub fn resync(&mut self) -> Result<Vec<ReconcileReport>> {
        let snapshot = self.channel.snapshot()?;
        if self.state.replace_kernel_snapshot(snapshot) {
            info!("Kernel state diverged from model, corrected by resync");
        }
        self.reevaluate(&AddressFamily::ALL)
    }

    /// Reopens the channel after a transport failure, then resyncs.
    pub fn recover(&mut self) -> Result<Vec<ReconcileReport>> {
        self.channel.reopen()?;
        self.resync()
    }

    pub fn handle_event(&mut self, event: &KernelEvent) -> Result<Vec<ReconcileReport>> {
        self.handle_events(std::slice::from_ref(event))
    }

    /// Applies a batch of events, then re-evaluates each affected family once.
    pub fn handle_events(&mut self, events: &[KernelEvent]) -> Result<Vec<ReconcileReport>> {
        let mut affected = BTreeSet::new();
        for event in events {
            if self.state.apply_event(event) {
                debug!(kind = event.kind(), ?event, "State changed");
                affected.extend(event.affected_families());
            }
        }
        if affected.is_empty() {
            return Ok(Vec::new());
        }
        let families: Vec<AddressFamily> = affected.into_iter().collect();
        self.reevaluate(&families)
    }

    /// Adds or replaces a candidate, keeping its version.
    pub fn register_candidate(&mut self, candidate: Candidate) -> Result<Vec<ReconcileReport>> {
        self.last_version = self.last_version.max(candidate.version);
        let family = candidate.family;
        info!(candidate = %candidate, "Candidate registered");
        self.state.register_candidate(candidate);
        self.reevaluate(&[family])
    }

    pub fn withdraw_candidate(
        &mut self,
        key: &CandidateKey,
    ) -> Result<(Option<Candidate>, Vec<ReconcileReport>)> {
        let removed = self.state.withdraw_candidate(key);
        match &removed {
            Some(candidate) => info!(candidate = %candidate, "Candidate withdrawn"),
            None => debug!(key = %key, "Withdraw for unknown candidate"),
        }
        let reports = self.reevaluate(&[key.family])?;
        Ok((removed, reports))
    }

    pub fn set_disabled(&mut self, disabled: BTreeSet<Selector>) -> Result<Vec<ReconcileReport>> {
        if !self.state.set_disabled(disabled) {
            return Ok(Vec::new());
        }
        info!(disabled = self.state.disabled().len(), "Disabled selectors updated");
        self.reevaluate(&AddressFamily::ALL)
    }

    /// Swaps the priority policy and re-evaluates both families.
    pub fn reload_policy(&mut self, policy: PriorityPolicy) -> Result<Vec<ReconcileReport>> {
        if policy == self.policy {
            return Ok(Vec::new());
        }
        info!(rules = policy.rules().len(), "Priority policy reloaded");
        self.policy = policy;
        self.reevaluate(&AddressFamily::ALL)
    }

    /// Recomputes the given families and reconciles each of them.
    pub fn reevaluate(&mut self, families: &[AddressFamily]) -> Result<Vec<ReconcileReport>> {
        let mut reports = Vec::with_capacity(families.len());
        for &family in families {
            let decision = selection::evaluate(&self.state, &self.policy, &self.options, family);
            let previous = self.decisions.insert(family, decision.clone());
            if previous.as_ref().is_none_or(|p| !p.same_target(&decision)) {
                info!(
                    %family,
                    previous = %previous.map_or_else(|| "none".to_string(), |p| p.to_string()),
                    current = %decision,
                    "Decision changed"
                );
            }
            let report = self.reconciler.reconcile(&mut self.channel, &mut self.state, &decision)?;
            if let Some(pending) = self.reconciler.pending_failures().get(&family) {
                warn!(%family, error = %pending.error, since = %pending.since, "Default route installation pending");
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Next registration version.
    pub fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    pub fn decision(&self, family: AddressFamily) -> Decision {
        self.decisions
            .get(&family)
            .cloned()
            .unwrap_or_else(|| Decision::none(family))
    }

    pub fn candidate(&self, key: &CandidateKey) -> Option<&Candidate> {
        self.state.candidate(key)
    }

    pub fn ranked(&self, family: AddressFamily) -> Vec<RankedCandidate> {
        selection::ranked(&self.state, &self.policy, &self.options, family)
    }

    pub fn state(&self) -> &StateModel {
        &self.state
    }

    pub fn policy(&self) -> &PriorityPolicy {
        &self.policy
    }

    pub fn pending_failures(&self) -> &BTreeMap<AddressFamily, PendingFailure> {
        self.reconciler.pending_failures()
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Tears the engine down, handing back the channel. Installed routes
    /// are left in place.
    pub fn shutdown(self) -> C {
        info!("Engine shut down, leaving installed default routes in place");
        self.channel
    }
}

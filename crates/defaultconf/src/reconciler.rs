//! Reconciler - makes the kernel's default routes match a decision
//!
//! Planning compares the decision against the default routes actually present
//! in the managed table (RouteState), so re-running it with nothing changed is
//! always a no-op. Replacement uses `NLM_F_REPLACE`, which swaps the route
//! sharing destination and metric in one kernel operation; there is no window
//! without a default route and none with two of ours present. Leftover default
//! routes with another metric are deleted afterwards.
//!
//! Targets carry the metric the kernel will record (IPv6 turns metric 0 into
//! 1024), so optimistic updates agree with the kernel's own notifications.

use crate::channel::RouteChannel;
use crate::error::{DefaultconfError, KernelError, Result};
use crate::selection::Decision;
use crate::state::StateModel;
use crate::types::{IfIndex, KernelRoute};
use chrono::{DateTime, Utc};
use defaultconf_types::AddressFamily;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info, instrument, warn};

/// Kernel mutation needed to reach a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    NoOp,
    Install(KernelRoute),
    Replace {
        old: Vec<KernelRoute>,
        new: KernelRoute,
    },
    Withdraw(Vec<KernelRoute>),
}

impl ReconcileAction {
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileAction::NoOp => "no-op",
            ReconcileAction::Install(_) => "install",
            ReconcileAction::Replace { .. } => "replace",
            ReconcileAction::Withdraw(_) => "withdraw",
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, ReconcileAction::NoOp)
    }
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileAction::NoOp => f.write_str("no-op"),
            ReconcileAction::Install(route) => write!(f, "install {}", route),
            ReconcileAction::Replace { old, new } => {
                write!(f, "replace {} route(s) with {}", old.len(), new)
            }
            ReconcileAction::Withdraw(routes) => write!(f, "withdraw {} route(s)", routes.len()),
        }
    }
}

/// How an action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    /// Nothing to do
    Skipped,
    Completed,
    /// The kernel table had diverged; RouteState was resynced from a dump
    Resynced(KernelError),
    /// The kernel refused the request; left for the next re-evaluation
    FailedPending(KernelError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub family: AddressFamily,
    pub action: ReconcileAction,
    pub status: ActionStatus,
}

/// A non-transient failure waiting for the next re-evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFailure {
    pub action: ReconcileAction,
    pub error: KernelError,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    table: u32,
    metric: u32,
    pending: BTreeMap<AddressFamily, PendingFailure>,
}

impl Reconciler {
    pub fn new(table: u32, metric: u32) -> Self {
        Self {
            table,
            metric,
            pending: BTreeMap::new(),
        }
    }

    pub fn table(&self) -> u32 {
        self.table
    }

    pub fn metric(&self) -> u32 {
        self.metric
    }

    pub fn pending_failures(&self) -> &BTreeMap<AddressFamily, PendingFailure> {
        &self.pending
    }

    /// Decides what to send, given the default routes currently installed
    /// and the winner's output interface.
    pub fn plan(
        &self,
        installed: &[KernelRoute],
        decision: &Decision,
        oif: Option<IfIndex>,
    ) -> ReconcileAction {
        let Some(winner) = &decision.winner else {
            if installed.is_empty() {
                return ReconcileAction::NoOp;
            }
            return ReconcileAction::Withdraw(installed.to_vec());
        };

        let target = KernelRoute::default_via(winner.family, winner.gateway, oif, self.table, self.metric);
        if installed.is_empty() {
            return ReconcileAction::Install(target);
        }

        let (current, stray): (Vec<KernelRoute>, Vec<KernelRoute>) = installed
            .iter()
            .partition(|r| r.forwards_via(&winner.gateway, oif));
        match (current.is_empty(), stray.is_empty()) {
            (false, true) => ReconcileAction::NoOp,
            // Ours is in place; only foreign defaults need to go.
            (false, false) => ReconcileAction::Withdraw(stray),
            (true, _) => ReconcileAction::Replace {
                old: installed.to_vec(),
                new: target,
            },
        }
    }

    /// Plans and executes the action for one decision.
    ///
    /// Transient kernel errors resync RouteState; non-transient ones are
    /// recorded as pending and reported. Transport failures are returned.
    #[instrument(skip(self, channel, state, decision), fields(family = %decision.family))]
    pub fn reconcile<C: RouteChannel + ?Sized>(
        &mut self,
        channel: &mut C,
        state: &mut StateModel,
        decision: &Decision,
    ) -> Result<ReconcileReport> {
        let family = decision.family;
        let oif = decision
            .winner
            .as_ref()
            .and_then(|w| state.link_by_name(&w.interface))
            .map(|l| l.index);
        let installed = state.default_routes(family);
        let action = self.plan(&installed, decision, oif);

        if action.is_noop() {
            self.pending.remove(&family);
            debug!("Default route already matches decision");
            return Ok(ReconcileReport {
                family,
                action,
                status: ActionStatus::Skipped,
            });
        }

        info!(action = %action, decision = %decision, "Reconciling default route");
        let status = match self.execute(channel, state, &action) {
            Ok(()) => {
                self.pending.remove(&family);
                ActionStatus::Completed
            }
            Err(err) => match err.kernel_error() {
                Some(kernel) if kernel.is_transient() => {
                    warn!(error = %kernel, "Kernel table diverged, resyncing default routes");
                    let routes = channel.dump_routes(Some(family))?;
                    state.resync_routes(family, &routes);
                    ActionStatus::Resynced(kernel)
                }
                Some(kernel) => {
                    error!(
                        action = %action,
                        error = %kernel,
                        "Kernel refused default route change, waiting for next re-evaluation"
                    );
                    self.pending.insert(
                        family,
                        PendingFailure {
                            action: action.clone(),
                            error: kernel,
                            since: Utc::now(),
                        },
                    );
                    ActionStatus::FailedPending(kernel)
                }
                None => return Err(err),
            },
        };

        Ok(ReconcileReport {
            family,
            action,
            status,
        })
    }

    fn execute<C: RouteChannel + ?Sized>(
        &self,
        channel: &mut C,
        state: &mut StateModel,
        action: &ReconcileAction,
    ) -> Result<()> {
        match action {
            ReconcileAction::NoOp => Ok(()),
            ReconcileAction::Install(route) => {
                channel.add_route(route)?;
                state.record_installed(*route);
                Ok(())
            }
            ReconcileAction::Replace { old, new } => {
                channel.replace_route(new)?;
                // The kernel swapped out one route with the same metric.
                let mut swapped = false;
                let leftovers: Vec<&KernelRoute> = old
                    .iter()
                    .filter(|r| {
                        if !swapped && r.metric == new.metric {
                            swapped = true;
                            false
                        } else {
                            true
                        }
                    })
                    .collect();
                state.record_installed(*new);
                for route in leftovers {
                    channel.delete_route(route)?;
                    state.record_withdrawn(route);
                }
                Ok(())
            }
            ReconcileAction::Withdraw(routes) => {
                for route in routes {
                    channel.delete_route(route)?;
                    state.record_withdrawn(route);
                }
                Ok(())
            }
        }
    }
}

/// Converts a kernel errno into the error for `operation`.
pub(crate) fn kernel_rejection(operation: &'static str, code: i32) -> DefaultconfError {
    DefaultconfError::Kernel {
        operation,
        error: KernelError::new(code),
    }
}

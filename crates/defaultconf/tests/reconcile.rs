//! Kernel table convergence, including injected kernel failures

mod common;

use common::*;
use defaultconf::{
    ActionStatus, AddressFamily, Engine, EngineSettings, KernelError, KernelEvent, PriorityPolicy,
    ProtocolTag, ReconcileAction,
};
use pretty_assertions::assert_eq;

fn uplinks() -> Engine<FakeKernel> {
    let mut engine = engine(dual_uplink_kernel(), tunnel_first_policy());
    engine
        .register_candidate(candidate(ProtocolTag::Dhcp, "eth1", "192.168.1.1", 1))
        .unwrap();
    engine
        .register_candidate(candidate(ProtocolTag::Dhcp, "tmnet", "10.0.0.1", 2))
        .unwrap();
    engine.channel_mut().requests.clear();
    engine
}

/// Mimics the kernel dropping routes through a device that went down.
fn flush_link(engine: &mut Engine<FakeKernel>, index: u32) {
    engine.channel_mut().routes.retain(|r| r.oif != Some(index));
}

/// Registers a tmnet candidate before the first dump, as a daemon restoring
/// its store does, so the kernel's existing default is still there to replace.
fn registered_before_seed(kernel: FakeKernel) -> Engine<FakeKernel> {
    let mut engine = Engine::new(kernel, EngineSettings::default(), PriorityPolicy::default());
    engine
        .register_candidate(candidate(ProtocolTag::Dhcp, "tmnet", "10.0.0.1", 1))
        .unwrap();
    engine.seed().unwrap();
    engine
}

#[test]
fn test_reregistration_is_noop() {
    let mut engine = uplinks();
    let reports = engine
        .register_candidate(candidate(ProtocolTag::Dhcp, "tmnet", "10.0.0.1", 3))
        .unwrap();
    assert_eq!(reports[0].action, ReconcileAction::NoOp);
    assert_eq!(reports[0].status, ActionStatus::Skipped);
    assert!(engine.channel().mutations().is_empty());
}

#[test]
fn test_withdraw_then_install() {
    let mut engine = engine(dual_uplink_kernel(), PriorityPolicy::default());
    engine
        .register_candidate(candidate(ProtocolTag::Dhcp, "tmnet", "10.0.0.1", 1))
        .unwrap();
    let key = candidate(ProtocolTag::Dhcp, "tmnet", "10.0.0.1", 1).key();

    let (removed, reports) = engine.withdraw_candidate(&key).unwrap();
    assert!(removed.is_some());
    assert_eq!(
        reports[0].action,
        ReconcileAction::Withdraw(vec![default_route("10.0.0.1", 2)])
    );
    assert!(engine.channel().defaults(AddressFamily::Inet).is_empty());

    let reports = engine
        .register_candidate(candidate(ProtocolTag::Dhcp, "tmnet", "10.0.0.1", 2))
        .unwrap();
    assert_eq!(
        reports[0].action,
        ReconcileAction::Install(default_route("10.0.0.1", 2))
    );
    assert_eq!(reports[0].status, ActionStatus::Completed);
    assert_eq!(engine.channel().defaults(AddressFamily::Inet), vec![default_route("10.0.0.1", 2)]);
}

#[test]
fn test_link_flap_fails_over_and_back() {
    let mut engine = uplinks();
    assert_eq!(engine.channel().defaults(AddressFamily::Inet), vec![default_route("10.0.0.1", 2)]);

    flush_link(&mut engine, 2);
    let reports = engine.handle_event(&link_down(2, "tmnet")).unwrap();
    let inet = reports.iter().find(|r| r.family == AddressFamily::Inet).unwrap();
    assert_eq!(inet.action, ReconcileAction::Install(default_route("192.168.1.1", 3)));
    assert_eq!(engine.decision(AddressFamily::Inet).gateway(), Some(ip("192.168.1.1")));

    let reports = engine.handle_event(&link_up(2, "tmnet")).unwrap();
    let inet = reports.iter().find(|r| r.family == AddressFamily::Inet).unwrap();
    assert_eq!(
        inet.action,
        ReconcileAction::Replace {
            old: vec![default_route("192.168.1.1", 3)],
            new: default_route("10.0.0.1", 2),
        }
    );
    // One request swaps the route; no gap without a default.
    assert_eq!(
        engine.channel().mutations(),
        vec![
            Request::Add(default_route("192.168.1.1", 3)),
            Request::Replace(default_route("10.0.0.1", 2)),
        ]
    );
    assert_eq!(engine.channel().defaults(AddressFamily::Inet), vec![default_route("10.0.0.1", 2)]);
}

#[test]
fn test_duplicate_events_do_not_reconcile() {
    let mut engine = uplinks();
    let reports = engine.handle_event(&link_up(2, "tmnet")).unwrap();
    assert!(reports.is_empty());
    assert!(engine.channel().requests.is_empty());
}

#[test]
fn test_foreign_default_replaced_in_place() {
    let mut kernel = dual_uplink_kernel();
    kernel.routes.push(default_route("192.168.1.254", 3));
    let engine = registered_before_seed(kernel);
    assert_eq!(
        engine.channel().mutations(),
        vec![Request::Replace(default_route("10.0.0.1", 2))]
    );
    assert_eq!(engine.channel().defaults(AddressFamily::Inet), vec![default_route("10.0.0.1", 2)]);
}

#[test]
fn test_foreign_default_with_other_metric_removed() {
    let mut kernel = dual_uplink_kernel();
    let mut foreign = default_route("192.168.1.254", 3);
    foreign.metric = 100;
    kernel.routes.push(foreign);
    let engine = registered_before_seed(kernel);
    assert_eq!(
        engine.channel().mutations(),
        vec![
            Request::Replace(default_route("10.0.0.1", 2)),
            Request::Delete(foreign),
        ]
    );
    assert_eq!(engine.state().default_routes(AddressFamily::Inet), vec![default_route("10.0.0.1", 2)]);
}

#[test]
fn test_stray_default_withdrawn_when_ours_present() {
    let mut engine = uplinks();
    let mut stray = default_route("192.168.1.254", 3);
    stray.metric = 50;
    engine.channel_mut().routes.push(stray);

    let reports = engine.handle_event(&KernelEvent::RouteAdd(stray)).unwrap();
    assert_eq!(reports[0].action, ReconcileAction::Withdraw(vec![stray]));
    assert_eq!(engine.channel().defaults(AddressFamily::Inet), vec![default_route("10.0.0.1", 2)]);
}

#[test]
fn test_missing_route_on_withdraw_resyncs() {
    let mut engine = uplinks();
    // The route vanished without a notification reaching us.
    engine.channel_mut().routes.clear();

    let key = candidate(ProtocolTag::Dhcp, "eth1", "192.168.1.1", 1).key();
    engine.withdraw_candidate(&key).unwrap();
    let key = candidate(ProtocolTag::Dhcp, "tmnet", "10.0.0.1", 2).key();
    let (_, reports) = engine.withdraw_candidate(&key).unwrap();

    assert_eq!(reports[0].status, ActionStatus::Resynced(KernelError::new(libc::ESRCH)));
    assert!(engine.state().default_routes(AddressFamily::Inet).is_empty());
    assert!(engine.pending_failures().is_empty());
    assert!(
        engine
            .channel()
            .requests
            .contains(&Request::DumpRoutes(Some(AddressFamily::Inet)))
    );
}

#[test]
fn test_existing_route_on_install_resyncs() {
    let mut engine = engine(dual_uplink_kernel(), PriorityPolicy::default());
    engine.channel_mut().fail_next(Fault::Errno(libc::EEXIST));

    let reports = engine
        .register_candidate(candidate(ProtocolTag::Dhcp, "tmnet", "10.0.0.1", 1))
        .unwrap();
    assert_eq!(reports[0].status, ActionStatus::Resynced(KernelError::new(libc::EEXIST)));
    assert!(engine.channel().defaults(AddressFamily::Inet).is_empty());

    // The next evaluation installs against the resynced state.
    engine.resync().unwrap();
    assert_eq!(engine.channel().defaults(AddressFamily::Inet), vec![default_route("10.0.0.1", 2)]);
}

#[test]
fn test_refused_install_stays_pending_until_retry() {
    let mut engine = engine(dual_uplink_kernel(), PriorityPolicy::default());
    engine.channel_mut().fail_next(Fault::Errno(libc::EPERM));

    let reports = engine
        .register_candidate(candidate(ProtocolTag::Dhcp, "tmnet", "10.0.0.1", 1))
        .unwrap();
    assert_eq!(reports[0].status, ActionStatus::FailedPending(KernelError::new(libc::EPERM)));
    let pending = engine.pending_failures().get(&AddressFamily::Inet).unwrap();
    assert_eq!(pending.error.code, libc::EPERM);
    assert_eq!(pending.action, ReconcileAction::Install(default_route("10.0.0.1", 2)));

    engine.resync().unwrap();
    assert!(engine.pending_failures().is_empty());
    assert_eq!(engine.channel().defaults(AddressFamily::Inet), vec![default_route("10.0.0.1", 2)]);
}

#[test]
fn test_transport_failure_recovers() {
    let mut engine = engine(dual_uplink_kernel(), PriorityPolicy::default());
    engine.channel_mut().fail_next(Fault::Transport);

    let err = engine
        .register_candidate(candidate(ProtocolTag::Dhcp, "tmnet", "10.0.0.1", 1))
        .unwrap_err();
    assert!(err.is_transport());
    assert!(engine.channel().defaults(AddressFamily::Inet).is_empty());

    engine.recover().unwrap();
    assert_eq!(engine.channel().reopened, 1);
    assert_eq!(engine.channel().defaults(AddressFamily::Inet), vec![default_route("10.0.0.1", 2)]);
}

#[test]
fn test_shutdown_leaves_routes() {
    let engine = uplinks();
    let kernel = engine.shutdown();
    assert_eq!(kernel.defaults(AddressFamily::Inet), vec![default_route("10.0.0.1", 2)]);
    assert!(kernel.mutations().is_empty());
}

#[test]
fn test_ipv6_failover_tracks_kernel_metric() {
    let mut engine = engine(dual_uplink_kernel(), tunnel_first_policy());
    engine
        .register_candidate(candidate(ProtocolTag::Ra, "tmnet", "2001:db8:1::1", 1))
        .unwrap();
    let uplink = default_route("2001:db8:1::1", 2);
    assert_eq!(uplink.metric, 1024);
    assert_eq!(engine.channel().defaults(AddressFamily::Inet6), vec![uplink]);

    // The kernel's own notification for the install changes nothing.
    let reports = engine.handle_event(&KernelEvent::RouteAdd(uplink)).unwrap();
    assert!(reports.is_empty());
    assert_eq!(engine.state().default_routes(AddressFamily::Inet6), vec![uplink]);

    let tunnel = default_route("2001:db8::1", 4);
    let reports = engine
        .register_candidate(candidate(ProtocolTag::Ra, "cltun", "2001:db8::1", 2))
        .unwrap();
    assert_eq!(
        reports[0].action,
        ReconcileAction::Replace {
            old: vec![uplink],
            new: tunnel,
        }
    );
    assert_eq!(reports[0].status, ActionStatus::Completed);
    assert_eq!(engine.state().default_routes(AddressFamily::Inet6), vec![tunnel]);
    assert_eq!(engine.channel().defaults(AddressFamily::Inet6), vec![tunnel]);
    assert_eq!(
        engine.channel().mutations(),
        vec![Request::Add(uplink), Request::Replace(tunnel)]
    );
}

#[test]
fn test_ipv6_withdraw_completes() {
    let mut engine = engine(dual_uplink_kernel(), PriorityPolicy::default());
    let ra = candidate(ProtocolTag::Ra, "cltun", "2001:db8::1", 1);
    engine.register_candidate(ra.clone()).unwrap();

    let (_, reports) = engine.withdraw_candidate(&ra.key()).unwrap();
    assert_eq!(
        reports[0].action,
        ReconcileAction::Withdraw(vec![default_route("2001:db8::1", 4)])
    );
    assert_eq!(reports[0].status, ActionStatus::Completed);
    assert!(engine.state().default_routes(AddressFamily::Inet6).is_empty());
    assert!(engine.channel().defaults(AddressFamily::Inet6).is_empty());
}

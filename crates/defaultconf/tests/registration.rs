//! Registration interface and store mirroring

mod common;

use common::*;
use defaultconf::{
    AddressFamily, DaemonConfig, DefaultconfError, PriorityPolicy, ProtocolTag, Registrar,
    RegistrationStore, Selector, StoreSync,
};
use defaultconf::store::SyncSummary;
use pretty_assertions::assert_eq;

#[test]
fn test_register_update_withdraw() {
    let shared = engine(dual_uplink_kernel(), PriorityPolicy::default()).into_shared();
    let registrar = Registrar::new(shared.clone());

    let mut handle = registrar
        .register(ProtocolTag::Dhcp, AddressFamily::Inet, "tmnet", ip("10.0.0.1"), None)
        .unwrap();
    assert_eq!(handle.version(), 1);
    assert_eq!(shared.lock().channel().defaults(AddressFamily::Inet), vec![default_route("10.0.0.1", 2)]);

    registrar.update(&mut handle, ip("10.0.0.254"), None).unwrap();
    assert_eq!(handle.version(), 2);
    assert_eq!(
        shared.lock().channel().defaults(AddressFamily::Inet),
        vec![default_route("10.0.0.254", 2)]
    );

    let stale = handle.clone();
    registrar.withdraw(handle).unwrap();
    assert!(shared.lock().channel().defaults(AddressFamily::Inet).is_empty());
    assert!(matches!(
        registrar.withdraw(stale),
        Err(DefaultconfError::UnknownRegistration(_))
    ));
}

#[test]
fn test_register_same_key_replaces() {
    let shared = engine(dual_uplink_kernel(), PriorityPolicy::default()).into_shared();
    let registrar = Registrar::new(shared.clone());

    registrar
        .register(ProtocolTag::Dhcp, AddressFamily::Inet, "tmnet", ip("10.0.0.1"), None)
        .unwrap();
    let handle = registrar
        .register(ProtocolTag::Dhcp, AddressFamily::Inet, "tmnet", ip("10.0.0.2"), None)
        .unwrap();

    assert_eq!(registrar.handle_for(handle.key()), Some(handle.clone()));
    let engine = shared.lock();
    assert_eq!(engine.state().candidates().count(), 1);
    assert_eq!(engine.candidate(handle.key()).map(|c| c.gateway), Some(ip("10.0.0.2")));
    assert_eq!(engine.channel().defaults(AddressFamily::Inet), vec![default_route("10.0.0.2", 2)]);
}

#[test]
fn test_invalid_registration_rejected() {
    let shared = engine(dual_uplink_kernel(), PriorityPolicy::default()).into_shared();
    let registrar = Registrar::new(shared.clone());

    let err = registrar
        .register(ProtocolTag::Ra, AddressFamily::Inet6, "cltun", ip("10.0.0.1"), None)
        .unwrap_err();
    assert!(matches!(err, DefaultconfError::InvalidRegistration(_)));
    let err = registrar
        .register(ProtocolTag::Static, AddressFamily::Inet, "eth0/1", ip("10.0.0.1"), None)
        .unwrap_err();
    assert!(matches!(err, DefaultconfError::InvalidRegistration(_)));
    assert_eq!(shared.lock().state().candidates().count(), 0);
}

#[test]
fn test_store_sync_mirrors_store() {
    let shared = engine(dual_uplink_kernel(), tunnel_first_policy()).into_shared();
    let mut sync = StoreSync::new(Registrar::new(shared.clone()));

    let mut store = RegistrationStore::default();
    store
        .add(AddressFamily::Inet, "eth1", ProtocolTag::Dhcp, ip("192.168.1.1"), None)
        .unwrap();
    store
        .add(AddressFamily::Inet, "tmnet", ProtocolTag::Dhcp, ip("10.0.0.1"), None)
        .unwrap();
    store
        .add(AddressFamily::Inet6, "cltun", ProtocolTag::Ra, ip("2001:db8::1"), None)
        .unwrap();

    let summary = sync.apply(&store).unwrap();
    assert_eq!(summary.registered, 3);
    assert_eq!(shared.lock().decision(AddressFamily::Inet).gateway(), Some(ip("10.0.0.1")));
    assert_eq!(shared.lock().decision(AddressFamily::Inet6).gateway(), Some(ip("2001:db8::1")));

    // Unchanged store: nothing to do
    assert_eq!(sync.apply(&store).unwrap(), SyncSummary::default());

    store.remove(&Selector::new(None, Some("tmnet".to_string()), None));
    let summary = sync.apply(&store).unwrap();
    assert_eq!(summary.withdrawn, 1);
    assert_eq!(
        shared.lock().channel().defaults(AddressFamily::Inet),
        vec![default_route("192.168.1.1", 3)]
    );

    store.disable(Selector::family(AddressFamily::Inet6));
    sync.apply(&store).unwrap();
    assert!(shared.lock().decision(AddressFamily::Inet6).is_none());
    assert!(shared.lock().channel().defaults(AddressFamily::Inet6).is_empty());
}

#[test]
fn test_store_sync_preserves_registration_order() {
    let shared = engine(dual_uplink_kernel(), PriorityPolicy::default()).into_shared();
    let mut sync = StoreSync::new(Registrar::new(shared.clone()));

    // tmnet registered last, so it is the newest without any rule.
    let mut store = RegistrationStore::default();
    store
        .add(AddressFamily::Inet, "eth1", ProtocolTag::Static, ip("192.168.1.1"), None)
        .unwrap();
    store
        .add(AddressFamily::Inet, "tmnet", ProtocolTag::Static, ip("10.0.0.1"), None)
        .unwrap();
    sync.apply(&store).unwrap();
    assert_eq!(shared.lock().decision(AddressFamily::Inet).gateway(), Some(ip("10.0.0.1")));

    // Re-adding eth1 makes it newest.
    store
        .add(AddressFamily::Inet, "eth1", ProtocolTag::Static, ip("192.168.1.1"), None)
        .unwrap();
    let summary = sync.apply(&store).unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(shared.lock().decision(AddressFamily::Inet).gateway(), Some(ip("192.168.1.1")));
}

#[test]
fn test_store_file_round_trip_through_update() {
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig {
        state_path: dir.path().join("defaultconf.state"),
        pid_path: dir.path().join("defaultconf.pid"),
        ..DaemonConfig::default()
    };

    RegistrationStore::update(&config, |store| {
        store.add(AddressFamily::Inet, "tmnet", ProtocolTag::Dhcp, ip("10.0.0.1"), None)?;
        store.disable(Selector::new(None, None, Some(ProtocolTag::Ppp)));
        Ok(())
    })
    .unwrap();

    let shared = engine(dual_uplink_kernel(), PriorityPolicy::default()).into_shared();
    let mut sync = StoreSync::new(Registrar::new(shared.clone()));
    sync.apply(&RegistrationStore::load(&config.state_path).unwrap()).unwrap();

    let engine = shared.lock();
    assert_eq!(engine.decision(AddressFamily::Inet).gateway(), Some(ip("10.0.0.1")));
    assert_eq!(engine.state().disabled().len(), 1);
}

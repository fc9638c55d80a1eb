//! Registration interface for protocol handlers
//!
//! Handlers (DHCP client, RA daemon, PPP, static configuration) register
//! their gateway here instead of installing a default route themselves.
//! A registration is keyed by (protocol, interface, family); registering the
//! same key again replaces the previous value with a newer version.

use crate::channel::RouteChannel;
use crate::engine::SharedEngine;
use crate::error::{DefaultconfError, Result};
use crate::types::{Candidate, CandidateKey};
use defaultconf_types::{AddressFamily, ProtocolTag};
use std::fmt;
use std::net::IpAddr;
use tracing::instrument;

/// Kernel limit on interface names, excluding the terminating NUL
const IFNAMSIZ: usize = 15;

/// Proof of a registration, returned to the handler that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationHandle {
    key: CandidateKey,
    version: u64,
}

impl RegistrationHandle {
    pub fn key(&self) -> &CandidateKey {
        &self.key
    }

    /// Version assigned by the last `register` or `update` through this handle.
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl fmt::Display for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.key, self.version)
    }
}

pub struct Registrar<C> {
    engine: SharedEngine<C>,
}

impl<C> Clone for Registrar<C> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<C: RouteChannel> Registrar<C> {
    pub fn new(engine: SharedEngine<C>) -> Self {
        Self { engine }
    }

    #[instrument(skip(self))]
    pub fn register(
        &self,
        protocol: ProtocolTag,
        family: AddressFamily,
        interface: &str,
        gateway: IpAddr,
        source: Option<IpAddr>,
    ) -> Result<RegistrationHandle> {
        validate(family, interface, &gateway, source.as_ref())?;
        let key = CandidateKey::new(protocol, interface, family);

        let mut engine = self.engine.lock();
        let version = engine.next_version();
        engine.register_candidate(Candidate {
            protocol: key.protocol.clone(),
            family,
            interface: key.interface.clone(),
            gateway,
            source,
            version,
        })?;
        Ok(RegistrationHandle { key, version })
    }

    /// Changes the gateway of a live registration, bumping its version.
    #[instrument(skip(self, handle), fields(handle = %handle))]
    pub fn update(
        &self,
        handle: &mut RegistrationHandle,
        gateway: IpAddr,
        source: Option<IpAddr>,
    ) -> Result<()> {
        let key = &handle.key;
        validate(key.family, &key.interface, &gateway, source.as_ref())?;

        let mut engine = self.engine.lock();
        if engine.candidate(key).is_none() {
            return Err(DefaultconfError::UnknownRegistration(key.to_string()));
        }
        let version = engine.next_version();
        engine.register_candidate(Candidate {
            protocol: key.protocol.clone(),
            family: key.family,
            interface: key.interface.clone(),
            gateway,
            source,
            version,
        })?;
        handle.version = version;
        Ok(())
    }

    #[instrument(skip(self, handle), fields(handle = %handle))]
    pub fn withdraw(&self, handle: RegistrationHandle) -> Result<()> {
        let mut engine = self.engine.lock();
        if engine.candidate(&handle.key).is_none() {
            return Err(DefaultconfError::UnknownRegistration(handle.key.to_string()));
        }
        engine.withdraw_candidate(&handle.key)?;
        Ok(())
    }

    /// Re-creates a handle for a key registered earlier, e.g. by a previous
    /// daemon run loaded from the store.
    pub fn handle_for(&self, key: &CandidateKey) -> Option<RegistrationHandle> {
        let engine = self.engine.lock();
        engine.candidate(key).map(|c| RegistrationHandle {
            key: key.clone(),
            version: c.version,
        })
    }

    pub fn engine(&self) -> &SharedEngine<C> {
        &self.engine
    }
}

fn validate(
    family: AddressFamily,
    interface: &str,
    gateway: &IpAddr,
    source: Option<&IpAddr>,
) -> Result<()> {
    if interface.is_empty() || interface.len() > IFNAMSIZ || interface.contains(['/', ' ']) {
        return Err(DefaultconfError::InvalidRegistration(format!(
            "invalid interface name {:?}",
            interface
        )));
    }
    if !family.contains(gateway) {
        return Err(DefaultconfError::InvalidRegistration(format!(
            "gateway {} is not an {} address",
            gateway, family
        )));
    }
    if gateway.is_unspecified() || gateway.is_multicast() {
        return Err(DefaultconfError::InvalidRegistration(format!(
            "gateway {} is not a unicast address",
            gateway
        )));
    }
    if let Some(source) = source {
        if !family.contains(source) {
            return Err(DefaultconfError::InvalidRegistration(format!(
                "source {} is not an {} address",
                source, family
            )));
        }
    }
    Ok(())
}

//! Driver callbacks consumed by the atomic core
//!
//! Each kind of mode object gets its own trait. Only state duplication and
//! destruction are mandatory, the remaining hooks default to "nothing to add"
//! or, for extension properties, to [`Error::UnknownProperty`].

use std::{fmt, sync::Arc};

use super::{Connector, Crtc, DrmDevice, Plane, Property};
use crate::{
    atomic::{AtomicState, ConnectorState, CrtcState, PlaneState, Rejected},
    error::Error,
};

/// Driver callbacks of a crtc
pub trait CrtcFuncs: fmt::Debug + Send + Sync {
    /// Creates a copy of `current` to be modified by a transaction.
    ///
    /// Most drivers can just return [`CrtcState::duplicate`].
    fn duplicate_state(&self, crtc: &Crtc, current: &CrtcState) -> Result<CrtcState, Error>;

    /// Releases a state previously returned by [`CrtcFuncs::duplicate_state`]
    fn destroy_state(&self, crtc: &Crtc, state: CrtcState);

    /// Driver specific validation, run after the core checks
    fn atomic_check(&self, crtc: &Crtc, state: &CrtcState) -> Result<(), Error> {
        let _ = (crtc, state);
        Ok(())
    }

    /// Sets a driver specific property
    fn set_property(
        &self,
        crtc: &Crtc,
        state: &mut CrtcState,
        property: &Property,
        value: u64,
    ) -> Result<(), Error> {
        let _ = (state, value);
        Err(Error::UnknownProperty {
            object: crtc.id(),
            property: property.id(),
        })
    }

    /// Reads a driver specific property
    fn get_property(&self, crtc: &Crtc, state: &CrtcState, property: &Property) -> Result<u64, Error> {
        let _ = state;
        Err(Error::UnknownProperty {
            object: crtc.id(),
            property: property.id(),
        })
    }
}

/// Driver callbacks of a plane
pub trait PlaneFuncs: fmt::Debug + Send + Sync {
    /// Creates a copy of `current` to be modified by a transaction.
    ///
    /// Most drivers can just return [`PlaneState::duplicate`].
    fn duplicate_state(&self, plane: &Plane, current: &PlaneState) -> Result<PlaneState, Error>;

    /// Releases a state previously returned by [`PlaneFuncs::duplicate_state`]
    fn destroy_state(&self, plane: &Plane, state: PlaneState);

    /// Driver specific validation, run after the core checks
    fn atomic_check(&self, plane: &Plane, state: &PlaneState) -> Result<(), Error> {
        let _ = (plane, state);
        Ok(())
    }

    /// Sets a driver specific property
    fn set_property(
        &self,
        plane: &Plane,
        state: &mut PlaneState,
        property: &Property,
        value: u64,
    ) -> Result<(), Error> {
        let _ = (state, value);
        Err(Error::UnknownProperty {
            object: plane.id(),
            property: property.id(),
        })
    }

    /// Reads a driver specific property
    fn get_property(&self, plane: &Plane, state: &PlaneState, property: &Property) -> Result<u64, Error> {
        let _ = state;
        Err(Error::UnknownProperty {
            object: plane.id(),
            property: property.id(),
        })
    }
}

/// Driver callbacks of a connector
pub trait ConnectorFuncs: fmt::Debug + Send + Sync {
    /// Creates a copy of `current` to be modified by a transaction.
    ///
    /// Most drivers can just return [`ConnectorState::duplicate`].
    fn duplicate_state(&self, connector: &Connector, current: &ConnectorState)
        -> Result<ConnectorState, Error>;

    /// Releases a state previously returned by [`ConnectorFuncs::duplicate_state`]
    fn destroy_state(&self, connector: &Connector, state: ConnectorState);

    /// Sets a driver specific property
    fn set_property(
        &self,
        connector: &Connector,
        state: &mut ConnectorState,
        property: &Property,
        value: u64,
    ) -> Result<(), Error> {
        let _ = (state, value);
        Err(Error::UnknownProperty {
            object: connector.id(),
            property: property.id(),
        })
    }

    /// Reads a driver specific property
    fn get_property(
        &self,
        connector: &Connector,
        state: &ConnectorState,
        property: &Property,
    ) -> Result<u64, Error> {
        let _ = state;
        Err(Error::UnknownProperty {
            object: connector.id(),
            property: property.id(),
        })
    }
}

/// Device wide callbacks
pub trait ModeConfigFuncs: fmt::Debug + Send + Sync {
    /// Validates the transaction as a whole, after all per-object checks passed.
    ///
    /// The hook may pull further objects into the transaction and may fail with
    /// [`Error::Deadlock`] while doing so.
    fn atomic_check(&self, dev: &DrmDevice, state: &mut AtomicState) -> Result<(), Error> {
        let _ = (dev, state);
        Ok(())
    }

    /// Applies a checked transaction to the hardware.
    ///
    /// On success the hook owns the transaction and is responsible for eventually
    /// dropping it. For `nonblock` commits it should return as soon as the work is
    /// queued. On failure the transaction has to be handed back through [`Rejected`].
    fn atomic_commit(&self, dev: &DrmDevice, state: AtomicState, nonblock: bool) -> Result<(), Rejected>;

    /// Allocates a new transaction, drivers subclassing the state override this
    fn atomic_state_alloc(&self, dev: &Arc<DrmDevice>) -> Result<AtomicState, Error> {
        AtomicState::init(dev.clone())
    }

    /// Releases every object state held by the transaction
    fn atomic_state_clear(&self, state: &mut AtomicState) {
        state.default_clear();
    }

    /// Called once the transaction got cleared for the last time
    fn atomic_state_free(&self, state: &mut AtomicState) {
        let _ = state;
    }
}

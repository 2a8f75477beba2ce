//! Atomic modesetting transactions
//!
//! An [`AtomicState`] collects proposed changes to any number of crtcs, planes and
//! connectors of a [`DrmDevice`] and applies them as a single unit: either every
//! change becomes visible together, or none does.
//!
//! The state of an object is pulled into a transaction lazily, the first time it is
//! requested through [`AtomicState::get_crtc_state`], [`AtomicState::get_plane_state`]
//! or [`AtomicState::get_connector_state`]. Doing so acquires the object's
//! [`ModesetLock`](crate::lock::ModesetLock) through the transaction's
//! [`AcquireContext`] and duplicates the currently committed state through the
//! driver callbacks. Every further request for the same object returns the very
//! same state.
//!
//! Any lock acquisition may fail with [`Error::Deadlock`]. The error has to be
//! propagated to whoever drives the transaction, which then clears it, backs off the
//! acquire context and starts building it again:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use atomic_kms::{atomic::AtomicState, device::{CrtcHandle, DrmDevice}, lock::AcquireContext, Error};
//! # fn build(state: &mut AtomicState) -> Result<(), Error> { unimplemented!() }
//! # fn run(dev: &Arc<DrmDevice>) -> Result<(), Error> {
//! let ctx = Arc::new(AcquireContext::new());
//! let mut state = AtomicState::alloc(dev)?;
//! state.set_acquire_ctx(ctx.clone());
//!
//! let result = loop {
//!     if let Err(err) = build(&mut state) {
//!         if err.is_deadlock() {
//!             state.clear();
//!             ctx.backoff();
//!             continue;
//!         }
//!         break Err(err);
//!     }
//!     match state.commit() {
//!         Ok(()) => break Ok(()),
//!         Err(rejected) if rejected.error.is_deadlock() => {
//!             state = rejected.state;
//!             state.clear();
//!             ctx.backoff();
//!         }
//!         Err(rejected) => break Err(rejected.error),
//!     }
//! };
//! ctx.drop_locks();
//! # result
//! # }
//! ```
//!
//! Commits move the transaction into [`ModeConfigFuncs::atomic_commit`](crate::device::ModeConfigFuncs::atomic_commit),
//! a rejected commit hands it back through [`Rejected`].
//! [`atomic_ioctl`] implements the whole loop for requests of clients.

use std::{fmt, mem, sync::Arc};

use tracing::{debug, info_span, warn};

mod commit;
pub(crate) mod connector;
pub(crate) mod crtc;
mod ioctl;
pub(crate) mod plane;

pub use self::commit::{CrtcCommit, Rejected};
pub use self::connector::ConnectorState;
pub use self::crtc::CrtcState;
pub use self::ioctl::{atomic_ioctl, AtomicCommitFlags, AtomicRequest};
pub use self::plane::{PlaneState, Rotation};

use crate::{
    device::{Connector, ConnectorHandle, Crtc, CrtcHandle, DrmDevice, Plane, PlaneHandle},
    error::Error,
    file::DrmFile,
    lock::AcquireContext,
    utils::ids::STATE_IDS,
};

#[derive(Debug)]
pub(crate) struct CrtcEntry {
    pub(crate) crtc: Arc<Crtc>,
    pub(crate) state: CrtcState,
    pub(crate) commit: Option<CrtcCommit>,
    pub(crate) out_fence_ptr: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct PlaneEntry {
    pub(crate) plane: Arc<Plane>,
    pub(crate) state: PlaneState,
}

#[derive(Debug)]
pub(crate) struct ConnectorEntry {
    pub(crate) connector: Arc<Connector>,
    pub(crate) state: ConnectorState,
}

/// A transaction over the mode objects of one device
pub struct AtomicState {
    id: u32,
    dev: Arc<DrmDevice>,
    crtcs: Vec<Option<CrtcEntry>>,
    planes: Vec<Option<PlaneEntry>>,
    connectors: Vec<Option<ConnectorEntry>>,
    acquire_ctx: Option<Arc<AcquireContext>>,
    allow_modeset: bool,
    file: Option<Arc<DrmFile>>,
    span: tracing::Span,
}

impl fmt::Debug for AtomicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicState")
            .field("id", &self.id)
            .field("device", &self.dev.name())
            .field("crtcs", &self.crtcs)
            .field("planes", &self.planes)
            .field("connectors", &self.connectors)
            .field("allow_modeset", &self.allow_modeset)
            .finish_non_exhaustive()
    }
}

fn empty_table<T>(len: usize) -> Result<Vec<Option<T>>, Error> {
    let mut table = Vec::new();
    table.try_reserve_exact(len)?;
    table.resize_with(len, || None);
    Ok(table)
}

impl AtomicState {
    /// Allocates a new transaction through [`ModeConfigFuncs::atomic_state_alloc`](crate::device::ModeConfigFuncs::atomic_state_alloc)
    pub fn alloc(dev: &Arc<DrmDevice>) -> Result<AtomicState, Error> {
        dev.funcs.atomic_state_alloc(dev)
    }

    /// Creates an empty transaction sized for the current objects of `dev`.
    ///
    /// This is the default implementation of [`ModeConfigFuncs::atomic_state_alloc`](crate::device::ModeConfigFuncs::atomic_state_alloc),
    /// modesets are allowed by default.
    pub fn init(dev: Arc<DrmDevice>) -> Result<AtomicState, Error> {
        let crtcs = empty_table(dev.num_crtcs())?;
        let planes = empty_table(dev.num_planes())?;
        let connectors = empty_table(dev.num_connectors())?;

        let id = STATE_IDS.next();
        let span = info_span!(parent: None, "atomic_state", id, device = %dev.name());
        debug!(parent: &span, "Allocated atomic state");

        Ok(AtomicState {
            id,
            dev,
            crtcs,
            planes,
            connectors,
            acquire_ctx: None,
            allow_modeset: true,
            file: None,
            span,
        })
    }

    /// Numeric id of this transaction, unique among all live transactions
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The device this transaction belongs to
    pub fn device(&self) -> &Arc<DrmDevice> {
        &self.dev
    }

    /// Context used to acquire the locks of added objects
    pub fn acquire_ctx(&self) -> Option<&Arc<AcquireContext>> {
        self.acquire_ctx.as_ref()
    }

    /// Sets the context used to acquire the locks of added objects
    pub fn set_acquire_ctx(&mut self, ctx: Arc<AcquireContext>) {
        self.acquire_ctx = Some(ctx);
    }

    /// Returns true, if this transaction may contain full modesets
    pub fn allow_modeset(&self) -> bool {
        self.allow_modeset
    }

    /// Allows or forbids full modesets
    pub fn set_allow_modeset(&mut self, allow: bool) {
        self.allow_modeset = allow;
    }

    /// The client this transaction is built for
    pub fn file(&self) -> Option<&Arc<DrmFile>> {
        self.file.as_ref()
    }

    /// Sets the client this transaction is built for.
    ///
    /// Out-fence pointers and in-fence descriptors are resolved through it.
    pub fn set_file(&mut self, file: Option<Arc<DrmFile>>) {
        self.file = file;
    }

    /// Releases every object state through [`ModeConfigFuncs::atomic_state_clear`](crate::device::ModeConfigFuncs::atomic_state_clear).
    ///
    /// The transaction can be rebuilt afterwards, e.g. after a deadlock.
    pub fn clear(&mut self) {
        let funcs = self.dev.funcs.clone();
        funcs.atomic_state_clear(self);
    }

    /// Default implementation of [`ModeConfigFuncs::atomic_state_clear`](crate::device::ModeConfigFuncs::atomic_state_clear).
    ///
    /// Destroys every object state exactly once and cancels pending commits.
    pub fn default_clear(&mut self) {
        debug!(parent: &self.span, "Clearing atomic state");

        for slot in self.connectors.iter_mut() {
            if let Some(ConnectorEntry { connector, state }) = slot.take() {
                connector.funcs.destroy_state(&connector, state);
            }
        }

        for slot in self.crtcs.iter_mut() {
            if let Some(CrtcEntry { crtc, state, commit, .. }) = slot.take() {
                if let Some(commit) = commit {
                    commit.cancel();
                }
                crtc.funcs.destroy_state(&crtc, state);
            }
        }

        for slot in self.planes.iter_mut() {
            if let Some(PlaneEntry { plane, state }) = slot.take() {
                plane.funcs.destroy_state(&plane, state);
            }
        }
    }

    fn ctx(&self) -> Result<Arc<AcquireContext>, Error> {
        self.acquire_ctx.clone().ok_or_else(|| {
            warn!(parent: &self.span, "Acquiring object state without acquire context");
            Error::InvalidUsage("atomic state has no acquire context")
        })
    }

    /// State of `crtc`, if it is part of this transaction
    pub fn get_existing_crtc_state(&self, crtc: CrtcHandle) -> Option<&CrtcState> {
        self.crtcs
            .get(crtc.index)?
            .as_ref()
            .filter(|entry| entry.crtc.handle() == crtc)
            .map(|entry| &entry.state)
    }

    /// Mutable state of `crtc`, if it is part of this transaction
    pub fn get_existing_crtc_state_mut(&mut self, crtc: CrtcHandle) -> Option<&mut CrtcState> {
        self.crtcs
            .get_mut(crtc.index)?
            .as_mut()
            .filter(|entry| entry.crtc.handle() == crtc)
            .map(|entry| &mut entry.state)
    }

    /// State of `plane`, if it is part of this transaction
    pub fn get_existing_plane_state(&self, plane: PlaneHandle) -> Option<&PlaneState> {
        self.planes
            .get(plane.index)?
            .as_ref()
            .filter(|entry| entry.plane.handle() == plane)
            .map(|entry| &entry.state)
    }

    /// Mutable state of `plane`, if it is part of this transaction
    pub fn get_existing_plane_state_mut(&mut self, plane: PlaneHandle) -> Option<&mut PlaneState> {
        self.planes
            .get_mut(plane.index)?
            .as_mut()
            .filter(|entry| entry.plane.handle() == plane)
            .map(|entry| &mut entry.state)
    }

    /// State of `connector`, if it is part of this transaction
    pub fn get_existing_connector_state(&self, connector: ConnectorHandle) -> Option<&ConnectorState> {
        self.connectors
            .get(connector.index)?
            .as_ref()
            .filter(|entry| entry.connector.handle() == connector)
            .map(|entry| &entry.state)
    }

    /// Mutable state of `connector`, if it is part of this transaction
    pub fn get_existing_connector_state_mut(
        &mut self,
        connector: ConnectorHandle,
    ) -> Option<&mut ConnectorState> {
        self.connectors
            .get_mut(connector.index)?
            .as_mut()
            .filter(|entry| entry.connector.handle() == connector)
            .map(|entry| &mut entry.state)
    }

    pub(crate) fn crtc_entry(&mut self, handle: CrtcHandle) -> Result<&mut CrtcEntry, Error> {
        let ctx = self.ctx()?;
        if handle.index >= self.crtcs.len() {
            return Err(Error::UnknownReference(handle.id.into()));
        }

        if let Some(entry) = &self.crtcs[handle.index] {
            if entry.crtc.handle() != handle {
                return Err(Error::UnknownReference(handle.id.into()));
            }
        } else {
            let crtc = self
                .dev
                .crtc(handle)
                .cloned()
                .ok_or(Error::UnknownReference(handle.id.into()))?;
            crtc.lock.lock(&ctx)?;

            let state = crtc.funcs.duplicate_state(&crtc, &crtc.current_state())?;
            debug!(
                parent: &self.span,
                crtc = crtc.id().raw(),
                name = crtc.name(),
                "Added crtc state"
            );
            self.crtcs[handle.index] = Some(CrtcEntry {
                crtc,
                state,
                commit: None,
                out_fence_ptr: None,
            });
        }

        self.crtcs[handle.index]
            .as_mut()
            .ok_or(Error::InvalidUsage("crtc state vanished"))
    }

    pub(crate) fn plane_entry(&mut self, handle: PlaneHandle) -> Result<&mut PlaneEntry, Error> {
        let ctx = self.ctx()?;
        if handle.index >= self.planes.len() {
            return Err(Error::UnknownReference(handle.id.into()));
        }

        if let Some(entry) = &self.planes[handle.index] {
            if entry.plane.handle() != handle {
                return Err(Error::UnknownReference(handle.id.into()));
            }
        } else {
            let plane = self
                .dev
                .plane(handle)
                .cloned()
                .ok_or(Error::UnknownReference(handle.id.into()))?;
            plane.lock.lock(&ctx)?;

            let state = plane.funcs.duplicate_state(&plane, &plane.current_state())?;
            let crtc = state.crtc();
            debug!(
                parent: &self.span,
                plane = plane.id().raw(),
                name = plane.name(),
                "Added plane state"
            );
            self.planes[handle.index] = Some(PlaneEntry { plane, state });

            // the current crtc is affected by anything done to the plane
            if let Some(crtc) = crtc {
                self.crtc_entry(crtc)?;
            }
        }

        self.planes[handle.index]
            .as_mut()
            .ok_or(Error::InvalidUsage("plane state vanished"))
    }

    pub(crate) fn connector_entry(&mut self, handle: ConnectorHandle) -> Result<&mut ConnectorEntry, Error> {
        let ctx = self.ctx()?;
        self.dev.connection_lock.lock(&ctx)?;

        if handle.index >= self.connectors.len() {
            let len = (handle.index + 1).max(self.dev.num_connectors());
            self.connectors.try_reserve_exact(len - self.connectors.len())?;
            self.connectors.resize_with(len, || None);
        }

        if let Some(entry) = &self.connectors[handle.index] {
            if entry.connector.handle() != handle {
                return Err(Error::UnknownReference(handle.id.into()));
            }
        } else {
            let connector = self
                .dev
                .connector(handle)
                .ok_or(Error::UnknownReference(handle.id.into()))?;
            let state = connector
                .funcs
                .duplicate_state(&connector, &connector.current_state())?;
            let crtc = state.crtc();
            debug!(
                parent: &self.span,
                connector = connector.id().raw(),
                name = connector.name(),
                "Added connector state"
            );
            self.connectors[handle.index] = Some(ConnectorEntry { connector, state });

            if let Some(crtc) = crtc {
                self.crtc_entry(crtc)?;
            }
        }

        self.connectors[handle.index]
            .as_mut()
            .ok_or(Error::InvalidUsage("connector state vanished"))
    }

    /// State of `crtc` in this transaction, adding it if necessary.
    ///
    /// Adding the state locks the crtc and may fail with [`Error::Deadlock`].
    pub fn get_crtc_state(&mut self, crtc: CrtcHandle) -> Result<&mut CrtcState, Error> {
        self.crtc_entry(crtc).map(|entry| &mut entry.state)
    }

    /// State of `plane` in this transaction, adding it if necessary.
    ///
    /// Adding the state locks the plane, and pulls in the state of the crtc it
    /// currently scans out to. May fail with [`Error::Deadlock`].
    pub fn get_plane_state(&mut self, plane: PlaneHandle) -> Result<&mut PlaneState, Error> {
        self.plane_entry(plane).map(|entry| &mut entry.state)
    }

    /// State of `connector` in this transaction, adding it if necessary.
    ///
    /// Adding the state takes the connection lock, and pulls in the state of the
    /// crtc currently driving the connector. May fail with [`Error::Deadlock`].
    pub fn get_connector_state(&mut self, connector: ConnectorHandle) -> Result<&mut ConnectorState, Error> {
        self.connector_entry(connector).map(|entry| &mut entry.state)
    }

    /// Links `plane` to `crtc`, or unlinks it if `crtc` is `None`.
    ///
    /// Keeps the plane masks of both the old and the new crtc state in sync.
    /// The old crtc state has to be part of the transaction already, which it is
    /// unless the plane state was modified behind the transaction's back.
    pub fn set_crtc_for_plane(&mut self, plane: PlaneHandle, crtc: Option<CrtcHandle>) -> Result<(), Error> {
        let old = self.plane_entry(plane)?.state.crtc;
        if old == crtc {
            return Ok(());
        }

        if let Some(old) = old {
            match self.get_existing_crtc_state_mut(old) {
                Some(state) => state.plane_mask &= !plane.mask(),
                None => {
                    warn!(
                        parent: &self.span,
                        plane = plane.id().raw(),
                        crtc = old.id().raw(),
                        "Previous crtc of plane is not part of the transaction"
                    );
                    return Err(Error::InvalidUsage("previous crtc of plane not in transaction"));
                }
            }
        }

        self.plane_entry(plane)?.state.crtc = crtc;

        match crtc {
            Some(crtc) => {
                self.get_crtc_state(crtc)?.plane_mask |= plane.mask();
                debug!(
                    parent: &self.span,
                    plane = plane.id().raw(),
                    crtc = crtc.id().raw(),
                    "Link plane state to crtc"
                );
            }
            None => debug!(parent: &self.span, plane = plane.id().raw(), "Link plane state to no crtc"),
        }
        Ok(())
    }

    /// Links `connector` to `crtc`, or unlinks it if `crtc` is `None`.
    ///
    /// Keeps the connector masks of both the old and the new crtc state in sync.
    /// A linked connector state keeps its connector alive.
    pub fn set_crtc_for_connector(
        &mut self,
        connector: ConnectorHandle,
        crtc: Option<CrtcHandle>,
    ) -> Result<(), Error> {
        let old = self.connector_entry(connector)?.state.crtc();
        if old == crtc {
            return Ok(());
        }

        if let Some(old) = old {
            match self.get_existing_crtc_state_mut(old) {
                Some(state) => state.connector_mask &= !connector.mask(),
                None => {
                    warn!(
                        parent: &self.span,
                        connector = connector.id().raw(),
                        crtc = old.id().raw(),
                        "Previous crtc of connector is not part of the transaction"
                    );
                    return Err(Error::InvalidUsage("previous crtc of connector not in transaction"));
                }
            }
            self.connector_entry(connector)?.state.bind(None, None);
        }

        match crtc {
            Some(crtc) => {
                self.get_crtc_state(crtc)?.connector_mask |= connector.mask();
                let entry = self.connector_entry(connector)?;
                let binding = entry.connector.clone();
                entry.state.bind(Some(crtc), Some(binding));
                debug!(
                    parent: &self.span,
                    connector = connector.id().raw(),
                    crtc = crtc.id().raw(),
                    "Link connector state to crtc"
                );
            }
            None => debug!(
                parent: &self.span,
                connector = connector.id().raw(),
                "Link connector state to no crtc"
            ),
        }
        Ok(())
    }

    /// Adds every connector currently driven by `crtc` to the transaction.
    ///
    /// This takes the connection lock, which serializes against every other
    /// transaction touching connectors. Only use it when really needed,
    /// e.g. for full modesets.
    pub fn add_affected_connectors(&mut self, crtc: CrtcHandle) -> Result<(), Error> {
        let ctx = self.ctx()?;
        self.dev.connection_lock.lock(&ctx)?;

        debug!(
            parent: &self.span,
            crtc = crtc.id().raw(),
            "Adding all current connectors for crtc to state"
        );

        // changed connectors are already part of the transaction
        for connector in self.dev.connectors() {
            if connector.current_state().crtc() != Some(crtc) {
                continue;
            }
            self.get_connector_state(connector.handle())?;
        }
        Ok(())
    }

    /// Adds every plane currently scanning out to `crtc` to the transaction.
    ///
    /// `crtc` should already be part of the transaction.
    pub fn add_affected_planes(&mut self, crtc: CrtcHandle) -> Result<(), Error> {
        if self.get_existing_crtc_state(crtc).is_none() {
            warn!(
                parent: &self.span,
                crtc = crtc.id().raw(),
                "Adding planes of a crtc not part of the transaction"
            );
        }

        let dev = self.dev.clone();
        let plane_mask = match dev.crtc(crtc) {
            Some(crtc) => crtc.current_state().plane_mask(),
            None => return Err(Error::UnknownReference(crtc.id().into())),
        };

        for plane in dev.planes().iter().filter(|plane| plane_mask & plane.handle().mask() != 0) {
            self.get_plane_state(plane.handle())?;
        }
        Ok(())
    }

    /// Re-acquires every modeset lock of the device after a deadlock.
    ///
    /// For callers that can not rebuild the transaction from scratch. The
    /// transaction should be cleared beforehand.
    pub fn legacy_backoff(&self) -> Result<(), Error> {
        let ctx = self.ctx()?;
        loop {
            ctx.backoff();
            match self.dev.lock_all_ctx(&ctx) {
                Ok(()) => return Ok(()),
                Err(Error::Deadlock) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Crtcs in this transaction with their new state
    pub fn crtcs_in_state(&self) -> impl Iterator<Item = (&Arc<Crtc>, &CrtcState)> {
        self.crtcs.iter().flatten().map(|entry| (&entry.crtc, &entry.state))
    }

    /// Crtcs in this transaction with their mutable new state
    pub fn crtcs_in_state_mut(&mut self) -> impl Iterator<Item = (&Arc<Crtc>, &mut CrtcState)> {
        self.crtcs
            .iter_mut()
            .flatten()
            .map(|entry| (&entry.crtc, &mut entry.state))
    }

    /// Planes in this transaction with their new state
    pub fn planes_in_state(&self) -> impl Iterator<Item = (&Arc<Plane>, &PlaneState)> {
        self.planes.iter().flatten().map(|entry| (&entry.plane, &entry.state))
    }

    /// Planes in this transaction with their mutable new state
    pub fn planes_in_state_mut(&mut self) -> impl Iterator<Item = (&Arc<Plane>, &mut PlaneState)> {
        self.planes
            .iter_mut()
            .flatten()
            .map(|entry| (&entry.plane, &mut entry.state))
    }

    /// Connectors in this transaction with their new state
    pub fn connectors_in_state(&self) -> impl Iterator<Item = (&Arc<Connector>, &ConnectorState)> {
        self.connectors
            .iter()
            .flatten()
            .map(|entry| (&entry.connector, &entry.state))
    }

    /// Connectors in this transaction with their mutable new state
    pub fn connectors_in_state_mut(
        &mut self,
    ) -> impl Iterator<Item = (&Arc<Connector>, &mut ConnectorState)> {
        self.connectors
            .iter_mut()
            .flatten()
            .map(|entry| (&entry.connector, &mut entry.state))
    }

    /// Moves the completion event of every crtc state into a [`CrtcCommit`]
    pub fn setup_commit(&mut self) {
        for entry in self.crtcs.iter_mut().flatten() {
            let commit = entry
                .commit
                .get_or_insert_with(|| CrtcCommit::new(entry.crtc.handle()));
            if let Some(event) = entry.state.take_event() {
                commit.set_event(event);
            }
        }
    }

    /// Makes the states of this transaction the current states of their objects.
    ///
    /// Afterwards the transaction holds the previous states, which get destroyed
    /// together with it. Must only be called from [`ModeConfigFuncs::atomic_commit`](crate::device::ModeConfigFuncs::atomic_commit)
    /// while the object locks are still held. Events are moved into [`CrtcCommit`]s first.
    pub fn swap_state(&mut self) {
        self.setup_commit();

        for entry in self.connectors.iter_mut().flatten() {
            mem::swap(&mut *entry.connector.state.write().unwrap(), &mut entry.state);
        }
        for entry in self.crtcs.iter_mut().flatten() {
            mem::swap(&mut *entry.crtc.state.write().unwrap(), &mut entry.state);
        }
        for entry in self.planes.iter_mut().flatten() {
            mem::swap(&mut *entry.plane.state.write().unwrap(), &mut entry.state);
        }
        debug!(parent: &self.span, "Swapped in new state");
    }

    /// Takes the pending commit of `crtc`, to be completed once the hardware is done
    pub fn take_commit(&mut self, crtc: CrtcHandle) -> Option<CrtcCommit> {
        self.crtcs
            .get_mut(crtc.index)?
            .as_mut()
            .filter(|entry| entry.crtc.handle() == crtc)?
            .commit
            .take()
    }

    /// Takes the pending commits of all crtcs
    pub fn take_commits(&mut self) -> Vec<CrtcCommit> {
        self.crtcs
            .iter_mut()
            .flatten()
            .filter_map(|entry| entry.commit.take())
            .collect()
    }
}

impl Drop for AtomicState {
    fn drop(&mut self) {
        let funcs = self.dev.funcs.clone();
        funcs.atomic_state_clear(self);
        funcs.atomic_state_free(self);
        STATE_IDS.remove(self.id);
        debug!(parent: &self.span, "Freed atomic state");
    }
}

//! Atomic requests of clients
//!
//! [`atomic_ioctl`] turns a list of `(object, property, value)` triples into an
//! [`AtomicState`], checks and commits it, and takes care of the out-fences and
//! flip events requested along the way. Deadlocks encountered while doing so are
//! resolved by clearing the transaction and rebuilding it from the request.

use std::sync::Arc;

use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{debug, info_span, trace, warn};

use super::{AtomicState, Rejected};
use crate::{
    device::{DrmDevice, ModeObject, ObjectId, Property, PropertyId},
    error::Error,
    event::PendingVblankEvent,
    fence::{Fence, SyncFile},
    file::{ClientCapability, DrmFile},
    lock::AcquireContext,
};

bitflags::bitflags! {
    /// Flags of an [`AtomicRequest`]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AtomicCommitFlags: u32 {
        /// Send a flip-complete event for every crtc of the request
        const PAGE_FLIP_EVENT = 0x01;
        /// Flip without waiting for the next vblank
        const PAGE_FLIP_ASYNC = 0x02;
        /// Only check the request, don't apply it
        const TEST_ONLY = 0x0100;
        /// Return before the request reached the hardware
        const NONBLOCK = 0x0200;
        /// Allow the request to require full modesets
        const ALLOW_MODESET = 0x0400;
    }
}

/// A client request to change properties of several objects at once
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    /// Flags of the request
    pub flags: AtomicCommitFlags,
    /// Opaque value passed back with flip events
    pub user_data: u64,
    /// Must be zero
    pub reserved: u64,
    objects: IndexMap<u32, Vec<(u32, u64)>>,
}

impl Default for AtomicCommitFlags {
    fn default() -> Self {
        AtomicCommitFlags::empty()
    }
}

impl AtomicRequest {
    /// Creates an empty request
    pub fn new(flags: AtomicCommitFlags) -> Self {
        AtomicRequest {
            flags,
            ..Default::default()
        }
    }

    /// Adds an object without properties.
    ///
    /// Objects without properties are still looked up and rejected if unknown.
    pub fn add_object(&mut self, object: impl Into<u32>) -> &mut Self {
        self.objects.entry(object.into()).or_default();
        self
    }

    /// Adds a property change, grouped with previous changes of the same object
    pub fn add_property(&mut self, object: impl Into<u32>, property: impl Into<u32>, value: u64) -> &mut Self {
        self.objects
            .entry(object.into())
            .or_default()
            .push((property.into(), value));
        self
    }

    /// Objects of the request with their property changes, in insertion order
    pub fn objects(&self) -> impl Iterator<Item = (u32, &[(u32, u64)])> {
        self.objects.iter().map(|(id, props)| (*id, props.as_slice()))
    }
}

#[derive(Debug)]
struct OutFence {
    ptr: u64,
    fd: Option<i32>,
    sync_file: Option<SyncFile>,
}

/// Builds, checks and commits the request of a client.
///
/// With [`AtomicCommitFlags::TEST_ONLY`] the request is only checked. Otherwise it is
/// committed, blocking unless [`AtomicCommitFlags::NONBLOCK`] is set, and every
/// registered [`BoostNotifier`](crate::boost::BoostNotifier) is kicked.
///
/// On success out-fence descriptors are installed in the client's descriptor table
/// and written to the `OUT_FENCE_PTR` addresses. On failure those addresses read -1
/// and no event is delivered.
pub fn atomic_ioctl(dev: &Arc<DrmDevice>, file: &Arc<DrmFile>, req: &AtomicRequest) -> Result<(), Error> {
    let span = info_span!(parent: None, "atomic_ioctl", device = %dev.name(), flags = ?req.flags);
    let _guard = span.enter();

    if !dev.is_atomic() {
        return Err(Error::InvalidUsage("device does not support atomic modesetting"));
    }
    if !file.has_client_capability(ClientCapability::Atomic) {
        return Err(Error::InvalidUsage("client did not enable atomic modesetting"));
    }
    if AtomicCommitFlags::from_bits(req.flags.bits()).is_none() {
        return Err(Error::InvalidUsage("unknown flags"));
    }
    if req.reserved != 0 {
        return Err(Error::InvalidUsage("reserved field is not zero"));
    }
    if req.flags.contains(AtomicCommitFlags::PAGE_FLIP_ASYNC) && !dev.supports_async_page_flip() {
        return Err(Error::InvalidUsage("async page flips are not supported"));
    }
    // can't test and expect an event at the same time
    if req.flags.contains(AtomicCommitFlags::TEST_ONLY) && req.flags.contains(AtomicCommitFlags::PAGE_FLIP_EVENT) {
        return Err(Error::InvalidUsage("test-only requests can't request events"));
    }

    let test_only = req.flags.contains(AtomicCommitFlags::TEST_ONLY);
    if !test_only {
        dev.kick_boost();
    }

    let ctx = Arc::new(AcquireContext::new());
    let mut state = AtomicState::alloc(dev)?;
    state.set_acquire_ctx(ctx.clone());
    state.set_allow_modeset(req.flags.contains(AtomicCommitFlags::ALLOW_MODESET));
    state.set_file(Some(file.clone()));

    let result = loop {
        let mut plane_mask = 0u32;
        let mut fences = SmallVec::<[OutFence; 4]>::new();

        let prepared = build(dev, &mut state, req, &mut plane_mask)
            .and_then(|()| prepare_crtc_signaling(&mut state, req, file, &mut fences));

        let (result, mut remaining) = match prepared {
            Err(err) => (Err(err), Some(state)),
            Ok(()) if test_only => {
                let result = state.check_only();
                (result, Some(state))
            }
            Ok(()) => {
                let committed = if req.flags.contains(AtomicCommitFlags::NONBLOCK) {
                    state.nonblocking_commit()
                } else {
                    state.commit()
                };
                match committed {
                    Ok(()) => (Ok(()), None),
                    Err(Rejected { error, state }) => (Err(error), Some(state)),
                }
            }
        };

        clean_old_fb(dev, plane_mask, result.is_ok());
        complete_crtc_signaling(file, remaining.as_mut(), fences, result.is_ok());

        match (result, remaining) {
            (Err(Error::Deadlock), Some(mut retry)) => {
                debug!("Deadlock while building atomic state, retrying");
                retry.clear();
                ctx.backoff();
                state = retry;
            }
            (result, remaining) => {
                drop(remaining);
                break result;
            }
        }
    };

    ctx.drop_locks();
    if let Err(err) = &result {
        debug!(?err, "Atomic request failed");
    }
    result
}

fn build(
    dev: &DrmDevice,
    state: &mut AtomicState,
    req: &AtomicRequest,
    plane_mask: &mut u32,
) -> Result<(), Error> {
    let test_only = req.flags.contains(AtomicCommitFlags::TEST_ONLY);

    for (&id, props) in &req.objects {
        let object = dev
            .find_object(id as u64)
            .ok_or(Error::UnknownReference(id as u64))?;
        if object.properties().is_empty() {
            return Err(Error::UnknownReference(id as u64));
        }

        for &(prop, value) in props {
            let property = PropertyId(prop);
            let property = object
                .has_property(property)
                .then(|| dev.property(property))
                .flatten()
                .ok_or(Error::UnknownProperty {
                    object: ObjectId(id),
                    property,
                })?;
            set_property(state, &object, property, value)?;
        }

        if let ModeObject::Plane(plane) = &object {
            if !props.is_empty() && !test_only {
                *plane_mask |= plane.handle().mask();
                let mut legacy = plane.legacy.lock().unwrap();
                legacy.old_fb = legacy.fb.clone();
            }
        }
    }
    Ok(())
}

fn set_property(state: &mut AtomicState, object: &ModeObject, property: &Property, value: u64) -> Result<(), Error> {
    if !property.validate(value) {
        debug!(property = property.name(), value, "Invalid property value");
        return Err(Error::InvalidUsage("invalid property value"));
    }

    match object {
        ModeObject::Crtc(crtc) => state.set_crtc_property(crtc.handle(), property, value),
        ModeObject::Plane(plane) => state.set_plane_property(plane.handle(), property, value),
        ModeObject::Connector(connector) => state.set_connector_property(connector.handle(), property, value),
        ModeObject::Framebuffer(_) | ModeObject::Blob(_) => Err(Error::InvalidUsage("object has no atomic properties")),
    }
}

/// Updates the legacy framebuffer bookkeeping of the planes touched by a request
fn clean_old_fb(dev: &DrmDevice, plane_mask: u32, committed: bool) {
    for plane in dev.planes().iter().filter(|plane| plane_mask & plane.handle().mask() != 0) {
        let mut legacy = plane.legacy.lock().unwrap();
        if committed {
            let state = plane.current_state();
            legacy.fb = state.fb().cloned();
            legacy.crtc = state.crtc();
        }
        legacy.old_fb = None;
    }
}

fn setup_out_fence(out: &mut OutFence, file: &DrmFile, fence: &Arc<Fence>) -> Result<(), Error> {
    let fd = file.reserve_fd()?;
    out.fd = Some(fd);
    file.user().put_i32(out.ptr, fd)?;
    out.sync_file = Some(SyncFile::new(fence.clone()));
    Ok(())
}

/// Creates the events and out-fences requested for the crtcs of the transaction.
///
/// Everything set up here is either installed or rolled back by [`complete_crtc_signaling`].
fn prepare_crtc_signaling(
    state: &mut AtomicState,
    req: &AtomicRequest,
    file: &Arc<DrmFile>,
    fences: &mut SmallVec<[OutFence; 4]>,
) -> Result<(), Error> {
    if req.flags.contains(AtomicCommitFlags::TEST_ONLY) {
        return Ok(());
    }
    let page_flip_event = req.flags.contains(AtomicCommitFlags::PAGE_FLIP_EVENT);

    for entry in state.crtcs.iter_mut().flatten() {
        let fence_ptr = entry.out_fence_ptr;

        if page_flip_event || fence_ptr.is_some() {
            let mut event = PendingVblankEvent::new(entry.crtc.handle(), req.user_data);
            if page_flip_event {
                event.reserve(file)?;
            }
            entry.state.set_event(event);
        }

        if let Some(ptr) = fence_ptr {
            let fence = entry.crtc.create_fence();
            let mut out = OutFence {
                ptr,
                fd: None,
                sync_file: None,
            };
            let result = setup_out_fence(&mut out, file, &fence);
            fences.push(out);
            result?;

            trace!(crtc = entry.crtc.id().raw(), seqno = fence.seqno(), "Created out-fence");
            if let Some(event) = entry.state.event.as_mut() {
                event.set_fence(fence);
            }
        }
    }
    Ok(())
}

/// Installs the out-fences of a successful request, or rolls back everything
/// [`prepare_crtc_signaling`] did
fn complete_crtc_signaling(
    file: &DrmFile,
    state: Option<&mut AtomicState>,
    fences: SmallVec<[OutFence; 4]>,
    install: bool,
) {
    if install {
        for out in fences {
            if let (Some(fd), Some(sync_file)) = (out.fd, out.sync_file) {
                if let Err(err) = file.install_fd(fd, sync_file) {
                    warn!(fd, ?err, "Failed to install out-fence");
                }
            }
        }
        return;
    }

    if let Some(state) = state {
        for entry in state.crtcs.iter_mut().flatten() {
            // events created by drivers are released together with the state
            if entry.state.event().map_or(false, PendingVblankEvent::is_client_event) {
                if let Some(event) = entry.state.take_event() {
                    event.cancel();
                }
            }
        }
    }

    for out in fences {
        drop(out.sync_file);
        if let Some(fd) = out.fd {
            file.put_unused_fd(fd);
        }
        if file.user().put_i32(out.ptr, -1).is_err() {
            debug!(ptr = out.ptr, "Couldn't clear out-fence pointer");
        }
    }
}

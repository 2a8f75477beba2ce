use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock, RwLockReadGuard,
    },
};

use drm_fourcc::DrmFourcc;

use super::{framebuffer::Framebuffer, ConnectorFuncs, CrtcFuncs, PlaneFuncs, PlaneInfo, PropertyId};
use crate::{
    atomic::{ConnectorState, CrtcState, PlaneState},
    fence::{Fence, FenceContext},
    lock::ModesetLock,
};

/// Identifier of a mode object, unique per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub(crate) u32);

impl ObjectId {
    /// Returns the raw id as used on the property interface
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl From<ObjectId> for u32 {
    fn from(id: ObjectId) -> u32 {
        id.0
    }
}

impl From<ObjectId> for u64 {
    fn from(id: ObjectId) -> u64 {
        id.0 as u64
    }
}

/// Kind of a mode object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// A crtc
    Crtc,
    /// A plane
    Plane,
    /// A connector
    Connector,
    /// A framebuffer
    Framebuffer,
    /// A property blob
    Blob,
}

macro_rules! object_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name {
            pub(crate) id: ObjectId,
            pub(crate) index: usize,
        }

        impl $name {
            /// Object id of the referenced object
            pub fn id(&self) -> ObjectId {
                self.id
            }

            /// Dense index of the object among all objects of its kind
            pub fn index(&self) -> usize {
                self.index
            }

            /// Bit of this object in membership masks
            pub fn mask(&self) -> u32 {
                1 << self.index
            }
        }

        impl From<$name> for ObjectId {
            fn from(handle: $name) -> ObjectId {
                handle.id
            }
        }
    };
}

object_handle!(
    /// Handle to a [`Crtc`]
    CrtcHandle
);
object_handle!(
    /// Handle to a [`Plane`]
    PlaneHandle
);
object_handle!(
    /// Handle to a [`Connector`]
    ConnectorHandle
);

/// A scan-out engine, driving a mode on a set of connectors
pub struct Crtc {
    pub(crate) handle: CrtcHandle,
    pub(crate) name: String,
    pub(crate) lock: ModesetLock,
    pub(crate) state: RwLock<CrtcState>,
    pub(crate) funcs: Arc<dyn CrtcFuncs>,
    pub(crate) properties: Vec<PropertyId>,
    fence_context: FenceContext,
    fence_seqno: AtomicU64,
}

impl fmt::Debug for Crtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crtc")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Crtc {
    pub(crate) fn new(
        handle: CrtcHandle,
        name: String,
        funcs: Arc<dyn CrtcFuncs>,
        properties: Vec<PropertyId>,
    ) -> Self {
        Crtc {
            handle,
            name,
            lock: ModesetLock::new(),
            state: RwLock::new(CrtcState::new(handle)),
            funcs,
            properties,
            fence_context: FenceContext::alloc(),
            fence_seqno: AtomicU64::new(0),
        }
    }

    /// Handle of this crtc
    pub fn handle(&self) -> CrtcHandle {
        self.handle
    }

    /// Object id of this crtc
    pub fn id(&self) -> ObjectId {
        self.handle.id
    }

    /// Name of this crtc
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock protecting the state of this crtc
    pub fn lock(&self) -> &ModesetLock {
        &self.lock
    }

    /// The currently committed state
    pub fn current_state(&self) -> RwLockReadGuard<'_, CrtcState> {
        self.state.read().unwrap()
    }

    /// Properties attached to this crtc
    pub fn properties(&self) -> &[PropertyId] {
        &self.properties
    }

    /// Creates a new fence on the timeline of this crtc
    pub fn create_fence(&self) -> Arc<Fence> {
        let seqno = self.fence_seqno.fetch_add(1, Ordering::AcqRel) + 1;
        Arc::new(Fence::new(self.fence_context, seqno))
    }
}

/// Role of a plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    /// Main plane of a crtc
    Primary,
    /// Additional plane composited by the hardware
    Overlay,
    /// Plane usually used for the cursor
    Cursor,
}

/// Framebuffer bookkeeping for the legacy interfaces
#[derive(Debug, Default)]
pub(crate) struct LegacyPlane {
    pub fb: Option<Arc<Framebuffer>>,
    pub old_fb: Option<Arc<Framebuffer>>,
    pub crtc: Option<CrtcHandle>,
}

/// A hardware layer feeding pixels from a framebuffer into a crtc
pub struct Plane {
    pub(crate) handle: PlaneHandle,
    pub(crate) name: String,
    pub(crate) plane_type: PlaneType,
    pub(crate) possible_crtcs: u32,
    pub(crate) formats: Vec<DrmFourcc>,
    pub(crate) zpos_property: Option<PropertyId>,
    pub(crate) lock: ModesetLock,
    pub(crate) state: RwLock<PlaneState>,
    pub(crate) funcs: Arc<dyn PlaneFuncs>,
    pub(crate) properties: Vec<PropertyId>,
    pub(crate) legacy: Mutex<LegacyPlane>,
}

impl fmt::Debug for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plane")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("plane_type", &self.plane_type)
            .field("possible_crtcs", &self.possible_crtcs)
            .finish_non_exhaustive()
    }
}

impl Plane {
    pub(crate) fn new(
        handle: PlaneHandle,
        info: PlaneInfo,
        properties: Vec<PropertyId>,
        zpos_property: Option<PropertyId>,
        initial_zpos: u64,
    ) -> Self {
        let mut state = PlaneState::new(handle);
        state.zpos = initial_zpos;

        Plane {
            handle,
            name: info.name,
            plane_type: info.plane_type,
            possible_crtcs: info.possible_crtcs,
            formats: info.formats,
            zpos_property,
            lock: ModesetLock::new(),
            state: RwLock::new(state),
            funcs: info.funcs,
            properties,
            legacy: Mutex::new(LegacyPlane::default()),
        }
    }

    /// Handle of this plane
    pub fn handle(&self) -> PlaneHandle {
        self.handle
    }

    /// Object id of this plane
    pub fn id(&self) -> ObjectId {
        self.handle.id
    }

    /// Name of this plane
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role of this plane
    pub fn plane_type(&self) -> PlaneType {
        self.plane_type
    }

    /// Mask of crtc indices this plane can be used with
    pub fn possible_crtcs(&self) -> u32 {
        self.possible_crtcs
    }

    /// Returns true, if the plane can scan out framebuffers of the given format
    pub fn supports_format(&self, format: DrmFourcc) -> bool {
        self.formats.contains(&format)
    }

    /// Lock protecting the state of this plane
    pub fn lock(&self) -> &ModesetLock {
        &self.lock
    }

    /// The currently committed state
    pub fn current_state(&self) -> RwLockReadGuard<'_, PlaneState> {
        self.state.read().unwrap()
    }

    /// Properties attached to this plane
    pub fn properties(&self) -> &[PropertyId] {
        &self.properties
    }

    /// Framebuffer last set through a successful commit, for legacy users
    pub fn legacy_fb(&self) -> Option<Arc<Framebuffer>> {
        self.legacy.lock().unwrap().fb.clone()
    }

    /// Crtc last set through a successful commit, for legacy users
    pub fn legacy_crtc(&self) -> Option<CrtcHandle> {
        self.legacy.lock().unwrap().crtc
    }
}

/// DPMS value reported while a connector is on
pub const DPMS_ON: u64 = 0;
/// DPMS value reported while a connector is off
pub const DPMS_OFF: u64 = 3;

/// A display sink attached to the device
pub struct Connector {
    pub(crate) handle: ConnectorHandle,
    pub(crate) name: String,
    pub(crate) state: RwLock<ConnectorState>,
    pub(crate) funcs: Arc<dyn ConnectorFuncs>,
    pub(crate) properties: Vec<PropertyId>,
    pub(crate) dpms: AtomicU64,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Connector {
    pub(crate) fn new(
        handle: ConnectorHandle,
        name: String,
        funcs: Arc<dyn ConnectorFuncs>,
        properties: Vec<PropertyId>,
    ) -> Self {
        Connector {
            handle,
            name,
            state: RwLock::new(ConnectorState::new(handle)),
            funcs,
            properties,
            dpms: AtomicU64::new(DPMS_OFF),
        }
    }

    /// Handle of this connector
    pub fn handle(&self) -> ConnectorHandle {
        self.handle
    }

    /// Object id of this connector
    pub fn id(&self) -> ObjectId {
        self.handle.id
    }

    /// Name of this connector
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The currently committed state
    pub fn current_state(&self) -> RwLockReadGuard<'_, ConnectorState> {
        self.state.read().unwrap()
    }

    /// Properties attached to this connector
    pub fn properties(&self) -> &[PropertyId] {
        &self.properties
    }

    /// Legacy DPMS value
    pub fn dpms(&self) -> u64 {
        self.dpms.load(Ordering::Acquire)
    }

    /// Updates the legacy DPMS value, usually done by the driver on commit
    pub fn set_dpms(&self, value: u64) {
        self.dpms.store(value, Ordering::Release);
    }
}

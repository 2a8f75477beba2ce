//! Mode objects of a display device
//!
//! A [`DrmDevice`] owns the crtcs, planes and connectors of one display
//! controller together with the committed ("current") state of each of them,
//! the registered properties, framebuffers and property blobs.
//!
//! Devices are assembled once through a [`DrmDeviceBuilder`], only connectors,
//! framebuffers and blobs come and go afterwards.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use atomic_kms::device::*;
//! # fn funcs() -> (Arc<dyn ModeConfigFuncs>, Arc<dyn CrtcFuncs>, Arc<dyn PlaneFuncs>, Arc<dyn ConnectorFuncs>) { unimplemented!() }
//! let (config, crtc_funcs, plane_funcs, connector_funcs) = funcs();
//! let mut builder = DrmDevice::builder("card0", config);
//! let crtc = builder.add_crtc("crtc-0", crtc_funcs).unwrap();
//! builder.add_plane(PlaneInfo {
//!     name: "primary-0".into(),
//!     plane_type: PlaneType::Primary,
//!     possible_crtcs: crtc.mask(),
//!     formats: vec![drm_fourcc::DrmFourcc::Xrgb8888],
//!     zpos: None,
//!     funcs: plane_funcs,
//! }).unwrap();
//! builder.add_connector("HDMI-A-1", connector_funcs.clone()).unwrap();
//! let device = builder.build().unwrap();
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, RwLock, Weak},
};

use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{debug, info, warn};

mod blob;
mod framebuffer;
mod funcs;
pub mod mode;
mod object;
mod property;

pub use self::blob::{ColorCtm, ColorLut, PropertyBlob};
pub use self::framebuffer::Framebuffer;
pub use self::funcs::{ConnectorFuncs, CrtcFuncs, ModeConfigFuncs, PlaneFuncs};
pub use self::mode::Mode;
pub use self::object::{
    Connector, ConnectorHandle, Crtc, CrtcHandle, ObjectId, ObjectType, Plane, PlaneHandle, PlaneType,
    DPMS_OFF, DPMS_ON,
};
pub use self::property::{CoreProperties, Property, PropertyId, PropertyKind};

use crate::{
    atomic::{self, Rotation},
    boost::BoostNotifier,
    error::Error,
    lock::{AcquireContext, ModesetLock},
    utils::ids::IdAllocator,
};

/// Objects of one kind are tracked in 32 bit membership masks
const MAX_OBJECTS: usize = 32;

/// Any object that can be looked up by id
#[derive(Debug, Clone)]
pub enum ModeObject {
    /// A crtc
    Crtc(Arc<Crtc>),
    /// A plane
    Plane(Arc<Plane>),
    /// A connector
    Connector(Arc<Connector>),
    /// A framebuffer
    Framebuffer(Arc<Framebuffer>),
    /// A property blob
    Blob(Arc<PropertyBlob>),
}

impl ModeObject {
    /// Kind of the object
    pub fn object_type(&self) -> ObjectType {
        match self {
            ModeObject::Crtc(_) => ObjectType::Crtc,
            ModeObject::Plane(_) => ObjectType::Plane,
            ModeObject::Connector(_) => ObjectType::Connector,
            ModeObject::Framebuffer(_) => ObjectType::Framebuffer,
            ModeObject::Blob(_) => ObjectType::Blob,
        }
    }

    /// Properties attached to the object
    pub fn properties(&self) -> &[PropertyId] {
        match self {
            ModeObject::Crtc(crtc) => crtc.properties(),
            ModeObject::Plane(plane) => plane.properties(),
            ModeObject::Connector(connector) => connector.properties(),
            ModeObject::Framebuffer(_) | ModeObject::Blob(_) => &[],
        }
    }

    /// Returns true, if `property` is attached to the object
    pub fn has_property(&self, property: PropertyId) -> bool {
        self.properties().contains(&property)
    }
}

/// Description of a plane to be added through [`DrmDeviceBuilder::add_plane`]
#[derive(Debug)]
pub struct PlaneInfo {
    /// Name used in logs
    pub name: String,
    /// Role of the plane
    pub plane_type: PlaneType,
    /// Mask of crtcs the plane can be used with, see [`CrtcHandle::mask`]
    pub possible_crtcs: u32,
    /// Supported framebuffer formats
    pub formats: Vec<DrmFourcc>,
    /// Range of the `zpos` property, if the plane has one
    pub zpos: Option<(u64, u64)>,
    /// Driver callbacks
    pub funcs: Arc<dyn PlaneFuncs>,
}

/// A display device and its mode objects
pub struct DrmDevice {
    name: String,
    atomic: bool,
    async_page_flip: bool,
    ids: IdAllocator,
    pub(crate) crtcs: Vec<Arc<Crtc>>,
    pub(crate) planes: Vec<Arc<Plane>>,
    pub(crate) connectors: RwLock<Vec<Option<Arc<Connector>>>>,
    connector_properties: Vec<PropertyId>,
    objects: RwLock<HashMap<ObjectId, ModeObject>>,
    // blobs created by the core live as long as a state references them
    mode_blobs: Mutex<HashMap<ObjectId, Weak<PropertyBlob>>>,
    properties: HashMap<PropertyId, Arc<Property>>,
    core: CoreProperties,
    pub(crate) connection_lock: ModesetLock,
    pub(crate) funcs: Arc<dyn ModeConfigFuncs>,
    boost: Vec<Arc<dyn BoostNotifier>>,
}

impl fmt::Debug for DrmDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmDevice")
            .field("name", &self.name)
            .field("atomic", &self.atomic)
            .field("async_page_flip", &self.async_page_flip)
            .field("crtcs", &self.crtcs)
            .field("planes", &self.planes)
            .field("funcs", &self.funcs)
            .finish_non_exhaustive()
    }
}

impl DrmDevice {
    /// Starts assembling a new device
    pub fn builder(name: impl Into<String>, funcs: Arc<dyn ModeConfigFuncs>) -> DrmDeviceBuilder {
        DrmDeviceBuilder::new(name.into(), funcs)
    }

    /// Name of the device
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true, if the device supports atomic modesetting
    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    /// Returns true, if the device supports asynchronous page flips
    pub fn supports_async_page_flip(&self) -> bool {
        self.async_page_flip
    }

    /// All crtcs of the device, ordered by index
    pub fn crtcs(&self) -> &[Arc<Crtc>] {
        &self.crtcs
    }

    /// Looks up a crtc by handle
    pub fn crtc(&self, handle: CrtcHandle) -> Option<&Arc<Crtc>> {
        self.crtcs.get(handle.index).filter(|crtc| crtc.handle == handle)
    }

    /// All planes of the device, ordered by index
    pub fn planes(&self) -> &[Arc<Plane>] {
        &self.planes
    }

    /// Looks up a plane by handle
    pub fn plane(&self, handle: PlaneHandle) -> Option<&Arc<Plane>> {
        self.planes.get(handle.index).filter(|plane| plane.handle == handle)
    }

    /// Currently attached connectors, ordered by index
    pub fn connectors(&self) -> Vec<Arc<Connector>> {
        self.connectors.read().unwrap().iter().flatten().cloned().collect()
    }

    /// Looks up an attached connector by handle
    pub fn connector(&self, handle: ConnectorHandle) -> Option<Arc<Connector>> {
        self.connectors
            .read()
            .unwrap()
            .get(handle.index)
            .and_then(Option::as_ref)
            .filter(|connector| connector.handle == handle)
            .cloned()
    }

    /// Number of crtcs
    pub fn num_crtcs(&self) -> usize {
        self.crtcs.len()
    }

    /// Number of planes
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// Number of connector slots, including slots of removed connectors
    pub fn num_connectors(&self) -> usize {
        self.connectors.read().unwrap().len()
    }

    /// Ids of the properties handled by the core
    pub fn core_properties(&self) -> &CoreProperties {
        &self.core
    }

    /// Looks up a registered property
    pub fn property(&self, id: PropertyId) -> Option<&Arc<Property>> {
        self.properties.get(&id)
    }

    /// Looks up any mode object by its raw id
    pub fn find_object(&self, id: u64) -> Option<ModeObject> {
        let id = ObjectId(u32::try_from(id).ok()?);
        if let Some(object) = self.objects.read().unwrap().get(&id) {
            return Some(object.clone());
        }
        self.mode_blobs
            .lock()
            .unwrap()
            .get(&id)
            .and_then(Weak::upgrade)
            .map(ModeObject::Blob)
    }

    /// Looks up a crtc by its raw id
    pub fn find_crtc(&self, id: u64) -> Option<Arc<Crtc>> {
        match self.find_object(id)? {
            ModeObject::Crtc(crtc) => Some(crtc),
            _ => None,
        }
    }

    /// Looks up a property blob by its raw id
    pub fn lookup_blob(&self, id: u64) -> Option<Arc<PropertyBlob>> {
        match self.find_object(id)? {
            ModeObject::Blob(blob) => Some(blob),
            _ => None,
        }
    }

    /// Looks up a framebuffer by its raw id
    pub fn lookup_framebuffer(&self, id: u64) -> Option<Arc<Framebuffer>> {
        match self.find_object(id)? {
            ModeObject::Framebuffer(fb) => Some(fb),
            _ => None,
        }
    }

    fn alloc_blob(&self, data: &[u8]) -> Result<Arc<PropertyBlob>, Error> {
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(data.len())?;
        buffer.extend_from_slice(data);

        Ok(Arc::new(PropertyBlob {
            id: ObjectId(self.ids.next()),
            data: buffer.into_boxed_slice(),
        }))
    }

    /// Registers a new property blob with a copy of `data`.
    ///
    /// The blob stays registered until [`DrmDevice::destroy_blob`] is called.
    pub fn create_blob(&self, data: &[u8]) -> Result<Arc<PropertyBlob>, Error> {
        let blob = self.alloc_blob(data)?;
        self.objects
            .write()
            .unwrap()
            .insert(blob.id, ModeObject::Blob(blob.clone()));
        debug!(blob = blob.id.0, len = data.len(), "Created property blob");
        Ok(blob)
    }

    /// Creates a blob owned by the states referencing it.
    ///
    /// The blob can be looked up by id until the last reference is dropped.
    pub(crate) fn create_mode_blob(&self, data: &[u8]) -> Result<Arc<PropertyBlob>, Error> {
        let blob = self.alloc_blob(data)?;

        let mut mode_blobs = self.mode_blobs.lock().unwrap();
        mode_blobs.retain(|id, blob| {
            let alive = blob.strong_count() > 0;
            if !alive {
                self.ids.remove(id.0);
            }
            alive
        });
        mode_blobs.insert(blob.id, Arc::downgrade(&blob));

        debug!(blob = blob.id.0, len = data.len(), "Created mode blob");
        Ok(blob)
    }

    /// Unregisters a property blob.
    ///
    /// States still referencing the blob keep their reference.
    pub fn destroy_blob(&self, id: ObjectId) -> Result<(), Error> {
        let mut objects = self.objects.write().unwrap();
        match objects.get(&id) {
            Some(ModeObject::Blob(_)) => {
                objects.remove(&id);
                self.ids.remove(id.0);
                Ok(())
            }
            _ => Err(Error::UnknownReference(id.0 as u64)),
        }
    }

    /// Registers a new framebuffer
    pub fn add_framebuffer(
        &self,
        width: u32,
        height: u32,
        format: DrmFourcc,
        modifier: DrmModifier,
    ) -> Arc<Framebuffer> {
        let fb = Arc::new(Framebuffer {
            id: ObjectId(self.ids.next()),
            width,
            height,
            format,
            modifier,
        });
        self.objects
            .write()
            .unwrap()
            .insert(fb.id, ModeObject::Framebuffer(fb.clone()));
        debug!(fb = fb.id.0, width, height, ?format, "Added framebuffer");
        fb
    }

    /// Unregisters a framebuffer.
    ///
    /// States still scanning out of the framebuffer keep their reference.
    pub fn remove_framebuffer(&self, id: ObjectId) -> Result<(), Error> {
        let mut objects = self.objects.write().unwrap();
        match objects.get(&id) {
            Some(ModeObject::Framebuffer(_)) => {
                objects.remove(&id);
                self.ids.remove(id.0);
                Ok(())
            }
            _ => Err(Error::UnknownReference(id.0 as u64)),
        }
    }

    /// Attaches a new connector, reusing the lowest free connector slot
    pub fn add_connector(
        &self,
        name: impl Into<String>,
        funcs: Arc<dyn ConnectorFuncs>,
    ) -> Result<ConnectorHandle, Error> {
        let mut connectors = self.connectors.write().unwrap();
        let index = connectors
            .iter()
            .position(Option::is_none)
            .unwrap_or(connectors.len());
        if index >= MAX_OBJECTS {
            return Err(Error::InvalidUsage("too many connectors"));
        }

        let handle = ConnectorHandle {
            id: ObjectId(self.ids.next()),
            index,
        };
        let connector = Arc::new(Connector::new(
            handle,
            name.into(),
            funcs,
            self.connector_properties.clone(),
        ));
        if index == connectors.len() {
            connectors.push(Some(connector.clone()));
        } else {
            connectors[index] = Some(connector.clone());
        }
        self.objects
            .write()
            .unwrap()
            .insert(handle.id, ModeObject::Connector(connector.clone()));

        info!(connector = connector.name(), index, "Connector attached");
        Ok(handle)
    }

    /// Detaches a connector.
    ///
    /// The connector has to be disabled, i.e. its current state may not be bound to a crtc.
    pub fn remove_connector(&self, handle: ConnectorHandle) -> Result<(), Error> {
        let mut connectors = self.connectors.write().unwrap();
        let connector = connectors
            .get(handle.index)
            .and_then(Option::as_ref)
            .filter(|connector| connector.handle == handle)
            .cloned()
            .ok_or(Error::UnknownReference(handle.id.0 as u64))?;

        if connector.current_state().crtc().is_some() {
            return Err(Error::InvalidUsage("removing an enabled connector"));
        }

        connectors[handle.index] = None;
        self.objects.write().unwrap().remove(&handle.id);
        self.ids.remove(handle.id.0);
        info!(connector = connector.name(), "Connector detached");
        Ok(())
    }

    /// Acquires every modeset lock of the device with `ctx`
    pub fn lock_all_ctx(&self, ctx: &AcquireContext) -> Result<(), Error> {
        self.connection_lock.lock(ctx)?;
        for crtc in &self.crtcs {
            crtc.lock.lock(ctx)?;
        }
        for plane in &self.planes {
            plane.lock.lock(ctx)?;
        }
        Ok(())
    }

    /// Lock shared by all connectors
    pub fn connection_lock(&self) -> &ModesetLock {
        &self.connection_lock
    }

    /// Reads a property of an object from its current state
    pub fn get_property(&self, object: ObjectId, property: PropertyId) -> Result<u64, Error> {
        let obj = self
            .find_object(object.0 as u64)
            .ok_or(Error::UnknownReference(object.0 as u64))?;
        if !obj.has_property(property) {
            return Err(Error::UnknownProperty { object, property });
        }
        let prop = self
            .property(property)
            .ok_or(Error::UnknownProperty { object, property })?;

        match obj {
            ModeObject::Crtc(crtc) => {
                let state = crtc.current_state();
                atomic::crtc::get_property(self, &crtc, &state, prop)
            }
            ModeObject::Plane(plane) => {
                let state = plane.current_state();
                atomic::plane::get_property(self, &plane, &state, prop)
            }
            ModeObject::Connector(connector) => {
                let state = connector.current_state();
                atomic::connector::get_property(self, &connector, &state, prop)
            }
            ModeObject::Framebuffer(_) | ModeObject::Blob(_) => {
                Err(Error::UnknownProperty { object, property })
            }
        }
    }

    /// Kicks all registered boost notifiers
    pub(crate) fn kick_boost(&self) {
        for notifier in &self.boost {
            notifier.kick();
        }
    }
}

impl Drop for DrmDevice {
    fn drop(&mut self) {
        // connector states bound to a crtc keep their connector alive
        for connector in self.connectors.get_mut().unwrap().iter().flatten() {
            if let Ok(mut state) = connector.state.write() {
                state.release_binding();
            }
        }
    }
}

/// Assembles a [`DrmDevice`]
pub struct DrmDeviceBuilder {
    name: String,
    atomic: bool,
    async_page_flip: bool,
    ids: IdAllocator,
    crtcs: Vec<Crtc>,
    planes: Vec<(PlaneHandle, PlaneInfo, Option<PropertyId>)>,
    connectors: Vec<(ConnectorHandle, String, Arc<dyn ConnectorFuncs>)>,
    properties: HashMap<PropertyId, Arc<Property>>,
    driver_properties: HashMap<ObjectType, Vec<PropertyId>>,
    core: CoreProperties,
    funcs: Arc<dyn ModeConfigFuncs>,
    boost: Vec<Arc<dyn BoostNotifier>>,
}

impl fmt::Debug for DrmDeviceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmDeviceBuilder")
            .field("name", &self.name)
            .field("atomic", &self.atomic)
            .field("async_page_flip", &self.async_page_flip)
            .field("crtcs", &self.crtcs.len())
            .field("planes", &self.planes.len())
            .field("connectors", &self.connectors.len())
            .finish_non_exhaustive()
    }
}

fn register(
    ids: &IdAllocator,
    properties: &mut HashMap<PropertyId, Arc<Property>>,
    name: &'static str,
    kind: PropertyKind,
    immutable: bool,
) -> PropertyId {
    let id = PropertyId(ids.next());
    properties.insert(
        id,
        Arc::new(Property {
            id,
            name,
            kind,
            immutable,
        }),
    );
    id
}

impl DrmDeviceBuilder {
    fn new(name: String, funcs: Arc<dyn ModeConfigFuncs>) -> Self {
        let ids = IdAllocator::new();
        let mut properties = HashMap::new();

        let i32_range = PropertyKind::SignedRange {
            min: i32::MIN as i64,
            max: i32::MAX as i64,
        };
        let u32_range = PropertyKind::Range {
            min: 0,
            max: u32::MAX as u64,
        };
        let int_range = PropertyKind::Range {
            min: 0,
            max: i32::MAX as u64,
        };

        let mut reg =
            |name: &'static str, kind: PropertyKind| register(&ids, &mut properties, name, kind, false);
        let core = CoreProperties {
            active: reg("ACTIVE", PropertyKind::Bool),
            mode_id: reg("MODE_ID", PropertyKind::Blob),
            degamma_lut: reg("DEGAMMA_LUT", PropertyKind::Blob),
            gamma_lut: reg("GAMMA_LUT", PropertyKind::Blob),
            ctm: reg("CTM", PropertyKind::Blob),
            out_fence_ptr: reg("OUT_FENCE_PTR", PropertyKind::Range { min: 0, max: u64::MAX }),
            fb_id: reg("FB_ID", PropertyKind::Object(ObjectType::Framebuffer)),
            in_fence_fd: reg(
                "IN_FENCE_FD",
                PropertyKind::SignedRange {
                    min: -1,
                    max: i32::MAX as i64,
                },
            ),
            crtc_id: reg("CRTC_ID", PropertyKind::Object(ObjectType::Crtc)),
            crtc_x: reg("CRTC_X", i32_range.clone()),
            crtc_y: reg("CRTC_Y", i32_range),
            crtc_w: reg("CRTC_W", int_range.clone()),
            crtc_h: reg("CRTC_H", int_range),
            src_x: reg("SRC_X", u32_range.clone()),
            src_y: reg("SRC_Y", u32_range.clone()),
            src_w: reg("SRC_W", u32_range.clone()),
            src_h: reg("SRC_H", u32_range),
            rotation: reg("rotation", Rotation::property_kind()),
            dpms: reg(
                "DPMS",
                PropertyKind::Enum(vec![(0, "On"), (1, "Standby"), (2, "Suspend"), (3, "Off")]),
            ),
        };

        DrmDeviceBuilder {
            name,
            atomic: true,
            async_page_flip: false,
            ids,
            crtcs: Vec::new(),
            planes: Vec::new(),
            connectors: Vec::new(),
            properties,
            driver_properties: HashMap::new(),
            core,
            funcs,
            boost: Vec::new(),
        }
    }

    /// Sets whether the device supports atomic modesetting, defaults to `true`
    pub fn atomic(&mut self, atomic: bool) -> &mut Self {
        self.atomic = atomic;
        self
    }

    /// Sets whether the device supports asynchronous page flips, defaults to `false`
    pub fn async_page_flip(&mut self, supported: bool) -> &mut Self {
        self.async_page_flip = supported;
        self
    }

    /// Registers a notifier kicked on every non-test atomic request
    pub fn boost_notifier(&mut self, notifier: Arc<dyn BoostNotifier>) -> &mut Self {
        self.boost.push(notifier);
        self
    }

    /// Registers a driver property, attached to every object of the given kind.
    ///
    /// Values of driver properties are handled by the `set_property` and
    /// `get_property` hooks of the object kind.
    pub fn driver_property(
        &mut self,
        object_type: ObjectType,
        name: &'static str,
        kind: PropertyKind,
    ) -> Result<PropertyId, Error> {
        self.add_driver_property(object_type, name, kind, false)
    }

    /// Registers a driver property clients can only read.
    ///
    /// Every value set through an atomic request is rejected, the driver reports
    /// the value through its `get_property` hook.
    pub fn immutable_driver_property(
        &mut self,
        object_type: ObjectType,
        name: &'static str,
        kind: PropertyKind,
    ) -> Result<PropertyId, Error> {
        self.add_driver_property(object_type, name, kind, true)
    }

    fn add_driver_property(
        &mut self,
        object_type: ObjectType,
        name: &'static str,
        kind: PropertyKind,
        immutable: bool,
    ) -> Result<PropertyId, Error> {
        if !matches!(
            object_type,
            ObjectType::Crtc | ObjectType::Plane | ObjectType::Connector
        ) {
            return Err(Error::InvalidUsage("properties need a crtc, plane or connector"));
        }
        let id = register(&self.ids, &mut self.properties, name, kind, immutable);
        self.driver_properties.entry(object_type).or_default().push(id);
        Ok(id)
    }

    /// Adds a crtc
    pub fn add_crtc(
        &mut self,
        name: impl Into<String>,
        funcs: Arc<dyn CrtcFuncs>,
    ) -> Result<CrtcHandle, Error> {
        if self.crtcs.len() >= MAX_OBJECTS {
            return Err(Error::InvalidUsage("too many crtcs"));
        }
        let handle = CrtcHandle {
            id: ObjectId(self.ids.next()),
            index: self.crtcs.len(),
        };
        self.crtcs.push(Crtc::new(handle, name.into(), funcs, Vec::new()));
        Ok(handle)
    }

    /// Adds a plane
    pub fn add_plane(&mut self, info: PlaneInfo) -> Result<PlaneHandle, Error> {
        if self.planes.len() >= MAX_OBJECTS {
            return Err(Error::InvalidUsage("too many planes"));
        }
        let handle = PlaneHandle {
            id: ObjectId(self.ids.next()),
            index: self.planes.len(),
        };
        let zpos = info.zpos.map(|(min, max)| {
            register(
                &self.ids,
                &mut self.properties,
                "zpos",
                PropertyKind::Range { min, max },
                false,
            )
        });
        self.planes.push((handle, info, zpos));
        Ok(handle)
    }

    /// Adds a connector present at device creation
    pub fn add_connector(
        &mut self,
        name: impl Into<String>,
        funcs: Arc<dyn ConnectorFuncs>,
    ) -> Result<ConnectorHandle, Error> {
        if self.connectors.len() >= MAX_OBJECTS {
            return Err(Error::InvalidUsage("too many connectors"));
        }
        let handle = ConnectorHandle {
            id: ObjectId(self.ids.next()),
            index: self.connectors.len(),
        };
        self.connectors.push((handle, name.into(), funcs));
        Ok(handle)
    }

    fn properties_for(&self, object_type: ObjectType, core: Vec<PropertyId>) -> Vec<PropertyId> {
        let mut properties = core;
        if let Some(driver) = self.driver_properties.get(&object_type) {
            properties.extend_from_slice(driver);
        }
        properties
    }

    /// Finishes the device
    pub fn build(self) -> Result<Arc<DrmDevice>, Error> {
        if self.atomic && self.crtcs.is_empty() {
            warn!(device = %self.name, "Atomic device without crtcs");
        }

        let crtc_properties = self.properties_for(ObjectType::Crtc, self.core.crtc_properties());
        let plane_properties = self.properties_for(ObjectType::Plane, self.core.plane_properties());
        let connector_properties =
            self.properties_for(ObjectType::Connector, self.core.connector_properties());

        let mut objects = HashMap::new();

        let crtcs = self
            .crtcs
            .into_iter()
            .map(|mut crtc| {
                crtc.properties = crtc_properties.clone();
                let crtc = Arc::new(crtc);
                objects.insert(crtc.id(), ModeObject::Crtc(crtc.clone()));
                crtc
            })
            .collect::<Vec<_>>();

        let planes = self
            .planes
            .into_iter()
            .map(|(handle, info, zpos)| {
                let mut properties = plane_properties.clone();
                properties.extend(zpos);
                let initial_zpos = info.zpos.map(|(min, _)| min).unwrap_or(0);
                let plane = Arc::new(Plane::new(handle, info, properties, zpos, initial_zpos));
                objects.insert(plane.id(), ModeObject::Plane(plane.clone()));
                plane
            })
            .collect::<Vec<_>>();

        let connectors = self
            .connectors
            .into_iter()
            .map(|(handle, name, funcs)| {
                let connector = Arc::new(Connector::new(handle, name, funcs, connector_properties.clone()));
                objects.insert(connector.id(), ModeObject::Connector(connector.clone()));
                Some(connector)
            })
            .collect::<Vec<_>>();

        info!(
            device = %self.name,
            crtcs = crtcs.len(),
            planes = planes.len(),
            connectors = connectors.len(),
            "Display device created"
        );

        Ok(Arc::new(DrmDevice {
            name: self.name,
            atomic: self.atomic,
            async_page_flip: self.async_page_flip,
            ids: self.ids,
            crtcs,
            planes,
            connectors: RwLock::new(connectors),
            connector_properties,
            objects: RwLock::new(objects),
            mode_blobs: Mutex::new(HashMap::new()),
            properties: self.properties,
            core: self.core,
            connection_lock: ModesetLock::new(),
            funcs: self.funcs,
            boost: self.boost,
        }))
    }
}

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use super::AtomicState;
use crate::{
    device::{CoreProperties, CrtcHandle, DrmDevice, Framebuffer, Plane, PlaneHandle, Property, PropertyId, PropertyKind},
    error::Error,
    fence::Fence,
    utils::Fixed,
};

bitflags::bitflags! {
    /// Rotation and reflection applied to a plane
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Rotation: u32 {
        /// No rotation
        const ROTATE_0      =   0b00000001;
        /// Rotate by 90 degrees counter-clockwise
        const ROTATE_90     =   0b00000010;
        /// Rotate by 180 degrees
        const ROTATE_180    =   0b00000100;
        /// Rotate by 270 degrees counter-clockwise
        const ROTATE_270    =   0b00001000;
        /// Mirror along the x axis
        const REFLECT_X     =   0b00010000;
        /// Mirror along the y axis
        const REFLECT_Y     =   0b00100000;
    }
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation::ROTATE_0
    }
}

impl Rotation {
    pub(crate) fn property_kind() -> PropertyKind {
        PropertyKind::Bitmask(vec![
            (0, "rotate-0"),
            (1, "rotate-90"),
            (2, "rotate-180"),
            (3, "rotate-270"),
            (4, "reflect-x"),
            (5, "reflect-y"),
        ])
    }
}

/// Configuration of a plane
#[derive(Debug)]
pub struct PlaneState {
    plane: PlaneHandle,
    pub(super) crtc: Option<CrtcHandle>,
    fb: Option<Arc<Framebuffer>>,
    fence: Option<Arc<Fence>>,
    /// Left edge of the destination rectangle on the crtc
    pub crtc_x: i32,
    /// Top edge of the destination rectangle on the crtc
    pub crtc_y: i32,
    /// Width of the destination rectangle
    pub crtc_w: u32,
    /// Height of the destination rectangle
    pub crtc_h: u32,
    /// Left edge of the source rectangle, 16.16 fixed point
    pub src_x: u32,
    /// Top edge of the source rectangle, 16.16 fixed point
    pub src_y: u32,
    /// Width of the source rectangle, 16.16 fixed point
    pub src_w: u32,
    /// Height of the source rectangle, 16.16 fixed point
    pub src_h: u32,
    /// Rotation of the plane
    pub rotation: Rotation,
    /// Stacking position
    pub zpos: u64,
    driver_values: IndexMap<PropertyId, u64>,
}

impl PlaneState {
    /// Creates the state of a disabled plane
    pub fn new(plane: PlaneHandle) -> Self {
        PlaneState {
            plane,
            crtc: None,
            fb: None,
            fence: None,
            crtc_x: 0,
            crtc_y: 0,
            crtc_w: 0,
            crtc_h: 0,
            src_x: 0,
            src_y: 0,
            src_w: 0,
            src_h: 0,
            rotation: Rotation::ROTATE_0,
            zpos: 0,
            driver_values: IndexMap::new(),
        }
    }

    /// Copies the state for modification.
    ///
    /// The framebuffer reference is shared, fences never carry over.
    pub fn duplicate(&self) -> Self {
        PlaneState {
            plane: self.plane,
            crtc: self.crtc,
            fb: self.fb.clone(),
            fence: None,
            crtc_x: self.crtc_x,
            crtc_y: self.crtc_y,
            crtc_w: self.crtc_w,
            crtc_h: self.crtc_h,
            src_x: self.src_x,
            src_y: self.src_y,
            src_w: self.src_w,
            src_h: self.src_h,
            rotation: self.rotation,
            zpos: self.zpos,
            driver_values: self.driver_values.clone(),
        }
    }

    /// The plane this state belongs to
    pub fn plane(&self) -> PlaneHandle {
        self.plane
    }

    /// The crtc the plane scans out to
    pub fn crtc(&self) -> Option<CrtcHandle> {
        self.crtc
    }

    /// The framebuffer the plane scans out of
    pub fn fb(&self) -> Option<&Arc<Framebuffer>> {
        self.fb.as_ref()
    }

    /// Fence to wait on before scanning out of the framebuffer
    pub fn fence(&self) -> Option<&Arc<Fence>> {
        self.fence.as_ref()
    }

    /// Sets the framebuffer, dropping the reference to the previous one
    pub fn set_fb(&mut self, fb: Option<Arc<Framebuffer>>) {
        match &fb {
            Some(fb) => debug!(plane = self.plane.id().raw(), fb = fb.id().raw(), "Set fb for plane state"),
            None => debug!(plane = self.plane.id().raw(), "Set no fb for plane state"),
        }
        self.fb = fb;
    }

    /// Sets an implicit fence.
    ///
    /// Does nothing if an explicit fence was already set through `IN_FENCE_FD`.
    pub fn set_fence(&mut self, fence: Arc<Fence>) {
        if self.fence.is_none() {
            self.fence = Some(fence);
        }
    }

    /// Value of a driver property stored in this state
    pub fn driver_value(&self, property: PropertyId) -> Option<u64> {
        self.driver_values.get(&property).copied()
    }

    /// Stores the value of a driver property
    pub fn set_driver_value(&mut self, property: PropertyId, value: u64) {
        self.driver_values.insert(property, value);
    }
}

/// Properties handled by the core for every plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlaneProperty {
    FbId,
    InFenceFd,
    CrtcId,
    CrtcX,
    CrtcY,
    CrtcW,
    CrtcH,
    SrcX,
    SrcY,
    SrcW,
    SrcH,
    Rotation,
    Zpos,
}

impl PlaneProperty {
    pub(crate) fn resolve(core: &CoreProperties, plane: &Plane, id: PropertyId) -> Option<Self> {
        Some(match id {
            id if id == core.fb_id => PlaneProperty::FbId,
            id if id == core.in_fence_fd => PlaneProperty::InFenceFd,
            id if id == core.crtc_id => PlaneProperty::CrtcId,
            id if id == core.crtc_x => PlaneProperty::CrtcX,
            id if id == core.crtc_y => PlaneProperty::CrtcY,
            id if id == core.crtc_w => PlaneProperty::CrtcW,
            id if id == core.crtc_h => PlaneProperty::CrtcH,
            id if id == core.src_x => PlaneProperty::SrcX,
            id if id == core.src_y => PlaneProperty::SrcY,
            id if id == core.src_w => PlaneProperty::SrcW,
            id if id == core.src_h => PlaneProperty::SrcH,
            id if id == core.rotation => PlaneProperty::Rotation,
            id if Some(id) == plane.zpos_property => PlaneProperty::Zpos,
            _ => return None,
        })
    }
}

impl AtomicState {
    /// Sets a property on the state of a plane, acquiring the state if needed.
    ///
    /// Core properties are handled directly, anything else is passed to
    /// [`PlaneFuncs::set_property`](crate::device::PlaneFuncs::set_property).
    pub fn set_plane_property(
        &mut self,
        plane: PlaneHandle,
        property: &Property,
        value: u64,
    ) -> Result<(), Error> {
        let dev = self.dev.clone();
        let file = self.file.clone();
        let entry = self.plane_entry(plane)?;
        let state = &mut entry.state;

        let kind = PlaneProperty::resolve(dev.core_properties(), &entry.plane, property.id());
        match kind {
            Some(PlaneProperty::FbId) => {
                let fb = match value {
                    0 => None,
                    id => Some(dev.lookup_framebuffer(id).ok_or(Error::UnknownReference(id))?),
                };
                state.set_fb(fb);
            }
            Some(PlaneProperty::InFenceFd) => {
                if state.fence.is_some() {
                    debug!(plane = plane.id().raw(), "In-fence already set");
                    return Err(Error::InvalidUsage("in-fence already set"));
                }
                let fd = value as i64;
                if fd == -1 {
                    return Ok(());
                }
                let fence = i32::try_from(fd)
                    .ok()
                    .and_then(|fd| file.as_ref().and_then(|file| file.fence(fd)))
                    .ok_or(Error::InvalidUsage("in-fence is not a sync file"))?;
                state.fence = Some(fence);
            }
            Some(PlaneProperty::CrtcId) => {
                let crtc = match value {
                    0 => None,
                    id => Some(dev.find_crtc(id).ok_or(Error::UnknownReference(id))?.handle()),
                };
                return self.set_crtc_for_plane(plane, crtc);
            }
            Some(PlaneProperty::CrtcX) => state.crtc_x = value as i64 as i32,
            Some(PlaneProperty::CrtcY) => state.crtc_y = value as i64 as i32,
            Some(PlaneProperty::CrtcW) => state.crtc_w = value as u32,
            Some(PlaneProperty::CrtcH) => state.crtc_h = value as u32,
            Some(PlaneProperty::SrcX) => state.src_x = value as u32,
            Some(PlaneProperty::SrcY) => state.src_y = value as u32,
            Some(PlaneProperty::SrcW) => state.src_w = value as u32,
            Some(PlaneProperty::SrcH) => state.src_h = value as u32,
            Some(PlaneProperty::Rotation) => state.rotation = Rotation::from_bits_truncate(value as u32),
            Some(PlaneProperty::Zpos) => state.zpos = value,
            None => {
                let plane = entry.plane.clone();
                plane.funcs.set_property(&plane, &mut entry.state, property, value)?;
            }
        }
        Ok(())
    }
}

/// Reads a property from a plane state
pub(crate) fn get_property(
    dev: &DrmDevice,
    plane: &Plane,
    state: &PlaneState,
    property: &Property,
) -> Result<u64, Error> {
    Ok(match PlaneProperty::resolve(dev.core_properties(), plane, property.id()) {
        Some(PlaneProperty::FbId) => state.fb.as_ref().map_or(0, |fb| fb.id().raw() as u64),
        Some(PlaneProperty::InFenceFd) => -1i64 as u64,
        Some(PlaneProperty::CrtcId) => state.crtc.map_or(0, |crtc| crtc.id().raw() as u64),
        Some(PlaneProperty::CrtcX) => state.crtc_x as i64 as u64,
        Some(PlaneProperty::CrtcY) => state.crtc_y as i64 as u64,
        Some(PlaneProperty::CrtcW) => state.crtc_w as u64,
        Some(PlaneProperty::CrtcH) => state.crtc_h as u64,
        Some(PlaneProperty::SrcX) => state.src_x as u64,
        Some(PlaneProperty::SrcY) => state.src_y as u64,
        Some(PlaneProperty::SrcW) => state.src_w as u64,
        Some(PlaneProperty::SrcH) => state.src_h as u64,
        Some(PlaneProperty::Rotation) => state.rotation.bits() as u64,
        Some(PlaneProperty::Zpos) => state.zpos,
        None => plane.funcs.get_property(plane, state, property)?,
    })
}

/// Core sanity checks of a plane state
pub(crate) fn check(plane: &Plane, state: &PlaneState) -> Result<(), Error> {
    let id = plane.id();

    let (crtc, fb) = match (state.crtc, state.fb.as_ref()) {
        (None, None) => return Ok(()),
        (Some(crtc), Some(fb)) => (crtc, fb),
        (Some(_), None) => {
            debug!(plane = id.raw(), "Crtc set but no fb");
            return Err(Error::InvalidUsage("plane has a crtc but no fb"));
        }
        (None, Some(_)) => {
            debug!(plane = id.raw(), "Fb set but no crtc");
            return Err(Error::InvalidUsage("plane has a fb but no crtc"));
        }
    };

    if plane.possible_crtcs & crtc.mask() == 0 {
        debug!(plane = id.raw(), crtc = crtc.id().raw(), "Invalid crtc for plane");
        return Err(Error::InvalidUsage("plane can not be used on this crtc"));
    }

    if !plane.supports_format(fb.format()) {
        debug!(plane = id.raw(), format = ?fb.format(), "Invalid pixel format");
        return Err(Error::UnsupportedFormat {
            plane: id,
            format: fb.format(),
        });
    }

    let int_max = i32::MAX as i64;
    if state.crtc_w as i64 > int_max
        || state.crtc_x as i64 + state.crtc_w as i64 > int_max
        || state.crtc_h as i64 > int_max
        || state.crtc_y as i64 + state.crtc_h as i64 > int_max
    {
        debug!(
            plane = id.raw(),
            "Invalid crtc coordinates {}x{}+{}+{}", state.crtc_w, state.crtc_h, state.crtc_x, state.crtc_y
        );
        return Err(Error::RangeError(id));
    }

    let fb_width = (fb.width() as u64) << 16;
    let fb_height = (fb.height() as u64) << 16;
    let (src_x, src_y, src_w, src_h) = (
        state.src_x as u64,
        state.src_y as u64,
        state.src_w as u64,
        state.src_h as u64,
    );
    if src_w > fb_width || src_x > fb_width - src_w || src_h > fb_height || src_y > fb_height - src_h {
        debug!(
            plane = id.raw(),
            "Invalid source coordinates {}x{}+{}+{}",
            Fixed(state.src_w),
            Fixed(state.src_h),
            Fixed(state.src_x),
            Fixed(state.src_y),
        );
        return Err(Error::OutOfBounds(id));
    }

    let current = plane.current_state().crtc;
    if current.is_some() && current != state.crtc {
        debug!(plane = id.raw(), name = plane.name(), "Switching crtc directly");
        return Err(Error::InvalidUsage("plane switching crtc directly"));
    }

    Ok(())
}

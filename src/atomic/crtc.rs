use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, warn};

use super::AtomicState;
use crate::{
    device::{
        mode::MODE_INFO_SIZE, ColorCtm, CoreProperties, Crtc, CrtcHandle, DrmDevice, Mode, Property,
        PropertyBlob, PropertyId,
    },
    error::Error,
    event::PendingVblankEvent,
};

/// Configuration of a crtc
#[derive(Debug)]
pub struct CrtcState {
    crtc: CrtcHandle,
    /// Whether the crtc has resources (a mode) assigned
    pub enable: bool,
    /// Whether the crtc is actively scanning out
    pub active: bool,
    mode: Mode,
    mode_blob: Option<Arc<PropertyBlob>>,
    degamma_lut: Option<Arc<PropertyBlob>>,
    ctm: Option<Arc<PropertyBlob>>,
    gamma_lut: Option<Arc<PropertyBlob>>,
    /// Any of the color management blobs got replaced
    pub color_mgmt_changed: bool,
    /// Mode or enable state differ from the current state
    pub mode_changed: bool,
    /// `active` differs from the current state
    pub active_changed: bool,
    /// The set of connectors differs from the current state
    pub connectors_changed: bool,
    pub(crate) plane_mask: u32,
    pub(crate) connector_mask: u32,
    pub(crate) event: Option<PendingVblankEvent>,
    driver_values: IndexMap<PropertyId, u64>,
}

impl CrtcState {
    /// Creates the state of a disabled crtc
    pub fn new(crtc: CrtcHandle) -> Self {
        CrtcState {
            crtc,
            enable: false,
            active: false,
            mode: Mode::default(),
            mode_blob: None,
            degamma_lut: None,
            ctm: None,
            gamma_lut: None,
            color_mgmt_changed: false,
            mode_changed: false,
            active_changed: false,
            connectors_changed: false,
            plane_mask: 0,
            connector_mask: 0,
            event: None,
            driver_values: IndexMap::new(),
        }
    }

    /// Copies the state for modification.
    ///
    /// Blob references are shared, change tracking flags and the event are reset.
    pub fn duplicate(&self) -> Self {
        CrtcState {
            crtc: self.crtc,
            enable: self.enable,
            active: self.active,
            mode: self.mode,
            mode_blob: self.mode_blob.clone(),
            degamma_lut: self.degamma_lut.clone(),
            ctm: self.ctm.clone(),
            gamma_lut: self.gamma_lut.clone(),
            color_mgmt_changed: false,
            mode_changed: false,
            active_changed: false,
            connectors_changed: false,
            plane_mask: self.plane_mask,
            connector_mask: self.connector_mask,
            event: None,
            driver_values: self.driver_values.clone(),
        }
    }

    /// The crtc this state belongs to
    pub fn crtc(&self) -> CrtcHandle {
        self.crtc
    }

    /// The configured mode, all zero while disabled
    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Blob holding the configured mode
    pub fn mode_blob(&self) -> Option<&Arc<PropertyBlob>> {
        self.mode_blob.as_ref()
    }

    /// Degamma lookup table
    pub fn degamma_lut(&self) -> Option<&Arc<PropertyBlob>> {
        self.degamma_lut.as_ref()
    }

    /// Color transformation matrix
    pub fn ctm(&self) -> Option<&Arc<PropertyBlob>> {
        self.ctm.as_ref()
    }

    /// Gamma lookup table
    pub fn gamma_lut(&self) -> Option<&Arc<PropertyBlob>> {
        self.gamma_lut.as_ref()
    }

    /// Mask of planes scanning out on this crtc
    pub fn plane_mask(&self) -> u32 {
        self.plane_mask
    }

    /// Mask of connectors driven by this crtc
    pub fn connector_mask(&self) -> u32 {
        self.connector_mask
    }

    /// Completion event requested for this state
    pub fn event(&self) -> Option<&PendingVblankEvent> {
        self.event.as_ref()
    }

    /// Attaches a completion event, replacing (and cancelling) a previous one
    pub fn set_event(&mut self, event: PendingVblankEvent) {
        self.event = Some(event);
    }

    /// Removes the completion event from the state
    pub fn take_event(&mut self) -> Option<PendingVblankEvent> {
        self.event.take()
    }

    /// Value of a driver property stored in this state
    pub fn driver_value(&self, property: PropertyId) -> Option<u64> {
        self.driver_values.get(&property).copied()
    }

    /// Stores the value of a driver property
    pub fn set_driver_value(&mut self, property: PropertyId, value: u64) {
        self.driver_values.insert(property, value);
    }

    /// Returns true, if applying this state requires a full modeset
    pub fn needs_modeset(&self) -> bool {
        self.mode_changed || self.active_changed || self.connectors_changed
    }

    /// Sets a mode originating from the kernel, creating a new mode blob.
    ///
    /// Passing `None` disables the crtc. Neither `active` nor the change
    /// tracking flags are touched.
    pub fn set_mode(&mut self, dev: &DrmDevice, mode: Option<&Mode>) -> Result<(), Error> {
        if let Some(mode) = mode {
            if self.mode_blob.is_some() && self.mode == *mode {
                return Ok(());
            }
        }

        self.mode_blob = None;
        match mode {
            Some(mode) => {
                self.mode_blob = Some(dev.create_mode_blob(&mode.to_bytes())?);
                self.mode = *mode;
                self.enable = true;
                debug!(crtc = self.crtc.id().raw(), mode = mode.name(), "Set mode for crtc state");
            }
            None => {
                self.mode = Mode::default();
                self.enable = false;
                debug!(crtc = self.crtc.id().raw(), "Set no mode for crtc state");
            }
        }
        Ok(())
    }

    /// Sets a mode from a `MODE_ID` blob.
    ///
    /// The blob has to hold exactly one valid mode record. Passing `None` disables the crtc.
    /// A rejected blob leaves the state untouched.
    pub fn set_mode_prop(&mut self, blob: Option<Arc<PropertyBlob>>) -> Result<(), Error> {
        if blob_id(&blob) == blob_id(&self.mode_blob) {
            return Ok(());
        }

        match blob {
            Some(blob) => {
                if blob.len() != MODE_INFO_SIZE {
                    debug!(blob = blob.id().raw(), len = blob.len(), "Mode blob has the wrong size");
                    return Err(Error::InvalidUsage("mode blob has the wrong size"));
                }
                self.mode = Mode::from_bytes(blob.data())?;
                self.mode_blob = Some(blob);
                self.enable = true;
                debug!(crtc = self.crtc.id().raw(), mode = self.mode.name(), "Set mode for crtc state");
            }
            None => {
                self.mode_blob = None;
                self.mode = Mode::default();
                self.enable = false;
                debug!(crtc = self.crtc.id().raw(), "Set no mode for crtc state");
            }
        }
        Ok(())
    }
}

fn blob_id(blob: &Option<Arc<PropertyBlob>>) -> Option<u32> {
    blob.as_ref().map(|blob| blob.id().raw())
}

/// Replaces a blob reference, returns true if it changed
fn replace_blob(slot: &mut Option<Arc<PropertyBlob>>, blob: Option<Arc<PropertyBlob>>) -> bool {
    if blob_id(slot) == blob_id(&blob) {
        return false;
    }
    *slot = blob;
    true
}

fn lookup_blob(
    dev: &DrmDevice,
    id: u64,
    expected_size: Option<usize>,
) -> Result<Option<Arc<PropertyBlob>>, Error> {
    if id == 0 {
        return Ok(None);
    }
    let blob = dev.lookup_blob(id).ok_or(Error::UnknownReference(id))?;
    if let Some(expected) = expected_size {
        if blob.len() != expected {
            debug!(blob = id, len = blob.len(), expected, "Blob has the wrong size");
            return Err(Error::InvalidUsage("blob has the wrong size"));
        }
    }
    Ok(Some(blob))
}

/// Properties handled by the core for every crtc
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CrtcProperty {
    Active,
    ModeId,
    DegammaLut,
    GammaLut,
    Ctm,
    OutFencePtr,
}

impl CrtcProperty {
    pub(crate) fn resolve(core: &CoreProperties, id: PropertyId) -> Option<Self> {
        Some(match id {
            id if id == core.active => CrtcProperty::Active,
            id if id == core.mode_id => CrtcProperty::ModeId,
            id if id == core.degamma_lut => CrtcProperty::DegammaLut,
            id if id == core.gamma_lut => CrtcProperty::GammaLut,
            id if id == core.ctm => CrtcProperty::Ctm,
            id if id == core.out_fence_ptr => CrtcProperty::OutFencePtr,
            _ => return None,
        })
    }
}

impl AtomicState {
    /// Sets a property on the state of a crtc, acquiring the state if needed.
    ///
    /// Core properties are handled directly, anything else is passed to
    /// [`CrtcFuncs::set_property`](crate::device::CrtcFuncs::set_property).
    pub fn set_crtc_property(
        &mut self,
        crtc: CrtcHandle,
        property: &Property,
        value: u64,
    ) -> Result<(), Error> {
        let dev = self.dev.clone();
        let file = self.file.clone();
        let entry = self.crtc_entry(crtc)?;
        let state = &mut entry.state;

        match CrtcProperty::resolve(dev.core_properties(), property.id()) {
            Some(CrtcProperty::Active) => state.active = value != 0,
            Some(CrtcProperty::ModeId) => {
                let blob = lookup_blob(&dev, value, None)?;
                state.set_mode_prop(blob)?;
            }
            Some(CrtcProperty::DegammaLut) => {
                let blob = lookup_blob(&dev, value, None)?;
                state.color_mgmt_changed |= replace_blob(&mut state.degamma_lut, blob);
            }
            Some(CrtcProperty::GammaLut) => {
                let blob = lookup_blob(&dev, value, None)?;
                state.color_mgmt_changed |= replace_blob(&mut state.gamma_lut, blob);
            }
            Some(CrtcProperty::Ctm) => {
                let blob = lookup_blob(&dev, value, Some(ColorCtm::SIZE))?;
                state.color_mgmt_changed |= replace_blob(&mut state.ctm, blob);
            }
            Some(CrtcProperty::OutFencePtr) => {
                if value == 0 {
                    return Ok(());
                }
                let file = file.ok_or(Error::Fault(value))?;
                file.user().put_i32(value, -1)?;
                entry.out_fence_ptr = Some(value);
            }
            None => {
                let crtc = entry.crtc.clone();
                crtc.funcs.set_property(&crtc, &mut entry.state, property, value)?;
            }
        }
        Ok(())
    }
}

/// Reads a property from a crtc state
pub(crate) fn get_property(
    dev: &DrmDevice,
    crtc: &Crtc,
    state: &CrtcState,
    property: &Property,
) -> Result<u64, Error> {
    let blob_value = |blob: &Option<Arc<PropertyBlob>>| blob_id(blob).map_or(0, u64::from);

    Ok(match CrtcProperty::resolve(dev.core_properties(), property.id()) {
        Some(CrtcProperty::Active) => state.active as u64,
        Some(CrtcProperty::ModeId) => blob_value(&state.mode_blob),
        Some(CrtcProperty::DegammaLut) => blob_value(&state.degamma_lut),
        Some(CrtcProperty::GammaLut) => blob_value(&state.gamma_lut),
        Some(CrtcProperty::Ctm) => blob_value(&state.ctm),
        Some(CrtcProperty::OutFencePtr) => 0,
        None => crtc.funcs.get_property(crtc, state, property)?,
    })
}

/// Core sanity checks of a crtc state
pub(crate) fn check(crtc: &Crtc, state: &CrtcState, atomic: bool) -> Result<(), Error> {
    if state.active && !state.enable {
        debug!(crtc = crtc.id().raw(), name = crtc.name(), "Crtc active without enabled");
        return Err(Error::InvalidUsage("crtc active without being enabled"));
    }

    // the mode setters keep enable and mode blob in sync, only direct writes to `enable` break this
    if atomic {
        if state.enable && state.mode_blob.is_none() {
            warn!(crtc = crtc.id().raw(), name = crtc.name(), "Crtc enabled without mode blob");
            return Err(Error::InvalidUsage("crtc enabled without mode blob"));
        }
        if !state.enable && state.mode_blob.is_some() {
            warn!(crtc = crtc.id().raw(), name = crtc.name(), "Crtc disabled with mode blob");
            return Err(Error::InvalidUsage("crtc disabled with mode blob"));
        }
    }

    // clients tend to spin on events of crtcs that stay off
    if state.event.is_some() && !state.active && !crtc.current_state().active {
        debug!(crtc = crtc.id().raw(), "Requesting event but crtc is off");
        return Err(Error::InvalidUsage("requesting an event on a disabled crtc"));
    }

    Ok(())
}

/// Derives the modeset flags of `state` from the committed state
pub(crate) fn update_modeset_flags(crtc: &Crtc, state: &mut CrtcState) {
    let current = crtc.current_state();
    state.mode_changed |= state.enable != current.enable || state.mode != current.mode;
    state.active_changed |= state.active != current.active;
    state.connectors_changed |= state.connector_mask != current.connector_mask;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::CrtcState;
    use crate::{
        device::{CrtcHandle, Mode, ObjectId, PropertyBlob},
        error::Error,
    };

    fn blob(id: u32, data: Vec<u8>) -> Arc<PropertyBlob> {
        Arc::new(PropertyBlob {
            id: ObjectId(id),
            data: data.into_boxed_slice(),
        })
    }

    #[test]
    fn duplicate_resets_tracking() {
        let handle = CrtcHandle {
            id: ObjectId(1),
            index: 0,
        };
        let mut state = CrtcState::new(handle);
        state.active = true;
        state.mode_changed = true;
        state.plane_mask = 0b10;

        let copy = state.duplicate();
        assert!(copy.active);
        assert!(!copy.mode_changed);
        assert_eq!(copy.plane_mask(), 0b10);
        assert!(!copy.needs_modeset());
    }

    #[test]
    fn rejected_mode_blob_keeps_mode() {
        let handle = CrtcHandle {
            id: ObjectId(1),
            index: 0,
        };
        let mode = Mode::new(148500, (1920, 2008, 2052, 2200), (1080, 1084, 1089, 1125), 60);
        let mut state = CrtcState::new(handle);
        state.set_mode_prop(Some(blob(2, mode.to_bytes().to_vec()))).unwrap();

        assert!(matches!(
            state.set_mode_prop(Some(blob(3, vec![0; 10]))),
            Err(Error::InvalidUsage(_))
        ));
        assert!(state.enable);
        assert_eq!(state.mode_blob().map(|blob| blob.id()), Some(ObjectId(2)));
        assert_eq!(state.mode().size(), (1920, 1080));

        state.set_mode_prop(None).unwrap();
        assert!(!state.enable);
        assert!(state.mode_blob().is_none());
    }
}

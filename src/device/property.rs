use super::ObjectType;

/// Identifier of a registered property
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyId(pub(crate) u32);

impl PropertyId {
    /// Returns the raw id as used on the property interface
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl From<PropertyId> for u32 {
    fn from(id: PropertyId) -> u32 {
        id.0
    }
}

/// Value domain of a property
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    /// Unsigned value in `min..=max`
    Range {
        /// Smallest accepted value
        min: u64,
        /// Largest accepted value
        max: u64,
    },
    /// Signed value in `min..=max`, transported as two's complement
    SignedRange {
        /// Smallest accepted value
        min: i64,
        /// Largest accepted value
        max: i64,
    },
    /// Boolean value, 0 or 1
    Bool,
    /// One of the listed values
    Enum(Vec<(u64, &'static str)>),
    /// Any combination of the listed bits
    Bitmask(Vec<(u32, &'static str)>),
    /// Id of a mode object of the given type or 0
    Object(ObjectType),
    /// Id of a property blob or 0
    Blob,
}

/// A property descriptor registered on the device.
///
/// Properties are compared by identity, names are only informative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub(crate) id: PropertyId,
    pub(crate) name: &'static str,
    pub(crate) kind: PropertyKind,
    pub(crate) immutable: bool,
}

impl Property {
    /// Id of this property
    pub fn id(&self) -> PropertyId {
        self.id
    }

    /// Name of this property
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Value domain of this property
    pub fn kind(&self) -> &PropertyKind {
        &self.kind
    }

    /// Returns true, if the property can not be changed by clients
    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    /// Checks if `value` is a legal new value for this property.
    ///
    /// Object and blob ids are not resolved here, that is left to the
    /// dispatch of the individual property.
    pub fn validate(&self, value: u64) -> bool {
        if self.immutable {
            return false;
        }

        match &self.kind {
            PropertyKind::Range { min, max } => (*min..=*max).contains(&value),
            PropertyKind::SignedRange { min, max } => (*min..=*max).contains(&(value as i64)),
            PropertyKind::Bool => value <= 1,
            PropertyKind::Enum(values) => values.iter().any(|(v, _)| *v == value),
            PropertyKind::Bitmask(bits) => {
                let valid = bits.iter().fold(0u64, |mask, (bit, _)| mask | (1u64 << bit));
                value & !valid == 0
            }
            PropertyKind::Object(_) | PropertyKind::Blob => value <= u32::MAX as u64,
        }
    }
}

/// Ids of the properties the core handles itself
#[derive(Debug, Clone)]
pub struct CoreProperties {
    /// `ACTIVE` on crtcs
    pub active: PropertyId,
    /// `MODE_ID` on crtcs
    pub mode_id: PropertyId,
    /// `DEGAMMA_LUT` on crtcs
    pub degamma_lut: PropertyId,
    /// `GAMMA_LUT` on crtcs
    pub gamma_lut: PropertyId,
    /// `CTM` on crtcs
    pub ctm: PropertyId,
    /// `OUT_FENCE_PTR` on crtcs
    pub out_fence_ptr: PropertyId,
    /// `FB_ID` on planes
    pub fb_id: PropertyId,
    /// `IN_FENCE_FD` on planes
    pub in_fence_fd: PropertyId,
    /// `CRTC_ID` on planes and connectors
    pub crtc_id: PropertyId,
    /// `CRTC_X` on planes
    pub crtc_x: PropertyId,
    /// `CRTC_Y` on planes
    pub crtc_y: PropertyId,
    /// `CRTC_W` on planes
    pub crtc_w: PropertyId,
    /// `CRTC_H` on planes
    pub crtc_h: PropertyId,
    /// `SRC_X` on planes
    pub src_x: PropertyId,
    /// `SRC_Y` on planes
    pub src_y: PropertyId,
    /// `SRC_W` on planes
    pub src_w: PropertyId,
    /// `SRC_H` on planes
    pub src_h: PropertyId,
    /// `rotation` on planes
    pub rotation: PropertyId,
    /// `DPMS` on connectors
    pub dpms: PropertyId,
}

impl CoreProperties {
    pub(crate) fn crtc_properties(&self) -> Vec<PropertyId> {
        vec![
            self.active,
            self.mode_id,
            self.degamma_lut,
            self.gamma_lut,
            self.ctm,
            self.out_fence_ptr,
        ]
    }

    pub(crate) fn plane_properties(&self) -> Vec<PropertyId> {
        vec![
            self.fb_id,
            self.in_fence_fd,
            self.crtc_id,
            self.crtc_x,
            self.crtc_y,
            self.crtc_w,
            self.crtc_h,
            self.src_x,
            self.src_y,
            self.src_w,
            self.src_h,
            self.rotation,
        ]
    }

    pub(crate) fn connector_properties(&self) -> Vec<PropertyId> {
        vec![self.crtc_id, self.dpms]
    }
}

#[cfg(test)]
mod tests {
    use super::{Property, PropertyId, PropertyKind};

    fn property(kind: PropertyKind) -> Property {
        Property {
            id: PropertyId(1),
            name: "test",
            kind,
            immutable: false,
        }
    }

    #[test]
    fn range_validation() {
        let prop = property(PropertyKind::Range { min: 1, max: 10 });
        assert!(prop.validate(1));
        assert!(prop.validate(10));
        assert!(!prop.validate(0));
        assert!(!prop.validate(11));
    }

    #[test]
    fn signed_range_validation() {
        let prop = property(PropertyKind::SignedRange { min: -5, max: 5 });
        assert!(prop.validate((-5i64) as u64));
        assert!(!prop.validate((-6i64) as u64));
        assert!(!prop.validate(6));
    }

    #[test]
    fn bitmask_validation() {
        let prop = property(PropertyKind::Bitmask(vec![(0, "rotate-0"), (2, "rotate-180")]));
        assert!(prop.validate(0b101));
        assert!(!prop.validate(0b010));
    }

    #[test]
    fn immutable_properties_reject_everything() {
        let mut prop = property(PropertyKind::Bool);
        prop.immutable = true;
        assert!(!prop.validate(0));
    }
}

use drm_fourcc::{DrmFourcc, DrmModifier};

use super::ObjectId;

/// A scan-out buffer registered on the device
#[derive(Debug, PartialEq, Eq)]
pub struct Framebuffer {
    pub(crate) id: ObjectId,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) format: DrmFourcc,
    pub(crate) modifier: DrmModifier,
}

impl Framebuffer {
    /// Id of this framebuffer
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel format
    pub fn format(&self) -> DrmFourcc {
        self.format
    }

    /// Format modifier
    pub fn modifier(&self) -> DrmModifier {
        self.modifier
    }
}

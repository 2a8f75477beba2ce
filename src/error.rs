use drm_fourcc::DrmFourcc;

use crate::device::{ObjectId, PropertyId};

/// Errors returned by the atomic modesetting engine.
///
/// Only [`Error::Deadlock`] is ever handled internally: it tells the caller that the
/// whole transaction has to be cleared and rebuilt after backing off the
/// [`AcquireContext`](crate::lock::AcquireContext). Every other kind is terminal for
/// the current request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Acquiring a modeset lock would have formed a lock cycle
    #[error("Deadlock detected while acquiring modeset locks, transaction must be restarted")]
    Deadlock,
    /// Allocating transaction memory failed
    #[error("Out of memory")]
    OutOfMemory,
    /// The caller violated the usage contract of an object or property
    #[error("Invalid usage: {0}")]
    InvalidUsage(&'static str),
    /// The property is neither a core property nor handled by the object's driver
    #[error("Property `{property:?}` is not known for object `{object:?}`")]
    UnknownProperty {
        /// Object the property was used on
        object: ObjectId,
        /// The rejected property
        property: PropertyId,
    },
    /// An object or blob id does not reference anything known to the device
    #[error("Unknown object or blob id {0}")]
    UnknownReference(u64),
    /// The framebuffer format can not be scanned out by the plane
    #[error("Format `{format:?}` is not supported by plane `{plane:?}`")]
    UnsupportedFormat {
        /// The plane rejecting the format
        plane: ObjectId,
        /// The rejected format
        format: DrmFourcc,
    },
    /// The source rectangle is not contained in the framebuffer
    #[error("Source rectangle of plane `{0:?}` exceeds its framebuffer")]
    OutOfBounds(ObjectId),
    /// The crtc rectangle overflows the signed 32-bit coordinate space
    #[error("Crtc coordinates of plane `{0:?}` overflow")]
    RangeError(ObjectId),
    /// The transaction requires a full modeset, but modesets are not allowed
    #[error("Crtc `{0:?}` requires a full modeset, which is not allowed")]
    ModesetNotAllowed(ObjectId),
    /// The property exists but can not be changed through an atomic transaction
    #[error("Property `{0:?}` can not be set atomically")]
    Unsupported(PropertyId),
    /// Writing to a user supplied address failed
    #[error("Bad user address {0:#x}")]
    Fault(u64),
    /// The client ran out of file descriptors
    #[error("No free file descriptors")]
    NoFileDescriptors,
}

impl Error {
    /// Returns true, if the transaction has to be cleared and restarted
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Error::Deadlock)
    }

    /// Negative errno value reported to clients of the ioctl interface
    pub fn errno(&self) -> i32 {
        -match self {
            Error::Deadlock => libc::EDEADLK,
            Error::OutOfMemory => libc::ENOMEM,
            Error::InvalidUsage(_)
            | Error::UnsupportedFormat { .. }
            | Error::ModesetNotAllowed(_)
            | Error::Unsupported(_) => libc::EINVAL,
            Error::UnknownProperty { .. } | Error::UnknownReference(_) => libc::ENOENT,
            Error::OutOfBounds(_) => libc::ENOSPC,
            Error::RangeError(_) => libc::ERANGE,
            Error::Fault(_) => libc::EFAULT,
            Error::NoFileDescriptors => libc::EMFILE,
        }
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory
    }
}

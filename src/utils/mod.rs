//! Various utilities functions and types

pub(crate) mod ids;
mod fixed;

pub use self::fixed::Fixed;

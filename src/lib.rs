#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # atomic-kms: transactional display configuration
//!
//! This crate implements the state engine behind atomic modesetting: changes to any
//! number of crtcs, planes and connectors of a display device are collected into a
//! single transaction, validated as a whole and applied all at once, or not at all.
//!
//! ## Structure of the crate
//!
//! - [`device`] describes a display device, its mode objects with their committed
//!   state, registered properties, framebuffers and property blobs. Drivers plug in
//!   through the callback traits found there.
//! - [`atomic`] contains the transaction itself, [`AtomicState`](atomic::AtomicState),
//!   together with property dispatch, consistency checks, the commit protocol and
//!   [`atomic_ioctl`](atomic::atomic_ioctl), which handles requests of clients.
//! - [`lock`] provides the deadlock avoiding locks every object is protected by.
//! - [`fence`], [`event`] and [`file`] cover completion signaling towards clients.
//! - [`boost`] notifies frequency governors about incoming display updates.
//!
//! ### Deadlocks
//!
//! Transactions lock objects in whatever order their properties reference them.
//! Instead of imposing a global lock order, contention between two transactions is
//! resolved by letting the younger one fail with [`Error::Deadlock`]. Every function
//! acquiring locks passes this error on unchanged, the code driving the transaction
//! then has to clear it, back off and rebuild it. See the [`atomic`] module for details.
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging. Every
//! transaction and every client request gets its own span, check failures are
//! reported at the `debug` level.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod atomic;
pub mod boost;
pub mod device;
pub mod event;
pub mod fence;
pub mod file;
pub mod lock;
pub mod utils;

mod error;
pub use error::Error;

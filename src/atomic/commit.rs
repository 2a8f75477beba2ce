use std::time::Duration;

use tracing::{debug, instrument};

use super::{crtc, plane, AtomicState};
use crate::{device::CrtcHandle, error::Error, event::PendingVblankEvent};

/// A commit handed back by [`AtomicState::commit`] or [`AtomicState::nonblocking_commit`].
///
/// The transaction stays with the caller, who may clear and retry it on
/// [`Error::Deadlock`] or drop it.
#[derive(thiserror::Error, Debug)]
#[error("{error}")]
pub struct Rejected {
    /// Reason for the rejection
    pub error: Error,
    /// The rejected transaction
    pub state: AtomicState,
}

impl From<Rejected> for Error {
    fn from(rejected: Rejected) -> Error {
        rejected.error
    }
}

/// Completion tracking of one crtc of a commit in flight.
///
/// Consumed exactly once by [`CrtcCommit::complete`] or [`CrtcCommit::cancel`],
/// dropping it cancels it.
#[derive(Debug)]
pub struct CrtcCommit {
    crtc: CrtcHandle,
    event: Option<PendingVblankEvent>,
}

impl CrtcCommit {
    pub(crate) fn new(crtc: CrtcHandle) -> Self {
        CrtcCommit { crtc, event: None }
    }

    pub(crate) fn set_event(&mut self, event: PendingVblankEvent) {
        self.event = Some(event);
    }

    /// The crtc this commit belongs to
    pub fn crtc(&self) -> CrtcHandle {
        self.crtc
    }

    /// Event delivered on completion
    pub fn event(&self) -> Option<&PendingVblankEvent> {
        self.event.as_ref()
    }

    /// Marks the commit as scanned out, signaling fences and delivering events
    pub fn complete(mut self, sequence: u32, time: Duration) {
        if let Some(event) = self.event.take() {
            event.send(sequence, time);
        }
    }

    /// Drops the commit without delivering its event
    pub fn cancel(mut self) {
        if let Some(event) = self.event.take() {
            event.cancel();
        }
    }
}

impl AtomicState {
    /// Validates the transaction without applying it.
    ///
    /// Runs the core checks and the driver checks of every plane and crtc in the
    /// transaction, followed by [`ModeConfigFuncs::atomic_check`](crate::device::ModeConfigFuncs::atomic_check).
    /// If modesets are not allowed, any crtc requiring one fails the check.
    ///
    /// This does not touch the current state of any object and can be repeated.
    #[instrument(level = "debug", parent = &self.span, skip_all)]
    #[profiling::function]
    pub fn check_only(&mut self) -> Result<(), Error> {
        debug!("Checking atomic state");

        for entry in self.planes.iter().flatten() {
            if let Err(err) = plane::check(&entry.plane, &entry.state) {
                debug!(
                    plane = entry.plane.id().raw(),
                    name = entry.plane.name(),
                    "Atomic core check failed"
                );
                return Err(err);
            }
            entry.plane.funcs.atomic_check(&entry.plane, &entry.state)?;
        }

        let atomic = self.dev.is_atomic();
        for entry in self.crtcs.iter_mut().flatten() {
            if let Err(err) = crtc::check(&entry.crtc, &entry.state, atomic) {
                debug!(
                    crtc = entry.crtc.id().raw(),
                    name = entry.crtc.name(),
                    "Atomic core check failed"
                );
                return Err(err);
            }
            entry.crtc.funcs.atomic_check(&entry.crtc, &entry.state)?;
            crtc::update_modeset_flags(&entry.crtc, &mut entry.state);
        }

        let dev = self.dev.clone();
        let funcs = dev.funcs.clone();
        funcs.atomic_check(&dev, self)?;

        if !self.allow_modeset {
            for entry in self.crtcs.iter().flatten() {
                if entry.state.needs_modeset() {
                    debug!(
                        crtc = entry.crtc.id().raw(),
                        name = entry.crtc.name(),
                        "Requires full modeset"
                    );
                    return Err(Error::ModesetNotAllowed(entry.crtc.id()));
                }
            }
        }

        Ok(())
    }

    /// Checks and applies the transaction, blocking until the hardware took it.
    ///
    /// On success the transaction is owned by the commit path.
    #[instrument(level = "debug", parent = &self.span, skip_all)]
    pub fn commit(self) -> Result<(), Rejected> {
        self.check_and_commit(false)
    }

    /// Checks the transaction and queues it for the hardware, returning immediately.
    ///
    /// Completion is observed through the events and out-fences of the transaction.
    #[instrument(level = "debug", parent = &self.span, skip_all)]
    pub fn nonblocking_commit(self) -> Result<(), Rejected> {
        self.check_and_commit(true)
    }

    fn check_and_commit(mut self, nonblock: bool) -> Result<(), Rejected> {
        if let Err(error) = self.check_only() {
            return Err(Rejected { error, state: self });
        }

        debug!(nonblock, "Committing atomic state");
        let dev = self.dev.clone();
        let funcs = dev.funcs.clone();
        funcs.atomic_commit(&dev, self, nonblock)
    }
}

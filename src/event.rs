//! Completion events delivered to clients

use std::{sync::Arc, time::Duration};

use tracing::trace;

use crate::{
    device::CrtcHandle,
    error::Error,
    fence::Fence,
    file::DrmFile,
};

/// Space a flip event occupies in the event budget of a client
pub const EVENT_SIZE: usize = 32;

/// Events sent to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrmEvent {
    /// A requested configuration change got scanned out
    FlipComplete {
        /// User data passed with the request
        user_data: u64,
        /// Raw id of the crtc
        crtc_id: u32,
        /// Vblank sequence the flip completed on
        sequence: u32,
        /// Timestamp of the vblank
        time: Duration,
    },
}

/// A flip-complete event waiting for its commit to reach the hardware.
///
/// The event is consumed exactly once, either by [`PendingVblankEvent::send`]
/// or by [`PendingVblankEvent::cancel`]. Dropping it cancels it.
#[derive(Debug)]
pub struct PendingVblankEvent {
    user_data: u64,
    crtc: CrtcHandle,
    fence: Option<Arc<Fence>>,
    file: Option<Arc<DrmFile>>,
}

impl PendingVblankEvent {
    /// Creates an event not yet bound to a client
    pub fn new(crtc: CrtcHandle, user_data: u64) -> Self {
        PendingVblankEvent {
            user_data,
            crtc,
            fence: None,
            file: None,
        }
    }

    /// Reserves space in the client's event budget and binds the event to it
    pub(crate) fn reserve(&mut self, file: &Arc<DrmFile>) -> Result<(), Error> {
        file.reserve_event_space(EVENT_SIZE)?;
        self.file = Some(file.clone());
        Ok(())
    }

    pub(crate) fn set_fence(&mut self, fence: Arc<Fence>) {
        self.fence = Some(fence);
    }

    /// The crtc this event belongs to
    pub fn crtc(&self) -> CrtcHandle {
        self.crtc
    }

    /// User data of the request
    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// Out-fence signaled together with this event
    pub fn fence(&self) -> Option<&Arc<Fence>> {
        self.fence.as_ref()
    }

    /// Returns true, if the event carries an out-fence or is bound to a client.
    ///
    /// Events created by drivers themselves carry neither.
    pub fn is_client_event(&self) -> bool {
        self.fence.is_some() || self.file.is_some()
    }

    /// Signals the out-fence and delivers the event to the client
    pub fn send(mut self, sequence: u32, time: Duration) {
        if let Some(fence) = self.fence.take() {
            fence.signal();
        }
        if let Some(file) = self.file.take() {
            file.release_event_space(EVENT_SIZE);
            file.send_event(DrmEvent::FlipComplete {
                user_data: self.user_data,
                crtc_id: self.crtc.id().raw(),
                sequence,
                time,
            });
        }
    }

    /// Drops the event without delivering it
    pub fn cancel(self) {
        trace!(crtc = self.crtc.id().raw(), "Cancelling vblank event");
    }
}

impl Drop for PendingVblankEvent {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            file.release_event_space(EVENT_SIZE);
        }
    }
}

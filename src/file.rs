//! Per-client state of an open display device
//!
//! A [`DrmFile`] carries what the kernel keeps per open file of a DRM node:
//! negotiated client capabilities, the descriptor table through which fences
//! are exchanged, access to the client's memory for output parameters and the
//! queue completion events are delivered through.
//!
//! Events are pushed into a [`calloop::channel::Channel`], returned on creation,
//! which can be inserted into the client's event loop.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use calloop::channel::{self, Channel, Sender};
use tracing::{debug, trace};

use crate::{
    error::Error,
    event::DrmEvent,
    fence::{Fence, SyncFile},
};

/// Default amount of bytes of pending events a client may accumulate
pub const DEFAULT_EVENT_SPACE: usize = 4096;

/// Default size of a client's descriptor table
pub const DEFAULT_FD_LIMIT: usize = 1024;

/// Access to the memory of a client
pub trait UserMemory: fmt::Debug + Send + Sync {
    /// Writes `value` to the client address `addr`.
    ///
    /// Fails with [`Error::Fault`] if the address is not writable.
    fn put_i32(&self, addr: u64, value: i32) -> Result<(), Error>;
}

/// [`UserMemory`] backed by a set of registered 32 bit slots.
///
/// Useful for clients living in the same process, every address that
/// should receive output values has to be registered first.
#[derive(Debug, Default)]
pub struct OutFenceSlots {
    slots: Mutex<HashMap<u64, i32>>,
}

impl OutFenceSlots {
    /// Creates an empty set of slots
    pub fn new() -> Self {
        OutFenceSlots::default()
    }

    /// Makes `addr` writable, initialized to 0
    pub fn register(&self, addr: u64) {
        self.slots.lock().unwrap().insert(addr, 0);
    }

    /// Reads back the value stored at `addr`
    pub fn read(&self, addr: u64) -> Option<i32> {
        self.slots.lock().unwrap().get(&addr).copied()
    }
}

impl UserMemory for OutFenceSlots {
    fn put_i32(&self, addr: u64, value: i32) -> Result<(), Error> {
        match self.slots.lock().unwrap().get_mut(&addr) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::Fault(addr)),
        }
    }
}

/// Capabilities a client can opt into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientCapability {
    /// Expose all planes, not just overlays
    UniversalPlanes,
    /// Allow atomic requests, implies [`ClientCapability::UniversalPlanes`]
    Atomic,
}

#[derive(Debug)]
enum FdEntry {
    Reserved,
    SyncFile(SyncFile),
}

/// Descriptor table of a client, handing out the lowest free descriptor
#[derive(Debug)]
pub struct FdTable {
    entries: Vec<Option<FdEntry>>,
    limit: usize,
}

impl Default for FdTable {
    fn default() -> Self {
        FdTable::with_limit(DEFAULT_FD_LIMIT)
    }
}

impl FdTable {
    /// Creates a table holding at most `limit` descriptors
    pub fn with_limit(limit: usize) -> Self {
        FdTable {
            entries: Vec::new(),
            limit,
        }
    }

    fn slot(&mut self) -> Result<usize, Error> {
        if let Some(fd) = self.entries.iter().position(Option::is_none) {
            return Ok(fd);
        }
        if self.entries.len() >= self.limit {
            return Err(Error::NoFileDescriptors);
        }
        self.entries.try_reserve(1)?;
        self.entries.push(None);
        Ok(self.entries.len() - 1)
    }

    /// Reserves a descriptor to be installed later
    pub fn reserve(&mut self) -> Result<i32, Error> {
        let fd = self.slot()?;
        self.entries[fd] = Some(FdEntry::Reserved);
        Ok(fd as i32)
    }

    /// Installs a sync file into a reserved descriptor
    pub fn install(&mut self, fd: i32, file: SyncFile) -> Result<(), Error> {
        match self.entries.get_mut(fd as usize) {
            Some(entry @ Some(FdEntry::Reserved)) => {
                *entry = Some(FdEntry::SyncFile(file));
                Ok(())
            }
            _ => Err(Error::InvalidUsage("installing into an unreserved descriptor")),
        }
    }

    /// Returns a reserved but never installed descriptor
    pub fn put_unused(&mut self, fd: i32) {
        if let Some(entry) = self.entries.get_mut(fd as usize) {
            if matches!(entry, Some(FdEntry::Reserved)) {
                *entry = None;
            }
        }
    }

    /// Reserves and installs a sync file in one go
    pub fn insert(&mut self, file: SyncFile) -> Result<i32, Error> {
        let fd = self.slot()?;
        self.entries[fd] = Some(FdEntry::SyncFile(file));
        Ok(fd as i32)
    }

    /// Looks up the sync file behind a descriptor
    pub fn get(&self, fd: i32) -> Option<&SyncFile> {
        if fd < 0 {
            return None;
        }
        match self.entries.get(fd as usize) {
            Some(Some(FdEntry::SyncFile(file))) => Some(file),
            _ => None,
        }
    }

    /// Closes an installed descriptor
    pub fn close(&mut self, fd: i32) -> Option<SyncFile> {
        if fd < 0 {
            return None;
        }
        let entry = self.entries.get_mut(fd as usize)?;
        match entry.take() {
            Some(FdEntry::SyncFile(file)) => Some(file),
            other => {
                *entry = other;
                None
            }
        }
    }

    /// Number of reserved or installed descriptors
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }

    /// Returns true, if no descriptor is in use
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An open file of a display device
pub struct DrmFile {
    atomic: AtomicBool,
    universal_planes: AtomicBool,
    fds: Mutex<FdTable>,
    user: Arc<dyn UserMemory>,
    events: Sender<DrmEvent>,
    event_space: Mutex<usize>,
}

impl fmt::Debug for DrmFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmFile")
            .field("atomic", &self.atomic)
            .field("fds", &self.fds)
            .field("user", &self.user)
            .field("event_space", &self.event_space)
            .finish_non_exhaustive()
    }
}

impl DrmFile {
    /// Opens a new file, returning it together with the source of its events
    pub fn new(user: Arc<dyn UserMemory>) -> (Arc<DrmFile>, Channel<DrmEvent>) {
        Self::with_limits(user, DEFAULT_EVENT_SPACE, DEFAULT_FD_LIMIT)
    }

    /// Opens a new file with a custom event budget and descriptor limit
    pub fn with_limits(
        user: Arc<dyn UserMemory>,
        event_space: usize,
        fd_limit: usize,
    ) -> (Arc<DrmFile>, Channel<DrmEvent>) {
        let (events, source) = channel::channel();
        let file = DrmFile {
            atomic: AtomicBool::new(false),
            universal_planes: AtomicBool::new(false),
            fds: Mutex::new(FdTable::with_limit(fd_limit)),
            user,
            events,
            event_space: Mutex::new(event_space),
        };
        (Arc::new(file), source)
    }

    /// Enables or disables a client capability
    pub fn set_client_capability(&self, cap: ClientCapability, enabled: bool) {
        debug!(?cap, enabled, "Client capability changed");
        match cap {
            ClientCapability::UniversalPlanes => self.universal_planes.store(enabled, Ordering::Release),
            ClientCapability::Atomic => {
                self.atomic.store(enabled, Ordering::Release);
                if enabled {
                    self.universal_planes.store(true, Ordering::Release);
                }
            }
        }
    }

    /// Returns true, if the client enabled the capability
    pub fn has_client_capability(&self, cap: ClientCapability) -> bool {
        match cap {
            ClientCapability::UniversalPlanes => self.universal_planes.load(Ordering::Acquire),
            ClientCapability::Atomic => self.atomic.load(Ordering::Acquire),
        }
    }

    /// Memory of the client
    pub fn user(&self) -> &Arc<dyn UserMemory> {
        &self.user
    }

    /// Makes a sync file available to the client, returning its descriptor
    pub fn import_sync_file(&self, file: SyncFile) -> Result<i32, Error> {
        self.fds.lock().unwrap().insert(file)
    }

    /// Looks up the sync file behind a descriptor
    pub fn sync_file(&self, fd: i32) -> Option<SyncFile> {
        self.fds.lock().unwrap().get(fd).cloned()
    }

    /// Looks up the fence behind a descriptor
    pub fn fence(&self, fd: i32) -> Option<Arc<Fence>> {
        self.sync_file(fd).map(|file| file.fence().clone())
    }

    /// Closes a descriptor, returning the sync file it referenced
    pub fn close_fd(&self, fd: i32) -> Option<SyncFile> {
        self.fds.lock().unwrap().close(fd)
    }

    /// Number of descriptors in use
    pub fn open_fds(&self) -> usize {
        self.fds.lock().unwrap().len()
    }

    pub(crate) fn reserve_fd(&self) -> Result<i32, Error> {
        self.fds.lock().unwrap().reserve()
    }

    pub(crate) fn install_fd(&self, fd: i32, file: SyncFile) -> Result<(), Error> {
        self.fds.lock().unwrap().install(fd, file)
    }

    pub(crate) fn put_unused_fd(&self, fd: i32) {
        self.fds.lock().unwrap().put_unused(fd)
    }

    /// Remaining event budget in bytes
    pub fn event_space(&self) -> usize {
        *self.event_space.lock().unwrap()
    }

    pub(crate) fn reserve_event_space(&self, len: usize) -> Result<(), Error> {
        let mut space = self.event_space.lock().unwrap();
        if *space < len {
            debug!(available = *space, len, "Event space exhausted");
            return Err(Error::OutOfMemory);
        }
        *space -= len;
        Ok(())
    }

    pub(crate) fn release_event_space(&self, len: usize) {
        *self.event_space.lock().unwrap() += len;
    }

    pub(crate) fn send_event(&self, event: DrmEvent) {
        trace!(?event, "Queueing event");
        if self.events.send(event).is_err() {
            debug!("Event source of client is gone, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{FdTable, OutFenceSlots, UserMemory};
    use crate::{
        error::Error,
        fence::{Fence, FenceContext, SyncFile},
    };

    fn sync_file() -> SyncFile {
        SyncFile::new(Arc::new(Fence::new(FenceContext::alloc(), 1)))
    }

    #[test]
    fn lowest_descriptor_first() {
        let mut table = FdTable::default();
        let a = table.reserve().unwrap();
        let b = table.insert(sync_file()).unwrap();
        assert_eq!((a, b), (0, 1));

        table.put_unused(a);
        assert_eq!(table.reserve().unwrap(), 0);
        assert!(table.get(b).is_some());
        assert!(table.get(0).is_none());
    }

    #[test]
    fn install_needs_reservation() {
        let mut table = FdTable::default();
        assert!(table.install(3, sync_file()).is_err());
        let fd = table.reserve().unwrap();
        table.install(fd, sync_file()).unwrap();
        // installed descriptors are not returned as unused
        table.put_unused(fd);
        assert!(table.close(fd).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn limit_is_enforced() {
        let mut table = FdTable::with_limit(1);
        table.reserve().unwrap();
        assert_eq!(table.reserve(), Err(Error::NoFileDescriptors));
    }

    #[test]
    fn unregistered_slots_fault() {
        let slots = OutFenceSlots::new();
        slots.register(0x1000);
        slots.put_i32(0x1000, -1).unwrap();
        assert_eq!(slots.read(0x1000), Some(-1));
        assert_eq!(slots.put_i32(0x2000, -1), Err(Error::Fault(0x2000)));
    }
}

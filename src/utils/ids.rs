use std::{collections::HashSet, sync::Mutex};

use once_cell::sync::Lazy;

/// Allocator for reusable, non-zero numeric ids.
///
/// Mode objects and transactions are identified by small integers that get handed
/// out again once the owner releases them.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    inner: Mutex<(HashSet<u32>, u32)>,
}

impl IdAllocator {
    pub(crate) fn new() -> Self {
        IdAllocator {
            inner: Mutex::new((HashSet::new(), 1)),
        }
    }

    pub(crate) fn next(&self) -> u32 {
        let (id_set, counter) = &mut *self.inner.lock().unwrap();

        if id_set.len() >= (u32::MAX - 1) as usize {
            panic!("Out of ids");
        }

        // zero is reserved as "no object" on the property interface
        while *counter == 0 || !id_set.insert(*counter) {
            *counter = counter.wrapping_add(1);
        }

        let new_id = *counter;
        *counter = counter.wrapping_add(1);

        new_id
    }

    pub(crate) fn remove(&self, id: u32) -> bool {
        self.inner.lock().unwrap().0.remove(&id)
    }
}

/// Ids of live [`AtomicState`](crate::atomic::AtomicState)s, used for logging
pub(crate) static STATE_IDS: Lazy<IdAllocator> = Lazy::new(IdAllocator::new);

//! # PRT Reference Counting
//!
//! Device-wide count of partially resident mappings. The first user turns
//! PRT mode on, the last one turns it off. Releases tied to outstanding GPU
//! work are deferred until that work retires.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use magma_core::{CompletionSignal, Registration};

use crate::device::VmDevice;

/// PRT user count of one device
pub struct PrtTracker {
    users: AtomicU32,
    lock: spin::Mutex<()>,
    device: Arc<dyn VmDevice>,
}

impl PrtTracker {
    /// Create a tracker with no users
    pub fn new(device: Arc<dyn VmDevice>) -> Self {
        Self {
            users: AtomicU32::new(0),
            lock: spin::Mutex::new(()),
            device,
        }
    }

    /// Current user count
    pub fn users(&self) -> u32 {
        self.users.load(Ordering::Acquire)
    }

    fn update_state(&self) {
        let _guard = self.lock.lock();
        let enable = self.users.load(Ordering::Acquire) > 0;
        self.device.set_prt(enable);
    }

    /// Add a user
    pub fn get(&self) {
        if !self.device.supports_prt() {
            return;
        }
        if self.users.fetch_add(1, Ordering::AcqRel) == 0 {
            self.update_state();
        }
    }

    /// Drop a user
    pub fn put(&self) {
        if !self.device.supports_prt() {
            return;
        }
        match self
            .users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => self.update_state(),
            Ok(_) => {}
            Err(_) => log::warn!("PRT user count underflow"),
        }
    }

    /// Drop a user once `fence` retires
    ///
    /// Without a fence the user is dropped immediately. If the release
    /// cannot be queued the fence is waited on synchronously.
    pub fn put_after(self: &Arc<Self>, fence: Option<&CompletionSignal>) {
        if !self.device.supports_prt() {
            return;
        }
        let Some(fence) = fence else {
            self.put();
            return;
        };

        let tracker = self.clone();
        match fence.on_signaled(move || tracker.put()) {
            Registration::Registered => {}
            Registration::AlreadySignaled(release) => release(),
            Registration::OutOfMemory(release) => {
                fence.wait();
                release();
            }
        }
    }
}

impl core::fmt::Debug for PrtTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PrtTracker")
            .field("users", &self.users())
            .finish()
    }
}

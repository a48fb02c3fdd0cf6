use core::cell::RefCell;

use embassy_sync::blocking_mutex;

use crate::{
    adapter::{WifiError, WifiResult},
    wire::MAX_COMMAND_SIZE,
    DefaultRawMutex,
};

/// A reusable command buffer, handed out by [CommandBufferPool].
///
/// The backing storage travels with the buffer; the pool only accounts for
/// the slot, which bounds how many buffers can be live at once and lets a
/// slot be reused after [CommandBufferPool::free].
pub struct CommandBuffer {
    slot: usize,
    len: usize,
    data: [u8; MAX_COMMAND_SIZE],
}

impl CommandBuffer {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The writable backing storage; the codec fills this.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= MAX_COMMAND_SIZE);
        self.len = len;
    }

    /// The encoded command frame, as it goes onto the bus.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// Fixed capacity arena of command buffers.
///
/// Allocation never blocks: when all slots are taken, the caller gets
/// [Exhausted](WifiError::Exhausted) and decides whether to retry or drop
/// the request. The pool has its own lock and it is never held while any
/// other driver lock is taken.
pub struct CommandBufferPool<const N: usize> {
    in_use: blocking_mutex::Mutex<DefaultRawMutex, RefCell<[bool; N]>>,
}

impl<const N: usize> CommandBufferPool<N> {
    pub const fn new() -> Self {
        Self {
            in_use: blocking_mutex::Mutex::new(RefCell::new([false; N])),
        }
    }

    pub fn allocate(&self) -> WifiResult<CommandBuffer> {
        let slot = self.in_use.lock(|in_use| {
            let mut in_use = in_use.borrow_mut();
            let slot = in_use.iter().position(|used| !used)?;
            in_use[slot] = true;
            Some(slot)
        });
        match slot {
            Some(slot) => Ok(CommandBuffer {
                slot,
                len: 0,
                data: [0; MAX_COMMAND_SIZE],
            }),
            None => {
                warn!("command buffer pool exhausted");
                Err(WifiError::Exhausted)
            }
        }
    }

    pub fn free(&self, buffer: CommandBuffer) {
        self.release(buffer.slot);
    }

    /// Mark a slot free again. Releasing an already free slot is a
    /// bookkeeping error somewhere upstream; it is logged and otherwise
    /// ignored, so the pool accounting stays intact.
    fn release(&self, slot: usize) {
        self.in_use.lock(|in_use| {
            let mut in_use = in_use.borrow_mut();
            if slot >= N || !in_use[slot] {
                warn!("double free of command buffer slot {}", slot);
                return;
            }
            in_use[slot] = false;
        });
    }

    pub fn free_slots(&self) -> usize {
        self.in_use
            .lock(|in_use| in_use.borrow().iter().filter(|used| !**used).count())
    }
}

use embassy_sync::channel::Channel;
use portable_atomic::{AtomicBool, AtomicU16, Ordering};

use crate::DefaultRawMutex;

/// Largest frame accepted for transmission (an Ethernet-sized MPDU).
pub const MAX_FRAME_SIZE: usize = 1514;
/// Frames each access class queue can hold.
pub const TX_QUEUE_DEPTH: usize = 4;

/// Traffic classes, in strict dequeue priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessClass {
    Voice,
    Video,
    BestEffort,
    Background,
}

impl AccessClass {
    /// All classes, highest priority first. Dequeueing walks this order.
    pub const ALL: [AccessClass; 4] = [
        AccessClass::Voice,
        AccessClass::Video,
        AccessClass::BestEffort,
        AccessClass::Background,
    ];

    const fn index(self) -> usize {
        self as usize
    }
}

/// Why a frame was not accepted for transmission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dropped {
    /// The device is not in the `Ready` state.
    NotReady,
    /// The frame's access class queue is at capacity.
    QueueFull,
    /// The frame exceeds [MAX_FRAME_SIZE].
    TooLarge,
    /// The driver was stopped and rejects all traffic.
    Stopped,
}

/// An owned frame waiting in the outbound queue.
pub struct TxFrame {
    len: usize,
    data: [u8; MAX_FRAME_SIZE],
}

impl TxFrame {
    fn new(frame: &[u8]) -> Result<Self, Dropped> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(Dropped::TooLarge);
        }
        let mut data = [0; MAX_FRAME_SIZE];
        data[..frame.len()].copy_from_slice(frame);
        Ok(Self {
            len: frame.len(),
            data,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

type ClassQueue = Channel<DefaultRawMutex, TxFrame, TX_QUEUE_DEPTH>;

/// The outbound queue set: one bounded FIFO per access class, consumed only
/// by the dispatch loop and gated by the credit the device last advertised.
///
/// Ordering policy: frames never reorder within a class; between classes
/// dequeueing is strict priority in [AccessClass::ALL] order. A starved
/// lower class is the documented cost of that choice.
pub struct TxQueue {
    classes: [ClassQueue; 4],
    credit: AtomicU16,
    stopped: AtomicBool,
}

impl TxQueue {
    pub const fn new() -> Self {
        Self {
            classes: [
                Channel::new(),
                Channel::new(),
                Channel::new(),
                Channel::new(),
            ],
            credit: AtomicU16::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Admit a frame into its class queue.
    pub fn enqueue(&self, class: AccessClass, frame: &[u8]) -> Result<(), Dropped> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Dropped::Stopped);
        }
        let frame = TxFrame::new(frame)?;
        self.classes[class.index()]
            .try_send(frame)
            .map_err(|_| Dropped::QueueFull)
    }

    /// Take the next frame in priority order.
    pub fn dequeue(&self) -> Option<TxFrame> {
        AccessClass::ALL
            .iter()
            .find_map(|class| self.classes[class.index()].try_receive().ok())
    }

    pub fn set_credit(&self, credit: u16) {
        self.credit.store(credit, Ordering::Release);
    }

    pub fn credit(&self) -> u16 {
        self.credit.load(Ordering::Acquire)
    }

    /// Consume one unit of credit; false when none is left.
    pub fn take_credit(&self) -> bool {
        self.credit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |credit| {
                credit.checked_sub(1)
            })
            .is_ok()
    }

    pub fn queued(&self) -> usize {
        self.classes.iter().map(|queue| queue.len()).sum()
    }

    /// Stop admitting frames and release everything still queued.
    /// Returns the number of frames rejected by the drain.
    pub fn stop(&self) -> usize {
        self.stopped.store(true, Ordering::Release);
        let mut drained = 0;
        for queue in &self.classes {
            while queue.try_receive().is_ok() {
                drained += 1;
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_queue_rejects_overflow() {
        let queue = TxQueue::new();
        for i in 0..TX_QUEUE_DEPTH {
            assert_eq!(queue.enqueue(AccessClass::BestEffort, &[i as u8]), Ok(()));
        }
        assert_eq!(
            queue.enqueue(AccessClass::BestEffort, &[0xff]),
            Err(Dropped::QueueFull)
        );
        // Other classes still have room.
        assert_eq!(queue.enqueue(AccessClass::Voice, &[1]), Ok(()));
    }

    #[test]
    fn dequeue_is_strict_priority_and_fifo_within_class() {
        let queue = TxQueue::new();
        queue.enqueue(AccessClass::Background, &[4]).unwrap();
        queue.enqueue(AccessClass::BestEffort, &[3]).unwrap();
        queue.enqueue(AccessClass::BestEffort, &[5]).unwrap();
        queue.enqueue(AccessClass::Voice, &[1]).unwrap();

        let order: [u8; 4] = core::array::from_fn(|_| queue.dequeue().unwrap().data()[0]);
        assert_eq!(order, [1, 3, 5, 4]);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let queue = TxQueue::new();
        let frame = [0u8; MAX_FRAME_SIZE + 1];
        assert_eq!(
            queue.enqueue(AccessClass::Voice, &frame),
            Err(Dropped::TooLarge)
        );
    }

    #[test]
    fn credit_is_consumed_one_frame_at_a_time() {
        let queue = TxQueue::new();
        queue.set_credit(2);
        assert!(queue.take_credit());
        assert!(queue.take_credit());
        assert!(!queue.take_credit());
        queue.set_credit(1);
        assert!(queue.take_credit());
    }

    #[test]
    fn stop_drains_and_rejects() {
        let queue = TxQueue::new();
        queue.enqueue(AccessClass::Voice, &[1]).unwrap();
        queue.enqueue(AccessClass::Background, &[2]).unwrap();
        assert_eq!(queue.stop(), 2);
        assert_eq!(queue.queued(), 0);
        assert_eq!(queue.enqueue(AccessClass::Voice, &[3]), Err(Dropped::Stopped));
    }
}

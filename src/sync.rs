use core::{cell::RefCell, future::poll_fn, task::Poll};

use atomic_waker::AtomicWaker;
use embassy_sync::blocking_mutex;
use portable_atomic::{AtomicBool, AtomicU8, Ordering};

use crate::{adapter::WifiResult, wire::Response, DefaultRawMutex};

/// The single pending-response slot.
///
/// Only one command is ever outstanding, so this is a rendezvous point, not
/// a queue: the waiter arms the slot before its command is sent, the
/// dispatch loop completes it, and completions nobody armed for are
/// rejected so the dispatch loop can drop them as stale.
pub struct ResponseSignal {
    state: AtomicU8,
    slot: blocking_mutex::Mutex<DefaultRawMutex, RefCell<Option<WifiResult<Response>>>>,
    waker: AtomicWaker,
}

impl ResponseSignal {
    const IDLE: u8 = 0;
    const ARMED: u8 = 1;
    const READY: u8 = 2;

    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(Self::IDLE),
            slot: blocking_mutex::Mutex::new(RefCell::new(None)),
            waker: AtomicWaker::new(),
        }
    }

    /// Register interest in the next completion. Clears any stale leftover.
    pub fn arm(&self) {
        self.slot.lock(|slot| slot.borrow_mut().take());
        self.state.store(Self::ARMED, Ordering::Release);
    }

    /// Drop interest again, e.g. after a timeout. A completion arriving
    /// later will be rejected.
    pub fn disarm(&self) {
        self.state.store(Self::IDLE, Ordering::Release);
        self.slot.lock(|slot| slot.borrow_mut().take());
    }

    /// Hand a completion to the armed waiter. Returns false, if no waiter
    /// was armed, in which case the caller still owns the (stale) result.
    pub fn complete(&self, result: WifiResult<Response>) -> bool {
        if self
            .state
            .compare_exchange(Self::ARMED, Self::READY, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.slot.lock(|slot| *slot.borrow_mut() = Some(result));
        self.waker.wake();
        true
    }

    /// Claim a completion without waiting.
    pub fn try_take(&self) -> Option<WifiResult<Response>> {
        if self
            .state
            .compare_exchange(Self::READY, Self::IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        self.slot.lock(|slot| slot.borrow_mut().take())
    }

    /// Wait for the completion of the armed exchange.
    pub async fn wait(&self) -> WifiResult<Response> {
        poll_fn(|cx| {
            if let Some(result) = self.try_take() {
                return Poll::Ready(result);
            }
            self.waker.register(cx.waker());
            match self.try_take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Pending,
            }
        })
        .await
    }

    #[cfg(test)]
    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == Self::READY
    }
}

/// Wakes the dispatch loop, when there is work to look at.
///
/// Level triggered: any number of notifications collapse into one pending
/// flag, because a dispatch pass drains everything that is pending anyway.
pub struct DispatchSignal {
    pending: AtomicBool,
    waker: AtomicWaker,
}

impl DispatchSignal {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        }
    }

    pub fn notify(&self) {
        self.pending.store(true, Ordering::Release);
        self.waker.wake();
    }

    /// Wait until the next notification since the last completed wait.
    pub async fn wait(&self) {
        poll_fn(|cx| {
            if self.pending.swap(false, Ordering::AcqRel) {
                return Poll::Ready(());
            }
            self.waker.register(cx.waker());
            if self.pending.swap(false, Ordering::AcqRel) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::WifiError;
    use crate::wire::{CommandHeader, CommandOpcode, COMMAND_HEADER_LEN, RESPONSE_FLAG};
    use embassy_futures::block_on;

    fn response(sequence: u16) -> Response {
        let mut frame = [0u8; COMMAND_HEADER_LEN];
        CommandHeader::new()
            .with_opcode(CommandOpcode::FuncInit.into_bits() | RESPONSE_FLAG)
            .with_size(COMMAND_HEADER_LEN as u16)
            .with_sequence(sequence)
            .write_to(&mut frame);
        Response::parse(&frame).unwrap()
    }

    #[test]
    fn completion_reaches_armed_waiter() {
        let signal = ResponseSignal::new();
        signal.arm();
        assert!(signal.complete(Ok(response(9))));
        let got = block_on(signal.wait()).unwrap();
        assert_eq!(got.sequence(), 9);
    }

    #[test]
    fn unsolicited_completion_is_rejected() {
        let signal = ResponseSignal::new();
        assert!(!signal.complete(Ok(response(1))));

        signal.arm();
        signal.disarm();
        assert!(!signal.complete(Err(WifiError::Transport)));
        assert!(signal.try_take().is_none());
    }

    #[test]
    fn dispatch_signal_collapses_notifications() {
        let signal = DispatchSignal::new();
        signal.notify();
        signal.notify();
        block_on(signal.wait());
        // Both notifications were folded into the one wait above.
        assert!(!signal.pending.load(Ordering::Acquire));
    }
}

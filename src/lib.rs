//! # `sdio-wifi-hal`
//! Host-side driver core for SDIO-attached Wi-Fi adapters, covering
//! firmware bring-up, the firmware command/response protocol and the
//! interrupt driven dispatch between the host stack and the device.
//! ## Driver overview
//! This chapter gives a short overview of how the pieces fit together.
//!
//! ### Command path
//! The device executes exactly one host command at a time, so the whole
//! command path funnels through a single in-flight slot. Callers allocate a
//! buffer from a fixed pool, the engine stamps a sequence number and queues
//! the buffer, and the dispatch loop puts it on the bus once nothing else
//! is outstanding. The matching response is identified by the response flag
//! in the opcode and the echoed sequence number, then handed to the single
//! waiting submitter. Because only one command is ever in flight, matching
//! could be purely positional; the sequence check is kept as defense in
//! depth against a confused device.
//!
//! ### Bring-up
//! Firmware is downloaded through the transport's programming primitive,
//! unless a probe shows it already running. Readiness is polled with a
//! bounded number of attempts, then the ordered init sequence runs:
//! function init, hardware-spec query (which yields the MAC address and the
//! initial transmit credit) and radio enable. The ordering is mandated by
//! the firmware and any failure pins the device in the `Error` state; a
//! half-configured device is worse than a dead one.
//!
//! ### Dispatch
//! All asynchronous work funnels through one reactive pass: snapshot the
//! accumulated interrupt status, let the transport turn it into pending
//! response/event/credit items, deliver the response to its waiter, route
//! events to the handler, then use whatever transmit credit is available to
//! push queued frames. Responses are always serviced before events, so
//! event floods cannot starve a command waiter.
//!
//! ### Transmit (TX)
//! Outbound frames are admitted into four bounded access-class FIFOs and
//! leave strictly highest class first, FIFO within a class. The device
//! advertises how many outbound buffers it has free (the credit); the
//! dispatch loop never sends more frames than that.

#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]
pub(crate) mod fmt;

mod adapter;
mod pool;
mod queue;
mod sync;
mod transport;
mod wire;

pub use adapter::*;
pub use pool::{CommandBuffer, CommandBufferPool};
pub use queue::{AccessClass, Dropped, TxFrame, MAX_FRAME_SIZE, TX_QUEUE_DEPTH};
pub use transport::{InterruptStatus, PendingWork, Transport};
pub use wire::{
    CommandAction, CommandBody, CommandHeader, CommandOpcode, DeviceEvent, FilterFlags,
    HwSpecInfo, MulticastList, Response, COMMAND_HEADER_LEN, MAX_COMMAND_SIZE, MAX_EVENT_SIZE,
    MAX_MULTICAST_ADDRS, RESPONSE_FLAG,
};

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}

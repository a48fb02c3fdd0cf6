use bitfield_struct::bitfield;

use crate::adapter::WifiResult;

/// Interrupt reasons accumulated since the last dispatch pass.
///
/// The bus glue ORs the status bits it sees into the driver via
/// [Control::on_interrupt](crate::Control::on_interrupt); the dispatch loop
/// snapshots and clears them in one step at the start of every pass.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct InterruptStatus {
    /// Bus level servicing is required (upload/download units, errors).
    pub transport: bool,
    /// A command response is waiting to be read.
    pub cmd_response: bool,
    /// An asynchronous device event is waiting to be read.
    pub event: bool,
    /// The device's advertised outbound buffer credit changed.
    pub tx_credit: bool,
    #[bits(28)]
    pub __: u32,
}

impl InterruptStatus {
    pub const fn any(self) -> bool {
        self.into_bits() != 0
    }
}

/// What a call to [Transport::read_pending] actually found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingWork {
    /// Length of a response frame written into the response scratch buffer.
    pub response_len: Option<usize>,
    /// Length of an event record written into the event scratch buffer.
    pub event_len: Option<usize>,
    /// The device's newly advertised outbound buffer credit.
    pub tx_credit: Option<u16>,
}

impl PendingWork {
    pub fn is_empty(&self) -> bool {
        self.response_len.is_none() && self.event_len.is_none() && self.tx_credit.is_none()
    }
}

/// The bus capability the driver is built on.
///
/// This is the narrow waist between the protocol engine and a concrete
/// block oriented bus (SDIO in practice). Implementations own all register
/// and block transfer details; the driver only ever moves whole command
/// frames, data frames and the firmware image through it.
pub trait Transport {
    /// Probe once whether the firmware reports itself up and running.
    /// Retry policies live in the caller.
    async fn fw_ready(&mut self) -> WifiResult<bool>;

    /// Stream the firmware image into the device.
    async fn program_firmware(&mut self, image: &[u8]) -> WifiResult<()>;

    /// Unmask the device's host interrupts.
    async fn enable_interrupts(&mut self);

    /// Write one encoded command frame to the command port.
    async fn send_command(&mut self, cmd: &[u8]) -> WifiResult<()>;

    /// Write one data frame to the data port.
    async fn send_frame(&mut self, frame: &[u8]) -> WifiResult<()>;

    /// Service pending bus work and collect whatever arrived.
    ///
    /// Called once per dispatch pass. `status` is the interrupt snapshot
    /// accumulated since the last pass; purely polled transports may see an
    /// empty snapshot and should consult their own pending state instead. A
    /// response frame goes into `response`, an event record into `event`,
    /// and the returned [PendingWork] says which of them (and which credit
    /// update) are valid.
    async fn read_pending(
        &mut self,
        status: InterruptStatus,
        response: &mut [u8],
        event: &mut [u8],
    ) -> WifiResult<PendingWork>;
}

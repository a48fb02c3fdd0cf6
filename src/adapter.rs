use core::cell::RefCell;

use embassy_sync::{blocking_mutex, channel::Channel, channel::TrySendError, mutex::Mutex};
use embassy_time::{with_timeout, Duration, Timer};
use portable_atomic::{AtomicU16, Ordering};

use crate::{
    pool::{CommandBuffer, CommandBufferPool},
    queue::{AccessClass, Dropped, TxQueue},
    sync::{DispatchSignal, ResponseSignal},
    transport::{InterruptStatus, PendingWork, Transport},
    wire::{
        self, CommandBody, CommandOpcode, DeviceEvent, FilterFlags, HwSpecInfo, MulticastList,
        Response, MAX_COMMAND_SIZE, MAX_EVENT_SIZE, RESPONSE_FLAG,
    },
    DefaultRawMutex,
};

/// Command buffers in the pool; also bounds the submission queue.
pub const COMMAND_BUFFERS: usize = 8;

/// Which step of the ordered bring-up sequence failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BringupStep {
    FirmwareDownload,
    ReadyPoll,
    FuncInit,
    HwSpec,
    RadioEnable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WifiError {
    /// The bus failed; fatal to the operation it interrupted.
    Transport,
    /// No response within the configured bound. The caller decides whether
    /// to retry.
    Timeout,
    /// No free command buffer, or a body too large for one. Recoverable.
    Exhausted,
    /// The device is not in the [Ready](DeviceState::Ready) state.
    NotReady,
    /// An ordered bring-up step failed; the device is now in
    /// [Error](DeviceState::Error) and needs an external reset.
    Bringup(BringupStep),
}

pub type WifiResult<T> = Result<T, WifiError>;

/// Lifecycle state of the device.
///
/// `Error` is terminal as far as this driver is concerned: recovery means
/// tearing the device down externally and starting over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DeviceState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Error,
}

/// Tunables fixed at construction time.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// How often to poll for firmware readiness after the download.
    pub fw_ready_attempts: usize,
    /// Delay between two readiness polls.
    pub fw_ready_poll_interval: Duration,
    /// How long a submitted command may go unanswered.
    pub command_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fw_ready_attempts: 10,
            fw_ready_poll_interval: Duration::from_millis(100),
            command_timeout: Duration::from_secs(2),
        }
    }
}

/// Receiver for asynchronous device events, routed by kind from the
/// dispatch loop. All methods default to ignoring the event.
pub trait EventHandler {
    fn association_change(&mut self, connected: bool, peer: [u8; 6]) {
        let _ = (connected, peer);
    }
    fn key_event(&mut self, key_index: u8, pairwise: bool) {
        let _ = (key_index, pairwise);
    }
    fn scan_complete(&mut self) {}
    fn link_lost(&mut self) {}
}

impl EventHandler for () {}

/// A configuration delta pushed down from the host stack.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDelta {
    /// Retune to this channel.
    pub channel: Option<u16>,
}

/// Receive filter settings requested by the host stack.
#[derive(Clone, Copy, Debug, Default)]
pub struct FilterConfig {
    pub promiscuous: bool,
    pub all_multicast: bool,
}

struct QueuedCommand {
    buffer: CommandBuffer,
    opcode: u16,
    sequence: u16,
    wants_response: bool,
}

struct InFlight {
    buffer: CommandBuffer,
    opcode: u16,
    sequence: u16,
    wants_response: bool,
}

/// State behind the single short-held status lock: the interrupt snapshot,
/// the device lifecycle state and the in-flight command record.
struct StatusState {
    int_status: u32,
    device_state: DeviceState,
    in_flight: Option<InFlight>,
    hw_info: Option<HwSpecInfo>,
}

pub(crate) struct Shared {
    status: blocking_mutex::Mutex<DefaultRawMutex, RefCell<StatusState>>,
    pool: CommandBufferPool<COMMAND_BUFFERS>,
    tx: TxQueue,
    response: ResponseSignal,
    dispatch: DispatchSignal,
    commands: Channel<DefaultRawMutex, QueuedCommand, COMMAND_BUFFERS>,
    /// Serializes `submit_sync` callers, so command submission is FIFO with
    /// respect to firmware processing. Blocking-FIFO under contention is a
    /// deliberate policy choice.
    submit_gate: Mutex<DefaultRawMutex, ()>,
    sequence: AtomicU16,
}

impl Shared {
    const fn new() -> Self {
        Self {
            status: blocking_mutex::Mutex::new(RefCell::new(StatusState {
                int_status: 0,
                device_state: DeviceState::Uninitialized,
                in_flight: None,
                hw_info: None,
            })),
            pool: CommandBufferPool::new(),
            tx: TxQueue::new(),
            response: ResponseSignal::new(),
            dispatch: DispatchSignal::new(),
            commands: Channel::new(),
            submit_gate: Mutex::new(()),
            sequence: AtomicU16::new(0),
        }
    }

    fn device_state(&self) -> DeviceState {
        self.status.lock(|s| s.borrow().device_state)
    }

    fn set_device_state(&self, device_state: DeviceState) {
        debug!("device state -> {:?}", device_state);
        self.status.lock(|s| s.borrow_mut().device_state = device_state);
    }

    /// Atomically snapshot and clear the accumulated interrupt status.
    fn take_int_status(&self) -> InterruptStatus {
        self.status
            .lock(|s| InterruptStatus::from_bits(core::mem::take(&mut s.borrow_mut().int_status)))
    }

    /// Fill a pool buffer with an encoded command and queue it for the
    /// dispatch loop. Returns the stamped sequence number.
    fn enqueue_command(
        &self,
        opcode: CommandOpcode,
        body: &CommandBody<'_>,
        wants_response: bool,
    ) -> WifiResult<u16> {
        let mut buffer = self.pool.allocate()?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let len = match wire::encode_command(buffer.data_mut(), opcode, sequence, body) {
            Ok(len) => len,
            Err(err) => {
                self.pool.free(buffer);
                return Err(err);
            }
        };
        buffer.set_len(len);
        if wants_response {
            self.response.arm();
        }
        if let Err(TrySendError::Full(cmd)) = self.commands.try_send(QueuedCommand {
            buffer,
            opcode: opcode.into_bits(),
            sequence,
            wants_response,
        }) {
            // The queue is as deep as the pool, so this only happens when
            // buffers leaked somewhere. Recover instead of wedging.
            if wants_response {
                self.response.disarm();
            }
            self.pool.free(cmd.buffer);
            return Err(WifiError::Exhausted);
        }
        Ok(sequence)
    }

    /// Give up on the in-flight command with this sequence number, e.g.
    /// after its waiter timed out. The (stale) response may still arrive
    /// later and will be dropped by the matcher.
    fn abandon_in_flight(&self, sequence: u16) {
        let stale = self.status.lock(|s| {
            let mut s = s.borrow_mut();
            match &s.in_flight {
                Some(in_flight) if in_flight.sequence == sequence => s.in_flight.take(),
                _ => None,
            }
        });
        // Pool lock is taken only after the status lock is released.
        if let Some(in_flight) = stale {
            self.pool.free(in_flight.buffer);
        }
    }
}

/// Driver state shared between [Control] and [Runner]. Allocate it where it
/// outlives both, typically in a `static`, and pass it to [new].
pub struct State {
    pub(crate) shared: Shared,
}

impl State {
    pub const fn new() -> Self {
        Self {
            shared: Shared::new(),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Split the driver into its caller-facing [Control] handle and the
/// [Runner] that owns the transport and executes the dispatch loop.
pub fn new<'a, T: Transport, H: EventHandler>(
    state: &'a mut State,
    transport: T,
    handler: H,
    config: Config,
) -> (Control<'a>, Runner<'a, T, H>) {
    let shared: &'a Shared = &state.shared;
    (
        Control { shared, config },
        Runner {
            shared,
            transport,
            handler,
            config,
            cmd_scratch: [0; MAX_COMMAND_SIZE],
            event_scratch: [0; MAX_EVENT_SIZE],
        },
    )
}

/// Cheap handle for caller contexts: command submission, transmit
/// admission, configuration updates and interrupt notification.
#[derive(Clone, Copy)]
pub struct Control<'a> {
    pub(crate) shared: &'a Shared,
    config: Config,
}

impl Control<'_> {
    pub fn device_state(&self) -> DeviceState {
        self.shared.device_state()
    }

    pub fn mac_address(&self) -> Option<[u8; 6]> {
        self.shared
            .status
            .lock(|s| s.borrow().hw_info.map(|info| info.mac_address))
    }

    pub fn firmware_version(&self) -> Option<u32> {
        self.shared
            .status
            .lock(|s| s.borrow().hw_info.map(|info| info.fw_version))
    }

    /// Accumulate interrupt reasons from the bus glue and kick the
    /// dispatch loop. Safe to call from any context.
    pub fn on_interrupt(&self, status: InterruptStatus) {
        self.shared
            .status
            .lock(|s| s.borrow_mut().int_status |= status.into_bits());
        self.shared.dispatch.notify();
    }

    /// Submit a command and wait for its response.
    ///
    /// Submissions are served strictly FIFO and one at a time; under
    /// contention callers queue on the submit gate. The wait is bounded by
    /// [Config::command_timeout].
    pub async fn submit_sync(
        &self,
        opcode: CommandOpcode,
        body: CommandBody<'_>,
    ) -> WifiResult<Response> {
        let _gate = self.shared.submit_gate.lock().await;
        if self.shared.device_state() != DeviceState::Ready {
            return Err(WifiError::NotReady);
        }
        let sequence = self.shared.enqueue_command(opcode, &body, true)?;
        self.shared.dispatch.notify();
        match with_timeout(self.config.command_timeout, self.shared.response.wait()).await {
            Ok(result) => result,
            Err(_) => {
                self.shared.response.disarm();
                self.shared.abandon_in_flight(sequence);
                warn!("command {:#x} seq {} timed out", opcode.into_bits(), sequence);
                Err(WifiError::Timeout)
            }
        }
    }

    /// Submit a command without waiting for a response. The buffer is
    /// released as soon as the transport accepts it; a send failure is
    /// logged by the dispatch loop but not reported back.
    pub async fn submit_async(
        &self,
        opcode: CommandOpcode,
        body: CommandBody<'_>,
    ) -> WifiResult<()> {
        let _gate = self.shared.submit_gate.lock().await;
        if self.shared.device_state() != DeviceState::Ready {
            return Err(WifiError::NotReady);
        }
        self.shared.enqueue_command(opcode, &body, false)?;
        self.shared.dispatch.notify();
        Ok(())
    }

    /// Apply a configuration delta from the host stack.
    pub async fn configuration_changed(&self, delta: ConfigDelta) -> WifiResult<()> {
        if let Some(channel) = delta.channel {
            debug!("retuning to channel {}", channel);
            self.submit_sync(CommandOpcode::RfChannel, CommandBody::RfChannel { channel })
                .await?;
        }
        Ok(())
    }

    /// Build the multicast list for a following [configure_filter]
    /// (Control::configure_filter) call. Over-long lists are truncated but
    /// remember the requested count, so the filter step can fall back to
    /// all-multicast.
    pub fn prepare_multicast(&self, addrs: &[[u8; 6]]) -> MulticastList {
        MulticastList::new(addrs)
    }

    /// Reconfigure the receive filter, optionally installing a multicast
    /// list prepared by [prepare_multicast](Control::prepare_multicast).
    pub async fn configure_filter(
        &self,
        filter: FilterConfig,
        multicast: Option<MulticastList>,
    ) -> WifiResult<()> {
        let mut flags = FilterFlags::new()
            .with_enable_rx(true)
            .with_enable_tx(true)
            .with_enable_80211(true)
            .with_enable_mgmt(true);
        if filter.promiscuous {
            flags.set_promiscuous(true);
        }
        let overflow = multicast.as_ref().map_or(false, |list| list.truncated());
        if filter.all_multicast || overflow {
            flags.set_all_multicast(true);
        } else if let Some(list) = &multicast {
            // The list push is fire-and-forget; only the filter command
            // below decides whether the new configuration took effect.
            self.submit_async(CommandOpcode::MulticastAddr, CommandBody::MulticastList(list))
                .await?;
        }
        let command = CommandBody::MacControl { filter: flags };
        match self.submit_sync(CommandOpcode::MacControl, command).await {
            // A lost filter response in steady state is worth one retry;
            // the command is idempotent.
            Err(WifiError::Timeout) => {
                warn!("filter update timed out, retrying once");
                self.submit_sync(CommandOpcode::MacControl, command).await
            }
            other => other,
        }
        .map(|_| ())
    }

    /// Install a new beacon template.
    pub async fn beacon_template_changed(&self, template: &[u8]) -> WifiResult<()> {
        self.submit_sync(CommandOpcode::BeaconSet, CommandBody::BeaconSet(template))
            .await
            .map(|_| ())
    }

    /// Enable or disable beaconing with the given interval (in TU).
    pub async fn set_beacon_enabled(&self, interval: u16, enabled: bool) -> WifiResult<()> {
        self.submit_sync(
            CommandOpcode::BeaconControl,
            CommandBody::BeaconControl { interval, enabled },
        )
        .await
        .map(|_| ())
    }

    /// Admit a frame for transmission. Frames only flow while the device is
    /// [Ready](DeviceState::Ready); the dispatch loop transmits them in
    /// FIFO order per class, strict priority between classes, bounded by
    /// the credit the device last advertised.
    pub fn on_frame_to_transmit(&self, class: AccessClass, frame: &[u8]) -> Result<(), Dropped> {
        if self.shared.device_state() != DeviceState::Ready {
            return Err(Dropped::NotReady);
        }
        self.shared.tx.enqueue(class, frame)?;
        self.shared.dispatch.notify();
        Ok(())
    }

    /// Stop accepting traffic and drain everything still queued.
    pub fn stop(&self) {
        self.shared.status.lock(|s| {
            let mut s = s.borrow_mut();
            if s.device_state == DeviceState::Ready {
                s.device_state = DeviceState::Uninitialized;
            }
        });
        let drained = self.shared.tx.stop();
        info!("driver stopped, rejected {} queued frames", drained);
    }
}

/// Owns the [Transport] and the event handler; executes firmware bring-up
/// and the dispatch loop.
pub struct Runner<'a, T: Transport, H: EventHandler> {
    shared: &'a Shared,
    transport: T,
    handler: H,
    config: Config,
    cmd_scratch: [u8; MAX_COMMAND_SIZE],
    event_scratch: [u8; MAX_EVENT_SIZE],
}

impl<T: Transport, H: EventHandler> Runner<'_, T, H> {
    /// Bring the device up: download firmware if needed, wait for it to
    /// boot, then issue the ordered init sequence. Call once, before
    /// [run](Runner::run).
    ///
    /// Any step failure leaves the device in [Error](DeviceState::Error);
    /// there is no partial success and no automatic restart.
    pub async fn init(&mut self, firmware: &[u8]) -> WifiResult<()> {
        info!("starting firmware bring-up ({} byte image)", firmware.len());
        self.shared.set_device_state(DeviceState::Initializing);
        match self.bring_up(firmware).await {
            Ok(()) => {
                self.shared.set_device_state(DeviceState::Ready);
                info!("device ready");
                self.shared.dispatch.notify();
                Ok(())
            }
            Err(err) => {
                error!("bring-up failed: {:?}", err);
                self.shared.set_device_state(DeviceState::Error);
                Err(err)
            }
        }
    }

    async fn bring_up(&mut self, firmware: &[u8]) -> WifiResult<()> {
        if self
            .transport
            .fw_ready()
            .await
            .map_err(|_| WifiError::Bringup(BringupStep::FirmwareDownload))?
        {
            info!("firmware already running, skipping download");
        } else {
            self.transport
                .program_firmware(firmware)
                .await
                .map_err(|_| WifiError::Bringup(BringupStep::FirmwareDownload))?;
            self.poll_fw_ready().await?;
        }
        self.transport.enable_interrupts().await;

        // The init commands have implicit ordering dependencies in the
        // firmware; they must go out exactly in this order and the whole
        // sequence aborts on the first failure.
        let resp = self
            .exec_sync(CommandOpcode::FuncInit, CommandBody::FuncInit)
            .await
            .map_err(|_| WifiError::Bringup(BringupStep::FuncInit))?;
        if !resp.is_success() {
            return Err(WifiError::Bringup(BringupStep::FuncInit));
        }

        let resp = self
            .exec_sync(CommandOpcode::HwSpec, CommandBody::HwSpec)
            .await
            .map_err(|_| WifiError::Bringup(BringupStep::HwSpec))?;
        let info = resp
            .is_success()
            .then(|| HwSpecInfo::parse(resp.body()))
            .flatten()
            .ok_or(WifiError::Bringup(BringupStep::HwSpec))?;
        debug!(
            "hw spec: mac {:?}, fw {:#x}, {} tx buffers",
            info.mac_address, info.fw_version, info.tx_buffers
        );
        self.shared.status.lock(|s| s.borrow_mut().hw_info = Some(info));
        self.shared.tx.set_credit(info.tx_buffers);

        let resp = self
            .exec_sync(CommandOpcode::RadioControl, CommandBody::RadioControl { on: true })
            .await
            .map_err(|_| WifiError::Bringup(BringupStep::RadioEnable))?;
        if !resp.is_success() {
            return Err(WifiError::Bringup(BringupStep::RadioEnable));
        }
        Ok(())
    }

    /// Poll for firmware readiness, bounded by the configured ceiling.
    async fn poll_fw_ready(&mut self) -> WifiResult<()> {
        for attempt in 0..self.config.fw_ready_attempts {
            if self.transport.fw_ready().await.unwrap_or(false) {
                debug!("firmware ready after {} polls", attempt + 1);
                return Ok(());
            }
            if attempt + 1 < self.config.fw_ready_attempts {
                Timer::after(self.config.fw_ready_poll_interval).await;
            }
        }
        error!(
            "firmware not ready after {} polls",
            self.config.fw_ready_attempts
        );
        Err(WifiError::Bringup(BringupStep::ReadyPoll))
    }

    /// Submit a command from the runner's own context (bring-up), pumping
    /// the dispatch loop until the response arrives or the deadline hits.
    async fn exec_sync(
        &mut self,
        opcode: CommandOpcode,
        body: CommandBody<'_>,
    ) -> WifiResult<Response> {
        let sequence = self.shared.enqueue_command(opcode, &body, true)?;
        self.shared.dispatch.notify();
        let timeout = self.config.command_timeout;
        let result = with_timeout(timeout, async {
            loop {
                self.main_process().await;
                if let Some(result) = self.shared.response.try_take() {
                    return result;
                }
                self.shared.dispatch.wait().await;
            }
        })
        .await;
        match result {
            Ok(result) => result,
            Err(_) => {
                self.shared.response.disarm();
                self.shared.abandon_in_flight(sequence);
                Err(WifiError::Timeout)
            }
        }
    }

    /// One pass of the dispatch loop; also the hook a polling transport's
    /// periodic trigger calls. Returns whether any work was done.
    ///
    /// Within a pass the order is fixed: interrupt snapshot, transport
    /// servicing, response delivery, event routing, credit update, command
    /// execution, frame push. Responses always beat events, so an event
    /// flood can never starve a command waiter. A failing step is logged
    /// and the pass carries on with the next one.
    pub async fn main_process(&mut self) -> bool {
        let status = self.shared.take_int_status();
        if status.any() {
            trace!("servicing interrupt status {:#x}", status.into_bits());
        }

        let work = match self
            .transport
            .read_pending(status, &mut self.cmd_scratch, &mut self.event_scratch)
            .await
        {
            Ok(work) => work,
            Err(_) => {
                warn!("transport failed to service pending work");
                PendingWork::default()
            }
        };
        let mut did_work = !work.is_empty();

        if let Some(len) = work.response_len {
            self.handle_response(len);
        }
        if let Some(len) = work.event_len {
            self.handle_event(len);
        }
        if let Some(credit) = work.tx_credit {
            trace!("tx credit now {}", credit);
            self.shared.tx.set_credit(credit);
        }

        did_work |= self.execute_pending_command().await;
        did_work |= self.push_frames().await;
        did_work
    }

    /// Drive the dispatch loop forever. Wakeups come from
    /// [Control::on_interrupt] and from submitters.
    pub async fn run(&mut self) -> ! {
        loop {
            while self.main_process().await {
                embassy_futures::yield_now().await;
            }
            self.shared.dispatch.wait().await;
        }
    }

    /// Match a received response against the in-flight command and wake the
    /// waiter. Anything that does not match is dropped here; a bad frame
    /// must never take the loop down.
    fn handle_response(&mut self, len: usize) {
        let Some(response) = Response::parse(&self.cmd_scratch[..len]) else {
            warn!("dropping malformed response frame ({} bytes)", len);
            return;
        };
        let matched = self.shared.status.lock(|s| {
            let mut s = s.borrow_mut();
            match &s.in_flight {
                Some(in_flight)
                    if response.opcode() == in_flight.opcode | RESPONSE_FLAG
                        && response.sequence() == in_flight.sequence =>
                {
                    s.in_flight.take()
                }
                _ => None,
            }
        });
        let Some(in_flight) = matched else {
            warn!(
                "dropping unsolicited response, opcode {:#x} seq {}",
                response.opcode(),
                response.sequence()
            );
            return;
        };
        trace!("response for {:#x} seq {}", in_flight.opcode, in_flight.sequence);
        self.shared.pool.free(in_flight.buffer);
        if in_flight.wants_response && !self.shared.response.complete(Ok(response)) {
            warn!(
                "response seq {} arrived after its waiter gave up",
                in_flight.sequence
            );
        }
    }

    /// Decode an event record and route it by kind.
    fn handle_event(&mut self, len: usize) {
        let Some(event) = DeviceEvent::parse(&self.event_scratch[..len]) else {
            warn!("dropping undecodable event record ({} bytes)", len);
            return;
        };
        trace!("event: {:?}", event);
        match event {
            DeviceEvent::AssociationChange { connected, peer } => {
                self.handler.association_change(connected, peer)
            }
            DeviceEvent::KeyEvent { key_index, pairwise } => {
                self.handler.key_event(key_index, pairwise)
            }
            DeviceEvent::ScanComplete => self.handler.scan_complete(),
            DeviceEvent::LinkLost => self.handler.link_lost(),
        }
    }

    /// Send the next queued command, if none is outstanding. Firmware
    /// processes one command at a time, so neither does the driver send a
    /// second one before the first answered.
    async fn execute_pending_command(&mut self) -> bool {
        let busy = self.shared.status.lock(|s| s.borrow().in_flight.is_some());
        if busy {
            return false;
        }
        let Ok(cmd) = self.shared.commands.try_receive() else {
            return false;
        };
        trace!("sending command {:#x} seq {}", cmd.opcode, cmd.sequence);
        match self.transport.send_command(cmd.buffer.as_bytes()).await {
            Ok(()) => {
                if cmd.wants_response {
                    self.shared.status.lock(|s| {
                        s.borrow_mut().in_flight = Some(InFlight {
                            buffer: cmd.buffer,
                            opcode: cmd.opcode,
                            sequence: cmd.sequence,
                            wants_response: true,
                        })
                    });
                } else {
                    self.shared.pool.free(cmd.buffer);
                }
            }
            Err(_) => {
                warn!("transport rejected command {:#x}", cmd.opcode);
                self.shared.pool.free(cmd.buffer);
                if cmd.wants_response && !self.shared.response.complete(Err(WifiError::Transport)) {
                    warn!("send failure had no waiter to report to");
                }
            }
        }
        true
    }

    /// Push queued frames out, newest credit first come first served.
    async fn push_frames(&mut self) -> bool {
        if self.shared.device_state() != DeviceState::Ready {
            return false;
        }
        let mut sent = false;
        while self.shared.tx.credit() > 0 {
            let Some(frame) = self.shared.tx.dequeue() else {
                break;
            };
            self.shared.tx.take_credit();
            if self.transport.send_frame(frame.data()).await.is_err() {
                // The device buffer is assumed burned either way; the
                // credit count resynchronizes with the next credit update.
                warn!("transport rejected a {} byte frame", frame.data().len());
            }
            sent = true;
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TX_QUEUE_DEPTH;
    use crate::wire::{CommandHeader, COMMAND_HEADER_LEN};
    use core::cell::{Cell, RefCell};
    use embassy_futures::{
        block_on,
        join::join,
        select::{select, Either},
    };
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::vec::Vec;

    const FIRMWARE: &[u8] = &[0xfe; 64];
    const MAC: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];

    fn test_config() -> Config {
        Config {
            fw_ready_attempts: 5,
            fw_ready_poll_interval: Duration::from_millis(1),
            command_timeout: Duration::from_millis(50),
        }
    }

    #[derive(Default)]
    struct Arrival {
        response: Option<Vec<u8>>,
        event: Option<Vec<u8>>,
        credit: Option<u16>,
    }

    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    enum WireRecord {
        Command(u16),
        Response(u16),
        Frame,
    }

    #[derive(Default)]
    struct MockInner {
        fw_running: bool,
        /// `Some(n)`: ready on the n-th poll after download; `None`: never.
        ready_after_polls: Option<usize>,
        programmed: bool,
        polls_after_program: usize,
        interrupts_enabled: bool,
        auto_respond: bool,
        fail_commands: bool,
        /// Event bytes to deliver together with the next auto response.
        attach_event: Option<Vec<u8>>,
        tx_buffers: u16,
        commands: Vec<Vec<u8>>,
        frames: Vec<Vec<u8>>,
        arrivals: VecDeque<Arrival>,
        wire_log: Vec<WireRecord>,
    }

    #[derive(Clone)]
    struct MockTransport(Rc<RefCell<MockInner>>);

    impl MockTransport {
        fn healthy() -> Self {
            MockTransport(Rc::new(RefCell::new(MockInner {
                ready_after_polls: Some(2),
                auto_respond: true,
                tx_buffers: 4,
                ..MockInner::default()
            })))
        }

        fn inner(&self) -> core::cell::RefMut<'_, MockInner> {
            self.0.borrow_mut()
        }

        fn push_arrival(&self, arrival: Arrival) {
            self.inner().arrivals.push_back(arrival);
        }

        fn sent_opcodes(&self) -> Vec<u16> {
            self.inner()
                .commands
                .iter()
                .map(|cmd| CommandHeader::parse(cmd).unwrap().opcode())
                .collect()
        }
    }

    fn response_frame(opcode: u16, sequence: u16, body: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; COMMAND_HEADER_LEN + body.len()];
        CommandHeader::new()
            .with_opcode(opcode | RESPONSE_FLAG)
            .with_size(frame.len() as u16)
            .with_sequence(sequence)
            .with_result(0)
            .write_to(&mut frame);
        frame[COMMAND_HEADER_LEN..].copy_from_slice(body);
        frame
    }

    fn hw_spec_body(tx_buffers: u16) -> Vec<u8> {
        let mut body = vec![0u8; HwSpecInfo::BODY_LEN];
        body[..6].copy_from_slice(&MAC);
        body[8..12].copy_from_slice(&0x0100_0001u32.to_le_bytes());
        body[12..14].copy_from_slice(&tx_buffers.to_le_bytes());
        body
    }

    fn association_event(connected: bool) -> Vec<u8> {
        let mut event = vec![0u8; 9];
        event[..2].copy_from_slice(&0x0001u16.to_le_bytes());
        event[2] = connected as u8;
        event[3..9].copy_from_slice(&[9, 9, 9, 9, 9, 9]);
        event
    }

    impl Transport for MockTransport {
        async fn fw_ready(&mut self) -> WifiResult<bool> {
            let mut inner = self.0.borrow_mut();
            if inner.programmed {
                inner.polls_after_program += 1;
                Ok(matches!(inner.ready_after_polls, Some(n) if inner.polls_after_program >= n))
            } else {
                Ok(inner.fw_running)
            }
        }

        async fn program_firmware(&mut self, image: &[u8]) -> WifiResult<()> {
            assert_eq!(image, FIRMWARE);
            self.0.borrow_mut().programmed = true;
            Ok(())
        }

        async fn enable_interrupts(&mut self) {
            self.0.borrow_mut().interrupts_enabled = true;
        }

        async fn send_command(&mut self, cmd: &[u8]) -> WifiResult<()> {
            let header = CommandHeader::parse(cmd).unwrap();
            let mut inner = self.0.borrow_mut();
            if inner.fail_commands {
                return Err(WifiError::Transport);
            }
            inner.commands.push(cmd.to_vec());
            inner.wire_log.push(WireRecord::Command(header.opcode()));
            if inner.auto_respond {
                let body = if header.opcode() == CommandOpcode::HwSpec.into_bits() {
                    hw_spec_body(inner.tx_buffers)
                } else {
                    Vec::new()
                };
                let event = inner.attach_event.take();
                inner.arrivals.push_back(Arrival {
                    response: Some(response_frame(header.opcode(), header.sequence(), &body)),
                    event,
                    credit: None,
                });
            }
            Ok(())
        }

        async fn send_frame(&mut self, frame: &[u8]) -> WifiResult<()> {
            let mut inner = self.0.borrow_mut();
            inner.frames.push(frame.to_vec());
            inner.wire_log.push(WireRecord::Frame);
            Ok(())
        }

        async fn read_pending(
            &mut self,
            _status: InterruptStatus,
            response: &mut [u8],
            event: &mut [u8],
        ) -> WifiResult<PendingWork> {
            let mut inner = self.0.borrow_mut();
            let Some(arrival) = inner.arrivals.pop_front() else {
                return Ok(PendingWork::default());
            };
            let mut work = PendingWork::default();
            if let Some(bytes) = arrival.response {
                response[..bytes.len()].copy_from_slice(&bytes);
                let header = CommandHeader::parse(&bytes).unwrap();
                inner
                    .wire_log
                    .push(WireRecord::Response(header.opcode() & !RESPONSE_FLAG));
                work.response_len = Some(bytes.len());
            }
            if let Some(bytes) = arrival.event {
                event[..bytes.len()].copy_from_slice(&bytes);
                work.event_len = Some(bytes.len());
            }
            work.tx_credit = arrival.credit;
            Ok(work)
        }
    }

    #[test]
    fn bringup_reaches_ready_in_order() {
        let mut state = State::new();
        let mock = MockTransport::healthy();
        let (control, mut runner) = new(&mut state, mock.clone(), (), test_config());

        block_on(runner.init(FIRMWARE)).unwrap();

        assert_eq!(control.device_state(), DeviceState::Ready);
        assert_eq!(control.mac_address(), Some(MAC));
        assert_eq!(control.firmware_version(), Some(0x0100_0001));
        assert_eq!(
            mock.sent_opcodes(),
            vec![
                CommandOpcode::FuncInit.into_bits(),
                CommandOpcode::HwSpec.into_bits(),
                CommandOpcode::RadioControl.into_bits(),
            ]
        );
        let inner = mock.inner();
        assert!(inner.interrupts_enabled);
        assert_eq!(inner.polls_after_program, 2);
    }

    #[test]
    fn bringup_skips_download_when_firmware_already_runs() {
        let mut state = State::new();
        let mock = MockTransport::healthy();
        mock.inner().fw_running = true;
        let (control, mut runner) = new(&mut state, mock.clone(), (), test_config());

        block_on(runner.init(FIRMWARE)).unwrap();

        assert_eq!(control.device_state(), DeviceState::Ready);
        let inner = mock.inner();
        assert!(!inner.programmed);
        assert_eq!(inner.polls_after_program, 0);
    }

    #[test]
    fn bringup_gives_up_after_exactly_the_poll_ceiling() {
        let mut state = State::new();
        let mock = MockTransport::healthy();
        mock.inner().ready_after_polls = None;
        let (control, mut runner) = new(&mut state, mock.clone(), (), test_config());

        let err = block_on(runner.init(FIRMWARE)).unwrap_err();

        assert_eq!(err, WifiError::Bringup(BringupStep::ReadyPoll));
        assert_eq!(control.device_state(), DeviceState::Error);
        let inner = mock.inner();
        assert_eq!(inner.polls_after_program, 5);
        assert!(inner.commands.is_empty());
    }

    #[test]
    fn bringup_aborts_on_first_unanswered_init_command() {
        let mut state = State::new();
        let mock = MockTransport::healthy();
        mock.inner().auto_respond = false;
        let (control, mut runner) = new(&mut state, mock.clone(), (), test_config());

        let err = block_on(runner.init(FIRMWARE)).unwrap_err();

        assert_eq!(err, WifiError::Bringup(BringupStep::FuncInit));
        assert_eq!(control.device_state(), DeviceState::Error);
        // Nothing after the failed first step went out.
        assert_eq!(
            mock.sent_opcodes(),
            vec![CommandOpcode::FuncInit.into_bits()]
        );
    }

    #[test]
    fn submit_sync_requires_ready_state() {
        let mut state = State::new();
        let mock = MockTransport::healthy();
        let (control, _runner) = new(&mut state, mock, (), test_config());

        let err = block_on(control.submit_sync(
            CommandOpcode::MacControl,
            CommandBody::MacControl {
                filter: FilterFlags::new(),
            },
        ))
        .unwrap_err();
        assert_eq!(err, WifiError::NotReady);
    }

    #[test]
    fn commands_round_trip_in_steady_state() {
        let mut state = State::new();
        let mock = MockTransport::healthy();
        let (control, mut runner) = new(&mut state, mock.clone(), (), test_config());
        block_on(runner.init(FIRMWARE)).unwrap();

        let client = async {
            let resp = control
                .submit_sync(CommandOpcode::RfChannel, CommandBody::RfChannel { channel: 6 })
                .await
                .unwrap();
            assert!(resp.answers(CommandOpcode::RfChannel));
            assert!(resp.is_success());
        };
        match block_on(select(runner.run(), client)) {
            Either::Second(()) => {}
            Either::First(_) => unreachable!(),
        }
        assert_eq!(control.shared.pool.free_slots(), COMMAND_BUFFERS);
    }

    #[test]
    fn configuration_and_beacon_updates_issue_their_commands() {
        let mut state = State::new();
        let mock = MockTransport::healthy();
        let (control, mut runner) = new(&mut state, mock.clone(), (), test_config());
        block_on(runner.init(FIRMWARE)).unwrap();

        let client = async {
            control
                .configuration_changed(ConfigDelta { channel: Some(11) })
                .await
                .unwrap();
            control.beacon_template_changed(&[0xdd; 64]).await.unwrap();
            control.set_beacon_enabled(100, true).await.unwrap();

            // A template that cannot fit a command buffer is refused up
            // front, before anything is queued.
            let err = control
                .beacon_template_changed(&[0; MAX_COMMAND_SIZE])
                .await
                .unwrap_err();
            assert_eq!(err, WifiError::Exhausted);
        };
        match block_on(select(runner.run(), client)) {
            Either::Second(()) => {}
            Either::First(_) => unreachable!(),
        }

        let opcodes = mock.sent_opcodes();
        assert_eq!(
            &opcodes[3..],
            &[
                CommandOpcode::RfChannel.into_bits(),
                CommandOpcode::BeaconSet.into_bits(),
                CommandOpcode::BeaconControl.into_bits(),
            ]
        );
        assert_eq!(control.shared.pool.free_slots(), COMMAND_BUFFERS);
    }

    #[test]
    fn concurrent_submitters_never_overlap_commands() {
        let mut state = State::new();
        let mock = MockTransport::healthy();
        let (control, mut runner) = new(&mut state, mock.clone(), (), test_config());
        block_on(runner.init(FIRMWARE)).unwrap();

        // An unrelated event rides along with the first response.
        mock.inner().attach_event = Some(association_event(false));
        let client = async {
            let first = control
                .submit_sync(CommandOpcode::RfChannel, CommandBody::RfChannel { channel: 1 });
            let second = control.submit_sync(
                CommandOpcode::MacControl,
                CommandBody::MacControl {
                    filter: FilterFlags::new().with_enable_rx(true),
                },
            );
            let (first, second) = join(first, second).await;
            assert!(first.unwrap().answers(CommandOpcode::RfChannel));
            assert!(second.unwrap().answers(CommandOpcode::MacControl));
        };
        match block_on(select(runner.run(), client)) {
            Either::Second(()) => {}
            Either::First(_) => unreachable!(),
        }

        // At no point were two commands outstanding on the wire.
        let inner = mock.inner();
        let mut outstanding = 0;
        for record in &inner.wire_log {
            match record {
                WireRecord::Command(_) => {
                    outstanding += 1;
                    assert_eq!(outstanding, 1, "second command sent before response");
                }
                WireRecord::Response(_) => outstanding -= 1,
                WireRecord::Frame => {}
            }
        }
    }

    /// Records for each event whether the pending response had already been
    /// delivered when the handler ran.
    struct OrderProbe {
        shared: Rc<Cell<Option<&'static Shared>>>,
        log: Rc<RefCell<Vec<(&'static str, bool)>>>,
    }

    impl EventHandler for OrderProbe {
        fn association_change(&mut self, _connected: bool, _peer: [u8; 6]) {
            let response_first = self
                .shared
                .get()
                .map_or(false, |shared| shared.response.is_ready());
            self.log.borrow_mut().push(("assoc", response_first));
        }
    }

    #[test]
    fn response_is_delivered_before_event_in_same_pass() {
        let state: &'static mut State = Box::leak(Box::new(State::new()));
        let mock = MockTransport::healthy();
        let shared_probe = Rc::new(Cell::new(None));
        let log = Rc::new(RefCell::new(Vec::new()));
        let probe = OrderProbe {
            shared: shared_probe.clone(),
            log: log.clone(),
        };
        let (control, mut runner) = new(state, mock.clone(), probe, test_config());
        shared_probe.set(Some(control.shared));
        block_on(runner.init(FIRMWARE)).unwrap();

        // The next command's response arrives together with an event.
        mock.inner().attach_event = Some(association_event(true));
        let client = async {
            control
                .submit_sync(CommandOpcode::RfChannel, CommandBody::RfChannel { channel: 3 })
                .await
                .unwrap();
        };
        match block_on(select(runner.run(), client)) {
            Either::Second(()) => {}
            Either::First(_) => unreachable!(),
        }

        assert_eq!(log.borrow().as_slice(), &[("assoc", true)]);
    }

    #[test]
    fn timeout_then_stale_response_is_dropped() {
        let mut state = State::new();
        let mock = MockTransport::healthy();
        let (control, mut runner) = new(&mut state, mock.clone(), (), test_config());
        block_on(runner.init(FIRMWARE)).unwrap();
        mock.inner().auto_respond = false;

        let client = async {
            let err = control
                .submit_sync(CommandOpcode::RfChannel, CommandBody::RfChannel { channel: 11 })
                .await
                .unwrap_err();
            assert_eq!(err, WifiError::Timeout);

            // The answer shows up late and must be discarded quietly.
            let last = mock.inner().commands.last().unwrap().clone();
            let header = CommandHeader::parse(&last).unwrap();
            mock.push_arrival(Arrival {
                response: Some(response_frame(header.opcode(), header.sequence(), &[])),
                ..Arrival::default()
            });
            control.on_interrupt(InterruptStatus::new().with_cmd_response(true));

            // The engine keeps working afterwards.
            mock.inner().auto_respond = true;
            let resp = control
                .submit_sync(
                    CommandOpcode::MacControl,
                    CommandBody::MacControl {
                        filter: FilterFlags::new(),
                    },
                )
                .await
                .unwrap();
            assert!(resp.answers(CommandOpcode::MacControl));
        };
        match block_on(select(runner.run(), client)) {
            Either::Second(()) => {}
            Either::First(_) => unreachable!(),
        }
        // The abandoned buffer went back to the pool.
        assert_eq!(control.shared.pool.free_slots(), COMMAND_BUFFERS);
    }

    #[test]
    fn transport_send_failure_surfaces_immediately() {
        let mut state = State::new();
        let mock = MockTransport::healthy();
        let (control, mut runner) = new(&mut state, mock.clone(), (), test_config());
        block_on(runner.init(FIRMWARE)).unwrap();
        mock.inner().fail_commands = true;

        let client = async {
            let err = control
                .submit_sync(CommandOpcode::RfChannel, CommandBody::RfChannel { channel: 1 })
                .await
                .unwrap_err();
            assert_eq!(err, WifiError::Transport);
        };
        match block_on(select(runner.run(), client)) {
            Either::Second(()) => {}
            Either::First(_) => unreachable!(),
        }
        assert_eq!(control.shared.pool.free_slots(), COMMAND_BUFFERS);
    }

    #[test]
    fn admission_rejects_not_ready_and_full_queues() {
        let mut state = State::new();
        let mock = MockTransport::healthy();
        let (control, _runner) = new(&mut state, mock, (), test_config());

        assert_eq!(
            control.on_frame_to_transmit(AccessClass::BestEffort, &[1]),
            Err(Dropped::NotReady)
        );

        control.shared.set_device_state(DeviceState::Ready);
        for i in 0..TX_QUEUE_DEPTH {
            control
                .on_frame_to_transmit(AccessClass::BestEffort, &[i as u8])
                .unwrap();
        }
        assert_eq!(
            control.on_frame_to_transmit(AccessClass::BestEffort, &[0xff]),
            Err(Dropped::QueueFull)
        );
    }

    #[test]
    fn transmission_respects_advertised_credit() {
        let mut state = State::new();
        let mock = MockTransport::healthy();
        let (control, mut runner) = new(&mut state, mock.clone(), (), test_config());
        block_on(runner.init(FIRMWARE)).unwrap();

        control.shared.tx.set_credit(2);
        for i in 0..3u8 {
            control
                .on_frame_to_transmit(AccessClass::BestEffort, &[i])
                .unwrap();
        }
        block_on(runner.main_process());
        assert_eq!(mock.inner().frames.len(), 2);
        assert_eq!(control.shared.tx.queued(), 1);

        // Returned device buffers show up as a credit update.
        mock.push_arrival(Arrival {
            credit: Some(2),
            ..Arrival::default()
        });
        control.on_interrupt(InterruptStatus::new().with_tx_credit(true));
        block_on(runner.main_process());
        let inner = mock.inner();
        assert_eq!(inner.frames.len(), 3);
        assert_eq!(inner.frames[2], vec![2]);
    }

    #[test]
    fn filter_update_pushes_list_then_mac_control() {
        let mut state = State::new();
        let mock = MockTransport::healthy();
        let (control, mut runner) = new(&mut state, mock.clone(), (), test_config());
        block_on(runner.init(FIRMWARE)).unwrap();

        let client = async {
            let list = control.prepare_multicast(&[[1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12]]);
            control
                .configure_filter(FilterConfig::default(), Some(list))
                .await
                .unwrap();
        };
        match block_on(select(runner.run(), client)) {
            Either::Second(()) => {}
            Either::First(_) => unreachable!(),
        }

        let opcodes = mock.sent_opcodes();
        assert_eq!(
            &opcodes[3..],
            &[
                CommandOpcode::MulticastAddr.into_bits(),
                CommandOpcode::MacControl.into_bits(),
            ]
        );
    }

    #[test]
    fn oversized_multicast_list_falls_back_to_allmulti() {
        let mut state = State::new();
        let mock = MockTransport::healthy();
        let (control, mut runner) = new(&mut state, mock.clone(), (), test_config());
        block_on(runner.init(FIRMWARE)).unwrap();

        let client = async {
            let addrs = [[0xaa; 6]; wire::MAX_MULTICAST_ADDRS + 1];
            let list = control.prepare_multicast(&addrs);
            control
                .configure_filter(FilterConfig::default(), Some(list))
                .await
                .unwrap();
        };
        match block_on(select(runner.run(), client)) {
            Either::Second(()) => {}
            Either::First(_) => unreachable!(),
        }

        // No list command went out, and the filter word carries allmulti.
        let opcodes = mock.sent_opcodes();
        assert_eq!(&opcodes[3..], &[CommandOpcode::MacControl.into_bits()]);
        let inner = mock.inner();
        let mac_control = inner.commands.last().unwrap();
        let filter_word = u16::from_le_bytes([
            mac_control[COMMAND_HEADER_LEN + 2],
            mac_control[COMMAND_HEADER_LEN + 3],
        ]);
        assert!(FilterFlags::from_bits(filter_word).all_multicast());
    }

    #[test]
    fn stop_drains_queues_and_rejects_traffic() {
        let mut state = State::new();
        let mock = MockTransport::healthy();
        let (control, mut runner) = new(&mut state, mock, (), test_config());
        block_on(runner.init(FIRMWARE)).unwrap();

        control
            .on_frame_to_transmit(AccessClass::Voice, &[1])
            .unwrap();
        control
            .on_frame_to_transmit(AccessClass::Background, &[2])
            .unwrap();
        control.stop();

        assert_eq!(control.device_state(), DeviceState::Uninitialized);
        assert_eq!(control.shared.tx.queued(), 0);
        assert_eq!(
            control.on_frame_to_transmit(AccessClass::Voice, &[3]),
            Err(Dropped::NotReady)
        );
    }
}

use bitfield_struct::bitfield;
use macro_bits::{bit, check_bit, serializable_enum};

use crate::adapter::{WifiError, WifiResult};

/// Size of a command or response buffer, including the header.
pub const MAX_COMMAND_SIZE: usize = 256;
/// Size of the largest asynchronous event record.
pub const MAX_EVENT_SIZE: usize = 128;
/// Every command and response starts with this many bytes of header.
pub const COMMAND_HEADER_LEN: usize = 8;
/// Set in the opcode field of the header, to mark a buffer as a response.
pub const RESPONSE_FLAG: u16 = 0x8000;
/// Result code the firmware uses for a successfully executed command.
pub const RESULT_SUCCESS: u16 = 0;

/// The most multicast addresses a single list command can carry.
pub const MAX_MULTICAST_ADDRS: usize = 32;

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
    /// Host command opcodes understood by the firmware.
    pub enum CommandOpcode: u16 {
        #[default]
        FuncInit => 0x00a9,
        HwSpec => 0x0003,
        MulticastAddr => 0x0010,
        RadioControl => 0x001c,
        RfChannel => 0x001d,
        MacControl => 0x0028,
        BeaconSet => 0x00cb,
        BeaconControl => 0x00cc
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
    /// Whether a command reads or writes the addressed firmware state.
    pub enum CommandAction: u16 {
        #[default]
        Get => 0x0000,
        Set => 0x0001
    }
}

/// The wire header shared by commands and responses.
///
/// All fields are little endian on the bus, which is exactly the byte order
/// of the underlying `u64`, so [CommandHeader::write_to] and
/// [CommandHeader::parse] are plain `to_le_bytes`/`from_le_bytes`.
/// `size` counts header plus body. Responses echo `sequence` and carry the
/// command's opcode with [RESPONSE_FLAG] set.
#[bitfield(u64)]
pub struct CommandHeader {
    #[bits(16)]
    pub opcode: u16,
    #[bits(16)]
    pub size: u16,
    #[bits(16)]
    pub sequence: u16,
    #[bits(16)]
    pub result: u16,
}

impl CommandHeader {
    pub fn write_to(self, out: &mut [u8]) {
        out[..COMMAND_HEADER_LEN].copy_from_slice(&self.into_bits().to_le_bytes());
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let raw = bytes.get(..COMMAND_HEADER_LEN)?;
        Some(Self::from_bits(u64::from_le_bytes(raw.try_into().ok()?)))
    }
}

/// Frame filter configuration word for the MAC-control command.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct FilterFlags {
    pub enable_rx: bool,
    pub enable_tx: bool,
    pub enable_80211: bool,
    pub enable_mgmt: bool,
    pub promiscuous: bool,
    pub all_multicast: bool,
    #[bits(10)]
    pub __: u16,
}

/// A multicast address list, prepared once and then threaded into
/// [configure_filter](crate::Control::configure_filter) as an owned value.
///
/// `requested` keeps the caller's full count even when the list was
/// truncated, so the filter path can fall back to all-multicast.
#[derive(Clone, Copy, Debug)]
pub struct MulticastList {
    addrs: [[u8; 6]; MAX_MULTICAST_ADDRS],
    len: usize,
    requested: u16,
}

impl MulticastList {
    pub fn new(addrs: &[[u8; 6]]) -> Self {
        let mut list = Self {
            addrs: [[0; 6]; MAX_MULTICAST_ADDRS],
            len: addrs.len().min(MAX_MULTICAST_ADDRS),
            requested: addrs.len() as u16,
        };
        list.addrs[..list.len].copy_from_slice(&addrs[..list.len]);
        list
    }

    pub fn addrs(&self) -> &[[u8; 6]] {
        &self.addrs[..self.len]
    }

    /// The number of addresses the caller asked for, before truncation.
    pub fn requested(&self) -> u16 {
        self.requested
    }

    /// Whether the list had to be truncated to [MAX_MULTICAST_ADDRS].
    pub fn truncated(&self) -> bool {
        self.requested as usize > self.len
    }
}

/// Opcode specific command bodies.
#[derive(Clone, Copy, Debug)]
pub enum CommandBody<'a> {
    FuncInit,
    HwSpec,
    RadioControl { on: bool },
    RfChannel { channel: u16 },
    MacControl { filter: FilterFlags },
    MulticastList(&'a MulticastList),
    BeaconSet(&'a [u8]),
    BeaconControl { interval: u16, enabled: bool },
}

impl CommandBody<'_> {
    /// Serialize the body into `out`, returning the number of bytes written.
    fn encode(&self, out: &mut [u8]) -> WifiResult<usize> {
        let mut cursor = Cursor::new(out);
        match *self {
            CommandBody::FuncInit | CommandBody::HwSpec => {}
            CommandBody::RadioControl { on } => {
                cursor.put_u16(CommandAction::Set.into_bits())?;
                cursor.put_u16(on as u16)?;
            }
            CommandBody::RfChannel { channel } => {
                cursor.put_u16(CommandAction::Set.into_bits())?;
                cursor.put_u16(channel)?;
            }
            CommandBody::MacControl { filter } => {
                cursor.put_u16(CommandAction::Set.into_bits())?;
                cursor.put_u16(filter.into_bits())?;
            }
            CommandBody::MulticastList(list) => {
                cursor.put_u16(CommandAction::Set.into_bits())?;
                cursor.put_u16(list.requested())?;
                for addr in list.addrs() {
                    cursor.put(addr)?;
                }
            }
            CommandBody::BeaconSet(template) => cursor.put(template)?,
            CommandBody::BeaconControl { interval, enabled } => {
                cursor.put_u16(CommandAction::Set.into_bits())?;
                cursor.put_u16(enabled as u16)?;
                cursor.put_u16(interval)?;
            }
        }
        Ok(cursor.written())
    }
}

/// Encode a full command frame (header followed by body) into `out`.
///
/// Returns the total frame length. Fails with
/// [Exhausted](crate::WifiError::Exhausted), if the body does not fit the
/// buffer, which callers treat the same as buffer starvation.
pub fn encode_command(
    out: &mut [u8],
    opcode: CommandOpcode,
    sequence: u16,
    body: &CommandBody<'_>,
) -> WifiResult<usize> {
    if out.len() < COMMAND_HEADER_LEN {
        return Err(WifiError::Exhausted);
    }
    let body_len = body.encode(&mut out[COMMAND_HEADER_LEN..])?;
    let total = COMMAND_HEADER_LEN + body_len;
    CommandHeader::new()
        .with_opcode(opcode.into_bits())
        .with_size(total as u16)
        .with_sequence(sequence)
        .with_result(0)
        .write_to(out);
    Ok(total)
}

/// A decoded response frame, copied out of the transport's buffer.
#[derive(Clone, Debug)]
pub struct Response {
    opcode: u16,
    sequence: u16,
    result: u16,
    body: [u8; MAX_COMMAND_SIZE - COMMAND_HEADER_LEN],
    len: usize,
}

impl Response {
    /// Decode a response frame. Returns [None] on malformed input: short
    /// frames, a size field disagreeing with the received length, or a
    /// missing response flag.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let header = CommandHeader::parse(bytes)?;
        let size = header.size() as usize;
        if size < COMMAND_HEADER_LEN || size > bytes.len() || size > MAX_COMMAND_SIZE {
            return None;
        }
        if !check_bit!(header.opcode(), RESPONSE_FLAG) {
            return None;
        }
        let mut body = [0; MAX_COMMAND_SIZE - COMMAND_HEADER_LEN];
        let len = size - COMMAND_HEADER_LEN;
        body[..len].copy_from_slice(&bytes[COMMAND_HEADER_LEN..size]);
        Some(Self {
            opcode: header.opcode(),
            sequence: header.sequence(),
            result: header.result(),
            body,
            len,
        })
    }

    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn result(&self) -> u16 {
        self.result
    }

    pub fn is_success(&self) -> bool {
        self.result == RESULT_SUCCESS
    }

    /// Check whether this response answers a command with the given opcode.
    pub fn answers(&self, opcode: CommandOpcode) -> bool {
        self.opcode == opcode.into_bits() | RESPONSE_FLAG
    }

    pub fn body(&self) -> &[u8] {
        &self.body[..self.len]
    }
}

/// Identity and capabilities reported by the hardware-spec query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwSpecInfo {
    pub mac_address: [u8; 6],
    pub fw_version: u32,
    /// Outbound buffers the device makes available; the initial tx credit.
    pub tx_buffers: u16,
}

impl HwSpecInfo {
    pub const BODY_LEN: usize = 14;

    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < Self::BODY_LEN {
            return None;
        }
        Some(Self {
            mac_address: body[..6].try_into().ok()?,
            fw_version: u32::from_le_bytes(body[8..12].try_into().ok()?),
            tx_buffers: u16::from_le_bytes(body[12..14].try_into().ok()?),
        })
    }
}

const EVENT_ASSOCIATION: u16 = 0x0001;
const EVENT_KEY_MATERIAL: u16 = 0x0002;
const EVENT_SCAN_COMPLETE: u16 = 0x0003;
const EVENT_LINK_LOST: u16 = 0x0004;

/// An asynchronous notification decoded from the event channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    AssociationChange { connected: bool, peer: [u8; 6] },
    KeyEvent { key_index: u8, pairwise: bool },
    ScanComplete,
    LinkLost,
}

impl DeviceEvent {
    /// Decode an event record: a little endian event id, followed by an
    /// id specific body. Unknown ids yield [None] and are dropped by the
    /// dispatch loop.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let id = u16::from_le_bytes(bytes.get(..2)?.try_into().ok()?);
        let body = &bytes[2..];
        match id {
            EVENT_ASSOCIATION => Some(Self::AssociationChange {
                connected: *body.first()? != 0,
                peer: body.get(1..7)?.try_into().ok()?,
            }),
            EVENT_KEY_MATERIAL => Some(Self::KeyEvent {
                key_index: *body.first()?,
                pairwise: check_bit!(*body.get(1)?, bit!(0)),
            }),
            EVENT_SCAN_COMPLETE => Some(Self::ScanComplete),
            EVENT_LINK_LOST => Some(Self::LinkLost),
            _ => None,
        }
    }
}

/// Bounds-checked little endian writer for command bodies.
struct Cursor<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(out: &'a mut [u8]) -> Self {
        Self { out, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> WifiResult<()> {
        let end = self.pos + bytes.len();
        if end > self.out.len() {
            return Err(WifiError::Exhausted);
        }
        self.out[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn put_u16(&mut self, value: u16) -> WifiResult<()> {
        self.put(&value.to_le_bytes())
    }

    fn written(&self) -> usize {
        self.pos
    }
}

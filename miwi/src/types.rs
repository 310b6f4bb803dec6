//! Core types and wire constants for the P2P protocol.

use core::fmt;

/// Longest supported long address.
pub const MAX_ADDRESS_LEN: usize = 8;
/// Shortest supported long address.
pub const MIN_ADDRESS_LEN: usize = 2;
/// PAN id of a device that has not joined a PAN yet; also matches any PAN.
pub const BROADCAST_PAN: u16 = 0xFFFF;
/// Short address programmed into the radio; P2P only uses long addresses.
pub const UNUSED_SHORT_ADDRESS: u16 = 0xFFFF;
/// Channels addressable by a 32-bit channel map.
pub const MAX_CHANNELS: u8 = 32;

// Protocol command bytes (first payload byte of a command frame)
pub const CMD_CONNECTION_REQUEST: u8 = 0x81;
pub const CMD_REMOVAL_REQUEST: u8 = 0x82;
pub const CMD_DATA_REQUEST: u8 = 0x83;
pub const CMD_CHANNEL_HOPPING: u8 = 0x84;
pub const CMD_TIME_SYNC_REQUEST: u8 = 0x85;
pub const CMD_TIME_SYNC_NOTIFICATION: u8 = 0x86;
pub const CMD_ACTIVE_SCAN_REQUEST: u8 = 0x87;
pub const CMD_TIME_SYNC_DATA: u8 = 0x8A;
pub const CMD_TIME_SYNC_COMMAND: u8 = 0x8B;
pub const CMD_CONNECTION_RESPONSE: u8 = 0x91;
pub const CMD_REMOVAL_RESPONSE: u8 = 0x92;
pub const CMD_ACTIVE_SCAN_RESPONSE: u8 = 0x97;
/// IEEE 802.15.4 MAC data request, accepted as a P2P data request.
pub const CMD_MAC_DATA_REQUEST: u8 = 0x04;

/// Status byte carried by connection and removal responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Success,
    AlreadyExists,
    /// Bare active-scan probe; nothing was recorded.
    ActiveScanOnly,
    EntryNotFound,
    NoSpace,
    NotSamePan,
    NotPermitted,
}

impl ConnectionStatus {
    pub const fn to_byte(self) -> u8 {
        match self {
            ConnectionStatus::Success => 0x00,
            ConnectionStatus::AlreadyExists => 0x01,
            ConnectionStatus::ActiveScanOnly => 0x02,
            ConnectionStatus::EntryNotFound => 0xF0,
            ConnectionStatus::NoSpace => 0xF1,
            ConnectionStatus::NotSamePan => 0xF2,
            ConnectionStatus::NotPermitted => 0xF3,
        }
    }

    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(ConnectionStatus::Success),
            0x01 => Some(ConnectionStatus::AlreadyExists),
            0x02 => Some(ConnectionStatus::ActiveScanOnly),
            0xF0 => Some(ConnectionStatus::EntryNotFound),
            0xF1 => Some(ConnectionStatus::NoSpace),
            0xF2 => Some(ConnectionStatus::NotSamePan),
            0xF3 => Some(ConnectionStatus::NotPermitted),
            _ => None,
        }
    }

    /// Success or AlreadyExists: the peer holds a connection to us.
    pub const fn is_connected(self) -> bool {
        matches!(self, ConnectionStatus::Success | ConnectionStatus::AlreadyExists)
    }
}

/// Long (extended) radio address, 2 to 8 bytes.
///
/// Bytes past `len` are always zero so derived equality and hashing are exact.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LongAddress {
    bytes: [u8; MAX_ADDRESS_LEN],
    len: u8,
}

impl LongAddress {
    /// Build an address from a slice; `None` unless 2 to 8 bytes long.
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if !(MIN_ADDRESS_LEN..=MAX_ADDRESS_LEN).contains(&bytes.len()) {
            return None;
        }
        let mut buf = [0u8; MAX_ADDRESS_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            bytes: buf,
            len: bytes.len() as u8,
        })
    }

    /// Eight-byte address from a `u64`, least significant byte first (air order).
    pub const fn from_u64(v: u64) -> Self {
        Self {
            bytes: v.to_le_bytes(),
            len: MAX_ADDRESS_LEN as u8,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len as usize
    }
}

impl fmt::Debug for LongAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // most significant byte first, like the labels printed on modules
        for b in self.as_bytes().iter().rev() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl fmt::Display for LongAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Connection admission policy, carried in bits 4-5 of the capability byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ConnectionMode {
    /// Accept any connection request.
    #[default]
    EnableAll = 0,
    /// Accept only peers already in the connection table.
    EnablePrevious = 1,
    /// Refuse connections but still answer active scans.
    EnableActiveScanResponse = 2,
    /// Stay silent.
    DisableAll = 3,
}

impl ConnectionMode {
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ConnectionMode::EnableAll),
            1 => Some(ConnectionMode::EnablePrevious),
            2 => Some(ConnectionMode::EnableActiveScanResponse),
            3 => Some(ConnectionMode::DisableAll),
            _ => None,
        }
    }
}

/// Peer capability byte exchanged in connection requests and scan responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capability(pub u8);

impl Capability {
    pub const RX_ON_WHEN_IDLE: u8 = 0x01;
    pub const DATA_REQUEST_NEEDED: u8 = 0x02;
    pub const TIME_SYNC: u8 = 0x04;
    pub const SECURITY: u8 = 0x08;
    pub const CONNECTION_MODE_SHIFT: u8 = 4;
    pub const CONNECTION_MODE_MASK: u8 = 0x30;
    /// Only meaningful in persisted table records.
    pub const VALID: u8 = 0x80;

    pub const fn rx_on_when_idle(self) -> bool {
        self.0 & Self::RX_ON_WHEN_IDLE != 0
    }

    pub const fn data_request_needed(self) -> bool {
        self.0 & Self::DATA_REQUEST_NEEDED != 0
    }

    pub const fn time_sync(self) -> bool {
        self.0 & Self::TIME_SYNC != 0
    }

    pub const fn security(self) -> bool {
        self.0 & Self::SECURITY != 0
    }

    pub const fn connection_mode(self) -> ConnectionMode {
        match (self.0 & Self::CONNECTION_MODE_MASK) >> Self::CONNECTION_MODE_SHIFT {
            0 => ConnectionMode::EnableAll,
            1 => ConnectionMode::EnablePrevious,
            2 => ConnectionMode::EnableActiveScanResponse,
            _ => ConnectionMode::DisableAll,
        }
    }

    pub const fn with_connection_mode(self, mode: ConnectionMode) -> Self {
        Capability(
            (self.0 & !Self::CONNECTION_MODE_MASK)
                | ((mode as u8) << Self::CONNECTION_MODE_SHIFT),
        )
    }
}

/// Engine-wide status flags. Reset at init, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtocolStatus(u8);

impl ProtocolStatus {
    pub const SLEEPING: u8 = 0x01;
    pub const SEARCH_CONNECTION: u8 = 0x02;
    pub const RESYNC: u8 = 0x04;
    pub const DATA_REQUESTING: u8 = 0x08;
    pub const SAVE_PENDING: u8 = 0x10;
    pub const RX_HAS_USER_DATA: u8 = 0x20;

    #[inline]
    pub const fn contains(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    #[inline]
    pub fn insert(&mut self, flag: u8) {
        self.0 |= flag;
    }

    #[inline]
    pub fn remove(&mut self, flag: u8) {
        self.0 &= !flag;
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

/// Packet type carried in bits 0-1 of the frame control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data = 0,
    Command = 1,
    Ack = 2,
    Reserved = 3,
}

/// Transport flags byte shared with the radio driver and mixed into the cipher nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameControl(pub u8);

impl FrameControl {
    pub const PACKET_TYPE_MASK: u8 = 0x03;
    pub const BROADCAST: u8 = 0x04;
    pub const SECURED: u8 = 0x08;
    pub const REPEAT: u8 = 0x10;
    pub const ACK_REQUEST: u8 = 0x20;
    pub const DEST_PRESENT: u8 = 0x40;
    pub const SOURCE_PRESENT: u8 = 0x80;

    pub const fn packet_type(self) -> PacketType {
        match self.0 & Self::PACKET_TYPE_MASK {
            0 => PacketType::Data,
            1 => PacketType::Command,
            2 => PacketType::Ack,
            _ => PacketType::Reserved,
        }
    }

    pub const fn is_command(self) -> bool {
        matches!(self.packet_type(), PacketType::Command)
    }

    pub const fn broadcast(self) -> bool {
        self.0 & Self::BROADCAST != 0
    }

    pub const fn secured(self) -> bool {
        self.0 & Self::SECURED != 0
    }

    pub const fn ack_request(self) -> bool {
        self.0 & Self::ACK_REQUEST != 0
    }

    pub const fn dest_present(self) -> bool {
        self.0 & Self::DEST_PRESENT != 0
    }

    pub const fn source_present(self) -> bool {
        self.0 & Self::SOURCE_PRESENT != 0
    }
}

/// Radio power state requested from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Sleep,
    Operate,
}

/// Application-level power transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    /// Flush pending state and put the radio to sleep.
    Sleep,
    /// Wake the radio.
    Wakeup,
    /// Wake the radio and poll the parent for queued messages.
    WakeupDataRequest,
}

/// Channel assessment primitive used by noise detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssessmentMode {
    /// Energy detection; higher level is noisier.
    Energy,
    /// Carrier sense.
    CarrierSense,
}

/// How `start_connection` picks its operating channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Start on the current channel.
    Direct,
    /// Move to the quietest channel first.
    EnergyScan,
    /// Carrier-sense channel pick (not supported).
    CarrierSense,
}

/// Persistence backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// Field was never written.
    Missing,
    /// Backend read/write failed.
    Io,
    /// Stored bytes have the wrong shape.
    Corrupt,
}

/// Error type for engine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Radio driver reported a transmit failure.
    SendFailed,
    /// Indirect queue has no free entry.
    QueueFull,
    /// Connection slot is out of range or not valid.
    InvalidSlot,
    /// Payload exceeds the configured buffer.
    PayloadTooLarge,
    /// Another long-running procedure is active.
    Busy,
    /// Channel outside the 0..32 map.
    InvalidChannel,
    /// Argument out of range.
    InvalidInput,
    /// Radio refused a configuration or power change.
    TransceiverFailed,
    /// Persistence backend failure.
    Persistence(StoreError),
    /// Requested mode is not implemented.
    NotSupported,
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Persistence(e)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Missing => write!(f, "field not stored"),
            StoreError::Io => write!(f, "storage i/o failure"),
            StoreError::Corrupt => write!(f, "stored data corrupt"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SendFailed => write!(f, "radio send failed"),
            Error::QueueFull => write!(f, "indirect queue full"),
            Error::InvalidSlot => write!(f, "invalid connection slot"),
            Error::PayloadTooLarge => write!(f, "payload too large"),
            Error::Busy => write!(f, "procedure already running"),
            Error::InvalidChannel => write!(f, "invalid channel"),
            Error::InvalidInput => write!(f, "invalid input"),
            Error::TransceiverFailed => write!(f, "transceiver failure"),
            Error::Persistence(e) => write!(f, "persistence error: {}", e),
            Error::NotSupported => write!(f, "not supported"),
        }
    }
}

//! Wire format of P2P command frames and the security header.
//!
//! Every protocol command is a single command frame whose first payload byte
//! names the command. Layouts are positional; multi-byte integers are little-endian.
//!
//! ## Commands
//!
//! ```text
//! connection request   0x81 || channel (1) || [capability (1) || extra (N)]
//! connection response  0x91 || status (1) || [capability (1) || extra (N)]
//! removal request      0x82
//! removal response     0x92 || status (1)
//! active scan request  0x87 || channel (1)
//! active scan response 0x97 || capability (1) || extra (N)
//! data request         0x83 | 0x04
//! channel hopping      0x84 || current channel (1) || target channel (1)
//! time sync header     0x8A | 0x8B || wake_secs (2) || wake_millis (2) || payload
//! ```
//!
//! A connection request without the capability byte is a bare active-scan probe.
//! Connection responses carry capability and extra bytes only for success or
//! already-exists. `extra` is the peer's opaque additional node ID.
//!
//! ## Secured payloads
//!
//! ```text
//! frame_counter (4, LE) || key_sequence (1) || sealed payload
//! ```

use alloc::vec::Vec;

use crate::time::Duration;
use crate::types::{
    Capability, ConnectionStatus, CMD_ACTIVE_SCAN_REQUEST, CMD_ACTIVE_SCAN_RESPONSE,
    CMD_CHANNEL_HOPPING, CMD_CONNECTION_REQUEST, CMD_CONNECTION_RESPONSE, CMD_DATA_REQUEST,
    CMD_MAC_DATA_REQUEST, CMD_REMOVAL_REQUEST, CMD_REMOVAL_RESPONSE, CMD_TIME_SYNC_COMMAND,
    CMD_TIME_SYNC_DATA,
};

/// Length of the security header in front of a sealed payload.
pub const SECURITY_HEADER_LEN: usize = 5;

/// Length of the time sync header in front of a data-request reply.
pub const TIME_SYNC_HEADER_LEN: usize = 5;

/// Decoding error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Unexpected end of buffer.
    UnexpectedEof,
    /// Command byte not in the P2P command set.
    UnknownCommand(u8),
    /// Field value out of range (e.g. unknown status byte).
    InvalidValue,
    /// Stored record has the wrong length.
    InvalidLength,
}

/// Zero-copy reader over a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Take everything not read yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}

/// Writer for encoding frames.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// Types that can be encoded to wire format.
pub trait Encode {
    fn encode(&self, w: &mut Writer);

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.finish()
    }
}

/// A decoded P2P command, borrowing variable-length parts from the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command<'a> {
    ConnectionRequest {
        channel: u8,
        /// Absent for a bare active-scan probe.
        capability: Option<Capability>,
        extra: &'a [u8],
    },
    ConnectionResponse {
        status: ConnectionStatus,
        capability: Option<Capability>,
        extra: &'a [u8],
    },
    RemovalRequest,
    RemovalResponse {
        status: ConnectionStatus,
    },
    ActiveScanRequest {
        channel: u8,
    },
    ActiveScanResponse {
        capability: Capability,
        extra: &'a [u8],
    },
    /// P2P (0x83) or MAC (0x04) data request.
    DataRequest,
    ChannelHopping {
        current: u8,
        target: u8,
    },
    /// Reply to a data request from a time-synchronized parent.
    TimeSync {
        /// Reply wraps a command rather than data.
        command: bool,
        wake_after: Duration,
        payload: &'a [u8],
    },
}

impl<'a> Command<'a> {
    /// Decode a command frame payload.
    pub fn decode(payload: &'a [u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let cmd = r.read_u8()?;
        match cmd {
            CMD_CONNECTION_REQUEST => {
                let channel = r.read_u8()?;
                let capability = if r.is_empty() {
                    None
                } else {
                    Some(Capability(r.read_u8()?))
                };
                Ok(Command::ConnectionRequest {
                    channel,
                    capability,
                    extra: r.rest(),
                })
            }
            CMD_CONNECTION_RESPONSE => {
                let status =
                    ConnectionStatus::from_byte(r.read_u8()?).ok_or(DecodeError::InvalidValue)?;
                let capability = if status.is_connected() && !r.is_empty() {
                    Some(Capability(r.read_u8()?))
                } else {
                    None
                };
                Ok(Command::ConnectionResponse {
                    status,
                    capability,
                    extra: r.rest(),
                })
            }
            CMD_REMOVAL_REQUEST => Ok(Command::RemovalRequest),
            CMD_REMOVAL_RESPONSE => {
                let status =
                    ConnectionStatus::from_byte(r.read_u8()?).ok_or(DecodeError::InvalidValue)?;
                Ok(Command::RemovalResponse { status })
            }
            CMD_ACTIVE_SCAN_REQUEST => Ok(Command::ActiveScanRequest {
                channel: r.read_u8()?,
            }),
            CMD_ACTIVE_SCAN_RESPONSE => {
                let capability = Capability(r.read_u8()?);
                Ok(Command::ActiveScanResponse {
                    capability,
                    extra: r.rest(),
                })
            }
            CMD_DATA_REQUEST | CMD_MAC_DATA_REQUEST => Ok(Command::DataRequest),
            CMD_CHANNEL_HOPPING => {
                let current = r.read_u8()?;
                let target = r.read_u8()?;
                Ok(Command::ChannelHopping { current, target })
            }
            CMD_TIME_SYNC_DATA | CMD_TIME_SYNC_COMMAND => {
                let secs = r.read_u16_le()?;
                let millis = r.read_u16_le()?;
                let wake_after = Duration::from_secs(secs as u32)
                    .saturating_add(Duration::from_millis(millis as u32));
                Ok(Command::TimeSync {
                    command: cmd == CMD_TIME_SYNC_COMMAND,
                    wake_after,
                    payload: r.rest(),
                })
            }
            other => Err(DecodeError::UnknownCommand(other)),
        }
    }
}

impl Encode for Command<'_> {
    fn encode(&self, w: &mut Writer) {
        match *self {
            Command::ConnectionRequest {
                channel,
                capability,
                extra,
            } => {
                w.write_u8(CMD_CONNECTION_REQUEST);
                w.write_u8(channel);
                if let Some(cap) = capability {
                    w.write_u8(cap.0);
                    w.write_bytes(extra);
                }
            }
            Command::ConnectionResponse {
                status,
                capability,
                extra,
            } => {
                w.write_u8(CMD_CONNECTION_RESPONSE);
                w.write_u8(status.to_byte());
                if let (true, Some(cap)) = (status.is_connected(), capability) {
                    w.write_u8(cap.0);
                    w.write_bytes(extra);
                }
            }
            Command::RemovalRequest => w.write_u8(CMD_REMOVAL_REQUEST),
            Command::RemovalResponse { status } => {
                w.write_u8(CMD_REMOVAL_RESPONSE);
                w.write_u8(status.to_byte());
            }
            Command::ActiveScanRequest { channel } => {
                w.write_u8(CMD_ACTIVE_SCAN_REQUEST);
                w.write_u8(channel);
            }
            Command::ActiveScanResponse { capability, extra } => {
                w.write_u8(CMD_ACTIVE_SCAN_RESPONSE);
                w.write_u8(capability.0);
                w.write_bytes(extra);
            }
            // sleeping devices poll with the MAC variant
            Command::DataRequest => w.write_u8(CMD_MAC_DATA_REQUEST),
            Command::ChannelHopping { current, target } => {
                w.write_u8(CMD_CHANNEL_HOPPING);
                w.write_u8(current);
                w.write_u8(target);
            }
            Command::TimeSync {
                command,
                wake_after,
                payload,
            } => {
                w.write_u8(if command {
                    CMD_TIME_SYNC_COMMAND
                } else {
                    CMD_TIME_SYNC_DATA
                });
                let secs = wake_after.as_secs().min(u16::MAX as u32);
                let millis = (wake_after.as_millis() - secs * 1000).min(999);
                w.write_u16_le(secs as u16);
                w.write_u16_le(millis as u16);
                w.write_bytes(payload);
            }
        }
    }
}

/// Header in front of every sealed payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecurityHeader {
    pub frame_counter: u32,
    pub key_sequence: u8,
}

impl SecurityHeader {
    /// Split a secured payload into header and sealed bytes.
    pub fn split(payload: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let mut r = Reader::new(payload);
        let frame_counter = r.read_u32_le()?;
        let key_sequence = r.read_u8()?;
        Ok((
            Self {
                frame_counter,
                key_sequence,
            },
            r.rest(),
        ))
    }
}

impl Encode for SecurityHeader {
    fn encode(&self, w: &mut Writer) {
        w.write_u32_le(self.frame_counter);
        w.write_u8(self.key_sequence);
    }
}

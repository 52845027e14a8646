//! The 20-byte frame exchanged with the robot.
//!
//! ```text
//! +--------+---------+----------+----------------------+-----+
//! | device | command | sequence | payload (16 bytes)   | crc |
//! +--------+---------+----------+----------------------+-----+
//!     0         1          2          3..19              19
//! ```
//!
//! The checksum is CRC-8 with polynomial 0x07, computed MSB first over the
//! first 19 bytes with an initial value of zero and no final XOR.

use crate::error::{Result, RobotError};
use bytes::Buf;
use crc::{CRC_8_SMBUS, Crc};
use std::fmt;

pub const PACKET_LEN: usize = 20;
pub const PAYLOAD_LEN: usize = 16;
pub const BODY_LEN: usize = PACKET_LEN - 1;

// CRC-8/SMBUS is exactly poly 0x07, init 0x00, no reflection, no xorout.
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Compute the frame checksum over `data`.
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Identifies one outstanding request awaiting exactly one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub device: u8,
    pub command: u8,
    pub sequence: u8,
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, #{})", self.device, self.command, self.sequence)
    }
}

/// Identifies a class of notifications from the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub device: u8,
    pub command: u8,
}

impl EventKey {
    pub const fn new(device: u8, command: u8) -> Self {
        Self { device, command }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.device, self.command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub device: u8,
    pub command: u8,
    pub sequence: u8,
    pub payload: [u8; PAYLOAD_LEN],
    /// Checksum as received from the wire. Locally built packets have none.
    stored_crc: Option<u8>,
}

impl Packet {
    /// Build an outgoing packet, zero padding the payload to 16 bytes.
    pub fn new(device: u8, command: u8, sequence: u8, payload: &[u8]) -> Result<Self> {
        if payload.len() > PAYLOAD_LEN {
            return Err(RobotError::PayloadTooLong(payload.len()));
        }
        let mut padded = [0u8; PAYLOAD_LEN];
        padded[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            device,
            command,
            sequence,
            payload: padded,
            stored_crc: None,
        })
    }

    /// Parse a frame received from the robot.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != PACKET_LEN {
            return Err(RobotError::Framing(raw.len()));
        }
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&raw[3..BODY_LEN]);
        Ok(Self {
            device: raw[0],
            command: raw[1],
            sequence: raw[2],
            payload,
            stored_crc: Some(raw[BODY_LEN]),
        })
    }

    /// Header and payload without the checksum.
    pub fn body(&self) -> [u8; BODY_LEN] {
        let mut body = [0u8; BODY_LEN];
        body[0] = self.device;
        body[1] = self.command;
        body[2] = self.sequence;
        body[3..].copy_from_slice(&self.payload);
        body
    }

    /// Serialize to the 20-byte wire format.
    pub fn to_bytes(&self) -> [u8; PACKET_LEN] {
        let body = self.body();
        let mut frame = [0u8; PACKET_LEN];
        frame[..BODY_LEN].copy_from_slice(&body);
        frame[BODY_LEN] = crc8(&body);
        frame
    }

    pub fn calc_crc(&self) -> u8 {
        crc8(&self.body())
    }

    /// The received checksum, or a freshly computed one for local packets.
    pub fn crc(&self) -> u8 {
        self.stored_crc.unwrap_or_else(|| self.calc_crc())
    }

    pub fn stored_crc(&self) -> Option<u8> {
        self.stored_crc
    }

    /// True only for received packets whose checksum matches their contents.
    pub fn check_crc(&self) -> bool {
        self.stored_crc == Some(self.calc_crc())
    }

    /// Consume the packet, failing if its stored checksum does not match.
    pub fn verify(self) -> Result<Self> {
        let computed = self.calc_crc();
        match self.stored_crc {
            Some(stored) if stored == computed => Ok(self),
            stored => Err(RobotError::Checksum {
                stored: stored.unwrap_or_default(),
                computed,
            }),
        }
    }

    pub fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey {
            device: self.device,
            command: self.command,
            sequence: self.sequence,
        }
    }

    pub fn event_key(&self) -> EventKey {
        EventKey::new(self.device, self.command)
    }

    /// Device timestamp in milliseconds carried by events and query replies.
    pub fn timestamp(&self) -> u32 {
        (&self.payload[..4]).get_u32()
    }
}

impl TryFrom<&[u8]> for Packet {
    type Error = RobotError;

    fn try_from(raw: &[u8]) -> Result<Self> {
        Packet::from_bytes(raw)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet(dev={}, cmd={}, inc={}, payload={}, crc={:#04x})",
            self.device,
            self.command,
            self.sequence,
            hex::encode(self.payload),
            self.crc()
        )
    }
}

//! Protocol 2.0 framing
//!
//! ```text
//! FF FF FD 00 | id | len_lo len_hi | instruction | params... | crc_lo crc_hi
//! ```
//!
//! `len` counts the instruction byte, the (stuffed) parameters and the CRC.
//! Inside the instruction/parameter region every `FF FF FD` is followed by
//! an extra `FD` so the header pattern never appears in a payload.
//! Multi-byte fields are little-endian.

use crate::error::BusError;
use bytes::{BufMut, BytesMut};
use tracing::debug;

pub const HEADER: [u8; 4] = [0xFF, 0xFF, 0xFD, 0x00];
pub const BROADCAST_ID: u8 = 0xFE;

/// Bytes before the instruction: header, id and length
const PREFIX_LEN: usize = 7;
const STUFF_PATTERN: [u8; 3] = [0xFF, 0xFF, 0xFD];
const STUFF_BYTE: u8 = 0xFD;

/// A control table field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub address: u16,
    pub width: u16,
}

impl Register {
    pub const fn new(address: u16, width: u16) -> Self {
        Self { address, width }
    }
}

/// Control table of the supported actuator family
pub mod table {
    use super::Register;

    pub const MODEL_NUMBER: Register = Register::new(0, 2);
    pub const FIRMWARE_VERSION: Register = Register::new(6, 1);
    pub const OPERATING_MODE: Register = Register::new(11, 1);
    pub const TORQUE_ENABLE: Register = Register::new(64, 1);
    pub const POSITION_D_GAIN: Register = Register::new(80, 2);
    pub const POSITION_I_GAIN: Register = Register::new(82, 2);
    pub const POSITION_P_GAIN: Register = Register::new(84, 2);
    pub const GOAL_CURRENT: Register = Register::new(102, 2);
    pub const GOAL_SPEED: Register = Register::new(112, 4);
    pub const GOAL_POSITION: Register = Register::new(116, 4);
    pub const PRESENT_POSITION: Register = Register::new(132, 4);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Ping,
    Read,
    Write,
    SyncRead,
    SyncWrite,
    Status,
}

impl Instruction {
    pub fn code(self) -> u8 {
        match self {
            Instruction::Ping => 0x01,
            Instruction::Read => 0x02,
            Instruction::Write => 0x03,
            Instruction::SyncRead => 0x82,
            Instruction::SyncWrite => 0x83,
            Instruction::Status => 0x55,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Instruction::Ping),
            0x02 => Some(Instruction::Read),
            0x03 => Some(Instruction::Write),
            0x82 => Some(Instruction::SyncRead),
            0x83 => Some(Instruction::SyncWrite),
            0x55 => Some(Instruction::Status),
            _ => None,
        }
    }
}

const fn build_crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8005
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u16; 256] = build_crc_table();

/// CRC-16 (polynomial 0x8005, initial value 0, no reflection)
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let index = ((crc >> 8) ^ byte as u16) & 0xFF;
        (crc << 8) ^ CRC_TABLE[index as usize]
    })
}

fn ends_with_pattern(buf: &[u8]) -> bool {
    buf.len() >= STUFF_PATTERN.len() && buf[buf.len() - STUFF_PATTERN.len()..] == STUFF_PATTERN
}

/// Insert a stuffing byte after every header pattern
pub fn stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 2);
    for &byte in body {
        out.push(byte);
        if ends_with_pattern(&out) {
            out.push(STUFF_BYTE);
        }
    }
    out
}

/// Remove stuffing bytes inserted by [`stuff`]
pub fn unstuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        out.push(body[i]);
        if ends_with_pattern(&out) && body.get(i + 1) == Some(&STUFF_BYTE) {
            i += 1;
        }
        i += 1;
    }
    out
}

/// One packet on the wire. For status packets the first payload byte is the
/// device error byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub id: u8,
    pub instruction: u8,
    pub payload: Vec<u8>,
}

impl RawPacket {
    pub fn new(id: u8, instruction: Instruction, payload: Vec<u8>) -> Self {
        Self {
            id,
            instruction: instruction.code(),
            payload,
        }
    }

    /// Status packet as a device would send it
    pub fn status(id: u8, error: u8, params: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(params.len() + 1);
        payload.push(error);
        payload.extend_from_slice(params);
        Self::new(id, Instruction::Status, payload)
    }

    pub fn kind(&self) -> Option<Instruction> {
        Instruction::from_code(self.instruction)
    }

    /// Error byte and parameters of a status packet
    pub fn as_status(&self) -> Result<(u8, &[u8]), BusError> {
        if self.instruction != Instruction::Status.code() {
            return Err(BusError::Malformed(format!(
                "expected status packet, got instruction 0x{:02X}",
                self.instruction
            )));
        }
        match self.payload.split_first() {
            Some((error, params)) => Ok((*error, params)),
            None => Err(BusError::Malformed("status packet without error byte".to_string())),
        }
    }

    /// Serialize with stuffing and CRC
    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        let mut body = Vec::with_capacity(self.payload.len() + 1);
        body.push(self.instruction);
        body.extend_from_slice(&self.payload);
        let body = stuff(&body);

        let length = u16::try_from(body.len() + 2).map_err(|_| {
            BusError::InvalidRequest(format!("packet body of {} bytes is too long", body.len()))
        })?;

        let mut out = BytesMut::with_capacity(PREFIX_LEN + body.len() + 2);
        out.put_slice(&HEADER);
        out.put_u8(self.id);
        out.put_u16_le(length);
        out.put_slice(&body);
        let crc = crc16(&out);
        out.put_u16_le(crc);
        Ok(out.to_vec())
    }
}

/// Incremental packet decoder over a byte stream
#[derive(Debug, Default)]
pub struct PacketReader {
    buf: Vec<u8>,
}

impl PacketReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete packet.
    ///
    /// Returns `Ok(None)` until enough bytes have arrived. A corrupt packet is
    /// dropped from the buffer and reported as `Malformed`; decoding can
    /// continue with the following bytes.
    pub fn next_packet(&mut self) -> Result<Option<RawPacket>, BusError> {
        let Some(start) = self.buf.windows(HEADER.len()).position(|w| w == HEADER) else {
            // Keep a possible partial header at the tail
            let keep = self.buf.len().min(HEADER.len() - 1);
            let discard = self.buf.len() - keep;
            if discard > 0 {
                debug!("Discarding {} bytes of line noise", discard);
                self.buf.drain(..discard);
            }
            return Ok(None);
        };

        if start > 0 {
            debug!("Discarding {} bytes before packet header", start);
            self.buf.drain(..start);
        }

        if self.buf.len() < PREFIX_LEN {
            return Ok(None);
        }

        let length = u16::from_le_bytes([self.buf[5], self.buf[6]]) as usize;
        if length < 3 {
            self.buf.drain(..HEADER.len());
            return Err(BusError::Malformed(format!("packet length {} too short", length)));
        }

        let total = PREFIX_LEN + length;
        if self.buf.len() < total {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buf.drain(..total).collect();
        let expected = u16::from_le_bytes([frame[total - 2], frame[total - 1]]);
        let actual = crc16(&frame[..total - 2]);
        if expected != actual {
            return Err(BusError::Malformed(format!(
                "CRC mismatch: packet 0x{:04X}, computed 0x{:04X}",
                expected, actual
            )));
        }

        let body = unstuff(&frame[PREFIX_LEN..total - 2]);
        let Some((&instruction, payload)) = body.split_first() else {
            return Err(BusError::Malformed("packet without instruction".to_string()));
        };

        Ok(Some(RawPacket {
            id: frame[4],
            instruction,
            payload: payload.to_vec(),
        }))
    }
}

/// Parameters for READ: address and length
pub fn read_params(register: Register) -> Vec<u8> {
    let mut params = Vec::with_capacity(4);
    params.extend_from_slice(&register.address.to_le_bytes());
    params.extend_from_slice(&register.width.to_le_bytes());
    params
}

/// Parameters for WRITE: address followed by data
pub fn write_params(address: u16, data: &[u8]) -> Vec<u8> {
    let mut params = Vec::with_capacity(2 + data.len());
    params.extend_from_slice(&address.to_le_bytes());
    params.extend_from_slice(data);
    params
}

/// Little-endian register value of up to four bytes, sign-extended from 32 bits
pub fn decode_i32(data: &[u8]) -> Result<i32, BusError> {
    match data.len() {
        1 => Ok(data[0] as i32),
        2 => Ok(u16::from_le_bytes([data[0], data[1]]) as i32),
        4 => Ok(i32::from_le_bytes([data[0], data[1], data[2], data[3]])),
        n => Err(BusError::Malformed(format!("unexpected register width {}", n))),
    }
}

//! Hardware abstraction seam
//!
//! The engine drives a device exclusively through [`Hal`]. A backend turns
//! tokens into 64-byte command words, moves page data in and out of device
//! buffers, and reports per-token status. Timeout partitioning and retry
//! policy can be specialised per backend.
//!
//! ## Command word layout (little endian)
//!
//! ```text
//! [0]       opcode
//! [1]       flags: bit0 write polarity, bit1 piggy-backed deallocation
//! [2..4]    core buffer id      (0xFFFF = none)
//! [4..6]    write buffer id     (0xFFFF = none)
//! [6..8]    read buffer id      (0xFFFF = none)
//! [8..10]   deallocated read buffer id (0xFFFF = none)
//! [10..12]  token id
//! [12..16]  sector count
//! [16..24]  first sector
//! [24..32]  sequence number
//! [32..40]  parameter (control parameter id, trim stripe sectors)
//! [40..48]  auxiliary (control value, trim stride sectors)
//! [48..56]  trim stripe count
//! [56]      control sub-op
//! [57..60]  reserved
//! [60..64]  crc32c of [0..60]
//! ```

use crate::pool::BufferId;
use crate::request::ControlOp;
use crate::token::{Op, Token, TokenId};
use bytes::{Buf, BufMut};
use tdimm_common::{Geometry, IoError, SECTOR_SIZE, bytes_to_sectors};
use thiserror::Error;

/// Size of an encoded command
pub const COMMAND_SIZE: usize = 64;

const NO_BUFFER: u16 = 0xFFFF;
const CRC_OFFSET: usize = 60;

const FLAG_ODD: u8 = 0x01;
const FLAG_DEALLOC: u8 = 0x02;

/// Errors reported by a backend
#[derive(Debug, Error)]
pub enum HalError {
    #[error("device not present: {0}")]
    NotPresent(String),

    #[error("bad command word: {0}")]
    BadCommand(String),

    #[error("invalid buffer {kind} {id}")]
    InvalidBuffer { kind: &'static str, id: u16 },

    #[error("device busy")]
    Busy,

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl HalError {
    /// Request-level result a failed HAL call maps onto
    #[must_use]
    pub const fn io_error(&self) -> IoError {
        match self {
            Self::Unsupported(_) => IoError::Unsupported,
            Self::Busy => IoError::NoMemory,
            _ => IoError::Io,
        }
    }
}

pub type HalResult<T> = std::result::Result<T, HalError>;

/// Command opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Read = 1,
    Write = 2,
    Trim = 3,
    Dealloc = 4,
    Control = 5,
    SeqAdvance = 6,
}

impl Opcode {
    /// Decode a raw opcode
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            3 => Some(Self::Trim),
            4 => Some(Self::Dealloc),
            5 => Some(Self::Control),
            6 => Some(Self::SeqAdvance),
            _ => None,
        }
    }

    const fn of(op: Op) -> Self {
        match op {
            Op::Read => Self::Read,
            Op::Write => Self::Write,
            Op::Trim => Self::Trim,
            Op::Dealloc => Self::Dealloc,
            Op::Control(_) => Self::Control,
            Op::SeqAdvance => Self::SeqAdvance,
        }
    }
}

/// Control sub-operation carried in a control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlKind {
    Nop = 0,
    GetParam = 1,
    SetParam = 2,
    Flush = 3,
}

impl ControlKind {
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Nop),
            1 => Some(Self::GetParam),
            2 => Some(Self::SetParam),
            3 => Some(Self::Flush),
            _ => None,
        }
    }
}

/// Encoded 64-byte command
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandWord(pub [u8; COMMAND_SIZE]);

impl std::fmt::Debug for CommandWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match CommandFields::decode(self) {
            Ok(fields) => write!(
                f,
                "CommandWord({:?} token={} seq={} lba={} odd={})",
                fields.opcode, fields.token, fields.seq, fields.lba, fields.odd
            ),
            Err(_) => f.write_str("CommandWord(<invalid>)"),
        }
    }
}

impl CommandWord {
    /// Raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; COMMAND_SIZE] {
        &self.0
    }

    /// Polarity bit of the encoded command
    #[must_use]
    pub const fn odd(&self) -> bool {
        self.0[1] & FLAG_ODD != 0
    }

    /// Flip the polarity bit and refresh the checksum
    pub fn toggle_odd(&mut self) {
        self.0[1] ^= FLAG_ODD;
        self.seal();
    }

    fn seal(&mut self) {
        let crc = crc32c::crc32c(&self.0[..CRC_OFFSET]);
        self.0[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
    }

    /// Verify the trailing checksum
    #[must_use]
    pub fn verify(&self) -> bool {
        let mut stored = &self.0[CRC_OFFSET..];
        stored.get_u32_le() == crc32c::crc32c(&self.0[..CRC_OFFSET])
    }
}

/// Decoded view of a command word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFields {
    pub opcode: Opcode,
    pub odd: bool,
    pub token: u16,
    pub core_buf: Option<BufferId>,
    pub wr_buf: Option<BufferId>,
    pub rd_buf: Option<BufferId>,
    pub dealloc_buf: Option<BufferId>,
    pub sectors: u32,
    pub lba: u64,
    pub seq: u64,
    pub param: u64,
    pub aux: u64,
    pub stripes: u64,
    pub control: ControlKind,
}

fn buffer_raw(id: Option<BufferId>) -> u16 {
    id.map_or(NO_BUFFER, |b| b.0)
}

fn buffer_from_raw(raw: u16) -> Option<BufferId> {
    (raw != NO_BUFFER).then_some(BufferId(raw))
}

impl CommandFields {
    /// Fields describing the token's next dispatch
    #[must_use]
    pub fn from_token(token: &Token) -> Self {
        let (mut param, mut aux, mut stripes, mut control) = (0, 0, 0, ControlKind::Nop);
        match token.op {
            Op::Control(op) => match op {
                ControlOp::Nop => {}
                ControlOp::Flush => control = ControlKind::Flush,
                ControlOp::GetParam(id) => {
                    control = ControlKind::GetParam;
                    param = u64::from(id);
                }
                ControlOp::SetParam(id, value) => {
                    control = ControlKind::SetParam;
                    param = u64::from(id);
                    aux = value;
                }
            },
            Op::Trim => {
                if let Some(extent) = token.discard {
                    param = bytes_to_sectors(extent.stripe_bytes);
                    aux = bytes_to_sectors(extent.stride_bytes);
                    stripes = extent.stripes;
                } else {
                    stripes = 1;
                }
            }
            _ => {}
        }
        Self {
            opcode: Opcode::of(token.op),
            odd: token.odd,
            token: token.id.0,
            core_buf: token.core_buf,
            wr_buf: token.wr_buf,
            rd_buf: token.rd_buf,
            dealloc_buf: token.dealloc_buf,
            sectors: token.sectors,
            lba: token.lba,
            seq: token.seq.unwrap_or(0),
            param,
            aux,
            stripes,
            control,
        }
    }

    /// Encode into a sealed command word
    #[must_use]
    pub fn encode(&self) -> CommandWord {
        let mut raw = [0u8; COMMAND_SIZE];
        {
            let mut buf = &mut raw[..];
            buf.put_u8(self.opcode as u8);
            let mut flags = 0;
            if self.odd {
                flags |= FLAG_ODD;
            }
            if self.dealloc_buf.is_some() {
                flags |= FLAG_DEALLOC;
            }
            buf.put_u8(flags);
            buf.put_u16_le(buffer_raw(self.core_buf));
            buf.put_u16_le(buffer_raw(self.wr_buf));
            buf.put_u16_le(buffer_raw(self.rd_buf));
            buf.put_u16_le(buffer_raw(self.dealloc_buf));
            buf.put_u16_le(self.token);
            buf.put_u32_le(self.sectors);
            buf.put_u64_le(self.lba);
            buf.put_u64_le(self.seq);
            buf.put_u64_le(self.param);
            buf.put_u64_le(self.aux);
            buf.put_u64_le(self.stripes);
            buf.put_u8(self.control as u8);
        }
        let mut word = CommandWord(raw);
        word.seal();
        word
    }

    /// Decode and verify a command word
    pub fn decode(word: &CommandWord) -> HalResult<Self> {
        if !word.verify() {
            return Err(HalError::BadCommand("checksum mismatch".into()));
        }
        let mut buf = &word.0[..CRC_OFFSET];
        let raw_op = buf.get_u8();
        let opcode = Opcode::from_u8(raw_op)
            .ok_or_else(|| HalError::BadCommand(format!("unknown opcode {raw_op}")))?;
        let flags = buf.get_u8();
        let core_buf = buffer_from_raw(buf.get_u16_le());
        let wr_buf = buffer_from_raw(buf.get_u16_le());
        let rd_buf = buffer_from_raw(buf.get_u16_le());
        let dealloc_buf = buffer_from_raw(buf.get_u16_le());
        if (flags & FLAG_DEALLOC != 0) != dealloc_buf.is_some() {
            return Err(HalError::BadCommand("deallocation flag mismatch".into()));
        }
        let token = buf.get_u16_le();
        let sectors = buf.get_u32_le();
        let lba = buf.get_u64_le();
        let seq = buf.get_u64_le();
        let param = buf.get_u64_le();
        let aux = buf.get_u64_le();
        let stripes = buf.get_u64_le();
        let raw_ctl = buf.get_u8();
        let control = ControlKind::from_u8(raw_ctl)
            .ok_or_else(|| HalError::BadCommand(format!("unknown control op {raw_ctl}")))?;
        Ok(Self {
            opcode,
            odd: flags & FLAG_ODD != 0,
            token,
            core_buf,
            wr_buf,
            rd_buf,
            dealloc_buf,
            sectors,
            lba,
            seq,
            param,
            aux,
            stripes,
            control,
        })
    }

    /// Bytes transferred by a read or write
    #[must_use]
    pub const fn transfer_bytes(&self) -> usize {
        self.sectors as usize * SECTOR_SIZE as usize
    }
}

/// Status of a dispatched token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    /// Still executing
    Pending,
    Done,
    /// Failed in a way a retry may fix
    Retry(IoError),
    /// The device reports the command as lost
    TimedOut,
    /// Unrecoverable device failure
    Fatal,
}

/// Extended status of a finished token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtStatus {
    /// Value reported by the device: the read buffer a read landed in, or a
    /// control command's result
    Ready(u64),
    /// Not reported yet, poll again later
    Deferred,
}

/// Partition of timed-out tokens produced by [`Hal::handle_timeouts`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeoutVerdict {
    pub retry: Vec<TokenId>,
    pub dead: Vec<TokenId>,
}

/// Backend override of the engine's retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Use the configured retry count
    Default,
    Allow,
    Deny,
}

/// Device backend driven by the engine
pub trait Hal: Send {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Block geometry of the device
    fn geometry(&self) -> Geometry;

    /// Firmware handshake run while the engine is in `FW_PROBE`
    fn handshake(&mut self) -> HalResult<()>;

    /// Build the command word for the token's next dispatch
    fn create_cmd(&mut self, token: &Token) -> HalResult<CommandWord>;

    /// Hand a command to the device
    fn start_token(&mut self, token: &Token, cmd: &CommandWord) -> HalResult<()>;

    /// Hand a trim command to the device
    fn trim(&mut self, token: &Token, cmd: &CommandWord) -> HalResult<()> {
        self.start_token(token, cmd)
    }

    /// Hand an independent read-buffer deallocation to the device
    fn deallocate(&mut self, token: &Token, cmd: &CommandWord) -> HalResult<()> {
        self.start_token(token, cmd)
    }

    /// Abandon whatever the device is doing for this token
    fn reset_token(&mut self, token: &Token) -> HalResult<()>;

    /// Copy a page out of a device read buffer
    fn read_page(&mut self, buf: BufferId, dst: &mut [u8]) -> HalResult<()>;

    /// Copy a page into a device write buffer
    fn write_page(&mut self, buf: BufferId, src: &[u8]) -> HalResult<()>;

    /// Make a freshly written write buffer visible to the device
    fn refresh_wep(&mut self, buf: BufferId) -> HalResult<()>;

    fn read_status(&mut self, token: &Token) -> TokenStatus;

    fn read_ext_status(&mut self, token: &Token) -> ExtStatus;

    /// Split timed-out tokens into those worth retrying and those that are
    /// lost for good
    fn handle_timeouts(&mut self, tokens: &[&Token]) -> TimeoutVerdict {
        TimeoutVerdict {
            retry: tokens.iter().map(|t| t.id).collect(),
            dead: Vec::new(),
        }
    }

    fn can_retry(&self, _token: &Token) -> RetryDecision {
        RetryDecision::Default
    }

    /// Flip the polarity bit of an already built command
    fn reverse_cmd_polarity(&mut self, cmd: &mut CommandWord) {
        cmd.toggle_odd();
    }

    /// Whether a command that will never be delivered must still consume its
    /// sequence number
    fn requires_sequence_advance(&self) -> bool {
        false
    }

    /// Quiesce the device; the engine sleeps once this succeeds
    fn suspend(&mut self) -> HalResult<()> {
        Ok(())
    }

    fn resume(&mut self) -> HalResult<()> {
        Ok(())
    }
}

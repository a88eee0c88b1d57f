//! Control command types and wire codec.
//!
//! This crate is shared between the controller daemon and the CLI client.
//! It defines the typed control command and the two wire encodings a
//! deployment can pick from: the human-readable text payload used on the
//! publish/subscribe channel, and the fixed 12-byte binary record used on
//! the request/reply channel.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Numeric command discriminants. The values double as the binary wire
/// encoding of `command_kind` in [`WireFormat::Record`] payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum CommandKind {
    NoOp = 0,
    SetPowerCap = 1,
    ResetPowerCap = 2,
    SetCuMask = 3,
    ResetCuMask = 4,
}

impl CommandKind {
    fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::NoOp),
            1 => Some(Self::SetPowerCap),
            2 => Some(Self::ResetPowerCap),
            3 => Some(Self::SetCuMask),
            4 => Some(Self::ResetCuMask),
            _ => None,
        }
    }
}

/// A decoded, shape-validated control command.
///
/// Range validation (GPU index, power limits, mask population) is the
/// daemon's job; decoding only guarantees the payload was well-formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    NoOp,
    /// Cap the GPU's power draw. `watts` is converted to the device's
    /// native unit by the dispatcher.
    SetPowerCap { gpu_index: u32, watts: u32 },
    /// Restore the device-reported default power cap.
    ResetPowerCap { gpu_index: u32 },
    /// Publish a compute-unit mask for the GPU. `word0` holds the low 32
    /// mask bits, `word1` the high 28.
    SetCuMask { gpu_index: u32, word0: u32, word1: u32 },
    /// Restore the all-units-enabled mask.
    ResetCuMask { gpu_index: u32 },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::NoOp => CommandKind::NoOp,
            Command::SetPowerCap { .. } => CommandKind::SetPowerCap,
            Command::ResetPowerCap { .. } => CommandKind::ResetPowerCap,
            Command::SetCuMask { .. } => CommandKind::SetCuMask,
            Command::ResetCuMask { .. } => CommandKind::ResetCuMask,
        }
    }

    /// GPU ordinal the command is addressed to, if any.
    pub fn gpu_index(&self) -> Option<u32> {
        match *self {
            Command::NoOp => None,
            Command::SetPowerCap { gpu_index, .. }
            | Command::ResetPowerCap { gpu_index }
            | Command::SetCuMask { gpu_index, .. }
            | Command::ResetCuMask { gpu_index } => Some(gpu_index),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Command::NoOp => write!(f, "NOOP"),
            Command::SetPowerCap { gpu_index, watts } => {
                write!(f, "SET_FREQ gpu={gpu_index} watts={watts}")
            }
            Command::ResetPowerCap { gpu_index } => write!(f, "RESET_FREQ gpu={gpu_index}"),
            Command::SetCuMask {
                gpu_index,
                word0,
                word1,
            } => write!(f, "SET_CUMASK gpu={gpu_index} mask=({word0:08x},{word1:08x})"),
            Command::ResetCuMask { gpu_index } => write!(f, "RESET_CUMASK gpu={gpu_index}"),
        }
    }
}

/// Size of a [`WireFormat::Record`] payload in bytes.
pub const RECORD_LEN: usize = 12;

/// Errors raised while decoding a wire payload. Any decode failure drops
/// the whole command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("payload is not valid UTF-8")]
    NotText,
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("missing `{0}` field")]
    MissingField(&'static str),
    #[error("invalid GPU index `{0}`")]
    BadGpuIndex(String),
    #[error("invalid value `{0}`")]
    BadValue(String),
    #[error("mask word `{0}` is not an 8-character hex string")]
    BadMaskWord(String),
    #[error("record payload is {0} bytes, expected {RECORD_LEN}")]
    BadRecordLen(usize),
    #[error("unknown command kind {0}")]
    UnknownKind(u32),
    #[error("negative value {0} for command requiring a magnitude")]
    NegativeValue(i32),
}

/// Payload shape, chosen once per deployment alongside the channel
/// addressing mode. Both the daemon and the client must agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `"<CMD>:<gpu_index>:<value>[:<value2>]"`, used with the
    /// publish/subscribe channel.
    Text,
    /// Little-endian `{command_kind: u32, gpu_index: u32, value: i32}`,
    /// used with the request/reply channel.
    Record,
}

impl WireFormat {
    pub fn decode(&self, payload: &[u8]) -> Result<Command, DecodeError> {
        match self {
            WireFormat::Text => decode_text(payload),
            WireFormat::Record => decode_record(payload),
        }
    }

    pub fn encode(&self, command: &Command) -> Vec<u8> {
        match self {
            WireFormat::Text => encode_text(command).into_bytes(),
            WireFormat::Record => encode_record(command).to_vec(),
        }
    }
}

/// Parses one mask word: exactly 8 hex characters, nothing else.
pub fn parse_mask_word(word: &str) -> Result<u32, DecodeError> {
    if word.len() != 8 {
        return Err(DecodeError::BadMaskWord(word.to_string()));
    }
    u32::from_str_radix(word, 16).map_err(|_| DecodeError::BadMaskWord(word.to_string()))
}

fn decode_text(payload: &[u8]) -> Result<Command, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::NotText)?;
    let mut fields = text.trim_end_matches(['\r', '\n']).split(':');

    let name = fields.next().filter(|s| !s.is_empty()).ok_or(DecodeError::Empty)?;
    let gpu_index = fields
        .next()
        .ok_or(DecodeError::MissingField("gpu_index"))
        .and_then(|s| s.parse::<u32>().map_err(|_| DecodeError::BadGpuIndex(s.to_string())))?;

    match name {
        "NOOP" => Ok(Command::NoOp),
        "SET_FREQ" => {
            let raw = fields.next().ok_or(DecodeError::MissingField("watts"))?;
            let watts = raw
                .parse::<u32>()
                .map_err(|_| DecodeError::BadValue(raw.to_string()))?;
            Ok(Command::SetPowerCap { gpu_index, watts })
        }
        "RESET_FREQ" => Ok(Command::ResetPowerCap { gpu_index }),
        "SET_CUMASK" => {
            let word0 = parse_mask_word(fields.next().ok_or(DecodeError::MissingField("word0"))?)?;
            let word1 = parse_mask_word(fields.next().ok_or(DecodeError::MissingField("word1"))?)?;
            Ok(Command::SetCuMask {
                gpu_index,
                word0,
                word1,
            })
        }
        "RESET_CUMASK" => Ok(Command::ResetCuMask { gpu_index }),
        other => Err(DecodeError::UnknownCommand(other.to_string())),
    }
}

fn decode_record(payload: &[u8]) -> Result<Command, DecodeError> {
    if payload.len() != RECORD_LEN {
        return Err(DecodeError::BadRecordLen(payload.len()));
    }
    let kind = u32::from_le_bytes(payload[0..4].try_into().expect("4-byte slice"));
    let gpu_index = u32::from_le_bytes(payload[4..8].try_into().expect("4-byte slice"));
    let value = i32::from_le_bytes(payload[8..12].try_into().expect("4-byte slice"));

    match CommandKind::from_wire(kind).ok_or(DecodeError::UnknownKind(kind))? {
        CommandKind::NoOp => Ok(Command::NoOp),
        CommandKind::SetPowerCap => {
            if value < 0 {
                return Err(DecodeError::NegativeValue(value));
            }
            Ok(Command::SetPowerCap {
                gpu_index,
                watts: value as u32,
            })
        }
        CommandKind::ResetPowerCap => Ok(Command::ResetPowerCap { gpu_index }),
        // The record carries a single value, so only the low mask word can
        // travel on this channel; the high word is left clear.
        CommandKind::SetCuMask => Ok(Command::SetCuMask {
            gpu_index,
            word0: value as u32,
            word1: 0,
        }),
        CommandKind::ResetCuMask => Ok(Command::ResetCuMask { gpu_index }),
    }
}

fn encode_text(command: &Command) -> String {
    match *command {
        Command::NoOp => "NOOP:0".to_string(),
        Command::SetPowerCap { gpu_index, watts } => format!("SET_FREQ:{gpu_index}:{watts}"),
        Command::ResetPowerCap { gpu_index } => format!("RESET_FREQ:{gpu_index}"),
        Command::SetCuMask {
            gpu_index,
            word0,
            word1,
        } => format!("SET_CUMASK:{gpu_index}:{word0:08x}:{word1:08x}"),
        Command::ResetCuMask { gpu_index } => format!("RESET_CUMASK:{gpu_index}"),
    }
}

/// Encodes the 12-byte record payload. `SetCuMask` can only carry its low
/// word here; callers must reject two-word masks before choosing this
/// format.
fn encode_record(command: &Command) -> [u8; RECORD_LEN] {
    let (kind, gpu_index, value) = match *command {
        Command::NoOp => (CommandKind::NoOp, 0, 0),
        Command::SetPowerCap { gpu_index, watts } => {
            (CommandKind::SetPowerCap, gpu_index, watts as i32)
        }
        Command::ResetPowerCap { gpu_index } => (CommandKind::ResetPowerCap, gpu_index, 0),
        Command::SetCuMask {
            gpu_index, word0, ..
        } => (CommandKind::SetCuMask, gpu_index, word0 as i32),
        Command::ResetCuMask { gpu_index } => (CommandKind::ResetCuMask, gpu_index, 0),
    };

    let mut buf = [0u8; RECORD_LEN];
    buf[0..4].copy_from_slice(&(kind as u32).to_le_bytes());
    buf[4..8].copy_from_slice(&gpu_index.to_le_bytes());
    buf[8..12].copy_from_slice(&value.to_le_bytes());
    buf
}

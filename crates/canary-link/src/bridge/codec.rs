//! slcan (serial line CAN) ASCII codec
//!
//! Frame lines, all `\r` terminated:
//!   `t<id:3><dlc:1><data:2*dlc>`  standard data
//!   `T<id:8><dlc:1><data:2*dlc>`  extended data
//!   `r<id:3><dlc:1>` / `R<id:8><dlc:1>`  remote request
//!
//! Adapters answer commands with a bare `\r` (or `z\r`/`Z\r` after a
//! transmit) and report failures with BEL (0x07).

use canary_core::{monotonic_now, Frame, FrameError, LinkError, MAX_DATA_LEN};
use thiserror::Error;

pub const CR: u8 = b'\r';
pub const BEL: u8 = 0x07;

/// Longest valid line: `T` + 8 id + 1 dlc + 16 data
const MAX_LINE: usize = 1 + 8 + 1 + 2 * MAX_DATA_LEN;

/// Decoding failures; surfaced as transport errors by the adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unknown slcan command '{0}'")]
    UnknownCommand(char),

    #[error("line too short: {len} bytes, need {need}")]
    Truncated { len: usize, need: usize },

    #[error("invalid hex in {field}: {text}")]
    InvalidHex { field: &'static str, text: String },

    #[error("invalid DLC {0}")]
    InvalidDlc(char),

    #[error("no line terminator within {0} bytes")]
    Overflow(usize),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl From<CodecError> for LinkError {
    fn from(err: CodecError) -> Self {
        LinkError::Transport(format!("slcan: {}", err))
    }
}

/// One decoded unit of adapter output
#[derive(Debug, Clone, PartialEq)]
pub enum SlcanMessage {
    Data(Frame),
    Remote { id: u32, extended: bool, dlc: u8 },
    /// Command accepted (`\r`, `z\r`, `Z\r`)
    Ack,
    /// Command rejected (BEL)
    Bell,
}

pub struct SlcanCodec;

impl SlcanCodec {
    /// Encode a data frame, including the trailing `\r`
    pub fn encode(frame: &Frame) -> Vec<u8> {
        let mut line = if frame.is_extended() {
            format!("T{:08X}", frame.id())
        } else {
            format!("t{:03X}", frame.id())
        };
        line.push_str(&format!("{:X}", frame.dlc()));
        line.push_str(&hex::encode_upper(frame.data()));
        line.push('\r');
        line.into_bytes()
    }

    /// Decode one line without its terminator
    pub fn decode(line: &[u8]) -> Result<SlcanMessage, CodecError> {
        let Some(&command) = line.first() else {
            return Ok(SlcanMessage::Ack);
        };

        let (extended, remote) = match command {
            b't' => (false, false),
            b'T' => (true, false),
            b'r' => (false, true),
            b'R' => (true, true),
            b'z' | b'Z' => return Ok(SlcanMessage::Ack),
            other => return Err(CodecError::UnknownCommand(other as char)),
        };

        let id_len = if extended { 8 } else { 3 };
        let header = 1 + id_len + 1;
        if line.len() < header {
            return Err(CodecError::Truncated {
                len: line.len(),
                need: header,
            });
        }

        let id_text = String::from_utf8_lossy(&line[1..1 + id_len]);
        let id = u32::from_str_radix(&id_text, 16).map_err(|_| CodecError::InvalidHex {
            field: "id",
            text: id_text.to_string(),
        })?;

        let dlc_char = line[1 + id_len] as char;
        let dlc = dlc_char
            .to_digit(16)
            .filter(|dlc| *dlc as usize <= MAX_DATA_LEN)
            .ok_or(CodecError::InvalidDlc(dlc_char))? as u8;

        if remote {
            // Range-check the id the same way data frames are
            Frame::with_timestamp(id, &[], extended, 0.0)?;
            return Ok(SlcanMessage::Remote { id, extended, dlc });
        }

        let need = header + 2 * dlc as usize;
        if line.len() < need {
            return Err(CodecError::Truncated {
                len: line.len(),
                need,
            });
        }
        let data = hex::decode(&line[header..need]).map_err(|_| CodecError::InvalidHex {
            field: "data",
            text: String::from_utf8_lossy(&line[header..need]).to_string(),
        })?;

        Ok(SlcanMessage::Data(Frame::with_timestamp(
            id,
            &data,
            extended,
            monotonic_now(),
        )?))
    }
}

/// Accumulates serial reads and yields complete messages
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Next complete message, or `None` when more bytes are needed
    pub fn next_message(&mut self) -> Option<Result<SlcanMessage, CodecError>> {
        match self.buf.iter().position(|b| *b == CR || *b == BEL) {
            Some(pos) => {
                let terminator = self.buf[pos];
                let line: Vec<u8> = self.buf.drain(..=pos).take(pos).collect();
                if terminator == BEL {
                    return Some(Ok(SlcanMessage::Bell));
                }
                Some(SlcanCodec::decode(&line))
            }
            None if self.buf.len() > MAX_LINE => {
                let len = self.buf.len();
                self.buf.clear();
                Some(Err(CodecError::Overflow(len)))
            }
            None => None,
        }
    }
}

/// `S<n>` speed command for a bitrate
pub fn bitrate_command(bitrate: u32) -> Result<&'static [u8], LinkError> {
    let command: &'static [u8] = match bitrate {
        10_000 => b"S0\r",
        20_000 => b"S1\r",
        50_000 => b"S2\r",
        100_000 => b"S3\r",
        125_000 => b"S4\r",
        250_000 => b"S5\r",
        500_000 => b"S6\r",
        800_000 => b"S7\r",
        1_000_000 => b"S8\r",
        other => {
            return Err(LinkError::Configuration(format!(
                "bitrate {} not supported by slcan adapters",
                other
            )))
        }
    };
    Ok(command)
}

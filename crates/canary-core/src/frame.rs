//! CAN frame value types

use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FrameError;

/// Largest 11-bit identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;
/// Largest 29-bit identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
/// Classic CAN payload limit
pub const MAX_DATA_LEN: usize = 8;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Seconds elapsed on the process-wide monotonic clock
pub fn monotonic_now() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

pub(crate) fn id_limit(extended: bool) -> u32 {
    if extended {
        MAX_EXTENDED_ID
    } else {
        MAX_STANDARD_ID
    }
}

fn check_id(id: u32, extended: bool) -> Result<(), FrameError> {
    if id > id_limit(extended) {
        return Err(FrameError::IdOutOfRange { id, extended });
    }
    Ok(())
}

fn pack(data: &[u8]) -> Result<([u8; MAX_DATA_LEN], u8), FrameError> {
    if data.len() > MAX_DATA_LEN {
        return Err(FrameError::PayloadTooLong(data.len()));
    }
    let mut buf = [0u8; MAX_DATA_LEN];
    buf[..data.len()].copy_from_slice(data);
    Ok((buf, data.len() as u8))
}

/// A single CAN frame
///
/// Frames are validated when built and cannot be changed afterwards.
/// The payload lives inline, so copies never share a buffer.
#[derive(Clone, Copy, PartialEq)]
pub struct Frame {
    id: u32,
    extended: bool,
    len: u8,
    data: [u8; MAX_DATA_LEN],
    timestamp: f64,
}

impl Frame {
    /// Build a frame stamped with the current monotonic time
    pub fn new(id: u32, data: &[u8], extended: bool) -> Result<Self, FrameError> {
        Self::with_timestamp(id, data, extended, monotonic_now())
    }

    /// Build a frame with an explicit capture timestamp (seconds)
    pub fn with_timestamp(
        id: u32,
        data: &[u8],
        extended: bool,
        timestamp: f64,
    ) -> Result<Self, FrameError> {
        check_id(id, extended)?;
        let (data, len) = pack(data)?;
        Ok(Self {
            id,
            extended,
            len,
            data,
            timestamp,
        })
    }

    /// Standard (11-bit) frame
    pub fn standard(id: u32, data: &[u8]) -> Result<Self, FrameError> {
        Self::new(id, data, false)
    }

    /// Extended (29-bit) frame
    pub fn extended(id: u32, data: &[u8]) -> Result<Self, FrameError> {
        Self::new(id, data, true)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn dlc(&self) -> usize {
        self.len as usize
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Same id and payload, different timestamp
    pub fn restamped(&self, timestamp: f64) -> Self {
        Self { timestamp, ..*self }
    }

    /// Strip the timestamp
    pub fn template(&self) -> FrameTemplate {
        FrameTemplate {
            id: self.id,
            extended: self.extended,
            len: self.len,
            data: self.data,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &format_args!("0x{:X}", self.id))
            .field("extended", &self.extended)
            .field("data", &format_args!("{}", hex::encode_upper(self.data())))
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// candump style: `123#DEADBEEF`, `1ABCDEF0#`
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "{:08X}#{}", self.id, hex::encode_upper(self.data()))
        } else {
            write!(f, "{:03X}#{}", self.id, hex::encode_upper(self.data()))
        }
    }
}

/// A frame without a timestamp, used by scenarios and traffic patterns
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameTemplate {
    id: u32,
    extended: bool,
    len: u8,
    data: [u8; MAX_DATA_LEN],
}

impl FrameTemplate {
    pub fn new(id: u32, data: &[u8], extended: bool) -> Result<Self, FrameError> {
        check_id(id, extended)?;
        let (data, len) = pack(data)?;
        Ok(Self {
            id,
            extended,
            len,
            data,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Produce a frame stamped with the current monotonic time
    pub fn stamp(&self) -> Frame {
        Frame {
            id: self.id,
            extended: self.extended,
            len: self.len,
            data: self.data,
            timestamp: monotonic_now(),
        }
    }
}

impl fmt::Debug for FrameTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameTemplate")
            .field("id", &format_args!("0x{:X}", self.id))
            .field("extended", &self.extended)
            .field("data", &format_args!("{}", hex::encode_upper(self.data())))
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct RawTemplate {
    #[serde(with = "can_id")]
    id: u32,
    #[serde(default)]
    data: Vec<u8>,
    #[serde(default)]
    extended: bool,
}

impl Serialize for FrameTemplate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawTemplate {
            id: self.id,
            data: self.data().to_vec(),
            extended: self.extended,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FrameTemplate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawTemplate::deserialize(deserializer)?;
        FrameTemplate::new(raw.id, &raw.data, raw.extended).map_err(serde::de::Error::custom)
    }
}

/// Parse a CAN ID from string (supports hex with 0x prefix)
pub fn parse_can_id(s: &str) -> Result<u32, FrameError> {
    let trimmed = s.trim();
    let (digits, radix) = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => (hex, 16),
        None => (trimmed, 10),
    };

    u32::from_str_radix(digits, radix).map_err(|_| FrameError::InvalidId(s.to_string()))
}

/// Serde helpers for CAN ids given either as integers or as `"0x..."` strings
pub mod can_id {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{:X}", id))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = u32;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a CAN id as integer or hex string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<u32, E> {
                u32::try_from(v).map_err(|_| E::custom(format!("CAN id {} too large", v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<u32, E> {
                u32::try_from(v).map_err(|_| E::custom(format!("invalid CAN id {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<u32, E> {
                super::parse_can_id(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x000, false)]
    #[case(0x7FF, false)]
    #[case(0x800, true)]
    #[case(0x1FFF_FFFF, true)]
    fn test_valid_ids(#[case] id: u32, #[case] extended: bool) {
        let frame = Frame::new(id, &[0x01], extended).unwrap();
        assert_eq!(frame.id(), id);
        assert_eq!(frame.is_extended(), extended);
    }

    #[rstest]
    #[case(0x800, false)]
    #[case(0xFFFF_FFFF, false)]
    #[case(0x2000_0000, true)]
    fn test_ids_out_of_range(#[case] id: u32, #[case] extended: bool) {
        assert_eq!(
            Frame::new(id, &[], extended),
            Err(FrameError::IdOutOfRange { id, extended })
        );
        assert!(FrameTemplate::new(id, &[], extended).is_err());
    }

    #[test]
    fn test_payload_bounds() {
        assert_eq!(Frame::standard(0x10, &[]).unwrap().dlc(), 0);
        assert_eq!(Frame::standard(0x10, &[0; 8]).unwrap().dlc(), 8);
        assert_eq!(
            Frame::standard(0x10, &[0; 9]),
            Err(FrameError::PayloadTooLong(9))
        );
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let a = Frame::standard(0x1, &[]).unwrap();
        let b = Frame::standard(0x1, &[]).unwrap();
        assert!(b.timestamp() >= a.timestamp());
    }

    #[test]
    fn test_display_candump_style() {
        let std = Frame::standard(0x123, &[0xDE, 0xAD]).unwrap();
        assert_eq!(std.to_string(), "123#DEAD");

        let ext = Frame::extended(0x18DAF100, &[]).unwrap();
        assert_eq!(ext.to_string(), "18DAF100#");
    }

    #[test]
    fn test_template_stamp_keeps_payload() {
        let template = FrameTemplate::new(0x321, &[1, 2, 3], false).unwrap();
        let frame = template.stamp();
        assert_eq!(frame.id(), 0x321);
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert_eq!(frame.template(), template);
    }

    #[rstest]
    #[case("0x7E0", 0x7E0)]
    #[case("0X18DA00F1", 0x18DA00F1)]
    #[case("291", 291)]
    #[case("  0x1 ", 1)]
    fn test_parse_can_id(#[case] input: &str, #[case] expected: u32) {
        assert_eq!(parse_can_id(input).unwrap(), expected);
    }

    #[test]
    fn test_parse_can_id_rejects_garbage() {
        assert!(parse_can_id("0xZZ").is_err());
        assert!(parse_can_id("").is_err());
    }

    #[test]
    fn test_template_deserialize_hex_and_int() {
        let t: FrameTemplate =
            serde_json::from_str(r#"{"id": "0x123", "data": [222, 173]}"#).unwrap();
        assert_eq!(t.id(), 0x123);
        assert_eq!(t.data(), &[0xDE, 0xAD]);
        assert!(!t.is_extended());

        let t: FrameTemplate = serde_json::from_str(r#"{"id": 291}"#).unwrap();
        assert_eq!(t.id(), 0x123);
        assert!(t.data().is_empty());
    }

    #[test]
    fn test_template_deserialize_validates() {
        let err = serde_json::from_str::<FrameTemplate>(r#"{"id": "0x800"}"#);
        assert!(err.is_err());
    }
}

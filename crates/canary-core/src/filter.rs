//! Acceptance filters

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FrameError;
use crate::frame::{can_id, id_limit, Frame};

/// An id/mask acceptance rule
///
/// A frame passes when its extended flag equals the rule's and
/// `frame.id & mask == id & mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterRule {
    id: u32,
    mask: u32,
    extended: bool,
}

impl FilterRule {
    pub fn new(id: u32, mask: u32, extended: bool) -> Result<Self, FrameError> {
        let limit = id_limit(extended);
        if id > limit {
            return Err(FrameError::IdOutOfRange { id, extended });
        }
        if mask > limit {
            return Err(FrameError::MaskOutOfRange { mask, extended });
        }
        Ok(Self { id, mask, extended })
    }

    /// Match exactly one identifier
    pub fn exact(id: u32, extended: bool) -> Result<Self, FrameError> {
        Self::new(id, id_limit(extended), extended)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn matches(&self, frame: &Frame) -> bool {
        frame.is_extended() == self.extended && (frame.id() & self.mask) == (self.id & self.mask)
    }
}

#[derive(Serialize, Deserialize)]
struct RawRule {
    #[serde(with = "can_id")]
    id: u32,
    #[serde(with = "can_id")]
    mask: u32,
    #[serde(default)]
    extended: bool,
}

impl Serialize for FilterRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawRule {
            id: self.id,
            mask: self.mask,
            extended: self.extended,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FilterRule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawRule::deserialize(deserializer)?;
        FilterRule::new(raw.id, raw.mask, raw.extended).map_err(serde::de::Error::custom)
    }
}

/// Ordered set of rules; a frame is accepted if any rule matches.
/// An empty set accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSet(Vec<FilterRule>);

impl FilterSet {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self(rules)
    }

    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn accepts(&self, frame: &Frame) -> bool {
        self.0.is_empty() || self.0.iter().any(|rule| rule.matches(frame))
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<FilterRule>> for FilterSet {
    fn from(rules: Vec<FilterRule>) -> Self {
        Self(rules)
    }
}

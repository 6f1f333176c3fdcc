use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ModelError, Result};

/// Media kind prefix of a channel identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Video,
    Audio,
    Other,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Video => "video",
            ChannelKind::Audio => "audio",
            ChannelKind::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "video" => Some(ChannelKind::Video),
            "audio" => Some(ChannelKind::Audio),
            "other" => Some(ChannelKind::Other),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed channel identifier: a kind prefix plus a stream name.
///
/// The display form preserves the name as given (`audio:Mic-1`); the
/// canonical form lowercases everything (`audio:mic-1`) and is what maps,
/// metrics and event payloads key on. Equality and hashing follow the
/// canonical form. Blank input parses to the empty sentinel, which
/// validators reject.
#[derive(Debug, Clone)]
pub struct ChannelId {
    kind: ChannelKind,
    name: String,
    canon_name: String,
}

impl ChannelId {
    /// Parse a raw identifier, applying `default_kind` when no `kind:` prefix
    /// is present. Never fails; blank input yields the empty sentinel.
    pub fn parse(raw: &str, default_kind: ChannelKind) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::empty();
        }

        let (kind, name) = match raw.split_once(':') {
            Some((prefix, rest)) => match ChannelKind::parse(prefix) {
                Some(kind) => (kind, rest.trim()),
                // Unknown prefix: treat the whole string as a name.
                None => (default_kind, raw),
            },
            None => (default_kind, raw),
        };

        if name.is_empty() {
            return Self::empty();
        }

        Self {
            kind,
            name: name.to_string(),
            canon_name: name.to_lowercase(),
        }
    }

    /// Parse and reject the empty sentinel.
    pub fn validated(raw: &str, default_kind: ChannelKind) -> Result<Self> {
        let id = Self::parse(raw, default_kind);
        if id.is_empty() {
            return Err(ModelError::InvalidChannel(format!(
                "channel id must not be blank (got {raw:?})"
            )));
        }
        Ok(id)
    }

    fn empty() -> Self {
        Self {
            kind: ChannelKind::Other,
            name: String::new(),
            canon_name: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical `kind:name` form, fully lowercased. Empty for the sentinel.
    pub fn canonical(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("{}:{}", self.kind.as_str(), self.canon_name)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, "{}:{}", self.kind.as_str(), self.name)
    }
}

impl PartialEq for ChannelId {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.canon_name == other.canon_name
    }
}

impl Eq for ChannelId {}

impl Hash for ChannelId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.canon_name.hash(state);
    }
}

impl PartialOrd for ChannelId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChannelId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.kind, &self.canon_name).cmp(&(other.kind, &other.canon_name))
    }
}

impl Serialize for ChannelId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.canonical())
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(ChannelId::parse(&raw, ChannelKind::Video))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_gets_default_kind() {
        let id = ChannelId::parse("lobby", ChannelKind::Video);
        assert_eq!(id.kind(), ChannelKind::Video);
        assert_eq!(id.canonical(), "video:lobby");
    }

    #[test]
    fn prefixed_name_preserves_case_in_display() {
        let id = ChannelId::parse("Audio:Mic-1", ChannelKind::Video);
        assert_eq!(id.kind(), ChannelKind::Audio);
        assert_eq!(id.to_string(), "audio:Mic-1");
        assert_eq!(id.canonical(), "audio:mic-1");
    }

    #[test]
    fn blank_input_is_empty_sentinel() {
        let id = ChannelId::parse("   ", ChannelKind::Video);
        assert!(id.is_empty());
        assert_eq!(id.canonical(), "");
        assert!(ChannelId::validated("", ChannelKind::Video).is_err());
    }

    #[test]
    fn unknown_prefix_folds_into_name() {
        let id = ChannelId::parse("rtsp://host/stream", ChannelKind::Video);
        assert_eq!(id.kind(), ChannelKind::Video);
        assert_eq!(id.name(), "rtsp://host/stream");
    }

    #[test]
    fn canonical_round_trips() {
        for raw in ["lobby", "Audio:Mic-1", "video:Front-Door", "other:X"] {
            let canon = ChannelId::parse(raw, ChannelKind::Video).canonical();
            let reparsed = ChannelId::parse(&canon, ChannelKind::Video);
            assert_eq!(reparsed.canonical(), canon);
        }
    }

    #[test]
    fn equality_ignores_name_case() {
        let a = ChannelId::parse("video:Lobby", ChannelKind::Video);
        let b = ChannelId::parse("video:lobby", ChannelKind::Video);
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }
}

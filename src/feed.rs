use std::fmt;

use serde::{Deserialize, Serialize};

/// Room-scoped identifier of a feed. The backend may use numeric or string ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeedId {
    Number(u64),
    Text(String),
}

impl FeedId {
    /// Numeric strings become `Number`, so `"42"` and `42` name the same feed.
    pub fn parse(value: &serde_json::Value) -> Option<FeedId> {
        match value {
            serde_json::Value::Number(n) => n.as_u64().map(FeedId::Number),
            serde_json::Value::String(s) if s.is_empty() => None,
            serde_json::Value::String(s) => match s.parse::<u64>() {
                Ok(n) => Some(FeedId::Number(n)),
                Err(_) => Some(FeedId::Text(s.clone())),
            },
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, FeedId::Text(s) if s.is_empty())
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedId::Number(n) => write!(f, "{}", n),
            FeedId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for FeedId {
    fn from(value: u64) -> Self {
        FeedId::Number(value)
    }
}

impl From<&str> for FeedId {
    fn from(value: &str) -> Self {
        match value.parse::<u64>() {
            Ok(n) => FeedId::Number(n),
            Err(_) => FeedId::Text(value.to_owned()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn parse(value: &str) -> Option<MediaKind> {
        match value {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub mid: String,
    pub kind: MediaKind,
}

impl StreamDescriptor {
    pub fn new(mid: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            mid: mid.into(),
            kind,
        }
    }
}

/// A remote participant's publishable media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    pub id: FeedId,
    pub display: Option<String>,
    pub streams: Vec<StreamDescriptor>,
    pub muted: bool,
    pub talking: bool,
}

impl Feed {
    pub fn new(id: impl Into<FeedId>, display: Option<String>, streams: Vec<StreamDescriptor>) -> Self {
        Self {
            id: id.into(),
            display,
            streams,
            muted: false,
            talking: false,
        }
    }

    pub fn display_name(&self) -> String {
        match &self.display {
            Some(display) if !display.is_empty() => display.clone(),
            _ => format!("Feed {}", self.id),
        }
    }

    pub fn has_streams(&self) -> bool {
        !self.streams.is_empty()
    }
}

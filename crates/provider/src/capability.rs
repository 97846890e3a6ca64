//! Capability and workload tags
//!
//! A `Capability` is the routing key for credentials: each key in the pool
//! declares which capabilities it is authorized for. A `Workload` is what a
//! caller asks for; grounded search is its own workload but routes with the
//! text capability.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Category of generation work a credential can be authorized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Text,
    Image,
    Video,
    #[serde(alias = "tts")]
    Speech,
}

impl Capability {
    /// Every capability, in declaration order. A key carrying all of them is
    /// general-purpose.
    pub const ALL: [Capability; 4] = [
        Capability::Text,
        Capability::Image,
        Capability::Video,
        Capability::Speech,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Text => "text",
            Capability::Image => "image",
            Capability::Video => "video",
            Capability::Speech => "speech",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown capability tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capability: {0}")]
pub struct ParseCapabilityError(pub String);

impl FromStr for Capability {
    type Err = ParseCapabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Capability::Text),
            "image" => Ok(Capability::Image),
            "video" => Ok(Capability::Video),
            "speech" | "tts" => Ok(Capability::Speech),
            other => Err(ParseCapabilityError(other.to_string())),
        }
    }
}

/// Kind of request a caller makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Workload {
    Text,
    Image,
    Video,
    Speech,
    Search,
}

impl Workload {
    /// Capability used to route this workload. Search shares the text credentials.
    pub fn capability(self) -> Capability {
        match self {
            Workload::Text | Workload::Search => Capability::Text,
            Workload::Image => Capability::Image,
            Workload::Video => Capability::Video,
            Workload::Speech => Capability::Speech,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Workload::Text => "text",
            Workload::Image => "image",
            Workload::Video => "video",
            Workload::Speech => "speech",
            Workload::Search => "search",
        }
    }
}

impl From<Capability> for Workload {
    fn from(capability: Capability) -> Self {
        match capability {
            Capability::Text => Workload::Text,
            Capability::Image => Workload::Image,
            Capability::Video => Workload::Video,
            Capability::Speech => Workload::Speech,
        }
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_routes_as_text() {
        assert_eq!(Workload::Search.capability(), Capability::Text);
        assert_eq!(Workload::Image.capability(), Capability::Image);
        assert_eq!(Workload::Speech.capability(), Capability::Speech);
    }

    #[test]
    fn parse_accepts_tts_alias() {
        assert_eq!("tts".parse::<Capability>().unwrap(), Capability::Speech);
        assert_eq!(" Image ".parse::<Capability>().unwrap(), Capability::Image);
    }

    #[test]
    fn parse_rejects_search_as_capability() {
        let err = "search".parse::<Capability>().unwrap_err();
        assert_eq!(err.to_string(), "unknown capability: search");
    }

    #[test]
    fn serde_uses_lowercase_tags() {
        let json = serde_json::to_string(&Capability::Speech).unwrap();
        assert_eq!(json, "\"speech\"");
        let parsed: Vec<Capability> = serde_json::from_str(r#"["text","tts"]"#).unwrap();
        assert_eq!(parsed, vec![Capability::Text, Capability::Speech]);
    }

    #[test]
    fn workload_display_keeps_search() {
        assert_eq!(Workload::Search.to_string(), "search");
        assert_eq!(Workload::from(Capability::Video), Workload::Video);
    }
}

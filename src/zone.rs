//! Zone domain types shared across the bridge.
//!
//! These types represent the controllable facets of an audio zone
//! (volume, mute, input source) in a form both links can agree on.

use serde::{Deserialize, Serialize};

/// A controllable facet of a zone's state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Attribute {
    Volume,
    Mute,
    Source,
}

impl std::fmt::Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Volume => write!(f, "volume"),
            Self::Mute => write!(f, "mute"),
            Self::Source => write!(f, "source"),
        }
    }
}

/// Two-state mute value.
///
/// The amplifier wire alphabet is `O`/`F`; Home Assistant uses `on`/`off`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    /// Single-letter code used by the amplifier's Gain>2 field.
    pub fn amp_code(self) -> char {
        match self {
            Self::On => 'O',
            Self::Off => 'F',
        }
    }
}

impl std::fmt::Display for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
        }
    }
}

impl From<&str> for Switch {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "on" => Self::On,
            _ => Self::Off,
        }
    }
}

/// A typed attribute value.
///
/// Exactly one variant per [`Attribute`]; decode and encode sites match
/// exhaustively so a new attribute kind cannot be silently mishandled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AttrValue {
    Volume(f64),
    Mute(Switch),
    Source(String),
}

impl AttrValue {
    pub fn attribute(&self) -> Attribute {
        match self {
            Self::Volume(_) => Attribute::Volume,
            Self::Mute(_) => Attribute::Mute,
            Self::Source(_) => Attribute::Source,
        }
    }
}

/// Which side of the bridge produced an update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Amplifier,
    Hub,
}

impl Origin {
    /// The link on the other side of the bridge.
    pub fn opposite(self) -> Self {
        match self {
            Self::Amplifier => Self::Hub,
            Self::Hub => Self::Amplifier,
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Amplifier => write!(f, "amplifier"),
            Self::Hub => write!(f, "hub"),
        }
    }
}

/// A raw decoded update entering the router from one of the links.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Zone name as decoded from the wire; canonicalized by the router.
    pub zone: String,
    pub value: AttrValue,
    pub origin: Origin,
}

/// A canonical-zone write leaving the router toward a link.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteCommand {
    /// Configured display name of the zone.
    pub zone: String,
    pub value: AttrValue,
}

/// Ordered list of configured input source names.
///
/// Wire indices are 1-based; there is no slot for "no source" — an unknown
/// source is represented as absence, not as index zero.
#[derive(Debug, Clone, Default)]
pub struct SourceList {
    names: Vec<String>,
}

/// Highest selector index the amplifier reports.
const MAX_SELECTOR_INDEX: usize = 4;

impl SourceList {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Resolve a 1-based selector index to its configured name.
    ///
    /// Indices outside 1..=4 (or beyond the configured list) yield `None`.
    pub fn name_for_index(&self, index: usize) -> Option<&str> {
        if !(1..=MAX_SELECTOR_INDEX).contains(&index) {
            return None;
        }
        self.names.get(index - 1).map(String::as_str)
    }

    /// Resolve a source name to its 1-based wire index.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name).map(|i| i + 1)
    }
}

/// Case-insensitive zone-name resolution with underscore-suffix extraction.
///
/// Home Assistant entity names arrive lowercased and may carry a foreign
/// prefix (`bose_foyer`); the amplifier's configured names are cased
/// (`Foyer`). The last underscore-delimited segment is matched
/// case-insensitively against the configured names.
pub fn resolve_zone<'a, I>(zones: I, raw: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let tail = raw.rsplit('_').next().unwrap_or(raw);
    let wanted = tail.to_lowercase();
    zones.into_iter().find(|z| z.to_lowercase() == wanted)
}

//! Canonical zone state store.
//!
//! Holds the last-known value per zone per attribute. This is the single
//! source of truth both links are compared against: an incoming value that
//! matches the stored one is not a change and must not be propagated.
//!
//! "Not known yet" is an explicit absence — the bridge has simply never
//! observed that attribute — and is distinct from any wire value.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::zone::{AttrValue, Switch};

/// Last-known state for a single zone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneRecord {
    pub volume: Option<f64>,
    pub mute: Option<Switch>,
    pub source: Option<String>,
    /// Stamped on every committed change to any attribute of this zone.
    pub updated_at: Option<DateTime<Utc>>,
}

impl ZoneRecord {
    /// All currently known values, in source/volume/mute order.
    pub fn known_values(&self) -> Vec<AttrValue> {
        let mut values = Vec::new();
        if let Some(ref source) = self.source {
            values.push(AttrValue::Source(source.clone()));
        }
        if let Some(volume) = self.volume {
            values.push(AttrValue::Volume(volume));
        }
        if let Some(mute) = self.mute {
            values.push(AttrValue::Mute(mute));
        }
        values
    }
}

/// Result of a compare-and-set against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The value differed and was committed.
    Changed,
    /// The value matched the stored one; nothing written.
    Unchanged,
    /// The zone is not configured; nothing written.
    UnknownZone,
}

/// Per-zone last-known values, keyed by configured display name.
#[derive(Debug)]
pub struct ZoneStore {
    zones: HashMap<String, ZoneRecord>,
}

impl ZoneStore {
    /// Build the store with one empty record per configured zone.
    pub fn new<I, S>(zone_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let zones = zone_names
            .into_iter()
            .map(|name| (name.into(), ZoneRecord::default()))
            .collect();
        Self { zones }
    }

    /// Compare-and-set one attribute of one zone.
    ///
    /// Commits and stamps the timestamp only when the value genuinely
    /// differs from the stored one.
    pub fn apply(&mut self, zone: &str, value: &AttrValue) -> Applied {
        let Some(record) = self.zones.get_mut(zone) else {
            return Applied::UnknownZone;
        };

        let changed = match value {
            AttrValue::Volume(v) => {
                if record.volume == Some(*v) {
                    false
                } else {
                    record.volume = Some(*v);
                    true
                }
            }
            AttrValue::Mute(m) => {
                if record.mute == Some(*m) {
                    false
                } else {
                    record.mute = Some(*m);
                    true
                }
            }
            AttrValue::Source(s) => {
                if record.source.as_deref() == Some(s.as_str()) {
                    false
                } else {
                    record.source = Some(s.clone());
                    true
                }
            }
        };

        if changed {
            record.updated_at = Some(Utc::now());
            Applied::Changed
        } else {
            Applied::Unchanged
        }
    }

    pub fn get(&self, zone: &str) -> Option<&ZoneRecord> {
        self.zones.get(zone)
    }

    /// Iterate all zones with their records.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ZoneRecord)> {
        self.zones.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Configured zone display names.
    pub fn zone_names(&self) -> impl Iterator<Item = &str> {
        self.zones.keys().map(String::as_str)
    }
}

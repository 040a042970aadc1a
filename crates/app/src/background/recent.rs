//! Bounded list of recently applied locations, newest first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on remembered locations.
pub const MAX_RECENT: usize = 8;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecentLocation {
    pub lat: f64,
    pub lng: f64,
    pub name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,
}

impl RecentLocation {
    /// An unnamed entry is labelled with its coordinates.
    pub fn new(lat: f64, lng: f64, name: Option<String>, ts: DateTime<Utc>) -> Self {
        let name = name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("{lat:.4}, {lng:.4}"));
        Self { lat, lng, name, ts }
    }

    fn dedup_key(&self) -> (String, String) {
        (format!("{:.4}", self.lat), format!("{:.4}", self.lng))
    }
}

/// Insert `entry` at the front, dropping any entry at the same rounded
/// coordinates and anything past [`MAX_RECENT`].
pub fn push_recent(list: &mut Vec<RecentLocation>, entry: RecentLocation) {
    let key = entry.dedup_key();
    list.retain(|existing| existing.dedup_key() != key);
    list.insert(0, entry);
    list.truncate(MAX_RECENT);
}

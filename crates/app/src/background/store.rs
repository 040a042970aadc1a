//! Canonical key/value store owned by the background actor.

use std::fmt;

use geo_core::{ConfigurationError, SpoofState, StatePatch};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::background::{
    persist::StateWriter,
    recent::{RecentLocation, push_recent},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreKey {
    SpoofEnabled,
    Latitude,
    Longitude,
    Accuracy,
    PresetName,
    UseCount,
    RecentLocations,
}

impl StoreKey {
    pub const ALL: [StoreKey; 7] = [
        StoreKey::SpoofEnabled,
        StoreKey::Latitude,
        StoreKey::Longitude,
        StoreKey::Accuracy,
        StoreKey::PresetName,
        StoreKey::UseCount,
        StoreKey::RecentLocations,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StoreKey::SpoofEnabled => "spoofEnabled",
            StoreKey::Latitude => "latitude",
            StoreKey::Longitude => "longitude",
            StoreKey::Accuracy => "accuracy",
            StoreKey::PresetName => "presetName",
            StoreKey::UseCount => "useCount",
            StoreKey::RecentLocations => "recentLocations",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == raw)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Everything the store persists: the spoof record plus peripheral keys.
pub struct StoreData {
    #[serde(flatten)]
    pub spoof: SpoofState,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default)]
    pub recent_locations: Vec<RecentLocation>,
}

#[derive(Clone, Debug, PartialEq)]
/// A committed write, handed to change listeners.
pub struct StateChange {
    pub old: SpoofState,
    pub new: SpoofState,
    pub changed: Vec<StoreKey>,
}

impl StateChange {
    fn between(old: SpoofState, new: SpoofState) -> Self {
        let mut changed = Vec::new();
        if old.enabled != new.enabled {
            changed.push(StoreKey::SpoofEnabled);
        }
        if old.latitude != new.latitude {
            changed.push(StoreKey::Latitude);
        }
        if old.longitude != new.longitude {
            changed.push(StoreKey::Longitude);
        }
        if old.accuracy != new.accuracy {
            changed.push(StoreKey::Accuracy);
        }
        if old.preset_label != new.preset_label {
            changed.push(StoreKey::PresetName);
        }
        Self { old, new, changed }
    }
}

type ChangeListener = Box<dyn FnMut(&StateChange) + Send>;

pub struct Store {
    data: StoreData,
    listeners: Vec<ChangeListener>,
    writer: Option<StateWriter>,
}

impl Store {
    pub fn new(data: StoreData) -> Self {
        Self {
            data,
            listeners: Vec::new(),
            writer: None,
        }
    }

    pub(crate) fn with_writer(mut self, writer: StateWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn state(&self) -> &SpoofState {
        &self.data.spoof
    }

    pub fn data(&self) -> &StoreData {
        &self.data
    }

    /// Values for `keys`. Every key always has a value, defaults included.
    pub fn get(&self, keys: &[StoreKey]) -> Map<String, Value> {
        let all = match serde_json::to_value(&self.data) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        keys.iter()
            .filter_map(|key| {
                all.get(key.as_str())
                    .map(|value| (key.as_str().to_string(), value.clone()))
            })
            .collect()
    }

    /// Merge `patch` into the spoof record. Nothing is committed when the
    /// merged record is invalid.
    pub fn set(&mut self, patch: &StatePatch) -> Result<StateChange, ConfigurationError> {
        let next = self.data.spoof.apply(patch)?;
        let old = std::mem::replace(&mut self.data.spoof, next);
        let change = StateChange::between(old, self.data.spoof.clone());
        debug!(changed = ?change.changed, "store committed");
        for listener in &mut self.listeners {
            listener(&change);
        }
        self.persist();
        Ok(change)
    }

    /// Register a listener run synchronously after every committed `set`.
    pub fn on_change<F>(&mut self, listener: F)
    where
        F: FnMut(&StateChange) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn record_recent(&mut self, entry: RecentLocation) {
        push_recent(&mut self.data.recent_locations, entry);
        self.persist();
    }

    pub fn remove_recent(&mut self, index: usize) -> bool {
        if index >= self.data.recent_locations.len() {
            return false;
        }
        self.data.recent_locations.remove(index);
        self.persist();
        true
    }

    pub fn clear_recent(&mut self) {
        self.data.recent_locations.clear();
        self.persist();
    }

    pub fn bump_use_count(&mut self) -> u64 {
        self.data.use_count = self.data.use_count.saturating_add(1);
        self.persist();
        self.data.use_count
    }

    fn persist(&self) {
        if let Some(writer) = &self.writer {
            writer.save(self.data.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::Utc;

    use super::*;

    #[test]
    fn get_returns_defaults_for_every_key() {
        let store = Store::new(StoreData::default());
        let values = store.get(&StoreKey::ALL);
        assert_eq!(values.len(), StoreKey::ALL.len());
        assert_eq!(values["spoofEnabled"], Value::Bool(false));
        assert_eq!(values["presetName"], "Paris");
        assert_eq!(values["useCount"], 0);
        assert_eq!(values["recentLocations"], Value::Array(vec![]));
    }

    #[test]
    fn set_reports_changed_keys_to_listeners() {
        let mut store = Store::new(StoreData::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.on_change(move |change| sink.lock().unwrap().push(change.clone()));

        let change = store
            .set(&StatePatch {
                enabled: Some(true),
                latitude: Some(35.6762),
                ..StatePatch::default()
            })
            .unwrap();
        assert_eq!(change.changed, [StoreKey::SpoofEnabled, StoreKey::Latitude]);
        assert!(!change.old.enabled);
        assert!(change.new.enabled);
        assert_eq!(seen.lock().unwrap().as_slice(), [change]);
    }

    #[test]
    fn rejected_set_commits_nothing_and_notifies_nobody() {
        let mut store = Store::new(StoreData::default());
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        store.on_change(move |_| *counter.lock().unwrap() += 1);

        let err = store
            .set(&StatePatch {
                enabled: Some(true),
                longitude: Some(181.0),
                ..StatePatch::default()
            })
            .unwrap_err();
        assert_eq!(err, ConfigurationError::Longitude(181.0));
        assert_eq!(store.state(), &SpoofState::default());
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn peripheral_keys() {
        let mut store = Store::new(StoreData::default());
        assert_eq!(store.bump_use_count(), 1);
        assert_eq!(store.bump_use_count(), 2);

        store.record_recent(RecentLocation::new(1.0, 2.0, None, Utc::now()));
        store.record_recent(RecentLocation::new(3.0, 4.0, Some("B".into()), Utc::now()));
        assert_eq!(store.data().recent_locations[0].name, "B");
        assert!(store.remove_recent(0));
        assert!(!store.remove_recent(5));
        assert_eq!(store.data().recent_locations.len(), 1);
        store.clear_recent();
        assert!(store.data().recent_locations.is_empty());
    }

    #[test]
    fn key_names_round_trip() {
        for key in StoreKey::ALL {
            assert_eq!(StoreKey::parse(key.as_str()), Some(key));
            assert_eq!(serde_json::to_value(key).unwrap(), key.as_str());
        }
        assert_eq!(StoreKey::parse("theme"), None);
    }

    #[test]
    fn data_serialises_with_flat_store_keys() {
        let json = serde_json::to_value(StoreData::default()).unwrap();
        let object = json.as_object().unwrap();
        for key in StoreKey::ALL {
            assert!(object.contains_key(key.as_str()), "missing {key}");
        }
    }
}

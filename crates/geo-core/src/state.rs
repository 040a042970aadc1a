//! The canonical spoof record and its validation rules.
//!
//! `SpoofState` is the single value every realm mirrors. Writers never assign
//! it directly: they describe the fields they want to change with a
//! `StatePatch` and go through [`SpoofState::apply`], which validates the
//! merged result before anything is committed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Latitude used until the user picks a location.
pub const DEFAULT_LATITUDE: f64 = 48.8566;
/// Longitude used until the user picks a location.
pub const DEFAULT_LONGITUDE: f64 = 2.3522;
/// Reported accuracy radius in metres.
pub const DEFAULT_ACCURACY_M: f64 = 10.0;
/// Label shown alongside the default coordinate.
pub const DEFAULT_PRESET: &str = "Paris";

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
/// A latitude/longitude pair in degrees.
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Reject NaN, infinities and out-of-range degrees.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ConfigurationError::Latitude(self.latitude));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ConfigurationError::Longitude(self.longitude));
        }
        Ok(())
    }
}

/// Input rejected before it could reach the canonical state.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("latitude {0} is outside [-90, 90]")]
    Latitude(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    Longitude(f64),
    #[error("accuracy {0} must be a positive number of metres")]
    Accuracy(f64),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
/// Fake-position record shared by all realms.
///
/// Field names on the wire match the store keys (`spoofEnabled`,
/// `latitude`, `longitude`, `accuracy`, `presetName`). Missing keys decode to
/// the safe defaults.
pub struct SpoofState {
    #[serde(rename = "spoofEnabled")]
    pub enabled: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    #[serde(rename = "presetName")]
    pub preset_label: String,
}

impl Default for SpoofState {
    fn default() -> Self {
        Self {
            enabled: false,
            latitude: DEFAULT_LATITUDE,
            longitude: DEFAULT_LONGITUDE,
            accuracy: DEFAULT_ACCURACY_M,
            preset_label: DEFAULT_PRESET.to_string(),
        }
    }
}

impl SpoofState {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.coordinate().validate()?;
        if !(self.accuracy > 0.0 && self.accuracy.is_finite()) {
            return Err(ConfigurationError::Accuracy(self.accuracy));
        }
        Ok(())
    }

    /// Overlay the fields named by `patch` without validating the result.
    pub fn merged(&self, patch: &StatePatch) -> Self {
        Self {
            enabled: patch.enabled.unwrap_or(self.enabled),
            latitude: patch.latitude.unwrap_or(self.latitude),
            longitude: patch.longitude.unwrap_or(self.longitude),
            accuracy: patch.accuracy.unwrap_or(self.accuracy),
            preset_label: patch
                .preset_label
                .clone()
                .unwrap_or_else(|| self.preset_label.clone()),
        }
    }

    /// Merge `patch` and validate the outcome; `self` is left untouched on error.
    pub fn apply(&self, patch: &StatePatch) -> Result<Self, ConfigurationError> {
        let next = self.merged(patch);
        next.validate()?;
        Ok(next)
    }

    /// Build a full state from a possibly sparse patch, defaulting the rest.
    pub fn from_patch(patch: &StatePatch) -> Self {
        Self::default().merged(patch)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Partial update to a `SpoofState`; only the fields present are merged.
pub struct StatePatch {
    #[serde(
        rename = "spoofEnabled",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(
        rename = "presetName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub preset_label: Option<String>,
}

impl StatePatch {
    /// Patch that only flips the enabled flag.
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_none()
            && self.latitude.is_none()
            && self.longitude.is_none()
            && self.accuracy.is_none()
            && self.preset_label.is_none()
    }
}

impl From<&SpoofState> for StatePatch {
    fn from(state: &SpoofState) -> Self {
        Self {
            enabled: Some(state.enabled),
            latitude: Some(state.latitude),
            longitude: Some(state.longitude),
            accuracy: Some(state.accuracy),
            preset_label: Some(state.preset_label.clone()),
        }
    }
}

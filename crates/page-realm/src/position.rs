//! Position records and callback types mirroring the geolocation API surface.

use std::{fmt, time::Duration};

use geo_core::SpoofState;
use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionCoords {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub altitude: Option<f64>,
    pub altitude_accuracy: Option<f64>,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Position {
    pub coords: PositionCoords,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Position {
    /// Build a position from the spoof record. Altitude, heading and speed are
    /// reported as unavailable.
    pub fn from_state(state: &SpoofState, timestamp: i64) -> Self {
        Self {
            coords: PositionCoords {
                latitude: state.latitude,
                longitude: state.longitude,
                accuracy: state.accuracy,
                altitude: None,
                altitude_accuracy: None,
                heading: None,
                speed: None,
            },
            timestamp,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(u16)]
pub enum PositionErrorCode {
    PermissionDenied = 1,
    PositionUnavailable = 2,
    Timeout = 3,
}

impl fmt::Display for PositionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PositionErrorCode::PermissionDenied => "PERMISSION_DENIED",
            PositionErrorCode::PositionUnavailable => "POSITION_UNAVAILABLE",
            PositionErrorCode::Timeout => "TIMEOUT",
        };
        write!(f, "{label}({})", *self as u16)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[error("{code}: {message}")]
pub struct PositionError {
    pub code: PositionErrorCode,
    pub message: String,
}

impl PositionError {
    pub fn new(code: PositionErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Synthetic error reported when a success handler blows up.
    pub fn internal(detail: &str) -> Self {
        Self::new(
            PositionErrorCode::PositionUnavailable,
            format!("Relocate internal error: {detail}"),
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Request options; forwarded untouched to the real sensor.
pub struct PositionOptions {
    pub enable_high_accuracy: bool,
    pub timeout: Option<Duration>,
    pub maximum_age: Option<Duration>,
}

pub type SuccessCallback = Box<dyn FnMut(Position) + Send>;
pub type ErrorCallback = Box<dyn FnMut(PositionError) + Send>;

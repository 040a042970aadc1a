//! The page's real geolocation sensor, seen through a trait so the provider can
//! delegate to it unchanged.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::position::{
    ErrorCallback, PositionError, PositionErrorCode, PositionOptions, SuccessCallback,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeWatchId(pub u64);

/// The browser-provided geolocation implementation.
pub trait NativeGeolocation: Send + Sync {
    fn get_current_position(
        &self,
        on_success: SuccessCallback,
        on_error: Option<ErrorCallback>,
        options: PositionOptions,
    );

    fn watch_position(
        &self,
        on_success: SuccessCallback,
        on_error: Option<ErrorCallback>,
        options: PositionOptions,
    ) -> NativeWatchId;

    fn clear_watch(&self, id: NativeWatchId);
}

/// Sensor of a headless page: it never has a fix.
#[derive(Default)]
pub struct UnavailableSensor {
    next_watch: AtomicU64,
}

impl UnavailableSensor {
    fn fail(on_error: Option<ErrorCallback>) {
        if let Some(mut on_error) = on_error {
            on_error(PositionError::new(
                PositionErrorCode::PositionUnavailable,
                "no position source available",
            ));
        }
    }
}

impl NativeGeolocation for UnavailableSensor {
    fn get_current_position(
        &self,
        _on_success: SuccessCallback,
        on_error: Option<ErrorCallback>,
        _options: PositionOptions,
    ) {
        Self::fail(on_error);
    }

    fn watch_position(
        &self,
        _on_success: SuccessCallback,
        on_error: Option<ErrorCallback>,
        _options: PositionOptions,
    ) -> NativeWatchId {
        Self::fail(on_error);
        NativeWatchId(self.next_watch.fetch_add(1, Ordering::Relaxed))
    }

    fn clear_watch(&self, _id: NativeWatchId) {}
}

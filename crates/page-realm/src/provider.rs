//! Geolocation provider installed into the page realm.
//!
//! [`Geolocation`] stands in for the page's geolocation object. On every call
//! it consults the page's copy of the spoof state and picks either the real
//! sensor or the spoofed provider; the choice is never cached, so a toggle
//! between two calls is always observed.
//!
//! Spoofed watches re-check the flag on every redelivery. Once spoofing is
//! switched off the watch stops its timer and hands the same callbacks over to
//! a native watch, so the caller's handle stays valid for `clear_watch`.

use std::{
    any::Any,
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, MutexGuard, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use geo_core::{ConfigurationError, SpoofState, StatePatch};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, warn};

use crate::{
    position::{ErrorCallback, Position, PositionError, PositionOptions, SuccessCallback},
    sensor::{NativeGeolocation, NativeWatchId},
    window::{PageWindow, STATE_ATTR, SYNC_EVENT},
};

/// Simulated sensor latency for one-shot spoofed requests.
pub const SPOOF_LATENCY: Duration = Duration::from_millis(50);
/// Redelivery period of a spoofed watch.
pub const WATCH_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("malformed sync payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("sync payload rejected: {0}")]
    Rejected(#[from] ConfigurationError),
}

#[derive(Clone, Default)]
/// The page realm's private copy of the spoof state.
pub struct PageState {
    inner: Arc<RwLock<SpoofState>>,
}

impl PageState {
    pub fn snapshot(&self) -> SpoofState {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.snapshot().enabled
    }

    /// Merge a serialized snapshot or patch into the local copy.
    pub fn merge_payload(&self, payload: &str) -> Result<(), SyncError> {
        let patch: StatePatch = serde_json::from_str(payload)?;
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = guard.apply(&patch)?;
        *guard = next;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum WatchKind {
    Native(NativeWatchId),
    Spoofed(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Opaque cancellation handle returned by `watch_position`.
pub struct WatchHandle(WatchKind);

/// Page-facing geolocation object.
pub struct Geolocation {
    state: PageState,
    native: Arc<dyn NativeGeolocation>,
    spoofed: SpoofedProvider,
}

enum ActiveProvider<'a> {
    Real(&'a dyn NativeGeolocation),
    Spoofed(&'a SpoofedProvider),
}

impl Geolocation {
    /// Install the provider into `window`.
    ///
    /// The snapshot attribute is read immediately, in case the relay already
    /// synced before the page script started; afterwards the provider follows
    /// the sync event. Must be called from within a tokio runtime.
    pub fn install(window: &PageWindow, native: Arc<dyn NativeGeolocation>) -> Self {
        let state = PageState::default();
        if let Some(raw) = window.attribute(STATE_ATTR) {
            if let Err(err) = state.merge_payload(&raw) {
                debug!(%err, "ignoring initial snapshot attribute");
            }
        }

        let listener_state = state.clone();
        window.add_event_listener(SYNC_EVENT, move |detail| {
            if let Err(err) = listener_state.merge_payload(detail) {
                debug!(%err, "ignoring sync event");
            }
        });

        let spoofed = SpoofedProvider {
            state: state.clone(),
            native: Arc::clone(&native),
            runtime: Handle::current(),
            watches: Arc::new(Mutex::new(HashMap::new())),
            next_watch: AtomicU64::new(1),
        };

        Self {
            state,
            native,
            spoofed,
        }
    }

    pub fn state(&self) -> &PageState {
        &self.state
    }

    fn provider(&self) -> ActiveProvider<'_> {
        if self.state.is_enabled() {
            ActiveProvider::Spoofed(&self.spoofed)
        } else {
            ActiveProvider::Real(self.native.as_ref())
        }
    }

    pub fn get_current_position(
        &self,
        on_success: SuccessCallback,
        on_error: Option<ErrorCallback>,
        options: PositionOptions,
    ) {
        match self.provider() {
            ActiveProvider::Real(native) => {
                native.get_current_position(on_success, on_error, options)
            }
            ActiveProvider::Spoofed(spoofed) => spoofed.get_current_position(on_success, on_error),
        }
    }

    pub fn watch_position(
        &self,
        on_success: SuccessCallback,
        on_error: Option<ErrorCallback>,
        options: PositionOptions,
    ) -> WatchHandle {
        match self.provider() {
            ActiveProvider::Real(native) => WatchHandle(WatchKind::Native(native.watch_position(
                on_success, on_error, options,
            ))),
            ActiveProvider::Spoofed(spoofed) => WatchHandle(WatchKind::Spoofed(
                spoofed.watch_position(on_success, on_error, options),
            )),
        }
    }

    /// Cancel a watch, whichever provider issued it.
    pub fn clear_watch(&self, handle: WatchHandle) {
        match handle.0 {
            WatchKind::Native(id) => self.native.clear_watch(id),
            WatchKind::Spoofed(id) => self.spoofed.clear_watch(id),
        }
    }
}

enum WatchSlot {
    Timer(JoinHandle<()>),
    Native(NativeWatchId),
}

type WatchTable = Arc<Mutex<HashMap<u64, WatchSlot>>>;

fn lock_table(table: &WatchTable) -> MutexGuard<'_, HashMap<u64, WatchSlot>> {
    match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct SpoofedProvider {
    state: PageState,
    native: Arc<dyn NativeGeolocation>,
    runtime: Handle,
    watches: WatchTable,
    next_watch: AtomicU64,
}

impl SpoofedProvider {
    fn get_current_position(&self, mut on_success: SuccessCallback, mut on_error: Option<ErrorCallback>) {
        let state = self.state.clone();
        self.runtime.spawn(async move {
            time::sleep(SPOOF_LATENCY).await;
            deliver(&state.snapshot(), &mut on_success, on_error.as_mut());
        });
    }

    fn watch_position(
        &self,
        mut on_success: SuccessCallback,
        mut on_error: Option<ErrorCallback>,
        options: PositionOptions,
    ) -> u64 {
        let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
        deliver(&self.state.snapshot(), &mut on_success, on_error.as_mut());

        let watch = SpoofedWatch {
            id,
            state: self.state.clone(),
            native: Arc::clone(&self.native),
            watches: Arc::clone(&self.watches),
            on_success,
            on_error,
            options,
        };
        // Insert under the lock so the task never observes a missing slot.
        let mut table = lock_table(&self.watches);
        let task = self.runtime.spawn(watch.run());
        table.insert(id, WatchSlot::Timer(task));
        id
    }

    fn clear_watch(&self, id: u64) {
        let slot = lock_table(&self.watches).remove(&id);
        match slot {
            Some(WatchSlot::Timer(task)) => task.abort(),
            Some(WatchSlot::Native(native_id)) => self.native.clear_watch(native_id),
            None => {}
        }
    }
}

struct SpoofedWatch {
    id: u64,
    state: PageState,
    native: Arc<dyn NativeGeolocation>,
    watches: WatchTable,
    on_success: SuccessCallback,
    on_error: Option<ErrorCallback>,
    options: PositionOptions,
}

impl SpoofedWatch {
    async fn run(mut self) {
        let mut ticker = time::interval_at(Instant::now() + WATCH_PERIOD, WATCH_PERIOD);
        loop {
            ticker.tick().await;
            let snapshot = self.state.snapshot();
            if !snapshot.enabled {
                self.hand_over();
                return;
            }
            deliver(&snapshot, &mut self.on_success, self.on_error.as_mut());
        }
    }

    fn hand_over(self) {
        let SpoofedWatch {
            id,
            native,
            watches,
            on_success,
            on_error,
            options,
            ..
        } = self;
        if !lock_table(&watches).contains_key(&id) {
            return;
        }

        let native_id = native.watch_position(on_success, on_error, options);
        let mut table = lock_table(&watches);
        match table.get_mut(&id) {
            Some(slot) => {
                *slot = WatchSlot::Native(native_id);
                debug!(watch = id, "spoofing disabled mid-watch; following the real sensor");
            }
            None => {
                drop(table);
                native.clear_watch(native_id);
            }
        }
    }
}

/// Invoke `on_success` with a position built from `state`, converting a panic
/// in the handler into a synthetic sensor error.
fn deliver(state: &SpoofState, on_success: &mut SuccessCallback, on_error: Option<&mut ErrorCallback>) {
    let position = Position::from_state(state, Utc::now().timestamp_millis());
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| on_success(position))) {
        let detail = panic_message(payload.as_ref());
        warn!(%detail, "geolocation success handler panicked");
        if let Some(on_error) = on_error {
            on_error(PositionError::internal(&detail));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "success handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::PositionErrorCode;

    const REAL: (f64, f64) = (1.5, 2.5);

    #[derive(Debug, PartialEq)]
    enum Call {
        Get(PositionOptions),
        Watch(NativeWatchId),
        Clear(NativeWatchId),
    }

    /// Real sensor stand-in: answers one-shot requests synchronously and
    /// remembers watch callbacks.
    #[derive(Default)]
    struct RecordingSensor {
        calls: Mutex<Vec<Call>>,
        watchers: Mutex<Vec<SuccessCallback>>,
        next: AtomicU64,
    }

    impl RecordingSensor {
        fn real_position() -> Position {
            Position::from_state(
                &SpoofState {
                    latitude: REAL.0,
                    longitude: REAL.1,
                    ..SpoofState::default()
                },
                0,
            )
        }
    }

    impl NativeGeolocation for RecordingSensor {
        fn get_current_position(
            &self,
            mut on_success: SuccessCallback,
            _on_error: Option<ErrorCallback>,
            options: PositionOptions,
        ) {
            self.calls.lock().unwrap().push(Call::Get(options));
            on_success(Self::real_position());
        }

        fn watch_position(
            &self,
            on_success: SuccessCallback,
            _on_error: Option<ErrorCallback>,
            _options: PositionOptions,
        ) -> NativeWatchId {
            let id = NativeWatchId(self.next.fetch_add(1, Ordering::Relaxed));
            self.calls.lock().unwrap().push(Call::Watch(id));
            self.watchers.lock().unwrap().push(on_success);
            id
        }

        fn clear_watch(&self, id: NativeWatchId) {
            self.calls.lock().unwrap().push(Call::Clear(id));
        }
    }

    fn collector() -> (Arc<Mutex<Vec<Position>>>, SuccessCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Box::new(move |p: Position| sink.lock().unwrap().push(p)))
    }

    fn error_collector() -> (Arc<Mutex<Vec<PositionError>>>, ErrorCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Box::new(move |e: PositionError| sink.lock().unwrap().push(e)))
    }

    fn enabled_payload(lat: f64, lon: f64, accuracy: f64) -> String {
        format!(r#"{{"spoofEnabled":true,"latitude":{lat},"longitude":{lon},"accuracy":{accuracy}}}"#)
    }

    fn setup(initial: Option<String>) -> (Arc<PageWindow>, Arc<RecordingSensor>, Geolocation) {
        let window = PageWindow::new();
        if let Some(raw) = initial {
            window.set_attribute(STATE_ATTR, raw);
        }
        let sensor = Arc::new(RecordingSensor::default());
        let geo = Geolocation::install(&window, sensor.clone());
        (window, sensor, geo)
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_calls_go_straight_to_the_real_sensor() {
        let (_window, sensor, geo) = setup(None);
        let options = PositionOptions {
            enable_high_accuracy: true,
            timeout: Some(Duration::from_secs(8)),
            maximum_age: Some(Duration::ZERO),
        };

        for _ in 0..2 {
            let (seen, on_success) = collector();
            geo.get_current_position(on_success, None, options);
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1, "delegation is synchronous");
            assert_eq!(seen[0].coords.latitude, REAL.0);
        }
        assert_eq!(
            *sensor.calls.lock().unwrap(),
            vec![Call::Get(options), Call::Get(options)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn enabled_state_reads_back_exactly_after_the_simulated_latency() {
        let (_window, sensor, geo) = setup(Some(enabled_payload(48.8566, 2.3522, 10.0)));

        let (seen, on_success) = collector();
        geo.get_current_position(on_success, None, PositionOptions::default());
        time::sleep(SPOOF_LATENCY / 2).await;
        assert!(seen.lock().unwrap().is_empty());

        time::sleep(SPOOF_LATENCY).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let coords = &seen[0].coords;
        assert_eq!(coords.latitude, 48.8566);
        assert_eq!(coords.longitude, 2.3522);
        assert_eq!(coords.accuracy, 10.0);
        assert_eq!(coords.altitude, None);
        assert!(sensor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_calls_have_non_decreasing_timestamps() {
        let (_window, _sensor, geo) = setup(Some(enabled_payload(10.0, 20.0, 5.0)));
        let (seen, _) = collector();
        for _ in 0..4 {
            let sink = Arc::clone(&seen);
            geo.get_current_position(
                Box::new(move |p: Position| sink.lock().unwrap().push(p)),
                None,
                PositionOptions::default(),
            );
            time::sleep(SPOOF_LATENCY * 2).await;
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test(start_paused = true)]
    async fn toggling_between_calls_is_observed() {
        let (window, sensor, geo) = setup(None);

        window.dispatch_event(SYNC_EVENT, &enabled_payload(35.0, 139.0, 5.0));
        let (spoofed, on_success) = collector();
        geo.get_current_position(on_success, None, PositionOptions::default());
        time::sleep(SPOOF_LATENCY * 2).await;
        assert_eq!(spoofed.lock().unwrap()[0].coords.latitude, 35.0);

        window.dispatch_event(SYNC_EVENT, r#"{"spoofEnabled":false}"#);
        let (real, on_success) = collector();
        geo.get_current_position(on_success, None, PositionOptions::default());
        assert_eq!(real.lock().unwrap()[0].coords.latitude, REAL.0);
        assert_eq!(sensor.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_install_picks_up_the_attribute_written_before_it() {
        let (_window, _sensor, geo) = setup(Some(enabled_payload(-33.8688, 151.2093, 7.0)));
        let state = geo.state().snapshot();
        assert!(state.enabled);
        assert_eq!(state.latitude, -33.8688);
        assert_eq!(state.accuracy, 7.0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_or_invalid_sync_payloads_are_ignored() {
        let (window, _sensor, geo) = setup(Some(enabled_payload(1.0, 2.0, 3.0)));
        window.dispatch_event(SYNC_EVENT, "not json");
        window.dispatch_event(SYNC_EVENT, r#"{"latitude":123.0}"#);
        let state = geo.state().snapshot();
        assert_eq!(state.latitude, 1.0);
        assert!(state.enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_delivers_immediately_then_every_two_seconds_until_cleared() {
        let (_window, _sensor, geo) = setup(Some(enabled_payload(10.0, 10.0, 10.0)));
        let (seen, on_success) = collector();
        let handle = geo.watch_position(on_success, None, PositionOptions::default());
        assert_eq!(seen.lock().unwrap().len(), 1);

        time::sleep(WATCH_PERIOD + Duration::from_millis(10)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
        time::sleep(WATCH_PERIOD).await;
        assert_eq!(seen.lock().unwrap().len(), 3);

        geo.clear_watch(handle);
        time::sleep(WATCH_PERIOD * 3).await;
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_follows_state_updates_between_deliveries() {
        let (window, _sensor, geo) = setup(Some(enabled_payload(10.0, 10.0, 10.0)));
        let (seen, on_success) = collector();
        let _handle = geo.watch_position(on_success, None, PositionOptions::default());

        window.dispatch_event(SYNC_EVENT, &enabled_payload(11.0, 12.0, 10.0));
        time::sleep(WATCH_PERIOD + Duration::from_millis(10)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen[1].coords.latitude, 11.0);
        assert_eq!(seen[1].coords.longitude, 12.0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_success_handler_becomes_an_internal_error() {
        let (_window, _sensor, geo) = setup(Some(enabled_payload(10.0, 10.0, 10.0)));
        let (errors, on_error) = error_collector();
        geo.get_current_position(
            Box::new(|_: Position| panic!("handler exploded")),
            Some(on_error),
            PositionOptions::default(),
        );
        time::sleep(SPOOF_LATENCY * 2).await;

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, PositionErrorCode::PositionUnavailable);
        assert!(errors[0].message.contains("handler exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_without_error_callback_is_swallowed() {
        let (_window, _sensor, geo) = setup(Some(enabled_payload(10.0, 10.0, 10.0)));
        let handle = geo.watch_position(
            Box::new(|_: Position| panic!("still exploding")),
            None,
            PositionOptions::default(),
        );
        time::sleep(WATCH_PERIOD * 2 + Duration::from_millis(10)).await;
        geo.clear_watch(handle);
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_mid_watch_hands_over_to_the_real_sensor() {
        let (window, sensor, geo) = setup(Some(enabled_payload(10.0, 10.0, 10.0)));
        let (seen, on_success) = collector();
        let handle = geo.watch_position(on_success, None, PositionOptions::default());
        assert_eq!(seen.lock().unwrap().len(), 1);

        window.dispatch_event(SYNC_EVENT, r#"{"spoofEnabled":false}"#);
        time::sleep(WATCH_PERIOD + Duration::from_millis(10)).await;

        // No further spoofed delivery; the real sensor now owns the callbacks.
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(
            *sensor.calls.lock().unwrap(),
            vec![Call::Watch(NativeWatchId(0))]
        );
        for callback in sensor.watchers.lock().unwrap().iter_mut() {
            callback(RecordingSensor::real_position());
        }
        assert_eq!(seen.lock().unwrap()[1].coords.latitude, REAL.0);

        geo.clear_watch(handle);
        assert_eq!(
            sensor.calls.lock().unwrap().last(),
            Some(&Call::Clear(NativeWatchId(0)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn handles_remember_their_provider() {
        let (window, sensor, geo) = setup(None);
        let (_seen, on_success) = collector();
        let native = geo.watch_position(on_success, None, PositionOptions::default());

        window.dispatch_event(SYNC_EVENT, &enabled_payload(1.0, 1.0, 1.0));
        geo.clear_watch(native);
        assert_eq!(
            sensor.calls.lock().unwrap().last(),
            Some(&Call::Clear(NativeWatchId(0)))
        );
    }
}

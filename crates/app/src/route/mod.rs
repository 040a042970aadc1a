//! Route simulation: fetch a path for a list of waypoints and walk a fake
//! position along it once per second.
//!
//! ```text
//! Idle -> Fetching -> Running <-> Paused -> Completed | Stopped
//! ```
//!
//! Every run, resume, pause and stop bumps a generation counter. The ticker
//! task carries the generation it was started with and quietly exits once it
//! no longer matches, so a superseded run can never write a position.

pub mod cursor;
pub mod osrm;

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use geo_core::{ConfigurationError, Coordinate, Message, RuntimeSender, StatePatch};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{Instrument, debug, info, info_span, warn};

pub use cursor::RouteCursor;
pub use osrm::{OsrmClient, RoutingService};

pub const TICK_PERIOD: Duration = Duration::from_secs(1);
/// Preset label written with every simulated position.
pub const ROUTE_LABEL: &str = "Route Simulation";
pub const ROUTE_ACCURACY_M: f64 = 10.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TravelMode {
    #[default]
    Driving,
    Walking,
    /// Routes like driving; only the speed differs.
    Custom,
}

impl TravelMode {
    pub fn default_speed_kmh(self) -> Option<f64> {
        match self {
            TravelMode::Driving => Some(50.0),
            TravelMode::Walking => Some(5.0),
            TravelMode::Custom => None,
        }
    }

    pub(crate) fn osrm_profile(self) -> &'static str {
        match self {
            TravelMode::Walking => "foot",
            TravelMode::Driving | TravelMode::Custom => "driving",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    /// Waypoints are reversed before the path is requested.
    Backward,
    /// Forward order, bouncing between the ends forever.
    Loop,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub label: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    pub waypoints: Vec<Waypoint>,
    #[serde(default)]
    pub mode: TravelMode,
    #[serde(default)]
    pub direction: Direction,
    /// Overrides the mode's default speed; required for `custom`.
    #[serde(default)]
    pub speed_kmh: Option<f64>,
}

impl RouteRequest {
    fn resolve(&self) -> Result<RunPlan, RouteError> {
        if self.waypoints.len() < 2 {
            return Err(RouteError::TooFewWaypoints(self.waypoints.len()));
        }
        let mut coordinates = self
            .waypoints
            .iter()
            .map(|waypoint| {
                let point = Coordinate::new(waypoint.latitude, waypoint.longitude);
                point.validate().map(|()| point)
            })
            .collect::<Result<Vec<_>, _>>()?;
        if self.direction == Direction::Backward {
            coordinates.reverse();
        }

        let speed_kmh = self
            .speed_kmh
            .or(self.mode.default_speed_kmh())
            .ok_or(RouteError::MissingSpeed)?;
        if !(speed_kmh.is_finite() && speed_kmh >= 0.0) {
            return Err(RouteError::InvalidSpeed(speed_kmh));
        }

        Ok(RunPlan {
            waypoints: coordinates,
            mode: self.mode,
            direction: self.direction,
            speed_kmh,
        })
    }
}

#[derive(Clone, Debug)]
struct RunPlan {
    waypoints: Vec<Coordinate>,
    mode: TravelMode,
    direction: Direction,
    speed_kmh: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePhase {
    #[default]
    Idle,
    Fetching,
    Running,
    Paused,
    Completed,
    Stopped,
}

impl fmt::Display for RoutePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RoutePhase::Idle => "idle",
            RoutePhase::Fetching => "fetching",
            RoutePhase::Running => "running",
            RoutePhase::Paused => "paused",
            RoutePhase::Completed => "completed",
            RoutePhase::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("a route needs at least 2 waypoints, got {0}")]
    TooFewWaypoints(usize),
    #[error(transparent)]
    Waypoint(#[from] ConfigurationError),
    #[error("custom travel mode needs an explicit speed")]
    MissingSpeed,
    #[error("speed {0} km/h must be a finite, non-negative number")]
    InvalidSpeed(f64),
    #[error("could not find a route: {0}")]
    Routing(String),
    #[error("cannot {action} a route that is {phase}")]
    Transition {
        action: &'static str,
        phase: RoutePhase,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    pub phase: RoutePhase,
    pub progress: u8,
    pub index: usize,
    pub points: usize,
    pub position: Option<Coordinate>,
    /// Heading back towards the first point of a looping run.
    pub reversing: bool,
    pub mode: Option<TravelMode>,
    pub direction: Option<Direction>,
    pub speed_kmh: Option<f64>,
    pub last_error: Option<String>,
}

/// Where simulated positions go.
pub trait PositionSink: Send + Sync + 'static {
    fn publish(&self, point: Coordinate);
}

/// State written for a simulated position.
pub fn route_patch(point: Coordinate) -> StatePatch {
    StatePatch {
        enabled: Some(true),
        latitude: Some(point.latitude),
        longitude: Some(point.longitude),
        accuracy: Some(ROUTE_ACCURACY_M),
        preset_label: Some(ROUTE_LABEL.to_string()),
    }
}

impl PositionSink for RuntimeSender {
    fn publish(&self, point: Coordinate) {
        if !self.post(Message::StateChanged(route_patch(point))) {
            warn!("background closed; dropping simulated position");
        }
    }
}

struct ActiveRun {
    cursor: RouteCursor,
    mode: TravelMode,
    direction: Direction,
    speed_kmh: f64,
}

#[derive(Default)]
struct RunState {
    phase: RoutePhase,
    generation: u64,
    run: Option<ActiveRun>,
    plan: Option<RunPlan>,
    task: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

impl RunState {
    /// Invalidate whatever task is running and return the new generation.
    fn supersede(&mut self) -> u64 {
        self.generation += 1;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation
    }
}

struct EngineInner<S, P> {
    service: S,
    sink: P,
    runtime: Handle,
    state: Mutex<RunState>,
}

/// Route simulator. Cheap to clone; clones share the same run.
pub struct RouteEngine<S, P> {
    inner: Arc<EngineInner<S, P>>,
}

impl<S, P> Clone for RouteEngine<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: RoutingService, P: PositionSink> RouteEngine<S, P> {
    /// Must be called from within a tokio runtime; ticks run on it.
    pub fn new(service: S, sink: P) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                service,
                sink,
                runtime: Handle::current(),
                state: Mutex::new(RunState::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Begin a new run, superseding any run in progress.
    pub fn start(&self, request: &RouteRequest) -> Result<RouteStatus, RouteError> {
        let plan = request.resolve()?;
        let mut state = self.lock();
        let generation = state.supersede();
        state.phase = RoutePhase::Fetching;
        state.run = None;
        state.last_error = None;
        state.plan = Some(plan.clone());

        info!(
            generation,
            waypoints = plan.waypoints.len(),
            mode = ?plan.mode,
            direction = ?plan.direction,
            speed_kmh = plan.speed_kmh,
            "route requested"
        );
        let engine = self.clone();
        let span = info_span!("route", generation);
        state.task = Some(
            self.inner
                .runtime
                .spawn(engine.fetch_and_run(generation, plan).instrument(span)),
        );
        Ok(status_of(&state))
    }

    async fn fetch_and_run(self, generation: u64, plan: RunPlan) {
        let result = self.inner.service.route(&plan.waypoints, plan.mode).await;

        let first = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            match result.and_then(|path| {
                RouteCursor::new(path)
                    .ok_or_else(|| RouteError::Routing("route has fewer than 2 points".into()))
            }) {
                Ok(cursor) => {
                    let first = cursor.position();
                    info!(points = cursor.len(), "route loaded");
                    state.run = Some(ActiveRun {
                        cursor,
                        mode: plan.mode,
                        direction: plan.direction,
                        speed_kmh: plan.speed_kmh,
                    });
                    state.phase = RoutePhase::Running;
                    first
                }
                Err(err) => {
                    warn!(%err, "route request failed");
                    metrics::counter!("relocate_route_failures_total").increment(1);
                    state.phase = RoutePhase::Idle;
                    state.plan = None;
                    state.last_error = Some(err.to_string());
                    return;
                }
            }
        };

        self.inner.sink.publish(first);
        self.tick_loop(generation).await;
    }

    async fn tick_loop(&self, generation: u64) {
        let mut ticker = interval_at(Instant::now() + TICK_PERIOD, TICK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !self.tick(generation) {
                break;
            }
        }
    }

    /// Advance one tick. Returns whether the run should keep ticking.
    fn tick(&self, generation: u64) -> bool {
        let (point, keep_going) = {
            let mut state = self.lock();
            if state.generation != generation || state.phase != RoutePhase::Running {
                return false;
            }
            let Some(run) = state.run.as_mut() else {
                return false;
            };
            let looping = run.direction == Direction::Loop;
            let budget = run.speed_kmh * 1000.0 / 3600.0;
            let point = run.cursor.advance(budget, looping);
            let finished = !looping && run.cursor.at_end();
            debug!(index = run.cursor.index(), progress = run.cursor.progress(), "tick");
            if finished {
                info!("route complete");
                state.phase = RoutePhase::Completed;
            }
            (point, !finished)
        };
        metrics::counter!("relocate_route_ticks_total").increment(1);
        self.inner.sink.publish(point);
        keep_going
    }

    pub fn pause(&self) -> Result<RouteStatus, RouteError> {
        let mut state = self.lock();
        if state.phase != RoutePhase::Running {
            return Err(RouteError::Transition {
                action: "pause",
                phase: state.phase,
            });
        }
        state.supersede();
        state.phase = RoutePhase::Paused;
        info!("route paused");
        Ok(status_of(&state))
    }

    /// Continue a paused run on the same path without fetching again.
    pub fn resume(&self) -> Result<RouteStatus, RouteError> {
        let mut state = self.lock();
        if state.phase != RoutePhase::Paused {
            return Err(RouteError::Transition {
                action: "resume",
                phase: state.phase,
            });
        }
        let generation = state.supersede();
        state.phase = RoutePhase::Running;
        let engine = self.clone();
        let span = info_span!("route", generation);
        state.task = Some(self.inner.runtime.spawn(
            async move { engine.tick_loop(generation).await }.instrument(span),
        ));
        info!("route resumed");
        Ok(status_of(&state))
    }

    /// Always allowed: drops the path and resets progress.
    pub fn stop(&self) -> RouteStatus {
        let mut state = self.lock();
        state.supersede();
        state.phase = RoutePhase::Stopped;
        state.run = None;
        state.plan = None;
        info!("route stopped");
        status_of(&state)
    }

    pub fn status(&self) -> RouteStatus {
        status_of(&self.lock())
    }
}

fn status_of(state: &RunState) -> RouteStatus {
    let run = state.run.as_ref();
    let plan = state.plan.as_ref();
    let progress = match state.phase {
        RoutePhase::Completed => 100,
        _ => run.map_or(0, |run| run.cursor.progress()),
    };
    RouteStatus {
        phase: state.phase,
        progress,
        index: run.map_or(0, |run| run.cursor.index()),
        points: run.map_or(0, |run| run.cursor.len()),
        position: run.map(|run| run.cursor.position()),
        reversing: run.is_some_and(|run| run.cursor.is_reversing()),
        mode: run.map(|run| run.mode).or(plan.map(|plan| plan.mode)),
        direction: run.map(|run| run.direction).or(plan.map(|plan| plan.direction)),
        speed_kmh: run.map(|run| run.speed_kmh).or(plan.map(|plan| plan.speed_kmh)),
        last_error: state.last_error.clone(),
    }
}

//! Translation of CLI arguments into validated run configurations.

use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use geo_core::{Coordinate, StatePatch};

use crate::route::osrm::DEFAULT_OSRM_URL;

#[derive(Clone, Debug, Default)]
/// Optional tracing knobs.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing spans.
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
/// Everything `relocate serve` needs.
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub osrm_url: String,
    pub state_file: Option<PathBuf>,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug)]
/// Everything `relocate demo` needs.
pub struct DemoConfig {
    pub serve: ServeConfig,
    /// Page URLs to open; privileged URLs are allowed and simply never spoofed.
    pub pages: Vec<String>,
    /// Applied once the pages are open.
    pub initial: Option<StatePatch>,
    /// How often each page asks for its position.
    pub poll_secs: u64,
}

/// Flags shared by every subcommand that starts the background.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address of the control API.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:8787")]
    pub bind: String,
    /// Base URL of the OSRM routing service.
    #[arg(long = "osrm-url", value_name = "URL", env = "RELOCATE_OSRM_URL", default_value = DEFAULT_OSRM_URL)]
    pub osrm_url: String,
    /// JSON file the store is loaded from and saved to.
    #[arg(long = "state-file", value_name = "PATH", env = "RELOCATE_STATE_FILE")]
    pub state_file: Option<PathBuf>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

/// CLI arguments accepted by the `demo` subcommand.
#[derive(Debug, Args)]
pub struct DemoArgs {
    #[command(flatten)]
    pub serve: ServeArgs,
    /// Page to open (repeatable).
    #[arg(long = "page", value_name = "URL")]
    pub pages: Vec<String>,
    /// Enable spoofing at "LAT,LNG" once the pages are open.
    #[arg(long = "at", value_name = "LAT,LNG")]
    pub at: Option<String>,
    /// Accuracy radius in metres used with --at.
    #[arg(long, value_name = "METRES", default_value_t = 10.0)]
    pub accuracy: f64,
    /// Label used with --at.
    #[arg(long, value_name = "NAME")]
    pub label: Option<String>,
    /// Seconds between position requests from each page.
    #[arg(long = "poll", value_name = "SECS", default_value_t = 2)]
    pub poll_secs: u64,
}

impl TryFrom<ServeArgs> for ServeConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self> {
        let bind: SocketAddr = args
            .bind
            .parse()
            .with_context(|| format!("--bind must be HOST:PORT, got {:?}", args.bind))?;

        let osrm_url = args.osrm_url.trim().to_string();
        if !(osrm_url.starts_with("http://") || osrm_url.starts_with("https://")) {
            bail!("--osrm-url must be an http(s) URL, got {osrm_url:?}");
        }

        Ok(Self {
            bind,
            osrm_url,
            state_file: args.state_file,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

impl TryFrom<DemoArgs> for DemoConfig {
    type Error = anyhow::Error;

    fn try_from(args: DemoArgs) -> Result<Self> {
        let serve = ServeConfig::try_from(args.serve)?;

        let initial = match args.at.as_deref() {
            Some(raw) => {
                let point = parse_coordinate(raw)?;
                if !(args.accuracy > 0.0 && args.accuracy.is_finite()) {
                    bail!("--accuracy must be a positive number of metres");
                }
                Some(StatePatch {
                    enabled: Some(true),
                    latitude: Some(point.latitude),
                    longitude: Some(point.longitude),
                    accuracy: Some(args.accuracy),
                    preset_label: Some(
                        args.label
                            .unwrap_or_else(|| format!("{:.4}, {:.4}", point.latitude, point.longitude)),
                    ),
                })
            }
            None => None,
        };

        if args.poll_secs == 0 {
            bail!("--poll must be at least 1 second");
        }

        let pages = if args.pages.is_empty() {
            vec![
                "https://maps.example.com/".to_string(),
                "https://weather.example.org/today".to_string(),
                "chrome://settings".to_string(),
            ]
        } else {
            args.pages
        };

        Ok(Self {
            serve,
            pages,
            initial,
            poll_secs: args.poll_secs,
        })
    }
}

/// Parse `"LAT,LNG"` and check the ranges.
pub fn parse_coordinate(raw: &str) -> Result<Coordinate> {
    let (lat, lng) = raw
        .split_once(',')
        .ok_or_else(|| anyhow!("expected LAT,LNG, got {raw:?}"))?;
    let latitude = lat
        .trim()
        .parse::<f64>()
        .with_context(|| format!("latitude {lat:?} is not a number"))?;
    let longitude = lng
        .trim()
        .parse::<f64>()
        .with_context(|| format!("longitude {lng:?} is not a number"))?;
    let point = Coordinate::new(latitude, longitude);
    point.validate()?;
    Ok(point)
}

//! `relocate demo`: the control API plus a handful of simulated pages that
//! keep asking for their position, so the whole pipeline can be watched from
//! the logs.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use page_realm::{Position, PositionError, PositionOptions, STATE_ATTR, UnavailableSensor};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    config::DemoConfig,
    server::{shutdown_runtime, shutdown_signal, spawn_control_server, start_background},
    tabs::{OpenTab, open_tab},
    telemetry,
};

type Outcome = (String, Result<Position, PositionError>);

pub fn run(config: DemoConfig) -> Result<()> {
    let _telemetry = telemetry::init(&config.serve.telemetry);
    telemetry::init_metrics_recorder()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("relocate-worker")
        .build()
        .context("failed to build tokio runtime")?;

    let (server, flush) = runtime.block_on(async {
        let (background, engine, flush) = start_background(&config.serve)?;
        let sessions = background.bump_use_count().await?;
        let server = spawn_control_server(config.serve.bind, background.clone(), engine.clone())?;
        info!(addr = %config.serve.bind, sessions, "control API listening");

        let mut tabs = Vec::with_capacity(config.pages.len());
        for (n, url) in config.pages.iter().enumerate() {
            let title = format!("Demo page {}", n + 1);
            let tab = open_tab(&background, url, &title, Arc::new(UnavailableSensor::default()))
                .await?;
            debug!(
                page = %tab.page,
                snapshot = tab.window.attribute(STATE_ATTR).as_deref().unwrap_or(""),
                "page ready"
            );
            tabs.push(tab);
        }
        info!(pages = tabs.len(), "pages open");

        if let Some(patch) = config.initial.clone() {
            let response = background.apply(patch).await?;
            if !response.is_ok() {
                warn!(?response, "initial location rejected");
            }
        }

        let (outcomes_tx, mut outcomes) = mpsc::unbounded_channel();
        let mut ticker = tokio::time::interval(Duration::from_secs(config.poll_secs.max(1)));
        let mut stop = shutdown_signal()?;
        loop {
            tokio::select! {
                _ = stop.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {
                    for tab in &tabs {
                        request_position(tab, &outcomes_tx);
                    }
                }
                Some((url, outcome)) = outcomes.recv() => log_outcome(&url, outcome),
            }
        }

        info!("shutting down");
        engine.stop();
        for tab in tabs {
            tab.close(&background).await;
        }
        anyhow::Ok((server, flush))
    })?;

    server.stop();
    shutdown_runtime(runtime, flush);
    Ok(())
}

/// One-shot position request whose outcome lands on `outcomes`.
fn request_position(tab: &OpenTab, outcomes: &mpsc::UnboundedSender<Outcome>) {
    let (ok_tx, ok_url) = (outcomes.clone(), tab.url.clone());
    let (err_tx, err_url) = (outcomes.clone(), tab.url.clone());
    tab.geolocation.get_current_position(
        Box::new(move |position| {
            let _ = ok_tx.send((ok_url.clone(), Ok(position)));
        }),
        Some(Box::new(move |err| {
            let _ = err_tx.send((err_url.clone(), Err(err)));
        })),
        PositionOptions::default(),
    );
}

fn log_outcome(url: &str, outcome: Result<Position, PositionError>) {
    match outcome {
        Ok(position) => info!(
            page = url,
            lat = position.coords.latitude,
            lng = position.coords.longitude,
            accuracy = position.coords.accuracy,
            "position"
        ),
        Err(err) => info!(page = url, %err, "no position"),
    }
}

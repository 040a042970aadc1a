//! Per-page relay: it can reach the background and the page document, but not
//! the page's script realm.
//!
//! Boot order for a page:
//! 1. [`Relay::prepare`] writes a disabled placeholder snapshot synchronously,
//!    before any page script runs.
//! 2. The page script installs its provider, which reads that attribute.
//! 3. [`Relay::run`] fetches the real state, rewrites the attribute, emits the
//!    sync event and then forwards every broadcast it receives.

use std::sync::Arc;

use geo_core::{ChannelClosed, Message, PageId, Response, RuntimeSender, SpoofState};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{Instrument, debug, info_span, warn};

use crate::window::{PageWindow, STATE_ATTR, SYNC_EVENT};

pub struct Relay {
    page: PageId,
    url: String,
    title: String,
    window: Arc<PageWindow>,
    runtime: RuntimeSender,
}

impl Relay {
    pub fn new(
        page: PageId,
        window: Arc<PageWindow>,
        runtime: &RuntimeSender,
        url: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            page,
            url: url.into(),
            title: title.into(),
            window,
            runtime: runtime.for_page(page),
        }
    }

    pub fn page(&self) -> PageId {
        self.page
    }

    /// Write the safe, disabled placeholder snapshot.
    pub fn prepare(&self) {
        self.write_attribute(&SpoofState::default());
    }

    /// Fetch the canonical state from the background and push it into the page.
    pub async fn sync_from_store(&self) -> Result<SpoofState, ChannelClosed> {
        let state = match self.runtime.send(Message::GetState).await? {
            Response::State(state) => state,
            other => {
                warn!(?other, "unexpected reply to GET_STATE; keeping placeholder");
                SpoofState::default()
            }
        };
        self.push(&state);
        Ok(state)
    }

    /// Update the snapshot attribute and notify the page realm.
    pub fn push(&self, state: &SpoofState) {
        if let Some(payload) = self.write_attribute(state) {
            self.window.dispatch_event(SYNC_EVENT, &payload);
        }
    }

    /// Tell the background this page is consuming spoofed data.
    pub fn report_presence(&self) -> bool {
        let title = if self.title.is_empty() {
            host_of(&self.url).to_string()
        } else {
            self.title.clone()
        };
        self.runtime.post(Message::GeoConsumerReport {
            url: self.url.clone(),
            title,
        })
    }

    /// Initial sync followed by the broadcast loop. Ends when the background
    /// drops the page's inbox.
    pub async fn run(self, mut inbox: UnboundedReceiver<Message>) {
        let span = info_span!("relay", page = %self.page, url = %self.url);
        async move {
            match self.sync_from_store().await {
                Ok(state) if state.enabled => {
                    self.report_presence();
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(%err, "background unavailable during initial sync");
                    return;
                }
            }

            while let Some(message) = inbox.recv().await {
                match message {
                    Message::StateChanged(patch) => {
                        let state = SpoofState::from_patch(&patch);
                        self.push(&state);
                        if state.enabled {
                            self.report_presence();
                        }
                    }
                    other => debug!(?other, "relay ignores message"),
                }
            }
            debug!("page inbox closed");
        }
        .instrument(span)
        .await
    }

    fn write_attribute(&self, state: &SpoofState) -> Option<String> {
        match serde_json::to_string(state) {
            Ok(payload) => {
                self.window.set_attribute(STATE_ATTR, payload.clone());
                Some(payload)
            }
            Err(err) => {
                warn!(%err, "failed to serialise spoof snapshot");
                None
            }
        }
    }
}

/// Host part of a URL, or the input when it has no scheme.
fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(['/', '?', '#']).next().unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use geo_core::{Envelope, StatePatch};
    use tokio::sync::mpsc;

    use super::*;

    /// Minimal background: answers GET_STATE with `state` and records reports.
    fn fake_background(
        state: SpoofState,
    ) -> (RuntimeSender, Arc<Mutex<Vec<(Option<PageId>, String, String)>>>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let response = match envelope.message {
                    Message::GetState => Response::State(state.clone()),
                    Message::GeoConsumerReport { url, title } => {
                        sink.lock().unwrap().push((envelope.sender, url, title));
                        Response::ok()
                    }
                    _ => Response::ok(),
                };
                let _ = envelope.reply.send(response);
            }
        });
        (RuntimeSender::new(tx), reports)
    }

    fn tokyo() -> SpoofState {
        SpoofState {
            enabled: true,
            latitude: 35.6762,
            longitude: 139.6503,
            accuracy: 5.0,
            preset_label: "Tokyo".into(),
        }
    }

    fn event_log(window: &PageWindow) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        window.add_event_listener(SYNC_EVENT, move |detail| {
            sink.lock().unwrap().push(detail.to_string());
        });
        log
    }

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://maps.example.com/place?q=1"), "maps.example.com");
        assert_eq!(host_of("http://localhost:8080"), "localhost:8080");
        assert_eq!(host_of("about:blank"), "about:blank");
    }

    #[tokio::test]
    async fn prepare_writes_a_disabled_placeholder() {
        let (runtime, _) = fake_background(tokyo());
        let window = PageWindow::new();
        let relay = Relay::new(PageId(1), window.clone(), &runtime, "https://a.example", "A");
        relay.prepare();

        let raw = window.attribute(STATE_ATTR).unwrap();
        let placeholder: SpoofState = serde_json::from_str(&raw).unwrap();
        assert_eq!(placeholder, SpoofState::default());
        assert!(!placeholder.enabled);
    }

    #[tokio::test]
    async fn run_syncs_then_forwards_broadcasts_in_order() {
        let (runtime, reports) = fake_background(tokyo());
        let window = PageWindow::new();
        let events = event_log(&window);
        let relay = Relay::new(PageId(3), window.clone(), &runtime, "https://maps.example/x", "");
        relay.prepare();

        let (outbox, inbox) = mpsc::unbounded_channel();
        let task = tokio::spawn(relay.run(inbox));

        outbox
            .send(Message::StateChanged(StatePatch {
                enabled: Some(true),
                latitude: Some(1.0),
                longitude: Some(2.0),
                accuracy: Some(3.0),
                preset_label: None,
            }))
            .unwrap();
        outbox
            .send(Message::StateChanged(StatePatch::enabled(false)))
            .unwrap();
        drop(outbox);
        task.await.unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        let first: SpoofState = serde_json::from_str(&events[0]).unwrap();
        assert_eq!(first, tokyo());
        let second: SpoofState = serde_json::from_str(&events[1]).unwrap();
        assert_eq!((second.latitude, second.longitude), (1.0, 2.0));
        let last: SpoofState = serde_json::from_str(&events[2]).unwrap();
        assert!(!last.enabled);

        let attr: SpoofState = serde_json::from_str(&window.attribute(STATE_ATTR).unwrap()).unwrap();
        assert_eq!(attr, last);

        // Give the fire-and-forget reports a chance to land.
        tokio::task::yield_now().await;
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 2, "initial load and the enabled push");
        assert!(reports.iter().all(|(page, url, title)| {
            *page == Some(PageId(3)) && url == "https://maps.example/x" && title == "maps.example"
        }));
    }

    #[tokio::test]
    async fn closed_background_ends_the_relay_quietly() {
        let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
        drop(rx);
        let window = PageWindow::new();
        let relay = Relay::new(PageId(9), window.clone(), &RuntimeSender::new(tx), "https://x", "X");
        relay.prepare();
        let (_outbox, inbox) = mpsc::unbounded_channel();
        relay.run(inbox).await;
        let placeholder: SpoofState =
            serde_json::from_str(&window.attribute(STATE_ATTR).unwrap()).unwrap();
        assert!(!placeholder.enabled);
    }
}

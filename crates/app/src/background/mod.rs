//! Privileged background: the only place the canonical spoof state lives.
//!
//! The background is a single tokio task that owns the [`Store`], the
//! [`BroadcastHub`] and the [`ConsumerTracker`]. Pages reach it with runtime
//! [`Message`]s through a [`RuntimeSender`]; the control surface additionally
//! uses a private control channel for page registration and peripheral keys.
//! Everything is processed in arrival order, so a write is one atomic merge
//! and concurrent writers resolve last-write-wins.
//!
//! - `store`: key/value store and change listeners.
//! - `hub`: open pages, fan-out and the status indicator.
//! - `consumers`: pages currently being fed spoofed data.
//! - `recent`: bounded recent-location list.
//! - `persist`: optional JSON state file.

pub mod consumers;
pub mod hub;
pub(crate) mod persist;
pub mod recent;
pub mod store;

use chrono::Utc;
use geo_core::{
    ChannelClosed, Envelope, Message, PageId, Response, RuntimeSender, SpoofState, StatePatch,
};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

pub use consumers::ConsumerTracker;
pub use hub::{BadgeStatus, BroadcastHub};
pub use recent::RecentLocation;
pub use store::{Store, StoreData, StoreKey};

enum Control {
    OpenPage {
        url: Option<String>,
        reply: oneshot::Sender<(PageId, mpsc::UnboundedReceiver<Message>)>,
    },
    ClosePage(PageId),
    Get {
        keys: Vec<StoreKey>,
        reply: oneshot::Sender<Map<String, Value>>,
    },
    Data(oneshot::Sender<StoreData>),
    RecordRecent(RecentLocation),
    RemoveRecent {
        index: usize,
        reply: oneshot::Sender<bool>,
    },
    ClearRecent,
    BumpUseCount(oneshot::Sender<u64>),
}

/// Cloneable handle to the background task.
#[derive(Clone)]
pub struct BackgroundHandle {
    runtime: RuntimeSender,
    control: mpsc::UnboundedSender<Control>,
    badge: watch::Receiver<BadgeStatus>,
    states: watch::Receiver<SpoofState>,
}

struct Background {
    store: Store,
    hub: BroadcastHub,
    consumers: ConsumerTracker,
}

/// Start the background task on the current tokio runtime.
pub fn spawn_background(mut store: Store) -> BackgroundHandle {
    let (runtime_tx, runtime_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let (state_tx, states) = watch::channel(store.state().clone());
    store.on_change(move |change| {
        state_tx.send_replace(change.new.clone());
    });

    let hub = BroadcastHub::new();
    hub.update_badge(store.state().enabled);
    let badge = hub.badge();

    let background = Background {
        store,
        hub,
        consumers: ConsumerTracker::default(),
    };
    tokio::spawn(background.run(runtime_rx, control_rx));

    BackgroundHandle {
        runtime: RuntimeSender::new(runtime_tx),
        control: control_tx,
        badge,
        states,
    }
}

impl Background {
    async fn run(
        mut self,
        mut runtime_rx: mpsc::UnboundedReceiver<Envelope>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) {
        info!(enabled = self.store.state().enabled, "background started");
        loop {
            tokio::select! {
                Some(envelope) = runtime_rx.recv() => {
                    let response = self.handle_message(envelope.message, envelope.sender);
                    // The sender may have gone away; nothing to do then.
                    let _ = envelope.reply.send(response);
                }
                Some(control) = control_rx.recv() => self.handle_control(control),
                else => break,
            }
        }
        info!("background stopped");
    }

    fn handle_message(&mut self, message: Message, sender: Option<PageId>) -> Response {
        metrics::counter!("relocate_messages_total", "type" => message_label(&message))
            .increment(1);
        match message {
            Message::StateChanged(patch) => match self.store.set(&patch) {
                Ok(change) => {
                    self.hub.update_badge(change.new.enabled);
                    let full = Message::StateChanged(StatePatch::from(&change.new));
                    let reached = self.hub.broadcast(&full);
                    debug!(reached, enabled = change.new.enabled, "state broadcast");
                    Response::ok()
                }
                Err(err) => {
                    warn!(%err, "rejected state change");
                    metrics::counter!("relocate_state_rejections_total").increment(1);
                    Response::rejected(&err)
                }
            },
            Message::GetState => Response::State(self.store.state().clone()),
            Message::GeoConsumerReport { url, title } => {
                match sender {
                    Some(page) => {
                        self.consumers.report(page, url, title, Utc::now());
                        debug!(%page, tracked = self.consumers.len(), "consumer reported");
                    }
                    None => debug!("consumer report without a page; ignored"),
                }
                Response::ok()
            }
            Message::GetGeoConsumers => Response::Consumers {
                consumers: self.consumers.snapshot(Utc::now()),
            },
        }
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::OpenPage { url, reply } => {
                let _ = reply.send(self.hub.register(url));
            }
            Control::ClosePage(page) => {
                self.hub.unregister(page);
            }
            Control::Get { keys, reply } => {
                let _ = reply.send(self.store.get(&keys));
            }
            Control::Data(reply) => {
                let _ = reply.send(self.store.data().clone());
            }
            Control::RecordRecent(entry) => self.store.record_recent(entry),
            Control::RemoveRecent { index, reply } => {
                let _ = reply.send(self.store.remove_recent(index));
            }
            Control::ClearRecent => self.store.clear_recent(),
            Control::BumpUseCount(reply) => {
                let _ = reply.send(self.store.bump_use_count());
            }
        }
    }
}

fn message_label(message: &Message) -> &'static str {
    match message {
        Message::StateChanged(_) => "STATE_CHANGED",
        Message::GetState => "GET_STATE",
        Message::GeoConsumerReport { .. } => "GEO_CONSUMER_REPORT",
        Message::GetGeoConsumers => "GET_GEO_CONSUMERS",
    }
}

impl BackgroundHandle {
    /// Runtime channel for privileged callers (no page identity).
    pub fn runtime(&self) -> RuntimeSender {
        self.runtime.clone()
    }

    pub fn badge(&self) -> watch::Receiver<BadgeStatus> {
        self.badge.clone()
    }

    /// Receiver that observes every committed state.
    pub fn subscribe_states(&self) -> watch::Receiver<SpoofState> {
        self.states.clone()
    }

    pub async fn state(&self) -> Result<SpoofState, ChannelClosed> {
        match self.runtime.send(Message::GetState).await? {
            Response::State(state) => Ok(state),
            _ => Err(ChannelClosed),
        }
    }

    /// Send `STATE_CHANGED` and return the background's verdict.
    pub async fn apply(&self, patch: StatePatch) -> Result<Response, ChannelClosed> {
        self.runtime.send(Message::StateChanged(patch)).await
    }

    pub async fn open_page(
        &self,
        url: Option<String>,
    ) -> Result<(PageId, mpsc::UnboundedReceiver<Message>), ChannelClosed> {
        self.request(|reply| Control::OpenPage { url, reply }).await
    }

    pub fn close_page(&self, page: PageId) {
        let _ = self.control.send(Control::ClosePage(page));
    }

    pub async fn get(&self, keys: Vec<StoreKey>) -> Result<Map<String, Value>, ChannelClosed> {
        self.request(|reply| Control::Get { keys, reply }).await
    }

    pub async fn data(&self) -> Result<StoreData, ChannelClosed> {
        self.request(Control::Data).await
    }

    pub async fn recent(&self) -> Result<Vec<RecentLocation>, ChannelClosed> {
        Ok(self.data().await?.recent_locations)
    }

    pub fn record_recent(&self, entry: RecentLocation) {
        let _ = self.control.send(Control::RecordRecent(entry));
    }

    pub async fn remove_recent(&self, index: usize) -> Result<bool, ChannelClosed> {
        self.request(|reply| Control::RemoveRecent { index, reply })
            .await
    }

    pub fn clear_recent(&self) {
        let _ = self.control.send(Control::ClearRecent);
    }

    pub async fn bump_use_count(&self) -> Result<u64, ChannelClosed> {
        self.request(Control::BumpUseCount).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Control,
    ) -> Result<T, ChannelClosed> {
        let (reply, rx) = oneshot::channel();
        self.control.send(build(reply)).map_err(|_| ChannelClosed)?;
        rx.await.map_err(|_| ChannelClosed)
    }
}

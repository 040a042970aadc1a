//! Runtime message protocol between pages, the control surface and the
//! privileged background.
//!
//! Messages are fire-and-forget from the sender's point of view: a page that
//! disappears while a reply is pending simply never reads it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::state::{ConfigurationError, SpoofState, StatePatch};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
/// Identity of an open page, assigned by the broadcast hub.
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Apply the carried fields and fan the resulting state out to every page.
    StateChanged(StatePatch),
    GetState,
    /// A page announces it is being served spoofed positions.
    GeoConsumerReport { url: String, title: String },
    GetGeoConsumers,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Page that recently reported consuming spoofed data.
pub struct GeoConsumer {
    pub page_id: PageId,
    pub url: String,
    pub title: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Ack {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Consumers {
        consumers: Vec<GeoConsumer>,
    },
    State(SpoofState),
}

impl Response {
    pub fn ok() -> Self {
        Response::Ack {
            ok: true,
            error: None,
        }
    }

    pub fn rejected(err: &ConfigurationError) -> Self {
        Response::Ack {
            ok: false,
            error: Some(err.to_string()),
        }
    }

    /// Whether the background accepted the request.
    pub fn is_ok(&self) -> bool {
        !matches!(self, Response::Ack { ok: false, .. })
    }
}

/// A runtime message in flight, together with the slot for its reply.
pub struct Envelope {
    pub message: Message,
    pub sender: Option<PageId>,
    pub reply: oneshot::Sender<Response>,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("background runtime channel closed")]
pub struct ChannelClosed;

#[derive(Clone, Debug)]
/// Sending half of the runtime channel, stamped with the sender's page.
pub struct RuntimeSender {
    tx: mpsc::UnboundedSender<Envelope>,
    sender: Option<PageId>,
}

impl RuntimeSender {
    /// Sender for privileged callers, which carry no page identity.
    pub fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { tx, sender: None }
    }

    /// Same channel, stamped with `page` as the origin.
    pub fn for_page(&self, page: PageId) -> Self {
        Self {
            tx: self.tx.clone(),
            sender: Some(page),
        }
    }

    pub fn page(&self) -> Option<PageId> {
        self.sender
    }

    /// Send `message` and wait for the background's reply.
    pub async fn send(&self, message: Message) -> Result<Response, ChannelClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                message,
                sender: self.sender,
                reply,
            })
            .map_err(|_| ChannelClosed)?;
        rx.await.map_err(|_| ChannelClosed)
    }

    /// Send `message` without waiting for a reply. Returns whether it was queued.
    pub fn post(&self, message: Message) -> bool {
        let (reply, _) = oneshot::channel();
        self.tx
            .send(Envelope {
                message,
                sender: self.sender,
                reply,
            })
            .is_ok()
    }
}

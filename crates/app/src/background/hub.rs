//! Registry of open pages and the fan-out of state changes to their relays.

use std::{collections::BTreeMap, fmt};

use geo_core::{Message, PageId};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// URL prefixes of pages the spoofer must never touch.
const PRIVILEGED_SCHEMES: [&str; 3] = ["chrome://", "chrome-extension://", "relocate://"];

/// Pages without a URL are not addressable either.
pub fn is_privileged(url: Option<&str>) -> bool {
    match url {
        None => true,
        Some(url) => PRIVILEGED_SCHEMES
            .iter()
            .any(|scheme| url.starts_with(scheme)),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
/// Status indicator shown on the control surface.
pub enum BadgeStatus {
    Active,
    #[default]
    Inactive,
}

impl BadgeStatus {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            BadgeStatus::Active
        } else {
            BadgeStatus::Inactive
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            BadgeStatus::Active => "Relocate: spoofing active",
            BadgeStatus::Inactive => "Relocate: inactive",
        }
    }
}

impl fmt::Display for BadgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BadgeStatus::Active => "active",
            BadgeStatus::Inactive => "inactive",
        })
    }
}

struct OpenPage {
    url: Option<String>,
    outbox: mpsc::UnboundedSender<Message>,
}

pub struct BroadcastHub {
    next_id: u64,
    pages: BTreeMap<PageId, OpenPage>,
    badge: watch::Sender<BadgeStatus>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        let (badge, _) = watch::channel(BadgeStatus::Inactive);
        Self {
            next_id: 1,
            pages: BTreeMap::new(),
            badge,
        }
    }

    /// Track a new page and hand back its identity and inbox.
    pub fn register(&mut self, url: Option<String>) -> (PageId, mpsc::UnboundedReceiver<Message>) {
        let page = PageId(self.next_id);
        self.next_id += 1;
        let (outbox, inbox) = mpsc::unbounded_channel();
        debug!(%page, url = url.as_deref().unwrap_or("<none>"), "page opened");
        self.pages.insert(page, OpenPage { url, outbox });
        metrics::gauge!("relocate_open_pages").set(self.page_count() as f64);
        (page, inbox)
    }

    /// Forget a page; its relay sees the inbox close.
    pub fn unregister(&mut self, page: PageId) -> bool {
        let removed = self.pages.remove(&page).is_some();
        if removed {
            debug!(%page, "page closed");
            metrics::gauge!("relocate_open_pages").set(self.page_count() as f64);
        }
        removed
    }

    /// Fire-and-forget `message` to every addressable page. Pages whose relay
    /// went away are pruned. Returns how many pages it reached.
    pub fn broadcast(&mut self, message: &Message) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (page, entry) in &self.pages {
            if is_privileged(entry.url.as_deref()) {
                trace!(%page, "skipping privileged page");
                continue;
            }
            if entry.outbox.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(*page);
            }
        }
        for page in closed {
            self.unregister(page);
        }
        metrics::counter!("relocate_broadcast_deliveries_total").increment(delivered as u64);
        delivered
    }

    pub fn update_badge(&self, enabled: bool) {
        self.badge.send_replace(BadgeStatus::from_enabled(enabled));
    }

    pub fn badge(&self) -> watch::Receiver<BadgeStatus> {
        self.badge.subscribe()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

//! Opening a simulated page: register it with the background, prepare the
//! relay, install the provider and start relaying.

use std::sync::Arc;

use geo_core::{ChannelClosed, PageId};
use page_realm::{Geolocation, NativeGeolocation, PageWindow, Relay};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::background::{BackgroundHandle, hub::is_privileged};

pub struct OpenTab {
    pub page: PageId,
    pub url: String,
    pub window: Arc<PageWindow>,
    pub geolocation: Geolocation,
    /// `None` on privileged pages, where the relay never runs.
    relay: Option<JoinHandle<()>>,
}

/// Boot a page in the same order a browser would: the placeholder snapshot is
/// written before the page script installs its provider, and only then does
/// the relay fetch the real state.
///
/// Privileged pages keep the disabled placeholder for their whole life: no
/// sync, no presence reports, no broadcasts. Their provider always delegates
/// to the real sensor.
pub async fn open_tab(
    background: &BackgroundHandle,
    url: &str,
    title: &str,
    sensor: Arc<dyn NativeGeolocation>,
) -> Result<OpenTab, ChannelClosed> {
    let (page, inbox) = background.open_page(Some(url.to_string())).await?;
    let window = PageWindow::new();
    let relay = Relay::new(page, Arc::clone(&window), &background.runtime(), url, title);
    relay.prepare();
    let geolocation = Geolocation::install(&window, sensor);
    let relay = if is_privileged(Some(url)) {
        debug!(%page, url, "privileged page; relay not started");
        None
    } else {
        Some(tokio::spawn(relay.run(inbox)))
    };
    Ok(OpenTab {
        page,
        url: url.to_string(),
        window,
        geolocation,
        relay,
    })
}

impl OpenTab {
    /// Unregister the page; its relay exits once the inbox closes.
    pub async fn close(self, background: &BackgroundHandle) {
        background.close_page(self.page);
        if let Some(relay) = self.relay {
            let _ = relay.await;
        }
    }
}

//! Document-level channel readable from both the relay and the page script.
//!
//! A page exposes one attribute holding a serialized `SpoofState` snapshot and
//! a named event carrying the same payload. Event listeners run synchronously
//! inside `dispatch_event`, in registration order, which is what keeps
//! notifications ordered within a page.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

/// Attribute on the document element carrying the latest snapshot.
pub const STATE_ATTR: &str = "data-relocate-spoof";
/// Event name used to push snapshots into the page realm.
pub const SYNC_EVENT: &str = "__relocateSync";

type Listener = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Token returned by `add_event_listener`.
pub struct ListenerId(u64);

#[derive(Default)]
pub struct PageWindow {
    attributes: RwLock<HashMap<String, String>>,
    listeners: Mutex<ListenerTable>,
}

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    by_event: HashMap<String, Vec<(ListenerId, Listener)>>,
}

impl PageWindow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_attribute(&self, name: &str, value: String) {
        if let Ok(mut attrs) = self.attributes.write() {
            attrs.insert(name.to_string(), value);
        }
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        match self.attributes.read() {
            Ok(attrs) => attrs.get(name).cloned(),
            Err(_) => None,
        }
    }

    pub fn add_event_listener<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let Ok(mut table) = self.listeners.lock() else {
            return ListenerId(u64::MAX);
        };
        let id = ListenerId(table.next_id);
        table.next_id += 1;
        table
            .by_event
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_event_listener(&self, event: &str, id: ListenerId) {
        if let Ok(mut table) = self.listeners.lock() {
            if let Some(list) = table.by_event.get_mut(event) {
                list.retain(|(existing, _)| *existing != id);
            }
        }
    }

    /// Invoke every listener for `event` with `detail`; returns how many ran.
    pub fn dispatch_event(&self, event: &str, detail: &str) -> usize {
        // Snapshot first so a listener may add or remove listeners.
        let listeners: Vec<Listener> = match self.listeners.lock() {
            Ok(table) => table
                .by_event
                .get(event)
                .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default(),
            Err(_) => return 0,
        };
        for listener in &listeners {
            listener(detail);
        }
        listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_overwrite_previous_values() {
        let window = PageWindow::new();
        assert_eq!(window.attribute(STATE_ATTR), None);
        window.set_attribute(STATE_ATTR, "a".into());
        window.set_attribute(STATE_ATTR, "b".into());
        assert_eq!(window.attribute(STATE_ATTR).as_deref(), Some("b"));
    }

    #[test]
    fn events_reach_listeners_in_send_order() {
        let window = PageWindow::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        window.add_event_listener(SYNC_EVENT, move |detail| {
            sink.lock().unwrap().push(detail.to_string());
        });

        for n in 0..5 {
            assert_eq!(window.dispatch_event(SYNC_EVENT, &n.to_string()), 1);
        }
        assert_eq!(window.dispatch_event("other", "x"), 0);
        assert_eq!(*seen.lock().unwrap(), vec!["0", "1", "2", "3", "4"]);
    }

    #[test]
    fn removed_listeners_stop_receiving() {
        let window = PageWindow::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        let id = window.add_event_listener(SYNC_EVENT, move |_| {
            *counter.lock().unwrap() += 1;
        });
        window.dispatch_event(SYNC_EVENT, "{}");
        window.remove_event_listener(SYNC_EVENT, id);
        window.dispatch_event(SYNC_EVENT, "{}");
        assert_eq!(*hits.lock().unwrap(), 1);
    }
}

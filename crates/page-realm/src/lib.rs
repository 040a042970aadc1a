//! Everything that lives inside a page: the document-level channel shared with
//! the relay, the relay itself, and the geolocation provider installed into the
//! page's script realm.
//!
//! Only serialized JSON strings cross from the relay to the page script. The
//! provider never sees the background or the relay directly; it reads the
//! `data-relocate-spoof` attribute once at startup and then follows the
//! `__relocateSync` event.

pub mod position;
pub mod provider;
pub mod relay;
pub mod sensor;
pub mod window;

pub use position::{
    ErrorCallback, Position, PositionCoords, PositionError, PositionErrorCode, PositionOptions,
    SuccessCallback,
};
pub use provider::{Geolocation, PageState, WatchHandle};
pub use relay::Relay;
pub use sensor::{NativeGeolocation, NativeWatchId, UnavailableSensor};
pub use window::{PageWindow, STATE_ATTR, SYNC_EVENT};

//! Types shared by the privileged background, the per-page relay and the page
//! realm.
//!
//! - `geodesy`: haversine distance and degree interpolation.
//! - `state`: the canonical `SpoofState`, its partial `StatePatch` form and
//!   input validation.
//! - `message`: the runtime message protocol and the channel used to reach
//!   the background.

pub mod geodesy;
pub mod message;
pub mod state;

pub use message::{ChannelClosed, Envelope, GeoConsumer, Message, PageId, Response, RuntimeSender};
pub use state::{ConfigurationError, Coordinate, SpoofState, StatePatch};

//! gpurelay-placement — choosing which node runs next.
//!
//! Selection is a function of a node snapshot only. It never touches the
//! registry and never changes node state. The one piece of cross-call
//! state, the round-robin cursor, is owned by the caller and passed in.
//!
//! # Components
//!
//! - **`policy`**: candidate filter, the four strategies, emergency pick
//! - **`cursor`**: round-robin cursor for [`Strategy::RoundRobin`]
//!
//! [`Strategy::RoundRobin`]: gpurelay_state::Strategy::RoundRobin

pub mod cursor;
pub mod policy;

pub use cursor::RoundRobinCursor;
pub use policy::{MIN_SELECTABLE_QUOTA_SECS, candidates, select_emergency, select_next};

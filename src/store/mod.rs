//! Reactive protocol state.
//!
//! [`BlockPolledStore`] keeps an immutable [`StoreState`] snapshot that is
//! refreshed on every block; [`CachedReader`] serves reads from it.

mod block_polled;
mod cache;
mod state;

pub use block_polled::{BlockPolledStore, StopHandle};
pub use cache::CachedReader;
pub use state::{BaseState, DerivedState, ExtraState, ExtraUpdate, StoreChange, StoreState, StoreUpdate};

//! Domain types shared by the remote readers, the hint engine and the store.

mod decimal;
mod deposits;
mod position;

pub use decimal::*;
pub use deposits::*;
pub use position::*;

#![deny(unreachable_pub)]

// Core modules
pub mod consts;
mod errors;
mod helpers;
mod prelude;
mod req;

pub mod contracts;
pub mod types;

// Feature modules
pub mod block;
pub mod client;
pub mod config;
pub mod estimate;
pub mod fees;
pub mod hints;
pub mod logging;
pub mod populate;
pub mod redemption;
pub mod remote;
pub mod simulation;
pub mod store;

#[cfg(test)]
mod tests;

// Re-exports
pub use block::{BlockSource, BlockSubscription, PollingBlockSource, WsBlockSource};
pub use client::{ProtocolClient, StoreClient, ZeroClient};
pub use config::{ClientConfig, StoreMode};
pub use contracts::AddressBook;
pub use errors::{Error, HttpErrorKind};
pub use fees::{FeeParameters, Fees};
pub use helpers::trial_batches;
pub use hints::{HintSearch, HintSearchConfig};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use populate::{PopulatedCall, PopulatedPositionChange, Populator};
pub use redemption::{Redemption, RedemptionSizer};
pub use remote::{BlockTag, HintHelpers, ProtocolReader, RpcProtocol};
pub use req::JsonRpcClient;
pub use store::{BlockPolledStore, CachedReader, StoreChange, StoreState};
pub use types::*;

//! Client configuration, loaded from TOML.
//!
//! ```toml
//! rpc_url = "https://public-node.rsk.co"
//! user_address = "0x..."
//!
//! [store]
//! mode = "block_polled"
//! poll_interval_ms = 15000
//!
//! [hints]
//! trialsFactor = 15.0
//!
//! [addresses]
//! activePool = "0x..."
//! # one entry per deployed contract
//! ```

use std::path::Path;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::{contracts::AddressBook, hints::HintSearchConfig, logging::LogConfig, prelude::*, Error};

/// How (and whether) the client keeps a state store.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StoreMode {
    /// Plain client, every read goes to the node.
    #[default]
    None,
    /// Store driven by `eth_blockNumber` polling.
    BlockPolled {
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
    },
    /// Store driven by `newHeads` over `ws_url`.
    Notifications,
}

fn default_poll_interval_ms() -> u64 {
    // Roughly one RSK block.
    30_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ClientConfig {
    /// HTTP JSON-RPC endpoint
    pub rpc_url: String,
    /// WebSocket endpoint, required for `StoreMode::Notifications`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    /// Account whose position and balances are read by default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_address: Option<Address>,
    /// Frontend tag used for stability pool deposits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend_tag: Option<Address>,
    /// Retries per HTTP request after the first attempt (default: 0)
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub store: StoreMode,
    #[serde(default)]
    pub hints: HintSearchConfig,
    #[serde(default)]
    pub logging: LogConfig,
    pub addresses: AddressBook,
}

impl ClientConfig {
    pub fn new(rpc_url: impl Into<String>, addresses: AddressBook) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            ws_url: None,
            user_address: None,
            frontend_tag: None,
            max_retries: 0,
            request_timeout_ms: default_request_timeout_ms(),
            store: StoreMode::default(),
            hints: HintSearchConfig::default(),
            logging: LogConfig::default(),
            addresses,
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.rpc_url.starts_with("http://") || self.rpc_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "rpc_url must be an http(s) URL, got '{}'",
                self.rpc_url
            )));
        }

        let missing = self.addresses.missing();
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "missing contract addresses: {}",
                missing.join(", ")
            )));
        }

        match &self.store {
            StoreMode::BlockPolled { poll_interval_ms } if *poll_interval_ms == 0 => {
                return Err(Error::Config("poll_interval_ms must be positive".to_string()));
            }
            StoreMode::Notifications if self.ws_url.is_none() => {
                return Err(Error::Config(
                    "store mode 'notifications' requires ws_url".to_string(),
                ));
            }
            _ => {}
        }

        if self.request_timeout_ms == 0 {
            return Err(Error::Config("request_timeout_ms must be positive".to_string()));
        }

        self.hints.validate()
    }
}

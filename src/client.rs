//! Entry point tying the components together.
//!
//! Whether a client keeps a state store is decided once, at construction:
//! [`ZeroClient::Plain`] reads everything from the node, while
//! [`ZeroClient::WithStore`] routes reads through the store's snapshot.

use std::{sync::Arc, time::Duration};

use alloy::primitives::Address;
use reqwest::Client;
use tracing::info;

use crate::{
    block::{BlockSource, PollingBlockSource, WsBlockSource},
    config::{ClientConfig, StoreMode},
    contracts::AddressBook,
    hints::{HintSearch, HintSearchConfig},
    populate::Populator,
    prelude::*,
    redemption::{Redemption, RedemptionSizer},
    remote::{HintHelpers, ProtocolReader, RpcProtocol},
    req::JsonRpcClient,
    store::{BlockPolledStore, CachedReader, StopHandle, StoreState},
    types::{Decimal, Position},
    Error,
};

/// Hint search, redemption sizing and transaction population over one reader.
#[derive(Clone)]
pub struct ProtocolClient {
    reader: Arc<dyn ProtocolReader>,
    hint_search: HintSearch,
    redemptions: RedemptionSizer,
    populator: Populator,
}

impl ProtocolClient {
    pub fn new(
        reader: Arc<dyn ProtocolReader>,
        helpers: Arc<dyn HintHelpers>,
        addresses: AddressBook,
        hints: HintSearchConfig,
    ) -> Self {
        let hint_search = HintSearch::new(Arc::clone(&reader), Arc::clone(&helpers), hints);
        let redemptions = RedemptionSizer::new(Arc::clone(&reader), helpers, hint_search.clone());
        let populator = Populator::new(Arc::clone(&reader), hint_search.clone(), addresses);
        Self {
            reader,
            hint_search,
            redemptions,
            populator,
        }
    }

    pub fn reader(&self) -> &Arc<dyn ProtocolReader> {
        &self.reader
    }

    pub fn hint_search(&self) -> &HintSearch {
        &self.hint_search
    }

    pub fn populator(&self) -> &Populator {
        &self.populator
    }

    pub async fn find_hints(&self, position: &Position) -> Result<(Address, Address)> {
        self.hint_search.find_hints_for_position(position).await
    }

    pub async fn prepare_redemption(
        &self,
        amount: Decimal,
        max_redemption_rate: Option<Decimal>,
    ) -> Result<Redemption> {
        self.redemptions.prepare(amount, max_redemption_rate).await
    }
}

/// A [`ProtocolClient`] reading through a [`BlockPolledStore`].
#[derive(Clone)]
pub struct StoreClient {
    client: ProtocolClient,
    store: BlockPolledStore,
}

impl StoreClient {
    pub fn new(
        reader: Arc<dyn ProtocolReader>,
        helpers: Arc<dyn HintHelpers>,
        blocks: Arc<dyn BlockSource>,
        addresses: AddressBook,
        hints: HintSearchConfig,
    ) -> Self {
        let store = BlockPolledStore::new(Arc::clone(&reader), blocks);
        let cached: Arc<dyn ProtocolReader> = Arc::new(CachedReader::new(reader, store.clone()));
        Self {
            client: ProtocolClient::new(cached, helpers, addresses, hints),
            store,
        }
    }

    pub fn store(&self) -> &BlockPolledStore {
        &self.store
    }

    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    pub async fn start(&self) -> Result<StopHandle> {
        self.store.start().await
    }

    pub fn state(&self) -> Option<Arc<StoreState>> {
        self.store.state()
    }
}

#[derive(Clone)]
pub enum ZeroClient {
    Plain(ProtocolClient),
    WithStore(StoreClient),
}

impl ZeroClient {
    /// Build a client talking to the node in `config`. Nothing is fetched
    /// until the first read, and a store is not started until asked to.
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| Error::GenericRequest(e.to_string()))?;
        let rpc = Arc::new(JsonRpcClient::new(http, config.rpc_url.clone()).with_max_retries(config.max_retries));
        let protocol = Arc::new(RpcProtocol::new(
            Arc::clone(&rpc),
            config.addresses.clone(),
            config.user_address,
            config.frontend_tag,
        ));

        let blocks: Option<Arc<dyn BlockSource>> = match &config.store {
            StoreMode::None => None,
            StoreMode::BlockPolled { poll_interval_ms } => Some(Arc::new(PollingBlockSource::new(
                Arc::clone(&rpc),
                Duration::from_millis(*poll_interval_ms),
            ))),
            StoreMode::Notifications => {
                let url = config
                    .ws_url
                    .clone()
                    .ok_or_else(|| Error::Config("store mode 'notifications' requires ws_url".to_string()))?;
                Some(Arc::new(WsBlockSource::new(url)))
            }
        };

        info!(
            rpc_url = %config.rpc_url,
            user = ?config.user_address,
            store = ?config.store,
            "Connecting client"
        );

        Ok(Self::from_parts(
            protocol.clone(),
            protocol,
            blocks,
            config.addresses.clone(),
            config.hints,
        ))
    }

    /// Assemble a client from arbitrary remote implementations. A store is
    /// kept iff a block source is given.
    pub fn from_parts(
        reader: Arc<dyn ProtocolReader>,
        helpers: Arc<dyn HintHelpers>,
        blocks: Option<Arc<dyn BlockSource>>,
        addresses: AddressBook,
        hints: HintSearchConfig,
    ) -> Self {
        match blocks {
            Some(blocks) => ZeroClient::WithStore(StoreClient::new(reader, helpers, blocks, addresses, hints)),
            None => ZeroClient::Plain(ProtocolClient::new(reader, helpers, addresses, hints)),
        }
    }

    pub fn client(&self) -> &ProtocolClient {
        match self {
            ZeroClient::Plain(client) => client,
            ZeroClient::WithStore(client) => client.client(),
        }
    }

    pub fn store(&self) -> Option<&BlockPolledStore> {
        match self {
            ZeroClient::Plain(_) => None,
            ZeroClient::WithStore(client) => Some(client.store()),
        }
    }
}

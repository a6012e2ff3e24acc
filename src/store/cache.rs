//! [`ProtocolReader`] that answers from the store's snapshot when it can.
//!
//! A read is a hit when its block tag is unset or equals the snapshot's, and
//! for user-scoped reads when the address is unset or is the connection's own.
//! Everything else goes to the wrapped reader.

use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;

use crate::{
    fees::{FeeParameters, Fees},
    prelude::*,
    remote::{BlockTag, ProtocolReader},
    store::{block_polled::BlockPolledStore, state::StoreState},
    types::{
        Decimal, FrontendStatus, Position, PositionListing, PositionWithPendingRedistribution,
        StabilityDeposit, ZeroStake,
    },
};

#[derive(Clone)]
pub struct CachedReader {
    reader: Arc<dyn ProtocolReader>,
    store: BlockPolledStore,
}

impl CachedReader {
    pub fn new(reader: Arc<dyn ProtocolReader>, store: BlockPolledStore) -> Self {
        Self { reader, store }
    }

    pub fn store(&self) -> &BlockPolledStore {
        &self.store
    }

    fn cached(&self, tag: BlockTag) -> Option<Arc<StoreState>> {
        self.store
            .state()
            .filter(|state| tag.is_none() || tag == state.block_tag())
    }

    fn is_user(&self, address: Option<Address>) -> bool {
        match (address, self.reader.user_address()) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(address), Some(user)) => address == user,
        }
    }

    fn cached_for_user(&self, address: Option<Address>, tag: BlockTag) -> Option<Arc<StoreState>> {
        if !self.is_user(address) {
            return None;
        }
        self.cached(tag)
    }
}

#[async_trait]
impl ProtocolReader for CachedReader {
    fn user_address(&self) -> Option<Address> {
        self.reader.user_address()
    }

    fn frontend_tag(&self) -> Option<Address> {
        self.reader.frontend_tag()
    }

    async fn block_timestamp(&self, tag: BlockTag) -> Result<u64> {
        match self.cached(tag) {
            Some(state) => Ok(state.extra.block_timestamp),
            None => self.reader.block_timestamp(tag).await,
        }
    }

    async fn total_redistributed(&self, tag: BlockTag) -> Result<Position> {
        match self.cached(tag) {
            Some(state) => Ok(state.base.total_redistributed),
            None => self.reader.total_redistributed(tag).await,
        }
    }

    async fn position_before_redistribution(
        &self,
        address: Option<Address>,
        tag: BlockTag,
    ) -> Result<PositionWithPendingRedistribution> {
        match self.cached_for_user(address, tag) {
            Some(state) => Ok(state.base.position_before_redistribution),
            None => self.reader.position_before_redistribution(address, tag).await,
        }
    }

    async fn number_of_positions(&self, tag: BlockTag) -> Result<u64> {
        match self.cached(tag) {
            Some(state) => Ok(state.base.number_of_positions),
            None => self.reader.number_of_positions(tag).await,
        }
    }

    async fn price(&self, tag: BlockTag) -> Result<Decimal> {
        match self.cached(tag) {
            Some(state) => Ok(state.base.price),
            None => self.reader.price(tag).await,
        }
    }

    async fn total(&self, tag: BlockTag) -> Result<Position> {
        match self.cached(tag) {
            Some(state) => Ok(state.base.total),
            None => self.reader.total(tag).await,
        }
    }

    async fn stability_deposit(
        &self,
        address: Option<Address>,
        tag: BlockTag,
    ) -> Result<StabilityDeposit> {
        match self.cached_for_user(address, tag) {
            Some(state) => Ok(state.base.stability_deposit),
            None => self.reader.stability_deposit(address, tag).await,
        }
    }

    async fn remaining_stability_pool_zero_reward(&self, tag: BlockTag) -> Result<Decimal> {
        match self.cached(tag) {
            Some(state) => Ok(state.base.remaining_stability_pool_zero_reward),
            None => self.reader.remaining_stability_pool_zero_reward(tag).await,
        }
    }

    async fn zusd_in_stability_pool(&self, tag: BlockTag) -> Result<Decimal> {
        match self.cached(tag) {
            Some(state) => Ok(state.base.zusd_in_stability_pool),
            None => self.reader.zusd_in_stability_pool(tag).await,
        }
    }

    async fn zusd_balance(&self, address: Option<Address>, tag: BlockTag) -> Result<Decimal> {
        match self.cached_for_user(address, tag) {
            Some(state) => Ok(state.base.zusd_balance),
            None => self.reader.zusd_balance(address, tag).await,
        }
    }

    async fn zero_balance(&self, address: Option<Address>, tag: BlockTag) -> Result<Decimal> {
        match self.cached_for_user(address, tag) {
            Some(state) => Ok(state.base.zero_balance),
            None => self.reader.zero_balance(address, tag).await,
        }
    }

    async fn account_balance(&self, address: Option<Address>, tag: BlockTag) -> Result<Decimal> {
        match self.cached_for_user(address, tag) {
            Some(state) => Ok(state.base.account_balance),
            None => self.reader.account_balance(address, tag).await,
        }
    }

    async fn collateral_surplus_balance(
        &self,
        address: Option<Address>,
        tag: BlockTag,
    ) -> Result<Decimal> {
        match self.cached_for_user(address, tag) {
            Some(state) => Ok(state.base.collateral_surplus_balance),
            None => self.reader.collateral_surplus_balance(address, tag).await,
        }
    }

    // The snapshot only keeps the fee calculator, not the raw parameters.
    async fn fee_parameters(&self, tag: BlockTag) -> Result<FeeParameters> {
        self.reader.fee_parameters(tag).await
    }

    async fn zero_stake(&self, address: Option<Address>, tag: BlockTag) -> Result<ZeroStake> {
        match self.cached_for_user(address, tag) {
            Some(state) => Ok(state.base.zero_stake),
            None => self.reader.zero_stake(address, tag).await,
        }
    }

    async fn total_staked_zero(&self, tag: BlockTag) -> Result<Decimal> {
        match self.cached(tag) {
            Some(state) => Ok(state.base.total_staked_zero),
            None => self.reader.total_staked_zero(tag).await,
        }
    }

    async fn frontend_status(
        &self,
        address: Option<Address>,
        tag: BlockTag,
    ) -> Result<FrontendStatus> {
        if let Some(state) = self.cached(tag) {
            let frontend = self.reader.frontend_tag();
            if frontend.is_some() && address.or(frontend) == frontend {
                return Ok(state.base.frontend);
            }
            if address.is_some() && self.is_user(address) {
                return Ok(state.base.own_frontend);
            }
        }
        self.reader.frontend_status(address, tag).await
    }

    async fn positions_before_redistribution(
        &self,
        listing: PositionListing,
        tag: BlockTag,
    ) -> Result<Vec<PositionWithPendingRedistribution>> {
        self.reader.positions_before_redistribution(listing, tag).await
    }

    async fn fees(&self, tag: BlockTag) -> Result<Fees> {
        match self.cached(tag) {
            Some(state) => Ok(state.derived.fees),
            None => {
                let (parameters, total, price, block_timestamp) = tokio::try_join!(
                    self.reader.fee_parameters(tag),
                    self.reader.total(tag),
                    self.reader.price(tag),
                    self.reader.block_timestamp(tag)
                )?;
                Ok(parameters.at(block_timestamp, total.is_below_critical(price)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        simulation::{ManualBlockSource, SimulatedChain},
        Error,
    };

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn owner(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    async fn loaded_cache() -> (SimulatedChain, CachedReader, u64) {
        let chain = SimulatedChain::new(1_700_000_000).connect_as(Some(owner(1)), None);
        chain.open_position(owner(1), Position::new(d("10"), d("1020")));
        chain.open_position(owner(2), Position::new(d("20"), d("1520")));
        let block = chain.mine_block();

        let store = BlockPolledStore::new(Arc::new(chain.clone()), Arc::new(ManualBlockSource::new()));
        let handle = store.start().await.unwrap();
        store.wait_loaded().await.unwrap();
        handle.stop().await;

        // Move the live chain on so that hits and misses are distinguishable.
        chain.set_price(d("150"));
        chain.open_position(owner(1), Position::new(d("12"), d("1020")));

        (chain.clone(), CachedReader::new(Arc::new(chain), store), block)
    }

    #[tokio::test]
    async fn test_untagged_read_hits_snapshot() {
        let (_, cache, _) = loaded_cache().await;
        assert_eq!(cache.price(None).await.unwrap(), d("200"));
        assert_eq!(
            cache.position(None, None).await.unwrap().position,
            Position::new(d("10"), d("1020"))
        );
    }

    #[tokio::test]
    async fn test_other_tag_falls_through() {
        let (chain, cache, block) = loaded_cache().await;
        // The snapshot is untagged, so any explicit tag misses.
        assert_eq!(cache.price(Some(block)).await.unwrap(), d("200"));
        chain.mine_block();
        assert_eq!(cache.price(Some(block + 1)).await.unwrap(), d("150"));
    }

    #[tokio::test]
    async fn test_other_address_falls_through() {
        let (_, cache, _) = loaded_cache().await;
        let own = cache.position(Some(owner(1)), None).await.unwrap();
        assert_eq!(own.position.collateral, d("10"));

        let other = cache.position(Some(owner(2)), None).await.unwrap();
        assert_eq!(other.position, Position::new(d("20"), d("1520")));
    }

    #[tokio::test]
    async fn test_unloaded_store_falls_through() {
        let chain = SimulatedChain::new(1_700_000_000);
        chain.set_price(d("123"));
        let store = BlockPolledStore::new(Arc::new(chain.clone()), Arc::new(ManualBlockSource::new()));
        let cache = CachedReader::new(Arc::new(chain), store);

        assert_eq!(cache.price(None).await.unwrap(), d("123"));
        assert!(matches!(cache.zusd_balance(None, None).await, Err(Error::NoUserAddress)));
    }

    #[tokio::test]
    async fn test_tagged_snapshot_hits_same_tag() {
        let chain = SimulatedChain::new(1_700_000_000).connect_as(Some(owner(1)), None);
        let block = chain.mine_block();
        chain.set_price(d("150"));

        let blocks = ManualBlockSource::new();
        let store = BlockPolledStore::new(Arc::new(chain.clone()), Arc::new(blocks.clone()));
        let mut changes = store.on_change();
        let handle = store.start().await.unwrap();
        changes.recv().await.unwrap();
        blocks.announce(block);
        let change = changes.recv().await.unwrap();
        assert_eq!(change.state.block_tag(), Some(block));
        handle.stop().await;

        chain.set_price(d("1"));
        let cache = CachedReader::new(Arc::new(chain), store);
        assert_eq!(cache.price(Some(block)).await.unwrap(), d("200"));
        assert_eq!(cache.price(None).await.unwrap(), d("200"));
        assert_eq!(cache.block_timestamp(Some(block)).await.unwrap(), 1_700_000_030);
    }
}

//! Store that refreshes its snapshot on every new block.
//!
//! One driver task owns the snapshot. It receives block numbers from a
//! [`BlockSource`], spawns one snapshot fetch per block and applies the
//! results in the order they complete. At most one block fetch runs at a
//! time; blocks announced meanwhile collapse into the newest one.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use alloy::primitives::Address;
use tokio::{
    sync::{
        broadcast,
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot, watch,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    block::{BlockSource, BlockSubscription},
    prelude::*,
    remote::{BlockTag, ProtocolReader},
    store::state::{BaseState, ExtraUpdate, StoreChange, StoreState, StoreUpdate},
    types::{
        FrontendStatus, PositionListing, PositionWithPendingRedistribution, SortOrder,
        StabilityDeposit, ZeroStake,
    },
    Decimal, Error,
};

/// Capacity of the change broadcast; slow listeners skip ahead.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

struct FetchResult {
    tag: BlockTag,
    outcome: Result<StoreUpdate>,
}

struct Inner {
    reader: Arc<dyn ProtocolReader>,
    blocks: Arc<dyn BlockSource>,
    state: watch::Sender<Option<Arc<StoreState>>>,
    changes: broadcast::Sender<StoreChange>,
    started: AtomicBool,
}

/// Block-driven snapshot of everything a frontend shows. Clones share state.
#[derive(Clone)]
pub struct BlockPolledStore {
    inner: Arc<Inner>,
}

impl BlockPolledStore {
    pub fn new(reader: Arc<dyn ProtocolReader>, blocks: Arc<dyn BlockSource>) -> Self {
        let (state, _) = watch::channel(None);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                reader,
                blocks,
                state,
                changes,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Current snapshot, `None` until the first fetch completes.
    pub fn state(&self) -> Option<Arc<StoreState>> {
        self.inner.state.borrow().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.state.borrow().is_some()
    }

    /// Receiver of one [`StoreChange`] per applied update.
    pub fn on_change(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.changes.subscribe()
    }

    /// Resolves with the first snapshot once the store has loaded.
    pub async fn wait_loaded(&self) -> Result<Arc<StoreState>> {
        let mut receiver = self.inner.state.subscribe();
        let state = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::UnsupportedOperation("store shut down before loading".to_string()))?;
        state
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| Error::UnsupportedOperation("store shut down before loading".to_string()))
    }

    /// Fire the initial untagged fetch, subscribe to blocks and spawn the
    /// driver. A store can only be started once.
    pub async fn start(&self) -> Result<StopHandle> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::UnsupportedOperation("store already started".to_string()));
        }

        let (results_tx, results_rx) = unbounded_channel();
        spawn_fetch(Arc::clone(&self.inner.reader), None, results_tx.clone());

        let subscription = match self.inner.blocks.subscribe().await {
            Ok(subscription) => subscription,
            Err(err) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let driver = tokio::spawn(drive(
            Arc::clone(&self.inner),
            subscription,
            results_tx,
            results_rx,
            stop_rx,
        ));
        info!("Store started");

        Ok(StopHandle {
            stop: Some(stop_tx),
            driver,
        })
    }
}

/// Stops a started store. In-flight fetches run to completion but their
/// results are discarded.
#[derive(Debug)]
pub struct StopHandle {
    stop: Option<oneshot::Sender<()>>,
    driver: JoinHandle<()>,
}

impl StopHandle {
    /// Unsubscribe from blocks and wait for the driver to exit.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(err) = (&mut self.driver).await {
            warn!(error = %err, "Store driver ended abnormally");
        }
    }
}

impl Inner {
    fn apply(&self, update: StoreUpdate) {
        let old_state = self.state.borrow().clone();

        let new_state = match &old_state {
            None => StoreState::load(update),
            Some(_) if update.extra.block_tag.is_none() => {
                // Only the very first fetch is untagged; once a block fetch has
                // loaded the store it is the fresher of the two.
                debug!("Dropping untagged snapshot, store already loaded");
                return;
            }
            Some(old) => old.reduce(update),
        };

        let new_state = Arc::new(new_state);
        let changed = old_state
            .as_ref()
            .map(|old| new_state.base.changed_fields(&old.base))
            .unwrap_or_default();

        match &old_state {
            None => info!(block = ?new_state.block_tag(), "Store loaded"),
            Some(_) => debug!(block = ?new_state.block_tag(), ?changed, "Store updated"),
        }

        self.state.send_replace(Some(Arc::clone(&new_state)));
        // No listeners is fine.
        let _ = self.changes.send(StoreChange {
            state: new_state,
            old_state,
            changed,
        });
    }
}

fn spawn_fetch(reader: Arc<dyn ProtocolReader>, tag: BlockTag, results: UnboundedSender<FetchResult>) {
    tokio::spawn(async move {
        let outcome = fetch_snapshot(reader.as_ref(), tag).await;
        // The driver may have stopped meanwhile.
        let _ = results.send(FetchResult { tag, outcome });
    });
}

async fn drive(
    inner: Arc<Inner>,
    mut blocks: BlockSubscription,
    results_tx: UnboundedSender<FetchResult>,
    mut results: UnboundedReceiver<FetchResult>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut block_fetch_in_flight = false;
    let mut pending_block: Option<u64> = None;
    let mut blocks_open = true;

    loop {
        tokio::select! {
            _ = &mut stop => break,

            block = blocks.next(), if blocks_open => match block {
                Some(block) if block_fetch_in_flight => {
                    if let Some(skipped) = pending_block.replace(block) {
                        debug!(skipped, block, "Coalescing block notifications");
                    }
                }
                Some(block) => {
                    spawn_fetch(Arc::clone(&inner.reader), Some(block), results_tx.clone());
                    block_fetch_in_flight = true;
                }
                None => {
                    warn!("Block subscription ended, store will no longer update");
                    blocks_open = false;
                }
            },

            Some(result) = results.recv() => {
                if result.tag.is_some() {
                    block_fetch_in_flight = false;
                }

                match result.outcome {
                    Ok(update) => inner.apply(update),
                    Err(err) => warn!(block = ?result.tag, error = %err, "Dropping failed snapshot fetch"),
                }

                if !block_fetch_in_flight {
                    if let Some(block) = pending_block.take() {
                        spawn_fetch(Arc::clone(&inner.reader), Some(block), results_tx.clone());
                        block_fetch_in_flight = true;
                    }
                }
            }
        }
    }

    debug!("Store driver stopped");
}

// ============================================================================
// Snapshot fetch
// ============================================================================

struct UserReads {
    account_balance: Decimal,
    zusd_balance: Decimal,
    zero_balance: Decimal,
    collateral_surplus_balance: Decimal,
    position_before_redistribution: PositionWithPendingRedistribution,
    stability_deposit: StabilityDeposit,
    zero_stake: ZeroStake,
    own_frontend: FrontendStatus,
}

impl UserReads {
    fn empty() -> Self {
        Self {
            account_balance: Decimal::ZERO,
            zusd_balance: Decimal::ZERO,
            zero_balance: Decimal::ZERO,
            collateral_surplus_balance: Decimal::ZERO,
            position_before_redistribution: PositionWithPendingRedistribution::empty(Address::ZERO),
            stability_deposit: StabilityDeposit::default(),
            zero_stake: ZeroStake::default(),
            own_frontend: FrontendStatus::Unregistered,
        }
    }
}

async fn user_reads(reader: &dyn ProtocolReader, tag: BlockTag) -> Result<UserReads> {
    let Some(user) = reader.user_address() else {
        return Ok(UserReads::empty());
    };
    let user = Some(user);

    let (
        account_balance,
        zusd_balance,
        zero_balance,
        collateral_surplus_balance,
        position_before_redistribution,
        stability_deposit,
        zero_stake,
        own_frontend,
    ) = tokio::try_join!(
        reader.account_balance(user, tag),
        reader.zusd_balance(user, tag),
        reader.zero_balance(user, tag),
        reader.collateral_surplus_balance(user, tag),
        reader.position_before_redistribution(user, tag),
        reader.stability_deposit(user, tag),
        reader.zero_stake(user, tag),
        reader.frontend_status(user, tag),
    )?;

    Ok(UserReads {
        account_balance,
        zusd_balance,
        zero_balance,
        collateral_surplus_balance,
        position_before_redistribution,
        stability_deposit,
        zero_stake,
        own_frontend,
    })
}

async fn frontend(reader: &dyn ProtocolReader, tag: BlockTag) -> Result<FrontendStatus> {
    match reader.frontend_tag() {
        Some(frontend) => reader.frontend_status(Some(frontend), tag).await,
        None => Ok(FrontendStatus::Unregistered),
    }
}

async fn riskiest_position(
    reader: &dyn ProtocolReader,
    tag: BlockTag,
) -> Result<PositionWithPendingRedistribution> {
    let listing = PositionListing {
        first: 1,
        sorted_by: SortOrder::AscendingCollateralRatio,
        start_index: 0,
    };
    let positions = reader.positions_before_redistribution(listing, tag).await?;
    Ok(positions
        .into_iter()
        .next()
        .unwrap_or_else(|| PositionWithPendingRedistribution::empty(Address::ZERO)))
}

/// Read every store field at `tag` concurrently.
pub(crate) async fn fetch_snapshot(reader: &dyn ProtocolReader, tag: BlockTag) -> Result<StoreUpdate> {
    let (
        block_timestamp,
        user,
        frontend,
        number_of_positions,
        price,
        zusd_in_stability_pool,
        total,
        total_redistributed,
        remaining_stability_pool_zero_reward,
        fee_parameters,
        total_staked_zero,
        riskiest_position_before_redistribution,
    ) = tokio::try_join!(
        reader.block_timestamp(tag),
        user_reads(reader, tag),
        frontend(reader, tag),
        reader.number_of_positions(tag),
        reader.price(tag),
        reader.zusd_in_stability_pool(tag),
        reader.total(tag),
        reader.total_redistributed(tag),
        reader.remaining_stability_pool_zero_reward(tag),
        reader.fee_parameters(tag),
        reader.total_staked_zero(tag),
        riskiest_position(reader, tag),
    )?;

    Ok(StoreUpdate {
        base: BaseState {
            frontend,
            own_frontend: user.own_frontend,
            number_of_positions,
            account_balance: user.account_balance,
            zusd_balance: user.zusd_balance,
            zero_balance: user.zero_balance,
            collateral_surplus_balance: user.collateral_surplus_balance,
            price,
            zusd_in_stability_pool,
            total,
            total_redistributed,
            position_before_redistribution: user.position_before_redistribution,
            stability_deposit: user.stability_deposit,
            remaining_stability_pool_zero_reward,
            fees_in_normal_mode: fee_parameters.at(block_timestamp, false),
            zero_stake: user.zero_stake,
            total_staked_zero,
            riskiest_position_before_redistribution,
        },
        extra: ExtraUpdate {
            block_tag: tag,
            block_timestamp: Some(block_timestamp),
        },
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::{
        simulation::{ManualBlockSource, SimulatedChain},
        types::Position,
    };

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn owner(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn setup() -> (SimulatedChain, ManualBlockSource, BlockPolledStore) {
        let chain = SimulatedChain::new(1_700_000_000).connect_as(Some(owner(1)), None);
        chain.open_position(owner(1), Position::new(d("10"), d("1020")));
        chain.open_position(owner(2), Position::new(d("20"), d("1520")));
        let blocks = ManualBlockSource::new();
        let store = BlockPolledStore::new(Arc::new(chain.clone()), Arc::new(blocks.clone()));
        (chain, blocks, store)
    }

    async fn next_change(changes: &mut broadcast::Receiver<StoreChange>) -> StoreChange {
        timeout(Duration::from_secs(5), changes.recv())
            .await
            .expect("no store change within 5s")
            .expect("change channel closed")
    }

    #[tokio::test]
    async fn test_initial_untagged_load() {
        let (_, _, store) = setup();
        assert!(!store.is_loaded());
        let mut changes = store.on_change();

        let handle = store.start().await.unwrap();
        let change = next_change(&mut changes).await;

        assert!(change.is_load());
        assert!(change.changed.is_empty());
        assert_eq!(change.state.block_tag(), None);
        assert_eq!(change.state.base.number_of_positions, 2);
        assert_eq!(change.state.position().owner, owner(1));
        assert_eq!(change.state.base.riskiest_position_before_redistribution.owner, owner(1));
        assert_eq!(store.wait_loaded().await.unwrap(), change.state);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (_, _, store) = setup();
        let handle = store.start().await.unwrap();
        let err = store.start().await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_block_fetch_is_pinned_and_merged() {
        let (chain, blocks, store) = setup();
        let block = chain.mine_block();
        chain.set_price(d("150"));

        let mut changes = store.on_change();
        let handle = store.start().await.unwrap();
        next_change(&mut changes).await;

        blocks.announce(block);
        let change = next_change(&mut changes).await;

        assert!(!change.is_load());
        assert_eq!(change.state.block_tag(), Some(block));
        // Pinned to the mined block, not the live price of 150.
        assert_eq!(change.state.price(), d("200"));
        assert_eq!(change.state.extra.block_timestamp, 1_700_000_030);
        assert!(change.changed.contains(&"price"));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_out_of_order_completion_ends_on_newest_block() {
        let (chain, blocks, store) = setup();
        let first = chain.mine_block();
        chain.set_price(d("210"));
        let second = chain.mine_block();

        let gate = chain.gate_block(first);
        let mut changes = store.on_change();
        let handle = store.start().await.unwrap();
        next_change(&mut changes).await;

        blocks.announce(first);
        blocks.announce(second);
        sleep(Duration::from_millis(50)).await;
        // Nothing applied while the first fetch is held back.
        assert_eq!(store.state().unwrap().block_tag(), None);
        gate.open();

        assert_eq!(next_change(&mut changes).await.state.block_tag(), Some(first));
        let last = next_change(&mut changes).await;
        assert_eq!(last.state.block_tag(), Some(second));
        assert_eq!(last.state.price(), d("210"));
        assert_eq!(store.state().unwrap().block_tag(), Some(second));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_notifications_coalesce_while_fetching() {
        let (chain, blocks, store) = setup();
        let first = chain.mine_block();
        let second = chain.mine_block();
        let third = chain.mine_block();

        let gate = chain.gate_block(first);
        let mut changes = store.on_change();
        let handle = store.start().await.unwrap();
        next_change(&mut changes).await;

        blocks.announce(first);
        blocks.announce(second);
        blocks.announce(third);
        sleep(Duration::from_millis(50)).await;
        gate.open();

        assert_eq!(next_change(&mut changes).await.state.block_tag(), Some(first));
        assert_eq!(next_change(&mut changes).await.state.block_tag(), Some(third));
        sleep(Duration::from_millis(50)).await;
        assert!(matches!(changes.try_recv(), Err(broadcast::error::TryRecvError::Empty)));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_last_snapshot() {
        let (chain, blocks, store) = setup();
        let first = chain.mine_block();
        let failing = chain.mine_block();
        chain.set_price(d("180"));
        let third = chain.mine_block();
        chain.fail_block(failing);

        let mut changes = store.on_change();
        let handle = store.start().await.unwrap();
        next_change(&mut changes).await;

        blocks.announce(first);
        assert_eq!(next_change(&mut changes).await.state.block_tag(), Some(first));

        blocks.announce(failing);
        sleep(Duration::from_millis(50)).await;
        assert!(matches!(changes.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
        assert_eq!(store.state().unwrap().block_tag(), Some(first));

        blocks.announce(third);
        let change = next_change(&mut changes).await;
        assert_eq!(change.state.block_tag(), Some(third));
        assert_eq!(change.state.price(), d("180"));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_unsubscribes() {
        let (chain, blocks, store) = setup();
        let block = chain.mine_block();

        let mut changes = store.on_change();
        let handle = store.start().await.unwrap();
        next_change(&mut changes).await;
        assert_eq!(blocks.subscriber_count(), 1);

        handle.stop().await;
        assert_eq!(blocks.subscriber_count(), 0);

        blocks.announce(block);
        sleep(Duration::from_millis(50)).await;
        assert!(matches!(changes.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
        assert_eq!(store.state().unwrap().block_tag(), None);
    }

    #[tokio::test]
    async fn test_store_without_user_address() {
        let chain = SimulatedChain::new(1_700_000_000);
        let store = BlockPolledStore::new(Arc::new(chain), Arc::new(ManualBlockSource::new()));
        let handle = store.start().await.unwrap();

        let state = store.wait_loaded().await.unwrap();
        assert_eq!(state.user_address(), Address::ZERO);
        assert!(state.position().position.is_empty());
        assert_eq!(state.base.frontend, FrontendStatus::Unregistered);

        handle.stop().await;
    }
}

//! In-memory protocol for offline use and tests.
//!
//! [`SimulatedChain`] keeps protocol state in memory and implements both
//! [`ProtocolReader`] and [`HintHelpers`] with the same algorithms the
//! contracts use: random sampling for `getApproxHint`, a list walk for
//! `findInsertPosition` and the tail-first walk of `getRedemptionHints`.
//! Every [`SimulatedChain::mine_block`] freezes a snapshot, so reads pinned to
//! a block see that block's state.
//!
//! Reads pinned to a block can be held back with [`SimulatedChain::gate_block`]
//! or made to fail with [`SimulatedChain::fail_block`], which lets tests
//! control the order in which concurrent fetches complete.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
};

use alloy::primitives::{keccak256, Address, U256};
use async_trait::async_trait;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedSender},
    watch,
};
use tracing::{debug, info};

use crate::{
    block::{BlockSource, BlockSubscription},
    consts::{BETA, MINIMUM_REDEMPTION_RATE, ZUSD_LIQUIDATION_RESERVE, ZUSD_MINIMUM_NET_DEBT},
    fees::FeeParameters,
    prelude::*,
    remote::{ApproxHint, BlockTag, HintHelpers, ProtocolReader, RedemptionHintsResponse},
    types::{
        Decimal, FrontendStatus, Position, PositionListing, PositionStatus,
        PositionWithPendingRedistribution, SortOrder, StabilityDeposit, ZeroStake,
    },
    Error,
};

/// Default seconds between mined blocks.
pub const DEFAULT_BLOCK_TIME: u64 = 30;

/// Balances and deposits of one account.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountState {
    pub native: Decimal,
    pub zusd: Decimal,
    pub zero: Decimal,
    pub collateral_surplus: Decimal,
    pub stability_deposit: StabilityDeposit,
    pub zero_stake: ZeroStake,
}

#[derive(Clone, Debug)]
struct StoredPosition {
    status: PositionStatus,
    position: Position,
    stake: Decimal,
    snapshot: Position,
}

impl StoredPosition {
    fn with_owner(&self, owner: Address) -> PositionWithPendingRedistribution {
        PositionWithPendingRedistribution {
            owner,
            status: self.status,
            position: self.position,
            stake: self.stake,
            snapshot_of_total_redistributed: self.snapshot,
        }
    }
}

/// Protocol state at one point in time.
#[derive(Clone, Debug)]
pub struct ChainState {
    pub block_number: u64,
    pub block_timestamp: u64,
    pub price: Decimal,
    pub fee_parameters: FeeParameters,
    pub total_redistributed: Position,
    pub default_pool: Position,
    pub zusd_in_stability_pool: Decimal,
    pub remaining_stability_pool_zero_reward: Decimal,
    pub total_staked_zero: Decimal,
    pub frontends: HashMap<Address, FrontendStatus>,
    pub accounts: HashMap<Address, AccountState>,
    positions: HashMap<Address, StoredPosition>,
    /// Open positions in insertion order, like the LoC manager's owner array.
    owners: Vec<Address>,
}

/// One position touched by a redemption walk.
#[derive(Clone, Copy, Debug)]
struct RedemptionLot {
    owner: Address,
    zusd: Decimal,
    closes_position: bool,
}

#[derive(Clone, Debug)]
struct RedemptionWalk {
    first: Address,
    partial_nominal_ratio: Decimal,
    remaining: Decimal,
    lots: Vec<RedemptionLot>,
}

impl ChainState {
    fn new(block_timestamp: u64) -> Self {
        Self {
            block_number: 0,
            block_timestamp,
            price: Decimal::from(200u64),
            fee_parameters: FeeParameters {
                base_rate_without_decay: Decimal::ZERO,
                last_fee_operation_time: block_timestamp,
            },
            total_redistributed: Position::EMPTY,
            default_pool: Position::EMPTY,
            zusd_in_stability_pool: Decimal::ZERO,
            remaining_stability_pool_zero_reward: Decimal::ZERO,
            total_staked_zero: Decimal::ZERO,
            frontends: HashMap::new(),
            accounts: HashMap::new(),
            positions: HashMap::new(),
            owners: Vec::new(),
        }
    }

    /// Position with pending redistribution applied.
    fn current_position(&self, owner: &Address) -> Position {
        self.positions
            .get(owner)
            .map(|stored| stored.with_owner(*owner).apply_redistribution(&self.total_redistributed).position)
            .unwrap_or_default()
    }

    /// Open positions, highest nominal ratio first.
    fn sorted(&self) -> Vec<(Address, Position)> {
        let mut list: Vec<(Address, Position)> = self
            .owners
            .iter()
            .map(|owner| (*owner, self.current_position(owner)))
            .collect();
        list.sort_by(|(_, a), (_, b)| b.nominal_collateral_ratio().cmp(&a.nominal_collateral_ratio()));
        list
    }

    fn active_pool(&self) -> Position {
        self.owners
            .iter()
            .filter_map(|owner| self.positions.get(owner))
            .fold(Position::EMPTY, |total, stored| total.add(&stored.position))
    }

    fn total(&self) -> Position {
        self.active_pool().add(&self.default_pool)
    }

    fn account(&self, address: &Address) -> AccountState {
        self.accounts.get(address).cloned().unwrap_or_default()
    }

    fn redemption_walk(&self, amount: Decimal, price: Decimal, max_iterations: u64) -> RedemptionWalk {
        let list = self.sorted();
        let mut remaining = amount;
        let mut lots = Vec::new();
        let mut partial_nominal_ratio = Decimal::ZERO;

        // Walk from the tail, skipping positions that are liquidatable.
        let mut index = list.len();
        while index > 0 && list[index - 1].1.is_below_minimum(price) {
            index -= 1;
        }
        let first = if index > 0 { list[index - 1].0 } else { Address::ZERO };

        let mut iterations = if max_iterations == 0 { u64::MAX } else { max_iterations };

        while index > 0 && !remaining.is_zero() && iterations > 0 {
            iterations -= 1;
            let (owner, position) = list[index - 1];
            let net_debt = position.net_debt().unwrap_or_default();

            if net_debt > remaining {
                if net_debt > ZUSD_MINIMUM_NET_DEBT {
                    let lot = remaining.min(net_debt - ZUSD_MINIMUM_NET_DEBT);
                    let new_collateral = position.collateral.saturating_sub(lot / price);
                    let new_debt = net_debt - lot + ZUSD_LIQUIDATION_RESERVE;
                    partial_nominal_ratio =
                        Position::new(new_collateral, new_debt).nominal_collateral_ratio();
                    remaining -= lot;
                    lots.push(RedemptionLot {
                        owner,
                        zusd: lot,
                        closes_position: false,
                    });
                }
                break;
            }

            remaining -= net_debt;
            lots.push(RedemptionLot {
                owner,
                zusd: net_debt,
                closes_position: true,
            });
            index -= 1;
        }

        RedemptionWalk {
            first,
            partial_nominal_ratio,
            remaining,
            lots,
        }
    }
}

/// Failure and latency hooks, shared between all clones of a chain.
#[derive(Default)]
struct Hooks {
    gates: HashMap<u64, watch::Receiver<bool>>,
    untagged_gate: Option<watch::Receiver<bool>>,
    failing_blocks: HashSet<u64>,
}

/// Calls made through [`HintHelpers`], for assertions in tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallLog {
    pub first_in_list: u64,
    /// `(num_trials, input_seed, latest_random_seed)` per `getApproxHint` call.
    pub approx_hint: Vec<(u64, U256, U256)>,
    pub find_insert_position: Vec<(Decimal, Address, Address)>,
    pub redemption_hints: Vec<(Decimal, Decimal, u64)>,
}

/// Releases reads held back by [`SimulatedChain::gate_block`] or
/// [`SimulatedChain::gate_untagged`].
pub struct BlockGate {
    sender: watch::Sender<bool>,
}

impl BlockGate {
    pub fn open(&self) {
        let _ = self.sender.send(true);
    }
}

/// In-memory protocol. Clones share state.
#[derive(Clone)]
pub struct SimulatedChain {
    state: Arc<RwLock<ChainState>>,
    history: Arc<RwLock<BTreeMap<u64, ChainState>>>,
    hooks: Arc<Mutex<Hooks>>,
    calls: Arc<Mutex<CallLog>>,
    block_time: u64,
    user_address: Option<Address>,
    frontend_tag: Option<Address>,
}

impl SimulatedChain {
    pub fn new(block_timestamp: u64) -> Self {
        Self {
            state: Arc::new(RwLock::new(ChainState::new(block_timestamp))),
            history: Arc::new(RwLock::new(BTreeMap::new())),
            hooks: Arc::new(Mutex::new(Hooks::default())),
            calls: Arc::new(Mutex::new(CallLog::default())),
            block_time: DEFAULT_BLOCK_TIME,
            user_address: None,
            frontend_tag: None,
        }
    }

    /// A connection to the same chain on behalf of `user_address`.
    pub fn connect_as(&self, user_address: Option<Address>, frontend_tag: Option<Address>) -> Self {
        Self {
            user_address,
            frontend_tag,
            ..self.clone()
        }
    }

    /// Mutate the live (not yet mined) state.
    pub fn update<T>(&self, f: impl FnOnce(&mut ChainState) -> T) -> T {
        let mut state = self.state.write().unwrap();
        f(&mut state)
    }

    pub fn snapshot(&self) -> ChainState {
        self.state.read().unwrap().clone()
    }

    pub fn set_price(&self, price: Decimal) {
        self.update(|state| state.price = price);
    }

    pub fn set_fee_parameters(&self, fee_parameters: FeeParameters) {
        self.update(|state| state.fee_parameters = fee_parameters);
    }

    pub fn set_account(&self, address: Address, account: AccountState) {
        self.update(|state| {
            state.accounts.insert(address, account);
        });
    }

    /// Open a position the way `openLoC` would store it: stake equal to the
    /// collateral and a snapshot of the current redistribution totals.
    pub fn open_position(&self, owner: Address, position: Position) {
        self.update(|state| {
            let snapshot = state.total_redistributed;
            state.positions.insert(
                owner,
                StoredPosition {
                    status: PositionStatus::Open,
                    position,
                    stake: position.collateral,
                    snapshot,
                },
            );
            if !state.owners.contains(&owner) {
                state.owners.push(owner);
            }
        });
    }

    /// Freeze the live state as a new block and return its number.
    pub fn mine_block(&self) -> u64 {
        let frozen = self.update(|state| {
            state.block_number += 1;
            state.block_timestamp += self.block_time;
            state.clone()
        });
        let number = frozen.block_number;
        self.history.write().unwrap().insert(number, frozen);
        debug!(block = number, "Mined simulated block");
        number
    }

    /// Hold back reads pinned to `block` until the returned gate is opened.
    pub fn gate_block(&self, block: u64) -> BlockGate {
        let (sender, receiver) = watch::channel(false);
        self.hooks.lock().unwrap().gates.insert(block, receiver);
        BlockGate { sender }
    }

    /// Hold back reads of the latest state (no block tag) until the returned
    /// gate is opened.
    pub fn gate_untagged(&self) -> BlockGate {
        let (sender, receiver) = watch::channel(false);
        self.hooks.lock().unwrap().untagged_gate = Some(receiver);
        BlockGate { sender }
    }

    /// Make reads pinned to `block` fail with a transport error.
    pub fn fail_block(&self, block: u64) {
        self.hooks.lock().unwrap().failing_blocks.insert(block);
    }

    pub fn calls(&self) -> CallLog {
        self.calls.lock().unwrap().clone()
    }

    pub fn reset_calls(&self) {
        *self.calls.lock().unwrap() = CallLog::default();
    }

    /// Position as stored, without pending redistribution.
    pub fn stored_position(&self, owner: &Address) -> Option<(PositionStatus, Position)> {
        self.state
            .read()
            .unwrap()
            .positions
            .get(owner)
            .map(|stored| (stored.status, stored.position))
    }

    /// Execute `redeemCollateral` for `redeemer` against the live state.
    ///
    /// Returns the collateral paid out after the redemption fee.
    pub fn redeem_collateral(
        &self,
        redeemer: Address,
        amount: Decimal,
        max_iterations: u64,
        max_fee_percentage: Decimal,
    ) -> Result<Decimal> {
        let mut state = self.state.write().unwrap();
        let price = state.price;
        let walk = state.redemption_walk(amount, price, max_iterations);
        let redeemed = amount - walk.remaining;

        if redeemed.is_zero() {
            return Err(Error::UnsupportedOperation(
                "Unable to redeem any amount".to_string(),
            ));
        }

        let total_supply = state.total().debt;
        let collateral_drawn = redeemed / price;
        let decayed = state
            .fee_parameters
            .at(state.block_timestamp, false)
            .base_rate(None);
        let new_base_rate = (decayed + (redeemed / total_supply) / BETA).min(Decimal::ONE);
        let rate = (MINIMUM_REDEMPTION_RATE + new_base_rate).min(Decimal::ONE);

        if rate > max_fee_percentage {
            return Err(Error::UnsupportedOperation(
                "Fee exceeded provided maximum".to_string(),
            ));
        }

        for lot in &walk.lots {
            let current = state.current_position(&lot.owner);
            let lot_collateral = lot.zusd / price;

            if lot.closes_position {
                let surplus = current.collateral.saturating_sub(lot_collateral);
                state.owners.retain(|owner| owner != &lot.owner);
                if let Some(stored) = state.positions.get_mut(&lot.owner) {
                    stored.status = PositionStatus::ClosedByRedemption;
                    stored.position = Position::EMPTY;
                    stored.stake = Decimal::ZERO;
                }
                state
                    .accounts
                    .entry(lot.owner)
                    .or_default()
                    .collateral_surplus += surplus;
            } else {
                let snapshot = state.total_redistributed;
                if let Some(stored) = state.positions.get_mut(&lot.owner) {
                    stored.position = Position::new(
                        current.collateral.saturating_sub(lot_collateral),
                        current.debt - lot.zusd,
                    );
                    stored.snapshot = snapshot;
                }
            }
        }

        let fee = collateral_drawn * rate;
        let paid_out = collateral_drawn - fee;
        let timestamp = state.block_timestamp;
        state.fee_parameters = FeeParameters {
            base_rate_without_decay: new_base_rate,
            last_fee_operation_time: timestamp,
        };

        let account = state.accounts.entry(redeemer).or_default();
        account.zusd = account.zusd.saturating_sub(redeemed);
        account.native += paid_out;

        info!(%redeemer, %redeemed, %paid_out, "Simulated redemption");
        Ok(paid_out)
    }

    async fn wait_for_gate(&self, tag: BlockTag) -> Result<()> {
        let (gate, failing) = {
            let hooks = self.hooks.lock().unwrap();
            match tag {
                Some(block) => (hooks.gates.get(&block).cloned(), hooks.failing_blocks.contains(&block)),
                None => (hooks.untagged_gate.clone(), false),
            }
        };

        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }
        if failing {
            return Err(Error::GenericRequest(format!("simulated failure at block {tag:?}")));
        }
        Ok(())
    }

    fn read<T>(&self, tag: BlockTag, f: impl FnOnce(&ChainState) -> T) -> Result<T> {
        match tag {
            None => Ok(f(&self.state.read().unwrap())),
            Some(number) => {
                let history = self.history.read().unwrap();
                let state = history
                    .get(&number)
                    .ok_or_else(|| Error::InvalidResponse(format!("unknown block {number}")))?;
                Ok(f(state))
            }
        }
    }
}

fn next_seed(seed: U256) -> U256 {
    U256::from_be_bytes(keccak256(seed.to_be_bytes::<32>()).0)
}

fn abs_diff(a: Decimal, b: Decimal) -> U256 {
    if a > b {
        (a - b).raw()
    } else {
        (b - a).raw()
    }
}

#[async_trait]
impl HintHelpers for SimulatedChain {
    async fn first_in_list(&self) -> Result<Address> {
        self.calls.lock().unwrap().first_in_list += 1;
        self.read(None, |state| state.sorted().first().map(|(owner, _)| *owner).unwrap_or(Address::ZERO))
    }

    async fn approx_hint(
        &self,
        nominal_ratio: Decimal,
        num_trials: u64,
        random_seed: U256,
    ) -> Result<ApproxHint> {
        let hint = self.read(None, |state| {
            let mut latest_random_seed = random_seed;
            let Some((tail, tail_position)) = state.sorted().last().copied() else {
                return ApproxHint {
                    hint_address: Address::ZERO,
                    diff: U256::ZERO,
                    latest_random_seed,
                };
            };

            let mut hint_address = tail;
            let mut diff = abs_diff(tail_position.nominal_collateral_ratio(), nominal_ratio);
            let length = U256::from(state.owners.len());

            for _ in 1..num_trials {
                latest_random_seed = next_seed(latest_random_seed);
                let index = (latest_random_seed % length).as_limbs()[0] as usize;
                let candidate = state.owners[index];
                let candidate_diff = abs_diff(
                    state.current_position(&candidate).nominal_collateral_ratio(),
                    nominal_ratio,
                );
                if candidate_diff < diff {
                    diff = candidate_diff;
                    hint_address = candidate;
                }
            }

            ApproxHint {
                hint_address,
                diff,
                latest_random_seed,
            }
        })?;

        self.calls
            .lock()
            .unwrap()
            .approx_hint
            .push((num_trials, random_seed, hint.latest_random_seed));
        Ok(hint)
    }

    async fn find_insert_position(
        &self,
        nominal_ratio: Decimal,
        prev_id: Address,
        next_id: Address,
    ) -> Result<(Address, Address)> {
        self.calls
            .lock()
            .unwrap()
            .find_insert_position
            .push((nominal_ratio, prev_id, next_id));

        self.read(None, |state| {
            let list = state.sorted();
            match list
                .iter()
                .position(|(_, position)| position.nominal_collateral_ratio() <= nominal_ratio)
            {
                Some(0) => (Address::ZERO, list[0].0),
                Some(index) => (list[index - 1].0, list[index].0),
                None => (list.last().map(|(owner, _)| *owner).unwrap_or(Address::ZERO), Address::ZERO),
            }
        })
    }

    async fn redemption_hints(
        &self,
        amount: Decimal,
        price: Decimal,
        max_iterations: u64,
    ) -> Result<RedemptionHintsResponse> {
        self.calls
            .lock()
            .unwrap()
            .redemption_hints
            .push((amount, price, max_iterations));

        self.read(None, |state| {
            let walk = state.redemption_walk(amount, price, max_iterations);
            RedemptionHintsResponse {
                first_redemption_hint: walk.first,
                partial_redemption_hint_nicr: walk.partial_nominal_ratio,
                truncated_amount: amount - walk.remaining,
            }
        })
    }
}

#[async_trait]
impl ProtocolReader for SimulatedChain {
    fn user_address(&self) -> Option<Address> {
        self.user_address
    }

    fn frontend_tag(&self) -> Option<Address> {
        self.frontend_tag
    }

    async fn block_timestamp(&self, tag: BlockTag) -> Result<u64> {
        self.wait_for_gate(tag).await?;
        self.read(tag, |state| state.block_timestamp)
    }

    async fn total_redistributed(&self, tag: BlockTag) -> Result<Position> {
        self.read(tag, |state| state.total_redistributed)
    }

    async fn position_before_redistribution(
        &self,
        address: Option<Address>,
        tag: BlockTag,
    ) -> Result<PositionWithPendingRedistribution> {
        let owner = self.require_address(address)?;
        self.read(tag, |state| match state.positions.get(&owner) {
            Some(stored) if stored.status == PositionStatus::Open => stored.with_owner(owner),
            Some(stored) => PositionWithPendingRedistribution {
                status: stored.status,
                ..PositionWithPendingRedistribution::empty(owner)
            },
            None => PositionWithPendingRedistribution::empty(owner),
        })
    }

    async fn number_of_positions(&self, tag: BlockTag) -> Result<u64> {
        self.read(tag, |state| state.owners.len() as u64)
    }

    async fn price(&self, tag: BlockTag) -> Result<Decimal> {
        self.read(tag, |state| state.price)
    }

    async fn total(&self, tag: BlockTag) -> Result<Position> {
        self.read(tag, |state| state.total())
    }

    async fn stability_deposit(
        &self,
        address: Option<Address>,
        tag: BlockTag,
    ) -> Result<StabilityDeposit> {
        let address = self.require_address(address)?;
        self.read(tag, |state| state.account(&address).stability_deposit)
    }

    async fn remaining_stability_pool_zero_reward(&self, tag: BlockTag) -> Result<Decimal> {
        self.read(tag, |state| state.remaining_stability_pool_zero_reward)
    }

    async fn zusd_in_stability_pool(&self, tag: BlockTag) -> Result<Decimal> {
        self.read(tag, |state| state.zusd_in_stability_pool)
    }

    async fn zusd_balance(&self, address: Option<Address>, tag: BlockTag) -> Result<Decimal> {
        let address = self.require_address(address)?;
        self.read(tag, |state| state.account(&address).zusd)
    }

    async fn zero_balance(&self, address: Option<Address>, tag: BlockTag) -> Result<Decimal> {
        let address = self.require_address(address)?;
        self.read(tag, |state| state.account(&address).zero)
    }

    async fn account_balance(&self, address: Option<Address>, tag: BlockTag) -> Result<Decimal> {
        let address = self.require_address(address)?;
        self.read(tag, |state| state.account(&address).native)
    }

    async fn collateral_surplus_balance(
        &self,
        address: Option<Address>,
        tag: BlockTag,
    ) -> Result<Decimal> {
        let address = self.require_address(address)?;
        self.read(tag, |state| state.account(&address).collateral_surplus)
    }

    async fn fee_parameters(&self, tag: BlockTag) -> Result<FeeParameters> {
        self.read(tag, |state| state.fee_parameters)
    }

    async fn zero_stake(&self, address: Option<Address>, tag: BlockTag) -> Result<ZeroStake> {
        let address = self.require_address(address)?;
        self.read(tag, |state| state.account(&address).zero_stake)
    }

    async fn total_staked_zero(&self, tag: BlockTag) -> Result<Decimal> {
        self.read(tag, |state| state.total_staked_zero)
    }

    async fn frontend_status(
        &self,
        address: Option<Address>,
        tag: BlockTag,
    ) -> Result<FrontendStatus> {
        let frontend = self.require_frontend_tag(address)?;
        self.read(tag, |state| state.frontends.get(&frontend).copied().unwrap_or_default())
    }

    async fn positions_before_redistribution(
        &self,
        listing: PositionListing,
        tag: BlockTag,
    ) -> Result<Vec<PositionWithPendingRedistribution>> {
        self.read(tag, |state| {
            let mut list = state.sorted();
            if listing.sorted_by == SortOrder::AscendingCollateralRatio {
                list.reverse();
            }
            list.into_iter()
                .skip(listing.start_index as usize)
                .take(listing.first as usize)
                .filter_map(|(owner, _)| state.positions.get(&owner).map(|stored| stored.with_owner(owner)))
                .collect()
        })
    }
}

/// Block source driven by hand: every [`ManualBlockSource::announce`] is
/// delivered to all live subscriptions.
#[derive(Clone, Default)]
pub struct ManualBlockSource {
    subscribers: Arc<Mutex<Vec<UnboundedSender<u64>>>>,
}

impl ManualBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn announce(&self, block: u64) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|subscriber| subscriber.send(block).is_ok());
    }

    /// Number of subscriptions that haven't been dropped yet.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|subscriber| !subscriber.is_closed());
        subscribers.len()
    }
}

#[async_trait]
impl BlockSource for ManualBlockSource {
    async fn subscribe(&self) -> Result<BlockSubscription> {
        let (sender, receiver) = unbounded_channel();
        self.subscribers.lock().unwrap().push(sender);
        Ok(BlockSubscription::new(receiver, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn owner(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    /// Four positions at price 200, lowest collateral ratio first.
    fn four_positions() -> SimulatedChain {
        let chain = SimulatedChain::new(1_700_000_000);
        chain.open_position(owner(1), Position::new(d("10"), d("1020")));
        chain.open_position(owner(2), Position::new(d("11"), d("1020")));
        chain.open_position(owner(3), Position::new(d("20"), d("1520")));
        chain.open_position(owner(4), Position::new(d("50"), d("2020")));
        chain
    }

    #[tokio::test]
    async fn test_find_insert_position_is_exact() {
        let chain = four_positions();
        // nominal ratios: 1: 0.98, 2: 1.078, 3: 1.315, 4: 2.475
        let (prev, next) = chain
            .find_insert_position(d("1.2"), Address::ZERO, Address::ZERO)
            .await
            .unwrap();
        assert_eq!((prev, next), (owner(3), owner(2)));

        let (prev, next) = chain.find_insert_position(d("5"), owner(1), owner(1)).await.unwrap();
        assert_eq!((prev, next), (Address::ZERO, owner(4)));

        let (prev, next) = chain.find_insert_position(d("0.5"), owner(1), owner(1)).await.unwrap();
        assert_eq!((prev, next), (owner(1), Address::ZERO));
    }

    #[tokio::test]
    async fn test_redemption_hints_walk_from_tail() {
        let chain = four_positions();
        let hints = chain.redemption_hints(d("2001"), d("200"), 70).await.unwrap();

        assert_eq!(hints.first_redemption_hint, owner(1));
        assert_eq!(hints.truncated_amount, d("2001"));
        assert_eq!(
            hints.partial_redemption_hint_nicr,
            Position::new(d("19.995"), d("1519")).nominal_collateral_ratio()
        );
    }

    #[tokio::test]
    async fn test_redemption_hints_skip_undercollateralized() {
        let chain = four_positions();
        // at price 105 position 1 sits at 1.029 and position 2 at 1.132
        let hints = chain.redemption_hints(d("100"), d("105"), 70).await.unwrap();
        assert_eq!(hints.first_redemption_hint, owner(2));
    }

    #[tokio::test]
    async fn test_redemption_truncates_at_minimum_net_debt() {
        let chain = SimulatedChain::new(1_700_000_000);
        chain.open_position(owner(1), Position::new(d("10"), d("200")));
        let hints = chain.redemption_hints(d("100"), d("200"), 70).await.unwrap();
        assert_eq!(hints.truncated_amount, Decimal::ZERO);
        assert_eq!(hints.partial_redemption_hint_nicr, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_tagged_reads_see_mined_snapshot() {
        let chain = four_positions();
        let block = chain.mine_block();
        chain.set_price(d("300"));

        assert_eq!(chain.price(Some(block)).await.unwrap(), d("200"));
        assert_eq!(chain.price(None).await.unwrap(), d("300"));
        assert!(chain.price(Some(block + 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_block() {
        let chain = four_positions();
        let block = chain.mine_block();
        chain.fail_block(block);
        assert!(chain.block_timestamp(Some(block)).await.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_redeem_collateral_updates_positions() {
        let chain = four_positions();
        let redeemer = owner(9);
        chain.set_account(
            redeemer,
            AccountState {
                zusd: d("5000"),
                ..Default::default()
            },
        );

        let paid_out = chain
            .redeem_collateral(redeemer, d("2001"), 70, Decimal::ONE)
            .unwrap();
        assert!(paid_out > Decimal::ZERO);

        assert_eq!(
            chain.stored_position(&owner(1)).map(|(status, _)| status),
            Some(PositionStatus::ClosedByRedemption)
        );
        let (_, partially_redeemed) = chain.stored_position(&owner(3)).unwrap();
        assert_eq!(partially_redeemed.net_debt(), Some(d("1499")));
        assert_eq!(chain.number_of_positions(None).await.unwrap(), 2);
        assert_eq!(chain.zusd_balance(Some(redeemer), None).await.unwrap(), d("2999"));
    }

    #[tokio::test]
    async fn test_manual_block_source_drops_closed_subscribers() {
        let source = ManualBlockSource::new();
        let mut subscription = source.subscribe().await.unwrap();
        source.announce(5);
        assert_eq!(subscription.next().await, Some(5));

        drop(subscription);
        assert_eq!(source.subscriber_count(), 0);
    }
}

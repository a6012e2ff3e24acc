//! Store snapshot: raw chain reads, values derived from them, and the block
//! they were read at.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::{
    fees::Fees,
    types::{
        Decimal, FrontendStatus, Position, PositionWithPendingRedistribution, StabilityDeposit,
        UserPosition, ZeroStake,
    },
};

// ============================================================================
// Base / Derived / Extra
// ============================================================================

/// Everything the store reads from the chain in one fetch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BaseState {
    /// Status of the frontend this connection deposits through.
    pub frontend: FrontendStatus,
    /// Status of the user's own address as a frontend.
    pub own_frontend: FrontendStatus,
    pub number_of_positions: u64,
    pub account_balance: Decimal,
    pub zusd_balance: Decimal,
    pub zero_balance: Decimal,
    pub collateral_surplus_balance: Decimal,
    pub price: Decimal,
    pub zusd_in_stability_pool: Decimal,
    pub total: Position,
    pub total_redistributed: Position,
    pub position_before_redistribution: PositionWithPendingRedistribution,
    pub stability_deposit: StabilityDeposit,
    pub remaining_stability_pool_zero_reward: Decimal,
    /// Fee calculator with recovery mode forced off; the derived fees put it back.
    pub fees_in_normal_mode: Fees,
    pub zero_stake: ZeroStake,
    pub total_staked_zero: Decimal,
    /// Position with the lowest collateral ratio, empty if the list is.
    pub riskiest_position_before_redistribution: PositionWithPendingRedistribution,
}

impl BaseState {
    /// Names of the fields that differ from `other`.
    pub fn changed_fields(&self, other: &BaseState) -> Vec<&'static str> {
        let mut changed = Vec::new();
        macro_rules! compare {
            ($($field:ident),* $(,)?) => {
                $(
                    if self.$field != other.$field {
                        changed.push(stringify!($field));
                    }
                )*
            };
        }
        compare!(
            frontend,
            own_frontend,
            number_of_positions,
            account_balance,
            zusd_balance,
            zero_balance,
            collateral_surplus_balance,
            price,
            zusd_in_stability_pool,
            total,
            total_redistributed,
            position_before_redistribution,
            stability_deposit,
            remaining_stability_pool_zero_reward,
            fees_in_normal_mode,
            zero_stake,
            total_staked_zero,
            riskiest_position_before_redistribution,
        );
        changed
    }
}

/// Values computed from [`BaseState`], never fetched.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DerivedState {
    /// User position with pending redistribution applied.
    pub position: UserPosition,
    pub fees: Fees,
    pub borrowing_rate: Decimal,
    /// Redemption rate for an infinitesimally small redemption.
    pub redemption_rate: Decimal,
    pub have_undercollateralized_positions: bool,
}

impl DerivedState {
    pub fn derive(base: &BaseState) -> Self {
        let position = base
            .position_before_redistribution
            .apply_redistribution(&base.total_redistributed);
        let fees = base
            .fees_in_normal_mode
            .with_recovery_mode(base.total.is_below_critical(base.price));
        let riskiest = base
            .riskiest_position_before_redistribution
            .apply_redistribution(&base.total_redistributed);

        Self {
            position,
            borrowing_rate: fees.borrowing_rate(None),
            redemption_rate: fees.redemption_rate(Decimal::ZERO, None),
            fees,
            have_undercollateralized_positions: !riskiest.position.is_empty()
                && riskiest.position.is_below_minimum(base.price),
        }
    }
}

/// Where a snapshot was read. Merged field by field.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtraState {
    /// Block the snapshot was pinned to, `None` for an untagged read.
    pub block_tag: Option<u64>,
    pub block_timestamp: u64,
}

/// Partial [`ExtraState`] carried by one fetch.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtraUpdate {
    pub block_tag: Option<u64>,
    pub block_timestamp: Option<u64>,
}

impl ExtraState {
    /// Present fields override, absent fields keep their old value.
    pub fn merge(&self, update: &ExtraUpdate) -> Self {
        Self {
            block_tag: update.block_tag.or(self.block_tag),
            block_timestamp: update.block_timestamp.unwrap_or(self.block_timestamp),
        }
    }
}

/// One fetch's worth of store input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreUpdate {
    pub base: BaseState,
    pub extra: ExtraUpdate,
}

// ============================================================================
// Snapshot
// ============================================================================

/// Immutable state served by the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoreState {
    pub base: BaseState,
    pub derived: DerivedState,
    pub extra: ExtraState,
}

impl StoreState {
    /// First snapshot from a fetch.
    pub fn load(update: StoreUpdate) -> Self {
        Self {
            derived: DerivedState::derive(&update.base),
            extra: ExtraState::default().merge(&update.extra),
            base: update.base,
        }
    }

    /// Reducer: base is replaced wholesale, extra is merged. Block order is
    /// taken as given, so an older block applied last wins.
    pub fn reduce(&self, update: StoreUpdate) -> Self {
        Self {
            derived: DerivedState::derive(&update.base),
            extra: self.extra.merge(&update.extra),
            base: update.base,
        }
    }

    pub fn user_address(&self) -> Address {
        self.base.position_before_redistribution.owner
    }

    pub fn block_tag(&self) -> Option<u64> {
        self.extra.block_tag
    }

    pub fn price(&self) -> Decimal {
        self.base.price
    }

    pub fn position(&self) -> &UserPosition {
        &self.derived.position
    }

    pub fn fees(&self) -> &Fees {
        &self.derived.fees
    }
}

/// What a store listener receives.
#[derive(Clone, Debug)]
pub struct StoreChange {
    pub state: std::sync::Arc<StoreState>,
    /// `None` on the initial load.
    pub old_state: Option<std::sync::Arc<StoreState>>,
    /// Base fields that differ from the old state, empty on the initial load.
    pub changed: Vec<&'static str>,
}

impl StoreChange {
    pub fn is_load(&self) -> bool {
        self.old_state.is_none()
    }
}

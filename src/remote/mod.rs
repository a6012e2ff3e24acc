//! Remote protocol boundary.
//!
//! Everything the SDK reads from the chain goes through two traits:
//!
//! - [`ProtocolReader`]: state reads, each pinned to an optional block
//! - [`HintHelpers`]: the sorted-list and hint-helper contract calls used by
//!   the hint search and the redemption sizer
//!
//! [`RpcProtocol`] implements both over Ethereum JSON-RPC. The in-memory
//! [`SimulatedChain`](crate::simulation::SimulatedChain) implements them for
//! offline use and tests.

pub mod rpc;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    fees::{FeeParameters, Fees},
    prelude::*,
    types::{
        Decimal, FrontendStatus, Position, PositionListing, PositionWithPendingRedistribution,
        StabilityDeposit, UserPosition, ZeroStake,
    },
    Error,
};

pub use rpc::RpcProtocol;

/// Block to pin a read to. `None` reads the latest state.
pub type BlockTag = Option<u64>;

/// Result of one `getApproxHint` call.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApproxHint {
    pub hint_address: Address,
    /// Distance between the hint's nominal ratio and the target.
    pub diff: U256,
    pub latest_random_seed: U256,
}

/// Result of `getRedemptionHints`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionHintsResponse {
    pub first_redemption_hint: Address,
    /// Nominal ratio of the last position touched, zero if it is fully redeemed.
    pub partial_redemption_hint_nicr: Decimal,
    /// Part of the requested amount the chain can actually redeem.
    pub truncated_amount: Decimal,
}

/// Sorted-list helpers exposed by the `SortedLoCs` and `HintHelpers` contracts.
#[async_trait]
pub trait HintHelpers: Send + Sync {
    /// Head of the sorted list (highest nominal ratio), zero address if empty.
    async fn first_in_list(&self) -> Result<Address>;

    /// Sample `num_trials` random positions and return the closest one to
    /// `nominal_ratio`.
    async fn approx_hint(
        &self,
        nominal_ratio: Decimal,
        num_trials: u64,
        random_seed: U256,
    ) -> Result<ApproxHint>;

    /// Walk the list from the given neighbours to the exact insert position.
    async fn find_insert_position(
        &self,
        nominal_ratio: Decimal,
        prev_id: Address,
        next_id: Address,
    ) -> Result<(Address, Address)>;

    async fn redemption_hints(
        &self,
        amount: Decimal,
        price: Decimal,
        max_iterations: u64,
    ) -> Result<RedemptionHintsResponse>;
}

/// Read access to protocol state.
///
/// User-scoped reads take an optional address and fall back to the
/// connection's own user address.
#[async_trait]
pub trait ProtocolReader: Send + Sync {
    /// Address of the connected user, if any.
    fn user_address(&self) -> Option<Address>;

    /// Frontend this connection deposits through, if any.
    fn frontend_tag(&self) -> Option<Address>;

    fn require_address(&self, address: Option<Address>) -> Result<Address> {
        address.or_else(|| self.user_address()).ok_or(Error::NoUserAddress)
    }

    fn require_frontend_tag(&self, address: Option<Address>) -> Result<Address> {
        address
            .or_else(|| self.frontend_tag())
            .ok_or_else(|| Error::Config("no frontend tag configured".to_string()))
    }

    /// Timestamp of the block (seconds).
    async fn block_timestamp(&self, tag: BlockTag) -> Result<u64>;

    /// Collateral and debt redistributed per unit of stake so far.
    async fn total_redistributed(&self, tag: BlockTag) -> Result<Position>;

    async fn position_before_redistribution(
        &self,
        address: Option<Address>,
        tag: BlockTag,
    ) -> Result<PositionWithPendingRedistribution>;

    async fn number_of_positions(&self, tag: BlockTag) -> Result<u64>;

    async fn price(&self, tag: BlockTag) -> Result<Decimal>;

    /// Active pool plus default pool.
    async fn total(&self, tag: BlockTag) -> Result<Position>;

    async fn stability_deposit(
        &self,
        address: Option<Address>,
        tag: BlockTag,
    ) -> Result<StabilityDeposit>;

    async fn remaining_stability_pool_zero_reward(&self, tag: BlockTag) -> Result<Decimal>;

    async fn zusd_in_stability_pool(&self, tag: BlockTag) -> Result<Decimal>;

    async fn zusd_balance(&self, address: Option<Address>, tag: BlockTag) -> Result<Decimal>;

    async fn zero_balance(&self, address: Option<Address>, tag: BlockTag) -> Result<Decimal>;

    /// Native coin balance.
    async fn account_balance(&self, address: Option<Address>, tag: BlockTag) -> Result<Decimal>;

    async fn collateral_surplus_balance(
        &self,
        address: Option<Address>,
        tag: BlockTag,
    ) -> Result<Decimal>;

    async fn fee_parameters(&self, tag: BlockTag) -> Result<FeeParameters>;

    async fn zero_stake(&self, address: Option<Address>, tag: BlockTag) -> Result<ZeroStake>;

    async fn total_staked_zero(&self, tag: BlockTag) -> Result<Decimal>;

    async fn frontend_status(&self, address: Option<Address>, tag: BlockTag)
        -> Result<FrontendStatus>;

    async fn positions_before_redistribution(
        &self,
        listing: PositionListing,
        tag: BlockTag,
    ) -> Result<Vec<PositionWithPendingRedistribution>>;

    /// A user's position with pending redistribution applied.
    async fn position(&self, address: Option<Address>, tag: BlockTag) -> Result<UserPosition> {
        let (position, total_redistributed) = tokio::try_join!(
            self.position_before_redistribution(address, tag),
            self.total_redistributed(tag)
        )?;
        Ok(position.apply_redistribution(&total_redistributed))
    }

    async fn positions(&self, listing: PositionListing, tag: BlockTag) -> Result<Vec<UserPosition>> {
        let (positions, total_redistributed) = tokio::try_join!(
            self.positions_before_redistribution(listing, tag),
            self.total_redistributed(tag)
        )?;
        Ok(positions
            .iter()
            .map(|position| position.apply_redistribution(&total_redistributed))
            .collect())
    }

    /// Fee calculator at the block, with recovery mode derived from the
    /// system's total collateral ratio.
    async fn fees(&self, tag: BlockTag) -> Result<Fees> {
        let (parameters, total, price, block_timestamp) = tokio::try_join!(
            self.fee_parameters(tag),
            self.total(tag),
            self.price(tag),
            self.block_timestamp(tag)
        )?;
        Ok(parameters.at(block_timestamp, total.is_below_critical(price)))
    }
}

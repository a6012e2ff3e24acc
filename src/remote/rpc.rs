//! [`ProtocolReader`] and [`HintHelpers`] over Ethereum JSON-RPC `eth_call`.

use std::sync::Arc;

use alloy::{
    primitives::{Address, Bytes, I256, U256},
    sol_types::SolCall,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::trace;

use crate::{
    contracts::{
        AddressBook, ICollSurplusPool, ICommunityIssuance, IERC20, IHintHelpers, ILoCManager,
        IMultiLoCGetter, IPool, IPriceFeed, ISortedLoCs, IStabilityPool, IZEROStaking,
    },
    fees::FeeParameters,
    helpers::{format_quantity, parse_quantity, u256_to_u64},
    prelude::*,
    remote::{ApproxHint, BlockTag, HintHelpers, ProtocolReader, RedemptionHintsResponse},
    req::JsonRpcClient,
    types::{
        Decimal, FrontendStatus, Position, PositionListing, PositionStatus,
        PositionWithPendingRedistribution, StabilityDeposit, ZeroStake,
    },
    Error,
};

#[derive(Deserialize)]
struct BlockHeader {
    timestamp: String,
}

fn block_param(tag: BlockTag) -> Value {
    match tag {
        Some(number) => Value::String(format_quantity(number)),
        None => Value::String("latest".to_string()),
    }
}

fn dec(raw: U256) -> Decimal {
    Decimal::from_raw(raw)
}

/// Protocol access through a JSON-RPC node.
#[derive(Clone, Debug)]
pub struct RpcProtocol {
    rpc: Arc<JsonRpcClient>,
    addresses: AddressBook,
    user_address: Option<Address>,
    frontend_tag: Option<Address>,
}

impl RpcProtocol {
    pub fn new(
        rpc: Arc<JsonRpcClient>,
        addresses: AddressBook,
        user_address: Option<Address>,
        frontend_tag: Option<Address>,
    ) -> Self {
        Self {
            rpc,
            addresses,
            user_address,
            frontend_tag,
        }
    }

    pub fn addresses(&self) -> &AddressBook {
        &self.addresses
    }

    pub fn rpc(&self) -> &Arc<JsonRpcClient> {
        &self.rpc
    }

    async fn call<C: SolCall + Send>(&self, to: Address, call: C, tag: BlockTag) -> Result<C::Return> {
        let data = Bytes::from(call.abi_encode());
        trace!(%to, selector = ?C::SIGNATURE, ?tag, "eth_call");

        let output: Bytes = self
            .rpc
            .request("eth_call", json!([{ "to": to, "data": data }, block_param(tag)]))
            .await?;

        C::abi_decode_returns(&output).map_err(|e| Error::AbiDecode(format!("{}: {e}", C::SIGNATURE)))
    }

    async fn token_balance(&self, token: Address, address: Address, tag: BlockTag) -> Result<Decimal> {
        let balance = self
            .call(token, IERC20::balanceOfCall { account: address }, tag)
            .await?;
        Ok(dec(balance))
    }

    /// Latest block number known to the node.
    pub async fn block_number(&self) -> Result<u64> {
        let number: String = self.rpc.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&number)
    }
}

#[async_trait]
impl HintHelpers for RpcProtocol {
    async fn first_in_list(&self) -> Result<Address> {
        self.call(self.addresses.sorted_locs, ISortedLoCs::getFirstCall {}, None)
            .await
    }

    async fn approx_hint(
        &self,
        nominal_ratio: Decimal,
        num_trials: u64,
        random_seed: U256,
    ) -> Result<ApproxHint> {
        let result = self
            .call(
                self.addresses.hint_helpers,
                IHintHelpers::getApproxHintCall {
                    _CR: nominal_ratio.raw(),
                    _numTrials: U256::from(num_trials),
                    _inputRandomSeed: random_seed,
                },
                None,
            )
            .await?;

        Ok(ApproxHint {
            hint_address: result.hintAddress,
            diff: result.diff,
            latest_random_seed: result.latestRandomSeed,
        })
    }

    async fn find_insert_position(
        &self,
        nominal_ratio: Decimal,
        prev_id: Address,
        next_id: Address,
    ) -> Result<(Address, Address)> {
        let result = self
            .call(
                self.addresses.sorted_locs,
                ISortedLoCs::findInsertPositionCall {
                    _NICR: nominal_ratio.raw(),
                    _prevId: prev_id,
                    _nextId: next_id,
                },
                None,
            )
            .await?;

        Ok((result._0, result._1))
    }

    async fn redemption_hints(
        &self,
        amount: Decimal,
        price: Decimal,
        max_iterations: u64,
    ) -> Result<RedemptionHintsResponse> {
        let result = self
            .call(
                self.addresses.hint_helpers,
                IHintHelpers::getRedemptionHintsCall {
                    _ZUSDamount: amount.raw(),
                    _price: price.raw(),
                    _maxIterations: U256::from(max_iterations),
                },
                None,
            )
            .await?;

        Ok(RedemptionHintsResponse {
            first_redemption_hint: result.firstRedemptionHint,
            partial_redemption_hint_nicr: dec(result.partialRedemptionHintNICR),
            truncated_amount: dec(result.truncatedZUSDamount),
        })
    }
}

#[async_trait]
impl ProtocolReader for RpcProtocol {
    fn user_address(&self) -> Option<Address> {
        self.user_address
    }

    fn frontend_tag(&self) -> Option<Address> {
        self.frontend_tag
    }

    async fn block_timestamp(&self, tag: BlockTag) -> Result<u64> {
        let header: Option<BlockHeader> = self
            .rpc
            .request("eth_getBlockByNumber", json!([block_param(tag), false]))
            .await?;
        let header = header.ok_or_else(|| Error::InvalidResponse(format!("block {tag:?} not found")))?;
        parse_quantity(&header.timestamp)
    }

    async fn total_redistributed(&self, tag: BlockTag) -> Result<Position> {
        let manager = self.addresses.loc_manager;
        let (collateral, debt) = tokio::try_join!(
            self.call(manager, ILoCManager::L_BTCCall {}, tag),
            self.call(manager, ILoCManager::L_ZUSDDebtCall {}, tag)
        )?;
        Ok(Position::new(dec(collateral), dec(debt)))
    }

    async fn position_before_redistribution(
        &self,
        address: Option<Address>,
        tag: BlockTag,
    ) -> Result<PositionWithPendingRedistribution> {
        let owner = self.require_address(address)?;
        let manager = self.addresses.loc_manager;

        let (loc, snapshot) = tokio::try_join!(
            self.call(manager, ILoCManager::LoCsCall { owner }, tag),
            self.call(manager, ILoCManager::rewardSnapshotsCall { owner }, tag)
        )?;

        let status = PositionStatus::from_chain(loc.status)?;
        if status != PositionStatus::Open {
            return Ok(PositionWithPendingRedistribution {
                status,
                ..PositionWithPendingRedistribution::empty(owner)
            });
        }

        Ok(PositionWithPendingRedistribution {
            owner,
            status,
            position: Position::new(dec(loc.coll), dec(loc.debt)),
            stake: dec(loc.stake),
            snapshot_of_total_redistributed: Position::new(dec(snapshot.BTC), dec(snapshot.ZUSDDebt)),
        })
    }

    async fn number_of_positions(&self, tag: BlockTag) -> Result<u64> {
        let count = self
            .call(self.addresses.loc_manager, ILoCManager::getLoCOwnersCountCall {}, tag)
            .await?;
        u256_to_u64(count)
    }

    async fn price(&self, tag: BlockTag) -> Result<Decimal> {
        let price = self
            .call(self.addresses.price_feed, IPriceFeed::fetchPriceCall {}, tag)
            .await?;
        Ok(dec(price))
    }

    async fn total(&self, tag: BlockTag) -> Result<Position> {
        let (active, default) = (self.addresses.active_pool, self.addresses.default_pool);
        let (active_coll, active_debt, default_coll, default_debt) = tokio::try_join!(
            self.call(active, IPool::getBTCCall {}, tag),
            self.call(active, IPool::getZUSDDebtCall {}, tag),
            self.call(default, IPool::getBTCCall {}, tag),
            self.call(default, IPool::getZUSDDebtCall {}, tag)
        )?;

        Ok(Position::new(dec(active_coll), dec(active_debt))
            .add(&Position::new(dec(default_coll), dec(default_debt))))
    }

    async fn stability_deposit(
        &self,
        address: Option<Address>,
        tag: BlockTag,
    ) -> Result<StabilityDeposit> {
        let depositor = self.require_address(address)?;
        let pool = self.addresses.stability_pool;

        let (deposit, current, collateral_gain, zero_reward) = tokio::try_join!(
            self.call(pool, IStabilityPool::depositsCall { depositor }, tag),
            self.call(pool, IStabilityPool::getCompoundedZUSDDepositCall { depositor }, tag),
            self.call(pool, IStabilityPool::getDepositorBTCGainCall { depositor }, tag),
            self.call(pool, IStabilityPool::getDepositorZEROGainCall { depositor }, tag)
        )?;

        Ok(StabilityDeposit {
            initial_zusd: dec(deposit.initialValue),
            current_zusd: dec(current),
            collateral_gain: dec(collateral_gain),
            zero_reward: dec(zero_reward),
            frontend_tag: deposit.frontEndTag,
        })
    }

    async fn remaining_stability_pool_zero_reward(&self, tag: BlockTag) -> Result<Decimal> {
        let issuance = self.addresses.community_issuance;
        let (cap, issued) = tokio::try_join!(
            self.call(issuance, ICommunityIssuance::ZEROSupplyCapCall {}, tag),
            self.call(issuance, ICommunityIssuance::totalZEROIssuedCall {}, tag)
        )?;
        Ok(dec(cap).saturating_sub(dec(issued)))
    }

    async fn zusd_in_stability_pool(&self, tag: BlockTag) -> Result<Decimal> {
        let total = self
            .call(self.addresses.stability_pool, IStabilityPool::getTotalZUSDDepositsCall {}, tag)
            .await?;
        Ok(dec(total))
    }

    async fn zusd_balance(&self, address: Option<Address>, tag: BlockTag) -> Result<Decimal> {
        let address = self.require_address(address)?;
        self.token_balance(self.addresses.zusd_token, address, tag).await
    }

    async fn zero_balance(&self, address: Option<Address>, tag: BlockTag) -> Result<Decimal> {
        let address = self.require_address(address)?;
        self.token_balance(self.addresses.zero_token, address, tag).await
    }

    async fn account_balance(&self, address: Option<Address>, tag: BlockTag) -> Result<Decimal> {
        let address = self.require_address(address)?;
        let balance: U256 = self
            .rpc
            .request("eth_getBalance", json!([address, block_param(tag)]))
            .await?;
        Ok(dec(balance))
    }

    async fn collateral_surplus_balance(
        &self,
        address: Option<Address>,
        tag: BlockTag,
    ) -> Result<Decimal> {
        let account = self.require_address(address)?;
        let surplus = self
            .call(
                self.addresses.coll_surplus_pool,
                ICollSurplusPool::getCollateralCall { account },
                tag,
            )
            .await?;
        Ok(dec(surplus))
    }

    async fn fee_parameters(&self, tag: BlockTag) -> Result<FeeParameters> {
        let manager = self.addresses.loc_manager;
        let (base_rate, last_fee_operation_time) = tokio::try_join!(
            self.call(manager, ILoCManager::baseRateCall {}, tag),
            self.call(manager, ILoCManager::lastFeeOperationTimeCall {}, tag)
        )?;

        Ok(FeeParameters {
            base_rate_without_decay: dec(base_rate),
            last_fee_operation_time: u256_to_u64(last_fee_operation_time)?,
        })
    }

    async fn zero_stake(&self, address: Option<Address>, tag: BlockTag) -> Result<ZeroStake> {
        let staker = self.require_address(address)?;
        let staking = self.addresses.zero_staking;

        let (staked, collateral_gain, zusd_gain) = tokio::try_join!(
            self.call(staking, IZEROStaking::stakesCall { staker }, tag),
            self.call(staking, IZEROStaking::getPendingBTCGainCall { staker }, tag),
            self.call(staking, IZEROStaking::getPendingZUSDGainCall { staker }, tag)
        )?;

        Ok(ZeroStake {
            staked_zero: dec(staked),
            collateral_gain: dec(collateral_gain),
            zusd_gain: dec(zusd_gain),
        })
    }

    async fn total_staked_zero(&self, tag: BlockTag) -> Result<Decimal> {
        let total = self
            .call(self.addresses.zero_staking, IZEROStaking::totalZEROStakedCall {}, tag)
            .await?;
        Ok(dec(total))
    }

    async fn frontend_status(
        &self,
        address: Option<Address>,
        tag: BlockTag,
    ) -> Result<FrontendStatus> {
        let frontend = self.require_frontend_tag(address)?;
        let result = self
            .call(self.addresses.stability_pool, IStabilityPool::frontEndsCall { frontend }, tag)
            .await?;

        Ok(if result.registered {
            FrontendStatus::Registered {
                kickback_rate: dec(result.kickbackRate),
            }
        } else {
            FrontendStatus::Unregistered
        })
    }

    async fn positions_before_redistribution(
        &self,
        listing: PositionListing,
        tag: BlockTag,
    ) -> Result<Vec<PositionWithPendingRedistribution>> {
        let start = I256::try_from(listing.signed_start_index()?)
            .map_err(|e| Error::InvalidPositionChange(format!("invalid start index: {e}")))?;

        let locs = self
            .call(
                self.addresses.multi_loc_getter,
                IMultiLoCGetter::getMultipleSortedLoCsCall {
                    _startIdx: start,
                    _count: U256::from(listing.first),
                },
                tag,
            )
            .await?;

        Ok(locs
            .into_iter()
            .map(|loc| PositionWithPendingRedistribution {
                owner: loc.owner,
                status: PositionStatus::Open,
                position: Position::new(dec(loc.coll), dec(loc.debt)),
                stake: dec(loc.stake),
                snapshot_of_total_redistributed: Position::new(
                    dec(loc.snapshotBTC),
                    dec(loc.snapshotZUSDDebt),
                ),
            })
            .collect())
    }
}

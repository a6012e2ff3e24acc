//! Unsigned transaction payloads for position changes, redemptions, stability
//! pool deposits and ZERO staking.
//!
//! Signing and sending are left to the caller's wallet; this module only
//! decides what goes into `to`, `data` and `value`, and how much gas padding
//! the estimate needs.

use std::sync::Arc;

use alloy::{
    primitives::{Address, Bytes, U256},
    sol_types::SolCall,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::{
    consts::{DEFAULT_BORROWING_RATE_SLIPPAGE_TOLERANCE, REDEEM_MAX_ITERATIONS},
    contracts::{AddressBook, IBorrowerOperations, ILoCManager, IStabilityPool, IZEROStaking},
    estimate::{EstimateAdjustment, GasPadding},
    helpers::parse_quantity,
    hints::HintSearch,
    prelude::*,
    redemption::Redemption,
    remote::ProtocolReader,
    req::JsonRpcClient,
    types::{CollateralChange, DebtChange, Decimal, Position, PositionAdjustment, PositionCreation},
    Error,
};

/// A contract call ready to be signed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PopulatedCall {
    pub to: Address,
    pub data: Bytes,
    /// Native coin sent along, 18 decimals.
    pub value: Decimal,
    pub gas_adjustment: EstimateAdjustment,
}

impl PopulatedCall {
    fn new<C: SolCall>(to: Address, call: C, value: Decimal, gas_adjustment: EstimateAdjustment) -> Self {
        Self {
            to,
            data: Bytes::from(call.abi_encode()),
            value,
            gas_adjustment,
        }
    }

    /// `eth_estimateGas` from `from`, padded by the call's adjustment.
    pub async fn estimate_gas(&self, rpc: &JsonRpcClient, from: Address) -> Result<u64> {
        let estimate: String = rpc
            .request(
                "eth_estimateGas",
                json!([{
                    "from": from,
                    "to": self.to,
                    "data": self.data,
                    "value": self.value.raw(),
                }]),
            )
            .await?;
        let gas = parse_quantity(&estimate)?;
        let padded = self.gas_adjustment.apply(gas);
        debug!(to = %self.to, estimate = gas, padded, "Estimated gas");
        Ok(padded)
    }
}

/// A populated position change together with its expected outcome.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PopulatedPositionChange {
    pub call: PopulatedCall,
    pub new_position: Position,
    /// Borrowing fee added to the debt.
    pub fee: Decimal,
    pub max_borrowing_rate: Decimal,
}

/// Builds transactions against one protocol deployment.
#[derive(Clone)]
pub struct Populator {
    reader: Arc<dyn ProtocolReader>,
    hint_search: HintSearch,
    addresses: AddressBook,
}

impl Populator {
    pub fn new(reader: Arc<dyn ProtocolReader>, hint_search: HintSearch, addresses: AddressBook) -> Self {
        Self {
            reader,
            hint_search,
            addresses,
        }
    }

    pub fn addresses(&self) -> &AddressBook {
        &self.addresses
    }

    // ========================================================================
    // Positions
    // ========================================================================

    /// `openLoC`. Without `max_borrowing_rate` the ceiling is the current
    /// rate plus the default slippage tolerance.
    pub async fn open_position(
        &self,
        params: PositionCreation,
        max_borrowing_rate: Option<Decimal>,
    ) -> Result<PopulatedPositionChange> {
        let fees = self.reader.fees(None).await?;
        let borrowing_rate = fees.borrowing_rate(None);
        let new_position = Position::create(&params, borrowing_rate);
        let max_borrowing_rate =
            max_borrowing_rate.unwrap_or(borrowing_rate + DEFAULT_BORROWING_RATE_SLIPPAGE_TOLERANCE);

        let (upper_hint, lower_hint) = self.hint_search.find_hints_for_position(&new_position).await?;
        debug!(%new_position.collateral, %new_position.debt, %upper_hint, %lower_hint, "Populating openLoC");

        let call = PopulatedCall::new(
            self.addresses.borrower_operations,
            IBorrowerOperations::openLoCCall {
                _maxFee: max_borrowing_rate.raw(),
                _ZUSDAmount: params.borrow_zusd.raw(),
                _upperHint: upper_hint,
                _lowerHint: lower_hint,
            },
            params.deposit_collateral,
            EstimateAdjustment::none()
                .with(GasPadding::LastFeeOperationTimeUpdate)
                .with(GasPadding::ListTraversal),
        );

        Ok(PopulatedPositionChange {
            call,
            fee: params.borrow_zusd * borrowing_rate,
            new_position,
            max_borrowing_rate,
        })
    }

    /// `adjustLoC` on the connected user's position. Hints are searched for
    /// the position after the change, pending redistribution included.
    pub async fn adjust_position(
        &self,
        params: PositionAdjustment,
        max_borrowing_rate: Option<Decimal>,
    ) -> Result<PopulatedPositionChange> {
        let owner = self.reader.require_address(None)?;
        let (current, fees) = tokio::try_join!(self.reader.position(Some(owner), None), self.reader.fees(None))?;

        if current.position.is_empty() {
            return Err(Error::UnsupportedOperation(format!(
                "adjustPosition: {owner} has no open position"
            )));
        }

        let borrowing = matches!(params.debt, Some(DebtChange::Borrow(_)));
        let borrowing_rate = fees.borrowing_rate(None);
        let new_position = current.position.adjust(&params, borrowing_rate);

        let max_borrowing_rate = if borrowing {
            max_borrowing_rate.unwrap_or(borrowing_rate + DEFAULT_BORROWING_RATE_SLIPPAGE_TOLERANCE)
        } else {
            Decimal::ZERO
        };

        let (upper_hint, lower_hint) = self.hint_search.find_hints_for_position(&new_position).await?;
        let (deposit, withdrawal) = params.collateral_delta();
        let (borrow, repay) = params.debt_delta();

        let mut gas_adjustment = EstimateAdjustment::none();
        if borrowing {
            gas_adjustment = gas_adjustment.with(GasPadding::LastFeeOperationTimeUpdate);
        }
        gas_adjustment = gas_adjustment.with(GasPadding::ListTraversal);

        let call = PopulatedCall::new(
            self.addresses.borrower_operations,
            IBorrowerOperations::adjustLoCCall {
                _maxFee: max_borrowing_rate.raw(),
                _collWithdrawal: withdrawal.raw(),
                _debtChange: if borrowing { borrow.raw() } else { repay.raw() },
                isDebtIncrease: borrowing,
                _upperHint: upper_hint,
                _lowerHint: lower_hint,
            },
            deposit,
            gas_adjustment,
        );

        Ok(PopulatedPositionChange {
            call,
            fee: if borrowing { borrow * borrowing_rate } else { Decimal::ZERO },
            new_position,
            max_borrowing_rate,
        })
    }

    pub async fn deposit_collateral(&self, amount: Decimal) -> Result<PopulatedPositionChange> {
        let params = PositionAdjustment::new(Some(CollateralChange::Deposit(amount)), None)?;
        self.adjust_position(params, None).await
    }

    pub async fn withdraw_collateral(&self, amount: Decimal) -> Result<PopulatedPositionChange> {
        let params = PositionAdjustment::new(Some(CollateralChange::Withdraw(amount)), None)?;
        self.adjust_position(params, None).await
    }

    pub async fn borrow_zusd(
        &self,
        amount: Decimal,
        max_borrowing_rate: Option<Decimal>,
    ) -> Result<PopulatedPositionChange> {
        let params = PositionAdjustment::new(None, Some(DebtChange::Borrow(amount)))?;
        self.adjust_position(params, max_borrowing_rate).await
    }

    pub async fn repay_zusd(&self, amount: Decimal) -> Result<PopulatedPositionChange> {
        let params = PositionAdjustment::new(None, Some(DebtChange::Repay(amount)))?;
        self.adjust_position(params, None).await
    }

    /// `withdrawBTCGainToLoC`: moves the connected user's stability pool
    /// collateral gain into their position.
    pub async fn transfer_collateral_gain_to_position(&self) -> Result<PopulatedPositionChange> {
        let owner = self.reader.require_address(None)?;
        let (current, deposit) = tokio::try_join!(
            self.reader.position(Some(owner), None),
            self.reader.stability_deposit(Some(owner), None)
        )?;

        if current.position.is_empty() {
            return Err(Error::UnsupportedOperation(format!(
                "transferCollateralGainToLoC: {owner} has no open position"
            )));
        }
        if deposit.collateral_gain.is_zero() {
            return Err(Error::UnsupportedOperation(format!(
                "transferCollateralGainToLoC: {owner} has no collateral gain"
            )));
        }

        let new_position = current
            .position
            .add(&Position::new(deposit.collateral_gain, Decimal::ZERO));
        let (upper_hint, lower_hint) = self.hint_search.find_hints_for_position(&new_position).await?;
        debug!(%owner, gain = %deposit.collateral_gain, %upper_hint, %lower_hint, "Populating withdrawBTCGainToLoC");

        let call = PopulatedCall::new(
            self.addresses.stability_pool,
            IStabilityPool::withdrawBTCGainToLoCCall {
                _upperHint: upper_hint,
                _lowerHint: lower_hint,
            },
            Decimal::ZERO,
            EstimateAdjustment::none()
                .with(GasPadding::ListTraversal)
                .with(GasPadding::ZeroIssuance),
        );

        Ok(PopulatedPositionChange {
            call,
            new_position,
            fee: Decimal::ZERO,
            max_borrowing_rate: Decimal::ZERO,
        })
    }

    pub fn close_position(&self) -> PopulatedCall {
        PopulatedCall::new(
            self.addresses.borrower_operations,
            IBorrowerOperations::closeLoCCall {},
            Decimal::ZERO,
            EstimateAdjustment::none(),
        )
    }

    /// `claimCollateral`: collateral left over after a redemption or a
    /// liquidation in recovery mode.
    pub fn claim_collateral_surplus(&self) -> PopulatedCall {
        PopulatedCall::new(
            self.addresses.borrower_operations,
            IBorrowerOperations::claimCollateralCall {},
            Decimal::ZERO,
            EstimateAdjustment::none(),
        )
    }

    // ========================================================================
    // Stability pool
    // ========================================================================

    /// `provideToSP`. The deposit is tagged with `frontend_tag`, falling back
    /// to the connection's tag and then to no frontend at all.
    pub fn deposit_zusd_in_stability_pool(&self, amount: Decimal, frontend_tag: Option<Address>) -> PopulatedCall {
        let frontend_tag = frontend_tag
            .or_else(|| self.reader.frontend_tag())
            .unwrap_or(Address::ZERO);
        PopulatedCall::new(
            self.addresses.stability_pool,
            IStabilityPool::provideToSPCall {
                _amount: amount.raw(),
                _frontEndTag: frontend_tag,
            },
            Decimal::ZERO,
            EstimateAdjustment::none().with(GasPadding::ZeroIssuance),
        )
    }

    pub fn withdraw_zusd_from_stability_pool(&self, amount: Decimal) -> PopulatedCall {
        PopulatedCall::new(
            self.addresses.stability_pool,
            IStabilityPool::withdrawFromSPCall { _amount: amount.raw() },
            Decimal::ZERO,
            EstimateAdjustment::none().with(GasPadding::ZeroIssuance),
        )
    }

    /// Collateral gain and ZERO reward only, the deposit stays.
    pub fn withdraw_gains_from_stability_pool(&self) -> PopulatedCall {
        self.withdraw_zusd_from_stability_pool(Decimal::ZERO)
    }

    /// `registerFrontEnd`. `kickback_rate` is the share of ZERO rewards
    /// passed on to depositors, at most 1.
    pub fn register_frontend(&self, kickback_rate: Decimal) -> Result<PopulatedCall> {
        if kickback_rate > Decimal::ONE {
            return Err(Error::UnsupportedOperation(format!(
                "registerFrontend: kickback rate {kickback_rate} exceeds 1"
            )));
        }
        Ok(PopulatedCall::new(
            self.addresses.stability_pool,
            IStabilityPool::registerFrontEndCall {
                _kickbackRate: kickback_rate.raw(),
            },
            Decimal::ZERO,
            EstimateAdjustment::none(),
        ))
    }

    // ========================================================================
    // Staking
    // ========================================================================

    pub fn stake_zero(&self, amount: Decimal) -> PopulatedCall {
        PopulatedCall::new(
            self.addresses.zero_staking,
            IZEROStaking::stakeCall { _ZEROamount: amount.raw() },
            Decimal::ZERO,
            EstimateAdjustment::none(),
        )
    }

    pub fn unstake_zero(&self, amount: Decimal) -> PopulatedCall {
        PopulatedCall::new(
            self.addresses.zero_staking,
            IZEROStaking::unstakeCall { _ZEROamount: amount.raw() },
            Decimal::ZERO,
            EstimateAdjustment::none(),
        )
    }

    pub fn withdraw_gains_from_staking(&self) -> PopulatedCall {
        self.unstake_zero(Decimal::ZERO)
    }

    // ========================================================================
    // Redemption
    // ========================================================================

    /// `redeemCollateral` for a sized redemption.
    pub fn redemption(&self, redemption: &Redemption) -> PopulatedCall {
        let hints = &redemption.hints;
        PopulatedCall::new(
            self.addresses.loc_manager,
            ILoCManager::redeemCollateralCall {
                _ZUSDAmount: redemption.truncated_amount.raw(),
                _firstRedemptionHint: hints.first_redemption_hint,
                _upperPartialRedemptionHint: hints.partial_upper_hint,
                _lowerPartialRedemptionHint: hints.partial_lower_hint,
                _partialRedemptionHintNICR: hints.partial_nominal_ratio.raw(),
                _maxIterations: U256::from(REDEEM_MAX_ITERATIONS),
                _maxFeePercentage: redemption.max_redemption_rate.raw(),
            },
            Decimal::ZERO,
            EstimateAdjustment::none().with(GasPadding::LastFeeOperationTimeUpdate),
        )
    }
}

//! Lines of credit (positions) and the changes that can be applied to them.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::{
    consts::{
        CRITICAL_COLLATERAL_RATIO, MINIMUM_COLLATERAL_RATIO, ZUSD_LIQUIDATION_RESERVE,
    },
    prelude::*,
    Decimal, Error,
};

const NOMINAL_COLLATERAL_RATIO_PRECISION: u64 = 100;

/// A combination of collateral and debt.
///
/// Also used for system-wide totals (active pool plus default pool) and for
/// the accumulated redistribution per unit of stake.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub collateral: Decimal,
    pub debt: Decimal,
}

impl Position {
    pub const EMPTY: Position = Position {
        collateral: Decimal::ZERO,
        debt: Decimal::ZERO,
    };

    pub fn new(collateral: Decimal, debt: Decimal) -> Self {
        Self { collateral, debt }
    }

    pub fn is_empty(&self) -> bool {
        self.collateral.is_zero() && self.debt.is_zero()
    }

    /// Debt that has to be repaid to close the position, excluding the
    /// liquidation reserve. `None` when the debt doesn't cover the reserve.
    pub fn net_debt(&self) -> Option<Decimal> {
        self.debt.checked_sub(ZUSD_LIQUIDATION_RESERVE)
    }

    /// Price-independent ratio the sorted list is ordered by.
    ///
    /// Equals the chain's `coll * 1e20 / debt`, infinite when there is no debt.
    pub fn nominal_collateral_ratio(&self) -> Decimal {
        self.collateral.mul_div(
            Decimal::from(NOMINAL_COLLATERAL_RATIO_PRECISION),
            self.debt,
        )
    }

    pub fn collateral_ratio(&self, price: Decimal) -> Decimal {
        self.collateral.mul_div(price, self.debt)
    }

    /// Below 110%: eligible for liquidation, skipped by redemptions.
    pub fn is_below_minimum(&self, price: Decimal) -> bool {
        self.collateral_ratio(price) < MINIMUM_COLLATERAL_RATIO
    }

    /// Below 150%. Applied to the system total this means recovery mode.
    pub fn is_below_critical(&self, price: Decimal) -> bool {
        self.collateral_ratio(price) < CRITICAL_COLLATERAL_RATIO
    }

    pub fn add(&self, other: &Position) -> Position {
        Position::new(self.collateral + other.collateral, self.debt + other.debt)
    }

    /// Component-wise subtraction clamped at zero.
    pub fn subtract(&self, other: &Position) -> Position {
        Position::new(
            self.collateral.saturating_sub(other.collateral),
            self.debt.saturating_sub(other.debt),
        )
    }

    pub fn multiply(&self, multiplier: Decimal) -> Position {
        Position::new(self.collateral * multiplier, self.debt * multiplier)
    }

    /// The position resulting from an `openLoC` with the given parameters.
    pub fn create(params: &PositionCreation, borrowing_rate: Decimal) -> Position {
        Position::new(
            params.deposit_collateral,
            ZUSD_LIQUIDATION_RESERVE + apply_fee(borrowing_rate, params.borrow_zusd),
        )
    }

    /// The position resulting from an `adjustLoC` with the given parameters.
    pub fn adjust(&self, params: &PositionAdjustment, borrowing_rate: Decimal) -> Position {
        let mut increase = Position::EMPTY;
        let mut decrease = Position::EMPTY;

        match params.collateral {
            Some(CollateralChange::Deposit(amount)) => increase.collateral = amount,
            Some(CollateralChange::Withdraw(amount)) => decrease.collateral = amount,
            None => {}
        }
        match params.debt {
            Some(DebtChange::Borrow(amount)) => increase.debt = apply_fee(borrowing_rate, amount),
            Some(DebtChange::Repay(amount)) => decrease.debt = amount,
            None => {}
        }

        self.add(&increase).subtract(&decrease)
    }
}

fn apply_fee(borrowing_rate: Decimal, debt_increase: Decimal) -> Decimal {
    debt_increase * (Decimal::ONE + borrowing_rate)
}

/// Parameters of an `openLoC` transaction.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PositionCreation {
    pub deposit_collateral: Decimal,
    pub borrow_zusd: Decimal,
}

impl PositionCreation {
    pub fn new(deposit_collateral: Decimal, borrow_zusd: Decimal) -> Result<Self> {
        if deposit_collateral.is_zero() {
            return Err(Error::InvalidPositionChange(
                "depositCollateral must be non-zero".to_string(),
            ));
        }
        if borrow_zusd.is_zero() {
            return Err(Error::InvalidPositionChange(
                "borrowZUSD must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            deposit_collateral,
            borrow_zusd,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CollateralChange {
    Deposit(Decimal),
    Withdraw(Decimal),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DebtChange {
    Borrow(Decimal),
    Repay(Decimal),
}

/// Parameters of an `adjustLoC` transaction. At least one side changes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PositionAdjustment {
    pub collateral: Option<CollateralChange>,
    pub debt: Option<DebtChange>,
}

impl PositionAdjustment {
    /// Zero-valued changes are dropped; an adjustment that changes nothing is rejected.
    pub fn new(collateral: Option<CollateralChange>, debt: Option<DebtChange>) -> Result<Self> {
        let collateral = collateral.filter(|change| match change {
            CollateralChange::Deposit(amount) | CollateralChange::Withdraw(amount) => {
                !amount.is_zero()
            }
        });
        let debt = debt.filter(|change| match change {
            DebtChange::Borrow(amount) | DebtChange::Repay(amount) => !amount.is_zero(),
        });

        if collateral.is_none() && debt.is_none() {
            return Err(Error::InvalidPositionChange(
                "adjustment must include at least one non-zero parameter".to_string(),
            ));
        }

        Ok(Self { collateral, debt })
    }

    pub fn collateral_delta(&self) -> (Decimal, Decimal) {
        match self.collateral {
            Some(CollateralChange::Deposit(amount)) => (amount, Decimal::ZERO),
            Some(CollateralChange::Withdraw(amount)) => (Decimal::ZERO, amount),
            None => (Decimal::ZERO, Decimal::ZERO),
        }
    }

    pub fn debt_delta(&self) -> (Decimal, Decimal) {
        match self.debt {
            Some(DebtChange::Borrow(amount)) => (amount, Decimal::ZERO),
            Some(DebtChange::Repay(amount)) => (Decimal::ZERO, amount),
            None => (Decimal::ZERO, Decimal::ZERO),
        }
    }
}

/// Lifecycle of a position as stored by the LoC manager.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PositionStatus {
    #[default]
    NonExistent,
    Open,
    ClosedByOwner,
    ClosedByLiquidation,
    ClosedByRedemption,
}

impl PositionStatus {
    pub fn from_chain(status: u8) -> Result<Self> {
        match status {
            0 => Ok(PositionStatus::NonExistent),
            1 => Ok(PositionStatus::Open),
            2 => Ok(PositionStatus::ClosedByOwner),
            3 => Ok(PositionStatus::ClosedByLiquidation),
            4 => Ok(PositionStatus::ClosedByRedemption),
            other => Err(Error::InvalidResponse(format!(
                "unknown position status {other}"
            ))),
        }
    }
}

/// A position together with its owner.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserPosition {
    pub owner: Address,
    pub status: PositionStatus,
    pub position: Position,
}

impl UserPosition {
    pub fn empty(owner: Address) -> Self {
        Self {
            owner,
            status: PositionStatus::NonExistent,
            position: Position::EMPTY,
        }
    }
}

/// A position as stored on chain, before pending liquidation
/// redistributions are added to it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PositionWithPendingRedistribution {
    pub owner: Address,
    pub status: PositionStatus,
    pub position: Position,
    pub stake: Decimal,
    pub snapshot_of_total_redistributed: Position,
}

impl PositionWithPendingRedistribution {
    pub fn empty(owner: Address) -> Self {
        Self {
            owner,
            ..Default::default()
        }
    }

    /// `position + (total_redistributed - snapshot) * stake`
    pub fn apply_redistribution(&self, total_redistributed: &Position) -> UserPosition {
        let pending = total_redistributed
            .subtract(&self.snapshot_of_total_redistributed)
            .multiply(self.stake);

        UserPosition {
            owner: self.owner,
            status: self.status,
            position: self.position.add(&pending),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    AscendingCollateralRatio,
    DescendingCollateralRatio,
}

/// Page of the sorted list to fetch with `getMultipleSortedLoCs`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PositionListing {
    pub first: u64,
    pub sorted_by: SortOrder,
    #[serde(default)]
    pub start_index: u64,
}

impl PositionListing {
    /// Negative indices count from the tail of the list (lowest ratio first).
    pub fn signed_start_index(&self) -> Result<i64> {
        let index = i64::try_from(self.start_index).map_err(|_| {
            Error::InvalidPositionChange(format!("start index {} out of range", self.start_index))
        })?;
        Ok(match self.sorted_by {
            SortOrder::DescendingCollateralRatio => index,
            SortOrder::AscendingCollateralRatio => -index - 1,
        })
    }
}

//! Protocol constants mirrored from the on-chain contracts.

use crate::types::Decimal;

/// Amount of ZUSD set aside in every position for gas compensation.
pub const ZUSD_LIQUIDATION_RESERVE: Decimal = Decimal::from_raw_u128(20_000_000_000_000_000_000);

/// Smallest net debt (debt minus liquidation reserve) an open position may carry.
pub const ZUSD_MINIMUM_NET_DEBT: Decimal = Decimal::from_raw_u128(180_000_000_000_000_000_000);

/// Positions below this collateral ratio (110%) can be liquidated.
pub const MINIMUM_COLLATERAL_RATIO: Decimal = Decimal::from_raw_u128(1_100_000_000_000_000_000);

/// The system enters recovery mode when its total ratio falls below 150%.
pub const CRITICAL_COLLATERAL_RATIO: Decimal = Decimal::from_raw_u128(1_500_000_000_000_000_000);

/// Per-minute decay applied to the base rate (half-life of 12 hours).
pub const MINUTE_DECAY_FACTOR: Decimal = Decimal::from_raw_u128(999_037_758_833_783_000);

/// Divisor applied to the redeemed fraction of total supply.
pub const BETA: Decimal = Decimal::from_raw_u128(2_000_000_000_000_000_000);

pub const MINIMUM_BORROWING_RATE: Decimal = Decimal::from_raw_u128(5_000_000_000_000_000);
pub const MAXIMUM_BORROWING_RATE: Decimal = Decimal::from_raw_u128(50_000_000_000_000_000);
pub const MINIMUM_REDEMPTION_RATE: Decimal = Decimal::from_raw_u128(5_000_000_000_000_000);

/// One thousand years; the chain caps the decay exponent at this many minutes.
pub const MAX_DECAY_MINUTES: u64 = 525_600_000;

pub const SECONDS_PER_MINUTE: u64 = 60;

/// Upper bound on positions touched by a single `redeemCollateral` call.
pub const REDEEM_MAX_ITERATIONS: u64 = 70;

/// Added to the quoted redemption rate when the caller doesn't set a ceiling.
pub const DEFAULT_REDEMPTION_RATE_SLIPPAGE_TOLERANCE: Decimal =
    Decimal::from_raw_u128(1_000_000_000_000_000);

/// Added to the quoted borrowing rate when the caller doesn't set a ceiling.
pub const DEFAULT_BORROWING_RATE_SLIPPAGE_TOLERANCE: Decimal =
    Decimal::from_raw_u128(5_000_000_000_000_000);

/// `total_trials = ceil(DEFAULT_HINT_TRIALS_FACTOR * sqrt(list_size))`.
pub const DEFAULT_HINT_TRIALS_FACTOR: f64 = 10.0;

/// The hint helper runs out of gas above this many trials in one call.
pub const DEFAULT_MAX_TRIALS_PER_CALL: u64 = 2500;

pub const LAST_FEE_OPERATION_TIME_UPDATE_GAS: u64 = 10_000;
pub const LIST_TRAVERSAL_GAS: u64 = 80_000;
pub const ZERO_ISSUANCE_GAS: u64 = 50_000;

//! Local reproduction of the protocol's time-decaying fee rates.
//!
//! The base rate is bumped by every redemption and decays exponentially with
//! the number of whole minutes since the last fee operation. Borrowing and
//! redemption fees are both derived from it. The computation here mirrors the
//! contract's integer math so the quoted rate equals what the chain charges
//! in the same block.

use serde::{Deserialize, Serialize};

use crate::{
    consts::{
        BETA, MAXIMUM_BORROWING_RATE, MAX_DECAY_MINUTES, MINIMUM_BORROWING_RATE,
        MINIMUM_REDEMPTION_RATE, MINUTE_DECAY_FACTOR, SECONDS_PER_MINUTE,
    },
    Decimal,
};

/// Whole minutes between two timestamps, as counted by the contracts.
///
/// A `now` earlier than `last_operation_time` counts as zero elapsed minutes.
pub fn elapsed_minutes(last_operation_time: u64, now: u64) -> u64 {
    (now.saturating_sub(last_operation_time) / SECONDS_PER_MINUTE).min(MAX_DECAY_MINUTES)
}

/// `base_rate * decay_factor ^ elapsed_minutes(last_operation_time, now)`
pub fn decayed_base_rate(
    base_rate_without_decay: Decimal,
    decay_factor: Decimal,
    last_operation_time: u64,
    now: u64,
) -> Decimal {
    let minutes = elapsed_minutes(last_operation_time, now);
    base_rate_without_decay * decay_factor.pow(minutes)
}

/// Fee state as stored by the LoC manager.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeeParameters {
    pub base_rate_without_decay: Decimal,
    /// Seconds since the epoch.
    pub last_fee_operation_time: u64,
}

impl FeeParameters {
    /// Fee calculator anchored at the given block.
    pub fn at(&self, block_timestamp: u64, recovery_mode: bool) -> Fees {
        Fees {
            base_rate_without_decay: self.base_rate_without_decay,
            minute_decay_factor: MINUTE_DECAY_FACTOR,
            beta: BETA,
            last_fee_operation_time: self.last_fee_operation_time,
            block_timestamp,
            recovery_mode,
        }
    }
}

/// Calculator for borrowing and redemption rates at a point in time.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Fees {
    base_rate_without_decay: Decimal,
    minute_decay_factor: Decimal,
    beta: Decimal,
    last_fee_operation_time: u64,
    block_timestamp: u64,
    recovery_mode: bool,
}

impl Fees {
    pub fn block_timestamp(&self) -> u64 {
        self.block_timestamp
    }

    pub fn is_recovery_mode(&self) -> bool {
        self.recovery_mode
    }

    pub fn with_recovery_mode(mut self, recovery_mode: bool) -> Self {
        self.recovery_mode = recovery_mode;
        self
    }

    /// Decayed base rate at `when` (defaults to the anchoring block's timestamp).
    pub fn base_rate(&self, when: Option<u64>) -> Decimal {
        decayed_base_rate(
            self.base_rate_without_decay,
            self.minute_decay_factor,
            self.last_fee_operation_time,
            when.unwrap_or(self.block_timestamp),
        )
    }

    /// Fraction of newly borrowed ZUSD added to the debt as fee.
    ///
    /// Zero in recovery mode, capped at the maximum borrowing rate otherwise.
    pub fn borrowing_rate(&self, when: Option<u64>) -> Decimal {
        if self.recovery_mode {
            return Decimal::ZERO;
        }
        (MINIMUM_BORROWING_RATE + self.base_rate(when)).min(MAXIMUM_BORROWING_RATE)
    }

    /// Fraction of redeemed collateral kept as fee.
    ///
    /// `redeemed_fraction_of_supply` is the amount being redeemed divided by the
    /// total ZUSD supply; the chain bumps the base rate by this fraction over
    /// beta before charging, so the rate quoted here includes that bump.
    pub fn redemption_rate(&self, redeemed_fraction_of_supply: Decimal, when: Option<u64>) -> Decimal {
        (MINIMUM_REDEMPTION_RATE + self.base_rate(when) + redeemed_fraction_of_supply / self.beta)
            .min(Decimal::ONE)
    }
}

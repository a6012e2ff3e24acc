//! Stability pool deposits, ZERO staking and frontend registration.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::Decimal;

/// A user's deposit in the stability pool.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StabilityDeposit {
    /// Amount deposited at the last deposit operation.
    pub initial_zusd: Decimal,
    /// Deposit after absorbing liquidated debt since then.
    pub current_zusd: Decimal,
    pub collateral_gain: Decimal,
    pub zero_reward: Decimal,
    /// Frontend the deposit was made through, zero address if none.
    pub frontend_tag: Address,
}

impl StabilityDeposit {
    pub fn is_empty(&self) -> bool {
        self.initial_zusd.is_zero()
            && self.current_zusd.is_zero()
            && self.collateral_gain.is_zero()
            && self.zero_reward.is_zero()
    }
}

/// A user's ZERO stake and the fees it has earned.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ZeroStake {
    pub staked_zero: Decimal,
    pub collateral_gain: Decimal,
    pub zusd_gain: Decimal,
}

impl ZeroStake {
    pub fn is_empty(&self) -> bool {
        self.staked_zero.is_zero() && self.collateral_gain.is_zero() && self.zusd_gain.is_zero()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum FrontendStatus {
    #[default]
    Unregistered,
    Registered {
        #[serde(rename = "kickbackRate")]
        kickback_rate: Decimal,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frontend_status_serde() {
        let status = FrontendStatus::Registered {
            kickback_rate: "0.5".parse().unwrap(),
        };
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json["status"], "registered");
        assert_eq!(json["kickbackRate"], "0.5");
    }

    #[test]
    fn test_empty_deposit() {
        assert!(StabilityDeposit::default().is_empty());
        assert!(!ZeroStake {
            staked_zero: 1u64.into(),
            ..Default::default()
        }
        .is_empty());
    }
}

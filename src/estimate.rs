//! Gas padding applied on top of node estimates.
//!
//! A node estimates gas against the state of the latest block, but some code
//! paths cost more depending on state at execution time: the first fee
//! operation in a new minute writes `lastFeeOperationTime`, hints may have
//! gone stale and force a list traversal, and stability pool operations may
//! trigger ZERO issuance. Each operation composes the paddings that apply to it.

use serde::{Deserialize, Serialize};

use crate::consts::{LAST_FEE_OPERATION_TIME_UPDATE_GAS, LIST_TRAVERSAL_GAS, ZERO_ISSUANCE_GAS};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum GasPadding {
    LastFeeOperationTimeUpdate,
    ListTraversal,
    ZeroIssuance,
    /// Arbitrary extra gas.
    Fixed(u64),
}

impl GasPadding {
    pub fn amount(&self) -> u64 {
        match self {
            GasPadding::LastFeeOperationTimeUpdate => LAST_FEE_OPERATION_TIME_UPDATE_GAS,
            GasPadding::ListTraversal => LIST_TRAVERSAL_GAS,
            GasPadding::ZeroIssuance => ZERO_ISSUANCE_GAS,
            GasPadding::Fixed(gas) => *gas,
        }
    }
}

/// Ordered list of paddings added to a gas estimate.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct EstimateAdjustment {
    steps: Vec<GasPadding>,
}

impl EstimateAdjustment {
    /// Use the node's estimate as is.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(mut self, padding: GasPadding) -> Self {
        self.steps.push(padding);
        self
    }

    pub fn steps(&self) -> &[GasPadding] {
        &self.steps
    }

    pub fn apply(&self, estimate: u64) -> u64 {
        self.steps
            .iter()
            .fold(estimate, |gas, padding| gas.saturating_add(padding.amount()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paddings_compose() {
        let adjustment = EstimateAdjustment::none()
            .with(GasPadding::LastFeeOperationTimeUpdate)
            .with(GasPadding::ListTraversal);
        assert_eq!(adjustment.apply(100_000), 190_000);
        assert_eq!(EstimateAdjustment::none().apply(21_000), 21_000);
    }

    #[test]
    fn test_apply_saturates() {
        let adjustment = EstimateAdjustment::none().with(GasPadding::Fixed(10));
        assert_eq!(adjustment.apply(u64::MAX - 1), u64::MAX);
    }
}

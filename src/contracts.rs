//! ABI bindings for the subset of the protocol contracts the SDK talks to,
//! plus the deployment address book.

#![allow(clippy::too_many_arguments)]

use alloy::{primitives::Address, sol};
use serde::{Deserialize, Serialize};

sol! {
    interface ILoCManager {
        function baseRate() external view returns (uint256);
        function lastFeeOperationTime() external view returns (uint256);
        function getLoCOwnersCount() external view returns (uint256);
        function L_BTC() external view returns (uint256);
        function L_ZUSDDebt() external view returns (uint256);
        function LoCs(address owner) external view returns (
            uint256 debt,
            uint256 coll,
            uint256 stake,
            uint8 status,
            uint128 arrayIndex
        );
        function rewardSnapshots(address owner) external view returns (uint256 BTC, uint256 ZUSDDebt);
        function redeemCollateral(
            uint256 _ZUSDAmount,
            address _firstRedemptionHint,
            address _upperPartialRedemptionHint,
            address _lowerPartialRedemptionHint,
            uint256 _partialRedemptionHintNICR,
            uint256 _maxIterations,
            uint256 _maxFeePercentage
        ) external;
    }

    interface IPool {
        function getBTC() external view returns (uint256);
        function getZUSDDebt() external view returns (uint256);
    }

    interface IPriceFeed {
        function fetchPrice() external returns (uint256);
    }

    interface IStabilityPool {
        function deposits(address depositor) external view returns (uint256 initialValue, address frontEndTag);
        function getCompoundedZUSDDeposit(address depositor) external view returns (uint256);
        function getDepositorBTCGain(address depositor) external view returns (uint256);
        function getDepositorZEROGain(address depositor) external view returns (uint256);
        function getTotalZUSDDeposits() external view returns (uint256);
        function frontEnds(address frontend) external view returns (uint256 kickbackRate, bool registered);

        function provideToSP(uint256 _amount, address _frontEndTag) external;
        function withdrawFromSP(uint256 _amount) external;
        function withdrawBTCGainToLoC(address _upperHint, address _lowerHint) external;
        function registerFrontEnd(uint256 _kickbackRate) external;
    }

    interface ICommunityIssuance {
        function ZEROSupplyCap() external view returns (uint256);
        function totalZEROIssued() external view returns (uint256);
    }

    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
    }

    interface ICollSurplusPool {
        function getCollateral(address account) external view returns (uint256);
    }

    interface IZEROStaking {
        function stakes(address staker) external view returns (uint256);
        function getPendingBTCGain(address staker) external view returns (uint256);
        function getPendingZUSDGain(address staker) external view returns (uint256);
        function totalZEROStaked() external view returns (uint256);

        function stake(uint256 _ZEROamount) external;
        function unstake(uint256 _ZEROamount) external;
    }

    interface ISortedLoCs {
        function getFirst() external view returns (address);
        function findInsertPosition(uint256 _NICR, address _prevId, address _nextId)
            external view returns (address, address);
    }

    interface IHintHelpers {
        function getApproxHint(uint256 _CR, uint256 _numTrials, uint256 _inputRandomSeed)
            external view returns (address hintAddress, uint256 diff, uint256 latestRandomSeed);
        function getRedemptionHints(uint256 _ZUSDamount, uint256 _price, uint256 _maxIterations)
            external view returns (
                address firstRedemptionHint,
                uint256 partialRedemptionHintNICR,
                uint256 truncatedZUSDamount
            );
    }

    struct CombinedLoCData {
        address owner;
        uint256 debt;
        uint256 coll;
        uint256 stake;
        uint256 snapshotBTC;
        uint256 snapshotZUSDDebt;
    }

    interface IMultiLoCGetter {
        function getMultipleSortedLoCs(int256 _startIdx, uint256 _count)
            external view returns (CombinedLoCData[] memory);
    }

    interface IBorrowerOperations {
        function openLoC(uint256 _maxFee, uint256 _ZUSDAmount, address _upperHint, address _lowerHint)
            external payable;
        function adjustLoC(
            uint256 _maxFee,
            uint256 _collWithdrawal,
            uint256 _debtChange,
            bool isDebtIncrease,
            address _upperHint,
            address _lowerHint
        ) external payable;
        function closeLoC() external;
        function claimCollateral() external;
    }
}

/// Deployed contract addresses of one protocol instance.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddressBook {
    pub active_pool: Address,
    pub borrower_operations: Address,
    pub coll_surplus_pool: Address,
    pub community_issuance: Address,
    pub default_pool: Address,
    pub hint_helpers: Address,
    pub loc_manager: Address,
    pub multi_loc_getter: Address,
    pub price_feed: Address,
    pub sorted_locs: Address,
    pub stability_pool: Address,
    pub zero_staking: Address,
    pub zero_token: Address,
    pub zusd_token: Address,
}

impl AddressBook {
    /// Names of entries still set to the zero address.
    pub fn missing(&self) -> Vec<&'static str> {
        [
            ("activePool", self.active_pool),
            ("borrowerOperations", self.borrower_operations),
            ("collSurplusPool", self.coll_surplus_pool),
            ("communityIssuance", self.community_issuance),
            ("defaultPool", self.default_pool),
            ("hintHelpers", self.hint_helpers),
            ("locManager", self.loc_manager),
            ("multiLoCGetter", self.multi_loc_getter),
            ("priceFeed", self.price_feed),
            ("sortedLoCs", self.sorted_locs),
            ("stabilityPool", self.stability_pool),
            ("zeroStaking", self.zero_staking),
            ("zeroToken", self.zero_token),
            ("zusdToken", self.zusd_token),
        ]
        .into_iter()
        .filter(|(_, address)| address.is_zero())
        .map(|(name, _)| name)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use alloy::{primitives::U256, sol_types::SolCall};

    use super::*;

    #[test]
    fn test_find_insert_position_round_trip() {
        let call = ISortedLoCs::findInsertPositionCall {
            _NICR: U256::from(5u64),
            _prevId: Address::repeat_byte(1),
            _nextId: Address::repeat_byte(2),
        };
        let encoded = call.abi_encode();
        assert_eq!(&encoded[..4], ISortedLoCs::findInsertPositionCall::SELECTOR.as_slice());
        assert_eq!(encoded.len(), 4 + 3 * 32);
    }

    #[test]
    fn test_missing_addresses() {
        let book = AddressBook {
            hint_helpers: Address::repeat_byte(7),
            ..Default::default()
        };
        let missing = book.missing();
        assert_eq!(missing.len(), 13);
        assert!(!missing.contains(&"hintHelpers"));
        assert!(missing.contains(&"sortedLoCs"));
    }
}

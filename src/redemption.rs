//! Redemption sizing.
//!
//! A redemption swaps ZUSD for collateral taken from the riskiest positions.
//! The chain refuses to leave a partially redeemed position below the minimum
//! net debt and stops after a bounded number of positions, so the amount
//! that can actually be redeemed may be smaller than what was asked for.
//! [`RedemptionSizer::prepare`] asks the hint helper for that truncated amount
//! together with the hints `redeemCollateral` needs.

use std::{fmt, sync::Arc};

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    consts::{DEFAULT_REDEMPTION_RATE_SLIPPAGE_TOLERANCE, REDEEM_MAX_ITERATIONS, ZUSD_MINIMUM_NET_DEBT},
    fees::Fees,
    hints::HintSearch,
    prelude::*,
    remote::{HintHelpers, ProtocolReader},
    types::{Decimal, Position},
    Error,
};

/// Hints for a `redeemCollateral` call.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionHints {
    pub truncated_amount: Decimal,
    /// First position the redemption touches.
    pub first_redemption_hint: Address,
    pub partial_upper_hint: Address,
    pub partial_lower_hint: Address,
    /// Nominal ratio of the partially redeemed position after redemption,
    /// zero when the last touched position is redeemed fully.
    pub partial_nominal_ratio: Decimal,
}

/// Sizes redemptions against the chain's truncation rules.
#[derive(Clone)]
pub struct RedemptionSizer {
    reader: Arc<dyn ProtocolReader>,
    helpers: Arc<dyn HintHelpers>,
    hint_search: HintSearch,
    max_iterations: u64,
}

impl RedemptionSizer {
    pub fn new(
        reader: Arc<dyn ProtocolReader>,
        helpers: Arc<dyn HintHelpers>,
        hint_search: HintSearch,
    ) -> Self {
        Self {
            reader,
            helpers,
            hint_search,
            max_iterations: REDEEM_MAX_ITERATIONS,
        }
    }

    pub fn max_iterations(&self) -> u64 {
        self.max_iterations
    }

    /// Redemption hints for `amount` at the current price.
    ///
    /// Upper and lower hints are only searched for when the redemption ends
    /// in a partially redeemed position.
    pub async fn find_redemption_hints(&self, amount: Decimal) -> Result<RedemptionHints> {
        let price = self.reader.price(None).await?;
        let response = self
            .helpers
            .redemption_hints(amount, price, self.max_iterations)
            .await?;

        let (partial_upper_hint, partial_lower_hint) = if response.partial_redemption_hint_nicr.is_zero() {
            (Address::ZERO, Address::ZERO)
        } else {
            self.hint_search
                .find_hints(response.partial_redemption_hint_nicr)
                .await?
        };

        Ok(RedemptionHints {
            truncated_amount: response.truncated_amount,
            first_redemption_hint: response.first_redemption_hint,
            partial_upper_hint,
            partial_lower_hint,
            partial_nominal_ratio: response.partial_redemption_hint_nicr,
        })
    }

    /// Size a redemption of `attempted_amount`.
    ///
    /// Without `max_redemption_rate` the ceiling defaults to the quoted rate
    /// for the truncated amount plus a small slippage tolerance, capped at 100%.
    pub async fn prepare(
        &self,
        attempted_amount: Decimal,
        max_redemption_rate: Option<Decimal>,
    ) -> Result<Redemption> {
        let (fees, total, hints) = tokio::try_join!(
            self.reader.fees(None),
            self.reader.total(None),
            self.find_redemption_hints(attempted_amount)
        )?;

        let truncated_amount = hints.truncated_amount;

        if truncated_amount.is_zero() {
            return Err(Error::AmountTooSmall {
                minimum: ZUSD_MINIMUM_NET_DEBT,
            });
        }
        if truncated_amount > attempted_amount {
            return Err(Error::InvalidResponse(format!(
                "truncated amount {truncated_amount} exceeds attempted amount {attempted_amount}"
            )));
        }

        let is_truncated = truncated_amount < attempted_amount;
        let max_rate = max_redemption_rate
            .unwrap_or_else(|| default_max_redemption_rate(&fees, &total, truncated_amount));

        debug!(
            %attempted_amount,
            %truncated_amount,
            is_truncated,
            %max_rate,
            first_hint = %hints.first_redemption_hint,
            "Prepared redemption"
        );

        Ok(Redemption {
            attempted_amount,
            truncated_amount,
            is_truncated,
            hints,
            max_redemption_rate: max_rate,
            requested_max_rate: max_redemption_rate,
            fees,
            sizer: self.clone(),
        })
    }
}

/// `min(redemption_rate(amount / total_debt) + tolerance, 1)`
pub fn default_max_redemption_rate(fees: &Fees, total: &Position, amount: Decimal) -> Decimal {
    (fees.redemption_rate(amount / total.debt, None) + DEFAULT_REDEMPTION_RATE_SLIPPAGE_TOLERANCE)
        .min(Decimal::ONE)
}

/// A sized redemption, ready to be turned into a `redeemCollateral` call.
#[derive(Clone)]
pub struct Redemption {
    pub attempted_amount: Decimal,
    /// Amount the chain will redeem; never more than `attempted_amount`.
    pub truncated_amount: Decimal,
    pub is_truncated: bool,
    pub hints: RedemptionHints,
    pub max_redemption_rate: Decimal,
    /// Ceiling the caller asked for, if any. Carried over by [`Redemption::increase`].
    pub requested_max_rate: Option<Decimal>,
    /// Fee calculator the default ceiling was derived from.
    pub fees: Fees,
    sizer: RedemptionSizer,
}

impl Redemption {
    /// Re-size a truncated redemption to the next amount the chain can take,
    /// `truncated_amount + ZUSD_MINIMUM_NET_DEBT`.
    ///
    /// The whole sizing runs again, so hints and the default rate ceiling
    /// reflect the larger amount. Without `max_redemption_rate` the ceiling
    /// originally requested (if any) is reused.
    pub async fn increase(&self, max_redemption_rate: Option<Decimal>) -> Result<Redemption> {
        if !self.is_truncated {
            return Err(Error::UnsupportedOperation(
                "increase: redemption is not truncated".to_string(),
            ));
        }

        let attempted_amount = self.truncated_amount + ZUSD_MINIMUM_NET_DEBT;
        info!(
            previous = %self.attempted_amount,
            %attempted_amount,
            "Increasing truncated redemption"
        );

        self.sizer
            .prepare(attempted_amount, max_redemption_rate.or(self.requested_max_rate))
            .await
    }
}

impl fmt::Debug for Redemption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Redemption")
            .field("attempted_amount", &self.attempted_amount)
            .field("truncated_amount", &self.truncated_amount)
            .field("is_truncated", &self.is_truncated)
            .field("hints", &self.hints)
            .field("max_redemption_rate", &self.max_redemption_rate)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::U256;
    use async_trait::async_trait;

    use super::*;
    use crate::{
        hints::HintSearchConfig,
        remote::{ApproxHint, RedemptionHintsResponse},
        simulation::{AccountState, SimulatedChain},
    };

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn owner(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn sizer(chain: &SimulatedChain) -> RedemptionSizer {
        let reader: Arc<dyn ProtocolReader> = Arc::new(chain.clone());
        let helpers: Arc<dyn HintHelpers> = Arc::new(chain.clone());
        let hint_search = HintSearch::new(reader.clone(), helpers.clone(), HintSearchConfig::default());
        RedemptionSizer::new(reader, helpers, hint_search)
    }

    /// Four positions each carrying 1000 net debt, all safely collateralized at price 200.
    fn equal_positions() -> SimulatedChain {
        let chain = SimulatedChain::new(1_700_000_000);
        for (n, collateral) in [(1u8, "10"), (2, "11"), (3, "12"), (4, "13")] {
            chain.open_position(owner(n), Position::new(d(collateral), d("1020")));
        }
        chain
    }

    #[tokio::test]
    async fn test_untruncated_redemption() {
        let chain = equal_positions();
        let redemption = sizer(&chain).prepare(d("1500"), None).await.unwrap();

        assert_eq!(redemption.truncated_amount, d("1500"));
        assert!(!redemption.is_truncated);
        assert_eq!(redemption.hints.first_redemption_hint, owner(1));
        assert!(!redemption.hints.partial_nominal_ratio.is_zero());
        // the partially redeemed position moves to the head of the list
        assert_eq!(
            (redemption.hints.partial_upper_hint, redemption.hints.partial_lower_hint),
            (Address::ZERO, owner(4))
        );
    }

    #[tokio::test]
    async fn test_truncated_redemption_and_increase() {
        let chain = equal_positions();
        let sizer = sizer(&chain);

        // The second position would drop to 100 net debt, below the minimum
        // of 180, so only 1000 + 820 can be redeemed.
        let redemption = sizer.prepare(d("1900"), None).await.unwrap();
        assert_eq!(redemption.truncated_amount, d("1820"));
        assert!(redemption.is_truncated);
        assert!(redemption.truncated_amount <= redemption.attempted_amount);

        let increased = redemption.increase(None).await.unwrap();
        assert_eq!(increased.attempted_amount, d("2000"));
        assert_eq!(increased.truncated_amount, d("2000"));
        assert!(!increased.is_truncated);
        // full redemptions of two positions leave no partial hint
        assert_eq!(increased.hints.partial_nominal_ratio, Decimal::ZERO);
        assert_eq!(increased.hints.partial_upper_hint, Address::ZERO);
        assert_eq!(increased.hints.partial_lower_hint, Address::ZERO);
    }

    #[tokio::test]
    async fn test_increase_requires_truncation() {
        let chain = equal_positions();
        let redemption = sizer(&chain).prepare(d("1500"), None).await.unwrap();
        let err = redemption.increase(None).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));
    }

    #[tokio::test]
    async fn test_increase_keeps_requested_ceiling() {
        let chain = equal_positions();
        let redemption = sizer(&chain).prepare(d("1900"), Some(d("0.2"))).await.unwrap();
        assert_eq!(redemption.max_redemption_rate, d("0.2"));

        let increased = redemption.increase(None).await.unwrap();
        assert_eq!(increased.max_redemption_rate, d("0.2"));

        let overridden = redemption.increase(Some(d("0.3"))).await.unwrap();
        assert_eq!(overridden.max_redemption_rate, d("0.3"));
    }

    #[tokio::test]
    async fn test_amount_too_small() {
        let chain = SimulatedChain::new(1_700_000_000);
        chain.open_position(owner(1), Position::new(d("10"), d("200")));
        chain.open_position(owner(2), Position::new(d("12"), d("200")));

        let err = sizer(&chain).prepare(d("100"), None).await.unwrap_err();
        match err {
            Error::AmountTooSmall { minimum } => assert_eq!(minimum, d("180")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_default_max_rate() {
        let chain = equal_positions();
        let redemption = sizer(&chain).prepare(d("1500"), None).await.unwrap();

        // base rate 0: 0.005 + (1500 / 4080) / 2 + 0.001
        let expected = d("0.005") + (d("1500") / d("4080")) / d("2") + d("0.001");
        assert_eq!(redemption.max_redemption_rate, expected);
    }

    #[tokio::test]
    async fn test_end_to_end_against_simulated_chain() {
        let chain = SimulatedChain::new(1_700_000_000);
        chain.open_position(owner(1), Position::new(d("10"), d("1020")));
        chain.open_position(owner(2), Position::new(d("11"), d("1020")));
        chain.open_position(owner(3), Position::new(d("20"), d("1520")));
        chain.open_position(owner(4), Position::new(d("50"), d("2020")));
        let redeemer = owner(9);
        chain.set_account(
            redeemer,
            AccountState {
                zusd: d("3000"),
                ..Default::default()
            },
        );

        let redemption = sizer(&chain).prepare(d("2001"), None).await.unwrap();
        assert!(!redemption.is_truncated);
        assert_eq!(redemption.hints.first_redemption_hint, owner(1));
        assert_eq!(
            redemption.hints.partial_nominal_ratio,
            Position::new(d("19.995"), d("1519")).nominal_collateral_ratio()
        );

        chain
            .redeem_collateral(
                redeemer,
                redemption.truncated_amount,
                sizer(&chain).max_iterations(),
                redemption.max_redemption_rate,
            )
            .unwrap();

        for emptied in [owner(1), owner(2)] {
            let position = chain.position(Some(emptied), None).await.unwrap();
            assert!(position.position.is_empty());
        }
        let partial = chain.position(Some(owner(3)), None).await.unwrap();
        assert_eq!(partial.position.net_debt(), Some(d("1499")));
    }

    /// Serves the sorted list from the chain but fails `getRedemptionHints`.
    struct FailingRedemptionHints {
        chain: SimulatedChain,
        error: fn() -> Error,
    }

    #[async_trait]
    impl HintHelpers for FailingRedemptionHints {
        async fn first_in_list(&self) -> Result<Address> {
            self.chain.first_in_list().await
        }

        async fn approx_hint(&self, ratio: Decimal, trials: u64, seed: U256) -> Result<ApproxHint> {
            self.chain.approx_hint(ratio, trials, seed).await
        }

        async fn find_insert_position(
            &self,
            ratio: Decimal,
            prev: Address,
            next: Address,
        ) -> Result<(Address, Address)> {
            self.chain.find_insert_position(ratio, prev, next).await
        }

        async fn redemption_hints(
            &self,
            _: Decimal,
            _: Decimal,
            _: u64,
        ) -> Result<RedemptionHintsResponse> {
            Err((self.error)())
        }
    }

    fn failing_sizer(chain: &SimulatedChain, error: fn() -> Error) -> RedemptionSizer {
        let reader: Arc<dyn ProtocolReader> = Arc::new(chain.clone());
        let helpers: Arc<dyn HintHelpers> = Arc::new(FailingRedemptionHints {
            chain: chain.clone(),
            error,
        });
        let hint_search = HintSearch::new(reader.clone(), helpers.clone(), HintSearchConfig::default());
        RedemptionSizer::new(reader, helpers, hint_search)
    }

    #[tokio::test]
    async fn test_transport_failure_reaches_caller() {
        let chain = equal_positions();

        let err = failing_sizer(&chain, || Error::GenericRequest("connection reset".to_string()))
            .prepare(d("1500"), None)
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(matches!(&err, Error::GenericRequest(message) if message == "connection reset"));

        let err = failing_sizer(&chain, || Error::Rpc {
            code: 3,
            message: "execution reverted".to_string(),
            data: None,
        })
        .prepare(d("1500"), None)
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Rpc { code: 3, .. }));
    }
}

//! Insertion hints for the sorted position list.
//!
//! The chain keeps positions in a doubly linked list ordered by nominal
//! collateral ratio. Every operation that moves a position needs the
//! neighbours it will be inserted between, otherwise the contract has to walk
//! the list itself. Fetching the whole list is out of the question, so the
//! search samples it: `getApproxHint` picks random positions and reports the
//! closest one, and `findInsertPosition` walks from there to the exact spot.

use std::sync::Arc;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    consts::{DEFAULT_HINT_TRIALS_FACTOR, DEFAULT_MAX_TRIALS_PER_CALL},
    helpers::{random_seed, trial_batches},
    prelude::*,
    remote::{ApproxHint, HintHelpers, ProtocolReader},
    types::{Decimal, Position},
    Error,
};

fn default_trials_factor() -> f64 {
    DEFAULT_HINT_TRIALS_FACTOR
}

fn default_max_trials_per_call() -> u64 {
    DEFAULT_MAX_TRIALS_PER_CALL
}

/// Sampling parameters of the hint search.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HintSearchConfig {
    /// Total trials are `ceil(trials_factor * sqrt(list_size))`.
    #[serde(default = "default_trials_factor")]
    pub trials_factor: f64,
    /// Largest trial count sent in one `getApproxHint` call.
    #[serde(default = "default_max_trials_per_call")]
    pub max_trials_per_call: u64,
}

impl Default for HintSearchConfig {
    fn default() -> Self {
        Self {
            trials_factor: DEFAULT_HINT_TRIALS_FACTOR,
            max_trials_per_call: DEFAULT_MAX_TRIALS_PER_CALL,
        }
    }
}

impl HintSearchConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.trials_factor.is_finite() || self.trials_factor <= 0.0 {
            return Err(Error::Config(format!(
                "trials_factor must be positive, got {}",
                self.trials_factor
            )));
        }
        if self.max_trials_per_call == 0 {
            return Err(Error::Config("max_trials_per_call must be positive".to_string()));
        }
        Ok(())
    }

    /// `ceil(trials_factor * sqrt(list_size))`, at least one.
    pub fn total_trials(&self, list_size: u64) -> u64 {
        let trials = (self.trials_factor * (list_size as f64).sqrt()).ceil() as u64;
        trials.max(1)
    }

    /// Per-call trial counts for a list of `list_size` positions.
    pub fn batches(&self, list_size: u64) -> Vec<u64> {
        trial_batches(self.total_trials(list_size), self.max_trials_per_call)
    }
}

/// Sampling search over the remote sorted list.
#[derive(Clone)]
pub struct HintSearch {
    reader: Arc<dyn ProtocolReader>,
    helpers: Arc<dyn HintHelpers>,
    config: HintSearchConfig,
}

impl HintSearch {
    pub fn new(
        reader: Arc<dyn ProtocolReader>,
        helpers: Arc<dyn HintHelpers>,
        config: HintSearchConfig,
    ) -> Self {
        Self {
            reader,
            helpers,
            config,
        }
    }

    pub fn config(&self) -> &HintSearchConfig {
        &self.config
    }

    /// `(prev, next)` neighbours for a position with the given nominal ratio.
    ///
    /// An empty list yields two zero addresses and an infinite ratio goes to
    /// the head of the list; neither case samples. Otherwise the batches run
    /// one after another, each seeded by the previous one, and the closest
    /// sample (first one on ties) is refined with `findInsertPosition`.
    pub async fn find_hints(&self, nominal_ratio: Decimal) -> Result<(Address, Address)> {
        let list_size = self.reader.number_of_positions(None).await?;

        if list_size == 0 {
            return Ok((Address::ZERO, Address::ZERO));
        }

        if nominal_ratio.is_infinite() {
            let first = self.helpers.first_in_list().await?;
            return Ok((Address::ZERO, first));
        }

        let batches = self.config.batches(list_size);
        debug!(
            %nominal_ratio,
            list_size,
            total_trials = batches.iter().sum::<u64>(),
            calls = batches.len(),
            "Searching for approximate hint"
        );

        let mut seed = random_seed();
        let mut best: Option<ApproxHint> = None;

        for num_trials in batches {
            let hint = self.helpers.approx_hint(nominal_ratio, num_trials, seed).await?;
            seed = hint.latest_random_seed;

            if best.map_or(true, |best| hint.diff < best.diff) {
                best = Some(hint);
            }
        }

        let hint_address = best.map_or(Address::ZERO, |best| best.hint_address);
        self.helpers
            .find_insert_position(nominal_ratio, hint_address, hint_address)
            .await
    }

    /// Hints for a position. Pending redistribution must already be applied.
    pub async fn find_hints_for_position(&self, position: &Position) -> Result<(Address, Address)> {
        self.find_hints(position.nominal_collateral_ratio()).await
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::U256;
    use async_trait::async_trait;

    use super::*;
    use crate::{remote::RedemptionHintsResponse, simulation::SimulatedChain};

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn owner(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn chain_with_positions() -> SimulatedChain {
        let chain = SimulatedChain::new(1_700_000_000);
        chain.open_position(owner(1), Position::new(d("10"), d("1020")));
        chain.open_position(owner(2), Position::new(d("11"), d("1020")));
        chain.open_position(owner(3), Position::new(d("20"), d("1520")));
        chain.open_position(owner(4), Position::new(d("50"), d("2020")));
        chain
    }

    fn search(chain: &SimulatedChain, config: HintSearchConfig) -> HintSearch {
        HintSearch::new(Arc::new(chain.clone()), Arc::new(chain.clone()), config)
    }

    #[test]
    fn test_batch_count_formula() {
        let config = HintSearchConfig::default();
        for list_size in [1u64, 4, 100, 62_500, 62_501, 1_000_000, 7_000_000] {
            let total = (10.0 * (list_size as f64).sqrt()).ceil() as u64;
            let batches = config.batches(list_size);
            assert_eq!(batches.len() as u64, total.div_ceil(2500), "list_size {list_size}");
            assert_eq!(batches.iter().sum::<u64>(), total);
            assert!(batches.iter().all(|&batch| batch <= 2500));
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(HintSearchConfig::default().validate().is_ok());
        assert!(HintSearchConfig {
            trials_factor: 0.0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(HintSearchConfig {
            max_trials_per_call: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[tokio::test]
    async fn test_empty_list_returns_zero_pair_without_calls() {
        let chain = SimulatedChain::new(1_700_000_000);
        let hints = search(&chain, HintSearchConfig::default())
            .find_hints(d("1.5"))
            .await
            .unwrap();

        assert_eq!(hints, (Address::ZERO, Address::ZERO));
        let calls = chain.calls();
        assert_eq!(calls.first_in_list, 0);
        assert!(calls.approx_hint.is_empty());
        assert!(calls.find_insert_position.is_empty());
    }

    #[tokio::test]
    async fn test_infinite_ratio_goes_to_head() {
        let chain = chain_with_positions();
        let hints = search(&chain, HintSearchConfig::default())
            .find_hints(Decimal::INFINITY)
            .await
            .unwrap();

        assert_eq!(hints, (Address::ZERO, owner(4)));
        let calls = chain.calls();
        assert_eq!(calls.first_in_list, 1);
        assert!(calls.approx_hint.is_empty());
        assert!(calls.find_insert_position.is_empty());
    }

    #[tokio::test]
    async fn test_batches_chain_their_seeds() {
        let chain = chain_with_positions();
        let config = HintSearchConfig {
            trials_factor: 10.0,
            max_trials_per_call: 3,
        };

        let hints = search(&chain, config).find_hints(d("1.2")).await.unwrap();
        assert_eq!(hints, (owner(3), owner(2)));

        let calls = chain.calls();
        // ceil(10 * sqrt(4)) = 20 trials in batches of 3
        assert_eq!(
            calls.approx_hint.iter().map(|(trials, _, _)| *trials).collect::<Vec<_>>(),
            vec![3, 3, 3, 3, 3, 3, 2]
        );
        for pair in calls.approx_hint.windows(2) {
            assert_eq!(pair[1].1, pair[0].2);
        }

        let (ratio, prev, next) = calls.find_insert_position[0];
        assert_eq!(ratio, d("1.2"));
        assert_eq!(prev, next);
    }

    #[tokio::test]
    async fn test_find_hints_for_position() {
        let chain = chain_with_positions();
        let hints = search(&chain, HintSearchConfig::default())
            .find_hints_for_position(&Position::new(d("30"), d("1000")))
            .await
            .unwrap();
        assert_eq!(hints, (Address::ZERO, owner(4)));
    }

    struct BrokenHelpers;

    #[async_trait]
    impl HintHelpers for BrokenHelpers {
        async fn first_in_list(&self) -> Result<Address> {
            Ok(Address::ZERO)
        }

        async fn approx_hint(&self, _: Decimal, _: u64, _: U256) -> Result<ApproxHint> {
            Err(Error::GenericRequest("connection reset".to_string()))
        }

        async fn find_insert_position(
            &self,
            _: Decimal,
            _: Address,
            _: Address,
        ) -> Result<(Address, Address)> {
            unreachable!("search must stop at the failed batch")
        }

        async fn redemption_hints(
            &self,
            _: Decimal,
            _: Decimal,
            _: u64,
        ) -> Result<RedemptionHintsResponse> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_transport_failure_fails_search() {
        let chain = chain_with_positions();
        let search = HintSearch::new(
            Arc::new(chain),
            Arc::new(BrokenHelpers),
            HintSearchConfig::default(),
        );
        let err = search.find_hints(d("1.2")).await.unwrap_err();
        assert!(err.is_transport());
    }
}

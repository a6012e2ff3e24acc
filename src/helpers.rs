use alloy::primitives::U256;
use rand::Rng;

use crate::{prelude::*, Error};

/// Fresh 256-bit seed for the first `getApproxHint` call of a search.
pub(crate) fn random_seed() -> U256 {
    U256::from_limbs(rand::thread_rng().gen::<[u64; 4]>())
}

/// Split `total_trials` into per-call batch sizes of at most `max_per_call`.
pub fn trial_batches(total_trials: u64, max_per_call: u64) -> Vec<u64> {
    let max_per_call = max_per_call.max(1);
    let mut remaining = total_trials;
    let mut batches = Vec::with_capacity(total_trials.div_ceil(max_per_call) as usize);

    while remaining > 0 {
        let batch = remaining.min(max_per_call);
        batches.push(batch);
        remaining -= batch;
    }

    batches
}

/// Parse a JSON-RPC quantity (`0x`-prefixed hex) into a `u64`.
pub(crate) fn parse_quantity(value: &str) -> Result<u64> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| Error::InvalidResponse(format!("quantity without 0x prefix: {value}")))?;
    u64::from_str_radix(digits, 16)
        .map_err(|e| Error::InvalidResponse(format!("invalid quantity {value}: {e}")))
}

pub(crate) fn format_quantity(value: u64) -> String {
    format!("{value:#x}")
}

/// Narrow an ABI `uint256` that is known to be small (counts, timestamps).
pub(crate) fn u256_to_u64(value: U256) -> Result<u64> {
    if value > U256::from(u64::MAX) {
        return Err(Error::InvalidResponse(format!("{value} does not fit into u64")));
    }
    Ok(value.as_limbs()[0])
}

//! End-to-end flows through a store-backed client against the simulated chain.

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use alloy::{primitives::Address, sol_types::SolCall};
    use tokio::{sync::broadcast, time::timeout};

    use crate::{
        client::ZeroClient,
        contracts::{AddressBook, IBorrowerOperations, ILoCManager},
        hints::HintSearchConfig,
        remote::HintHelpers,
        simulation::{AccountState, ManualBlockSource, SimulatedChain},
        store::StoreChange,
        types::{Decimal, Position, PositionCreation, PositionStatus},
    };

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn owner(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn addresses() -> AddressBook {
        AddressBook {
            borrower_operations: Address::repeat_byte(0xb0),
            loc_manager: Address::repeat_byte(0xa0),
            ..Default::default()
        }
    }

    /// Nominal ratios 0.98, 1.078, 1.316 and 2.475 at price 200.
    fn four_positions(user: Address) -> SimulatedChain {
        let chain = SimulatedChain::new(1_700_000_000).connect_as(Some(user), None);
        chain.open_position(owner(1), Position::new(d("10"), d("1020")));
        chain.open_position(owner(2), Position::new(d("11"), d("1020")));
        chain.open_position(owner(3), Position::new(d("20"), d("1520")));
        chain.open_position(owner(4), Position::new(d("50"), d("2020")));
        chain
    }

    fn store_client(chain: &SimulatedChain, blocks: &ManualBlockSource) -> ZeroClient {
        ZeroClient::from_parts(
            Arc::new(chain.clone()),
            Arc::new(chain.clone()),
            Some(Arc::new(blocks.clone())),
            addresses(),
            HintSearchConfig::default(),
        )
    }

    async fn change_at(changes: &mut broadcast::Receiver<StoreChange>, block: u64) -> StoreChange {
        loop {
            let change = timeout(Duration::from_secs(5), changes.recv())
                .await
                .expect("no store change within 5s")
                .expect("change channel closed");
            if change.state.block_tag() == Some(block) {
                return change;
            }
        }
    }

    #[tokio::test]
    async fn test_redemption_through_store_backed_client() {
        let redeemer = owner(9);
        let chain = four_positions(redeemer);
        chain.set_account(
            redeemer,
            AccountState {
                zusd: d("3000"),
                ..Default::default()
            },
        );
        let blocks = ManualBlockSource::new();
        let client = store_client(&chain, &blocks);
        let store = client.store().unwrap().clone();

        let mut changes = store.on_change();
        let handle = store.start().await.unwrap();
        let first = chain.mine_block();
        blocks.announce(first);
        let loaded = change_at(&mut changes, first).await;
        assert_eq!(loaded.state.base.zusd_balance, d("3000"));
        assert_eq!(loaded.state.derived.redemption_rate, d("0.005"));

        // 1000 + 1000 net debt of the two riskiest positions plus one unit.
        let redemption = client.client().prepare_redemption(d("2001"), None).await.unwrap();
        assert!(!redemption.is_truncated);
        assert_eq!(redemption.truncated_amount, d("2001"));

        let call = client.client().populator().redemption(&redemption);
        assert_eq!(call.to, addresses().loc_manager);
        let decoded = ILoCManager::redeemCollateralCall::abi_decode(&call.data).unwrap();
        chain
            .redeem_collateral(
                redeemer,
                Decimal::from_raw(decoded._ZUSDAmount),
                decoded._maxIterations.to::<u64>(),
                Decimal::from_raw(decoded._maxFeePercentage),
            )
            .unwrap();

        let second = chain.mine_block();
        blocks.announce(second);
        let change = change_at(&mut changes, second).await;
        let state = &change.state;

        assert_eq!(state.base.number_of_positions, 2);
        assert_eq!(state.base.zusd_balance, d("999"));
        assert!(state.base.account_balance > Decimal::ZERO);
        assert!(change.changed.contains(&"number_of_positions"));
        assert_eq!(
            state.derived.redemption_rate,
            d("0.005") + (d("2001") / d("5580")) / d("2")
        );
        assert_eq!(
            chain.stored_position(&owner(3)).map(|(_, position)| position.net_debt()),
            Some(Some(d("1499")))
        );

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_open_position_through_store_backed_client() {
        let borrower = owner(5);
        let chain = four_positions(borrower);
        let blocks = ManualBlockSource::new();
        let client = store_client(&chain, &blocks);
        let store = client.store().unwrap().clone();

        let mut changes = store.on_change();
        let handle = store.start().await.unwrap();
        store.wait_loaded().await.unwrap();

        let params = PositionCreation::new(d("30"), d("2000")).unwrap();
        let change = client.client().populator().open_position(params, None).await.unwrap();
        assert_eq!(change.new_position, Position::new(d("30"), d("2030")));

        let decoded = IBorrowerOperations::openLoCCall::abi_decode(&change.call.data).unwrap();
        assert_eq!((decoded._upperHint, decoded._lowerHint), (owner(4), owner(3)));
        // The hints are already exact, so the list agrees with them.
        let exact = chain
            .find_insert_position(
                change.new_position.nominal_collateral_ratio(),
                decoded._upperHint,
                decoded._lowerHint,
            )
            .await
            .unwrap();
        assert_eq!(exact, (owner(4), owner(3)));

        chain.open_position(borrower, change.new_position);
        let block = chain.mine_block();
        blocks.announce(block);
        let update = change_at(&mut changes, block).await;

        assert_eq!(update.state.position().status, PositionStatus::Open);
        assert_eq!(update.state.position().position, change.new_position);
        assert_eq!(update.state.base.number_of_positions, 5);

        handle.stop().await;
    }
}

use std::{sync::Arc, time::Duration};

use witness::{
    chain::{ChainType, TransactionStatus},
    error::BroadcastError,
    sender::{GasCeilings, TerminalEvent},
    test_util::MockChainProvider,
};

use crate::{Network, item};

fn destination() -> Arc<MockChainProvider> {
    Arc::new(MockChainProvider::new(2, ChainType::Evm))
}

#[witness_macros::test(start_paused)]
async fn accepted_attestations_advance_the_ledger() {
    let chain = destination();
    let network = Network::new(GasCeilings::default());

    network
        .handle
        .send_transaction(item(&chain, 1, 40, 0), Duration::ZERO)
        .await
        .unwrap();
    network
        .handle
        .send_transaction(item(&chain, 2, 40, 1), Duration::ZERO)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(25)).await;
    let mut broadcasts = chain.broadcasts();
    broadcasts.sort();
    assert_eq!(broadcasts, vec!["signed:attest-1", "signed:attest-2"]);
    assert_eq!(network.state().attestation(2, 40, 1), Some(true));
    assert_eq!(network.state().attestation(2, 40, 2), Some(true));
    assert_eq!(network.state().last_attested_block(2), Some(40));
}

#[witness_macros::test(start_paused)]
async fn gas_factor_is_capped_then_replaced_by_a_noop() {
    let chain = destination();
    chain.set_nonce(5);
    for _ in 0..3 {
        chain.script_broadcast(Err(BroadcastError::NoResponse("timeout".to_owned())));
    }
    let network = Network::new(GasCeilings::new([(2, 3)]));

    network
        .handle
        .send_transaction(item(&chain, 1, 40, 5), Duration::ZERO)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(
        chain.broadcasts(),
        vec![
            "signed:attest-1",
            "signed:attest-1",
            "signed:attest-1",
            "signed:noop:5:2",
        ]
    );
    assert_eq!(network.state().attestation(2, 40, 1), Some(true));
}

#[witness_macros::test(start_paused)]
async fn consumed_nonces_are_not_broadcast() {
    let chain = destination();
    chain.set_nonce(9);
    let network = Network::new(GasCeilings::default());

    network
        .handle
        .send_transaction(item(&chain, 1, 40, 3), Duration::ZERO)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert!(chain.broadcasts().is_empty());
    assert_eq!(network.state().attestation(2, 40, 1), Some(false));
}

#[witness_macros::test(start_paused)]
async fn pending_transactions_are_repriced() {
    let chain = destination();
    chain.script_status("hash:signed:attest-1", TransactionStatus::Pending);
    let network = Network::new(GasCeilings::default());

    network
        .handle
        .send_transaction(item(&chain, 1, 40, 0), Duration::ZERO)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(
        chain.broadcasts(),
        vec!["signed:attest-1", "signed:attest-1@2"]
    );
    assert_eq!(network.state().attestation(2, 40, 1), Some(true));
}

#[witness_macros::test(start_paused)]
async fn failed_transactions_are_published() {
    let chain = destination();
    chain.script_status("hash:signed:attest-1", TransactionStatus::Failed);
    let network = Network::new(GasCeilings::default());
    let mut events = network.handle.subscribe();

    network
        .handle
        .send_transaction(item(&chain, 1, 40, 0), Duration::ZERO)
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        TerminalEvent::Failed {
            chain_id: 2,
            block: 40,
            id: 1,
            nonce: 0,
            hash: "hash:signed:attest-1".to_owned(),
        }
    );
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(chain.broadcasts().len(), 1);
    assert_eq!(network.state().attestation(2, 40, 1), Some(false));
}

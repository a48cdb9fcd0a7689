use std::time::Duration;

use tokio::task::JoinSet;
use witness::{
    cfg::Config,
    chain::{AccountCreate, ChainProvider, Chains, Claim, Commit},
    metrics::Metrics,
    node::WitnessNode,
    test_util::{DOOR_EVM, DOOR_XRPL, bridged_pair},
};

const TARGET_XRPL: &str = "rrrrrrrrrrrrrrrrrrrrLDor7oe";
const TARGET_EVM: &str = "0x00000000000000000000000000000000000000aa";

#[witness_macros::test(start_paused)]
async fn events_on_the_main_chain_are_attested_on_the_side_chain() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.server.state_file = dir.path().join("state.lock");

    let (main, side, bridge_id) = bridged_pair(1, 2);
    main.set_height(1300);
    main.add_commit(Commit {
        block: 1200,
        claim_id: 7,
        sender: DOOR_XRPL.to_owned(),
        amount: "1500000".to_owned(),
        destination: Some(TARGET_XRPL.to_owned()),
        bridge_id: bridge_id.clone(),
    });
    main.add_account_create(AccountCreate {
        block: 1250,
        sender: DOOR_XRPL.to_owned(),
        amount: "20000000".to_owned(),
        destination: TARGET_XRPL.to_owned(),
        signature_reward: "100".to_owned(),
        bridge_id,
    });
    side.add_claim(Claim {
        claim_id: 7,
        source: DOOR_EVM.to_owned(),
    });
    let create = format!("create:{TARGET_EVM}:20000000000000000000:100000000000000");
    side.set_transaction_create_count(&create, 150);
    side.set_create_account_count(10);

    let node = WitnessNode::new(
        config,
        Chains::new(main.clone(), side.clone()),
        None,
        Metrics::default(),
    )
    .await
    .unwrap();
    let state = node.state().clone();
    let mut tasks = JoinSet::new();
    node.start(&mut tasks);

    // The commit goes straight through; the account create waits for the chain to catch up.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(
        side.broadcasts(),
        vec![format!("signed:claim:7:1500000000000000000:{TARGET_EVM}")]
    );
    assert_eq!(main.current_block_number(), 1301);
    assert_eq!(state.last_attested_block(2), Some(1200));

    side.set_create_account_count(50);
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(side.broadcasts().len(), 2);
    assert_eq!(side.broadcasts()[1], format!("signed:{create}"));
    assert_eq!(state.last_attested_block(2), Some(1250));
    assert!(main.broadcasts().is_empty());
}

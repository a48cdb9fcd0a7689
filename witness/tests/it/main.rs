mod flow;
mod sender;

use std::sync::Arc;

use tokio::task::JoinSet;
use witness::{
    chain::ChainProvider,
    metrics::Metrics,
    sender::{BroadcastItem, GasCeilings, Sender, SenderHandle, TransactionData},
    state::AttestationState,
    test_util::MockChainProvider,
};

/// A running sender delivering to mock chains, with an in-memory ledger.
struct Network {
    handle: SenderHandle,
    _tasks: JoinSet<anyhow::Result<()>>,
}

impl Network {
    fn new(ceilings: GasCeilings) -> Network {
        let state = Arc::new(AttestationState::new("unused"));
        let mut tasks = JoinSet::new();
        let handle = Sender::new(state, ceilings, Metrics::default()).spawn(&mut tasks);
        Network {
            handle,
            _tasks: tasks,
        }
    }

    fn state(&self) -> &AttestationState {
        self.handle.state()
    }
}

fn item(provider: &Arc<MockChainProvider>, id: u64, block: u64, nonce: u64) -> BroadcastItem {
    let provider: Arc<dyn ChainProvider> = provider.clone();
    BroadcastItem::new(
        provider,
        TransactionData {
            id,
            transaction: format!("attest-{id}"),
            block,
        },
        nonce,
        1,
    )
}

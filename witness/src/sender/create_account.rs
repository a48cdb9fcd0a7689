//! Account creates must execute in the order of their creation count, so their attestations are released to the
//! sender only while they are close enough to the count the chain has already reached.

use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{BroadcastItem, QUEUE_CAPACITY, SenderHandle};

/// How far past the executed create count an attestation may run ahead.
pub const CREATE_ACCOUNT_WINDOW: u64 = 100;

pub const CREATE_ACCOUNT_POLL: Duration = Duration::from_secs(1);

/// Producer side of a sequencer. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CreateAccountQueue {
    sender: mpsc::Sender<BroadcastItem>,
    handle: SenderHandle,
}

impl CreateAccountQueue {
    pub async fn push(&self, item: BroadcastItem) -> Result<()> {
        self.handle
            .state()
            .add_attestation(item.chain_id(), item.data.block, item.data.id);
        self.sender
            .send(item)
            .await
            .map_err(|_| anyhow!("create account queue is closed"))
    }
}

/// Releases account-create attestations for one destination chain, one at a time.
pub struct CreateAccountSequencer {
    inbound: mpsc::Receiver<BroadcastItem>,
    handle: SenderHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerOutcome {
    Dispatched,
    /// The payload carried no readable create count.
    Dropped,
}

impl CreateAccountSequencer {
    pub fn new(handle: SenderHandle) -> (CreateAccountQueue, CreateAccountSequencer) {
        let (sender, inbound) = mpsc::channel(QUEUE_CAPACITY);
        (
            CreateAccountQueue {
                sender,
                handle: handle.clone(),
            },
            CreateAccountSequencer { inbound, handle },
        )
    }

    pub async fn run(mut self) -> Result<()> {
        while let Some(item) = self.inbound.recv().await {
            self.process(item).await?;
        }
        Ok(())
    }

    /// Waits until `item` is inside the window, then hands it to the sender.
    pub async fn process(&self, item: BroadcastItem) -> Result<SequencerOutcome> {
        let chain_id = item.chain_id();
        let create_count = match item
            .provider
            .get_transaction_create_count(&item.data.transaction)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(chain_id, nonce = item.nonce, "dropping malformed account create: {e:?}");
                return Ok(SequencerOutcome::Dropped);
            }
        };

        loop {
            match item.provider.get_current_create_account_count().await {
                Ok(current) if create_count <= current + CREATE_ACCOUNT_WINDOW => break,
                Ok(current) => {
                    trace!(chain_id, create_count, current, "account create outside window");
                }
                Err(e) => debug!(chain_id, "create count unavailable: {e:?}"),
            }
            tokio::time::sleep(CREATE_ACCOUNT_POLL).await;
        }

        self.handle.send_transaction(item, Duration::ZERO).await?;
        Ok(SequencerOutcome::Dispatched)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;
    use crate::{
        chain::ChainType, sender::TransactionData, state::AttestationState,
        test_util::MockChainProvider,
    };

    fn item(provider: &Arc<MockChainProvider>, payload: &str) -> BroadcastItem {
        BroadcastItem::new(
            provider.clone(),
            TransactionData {
                id: 3,
                transaction: payload.to_owned(),
                block: 70,
            },
            1,
            1,
        )
    }

    #[witness_macros::test(start_paused)]
    async fn creates_beyond_the_window_wait() {
        let state = Arc::new(AttestationState::new("unused"));
        let (handle, mut admitted) = SenderHandle::detached(state);
        let (_queue, sequencer) = CreateAccountSequencer::new(handle);
        let provider = Arc::new(MockChainProvider::new(2, ChainType::Xrp));
        provider.set_transaction_create_count("create-150", 150);
        provider.set_create_account_count(49);

        let start = Instant::now();
        let pending = item(&provider, "create-150");
        let waiting = tokio::spawn(async move { sequencer.process(pending).await });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(admitted.try_recv().is_err());

        provider.set_create_account_count(50);
        assert_eq!(waiting.await.unwrap().unwrap(), SequencerOutcome::Dispatched);
        assert_eq!(admitted.recv().await.unwrap().data.transaction, "create-150");
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[witness_macros::test(start_paused)]
    async fn creates_inside_the_window_pass_through() {
        let state = Arc::new(AttestationState::new("unused"));
        let (handle, mut admitted) = SenderHandle::detached(state);
        let (_queue, sequencer) = CreateAccountSequencer::new(handle);
        let provider = Arc::new(MockChainProvider::new(2, ChainType::Xrp));
        provider.set_transaction_create_count("create-149", 149);
        provider.set_create_account_count(49);

        let start = Instant::now();
        let outcome = sequencer.process(item(&provider, "create-149")).await.unwrap();
        assert_eq!(outcome, SequencerOutcome::Dispatched);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(admitted.recv().await.is_some());
    }

    #[witness_macros::test(start_paused)]
    async fn unreadable_create_count_is_dropped() {
        let state = Arc::new(AttestationState::new("unused"));
        let (handle, mut admitted) = SenderHandle::detached(state.clone());
        let (queue, sequencer) = CreateAccountSequencer::new(handle);
        let provider = Arc::new(MockChainProvider::new(2, ChainType::Xrp));
        provider.set_transaction_create_count("create-1", 1);
        tokio::spawn(sequencer.run());

        queue.push(item(&provider, "garbage")).await.unwrap();
        queue.push(item(&provider, "create-1")).await.unwrap();

        assert_eq!(admitted.recv().await.unwrap().data.transaction, "create-1");
        assert_eq!(state.attestation(2, 70, 3), Some(false));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(admitted.try_recv().is_err());
    }
}

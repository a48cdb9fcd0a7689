//! Delivery of attestation transactions.
//!
//! Items move through four stages, each a single task owning the items it holds:
//!
//! 1. admission: registers the attestation in the ledger and caps the gas factor, swapping in a no-op once the
//!    ceiling is passed;
//! 2. [priority]: reorders by nonce so the lowest buffered nonce is always broadcast next;
//! 3. [broadcast]: signs and submits, classifying failures into resends;
//! 4. [status]: polls the destination chain until the transaction is accepted or has failed.
//!
//! Every backoff goes through a [RetryQueue]. Account-create attestations additionally pass through a
//! [create_account] sequencer before admission.

pub mod broadcast;
pub mod create_account;
pub mod priority;
pub mod status;

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use tokio::{
    sync::{broadcast as events, mpsc},
    task::JoinSet,
};
use tracing::{debug, warn};

use crate::{
    chain::{ChainId, ChainProvider, Payload},
    metrics::Metrics,
    retry::RetryQueue,
    state::AttestationState,
};

/// Capacity of every sender mailbox and retry queue.
pub const QUEUE_CAPACITY: usize = 3000;

/// The highest gas factor any transaction is broadcast with.
pub const GAS_FACTOR_LIMIT: u32 = 10;

/// Backoff between broadcast attempts.
pub const RESEND_DELAY: Duration = Duration::from_millis(200);

/// Capacity of the terminal event channel. Slow subscribers miss the oldest events.
const TERMINAL_EVENT_CAPACITY: usize = 256;

/// An attestation transaction and the event it attests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionData {
    /// Correlation id, unique per attestation. Never zero.
    pub id: u64,
    pub transaction: Payload,
    /// Block of the source-chain event.
    pub block: u64,
}

/// A transaction on its way to the destination chain.
#[derive(Debug, Clone)]
pub struct BroadcastItem {
    pub provider: Arc<dyn ChainProvider>,
    pub data: TransactionData,
    pub gas_factor: u32,
    pub nonce: u64,
    /// The payload must be replaced by a no-op at `gas_factor` before it is broadcast again.
    pub needs_noop: bool,
}

impl BroadcastItem {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        data: TransactionData,
        nonce: u64,
        gas_factor: u32,
    ) -> Self {
        BroadcastItem {
            provider,
            data,
            gas_factor,
            nonce,
            needs_noop: false,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.provider.chain_id()
    }
}

/// An operator-relevant outcome that ends an attestation without success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// The destination chain executed the transaction and rejected it. Its nonce is consumed and the attestation
    /// stays unaccepted in the ledger.
    Failed {
        chain_id: ChainId,
        block: u64,
        id: u64,
        nonce: u64,
        hash: String,
    },
}

/// The per-chain gas factor ceiling, bounded by [GAS_FACTOR_LIMIT].
#[derive(Debug, Clone, Default)]
pub struct GasCeilings(HashMap<ChainId, u32>);

impl GasCeilings {
    pub fn new(ceilings: impl IntoIterator<Item = (ChainId, u32)>) -> Self {
        GasCeilings(ceilings.into_iter().collect())
    }

    /// Never less than 2, so a no-op can always be priced one step below the ceiling.
    pub fn get(&self, chain_id: ChainId) -> u32 {
        self.0
            .get(&chain_id)
            .copied()
            .unwrap_or(GAS_FACTOR_LIMIT)
            .clamp(2, GAS_FACTOR_LIMIT)
    }
}

/// Entry point into the sender. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SenderHandle {
    admission: mpsc::Sender<BroadcastItem>,
    resend: RetryQueue<BroadcastItem>,
    state: Arc<AttestationState>,
    terminal: events::Sender<TerminalEvent>,
}

impl SenderHandle {
    /// Queue `item` for delivery after `delay`.
    pub async fn send_transaction(&self, item: BroadcastItem, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            self.admission
                .send(item)
                .await
                .map_err(|_| anyhow!("sender admission queue is closed"))
        } else {
            self.resend.resend(item, delay).await
        }
    }

    pub fn state(&self) -> &Arc<AttestationState> {
        &self.state
    }

    /// Receive [TerminalEvent]s published after this call.
    pub fn subscribe(&self) -> events::Receiver<TerminalEvent> {
        self.terminal.subscribe()
    }

    /// A handle whose admitted items are delivered to the returned receiver instead of the sender stages.
    #[cfg(any(test, feature = "test_util"))]
    pub fn detached(state: Arc<AttestationState>) -> (SenderHandle, mpsc::Receiver<BroadcastItem>) {
        let (admission, admitted) = mpsc::channel(QUEUE_CAPACITY);
        let (resend, worker) = RetryQueue::new("detached", admission.clone(), QUEUE_CAPACITY);
        tokio::spawn(worker.run());
        let (terminal, _) = events::channel(TERMINAL_EVENT_CAPACITY);
        (
            SenderHandle {
                admission,
                resend,
                state,
                terminal,
            },
            admitted,
        )
    }
}

/// Registers each item in the ledger and enforces the gas ceiling, then hands it to the reordering stage.
pub struct Admission {
    inbound: mpsc::Receiver<BroadcastItem>,
    reorder: mpsc::Sender<BroadcastItem>,
    resend: RetryQueue<BroadcastItem>,
    state: Arc<AttestationState>,
    ceilings: GasCeilings,
}

impl Admission {
    pub async fn run(mut self) -> Result<()> {
        while let Some(item) = self.inbound.recv().await {
            if let Some(item) = self.admit(item).await? {
                self.reorder
                    .send(item)
                    .await
                    .map_err(|_| anyhow!("reorder queue is closed"))?;
            }
        }
        Ok(())
    }

    /// Returns the item ready for broadcast, or `None` if it was deferred because no no-op could be built.
    pub async fn admit(&self, mut item: BroadcastItem) -> Result<Option<BroadcastItem>> {
        let chain_id = item.chain_id();
        self.state
            .add_attestation(chain_id, item.data.block, item.data.id);

        let ceiling = self.ceilings.get(chain_id);
        if item.gas_factor > ceiling {
            debug!(
                chain_id,
                nonce = item.nonce,
                gas_factor = item.gas_factor,
                ceiling,
                "gas factor ceiling exceeded, replacing with no-op"
            );
            item.gas_factor = ceiling - 1;
            item.needs_noop = true;
        }

        if item.needs_noop {
            match item
                .provider
                .get_noop_transaction(item.nonce, item.gas_factor)
                .await
            {
                Ok(noop) if !noop.is_empty() => {
                    item.data.transaction = noop;
                    item.needs_noop = false;
                }
                result => {
                    warn!(
                        chain_id,
                        nonce = item.nonce,
                        "failed to build no-op transaction, retrying: {:?}",
                        result.err()
                    );
                    self.resend.resend(item, RESEND_DELAY).await?;
                    return Ok(None);
                }
            }
        }

        Ok(Some(item))
    }
}

/// The sender stages, ready to be spawned.
pub struct Sender {
    pub handle: SenderHandle,
    tasks: Vec<futures::future::BoxFuture<'static, Result<()>>>,
}

impl Sender {
    pub fn new(state: Arc<AttestationState>, ceilings: GasCeilings, metrics: Metrics) -> Sender {
        let (admission_tx, admission_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (reorder_tx, reorder_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (status_tx, status_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (terminal, _) = events::channel(TERMINAL_EVENT_CAPACITY);

        let (resend, resend_worker) =
            RetryQueue::new("broadcast", admission_tx.clone(), QUEUE_CAPACITY);
        let (status_retry, status_worker) =
            RetryQueue::new("status", status_tx, QUEUE_CAPACITY);

        let admission = Admission {
            inbound: admission_rx,
            reorder: reorder_tx,
            resend: resend.clone(),
            state: state.clone(),
            ceilings,
        };
        let broadcast = broadcast::BroadcastStage::new(
            broadcast_rx,
            resend.clone(),
            status_retry.clone(),
            metrics.clone(),
        );
        let status = status::StatusStage::new(
            status_rx,
            resend.clone(),
            status_retry,
            state.clone(),
            terminal.clone(),
            metrics,
        );

        let tasks: Vec<futures::future::BoxFuture<'static, Result<()>>> = vec![
            Box::pin(admission.run()),
            Box::pin(priority::run_reorder(reorder_rx, broadcast_tx)),
            Box::pin(broadcast.run()),
            Box::pin(status.run()),
            Box::pin(resend_worker.run()),
            Box::pin(status_worker.run()),
        ];

        Sender {
            handle: SenderHandle {
                admission: admission_tx,
                resend,
                state,
                terminal,
            },
            tasks,
        }
    }

    /// Spawn every stage into `tasks` and return the handle.
    pub fn spawn(self, tasks: &mut JoinSet<Result<()>>) -> SenderHandle {
        for task in self.tasks {
            tasks.spawn(task);
        }
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{chain::ChainType, test_util::MockChainProvider};

    fn admission(
        state: Arc<AttestationState>,
    ) -> (Admission, mpsc::Receiver<BroadcastItem>, mpsc::Receiver<BroadcastItem>) {
        let (_admission_tx, admission_rx) = mpsc::channel(10);
        let (reorder_tx, reorder_rx) = mpsc::channel(10);
        let (resend_tx, resend_rx) = mpsc::channel(10);
        let (resend, worker) = RetryQueue::new("test", resend_tx, 10);
        tokio::spawn(worker.run());
        (
            Admission {
                inbound: admission_rx,
                reorder: reorder_tx,
                resend,
                state,
                ceilings: GasCeilings::default(),
            },
            reorder_rx,
            resend_rx,
        )
    }

    fn item(provider: &Arc<MockChainProvider>, nonce: u64, gas_factor: u32) -> BroadcastItem {
        BroadcastItem::new(
            provider.clone(),
            TransactionData {
                id: 1,
                transaction: "attestation".to_owned(),
                block: 100,
            },
            nonce,
            gas_factor,
        )
    }

    #[witness_macros::test(start_paused)]
    async fn admission_tracks_the_attestation() {
        let state = Arc::new(AttestationState::new("unused"));
        let (admission, _, _) = admission(state.clone());
        let provider = Arc::new(MockChainProvider::new(7, ChainType::Evm));

        let admitted = admission.admit(item(&provider, 3, 1)).await.unwrap().unwrap();
        assert_eq!(admitted.data.transaction, "attestation");
        assert_eq!(state.attestation(7, 100, 1), Some(false));
    }

    #[witness_macros::test(start_paused)]
    async fn admission_replaces_payload_past_the_ceiling() {
        let state = Arc::new(AttestationState::new("unused"));
        let (admission, _, _) = admission(state);
        let provider = Arc::new(MockChainProvider::new(7, ChainType::Evm));

        let at_ceiling = admission.admit(item(&provider, 3, 10)).await.unwrap().unwrap();
        assert_eq!(at_ceiling.gas_factor, 10);
        assert_eq!(at_ceiling.data.transaction, "attestation");

        let past = admission.admit(item(&provider, 3, 11)).await.unwrap().unwrap();
        assert_eq!(past.gas_factor, 9);
        assert_eq!(past.data.transaction, "noop:3:9");
        assert!(!past.needs_noop);
    }

    #[witness_macros::test(start_paused)]
    async fn failed_noop_is_retried_instead_of_sending_the_original() {
        let state = Arc::new(AttestationState::new("unused"));
        let (admission, _, mut resent) = admission(state);
        let provider = Arc::new(MockChainProvider::new(7, ChainType::Evm));
        provider.fail("get_noop_transaction");

        assert!(admission.admit(item(&provider, 3, 11)).await.unwrap().is_none());
        let deferred = resent.recv().await.unwrap();
        assert_eq!(deferred.gas_factor, 9);
        assert!(deferred.needs_noop);
        assert_eq!(deferred.data.transaction, "attestation");
    }

    #[test]
    fn configured_ceilings_are_bounded() {
        let ceilings = GasCeilings::new([(1, 5), (2, 50), (3, 0)]);
        assert_eq!(ceilings.get(1), 5);
        assert_eq!(ceilings.get(2), GAS_FACTOR_LIMIT);
        assert_eq!(ceilings.get(3), 2);
        assert_eq!(ceilings.get(4), GAS_FACTOR_LIMIT);
    }
}

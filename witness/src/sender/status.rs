use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    sync::{broadcast as events, mpsc},
    time::Instant,
};
use tracing::{debug, info, warn};

use super::{BroadcastItem, TerminalEvent};
use crate::{
    chain::TransactionStatus, metrics::Metrics, retry::RetryQueue, state::AttestationState,
};

/// Delay before asking again when the status call did not give a usable answer.
pub const STATUS_POLL_DELAY: Duration = Duration::from_secs(1);

/// A broadcast transaction awaiting confirmation.
#[derive(Debug, Clone)]
pub struct StatusItem {
    pub item: BroadcastItem,
    pub hash: String,
    /// After this instant a pending transaction is treated as stuck.
    pub expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Accepted,
    Failed,
    /// Sent back to the broadcast path.
    Rebroadcast,
    /// Polled again later.
    Repoll,
}

pub struct StatusStage {
    inbound: mpsc::Receiver<StatusItem>,
    resend: RetryQueue<BroadcastItem>,
    poll: RetryQueue<StatusItem>,
    state: Arc<AttestationState>,
    terminal: events::Sender<TerminalEvent>,
    metrics: Metrics,
}

impl StatusStage {
    pub fn new(
        inbound: mpsc::Receiver<StatusItem>,
        resend: RetryQueue<BroadcastItem>,
        poll: RetryQueue<StatusItem>,
        state: Arc<AttestationState>,
        terminal: events::Sender<TerminalEvent>,
        metrics: Metrics,
    ) -> Self {
        StatusStage {
            inbound,
            resend,
            poll,
            state,
            terminal,
            metrics,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        while let Some(item) = self.inbound.recv().await {
            self.process(item).await?;
        }
        Ok(())
    }

    pub async fn process(&self, status: StatusItem) -> Result<StatusOutcome> {
        let StatusItem {
            mut item,
            hash,
            expires_at,
        } = status;
        let chain_id = item.chain_id();
        let provider = item.provider.clone();

        match provider.get_transaction_status(&hash).await {
            TransactionStatus::Accepted => {
                info!(chain_id, block = item.data.block, %hash, "attestation accepted");
                self.state
                    .set_attested(chain_id, item.data.block, item.data.id);
                self.metrics.accepted(chain_id);
                Ok(StatusOutcome::Accepted)
            }
            TransactionStatus::Failed => {
                warn!(
                    chain_id,
                    block = item.data.block,
                    nonce = item.nonce,
                    %hash,
                    "transaction failed on chain, nonce consumed"
                );
                self.metrics.failed(chain_id);
                // No subscribers is fine.
                let _ = self.terminal.send(TerminalEvent::Failed {
                    chain_id,
                    block: item.data.block,
                    id: item.data.id,
                    nonce: item.nonce,
                    hash,
                });
                Ok(StatusOutcome::Failed)
            }
            TransactionStatus::Pending if Instant::now() >= expires_at => {
                debug!(chain_id, nonce = item.nonce, %hash, "pending transaction expired, replacing with no-op");
                item.gas_factor += 1;
                item.needs_noop = true;
                self.rebroadcast(item).await
            }
            status @ (TransactionStatus::Pending
            | TransactionStatus::NotFound
            | TransactionStatus::Unconfirmed) => {
                debug!(chain_id, nonce = item.nonce, %hash, ?status, "raising gas price");
                let gas_factor = item.gas_factor + 1;
                match provider
                    .set_transaction_gas_price(&item.data.transaction, gas_factor)
                    .await
                {
                    Ok(repriced) if !repriced.is_empty() => item.data.transaction = repriced,
                    result => warn!(
                        chain_id,
                        nonce = item.nonce,
                        "failed to reprice transaction, resending as is: {:?}",
                        result.err()
                    ),
                }
                item.gas_factor = gas_factor;
                self.rebroadcast(item).await
            }
            status => {
                debug!(chain_id, %hash, ?status, "status unknown, polling again");
                self.poll
                    .resend(
                        StatusItem {
                            item,
                            hash,
                            expires_at,
                        },
                        STATUS_POLL_DELAY,
                    )
                    .await?;
                Ok(StatusOutcome::Repoll)
            }
        }
    }

    async fn rebroadcast(&self, item: BroadcastItem) -> Result<StatusOutcome> {
        self.resend.resend(item, Duration::ZERO).await?;
        Ok(StatusOutcome::Rebroadcast)
    }
}

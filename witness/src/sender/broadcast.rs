use std::time::Duration;

use anyhow::Result;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

use super::{BroadcastItem, RESEND_DELAY, status::StatusItem};
use crate::{error::BroadcastError, metrics::Metrics, retry::RetryQueue};

/// How long after a successful broadcast the first status check happens.
pub const STATUS_CHECK_DELAY: Duration = Duration::from_secs(20);

/// How long after a successful broadcast a pending transaction is considered stuck.
pub const STATUS_EXPIRY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// Broadcast succeeded; a status check is scheduled.
    Submitted,
    /// The item was sent back for another attempt.
    Resent,
    /// The chain has already moved past this nonce.
    Stale,
    /// The node already had the transaction.
    Ignored,
}

pub struct BroadcastStage {
    inbound: mpsc::Receiver<BroadcastItem>,
    resend: RetryQueue<BroadcastItem>,
    status: RetryQueue<StatusItem>,
    metrics: Metrics,
}

impl BroadcastStage {
    pub fn new(
        inbound: mpsc::Receiver<BroadcastItem>,
        resend: RetryQueue<BroadcastItem>,
        status: RetryQueue<StatusItem>,
        metrics: Metrics,
    ) -> Self {
        BroadcastStage {
            inbound,
            resend,
            status,
            metrics,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        while let Some(item) = self.inbound.recv().await {
            self.process(item).await?;
        }
        Ok(())
    }

    pub async fn process(&self, mut item: BroadcastItem) -> Result<BroadcastOutcome> {
        let chain_id = item.chain_id();
        let provider = item.provider.clone();

        let current_nonce = match provider.get_nonce().await {
            Ok(nonce) => nonce,
            Err(e) => {
                debug!(chain_id, nonce = item.nonce, "nonce unavailable, resending: {e:?}");
                return self.resend(item).await;
            }
        };
        if current_nonce > item.nonce {
            debug!(
                chain_id,
                nonce = item.nonce,
                current_nonce,
                "dropping transaction with consumed nonce"
            );
            self.metrics.broadcast(chain_id, "stale");
            return Ok(BroadcastOutcome::Stale);
        }

        let signed = match provider.sign_transaction(&item.data.transaction).await {
            Ok(signed) if !signed.is_empty() => signed,
            result => {
                warn!(
                    chain_id,
                    nonce = item.nonce,
                    "failed to sign transaction, resending: {:?}",
                    result.err()
                );
                return self.resend(item).await;
            }
        };

        match provider.broadcast_transaction(&signed).await {
            Ok(hash) => {
                info!(
                    chain_id,
                    nonce = item.nonce,
                    gas_factor = item.gas_factor,
                    %hash,
                    "broadcast transaction"
                );
                self.metrics.broadcast(chain_id, "submitted");
                let status = StatusItem {
                    item,
                    hash,
                    expires_at: Instant::now() + STATUS_EXPIRY,
                };
                self.status.resend(status, STATUS_CHECK_DELAY).await?;
                Ok(BroadcastOutcome::Submitted)
            }
            Err(e) => {
                self.metrics.broadcast(chain_id, e.kind());
                match e {
                    BroadcastError::NoResponse(_) => {
                        warn!(chain_id, nonce = item.nonce, gas_factor = item.gas_factor, "{e}");
                        item.gas_factor += 1;
                        self.resend(item).await
                    }
                    BroadcastError::InvalidNonce(_) => {
                        debug!(chain_id, nonce = item.nonce, "{e}");
                        self.resend(item).await
                    }
                    BroadcastError::Ignorable(_) => {
                        debug!(chain_id, nonce = item.nonce, "{e}");
                        Ok(BroadcastOutcome::Ignored)
                    }
                    BroadcastError::Unknown(_) => {
                        warn!(
                            chain_id,
                            nonce = item.nonce,
                            "unexpected broadcast error, replacing with no-op: {e}"
                        );
                        item.needs_noop = true;
                        self.resend(item).await
                    }
                }
            }
        }
    }

    async fn resend(&self, item: BroadcastItem) -> Result<BroadcastOutcome> {
        self.resend.resend(item, RESEND_DELAY).await?;
        Ok(BroadcastOutcome::Resent)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        chain::ChainType,
        sender::TransactionData,
        test_util::MockChainProvider,
    };

    struct Harness {
        stage: BroadcastStage,
        resent: mpsc::Receiver<BroadcastItem>,
        statuses: mpsc::Receiver<StatusItem>,
        provider: Arc<MockChainProvider>,
    }

    fn harness() -> Harness {
        let (_inbound_tx, inbound) = mpsc::channel(10);
        let (resend_tx, resent) = mpsc::channel(10);
        let (status_tx, statuses) = mpsc::channel(10);
        let (resend, resend_worker) = RetryQueue::new("broadcast", resend_tx, 10);
        let (status, status_worker) = RetryQueue::new("status", status_tx, 10);
        tokio::spawn(resend_worker.run());
        tokio::spawn(status_worker.run());
        Harness {
            stage: BroadcastStage::new(inbound, resend, status, Metrics::default()),
            resent,
            statuses,
            provider: Arc::new(MockChainProvider::new(5, ChainType::Evm)),
        }
    }

    fn item(provider: &Arc<MockChainProvider>, nonce: u64, payload: &str) -> BroadcastItem {
        BroadcastItem::new(
            provider.clone(),
            TransactionData {
                id: 11,
                transaction: payload.to_owned(),
                block: 100,
            },
            nonce,
            1,
        )
    }

    #[witness_macros::test(start_paused)]
    async fn success_schedules_a_status_check() {
        let mut h = harness();
        h.provider.set_nonce(3);
        let start = Instant::now();

        let outcome = h.stage.process(item(&h.provider, 3, "tx")).await.unwrap();
        assert_eq!(outcome, BroadcastOutcome::Submitted);
        assert_eq!(h.provider.broadcasts(), vec!["signed:tx".to_owned()]);

        let status = h.statuses.recv().await.unwrap();
        assert_eq!(start.elapsed(), STATUS_CHECK_DELAY);
        assert_eq!(status.hash, "hash:signed:tx");
        assert_eq!(status.expires_at, start + STATUS_EXPIRY);
    }

    #[witness_macros::test(start_paused)]
    async fn consumed_nonce_is_dropped() {
        let mut h = harness();
        h.provider.set_nonce(10);

        let outcome = h.stage.process(item(&h.provider, 5, "tx")).await.unwrap();
        assert_eq!(outcome, BroadcastOutcome::Stale);
        assert!(h.provider.broadcasts().is_empty());

        tokio::time::sleep(STATUS_CHECK_DELAY * 2).await;
        assert!(h.resent.try_recv().is_err());
        assert!(h.statuses.try_recv().is_err());
    }

    #[witness_macros::test(start_paused)]
    async fn unavailable_nonce_is_resent() {
        let mut h = harness();
        h.provider.fail("get_nonce");
        let start = Instant::now();

        let outcome = h.stage.process(item(&h.provider, 5, "tx")).await.unwrap();
        assert_eq!(outcome, BroadcastOutcome::Resent);
        let resent = h.resent.recv().await.unwrap();
        assert_eq!(start.elapsed(), RESEND_DELAY);
        assert_eq!(resent.gas_factor, 1);
    }

    #[witness_macros::test(start_paused)]
    async fn signing_failure_is_resent_unchanged() {
        let mut h = harness();
        h.provider.fail("sign_transaction");

        h.stage.process(item(&h.provider, 0, "tx")).await.unwrap();
        let resent = h.resent.recv().await.unwrap();
        assert_eq!((resent.gas_factor, resent.data.transaction.as_str()), (1, "tx"));
    }

    #[witness_macros::test(start_paused)]
    async fn broadcast_failures_are_classified() {
        let mut h = harness();

        h.provider.script_broadcast(Err(BroadcastError::NoResponse("timeout".to_owned())));
        h.stage.process(item(&h.provider, 0, "tx")).await.unwrap();
        let resent = h.resent.recv().await.unwrap();
        assert_eq!((resent.gas_factor, resent.needs_noop), (2, false));

        h.provider.script_broadcast(Err(BroadcastError::InvalidNonce("future".to_owned())));
        h.stage.process(item(&h.provider, 0, "tx")).await.unwrap();
        let resent = h.resent.recv().await.unwrap();
        assert_eq!((resent.gas_factor, resent.needs_noop), (1, false));

        h.provider.script_broadcast(Err(BroadcastError::Unknown("boom".to_owned())));
        h.stage.process(item(&h.provider, 0, "tx")).await.unwrap();
        let resent = h.resent.recv().await.unwrap();
        assert_eq!((resent.gas_factor, resent.needs_noop), (1, true));

        h.provider.script_broadcast(Err(BroadcastError::Ignorable("known".to_owned())));
        let outcome = h.stage.process(item(&h.provider, 0, "tx")).await.unwrap();
        assert_eq!(outcome, BroadcastOutcome::Ignored);
        tokio::time::sleep(STATUS_CHECK_DELAY * 2).await;
        assert!(h.resent.try_recv().is_err());
        assert!(h.statuses.try_recv().is_err());
    }
}

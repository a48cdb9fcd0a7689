//! Turns chain events into attestation transactions on the other chain.
//!
//! One [AttestationPipeline] exists per destination chain. Each event is checked against the destination chain
//! (signer membership, bridge, claim or account state), converted into the destination's address encoding and asset
//! precision, built into a transaction by the destination provider and handed to the sender. Transient lookup and
//! construction failures put the event back on the pipeline's queue after [ATTEST_RETRY_DELAY].

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    address,
    amount::Decimal,
    bridge::BridgeId,
    chain::{
        AccountCreateAttestation, ChainEvent, ChainProvider, ChainSide, Chains, ClaimAttestation,
        PreparedTransaction, SignerMembership,
    },
    error::AmountError,
    metrics::Metrics,
    retry::{RetryQueue, RetryWorker},
    sender::{BroadcastItem, SenderHandle, TransactionData, create_account::CreateAccountQueue},
};

pub const ATTEST_QUEUE_CAPACITY: usize = 1000;

pub const ATTEST_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Dispatched,
    /// No attestation is owed. The reason is a short label used in logs and metrics.
    Dropped(&'static str),
    /// Queued again after [ATTEST_RETRY_DELAY].
    Retry,
}

/// Validates and builds attestations into one destination chain.
pub struct Attester {
    destination: ChainSide,
    chains: Chains,
    membership: Arc<SignerMembership>,
    sender: SenderHandle,
    create_accounts: CreateAccountQueue,
    retry: RetryQueue<ChainEvent>,
    metrics: Metrics,
}

impl Attester {
    pub async fn process(&self, event: ChainEvent) -> Result<Outcome> {
        let destination = self.chains.get(self.destination);
        let chain_id = destination.chain_id();

        let outcome = self.attest(&event).await?;
        match outcome {
            Outcome::Dispatched => {
                info!(
                    chain_id,
                    block = event.block(),
                    bridge_id = %event.bridge_id(),
                    kind = event.kind(),
                    "attestation dispatched"
                );
                self.metrics.dispatched(chain_id, event.kind());
            }
            Outcome::Dropped(reason) => {
                debug!(chain_id, block = event.block(), reason, "no attestation owed");
                self.metrics.dropped(chain_id, reason);
            }
            Outcome::Retry => {
                self.retry.resend(event, ATTEST_RETRY_DELAY).await?;
            }
        }
        Ok(outcome)
    }

    async fn attest(&self, event: &ChainEvent) -> Result<Outcome> {
        let destination = self.chains.get(self.destination);
        let source = self.chains.get(self.destination.other());
        let (from, to) = (source.chain_type(), destination.chain_type());

        if !self.membership.is_member(self.destination).await {
            return Ok(Outcome::Dropped("not_signer"));
        }
        let bridge_id = event.bridge_id();
        if !source.bridges().is_active(bridge_id) || !destination.bridges().is_active(bridge_id) {
            return Ok(Outcome::Dropped("inactive_bridge"));
        }

        let prepared = match event {
            ChainEvent::Commit(commit) => {
                let Some(target) = commit.destination.as_deref().filter(|d| !d.is_empty()) else {
                    return Ok(Outcome::Dropped("no_destination"));
                };
                let claim = match destination
                    .get_unattested_claim_by_id(commit.claim_id, bridge_id)
                    .await
                {
                    Ok(claim) => claim,
                    Err(e) => {
                        debug!(claim_id = commit.claim_id, "claim lookup failed: {e:?}");
                        return Ok(Outcome::Retry);
                    }
                };
                let Some(claim) = claim else {
                    return Ok(Outcome::Dropped("no_claim"));
                };
                if !address::same_account(&claim.source, to, &commit.sender, from) {
                    return Ok(Outcome::Dropped("sender_mismatch"));
                }
                let (Ok(sender), Ok(target)) = (
                    address::translate(&commit.sender, from, to),
                    address::translate(target, from, to),
                ) else {
                    return Ok(Outcome::Dropped("invalid_address"));
                };
                let amount = match convert(source.as_ref(), destination.as_ref(), &commit.amount, bridge_id) {
                    Ok(amount) => amount,
                    Err(e) => {
                        debug!(%bridge_id, amount = %commit.amount, "unconvertible amount: {e}");
                        return Ok(Outcome::Dropped("invalid_amount"));
                    }
                };
                destination
                    .get_attest_claim_transaction(&ClaimAttestation {
                        bridge_id: bridge_id.clone(),
                        claim_id: commit.claim_id,
                        sender,
                        amount,
                        destination: target,
                    })
                    .await
            }
            ChainEvent::AccountCreate(create) => {
                let (Ok(sender), Ok(target)) = (
                    address::translate(&create.sender, from, to),
                    address::translate(&create.destination, from, to),
                ) else {
                    return Ok(Outcome::Dropped("invalid_address"));
                };
                match destination.check_account_created(&target, bridge_id).await {
                    Ok(false) => {}
                    Ok(true) => return Ok(Outcome::Dropped("account_exists")),
                    Err(e) => {
                        debug!(account = %target, "account lookup failed: {e:?}");
                        return Ok(Outcome::Retry);
                    }
                }
                match destination
                    .check_witness_has_attested_create_account(&target, bridge_id)
                    .await
                {
                    Ok(false) => {}
                    Ok(true) => return Ok(Outcome::Dropped("already_attested")),
                    Err(e) => {
                        debug!(account = %target, "attestation lookup failed: {e:?}");
                        return Ok(Outcome::Retry);
                    }
                }
                let converted = convert(source.as_ref(), destination.as_ref(), &create.amount, bridge_id)
                    .and_then(|amount| {
                        let reward = convert(
                            source.as_ref(),
                            destination.as_ref(),
                            &create.signature_reward,
                            bridge_id,
                        )?;
                        Ok((amount, reward))
                    });
                let (amount, signature_reward) = match converted {
                    Ok(converted) => converted,
                    Err(e) => {
                        debug!(%bridge_id, "unconvertible account create amounts: {e}");
                        return Ok(Outcome::Dropped("invalid_amount"));
                    }
                };
                destination
                    .get_attest_account_create_transaction(&AccountCreateAttestation {
                        bridge_id: bridge_id.clone(),
                        sender,
                        amount,
                        destination: target,
                        signature_reward,
                    })
                    .await
            }
        };

        let PreparedTransaction { payload, nonce } = match prepared {
            Ok(prepared) if !prepared.payload.is_empty() => prepared,
            result => {
                warn!(
                    chain_id = destination.chain_id(),
                    block = event.block(),
                    "failed to build attestation transaction: {:?}",
                    result.err()
                );
                return Ok(Outcome::Retry);
            }
        };

        let item = BroadcastItem::new(
            destination.clone(),
            TransactionData {
                id: correlation_id(),
                transaction: payload,
                block: event.block(),
            },
            nonce,
            1,
        );
        match event {
            ChainEvent::Commit(_) => self.sender.send_transaction(item, Duration::ZERO).await?,
            ChainEvent::AccountCreate(_) => self.create_accounts.push(item).await?,
        }
        Ok(Outcome::Dispatched)
    }
}

/// Re-express an amount observed on `source` in the smallest unit of the asset on `destination`.
fn convert(
    source: &dyn ChainProvider,
    destination: &dyn ChainProvider,
    amount: &str,
    bridge_id: &BridgeId,
) -> Result<String, AmountError> {
    let decimal: Decimal = source.convert_to_decimal(amount, bridge_id)?;
    destination.convert_to_whole(&decimal, bridge_id)
}

fn correlation_id() -> u64 {
    rand::thread_rng().gen_range(1..=u64::MAX)
}

/// An [Attester] together with its queue and retry worker.
pub struct AttestationPipeline {
    inbound: mpsc::Receiver<ChainEvent>,
    attester: Attester,
    retry_worker: RetryWorker<ChainEvent>,
}

impl AttestationPipeline {
    /// Returns the pipeline's input queue and the pipeline. `create_accounts` must belong to the destination chain.
    pub fn new(
        destination: ChainSide,
        chains: Chains,
        membership: Arc<SignerMembership>,
        sender: SenderHandle,
        create_accounts: CreateAccountQueue,
        metrics: Metrics,
    ) -> (mpsc::Sender<ChainEvent>, AttestationPipeline) {
        let (events, inbound) = mpsc::channel(ATTEST_QUEUE_CAPACITY);
        let (retry, retry_worker) = RetryQueue::new("attestation", events.clone(), ATTEST_QUEUE_CAPACITY);
        (
            events,
            AttestationPipeline {
                inbound,
                attester: Attester {
                    destination,
                    chains,
                    membership,
                    sender,
                    create_accounts,
                    retry,
                    metrics,
                },
                retry_worker,
            },
        )
    }

    pub async fn run(self) -> Result<()> {
        let AttestationPipeline {
            mut inbound,
            attester,
            retry_worker,
        } = self;
        let attest = async move {
            while let Some(event) = inbound.recv().await {
                attester.process(event).await?;
            }
            Ok::<_, anyhow::Error>(())
        };
        tokio::try_join!(attest, retry_worker.run())?;
        Ok(())
    }
}

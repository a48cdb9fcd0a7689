//! Countersigning of dynamically requested bridges.
//!
//! A bridge request emitted on a locking chain is turned into a pair of create-bridge transactions (one per door) by
//! an external sequencer. Each witness fetches the pair, has both chain providers check and sign their half, and
//! returns the signatures to the sequencer.

use std::{fmt, sync::Arc, time::Duration};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    address,
    chain::{
        BridgeRequest, ChainProvider, ChainSide, ChainType, Chains, CreateBridgeParams,
        CreateBridgeSignature, SignerMembership,
    },
    listener::FIRST_TICK_DELAY,
};

/// A create-bridge transaction pair prepared by the sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBridgeEntry {
    pub locking_chain_type: ChainType,
    pub issuing_chain_type: ChainType,
    pub locking_chain_door_create_bridge_transaction: String,
    pub issuing_chain_door_create_bridge_transaction: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignCreateBridgeRequest {
    pub signed_locking_chain_door_create_bridge_transaction: CreateBridgeSignature,
    pub signed_issuing_chain_door_create_bridge_transaction: CreateBridgeSignature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignResponse {
    Accepted,
    /// This witness has already signed the request.
    AlreadySigned,
}

#[async_trait]
pub trait Sequencer: Send + Sync + fmt::Debug {
    async fn get_create_bridge(&self, id: &str) -> Result<CreateBridgeEntry>;

    async fn sign_create_bridge(
        &self,
        id: &str,
        request: &SignCreateBridgeRequest,
    ) -> Result<SignResponse>;
}

/// The sequencer's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpSequencer {
    client: reqwest::Client,
    url: String,
}

impl HttpSequencer {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        Ok(HttpSequencer {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.trim_end_matches('/').to_owned(),
        })
    }

    fn endpoint(&self, id: &str) -> String {
        format!("{}/create-bridge/{id}", self.url)
    }
}

#[async_trait]
impl Sequencer for HttpSequencer {
    async fn get_create_bridge(&self, id: &str) -> Result<CreateBridgeEntry> {
        let response = self.client.get(self.endpoint(id)).send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("sequencer returned {status} for bridge request {id}");
        }
        Ok(response.json().await?)
    }

    async fn sign_create_bridge(
        &self,
        id: &str,
        request: &SignCreateBridgeRequest,
    ) -> Result<SignResponse> {
        let response = self
            .client
            .post(format!("{}/sign", self.endpoint(id)))
            .json(request)
            .send()
            .await?;
        match response.status() {
            StatusCode::CONFLICT => Ok(SignResponse::AlreadySigned),
            status if status.is_success() => Ok(SignResponse::Accepted),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(anyhow!("sequencer rejected signatures for {id} with {status}: {body}"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationOutcome {
    Signed,
    AlreadySigned,
    /// The chain pairing cannot be created dynamically.
    Unsupported,
    /// Failed; the request was handed back to the locking chain for another attempt.
    Retried,
    /// Failed after the last permitted attempt.
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct CreationSettings {
    pub main_door: String,
    pub side_door: String,
    pub min_signature_reward: u64,
    pub max_signature_reward: u64,
    pub max_tries: u32,
}

#[derive(Debug)]
pub struct BridgeCreator {
    chains: Chains,
    membership: Arc<SignerMembership>,
    sequencer: Arc<dyn Sequencer>,
    settings: CreationSettings,
}

impl BridgeCreator {
    pub fn new(
        chains: Chains,
        membership: Arc<SignerMembership>,
        sequencer: Arc<dyn Sequencer>,
        settings: CreationSettings,
    ) -> Self {
        BridgeCreator {
            chains,
            membership,
            sequencer,
            settings,
        }
    }

    /// Handle the bridge requests emitted on `locking` up to its current height.
    pub async fn tick(&self, locking: ChainSide) -> Vec<CreationOutcome> {
        if !self.membership.is_member(locking).await
            || !self.membership.is_member(locking.other()).await
        {
            return Vec::new();
        }
        let provider = self.chains.get(locking);
        let height = match provider.block_height().await {
            Ok(height) if height > 0 => height,
            _ => return Vec::new(),
        };
        let requests = match provider.fetch_new_bridge_requests(height).await {
            Ok(requests) => requests,
            Err(e) => {
                warn!(chain_id = provider.chain_id(), "failed to fetch bridge requests: {e:?}");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let outcome = match self.countersign(locking, &request).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(id = %request.id(), tries = request.tries, "bridge creation failed: {e:?}");
                    self.retry(provider.as_ref(), request).await
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn countersign(&self, locking: ChainSide, request: &BridgeRequest) -> Result<CreationOutcome> {
        let id = request.id();
        let locking_chain = self.chains.get(locking);
        let issuing_chain = self.chains.get(locking.other());
        let (locking_type, issuing_type) = (locking_chain.chain_type(), issuing_chain.chain_type());
        let (locking_door, issuing_door) = match locking {
            ChainSide::Main => (&self.settings.main_door, &self.settings.side_door),
            ChainSide::Side => (&self.settings.side_door, &self.settings.main_door),
        };

        let entry = self.sequencer.get_create_bridge(&id).await?;
        if entry.locking_chain_type != locking_type {
            bail!(
                "sequencer expects a {} locking chain, this one is {locking_type}",
                entry.locking_chain_type
            );
        }
        if entry.issuing_chain_type != issuing_type {
            bail!(
                "sequencer expects a {} issuing chain, this one is {issuing_type}",
                entry.issuing_chain_type
            );
        }

        let token = &request.token_address;
        let (locking_door_on_issuing, issuing_door_on_locking, token_on_issuing) =
            match (locking_type, issuing_type) {
                (ChainType::Evm, ChainType::Xrp) => (
                    address::evm_to_xrpl(locking_door)?,
                    address::xrpl_to_evm(issuing_door)?,
                    address::evm_to_xrpl(token)?,
                ),
                (ChainType::Xrp, ChainType::Evm) => {
                    warn!(%id, "XRPL locking chains do not request bridges, ignoring");
                    return Ok(CreationOutcome::Unsupported);
                }
                _ => (locking_door.clone(), issuing_door.clone(), token.clone()),
            };

        let token_code = locking_chain.get_token_code_from_address(token).await?;
        let locking_signature = locking_chain
            .sign_encoded_create_bridge_transaction(
                &entry.locking_chain_door_create_bridge_transaction,
                &CreateBridgeParams {
                    is_locking: true,
                    min_signature_reward: self.settings.min_signature_reward,
                    max_signature_reward: self.settings.max_signature_reward,
                    other_chain_door: issuing_door_on_locking,
                    token_address: token.clone(),
                    token_code: token_code.clone(),
                },
            )
            .await?;
        let issuing_signature = issuing_chain
            .sign_encoded_create_bridge_transaction(
                &entry.issuing_chain_door_create_bridge_transaction,
                &CreateBridgeParams {
                    is_locking: false,
                    min_signature_reward: self.settings.min_signature_reward,
                    max_signature_reward: self.settings.max_signature_reward,
                    other_chain_door: locking_door_on_issuing,
                    token_address: token_on_issuing,
                    token_code,
                },
            )
            .await?;

        let response = self
            .sequencer
            .sign_create_bridge(
                &id,
                &SignCreateBridgeRequest {
                    signed_locking_chain_door_create_bridge_transaction: locking_signature,
                    signed_issuing_chain_door_create_bridge_transaction: issuing_signature,
                },
            )
            .await?;
        match response {
            SignResponse::Accepted => {
                info!(%id, "countersigned bridge creation");
                Ok(CreationOutcome::Signed)
            }
            SignResponse::AlreadySigned => {
                debug!(%id, "bridge creation already signed");
                Ok(CreationOutcome::AlreadySigned)
            }
        }
    }

    async fn retry(&self, locking: &dyn ChainProvider, request: BridgeRequest) -> CreationOutcome {
        if request.tries >= self.settings.max_tries {
            warn!(id = %request.id(), "giving up on bridge request");
            return CreationOutcome::Abandoned;
        }
        let id = request.id();
        if let Err(e) = locking.retry_new_bridge_request(request).await {
            error!(%id, "failed to requeue bridge request: {e:?}");
        }
        CreationOutcome::Retried
    }
}

/// Handle bridge requests of both chains every `period`, the first time after [FIRST_TICK_DELAY].
pub async fn run_creation(creator: Arc<BridgeCreator>, period: Duration) -> Result<()> {
    tokio::time::sleep(FIRST_TICK_DELAY).await;
    let mut interval = tokio::time::interval_at(Instant::now(), period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        for locking in [ChainSide::Main, ChainSide::Side] {
            let outcomes = creator.tick(locking).await;
            if !outcomes.is_empty() {
                debug!(%locking, ?outcomes, "bridge requests handled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::test_util::{DOOR_EVM, DOOR_XRPL, ISSUING_DOOR_EVM, ISSUING_DOOR_XRPL, MockChainProvider};

    const TOKEN_EVM: &str = "0x00000000000000000000000000000000000000aa";
    const TOKEN_XRPL: &str = "rrrrrrrrrrrrrrrrrrrrLDor7oe";

    #[derive(Debug, Default)]
    struct FakeSequencer {
        entry: Mutex<Option<CreateBridgeEntry>>,
        already_signed: Mutex<bool>,
        signed: Mutex<Vec<(String, SignCreateBridgeRequest)>>,
    }

    #[async_trait]
    impl Sequencer for FakeSequencer {
        async fn get_create_bridge(&self, id: &str) -> Result<CreateBridgeEntry> {
            self.entry
                .lock()
                .clone()
                .ok_or_else(|| anyhow!("no entry for {id}"))
        }

        async fn sign_create_bridge(
            &self,
            id: &str,
            request: &SignCreateBridgeRequest,
        ) -> Result<SignResponse> {
            if *self.already_signed.lock() {
                return Ok(SignResponse::AlreadySigned);
            }
            self.signed.lock().push((id.to_owned(), request.clone()));
            Ok(SignResponse::Accepted)
        }
    }

    fn entry(locking: ChainType, issuing: ChainType) -> CreateBridgeEntry {
        CreateBridgeEntry {
            locking_chain_type: locking,
            issuing_chain_type: issuing,
            locking_chain_door_create_bridge_transaction: "locking-tx".to_owned(),
            issuing_chain_door_create_bridge_transaction: "issuing-tx".to_owned(),
        }
    }

    fn request(tries: u32) -> BridgeRequest {
        BridgeRequest {
            tx_hash: "0xabc".to_owned(),
            log_index: 3,
            token_address: TOKEN_EVM.to_owned(),
            tries,
        }
    }

    struct Harness {
        main: Arc<MockChainProvider>,
        side: Arc<MockChainProvider>,
        sequencer: Arc<FakeSequencer>,
        creator: BridgeCreator,
    }

    /// An EVM main chain locking tokens bridged to an XRPL side chain.
    fn harness() -> Harness {
        let main = Arc::new(MockChainProvider::new(1, ChainType::Evm));
        let side = Arc::new(MockChainProvider::new(2, ChainType::Xrp));
        main.set_height(100);
        main.set_token_code(TOKEN_EVM, "TKN");
        let chains = Chains::new(main.clone(), side.clone());
        let membership = Arc::new(SignerMembership::new(
            chains.clone(),
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));
        let sequencer = Arc::new(FakeSequencer::default());
        *sequencer.entry.lock() = Some(entry(ChainType::Evm, ChainType::Xrp));
        let creator = BridgeCreator::new(
            chains,
            membership,
            sequencer.clone(),
            CreationSettings {
                main_door: ISSUING_DOOR_EVM.to_owned(),
                side_door: DOOR_XRPL.to_owned(),
                min_signature_reward: 10,
                max_signature_reward: 100,
                max_tries: 3,
            },
        );
        Harness {
            main,
            side,
            sequencer,
            creator,
        }
    }

    #[witness_macros::test(start_paused)]
    async fn both_halves_are_signed_in_their_own_encoding() {
        let h = harness();
        h.main.add_bridge_request(request(0));

        assert_eq!(h.creator.tick(ChainSide::Main).await, vec![CreationOutcome::Signed]);

        let (encoded, locking) = &h.main.create_bridge_signatures()[0];
        assert_eq!(encoded, "locking-tx");
        assert!(locking.is_locking);
        assert_eq!(locking.other_chain_door, DOOR_EVM);
        assert_eq!(locking.token_address, TOKEN_EVM);
        assert_eq!(locking.token_code, "TKN");
        assert_eq!((locking.min_signature_reward, locking.max_signature_reward), (10, 100));

        let (encoded, issuing) = &h.side.create_bridge_signatures()[0];
        assert_eq!(encoded, "issuing-tx");
        assert!(!issuing.is_locking);
        assert_eq!(issuing.other_chain_door, ISSUING_DOOR_XRPL);
        assert_eq!(issuing.token_address, TOKEN_XRPL);

        let (id, signed) = &h.sequencer.signed.lock()[0];
        assert_eq!(id, "0xabc-3");
        assert_eq!(signed.signed_locking_chain_door_create_bridge_transaction.signature, "sig:locking-tx");
        assert_eq!(signed.signed_issuing_chain_door_create_bridge_transaction.signature, "sig:issuing-tx");
    }

    #[witness_macros::test(start_paused)]
    async fn already_signed_requests_are_not_retried() {
        let h = harness();
        *h.sequencer.already_signed.lock() = true;
        h.main.add_bridge_request(request(0));

        assert_eq!(h.creator.tick(ChainSide::Main).await, vec![CreationOutcome::AlreadySigned]);
        assert!(h.main.retried_requests().is_empty());
    }

    #[witness_macros::test(start_paused)]
    async fn failures_are_retried_up_to_the_limit() {
        let h = harness();
        h.side.fail("sign_encoded_create_bridge_transaction");
        h.main.add_bridge_request(request(2));
        h.main.add_bridge_request(request(3));

        assert_eq!(
            h.creator.tick(ChainSide::Main).await,
            vec![CreationOutcome::Retried, CreationOutcome::Abandoned]
        );
        assert_eq!(h.main.retried_requests(), vec![request(2)]);
        assert!(h.sequencer.signed.lock().is_empty());
    }

    #[witness_macros::test(start_paused)]
    async fn mismatched_chain_types_are_retried() {
        let h = harness();
        *h.sequencer.entry.lock() = Some(entry(ChainType::Xrp, ChainType::Evm));
        h.main.add_bridge_request(request(0));

        assert_eq!(h.creator.tick(ChainSide::Main).await, vec![CreationOutcome::Retried]);
        assert!(h.main.create_bridge_signatures().is_empty());
    }

    #[witness_macros::test(start_paused)]
    async fn non_signers_do_not_countersign() {
        let h = harness();
        h.side
            .in_signer_list
            .store(false, std::sync::atomic::Ordering::SeqCst);
        h.main.add_bridge_request(request(0));

        assert!(h.creator.tick(ChainSide::Main).await.is_empty());
        assert_eq!(h.main.calls("fetch_new_bridge_requests"), 0);
    }

    #[test]
    fn sequencer_endpoints() {
        let sequencer = HttpSequencer::new("http://sequencer:3000/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            sequencer.endpoint("0xabc-3"),
            "http://sequencer:3000/create-bridge/0xabc-3"
        );
    }
}

//! A [ChainProvider] backed by a chain-adapter process speaking JSON-RPC.
//!
//! The adapter owns everything chain specific: the node connection, the transaction codec and the signer. Every
//! operation maps to a `witness_<operation>` method with positional parameters. Scan cursors, the bridge registry and
//! the chain id are kept here.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use jsonrpsee::{
    core::{ClientError, client::ClientT, params::ArrayParams},
    http_client::{HttpClient, HttpClientBuilder},
    rpc_params,
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, trace, warn};

use super::{
    AccountCreate, AccountCreateAttestation, BridgeRequest, ChainId, ChainProvider, ChainType, Claim,
    ClaimAttestation, Commit, CreateBridgeParams, CreateBridgeSignature, Payload, PreparedTransaction,
    TransactionStatus,
};
use crate::{
    bridge::{BridgeId, BridgeProvider, BridgeRegistry},
    error::BroadcastError,
};

/// The node did not answer the adapter in time.
pub const NO_RESPONSE_CODE: i32 = -32001;
/// The transaction's nonce is ahead of the account's.
pub const INVALID_NONCE_CODE: i32 = -32002;
/// The node already has the transaction.
pub const IGNORABLE_CODE: i32 = -32003;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What the adapter needs to know about this witness on its chain.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterSettings<S: Serialize> {
    pub door_address: String,
    pub signer: S,
}

#[derive(Debug)]
pub struct RemoteChainProvider {
    client: HttpClient,
    chain_type: ChainType,
    chain_id: ChainId,
    bridges: BridgeRegistry,
    current_block: AtomicU64,
    new_bridges_block: AtomicU64,
}

impl RemoteChainProvider {
    /// Connect to the adapter at `node`, hand it `settings` and learn the chain id. Both cursors start at
    /// `starting_block`.
    pub async fn connect<S: Serialize + Send + Sync>(
        chain_type: ChainType,
        node: &str,
        starting_block: u64,
        settings: &AdapterSettings<S>,
    ) -> Result<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(REQUEST_TIMEOUT)
            .build(node)?;
        client
            .request::<(), _>("witness_configure", rpc_params![settings])
            .await
            .with_context(|| format!("failed to configure chain adapter at {node}"))?;
        let chain_id: ChainId = client
            .request("witness_chainId", rpc_params![])
            .await
            .with_context(|| format!("failed to fetch chain id from {node}"))?;
        info!(chain_id, %chain_type, node, "connected to chain adapter");

        Ok(RemoteChainProvider {
            client,
            chain_type,
            chain_id,
            bridges: BridgeRegistry::new(),
            current_block: AtomicU64::new(starting_block),
            new_bridges_block: AtomicU64::new(starting_block),
        })
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: ArrayParams) -> Result<R> {
        trace!(chain_id = self.chain_id, method, "adapter request");
        self.client
            .request(method, params)
            .await
            .with_context(|| format!("{method} failed on chain {}", self.chain_id))
    }
}

/// Map a failed `witness_broadcastTransaction` call onto the resend policy it calls for.
pub fn classify_broadcast_error(error: ClientError) -> BroadcastError {
    match error {
        ClientError::Call(e) => match e.code() {
            NO_RESPONSE_CODE => BroadcastError::NoResponse(e.message().to_owned()),
            INVALID_NONCE_CODE => BroadcastError::InvalidNonce(e.message().to_owned()),
            IGNORABLE_CODE => BroadcastError::Ignorable(e.message().to_owned()),
            _ => BroadcastError::Unknown(e.message().to_owned()),
        },
        // Transport failures and timeouts leave the fate of the transaction unknown.
        e => BroadcastError::NoResponse(e.to_string()),
    }
}

#[async_trait]
impl ChainProvider for RemoteChainProvider {
    fn chain_type(&self) -> ChainType {
        self.chain_type
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn bridges(&self) -> &BridgeRegistry {
        &self.bridges
    }

    async fn block_height(&self) -> Result<u64> {
        self.call("witness_blockHeight", rpc_params![]).await
    }

    fn current_block_number(&self) -> u64 {
        self.current_block.load(Ordering::SeqCst)
    }

    fn set_current_block_number(&self, block: u64) {
        self.current_block.store(block, Ordering::SeqCst);
    }

    fn new_bridges_block_number(&self) -> u64 {
        self.new_bridges_block.load(Ordering::SeqCst)
    }

    fn set_new_bridges_block_number(&self, block: u64) {
        self.new_bridges_block.store(block, Ordering::SeqCst);
    }

    async fn get_new_commits(&self, to_block: u64) -> Result<Vec<Commit>> {
        let bridges = self.bridges.active_ids();
        if bridges.is_empty() {
            return Ok(Vec::new());
        }
        self.call(
            "witness_getNewCommits",
            rpc_params![self.current_block_number(), to_block, bridges],
        )
        .await
    }

    async fn get_new_account_creates(&self, to_block: u64) -> Result<Vec<AccountCreate>> {
        let bridges = self.bridges.active_ids();
        if bridges.is_empty() {
            return Ok(Vec::new());
        }
        self.call(
            "witness_getNewAccountCreates",
            rpc_params![self.current_block_number(), to_block, bridges],
        )
        .await
    }

    async fn fetch_new_bridges(&self, to_block: u64) -> Result<()> {
        let found: Vec<BridgeProvider> = self
            .call(
                "witness_fetchNewBridges",
                rpc_params![self.new_bridges_block_number(), to_block],
            )
            .await?;
        for bridge in found {
            match self.bridges.discover(bridge) {
                Ok(id) => debug!(chain_id = self.chain_id, bridge_id = %id, "discovered bridge"),
                Err(e) => warn!(chain_id = self.chain_id, "skipping bridge with malformed accounts: {e}"),
            }
        }
        Ok(())
    }

    async fn get_unattested_claim_by_id(
        &self,
        claim_id: u64,
        bridge_id: &BridgeId,
    ) -> Result<Option<Claim>> {
        self.call(
            "witness_getUnattestedClaimById",
            rpc_params![claim_id, bridge_id],
        )
        .await
    }

    async fn check_account_created(&self, account: &str, bridge_id: &BridgeId) -> Result<bool> {
        self.call("witness_checkAccountCreated", rpc_params![account, bridge_id])
            .await
    }

    async fn check_witness_has_attested_create_account(
        &self,
        account: &str,
        bridge_id: &BridgeId,
    ) -> Result<bool> {
        self.call(
            "witness_checkWitnessHasAttestedCreateAccount",
            rpc_params![account, bridge_id],
        )
        .await
    }

    async fn get_attest_claim_transaction(
        &self,
        attestation: &ClaimAttestation,
    ) -> Result<PreparedTransaction> {
        self.call("witness_getAttestClaimTransaction", rpc_params![attestation])
            .await
    }

    async fn get_attest_account_create_transaction(
        &self,
        attestation: &AccountCreateAttestation,
    ) -> Result<PreparedTransaction> {
        self.call(
            "witness_getAttestAccountCreateTransaction",
            rpc_params![attestation],
        )
        .await
    }

    async fn sign_transaction(&self, payload: &str) -> Result<Payload> {
        self.call("witness_signTransaction", rpc_params![payload]).await
    }

    async fn broadcast_transaction(&self, signed: &str) -> Result<String, BroadcastError> {
        self.client
            .request("witness_broadcastTransaction", rpc_params![signed])
            .await
            .map_err(classify_broadcast_error)
    }

    async fn get_transaction_status(&self, hash: &str) -> TransactionStatus {
        match self
            .call("witness_getTransactionStatus", rpc_params![hash])
            .await
        {
            Ok(status) => status,
            Err(e) => {
                debug!(chain_id = self.chain_id, hash, "status lookup failed: {e:?}");
                TransactionStatus::Error
            }
        }
    }

    async fn get_noop_transaction(&self, nonce: u64, gas_factor: u32) -> Result<Payload> {
        self.call("witness_getNoopTransaction", rpc_params![nonce, gas_factor])
            .await
    }

    async fn set_transaction_gas_price(&self, payload: &str, gas_factor: u32) -> Result<Payload> {
        self.call(
            "witness_setTransactionGasPrice",
            rpc_params![payload, gas_factor],
        )
        .await
    }

    async fn get_nonce(&self) -> Result<u64> {
        self.call("witness_getNonce", rpc_params![]).await
    }

    async fn is_in_signer_list(&self) -> Result<bool> {
        self.call("witness_isInSignerList", rpc_params![]).await
    }

    async fn get_current_create_account_count(&self) -> Result<u64> {
        self.call("witness_getCurrentCreateAccountCount", rpc_params![])
            .await
    }

    async fn get_transaction_create_count(&self, payload: &str) -> Result<u64> {
        self.call("witness_getTransactionCreateCount", rpc_params![payload])
            .await
    }

    async fn fetch_new_bridge_requests(&self, to_block: u64) -> Result<Vec<BridgeRequest>> {
        self.call("witness_fetchNewBridgeRequests", rpc_params![to_block])
            .await
    }

    async fn retry_new_bridge_request(&self, request: BridgeRequest) -> Result<()> {
        self.call("witness_retryNewBridgeRequest", rpc_params![request])
            .await
    }

    async fn get_token_code_from_address(&self, address: &str) -> Result<String> {
        self.call("witness_getTokenCodeFromAddress", rpc_params![address])
            .await
    }

    async fn sign_encoded_create_bridge_transaction(
        &self,
        encoded: &str,
        params: &CreateBridgeParams,
    ) -> Result<CreateBridgeSignature> {
        self.call(
            "witness_signEncodedCreateBridgeTransaction",
            rpc_params![encoded, params],
        )
        .await
    }
}

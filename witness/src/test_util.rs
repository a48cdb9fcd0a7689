//! An in-memory [ChainProvider] for tests, scripted through its inherent methods.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    bridge::{BridgeConfig, BridgeId, BridgeProvider, BridgeRegistry, Issue, NATIVE_CURRENCY},
    chain::{
        AccountCreate, AccountCreateAttestation, ChainId, ChainProvider, ChainType, Chains, Claim,
        ClaimAttestation, Commit, CreateBridgeParams, CreateBridgeSignature, Payload,
        PreparedTransaction, TransactionStatus, BridgeRequest,
    },
    error::BroadcastError,
};

/// Locking door of [native_bridge] on the XRP ledger.
pub const DOOR_XRPL: &str = "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh";
/// [DOOR_XRPL] in EVM encoding.
pub const DOOR_EVM: &str = "0xb5f762798a53d543a014caf8b297cff8f2f937e8";
/// Issuing door of [native_bridge] on the EVM chain.
pub const ISSUING_DOOR_EVM: &str = "0x0000000000000000000000000000000000000001";
/// [ISSUING_DOOR_EVM] in XRPL encoding.
pub const ISSUING_DOOR_XRPL: &str = "rrrrrrrrrrrrrrrrrrrrBZbvji";

/// The XRP bridge between [DOOR_XRPL] and [ISSUING_DOOR_EVM], as stored on a chain of `chain_type`.
pub fn native_bridge(chain_type: ChainType) -> BridgeProvider {
    let xrp = Issue {
        currency: NATIVE_CURRENCY.to_owned(),
        issuer: None,
    };
    let (locking_door, issuing_door, asset_precision) = match chain_type {
        ChainType::Xrp => (DOOR_XRPL, ISSUING_DOOR_XRPL, 6),
        ChainType::Evm => (DOOR_EVM, ISSUING_DOOR_EVM, 18),
    };
    BridgeProvider {
        chain_type,
        config: BridgeConfig {
            locking_chain_door: locking_door.to_owned(),
            locking_chain_issue: xrp.clone(),
            issuing_chain_door: issuing_door.to_owned(),
            issuing_chain_issue: xrp,
        },
        asset_precision,
    }
}

/// An XRPL main chain and an EVM side chain sharing the active [native_bridge].
pub fn bridged_pair(
    main_id: ChainId,
    side_id: ChainId,
) -> (Arc<MockChainProvider>, Arc<MockChainProvider>, BridgeId) {
    let main = Arc::new(MockChainProvider::new(main_id, ChainType::Xrp));
    let side = Arc::new(MockChainProvider::new(side_id, ChainType::Evm));
    main.add_discoverable_bridge(native_bridge(ChainType::Xrp));
    side.add_discoverable_bridge(native_bridge(ChainType::Evm));
    let id = main
        .bridges()
        .discover(native_bridge(ChainType::Xrp))
        .expect("native bridge id");
    side.bridges()
        .discover(native_bridge(ChainType::Evm))
        .expect("native bridge id");
    assert!(crate::bridge::validate_bridges(&Chains::new(
        main.clone(),
        side.clone()
    )));
    (main, side, id)
}

#[derive(Debug, Default)]
struct Script {
    calls: HashMap<&'static str, usize>,
    failing: HashSet<String>,
    commits: Vec<Commit>,
    account_creates: Vec<AccountCreate>,
    discoverable: Vec<BridgeProvider>,
    claims: HashMap<u64, Claim>,
    created_accounts: HashSet<String>,
    attested_creates: HashSet<String>,
    claim_attestations: Vec<ClaimAttestation>,
    account_create_attestations: Vec<AccountCreateAttestation>,
    broadcast_results: VecDeque<Result<String, BroadcastError>>,
    broadcasts: Vec<String>,
    statuses: HashMap<String, TransactionStatus>,
    transaction_create_counts: HashMap<String, u64>,
    bridge_requests: Vec<BridgeRequest>,
    retried_requests: Vec<BridgeRequest>,
    token_codes: HashMap<String, String>,
    create_bridge_signatures: Vec<(String, CreateBridgeParams)>,
}

/// A chain that lives entirely in memory.
///
/// Every trait method counts its calls, and fails with an unavailable error while its name is marked with
/// [MockChainProvider::fail]. Defaults: signing prefixes `signed:`, broadcasting returns `hash:<signed>`, statuses are
/// [TransactionStatus::Accepted], no-ops are `noop:<nonce>:<gas factor>` and cannot be built for nonce zero, and
/// re-pricing appends `@<gas factor>`.
#[derive(Debug)]
pub struct MockChainProvider {
    chain_id: ChainId,
    chain_type: ChainType,
    bridges: BridgeRegistry,
    pub in_signer_list: AtomicBool,
    height: AtomicU64,
    current_block: AtomicU64,
    new_bridges_block: AtomicU64,
    nonce: AtomicU64,
    next_assigned_nonce: AtomicU64,
    create_account_count: AtomicU64,
    script: Mutex<Script>,
}

impl MockChainProvider {
    pub fn new(chain_id: ChainId, chain_type: ChainType) -> Self {
        MockChainProvider {
            chain_id,
            chain_type,
            bridges: BridgeRegistry::new(),
            in_signer_list: AtomicBool::new(true),
            height: AtomicU64::new(0),
            current_block: AtomicU64::new(0),
            new_bridges_block: AtomicU64::new(0),
            nonce: AtomicU64::new(0),
            next_assigned_nonce: AtomicU64::new(0),
            create_account_count: AtomicU64::new(0),
            script: Mutex::new(Script::default()),
        }
    }

    /// Make `method` fail until [MockChainProvider::recover] is called.
    pub fn fail(&self, method: &str) {
        self.script.lock().failing.insert(method.to_owned());
    }

    pub fn recover(&self, method: &str) {
        self.script.lock().failing.remove(method);
    }

    /// How many times `method` has been called.
    pub fn calls(&self, method: &str) -> usize {
        self.script.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    /// The next nonce the chain accepts.
    pub fn set_nonce(&self, nonce: u64) {
        self.nonce.store(nonce, Ordering::SeqCst);
    }

    /// The nonce assigned to the next constructed attestation. Each construction takes the next one.
    pub fn set_next_assigned_nonce(&self, nonce: u64) {
        self.next_assigned_nonce.store(nonce, Ordering::SeqCst);
    }

    pub fn set_create_account_count(&self, count: u64) {
        self.create_account_count.store(count, Ordering::SeqCst);
    }

    pub fn set_transaction_create_count(&self, payload: &str, count: u64) {
        self.script
            .lock()
            .transaction_create_counts
            .insert(payload.to_owned(), count);
    }

    pub fn add_commit(&self, commit: Commit) {
        self.script.lock().commits.push(commit);
    }

    pub fn add_account_create(&self, create: AccountCreate) {
        self.script.lock().account_creates.push(create);
    }

    /// A bridge object that [ChainProvider::fetch_new_bridges] will find.
    pub fn add_discoverable_bridge(&self, bridge: BridgeProvider) {
        self.script.lock().discoverable.push(bridge);
    }

    pub fn add_claim(&self, claim: Claim) {
        self.script.lock().claims.insert(claim.claim_id, claim);
    }

    pub fn add_created_account(&self, account: &str) {
        self.script
            .lock()
            .created_accounts
            .insert(account.to_owned());
    }

    pub fn add_attested_create(&self, account: &str) {
        self.script
            .lock()
            .attested_creates
            .insert(account.to_owned());
    }

    pub fn claim_attestations(&self) -> Vec<ClaimAttestation> {
        self.script.lock().claim_attestations.clone()
    }

    pub fn account_create_attestations(&self) -> Vec<AccountCreateAttestation> {
        self.script.lock().account_create_attestations.clone()
    }

    /// Queue the result of a future broadcast. Once the queue is empty broadcasts succeed.
    pub fn script_broadcast(&self, result: Result<String, BroadcastError>) {
        self.script.lock().broadcast_results.push_back(result);
    }

    /// Every signed payload submitted, in order, including rejected ones.
    pub fn broadcasts(&self) -> Vec<String> {
        self.script.lock().broadcasts.clone()
    }

    pub fn script_status(&self, hash: &str, status: TransactionStatus) {
        self.script
            .lock()
            .statuses
            .insert(hash.to_owned(), status);
    }

    pub fn add_bridge_request(&self, request: BridgeRequest) {
        self.script.lock().bridge_requests.push(request);
    }

    pub fn retried_requests(&self) -> Vec<BridgeRequest> {
        self.script.lock().retried_requests.clone()
    }

    pub fn set_token_code(&self, address: &str, code: &str) {
        self.script
            .lock()
            .token_codes
            .insert(address.to_owned(), code.to_owned());
    }

    pub fn create_bridge_signatures(&self) -> Vec<(String, CreateBridgeParams)> {
        self.script.lock().create_bridge_signatures.clone()
    }

    fn call(&self, method: &'static str) -> Result<()> {
        let mut script = self.script.lock();
        *script.calls.entry(method).or_default() += 1;
        if script.failing.contains(method) {
            Err(anyhow!("{method} unavailable on chain {}", self.chain_id))
        } else {
            Ok(())
        }
    }

    fn in_scan_range(&self, block: u64, to_block: u64) -> bool {
        block >= self.current_block.load(Ordering::SeqCst) && block <= to_block
    }
}

#[async_trait]
impl ChainProvider for MockChainProvider {
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
        self.call("block_height")?;
        Ok(self.height.load(Ordering::SeqCst))
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
        self.call("get_new_commits")?;
        let commits = self.script.lock().commits.clone();
        Ok(commits
            .into_iter()
            .filter(|c| self.in_scan_range(c.block, to_block) && self.bridges.is_active(&c.bridge_id))
            .collect())
    }

    async fn get_new_account_creates(&self, to_block: u64) -> Result<Vec<AccountCreate>> {
        self.call("get_new_account_creates")?;
        let creates = self.script.lock().account_creates.clone();
        Ok(creates
            .into_iter()
            .filter(|c| self.in_scan_range(c.block, to_block) && self.bridges.is_active(&c.bridge_id))
            .collect())
    }

    async fn fetch_new_bridges(&self, _to_block: u64) -> Result<()> {
        self.call("fetch_new_bridges")?;
        let discoverable = self.script.lock().discoverable.clone();
        for bridge in discoverable {
            if let Err(e) = self.bridges.discover(bridge) {
                tracing::warn!(chain_id = self.chain_id, "skipping bridge with malformed accounts: {e}");
            }
        }
        Ok(())
    }

    async fn get_unattested_claim_by_id(
        &self,
        claim_id: u64,
        _bridge_id: &BridgeId,
    ) -> Result<Option<Claim>> {
        self.call("get_unattested_claim_by_id")?;
        Ok(self.script.lock().claims.get(&claim_id).cloned())
    }

    async fn check_account_created(&self, account: &str, _bridge_id: &BridgeId) -> Result<bool> {
        self.call("check_account_created")?;
        Ok(self.script.lock().created_accounts.contains(account))
    }

    async fn check_witness_has_attested_create_account(
        &self,
        account: &str,
        _bridge_id: &BridgeId,
    ) -> Result<bool> {
        self.call("check_witness_has_attested_create_account")?;
        Ok(self.script.lock().attested_creates.contains(account))
    }

    async fn get_attest_claim_transaction(
        &self,
        attestation: &ClaimAttestation,
    ) -> Result<PreparedTransaction> {
        self.call("get_attest_claim_transaction")?;
        self.script
            .lock()
            .claim_attestations
            .push(attestation.clone());
        Ok(PreparedTransaction {
            payload: format!(
                "claim:{}:{}:{}",
                attestation.claim_id, attestation.amount, attestation.destination
            ),
            nonce: self.next_assigned_nonce.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn get_attest_account_create_transaction(
        &self,
        attestation: &AccountCreateAttestation,
    ) -> Result<PreparedTransaction> {
        self.call("get_attest_account_create_transaction")?;
        self.script
            .lock()
            .account_create_attestations
            .push(attestation.clone());
        Ok(PreparedTransaction {
            payload: format!(
                "create:{}:{}:{}",
                attestation.destination, attestation.amount, attestation.signature_reward
            ),
            nonce: self.next_assigned_nonce.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn sign_transaction(&self, payload: &str) -> Result<Payload> {
        self.call("sign_transaction")?;
        Ok(format!("signed:{payload}"))
    }

    async fn broadcast_transaction(&self, signed: &str) -> Result<String, BroadcastError> {
        self.call("broadcast_transaction")
            .map_err(|e| BroadcastError::NoResponse(e.to_string()))?;
        let mut script = self.script.lock();
        script.broadcasts.push(signed.to_owned());
        script
            .broadcast_results
            .pop_front()
            .unwrap_or_else(|| Ok(format!("hash:{signed}")))
    }

    async fn get_transaction_status(&self, hash: &str) -> TransactionStatus {
        if self.call("get_transaction_status").is_err() {
            return TransactionStatus::Error;
        }
        self.script
            .lock()
            .statuses
            .get(hash)
            .copied()
            .unwrap_or(TransactionStatus::Accepted)
    }

    async fn get_noop_transaction(&self, nonce: u64, gas_factor: u32) -> Result<Payload> {
        self.call("get_noop_transaction")?;
        if nonce == 0 {
            return Err(anyhow!("no-op transactions need a non-zero nonce"));
        }
        Ok(format!("noop:{nonce}:{gas_factor}"))
    }

    async fn set_transaction_gas_price(&self, payload: &str, gas_factor: u32) -> Result<Payload> {
        self.call("set_transaction_gas_price")?;
        let base = payload.split('@').next().unwrap_or(payload);
        Ok(format!("{base}@{gas_factor}"))
    }

    async fn get_nonce(&self) -> Result<u64> {
        self.call("get_nonce")?;
        Ok(self.nonce.load(Ordering::SeqCst))
    }

    async fn is_in_signer_list(&self) -> Result<bool> {
        self.call("is_in_signer_list")?;
        Ok(self.in_signer_list.load(Ordering::SeqCst))
    }

    async fn get_current_create_account_count(&self) -> Result<u64> {
        self.call("get_current_create_account_count")?;
        Ok(self.create_account_count.load(Ordering::SeqCst))
    }

    async fn get_transaction_create_count(&self, payload: &str) -> Result<u64> {
        self.call("get_transaction_create_count")?;
        self.script
            .lock()
            .transaction_create_counts
            .get(payload)
            .copied()
            .ok_or_else(|| anyhow!("payload carries no create count"))
    }

    async fn fetch_new_bridge_requests(&self, _to_block: u64) -> Result<Vec<BridgeRequest>> {
        self.call("fetch_new_bridge_requests")?;
        Ok(std::mem::take(&mut self.script.lock().bridge_requests))
    }

    async fn retry_new_bridge_request(&self, request: BridgeRequest) -> Result<()> {
        self.call("retry_new_bridge_request")?;
        self.script.lock().retried_requests.push(request);
        Ok(())
    }

    async fn get_token_code_from_address(&self, address: &str) -> Result<String> {
        self.call("get_token_code_from_address")?;
        self.script
            .lock()
            .token_codes
            .get(address)
            .cloned()
            .ok_or_else(|| anyhow!("unknown token {address}"))
    }

    async fn sign_encoded_create_bridge_transaction(
        &self,
        encoded: &str,
        params: &CreateBridgeParams,
    ) -> Result<CreateBridgeSignature> {
        self.call("sign_encoded_create_bridge_transaction")?;
        self.script
            .lock()
            .create_bridge_signatures
            .push((encoded.to_owned(), params.clone()));
        Ok(CreateBridgeSignature {
            account: format!("witness-{}", self.chain_id),
            public_key: format!("key-{}", self.chain_id),
            signature: format!("sig:{encoded}"),
        })
    }
}

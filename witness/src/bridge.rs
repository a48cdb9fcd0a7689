//! Bridge identity, per-chain bridge discovery state and cross-chain pairing.

use std::{collections::BTreeMap, fmt};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::{
    address,
    chain::{ChainProvider, ChainType, Chains},
    error::AddressError,
};

/// Currency code of the asset native to the XRP ledger. Bridges of the native asset are identified by door accounts
/// rather than issuers.
pub const NATIVE_CURRENCY: &str = "XRP";

/// Key of a logical bridge, identical whichever chain it was discovered on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BridgeId(String);

impl BridgeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BridgeId {
    fn from(id: &str) -> Self {
        BridgeId(id.to_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub currency: String,
    #[serde(default)]
    pub issuer: Option<String>,
}

impl Issue {
    pub fn is_native(&self) -> bool {
        normalize_currency(&self.currency) == NATIVE_CURRENCY
    }
}

/// The bridge object as stored on one chain. Accounts are in that chain's native encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    pub locking_chain_door: String,
    pub locking_chain_issue: Issue,
    pub issuing_chain_door: String,
    pub issuing_chain_issue: Issue,
}

/// A bridge as discovered on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeProvider {
    pub chain_type: ChainType,
    pub config: BridgeConfig,
    /// Decimals of the bridged asset on this chain.
    pub asset_precision: u32,
}

/// XRPL currency codes longer than three characters are stored as 40 hex digits, NUL padded.
pub fn normalize_currency(currency: &str) -> String {
    if currency.len() == 40 && currency.bytes().all(|b| b.is_ascii_hexdigit()) {
        if let Ok(bytes) = hex::decode(currency) {
            let trimmed: Vec<u8> = bytes.into_iter().filter(|b| *b != 0).collect();
            if let Ok(code) = String::from_utf8(trimmed) {
                return code;
            }
        }
    }
    currency.to_owned()
}

impl BridgeProvider {
    /// Derives the [BridgeId]: `{locking currency}-{locking account}:{issuing currency}-{issuing account}`,
    /// lower-cased. The locking account is rendered as an XRPL classic address and the issuing account as EVM hex,
    /// so the same bridge yields the same id on either chain. Native-asset bridges use the door accounts, token
    /// bridges the issuers.
    pub fn id(&self) -> Result<BridgeId, AddressError> {
        let c = &self.config;
        let (locking, issuing) = match (&c.locking_chain_issue.issuer, &c.issuing_chain_issue.issuer) {
            (Some(locking_issuer), Some(issuing_issuer))
                if !c.locking_chain_issue.is_native() && !c.issuing_chain_issue.is_native() =>
            {
                (locking_issuer.as_str(), issuing_issuer.as_str())
            }
            _ => (c.locking_chain_door.as_str(), c.issuing_chain_door.as_str()),
        };
        let id = format!(
            "{}-{}:{}-{}",
            normalize_currency(&c.locking_chain_issue.currency),
            address::to_xrpl(locking)?,
            normalize_currency(&c.issuing_chain_issue.currency),
            address::to_evm(issuing)?,
        );
        Ok(BridgeId(id.to_lowercase()))
    }
}

fn accounts_match(a: &str, a_type: ChainType, b: &str, b_type: ChainType) -> bool {
    if a_type == b_type {
        a == b
    } else {
        address::same_account(a, a_type, b, b_type)
    }
}

fn issuers_match(a: &Issue, a_type: ChainType, b: &Issue, b_type: ChainType) -> bool {
    match (&a.issuer, &b.issuer) {
        (Some(x), Some(y)) => accounts_match(x, a_type, y, b_type),
        (None, None) => true,
        _ => false,
    }
}

/// Structural equality of two discoveries of the same bridge: doors and currencies always, issuers only for
/// non-native assets. Accounts are compared exactly between chains of the same type and through address
/// translation otherwise.
pub fn bridges_match(a: &BridgeProvider, b: &BridgeProvider) -> bool {
    let (ac, bc) = (&a.config, &b.config);
    let (at, bt) = (a.chain_type, b.chain_type);

    let doors = accounts_match(&ac.locking_chain_door, at, &bc.locking_chain_door, bt)
        && accounts_match(&ac.issuing_chain_door, at, &bc.issuing_chain_door, bt);
    let currencies = normalize_currency(&ac.locking_chain_issue.currency)
        == normalize_currency(&bc.locking_chain_issue.currency)
        && normalize_currency(&ac.issuing_chain_issue.currency)
            == normalize_currency(&bc.issuing_chain_issue.currency);
    let issuers = ac.locking_chain_issue.is_native()
        || (issuers_match(&ac.locking_chain_issue, at, &bc.locking_chain_issue, bt)
            && issuers_match(&ac.issuing_chain_issue, at, &bc.issuing_chain_issue, bt));

    doors && currencies && issuers
}

#[derive(Debug, Default)]
struct Bridges {
    unpaired: BTreeMap<BridgeId, BridgeProvider>,
    active: BTreeMap<BridgeId, BridgeProvider>,
}

/// The bridges a chain provider has discovered, split into those still waiting for a counterpart on the other chain
/// and those that have been paired and may be acted on.
#[derive(Debug, Default)]
pub struct BridgeRegistry {
    bridges: RwLock<Bridges>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a bridge seen on chain. Already-active bridges are left untouched.
    pub fn discover(&self, bridge: BridgeProvider) -> Result<BridgeId, AddressError> {
        let id = bridge.id()?;
        let mut bridges = self.bridges.write();
        if !bridges.active.contains_key(&id) {
            debug!(%id, "discovered bridge");
            bridges.unpaired.insert(id.clone(), bridge);
        }
        Ok(id)
    }

    pub fn unpaired(&self) -> BTreeMap<BridgeId, BridgeProvider> {
        self.bridges.read().unpaired.clone()
    }

    pub fn active_ids(&self) -> Vec<BridgeId> {
        self.bridges.read().active.keys().cloned().collect()
    }

    pub fn is_active(&self, id: &BridgeId) -> bool {
        self.bridges.read().active.contains_key(id)
    }

    pub fn get(&self, id: &BridgeId) -> Option<BridgeProvider> {
        let bridges = self.bridges.read();
        bridges
            .active
            .get(id)
            .or_else(|| bridges.unpaired.get(id))
            .cloned()
    }

    pub fn asset_precision(&self, id: &BridgeId) -> Option<u32> {
        let bridges = self.bridges.read();
        bridges
            .active
            .get(id)
            .or_else(|| bridges.unpaired.get(id))
            .map(|b| b.asset_precision)
    }

    /// Move a bridge from the unpaired set to the active set. Returns false if it was not unpaired.
    pub fn set_validated(&self, id: &BridgeId) -> bool {
        let mut bridges = self.bridges.write();
        match bridges.unpaired.remove(id) {
            Some(bridge) => {
                bridges.active.insert(id.clone(), bridge);
                true
            }
            None => false,
        }
    }
}

/// Check that every unpaired bridge a provider reports was discovered on a chain of the provider's own type.
fn well_formed(provider: &dyn ChainProvider, bridges: &BTreeMap<BridgeId, BridgeProvider>) -> bool {
    match bridges
        .values()
        .find(|b| b.chain_type != provider.chain_type())
    {
        Some(bridge) => {
            error!(
                chain_id = provider.chain_id(),
                expected = %provider.chain_type(),
                found = %bridge.chain_type,
                "bridge registry holds a bridge of the wrong chain type"
            );
            false
        }
        None => true,
    }
}

/// Pair the unpaired bridges of both chains. Every id present on both sides whose configurations agree in both
/// directions is promoted to active on both providers. Returns false, validating nothing, if either registry is
/// malformed.
pub fn validate_bridges(chains: &Chains) -> bool {
    let main_bridges = chains.main.bridges().unpaired();
    let side_bridges = chains.side.bridges().unpaired();

    if !well_formed(chains.main.as_ref(), &main_bridges)
        || !well_formed(chains.side.as_ref(), &side_bridges)
    {
        return false;
    }

    let mut validated = 0;
    for (id, main_bridge) in &main_bridges {
        let Some(side_bridge) = side_bridges.get(id) else {
            continue;
        };
        if bridges_match(main_bridge, side_bridge) && bridges_match(side_bridge, main_bridge) {
            chains.main.set_bridge_validated(id);
            chains.side.set_bridge_validated(id);
            info!(%id, "bridge validated");
            validated += 1;
        } else {
            debug!(%id, "bridge configurations differ between chains");
        }
    }
    debug!(validated, "bridge validation complete");

    true
}

//! The attestation ledger.
//!
//! Every attestation the witness sends is tracked by `(chain id, block, attestation id)` until the destination chain
//! accepts it. From this the ledger derives, per chain, the highest block below which every tracked attestation has
//! been accepted. Only that high-water mark is persisted: on restart the listener of the opposite chain resumes from
//! it, and any attestation that was still in flight is observed and sent again.

use std::{
    collections::{BTreeMap, HashMap, hash_map::Entry},
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, error, info};

use crate::chain::ChainId;

#[derive(Debug, Default)]
struct Ledger {
    /// chain id -> block -> attestation id -> accepted
    block_attestations: HashMap<ChainId, BTreeMap<u64, HashMap<u64, bool>>>,
    last_attested_blocks: BTreeMap<ChainId, u64>,
}

impl Ledger {
    fn update_last_attested_block(&mut self, chain_id: ChainId) -> u64 {
        let previous = self
            .last_attested_blocks
            .get(&chain_id)
            .copied()
            .unwrap_or(0);
        let Some(blocks) = self.block_attestations.get_mut(&chain_id) else {
            return previous;
        };

        let high_water = blocks
            .iter()
            .take_while(|(_, attestations)| attestations.values().all(|accepted| *accepted))
            .map(|(block, _)| *block)
            .last();
        let Some(high_water) = high_water else {
            return previous;
        };
        let high_water = high_water.max(previous);

        // Everything below the mark is accepted and no longer needed to compute it.
        blocks.retain(|block, _| *block >= high_water);
        self.last_attested_blocks.insert(chain_id, high_water);
        high_water
    }
}

#[derive(Debug)]
pub struct AttestationState {
    path: PathBuf,
    ledger: Mutex<Ledger>,
}

impl AttestationState {
    /// An empty ledger that will be saved to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        AttestationState {
            path: path.into(),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Read the ledger saved at `path`. A missing file is a cold start.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let last_attested_blocks: BTreeMap<ChainId, u64> = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("malformed attestation state in {}", path.display()))?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "no attestation state found, starting from scratch");
                BTreeMap::new()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        info!(?last_attested_blocks, "loaded attestation state");

        Ok(AttestationState {
            path,
            ledger: Mutex::new(Ledger {
                block_attestations: HashMap::new(),
                last_attested_blocks,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start tracking an attestation. Tracking an attestation twice leaves its state untouched. A new attestation at
    /// or below the chain's high-water mark pulls the mark back below its block.
    pub fn add_attestation(&self, chain_id: ChainId, block: u64, id: u64) {
        let mut ledger = self.ledger.lock();
        let Entry::Vacant(entry) = ledger
            .block_attestations
            .entry(chain_id)
            .or_default()
            .entry(block)
            .or_default()
            .entry(id)
        else {
            return;
        };
        entry.insert(false);

        if let Some(mark) = ledger.last_attested_blocks.get_mut(&chain_id) {
            if block <= *mark {
                debug!(chain_id, block, previous = *mark, "late attestation lowers the high-water mark");
                *mark = block.saturating_sub(1);
            }
        }
    }

    /// Mark a tracked attestation as accepted and advance the chain's high-water mark. Returns whether the
    /// attestation was tracked and not yet accepted; untracked attestations are ignored.
    pub fn set_attested(&self, chain_id: ChainId, block: u64, id: u64) -> bool {
        let mut ledger = self.ledger.lock();
        let Some(accepted) = ledger
            .block_attestations
            .get_mut(&chain_id)
            .and_then(|blocks| blocks.get_mut(&block))
            .and_then(|attestations| attestations.get_mut(&id))
        else {
            debug!(chain_id, block, id, "ignoring acceptance of untracked attestation");
            return false;
        };
        if *accepted {
            return false;
        }
        *accepted = true;
        let last = ledger.update_last_attested_block(chain_id);
        debug!(chain_id, block, id, last, "attestation accepted");
        true
    }

    /// Whether a tracked attestation has been accepted, or `None` if it is not tracked.
    pub fn attestation(&self, chain_id: ChainId, block: u64, id: u64) -> Option<bool> {
        self.ledger
            .lock()
            .block_attestations
            .get(&chain_id)?
            .get(&block)?
            .get(&id)
            .copied()
    }

    /// Recompute and return the high-water mark of `chain_id`.
    pub fn update_last_attested_blocks(&self, chain_id: ChainId) -> u64 {
        self.ledger.lock().update_last_attested_block(chain_id)
    }

    pub fn last_attested_block(&self, chain_id: ChainId) -> Option<u64> {
        self.ledger
            .lock()
            .last_attested_blocks
            .get(&chain_id)
            .copied()
    }

    /// Write the high-water marks to disk, replacing the previous file atomically.
    pub fn save(&self) -> Result<()> {
        let contents = serde_json::to_vec(&self.ledger.lock().last_attested_blocks)?;
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(&contents)?;
        file.as_file().sync_all()?;
        file.persist(&self.path)?;
        Ok(())
    }

    /// Save the ledger every `period` for the lifetime of the process.
    pub async fn run_saver(self: Arc<Self>, period: Duration) -> Result<()> {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            match self.save() {
                Ok(()) => debug!(path = %self.path.display(), "saved attestation state"),
                Err(e) => error!(path = %self.path.display(), "failed to save attestation state: {e:?}"),
            }
        }
    }
}

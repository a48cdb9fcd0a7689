//! Periodic discovery and pairing of bridges on both chains.

use std::time::Duration;

use anyhow::Result;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, warn};

use crate::{
    bridge::validate_bridges,
    chain::{ChainProvider, Chains},
    listener::FIRST_TICK_DELAY,
};

/// Scan one chain for bridge objects up to its current height and advance its discovery cursor.
pub async fn fetch_bridges(provider: &dyn ChainProvider) -> Result<()> {
    let height = provider.block_height().await?;
    if height == 0 {
        anyhow::bail!("chain {} reports no blocks", provider.chain_id());
    }
    provider.fetch_new_bridges(height).await?;
    provider.set_new_bridges_block_number(height + 1);
    Ok(())
}

/// One discovery pass over both chains followed by pairing. A chain that cannot be scanned keeps its cursor and only
/// delays pairing of its new bridges; the result is that of [validate_bridges].
pub async fn discover(chains: &Chains) -> bool {
    for provider in [&chains.main, &chains.side] {
        if let Err(e) = fetch_bridges(provider.as_ref()).await {
            warn!(chain_id = provider.chain_id(), "failed to fetch new bridges: {e:?}");
        }
    }
    validate_bridges(chains)
}

/// Run [discover] every `period`, the first time after [FIRST_TICK_DELAY].
pub async fn run_discovery(chains: Chains, period: Duration) -> Result<()> {
    tokio::time::sleep(FIRST_TICK_DELAY).await;
    let mut interval = tokio::time::interval_at(Instant::now(), period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if !discover(&chains).await {
            error!("bridge registries are inconsistent, no bridges were paired");
        }
    }
}

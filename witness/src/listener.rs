//! Periodic scanning of both chains for new commits and account creates.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinSet,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, trace};

use crate::chain::{ChainEvent, ChainSide, Chains};

pub const LISTENER_QUEUE_CAPACITY: usize = 5;

/// Workers draining the tick queue. Ticks of different chains may be handled concurrently.
pub const LISTENER_WORKERS: usize = 2;

/// Delay before the first scan after start-up.
pub const FIRST_TICK_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The node reported no usable height.
    Unavailable,
    /// One of the scans failed; the cursor was left in place so the whole range is scanned again next tick.
    Incomplete,
    Fetched { to_block: u64, events: usize },
}

/// Scans each chain and feeds what it finds into the pipeline attesting on the other chain.
#[derive(Debug)]
pub struct Listener {
    chains: Chains,
    /// Events seen on the main chain, attested on the side chain.
    into_side: mpsc::Sender<ChainEvent>,
    /// Events seen on the side chain, attested on the main chain.
    into_main: mpsc::Sender<ChainEvent>,
    main_scan: Mutex<()>,
    side_scan: Mutex<()>,
}

impl Listener {
    pub fn new(
        chains: Chains,
        into_side: mpsc::Sender<ChainEvent>,
        into_main: mpsc::Sender<ChainEvent>,
    ) -> Self {
        Listener {
            chains,
            into_side,
            into_main,
            main_scan: Mutex::new(()),
            side_scan: Mutex::new(()),
        }
    }

    /// Scan `side` from its cursor to its current height. The cursor only moves once both scans have succeeded.
    pub async fn fetch(&self, side: ChainSide) -> Result<FetchOutcome> {
        let _scan = match side {
            ChainSide::Main => self.main_scan.lock().await,
            ChainSide::Side => self.side_scan.lock().await,
        };
        let provider = self.chains.get(side);
        let chain_id = provider.chain_id();

        let height = match provider.block_height().await {
            Ok(0) => {
                debug!(chain_id, "node reports no blocks, skipping scan");
                return Ok(FetchOutcome::Unavailable);
            }
            Err(e) => {
                debug!(chain_id, "block height unavailable, skipping scan: {e:?}");
                return Ok(FetchOutcome::Unavailable);
            }
            Ok(height) => height,
        };

        let (commits, creates) = match (
            provider.get_new_commits(height).await,
            provider.get_new_account_creates(height).await,
        ) {
            (Ok(commits), Ok(creates)) => (commits, creates),
            (commits, creates) => {
                debug!(
                    chain_id,
                    height,
                    commits = ?commits.err(),
                    creates = ?creates.err(),
                    "scan failed, retrying next tick"
                );
                return Ok(FetchOutcome::Incomplete);
            }
        };
        provider.set_current_block_number(height + 1);

        let queue = match side {
            ChainSide::Main => &self.into_side,
            ChainSide::Side => &self.into_main,
        };
        let events = commits.len() + creates.len();
        if events > 0 {
            info!(chain_id, to_block = height, events, "found bridge events");
        }
        for event in commits
            .into_iter()
            .map(ChainEvent::Commit)
            .chain(creates.into_iter().map(ChainEvent::AccountCreate))
        {
            queue
                .send(event)
                .await
                .map_err(|_| anyhow!("attestation queue for events from {side} is closed"))?;
        }
        Ok(FetchOutcome::Fetched {
            to_block: height,
            events,
        })
    }

    /// Tick both chains every `period`, the first time after [FIRST_TICK_DELAY].
    pub async fn run(self: Arc<Self>, period: Duration) -> Result<()> {
        let (ticks, tick_rx) = mpsc::channel(LISTENER_QUEUE_CAPACITY);
        let tick_rx = Arc::new(Mutex::new(tick_rx));

        let mut workers = JoinSet::new();
        for _ in 0..LISTENER_WORKERS {
            let listener = self.clone();
            let tick_rx = tick_rx.clone();
            workers.spawn(async move {
                loop {
                    let Some(side) = tick_rx.lock().await.recv().await else {
                        return Ok::<_, anyhow::Error>(());
                    };
                    let outcome = listener.fetch(side).await?;
                    trace!(%side, ?outcome, "listener tick");
                }
            });
        }

        tokio::select! {
            result = tick(ticks, period) => result,
            Some(result) = workers.join_next() => result?,
        }
    }
}

async fn tick(ticks: mpsc::Sender<ChainSide>, period: Duration) -> Result<()> {
    tokio::time::sleep(FIRST_TICK_DELAY).await;
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        for side in [ChainSide::Main, ChainSide::Side] {
            ticks
                .send(side)
                .await
                .map_err(|_| anyhow!("listener workers have stopped"))?;
        }
        interval.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bridge::BridgeId,
        chain::{AccountCreate, ChainProvider, Commit},
        test_util::{MockChainProvider, bridged_pair},
    };

    fn commit(bridge_id: &BridgeId, block: u64) -> Commit {
        Commit {
            block,
            claim_id: block,
            sender: "sender".to_owned(),
            amount: "1".to_owned(),
            destination: Some("destination".to_owned()),
            bridge_id: bridge_id.clone(),
        }
    }

    struct Harness {
        main: Arc<MockChainProvider>,
        side: Arc<MockChainProvider>,
        bridge_id: BridgeId,
        listener: Arc<Listener>,
        into_side: mpsc::Receiver<ChainEvent>,
        into_main: mpsc::Receiver<ChainEvent>,
    }

    fn harness() -> Harness {
        let (main, side, bridge_id) = bridged_pair(1, 2);
        let (into_side_tx, into_side) = mpsc::channel(100);
        let (into_main_tx, into_main) = mpsc::channel(100);
        let listener = Arc::new(Listener::new(
            Chains::new(main.clone(), side.clone()),
            into_side_tx,
            into_main_tx,
        ));
        Harness {
            main,
            side,
            bridge_id,
            listener,
            into_side,
            into_main,
        }
    }

    #[witness_macros::test(start_paused)]
    async fn events_are_routed_to_the_other_chain() {
        let mut h = harness();
        h.main.set_height(120);
        h.main.add_commit(commit(&h.bridge_id, 110));
        h.main.add_account_create(AccountCreate {
            block: 115,
            sender: "sender".to_owned(),
            amount: "10".to_owned(),
            destination: "destination".to_owned(),
            signature_reward: "1".to_owned(),
            bridge_id: h.bridge_id.clone(),
        });
        h.side.set_height(40);
        h.side.add_commit(commit(&h.bridge_id, 30));

        let outcome = h.listener.fetch(ChainSide::Main).await.unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Fetched {
                to_block: 120,
                events: 2
            }
        );
        assert_eq!(h.main.current_block_number(), 121);
        assert_eq!(h.into_side.recv().await.unwrap().block(), 110);
        assert_eq!(h.into_side.recv().await.unwrap().kind(), "account_create");

        h.listener.fetch(ChainSide::Side).await.unwrap();
        assert_eq!(h.into_main.recv().await.unwrap().block(), 30);
        assert!(h.into_side.try_recv().is_err());
    }

    #[witness_macros::test(start_paused)]
    async fn zero_height_skips_the_tick() {
        let h = harness();
        h.main.set_current_block_number(50);

        assert_eq!(
            h.listener.fetch(ChainSide::Main).await.unwrap(),
            FetchOutcome::Unavailable
        );
        assert_eq!(h.main.current_block_number(), 50);
        assert_eq!(h.main.calls("get_new_commits"), 0);
    }

    #[witness_macros::test(start_paused)]
    async fn failed_scan_is_retried_from_the_same_cursor() {
        let mut h = harness();
        h.main.set_current_block_number(100);
        h.main.set_height(120);
        h.main.add_commit(commit(&h.bridge_id, 105));
        h.main.fail("get_new_account_creates");

        assert_eq!(
            h.listener.fetch(ChainSide::Main).await.unwrap(),
            FetchOutcome::Incomplete
        );
        assert_eq!(h.main.current_block_number(), 100);
        assert!(h.into_side.try_recv().is_err());

        h.main.recover("get_new_account_creates");
        h.listener.fetch(ChainSide::Main).await.unwrap();
        assert_eq!(h.main.current_block_number(), 121);
        assert_eq!(h.into_side.recv().await.unwrap().block(), 105);
    }

    #[witness_macros::test(start_paused)]
    async fn ticks_start_after_a_second_and_repeat() {
        let mut h = harness();
        h.main.set_height(10);
        h.main.add_commit(commit(&h.bridge_id, 5));
        h.side.set_height(10);
        tokio::spawn(h.listener.clone().run(Duration::from_secs(5)));

        let start = Instant::now();
        assert_eq!(h.into_side.recv().await.unwrap().block(), 5);
        assert_eq!(start.elapsed(), FIRST_TICK_DELAY);

        h.main.add_commit(commit(&h.bridge_id, 12));
        h.main.set_height(20);
        assert_eq!(h.into_side.recv().await.unwrap().block(), 12);
        assert_eq!(start.elapsed(), FIRST_TICK_DELAY + Duration::from_secs(5));
        assert!(h.main.calls("block_height") >= 2);
        assert!(h.side.calls("block_height") >= 1);
    }
}

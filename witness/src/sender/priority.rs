use std::{cmp::Ordering, collections::BinaryHeap};

use anyhow::{Result, anyhow};
use tokio::{select, sync::mpsc};
use tracing::trace;

use super::BroadcastItem;

/// A wrapper for [BroadcastItem], stored in the reordering heap. The [Ord] implementation is reversed on the nonce,
/// so the heap yields the lowest nonce first; items with equal nonces leave in arrival order.
struct ByNonce {
    nonce: u64,
    sequence: u64,
    item: BroadcastItem,
}

impl PartialEq for ByNonce {
    fn eq(&self, other: &Self) -> bool {
        self.nonce == other.nonce && self.sequence == other.sequence
    }
}

impl Eq for ByNonce {}

impl PartialOrd for ByNonce {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByNonce {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.nonce, other.sequence).cmp(&(self.nonce, self.sequence))
    }
}

/// Reorder items by nonce between `inbound` and `outbound`.
///
/// The actor holds one item ready to be offered downstream. Every arrival is pushed onto the heap together with the
/// held item, and the minimum becomes the new held item. Arrivals are always taken before the held item is offered,
/// so whatever leaves next is the lowest nonce among everything buffered.
pub async fn run_reorder(
    mut inbound: mpsc::Receiver<BroadcastItem>,
    outbound: mpsc::Sender<BroadcastItem>,
) -> Result<()> {
    let mut heap = BinaryHeap::new();
    let mut held: Option<ByNonce> = None;
    let mut sequence = 0u64;

    loop {
        select! {
            biased;
            item = inbound.recv() => {
                let Some(item) = item else {
                    break;
                };
                sequence += 1;
                trace!(nonce = item.nonce, buffered = heap.len(), "reordering");
                if let Some(previous) = held.take() {
                    heap.push(previous);
                }
                heap.push(ByNonce {
                    nonce: item.nonce,
                    sequence,
                    item,
                });
                held = heap.pop();
            }
            permit = outbound.reserve(), if held.is_some() => {
                let permit = permit.map_err(|_| anyhow!("broadcast queue is closed"))?;
                if let Some(next) = held.take() {
                    permit.send(next.item);
                }
                held = heap.pop();
            }
        }
    }

    // Inbound is closed: flush what is left, still in nonce order.
    while let Some(next) = held.take().or_else(|| heap.pop()) {
        outbound
            .send(next.item)
            .await
            .map_err(|_| anyhow!("broadcast queue is closed"))?;
    }
    Ok(())
}

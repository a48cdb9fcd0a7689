//! Delayed re-delivery of work items.
//!
//! Every stage that backs off (an RPC that was unavailable, a transaction that needs another broadcast, a status that
//! needs polling again) hands the item to a [RetryQueue] together with a delay. One worker task per queue holds all
//! pending items in a deadline-ordered heap and forwards each into the target stage's mailbox once it is due.

use std::{cmp::Ordering, collections::BinaryHeap, time::Duration};

use anyhow::{Result, anyhow};
use tokio::{
    select,
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tracing::trace;

/// Handle for scheduling re-deliveries. Cheap to clone.
#[derive(Debug)]
pub struct RetryQueue<T> {
    class: &'static str,
    sender: mpsc::Sender<(Duration, T)>,
}

impl<T> Clone for RetryQueue<T> {
    fn clone(&self) -> Self {
        RetryQueue {
            class: self.class,
            sender: self.sender.clone(),
        }
    }
}

impl<T: Send + 'static> RetryQueue<T> {
    /// Create a queue that delivers into `target`, holding at most `capacity` pending items. Callers of
    /// [RetryQueue::resend] wait while the queue is full. The returned worker must be run for items to be delivered.
    pub fn new(
        class: &'static str,
        target: mpsc::Sender<T>,
        capacity: usize,
    ) -> (RetryQueue<T>, RetryWorker<T>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            RetryQueue { class, sender },
            RetryWorker {
                class,
                receiver,
                target,
                capacity: capacity.max(1),
                pending: BinaryHeap::new(),
                sequence: 0,
            },
        )
    }

    /// Deliver `item` to the target after `delay`.
    pub async fn resend(&self, item: T, delay: Duration) -> Result<()> {
        self.sender
            .send((delay, item))
            .await
            .map_err(|_| anyhow!("{} retry queue is closed", self.class))
    }
}

struct Pending<T> {
    due: Instant,
    /// Tie-breaker so items due at the same instant leave in the order they arrived.
    sequence: u64,
    item: T,
}

impl<T> PartialEq for Pending<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl<T> Eq for Pending<T> {}

impl<T> PartialOrd for Pending<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reversed, so the earliest deadline is at the top of the max-heap.
impl<T> Ord for Pending<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.sequence).cmp(&(self.due, self.sequence))
    }
}

pub struct RetryWorker<T> {
    class: &'static str,
    receiver: mpsc::Receiver<(Duration, T)>,
    target: mpsc::Sender<T>,
    capacity: usize,
    pending: BinaryHeap<Pending<T>>,
    sequence: u64,
}

impl<T: Send + 'static> RetryWorker<T> {
    /// Runs until every [RetryQueue] handle is dropped and nothing is pending, or the target closes.
    pub async fn run(mut self) -> Result<()> {
        let mut open = true;
        loop {
            let next_due = self.pending.peek().map(|p| p.due);
            if !open && next_due.is_none() {
                return Ok(());
            }
            let now = Instant::now();
            let due_now = next_due.is_some_and(|due| due <= now);

            select! {
                biased;
                permit = self.target.reserve(), if due_now => {
                    let permit = permit.map_err(|_| anyhow!("{} retry target is closed", self.class))?;
                    if let Some(Pending { item, .. }) = self.pending.pop() {
                        trace!(class = self.class, "redelivering item");
                        permit.send(item);
                    }
                }
                message = self.receiver.recv(), if open && self.pending.len() < self.capacity => {
                    match message {
                        Some((delay, item)) => {
                            self.sequence += 1;
                            self.pending.push(Pending {
                                due: Instant::now() + delay,
                                sequence: self.sequence,
                                item,
                            });
                        }
                        None => open = false,
                    }
                }
                _ = sleep_until(next_due.unwrap_or(now)), if next_due.is_some() && !due_now => {}
            }
        }
    }
}

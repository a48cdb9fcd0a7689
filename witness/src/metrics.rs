use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};

/// Counters exported by the witness. Without a configured meter provider these are no-ops.
#[derive(Debug, Clone)]
pub struct Metrics {
    attestations_dispatched: Counter<u64>,
    events_dropped: Counter<u64>,
    broadcasts: Counter<u64>,
    attestations_accepted: Counter<u64>,
    transactions_failed: Counter<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new(&opentelemetry::global::meter("witness"))
    }
}

impl Metrics {
    pub fn new(meter: &Meter) -> Self {
        Metrics {
            attestations_dispatched: meter
                .u64_counter("witness.attestations.dispatched")
                .with_description("Attestation transactions handed to the sender")
                .build(),
            events_dropped: meter
                .u64_counter("witness.events.dropped")
                .with_description("Chain events that required no attestation")
                .build(),
            broadcasts: meter
                .u64_counter("witness.broadcasts")
                .with_description("Broadcast attempts by outcome")
                .build(),
            attestations_accepted: meter
                .u64_counter("witness.attestations.accepted")
                .with_description("Attestations accepted by the destination chain")
                .build(),
            transactions_failed: meter
                .u64_counter("witness.transactions.failed")
                .with_description("Transactions the destination chain confirmed as failed")
                .build(),
        }
    }

    pub fn dispatched(&self, chain_id: u64, kind: &'static str) {
        self.attestations_dispatched.add(
            1,
            &[
                KeyValue::new("chain_id", chain_id as i64),
                KeyValue::new("kind", kind),
            ],
        );
    }

    pub fn dropped(&self, chain_id: u64, reason: &'static str) {
        self.events_dropped.add(
            1,
            &[
                KeyValue::new("chain_id", chain_id as i64),
                KeyValue::new("reason", reason),
            ],
        );
    }

    pub fn broadcast(&self, chain_id: u64, outcome: &'static str) {
        self.broadcasts.add(
            1,
            &[
                KeyValue::new("chain_id", chain_id as i64),
                KeyValue::new("outcome", outcome),
            ],
        );
    }

    pub fn accepted(&self, chain_id: u64) {
        self.attestations_accepted
            .add(1, &[KeyValue::new("chain_id", chain_id as i64)]);
    }

    pub fn failed(&self, chain_id: u64) {
        self.transactions_failed
            .add(1, &[KeyValue::new("chain_id", chain_id as i64)]);
    }
}

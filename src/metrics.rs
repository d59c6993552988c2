//! Engine metrics in Prometheus format

use crate::types::{TransferKind, Wei, WEI_PER_ETHER};
use prometheus::{CounterVec, Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Counters for one engine instance, kept in their own registry
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    pub tokens_sold: IntCounter,
    pub guesses_accepted: IntCounter,
    pub rejected_operations: IntCounterVec,
    pub transfers_completed: IntCounterVec,
    pub transfer_failures: IntCounterVec,
    pub value_transferred: CounterVec,
    pub rounds_settled: IntCounter,
    pub current_round: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("lottery".to_string()), None)?;

        let tokens_sold = IntCounter::new("tokens_sold_total", "Tokens credited to accounts")?;
        let guesses_accepted = IntCounter::new("guesses_accepted_total", "Guesses recorded")?;
        let rejected_operations = IntCounterVec::new(
            Opts::new("rejected_operations_total", "Operations rejected, by error kind"),
            &["operation", "kind"],
        )?;
        let transfers_completed = IntCounterVec::new(
            Opts::new("transfers_completed_total", "Value transfers completed, by kind"),
            &["kind"],
        )?;
        let transfer_failures = IntCounterVec::new(
            Opts::new("transfer_failures_total", "Value transfers that failed, by kind"),
            &["kind"],
        )?;
        let value_transferred = CounterVec::new(
            Opts::new("value_transferred_ether_total", "Value moved by completed transfers in ether, by kind"),
            &["kind"],
        )?;
        let rounds_settled = IntCounter::new("rounds_settled_total", "Rounds moved to settled")?;
        let current_round = IntGauge::new("current_round", "Identifier of the current round")?;

        registry.register(Box::new(tokens_sold.clone()))?;
        registry.register(Box::new(guesses_accepted.clone()))?;
        registry.register(Box::new(rejected_operations.clone()))?;
        registry.register(Box::new(transfers_completed.clone()))?;
        registry.register(Box::new(transfer_failures.clone()))?;
        registry.register(Box::new(value_transferred.clone()))?;
        registry.register(Box::new(rounds_settled.clone()))?;
        registry.register(Box::new(current_round.clone()))?;

        Ok(Self {
            registry,
            tokens_sold,
            guesses_accepted,
            rejected_operations,
            transfers_completed,
            transfer_failures,
            value_transferred,
            rounds_settled,
            current_round,
        })
    }

    pub fn record_rejection(&self, operation: &str, kind: &str) {
        self.rejected_operations.with_label_values(&[operation, kind]).inc();
    }

    pub fn record_transfer(&self, kind: TransferKind, amount: Wei) {
        let label = kind.to_string();
        self.transfers_completed.with_label_values(&[label.as_str()]).inc();
        // f64 loses sub-gwei precision on large sums; the ledger records stay exact.
        self.value_transferred
            .with_label_values(&[label.as_str()])
            .inc_by(amount as f64 / WEI_PER_ETHER as f64);
    }

    pub fn record_transfer_failure(&self, kind: TransferKind) {
        let label = kind.to_string();
        self.transfer_failures.with_label_values(&[label.as_str()]).inc();
    }

    /// Render every metric in the text exposition format
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

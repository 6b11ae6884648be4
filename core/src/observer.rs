use crate::transfer::Transfer;

/// Lifecycle delegate for a transfer. Every method is invoked synchronously
/// from the engine's control thread, never from a chunk worker, so callback
/// ordering is deterministic.
pub trait TransferObserver: Send + Sync {
    fn on_started(&self, _transfer: &Transfer, _eta_millis: i64, _bytes_per_second: u64) {}

    fn on_progress(&self, _transfer: &Transfer, _eta_millis: i64, _bytes_per_second: u64) {}

    fn on_complete(&self, _transfer: &Transfer) {}

    fn on_error(&self, _transfer: &Transfer) {}

    /// Hook for durable persistence of transfer-level state, distinct from
    /// the chunk resume markers the engine owns itself.
    fn save_progress(&self, _transfer: &Transfer) {}
}

/// Observer that ignores every callback.
#[derive(Debug, Clone, Default)]
pub struct NoopObserver;

impl TransferObserver for NoopObserver {}

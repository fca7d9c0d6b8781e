use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::adapter::Usage;
use crate::error::RelayError;

/// Reserves and settles quota against user balances.
///
/// Contract: `reserve` and its matching `settle`/`refund` are totally
/// ordered per request, and every successful `reserve` sees exactly one
/// terminal call. The orchestrator enforces the latter through
/// [`Reservation`].
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Returns `(reserved_amount, prior_balance)`.
    async fn reserve(&self, user_id: i64, amount: i64) -> Result<(i64, i64), RelayError>;

    /// Adjusts the balance by `reserved - actual` (positive = refund).
    async fn settle(&self, user_id: i64, reserved: i64, actual: i64) -> Result<(), RelayError>;

    async fn refund(&self, user_id: i64, reserved: i64) -> Result<(), RelayError> {
        self.settle(user_id, reserved, 0).await
    }

    async fn balance(&self, user_id: i64) -> Option<i64>;
}

/// In-memory ledger with one async mutex per user row, so concurrent
/// reservations for the same user serialize while different users never
/// contend.
#[derive(Default)]
pub struct MemoryLedger {
    rows: RwLock<HashMap<i64, Arc<Mutex<i64>>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn credit_user(&self, user_id: i64, balance: i64) {
        let row = self.row(user_id).await;
        let mut guard = row.lock().await;
        *guard = balance;
    }

    async fn row(&self, user_id: i64) -> Arc<Mutex<i64>> {
        if let Some(row) = self.rows.read().await.get(&user_id) {
            return row.clone();
        }
        let mut rows = self.rows.write().await;
        rows.entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .clone()
    }

    async fn existing_row(&self, user_id: i64) -> Option<Arc<Mutex<i64>>> {
        self.rows.read().await.get(&user_id).cloned()
    }
}

#[async_trait]
impl QuotaLedger for MemoryLedger {
    async fn reserve(&self, user_id: i64, amount: i64) -> Result<(i64, i64), RelayError> {
        let Some(row) = self.existing_row(user_id).await else {
            return Err(RelayError::QuotaInsufficient {
                needed: amount,
                balance: 0,
            });
        };
        let mut balance = row.lock().await;
        if *balance < amount {
            return Err(RelayError::QuotaInsufficient {
                needed: amount,
                balance: *balance,
            });
        }
        let prior = *balance;
        *balance -= amount;
        Ok((amount, prior))
    }

    async fn settle(&self, user_id: i64, reserved: i64, actual: i64) -> Result<(), RelayError> {
        let Some(row) = self.existing_row(user_id).await else {
            return Err(RelayError::PriceFailed(format!(
                "settle for unknown user {user_id}"
            )));
        };
        let mut balance = row.lock().await;
        *balance += reserved - actual;
        Ok(())
    }

    async fn balance(&self, user_id: i64) -> Option<i64> {
        let row = self.existing_row(user_id).await?;
        let balance = row.lock().await;
        Some(*balance)
    }
}

/// Scoped reservation: commits through [`Reservation::settle`] or rolls back
/// through [`Reservation::refund`]. Dropping an armed reservation fires the
/// refund on a spawned task and logs it, so no exit path can leak quota.
pub struct Reservation {
    ledger: Arc<dyn QuotaLedger>,
    user_id: i64,
    reserved: i64,
    trace_id: String,
    armed: bool,
}

impl Reservation {
    pub fn new(
        ledger: Arc<dyn QuotaLedger>,
        user_id: i64,
        reserved: i64,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            user_id,
            reserved,
            trace_id: trace_id.into(),
            armed: true,
        }
    }

    pub fn reserved(&self) -> i64 {
        self.reserved
    }

    pub async fn settle(mut self, actual: i64) -> Result<(), RelayError> {
        self.armed = false;
        self.ledger
            .settle(self.user_id, self.reserved, actual)
            .await
    }

    pub async fn refund(mut self) -> Result<(), RelayError> {
        self.armed = false;
        self.ledger.refund(self.user_id, self.reserved).await
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(
            event = "reservation_leaked",
            trace_id = %self.trace_id,
            user_id = self.user_id,
            reserved = self.reserved,
        );
        let ledger = self.ledger.clone();
        let user_id = self.user_id;
        let reserved = self.reserved;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = ledger.refund(user_id, reserved).await;
            });
        }
    }
}

/// One settled request, as written to the usage log.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub trace_id: String,
    pub user_id: i64,
    pub key_id: i64,
    pub channel_id: i64,
    pub model: String,
    pub usage: Usage,
    pub quota: i64,
    pub is_stream: bool,
    pub elapsed_ms: u128,
}

/// Write-only usage log consumer.
pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

pub type SharedUsageSink = Arc<dyn UsageSink>;

/// Default sink: emits the record as a structured log line.
pub struct LogUsageSink;

impl UsageSink for LogUsageSink {
    fn record(&self, record: UsageRecord) {
        tracing::info!(
            event = "usage_recorded",
            trace_id = %record.trace_id,
            user_id = record.user_id,
            key_id = record.key_id,
            channel_id = record.channel_id,
            model = %record.model,
            prompt_tokens = record.usage.prompt_tokens,
            completion_tokens = record.usage.completion_tokens,
            total_tokens = record.usage.total_tokens,
            quota = record.quota,
            is_stream = record.is_stream,
            elapsed_ms = record.elapsed_ms,
        );
    }
}

pub struct NoopUsageSink;

impl UsageSink for NoopUsageSink {
    fn record(&self, _record: UsageRecord) {}
}

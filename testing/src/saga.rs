//! In-memory saga log.

use crate::lock;
use async_trait::async_trait;
use boxoffice_core::ids::CheckoutId;
use boxoffice_core::saga::{SagaLog, SagaLogError, SagaProgress, SagaRecord, SagaStep};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Saga streams in a `HashMap`, with the same version checks as the
/// `PostgreSQL` log.
#[derive(Debug, Clone, Default)]
pub struct InMemorySagaLog {
    streams: Arc<Mutex<HashMap<CheckoutId, Vec<SagaRecord>>>>,
    append_failures: Arc<AtomicUsize>,
    failing_step: Arc<Mutex<Option<&'static str>>>,
}

impl InMemorySagaLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` appends with [`SagaLogError::Database`].
    pub fn fail_next_append(&self, count: usize) {
        self.append_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next append that carries a step of `step_type`.
    pub fn fail_append_of(&self, step_type: &'static str) {
        *lock(&self.failing_step) = Some(step_type);
    }

    /// Steps of a stream (for assertions).
    #[must_use]
    pub fn steps(&self, checkout_id: CheckoutId) -> Vec<SagaStep> {
        lock(&self.streams)
            .get(&checkout_id)
            .map(|records| records.iter().map(|record| record.step.clone()).collect())
            .unwrap_or_default()
    }

    /// Step type tags of a stream (for assertions).
    #[must_use]
    pub fn step_types(&self, checkout_id: CheckoutId) -> Vec<&'static str> {
        self.steps(checkout_id)
            .iter()
            .map(SagaStep::step_type)
            .collect()
    }
}

#[async_trait]
impl SagaLog for InMemorySagaLog {
    async fn append(
        &self,
        checkout_id: CheckoutId,
        expected_version: u64,
        steps: Vec<SagaStep>,
        at: DateTime<Utc>,
    ) -> Result<u64, SagaLogError> {
        let injected = self
            .append_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SagaLogError::Database("injected append failure".to_string()));
        }
        {
            let mut failing = lock(&self.failing_step);
            if let Some(step_type) = *failing {
                if steps.iter().any(|step| step.step_type() == step_type) {
                    *failing = None;
                    return Err(SagaLogError::Database(format!(
                        "injected failure appending {step_type}"
                    )));
                }
            }
        }

        let mut streams = lock(&self.streams);
        let stream = streams.entry(checkout_id).or_default();
        let actual = stream.last().map_or(0, |record| record.version);
        if actual != expected_version {
            return Err(SagaLogError::ConcurrencyConflict {
                checkout_id,
                expected: expected_version,
                actual,
            });
        }

        let mut version = actual;
        for step in steps {
            version += 1;
            stream.push(SagaRecord {
                checkout_id,
                version,
                step,
                recorded_at: at,
            });
        }
        Ok(version)
    }

    async fn load(&self, checkout_id: CheckoutId) -> Result<Vec<SagaRecord>, SagaLogError> {
        Ok(lock(&self.streams)
            .get(&checkout_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn stalled(
        &self,
        idle_since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CheckoutId>, SagaLogError> {
        let streams = lock(&self.streams);
        let mut stalled: Vec<(DateTime<Utc>, CheckoutId)> = streams
            .iter()
            .filter_map(|(checkout_id, records)| {
                let progress = SagaProgress::from_records(records);
                let last = progress.last_recorded_at?;
                let stalled = !progress.is_closed()
                    && records
                        .iter()
                        .any(|r| matches!(r.step, SagaStep::BookingRequested { .. }))
                    && last < idle_since;
                stalled.then_some((last, *checkout_id))
            })
            .collect();
        stalled.sort();
        Ok(stalled
            .into_iter()
            .take(limit)
            .map(|(_, checkout_id)| checkout_id)
            .collect())
    }
}

//! Saga stream cursor.

use boxoffice_core::ids::CheckoutId;
use boxoffice_core::saga::{SagaLog, SagaLogError, SagaProgress, SagaStep};
use chrono::{DateTime, Utc};

/// A loaded saga stream that appends at its own version.
///
/// Every append expects the version this cursor last saw, so a writer that
/// raced another one gets [`SagaLogError::ConcurrencyConflict`] and must stop.
#[derive(Debug, Clone)]
pub(crate) struct SagaCursor {
    checkout_id: CheckoutId,
    progress: SagaProgress,
}

impl SagaCursor {
    pub(crate) async fn load(
        log: &dyn SagaLog,
        checkout_id: CheckoutId,
    ) -> Result<Self, SagaLogError> {
        let records = log.load(checkout_id).await?;
        Ok(Self {
            checkout_id,
            progress: SagaProgress::from_records(&records),
        })
    }

    /// Cursor for a stream that does not exist yet.
    pub(crate) fn fresh(checkout_id: CheckoutId) -> Self {
        Self {
            checkout_id,
            progress: SagaProgress::default(),
        }
    }

    pub(crate) const fn progress(&self) -> &SagaProgress {
        &self.progress
    }

    pub(crate) async fn append(
        &mut self,
        log: &dyn SagaLog,
        steps: Vec<SagaStep>,
        at: DateTime<Utc>,
    ) -> Result<(), SagaLogError> {
        let version = log
            .append(self.checkout_id, self.progress.version, steps.clone(), at)
            .await?;
        for step in &steps {
            self.progress.apply(step);
        }
        self.progress.version = version;
        self.progress.last_recorded_at = Some(at);
        tracing::debug!(
            checkout_id = %self.checkout_id,
            version,
            steps = ?steps.iter().map(SagaStep::step_type).collect::<Vec<_>>(),
            "Saga steps appended"
        );
        Ok(())
    }

    /// Append, logging instead of failing. Used for steps that only
    /// document a compensation already performed.
    pub(crate) async fn append_or_warn(
        &mut self,
        log: &dyn SagaLog,
        steps: Vec<SagaStep>,
        at: DateTime<Utc>,
    ) {
        if let Err(e) = self.append(log, steps, at).await {
            tracing::warn!(
                checkout_id = %self.checkout_id,
                error = %e,
                "Failed to record saga steps"
            );
        }
    }
}

use tracing::warn;

use crate::models::{EntryFailure, SubmissionBatch};
use crate::store::AttendanceStore;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSummary {
    pub applied: usize,
    pub failed: Vec<EntryFailure>,
}

/// Writes every mark in the batch to `history[date][period]`.
///
/// Each entry is upserted on its own: a failing student is reported in the
/// summary and the remaining students are still written.
pub async fn record<S>(store: &S, batch: &SubmissionBatch) -> RecordSummary
where
    S: AttendanceStore + ?Sized,
{
    let mut summary = RecordSummary::default();

    for entry in &batch.entries {
        let result = store
            .upsert(
                &batch.section,
                &entry.student_id,
                batch.date,
                batch.period,
                batch.period_record(entry.present),
            )
            .await;

        match result {
            Ok(()) => summary.applied += 1,
            Err(err) => {
                warn!(
                    section = %batch.section,
                    student_id = %entry.student_id,
                    date = %batch.date,
                    period = batch.period,
                    error = %err,
                    "failed to record attendance mark"
                );
                summary.failed.push(EntryFailure {
                    student_id: entry.student_id.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    summary
}

use tracing::info;

use crate::absentees::derive_absentees;
use crate::bunkers::detect_bunkers;
use crate::error::Result;
use crate::models::{SubmissionBatch, SubmissionOutcome};
use crate::recorder::record;
use crate::store::AttendanceStore;

/// Validates, records and derives absentee and bunker lists for one batch.
///
/// Recording runs first so the detector sees the batch's own period; the
/// detector skips that period when looking for evidence.
pub async fn submit<S>(store: &S, batch: &SubmissionBatch) -> Result<SubmissionOutcome>
where
    S: AttendanceStore + ?Sized,
{
    batch.validate()?;

    let summary = record(store, batch).await;
    let absentees = derive_absentees(store, batch).await?;
    let bunkers = detect_bunkers(store, batch).await?;

    info!(
        section = %batch.section,
        subject = %batch.subject,
        date = %batch.date,
        period = batch.period,
        recorded = summary.applied,
        failed = summary.failed.len(),
        absentees = absentees.len(),
        bunkers = bunkers.len(),
        "attendance submitted"
    );

    Ok(SubmissionOutcome {
        absentees,
        bunkers,
        failed: summary.failed,
    })
}

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use tracing::info;

use crate::error::Result;
use crate::models::{AbsenteeEntry, SubmissionBatch};
use crate::store::AttendanceStore;

/// Persists one absentee entry for the batch and returns the absent ids.
///
/// An entry is written even when nobody is absent. Calling this twice for the
/// same batch appends twice.
pub async fn derive_absentees<S>(store: &S, batch: &SubmissionBatch) -> Result<BTreeSet<String>>
where
    S: AttendanceStore + ?Sized,
{
    let absentees: BTreeSet<String> = batch
        .entries
        .iter()
        .filter(|entry| !entry.present)
        .map(|entry| entry.student_id.clone())
        .collect();

    store
        .append_absentee_entry(&AbsenteeEntry {
            date: batch.date,
            subject: batch.subject.clone(),
            section: batch.section.clone(),
            absentees: absentees.clone(),
        })
        .await?;

    info!(
        section = %batch.section,
        subject = %batch.subject,
        date = %batch.date,
        count = absentees.len(),
        "absentee list stored"
    );

    Ok(absentees)
}

/// Absentee ids for a date grouped by subject, in insertion order per subject.
pub async fn absentees_by_subject<S>(
    store: &S,
    section: &str,
    date: NaiveDate,
) -> Result<BTreeMap<String, Vec<String>>>
where
    S: AttendanceStore + ?Sized,
{
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in store.query_absentees(section, date).await? {
        grouped
            .entry(entry.subject)
            .or_default()
            .extend(entry.absentees);
    }
    Ok(grouped)
}

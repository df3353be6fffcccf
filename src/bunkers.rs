use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::error::{AttendanceError, Result};
use crate::models::{BunkerEntry, PeriodNumber, StudentAttendanceRecord, SubmissionBatch};
use crate::store::AttendanceStore;

/// First period other than `current` on `date` where the student was marked
/// present, scanning in ascending period order.
pub fn first_present_period(
    record: &StudentAttendanceRecord,
    date: NaiveDate,
    current: PeriodNumber,
) -> Option<PeriodNumber> {
    record.day(date).and_then(|day| {
        day.iter()
            .find(|(period, mark)| **period != current && mark.present)
            .map(|(period, _)| *period)
    })
}

/// Flags students absent in this batch who were present for another period on
/// the same date, at most once per student.
///
/// The current period may or may not already be recorded; it is never used as
/// evidence. Nothing is written when no bunkers are found.
pub async fn detect_bunkers<S>(store: &S, batch: &SubmissionBatch) -> Result<Vec<BunkerEntry>>
where
    S: AttendanceStore + ?Sized,
{
    let mut bunkers = Vec::new();
    let mut seen = HashSet::new();

    for entry in batch.entries.iter().filter(|entry| !entry.present) {
        if !seen.insert(entry.student_id.as_str()) {
            continue;
        }

        let record = match store.get(&batch.section, &entry.student_id).await {
            Ok(record) => record,
            Err(AttendanceError::NotFound { .. }) => continue,
            Err(err) => return Err(err),
        };

        if let Some(period) = first_present_period(&record, batch.date, batch.period) {
            debug!(
                student_id = %entry.student_id,
                present_in = period,
                absent_in = batch.period,
                "bunk detected"
            );
            bunkers.push(BunkerEntry {
                date: batch.date,
                subject: batch.subject.clone(),
                section: batch.section.clone(),
                student_id: entry.student_id.clone(),
            });
        }
    }

    if !bunkers.is_empty() {
        store.append_bunker_entries(&bunkers).await?;
        info!(
            section = %batch.section,
            subject = %batch.subject,
            date = %batch.date,
            count = bunkers.len(),
            "bunker entries stored"
        );
    }

    Ok(bunkers)
}

/// Bunker ids for a date grouped by subject, in insertion order per subject.
pub async fn bunkers_by_subject<S>(
    store: &S,
    section: &str,
    date: NaiveDate,
) -> Result<BTreeMap<String, Vec<String>>>
where
    S: AttendanceStore + ?Sized,
{
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in store.query_bunkers(section, date).await? {
        grouped.entry(entry.subject).or_default().push(entry.student_id);
    }
    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttendanceMark, PeriodRecord};
    use crate::store::MemoryStore;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
    }

    fn batch(period: PeriodNumber, subject: &str, marks: &[(&str, bool)]) -> SubmissionBatch {
        SubmissionBatch {
            date: date(),
            period,
            subject: subject.to_string(),
            section: "A".to_string(),
            entries: marks
                .iter()
                .map(|(id, present)| AttendanceMark {
                    student_id: id.to_string(),
                    present: *present,
                })
                .collect(),
        }
    }

    async fn mark(store: &MemoryStore, student: &str, period: PeriodNumber, present: bool) {
        store
            .upsert(
                "A",
                student,
                date(),
                period,
                PeriodRecord {
                    subject: "Math".to_string(),
                    present,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn no_history_means_no_bunkers_and_no_insert() {
        let store = MemoryStore::new();
        let found = detect_bunkers(&store, &batch(1, "Math", &[("S1", false)]))
            .await
            .unwrap();

        assert!(found.is_empty());
        assert!(store.query_bunkers("A", date()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn absent_after_present_period_is_flagged() {
        let store = MemoryStore::new();
        mark(&store, "S1", 1, true).await;

        let found = detect_bunkers(&store, &batch(2, "Physics", &[("S1", false)]))
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].student_id, "S1");
        assert_eq!(found[0].subject, "Physics");
        assert_eq!(store.query_bunkers("A", date()).await.unwrap(), found);
    }

    #[tokio::test]
    async fn current_period_already_recorded_is_not_evidence() {
        let store = MemoryStore::new();
        mark(&store, "S1", 2, true).await;

        let found = detect_bunkers(&store, &batch(2, "Physics", &[("S1", false)]))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn absent_all_day_is_not_bunking() {
        let store = MemoryStore::new();
        mark(&store, "S1", 1, false).await;
        mark(&store, "S1", 2, false).await;

        let found = detect_bunkers(&store, &batch(3, "Physics", &[("S1", false)]))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn at_most_one_entry_per_student() {
        let store = MemoryStore::new();
        mark(&store, "S1", 1, true).await;
        mark(&store, "S1", 2, true).await;
        mark(&store, "S1", 3, true).await;

        let found = detect_bunkers(
            &store,
            &batch(4, "Physics", &[("S1", false), ("S1", false), ("S2", false)]),
        )
        .await
        .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].student_id, "S1");
    }

    #[test]
    fn first_present_period_scans_ascending() {
        let mut record = StudentAttendanceRecord::empty("S1");
        let day = record.history.entry(date()).or_default();
        for (period, present) in [(5, true), (2, false), (3, true), (1, false)] {
            day.insert(
                period,
                PeriodRecord {
                    subject: "Math".to_string(),
                    present,
                },
            );
        }

        assert_eq!(first_present_period(&record, date(), 4), Some(3));
        assert_eq!(first_present_period(&record, date(), 3), Some(5));
        assert_eq!(
            first_present_period(&record, NaiveDate::from_ymd_opt(2024, 1, 11).unwrap(), 1),
            None
        );
    }

    #[tokio::test]
    async fn groups_bunkers_by_subject() {
        let store = MemoryStore::new();
        mark(&store, "S1", 1, true).await;
        mark(&store, "S2", 1, true).await;
        detect_bunkers(&store, &batch(2, "Physics", &[("S1", false)]))
            .await
            .unwrap();
        detect_bunkers(&store, &batch(3, "Chemistry", &[("S2", false), ("S1", false)]))
            .await
            .unwrap();

        let grouped = bunkers_by_subject(&store, "A", date()).await.unwrap();
        assert_eq!(grouped["Physics"], vec!["S1".to_string()]);
        assert_eq!(grouped["Chemistry"], vec!["S2".to_string(), "S1".to_string()]);
    }
}

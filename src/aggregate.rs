use chrono::{Duration, NaiveDate, Utc};

use crate::error::{AttendanceError, Result};
use crate::models::{
    AggregateFilter, AggregateResult, DateRange, SectionAggregate, StudentAttendanceRecord,
};
use crate::store::AttendanceStore;

impl DateRange {
    /// Range ending today and starting `days` earlier (at least one day).
    /// Windows reaching past the calendar start at `NaiveDate::MIN`.
    pub fn trailing_days(days: i64) -> Self {
        let today = Utc::now().date_naive();
        let start = Duration::try_days(days.max(1))
            .and_then(|span| today.checked_sub_signed(span))
            .unwrap_or(NaiveDate::MIN);
        Self::new(start, today)
    }
}

pub fn percentage(attended: u32, conducted: u32) -> f64 {
    if conducted == 0 {
        0.0
    } else {
        attended as f64 / conducted as f64 * 100.0
    }
}

pub fn summarize_record(record: &StudentAttendanceRecord, filter: &AggregateFilter) -> AggregateResult {
    let mut conducted = 0u32;
    let mut attended = 0u32;

    for (date, day) in &record.history {
        if let Some(range) = filter.range {
            if !range.contains(*date) {
                continue;
            }
        }

        for mark in day.values() {
            if let Some(subject) = filter.subject.as_deref() {
                if mark.subject != subject {
                    continue;
                }
            }
            conducted += 1;
            if mark.present {
                attended += 1;
            }
        }
    }

    AggregateResult {
        student_id: record.student_id.clone(),
        periods_conducted: conducted,
        periods_attended: attended,
        percentage: percentage(attended, conducted),
    }
}

/// Mean of the per-student percentages, not a pooled ratio.
pub fn mean_percentage(results: &[AggregateResult]) -> f64 {
    if results.is_empty() {
        0.0
    } else {
        results.iter().map(|result| result.percentage).sum::<f64>() / results.len() as f64
    }
}

pub async fn aggregate_student<S>(
    store: &S,
    section: &str,
    student_id: &str,
    filter: &AggregateFilter,
) -> Result<AggregateResult>
where
    S: AttendanceStore + ?Sized,
{
    let record = match store.get(section, student_id).await {
        Ok(record) => record,
        Err(AttendanceError::NotFound { .. }) => StudentAttendanceRecord::empty(student_id),
        Err(err) => return Err(err),
    };
    Ok(summarize_record(&record, filter))
}

pub async fn aggregate_section<S>(
    store: &S,
    section: &str,
    filter: &AggregateFilter,
) -> Result<SectionAggregate>
where
    S: AttendanceStore + ?Sized,
{
    let records = store.scan(section, filter.range).await?;
    let students: Vec<AggregateResult> = records
        .iter()
        .map(|record| summarize_record(record, filter))
        .collect();
    let average_percentage = mean_percentage(&students);

    Ok(SectionAggregate {
        students,
        average_percentage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PeriodNumber, PeriodRecord};
    use crate::store::MemoryStore;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    async fn mark(
        store: &MemoryStore,
        student: &str,
        d: u32,
        period: PeriodNumber,
        subject: &str,
        present: bool,
    ) {
        store
            .upsert(
                "A",
                student,
                day(d),
                period,
                PeriodRecord {
                    subject: subject.to_string(),
                    present,
                },
            )
            .await
            .unwrap();
    }

    #[test]
    fn percentage_guards_zero_conducted() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(1, 2), 50.0);
        assert_eq!(percentage(3, 3), 100.0);
    }

    #[test]
    fn mean_of_percentages_is_not_pooled() {
        let results = vec![
            AggregateResult {
                student_id: "S1".to_string(),
                periods_conducted: 1,
                periods_attended: 1,
                percentage: 100.0,
            },
            AggregateResult {
                student_id: "S2".to_string(),
                periods_conducted: 3,
                periods_attended: 0,
                percentage: 0.0,
            },
        ];
        // pooled would be 25.0
        assert_eq!(mean_percentage(&results), 50.0);
        assert_eq!(mean_percentage(&[]), 0.0);
    }

    #[tokio::test]
    async fn unknown_student_aggregates_to_zero() {
        let store = MemoryStore::new();
        let result = aggregate_student(&store, "A", "S9", &AggregateFilter::default())
            .await
            .unwrap();
        assert_eq!(result.periods_conducted, 0);
        assert_eq!(result.periods_attended, 0);
        assert_eq!(result.percentage, 0.0);
    }

    #[tokio::test]
    async fn range_bounds_are_inclusive() {
        let store = MemoryStore::new();
        mark(&store, "S1", 9, 1, "Math", false).await;
        mark(&store, "S1", 10, 1, "Math", true).await;
        mark(&store, "S1", 12, 1, "Math", false).await;
        mark(&store, "S1", 13, 1, "Math", true).await;

        let filter = AggregateFilter {
            range: Some(DateRange::new(day(10), day(12))),
            subject: None,
        };
        let result = aggregate_student(&store, "A", "S1", &filter).await.unwrap();
        assert_eq!(result.periods_conducted, 2);
        assert_eq!(result.periods_attended, 1);
    }

    #[tokio::test]
    async fn subject_filter_counts_matching_periods_only() {
        let store = MemoryStore::new();
        mark(&store, "S1", 10, 1, "Math", true).await;
        mark(&store, "S1", 10, 2, "Physics", false).await;
        mark(&store, "S1", 11, 1, "Math", false).await;
        mark(&store, "S1", 11, 3, "Math", true).await;

        let filter = AggregateFilter {
            range: None,
            subject: Some("Math".to_string()),
        };
        let result = aggregate_student(&store, "A", "S1", &filter).await.unwrap();
        assert_eq!(result.periods_conducted, 3);
        assert_eq!(result.periods_attended, 2);
        assert!((result.percentage - 200.0 / 3.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn section_average_includes_students_outside_range() {
        let store = MemoryStore::new();
        mark(&store, "S1", 10, 1, "Math", true).await;
        mark(&store, "S1", 10, 2, "Math", true).await;
        mark(&store, "S2", 10, 1, "Math", false).await;
        mark(&store, "S2", 10, 2, "Math", true).await;
        mark(&store, "S3", 20, 1, "Math", true).await;

        let filter = AggregateFilter {
            range: Some(DateRange::new(day(10), day(10))),
            subject: None,
        };
        let aggregate = aggregate_section(&store, "A", &filter).await.unwrap();

        assert_eq!(aggregate.students.len(), 3);
        assert_eq!(aggregate.students[2].student_id, "S3");
        assert_eq!(aggregate.students[2].percentage, 0.0);
        assert!((aggregate.average_percentage - 50.0).abs() < 0.001);
        for result in &aggregate.students {
            assert!((0.0..=100.0).contains(&result.percentage));
        }
    }

    #[tokio::test]
    async fn empty_section_has_zero_average() {
        let store = MemoryStore::new();
        let aggregate = aggregate_section(&store, "Z", &AggregateFilter::default())
            .await
            .unwrap();
        assert!(aggregate.students.is_empty());
        assert_eq!(aggregate.average_percentage, 0.0);
    }

    #[test]
    fn trailing_days_ends_today() {
        let range = DateRange::trailing_days(14);
        let today = Utc::now().date_naive();
        assert_eq!(range.end, today);
        assert_eq!(range.start, today - Duration::days(14));
        assert_eq!(DateRange::trailing_days(0).start, today - Duration::days(1));
    }

    #[test]
    fn trailing_days_clamps_oversized_windows() {
        let today = Utc::now().date_naive();
        for days in [200_000_000, i64::MAX] {
            let range = DateRange::trailing_days(days);
            assert_eq!(range.start, NaiveDate::MIN);
            assert_eq!(range.end, today);
        }
    }
}

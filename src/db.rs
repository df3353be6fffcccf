use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::error::{AttendanceError, Result};
use crate::models::{
    AbsenteeEntry, AttendanceMark, BunkerEntry, DateRange, PeriodNumber, PeriodRecord,
    StudentAttendanceRecord, SubmissionBatch, SubmissionOutcome,
};
use crate::store::AttendanceStore;
use crate::submission::submit;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed store. Every section shares one table keyed by
/// `(section, student_id, attended_on, period)`.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn period_from_row(student_id: &str, raw: i32) -> Result<PeriodNumber> {
    PeriodNumber::try_from(raw)
        .ok()
        .filter(|period| *period > 0)
        .ok_or_else(|| AttendanceError::MalformedRecord {
            student_id: student_id.to_string(),
            reason: format!("period {raw} is out of range"),
        })
}

#[async_trait]
impl AttendanceStore for PgStore {
    fn backend_tag(&self) -> &'static str {
        "postgres"
    }

    async fn get(&self, section: &str, student_id: &str) -> Result<StudentAttendanceRecord> {
        let rows = sqlx::query(
            r#"
            SELECT attended_on, period, subject, present
            FROM section_attendance.period_marks
            WHERE section = $1 AND student_id = $2
            ORDER BY attended_on, period
            "#,
        )
        .bind(section)
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(AttendanceError::NotFound {
                section: section.to_string(),
                student_id: student_id.to_string(),
            });
        }

        let mut record = StudentAttendanceRecord::empty(student_id);
        for row in rows {
            let date: NaiveDate = row.get("attended_on");
            let period = period_from_row(student_id, row.get("period"))?;
            record.history.entry(date).or_default().insert(
                period,
                PeriodRecord {
                    subject: row.get("subject"),
                    present: row.get("present"),
                },
            );
        }

        Ok(record)
    }

    async fn upsert(
        &self,
        section: &str,
        student_id: &str,
        date: NaiveDate,
        period: PeriodNumber,
        value: PeriodRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO section_attendance.period_marks
            (section, student_id, attended_on, period, subject, present)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (section, student_id, attended_on, period) DO UPDATE
            SET subject = EXCLUDED.subject, present = EXCLUDED.present, updated_at = now()
            "#,
        )
        .bind(section)
        .bind(student_id)
        .bind(date)
        .bind(i32::from(period))
        .bind(value.subject)
        .bind(value.present)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_absentee_entry(&self, entry: &AbsenteeEntry) -> Result<()> {
        let absentees: Vec<String> = entry.absentees.iter().cloned().collect();
        sqlx::query(
            r#"
            INSERT INTO section_attendance.absentee_entries
            (id, section, attended_on, subject, absentees)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.section)
        .bind(entry.date)
        .bind(&entry.subject)
        .bind(absentees)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_bunker_entries(&self, entries: &[BunkerEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO section_attendance.bunker_entries
                (id, section, attended_on, subject, student_id)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&entry.section)
            .bind(entry.date)
            .bind(&entry.subject)
            .bind(&entry.student_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn scan(
        &self,
        section: &str,
        range: Option<DateRange>,
    ) -> Result<Vec<StudentAttendanceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT s.student_id, m.attended_on, m.period, m.subject, m.present
            FROM (
                SELECT DISTINCT student_id
                FROM section_attendance.period_marks
                WHERE section = $1
            ) s
            LEFT JOIN section_attendance.period_marks m
              ON m.section = $1
             AND m.student_id = s.student_id
             AND ($2::date IS NULL OR m.attended_on >= $2)
             AND ($3::date IS NULL OR m.attended_on <= $3)
            ORDER BY s.student_id, m.attended_on, m.period
            "#,
        )
        .bind(section)
        .bind(range.map(|range| range.start))
        .bind(range.map(|range| range.end))
        .fetch_all(&self.pool)
        .await?;

        let mut records: Vec<StudentAttendanceRecord> = Vec::new();
        for row in rows {
            let student_id: String = row.get("student_id");
            if records.last().map(|record| record.student_id.as_str()) != Some(student_id.as_str()) {
                records.push(StudentAttendanceRecord::empty(&student_id));
            }

            let date: Option<NaiveDate> = row.get("attended_on");
            let period: Option<i32> = row.get("period");
            let (Some(date), Some(period)) = (date, period) else {
                continue;
            };
            let period = period_from_row(&student_id, period)?;
            let subject: Option<String> = row.get("subject");
            let present: Option<bool> = row.get("present");

            if let Some(record) = records.last_mut() {
                record.history.entry(date).or_default().insert(
                    period,
                    PeriodRecord {
                        subject: subject.unwrap_or_default(),
                        present: present.unwrap_or(false),
                    },
                );
            }
        }

        Ok(records)
    }

    async fn query_absentees(&self, section: &str, date: NaiveDate) -> Result<Vec<AbsenteeEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT attended_on, subject, section, absentees
            FROM section_attendance.absentee_entries
            WHERE section = $1 AND attended_on = $2
            ORDER BY recorded_at
            "#,
        )
        .bind(section)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let absentees: Vec<String> = row.get("absentees");
                AbsenteeEntry {
                    date: row.get("attended_on"),
                    subject: row.get("subject"),
                    section: row.get("section"),
                    absentees: absentees.into_iter().collect(),
                }
            })
            .collect())
    }

    async fn query_bunkers(&self, section: &str, date: NaiveDate) -> Result<Vec<BunkerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT attended_on, subject, section, student_id
            FROM section_attendance.bunker_entries
            WHERE section = $1 AND attended_on = $2
            ORDER BY recorded_at
            "#,
        )
        .bind(section)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| BunkerEntry {
                date: row.get("attended_on"),
                subject: row.get("subject"),
                section: row.get("section"),
                student_id: row.get("student_id"),
            })
            .collect())
    }
}

fn marks(values: &[(&str, bool)]) -> Vec<AttendanceMark> {
    values
        .iter()
        .map(|(student_id, present)| AttendanceMark {
            student_id: student_id.to_string(),
            present: *present,
        })
        .collect()
}

fn seed_batches() -> anyhow::Result<Vec<SubmissionBatch>> {
    let day = |d: u32| {
        NaiveDate::from_ymd_opt(2024, 1, d).ok_or_else(|| anyhow::anyhow!("invalid seed date"))
    };

    let batches = vec![
        (day(10)?, 1, "Math", marks(&[("S1", true), ("S2", false), ("S3", true)])),
        (day(10)?, 2, "Physics", marks(&[("S1", false), ("S2", false), ("S3", true)])),
        (day(10)?, 3, "Chemistry", marks(&[("S1", true), ("S2", true), ("S3", false)])),
        (day(11)?, 1, "Math", marks(&[("S1", true), ("S2", true), ("S3", true)])),
        (day(11)?, 2, "Physics", marks(&[("S1", true), ("S2", false), ("S3", true)])),
    ];

    Ok(batches
        .into_iter()
        .map(|(date, period, subject, entries)| SubmissionBatch {
            date,
            period,
            subject: subject.to_string(),
            section: "A".to_string(),
            entries,
        })
        .collect())
}

async fn already_recorded<S>(store: &S, batch: &SubmissionBatch) -> Result<bool>
where
    S: AttendanceStore + ?Sized,
{
    for entry in &batch.entries {
        let record = match store.get(&batch.section, &entry.student_id).await {
            Ok(record) => record,
            Err(AttendanceError::NotFound { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };
        let recorded = record
            .day(batch.date)
            .is_some_and(|day| day.contains_key(&batch.period));
        if !recorded {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Replays a small week of section "A" submissions through the pipeline.
///
/// Batches whose marks are already stored are skipped, so a second run adds
/// no derived entries.
pub async fn seed<S>(store: &S) -> anyhow::Result<Vec<(SubmissionBatch, SubmissionOutcome)>>
where
    S: AttendanceStore + ?Sized,
{
    let mut outcomes = Vec::new();
    for batch in seed_batches()? {
        if already_recorded(store, &batch).await? {
            continue;
        }
        let outcome = submit(store, &batch).await?;
        outcomes.push((batch, outcome));
    }
    Ok(outcomes)
}

#[derive(Debug, serde::Deserialize)]
struct CsvRow {
    section: String,
    date: NaiveDate,
    period: PeriodNumber,
    subject: String,
    student_id: String,
    status: String,
}

/// Groups marks by `(section, date, period, subject)` in first-seen order.
fn batches_from_csv<R: std::io::Read>(reader: R) -> anyhow::Result<Vec<SubmissionBatch>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut batches: Vec<SubmissionBatch> = Vec::new();
    let mut index: HashMap<(String, NaiveDate, PeriodNumber, String), usize> = HashMap::new();

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let key = (row.section.clone(), row.date, row.period, row.subject.clone());
        let position = *index.entry(key).or_insert_with(|| {
            batches.push(SubmissionBatch {
                date: row.date,
                period: row.period,
                subject: row.subject.clone(),
                section: row.section.clone(),
                entries: Vec::new(),
            });
            batches.len() - 1
        });
        batches[position].entries.push(AttendanceMark {
            student_id: row.student_id,
            present: row.status.trim().eq_ignore_ascii_case("present"),
        });
    }

    Ok(batches)
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub batches: usize,
    pub marks: usize,
    pub failed: usize,
    pub rejected_batches: BTreeMap<String, String>,
}

pub async fn import_csv<S>(store: &S, csv_path: &std::path::Path) -> anyhow::Result<ImportSummary>
where
    S: AttendanceStore + ?Sized,
{
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut summary = ImportSummary::default();

    for batch in batches_from_csv(file)? {
        let label = format!(
            "{} {} period {} {}",
            batch.section, batch.date, batch.period, batch.subject
        );
        match submit(store, &batch).await {
            Ok(outcome) => {
                summary.batches += 1;
                summary.marks += batch.entries.len() - outcome.failed.len();
                summary.failed += outcome.failed.len();
            }
            Err(err @ AttendanceError::InvalidBatch(_)) => {
                warn!(batch = %label, error = %err, "skipping invalid batch");
                summary.rejected_batches.insert(label, err.to_string());
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn period_from_row_rejects_out_of_range_values() {
        assert_eq!(period_from_row("S1", 3).unwrap(), 3);
        assert!(matches!(
            period_from_row("S1", 0),
            Err(AttendanceError::MalformedRecord { .. })
        ));
        assert!(matches!(
            period_from_row("S1", -2),
            Err(AttendanceError::MalformedRecord { .. })
        ));
        assert!(matches!(
            period_from_row("S1", 70_000),
            Err(AttendanceError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn csv_rows_group_into_batches() {
        let raw = "\
section,date,period,subject,student_id,status
A,2024-01-10,1,Math,S1,present
A,2024-01-10,1,Math,S2,Absent
A,2024-01-10,2,Physics,S1,absent
A,2024-01-10,1,Math,S3,PRESENT
";
        let batches = batches_from_csv(raw.as_bytes()).unwrap();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].subject, "Math");
        assert_eq!(batches[0].entries.len(), 3);
        assert!(batches[0].entries[0].present);
        assert!(!batches[0].entries[1].present);
        assert!(batches[0].entries[2].present);
        assert_eq!(batches[1].period, 2);
    }

    #[tokio::test]
    async fn seeding_twice_adds_nothing() {
        let store = MemoryStore::new();
        let first = seed(&store).await.unwrap();
        let second = seed(&store).await.unwrap();

        assert_eq!(first.len(), 5);
        assert!(second.is_empty());

        let date = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let absent = crate::absentees::absentees_by_subject(&store, "A", date)
            .await
            .unwrap();
        assert_eq!(absent["Math"], vec!["S2".to_string()]);

        let bunked = crate::bunkers::bunkers_by_subject(&store, "A", date)
            .await
            .unwrap();
        assert!(!bunked.contains_key("Math"));
        assert_eq!(bunked["Physics"], vec!["S1".to_string()]);
        assert_eq!(bunked["Chemistry"], vec!["S3".to_string()]);
    }

    #[tokio::test]
    async fn import_error_names_the_missing_file() {
        let store = MemoryStore::new();
        let path = std::env::temp_dir().join(format!("missing-{}.csv", Uuid::new_v4()));

        let err = import_csv(&store, &path).await.unwrap_err();
        assert!(err.to_string().contains(&path.display().to_string()));
    }

    #[tokio::test]
    async fn seed_detects_the_physics_bunk() {
        let store = MemoryStore::new();
        let outcomes = seed(&store).await.unwrap();

        assert_eq!(outcomes.len(), 5);
        let (_, physics) = &outcomes[1];
        assert_eq!(physics.bunkers.len(), 1);
        assert_eq!(physics.bunkers[0].student_id, "S1");
        // S2 was absent for both morning periods
        assert!(physics.absentees.contains("S2"));
    }
}

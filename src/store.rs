use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Mutex;

use crate::error::{AttendanceError, Result};
use crate::models::{
    AbsenteeEntry, BunkerEntry, DateRange, PeriodNumber, PeriodRecord, StudentAttendanceRecord,
};

/// Read/write surface the attendance core needs from persistence.
///
/// `upsert` must be atomic per `(section, student_id, date, period)` key.
/// `scan` returns every student known to the section in ascending id order,
/// with history trimmed to `range` when one is given.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    fn backend_tag(&self) -> &'static str;

    async fn get(&self, section: &str, student_id: &str) -> Result<StudentAttendanceRecord>;

    async fn upsert(
        &self,
        section: &str,
        student_id: &str,
        date: NaiveDate,
        period: PeriodNumber,
        value: PeriodRecord,
    ) -> Result<()>;

    async fn append_absentee_entry(&self, entry: &AbsenteeEntry) -> Result<()>;

    async fn append_bunker_entries(&self, entries: &[BunkerEntry]) -> Result<()>;

    async fn scan(
        &self,
        section: &str,
        range: Option<DateRange>,
    ) -> Result<Vec<StudentAttendanceRecord>>;

    async fn query_absentees(&self, section: &str, date: NaiveDate) -> Result<Vec<AbsenteeEntry>>;

    async fn query_bunkers(&self, section: &str, date: NaiveDate) -> Result<Vec<BunkerEntry>>;
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, BTreeMap<String, StudentAttendanceRecord>>,
    absentees: HashMap<String, Vec<AbsenteeEntry>>,
    bunkers: HashMap<String, Vec<BunkerEntry>>,
}

/// Process-local store used by tests and `seed --dry-run`.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    rejected_writes: HashSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts for these student ids fail with a store error.
    #[cfg(test)]
    pub fn rejecting_writes_for(ids: &[&str]) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            rejected_writes: ids.iter().map(|id| id.to_string()).collect(),
        }
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    fn backend_tag(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, section: &str, student_id: &str) -> Result<StudentAttendanceRecord> {
        self.state
            .lock()
            .await
            .records
            .get(section)
            .and_then(|students| students.get(student_id))
            .cloned()
            .ok_or_else(|| AttendanceError::NotFound {
                section: section.to_string(),
                student_id: student_id.to_string(),
            })
    }

    async fn upsert(
        &self,
        section: &str,
        student_id: &str,
        date: NaiveDate,
        period: PeriodNumber,
        value: PeriodRecord,
    ) -> Result<()> {
        if self.rejected_writes.contains(student_id) {
            return Err(AttendanceError::Store(format!(
                "write rejected for student {student_id}"
            )));
        }
        let mut state = self.state.lock().await;
        state
            .records
            .entry(section.to_string())
            .or_default()
            .entry(student_id.to_string())
            .or_insert_with(|| StudentAttendanceRecord::empty(student_id))
            .history
            .entry(date)
            .or_default()
            .insert(period, value);
        Ok(())
    }

    async fn append_absentee_entry(&self, entry: &AbsenteeEntry) -> Result<()> {
        self.state
            .lock()
            .await
            .absentees
            .entry(entry.section.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn append_bunker_entries(&self, entries: &[BunkerEntry]) -> Result<()> {
        let mut state = self.state.lock().await;
        for entry in entries {
            state
                .bunkers
                .entry(entry.section.clone())
                .or_default()
                .push(entry.clone());
        }
        Ok(())
    }

    async fn scan(
        &self,
        section: &str,
        range: Option<DateRange>,
    ) -> Result<Vec<StudentAttendanceRecord>> {
        let state = self.state.lock().await;
        let Some(students) = state.records.get(section) else {
            return Ok(Vec::new());
        };

        Ok(students
            .values()
            .map(|record| match range {
                Some(range) => StudentAttendanceRecord {
                    student_id: record.student_id.clone(),
                    history: record
                        .history
                        .iter()
                        .filter(|(date, _)| range.contains(**date))
                        .map(|(date, day)| (*date, day.clone()))
                        .collect(),
                },
                None => record.clone(),
            })
            .collect())
    }

    async fn query_absentees(&self, section: &str, date: NaiveDate) -> Result<Vec<AbsenteeEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .absentees
            .get(section)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.date == date)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query_bunkers(&self, section: &str, date: NaiveDate) -> Result<Vec<BunkerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .bunkers
            .get(section)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.date == date)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

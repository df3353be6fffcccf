use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::AttendanceError;

pub type PeriodNumber = u16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRecord {
    pub subject: String,
    pub present: bool,
}

pub type DayHistory = BTreeMap<PeriodNumber, PeriodRecord>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentAttendanceRecord {
    pub student_id: String,
    pub history: BTreeMap<NaiveDate, DayHistory>,
}

impl StudentAttendanceRecord {
    pub fn empty(student_id: &str) -> Self {
        Self {
            student_id: student_id.to_string(),
            history: BTreeMap::new(),
        }
    }

    pub fn day(&self, date: NaiveDate) -> Option<&DayHistory> {
        self.history.get(&date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceMark {
    pub student_id: String,
    pub present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionBatch {
    pub date: NaiveDate,
    pub period: PeriodNumber,
    pub subject: String,
    pub section: String,
    pub entries: Vec<AttendanceMark>,
}

impl SubmissionBatch {
    pub fn validate(&self) -> Result<(), AttendanceError> {
        if self.section.trim().is_empty() {
            return Err(AttendanceError::InvalidBatch("section is empty".to_string()));
        }
        if self.subject.trim().is_empty() {
            return Err(AttendanceError::InvalidBatch("subject is empty".to_string()));
        }
        if self.period == 0 {
            return Err(AttendanceError::InvalidBatch(
                "period must be 1 or greater".to_string(),
            ));
        }
        if let Some(position) = self
            .entries
            .iter()
            .position(|entry| entry.student_id.trim().is_empty())
        {
            return Err(AttendanceError::InvalidBatch(format!(
                "entry {position} has an empty student id"
            )));
        }
        Ok(())
    }

    pub fn period_record(&self, present: bool) -> PeriodRecord {
        PeriodRecord {
            subject: self.subject.clone(),
            present,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsenteeEntry {
    pub date: NaiveDate,
    pub subject: String,
    pub section: String,
    pub absentees: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BunkerEntry {
    pub date: NaiveDate,
    pub subject: String,
    pub section: String,
    pub student_id: String,
}

/// Inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateFilter {
    pub range: Option<DateRange>,
    pub subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateResult {
    pub student_id: String,
    pub periods_conducted: u32,
    pub periods_attended: u32,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionAggregate {
    pub students: Vec<AggregateResult>,
    pub average_percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubmissionOutcome {
    pub absentees: BTreeSet<String>,
    pub bunkers: Vec<BunkerEntry>,
    pub failed: Vec<EntryFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryFailure {
    pub student_id: String,
    pub reason: String,
}

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::NaiveDate;

use crate::models::{AggregateResult, DateRange, SectionAggregate};

const AGGREGATE_HEADER: [&str; 4] = [
    "Student ID",
    "Total Periods",
    "Attended Periods",
    "Attendance Percentage",
];

fn csv_writer() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .flexible(true)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new())
}

fn blank_line(writer: &mut csv::Writer<Vec<u8>>) -> anyhow::Result<()> {
    writer.flush()?;
    writer.get_mut().extend_from_slice(b"\n");
    Ok(())
}

fn finish(writer: csv::Writer<Vec<u8>>) -> anyhow::Result<String> {
    let bytes = writer.into_inner().map_err(|err| err.into_error())?;
    Ok(String::from_utf8(bytes)?)
}

fn write_aggregate_rows(
    writer: &mut csv::Writer<Vec<u8>>,
    students: &[AggregateResult],
) -> anyhow::Result<()> {
    writer.write_record(AGGREGATE_HEADER)?;
    for result in students {
        writer.write_record([
            result.student_id.clone(),
            result.periods_conducted.to_string(),
            result.periods_attended.to_string(),
            format!("{:.2}", result.percentage),
        ])?;
    }
    Ok(())
}

pub fn overall_csv(aggregate: &SectionAggregate) -> anyhow::Result<String> {
    let mut writer = csv_writer();
    write_aggregate_rows(&mut writer, &aggregate.students)?;
    blank_line(&mut writer)?;
    writer.write_record([
        "Average Attendance Percentage".to_string(),
        format!("{:.2}", aggregate.average_percentage),
    ])?;
    finish(writer)
}

pub fn subject_csv(
    section: &str,
    subject: &str,
    aggregate: &SectionAggregate,
) -> anyhow::Result<String> {
    let mut writer = csv_writer();
    writer.write_record([format!("Attendance Report for {subject} ({section})")])?;
    blank_line(&mut writer)?;
    write_aggregate_rows(&mut writer, &aggregate.students)?;
    finish(writer)
}

/// Absentee or bunker roll numbers for one date, one row per subject.
pub fn roster_csv(date: NaiveDate, by_subject: &BTreeMap<String, Vec<String>>) -> anyhow::Result<String> {
    let mut writer = csv_writer();
    writer.write_record(["Date:".to_string(), date.to_string()])?;
    writer.write_record(["Subject", "Roll Numbers"])?;
    for (subject, students) in by_subject {
        writer.write_record([subject.clone(), students.join(", ")])?;
    }
    finish(writer)
}

fn write_roster(output: &mut String, by_subject: &BTreeMap<String, Vec<String>>, empty: &str) {
    if by_subject.is_empty() {
        let _ = writeln!(output, "{empty}");
        return;
    }
    for (subject, students) in by_subject {
        let _ = writeln!(output, "- {}: {}", subject, students.join(", "));
    }
}

pub fn build_report(
    section: &str,
    range: DateRange,
    aggregate: &SectionAggregate,
    day: NaiveDate,
    absentees: &BTreeMap<String, Vec<String>>,
    bunkers: &BTreeMap<String, Vec<String>>,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Section Attendance Report");
    let _ = writeln!(
        output,
        "Generated for section {} ({} to {})",
        section, range.start, range.end
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Overview");

    if aggregate.students.is_empty() {
        let _ = writeln!(output, "No attendance recorded for this section.");
    } else {
        let _ = writeln!(
            output,
            "- {} students, average attendance {:.1}%",
            aggregate.students.len(),
            aggregate.average_percentage
        );
    }

    let mut lowest = aggregate.students.clone();
    lowest.sort_by(|a, b| {
        a.percentage
            .partial_cmp(&b.percentage)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let _ = writeln!(output);
    let _ = writeln!(output, "## Lowest Attendance");

    if lowest.is_empty() {
        let _ = writeln!(output, "No students with attendance in this window.");
    } else {
        for result in lowest.iter().take(10) {
            let _ = writeln!(
                output,
                "- {}: {:.1}% ({} of {} periods)",
                result.student_id, result.percentage, result.periods_attended, result.periods_conducted
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Absentees on {day}");
    write_roster(&mut output, absentees, "No absentees recorded.");

    let _ = writeln!(output);
    let _ = writeln!(output, "## Bunkers on {day}");
    write_roster(&mut output, bunkers, "No bunkers recorded.");

    output
}

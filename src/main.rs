use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

mod absentees;
mod aggregate;
mod bunkers;
mod config;
mod db;
mod error;
mod models;
mod recorder;
mod report;
mod store;
mod submission;

use crate::error::AttendanceError;
use crate::models::{AggregateFilter, DateRange, SubmissionBatch};
use crate::store::{AttendanceStore, MemoryStore};

#[derive(Parser)]
#[command(name = "section-attendance")]
#[command(about = "Per-period attendance tracking with absentee and bunker detection", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample submissions for section A
    Seed {
        /// Run against an in-memory store and print the outcomes
        #[arg(long)]
        dry_run: bool,
    },
    /// Import attendance marks from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Submit one period of attendance from a JSON batch file
    Submit {
        #[arg(long)]
        batch: PathBuf,
    },
    /// Attendance percentages for a section or a single student
    #[command(group(
        ArgGroup::new("window")
            .args(["from", "since_days"])
            .multiple(false)
    ))]
    Stats {
        #[arg(long)]
        section: String,
        #[arg(long)]
        student: Option<String>,
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
        #[arg(long)]
        since_days: Option<i64>,
        #[arg(long)]
        subject: Option<String>,
    },
    /// Absentees for a date, grouped by subject
    Absentees {
        #[arg(long)]
        section: String,
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Bunkers for a date, grouped by subject
    Bunkers {
        #[arg(long)]
        section: String,
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Export section percentages as CSV
    Export {
        #[arg(long)]
        section: String,
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long, default_value = "attendance.csv")]
        out: PathBuf,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        section: String,
        #[arg(long, default_value_t = 30)]
        since_days: i64,
        /// Day whose absentee and bunker lists are included (defaults to today)
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn window(
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    since_days: Option<i64>,
) -> Option<DateRange> {
    match (from, to, since_days) {
        (Some(from), Some(to), _) => Some(DateRange::new(from, to)),
        (_, _, Some(days)) => Some(DateRange::trailing_days(days)),
        _ => None,
    }
}

fn load_batch(path: &Path) -> anyhow::Result<SubmissionBatch> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read batch file {}", path.display()))?;
    serde_json::from_str(&raw)
        .map_err(|err| AttendanceError::InvalidBatch(err.to_string()).into())
}

fn write_or_print(out: Option<&Path>, contents: &str) -> anyhow::Result<()> {
    match out {
        Some(path) => {
            std::fs::write(path, contents)?;
            println!("Written to {}.", path.display());
        }
        None => print!("{contents}"),
    }
    Ok(())
}

async fn pool() -> anyhow::Result<PgPool> {
    let config = config::Config::from_env()?;
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")
}

async fn connect() -> anyhow::Result<db::PgStore> {
    Ok(db::PgStore::new(pool().await?))
}

async fn print_seed(store: &dyn AttendanceStore) -> anyhow::Result<()> {
    let outcomes = db::seed(store).await?;
    if outcomes.is_empty() {
        println!("Seed data already present.");
    }
    for (batch, outcome) in &outcomes {
        println!(
            "- {} period {} {}: absent [{}], bunkers [{}]",
            batch.date,
            batch.period,
            batch.subject,
            outcome.absentees.iter().cloned().collect::<Vec<_>>().join(", "),
            outcome
                .bunkers
                .iter()
                .map(|bunker| bunker.student_id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool().await?).await?;
            println!("Schema ready.");
        }
        Commands::Seed { dry_run } => {
            if dry_run {
                let store = MemoryStore::new();
                info!(backend = store.backend_tag(), "seeding");
                print_seed(&store).await?;
            } else {
                let store = connect().await?;
                info!(backend = store.backend_tag(), "seeding");
                print_seed(&store).await?;
                println!("Seed data inserted.");
            }
        }
        Commands::Import { csv } => {
            let store = connect().await?;
            let summary = db::import_csv(&store, &csv).await?;
            println!(
                "Imported {} marks across {} batches from {}.",
                summary.marks,
                summary.batches,
                csv.display()
            );
            if summary.failed > 0 {
                println!("{} marks could not be written.", summary.failed);
            }
            for (batch, reason) in &summary.rejected_batches {
                println!("Rejected {batch}: {reason}");
            }
        }
        Commands::Submit { batch } => {
            let batch = load_batch(&batch)?;
            let store = connect().await?;
            let outcome = submission::submit(&store, &batch).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Stats {
            section,
            student,
            from,
            to,
            since_days,
            subject,
        } => {
            let store = connect().await?;
            let filter = AggregateFilter {
                range: window(from, to, since_days),
                subject,
            };
            match student {
                Some(student_id) => {
                    let result =
                        aggregate::aggregate_student(&store, &section, &student_id, &filter).await?;
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                None => {
                    let aggregate = aggregate::aggregate_section(&store, &section, &filter).await?;
                    println!("{}", serde_json::to_string_pretty(&aggregate)?);
                }
            }
        }
        Commands::Absentees { section, date, out } => {
            let store = connect().await?;
            let grouped = absentees::absentees_by_subject(&store, &section, date).await?;
            if grouped.is_empty() {
                println!("No absentees found.");
                return Ok(());
            }
            write_or_print(out.as_deref(), &report::roster_csv(date, &grouped)?)?;
        }
        Commands::Bunkers { section, date, out } => {
            let store = connect().await?;
            let grouped = bunkers::bunkers_by_subject(&store, &section, date).await?;
            if grouped.is_empty() {
                println!("No bunkers found.");
                return Ok(());
            }
            write_or_print(out.as_deref(), &report::roster_csv(date, &grouped)?)?;
        }
        Commands::Export {
            section,
            from,
            to,
            subject,
            out,
        } => {
            let store = connect().await?;
            let filter = AggregateFilter {
                range: window(from, to, None),
                subject: subject.clone(),
            };
            let aggregate = aggregate::aggregate_section(&store, &section, &filter).await?;
            let contents = match subject.as_deref() {
                Some(subject) => report::subject_csv(&section, subject, &aggregate)?,
                None => report::overall_csv(&aggregate)?,
            };
            write_or_print(Some(&out), &contents)?;
        }
        Commands::Report {
            section,
            since_days,
            date,
            out,
        } => {
            let store = connect().await?;
            let range = DateRange::trailing_days(since_days);
            let day = date.unwrap_or_else(|| Utc::now().date_naive());
            let filter = AggregateFilter {
                range: Some(range),
                subject: None,
            };
            let aggregate = aggregate::aggregate_section(&store, &section, &filter).await?;
            let absent = absentees::absentees_by_subject(&store, &section, day).await?;
            let bunked = bunkers::bunkers_by_subject(&store, &section, day).await?;
            let report = report::build_report(&section, range, &aggregate, day, &absent, &bunked);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

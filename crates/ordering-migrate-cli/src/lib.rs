//! Command surface of the `ordmig` migration tool.
//!
//! Hosts can embed the tool through [`run_cli`] for a parsed command line, or
//! [`run_command`] against an already opened [`SqliteQuestionBank`].

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ordering_migrate_core::{
    InspectReport, MigrationConfig, MigrationEngine, MigrationReport, RunOutcome,
};
use ordering_migrate_store_sqlite::SqliteQuestionBank;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "ordmig")]
#[command(about = "Migrate legacy sequencing questions to the ordering question type")]
pub struct Cli {
    #[arg(long, default_value = "./moodle.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Migrate every legacy question. Writes nothing without `--confirm`.
    Migrate(MigrateArgs),
    /// Report what a migration would do, read-only.
    Inspect(InspectArgs),
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    #[arg(long)]
    confirm: bool,
    #[arg(long, env = "ORDMIG_PASSWORD_SALT", hide_env_values = true)]
    salt: Option<String>,
    #[arg(long)]
    allow_dual_history: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    #[arg(long)]
    allow_dual_history: bool,
    #[arg(long)]
    json: bool,
}

/// Executes a parsed command line.
///
/// # Errors
/// Returns an error when the database cannot be opened, fails the
/// compatibility check, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut bank = SqliteQuestionBank::open(&cli.db)?;
    bank.check_compatibility()?;
    run_command(cli.command, &mut bank)
}

/// Executes one command against an open question bank.
///
/// # Errors
/// Returns an error when the run aborts or any question failed to migrate.
/// The report is printed before a failed run returns.
pub fn run_command(command: Command, bank: &mut SqliteQuestionBank) -> Result<()> {
    match command {
        Command::Migrate(args) => {
            let config = MigrationConfig::new(args.salt, args.allow_dual_history);
            let progress = |processed: usize, total: usize, label: &str| {
                info!(processed, total, label, "migration progress");
            };
            let report = MigrationEngine::new(bank, config)
                .with_progress(progress)
                .run(args.confirm)
                .context("migration aborted")?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }

            if report.has_failures() {
                return Err(anyhow!(
                    "{} question(s) failed to migrate",
                    report.failures.len()
                ));
            }
            Ok(())
        }
        Command::Inspect(args) => {
            let config = MigrationConfig::new(Some(String::new()), args.allow_dual_history);
            let report = MigrationEngine::new(bank, config)
                .inspect()
                .context("inspection failed")?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_inspect(&report);
            }
            Ok(())
        }
    }
}

fn outcome_label(outcome: RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Completed => "completed",
        RunOutcome::NotConfirmed => "not_confirmed (rerun with --confirm to write)",
        RunOutcome::NoLegacyData => "no_legacy_data",
    }
}

fn print_report(report: &MigrationReport) {
    println!(
        "contract={} run_id={} outcome={}",
        report.contract_version,
        report.run_id,
        outcome_label(report.outcome)
    );
    println!(
        "started_at={} finished_at={} history_shape={}",
        report.started_at,
        report.finished_at,
        report
            .history_shape
            .map_or_else(|| "n/a".to_string(), |shape| format!("{shape:?}"))
    );
    println!(
        "questions total={} migrated={} skipped={} failed={} caches_purged={}",
        report.totals.total,
        report.totals.migrated,
        report.totals.skipped,
        report.totals.failed,
        if report.caches_purged { "yes" } else { "no" }
    );

    let counters = &report.counters;
    println!(
        "answers inserted={} updated={} attachments_moved={}",
        counters.answers_inserted, counters.answers_updated, counters.attachments_moved
    );
    println!(
        "history states_rewritten={} step_data_rewritten={} step_data_deleted={} unrecognized={} attempts_scrubbed={}",
        counters.legacy_states_rewritten,
        counters.step_data_rewritten,
        counters.step_data_deleted,
        counters.step_data_unrecognized,
        counters.attempts_scrubbed
    );

    for skipped in &report.skipped_questions {
        println!("skipped question={} reason={:?}", skipped.question_id, skipped.reason);
    }
    for failure in &report.failures {
        println!(
            "failed question={} phase={:?} kind={:?} rolled_back={} reason={}",
            failure.question_id,
            failure.phase,
            failure.kind,
            if failure.rolled_back { "yes" } else { "no" },
            failure.reason
        );
    }
}

fn print_inspect(report: &InspectReport) {
    println!("contract={}", report.contract_version);
    match (&report.history_shape, &report.shape_error) {
        (Some(shape), _) => println!("history_shape={shape:?}"),
        (None, Some(error)) => println!("history_shape=unresolved error={error}"),
        (None, None) => println!("history_shape=unresolved"),
    }
    println!(
        "legacy_questions={} pending={} skipped={}",
        report.legacy_questions,
        report.pending.len(),
        report.skipped_questions.len()
    );
    for skipped in &report.skipped_questions {
        println!("skipped question={} reason={:?}", skipped.question_id, skipped.reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordering_migrate_core::QuestionId;
    use ordering_migrate_store_sqlite::{
        create_question_bank_schema, seed_legacy_question, FixtureHistory,
    };
    use std::path::Path;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn parse(args: &[&str]) -> Cli {
        match Cli::try_parse_from(args) {
            Ok(value) => value,
            Err(err) => panic!("failed to parse {args:?}: {err}"),
        }
    }

    fn fixture_bank() -> SqliteQuestionBank {
        let bank = must(SqliteQuestionBank::open(Path::new(":memory:")));
        must(create_question_bank_schema(
            bank.connection(),
            FixtureHistory::StateList,
        ));
        must(seed_legacy_question(
            bank.connection(),
            QuestionId(3),
            20,
            &[("First", "1"), ("Second", "2")],
        ));
        bank
    }

    fn legacy_rows(bank: &SqliteQuestionBank) -> i64 {
        must(
            bank.connection()
                .query_row("SELECT COUNT(*) FROM question_order", [], |row| row.get(0))
                .map_err(anyhow::Error::from),
        )
    }

    #[test]
    fn migrate_flags_parse_with_defaults() {
        let cli = parse(&["ordmig", "migrate", "--confirm", "--salt", "s3cret"]);
        assert_eq!(cli.db, PathBuf::from("./moodle.sqlite3"));
        match cli.command {
            Command::Migrate(args) => {
                assert!(args.confirm);
                assert_eq!(args.salt.as_deref(), Some("s3cret"));
                assert!(!args.allow_dual_history);
                assert!(!args.json);
            }
            Command::Inspect(_) => panic!("expected migrate command"),
        }
    }

    #[test]
    fn unconfirmed_migrate_leaves_database_untouched() {
        let mut bank = fixture_bank();
        let cli = parse(&["ordmig", "migrate", "--salt", "x"]);
        must(run_command(cli.command, &mut bank));
        assert_eq!(legacy_rows(&bank), 1);
    }

    #[test]
    fn confirmed_migrate_then_inspect_reports_nothing_pending() {
        let mut bank = fixture_bank();
        let cli = parse(&["ordmig", "migrate", "--confirm", "--salt", "x", "--json"]);
        must(run_command(cli.command, &mut bank));
        assert_eq!(legacy_rows(&bank), 0);

        let cli = parse(&["ordmig", "inspect"]);
        must(run_command(cli.command, &mut bank));
    }

    #[test]
    fn failed_questions_surface_as_errors() {
        let mut bank = fixture_bank();
        must(seed_legacy_question(
            bank.connection(),
            QuestionId(4),
            20,
            &[("Same", "1"), ("Weight", "1")],
        ));

        let cli = parse(&["ordmig", "migrate", "--confirm", "--salt", "x"]);
        let err = match run_command(cli.command, &mut bank) {
            Ok(()) => panic!("duplicate fractions must fail the run"),
            Err(err) => err.to_string(),
        };
        assert!(err.contains("1 question(s) failed"));
        assert_eq!(legacy_rows(&bank), 1);
    }
}

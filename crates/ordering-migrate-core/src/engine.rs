//! Drives one administrator-confirmed migration run over the question bank.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::reconstruct::{rewrite_legacy_state, ItemMap, StepDataWrite, StepLogReconstructor};
use crate::transfer::{prepare_sub_items, transfer_items, PreparedSubItem};
use crate::{
    format_rfc3339, now_utc, Attempt, HistoryShape, HistoryTables, LegacyOrderQuestion,
    LegacyState, MigrationConfig, MigrationError, OrderingOptionsInput, ProgressSink,
    QuestionBank, QuestionId, StepDatumRow, StoreError, INSPECT_CONTRACT_VERSION, ORDERING_QTYPE,
    REPORT_CONTRACT_VERSION,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    NotConfirmed,
    NoLegacyData,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Read,
    ItemTransfer,
    TypeFlip,
    HistoryRewrite,
    Cleanup,
}

impl FailureKind {
    fn of(err: &MigrationError) -> Self {
        match err {
            MigrationError::Read(_) | MigrationError::SchemaDetection(_) => Self::Read,
            MigrationError::ItemTransfer(_) => Self::ItemTransfer,
            MigrationError::TypeFlip(_) => Self::TypeFlip,
            MigrationError::HistoryRewrite(_) => Self::HistoryRewrite,
            MigrationError::Cleanup(_) => Self::Cleanup,
        }
    }
}

/// Last state a question reached before it failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionPhase {
    Pending,
    ItemsTransferred,
    TypeFlipped,
    HistoryRewritten,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    QuestionMissing,
    AlreadyOrdering,
    OptionsPresent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedQuestion {
    pub question_id: QuestionId,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionFailure {
    pub question_id: QuestionId,
    pub phase: QuestionPhase,
    pub kind: FailureKind,
    pub reason: String,
    pub rolled_back: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationCounters {
    pub answers_inserted: usize,
    pub answers_updated: usize,
    pub attachments_moved: usize,
    pub legacy_states_rewritten: usize,
    pub step_data_rewritten: usize,
    pub step_data_deleted: usize,
    pub step_data_unrecognized: usize,
    pub attempts_scrubbed: usize,
}

impl MigrationCounters {
    fn merge(&mut self, other: &Self) {
        self.answers_inserted += other.answers_inserted;
        self.answers_updated += other.answers_updated;
        self.attachments_moved += other.attachments_moved;
        self.legacy_states_rewritten += other.legacy_states_rewritten;
        self.step_data_rewritten += other.step_data_rewritten;
        self.step_data_deleted += other.step_data_deleted;
        self.step_data_unrecognized += other.step_data_unrecognized;
        self.attempts_scrubbed += other.attempts_scrubbed;
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionTotals {
    pub total: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub contract_version: String,
    pub run_id: String,
    pub outcome: RunOutcome,
    pub started_at: String,
    pub finished_at: String,
    pub history_shape: Option<HistoryShape>,
    pub totals: QuestionTotals,
    pub caches_purged: bool,
    pub counters: MigrationCounters,
    pub migrated_questions: Vec<QuestionId>,
    pub skipped_questions: Vec<SkippedQuestion>,
    pub failures: Vec<QuestionFailure>,
}

impl MigrationReport {
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InspectReport {
    pub contract_version: String,
    pub history_tables: HistoryTables,
    pub history_shape: Option<HistoryShape>,
    pub shape_error: Option<String>,
    pub legacy_questions: usize,
    pub pending: Vec<QuestionId>,
    pub skipped_questions: Vec<SkippedQuestion>,
}

/// Progress sink that discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&mut self, _processed: usize, _total: usize, _label: &str) {}
}

/// Everything one question needs, read before its first write.
struct QuestionSnapshot {
    legacy: LegacyOrderQuestion,
    prepared: Vec<PreparedSubItem>,
    states: Vec<LegacyState>,
    step_rows: Vec<StepDatumRow>,
    attempts: Vec<Attempt>,
}

struct QuestionError {
    phase: QuestionPhase,
    error: MigrationError,
}

impl QuestionError {
    fn at(phase: QuestionPhase) -> impl Fn(MigrationError) -> Self {
        move |error| Self { phase, error }
    }
}

pub struct MigrationEngine<'a, S: QuestionBank + ?Sized, P: ProgressSink = NoProgress> {
    store: &'a mut S,
    config: MigrationConfig,
    progress: P,
}

impl<'a, S: QuestionBank + ?Sized> MigrationEngine<'a, S, NoProgress> {
    pub fn new(store: &'a mut S, config: MigrationConfig) -> Self {
        Self {
            store,
            config,
            progress: NoProgress,
        }
    }
}

impl<'a, S: QuestionBank + ?Sized, P: ProgressSink> MigrationEngine<'a, S, P> {
    pub fn with_progress<Q: ProgressSink>(self, progress: Q) -> MigrationEngine<'a, S, Q> {
        MigrationEngine {
            store: self.store,
            config: self.config,
            progress,
        }
    }

    /// Reports what a run would do without writing anything.
    ///
    /// # Errors
    /// Returns [`MigrationError::Read`] when the legacy snapshot cannot be
    /// loaded.
    pub fn inspect(&self) -> Result<InspectReport, MigrationError> {
        let history_tables = HistoryTables::probe(&*self.store)
            .map_err(|err| MigrationError::SchemaDetection(err.to_string()))?;
        let (history_shape, shape_error) =
            match history_tables.resolve(self.config.allow_dual_history) {
                Ok(shape) => (Some(shape), None),
                Err(err) => (None, Some(err.to_string())),
            };

        let legacy = self
            .store
            .legacy_questions()
            .map_err(|err| MigrationError::Read(err.to_string()))?;
        let mut pending = Vec::new();
        let mut skipped_questions = Vec::new();
        for question in &legacy {
            match classify(&*self.store, question.question_id)
                .map_err(|err| MigrationError::Read(err.to_string()))?
            {
                Some(reason) => skipped_questions.push(SkippedQuestion {
                    question_id: question.question_id,
                    reason,
                }),
                None => pending.push(question.question_id),
            }
        }

        Ok(InspectReport {
            contract_version: INSPECT_CONTRACT_VERSION.to_string(),
            history_tables,
            history_shape,
            shape_error,
            legacy_questions: legacy.len(),
            pending,
            skipped_questions,
        })
    }

    /// Migrates every legacy question.
    ///
    /// # Errors
    /// Returns [`MigrationError::SchemaDetection`] when the history layout
    /// cannot be resolved and [`MigrationError::Read`] when the initial
    /// snapshot cannot be loaded. Per-question failures are recorded in the
    /// report instead.
    pub fn run(&mut self, confirmed: bool) -> Result<MigrationReport, MigrationError> {
        let started_at = format_rfc3339(now_utc())?;
        let mut report = MigrationReport {
            contract_version: REPORT_CONTRACT_VERSION.to_string(),
            run_id: Ulid::new().to_string(),
            outcome: RunOutcome::Completed,
            started_at: started_at.clone(),
            finished_at: started_at,
            history_shape: None,
            totals: QuestionTotals::default(),
            caches_purged: false,
            counters: MigrationCounters::default(),
            migrated_questions: Vec::new(),
            skipped_questions: Vec::new(),
            failures: Vec::new(),
        };

        if !confirmed {
            info!("migration not confirmed; nothing written");
            report.outcome = RunOutcome::NotConfirmed;
            report.finished_at = format_rfc3339(now_utc())?;
            return Ok(report);
        }

        let legacy = self
            .store
            .legacy_questions()
            .map_err(|err| MigrationError::Read(err.to_string()))?;
        report.totals.total = legacy.len();
        if legacy.is_empty() {
            info!("no legacy sequencing questions found");
            report.outcome = RunOutcome::NoLegacyData;
            report.finished_at = format_rfc3339(now_utc())?;
            return Ok(report);
        }

        let shape = HistoryTables::probe(&*self.store)
            .map_err(|err| MigrationError::SchemaDetection(err.to_string()))?
            .resolve(self.config.allow_dual_history)?;
        report.history_shape = Some(shape);
        info!(
            questions = legacy.len(),
            history_shape = ?shape,
            run_id = %report.run_id,
            "starting migration"
        );

        let mut reconstructor = StepLogReconstructor::new();
        let total = legacy.len();
        for (index, question) in legacy.into_iter().enumerate() {
            let question_id = question.question_id;
            self.migrate_one(question, shape, &mut reconstructor, &mut report);
            self.progress
                .update(index + 1, total, &format!("question {question_id}"));
        }

        if report.totals.migrated > 0 {
            match self.store.purge_all() {
                Ok(()) => report.caches_purged = true,
                Err(err) => warn!(error = %err, "cache purge failed; caches may be stale"),
            }
        }

        report.finished_at = format_rfc3339(now_utc())?;
        info!(
            migrated = report.totals.migrated,
            skipped = report.totals.skipped,
            failed = report.totals.failed,
            "migration finished"
        );
        Ok(report)
    }

    fn migrate_one(
        &mut self,
        question: LegacyOrderQuestion,
        shape: HistoryShape,
        reconstructor: &mut StepLogReconstructor,
        report: &mut MigrationReport,
    ) {
        let question_id = question.question_id;
        let skip = match classify(&*self.store, question_id) {
            Ok(skip) => skip,
            Err(err) => {
                self.record_failure(
                    report,
                    question_id,
                    QuestionError {
                        phase: QuestionPhase::Pending,
                        error: MigrationError::Read(err.to_string()),
                    },
                    false,
                );
                return;
            }
        };
        if let Some(reason) = skip {
            info!(question_id = %question_id, reason = ?reason, "skipping question");
            report.totals.skipped += 1;
            report
                .skipped_questions
                .push(SkippedQuestion { question_id, reason });
            return;
        }

        let snapshot = match self.read_snapshot(question, shape) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.record_failure(report, question_id, err, false);
                return;
            }
        };

        if let Err(err) = self.store.begin_question(question_id) {
            self.record_failure(
                report,
                question_id,
                QuestionError {
                    phase: QuestionPhase::Pending,
                    error: MigrationError::Read(err.to_string()),
                },
                false,
            );
            return;
        }

        let mut attempt_pass = reconstructor.clone();
        match self
            .apply(&snapshot, shape, &mut attempt_pass)
            .and_then(|counters| {
                self.store
                    .commit_question(question_id)
                    .map_err(|err| QuestionError {
                        phase: QuestionPhase::HistoryRewritten,
                        error: MigrationError::Cleanup(err.to_string()),
                    })?;
                Ok(counters)
            }) {
            Ok(counters) => {
                *reconstructor = attempt_pass;
                report.counters.merge(&counters);
                report.totals.migrated += 1;
                report.migrated_questions.push(question_id);
                info!(question_id = %question_id, "question migrated");
            }
            Err(err) => {
                let rolled_back = match self.store.rollback_question(question_id) {
                    Ok(rolled_back) => rolled_back,
                    Err(rollback_err) => {
                        warn!(
                            question_id = %question_id,
                            error = %rollback_err,
                            "rollback failed"
                        );
                        false
                    }
                };
                self.record_failure(report, question_id, err, rolled_back);
            }
        }
    }

    fn read_snapshot(
        &self,
        legacy: LegacyOrderQuestion,
        shape: HistoryShape,
    ) -> Result<QuestionSnapshot, QuestionError> {
        let question_id = legacy.question_id;
        let pending = QuestionError::at(QuestionPhase::Pending);
        let read = |err: StoreError| MigrationError::Read(err.to_string());

        let context_id = self
            .store
            .category_context(question_id)
            .map_err(read)
            .map_err(&pending)?;
        let prepared = prepare_sub_items(&*self.store, question_id, context_id).map_err(&pending)?;
        let states = if shape.rewrites_states() {
            self.store
                .legacy_states(question_id)
                .map_err(read)
                .map_err(&pending)?
        } else {
            Vec::new()
        };
        let (step_rows, attempts) = if shape.rewrites_steps() {
            (
                self.store
                    .step_data(question_id)
                    .map_err(read)
                    .map_err(&pending)?,
                self.store
                    .attempts(question_id)
                    .map_err(read)
                    .map_err(&pending)?,
            )
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(QuestionSnapshot {
            legacy,
            prepared,
            states,
            step_rows,
            attempts,
        })
    }

    fn apply(
        &mut self,
        snapshot: &QuestionSnapshot,
        shape: HistoryShape,
        reconstructor: &mut StepLogReconstructor,
    ) -> Result<MigrationCounters, QuestionError> {
        let question_id = snapshot.legacy.question_id;
        let mut counters = MigrationCounters::default();

        let transfer = transfer_items(
            &mut *self.store,
            question_id,
            &snapshot.prepared,
            &self.config.salt,
        )
        .map_err(QuestionError::at(QuestionPhase::Pending))?;
        counters.answers_inserted = transfer.inserted;
        counters.answers_updated = transfer.updated;
        counters.attachments_moved = transfer.attachments_moved;

        let flipped = QuestionError::at(QuestionPhase::ItemsTransferred);
        let type_flip = |err: StoreError| MigrationError::TypeFlip(err.to_string());
        self.store
            .insert_ordering_options(&OrderingOptionsInput::from_legacy(&snapshot.legacy))
            .map_err(type_flip)
            .map_err(&flipped)?;
        self.store
            .set_question_type(question_id, ORDERING_QTYPE)
            .map_err(type_flip)
            .map_err(&flipped)?;

        if shape.rewrites_states() {
            counters.legacy_states_rewritten =
                self.rewrite_states(&snapshot.states, &transfer.items)?;
        }
        if shape.rewrites_steps() {
            self.rewrite_steps(snapshot, &transfer.items, reconstructor, &mut counters)?;
        }

        self.store
            .delete_legacy_question(question_id)
            .map_err(|err| QuestionError {
                phase: QuestionPhase::HistoryRewritten,
                error: MigrationError::Cleanup(err.to_string()),
            })?;

        Ok(counters)
    }

    fn rewrite_states(
        &mut self,
        states: &[LegacyState],
        items: &ItemMap,
    ) -> Result<usize, QuestionError> {
        let mut rewritten = 0;
        for state in states {
            let Some(answer) = rewrite_legacy_state(&state.answer, items) else {
                continue;
            };
            self.store
                .update_legacy_state(&LegacyState {
                    answer,
                    ..state.clone()
                })
                .map_err(history_error)?;
            rewritten += 1;
        }
        Ok(rewritten)
    }

    fn rewrite_steps(
        &mut self,
        snapshot: &QuestionSnapshot,
        items: &ItemMap,
        reconstructor: &mut StepLogReconstructor,
        counters: &mut MigrationCounters,
    ) -> Result<(), QuestionError> {
        let plan = reconstructor.plan(
            snapshot.legacy.question_id,
            items,
            &snapshot.step_rows,
            &snapshot.attempts,
        );

        for attempt in &plan.attempt_scrubs {
            self.store
                .update_attempt(attempt)
                .map_err(history_error)?;
        }
        for write in &plan.writes {
            let applied = match write {
                StepDataWrite::Rewrite(datum) => self.store.update_step_datum(datum),
                StepDataWrite::Delete { datum_id, .. } => self.store.delete_step_datum(*datum_id),
            };
            applied.map_err(history_error)?;
        }

        counters.attempts_scrubbed = plan.attempt_scrubs.len();
        counters.step_data_rewritten = plan.rewritten();
        counters.step_data_deleted = plan.deleted();
        counters.step_data_unrecognized = plan.unrecognized();
        Ok(())
    }

    fn record_failure(
        &self,
        report: &mut MigrationReport,
        question_id: QuestionId,
        failure: QuestionError,
        rolled_back: bool,
    ) {
        let kind = FailureKind::of(&failure.error);
        if kind == FailureKind::HistoryRewrite && !rolled_back {
            error!(
                question_id = %question_id,
                error = %failure.error,
                "attempt history partially rewritten and not rolled back; manual review required"
            );
        } else {
            warn!(
                question_id = %question_id,
                phase = ?failure.phase,
                error = %failure.error,
                rolled_back,
                "question migration failed"
            );
        }

        report.totals.failed += 1;
        report.failures.push(QuestionFailure {
            question_id,
            phase: failure.phase,
            kind,
            reason: failure.error.to_string(),
            rolled_back,
        });
    }
}

fn history_error(err: StoreError) -> QuestionError {
    QuestionError {
        phase: QuestionPhase::TypeFlipped,
        error: MigrationError::HistoryRewrite(err.to_string()),
    }
}

fn classify<S: QuestionBank + ?Sized>(
    store: &S,
    question_id: QuestionId,
) -> Result<Option<SkipReason>, StoreError> {
    let Some(question) = store.question(question_id)? else {
        return Ok(Some(SkipReason::QuestionMissing));
    };
    if question.qtype == ORDERING_QTYPE {
        return Ok(Some(SkipReason::AlreadyOrdering));
    }
    if store.has_ordering_options(question_id)? {
        return Ok(Some(SkipReason::OptionsPresent));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBank, FakeFile};
    use crate::{
        AttemptStepDatum, ContentKey, FileArea, LogicalTable, StoredFile, SubItemId,
    };

    fn must<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err:?}"),
        }
    }

    fn config() -> MigrationConfig {
        MigrationConfig::new(Some("pepper".to_string()), false)
    }

    fn step_bank() -> FakeBank {
        let mut bank = FakeBank::with_tables(&[
            LogicalTable::AttemptStepDatum,
            LogicalTable::AttemptStep,
            LogicalTable::Attempt,
        ]);
        bank.add_question(
            QuestionId(42),
            "order",
            &[
                (5, "<p>First</p>", "1"),
                (7, "Second", "2"),
                (9, "Third", "3"),
            ],
        );
        bank.tables.attempts.push(Attempt {
            id: 10,
            question_id: QuestionId(42),
            usage_id: 1,
            slot: 1,
            question_summary: Some("Arrange {First; Second; Third}".to_string()),
            right_answer: Some("First, Second, Third".to_string()),
            response_summary: Some("Second, First, Third".to_string()),
        });
        for (id, step, sequence, name, value) in [
            (1, 100, 0, "_choiceorder", "5,7,9"),
            (2, 100, 0, "_stemorder", "7,5,9"),
            (3, 101, 1, "sub0", "2"),
            (4, 101, 1, "sub1", "1"),
            (5, 101, 1, "sub2", "0"),
            (6, 101, 1, "-finish", "1"),
            (7, 101, 1, "_legacyflag", "x"),
        ] {
            bank.tables.step_rows.push(StepDatumRow {
                datum: AttemptStepDatum {
                    id,
                    attempt_step_id: step,
                    name: name.to_string(),
                    value: value.to_string(),
                },
                attempt_id: 10,
                usage_id: 1,
                slot: 1,
                sequence_number: sequence,
            });
        }
        bank
    }

    fn datum(bank: &FakeBank, id: i64) -> Option<&AttemptStepDatum> {
        bank.tables
            .step_rows
            .iter()
            .map(|row| &row.datum)
            .find(|datum| datum.id == id)
    }

    #[test]
    fn failure_kinds_follow_error_variants() {
        let cases = [
            (MigrationError::Read(String::new()), FailureKind::Read),
            (MigrationError::SchemaDetection(String::new()), FailureKind::Read),
            (MigrationError::ItemTransfer(String::new()), FailureKind::ItemTransfer),
            (MigrationError::TypeFlip(String::new()), FailureKind::TypeFlip),
            (MigrationError::HistoryRewrite(String::new()), FailureKind::HistoryRewrite),
            (MigrationError::Cleanup(String::new()), FailureKind::Cleanup),
        ];
        for (error, kind) in cases {
            assert_eq!(FailureKind::of(&error), kind, "{error}");
        }
    }

    #[test]
    fn unconfirmed_run_writes_nothing() {
        let mut bank = step_bank();
        let before = bank.tables.clone();

        let report = must(MigrationEngine::new(&mut bank, config()).run(false));
        assert_eq!(report.outcome, RunOutcome::NotConfirmed);
        assert_eq!(bank.tables, before);
        assert_eq!(bank.purges, 0);
    }

    #[test]
    fn empty_bank_reports_no_legacy_data() {
        let mut bank = FakeBank::with_tables(&[]);
        let report = must(MigrationEngine::new(&mut bank, config()).run(true));
        assert_eq!(report.outcome, RunOutcome::NoLegacyData);
        assert_eq!(report.history_shape, None);
        assert!(!report.has_failures());
    }

    #[test]
    fn missing_history_tables_abort_the_run() {
        let mut bank = FakeBank::with_tables(&[]);
        bank.add_question(QuestionId(1), "order", &[]);

        let result = MigrationEngine::new(&mut bank, config()).run(true);
        assert!(matches!(result, Err(MigrationError::SchemaDetection(_))));
        assert_eq!(bank.tables.legacy_questions.len(), 1);
    }

    #[test]
    fn step_log_question_is_fully_migrated() {
        let mut bank = step_bank();
        let mut progress = Vec::new();
        let report = {
            let sink = |processed: usize, total: usize, _label: &str| {
                progress.push((processed, total));
            };
            must(
                MigrationEngine::new(&mut bank, config())
                    .with_progress(sink)
                    .run(true),
            )
        };

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.history_shape, Some(HistoryShape::StepLog));
        assert_eq!(report.migrated_questions, vec![QuestionId(42)]);
        assert!(report.caches_purged);
        assert_eq!(progress, vec![(1, 1)]);
        assert_eq!(bank.purges, 1);

        assert_eq!(bank.tables.questions[0].qtype, ORDERING_QTYPE);
        assert_eq!(bank.tables.options.len(), 1);
        assert!(bank.tables.legacy_questions.is_empty());
        assert!(bank.tables.sub_items.is_empty());

        let texts: Vec<&str> = bank
            .tables
            .answers
            .iter()
            .map(|answer| answer.text.as_str())
            .collect();
        assert_eq!(texts, vec!["First", "Second", "Third"]);
        let ids: Vec<i64> = bank.tables.answers.iter().map(|answer| answer.id.0).collect();

        let correct = datum(&bank, 1).cloned();
        assert_eq!(
            correct.map(|value| (value.name, value.value)),
            Some((
                "_correctresponse".to_string(),
                format!("{},{},{}", ids[0], ids[1], ids[2])
            ))
        );

        let response = datum(&bank, 5).cloned();
        let key = |text: &str| ContentKey::derive("pepper", text).to_string();
        assert_eq!(
            response.map(|value| (value.name, value.value)),
            Some((
                "response_42".to_string(),
                format!("{},{},{}", key("Third"), key("First"), key("Second"))
            ))
        );
        assert!(datum(&bank, 3).is_none());
        assert!(datum(&bank, 4).is_none());
        assert!(datum(&bank, 6).is_some());
        assert!(datum(&bank, 7).is_none());

        assert_eq!(report.counters.answers_inserted, 3);
        assert_eq!(report.counters.step_data_unrecognized, 1);
        assert_eq!(report.counters.attempts_scrubbed, 1);
        assert_eq!(
            bank.tables.attempts[0].question_summary.as_deref(),
            Some("Arrange")
        );
    }

    #[test]
    fn options_failure_rolls_back_and_leaves_legacy_rows() {
        let mut bank = step_bank();
        bank.fail_options_for = Some(QuestionId(42));
        let before = bank.tables.clone();

        let report = must(MigrationEngine::new(&mut bank, config()).run(true));
        assert_eq!(report.totals.failed, 1);
        let failure = &report.failures[0];
        assert_eq!(failure.kind, FailureKind::TypeFlip);
        assert_eq!(failure.phase, QuestionPhase::ItemsTransferred);
        assert!(failure.rolled_back);
        assert!(!report.caches_purged);
        assert_eq!(bank.tables, before);
    }

    #[test]
    fn already_migrated_questions_are_skipped() {
        let mut bank = step_bank();
        bank.add_question(QuestionId(43), ORDERING_QTYPE, &[]);
        bank.tables.legacy_questions.push(LegacyOrderQuestion {
            question_id: QuestionId(44),
            horizontal: true,
            feedback: crate::FeedbackSet::default(),
        });

        let inspect = must(MigrationEngine::new(&mut bank, config()).inspect());
        assert_eq!(inspect.pending, vec![QuestionId(42)]);
        assert_eq!(inspect.skipped_questions.len(), 2);

        let report = must(MigrationEngine::new(&mut bank, config()).run(true));
        assert_eq!(report.totals.migrated, 1);
        assert_eq!(
            report.skipped_questions,
            vec![
                SkippedQuestion {
                    question_id: QuestionId(43),
                    reason: SkipReason::AlreadyOrdering,
                },
                SkippedQuestion {
                    question_id: QuestionId(44),
                    reason: SkipReason::QuestionMissing,
                },
            ]
        );
    }

    #[test]
    fn duplicate_fractions_fail_before_any_write() {
        let mut bank = step_bank();
        bank.add_question(QuestionId(50), "order", &[(60, "A", "1"), (61, "B", "1.0")]);

        let report = must(MigrationEngine::new(&mut bank, config()).run(true));
        assert_eq!(report.totals.migrated, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].question_id, QuestionId(50));
        assert_eq!(report.failures[0].kind, FailureKind::ItemTransfer);
        assert!(!report.failures[0].rolled_back);
        assert!(bank
            .tables
            .sub_items
            .iter()
            .all(|sub| sub.question_id == QuestionId(50)));
    }

    #[test]
    fn state_list_history_and_attachments_are_rewritten() {
        let mut bank = FakeBank::with_tables(&[LogicalTable::LegacyState]);
        bank.add_question(QuestionId(42), "order", &[(5, "A", "1"), (7, "B", "2"), (9, "C", "3")]);
        bank.tables.states.push(LegacyState {
            id: 1,
            attempt_id: 10,
            question_id: QuestionId(42),
            answer: "5-1,7-2,9-0".to_string(),
        });
        bank.tables.files.push(FakeFile {
            area: FileArea::LEGACY_SUBQUESTION,
            file: StoredFile {
                id: 1,
                context_id: 5,
                item_id: 7,
                file_path: "/".to_string(),
                file_name: "diagram.png".to_string(),
            },
        });

        let report = must(MigrationEngine::new(&mut bank, config()).run(true));
        assert_eq!(report.counters.legacy_states_rewritten, 1);
        assert_eq!(report.counters.attachments_moved, 1);

        let ids: Vec<String> = bank
            .tables
            .answers
            .iter()
            .map(|answer| answer.id.to_string())
            .collect();
        let joined = ids.join(",");
        assert_eq!(bank.tables.states[0].answer, format!("{joined}:{joined}"));

        assert_eq!(bank.tables.files.len(), 1);
        assert_eq!(bank.tables.files[0].area, FileArea::ANSWER);
        assert_eq!(bank.tables.files[0].file.item_id.to_string(), ids[1]);
    }

    #[test]
    fn rerun_after_partial_transfer_updates_existing_answers() {
        let mut bank = FakeBank::with_tables(&[LogicalTable::LegacyState]);
        bank.add_question(QuestionId(42), "order", &[(5, "<p>A</p>", "1"), (7, "B", "2")]);
        bank.tables.answers.push(crate::Answer {
            id: crate::AnswerId(500),
            question_id: QuestionId(42),
            text: "stale".to_string(),
            text_format: 1,
            fraction: 1.0,
            feedback: String::new(),
            feedback_format: 0,
        });

        let report = must(MigrationEngine::new(&mut bank, config()).run(true));
        assert_eq!(report.counters.answers_updated, 1);
        assert_eq!(report.counters.answers_inserted, 1);
        assert_eq!(bank.tables.answers.len(), 2);
        assert_eq!(bank.tables.answers[0].text, "A");
        assert_eq!(bank.tables.answers[0].id, crate::AnswerId(500));
    }

    #[test]
    fn zero_sub_items_complete_without_stray_records() {
        let mut bank = step_bank();
        bank.tables.sub_items.clear();

        let report = must(MigrationEngine::new(&mut bank, config()).run(true));
        assert_eq!(report.totals.migrated, 1);
        assert!(bank.tables.answers.is_empty());
        assert!(bank
            .tables
            .step_rows
            .iter()
            .all(|row| !row.datum.name.starts_with("sub")));
        assert!(datum(&bank, 6).is_some());
    }

    #[test]
    fn history_failure_is_reported_with_rollback() {
        let mut bank = FakeBank::with_tables(&[LogicalTable::LegacyState]);
        bank.add_question(QuestionId(42), "order", &[(5, "A", "1")]);
        bank.tables.states.push(LegacyState {
            id: 1,
            attempt_id: 10,
            question_id: QuestionId(42),
            answer: "5-1".to_string(),
        });
        bank.fail_history_for = Some(QuestionId(42));

        let report = must(MigrationEngine::new(&mut bank, config()).run(true));
        assert_eq!(report.failures[0].kind, FailureKind::HistoryRewrite);
        assert_eq!(report.failures[0].phase, QuestionPhase::TypeFlipped);
        assert!(report.failures[0].rolled_back);
        assert!(bank.tables.answers.is_empty());
        assert_eq!(bank.tables.sub_items[0].id, SubItemId(5));
    }
}

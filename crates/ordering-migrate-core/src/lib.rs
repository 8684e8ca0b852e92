//! Core of the sequencing → ordering question migration.
//!
//! The crate owns the typed records of the question bank, the string codecs the
//! legacy tables use, the reconstruction planners that rewrite attempt history,
//! and the [`MigrationEngine`] that drives one administrator-confirmed run. The
//! relational store is reached only through the collaborator traits declared
//! here ([`RecordStore`], [`AttachmentStore`], [`CacheInvalidator`],
//! [`ProgressSink`]).

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

pub mod codec;
pub mod engine;
pub mod reconstruct;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use codec::{
    format_id_list, natural_cmp, normalize_item_text, parse_fraction, parse_id_list,
    parse_state_tokens, strip_summary_annotation, ContentKey, NaturalKey, StateToken, StepName,
};
pub use engine::{
    FailureKind, InspectReport, MigrationCounters, MigrationEngine, MigrationReport, NoProgress,
    QuestionFailure, QuestionPhase, QuestionTotals, RunOutcome, SkipReason, SkippedQuestion,
};
pub use reconstruct::{
    rewrite_legacy_state, ItemMap, StepDataPlan, StepDataWrite, StepLogReconstructor,
    TransferredItem,
};
pub use transfer::{prepare_sub_items, transfer_items, PreparedSubItem, TransferOutcome};

pub const ORDERING_QTYPE: &str = "ordering";
pub const REPORT_CONTRACT_VERSION: &str = "migration_report.v1";
pub const INSPECT_CONTRACT_VERSION: &str = "migration_inspect.v1";

/// Text format code used when a legacy row carries no format of its own.
pub const FORMAT_MOODLE: i64 = 0;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("record not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigrationError {
    #[error("schema detection failed: {0}")]
    SchemaDetection(String),
    #[error("failed to read question snapshot: {0}")]
    Read(String),
    #[error("item transfer failed: {0}")]
    ItemTransfer(String),
    #[error("ordering options insert failed: {0}")]
    TypeFlip(String),
    #[error("history rewrite failed: {0}")]
    HistoryRewrite(String),
    #[error("legacy cleanup failed: {0}")]
    Cleanup(String),
}

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(QuestionId);
id_type!(SubItemId);
id_type!(AnswerId);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormattedText {
    pub text: String,
    pub format: i64,
}

impl FormattedText {
    /// Builds a text/format pair from nullable legacy columns.
    #[must_use]
    pub fn from_legacy(text: Option<String>, format: Option<i64>) -> Self {
        Self {
            text: text.unwrap_or_default(),
            format: format.unwrap_or(FORMAT_MOODLE),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedbackSet {
    pub correct: FormattedText,
    pub partially_correct: FormattedText,
    pub incorrect: FormattedText,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegacyOrderQuestion {
    pub question_id: QuestionId,
    pub horizontal: bool,
    pub feedback: FeedbackSet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegacySubItem {
    pub id: SubItemId,
    pub question_id: QuestionId,
    pub text: String,
    pub text_format: i64,
    pub weight_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Question {
    pub id: QuestionId,
    pub category: i64,
    pub qtype: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    pub id: AnswerId,
    pub question_id: QuestionId,
    pub text: String,
    pub text_format: i64,
    pub fraction: f64,
    pub feedback: String,
    pub feedback_format: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerInput {
    pub question_id: QuestionId,
    pub text: String,
    pub text_format: i64,
    pub fraction: f64,
    pub feedback: String,
    pub feedback_format: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LayoutType {
    Vertical,
    Horizontal,
}

impl LayoutType {
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::Vertical => 0,
            Self::Horizontal => 1,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Vertical),
            1 => Some(Self::Horizontal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SelectType {
    All,
}

impl SelectType {
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::All => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum GradingType {
    AbsolutePosition,
}

impl GradingType {
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::AbsolutePosition => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderingOptions {
    pub id: i64,
    pub question_id: QuestionId,
    pub layout: LayoutType,
    pub select_type: SelectType,
    pub select_count: u32,
    pub grading_type: GradingType,
    pub feedback: FeedbackSet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderingOptionsInput {
    pub question_id: QuestionId,
    pub layout: LayoutType,
    pub select_type: SelectType,
    pub select_count: u32,
    pub grading_type: GradingType,
    pub feedback: FeedbackSet,
}

impl OrderingOptionsInput {
    /// Carries layout and feedback over from the legacy question. Selection
    /// is always "all items" and grading mirrors the legacy absolute-position
    /// scoring.
    #[must_use]
    pub fn from_legacy(legacy: &LegacyOrderQuestion) -> Self {
        Self {
            question_id: legacy.question_id,
            layout: if legacy.horizontal {
                LayoutType::Horizontal
            } else {
                LayoutType::Vertical
            },
            select_type: SelectType::All,
            select_count: 0,
            grading_type: GradingType::AbsolutePosition,
            feedback: legacy.feedback.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attempt {
    pub id: i64,
    pub question_id: QuestionId,
    pub usage_id: i64,
    pub slot: i64,
    pub question_summary: Option<String>,
    pub right_answer: Option<String>,
    pub response_summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptStepDatum {
    pub id: i64,
    pub attempt_step_id: i64,
    pub name: String,
    pub value: String,
}

/// One step-data record joined with the step and attempt it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepDatumRow {
    pub datum: AttemptStepDatum,
    pub attempt_id: i64,
    pub usage_id: i64,
    pub slot: i64,
    pub sequence_number: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegacyState {
    pub id: i64,
    pub attempt_id: i64,
    pub question_id: QuestionId,
    pub answer: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FileArea {
    pub component: &'static str,
    pub file_area: &'static str,
}

impl FileArea {
    pub const LEGACY_SUBQUESTION: Self = Self {
        component: "qtype_order",
        file_area: "subquestion",
    };

    pub const ANSWER: Self = Self {
        component: "question",
        file_area: "answer",
    };
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredFile {
    pub id: i64,
    pub context_id: i64,
    pub item_id: i64,
    pub file_path: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LogicalTable {
    LegacyState,
    AttemptStepDatum,
    AttemptStep,
    Attempt,
}

/// Which historical attempt-log layout a run rewrites.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryShape {
    StateList,
    StepLog,
    Dual,
}

impl HistoryShape {
    #[must_use]
    pub fn rewrites_states(self) -> bool {
        matches!(self, Self::StateList | Self::Dual)
    }

    #[must_use]
    pub fn rewrites_steps(self) -> bool {
        matches!(self, Self::StepLog | Self::Dual)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryTables {
    pub legacy_states: bool,
    pub step_data: bool,
    pub steps: bool,
    pub attempts: bool,
}

impl HistoryTables {
    /// Probes the store for each history table.
    ///
    /// # Errors
    /// Returns [`StoreError`] when a probe cannot be executed.
    pub fn probe<S: RecordStore + ?Sized>(store: &S) -> Result<Self, StoreError> {
        Ok(Self {
            legacy_states: store.table_exists(LogicalTable::LegacyState)?,
            step_data: store.table_exists(LogicalTable::AttemptStepDatum)?,
            steps: store.table_exists(LogicalTable::AttemptStep)?,
            attempts: store.table_exists(LogicalTable::Attempt)?,
        })
    }

    /// Resolves the probed tables into the shape to rewrite.
    ///
    /// # Errors
    /// Returns [`MigrationError::SchemaDetection`] when no shape is present,
    /// when the step-log tables are only partially present, or when both
    /// shapes coexist and `allow_dual` is false.
    pub fn resolve(self, allow_dual: bool) -> Result<HistoryShape, MigrationError> {
        let any_step_table = self.step_data || self.steps;
        let step_log = self.step_data && self.steps && self.attempts;

        if any_step_table && !step_log {
            return Err(MigrationError::SchemaDetection(format!(
                "step-log tables are incomplete (step_data={}, steps={}, attempts={})",
                self.step_data, self.steps, self.attempts
            )));
        }

        match (self.legacy_states, step_log) {
            (true, false) => Ok(HistoryShape::StateList),
            (false, true) => Ok(HistoryShape::StepLog),
            (true, true) if allow_dual => Ok(HistoryShape::Dual),
            (true, true) => Err(MigrationError::SchemaDetection(
                "both legacy state and step-log history tables exist; rerun with dual history \
                 allowed after reviewing the installation"
                    .to_string(),
            )),
            (false, false) => Err(MigrationError::SchemaDetection(
                "neither legacy state nor step-log history tables exist".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Install-wide salt mixed into every content key. Empty when the
    /// installation has none configured.
    pub salt: String,
    pub allow_dual_history: bool,
}

impl MigrationConfig {
    #[must_use]
    pub fn new(salt: Option<String>, allow_dual_history: bool) -> Self {
        let salt = match salt {
            Some(value) => value,
            None => {
                tracing::warn!(
                    "no password salt configured; content keys are derived from item text alone"
                );
                String::new()
            }
        };

        Self {
            salt,
            allow_dual_history,
        }
    }
}

/// Typed read/write contract over the question bank tables.
pub trait RecordStore {
    fn table_exists(&self, table: LogicalTable) -> Result<bool, StoreError>;

    fn legacy_questions(&self) -> Result<Vec<LegacyOrderQuestion>, StoreError>;

    fn question(&self, question_id: QuestionId) -> Result<Option<Question>, StoreError>;

    /// Context id of the category the question lives in.
    fn category_context(&self, question_id: QuestionId) -> Result<Option<i64>, StoreError>;

    /// Sub-items ordered by their weight text, which is the correct order.
    fn legacy_sub_items(&self, question_id: QuestionId) -> Result<Vec<LegacySubItem>, StoreError>;

    fn answers(&self, question_id: QuestionId) -> Result<Vec<Answer>, StoreError>;

    fn insert_answer(&mut self, input: &AnswerInput) -> Result<AnswerId, StoreError>;

    fn update_answer(&mut self, answer: &Answer) -> Result<(), StoreError>;

    fn ordering_options(
        &self,
        question_id: QuestionId,
    ) -> Result<Option<OrderingOptions>, StoreError>;

    /// Whether an options row exists, whatever its layout codes hold.
    fn has_ordering_options(&self, question_id: QuestionId) -> Result<bool, StoreError> {
        Ok(self.ordering_options(question_id)?.is_some())
    }

    fn insert_ordering_options(&mut self, input: &OrderingOptionsInput)
        -> Result<i64, StoreError>;

    fn set_question_type(&mut self, question_id: QuestionId, qtype: &str)
        -> Result<(), StoreError>;

    /// Removes the legacy question row and all of its sub-items.
    fn delete_legacy_question(&mut self, question_id: QuestionId) -> Result<(), StoreError>;

    fn legacy_states(&self, question_id: QuestionId) -> Result<Vec<LegacyState>, StoreError>;

    fn update_legacy_state(&mut self, state: &LegacyState) -> Result<(), StoreError>;

    fn step_data(&self, question_id: QuestionId) -> Result<Vec<StepDatumRow>, StoreError>;

    fn attempts(&self, question_id: QuestionId) -> Result<Vec<Attempt>, StoreError>;

    fn update_attempt(&mut self, attempt: &Attempt) -> Result<(), StoreError>;

    fn update_step_datum(&mut self, datum: &AttemptStepDatum) -> Result<(), StoreError>;

    fn delete_step_datum(&mut self, datum_id: i64) -> Result<(), StoreError>;

    /// Opens the transactional boundary for one question.
    fn begin_question(&mut self, _question_id: QuestionId) -> Result<(), StoreError> {
        Ok(())
    }

    fn commit_question(&mut self, _question_id: QuestionId) -> Result<(), StoreError> {
        Ok(())
    }

    /// Discards the writes made since [`RecordStore::begin_question`].
    /// Returns `false` when the store cannot roll back.
    fn rollback_question(&mut self, _question_id: QuestionId) -> Result<bool, StoreError> {
        Ok(false)
    }
}

pub trait AttachmentStore {
    fn list_files(
        &self,
        context_id: i64,
        area: FileArea,
        item_id: i64,
    ) -> Result<Vec<StoredFile>, StoreError>;

    fn copy_file(
        &mut self,
        file: &StoredFile,
        area: FileArea,
        item_id: i64,
    ) -> Result<(), StoreError>;

    fn delete_files(
        &mut self,
        context_id: i64,
        area: FileArea,
        item_id: i64,
    ) -> Result<(), StoreError>;
}

pub trait CacheInvalidator {
    /// Flushes every derived/cached value. Idempotent.
    fn purge_all(&mut self) -> Result<(), StoreError>;
}

pub trait ProgressSink {
    fn update(&mut self, processed: usize, total: usize, label: &str);
}

impl<F> ProgressSink for F
where
    F: FnMut(usize, usize, &str),
{
    fn update(&mut self, processed: usize, total: usize, label: &str) {
        self(processed, total, label);
    }
}

/// Everything the engine needs from one backing installation.
pub trait QuestionBank: RecordStore + AttachmentStore + CacheInvalidator {}

impl<T> QuestionBank for T where T: RecordStore + AttachmentStore + CacheInvalidator {}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`MigrationError::Read`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, MigrationError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| MigrationError::Read(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

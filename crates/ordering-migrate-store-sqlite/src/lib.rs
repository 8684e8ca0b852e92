#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ordering_migrate_core::{
    Answer, AnswerId, AnswerInput, Attempt, AttachmentStore, AttemptStepDatum, CacheInvalidator,
    FeedbackSet, FileArea, FormattedText, GradingType, LayoutType, LegacyOrderQuestion,
    LegacyState, LegacySubItem, LogicalTable, OrderingOptions, OrderingOptionsInput, Question,
    QuestionId, RecordStore, SelectType, StepDatumRow, StoreError, StoredFile, SubItemId,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

const FEEDBACK_FIELDS: [&str; 3] = [
    "correctfeedback",
    "partiallycorrectfeedback",
    "incorrectfeedback",
];

const CACHE_REVISION_KEY: &str = "cacherev";

const SCHEMA_QUESTION_BANK: &str = r"
CREATE TABLE IF NOT EXISTS question (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  category INTEGER NOT NULL,
  name TEXT NOT NULL DEFAULT '',
  qtype TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS question_categories (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  contextid INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS question_order (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  question INTEGER NOT NULL,
  horizontal INTEGER NOT NULL DEFAULT 0,
  correctfeedback TEXT,
  correctfeedbackformat INTEGER,
  partiallycorrectfeedback TEXT,
  partiallycorrectfeedbackformat INTEGER,
  incorrectfeedback TEXT,
  incorrectfeedbackformat INTEGER
);

CREATE TABLE IF NOT EXISTS question_order_sub (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  question INTEGER NOT NULL,
  questiontext TEXT NOT NULL DEFAULT '',
  questiontextformat INTEGER NOT NULL DEFAULT 0,
  answertext TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS question_answers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  question INTEGER NOT NULL,
  answer TEXT NOT NULL,
  answerformat INTEGER NOT NULL DEFAULT 0,
  fraction REAL NOT NULL DEFAULT 0,
  feedback TEXT NOT NULL DEFAULT '',
  feedbackformat INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS qtype_ordering_options (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  questionid INTEGER NOT NULL UNIQUE,
  layouttype INTEGER NOT NULL DEFAULT 0,
  selecttype INTEGER NOT NULL DEFAULT 0,
  selectcount INTEGER NOT NULL DEFAULT 0,
  gradingtype INTEGER NOT NULL DEFAULT 0,
  correctfeedback TEXT NOT NULL DEFAULT '',
  correctfeedbackformat INTEGER NOT NULL DEFAULT 0,
  partiallycorrectfeedback TEXT NOT NULL DEFAULT '',
  partiallycorrectfeedbackformat INTEGER NOT NULL DEFAULT 0,
  incorrectfeedback TEXT NOT NULL DEFAULT '',
  incorrectfeedbackformat INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS files (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  contextid INTEGER NOT NULL,
  component TEXT NOT NULL,
  filearea TEXT NOT NULL,
  itemid INTEGER NOT NULL,
  filepath TEXT NOT NULL DEFAULT '/',
  filename TEXT NOT NULL,
  content BLOB
);

CREATE TABLE IF NOT EXISTS config (
  name TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
";

const SCHEMA_STATE_LIST: &str = r"
CREATE TABLE IF NOT EXISTS question_states (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  attempt INTEGER NOT NULL,
  question INTEGER NOT NULL,
  answer TEXT NOT NULL DEFAULT ''
);
";

const SCHEMA_STEP_LOG: &str = r"
CREATE TABLE IF NOT EXISTS question_attempts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  questionusageid INTEGER NOT NULL,
  slot INTEGER NOT NULL,
  questionid INTEGER NOT NULL,
  questionsummary TEXT,
  rightanswer TEXT,
  responsesummary TEXT
);

CREATE TABLE IF NOT EXISTS question_attempt_steps (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  questionattemptid INTEGER NOT NULL,
  sequencenumber INTEGER NOT NULL,
  state TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS question_attempt_step_data (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  attemptstepid INTEGER NOT NULL,
  name TEXT NOT NULL,
  value TEXT NOT NULL DEFAULT ''
);
";

/// Which attempt-history tables a fixture database carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureHistory {
    None,
    StateList,
    StepLog,
    Both,
}

/// Question bank adapter over a Moodle-shaped SQLite database.
pub struct SqliteQuestionBank {
    conn: Connection,
}

impl SqliteQuestionBank {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Verifies the tables every run reads or writes regardless of the
    /// history layout.
    pub fn check_compatibility(&self) -> Result<()> {
        let required: [(&str, &[&str]); 6] = [
            ("question", &["id", "category", "qtype"]),
            ("question_categories", &["id", "contextid"]),
            ("question_order", &["question", "horizontal"]),
            (
                "question_order_sub",
                &["id", "question", "questiontext", "answertext"],
            ),
            (
                "question_answers",
                &["id", "question", "answer", "fraction"],
            ),
            (
                "qtype_ordering_options",
                &["id", "questionid", "layouttype", "selecttype", "gradingtype"],
            ),
        ];

        for (table, columns) in required {
            if !table_exists(&self.conn, table)? {
                return Err(anyhow!(
                    "question bank compatibility check failed: expected table {table}"
                ));
            }
            ensure_table_has_columns(&self.conn, table, columns)?;
        }
        Ok(())
    }

    fn load_legacy_questions(&self) -> Result<Vec<LegacyOrderQuestion>> {
        let columns = table_columns(&self.conn, "question_order")?;
        let mut select = vec!["question".to_string(), "horizontal".to_string()];
        for field in FEEDBACK_FIELDS {
            for column in [field.to_string(), format!("{field}format")] {
                if columns.iter().any(|candidate| *candidate == column) {
                    select.push(column);
                } else {
                    debug!(column = %column, "legacy feedback column absent, reading as NULL");
                    select.push("NULL".to_string());
                }
            }
        }

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM question_order ORDER BY question, id",
                select.join(", ")
            ))
            .context("failed to prepare legacy question query")?;
        let rows = stmt.query_map([], |row| {
            let feedback = |offset: usize| -> rusqlite::Result<FormattedText> {
                Ok(FormattedText::from_legacy(
                    row.get(offset)?,
                    row.get(offset + 1)?,
                ))
            };
            Ok(LegacyOrderQuestion {
                question_id: QuestionId(row.get(0)?),
                horizontal: row.get::<_, Option<i64>>(1)?.unwrap_or(0) != 0,
                feedback: FeedbackSet {
                    correct: feedback(2)?,
                    partially_correct: feedback(4)?,
                    incorrect: feedback(6)?,
                },
            })
        })?;
        collect_rows(rows)
    }

    fn load_question(&self, question_id: QuestionId) -> Result<Option<Question>> {
        self.conn
            .query_row(
                "SELECT id, category, qtype FROM question WHERE id = ?1",
                params![question_id.0],
                |row| {
                    Ok(Question {
                        id: QuestionId(row.get(0)?),
                        category: row.get(1)?,
                        qtype: row.get(2)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load question {question_id}"))
    }

    fn load_category_context(&self, question_id: QuestionId) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT qc.contextid
                 FROM question_categories qc
                 JOIN question q ON q.category = qc.id
                 WHERE q.id = ?1",
                params![question_id.0],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to resolve category context of question {question_id}"))
    }

    fn load_sub_items(&self, question_id: QuestionId) -> Result<Vec<LegacySubItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, question, questiontext, questiontextformat, answertext
             FROM question_order_sub
             WHERE question = ?1
             ORDER BY answertext, id",
        )?;
        let rows = stmt.query_map(params![question_id.0], |row| {
            Ok(LegacySubItem {
                id: SubItemId(row.get(0)?),
                question_id: QuestionId(row.get(1)?),
                text: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                text_format: row.get::<_, Option<i64>>(3)?.unwrap_or_default(),
                weight_text: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            })
        })?;
        collect_rows(rows)
            .with_context(|| format!("failed to load sub-items of question {question_id}"))
    }

    fn load_answers(&self, question_id: QuestionId) -> Result<Vec<Answer>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, question, answer, answerformat, fraction, feedback, feedbackformat
             FROM question_answers
             WHERE question = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![question_id.0], |row| {
            Ok(Answer {
                id: AnswerId(row.get(0)?),
                question_id: QuestionId(row.get(1)?),
                text: row.get(2)?,
                text_format: row.get(3)?,
                fraction: row.get(4)?,
                feedback: row.get(5)?,
                feedback_format: row.get(6)?,
            })
        })?;
        collect_rows(rows).with_context(|| format!("failed to load answers of question {question_id}"))
    }

    fn ordering_options_exist(&self, question_id: QuestionId) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM qtype_ordering_options WHERE questionid = ?1 LIMIT 1",
                params![question_id.0],
                |_| Ok(()),
            )
            .optional()
            .with_context(|| format!("failed to probe ordering options of question {question_id}"))?
            .is_some();
        Ok(exists)
    }

    fn load_ordering_options(&self, question_id: QuestionId) -> Result<Option<OrderingOptions>> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, layouttype, selecttype, selectcount, gradingtype,
                        correctfeedback, correctfeedbackformat,
                        partiallycorrectfeedback, partiallycorrectfeedbackformat,
                        incorrectfeedback, incorrectfeedbackformat
                 FROM qtype_ordering_options
                 WHERE questionid = ?1",
                params![question_id.0],
                |row| {
                    let feedback = |offset: usize| -> rusqlite::Result<FormattedText> {
                        Ok(FormattedText::from_legacy(
                            row.get(offset)?,
                            row.get(offset + 1)?,
                        ))
                    };
                    Ok((
                        row.get::<_, i64>(0)?,
                        [
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                        ],
                        FeedbackSet {
                            correct: feedback(5)?,
                            partially_correct: feedback(7)?,
                            incorrect: feedback(9)?,
                        },
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to load ordering options of question {question_id}"))?;

        let Some((id, [layout, select_type, select_count, grading_type], feedback)) = raw else {
            return Ok(None);
        };
        let layout = LayoutType::from_code(layout)
            .ok_or_else(|| anyhow!("unsupported layouttype {layout} for question {question_id}"))?;
        if select_type != SelectType::All.code() {
            return Err(anyhow!(
                "unsupported selecttype {select_type} for question {question_id}"
            ));
        }
        if grading_type != GradingType::AbsolutePosition.code() {
            return Err(anyhow!(
                "unsupported gradingtype {grading_type} for question {question_id}"
            ));
        }

        Ok(Some(OrderingOptions {
            id,
            question_id,
            layout,
            select_type: SelectType::All,
            select_count: u32::try_from(select_count)
                .with_context(|| format!("invalid selectcount {select_count}"))?,
            grading_type: GradingType::AbsolutePosition,
            feedback,
        }))
    }

    fn load_legacy_states(&self, question_id: QuestionId) -> Result<Vec<LegacyState>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, attempt, question, answer
             FROM question_states
             WHERE question = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![question_id.0], |row| {
            Ok(LegacyState {
                id: row.get(0)?,
                attempt_id: row.get(1)?,
                question_id: QuestionId(row.get(2)?),
                answer: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            })
        })?;
        collect_rows(rows)
            .with_context(|| format!("failed to load legacy states of question {question_id}"))
    }

    fn load_step_data(&self, question_id: QuestionId) -> Result<Vec<StepDatumRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT d.id, d.attemptstepid, d.name, d.value,
                    s.questionattemptid, a.questionusageid, a.slot, s.sequencenumber
             FROM question_attempt_step_data d
             JOIN question_attempt_steps s ON s.id = d.attemptstepid
             JOIN question_attempts a ON a.id = s.questionattemptid
             WHERE a.questionid = ?1
             ORDER BY a.questionusageid, a.slot, s.sequencenumber, length(d.name), d.name, d.id",
        )?;
        let rows = stmt.query_map(params![question_id.0], |row| {
            Ok(StepDatumRow {
                datum: AttemptStepDatum {
                    id: row.get(0)?,
                    attempt_step_id: row.get(1)?,
                    name: row.get(2)?,
                    value: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                },
                attempt_id: row.get(4)?,
                usage_id: row.get(5)?,
                slot: row.get(6)?,
                sequence_number: row.get(7)?,
            })
        })?;
        collect_rows(rows)
            .with_context(|| format!("failed to load step data of question {question_id}"))
    }

    fn load_attempts(&self, question_id: QuestionId) -> Result<Vec<Attempt>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, questionid, questionusageid, slot, questionsummary, rightanswer, responsesummary
             FROM question_attempts
             WHERE questionid = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![question_id.0], |row| {
            Ok(Attempt {
                id: row.get(0)?,
                question_id: QuestionId(row.get(1)?),
                usage_id: row.get(2)?,
                slot: row.get(3)?,
                question_summary: row.get(4)?,
                right_answer: row.get(5)?,
                response_summary: row.get(6)?,
            })
        })?;
        collect_rows(rows).with_context(|| format!("failed to load attempts of question {question_id}"))
    }

    fn load_files(&self, context_id: i64, area: FileArea, item_id: i64) -> Result<Vec<StoredFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, contextid, itemid, filepath, filename
             FROM files
             WHERE contextid = ?1 AND component = ?2 AND filearea = ?3 AND itemid = ?4
             ORDER BY filepath, filename, id",
        )?;
        let rows = stmt.query_map(
            params![context_id, area.component, area.file_area, item_id],
            |row| {
                Ok(StoredFile {
                    id: row.get(0)?,
                    context_id: row.get(1)?,
                    item_id: row.get(2)?,
                    file_path: row.get(3)?,
                    file_name: row.get(4)?,
                })
            },
        )?;
        collect_rows(rows).with_context(|| {
            format!(
                "failed to list files in {}/{} item {item_id}",
                area.component, area.file_area
            )
        })
    }

    fn execute_write(&self, sql: &str, params: impl rusqlite::Params, what: &str) -> Result<usize> {
        self.conn
            .execute(sql, params)
            .with_context(|| format!("failed to {what}"))
    }

    fn bump_cache_revision(&self) -> Result<()> {
        let updated = self.execute_write(
            "UPDATE config SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT) WHERE name = ?1",
            params![CACHE_REVISION_KEY],
            "bump cache revision",
        )?;
        if updated == 0 {
            self.execute_write(
                "INSERT INTO config(name, value) VALUES (?1, '1')",
                params![CACHE_REVISION_KEY],
                "seed cache revision",
            )?;
        }
        debug!("cache revision bumped");
        Ok(())
    }
}

fn backend(err: anyhow::Error) -> StoreError {
    StoreError::Backend(format!("{err:#}"))
}

fn savepoint_name(question_id: QuestionId) -> String {
    format!("ordmig_question_{}", question_id.0)
}

fn table_for(table: LogicalTable) -> &'static str {
    match table {
        LogicalTable::LegacyState => "question_states",
        LogicalTable::AttemptStepDatum => "question_attempt_step_data",
        LogicalTable::AttemptStep => "question_attempt_steps",
        LogicalTable::Attempt => "question_attempts",
    }
}

impl RecordStore for SqliteQuestionBank {
    fn table_exists(&self, table: LogicalTable) -> Result<bool, StoreError> {
        table_exists(&self.conn, table_for(table)).map_err(backend)
    }

    fn legacy_questions(&self) -> Result<Vec<LegacyOrderQuestion>, StoreError> {
        self.load_legacy_questions().map_err(backend)
    }

    fn question(&self, question_id: QuestionId) -> Result<Option<Question>, StoreError> {
        self.load_question(question_id).map_err(backend)
    }

    fn category_context(&self, question_id: QuestionId) -> Result<Option<i64>, StoreError> {
        self.load_category_context(question_id).map_err(backend)
    }

    fn legacy_sub_items(&self, question_id: QuestionId) -> Result<Vec<LegacySubItem>, StoreError> {
        self.load_sub_items(question_id).map_err(backend)
    }

    fn answers(&self, question_id: QuestionId) -> Result<Vec<Answer>, StoreError> {
        self.load_answers(question_id).map_err(backend)
    }

    fn insert_answer(&mut self, input: &AnswerInput) -> Result<AnswerId, StoreError> {
        self.execute_write(
            "INSERT INTO question_answers(question, answer, answerformat, fraction, feedback, feedbackformat)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                input.question_id.0,
                input.text,
                input.text_format,
                input.fraction,
                input.feedback,
                input.feedback_format
            ],
            "insert answer",
        )
        .map_err(backend)?;
        Ok(AnswerId(self.conn.last_insert_rowid()))
    }

    fn update_answer(&mut self, answer: &Answer) -> Result<(), StoreError> {
        let updated = self
            .execute_write(
                "UPDATE question_answers
                 SET answer = ?2, answerformat = ?3, fraction = ?4, feedback = ?5, feedbackformat = ?6
                 WHERE id = ?1",
                params![
                    answer.id.0,
                    answer.text,
                    answer.text_format,
                    answer.fraction,
                    answer.feedback,
                    answer.feedback_format
                ],
                "update answer",
            )
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("answer {}", answer.id)));
        }
        Ok(())
    }

    fn ordering_options(
        &self,
        question_id: QuestionId,
    ) -> Result<Option<OrderingOptions>, StoreError> {
        self.load_ordering_options(question_id).map_err(backend)
    }

    fn has_ordering_options(&self, question_id: QuestionId) -> Result<bool, StoreError> {
        self.ordering_options_exist(question_id).map_err(backend)
    }

    fn insert_ordering_options(
        &mut self,
        input: &OrderingOptionsInput,
    ) -> Result<i64, StoreError> {
        let feedback = &input.feedback;
        self.execute_write(
            "INSERT INTO qtype_ordering_options(
                questionid, layouttype, selecttype, selectcount, gradingtype,
                correctfeedback, correctfeedbackformat,
                partiallycorrectfeedback, partiallycorrectfeedbackformat,
                incorrectfeedback, incorrectfeedbackformat
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                input.question_id.0,
                input.layout.code(),
                input.select_type.code(),
                i64::from(input.select_count),
                input.grading_type.code(),
                feedback.correct.text,
                feedback.correct.format,
                feedback.partially_correct.text,
                feedback.partially_correct.format,
                feedback.incorrect.text,
                feedback.incorrect.format
            ],
            "insert ordering options",
        )
        .map_err(backend)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn set_question_type(
        &mut self,
        question_id: QuestionId,
        qtype: &str,
    ) -> Result<(), StoreError> {
        let updated = self
            .execute_write(
                "UPDATE question SET qtype = ?2 WHERE id = ?1",
                params![question_id.0, qtype],
                "set question type",
            )
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("question {question_id}")));
        }
        Ok(())
    }

    fn delete_legacy_question(&mut self, question_id: QuestionId) -> Result<(), StoreError> {
        self.execute_write(
            "DELETE FROM question_order_sub WHERE question = ?1",
            params![question_id.0],
            "delete legacy sub-items",
        )
        .map_err(backend)?;
        self.execute_write(
            "DELETE FROM question_order WHERE question = ?1",
            params![question_id.0],
            "delete legacy question",
        )
        .map_err(backend)?;
        Ok(())
    }

    fn legacy_states(&self, question_id: QuestionId) -> Result<Vec<LegacyState>, StoreError> {
        self.load_legacy_states(question_id).map_err(backend)
    }

    fn update_legacy_state(&mut self, state: &LegacyState) -> Result<(), StoreError> {
        self.execute_write(
            "UPDATE question_states SET answer = ?2 WHERE id = ?1",
            params![state.id, state.answer],
            "update legacy state",
        )
        .map_err(backend)?;
        Ok(())
    }

    fn step_data(&self, question_id: QuestionId) -> Result<Vec<StepDatumRow>, StoreError> {
        self.load_step_data(question_id).map_err(backend)
    }

    fn attempts(&self, question_id: QuestionId) -> Result<Vec<Attempt>, StoreError> {
        self.load_attempts(question_id).map_err(backend)
    }

    fn update_attempt(&mut self, attempt: &Attempt) -> Result<(), StoreError> {
        self.execute_write(
            "UPDATE question_attempts
             SET questionsummary = ?2, rightanswer = ?3, responsesummary = ?4
             WHERE id = ?1",
            params![
                attempt.id,
                attempt.question_summary,
                attempt.right_answer,
                attempt.response_summary
            ],
            "update attempt summary",
        )
        .map_err(backend)?;
        Ok(())
    }

    fn update_step_datum(&mut self, datum: &AttemptStepDatum) -> Result<(), StoreError> {
        self.execute_write(
            "UPDATE question_attempt_step_data SET name = ?2, value = ?3 WHERE id = ?1",
            params![datum.id, datum.name, datum.value],
            "rewrite step data",
        )
        .map_err(backend)?;
        Ok(())
    }

    fn delete_step_datum(&mut self, datum_id: i64) -> Result<(), StoreError> {
        self.execute_write(
            "DELETE FROM question_attempt_step_data WHERE id = ?1",
            params![datum_id],
            "delete step data",
        )
        .map_err(backend)?;
        Ok(())
    }

    fn begin_question(&mut self, question_id: QuestionId) -> Result<(), StoreError> {
        self.conn
            .execute_batch(&format!("SAVEPOINT {}", savepoint_name(question_id)))
            .with_context(|| format!("failed to open savepoint for question {question_id}"))
            .map_err(backend)
    }

    fn commit_question(&mut self, question_id: QuestionId) -> Result<(), StoreError> {
        self.conn
            .execute_batch(&format!("RELEASE SAVEPOINT {}", savepoint_name(question_id)))
            .with_context(|| format!("failed to release savepoint for question {question_id}"))
            .map_err(backend)
    }

    fn rollback_question(&mut self, question_id: QuestionId) -> Result<bool, StoreError> {
        let name = savepoint_name(question_id);
        debug!(question_id = %question_id, savepoint = %name, "rolling back question");
        self.conn
            .execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name};"
            ))
            .with_context(|| format!("failed to roll back question {question_id}"))
            .map_err(backend)?;
        Ok(true)
    }
}

impl AttachmentStore for SqliteQuestionBank {
    fn list_files(
        &self,
        context_id: i64,
        area: FileArea,
        item_id: i64,
    ) -> Result<Vec<StoredFile>, StoreError> {
        self.load_files(context_id, area, item_id).map_err(backend)
    }

    fn copy_file(
        &mut self,
        file: &StoredFile,
        area: FileArea,
        item_id: i64,
    ) -> Result<(), StoreError> {
        let copied = self
            .execute_write(
                "INSERT INTO files(contextid, component, filearea, itemid, filepath, filename, content)
                 SELECT contextid, ?2, ?3, ?4, filepath, filename, content
                 FROM files
                 WHERE id = ?1",
                params![file.id, area.component, area.file_area, item_id],
                "copy attachment",
            )
            .map_err(backend)?;
        if copied == 0 {
            return Err(StoreError::NotFound(format!("file {}", file.id)));
        }
        Ok(())
    }

    fn delete_files(
        &mut self,
        context_id: i64,
        area: FileArea,
        item_id: i64,
    ) -> Result<(), StoreError> {
        self.execute_write(
            "DELETE FROM files
             WHERE contextid = ?1 AND component = ?2 AND filearea = ?3 AND itemid = ?4",
            params![context_id, area.component, area.file_area, item_id],
            "delete legacy attachments",
        )
        .map_err(backend)?;
        Ok(())
    }
}

impl CacheInvalidator for SqliteQuestionBank {
    fn purge_all(&mut self) -> Result<(), StoreError> {
        self.bump_cache_revision().map_err(backend)
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }
    Ok(available)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let available = table_columns(conn, table_name)?;
    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "question bank compatibility check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

/// Creates the question bank tables plus the requested history layout.
/// Used by fixtures; production databases already carry these tables.
pub fn create_question_bank_schema(conn: &Connection, history: FixtureHistory) -> Result<()> {
    conn.execute_batch(SCHEMA_QUESTION_BANK)
        .context("failed to create question bank tables")?;
    if matches!(history, FixtureHistory::StateList | FixtureHistory::Both) {
        conn.execute_batch(SCHEMA_STATE_LIST)
            .context("failed to create legacy state table")?;
    }
    if matches!(history, FixtureHistory::StepLog | FixtureHistory::Both) {
        conn.execute_batch(SCHEMA_STEP_LOG)
            .context("failed to create step-log tables")?;
    }
    Ok(())
}

/// Seeds one legacy sequencing question with its sub-items as
/// `(text, weight)` pairs. Returns the sub-item ids in input order.
pub fn seed_legacy_question(
    conn: &Connection,
    question_id: QuestionId,
    context_id: i64,
    sub_items: &[(&str, &str)],
) -> Result<Vec<SubItemId>> {
    conn.execute(
        "INSERT INTO question_categories(contextid) VALUES (?1)",
        params![context_id],
    )
    .context("failed to seed question category")?;
    let category = conn.last_insert_rowid();

    conn.execute(
        "INSERT INTO question(id, category, name, qtype) VALUES (?1, ?2, ?3, 'order')",
        params![question_id.0, category, format!("Sequencing {}", question_id.0)],
    )
    .context("failed to seed question row")?;
    conn.execute(
        "INSERT INTO question_order(question, horizontal, correctfeedback, correctfeedbackformat)
         VALUES (?1, 0, 'Well done', 1)",
        params![question_id.0],
    )
    .context("failed to seed legacy question row")?;

    let mut ids = Vec::with_capacity(sub_items.len());
    for (text, weight) in sub_items {
        conn.execute(
            "INSERT INTO question_order_sub(question, questiontext, questiontextformat, answertext)
             VALUES (?1, ?2, 1, ?3)",
            params![question_id.0, text, weight],
        )
        .context("failed to seed legacy sub-item")?;
        ids.push(SubItemId(conn.last_insert_rowid()));
    }
    Ok(ids)
}

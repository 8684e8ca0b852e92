//! In-memory question bank used by the unit tests of this crate.

use std::collections::BTreeSet;

use crate::{
    Answer, AnswerId, AnswerInput, Attempt, AttemptStepDatum, AttachmentStore, CacheInvalidator,
    FileArea, LegacyOrderQuestion, LegacyState, LegacySubItem, LogicalTable, OrderingOptions,
    OrderingOptionsInput, Question, QuestionId, RecordStore, StepDatumRow, StoreError, StoredFile,
};

#[derive(Debug, Clone, PartialEq)]
pub struct FakeFile {
    pub area: FileArea,
    pub file: StoredFile,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FakeTables {
    pub legacy_questions: Vec<LegacyOrderQuestion>,
    pub questions: Vec<Question>,
    pub contexts: Vec<(QuestionId, i64)>,
    pub sub_items: Vec<LegacySubItem>,
    pub answers: Vec<Answer>,
    pub options: Vec<OrderingOptions>,
    pub states: Vec<LegacyState>,
    pub step_rows: Vec<StepDatumRow>,
    pub attempts: Vec<Attempt>,
    pub files: Vec<FakeFile>,
    pub next_id: i64,
}

#[derive(Debug, Default)]
pub struct FakeBank {
    pub tables: FakeTables,
    pub present: BTreeSet<&'static str>,
    pub fail_options_for: Option<QuestionId>,
    pub fail_history_for: Option<QuestionId>,
    pub purges: usize,
    savepoint: Option<FakeTables>,
}

fn table_name(table: LogicalTable) -> &'static str {
    match table {
        LogicalTable::LegacyState => "states",
        LogicalTable::AttemptStepDatum => "step_data",
        LogicalTable::AttemptStep => "steps",
        LogicalTable::Attempt => "attempts",
    }
}

impl FakeBank {
    pub fn with_tables(tables: &[LogicalTable]) -> Self {
        Self {
            tables: FakeTables {
                next_id: 1000,
                ..FakeTables::default()
            },
            present: tables.iter().copied().map(table_name).collect(),
            ..Self::default()
        }
    }

    pub fn add_question(&mut self, question_id: QuestionId, qtype: &str, subs: &[(i64, &str, &str)]) {
        self.tables.legacy_questions.push(LegacyOrderQuestion {
            question_id,
            horizontal: false,
            feedback: crate::FeedbackSet::default(),
        });
        self.tables.questions.push(Question {
            id: question_id,
            category: 1,
            qtype: qtype.to_string(),
        });
        self.tables.contexts.push((question_id, 5));
        for (id, text, weight) in subs {
            self.tables.sub_items.push(LegacySubItem {
                id: crate::SubItemId(*id),
                question_id,
                text: (*text).to_string(),
                text_format: 1,
                weight_text: (*weight).to_string(),
            });
        }
    }

    fn next_id(&mut self) -> i64 {
        self.tables.next_id += 1;
        self.tables.next_id
    }
}

impl RecordStore for FakeBank {
    fn table_exists(&self, table: LogicalTable) -> Result<bool, StoreError> {
        Ok(self.present.contains(table_name(table)))
    }

    fn legacy_questions(&self) -> Result<Vec<LegacyOrderQuestion>, StoreError> {
        Ok(self.tables.legacy_questions.clone())
    }

    fn question(&self, question_id: QuestionId) -> Result<Option<Question>, StoreError> {
        Ok(self
            .tables
            .questions
            .iter()
            .find(|question| question.id == question_id)
            .cloned())
    }

    fn category_context(&self, question_id: QuestionId) -> Result<Option<i64>, StoreError> {
        Ok(self
            .tables
            .contexts
            .iter()
            .find(|(id, _)| *id == question_id)
            .map(|(_, context)| *context))
    }

    fn legacy_sub_items(&self, question_id: QuestionId) -> Result<Vec<LegacySubItem>, StoreError> {
        let mut subs: Vec<LegacySubItem> = self
            .tables
            .sub_items
            .iter()
            .filter(|sub| sub.question_id == question_id)
            .cloned()
            .collect();
        subs.sort_by(|lhs, rhs| lhs.weight_text.cmp(&rhs.weight_text));
        Ok(subs)
    }

    fn answers(&self, question_id: QuestionId) -> Result<Vec<Answer>, StoreError> {
        Ok(self
            .tables
            .answers
            .iter()
            .filter(|answer| answer.question_id == question_id)
            .cloned()
            .collect())
    }

    fn insert_answer(&mut self, input: &AnswerInput) -> Result<AnswerId, StoreError> {
        let id = AnswerId(self.next_id());
        self.tables.answers.push(Answer {
            id,
            question_id: input.question_id,
            text: input.text.clone(),
            text_format: input.text_format,
            fraction: input.fraction,
            feedback: input.feedback.clone(),
            feedback_format: input.feedback_format,
        });
        Ok(id)
    }

    fn update_answer(&mut self, answer: &Answer) -> Result<(), StoreError> {
        let Some(slot) = self.tables.answers.iter_mut().find(|row| row.id == answer.id) else {
            return Err(StoreError::NotFound(format!("answer {}", answer.id)));
        };
        *slot = answer.clone();
        Ok(())
    }

    fn ordering_options(
        &self,
        question_id: QuestionId,
    ) -> Result<Option<OrderingOptions>, StoreError> {
        Ok(self
            .tables
            .options
            .iter()
            .find(|options| options.question_id == question_id)
            .cloned())
    }

    fn insert_ordering_options(
        &mut self,
        input: &OrderingOptionsInput,
    ) -> Result<i64, StoreError> {
        if self.fail_options_for == Some(input.question_id) {
            return Err(StoreError::Backend("options insert rejected".to_string()));
        }
        let id = self.next_id();
        self.tables.options.push(OrderingOptions {
            id,
            question_id: input.question_id,
            layout: input.layout,
            select_type: input.select_type,
            select_count: input.select_count,
            grading_type: input.grading_type,
            feedback: input.feedback.clone(),
        });
        Ok(id)
    }

    fn set_question_type(
        &mut self,
        question_id: QuestionId,
        qtype: &str,
    ) -> Result<(), StoreError> {
        for question in &mut self.tables.questions {
            if question.id == question_id {
                question.qtype = qtype.to_string();
            }
        }
        Ok(())
    }

    fn delete_legacy_question(&mut self, question_id: QuestionId) -> Result<(), StoreError> {
        self.tables
            .legacy_questions
            .retain(|legacy| legacy.question_id != question_id);
        self.tables
            .sub_items
            .retain(|sub| sub.question_id != question_id);
        Ok(())
    }

    fn legacy_states(&self, question_id: QuestionId) -> Result<Vec<LegacyState>, StoreError> {
        Ok(self
            .tables
            .states
            .iter()
            .filter(|state| state.question_id == question_id)
            .cloned()
            .collect())
    }

    fn update_legacy_state(&mut self, state: &LegacyState) -> Result<(), StoreError> {
        if self.fail_history_for == Some(state.question_id) {
            return Err(StoreError::Backend("state update rejected".to_string()));
        }
        for row in &mut self.tables.states {
            if row.id == state.id {
                row.answer.clone_from(&state.answer);
            }
        }
        Ok(())
    }

    fn step_data(&self, question_id: QuestionId) -> Result<Vec<StepDatumRow>, StoreError> {
        let attempts: BTreeSet<i64> = self
            .tables
            .attempts
            .iter()
            .filter(|attempt| attempt.question_id == question_id)
            .map(|attempt| attempt.id)
            .collect();
        Ok(self
            .tables
            .step_rows
            .iter()
            .filter(|row| attempts.contains(&row.attempt_id))
            .cloned()
            .collect())
    }

    fn attempts(&self, question_id: QuestionId) -> Result<Vec<Attempt>, StoreError> {
        Ok(self
            .tables
            .attempts
            .iter()
            .filter(|attempt| attempt.question_id == question_id)
            .cloned()
            .collect())
    }

    fn update_attempt(&mut self, attempt: &Attempt) -> Result<(), StoreError> {
        for row in &mut self.tables.attempts {
            if row.id == attempt.id {
                *row = attempt.clone();
            }
        }
        Ok(())
    }

    fn update_step_datum(&mut self, datum: &AttemptStepDatum) -> Result<(), StoreError> {
        for row in &mut self.tables.step_rows {
            if row.datum.id == datum.id {
                row.datum = datum.clone();
            }
        }
        Ok(())
    }

    fn delete_step_datum(&mut self, datum_id: i64) -> Result<(), StoreError> {
        self.tables
            .step_rows
            .retain(|row| row.datum.id != datum_id);
        Ok(())
    }

    fn begin_question(&mut self, _question_id: QuestionId) -> Result<(), StoreError> {
        self.savepoint = Some(self.tables.clone());
        Ok(())
    }

    fn commit_question(&mut self, _question_id: QuestionId) -> Result<(), StoreError> {
        self.savepoint = None;
        Ok(())
    }

    fn rollback_question(&mut self, _question_id: QuestionId) -> Result<bool, StoreError> {
        match self.savepoint.take() {
            Some(tables) => {
                self.tables = tables;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl AttachmentStore for FakeBank {
    fn list_files(
        &self,
        context_id: i64,
        area: FileArea,
        item_id: i64,
    ) -> Result<Vec<StoredFile>, StoreError> {
        Ok(self
            .tables
            .files
            .iter()
            .filter(|row| {
                row.area == area && row.file.context_id == context_id && row.file.item_id == item_id
            })
            .map(|row| row.file.clone())
            .collect())
    }

    fn copy_file(
        &mut self,
        file: &StoredFile,
        area: FileArea,
        item_id: i64,
    ) -> Result<(), StoreError> {
        let id = self.next_id();
        self.tables.files.push(FakeFile {
            area,
            file: StoredFile {
                id,
                item_id,
                ..file.clone()
            },
        });
        Ok(())
    }

    fn delete_files(
        &mut self,
        context_id: i64,
        area: FileArea,
        item_id: i64,
    ) -> Result<(), StoreError> {
        self.tables.files.retain(|row| {
            !(row.area == area && row.file.context_id == context_id && row.file.item_id == item_id)
        });
        Ok(())
    }
}

impl CacheInvalidator for FakeBank {
    fn purge_all(&mut self) -> Result<(), StoreError> {
        self.purges += 1;
        Ok(())
    }
}

//! Item transfer: legacy sub-items become answers of the ordering question.

use crate::codec::{normalize_item_text, parse_fraction, ContentKey};
use crate::reconstruct::{ItemMap, TransferredItem};
use crate::{
    Answer, AnswerInput, FileArea, LegacySubItem, MigrationError, QuestionBank, QuestionId,
    StoredFile, FORMAT_MOODLE,
};

const FRACTION_EPSILON: f64 = 1e-9;

/// One sub-item with everything its transfer needs, read before any write.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSubItem {
    pub sub: LegacySubItem,
    pub normalized_text: String,
    pub fraction: f64,
    pub existing_answer: Option<Answer>,
    pub attachments: Vec<StoredFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    pub items: ItemMap,
    pub inserted: usize,
    pub updated: usize,
    pub attachments_moved: usize,
}

fn same_fraction(lhs: f64, rhs: f64) -> bool {
    (lhs - rhs).abs() < FRACTION_EPSILON
}

/// Reads the sub-items of a question and pairs each with the answer a
/// previous run may already have written for it.
///
/// # Errors
/// Returns [`MigrationError::Read`] when the store cannot be read, and
/// [`MigrationError::ItemTransfer`] when two sub-items share a fraction, since
/// answers are matched back to sub-items by fraction.
pub fn prepare_sub_items<S: QuestionBank + ?Sized>(
    store: &S,
    question_id: QuestionId,
    context_id: Option<i64>,
) -> Result<Vec<PreparedSubItem>, MigrationError> {
    let read = |err: crate::StoreError| MigrationError::Read(err.to_string());
    let subs = store.legacy_sub_items(question_id).map_err(read)?;
    let answers = store.answers(question_id).map_err(read)?;

    let mut prepared: Vec<PreparedSubItem> = Vec::with_capacity(subs.len());
    for sub in subs {
        let fraction = parse_fraction(&sub.weight_text);
        if let Some(clash) = prepared
            .iter()
            .find(|other| same_fraction(other.fraction, fraction))
        {
            return Err(MigrationError::ItemTransfer(format!(
                "sub-items {} and {} of question {question_id} share fraction {fraction}",
                clash.sub.id, sub.id
            )));
        }

        let existing_answer = answers
            .iter()
            .find(|answer| same_fraction(answer.fraction, fraction))
            .cloned();
        let attachments = match context_id {
            Some(context_id) => store
                .list_files(context_id, FileArea::LEGACY_SUBQUESTION, sub.id.0)
                .map_err(read)?,
            None => Vec::new(),
        };

        prepared.push(PreparedSubItem {
            normalized_text: normalize_item_text(&sub.text),
            fraction,
            existing_answer,
            attachments,
            sub,
        });
    }

    Ok(prepared)
}

/// Writes one answer per prepared sub-item and moves their attachments.
///
/// # Errors
/// Returns [`MigrationError::ItemTransfer`] when an answer or attachment write
/// fails.
pub fn transfer_items<S: QuestionBank + ?Sized>(
    store: &mut S,
    question_id: QuestionId,
    prepared: &[PreparedSubItem],
    salt: &str,
) -> Result<TransferOutcome, MigrationError> {
    let write = |err: crate::StoreError| MigrationError::ItemTransfer(err.to_string());
    let mut outcome = TransferOutcome::default();
    let mut items = Vec::with_capacity(prepared.len());

    for item in prepared {
        let answer_id = if let Some(existing) = &item.existing_answer {
            let answer = Answer {
                text: item.normalized_text.clone(),
                ..existing.clone()
            };
            store.update_answer(&answer).map_err(write)?;
            outcome.updated += 1;
            existing.id
        } else {
            let input = AnswerInput {
                question_id,
                text: item.normalized_text.clone(),
                text_format: item.sub.text_format,
                fraction: item.fraction,
                feedback: String::new(),
                feedback_format: FORMAT_MOODLE,
            };
            let answer_id = store.insert_answer(&input).map_err(write)?;
            outcome.inserted += 1;
            answer_id
        };

        if let Some(first) = item.attachments.first() {
            for file in &item.attachments {
                store
                    .copy_file(file, FileArea::ANSWER, answer_id.0)
                    .map_err(write)?;
            }
            store
                .delete_files(first.context_id, FileArea::LEGACY_SUBQUESTION, item.sub.id.0)
                .map_err(write)?;
            outcome.attachments_moved += item.attachments.len();
        }

        tracing::debug!(
            question_id = %question_id,
            sub_item_id = %item.sub.id,
            answer_id = %answer_id,
            "transferred sub-item"
        );
        items.push(TransferredItem {
            sub_item_id: item.sub.id,
            answer_id,
            content_key: ContentKey::derive(salt, &item.normalized_text),
        });
    }

    outcome.items = ItemMap::new(items);
    Ok(outcome)
}

//! Rebuilds attempt history in terms of the transferred answers.
//!
//! Both planners are pure: they read a snapshot of the history rows and
//! return what must be written. The engine applies the result inside the
//! question's transactional boundary.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::codec::{
    format_id_list, parse_id_list, parse_state_tokens, strip_summary_annotation, ContentKey,
    NaturalKey, StepName,
};
use crate::{AnswerId, Attempt, AttemptStepDatum, QuestionId, StepDatumRow, SubItemId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferredItem {
    pub sub_item_id: SubItemId,
    pub answer_id: AnswerId,
    pub content_key: ContentKey,
}

/// Legacy sub-item → answer mapping, kept in correct order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemMap {
    items: Vec<TransferredItem>,
}

impl ItemMap {
    #[must_use]
    pub fn new(items: Vec<TransferredItem>) -> Self {
        Self { items }
    }

    #[must_use]
    pub fn items(&self) -> &[TransferredItem] {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn answer_for(&self, sub_item_id: SubItemId) -> Option<AnswerId> {
        self.items
            .iter()
            .find(|item| item.sub_item_id == sub_item_id)
            .map(|item| item.answer_id)
    }

    #[must_use]
    pub fn sub_item_for(&self, answer_id: AnswerId) -> Option<SubItemId> {
        self.items
            .iter()
            .find(|item| item.answer_id == answer_id)
            .map(|item| item.sub_item_id)
    }

    #[must_use]
    pub fn content_key(&self, sub_item_id: SubItemId) -> Option<&ContentKey> {
        self.items
            .iter()
            .find(|item| item.sub_item_id == sub_item_id)
            .map(|item| &item.content_key)
    }

    #[must_use]
    pub fn correct_sub_items(&self) -> Vec<SubItemId> {
        self.items.iter().map(|item| item.sub_item_id).collect()
    }

    #[must_use]
    pub fn correct_answers(&self) -> Vec<AnswerId> {
        self.items.iter().map(|item| item.answer_id).collect()
    }

    /// Legacy ids that still resolve, in input order.
    fn known_sub_items(&self, raw: &str) -> Vec<SubItemId> {
        parse_id_list(raw)
            .into_iter()
            .map(SubItemId)
            .filter(|id| self.answer_for(*id).is_some())
            .collect()
    }

    /// Reverse of [`ItemMap::encode_answers`] for records written by an
    /// earlier run.
    fn sub_items_for_answers(&self, raw: &str) -> Vec<SubItemId> {
        parse_id_list(raw)
            .into_iter()
            .filter_map(|id| self.sub_item_for(AnswerId(id)))
            .collect()
    }

    fn encode_answers(&self, sub_items: &[SubItemId]) -> String {
        format_id_list(sub_items.iter().filter_map(|id| self.answer_for(*id)))
    }
}

/// Rewrites one legacy state answer into `<correct ids>:<ordered ids>`.
///
/// Returns `None` when the state is already in the rewritten form.
#[must_use]
pub fn rewrite_legacy_state(raw: &str, items: &ItemMap) -> Option<String> {
    if raw.contains(':') {
        return None;
    }

    let tokens = parse_state_tokens(raw);
    let slot_count = u32::try_from(tokens.len()).unwrap_or(u32::MAX);
    let mut slots: BTreeMap<u32, AnswerId> = BTreeMap::new();
    let mut unplaced: VecDeque<AnswerId> = VecDeque::new();

    for token in tokens {
        let Some(answer_id) = items.answer_for(SubItemId(token.code)) else {
            continue;
        };
        if token.position == 0 {
            unplaced.push_back(answer_id);
        } else if let Some(displaced) = slots.insert(token.position, answer_id) {
            unplaced.push_back(displaced);
        }
    }

    for position in 1..=slot_count {
        if slots.contains_key(&position) {
            continue;
        }
        match unplaced.pop_front() {
            Some(answer_id) => {
                slots.insert(position, answer_id);
            }
            None => break,
        }
    }

    let ordered = slots.into_values().chain(unplaced);
    Some(format!(
        "{}:{}",
        format_id_list(items.correct_answers()),
        format_id_list(ordered)
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDataWrite {
    Rewrite(AttemptStepDatum),
    Delete { datum_id: i64, unrecognized: bool },
}

/// Write-set produced by one step-log pass over a question.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepDataPlan {
    pub attempt_scrubs: Vec<Attempt>,
    pub writes: Vec<StepDataWrite>,
}

impl StepDataPlan {
    #[must_use]
    pub fn rewritten(&self) -> usize {
        self.writes
            .iter()
            .filter(|write| matches!(write, StepDataWrite::Rewrite(_)))
            .count()
    }

    #[must_use]
    pub fn deleted(&self) -> usize {
        self.writes
            .iter()
            .filter(|write| matches!(write, StepDataWrite::Delete { .. }))
            .count()
    }

    #[must_use]
    pub fn unrecognized(&self) -> usize {
        self.writes
            .iter()
            .filter(|write| {
                matches!(
                    write,
                    StepDataWrite::Delete {
                        unrecognized: true,
                        ..
                    }
                )
            })
            .count()
    }
}

/// Per-attempt sequences carried across the steps of one attempt.
struct AttemptState {
    attempt_id: i64,
    correct: Vec<SubItemId>,
    current: Vec<SubItemId>,
}

struct SubRecord {
    datum: AttemptStepDatum,
    index: u64,
}

/// The `subN` records of one attempt step, resolved when the step ends.
struct PendingStep {
    step_id: i64,
    subs: Vec<SubRecord>,
}

/// Step-log pass over the newer attempt history.
///
/// One instance serves a whole run; it remembers which attempts already had
/// their summary fields scrubbed.
#[derive(Debug, Clone, Default)]
pub struct StepLogReconstructor {
    seen_attempts: BTreeSet<i64>,
}

impl StepLogReconstructor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn seen_attempts(&self) -> usize {
        self.seen_attempts.len()
    }

    /// Plans the rewrite of every step-data row of one question.
    #[must_use]
    pub fn plan(
        &mut self,
        question_id: QuestionId,
        items: &ItemMap,
        rows: &[StepDatumRow],
        attempts: &[Attempt],
    ) -> StepDataPlan {
        let mut ordered: Vec<&StepDatumRow> = rows.iter().collect();
        ordered.sort_by(|lhs, rhs| {
            (
                lhs.usage_id,
                lhs.slot,
                lhs.sequence_number,
                NaturalKey::of(&lhs.datum.name),
                lhs.datum.id,
            )
                .cmp(&(
                    rhs.usage_id,
                    rhs.slot,
                    rhs.sequence_number,
                    NaturalKey::of(&rhs.datum.name),
                    rhs.datum.id,
                ))
        });

        let attempts_by_id: BTreeMap<i64, &Attempt> =
            attempts.iter().map(|attempt| (attempt.id, attempt)).collect();

        let mut plan = StepDataPlan::default();
        let mut state: Option<AttemptState> = None;
        let mut pending: Option<PendingStep> = None;

        for row in ordered {
            if pending
                .as_ref()
                .is_some_and(|step| step.step_id != row.datum.attempt_step_id)
            {
                if let (Some(step), Some(current)) = (pending.take(), state.as_ref()) {
                    flush_step(question_id, items, current, step, &mut plan);
                }
            }

            if !matches!(state.as_ref(), Some(current) if current.attempt_id == row.attempt_id) {
                state = Some(AttemptState {
                    attempt_id: row.attempt_id,
                    correct: items.correct_sub_items(),
                    current: Vec::new(),
                });
            }

            if self.seen_attempts.insert(row.attempt_id) {
                if let Some(attempt) = attempts_by_id.get(&row.attempt_id) {
                    plan.attempt_scrubs.push(scrub_attempt(attempt));
                }
            }

            let Some(current) = state.as_mut() else {
                continue;
            };
            let datum = &row.datum;

            match StepName::parse(&datum.name) {
                StepName::StemOrder => {
                    current.current = items.known_sub_items(&datum.value);
                    plan.writes.push(StepDataWrite::Rewrite(AttemptStepDatum {
                        id: datum.id,
                        attempt_step_id: datum.attempt_step_id,
                        name: "_currentresponse".to_string(),
                        value: items.encode_answers(&current.current),
                    }));
                }
                StepName::ChoiceOrder => {
                    current.correct = items.known_sub_items(&datum.value);
                    plan.writes.push(StepDataWrite::Rewrite(AttemptStepDatum {
                        id: datum.id,
                        attempt_step_id: datum.attempt_step_id,
                        name: "_correctresponse".to_string(),
                        value: items.encode_answers(&current.correct),
                    }));
                }
                StepName::CurrentResponse => {
                    current.current = items.sub_items_for_answers(&datum.value);
                }
                StepName::CorrectResponse => {
                    current.correct = items.sub_items_for_answers(&datum.value);
                }
                StepName::Sub(index) => {
                    let step = pending.get_or_insert_with(|| PendingStep {
                        step_id: datum.attempt_step_id,
                        subs: Vec::new(),
                    });
                    step.subs.push(SubRecord {
                        datum: datum.clone(),
                        index,
                    });
                }
                StepName::Behaviour(_) => {}
                StepName::Response(owner) if owner == question_id => {}
                StepName::Response(_) | StepName::Other(_) => {
                    tracing::debug!(
                        question_id = %question_id,
                        datum_id = datum.id,
                        name = %datum.name,
                        "deleting unrecognized step data"
                    );
                    plan.writes.push(StepDataWrite::Delete {
                        datum_id: datum.id,
                        unrecognized: true,
                    });
                }
            }
        }

        if let (Some(step), Some(current)) = (pending.take(), state.as_ref()) {
            flush_step(question_id, items, current, step, &mut plan);
        }

        plan
    }
}

/// Collapses the `subN` records of one step into a single response record.
fn flush_step(
    question_id: QuestionId,
    items: &ItemMap,
    state: &AttemptState,
    step: PendingStep,
    plan: &mut StepDataPlan,
) {
    let last_expected = if state.current.is_empty() {
        items.len().checked_sub(1)
    } else {
        Some(state.current.len() - 1)
    }
    .and_then(|value| u64::try_from(value).ok());

    let mut positions: BTreeMap<i64, &ContentKey> = BTreeMap::new();
    for record in &step.subs {
        let Ok(slot) = record.datum.value.trim().parse::<i64>() else {
            continue;
        };
        let Some(sub_item_id) = usize::try_from(record.index)
            .ok()
            .and_then(|index| state.current.get(index))
        else {
            continue;
        };
        if let Some(key) = items.content_key(*sub_item_id) {
            positions.insert(slot, key);
        }
    }

    let carrier = step
        .subs
        .iter()
        .position(|record| Some(record.index) == last_expected)
        .or_else(|| {
            if positions.is_empty() {
                None
            } else {
                step.subs
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, record)| record.index)
                    .map(|(index, _)| index)
            }
        });

    for (index, record) in step.subs.iter().enumerate() {
        if Some(index) == carrier {
            plan.writes.push(StepDataWrite::Rewrite(AttemptStepDatum {
                id: record.datum.id,
                attempt_step_id: record.datum.attempt_step_id,
                name: StepName::response_for(question_id),
                value: format_id_list(positions.values()),
            }));
        } else {
            plan.writes.push(StepDataWrite::Delete {
                datum_id: record.datum.id,
                unrecognized: false,
            });
        }
    }
}

fn scrub_attempt(attempt: &Attempt) -> Attempt {
    Attempt {
        question_summary: attempt
            .question_summary
            .as_deref()
            .map(strip_summary_annotation),
        right_answer: Some(String::new()),
        response_summary: Some(String::new()),
        ..attempt.clone()
    }
}

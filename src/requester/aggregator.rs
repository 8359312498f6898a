use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ledger::SubtaskId;
use crate::task::{SubTask, Task};

type AnswerOf<T> = <<T as Task>::SubTask as SubTask>::Answer;

/// Final merge of one task round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Aggregate<O> {
    pub output: O,
    /// Subtasks whose answers went into `output`, ascending.
    pub merged: Vec<SubtaskId>,
    /// Decrypted but rejected by `Answer::validate`.
    pub invalid: Vec<SubtaskId>,
    /// Never decrypted: the submission failed its commitment check or could not be decoded.
    pub excluded: Vec<SubtaskId>,
}

/// Collects one outcome per subtask and merges once all of them are in.
pub struct Aggregator<T: Task> {
    task: Arc<T>,
    answers: BTreeMap<SubtaskId, AnswerOf<T>>,
    excluded: BTreeMap<SubtaskId, String>,
}

impl<T: Task> Aggregator<T> {
    pub fn new(task: Arc<T>) -> Self {
        Self {
            task,
            answers: BTreeMap::new(),
            excluded: BTreeMap::new(),
        }
    }

    fn is_expected(&self, subtask_id: SubtaskId) -> bool {
        usize::try_from(subtask_id).map_or(false, |id| id < self.task.subtask_count())
    }

    pub fn is_settled(&self, subtask_id: SubtaskId) -> bool {
        self.answers.contains_key(&subtask_id) || self.excluded.contains_key(&subtask_id)
    }

    /// Expected subtasks with no outcome yet, ascending.
    pub fn unsettled(&self) -> Vec<SubtaskId> {
        (0..self.task.subtask_count() as SubtaskId)
            .filter(|id| !self.is_settled(*id))
            .collect()
    }

    /// Returns false for unknown or already settled subtasks.
    pub fn record(&mut self, subtask_id: SubtaskId, answer: AnswerOf<T>) -> bool {
        if !self.is_expected(subtask_id) || self.is_settled(subtask_id) {
            return false;
        }
        self.answers.insert(subtask_id, answer);
        true
    }

    pub fn exclude(&mut self, subtask_id: SubtaskId, reason: impl Into<String>) -> bool {
        if !self.is_expected(subtask_id) || self.is_settled(subtask_id) {
            return false;
        }
        self.excluded.insert(subtask_id, reason.into());
        true
    }

    pub fn settled(&self) -> usize {
        self.answers.len() + self.excluded.len()
    }

    pub fn is_complete(&self) -> bool {
        self.settled() >= self.task.subtask_count()
    }

    pub fn finish(&self) -> Aggregate<T::Output> {
        let ids: Vec<SubtaskId> = self.answers.keys().copied().collect();
        let answers: Vec<AnswerOf<T>> = self.answers.values().cloned().collect();
        let (kept, output) = self.task.evaluate(&answers);
        let merged: Vec<SubtaskId> = kept.iter().map(|&index| ids[index]).collect();
        let invalid = ids.iter().copied().filter(|id| !merged.contains(id)).collect();
        Aggregate {
            output,
            merged,
            invalid,
            excluded: self.excluded.keys().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{SimpleAnswer, SimpleTask};

    #[test]
    fn completes_after_every_subtask_settles() {
        let task = Arc::new(SimpleTask::new("count", (0..30).collect(), 3));
        let mut aggregator = Aggregator::new(task);
        assert!(aggregator.record(2, SimpleAnswer(10)));
        assert!(!aggregator.record(2, SimpleAnswer(99)));
        assert!(aggregator.record(0, SimpleAnswer(10)));
        assert!(!aggregator.is_complete());
        assert_eq!(aggregator.unsettled(), vec![1]);
        assert!(aggregator.exclude(1, "commitment mismatch"));
        assert!(aggregator.unsettled().is_empty());
        assert!(aggregator.is_complete());

        let aggregate = aggregator.finish();
        assert_eq!(aggregate.output, 20);
        assert_eq!(aggregate.merged, vec![0, 2]);
        assert_eq!(aggregate.excluded, vec![1]);
        assert!(aggregate.invalid.is_empty());
    }

    #[test]
    fn invalid_answers_are_reported_separately() {
        let task = Arc::new(SimpleTask::new("count", (0..4).collect(), 2));
        let mut aggregator = Aggregator::new(task);
        aggregator.record(0, SimpleAnswer(-3));
        aggregator.record(1, SimpleAnswer(2));
        let aggregate = aggregator.finish();
        assert_eq!(aggregate.output, 2);
        assert_eq!(aggregate.merged, vec![1]);
        assert_eq!(aggregate.invalid, vec![0]);
    }

    #[test]
    fn unknown_subtasks_are_ignored() {
        let task = Arc::new(SimpleTask::new("count", vec![1], 1));
        let mut aggregator = Aggregator::new(task);
        assert!(!aggregator.record(5, SimpleAnswer(1)));
        assert!(!aggregator.exclude(5, "late"));
        assert_eq!(aggregator.settled(), 0);
    }
}

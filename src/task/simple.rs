use serde::{Deserialize, Serialize};

use super::{Answer, SubTask, Task, TaskError};
use crate::ledger::SubtaskId;

/// Counting answer: the number of items in the submitter's slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleAnswer(pub i64);

impl Answer for SimpleAnswer {
    /// 8 bytes, big-endian, two's complement.
    fn encode(&self) -> Vec<u8> {
        self.0.to_be_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self, TaskError> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| TaskError::AnswerLength {
            expected: 8,
            actual: bytes.len(),
        })?;
        Ok(Self(i64::from_be_bytes(raw)))
    }

    fn validate(&self) -> bool {
        self.0 >= 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleSubtask {
    pub id: SubtaskId,
    pub description: String,
    pub content: Vec<i64>,
}

impl SubTask for SimpleSubtask {
    type Answer = SimpleAnswer;

    fn id(&self) -> SubtaskId {
        self.id
    }

    fn execute(&self) -> Result<SimpleAnswer, TaskError> {
        let len = i64::try_from(self.content.len()).map_err(|err| TaskError::Execution(self.id, err.to_string()))?;
        Ok(SimpleAnswer(len))
    }
}

#[derive(Clone, Debug)]
pub struct SimpleTask {
    pub description: String,
    data: Vec<i64>,
    subtask_count: usize,
}

impl SimpleTask {
    pub fn new(description: impl Into<String>, data: Vec<i64>, subtask_count: usize) -> Self {
        Self {
            description: description.into(),
            data,
            subtask_count: subtask_count.max(1),
        }
    }

    pub fn data(&self) -> &[i64] {
        &self.data
    }
}

impl Task for SimpleTask {
    type SubTask = SimpleSubtask;
    type Output = i64;

    /// Exactly `subtask_count` contiguous slices whose lengths differ by at most one.
    fn subtasks(&self) -> Vec<SimpleSubtask> {
        let n = self.subtask_count;
        let base = self.data.len() / n;
        let extra = self.data.len() % n;
        let mut start = 0;
        (0..n)
            .map(|i| {
                let len = base + usize::from(i < extra);
                let content = self.data[start..start + len].to_vec();
                start += len;
                SimpleSubtask {
                    id: i as SubtaskId,
                    description: format!("{} - subtask {i}", self.description),
                    content,
                }
            })
            .collect()
    }

    fn subtask_count(&self) -> usize {
        self.subtask_count
    }

    fn merge(&self, answers: &[SimpleAnswer]) -> i64 {
        answers.iter().map(|answer| answer.0).sum()
    }
}

//! Crowdsourcing task model.
//!
//! A [`Task`] is cut into [`SubTask`]s handed out to submitters; each submitter returns an
//! [`Answer`] that travels encrypted through the randomizer chain and is merged by the
//! requester once decrypted.

pub mod simple;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::ledger::SubtaskId;

pub use simple::{SimpleAnswer, SimpleSubtask, SimpleTask};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("answer encoding has {actual} bytes, expected {expected}")]
    AnswerLength { expected: usize, actual: usize },

    #[error("invalid subtask payload: {0}")]
    InvalidSubtask(String),

    #[error("subtask {0} failed: {1}")]
    Execution(SubtaskId, String),
}

pub trait Answer: Clone + Debug + Send + Sync + 'static {
    /// Plaintext bytes that get encrypted.
    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> Result<Self, TaskError>;

    fn validate(&self) -> bool;
}

pub trait SubTask: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Answer: Answer;

    fn id(&self) -> SubtaskId;

    fn execute(&self) -> Result<Self::Answer, TaskError>;
}

pub trait Task: Send + Sync + 'static {
    type SubTask: SubTask;
    type Output: Debug + Send;

    fn subtasks(&self) -> Vec<Self::SubTask>;

    fn subtask_count(&self) -> usize;

    fn merge(&self, answers: &[<Self::SubTask as SubTask>::Answer]) -> Self::Output;

    /// Keep the valid answers, then merge them. Returns the indices that were kept.
    fn evaluate(&self, answers: &[<Self::SubTask as SubTask>::Answer]) -> (Vec<usize>, Self::Output) {
        let (kept, valid): (Vec<usize>, Vec<_>) = answers
            .iter()
            .enumerate()
            .filter(|(_, answer)| answer.validate())
            .map(|(index, answer)| (index, answer.clone()))
            .unzip();
        (kept, self.merge(&valid))
    }
}

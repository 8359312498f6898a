use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::ledger::{ContentPointer, LedgerEvent, RandomizerId, SubtaskId};

/// Where this node sits in a subtask's fixed randomizer order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Membership {
    order: Vec<RandomizerId>,
    position: usize,
}

impl Membership {
    pub fn resolve(order: &[RandomizerId], me: RandomizerId) -> Option<Self> {
        let position = order.iter().position(|id| *id == me)?;
        Some(Self {
            order: order.to_vec(),
            position,
        })
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn predecessor(&self) -> Option<RandomizerId> {
        self.position.checked_sub(1).map(|i| self.order[i])
    }

    pub fn is_first(&self) -> bool {
        self.position == 0
    }

    pub fn order(&self) -> &[RandomizerId] {
        &self.order
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    NotSelected,
    WaitingForTurn,
    ReEncrypting,
    Published,
    Failed,
    Completed,
}

#[derive(Clone, Debug)]
struct SubtaskState {
    membership: Option<Membership>,
    phase: Phase,
    /// Set once the phase can no longer change through this node's own work.
    settled_at: Option<Instant>,
}

/// Work handed to the re-encryption step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReEncryptJob {
    pub subtask_id: SubtaskId,
    pub source: ContentPointer,
    pub position: usize,
}

/// Per-subtask turn logic of one randomizer.
///
/// A job is released only by the event that names this node's immediate predecessor (or the
/// submission itself for the first position), and only while the subtask is still waiting.
/// Duplicates and events from any other chain position are ignored.
#[derive(Debug)]
pub struct TurnTracker {
    me: RandomizerId,
    subtasks: HashMap<SubtaskId, SubtaskState>,
}

impl TurnTracker {
    pub fn new(me: RandomizerId) -> Self {
        Self {
            me,
            subtasks: HashMap::new(),
        }
    }

    pub fn is_known(&self, subtask_id: SubtaskId) -> bool {
        self.subtasks.contains_key(&subtask_id)
    }

    /// Cache membership for `subtask_id` from its selection order. Re-admitting is a no-op.
    pub fn admit(&mut self, subtask_id: SubtaskId, order: &[RandomizerId]) -> Phase {
        let me = self.me;
        self.subtasks
            .entry(subtask_id)
            .or_insert_with(|| {
                let membership = Membership::resolve(order, me);
                let (phase, settled_at) = if membership.is_some() {
                    (Phase::WaitingForTurn, None)
                } else {
                    (Phase::NotSelected, Some(Instant::now()))
                };
                SubtaskState {
                    membership,
                    phase,
                    settled_at,
                }
            })
            .phase
    }

    pub fn phase(&self, subtask_id: SubtaskId) -> Option<Phase> {
        self.subtasks.get(&subtask_id).map(|state| state.phase)
    }

    pub fn membership(&self, subtask_id: SubtaskId) -> Option<&Membership> {
        self.subtasks.get(&subtask_id)?.membership.as_ref()
    }

    /// Feed one ledger event; returns a job when it is this node's turn.
    pub fn on_event(&mut self, event: &LedgerEvent) -> Option<ReEncryptJob> {
        let state = self.subtasks.get_mut(&event.subtask_id())?;
        if state.phase != Phase::WaitingForTurn {
            return None;
        }
        let membership = state.membership.as_ref()?;

        let source = match event {
            LedgerEvent::SubTaskAnswerSubmitted { filehash, .. } if membership.is_first() => filehash,
            LedgerEvent::SubTaskAnswerEncrypted {
                randomizer_id,
                filehash,
                ..
            } if membership.predecessor() == Some(*randomizer_id) => filehash,
            _ => return None,
        };

        let job = ReEncryptJob {
            subtask_id: event.subtask_id(),
            source: source.clone(),
            position: membership.position(),
        };
        state.phase = Phase::ReEncrypting;
        Some(job)
    }

    pub fn mark_published(&mut self, subtask_id: SubtaskId) {
        self.transition(subtask_id, Phase::ReEncrypting, Phase::Published);
    }

    pub fn mark_failed(&mut self, subtask_id: SubtaskId) {
        if self.transition(subtask_id, Phase::ReEncrypting, Phase::Failed) {
            self.settle(subtask_id);
        }
    }

    pub fn mark_completed(&mut self, subtask_id: SubtaskId) {
        if let Some(state) = self.subtasks.get_mut(&subtask_id) {
            state.phase = Phase::Completed;
        }
        self.settle(subtask_id);
    }

    /// Number of subtasks currently tracked.
    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    /// Forget subtasks that settled at least `retention` before `now`.
    pub fn prune(&mut self, now: Instant, retention: Duration) -> usize {
        let before = self.subtasks.len();
        self.subtasks.retain(|_, state| match state.settled_at {
            Some(settled) => now.saturating_duration_since(settled) < retention,
            None => true,
        });
        before - self.subtasks.len()
    }

    fn settle(&mut self, subtask_id: SubtaskId) {
        if let Some(state) = self.subtasks.get_mut(&subtask_id) {
            state.settled_at.get_or_insert_with(Instant::now);
        }
    }

    fn transition(&mut self, subtask_id: SubtaskId, from: Phase, to: Phase) -> bool {
        match self.subtasks.get_mut(&subtask_id) {
            Some(state) if state.phase == from => {
                state.phase = to;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted(subtask_id: SubtaskId) -> LedgerEvent {
        LedgerEvent::SubTaskAnswerSubmitted {
            subtask_id,
            filehash: ContentPointer::new("answer"),
        }
    }

    fn encrypted(subtask_id: SubtaskId, randomizer_id: RandomizerId) -> LedgerEvent {
        LedgerEvent::SubTaskAnswerEncrypted {
            subtask_id,
            randomizer_id,
            filehash: ContentPointer::new(format!("step-{randomizer_id}")),
        }
    }

    #[test]
    fn first_in_order_starts_on_submission() {
        let mut tracker = TurnTracker::new(7);
        assert_eq!(tracker.admit(1, &[7, 8, 9]), Phase::WaitingForTurn);
        let job = tracker.on_event(&submitted(1)).unwrap();
        assert_eq!(job.position, 0);
        assert_eq!(job.source, ContentPointer::new("answer"));
        assert_eq!(tracker.phase(1), Some(Phase::ReEncrypting));
    }

    #[test]
    fn unselected_nodes_ignore_everything() {
        let mut tracker = TurnTracker::new(4);
        assert_eq!(tracker.admit(1, &[7, 8, 9]), Phase::NotSelected);
        assert!(tracker.on_event(&submitted(1)).is_none());
        assert!(tracker.on_event(&encrypted(1, 9)).is_none());
        assert!(tracker.membership(1).is_none());
    }

    #[test]
    fn reordered_events_never_trigger_early() {
        // order [r1, r2, r3]; this node is r3
        let mut tracker = TurnTracker::new(3);
        tracker.admit(5, &[1, 2, 3]);
        assert!(tracker.on_event(&encrypted(5, 1)).is_none());
        assert!(tracker.on_event(&submitted(5)).is_none());
        assert_eq!(tracker.phase(5), Some(Phase::WaitingForTurn));

        let job = tracker.on_event(&encrypted(5, 2)).unwrap();
        assert_eq!(job.source, ContentPointer::new("step-2"));
        assert_eq!(job.position, 2);
    }

    #[test]
    fn duplicate_notifications_release_one_job() {
        let mut tracker = TurnTracker::new(2);
        tracker.admit(5, &[1, 2, 3]);
        assert!(tracker.on_event(&encrypted(5, 1)).is_some());
        assert!(tracker.on_event(&encrypted(5, 1)).is_none());
        tracker.mark_published(5);
        assert!(tracker.on_event(&encrypted(5, 1)).is_none());
        assert_eq!(tracker.phase(5), Some(Phase::Published));
    }

    #[test]
    fn readmission_keeps_cached_state() {
        let mut tracker = TurnTracker::new(1);
        tracker.admit(2, &[1]);
        tracker.on_event(&submitted(2));
        tracker.mark_failed(2);
        assert_eq!(tracker.admit(2, &[1]), Phase::Failed);
        tracker.mark_completed(2);
        assert_eq!(tracker.phase(2), Some(Phase::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn settled_subtasks_are_pruned_after_retention() {
        let retention = Duration::from_secs(60);
        let mut tracker = TurnTracker::new(1);
        tracker.admit(1, &[1, 2]);
        tracker.admit(2, &[1, 2]);
        tracker.admit(3, &[4, 5]);
        tracker.admit(4, &[1]);
        tracker.on_event(&submitted(2));
        tracker.mark_failed(2);
        tracker.mark_completed(1);
        assert_eq!(tracker.len(), 4);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(tracker.prune(Instant::now(), retention), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        // completed, failed and unselected go; the subtask still waiting stays
        assert_eq!(tracker.prune(Instant::now(), retention), 3);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.phase(4), Some(Phase::WaitingForTurn));
    }

    #[test]
    fn unknown_subtasks_yield_nothing() {
        let mut tracker = TurnTracker::new(1);
        assert!(!tracker.is_known(9));
        assert!(tracker.on_event(&submitted(9)).is_none());
    }
}

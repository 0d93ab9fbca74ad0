//! In-memory queue and active set.
//!
//! This is the fast path consulted on every submission. It is a mirror of the
//! durable records, not the source of truth: recovery rebuilds it on startup and
//! the guard prunes entries whose records have moved on.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use reelgen_core::{JobId, UserId};

use super::types::{ActiveEntry, Admission, QueueEntry};

#[derive(Debug, Default)]
struct StoreState {
    queued: HashMap<JobId, QueueEntry>,
    active: HashMap<JobId, ActiveEntry>,
    next_sequence: u64,
}

impl StoreState {
    fn active_for_user(&self, user_id: UserId) -> usize {
        self.active.values().filter(|e| e.user_id == user_id).count()
    }

    fn sorted_queue(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self.queued.values().cloned().collect();
        entries.sort_by(QueueEntry::drain_order);
        entries
    }

    fn position_of(&self, job_id: JobId) -> Option<usize> {
        self.sorted_queue()
            .iter()
            .position(|e| e.job_id == job_id)
            .map(|idx| idx + 1)
    }
}

/// Point-in-time counts for status endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreSnapshot {
    pub active: usize,
    pub queued: usize,
}

/// Queue and active-set state shared by the scheduler components.
///
/// A job id is never both queued and active: `enqueue` drops any active entry
/// for the id and the admission paths drop any queued entry.
#[derive(Debug, Default)]
pub struct JobStore {
    state: RwLock<StoreState>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a job and return its 1-based position in drain order.
    ///
    /// The entry's `sequence` is assigned here. Positions shift as other jobs
    /// are queued or drained.
    pub fn enqueue(&self, mut entry: QueueEntry) -> usize {
        let mut state = self.write();
        entry.sequence = state.next_sequence;
        state.next_sequence += 1;
        let job_id = entry.job_id;
        state.active.remove(&job_id);
        state.queued.insert(job_id, entry);
        state.position_of(job_id).unwrap_or(state.queued.len())
    }

    /// Put a previously dequeued entry back, keeping its original sequence.
    pub fn requeue(&self, entry: QueueEntry) {
        let mut state = self.write();
        if state.active.contains_key(&entry.job_id) {
            return;
        }
        state.queued.insert(entry.job_id, entry);
    }

    pub fn dequeue(&self, job_id: JobId) -> Option<QueueEntry> {
        self.write().queued.remove(&job_id)
    }

    /// Queued entries in drain order. Returns a snapshot.
    pub fn sorted_queue(&self) -> Vec<QueueEntry> {
        self.read().sorted_queue()
    }

    pub fn position_of(&self, job_id: JobId) -> Option<usize> {
        self.read().position_of(job_id)
    }

    /// A user's queued entries with their global positions.
    pub fn queued_for_user(&self, user_id: UserId) -> Vec<(usize, QueueEntry)> {
        self.read()
            .sorted_queue()
            .into_iter()
            .enumerate()
            .filter(|(_, e)| e.user_id == user_id)
            .map(|(idx, e)| (idx + 1, e))
            .collect()
    }

    pub fn contains_queued(&self, job_id: JobId) -> bool {
        self.read().queued.contains_key(&job_id)
    }

    /// Insert into the active set unconditionally. Used when restoring state.
    pub fn add_active(&self, job_id: JobId, user_id: UserId, started_at: DateTime<Utc>) {
        let mut state = self.write();
        state.queued.remove(&job_id);
        state.active.insert(
            job_id,
            ActiveEntry {
                job_id,
                user_id,
                started_at,
            },
        );
    }

    /// Check both limits and insert under a single write lock.
    ///
    /// This is the only admission path used for new work, so concurrent callers
    /// cannot both observe a free slot and both take it.
    pub fn try_admit(
        &self,
        job_id: JobId,
        user_id: UserId,
        user_limit: u32,
        system_max: usize,
    ) -> Admission {
        let mut state = self.write();
        if state.active.contains_key(&job_id) {
            return Admission::Admitted;
        }
        if state.active.len() >= system_max {
            return Admission::SystemFull;
        }
        if state.active_for_user(user_id) >= user_limit as usize {
            return Admission::UserAtLimit;
        }
        state.queued.remove(&job_id);
        state.active.insert(
            job_id,
            ActiveEntry {
                job_id,
                user_id,
                started_at: Utc::now(),
            },
        );
        Admission::Admitted
    }

    pub fn remove_active(&self, job_id: JobId) -> bool {
        self.take_active(job_id).is_some()
    }

    /// Remove and return an active entry.
    pub fn take_active(&self, job_id: JobId) -> Option<ActiveEntry> {
        self.write().active.remove(&job_id)
    }

    pub fn is_active(&self, job_id: JobId) -> bool {
        self.read().active.contains_key(&job_id)
    }

    pub fn active_entry(&self, job_id: JobId) -> Option<ActiveEntry> {
        self.read().active.get(&job_id).cloned()
    }

    pub fn active_count_for_user(&self, user_id: UserId) -> usize {
        self.read().active_for_user(user_id)
    }

    pub fn active_ids_for_user(&self, user_id: UserId) -> Vec<JobId> {
        self.read()
            .active
            .values()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.job_id)
            .collect()
    }

    pub fn active_entries(&self) -> Vec<ActiveEntry> {
        let mut entries: Vec<ActiveEntry> = self.read().active.values().cloned().collect();
        entries.sort_by_key(|e| e.started_at);
        entries
    }

    pub fn active_len(&self) -> usize {
        self.read().active.len()
    }

    pub fn queued_len(&self) -> usize {
        self.read().queued.len()
    }

    pub fn available_slots(&self, system_max: usize) -> usize {
        system_max.saturating_sub(self.active_len())
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.read();
        StoreSnapshot {
            active: state.active.len(),
            queued: state.queued.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn entry(user: UserId, priority: i32, minutes_ago: i64) -> QueueEntry {
        QueueEntry::new(JobId::new(), user, priority, Utc::now() - Duration::minutes(minutes_ago))
    }

    #[test]
    fn sorted_queue_is_priority_then_fifo() {
        let store = JobStore::new();
        let user = UserId::new();
        let first = entry(user, 0, 10);
        let second = entry(user, 0, 5);
        let urgent = entry(user, 5, 1);

        store.enqueue(second.clone());
        store.enqueue(first.clone());
        assert_eq!(store.enqueue(urgent.clone()), 1);

        let order: Vec<JobId> = store.sorted_queue().iter().map(|e| e.job_id).collect();
        assert_eq!(order, vec![urgent.job_id, first.job_id, second.job_id]);
        assert_eq!(store.position_of(second.job_id), Some(3));
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let store = JobStore::new();
        let user = UserId::new();
        let at = Utc::now();
        let a = QueueEntry::new(JobId::new(), user, 0, at);
        let b = QueueEntry::new(JobId::new(), user, 0, at);

        assert_eq!(store.enqueue(a.clone()), 1);
        assert_eq!(store.enqueue(b.clone()), 2);
        assert_eq!(store.sorted_queue()[0].job_id, a.job_id);
    }

    #[test]
    fn try_admit_enforces_system_then_user_limits() {
        let store = JobStore::new();
        let alice = UserId::new();
        let bob = UserId::new();

        assert_eq!(store.try_admit(JobId::new(), alice, 1, 2), Admission::Admitted);
        assert_eq!(store.try_admit(JobId::new(), alice, 1, 2), Admission::UserAtLimit);
        assert_eq!(store.try_admit(JobId::new(), bob, 3, 2), Admission::Admitted);
        assert_eq!(store.try_admit(JobId::new(), bob, 3, 2), Admission::SystemFull);
        assert_eq!(store.available_slots(2), 0);
    }

    #[test]
    fn admission_removes_queued_entry() {
        let store = JobStore::new();
        let user = UserId::new();
        let queued = entry(user, 0, 1);
        store.enqueue(queued.clone());

        assert_eq!(store.try_admit(queued.job_id, user, 1, 5), Admission::Admitted);
        assert!(!store.contains_queued(queued.job_id));
        assert!(store.is_active(queued.job_id));
    }

    #[test]
    fn requeue_keeps_sequence_and_never_duplicates_active() {
        let store = JobStore::new();
        let user = UserId::new();
        let at = Utc::now();
        let a = QueueEntry::new(JobId::new(), user, 0, at);
        let b = QueueEntry::new(JobId::new(), user, 0, at);
        store.enqueue(a.clone());
        store.enqueue(b.clone());

        let taken = store.dequeue(a.job_id).expect("queued");
        store.requeue(taken);
        assert_eq!(store.sorted_queue()[0].job_id, a.job_id);

        store.add_active(b.job_id, user, at);
        store.requeue(b.clone());
        assert!(!store.contains_queued(b.job_id));
    }

    #[test]
    fn queued_for_user_reports_global_positions() {
        let store = JobStore::new();
        let alice = UserId::new();
        let bob = UserId::new();
        store.enqueue(entry(bob, 0, 10));
        let mine = entry(alice, 0, 5);
        store.enqueue(mine.clone());

        let listed = store.queued_for_user(alice);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, 2);
        assert_eq!(listed[0].1.job_id, mine.job_id);
    }

    #[test]
    fn concurrent_admission_never_exceeds_limits() {
        let store = Arc::new(JobStore::new());
        let users: Vec<UserId> = (0..4).map(|_| UserId::new()).collect();

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let store = Arc::clone(&store);
                let user = users[i % users.len()];
                std::thread::spawn(move || store.try_admit(JobId::new(), user, 2, 5))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|a| *a == Admission::Admitted)
            .count();

        assert_eq!(admitted, 5);
        assert_eq!(store.active_len(), 5);
        for user in users {
            assert!(store.active_count_for_user(user) <= 2);
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Admit { user: usize },
            Release { nth: usize },
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0usize..4).prop_map(|user| Op::Admit { user }),
                (0usize..8).prop_map(|nth| Op::Release { nth }),
            ]
        }

        proptest! {
            #[test]
            fn admissions_respect_both_ceilings(
                ops in proptest::collection::vec(op(), 1..80),
                user_limit in 1u32..4,
                system_max in 1usize..6,
            ) {
                let store = JobStore::new();
                let users: Vec<UserId> = (0..4).map(|_| UserId::new()).collect();

                for op in ops {
                    match op {
                        Op::Admit { user } => {
                            store.try_admit(JobId::new(), users[user], user_limit, system_max);
                        }
                        Op::Release { nth } => {
                            let active = store.active_entries();
                            if !active.is_empty() {
                                store.remove_active(active[nth % active.len()].job_id);
                            }
                        }
                    }
                    prop_assert!(store.active_len() <= system_max);
                    for user in &users {
                        prop_assert!(store.active_count_for_user(*user) <= user_limit as usize);
                    }
                }
            }

            #[test]
            fn drain_order_is_priority_then_age(
                jobs in proptest::collection::vec((-3i32..3, 0i64..30), 1..40),
            ) {
                let store = JobStore::new();
                let now = Utc::now();
                for (priority, minutes_ago) in jobs {
                    store.enqueue(QueueEntry::new(
                        JobId::new(),
                        UserId::new(),
                        priority,
                        now - Duration::minutes(minutes_ago),
                    ));
                }

                let queue = store.sorted_queue();
                for pair in queue.windows(2) {
                    let (a, b) = (&pair[0], &pair[1]);
                    prop_assert!(a.priority >= b.priority);
                    if a.priority == b.priority {
                        prop_assert!(
                            (a.enqueued_at, a.sequence) <= (b.enqueued_at, b.sequence)
                        );
                    }
                }
                for (idx, entry) in queue.iter().enumerate() {
                    prop_assert_eq!(store.position_of(entry.job_id), Some(idx + 1));
                }
            }
        }
    }
}

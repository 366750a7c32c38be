use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use super::job::Job;

/// One-slot-per-connection queue for interim jobs.
///
/// Interims are stateless snapshots of a connection's audio tail, so only
/// the newest one matters: inserting for a connection that already has a
/// pending job replaces it. The queue can therefore never grow beyond the
/// number of live connections.
#[derive(Default)]
pub struct CoalescingInterimQueue {
    by_conn: HashMap<Uuid, Job>,
}

impl CoalescingInterimQueue {
    pub fn new() -> Self {
        Self { by_conn: HashMap::new() }
    }

    /// Insert a job, returning the job it displaced (if any) so the caller
    /// can count the coalescing.
    pub fn put(&mut self, job: Job) -> Option<Job> {
        self.by_conn.insert(job.conn_id, job)
    }

    /// Remove and return the job that has waited longest. Sequence numbers
    /// are assigned in enqueue order, so the smallest seq is the oldest and
    /// ties cannot occur.
    pub fn pop_oldest(&mut self) -> Option<Job> {
        let conn_id = self
            .by_conn
            .values()
            .min_by_key(|j| j.seq)
            .map(|j| j.conn_id)?;
        self.by_conn.remove(&conn_id)
    }

    /// Drop the pending job for a closed connection.
    pub fn remove(&mut self, conn_id: &Uuid) -> Option<Job> {
        self.by_conn.remove(conn_id)
    }

    pub fn len(&self) -> usize {
        self.by_conn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_conn.is_empty()
    }
}

/// Strictly FIFO final queue with a hard capacity.
///
/// Finals are never coalesced or reordered; past capacity the push is
/// rejected and the caller surfaces the overflow to the client.
pub struct FinalQueue {
    jobs: VecDeque<Job>,
    capacity: usize,
}

impl FinalQueue {
    pub fn new(capacity: usize) -> Self {
        Self { jobs: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, job: Job) -> Result<(), Job> {
        if self.jobs.len() >= self.capacity {
            return Err(job);
        }
        self.jobs.push_back(job);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    /// Undo a pop when the worker channel cannot take the job this tick.
    pub fn push_front(&mut self, job: Job) {
        self.jobs.push_front(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobKind;

    fn job(conn_id: Uuid, seq: u64) -> Job {
        Job::new(JobKind::Interim, conn_id, vec![0.0; 16], "auto".into(), seq, 0.0, 1.0)
    }

    #[test]
    fn put_replaces_same_connection() {
        let mut q = CoalescingInterimQueue::new();
        let conn = Uuid::new_v4();
        assert!(q.put(job(conn, 1)).is_none());
        let displaced = q.put(job(conn, 2)).unwrap();
        assert_eq!(displaced.seq, 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn pop_oldest_is_fifo_across_connections() {
        let mut q = CoalescingInterimQueue::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        q.put(job(b, 2));
        q.put(job(a, 1));
        q.put(job(c, 3));
        assert_eq!(q.pop_oldest().unwrap().seq, 1);
        assert_eq!(q.pop_oldest().unwrap().seq, 2);
        assert_eq!(q.pop_oldest().unwrap().seq, 3);
        assert!(q.pop_oldest().is_none());
    }

    #[test]
    fn replacement_does_not_lose_queue_position_fairness() {
        // A connection that keeps refreshing its slot still holds exactly
        // one slot; another connection's older job wins the next pop.
        let mut q = CoalescingInterimQueue::new();
        let (busy, quiet) = (Uuid::new_v4(), Uuid::new_v4());
        q.put(job(busy, 1));
        q.put(job(quiet, 2));
        q.put(job(busy, 3));
        q.put(job(busy, 4));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_oldest().unwrap().conn_id, quiet);
        assert_eq!(q.pop_oldest().unwrap().conn_id, busy);
    }

    #[test]
    fn final_queue_rejects_past_capacity() {
        let mut q = FinalQueue::new(2);
        let conn = Uuid::new_v4();
        assert!(q.push(job(conn, 1)).is_ok());
        assert!(q.push(job(conn, 2)).is_ok());
        let rejected = q.push(job(conn, 3));
        assert!(rejected.is_err());
        assert_eq!(q.len(), 2);
        // FIFO order out.
        assert_eq!(q.pop().unwrap().seq, 1);
        assert_eq!(q.pop().unwrap().seq, 2);
    }
}

use std::time::{Duration, Instant};

/// Pending `setTimeout`/`setInterval` deadlines of one sandbox.
///
/// Only ids and deadlines live here; the callbacks stay on the JS side and
/// are looked up by id when a timer fires. Timers with the same deadline
/// fire in scheduling order.
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: Vec<Entry>,
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    deadline: Instant,
    seq: u64,
    id: u32,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules (or reschedules) timer `id` to fire `delay` after `now`.
    pub fn schedule(&mut self, id: u32, delay: Duration, now: Instant) {
        self.cancel(id);
        self.seq += 1;
        self.entries.push(Entry {
            deadline: now + delay,
            seq: self.seq,
            id,
        });
    }

    pub fn cancel(&mut self, id: u32) {
        self.entries.retain(|entry| entry.id != id);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|entry| entry.deadline).min()
    }

    /// Removes and returns every timer due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<u32> {
        let mut due: Vec<Entry> = Vec::new();
        self.entries.retain(|entry| {
            if entry.deadline <= now {
                due.push(*entry);
                false
            } else {
                true
            }
        });
        due.sort_by_key(|entry| (entry.deadline, entry.seq));
        due.into_iter().map(|entry| entry.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_empty_queue_has_no_deadline() {
        let queue = TimerQueue::new();
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn test_due_timers_fire_in_deadline_order() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        queue.schedule(1, 30 * MS, now);
        queue.schedule(2, 10 * MS, now);
        queue.schedule(3, 20 * MS, now);

        assert_eq!(queue.next_deadline(), Some(now + 10 * MS));
        assert_eq!(queue.pop_due(now + 25 * MS), vec![2, 3]);
        assert_eq!(queue.next_deadline(), Some(now + 30 * MS));
        assert_eq!(queue.pop_due(now + 30 * MS), vec![1]);
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn test_equal_deadlines_keep_scheduling_order() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        for id in [5, 3, 9] {
            queue.schedule(id, Duration::ZERO, now);
        }
        assert_eq!(queue.pop_due(now), vec![5, 3, 9]);
    }

    #[test]
    fn test_nothing_due_before_deadline() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        queue.schedule(1, 5 * MS, now);
        assert!(queue.pop_due(now).is_empty());
        assert_eq!(queue.next_deadline(), Some(now + 5 * MS));
    }

    #[test]
    fn test_cancel_and_reschedule() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        queue.schedule(1, 5 * MS, now);
        queue.schedule(2, 5 * MS, now);
        queue.cancel(1);
        // Rescheduling replaces the previous deadline
        queue.schedule(2, 50 * MS, now);

        assert_eq!(queue.next_deadline(), Some(now + 50 * MS));
        assert!(queue.pop_due(now + 10 * MS).is_empty());
        assert_eq!(queue.pop_due(now + 50 * MS), vec![2]);
    }
}

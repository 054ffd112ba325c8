//! In-order release of pipelined responses.

use std::collections::BTreeMap;

/// Holds completed responses until every earlier request has been answered.
///
/// Requests are numbered as they arrive; `pop_ready` only ever yields the
/// response for the oldest unanswered request.
#[derive(Debug)]
pub struct PipelineQueue<T> {
    next_seq: u64,
    next_out: u64,
    ready: BTreeMap<u64, T>,
}

impl<T> Default for PipelineQueue<T> {
    fn default() -> Self {
        Self {
            next_seq: 0,
            next_out: 0,
            ready: BTreeMap::new(),
        }
    }
}

impl<T> PipelineQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number for the next request to arrive.
    pub fn assign(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Store the response for `seq`. Unknown or already released numbers are ignored.
    pub fn complete(&mut self, seq: u64, item: T) {
        if seq >= self.next_out && seq < self.next_seq {
            self.ready.insert(seq, item);
        }
    }

    /// Next response in arrival order, if it is complete.
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.ready.remove(&self.next_out)?;
        self.next_out += 1;
        Some(item)
    }

    /// Requests assigned but not yet released.
    pub fn pending(&self) -> usize {
        (self.next_seq - self.next_out) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_in_arrival_order() {
        let mut queue = PipelineQueue::new();
        let a = queue.assign();
        let b = queue.assign();
        let c = queue.assign();
        assert_eq!(queue.pending(), 3);

        queue.complete(c, "c");
        assert_eq!(queue.pop_ready(), None);
        queue.complete(b, "b");
        assert_eq!(queue.pop_ready(), None);

        queue.complete(a, "a");
        assert_eq!(queue.pop_ready(), Some("a"));
        assert_eq!(queue.pop_ready(), Some("b"));
        assert_eq!(queue.pop_ready(), Some("c"));
        assert_eq!(queue.pop_ready(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn interleaved_assignment_and_release() {
        let mut queue = PipelineQueue::new();
        let first = queue.assign();
        queue.complete(first, 1);
        assert_eq!(queue.pop_ready(), Some(1));

        let second = queue.assign();
        let third = queue.assign();
        queue.complete(third, 3);
        assert_eq!(queue.pending(), 2);
        queue.complete(second, 2);
        assert_eq!(queue.pop_ready(), Some(2));
        assert_eq!(queue.pop_ready(), Some(3));
    }

    #[test]
    fn ignores_stale_and_unassigned() {
        let mut queue = PipelineQueue::new();
        let a = queue.assign();
        queue.complete(a, 'a');
        assert_eq!(queue.pop_ready(), Some('a'));

        queue.complete(a, 'x');
        queue.complete(7, 'y');
        assert_eq!(queue.pop_ready(), None);
        assert!(queue.is_empty());
    }
}

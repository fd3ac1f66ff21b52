//! Pending-request queue for the dispatcher.
//!
//! The head element stays in the queue while it executes; completion pops
//! it.  `cancel_last` therefore never touches index 0 — the head may be on
//! the SQL thread already.

use std::collections::VecDeque;

use sqlapi_protocol::Request;

#[derive(Debug, Default)]
pub struct RequestQueue {
    items: VecDeque<Request>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: Request) {
        self.items.push_back(request);
    }

    pub fn head(&self) -> Option<&Request> {
        self.items.front()
    }

    pub fn pop_head(&mut self) -> Option<Request> {
        self.items.pop_front()
    }

    /// Remove the most recent queued request from `client_id`, scanning from
    /// the tail and stopping before the head.  Returns whether one was found.
    pub fn cancel_last(&mut self, client_id: i32) -> bool {
        for index in (1..self.items.len()).rev() {
            if self.items[index].client_id == client_id {
                self.items.remove(index);
                return true;
            }
        }
        false
    }

    pub fn drain(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlapi_protocol::RequestKind;

    fn req(client_id: i32, kind: RequestKind) -> Request {
        Request::control(client_id, kind)
    }

    #[test]
    fn cancel_removes_the_most_recent_entry_for_the_client() {
        let mut q = RequestQueue::new();
        q.push(req(1, RequestKind::WriteRow)); // head, may be executing
        q.push(req(1, RequestKind::WriteRow));
        q.push(req(1, RequestKind::Count));
        assert!(q.cancel_last(1));
        assert_eq!(q.len(), 2);
        // The Count (most recent) is gone; head and middle write remain.
        assert_eq!(q.pop_head().unwrap().kind, RequestKind::WriteRow);
        assert_eq!(q.pop_head().unwrap().kind, RequestKind::WriteRow);
    }

    #[test]
    fn cancel_never_touches_the_head() {
        let mut q = RequestQueue::new();
        q.push(req(1, RequestKind::WriteRow));
        assert!(!q.cancel_last(1));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn cancel_skips_other_clients() {
        let mut q = RequestQueue::new();
        q.push(req(1, RequestKind::ReadAll));
        q.push(req(2, RequestKind::WriteRow));
        q.push(req(1, RequestKind::WriteRow));
        assert!(q.cancel_last(2));
        assert_eq!(q.len(), 2);
        assert!(q.items.iter().all(|r| r.client_id == 1));
    }

    #[test]
    fn cancel_on_empty_queue_is_a_no_op() {
        let mut q = RequestQueue::new();
        assert!(!q.cancel_last(1));
    }

    #[test]
    fn drain_clears_everything() {
        let mut q = RequestQueue::new();
        q.push(req(1, RequestKind::ReadOne));
        q.push(req(2, RequestKind::ReadOne));
        q.drain();
        assert!(q.is_empty());
    }
}

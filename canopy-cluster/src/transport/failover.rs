//! Recently-failed parent addresses
//!
//! Consulted by the edge transport while it has no parent. An address enters
//! the set when a connection to it fails and may only be popped for another
//! attempt once it has cooled down.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// FIFO of failed addresses with a membership index
#[derive(Debug)]
pub struct FailoverSet {
    queue: VecDeque<String>,
    inserted: HashMap<String, Instant>,
    cooldown: Duration,
}

impl FailoverSet {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            inserted: HashMap::new(),
            cooldown,
        }
    }

    /// Record a failed address; no-op if already present
    pub fn push(&mut self, addr: &str) {
        if self.inserted.contains_key(addr) {
            return;
        }
        self.queue.push_back(addr.to_string());
        self.inserted.insert(addr.to_string(), Instant::now());
    }

    /// Take the oldest address if it has cooled down
    pub fn pop(&mut self) -> Option<String> {
        let front = self.queue.front()?;
        let since = self.inserted.get(front)?;
        if since.elapsed() < self.cooldown {
            return None;
        }
        let addr = self.queue.pop_front()?;
        self.inserted.remove(&addr);
        Some(addr)
    }

    pub fn find(&self, addr: &str) -> bool {
        self.inserted.contains_key(addr)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.inserted.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_is_idempotent() {
        let mut set = FailoverSet::new(Duration::ZERO);
        set.push("a:1");
        set.push("a:1");
        assert_eq!(set.len(), 1);
        assert!(set.find("a:1"));
        assert!(!set.find("b:1"));
    }

    #[test]
    fn test_pop_is_fifo_after_cooldown() {
        let mut set = FailoverSet::new(Duration::ZERO);
        set.push("a:1");
        set.push("b:1");
        assert_eq!(set.pop().as_deref(), Some("a:1"));
        assert!(!set.find("a:1"));
        assert_eq!(set.pop().as_deref(), Some("b:1"));
        assert_eq!(set.pop(), None);
    }

    #[test]
    fn test_pop_waits_for_cooldown() {
        let mut set = FailoverSet::new(Duration::from_secs(3600));
        set.push("a:1");
        assert_eq!(set.pop(), None);
        // still present for membership checks
        assert!(set.find("a:1"));
    }

    #[test]
    fn test_clear() {
        let mut set = FailoverSet::new(Duration::ZERO);
        set.push("a:1");
        set.push("b:1");
        set.clear();
        assert!(set.is_empty());
        assert!(!set.find("a:1"));
        assert_eq!(set.pop(), None);
    }
}

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Schema,
    Test(usize),
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Schema => write!(f, "schema"),
            UnitKind::Test(index) => write!(f, "test_{}", index),
        }
    }
}

/// One input blob for the child. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestUnit {
    kind: UnitKind,
    body: String,
}

impl TestUnit {
    pub fn schema(body: impl Into<String>) -> Self {
        Self {
            kind: UnitKind::Schema,
            body: body.into(),
        }
    }

    /// `index` is 1-based, matching the position among the segmented units.
    pub fn test(index: usize, body: impl Into<String>) -> Self {
        Self {
            kind: UnitKind::Test(index),
            body: body.into(),
        }
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

/// FIFO of units awaiting delivery. One producer, one consumer.
#[derive(Debug, Default)]
pub struct PendingQueue {
    inner: Mutex<VecDeque<TestUnit>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TestUnit>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, unit: TestUnit) {
        self.lock().push_back(unit);
    }

    pub fn pop(&self) -> Option<TestUnit> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pops_in_insertion_order() {
        let queue = PendingQueue::new();
        queue.push(TestUnit::schema("CREATE TABLE t(x INT);"));
        queue.push(TestUnit::test(1, "INSERT INTO t VALUES(1);"));
        queue.push(TestUnit::test(2, "SELECT * FROM t;"));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop().map(|u| u.kind()), Some(UnitKind::Schema));
        assert_eq!(queue.pop().map(|u| u.kind()), Some(UnitKind::Test(1)));
        assert_eq!(queue.pop().map(|u| u.kind()), Some(UnitKind::Test(2)));
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_producer_and_consumer_keep_fifo() {
        let queue = Arc::new(PendingQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 1..=500 {
                    queue.push(TestUnit::test(i, format!("unit {}", i)));
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 500 {
            match queue.pop() {
                Some(unit) => seen.push(unit.kind()),
                None => thread::yield_now(),
            }
        }
        producer.join().expect("producer thread");

        let expected: Vec<UnitKind> = (1..=500).map(UnitKind::Test).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn unit_kind_labels() {
        assert_eq!(UnitKind::Schema.to_string(), "schema");
        assert_eq!(UnitKind::Test(7).to_string(), "test_7");
    }
}

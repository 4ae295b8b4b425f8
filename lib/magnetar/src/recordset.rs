use crate::errors::Result;
use crate::record::Record;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

const QUEUE_CAPACITY: usize = 1024;

/// Stream of records produced by scan workers and drained by the caller.
/// The `active` flag doubles as the caller's early-termination switch:
/// clearing it makes every producer abort between rows.
pub struct Recordset {
    queue: Mutex<VecDeque<Result<Record>>>,
    not_empty: Condvar,
    not_full: Condvar,
    active: AtomicBool,
    producers: AtomicUsize,
    remaining: AtomicU64,
    task_id: u64,
}

impl Recordset {
    /// `producers` is the number of workers that will call `signal_end`;
    /// `max_records` of zero is unlimited.
    pub fn new(producers: usize, max_records: u64, task_id: u64) -> Recordset {
        Recordset {
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY.min(64))),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            active: AtomicBool::new(true),
            producers: AtomicUsize::new(producers),
            remaining: AtomicU64::new(max_records),
            task_id,
        }
    }

    #[inline]
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Caller-side termination. Producers observe it between rows; blocked
    /// ones are woken.
    pub fn close(&self) {
        self.active.store(false, Ordering::Relaxed);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Queue one row. Returns false when the stream was closed, telling the
    /// producer to stop.
    pub(crate) fn push(&self, item: Result<Record>) -> bool {
        if item.is_ok() {
            // Enforce the caller's record budget across all workers.
            let budget_hit = self
                .remaining
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |remaining| {
                    match remaining {
                        0 => None, // unlimited
                        1 => Some(0),
                        n => Some(n - 1),
                    }
                })
                .map_or(false, |previous| previous == 1);
            if budget_hit {
                let mut queue = self.queue.lock().expect("recordset poisoned");
                queue.push_back(item);
                drop(queue);
                self.close();
                return false;
            }
        }

        let mut queue = self.queue.lock().expect("recordset poisoned");
        while queue.len() >= QUEUE_CAPACITY {
            if !self.is_active() {
                return false;
            }
            queue = self.not_full.wait(queue).expect("recordset poisoned");
        }
        if !self.is_active() {
            return false;
        }
        queue.push_back(item);
        drop(queue);
        self.not_empty.notify_one();
        true
    }

    /// One producer finished (successfully or not).
    pub(crate) fn signal_end(&self) {
        if self.producers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.not_empty.notify_all();
        }
    }

    /// Blocking pop; `None` once every producer finished and the queue
    /// drained, or the stream was closed.
    pub fn next_record(&self) -> Option<Result<Record>> {
        let mut queue = self.queue.lock().expect("recordset poisoned");
        loop {
            if let Some(item) = queue.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if self.producers.load(Ordering::Acquire) == 0 || !self.is_active() {
                return None;
            }
            queue = self.not_empty.wait(queue).expect("recordset poisoned");
        }
    }
}

impl<'a> Iterator for &'a Recordset {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Result<Record>> {
        self.next_record()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    fn record() -> Record {
        Record::new(None, HashMap::new(), 1, 0)
    }

    #[test]
    fn test_push_pop_in_order() {
        let rs = Recordset::new(1, 0, 7);
        assert!(rs.push(Ok(record())));
        assert!(rs.push(Ok(record())));
        rs.signal_end();

        let mut count = 0;
        for item in &rs {
            assert!(item.is_ok());
            count += 1;
        }
        assert_eq!(count, 2);
        assert_eq!(rs.task_id(), 7);
    }

    #[test]
    fn test_close_stops_producers() {
        let rs = Recordset::new(1, 0, 1);
        assert!(rs.push(Ok(record())));
        rs.close();
        assert!(!rs.push(Ok(record())));
        assert!(!rs.is_active());
    }

    #[test]
    fn test_max_records_budget() {
        let rs = Recordset::new(1, 2, 1);
        assert!(rs.push(Ok(record())));
        // Second push lands but exhausts the budget and closes the stream.
        assert!(!rs.push(Ok(record())));
        assert!(!rs.is_active());
        assert!(!rs.push(Ok(record())));

        let mut drained = 0;
        while let Some(item) = rs.next_record() {
            assert!(item.is_ok());
            drained += 1;
        }
        assert_eq!(drained, 2);
    }

    #[test]
    fn test_error_rows_pass_through() {
        let rs = Recordset::new(1, 0, 1);
        assert!(rs.push(Err(crate::errors::Error::parse("boom"))));
        rs.signal_end();
        let item = rs.next_record().unwrap();
        assert!(item.is_err());
        assert!(rs.next_record().is_none());
    }
}

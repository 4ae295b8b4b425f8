use crate::net::connection::Connection;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Bounded idle-connection store for one node. `total` tracks every live
/// connection, pooled or checked out, and enforces the cap.
#[derive(Debug)]
pub struct ConnectionPool {
    idle: Mutex<VecDeque<Connection>>,
    total: AtomicUsize,
    capacity: usize,
    idle_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(capacity: usize, idle_timeout: Duration) -> ConnectionPool {
        ConnectionPool {
            idle: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            total: AtomicUsize::new(0),
            capacity,
            idle_timeout,
        }
    }

    /// Most-recently-used idle connection, discarding any that sat past the
    /// idle deadline on the way.
    pub fn checkout(&self) -> Option<Connection> {
        let mut idle = self.idle.lock().expect("pool poisoned");
        while let Some(mut conn) = idle.pop_back() {
            if conn.idle_expired(self.idle_timeout) {
                conn.close();
                self.total.fetch_sub(1, Ordering::Relaxed);
                continue;
            }
            return Some(conn);
        }
        None
    }

    /// Claim headroom for one new connection. The caller must either
    /// `checkin` the established connection or `cancel_reservation`.
    pub fn reserve(&self) -> bool {
        self.total
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                if total < self.capacity {
                    Some(total + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    #[inline]
    pub fn cancel_reservation(&self) {
        self.total.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock().expect("pool poisoned");
        idle.push_back(conn);
    }

    /// Drop a checked-out connection that must not return to the pool.
    pub fn discard(&self, mut conn: Connection) {
        conn.close();
        self.total.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn live_connections(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_respects_capacity() {
        let pool = ConnectionPool::new(2, Duration::from_secs(10));
        assert!(pool.reserve());
        assert!(pool.reserve());
        assert!(!pool.reserve());
        pool.cancel_reservation();
        assert!(pool.reserve());
        assert_eq!(pool.live_connections(), 2);
    }

    #[test]
    fn test_checkout_empty_pool() {
        let pool = ConnectionPool::new(2, Duration::from_secs(10));
        assert!(pool.checkout().is_none());
    }
}

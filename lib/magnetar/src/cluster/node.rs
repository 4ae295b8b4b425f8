use crate::commands::admin_command;
use crate::commands::LatencyType;
use crate::errors::{Error, ErrorKind, Result};
use crate::net::{Connection, ConnectionPool, Host};
use crate::policy::ClientPolicy;
use flint::logging;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Capability bits probed from the server at discovery time. They select
/// wire dialects; absent a tender the defaults assume a current server.
#[derive(Debug, Copy, Clone)]
pub struct NodeFeatures {
    /// Node speaks the batch-index protocol (one frame multiplexing many
    /// keys). Off forces the per-namespace direct dialect.
    pub batch_index: bool,
}

impl Default for NodeFeatures {
    fn default() -> NodeFeatures {
        NodeFeatures { batch_index: true }
    }
}

#[derive(Debug, Default)]
struct LatencyCell {
    count: AtomicU64,
    total_micros: AtomicU64,
}

/// One storage node: address, connection pool, circuit-breaker counters and
/// latency tallies.
pub struct Node {
    name: String,
    host: Host,
    features: NodeFeatures,
    pool: ConnectionPool,
    login_timeout: Duration,
    /// User plus bcrypt credential, precomputed once.
    auth: Option<(String, String)>,
    error_window: Duration,
    max_error_rate: u32,
    window_start: Mutex<Instant>,
    error_count: AtomicU32,
    timeout_count: AtomicU32,
    latency: [LatencyCell; 5],
    log: logging::Logger,
}

impl Node {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        name: String,
        host: Host,
        features: NodeFeatures,
        policy: &ClientPolicy,
        log: L,
    ) -> Result<Node> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("node" => name.clone())),
            None => logging::null(),
        };

        let auth = match (&policy.user, &policy.password) {
            (Some(user), Some(password)) => Some((
                user.clone(),
                admin_command::hash_password(password)?,
            )),
            (Some(user), None) => Some((user.clone(), String::new())),
            _ => None,
        };

        Ok(Node {
            name,
            host,
            features,
            pool: ConnectionPool::new(policy.max_conns_per_node, policy.idle_timeout),
            login_timeout: policy.login_timeout,
            auth,
            error_window: policy.error_rate_window,
            max_error_rate: policy.max_error_rate,
            window_start: Mutex::new(Instant::now()),
            error_count: AtomicU32::new(0),
            timeout_count: AtomicU32::new(0),
            latency: Default::default(),
            log,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn host(&self) -> &Host {
        &self.host
    }

    #[inline]
    pub fn supports_batch_index(&self) -> bool {
        self.features.batch_index
    }

    /// Pooled or fresh connection with the attempt's socket deadline
    /// applied. Fails fast with `Backoff` while the breaker is open.
    pub fn get_connection(&self, socket_timeout: Duration) -> Result<Connection> {
        if self.error_rate_exceeded() {
            return Err(Error::new(ErrorKind::Backoff));
        }

        if let Some(mut conn) = self.pool.checkout() {
            conn.set_timeout(socket_timeout)?;
            return Ok(conn);
        }

        if !self.pool.reserve() {
            return Err(Error::new(ErrorKind::NoMoreConnections));
        }
        match self.create_connection(socket_timeout) {
            Ok(conn) => Ok(conn),
            Err(err) => {
                self.pool.cancel_reservation();
                self.record_error();
                Err(err)
            }
        }
    }

    fn create_connection(&self, socket_timeout: Duration) -> Result<Connection> {
        let mut conn = Connection::connect(&self.host, self.login_timeout)?;
        if let Some((user, credential)) = &self.auth {
            conn.set_timeout(self.login_timeout)?;
            admin_command::authenticate_connection(&mut conn, user, credential)?;
        }
        conn.set_timeout(socket_timeout)?;
        logging::debug!(self.log, "connection established";
            "context" => "pool", "live" => self.pool.live_connections());
        Ok(conn)
    }

    /// A clean connection comes home to the pool.
    #[inline]
    pub fn return_connection(&self, conn: Connection) {
        self.pool.checkin(conn);
    }

    /// A tainted connection is closed and never pooled again.
    #[inline]
    pub fn close_connection(&self, conn: Connection) {
        self.pool.discard(conn);
    }

    /// Count one failure into the breaker window, rolling the window when
    /// it lapsed.
    pub fn record_error(&self) {
        let mut window_start = self.window_start.lock().expect("window poisoned");
        if window_start.elapsed() > self.error_window {
            *window_start = Instant::now();
            self.error_count.store(0, Ordering::Relaxed);
        }
        let errors = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        logging::trace!(self.log, "node error recorded";
            "context" => "breaker", "window_errors" => errors);
    }

    #[inline]
    pub fn record_timeout(&self) {
        self.timeout_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_rate_exceeded(&self) -> bool {
        if self.max_error_rate == 0 {
            return false;
        }
        let window_start = self.window_start.lock().expect("window poisoned");
        if window_start.elapsed() > self.error_window {
            return false;
        }
        self.error_count.load(Ordering::Relaxed) > self.max_error_rate
    }

    #[inline]
    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn timeout_count(&self) -> u32 {
        self.timeout_count.load(Ordering::Relaxed)
    }

    pub fn record_latency(&self, latency_type: LatencyType, elapsed: Duration) {
        let cell = &self.latency[latency_type as usize];
        cell.count.fetch_add(1, Ordering::Relaxed);
        cell.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// (request count, cumulative micros) recorded for a latency category.
    pub fn latency(&self, latency_type: LatencyType) -> (u64, u64) {
        let cell = &self.latency[latency_type as usize];
        (
            cell.count.load(Ordering::Relaxed),
            cell.total_micros.load(Ordering::Relaxed),
        )
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("host", &self.host)
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node(max_error_rate: u32, window: Duration) -> Node {
        let mut policy = ClientPolicy::default();
        policy.max_error_rate = max_error_rate;
        policy.error_rate_window = window;
        Node::new(
            "n1".to_string(),
            Host::new("127.0.0.1", 3000),
            NodeFeatures::default(),
            &policy,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_breaker_trips_above_rate() {
        let node = test_node(3, Duration::from_secs(60));
        for _ in 0..3 {
            node.record_error();
        }
        assert!(!node.error_rate_exceeded());
        node.record_error();
        assert!(node.error_rate_exceeded());
        assert!(matches!(
            node.get_connection(Duration::from_secs(1)),
            Err(Error {
                kind: ErrorKind::Backoff,
                ..
            })
        ));
    }

    #[test]
    fn test_breaker_window_rolls_over() {
        let node = test_node(1, Duration::from_millis(10));
        node.record_error();
        node.record_error();
        assert!(node.error_rate_exceeded());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!node.error_rate_exceeded());
    }

    #[test]
    fn test_breaker_disabled_at_zero() {
        let node = test_node(0, Duration::from_secs(1));
        for _ in 0..100 {
            node.record_error();
        }
        assert!(!node.error_rate_exceeded());
    }

    #[test]
    fn test_latency_tallies() {
        let node = test_node(0, Duration::from_secs(1));
        node.record_latency(LatencyType::Read, Duration::from_micros(250));
        node.record_latency(LatencyType::Read, Duration::from_micros(750));
        let (count, micros) = node.latency(LatencyType::Read);
        assert_eq!(count, 2);
        assert_eq!(micros, 1000);
    }
}

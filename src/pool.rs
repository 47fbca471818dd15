//! Connection pooling for a single server endpoint.
use crate::auth::Authenticator;
use crate::connstring::Host;
use crate::error::Error::{self, OperationError};
use crate::error::Result;
use crate::stream::{Stream, StreamConnector};

use bufstream::BufStream;

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_POOL_SIZE: usize = 5;
pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_MAX_LIFE_TIME: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_WAIT_QUEUE_TIMEOUT: Duration = Duration::from_secs(2 * 60);
// Bounds the wait queue at a multiple of the pool size, as the legacy
// drivers did with their wait-queue multiple.
pub const DEFAULT_WAIT_QUEUE_MULTIPLE: usize = 5;

/// Sizing and lifetime limits for a connection pool.
#[derive(Clone)]
pub struct PoolOptions {
    /// The maximum number of concurrent connections allowed.
    pub max_pool_size: usize,
    /// Idle connections older than this are discarded instead of reused.
    pub max_idle_time: Option<Duration>,
    /// Connections alive longer than this are discarded on release.
    pub max_life_time: Option<Duration>,
    /// How long an acquiring thread may block waiting for a free connection.
    pub wait_queue_timeout: Duration,
    /// The maximum number of threads that may wait at once.
    pub max_wait_queue_len: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            max_pool_size: DEFAULT_POOL_SIZE,
            max_idle_time: Some(DEFAULT_MAX_IDLE_TIME),
            max_life_time: Some(DEFAULT_MAX_LIFE_TIME),
            wait_queue_timeout: DEFAULT_WAIT_QUEUE_TIMEOUT,
            max_wait_queue_len: DEFAULT_WAIT_QUEUE_MULTIPLE * DEFAULT_POOL_SIZE,
        }
    }
}

impl PoolOptions {
    pub fn new() -> PoolOptions {
        Default::default()
    }

    /// Returns a copy sized for a single connection, as used by monitors.
    pub fn single_connection(&self) -> PoolOptions {
        let mut options = self.clone();
        options.max_pool_size = 1;
        options
    }
}

/// An open, possibly-authenticated socket to one server.
pub struct Connection {
    socket: BufStream<Stream>,
    // Databases this socket has authenticated against.
    authenticated: HashSet<String>,
    created_at: Instant,
    last_used_at: Instant,
}

impl Connection {
    fn new(socket: BufStream<Stream>) -> Connection {
        let now = Instant::now();
        Connection {
            socket,
            authenticated: HashSet::new(),
            created_at: now,
            last_used_at: now,
        }
    }

    fn past_life_limit(&self, max_life_time: Option<Duration>) -> bool {
        match max_life_time {
            Some(limit) => self.created_at.elapsed() > limit,
            None => false,
        }
    }

    fn past_idle_limit(&self, max_idle_time: Option<Duration>) -> bool {
        match max_idle_time {
            Some(limit) => self.last_used_at.elapsed() > limit,
            None => false,
        }
    }

    /// Re-checks authentication for a database, establishing it if the
    /// connection has not yet authenticated there.
    pub fn ensure_authenticated(
        &mut self,
        database: &str,
        authenticator: Option<&Arc<dyn Authenticator>>,
    ) -> Result<()> {
        let authenticator = match authenticator {
            Some(authenticator) => authenticator,
            None => return Ok(()),
        };

        if self.authenticated.contains(database) {
            return Ok(());
        }

        match authenticator.authenticate(&mut self.socket, database) {
            Ok(()) => {
                self.authenticated.insert(database.to_owned());
                Ok(())
            }
            Err(Error::AuthenticationError(msg)) => Err(Error::AuthenticationError(msg)),
            Err(err) => Err(Error::AuthenticationError(err.to_string())),
        }
    }
}

struct Pool {
    // The maximum number of concurrent connections allowed.
    size: usize,
    // The current number of open connections.
    len: usize,
    // The idle connection set.
    sockets: Vec<Connection>,
    // The current number of threads blocked on the wait queue.
    waiting: usize,
    // The pool iteration. When a server monitor fails to execute isMaster,
    // the connection pool is cleared and the iteration is incremented.
    iteration: usize,
}

/// Handles threaded connections to one server endpoint.
#[derive(Clone)]
pub struct ConnectionPool {
    /// The connection host.
    pub host: Host,
    // The socket pool.
    inner: Arc<Mutex<Pool>>,
    // A condition variable used for threads waiting for the pool
    // to be repopulated with available connections.
    wait_lock: Arc<Condvar>,
    stream_connector: StreamConnector,
    options: PoolOptions,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("host", &self.host)
            .finish()
    }
}

/// Holds an acquired connection, with logic to return it to the pool
/// when dropped.
pub struct PooledConnection {
    // This option will always be Some(connection) until the connection is
    // returned to the pool using take().
    conn: Option<Connection>,
    // A reference to the pool that the connection was taken from.
    pool: Arc<Mutex<Pool>>,
    // A reference to the waiting condvar associated with the pool.
    wait_lock: Arc<Condvar>,
    // The pool iteration at the moment of extraction.
    iteration: usize,
    max_life_time: Option<Duration>,
}

impl PooledConnection {
    /// Returns a reference to the underlying buffered socket.
    pub fn get_socket(&mut self) -> &mut BufStream<Stream> {
        &mut self.conn.as_mut().unwrap().socket
    }

    /// The remote address of the underlying socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.conn.as_ref().unwrap().socket.get_ref().peer_addr()
    }

    /// Re-checks authentication for a database before the connection is used.
    pub fn ensure_authenticated(
        &mut self,
        database: &str,
        authenticator: Option<&Arc<dyn Authenticator>>,
    ) -> Result<()> {
        self.conn
            .as_mut()
            .unwrap()
            .ensure_authenticated(database, authenticator)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        // Attempt to lock and return the connection to the pool,
        // or give up if the pool lock has been poisoned.
        if let Ok(mut locked) = self.pool.lock() {
            if self.iteration == locked.iteration {
                if conn.past_life_limit(self.max_life_time) {
                    locked.len -= 1;
                } else {
                    conn.last_used_at = Instant::now();
                    locked.sockets.push(conn);
                }
                // Notify waiting threads that a connection or a slot
                // has been freed.
                self.wait_lock.notify_one();
            }
        }
    }
}

impl ConnectionPool {
    /// Returns a connection pool with default options.
    pub fn new(host: Host, connector: StreamConnector) -> ConnectionPool {
        ConnectionPool::with_options(host, connector, PoolOptions::default())
    }

    /// Returns a connection pool with the specified options.
    pub fn with_options(
        host: Host,
        connector: StreamConnector,
        options: PoolOptions,
    ) -> ConnectionPool {
        ConnectionPool {
            host,
            wait_lock: Arc::new(Condvar::new()),
            inner: Arc::new(Mutex::new(Pool {
                size: options.max_pool_size,
                len: 0,
                sockets: Vec::with_capacity(options.max_pool_size),
                waiting: 0,
                iteration: 0,
            })),
            stream_connector: connector,
            options,
        }
    }

    /// Discards all open connections; outstanding ones are dropped rather
    /// than returned when their holders release them.
    pub fn clear(&self) {
        if let Ok(mut locked) = self.inner.lock() {
            locked.iteration += 1;
            locked.sockets.clear();
            locked.len = 0;
            self.wait_lock.notify_all();
        }
    }

    /// Attempts to acquire a connection. A valid idle connection is reused
    /// when available; otherwise a new connection is opened if the pool has
    /// not reached its maximum size. Otherwise the calling thread blocks on
    /// the wait queue until a connection is returned, the wait-queue timeout
    /// elapses, or the wait queue itself is already full.
    pub fn acquire(&self) -> Result<PooledConnection> {
        let mut locked = self.inner.lock()?;
        if locked.size == 0 {
            return Err(OperationError(String::from(
                "The connection pool does not allow connections; increase the size of the pool.",
            )));
        }

        let deadline = Instant::now() + self.options.wait_queue_timeout;

        loop {
            // Acquire an existing connection, discarding any that have sat
            // idle or lived too long.
            while let Some(conn) = locked.sockets.pop() {
                if conn.past_idle_limit(self.options.max_idle_time)
                    || conn.past_life_limit(self.options.max_life_time)
                {
                    locked.len -= 1;
                    continue;
                }
                return Ok(self.wrap(conn, locked.iteration));
            }

            // Attempt to make a new connection
            if locked.len < locked.size {
                locked.len += 1;
                match self.connect() {
                    Ok(socket) => return Ok(self.wrap(Connection::new(socket), locked.iteration)),
                    Err(err) => {
                        locked.len -= 1;
                        self.wait_lock.notify_one();
                        return Err(err);
                    }
                }
            }

            if locked.waiting >= self.options.max_wait_queue_len {
                return Err(Error::WaitQueueFullError);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::WaitQueueTimeoutError);
            }

            // Release lock and wait for the pool to be repopulated
            locked.waiting += 1;
            let (guard, _) = self.wait_lock.wait_timeout(locked, deadline - now)?;
            locked = guard;
            locked.waiting -= 1;
        }
    }

    fn wrap(&self, conn: Connection, iteration: usize) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            wait_lock: self.wait_lock.clone(),
            iteration,
            max_life_time: self.options.max_life_time,
        }
    }

    // Connects to the server as defined by the initial configuration.
    fn connect(&self) -> Result<BufStream<Stream>> {
        match self
            .stream_connector
            .connect(&self.host.host_name[..], self.host.port)
        {
            Ok(stream) => Ok(BufStream::new(stream)),
            Err(err) => Err(Error::from(err)),
        }
    }
}

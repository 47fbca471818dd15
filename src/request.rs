//! Request affinity: pinning a thread's operations to one connection.
//!
//! A request is a caller-initiated scope during which every operation the
//! current thread performs through one client is sent over the same
//! physical connection, which matters for read-your-own-write consistency
//! immediately after an unacknowledged write. Records live in a
//! runtime-guarded thread-local cell keyed by client, so no cross-thread
//! locking is involved.
use crate::error::Error::StateError;
use crate::error::Result;
use crate::pool::PooledConnection;
use crate::stream::Stream;
use crate::topology::server::ServerInstance;
use crate::{Client, ThreadedClient};

use bufstream::BufStream;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

thread_local! {
    static REQUESTS: RefCell<HashMap<usize, RequestRecord>> = RefCell::new(HashMap::new());
}

struct RequestRecord {
    instance: ServerInstance,
    // None while an operation has the connection checked out.
    connection: Option<PooledConnection>,
    nesting_level: usize,
}

/// The instance pinned by the current thread's active request, if any.
pub(crate) fn active_instance(client_id: usize) -> Option<ServerInstance> {
    REQUESTS.with(|cell| {
        cell.borrow()
            .get(&client_id)
            .map(|record| record.instance.clone())
    })
}

/// Creates a request record with nesting level 1. The caller must have
/// verified that no record exists for this client on this thread.
pub(crate) fn begin(client_id: usize, instance: ServerInstance, connection: PooledConnection) {
    REQUESTS.with(|cell| {
        cell.borrow_mut().insert(
            client_id,
            RequestRecord {
                instance,
                connection: Some(connection),
                nesting_level: 1,
            },
        );
    });
}

/// Increments the nesting level of an existing record. Returns false if
/// the thread has no active request for this client.
pub(crate) fn nest(client_id: usize) -> bool {
    REQUESTS.with(|cell| match cell.borrow_mut().get_mut(&client_id) {
        Some(record) => {
            record.nesting_level += 1;
            true
        }
        None => false,
    })
}

/// Decrements the nesting level; at zero the record is removed and its
/// connection returns to the owning pool.
pub(crate) fn done(client_id: usize) -> Result<()> {
    REQUESTS.with(|cell| {
        let mut map = cell.borrow_mut();
        match map.get_mut(&client_id) {
            Some(record) => {
                record.nesting_level -= 1;
                if record.nesting_level == 0 {
                    map.remove(&client_id);
                }
                Ok(())
            }
            None => Err(StateError(
                "Thread is not in a request (did you call request_start?).".to_owned(),
            )),
        }
    })
}

pub(crate) fn nesting_level(client_id: usize) -> usize {
    REQUESTS.with(|cell| {
        cell.borrow()
            .get(&client_id)
            .map(|record| record.nesting_level)
            .unwrap_or(0)
    })
}

/// Checks the pinned connection out of the record for one operation.
pub(crate) fn take_pinned(
    client_id: usize,
) -> Result<Option<(ServerInstance, PooledConnection)>> {
    REQUESTS.with(|cell| {
        let mut map = cell.borrow_mut();
        match map.get_mut(&client_id) {
            Some(record) => match record.connection.take() {
                Some(connection) => Ok(Some((record.instance.clone(), connection))),
                None => Err(StateError(
                    "The request's pinned connection is already in use.".to_owned(),
                )),
            },
            None => Ok(None),
        }
    })
}

/// Returns a checked-out pinned connection to its record. If the request
/// ended while the operation was in flight, the connection simply drops
/// back to its pool.
pub(crate) fn return_pinned(client_id: usize, connection: PooledConnection) {
    REQUESTS.with(|cell| {
        let mut map = cell.borrow_mut();
        if let Some(record) = map.get_mut(&client_id) {
            if record.connection.is_none() {
                record.connection = Some(connection);
            }
        }
    });
}

/// A disposable handle for an active request scope. Dropping the handle
/// ends the scope; `done` ends it explicitly and surfaces any usage error.
#[must_use]
pub struct Request {
    client: Client,
    completed: bool,
}

impl Request {
    pub(crate) fn new(client: Client) -> Request {
        Request {
            client,
            completed: false,
        }
    }

    /// Ends the request scope, decrementing the nesting level.
    pub fn done(mut self) -> Result<()> {
        self.completed = true;
        self.client.request_done()
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if !self.completed {
            let _ = self.client.request_done();
        }
    }
}

/// A connection handed out by the server facade: either freshly drawn from
/// an instance's pool, or the connection pinned by the thread's active
/// request. Dropping the handle releases the connection appropriately --
/// back to the pool, or back to the request record to stay checked out
/// until the request ends.
pub struct AcquiredConnection {
    connection: Option<PooledConnection>,
    instance: ServerInstance,
    pinned_client_id: Option<usize>,
}

impl AcquiredConnection {
    pub(crate) fn owned(instance: ServerInstance, connection: PooledConnection) -> AcquiredConnection {
        AcquiredConnection {
            connection: Some(connection),
            instance,
            pinned_client_id: None,
        }
    }

    pub(crate) fn pinned(
        client_id: usize,
        instance: ServerInstance,
        connection: PooledConnection,
    ) -> AcquiredConnection {
        AcquiredConnection {
            connection: Some(connection),
            instance,
            pinned_client_id: Some(client_id),
        }
    }

    /// The instance this connection belongs to.
    pub fn instance(&self) -> &ServerInstance {
        &self.instance
    }

    /// Returns a reference to the underlying buffered socket.
    pub fn get_socket(&mut self) -> &mut BufStream<Stream> {
        self.connection.as_mut().unwrap().get_socket()
    }

    /// The remote address of the underlying socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.connection.as_ref().unwrap().peer_addr()
    }
}

impl Drop for AcquiredConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            match self.pinned_client_id {
                Some(client_id) => return_pinned(client_id, connection),
                // An owned connection drops straight back to its pool.
                None => drop(connection),
            }
        }
    }
}

//! # A synchronous, topology-aware MongoDB driver core
//!
//! This crate covers the routing half of a driver: discovering and
//! tracking the deployment topology (standalone, replica set, or sharded
//! cluster), resolving a server for each operation according to a read
//! preference, multiplexing operations over pooled authenticated
//! connections, and streaming query results through the wire protocol's
//! cursor operations.
//!
//! ## Connecting
//!
//! ```no_run
//! use mongodb_sync::{ClientOptions, ThreadedClient};
//!
//! let client = ClientOptions::new()
//!     .connect("localhost", 27017)
//!     .expect("Failed to initialize client.");
//! ```
//!
//! ## Running queries
//!
//! ```no_run
//! # use mongodb_sync::{ClientOptions, ThreadedClient};
//! # use mongodb_sync::cursor::Cursor;
//! # use bson::{bson, doc, Document};
//! #
//! # let client = ClientOptions::new().connect("localhost", 27017).unwrap();
//! let mut cursor: Cursor<Document> =
//!     Cursor::new(client.clone(), "media.movies", doc! { "year": 1985 });
//! cursor.set_limit(10).unwrap().set_batch_size(5).unwrap();
//!
//! for result in cursor.iter() {
//!     let movie = result.expect("cursor operation failed");
//!     println!("{:?}", movie);
//! }
//! ```
//!
//! ## Command monitoring
//!
//! Arbitrary functions can be registered as start and completion hooks,
//! observing every wire round-trip the driver makes.
//!
//! ```no_run
//! use mongodb_sync::{Client, ClientOptions, CommandResult, ThreadedClient};
//!
//! fn log_query_duration(_client: Client, command_result: &CommandResult) {
//!     match *command_result {
//!         CommandResult::Success { duration, .. } => {
//!             println!("Command took {} nanoseconds.", duration);
//!         }
//!         _ => println!("Failed to execute command."),
//!     }
//! }
//!
//! let client = ClientOptions::new().connect("localhost", 27017).unwrap();
//! client.add_completion_hook(log_query_duration).unwrap();
//! ```
pub mod auth;
pub mod common;
pub mod connstring;
pub mod cursor;
pub mod error;
pub mod index_cache;
pub mod policy;
pub mod pool;
pub mod request;
pub mod stream;
pub mod topology;
pub mod wire_protocol;

mod apm;

pub use crate::apm::{CommandResult, CommandStarted, CompletionHook, Listener, StartHook};
pub use crate::error::{CommandException, Error, ErrorCode, Result};
pub use crate::request::{AcquiredConnection, Request};

use crate::auth::Authenticator;
use crate::common::ReadPreference;
use crate::connstring::Host;
use crate::cursor::Cursor;
use crate::error::Error::StateError;
use crate::index_cache::IndexCache;
use crate::policy::{DefaultSecondaryEligibility, SecondaryEligibility};
use crate::pool::PoolOptions;
use crate::stream::StreamConnector;
use crate::topology::server::ServerInstance;
use crate::topology::{InstanceSettings, Topology, DEFAULT_HEARTBEAT_FREQUENCY_MS};

use bson::{bson, doc, Bson, Document};

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;

// Distinguishes clients within the thread-local request records.
static CLIENT_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Interfaces with a single server, replica set, or sharded cluster.
pub struct ClientInner {
    id: usize,
    req_id: Arc<AtomicIsize>,
    topology: Topology,
    listener: Listener,
    read_preference: ReadPreference,
    secondary_eligibility: Arc<dyn SecondaryEligibility>,
    index_cache: IndexCache,
}

impl ClientInner {
    /// The default read preference operations fall back to.
    pub fn read_preference(&self) -> ReadPreference {
        self.read_preference.clone()
    }

    /// Consults the configured policy on whether a command may be routed
    /// to a secondary.
    pub fn can_run_on_secondary(&self, command: &Document) -> bool {
        self.secondary_eligibility.can_run_on_secondary(command)
    }

    /// The cache of indexes known to exist.
    pub fn index_cache(&self) -> &IndexCache {
        &self.index_cache
    }

    /// The monitored deployment topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }
}

/// Configuration options consumed when connecting a client.
pub struct ClientOptions {
    /// Frequency of server monitor updates; default 10000 ms.
    pub heartbeat_frequency_ms: u32,
    /// The default read preference for operations.
    pub read_preference: ReadPreference,
    /// The expected replica set name, when connecting to a replica set by
    /// seed list.
    pub replica_set_name: Option<String>,
    /// Sizing and lifetime limits for each server's connection pool.
    pub pool_options: PoolOptions,
    /// How sockets to the servers are established.
    pub stream_connector: StreamConnector,
    /// Invoked per connection per database before first use.
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Decides whether a command may be routed to a secondary.
    pub secondary_eligibility: Arc<dyn SecondaryEligibility>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            heartbeat_frequency_ms: DEFAULT_HEARTBEAT_FREQUENCY_MS,
            read_preference: ReadPreference::primary(),
            replica_set_name: None,
            pool_options: PoolOptions::default(),
            stream_connector: StreamConnector::default(),
            authenticator: None,
            secondary_eligibility: Arc::new(DefaultSecondaryEligibility),
        }
    }
}

impl ClientOptions {
    /// Creates a new default options struct.
    pub fn new() -> ClientOptions {
        Default::default()
    }

    /// Connects to a single seed host.
    pub fn connect(self, host: &str, port: u16) -> Result<Client> {
        self.connect_with_seeds(vec![Host::new(host.to_owned(), port)])
    }

    /// Connects to a deployment through the given seed list, starting a
    /// monitor for each seed.
    pub fn connect_with_seeds(self, seeds: Vec<Host>) -> Result<Client> {
        let req_id = Arc::new(AtomicIsize::new(0));

        let settings = InstanceSettings {
            connector: self.stream_connector.clone(),
            pool_options: self.pool_options.clone(),
            authenticator: self.authenticator.clone(),
            req_id: req_id.clone(),
            heartbeat_frequency_ms: self.heartbeat_frequency_ms,
        };

        let topology = Topology::new(seeds, self.replica_set_name.clone(), settings)?;

        Ok(Arc::new(ClientInner {
            id: CLIENT_ID_COUNTER.fetch_add(1, Ordering::SeqCst),
            req_id,
            topology,
            listener: Listener::new(),
            read_preference: self.read_preference,
            secondary_eligibility: self.secondary_eligibility,
            index_cache: IndexCache::new(),
        }))
    }
}

pub type Client = Arc<ClientInner>;

pub trait ThreadedClient: Sync + Sized {
    /// Resolves a server matching the read preference and hands out a
    /// connection to it. A thread inside a request instead receives the
    /// request's pinned connection, after validating that the pinned
    /// instance satisfies the read preference and re-checking its
    /// authentication for the database.
    fn acquire_connection(
        &self,
        database: &str,
        read_preference: &ReadPreference,
    ) -> Result<AcquiredConnection>;
    /// Hands out a connection to an exact instance, as a cursor session
    /// pinned to one member requires.
    fn acquire_connection_on(
        &self,
        database: &str,
        instance: &ServerInstance,
    ) -> Result<AcquiredConnection>;
    /// Starts (or nests) a request scope pinning this thread's operations
    /// to one connection. The returned handle ends the scope when dropped.
    fn request_start(&self, database: &str, read_preference: &ReadPreference) -> Result<Request>;
    /// Starts (or nests) a request scope pinned to an exact instance.
    fn request_start_on(&self, database: &str, instance: &ServerInstance) -> Result<Request>;
    /// Ends the current request scope; the pinned connection returns to
    /// its pool once the nesting level reaches zero.
    fn request_done(&self) -> Result<()>;
    /// The request nesting level for the current thread (0 outside a
    /// request).
    fn request_nesting_level(&self) -> usize;
    /// Returns a unique operational request id.
    fn get_req_id(&self) -> i32;
    /// Runs a database command and returns its response document, checking
    /// the `ok` field.
    fn run_command(
        &self,
        database: &str,
        command: Document,
        read_preference: Option<ReadPreference>,
    ) -> Result<Document>;
    /// Creates an index unless the index cache already knows it exists,
    /// recording it in the cache on success.
    fn create_index(
        &self,
        database: &str,
        collection: &str,
        name: &str,
        keys: Document,
    ) -> Result<()>;
    /// Drops a collection, treating "namespace not found" as success, and
    /// invalidates the matching index-cache scope.
    fn drop_collection(&self, database: &str, collection: &str) -> Result<()>;
    /// Drops a database and invalidates the matching index-cache scope.
    fn drop_database(&self, database: &str) -> Result<()>;
    /// Registers a function to run every time a command starts.
    fn add_start_hook(&self, hook: StartHook) -> Result<()>;
    /// Registers a function to run every time a command completes.
    fn add_completion_hook(&self, hook: CompletionHook) -> Result<()>;
    /// Runs all registered start hooks.
    fn run_start_hooks(&self, started: &CommandStarted) -> Result<()>;
    /// Runs all registered completion hooks.
    fn run_completion_hooks(&self, result: &CommandResult) -> Result<()>;
}

fn command_ok(response: &Document) -> bool {
    match response.get("ok") {
        Some(&Bson::I32(v)) => v != 0,
        Some(&Bson::I64(v)) => v != 0,
        Some(&Bson::FloatingPoint(v)) => v != 0.0,
        _ => false,
    }
}

impl ThreadedClient for Client {
    fn acquire_connection(
        &self,
        database: &str,
        read_preference: &ReadPreference,
    ) -> Result<AcquiredConnection> {
        // A thread inside a request wants every operation to take place
        // on the pinned connection.
        if let Some((instance, mut conn)) = request::take_pinned(self.id)? {
            if !instance.matches_read_preference(read_preference) {
                request::return_pinned(self.id, conn);
                return Err(StateError(
                    "The thread is in a request and the pinned instance is not a match \
                     for the supplied read preference."
                        .to_owned(),
                ));
            }

            if let Err(err) = instance.check_authentication(&mut conn, database) {
                request::return_pinned(self.id, conn);
                return Err(err);
            }

            return Ok(AcquiredConnection::pinned(self.id, instance, conn));
        }

        let instance = self.topology.choose_instance(read_preference)?;
        let conn = instance.acquire_connection(database)?;
        Ok(AcquiredConnection::owned(instance, conn))
    }

    fn acquire_connection_on(
        &self,
        database: &str,
        instance: &ServerInstance,
    ) -> Result<AcquiredConnection> {
        if let Some((pinned, mut conn)) = request::take_pinned(self.id)? {
            if &pinned != instance {
                request::return_pinned(self.id, conn);
                return Err(StateError(format!(
                    "Connection requested for server instance '{}' but the thread's \
                     request is pinned to '{}'.",
                    instance.host(),
                    pinned.host()
                )));
            }

            if let Err(err) = pinned.check_authentication(&mut conn, database) {
                request::return_pinned(self.id, conn);
                return Err(err);
            }

            return Ok(AcquiredConnection::pinned(self.id, pinned, conn));
        }

        let conn = instance.acquire_connection(database)?;
        Ok(AcquiredConnection::owned(instance.clone(), conn))
    }

    fn request_start(&self, database: &str, read_preference: &ReadPreference) -> Result<Request> {
        if let Some(instance) = request::active_instance(self.id) {
            if !instance.matches_read_preference(read_preference) {
                return Err(StateError(
                    "A nested request was started and the pinned instance does not \
                     match the nested read preference."
                        .to_owned(),
                ));
            }
            request::nest(self.id);
            return Ok(Request::new(self.clone()));
        }

        let instance = self.topology.choose_instance(read_preference)?;
        let connection = instance.acquire_connection(database)?;
        request::begin(self.id, instance, connection);
        Ok(Request::new(self.clone()))
    }

    fn request_start_on(&self, database: &str, instance: &ServerInstance) -> Result<Request> {
        if let Some(pinned) = request::active_instance(self.id) {
            if &pinned != instance {
                return Err(StateError(
                    "The server instance passed to a nested request does not match \
                     the instance of the current request."
                        .to_owned(),
                ));
            }
            request::nest(self.id);
            return Ok(Request::new(self.clone()));
        }

        let connection = instance.acquire_connection(database)?;
        request::begin(self.id, instance.clone(), connection);
        Ok(Request::new(self.clone()))
    }

    fn request_done(&self) -> Result<()> {
        request::done(self.id)
    }

    fn request_nesting_level(&self) -> usize {
        request::nesting_level(self.id)
    }

    fn get_req_id(&self) -> i32 {
        self.req_id.fetch_add(1, Ordering::SeqCst) as i32
    }

    fn run_command(
        &self,
        database: &str,
        command: Document,
        read_preference: Option<ReadPreference>,
    ) -> Result<Document> {
        let mut cursor: Cursor<Document> =
            Cursor::command(self.clone(), database, command, read_preference);
        let mut enumerator = cursor.iter();

        let response = match enumerator.next() {
            Some(Ok(doc)) => doc,
            Some(Err(err)) => return Err(err),
            None => {
                return Err(Error::ResponseError(
                    "The command returned no response document.".to_owned(),
                ));
            }
        };

        if command_ok(&response) {
            Ok(response)
        } else {
            Err(Error::CommandError(CommandException::from_response(
                response,
            )))
        }
    }

    fn create_index(
        &self,
        database: &str,
        collection: &str,
        name: &str,
        keys: Document,
    ) -> Result<()> {
        if self.index_cache.contains(database, collection, name)? {
            return Ok(());
        }

        let command = doc! {
            "createIndexes": collection,
            "indexes": [{ "key": keys, "name": name }]
        };
        self.run_command(database, command, Some(ReadPreference::primary()))?;

        self.index_cache.add(database, collection, name)
    }

    fn drop_collection(&self, database: &str, collection: &str) -> Result<()> {
        let command = doc! { "drop": collection };
        match self.run_command(database, command, Some(ReadPreference::primary())) {
            Ok(_) => (),
            // A namespace that is already gone counts as dropped.
            Err(Error::CommandError(ref err)) if err.namespace_not_found() => (),
            Err(err) => return Err(err),
        }

        self.index_cache.reset_collection(database, collection)
    }

    fn drop_database(&self, database: &str) -> Result<()> {
        let command = doc! { "dropDatabase": 1 };
        match self.run_command(database, command, Some(ReadPreference::primary())) {
            Ok(_) => (),
            Err(Error::CommandError(ref err)) if err.namespace_not_found() => (),
            Err(err) => return Err(err),
        }

        self.index_cache.reset_database(database)
    }

    fn add_start_hook(&self, hook: StartHook) -> Result<()> {
        self.listener.add_start_hook(hook)
    }

    fn add_completion_hook(&self, hook: CompletionHook) -> Result<()> {
        self.listener.add_completion_hook(hook)
    }

    fn run_start_hooks(&self, started: &CommandStarted) -> Result<()> {
        self.listener.run_start_hooks(self.clone(), started)
    }

    fn run_completion_hooks(&self, result: &CommandResult) -> Result<()> {
        self.listener.run_completion_hooks(self.clone(), result)
    }
}

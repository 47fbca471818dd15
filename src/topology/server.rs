//! A single server endpoint: role, health, and its connection pool.
use crate::common::{ReadMode, ReadPreference};
use crate::connstring::Host;
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PooledConnection};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::thread;

use super::monitor::{IsMasterResult, Monitor};
use super::{InstanceSettings, TopologyDescription};

/// The role a server member currently holds within its deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerRole {
    Primary,
    Secondary,
    Arbiter,
    Passive,
    Unknown,
}

/// What kind of process the endpoint is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceKind {
    /// Standalone server.
    Standalone,
    /// Replica set member.
    ReplicaSetMember,
    /// Shard router.
    ShardRouter,
    /// Not yet determined.
    Unknown,
}

/// Connection health as observed by monitoring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthState {
    Connected,
    Connecting,
    Disconnected,
    Unknown,
}

/// Server information gathered from monitoring. Only the monitor writes
/// these fields; operation code reads them.
#[derive(Clone, Debug)]
pub struct InstanceDescription {
    /// The member's current role.
    pub role: ServerRole,
    /// The kind of process at the endpoint.
    pub kind: InstanceKind,
    /// Connection health.
    pub health: HealthState,
    /// Any error encountered while monitoring this server.
    pub err: Arc<Option<Error>>,
    /// The server's own host information, if it is part of a replica set.
    pub me: Option<Host>,
    /// All voting members of the replica set known by this server.
    pub hosts: Vec<Host>,
    /// All passive members of the replica set known by this server.
    pub passives: Vec<Host>,
    /// All arbiters in the replica set known by this server.
    pub arbiters: Vec<Host>,
    /// Member tags for targeted read operations.
    pub tags: BTreeMap<String, String>,
    /// The replica set name.
    pub set_name: String,
    /// The server's opinion of who the primary is.
    pub primary: Option<Host>,
}

impl InstanceDescription {
    /// Returns a default, unknown instance description.
    pub fn new() -> InstanceDescription {
        InstanceDescription {
            role: ServerRole::Unknown,
            kind: InstanceKind::Unknown,
            health: HealthState::Unknown,
            err: Arc::new(None),
            me: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            tags: BTreeMap::new(),
            set_name: String::new(),
            primary: None,
        }
    }

    // Updates the description using an isMaster server response.
    pub fn update(&mut self, ismaster: IsMasterResult) {
        if !ismaster.ok {
            self.set_err(Error::OperationError(
                "isMaster returned a not-ok response.".to_owned(),
            ));
            return;
        }

        self.me = ismaster.me;
        self.hosts = ismaster.hosts;
        self.passives = ismaster.passives;
        self.arbiters = ismaster.arbiters;
        self.tags = ismaster.tags;
        self.set_name = ismaster.set_name;
        self.primary = ismaster.primary;

        self.kind = if !ismaster.msg.is_empty() {
            InstanceKind::ShardRouter
        } else if !self.set_name.is_empty() {
            InstanceKind::ReplicaSetMember
        } else if ismaster.is_replica_set {
            // A ghost member (e.g. mid initial sync) reveals nothing usable.
            InstanceKind::Unknown
        } else {
            InstanceKind::Standalone
        };

        self.role = if ismaster.arbiter_only {
            ServerRole::Arbiter
        } else if ismaster.is_master {
            // Standalone servers and shard routers also answer as master.
            ServerRole::Primary
        } else if ismaster.passive {
            ServerRole::Passive
        } else if ismaster.is_secondary {
            ServerRole::Secondary
        } else {
            ServerRole::Unknown
        };

        self.health = HealthState::Connected;
        self.err = Arc::new(None);
    }

    // Records a monitoring failure and reverts the instance to unknown.
    pub fn set_err(&mut self, err: Error) {
        self.err = Arc::new(Some(err));
        self.role = ServerRole::Unknown;
        self.kind = InstanceKind::Unknown;
        self.health = HealthState::Disconnected;
        self.set_name = String::new();
    }
}

impl Default for InstanceDescription {
    fn default() -> Self {
        InstanceDescription::new()
    }
}

struct InstanceInner {
    host: Host,
    description: Arc<RwLock<InstanceDescription>>,
    pool: ConnectionPool,
    settings: InstanceSettings,
    monitor: Option<Arc<Monitor>>,
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        if let Some(ref monitor) = self.monitor {
            monitor.running.store(false, Ordering::SeqCst);
            monitor.request_update();
        }
    }
}

/// A cheaply clonable handle to one server instance and its pool.
#[derive(Clone)]
pub struct ServerInstance {
    inner: Arc<InstanceInner>,
}

impl PartialEq for ServerInstance {
    fn eq(&self, other: &ServerInstance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerInstance")
            .field("host", &self.inner.host)
            .finish()
    }
}

impl ServerInstance {
    /// Returns a new instance for the given host, initializing its
    /// connection pool and, unless disabled, a monitor thread.
    pub fn new(
        host: Host,
        settings: InstanceSettings,
        top_description: Arc<RwLock<TopologyDescription>>,
        run_monitor: bool,
    ) -> ServerInstance {
        let description = Arc::new(RwLock::new(InstanceDescription::new()));
        let pool = ConnectionPool::with_options(
            host.clone(),
            settings.connector.clone(),
            settings.pool_options.clone(),
        );

        let monitor = if run_monitor {
            let monitor = Arc::new(Monitor::new(
                host.clone(),
                pool.clone(),
                &settings,
                top_description,
                description.clone(),
            ));

            let monitor_clone = monitor.clone();
            thread::spawn(move || {
                monitor_clone.run();
            });

            Some(monitor)
        } else {
            None
        };

        ServerInstance {
            inner: Arc::new(InstanceInner {
                host,
                description,
                pool,
                settings,
                monitor,
            }),
        }
    }

    /// The address of this instance.
    pub fn host(&self) -> &Host {
        &self.inner.host
    }

    /// A snapshot of the monitored description.
    pub fn description(&self) -> InstanceDescription {
        match self.inner.description.read() {
            Ok(description) => description.clone(),
            Err(_) => InstanceDescription::new(),
        }
    }

    /// The shared description cell, for code that updates it directly.
    pub fn description_cell(&self) -> Arc<RwLock<InstanceDescription>> {
        self.inner.description.clone()
    }

    pub fn kind(&self) -> InstanceKind {
        self.description().kind
    }

    pub fn health(&self) -> HealthState {
        self.description().health
    }

    pub fn is_primary(&self) -> bool {
        self.description().role == ServerRole::Primary
    }

    pub fn is_secondary(&self) -> bool {
        self.description().role == ServerRole::Secondary
    }

    pub fn is_arbiter(&self) -> bool {
        self.description().role == ServerRole::Arbiter
    }

    pub fn is_passive(&self) -> bool {
        self.description().role == ServerRole::Passive
    }

    /// Reports whether this instance is an acceptable target for the given
    /// read preference. Standalone servers and shard routers satisfy every
    /// preference; replica set members are matched on role and tags.
    pub fn matches_read_preference(&self, read_preference: &ReadPreference) -> bool {
        let description = self.description();

        match description.kind {
            InstanceKind::Standalone | InstanceKind::ShardRouter => return true,
            _ => (),
        }

        let is_primary = description.role == ServerRole::Primary;
        // Passives are priority-zero secondaries for selection purposes.
        let is_secondary =
            description.role == ServerRole::Secondary || description.role == ServerRole::Passive;
        let tags_match = read_preference.matches_tags(&description.tags);

        match read_preference.mode {
            ReadMode::Primary => is_primary,
            ReadMode::PrimaryPreferred => is_primary || (is_secondary && tags_match),
            ReadMode::Secondary => is_secondary && tags_match,
            ReadMode::SecondaryPreferred => (is_secondary && tags_match) || is_primary,
            ReadMode::Nearest => (is_primary || is_secondary) && tags_match,
        }
    }

    /// Acquires a connection from this instance's pool, establishing
    /// authentication for the target database if needed. On authentication
    /// failure the connection goes back to the pool and is not handed out.
    pub fn acquire_connection(&self, database: &str) -> Result<PooledConnection> {
        let mut conn = self.inner.pool.acquire()?;
        self.check_authentication(&mut conn, database)?;
        Ok(conn)
    }

    /// Re-checks authentication on an already-acquired connection, e.g. one
    /// pinned by a request before being reused for another database.
    pub fn check_authentication(&self, conn: &mut PooledConnection, database: &str) -> Result<()> {
        conn.ensure_authenticated(database, self.inner.settings.authenticator.as_ref())
    }

    /// Asks the monitor to refresh this instance immediately instead of
    /// waiting for the next heartbeat.
    pub fn request_update(&self) {
        if let Some(ref monitor) = self.inner.monitor {
            monitor.request_update();
        }
    }
}

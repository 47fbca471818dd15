//! Server discovery and monitoring using isMaster results.
use crate::connstring::{self, Host};
use crate::error::Error::{self, ArgumentError, ResponseError};
use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::wire_protocol::flags::OpQueryFlags;
use crate::wire_protocol::operations::Message;

use bson::{bson, doc, Bson, Document};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use super::server::{HealthState, InstanceDescription, InstanceKind};
use super::{InstanceSettings, TopologyDescription};

/// The result of an isMaster operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IsMasterResult {
    pub ok: bool,
    pub is_master: bool,

    /// Shard-specific. mongos instances add this field to the isMaster
    /// reply, and it will contain the value "isdbgrid".
    pub msg: String,

    // Replica set specific
    pub is_replica_set: bool,
    pub is_secondary: bool,
    pub arbiter_only: bool,
    pub passive: bool,
    pub hidden: bool,
    pub me: Option<Host>,
    pub hosts: Vec<Host>,
    pub passives: Vec<Host>,
    pub arbiters: Vec<Host>,
    pub tags: BTreeMap<String, String>,
    pub set_name: String,
    pub primary: Option<Host>,
}

impl IsMasterResult {
    /// Parses an isMaster response document from the server.
    pub fn new(doc: Document) -> Result<IsMasterResult> {
        let ok = match doc.get("ok") {
            Some(&Bson::I32(v)) => v != 0,
            Some(&Bson::I64(v)) => v != 0,
            Some(&Bson::FloatingPoint(v)) => v != 0.0,
            _ => return Err(ArgumentError("result does not contain `ok`.".to_owned())),
        };

        let mut result = IsMasterResult {
            ok,
            is_master: false,
            msg: String::new(),
            is_replica_set: false,
            is_secondary: false,
            arbiter_only: false,
            passive: false,
            hidden: false,
            me: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            tags: BTreeMap::new(),
            set_name: String::new(),
            primary: None,
        };

        if let Some(&Bson::Boolean(b)) = doc.get("ismaster") {
            result.is_master = b;
        }

        if let Some(&Bson::String(ref s)) = doc.get("msg") {
            result.msg = s.to_owned();
        }

        if let Some(&Bson::Boolean(b)) = doc.get("secondary") {
            result.is_secondary = b;
        }

        if let Some(&Bson::Boolean(b)) = doc.get("isreplicaset") {
            result.is_replica_set = b;
        }

        if let Some(&Bson::String(ref s)) = doc.get("setName") {
            result.set_name = s.to_owned();
        }

        if let Some(&Bson::String(ref s)) = doc.get("me") {
            result.me = Some(connstring::parse_host(s)?);
        }

        if let Some(&Bson::Array(ref arr)) = doc.get("hosts") {
            result.hosts = arr
                .iter()
                .filter_map(|bson| match *bson {
                    Bson::String(ref s) => connstring::parse_host(s).ok(),
                    _ => None,
                })
                .collect();
        }

        if let Some(&Bson::Array(ref arr)) = doc.get("passives") {
            result.passives = arr
                .iter()
                .filter_map(|bson| match *bson {
                    Bson::String(ref s) => connstring::parse_host(s).ok(),
                    _ => None,
                })
                .collect();
        }

        if let Some(&Bson::Array(ref arr)) = doc.get("arbiters") {
            result.arbiters = arr
                .iter()
                .filter_map(|bson| match *bson {
                    Bson::String(ref s) => connstring::parse_host(s).ok(),
                    _ => None,
                })
                .collect();
        }

        if let Some(&Bson::String(ref s)) = doc.get("primary") {
            result.primary = Some(connstring::parse_host(s)?);
        }

        if let Some(&Bson::Boolean(b)) = doc.get("arbiterOnly") {
            result.arbiter_only = b;
        }

        if let Some(&Bson::Boolean(b)) = doc.get("passive") {
            result.passive = b;
        }

        if let Some(&Bson::Boolean(b)) = doc.get("hidden") {
            result.hidden = b;
        }

        if let Some(&Bson::Document(ref tags)) = doc.get("tags") {
            for (k, v) in tags.iter() {
                if let Bson::String(ref tag) = *v {
                    result.tags.insert(k.to_owned(), tag.to_owned());
                }
            }
        }

        Ok(result)
    }
}

/// Monitors and updates server and topology information. The monitor is
/// the sole writer of its instance's role and health state.
pub struct Monitor {
    // Host being monitored.
    host: Host,
    // Connection pool for the host, cleared when the server is unreachable.
    server_pool: ConnectionPool,
    // Owned, single-connection pool for isMaster traffic.
    personal_pool: ConnectionPool,
    // Topology description to update.
    top_description: Arc<RwLock<TopologyDescription>>,
    // Server description to update.
    server_description: Arc<RwLock<InstanceDescription>>,
    // Shared request id counter.
    req_id: Arc<AtomicIsize>,
    // Owned copy of the topology's heartbeat frequency.
    heartbeat_frequency_ms: AtomicUsize,
    // Used for condvar functionality.
    dummy_lock: Mutex<()>,
    // To allow servers to request an immediate update, this
    // condvar can be notified to wake up the monitor.
    condvar: Condvar,
    /// While true, the monitor will check server connection health
    /// at the topology's heartbeat frequency rate.
    pub running: Arc<AtomicBool>,
}

impl Monitor {
    /// Returns a new monitor for the given host.
    pub fn new(
        host: Host,
        server_pool: ConnectionPool,
        settings: &InstanceSettings,
        top_description: Arc<RwLock<TopologyDescription>>,
        server_description: Arc<RwLock<InstanceDescription>>,
    ) -> Monitor {
        let personal_pool = ConnectionPool::with_options(
            host.clone(),
            settings.connector.clone(),
            settings.pool_options.single_connection(),
        );

        Monitor {
            host,
            server_pool,
            personal_pool,
            top_description,
            server_description,
            req_id: settings.req_id.clone(),
            heartbeat_frequency_ms: AtomicUsize::new(settings.heartbeat_frequency_ms as usize),
            dummy_lock: Mutex::new(()),
            condvar: Condvar::new(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wakes the monitor for an immediate re-check instead of waiting out
    /// the heartbeat.
    pub fn request_update(&self) {
        self.condvar.notify_one();
    }

    /// Runs isMaster over the monitor's owned connection and returns the
    /// response document.
    fn is_master(&self) -> Result<Document> {
        let mut conn = self.personal_pool.acquire()?;
        let req_id = self.req_id.fetch_add(1, Ordering::SeqCst) as i32;

        let message = Message::new_query(
            req_id,
            OpQueryFlags::empty(),
            String::from("local.$cmd"),
            0,
            -1,
            doc! { "isMaster": 1 },
            None,
        )?;

        let socket = conn.get_socket();
        message.write(socket)?;
        let reply = Message::read(socket)?;

        match reply {
            Message::OpReply { mut documents, .. } => {
                if documents.is_empty() {
                    Err(ResponseError("isMaster returned no response.".to_owned()))
                } else {
                    Ok(documents.remove(0))
                }
            }
            _ => Err(ResponseError(
                "isMaster returned an invalid reply.".to_owned(),
            )),
        }
    }

    // Records a monitoring failure on the server description and
    // propagates the change to the topology.
    fn set_err(&self, err: Error) {
        let description = {
            let mut server_description = match self.server_description.write() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            server_description.set_err(err);
            server_description.clone()
            // The description lock must be released before the topology
            // lock is taken; other monitors acquire them in that order.
        };

        self.update_top_description(description);
    }

    // Updates server and topology descriptions from an isMaster reply.
    fn update_with_reply(&self, doc: Document) {
        let description = {
            let mut server_description = match self.server_description.write() {
                Ok(guard) => guard,
                Err(_) => return,
            };

            match IsMasterResult::new(doc) {
                Ok(ismaster) => server_description.update(ismaster),
                Err(err) => server_description.set_err(err),
            }

            server_description.clone()
        };

        self.update_top_description(description);
    }

    // Propagates an updated server description to the topology.
    fn update_top_description(&self, description: InstanceDescription) {
        if let Ok(mut top_description) = self.top_description.write() {
            let top_arc = self.top_description.clone();
            top_description.update(self.host.clone(), description, top_arc);
        }
    }

    /// Execute isMaster and update the server and topology.
    fn execute_update(&self) {
        match self.is_master() {
            Ok(doc) => self.update_with_reply(doc),
            Err(err) => {
                // Refresh all connections
                self.server_pool.clear();
                self.personal_pool.clear();

                let kind = self
                    .server_description
                    .read()
                    .map(|description| description.kind)
                    .unwrap_or(InstanceKind::Unknown);

                if kind == InstanceKind::Unknown {
                    self.set_err(err);
                } else {
                    // Retry once
                    match self.is_master() {
                        Ok(doc) => self.update_with_reply(doc),
                        Err(err) => self.set_err(err),
                    }
                }
            }
        }
    }

    /// Starts server monitoring.
    pub fn run(&self) {
        if self.running.load(Ordering::SeqCst) {
            return;
        }

        self.running.store(true, Ordering::SeqCst);

        if let Ok(mut description) = self.server_description.write() {
            description.health = HealthState::Connecting;
        }

        let mut guard = match self.dummy_lock.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            self.execute_update();

            if let Ok(description) = self.top_description.read() {
                self.heartbeat_frequency_ms
                    .store(description.heartbeat_frequency_ms as usize, Ordering::SeqCst);
            }

            let frequency = self.heartbeat_frequency_ms.load(Ordering::SeqCst) as u64;
            match self
                .condvar
                .wait_timeout(guard, Duration::from_millis(frequency))
            {
                Ok((new_guard, _)) => guard = new_guard,
                Err(_) => break,
            }
        }
    }
}

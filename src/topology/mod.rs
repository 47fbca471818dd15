//! Deployment topology tracking and read-preference server selection.
pub mod monitor;
pub mod server;

use crate::auth::Authenticator;
use crate::common::{ReadMode, ReadPreference};
use crate::connstring::Host;
use crate::error::Error::{ArgumentError, OperationError};
use crate::error::Result;
use crate::pool::PoolOptions;
use crate::stream::StreamConnector;

use rand::{thread_rng, Rng};

use std::collections::HashMap;
use std::sync::atomic::AtomicIsize;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use self::server::{InstanceDescription, InstanceKind, ServerInstance, ServerRole};

pub const DEFAULT_HEARTBEAT_FREQUENCY_MS: u32 = 10_000;
const MAX_SERVER_RETRY: usize = 3;

/// Everything a newly-discovered server instance needs to start working:
/// how to reach it, how its pool is sized, how to authenticate on it, and
/// the shared request-id counter.
#[derive(Clone)]
pub struct InstanceSettings {
    pub connector: StreamConnector,
    pub pool_options: PoolOptions,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub req_id: Arc<AtomicIsize>,
    pub heartbeat_frequency_ms: u32,
}

impl InstanceSettings {
    pub fn new() -> InstanceSettings {
        InstanceSettings {
            connector: StreamConnector::default(),
            pool_options: PoolOptions::default(),
            authenticator: None,
            req_id: Arc::new(AtomicIsize::new(0)),
            heartbeat_frequency_ms: DEFAULT_HEARTBEAT_FREQUENCY_MS,
        }
    }
}

impl Default for InstanceSettings {
    fn default() -> Self {
        InstanceSettings::new()
    }
}

/// Describes the type of topology for a server set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyType {
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    Unknown,
}

/// Topology information gathered from server set monitoring.
#[derive(Clone)]
pub struct TopologyDescription {
    pub topology_type: TopologyType,
    /// The set name for a replica set topology. If the topology
    /// is not a replica set, this will be an empty string.
    pub set_name: String,
    /// The server connection health check frequency.
    pub heartbeat_frequency_ms: u32,
    /// Known servers within the topology.
    pub servers: HashMap<Host, ServerInstance>,
    // Construction context handed to newly discovered members.
    settings: InstanceSettings,
}

/// Holds status and connection information about a server set.
#[derive(Clone)]
pub struct Topology {
    /// Monitored topology information.
    pub description: Arc<RwLock<TopologyDescription>>,
}

impl TopologyDescription {
    /// Returns a default, unknown topology description.
    pub fn new(settings: InstanceSettings) -> TopologyDescription {
        TopologyDescription {
            topology_type: TopologyType::Unknown,
            set_name: String::new(),
            heartbeat_frequency_ms: settings.heartbeat_frequency_ms,
            servers: HashMap::new(),
            settings,
        }
    }

    fn rand_instance(candidates: &[ServerInstance]) -> Option<ServerInstance> {
        if candidates.is_empty() {
            return None;
        }
        let index = thread_rng().gen_range(0, candidates.len());
        Some(candidates[index].clone())
    }

    /// Chooses a server instance matching the read preference.
    pub fn choose_instance(&self, read_preference: &ReadPreference) -> Result<ServerInstance> {
        if self.servers.is_empty() {
            return Err(OperationError(
                "No servers are available for the given topology.".to_owned(),
            ));
        }

        match self.topology_type {
            TopologyType::Unknown => {
                Err(OperationError("Topology is not yet known.".to_owned()))
            }
            TopologyType::Single => match self.servers.values().next() {
                Some(server) => Ok(server.clone()),
                None => Err(OperationError(
                    "No servers are available for the given topology.".to_owned(),
                )),
            },
            TopologyType::Sharded => {
                let routers: Vec<ServerInstance> = self
                    .servers
                    .values()
                    .filter(|server| server.kind() == InstanceKind::ShardRouter)
                    .cloned()
                    .collect();

                TopologyDescription::rand_instance(&routers).ok_or_else(|| {
                    OperationError("No shard routers are currently known.".to_owned())
                })
            }
            _ => {
                // Replica set server selection
                let mut primaries = Vec::new();
                let mut secondaries = Vec::new();

                for server in self.servers.values() {
                    let description = server.description();
                    if description.kind != InstanceKind::ReplicaSetMember {
                        continue;
                    }
                    match description.role {
                        ServerRole::Primary => primaries.push(server.clone()),
                        // Passives are selectable secondaries.
                        ServerRole::Secondary | ServerRole::Passive => {
                            if read_preference.matches_tags(&description.tags) {
                                secondaries.push(server.clone());
                            }
                        }
                        _ => (),
                    }
                }

                let chosen = match read_preference.mode {
                    ReadMode::Primary => TopologyDescription::rand_instance(&primaries),
                    ReadMode::PrimaryPreferred => TopologyDescription::rand_instance(&primaries)
                        .or_else(|| TopologyDescription::rand_instance(&secondaries)),
                    ReadMode::Secondary => TopologyDescription::rand_instance(&secondaries),
                    ReadMode::SecondaryPreferred => {
                        TopologyDescription::rand_instance(&secondaries)
                            .or_else(|| TopologyDescription::rand_instance(&primaries))
                    }
                    ReadMode::Nearest => {
                        let mut eligible = primaries;
                        eligible.extend(secondaries);
                        TopologyDescription::rand_instance(&eligible)
                    }
                };

                chosen.ok_or_else(|| {
                    OperationError(
                        "No servers available for the provided ReadPreference.".to_owned(),
                    )
                })
            }
        }
    }

    /// Updates the topology description based on an updated server
    /// description, spawning monitors for any newly discovered members.
    pub fn update(
        &mut self,
        host: Host,
        description: InstanceDescription,
        top_arc: Arc<RwLock<TopologyDescription>>,
    ) {
        self.update_private(host, description, top_arc, true);
    }

    /// Same as `update`, but newly discovered members are not monitored.
    pub fn update_without_monitor(
        &mut self,
        host: Host,
        description: InstanceDescription,
        top_arc: Arc<RwLock<TopologyDescription>>,
    ) {
        self.update_private(host, description, top_arc, false);
    }

    fn update_private(
        &mut self,
        host: Host,
        description: InstanceDescription,
        top_arc: Arc<RwLock<TopologyDescription>>,
        run_monitor: bool,
    ) {
        let kind = description.kind;
        let is_primary = description.role == ServerRole::Primary;

        match self.topology_type {
            TopologyType::Unknown => match kind {
                InstanceKind::Standalone => self.update_unknown_with_standalone(host),
                InstanceKind::ShardRouter => self.topology_type = TopologyType::Sharded,
                InstanceKind::ReplicaSetMember => {
                    if is_primary {
                        self.update_rs_from_primary(host, description, top_arc, run_monitor);
                    } else {
                        self.update_rs_without_primary(host, description, top_arc, run_monitor);
                    }
                }
                InstanceKind::Unknown => (),
            },
            TopologyType::ReplicaSetNoPrimary => match kind {
                InstanceKind::Standalone | InstanceKind::ShardRouter => {
                    self.servers.remove(&host);
                    self.check_if_has_primary();
                }
                InstanceKind::ReplicaSetMember => {
                    if is_primary {
                        self.update_rs_from_primary(host, description, top_arc, run_monitor);
                    } else {
                        self.update_rs_without_primary(host, description, top_arc, run_monitor);
                    }
                }
                InstanceKind::Unknown => self.check_if_has_primary(),
            },
            TopologyType::ReplicaSetWithPrimary => match kind {
                InstanceKind::Standalone | InstanceKind::ShardRouter => {
                    self.servers.remove(&host);
                    self.check_if_has_primary();
                }
                InstanceKind::ReplicaSetMember => {
                    if is_primary {
                        self.update_rs_from_primary(host, description, top_arc, run_monitor);
                    } else {
                        self.update_rs_with_primary_from_member(host, description);
                    }
                }
                InstanceKind::Unknown => self.check_if_has_primary(),
            },
            TopologyType::Sharded => match kind {
                InstanceKind::Unknown | InstanceKind::ShardRouter => (),
                _ => {
                    self.servers.remove(&host);
                }
            },
            TopologyType::Single => (),
        }
    }

    // Sets the correct replica set topology type.
    fn check_if_has_primary(&mut self) {
        for server in self.servers.values() {
            let description = server.description();
            if description.kind == InstanceKind::ReplicaSetMember
                && description.role == ServerRole::Primary
            {
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                return;
            }
        }
        self.topology_type = TopologyType::ReplicaSetNoPrimary;
    }

    // Updates an unknown topology with a new standalone server description.
    fn update_unknown_with_standalone(&mut self, host: Host) {
        if !self.servers.contains_key(&host) {
            return;
        }

        if self.servers.len() == 1 {
            self.topology_type = TopologyType::Single;
        } else {
            self.servers.remove(&host);
        }
    }

    // Updates a replica set topology with a new primary server description.
    fn update_rs_from_primary(
        &mut self,
        host: Host,
        description: InstanceDescription,
        top_arc: Arc<RwLock<TopologyDescription>>,
        run_monitor: bool,
    ) {
        if !self.servers.contains_key(&host) {
            return;
        }

        if self.set_name.is_empty() {
            self.set_name = description.set_name.to_owned();
        } else if self.set_name != description.set_name {
            // Primary found, but it doesn't have the setName
            // provided by the user or previously discovered.
            self.servers.remove(&host);
            self.check_if_has_primary();
            return;
        }

        // Invalidate any old primaries
        for (top_host, server) in self.servers.iter() {
            if *top_host != host {
                if let Ok(mut server_description) = server.description_cell().write() {
                    if server_description.role == ServerRole::Primary {
                        server_description.role = ServerRole::Unknown;
                        server_description.set_name = String::new();
                    }
                }
            }
        }

        self.add_missing_hosts(&description, top_arc, run_monitor);

        // Remove hosts that are not reported by the primary.
        let mut hosts_to_remove = Vec::new();
        for host in self.servers.keys() {
            if !description.hosts.contains(host)
                && !description.passives.contains(host)
                && !description.arbiters.contains(host)
            {
                hosts_to_remove.push(host.clone());
            }
        }

        for host in hosts_to_remove {
            self.servers.remove(&host);
        }

        self.check_if_has_primary();
    }

    // Updates a replica set topology with a missing primary.
    fn update_rs_without_primary(
        &mut self,
        host: Host,
        description: InstanceDescription,
        top_arc: Arc<RwLock<TopologyDescription>>,
        run_monitor: bool,
    ) {
        self.topology_type = TopologyType::ReplicaSetNoPrimary;
        if !self.servers.contains_key(&host) {
            return;
        }

        if self.set_name.is_empty() {
            self.set_name = description.set_name.to_owned();
        } else if self.set_name != description.set_name {
            self.servers.remove(&host);
            self.check_if_has_primary();
            return;
        }

        self.add_missing_hosts(&description, top_arc, run_monitor);

        if let Some(me) = description.me {
            if host != me {
                self.servers.remove(&host);
                self.check_if_has_primary();
            }
        }
    }

    // Updates a replica set topology with an updated member description.
    fn update_rs_with_primary_from_member(&mut self, host: Host, description: InstanceDescription) {
        if !self.servers.contains_key(&host) {
            return;
        }

        if self.set_name != description.set_name {
            self.servers.remove(&host);
            return;
        }

        if let Some(me) = description.me {
            if host != me {
                self.servers.remove(&host);
            }
        }

        self.check_if_has_primary();
    }

    // Begins tracking hosts that are not yet part of the topology.
    fn add_missing_hosts(
        &mut self,
        description: &InstanceDescription,
        top_arc: Arc<RwLock<TopologyDescription>>,
        run_monitor: bool,
    ) {
        let reported = description
            .hosts
            .iter()
            .chain(description.passives.iter())
            .chain(description.arbiters.iter());

        for host in reported {
            if !self.servers.contains_key(host) {
                let server = ServerInstance::new(
                    host.clone(),
                    self.settings.clone(),
                    top_arc.clone(),
                    run_monitor,
                );
                self.servers.insert(host.clone(), server);
            }
        }
    }
}

impl Topology {
    /// Returns a new topology seeded with the given hosts, spawning a
    /// monitor for each.
    pub fn new(
        seeds: Vec<Host>,
        replica_set_name: Option<String>,
        settings: InstanceSettings,
    ) -> Result<Topology> {
        if seeds.is_empty() {
            return Err(ArgumentError(
                "At least one seed host is required.".to_owned(),
            ));
        }

        let mut description = TopologyDescription::new(settings.clone());

        if let Some(name) = replica_set_name {
            description.set_name = name;
            description.topology_type = TopologyType::ReplicaSetNoPrimary;
        }

        let top_description = Arc::new(RwLock::new(description));

        {
            let mut top = top_description.write()?;
            for host in seeds {
                if !top.servers.contains_key(&host) {
                    let server = ServerInstance::new(
                        host.clone(),
                        settings.clone(),
                        top_description.clone(),
                        true,
                    );
                    top.servers.insert(host, server);
                }
            }
        }

        Ok(Topology {
            description: top_description,
        })
    }

    /// Chooses a server instance matching the read preference, retrying
    /// briefly while discovery settles.
    pub fn choose_instance(&self, read_preference: &ReadPreference) -> Result<ServerInstance> {
        let mut retry = 0;
        loop {
            let result = {
                let description = self.description.read()?;
                description.choose_instance(read_preference)
            };

            match result {
                Ok(instance) => return Ok(instance),
                Err(err) => {
                    if retry == MAX_SERVER_RETRY {
                        return Err(err);
                    }
                    thread::sleep(Duration::from_millis(500));
                }
            }
            retry += 1;
        }
    }
}

//! Node registry, heartbeats, and decommission-driven relocation.

use crate::kvs::Kvs;
use futures::future::join_all;
use geds_proto::rpc;
use geds_proto::rpc::node_service_client::NodeServiceClient;
use geds_util::concurrent::ConcurrentMap;
use geds_util::{Error, Result, CACHE_BLOCK_MARKER};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tonic::transport::Channel;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Registered,
    Decommissioning,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub storage_allocated: u64,
    pub storage_used: u64,
    pub memory_allocated: u64,
    pub memory_used: u64,
}

impl HeartbeatStats {
    pub fn storage_available(&self) -> u64 {
        self.storage_allocated.saturating_sub(self.storage_used)
    }

    pub fn memory_available(&self) -> u64 {
        self.memory_allocated.saturating_sub(self.memory_used)
    }
}

pub struct NodeInformation {
    pub identifier: String,
    pub host: String,
    pub port: u16,
    state: RwLock<NodeState>,
    heartbeat: RwLock<(HeartbeatStats, Option<SystemTime>)>,
    // Back-channel to the node's control service, dialed on first use.
    client: tokio::sync::Mutex<Option<NodeServiceClient<Channel>>>,
}

impl NodeInformation {
    pub fn new(identifier: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            identifier: identifier.into(),
            host: host.into(),
            port,
            state: RwLock::new(NodeState::Registered),
            heartbeat: RwLock::new((HeartbeatStats::default(), None)),
            client: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn set_state(&self, state: NodeState) {
        *self.state.write() = state;
    }

    pub fn update_heartbeat(&self, stats: HeartbeatStats) {
        *self.heartbeat.write() = (stats, Some(SystemTime::now()));
    }

    pub fn last_heartbeat(&self) -> (HeartbeatStats, Option<SystemTime>) {
        *self.heartbeat.read()
    }

    async fn connect(&self) -> Result<NodeServiceClient<Channel>> {
        let mut client = self.client.lock().await;
        if let Some(client) = client.as_ref() {
            return Ok(client.clone());
        }
        let address = format!("http://{}:{}", self.host, self.port);
        // Download dispatches move whole objects; no per-call deadline.
        let channel = Channel::from_shared(address.clone())
            .map_err(|err| Error::InvalidArgument(err.to_string()))?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await
            .map_err(|err| {
                Error::Unavailable(format!("could not connect to {address}: {err}"))
            })?;
        let connected = NodeServiceClient::new(channel);
        *client = Some(connected.clone());
        Ok(connected)
    }

    /// Ask the node to pull `objects` from their current locations and
    /// republish them.
    pub async fn download_objects(&self, objects: Vec<rpc::ObjectId>) -> Result<()> {
        let mut client = self.connect().await?;
        let response = client
            .download_objects(rpc::MultiObjectId { objects })
            .await
            .map_err(|status| {
                Error::Unavailable(format!(
                    "unable to dispatch download to {}: {status}",
                    self.identifier
                ))
            })?;
        response.into_inner().into_result()
    }
}

/// An object that must move off a decommissioning node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelocatableObject {
    pub bucket: String,
    pub key: String,
    pub size: u64,
}

pub struct RelocationPlan {
    /// Objects per target, indexed like the `available` input.
    pub assignments: Vec<Vec<RelocatableObject>>,
    pub unplaced: Vec<RelocatableObject>,
}

/// First-fit-descending packing: objects sorted by size descending, targets
/// by available capacity descending, each object placed on the first target
/// whose assigned total stays within its capacity.
pub fn plan_relocation(mut objects: Vec<RelocatableObject>, available: &[u64]) -> RelocationPlan {
    objects.sort_by(|a, b| b.size.cmp(&a.size));

    let mut order: Vec<usize> = (0..available.len()).collect();
    order.sort_by(|&a, &b| available[b].cmp(&available[a]));

    let mut assignments: Vec<Vec<RelocatableObject>> = vec![Vec::new(); available.len()];
    let mut assigned: Vec<u64> = vec![0; available.len()];
    let mut unplaced = Vec::new();

    for obj in objects {
        let target = order
            .iter()
            .copied()
            .find(|&i| assigned[i] + obj.size <= available[i]);
        match target {
            Some(i) => {
                assigned[i] += obj.size;
                assignments[i].push(obj);
            }
            None => unplaced.push(obj),
        }
    }
    RelocationPlan {
        assignments,
        unplaced,
    }
}

#[derive(Default)]
pub struct Nodes {
    nodes: ConcurrentMap<String, Arc<NodeInformation>>,
    // Serializes concurrent decommission requests.
    decommissioning: tokio::sync::Mutex<()>,
}

impl Nodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. A record in `Decommissioning` state is replaced;
    /// an active registration is AlreadyExists.
    pub fn register(&self, identifier: &str, host: &str, port: u16) -> Result<()> {
        let node = Arc::new(NodeInformation::new(identifier, host, port));
        let existing = self.nodes.insert_or_exists(identifier.to_string(), node.clone());
        if !Arc::ptr_eq(&existing, &node) {
            if existing.state() != NodeState::Decommissioning {
                return Err(Error::AlreadyExists(format!(
                    "node {identifier} was already registered"
                )));
            }
            self.nodes.insert_or_replace(identifier.to_string(), node);
        }
        Ok(())
    }

    pub fn unregister(&self, identifier: &str) -> Result<()> {
        if self.nodes.remove(&identifier.to_string()) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("node {identifier} not found")))
        }
    }

    pub fn heartbeat(&self, identifier: &str, stats: HeartbeatStats) -> Result<()> {
        let node = self
            .nodes
            .get(&identifier.to_string())
            .ok_or_else(|| Error::NotFound(format!("node {identifier} not found")))?;
        node.update_heartbeat(stats);
        Ok(())
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<NodeInformation>> {
        self.nodes.get(&identifier.to_string())
    }

    pub fn list(&self) -> Vec<Arc<NodeInformation>> {
        let mut result = Vec::new();
        self.nodes.forall(|_, node| result.push(node.clone()));
        result.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        result
    }

    /// Drain the named nodes: mark them decommissioning, plan where their
    /// objects go, and dispatch batched downloads to the chosen targets.
    /// Serialized globally; a concurrent call observes Unavailable.
    pub async fn decommission(&self, identifiers: &[String], kvs: &Kvs) -> Result<()> {
        let _guard = self
            .decommissioning
            .try_lock()
            .map_err(|_| Error::Unavailable("already decommissioning".to_string()))?;

        for identifier in identifiers {
            match self.nodes.get(identifier) {
                Some(node) => node.set_state(NodeState::Decommissioning),
                None => {
                    tracing::error!(identifier, "cannot decommission unknown node");
                }
            }
        }

        let location_prefixes: Vec<String> = identifiers
            .iter()
            .map(|id| format!("geds://{id}"))
            .collect();

        // Everything hosted on a drained node, cache blocks excluded.
        let mut objects = Vec::new();
        for bucket_name in kvs.list_buckets() {
            let Ok(bucket) = kvs.get_bucket(&bucket_name) else {
                continue;
            };
            bucket.forall(|path, info| {
                if path.starts_with(CACHE_BLOCK_MARKER) {
                    return;
                }
                if location_prefixes
                    .iter()
                    .any(|p| info.location.starts_with(p.as_str()))
                {
                    objects.push(RelocatableObject {
                        bucket: bucket_name.clone(),
                        key: path.name.clone(),
                        size: info.size,
                    });
                }
            });
        }

        let targets: Vec<Arc<NodeInformation>> = self
            .list()
            .into_iter()
            .filter(|node| node.state() == NodeState::Registered)
            .collect();
        if targets.is_empty() {
            return Err(Error::Unavailable("no target nodes available".to_string()));
        }
        let available: Vec<u64> = targets
            .iter()
            .map(|node| node.last_heartbeat().0.storage_available())
            .collect();

        let plan = plan_relocation(objects, &available);
        for obj in &plan.unplaced {
            tracing::error!(
                bucket = %obj.bucket,
                key = %obj.key,
                size = obj.size,
                "unable to relocate object, no target has room"
            );
        }

        let dispatches = targets
            .iter()
            .zip(plan.assignments)
            .filter(|(_, objects)| !objects.is_empty())
            .map(|(node, objects)| {
                let node = node.clone();
                let ids = objects
                    .into_iter()
                    .map(|obj| rpc::ObjectId {
                        bucket: obj.bucket,
                        key: obj.key,
                    })
                    .collect();
                async move {
                    if let Err(err) = node.download_objects(ids).await {
                        tracing::error!(
                            node = %node.identifier,
                            %err,
                            "unable to relocate objects to node"
                        );
                    }
                }
            });
        join_all(dispatches).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1 << 30;

    fn obj(key: &str, size: u64) -> RelocatableObject {
        RelocatableObject {
            bucket: "geds-test".to_string(),
            key: key.to_string(),
            size,
        }
    }

    #[test]
    fn first_fit_descending_packs_largest_first() {
        // O1..O5 with sizes 3,3,2,2,1 GiB onto two 5 GiB targets: both fill
        // to exactly 5 GiB and the 1 GiB object has no home.
        let objects = vec![
            obj("o1", 3 * GIB),
            obj("o2", 3 * GIB),
            obj("o3", 2 * GIB),
            obj("o4", 2 * GIB),
            obj("o5", GIB),
        ];
        let plan = plan_relocation(objects, &[5 * GIB, 5 * GIB]);

        let keys = |i: usize| {
            plan.assignments[i]
                .iter()
                .map(|o| o.key.as_str())
                .collect::<Vec<_>>()
        };
        assert_eq!(keys(0), vec!["o1", "o3"]);
        assert_eq!(keys(1), vec!["o2", "o4"]);
        assert_eq!(
            plan.unplaced.iter().map(|o| o.key.as_str()).collect::<Vec<_>>(),
            vec!["o5"]
        );
    }

    #[test]
    fn prefers_roomier_targets() {
        let plan = plan_relocation(vec![obj("a", 4), obj("b", 2)], &[2, 8]);
        assert!(plan.assignments[0].is_empty());
        assert_eq!(plan.assignments[1].len(), 2);
        assert!(plan.unplaced.is_empty());
    }

    #[test]
    fn everything_unplaced_without_capacity() {
        let plan = plan_relocation(vec![obj("a", 4)], &[1, 2]);
        assert_eq!(plan.unplaced.len(), 1);
    }

    #[test]
    fn register_and_reregister() {
        let nodes = Nodes::new();
        nodes.register("n1", "10.0.0.1", 4381).unwrap();
        assert!(matches!(
            nodes.register("n1", "10.0.0.1", 4381),
            Err(Error::AlreadyExists(_))
        ));

        // A decommissioned record may be replaced.
        nodes.get("n1").unwrap().set_state(NodeState::Decommissioning);
        nodes.register("n1", "10.0.0.2", 4381).unwrap();
        assert_eq!(nodes.get("n1").unwrap().host, "10.0.0.2");
        assert_eq!(nodes.get("n1").unwrap().state(), NodeState::Registered);
    }

    #[test]
    fn heartbeat_requires_registration() {
        let nodes = Nodes::new();
        assert!(nodes
            .heartbeat("ghost", HeartbeatStats::default())
            .unwrap_err()
            .is_not_found());

        nodes.register("n1", "10.0.0.1", 4381).unwrap();
        let stats = HeartbeatStats {
            storage_allocated: 100,
            storage_used: 25,
            memory_allocated: 10,
            memory_used: 5,
        };
        nodes.heartbeat("n1", stats).unwrap();
        let (seen, at) = nodes.get("n1").unwrap().last_heartbeat();
        assert_eq!(seen, stats);
        assert_eq!(seen.storage_available(), 75);
        assert!(at.is_some());
    }
}

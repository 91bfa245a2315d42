//! The GEDS node runtime: an ephemeral object cache embedded into compute
//! workers.
//!
//! Workers publish intermediate objects into node-local storage and read
//! them through a single bucket/key namespace, transparently hitting local
//! mappings, peer nodes over the TCP data plane, or the backing object
//! store. The metadata service keeps the authoritative placement map.

pub mod config;
pub mod filesystem;
pub mod handle;
pub mod handles;
pub mod http;
pub mod metadata;
pub mod server;
pub mod transfer;
pub mod transport;

pub use config::GedsConfig;
pub use geds_util::{Error, FileStatus, Result};
pub use handle::{FileHandle, GedsFile};

pub use geds_proto::rpc;

use geds_proto::rpc::node_service_server::NodeServiceServer;
use geds_proto::{Object, ObjectId, ObjectInfo};
use geds_s3::{ObjectStoreConfig, ObjectStores};
use geds_util::concurrent::{ConcurrentMap, ConcurrentSet};
use geds_util::names;
use geds_util::stats::IntGauge;
use geds_util::{CACHE_BLOCK_MARKER, DIRECTORY_MARKER, FOLDER_DELIMITER};
use handle::HandleCommon;
use handles::{CachedHandle, LocalFileHandle, MmapFileHandle, RelocatableHandle, RemoteHandle, S3Handle};
use metadata::MetadataClient;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_stream::wrappers::TcpListenerStream;
use transfer::FileTransferService;
use transport::mux::MuxTransport;
use transport::server::TcpServer;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Capability handed to file handles: a non-owning view of the node runtime
/// exposing exactly the operations a handle needs. Detached contexts (tests)
/// skip the metadata side effects.
#[derive(Clone)]
pub struct NodeCtx {
    inner: Option<Weak<GedsCore>>,
}

impl NodeCtx {
    fn new(core: &Arc<GedsCore>) -> Self {
        Self {
            inner: Some(Arc::downgrade(core)),
        }
    }

    /// A context without a node runtime behind it. Seals succeed locally
    /// without publishing.
    pub fn detached() -> Self {
        Self { inner: None }
    }

    fn core(&self) -> Result<Option<Arc<GedsCore>>> {
        match &self.inner {
            None => Ok(None),
            Some(weak) => weak
                .upgrade()
                .map(Some)
                .ok_or_else(|| Error::Unavailable("node service is gone".to_string())),
        }
    }

    pub(crate) fn cache_block_size(&self) -> u64 {
        match &self.inner {
            Some(weak) => weak
                .upgrade()
                .map(|core| core.config.cache_block_size)
                .unwrap_or(config::DEFAULT_CACHE_BLOCK_SIZE),
            None => config::DEFAULT_CACHE_BLOCK_SIZE,
        }
    }

    pub(crate) async fn seal_object(
        &self,
        common: &HandleCommon,
        update: bool,
        size: u64,
        location: Option<String>,
    ) -> Result<()> {
        let Some(core) = self.core()? else {
            return Ok(());
        };
        core.seal_object(common, update, size, location).await
    }

    pub(crate) async fn reopen(
        &self,
        bucket: &str,
        key: &str,
        invalidate: bool,
    ) -> Result<Arc<dyn FileHandle>> {
        let core = self.require_core()?;
        core.resolve(bucket, key, invalidate).await
    }

    pub(crate) async fn open_file(&self, bucket: &str, key: &str) -> Result<GedsFile> {
        let core = self.require_core()?;
        core.open(bucket, key).await
    }

    pub(crate) fn create_block(&self, bucket: &str, key: &str) -> Result<Arc<dyn FileHandle>> {
        let core = self.require_core()?;
        core.create_file_handle(bucket, key, true, None)
    }

    pub(crate) async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let core = self.require_core()?;
        core.delete_object(bucket, key).await
    }

    fn require_core(&self) -> Result<Arc<GedsCore>> {
        self.core()?
            .ok_or_else(|| Error::Unavailable("node service is not attached".to_string()))
    }
}

struct RuntimeState {
    running: bool,
    hostname: String,
    control_port: u16,
    data_port: u16,
    mux_port: u16,
    storage_root: PathBuf,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            running: false,
            hostname: String::new(),
            control_port: 0,
            data_port: 0,
            mux_port: 0,
            storage_root: PathBuf::new(),
            tasks: Vec::new(),
        }
    }
}

pub struct GedsCore {
    pub config: GedsConfig,
    pub uuid: String,
    mds: MetadataClient,
    handles: ConcurrentMap<String, Arc<dyn FileHandle>>,
    transfers: tokio::sync::Mutex<HashMap<String, Arc<FileTransferService>>>,
    object_stores: ObjectStores,
    known_directories: ConcurrentSet<String>,
    mux: Arc<MuxTransport>,
    tcp_server: Arc<TcpServer>,
    state: RwLock<RuntimeState>,
    storage_used: IntGauge,
    memory_used: IntGauge,
}

impl GedsCore {
    fn ctx(self: &Arc<Self>) -> NodeCtx {
        NodeCtx::new(self)
    }

    fn check_running(&self) -> Result<()> {
        if self.state.read().running {
            Ok(())
        } else {
            Err(Error::FailedPrecondition("the service is stopped".to_string()))
        }
    }

    /// `host:port` of this node's control service; peers resolve
    /// `geds://host:port` locations against it.
    fn self_address(&self) -> String {
        let state = self.state.read();
        format!("{}:{}", state.hostname, state.control_port)
    }

    pub(crate) fn mux(&self) -> &Arc<MuxTransport> {
        &self.mux
    }

    pub(crate) fn transport_endpoints(&self) -> Vec<rpc::TransportEndpoint> {
        let state = self.state.read();
        vec![
            rpc::TransportEndpoint {
                address: state.hostname.clone(),
                port: state.mux_port as u32,
                protocol: rpc::TransportProtocol::Multiplex as i32,
            },
            rpc::TransportEndpoint {
                address: state.hostname.clone(),
                port: state.data_port as u32,
                protocol: rpc::TransportProtocol::Socket as i32,
            },
        ]
    }

    fn local_storage_path(&self, bucket: &str, key: &str) -> PathBuf {
        filesystem::local_path(&self.state.read().storage_root, bucket, key)
    }

    /// Open from the handle cache only.
    pub(crate) fn local_open(&self, bucket: &str, key: &str) -> Result<GedsFile> {
        let identifier = format!("{bucket}/{key}");
        match self.handles.get(&identifier) {
            Some(handle) if handle.is_valid() => Ok(GedsFile::open(handle)),
            _ => Err(Error::NotFound(format!(
                "{identifier} is not available locally"
            ))),
        }
    }

    pub(crate) async fn open(self: &Arc<Self>, bucket: &str, key: &str) -> Result<GedsFile> {
        names::validate_object_name(bucket, key)?;
        if let Ok(file) = self.local_open(bucket, key) {
            return Ok(file);
        }
        let handle = self.resolve(bucket, key, false).await?;
        Ok(GedsFile::open(handle))
    }

    /// Resolve `bucket/key` through the metadata service (or the registered
    /// backing store on a miss) and cache the resulting handle.
    /// `invalidate` replaces whatever the cache holds.
    pub(crate) async fn resolve(
        self: &Arc<Self>,
        bucket: &str,
        key: &str,
        invalidate: bool,
    ) -> Result<Arc<dyn FileHandle>> {
        self.check_running()?;
        let id = ObjectId::new(bucket, key);
        let identifier = id.to_string();
        // Cache blocks are served as-is, never through another blocked view.
        let cacheable = !key.starts_with(CACHE_BLOCK_MARKER);

        let handle: Arc<dyn FileHandle> = match self.mds.lookup(&id).await {
            Ok(object) => {
                let location = object.info.location.clone();
                if location.starts_with("geds://") {
                    let address = RemoteHandle::parse_location(&location)?;
                    if address == self.self_address() {
                        // The map points at us but the handle is gone; the
                        // object died with its local file.
                        return Err(Error::NotFound(format!(
                            "{identifier} is no longer present on this node"
                        )));
                    }
                    let transfer = self.transfer_service(address).await?;
                    let remote: Arc<dyn FileHandle> = RemoteHandle::new(&object, transfer);
                    let inner: Arc<dyn FileHandle> = if cacheable {
                        CachedHandle::new(self.ctx(), remote)?
                    } else {
                        remote
                    };
                    RelocatableHandle::wrap(self.ctx(), inner)
                } else if location.starts_with("s3://") {
                    let (s3_bucket, _) = S3Handle::parse_location(&location)?;
                    let endpoint = self.object_stores.get(s3_bucket)?;
                    let s3: Arc<dyn FileHandle> =
                        S3Handle::from_object(self.ctx(), &object, endpoint).await?;
                    let inner: Arc<dyn FileHandle> = if cacheable {
                        CachedHandle::new(self.ctx(), s3)?
                    } else {
                        s3
                    };
                    RelocatableHandle::wrap(self.ctx(), inner)
                } else {
                    // A path on this host, e.g. after the producing handle
                    // aged out of the cache.
                    LocalFileHandle::create(
                        self.ctx(),
                        bucket,
                        key,
                        object.info.metadata,
                        Path::new(&location),
                        false,
                    )?
                }
            }
            Err(err) if err.is_not_found() && self.object_stores.is_registered(bucket) => {
                let endpoint = self.object_stores.get(bucket)?;
                let s3: Arc<dyn FileHandle> =
                    S3Handle::from_bucket_and_key(self.ctx(), bucket, key, endpoint).await?;
                let inner: Arc<dyn FileHandle> = if cacheable {
                    CachedHandle::new(self.ctx(), s3)?
                } else {
                    s3
                };
                RelocatableHandle::wrap(self.ctx(), inner)
            }
            Err(err) => return Err(err),
        };

        if invalidate {
            if let Some(old) = self.handles.get(&identifier) {
                old.common().invalidate();
            }
            self.handles.insert_or_replace(identifier, handle.clone());
            return Ok(handle);
        }
        let stored = self.handles.insert_or_exists(identifier.clone(), handle.clone());
        if stored.is_valid() {
            Ok(stored)
        } else {
            self.handles.insert_or_replace(identifier, handle.clone());
            Ok(handle)
        }
    }

    /// Allocate a local writable handle (memory-mapped) and register it in
    /// the handle cache. Nothing is published until seal.
    pub(crate) fn create_file_handle(
        self: &Arc<Self>,
        bucket: &str,
        key: &str,
        overwrite: bool,
        metadata: Option<Vec<u8>>,
    ) -> Result<Arc<dyn FileHandle>> {
        self.check_running()?;
        let path = self.local_storage_path(bucket, key);
        let handle: Arc<dyn FileHandle> =
            MmapFileHandle::create(self.ctx(), bucket, key, metadata, &path, overwrite)?;
        self.handles
            .insert_or_replace(handle.common().identifier.clone(), handle.clone());
        Ok(handle)
    }

    pub(crate) async fn create(
        self: &Arc<Self>,
        bucket: &str,
        key: &str,
        overwrite: bool,
    ) -> Result<GedsFile> {
        names::validate_object_name(bucket, key)?;
        if !overwrite {
            if self.local_open(bucket, key).is_ok() {
                return Err(Error::AlreadyExists(format!("{bucket}/{key} already exists")));
            }
            if self.mds.lookup(&ObjectId::new(bucket, key)).await.is_ok() {
                return Err(Error::AlreadyExists(format!("{bucket}/{key} already exists")));
            }
        }
        let handle = self.create_file_handle(bucket, key, overwrite, None)?;
        Ok(GedsFile::open(handle))
    }

    pub(crate) async fn seal_object(
        &self,
        common: &HandleCommon,
        update: bool,
        size: u64,
        location: Option<String>,
    ) -> Result<()> {
        let location = location.unwrap_or_else(|| format!("geds://{}", self.self_address()));
        let object = Object {
            id: ObjectId::new(common.bucket.clone(), common.key.clone()),
            info: ObjectInfo {
                location,
                size,
                sealed_offset: size,
                metadata: common.metadata(),
            },
        };
        if update {
            self.mds.update_object(object).await
        } else {
            self.mds.create_object(object).await
        }
    }

    pub(crate) async fn transfer_service(
        self: &Arc<Self>,
        node_address: &str,
    ) -> Result<Arc<FileTransferService>> {
        let mut transfers = self.transfers.lock().await;
        if let Some(service) = transfers.get(node_address) {
            return Ok(service.clone());
        }
        let service = FileTransferService::connect(self, node_address).await?;
        transfers.insert(node_address.to_string(), service.clone());
        Ok(service)
    }

    pub(crate) async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let identifier = format!("{bucket}/{key}");
        if let Some(handle) = self.handles.get_and_remove(&identifier) {
            handle.common().invalidate();
        }
        let result = self.mds.delete_object(&ObjectId::new(bucket, key)).await;
        if result.as_ref().is_err_and(Error::is_not_found)
            && self.object_stores.is_registered(bucket)
        {
            let endpoint = self.object_stores.get(bucket)?;
            return endpoint.delete_object(bucket, key).await;
        }
        result
    }

    /// Pull `bucket/key` from its current location, republish it under this
    /// node, and swap the local handle cache to the new copy.
    pub(crate) async fn download_object(self: &Arc<Self>, bucket: &str, key: &str) -> Result<()> {
        let source = self.resolve(bucket, key, true).await?;
        let size = source.size()?;
        let metadata = source.common().metadata();

        let path = self.local_storage_path(bucket, key);
        let local: Arc<dyn FileHandle> =
            MmapFileHandle::create(self.ctx(), bucket, key, metadata, &path, true)?;

        let copied = source.download_range(local.as_ref(), 0, size, 0).await?;
        if copied != size {
            return Err(Error::Unavailable(format!(
                "short download of {bucket}/{key}: {copied} of {size} bytes"
            )));
        }
        local.seal().await?;
        source.common().invalidate();
        self.handles
            .insert_or_replace(format!("{bucket}/{key}"), local);
        Ok(())
    }

    async fn heartbeat_once(&self) -> Result<()> {
        let mut storage = 0u64;
        let mut memory = 0u64;
        self.handles.forall(|_, handle| {
            storage += handle.local_storage_size();
            memory += handle.local_memory_size();
        });
        self.storage_used.set(storage as i64);
        self.memory_used.set(memory as i64);
        self.mds
            .heartbeat(rpc::NodeHeartbeat {
                identifier: self.uuid.clone(),
                storage_allocated: self.config.available_local_storage,
                storage_used: storage,
                memory_allocated: self.config.available_local_memory,
                memory_used: memory,
            })
            .await
    }
}

/// The public node handle. Composes the handle cache, TCP data plane,
/// metadata client, backing-store lookup, and relocation responder.
pub struct Geds {
    core: Arc<GedsCore>,
}

impl Geds {
    pub fn new(config: GedsConfig) -> Self {
        let uuid = uuid::Uuid::new_v4().to_string();
        let mds = MetadataClient::new(config.metadata_service_address.clone());
        let core = Arc::new_cyclic(|weak: &Weak<GedsCore>| GedsCore {
            config,
            uuid,
            mds,
            handles: ConcurrentMap::new(),
            transfers: tokio::sync::Mutex::new(HashMap::new()),
            object_stores: ObjectStores::new(),
            known_directories: ConcurrentSet::new(),
            mux: MuxTransport::new(weak.clone()),
            tcp_server: TcpServer::new(weak.clone()),
            state: RwLock::new(RuntimeState::default()),
            storage_used: geds_util::stats::gauge("geds node: local storage used"),
            memory_used: geds_util::stats::gauge("geds node: local memory used"),
        });
        Self { core }
    }

    pub fn uuid(&self) -> &str {
        &self.core.uuid
    }

    /// The advertised `host:port` of this node's control service.
    pub fn address(&self) -> String {
        self.core.self_address()
    }

    /// The data-plane endpoints this node advertises to peers.
    pub fn transfer_endpoints(&self) -> Vec<rpc::TransportEndpoint> {
        self.core.transport_endpoints()
    }

    /// Start the node: prepare local storage, connect to the metadata
    /// service, bring up the data plane, control service, and HTTP
    /// endpoint, and register with the MDS. Initialization failures here
    /// are fatal to the node.
    pub async fn start(&self) -> Result<()> {
        if self.core.state.read().running {
            return Err(Error::FailedPrecondition(
                "the service is already running".to_string(),
            ));
        }
        let config = &self.core.config;
        let storage_root = filesystem::create_storage_root(&config.local_storage_path)?;

        self.core.mds.connect().await?;
        let hostname = match &config.hostname {
            Some(hostname) => hostname.clone(),
            None => self.core.mds.get_connection_information().await?,
        };

        let bind = |port: u16| format!("{}:{port}", config.listen_address);
        let data_listener = tokio::net::TcpListener::bind(bind(config.port))
            .await
            .map_err(|err| {
                Error::Unavailable(format!("unable to bind data port {}: {err}", config.port))
            })?;
        let mux_listener = tokio::net::TcpListener::bind(bind(0)).await.map_err(|err| {
            Error::Unavailable(format!("unable to bind multiplex listener: {err}"))
        })?;
        let control_listener = tokio::net::TcpListener::bind(bind(0)).await.map_err(|err| {
            Error::Unavailable(format!("unable to bind control listener: {err}"))
        })?;
        let http_listener = tokio::net::TcpListener::bind(bind(config.http_server_port))
            .await
            .map_err(|err| {
                Error::Unavailable(format!(
                    "unable to bind http port {}: {err}",
                    config.http_server_port
                ))
            })?;

        let data_port = data_listener.local_addr()?.port();
        let mux_port = mux_listener.local_addr()?.port();
        let control_port = control_listener.local_addr()?.port();

        {
            let mut state = self.core.state.write();
            state.running = true;
            state.hostname = hostname.clone();
            state.data_port = data_port;
            state.mux_port = mux_port;
            state.control_port = control_port;
            state.storage_root = storage_root;
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            self.core.tcp_server.clone().serve(data_listener),
        ));
        tasks.push(tokio::spawn(self.core.mux.clone().listen(mux_listener)));

        let control = NodeServiceServer::new(server::NodeServiceImpl::new(Arc::downgrade(
            &self.core,
        )));
        tasks.push(tokio::spawn(async move {
            if let Err(err) = tonic::transport::Server::builder()
                .add_service(control)
                .serve_with_incoming(TcpListenerStream::new(control_listener))
                .await
            {
                tracing::error!(%err, "control service failed");
            }
        }));

        let router = http::router(http::NodeIdentity {
            uuid: self.core.uuid.clone(),
            hostname: hostname.clone(),
        });
        tasks.push(tokio::spawn(async move {
            if let Err(err) = axum::serve(http_listener, router).await {
                tracing::error!(%err, "http server failed");
            }
        }));

        let heartbeat_core = Arc::downgrade(&self.core);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(core) = heartbeat_core.upgrade() else {
                    return;
                };
                if !core.state.read().running {
                    return;
                }
                if let Err(err) = core.heartbeat_once().await {
                    tracing::warn!(%err, "heartbeat failed");
                }
            }
        }));
        self.core.state.write().tasks = tasks;

        self.core
            .mds
            .register_node(&self.core.uuid, &hostname, control_port)
            .await?;

        // Pick up backing-store mappings registered before this node joined.
        match self.core.mds.list_object_store_configs().await {
            Ok(configs) => {
                for config in configs {
                    if let Err(err) = self.core.object_stores.register(config) {
                        tracing::warn!(%err, "skipping object store mapping");
                    }
                }
            }
            Err(err) => tracing::warn!(%err, "unable to list object store configs"),
        }

        tracing::info!(
            uuid = %self.core.uuid,
            %hostname,
            data_port,
            mux_port,
            control_port,
            "geds node started"
        );
        Ok(())
    }

    /// Stop serving. Local cache files are discarded with the storage root
    /// on the next start.
    pub async fn stop(&self) -> Result<()> {
        let tasks = {
            let mut state = self.core.state.write();
            if !state.running {
                return Err(Error::FailedPrecondition(
                    "the service is stopped".to_string(),
                ));
            }
            state.running = false;
            std::mem::take(&mut state.tasks)
        };
        for task in tasks {
            task.abort();
        }
        self.core.handles.clear();
        self.core.mds.disconnect().await
    }

    pub async fn create_bucket(&self, bucket: &str) -> Result<()> {
        names::validate_bucket_name(bucket)?;
        self.core.mds.create_bucket(bucket).await
    }

    pub async fn lookup_bucket(&self, bucket: &str) -> Result<()> {
        self.core.mds.lookup_bucket(bucket).await
    }

    /// Create `bucket/key` as a local writable object. It becomes visible to
    /// the rest of the cluster once sealed.
    pub async fn create(&self, bucket: &str, key: &str, overwrite: bool) -> Result<GedsFile> {
        self.core.create(bucket, key, overwrite).await
    }

    pub async fn open(&self, bucket: &str, key: &str) -> Result<GedsFile> {
        self.core.open(bucket, key).await
    }

    /// Open only node-local handles.
    pub fn local_open(&self, bucket: &str, key: &str) -> Result<GedsFile> {
        self.core.local_open(bucket, key)
    }

    /// Recursively create directory markers along `path`.
    pub async fn mkdirs(&self, bucket: &str, path: &str) -> Result<()> {
        let delimiter = FOLDER_DELIMITER;
        let mut level = String::new();
        for segment in path.split(delimiter).filter(|s| !s.is_empty()) {
            level.push_str(segment);
            level.push(delimiter);
            let marker = format!("{level}{DIRECTORY_MARKER}");
            let known = format!("{bucket}/{level}");
            if self.core.known_directories.contains(&known) {
                continue;
            }
            let file = self.core.create(bucket, &marker, true).await?;
            file.seal().await?;
            self.core.known_directories.insert(known);
        }
        Ok(())
    }

    pub async fn status(&self, bucket: &str, key: &str) -> Result<FileStatus> {
        match self.core.mds.lookup(&ObjectId::new(bucket, key)).await {
            Ok(object) => Ok(FileStatus::file(key, object.info.size)),
            Err(err) if err.is_not_found() => self.folder_status(bucket, key).await,
            Err(err) => Err(err),
        }
    }

    async fn folder_status(&self, bucket: &str, key: &str) -> Result<FileStatus> {
        let prefix = if key.ends_with(FOLDER_DELIMITER) {
            key.to_string()
        } else {
            format!("{key}{FOLDER_DELIMITER}")
        };
        let (objects, prefixes) = self.core.mds.list_prefix(bucket, &prefix, None).await?;
        if !objects.is_empty() || !prefixes.is_empty() {
            return Ok(FileStatus::directory(prefix));
        }
        if self.core.object_stores.is_registered(bucket) {
            let endpoint = self.core.object_stores.get(bucket)?;
            if let Ok(status) = endpoint.file_status(bucket, key).await {
                return Ok(status);
            }
            return endpoint.folder_status(bucket, &prefix, FOLDER_DELIMITER).await;
        }
        Err(Error::NotFound(format!("{bucket}/{key} not found")))
    }

    /// List objects below `prefix`. With a delimiter, deeper keys fold into
    /// directories; backing-store listings are merged in when the bucket has
    /// a registered store.
    pub async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
    ) -> Result<Vec<FileStatus>> {
        let (objects, common_prefixes) =
            self.core.mds.list_prefix(bucket, prefix, delimiter).await?;

        let mut result = BTreeSet::new();
        for object in objects {
            let key = object.id.key;
            if key.starts_with(CACHE_BLOCK_MARKER) {
                continue;
            }
            if let Some(delimiter) = delimiter {
                if let Some(folder) = key.strip_suffix(DIRECTORY_MARKER) {
                    if folder.ends_with(delimiter) {
                        if folder != prefix {
                            result.insert(FileStatus::directory(folder));
                        }
                        continue;
                    }
                }
            }
            result.insert(FileStatus::file(key, object.info.size));
        }
        for common in common_prefixes {
            result.insert(FileStatus::directory(common));
        }

        if self.core.object_stores.is_registered(bucket) {
            let endpoint = self.core.object_stores.get(bucket)?;
            for status in endpoint.list(bucket, prefix, delimiter).await? {
                result.insert(status);
            }
        }
        Ok(result.into_iter().collect())
    }

    /// List with `/` as the folder delimiter.
    pub async fn list_as_folder(&self, bucket: &str, prefix: &str) -> Result<Vec<FileStatus>> {
        self.list(bucket, prefix, Some(FOLDER_DELIMITER)).await
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.core.delete_object(bucket, key).await
    }

    pub async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<()> {
        let cache_prefix = format!("{bucket}/{prefix}");
        self.core.handles.retain(|identifier, handle| {
            let matches = identifier.starts_with(&cache_prefix);
            if matches {
                handle.common().invalidate();
            }
            !matches
        });
        let result = self
            .core
            .mds
            .delete_prefix(&ObjectId::new(bucket, prefix))
            .await;
        if result.as_ref().is_err_and(Error::is_not_found)
            && self.core.object_stores.is_registered(bucket)
        {
            let endpoint = self.core.object_stores.get(bucket)?;
            return endpoint.delete_prefix(bucket, prefix).await;
        }
        result
    }

    /// Register a backing store for `bucket`, locally and with the MDS.
    pub async fn register_object_store_config(&self, config: ObjectStoreConfig) -> Result<()> {
        self.core.mds.register_object_store(&config).await?;
        self.core.object_stores.register(config)
    }

    /// Subscribe to metadata events and return the event stream.
    pub async fn subscribe(
        &self,
        bucket: &str,
        key: &str,
        kind: rpc::SubscriptionType,
    ) -> Result<tonic::Streaming<rpc::Object>> {
        self.core
            .mds
            .subscribe(rpc::SubscriptionEvent {
                subscriber_id: self.core.uuid.clone(),
                bucket_id: bucket.to_string(),
                key: key.to_string(),
                subscription_type: kind as i32,
            })
            .await?;
        self.core.mds.subscribe_stream(&self.core.uuid).await
    }
}

//! Two nodes and an in-process metadata service exchanging bytes over the
//! data plane.

use geds::rpc;
use geds::transport::client::TcpClientPool;
use geds::{Error, Geds, GedsConfig};
use geds_mds::Mds;
use tokio_stream::wrappers::TcpListenerStream;

/// Serve an in-process MDS, returning its address.
async fn start_mds() -> String {
    let mds = Mds::new();
    let service = mds.grpc_service();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _mds = mds;
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    address.to_string()
}

fn node_config(mds_address: &str, storage: &tempfile::TempDir) -> GedsConfig {
    let mut config = GedsConfig::new(mds_address);
    config.hostname = Some("127.0.0.1".to_string());
    config.listen_address = "127.0.0.1".to_string();
    // Ephemeral ports keep parallel tests from colliding.
    config.port = 0;
    config.http_server_port = 0;
    config.local_storage_path = format!("{}/node_XXXXXX", storage.path().display());
    config
}

async fn start_node(mds_address: &str, storage: &tempfile::TempDir) -> Geds {
    let node = Geds::new(node_config(mds_address, storage));
    node.start().await.unwrap();
    node
}

fn lorem(n: usize) -> Vec<u8> {
    b"Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod tempor "
        .iter()
        .copied()
        .cycle()
        .take(n)
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_on_one_node_read_from_another() {
    let storage = tempfile::tempdir().unwrap();
    let mds = start_mds().await;
    let producer = start_node(&mds, &storage).await;
    let consumer = start_node(&mds, &storage).await;

    producer.create_bucket("geds-test").await.unwrap();

    let payload = lorem(409);
    let file = producer.create("geds-test", "unit/msg", false).await.unwrap();
    file.write(&payload, 0).await.unwrap();
    file.seal().await.unwrap();

    let status = producer.status("geds-test", "unit/msg").await.unwrap();
    assert_eq!(status.size, 409);
    assert!(!status.is_directory);

    // The consumer resolves the object through the MDS and pulls the bytes
    // over the peer data plane.
    let remote = consumer.open("geds-test", "unit/msg").await.unwrap();
    assert_eq!(remote.size(), 409);
    let mut buf = vec![0u8; 409];
    let n = remote.read(&mut buf, 0).await.unwrap();
    assert_eq!(n, 409);
    assert_eq!(buf, payload);

    // Reads at or past the size return zero bytes.
    let mut empty = [0u8; 8];
    assert_eq!(remote.read(&mut empty, 409).await.unwrap(), 0);
    assert_eq!(remote.read(&mut empty, 10_000).await.unwrap(), 0);

    // Concurrent readers of the same block observe identical bytes.
    let reader_a = consumer.open("geds-test", "unit/msg").await.unwrap();
    let reader_b = consumer.open("geds-test", "unit/msg").await.unwrap();
    let (a, b) = tokio::join!(
        async move {
            let mut buf = vec![0u8; 409];
            reader_a.read(&mut buf, 0).await.unwrap();
            buf
        },
        async move {
            let mut buf = vec![0u8; 409];
            reader_b.read(&mut buf, 0).await.unwrap();
            buf
        }
    );
    assert_eq!(a, b);
    assert_eq!(a, payload);

    // Delete and observe NotFound on the next status query.
    producer.delete_object("geds-test", "unit/msg").await.unwrap();
    match producer.status("geds-test", "unit/msg").await {
        Err(err) => assert!(err.is_not_found(), "{err:?}"),
        Ok(status) => panic!("object survived deletion: {status:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reads_crossing_cache_blocks_are_contiguous() {
    let storage = tempfile::tempdir().unwrap();
    let mds = start_mds().await;
    let producer = start_node(&mds, &storage).await;

    // A consumer with a tiny block size forces multi-block hydration.
    let mut config = node_config(&mds, &storage);
    config.cache_block_size = 64;
    let consumer = Geds::new(config);
    consumer.start().await.unwrap();

    producer.create_bucket("geds-test").await.unwrap();
    let payload = lorem(1000);
    let file = producer.create("geds-test", "blocked", false).await.unwrap();
    file.write(&payload, 0).await.unwrap();
    file.seal().await.unwrap();

    let remote = consumer.open("geds-test", "blocked").await.unwrap();

    // A read spanning a block boundary comes back contiguous.
    let mut buf = vec![0u8; 40];
    let n = remote.read(&mut buf, 50).await.unwrap();
    assert_eq!(n, 40);
    assert_eq!(buf, payload[50..90]);

    // The whole object crosses fifteen boundaries.
    let mut buf = vec![0u8; 1000];
    let n = remote.read(&mut buf, 0).await.unwrap();
    assert_eq!(n, 1000);
    assert_eq!(buf, payload);

    // A tail read ending exactly on the object size.
    let mut buf = vec![0u8; 72];
    let n = remote.read(&mut buf, 928).await.unwrap();
    assert_eq!(n, 72);
    assert_eq!(buf, payload[928..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn listing_folds_folders_and_orders_directories_first() {
    let storage = tempfile::tempdir().unwrap();
    let mds = start_mds().await;
    let node = start_node(&mds, &storage).await;

    node.create_bucket("geds-test").await.unwrap();
    for key in ["a/1", "a/b/2", "top"] {
        let file = node.create("geds-test", key, false).await.unwrap();
        file.write(b"x", 0).await.unwrap();
        file.seal().await.unwrap();
    }
    node.mkdirs("geds-test", "empty/folder").await.unwrap();

    let listing = node.list_as_folder("geds-test", "").await.unwrap();
    let rendered: Vec<(String, bool)> = listing
        .iter()
        .map(|status| (status.key.clone(), status.is_directory))
        .collect();
    assert_eq!(
        rendered,
        vec![
            ("a/".to_string(), true),
            ("empty/".to_string(), true),
            ("top".to_string(), false),
        ]
    );

    // Deeper keys exist below "a/".
    let listing = node.list_as_folder("geds-test", "a/").await.unwrap();
    let folders: Vec<&str> = listing
        .iter()
        .filter(|status| status.is_directory)
        .map(|status| status.key.as_str())
        .collect();
    assert_eq!(folders, vec!["a/b/"]);

    // A directory marker makes an empty folder visible.
    let status = node.status("geds-test", "empty/folder").await.unwrap();
    assert!(status.is_directory);

    // Deleting a prefix leaves siblings alone.
    node.delete_prefix("geds-test", "a/").await.unwrap();
    let listing = node.list("geds-test", "a/", None).await.unwrap();
    assert!(listing.is_empty());
    assert!(node.status("geds-test", "top").await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn simple_plane_serves_pooled_clients() {
    let storage = tempfile::tempdir().unwrap();
    let mds = start_mds().await;
    let node = start_node(&mds, &storage).await;

    node.create_bucket("geds-test").await.unwrap();
    let payload = lorem(8192);
    let file = node.create("geds-test", "plain", false).await.unwrap();
    file.write(&payload, 0).await.unwrap();
    file.seal().await.unwrap();

    let socket = node
        .transfer_endpoints()
        .into_iter()
        .find(|ep| ep.protocol() == rpc::TransportProtocol::Socket)
        .expect("a socket endpoint is advertised");
    let address = format!("{}:{}", socket.address, socket.port).parse().unwrap();
    let pool = TcpClientPool::new(address, 2);

    // Ranged read through the ASCII plane.
    let mut buf = vec![0u8; 4096];
    let n = pool.read_bytes("geds-test", "plain", &mut buf, 1024).await.unwrap();
    assert_eq!(n, 4096);
    assert_eq!(buf, payload[1024..5120]);

    // Reads past the end return zero bytes with OK status.
    let mut buf = vec![0u8; 16];
    assert_eq!(
        pool.read_bytes("geds-test", "plain", &mut buf, 8192).await.unwrap(),
        0
    );

    // Unknown objects report NotFound through the response header.
    let mut buf = vec![0u8; 16];
    match pool.read_bytes("geds-test", "missing", &mut buf, 0).await {
        Err(Error::NotFound(_)) => (),
        other => panic!("unexpected: {other:?}"),
    }

    // Keep-alive: the same pool serves a second request after an error.
    let mut buf = vec![0u8; 32];
    let n = pool.read_bytes("geds-test", "plain", &mut buf, 0).await.unwrap();
    assert_eq!(n, 32);
    assert_eq!(buf, payload[..32]);
}

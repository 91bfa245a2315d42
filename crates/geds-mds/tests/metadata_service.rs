//! End-to-end exercise of the metadata service over a real tonic channel.

use geds_mds::Mds;
use geds_proto::rpc;
use geds_proto::rpc::metadata_service_client::MetadataServiceClient;
use std::time::Duration;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Channel;

async fn start_mds() -> MetadataServiceClient<Channel> {
    let mds = Mds::new();
    let service = mds.grpc_service();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // Keep the state alive for the duration of the server task.
        let _mds = mds;
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    MetadataServiceClient::connect(format!("http://{address}"))
        .await
        .unwrap()
}

fn object(bucket: &str, key: &str, location: &str, size: u64) -> rpc::Object {
    rpc::Object {
        id: Some(rpc::ObjectId {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }),
        info: Some(rpc::ObjectInfo {
            location: location.to_string(),
            size,
            sealed_offset: size,
            metadata: None,
        }),
    }
}

#[tokio::test]
async fn bucket_and_object_round_trip() {
    let mut client = start_mds().await;

    let bucket = rpc::Bucket {
        bucket: "geds-test".to_string(),
    };
    let status = client.create_bucket(bucket.clone()).await.unwrap().into_inner();
    assert_eq!(status.code(), rpc::StatusCode::Ok);
    let status = client.create_bucket(bucket.clone()).await.unwrap().into_inner();
    assert_eq!(status.code(), rpc::StatusCode::AlreadyExists);
    let status = client.lookup_bucket(bucket.clone()).await.unwrap().into_inner();
    assert_eq!(status.code(), rpc::StatusCode::Ok);

    // Invalid bucket names never reach the store.
    let status = client
        .create_bucket(rpc::Bucket {
            bucket: "Invalid/Name".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.code(), rpc::StatusCode::InvalidArgument);

    let buckets = client
        .list_buckets(rpc::EmptyParams {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(buckets.results, vec!["geds-test".to_string()]);

    // Object create + lookup round-trips the identifier and info.
    let created = object("geds-test", "a/1", "geds://node-host:4381", 4096);
    let status = client.create(created.clone()).await.unwrap().into_inner();
    assert_eq!(status.code(), rpc::StatusCode::Ok);

    let lookup = client
        .lookup(rpc::ObjectId {
            bucket: "geds-test".to_string(),
            key: "a/1".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(lookup.error.is_none());
    let result = lookup.result.unwrap();
    assert_eq!(result, created);

    // Listing with '/' folds deeper keys into common prefixes.
    client
        .create(object("geds-test", "a/b/2", "geds://node-host:4381", 1))
        .await
        .unwrap();
    let listing = client
        .list(rpc::ObjectListRequest {
            prefix: Some(rpc::ObjectId {
                bucket: "geds-test".to_string(),
                key: String::new(),
            }),
            delimiter: Some('/' as i32),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(listing.results.is_empty());
    assert_eq!(listing.common_prefixes, vec!["a/".to_string()]);

    let listing = client
        .list(rpc::ObjectListRequest {
            prefix: Some(rpc::ObjectId {
                bucket: "geds-test".to_string(),
                key: "a/".to_string(),
            }),
            delimiter: Some('/' as i32),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(listing.results.len(), 1);
    assert_eq!(listing.common_prefixes, vec!["a/b/".to_string()]);

    // Double delete reports NotFound on the second call.
    let id = rpc::ObjectId {
        bucket: "geds-test".to_string(),
        key: "a/1".to_string(),
    };
    let status = client.delete(id.clone()).await.unwrap().into_inner();
    assert_eq!(status.code(), rpc::StatusCode::Ok);
    let status = client.delete(id.clone()).await.unwrap().into_inner();
    assert_eq!(status.code(), rpc::StatusCode::NotFound);
}

#[tokio::test]
async fn object_store_registration_is_idempotent() {
    let mut client = start_mds().await;

    let config = rpc::ObjectStoreConfig {
        bucket: "geds-test".to_string(),
        endpoint_url: "http://localhost:9000".to_string(),
        access_key: "access".to_string(),
        secret_key: "secret".to_string(),
    };
    let status = client
        .register_object_store(config.clone())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.code(), rpc::StatusCode::Ok);
    let status = client
        .register_object_store(config.clone())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.code(), rpc::StatusCode::Ok);

    let mut conflicting = config.clone();
    conflicting.endpoint_url = "http://other:9000".to_string();
    let status = client
        .register_object_store(conflicting)
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.code(), rpc::StatusCode::AlreadyExists);

    let stores = client
        .list_object_stores(rpc::EmptyParams {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(stores.mappings.len(), 1);
    assert_eq!(stores.mappings[0].bucket, "geds-test");
}

#[tokio::test]
async fn node_lifecycle() {
    let mut client = start_mds().await;

    let registration = rpc::NodeRegistration {
        identifier: "node-1".to_string(),
        host: "127.0.0.1".to_string(),
        port: 4381,
    };
    let status = client
        .register_node(registration.clone())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.code(), rpc::StatusCode::Ok);
    let status = client
        .register_node(registration.clone())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.code(), rpc::StatusCode::AlreadyExists);

    let status = client
        .heartbeat(rpc::NodeHeartbeat {
            identifier: "node-1".to_string(),
            storage_allocated: 100,
            storage_used: 10,
            memory_allocated: 50,
            memory_used: 5,
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.code(), rpc::StatusCode::Ok);

    let status = client
        .heartbeat(rpc::NodeHeartbeat {
            identifier: "ghost".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.code(), rpc::StatusCode::NotFound);

    // With a second registered node as target and nothing to move, the drain
    // completes and frees the identifier for re-registration.
    client
        .register_node(rpc::NodeRegistration {
            identifier: "node-2".to_string(),
            host: "127.0.0.1".to_string(),
            port: 4382,
        })
        .await
        .unwrap();
    let status = client
        .decommission_nodes(rpc::NodeList {
            identifiers: vec!["node-1".to_string()],
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.code(), rpc::StatusCode::Ok);

    let status = client
        .register_node(registration)
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.code(), rpc::StatusCode::Ok);
}

#[tokio::test]
async fn connection_information_reports_caller_address() {
    let mut client = start_mds().await;
    let info = client
        .get_connection_information(rpc::EmptyParams {})
        .await
        .unwrap()
        .into_inner();
    assert!(info.error.is_none());
    assert_eq!(info.remote_address, "127.0.0.1");
}

#[tokio::test]
async fn subscription_stream_delivers_matching_events() {
    let mut client = start_mds().await;
    client
        .create_bucket(rpc::Bucket {
            bucket: "geds-test".to_string(),
        })
        .await
        .unwrap();

    let status = client
        .subscribe(rpc::SubscriptionEvent {
            subscriber_id: "sub-1".to_string(),
            bucket_id: "geds-test".to_string(),
            key: "watched/".to_string(),
            subscription_type: rpc::SubscriptionType::Prefix as i32,
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.code(), rpc::StatusCode::Ok);

    let mut stream = client
        .subscribe_stream(rpc::SubscriptionStreamEvent {
            subscriber_id: "sub-1".to_string(),
        })
        .await
        .unwrap()
        .into_inner();

    client
        .create(object("geds-test", "watched/a", "geds://node:4381", 1))
        .await
        .unwrap();
    client
        .create(object("geds-test", "ignored/b", "geds://node:4381", 1))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), stream.message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.id.unwrap().key, "watched/a");
}

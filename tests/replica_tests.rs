//! Single-replica integration: bootstrap a one-node quorum on a loopback
//! port, drive the replicated store through it, and exercise snapshot
//! persistence and the lease sweeper.

use std::time::Duration;

use meshgate::cluster::raft::{
    QueryResponse, ReplicaConfig, ReplicaNode, StoreCommand, StoreQuery, StoreResponse,
};
use meshgate::cluster::{ClusterOptions, ClusterRole, EmbeddedServer, StartMode};

/// Reserve a loopback port by binding and dropping a listener.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn replica_config(data_dir: &str) -> ReplicaConfig {
    ReplicaConfig {
        node_id: 1,
        member_name: "member-001".to_string(),
        raft_addr: format!("127.0.0.1:{}", free_port()),
        data_dir: data_dir.to_string(),
        ..ReplicaConfig::default()
    }
}

#[tokio::test]
async fn bootstrap_write_read_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let node = ReplicaNode::new(replica_config(dir.path().to_str().unwrap()), false)
        .await
        .unwrap();

    node.initialize_cluster().await.unwrap();
    node.wait_leader(Duration::from_secs(10)).await.unwrap();
    assert!(node.is_leader());

    let response = node
        .write(StoreCommand::Put {
            key: "/config/version".to_string(),
            value: "1".to_string(),
            lease: None,
        })
        .await
        .unwrap();
    assert_eq!(response, StoreResponse::Ok);

    let response = node
        .read(StoreQuery::Get {
            key: "/config/version".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(response, QueryResponse::Value(Some("1".to_string())));

    let stats = node.self_stats();
    assert_eq!(stats.id, "1");
    assert_eq!(stats.state, "Leader");

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn lease_grant_and_revoke_through_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let node = ReplicaNode::new(replica_config(dir.path().to_str().unwrap()), false)
        .await
        .unwrap();
    node.initialize_cluster().await.unwrap();
    node.wait_leader(Duration::from_secs(10)).await.unwrap();

    let response = node
        .write(StoreCommand::LeaseGrant {
            ttl_secs: 3600,
            now_ms: chrono::Utc::now().timestamp_millis(),
        })
        .await
        .unwrap();
    let StoreResponse::LeaseId(lease) = response else {
        panic!("expected lease id");
    };

    node.write(StoreCommand::Put {
        key: "/status/objects/cluster/member-001".to_string(),
        value: "{}".to_string(),
        lease: Some(lease),
    })
    .await
    .unwrap();

    node.write(StoreCommand::LeaseRevoke { id: lease })
        .await
        .unwrap();

    let response = node
        .read(StoreQuery::GetPrefix {
            prefix: "/status/objects/".to_string(),
        })
        .await
        .unwrap();
    let QueryResponse::Values(values) = response else {
        panic!("expected values");
    };
    assert!(values.is_empty());

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn embedded_server_bootstraps_and_sweeps_expired_leases() {
    let dir = tempfile::tempdir().unwrap();
    let options = ClusterOptions {
        name: "member-001".to_string(),
        role: ClusterRole::Writer,
        data_dir: dir.path().to_str().unwrap().to_string(),
        peer_url: format!("127.0.0.1:{}", free_port()),
        client_url: "127.0.0.1:0".to_string(),
        ..ClusterOptions::default()
    };

    let server = EmbeddedServer::start(&options, StartMode::Bootstrap)
        .await
        .unwrap();
    assert!(server.is_ready());
    let node = server.node();

    // A short lease with no keepalive: the sweeper revokes it and its keys.
    let response = node
        .write(StoreCommand::LeaseGrant {
            ttl_secs: 1,
            now_ms: chrono::Utc::now().timestamp_millis(),
        })
        .await
        .unwrap();
    let StoreResponse::LeaseId(lease) = response else {
        panic!("expected lease id");
    };
    node.write(StoreCommand::Put {
        key: "/status/objects/cluster/member-001".to_string(),
        value: "{}".to_string(),
        lease: Some(lease),
    })
    .await
    .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(20);
    loop {
        let response = node
            .read(StoreQuery::GetPrefix {
                prefix: "/status/objects/".to_string(),
            })
            .await
            .unwrap();
        let QueryResponse::Values(values) = response else {
            panic!("expected values");
        };
        if values.is_empty() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "expired lease was never swept"
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    server.close().await;
}

#[tokio::test]
async fn client_plane_rpc_roundtrip_over_tcp() {
    use meshgate::cluster::raft::{RpcMessage, RpcResponse, send_rpc};

    let dir = tempfile::tempdir().unwrap();
    let config = replica_config(dir.path().to_str().unwrap());
    let addr = config.raft_addr.clone();

    let node = ReplicaNode::new(config, false).await.unwrap();
    node.initialize_cluster().await.unwrap();
    node.wait_leader(Duration::from_secs(10)).await.unwrap();

    let response = send_rpc(
        &addr,
        &RpcMessage::ClientWrite(StoreCommand::Put {
            key: "/config/version".to_string(),
            value: "42".to_string(),
            lease: None,
        }),
    )
    .await
    .unwrap();
    assert!(matches!(
        response,
        RpcResponse::ClientWriteOk(StoreResponse::Ok)
    ));

    let response = send_rpc(
        &addr,
        &RpcMessage::ClientRead(StoreQuery::Get {
            key: "/config/version".to_string(),
        }),
    )
    .await
    .unwrap();
    match response {
        RpcResponse::ClientReadOk(QueryResponse::Value(value)) => {
            assert_eq!(value.as_deref(), Some("42"));
        }
        other => panic!("unexpected response: {:?}", other),
    }

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn snapshot_survives_replica_restart() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().to_str().unwrap();

    // First incarnation: a config low enough to snapshot quickly.
    let mut config = replica_config(data_dir);
    config.snapshot_threshold = 5;
    let raft_addr = config.raft_addr.clone();

    let node = ReplicaNode::new(config.clone(), false).await.unwrap();
    node.initialize_cluster().await.unwrap();
    node.wait_leader(Duration::from_secs(10)).await.unwrap();

    for i in 0..20 {
        node.write(StoreCommand::Put {
            key: format!("/config/objects/object-{:02}", i),
            value: i.to_string(),
            lease: None,
        })
        .await
        .unwrap();
    }
    node.write(StoreCommand::Noop).await.unwrap();

    // Give the snapshot builder a moment to persist, then stop.
    tokio::time::sleep(Duration::from_secs(1)).await;
    node.shutdown().await.unwrap();

    // Second incarnation over the same data dir restores the snapshot.
    let reborn = ReplicaNode::new(
        ReplicaConfig {
            raft_addr,
            ..config
        },
        false,
    )
    .await
    .unwrap();

    let QueryResponse::Values(values) = reborn
        .state_machine()
        .query(StoreQuery::GetPrefix {
            prefix: "/config/objects/".to_string(),
        })
        .await
    else {
        panic!("expected values");
    };
    assert!(
        !values.is_empty(),
        "restored state machine should hold snapshotted keys"
    );

    reborn.shutdown().await.unwrap();
}

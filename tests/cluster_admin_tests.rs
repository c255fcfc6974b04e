//! Admin-surface invariants driven through the in-memory cluster: object
//! round-trips, version monotonicity, status aggregation, and purge.

use meshgate::cluster::{AdminApi, ClusterApi, MockCluster, ObjectSpec};

fn spec(name: &str, kind: &str) -> ObjectSpec {
    let mut config = serde_json::Map::new();
    config.insert("port".to_string(), serde_json::json!(10080));
    config.insert("https".to_string(), serde_json::json!(false));
    ObjectSpec {
        name: name.to_string(),
        kind: kind.to_string(),
        config,
    }
}

#[tokio::test]
async fn put_object_then_get_object_returns_equal_spec() {
    let admin = AdminApi::new(MockCluster::new("member-001").await);

    let original = spec("http-server", "HTTPServer");
    admin.put_object(&original).await.unwrap();

    let fetched = admin.get_object("http-server").await.unwrap().unwrap();
    assert_eq!(fetched, original);
}

#[tokio::test]
async fn delete_object_then_get_object_returns_none() {
    let admin = AdminApi::new(MockCluster::new("member-001").await);

    admin.put_object(&spec("pipeline-a", "Pipeline")).await.unwrap();
    admin.delete_object("pipeline-a").await.unwrap();

    assert!(admin.get_object("pipeline-a").await.unwrap().is_none());
}

#[tokio::test]
async fn plus_one_version_yields_consecutive_versions() {
    let admin = AdminApi::new(MockCluster::new("member-001").await);

    let base = admin.get_version().await.unwrap();
    let mut expected = base;
    for _ in 0..5 {
        expected += 1;
        assert_eq!(admin.plus_one_version().await.unwrap(), expected);
    }
}

#[tokio::test]
async fn list_objects_sees_every_put() {
    let admin = AdminApi::new(MockCluster::new("member-001").await);

    for name in ["a", "b", "c"] {
        admin.put_object(&spec(name, "Pipeline")).await.unwrap();
    }

    let names: Vec<String> = admin
        .list_objects()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names.len(), 3);
    for name in ["a", "b", "c"] {
        assert!(names.contains(&name.to_string()));
    }
}

#[tokio::test]
async fn purge_member_removes_all_of_its_status_rows() {
    let cluster = MockCluster::new("member-001").await;

    // A peer with status rows of two kinds under its lease.
    let peer_lease = cluster.add_peer("member-002").await;
    cluster
        .put_under_peer_lease(
            "/status/objects/cluster/member-002",
            "{\"hb\":\"now\"}",
            peer_lease,
        )
        .await
        .unwrap();
    cluster
        .put_under_peer_lease(
            "/status/objects/pipeline/member-002",
            "{\"rps\":3}",
            peer_lease,
        )
        .await
        .unwrap();

    // Rows of the surviving member stay.
    cluster
        .put_under_lease("/status/objects/cluster/member-001", "{\"hb\":\"now\"}")
        .await
        .unwrap();

    let admin = AdminApi::new(cluster);
    admin.purge_member("member-002").await.unwrap();

    let rows = admin
        .cluster()
        .get_prefix(&admin.cluster().layout().status_objects_prefix())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows.keys().all(|k| !k.ends_with("/member-002")));
}

#[tokio::test]
async fn purge_member_unknown_target_names_the_missing_key() {
    let admin = AdminApi::new(MockCluster::new("member-001").await);

    let err = admin.purge_member("member-404").await.unwrap_err();
    assert!(err.is_panic());
    assert!(err.to_string().contains("member-404"));
}

#[tokio::test]
async fn status_rows_group_by_kind_and_member() {
    let cluster = MockCluster::new("member-001").await;
    let peer_lease = cluster.add_peer("member-002").await;

    cluster
        .put_under_lease("/status/objects/cluster/member-001", "{\"role\":\"writer\"}")
        .await
        .unwrap();
    cluster
        .put_under_peer_lease(
            "/status/objects/cluster/member-002",
            "{\"role\":\"reader\"}",
            peer_lease,
        )
        .await
        .unwrap();

    let admin = AdminApi::new(cluster);
    let status = admin.list_status_objects().await.unwrap();

    assert_eq!(status.len(), 1);
    let cluster_kind = &status["cluster"];
    assert_eq!(cluster_kind.len(), 2);
    assert_eq!(cluster_kind["member-001"]["role"], "writer");
    assert_eq!(cluster_kind["member-002"]["role"], "reader");
}

#[tokio::test]
async fn member_lease_key_survives_normal_operation() {
    let cluster = MockCluster::new("member-001").await;
    let lease_key = cluster.layout().lease();

    cluster.put("/config/objects/x", "{}").await.unwrap();
    cluster.delete("/config/objects/x").await.unwrap();

    assert!(cluster.get(&lease_key).await.unwrap().is_some());
}

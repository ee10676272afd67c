use crate::CatalogDB;
use ess_lib::*;
use serde_json::json;
use tempfile::TempDir;

fn create_test_db() -> (CatalogDB, TempDir) {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp = TempDir::new().expect("create temp dir");
    let db_path = tmp.path().join("catalog").join("ess.db");
    let db = CatalogDB::new(db_path.to_string_lossy().to_string()).expect("open catalog");
    (db, tmp)
}

fn add_test_edge(db: &CatalogDB, name: &str, total: u64, used: u64) -> i64 {
    let mut edge = Edge::new(name, EdgeType::Edge);
    edge.total_space = total;
    edge.used_space = used;
    db.add_edge(&edge).expect("add edge")
}

fn file_content(coll_id: i64, edge_id: i64, name: &str, max_id: u64) -> Content {
    Content {
        coll_id,
        edge_id,
        scope: "s".to_string(),
        name: name.to_string(),
        min_id: 1,
        max_id,
        content_type: ContentType::File,
        status: ContentStatus::Available,
        pfn: Some(format!("/cache/{}", name)),
        pfn_size: 100,
        ..Default::default()
    }
}

#[test]
fn test_edge_register_update_and_list() {
    let (db, _tmp) = create_test_db();
    let edge_id = add_test_edge(&db, "edge-a", 100, 10);
    assert!(edge_id > 0);

    let err = db
        .add_edge(&Edge::new("edge-a", EdgeType::Edge))
        .expect_err("duplicate edge name");
    assert!(err.is_duplicate());

    let mut edge = db.get_edge("edge-a").expect("get edge");
    assert_eq!(edge.edge_id, edge_id);
    assert_eq!(edge.free_space(), 90);
    edge.used_space = 60;
    edge.city = Some("Geneva".to_string());
    db.update_edge(&edge).expect("update edge");
    let edge = db.get_edge_by_id(edge_id).expect("get by id");
    assert_eq!(edge.used_space, 60);
    assert_eq!(edge.city.as_deref(), Some("Geneva"));

    assert!(db
        .update_edge(&Edge::new("missing", EdgeType::Edge))
        .expect_err("update missing")
        .is_not_found());
    assert!(db.get_edge("missing").expect_err("get missing").is_not_found());

    add_test_edge(&db, "edge-b", 10, 0);
    assert_eq!(db.list_edges(None).expect("list").len(), 2);
    db.delete_edge("edge-b").expect("delete");
    assert_eq!(db.list_edges(Some(EdgeStatus::Active)).expect("list").len(), 1);
}

#[test]
fn test_stale_edges_lose_heartbeat() {
    let (db, _tmp) = create_test_db();
    add_test_edge(&db, "edge-a", 100, 0);
    add_test_edge(&db, "edge-b", 100, 0);

    // Nothing is older than an hour ago.
    assert_eq!(db.mark_stale_edges(3600).expect("sweep"), 0);

    let marked = db
        .mark_edges_stale_before(unix_timestamp() + 10)
        .expect("sweep");
    assert_eq!(marked, 2);
    assert!(db.list_edges(Some(EdgeStatus::Active)).expect("list").is_empty());

    // A heartbeat brings an edge back.
    let mut edge = db.get_edge("edge-a").expect("get");
    assert_eq!(edge.status, EdgeStatus::LostHeartbeat);
    edge.status = EdgeStatus::Active;
    db.update_edge(&edge).expect("heartbeat");
    let active = db.list_edges(Some(EdgeStatus::Active)).expect("list");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].edge_name, "edge-a");
}

#[test]
fn test_collection_and_replica_crud() {
    let (db, _tmp) = create_test_db();
    let mut coll = Collection::new("s", "n");
    coll.coll_size = 4096;
    coll.total_files = 2;
    coll.coll_metadata = json!({"source": "manifest"});
    let coll_id = db.add_collection(&coll).expect("add collection");
    assert!(db.add_collection(&coll).expect_err("dup").is_duplicate());

    let mut stored = db.get_collection("s", "n").expect("get collection");
    assert_eq!(stored.coll_id, coll_id);
    assert_eq!(stored.coll_metadata["source"], "manifest");
    stored.global_status = CollectionStatus::Available;
    db.update_collection(&stored).expect("update");
    assert_eq!(
        db.get_collection_by_id(coll_id).expect("get").global_status,
        CollectionStatus::Available
    );

    let edge_id = add_test_edge(&db, "edge-a", 100, 0);
    let mut replica = CollectionReplica::new(coll_id, edge_id);
    db.upsert_collection_replica(&replica).expect("insert replica");
    replica.replicated_files = 2;
    replica.status = CollectionReplicaStatus::Available;
    db.upsert_collection_replica(&replica).expect("update replica");
    let stored = db.get_collection_replica(coll_id, edge_id).expect("get replica");
    assert_eq!(stored.replicated_files, 2);
    assert_eq!(db.list_collection_replicas(coll_id).expect("list").len(), 1);
    db.delete_collection_replica(coll_id, edge_id).expect("delete replica");
    db.delete_collection(coll_id).expect("delete collection");
    assert!(db.get_collection("s", "n").expect_err("gone").is_not_found());
}

#[test]
fn test_add_contents_is_idempotent() {
    let (db, _tmp) = create_test_db();
    let contents = vec![file_content(1, 1, "f1", 23), file_content(1, 1, "f2", 40)];
    assert_eq!(db.add_contents(&contents).expect("first add"), 2);
    assert_eq!(db.add_contents(&contents).expect("second add"), 0);
    assert_eq!(
        db.count_contents(&ContentFilter::for_collection(1, 1))
            .expect("count"),
        2
    );

    let err = db.add_content(&contents[0]).expect_err("single duplicate");
    assert!(err.is_duplicate());

    // Same range at another edge is a distinct row.
    let other_edge = file_content(1, 2, "f1", 23);
    assert!(db.add_content(&other_edge).expect("other edge") > 0);
}

#[test]
fn test_upsert_contents_refreshes_only_early_rows() {
    let (db, _tmp) = create_test_db();
    let mut missing = file_content(1, 1, "f1", 23);
    missing.status = ContentStatus::New;
    missing.pfn = None;
    let staged = file_content(1, 1, "f2", 10);
    db.add_contents(&[missing.clone(), staged.clone()]).expect("add");

    let mut fetched = missing.clone();
    fetched.status = ContentStatus::Available;
    fetched.pfn = Some("/cache/f1".to_string());
    let mut regressed = staged.clone();
    regressed.status = ContentStatus::New;

    let touched = db.upsert_contents(&[fetched, regressed]).expect("upsert");
    assert_eq!(touched, 1);

    let rows = db
        .get_contents(&ContentFilter::for_collection(1, 1))
        .expect("get");
    assert_eq!(rows.len(), 2);
    for row in rows {
        assert_eq!(row.status, ContentStatus::Available, "{}", row.name);
    }
}

#[test]
fn test_contents_statistics_and_best_match() {
    let (db, _tmp) = create_test_db();
    let file = file_content(1, 1, "f1", 23);
    let file_id = db.add_content(&file).expect("add file");
    let parts = file.split_into_partials(10);
    assert_eq!(db.add_contents(&parts).expect("add parts"), 3);

    let stats = db
        .get_contents_statistics(&ContentFilter::for_collection(1, 1))
        .expect("stats");
    assert_eq!(stats.len(), 2);
    let partial = stats
        .iter()
        .find(|s| s.content_type == ContentType::Partial)
        .expect("partial stats");
    assert_eq!(partial.status, ContentStatus::ToSplit);
    assert_eq!(partial.count, 3);

    let best = db
        .get_content_best_match(1, "s", "f1", 12, 18, None)
        .expect("best match");
    assert_eq!((best.min_id, best.max_id), (11, 20));
    let best = db
        .get_content_best_match(1, "s", "f1", 5, 15, None)
        .expect("spanning match");
    assert_eq!(best.content_id, file_id);
    assert!(db
        .get_content_best_match(1, "s", "f1", 12, 18, Some(ContentStatus::Available))
        .map(|c| c.content_id == file_id)
        .expect("available match"));
    assert!(db
        .get_content_best_match(1, "s", "f1", 1, 30, None)
        .expect_err("no cover")
        .is_not_found());

    let exact = db
        .get_content_by_range(1, "s", "f1", ContentType::Partial, 21, 23)
        .expect("exact");
    assert_eq!(exact.range_len(), 3);
}

#[test]
fn test_claim_contents_only_wins_once() {
    let (db, _tmp) = create_test_db();
    let file = file_content(1, 1, "f1", 23);
    db.add_contents(&file.split_into_partials(10)).expect("add parts");

    let filter = ContentFilter::for_collection(1, 1)
        .with_type(ContentType::Partial)
        .with_limit(2);
    let first = db
        .claim_contents(&filter, ContentStatus::ToSplit, ContentStatus::Splitting)
        .expect("claim");
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|c| c.status == ContentStatus::Splitting));

    let second = db
        .claim_contents(&filter, ContentStatus::ToSplit, ContentStatus::Splitting)
        .expect("claim rest");
    assert_eq!(second.len(), 1);
    let third = db
        .claim_contents(&filter, ContentStatus::ToSplit, ContentStatus::Splitting)
        .expect("claim none");
    assert!(third.is_empty());

    assert!(matches!(
        db.claim_contents(&filter, ContentStatus::ToSplit, ContentStatus::Removed),
        Err(EssError::InvalidStateTransition(_))
    ));
}

#[test]
fn test_update_contents_by_id_respects_expected_status() {
    let (db, _tmp) = create_test_db();
    let mut content = file_content(1, 1, "f1", 23);
    content.status = ContentStatus::StagingOut;
    let content_id = db.add_content(&content).expect("add");

    let update = ContentUpdate::new(content_id)
        .status(ContentStatus::Available)
        .location("http://store/b-1/f1", 2048)
        .success();
    // Guard on the wrong status: nothing changes.
    let err = db
        .update_contents_by_id(&[update.clone()], Some(ContentStatus::ToStagedOut))
        .expect_err("not a successor of TOSTAGEDOUT");
    assert!(err.to_string().contains("TOSTAGEDOUT"));
    assert_eq!(
        db.update_contents_by_id(&[ContentUpdate::new(content_id).failure(7)], Some(ContentStatus::ToSplit))
            .expect("guarded miss"),
        0
    );

    assert_eq!(
        db.update_contents_by_id(&[update], Some(ContentStatus::StagingOut))
            .expect("update"),
        1
    );
    let stored = db.get_content(content_id).expect("get");
    assert_eq!(stored.status, ContentStatus::Available);
    assert_eq!(stored.pfn.as_deref(), Some("http://store/b-1/f1"));
    assert_eq!(stored.pfn_size, 2048);
    assert_eq!(stored.num_success, 1);
    assert_eq!(stored.num_failure, 0);
}

#[test]
fn test_request_transition_is_compare_and_swap() {
    let (db, _tmp) = create_test_db();
    let mut request = Request::new_partial("s", "n", 10);
    request.request_meta = json!({"caller": "job-1"});
    let request_id = db.add_request(&request).expect("add request");

    let claim = RequestUpdate::status(RequestStatus::Brokering);
    assert!(db
        .transition_request(request_id, RequestStatus::New, &claim)
        .expect("first claim"));
    assert!(!db
        .transition_request(request_id, RequestStatus::New, &claim)
        .expect("second claim loses"));

    let err = db
        .transition_request(
            request_id,
            RequestStatus::Brokering,
            &RequestUpdate::status(RequestStatus::Available),
        )
        .expect_err("not a workflow edge");
    assert!(matches!(err, EssError::InvalidStateTransition(_)));

    let meta = ProcessingMeta {
        coll_id: Some(3),
        size: Some(60),
        ..Default::default()
    };
    let assign = RequestUpdate::status(RequestStatus::Assigning)
        .with_edge(2)
        .with_meta(meta);
    assert!(db
        .transition_request(request_id, RequestStatus::Brokering, &assign)
        .expect("assign"));
    let stored = db.get_request(request_id).expect("get");
    assert_eq!(stored.status, RequestStatus::Assigning);
    assert_eq!(stored.edge_id, Some(2));
    assert_eq!(stored.processing_meta.coll_id, Some(3));
    assert_eq!(stored.request_meta["caller"], "job-1");
    assert_eq!(stored.granularity_level, Some(10));
}

#[test]
fn test_claim_requests_and_filters() {
    let (db, _tmp) = create_test_db();
    for i in 0..3 {
        let mut request = Request::new("s", &format!("n{}", i), GranularityType::File);
        request.priority = i;
        db.add_request(&request).expect("add");
    }
    let claimed = db
        .claim_requests(
            &RequestFilter::default().with_limit(2),
            RequestStatus::New,
            RequestStatus::Brokering,
        )
        .expect("claim");
    assert_eq!(claimed.len(), 2);
    // Highest priority first.
    assert_eq!(claimed[0].name, "n2");
    assert_eq!(claimed[1].name, "n1");

    let brokering = db
        .get_requests(&RequestFilter::by_status(RequestStatus::Brokering))
        .expect("get");
    assert_eq!(brokering.len(), 2);
    let left = db
        .get_requests(&RequestFilter::by_status(RequestStatus::New))
        .expect("get");
    assert_eq!(left.len(), 1);
}

#[test]
fn test_shadow_request_and_reset() {
    let (db, _tmp) = create_test_db();
    let mut shadow = Request::new("s", "n", GranularityType::File);
    shadow.status = RequestStatus::Assigned;
    shadow.processing_meta.original_request_id = Some(42);
    let local_id = db.add_request(&shadow).expect("add shadow");
    assert!(db.add_request(&shadow).expect_err("dup shadow").is_duplicate());
    assert_eq!(
        db.get_request_by_original(42).expect("by original").request_id,
        local_id
    );

    let mut failed = Request::new("s", "m", GranularityType::File);
    failed.status = RequestStatus::Error;
    failed.errors = Some(RequestErrors::new("no data"));
    let failed_id = db.add_request(&failed).expect("add failed");
    let reset = db.reset_request(failed_id).expect("reset");
    assert_eq!(reset.status, RequestStatus::New);
    let stored = db.get_request(failed_id).expect("get");
    assert_eq!(stored.status, RequestStatus::New);
    assert!(stored.errors.is_none());
    assert_eq!(stored.processing_meta.retries, 1);

    db.delete_request(failed_id).expect("delete");
    assert!(db.get_request(failed_id).expect_err("gone").is_not_found());
}

#[test]
fn test_requeue_stale_requests_and_clear_error() {
    let (db, _tmp) = create_test_db();
    let mut stuck = Request::new("s", "n", GranularityType::File);
    stuck.status = RequestStatus::Precaching;
    stuck.edge_id = Some(3);
    let stuck_id = db.add_request(&stuck).expect("add stuck");
    let mut elsewhere = stuck.clone();
    elsewhere.name = "m".to_string();
    elsewhere.edge_id = Some(4);
    let elsewhere_id = db.add_request(&elsewhere).expect("add elsewhere");

    let now = unix_timestamp();
    let fresh = db
        .requeue_stale_requests(
            RequestStatus::Precaching,
            RequestStatus::Assigned,
            Some(3),
            now.saturating_sub(3600),
            "pre-cache interrupted",
        )
        .expect("fresh claims stay");
    assert_eq!(fresh, 0);

    let requeued = db
        .requeue_stale_requests(
            RequestStatus::Precaching,
            RequestStatus::Assigned,
            Some(3),
            now + 10,
            "pre-cache interrupted",
        )
        .expect("requeue");
    assert_eq!(requeued, 1);
    let stored = db.get_request(stuck_id).expect("get");
    assert_eq!(stored.status, RequestStatus::Assigned);
    assert_eq!(
        stored.errors.map(|e| e.message).as_deref(),
        Some("pre-cache interrupted")
    );
    assert_eq!(
        db.get_request(elsewhere_id).expect("get").status,
        RequestStatus::Precaching
    );

    assert!(db
        .transition_request(
            stuck_id,
            RequestStatus::Assigned,
            &RequestUpdate::status(RequestStatus::Precaching).clear_error(),
        )
        .expect("claim"));
    assert!(db.get_request(stuck_id).expect("get").errors.is_none());
}

use crate::{head_error_reply, CatalogDB, HeadClient};
use ess_lib::*;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use warp::http::StatusCode as WarpStatus;
use warp::Filter;

fn reply<T: Serialize>(result: EssResult<T>) -> warp::reply::WithStatus<warp::reply::Json> {
    match result {
        Ok(value) => warp::reply::with_status(warp::reply::json(&value), WarpStatus::OK),
        Err(err) => {
            let status = WarpStatus::from_u16(err.status_code().as_u16())
                .unwrap_or(WarpStatus::INTERNAL_SERVER_ERROR);
            warp::reply::with_status(warp::reply::json(&head_error_reply(&err)), status)
        }
    }
}

/// A minimal head service over an in-memory catalog.
async fn start_test_head(db: Arc<CatalogDB>) -> SocketAddr {
    let with_db = warp::any().map(move || db.clone());

    let get_edge = warp::path!("edges" / String)
        .and(warp::get())
        .and(with_db.clone())
        .map(|name: String, db: Arc<CatalogDB>| reply(db.get_edge(&name)));
    let post_edge = warp::path!("edges" / String)
        .and(warp::post())
        .and(warp::body::json())
        .and(with_db.clone())
        .map(|_name: String, edge: Edge, db: Arc<CatalogDB>| {
            reply(db.add_edge(&edge).map(|id| json!({ "edge_id": id })))
        });
    let put_edge = warp::path!("edges" / String)
        .and(warp::put())
        .and(warp::body::json())
        .and(with_db.clone())
        .map(|_name: String, edge: Edge, db: Arc<CatalogDB>| reply(db.update_edge(&edge)));
    let get_collection = warp::path!("catalog" / "collection" / String / String)
        .and(warp::get())
        .and(with_db.clone())
        .map(|scope: String, name: String, db: Arc<CatalogDB>| {
            reply(db.get_collection(&scope, &name))
        });
    let get_requests = warp::path!("requests")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_db.clone())
        .map(|query: HashMap<String, String>, db: Arc<CatalogDB>| {
            let result = (|| {
                let edge_name = query.get("edge_name").cloned().unwrap_or_default();
                let status: RequestStatus = query
                    .get("status")
                    .map(|s| s.as_str())
                    .unwrap_or("NEW")
                    .parse()?;
                let edge = db.get_edge(&edge_name)?;
                db.get_requests(&RequestFilter::by_status(status).at_edge(edge.edge_id))
            })();
            reply(result)
        });
    let put_request = warp::path!("requests" / i64)
        .and(warp::put())
        .and(warp::body::json())
        .and(with_db.clone())
        .map(|id: i64, update: RequestUpdate, db: Arc<CatalogDB>| {
            reply(db.update_request(id, &update))
        });

    let routes = get_edge
        .or(post_edge)
        .or(put_edge)
        .or(get_collection)
        .or(get_requests)
        .or(put_request);
    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

#[tokio::test]
async fn test_remote_head_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let head_db = Arc::new(CatalogDB::new_in_memory().expect("head db"));
    let addr = start_test_head(head_db.clone()).await;
    let client = HeadClient::new_remote(&format!("http://{}/", addr), Duration::from_secs(5), 1)
        .expect("client");
    assert!(client.is_remote());

    let err = client.get_edge("edge-a").await.expect_err("not registered");
    assert!(err.is_not_found(), "{:?}", err);

    let mut edge = Edge::new("edge-a", EdgeType::Edge);
    edge.total_space = 1000;
    let edge_id = client.register_edge(&edge).await.expect("register");
    assert!(edge_id > 0);
    let err = client.register_edge(&edge).await.expect_err("duplicate");
    assert!(err.is_duplicate(), "{:?}", err);

    edge.used_space = 400;
    client.update_edge(&edge).await.expect("update");
    assert_eq!(head_db.get_edge("edge-a").expect("edge").used_space, 400);

    let mut request = Request::new("s", "n", GranularityType::File);
    request.status = RequestStatus::Assigning;
    request.edge_id = Some(edge_id);
    let request_id = head_db.add_request(&request).expect("add request");

    let pulled = client
        .get_requests("edge-a", RequestStatus::Assigning)
        .await
        .expect("pull");
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0].request_id, request_id);

    client
        .update_request(request_id, &RequestUpdate::status(RequestStatus::Assigned))
        .await
        .expect("report back");
    assert_eq!(
        head_db.get_request(request_id).expect("get").status,
        RequestStatus::Assigned
    );

    assert!(client
        .get_collection("s", "missing")
        .await
        .expect_err("no collection")
        .is_not_found());
}

#[tokio::test]
async fn test_remote_head_unreachable_is_connection_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = HeadClient::new_remote(&format!("http://{}", addr), Duration::from_secs(2), 2)
        .expect("client");
    let err = client.get_edge("edge-a").await.expect_err("nothing listening");
    assert!(err.is_connection_error(), "{:?}", err);
}

#[tokio::test]
async fn test_in_process_head_rebases_contents() {
    let head_db = Arc::new(CatalogDB::new_in_memory().expect("head db"));
    let head_edge_id = head_db
        .add_edge(&Edge::new("edge-a", EdgeType::Edge))
        .expect("edge");
    let head_coll_id = head_db
        .add_collection(&Collection::new("s", "n"))
        .expect("collection");
    let client = HeadClient::new_in_process(head_db.clone());

    let local = Content {
        content_id: 99,
        coll_id: 500,
        edge_id: 600,
        scope: "s".to_string(),
        name: "f1".to_string(),
        min_id: 1,
        max_id: 10,
        status: ContentStatus::Available,
        ..Default::default()
    };
    let added = client
        .add_contents("s", "n", "edge-a", &[local.clone()])
        .await
        .expect("sync");
    assert_eq!(added, 1);
    assert_eq!(
        client
            .add_contents("s", "n", "edge-a", &[local])
            .await
            .expect("resync"),
        0
    );

    let mirrored = client.get_contents("s", "n", "edge-a").await.expect("get");
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0].coll_id, head_coll_id);
    assert_eq!(mirrored[0].edge_id, head_edge_id);
}

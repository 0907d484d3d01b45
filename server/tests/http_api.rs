//! HTTP-level tests against a bootstrapped single-node server: the full path
//! from request through proposal, commit, apply, and shared-lock reads.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{test, web, App};
use groupchat_raft::RaftNode;
use groupchat_server::middleware::ClusterGuard;
use groupchat_server::{handlers, ChatServer, ServerConfig};

async fn bootstrapped_server() -> (tempfile::TempDir, Arc<ChatServer>) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let server = ChatServer::new(ServerConfig {
        port: 0,
        raft_port: 0,
        data_dir: tmp.path().to_path_buf(),
    });

    let data_dir = tmp.path().to_path_buf();
    let bootstrap = Arc::clone(&server)
        .bootstrap(move || RaftNode::bootstrap("http://127.0.0.1:18081", &[], &data_dir));
    tokio::time::timeout(Duration::from_secs(60), bootstrap)
        .await
        .expect("bootstrap completed in time");
    assert!(server.cluster_started());
    (tmp, server)
}

macro_rules! chat_app {
    ($server:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::from(Arc::clone(&$server)))
                .wrap(ClusterGuard::new(Arc::clone(&$server)))
                .configure(handlers::configure),
        )
        .await
    };
}

async fn body_string(resp: actix_web::dev::ServiceResponse) -> String {
    let bytes = test::read_body(resp).await;
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

#[actix_web::test]
async fn requests_before_bootstrap_are_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let server = ChatServer::new(ServerConfig {
        port: 0,
        raft_port: 0,
        data_dir: tmp.path().to_path_buf(),
    });
    let app = chat_app!(server);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/checkCluster").to_request())
        .await;
    assert_eq!(resp.status(), 400);
    assert_eq!(body_string(resp).await, "Error: cluster has not started yet");

    // /updateCluster passes the guard, but an empty IP list has no local IP.
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/updateCluster")
            .set_json(Vec::<String>::new())
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
    assert_eq!(body_string(resp).await, "Error: local ip not exists in cluster");
}

#[actix_web::test]
async fn full_chat_flow_over_http() {
    let (_tmp, server) = bootstrapped_server().await;
    let app = chat_app!(server);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/checkCluster").to_request())
        .await;
    assert!(resp.status().is_success());

    // Create a user and query it back; omitted fields default to empty.
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/user")
            .set_json(serde_json::json!({"username": "alice", "password": "p"}))
            .to_request(),
    )
    .await;
    assert!(resp.status().is_success());

    let resp = test::call_service(&app, test::TestRequest::get().uri("/user/alice").to_request())
        .await;
    assert!(resp.status().is_success());
    let user: serde_json::Value =
        serde_json::from_str(&body_string(resp).await).expect("user json");
    assert_eq!(user["firstName"], "");
    assert_eq!(user["email"], "");

    // Duplicate username is a command-level failure.
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/user")
            .set_json(serde_json::json!({"username": "alice", "password": "q"}))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
    assert_eq!(body_string(resp).await, "Error: user already exists");

    // Login with the wrong, then the right password.
    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/userLogin?username=alice&password=wrong")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
    assert_eq!(body_string(resp).await, "Error: password is wrong");

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/userLogin?username=alice&password=p")
            .to_request(),
    )
    .await;
    assert!(resp.status().is_success());
    let token = body_string(resp).await;
    assert!(!token.is_empty());
    let bearer = ("Authorization", format!("Bearer {token}"));

    // Room create returns the assigned id as text.
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/room")
            .insert_header(bearer.clone())
            .set_json(serde_json::json!({"name": "r1"}))
            .to_request(),
    )
    .await;
    assert!(resp.status().is_success());
    assert_eq!(body_string(resp).await, "1");

    let resp = test::call_service(&app, test::TestRequest::get().uri("/room/1").to_request())
        .await;
    assert!(resp.status().is_success());
    assert_eq!(body_string(resp).await, "r1");

    let resp = test::call_service(&app, test::TestRequest::get().uri("/room/999").to_request())
        .await;
    assert_eq!(resp.status(), 400);
    assert_eq!(body_string(resp).await, "Error: room not exists");

    // Enter the room and send messages m1..m5.
    let resp = test::call_service(
        &app,
        test::TestRequest::put()
            .uri("/room/1/enter")
            .insert_header(bearer.clone())
            .to_request(),
    )
    .await;
    assert!(resp.status().is_success());

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/room/1/users").to_request(),
    )
    .await;
    assert!(resp.status().is_success());
    assert_eq!(body_string(resp).await, "[\"alice\"]");

    for i in 1..=5 {
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/message/send")
                .insert_header(bearer.clone())
                .set_json(serde_json::json!({"id": format!("m{i}"), "text": "hi"}))
                .to_request(),
        )
        .await;
        assert!(resp.status().is_success());
    }

    // Retrieval pages newest first.
    let page = |index: i64, size: i64| {
        serde_json::json!({"pageIndex": index, "pageSize": size})
    };
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/message/retrieve")
            .insert_header(bearer.clone())
            .set_json(page(0, 3))
            .to_request(),
    )
    .await;
    assert!(resp.status().is_success());
    let messages: serde_json::Value =
        serde_json::from_str(&body_string(resp).await).expect("messages json");
    let ids: Vec<&str> = messages
        .as_array()
        .expect("array")
        .iter()
        .map(|m| m["id"].as_str().expect("id"))
        .collect();
    assert_eq!(ids, vec!["m5", "m4", "m3"]);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/message/retrieve")
            .insert_header(bearer.clone())
            .set_json(page(1, 3))
            .to_request(),
    )
    .await;
    let messages: serde_json::Value =
        serde_json::from_str(&body_string(resp).await).expect("messages json");
    let ids: Vec<&str> = messages
        .as_array()
        .expect("array")
        .iter()
        .map(|m| m["id"].as_str().expect("id"))
        .collect();
    assert_eq!(ids, vec!["m2", "m1"]);

    // Room list, newest first, ids stringified.
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/roomList")
            .set_json(page(0, 10))
            .to_request(),
    )
    .await;
    let rooms: serde_json::Value =
        serde_json::from_str(&body_string(resp).await).expect("rooms json");
    assert_eq!(rooms[0]["id"], "1");
    assert_eq!(rooms[0]["name"], "r1");

    // Auth failures.
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/message/send")
            .set_json(serde_json::json!({"id": "m6", "text": "hi"}))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
    assert_eq!(body_string(resp).await, "Error: token is missing");

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/message/send")
            .insert_header(("Authorization", "Bearer bogus"))
            .set_json(serde_json::json!({"id": "m6", "text": "hi"}))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
    assert_eq!(body_string(resp).await, "Error: token is invalid");
}

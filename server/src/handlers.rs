//! HTTP handler adapter: translates requests into proposals against the
//! consensus core and shared-lock reads of the chat state.
//!
//! Mutations go through `propose_raft_command` and return once this replica
//! has applied them. Queries read directly under the shared lock and may be
//! stale on followers; that is accepted for this API.

use std::net::{IpAddr, UdpSocket};

use actix_web::http::header;
use actix_web::{get, post, put, web, HttpRequest, HttpResponse};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use groupchat_raft::{CommandError, CommandKind, CommandOutput, RaftNode};

use crate::auth::{self, AuthedUser};
use crate::errors::ApiError;
use crate::pagination::page_range;
use crate::server::ChatServer;

fn parse_json<T: DeserializeOwned>(body: &web::Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(ApiError::bad_request)
}

fn text(body: String) -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain").body(body)
}

/// An address is local iff a socket can bind to it.
fn find_local_ip(cluster_ips: &[String]) -> Option<String> {
    for ip in cluster_ips {
        if let Ok(addr) = ip.parse::<IpAddr>() {
            if UdpSocket::bind((addr, 0)).is_ok() {
                return Some(ip.clone());
            }
        }
    }
    None
}

#[post("/updateCluster")]
async fn update_cluster(
    server: web::Data<ChatServer>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let cluster_ips: Vec<String> = parse_json(&body)?;
    let Some(local_ip) = find_local_ip(&cluster_ips) else {
        return Err(ApiError::BadRequest("local ip not exists in cluster".to_string()));
    };

    let config = server.config().clone();
    let local_url = format!("http://{local_ip}:{}", config.raft_port);
    let local_client_url = format!("http://{local_ip}:{}", config.port);

    // Forward once per cluster: the Referer header breaks the loop.
    let forward = req.headers().get(header::REFERER).is_none();
    let mut remote_urls = Vec::new();
    for ip in &cluster_ips {
        if *ip == local_ip {
            continue;
        }
        remote_urls.push(format!("http://{ip}:{}", config.raft_port));
        if forward {
            let target = format!("http://{ip}:{}/updateCluster", config.port);
            let referer = local_client_url.clone();
            let ips = cluster_ips.clone();
            tokio::spawn(async move {
                log::info!("forwarding updateCluster request to {target}");
                let client = reqwest::Client::new();
                let sent = client
                    .post(&target)
                    .header(reqwest::header::REFERER, referer)
                    .json(&ips)
                    .send()
                    .await;
                match sent {
                    Ok(resp) if !resp.status().is_success() => {
                        log::warn!(
                            "forwarded updateCluster to {target}, unexpected status {}",
                            resp.status()
                        );
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("failed to forward updateCluster to {target}: {e}"),
                }
            });
        }
    }

    log::info!(
        "starting to bootstrap a new raft cluster, local {local_url}, remotes {remote_urls:?}"
    );
    let server = server.into_inner();
    tokio::spawn(async move {
        server
            .bootstrap(move || RaftNode::bootstrap(&local_url, &remote_urls, &config.data_dir))
            .await;
    });
    Ok(HttpResponse::Ok().finish())
}

/// Readiness probe; reachable only once the cluster has started.
#[get("/checkCluster")]
async fn check_cluster() -> HttpResponse {
    HttpResponse::Ok().finish()
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    #[serde(default)]
    username: String,
    #[serde(default, rename = "firstName")]
    first_name: String,
    #[serde(default, rename = "lastName")]
    last_name: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    phone: String,
}

#[post("/user")]
async fn create_user(
    server: web::Data<ChatServer>,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let user: CreateUserRequest = parse_json(&body)?;
    server
        .propose_raft_command(CommandKind::CreateUser {
            username: user.username,
            first_name: user.first_name,
            last_name: user.last_name,
            email: user.email,
            password: user.password,
            phone: user.phone,
        })
        .await?;
    Ok(HttpResponse::Ok().finish())
}

#[derive(Debug, Serialize)]
struct UserInfoResponse {
    #[serde(rename = "firstName")]
    first_name: String,
    #[serde(rename = "lastName")]
    last_name: String,
    email: String,
    phone: String,
}

#[get("/user/{name}")]
async fn query_user(
    server: web::Data<ChatServer>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let name = path.into_inner();
    let state = server.state.read();
    let user = state
        .users
        .get(&name)
        .ok_or(ApiError::Command(CommandError::UserNotExists))?;
    Ok(HttpResponse::Ok().json(UserInfoResponse {
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        email: user.email.clone(),
        phone: user.phone.clone(),
    }))
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[get("/userLogin")]
async fn user_login(
    server: web::Data<ChatServer>,
    query: web::Query<LoginQuery>,
) -> Result<HttpResponse, ApiError> {
    let aead = server.aead().ok_or(ApiError::ClusterNotStarted)?;
    let state = server.state.read();
    let user = state
        .users
        .get(&query.username)
        .ok_or(ApiError::Command(CommandError::UserNotExists))?;
    if user.password != query.password {
        return Err(ApiError::WrongPassword);
    }
    let token = auth::generate_token(aead, &query.username)?;
    Ok(text(token))
}

#[derive(Debug, Deserialize)]
struct CreateRoomRequest {
    #[serde(default)]
    name: String,
}

#[post("/room")]
async fn create_room(
    server: web::Data<ChatServer>,
    _user: AuthedUser,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let room: CreateRoomRequest = parse_json(&body)?;
    let output = server
        .propose_raft_command(CommandKind::CreateRoom { name: room.name })
        .await?;
    let CommandOutput::RoomId(id) = output else {
        return Err(ApiError::BadRequest("unexpected command result".to_string()));
    };
    Ok(text(id.to_string()))
}

fn parse_room_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse::<i64>()
        .map_err(|_| ApiError::Command(CommandError::RoomNotExists))
}

#[get("/room/{id}")]
async fn query_room(
    server: web::Data<ChatServer>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = parse_room_id(&path.into_inner())?;
    let state = server.state.read();
    let room = state
        .rooms
        .get(&id)
        .ok_or(ApiError::Command(CommandError::RoomNotExists))?;
    Ok(text(room.name.clone()))
}

#[derive(Debug, Deserialize)]
struct PageRequest {
    #[serde(default, rename = "pageIndex")]
    page_index: i64,
    #[serde(default, rename = "pageSize")]
    page_size: i64,
}

#[derive(Debug, Serialize)]
struct RoomSummary {
    name: String,
    id: String,
}

#[post("/roomList")]
async fn room_list(
    server: web::Data<ChatServer>,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let page: PageRequest = parse_json(&body)?;
    let state = server.state.read();
    let (start, end) = page_range(state.room_list.len(), page.page_index, page.page_size);
    let mut rooms = Vec::with_capacity(end - start);
    for i in (start..end).rev() {
        let id = state.room_list[i];
        if let Some(room) = state.rooms.get(&id) {
            rooms.push(RoomSummary {
                name: room.name.clone(),
                id: id.to_string(),
            });
        }
    }
    Ok(HttpResponse::Ok().json(rooms))
}

#[get("/room/{id}/users")]
async fn room_users(
    server: web::Data<ChatServer>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = parse_room_id(&path.into_inner())?;
    let state = server.state.read();
    let room = state
        .rooms
        .get(&id)
        .ok_or(ApiError::Command(CommandError::RoomNotExists))?;
    Ok(HttpResponse::Ok().json(&room.users))
}

#[put("/room/{id}/enter")]
async fn enter_room(
    server: web::Data<ChatServer>,
    user: AuthedUser,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let room_id = parse_room_id(&path.into_inner())?;
    server
        .propose_raft_command(CommandKind::EnterRoom {
            username: user.username,
            room_id,
        })
        .await?;
    Ok(HttpResponse::Ok().finish())
}

#[put("/roomLeave")]
async fn leave_room(
    server: web::Data<ChatServer>,
    user: AuthedUser,
) -> Result<HttpResponse, ApiError> {
    server
        .propose_raft_command(CommandKind::LeaveRoom {
            username: user.username,
        })
        .await?;
    Ok(HttpResponse::Ok().finish())
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    #[serde(default)]
    id: String,
    #[serde(default)]
    text: String,
}

#[post("/message/send")]
async fn send_message(
    server: web::Data<ChatServer>,
    user: AuthedUser,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let message: SendMessageRequest = parse_json(&body)?;
    server
        .propose_raft_command(CommandKind::SendMessage {
            id: message.id,
            ts: chrono::Utc::now().timestamp(),
            text: message.text,
            username: user.username,
        })
        .await?;
    Ok(HttpResponse::Ok().finish())
}

#[derive(Debug, Serialize)]
struct MessageView {
    id: String,
    text: String,
    timestamp: String,
}

#[post("/message/retrieve")]
async fn retrieve_messages(
    server: web::Data<ChatServer>,
    user: AuthedUser,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let page: PageRequest = parse_json(&body)?;
    let state = server.state.read();
    let room_id = state
        .users
        .get(&user.username)
        .ok_or(ApiError::Command(CommandError::UserNotExists))?
        .room_id;
    if room_id <= 0 {
        return Err(ApiError::Command(CommandError::UserOutOfRoom));
    }
    let room = state
        .rooms
        .get(&room_id)
        .ok_or(ApiError::Command(CommandError::RoomNotExists))?;

    let (start, end) = page_range(room.messages.len(), page.page_index, page.page_size);
    let mut messages = Vec::with_capacity(end - start);
    for i in (start..end).rev() {
        let message = &room.messages[i];
        messages.push(MessageView {
            id: message.id.clone(),
            text: message.text.clone(),
            timestamp: message.ts.to_string(),
        });
    }
    Ok(HttpResponse::Ok().json(messages))
}

/// Mount the full client API.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(update_cluster)
        .service(check_cluster)
        .service(create_user)
        .service(query_user)
        .service(user_login)
        .service(create_room)
        .service(query_room)
        .service(room_list)
        .service(room_users)
        .service(enter_room)
        .service(leave_room)
        .service(send_message)
        .service(retrieve_messages);
}

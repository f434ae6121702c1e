//! Request routing and handlers

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use msgpak_session::{Broker, IpAllowList};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::AdminError;

/// Shared state of the admin endpoint
pub struct AdminState {
    /// Broker the tasks are queued on
    pub broker: Arc<Broker>,
    /// Remote addresses allowed to call the endpoint; empty means loopback only
    pub allow_list: IpAllowList,
    /// Request body limit
    pub max_body_size: usize,
}

impl AdminState {
    /// State with a body limit sized for the broker's largest task
    pub fn new(broker: Arc<Broker>, allow_list: IpAllowList) -> Self {
        // Percent-encoding can triple the data, plus room for the other fields.
        let max_body_size = broker.config().queue.max_message_size.saturating_mul(3) + 4096;
        Self {
            broker,
            allow_list,
            max_body_size,
        }
    }

    fn permits(&self, ip: IpAddr) -> bool {
        if self.allow_list.is_empty() {
            return is_loopback(ip);
        }
        self.allow_list.permits(ip)
    }
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.is_loopback(),
            None => v6.is_loopback(),
        },
        IpAddr::V4(v4) => v4.is_loopback(),
    }
}

#[derive(Serialize)]
struct PeersBody {
    count: usize,
    peers: Vec<msgpak_session::PeerInfo>,
}

/// Serve one request. Never fails at the hyper level; errors become JSON
/// responses with the matching status.
pub async fn handle_request<B>(
    state: Arc<AdminState>,
    remote: SocketAddr,
    req: Request<B>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let result = route(&state, remote, req).await;
    let response = match result {
        Ok(resp) => resp,
        Err(e) => {
            match &e {
                AdminError::Unauthorized | AdminError::Forbidden => {
                    warn!("Admin {} {} from {} refused: {}", method, path, remote, e)
                }
                _ => debug!("Admin {} {} from {} failed: {}", method, path, remote, e),
            }
            e.into_response()
        }
    };
    Ok(response)
}

async fn route<B>(
    state: &AdminState,
    remote: SocketAddr,
    req: Request<B>,
) -> Result<Response<Full<Bytes>>, AdminError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if !state.permits(remote.ip()) {
        return Err(AdminError::Forbidden);
    }
    check_auth(state, req.headers())?;

    match (req.method(), req.uri().path()) {
        (&Method::GET, "/msgsend") | (&Method::POST, "/msgsend") => {
            msgsend(state, remote, req).await
        }
        (&Method::GET, "/peers") => peers(state),
        (_, "/msgsend") | (_, "/peers") => Err(AdminError::MethodNotAllowed),
        _ => Err(AdminError::NotFound),
    }
}

fn check_auth(state: &AdminState, headers: &HeaderMap) -> Result<(), AdminError> {
    let (user, password) = basic_credentials(headers).ok_or(AdminError::Unauthorized)?;
    if state.broker.config().credentials.matches(&user, &password) {
        Ok(())
    } else {
        Err(AdminError::Unauthorized)
    }
}

/// Decode an `Authorization: Basic` header into user and password
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

async fn msgsend<B>(
    state: &AdminState,
    remote: SocketAddr,
    req: Request<B>,
) -> Result<Response<Full<Bytes>>, AdminError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();

    let mut params = form_params(parts.uri.query().unwrap_or_default().as_bytes());
    if parts.method == Method::POST {
        let body = Limited::new(body, state.max_body_size)
            .collect()
            .await
            .map_err(|_| AdminError::PayloadTooLarge)?
            .to_bytes();
        params.extend(form_params(&body));
    }

    let cmd = params.remove("cmd").unwrap_or_default();
    let data = params.remove("data").unwrap_or_default();

    let summary = state.broker.enqueue_all(&cmd, &data).await?;
    if summary.all_full() {
        return Err(AdminError::Unavailable);
    }

    info!(
        "Admin task {} from {} queued for {} peer(s)",
        cmd.trim(),
        remote,
        summary.accepted
    );
    Ok(json_response(StatusCode::ACCEPTED, &summary))
}

fn peers(state: &AdminState) -> Result<Response<Full<Bytes>>, AdminError> {
    let peers = state.broker.peers();
    Ok(json_response(
        StatusCode::OK,
        &PeersBody {
            count: peers.len(),
            peers,
        },
    ))
}

fn form_params(input: &[u8]) -> HashMap<String, String> {
    url::form_urlencoded::parse(input).into_owned().collect()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(e) => {
            warn!("Admin response serialization failed: {}", e);
            b"{}".to_vec()
        }
    };
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

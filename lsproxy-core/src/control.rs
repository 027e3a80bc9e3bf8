//! Control-plane HTTP endpoint.
//!
//! External tools (e.g. an editor extension that cannot speak to the server
//! directly) POST `{method, params}` here; the payload is issued through the
//! relay's outward request API and the eventual result comes back as the
//! response body. The listening port is published in a discovery file keyed
//! by the workspace root, so callers need no side channel to find us.

use crate::relay::RelayHandle;
use anyhow::Result;
use axum::{
    body::to_bytes,
    extract::{Request, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Deserialize)]
struct ControlRequest {
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

/// Binds the control-plane listener on an OS-assigned loopback port.
pub async fn bind_control_listener() -> Result<TcpListener> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    info!("control plane bound to {}", listener.local_addr()?);
    Ok(listener)
}

pub fn control_router(relay: RelayHandle) -> Router {
    // Any path is accepted; only the method and body matter.
    Router::new().fallback(control_handler).with_state(relay)
}

pub async fn serve_control(listener: TcpListener, relay: RelayHandle) -> Result<()> {
    axum::serve(listener, control_router(relay)).await?;
    Ok(())
}

async fn control_handler(State(relay): State<RelayHandle>, request: Request) -> Response {
    if request.method() != Method::POST {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let body = match to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    // Malformed input is rejected before it can reach the relay.
    let control_request: ControlRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("rejecting malformed control request: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match relay
        .request(&control_request.method, control_request.params)
        .await
    {
        // Both outcomes of the pending request travel back as the body: the
        // response result on success, the error shape on failure.
        Ok(Ok(result)) => Json(result).into_response(),
        Ok(Err(rpc_error)) => match serde_json::to_value(&rpc_error) {
            Ok(value) => Json(value).into_response(),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        },
        Err(e) => {
            error!("control request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Where the chosen port is published for a given workspace.
///
/// The file name is the hex-encoded workspace root (trailing slash
/// stripped), under a `proxy/` directory below `base_dir`.
pub fn discovery_file_path(base_dir: &Path, workspace_root: &str) -> PathBuf {
    let key = string_to_hex(workspace_root.trim_end_matches(['/', '\\']));
    base_dir.join("proxy").join(key)
}

/// Writes the discovery file once the listener is bound. Parent directories
/// are created as needed; the content is the port as decimal text.
pub fn write_discovery_file(base_dir: &Path, workspace_root: &str, port: u16) -> Result<PathBuf> {
    let path = discovery_file_path(base_dir, workspace_root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, port.to_string())?;
    info!("control plane discoverable at {:?}", path);
    Ok(path)
}

pub fn remove_discovery_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        debug!("failed to remove discovery file {:?}: {}", path, e);
    }
}

fn string_to_hex(s: &str) -> String {
    use std::fmt::Write;

    let mut hex_string = String::with_capacity(s.len() * 2);
    for byte in s.bytes() {
        let _ = write!(hex_string, "{:02x}", byte);
    }
    hex_string
}

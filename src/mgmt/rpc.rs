//! JSON-RPC 2.0 methods of the management API.
//!
//! Dispatch is plain async code over the shared state, with the HTTP layer
//! kept out of the way so every method is testable without a socket.

use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, watch};
use tracing::info;

use crate::net::session::SnState;
use crate::types::now;

use super::events::{EventBus, Topic};

/// Everything a method may touch.
#[derive(Clone)]
pub struct RpcContext {
    pub state: Arc<RwLock<SnState>>,
    pub keep_running: Arc<AtomicBool>,
    pub shutdown: watch::Sender<bool>,
    pub events: EventBus,
    /// Hook into the log filter; wired by the daemon front-end.
    pub set_verbose: Option<Arc<dyn Fn(u8) + Send + Sync>>,
}

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

const METHODS: &[(&str, &str)] = &[
    ("get_communities", "enumerate communities with ACL state and auto-IP"),
    ("get_edges", "enumerate every peer across every community"),
    ("get_supernodes", "enumerate federation peers with selection criteria"),
    ("get_info", "version, role, own MAC and socket"),
    ("get_packetstats", "per-bucket tx/rx counters"),
    ("get_timestamps", "monotonic last-event timestamps"),
    ("get_verbose", "read the trace level"),
    ("set_verbose", "write the trace level (auth)"),
    ("reload_communities", "re-read the community ACL file (auth)"),
    ("stop", "terminate the daemon (auth)"),
    ("post.test", "emit a synthetic test event"),
    ("help", "this list"),
    ("help.events", "event stream topics"),
];

/// Methods that change state and therefore require the password.
const WRITE_METHODS: &[&str] = &["set_verbose", "reload_communities", "stop"];

fn ok(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_error(id: &Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

pub fn parse_error() -> Value {
    rpc_error(&Value::Null, -32700, "parse error")
}

fn authorized(req: &RpcRequest, bearer: Option<&str>, password: &Option<String>) -> bool {
    let Some(password) = password else {
        // No password configured: management is open (bind to loopback).
        return true;
    };
    if bearer == Some(password.as_str()) {
        return true;
    }
    req.params.get("key").and_then(Value::as_str) == Some(password.as_str())
}

pub async fn dispatch(ctx: &RpcContext, req: RpcRequest, bearer: Option<&str>) -> (StatusCode, Value) {
    {
        let mut st = ctx.state.write().await;
        st.stats.mgmt_requests += 1;
        st.times.last_mgmt = now();
    }

    if WRITE_METHODS.contains(&req.method.as_str()) {
        let password = ctx.state.read().await.cfg.mgmt_password.clone();
        if !authorized(&req, bearer, &password) {
            return (StatusCode::FORBIDDEN, rpc_error(&req.id, -32001, "forbidden"));
        }
    }

    let reply = match req.method.as_str() {
        "get_communities" => get_communities(ctx, &req).await,
        "get_edges" => get_edges(ctx, &req).await,
        "get_supernodes" => get_supernodes(ctx, &req).await,
        "get_info" => get_info(ctx, &req).await,
        "get_packetstats" => {
            let st = ctx.state.read().await;
            ok(&req.id, serde_json::to_value(&st.stats).unwrap_or_default())
        }
        "get_timestamps" => {
            let st = ctx.state.read().await;
            ok(&req.id, serde_json::to_value(&st.times).unwrap_or_default())
        }
        "get_verbose" => {
            let st = ctx.state.read().await;
            ok(&req.id, json!({ "verbose": st.verbose }))
        }
        "set_verbose" => set_verbose(ctx, &req).await,
        "reload_communities" => reload_communities(ctx, &req).await,
        "stop" => stop(ctx, &req).await,
        "post.test" => post_test(ctx, &req).await,
        "help" => ok(
            &req.id,
            METHODS
                .iter()
                .map(|(name, what)| json!({ "method": name, "purpose": what }))
                .collect(),
        ),
        "help.events" => ok(
            &req.id,
            Topic::ALL.iter().map(|t| Value::String(t.as_str().into())).collect(),
        ),
        _ => {
            return (StatusCode::OK, rpc_error(&req.id, -32601, "method not found"));
        }
    };
    (StatusCode::OK, reply)
}

async fn get_communities(ctx: &RpcContext, req: &RpcRequest) -> Value {
    let st = ctx.state.read().await;
    let list: Vec<Value> = st
        .registry
        .iter()
        .map(|c| {
            json!({
                "name": c.name,
                "mode": c.mode,
                "auto_ip_net": c.auto_net,
                "is_federation": c.is_federation,
                "from_acl": c.from_acl,
                "joinable": c.joinable,
                "edges": c.edges.len(),
            })
        })
        .collect();
    ok(&req.id, Value::Array(list))
}

async fn get_edges(ctx: &RpcContext, req: &RpcRequest) -> Value {
    let st = ctx.state.read().await;
    let t = now();
    let ttl = st.cfg.registration_ttl;
    let fed_name = st.registry.federation_name.clone();

    let mut list = Vec::new();
    for community in st.registry.iter() {
        for peer in community.edges.iter() {
            let mode = if community.name == fed_name {
                "pSp"
            } else if t.saturating_sub(peer.last_p2p) <= ttl {
                "p2p"
            } else {
                "sn"
            };
            let mut entry = json!({
                "community": community.name,
                "mac": peer.mac,
                "sock": peer.sock,
                "mode": mode,
                "state": peer.state(t, ttl),
                "last_seen": peer.last_seen,
                "version": peer.version,
            });
            if community.name != fed_name && !peer.mac.is_null() {
                entry["auto_ip"] =
                    Value::String(crate::net::autoip::edge_ip(community.auto_net, peer.mac).to_string());
            }
            if let Some(user) = &peer.key_id {
                entry["user"] = Value::String(user.clone());
            }
            list.push(entry);
        }
    }
    ok(&req.id, Value::Array(list))
}

async fn get_supernodes(ctx: &RpcContext, req: &RpcRequest) -> Value {
    let st = ctx.state.read().await;
    let list: Vec<Value> = st
        .registry
        .federation()
        .edges
        .iter()
        .map(|p| {
            json!({
                "mac": p.mac,
                "sock": p.sock,
                "hostname": p.hostname,
                "selection": p.selection,
                "uptime": p.uptime,
                "last_seen": p.last_seen,
                "version": p.version,
                "anchor": !p.purgeable,
                "communities": p.fed_communities,
            })
        })
        .collect();
    ok(&req.id, Value::Array(list))
}

async fn get_info(ctx: &RpcContext, req: &RpcRequest) -> Value {
    let st = ctx.state.read().await;
    ok(
        &req.id,
        json!({
            "version": st.cfg.version_string,
            "build": env!("CARGO_PKG_VERSION"),
            "role": "supernode",
            "mac": st.mac,
            "sock": st.sock,
            "federation": st.registry.federation_name,
            "uptime": now().saturating_sub(st.start_time),
            "communities": st.registry.len(),
        }),
    )
}

async fn set_verbose(ctx: &RpcContext, req: &RpcRequest) -> Value {
    let Some(level) = req.params.get("level").and_then(Value::as_u64) else {
        return rpc_error(&req.id, -32602, "missing integer param 'level'");
    };
    let level = level.min(4) as u8;
    ctx.state.write().await.verbose = level;
    if let Some(hook) = &ctx.set_verbose {
        hook(level);
    }
    info!("trace level set to {}", level);
    ok(&req.id, json!({ "verbose": level }))
}

async fn reload_communities(ctx: &RpcContext, req: &RpcRequest) -> Value {
    let path = ctx.state.read().await.cfg.community_file.clone();
    let Some(path) = path else {
        return rpc_error(&req.id, -32002, "no community file configured");
    };
    let mut st = ctx.state.write().await;
    match st.registry.reload_acl(&path) {
        Ok(()) => {
            info!("community ACL reloaded from {}", path.display());
            ok(&req.id, json!({ "communities": st.registry.len() }))
        }
        // The previous ACL stays in force.
        Err(e) => rpc_error(&req.id, -32002, &e.to_string()),
    }
}

async fn stop(ctx: &RpcContext, req: &RpcRequest) -> Value {
    info!("stop requested through management API");
    ctx.keep_running.store(false, Ordering::SeqCst);
    let _ = ctx.shutdown.send(true);
    ok(&req.id, json!("stopping"))
}

async fn post_test(ctx: &RpcContext, req: &RpcRequest) -> Value {
    let message = req
        .params
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("test event");
    ctx.events.emit(Topic::Test, json!({ "event": "test", "message": message }));
    ok(&req.id, json!("sent"))
}

//! Management API tests: JSON-RPC dispatch, auth, events.
//!
//! Run with: cargo test --test mgmt_test

use axum::http::StatusCode;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, watch};
use vesper::config::SnConfig;
use vesper::crypto::SnKeypair;
use vesper::mgmt::events::{EventBus, Topic};
use vesper::mgmt::rpc::{self, RpcContext, RpcRequest};
use vesper::net::autoip::AutoIpPool;
use vesper::net::community::{Acl, Registry};
use vesper::net::session::{self, SnState};
use vesper::net::wire::{Header, Register};
use vesper::types::{Mac, PeerSocket};

fn build_ctx(cfg: SnConfig) -> (RpcContext, watch::Receiver<bool>) {
    let cfg = cfg.validate().unwrap();
    let pool =
        AutoIpPool::new(cfg.auto_ip_pool_min, cfg.auto_ip_pool_max, cfg.auto_ip_prefix).unwrap();
    let registry = Registry::new(
        pool,
        &cfg.federation_name,
        cfg.header_encryption_default,
        SnKeypair::generate(),
    )
    .unwrap();
    let events = EventBus::new();
    let sock = PeerSocket::udp("198.51.100.7:7654".parse().unwrap());
    let state = SnState::new(cfg, registry, events.clone(), sock);
    let (shutdown, shutdown_rx) = watch::channel(false);
    (
        RpcContext {
            state: Arc::new(RwLock::new(state)),
            keep_running: Arc::new(AtomicBool::new(true)),
            shutdown,
            events,
            set_verbose: None,
        },
        shutdown_rx,
    )
}

fn request(id: Value, method: &str, params: Value) -> RpcRequest {
    serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    }))
    .unwrap()
}

async fn register_edge(ctx: &RpcContext, community: &str, mac: &str, sock: &str) {
    let mut st = ctx.state.write().await;
    let out = session::register_edge(
        &mut st,
        &Header { ttl: 2, flags: 0, community: community.into() },
        &Register { cookie: 1, mac: mac.parse().unwrap(), version: "edge".into() },
        PeerSocket::udp(sock.parse().unwrap()),
        None,
        1000,
    );
    assert_eq!(out.len(), 1);
}

// =============================================================================
// READ METHODS
// =============================================================================

#[tokio::test]
async fn test_01_every_read_method_echoes_id() {
    let (ctx, _rx) = build_ctx(SnConfig::default());
    for (i, method) in [
        "get_communities",
        "get_edges",
        "get_supernodes",
        "get_info",
        "get_packetstats",
        "get_timestamps",
        "get_verbose",
        "help",
        "help.events",
    ]
    .iter()
    .enumerate()
    {
        let (status, reply) = rpc::dispatch(&ctx, request(json!(i), method, json!({})), None).await;
        assert_eq!(status, StatusCode::OK, "{method}");
        assert_eq!(reply["jsonrpc"], "2.0", "{method}");
        assert_eq!(reply["id"], json!(i), "{method}");
        assert!(reply.get("result").is_some(), "{method} must return a result");
    }
}

#[tokio::test]
async fn test_02_get_info_describes_this_supernode() {
    let (ctx, _rx) = build_ctx(SnConfig::default());
    let (_, reply) = rpc::dispatch(&ctx, request(json!(1), "get_info", json!({})), None).await;
    let result = &reply["result"];
    assert_eq!(result["role"], "supernode");
    assert_eq!(result["federation"], "*Federation");
    assert!(result["mac"].as_str().unwrap().contains(':'));
    assert!(result["version"].as_str().unwrap().starts_with("vesper-"));
}

#[tokio::test]
async fn test_03_get_edges_tags_relay_p2p_and_federation_peers() {
    let (ctx, _rx) = build_ctx(SnConfig::default());
    register_edge(&ctx, "alpha", "02:00:00:00:00:01", "192.0.2.10:30000").await;
    register_edge(&ctx, "alpha", "02:00:00:00:00:02", "192.0.2.11:30000").await;
    {
        let mut st = ctx.state.write().await;
        let sock = PeerSocket::udp("203.0.113.9:7654".parse().unwrap());
        st.registry.federation_mut().edges.upsert(Mac([2, 0xaa, 0, 0, 0, 1]), sock, 1000);
        // The second edge recently had a direct path brokered.
        let alpha = st.registry.find_mut("alpha").unwrap();
        let p2p_mac: Mac = "02:00:00:00:00:02".parse().unwrap();
        alpha.edges.get_mut(p2p_mac).unwrap().last_p2p = vesper::types::now();
    }

    let (_, reply) = rpc::dispatch(&ctx, request(json!(1), "get_edges", json!({})), None).await;
    let edges = reply["result"].as_array().unwrap();
    assert_eq!(edges.len(), 3);

    let edge = edges.iter().find(|e| e["mac"] == "02:00:00:00:00:01").unwrap();
    assert_eq!(edge["mode"], "sn");
    assert!(edge["auto_ip"].as_str().unwrap().starts_with("10."));

    let p2p = edges.iter().find(|e| e["mac"] == "02:00:00:00:00:02").unwrap();
    assert_eq!(p2p["mode"], "p2p");

    let sn = edges.iter().find(|e| e["community"] == "*Federation").unwrap();
    assert_eq!(sn["mode"], "pSp");
}

#[tokio::test]
async fn test_04_get_communities_reports_acl_state() {
    let (ctx, _rx) = build_ctx(SnConfig::default());
    {
        let mut st = ctx.state.write().await;
        st.registry
            .apply_acl(&Acl::parse("alpha\nbeta *\n", Path::new(".")).unwrap())
            .unwrap();
    }
    let (_, reply) =
        rpc::dispatch(&ctx, request(json!(1), "get_communities", json!({})), None).await;
    let list = reply["result"].as_array().unwrap();
    assert_eq!(list.len(), 3); // federation + alpha + beta

    let fed = list.iter().find(|c| c["is_federation"] == true).unwrap();
    assert_eq!(fed["name"], "*Federation");
    let beta = list.iter().find(|c| c["name"] == "beta").unwrap();
    assert_eq!(beta["mode"], "none");
    assert_eq!(beta["from_acl"], true);
    assert!(beta["auto_ip_net"].as_str().unwrap().ends_with("/24"));
}

// =============================================================================
// AUTH & WRITES
// =============================================================================

#[tokio::test]
async fn test_05_stop_requires_password_then_clears_keep_running() {
    let cfg = SnConfig { mgmt_password: Some("sekrit".into()), ..Default::default() };
    let (ctx, mut shutdown_rx) = build_ctx(cfg);

    // Without the password: 403, nothing happens.
    let (status, reply) = rpc::dispatch(&ctx, request(json!(7), "stop", json!({})), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(reply["error"]["message"], "forbidden");
    assert!(ctx.keep_running.load(Ordering::SeqCst));

    // Wrong bearer is still 403.
    let (status, _) =
        rpc::dispatch(&ctx, request(json!(8), "stop", json!({})), Some("nope")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Correct password: the reply comes back and the daemon winds down.
    let (status, reply) =
        rpc::dispatch(&ctx, request(json!(9), "stop", json!({})), Some("sekrit")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["id"], 9);
    assert!(!ctx.keep_running.load(Ordering::SeqCst));
    assert!(shutdown_rx.has_changed().unwrap());
}

#[tokio::test]
async fn test_06_password_accepted_as_param_key() {
    let cfg = SnConfig { mgmt_password: Some("sekrit".into()), ..Default::default() };
    let (ctx, _rx) = build_ctx(cfg);
    let (status, reply) = rpc::dispatch(
        &ctx,
        request(json!(1), "set_verbose", json!({ "level": 3, "key": "sekrit" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["result"]["verbose"], 3);

    let (_, reply) = rpc::dispatch(&ctx, request(json!(2), "get_verbose", json!({})), None).await;
    assert_eq!(reply["result"]["verbose"], 3);
}

#[tokio::test]
async fn test_07_read_methods_never_need_auth() {
    let cfg = SnConfig { mgmt_password: Some("sekrit".into()), ..Default::default() };
    let (ctx, _rx) = build_ctx(cfg);
    let (status, reply) =
        rpc::dispatch(&ctx, request(json!(1), "get_packetstats", json!({})), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(reply["result"]["rx_register"].is_u64());
}

#[tokio::test]
async fn test_08_reload_communities_roundtrip() {
    let acl_path = std::env::temp_dir().join(format!("vesper_acl_{}.conf", std::process::id()));
    std::fs::write(&acl_path, "alpha\nbeta\n").unwrap();

    let cfg = SnConfig { community_file: Some(acl_path.clone()), ..Default::default() };
    let (ctx, _rx) = build_ctx(cfg);
    {
        let mut st = ctx.state.write().await;
        let path = acl_path.clone();
        st.registry.load_acl(&path).unwrap();
    }

    // Reload twice with no change: state stays identical.
    let (_, first) =
        rpc::dispatch(&ctx, request(json!(1), "reload_communities", json!({})), None).await;
    let (_, second) =
        rpc::dispatch(&ctx, request(json!(2), "reload_communities", json!({})), None).await;
    assert_eq!(first["result"], second["result"]);

    // A parse error leaves the previous ACL in force.
    std::fs::write(&acl_path, "*illegal\n").unwrap();
    let (_, reply) =
        rpc::dispatch(&ctx, request(json!(3), "reload_communities", json!({})), None).await;
    assert!(reply["error"]["message"].as_str().unwrap().contains("reserved"));
    {
        let st = ctx.state.read().await;
        assert!(st.registry.find("alpha").unwrap().joinable);
    }

    std::fs::remove_file(&acl_path).ok();
}

// =============================================================================
// EVENTS
// =============================================================================

#[tokio::test]
async fn test_09_post_test_emits_event() {
    let (ctx, _rx) = build_ctx(SnConfig::default());
    let mut rx = ctx.events.subscribe(Topic::Test);
    let (_, reply) = rpc::dispatch(
        &ctx,
        request(json!(1), "post.test", json!({ "message": "ping" })),
        None,
    )
    .await;
    assert_eq!(reply["result"], "sent");
    let line = rx.try_recv().unwrap();
    assert!(line.starts_with('\x1e'));
    assert!(line.contains("ping"));
}

#[tokio::test]
async fn test_10_unknown_method_is_rpc_error() {
    let (ctx, _rx) = build_ctx(SnConfig::default());
    let (status, reply) =
        rpc::dispatch(&ctx, request(json!(1), "get_nonsense", json!({})), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["error"]["code"], -32601);
    assert_eq!(reply["id"], 1);
}

#[tokio::test]
async fn test_11_mgmt_requests_are_counted() {
    let (ctx, _rx) = build_ctx(SnConfig::default());
    rpc::dispatch(&ctx, request(json!(1), "get_info", json!({})), None).await;
    rpc::dispatch(&ctx, request(json!(2), "get_info", json!({})), None).await;
    let st = ctx.state.read().await;
    assert_eq!(st.stats.mgmt_requests, 2);
    assert!(st.times.last_mgmt > 0);
}

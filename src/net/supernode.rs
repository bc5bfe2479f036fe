//! Supernode runtime: sockets, read loops, timers, shutdown.
//!
//! All state mutation funnels through one `RwLock<SnState>`; each datagram
//! is handled to completion under the write lock, so engine transitions
//! stay atomic and replies for a packet are queued before the next packet
//! from the same source is read.

use crate::config::{ConfigError, SnConfig};
use crate::crypto::SnKeypair;
use crate::mgmt::events::EventBus;
use crate::types::{PeerSocket, Proto, now};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tracing::{debug, info, warn};

use super::autoip::{AutoIpPool, PoolError};
use super::community::{AclError, Registry};
use super::dispatch;
use super::session::{self, Outgoing, SnState};
use super::types::{FED_REREGISTER_INTERVAL, MAX_DATAGRAM};

/// Per-session queue toward one TCP peer; a slow peer drops datagrams
/// rather than stalling the loop.
const TCP_SEND_QUEUE: usize = 64;

#[derive(Error, Debug)]
pub enum SnError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Acl(#[from] AclError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

type TcpSessions = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>;

pub struct Supernode {
    cfg: SnConfig,
    state: Arc<RwLock<SnState>>,
    udp: Arc<UdpSocket>,
    keep_running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    tcp_sessions: TcpSessions,
    events: EventBus,
}

impl Supernode {
    pub async fn new(cfg: SnConfig) -> Result<Self, SnError> {
        let cfg = cfg.validate()?;
        let pool = AutoIpPool::new(cfg.auto_ip_pool_min, cfg.auto_ip_pool_max, cfg.auto_ip_prefix)?;

        let sn_key = match &cfg.key_file {
            Some(path) => SnKeypair::load_or_generate(path)?,
            None => SnKeypair::generate(),
        };
        let mut registry =
            Registry::new(pool, &cfg.federation_name, cfg.header_encryption_default, sn_key)?;
        // An unparseable ACL at first load is fatal; at reload it is not.
        if let Some(path) = &cfg.community_file {
            registry.load_acl(path)?;
            info!("loaded {} communities from {}", registry.len() - 1, path.display());
        }

        let udp = UdpSocket::bind((cfg.bind_address, cfg.port)).await?;
        let local = udp.local_addr()?;
        info!("datapath on udp/{}", local);

        let events = EventBus::new();
        let mut state = SnState::new(cfg.clone(), registry, events.clone(), PeerSocket::udp(local));
        info!("supernode MAC {}", state.mac);

        // Anchors that do not resolve now are retained and retried on the
        // federation tick.
        let mut anchors = Vec::new();
        for host in &cfg.federation_peers {
            let sock = tokio::net::lookup_host(host.as_str())
                .await
                .ok()
                .and_then(|mut addrs| addrs.next())
                .map(PeerSocket::udp);
            anchors.push((host.clone(), sock));
        }
        session::seed_anchors(&mut state, &anchors, now());

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            cfg,
            state: Arc::new(RwLock::new(state)),
            udp: Arc::new(udp),
            keep_running: Arc::new(AtomicBool::new(true)),
            shutdown,
            tcp_sessions: Arc::new(Mutex::new(HashMap::new())),
            events,
        })
    }

    pub fn state(&self) -> Arc<RwLock<SnState>> {
        self.state.clone()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn keep_running(&self) -> Arc<AtomicBool> {
        self.keep_running.clone()
    }

    pub fn shutdown_tx(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    /// Spawn the datapath loops and timers.
    pub async fn start(&self) -> Result<(), SnError> {
        self.spawn_udp_loop();
        if self.cfg.tcp_enabled {
            let listener = TcpListener::bind((self.cfg.bind_address, self.cfg.port)).await?;
            info!("aux datapath on tcp/{}", listener.local_addr()?);
            self.spawn_tcp_listener(listener);
        }
        self.spawn_tick_loop();
        Ok(())
    }

    /// First signal: flip `keep_running` and wake every loop.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.keep_running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }

    fn spawn_udp_loop(&self) {
        let udp = self.udp.clone();
        let state = self.state.clone();
        let tcp_sessions = self.tcp_sessions.clone();
        let keep_running = self.keep_running.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM + 1];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = udp.recv_from(&mut buf) => {
                        let (len, addr) = match received {
                            Ok(r) => r,
                            Err(e) => {
                                warn!("udp receive error: {}", e);
                                continue;
                            }
                        };
                        if !keep_running.load(Ordering::SeqCst) {
                            break;
                        }
                        let src = PeerSocket::udp(addr);
                        let outs = {
                            let mut st = state.write().await;
                            dispatch::handle_datagram(&mut st, src, &buf[..len], now())
                        };
                        send_all(&udp, &tcp_sessions, &state, outs).await;
                    }
                }
            }
            debug!("udp loop stopped");
        });
    }

    fn spawn_tcp_listener(&self, listener: TcpListener) {
        let udp = self.udp.clone();
        let state = self.state.clone();
        let tcp_sessions = self.tcp_sessions.clone();
        let shutdown = self.shutdown.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => {
                        let (stream, addr) = match accepted {
                            Ok(a) => a,
                            Err(e) => {
                                warn!("tcp accept error: {}", e);
                                continue;
                            }
                        };
                        debug!("tcp session from {}", addr);
                        let (tx, rx) = mpsc::channel(TCP_SEND_QUEUE);
                        tcp_sessions.lock().await.insert(addr, tx);
                        tokio::spawn(tcp_session(
                            stream,
                            addr,
                            rx,
                            udp.clone(),
                            state.clone(),
                            tcp_sessions.clone(),
                            shutdown.subscribe(),
                        ));
                    }
                }
            }
            debug!("tcp listener stopped");
        });
    }

    fn spawn_tick_loop(&self) {
        let udp = self.udp.clone();
        let state = self.state.clone();
        let tcp_sessions = self.tcp_sessions.clone();
        let mut shutdown = self.shutdown.subscribe();
        let purge_interval = self.cfg.purge_interval();

        tokio::spawn(async move {
            let mut next_purge = now() + purge_interval;
            // Register with the federation promptly after startup.
            let mut next_fed = now() + 2;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                }
                let t = now();

                if t >= next_fed {
                    next_fed = t + FED_REREGISTER_INTERVAL;
                    resolve_anchors(&state).await;
                    let outs = {
                        let mut st = state.write().await;
                        session::federation_tick(&mut st, t)
                    };
                    send_all(&udp, &tcp_sessions, &state, outs).await;
                }

                if t >= next_purge {
                    next_purge = t + purge_interval;
                    let removed = {
                        let mut st = state.write().await;
                        session::purge_sweep(&mut st, t)
                    };
                    if removed > 0 {
                        debug!("purge sweep removed {} peers", removed);
                    }
                }
            }
            debug!("tick loop stopped");
        });
    }
}

/// Retry DNS for anchors still on the placeholder socket.
async fn resolve_anchors(state: &Arc<RwLock<SnState>>) {
    let pending = {
        let st = state.read().await;
        session::unresolved_anchors(&st)
    };
    for host in pending {
        let Some(addr) = tokio::net::lookup_host(host.as_str())
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
        else {
            continue;
        };
        let mut st = state.write().await;
        session::bind_anchor(&mut st, &host, PeerSocket::udp(addr));
    }
}

/// Emit queued datagrams, routing by the destination's transport tag.
/// Datapath sends never block: a full TCP queue or a non-ready UDP socket
/// drops the datagram and counts `tx_drop`.
async fn send_all(
    udp: &UdpSocket,
    tcp_sessions: &TcpSessions,
    state: &Arc<RwLock<SnState>>,
    outs: Vec<Outgoing>,
) {
    let mut dropped = 0u64;
    for out in outs {
        match out.to.proto {
            Proto::Udp => match udp.try_send_to(&out.bytes, out.to.sock_addr()) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => dropped += 1,
                Err(e) => {
                    debug!("udp send to {} failed: {}", out.to, e);
                    dropped += 1;
                }
            },
            Proto::Tcp => {
                let sessions = tcp_sessions.lock().await;
                match sessions.get(&out.to.sock_addr()) {
                    Some(tx) => {
                        if tx.try_send(out.bytes).is_err() {
                            dropped += 1;
                        }
                    }
                    None => dropped += 1,
                }
            }
        }
    }
    if dropped > 0 {
        state.write().await.stats.tx_drop += dropped;
    }
}

/// One accepted TCP session: length-prefixed frames in, queued frames out.
async fn tcp_session(
    stream: TcpStream,
    addr: SocketAddr,
    mut rx: mpsc::Receiver<Vec<u8>>,
    udp: Arc<UdpSocket>,
    state: Arc<RwLock<SnState>>,
    tcp_sessions: TcpSessions,
    mut shutdown: watch::Receiver<bool>,
) {
    let src = PeerSocket::tcp(addr);
    let (mut reader, mut writer) = stream.into_split();

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            let len = (bytes.len() as u16).to_be_bytes();
            if writer.write_all(&len).await.is_err() || writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut reader) => {
                let data = match frame {
                    Ok(data) => data,
                    Err(e) => {
                        debug!("tcp session {} closed: {}", addr, e);
                        break;
                    }
                };
                let outs = {
                    let mut st = state.write().await;
                    dispatch::handle_datagram(&mut st, src, &data, now())
                };
                send_all(&udp, &tcp_sessions, &state, outs).await;
            }
        }
    }

    writer_task.abort();
    tcp_sessions.lock().await.remove(&addr);
    let mut st = state.write().await;
    session::transport_closed(&mut st, src);
}

/// One 2-byte big-endian length prefix, then exactly one datagram.
async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_DATAGRAM {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad frame length {len}"),
        ));
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

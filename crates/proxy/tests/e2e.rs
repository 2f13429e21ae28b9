//! End-to-end scenarios over real sockets: the engine binds loopback
//! listeners, plain-HTTP origins record what they receive, and a raw client
//! drives the front door.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use portico_proxy::control::ControlApi;
use portico_proxy::engine;
use portico_proxy::sink::{
    MemoryBlacklistStore, MemoryRecordSink, SharedBlacklistStore, SharedRecordSink,
};

// ============================================================================
// Test origin: minimal HTTP/1.1 server that records requests
// ============================================================================

#[derive(Debug, Clone)]
struct SeenRequest {
    method: String,
    target: String,
    headers: HashMap<String, String>,
}

struct Origin {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl Origin {
    /// Start an origin answering every request with 200 and `tag` as body.
    async fn start(tag: &'static str) -> Origin {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen: Arc<Mutex<Vec<SeenRequest>>> = Arc::new(Mutex::new(Vec::new()));

        let record = seen.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let record = record.clone();
                tokio::spawn(async move {
                    loop {
                        let Some(request) = read_http_request(&mut stream).await else {
                            return;
                        };
                        record.lock().push(request);
                        let body = tag.as_bytes();
                        let head = format!(
                            "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n\r\n",
                            body.len()
                        );
                        if stream.write_all(head.as_bytes()).await.is_err() {
                            return;
                        }
                        if stream.write_all(body).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Origin { addr, seen }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }
}

async fn read_http_request(stream: &mut TcpStream) -> Option<SeenRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    // Drain any body so the connection can be reused.
    if let Some(len) = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        let already = buf.len() - (header_end + 4);
        let mut remaining = len.saturating_sub(already);
        while remaining > 0 {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            remaining = remaining.saturating_sub(n);
        }
    }

    Some(SeenRequest {
        method,
        target,
        headers,
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ============================================================================
// Raw HTTP client
// ============================================================================

struct RawResponse {
    status: u16,
    #[allow(dead_code)]
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

async fn raw_request(
    addr: &str,
    method: &str,
    path: &str,
    extra_headers: &[(&str, &str)],
) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.expect("connect front door");

    let mut req = format!("{method} {path} HTTP/1.1\r\nhost: {addr}\r\nconnection: close\r\n");
    for (name, value) in extra_headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }
    req.push_str("\r\n");
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let header_end = find_subslice(&raw, b"\r\n\r\n").expect("response head");
    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = head.lines();
    let status_line = lines.next().expect("status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    RawResponse {
        status,
        headers,
        body: raw[header_end + 4..].to_vec(),
    }
}

// ============================================================================
// Engine helpers
// ============================================================================

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn start_engine(config_toml: &str) -> (ControlApi, tempfile::TempDir) {
    let raw: portico_config::Config = toml::from_str(config_toml).expect("test config parses");
    let snapshot = Arc::new(portico_config::validate(raw).expect("test config valid"));

    let sink: SharedRecordSink = Arc::new(MemoryRecordSink::default());
    let store: SharedBlacklistStore = Arc::new(MemoryBlacklistStore::new());
    let supervisor = engine::build(snapshot, sink.clone(), store);

    let dir = tempfile::tempdir().unwrap();
    let api = ControlApi::new(supervisor, sink, dir.path().join("config.toml"));

    let status = api.start().await;
    assert!(status.running);
    // Let the accept loops finish binding.
    tokio::time::sleep(Duration::from_millis(100)).await;

    (api, dir)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn prefix_routing_picks_the_longest_match() {
    let u1 = Origin::start("u1").await;
    let u2 = Origin::start("u2").await;

    let front = format!("127.0.0.1:{}", free_port());
    let (api, _dir) = start_engine(&format!(
        r#"
        [[http_rules]]
        listen_addrs = ["{front}"]

        [[http_rules.routes]]
        path = "/api"
        [[http_rules.routes.upstreams]]
        url = "{u1}"

        [[http_rules.routes]]
        path = "/api/v2"
        [[http_rules.routes.upstreams]]
        url = "{u2}"
        "#,
        u1 = u1.url(),
        u2 = u2.url(),
    ))
    .await;

    let resp = raw_request(&front, "GET", "/api/v2/users", &[]).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"u2");

    let seen = u2.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].target, "/api/v2/users");
    assert!(u1.requests().is_empty());

    api.stop().await;
}

#[tokio::test]
async fn proxy_pass_path_rewrites_the_prefix() {
    let origin = Origin::start("v1-backend").await;

    let front = format!("127.0.0.1:{}", free_port());
    let (api, _dir) = start_engine(&format!(
        r#"
        [[http_rules]]
        listen_addrs = ["{front}"]

        [[http_rules.routes]]
        path = "/api"
        proxy_pass_path = "/v1"
        [[http_rules.routes.upstreams]]
        url = "{url}"
        "#,
        url = origin.url(),
    ))
    .await;

    let resp = raw_request(&front, "GET", "/api/users?x=1", &[]).await;
    assert_eq!(resp.status, 200);

    let seen = origin.requests();
    assert_eq!(seen[0].target, "/v1/users?x=1");

    api.stop().await;
}

#[tokio::test]
async fn basic_auth_gates_routes_and_credentials_stay_local() {
    let origin = Origin::start("secure").await;

    let front = format!("127.0.0.1:{}", free_port());
    let (api, _dir) = start_engine(&format!(
        r#"
        [[http_rules]]
        listen_addrs = ["{front}"]
        basic_auth = {{ username = "a", password = "b" }}

        [[http_rules.routes]]
        path = "/open"
        exclude_basic_auth = true
        [[http_rules.routes.upstreams]]
        url = "{url}"

        [[http_rules.routes]]
        path = "/secret"
        [[http_rules.routes.upstreams]]
        url = "{url}"
        "#,
        url = origin.url(),
    ))
    .await;

    // Opted-out route needs no credentials.
    let resp = raw_request(&front, "GET", "/open", &[]).await;
    assert_eq!(resp.status, 200);

    // Guarded route without credentials is refused.
    let resp = raw_request(&front, "GET", "/secret", &[]).await;
    assert_eq!(resp.status, 401);

    // Correct credentials pass, and are never forwarded upstream.
    let resp = raw_request(&front, "GET", "/secret", &[("authorization", "Basic YTpi")]).await;
    assert_eq!(resp.status, 200);

    for request in origin.requests() {
        assert!(
            !request.headers.contains_key("authorization"),
            "credentials leaked upstream"
        );
    }

    api.stop().await;
}

#[tokio::test]
async fn forwarding_headers_are_set() {
    let origin = Origin::start("hdr").await;

    let front = format!("127.0.0.1:{}", free_port());
    // The forwarded header below becomes the derived client IP, which is
    // public; admit it explicitly.
    let (api, _dir) = start_engine(&format!(
        r#"
        [access]
        allow_all_public = true

        [[http_rules]]
        listen_addrs = ["{front}"]

        [[http_rules.routes]]
        path = "/"
        [[http_rules.routes.upstreams]]
        url = "{url}"
        "#,
        url = origin.url(),
    ))
    .await;

    let resp = raw_request(&front, "GET", "/", &[("x-forwarded-for", "203.0.113.7")]).await;
    assert_eq!(resp.status, 200);

    let seen = origin.requests();
    let headers = &seen[0].headers;
    assert_eq!(headers.get("x-real-ip").map(String::as_str), Some("127.0.0.1"));
    assert_eq!(
        headers.get("x-forwarded-for").map(String::as_str),
        Some("203.0.113.7, 127.0.0.1")
    );
    assert_eq!(headers.get("x-forwarded-proto").map(String::as_str), Some("http"));
    // Host defaults to the upstream authority.
    assert_eq!(
        headers.get("host").map(String::as_str),
        Some(origin.addr.to_string().as_str())
    );

    api.stop().await;
}

#[tokio::test]
async fn rate_limit_bursts_then_bans_then_recovers() {
    let origin = Origin::start("limited").await;

    let front = format!("127.0.0.1:{}", free_port());
    let (api, _dir) = start_engine(&format!(
        r#"
        [access]
        allow_all_public = true

        [[http_rules]]
        listen_addrs = ["{front}"]
        rate_limit = {{ rps = 2, burst = 2, ban_seconds = 1 }}

        [[http_rules.routes]]
        path = "/"
        [[http_rules.routes.upstreams]]
        url = "{url}"
        "#,
        url = origin.url(),
    ))
    .await;

    let mut statuses = Vec::new();
    for _ in 0..5 {
        statuses.push(raw_request(&front, "GET", "/", &[]).await.status);
    }
    assert_eq!(&statuses[..2], &[200, 200], "burst admitted");
    assert!(statuses[2..].iter().all(|s| *s == 429), "over-limit refused");

    // Still inside the ban window: refused without touching tokens.
    let resp = raw_request(&front, "GET", "/", &[]).await;
    assert_eq!(resp.status, 429);

    // After the ban expires the client is served again.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let resp = raw_request(&front, "GET", "/", &[]).await;
    assert_eq!(resp.status, 200);

    api.stop().await;
}

#[tokio::test]
async fn failover_skips_the_dead_member() {
    // A port with nothing listening.
    let dead = format!("http://127.0.0.1:{}", free_port());
    let alive = Origin::start("alive").await;

    let front = format!("127.0.0.1:{}", free_port());
    let (api, _dir) = start_engine(&format!(
        r#"
        [[http_rules]]
        listen_addrs = ["{front}"]

        [[http_rules.routes]]
        path = "/"
        [[http_rules.routes.upstreams]]
        url = "{dead}"
        [[http_rules.routes.upstreams]]
        url = "{alive}"
        "#,
        alive = alive.url(),
    ))
    .await;

    for _ in 0..4 {
        let resp = raw_request(&front, "GET", "/", &[]).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"alive");
    }

    assert_eq!(alive.requests().len(), 4);

    api.stop().await;
}

#[tokio::test]
async fn blacklisted_client_is_denied_before_anything_else() {
    let origin = Origin::start("walled").await;

    let front = format!("127.0.0.1:{}", free_port());
    let (api, _dir) = start_engine(&format!(
        r#"
        [[http_rules]]
        listen_addrs = ["{front}"]

        [[http_rules.routes]]
        path = "/"
        [[http_rules.routes.upstreams]]
        url = "{url}"
        "#,
        url = origin.url(),
    ))
    .await;

    let resp = raw_request(&front, "GET", "/", &[]).await;
    assert_eq!(resp.status, 200);

    api.blacklist_add("127.0.0.1".into(), "test".into(), 0)
        .await
        .unwrap();

    let resp = raw_request(&front, "GET", "/", &[]).await;
    assert_eq!(resp.status, 403);
    assert_eq!(origin.requests().len(), 1, "denied request never forwarded");

    api.blacklist_remove("127.0.0.1").await.unwrap();
    let resp = raw_request(&front, "GET", "/", &[]).await;
    assert_eq!(resp.status, 200);

    api.stop().await;
}

#[tokio::test]
async fn unmatched_requests_get_404() {
    let origin = Origin::start("scoped").await;

    let front = format!("127.0.0.1:{}", free_port());
    let (api, _dir) = start_engine(&format!(
        r#"
        [[http_rules]]
        listen_addrs = ["{front}"]

        [[http_rules.routes]]
        path = "/api"
        [[http_rules.routes.upstreams]]
        url = "{url}"
        "#,
        url = origin.url(),
    ))
    .await;

    let resp = raw_request(&front, "GET", "/elsewhere", &[]).await;
    assert_eq!(resp.status, 404);
    assert!(origin.requests().is_empty());

    api.stop().await;
}

#[tokio::test]
async fn response_body_rules_rewrite_content() {
    let origin = Origin::start("http://internal/home").await;

    let front = format!("127.0.0.1:{}", free_port());
    let (api, _dir) = start_engine(&format!(
        r#"
        [[http_rules]]
        listen_addrs = ["{front}"]

        [[http_rules.routes]]
        path = "/"
        response_body_replace = [
            {{ find = "http://internal", replace = "https://public" }},
        ]
        [[http_rules.routes.upstreams]]
        url = "{url}"
        "#,
        url = origin.url(),
    ))
    .await;

    let resp = raw_request(&front, "GET", "/", &[]).await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"https://public/home");

    api.stop().await;
}

#[tokio::test]
async fn tcp_stream_forwards_both_directions() {
    // Raw TCP echo upstream.
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut s, _)) = echo.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                while let Ok(n) = s.read(&mut buf).await {
                    if n == 0 || s.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let port = free_port();
    let (api, _dir) = start_engine(&format!(
        r#"
        [stream]
        enabled = true

        [[stream.upstreams]]
        name = "echo"
        members = [{{ addr = "{echo_addr}" }}]

        [[stream.servers]]
        listen_port = {port}
        protocol = "tcp"
        proxy_pass = "echo"
        connect_timeout = "2s"
        idle_timeout = "10s"
        "#,
    ))
    .await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"hello through the proxy").await.unwrap();
    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello through the proxy");

    api.stop().await;
}

#[tokio::test]
async fn udp_sessions_are_created_and_reused() {
    // UDP upstream that records sender ports and echoes back.
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let peers: Arc<Mutex<Vec<SocketAddr>>> = Arc::new(Mutex::new(Vec::new()));

    let seen = peers.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 256];
        loop {
            let Ok((n, from)) = upstream.recv_from(&mut buf).await else {
                break;
            };
            seen.lock().push(from);
            let _ = upstream.send_to(&buf[..n], from).await;
        }
    });

    let port = free_port();
    let (api, _dir) = start_engine(&format!(
        r#"
        [stream]
        enabled = true

        [[stream.upstreams]]
        name = "dns"
        members = [{{ addr = "{upstream_addr}" }}]

        [[stream.servers]]
        listen_port = {port}
        protocol = "udp"
        proxy_pass = "dns"
        connect_timeout = "2s"
        idle_timeout = "10s"
        "#,
    ))
    .await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(("127.0.0.1", port)).await.unwrap();

    client.send(b"d1").await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .expect("reply within deadline")
        .unwrap();
    assert_eq!(&buf[..n], b"d1");

    client.send(b"d2").await.unwrap();
    let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .expect("reply within deadline")
        .unwrap();
    assert_eq!(&buf[..n], b"d2");

    // Both datagrams traveled over the same session socket.
    let seen = peers.lock().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], seen[1]);

    api.stop().await;
}

#[tokio::test]
async fn hot_reload_moves_traffic_without_restart() {
    let before = Origin::start("before").await;
    let after = Origin::start("after").await;

    let front = format!("127.0.0.1:{}", free_port());
    let (api, _dir) = start_engine(&format!(
        r#"
        [[http_rules]]
        id = "edge"
        listen_addrs = ["{front}"]

        [[http_rules.routes]]
        path = "/"
        [[http_rules.routes.upstreams]]
        url = "{url}"
        "#,
        url = before.url(),
    ))
    .await;

    let resp = raw_request(&front, "GET", "/", &[]).await;
    assert_eq!(resp.body, b"before");

    let mut cfg = (*api.get_config()).clone();
    cfg.http_rules[0].routes[0].upstreams[0].url = after.url();
    api.save_config(cfg).await.unwrap();

    let resp = raw_request(&front, "GET", "/", &[]).await;
    assert_eq!(resp.body, b"after");

    api.stop().await;
}

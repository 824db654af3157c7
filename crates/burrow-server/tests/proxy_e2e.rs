//! End-to-end tests for the public server
//!
//! The tunnel client side is played by plain TcpStreams dialing the agent
//! port; public requests are raw HTTP over TcpStreams (with reqwest for the
//! management API).

use burrow_control::{ClientManager, ManagerConfig};
use burrow_server::{NewTunnelResponse, PublicServer, ServerConfig, StatusResponse, TunnelStatusResponse};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const DOMAIN: &str = "tun.test";

fn test_manager_config() -> ManagerConfig {
    // Keep listen() from reaching out to a real IP-echo service.
    std::env::set_var("BURROW_IP_ECHO_URL", "http://127.0.0.1:9");
    ManagerConfig {
        grace_period: Duration::from_secs(5),
        ..ManagerConfig::default()
    }
}

async fn start_server(config: ManagerConfig) -> (SocketAddr, ClientManager) {
    start_server_with(config, None).await
}

async fn start_server_with(
    config: ManagerConfig,
    landing: Option<String>,
) -> (SocketAddr, ClientManager) {
    let manager = ClientManager::new(config);
    let server = PublicServer::new(
        manager.clone(),
        ServerConfig {
            domain: DOMAIN.to_string(),
            secure: false,
            landing,
        },
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { server.run(listener).await.unwrap() });
    (addr, manager)
}

/// Open a public connection and write one request on it.
async fn send_request(addr: SocketAddr, host: &str, target: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            format!("GET {target} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();
    stream
}

/// Read a full `Connection: close` response, returning status and body.
async fn read_response(mut stream: TcpStream) -> (u16, String) {
    let mut raw = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .expect("timed out reading response")
        .unwrap();
    let text = String::from_utf8_lossy(&raw).into_owned();
    let status = text
        .split_whitespace()
        .nth(1)
        .expect("no status line")
        .parse()
        .unwrap();
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

async fn http_get(addr: SocketAddr, host: &str, target: &str) -> (u16, String) {
    read_response(send_request(addr, host, target).await).await
}

/// Read from a socket until the end of an HTTP message head.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("timed out reading message head")
            .unwrap();
        assert!(n > 0, "socket closed while reading message head");
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

async fn create_tunnel(addr: SocketAddr, id: &str) -> NewTunnelResponse {
    let (status, body) = http_get(addr, DOMAIN, &format!("/{id}")).await;
    assert_eq!(status, 200, "tunnel creation failed: {body}");
    serde_json::from_str(&body).unwrap()
}

#[tokio::test]
async fn request_round_trips_through_the_tunnel() {
    let (addr, _manager) = start_server(test_manager_config()).await;

    let tunnel = create_tunnel(addr, "happy1").await;
    assert_eq!(tunnel.id, "happy1");
    assert_eq!(tunnel.max_conn_count, 10);
    assert_eq!(tunnel.url, "http://happy1.tun.test");

    let mut remote = TcpStream::connect(("127.0.0.1", tunnel.port))
        .await
        .unwrap();

    let public = {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                format!(
                    "GET /hello HTTP/1.1\r\nHost: happy1.{DOMAIN}\r\nConnection: close\r\nX-Request-Id: 42\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        stream
    };

    let forwarded = read_head(&mut remote).await.to_lowercase();
    assert!(forwarded.starts_with("get /hello http/1.1\r\n"), "{forwarded}");
    assert!(forwarded.contains("host: happy1.tun.test"), "{forwarded}");
    assert!(forwarded.contains("x-request-id: 42"), "{forwarded}");
    // Hop-by-hop headers do not cross the tunnel.
    assert!(!forwarded.contains("connection:"), "{forwarded}");

    remote
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
        .await
        .unwrap();

    let (status, body) = read_response(public).await;
    assert_eq!(status, 200);
    assert_eq!(body, "hello");
}

#[tokio::test]
async fn queued_request_is_served_by_the_next_socket() {
    let (addr, manager) = start_server(ManagerConfig {
        max_sockets: 1,
        ..test_manager_config()
    }).await;

    let tunnel = create_tunnel(addr, "queue1").await;
    assert_eq!(tunnel.max_conn_count, 1);

    let mut first_socket = TcpStream::connect(("127.0.0.1", tunnel.port))
        .await
        .unwrap();

    // R1 checks out the only socket.
    let r1 = send_request(addr, &format!("queue1.{DOMAIN}"), "/one").await;
    let head = read_head(&mut first_socket).await;
    assert!(head.starts_with("GET /one"), "{head}");

    // R2 arrives with the pool empty and parks.
    let r2 = send_request(addr, &format!("queue1.{DOMAIN}"), "/two").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    first_socket
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\none!")
        .await
        .unwrap();
    let (status, body) = read_response(r1).await;
    assert_eq!(status, 200);
    assert_eq!(body, "one!");

    // The client dials a fresh socket, which goes straight to R2.
    let mut second_socket = TcpStream::connect(("127.0.0.1", tunnel.port))
        .await
        .unwrap();
    let head = read_head(&mut second_socket).await;
    assert!(head.starts_with("GET /two"), "{head}");
    second_socket
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ntwo!")
        .await
        .unwrap();
    let (status, body) = read_response(r2).await;
    assert_eq!(status, 200);
    assert_eq!(body, "two!");

    // Both sockets are consumed; the counter settles back to zero.
    let client = manager.get_client("queue1").unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while client.stats().connected_sockets != 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn disconnect_mid_request_yields_502() {
    let (addr, manager) = start_server(test_manager_config()).await;

    let tunnel = create_tunnel(addr, "flaky1").await;
    let mut remote = TcpStream::connect(("127.0.0.1", tunnel.port))
        .await
        .unwrap();

    let public = send_request(addr, &format!("flaky1.{DOMAIN}"), "/boom").await;
    let head = read_head(&mut remote).await;
    assert!(head.starts_with("GET /boom"), "{head}");

    // Tear the tunnel down before any response bytes.
    drop(remote);

    let (status, body) = read_response(public).await;
    assert_eq!(status, 502);
    assert_eq!(body, "client [flaky1] failed");

    let client = manager.get_client("flaky1").unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while client.stats().connected_sockets != 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn unknown_subdomain_is_a_404() {
    let (addr, _manager) = start_server(test_manager_config()).await;

    let (status, body) = http_get(addr, &format!("nope.{DOMAIN}"), "/").await;
    assert_eq!(status, 404);
    assert_eq!(body, "404");
}

#[tokio::test]
async fn upgraded_connection_splices_bytes_both_ways() {
    let (addr, _manager) = start_server(test_manager_config()).await;

    let tunnel = create_tunnel(addr, "wsock1").await;
    let mut remote = TcpStream::connect(("127.0.0.1", tunnel.port))
        .await
        .unwrap();

    let mut public = TcpStream::connect(addr).await.unwrap();
    public
        .write_all(
            format!(
                "GET /live HTTP/1.1\r\nHost: wsock1.{DOMAIN}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let forwarded = read_head(&mut remote).await.to_lowercase();
    assert!(forwarded.starts_with("get /live"), "{forwarded}");
    assert!(forwarded.contains("upgrade: websocket"), "{forwarded}");

    remote
        .write_all(
            b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();

    let head = read_head(&mut public).await;
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");

    // Bytes now pass through untouched, in both directions.
    public.write_all(b"ABCDE").await.unwrap();
    let mut buf = [0u8; 5];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ABCDE");

    remote.write_all(b"12345").await.unwrap();
    public.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"12345");

    // Closing one side closes the other.
    drop(public);
    let mut last = [0u8; 1];
    let n = timeout(Duration::from_secs(5), remote.read(&mut last))
        .await
        .expect("tunnel side was not closed")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn management_api_reports_status() {
    let (addr, _manager) = start_server(test_manager_config()).await;

    let http = reqwest::Client::builder()
        .resolve(DOMAIN, addr)
        .build()
        .unwrap();
    let base = format!("http://{DOMAIN}:{}", addr.port());

    let status: StatusResponse = http
        .get(format!("{base}/api/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.tunnels, 0);

    let tunnel: NewTunnelResponse = http
        .get(format!("{base}/stats1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tunnel.id, "stats1");

    let status: StatusResponse = http
        .get(format!("{base}/api/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.tunnels, 1);

    // One connected socket shows up in the tunnel status.
    let _remote = TcpStream::connect(("127.0.0.1", tunnel.port))
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let tunnel_status: TunnelStatusResponse = http
            .get(format!("{base}/api/tunnels/stats1/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if tunnel_status.connected_sockets == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let missing = http
        .get(format!("{base}/api/tunnels/absent/status"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn requested_identifier_collision_gets_a_random_one() {
    let (addr, _manager) = start_server(test_manager_config()).await;

    let first = create_tunnel(addr, "twice1").await;
    assert_eq!(first.id, "twice1");

    let second = create_tunnel(addr, "twice1").await;
    assert_ne!(second.id, "twice1");
    assert_ne!(second.port, first.port);
    assert_eq!(second.url, format!("http://{}.tun.test", second.id));
}

#[tokio::test]
async fn invalid_identifier_is_a_403() {
    let (addr, _manager) = start_server(test_manager_config()).await;

    let (status, body) = http_get(addr, DOMAIN, "/UPPER").await;
    assert_eq!(status, 403);
    assert!(body.contains("Invalid subdomain"), "{body}");
}

#[tokio::test]
async fn bare_domain_redirects_to_the_landing_page() {
    let (addr, _manager) = start_server_with(
        test_manager_config(),
        Some("https://example.com/landing".to_string()),
    )
    .await;

    let (status, _body) = http_get(addr, DOMAIN, "/").await;
    assert_eq!(status, 302);

    // Without a landing page the bare domain is a 404.
    let (addr, _manager) = start_server(test_manager_config()).await;
    let (status, body) = http_get(addr, DOMAIN, "/").await;
    assert_eq!(status, 404);
    assert_eq!(body, "404");
}

#[tokio::test]
async fn new_query_creates_a_random_tunnel() {
    let (addr, manager) = start_server(test_manager_config()).await;

    let (status, body) = http_get(addr, DOMAIN, "/?new").await;
    assert_eq!(status, 200);
    let tunnel: NewTunnelResponse = serde_json::from_str(&body).unwrap();
    assert!((4..=6).contains(&tunnel.id.len()), "bad id: {}", tunnel.id);
    assert!(manager.has_client(&tunnel.id));
}

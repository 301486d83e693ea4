//! End-to-end tests: a full server against a stub upstream resolver and a
//! stub Redis backend, all on loopback ephemeral ports.

use detdns::qlog;
use detdns::resource;
use detdns::subnet;
use detdns::types::*;
use detdns::{Config, Server};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

/// A stub resolver: answers every query with a fixed A record for its
/// question, echoing the query's extension (as an ECS-aware resolver
/// would). Reports each query it saw.
async fn stub_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<Message>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut buf = vec![0_u8; 4096];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            let query = match Message::from_slice(&buf[..len]) {
                Ok(m) => m,
                Err(_) => continue,
            };

            let mut reply = query.clone();
            reply.qr = QR::Response;
            reply.ra = true;
            reply.answers.push(Record {
                name: query.questions[0].name.clone(),
                class: Class::Internet,
                ttl: Duration::new(300, 0),
                resource: Resource::A(resource::A(Ipv4Addr::new(192, 0, 2, 1))),
            });

            let _ = tx.send(query);
            let _ = socket.send_to(&reply.to_vec().unwrap(), peer).await;
        }
    });

    (addr, rx)
}

/// A stub Redis backend: replies `+OK` to anything and reports the raw
/// command bytes it received.
async fn stub_backend() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            let tx = tx.clone();

            tokio::spawn(async move {
                let mut buf = vec![0_u8; 4096];
                loop {
                    let n = match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    let _ = tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
                    if conn.write_all(b"+OK\r\n").await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (addr, rx)
}

/// An address nothing is listening on.
async fn dead_addr() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap()
}

fn test_config(upstreams: Vec<SocketAddr>, backend: SocketAddr) -> Config {
    Config {
        listen: "127.0.0.1:0".to_string(),
        name_servers: upstreams.iter().map(|a| a.to_string()).collect(),
        backends: [(0, backend.to_string())].into_iter().collect(),
        pool_num: 4,
        chan_num: 2,
        // Generous backend timeout, CI machines can be slow.
        read_timeout: 2000,
        stats_period: 1,
        ..Default::default()
    }
}

/// Boots a server and returns its address plus its counters.
async fn start(config: Config) -> (SocketAddr, std::sync::Arc<detdns::stats::Counters>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut server = Server::new(config).expect("failed to build server");
    let counters = server.counters();
    let addr = server.bind().await.expect("failed to bind");
    tokio::spawn(server.run());

    (addr, counters)
}

async fn exchange(server: SocketAddr, query: &Message) -> Message {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(server).await.unwrap();
    socket.send(&query.to_vec().unwrap()).await.unwrap();

    let mut buf = vec![0_u8; 4096];
    let len = timeout(WAIT, socket.recv(&mut buf))
        .await
        .expect("no response from proxy")
        .unwrap();

    Message::from_slice(&buf[..len]).expect("unparseable response")
}

fn a_query(domain: &str) -> Message {
    let mut m = Message::default();
    m.add_question(domain, Type::A, Class::Internet);
    m
}

#[tokio::test]
async fn test_simple_forward() {
    let (upstream, mut seen) = stub_upstream().await;
    let (backend, mut commands) = stub_backend().await;
    let (server, counters) = start(test_config(vec![upstream], backend)).await;

    let query = a_query("Example.COM");
    let reply = exchange(server, &query).await;

    assert_eq!(reply.id, query.id);
    assert_eq!(reply.qr, QR::Response);
    assert_eq!(reply.rcode, Rcode::NoError);
    assert_eq!(reply.answers.len(), 1);
    assert_eq!(
        reply.answers[0].resource,
        Resource::A(resource::A(Ipv4Addr::new(192, 0, 2, 1)))
    );

    // The query carried no ECS option, so the reply must not either.
    assert_eq!(subnet::get_subnet(&reply), None);

    // The upstream saw the injected option for the client's address.
    let observed = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(observed.questions[0].name, "Example.COM.");
    assert_eq!(
        observed.extension.unwrap().options,
        vec![EdnsOption::Subnet(ClientSubnet {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            source_prefix: 32,
            scope_prefix: 0,
        })]
    );

    // The backend got the lowercased, dotless SETEX with the default TTL.
    let command = timeout(WAIT, commands.recv()).await.unwrap().unwrap();
    assert!(command.contains("SETEX"), "unexpected command: {}", command);
    assert!(command.contains("example.com"), "{}", command);
    assert!(command.contains("120"), "{}", command);
    assert!(command.contains("127.0.0.1"), "{}", command);

    assert_eq!(counters.queries(), 1);
    assert_eq!(counters.failed(), 0);
}

#[tokio::test]
async fn test_ecs_passthrough() {
    let (upstream, mut seen) = stub_upstream().await;
    let (backend, _commands) = stub_backend().await;
    let (server, _) = start(test_config(vec![upstream], backend)).await;

    let mut query = a_query("example.com");
    let client_subnet: IpAddr = "198.51.100.9".parse().unwrap();
    subnet::set_subnet(&mut query, client_subnet);

    let reply = exchange(server, &query).await;

    // The client's own option went upstream unchanged...
    let observed = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(subnet::get_subnet(&observed), Some(client_subnet));
    assert_eq!(observed.extension.unwrap().options.len(), 1);

    // ...and whatever the upstream echoed back stays in the reply.
    assert_eq!(subnet::get_subnet(&reply), Some(client_subnet));
}

#[tokio::test]
async fn test_upstream_fallback() {
    let dead = dead_addr().await;
    let (upstream, _seen) = stub_upstream().await;
    let (backend, _commands) = stub_backend().await;
    let (server, _) = start(test_config(vec![dead, upstream], backend)).await;

    let reply = exchange(server, &a_query("example.com")).await;

    assert_eq!(reply.rcode, Rcode::NoError);
    assert_eq!(reply.answers.len(), 1);
}

#[tokio::test]
async fn test_no_upstreams_servfail() {
    let (backend, _commands) = stub_backend().await;
    let (server, counters) = start(test_config(vec![], backend)).await;

    let query = a_query("example.com");
    let reply = exchange(server, &query).await;

    assert_eq!(reply.id, query.id);
    assert_eq!(reply.rcode, Rcode::ServFail);
    assert_eq!(reply.questions, query.questions);

    // Refused before the accounting point.
    assert_eq!(counters.queries(), 0);
}

#[tokio::test]
async fn test_empty_question_servfail() {
    let (upstream, _seen) = stub_upstream().await;
    let (backend, _commands) = stub_backend().await;
    let (server, counters) = start(test_config(vec![upstream], backend)).await;

    let reply = exchange(server, &Message::default()).await;

    assert_eq!(reply.rcode, Rcode::ServFail);
    assert_eq!(counters.queries(), 0);
}

#[tokio::test]
async fn test_malformed_datagram_servfail() {
    let (upstream, _seen) = stub_upstream().await;
    let (backend, _commands) = stub_backend().await;
    let (server, _) = start(test_config(vec![upstream], backend)).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(server).await.unwrap();
    socket.send(&[0xde, 0xad, 0x01]).await.unwrap();

    let mut buf = vec![0_u8; 512];
    let len = timeout(WAIT, socket.recv(&mut buf))
        .await
        .expect("no response from proxy")
        .unwrap();

    let reply = Message::from_slice(&buf[..len]).unwrap();
    assert_eq!(reply.id, 0xdead);
    assert_eq!(reply.qr, QR::Response);
    assert_eq!(reply.rcode, Rcode::ServFail);
}

#[tokio::test]
async fn test_backend_down_does_not_affect_resolution() {
    let (upstream, _seen) = stub_upstream().await;

    // A backend address nothing listens on: the worker's dial fails, the
    // client still gets its answer, and nothing counts as a queue drop.
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = closed.local_addr().unwrap();
    drop(closed);

    let (server, counters) = start(test_config(vec![upstream], backend)).await;

    let reply = exchange(server, &a_query("example.com")).await;

    assert_eq!(reply.rcode, Rcode::NoError);
    assert_eq!(reply.answers.len(), 1);
    assert_eq!(counters.queries(), 1);
    assert_eq!(counters.failed(), 0);
}

#[tokio::test]
async fn test_same_name_routes_to_one_cell() {
    // The routing that pins a name to a worker is a pure function; two
    // servers with the same geometry agree on it.
    let (b1, c1) = qlog::route("static.example.com", 3, 4);
    let (b2, c2) = qlog::route("static.example.com", 3, 4);

    assert_eq!((b1, c1), (b2, c2));
    assert!(b1 < 3 && c1 < 4);
}

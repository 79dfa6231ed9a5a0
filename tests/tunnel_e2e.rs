//! Whole tunnel over real TLS: acceptor, workers, sessions, an HTTP broker
//! double and an echo backend.

use rcgen::{generate_simple_self_signed, CertifiedKey};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ticket_tunnel::broker::HttpBroker;
use ticket_tunnel::client::TunnelClient;
use ticket_tunnel::config::Config;
use ticket_tunnel::server::TunnelServer;
use ticket_tunnel::stats::GlobalStats;
use ticket_tunnel::ticket::Ticket;
use ticket_tunnel::tls::{self, ServerTrust};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

const TICKET: &str = "qcdn2jax6tx4nljdyed61hm3iqbld5nf44zxbh9gf355ofw2";
const UNKNOWN: &str = "unknownunknownunknownunknownunknownunknownunknow";
const NOTIFY: &str = "N0t1fyN0t1fyN0t1fyN0t1fyN0t1fyN0t1fyN0t1fyN0t1fy";
const TOKEN: &str = "brokertoken";
const SECRET: &str = "s3cret";

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("ticket_tunnel=debug")
        .try_init();
}

/// Echo server that counts accepted connections.
async fn echo_backend() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut rd, mut wr) = sock.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    (port, accepted)
}

/// Minimal HTTP broker: `TICKET` resolves to the backend, `stop` requests are
/// forwarded on the channel, anything else is a 404.
async fn fake_broker(backend_port: u16) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.ends_with(b"\r\n\r\n") {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&head).into_owned();
                let path = head.split_whitespace().nth(1).unwrap_or_default().to_string();

                let (status, body) = if path.starts_with(&format!("/tunnel/{TICKET}/127.0.0.1/{TOKEN}")) {
                    (
                        "200 OK",
                        format!(r#"{{"host":"127.0.0.1","port":"{backend_port}","notify":"{NOTIFY}"}}"#),
                    )
                } else if path.starts_with(&format!("/tunnel/{NOTIFY}/stop/{TOKEN}?")) {
                    let _ = tx.send(path.clone());
                    ("200 OK", "{}".to_string())
                } else {
                    ("404 Not Found", r#"{"error":"unknown ticket"}"#.to_string())
                };
                let resp = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            });
        }
    });
    (format!("http://{addr}/tunnel"), rx)
}

struct Tunnel {
    addr: SocketAddr,
    stats: Arc<GlobalStats>,
    client: TunnelClient,
    notified: mpsc::UnboundedReceiver<String>,
    backend_accepts: Arc<AtomicUsize>,
    _shutdown: watch::Sender<bool>,
}

async fn start_tunnel() -> Tunnel {
    init_logging();
    let (backend_port, backend_accepts) = echo_backend().await;
    let (broker_url, notified) = fake_broker(backend_port).await;

    let text = format!(
        r#"
        [listen]
        address = "127.0.0.1"
        port = 0
        [tls]
        certificate = "unused.pem"
        certificate_key = "unused.pem"
        [broker]
        url = "{broker_url}"
        token = "{TOKEN}"
        timeout = 2.0
        [tunnel]
        workers = 2
        command_timeout = 0.3
        relay_grace = 1.0
        [admin]
        secret = "{SECRET}"
        allow = ["127.0.0.1"]
        "#
    );
    let config: Config = text.parse().unwrap();

    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let acceptor = tls::acceptor_from_der(vec![cert_der.clone()], key_der).unwrap();

    let broker = HttpBroker::new(&config.broker).unwrap();
    let server = TunnelServer::bind(Arc::new(config), acceptor, Arc::new(broker))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let stats = server.stats();

    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(server.run(shutdown_rx));

    let client = TunnelClient::new(
        addr.to_string(),
        tls::connector(ServerTrust::Roots(vec![cert_der])).unwrap(),
        tls::server_name("localhost").unwrap(),
    )
    .with_timeout(Duration::from_secs(5));

    Tunnel {
        addr,
        stats,
        client,
        notified,
        backend_accepts,
        _shutdown: shutdown,
    }
}

async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return out,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
}

fn ticket(s: &str) -> Ticket {
    s.parse().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_relays_echo_and_notifies_counters() {
    let mut t = start_tunnel().await;

    let mut tunnel = t.client.open(&ticket(TICKET)).await.unwrap();
    tunnel.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    tunnel.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");
    tunnel.shutdown().await.unwrap();
    drop(tunnel);

    let notify = tokio::time::timeout(Duration::from_secs(5), t.notified.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(notify.ends_with("?sent=5&recv=5"), "{notify}");
    assert_eq!(t.backend_accepts.load(Ordering::SeqCst), 1);

    let snap = t.stats.snapshot();
    assert_eq!(snap.total_connections, 1);
    assert_eq!(snap.current_connections, 0);
    assert_eq!((snap.total_sent, snap.total_recv), (5, 5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_command_gets_timeout() {
    let t = start_tunnel().await;

    let mut tls = t.client.connect().await.unwrap();
    tls.write_all(b"AB").await.unwrap();
    tls.flush().await.unwrap();
    assert_eq!(read_reply(&mut tls).await, b"ERROR_TIMEOUT");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_command_gets_command_error() {
    let t = start_tunnel().await;

    let mut tls = t.client.connect().await.unwrap();
    tls.write_all(b"XXXX").await.unwrap();
    tls.flush().await.unwrap();
    assert_eq!(read_reply(&mut tls).await, b"ERROR_COMMAND");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_ticket_gets_ticket_error() {
    let mut t = start_tunnel().await;

    let err = t.client.open(&ticket(UNKNOWN)).await.unwrap_err();
    assert!(err.to_string().contains("ERROR_TICKET"), "{err}");
    assert_eq!(t.backend_accepts.load(Ordering::SeqCst), 0);
    assert_eq!(t.stats.snapshot().total_connections, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(t.notified.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_handshake_is_dropped_silently() {
    let t = start_tunnel().await;

    let mut raw = TcpStream::connect(t.addr).await.unwrap();
    raw.write_all(b"GET / H").await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), read_reply(&mut raw))
        .await
        .unwrap();
    assert!(reply.is_empty());

    // The tunnel keeps serving.
    t.client.check().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_sessions_keep_their_own_counters() {
    let mut t = start_tunnel().await;

    let run = |payload: Vec<u8>| {
        let client = t.client.clone();
        async move {
            let tunnel = client.open(&ticket(TICKET)).await.unwrap();
            let (mut rd, mut wr) = tokio::io::split(tunnel);
            let writer = async {
                wr.write_all(&payload).await.unwrap();
                wr.shutdown().await.unwrap();
            };
            let reader = async {
                let mut echoed = vec![0u8; payload.len()];
                rd.read_exact(&mut echoed).await.unwrap();
                echoed
            };
            let ((), echoed) = tokio::join!(writer, reader);
            assert_eq!(echoed, payload);
        }
    };
    tokio::join!(run(vec![b'a'; 3]), run(vec![b'b'; 40_000]));

    let mut seen = Vec::new();
    for _ in 0..2 {
        let path = tokio::time::timeout(Duration::from_secs(5), t.notified.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(path.rsplit_once('?').unwrap().1.to_string());
    }
    seen.sort();
    assert_eq!(seen, vec!["sent=3&recv=3", "sent=40000&recv=40000"]);

    let snap = t.stats.snapshot();
    assert_eq!(snap.total_connections, 2);
    assert_eq!(snap.total_sent, 40_003);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admin_stats_over_tls() {
    let t = start_tunnel().await;

    t.client.check().await.unwrap();
    let summary = t.client.stats(SECRET, false).await.unwrap();
    assert_eq!(summary.total.total_connections, 0);
    assert!(summary.workers.is_empty());

    let detailed = t.client.stats(SECRET, true).await.unwrap();
    assert_eq!(detailed.workers.len(), 2);

    let err = t.client.stats("not-the-secret", false).await.unwrap_err();
    assert!(err.to_string().contains("FORBIDDEN"), "{err}");
}

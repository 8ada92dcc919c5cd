//! End-to-end tests against a live server on an ephemeral port, backed
//! by the in-memory store.
use flate2::read::GzDecoder;
use mptc::signals::SignalTracker;
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use turfwar::asset::AssetStore;
use turfwar::http::MSG_MAX;
use turfwar::queue::QUEUE_MAX;
use turfwar::server::{self, ConnectionStream, ServerContext};
use turfwar::store::{MemoryStore, StoreConnector};
use turfwar::workers::{self, BackgroundWorkers};

const INDEX_HTML: &str = "<!doctype html>\n<title>turfwar</title>\n<h1>Claim your land</h1>\n";

struct Response {
    status: u16,
    head: String,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}: ", name.to_lowercase());
        self.head
            .split("\r\n")
            .find(|l| l.to_lowercase().starts_with(&prefix))
            .map(|l| &l[prefix.len()..])
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Read one response.  None if the server closed the connection.
fn read_response(stream: &mut TcpStream) -> Option<Response> {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_len = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_len]).to_string();
    let status = head[9..12].parse::<u16>().unwrap();

    let mut response = Response {
        status,
        head,
        body: Vec::new(),
    };

    let length: usize = response.header("Content-Length").unwrap().parse().unwrap();

    while buf.len() < head_len + length {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }

    response.body = buf[head_len..head_len + length].to_vec();

    Some(response)
}

struct TestServer {
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    store: MemoryStore,
    dir: PathBuf,
    server: Option<thread::JoinHandle<()>>,
    background: Option<BackgroundWorkers>,
}

impl TestServer {
    /// Start the HTTP workers, and optionally the background threads.
    fn start(name: &str, background: bool) -> TestServer {
        let dir = std::env::temp_dir().join(format!("turfwar-it-{}-{name}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("index.html"), INDEX_HTML).unwrap();
        fs::write(dir.join("about.html"), "<p>about</p>").unwrap();
        fs::write(dir.join("user.html"), "<p>user</p>").unwrap();
        fs::write(dir.join("favicon.ico"), [0u8, 0, 1, 0]).unwrap();

        // Start well in the past so any rewrite counts as newer.
        let past = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(dir.join("index.html"))
            .unwrap()
            .set_modified(past)
            .unwrap();

        let store = MemoryStore::new();
        let (score, recent) = workers::initial_documents(&store).unwrap();
        let assets = AssetStore::load(&dir, score, recent).unwrap();

        let ctx = Arc::new(ServerContext::new(
            assets,
            Duration::from_millis(1000),
            SignalTracker::new(),
        ));

        let stream = ConnectionStream::new(ctx.clone(), "127.0.0.1", 0).unwrap();
        let addr = stream.local_addr().unwrap();

        let background = if background {
            let connector: Arc<dyn StoreConnector> = Arc::new(store.clone());
            let mut b = BackgroundWorkers::spawn(&ctx, connector).unwrap();
            b.spawn_asset_worker(&ctx).unwrap();
            Some(b)
        } else {
            None
        };

        let server = thread::spawn(move || server::serve(stream, 4));

        TestServer {
            addr,
            ctx,
            store,
            dir,
            server: Some(server),
            background,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream
    }

    fn send(&self, stream: &mut TcpStream, path: &str, headers: &[&str]) {
        let mut req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n");
        for h in headers {
            req += h;
            req += "\r\n";
        }
        req += "\r\n";
        stream.write_all(req.as_bytes()).unwrap();
    }

    /// One request on a fresh connection.
    fn get(&self, path: &str, headers: &[&str]) -> Response {
        let mut stream = self.connect();
        self.send(&mut stream, path, headers);
        read_response(&mut stream).expect("a response")
    }

    fn stop(&mut self) {
        self.ctx.signals.request_shutdown();

        if let Some(h) = self.server.take() {
            h.join().unwrap();
        }

        if let Some(b) = self.background.take() {
            b.join(&self.ctx);
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
        fs::remove_dir_all(&self.dir).ok();
    }
}

fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let give_up = Instant::now() + timeout;
    while Instant::now() < give_up {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn serves_homepage() {
    let server = TestServer::start("homepage", false);

    let res = server.get("/", &[]);

    assert_eq!(res.status, 200);
    assert_eq!(res.body, INDEX_HTML.as_bytes());
    assert_eq!(res.header("Content-Length"), Some(INDEX_HTML.len().to_string().as_str()));
    assert_eq!(res.header("Server"), Some("turfwar"));
    assert_eq!(res.header("Access-Control-Allow-Origin"), Some("*"));
    assert!(res.header("Date").unwrap().ends_with(" GMT"));
    assert!(res.header("Last-Modified").is_some());

    let res = server.get("/favicon.ico", &[]);
    assert_eq!(res.header("Content-Type"), Some("image/vnd.microsoft.icon"));
    assert_eq!(res.body, vec![0u8, 0, 1, 0]);

    let res = server.get("/missing", &[]);
    assert_eq!(res.status, 404);
}

#[test]
fn gzip_body_decodes_to_original() {
    let server = TestServer::start("gzip", false);

    let res = server.get("/index.html", &["Accept-Encoding: gzip, deflate"]);

    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Encoding"), Some("gzip"));
    assert_eq!(res.header("Vary"), Some("Accept-Encoding"));

    let mut plain = Vec::new();
    GzDecoder::new(&res.body[..]).read_to_end(&mut plain).unwrap();
    assert_eq!(plain, INDEX_HTML.as_bytes());
}

#[test]
fn claim_shows_up_in_recent() {
    let server = TestServer::start("claim-recent", true);

    let res = server.get("/claim?name=Alice", &["X-Forwarded-For: 1.2.3.4"]);
    assert_eq!(res.status, 200);
    assert!(res.text().contains("Alice"));
    assert!(res.text().contains("The land at 1.2.3.4 was claimed for"));

    let found = eventually(Duration::from_secs(5), || {
        let res = server.get("/recent", &[]);
        assert_eq!(res.header("Content-Type"), Some("application/json"));
        assert_eq!(res.header("Cache-Control"), Some("max-age=0, must-revalidate"));

        let doc = json::parse(&res.text()).unwrap();
        doc["recent"]
            .members()
            .any(|r| r[0] == 16909060 && r[1] == "Alice")
    });

    assert!(found);
    assert_eq!(server.store.owner(16909060).unwrap().0, "Alice");
}

#[test]
fn claims_survive_storage_outage() {
    let server = TestServer::start("outage", true);
    server.store.fail_next_writes(2);

    let res = server.get("/claim?name=Bob", &["X-Forwarded-For: 10.0.0.1"]);
    assert_eq!(res.status, 200);

    assert!(eventually(Duration::from_secs(10), || server
        .store
        .owner(0x0a000001)
        .is_some()));

    assert!(server.store.connect_count() >= 3);
}

#[test]
fn full_queue_answers_502() {
    // No claim worker, so nothing drains the queue.
    let server = TestServer::start("queue-full", false);

    let mut n = 0u32;
    while n < QUEUE_MAX as u32 {
        let mut stream = server.connect();
        for _ in 0..MSG_MAX {
            if n == QUEUE_MAX as u32 {
                break;
            }
            let ip = std::net::Ipv4Addr::from(0x0b000000 + n);
            let xff = format!("X-Forwarded-For: {ip}");
            server.send(&mut stream, "/claim?name=filler", &[&xff]);
            assert_eq!(read_response(&mut stream).unwrap().status, 200);
            n += 1;
        }
    }

    assert_eq!(server.ctx.claims.len(), QUEUE_MAX);

    let start = Instant::now();
    let res = server.get("/claim?name=late", &["X-Forwarded-For: 12.0.0.1"]);

    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(res.status, 502);
    assert_eq!(res.text(), "Claims Queue Full");
    assert_eq!(res.header("Connection"), Some("close"));
    assert_eq!(server.ctx.claims.len(), QUEUE_MAX);
}

#[test]
fn ipv6_forwarded_claim_rejected() {
    let server = TestServer::start("ipv6", false);

    let res = server.get("/claim?name=Alice", &["X-Forwarded-For: 2001:db8::1"]);

    assert_eq!(res.status, 400);
    assert!(res.head.starts_with("HTTP/1.1 400 Need IPv4\r\n"));
    assert_eq!(res.text(), "IPv4 Games only supports IPv4 right now");
    assert!(server.ctx.claims.is_empty());
}

#[test]
fn invalid_name_rejected() {
    let server = TestServer::start("bad-name", false);

    let res = server.get("/claim?name=bad%20name!!", &[]);

    assert_eq!(res.status, 400);
    assert!(res.head.starts_with("HTTP/1.1 400 Invalid Name\r\n"));
    assert_eq!(res.text(), "invalid name");
    assert_eq!(res.header("Cache-Control"), Some("private"));
    assert!(server.ctx.claims.is_empty());
}

#[test]
fn ip_endpoint_echoes_address() {
    let server = TestServer::start("ip", false);

    let res = server.get("/ip", &[]);
    assert_eq!(res.text(), "127.0.0.1");
    assert_eq!(res.header("Content-Type"), Some("text/plain"));

    let res = server.get("/ip", &["X-Forwarded-For: 8.8.4.4:1234"]);
    assert_eq!(res.text(), "8.8.4.4");
}

#[test]
fn keep_alive_is_capped() {
    let server = TestServer::start("keepalive", false);
    let mut stream = server.connect();

    for _ in 0..MSG_MAX {
        server.send(&mut stream, "/", &[]);
        let res = read_response(&mut stream).unwrap();
        assert_eq!(res.status, 200);
    }

    // The server hung up after the last allowed message.
    let _ = stream.write_all(b"GET / HTTP/1.1\r\n\r\n");
    assert!(read_response(&mut stream).is_none());
}

#[test]
fn edited_asset_is_reloaded_without_torn_reads() {
    let server = Arc::new(TestServer::start("reload", true));
    let before = server.get("/", &[]);

    let updated = "<!doctype html>\n<h1>New and improved</h1>\n".repeat(50);
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let server = server.clone();
        let done = done.clone();
        let updated = updated.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                let res = server.get("/", &[]);
                let body = res.text();
                assert!(body == INDEX_HTML || body == updated, "torn body: {body:?}");
                assert_eq!(res.header("Content-Length"), Some(body.len().to_string().as_str()));
            }
        })
    };

    // Swap the file in whole so the poller never sees a partial write.
    let staged = server.dir.join("index.html.new");
    fs::write(&staged, &updated).unwrap();
    fs::File::options()
        .write(true)
        .open(&staged)
        .unwrap()
        .set_modified(SystemTime::now())
        .unwrap();
    fs::rename(&staged, server.dir.join("index.html")).unwrap();

    let reloaded = eventually(Duration::from_secs(5), || server.get("/", &[]).text() == updated);

    done.store(true, Ordering::Relaxed);
    reader.join().unwrap();

    assert!(reloaded);

    let after = server.get("/", &[]);
    assert_ne!(after.header("Last-Modified"), before.header("Last-Modified"));
}

#[test]
fn shutdown_stops_server() {
    let mut server = TestServer::start("shutdown", true);
    assert_eq!(server.get("/", &[]).status, 200);

    let start = Instant::now();
    server.stop();
    assert!(start.elapsed() < Duration::from_secs(10));

    assert!(server.server.is_none());
}

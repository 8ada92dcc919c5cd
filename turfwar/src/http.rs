//! HTTP/1.1 connection handling.
//!
//! Each connection runs a strict request/response loop without
//! pipelining: one read per request, one response per read.  The
//! connection stays open only while both sides are provably in sync.
use crate::asset::{Asset, AssetStore};
use crate::claim::Claim;
use crate::result::TurfResult;
use crate::server::ServerContext;
use std::io::{self, IoSlice, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Most requests served over one connection.
pub const MSG_MAX: usize = 10;

/// A request must arrive in one read of this size.
pub const INBUF_SIZE: usize = 4096;

/// Initial capacity of the response header buffer.
const OUTBUF_SIZE: usize = 4096;

/// How long (milliseconds) a claim may wait for room in the queue.
pub const CLAIM_DEADLINE_MS: u64 = 100;

const MAX_HEADERS: usize = 64;

const STANDARD_HEADERS: &str = "Server: turfwar\r\n\
    Referrer-Policy: origin\r\n\
    Access-Control-Allow-Origin: *\r\n";

const NOT_FOUND_PAGE: &str = "<!doctype html>\r\n\
    <title>404 not found</title>\r\n\
    <h1>404 not found</h1>\r\n";

const NEED_IPV4: &str = "IPv4 Games only supports IPv4 right now";
const INVALID_NAME: &str = "invalid name";
const QUEUE_FULL: &str = "Claims Queue Full";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Other,
}

/// Where a request URI leads.
#[derive(Debug)]
pub enum Route<'a> {
    Asset(&'a Asset),
    Ip,
    Claim,
    NotFound,
}

/// Map a request URI onto a handler by prefix.
pub fn route<'a>(assets: &'a AssetStore, uri: &str) -> Route<'a> {
    if uri == "/" || uri.starts_with("/index.html") {
        Route::Asset(&assets.index)
    } else if uri.starts_with("/favicon.ico") {
        Route::Asset(&assets.favicon)
    } else if uri.starts_with("/about.html") {
        Route::Asset(&assets.about)
    } else if uri.starts_with("/user.html") {
        Route::Asset(&assets.user)
    } else if uri.starts_with("/score") {
        Route::Asset(&assets.score)
    } else if uri.starts_with("/recent") {
        Route::Asset(&assets.recent)
    } else if uri.starts_with("/ip") {
        Route::Ip
    } else if uri.starts_with("/claim") {
        Route::Claim
    } else {
        Route::NotFound
    }
}

/// Client address from an X-Forwarded-For value: the last entry,
/// with or without a port.  None means it is not IPv4.
///
/// ```
/// use std::net::Ipv4Addr;
/// use turfwar::http::parse_forwarded;
///
/// assert_eq!(parse_forwarded("1.2.3.4"), Some(Ipv4Addr::new(1, 2, 3, 4)));
/// assert_eq!(parse_forwarded("9.9.9.9, 1.2.3.4:5555"), Some(Ipv4Addr::new(1, 2, 3, 4)));
/// assert_eq!(parse_forwarded("2001:db8::1"), None);
/// assert_eq!(parse_forwarded(""), None);
/// ```
pub fn parse_forwarded(value: &str) -> Option<Ipv4Addr> {
    let last = value.rsplit(',').next()?.trim();

    if let Ok(ip) = last.parse::<Ipv4Addr>() {
        return Some(ip);
    }

    last.parse::<SocketAddrV4>().ok().map(|sa| *sa.ip())
}

/// First `name` query parameter that makes a valid claim.
///
/// ```
/// use turfwar::http::nick_from_uri;
///
/// assert_eq!(nick_from_uri("/claim?name=Alice").as_deref(), Some("Alice"));
/// assert_eq!(nick_from_uri("/claim?x=1&name=a%40b").as_deref(), Some("a@b"));
/// assert_eq!(nick_from_uri("/claim?name=bad+name!!&name=ok").as_deref(), Some("ok"));
/// assert_eq!(nick_from_uri("/claim?name=bad+name!!"), None);
/// assert_eq!(nick_from_uri("/claim"), None);
/// ```
pub fn nick_from_uri(uri: &str) -> Option<String> {
    let (_, query) = uri.split_once('?')?;

    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(k, _)| k == "name")
        .map(|(_, v)| v)
        .find(|v| crate::claim::is_valid_nick(v))
        .map(|v| v.into_owned())
}

/// The parts of a parsed request we act on.  Owned so the input
/// buffer is free again once we have it.
#[derive(Debug)]
struct RequestInfo {
    method: Method,
    uri: String,
    accepts_gzip: bool,
    forwarded_for: Option<String>,
    /// Content-Length or Transfer-Encoding was present.
    declares_body: bool,
    /// Bytes of the read consumed by the request head.
    length: usize,
}

impl RequestInfo {
    /// None if the bytes are not one complete HTTP/1.1 request head.
    fn parse(bytes: &[u8]) -> Option<RequestInfo> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let length = match req.parse(bytes) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return None,
            Err(e) => {
                log::trace!("Bad request: {e}");
                return None;
            }
        };

        if req.version != Some(1) {
            return None;
        }

        let method = match req.method {
            Some("GET") => Method::Get,
            Some("HEAD") => Method::Head,
            _ => Method::Other,
        };

        let mut info = RequestInfo {
            method,
            uri: req.path.unwrap_or("/").to_string(),
            accepts_gzip: false,
            forwarded_for: None,
            declares_body: false,
            length,
        };

        for header in req.headers.iter() {
            let name = header.name;

            if name.eq_ignore_ascii_case("accept-encoding") {
                let value = String::from_utf8_lossy(header.value);
                info.accepts_gzip |= value.contains("gzip");
            } else if name.eq_ignore_ascii_case("x-forwarded-for") {
                info.forwarded_for = Some(String::from_utf8_lossy(header.value).to_string());
            } else if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                info.declares_body = true;
            }
        }

        Some(info)
    }
}

/// Write the head and body as one vectored write.
///
/// Returns true if the kernel took the whole message in one go.  A
/// short write is finished off with plain writes, but the caller
/// should not trust the connection any further.
pub fn write_message<W: Write>(stream: &mut W, head: &[u8], body: &[u8]) -> io::Result<bool> {
    let total = head.len() + body.len();
    let sent = stream.write_vectored(&[IoSlice::new(head), IoSlice::new(body)])?;

    if sent == total {
        return Ok(true);
    }

    if sent < head.len() {
        stream.write_all(&head[sent..])?;
        stream.write_all(body)?;
    } else {
        stream.write_all(&body[sent - head.len()..])?;
    }

    stream.flush()?;

    Ok(false)
}

/// Outcome of one response.
struct Sent {
    /// Whole message went out in one write.
    in_sync: bool,
    /// The response asked for the connection to be closed.
    close: bool,
}

/// Per-worker connection handler.  Owns the worker's buffers.
pub struct HttpHandler {
    ctx: Arc<ServerContext>,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
}

impl HttpHandler {
    pub fn new(ctx: Arc<ServerContext>) -> HttpHandler {
        HttpHandler {
            ctx,
            inbuf: vec![0; INBUF_SIZE],
            outbuf: Vec::with_capacity(OUTBUF_SIZE),
        }
    }

    /// Serve requests on one connection until it should be closed.
    ///
    /// I/O errors end the connection and are returned for logging.
    pub fn serve<S: Read + Write>(&mut self, stream: &mut S, peer: IpAddr) -> TurfResult<()> {
        let mut msgcount = 0;

        loop {
            let got = match stream.read(&mut self.inbuf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) => match e.kind() {
                    // Idle keep-alive connection timed out.
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => return Ok(()),
                    _ => return Err(e.into()),
                },
            };

            let info = match RequestInfo::parse(&self.inbuf[..got]) {
                Some(i) => i,
                None => return Ok(()),
            };

            let sent = self.respond(stream, &info, peer)?;

            msgcount += 1;

            let keep_alive = got == info.length
                && sent.in_sync
                && !sent.close
                && msgcount < MSG_MAX
                && !info.declares_body
                && info.method != Method::Other
                && !self.ctx.signals.shutdown_requested();

            if !keep_alive {
                return Ok(());
            }
        }
    }

    fn respond<S: Write>(
        &mut self,
        stream: &mut S,
        info: &RequestInfo,
        peer: IpAddr,
    ) -> TurfResult<Sent> {
        // The address we report and claim for.
        let client = match info.forwarded_for {
            Some(ref xff) => parse_forwarded(xff),
            None => match peer {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(ip) => ip.to_ipv4_mapped(),
            },
        };

        let ctx = self.ctx.clone();

        match route(&ctx.assets, &info.uri) {
            Route::Asset(asset) => self.send_asset(stream, info, asset),
            Route::Ip => match client {
                Some(ip) => {
                    let body = ip.to_string();
                    self.send_simple(
                        stream,
                        info,
                        "200 OK",
                        "text/plain",
                        Some("max-age=3600, private"),
                        false,
                        body.as_bytes(),
                    )
                }
                None => self.send_need_ipv4(stream, info, peer),
            },
            Route::Claim => match client {
                Some(ip) => self.send_claim(stream, info, ip),
                None => self.send_need_ipv4(stream, info, peer),
            },
            Route::NotFound => {
                log::debug!("{peer}: 404 not found {:?}", info.uri);
                self.send_simple(
                    stream,
                    info,
                    "404 Not Found",
                    "text/html; charset=utf-8",
                    None,
                    false,
                    NOT_FOUND_PAGE.as_bytes(),
                )
            }
        }
    }

    fn begin_head(&mut self, status: &str) {
        self.outbuf.clear();
        self.outbuf.extend_from_slice(b"HTTP/1.1 ");
        self.outbuf.extend_from_slice(status.as_bytes());
        self.outbuf.extend_from_slice(b"\r\n");
        self.outbuf.extend_from_slice(STANDARD_HEADERS.as_bytes());
    }

    fn add_header(&mut self, name: &str, value: &str) {
        self.outbuf.extend_from_slice(name.as_bytes());
        self.outbuf.extend_from_slice(b": ");
        self.outbuf.extend_from_slice(value.as_bytes());
        self.outbuf.extend_from_slice(b"\r\n");
    }

    fn add_date(&mut self) {
        self.outbuf.extend_from_slice(b"Date: ");
        self.ctx.now.write_http_date(&mut self.outbuf);
        self.outbuf.extend_from_slice(b"\r\n");
    }

    fn end_head(&mut self, content_length: usize) {
        self.add_header("Content-Length", &content_length.to_string());
        self.outbuf.extend_from_slice(b"\r\n");
    }

    /// HEAD gets the headers of the equivalent GET and no body.
    fn finish<S: Write>(
        &mut self,
        stream: &mut S,
        info: &RequestInfo,
        body: &[u8],
        close: bool,
    ) -> TurfResult<Sent> {
        let body = match info.method {
            Method::Head => &[][..],
            _ => body,
        };

        let in_sync = write_message(stream, &self.outbuf, body)?;

        Ok(Sent { in_sync, close })
    }

    fn send_asset<S: Write>(
        &mut self,
        stream: &mut S,
        info: &RequestInfo,
        asset: &Asset,
    ) -> TurfResult<Sent> {
        // Our own reference to this generation, so a concurrent swap
        // can't pull the body out from under the write.
        let generation = asset.current();
        let body = generation.body(info.accepts_gzip);

        self.begin_head("200 OK");
        self.add_header("Vary", "Accept-Encoding");
        self.add_date();
        self.add_header("Last-Modified", generation.last_modified());
        self.add_header("Content-Type", generation.content_type());
        self.add_header("Cache-Control", generation.cache_control());
        if info.accepts_gzip {
            self.add_header("Content-Encoding", "gzip");
        }
        self.end_head(body.len());

        self.finish(stream, info, body, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn send_simple<S: Write>(
        &mut self,
        stream: &mut S,
        info: &RequestInfo,
        status: &str,
        content_type: &str,
        cache_control: Option<&str>,
        close: bool,
        body: &[u8],
    ) -> TurfResult<Sent> {
        self.begin_head(status);
        self.add_header("Content-Type", content_type);
        if let Some(cc) = cache_control {
            self.add_header("Cache-Control", cc);
        }
        if close {
            self.add_header("Connection", "close");
        }
        self.add_date();
        self.end_head(body.len());

        self.finish(stream, info, body, close)
    }

    fn send_need_ipv4<S: Write>(
        &mut self,
        stream: &mut S,
        info: &RequestInfo,
        peer: IpAddr,
    ) -> TurfResult<Sent> {
        log::debug!(
            "{} via {peer}: 400 Need IPv4",
            info.forwarded_for.as_deref().unwrap_or("-")
        );

        self.send_simple(
            stream,
            info,
            "400 Need IPv4",
            "text/plain",
            Some("private"),
            true,
            NEED_IPV4.as_bytes(),
        )
    }

    fn send_claim<S: Write>(
        &mut self,
        stream: &mut S,
        info: &RequestInfo,
        ip: Ipv4Addr,
    ) -> TurfResult<Sent> {
        let claim = match nick_from_uri(&info.uri)
            .and_then(|nick| Claim::new(ip, self.ctx.now.epoch_secs(), &nick))
        {
            Some(c) => c,
            None => {
                log::info!("{ip}: 400 invalid name");
                return self.send_simple(
                    stream,
                    info,
                    "400 Invalid Name",
                    "text/plain",
                    Some("private"),
                    true,
                    INVALID_NAME.as_bytes(),
                );
            }
        };

        let page = claim_page(&claim);
        let deadline = Instant::now() + Duration::from_millis(CLAIM_DEADLINE_MS);

        if !self.ctx.claims.enqueue(claim.clone(), deadline) {
            log::warn!("{ip}: 502 Claims Queue Full");
            return self.send_simple(
                stream,
                info,
                "502 Claims Queue Full",
                "text/plain",
                Some("private"),
                true,
                QUEUE_FULL.as_bytes(),
            );
        }

        log::info!("{claim}");

        self.send_simple(
            stream,
            info,
            "200 OK",
            "text/html",
            Some("private"),
            false,
            page.as_bytes(),
        )
    }
}

/// Confirmation page for an accepted claim.  Nicknames are limited to
/// characters which need no HTML escaping.
fn claim_page(claim: &Claim) -> String {
    let ip = claim.ip();
    let nick = claim.nick();

    format!(
        "<!doctype html>\n\
        <title>The land at {ip} was claimed for {nick}.</title>\n\
        <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
        The land at {ip} was claimed for <a href=\"/user.html?name={nick}\">{nick}</a>.\n\
        <p>\n\
        <a href=/>Back to homepage</a>\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::tests::scratch_dir;
    use crate::asset::AssetStore;
    use crate::server::ServerContext;
    use crate::workers;
    use mptc::signals::SignalTracker;
    use std::collections::VecDeque;
    use std::fs;

    /// Stream which hands out one scripted chunk per read.
    struct ScriptedStream {
        input: VecDeque<Vec<u8>>,
        output: Vec<u8>,
        /// Most bytes accepted by a single write call.
        write_limit: usize,
    }

    impl ScriptedStream {
        fn new(requests: &[&str]) -> Self {
            ScriptedStream {
                input: requests.iter().map(|r| r.as_bytes().to_vec()).collect(),
                output: Vec::new(),
                write_limit: usize::MAX,
            }
        }

        fn output(&self) -> String {
            String::from_utf8_lossy(&self.output).to_string()
        }

        fn responses(&self) -> usize {
            self.output().matches("HTTP/1.1 ").count()
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.input.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.write_limit);
            self.output.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            let mut total = 0;
            for buf in bufs {
                let n = buf.len().min(self.write_limit - total);
                self.output.extend_from_slice(&buf[..n]);
                total += n;
            }
            Ok(total)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn context(name: &str) -> Arc<ServerContext> {
        let dir = scratch_dir(name);
        fs::write(dir.join("index.html"), "<h1>home</h1>").unwrap();
        fs::write(dir.join("about.html"), "about").unwrap();
        fs::write(dir.join("user.html"), "user").unwrap();
        fs::write(dir.join("favicon.ico"), [0u8, 1, 2, 3]).unwrap();

        let assets = AssetStore::load(
            &dir,
            workers::empty_score().unwrap(),
            workers::empty_recent().unwrap(),
        )
        .unwrap();

        Arc::new(ServerContext::new(
            assets,
            Duration::from_millis(1000),
            SignalTracker::new(),
        ))
    }

    fn local() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    const GET_INDEX: &str = "GET / HTTP/1.1\r\nHost: x\r\n\r\n";

    #[test]
    fn routes_by_prefix() {
        let ctx = context("routes");
        let a = &ctx.assets;

        assert!(matches!(route(a, "/"), Route::Asset(x) if std::ptr::eq(x, &a.index)));
        assert!(matches!(route(a, "/index.html?x"), Route::Asset(x) if std::ptr::eq(x, &a.index)));
        assert!(matches!(route(a, "/scoreboard"), Route::Asset(x) if std::ptr::eq(x, &a.score)));
        assert!(matches!(route(a, "/recent"), Route::Asset(x) if std::ptr::eq(x, &a.recent)));
        assert!(matches!(route(a, "/ip"), Route::Ip));
        assert!(matches!(route(a, "/claim?name=x"), Route::Claim));
        assert!(matches!(route(a, "/nope"), Route::NotFound));
        assert!(matches!(route(a, "/?"), Route::NotFound));
    }

    #[test]
    fn serves_asset_with_headers() {
        let ctx = context("serve-asset");
        let mut handler = HttpHandler::new(ctx);
        let mut stream = ScriptedStream::new(&[GET_INDEX]);

        handler.serve(&mut stream, local()).unwrap();

        let out = stream.output();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\nServer: turfwar\r\n"));
        assert!(out.contains("Referrer-Policy: origin\r\n"));
        assert!(out.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(out.contains("Vary: Accept-Encoding\r\n"));
        assert!(out.contains("Content-Type: text/html; charset=utf-8\r\n"));
        assert!(out.contains("Cache-Control: max-age=3600, must-revalidate\r\n"));
        assert!(out.contains("Content-Length: 13\r\n"));
        assert!(!out.contains("Content-Encoding"));
        assert!(out.ends_with("\r\n\r\n<h1>home</h1>"));
    }

    #[test]
    fn head_omits_body() {
        let ctx = context("head");
        let mut handler = HttpHandler::new(ctx);
        let mut stream = ScriptedStream::new(&["HEAD / HTTP/1.1\r\n\r\n", GET_INDEX]);

        handler.serve(&mut stream, local()).unwrap();

        let out = stream.output();
        assert_eq!(stream.responses(), 2);
        assert!(out.contains("Content-Length: 13\r\n\r\nHTTP/1.1 200 OK"));
    }

    #[test]
    fn keep_alive_stops_at_message_cap() {
        let ctx = context("msg-cap");
        let mut handler = HttpHandler::new(ctx);
        let requests = vec![GET_INDEX; MSG_MAX + 5];
        let mut stream = ScriptedStream::new(&requests);

        handler.serve(&mut stream, local()).unwrap();

        assert_eq!(stream.responses(), MSG_MAX);
        assert_eq!(stream.input.len(), 5);
    }

    #[test]
    fn pipelined_or_bodied_requests_end_connection() {
        let ctx = context("pipeline");
        let mut handler = HttpHandler::new(ctx.clone());

        let two = format!("{GET_INDEX}{GET_INDEX}");
        let mut stream = ScriptedStream::new(&[two.as_str(), GET_INDEX]);
        handler.serve(&mut stream, local()).unwrap();
        assert_eq!(stream.responses(), 1);

        let post = "GET / HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
        let mut stream = ScriptedStream::new(&[post, GET_INDEX]);
        handler.serve(&mut stream, local()).unwrap();
        assert_eq!(stream.responses(), 1);

        let old = "GET / HTTP/1.0\r\n\r\n";
        let mut stream = ScriptedStream::new(&[old]);
        handler.serve(&mut stream, local()).unwrap();
        assert_eq!(stream.responses(), 0);

        let mut stream = ScriptedStream::new(&["garbage\r\n\r\n"]);
        handler.serve(&mut stream, local()).unwrap();
        assert_eq!(stream.responses(), 0);

        // Only GET and HEAD may keep the connection, even without a body.
        for method in ["OPTIONS", "DELETE"] {
            let req = format!("{method} / HTTP/1.1\r\nHost: x\r\n\r\n");
            let mut stream = ScriptedStream::new(&[req.as_str(), GET_INDEX]);
            handler.serve(&mut stream, local()).unwrap();
            assert_eq!(stream.responses(), 1, "{method} kept the connection");
            assert_eq!(stream.input.len(), 1);
        }
    }

    #[test]
    fn short_write_completes_then_closes() {
        let ctx = context("short-write");
        let mut handler = HttpHandler::new(ctx);
        let mut stream = ScriptedStream::new(&[GET_INDEX, GET_INDEX]);
        stream.write_limit = 10;

        handler.serve(&mut stream, local()).unwrap();

        assert_eq!(stream.responses(), 1);
        assert!(stream.output().ends_with("<h1>home</h1>"));
    }

    #[test]
    fn gzip_when_accepted() {
        let ctx = context("gzip");
        let mut handler = HttpHandler::new(ctx.clone());
        let mut stream = ScriptedStream::new(&[
            "GET /index.html HTTP/1.1\r\nAccept-Encoding: br, gzip\r\n\r\n",
        ]);

        handler.serve(&mut stream, local()).unwrap();

        let gz = ctx.assets.index.current().gzip().to_vec();
        assert!(stream.output().contains("Content-Encoding: gzip\r\n"));
        assert!(stream.output.ends_with(&gz));
    }

    #[test]
    fn ip_echo_and_forwarding() {
        let ctx = context("ip");
        let mut handler = HttpHandler::new(ctx);

        let mut stream = ScriptedStream::new(&["GET /ip HTTP/1.1\r\n\r\n"]);
        handler.serve(&mut stream, local()).unwrap();
        assert!(stream.output().contains("Cache-Control: max-age=3600, private\r\n"));
        assert!(stream.output().ends_with("\r\n\r\n127.0.0.1"));

        let mut stream = ScriptedStream::new(&[
            "GET /ip HTTP/1.1\r\nX-Forwarded-For: 5.6.7.8, 1.2.3.4\r\n\r\n",
        ]);
        handler.serve(&mut stream, local()).unwrap();
        assert!(stream.output().ends_with("\r\n\r\n1.2.3.4"));

        let mut stream = ScriptedStream::new(&[
            "GET /ip HTTP/1.1\r\nX-Forwarded-For: 2001:db8::1\r\n\r\n",
            GET_INDEX,
        ]);
        handler.serve(&mut stream, local()).unwrap();
        let out = stream.output();
        assert!(out.starts_with("HTTP/1.1 400 Need IPv4\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.ends_with(NEED_IPV4));
        assert_eq!(stream.responses(), 1);
    }

    #[test]
    fn claims_are_queued() {
        let ctx = context("claim");
        let mut handler = HttpHandler::new(ctx.clone());

        let mut stream = ScriptedStream::new(&[
            "GET /claim?name=Alice HTTP/1.1\r\nX-Forwarded-For: 1.2.3.4\r\n\r\n",
            "GET /claim?name=bad+name!! HTTP/1.1\r\n\r\n",
            GET_INDEX,
        ]);
        handler.serve(&mut stream, local()).unwrap();

        let out = stream.output();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("The land at 1.2.3.4 was claimed for <a href=\"/user.html?name=Alice\">Alice</a>."));
        assert!(out.contains("HTTP/1.1 400 Invalid Name\r\n"));
        assert!(out.ends_with(INVALID_NAME));
        assert_eq!(stream.responses(), 2);

        let queued = ctx.claims.drain_up_to(10, Some(Instant::now()));
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].ip(), Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(queued[0].nick(), "Alice");
    }

    #[test]
    fn not_found_keeps_connection() {
        let ctx = context("404");
        let mut handler = HttpHandler::new(ctx);
        let mut stream = ScriptedStream::new(&["GET /missing HTTP/1.1\r\n\r\n", GET_INDEX]);

        handler.serve(&mut stream, local()).unwrap();

        let out = stream.output();
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.contains(NOT_FOUND_PAGE));
        assert_eq!(stream.responses(), 2);
    }
}

//! Shared server state and the glue between the listening socket, the
//! mptc worker pool, and the HTTP handler.
use crate::asset::AssetStore;
use crate::http::HttpHandler;
use crate::now::NowCache;
use crate::queue::ClaimQueue;
use crate::result::{TurfError, TurfResult};
use crate::workers::RecentTrigger;
use mptc::signals::SignalTracker;
use socket2::{Domain, Socket, Type};
use std::any::Any;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// Listen backlog.  Connections wait here while every worker is busy.
const LISTEN_BACKLOG: i32 = 1024;

/// Everything the connection workers and background threads share.
/// Built once at startup and handed to each thread as an Arc.
pub struct ServerContext {
    /// Read and write timeout for client connections.
    pub keepalive: Duration,
    pub assets: AssetStore,
    pub now: NowCache,
    pub claims: ClaimQueue,
    pub recent: RecentTrigger,
    pub signals: SignalTracker,
}

impl ServerContext {
    pub fn new(assets: AssetStore, keepalive: Duration, signals: SignalTracker) -> ServerContext {
        ServerContext {
            keepalive,
            assets,
            now: NowCache::new(),
            claims: ClaimQueue::new(signals.clone()),
            recent: RecentTrigger::new(signals.clone()),
            signals,
        }
    }
}

/// One accepted client connection.
struct ConnectionRequest {
    stream: TcpStream,
    address: SocketAddr,
}

impl ConnectionRequest {
    fn downcast(request: &mut Box<dyn mptc::Request>) -> Result<&mut ConnectionRequest, String> {
        request
            .as_any_mut()
            .downcast_mut::<ConnectionRequest>()
            .ok_or_else(|| "ConnectionRequest::downcast() given wrong type".to_string())
    }
}

impl mptc::Request for ConnectionRequest {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct ConnectionHandler {
    http: HttpHandler,
    keepalive: Duration,
}

impl ConnectionHandler {
    fn handle(&mut self, request: &mut ConnectionRequest) -> TurfResult<()> {
        // Hang up on clients that lag.
        request.stream.set_read_timeout(Some(self.keepalive))?;
        request.stream.set_write_timeout(Some(self.keepalive))?;
        request.stream.set_nodelay(true)?;

        let peer = request.address.ip();
        self.http.serve(&mut request.stream, peer)
    }
}

impl mptc::RequestHandler for ConnectionHandler {
    fn worker_start(&mut self) -> Result<(), String> {
        log::trace!("HTTP worker starting");
        Ok(())
    }

    fn worker_end(&mut self) -> Result<(), String> {
        log::trace!("HTTP worker exiting");
        Ok(())
    }

    fn process(&mut self, mut request: Box<dyn mptc::Request>) -> Result<(), String> {
        let request = ConnectionRequest::downcast(&mut request)?;

        let result = self.handle(request);

        // Close our side no matter how the conversation ended.  The
        // client may already be gone.
        request.stream.shutdown(Shutdown::Both).ok();

        result.map_err(|e| format!("{}: {e}", request.address))
    }
}

/// Accepts client connections for the mptc server.
pub struct ConnectionStream {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl ConnectionStream {
    pub fn new(ctx: Arc<ServerContext>, address: &str, port: u16) -> TurfResult<ConnectionStream> {
        let listener = ConnectionStream::setup_listener(address, port)?;
        Ok(ConnectionStream { listener, ctx })
    }

    /// Where we ended up listening.  Useful when binding port 0.
    pub fn local_addr(&self) -> TurfResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn setup_listener(address: &str, port: u16) -> TurfResult<TcpListener> {
        let destination = format!("{address}:{port}");

        let address: SocketAddr = (address, port)
            .to_socket_addrs()
            .map_err(|e| format!("Error parsing listen address: {destination}: {e}"))?
            .next()
            .ok_or_else(|| format!("No usable listen address: {destination}"))?;

        let socket = Socket::new(Domain::for_address(address), Type::STREAM, None)
            .map_err(|e| TurfError::Io(format!("Socket::new() failed with {e}")))?;

        // When we stop/start the service, the address may briefly linger
        // from open (idle) client connections.
        socket
            .set_reuse_address(true)
            .map_err(|e| TurfError::Io(format!("Error setting reuse address: {e}")))?;

        #[cfg(unix)]
        socket
            .set_reuse_port(true)
            .map_err(|e| TurfError::Io(format!("Error setting reuse port: {e}")))?;

        socket
            .bind(&address.into())
            .map_err(|e| TurfError::Io(format!("Error binding to address: {destination}: {e}")))?;

        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| TurfError::Io(format!("Error listening on socket {destination}: {e}")))?;

        // We need a read timeout so we can wake periodically to check
        // for shutdown signals.
        let polltime = Duration::from_millis(mptc::SIGNAL_POLL_INTERVAL);

        socket
            .set_read_timeout(Some(polltime))
            .map_err(|e| TurfError::Io(format!("Error setting socket read_timeout: {e}")))?;

        log::info!("turfwar listening at {destination}");

        Ok(socket.into())
    }
}

impl mptc::RequestStream for ConnectionStream {
    fn next(&mut self) -> Result<Option<Box<dyn mptc::Request>>, String> {
        let (stream, address) = match self.listener.accept() {
            Ok((s, a)) => (s, a),
            Err(e) => match e.kind() {
                // Accept timed out.  Give the server a chance to
                // check for shutdown.
                std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted => return Ok(None),
                // The client hung up before we got to it.
                std::io::ErrorKind::ConnectionAborted => return Ok(None),
                _ => return Err(format!("accept() failed: {e}")),
            },
        };

        log::trace!("Accepted connection from {address}");

        Ok(Some(Box::new(ConnectionRequest { stream, address })))
    }

    fn new_handler(&mut self) -> Box<dyn mptc::RequestHandler> {
        Box::new(ConnectionHandler {
            http: HttpHandler::new(self.ctx.clone()),
            keepalive: self.ctx.keepalive,
        })
    }

    fn shutdown(&mut self) {
        log::info!("No longer accepting connections");
    }
}

/// Run the connection worker pool on the calling thread until a
/// shutdown is requested.
pub fn serve(stream: ConnectionStream, workers: usize) {
    let signals = stream.ctx.signals.clone();

    let mut server = mptc::Server::new(Box::new(stream), signals);
    server.set_worker_count(workers);
    server.run();
}

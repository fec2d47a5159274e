//! Event-driven HTTP worker.
//!
//! Each worker owns a mio `Poll`, a clone of the listening socket and the
//! connections it accepted. Workers share the gateway, which is immutable
//! once built, so requests never contend on a lock outside handler code.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::http::{
    parse_head, write_response, HttpError, IdentityResolver, AMF_CONTENT_TYPE, MAX_HEAD_BYTES,
    TEXT_CONTENT_TYPE,
};
use super::stats::GatewayStats;
use crate::dispatch::{Gateway, STATUS_OK};

const LISTENER: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Unsent response bytes at which a connection stops taking new requests.
pub const MAX_WRITE_BACKLOG: usize = 1024 * 1024;

pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
pub const DEFAULT_SOCKET_BUFFER_BYTES: usize = 256 * 1024;
pub const DEFAULT_MAX_CONNECTIONS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    pub max_body_bytes: usize,
    pub socket_buffer_bytes: usize,
    /// Per worker.
    pub max_connections: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            socket_buffer_bytes: DEFAULT_SOCKET_BUFFER_BYTES,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Everything a worker shares with its siblings.
pub struct Shared<S> {
    pub gateway: Arc<Gateway<S>>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub stats: Arc<GatewayStats>,
    pub options: ServerOptions,
    pub running: Arc<AtomicBool>,
}

impl<S> Clone for Shared<S> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            resolver: Arc::clone(&self.resolver),
            stats: Arc::clone(&self.stats),
            options: self.options,
            running: Arc::clone(&self.running),
        }
    }
}

pub struct Server<S> {
    poll: Poll,
    listener: TcpListener,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    shared: Shared<S>,
}

impl<S: Send + Sync + 'static> Server<S> {
    /// Wrap a bound listener; it is switched to non-blocking mode.
    pub fn new(listener: StdTcpListener, shared: Shared<S>) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            connections: HashMap::new(),
            next_token: 1,
            shared,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the shared `running` flag is cleared.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        info!(addr = %self.local_addr()?, "worker listening");

        while self.shared.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_connections(),
                    token => self.service(
                        token,
                        event.is_readable() || event.is_read_closed(),
                        event.is_writable(),
                    ),
                }
            }
        }

        let open: Vec<Token> = self.connections.keys().copied().collect();
        for token in open {
            self.close(token);
        }
        info!("worker stopped");
        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.len() >= self.shared.options.max_connections {
                        warn!(%peer, "connection limit reached, rejecting");
                        continue;
                    }
                    let mut conn =
                        match Connection::new(stream, peer, self.shared.options.socket_buffer_bytes) {
                            Ok(conn) => conn,
                            Err(e) => {
                                warn!(%peer, error = %e, "failed to set up connection");
                                continue;
                            }
                        };

                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self.poll.registry().register(
                        conn.stream_mut(),
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(%peer, error = %e, "failed to register connection");
                        continue;
                    }

                    self.shared.stats.connection_opened();
                    debug!(%peer, token = token.0, "connection accepted");
                    self.connections.insert(token, conn);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn service(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        let mut alive = true;
        if readable {
            alive = serve_readable(conn, &self.shared);
        }
        if alive && (writable || conn.write_pending() > 0) {
            if let Err(e) = conn.flush_write_buffer() {
                debug!(peer = %conn.peer(), error = %e, "write failed");
                alive = false;
            }
        }
        // Backlog drained: pick up the requests that were left waiting.
        if alive && conn.is_paused() && conn.write_pending() < MAX_WRITE_BACKLOG {
            alive = serve_readable(conn, &self.shared);
        }

        if !alive || conn.should_close() {
            self.close(token);
        }
    }

    fn close(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
                debug!(error = %e, "deregister failed");
            }
            self.shared.stats.connection_closed();
            debug!(
                peer = %conn.peer(),
                requests = conn.requests_served(),
                "connection closed"
            );
        }
    }
}

/// Drain the socket and answer every complete request. `false` drops the connection.
fn serve_readable<S>(conn: &mut Connection, shared: &Shared<S>) -> bool {
    let read_limit = MAX_HEAD_BYTES + shared.options.max_body_bytes;
    loop {
        let outcome = match conn.fill_read_buffer(read_limit) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(peer = %conn.peer(), error = %e, "read failed");
                return false;
            }
        };

        let progressed = process_requests(conn, shared);
        if let Err(e) = conn.flush_write_buffer() {
            debug!(peer = %conn.peer(), error = %e, "write failed");
            return false;
        }

        // Edge-triggered: data left in the socket after a full buffer gets
        // no new event, so keep going while requests are being consumed.
        if !(outcome.hit_limit && progressed) || conn.is_closing() {
            return true;
        }
    }
}

fn process_requests<S>(conn: &mut Connection, shared: &Shared<S>) -> bool {
    let mut progressed = false;
    conn.set_paused(false);

    while !conn.is_closing() {
        if conn.write_pending() >= MAX_WRITE_BACKLOG {
            // Client is not reading; stop producing until it catches up.
            conn.set_paused(true);
            break;
        }
        let head = match parse_head(conn.readable()) {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(e) => {
                let status = match e {
                    HttpError::HeadTooLarge { .. } => 431,
                    _ => 400,
                };
                reject(conn, shared, status, &e.to_string());
                break;
            }
        };

        if !head.method.eq_ignore_ascii_case("POST") {
            reject(conn, shared, 405, "only POST is accepted");
            break;
        }
        let Some(len) = head.content_length else {
            reject(conn, shared, 411, "Content-Length required");
            break;
        };
        if len > shared.options.max_body_bytes {
            reject(conn, shared, 413, "request body too large");
            break;
        }
        let total = head.head_len + len;
        if conn.readable().len() < total {
            break;
        }

        let identity = shared.resolver.resolve(&head, conn.peer());
        let response = shared
            .gateway
            .handle(&conn.readable()[head.head_len..total], &identity);

        let keep_alive = head.keep_alive && response.status == STATUS_OK;
        write_response(
            conn.write_buffer_mut(),
            response.status,
            AMF_CONTENT_TYPE,
            &response.body,
            keep_alive,
        );
        shared
            .stats
            .request_served(len, response.body.len(), response.is_fault);

        conn.consume(total);
        conn.record_request();
        progressed = true;
        if !keep_alive {
            conn.close_after_flush();
        }
    }

    progressed
}

fn reject<S>(conn: &mut Connection, shared: &Shared<S>, status: u16, message: &str) {
    debug!(peer = %conn.peer(), status, message, "request rejected");
    write_response(
        conn.write_buffer_mut(),
        status,
        TEXT_CONTENT_TYPE,
        message.as_bytes(),
        false,
    );
    shared.stats.http_error();
    conn.close_after_flush();
}

/// Start `workers` threads serving `listener`, each with its own poll loop.
pub fn spawn_workers<S: Send + Sync + 'static>(
    listener: StdTcpListener,
    workers: usize,
    shared: Shared<S>,
) -> io::Result<Vec<JoinHandle<io::Result<()>>>> {
    let mut handles = Vec::with_capacity(workers);
    for id in 0..workers.max(1) {
        let mut server = Server::new(listener.try_clone()?, shared.clone())?;
        let running = Arc::clone(&shared.running);
        let handle = thread::Builder::new()
            .name(format!("amfgate-worker-{}", id))
            .spawn(move || {
                let result = server.run();
                if let Err(e) = &result {
                    // One worker down takes the rest with it.
                    warn!(error = %e, "worker failed, stopping all workers");
                    running.store(false, Ordering::Release);
                }
                result
            })?;
        handles.push(handle);
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{system, Registry};
    use crate::network::http::HeaderIdentity;
    use crate::protocol::{encode_packet, Packet, Value};
    use std::io::Write;
    use std::time::Instant;

    fn shared() -> Shared<()> {
        let registry = Registry::builder()
            .register(system::MODULE_NAME, 0, system::system_module::<()>)
            .build();
        Shared {
            gateway: Arc::new(Gateway::new(registry, ())),
            resolver: Arc::new(HeaderIdentity::default()),
            stats: Arc::new(GatewayStats::new()),
            options: ServerOptions::default(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    fn ping_request(response_uri: &str) -> Vec<u8> {
        let body = encode_packet(&Packet::request(system::PING, response_uri, vec![Value::Null])).unwrap();
        let mut request = format!(
            "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(&body);
        request
    }

    #[test]
    fn test_write_backlog_pauses_request_processing() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(mio::net::TcpStream::from_std(stream), peer, 0).unwrap();
        let shared = shared();

        let mut pipelined = ping_request("/1");
        pipelined.extend_from_slice(&ping_request("/2"));
        client.write_all(&pipelined).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while conn.readable().len() < pipelined.len() && Instant::now() < deadline {
            conn.fill_read_buffer(1 << 20).unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(conn.readable().len(), pipelined.len());

        // Responses the client has not read yet.
        conn.write_buffer_mut().resize(MAX_WRITE_BACKLOG, 0);
        assert!(!process_requests(&mut conn, &shared));
        assert!(conn.is_paused());
        assert_eq!(conn.readable().len(), pipelined.len());

        conn.write_buffer_mut().clear();
        assert!(process_requests(&mut conn, &shared));
        assert!(!conn.is_paused());
        assert!(conn.readable().is_empty());
        assert_eq!(conn.requests_served(), 2);
    }
}

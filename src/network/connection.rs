//! One client connection: non-blocking socket plus its read and write buffers.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;
use tracing::debug;

/// Bytes requested from the socket per read call.
const READ_CHUNK: usize = 64 * 1024;

/// Result of draining the socket into the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: usize,
    /// Reading stopped at the buffer limit with data possibly still queued.
    pub hit_limit: bool,
}

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    read_buffer: Vec<u8>,
    read_pos: usize,
    write_buffer: Vec<u8>,
    write_pos: usize,
    close_after_flush: bool,
    peer_closed: bool,
    /// Buffered requests are waiting for the write backlog to drain.
    paused: bool,
    requests_served: u64,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, socket_buffer_bytes: usize) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        tune_socket_buffers(&stream, socket_buffer_bytes);

        Ok(Self {
            stream,
            peer,
            read_buffer: Vec::with_capacity(READ_CHUNK),
            read_pos: 0,
            write_buffer: Vec::with_capacity(READ_CHUNK),
            write_pos: 0,
            close_after_flush: false,
            peer_closed: false,
            paused: false,
            requests_served: 0,
        })
    }

    /// Read until the socket would block, EOF, or `limit` buffered bytes.
    pub fn fill_read_buffer(&mut self, limit: usize) -> io::Result<ReadOutcome> {
        if self.read_pos > 0 {
            self.read_buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }

        let mut bytes = 0;
        loop {
            let start = self.read_buffer.len();
            if start >= limit {
                return Ok(ReadOutcome {
                    bytes,
                    hit_limit: true,
                });
            }
            let want = READ_CHUNK.min(limit - start);
            self.read_buffer.resize(start + want, 0);

            match self.stream.read(&mut self.read_buffer[start..]) {
                Ok(0) => {
                    self.read_buffer.truncate(start);
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => {
                    self.read_buffer.truncate(start + n);
                    bytes += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.read_buffer.truncate(start);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.read_buffer.truncate(start);
                }
                Err(e) => {
                    self.read_buffer.truncate(start);
                    return Err(e);
                }
            }
        }

        Ok(ReadOutcome {
            bytes,
            hit_limit: false,
        })
    }

    /// Buffered, unconsumed input.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.read_buffer[self.read_pos..]
    }

    #[inline]
    pub fn consume(&mut self, n: usize) {
        self.read_pos += n.min(self.read_buffer.len() - self.read_pos);
    }

    /// Output buffer; append whole responses, then call [`Self::flush_write_buffer`].
    pub fn write_buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.write_buffer
    }

    /// Write as much as the socket accepts.
    pub fn flush_write_buffer(&mut self) -> io::Result<()> {
        while self.write_pos < self.write_buffer.len() {
            match self.stream.write(&self.write_buffer[self.write_pos..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ));
                }
                Ok(n) => self.write_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        if self.write_pos == self.write_buffer.len() {
            self.write_buffer.clear();
            self.write_pos = 0;
        }
        Ok(())
    }

    #[inline]
    pub fn write_pending(&self) -> usize {
        self.write_buffer.len() - self.write_pos
    }

    /// Stop reading requests; close once the output is flushed.
    pub fn close_after_flush(&mut self) {
        self.close_after_flush = true;
    }

    pub fn is_closing(&self) -> bool {
        self.close_after_flush
    }

    pub fn should_close(&self) -> bool {
        (self.close_after_flush || self.peer_closed) && self.write_pending() == 0
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn record_request(&mut self) {
        self.requests_served += 1;
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// Best effort: not every platform honours the requested sizes.
#[cfg(unix)]
fn tune_socket_buffers(stream: &TcpStream, bytes: usize) {
    use std::os::unix::io::AsRawFd;

    if bytes == 0 {
        return;
    }
    let fd = stream.as_raw_fd();
    let optval = libc::c_int::try_from(bytes).unwrap_or(libc::c_int::MAX);
    for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
        // SAFETY: `fd` is a live socket owned by `stream`, and `optval`
        // outlives the call.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            debug!(error = %io::Error::last_os_error(), "setsockopt failed");
        }
    }
}

#[cfg(not(unix))]
fn tune_socket_buffers(_stream: &TcpStream, _bytes: usize) {}

//! Hello responder for the framed TCP transport.
//!
//! Answers every request frame with a frame carrying the same sequence
//! number. Used by the `serve` subcommand and by the integration tests.

use crate::buffer::Buffer;
use crate::transport::tcp::{decode_frame, encode_frame};

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

const RESPONSE_HEADER: &[u8] = b"hello world header response";
const RESPONSE_PAYLOAD: &[u8] = b"hello world iovec response";

/// Longest pause between failed accepts.
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Close each connection after answering this many requests.
    pub close_after: Option<u64>,
    /// Log every n-th request; 0 disables sampling.
    pub sample_every: u64,
}

#[derive(Debug, Default)]
struct ServerStats {
    connections: AtomicU64,
    requests: AtomicU64,
}

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    stop: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
}

impl Server {
    pub fn bind(config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen)?;
        Ok(Self {
            listener,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ServerStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until stopped.
    pub fn serve(self) -> io::Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "listening");

        let mut failures = 0u32;
        for stream in self.listener.incoming() {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // errors like EMFILE repeat until a descriptor frees up
                    failures = failures.saturating_add(1);
                    let pause = accept_backoff(failures);
                    tracing::warn!(error = %e, ?pause, "accept failed");
                    std::thread::sleep(pause);
                    continue;
                }
            };
            failures = 0;
            let peer = stream.peer_addr().ok();
            self.stats.connections.fetch_add(1, Ordering::Relaxed);
            let config = self.config.clone();
            let stats = self.stats.clone();
            std::thread::Builder::new()
                .name("slotpipe-conn".to_string())
                .spawn(move || {
                    if let Err(e) = handle_connection(stream, &config, &stats) {
                        tracing::debug!(?peer, error = %e, "connection ended with error");
                    }
                })?;
        }
        Ok(())
    }

    /// Run on a background thread.
    pub fn spawn(self) -> io::Result<ServerHandle> {
        let addr = self.local_addr()?;
        let stop = self.stop.clone();
        let stats = self.stats.clone();
        let thread = std::thread::Builder::new()
            .name("slotpipe-server".to_string())
            .spawn(move || self.serve())?;
        Ok(ServerHandle {
            addr,
            stop,
            stats,
            thread: Some(thread),
        })
    }
}

/// Handle to a server started with [`Server::spawn`].
pub struct ServerHandle {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connections(&self) -> u64 {
        self.stats.connections.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.stats.requests.load(Ordering::Relaxed)
    }

    /// Stop accepting. Connections already open are left to finish.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        // wake the accept call
        let _ = TcpStream::connect(self.addr);
        if let Ok(Err(e)) = thread.join() {
            tracing::warn!(error = %e, "server exited with error");
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pause after the given number of consecutive accept failures: 10ms,
/// doubling, capped at [`MAX_ACCEPT_BACKOFF`].
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    Duration::from_millis(10u64 << shift).min(MAX_ACCEPT_BACKOFF)
}

fn handle_connection(
    mut stream: TcpStream,
    config: &ServerConfig,
    stats: &ServerStats,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let mut rx = Buffer::new();
    let mut tx = Buffer::new();
    let mut answered = 0u64;
    let mut since_sample = 0u64;

    loop {
        if rx.read_from(&mut stream)? == 0 {
            return Ok(());
        }

        while let Some((frame, consumed)) = decode_frame(rx.as_slice())? {
            since_sample += 1;
            if config.sample_every > 0 && since_sample >= config.sample_every {
                tracing::info!(
                    "message: [{}] - {}",
                    frame.sn + 1,
                    String::from_utf8_lossy(frame.header)
                );
                since_sample = 0;
            }
            encode_frame(&mut tx, frame.sn, RESPONSE_HEADER, RESPONSE_PAYLOAD)
                .map_err(|e| io::Error::other(e.to_string()))?;
            rx.consume(consumed);
            answered += 1;
            stats.requests.fetch_add(1, Ordering::Relaxed);

            if config.close_after.is_some_and(|n| answered >= n) {
                tx.write_all_to(&mut stream)?;
                tracing::debug!(answered, "closing connection");
                return Ok(());
            }
        }
        tx.write_all_to(&mut stream)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(4), Duration::from_millis(80));
        assert_eq!(accept_backoff(8), MAX_ACCEPT_BACKOFF);
        assert_eq!(accept_backoff(u32::MAX), MAX_ACCEPT_BACKOFF);
    }

    #[test]
    fn test_answers_pipelined_frames() {
        let server = Server::bind(ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            close_after: None,
            sample_every: 0,
        })
        .unwrap();
        let mut handle = server.spawn().unwrap();

        let mut stream = TcpStream::connect(handle.addr()).unwrap();
        let mut out = Buffer::with_capacity(256);
        for sn in 0..3 {
            encode_frame(&mut out, sn, b"hello", b"world").unwrap();
        }
        stream.write_all(out.as_slice()).unwrap();

        let mut rx = Buffer::with_capacity(256);
        let mut seen = Vec::new();
        while seen.len() < 3 {
            assert!(rx.read_from(&mut stream).unwrap() > 0);
            while let Some((frame, used)) = decode_frame(rx.as_slice()).unwrap() {
                assert_eq!(frame.header, RESPONSE_HEADER);
                seen.push(frame.sn);
                rx.consume(used);
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(handle.requests(), 3);
        handle.shutdown();
    }
}

//! Per-cluster TCP connection pool.
//!
//! Connections are handed out exclusively: one in-flight request owns one
//! upstream connection. Released connections go back to a per-host idle list
//! for reuse; the cluster-wide `max_connections` cap is enforced with a
//! semaphore, and exhausting it surfaces as an overflow failure rather than
//! queueing.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Why an upstream connection could not be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailureReason {
    /// The cluster's connection cap is exhausted.
    Overflow,
    /// Connect did not complete within the configured timeout.
    Timeout,
    /// The connect attempt failed on this side (bad address, no local port).
    LocalConnectionFailure,
    /// The peer refused or reset the connect attempt.
    RemoteConnectionFailure,
}

impl fmt::Display for PoolFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolFailureReason::Overflow => "overflow",
            PoolFailureReason::Timeout => "timeout",
            PoolFailureReason::LocalConnectionFailure => "local connection failure",
            PoolFailureReason::RemoteConnectionFailure => "remote connection failure",
        };
        f.write_str(s)
    }
}

/// An exclusively-owned upstream connection. Dropping it closes the socket;
/// handing it back through [`ConnPool::release`] keeps it for reuse.
pub struct PooledConn {
    pub stream: TcpStream,
    host: String,
    _permit: OwnedSemaphorePermit,
}

impl PooledConn {
    pub fn host(&self) -> &str {
        &self.host
    }
}

pub struct ConnPool {
    connect_timeout: Duration,
    max_idle_per_host: usize,
    capacity: Arc<Semaphore>,
    idle: Mutex<HashMap<String, VecDeque<TcpStream>>>,
}

impl ConnPool {
    pub fn new(max_connections: usize, connect_timeout: Duration, max_idle_per_host: usize) -> Self {
        Self {
            connect_timeout,
            max_idle_per_host,
            capacity: Arc::new(Semaphore::new(max_connections)),
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Produce a connection to `host`, reusing an idle one when available.
    pub async fn acquire(&self, host: &str) -> Result<PooledConn, PoolFailureReason> {
        let permit = match Arc::clone(&self.capacity).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Err(PoolFailureReason::Overflow),
            Err(TryAcquireError::Closed) => return Err(PoolFailureReason::LocalConnectionFailure),
        };

        // Idle connections may have been closed by the peer while parked;
        // skip any that no longer look open.
        while let Some(stream) = self.pop_idle(host) {
            if idle_is_open(&stream) {
                return Ok(PooledConn {
                    stream,
                    host: host.to_string(),
                    _permit: permit,
                });
            }
        }

        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(host)).await
        {
            Err(_) => return Err(PoolFailureReason::Timeout),
            Ok(Err(e)) => return Err(classify_connect_error(&e)),
            Ok(Ok(stream)) => stream,
        };
        let _ = stream.set_nodelay(true);

        Ok(PooledConn {
            stream,
            host: host.to_string(),
            _permit: permit,
        })
    }

    /// Park a connection for reuse. Beyond `max_idle_per_host` the
    /// connection is simply dropped (closed).
    pub fn release(&self, conn: PooledConn) {
        let PooledConn {
            stream,
            host,
            _permit,
        } = conn;

        let mut idle = self.idle_lock();
        let queue = idle.entry(host).or_default();
        if queue.len() < self.max_idle_per_host {
            queue.push_back(stream);
        }
    }

    fn pop_idle(&self, host: &str) -> Option<TcpStream> {
        self.idle_lock().get_mut(host).and_then(VecDeque::pop_front)
    }

    fn idle_lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<TcpStream>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A parked connection is reusable only if it is still open and silent.
/// Readable bytes on an idle tRPC connection mean a desynchronized peer, so
/// those are discarded too.
fn idle_is_open(stream: &TcpStream) -> bool {
    let mut byte = [0u8; 1];
    match stream.try_read(&mut byte) {
        Ok(_) => false,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}

fn classify_connect_error(e: &io::Error) -> PoolFailureReason {
    match e.kind() {
        io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::PermissionDenied
        | io::ErrorKind::InvalidInput => PoolFailureReason::LocalConnectionFailure,
        _ => PoolFailureReason::RemoteConnectionFailure,
    }
}

//! Tokio driver for the filter core.
//!
//! One task per downstream connection runs the core's event loop: it feeds
//! socket reads and upstream events into the [`ConnectionManager`] and
//! executes the actions that come back. Per-request upstream I/O runs in a
//! small helper task owning the pooled connection; all decisions stay in the
//! core, strictly serialized on this task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::filter::{
    Action, ConnectionEvent, ConnectionManager, FilterConfig, MessageId, UpstreamEvent,
};
use crate::upstream::pool::PooledConn;
use crate::upstream::{Cluster, ClusterManager};

/// Downstream write-queue depth beyond which reads are paused, and the level
/// at which they resume.
const WRITE_HIGH_WATERMARK: usize = 1024 * 1024;
const WRITE_LOW_WATERMARK: usize = 256 * 1024;

enum WriteOp {
    Data(Bytes),
    Shutdown,
}

enum UpstreamCmd {
    Write(Bytes),
    Finish { reuse: bool },
}

struct UpstreamHandle {
    cancel: CancellationToken,
    cmd: mpsc::UnboundedSender<UpstreamCmd>,
}

struct DriverIo {
    write_tx: mpsc::UnboundedSender<WriteOp>,
    abort_write: CancellationToken,
    queued: Arc<AtomicUsize>,
    upstreams: HashMap<MessageId, UpstreamHandle>,
    event_tx: mpsc::UnboundedSender<(MessageId, UpstreamEvent)>,
    read_enabled: bool,
}

impl DriverIo {
    /// Execute one core action. Close actions feed the resulting connection
    /// event straight back into the core, exactly like the close-event
    /// cascade of the host runtime.
    fn execute(&mut self, action: Action, cm: &mut ConnectionManager, feedback: &mut Vec<Action>) {
        match action {
            Action::WriteDownstream { data, end_stream } => {
                self.queued.fetch_add(data.len(), Ordering::Relaxed);
                let _ = self.write_tx.send(WriteOp::Data(data));
                if end_stream {
                    let _ = self.write_tx.send(WriteOp::Shutdown);
                }
            }
            Action::CloseDownstream { flush } => {
                if flush {
                    let _ = self.write_tx.send(WriteOp::Shutdown);
                } else {
                    self.abort_write.cancel();
                }
                cm.on_downstream_event(ConnectionEvent::LocalClose, feedback);
            }
            Action::ReadDisable(disable) => {
                self.read_enabled = !disable;
            }
            Action::AcquireUpstream { id, cluster, host } => {
                let cancel = CancellationToken::new();
                let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                tokio::spawn(upstream_task(
                    cluster,
                    host,
                    id,
                    self.event_tx.clone(),
                    cmd_rx,
                    cancel.clone(),
                ));
                self.upstreams.insert(id, UpstreamHandle { cancel, cmd: cmd_tx });
            }
            Action::CancelAcquire { id } => {
                if let Some(handle) = self.upstreams.remove(&id) {
                    handle.cancel.cancel();
                }
            }
            Action::WriteUpstream { id, data } => {
                if let Some(handle) = self.upstreams.get(&id) {
                    let _ = handle.cmd.send(UpstreamCmd::Write(data));
                }
            }
            Action::ReleaseUpstream { id } => {
                if let Some(handle) = self.upstreams.remove(&id) {
                    let _ = handle.cmd.send(UpstreamCmd::Finish { reuse: true });
                }
            }
            Action::CloseUpstream { id } => {
                if let Some(handle) = self.upstreams.remove(&id) {
                    let _ = handle.cmd.send(UpstreamCmd::Finish { reuse: false });
                }
            }
        }
    }
}

/// Serve one downstream connection until it closes and every in-flight
/// message has been retired.
pub async fn serve_connection(
    stream: TcpStream,
    config: Arc<FilterConfig>,
    clusters: Arc<ClusterManager>,
) {
    let (peer_addr, local_addr) = match (stream.peer_addr(), stream.local_addr()) {
        (Ok(peer), Ok(local)) => (peer, local),
        _ => return,
    };
    let _ = stream.set_nodelay(true);
    let (mut read_half, write_half) = stream.into_split();

    let mut cm = ConnectionManager::new(config, clusters, local_addr, peer_addr);

    let queued = Arc::new(AtomicUsize::new(0));
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let abort_write = CancellationToken::new();
    let writer = tokio::spawn(downstream_writer(
        write_half,
        write_rx,
        queued.clone(),
        abort_write.clone(),
    ));

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut io = DriverIo {
        write_tx,
        abort_write,
        queued,
        upstreams: HashMap::new(),
        event_tx,
        read_enabled: true,
    };

    let mut actions: Vec<Action> = Vec::new();
    let mut read_buf = BytesMut::with_capacity(16 * 1024);
    let mut read_open = true;
    let mut above_watermark = false;

    loop {
        // Run queued actions to quiescence, then let the deferred-drop queue
        // tick over.
        while !actions.is_empty() {
            let batch: Vec<Action> = actions.drain(..).collect();
            for action in batch {
                io.execute(action, &mut cm, &mut actions);
            }
        }
        cm.drain_deferred();

        if !cm.downstream_open() && cm.active_messages() == 0 {
            break;
        }

        let pending = io.queued.load(Ordering::Relaxed);
        if !above_watermark && pending > WRITE_HIGH_WATERMARK {
            above_watermark = true;
            cm.on_write_buffer_watermark(true, &mut actions);
            continue;
        }
        if above_watermark && pending < WRITE_LOW_WATERMARK {
            above_watermark = false;
            cm.on_write_buffer_watermark(false, &mut actions);
            continue;
        }

        tokio::select! {
            result = read_half.read_buf(&mut read_buf),
                if read_open && io.read_enabled && cm.downstream_open() =>
            {
                match result {
                    Ok(0) => {
                        read_open = false;
                        cm.on_downstream_data(&[], true, &mut actions);
                    }
                    Ok(_) => {
                        let chunk = read_buf.split();
                        cm.on_downstream_data(&chunk, false, &mut actions);
                    }
                    Err(e) => {
                        debug!("downstream read error, peer={}, error={}", peer_addr, e);
                        read_open = false;
                        cm.on_downstream_event(ConnectionEvent::RemoteClose, &mut actions);
                    }
                }
            }
            event = event_rx.recv() => {
                if let Some((id, ev)) = event {
                    cm.on_upstream_event(id, ev, &mut actions);
                }
            }
            // While read-disabled by the watermark, wake periodically to
            // observe the writer draining.
            _ = tokio::time::sleep(Duration::from_millis(50)), if above_watermark => {}
        }
    }

    let _ = io.write_tx.send(WriteOp::Shutdown);
    drop(io);
    let _ = writer.await;
    debug!("connection finished, peer={}", peer_addr);
}

async fn downstream_writer(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    queued: Arc<AtomicUsize>,
    abort: CancellationToken,
) {
    loop {
        tokio::select! {
            // No-flush close: drop everything still queued.
            _ = abort.cancelled() => return,
            op = rx.recv() => match op {
                Some(WriteOp::Data(data)) => {
                    let result = write_half.write_all(&data).await;
                    queued.fetch_sub(data.len(), Ordering::Relaxed);
                    if result.is_err() {
                        return;
                    }
                }
                Some(WriteOp::Shutdown) | None => {
                    let _ = write_half.shutdown().await;
                    return;
                }
            },
        }
    }
}

/// Owns one request's upstream connection: acquires it from the cluster
/// pool, relays writes and reads, and disposes of it as instructed.
async fn upstream_task(
    cluster: Arc<Cluster>,
    host: String,
    id: MessageId,
    event_tx: mpsc::UnboundedSender<(MessageId, UpstreamEvent)>,
    mut cmd_rx: mpsc::UnboundedReceiver<UpstreamCmd>,
    cancel: CancellationToken,
) {
    let acquired = tokio::select! {
        _ = cancel.cancelled() => return,
        result = cluster.pool().acquire(&host) => result,
    };

    let mut conn: PooledConn = match acquired {
        Ok(conn) => {
            let _ = event_tx.send((id, UpstreamEvent::PoolReady { host: host.clone() }));
            conn
        }
        Err(reason) => {
            let _ = event_tx.send((id, UpstreamEvent::PoolFailure { reason, host }));
            return;
        }
    };

    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            cmd = cmd_rx.recv() => match cmd {
                Some(UpstreamCmd::Write(data)) => {
                    if conn.stream.write_all(&data).await.is_err() {
                        let _ = event_tx.send((id, UpstreamEvent::Closed {
                            event: ConnectionEvent::RemoteClose,
                        }));
                        return;
                    }
                }
                Some(UpstreamCmd::Finish { reuse }) => {
                    if reuse {
                        cluster.pool().release(conn);
                    }
                    return;
                }
                None => return,
            },
            result = conn.stream.read_buf(&mut buf) => match result {
                Ok(0) | Err(_) => {
                    let _ = event_tx.send((id, UpstreamEvent::Closed {
                        event: ConnectionEvent::RemoteClose,
                    }));
                    return;
                }
                Ok(_) => {
                    let _ = event_tx.send((id, UpstreamEvent::Data {
                        data: buf.split().freeze(),
                        end_stream: false,
                    }));
                }
            },
        }
    }
}

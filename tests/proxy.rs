//! End-to-end proxy tests over loopback sockets: a real client, the proxy
//! connection driver, and a minimal tRPC upstream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use prost::Message as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use trpc_proxy::codec::{DecoderCallbacks, FixedHeader, FrameDecoder};
use trpc_proxy::config::{
    ClusterConfig, HostDef, RouteConfigDef, RouteDef, RouteMatchDef, WeightedClusterDef,
};
use trpc_proxy::filter::FilterConfig;
use trpc_proxy::proto::{
    encode_frame, RequestProtocol, ResponseProtocol, TRPC_INVOKE_SUCCESS, TRPC_ONEWAY_CALL,
    TRPC_SERVER_DECODE_ERR, TRPC_SERVER_NOSERVICE_ERR, TRPC_UNARY_CALL,
};
use trpc_proxy::route::{RouteConfigProvider, RouteTable};
use trpc_proxy::server::connection::serve_connection;
use trpc_proxy::upstream::ClusterManager;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// frame helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FrameSink<H> {
    header: Option<H>,
    frame: Option<Bytes>,
}

impl<H: prost::Message + Default> DecoderCallbacks for FrameSink<H> {
    fn on_fixed_header(&mut self, _header: FixedHeader) {}

    fn on_protocol_header(&mut self, raw: &[u8]) -> bool {
        self.header = H::decode(raw).ok();
        self.header.is_some()
    }

    fn on_frame(&mut self, frame: Bytes) {
        self.frame = Some(frame);
    }
}

/// Read one complete tRPC frame from the stream. `None` on clean EOF before
/// any frame byte.
async fn read_frame<H: prost::Message + Default>(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Option<(H, Bytes)> {
    let mut decoder = FrameDecoder::new();
    let mut sink = FrameSink::<H>::default();

    loop {
        loop {
            match decoder.on_data(buf, &mut sink) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => panic!("frame decode error: {}", e),
            }
            if sink.frame.is_some() {
                break;
            }
        }
        if let Some(frame) = sink.frame.take() {
            return Some((sink.header.take().unwrap(), frame));
        }

        let n = tokio::time::timeout(IO_TIMEOUT, stream.read_buf(buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        if n == 0 {
            return None;
        }
    }
}

fn request_frame(request_id: u32, call_type: u32, callee: &str, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    encode_frame(
        &RequestProtocol {
            version: 0,
            call_type,
            request_id,
            timeout: 1000,
            caller: "trpc.test.client".into(),
            callee: callee.into(),
            func: "/SayHello".into(),
            content_type: 0,
            content_encoding: 0,
        },
        body,
        &mut buf,
    );
    buf
}

// ---------------------------------------------------------------------------
// fixture: upstream + proxy
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum UpstreamBehavior {
    /// Reply to unary requests with `ret=0` and a `pong` body; stay silent
    /// on oneway frames.
    Echo,
    /// Reply with a shifted request id.
    WrongRequestId,
}

async fn spawn_upstream(behavior: UpstreamBehavior) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = BytesMut::new();
                while let Some((request, _frame)) =
                    read_frame::<RequestProtocol>(&mut sock, &mut buf).await
                {
                    if request.call_type == TRPC_ONEWAY_CALL {
                        continue;
                    }
                    let request_id = match behavior {
                        UpstreamBehavior::Echo => request.request_id,
                        UpstreamBehavior::WrongRequestId => request.request_id + 1,
                    };
                    let mut reply = BytesMut::new();
                    encode_frame(
                        &ResponseProtocol {
                            version: request.version,
                            call_type: request.call_type,
                            request_id,
                            ret: TRPC_INVOKE_SUCCESS,
                            func_ret: TRPC_INVOKE_SUCCESS,
                            error_msg: String::new(),
                            content_type: request.content_type,
                            content_encoding: 0,
                        },
                        b"pong",
                        &mut reply,
                    );
                    if sock.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    addr
}

/// Start a proxy listener routing `svc.Greeter` to a cluster with the given
/// upstream address. Returns the proxy address.
async fn spawn_proxy(upstream_addr: &str) -> SocketAddr {
    let table = RouteTable::build(&RouteConfigDef {
        name: "itest".into(),
        routes: vec![RouteDef {
            name: "greeter".into(),
            r#match: RouteMatchDef {
                service: Some("svc.Greeter".into()),
                func: None,
                headers: vec![],
            },
            clusters: vec![WeightedClusterDef {
                name: "c1".into(),
                weight: 100,
            }],
            hash_policy: None,
        }],
    })
    .unwrap();

    let filter = Arc::new(FilterConfig::new(
        "itest",
        Arc::new(RouteConfigProvider::with_table(table, "1")),
        vec![],
    ));

    let clusters = Arc::new(ClusterManager::new(&[ClusterConfig {
        name: "c1".into(),
        hosts: vec![HostDef {
            address: upstream_addr.to_string(),
            weight: 100,
        }],
        connect_timeout: 1.0,
        max_connections: 16,
        max_idle_per_host: 4,
        health_check: None,
    }]));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            let filter = filter.clone();
            let clusters = clusters.clone();
            tokio::spawn(serve_connection(stream, filter, clusters));
        }
    });

    addr
}

// ---------------------------------------------------------------------------
// scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unary_round_trip() {
    let upstream = spawn_upstream(UpstreamBehavior::Echo).await;
    let proxy = spawn_proxy(&upstream).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let frame = request_frame(7, TRPC_UNARY_CALL, "svc.Greeter", &[0x42; 20]);
    client.write_all(&frame).await.unwrap();

    let mut buf = BytesMut::new();
    let (response, raw) = read_frame::<ResponseProtocol>(&mut client, &mut buf)
        .await
        .expect("expected a response frame");

    assert_eq!(response.request_id, 7);
    assert_eq!(response.ret, TRPC_INVOKE_SUCCESS);
    assert_eq!(response.func_ret, TRPC_INVOKE_SUCCESS);
    // body is forwarded verbatim from the upstream
    assert!(raw.ends_with(b"pong"));
}

#[tokio::test]
async fn pipelined_requests_share_one_downstream_connection() {
    let upstream = spawn_upstream(UpstreamBehavior::Echo).await;
    let proxy = spawn_proxy(&upstream).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let mut data = request_frame(1, TRPC_UNARY_CALL, "svc.Greeter", b"one").to_vec();
    data.extend_from_slice(&request_frame(2, TRPC_UNARY_CALL, "svc.Greeter", b"two"));
    client.write_all(&data).await.unwrap();

    let mut buf = BytesMut::new();
    let mut seen = Vec::new();
    for _ in 0..2 {
        let (response, _) = read_frame::<ResponseProtocol>(&mut client, &mut buf)
            .await
            .expect("expected a response frame");
        assert_eq!(response.ret, TRPC_INVOKE_SUCCESS);
        seen.push(response.request_id);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2]);
}

#[tokio::test]
async fn slow_client_one_byte_at_a_time() {
    let upstream = spawn_upstream(UpstreamBehavior::Echo).await;
    let proxy = spawn_proxy(&upstream).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let frame = request_frame(3, TRPC_UNARY_CALL, "svc.Greeter", b"slowly");
    for byte in frame.iter() {
        client.write_all(std::slice::from_ref(byte)).await.unwrap();
        client.flush().await.unwrap();
    }

    let mut buf = BytesMut::new();
    let (response, _) = read_frame::<ResponseProtocol>(&mut client, &mut buf)
        .await
        .expect("expected a response frame");
    assert_eq!(response.request_id, 3);
    assert_eq!(response.ret, TRPC_INVOKE_SUCCESS);
}

#[tokio::test]
async fn no_route_yields_noservice_error_and_close() {
    let upstream = spawn_upstream(UpstreamBehavior::Echo).await;
    let proxy = spawn_proxy(&upstream).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let frame = request_frame(7, TRPC_UNARY_CALL, "svc.Unknown", b"x");
    client.write_all(&frame).await.unwrap();

    let mut buf = BytesMut::new();
    let (response, _) = read_frame::<ResponseProtocol>(&mut client, &mut buf)
        .await
        .expect("expected an error reply");
    assert_eq!(response.request_id, 7);
    assert_eq!(response.ret, TRPC_SERVER_NOSERVICE_ERR);
    assert_eq!(response.func_ret, TRPC_SERVER_NOSERVICE_ERR);
    assert!(!response.error_msg.is_empty());

    // the proxy ends the connection after an end-stream reply
    assert!(read_frame::<ResponseProtocol>(&mut client, &mut buf)
        .await
        .is_none());
}

#[tokio::test]
async fn request_id_mismatch_is_answered_with_decode_error() {
    let upstream = spawn_upstream(UpstreamBehavior::WrongRequestId).await;
    let proxy = spawn_proxy(&upstream).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let frame = request_frame(7, TRPC_UNARY_CALL, "svc.Greeter", b"x");
    client.write_all(&frame).await.unwrap();

    let mut buf = BytesMut::new();
    let (response, _) = read_frame::<ResponseProtocol>(&mut client, &mut buf)
        .await
        .expect("expected an error reply");
    // the error reply echoes the original request id, not the bogus one
    assert_eq!(response.request_id, 7);
    assert_eq!(response.ret, TRPC_SERVER_DECODE_ERR);
}

#[tokio::test]
async fn oneway_is_forwarded_without_reply() {
    let upstream = spawn_upstream(UpstreamBehavior::Echo).await;
    let proxy = spawn_proxy(&upstream).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let frame = request_frame(9, TRPC_ONEWAY_CALL, "svc.Greeter", b"fire-and-forget");
    client.write_all(&frame).await.unwrap();

    // a unary request on the same connection still works, and its reply is
    // the first and only frame the client sees
    let frame = request_frame(10, TRPC_UNARY_CALL, "svc.Greeter", b"ping");
    client.write_all(&frame).await.unwrap();

    let mut buf = BytesMut::new();
    let (response, _) = read_frame::<ResponseProtocol>(&mut client, &mut buf)
        .await
        .expect("expected a response frame");
    assert_eq!(response.request_id, 10);
    assert_eq!(response.ret, TRPC_INVOKE_SUCCESS);
}

#[tokio::test]
async fn unreachable_upstream_yields_system_error() {
    // a port with nothing listening: bind, note the port, drop the listener
    let unreachable = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let proxy = spawn_proxy(&unreachable).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let frame = request_frame(7, TRPC_UNARY_CALL, "svc.Greeter", b"x");
    client.write_all(&frame).await.unwrap();

    let mut buf = BytesMut::new();
    let (response, _) = read_frame::<ResponseProtocol>(&mut client, &mut buf)
        .await
        .expect("expected an error reply");
    assert_eq!(response.request_id, 7);
    assert_ne!(response.ret, TRPC_INVOKE_SUCCESS);
}

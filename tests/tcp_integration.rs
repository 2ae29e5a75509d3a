//! TCP integration tests
//!
//! End-to-end tests running real servers on loopback: framed JSON echo,
//! protobuf request/response over a queued client session, session groups
//! fed by the accept loop, and graceful shutdown.

use a3s_net::{
    dial, dial_timeout, listen, AnyMessage, EngineContext, FrameIo, FramedCodec, FramedProtocol,
    FramingConfig, JsonCodec, JsonProtocol, NetError, OwnerId, ProstCodec, ProstProtocol, Server,
    ServerConfig, Session, SessionGroup,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

type JsonSession = Session<FramedCodec<TcpStream, JsonCodec<FrameIo>>>;
type ProstSession = Session<ProstCodec<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Chat {
    seq: u32,
    text: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct AddRequest {
    #[prost(uint32, tag = "1")]
    a: u32,
    #[prost(uint32, tag = "2")]
    b: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
struct AddResponse {
    #[prost(uint32, tag = "1")]
    sum: u32,
}

fn json_protocol() -> FramedProtocol<JsonProtocol> {
    let mut json = JsonProtocol::new();
    json.register_name::<Chat>("chat").unwrap();
    FramedProtocol::from_config(json, &FramingConfig::default()).unwrap()
}

fn prost_protocol() -> ProstProtocol {
    let mut protocol = ProstProtocol::new();
    protocol.register::<AddRequest>(1).unwrap();
    protocol.register::<AddResponse>(2).unwrap();
    protocol
}

async fn echo(session: Arc<JsonSession>) {
    while let Ok(msg) = session.receive().await {
        if session.send(msg).await.is_err() {
            break;
        }
    }
}

async fn adder(session: Arc<ProstSession>) {
    while let Ok(msg) = session.receive().await {
        let Ok(req) = msg.downcast::<AddRequest>() else {
            break;
        };
        let rsp: AnyMessage = Box::new(AddResponse { sum: req.a + req.b });
        if session.send(rsp).await.is_err() {
            break;
        }
    }
}

fn spawn_serve<P>(server: &Arc<Server<P>>) -> tokio::task::JoinHandle<a3s_net::Result<()>>
where
    P: a3s_net::Protocol<TcpStream> + 'static,
{
    let server = Arc::clone(server);
    tokio::spawn(async move { server.serve().await })
}

async fn wait_for<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ─── Echo ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_framed_json_echo() {
    let server = Arc::new(
        listen("127.0.0.1:0", json_protocol(), ServerConfig::default(), echo)
            .await
            .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let serving = spawn_serve(&server);

    let ctx = EngineContext::new();
    let client = dial(&ctx, addr, &json_protocol(), 0).await.unwrap();
    for seq in 0..20 {
        let msg: AnyMessage = Box::new(Chat {
            seq,
            text: format!("hello {}", seq),
        });
        client.send(msg).await.unwrap();
    }
    for seq in 0..20 {
        let reply = client.receive().await.unwrap().downcast::<Chat>().unwrap();
        assert_eq!(reply.seq, seq);
        assert_eq!(reply.text, format!("hello {}", seq));
    }

    client.close().await.unwrap();
    server.shutdown().await;
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_oversized_frame_closes_client_session() {
    let server = Arc::new(
        listen("127.0.0.1:0", json_protocol(), ServerConfig::default(), echo)
            .await
            .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let serving = spawn_serve(&server);

    let mut json = JsonProtocol::new();
    json.register_name::<Chat>("chat").unwrap();
    let tight = FramedProtocol::from_config(
        json,
        &FramingConfig {
            max_send: 32,
            ..FramingConfig::default()
        },
    )
    .unwrap();

    let client = dial(&EngineContext::new(), addr, &tight, 0).await.unwrap();
    let msg: AnyMessage = Box::new(Chat {
        seq: 1,
        text: "x".repeat(64),
    });
    assert!(matches!(
        client.send(msg).await,
        Err(NetError::PacketTooLarge { max: 32, .. })
    ));
    assert!(client.is_closed());

    server.shutdown().await;
    serving.await.unwrap().unwrap();
}

// ─── Queued sessions ─────────────────────────────────────────────

#[tokio::test]
async fn test_queued_prost_client_keeps_order() {
    let server = Arc::new(
        listen(
            "127.0.0.1:0",
            prost_protocol(),
            ServerConfig {
                send_queue_capacity: 256,
                ..ServerConfig::default()
            },
            adder,
        )
        .await
        .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let serving = spawn_serve(&server);

    let client = dial_timeout(
        &EngineContext::new(),
        addr,
        Duration::from_secs(2),
        &prost_protocol(),
        128,
    )
    .await
    .unwrap();
    assert!(client.is_queued());

    for i in 0..100u32 {
        client.send(Box::new(AddRequest { a: i, b: i })).await.unwrap();
    }
    for i in 0..100u32 {
        let rsp = client
            .receive()
            .await
            .unwrap()
            .downcast::<AddResponse>()
            .unwrap();
        assert_eq!(rsp.sum, i * 2);
    }

    client.close().await.unwrap();
    server.shutdown().await;
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dial_to_closed_port_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = dial_timeout(
        &EngineContext::new(),
        addr,
        Duration::from_secs(2),
        &prost_protocol(),
        0,
    )
    .await;
    assert!(matches!(result, Err(NetError::Io(_))));
}

// ─── Shutdown ────────────────────────────────────────────────────

#[tokio::test]
async fn test_shutdown_closes_every_session() {
    let closed = Arc::new(AtomicUsize::new(0));
    let owner = OwnerId::new();
    let counter = Arc::clone(&closed);
    let handler = move |session: Arc<JsonSession>| {
        let counter = Arc::clone(&counter);
        async move {
            session.add_close_callback(owner, 0, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            while session.receive().await.is_ok() {}
        }
    };

    let server = Arc::new(
        listen("127.0.0.1:0", json_protocol(), ServerConfig::default(), handler)
            .await
            .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let serving = spawn_serve(&server);

    let ctx = EngineContext::new();
    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(dial(&ctx, addr, &json_protocol(), 0).await.unwrap());
    }
    // Callbacks are registered by the handler, so wait until all are in
    let server_ref = &server;
    wait_for(|| async move {
        let mut ready = 0;
        for id in 1..=5 {
            if let Some(s) = server_ref.manager().get(id).await {
                if s.close_callback_count() == 1 {
                    ready += 1;
                }
            }
        }
        ready == 5
    })
    .await;

    server.shutdown().await;
    assert_eq!(closed.load(Ordering::SeqCst), 5);
    assert!(server.manager().is_empty().await);
    serving.await.unwrap().unwrap();

    // Every client sees its peer go away
    for client in &clients {
        let result = tokio::time::timeout(Duration::from_secs(2), client.receive())
            .await
            .unwrap();
        assert!(result.is_err());
        assert!(client.is_closed());
    }
}

// ─── Groups ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_group_tracks_live_connections() {
    let room: SessionGroup<u64, FramedCodec<TcpStream, JsonCodec<FrameIo>>> = SessionGroup::new();
    let joined = room.clone();
    let handler = move |session: Arc<JsonSession>| {
        let room = joined.clone();
        async move {
            room.put(session.id(), Arc::clone(&session));
            while session.receive().await.is_ok() {}
        }
    };

    let server = Arc::new(
        listen("127.0.0.1:0", json_protocol(), ServerConfig::default(), handler)
            .await
            .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let serving = spawn_serve(&server);

    let ctx = EngineContext::new();
    let first = dial(&ctx, addr, &json_protocol(), 0).await.unwrap();
    let second = dial(&ctx, addr, &json_protocol(), 0).await.unwrap();
    let room_ref = &room;
    wait_for(|| async move { room_ref.len() == 2 }).await;

    // Broadcast through the group
    room.fetch(|member| {
        let member = Arc::clone(member);
        tokio::spawn(async move {
            let msg: AnyMessage = Box::new(Chat {
                seq: 7,
                text: "broadcast".to_string(),
            });
            let _ = member.send(msg).await;
        });
    });
    for client in [&first, &second] {
        let msg = client.receive().await.unwrap().downcast::<Chat>().unwrap();
        assert_eq!(msg.text, "broadcast");
    }

    // A client hanging up ends its server session, which leaves the room
    first.close().await.unwrap();
    wait_for(|| async move { room_ref.len() == 1 }).await;

    server.shutdown().await;
    wait_for(|| async move { room_ref.is_empty() }).await;
    serving.await.unwrap().unwrap();
    drop(second);
}

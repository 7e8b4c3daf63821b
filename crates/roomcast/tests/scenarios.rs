use roomcast::session::transport::{self, MemoryClient};
use roomcast::{
    ClientMessage, DisconnectReason, Edit, Hub, HubConfig, HubHandle, HubResult, Identity,
    Message, MessageKind, Payload, RejectReason, RoomKind, ServerMessage, Session, SessionId,
};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

fn config() -> HubConfig {
    HubConfig {
        outbound_capacity: 32,
        ping_interval_ms: 1_000,
        liveness_timeout_ms: 5_000,
        tick_interval_ms: 20,
        ..HubConfig::default()
    }
}

struct Client {
    conn: MemoryClient,
    task: JoinHandle<HubResult<DisconnectReason>>,
}

async fn connect(hub: &HubHandle, id: &str, transport_capacity: usize) -> Client {
    let (reader, writer, mut conn) = transport::memory(transport_capacity);
    let session = Session::with_id(SessionId::from(id), Identity::new(id, id));
    let task = hub.spawn_session(session, reader, writer);

    match recv(&mut conn).await {
        ServerMessage::Welcome { session_id, .. } => assert_eq!(session_id.as_str(), id),
        other => panic!("Expected welcome, got: {:?}", other),
    }
    Client { conn, task }
}

async fn recv(conn: &mut MemoryClient) -> ServerMessage {
    timeout(Duration::from_secs(2), conn.recv())
        .await
        .expect("Should receive message")
        .expect("Should have message")
}

async fn recv_room(conn: &mut MemoryClient) -> Message {
    match recv(conn).await {
        ServerMessage::Message(message) => message,
        other => panic!("Expected room message, got: {:?}", other),
    }
}

/// Join a document room and return the snapshot version
async fn join_document(client: &mut Client, room_id: &str) -> u64 {
    client
        .conn
        .send(&ClientMessage::Join {
            room_id: room_id.to_string(),
            kind: RoomKind::Document,
        })
        .await
        .unwrap();
    match recv(&mut client.conn).await {
        ServerMessage::Snapshot { version, .. } => version,
        other => panic!("Expected snapshot, got: {:?}", other),
    }
}

async fn join_chat(client: &Client, room_id: &str) {
    client
        .conn
        .send(&ClientMessage::Join {
            room_id: room_id.to_string(),
            kind: RoomKind::Chat,
        })
        .await
        .unwrap();
}

/// Read room messages until one of `kind` arrives
async fn recv_kind(conn: &mut MemoryClient, kind: MessageKind) -> Message {
    loop {
        let message = recv_room(conn).await;
        if message.kind == kind {
            return message;
        }
    }
}

fn apply_text(text: &mut String, edit: &Edit) {
    let mut chars: Vec<char> = text.chars().collect();
    match edit {
        Edit::Insert { position, content } => {
            chars.splice(*position..*position, content.chars());
        }
        Edit::Delete { position, length } => {
            chars.drain(*position..*position + *length);
        }
    }
    *text = chars.into_iter().collect();
}

#[tokio::test]
async fn concurrent_inserts_converge() {
    let (hub, _task) = Hub::spawn(config(), None);
    let mut a = connect(&hub, "session-a", 64).await;
    let mut b = connect(&hub, "session-b", 64).await;

    join_document(&mut a, "doc1").await;
    recv_kind(&mut a.conn, MessageKind::Join).await;
    join_document(&mut b, "doc1").await;
    recv_kind(&mut a.conn, MessageKind::Join).await;
    recv_kind(&mut b.conn, MessageKind::Join).await;

    // Both authored against the empty document
    a.conn
        .send(&ClientMessage::Edit {
            room_id: "doc1".to_string(),
            edit: Edit::Insert {
                position: 0,
                content: "Hello".to_string(),
            },
            base_version: 0,
        })
        .await
        .unwrap();
    b.conn
        .send(&ClientMessage::Edit {
            room_id: "doc1".to_string(),
            edit: Edit::Insert {
                position: 0,
                content: "Hi ".to_string(),
            },
            base_version: 0,
        })
        .await
        .unwrap();

    let mut seen = Vec::new();
    for client in [&mut a, &mut b] {
        let mut content = String::new();
        let mut seqs = Vec::new();
        for _ in 0..2 {
            let message = recv_kind(&mut client.conn, MessageKind::Edit).await;
            seqs.push(message.seq);
            match &message.payload {
                Payload::Edit(op) => apply_text(&mut content, &op.edit),
                other => panic!("Expected edit payload, got: {:?}", other),
            }
        }
        seen.push((content, seqs));
    }

    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[0].0, "HelloHi ");

    let snapshot = hub.document("doc1").await.unwrap().unwrap();
    assert_eq!(snapshot.content, "HelloHi ");
    assert_eq!(snapshot.version, 2);
}

#[tokio::test]
async fn out_of_range_delete_rejected_to_author_only() {
    let (hub, _task) = Hub::spawn(config(), None);
    let mut a = connect(&hub, "session-a", 64).await;
    let mut b = connect(&hub, "session-b", 64).await;

    join_document(&mut a, "doc1").await;
    recv_kind(&mut a.conn, MessageKind::Join).await;
    a.conn
        .send(&ClientMessage::Edit {
            room_id: "doc1".to_string(),
            edit: Edit::Insert {
                position: 0,
                content: "abcdefgh".to_string(),
            },
            base_version: 0,
        })
        .await
        .unwrap();
    recv_kind(&mut a.conn, MessageKind::Edit).await;

    assert_eq!(join_document(&mut b, "doc1").await, 1);
    recv_kind(&mut a.conn, MessageKind::Join).await;
    recv_kind(&mut b.conn, MessageKind::Join).await;

    b.conn
        .send(&ClientMessage::Edit {
            room_id: "doc1".to_string(),
            edit: Edit::Delete {
                position: 5,
                length: 10,
            },
            base_version: 1,
        })
        .await
        .unwrap();

    assert_eq!(
        recv(&mut b.conn).await,
        ServerMessage::Rejected {
            room_id: Some("doc1".to_string()),
            reason: RejectReason::OutOfRange {
                position: 5,
                document_length: 8
            }
        }
    );
    assert!(timeout(Duration::from_millis(150), a.conn.recv())
        .await
        .is_err());

    let snapshot = hub.document("doc1").await.unwrap().unwrap();
    assert_eq!(snapshot.content, "abcdefgh");
    assert_eq!(snapshot.version, 1);
}

#[tokio::test]
async fn slow_consumer_is_dropped() {
    let config = HubConfig {
        outbound_capacity: 8,
        ..config()
    };
    let (hub, _task) = Hub::spawn(config, None);
    let mut fast = connect(&hub, "fast", 256).await;
    // The slow client never reads, so its transport and then its queue fill up
    let slow = connect(&hub, "slow", 1).await;

    join_chat(&fast, "general").await;
    recv_kind(&mut fast.conn, MessageKind::Join).await;
    join_chat(&slow, "general").await;
    recv_kind(&mut fast.conn, MessageKind::Join).await;

    for i in 0..40 {
        fast.conn
            .send(&ClientMessage::Chat {
                room_id: "general".to_string(),
                text: format!("line {}", i),
            })
            .await
            .unwrap();
        sleep(Duration::from_millis(2)).await;
    }

    let left = recv_kind(&mut fast.conn, MessageKind::Leave).await;
    assert_eq!(left.author, SessionId::from("slow"));

    let stats = hub.stats().await.unwrap();
    assert_eq!(stats.rooms["general"].members, vec![SessionId::from("fast")]);

    // The fast session kept receiving everything in order
    fast.conn
        .send(&ClientMessage::Chat {
            room_id: "general".to_string(),
            text: "still here".to_string(),
        })
        .await
        .unwrap();
    let last = recv_kind(&mut fast.conn, MessageKind::Chat).await;
    assert!(last.seq > left.seq);

    drop(slow.conn);
    let reason = timeout(Duration::from_secs(7), slow.task)
        .await
        .expect("Slow session should end")
        .unwrap()
        .unwrap();
    assert!(matches!(
        reason,
        DisconnectReason::DroppedByHub
            | DisconnectReason::TransportError
            | DisconnectReason::ClientClosed
    ));
}

#[tokio::test]
async fn disconnect_mid_broadcast_keeps_others_served() {
    let (hub, _task) = Hub::spawn(config(), None);
    let mut a = connect(&hub, "a", 64).await;
    let mut b = connect(&hub, "b", 64).await;
    let c = connect(&hub, "c", 64).await;

    join_chat(&a, "general").await;
    recv_kind(&mut a.conn, MessageKind::Join).await;
    join_chat(&b, "general").await;
    recv_kind(&mut b.conn, MessageKind::Join).await;
    join_chat(&c, "general").await;
    recv_kind(&mut b.conn, MessageKind::Join).await;

    for i in 0..5 {
        a.conn
            .send(&ClientMessage::Chat {
                room_id: "general".to_string(),
                text: format!("line {}", i),
            })
            .await
            .unwrap();
    }
    drop(c.conn);

    let mut chats = Vec::new();
    let mut saw_leave = false;
    while chats.len() < 5 || !saw_leave {
        let message = recv_room(&mut b.conn).await;
        match message.kind {
            MessageKind::Chat => chats.push(message.seq),
            MessageKind::Leave => {
                assert_eq!(message.author, SessionId::from("c"));
                saw_leave = true;
            }
            other => panic!("Unexpected {:?}", other),
        }
    }
    assert!(chats.windows(2).all(|w| w[0] < w[1]));

    let reason = c.task.await.unwrap().unwrap();
    assert!(matches!(
        reason,
        DisconnectReason::ClientClosed | DisconnectReason::TransportError
    ));

    let stats = hub.stats().await.unwrap();
    assert_eq!(stats.sessions, 2);
    assert_eq!(
        stats.rooms["general"].members,
        vec![SessionId::from("a"), SessionId::from("b")]
    );
}

#[tokio::test]
async fn unresponsive_session_times_out() {
    let config = HubConfig {
        ping_interval_ms: 50,
        liveness_timeout_ms: 200,
        tick_interval_ms: 20,
        ..config()
    };
    let (hub, _task) = Hub::spawn(config, None);
    let mut alive = connect(&hub, "alive", 64).await;
    let silent = connect(&hub, "silent", 64).await;

    join_chat(&alive, "general").await;
    recv_kind(&mut alive.conn, MessageKind::Join).await;
    join_chat(&silent, "general").await;

    // `recv` answers pings, so only the silent session misses its deadline
    let left = recv_kind(&mut alive.conn, MessageKind::Leave).await;
    assert_eq!(left.author, SessionId::from("silent"));

    let reason = timeout(Duration::from_secs(2), silent.task)
        .await
        .expect("Silent session should end")
        .unwrap()
        .unwrap();
    assert_eq!(reason, DisconnectReason::DroppedByHub);

    let stats = hub.stats().await.unwrap();
    assert_eq!(stats.sessions, 1);
}

#[tokio::test]
async fn members_observe_identical_room_order() {
    let (hub, _task) = Hub::spawn(config(), None);
    let mut clients = Vec::new();
    for id in ["a", "b", "c"] {
        let mut client = connect(&hub, id, 128).await;
        join_chat(&client, "general").await;
        loop {
            let message = recv_kind(&mut client.conn, MessageKind::Join).await;
            if message.author == SessionId::from(id) {
                break;
            }
        }
        clients.push(client);
    }

    for round in 0..10 {
        for (i, client) in clients.iter().enumerate() {
            client
                .conn
                .send(&ClientMessage::Chat {
                    room_id: "general".to_string(),
                    text: format!("{}-{}", i, round),
                })
                .await
                .unwrap();
        }
    }

    let mut orders = Vec::new();
    for client in clients.iter_mut() {
        let mut order = Vec::new();
        for _ in 0..30 {
            let message = recv_kind(&mut client.conn, MessageKind::Chat).await;
            order.push((message.seq, message.payload.clone()));
        }
        orders.push(order);
    }

    assert!(orders[0].windows(2).all(|w| w[0].0 + 1 == w[1].0));
    assert_eq!(orders[0], orders[1]);
    assert_eq!(orders[1], orders[2]);
}

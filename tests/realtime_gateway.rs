use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use kennel::engine::{Engine, EngineOptions};
use kennel::notify::NotifyHub;
use kennel::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("kennel_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let options = EngineOptions::new(dir.join("kennel.wal"));
    let engine = Arc::new(Engine::new(options, Arc::new(NotifyHub::new())).unwrap());

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    (addr, engine)
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn send(&mut self, msg: Value) {
        self.framed.send(msg.to_string()).await.unwrap();
    }

    /// Next line of any type, or `None` on timeout.
    async fn next(&mut self, timeout: Duration) -> Option<Value> {
        let line = tokio::time::timeout(timeout, self.framed.next())
            .await
            .ok()??
            .ok()?;
        serde_json::from_str(&line).ok()
    }

    /// Send a request and return its reply, skipping interleaved events.
    async fn request(&mut self, msg: Value) -> Value {
        self.send(msg).await;
        loop {
            let reply = self
                .next(Duration::from_secs(5))
                .await
                .expect("no reply from server");
            if reply["type"] != "event" {
                return reply;
            }
        }
    }

    async fn next_event(&mut self, timeout: Duration) -> Option<Value> {
        loop {
            let msg = self.next(timeout).await?;
            if msg["type"] == "event" {
                return Some(msg);
            }
        }
    }
}

async fn create_room(client: &mut Client) -> String {
    let reply = client.request(json!({ "type": "create-room", "name": "Suite" })).await;
    assert_eq!(reply["type"], "ok", "{reply}");
    reply["data"]["roomId"].as_str().unwrap().to_string()
}

fn booking(room_id: &str, start: &str, end: &str) -> Value {
    json!({
        "type": "create-booking",
        "room_id": room_id,
        "pet_id": Ulid::new().to_string(),
        "start": start,
        "end": end,
    })
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn joined_client_sees_booking_from_other_client() {
    let (addr, _engine) = start_test_server().await;
    let mut staff = Client::connect(addr).await;
    let mut owner = Client::connect(addr).await;

    let room = create_room(&mut owner).await;
    let joined = staff.request(json!({ "type": "join-room", "room_id": room })).await;
    assert_eq!(joined["type"], "ok");

    let reply = owner
        .request(booking(&room, "2024-03-01T10:00:00Z", "2024-03-01T12:00:00Z"))
        .await;
    assert_eq!(reply["type"], "ok", "{reply}");
    assert_eq!(reply["data"]["status"], "PENDING");
    let booking_id = reply["data"]["bookingId"].clone();

    let event = staff
        .next_event(Duration::from_secs(5))
        .await
        .expect("staff should receive booking-updated");
    assert_eq!(event["event"], "booking-updated");
    assert_eq!(event["change"], "created");
    assert_eq!(event["data"]["bookingId"], booking_id);
    assert_eq!(event["data"]["start"], "2024-03-01T10:00:00.000Z");
}

#[tokio::test]
async fn overlapping_request_gets_conflict_code() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let room = create_room(&mut client).await;

    let first = client
        .request(booking(&room, "2024-03-01T10:00:00Z", "2024-03-01T12:00:00Z"))
        .await;
    let second = client
        .request(booking(&room, "2024-03-01T11:00:00Z", "2024-03-01T13:00:00Z"))
        .await;
    assert_eq!(second["type"], "error");
    assert_eq!(second["code"], "conflict");
    assert_eq!(second["booking_id"], first["data"]["bookingId"]);

    let adjacent = client
        .request(booking(&room, "2024-03-01T12:00:00Z", "2024-03-01T13:00:00Z"))
        .await;
    assert_eq!(adjacent["type"], "ok");
}

#[tokio::test]
async fn malformed_input_is_rejected_without_disconnect() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let room = create_room(&mut client).await;

    client.framed.send("this is not json".to_string()).await.unwrap();
    let reply = client.next(Duration::from_secs(5)).await.unwrap();
    assert_eq!(reply["code"], "bad_request");

    let reply = client
        .request(booking(&room, "yesterday", "2024-03-01T12:00:00Z"))
        .await;
    assert_eq!(reply["code"], "bad_request");

    let reply = client
        .request(booking(&room, "2024-03-01T12:00:00Z", "2024-03-01T10:00:00Z"))
        .await;
    assert_eq!(reply["code"], "invalid_interval");

    // Still serving.
    let reply = client.request(json!({ "type": "list-rooms" })).await;
    assert_eq!(reply["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn wildcard_join_sees_every_room() {
    let (addr, _engine) = start_test_server().await;
    let mut dashboard = Client::connect(addr).await;
    let mut client = Client::connect(addr).await;

    let joined = dashboard.request(json!({ "type": "join-room", "room_id": "*" })).await;
    assert_eq!(joined["data"]["joined"], "*");

    let room_a = create_room(&mut client).await;
    let room_b = create_room(&mut client).await;
    client
        .request(booking(&room_a, "2024-03-01T10:00:00Z", "2024-03-01T12:00:00Z"))
        .await;
    client
        .request(json!({ "type": "set-room-active", "room_id": room_b, "active": false }))
        .await;

    let first = dashboard.next_event(Duration::from_secs(5)).await.unwrap();
    assert_eq!(first["event"], "booking-updated");
    assert_eq!(first["data"]["roomId"], room_a.as_str());

    let second = dashboard.next_event(Duration::from_secs(5)).await.unwrap();
    assert_eq!(second["event"], "room-status-updated");
    assert_eq!(second["data"]["roomId"], room_b.as_str());
    assert_eq!(second["data"]["active"], false);
}

#[tokio::test]
async fn leave_room_stops_events() {
    let (addr, engine) = start_test_server().await;
    let mut staff = Client::connect(addr).await;
    let mut owner = Client::connect(addr).await;
    let room = create_room(&mut owner).await;

    staff.request(json!({ "type": "join-room", "room_id": room })).await;
    let left = staff.request(json!({ "type": "leave-room", "room_id": room })).await;
    assert_eq!(left["data"]["was_joined"], true);

    owner
        .request(booking(&room, "2024-03-01T10:00:00Z", "2024-03-01T12:00:00Z"))
        .await;
    assert!(staff.next_event(Duration::from_millis(300)).await.is_none());

    let room_id = Ulid::from_string(&room).unwrap();
    tokio_test::assert_ok!(engine.list_active(room_id).await);
}

#[tokio::test]
async fn booking_lifecycle_over_the_wire() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let room = create_room(&mut client).await;
    let other_room = create_room(&mut client).await;

    let created = client
        .request(booking(&room, "2024-03-01T10:00:00Z", "2024-03-01T12:00:00Z"))
        .await;
    let id = created["data"]["bookingId"].as_str().unwrap().to_string();

    let confirmed = client.request(json!({ "type": "confirm-booking", "booking_id": id })).await;
    assert_eq!(confirmed["data"]["status"], "CONFIRMED");
    assert_eq!(confirmed["data"]["version"], 1);

    let moved = client
        .request(json!({
            "type": "modify-booking",
            "booking_id": id,
            "room_id": other_room,
            "start": "2024-03-02T10:00:00Z",
            "end": "2024-03-02T12:00:00Z",
        }))
        .await;
    assert_eq!(moved["type"], "ok", "{moved}");
    assert_eq!(moved["data"]["roomId"], other_room.as_str());
    assert_eq!(moved["data"]["status"], "CONFIRMED");
    let moved_id = moved["data"]["bookingId"].as_str().unwrap().to_string();

    let again = client.request(json!({ "type": "cancel-booking", "booking_id": id })).await;
    assert_eq!(again["code"], "already_cancelled");

    let completed = client
        .request(json!({ "type": "complete-booking", "booking_id": moved_id }))
        .await;
    assert_eq!(completed["data"]["status"], "COMPLETED");

    let active = client
        .request(json!({ "type": "list-bookings", "room_id": other_room }))
        .await;
    assert!(active["data"].as_array().unwrap().is_empty());
    let all = client
        .request(json!({ "type": "list-bookings", "room_id": room, "all": true }))
        .await;
    assert_eq!(all["data"][0]["status"], "CANCELLED");
}

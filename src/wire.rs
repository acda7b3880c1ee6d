//! JSON-lines gateway: one JSON object per line in both directions.
//!
//! Requests are answered in order with `ok` or `error`. Events for joined
//! scopes are interleaved as `event` lines whenever they arrive.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::{MAX_JOINED_SCOPES, MAX_LINE_LEN};
use crate::model::{parse_instant, Span};
use crate::notify::{BookingPayload, Event, RoomPayload, Scope, Subscription};

/// Events buffered per connection before forwarders wait on the socket.
const EVENT_BUFFER: usize = 256;

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Request {
    /// `room_id` is a room id or `"*"` for every room.
    JoinRoom { room_id: String },
    LeaveRoom { room_id: String },
    CreateRoom {
        #[serde(default)]
        room_id: Option<Ulid>,
        #[serde(default)]
        name: Option<String>,
    },
    SetRoomActive { room_id: Ulid, active: bool },
    ListRooms,
    CreateBooking {
        room_id: Ulid,
        pet_id: Ulid,
        start: String,
        end: String,
    },
    ModifyBooking {
        booking_id: Ulid,
        #[serde(default)]
        room_id: Option<Ulid>,
        start: String,
        end: String,
    },
    CancelBooking { booking_id: Ulid },
    ConfirmBooking { booking_id: Ulid },
    CompleteBooking { booking_id: Ulid },
    /// Active bookings, or every booking with `all: true`.
    ListBookings {
        room_id: Ulid,
        #[serde(default)]
        all: bool,
    },
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Response {
    Ok {
        data: Value,
    },
    Error {
        code: &'static str,
        message: String,
        /// The booking that blocked a conflicting request.
        #[serde(skip_serializing_if = "Option::is_none")]
        booking_id: Option<String>,
    },
    Event {
        event: &'static str,
        change: &'static str,
        data: Value,
    },
}

impl From<&Event> for Response {
    fn from(event: &Event) -> Self {
        Response::Event {
            event: event.name(),
            change: event.change(),
            data: event.payload(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("joined scope limit reached ({MAX_JOINED_SCOPES})")]
    TooManyScopes,
}

impl RequestError {
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::Engine(e) => e.code(),
            RequestError::BadRequest(_) => "bad_request",
            RequestError::TooManyScopes => "limit_exceeded",
        }
    }
}

impl From<RequestError> for Response {
    fn from(e: RequestError) -> Self {
        let booking_id = match &e {
            RequestError::Engine(EngineError::Conflict(id)) => Some(id.to_string()),
            _ => None,
        };
        Response::Error {
            code: e.code(),
            message: e.to_string(),
            booking_id,
        }
    }
}

/// `"*"` is every room; anything else must be a room id.
pub fn parse_scope(raw: &str) -> Result<Scope, RequestError> {
    if raw == "*" {
        return Ok(Scope::AllRooms);
    }
    Ulid::from_string(raw)
        .map(Scope::Room)
        .map_err(|_| RequestError::BadRequest(format!("invalid room id {raw:?}")))
}

fn scope_label(scope: Scope) -> String {
    match scope {
        Scope::Room(id) => id.to_string(),
        Scope::AllRooms => "*".into(),
    }
}

/// Parse ISO-8601 bounds. Ordering is left to the engine so an inverted
/// range reports `invalid_interval`.
pub fn parse_span(start: &str, end: &str) -> Result<Span, RequestError> {
    let s = parse_instant(start).ok_or_else(|| RequestError::BadRequest(format!("invalid start {start:?}")))?;
    let e = parse_instant(end).ok_or_else(|| RequestError::BadRequest(format!("invalid end {end:?}")))?;
    Ok(Span { start: s, end: e })
}

fn to_data<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Scopes this connection has joined. Each is drained by its own forwarding
/// task; dropping the set aborts them all.
struct JoinedScopes {
    tasks: HashMap<Scope, JoinHandle<()>>,
    events: mpsc::Sender<Event>,
}

impl JoinedScopes {
    fn new(events: mpsc::Sender<Event>) -> Self {
        Self {
            tasks: HashMap::new(),
            events,
        }
    }

    /// Start forwarding `sub`. Joining a scope twice keeps the first task.
    fn join(&mut self, sub: Subscription) -> Result<(), RequestError> {
        let scope = sub.scope();
        if self.tasks.contains_key(&scope) {
            return Ok(());
        }
        if self.tasks.len() >= MAX_JOINED_SCOPES {
            return Err(RequestError::TooManyScopes);
        }
        let tx = self.events.clone();
        let task = tokio::spawn(forward(sub, tx));
        self.tasks.insert(scope, task);
        Ok(())
    }

    fn leave(&mut self, scope: Scope) -> bool {
        match self.tasks.remove(&scope) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for JoinedScopes {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

async fn forward(mut sub: Subscription, tx: mpsc::Sender<Event>) {
    while let Some(event) = sub.recv().await {
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

/// Serve one client until it disconnects or the hub closes.
pub async fn process_connection<S>(socket: S, engine: Arc<Engine>) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
    let mut joined = JoinedScopes::new(event_tx);

    loop {
        tokio::select! {
            line = framed.next() => {
                let response = match line {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        handle_line(&line, &engine, &mut joined).await
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!("client line exceeded {MAX_LINE_LEN} bytes");
                        RequestError::BadRequest("line too long".into()).into()
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                };
                send(&mut framed, &response).await?;
            }
            Some(event) = event_rx.recv() => {
                send(&mut framed, &Response::from(&event)).await?;
            }
        }
    }

    debug!("gateway connection closed");
    Ok(())
}

async fn send<S>(framed: &mut Framed<S, LinesCodec>, response: &Response) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = serde_json::to_string(response).map_err(|e| LinesCodecError::Io(io::Error::other(e)))?;
    framed.send(line).await
}

async fn handle_line(line: &str, engine: &Engine, joined: &mut JoinedScopes) -> Response {
    let request = match serde_json::from_str::<Request>(line) {
        Ok(request) => request,
        Err(e) => return RequestError::BadRequest(e.to_string()).into(),
    };
    debug!(?request, "gateway request");
    match execute(request, engine, joined).await {
        Ok(data) => Response::Ok { data },
        Err(e) => e.into(),
    }
}

async fn execute(request: Request, engine: &Engine, joined: &mut JoinedScopes) -> Result<Value, RequestError> {
    match request {
        Request::JoinRoom { room_id } => {
            let scope = parse_scope(&room_id)?;
            if let Scope::Room(id) = scope {
                engine.get_room(id).await?;
            }
            joined.join(engine.notify.subscribe(scope))?;
            debug!(
                scope = %scope_label(scope),
                subscribers = engine.notify.subscriber_count(scope),
                "scope joined"
            );
            Ok(json!({ "joined": scope_label(scope) }))
        }
        Request::LeaveRoom { room_id } => {
            let scope = parse_scope(&room_id)?;
            let was_joined = joined.leave(scope);
            Ok(json!({ "left": scope_label(scope), "was_joined": was_joined }))
        }
        Request::CreateRoom { room_id, name } => {
            let room = engine
                .create_room(room_id.unwrap_or_else(Ulid::new), name)
                .await?;
            Ok(to_data(RoomPayload::from(&room)))
        }
        Request::SetRoomActive { room_id, active } => {
            let room = engine.set_room_active(room_id, active).await?;
            Ok(to_data(RoomPayload::from(&room)))
        }
        Request::ListRooms => {
            let rooms = engine.list_rooms().await;
            Ok(to_data(rooms.iter().map(RoomPayload::from).collect::<Vec<_>>()))
        }
        Request::CreateBooking { room_id, pet_id, start, end } => {
            let span = parse_span(&start, &end)?;
            let booking = engine.create_booking(room_id, pet_id, span).await?;
            Ok(to_data(BookingPayload::from(&booking)))
        }
        Request::ModifyBooking { booking_id, room_id, start, end } => {
            let span = parse_span(&start, &end)?;
            let booking = engine.modify_booking(booking_id, room_id, span).await?;
            Ok(to_data(BookingPayload::from(&booking)))
        }
        Request::CancelBooking { booking_id } => {
            let booking = engine.cancel_booking(booking_id).await?;
            Ok(to_data(BookingPayload::from(&booking)))
        }
        Request::ConfirmBooking { booking_id } => {
            let booking = engine.confirm_booking(booking_id).await?;
            Ok(to_data(BookingPayload::from(&booking)))
        }
        Request::CompleteBooking { booking_id } => {
            let booking = engine.complete_booking(booking_id).await?;
            Ok(to_data(BookingPayload::from(&booking)))
        }
        Request::ListBookings { room_id, all } => {
            let bookings = if all {
                engine.list_bookings(room_id).await?
            } else {
                engine.list_active(room_id).await?
            };
            Ok(to_data(bookings.iter().map(BookingPayload::from).collect::<Vec<_>>()))
        }
    }
}

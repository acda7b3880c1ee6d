use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::{format_instant, Booking, BookingStatus, Room};
use crate::observability;

const CHANNEL_CAPACITY: usize = 256;

/// What a subscriber listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Room(Ulid),
    /// Every room, for dashboards.
    AllRooms,
}

impl Scope {
    /// Whether an event for `room_id` belongs to this scope.
    pub fn matches(&self, room_id: Ulid) -> bool {
        match self {
            Scope::Room(id) => *id == room_id,
            Scope::AllRooms => true,
        }
    }
}

/// A committed state change, published after the room lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    BookingCreated(Booking),
    BookingCancelled(Booking),
    BookingStatusChanged(Booking),
    RoomStatusChanged(Room),
}

/// Wire payload for `booking-updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingPayload {
    pub booking_id: String,
    pub room_id: String,
    pub pet_id: String,
    pub start: String,
    pub end: String,
    pub status: BookingStatus,
    pub version: u64,
}

impl From<&Booking> for BookingPayload {
    fn from(b: &Booking) -> Self {
        Self {
            booking_id: b.id.to_string(),
            room_id: b.room_id.to_string(),
            pet_id: b.pet_id.to_string(),
            start: format_instant(b.span.start),
            end: format_instant(b.span.end),
            status: b.status,
            version: b.version,
        }
    }
}

/// Wire payload for `room-status-updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    pub room_id: String,
    pub name: Option<String>,
    pub active: bool,
}

impl From<&Room> for RoomPayload {
    fn from(r: &Room) -> Self {
        Self {
            room_id: r.id.to_string(),
            name: r.name.clone(),
            active: r.active,
        }
    }
}

impl Event {
    pub fn room_id(&self) -> Ulid {
        match self {
            Event::BookingCreated(b) | Event::BookingCancelled(b) | Event::BookingStatusChanged(b) => b.room_id,
            Event::RoomStatusChanged(r) => r.id,
        }
    }

    /// Event name clients subscribe to.
    pub fn name(&self) -> &'static str {
        match self {
            Event::RoomStatusChanged(_) => "room-status-updated",
            _ => "booking-updated",
        }
    }

    pub fn change(&self) -> &'static str {
        match self {
            Event::BookingCreated(_) => "created",
            Event::BookingCancelled(_) => "cancelled",
            Event::BookingStatusChanged(_) | Event::RoomStatusChanged(_) => "status-changed",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        let value = match self {
            Event::BookingCreated(b) | Event::BookingCancelled(b) | Event::BookingStatusChanged(b) => {
                serde_json::to_value(BookingPayload::from(b))
            }
            Event::RoomStatusChanged(r) => serde_json::to_value(RoomPayload::from(r)),
        };
        value.unwrap_or_default()
    }
}

/// Receiving half handed to one subscriber.
pub struct Subscription {
    scope: Scope,
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Next event in this subscription's scope, or `None` once the hub is
    /// closed. Events missed while lagging are skipped with a warning.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.scope.matches(event.room_id()) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(scope = ?self.scope, skipped, "subscriber lagged, events dropped");
                    metrics::counter!(observability::EVENTS_DROPPED_TOTAL).increment(skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Scoped fan-out of booking events to real-time subscribers.
///
/// Built once at startup and shared through `Arc`; `close()` at shutdown
/// ends every subscription.
pub struct NotifyHub {
    channels: DashMap<Scope, broadcast::Sender<Event>>,
    capacity: usize,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a scope. Creates the channel if needed.
    pub fn subscribe(&self, scope: Scope) -> Subscription {
        let rx = self
            .channels
            .entry(scope)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Subscription { scope, rx }
    }

    /// Fan an event out to its room scope and the wildcard scope.
    /// Never fails; returns how many receivers got it.
    pub fn publish(&self, event: Event) -> usize {
        let mut delivered = 0;
        let mut abandoned = Vec::new();
        for scope in [Scope::Room(event.room_id()), Scope::AllRooms] {
            if let Some(sender) = self.channels.get(&scope) {
                match sender.send(event.clone()) {
                    Ok(n) => delivered += n,
                    Err(_) => abandoned.push(scope),
                }
            }
        }
        for scope in abandoned {
            self.channels
                .remove_if(&scope, |_, sender| sender.receiver_count() == 0);
        }
        metrics::counter!(observability::EVENTS_PUBLISHED_TOTAL, "event" => event.name()).increment(1);
        debug!(room = %event.room_id(), event = event.name(), change = event.change(), delivered, "event published");
        delivered
    }

    /// Live receivers on `scope`.
    pub fn subscriber_count(&self, scope: Scope) -> usize {
        self.channels
            .get(&scope)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Drop every channel; open subscriptions see end-of-stream.
    pub fn close(&self) {
        self.channels.clear();
    }
}

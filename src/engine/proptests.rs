//! Property-based tests for the availability check.

use proptest::prelude::*;
use ulid::Ulid;

use super::availability::{check, first_conflict};
use super::EngineError;
use crate::model::*;

const MINUTE: Ms = 60_000;
/// 2024-01-01T00:00:00Z
const DAY0: Ms = 1_704_067_200_000;

fn empty_room() -> RoomState {
    RoomState::new(Room {
        id: Ulid::new(),
        name: None,
        active: true,
    })
}

fn span_of(offset_min: i64, len_min: i64) -> Span {
    let start = DAY0 + offset_min * MINUTE;
    Span::new(start, start + len_min * MINUTE)
}

/// Feed requests through `check` the way the coordinator does and keep what
/// it accepts. Every third accepted booking is cancelled afterwards and
/// some of the rest are checked out.
fn accept_all(requests: &[(i64, i64)]) -> RoomState {
    let mut rs = empty_room();
    let room_id = rs.room.id;
    for (i, &(offset, len)) in requests.iter().enumerate() {
        let span = span_of(offset, len);
        if check(&rs, &span, None).is_ok() {
            let mut booking = Booking::pending(Ulid::new(), room_id, Ulid::new(), span, DAY0);
            if i % 3 == 2 {
                booking.status = BookingStatus::Cancelled;
            } else if i % 5 == 4 {
                booking.status = BookingStatus::Completed;
            }
            rs.insert_booking(booking);
        }
    }
    rs
}

fn requests() -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop::collection::vec((0i64..10_000, 1i64..600), 0..60)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 512,
        .. ProptestConfig::default()
    })]

    // Whatever sequence arrives, the non-cancelled set stays sorted and disjoint.
    #[test]
    fn accepted_bookings_pairwise_disjoint(reqs in requests()) {
        let rs = accept_all(&reqs);
        let held: Vec<&Booking> = rs.occupying().collect();
        for pair in rs.bookings.windows(2) {
            prop_assert!(pair[0].span.start <= pair[1].span.start);
        }
        for (i, a) in held.iter().enumerate() {
            for b in &held[i + 1..] {
                prop_assert!(!a.span.overlaps(&b.span), "{:?} overlaps {:?}", a.span, b.span);
            }
        }
    }

    // The indexed check agrees with a linear scan over non-cancelled bookings.
    #[test]
    fn check_matches_brute_force(reqs in requests(), offset in 0i64..10_000, len in 1i64..600) {
        let rs = accept_all(&reqs);
        let candidate = span_of(offset, len);
        let expected = rs.occupying().any(|b| b.span.overlaps(&candidate));
        match check(&rs, &candidate, None) {
            Ok(()) => prop_assert!(!expected),
            Err(EngineError::Conflict(id)) => {
                prop_assert!(expected);
                let named = rs.booking(&id).unwrap();
                prop_assert!(named.status.occupies());
                prop_assert!(named.span.overlaps(&candidate));
            }
            Err(other) => prop_assert!(false, "unexpected error {other}"),
        }
    }

    // Back-to-back stays on either side never conflict.
    #[test]
    fn adjacency_is_not_conflict(offset in 600i64..10_000, len in 1i64..600, before in 1i64..600, after in 1i64..600) {
        let mut rs = empty_room();
        let existing = span_of(offset, len);
        let room_id = rs.room.id;
        rs.insert_booking(Booking::pending(Ulid::new(), room_id, Ulid::new(), existing, DAY0));

        let left = Span::new(existing.start - before * MINUTE, existing.start);
        let right = Span::new(existing.end, existing.end + after * MINUTE);
        prop_assert!(check(&rs, &left, None).is_ok());
        prop_assert!(check(&rs, &right, None).is_ok());
    }

    // A booking being modified never blocks its own new interval.
    #[test]
    fn ignored_booking_never_conflicts(offset in 0i64..10_000, len in 1i64..600, shift in -599i64..600) {
        let mut rs = empty_room();
        let room_id = rs.room.id;
        let own = Booking::pending(Ulid::new(), room_id, Ulid::new(), span_of(offset, len), DAY0);
        let own_id = own.id;
        rs.insert_booking(own);

        let moved = span_of((offset + shift).max(0), len);
        prop_assert!(first_conflict(&rs.bookings, &moved, Some(own_id)).is_none());
    }
}

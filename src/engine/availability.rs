use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Reject malformed candidates before any conflict logic runs.
pub fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidInterval {
            start: span.start,
            end: span.end,
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// First non-cancelled booking in `bookings` (sorted by start) that overlaps
/// `candidate`. COMPLETED stays keep their interval.
///
/// Binary search drops everything starting at or after `candidate.end`
/// (O(log n)); the remaining prefix is scanned for `end > candidate.start`,
/// O(n) worst case since bookings are not indexed by end. `ignore` skips the
/// booking being modified.
pub fn first_conflict<'a>(
    bookings: &'a [Booking],
    candidate: &Span,
    ignore: Option<Ulid>,
) -> Option<&'a Booking> {
    let right_bound = bookings.partition_point(|b| b.span.start < candidate.end);
    bookings[..right_bound].iter().find(|b| {
        b.status.occupies() && Some(b.id) != ignore && b.span.end > candidate.start
    })
}

/// Decide whether `candidate` can be granted in `room`.
pub fn check(room: &RoomState, candidate: &Span, ignore: Option<Ulid>) -> Result<(), EngineError> {
    validate_span(candidate)?;
    match first_conflict(&room.bookings, candidate, ignore) {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    /// 2024-01-01T00:00:00Z
    const DAY0: Ms = 1_704_067_200_000;

    fn room_with(spans: &[(Ms, Ms, BookingStatus)]) -> (RoomState, Vec<Ulid>) {
        let mut rs = RoomState::new(Room {
            id: Ulid::new(),
            name: None,
            active: true,
        });
        let mut ids = Vec::new();
        for &(start, end, status) in spans {
            let mut b = Booking::pending(
                Ulid::new(),
                rs.room.id,
                Ulid::new(),
                Span::new(DAY0 + start, DAY0 + end),
                0,
            );
            b.status = status;
            ids.push(b.id);
            rs.insert_booking(b);
        }
        (rs, ids)
    }

    fn span(start: Ms, end: Ms) -> Span {
        Span { start: DAY0 + start, end: DAY0 + end }
    }

    #[test]
    fn empty_room_is_available() {
        let (rs, _) = room_with(&[]);
        assert!(check(&rs, &span(0, H), None).is_ok());
    }

    #[test]
    fn adjacent_is_not_a_conflict() {
        let (rs, _) = room_with(&[(10 * H, 12 * H, BookingStatus::Confirmed)]);
        assert!(check(&rs, &span(12 * H, 13 * H), None).is_ok());
        assert!(check(&rs, &span(8 * H, 10 * H), None).is_ok());
    }

    #[test]
    fn partial_overlap_conflicts() {
        let (rs, ids) = room_with(&[(10 * H, 12 * H, BookingStatus::Confirmed)]);
        assert_eq!(
            check(&rs, &span(11 * H, 13 * H), None),
            Err(EngineError::Conflict(ids[0]))
        );
        assert_eq!(
            check(&rs, &span(9 * H, 11 * H), None),
            Err(EngineError::Conflict(ids[0]))
        );
    }

    #[test]
    fn containment_conflicts_both_ways() {
        let (rs, ids) = room_with(&[(10 * H, 12 * H, BookingStatus::Pending)]);
        assert_eq!(
            check(&rs, &span(9 * H, 13 * H), None),
            Err(EngineError::Conflict(ids[0]))
        );
        assert_eq!(
            check(&rs, &span(10 * H + 1, 11 * H), None),
            Err(EngineError::Conflict(ids[0]))
        );
        assert_eq!(
            check(&rs, &span(10 * H, 12 * H), None),
            Err(EngineError::Conflict(ids[0]))
        );
    }

    #[test]
    fn cancelled_bookings_never_conflict() {
        let (rs, _) = room_with(&[
            (10 * H, 12 * H, BookingStatus::Cancelled),
            (12 * H, 14 * H, BookingStatus::Cancelled),
        ]);
        assert!(check(&rs, &span(10 * H, 14 * H), None).is_ok());
    }

    #[test]
    fn completed_booking_still_conflicts() {
        let (rs, ids) = room_with(&[
            (10 * H, 12 * H, BookingStatus::Cancelled),
            (12 * H, 14 * H, BookingStatus::Completed),
        ]);
        assert_eq!(
            check(&rs, &span(10 * H, 14 * H), None),
            Err(EngineError::Conflict(ids[1]))
        );
        assert!(check(&rs, &span(10 * H, 12 * H), None).is_ok());
    }

    #[test]
    fn first_conflict_in_start_order() {
        let (rs, ids) = room_with(&[
            (8 * H, 9 * H, BookingStatus::Confirmed),
            (10 * H, 11 * H, BookingStatus::Confirmed),
            (12 * H, 13 * H, BookingStatus::Confirmed),
        ]);
        assert_eq!(
            check(&rs, &span(8 * H + 30, 12 * H + 30), None),
            Err(EngineError::Conflict(ids[0]))
        );
    }

    #[test]
    fn long_booking_starting_early_is_found() {
        let (rs, ids) = room_with(&[
            (0, 48 * H, BookingStatus::Confirmed),
            (50 * H, 51 * H, BookingStatus::Confirmed),
        ]);
        assert_eq!(
            check(&rs, &span(20 * H, 21 * H), None),
            Err(EngineError::Conflict(ids[0]))
        );
    }

    #[test]
    fn ignored_booking_is_skipped() {
        let (rs, ids) = room_with(&[(10 * H, 12 * H, BookingStatus::Confirmed)]);
        assert!(check(&rs, &span(11 * H, 13 * H), Some(ids[0])).is_ok());
    }

    #[test]
    fn zero_length_is_invalid_before_conflict() {
        let (rs, _) = room_with(&[(10 * H, 12 * H, BookingStatus::Confirmed)]);
        let candidate = span(11 * H, 11 * H);
        assert_eq!(
            check(&rs, &candidate, None),
            Err(EngineError::InvalidInterval {
                start: candidate.start,
                end: candidate.end
            })
        );
    }

    #[test]
    fn reversed_span_is_invalid() {
        assert!(matches!(
            validate_span(&span(2 * H, H)),
            Err(EngineError::InvalidInterval { .. })
        ));
    }

    #[test]
    fn out_of_range_and_too_wide_rejected() {
        assert_eq!(
            validate_span(&Span { start: 0, end: 1000 }),
            Err(EngineError::LimitExceeded("timestamp out of range"))
        );
        assert_eq!(
            validate_span(&span(0, MAX_SPAN_DURATION_MS + 1)),
            Err(EngineError::LimitExceeded("span too wide"))
        );
    }
}

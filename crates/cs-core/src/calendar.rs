//! Calendar-block rules.
//!
//! A property is blocked for `[check_in, check_out)` exactly while one of
//! its reservations sits in the occupying set (confirmed, checked in,
//! checked out). This module decides what has to happen to a block when a
//! reservation changes; the store applies the decision in the same
//! transaction as the status write.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{DateRange, ReservationStatus};

/// A derived availability block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarBlock {
    pub property_ref: Uuid,
    pub date_range: DateRange,
    pub source_reservation_ref: Uuid,
}

/// What the store must do with a reservation's block after a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTransition {
    /// Entered the occupying set.
    Create(DateRange),
    /// Left the occupying set.
    Remove,
    /// Still occupying but the stay moved.
    Replace(DateRange),
    Keep,
}

/// Snapshot of the fields that decide a reservation's block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockState {
    pub status: ReservationStatus,
    pub stay: DateRange,
    pub property_ref: Uuid,
}

/// Decide the block change between `previous` (absent for a new
/// reservation) and `next`.
pub fn on_reservation_change(previous: Option<&BlockState>, next: &BlockState) -> BlockTransition {
    let was = previous.map(|p| p.status.is_occupying()).unwrap_or(false);
    let is = next.status.is_occupying();
    match (was, is) {
        (false, true) => BlockTransition::Create(next.stay),
        (true, false) => BlockTransition::Remove,
        (true, true) => {
            let moved = previous
                .map(|p| p.stay != next.stay || p.property_ref != next.property_ref)
                .unwrap_or(true);
            if moved {
                BlockTransition::Replace(next.stay)
            } else {
                BlockTransition::Keep
            }
        }
        (false, false) => BlockTransition::Keep,
    }
}

/// Status-only form of [`on_reservation_change`].
pub fn on_status_change(
    stay: DateRange,
    previous: Option<ReservationStatus>,
    next: ReservationStatus,
) -> BlockTransition {
    let property_ref = Uuid::nil();
    let prev = previous.map(|status| BlockState {
        status,
        stay,
        property_ref,
    });
    on_reservation_change(
        prev.as_ref(),
        &BlockState {
            status: next,
            stay,
            property_ref,
        },
    )
}

/// `true` when moving an existing reservation from `from` to `to` is
/// destructive: it cancels the booking or releases its block.
pub fn requires_permit(from: ReservationStatus, to: ReservationStatus) -> bool {
    if from == to {
        return false;
    }
    to == ReservationStatus::Cancelled || (from.is_occupying() && !to.is_occupying())
}

/// `true` when none of the ranges overlap each other.
pub fn non_overlapping(ranges: &[DateRange]) -> bool {
    let mut sorted: Vec<_> = ranges.to_vec();
    sorted.sort_by_key(|r| r.start);
    sorted.windows(2).all(|w| w[0].end <= w[1].start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ReservationStatus::*;

    fn range(a: &str, b: &str) -> DateRange {
        DateRange::new(
            NaiveDate::parse_from_str(a, "%Y-%m-%d").unwrap(),
            NaiveDate::parse_from_str(b, "%Y-%m-%d").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn every_status_pair_follows_the_occupying_set() {
        let stay = range("2025-02-01", "2025-02-05");
        for from in ReservationStatus::ALL {
            for to in ReservationStatus::ALL {
                let t = on_status_change(stay, Some(from), to);
                let expected = match (from.is_occupying(), to.is_occupying()) {
                    (false, true) => BlockTransition::Create(stay),
                    (true, false) => BlockTransition::Remove,
                    _ => BlockTransition::Keep,
                };
                assert_eq!(t, expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn new_reservation_blocks_only_when_occupying() {
        let stay = range("2025-02-01", "2025-02-05");
        assert_eq!(
            on_status_change(stay, None, Confirmed),
            BlockTransition::Create(stay)
        );
        assert_eq!(on_status_change(stay, None, Pending), BlockTransition::Keep);
        assert_eq!(on_status_change(stay, None, Cancelled), BlockTransition::Keep);
    }

    #[test]
    fn moved_stay_replaces_block() {
        let property_ref = Uuid::new_v4();
        let before = BlockState {
            status: Confirmed,
            stay: range("2025-02-01", "2025-02-05"),
            property_ref,
        };
        let after = BlockState {
            status: CheckedIn,
            stay: range("2025-02-02", "2025-02-05"),
            property_ref,
        };
        assert_eq!(
            on_reservation_change(Some(&before), &after),
            BlockTransition::Replace(after.stay)
        );
        assert_eq!(
            on_reservation_change(Some(&before), &before),
            BlockTransition::Keep
        );
    }

    #[test]
    fn destructive_transitions() {
        assert!(requires_permit(Confirmed, Cancelled));
        assert!(requires_permit(Pending, Cancelled));
        assert!(requires_permit(Confirmed, NoShow));
        assert!(requires_permit(CheckedIn, Pending));
        assert!(!requires_permit(Pending, Confirmed));
        assert!(!requires_permit(Confirmed, CheckedIn));
        assert!(!requires_permit(Cancelled, Cancelled));
        assert!(!requires_permit(Pending, NoShow));
    }

    #[test]
    fn overlap_detection() {
        assert!(non_overlapping(&[
            range("2025-02-05", "2025-02-07"),
            range("2025-02-01", "2025-02-05"),
        ]));
        assert!(!non_overlapping(&[
            range("2025-02-01", "2025-02-05"),
            range("2025-02-04", "2025-02-07"),
        ]));
    }
}

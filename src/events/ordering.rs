//! Deterministic freshness rule for timestamped events.
//!
//! Every peer applies the same pure decision to the same pair of events,
//! so all observers converge on the same winner regardless of arrival
//! order. This is the conflict-resolution backbone for everything that
//! consumes stamped events: last-writer-wins on the timestamp, a
//! lexicographic client-id tie-break, and a debounce window around the
//! comparison.

use crate::events::EventStamp;

/// Decide whether `received` should replace `current`.
///
/// Priority order:
///
/// 1. Nothing held yet: `received` wins.
/// 2. Equal timestamps: lexicographic tie-break on client id. The received
///    event wins only when the current holder's id sorts higher, so
///    same-sender duplicates always lose and all peers pick the same
///    winner.
/// 3. `received` is older: it still wins when it trails the holder by at
///    most `debounce_ms` (a slow network, not a stale update).
/// 4. `received` is newer: it wins only once it leads the holder by at
///    least `debounce_ms` (suppresses flicker from near-simultaneous
///    updates).
///
/// Branches 3 and 4 are asymmetric by contract: late-but-close events are
/// let in while new-but-close events are held back. Callers rely on that
/// exact behavior, so the two branches must not be collapsed into one
/// symmetric window.
pub fn is_newer(
    current: Option<EventStamp<'_>>,
    received: EventStamp<'_>,
    debounce_ms: i64,
) -> bool {
    let Some(current) = current else {
        return true;
    };
    if current.timestamp == received.timestamp {
        current.client_id > received.client_id
    } else if current.timestamp > received.timestamp {
        current.timestamp - received.timestamp <= debounce_ms
    } else {
        received.timestamp - current.timestamp >= debounce_ms
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_current_always_newer() {
        assert!(is_newer(None, EventStamp::new("client-a", 1000), 0));
        assert!(is_newer(None, EventStamp::new("client-a", 1000), 500));
    }

    #[test]
    fn equal_timestamps_tie_break_lexicographically() {
        // Current holder sorts lower: received loses.
        assert!(!is_newer(
            Some(EventStamp::new("CA", 1000)),
            EventStamp::new("CB", 1000),
            0,
        ));
        // Current holder sorts higher: received wins.
        assert!(is_newer(
            Some(EventStamp::new("CB", 1000)),
            EventStamp::new("CA", 1000),
            0,
        ));
    }

    #[test]
    fn same_sender_duplicate_rejected() {
        assert!(!is_newer(
            Some(EventStamp::new("CA", 1000)),
            EventStamp::new("CA", 1000),
            0,
        ));
    }

    #[test]
    fn newer_event_within_debounce_window_held_back() {
        assert!(!is_newer(
            Some(EventStamp::new("CA", 1000)),
            EventStamp::new("CB", 1050),
            100,
        ));
    }

    #[test]
    fn newer_event_past_debounce_window_wins() {
        assert!(is_newer(
            Some(EventStamp::new("CA", 1000)),
            EventStamp::new("CB", 1100),
            100,
        ));
        assert!(is_newer(
            Some(EventStamp::new("CA", 1000)),
            EventStamp::new("CB", 1200),
            100,
        ));
    }

    #[test]
    fn older_event_within_debounce_window_wins() {
        assert!(is_newer(
            Some(EventStamp::new("CA", 1000)),
            EventStamp::new("CB", 950),
            100,
        ));
    }

    #[test]
    fn older_event_past_debounce_window_rejected() {
        assert!(!is_newer(
            Some(EventStamp::new("CA", 1000)),
            EventStamp::new("CB", 850),
            100,
        ));
    }

    #[test]
    fn zero_debounce_is_plain_last_writer_wins() {
        // Older rejected...
        assert!(!is_newer(
            Some(EventStamp::new("CA", 1000)),
            EventStamp::new("CB", 999),
            0,
        ));
        // ...newer accepted.
        assert!(is_newer(
            Some(EventStamp::new("CA", 1000)),
            EventStamp::new("CB", 1001),
            0,
        ));
    }

    #[test]
    fn replay_order_converges_without_debounce() {
        let log = [
            ("client-c", 1000_i64),
            ("client-a", 1050),
            ("client-b", 1050),
        ];
        let orders: &[[usize; 3]] = &[
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        let mut winners = Vec::new();
        for order in orders {
            let mut current: Option<(String, i64)> = None;
            for &index in order {
                let (client_id, timestamp) = log[index];
                let received = EventStamp::new(client_id, timestamp);
                let held = current
                    .as_ref()
                    .map(|(id, ts)| EventStamp::new(id, *ts));
                if is_newer(held, received, 0) {
                    current = Some((client_id.to_string(), timestamp));
                }
            }
            winners.push(current.unwrap());
        }

        // Highest timestamp, lexicographically lowest id on the tie.
        for winner in &winners {
            assert_eq!(winner.0, "client-a");
            assert_eq!(winner.1, 1050);
        }
    }
}

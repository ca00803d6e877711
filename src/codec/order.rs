use std::time::Duration;

use super::Timestamp;

/// How a sample's timestamp relates to the newest one already committed to its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// At or after the stream head, or behind it by no more than the tolerance.
    InOrder,
    /// Behind the stream head by more than the tolerance.
    OutOfOrder { behind: Duration },
}

impl Arrival {
    pub fn is_out_of_order(self) -> bool {
        matches!(self, Self::OutOfOrder { .. })
    }
}

/// Classify `ts` against the stream head `last`.
///
/// Out-of-order samples are flagged, never dropped or reordered on write.
pub fn classify(last: Option<Timestamp>, ts: Timestamp, tolerance: Duration) -> Arrival {
    match last {
        Some(head) if ts < head => {
            let behind = head.abs_diff(ts);
            if behind > tolerance {
                Arrival::OutOfOrder { behind }
            } else {
                Arrival::InOrder
            }
        }
        _ => Arrival::InOrder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let head = Some(Timestamp::from_nanos(10_000_000));
        let tol = Duration::from_millis(2);

        assert_eq!(classify(None, Timestamp::from_nanos(0), tol), Arrival::InOrder);
        assert_eq!(
            classify(head, Timestamp::from_nanos(10_000_001), tol),
            Arrival::InOrder
        );
        assert_eq!(
            classify(head, Timestamp::from_nanos(10_000_000), tol),
            Arrival::InOrder
        );
        // Within jitter tolerance.
        assert_eq!(
            classify(head, Timestamp::from_nanos(8_000_000), tol),
            Arrival::InOrder
        );

        let late = classify(head, Timestamp::from_nanos(5_000_000), tol);
        assert!(late.is_out_of_order());
        assert_eq!(
            late,
            Arrival::OutOfOrder {
                behind: Duration::from_millis(5)
            }
        );
    }
}

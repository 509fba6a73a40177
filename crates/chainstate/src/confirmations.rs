//! Confirmation counts, derived on query and never stored.

/// Where a transaction currently sits relative to the canonical chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxPosition {
    Confirmed { height: u32 },
    Pending,
    Unknown,
}

/// Confirmations for a transaction at `position` given the canonical tip height.
///
/// A transaction in the tip block has one confirmation; pending transactions
/// have zero; unknown ones have none.
pub fn confirmations(tip_height: Option<u32>, position: TxPosition) -> Option<u32> {
    match position {
        TxPosition::Confirmed { height } => {
            let tip = tip_height?;
            if height > tip {
                return None;
            }
            Some(tip - height + 1)
        }
        TxPosition::Pending => Some(0),
        TxPosition::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_from_tip() {
        assert_eq!(confirmations(Some(0), TxPosition::Confirmed { height: 0 }), Some(1));
        assert_eq!(confirmations(Some(10), TxPosition::Confirmed { height: 4 }), Some(7));
        assert_eq!(confirmations(Some(3), TxPosition::Confirmed { height: 5 }), None);
        assert_eq!(confirmations(None, TxPosition::Confirmed { height: 0 }), None);
    }

    #[test]
    fn pending_and_unknown() {
        assert_eq!(confirmations(Some(9), TxPosition::Pending), Some(0));
        assert_eq!(confirmations(None, TxPosition::Pending), Some(0));
        assert_eq!(confirmations(Some(9), TxPosition::Unknown), None);
    }
}

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnlineState {
    /// No connection attempt has completed yet.
    #[default]
    Unknown,
    Online,
    /// Either the network is disabled or connecting failed repeatedly.
    /// Listeners are served from the cache.
    Offline,
}

/// Monotonic counter stamped on targets and documents for LRU collection.
pub type ListenSequenceNumber = i64;

pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Hands out increasing sequence numbers, starting after a given value.
#[derive(Clone, Debug)]
pub struct ListenSequence {
    previous: ListenSequenceNumber,
}

impl ListenSequence {
    pub fn new(previous: ListenSequenceNumber) -> Self {
        Self { previous }
    }

    pub fn next(&mut self) -> ListenSequenceNumber {
        self.previous += 1;
        self.previous
    }

    pub fn current(&self) -> ListenSequenceNumber {
        self.previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase() {
        let mut sequence = ListenSequence::new(5);
        assert_eq!(sequence.next(), 6);
        assert_eq!(sequence.next(), 7);
        assert_eq!(sequence.current(), 7);
    }
}

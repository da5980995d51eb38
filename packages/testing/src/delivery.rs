use std::fmt;

/// A message tagged with the producer that sent it and its position in that producer's
/// sequence.
///
/// Lets a consumer check exactly-once delivery and per-producer ordering without knowing
/// anything else about the messages.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[expect(
    clippy::exhaustive_structs,
    reason = "plain data that tests construct and destructure freely"
)]
pub struct Tagged {
    /// Index of the sending producer, starting from zero.
    pub producer: usize,

    /// Position of the message in the producer's sequence, starting from zero.
    pub sequence: u64,
}

impl Tagged {
    /// Creates a tag for message number `sequence` of producer number `producer`.
    #[must_use]
    pub fn new(producer: usize, sequence: u64) -> Self {
        Self { producer, sequence }
    }
}

/// A delivery guarantee violated by the messages a consumer observed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum DeliveryViolation {
    /// A message came from a producer index outside the expected range.
    UnknownProducer(Tagged),

    /// A message arrived that was not the next one expected from its producer. Either an
    /// earlier message was lost or reordered, or this one was duplicated.
    OutOfOrder {
        /// The message that arrived.
        received: Tagged,

        /// The sequence number that was expected from the same producer.
        expected: u64,
    },

    /// A producer's sequence ended before all of its messages arrived.
    Missing {
        /// Index of the producer.
        producer: usize,

        /// How many of its messages arrived.
        received: u64,
    },
}

impl fmt::Display for DeliveryViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownProducer(tag) => write!(f, "message from unknown producer: {tag:?}"),
            Self::OutOfOrder { received, expected } => write!(
                f,
                "producer {} sent sequence {} but {expected} was expected",
                received.producer, received.sequence
            ),
            Self::Missing { producer, received } => write!(
                f,
                "producer {producer} delivered only {received} messages"
            ),
        }
    }
}

/// Tracks messages from a fixed set of producers and checks that each producer's messages
/// arrive exactly once and in the order they were sent.
///
/// # Example
///
/// ```rust
/// use testing::{DeliveryChecker, Tagged};
///
/// let mut checker = DeliveryChecker::new(2, 2);
///
/// checker.observe(Tagged::new(1, 0)).unwrap();
/// checker.observe(Tagged::new(0, 0)).unwrap();
/// checker.observe(Tagged::new(0, 1)).unwrap();
/// assert!(!checker.is_complete());
///
/// checker.observe(Tagged::new(1, 1)).unwrap();
/// checker.finish().unwrap();
/// ```
#[derive(Debug)]
pub struct DeliveryChecker {
    next_expected: Vec<u64>,
    per_producer: u64,
}

impl DeliveryChecker {
    /// Creates a checker expecting `per_producer` messages from each of `producers` producers.
    #[must_use]
    pub fn new(producers: usize, per_producer: u64) -> Self {
        Self {
            next_expected: vec![0; producers],
            per_producer,
        }
    }

    /// Records one received message.
    ///
    /// # Errors
    ///
    /// Returns the violation if the message is not the next one expected from its producer.
    pub fn observe(&mut self, tag: Tagged) -> Result<(), DeliveryViolation> {
        let Some(expected) = self.next_expected.get_mut(tag.producer) else {
            return Err(DeliveryViolation::UnknownProducer(tag));
        };

        if tag.sequence != *expected {
            return Err(DeliveryViolation::OutOfOrder {
                received: tag,
                expected: *expected,
            });
        }

        *expected = expected.wrapping_add(1);
        Ok(())
    }

    /// Total number of messages observed so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.next_expected.iter().sum()
    }

    /// Whether every message from every producer has been observed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.next_expected
            .iter()
            .all(|&received| received == self.per_producer)
    }

    /// Checks that every producer delivered all of its messages.
    ///
    /// # Errors
    ///
    /// Returns the first producer that fell short.
    pub fn finish(&self) -> Result<(), DeliveryViolation> {
        for (producer, &received) in self.next_expected.iter().enumerate() {
            if received != self.per_producer {
                return Err(DeliveryViolation::Missing { producer, received });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn interleaved_producers_are_accepted() {
        let mut checker = DeliveryChecker::new(3, 2);

        for tag in [(2, 0), (0, 0), (2, 1), (1, 0), (0, 1), (1, 1)] {
            checker.observe(Tagged::new(tag.0, tag.1)).unwrap();
        }

        assert!(checker.is_complete());
        assert_eq!(checker.received(), 6);
        checker.finish().unwrap();
    }

    #[test]
    fn duplicate_is_detected() {
        let mut checker = DeliveryChecker::new(1, 3);

        checker.observe(Tagged::new(0, 0)).unwrap();

        assert_eq!(
            checker.observe(Tagged::new(0, 0)),
            Err(DeliveryViolation::OutOfOrder {
                received: Tagged::new(0, 0),
                expected: 1,
            })
        );
    }

    #[test]
    fn gap_is_detected() {
        let mut checker = DeliveryChecker::new(1, 3);

        assert!(checker.observe(Tagged::new(0, 1)).is_err());
    }

    #[test]
    fn unknown_producer_is_detected() {
        let mut checker = DeliveryChecker::new(1, 1);

        assert_eq!(
            checker.observe(Tagged::new(4, 0)),
            Err(DeliveryViolation::UnknownProducer(Tagged::new(4, 0)))
        );
    }

    #[test]
    fn missing_messages_are_reported() {
        let mut checker = DeliveryChecker::new(2, 2);

        checker.observe(Tagged::new(0, 0)).unwrap();
        checker.observe(Tagged::new(0, 1)).unwrap();
        checker.observe(Tagged::new(1, 0)).unwrap();

        assert_eq!(
            checker.finish(),
            Err(DeliveryViolation::Missing {
                producer: 1,
                received: 1
            })
        );
        assert_eq!(
            checker.finish().unwrap_err().to_string(),
            "producer 1 delivered only 1 messages"
        );
    }
}

//! # Key Calculator
//!
//! Peers mint object and universe ids without talking to each other. At
//! connect time every peer receives a distinct 16-bit prefix from an atomic
//! counter in the backing store; from then on it composes ids locally:
//!
//! ```text
//!  52                 37 36                                    0
//! ┌──────────────────────┬──────────────────────────────────────┐
//! │ prefix (16 bits)     │ counter (37 bits)                    │
//! └──────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! Ids are 53 bits wide, which keeps them below the `END_OF_TIME` and
//! `NULL_LONG` sentinels. The counter is persisted on every save so a peer
//! that reconnects with the same prefix resumes where it stopped.
//!
//! ## Thread Safety
//!
//! `KeyCalculator` is plain owned state. The data manager keeps each one
//! behind its connection lock, so `next_key` takes `&mut self`.

use eyre::{bail, Result};

use crate::config::{COUNTER_BITS, END_OF_TIME, MAX_COUNTER};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCalculator {
    prefix: i16,
    counter: i64,
}

impl KeyCalculator {
    pub fn new(prefix: i16, counter: i64) -> Self {
        Self { prefix, counter }
    }

    pub fn prefix(&self) -> i16 {
        self.prefix
    }

    /// Counter value of the most recently minted id.
    pub fn last_computed_index(&self) -> i64 {
        self.counter
    }

    pub fn next_key(&mut self) -> Result<i64> {
        if self.counter >= MAX_COUNTER {
            bail!(StoreError::KeySpaceExhausted {
                prefix: self.prefix
            });
        }
        let counter = self.counter + 1;
        let key = ((self.prefix as u16 as i64) << COUNTER_BITS) | counter;
        if key >= END_OF_TIME {
            bail!(StoreError::KeySpaceExhausted {
                prefix: self.prefix
            });
        }
        self.counter = counter;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::store_error;

    #[test]
    fn keys_are_prefixed_and_sequential() {
        let mut calc = KeyCalculator::new(3, 0);
        let first = calc.next_key().unwrap();
        let second = calc.next_key().unwrap();

        assert_eq!(first >> COUNTER_BITS, 3);
        assert_eq!(first & MAX_COUNTER, 1);
        assert_eq!(second, first + 1);
        assert_eq!(calc.last_computed_index(), 2);
    }

    #[test]
    fn distinct_prefixes_never_collide() {
        let mut a = KeyCalculator::new(1, 0);
        let mut b = KeyCalculator::new(2, 0);
        let from_a: Vec<i64> = (0..100).map(|_| a.next_key().unwrap()).collect();
        let from_b: Vec<i64> = (0..100).map(|_| b.next_key().unwrap()).collect();
        assert!(from_a.iter().all(|k| !from_b.contains(k)));
    }

    #[test]
    fn resumes_from_persisted_counter() {
        let mut calc = KeyCalculator::new(0, 41);
        assert_eq!(calc.next_key().unwrap(), 42);
    }

    #[test]
    fn exhausted_counter_is_reported() {
        let mut calc = KeyCalculator::new(7, MAX_COUNTER);
        let err = calc.next_key().unwrap_err();
        assert_eq!(
            store_error(&err),
            Some(&StoreError::KeySpaceExhausted { prefix: 7 })
        );
        assert_eq!(calc.last_computed_index(), MAX_COUNTER);
    }

    #[test]
    fn negative_prefix_is_bounded_below_sentinels() {
        let mut calc = KeyCalculator::new(-1, MAX_COUNTER - 2);
        assert!(calc.next_key().is_err());
    }
}

//! Synthetic log records for the ballast pipeline.
//!
//! This library produces structured log documents with a realistic traffic
//! shape. Generation is addressable: a [`Synthesizer`] holds only a seed,
//! and every `(seed, sequence)` pair maps to exactly one document, so
//! concurrent producers with disjoint sequence ranges share nothing and a
//! run can be reproduced bit-for-bit.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use rand::{Rng, SeedableRng, rngs::SmallRng, seq::IndexedRandom};
use time::{Duration, OffsetDateTime, format_description::well_known::Rfc3339};

mod record;

pub use record::{ErrorDetail, Level, Metrics, Record};

/// Maximum number of seconds a record's timestamp is backdated from the
/// synthesis instant.
const BACKDATE_MAX_SECONDS: i64 = 300;

/// Errors produced by [`Synthesizer`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Timestamp could not be rendered.
    #[error(transparent)]
    Format(#[from] time::error::Format),
}

/// Stateless, seeded producer of [`Record`]s.
///
/// Holds no RNG of its own. Each call derives a fresh small RNG from the
/// seed and the sequence number, which makes the type freely shareable
/// across tasks.
#[derive(Debug, Clone, Copy)]
pub struct Synthesizer {
    base: u64,
}

impl Synthesizer {
    /// Create a new [`Synthesizer`] from a 32-byte seed.
    ///
    /// # Panics
    ///
    /// Will panic if the seed does not fold into eight-byte words, which a
    /// 32-byte array always does.
    #[must_use]
    pub fn new(seed: [u8; 32]) -> Self {
        let mut base = 0_u64;
        for chunk in seed.chunks_exact(8) {
            let word = u64::from_le_bytes(chunk.try_into().expect("chunk is 8 bytes"));
            base = base.rotate_left(17) ^ word;
        }
        Self { base }
    }

    /// Produce the record for `sequence` stamped relative to the current
    /// wall clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the timestamp cannot be rendered as RFC 3339.
    pub fn synthesize(&self, sequence: u64) -> Result<Record, Error> {
        self.synthesize_at(sequence, OffsetDateTime::now_utc())
    }

    /// Produce the record for `sequence` stamped relative to `now`.
    ///
    /// Identical inputs yield identical records.
    ///
    /// # Errors
    ///
    /// Returns an error if the timestamp cannot be rendered as RFC 3339.
    ///
    /// # Panics
    ///
    /// Will panic if a value pool is empty. The pools are compiled in and
    /// non-empty.
    pub fn synthesize_at(&self, sequence: u64, now: OffsetDateTime) -> Result<Record, Error> {
        let mut rng = SmallRng::seed_from_u64(mix(self.base, sequence));

        let service = *record::SERVICES.choose(&mut rng).expect("pool is non-empty");
        let level: Level = rng.random();
        let message = record::message(&mut rng);

        let backdate = rng.random_range(0..=BACKDATE_MAX_SECONDS);
        let timestamp = (now - Duration::seconds(backdate)).format(&Rfc3339)?;

        let environment = *record::ENVIRONMENTS
            .choose(&mut rng)
            .expect("pool is non-empty");
        let host = format!("host-{n:02}", n = rng.random_range(1..=20_u8));
        let request_id = format!("req_{n}", n = rng.random_range(100_000..=999_999_u32));
        let user_id =
            (rng.random::<f64>() < 0.8).then(|| rng.random_range(1_000..=50_000_u32));
        let session_id = format!(
            "sess_{n}",
            n = rng.random_range(1_000_000..=9_999_999_u32)
        );
        let metrics: Metrics = rng.random();
        let error = (level == Level::Error).then(|| ErrorDetail::sample(&mut rng, service));

        Ok(Record {
            timestamp,
            service,
            level,
            message,
            environment,
            host,
            request_id,
            user_id,
            session_id,
            metrics,
            error,
        })
    }
}

/// SplitMix64 finalizer over the seed base and sequence number. Adjacent
/// sequences must land on uncorrelated RNG streams.
fn mix(base: u64, sequence: u64) -> u64 {
    let mut z = base.wrapping_add(sequence.wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use time::OffsetDateTime;

    use super::{Level, Synthesizer};

    fn fixed_now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("valid timestamp")
    }

    #[test]
    fn identical_inputs_yield_identical_records() {
        let synthesizer = Synthesizer::new([7; 32]);
        let a = synthesizer
            .synthesize_at(42, fixed_now())
            .expect("synthesize failed");
        let b = synthesizer
            .synthesize_at(42, fixed_now())
            .expect("synthesize failed");
        assert_eq!(a, b);
    }

    #[test]
    fn adjacent_sequences_differ() {
        let synthesizer = Synthesizer::new([7; 32]);
        let a = synthesizer
            .synthesize_at(0, fixed_now())
            .expect("synthesize failed");
        let b = synthesizer
            .synthesize_at(1, fixed_now())
            .expect("synthesize failed");
        assert_ne!(a, b);
    }

    #[test]
    fn error_detail_appears_exactly_on_error_level() {
        let synthesizer = Synthesizer::new([11; 32]);
        let mut errors = 0_u32;
        for sequence in 0..500 {
            let record = synthesizer
                .synthesize_at(sequence, fixed_now())
                .expect("synthesize failed");
            assert_eq!(record.level == Level::Error, record.error.is_some());
            if let Some(detail) = &record.error {
                errors += 1;
                assert!(detail.stack_trace.contains(record.service));
            }
        }
        // Roughly one record in ten is an ERROR.
        assert!((20..=90).contains(&errors), "errors {errors}");
    }

    #[test]
    fn timestamps_are_backdated_utc() {
        use time::format_description::well_known::Rfc3339;

        let synthesizer = Synthesizer::new([3; 32]);
        let now = fixed_now();
        let floor = (now - time::Duration::seconds(300))
            .format(&Rfc3339)
            .expect("format failed");
        let ceiling = now.format(&Rfc3339).expect("format failed");

        for sequence in 0..100 {
            let record = synthesizer
                .synthesize_at(sequence, now)
                .expect("synthesize failed");
            assert!(record.timestamp.ends_with('Z'));
            // Same rendered precision, so lexicographic order is
            // chronological order.
            assert!(record.timestamp >= floor, "{} < {floor}", record.timestamp);
            assert!(record.timestamp <= ceiling, "{} > {ceiling}", record.timestamp);
        }
    }

    #[test]
    fn user_id_present_four_in_five() {
        let synthesizer = Synthesizer::new([5; 32]);
        let with_user = (0..5_000)
            .filter(|&sequence| {
                synthesizer
                    .synthesize_at(sequence, fixed_now())
                    .expect("synthesize failed")
                    .user_id
                    .is_some()
            })
            .count();
        let frac = with_user as f64 / 5_000.0;
        assert!((0.75..=0.85).contains(&frac), "user_id fraction {frac}");
    }

    // Every record must serialize to a JSON object carrying the fixed
    // fields, regardless of seed or sequence.
    proptest! {
        #[test]
        fn every_record_serializes(seed: u64, sequence: u64) {
            let mut bytes = [0_u8; 32];
            bytes[..8].copy_from_slice(&seed.to_le_bytes());
            let synthesizer = Synthesizer::new(bytes);

            let record = synthesizer
                .synthesize_at(sequence, fixed_now())
                .expect("synthesize failed");
            let json = serde_json::to_value(&record).expect("serialize failed");
            let object = json.as_object().expect("not an object");

            prop_assert!(object.get("@timestamp").is_some_and(serde_json::Value::is_string));
            prop_assert!(object.get("service").is_some_and(serde_json::Value::is_string));
            prop_assert!(object.get("level").is_some_and(serde_json::Value::is_string));
            prop_assert!(object.get("message").is_some_and(serde_json::Value::is_string));
            prop_assert!(object.get("host").is_some_and(serde_json::Value::is_string));
            // Omitted optionals must not appear as nulls.
            prop_assert!(!object.values().any(serde_json::Value::is_null));
        }
    }

    proptest! {
        #[test]
        fn determinism_holds_for_any_seed(seed: u64, sequence: u64) {
            let mut bytes = [0_u8; 32];
            bytes[..8].copy_from_slice(&seed.to_le_bytes());
            let synthesizer = Synthesizer::new(bytes);

            let a = synthesizer.synthesize_at(sequence, fixed_now()).expect("synthesize failed");
            let b = synthesizer.synthesize_at(sequence, fixed_now()).expect("synthesize failed");
            prop_assert_eq!(a, b);
        }
    }
}

//! Deterministic container name generation — §4.5.
//!
//! `<PREFIX>_YYYYMMDD_<12hex>_<2hex>`. The 12-hex block packs
//! `(epoch_ms & wrap_mask) << 8 | node_id` into 48 bits; the 2-hex suffix is
//! an in-process same-day counter, which is what makes two calls on the
//! same `(node_id, ms)` produce distinct names by construction — no
//! coordination with other processes is needed for that guarantee.

use chrono::{DateTime, Utc};

use crate::error::{DesError, DesResult};

const COUNTER_MAX: u8 = 0xff;

#[derive(Debug, Clone)]
pub struct NameGeneratorConfig {
    pub prefix: String,
    pub node_id: u16,
    pub wrap_bits: u32,
}

impl NameGeneratorConfig {
    pub fn validate(&self) -> DesResult<()> {
        if self.prefix.is_empty() || !self.prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DesError::ConfigError(
                "name generator prefix must be non-empty ASCII letters/digits".into(),
            ));
        }
        if self.wrap_bits == 0 || self.wrap_bits > 40 {
            return Err(DesError::ConfigError("wrap_bits must be in 1..=40".into()));
        }
        Ok(())
    }
}

/// Deterministic given `(prefix, node_id, wrap_bits, clock)`. Not `Clone`:
/// the in-process counter is the thing that makes names collision-free
/// within a process, so a generator should have exactly one owner.
pub struct NameGenerator {
    config: NameGeneratorConfig,
    wrap_mask: u64,
    last_day: Option<chrono::NaiveDate>,
    counter: u8,
}

impl NameGenerator {
    pub fn new(config: NameGeneratorConfig) -> DesResult<Self> {
        config.validate()?;
        let wrap_mask = (1u64 << config.wrap_bits) - 1;
        Ok(Self {
            config,
            wrap_mask,
            last_day: None,
            counter: 0,
        })
    }

    /// Mint the next name for `now`. Resets the same-day counter on a day
    /// boundary crossing so the 2-hex suffix stays a true same-day counter.
    pub fn next(&mut self, now: DateTime<Utc>) -> DesResult<String> {
        let day = now.date_naive();
        if self.last_day != Some(day) {
            self.last_day = Some(day);
            self.counter = 0;
        }
        if self.counter == COUNTER_MAX {
            return Err(DesError::Transient(
                "name generator's same-day counter is exhausted (256 names/day/node limit)".into(),
            ));
        }
        let seq = self.counter;
        self.counter += 1;

        let epoch_ms = now.timestamp_millis().max(0) as u64;
        let packed = ((epoch_ms & self.wrap_mask) << 8) | self.config.node_id as u64;

        Ok(format!(
            "{}_{}_{:012x}_{:02x}",
            self.config.prefix,
            day.format("%Y%m%d"),
            packed & 0xFFFF_FFFF_FFFF,
            seq
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> NameGeneratorConfig {
        NameGeneratorConfig {
            prefix: "DES".into(),
            node_id: 7,
            wrap_bits: 32,
        }
    }

    #[test]
    fn shape_matches_prefix_date_hex_hex() {
        let mut gen = NameGenerator::new(config()).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let name = gen.next(now).unwrap();
        let parts: Vec<&str> = name.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "DES");
        assert_eq!(parts[1], "20240305");
        assert_eq!(parts[2].len(), 12);
        assert_eq!(parts[3], "00");
    }

    #[test]
    fn same_ms_produces_distinct_names_via_counter() {
        let mut gen = NameGenerator::new(config()).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let a = gen.next(now).unwrap();
        let b = gen.next(now).unwrap();
        assert_ne!(a, b);
        assert!(a.ends_with("_00"));
        assert!(b.ends_with("_01"));
    }

    #[test]
    fn counter_resets_on_day_boundary() {
        let mut gen = NameGenerator::new(config()).unwrap();
        let day1 = Utc.with_ymd_and_hms(2024, 3, 5, 23, 59, 59).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap();
        gen.next(day1).unwrap();
        let name = gen.next(day2).unwrap();
        assert!(name.ends_with("_00"));
    }

    #[test]
    fn rejects_bad_prefix() {
        let mut cfg = config();
        cfg.prefix = "bad prefix!".into();
        assert!(NameGenerator::new(cfg).is_err());
    }
}

//! Civil time to UTC
//!
//! Device clocks record naive local time in a named civil timezone. Around
//! daylight-saving transitions a naive time can occur twice (fall back) or not
//! at all (spring forward); [`CivilClock`] resolves both cases explicitly.

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::config::{AmbiguityPolicy, Config};
use crate::error::ConfigError;

/// How a local time was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Unique,
    /// Occurs twice; the policy picked one
    Ambiguous,
    /// Skipped by a spring-forward transition; read with the earlier offset
    Nonexistent,
}

#[derive(Debug, Clone, Copy)]
pub struct CivilClock {
    tz: Tz,
    policy: AmbiguityPolicy,
}

impl CivilClock {
    pub fn new(tz: Tz, policy: AmbiguityPolicy) -> Self {
        Self { tz, policy }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(config.tz()?, config.ambiguity))
    }

    /// Convert without logging.
    pub fn resolve(&self, local: NaiveDateTime) -> (DateTime<Utc>, Resolution) {
        match self.tz.from_local_datetime(&local) {
            LocalResult::Single(t) => (t.with_timezone(&Utc), Resolution::Unique),
            LocalResult::Ambiguous(earliest, latest) => {
                let t = match self.policy {
                    AmbiguityPolicy::Earliest => earliest,
                    AmbiguityPolicy::Latest => latest,
                };
                (t.with_timezone(&Utc), Resolution::Ambiguous)
            }
            LocalResult::None => {
                let shifted = (1..=3).find_map(|h| {
                    self.tz
                        .from_local_datetime(&(local - Duration::hours(h)))
                        .earliest()
                        .map(|t| t.with_timezone(&Utc) + Duration::hours(h))
                });
                let t = shifted.unwrap_or_else(|| Utc.from_utc_datetime(&local));
                (t, Resolution::Nonexistent)
            }
        }
    }

    /// Convert a local time to UTC, warning on ambiguous or skipped times.
    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        let (utc, resolution) = self.resolve(local);
        match resolution {
            Resolution::Unique => {}
            Resolution::Ambiguous => log::warn!(
                "Ambiguous local time {} in {}; resolved as {:?} to {}",
                local,
                self.tz,
                self.policy,
                utc
            ),
            Resolution::Nonexistent => log::warn!(
                "Nonexistent local time {} in {}; read with pre-transition offset as {}",
                local,
                self.tz,
                utc
            ),
        }
        utc
    }

    /// Whether `local` occurs twice in this timezone
    pub fn is_ambiguous(&self, local: NaiveDateTime) -> bool {
        matches!(
            self.tz.from_local_datetime(&local),
            LocalResult::Ambiguous(_, _)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_ambiguous_times;
    use chrono::NaiveDate;

    fn central(policy: AmbiguityPolicy) -> CivilClock {
        CivilClock::new(chrono_tz::US::Central, policy)
    }

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_unique_time() {
        let clock = central(AmbiguityPolicy::Latest);
        let (utc, res) = clock.resolve(local(2021, 7, 1, 12, 0));
        assert_eq!(res, Resolution::Unique);
        assert_eq!(utc, Utc.with_ymd_and_hms(2021, 7, 1, 17, 0, 0).unwrap());
    }

    #[test]
    fn test_default_ambiguous_times_are_ambiguous() {
        let clock = central(AmbiguityPolicy::Latest);
        for t in default_ambiguous_times() {
            assert!(clock.is_ambiguous(t), "{t} should be ambiguous");
        }
    }

    #[test]
    fn test_ambiguity_policies() {
        let t = local(2021, 11, 7, 1, 30);
        let (late, res) = central(AmbiguityPolicy::Latest).resolve(t);
        assert_eq!(res, Resolution::Ambiguous);
        // CST, UTC-6
        assert_eq!(late, Utc.with_ymd_and_hms(2021, 11, 7, 7, 30, 0).unwrap());
        let (early, _) = central(AmbiguityPolicy::Earliest).resolve(t);
        // CDT, UTC-5
        assert_eq!(early, Utc.with_ymd_and_hms(2021, 11, 7, 6, 30, 0).unwrap());
    }

    #[test]
    fn test_nonexistent_uses_pre_transition_offset() {
        let clock = central(AmbiguityPolicy::Latest);
        let (utc, res) = clock.resolve(local(2021, 3, 14, 2, 30));
        assert_eq!(res, Resolution::Nonexistent);
        assert_eq!(utc, Utc.with_ymd_and_hms(2021, 3, 14, 8, 30, 0).unwrap());
    }
}

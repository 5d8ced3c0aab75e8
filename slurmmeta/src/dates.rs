use chrono::{DateTime, Utc};
use std::time::SystemTime;

/// Source of the current time, so that cache expiry can be tested without sleeping.

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        now()
    }
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert a file time to a timestamp.

pub fn from_system_time(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

#[cfg(test)]
pub struct FixedClock(pub DateTime<Utc>);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[test]
fn test_from_system_time() {
    use chrono::TimeZone;
    let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
    assert_eq!(from_system_time(t), Utc.timestamp_opt(1_700_000_000, 0).unwrap());
}

// rds-pitr-restore/src/utils/clock.rs
use chrono::{DateTime, Utc};

/// Source of "now" for computing the restore point.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

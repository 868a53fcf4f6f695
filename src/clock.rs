use chrono::{DateTime, Utc};

/// Source of server-observed time.
///
/// Every expiry comparison in the delivery path reads from a `Clock` so a
/// viewer-supplied timestamp never takes part in an access decision.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

use std::time::Duration;

#[derive(Clone, PartialEq, Eq, Debug)]
/// Config values for [`ThrottleService`](crate::ThrottleService).
pub struct ThrottleConfig {
    /// How long a key must stay quiet before its pending task runs
    pub threshold: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(10),
        }
    }
}

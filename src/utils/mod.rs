/// Utility functions and helpers
use rand::Rng;
use std::fmt::Debug;
use std::io;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time.
///
/// Every time-based decision in the gateway (snapshot expiry, certificate
/// expiry, idle detection) reads the time through this trait so tests can
/// drive it explicitly.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> SystemTime;
}

/// Clock backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually advanced clock for tests and simulations
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<SystemTime>,
}

impl FakeClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: SystemTime) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Milliseconds since the unix epoch, saturating at zero for times before it
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Inverse of [`unix_millis`]
pub fn from_unix_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// Random duration in `[0, max)`, used to spread out periodic work
pub fn random_duration(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let nanos = rand::thread_rng().gen_range(0..max.as_nanos().min(u64::MAX as u128) as u64);
    Duration::from_nanos(nanos)
}

/// Whether an I/O error is an ordinary disconnect (peer went away, stream
/// closed underneath us) rather than a fault worth reporting.
pub fn is_ok_network_error(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected => true,
        _ => {
            let message = err.to_string();
            message.contains("close_notify") || message.contains("closed connection")
        }
    }
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h1m1s");
    }

    #[test]
    fn test_fake_clock_advances() {
        let start = UNIX_EPOCH + Duration::from_secs(1_000);
        let clock = FakeClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), start + Duration::from_secs(5));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_unix_millis_roundtrip() {
        let time = UNIX_EPOCH + Duration::from_millis(1_234_567);
        assert_eq!(unix_millis(time), 1_234_567);
        assert_eq!(from_unix_millis(1_234_567), time);
    }

    #[test]
    fn test_random_duration_bounds() {
        assert_eq!(random_duration(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(random_duration(Duration::from_secs(1)) < Duration::from_secs(1));
        }
    }

    #[test]
    fn test_ok_network_errors() {
        assert!(is_ok_network_error(&io::Error::new(io::ErrorKind::BrokenPipe, "pipe")));
        assert!(is_ok_network_error(&io::Error::new(
            io::ErrorKind::Other,
            "peer closed connection without sending TLS close_notify"
        )));
        assert!(!is_ok_network_error(&io::Error::new(io::ErrorKind::PermissionDenied, "perm")));
    }
}

//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` while the process serves requests.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Registered device channels.
    pub devices: usize,
    /// Subscribed observer channels.
    pub observers: usize,
}

/// Build a health response from live counts.
pub fn health_check(start_time: Instant, devices: usize, observers: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        devices,
        observers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        assert_eq!(health_check(Instant::now(), 0, 0).status, "ok");
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        assert!(health_check(start, 0, 0).uptime_secs >= 59);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(health_check(Instant::now(), 3, 2)).unwrap();
        assert_eq!(json["devices"], 3);
        assert_eq!(json["observers"], 2);
        assert!(json["uptimeSecs"].is_number());
    }
}

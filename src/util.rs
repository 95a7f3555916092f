use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

const MONITOR_API_PORT: &str = "MONITOR_API_PORT";

const DEFAULT_API_PORT: u16 = 8080;

pub fn get_default_api_port() -> u16 {
    DEFAULT_API_PORT
}

pub fn get_api_port() -> Option<u16> {
    std::env::var(MONITOR_API_PORT)
        .ok()
        .and_then(|port| port.parse().ok())
}

const MONITOR_API_ADDR: &str = "MONITOR_API_ADDR";

const DEFAULT_API_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0));

pub fn get_default_api_addr() -> IpAddr {
    DEFAULT_API_ADDR
}

pub fn get_api_addr() -> Option<IpAddr> {
    std::env::var(MONITOR_API_ADDR)
        .ok()
        .and_then(|addr| addr.parse().ok())
}

const ALERT_ENABLED: &str = "ALERT_ENABLED";

/// `ALERT_ENABLED=false` (or `0`) switches notifications off
pub fn get_alerts_enabled() -> Option<bool> {
    std::env::var(ALERT_ENABLED).ok().map(|value| parse_flag(&value))
}

const COLLECTION_INTERVAL_MINUTES: &str = "COLLECTION_INTERVAL_MINUTES";

pub fn get_collection_interval_minutes() -> Option<u64> {
    std::env::var(COLLECTION_INTERVAL_MINUTES)
        .ok()
        .and_then(|minutes| minutes.parse().ok())
        .filter(|minutes| *minutes > 0)
}

/// `base × 2^(attempt - 1)`, saturating instead of overflowing
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "false" | "0" | "no" | "off"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(" OFF "));
        assert!(!parse_flag("0"));
    }

    #[test]
    fn test_backoff_delay_doubles_and_saturates() {
        let base = Duration::from_millis(250);
        assert_eq!(backoff_delay(base, 1), base);
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 0), base);
        assert_eq!(backoff_delay(base, 40), backoff_delay(base, 33));
        assert_eq!(backoff_delay(Duration::MAX, 2), Duration::MAX);
    }
}

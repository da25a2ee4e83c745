//! Server Configuration
//!
//! Loads configuration from environment variables.

use anyhow::{bail, Context, Result};
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use vc_common::IceServer;

use crate::engine::WorkerSettings;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080")
    pub bind_address: String,

    /// IP media transports bind to
    pub rtc_listen_ip: IpAddr,

    /// Public address advertised in ICE candidates (optional)
    pub rtc_announced_address: Option<String>,

    /// Lowest media port (default: 40000)
    pub rtc_min_port: u16,

    /// Highest media port (default: 49999)
    pub rtc_max_port: u16,

    /// Budget for ICE checks plus the DTLS handshake in milliseconds (default: 8000)
    pub rtc_handshake_timeout_ms: u64,

    /// Number of media workers (default: available parallelism)
    pub media_workers: usize,

    /// WebRTC STUN server
    pub stun_server: String,

    /// WebRTC TURN server (optional)
    pub turn_server: Option<String>,

    /// WebRTC TURN username (optional)
    pub turn_username: Option<String>,

    /// WebRTC TURN credential (optional)
    pub turn_credential: Option<String>,

    /// Maximum peers per room (default: 25)
    pub max_peers_per_room: usize,

    /// Upper bound for one signaling request in milliseconds (default: 8000)
    pub signaling_request_timeout_ms: u64,

    /// Minimum interval between joins of one peer in milliseconds (default: 1000)
    pub join_rate_limit_ms: u64,

    /// Seconds a call may ring unanswered (default: 90)
    pub call_ring_timeout_secs: u64,

    /// Log output format (default: json)
    pub log_format: LogFormat,
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let rtc_listen_ip = match env::var("RTC_LISTEN_IP") {
            Ok(ip) => ip
                .parse()
                .with_context(|| format!("RTC_LISTEN_IP is not an IP address: {ip}"))?,
            Err(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let config = Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            rtc_listen_ip,
            rtc_announced_address: env::var("RTC_ANNOUNCED_ADDRESS")
                .ok()
                .filter(|s| !s.is_empty()),
            rtc_min_port: parse_or("RTC_MIN_PORT", 40000),
            rtc_max_port: parse_or("RTC_MAX_PORT", 49999),
            rtc_handshake_timeout_ms: parse_or("RTC_HANDSHAKE_TIMEOUT_MS", 8_000),
            media_workers: parse_or(
                "MEDIA_WORKERS",
                std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            ),
            stun_server: env::var("STUN_SERVER")
                .unwrap_or_else(|_| "stun:stun.l.google.com:19302".into()),
            turn_server: env::var("TURN_SERVER").ok(),
            turn_username: env::var("TURN_USERNAME").ok(),
            turn_credential: env::var("TURN_CREDENTIAL").ok(),
            max_peers_per_room: parse_or("MAX_PEERS_PER_ROOM", 25),
            signaling_request_timeout_ms: parse_or("SIGNALING_REQUEST_TIMEOUT_MS", 10_000),
            join_rate_limit_ms: parse_or("JOIN_RATE_LIMIT_MS", 1000),
            call_ring_timeout_secs: parse_or("CALL_RING_TIMEOUT_SECS", 90),
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("pretty") => LogFormat::Pretty,
                _ => LogFormat::Json,
            },
        };

        if config.rtc_min_port > config.rtc_max_port {
            bail!(
                "RTC_MIN_PORT ({}) must not exceed RTC_MAX_PORT ({})",
                config.rtc_min_port,
                config.rtc_max_port
            );
        }
        if config.media_workers == 0 {
            bail!("MEDIA_WORKERS must be at least 1");
        }
        // A handshake outliving its request would be acked as a bare timeout.
        if config.rtc_handshake_timeout_ms >= config.signaling_request_timeout_ms {
            bail!(
                "RTC_HANDSHAKE_TIMEOUT_MS ({}) must be below SIGNALING_REQUEST_TIMEOUT_MS ({})",
                config.rtc_handshake_timeout_ms,
                config.signaling_request_timeout_ms
            );
        }
        Ok(config)
    }

    /// Check if TURN is configured.
    #[must_use]
    pub const fn has_turn(&self) -> bool {
        self.turn_server.is_some()
    }

    /// STUN and TURN servers handed to clients.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers = vec![IceServer {
            urls: vec![self.stun_server.clone()],
            username: None,
            credential: None,
        }];

        // Add TURN server if configured
        if let Some(turn) = &self.turn_server {
            servers.push(IceServer {
                urls: vec![turn.clone()],
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            });
        }
        servers
    }

    /// Network settings for the media worker pool. Transports bind on the
    /// host interfaces.
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            listen_ip: self.rtc_listen_ip,
            announced_address: self.rtc_announced_address.clone(),
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
            handshake_timeout: Duration::from_millis(self.rtc_handshake_timeout_ms),
            network: None,
        }
    }

    pub const fn signaling_request_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_request_timeout_ms)
    }

    pub const fn join_rate_limit(&self) -> Duration {
        Duration::from_millis(self.join_rate_limit_ms)
    }

    pub const fn call_ring_timeout(&self) -> Duration {
        Duration::from_secs(self.call_ring_timeout_secs)
    }

    /// Create a default configuration for testing.
    ///
    /// Listens on loopback for signaling, gathers media candidates on every
    /// interface of whatever network the workers are given, uses a narrow
    /// port range and two workers, and disables join rate limiting.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            bind_address: "127.0.0.1:0".into(),
            rtc_listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rtc_announced_address: None,
            rtc_min_port: 41000,
            rtc_max_port: 41999,
            rtc_handshake_timeout_ms: 4000,
            media_workers: 2,
            stun_server: "stun:stun.l.google.com:19302".into(),
            turn_server: None,
            turn_username: None,
            turn_credential: None,
            max_peers_per_room: 25,
            signaling_request_timeout_ms: 5000,
            join_rate_limit_ms: 0,
            call_ring_timeout_secs: 90,
            log_format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "BIND_ADDRESS",
        "RTC_LISTEN_IP",
        "RTC_ANNOUNCED_ADDRESS",
        "RTC_MIN_PORT",
        "RTC_MAX_PORT",
        "RTC_HANDSHAKE_TIMEOUT_MS",
        "MEDIA_WORKERS",
        "STUN_SERVER",
        "TURN_SERVER",
        "TURN_USERNAME",
        "TURN_CREDENTIAL",
        "MAX_PEERS_PER_ROOM",
        "SIGNALING_REQUEST_TIMEOUT_MS",
        "JOIN_RATE_LIMIT_MS",
        "CALL_RING_TIMEOUT_SECS",
        "LOG_FORMAT",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.rtc_listen_ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.rtc_min_port, 40000);
        assert_eq!(config.rtc_max_port, 49999);
        assert_eq!(
            config.worker_settings().handshake_timeout,
            Duration::from_secs(8)
        );
        assert!(config.worker_settings().network.is_none());
        assert_eq!(config.max_peers_per_room, 25);
        assert_eq!(config.signaling_request_timeout(), Duration::from_secs(10));
        assert_eq!(config.call_ring_timeout(), Duration::from_secs(90));
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.media_workers >= 1);
        assert!(!config.has_turn());
    }

    #[test]
    #[serial]
    fn test_turn_servers_are_injected() {
        clear_env();
        env::set_var("TURN_SERVER", "turn:turn.example.com:3478");
        env::set_var("TURN_USERNAME", "relay");
        env::set_var("TURN_CREDENTIAL", "s3cret");
        let config = Config::from_env().unwrap();
        clear_env();

        let servers = config.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].urls, vec!["turn:turn.example.com:3478"]);
        assert_eq!(servers[1].username.as_deref(), Some("relay"));
        assert_eq!(servers[1].credential.as_deref(), Some("s3cret"));
    }

    #[test]
    #[serial]
    fn test_invalid_listen_ip_is_rejected() {
        clear_env();
        env::set_var("RTC_LISTEN_IP", "not-an-ip");
        let result = Config::from_env();
        clear_env();
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_inverted_port_range_is_rejected() {
        clear_env();
        env::set_var("RTC_MIN_PORT", "50000");
        env::set_var("RTC_MAX_PORT", "40000");
        let result = Config::from_env();
        clear_env();
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_handshake_must_fit_in_request_timeout() {
        clear_env();
        env::set_var("RTC_HANDSHAKE_TIMEOUT_MS", "10000");
        assert!(Config::from_env().is_err());
        env::set_var("SIGNALING_REQUEST_TIMEOUT_MS", "15000");
        assert!(Config::from_env().is_ok());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_announced_address_flows_into_worker_settings() {
        clear_env();
        env::set_var("RTC_ANNOUNCED_ADDRESS", "198.51.100.4");
        env::set_var("LOG_FORMAT", "pretty");
        let config = Config::from_env().unwrap();
        clear_env();

        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(
            config.worker_settings().announced_address.as_deref(),
            Some("198.51.100.4")
        );
    }
}

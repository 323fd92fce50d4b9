//! Configuration for transports and the dev server
//!
//! Server options are layered: built-in defaults, then `DEV_*` environment
//! variables, then command-line flags. Each layer only overrides the values it
//! actually sets.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Generation-marker file name inside a watched output directory
pub const LOCK_FILE: &str = "lock.json";

/// Extension every manifest asset carries
pub const MANIFEST_EXT: &str = "json";

/// WebSocket subprotocol shared by the server and the client transport
pub const HMR_SUBPROTOCOL: &str = "hmr";

/// Client-side transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Fixed delay before retrying after a network failure or socket close
    pub retry_delay: Duration,
    /// Ping cadence for the WebSocket keepalive; one missed pong is fatal
    pub keepalive_interval: Duration,
    /// Subprotocol requested on WebSocket connections
    pub subprotocol: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(1500),
            keepalive_interval: Duration::from_secs(5),
            subprotocol: HMR_SUBPROTOCOL.to_string(),
        }
    }
}

/// Dev server settings
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    /// Build output directory served by the router
    pub root: PathBuf,
    /// URL prefix the router is mounted under, always `/…/`
    pub url: String,
    /// Upper bound a long-poll request blocks waiting for a new token
    pub poll_timeout: Duration,
    /// Upper bound a GET/HEAD waits on the output-write lock
    pub static_wait: Duration,
    /// Directory (relative to `root`) holding the generation marker
    pub lock_dir: String,
    /// Ping cadence on pushed WebSocket connections
    pub keepalive: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4080,
            root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            url: "/".to_string(),
            poll_timeout: Duration::from_secs(25),
            static_wait: Duration::from_secs(25),
            lock_dir: "assets".to_string(),
            keepalive: Duration::from_secs(25),
        }
    }
}

/// A partial set of server options from one configuration layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub root: Option<PathBuf>,
    pub url: Option<String>,
}

impl ServerOverrides {
    /// Collect `<prefix>host|port|root|url` pairs, matching keys case-insensitively.
    ///
    /// Empty values and out-of-range ports are ignored rather than rejected.
    pub fn from_pairs<I, K, V>(prefix: &str, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let prefix = prefix.to_lowercase();
        let mut result = Self::default();
        for (key, value) in pairs {
            let key = key.as_ref().to_lowercase();
            let value = value.as_ref();
            if value.is_empty() {
                continue;
            }

            let Some(suffix) = key.strip_prefix(&prefix) else {
                continue;
            };

            match suffix {
                "host" => result.host = Some(value.to_string()),
                "port" => result.port = parse_port(value),
                "root" => result.root = Some(PathBuf::from(value)),
                "url" => result.url = Some(normalize_prefix(value)),
                _ => {}
            }
        }

        result
    }

    /// Read the `DEV_*` variables from the process environment
    // not clap `env`: keys match case-insensitively, which clap cannot do
    pub fn from_env() -> Self {
        Self::from_pairs("dev_", std::env::vars())
    }
}

impl ServerOptions {
    /// Apply one layer on top of the current options
    pub fn apply(&mut self, overrides: ServerOverrides) {
        if let Some(host) = overrides.host {
            self.host = host;
        }

        if let Some(port) = overrides.port {
            self.port = port;
        }

        if let Some(root) = overrides.root {
            self.root = absolutize(&root);
        }

        if let Some(url) = overrides.url {
            self.url = url;
        }
    }

    /// Defaults, then environment, then the given command-line layer
    pub fn layered(cli: ServerOverrides) -> Self {
        let mut options = Self::default();
        options.apply(ServerOverrides::from_env());
        options.apply(cli);
        options
    }

    /// Absolute path of the directory holding the generation marker
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(&self.lock_dir)
    }

    /// `host:port` for binding
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_port(value: &str) -> Option<u16> {
    value.parse::<u16>().ok().filter(|port| *port > 0 && *port < u16::MAX)
}

/// Turn `a//b` or `a/b/` into `/a/b/`
pub fn normalize_prefix(value: &str) -> String {
    let segments: Vec<&str> = value.split(['/', '\\']).filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return "/".to_string();
    }

    format!("/{}/", segments.join("/"))
}

/// Resolve a path against the current directory without touching the filesystem
pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.retry_delay, Duration::from_millis(1500));
        assert_eq!(config.keepalive_interval, Duration::from_secs(5));
        assert_eq!(config.subprotocol, "hmr");
    }

    #[test]
    fn test_overrides_from_pairs() {
        let pairs = [
            ("DEV_PORT", "5000"),
            ("Dev_Host", "0.0.0.0"),
            ("DEV_URL", "app//static"),
            ("OTHER_PORT", "1"),
            ("DEV_ROOT", ""),
        ];
        let overrides = ServerOverrides::from_pairs("dev_", pairs);
        assert_eq!(overrides.port, Some(5000));
        assert_eq!(overrides.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(overrides.url.as_deref(), Some("/app/static/"));
        assert_eq!(overrides.root, None);
    }

    #[test]
    fn test_invalid_port_ignored() {
        let overrides = ServerOverrides::from_pairs("dev_", [("dev_port", "65535")]);
        assert_eq!(overrides.port, None);

        let overrides = ServerOverrides::from_pairs("dev_", [("dev_port", "zero")]);
        assert_eq!(overrides.port, None);
    }

    #[test]
    fn test_later_layer_wins() {
        let mut options = ServerOptions::default();
        options.apply(ServerOverrides {
            port: Some(9000),
            ..Default::default()
        });
        options.apply(ServerOverrides {
            host: Some("127.0.0.1".to_string()),
            ..Default::default()
        });
        assert_eq!(options.bind_address(), "127.0.0.1:9000");
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(""), "/");
        assert_eq!(normalize_prefix("/"), "/");
        assert_eq!(normalize_prefix("dist"), "/dist/");
        assert_eq!(normalize_prefix("\\a\\\\b/"), "/a/b/");
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use gopher_core::{EmptyLine, ListingPolicy, TransportConfig, DEFAULT_MAX_PAYLOAD, DEFAULT_PORT};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub transport: TransportSection,
    pub client: ClientSection,
    pub server: ServerSection,
    pub proxy: ProxySection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub default_port: u16,
    pub connect_timeout_secs: Option<u64>,
    pub io_timeout_secs: Option<u64>,
}

impl Default for TransportSection {
    fn default() -> Self {
        TransportSection {
            default_port: DEFAULT_PORT,
            connect_timeout_secs: None,
            io_timeout_secs: None,
        }
    }
}

impl TransportSection {
    pub fn to_config(&self) -> TransportConfig {
        TransportConfig {
            default_port: self.default_port,
            connect_timeout: self.connect_timeout_secs.map(Duration::from_secs),
            io_timeout: self.io_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ClientSection {
    pub empty_line: EmptyLine,
}

impl ClientSection {
    pub fn policy(&self) -> ListingPolicy {
        ListingPolicy {
            empty_line: self.empty_line,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listener: String,
    pub root: PathBuf,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            listener: "0.0.0.0:70".to_string(),
            root: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub listener: String,
    /// Page title for rendered listings
    pub title: String,
    /// Documents larger than this are refused with 502
    pub max_payload_bytes: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        ProxySection {
            listener: "127.0.0.1:8080".to_string(),
            title: "Gopher".to_string(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config, anyhow::Error> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.transport.to_config(), TransportConfig::default());
        assert_eq!(config.client.policy(), ListingPolicy::default());
        assert_eq!(config.server.listener, "0.0.0.0:70");
        assert_eq!(config.proxy.listener, "127.0.0.1:8080");
        assert_eq!(config.proxy.max_payload_bytes, DEFAULT_MAX_PAYLOAD);
    }

    #[test]
    fn loads_every_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[transport]
connect_timeout_secs = 5
io_timeout_secs = 30

[client]
empty_line = "skip"

[server]
listener = "127.0.0.1:7070"
root = "/srv/gopher"

[proxy]
listener = "0.0.0.0:8081"
title = "My hole"
max_payload_bytes = 1048576
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        let transport = config.transport.to_config();
        assert_eq!(transport.default_port, 70);
        assert_eq!(transport.connect_timeout, Some(Duration::from_secs(5)));
        assert_eq!(transport.io_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.client.empty_line, EmptyLine::Skip);
        assert_eq!(config.server.root, PathBuf::from("/srv/gopher"));
        assert_eq!(config.proxy.title, "My hole");
        assert_eq!(config.proxy.max_payload_bytes, 1024 * 1024);
    }

    #[test]
    fn rejects_unknown_empty_line_policy() {
        assert!(toml::from_str::<Config>("[client]\nempty_line = \"maybe\"").is_err());
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

use crate::core::types::Version;
use crate::error::{ProtocolError, Result};
use crate::lobby::DropMode;
use crate::utils::timeout;

/// Receive-buffer size of every studied client; re-exported here so the
/// configuration surface has one home for protocol constants.
pub const MAX_FRAME_SIZE: usize = crate::core::packet::MAX_FRAME_SIZE;

/// Server-init command numbers for the two handshake shapes.
pub const SERVER_INIT_CONSOLE: u16 = 0x02;
pub const SERVER_INIT_V4: u16 = 0x03;

/// Copyright text carried in the server-init command; clients check it.
pub const SERVER_INIT_COPYRIGHT: &str = "Gateway lobby server. Copyright on connection protocol.";

/// Cheat-mode policy: whether sessions may toggle cheats and what the
/// default is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheatModePolicy {
    Off,
    #[default]
    OffByDefault,
    OnByDefault,
    On,
}

impl CheatModePolicy {
    pub fn default_enabled(self) -> bool {
        matches!(self, CheatModePolicy::OnByDefault | CheatModePolicy::On)
    }

    pub fn can_toggle(self) -> bool {
        matches!(self, CheatModePolicy::OffByDefault | CheatModePolicy::OnByDefault)
    }
}

/// How pre-v1 prototype clients are admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrototypeAdmission {
    Reject,
    TemporaryLicense,
    #[default]
    Permanent,
}

/// Game modes that carry distinct drop-mode defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GameMode {
    Normal,
    Battle,
    Challenge,
}

/// Version families used for per-family configuration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionFamily {
    V1V2,
    V3,
    V4,
}

impl VersionFamily {
    pub fn of(version: Version) -> VersionFamily {
        use crate::core::types::Generation;
        match version.generation() {
            Generation::PreV1 | Generation::V1 | Generation::V2 => VersionFamily::V1V2,
            Generation::V3 => VersionFamily::V3,
            Generation::V4 => VersionFamily::V4,
        }
    }
}

fn drop_mode_bit(mode: DropMode) -> u8 {
    match mode {
        DropMode::Disabled => 1 << 0,
        DropMode::Client => 1 << 1,
        DropMode::ServerShared => 1 << 2,
        DropMode::ServerDuplicate => 1 << 3,
        DropMode::ServerPrivate => 1 << 4,
    }
}

/// Default drop mode plus the set of modes a lobby leader may switch to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DropModeConfig {
    pub default: DropModeName,
    pub allowed_mask: u8,
}

/// Serializable names for [`DropMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropModeName {
    Disabled,
    Client,
    ServerShared,
    ServerDuplicate,
    ServerPrivate,
}

impl From<DropModeName> for DropMode {
    fn from(name: DropModeName) -> DropMode {
        match name {
            DropModeName::Disabled => DropMode::Disabled,
            DropModeName::Client => DropMode::Client,
            DropModeName::ServerShared => DropMode::ServerShared,
            DropModeName::ServerDuplicate => DropMode::ServerDuplicate,
            DropModeName::ServerPrivate => DropMode::ServerPrivate,
        }
    }
}

impl Default for DropModeConfig {
    fn default() -> Self {
        DropModeConfig {
            default: DropModeName::Client,
            allowed_mask: 0x1F,
        }
    }
}

impl DropModeConfig {
    pub fn allows(&self, mode: DropMode) -> bool {
        self.allowed_mask & drop_mode_bit(mode) != 0
    }
}

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub rules: RulesConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("CROSSPLAY_GATEWAY_ADDRESS") {
            config.server.address = addr;
        }
        if let Ok(name) = std::env::var("CROSSPLAY_GATEWAY_NAME") {
            config.server.name = name;
        }
        if let Ok(timeout) = std::env::var("CROSSPLAY_GATEWAY_IDLE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.server.idle_timeout = Duration::from_millis(val);
            }
        }
        if let Ok(interval) = std::env::var("CROSSPLAY_GATEWAY_PING_INTERVAL_MS") {
            if let Ok(val) = interval.parse::<u64>() {
                config.server.ping_interval = Duration::from_millis(val);
            }
        }
        Ok(config)
    }

    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Resolved default drop mode for a lobby of the given family/mode.
    pub fn default_drop_mode(&self, family: VersionFamily, mode: GameMode) -> DropMode {
        self.rules
            .drop_modes
            .get(&(family, mode))
            .map(|c| c.default.into())
            .unwrap_or(DropMode::Client)
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the game server (e.g., "127.0.0.1:5100")
    pub address: String,

    /// Human-visible server name used in info messages
    pub name: String,

    /// Login port clients are redirected to when a proxy upstream is lost
    pub login_port: u16,

    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,

    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Maximum number of concurrent sessions
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:5100"),
            name: String::from("crossplay-gateway"),
            login_port: 5100,
            ping_interval: timeout::PING_INTERVAL,
            idle_timeout: timeout::IDLE_TIMEOUT,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            max_sessions: 1000,
        }
    }
}

/// Proxy upstream destination for one client version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyUpstream {
    pub host: String,
    pub port: u16,
}

/// Proxy-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    /// Per-version upstream (host, port); versions without an entry rely
    /// on the destination captured from the client's config.
    pub upstreams: HashMap<String, ProxyUpstream>,

    /// Override byte for the client-visible lobby-event hint; 0xFF leaves
    /// the upstream's value untouched.
    pub override_lobby_event: Option<u8>,

    /// Substitute the upstream-provided identity for the client's
    /// canonical one throughout both streams.
    pub remote_guild_card_substitution: bool,
}

impl ProxyConfig {
    pub fn upstream_for(&self, version: Version) -> Option<&ProxyUpstream> {
        self.upstreams.get(version.name())
    }
}

/// Game-rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    pub cheat_mode: CheatModePolicy,

    pub prototype_admission: PrototypeAdmission,

    /// Default drop mode and allow-mask per (version family, game mode).
    #[serde(skip, default = "default_drop_modes")]
    pub drop_modes: HashMap<(VersionFamily, GameMode), DropModeConfig>,

    /// Minimum character level per (episode, difficulty).
    #[serde(skip, default = "default_min_levels")]
    pub min_level: HashMap<(u8, u8), u32>,
}

fn default_drop_modes() -> HashMap<(VersionFamily, GameMode), DropModeConfig> {
    let mut drop_modes = HashMap::new();
    for family in [VersionFamily::V1V2, VersionFamily::V3, VersionFamily::V4] {
        for mode in [GameMode::Normal, GameMode::Battle, GameMode::Challenge] {
            let mut config = DropModeConfig::default();
            // The final version is server-authoritative; its clients
            // never generate drops themselves.
            if family == VersionFamily::V4 {
                config.default = DropModeName::ServerShared;
                config.allowed_mask &= !drop_mode_bit(DropMode::Client);
            }
            drop_modes.insert((family, mode), config);
        }
    }
    drop_modes
}

fn default_min_levels() -> HashMap<(u8, u8), u32> {
    let mut min_level = HashMap::new();
    for episode in 1..=4u8 {
        min_level.insert((episode, 0), 1);
        min_level.insert((episode, 1), 20);
        min_level.insert((episode, 2), 40);
        min_level.insert((episode, 3), 80);
    }
    min_level
}

impl Default for RulesConfig {
    fn default() -> Self {
        RulesConfig {
            cheat_mode: CheatModePolicy::default(),
            prototype_admission: PrototypeAdmission::default(),
            drop_modes: default_drop_modes(),
            min_level: default_min_levels(),
        }
    }
}

impl RulesConfig {
    pub fn min_level_for(&self, episode: u8, difficulty: u8) -> u32 {
        self.min_level.get(&(episode, difficulty)).copied().unwrap_or(1)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub app_name: String,

    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    pub log_to_console: bool,

    pub log_to_file: bool,

    pub log_file_path: Option<String>,

    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("crossplay-gateway"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.ping_interval, timeout::PING_INTERVAL);
        assert_eq!(config.server.idle_timeout, timeout::IDLE_TIMEOUT);
        assert_eq!(
            config.default_drop_mode(VersionFamily::V4, GameMode::Normal),
            DropMode::ServerShared
        );
        assert_eq!(
            config.default_drop_mode(VersionFamily::V1V2, GameMode::Battle),
            DropMode::Client
        );
    }

    #[test]
    fn v4_never_allows_client_drops() {
        let config = GatewayConfig::default();
        let entry = config.rules.drop_modes[&(VersionFamily::V4, GameMode::Normal)];
        assert!(!entry.allows(DropMode::Client));
        assert!(entry.allows(DropMode::ServerShared));
    }

    #[test]
    fn toml_round_trip_covers_the_surface() {
        let toml_text = r#"
            [server]
            address = "0.0.0.0:5111"
            name = "test-gateway"
            login_port = 5100
            ping_interval = 15000
            idle_timeout = 45000
            handshake_timeout = 5000
            max_sessions = 64

            [proxy]
            override_lobby_event = 9
            remote_guild_card_substitution = true

            [proxy.upstreams.v4]
            host = "198.51.100.7"
            port = 12000

            [rules]
            cheat_mode = "on-by-default"
            prototype_admission = "temporary-license"

            [logging]
            app_name = "test-gateway"
            log_level = "debug"
            log_to_console = true
            log_to_file = false
            json_format = false
        "#;
        let config = GatewayConfig::from_toml(toml_text).unwrap();
        assert_eq!(config.server.address, "0.0.0.0:5111");
        assert_eq!(config.server.ping_interval, Duration::from_millis(15000));
        assert_eq!(config.proxy.override_lobby_event, Some(9));
        let upstream = config.proxy.upstream_for(Version::V4).unwrap();
        assert_eq!(upstream.port, 12000);
        assert!(config.rules.cheat_mode.default_enabled());
        assert!(config.rules.cheat_mode.can_toggle());
        assert_eq!(
            config.rules.prototype_admission,
            PrototypeAdmission::TemporaryLicense
        );
        assert_eq!(config.logging.log_level, Level::DEBUG);
    }

    #[test]
    fn min_level_table_defaults() {
        let rules = RulesConfig::default();
        assert_eq!(rules.min_level_for(1, 3), 80);
        assert_eq!(rules.min_level_for(2, 0), 1);
        // Unknown pairs fall back to level 1.
        assert_eq!(rules.min_level_for(9, 9), 1);
    }
}

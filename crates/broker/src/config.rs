//! Broker configuration
//!
//! Loads the JSON config file describing downstream MCP servers, expands
//! tildes in paths, and validates every server definition before anything is
//! spawned. Validation is deliberately strict: downstream commands run with
//! the broker's OS permissions, so only a small interpreter whitelist and a
//! few absolute prefixes are accepted, and arguments carrying shell
//! metacharacters are rejected outright.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Interpreter names that may be used as a downstream command.
const ALLOWED_COMMANDS: &[&str] = &["uvx", "uv", "python", "python3", "node", "npx", "deno", "bun"];

/// Absolute path prefixes under which arbitrary executables are accepted.
const ALLOWED_PATH_PREFIXES: &[&str] = &["/usr/bin", "/usr/local/bin", "/opt/homebrew/bin"];

/// Characters that would be dangerous if an argument ever reached a shell.
const SHELL_METACHARACTERS: &[char] = &['&', '|', ';', '`', '$', '(', ')', '<', '>'];

/// Limits on per-server argument and environment list sizes.
const MAX_ARGS: usize = 50;
const MAX_ENV_VARS: usize = 20;

/// One validated downstream server definition. Immutable after load.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub server_type: String,
    pub tags: BTreeSet<String>,
}

/// Top-level broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub servers: Vec<ServerConfig>,
    pub socket_path: Option<PathBuf>,
    pub require_auth: bool,
    pub jwt_public_key_path: Option<PathBuf>,
}

// Raw serde mirror of the config file. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    mcp_servers: BTreeMap<String, RawServer>,
    #[serde(default)]
    socket_path: Option<String>,
    #[serde(default)]
    require_auth: bool,
    #[serde(default)]
    jwt_public_key_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default = "default_server_type", rename = "type")]
    server_type: String,
    #[serde(default)]
    tags: Vec<String>,
}

fn default_server_type() -> String {
    "stdio".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Invalid command for server '{server}': {reason}")]
    InvalidCommand { server: String, reason: String },

    #[error("Invalid args for server '{server}': {reason}")]
    InvalidArgs { server: String, reason: String },

    #[error("Invalid env for server '{server}': {reason}")]
    InvalidEnv { server: String, reason: String },
}

impl BrokerConfig {
    /// Load the config from the discovered path (see [`discover_path`]).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&discover_path())
    }

    /// Load and validate the config from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.to_path_buf()))?;
        Self::parse(&contents)
    }

    /// Parse and validate config file contents.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(contents)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut servers = Vec::with_capacity(raw.mcp_servers.len());
        for (name, raw_server) in raw.mcp_servers {
            servers.push(ServerConfig::from_raw(name, raw_server)?);
        }

        Ok(Self {
            servers,
            socket_path: raw.socket_path.map(|p| expand_tilde(&p)),
            require_auth: raw.require_auth,
            jwt_public_key_path: raw.jwt_public_key_path.map(|p| expand_tilde(&p)),
        })
    }

    /// Rendezvous socket path, falling back to the runtime dir.
    pub fn socket_path_or_default(&self) -> PathBuf {
        if let Some(path) = &self.socket_path {
            return path.clone();
        }
        default_socket_path()
    }

    /// Public key path for the JWT verifier, falling back to the config dir.
    pub fn jwt_public_key_path_or_default(&self) -> PathBuf {
        if let Some(path) = &self.jwt_public_key_path {
            return path.clone();
        }
        default_config_dir().join("jwt_public.pem")
    }
}

impl ServerConfig {
    fn from_raw(name: String, raw: RawServer) -> Result<Self, ConfigError> {
        if raw.server_type != "stdio" {
            return Err(ConfigError::Invalid(format!(
                "server '{}': unsupported type '{}'",
                name, raw.server_type
            )));
        }

        let command = expand_tilde(&raw.command)
            .to_string_lossy()
            .into_owned();
        validate_command(&name, &command)?;

        if raw.args.len() > MAX_ARGS {
            return Err(ConfigError::InvalidArgs {
                server: name,
                reason: format!("{} args exceeds the limit of {}", raw.args.len(), MAX_ARGS),
            });
        }
        let mut args = Vec::with_capacity(raw.args.len());
        for arg in &raw.args {
            validate_arg(&name, arg)?;
            args.push(expand_tilde(arg).to_string_lossy().into_owned());
        }

        if raw.env.len() > MAX_ENV_VARS {
            return Err(ConfigError::InvalidEnv {
                server: name,
                reason: format!(
                    "{} env vars exceeds the limit of {}",
                    raw.env.len(),
                    MAX_ENV_VARS
                ),
            });
        }
        for key in raw.env.keys() {
            if !is_valid_env_name(key) {
                return Err(ConfigError::InvalidEnv {
                    server: name,
                    reason: format!("invalid env var name '{}'", key),
                });
            }
        }

        Ok(Self {
            name,
            command,
            args,
            env: raw.env.into_iter().collect(),
            server_type: raw.server_type,
            tags: raw.tags.into_iter().collect(),
        })
    }
}

fn validate_command(server: &str, command: &str) -> Result<(), ConfigError> {
    if ALLOWED_COMMANDS.contains(&command) {
        return Ok(());
    }

    if command.starts_with('/') {
        let under_allowed_prefix = ALLOWED_PATH_PREFIXES
            .iter()
            .any(|prefix| Path::new(command).starts_with(prefix));
        if under_allowed_prefix && !command.contains("..") {
            return Ok(());
        }
        return Err(ConfigError::InvalidCommand {
            server: server.to_string(),
            reason: format!("'{}' is not under an allowed prefix", command),
        });
    }

    Err(ConfigError::InvalidCommand {
        server: server.to_string(),
        reason: format!("'{}' is not a whitelisted interpreter", command),
    })
}

fn validate_arg(server: &str, arg: &str) -> Result<(), ConfigError> {
    if let Some(bad) = arg.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(ConfigError::InvalidArgs {
            server: server.to_string(),
            reason: format!("argument '{}' contains shell metacharacter '{}'", arg, bad),
        });
    }
    Ok(())
}

/// Env var names must match `^[A-Z_][A-Z0-9_]*$`.
fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Config file discovery order: `$MCP_CONFIG_PATH`, then
/// `$XDG_CONFIG_HOME/mcp_broker/config.json`, then
/// `~/.config/mcp_broker/config.json`, then `./config.json`.
pub fn discover_path() -> PathBuf {
    if let Ok(path) = env::var("MCP_CONFIG_PATH") {
        return expand_tilde(&path);
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("mcp_broker/config.json");
        if candidate.exists() {
            return candidate;
        }
    }

    if let Some(home) = dirs::home_dir() {
        let candidate = home.join(".config/mcp_broker/config.json");
        if candidate.exists() {
            return candidate;
        }
    }

    PathBuf::from("config.json")
}

/// Directory holding broker key material and the default config file.
pub fn default_config_dir() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("mcp_broker");
    }
    dirs::home_dir()
        .map(|home| home.join(".config/mcp_broker"))
        .unwrap_or_else(|| PathBuf::from(".config/mcp_broker"))
}

/// Default rendezvous socket path.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime) = env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime).join("mcp_broker.sock");
    }
    PathBuf::from("/tmp/mcp_broker.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = BrokerConfig::parse(
            r#"{
                "mcpServers": {
                    "calendar": {
                        "command": "uvx",
                        "args": ["calendar-mcp"],
                        "tags": ["calendars", "private"]
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.servers.len(), 1);
        let server = &config.servers[0];
        assert_eq!(server.name, "calendar");
        assert_eq!(server.command, "uvx");
        assert_eq!(server.server_type, "stdio");
        assert!(server.tags.contains("private"));
        assert!(!config.require_auth);
    }

    #[test]
    fn test_parse_ignores_unknown_fields() {
        let config = BrokerConfig::parse(
            r#"{
                "mcpServers": {
                    "a": {"command": "npx", "futureField": true}
                },
                "somethingElse": 1
            }"#,
        )
        .unwrap();
        assert_eq!(config.servers.len(), 1);
    }

    #[test]
    fn test_defaults_applied() {
        let config =
            BrokerConfig::parse(r#"{"mcpServers": {"a": {"command": "node"}}}"#).unwrap();
        let server = &config.servers[0];
        assert!(server.args.is_empty());
        assert!(server.env.is_empty());
        assert!(server.tags.is_empty());
        assert_eq!(server.server_type, "stdio");
    }

    #[test]
    fn test_rejects_non_whitelisted_command() {
        let err = BrokerConfig::parse(r#"{"mcpServers": {"a": {"command": "bash"}}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCommand { .. }));
    }

    #[test]
    fn test_accepts_absolute_path_under_allowed_prefix() {
        let config =
            BrokerConfig::parse(r#"{"mcpServers": {"a": {"command": "/usr/bin/somecli"}}}"#)
                .unwrap();
        assert_eq!(config.servers[0].command, "/usr/bin/somecli");
    }

    #[test]
    fn test_rejects_absolute_path_outside_allowed_prefixes() {
        let err = BrokerConfig::parse(r#"{"mcpServers": {"a": {"command": "/etc/evil"}}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCommand { .. }));
    }

    #[test]
    fn test_rejects_path_traversal_in_command() {
        let err = BrokerConfig::parse(
            r#"{"mcpServers": {"a": {"command": "/usr/bin/../../etc/evil"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCommand { .. }));
    }

    #[test]
    fn test_rejects_shell_metacharacters_in_args() {
        for bad in ["a;b", "a|b", "$(x)", "`x`", "a&b", "a<b", "a>b"] {
            let contents = format!(
                r#"{{"mcpServers": {{"a": {{"command": "npx", "args": [{}]}}}}}}"#,
                serde_json::to_string(bad).unwrap()
            );
            let err = BrokerConfig::parse(&contents).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidArgs { .. }),
                "expected rejection for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_rejects_invalid_env_names() {
        for bad in ["lower_case", "1STARTS_WITH_DIGIT", "HAS-DASH", ""] {
            let contents = format!(
                r#"{{"mcpServers": {{"a": {{"command": "npx", "env": {{{}: "v"}}}}}}}}"#,
                serde_json::to_string(bad).unwrap()
            );
            let err = BrokerConfig::parse(&contents).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidEnv { .. }),
                "expected rejection for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_accepts_valid_env_names() {
        let config = BrokerConfig::parse(
            r#"{"mcpServers": {"a": {"command": "npx", "env": {"API_KEY": "k", "_X9": "y"}}}}"#,
        )
        .unwrap();
        assert_eq!(config.servers[0].env.len(), 2);
    }

    #[test]
    fn test_rejects_too_many_args() {
        let args: Vec<String> = (0..51).map(|i| format!("a{}", i)).collect();
        let contents = format!(
            r#"{{"mcpServers": {{"a": {{"command": "npx", "args": {}}}}}}}"#,
            serde_json::to_string(&args).unwrap()
        );
        let err = BrokerConfig::parse(&contents).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidArgs { .. }));
    }

    #[test]
    fn test_rejects_too_many_env_vars() {
        let env: BTreeMap<String, String> =
            (0..21).map(|i| (format!("VAR_{}", i), "v".to_string())).collect();
        let contents = format!(
            r#"{{"mcpServers": {{"a": {{"command": "npx", "env": {}}}}}}}"#,
            serde_json::to_string(&env).unwrap()
        );
        let err = BrokerConfig::parse(&contents).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_rejects_non_stdio_type() {
        let err =
            BrokerConfig::parse(r#"{"mcpServers": {"a": {"command": "npx", "type": "http"}}}"#)
                .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_tilde_expansion_in_args() {
        if dirs::home_dir().is_none() {
            return;
        }
        let config = BrokerConfig::parse(
            r#"{"mcpServers": {"a": {"command": "python3", "args": ["~/tool.py"]}}}"#,
        )
        .unwrap();
        assert!(!config.servers[0].args[0].starts_with('~'));
    }

    #[test]
    fn test_top_level_settings() {
        let config = BrokerConfig::parse(
            r#"{
                "mcpServers": {},
                "socketPath": "/tmp/test-broker.sock",
                "requireAuth": true,
                "jwtPublicKeyPath": "/tmp/key.pem"
            }"#,
        )
        .unwrap();
        assert!(config.require_auth);
        assert_eq!(
            config.socket_path_or_default(),
            PathBuf::from("/tmp/test-broker.sock")
        );
        assert_eq!(
            config.jwt_public_key_path_or_default(),
            PathBuf::from("/tmp/key.pem")
        );
    }
}

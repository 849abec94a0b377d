//! Server configuration.
//!
//! Values come from the environment first and are then overridden by
//! command-line flags:
//!
//! | Environment              | Flag               | Default      |
//! |--------------------------|--------------------|--------------|
//! | `IDENTITY_BIND`          | `-b, --bind`       | `127.0.0.1`  |
//! | `PORT`                   | `-p, --port`       | `3000`       |
//! | `IDENTITY_DATA_DIR`      | `-d, --data-dir`   | in-memory    |
//! | `IDENTITY_SYNC_ON_WRITE` |                    | `true`       |
//! | `IDENTITY_LOCK_STRIPES`  |                    | `64`         |
//!
//! `--in-memory` discards any data directory picked up from the environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::error::{ReconcileResult, ValidationError};
use crate::resolver::ResolverConfig;

/// Usage text printed for `--help`.
pub const USAGE: &str = "\
identity-server - contact identity reconciliation over HTTP

USAGE:
    identity-server [OPTIONS]

OPTIONS:
    -b, --bind <ADDR>         Address to bind [env: IDENTITY_BIND, default: 127.0.0.1]
    -p, --port <PORT>         Port to listen on [env: PORT, default: 3000]
    -d, --data-dir <DIR>      Persistent data directory [env: IDENTITY_DATA_DIR]
        --in-memory           Keep contacts in memory only, ignoring IDENTITY_DATA_DIR
    -h, --help                Print help information
";

/// What the binary should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve with this configuration.
    Run(ServerConfig),
    /// Print [`USAGE`] and exit.
    Help,
}

/// Configuration of the HTTP server binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind: IpAddr,
    /// Port to listen on.
    pub port: u16,
    /// Persistent data directory; `None` keeps contacts in memory.
    pub data_dir: Option<PathBuf>,
    /// fsync every WAL append.
    pub sync_on_write: bool,
    /// Resolver lock stripes.
    pub lock_stripes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 3000,
            data_dir: None,
            sync_on_write: true,
            lock_stripes: ResolverConfig::default().lock_stripes,
        }
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidConfig {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn parse_port(field: &str, raw: &str) -> Result<u16, ValidationError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(field, format!("invalid port number: {raw}")))
}

fn parse_bind(field: &str, raw: &str) -> Result<IpAddr, ValidationError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(field, format!("invalid IP address: {raw}")))
}

fn parse_bool(field: &str, raw: &str) -> Result<bool, ValidationError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(field, format!("expected a boolean, got: {raw}"))),
    }
}

impl ServerConfig {
    /// Load from the process environment and arguments.
    pub fn load() -> ReconcileResult<Command> {
        Self::from_lookup(|key| std::env::var(key).ok(), std::env::args().skip(1))
    }

    /// Load from an arbitrary environment lookup and argument list
    /// (program name excluded).
    pub fn from_lookup<F, I>(lookup: F, args: I) -> ReconcileResult<Command>
    where
        F: Fn(&str) -> Option<String>,
        I: IntoIterator<Item = String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("IDENTITY_BIND") {
            config.bind = parse_bind("IDENTITY_BIND", &raw)?;
        }
        if let Some(raw) = lookup("PORT") {
            config.port = parse_port("PORT", &raw)?;
        }
        if let Some(raw) = lookup("IDENTITY_DATA_DIR").filter(|s| !s.trim().is_empty()) {
            config.data_dir = Some(PathBuf::from(raw));
        }
        if let Some(raw) = lookup("IDENTITY_SYNC_ON_WRITE") {
            config.sync_on_write = parse_bool("IDENTITY_SYNC_ON_WRITE", &raw)?;
        }
        if let Some(raw) = lookup("IDENTITY_LOCK_STRIPES") {
            config.lock_stripes = raw
                .trim()
                .parse()
                .map_err(|_| invalid("IDENTITY_LOCK_STRIPES", format!("expected a number, got: {raw}")))?;
        }

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let mut value = |flag: &str| {
                args.next()
                    .ok_or_else(|| invalid(flag, format!("{flag} requires a value")))
            };
            match arg.as_str() {
                "--port" | "-p" => config.port = parse_port("--port", &value("--port")?)?,
                "--bind" | "-b" => config.bind = parse_bind("--bind", &value("--bind")?)?,
                "--data-dir" | "-d" => config.data_dir = Some(PathBuf::from(value("--data-dir")?)),
                "--in-memory" => config.data_dir = None,
                "--help" | "-h" => return Ok(Command::Help),
                other => return Err(invalid("arguments", format!("unknown argument: {other}")).into()),
            }
        }

        config.resolver_config().validate()?;
        Ok(Command::Run(config))
    }

    /// Socket address to listen on.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Resolver tuning derived from this configuration.
    #[must_use]
    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            lock_stripes: self.lock_stripes,
        }
    }

    /// Persistent storage settings derived from this configuration.
    #[cfg(feature = "persistent")]
    #[must_use]
    pub fn persistent_config(&self) -> crate::storage::PersistentConfig {
        crate::storage::PersistentConfig {
            sync_on_write: self.sync_on_write,
            ..crate::storage::PersistentConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(env: &[(&str, &str)], args: &[&str]) -> ReconcileResult<Command> {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ServerConfig::from_lookup(
            |key| env.get(key).cloned(),
            args.iter().map(|s| (*s).to_string()),
        )
    }

    fn run(env: &[(&str, &str)], args: &[&str]) -> ServerConfig {
        match load(env, args).unwrap() {
            Command::Run(config) => config,
            Command::Help => panic!("expected a run command"),
        }
    }

    #[test]
    fn defaults_without_env_or_args() {
        let config = run(&[], &[]);
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.addr(), "127.0.0.1:3000".parse().unwrap());
    }

    #[test]
    fn env_is_read_and_flags_override_it() {
        let env = [
            ("PORT", "8080"),
            ("IDENTITY_BIND", "0.0.0.0"),
            ("IDENTITY_DATA_DIR", "/var/lib/contacts"),
            ("IDENTITY_SYNC_ON_WRITE", "false"),
            ("IDENTITY_LOCK_STRIPES", "128"),
        ];

        let config = run(&env, &[]);
        assert_eq!(config.addr(), "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/contacts")));
        assert!(!config.sync_on_write);
        assert_eq!(config.lock_stripes, 128);

        let config = run(&env, &["-p", "9000", "--bind", "::1", "--in-memory"]);
        assert_eq!(config.addr(), "[::1]:9000".parse().unwrap());
        assert_eq!(config.data_dir, None);

        let config = run(&[], &["--data-dir", "./db"]);
        assert_eq!(config.data_dir, Some(PathBuf::from("./db")));
    }

    #[test]
    fn help_short_circuits() {
        assert_eq!(load(&[], &["--port", "1", "-h"]).unwrap(), Command::Help);
        assert!(USAGE.contains("--data-dir"));
    }

    #[test]
    fn bad_values_are_validation_errors() {
        for (env, args) in [
            (vec![("PORT", "http")], vec![]),
            (vec![("IDENTITY_SYNC_ON_WRITE", "maybe")], vec![]),
            (vec![("IDENTITY_LOCK_STRIPES", "0")], vec![]),
            (vec![], vec!["--port"]),
            (vec![], vec!["--bind", "localhost"]),
            (vec![], vec!["--verbose"]),
        ] {
            let err = load(&env, &args).unwrap_err();
            assert!(err.is_validation(), "{err}");
        }
    }
}

//! Run configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bench::{MSG, RDMA_READ_MSG, RDMA_WRITE_MSG};
use crate::ctrl::Channel;
use crate::rdma::cq::{Backoff, Poller};
use crate::rdma::type_alias::{GidIndex, PortNum};

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed configuration")]
    Parse(#[from] toml::de::Error),

    #[error("rcpair configuration not found")]
    MissingTable,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Data transfer mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Post SEND requests.
    Send,

    /// Post RECV requests.
    #[default]
    Receive,

    /// RDMA READ the peer's buffer (client), or expose the buffer (server).
    Read,

    /// RDMA WRITE the peer's buffer (client), or expose the buffer (server).
    Write,
}

impl Mode {
    /// The NUL-terminated message this side puts into its buffer, if any.
    ///
    /// For `read` and `write` only one side writes the message, but the
    /// buffer of both sides must be able to hold it.
    pub fn message(self) -> Option<&'static str> {
        match self {
            Mode::Send => Some(MSG),
            Mode::Receive => None,
            Mode::Read => Some(RDMA_READ_MSG),
            Mode::Write => Some(RDMA_WRITE_MSG),
        }
    }

    /// The mode the peer runs against this one.
    pub fn counterpart(self) -> Mode {
        match self {
            Mode::Send => Mode::Receive,
            Mode::Receive => Mode::Send,
            Mode::Read => Mode::Read,
            Mode::Write => Mode::Write,
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send" => Ok(Mode::Send),
            "receive" => Ok(Mode::Receive),
            "read" => Ok(Mode::Read),
            "write" => Ok(Mode::Write),
            _ => Err(format!(
                "unknown operation `{}`, expected send, receive, read or write",
                s
            )),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Send => "send",
            Mode::Receive => "receive",
            Mode::Read => "read",
            Mode::Write => "write",
        })
    }
}

/// Which end of the connection this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Listens for the peer; the target of RDMA READ and WRITE.
    Server,

    /// Connects to the peer; the initiator of RDMA READ and WRITE.
    Client,
}

/// Run configuration.
///
/// Deserialized from the `[rcpair]` table of a TOML file; every key is
/// optional:
///
/// ```toml
/// [rcpair]
/// dev_name = "mlx5_0"
/// server_name = "10.0.2.1"
/// tcp_port = 2345
/// ib_port = 1
/// gid_idx = 3
/// mode = "write"
/// iterations = 100
/// msg_size = 64
/// poll_timeout_ms = 2000
/// backoff = "sleep:10"
/// connect_timeout_ms = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// IB device name; the first device found if absent.
    pub dev_name: Option<String>,

    /// Peer to connect to; absent means this side listens.
    pub server_name: Option<String>,

    /// TCP port of the exchange channel.
    pub tcp_port: u16,

    /// IB port.
    pub ib_port: PortNum,

    /// GID index; absent means the connection is addressed by LID.
    pub gid_idx: Option<GidIndex>,

    pub mode: Mode,

    /// Number of post+poll cycles.
    pub iterations: u32,

    /// Size of the registered buffer in bytes.
    ///
    /// Both sides must use the same size: RDMA READ and WRITE cover the
    /// whole local buffer, and the peer's buffer length is not exchanged.
    pub msg_size: usize,

    pub poll_timeout_ms: u64,
    pub backoff: Backoff,

    /// How long a client keeps retrying to reach the server.
    pub connect_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dev_name: None,
            server_name: None,
            tcp_port: Channel::DEFAULT_PORT,
            ib_port: 1,
            gid_idx: None,
            mode: Mode::default(),
            iterations: 1,
            msg_size: 64,
            poll_timeout_ms: Poller::DEFAULT_TIMEOUT.as_millis() as u64,
            backoff: Backoff::default(),
            connect_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Load the `[rcpair]` table of a TOML file.
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let toml_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&toml_str)
    }

    /// Parse the `[rcpair]` table of a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let mut toml: toml::Table = toml::from_str(toml_str)?;
        let table = toml.remove("rcpair").ok_or(ConfigError::MissingTable)?;
        Ok(table.try_into::<Config>()?)
    }

    /// Check the values that cannot be checked by their types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ib_port == 0 {
            return Err(ConfigError::Invalid("IB port must be at least 1".to_owned()));
        }
        if self.msg_size == 0 {
            return Err(ConfigError::Invalid("buffer size must be positive".to_owned()));
        }
        if self.msg_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "buffer size {} does not fit in one SGE",
                self.msg_size
            )));
        }
        if let Some(msg) = self.mode.message() {
            if msg.len() + 1 > self.msg_size {
                return Err(ConfigError::Invalid(format!(
                    "{} mode needs a buffer of at least {} bytes, got {}",
                    self.mode,
                    msg.len() + 1,
                    self.msg_size
                )));
            }
        }
        Ok(())
    }

    /// Get the role this configuration plays.
    #[inline]
    pub fn role(&self) -> Role {
        if self.server_name.is_some() {
            Role::Client
        } else {
            Role::Server
        }
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get a completion poller as configured.
    #[inline]
    pub fn poller(&self) -> Poller {
        Poller::new(Duration::from_millis(self.poll_timeout_ms), self.backoff)
    }
}

/// The configuration banner printed before a run.
impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, " ------------------------------------------------")?;
        writeln!(
            f,
            " Device name : \"{}\"",
            self.dev_name.as_deref().unwrap_or("(first found)")
        )?;
        writeln!(f, " IB port : {}", self.ib_port)?;
        if let Some(server) = &self.server_name {
            writeln!(f, " IP : {}", server)?;
        }
        writeln!(f, " TCP port : {}", self.tcp_port)?;
        if let Some(gid_idx) = self.gid_idx {
            writeln!(f, " GID index : {}", gid_idx)?;
        }
        writeln!(f, " Operation : {} x {}", self.mode, self.iterations)?;
        writeln!(f, " ------------------------------------------------")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.tcp_port, 2345);
        assert_eq!(cfg.ib_port, 1);
        assert_eq!(cfg.gid_idx, None);
        assert_eq!(cfg.mode, Mode::Receive);
        assert_eq!(cfg.iterations, 1);
        assert_eq!(cfg.role(), Role::Server);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parse_table() {
        let cfg = Config::from_toml_str(
            r#"
            [rcpair]
            server_name = "10.0.2.1"
            gid_idx = 3
            mode = "write"
            iterations = 10
            backoff = "sleep:25"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server_name.as_deref(), Some("10.0.2.1"));
        assert_eq!(cfg.gid_idx, Some(3));
        assert_eq!(cfg.mode, Mode::Write);
        assert_eq!(cfg.iterations, 10);
        assert_eq!(cfg.backoff, Backoff::Sleep(Duration::from_micros(25)));
        assert_eq!(cfg.tcp_port, 2345);
        assert_eq!(cfg.role(), Role::Client);
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            Config::from_toml_str("[other]\nx = 1\n"),
            Err(ConfigError::MissingTable)
        ));
        assert!(matches!(
            Config::from_toml_str("[rcpair]\nmode = \"atomic\"\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[rcpair]\nport = 1\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn message_must_fit() {
        let cfg = Config {
            mode: Mode::Read,
            msg_size: RDMA_READ_MSG.len(),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let cfg = Config {
            msg_size: RDMA_READ_MSG.len() + 1,
            ..cfg
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn banner() {
        let cfg = Config {
            server_name: Some("node1".to_owned()),
            gid_idx: Some(0),
            ..Config::default()
        };
        let banner = cfg.to_string();
        assert!(banner.contains(" IP : node1\n"));
        assert!(banner.contains(" TCP port : 2345\n"));
        assert!(banner.contains(" GID index : 0\n"));
        assert!(!Config::default().to_string().contains("GID index"));
    }
}

use std::env;
use std::fmt;

use crate::errors::FileSpecError;
use crate::DEFAULT_PORT;

/// One side of a copy: `[user@host[:port]:]path`.
///
/// Without a `user@host` prefix the path is local and belongs to the
/// current user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub local: bool,
}

impl FileSpec {
    /// Parse a spec, taking the local user name from `$USER` (or `$USERNAME`).
    pub fn parse(spec: &str) -> Result<Self, FileSpecError> {
        let local_user = env::var("USER").or_else(|_| env::var("USERNAME")).ok();
        FileSpec::parse_as(spec, local_user.as_deref())
    }

    /// Parse a spec with an explicit local user name.
    pub fn parse_as(spec: &str, local_user: Option<&str>) -> Result<Self, FileSpecError> {
        if spec.is_empty() {
            return Err(FileSpecError::Empty);
        }

        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [path] => Ok(FileSpec {
                user: local_user.ok_or(FileSpecError::UnknownLocalUser)?.to_string(),
                host: "localhost".to_string(),
                port: DEFAULT_PORT,
                path: path.to_string(),
                local: true,
            }),
            [user_host, path] => {
                let (user, host) = split_user_host(user_host)?;
                Ok(FileSpec::remote(user, host, DEFAULT_PORT, path))
            }
            [user_host, port, path] => {
                let (user, host) = split_user_host(user_host)?;
                let port = port
                    .parse::<u16>()
                    .map_err(|_| FileSpecError::InvalidPort(port.to_string()))?;
                Ok(FileSpec::remote(user, host, port, path))
            }
            _ => Err(FileSpecError::TooManyParts(spec.to_string())),
        }
    }

    fn remote(user: &str, host: &str, port: u16, path: &str) -> Self {
        FileSpec {
            user: user.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
            local: false,
        }
    }

    /// `host:port` for a remote spec, `None` for a local one.
    pub fn connect_string(&self) -> Option<String> {
        if self.local {
            None
        } else {
            Some(format!("{}:{}", self.host, self.port))
        }
    }
}

impl fmt::Display for FileSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.local {
            write!(f, "{}", self.path)
        } else {
            write!(f, "{}@{}:{}:{}", self.user, self.host, self.port, self.path)
        }
    }
}

fn split_user_host(user_host: &str) -> Result<(&str, &str), FileSpecError> {
    match user_host.split_once('@') {
        Some((user, host)) if !user.is_empty() && !host.is_empty() && !host.contains('@') => {
            Ok((user, host))
        }
        _ => Err(FileSpecError::MissingUser(user_host.to_string())),
    }
}

// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The remote-command channel used to reach cluster hosts.
//!
//! Everything keel does on a host goes through a `RemoteExecutor`: running a command, capturing
//! the output of a command, or copying a single local file to the host.

use std::{collections::BTreeMap, fmt, io, path::Path};

use {async_trait::async_trait, thiserror::Error};

pub mod ssh;

/// Environment variables exported before a remote command runs.
pub type Env = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The local helper process (e.g. `ssh`) could not be started.
    #[error("could not reach {host}: {source}")]
    Spawn {
        host: String,
        #[source]
        source: io::Error,
    },

    /// The command ran but exited unsuccessfully.
    #[error("`{command}` failed on {host} ({status}): {stderr}")]
    Failed {
        host: String,
        command: String,
        status: String,
        stderr: String,
    },
}

impl RemoteError {
    pub fn host(&self) -> &str {
        match self {
            RemoteError::Spawn { host, .. } => host,
            RemoteError::Failed { host, .. } => host,
        }
    }
}

#[async_trait]
pub trait RemoteExecutor: fmt::Debug + Send + Sync {
    /// Run `command` on `host` with `env` exported first.
    async fn exec(&self, host: &str, env: &Env, command: &str) -> Result<(), RemoteError>;

    /// Run `command` on `host` and return its standard output.
    async fn output(&self, host: &str, command: &str) -> Result<String, RemoteError>;

    /// Copy the local file `local` to the path `remote` on `host`. The parent directory of
    /// `remote` must already exist.
    async fn copy(&self, host: &str, local: &Path, remote: &Path) -> Result<(), RemoteError>;
}

/// Quote `s` so a POSIX shell treats it as a single word.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Build the command line that runs `command` with `env` exported.
pub fn with_env(env: &Env, command: &str) -> String {
    if env.is_empty() {
        return command.to_string();
    }
    let exports: Vec<String> = env
        .iter()
        .map(|(k, v)| format!("{k}={}", shell_quote(v)))
        .collect();
    format!("export {}; {command}", exports.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/var/lib/keel"), "/var/lib/keel");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn env_exports() {
        let env = Env::from([
            ("B".to_string(), "two words".to_string()),
            ("A".to_string(), "1".to_string()),
        ]);
        assert_eq!(with_env(&env, "true"), "export A=1 B='two words'; true");
        assert_eq!(with_env(&Env::new(), "true"), "true");
    }
}

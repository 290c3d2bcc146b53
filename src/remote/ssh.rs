// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{path::Path, process::Output};

use {async_trait::async_trait, log::debug, tokio::process::Command};

use crate::{
    config::Ssh,
    remote::{with_env, Env, RemoteError, RemoteExecutor},
};

/// Runs commands on hosts by shelling out to the system `ssh` and `scp` clients.
///
/// `BatchMode` is always set, so a host that would prompt for a password fails instead of
/// hanging the upgrade.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    ssh: Ssh,
}

impl SshExecutor {
    pub fn new(ssh: Ssh) -> Self {
        SshExecutor { ssh }
    }

    fn common_options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.ssh.connect_timeout),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(key) = &self.ssh.identity_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args
    }

    fn destination(&self, host: &str) -> String {
        format!("{}@{}", self.ssh.user, host)
    }

    async fn run_ssh(&self, host: &str, command: &str) -> Result<Output, RemoteError> {
        debug!("ssh {host}: {command}");
        let output = Command::new("ssh")
            .args(self.common_options())
            .arg("-p")
            .arg(self.ssh.port.to_string())
            .arg(self.destination(host))
            .arg(command)
            .output()
            .await
            .map_err(|source| RemoteError::Spawn {
                host: host.to_string(),
                source,
            })?;
        check_status(host, command, output)
    }
}

fn check_status(host: &str, command: &str, output: Output) -> Result<Output, RemoteError> {
    if output.status.success() {
        return Ok(output);
    }
    Err(RemoteError::Failed {
        host: host.to_string(),
        command: command.to_string(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn exec(&self, host: &str, env: &Env, command: &str) -> Result<(), RemoteError> {
        self.run_ssh(host, &with_env(env, command)).await?;
        Ok(())
    }

    async fn output(&self, host: &str, command: &str) -> Result<String, RemoteError> {
        let output = self.run_ssh(host, command).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn copy(&self, host: &str, local: &Path, remote: &Path) -> Result<(), RemoteError> {
        let target = format!("{}:{}", self.destination(host), remote.display());
        debug!("scp {} -> {target}", local.display());
        let output = Command::new("scp")
            .args(self.common_options())
            .arg("-q")
            .arg("-P")
            .arg(self.ssh.port.to_string())
            .arg(local)
            .arg(&target)
            .output()
            .await
            .map_err(|source| RemoteError::Spawn {
                host: host.to_string(),
                source,
            })?;
        check_status(host, &format!("scp {}", local.display()), output)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_include_identity() {
        let exec = SshExecutor::new(Ssh {
            identity_file: Some("/root/.ssh/id_ed25519".into()),
            ..Ssh::default()
        });
        let opts = exec.common_options();
        assert!(opts.contains(&"BatchMode=yes".to_string()));
        assert!(opts.ends_with(&["-i".to_string(), "/root/.ssh/id_ed25519".to_string()]));
        assert_eq!(exec.destination("10.0.0.1"), "root@10.0.0.1");
    }
}

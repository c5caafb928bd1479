//! Direct command execution on the DUT over SSH.

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::info;

use crate::network::LocalTargetResolver;
use crate::utils::{retry, RetryPolicy};

/// Development images expose SSH here
const SSH_PORT: u16 = 22222;

pub fn ssh_args(address: &str, command: &str) -> Vec<String> {
    [
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "LogLevel=ERROR",
        "-o",
        "BatchMode=yes",
        "-o",
        "ConnectTimeout=10",
    ]
    .iter()
    .map(|s| s.to_string())
    .chain([
        "-p".to_string(),
        SSH_PORT.to_string(),
        format!("root@{}", address),
        command.to_string(),
    ])
    .collect()
}

async fn ssh_once(resolver: &LocalTargetResolver, target: &str, command: &str) -> Result<String> {
    let address = resolver.resolve(target).await?;
    let output = Command::new("ssh")
        .args(ssh_args(&address, command))
        .output()
        .await
        .context("executing ssh")?;

    if !output.status.success() {
        bail!(
            "command on {} failed ({}): {}",
            target,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

/// Run `command` on `target`, retrying while the device comes up
pub async fn exec_on_target(
    resolver: &LocalTargetResolver,
    target: &str,
    command: &str,
    policy: RetryPolicy,
) -> Result<String> {
    info!(target = %target, command = %command, "executing on DUT");
    retry(policy, "DUT command", || ssh_once(resolver, target, command)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_args() {
        let args = ssh_args("10.10.10.23", "uname -a");
        let tail: Vec<&str> = args.iter().rev().take(4).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["-p", "22222", "root@10.10.10.23", "uname -a"]);
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
    }
}

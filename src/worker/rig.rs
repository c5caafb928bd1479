//! Bridge to the vendor rig SDKs.
//!
//! Physical and automation rigs are driven by a companion binary that wraps
//! the vendor SDK. Each operation is one invocation with a subcommand;
//! answers come back on stdout (JSON where structured) and the binary's
//! stderr is relayed into our logs.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::Diagnostics;
use crate::config::RigOptions;
use crate::network::types::WirelessRequest;
use crate::network::ConnectionDescriptor;
use crate::process::{ManagedProcess, OutputMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Wired,
    Wireless,
}

impl NetworkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkKind::Wired => "wired",
            NetworkKind::Wireless => "wireless",
        }
    }
}

/// Capabilities a rig SDK provides
#[async_trait]
pub trait RigSdk: Send + Sync {
    async fn setup(&self) -> Result<()>;

    async fn power(&self, on: bool) -> Result<()>;

    async fn flash(&self, image: &Path) -> Result<()>;

    async fn diagnostics(&self) -> Result<Diagnostics>;

    async fn add_wired(&self, interface: Option<&str>, nat: bool) -> Result<ConnectionDescriptor>;

    async fn add_wireless(
        &self,
        interface: Option<&str>,
        request: &WirelessRequest,
    ) -> Result<ConnectionDescriptor>;

    async fn remove_network(&self, kind: NetworkKind) -> Result<()>;

    /// Start copying the DUT serial console into `log`, if the rig has one
    async fn open_serial(&self, log: &Path) -> Result<Option<ManagedProcess>>;

    async fn keyboard(&self, key: &str) -> Result<()>;

    async fn video(&self, start: bool) -> Result<()>;

    /// `hard` releases the rig completely, as on process exit
    async fn teardown(&self, hard: bool) -> Result<()>;
}

/// `RigSdk` over the rig bridge binary
pub struct RigCli {
    program: String,
    env: Vec<(String, String)>,
}

impl RigCli {
    pub fn new(options: &RigOptions) -> Self {
        Self {
            program: options.program.clone(),
            env: options.env.clone(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }

    /// Run one subcommand and return its trimmed stdout
    pub async fn invoke(&self, args: &[&str]) -> Result<String> {
        debug!(rig = %self.program, args = ?args, "invoking rig bridge");

        let mut cmd = self.command(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning rig bridge {}", self.program))?;

        let stderr = child.stderr.take();
        let program = self.program.clone();
        let relay = tokio::spawn(async move {
            let mut last = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "rig", rig = %program, "{}", line);
                    last = line;
                }
            }
            last
        });

        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_string(&mut stdout)
                .await
                .context("reading rig bridge output")?;
        }
        let status = child.wait().await.context("waiting for rig bridge")?;
        let last_error = relay.await.unwrap_or_default();

        if !status.success() {
            bail!(
                "{} {} failed ({}): {}",
                self.program,
                args.join(" "),
                status,
                last_error
            );
        }
        Ok(stdout.trim().to_string())
    }

    async fn invoke_json(&self, args: &[&str]) -> Result<serde_json::Value> {
        let out = self.invoke(args).await?;
        if out.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&out)
            .with_context(|| format!("parsing output of {} {}", self.program, args.join(" ")))
    }
}

#[async_trait]
impl RigSdk for RigCli {
    async fn setup(&self) -> Result<()> {
        self.invoke(&["setup"]).await.map(|_| ())
    }

    async fn power(&self, on: bool) -> Result<()> {
        let state = if on { "on" } else { "off" };
        self.invoke(&["power", state]).await.map(|_| ())
    }

    async fn flash(&self, image: &Path) -> Result<()> {
        let image = image.to_string_lossy();
        self.invoke(&["flash", image.as_ref()]).await.map(|_| ())
    }

    async fn diagnostics(&self) -> Result<Diagnostics> {
        match self.invoke_json(&["diagnostics"]).await? {
            serde_json::Value::Object(map) => Ok(map),
            serde_json::Value::Null => Ok(Diagnostics::new()),
            other => bail!("rig diagnostics is not an object: {}", other),
        }
    }

    async fn add_wired(&self, interface: Option<&str>, nat: bool) -> Result<ConnectionDescriptor> {
        let mut args = vec!["network", "wired"];
        if let Some(iface) = interface {
            args.extend(["--interface", iface]);
        }
        if nat {
            args.push("--nat");
        }
        self.invoke(&args).await
    }

    async fn add_wireless(
        &self,
        interface: Option<&str>,
        request: &WirelessRequest,
    ) -> Result<ConnectionDescriptor> {
        let mut args = vec!["network", "wireless", "--ssid", request.ssid.as_str()];
        if let Some(psk) = &request.psk {
            args.extend(["--psk", psk.as_str()]);
        }
        if let Some(iface) = interface {
            args.extend(["--interface", iface]);
        }
        if request.nat {
            args.push("--nat");
        }
        self.invoke(&args).await
    }

    async fn remove_network(&self, kind: NetworkKind) -> Result<()> {
        self.invoke(&["network", "remove", kind.as_str()])
            .await
            .map(|_| ())
    }

    async fn open_serial(&self, log: &Path) -> Result<Option<ManagedProcess>> {
        if let Some(parent) = log.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = std::fs::File::create(log)
            .with_context(|| format!("creating serial log {}", log.display()))?;

        let mut cmd = self.command(&["serial"]);
        cmd.stdout(Stdio::from(file)).stderr(Stdio::null());
        let process = ManagedProcess::spawn("rig-serial", cmd, OutputMode::Configured)?;
        info!(log = %log.display(), "DUT serial capture started");
        Ok(Some(process))
    }

    async fn keyboard(&self, key: &str) -> Result<()> {
        self.invoke(&["keyboard", key]).await.map(|_| ())
    }

    async fn video(&self, start: bool) -> Result<()> {
        let action = if start { "start" } else { "stop" };
        self.invoke(&["video", action]).await.map(|_| ())
    }

    async fn teardown(&self, hard: bool) -> Result<()> {
        let mut args = vec!["teardown"];
        if hard {
            args.push("--hard");
        }
        self.invoke(&args).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn rig(program: &str) -> RigCli {
        RigCli {
            program: program.into(),
            env: vec![("TESTBOT_DUT_TYPE".into(), "raspberrypi4-64".into())],
        }
    }

    fn script(dir: &Path, body: &str) -> String {
        let path = dir.join("rig-bridge");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_invoke_returns_stdout() {
        let out = rig("echo").invoke(&["power", "on"]).await.unwrap();
        assert_eq!(out, "power on");
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let dir = tempfile::tempdir().unwrap();
        let cli = rig(&script(dir.path(), "echo \"$TESTBOT_DUT_TYPE\""));
        assert_eq!(cli.invoke(&["flash"]).await.unwrap(), "raspberrypi4-64");
    }

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let cli = rig(&script(dir.path(), "echo 'relay not found' >&2; exit 3"));
        let err = cli.power(true).await.unwrap_err();
        assert!(err.to_string().contains("relay not found"), "{}", err);
    }

    #[tokio::test]
    async fn test_diagnostics_json() {
        let dir = tempfile::tempdir().unwrap();
        let cli = rig(&script(dir.path(), "echo '{\"vout\": 5.1, \"amperage\": 0.4}'"));
        let diag = cli.diagnostics().await.unwrap();
        assert_eq!(diag.get("vout").and_then(|v| v.as_f64()), Some(5.1));

        let cli = rig(&script(dir.path(), "echo '[1, 2]'"));
        assert!(cli.diagnostics().await.is_err());
    }

    #[tokio::test]
    async fn test_wireless_arguments() {
        let request = WirelessRequest {
            ssid: "lab".into(),
            psk: Some("secret".into()),
            nat: true,
        };
        let out = rig("echo")
            .add_wireless(Some("wlan0"), &request)
            .await
            .unwrap();
        assert_eq!(
            out,
            "network wireless --ssid lab --psk secret --interface wlan0 --nat"
        );
    }
}

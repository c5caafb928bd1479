//! DUT serial console: the captured log and one-shot command execution.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::utils::run_checked;

const EXEC_TIMEOUT: Duration = Duration::from_secs(30);
const MARKER_PREFIX: &str = "__RIGD_DONE_";

/// Contents of the serial log written while the DUT is powered
pub async fn read_serial_log(path: &Path) -> Result<String> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading serial log {}", path.display()))?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

pub struct SerialConsole {
    path: PathBuf,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialConsole {
    pub fn new(path: PathBuf, baud_rate: u32) -> Self {
        Self {
            path,
            baud_rate,
            timeout: EXEC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `command` in the DUT's serial shell and return what it printed.
    ///
    /// The line is configured raw first, then the command is sent followed
    /// by an echo of a one-off marker; output is read until the marker
    /// shows up on its own line.
    pub async fn exec(&self, command: &str) -> Result<String> {
        let path = self.path.to_string_lossy();
        let baud = self.baud_rate.to_string();
        run_checked("stty", &["-F", &path, &baud, "raw", "-echo"])
            .await
            .context("configuring serial line")?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let marker = format!("{}{}", MARKER_PREFIX, &id[..8]);
        // Quoting splits the marker so the shell's echo of the input line
        // never matches it
        let line = format!(
            "{}; echo \"{}\"\"{}\"\n",
            command,
            MARKER_PREFIX,
            &id[..8]
        );

        let mut port = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening serial port {}", self.path.display()))?;

        info!(port = %self.path.display(), command = %command, "executing over serial");
        port.write_all(line.as_bytes())
            .await
            .context("writing command to serial port")?;
        port.flush().await?;

        let read = async {
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = port
                    .read(&mut chunk)
                    .await
                    .context("reading serial port")?;
                if n == 0 {
                    // A pty reports EOF while idle; poll again
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                buffer.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buffer);
                if let Some(output) = extract_output(&text, &marker) {
                    return Ok::<_, anyhow::Error>(output);
                }
            }
        };

        match tokio::time::timeout(self.timeout, read).await {
            Ok(result) => {
                let output = result?;
                debug!(bytes = output.len(), "serial command finished");
                Ok(output)
            }
            Err(_) => bail!(
                "serial command timed out after {}s",
                self.timeout.as_secs()
            ),
        }
    }
}

/// Output between the echoed command line and the marker line, if the
/// marker has arrived
pub fn extract_output(text: &str, marker: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().map(|l| l.trim_end_matches('\r')).collect();
    let end = lines.iter().position(|l| l.trim() == marker)?;

    // Skip the terminal's echo of what we typed
    let start = lines[..end]
        .iter()
        .rposition(|l| l.contains(MARKER_PREFIX))
        .map(|i| i + 1)
        .unwrap_or(0);

    Some(lines[start..end].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_waits_for_marker() {
        let text = "uname -a; echo \"__RIGD_DONE_\"\"ab12cd34\"\r\nLinux dut 6.1\r\n";
        assert!(extract_output(text, "__RIGD_DONE_ab12cd34").is_none());
    }

    #[test]
    fn test_extract_strips_echo_and_marker() {
        let text = "uname -a; echo \"__RIGD_DONE_\"\"ab12cd34\"\r\n\
                    Linux dut 6.1\r\n\
                    second line\r\n\
                    __RIGD_DONE_ab12cd34\r\n\
                    root@dut:~# ";
        assert_eq!(
            extract_output(text, "__RIGD_DONE_ab12cd34").unwrap(),
            "Linux dut 6.1\nsecond line"
        );
    }

    #[test]
    fn test_extract_without_echo() {
        let text = "hello\n__RIGD_DONE_00000000\n";
        assert_eq!(
            extract_output(text, "__RIGD_DONE_00000000").unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn test_missing_serial_log() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_serial_log(&dir.path().join("absent.txt"))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("reading serial log"));
    }
}

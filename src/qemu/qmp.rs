//! Minimal QMP client: enough to inject key presses.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::debug;

const QMP_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// QEMU `qcode` for a key name as orchestrators send it
pub fn qcode(key: &str) -> String {
    let key = key.to_ascii_lowercase();
    match key.as_str() {
        "enter" | "return" => "ret".into(),
        "escape" => "esc".into(),
        "space" | " " => "spc".into(),
        "backspace" => "backspace".into(),
        "del" | "delete" => "delete".into(),
        "pageup" => "pgup".into(),
        "pagedown" => "pgdn".into(),
        "arrowup" => "up".into(),
        "arrowdown" => "down".into(),
        "arrowleft" => "left".into(),
        "arrowright" => "right".into(),
        _ => key,
    }
}

pub fn send_key_command(key: &str) -> Value {
    json!({
        "execute": "send-key",
        "arguments": { "keys": [ { "type": "qcode", "data": qcode(key) } ] }
    })
}

/// Connect, negotiate capabilities, and press `key` once
pub async fn send_key(port: u16, key: &str) -> Result<()> {
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
        .await
        .with_context(|| format!("connecting to QMP on port {}", port))?;
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let greeting = next_message(&mut lines).await?;
    if greeting.get("QMP").is_none() {
        bail!("unexpected QMP greeting: {}", greeting);
    }

    for command in [json!({ "execute": "qmp_capabilities" }), send_key_command(key)] {
        let mut line = command.to_string();
        line.push('\n');
        write
            .write_all(line.as_bytes())
            .await
            .context("writing QMP command")?;
        expect_return(&mut lines).await?;
    }

    debug!(port, key, "key sent over QMP");
    Ok(())
}

async fn next_message(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Result<Value> {
    let line = tokio::time::timeout(QMP_REPLY_TIMEOUT, lines.next_line())
        .await
        .context("timed out waiting for QMP")?
        .context("reading from QMP")?
        .context("QMP connection closed")?;
    serde_json::from_str(&line).with_context(|| format!("parsing QMP message: {}", line))
}

async fn expect_return(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Result<Value> {
    loop {
        let message = next_message(lines).await?;
        if let Some(ret) = message.get("return") {
            return Ok(ret.clone());
        }
        if let Some(err) = message.get("error") {
            let desc = err
                .get("desc")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            bail!("QMP error: {}", desc);
        }
        // Asynchronous events interleave with replies
    }
}

use anyhow::Result;
use std::net::Ipv4Addr;
use tokio::net::TcpListener;
use tracing::debug;

use crate::config::PortChoice;
use crate::error::WorkerError;

/// Picks local TCP ports for the VM's VNC and QMP endpoints.
///
/// Ports are only probed, not held: the VM binds them right after, and
/// nothing is reserved once it exits.
pub struct PortAllocator;

impl PortAllocator {
    /// The pinned port, else the first port in range free on 127.0.0.1
    pub async fn resolve(choice: &PortChoice) -> Result<u16> {
        if let Some(port) = choice.pinned {
            return Ok(port);
        }

        for port in choice.min..=choice.max {
            if Self::is_free(port).await {
                debug!(port, "found free port");
                return Ok(port);
            }
        }

        Err(WorkerError::Provisioning(format!(
            "no free port in range {}-{}",
            choice.min, choice.max
        ))
        .into())
    }

    pub async fn is_free(port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await.is_ok()
    }
}

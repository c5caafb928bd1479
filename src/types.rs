use serde::{Deserialize, Serialize};
use std::fmt;

/// Device type the daemon was configured for. Chosen once at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    TestbotHat,
    Qemu,
    Autokit,
    Manual,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::TestbotHat => "testbot_hat",
            DeviceType::Qemu => "qemu",
            DeviceType::Autokit => "autokit",
            DeviceType::Manual => "manual",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guest architecture of the virtual device
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    X86_64,
    Aarch64,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Aarch64 => "aarch64",
        }
    }

    /// Whether the host CPU (as named by `std::env::consts::ARCH`) can run
    /// this guest under hardware acceleration.
    pub fn matches_host(&self, host_arch: &str) -> bool {
        host_arch == self.as_str()
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lease state of the single device session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Idle,
    Busy,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("IDLE"),
            SessionState::Busy => f.write_str("BUSY"),
        }
    }
}

/// Progress of the background flash flow, polled by the orchestrator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlashState {
    Idle,
    Pending,
    Done,
    Error,
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlashState::Idle => "IDLE",
            FlashState::Pending => "PENDING",
            FlashState::Done => "DONE",
            FlashState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_serialization() {
        let json = serde_json::to_string(&DeviceType::TestbotHat).unwrap();
        assert_eq!(json, "\"testbot_hat\"");

        let deserialized: DeviceType = serde_json::from_str("\"qemu\"").unwrap();
        assert_eq!(deserialized, DeviceType::Qemu);
    }

    #[test]
    fn test_state_text_matches_wire_format() {
        assert_eq!(SessionState::Busy.to_string(), "BUSY");
        assert_eq!(FlashState::Pending.to_string(), "PENDING");
        assert_eq!(
            serde_json::to_string(&FlashState::Error).unwrap(),
            "\"ERROR\""
        );
    }

    #[test]
    fn test_architecture_host_match() {
        assert!(Architecture::X86_64.matches_host("x86_64"));
        assert!(!Architecture::Aarch64.matches_host("x86_64"));
        assert!(Architecture::Aarch64.matches_host("aarch64"));
    }
}

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "rigd",
    version,
    about = "Control-plane daemon for a hardware-in-the-loop test rig"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Own the device under test and serve the HTTP control surface
    Serve(ServeArgs),
    /// Check host requirements for running a virtual device
    Preflight(PreflightArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTypeOpt {
    #[value(name = "testbot_hat")]
    TestbotHat,
    Qemu,
    Autokit,
    Manual,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchOpt {
    #[value(name = "x86_64")]
    X86_64,
    Aarch64,
}

#[derive(Args, Debug, Clone)]
pub struct PreflightArgs {
    /// Guest architecture to check for
    #[arg(long, env = "QEMU_ARCH", value_enum, default_value = "x86_64")]
    pub arch: ArchOpt,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// HTTP listen port
    #[arg(long, env = "WORKER_PORT", default_value_t = 80)]
    pub port: u16,

    /// Working directory for staged images and captures
    #[arg(long, env = "WORKDIR", default_value = "/data")]
    pub workdir: String,

    #[arg(long, env = "WORKER_TYPE", value_enum, default_value = "testbot_hat")]
    pub worker_type: WorkerTypeOpt,

    #[arg(long, env = "SCREEN_CAPTURE", action = ArgAction::Set, value_parser = BoolishValueParser::new(), default_value = "false")]
    pub screen_capture: bool,

    #[arg(long, env = "NETWORK_WIRED_INTERFACE", default_value = "eth1")]
    pub wired_interface: String,

    #[arg(long, env = "NETWORK_WIRELESS_INTERFACE", default_value = "wlan0")]
    pub wireless_interface: String,

    /// Serial console used by /dut/serial/exec
    #[arg(long, env = "SERIAL_PATH", default_value = "/dev/pts/0")]
    pub serial_path: String,

    #[arg(long, env = "BAUD_RATE", default_value_t = 115200)]
    pub baud_rate: u32,

    /// Where the DUT serial console is logged
    #[arg(long, env = "DUT_SERIAL_LOG", default_value = crate::paths::DEFAULT_SERIAL_LOG)]
    pub serial_log: String,

    /// Update lock shared with the host OS (`.lock` is appended if missing)
    #[arg(long, env = "BALENA_APP_LOCK_PATH")]
    pub lock_path: Option<String>,

    /// Seconds a session survives without a heartbeat
    #[arg(long, env = "HEARTBEAT_TIMEOUT_SECS", default_value_t = 300)]
    pub heartbeat_timeout: u64,

    /// Poll count suggested to clients of the background flash
    #[arg(long, env = "FLASH_TIMEOUT_TRIES", default_value_t = 60)]
    pub flash_timeout_tries: u32,

    /// Id published in the device contract (random when unset)
    #[arg(long, env = "BALENA_DEVICE_UUID")]
    pub device_id: Option<String>,

    /// `name=value` pairs published as supported features
    #[arg(long, env = "DEVICE_TAGS", default_value = "")]
    pub device_tags: String,

    /// Capture card on physical rigs
    #[arg(long, env = "VIDEO_DEVICE", default_value = "/dev/video0")]
    pub video_device: String,

    #[command(flatten)]
    pub qemu: QemuArgs,

    #[command(flatten)]
    pub rig: RigArgs,
}

#[derive(Args, Debug, Clone)]
pub struct QemuArgs {
    #[arg(long, env = "QEMU_ARCH", value_enum, default_value = "x86_64")]
    pub qemu_arch: ArchOpt,

    #[arg(long, env = "QEMU_CPUS", default_value_t = 4)]
    pub qemu_cpus: u32,

    /// Guest memory, e.g. 2G or 512M
    #[arg(long, env = "QEMU_MEMORY", default_value = "2G")]
    pub qemu_memory: String,

    /// Inherit the VM's stdio instead of logging its serial console
    #[arg(long, env = "QEMU_DEBUG", action = ArgAction::Set, value_parser = BoolishValueParser::new(), default_value = "false")]
    pub qemu_debug: bool,

    /// Flash through a RAID-1 array over a loop device
    #[arg(long, env = "QEMU_FORCE_RAID", action = ArgAction::Set, value_parser = BoolishValueParser::new(), default_value = "false")]
    pub qemu_force_raid: bool,

    /// VM disk file (default: <workdir>/dut-disk.img)
    #[arg(long, env = "QEMU_DISK")]
    pub qemu_disk: Option<String>,

    #[arg(long, env = "QEMU_DISK_SIZE", default_value = "8G")]
    pub qemu_disk_size: String,

    #[arg(long, env = "QEMU_FIRMWARE_CODE", requires = "qemu_firmware_vars")]
    pub qemu_firmware_code: Option<String>,

    #[arg(long, env = "QEMU_FIRMWARE_VARS", requires = "qemu_firmware_code")]
    pub qemu_firmware_vars: Option<String>,

    #[arg(long, env = "QEMU_NETWORK_AUTOCONFIGURE", action = ArgAction::Set, value_parser = BoolishValueParser::new(), default_value = "true")]
    pub qemu_network_autoconfigure: bool,

    #[arg(long, env = "QEMU_BRIDGE_NAME")]
    pub qemu_bridge_name: Option<String>,

    #[arg(long, env = "QEMU_BRIDGE_ADDRESS")]
    pub qemu_bridge_address: Option<std::net::Ipv4Addr>,

    /// dnsmasq range, e.g. 10.10.10.2,10.10.10.254
    #[arg(long, env = "QEMU_DHCP_RANGE")]
    pub qemu_dhcp_range: Option<String>,

    #[arg(long, env = "QEMU_VNC_PORT")]
    pub qemu_vnc_port: Option<u16>,

    #[arg(long, env = "QEMU_QMP_PORT")]
    pub qemu_qmp_port: Option<u16>,

    #[arg(long, env = "QEMU_VNC_MIN_PORT", default_value_t = 5900)]
    pub qemu_vnc_min_port: u16,

    #[arg(long, env = "QEMU_VNC_MAX_PORT", default_value_t = 5999)]
    pub qemu_vnc_max_port: u16,

    #[arg(long, env = "QEMU_QMP_MIN_PORT", default_value_t = 5000)]
    pub qemu_qmp_min_port: u16,

    #[arg(long, env = "QEMU_QMP_MAX_PORT", default_value_t = 5899)]
    pub qemu_qmp_max_port: u16,
}

#[derive(Args, Debug, Clone)]
pub struct RigArgs {
    /// Bridge binary wrapping the physical rig SDK
    #[arg(long, env = "TESTBOT_CLI", default_value = "testbot")]
    pub testbot_cli: String,

    /// Board model behind the rig
    #[arg(long, env = "TESTBOT_DUT_TYPE")]
    pub testbot_dut_type: Option<String>,

    /// Bridge binary wrapping the automation rig SDK
    #[arg(long, env = "AUTOKIT_CLI", default_value = "autokit")]
    pub autokit_cli: String,

    #[arg(long = "autokit-power", env = "POWER", default_value = "autokitRelay")]
    pub power: String,

    #[arg(long = "autokit-sd-mux", env = "SD_MUX", default_value = "linuxAut")]
    pub sd_mux: String,

    #[arg(long = "autokit-network", env = "NETWORK", default_value = "linuxNetwork")]
    pub network: String,

    #[arg(long = "autokit-video", env = "VIDEO", default_value = "linuxVideo")]
    pub video: String,

    #[arg(long = "autokit-serial", env = "SERIAL", default_value = "dummySerial")]
    pub serial: String,

    #[arg(long = "autokit-usb-boot-port", env = "USB_BOOT_PORT", default_value = "4")]
    pub usb_boot_port: String,

    #[arg(long = "autokit-digital-relay", env = "DIGITAL_RELAY", default_value = "usbRelay")]
    pub digital_relay: String,
}

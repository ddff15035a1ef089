//! Virtual host controller (vhci_hcd) sysfs interface
//!
//! Remote USB devices are attached by handing the kernel a connected
//! socket fd together with a controller port. Port selection follows the
//! controller's layout: high-speed devices occupy ports 0-7, super-speed
//! devices ports 8-15.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use protocol::types::VHCI_PORTS_PER_SPEED;
use protocol::usbip::DeviceSpeed;
use tracing::{debug, info, warn};

const VHCI_PLATFORM_PATH: &str = "/sys/devices/platform/vhci_hcd.0";

/// `sta` value of an occupied port in the vhci status file.
const VDEV_ST_USED: u32 = 6;

/// Map the user-facing `port_num` and the device speed to the controller
/// port written to the attach node.
pub fn select_port(port_num: u8, speed: DeviceSpeed) -> Result<u8> {
    if port_num >= VHCI_PORTS_PER_SPEED {
        bail!(
            "port_num {port_num} is out of range, expected 0-{}",
            VHCI_PORTS_PER_SPEED - 1
        );
    }
    Ok(if speed.is_super() {
        port_num + VHCI_PORTS_PER_SPEED
    } else {
        port_num
    })
}

/// Port state parsed from the vhci status files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStatus {
    pub attached: bool,
    pub busid: String,
}

/// The local virtual host controller.
pub struct Vhci {
    sysfs_path: PathBuf,
}

impl Default for Vhci {
    fn default() -> Self {
        Self::new()
    }
}

impl Vhci {
    pub fn new() -> Self {
        Self {
            sysfs_path: PathBuf::from(VHCI_PLATFORM_PATH),
        }
    }

    pub fn with_sysfs_path(path: &Path) -> Self {
        Self {
            sysfs_path: path.to_path_buf(),
        }
    }

    /// Load the vhci-hcd module if the controller is missing.
    pub async fn ensure_available(&self) -> Result<()> {
        if self.sysfs_path.exists() {
            return Ok(());
        }
        info!("loading vhci-hcd kernel module");
        let status = tokio::process::Command::new("modprobe")
            .arg("vhci-hcd")
            .status()
            .await
            .context("failed to run modprobe")?;
        if !status.success() {
            bail!("modprobe vhci-hcd exited with {status}");
        }
        Ok(())
    }

    /// Attach a connected USB/IP socket to `vhci_port`.
    ///
    /// The kernel takes its own reference on the fd; the caller closes
    /// its copy afterwards.
    pub async fn attach(&self, vhci_port: u8, fd: RawFd, devid: u32, speed: u32) -> Result<()> {
        debug!("attaching USB device to port {vhci_port}");
        let path = self.sysfs_path.join("attach");
        let line = format!("{vhci_port} {fd} {devid} {speed}\n");
        tokio::task::spawn_blocking(move || std::fs::write(path, line))
            .await
            .context("attach task failed")?
            .context("failed to write vhci attach")?;
        Ok(())
    }

    /// Detach `vhci_port`; already-detached ports are ignored.
    pub fn detach(&self, vhci_port: u8) {
        let path = self.sysfs_path.join("detach");
        if let Err(err) = std::fs::write(path, format!("{vhci_port}")) {
            debug!("vhci detach of port {vhci_port} failed: {err}");
        }
    }

    /// Parse the controller's status files into a port map.
    ///
    /// The first file is named `status`, further controllers append
    /// `status.1`, `status.2`, ...
    pub fn port_status(&self) -> HashMap<u8, PortStatus> {
        let mut ports = HashMap::new();

        let mut index = 0;
        loop {
            let name = if index == 0 {
                "status".to_string()
            } else {
                format!("status.{index}")
            };
            let path = self.sysfs_path.join(name);
            let Ok(content) = std::fs::read_to_string(&path) else {
                break;
            };
            parse_status_file(&content, &mut ports);
            index += 1;
        }
        ports
    }

    pub fn is_attached(&self, vhci_port: u8) -> bool {
        self.port_status()
            .get(&vhci_port)
            .map(|status| status.attached)
            .unwrap_or(false)
    }
}

/// One status file:
/// ```text
/// hub port sta spd dev      sockfd local_busid
/// hs  0000 004 000 00000000 000000 0-0
/// ```
fn parse_status_file(content: &str, ports: &mut HashMap<u8, PortStatus>) {
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 7 {
            continue;
        }
        let Ok(port) = fields[1].parse::<u8>() else {
            warn!("unparsable vhci status line: {line:?}");
            continue;
        };
        let status: u32 = fields[2].parse().unwrap_or(0);
        ports.insert(
            port,
            PortStatus {
                attached: status == VDEV_ST_USED,
                busid: fields[6].to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_port() {
        assert_eq!(select_port(0, DeviceSpeed::High).unwrap(), 0);
        assert_eq!(select_port(7, DeviceSpeed::High).unwrap(), 7);
        assert_eq!(select_port(0, DeviceSpeed::Super).unwrap(), 8);
        assert_eq!(select_port(7, DeviceSpeed::Super).unwrap(), 15);
        assert_eq!(select_port(3, DeviceSpeed::Full).unwrap(), 3);
        assert!(select_port(8, DeviceSpeed::High).is_err());
    }

    #[test]
    fn test_parse_status() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("status"),
            "hub port sta spd dev      sockfd local_busid\n\
             hs  0000 006 003 00010004 000003 1-1\n\
             hs  0001 004 000 00000000 000000 0-0\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("status.1"),
            "hub port sta spd dev      sockfd local_busid\n\
             ss  0008 006 005 00020003 000004 2-1\n",
        )
        .unwrap();

        let vhci = Vhci::with_sysfs_path(dir.path());
        let ports = vhci.port_status();

        assert!(ports[&0].attached);
        assert_eq!(ports[&0].busid, "1-1");
        assert!(!ports[&1].attached);
        assert!(ports[&8].attached);
        assert_eq!(ports[&8].busid, "2-1");

        assert!(vhci.is_attached(0));
        assert!(!vhci.is_attached(1));
        assert!(!vhci.is_attached(5));
    }

    #[test]
    fn test_detach_missing_controller_is_quiet() {
        let vhci = Vhci::with_sysfs_path(Path::new("/nonexistent/vhci"));
        vhci.detach(0);
    }
}

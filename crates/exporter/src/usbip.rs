//! USB/IP device export
//!
//! The exporter owns the kernel driver binding of every USB device listed
//! in its export description: devices are moved onto the usbip-host driver
//! and exported to tunnels on demand. `OP_REQ_IMPORT` blocks until the
//! device is bound and available, woken by the uevent hook through a named
//! fifo under /run.
//!
//! URB traffic is relayed in user space: the kernel side of a socketpair
//! goes to `usbip_sockfd`, and the relay forwards submit/unlink frames
//! while tracking in-flight seqnums so a dying tunnel can unlink its
//! outstanding URBs.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use protocol::types::UsbId;
use protocol::usbip::{
    self, DeviceSpeed, OpHeader, UrbBody, UrbHeader, UsbDevice, UsbInterface, OP_REQ_DEVLIST,
    OP_REQ_IMPORT, USBIP_CMD_UNLINK,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";
const SYSFS_USBIP_HOST: &str = "/sys/bus/usb/drivers/usbip-host";
const SYSFS_DRIVERS_PROBE: &str = "/sys/bus/usb/drivers_probe";
const RUN_DIR: &str = "/run";

/// `usbip_status` value for a bound, unexported device.
const STATUS_AVAILABLE: u32 = 1;

/// One exported USB device, identified by its bus id.
pub struct UsbIpDevice {
    busid: UsbId,
    sysfs_path: PathBuf,
    refresh: Notify,
    /// Serializes exports: one tunnel owns the device at a time.
    export_lock: tokio::sync::Mutex<()>,
}

impl UsbIpDevice {
    pub fn new(busid: UsbId) -> Self {
        Self::with_sysfs_root(busid, Path::new(SYSFS_USB_DEVICES))
    }

    pub fn with_sysfs_root(busid: UsbId, root: &Path) -> Self {
        let sysfs_path = root.join(busid.as_str());
        Self {
            busid,
            sysfs_path,
            refresh: Notify::new(),
            export_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn busid(&self) -> &UsbId {
        &self.busid
    }

    /// Wake anyone blocked in [`wait_available`]; called from the uevent
    /// hook and whenever an export ends.
    pub fn refresh(&self) {
        self.refresh.notify_waiters();
    }

    /// Block until the device exists, is bound to usbip-host and is not
    /// exported elsewhere.
    pub async fn wait_available(&self) -> Result<()> {
        loop {
            // Register for wakeups before checking, so a refresh between
            // the check and the await is not lost.
            let notified = self.refresh.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_usbip_host_driver().await?;
            if self.is_available() {
                debug!("device {} is available", self.busid);
                return Ok(());
            }
            debug!("device {} is not available, yet", self.busid);
            notified.await;
        }
    }

    fn is_available(&self) -> bool {
        match read_sysfs_u32(&self.sysfs_path.join("usbip_status"), 10) {
            Ok(status) => status == STATUS_AVAILABLE,
            // The device may not be plugged in or not bound yet.
            Err(_) => false,
        }
    }

    /// Read the descriptor attributes the USB/IP replies need.
    pub fn read_attrs(&self) -> Result<UsbDevice> {
        let p = &self.sysfs_path;
        let speed = std::fs::read_to_string(p.join("speed"))
            .with_context(|| format!("failed to read speed of {}", self.busid))?;
        Ok(UsbDevice {
            path: p.display().to_string(),
            busid: self.busid.to_string(),
            busnum: read_sysfs_u32(&p.join("busnum"), 10)?,
            devnum: read_sysfs_u32(&p.join("devnum"), 10)?,
            speed: DeviceSpeed::from_sysfs(&speed).code(),
            id_vendor: read_sysfs_u32(&p.join("idVendor"), 16)? as u16,
            id_product: read_sysfs_u32(&p.join("idProduct"), 16)? as u16,
            bcd_device: read_sysfs_u32(&p.join("bcdDevice"), 16)? as u16,
            device_class: read_sysfs_u32(&p.join("bDeviceClass"), 16)? as u8,
            device_subclass: read_sysfs_u32(&p.join("bDeviceSubClass"), 16)? as u8,
            device_protocol: read_sysfs_u32(&p.join("bDeviceProtocol"), 16)? as u8,
            configuration_value: read_sysfs_u32(&p.join("bConfigurationValue"), 16).unwrap_or(0)
                as u8,
            num_configurations: read_sysfs_u32(&p.join("bNumConfigurations"), 16)? as u8,
            num_interfaces: read_sysfs_u32(&p.join("bNumInterfaces"), 16).unwrap_or(0) as u8,
        })
    }

    /// Interface descriptors for the devlist reply.
    pub fn read_interfaces(&self) -> Vec<UsbInterface> {
        let mut interfaces = Vec::new();
        let pattern = format!("{}:", self.busid);
        let Ok(entries) = std::fs::read_dir(&self.sysfs_path) else {
            return interfaces;
        };
        let mut names: Vec<_> = entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(&pattern))
            .collect();
        names.sort();
        for name in names {
            let dir = self.sysfs_path.join(name);
            interfaces.push(UsbInterface {
                interface_class: read_sysfs_u32(&dir.join("bInterfaceClass"), 16).unwrap_or(0)
                    as u8,
                interface_subclass: read_sysfs_u32(&dir.join("bInterfaceSubClass"), 16)
                    .unwrap_or(0) as u8,
                interface_protocol: read_sysfs_u32(&dir.join("bInterfaceProtocol"), 16)
                    .unwrap_or(0) as u8,
            });
        }
        interfaces
    }

    /// Make sure the device is bound to usbip-host. Unbinding the current
    /// driver can take hundreds of milliseconds, so the writes run on the
    /// blocking pool.
    async fn ensure_usbip_host_driver(&self) -> Result<()> {
        let driver_path = self.sysfs_path.join("driver");
        if driver_path.exists() {
            let driver_name = tokio::fs::canonicalize(&driver_path)
                .await
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
            match driver_name.as_deref() {
                Some("usbip-host") => return Ok(()),
                Some(name) => {
                    info!("unbinding USB device {} from driver {name:?}", self.busid);
                    let unbind = driver_path.join("unbind");
                    let busid = self.busid.to_string();
                    tokio::task::spawn_blocking(move || std::fs::write(unbind, busid))
                        .await
                        .context("unbind task failed")?
                        .context("failed to unbind current driver")?;
                }
                None => {}
            }
            self.bind_usbip_host_driver().await?;
        } else if self.sysfs_path.exists() {
            self.bind_usbip_host_driver().await?;
        }
        Ok(())
    }

    async fn bind_usbip_host_driver(&self) -> Result<()> {
        info!("binding USB device {} to driver \"usbip-host\"", self.busid);
        let driver = Path::new(SYSFS_USBIP_HOST);
        if !driver.exists() {
            exec("modprobe", &["usbip-host"]).await?;
        }
        let busid = self.busid.to_string();
        let match_busid = driver.join("match_busid");
        let bind = driver.join("bind");
        tokio::task::spawn_blocking(move || {
            std::fs::write(match_busid, format!("add {busid}"))?;
            std::fs::write(bind, busid)
        })
        .await
        .context("bind task failed")?
        .context("failed to bind usbip-host driver")?;
        Ok(())
    }

    /// Hand the device back to whatever driver normally claims it.
    pub async fn restore_default_driver(&self) {
        let driver_path = self.sysfs_path.join("driver");
        if driver_path.exists() {
            let is_usbip = tokio::fs::canonicalize(&driver_path)
                .await
                .map(|p| p.ends_with("usbip-host"))
                .unwrap_or(false);
            if !is_usbip {
                return;
            }
            info!("unbinding USB device {} from usbip-host", self.busid);
            let unbind = driver_path.join("unbind");
            let busid = self.busid.to_string();
            match tokio::task::spawn_blocking(move || std::fs::write(unbind, busid)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!("failed to unbind {}: {err}", self.busid);
                    return;
                }
                Err(err) => {
                    warn!("unbind task failed: {err}");
                    return;
                }
            }
        } else if !self.sysfs_path.exists() {
            return;
        }
        info!("binding USB device {} to default driver", self.busid);
        if let Err(err) = std::fs::write(SYSFS_DRIVERS_PROBE, self.busid.to_string()) {
            warn!("failed to probe default driver for {}: {err}", self.busid);
        }
    }

    /// Attach the kernel end of the export socket.
    async fn export(&self, fd: i32) -> Result<()> {
        let path = self.sysfs_path.join("usbip_sockfd");
        tokio::task::spawn_blocking(move || std::fs::write(path, format!("{fd}\n")))
            .await
            .context("export task failed")?
            .context("failed to write usbip_sockfd")?;
        Ok(())
    }

    /// End the export. Writing can block for a while and fails harmlessly
    /// if the device disappeared.
    async fn stop_export(&self) {
        let path = self.sysfs_path.join("usbip_sockfd");
        let result =
            tokio::task::spawn_blocking(move || std::fs::write(path, "-1\n")).await;
        match result {
            Ok(Ok(())) | Ok(Err(_)) => {}
            Err(err) => warn!("stop-export task failed: {err}"),
        }
        self.refresh();
    }
}

fn read_sysfs_u32(path: &Path, base: u32) -> Result<u32> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let trimmed = content.trim();
    u32::from_str_radix(trimmed, base)
        .with_context(|| format!("failed to parse {} as number: {trimmed:?}", path.display()))
}

async fn exec(program: &str, args: &[&str]) -> Result<()> {
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("failed to run {program}"))?;
    if !status.success() {
        bail!("{program} exited with {status}");
    }
    Ok(())
}

/// Path of the refresh fifo the uevent hook pokes for a bus id.
pub fn refresh_pipe_path(busid: &UsbId) -> PathBuf {
    Path::new(RUN_DIR).join(format!("usbip-refresh-{busid}"))
}

/// Serve the refresh fifo for one device: every write wakes its waiters.
/// Runs until cancelled; removes the fifo on exit.
pub async fn refresh_pipe_task(device: Arc<UsbIpDevice>) -> Result<()> {
    let pipe_path = refresh_pipe_path(device.busid());
    let tmp_path = pipe_path.with_extension("new");

    let _ = std::fs::remove_file(&tmp_path);
    nix::unistd::mkfifo(&tmp_path, nix::sys::stat::Mode::from_bits_truncate(0o622))
        .context("failed to create refresh fifo")?;
    std::fs::rename(&tmp_path, &pipe_path).context("failed to move refresh fifo into place")?;

    struct RemoveOnDrop(PathBuf);
    impl Drop for RemoveOnDrop {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }
    let _guard = RemoveOnDrop(pipe_path.clone());

    // Opening read-write keeps the fifo open across writers.
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&pipe_path)
        .context("failed to open refresh fifo")?;
    let mut file = tokio::fs::File::from_std(file);

    let mut buf = [0u8; 4096];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            continue;
        }
        debug!("refresh poke for {}", device.busid());
        device.refresh();
    }
}

/// The uevent hook: invoked by the device manager for every USB device
/// add event. Managed devices get a refresh poke; everything else is
/// probed by its default driver, so nothing is probed twice.
pub fn handle_uevent(devpath: &str) -> Result<()> {
    let devname = Path::new(devpath)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if devname.is_empty() {
        bail!("invalid devpath: {devpath:?}");
    }

    let pipe = Path::new(RUN_DIR).join(format!("usbip-refresh-{devname}"));
    if pipe.exists() {
        std::fs::write(&pipe, ".").with_context(|| format!("failed to poke {}", pipe.display()))?;
    } else {
        info!("loading default driver: {devname}");
        std::fs::write(SYSFS_DRIVERS_PROBE, &devname)
            .context("failed to write drivers_probe")?;
    }
    Ok(())
}

/// Serves the USB/IP side of `usb:` tunnels.
pub struct UsbIpServer {
    devices: HashMap<UsbId, Arc<UsbIpDevice>>,
}

impl UsbIpServer {
    pub fn new(devices: Vec<Arc<UsbIpDevice>>) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|d| (d.busid().clone(), d))
                .collect(),
        }
    }

    pub fn device(&self, busid: &UsbId) -> Option<Arc<UsbIpDevice>> {
        self.devices.get(busid).cloned()
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<UsbIpDevice>> {
        self.devices.values()
    }

    /// Handle one established `usb:` tunnel for `device`.
    ///
    /// Waits for the device interruptibly (a closing tunnel abandons the
    /// wait), then exports it through a socketpair and relays URBs until
    /// the tunnel or the kernel gives up.
    pub async fn handle_tunnel<S>(&self, device: Arc<UsbIpDevice>, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let header = OpHeader::read_from(&mut stream).await?;
        match header.code {
            OP_REQ_DEVLIST => {
                let attrs = device.read_attrs()?;
                let interfaces = device.read_interfaces();
                usbip::write_devlist_reply(&mut stream, &[(attrs, interfaces)]).await?;
                return Ok(());
            }
            OP_REQ_IMPORT => {}
            other => {
                usbip::write_import_error(&mut stream).await?;
                bail!("unexpected USB/IP opcode: {other:#06x}");
            }
        }

        let busid = usbip::read_import_busid(&mut stream).await?;
        if busid != device.busid().as_str() {
            usbip::write_import_error(&mut stream).await?;
            bail!("unexpected bus id: {busid:?}");
        }

        info!("client requests device at {}", device.busid());
        device.refresh();

        // Block until the device can be exported, but notice the client
        // hanging up. Data before the reply is a protocol violation.
        let mut probe = [0u8; 1];
        let _export_guard = loop {
            tokio::select! {
                result = device.wait_available() => result?,
                read = stream.read(&mut probe) => {
                    return match read {
                        Ok(0) => {
                            info!("client stopped waiting for {}", device.busid());
                            Ok(())
                        }
                        Ok(_) => bail!("unexpected data while waiting for device"),
                        Err(err) => Err(err.into()),
                    };
                }
            }

            // Another tunnel may have claimed the device in the meantime;
            // re-check under the export lock.
            let guard = device.export_lock.lock().await;
            if device.is_available() {
                break guard;
            }
        };

        let attrs = device.read_attrs()?;
        let (kernel_side, user_side) = UnixStream::pair()?;

        // The kernel takes its own reference on the fd; ours closes with
        // the std stream.
        let kernel_std = kernel_side.into_std()?;
        kernel_std.set_nonblocking(false)?;
        device.export(kernel_std.as_raw_fd()).await?;
        drop(kernel_std);

        usbip::write_import_reply(&mut stream, &attrs).await?;
        info!("exported device {}", device.busid());

        let result = relay_urbs(stream, user_side).await;
        device.stop_export().await;
        info!("export of {} ended", device.busid());
        result
    }
}

/// Seqnums of URBs submitted to the kernel but not yet answered, with the
/// direction needed to size their replies.
#[derive(Default)]
struct InFlight {
    urbs: HashMap<u32, u32>,
    /// unlink request seqnum -> target seqnum
    unlinks: HashMap<u32, u32>,
}

/// Relay URB frames between the tunnel and the kernel's end of the export
/// socket. When the tunnel dies, outstanding URBs are unlinked before the
/// export is torn down.
pub async fn relay_urbs<T, K>(tunnel: T, kernel: K) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    K: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tunnel_read, tunnel_write) = tokio::io::split(tunnel);
    let (kernel_read, mut kernel_write) = tokio::io::split(kernel);

    let in_flight = Arc::new(Mutex::new(InFlight::default()));

    let mut from_kernel = tokio::spawn(kernel_to_tunnel(
        kernel_read,
        tunnel_write,
        in_flight.clone(),
    ));

    let client_result = tokio::select! {
        result = tunnel_to_kernel(tunnel_read, &mut kernel_write, in_flight.clone()) => result,
        joined = &mut from_kernel => {
            // Kernel side ended first; nothing left to unlink.
            return joined.context("kernel relay task failed")?;
        }
    };

    // The tunnel is gone: cancel whatever the kernel still owes us.
    let pending: Vec<u32> = {
        let in_flight = in_flight.lock().expect("in-flight lock poisoned");
        in_flight.urbs.keys().copied().collect()
    };
    if !pending.is_empty() {
        debug!("unlinking {} in-flight URBs", pending.len());
        static UNLINK_SEQNUM: AtomicU32 = AtomicU32::new(0xfff0_0000);
        for target in pending {
            let header = UrbHeader {
                command: USBIP_CMD_UNLINK,
                seqnum: UNLINK_SEQNUM.fetch_add(1, Ordering::Relaxed),
                devid: 0,
                direction: 0,
                ep: 0,
            };
            let body = UrbBody::CmdUnlink {
                unlink_seqnum: target,
            };
            if usbip::write_urb(&mut kernel_write, &header, &body, &[])
                .await
                .is_err()
            {
                break;
            }
        }
    }

    from_kernel.abort();
    client_result
}

async fn tunnel_to_kernel<R, W>(
    mut tunnel: R,
    kernel: &mut W,
    in_flight: Arc<Mutex<InFlight>>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let (header, body) = match usbip::read_urb_header(&mut tunnel).await {
            Ok(frame) => frame,
            Err(protocol::UsbIpError::Io(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                return Ok(())
            }
            Err(err) => return Err(err.into()),
        };

        let payload_len = match body {
            UrbBody::CmdSubmit(ref cmd) => cmd.payload_len(header.direction),
            UrbBody::CmdUnlink { .. } => 0,
            // Replies never travel from the client to the device.
            UrbBody::RetSubmit(_) | UrbBody::RetUnlink { .. } => {
                bail!("unexpected reply frame from tunnel")
            }
        };
        let mut payload = vec![0u8; payload_len];
        tunnel.read_exact(&mut payload).await?;

        {
            let mut in_flight = in_flight.lock().expect("in-flight lock poisoned");
            match body {
                UrbBody::CmdSubmit(_) => {
                    in_flight.urbs.insert(header.seqnum, header.direction);
                }
                UrbBody::CmdUnlink { unlink_seqnum } => {
                    in_flight.unlinks.insert(header.seqnum, unlink_seqnum);
                }
                _ => unreachable!(),
            }
        }

        usbip::write_urb(kernel, &header, &body, &payload).await?;
    }
}

async fn kernel_to_tunnel<R, W>(
    mut kernel: R,
    mut tunnel: W,
    in_flight: Arc<Mutex<InFlight>>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let (header, body) = match usbip::read_urb_header(&mut kernel).await {
            Ok(frame) => frame,
            Err(protocol::UsbIpError::Io(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                return Ok(())
            }
            Err(err) => return Err(err.into()),
        };

        let payload_len = match body {
            UrbBody::RetSubmit(ref ret) => {
                let direction = {
                    let mut in_flight = in_flight.lock().expect("in-flight lock poisoned");
                    in_flight.urbs.remove(&header.seqnum)
                };
                match direction {
                    Some(direction) => ret.payload_len(direction),
                    None => {
                        // Reply for an URB we never tracked; assume the
                        // header direction (0 for kernel replies).
                        warn!("reply for unknown seqnum {}", header.seqnum);
                        ret.payload_len(header.direction)
                    }
                }
            }
            UrbBody::RetUnlink { status } => {
                let mut in_flight = in_flight.lock().expect("in-flight lock poisoned");
                if let Some(target) = in_flight.unlinks.remove(&header.seqnum) {
                    // -ECONNRESET means the URB was unlinked before it
                    // completed; its reply will never arrive.
                    if status == -104 {
                        in_flight.urbs.remove(&target);
                    }
                }
                0
            }
            UrbBody::CmdSubmit(_) | UrbBody::CmdUnlink { .. } => {
                bail!("unexpected command frame from kernel")
            }
        };

        let mut payload = vec![0u8; payload_len];
        kernel.read_exact(&mut payload).await?;
        usbip::write_urb(&mut tunnel, &header, &body, &payload).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::usbip::{
        CmdSubmit, RetSubmit, USBIP_CMD_SUBMIT, USBIP_DIR_IN, USBIP_DIR_OUT, USBIP_RET_SUBMIT,
    };

    fn submit_header(seqnum: u32, direction: u32) -> (UrbHeader, UrbBody) {
        (
            UrbHeader {
                command: USBIP_CMD_SUBMIT,
                seqnum,
                devid: 0x0001_0004,
                direction,
                ep: 1,
            },
            UrbBody::CmdSubmit(CmdSubmit {
                transfer_flags: 0,
                transfer_buffer_length: if direction == USBIP_DIR_OUT { 4 } else { 64 },
                start_frame: 0,
                number_of_packets: 0,
                interval: 0,
                setup: [0; 8],
            }),
        )
    }

    #[tokio::test]
    async fn test_relay_submit_and_reply() {
        let (client, tunnel_side) = tokio::io::duplex(4096);
        let (kernel_side, fake_kernel) = tokio::io::duplex(4096);

        let relay = tokio::spawn(relay_urbs(tunnel_side, kernel_side));

        // Client submits an IN URB.
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (header, body) = submit_header(7, USBIP_DIR_IN);
        usbip::write_urb(&mut client_write, &header, &body, &[])
            .await
            .unwrap();

        // Kernel sees it and answers with 4 bytes of data.
        let (mut kernel_read, mut kernel_write) = tokio::io::split(fake_kernel);
        let (got_header, _got_body) = usbip::read_urb_header(&mut kernel_read).await.unwrap();
        assert_eq!(got_header.seqnum, 7);

        let ret_header = UrbHeader {
            command: USBIP_RET_SUBMIT,
            seqnum: 7,
            devid: 0,
            direction: 0,
            ep: 0,
        };
        let ret = RetSubmit {
            status: 0,
            actual_length: 4,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
        };
        usbip::write_urb(&mut kernel_write, &ret_header, &UrbBody::RetSubmit(ret), b"data")
            .await
            .unwrap();

        // The client receives the reply with its payload, even though the
        // reply header itself carries no direction.
        let (reply_header, reply_body) = usbip::read_urb_header(&mut client_read).await.unwrap();
        assert_eq!(reply_header.seqnum, 7);
        let ret = match reply_body {
            UrbBody::RetSubmit(ret) => ret,
            other => panic!("expected RetSubmit, got {other:?}"),
        };
        assert_eq!(ret.actual_length, 4);
        let mut payload = [0u8; 4];
        client_read.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"data");

        drop(client_read);
        drop(client_write);
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relay_unlinks_in_flight_on_close() {
        let (client, tunnel_side) = tokio::io::duplex(4096);
        let (kernel_side, fake_kernel) = tokio::io::duplex(4096);

        let relay = tokio::spawn(relay_urbs(tunnel_side, kernel_side));

        let (_client_read, mut client_write) = tokio::io::split(client);
        let (header, body) = submit_header(9, USBIP_DIR_OUT);
        usbip::write_urb(&mut client_write, &header, &body, b"ping")
            .await
            .unwrap();

        let (mut kernel_read, _kernel_write) = tokio::io::split(fake_kernel);
        let (got_header, got_body) = usbip::read_urb_header(&mut kernel_read).await.unwrap();
        assert_eq!(got_header.seqnum, 9);
        let cmd = match got_body {
            UrbBody::CmdSubmit(cmd) => cmd,
            other => panic!("expected CmdSubmit, got {other:?}"),
        };
        let mut payload = vec![0u8; cmd.payload_len(got_header.direction)];
        kernel_read.read_exact(&mut payload).await.unwrap();
        assert_eq!(payload, b"ping");

        // Tunnel dies without a reply: the relay must unlink seqnum 9.
        drop(_client_read);
        drop(client_write);

        let (unlink_header, unlink_body) = usbip::read_urb_header(&mut kernel_read).await.unwrap();
        assert_eq!(unlink_header.command, USBIP_CMD_UNLINK);
        assert_eq!(unlink_body, UrbBody::CmdUnlink { unlink_seqnum: 9 });

        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relay_rejects_reply_from_client() {
        let (client, tunnel_side) = tokio::io::duplex(4096);
        let (kernel_side, _fake_kernel) = tokio::io::duplex(4096);

        let relay = tokio::spawn(relay_urbs(tunnel_side, kernel_side));

        let (_client_read, mut client_write) = tokio::io::split(client);
        let header = UrbHeader {
            command: USBIP_RET_SUBMIT,
            seqnum: 1,
            devid: 0,
            direction: 0,
            ep: 0,
        };
        let ret = RetSubmit {
            status: 0,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
        };
        usbip::write_urb(&mut client_write, &header, &UrbBody::RetSubmit(ret), &[])
            .await
            .unwrap();

        assert!(relay.await.unwrap().is_err());
    }

    #[test]
    fn test_read_attrs_from_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("3-2");
        std::fs::create_dir(&dev).unwrap();
        for (name, value) in [
            ("busnum", "3\n"),
            ("devnum", "7\n"),
            ("speed", "480\n"),
            ("idVendor", "0403\n"),
            ("idProduct", "6001\n"),
            ("bcdDevice", "0600\n"),
            ("bDeviceClass", "00\n"),
            ("bDeviceSubClass", "00\n"),
            ("bDeviceProtocol", "00\n"),
            ("bNumConfigurations", "1\n"),
            // bConfigurationValue left empty on purpose: unconfigured
            // devices have an empty attribute.
            ("bConfigurationValue", "\n"),
            ("bNumInterfaces", "1\n"),
        ] {
            std::fs::write(dev.join(name), value).unwrap();
        }

        let device = UsbIpDevice::with_sysfs_root("3-2".parse().unwrap(), dir.path());
        let attrs = device.read_attrs().unwrap();
        assert_eq!(attrs.busnum, 3);
        assert_eq!(attrs.devnum, 7);
        assert_eq!(attrs.devid(), (3 << 16) | 7);
        assert_eq!(attrs.speed_class(), DeviceSpeed::High);
        assert_eq!(attrs.id_vendor, 0x0403);
        assert_eq!(attrs.configuration_value, 0);
    }

    #[tokio::test]
    async fn test_wait_available_wakes_on_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("1-1");
        std::fs::create_dir(&dev).unwrap();

        let device = Arc::new(UsbIpDevice::with_sysfs_root("1-1".parse().unwrap(), dir.path()));

        let waiter = {
            let device = device.clone();
            tokio::spawn(async move { device.wait_available().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        // Device becomes available, uevent hook pokes.
        std::fs::write(dev.join("usbip_status"), "1\n").unwrap();
        device.refresh();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap()
            .unwrap();
    }
}

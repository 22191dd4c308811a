//! TAP device access and configuration.
//!
//! The device is opened through `/dev/net/tun` with packet information
//! enabled: every read carries a four-byte `{flags, proto}` prefix ahead of
//! the Ethernet frame, and writes prepend the same prefix. Link state,
//! address and MAC are applied through the configured OS helper; any failing
//! setup step is fatal to the node.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::process::Command;
use tracing::info;

use crate::error::{Error, Result};
use crate::frame::MacAddr;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;

/// Packet-info flag reported by the kernel when the frame did not fit the
/// read buffer.
const TUN_PKT_STRIP: u16 = 0x0001;

/// Packet-info prefix: flags (host order) and EtherType (network order).
const PI_LEN: usize = 4;

/// Read buffer: prefix plus an MTU-sized frame with headroom.
const READ_BUF: usize = 4096;

#[repr(C)]
struct IfReq {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// One frame lifted off the TAP device.
#[derive(Debug, Clone)]
pub struct TapFrame {
    /// The raw Ethernet frame.
    pub data: Vec<u8>,
    /// EtherType reported in the packet-info prefix.
    pub proto: u16,
    /// The frame did not fit the read buffer.
    pub truncated: bool,
}

/// Read/write access to the local L2 interface.
#[async_trait]
pub trait FrameIo: Send + Sync {
    /// Wait for the next frame written to the interface by the host.
    async fn read_frame(&self) -> Result<TapFrame>;

    /// Inject a frame into the interface, visible to the host.
    async fn write_frame(&self, frame: &[u8], proto: u16) -> Result<()>;
}

/// A TAP interface backed by `/dev/net/tun`.
#[derive(Debug)]
pub struct TapDevice {
    fd: AsyncFd<File>,
    name: String,
}

impl TapDevice {
    /// Open a TAP device with the given name.
    pub fn open(name: &str) -> Result<Self> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(Error::Device(format!("interface name {} too long", name)));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(|e| Error::Device(format!("failed to open /dev/net/tun: {}", e)))?;

        let mut req = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TAP,
            _pad: [0; 22],
        };
        for (dst, src) in req.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = *src;
        }
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut req) };
        if rc < 0 {
            return Err(Error::Device(format!(
                "TUNSETIFF failed for {}: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }

        // Non-blocking so the fd can drive AsyncFd.
        unsafe {
            let raw = file.as_raw_fd();
            let flags = libc::fcntl(raw, libc::F_GETFL);
            if flags < 0 || libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(Error::Device(format!(
                    "failed to set {} non-blocking: {}",
                    name,
                    std::io::Error::last_os_error()
                )));
            }
        }

        let fd = AsyncFd::new(file)?;
        info!("{} TAP device created", name);
        Ok(TapDevice {
            fd,
            name: name.to_string(),
        })
    }

    /// Bring the link up and assign the overlay address and MAC through the
    /// OS helper. Any failing step is fatal to the node.
    pub async fn configure(&self, iptool: &str, ip: Ipv4Addr, mac: MacAddr) -> Result<()> {
        run_helper(iptool, &["link", "set", "dev", &self.name, "up"]).await?;
        info!("setting {}/24 on device {}", ip, self.name);
        run_helper(
            iptool,
            &["addr", "add", &format!("{}/24", ip), "dev", &self.name],
        )
        .await?;
        info!("setting {} on device {}", mac, self.name);
        run_helper(
            iptool,
            &["link", "set", "dev", &self.name, "address", &mac.to_string()],
        )
        .await?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

async fn run_helper(iptool: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(iptool)
        .args(args)
        .status()
        .await
        .map_err(|e| Error::Device(format!("failed to run {}: {}", iptool, e)))?;
    if !status.success() {
        return Err(Error::Device(format!(
            "{} {} exited with {}",
            iptool,
            args.join(" "),
            status
        )));
    }
    Ok(())
}

#[async_trait]
impl FrameIo for TapDevice {
    async fn read_frame(&self) -> Result<TapFrame> {
        loop {
            let mut guard = self.fd.readable().await?;
            let mut buf = vec![0u8; READ_BUF];
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(&mut buf)
            }) {
                Ok(Ok(n)) if n >= PI_LEN => {
                    let flags = u16::from_ne_bytes([buf[0], buf[1]]);
                    let proto = u16::from_be_bytes([buf[2], buf[3]]);
                    buf.truncate(n);
                    let data = buf.split_off(PI_LEN);
                    return Ok(TapFrame {
                        data,
                        proto,
                        truncated: flags & TUN_PKT_STRIP != 0,
                    });
                }
                Ok(Ok(n)) => {
                    return Err(Error::Device(format!(
                        "short read of {} bytes from {}",
                        n, self.name
                    )));
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_frame(&self, frame: &[u8], proto: u16) -> Result<()> {
        let mut buf = Vec::with_capacity(PI_LEN + frame.len());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        buf.extend_from_slice(&proto.to_be_bytes());
        buf.extend_from_slice(frame);
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(&buf)
            }) {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

//! Raw socket to the kernel's Bluetooth management interface.
//!
//! The management API is reached through a raw HCI socket bound to the
//! control channel rather than to a device. The socket is non-blocking and
//! close-on-exec; readers wait for data in short poll windows so shutdown is
//! observed without closing the descriptor under a blocked read.
//!
//! See https://git.kernel.org/pub/scm/bluetooth/bluez.git/tree/doc/mgmt-api.txt

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{anyhow, Result};
use tracing::{debug, error, trace};

use crate::config;
use crate::state;

const AF_BLUETOOTH: libc::c_int = 31;
const BTPROTO_HCI: libc::c_int = 1;
const HCI_DEV_NONE: u16 = 0xffff;
const HCI_CHANNEL_CONTROL: u16 = 3;

#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

/// Outcome of a single non-blocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were read into the buffer.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// The read was interrupted by a signal.
    Interrupted,
    /// The peer closed the channel (zero-length read).
    Closed,
}

/// Outcome of waiting for readable data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Data is readable.
    Ready,
    /// The run state advanced past `Running`.
    Shutdown,
    /// The socket reported an unrecoverable error.
    Error,
}

/// The management control socket. Shared between the event thread (reads)
/// and command senders (writes), so the descriptor lives in an atomic.
#[derive(Debug)]
pub struct HciSocket {
    fd: AtomicI32,
}

impl Default for HciSocket {
    fn default() -> HciSocket {
        HciSocket { fd: AtomicI32::new(-1) }
    }
}

impl HciSocket {
    pub fn new() -> HciSocket {
        HciSocket::default()
    }

    /// Open and bind the control-channel socket. Reconnects from scratch if
    /// a previous connection exists.
    pub fn connect(&self) -> Result<()> {
        self.disconnect();

        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(self.errno_error("socket"));
        }

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: HCI_DEV_NONE,
            hci_channel: HCI_CHANNEL_CONTROL,
        };
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const SockaddrHci as *const libc::sockaddr,
                std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = self.errno_error("bind");
            unsafe { libc::close(fd) };
            return Err(err);
        }

        self.fd.store(fd, Ordering::SeqCst);
        debug!("connected to HCI control socket (fd = {})", fd);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.fd.load(Ordering::SeqCst) >= 0
    }

    pub fn disconnect(&self) {
        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd >= 0 {
            debug!("HCI socket disconnecting");
            if unsafe { libc::close(fd) } != 0 {
                error!("{}", self.errno_error("close"));
            }
            trace!("HCI socket closed");
        }
    }

    /// Read one batch of management frames into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        if buf.len() > config::RESPONSE_MAX_SIZE {
            return Err(anyhow!(
                "read request of {} bytes exceeds the {} byte frame cap",
                buf.len(),
                config::RESPONSE_MAX_SIZE
            ));
        }
        let fd = self.fd.load(Ordering::SeqCst);
        if fd < 0 {
            return Err(anyhow!("HCI socket is not connected"));
        }

        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            let errno = io::Error::last_os_error();
            return match errno.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => Ok(ReadOutcome::WouldBlock),
                Some(libc::EINTR) => {
                    debug!("HCI socket receive interrupted");
                    Ok(ReadOutcome::Interrupted)
                }
                _ => Err(self.errno_error("recv")),
            };
        }
        if n == 0 {
            error!("peer closed the HCI socket");
            return Ok(ReadOutcome::Closed);
        }

        trace!("read {} bytes from HCI socket", n);
        Ok(ReadOutcome::Data(n as usize))
    }

    /// Write one management frame.
    pub fn write(&self, frame: &[u8]) -> Result<()> {
        let fd = self.fd.load(Ordering::SeqCst);
        if fd < 0 {
            return Err(anyhow!("HCI socket is not connected"));
        }

        trace!("writing {} bytes to HCI socket", frame.len());
        let n = unsafe { libc::write(fd, frame.as_ptr() as *const libc::c_void, frame.len()) };
        if n != frame.len() as isize {
            return Err(self.errno_error("write"));
        }
        Ok(())
    }

    /// Block in short poll windows until data arrives, the server begins
    /// shutting down, or the socket errors out.
    pub fn wait_for_data_or_shutdown(&self, poll_interval_ms: u64) -> WaitOutcome {
        while state::is_server_running() {
            let fd = self.fd.load(Ordering::SeqCst);
            if fd < 0 {
                return WaitOutcome::Error;
            }

            let mut pollfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pollfd, 1, poll_interval_ms as libc::c_int) };

            if rc > 0 {
                if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                    error!("HCI socket poll reported error events: {:#x}", pollfd.revents);
                    return WaitOutcome::Error;
                }
                return WaitOutcome::Ready;
            }
            if rc < 0 {
                let errno = io::Error::last_os_error();
                if errno.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                error!("{}", self.errno_error("poll"));
                return WaitOutcome::Error;
            }
            // Timeout; check the run state and keep waiting.
        }

        WaitOutcome::Shutdown
    }

    fn errno_error(&self, operation: &str) -> anyhow::Error {
        let errno = io::Error::last_os_error();
        let mut detail = errno.to_string();
        if errno.raw_os_error() == Some(libc::EAGAIN) {
            detail.push_str(" or not enough permission for this operation");
        }
        anyhow!(
            "error on Bluetooth management socket during {} operation: {}",
            operation,
            detail
        )
    }
}

impl Drop for HciSocket {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_socket_rejects_io() {
        let socket = HciSocket::new();
        assert!(!socket.is_connected());

        let mut buf = [0u8; 16];
        assert!(socket.read(&mut buf).is_err());
        assert!(socket.write(&[0u8; 6]).is_err());
    }

    #[test]
    fn test_oversized_read_is_an_error() {
        let socket = HciSocket::new();
        let mut buf = vec![0u8; config::RESPONSE_MAX_SIZE + 1];
        assert!(socket.read(&mut buf).is_err());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let socket = HciSocket::new();
        socket.disconnect();
        socket.disconnect();
        assert!(!socket.is_connected());
    }
}

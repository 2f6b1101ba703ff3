use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{self, c_void};

/// Counter-backed wakeup descriptor.
///
/// Created with `EFD_CLOEXEC | EFD_NONBLOCK`, so a write to an
/// already-saturated counter reports `WouldBlock` instead of stalling
/// the caller.
#[derive(Debug)]
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new() -> io::Result<EventFd> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;

        Ok(EventFd { fd })
    }

    /// Reads and resets the 8-byte counter.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let n = syscall!(read(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len()))?;

        if n as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("eventfd read returned {} bytes instead of 8", n),
            ));
        }

        Ok(u64::from_ne_bytes(buf))
    }

    /// Adds `val` to the counter, waking any poller watching the descriptor.
    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf = val.to_ne_bytes();
        let n = syscall!(write(self.fd, buf.as_ptr() as *const c_void, buf.len()))?;

        if n as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("eventfd write wrote {} bytes instead of 8", n),
            ));
        }

        Ok(())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod test {
    use super::EventFd;

    #[test]
    fn write_and_read() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(123).unwrap();
        let count = eventfd.read().unwrap();
        assert_eq!(123, count);
    }

    #[test]
    fn write_accumulates() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(1).unwrap();
        eventfd.write(1).unwrap();
        assert_eq!(2, eventfd.read().unwrap());
    }

    #[test]
    fn write_saturated() {
        let eventfd = EventFd::new().unwrap();

        assert!(eventfd.write(0xfffffffffffffffe).is_ok());
        // counter is full, a nonblocking write must fail with WouldBlock
        assert!(eventfd.write(0xfffffffffffffffe).is_err());
    }
}

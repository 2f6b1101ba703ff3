use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{self, c_int, c_void, socklen_t};

pub fn setsockopt<T>(fd: RawFd, level: c_int, opt: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        fd,
        level,
        opt,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;

    Ok(())
}

pub fn getsockopt<T: Copy>(fd: RawFd, level: c_int, opt: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        fd,
        level,
        opt,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;

    Ok(slot)
}

fn to_sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    sin
}

fn from_sockaddr_in(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
    SocketAddrV4::new(ip, u16::from_be(sin.sin_port))
}

/// An owned stream socket descriptor, closed on drop.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Creates a non-blocking, close-on-exec IPv4 stream socket.
    pub fn new_nonblocking_stream() -> io::Result<Socket> {
        let fd = syscall!(socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0
        ))?;

        Ok(Socket { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn bind(&self, addr: SocketAddrV4) -> io::Result<()> {
        let sin = to_sockaddr_in(addr);
        syscall!(bind(
            self.fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as socklen_t
        ))?;

        Ok(())
    }

    pub fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.fd, 1024))?;

        Ok(())
    }

    /// Accepts one pending connection; the returned socket is already
    /// non-blocking and close-on-exec.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddrV4)> {
        let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        let fd = syscall!(accept4(
            self.fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
        ))?;

        Ok((Socket { fd }, from_sockaddr_in(&storage)))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddrV4> {
        let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        syscall!(getsockname(
            self.fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len
        ))?;

        Ok(from_sockaddr_in(&storage))
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = syscall!(write(self.fd, buf.as_ptr() as *const c_void, buf.len()))?;

        Ok(n as usize)
    }

    /// Half-close: shuts down the write direction, the read side stays open.
    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd, libc::SHUT_WR))?;

        Ok(())
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        setsockopt(self.fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as c_int)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        setsockopt(self.fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as c_int)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        setsockopt(self.fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as c_int)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        setsockopt(self.fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as c_int)
    }

    /// Fetches and clears the pending socket error, if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self.fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
    use std::thread;
    use std::time::Duration;

    use super::Socket;

    #[test]
    fn bind_listen_accept() {
        let listener = Socket::new_nonblocking_stream().unwrap();
        listener.set_reuse_addr(true).unwrap();
        listener
            .bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .unwrap();
        listener.listen().unwrap();

        let addr = listener.local_addr().unwrap();
        assert_eq!(*addr.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(addr.port(), 0);

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"ping").unwrap();
        });

        // the listener is non-blocking, poll until the connection lands
        let (conn, peer) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        };

        assert_eq!(*peer.ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(conn.local_addr().unwrap().port(), addr.port());
        assert!(conn.take_error().unwrap().is_none());

        client.join().unwrap();
    }
}

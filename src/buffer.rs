use std::io;
use std::os::unix::io::RawFd;

use libc::{self, c_void};

/// Reserved space in front of the readable region, for protocol fields
/// prepended after the payload is known.
pub const CHEAP_PREPEND: usize = 8;

/// Initial writable capacity behind the prepend region.
pub const INITIAL_SIZE: usize = 1024;

/// A growable byte buffer shaped `[ prepend | readable | writable ]`.
///
/// Appends go in at the write cursor, reads come off the read cursor, and
/// a full drain snaps both cursors back to the prepend boundary.
/// [`read_fd`](Buffer::read_fd) scatter-reads into the writable region
/// plus a 64 KiB stack buffer, so a burst lands in one syscall without
/// pre-sizing every connection for the worst case.
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Consumes up to `len` readable bytes. Draining everything resets
    /// both cursors to the prepend boundary.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let len = len.min(self.readable_bytes());
        let result =
            String::from_utf8_lossy(&self.buf[self.reader_index..self.reader_index + len])
                .into_owned();
        self.retrieve(len);
        result
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Makes room for `len` more bytes: reclaim the space readers already
    /// consumed when that suffices, otherwise grow the backing storage.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }

        if self.prependable_bytes() + self.writable_bytes() >= len + CHEAP_PREPEND {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        } else {
            self.buf.resize(self.writer_index + len, 0);
        }
    }

    /// Scatter-reads from `fd` into the writable region plus a 64 KiB
    /// stack buffer; overflow is appended afterwards. Returns the byte
    /// count from the read, 0 meaning end of stream.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();

        let mut vec = [
            libc::iovec {
                iov_base: self.buf[self.writer_index..].as_mut_ptr() as *mut c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut c_void,
                iov_len: extrabuf.len(),
            },
        ];
        let iovcnt = if writable > extrabuf.len() { 1 } else { 2 };

        let n = syscall!(readv(fd, vec.as_mut_ptr(), iovcnt))? as usize;

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }

        Ok(n)
    }

    /// One write from the readable region. The cursor is not advanced;
    /// callers retrieve what was actually written.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = syscall!(write(
            fd,
            self.peek().as_ptr() as *const c_void,
            self.readable_bytes()
        ))?;

        Ok(n as usize)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};

    #[test]
    fn append_and_retrieve() {
        let mut buffer = Buffer::new();
        assert_eq!(buffer.readable_bytes(), 0);
        assert_eq!(buffer.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND);

        buffer.append(b"hello, ");
        buffer.append(b"world");
        assert_eq!(buffer.peek(), b"hello, world");

        assert_eq!(buffer.retrieve_as_string(7), "hello, ");
        assert_eq!(buffer.readable_bytes(), 5);
        assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND + 7);

        // full drain resets the cursors
        assert_eq!(buffer.retrieve_all_as_string(), "world");
        assert_eq!(buffer.readable_bytes(), 0);
        assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buffer.writable_bytes(), INITIAL_SIZE);
    }

    #[test]
    fn capacity_is_conserved_by_retrieve() {
        let mut buffer = Buffer::new();
        buffer.append(&[b'x'; 300]);
        buffer.retrieve(100);

        let capacity = buffer.buf.len();
        assert_eq!(
            buffer.readable_bytes() + buffer.writable_bytes() + buffer.prependable_bytes(),
            capacity
        );

        buffer.retrieve(200);
        assert_eq!(buffer.readable_bytes(), 0);
        assert_eq!(
            buffer.writable_bytes() + buffer.prependable_bytes(),
            capacity
        );
    }

    #[test]
    fn ensure_writable_reclaims_before_growing() {
        let mut buffer = Buffer::new();
        buffer.append(&[b'a'; 800]);
        buffer.retrieve(600);

        let capacity_before = buffer.buf.len();
        // 200 readable remain, 224 writable; reclaiming the 608 consumed
        // bytes makes room without reallocating
        buffer.append(&[b'b'; 400]);
        assert_eq!(buffer.buf.len(), capacity_before);
        assert_eq!(buffer.readable_bytes(), 600);
        assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND);

        // no slack left for this one, the storage must grow
        buffer.append(&[b'c'; 2000]);
        assert!(buffer.buf.len() > capacity_before);
        assert_eq!(buffer.readable_bytes(), 2600);

        let mut expected = vec![b'a'; 200];
        expected.extend_from_slice(&[b'b'; 400]);
        expected.extend_from_slice(&[b'c'; 2000]);
        assert_eq!(buffer.peek(), expected.as_slice());
    }

    fn read_fd_round_trip(initial: usize, total: usize) {
        let (reader, mut writer) = UnixStream::pair().unwrap();

        let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let sender = thread::spawn(move || {
            writer.write_all(&payload).unwrap();
            // dropping the stream sends EOF
        });

        let mut buffer = Buffer::with_capacity(initial);
        loop {
            match buffer.read_fd(reader.as_raw_fd()) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => panic!("read_fd failed: {}", e),
            }
        }

        sender.join().unwrap();
        assert_eq!(buffer.readable_bytes(), total);
        assert_eq!(buffer.peek(), expected.as_slice());
    }

    #[test]
    fn read_fd_small_payload() {
        read_fd_round_trip(INITIAL_SIZE, 100);
    }

    #[test]
    fn read_fd_crosses_the_stack_buffer() {
        // far beyond the initial writable capacity and the 64 KiB overflow
        read_fd_round_trip(INITIAL_SIZE, 300_000);
    }

    #[test]
    fn read_fd_at_the_overflow_boundary() {
        // writable region exactly the size of the stack buffer: the
        // overflow iovec stays in play for that first read
        read_fd_round_trip(65536, 200_000);
    }
}

//! Application-level byte buffer fronting scatter reads and deferred writes.
//!
//! A buffer is logically split into three regions by two cursors:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes  |  readable bytes  |  writable bytes  |
//! |                    |     (content)    |                  |
//! +-------------------+------------------+------------------+
//! 0        <=       reader      <=      writer      <=     len
//! ```

use std::io;
use std::os::fd::RawFd;

use crate::sys::syscall;

/// Headroom reserved at the front of every buffer so fixed-size headers can
/// be prepended without copying the payload.
pub const CHEAP_PREPEND: usize = 8;
/// Initial size of the writable region on construction.
pub const INITIAL_SIZE: usize = 1024;

const EXTRA_BUF_SIZE: usize = 65536;

#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0u8; CHEAP_PREPEND + initial_size],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    fn begin_write_mut(&mut self) -> &mut [u8] {
        let writer = self.writer;
        &mut self.buf[writer..]
    }

    pub fn find_crlf(&self) -> Option<usize> {
        self.find_crlf_from(0)
    }

    /// Searches for `\r\n` starting `offset` bytes into the readable region.
    pub fn find_crlf_from(&self, offset: usize) -> Option<usize> {
        let hay = self.peek();
        if offset > hay.len() {
            return None;
        }
        hay[offset..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| offset + p)
    }

    pub fn find_eol(&self) -> Option<usize> {
        self.find_eol_from(0)
    }

    pub fn find_eol_from(&self, offset: usize) -> Option<usize> {
        let hay = self.peek();
        if offset > hay.len() {
            return None;
        }
        hay[offset..].iter().position(|&b| b == b'\n').map(|p| offset + p)
    }

    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Retrieves up to (but not including) the given absolute offset into
    /// the readable region, as returned by `find_crlf`/`find_eol`.
    pub fn retrieve_until(&mut self, offset: usize) {
        self.retrieve(offset);
    }

    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    pub fn retrieve_as_string(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let result = self.peek()[..len].to_vec();
        self.retrieve(len);
        result
    }

    pub fn retrieve_all_as_string(&mut self) -> Vec<u8> {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let writer = self.writer;
        self.buf[writer..writer + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.writer += len;
    }

    pub fn unwrite(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.writer -= len;
    }

    pub fn append_i64(&mut self, x: i64) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i32(&mut self, x: i32) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i16(&mut self, x: i16) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i8(&mut self, x: i8) {
        self.append(&x.to_be_bytes());
    }

    pub fn peek_i64(&self) -> i64 {
        assert!(self.readable_bytes() >= 8);
        i64::from_be_bytes(self.peek()[..8].try_into().unwrap())
    }

    pub fn peek_i32(&self) -> i32 {
        assert!(self.readable_bytes() >= 4);
        i32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    pub fn peek_i16(&self) -> i16 {
        assert!(self.readable_bytes() >= 2);
        i16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }

    pub fn peek_i8(&self) -> i8 {
        assert!(self.readable_bytes() >= 1);
        self.peek()[0] as i8
    }

    pub fn read_i64(&mut self) -> i64 {
        let v = self.peek_i64();
        self.retrieve(8);
        v
    }

    pub fn read_i32(&mut self) -> i32 {
        let v = self.peek_i32();
        self.retrieve(4);
        v
    }

    pub fn read_i16(&mut self) -> i16 {
        let v = self.peek_i16();
        self.retrieve(2);
        v
    }

    pub fn read_i8(&mut self) -> i8 {
        let v = self.peek_i8();
        self.retrieve(1);
        v
    }

    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader -= data.len();
        let reader = self.reader;
        self.buf[reader..reader + data.len()].copy_from_slice(data);
    }

    pub fn prepend_i64(&mut self, x: i64) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_i32(&mut self, x: i32) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_i16(&mut self, x: i16) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_i8(&mut self, x: i8) {
        self.prepend(&x.to_be_bytes());
    }

    /// Shrinks storage to the minimum needed to hold the readable region
    /// plus `reserve` bytes of headroom, reclaiming over-grown capacity.
    pub fn shrink(&mut self, reserve: usize) {
        let mut other = Buffer::new();
        other.ensure_writable(self.readable_bytes() + reserve);
        other.append(self.peek());
        std::mem::swap(self, &mut other);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer + len, 0);
        } else {
            debug_assert!(CHEAP_PREPEND < self.reader);
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = self.reader + readable;
        }
    }

    /// Scatter-reads from `fd` into the writable region, spilling any
    /// residual past it into a 64 KiB stack buffer and appending that back
    /// in, so a single `readv(2)` call can absorb up to ~64 KiB even when
    /// the writable region itself is tiny.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.begin_write_mut().as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let iovcnt = if writable < extra.len() { 2 } else { 1 };

        let n = syscall!(readv(fd, iov.as_mut_ptr(), iovcnt as libc::c_int))?;
        let n = n as usize;

        if n <= writable {
            self.has_written(n);
        } else {
            let len = self.buf.len();
            self.writer = len;
            self.append(&extra[..n - writable]);
        }

        Ok(n)
    }
}

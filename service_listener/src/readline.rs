use crate::*;

use nix::{errno::Errno, unistd::read};
use std::{
    io,
    os::unix::io::{AsRawFd, RawFd},
};

/// Result of a read that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome
{
    /// A record of this many bytes is available. For [`DelimitedReader::read_one`]
    /// the delimiter is not counted, and the bytes are at
    /// [`DelimitedReader::record`]; for [`DelimitedReader::read_bytes`] this is
    /// the number of bytes copied out.
    Record(usize),
    /// Nothing arrived within the timeout.
    TimedOut,
    /// The peer closed the connection.
    Closed,
}

/// What [`DelimitedReader::append`] did with its input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Appended
{
    /// How many input bytes were taken into the buffer.
    pub consumed: usize,
    /// Whether a complete record is now buffered.
    pub ready: bool,
    /// Whether the buffer is full without holding a complete record, or input
    /// was left over for lack of space.
    pub exhausted: bool,
}

/// Splits a byte stream into delimited records using one fixed buffer.
///
/// The buffer is supplied by the caller and never grows. After a record is
/// returned, any bytes that followed it stay in the buffer and seed the next
/// call, which returns the next complete record without touching the
/// descriptor.
pub struct DelimitedReader<B>
{
    buf: B,
    // Bytes of `buf` holding data.
    filled: usize,
    // Leading bytes belonging to the last record returned, delimiter included.
    consumed: usize,
    record_len: usize,
    delimiter: Vec<u8>,
    timeout_ms: i32,
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> DelimitedReader<B>
{
    /// `timeout_ms` bounds each wait for data; negative waits forever.
    ///
    /// # Panics
    ///
    /// If `delimiter` is empty.
    pub fn new(buf: B, delimiter: &[u8], timeout_ms: i32) -> Self
    {
        assert!(!delimiter.is_empty(), "record delimiter can't be empty");
        Self {
            buf,
            filled: 0,
            consumed: 0,
            record_len: 0,
            delimiter: delimiter.to_vec(),
            timeout_ms,
        }
    }

    pub fn capacity(&self) -> usize
    {
        self.buf.as_ref().len()
    }

    pub fn delimiter(&self) -> &[u8]
    {
        &self.delimiter
    }

    /// Change the delimiter for subsequent records. Bytes already buffered are
    /// searched again with the new delimiter.
    pub fn set_delimiter(&mut self, delimiter: &[u8])
    {
        assert!(!delimiter.is_empty(), "record delimiter can't be empty");
        self.delimiter = delimiter.to_vec();
    }

    pub fn set_timeout(&mut self, timeout_ms: i32)
    {
        self.timeout_ms = timeout_ms;
    }

    /// The record most recently returned by `read_one` or `next_buffered`.
    pub fn record(&self) -> &[u8]
    {
        &self.buf.as_ref()[..self.record_len]
    }

    /// Bytes buffered but not yet returned as part of a record.
    pub fn leftover(&self) -> usize
    {
        self.filled - self.consumed
    }

    /// Forget everything buffered.
    pub fn reset(&mut self)
    {
        self.filled = 0;
        self.consumed = 0;
        self.record_len = 0;
    }

    // Drop the last returned record from the front of the buffer.
    fn compact(&mut self)
    {
        if self.consumed > 0
        {
            self.buf.as_mut().copy_within(self.consumed..self.filled, 0);
            self.filled -= self.consumed;
            self.consumed = 0;
        }
        self.record_len = 0;
    }

    fn find_delimiter(&self, from: usize) -> Option<usize>
    {
        let data = &self.buf.as_ref()[..self.filled];
        let dlen = self.delimiter.len();
        if data.len() < dlen
        {
            return None;
        }
        (from..=data.len() - dlen).find(|&i| data[i..i + dlen] == self.delimiter[..])
    }

    // With the buffer compacted, take a complete record off the front if
    // there is one. `from` is where the search may start.
    fn take_record(&mut self, from: usize) -> Option<usize>
    {
        let position = self.find_delimiter(from)?;
        self.record_len = position;
        self.consumed = position + self.delimiter.len();
        Some(position)
    }

    /// Return the next buffered record without reading, if one is complete.
    pub fn next_buffered(&mut self) -> Option<usize>
    {
        self.compact();
        self.take_record(0)
    }

    /// Copy `bytes` into the buffer as though they had been read.
    pub fn append(&mut self, bytes: &[u8]) -> Appended
    {
        self.compact();

        let space = self.capacity() - self.filled;
        let consumed = space.min(bytes.len());
        let start = self.filled;
        self.buf.as_mut()[start..start + consumed].copy_from_slice(&bytes[..consumed]);
        self.filled += consumed;

        let ready = self.find_delimiter(0).is_some();
        let exhausted = consumed < bytes.len() || (self.filled == self.capacity() && !ready);
        Appended { consumed, ready, exhausted }
    }

    /// Read from `source` until a whole record is buffered and return it.
    ///
    /// Only the first complete record is returned; any that follow it in the
    /// same read are returned by later calls without reading again.
    pub fn read_one(&mut self, source: &impl AsRawFd) -> Result<ReadOutcome, ReadError>
    {
        self.compact();
        let fd = source.as_raw_fd();
        let mut search_from = 0;

        loop
        {
            if let Some(len) = self.take_record(search_from)
            {
                return Ok(ReadOutcome::Record(len));
            }

            let capacity = self.capacity();
            if self.filled == capacity
            {
                tracing::debug!(capacity, "read buffer exhausted without a delimiter");
                return Err(ReadError::BufferExhausted { capacity });
            }

            // A delimiter may straddle the old and new data.
            search_from = (self.filled + 1).saturating_sub(self.delimiter.len());

            let start = self.filled;
            match self.fill(fd, start)?
            {
                ReadOutcome::Record(n) => self.filled += n,
                other => return Ok(other),
            }
        }
    }

    fn fill(&mut self, fd: RawFd, start: usize) -> Result<ReadOutcome, ReadError>
    {
        let timeout_ms = self.timeout_ms;
        read_with_timeout(fd, &mut self.buf.as_mut()[start..], timeout_ms)
    }

    /// Read up to `out.len()` raw bytes, taking leftover buffered bytes first.
    ///
    /// Used by protocols that switch from delimited records to counted
    /// payloads partway through a stream.
    pub fn read_bytes(&mut self, source: &impl AsRawFd, out: &mut [u8]) -> Result<ReadOutcome, ReadError>
    {
        self.compact();

        if self.filled > 0
        {
            let n = self.filled.min(out.len());
            out[..n].copy_from_slice(&self.buf.as_ref()[..n]);
            self.consumed = n;
            self.compact();
            return Ok(ReadOutcome::Record(n));
        }

        read_with_timeout(source.as_raw_fd(), out, self.timeout_ms)
    }
}

fn read_with_timeout(fd: RawFd, out: &mut [u8], timeout_ms: i32) -> Result<ReadOutcome, ReadError>
{
    if !socket::wait_readable(fd, timeout_ms)?
    {
        return Ok(ReadOutcome::TimedOut);
    }

    loop
    {
        return match read(fd, out)
        {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Record(n)),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => Ok(ReadOutcome::TimedOut),
            Err(Errno::ECONNRESET) => Ok(ReadOutcome::Closed),
            Err(e) => Err(ReadError::Io(io::Error::from_raw_os_error(e as i32))),
        };
    }
}

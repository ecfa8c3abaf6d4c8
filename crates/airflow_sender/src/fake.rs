use std::collections::VecDeque;
use std::io::{self, Read, Write};

use crate::session::SerialLink;

/// One scripted outcome of a `read` call.
pub enum FakeRead {
    Data(Vec<u8>),
    /// Already buffered when the session next discards input.
    Stale(Vec<u8>),
    /// Read timed out with nothing on the line.
    Idle,
    Fail(io::ErrorKind),
}

impl FakeRead {
    pub fn data(text: &str) -> Self {
        FakeRead::Data(text.as_bytes().to_vec())
    }

    pub fn stale(text: &str) -> Self {
        FakeRead::Stale(text.as_bytes().to_vec())
    }
}

/// Minimal fake serial port used in tests to script reads and capture writes.
///
/// A `Data` entry larger than the caller's buffer is served across several
/// reads. Once the script runs out every read returns `Ok(0)`.
#[derive(Default)]
pub struct FakePort {
    script: VecDeque<FakeRead>,
    written: Vec<u8>,
    fail_writes: bool,
}

impl FakePort {
    pub fn new(script: Vec<FakeRead>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    pub fn fail_writes(&mut self) {
        self.fail_writes = true;
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }

    pub fn pending_reads(&self) -> usize {
        self.script.len()
    }

    /// Copies what fits into `buf` and keeps the rest at the front of the script.
    fn serve(
        &mut self,
        mut bytes: Vec<u8>,
        buf: &mut [u8],
        wrap: fn(Vec<u8>) -> FakeRead,
    ) -> usize {
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        if n < bytes.len() {
            self.script.push_front(wrap(bytes.split_off(n)));
        }
        n
    }
}

impl SerialLink for FakePort {
    fn discard_input(&mut self) -> io::Result<()> {
        while matches!(self.script.front(), Some(FakeRead::Stale(_))) {
            self.script.pop_front();
        }
        Ok(())
    }
}

impl Read for FakePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.script.pop_front() {
            Some(FakeRead::Data(bytes)) => Ok(self.serve(bytes, buf, FakeRead::Data)),
            Some(FakeRead::Stale(bytes)) => Ok(self.serve(bytes, buf, FakeRead::Stale)),
            Some(FakeRead::Idle) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle")),
            Some(FakeRead::Fail(kind)) => Err(io::Error::new(kind, "scripted failure")),
            None => Ok(0),
        }
    }
}

impl Write for FakePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted failure"));
        }
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_data_is_served_in_pieces() {
        let mut fake = FakePort::new(vec![FakeRead::data("abcdef")]);
        let mut buf = [0u8; 4];
        assert_eq!(fake.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(fake.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(fake.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn discard_drops_only_buffered_input() {
        let mut fake = FakePort::new(vec![
            FakeRead::stale("old\r"),
            FakeRead::stale("older\r"),
            FakeRead::data("new\r"),
        ]);
        fake.discard_input().unwrap();
        assert_eq!(fake.pending_reads(), 1);
        let mut buf = [0u8; 8];
        assert_eq!(fake.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"new\r");
    }

    #[test]
    fn writes_are_captured() {
        let mut fake = FakePort::default();
        fake.write_all(b"A\r").unwrap();
        assert_eq!(fake.written(), b"A\r");
    }
}

//! Newline-framed pipe transport.
//!
//! Carries the supervisor/worker protocol over plain pipes. Reads retry on
//! EINTR and support non-blocking mode on the supervisor side, so a worker
//! that stops talking can never stall a reconciliation tick.

use std::io::{self, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{F_GETFL, F_SETFL, OFlag, fcntl};

/// Retry a nix call until it stops reporting EINTR.
fn retry<T>(mut op: impl FnMut() -> nix::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            Ok(v) => return Ok(v),
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
}

/// One end of a pipe.
pub struct Pipe {
    fd: OwnedFd,
}

impl Pipe {
    pub fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Claim a descriptor this process inherited but does not otherwise own,
    /// such as its own stdin in worker mode.
    ///
    /// # Safety
    /// `fd` must be open and must not be closed by anything else for the
    /// lifetime of the returned value.
    pub unsafe fn claim_raw(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    /// Put the descriptor into non-blocking mode.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        let bits = retry(|| fcntl(&self.fd, F_GETFL))?;
        let flags = OFlag::from_bits_retain(bits) | OFlag::O_NONBLOCK;
        retry(|| fcntl(&self.fd, F_SETFL(flags)))?;
        Ok(())
    }
}

impl AsFd for Pipe {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Pipe {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        retry(|| nix::unistd::read(&self.fd, buf))
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        retry(|| nix::unistd::write(&self.fd, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// What a [`FrameReader`] found on its last poll.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A whole newline-terminated frame, terminator stripped.
    Complete(String),
    /// Bytes may be buffered but no terminator has arrived yet.
    Incomplete,
    /// The peer closed its end; nothing more will arrive.
    Eof,
}

/// Reads newline-delimited frames, tolerating partial reads.
pub struct FrameReader {
    pipe: Pipe,
    pending: Vec<u8>,
    at_eof: bool,
}

impl FrameReader {
    pub fn new(pipe: Pipe) -> Self {
        Self {
            pipe,
            pending: Vec::with_capacity(4096),
            at_eof: false,
        }
    }

    pub fn pipe(&self) -> &Pipe {
        &self.pipe
    }

    /// Pull the next frame if one is available.
    ///
    /// On a non-blocking pipe this returns [`Frame::Incomplete`] instead of
    /// waiting. A CR before the terminator is stripped along with it.
    pub fn try_next(&mut self) -> io::Result<Frame> {
        loop {
            if let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
                let rest = self.pending.split_off(end + 1);
                let mut frame = std::mem::replace(&mut self.pending, rest);
                frame.truncate(frame.len() - 1);
                if frame.ends_with(b"\r") {
                    frame.truncate(frame.len() - 1);
                }
                return Ok(Frame::Complete(String::from_utf8_lossy(&frame).into_owned()));
            }
            if self.at_eof {
                return Ok(Frame::Eof);
            }

            let mut chunk = [0u8; 4096];
            match self.pipe.read(&mut chunk) {
                Ok(0) => self.at_eof = true,
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Frame::Incomplete),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Writes newline-terminated frames, flushing after each one so the peer
/// sees them promptly.
pub struct FrameWriter {
    out: BufWriter<Pipe>,
}

impl FrameWriter {
    pub fn new(pipe: Pipe) -> Self {
        Self {
            out: BufWriter::new(pipe),
        }
    }

    pub fn send(&mut self, frame: &str) -> io::Result<()> {
        self.out.write_all(frame.as_bytes())?;
        if !frame.ends_with('\n') {
            self.out.write_all(b"\n")?;
        }
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (FrameReader, FrameWriter) {
        let (rx, tx) = nix::unistd::pipe().expect("pipe");
        (
            FrameReader::new(Pipe::from_owned(rx)),
            FrameWriter::new(Pipe::from_owned(tx)),
        )
    }

    #[test]
    fn test_frames_arrive_in_order() {
        let (mut rx, mut tx) = pipe_pair();
        tx.send("first").unwrap();
        tx.send("second\n").unwrap();
        drop(tx);

        assert_eq!(rx.try_next().unwrap(), Frame::Complete("first".into()));
        assert_eq!(rx.try_next().unwrap(), Frame::Complete("second".into()));
        assert_eq!(rx.try_next().unwrap(), Frame::Eof);
        // Eof is sticky
        assert_eq!(rx.try_next().unwrap(), Frame::Eof);
    }

    #[test]
    fn test_partial_frame_stays_incomplete() {
        let (mut rx, mut tx) = pipe_pair();
        rx.pipe().set_nonblocking().unwrap();

        assert_eq!(rx.try_next().unwrap(), Frame::Incomplete);
        tx.out.get_mut().write_all(b"spl").unwrap();
        assert_eq!(rx.try_next().unwrap(), Frame::Incomplete);
        tx.out.get_mut().write_all(b"it\n").unwrap();
        assert_eq!(rx.try_next().unwrap(), Frame::Complete("split".into()));
    }

    #[test]
    fn test_crlf_terminator_is_stripped() {
        let (mut rx, mut tx) = pipe_pair();
        tx.send("dos\r\n").unwrap();
        assert_eq!(rx.try_next().unwrap(), Frame::Complete("dos".into()));
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let (mut rx, mut tx) = pipe_pair();
        tx.send("a\nb").unwrap();
        assert_eq!(rx.try_next().unwrap(), Frame::Complete("a".into()));
        assert_eq!(rx.try_next().unwrap(), Frame::Complete("b".into()));
    }

    #[test]
    fn test_empty_frame() {
        let (mut rx, mut tx) = pipe_pair();
        tx.send("").unwrap();
        assert_eq!(rx.try_next().unwrap(), Frame::Complete("".into()));
    }
}

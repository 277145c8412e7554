//! Waits for the handover child to report on the signal pipe.
//!
//! This is a pure reader: it returns whatever the child wrote before closing
//! its end. Deciding what the bytes mean is the coordinator's job.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("reading the signal pipe failed: {0}")]
    Io(#[from] io::Error),

    #[error("child did not answer within {0:?}")]
    TimedOut(Duration),
}

/// A bound on the whole handshake, from the payload write to the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    /// Expires `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    /// Time left, or `TimedOut` once expired.
    fn remaining(&self) -> Result<Duration, HandshakeError> {
        let remaining = self.at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HandshakeError::TimedOut(self.timeout));
        }
        Ok(remaining)
    }
}

/// Write all of `bytes` to the child's config pipe.
///
/// Without a deadline this is a blocking `write_all`. With one, the pipe is
/// switched to non-blocking mode so a child that never reads cannot hold us
/// past the deadline.
pub fn deliver<W>(
    mut writer: W,
    bytes: &[u8],
    deadline: Option<Deadline>,
) -> Result<(), HandshakeError>
where
    W: Write + AsFd,
{
    let Some(deadline) = deadline else {
        writer.write_all(bytes)?;
        return Ok(());
    };

    set_nonblocking(&writer)?;
    let mut written = 0;
    while written < bytes.len() {
        match writer.write(&bytes[written..]) {
            Ok(0) => return Err(HandshakeError::Io(io::ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if !wait_ready(&writer, libc::POLLOUT, deadline.remaining()?)? {
                    return Err(HandshakeError::TimedOut(deadline.timeout));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read `reader` to end-of-stream.
///
/// With `timeout` unset this blocks until every writer has closed the pipe.
/// With a timeout, the wait is bounded from the moment of the call.
pub fn await_ready<R>(reader: R, timeout: Option<Duration>) -> Result<Vec<u8>, HandshakeError>
where
    R: Read + AsFd,
{
    await_ready_by(reader, timeout.map(Deadline::after))
}

/// [`await_ready`] against a deadline that may already be running.
pub fn await_ready_by<R>(
    mut reader: R,
    deadline: Option<Deadline>,
) -> Result<Vec<u8>, HandshakeError>
where
    R: Read + AsFd,
{
    let Some(deadline) = deadline else {
        let mut answer = Vec::new();
        reader.read_to_end(&mut answer)?;
        return Ok(answer);
    };

    let mut answer = Vec::new();
    let mut chunk = [0u8; 512];

    loop {
        if !wait_ready(&reader, libc::POLLIN, deadline.remaining()?)? {
            return Err(HandshakeError::TimedOut(deadline.timeout));
        }

        match reader.read(&mut chunk) {
            Ok(0) => return Ok(answer),
            Ok(n) => answer.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Poll for `events` (hangup and errors always count). Returns false on
/// timeout.
fn wait_ready<F: AsFd>(fd: &F, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd: fd.as_fd().as_raw_fd(),
        events,
        revents: 0,
    };
    // Round up so a sub-millisecond remainder still waits.
    let millis = timeout
        .as_millis()
        .saturating_add(u128::from(timeout.subsec_nanos() % 1_000_000 != 0))
        .min(libc::c_int::MAX as u128) as libc::c_int;

    loop {
        // SAFETY: `pollfd` is a valid, initialized array of length 1.
        let ready = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if ready >= 0 {
            return Ok(ready > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn set_nonblocking<F: AsFd>(fd: &F) -> io::Result<()> {
    let raw = fd.as_fd().as_raw_fd();
    // SAFETY: fcntl on a borrowed, open descriptor.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_without_writing_is_empty() {
        let (reader, writer) = io::pipe().unwrap();
        drop(writer);
        let answer = await_ready(reader, None).unwrap();
        assert!(answer.is_empty());
    }

    #[test]
    fn test_ok_then_close() {
        let (reader, mut writer) = io::pipe().unwrap();
        writer.write_all(b"OK").unwrap();
        drop(writer);
        let answer = await_ready(reader, None).unwrap();
        assert_eq!(answer, b"OK");
    }

    #[test]
    fn test_writer_on_another_thread() {
        let (reader, mut writer) = io::pipe().unwrap();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            writer.write_all(b"O").unwrap();
            std::thread::sleep(Duration::from_millis(20));
            writer.write_all(b"K").unwrap();
        });
        let answer = await_ready(reader, Some(Duration::from_secs(5))).unwrap();
        handle.join().unwrap();
        assert_eq!(answer, b"OK");
    }

    #[test]
    fn test_timeout_fires_while_writer_open() {
        let (reader, _writer) = io::pipe().unwrap();
        let started = Instant::now();
        let err = await_ready(reader, Some(Duration::from_millis(100))).unwrap_err();
        assert!(matches!(err, HandshakeError::TimedOut(_)));
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn test_timeout_with_partial_answer() {
        let (reader, mut writer) = io::pipe().unwrap();
        writer.write_all(b"OK").unwrap();
        let err = await_ready(reader, Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, HandshakeError::TimedOut(_)));
    }

    #[test]
    fn test_deliver_to_reader_thread() {
        let (mut reader, writer) = io::pipe().unwrap();
        let bytes = vec![7u8; 1 << 20];
        let handle = std::thread::spawn(move || {
            let mut received = Vec::new();
            reader.read_to_end(&mut received).unwrap();
            received
        });

        deliver(&writer, &bytes, Some(Deadline::after(Duration::from_secs(10)))).unwrap();
        drop(writer);
        assert_eq!(handle.join().unwrap(), bytes);
    }

    #[test]
    fn test_deliver_times_out_when_nobody_reads() {
        let (_reader, writer) = io::pipe().unwrap();
        let started = Instant::now();
        let err = deliver(
            &writer,
            &vec![0u8; 1 << 20],
            Some(Deadline::after(Duration::from_millis(100))),
        )
        .unwrap_err();
        assert!(matches!(err, HandshakeError::TimedOut(t) if t == Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_deliver_to_closed_reader_fails() {
        let (reader, writer) = io::pipe().unwrap();
        drop(reader);
        let err = deliver(&writer, b"payload", Some(Deadline::after(Duration::from_secs(1))))
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Io(_)));
    }

    #[test]
    fn test_expired_deadline_shared_with_answer() {
        let (reader, _writer) = io::pipe().unwrap();
        let deadline = Deadline::after(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(40));
        let err = await_ready_by(reader, Some(deadline)).unwrap_err();
        assert!(matches!(err, HandshakeError::TimedOut(t) if t == Duration::from_millis(20)));
    }
}

//! Child side of a handover: adopt the listeners the parent passed down.
//!
//! The child finds the handoff payload on standard input, the signal pipe at
//! descriptor 3, and one listening socket per payload entry at the position
//! the entry names. Listeners are adopted by address, not by position.
//!
//! Errors are returned rather than panicking so the caller can exit cleanly;
//! the signal pipe is closed unanswered whenever this value is dropped
//! without [`InheritedListeners::ready`], which the parent reads as failure.

use crate::payload::{HandoffPayload, PayloadError};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use thiserror::Error;
use tracing::{debug, info};

/// Descriptor position of the signal pipe's write end in the child.
pub const SIGNAL_FD: RawFd = 3;

/// Written to the signal pipe once every listener is serving.
const READY: &[u8] = b"OK";

#[derive(Debug, Error)]
pub enum InheritError {
    #[error("descriptor {0} is not open; not launched by a handover")]
    MissingSignalPipe(RawFd),

    #[error("reading the handoff payload failed: {0}")]
    Payload(#[from] PayloadError),

    #[error("inherited descriptor {fd} for {address} is not a socket")]
    NotASocket { address: String, fd: RawFd },

    #[error("inherited descriptor I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Listeners and configuration received from the parent process.
pub struct InheritedListeners {
    config: Vec<u8>,
    /// Address → descriptor, for listeners not yet taken.
    pending: BTreeMap<String, OwnedFd>,
    signal: Option<OwnedFd>,
}

impl std::fmt::Debug for InheritedListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InheritedListeners")
            .field("config_len", &self.config.len())
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .field("answered", &self.signal.is_none())
            .finish()
    }
}

impl InheritedListeners {
    /// Receive the handoff: claim descriptor 3, then decode the payload
    /// from standard input and claim every descriptor it maps.
    pub fn receive() -> Result<Self, InheritError> {
        if !is_open(SIGNAL_FD) {
            return Err(InheritError::MissingSignalPipe(SIGNAL_FD));
        }
        // SAFETY: descriptor 3 is open and, by the handover contract, is the
        // signal pipe handed to this process alone.
        let signal = unsafe { OwnedFd::from_raw_fd(SIGNAL_FD) };
        set_cloexec(SIGNAL_FD)?;

        let payload = HandoffPayload::read_from(&mut io::stdin().lock())?;
        debug!(
            listeners = payload.listener_fds.len(),
            config_len = payload.config.len(),
            "Received handoff payload"
        );

        // SAFETY: payload indices are validated to be >= 4 and unique, and
        // the parent placed exactly one listener at each.
        unsafe { Self::adopt(payload, signal) }
    }

    /// # Safety
    ///
    /// Every index in `payload` must be an open descriptor owned by nothing
    /// else in this process.
    unsafe fn adopt(payload: HandoffPayload, signal: OwnedFd) -> Result<Self, InheritError> {
        payload.validate()?;

        let mut pending = BTreeMap::new();
        for (address, index) in payload.listener_fds {
            let fd = RawFd::try_from(index).map_err(|_| InheritError::NotASocket {
                address: address.clone(),
                fd: RawFd::MAX,
            })?;
            if !is_socket(fd) {
                return Err(InheritError::NotASocket { address, fd });
            }
            let owned = OwnedFd::from_raw_fd(fd);
            set_cloexec(fd)?;
            pending.insert(address, owned);
        }

        Ok(Self {
            config: payload.config,
            pending,
            signal: Some(signal),
        })
    }

    /// The configuration the parent asked us to serve.
    pub fn config(&self) -> &[u8] {
        &self.config
    }

    pub fn take_config(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.config)
    }

    /// Addresses still waiting to be taken.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.pending.keys().map(String::as_str)
    }

    /// Take the inherited listener for `address`, if the parent had one.
    ///
    /// The listener is in whatever blocking mode the parent left it in.
    pub fn take(&mut self, address: &str) -> Option<std::net::TcpListener> {
        let fd = self.pending.remove(address)?;
        let listener = std::net::TcpListener::from(fd);
        info!(
            address,
            local_addr = ?listener.local_addr().ok(),
            "Inherited listener from parent process"
        );
        Some(listener)
    }

    /// Tell the parent we are serving. Listeners not taken are closed first.
    pub fn ready(mut self) -> io::Result<()> {
        self.close_pending();
        if let Some(signal) = self.signal.take() {
            let mut pipe = std::fs::File::from(signal);
            pipe.write_all(READY)?;
            info!("Signalled readiness to parent process");
        }
        Ok(())
    }

    fn close_pending(&mut self) {
        for (address, fd) in std::mem::take(&mut self.pending) {
            info!(address, "Closing inherited listener not in new configuration");
            drop(fd);
        }
    }
}

impl Drop for InheritedListeners {
    fn drop(&mut self) {
        self.close_pending();
        if self.signal.take().is_some() {
            debug!("Closing signal pipe without answering");
        }
    }
}

fn fstat_mode(fd: RawFd) -> Option<libc::mode_t> {
    // SAFETY: fstat writes into a zeroed stat buffer we own.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    (result == 0).then_some(stat.st_mode)
}

fn is_open(fd: RawFd) -> bool {
    fstat_mode(fd).is_some()
}

fn is_socket(fd: RawFd) -> bool {
    fstat_mode(fd).is_some_and(|mode| mode & libc::S_IFMT == libc::S_IFSOCK)
}

/// Positions 3.. arrive without CLOEXEC; set it so a later handover or any
/// other child process does not inherit them implicitly.
fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor this process owns.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let result = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::{AsFd, AsRawFd, IntoRawFd};

    /// Build an inherited set from listeners bound in this process.
    fn inherited(
        addresses: &[&str],
    ) -> (InheritedListeners, Vec<std::net::SocketAddr>, io::PipeReader) {
        let mut listener_fds = BTreeMap::new();
        let mut bound = Vec::new();
        for address in addresses {
            let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            bound.push(socket.local_addr().unwrap());
            let fd = socket.into_raw_fd();
            listener_fds.insert(address.to_string(), fd as u32);
        }
        let (reader, writer) = io::pipe().unwrap();
        let payload = HandoffPayload::new(listener_fds, b"config".to_vec());
        let set = unsafe { InheritedListeners::adopt(payload, writer.into()) }.unwrap();
        (set, bound, reader)
    }

    #[test]
    fn test_take_by_address() {
        let (mut set, bound, _reader) = inherited(&[":8080", ":8443"]);
        assert_eq!(set.config(), b"config");
        assert_eq!(set.addresses().collect::<Vec<_>>(), vec![":8080", ":8443"]);

        let listener = set.take(":8443").unwrap();
        assert_eq!(listener.local_addr().unwrap(), bound[1]);
        assert!(set.take(":8443").is_none());
        assert!(set.take(":9999").is_none());
        assert_eq!(set.addresses().collect::<Vec<_>>(), vec![":8080"]);
    }

    #[test]
    fn test_adopted_descriptors_are_cloexec() {
        let (mut set, _bound, _reader) = inherited(&[":8080"]);
        let listener = set.take(":8080").unwrap();
        let flags = unsafe { libc::fcntl(listener.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_inherited_listener_accepts() {
        let (mut set, bound, _reader) = inherited(&[":8080"]);
        let listener = set.take(":8080").unwrap();
        let client = std::net::TcpStream::connect(bound[0]).unwrap();
        let (_server, peer) = listener.accept().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }

    #[test]
    fn test_ready_writes_answer_and_closes() {
        let (mut set, _bound, mut reader) = inherited(&[":8080"]);
        let _listener = set.take(":8080").unwrap();
        set.ready().unwrap();

        let mut answer = Vec::new();
        reader.read_to_end(&mut answer).unwrap();
        assert_eq!(answer, READY);
    }

    #[test]
    fn test_drop_without_ready_closes_unanswered() {
        let (set, _bound, mut reader) = inherited(&[":8080"]);
        drop(set);

        let mut answer = Vec::new();
        reader.read_to_end(&mut answer).unwrap();
        assert!(answer.is_empty());
    }

    #[test]
    fn test_unclaimed_listener_closed_on_ready() {
        let (set, bound, _reader) = inherited(&[":8080"]);
        set.ready().unwrap();
        // Nothing holds the socket any more, so the port stops listening.
        assert!(std::net::TcpStream::connect(bound[0]).is_err());
    }

    #[test]
    fn test_non_socket_rejected() {
        let (not_socket, _keep) = io::pipe().unwrap();
        let fd = OwnedFd::from(not_socket).into_raw_fd();
        let mut listener_fds = BTreeMap::new();
        listener_fds.insert(":8080".to_string(), fd as u32);
        let (_reader, writer) = io::pipe().unwrap();

        let err = unsafe {
            InheritedListeners::adopt(HandoffPayload::new(listener_fds, Vec::new()), writer.into())
        }
        .unwrap_err();
        assert!(matches!(err, InheritError::NotASocket { fd: f, .. } if f == fd));
        // adopt did not take ownership of the rejected descriptor.
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_socket_detection() {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(is_socket(socket.as_fd().as_raw_fd()));
        assert!(!is_socket(9999));
        assert!(!is_socket(-1));
        assert!(!is_open(-1));
    }
}

//! Builds the ordered descriptor table a handover child inherits.

use crate::payload::FIRST_LISTENER_FD;
use crate::registry::ListenerDescriptor;
use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

/// Descriptors in the exact order the child will see them, plus the
/// address → position mapping that goes into the payload.
///
/// The table owns every descriptor it holds. Dropping it after launch
/// closes the parent's copies of the config-pipe read end and the
/// signal-pipe write end, leaving the child as their only holder.
#[derive(Debug)]
pub struct DescriptorTable {
    fds: Vec<OwnedFd>,
    index: BTreeMap<String, u32>,
}

impl DescriptorTable {
    /// Assemble the table.
    ///
    /// Positions 0..=3 are fixed: config-pipe read end, this process's
    /// stdout, this process's stderr, signal-pipe write end. Listeners follow
    /// in the order given.
    pub fn build(
        config_reader: OwnedFd,
        signal_writer: OwnedFd,
        listeners: Vec<ListenerDescriptor>,
    ) -> io::Result<Self> {
        let stdout = io::stdout().as_fd().try_clone_to_owned()?;
        let stderr = io::stderr().as_fd().try_clone_to_owned()?;

        let mut fds = Vec::with_capacity(FIRST_LISTENER_FD as usize + listeners.len());
        fds.push(config_reader);
        fds.push(stdout);
        fds.push(stderr);
        fds.push(signal_writer);

        let mut index = BTreeMap::new();
        for listener in listeners {
            let position = u32::try_from(fds.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many listeners"))?;
            if index.insert(listener.address.clone(), position).is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("listener address {} registered twice", listener.address),
                ));
            }
            fds.push(listener.fd);
        }

        Ok(Self { fds, index })
    }

    /// Descriptors in table order.
    pub fn fds(&self) -> impl ExactSizeIterator<Item = BorrowedFd<'_>> {
        self.fds.iter().map(|fd| fd.as_fd())
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Address → absolute table position.
    pub fn index(&self) -> &BTreeMap<String, u32> {
        &self.index
    }

    pub fn into_index(self) -> BTreeMap<String, u32> {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::fd::AsRawFd;

    fn listener(address: &str) -> (TcpListener, ListenerDescriptor) {
        let socket = TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = socket.as_fd().try_clone_to_owned().unwrap();
        (
            socket,
            ListenerDescriptor {
                address: address.to_string(),
                fd,
            },
        )
    }

    fn pipes() -> (OwnedFd, OwnedFd) {
        let (config_reader, _) = io::pipe().unwrap();
        let (_, signal_writer) = io::pipe().unwrap();
        (config_reader.into(), signal_writer.into())
    }

    #[test]
    fn test_layout_with_listeners() {
        let (config_reader, signal_writer) = pipes();
        let config_raw = config_reader.as_raw_fd();
        let signal_raw = signal_writer.as_raw_fd();

        let mut sockets = Vec::new();
        let mut descriptors = Vec::new();
        for address in [":8080", ":8443", ":9000"] {
            let (s, d) = listener(address);
            sockets.push(s);
            descriptors.push(d);
        }
        let listener_raws: Vec<i32> = descriptors.iter().map(|d| d.fd.as_raw_fd()).collect();

        let table = DescriptorTable::build(config_reader, signal_writer, descriptors).unwrap();
        assert_eq!(table.len(), 3 + 4);

        let raws: Vec<i32> = table.fds().map(|fd| fd.as_raw_fd()).collect();
        assert_eq!(raws[0], config_raw);
        assert_eq!(raws[3], signal_raw);
        assert_eq!(&raws[4..], listener_raws.as_slice());

        assert_eq!(table.index()[":8080"], 4);
        assert_eq!(table.index()[":8443"], 5);
        assert_eq!(table.index()[":9000"], 6);
    }

    #[test]
    fn test_offsets_are_dense_for_any_count() {
        for n in 0..8u32 {
            let (config_reader, signal_writer) = pipes();
            let mut sockets = Vec::new();
            let mut descriptors = Vec::new();
            for i in 0..n {
                let (s, d) = listener(&format!("127.0.0.1:{}", 10_000 + i));
                sockets.push(s);
                descriptors.push(d);
            }

            let table = DescriptorTable::build(config_reader, signal_writer, descriptors).unwrap();
            assert_eq!(table.len(), n as usize + 4);

            let mut offsets: Vec<u32> = table.index().values().copied().collect();
            offsets.sort_unstable();
            assert_eq!(offsets, (4..4 + n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let (config_reader, signal_writer) = pipes();
        let (_a, first) = listener(":8080");
        let (_b, second) = listener(":8080");

        let err = DescriptorTable::build(config_reader, signal_writer, vec![first, second])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}

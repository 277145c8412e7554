//! Handoff payload sent from parent to child over the configuration pipe.
//!
//! Wire format (all integers big-endian):
//!
//! ```text
//! magic    4 bytes   "MOLT"
//! version  u8        1
//! count    u32       number of listener entries
//! entry    count × { addr_len u32, addr utf-8, index u32 }
//! cfg_len  u64
//! cfg      cfg_len bytes
//! ```
//!
//! Parent and child are always the same build, so there is exactly one
//! accepted version.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"MOLT";
const VERSION: u8 = 1;

/// First descriptor position available to listeners. Positions 0..=3 are
/// the config pipe, stdout, stderr and the signal pipe.
pub const FIRST_LISTENER_FD: u32 = 4;

const MAX_ADDRESS_LEN: u32 = 4096;
const MAX_LISTENERS: u32 = 65_536;
const MAX_CONFIG_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("not a handoff payload (bad magic)")]
    BadMagic,

    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u8),

    #[error("{what} length {len} exceeds limit {limit}")]
    TooLarge {
        what: &'static str,
        len: u64,
        limit: u64,
    },

    #[error("listener address is not valid UTF-8")]
    InvalidAddress,

    #[error("listener {address} mapped to reserved descriptor {index}")]
    ReservedIndex { address: String, index: u32 },

    #[error("descriptor {index} mapped to more than one listener")]
    DuplicateIndex { index: u32 },

    #[error("listener {address} appears more than once")]
    DuplicateAddress { address: String },
}

/// Everything the child needs to take over: which inherited descriptor
/// belongs to which address, and the configuration to serve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoffPayload {
    /// Listener address → absolute position in the child's descriptor table.
    pub listener_fds: BTreeMap<String, u32>,
    /// Raw configuration bytes.
    pub config: Vec<u8>,
}

impl HandoffPayload {
    pub fn new(listener_fds: BTreeMap<String, u32>, config: Vec<u8>) -> Self {
        Self {
            listener_fds,
            config,
        }
    }

    /// Check that every index is outside the reserved slots and unique.
    pub fn validate(&self) -> Result<(), PayloadError> {
        let mut seen = std::collections::BTreeSet::new();
        for (address, &index) in &self.listener_fds {
            if index < FIRST_LISTENER_FD {
                return Err(PayloadError::ReservedIndex {
                    address: address.clone(),
                    index,
                });
            }
            if !seen.insert(index) {
                return Err(PayloadError::DuplicateIndex { index });
            }
        }
        Ok(())
    }

    /// Encode into `w`. The writer is not flushed or closed.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), PayloadError> {
        self.validate()?;

        let count = u32::try_from(self.listener_fds.len())
            .ok()
            .filter(|&n| n <= MAX_LISTENERS)
            .ok_or(PayloadError::TooLarge {
                what: "listener count",
                len: self.listener_fds.len() as u64,
                limit: MAX_LISTENERS as u64,
            })?;

        let mut buf = Vec::with_capacity(16 + self.config.len());
        buf.extend_from_slice(MAGIC);
        buf.push(VERSION);
        buf.extend_from_slice(&count.to_be_bytes());

        for (address, index) in &self.listener_fds {
            let len = u32::try_from(address.len())
                .ok()
                .filter(|&n| n <= MAX_ADDRESS_LEN)
                .ok_or(PayloadError::TooLarge {
                    what: "listener address",
                    len: address.len() as u64,
                    limit: MAX_ADDRESS_LEN as u64,
                })?;
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(address.as_bytes());
            buf.extend_from_slice(&index.to_be_bytes());
        }

        let config_len = self.config.len() as u64;
        if config_len > MAX_CONFIG_LEN {
            return Err(PayloadError::TooLarge {
                what: "config",
                len: config_len,
                limit: MAX_CONFIG_LEN,
            });
        }
        buf.extend_from_slice(&config_len.to_be_bytes());
        buf.extend_from_slice(&self.config);

        w.write_all(&buf)?;
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Decode one payload from `r`. Trailing bytes are left unread.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, PayloadError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(PayloadError::BadMagic);
        }

        let version = read_u8(r)?;
        if version != VERSION {
            return Err(PayloadError::UnsupportedVersion(version));
        }

        let count = read_u32(r)?;
        check_limit("listener count", count as u64, MAX_LISTENERS as u64)?;

        let mut listener_fds = BTreeMap::new();
        for _ in 0..count {
            let len = read_u32(r)?;
            check_limit("listener address", len as u64, MAX_ADDRESS_LEN as u64)?;
            let mut raw = vec![0u8; len as usize];
            r.read_exact(&mut raw)?;
            let address = String::from_utf8(raw).map_err(|_| PayloadError::InvalidAddress)?;
            let index = read_u32(r)?;
            if listener_fds.contains_key(&address) {
                return Err(PayloadError::DuplicateAddress { address });
            }
            listener_fds.insert(address, index);
        }

        let config_len = read_u64(r)?;
        check_limit("config", config_len, MAX_CONFIG_LEN)?;
        let mut config = vec![0u8; config_len as usize];
        r.read_exact(&mut config)?;

        let payload = Self {
            listener_fds,
            config,
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Decode from a byte slice.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, PayloadError> {
        Self::read_from(&mut bytes)
    }
}

fn check_limit(what: &'static str, len: u64, limit: u64) -> Result<(), PayloadError> {
    if len > limit {
        return Err(PayloadError::TooLarge { what, len, limit });
    }
    Ok(())
}

fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

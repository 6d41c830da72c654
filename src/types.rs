use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("malformed netlink message: {0}")]
    MalformedMessage(String),
    #[error("netlink channel error: {0}")]
    Channel(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WatchError>;

// --- Address-change events ---

/// One kernel-reported address change, decoded from a single RTM_NEWADDR or
/// RTM_DELADDR message. Constructed by the decoder, consumed by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEvent {
    /// Kernel-assigned interface index.
    pub if_index: u32,
    pub address: IpAddr,
    pub prefix_len: u8,
    /// True for a withdrawal (RTM_DELADDR), false for an addition.
    pub is_deletion: bool,
    /// Interface label (IFA_LABEL), when the kernel supplies one. Used for
    /// display and for interface-name matching, never for cache keys.
    pub label: Option<String>,
    /// Seconds since the kernel created or last updated this address entry
    /// (from IFA_CACHEINFO). Absent when the message carries no cache info.
    pub age_secs: Option<u64>,
}

/// Identifies the interface a hook fires for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRef {
    pub index: u32,
    pub name: Option<String>,
}

impl fmt::Display for InterfaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "if{}", self.index),
        }
    }
}

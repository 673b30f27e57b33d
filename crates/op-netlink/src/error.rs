//! Error types for the netlink engine
//!
//! Every failure a caller can observe through a reply callback is one of
//! these kinds. Kernel error replies keep their numeric code verbatim.

use thiserror::Error;

/// Error code reserved for "control channel not initialized".
pub const NOT_INITIALIZED_CODE: i32 = -1;

/// Netlink engine errors
#[derive(Error, Debug)]
pub enum NetlinkError {
    // ========================================================================
    // Codec Errors
    // ========================================================================
    #[error("Malformed netlink message: {0}")]
    MalformedMessage(String),

    #[error("Unsupported attribute type {0}")]
    UnsupportedVariant(u16),

    #[error("Attribute nesting closed out of order or left open")]
    UnbalancedAttribute,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    #[error("Netlink error code {code}: {}", errno_message(*code))]
    Protocol { code: i32 },

    #[error("Generic Netlink family '{0}' not found")]
    FamilyNotFound(String),

    // ========================================================================
    // Connection Errors
    // ========================================================================
    #[error("Datapath connection not initialized")]
    NotInitialized,

    #[error("Netlink connection closed")]
    ConnectionClosed,

    #[error("Timeout waiting for reply to sequence {sequence}")]
    Timeout { sequence: u32 },

    #[error("Netlink socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using our error type
pub type Result<T> = std::result::Result<T, NetlinkError>;

impl NetlinkError {
    /// Create a malformed message error
    pub fn malformed(msg: impl Into<String>) -> Self {
        NetlinkError::MalformedMessage(msg.into())
    }

    /// Negative errno-style code for this error, when one applies.
    pub fn code(&self) -> Option<i32> {
        match self {
            NetlinkError::Protocol { code } => Some(*code),
            NetlinkError::NotInitialized => Some(NOT_INITIALIZED_CODE),
            NetlinkError::Timeout { .. } => Some(-libc::ETIMEDOUT),
            NetlinkError::ConnectionClosed => Some(-libc::ENOTCONN),
            NetlinkError::MalformedMessage(_) => Some(-libc::EBADMSG),
            NetlinkError::UnsupportedVariant(_) => Some(-libc::EOPNOTSUPP),
            NetlinkError::Io(e) => e.raw_os_error().map(|c| -c),
            _ => None,
        }
    }

    /// True when the error came from the kernel (or the header decoder)
    /// rather than from local state.
    pub fn is_protocol(&self) -> bool {
        matches!(self, NetlinkError::Protocol { .. })
    }

    /// Get a helpful suggestion for resolving this error
    pub fn suggestion(&self) -> &'static str {
        match self {
            NetlinkError::FamilyNotFound(_) => "Try: sudo modprobe openvswitch",
            NetlinkError::NotInitialized => "Wait for family resolution to complete",
            NetlinkError::Protocol { code } if *code == -libc::EPERM => {
                "Run as root or with CAP_NET_ADMIN"
            }
            NetlinkError::Timeout { .. } => "Increase the request timeout or check system load",
            NetlinkError::ConnectionClosed => "Open a new connection",
            _ => "Check system logs for more details",
        }
    }
}

/// Map netlink error codes to descriptive messages
pub fn errno_message(code: i32) -> &'static str {
    match -code {
        libc::EPERM => "Operation not permitted (EPERM)",
        libc::ENOENT => "No such file or directory (ENOENT)",
        libc::ENOMEM => "Out of memory (ENOMEM)",
        libc::EACCES => "Permission denied (EACCES)",
        libc::EBUSY => "Device or resource busy (EBUSY)",
        libc::EEXIST => "File exists (EEXIST)",
        libc::ENODEV => "No such device (ENODEV)",
        libc::EINVAL => "Invalid argument (EINVAL)",
        libc::EFBIG => "File too large (EFBIG)",
        libc::EPROTO => "Protocol error (EPROTO)",
        libc::EOPNOTSUPP => "Operation not supported (EOPNOTSUPP)",
        0 => "Success",
        _ => "Unknown error",
    }
}

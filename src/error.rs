// Devicecast - Error Types
// Centralized error handling for the session engine

use thiserror::Error;

/// Which of the three session streams an error relates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Control,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Audio => write!(f, "audio"),
            StreamKind::Control => write!(f, "control"),
        }
    }
}

/// Engine-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// No executable `adb` could be invoked.
    #[error("adb executable not found")]
    AdbMissing,

    /// An adb invocation exited non-zero.
    #[error("adb exited with status {exit}: {stderr}")]
    AdbInvocation { exit: i32, stderr: String },

    /// An adb invocation exceeded the wall-clock timeout.
    #[error("adb command timed out")]
    AdbTimeout,

    /// Operation requested on a serial the registry has never observed.
    #[error("unknown device: {serial}")]
    DeviceUnknown { serial: String },

    /// The server artifact could not be staged on the device.
    #[error("failed to stage server artifact: {0}")]
    ServerStage(String),

    /// `adb forward` failed.
    #[error("port forward failed: {0}")]
    PortForward(String),

    /// The server shell child died before any socket became connectable.
    #[error("server process exited before accepting connections: {0}")]
    ServerSpawn(String),

    /// A socket dial exceeded the connect timeout.
    #[error("{stream} socket connect timed out")]
    ConnectTimeout { stream: StreamKind },

    /// Protocol bytes inconsistent with the expected handshake.
    #[error("malformed {stream} handshake")]
    HandshakeMalformed { stream: StreamKind },

    /// The peer closed a stream.
    #[error("{stream} stream closed by peer")]
    StreamClosed { stream: StreamKind },

    /// A send was attempted before the handshake completed.
    #[error("session not connected")]
    NotConnected,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

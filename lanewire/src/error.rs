//! See [`ErrorLevel`].

/// Error level of a channel.
///
/// A channel that leaves [`ErrorLevel::None`] stops sending and receiving
/// until it is reset externally. No error is raised to the application
/// synchronously; the application polls the level and resets the channel
/// (usually by tearing down the connection) once a non-`None` level is
/// observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, thiserror::Error)]
pub enum ErrorLevel {
    /// No error. All is well.
    #[default]
    #[error("none")]
    None,
    /// The channel protocol has desynced and cannot recover: the receive
    /// queue overflowed or an impossible id/fragment combination arrived.
    /// The peer should be disconnected.
    #[error("desync")]
    Desync,
    /// The application tried to send a message but the send queue was full.
    /// Increase the send queue size, or send less.
    #[error("send queue full")]
    SendQueueFull,
    /// A stream read failed while deserialising a message. Check the message
    /// serialise functions; this can also be caused by a desync between the
    /// read and write sides.
    #[error("failed to serialise")]
    FailedToSerialise,
    /// The channel could not allocate memory for a block payload.
    #[error("out of memory")]
    OutOfMemory,
}

/// Kind of channel which provides guarantees about the manner of message
/// delivery.
///
/// A connection multiplexes several logical channels over one stream of
/// datagrams. Each channel is independent of any other channel, so e.g. one
/// channel does not block the head of another channel (head-of-line
/// blocking).
///
/// | [`ChannelKind`]         | Reliability | Ordering | Receive queue |
/// |-------------------------|-------------|----------|---------------|
/// | [`ReliableOrdered`]     | ✅          | ✅       | ✅            |
/// | [`UnreliableUnordered`] |             |          | ✅            |
/// | [`UnreliableProcess`]   |             |          |               |
///
/// [`ReliableOrdered`]: ChannelKind::ReliableOrdered
/// [`UnreliableUnordered`]: ChannelKind::UnreliableUnordered
/// [`UnreliableProcess`]: ChannelKind::UnreliableProcess
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Messages are delivered exactly once, in the order they were queued.
    ///
    /// Messages are acknowledged individually and retransmitted until acked.
    /// A message whose payload exceeds the per-packet budget is sent as a
    /// block: a run of fragments tied to a single message id.
    ///
    /// This kind offers the most guarantees, at the cost of head-of-line
    /// blocking while an earlier message is still in flight.
    ReliableOrdered,
    /// Messages are delivered at most once, in no particular order, into a
    /// bounded receive queue drained by the application.
    ///
    /// Useful for state that is refreshed often enough that losing one
    /// update does not matter.
    UnreliableUnordered,
    /// Messages are delivered at most once, in no particular order, directly
    /// into a callback on the receiving side. Nothing is queued.
    ///
    /// Useful for data whose information content expires almost immediately,
    /// where buffering would only add latency.
    UnreliableProcess,
}

impl ChannelKind {
    /// Gets if this kind of channel retransmits lost messages.
    #[must_use]
    pub const fn is_reliable(&self) -> bool {
        match self {
            Self::ReliableOrdered => true,
            Self::UnreliableUnordered | Self::UnreliableProcess => false,
        }
    }
}

/// Counters tracking how many times a channel performed an action.
///
/// Intended for a telemetry system, e.g. reported to a backend to track
/// behaviour in a production environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelCounter {
    /// Number of messages queued for sending over this channel.
    MessagesSent,
    /// Number of messages surfaced to the application by this channel.
    MessagesReceived,
}

impl ChannelCounter {
    /// Number of distinct counter kinds.
    pub const COUNT: usize = 2;

    /// Index of this counter in a per-connection counters array.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

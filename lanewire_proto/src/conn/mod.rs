//! Per-connection reliable-UDP engine: sequencing, acknowledgement,
//! fragmentation and reassembly, and link statistics.
//!
//! One [`Connection`] holds the state of every connection slot of an
//! endpoint. The application drives it with [`Connection::send_packet`] and
//! [`Connection::receive_packet`] and receives finished datagrams and
//! reassembled payloads through its [`ConnectionManager`].

mod stats;

pub use stats::*;

use bitvec::{array::BitArray, bitarr};
use lanewire::ConnectionManager;
use tracing::{debug, trace};

use crate::{
    buffer::SeqBuffer,
    packet::{
        read_fragment_header, FragmentHeader, PacketHeader, FRAGMENT_HEADER_BYTES,
        MAX_PACKET_HEADER_BYTES,
    },
};

/// UDP over IPv4: 20 byte IP header + 8 byte UDP header.
pub const IP_HEADER_SIZE_IPV4: u32 = 28;
/// UDP over IPv6: 40 byte IP header + 8 byte UDP header.
pub const IP_HEADER_SIZE_IPV6: u32 = 48;

/// Which IP version's header overhead to count into the per-packet byte
/// records, so bandwidth figures reflect the effective link cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IpVersion {
    /// IPv4: 28 bytes of overhead per datagram.
    #[default]
    V4,
    /// IPv6: 48 bytes of overhead per datagram.
    V6,
}

impl IpVersion {
    const fn overhead(self) -> u32 {
        match self {
            Self::V4 => IP_HEADER_SIZE_IPV4,
            Self::V6 => IP_HEADER_SIZE_IPV6,
        }
    }
}

/// Per-connection counters tracking how often the engine performed an
/// action or dropped a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Packets handed to the datagram substrate (fragmented packets count
    /// once).
    PacketsSent,
    /// Regular packets received, including reassembled fragmented packets.
    PacketsReceived,
    /// Sent packets confirmed received by the peer.
    PacketsAcked,
    /// Received packets dropped because their sequence fell behind the
    /// receive window.
    StalePackets,
    /// Received packets dropped because the header would not parse.
    InvalidPackets,
    /// Sends dropped because the payload exceeded the maximum packet size.
    OversizedSendPackets,
    /// Received packets dropped because they exceeded the maximum packet
    /// size.
    OversizedReceivePackets,
    /// Fragment datagrams handed to the substrate.
    FragmentsSent,
    /// Fragment datagrams received.
    FragmentsReceived,
    /// Fragment datagrams dropped as invalid or stale.
    InvalidFragments,
}

impl Counter {
    /// Number of distinct counter kinds.
    pub const COUNT: usize = 10;

    /// Index of this counter in a per-connection counters slice.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Configuration of a [`Connection`], shared by both peers at compile time.
///
/// The values size every buffer up front; nothing grows at steady state.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Number of connection slots.
    pub max_connections: usize,
    /// Largest payload accepted for send or delivery after reassembly.
    pub max_packet_size: usize,
    /// Payloads above this size are fragmented.
    pub fragment_above: usize,
    /// Upper bound on fragments per packet.
    pub max_fragments: usize,
    /// Bytes of payload per fragment.
    pub fragment_size: usize,
    /// Bound on unsurfaced acks per connection; excess acks are dropped.
    pub ack_buffer_size: usize,
    /// Capacity of the sent-packet record buffer.
    pub sent_buffer_size: usize,
    /// Capacity of the received-packet record buffer.
    pub received_buffer_size: usize,
    /// Capacity of the fragment reassembly buffer.
    pub reassembly_buffer_size: usize,
    /// IP version whose header overhead is counted into byte records.
    pub ip: IpVersion,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            max_packet_size: 16 * 1024,
            fragment_above: 1024,
            max_fragments: 16,
            fragment_size: 1024,
            ack_buffer_size: 256,
            sent_buffer_size: 1024,
            received_buffer_size: 1024,
            reassembly_buffer_size: 64,
            ip: IpVersion::V4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SentPacketData {
    time: u64,
    acked: bool,
    packet_bytes: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct ReceivedPacketData {
    time: u64,
    packet_bytes: u32,
}

#[derive(Debug, Clone)]
struct FragmentReassembly {
    sequence: u16,
    num_fragments_received: usize,
    num_fragments_total: usize,
    packet_header_bytes: usize,
    packet_bytes: usize,
    fragment_received: BitArray<[u8; 32]>,
    /// Reassembly area: [`MAX_PACKET_HEADER_BYTES`] of header space
    /// followed by `num_fragments_total * fragment_size` of payload space.
    /// Empty when no reassembly is in flight in this slot.
    packet_data: Vec<u8>,
}

impl Default for FragmentReassembly {
    fn default() -> Self {
        Self {
            sequence: 0,
            num_fragments_received: 0,
            num_fragments_total: 0,
            packet_header_bytes: 0,
            packet_bytes: 0,
            fragment_received: bitarr![u8, bitvec::order::Lsb0; 0; 256],
            packet_data: Vec::new(),
        }
    }
}

/// Reliable-UDP packet layer for every connection slot of an endpoint.
///
/// Wraps payloads in the packet header, fragments large ones, reassembles
/// incoming fragments, tracks which sent packets the peer has received,
/// and measures RTT, jitter, loss, and bandwidth per connection.
///
/// There is no handshake state at this layer; slots are reset explicitly
/// on connection lifecycle events.
#[derive(Debug)]
pub struct Connection {
    config: ConnectionConfig,
    /// Next send sequence per connection.
    sequence: Box<[u16]>,
    /// Acked sequences not yet surfaced to the upper layer.
    acknowledgements: Box<[u16]>,
    num_acknowledgements: Box<[usize]>,

    rtt: Box<[f32]>,
    rtt_history: Box<[f32]>,
    rtt_minimum: Box<[f32]>,
    rtt_maximum: Box<[f32]>,
    rtt_average: Box<[f32]>,
    jitter_average_from_minimum: Box<[f32]>,
    jitter_maximum_from_minimum: Box<[f32]>,
    jitter_stddev_from_average: Box<[f32]>,
    packet_loss: Box<[f32]>,
    sent_bandwidth_kbps: Box<[f32]>,
    received_bandwidth_kbps: Box<[f32]>,
    acked_bandwidth_kbps: Box<[f32]>,

    counters: Box<[u64]>,
    sent_packets: SeqBuffer<SentPacketData>,
    received_packets: SeqBuffer<ReceivedPacketData>,
    reassembly: SeqBuffer<FragmentReassembly>,
}

impl Connection {
    /// Creates the engine with all per-connection state preallocated.
    ///
    /// # Panics
    ///
    /// Panics if any buffer size in the config is 0, or if
    /// `max_fragments * fragment_size < max_packet_size`.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        assert!(config.max_connections > 0);
        assert!(config.max_packet_size > 0);
        assert!(config.fragment_above > 0);
        assert!(config.max_fragments > 0 && config.max_fragments <= 256);
        assert!(config.fragment_size > 0);
        assert!(config.max_fragments * config.fragment_size >= config.max_packet_size);
        assert!(config.ack_buffer_size > 0);
        let conns = config.max_connections;
        Self {
            sequence: vec![0; conns].into_boxed_slice(),
            acknowledgements: vec![0; conns * config.ack_buffer_size].into_boxed_slice(),
            num_acknowledgements: vec![0; conns].into_boxed_slice(),
            rtt: vec![0.0; conns].into_boxed_slice(),
            rtt_history: vec![-1.0; conns * RTT_HISTORY_SIZE].into_boxed_slice(),
            rtt_minimum: vec![0.0; conns].into_boxed_slice(),
            rtt_maximum: vec![0.0; conns].into_boxed_slice(),
            rtt_average: vec![0.0; conns].into_boxed_slice(),
            jitter_average_from_minimum: vec![0.0; conns].into_boxed_slice(),
            jitter_maximum_from_minimum: vec![0.0; conns].into_boxed_slice(),
            jitter_stddev_from_average: vec![0.0; conns].into_boxed_slice(),
            packet_loss: vec![0.0; conns].into_boxed_slice(),
            sent_bandwidth_kbps: vec![0.0; conns].into_boxed_slice(),
            received_bandwidth_kbps: vec![0.0; conns].into_boxed_slice(),
            acked_bandwidth_kbps: vec![0.0; conns].into_boxed_slice(),
            counters: vec![0; conns * Counter::COUNT].into_boxed_slice(),
            sent_packets: SeqBuffer::new(config.sent_buffer_size, conns),
            received_packets: SeqBuffer::new(config.received_buffer_size, conns),
            reassembly: SeqBuffer::new(config.reassembly_buffer_size, conns),
            config,
        }
    }

    /// The configuration this engine was built with.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Resets every connection slot.
    pub fn reset_all(&mut self) {
        for conn in 0..self.config.max_connections {
            self.reset(conn);
        }
    }

    /// Resets one connection slot: sequences, records, statistics, and any
    /// in-flight reassembly.
    pub fn reset(&mut self, conn: usize) {
        debug_assert!(conn < self.config.max_connections);
        self.sequence[conn] = 0;
        let ack_range = conn * self.config.ack_buffer_size..(conn + 1) * self.config.ack_buffer_size;
        self.acknowledgements[ack_range].fill(0);
        self.num_acknowledgements[conn] = 0;

        self.rtt[conn] = 0.0;
        self.rtt_history[conn * RTT_HISTORY_SIZE..(conn + 1) * RTT_HISTORY_SIZE].fill(-1.0);
        self.rtt_minimum[conn] = 0.0;
        self.rtt_maximum[conn] = 0.0;
        self.rtt_average[conn] = 0.0;
        self.jitter_average_from_minimum[conn] = 0.0;
        self.jitter_maximum_from_minimum[conn] = 0.0;
        self.jitter_stddev_from_average[conn] = 0.0;
        self.packet_loss[conn] = 0.0;
        self.sent_bandwidth_kbps[conn] = 0.0;
        self.received_bandwidth_kbps[conn] = 0.0;
        self.acked_bandwidth_kbps[conn] = 0.0;

        self.counters[conn * Counter::COUNT..(conn + 1) * Counter::COUNT].fill(0);

        self.sent_packets.reset(conn);
        self.received_packets.reset(conn);
        self.reassembly.reset(conn);
    }

    /// Next packet sequence this connection will send with.
    #[must_use]
    pub fn next_sequence(&self, conn: usize) -> u16 {
        debug_assert!(conn < self.config.max_connections);
        self.sequence[conn]
    }

    /// Sequences acked by the peer since the last
    /// [`Connection::clear_acknowledgements`], most recent first.
    #[must_use]
    pub fn acknowledgements(&self, conn: usize) -> &[u16] {
        debug_assert!(conn < self.config.max_connections);
        let start = conn * self.config.ack_buffer_size;
        &self.acknowledgements[start..start + self.num_acknowledgements[conn]]
    }

    /// Marks `count` surfaced acks as consumed. Consume the whole
    /// [`Connection::acknowledgements`] slice before new packets arrive, or
    /// the unconsumed remainder will be misattributed.
    pub fn clear_acknowledgements(&mut self, conn: usize, count: usize) {
        debug_assert!(conn < self.config.max_connections);
        debug_assert!(count <= self.num_acknowledgements[conn]);
        self.num_acknowledgements[conn] -= count;
    }

    /// Value of one counter.
    #[must_use]
    pub fn counter(&self, conn: usize, counter: Counter) -> u64 {
        debug_assert!(conn < self.config.max_connections);
        self.counters[conn * Counter::COUNT + counter.index()]
    }

    /// Wraps `payload` in a packet header and hands it (or its fragments)
    /// to the manager's raw send.
    ///
    /// Oversized payloads are counted and dropped; the connection keeps
    /// working.
    pub fn send_packet(
        &mut self,
        manager: &mut impl ConnectionManager,
        conn: usize,
        payload: &[u8],
    ) {
        debug_assert!(conn < self.config.max_connections);
        debug_assert!(!payload.is_empty());

        if payload.len() > self.config.max_packet_size {
            debug!(
                conn,
                len = payload.len(),
                max = self.config.max_packet_size,
                "packet too large to send"
            );
            self.bump(conn, Counter::OversizedSendPackets);
            return;
        }

        let sequence = self.sequence[conn];
        self.sequence[conn] = sequence.wrapping_add(1);

        let (ack, mut ack_bits) = self.received_packets.generate_ack_bits(conn);
        if self.received_packets.sequence(conn) == 0 {
            // nothing received yet: every bit references a sequence that was
            // never sent, and all-ones compresses to the smallest header
            ack_bits = u32::MAX;
        }

        let header = PacketHeader {
            sequence,
            ack,
            ack_bits,
        };

        let sent = self
            .sent_packets
            .insert(conn, sequence)
            .expect("next send sequence is never stale");
        sent.time = manager.now_millis();
        sent.acked = false;
        sent.packet_bytes = self.config.ip.overhead() + payload.len() as u32;

        if payload.len() <= self.config.fragment_above {
            trace!(conn, sequence, "sending packet without fragmentation");

            let mut buf = vec![0u8; MAX_PACKET_HEADER_BYTES + payload.len()];
            let header_bytes = header.encode(&mut buf);
            buf[header_bytes..header_bytes + payload.len()].copy_from_slice(payload);
            manager.send_raw_packet(conn, &buf[..header_bytes + payload.len()]);
        } else {
            let num_fragments = payload.len().div_ceil(self.config.fragment_size);
            debug_assert!(num_fragments <= self.config.max_fragments);

            trace!(conn, sequence, num_fragments, "sending fragmented packet");

            let mut buf =
                vec![
                    0u8;
                    FRAGMENT_HEADER_BYTES + MAX_PACKET_HEADER_BYTES + self.config.fragment_size
                ];
            for fragment_id in 0..num_fragments {
                let fragment_header = FragmentHeader {
                    sequence,
                    fragment_id: fragment_id as u8,
                    num_fragments: num_fragments as u8,
                };
                let mut len = fragment_header.encode(&mut buf);
                if fragment_id == 0 {
                    len += header.encode(&mut buf[len..]);
                }

                let start = fragment_id * self.config.fragment_size;
                let end = (start + self.config.fragment_size).min(payload.len());
                buf[len..len + (end - start)].copy_from_slice(&payload[start..end]);
                len += end - start;

                manager.send_raw_packet(conn, &buf[..len]);
                self.bump(conn, Counter::FragmentsSent);
            }
        }

        self.bump(conn, Counter::PacketsSent);
    }

    /// Processes one inbound datagram: a regular packet or a fragment,
    /// distinguished by byte 0 bit 0.
    ///
    /// Nothing here is fatal; malformed, stale, or oversized datagrams are
    /// counted and dropped and the connection continues.
    pub fn receive_packet(
        &mut self,
        manager: &mut impl ConnectionManager,
        conn: usize,
        data: &[u8],
    ) {
        debug_assert!(conn < self.config.max_connections);
        if data.is_empty() {
            self.bump(conn, Counter::InvalidPackets);
            return;
        }

        if data.len()
            > self.config.max_packet_size + MAX_PACKET_HEADER_BYTES + FRAGMENT_HEADER_BYTES
        {
            debug!(conn, len = data.len(), "packet too large to receive");
            self.bump(conn, Counter::OversizedReceivePackets);
            return;
        }

        if data[0] & 1 == 0 {
            self.receive_regular(manager, conn, data);
        } else {
            self.receive_fragment(manager, conn, data);
        }
    }

    fn receive_regular(
        &mut self,
        manager: &mut impl ConnectionManager,
        conn: usize,
        data: &[u8],
    ) {
        self.bump(conn, Counter::PacketsReceived);

        let (header, header_bytes) = match PacketHeader::decode(data) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!(conn, %err, "ignoring invalid packet");
                self.bump(conn, Counter::InvalidPackets);
                return;
            }
        };

        let payload = &data[header_bytes..];
        if payload.len() > self.config.max_packet_size {
            debug!(conn, len = payload.len(), "payload too large to receive");
            self.bump(conn, Counter::OversizedReceivePackets);
            return;
        }

        if !self.received_packets.test_insert(conn, header.sequence) {
            trace!(conn, sequence = header.sequence, "ignoring stale packet");
            self.bump(conn, Counter::StalePackets);
            return;
        }

        if !manager.process_payload(conn, header.sequence, payload) {
            debug!(conn, sequence = header.sequence, "payload rejected");
            return;
        }

        let received = self
            .received_packets
            .insert(conn, header.sequence)
            .expect("test_insert accepted this sequence");
        received.time = manager.now_millis();
        received.packet_bytes = self.config.ip.overhead() + data.len() as u32;

        self.reassembly
            .advance_with(conn, header.sequence, |entry| {
                entry.packet_data = Vec::new();
            });

        let now = manager.now_millis();
        let mut ack_bits = header.ack_bits;
        for i in 0..32u16 {
            if ack_bits & 1 != 0 {
                let ack_sequence = header.ack.wrapping_sub(i);

                if let Some(sent) = self.sent_packets.find_mut(conn, ack_sequence) {
                    if !sent.acked {
                        sent.acked = true;
                        trace!(conn, sequence = ack_sequence, "packet acknowledged");
                        self.counters[conn * Counter::COUNT + Counter::PacketsAcked.index()] += 1;

                        if self.num_acknowledgements[conn] < self.config.ack_buffer_size {
                            let index =
                                conn * self.config.ack_buffer_size + self.num_acknowledgements[conn];
                            self.acknowledgements[index] = ack_sequence;
                            self.num_acknowledgements[conn] += 1;
                        }

                        let sample = (now.saturating_sub(sent.time)) as f32;
                        let history_index =
                            conn * RTT_HISTORY_SIZE + usize::from(ack_sequence) % RTT_HISTORY_SIZE;
                        self.rtt_history[history_index] = sample;
                        let rtt = &mut self.rtt[conn];
                        if (*rtt == 0.0 && sample > 0.0) || (*rtt - sample).abs() < f32::EPSILON {
                            *rtt = sample;
                        } else {
                            *rtt += (sample - *rtt) * RTT_SMOOTHING_FACTOR;
                        }
                    }
                }
            }
            ack_bits >>= 1;
        }
    }

    fn receive_fragment(
        &mut self,
        manager: &mut impl ConnectionManager,
        conn: usize,
        data: &[u8],
    ) {
        let info = match read_fragment_header(
            data,
            self.config.max_fragments,
            self.config.fragment_size,
        ) {
            Ok(info) => info,
            Err(err) => {
                debug!(conn, %err, "ignoring invalid fragment");
                self.bump(conn, Counter::InvalidFragments);
                return;
            }
        };

        let sequence = info.header.sequence;
        let fragment_id = usize::from(info.header.fragment_id);
        let num_fragments = usize::from(info.header.num_fragments);

        if !self.reassembly.exists(conn, sequence) {
            let Some(entry) = self.reassembly.insert_with(conn, sequence, |evicted| {
                evicted.packet_data = Vec::new();
            }) else {
                debug!(conn, sequence, "ignoring stale fragment");
                self.bump(conn, Counter::InvalidFragments);
                return;
            };

            entry.sequence = sequence;
            entry.num_fragments_received = 0;
            entry.num_fragments_total = num_fragments;
            entry.packet_header_bytes = 0;
            entry.packet_bytes = 0;
            entry.fragment_received.fill(false);
            entry.packet_data =
                vec![0; MAX_PACKET_HEADER_BYTES + num_fragments * self.config.fragment_size];

            self.received_packets.advance(conn, sequence);
        }

        let fragment_size = self.config.fragment_size;
        let entry = self
            .reassembly
            .find_mut(conn, sequence)
            .expect("entry inserted above");

        debug_assert_eq!(entry.sequence, sequence);
        if num_fragments != entry.num_fragments_total {
            debug!(
                conn,
                sequence,
                expected = entry.num_fragments_total,
                got = num_fragments,
                "fragment count mismatch"
            );
            self.bump(conn, Counter::InvalidFragments);
            return;
        }

        if entry.fragment_received[fragment_id] {
            trace!(conn, sequence, fragment_id, "fragment already received");
            return;
        }

        entry.fragment_received.set(fragment_id, true);
        entry.num_fragments_received += 1;

        if fragment_id == 0 {
            // store the packet header right before the payload area, so the
            // reassembled buffer replays as a regular packet
            let embedded = PacketHeader {
                sequence,
                ack: info.ack,
                ack_bits: info.ack_bits,
            };
            let mut header_buf = [0u8; MAX_PACKET_HEADER_BYTES];
            let header_bytes = embedded.encode(&mut header_buf);
            entry.packet_header_bytes = header_bytes;
            entry.packet_data[MAX_PACKET_HEADER_BYTES - header_bytes..MAX_PACKET_HEADER_BYTES]
                .copy_from_slice(&header_buf[..header_bytes]);
        }

        if fragment_id == num_fragments - 1 {
            entry.packet_bytes = (num_fragments - 1) * fragment_size + info.fragment_bytes;
        }

        let payload = &data[info.header_bytes..];
        let start = MAX_PACKET_HEADER_BYTES + fragment_id * fragment_size;
        entry.packet_data[start..start + payload.len()].copy_from_slice(payload);

        trace!(
            conn,
            sequence,
            fragment_id,
            received = entry.num_fragments_received,
            total = num_fragments,
            "received fragment"
        );

        if entry.num_fragments_received == entry.num_fragments_total {
            debug!(conn, sequence, "completed packet reassembly");

            let packet_data = std::mem::take(&mut entry.packet_data);
            let header_bytes = entry.packet_header_bytes;
            let packet_bytes = entry.packet_bytes;
            self.reassembly.remove(conn, sequence);

            self.receive_regular(
                manager,
                conn,
                &packet_data
                    [MAX_PACKET_HEADER_BYTES - header_bytes..MAX_PACKET_HEADER_BYTES + packet_bytes],
            );
        }

        self.bump(conn, Counter::FragmentsReceived);
    }

    fn bump(&mut self, conn: usize, counter: Counter) {
        self.counters[conn * Counter::COUNT + counter.index()] += 1;
    }
}

#[cfg(test)]
mod tests {
    use lanewire::ChannelMessage;

    use super::*;

    #[derive(Debug, Default)]
    struct TestManager {
        now: u64,
        alive: bool,
        accept: bool,
        sent: Vec<Vec<u8>>,
        payloads: Vec<(usize, u16, Vec<u8>)>,
    }

    impl TestManager {
        fn new() -> Self {
            Self {
                now: 1000,
                alive: true,
                accept: true,
                ..Self::default()
            }
        }
    }

    impl ConnectionManager for TestManager {
        fn send_raw_packet(&mut self, _conn: usize, data: &[u8]) {
            self.sent.push(data.to_vec());
        }

        fn process_payload(&mut self, conn: usize, sequence: u16, payload: &[u8]) -> bool {
            if self.accept {
                self.payloads.push((conn, sequence, payload.to_vec()));
            }
            self.accept
        }

        fn now_millis(&self) -> u64 {
            self.now
        }

        fn is_connection_alive(&self, _conn: usize) -> bool {
            self.alive
        }

        fn handle_unreliable(&mut self, _conn: usize, _message: ChannelMessage) {}
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            max_connections: 1,
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn small_packet_roundtrip() {
        let mut sender = Connection::new(config());
        let mut receiver = Connection::new(config());
        let mut sender_mgr = TestManager::new();
        let mut receiver_mgr = TestManager::new();

        let payload = vec![0x5A; 64];
        sender.send_packet(&mut sender_mgr, 0, &payload);

        assert_eq!(sender_mgr.sent.len(), 1);
        let datagram = &sender_mgr.sent[0];
        assert_eq!(datagram.len(), 4 + 64);
        assert_eq!(datagram[0], 0x20);

        receiver.receive_packet(&mut receiver_mgr, 0, datagram);
        assert_eq!(receiver_mgr.payloads.len(), 1);
        let (conn, sequence, received) = &receiver_mgr.payloads[0];
        assert_eq!(*conn, 0);
        assert_eq!(*sequence, 0);
        assert_eq!(received, &payload);
        assert_eq!(receiver.counter(0, Counter::PacketsReceived), 1);
    }

    #[test]
    fn fragmented_packet_roundtrip() {
        let mut sender = Connection::new(config());
        let mut receiver = Connection::new(config());
        let mut sender_mgr = TestManager::new();
        let mut receiver_mgr = TestManager::new();

        let payload: Vec<u8> = (0..3072u32).map(|i| i as u8).collect();
        sender.send_packet(&mut sender_mgr, 0, &payload);

        assert_eq!(sender_mgr.sent.len(), 3);
        // fragment 0 carries the embedded 4-byte packet header
        assert_eq!(sender_mgr.sent[0].len(), 5 + 4 + 1024);
        assert_eq!(sender_mgr.sent[1].len(), 5 + 1024);
        assert_eq!(sender_mgr.sent[2].len(), 5 + 1024);
        assert_eq!(sender.counter(0, Counter::FragmentsSent), 3);
        assert_eq!(sender.counter(0, Counter::PacketsSent), 1);

        for datagram in &sender_mgr.sent {
            receiver.receive_packet(&mut receiver_mgr, 0, datagram);
        }

        assert_eq!(receiver_mgr.payloads.len(), 1);
        assert_eq!(receiver_mgr.payloads[0].2, payload);
        assert_eq!(receiver.counter(0, Counter::FragmentsReceived), 3);
        assert_eq!(receiver.counter(0, Counter::PacketsReceived), 1);
    }

    #[test]
    fn fragments_reassemble_out_of_order() {
        let mut sender = Connection::new(config());
        let mut receiver = Connection::new(config());
        let mut sender_mgr = TestManager::new();
        let mut receiver_mgr = TestManager::new();

        let payload: Vec<u8> = (0..2500u32).map(|i| (i * 7) as u8).collect();
        sender.send_packet(&mut sender_mgr, 0, &payload);
        assert_eq!(sender_mgr.sent.len(), 3);

        for index in [2, 0, 1] {
            receiver.receive_packet(&mut receiver_mgr, 0, &sender_mgr.sent[index]);
        }
        assert_eq!(receiver_mgr.payloads.len(), 1);
        assert_eq!(receiver_mgr.payloads[0].2, payload);
    }

    #[test]
    fn duplicate_fragment_dropped() {
        let mut sender = Connection::new(config());
        let mut receiver = Connection::new(config());
        let mut sender_mgr = TestManager::new();
        let mut receiver_mgr = TestManager::new();

        let payload = vec![1u8; 2048];
        sender.send_packet(&mut sender_mgr, 0, &payload);
        assert_eq!(sender_mgr.sent.len(), 2);

        receiver.receive_packet(&mut receiver_mgr, 0, &sender_mgr.sent[0]);
        receiver.receive_packet(&mut receiver_mgr, 0, &sender_mgr.sent[0]);
        receiver.receive_packet(&mut receiver_mgr, 0, &sender_mgr.sent[1]);

        assert_eq!(receiver_mgr.payloads.len(), 1);
        assert_eq!(receiver_mgr.payloads[0].2, payload);
        // the duplicate is dropped before the received-fragment counter
        assert_eq!(receiver.counter(0, Counter::FragmentsReceived), 2);
    }

    #[test]
    fn ack_compression() {
        let mut a = Connection::new(config());
        let mut b = Connection::new(config());
        let mut a_mgr = TestManager::new();
        let mut b_mgr = TestManager::new();

        let payload = vec![9u8; 32];
        for _ in 0..=40 {
            a.send_packet(&mut a_mgr, 0, &payload);
            let datagram = a_mgr.sent.pop().unwrap();
            b.receive_packet(&mut b_mgr, 0, &datagram);
            // advance b's own sequence without delivering to a
            b.send_packet(&mut b_mgr, 0, &payload);
            b_mgr.sent.pop();
        }

        b.send_packet(&mut b_mgr, 0, &payload);
        let datagram = b_mgr.sent.pop().unwrap();
        // seq 41, ack 40, ack_bits all ones: 4-byte header
        assert_eq!(datagram[0], 0x20);
        assert_eq!(datagram.len(), 4 + 32);

        a.receive_packet(&mut a_mgr, 0, &datagram);
        let acks = a.acknowledgements(0).to_vec();
        assert_eq!(acks.len(), 32);
        assert_eq!(acks[0], 40);
        assert_eq!(acks[31], 9);
        assert_eq!(a.counter(0, Counter::PacketsAcked), 32);
        a.clear_acknowledgements(0, acks.len());
        assert!(a.acknowledgements(0).is_empty());
    }

    #[test]
    fn oversized_send_dropped() {
        let mut conn = Connection::new(config());
        let mut mgr = TestManager::new();
        let payload = vec![0u8; 16 * 1024 + 1];
        conn.send_packet(&mut mgr, 0, &payload);
        assert!(mgr.sent.is_empty());
        assert_eq!(conn.counter(0, Counter::OversizedSendPackets), 1);
        assert_eq!(conn.next_sequence(0), 0);
    }

    #[test]
    fn invalid_header_counted() {
        let mut conn = Connection::new(config());
        let mut mgr = TestManager::new();
        conn.receive_packet(&mut mgr, 0, &[0x00, 0x01]);
        assert_eq!(conn.counter(0, Counter::InvalidPackets), 1);

        conn.receive_packet(&mut mgr, 0, &[0x01, 0x00, 0x00]);
        assert_eq!(conn.counter(0, Counter::InvalidFragments), 1);
    }

    #[test]
    fn stale_packet_counted() {
        let small = ConnectionConfig {
            max_connections: 1,
            received_buffer_size: 4,
            ..ConnectionConfig::default()
        };
        let mut sender = Connection::new(config());
        let mut receiver = Connection::new(small);
        let mut sender_mgr = TestManager::new();
        let mut receiver_mgr = TestManager::new();

        let payload = vec![3u8; 16];
        let mut datagrams = Vec::new();
        for _ in 0..8 {
            sender.send_packet(&mut sender_mgr, 0, &payload);
            datagrams.push(sender_mgr.sent.pop().unwrap());
        }

        for datagram in &datagrams[1..] {
            receiver.receive_packet(&mut receiver_mgr, 0, datagram);
        }
        // seq 0 is now behind the 4-entry receive window
        receiver.receive_packet(&mut receiver_mgr, 0, &datagrams[0]);
        assert_eq!(receiver.counter(0, Counter::StalePackets), 1);
    }

    #[test]
    fn rejected_payload_not_recorded() {
        let mut sender = Connection::new(config());
        let mut receiver = Connection::new(config());
        let mut sender_mgr = TestManager::new();
        let mut receiver_mgr = TestManager::new();
        receiver_mgr.accept = false;

        sender.send_packet(&mut sender_mgr, 0, &[1, 2, 3]);
        let datagram = sender_mgr.sent.pop().unwrap();
        receiver.receive_packet(&mut receiver_mgr, 0, &datagram);

        assert!(receiver_mgr.payloads.is_empty());
        // not recorded as received, so the next outgoing ack covers nothing
        receiver.send_packet(&mut receiver_mgr, 0, &[9]);
        let out = receiver_mgr.sent.pop().unwrap();
        let (header, _) = PacketHeader::decode(&out).unwrap();
        assert_eq!(header.ack_bits, u32::MAX);
        assert_eq!(header.ack, u16::MAX);
    }

    #[test]
    fn reset_clears_state() {
        let mut conn = Connection::new(config());
        let mut mgr = TestManager::new();
        conn.send_packet(&mut mgr, 0, &[1, 2, 3]);
        assert_eq!(conn.next_sequence(0), 1);
        assert_eq!(conn.counter(0, Counter::PacketsSent), 1);

        conn.reset(0);
        assert_eq!(conn.next_sequence(0), 0);
        assert_eq!(conn.counter(0, Counter::PacketsSent), 0);
        assert!(conn.acknowledgements(0).is_empty());
    }
}

//! Link statistics: RTT bounds, jitter, packet loss, and bandwidth.
//!
//! Recomputed as a whole by [`Connection::update_statistics`], nominally
//! once per second. Samples come from the sent/received packet records and
//! the RTT history ring filled in by the receive path.

use lanewire::ConnectionManager;

use super::Connection;

/// Exponential smoothing factor applied to each new RTT sample.
pub const RTT_SMOOTHING_FACTOR: f32 = 0.0025;
/// Exponential smoothing factor applied to each packet loss recomputation.
pub const PACKET_LOSS_SMOOTHING_FACTOR: f32 = 0.1;
/// Exponential smoothing factor applied to each bandwidth recomputation.
pub const BANDWIDTH_SMOOTHING_FACTOR: f32 = 0.1;
/// Slots in the per-connection RTT history ring, indexed by
/// `acked_sequence % RTT_HISTORY_SIZE`.
pub const RTT_HISTORY_SIZE: usize = 512;

/// Slot value marking "no sample recorded here yet".
const EMPTY_SAMPLE: f32 = -1.0;

impl Connection {
    /// Recomputes every statistic for every live connection.
    ///
    /// Call on a periodic tick, nominally once per second. Values are
    /// queried with the getters below between ticks.
    pub fn update_statistics(&mut self, manager: &impl ConnectionManager) {
        self.update_rtt_bounds(manager);
        self.update_jitter(manager);
        self.update_packet_loss(manager);
        self.update_sent_bandwidth(manager);
        self.update_received_bandwidth(manager);
    }

    /// Smoothed round trip time in milliseconds.
    #[must_use]
    pub fn rtt(&self, conn: usize) -> f32 {
        self.rtt[conn]
    }

    /// Smallest RTT sample in the history window, in milliseconds.
    #[must_use]
    pub fn rtt_minimum(&self, conn: usize) -> f32 {
        self.rtt_minimum[conn]
    }

    /// Largest RTT sample in the history window, in milliseconds.
    #[must_use]
    pub fn rtt_maximum(&self, conn: usize) -> f32 {
        self.rtt_maximum[conn]
    }

    /// Mean RTT over the history window, in milliseconds.
    #[must_use]
    pub fn rtt_average(&self, conn: usize) -> f32 {
        self.rtt_average[conn]
    }

    /// Mean of `sample - rtt_minimum` over the history window.
    #[must_use]
    pub fn jitter_average_from_minimum(&self, conn: usize) -> f32 {
        self.jitter_average_from_minimum[conn]
    }

    /// Largest `sample - rtt_minimum` over the history window.
    #[must_use]
    pub fn jitter_maximum_from_minimum(&self, conn: usize) -> f32 {
        self.jitter_maximum_from_minimum[conn]
    }

    /// Standard deviation of samples around `rtt_average`.
    #[must_use]
    pub fn jitter_stddev_from_average(&self, conn: usize) -> f32 {
        self.jitter_stddev_from_average[conn]
    }

    /// Smoothed packet loss over the older half of the sent window, in
    /// percent.
    #[must_use]
    pub fn packet_loss(&self, conn: usize) -> f32 {
        self.packet_loss[conn]
    }

    /// Smoothed outgoing bandwidth in kilobits per second, IP overhead
    /// included.
    #[must_use]
    pub fn sent_bandwidth_kbps(&self, conn: usize) -> f32 {
        self.sent_bandwidth_kbps[conn]
    }

    /// Smoothed incoming bandwidth in kilobits per second, IP overhead
    /// included.
    #[must_use]
    pub fn received_bandwidth_kbps(&self, conn: usize) -> f32 {
        self.received_bandwidth_kbps[conn]
    }

    /// Smoothed bandwidth of packets the peer acknowledged, in kilobits
    /// per second.
    #[must_use]
    pub fn acked_bandwidth_kbps(&self, conn: usize) -> f32 {
        self.acked_bandwidth_kbps[conn]
    }

    fn update_rtt_bounds(&mut self, manager: &impl ConnectionManager) {
        for conn in 0..self.config.max_connections {
            if !manager.is_connection_alive(conn) {
                continue;
            }
            let history = &self.rtt_history[conn * RTT_HISTORY_SIZE..(conn + 1) * RTT_HISTORY_SIZE];
            let mut minimum = f32::MAX;
            let mut maximum = 0.0f32;
            let mut sum = 0.0f32;
            let mut count = 0u32;
            for &sample in history {
                if sample > EMPTY_SAMPLE {
                    minimum = minimum.min(sample);
                    maximum = maximum.max(sample);
                    sum += sample;
                    count += 1;
                }
            }
            self.rtt_minimum[conn] = if count > 0 { minimum } else { 0.0 };
            self.rtt_maximum[conn] = maximum;
            self.rtt_average[conn] = if count > 0 { sum / count as f32 } else { 0.0 };
        }
    }

    fn update_jitter(&mut self, manager: &impl ConnectionManager) {
        for conn in 0..self.config.max_connections {
            if !manager.is_connection_alive(conn) {
                continue;
            }
            let history = &self.rtt_history[conn * RTT_HISTORY_SIZE..(conn + 1) * RTT_HISTORY_SIZE];
            let mut sum = 0.0f32;
            let mut sum_squared = 0.0f32;
            let mut maximum = 0.0f32;
            let mut count = 0u32;
            for &sample in history {
                if sample > EMPTY_SAMPLE {
                    let difference = sample - self.rtt_minimum[conn];
                    let deviation = sample - self.rtt_average[conn];
                    sum += difference;
                    maximum = maximum.max(difference);
                    sum_squared += deviation * deviation;
                    count += 1;
                }
            }
            if count > 0 {
                self.jitter_average_from_minimum[conn] = sum / count as f32;
                self.jitter_stddev_from_average[conn] = (sum_squared / count as f32).sqrt();
            } else {
                self.jitter_average_from_minimum[conn] = 0.0;
                self.jitter_stddev_from_average[conn] = 0.0;
            }
            self.jitter_maximum_from_minimum[conn] = maximum;
        }
    }

    fn update_packet_loss(&mut self, manager: &impl ConnectionManager) {
        for conn in 0..self.config.max_connections {
            if !manager.is_connection_alive(conn) {
                continue;
            }
            // only the older half of the window: newer packets have not had
            // time to be acked yet
            let base = self
                .sent_packets
                .sequence(conn)
                .wrapping_sub(self.config.sent_buffer_size as u16);
            let mut num_sent = 0u32;
            let mut num_dropped = 0u32;
            for i in 0..self.config.sent_buffer_size / 2 {
                let sequence = base.wrapping_add(i as u16);
                if let Some(sent) = self.sent_packets.find(conn, sequence) {
                    num_sent += 1;
                    if !sent.acked {
                        num_dropped += 1;
                    }
                }
            }
            if num_sent > 0 {
                let loss = num_dropped as f32 / num_sent as f32 * 100.0;
                let current = &mut self.packet_loss[conn];
                if (*current - loss).abs() > 0.000_01 {
                    *current += (loss - *current) * PACKET_LOSS_SMOOTHING_FACTOR;
                } else {
                    *current = loss;
                }
            } else {
                self.packet_loss[conn] = 0.0;
            }
        }
    }

    fn update_sent_bandwidth(&mut self, manager: &impl ConnectionManager) {
        for conn in 0..self.config.max_connections {
            if !manager.is_connection_alive(conn) {
                continue;
            }
            let base = self
                .sent_packets
                .sequence(conn)
                .wrapping_sub(self.config.sent_buffer_size as u16);
            let mut bytes_sent = 0u64;
            let mut acked_bytes_sent = 0u64;
            let mut start_time = u64::MAX;
            let mut finish_time = 0u64;
            let mut acked_start_time = u64::MAX;
            let mut acked_finish_time = 0u64;
            for i in 0..self.config.sent_buffer_size / 2 {
                let sequence = base.wrapping_add(i as u16);
                let Some(sent) = self.sent_packets.find(conn, sequence) else {
                    continue;
                };
                if sent.acked {
                    acked_bytes_sent += u64::from(sent.packet_bytes);
                    acked_start_time = acked_start_time.min(sent.time);
                    acked_finish_time = acked_finish_time.max(sent.time);
                }
                bytes_sent += u64::from(sent.packet_bytes);
                start_time = start_time.min(sent.time);
                finish_time = finish_time.max(sent.time);
            }
            if let Some(kbps) = bandwidth_kbps(bytes_sent, start_time, finish_time) {
                smooth(&mut self.sent_bandwidth_kbps[conn], kbps);
            }
            if let Some(kbps) = bandwidth_kbps(acked_bytes_sent, acked_start_time, acked_finish_time)
            {
                smooth(&mut self.acked_bandwidth_kbps[conn], kbps);
            }
        }
    }

    fn update_received_bandwidth(&mut self, manager: &impl ConnectionManager) {
        for conn in 0..self.config.max_connections {
            if !manager.is_connection_alive(conn) {
                continue;
            }
            let base = self
                .received_packets
                .sequence(conn)
                .wrapping_sub(self.config.received_buffer_size as u16);
            let mut bytes_received = 0u64;
            let mut start_time = u64::MAX;
            let mut finish_time = 0u64;
            for i in 0..self.config.received_buffer_size / 2 {
                let sequence = base.wrapping_add(i as u16);
                let Some(received) = self.received_packets.find(conn, sequence) else {
                    continue;
                };
                bytes_received += u64::from(received.packet_bytes);
                start_time = start_time.min(received.time);
                finish_time = finish_time.max(received.time);
            }
            if let Some(kbps) = bandwidth_kbps(bytes_received, start_time, finish_time) {
                smooth(&mut self.received_bandwidth_kbps[conn], kbps);
            }
        }
    }
}

/// `bytes` over `[start, finish]` milliseconds as kilobits per second.
/// [`None`] when the window holds fewer than two distinct send times.
fn bandwidth_kbps(bytes: u64, start_time: u64, finish_time: u64) -> Option<f32> {
    if start_time == u64::MAX || finish_time <= start_time {
        return None;
    }
    // bits per millisecond == kilobits per second
    Some((bytes * 8) as f32 / (finish_time - start_time) as f32)
}

fn smooth(current: &mut f32, target: f32) {
    if (*current - target).abs() > 0.000_01 {
        *current += (target - *current) * BANDWIDTH_SMOOTHING_FACTOR;
    } else {
        *current = target;
    }
}

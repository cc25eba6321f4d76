//! See [`ReplayGuard`].

use crate::sync::RwSpinLock;

/// Slot value marking "no sequence received here yet".
const EMPTY_SLOT: u64 = u64::MAX;

/// Sliding-window duplicate detector over 64-bit authenticated sequence
/// numbers.
///
/// Each received slot array holds, per `sequence % buffer_size` index, the
/// highest sequence accepted at that index. A sequence is accepted iff it
/// is newer than `most_recent - buffer_size` and its indexed slot is empty
/// or holds a strictly smaller value; anything else is a replayed or stale
/// packet.
///
/// # Cooperation with the decryptor
///
/// The window sits in front of an AEAD decryptor: call
/// [`ReplayGuard::already_received`] *before* decrypting (cheaply dropping
/// floods of replays), and call [`ReplayGuard::advance`] only *after* the
/// packet authenticates. Advancing on unauthenticated input would let
/// spoofed sequences poison the window. Size the buffer to at least the
/// decryption pipeline's in-flight count.
///
/// Each connection's most-recent sequence and slot array are guarded by
/// their own locks, so workers can check different connections without
/// contending.
#[derive(Debug)]
pub struct ReplayGuard {
    buffer_size: u64,
    most_recent: Box<[RwSpinLock<u64>]>,
    received: Box<[RwSpinLock<Box<[u64]>>]>,
}

impl ReplayGuard {
    /// Creates a window of `buffer_size` slots for each of `conns`
    /// connection slots.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` or `conns` is 0.
    #[must_use]
    pub fn new(buffer_size: usize, conns: usize) -> Self {
        assert!(buffer_size > 0);
        assert!(conns > 0);
        Self {
            buffer_size: buffer_size as u64,
            most_recent: (0..conns)
                .map(|_| RwSpinLock::new("replay.most_recent", 0))
                .collect(),
            received: (0..conns)
                .map(|_| {
                    RwSpinLock::new(
                        "replay.received",
                        vec![EMPTY_SLOT; buffer_size].into_boxed_slice(),
                    )
                })
                .collect(),
        }
    }

    /// Whether `sequence` must be rejected as a replay or as stale.
    ///
    /// Call before spending cycles on decryption.
    #[must_use]
    pub fn already_received(&self, conn: usize, sequence: u64) -> bool {
        {
            let most_recent = self.most_recent[conn].read();
            // older than the whole window: can't tell a replay from a
            // stale packet, reject either way
            if sequence + self.buffer_size <= *most_recent {
                return true;
            }
        }

        let received = self.received[conn].read();
        let slot = received[(sequence % self.buffer_size) as usize];
        if slot == EMPTY_SLOT {
            return false;
        }
        // future sequences are accepted, so equal-or-newer means replay
        slot >= sequence
    }

    /// Records `sequence` as received. Call only after the packet has
    /// authenticated.
    pub fn advance(&self, conn: usize, sequence: u64) {
        {
            let mut most_recent = self.most_recent[conn].write();
            if sequence > *most_recent {
                *most_recent = sequence;
            }
        }

        let mut received = self.received[conn].write();
        received[(sequence % self.buffer_size) as usize] = sequence;
    }

    /// Clears one connection's window.
    pub fn reset(&self, conn: usize) {
        *self.most_recent[conn].write() = 0;
        self.received[conn].write().fill(EMPTY_SLOT);
    }

    /// Clears every connection's window.
    pub fn reset_all(&self) {
        for conn in 0..self.most_recent.len() {
            self.reset(conn);
        }
    }
}

//! Runtime limits for selkie.
//!
//! TigerStyle: All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Addressing
// =============================================================================

/// Maximum number of worker threads (worker ids are the high 8 bits of a
/// service id, and worker id 0 is reserved as the null address)
pub const WORKER_COUNT_MAX: usize = 255;

/// Maximum per-worker service sequence (low 24 bits of a service id)
pub const SERVICE_SEQ_COUNT_MAX: u32 = 0x00FF_FFFF;

/// Largest session id; allocation wraps back to 1 past this
pub const SESSION_ID_MAX: i32 = 0x7FFF_FFFF;

/// Maximum live sockets per worker (fd low 16 bits, 1-based)
pub const SOCKET_COUNT_MAX: u32 = 0xFFFF;

// =============================================================================
// Scheduling
// =============================================================================

/// Maximum messages drained from a worker mailbox per poll, so socket
/// completions and timers are not starved by a deep backlog
pub const MAILBOX_BATCH_COUNT_MAX: usize = 1024;

// =============================================================================
// Memory accounting
// =============================================================================

/// First memory-report watermark for a service; doubles on each crossing
pub const SERVICE_MEM_REPORT_BYTES_DEFAULT: u64 = 8 * 1024 * 1024;

// =============================================================================
// Network
// =============================================================================

/// Send-queue depth that triggers a warning log
pub const NET_SEND_QUEUE_WARN_COUNT: usize = 64;

/// Default send-queue depth that closes the connection with
/// `send_queue_overflow`; overridable per connection
pub const NET_SEND_QUEUE_COUNT_MAX: usize = 1024;

/// Largest payload of a single length-prefixed frame (the high bit of the
/// u16 length word is the chunked-mode continuation marker)
pub const FRAME_SIZE_BYTES_MAX: usize = 0x7FFF;

/// Head room reserved in fresh buffers so framing can prepend a length
/// prefix without reallocating
pub const BUFFER_HEAD_RESERVE_BYTES: usize = 16;

/// Receive-buffer growth step for connection reads
pub const NET_RECV_CHUNK_BYTES: usize = 8 * 1024;

/// Interval of the coarse per-worker sweep that closes idle connections
pub const NET_TIMEOUT_SWEEP_INTERVAL_SECS: u64 = 10;

// Compile-time assertions for constant validity
const _: () = {
    assert!(WORKER_COUNT_MAX <= 0xFF);
    assert!(SERVICE_SEQ_COUNT_MAX <= 0x00FF_FFFF);
    assert!(SOCKET_COUNT_MAX <= 0xFFFF);
    assert!(FRAME_SIZE_BYTES_MAX < 0x8000); // high bit is the chunk marker
    assert!(NET_SEND_QUEUE_WARN_COUNT < NET_SEND_QUEUE_COUNT_MAX);
    assert!(BUFFER_HEAD_RESERVE_BYTES >= 2); // u16 length prefix must fit
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fd_layout_fits() {
        // worker id (16 bits) | counter (16 bits)
        let fd = ((WORKER_COUNT_MAX as u32) << 16) | SOCKET_COUNT_MAX;
        assert_eq!(fd >> 16, WORKER_COUNT_MAX as u32);
        assert_eq!(fd & 0xFFFF, SOCKET_COUNT_MAX);
    }

    #[test]
    fn test_service_id_layout_fits() {
        let id = ((WORKER_COUNT_MAX as u32) << 24) | SERVICE_SEQ_COUNT_MAX;
        assert_eq!(id >> 24, WORKER_COUNT_MAX as u32);
        assert_eq!(id & 0x00FF_FFFF, SERVICE_SEQ_COUNT_MAX);
    }
}

//! Protocol limits and runtime defaults
//!
//! Frame and quantity limits come from the Modbus application protocol
//! specification; the defaults below them are what a freshly configured
//! connection, reader or writer uses when a field is left out.

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header length up to and including the length field:
/// Transaction ID(2) + Protocol ID(2) + Length(2)
pub const MBAP_HEADER_LEN: usize = 6;

/// Protocol identifier carried in every MBAP header (always 0 for Modbus)
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Maximum PDU size: RS485 ADU (256) - slave address (1) - CRC (2)
pub const MAX_PDU_SIZE: usize = 253;

/// Largest legal value of the MBAP length field (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

// ============================================================================
// Quantity Limits
// ============================================================================

/// FC03/FC04: 1 + 1 + N*2 <= 253
pub const MAX_READ_REGISTERS: usize = 125;

/// FC16: 1 + 2 + 2 + 1 + N*2 <= 253
pub const MAX_WRITE_REGISTERS: usize = 123;

/// FC01/FC02, rounded down from 2008
pub const MAX_READ_COILS: usize = 2000;

/// FC15 (0x7B0)
pub const MAX_WRITE_COILS: usize = 1968;

// ============================================================================
// Runtime Defaults
// ============================================================================

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Default unit identifier
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Default per-transaction response timeout
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 15_000;

/// Default delay before an automatic reconnect attempt
pub const DEFAULT_RECONNECT_TIMEOUT_MS: u64 = 5_000;

/// Longest polling interval, the largest timer delay a flow host accepts
pub const MAX_POLL_INTERVAL_MS: u64 = 2_147_483_647;

/// Capacity of the lifecycle event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MBAP_HEADER_LEN, 6);
        assert_eq!(MAX_PDU_SIZE, 253);
        assert_eq!(MAX_MBAP_LENGTH, 254);
    }

    #[test]
    fn test_quantity_limits_fit_in_pdu() {
        assert!(1 + 1 + MAX_READ_REGISTERS * 2 <= MAX_PDU_SIZE);
        assert!(1 + 2 + 2 + 1 + MAX_WRITE_REGISTERS * 2 <= MAX_PDU_SIZE);
        assert!(1 + 1 + MAX_READ_COILS.div_ceil(8) <= MAX_PDU_SIZE);
        assert!(1 + 2 + 2 + 1 + MAX_WRITE_COILS.div_ceil(8) <= MAX_PDU_SIZE);
    }
}

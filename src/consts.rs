//! Constants of the TP1 physical layer and telegram framing.
//!
//! All timing values are in microseconds and assume the bus timer is
//! prescaled to one tick per microsecond. They derive from the nominal
//! 104 µs bit cell of the twisted-pair medium.

/// Nominal length of one bit cell on the wire (104 µs).
pub const BIT_TIME: u16 = 104;

/// Threshold for assigning a capture to the next bit cell (69 µs).
///
/// A falling edge arriving at least this long after the previous sampled
/// "0" belongs to a later cell; everything closer is jitter of the same
/// pulse.
pub const BIT_WAIT_TIME: u16 = 69;

/// Width of the dominant pulse that encodes a logical "0" (35 µs).
pub const BIT_PULSE_TIME: u16 = 35;

/// Maximum time from start bit to stop bit, with a safety margin:
/// `BIT_TIME * 10 + BIT_TIME / 2`.
pub const BYTE_TIME: u16 = 1090;

/// Time to wait before emitting an acknowledge byte, measured from the end
/// of the received telegram: roughly `BIT_TIME * 11 + BIT_TIME / 4`.
pub const SEND_ACK_WAIT_TIME: u16 = 1177;

/// Inter-frame gap before an ordinary transmission may start
/// (`BIT_TIME * 50`).
pub const SEND_WAIT_TIME: u16 = 5200;

/// Time spent listening for bus activity immediately before a programmed
/// start bit (`BIT_TIME * 1`).
pub const PRE_SEND_TIME: u16 = 104;

/// Capacity of a telegram buffer in octets, checksum included.
pub const TELEGRAM_SIZE: usize = 23;

/// Acknowledge byte: the telegram was received and accepted.
pub const BUS_ACK: u8 = 0xcc;

/// Negative acknowledge byte: the telegram was received damaged.
pub const BUS_NACK: u8 = 0x0c;

/// Busy byte: the receiver cannot process the telegram right now.
/// Received only; this transceiver never emits it and treats it as
/// "not acknowledged".
pub const BUS_BUSY: u8 = 0xc0;

/// Repeat flag in the control octet: 1 = not repeated, 0 = repeated.
pub const REPEAT_FLAG: u8 = 0x20;

/// Group/individual addressing flag in octet 5.
pub const GROUP_ADDRESS_FLAG: u8 = 0x80;

/// Number of transmission attempts after which a telegram is abandoned.
pub const MAX_SEND_TRIES: u8 = 4;

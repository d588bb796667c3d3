//! Hardware timer contract of the bus core.
//!
//! The transceiver is generic over one free-running 16-bit timer with at
//! least one capture input and two match outputs:
//!
//! * the **capture channel** latches the counter on a falling edge of the
//!   receive pin and can raise an interrupt,
//! * the **PWM match channel** drives the transmit pin low from the match
//!   value until the counter resets, generating the dominant pulses,
//! * the **timeout match channel** raises an interrupt (and resets the
//!   counter) when the counter reaches the programmed value.
//!
//! The timer must be prescaled so that one tick equals one microsecond.
//! A deterministic host implementation for driving the interrupt handler
//! from tests lives in [`sim`].

#[cfg(feature = "timer-isr")]
pub mod isr;

#[cfg(feature = "timer-isr")]
mod macros;

#[cfg(any(test, feature = "std"))]
pub mod sim;

/// A capture channel of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture(
    /// Channel number.
    pub u8,
);

/// A match channel of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match(
    /// Channel number.
    pub u8,
);

/// Capture channel 0.
pub const CAP0: Capture = Capture(0);
/// Capture channel 1.
pub const CAP1: Capture = Capture(1);

/// Match channel 0.
pub const MAT0: Match = Match(0);
/// Match channel 1.
pub const MAT1: Match = Match(1);
/// Match channel 2.
pub const MAT2: Match = Match(2);
/// Match channel 3.
pub const MAT3: Match = Match(3);

/// Mode bits for [`Timer::capture_mode`].
pub mod capture_mode {
    /// Latch the counter on a falling edge.
    pub const FALLING_EDGE: u8 = 0x01;
    /// Raise an interrupt on capture.
    pub const INTERRUPT: u8 = 0x02;
}

/// Mode bits for [`Timer::match_mode`].
pub mod match_mode {
    /// Raise an interrupt on match.
    pub const INTERRUPT: u8 = 0x01;
    /// Reset the counter on match.
    pub const RESET: u8 = 0x02;
}

/// The timer peripheral the bus runs on.
///
/// Implementations wrap a concrete hardware timer (or, for tests, a
/// simulated one). All tick values are in prescaled timer ticks; the bus
/// assumes 1 µs per tick.
pub trait Timer {
    /// Powers up and resets the peripheral.
    fn begin(&mut self);

    /// Sets the prescaler reload value. A factor of
    /// `core_clock / 1_000_000 - 1` yields the required 1 MHz tick.
    fn prescaler(&mut self, factor: u16);

    /// Starts the counter.
    fn start(&mut self);

    /// Resets the counter to zero and lets it continue running.
    fn restart(&mut self);

    /// Current counter value.
    fn value(&self) -> u16;

    /// Overwrites the counter value.
    fn set_value(&mut self, ticks: u16);

    /// Last value latched by the capture channel.
    fn capture(&self, channel: Capture) -> u16;

    /// Configures edge selection and interrupt generation of a capture
    /// channel from [`capture_mode`] bits. A mode without
    /// [`capture_mode::INTERRUPT`] keeps latching but stays silent.
    fn capture_mode(&mut self, channel: Capture, mode: u8);

    /// Reads back the programmed match value of a channel.
    fn match_value(&self, channel: Match) -> u16;

    /// Programs the match value of a channel.
    fn set_match(&mut self, channel: Match, ticks: u16);

    /// Configures interrupt/reset behaviour of a match channel from
    /// [`match_mode`] bits.
    fn match_mode(&mut self, channel: Match, mode: u8);

    /// Routes a match channel to its output pin (PWM operation): the pin
    /// is driven low from the match value until the counter resets.
    fn pwm_enable(&mut self, channel: Match);

    /// True if the capture channel latched an edge since the last
    /// [`reset_flags`](Timer::reset_flags).
    fn capture_flag(&self, channel: Capture) -> bool;

    /// True if the match channel fired since the last
    /// [`reset_flags`](Timer::reset_flags).
    fn match_flag(&self, channel: Match) -> bool;

    /// Clears all capture and match flags. Called on interrupt exit.
    fn reset_flags(&mut self);

    /// Enables the timer's interrupt line.
    fn interrupts(&mut self);
}

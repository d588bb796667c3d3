//! Deterministic timer for host-side tests.
//!
//! [`SimTimer`] implements [`Timer`](super::Timer) as a plain register
//! file. A test plays the role of the hardware: it latches capture values,
//! raises match flags, positions the counter, and then calls the bus
//! interrupt handler. Every programmed match value is journalled so tests
//! can assert when pulses and timeouts were scheduled.

use super::{Capture, Match, Timer};

/// Simulated capture/match timer.
#[derive(Debug, Default)]
pub struct SimTimer {
    counter: u16,
    prescaler: u16,
    started: bool,
    match_regs: [u16; 4],
    match_modes: [u8; 4],
    capture_regs: [u16; 4],
    capture_modes: [u8; 4],
    match_flags: [bool; 4],
    capture_flags: [bool; 4],
    pwm_channels: [bool; 4],
    interrupts_enabled: bool,
    match_journal: Vec<(u8, u16)>,
}

impl SimTimer {
    /// Creates a timer with all registers cleared.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latches a falling edge on a capture channel at the given counter
    /// value and raises the channel flag.
    pub fn edge(&mut self, channel: Capture, at: u16) {
        self.capture_regs[channel.0 as usize] = at;
        self.capture_flags[channel.0 as usize] = true;
        self.counter = at;
    }

    /// Raises the flag of a match channel, as the hardware would on a
    /// counter match.
    pub fn timeout(&mut self, channel: Match) {
        self.match_flags[channel.0 as usize] = true;
        self.counter = self.match_regs[channel.0 as usize];
    }

    /// Positions the counter without touching any flags.
    pub fn set_counter(&mut self, ticks: u16) {
        self.counter = ticks;
    }

    /// The configured prescaler reload value.
    pub fn prescaler_value(&self) -> u16 {
        self.prescaler
    }

    /// True once `start()` has been called.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// True if the channel was routed to its pin.
    pub fn pwm_enabled(&self, channel: Match) -> bool {
        self.pwm_channels[channel.0 as usize]
    }

    /// The configured mode bits of a capture channel.
    pub fn capture_mode_bits(&self, channel: Capture) -> u8 {
        self.capture_modes[channel.0 as usize]
    }

    /// The configured mode bits of a match channel.
    pub fn match_mode_bits(&self, channel: Match) -> u8 {
        self.match_modes[channel.0 as usize]
    }

    /// All values programmed into a match channel, oldest first.
    pub fn match_history(&self, channel: Match) -> Vec<u16> {
        self.match_journal
            .iter()
            .filter(|(ch, _)| *ch == channel.0)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Forgets the journal, typically after arranging a scenario.
    pub fn clear_history(&mut self) {
        self.match_journal.clear();
    }
}

impl Timer for SimTimer {
    fn begin(&mut self) {
        *self = Self::default();
    }

    fn prescaler(&mut self, factor: u16) {
        self.prescaler = factor;
    }

    fn start(&mut self) {
        self.started = true;
    }

    fn restart(&mut self) {
        self.counter = 0;
    }

    fn value(&self) -> u16 {
        self.counter
    }

    fn set_value(&mut self, ticks: u16) {
        self.counter = ticks;
    }

    fn capture(&self, channel: Capture) -> u16 {
        self.capture_regs[channel.0 as usize]
    }

    fn capture_mode(&mut self, channel: Capture, mode: u8) {
        self.capture_modes[channel.0 as usize] = mode;
    }

    fn match_value(&self, channel: Match) -> u16 {
        self.match_regs[channel.0 as usize]
    }

    fn set_match(&mut self, channel: Match, ticks: u16) {
        self.match_regs[channel.0 as usize] = ticks;
        self.match_journal.push((channel.0, ticks));
    }

    fn match_mode(&mut self, channel: Match, mode: u8) {
        self.match_modes[channel.0 as usize] = mode;
    }

    fn pwm_enable(&mut self, channel: Match) {
        self.pwm_channels[channel.0 as usize] = true;
    }

    fn capture_flag(&self, channel: Capture) -> bool {
        self.capture_flags[channel.0 as usize]
    }

    fn match_flag(&self, channel: Match) -> bool {
        self.match_flags[channel.0 as usize]
    }

    fn reset_flags(&mut self) {
        self.match_flags = [false; 4];
        self.capture_flags = [false; 4];
    }

    fn interrupts(&mut self) {
        self.interrupts_enabled = true;
    }
}

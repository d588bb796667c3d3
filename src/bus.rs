//! The bus transceiver: one state machine, one timer interrupt.
//!
//! [`Bus`] owns the capture/match timer and runs the complete TP1 link
//! layer inside [`timer_interrupt`](Bus::timer_interrupt): start-bit
//! detection, bit sampling by capture timestamps, parity and checksum
//! accumulation, acknowledge emission, pulse scheduling through the PWM
//! match channel, collision arbitration during "1" cells, and retry
//! bookkeeping. The foreground interacts with it through a two-slot send
//! queue and a polled receive latch.
//!
//! ## Timer programming model
//!
//! * The capture channel latches falling edges of the receive pin.
//! * The PWM match channel drives the transmit pin; a match value of
//!   `0xffff` keeps the line undriven.
//! * The timeout match channel resets the counter when it fires, so all
//!   times are relative to the last cell boundary or start bit.
//!
//! ## Concurrency
//!
//! [`timer_interrupt`] runs to completion on every capture or match
//! event. Foreground calls ([`try_send_telegram`](Bus::try_send_telegram),
//! [`receive`](Bus::receive)) must be serialized against it, e.g. by
//! calling them inside `critical_section::with`; the [`crate::timer::isr`]
//! helpers do exactly that. Outbound buffers follow the single-writer
//! rules documented on [`TelegramBuf`].

use embedded_hal::digital::OutputPin;

use crate::config::BusConfig;
use crate::consts::{
    BIT_PULSE_TIME, BIT_TIME, BIT_WAIT_TIME, BUS_ACK, BUS_NACK, BYTE_TIME, MAX_SEND_TRIES,
    PRE_SEND_TIME, REPEAT_FLAG, SEND_ACK_WAIT_TIME, SEND_WAIT_TIME, TELEGRAM_SIZE,
};
use crate::telegram::{self, TelegramBuf};
use crate::timer::{capture_mode, match_mode, Capture, Match, Timer};

#[cfg(not(feature = "std"))]
use heapless::Vec;
#[cfg(feature = "std")]
use std::vec::Vec;

/// The states of the transceiver.
///
/// The machine cycles forever; there is no terminal state. Receive states
/// are entered from [`Idle`](BusState::Idle) on a falling-edge capture,
/// send states from the timeout that ends the inter-frame gap.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
pub enum BusState {
    /// The bus is idle and the capture channel is armed.
    #[default]
    Idle,
    /// A start bit is expected; a timeout here ends the telegram.
    RecvStart,
    /// Inside a byte, sampling bits by capture time differences.
    RecvByte,
    /// Deciding what to transmit once the inter-frame gap has elapsed.
    SendInit,
    /// The start bit of the first byte is programmed into the PWM match.
    SendStartBit,
    /// Loading the next outbound byte and its parity bit.
    SendByteStart,
    /// Scheduling the pulse for the next "0" bit.
    SendBit,
    /// Listening for foreign edges while "1" cells pass undriven.
    SendBitWait,
    /// The last bit of the telegram has been emitted.
    SendEnd,
    /// Waiting for the acknowledge byte or the retry timeout.
    SendWait,
}

/// Errors of [`Bus::try_send_telegram`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError {
    /// The telegram plus its checksum octet does not fit a buffer.
    TooLong,
    /// The buffer is already queued for transmission.
    AlreadyQueued,
    /// The global bus cell has not been set up yet.
    Uninitialized,
}

impl core::fmt::Display for SendError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SendError::TooLong => write!(f, "telegram exceeds the buffer capacity"),
            SendError::AlreadyQueued => write!(f, "buffer is already queued"),
            SendError::Uninitialized => write!(f, "bus has not been initialized"),
        }
    }
}

/// The TP1 bus transceiver.
///
/// Generic over the hardware [`Timer`], the transmit pin (driven low once
/// at [`begin`](Bus::begin); afterwards the PWM match owns it) and the
/// [`BusConfig`] collaborator.
pub struct Bus<T, TX, C>
where
    T: Timer,
    TX: OutputPin,
    C: BusConfig,
{
    timer: T,
    tx: TX,
    config: C,
    capture_channel: Capture,
    pwm_channel: Match,
    time_channel: Match,

    state: BusState,
    own_addr: u16,
    collision: bool,

    // receive side
    telegram: [u8; TELEGRAM_SIZE],
    telegram_len: usize,
    next_byte_index: usize,
    current_byte: u16,
    bit_mask: u16,
    bit_time: u16,
    parity: bool,
    checksum: u8,
    valid: bool,

    // send side
    send_ack: u8,
    send_cur: Option<&'static TelegramBuf>,
    send_next: Option<&'static TelegramBuf>,
    send_telegram_len: usize,
    send_tries: u8,
}

impl<T, TX, C> Bus<T, TX, C>
where
    T: Timer,
    TX: OutputPin,
    C: BusConfig,
{
    /// Creates a transceiver on the given timer channels.
    ///
    /// The timeout channel is derived from the PWM channel as
    /// `(pwm + 2) & 3`, keeping the two match channels apart on four
    /// channel timers.
    pub fn new(timer: T, tx: TX, config: C, capture_channel: Capture, pwm_channel: Match) -> Self {
        Self {
            timer,
            tx,
            config,
            capture_channel,
            pwm_channel,
            time_channel: Match((pwm_channel.0 + 2) & 3),
            state: BusState::Idle,
            own_addr: 0,
            collision: false,
            telegram: [0; TELEGRAM_SIZE],
            telegram_len: 0,
            next_byte_index: 0,
            current_byte: 0,
            bit_mask: 0,
            bit_time: 0,
            parity: false,
            checksum: 0,
            valid: false,
            send_ack: 0,
            send_cur: None,
            send_next: None,
            send_telegram_len: 0,
            send_tries: 0,
        }
    }

    /// Brings up the transceiver.
    ///
    /// Latches the own address from the configuration, forces the
    /// transmit pin to the idle level, arms the falling-edge capture
    /// interrupt and prescales the timer to the 1 µs tick (`prescaler` is
    /// typically `core_clock / 1_000_000 - 1`). Must be called before the
    /// first telegram is queued.
    pub fn begin(&mut self, prescaler: u16) {
        self.own_addr = self.config.own_address();

        self.telegram_len = 0;
        self.state = BusState::Idle;
        self.send_ack = 0;
        self.send_cur = None;
        self.send_next = None;
        self.collision = false;

        self.timer.begin();

        let _ = self.tx.set_low();

        self.timer.pwm_enable(self.pwm_channel);
        self.timer
            .capture_mode(self.capture_channel, capture_mode::FALLING_EDGE | capture_mode::INTERRUPT);
        self.timer.start();
        self.timer.interrupts();
        self.timer.prescaler(prescaler);

        self.timer.set_match(self.time_channel, 0xfffe);
        self.timer.match_mode(self.time_channel, match_mode::RESET);
        self.timer.set_match(self.pwm_channel, 0xffff);
    }

    /// Current state of the machine.
    pub fn state(&self) -> BusState {
        self.state
    }

    /// Length of the published received telegram, zero if none.
    pub fn received_len(&self) -> usize {
        self.telegram_len
    }

    /// Takes the published received telegram, checksum octet included.
    ///
    /// Returns `None` while nothing is published. Consume it promptly:
    /// the latch is overwritten by the next accepted telegram.
    #[cfg(not(feature = "std"))]
    pub fn receive(&mut self) -> Option<Vec<u8, TELEGRAM_SIZE>> {
        if self.telegram_len == 0 {
            return None;
        }
        let len = self.telegram_len;
        self.telegram_len = 0;
        Vec::from_slice(&self.telegram[..len]).ok()
    }

    /// Takes the published received telegram, checksum octet included.
    ///
    /// Returns `None` while nothing is published. Consume it promptly:
    /// the latch is overwritten by the next accepted telegram.
    #[cfg(feature = "std")]
    pub fn receive(&mut self) -> Option<Vec<u8>> {
        if self.telegram_len == 0 {
            return None;
        }
        let len = self.telegram_len;
        self.telegram_len = 0;
        Some(Vec::from(&self.telegram[..len]))
    }

    /// Queues a telegram for transmission.
    ///
    /// `length` is the telegram length without the checksum octet. The
    /// sender address is stamped into octets 1..=2 and the checksum is
    /// stored at `telegram[length]`, then the buffer is claimed until the
    /// bus releases it by writing `0` into octet 0.
    ///
    /// Returns `nb::Error::WouldBlock` while both send slots are
    /// occupied. Call inside a critical section; the kick-start below
    /// must not be separated from the state check by a capture interrupt.
    pub fn try_send_telegram(
        &mut self,
        buffer: &'static TelegramBuf,
        length: usize,
    ) -> nb::Result<(), SendError> {
        if length + 1 > TELEGRAM_SIZE {
            return Err(nb::Error::Other(SendError::TooLong));
        }
        if buffer.is_claimed() {
            return Err(nb::Error::Other(SendError::AlreadyQueued));
        }
        if self.send_next.is_some() {
            return Err(nb::Error::WouldBlock);
        }

        buffer.claim();
        let own_addr = self.own_addr;
        // Safety: claimed above; the interrupt does not look at the
        // buffer until it is installed in a slot below.
        unsafe {
            buffer.with_claimed(|data| {
                data[1] = (own_addr >> 8) as u8;
                data[2] = own_addr as u8;
                let check = telegram::checksum(&data[..length]);
                data[length] = check;
            });
        }

        if self.send_cur.is_none() {
            self.send_cur = Some(buffer);
        } else {
            self.send_next = Some(buffer);
        }

        // Kick-start if the bus is idle: a minimal timeout makes the
        // interrupt run SendInit almost immediately.
        if self.state == BusState::Idle {
            self.send_tries = 0;
            self.state = BusState::SendInit;
            self.timer.set_match(self.time_channel, 1);
            self.timer
                .match_mode(self.time_channel, match_mode::INTERRUPT | match_mode::RESET);
            self.timer.set_value(0);
        }
        Ok(())
    }

    /// The timer interrupt: runs the state machine for one capture or
    /// match event, then clears the timer flags.
    ///
    /// The loop re-enters the dispatch where the machine changes state
    /// and must handle the same event again (start of reception from
    /// idle, yielding to a receiver during send setup, byte chaining
    /// while transmitting).
    pub fn timer_interrupt(&mut self) {
        loop {
            match self.state {
                // Usually entered by a capture event on bus-in.
                BusState::Idle => {
                    if !self.timer.capture_flag(self.capture_channel) {
                        break;
                    }
                    self.next_byte_index = 0;
                    self.collision = false;
                    self.checksum = 0xff;
                    self.send_ack = 0;
                    self.valid = true;
                    self.state = BusState::RecvStart;
                    continue;
                }

                // A start bit is expected here; a timeout instead means
                // the transmission is over.
                BusState::RecvStart => {
                    if !self.timer.capture_flag(self.capture_channel) {
                        let ok = self.valid && self.checksum == 0;
                        self.handle_telegram(ok);
                        break;
                    }

                    self.timer.set_match(self.time_channel, BYTE_TIME);
                    self.timer.restart();
                    self.timer
                        .match_mode(self.time_channel, match_mode::INTERRUPT | match_mode::RESET);

                    self.state = BusState::RecvByte;
                    self.current_byte = 0;
                    self.bit_time = 0;
                    self.bit_mask = 1;
                    self.parity = true;
                    break;
                }

                BusState::RecvByte => {
                    let timeout = self.timer.match_flag(self.time_channel);
                    let time = if timeout {
                        BYTE_TIME
                    } else {
                        self.timer.capture(self.capture_channel)
                    };

                    // Every cell between the last sampled "0" and this
                    // edge passed undriven and reads as "1".
                    if time >= self.bit_time + BIT_WAIT_TIME {
                        self.bit_time += BIT_TIME;
                        while time >= self.bit_time + BIT_WAIT_TIME && self.bit_mask <= 0x100 {
                            self.current_byte |= self.bit_mask;
                            self.parity = !self.parity;

                            self.bit_time += BIT_TIME;
                            self.bit_mask <<= 1;
                        }

                        self.bit_mask <<= 1;
                    }

                    if timeout {
                        // End of byte.
                        self.valid = self.valid && self.parity;
                        if self.next_byte_index < TELEGRAM_SIZE {
                            self.telegram[self.next_byte_index] = self.current_byte as u8;
                            self.next_byte_index += 1;
                            self.checksum ^= self.current_byte as u8;
                        }

                        // Wait for the next byte's start bit.
                        self.state = BusState::RecvStart;
                        self.timer.set_match(self.time_channel, BIT_TIME * 4);
                    }
                    break;
                }

                // Entered PRE_SEND_TIME before the start bit would go
                // out, after every reception or transmission, even when
                // nothing is to be sent.
                BusState::SendInit => {
                    if self.timer.capture_flag(self.capture_channel) {
                        // Bus input while waiting: enter receive mode.
                        self.state = BusState::Idle;
                        continue;
                    }

                    let time: u16;
                    if self.send_ack != 0 {
                        time = PRE_SEND_TIME;
                        self.send_telegram_len = 0;
                    } else {
                        if self.send_tries >= MAX_SEND_TRIES {
                            debug!("giving up on telegram after {} attempts", self.send_tries);
                            self.send_next_telegram();
                        }

                        if let Some(cur) = self.send_cur {
                            // Safety: the slot holds the claim.
                            let (control, size) =
                                unsafe { cur.with_claimed(|data| (data[0], telegram::telegram_size(data))) };
                            time = PRE_SEND_TIME + telegram::priority(control) as u16 * BIT_TIME;
                            self.send_telegram_len = size + 1;

                            if self.send_tries == 1 {
                                // First repeat: mark the telegram as
                                // repeated and correct the checksum. The
                                // extra increment keeps later failures
                                // from inverting the flag again.
                                let last = self.send_telegram_len - 1;
                                unsafe {
                                    cur.with_claimed(|data| {
                                        data[0] &= !REPEAT_FLAG;
                                        data[last] ^= REPEAT_FLAG;
                                    });
                                }
                                self.send_tries += 1;
                            }
                        } else {
                            self.idle_state();
                            break;
                        }
                    }

                    self.timer.set_match(self.pwm_channel, time);
                    self.timer.set_match(self.time_channel, time + BIT_PULSE_TIME);
                    self.timer
                        .match_mode(self.time_channel, match_mode::RESET | match_mode::INTERRUPT);
                    self.timer.capture_mode(
                        self.capture_channel,
                        capture_mode::FALLING_EDGE | capture_mode::INTERRUPT,
                    );

                    self.next_byte_index = 0;
                    self.state = BusState::SendStartBit;
                    break;
                }

                // The start bit of the first byte is going out. Normally
                // this runs when the capture channel sees our own flank;
                // it may also be somebody else's start bit, or a timeout
                // if the receive path is broken.
                BusState::SendStartBit => {
                    if self.timer.capture_flag(self.capture_channel) {
                        if self.timer.value() < self.timer.match_value(self.pwm_channel) - 10 {
                            // Somebody else started early enough to
                            // abort: surrender the bus.
                            self.timer.set_match(self.pwm_channel, 0xffff);
                            self.state = BusState::RecvStart;
                            continue;
                        }

                        self.state = BusState::SendByteStart;
                        break;
                    }

                    if self.timer.match_flag(self.time_channel) {
                        // Our own pulse never came back on the capture
                        // input; carry on transmitting regardless.
                        debug!("transmit feedback missing on start bit");
                    }
                    self.state = BusState::SendByteStart;
                    continue;
                }

                BusState::SendByteStart => {
                    self.current_byte = if self.send_ack != 0 {
                        self.send_ack as u16
                    } else if let Some(cur) = self.send_cur {
                        let index = self.next_byte_index;
                        self.next_byte_index += 1;
                        // Safety: the slot holds the claim.
                        let byte = unsafe { cur.with_claimed(|data| data[index]) };
                        byte as u16
                    } else {
                        self.idle_state();
                        break;
                    };

                    self.current_byte = telegram::parity_extend(self.current_byte as u8);
                    self.bit_mask = 1;
                    self.state = BusState::SendBit;
                    continue;
                }

                BusState::SendBit => {
                    // Find the next "0" bit, dead reckoning across the
                    // run of "1" bits before it.
                    let mut time = BIT_TIME;
                    while self.current_byte & self.bit_mask != 0 && self.bit_mask <= 0x100 {
                        self.bit_mask <<= 1;
                        time += BIT_TIME;
                    }
                    self.bit_mask <<= 1;

                    self.state = if time <= BIT_TIME {
                        BusState::SendBit
                    } else {
                        // Collisions can only be seen during "1" cells.
                        BusState::SendBitWait
                    };

                    if self.bit_mask > 0x200 {
                        // Parity bit consumed: stop bit plus inter-byte
                        // gap, then the next byte or the end.
                        time += BIT_TIME * 3;

                        if self.next_byte_index < self.send_telegram_len && self.send_ack == 0 {
                            self.state = BusState::SendByteStart;
                        } else {
                            self.state = BusState::SendEnd;
                        }
                    }

                    if self.state == BusState::SendBitWait {
                        self.timer.capture_mode(
                            self.capture_channel,
                            capture_mode::FALLING_EDGE | capture_mode::INTERRUPT,
                        );
                    } else {
                        self.timer
                            .capture_mode(self.capture_channel, capture_mode::FALLING_EDGE);
                    }

                    if self.state == BusState::SendEnd {
                        self.timer.set_match(self.pwm_channel, 0xffff);
                    } else {
                        self.timer.set_match(self.pwm_channel, time - BIT_PULSE_TIME);
                    }

                    self.timer.set_match(self.time_channel, time);
                    break;
                }

                // A capture event while "1" cells pass. Either our next
                // "0" pulse, or a foreign transmitter.
                BusState::SendBitWait => {
                    if self.timer.capture(self.capture_channel)
                        < self.timer.match_value(self.pwm_channel) - BIT_WAIT_TIME
                    {
                        trace!("collision, becoming receiver");
                        self.timer.set_match(self.pwm_channel, 0xffff);
                        self.state = BusState::RecvByte;
                        self.collision = true;
                        break;
                    }
                    self.state = BusState::SendBit;
                    break;
                }

                BusState::SendEnd => {
                    self.timer.set_match(self.time_channel, SEND_WAIT_TIME);
                    self.timer.capture_mode(
                        self.capture_channel,
                        capture_mode::FALLING_EDGE | capture_mode::INTERRUPT,
                    );

                    if self.send_ack != 0 {
                        self.send_ack = 0;
                    } else {
                        self.send_tries += 1;
                    }

                    self.state = BusState::SendWait;
                    break;
                }

                // Wait for an acknowledge byte, or for the retry slot.
                BusState::SendWait => {
                    if self.timer.capture_flag(self.capture_channel)
                        && self.timer.capture(self.capture_channel) < SEND_ACK_WAIT_TIME
                    {
                        // Edges this early cannot be an acknowledge.
                        break;
                    }
                    // SendInit also hands pending captures to the
                    // receive path.
                    self.state = BusState::SendInit;
                    continue;
                }
            }
        }

        self.timer.reset_flags();
    }

    /// Reception is over; decide the acknowledge and the disposition of
    /// the received bytes, then schedule the next send window.
    fn handle_telegram(&mut self, valid: bool) {
        self.send_ack = 0;

        if self.collision {
            trace!("collision during reception, bytes dropped");
        } else if self.next_byte_index >= 8 && valid {
            let dest = telegram::dest_address(&self.telegram);
            let mut process = false;

            // Acknowledge only telegrams addressed to us.
            if telegram::is_group_addressed(&self.telegram) {
                if dest == 0 || self.config.is_group_member(dest) {
                    process = true;
                }
            } else if dest == self.own_addr {
                process = true;
            }

            if self.config.promiscuous() {
                self.telegram_len = self.next_byte_index;
                trace!("published telegram of {} octets", self.telegram_len);
            } else if process {
                self.telegram_len = self.next_byte_index;
                self.send_ack = BUS_ACK;
                trace!("published telegram of {} octets", self.telegram_len);
            }
        } else if self.next_byte_index == 1 {
            // A spike, or the acknowledge for our previous transmission.
            let byte = (self.current_byte & 0xff) as u8;

            if (byte == BUS_ACK || self.send_tries >= MAX_SEND_TRIES) && self.send_cur.is_some() {
                self.send_next_telegram();
            }
        } else {
            // Wrong checksum, or too short for a telegram.
            self.telegram_len = 0;
            self.send_ack = BUS_NACK;
        }

        // Always pass through SendInit, which cancels if there is
        // nothing to send. Going straight to Idle here would let the
        // foreground kick off a transmission inside the cooldown.
        self.timer.set_match(
            self.time_channel,
            if self.send_ack != 0 {
                SEND_ACK_WAIT_TIME - PRE_SEND_TIME
            } else {
                SEND_WAIT_TIME - PRE_SEND_TIME
            },
        );
        self.timer
            .match_mode(self.time_channel, match_mode::INTERRUPT | match_mode::RESET);

        self.timer.capture_mode(
            self.capture_channel,
            capture_mode::FALLING_EDGE | capture_mode::INTERRUPT,
        );

        self.collision = false;
        self.state = BusState::SendInit;
    }

    /// Finishes the current outbound telegram: octet 0 is zeroed as the
    /// completion signal, the buffer is released to its owner, and the
    /// next queued telegram moves up.
    fn send_next_telegram(&mut self) {
        if let Some(cur) = self.send_cur.take() {
            // Safety: the slot held the claim until this release.
            unsafe {
                cur.with_claimed(|data| data[0] = 0);
            }
            cur.release();
        }
        self.send_cur = self.send_next.take();
        self.send_tries = 0;
        self.send_telegram_len = 0;
    }

    /// Returns to the idle state with the capture interrupt armed and
    /// both match channels parked.
    fn idle_state(&mut self) {
        self.timer.capture_mode(
            self.capture_channel,
            capture_mode::FALLING_EDGE | capture_mode::INTERRUPT,
        );

        self.timer.match_mode(self.time_channel, match_mode::RESET);
        self.timer.set_match(self.time_channel, 0xfffe);
        self.timer.set_match(self.pwm_channel, 0xffff);

        self.state = BusState::Idle;
        self.send_ack = 0;
    }
}

impl<T, TX, C> core::fmt::Debug for Bus<T, TX, C>
where
    T: Timer,
    TX: OutputPin,
    C: BusConfig,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bus")
            .field("state", &self.state)
            .field("own_addr", &self.own_addr)
            .field("collision", &self.collision)
            .field("telegram_len", &self.telegram_len)
            .field("send_tries", &self.send_tries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfig;
    use crate::timer::sim::SimTimer;
    use crate::timer::CAP0;
    use embedded_hal_mock::eh1::digital::{
        Mock as PinMock, State as PinState, Transaction as PinTransaction,
    };

    const CAPTURE: Capture = CAP0;
    const PWM: Match = Match(0);
    const TIMEOUT: Match = Match(2);
    const OWN_ADDRESS: u16 = 0x1102;

    type TestBus = Bus<SimTimer, PinMock, StaticConfig>;

    fn test_bus(promiscuous: bool) -> TestBus {
        let tx = PinMock::new(&[PinTransaction::set(PinState::Low)]);
        let config = StaticConfig {
            address: OWN_ADDRESS,
            groups: &[0x0001],
            promiscuous,
        };
        let mut bus = Bus::new(SimTimer::new(), tx, config, CAPTURE, PWM);
        bus.begin(47);
        bus
    }

    /// Plays one wire byte into the receiver: the start-bit edge, one
    /// edge per "0" bit of the 9-bit pattern, and the end-of-byte
    /// timeout.
    fn feed_raw(bus: &mut TestBus, pattern: u16) {
        bus.timer.edge(CAPTURE, 0);
        bus.timer_interrupt();
        for bit in 0..9u16 {
            if pattern & (1 << bit) == 0 {
                bus.timer.edge(CAPTURE, (bit + 1) * BIT_TIME);
                bus.timer_interrupt();
            }
        }
        bus.timer.timeout(TIMEOUT);
        bus.timer_interrupt();
    }

    fn feed_byte(bus: &mut TestBus, byte: u8) {
        feed_raw(bus, telegram::parity_extend(byte));
    }

    /// The inter-byte timeout elapses without a further start bit.
    fn end_telegram(bus: &mut TestBus) {
        bus.timer.timeout(TIMEOUT);
        bus.timer_interrupt();
    }

    fn feed_frame(bus: &mut TestBus, bytes: &[u8]) {
        for &byte in bytes {
            feed_byte(bus, byte);
        }
        end_telegram(bus);
    }

    /// A group- or individually-addressed test frame with a correct
    /// checksum octet at the end.
    fn frame_to(dest: u16, addressing: u8) -> [u8; 9] {
        let mut frame = [
            0xbc,
            0x11,
            0x01,
            (dest >> 8) as u8,
            dest as u8,
            addressing,
            0x00,
            0x81,
            0,
        ];
        frame[8] = telegram::checksum(&frame[..8]);
        frame
    }

    /// Fires the pre-send timeout so SendInit arms the start bit.
    fn kick(bus: &mut TestBus) {
        bus.timer.timeout(TIMEOUT);
        bus.timer_interrupt();
        assert_eq!(bus.state(), BusState::SendStartBit);
    }

    /// Drives a transmission from SendStartBit to SendWait, reflecting
    /// the bus's own pulses back on the capture channel.
    fn run_send_attempt(bus: &mut TestBus) {
        assert_eq!(bus.state(), BusState::SendStartBit);
        let pwm = bus.timer.match_value(PWM);
        bus.timer.edge(CAPTURE, pwm + 1);
        bus.timer_interrupt();
        assert_eq!(bus.state(), BusState::SendByteStart);

        loop {
            match bus.state() {
                BusState::SendByteStart | BusState::SendBit | BusState::SendEnd => {
                    bus.timer.timeout(TIMEOUT);
                    bus.timer_interrupt();
                }
                BusState::SendBitWait => {
                    let own_pulse = bus.timer.match_value(PWM);
                    bus.timer.edge(CAPTURE, own_pulse);
                    bus.timer_interrupt();
                }
                BusState::SendWait => break,
                state => panic!("unexpected state {state:?} while sending"),
            }
        }
    }

    #[test]
    fn begin_configures_the_timer() {
        let mut bus = test_bus(false);

        assert_eq!(bus.state(), BusState::Idle);
        assert_eq!(bus.own_addr, OWN_ADDRESS);
        assert!(bus.timer.is_started());
        assert_eq!(bus.timer.prescaler_value(), 47);
        assert!(bus.timer.pwm_enabled(PWM));
        assert_eq!(
            bus.timer.capture_mode_bits(CAPTURE),
            capture_mode::FALLING_EDGE | capture_mode::INTERRUPT
        );
        assert_eq!(bus.timer.match_value(TIMEOUT), 0xfffe);
        assert_eq!(bus.timer.match_value(PWM), 0xffff);
        bus.tx.done();
    }

    #[test]
    fn spurious_interrupt_in_idle_does_nothing() {
        let mut bus = test_bus(false);
        bus.timer_interrupt();
        assert_eq!(bus.state(), BusState::Idle);
        assert!(bus.receive().is_none());
        bus.tx.done();
    }

    #[test]
    fn receives_group_telegram_and_acks() {
        let mut bus = test_bus(false);
        let frame = frame_to(0x0001, 0xe1);
        feed_frame(&mut bus, &frame);

        assert_eq!(bus.received_len(), 9);
        assert_eq!(bus.send_ack, BUS_ACK);
        assert_eq!(bus.state(), BusState::SendInit);
        assert_eq!(
            bus.timer.match_value(TIMEOUT),
            SEND_ACK_WAIT_TIME - PRE_SEND_TIME
        );

        // once the wait elapses, the acknowledge start bit is armed
        kick(&mut bus);
        assert_eq!(bus.timer.match_value(PWM), PRE_SEND_TIME);

        let received = bus.receive().unwrap();
        assert_eq!(&received[..], &frame[..]);
        assert_eq!(bus.received_len(), 0);
        bus.tx.done();
    }

    #[test]
    fn ack_emission_schedules_pulses_for_zero_bits() {
        let mut bus = test_bus(false);
        feed_frame(&mut bus, &frame_to(0x0001, 0xe1));
        assert_eq!(bus.send_ack, BUS_ACK);

        bus.timer.clear_history();
        kick(&mut bus);
        run_send_attempt(&mut bus);

        // 0xcc, least significant bit first: pulses for the "0" cells,
        // dead reckoning across the "1" runs, silence at the end
        assert_eq!(
            bus.timer.match_history(PWM),
            vec![
                PRE_SEND_TIME,
                69,
                69,
                277,
                69,
                277,
                0xffff
            ]
        );
        assert_eq!(bus.send_ack, 0);
        assert_eq!(bus.state(), BusState::SendWait);
        // an acknowledge does not count as a transmission attempt
        assert_eq!(bus.send_tries, 0);
        bus.tx.done();
    }

    #[test]
    fn nack_on_corrupt_checksum() {
        let mut bus = test_bus(false);
        let mut frame = frame_to(0x0001, 0xe1);
        frame[8] ^= 0x01;
        feed_frame(&mut bus, &frame);

        assert_eq!(bus.received_len(), 0);
        assert!(bus.receive().is_none());
        assert_eq!(bus.send_ack, BUS_NACK);
        assert_eq!(
            bus.timer.match_value(TIMEOUT),
            SEND_ACK_WAIT_TIME - PRE_SEND_TIME
        );
        bus.tx.done();
    }

    #[test]
    fn bad_parity_invalidates_the_telegram() {
        let mut bus = test_bus(false);
        let frame = frame_to(0x0001, 0xe1);
        for &byte in &frame[..8] {
            feed_byte(&mut bus, byte);
        }
        // last byte arrives with its parity bit flipped
        feed_raw(&mut bus, telegram::parity_extend(frame[8]) ^ 0x100);
        assert!(!bus.valid);
        end_telegram(&mut bus);

        assert_eq!(bus.received_len(), 0);
        assert_eq!(bus.send_ack, BUS_NACK);
        bus.tx.done();
    }

    #[test]
    fn ignores_foreign_individual_telegram() {
        let mut bus = test_bus(false);
        feed_frame(&mut bus, &frame_to(0x1105, 0x61));

        assert_eq!(bus.received_len(), 0);
        assert_eq!(bus.send_ack, 0);
        assert_eq!(
            bus.timer.match_value(TIMEOUT),
            SEND_WAIT_TIME - PRE_SEND_TIME
        );
        bus.tx.done();
    }

    #[test]
    fn acks_individual_telegram_for_own_address() {
        let mut bus = test_bus(false);
        feed_frame(&mut bus, &frame_to(OWN_ADDRESS, 0x61));

        assert_eq!(bus.received_len(), 9);
        assert_eq!(bus.send_ack, BUS_ACK);
        bus.tx.done();
    }

    #[test]
    fn acks_broadcast_group_telegram() {
        let mut bus = test_bus(false);
        feed_frame(&mut bus, &frame_to(0x0000, 0xe1));

        assert_eq!(bus.received_len(), 9);
        assert_eq!(bus.send_ack, BUS_ACK);
        bus.tx.done();
    }

    #[test]
    fn unknown_group_telegram_is_dropped() {
        let mut bus = test_bus(false);
        feed_frame(&mut bus, &frame_to(0x0777, 0xe1));

        assert_eq!(bus.received_len(), 0);
        assert_eq!(bus.send_ack, 0);
        bus.tx.done();
    }

    #[test]
    fn promiscuous_publishes_foreign_traffic_without_ack() {
        let mut bus = test_bus(true);
        let frame = frame_to(0x0777, 0xe1);
        feed_frame(&mut bus, &frame);

        assert_eq!(bus.received_len(), 9);
        assert_eq!(bus.send_ack, 0);
        let received = bus.receive().unwrap();
        assert_eq!(&received[..], &frame[..]);
        bus.tx.done();
    }

    #[test]
    fn send_stamps_own_address_and_checksum() {
        let mut bus = test_bus(false);
        static BUF: TelegramBuf = TelegramBuf::new();
        BUF.access(|data| {
            data[..7].copy_from_slice(&[0xbc, 0x00, 0x00, 0x11, 0x05, 0x60, 0x80]);
        })
        .unwrap();

        bus.try_send_telegram(&BUF, 7).unwrap();
        assert!(BUF.is_claimed());

        let stamped = unsafe { BUF.with_claimed(|data| *data) };
        assert_eq!(stamped[1], (OWN_ADDRESS >> 8) as u8);
        assert_eq!(stamped[2], OWN_ADDRESS as u8);
        assert_eq!(telegram::checksum(&stamped[..8]), 0);
        bus.tx.done();
    }

    #[test]
    fn kick_start_from_idle_arms_priority_window() {
        let mut bus = test_bus(false);
        static BUF: TelegramBuf = TelegramBuf::new();
        // control octet with system priority
        BUF.access(|data| {
            data[..7].copy_from_slice(&[0xb0, 0x00, 0x00, 0x11, 0x05, 0x60, 0x80]);
        })
        .unwrap();

        bus.try_send_telegram(&BUF, 7).unwrap();
        assert_eq!(bus.state(), BusState::SendInit);
        assert_eq!(bus.timer.match_value(TIMEOUT), 1);
        assert_eq!(bus.timer.value(), 0);

        kick(&mut bus);
        assert_eq!(bus.timer.match_value(PWM), PRE_SEND_TIME);
        assert_eq!(
            bus.timer.match_value(TIMEOUT),
            PRE_SEND_TIME + BIT_PULSE_TIME
        );
        bus.tx.done();
    }

    #[test]
    fn low_priority_telegram_waits_longer() {
        let mut bus = test_bus(false);
        static BUF: TelegramBuf = TelegramBuf::new();
        BUF.access(|data| {
            data[..7].copy_from_slice(&[0xbc, 0x00, 0x00, 0x11, 0x05, 0x60, 0x80]);
        })
        .unwrap();

        bus.try_send_telegram(&BUF, 7).unwrap();
        kick(&mut bus);
        assert_eq!(bus.timer.match_value(PWM), PRE_SEND_TIME + 3 * BIT_TIME);
        bus.tx.done();
    }

    #[test]
    fn surrenders_bus_on_early_start_bit() {
        let mut bus = test_bus(false);
        static BUF: TelegramBuf = TelegramBuf::new();
        BUF.access(|data| {
            data[..7].copy_from_slice(&[0xbc, 0x00, 0x00, 0x11, 0x05, 0x60, 0x80]);
        })
        .unwrap();

        bus.try_send_telegram(&BUF, 7).unwrap();
        kick(&mut bus);
        let pwm = bus.timer.match_value(PWM);

        // somebody else drives the line 50 µs before our match
        bus.timer.edge(CAPTURE, pwm - 50);
        bus.timer_interrupt();

        assert_eq!(bus.state(), BusState::RecvByte);
        assert_eq!(bus.timer.match_value(PWM), 0xffff);
        // the telegram stays queued for a retry
        assert!(bus.send_cur.is_some());
        bus.tx.done();
    }

    #[test]
    fn early_edge_in_send_wait_is_ignored() {
        let mut bus = test_bus(false);
        static BUF: TelegramBuf = TelegramBuf::new();
        BUF.access(|data| {
            data[..7].copy_from_slice(&[0xbc, 0x00, 0x00, 0x11, 0x05, 0x60, 0x80]);
        })
        .unwrap();

        bus.try_send_telegram(&BUF, 7).unwrap();
        kick(&mut bus);
        run_send_attempt(&mut bus);
        assert_eq!(bus.state(), BusState::SendWait);

        bus.timer.edge(CAPTURE, 500);
        bus.timer_interrupt();
        assert_eq!(bus.state(), BusState::SendWait);
        bus.tx.done();
    }

    #[test]
    fn bus_ack_byte_completes_the_pending_send() {
        let mut bus = test_bus(false);
        static BUF: TelegramBuf = TelegramBuf::new();
        BUF.access(|data| {
            data[..7].copy_from_slice(&[0xbc, 0x00, 0x00, 0x11, 0x05, 0x60, 0x80]);
        })
        .unwrap();

        bus.try_send_telegram(&BUF, 7).unwrap();
        kick(&mut bus);
        run_send_attempt(&mut bus);
        assert_eq!(bus.send_tries, 1);

        // the acknowledge byte starts after the acknowledge window
        bus.timer.edge(CAPTURE, SEND_ACK_WAIT_TIME + 23);
        bus.timer_interrupt();
        assert_eq!(bus.state(), BusState::RecvByte);

        let pattern = telegram::parity_extend(BUS_ACK);
        for bit in 0..9u16 {
            if pattern & (1 << bit) == 0 {
                bus.timer.edge(CAPTURE, (bit + 1) * BIT_TIME);
                bus.timer_interrupt();
            }
        }
        bus.timer.timeout(TIMEOUT);
        bus.timer_interrupt();
        end_telegram(&mut bus);

        assert!(!BUF.is_claimed());
        assert_eq!(BUF.access(|data| data[0]), Some(0));
        assert!(bus.send_cur.is_none());
        // nothing left to send, so the machine parks itself
        kick_to_idle(&mut bus);
        bus.tx.done();
    }

    /// Fires the pending pre-send timeout and expects the machine to
    /// cancel into idle.
    fn kick_to_idle(bus: &mut TestBus) {
        bus.timer.timeout(TIMEOUT);
        bus.timer_interrupt();
        assert_eq!(bus.state(), BusState::Idle);
    }

    #[test]
    fn first_retry_inverts_repeat_flag_once_and_gives_up_after_four() {
        let mut bus = test_bus(false);
        static BUF: TelegramBuf = TelegramBuf::new();
        static NEXT: TelegramBuf = TelegramBuf::new();
        let payload = [0xbc, 0x00, 0x00, 0x11, 0x05, 0x60, 0x80];
        BUF.access(|data| data[..7].copy_from_slice(&payload)).unwrap();
        NEXT.access(|data| data[..7].copy_from_slice(&payload)).unwrap();

        bus.try_send_telegram(&BUF, 7).unwrap();
        bus.try_send_telegram(&NEXT, 7).unwrap();
        // queue invariant: a second telegram implies a first
        assert!(bus.send_cur.is_some() && bus.send_next.is_some());

        let original_check = unsafe { BUF.with_claimed(|data| data[7]) };

        // attempt 1 completes but nobody acknowledges
        kick(&mut bus);
        run_send_attempt(&mut bus);
        assert_eq!(bus.send_tries, 1);
        bus.timer.timeout(TIMEOUT);
        bus.timer_interrupt();

        // attempt 2 carries the repeat marking, checksum corrected
        assert_eq!(bus.state(), BusState::SendStartBit);
        let (control, check) = unsafe { BUF.with_claimed(|data| (data[0], data[7])) };
        assert_eq!(control & REPEAT_FLAG, 0);
        assert_eq!(check, original_check ^ REPEAT_FLAG);
        assert_eq!(bus.send_tries, 2);

        // attempt 2 dies in a collision during a run of "1" bits
        let pwm = bus.timer.match_value(PWM);
        bus.timer.edge(CAPTURE, pwm + 1);
        bus.timer_interrupt();
        while bus.state() != BusState::SendBitWait {
            bus.timer.timeout(TIMEOUT);
            bus.timer_interrupt();
        }
        let own_pulse = bus.timer.match_value(PWM);
        bus.timer.edge(CAPTURE, own_pulse - BIT_WAIT_TIME - 1);
        bus.timer_interrupt();
        assert!(bus.collision);
        assert_eq!(bus.state(), BusState::RecvByte);
        assert_eq!(bus.timer.match_value(PWM), 0xffff);

        // the colliding transmission ends; its bytes are discarded
        bus.timer.timeout(TIMEOUT);
        bus.timer_interrupt();
        end_telegram(&mut bus);
        assert_eq!(bus.state(), BusState::SendInit);
        assert_eq!(bus.received_len(), 0);

        // attempt 3: the repeat flag is not inverted again
        kick(&mut bus);
        let (control, check) = unsafe { BUF.with_claimed(|data| (data[0], data[7])) };
        assert_eq!(control & REPEAT_FLAG, 0);
        assert_eq!(check, original_check ^ REPEAT_FLAG);
        assert_eq!(bus.send_tries, 2);

        run_send_attempt(&mut bus);
        assert_eq!(bus.send_tries, 3);
        bus.timer.timeout(TIMEOUT);
        bus.timer_interrupt();

        // attempt 4
        run_send_attempt(&mut bus);
        assert_eq!(bus.send_tries, 4);
        bus.timer.timeout(TIMEOUT);
        bus.timer_interrupt();

        // all retries used up: the slot is released with octet 0 zeroed
        // and the queued telegram moves up
        assert!(!BUF.is_claimed());
        assert_eq!(BUF.access(|data| data[0]), Some(0));
        assert!(NEXT.is_claimed());
        let cur = bus.send_cur.expect("next telegram took over");
        assert!(core::ptr::eq(cur, &NEXT));
        assert!(bus.send_next.is_none());
        assert_eq!(bus.send_tries, 0);
        assert_eq!(bus.state(), BusState::SendStartBit);
        bus.tx.done();
    }

    #[test]
    fn queue_holds_two_telegrams_and_blocks_the_third() {
        let mut bus = test_bus(false);
        static FIRST: TelegramBuf = TelegramBuf::new();
        static SECOND: TelegramBuf = TelegramBuf::new();
        static THIRD: TelegramBuf = TelegramBuf::new();
        let payload = [0xbc, 0x00, 0x00, 0x11, 0x05, 0x60, 0x80];
        for buf in [&FIRST, &SECOND, &THIRD] {
            buf.access(|data| data[..7].copy_from_slice(&payload)).unwrap();
        }

        assert_eq!(bus.try_send_telegram(&FIRST, 7), Ok(()));
        assert_eq!(bus.try_send_telegram(&SECOND, 7), Ok(()));
        assert_eq!(
            bus.try_send_telegram(&THIRD, 7),
            Err(nb::Error::WouldBlock)
        );
        assert_eq!(
            bus.try_send_telegram(&FIRST, 7),
            Err(nb::Error::Other(SendError::AlreadyQueued))
        );
        assert!(bus.send_cur.is_some());
        bus.tx.done();
    }

    #[test]
    fn oversized_telegram_is_rejected() {
        let mut bus = test_bus(false);
        static BUF: TelegramBuf = TelegramBuf::new();
        assert_eq!(
            bus.try_send_telegram(&BUF, TELEGRAM_SIZE),
            Err(nb::Error::Other(SendError::TooLong))
        );
        assert!(!BUF.is_claimed());
        bus.tx.done();
    }
}

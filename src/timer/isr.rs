//! Interrupt glue for a globally shared bus instance.
//!
//! The bus is touched from two contexts: the timer interrupt and the
//! foreground. Both go through a `critical_section` protected singleton,
//! so every access is serialized and the foreground can never observe the
//! state machine mid-transition.

use crate::bus::{Bus, SendError};
use crate::config::BusConfig;
use crate::telegram::TelegramBuf;
use crate::timer::Timer;
use core::cell::RefCell;
use critical_section::Mutex;
use embedded_hal::digital::OutputPin;

/// Creates the empty global bus cell.
///
/// # Example
/// ```ignore
/// static BUS: Mutex<RefCell<Option<Bus<Timer16, TxPin, Eeprom>>>> =
///     global_bus_init::<Timer16, TxPin, Eeprom>();
/// ```
pub const fn global_bus_init<T: Timer, TX: OutputPin, C: BusConfig>()
-> Mutex<RefCell<Option<Bus<T, TX, C>>>> {
    Mutex::new(RefCell::new(None))
}

/// Installs a bus instance into the global cell and brings it up.
///
/// `prescaler` is the reload value for a 1 MHz timer tick, typically
/// `core_clock / 1_000_000 - 1`.
pub fn global_bus_setup<T: Timer, TX: OutputPin, C: BusConfig>(
    global_bus: &'static Mutex<RefCell<Option<Bus<T, TX, C>>>>,
    mut bus: Bus<T, TX, C>,
    prescaler: u16,
) {
    critical_section::with(|cs| {
        bus.begin(prescaler);
        let _ = global_bus.borrow(cs).replace(Some(bus));
    });
}

/// Runs the bus state machine; call this from the timer interrupt
/// handler.
///
/// # Example
/// ```ignore
/// #[interrupt]
/// fn TIMER16_1() {
///     global_bus_isr(&BUS);
/// }
/// ```
pub fn global_bus_isr<T: Timer, TX: OutputPin, C: BusConfig>(
    global_bus: &'static Mutex<RefCell<Option<Bus<T, TX, C>>>>,
) {
    critical_section::with(|cs| {
        if let Some(bus) = global_bus.borrow(cs).borrow_mut().as_mut() {
            bus.timer_interrupt();
        }
    });
}

/// Queues a telegram on the global bus, spinning while both send slots
/// are occupied.
///
/// Each poll takes one short critical section, so the bus interrupt keeps
/// running between attempts; the two-slot queue is the only backpressure.
pub fn global_bus_send<T: Timer, TX: OutputPin, C: BusConfig>(
    global_bus: &'static Mutex<RefCell<Option<Bus<T, TX, C>>>>,
    telegram: &'static TelegramBuf,
    length: usize,
) -> Result<(), SendError> {
    loop {
        let attempt = critical_section::with(|cs| {
            global_bus
                .borrow(cs)
                .borrow_mut()
                .as_mut()
                .map(|bus| bus.try_send_telegram(telegram, length))
        });
        match attempt {
            None => return Err(SendError::Uninitialized),
            Some(Ok(())) => return Ok(()),
            Some(Err(nb::Error::WouldBlock)) => continue,
            Some(Err(nb::Error::Other(err))) => return Err(err),
        }
    }
}

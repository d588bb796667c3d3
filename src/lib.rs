//! # knx-tp1
//!
//! An interrupt-driven, bit-level transceiver for the KNX/EIB twisted-pair
//! (TP1) bus, written for resource-constrained microcontrollers.
//!
//! TP1 is a half-duplex, differential two-wire medium. A logical "0" is a
//! ~35 µs dominant pulse at the start of a 104 µs bit cell; a logical "1"
//! is a cell left undriven. One hardware timer does all the work: a capture
//! channel timestamps falling edges on the receive pin, a PWM match channel
//! generates the transmit pulses, and a second match channel provides
//! programmable timeouts. Every protocol decision, from start-bit detection
//! and bit sampling to collision arbitration, acknowledge handling and
//! retries, is made inside a single timer interrupt with no blocking and no
//! allocation.
//!
//! This crate implements:
//! - the [`timer::Timer`] contract over such a capture/match timer
//! - the full receive/transmit state machine in [`bus::Bus`]
//! - telegram framing helpers and caller-owned send buffers in [`telegram`]
//! - a two-slot outbound queue with `nb`-style backpressure
//!
//! ## Crate features
//! | Feature               | Description |
//! |-----------------------|-------------|
//! | `timer-isr` (default) | `critical_section` protected singleton and interrupt glue |
//! | `std`                 | Host builds; replaces `heapless::Vec` with `std::vec::Vec` |
//! | `defmt`               | Uses `defmt` logging |
//! | `log`                 | Uses `log` logging |
//!
//! ## Usage
//!
//! ```ignore
//! use knx_tp1::bus::Bus;
//! use knx_tp1::timer::{CAP0, MAT0};
//!
//! let mut bus = Bus::new(timer16_1, tx_pin, config, CAP0, MAT0);
//! bus.begin(SYSTEM_CORE_CLOCK / 1_000_000 - 1);
//!
//! // in the timer interrupt handler:
//! bus.timer_interrupt();
//! ```
//!
//! ## Integration notes
//!
//! - The timer must be prescaled so that one tick equals 1 µs.
//! - The capture input and the PWM output must be wired to the bus
//!   transceiver; board bring-up (clock, pin muxing) is out of scope.
//! - Only one `Bus` instance may own a given timer; with the `timer-isr`
//!   feature the [`timer::isr`] helpers manage a global singleton.
//!
//! --
//! Designed for `#![no_std]` use in resource-constrained embedded environments.

#![deny(
    bad_style,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub use critical_section;

#[cfg(not(feature = "std"))]
pub use heapless;

#[macro_use]
mod fmt;

pub mod bus;
pub mod config;
pub mod consts;
pub mod telegram;
pub mod timer;

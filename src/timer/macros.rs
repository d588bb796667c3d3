/// Declares the static global bus cell for interrupt-based operation.
///
/// # Example
/// ```ignore
/// static_bus!(BUS, Timer16, TxPin, Eeprom);
/// ```
#[macro_export]
macro_rules! static_bus {
    ( $name:ident, $timer:ty, $tx:ty, $config:ty ) => {
        static $name: $crate::critical_section::Mutex<
            core::cell::RefCell<Option<$crate::bus::Bus<$timer, $tx, $config>>>,
        > = $crate::critical_section::Mutex::new(core::cell::RefCell::new(None));
    };
}

/// Binds a platform interrupt handler to a global bus declared with
/// [`static_bus!`].
///
/// # Example
/// ```ignore
/// bus_interrupt_handler!(TIMER16_1_IRQHandler, BUS);
/// ```
#[macro_export]
macro_rules! bus_interrupt_handler {
    ( $handler:ident, $bus:ident ) => {
        #[no_mangle]
        pub extern "C" fn $handler() {
            $crate::timer::isr::global_bus_isr(&$bus);
        }
    };
}

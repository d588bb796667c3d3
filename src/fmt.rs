//! Internal logging shim.
//!
//! Routes the crate's sparse diagnostic output to `defmt` or `log`
//! depending on the enabled feature, and compiles to nothing otherwise.
//! The call sites replace the debug GPIO writes of classic bus-coupler
//! firmware.

#![allow(unused_macros)]

macro_rules! trace {
    ($($arg:tt)*) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::trace!($($arg)*);
            #[cfg(all(feature = "log", not(feature = "defmt")))]
            ::log::trace!($($arg)*);
            #[cfg(not(any(feature = "defmt", feature = "log")))]
            let _ = ();
        }
    };
}

macro_rules! debug {
    ($($arg:tt)*) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::debug!($($arg)*);
            #[cfg(all(feature = "log", not(feature = "defmt")))]
            ::log::debug!($($arg)*);
            #[cfg(not(any(feature = "defmt", feature = "log")))]
            let _ = ();
        }
    };
}

//! Logging
//!
//! With `defmt-logging` these forward to the matching `defmt` macro. Without
//! it, the arguments are still evaluated once and the format string is
//! dropped.

#![allow(unused_macros)]

#[cfg(feature = "defmt-logging")]
macro_rules! ln_log {
    ($level:ident, $fmt:literal $(, $arg:expr)* $(,)?) => {
        defmt::$level!($fmt $(, $arg)*)
    };
}

#[cfg(not(feature = "defmt-logging"))]
macro_rules! ln_log {
    ($level:ident, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let _ = $fmt;
        $( let _ = &$arg; )*
    }};
}

macro_rules! ln_trace {
    ($($t:tt)*) => { ln_log!(trace, $($t)*) };
}

macro_rules! ln_debug {
    ($($t:tt)*) => { ln_log!(debug, $($t)*) };
}

macro_rules! ln_info {
    ($($t:tt)*) => { ln_log!(info, $($t)*) };
}

macro_rules! ln_warn {
    ($($t:tt)*) => { ln_log!(warn, $($t)*) };
}

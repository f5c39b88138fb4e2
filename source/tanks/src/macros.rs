#![allow(unused_macros)]

#[cfg(feature = "defmt-logging")]
macro_rules! tank_log {
    (trace,   $($arg:expr),*) => { defmt::trace!($($arg),*) };
    (debug,   $($arg:expr),*) => { defmt::debug!($($arg),*) };
    (info,    $($arg:expr),*) => { defmt::info!($($arg),*) };
    (warn,    $($arg:expr),*) => { defmt::warn!($($arg),*) };
    (error,   $($arg:expr),*) => { defmt::error!($($arg),*) };
}

#[cfg(not(feature = "defmt-logging"))]
macro_rules! tank_log {
    ($level:ident, $($arg:expr),*) => {{ $( let _ = $arg; )* }}
}

macro_rules! tank_trace {
    ($($arg:expr),*) => (tank_log!(trace, $($arg),*));
}

macro_rules! tank_debug {
    ($($arg:expr),*) => (tank_log!(debug, $($arg),*));
}

macro_rules! tank_info {
    ($($arg:expr),*) => (tank_log!(info, $($arg),*));
}

macro_rules! tank_warn {
    ($($arg:expr),*) => (tank_log!(warn, $($arg),*));
}

macro_rules! tank_error {
    ($($arg:expr),*) => (tank_log!(error, $($arg),*));
}

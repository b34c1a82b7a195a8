#[cfg(feature = "tracing")]
macro_rules! vdtrace {
    ($($tt:tt)*) => {
        tracing::trace!(target: "virtualdata", $($tt)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! vdtrace {
    ($($tt:tt)*) => {};
}

#[cfg(feature = "tracing")]
macro_rules! vddebug {
    ($($tt:tt)*) => {
        tracing::debug!(target: "virtualdata", $($tt)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! vddebug {
    ($($tt:tt)*) => {};
}

#[cfg(feature = "tracing")]
macro_rules! vdwarn {
    ($($tt:tt)*) => {
        tracing::warn!(target: "virtualdata", $($tt)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! vdwarn {
    ($($tt:tt)*) => {};
}

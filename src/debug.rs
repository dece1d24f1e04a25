//! Runtime debugging tools.

/// Execute a closure when the environment variable `NBHASHMAP_DEBUG_MODE` is
/// set.
///
/// The migration code runs its trace output through this. Set
/// `NBHASHMAP_DEBUG_STACKTRACE` as well to get a stack trace after each
/// message.
#[cfg(feature = "debug-tools")]
pub fn exec<F: FnOnce()>(f: F) {
    use std::env;

    thread_local! {
        /// Is `NBHASHMAP_DEBUG_MODE` set?
        ///
        /// This is cached to avoid expensive repeated syscalls or similar
        /// things.
        static DEBUG_MODE_ENABLED: bool = env::var("NBHASHMAP_DEBUG_MODE").is_ok();
        /// Is `NBHASHMAP_DEBUG_STACKTRACE` set?
        ///
        /// This is cached to avoid expensive repeated syscalls or similar
        /// things.
        static STACK_TRACE_ENABLED: bool = env::var("NBHASHMAP_DEBUG_STACKTRACE").is_ok();
    }

    // If enabled, run the closure.
    if DEBUG_MODE_ENABLED.with(|&x| x) {
        f();
        if STACK_TRACE_ENABLED.with(|&x| x) {
            println!("{:?}", backtrace::Backtrace::new());
        }
    }
}

/// Do nothing.
///
/// When compiled with the `debug-tools` feature, this will execute the
/// closure when the environment variable `NBHASHMAP_DEBUG_MODE` is set.
#[inline]
#[cfg(not(feature = "debug-tools"))]
pub fn exec<F: FnOnce()>(_: F) {}

/// Wire the `log` facade to env_logger.  Level comes from `RUST_LOG`,
/// defaulting to info.  Safe to call more than once; later calls are no-ops.
pub fn init_log() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .try_init();
}

/// Log at error level and die.  Used for configuration errors (bugs) and
/// transport fatals, which have no recovery path.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        panic!($($arg)*);
    }};
}

use std::io::Write;
use std::{backtrace, fs::File};

use crate::config;

/// Register a panic hook that logs via `log::error!` and additionally writes the backtrace
/// to `backtrace.log` in the cache directory, since a daemon has no foreground terminal of
/// its own to print to once it's running unattended under a supervisor.
pub fn register_backtrace_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        // A panic hook will prevent the default panic handler from being called. An
        // unwrap/expect/panic in here would cause a silent hard crash with no diagnostics.
        log::error!("panic: {panic_info}");

        let mut path = config::cache_dir();
        path.push("backtrace.log");
        if let Ok(mut file) = File::create(path) {
            writeln!(file, "{}", backtrace::Backtrace::force_capture()).unwrap_or_default();
            writeln!(file, "{panic_info}").unwrap_or_default();
        }
    }));
}

//! Process-wide panic reporting.

use chrono::Local;
use std::{
    backtrace::Backtrace,
    panic::{PanicHookInfo, take_hook},
    thread,
};

/// Target of panic records, so they can be filtered apart from job logs.
pub const PANIC_LOG_TARGET: &str = "replay_rig::panic";

/// Installs a global panic hook that logs panics via `tracing`, then defers
/// to the previously installed hook.
pub fn install() {
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = panic_record(panic_info);
            tracing::error!(target: PANIC_LOG_TARGET, "{record}");
        }));

        previous_hook(panic_info);
    }));
}

fn panic_record(panic_info: &PanicHookInfo<'_>) -> String {
    let payload = panic_info
        .payload()
        .downcast_ref::<&'static str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic_info.payload().downcast_ref::<String>().cloned())
        .unwrap_or_else(|| panic_info.to_string());
    let location = panic_info
        .location()
        .map(|loc| format!("{}:{}", loc.file(), loc.line()))
        .unwrap_or_else(|| "<unknown>".to_string());
    let thread_name = thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| "<unnamed>".to_string());

    format!(
        "{} PANIC thread={thread_name} location={location} payload={payload}\nBacktrace:\n{}",
        Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
        Backtrace::force_capture()
    )
}

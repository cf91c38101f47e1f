use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

pub mod flags;

static ABORT_ON_FATAL: AtomicBool = AtomicBool::new(false);

/// Select how [`fatal`] terminates: abort the process, or panic the calling thread.
pub fn set_abort_on_fatal(abort: bool) {
    ABORT_ON_FATAL.store(abort, Ordering::Relaxed);
}

/// Report a broken runtime invariant and never return.
///
/// The message (usually carrying a thread dump) is logged at error level first.
#[cold]
#[inline(never)]
pub fn fatal(message: fmt::Arguments<'_>) -> ! {
    let message = message.to_string();
    log::error!(target: "vmcoord::fatal", "{}", message);
    if ABORT_ON_FATAL.load(Ordering::Relaxed) {
        std::process::abort();
    }
    panic!("fatal runtime error: {}", message);
}

#[macro_export]
macro_rules! fatal {
    ($($arg: tt)*) => {
        $crate::utils::fatal(format_args!($($arg)*))
    };
}

/// Parse float with optional unit suffix, returning the numeric part and the factor
/// in microseconds.
fn parse_float_and_factor_from_str(i: &str) -> Option<(f64, u64)> {
    let i = i.trim();
    let split = i
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(i.len());
    let (number, unit) = i.split_at(split);
    let number: f64 = number.parse().ok()?;

    let factor = match unit.trim() {
        "us" => 1,
        "" | "ms" => 1_000,
        "s" => 1_000_000,
        "m" => 60_000_000,
        _ => return None,
    };

    Some((number, factor))
}

/// Parse a duration such as `10s`, `250ms`, `100us` or `2m`. A bare number is milliseconds.
pub fn parse_duration(i: &str) -> Option<Duration> {
    let (number, factor) = parse_float_and_factor_from_str(i)?;
    Some(Duration::from_micros((number * factor as f64) as u64))
}

/// OS-level id of the calling thread.
pub fn os_thread_id() -> u64 {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            unsafe { libc::syscall(libc::SYS_gettid) as u64 }
        } else if #[cfg(target_os = "macos")] {
            let mut tid = 0u64;
            unsafe {
                libc::pthread_threadid_np(0, &mut tid);
            }
            tid
        } else {
            use std::sync::atomic::AtomicU64;
            static NEXT_TID: AtomicU64 = AtomicU64::new(1);
            thread_local! {
                static TID: u64 = NEXT_TID.fetch_add(1, Ordering::Relaxed);
            }
            TID.with(|tid| *tid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("100us"), Some(Duration::from_micros(100)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("40"), Some(Duration::from_millis(40)));
        assert_eq!(parse_duration("10 parsecs"), None);
        assert_eq!(parse_duration("fast"), None);
    }

    #[test]
    fn os_thread_ids_differ() {
        let main = os_thread_id();
        let other = std::thread::spawn(os_thread_id).join().unwrap();
        assert_ne!(main, other);
    }

    #[test]
    #[should_panic(expected = "fatal runtime error: broken 42")]
    fn fatal_panics_by_default() {
        crate::fatal!("broken {}", 42);
    }
}

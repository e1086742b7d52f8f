// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Small helpers that only use functions from the async-signal-safe list.
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>

use nix::errno::Errno;
use std::time::Duration;

/// Exits immediately, without running atexit handlers or flushing stdio.
pub fn terminate() -> ! {
    // Safety: No preconditions
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

/// Kernel id of the calling thread.
pub fn gettid() -> libc::pid_t {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    // Safety: gettid has no preconditions and cannot fail.
    unsafe {
        libc::syscall(libc::SYS_gettid) as libc::pid_t
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    // Safety: No preconditions
    unsafe {
        libc::getpid()
    }
}

/// Writes `msg` to stderr with raw `write(2)` calls, retrying on `EINTR` and short writes.
/// Errors are dropped: there is nowhere left to report them.
pub fn write_stderr(msg: &[u8]) {
    let mut rest = msg;
    while !rest.is_empty() {
        // Safety: the pointer and length describe a live slice.
        let n = unsafe { libc::write(libc::STDERR_FILENO, rest.as_ptr().cast(), rest.len()) };
        if n < 0 {
            if Errno::last() == Errno::EINTR {
                continue;
            }
            return;
        }
        if n == 0 {
            return;
        }
        rest = &rest[n as usize..];
    }
}

/// Formats `val` in base 10 at the start of `buf` without allocating.
/// Returns the number of bytes written, or `None` if `buf` is too small.
pub fn write_decimal(buf: &mut [u8], mut val: u64) -> Option<usize> {
    let mut i = 0;
    loop {
        if i >= buf.len() {
            return None;
        }
        buf[i] = b'0' + (val % 10) as u8;
        val /= 10;
        i += 1;
        if val == 0 {
            break;
        }
    }
    buf[..i].reverse();
    Some(i)
}

/// Sleeps with `nanosleep(2)`. An interruption by a signal just ends the sleep early.
pub fn sleep_for(duration: Duration) {
    let ts = libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    };
    // Safety: `ts` is a valid timespec and the remainder pointer may be null.
    unsafe { libc::nanosleep(&ts, std::ptr::null_mut()) };
}

/// Wall clock time in nanoseconds since the unix epoch, 0 if the clock is unavailable.
pub fn realtime_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: `ts` is a valid, writable timespec.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64)
}

/// Monotonic clock in nanoseconds, 0 if the clock is unavailable.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: `ts` is a valid, writable timespec.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64)
}

/// Restores `errno` on drop, so a signal handler does not clobber the value seen by the code it
/// interrupted.
pub struct ErrnoGuard {
    saved: i32,
}

impl ErrnoGuard {
    pub fn new() -> Self {
        Self {
            saved: Errno::last_raw(),
        }
    }
}

impl Default for ErrnoGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        Errno::set_raw(self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_decimal() {
        let mut buf = [0u8; 20];
        let len = write_decimal(&mut buf, 0).unwrap();
        assert_eq!(&buf[..len], b"0");

        let len = write_decimal(&mut buf, 1234567890).unwrap();
        assert_eq!(&buf[..len], b"1234567890");

        let len = write_decimal(&mut buf, u64::MAX).unwrap();
        assert_eq!(&buf[..len], u64::MAX.to_string().as_bytes());
    }

    #[test]
    fn test_write_decimal_too_small() {
        let mut buf = [0u8; 3];
        assert_eq!(write_decimal(&mut buf, 1000), None);
        assert_eq!(write_decimal(&mut [], 1), None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_gettid_differs_between_threads() {
        let main_tid = gettid();
        let other_tid = std::thread::spawn(gettid).join().unwrap();
        assert!(main_tid > 0);
        assert!(other_tid > 0);
        assert_ne!(main_tid, other_tid);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_sleep_for() {
        let start = std::time::Instant::now();
        sleep_for(Duration::from_millis(5));
        assert!(start.elapsed() >= Duration::from_millis(4));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_realtime_ns_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(realtime_ns() > 1_577_836_800_000_000_000);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_monotonic_ns_advances() {
        let before = monotonic_ns();
        sleep_for(Duration::from_millis(1));
        assert!(monotonic_ns() > before);
    }

    #[test]
    fn test_errno_guard_restores() {
        Errno::set_raw(libc::EAGAIN);
        {
            let _guard = ErrnoGuard::new();
            Errno::set_raw(libc::EBADF);
        }
        assert_eq!(Errno::last_raw(), libc::EAGAIN);
    }
}

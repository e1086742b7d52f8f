// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Installs the crash handler and then crashes on purpose.
//!
//! Usage: `crash_trigger [FAULT]`, where FAULT is 0 (exit normally) or one of the faults 1 to 6.
//! A FAULT argument is read like C's `atoi`, so text without leading digits selects 0. Without
//! an argument the fault is read from stdin, and input that is not an integer exits with
//! status 1. Numbers outside the menu fall back to the null pointer write. Dumps go to
//! `$CRASHDUMP_DIR`, or the default dump directory. With `CRASH_TRIGGER_CHAIN=1` a previous
//! SIGSEGV handler is installed first and the crash handler chains to it.

#[cfg(target_os = "linux")]
mod harness {
    use anyhow::Context;
    use crashdump::shared::constants::{
        DEFAULT_CAPTURE_TIMEOUT, DEFAULT_DUMP_DIR, DEFAULT_MAX_DUMP_BYTES, ENV_DUMP_DIR,
    };
    use crashdump::{CrashHandler, Destination, DumpOutcome, HandlerConfig};
    use crashdump_common::unix_utils::write_stderr;
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::io::{BufRead, Write};
    use std::path::PathBuf;
    use std::process::ExitCode;
    use std::time::Duration;

    pub const ENV_CHAIN: &str = "CRASH_TRIGGER_CHAIN";
    /// Exit status of the previous SIGSEGV handler installed in chain mode.
    pub const CHAINED_EXIT_CODE: i32 = 42;

    const FAULT_PAUSE: Duration = Duration::from_millis(100);
    const PREPARE_PAUSE: Duration = Duration::from_millis(200);

    const FAULTS: [(&str, &str); 7] = [
        ("Exit", ""),
        ("NULL pointer dereference", "SIGSEGV"),
        ("Invalid memory access", "SIGSEGV"),
        ("Abort signal", "SIGABRT"),
        ("Stack overflow", "SIGSEGV"),
        ("Divide by zero", "SIGFPE"),
        ("Illegal instruction", "SIGILL"),
    ];
    const RULE: &str = "════════════════════════════════════════";

    fn on_dump_written(outcome: &DumpOutcome) {
        if outcome.succeeded {
            write_stderr(b"dump written: ");
            write_stderr(outcome.file_name().unwrap_or("<descriptor>").as_bytes());
            write_stderr(b"\n");
        } else {
            write_stderr(b"dump failed\n");
        }
    }

    extern "C" fn previous_segv_handler(_: i32, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
        write_stderr(b"previous handler ran\n");
        // Safety: _exit is async-signal-safe.
        unsafe { libc::_exit(CHAINED_EXIT_CODE) }
    }

    fn install_previous_handler() -> anyhow::Result<()> {
        let action = SigAction::new(
            SigHandler::SigAction(previous_segv_handler),
            SaFlags::SA_ONSTACK,
            SigSet::empty(),
        );
        // Safety: the handler only calls async-signal-safe functions.
        unsafe { signal::sigaction(Signal::SIGSEGV, &action) }
            .context("installing the previous SIGSEGV handler")?;
        Ok(())
    }

    fn config(dir: PathBuf, chain_previous: bool) -> anyhow::Result<HandlerConfig> {
        HandlerConfig::new(
            Destination::Directory(dir),
            DEFAULT_MAX_DUMP_BYTES,
            vec![],
            chain_previous,
            true,
            DEFAULT_CAPTURE_TIMEOUT,
        )
    }

    /// Reads a leading decimal integer the way `scanf("%d")` does: leading whitespace and one
    /// sign are skipped, and there must be at least one digit.
    pub fn scan_int(input: &str) -> Option<i64> {
        let input = input.trim_start();
        let (negative, digits) = match input.as_bytes().first() {
            Some(b'-') => (true, &input[1..]),
            Some(b'+') => (false, &input[1..]),
            _ => (false, input),
        };
        let end = digits
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(digits.len());
        if end == 0 {
            return None;
        }
        let magnitude = digits[..end]
            .bytes()
            .fold(0i64, |n, d| n.saturating_mul(10).saturating_add((d - b'0') as i64));
        Some(if negative { -magnitude } else { magnitude })
    }

    /// The selection as typed, or `None` when stdin did not hold an integer.
    fn select_fault() -> anyhow::Result<Option<i64>> {
        if let Some(arg) = std::env::args().nth(1) {
            let choice = scan_int(&arg).unwrap_or(0);
            println!("[*] Using crash type: {choice}\n");
            return Ok(Some(choice));
        }
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "\nSelect crash type:")?;
        for (i, (name, signal)) in FAULTS.iter().enumerate().skip(1) {
            writeln!(stdout, "  {i}. {name} ({signal})")?;
        }
        writeln!(stdout, "  0. {}\n", FAULTS[0].0)?;
        write!(stdout, "Choice: ")?;
        stdout.flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(scan_int(&line))
    }

    fn process_name() -> String {
        std::fs::read_to_string("/proc/self/comm")
            .map(|s| s.trim_end().to_owned())
            .unwrap_or_else(|_| "unknown".to_owned())
    }

    /// Leaves a little live data on the stack before the fault.
    #[inline(never)]
    fn do_some_work() {
        let mut data = [0i32; 100];
        for (i, slot) in data.iter_mut().enumerate() {
            *slot = i as i32 * 2;
        }
        let data = std::hint::black_box(data);
        println!("[*] Doing some work before crash...");
        println!("[*] Array sum: {}", data[50]);
    }

    fn announce(what: &str) -> anyhow::Result<()> {
        println!("[*] Triggering {what}...");
        std::io::stdout().flush()?;
        std::thread::sleep(FAULT_PAUSE);
        Ok(())
    }

    pub fn main() -> anyhow::Result<ExitCode> {
        println!("╔{RULE}╗");
        println!("║{:<40}║", "   Crash Dump Generator");
        println!("║{:<40}║", "   Using the in-process crash handler");
        println!("╚{RULE}╝\n");

        let dir = std::env::var_os(ENV_DUMP_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DUMP_DIR));
        let chain = std::env::var(ENV_CHAIN).is_ok_and(|v| v == "1");
        println!("[*] Initializing crash handler...");
        println!("[*] Dumps will be written to: {}", dir.display());
        if chain {
            install_previous_handler()?;
        }
        let handler =
            CrashHandler::install_with_callback(config(dir, chain)?, Some(on_dump_written))?;
        println!("[✓] Crash handler installed\n");

        let Some(choice) = select_fault()? else {
            println!("[!] Invalid input");
            handler.uninstall();
            return Ok(ExitCode::FAILURE);
        };

        println!("\n╔{RULE}╗");
        println!("║{:<40}║", "  CRASH INFORMATION");
        println!("╚{RULE}╝");
        println!("[*] Process ID: {}", std::process::id());
        println!("[*] Process name: {}", process_name());
        println!("[*] Parent PID: {}", std::os::unix::process::parent_id());
        println!("[*] Preparing to crash...");
        std::io::stdout().flush()?;
        std::thread::sleep(PREPARE_PAUSE);

        do_some_work();

        println!("\n[!] INITIATING CRASH");
        println!("────────────────────────────────────────\n");

        let fault = match usize::try_from(choice) {
            Ok(n) if n < FAULTS.len() => n,
            _ => {
                println!("[!] Invalid choice, defaulting to NULL pointer");
                1
            }
        };
        match fault {
            0 => {
                println!("[*] Exiting normally (no crash)");
                handler.uninstall();
                return Ok(ExitCode::SUCCESS);
            }
            1 => {
                announce("NULL pointer dereference")?;
                faults::write_byte(0)
            }
            2 => {
                announce("segmentation fault")?;
                faults::write_byte(0xDEAD_BEEF)
            }
            3 => {
                announce("abort signal")?;
                std::process::abort()
            }
            4 => {
                announce("stack overflow")?;
                std::hint::black_box(faults::recurse(0));
            }
            5 => {
                announce("divide by zero (FPE)")?;
                faults::divide_by_zero()
            }
            _ => {
                announce("illegal instruction")?;
                faults::illegal_instruction()
            }
        }
        anyhow::bail!("{} did not terminate the process", FAULTS[fault].0)
    }

    mod faults {
        /// Stores to `addr` with a plain store instruction, so the fault comes from the hardware
        /// rather than from a debug assertion on the pointer.
        pub fn write_byte(addr: usize) {
            #[cfg(target_arch = "x86_64")]
            // Safety: none, faulting is the point.
            unsafe {
                std::arch::asm!("mov byte ptr [{0}], 1", in(reg) addr, options(nostack));
            }
            #[cfg(target_arch = "aarch64")]
            // Safety: none, faulting is the point.
            unsafe {
                std::arch::asm!("strb wzr, [{0}]", in(reg) addr, options(nostack));
            }
            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            {
                let _ = addr;
                // Safety: raise is always safe to call.
                unsafe { libc::raise(libc::SIGSEGV) };
            }
        }

        #[inline(never)]
        #[allow(unconditional_recursion)]
        pub fn recurse(depth: u64) -> u64 {
            let frame = std::hint::black_box([depth; 512]);
            recurse(depth + 1).wrapping_add(frame[(depth % 512) as usize])
        }

        pub fn divide_by_zero() {
            let divisor: u32 = std::hint::black_box(0);
            #[cfg(target_arch = "x86_64")]
            // Safety: none, faulting is the point.
            unsafe {
                std::arch::asm!(
                    "div {0:e}",
                    in(reg) divisor,
                    inout("eax") 1u32 => _,
                    inout("edx") 0u32 => _,
                    options(nostack),
                );
            }
            // aarch64 integer division by zero yields zero instead of trapping.
            #[cfg(not(target_arch = "x86_64"))]
            {
                std::hint::black_box(1u32.checked_div(divisor));
                // Safety: raise is always safe to call.
                unsafe { libc::raise(libc::SIGFPE) };
            }
        }

        pub fn illegal_instruction() {
            #[cfg(target_arch = "x86_64")]
            // Safety: none, faulting is the point.
            unsafe {
                std::arch::asm!("ud2", options(nostack));
            }
            #[cfg(target_arch = "aarch64")]
            // Safety: none, faulting is the point.
            unsafe {
                std::arch::asm!("udf #0", options(nostack));
            }
            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            // Safety: raise is always safe to call.
            unsafe {
                libc::raise(libc::SIGILL);
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<std::process::ExitCode> {
    harness::main()
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("crash_trigger only runs on Linux");
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::harness::scan_int;

    #[test]
    fn test_scan_int() {
        assert_eq!(scan_int("3"), Some(3));
        assert_eq!(scan_int("  4\n"), Some(4));
        assert_eq!(scan_int("+5"), Some(5));
        assert_eq!(scan_int("-2"), Some(-2));
        assert_eq!(scan_int("6abc"), Some(6));
        assert_eq!(scan_int("99999999999999999999999"), Some(i64::MAX));
        assert_eq!(scan_int("abc"), None);
        assert_eq!(scan_int("-"), None);
        assert_eq!(scan_int(""), None);
    }
}

// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms, non_camel_case_types)]
#[repr(C)]
/// See <https://man7.org/linux/man-pages/man7/signal.7.html>
pub enum SignalNames {
    /// A dump written on request, with no signal involved.
    NONE,
    SIGHUP,
    SIGINT,
    SIGQUIT,
    SIGILL,
    SIGTRAP,
    SIGABRT,
    SIGBUS,
    SIGFPE,
    SIGKILL,
    SIGUSR1,
    SIGSEGV,
    SIGUSR2,
    SIGPIPE,
    SIGALRM,
    SIGTERM,
    SIGCHLD,
    SIGCONT,
    SIGSTOP,
    SIGTSTP,
    SIGTTIN,
    SIGTTOU,
    SIGURG,
    SIGXCPU,
    SIGXFSZ,
    SIGVTALRM,
    SIGPROF,
    SIGWINCH,
    SIGIO,
    SIGSYS,
    UNKNOWN,
}

impl From<libc::c_int> for SignalNames {
    fn from(value: libc::c_int) -> Self {
        match value {
            0 => SignalNames::NONE,
            libc::SIGHUP => SignalNames::SIGHUP,
            libc::SIGINT => SignalNames::SIGINT,
            libc::SIGQUIT => SignalNames::SIGQUIT,
            libc::SIGILL => SignalNames::SIGILL,
            libc::SIGTRAP => SignalNames::SIGTRAP,
            libc::SIGABRT => SignalNames::SIGABRT,
            libc::SIGBUS => SignalNames::SIGBUS,
            libc::SIGFPE => SignalNames::SIGFPE,
            libc::SIGKILL => SignalNames::SIGKILL,
            libc::SIGUSR1 => SignalNames::SIGUSR1,
            libc::SIGSEGV => SignalNames::SIGSEGV,
            libc::SIGUSR2 => SignalNames::SIGUSR2,
            libc::SIGPIPE => SignalNames::SIGPIPE,
            libc::SIGALRM => SignalNames::SIGALRM,
            libc::SIGTERM => SignalNames::SIGTERM,
            libc::SIGCHLD => SignalNames::SIGCHLD,
            libc::SIGCONT => SignalNames::SIGCONT,
            libc::SIGSTOP => SignalNames::SIGSTOP,
            libc::SIGTSTP => SignalNames::SIGTSTP,
            libc::SIGTTIN => SignalNames::SIGTTIN,
            libc::SIGTTOU => SignalNames::SIGTTOU,
            libc::SIGURG => SignalNames::SIGURG,
            libc::SIGXCPU => SignalNames::SIGXCPU,
            libc::SIGXFSZ => SignalNames::SIGXFSZ,
            libc::SIGVTALRM => SignalNames::SIGVTALRM,
            libc::SIGPROF => SignalNames::SIGPROF,
            libc::SIGWINCH => SignalNames::SIGWINCH,
            libc::SIGIO => SignalNames::SIGIO,
            libc::SIGSYS => SignalNames::SIGSYS,
            _ => SignalNames::UNKNOWN,
        }
    }
}

/// Human readable name of a Linux `si_code` value.
/// See <https://man7.org/linux/man-pages/man2/sigaction.2.html>
pub fn si_code_name(signum: libc::c_int, si_code: libc::c_int) -> &'static str {
    // Codes <= 0 and SI_KERNEL mean the same thing for every signal.
    match si_code {
        0 => return "SI_USER",
        0x80 => return "SI_KERNEL",
        -1 => return "SI_QUEUE",
        -2 => return "SI_TIMER",
        -3 => return "SI_MESGQ",
        -4 => return "SI_ASYNCIO",
        -5 => return "SI_SIGIO",
        -6 => return "SI_TKILL",
        _ => {}
    }
    match (signum, si_code) {
        (libc::SIGSEGV, 1) => "SEGV_MAPERR",
        (libc::SIGSEGV, 2) => "SEGV_ACCERR",
        (libc::SIGSEGV, 3) => "SEGV_BNDERR",
        (libc::SIGSEGV, 4) => "SEGV_PKUERR",
        (libc::SIGBUS, 1) => "BUS_ADRALN",
        (libc::SIGBUS, 2) => "BUS_ADRERR",
        (libc::SIGBUS, 3) => "BUS_OBJERR",
        (libc::SIGBUS, 4) => "BUS_MCEERR_AR",
        (libc::SIGBUS, 5) => "BUS_MCEERR_AO",
        (libc::SIGILL, 1) => "ILL_ILLOPC",
        (libc::SIGILL, 2) => "ILL_ILLOPN",
        (libc::SIGILL, 3) => "ILL_ILLADR",
        (libc::SIGILL, 4) => "ILL_ILLTRP",
        (libc::SIGILL, 5) => "ILL_PRVOPC",
        (libc::SIGILL, 6) => "ILL_PRVREG",
        (libc::SIGILL, 7) => "ILL_COPROC",
        (libc::SIGILL, 8) => "ILL_BADSTK",
        (libc::SIGFPE, 1) => "FPE_INTDIV",
        (libc::SIGFPE, 2) => "FPE_INTOVF",
        (libc::SIGFPE, 3) => "FPE_FLTDIV",
        (libc::SIGFPE, 4) => "FPE_FLTOVF",
        (libc::SIGFPE, 5) => "FPE_FLTUND",
        (libc::SIGFPE, 6) => "FPE_FLTRES",
        (libc::SIGFPE, 7) => "FPE_FLTINV",
        (libc::SIGFPE, 8) => "FPE_FLTSUB",
        (libc::SIGTRAP, 1) => "TRAP_BRKPT",
        (libc::SIGTRAP, 2) => "TRAP_TRACE",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(SignalNames::from(libc::SIGSEGV), SignalNames::SIGSEGV);
        assert_eq!(SignalNames::from(0), SignalNames::NONE);
        assert_eq!(SignalNames::from(libc::SIGRTMIN()), SignalNames::UNKNOWN);
    }

    #[test]
    fn test_si_code() {
        assert_eq!(si_code_name(libc::SIGSEGV, 2), "SEGV_ACCERR");
        assert_eq!(si_code_name(libc::SIGFPE, 1), "FPE_INTDIV");
        assert_eq!(si_code_name(libc::SIGABRT, -6), "SI_TKILL");
        // An invalid code should translate to UNKNOWN
        assert_eq!(si_code_name(libc::SIGSEGV, 42), "UNKNOWN");
    }
}

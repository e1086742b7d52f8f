// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use super::crash_handler::InstallError;
use libc::{c_void, siginfo_t, SIGSTKSZ};
use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, Signal};
use std::num::NonZeroUsize;
use std::ptr::{self, NonNull};

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
pub(crate) const MAX_SIGNALS: usize = 65;

pub(crate) type SignalAction = extern "C" fn(i32, *mut siginfo_t, *mut c_void);

/// Maps a configured signal number to one the trap can take over.
pub(crate) fn interceptable_signal(
    signum: i32,
    suspend_signal: i32,
) -> Result<Signal, InstallError> {
    if signum <= 0 || signum as usize >= MAX_SIGNALS || signum == suspend_signal {
        return Err(InstallError::UnsupportedSignal(signum));
    }
    match Signal::try_from(signum) {
        Ok(Signal::SIGKILL) | Ok(Signal::SIGSTOP) | Err(_) => {
            Err(InstallError::UnsupportedSignal(signum))
        }
        Ok(signal) => Ok(signal),
    }
}

/// Dispositions that were in place before the trap took over, indexed by signal number.
pub(crate) struct PreviousHandlers {
    handlers: [Option<(Signal, SigAction)>; MAX_SIGNALS],
}

impl PreviousHandlers {
    /// Installs `action` for every signal, on the alternate stack. On failure the signals
    /// already taken over are given back before the error is returned.
    ///
    /// # Safety
    /// `action` must be async-signal-safe.
    pub(crate) unsafe fn register(
        signals: &[Signal],
        action: SignalAction,
    ) -> Result<Self, InstallError> {
        let mut previous = Self {
            handlers: [None; MAX_SIGNALS],
        };
        // SA_NODEFER lets a fault inside the handler reach it again, where it is recognised as
        // nested instead of killing the process with the signal blocked.
        let sig_action = SigAction::new(
            SigHandler::SigAction(action),
            SaFlags::SA_NODEFER | SaFlags::SA_ONSTACK,
            signal::SigSet::empty(),
        );
        for signal in signals {
            match unsafe { signal::sigaction(*signal, &sig_action) } {
                Ok(old) => previous.handlers[*signal as usize] = Some((*signal, old)),
                Err(e) => {
                    previous.restore();
                    return Err(InstallError::InsufficientResources(format!(
                        "sigaction({signal}) failed: {e}"
                    )));
                }
            }
        }
        Ok(previous)
    }

    pub(crate) fn get(&self, signum: i32) -> Option<(Signal, SigAction)> {
        usize::try_from(signum)
            .ok()
            .and_then(|i| self.handlers.get(i).copied().flatten())
    }

    /// Puts the previous dispositions back.
    pub(crate) fn restore(&mut self) {
        for (signal, sigaction) in self.handlers.iter_mut().filter_map(Option::take) {
            // Safety: restores a disposition returned by sigaction.
            if let Err(e) = unsafe { signal::sigaction(signal, &sigaction) } {
                tracing::warn!("Unable to restore the handler for {signal}: {e}");
            }
        }
    }

    pub(crate) fn signals(&self) -> impl Iterator<Item = Signal> + '_ {
        self.handlers.iter().flatten().map(|(signal, _)| *signal)
    }
}

/// Once we've handled the signal, chain to the handler that was there before us.
///
/// How we chain depends on what kind of handler we're chaining to.
/// <https://www.gnu.org/software/libc/manual/html_node/Signal-Handling.html>
///
/// # Safety
/// `sig_info` and `ucontext` must be the ones the kernel passed to the current handler.
pub(crate) unsafe fn chain_signal_handler(
    previous: (Signal, SigAction),
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    let (signal, sigaction) = previous;
    match sigaction.handler() {
        // The caller falls through to its own termination, which covers the default action.
        SigHandler::SigDfl => (),
        SigHandler::SigIgn => (),
        SigHandler::Handler(f) => f(signal as i32),
        SigHandler::SigAction(f) => f(signal as i32, sig_info, ucontext),
    }
}

/// Restores the default action for `signum` and delivers it to the calling thread, which
/// normally does not return. Falls back to `_exit` if it does.
pub(crate) fn raise_default(signum: i32) -> ! {
    // Safety: sigaction is plain old data and zero is a valid starting value.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = libc::SIG_DFL;
    // Safety: pointers are valid. These calls are on the async-signal-safe list.
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signum, &action, ptr::null_mut());
        let mut unblock: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut unblock);
        libc::sigaddset(&mut unblock, signum);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &unblock, ptr::null_mut());
        libc::raise(signum);
    }
    crashdump_common::unix_utils::terminate()
}

/// Default alternate stack: the greater of 32 pages or SIGSTKSZ.
pub(crate) fn default_alt_stack_size() -> usize {
    std::cmp::max(
        SIGSTKSZ,
        crate::shared::constants::DEFAULT_ALT_STACK_PAGES * page_size::get(),
    )
}

/// A signal alternate stack with a guard page below it, installed for the calling thread.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
pub(crate) struct AltStack {
    mapping: NonNull<c_void>,
    mapping_len: usize,
    stack: libc::stack_t,
    previous: libc::stack_t,
}

impl AltStack {
    pub(crate) fn install(size: usize) -> Result<Self, InstallError> {
        let page_size = page_size::get();
        let size = size.div_ceil(page_size) * page_size;
        let mapping_len = size + page_size;
        let resources = |what: &str, e: nix::Error| {
            InstallError::InsufficientResources(format!("{what}: {e}"))
        };
        let len = NonZeroUsize::new(mapping_len)
            .ok_or_else(|| InstallError::InsufficientResources("empty alternate stack".into()))?;
        // Safety: a fresh anonymous mapping aliases nothing.
        let mapping = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| resources("failed to allocate an alternative stack", e))?;
        // Safety: the first page belongs to the mapping just created.
        if let Err(e) = unsafe { mprotect(mapping, page_size, ProtFlags::PROT_NONE) } {
            // Safety: unmaps exactly the mapping created above.
            let _ = unsafe { munmap(mapping, mapping_len) };
            return Err(resources("failed to set up alternative stack guard page", e));
        }

        let stack = libc::stack_t {
            // Safety: the mapping is larger than one page.
            ss_sp: unsafe { mapping.as_ptr().cast::<u8>().add(page_size) }.cast(),
            ss_flags: 0,
            ss_size: size,
        };
        // Safety: zero is a valid stack_t to be overwritten.
        let mut previous: libc::stack_t = unsafe { std::mem::zeroed() };
        // Safety: both pointers are valid.
        if unsafe { libc::sigaltstack(&stack, &mut previous) } != 0 {
            let e = nix::Error::last();
            // Safety: unmaps exactly the mapping created above.
            let _ = unsafe { munmap(mapping, mapping_len) };
            return Err(resources("sigaltstack failed", e));
        }
        Ok(Self {
            mapping,
            mapping_len,
            stack,
            previous,
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.stack.ss_size
    }

    /// Gives the thread its previous alternate stack back and frees this one, unless this
    /// stack is no longer the current one or is in use; then it is leaked.
    pub(crate) fn uninstall(self) {
        // Safety: zero is a valid stack_t to be overwritten.
        let mut current: libc::stack_t = unsafe { std::mem::zeroed() };
        // Safety: querying only.
        let queried = unsafe { libc::sigaltstack(ptr::null(), &mut current) } == 0;
        let ours = queried
            && current.ss_sp == self.stack.ss_sp
            && current.ss_flags & libc::SS_ONSTACK == 0;
        if !ours {
            tracing::warn!("Alternate stack changed or in use, leaking {} bytes", self.mapping_len);
            return;
        }
        let mut previous = self.previous;
        if previous.ss_sp.is_null() {
            previous.ss_flags = libc::SS_DISABLE;
        }
        // Safety: `previous` is what sigaltstack reported before this stack was installed.
        unsafe { libc::sigaltstack(&previous, ptr::null_mut()) };
        // Safety: the stack is no longer installed and nothing runs on it.
        if let Err(e) = unsafe { munmap(self.mapping, self.mapping_len) } {
            tracing::warn!("Unable to unmap the alternate stack: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_max_signals() {
        assert!(MAX_SIGNALS as libc::c_int > libc::SIGRTMAX());
    }

    #[test]
    fn test_interceptable_signal() {
        let suspend = libc::SIGRTMIN() + 7;
        assert_eq!(
            interceptable_signal(libc::SIGSEGV, suspend).unwrap(),
            Signal::SIGSEGV
        );
        for bad in [0, -1, libc::SIGKILL, libc::SIGSTOP, suspend, MAX_SIGNALS as i32] {
            assert!(matches!(
                interceptable_signal(bad, suspend),
                Err(InstallError::UnsupportedSignal(s)) if s == bad
            ));
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_alt_stack_install_and_uninstall() {
        // Runs on a fresh thread so the test harness thread keeps its own alternate stack.
        std::thread::spawn(|| {
            let stack = AltStack::install(default_alt_stack_size()).unwrap();
            assert!(stack.size() >= SIGSTKSZ);
            let mut current: libc::stack_t = unsafe { std::mem::zeroed() };
            assert_eq!(unsafe { libc::sigaltstack(ptr::null(), &mut current) }, 0);
            assert_eq!(current.ss_sp, stack.stack.ss_sp);
            let ours = stack.stack.ss_sp;
            stack.uninstall();
            assert_eq!(unsafe { libc::sigaltstack(ptr::null(), &mut current) }, 0);
            assert_ne!(current.ss_sp, ours);
        })
        .join()
        .unwrap();
    }
}

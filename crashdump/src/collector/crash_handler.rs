// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::capture::{CaptureEngine, CaptureSettings};
use super::platform::{current_registers, registers_from_ucontext};
use super::saguard::SaGuard;
use super::signal_handler_manager::{
    chain_signal_handler, default_alt_stack_size, interceptable_signal, raise_default, AltStack,
    PreviousHandlers,
};
use super::thread_list::{install_suspend_handler, restore_suspend_handler};
use crate::crash_info::FaultContext;
use crate::dump::{DumpOutcome, DumpTarget};
use crate::shared::configuration::HandlerConfig;
use crate::shared::constants::DEFAULT_SUSPEND_SIGNAL_OFFSET;
use crashdump_common::timeout::TimeoutManager;
use crashdump_common::unix_utils::{
    gettid, realtime_ns, sleep_for, terminate, write_stderr, ErrnoGuard,
};
use libc::{c_void, siginfo_t, ucontext_t};
use nix::sys::signal::Signal;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64};
use std::time::Duration;

// Note that this file makes use the following async-signal safe functions in a signal handler.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - clock_gettime
// - fsync, ftruncate, lseek, openat, renameat, unlinkat, write
// - getdents64, open, read, close (on /proc)
// - nanosleep
// - pthread_sigmask, raise, sigaction, tgkill
// - process_vm_readv

/// Invoked once a dump has been written, or has failed to be. It runs in the capturing
/// context, possibly a signal handler, so it must itself be async-signal-safe.
pub type DumpCallback = fn(&DumpOutcome);

/// How often a capture polls for the state while another capture owns it.
const STATE_POLL: Duration = Duration::from_millis(1);
/// Extra time an uninstall waits for an in-flight capture beyond its own timeout.
const UNINSTALL_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("a crash handler is already installed")]
    AlreadyInstalled,
    #[error("signal {0} cannot be intercepted")]
    UnsupportedSignal(i32),
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),
    #[error("cannot open the dump destination: {0}")]
    Destination(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no crash handler is installed")]
    NotInstalled,
    #[error("another capture did not finish within the capture timeout")]
    Busy,
    #[error("the dump could not be written: {0:?}")]
    DumpFailed(DumpOutcome),
}

/// Everything a capture needs, allocated at install so the signal path never allocates.
struct TrapState {
    config: HandlerConfig,
    engine: CaptureEngine,
    target: DumpTarget,
    callback: Option<DumpCallback>,
    previous: PreviousHandlers,
    suspend_signal: i32,
    suspend_previous: libc::sigaction,
    alt_stack: Option<AltStack>,
}

// These should always be either: null_mut, or `Box::into_raw()`.
// A capture takes the state with a swap to null and stores it back when done, so at most one
// capture owns it at a time and no lock is ever taken in a signal handler.
static STATE: AtomicPtr<TrapState> = AtomicPtr::new(ptr::null_mut());
static INSTALLED: AtomicBool = AtomicBool::new(false);
/// How long a capture waits for the state, published for the signal path.
static CAPTURE_TIMEOUT_NS: AtomicU64 = AtomicU64::new(0);
/// Thread currently owning the state, and thread running a chained previous handler.
static OWNER_TID: AtomicI32 = AtomicI32::new(0);
static CHAINING_TID: AtomicI32 = AtomicI32::new(0);

/// Takes the state, waiting for a concurrent capture to hand it back until `timeout`.
fn acquire_state(timeout: Duration) -> Option<&'static mut TrapState> {
    let wait = TimeoutManager::new(timeout);
    loop {
        let state = STATE.swap(ptr::null_mut(), SeqCst);
        if !state.is_null() {
            OWNER_TID.store(gettid(), SeqCst);
            // Safety: the pointer came from `Box::into_raw` and the swap made us its only user.
            return Some(unsafe { &mut *state });
        }
        if !INSTALLED.load(SeqCst) || wait.expired() {
            return None;
        }
        sleep_for(STATE_POLL);
    }
}

fn release_state(state: &'static mut TrapState) {
    OWNER_TID.store(0, SeqCst);
    STATE.store(state, SeqCst);
}

/// Ignores SIGPIPE until the guard drops, so a reader that went away cannot kill the process
/// halfway through the dump. Masking is best effort: on failure the dump is written anyway.
fn ignore_sigpipe() -> Option<SaGuard<1>> {
    match SaGuard::<1>::new(&[Signal::SIGPIPE]) {
        Ok(guard) => Some(guard),
        Err(_) => {
            write_stderr(b"crashdump: unable to ignore SIGPIPE, writing the dump anyway\n");
            None
        }
    }
}

/// Runs one capture on the owned state and writes it out.
fn capture_and_write(state: &mut TrapState, fault: FaultContext) -> DumpOutcome {
    let guard = ignore_sigpipe();
    let record = state.engine.capture(fault);
    let outcome = state.target.write(record);
    drop(guard);
    state.engine.release_threads();
    if let Some(callback) = state.callback {
        callback(&outcome);
    }
    outcome
}

/// # Safety
/// `sig_info` and `ucontext` must be null or come from the kernel.
unsafe fn fault_context(
    signum: i32,
    sig_info: *const siginfo_t,
    ucontext: *const ucontext_t,
) -> FaultContext {
    let registers = registers_from_ucontext(ucontext);
    let (si_code, fault_address) = if sig_info.is_null() {
        (0, 0)
    } else {
        ((*sig_info).si_code, (*sig_info).si_addr() as u64)
    };
    FaultContext {
        signal: signum,
        si_code,
        pid: libc::getpid() as u32,
        tid: gettid() as u32,
        fault_address,
        instruction_pointer: registers.instruction_pointer(),
        timestamp_ns: realtime_ns(),
        registers,
    }
}

extern "C" fn handle_fault(signum: i32, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    let _errno = ErrnoGuard::new();
    let tid = gettid();
    // A fault while capturing, or raised by the handler we chained to, gets no second dump.
    if OWNER_TID.load(SeqCst) == tid || CHAINING_TID.load(SeqCst) == tid {
        write_stderr(b"crashdump: nested fault, giving up on the capture\n");
        raise_default(signum);
    }

    let timeout = Duration::from_nanos(CAPTURE_TIMEOUT_NS.load(SeqCst));
    let Some(state) = acquire_state(timeout) else {
        write_stderr(b"crashdump: no capture state available\n");
        raise_default(signum);
    };

    // Safety: both pointers come straight from the kernel.
    let fault = unsafe { fault_context(signum, sig_info, ucontext as *const ucontext_t) };
    let outcome = capture_and_write(state, fault);
    if !outcome.succeeded {
        write_stderr(b"crashdump: no dump was written\n");
    }
    let previous = state.previous.get(signum);
    let chain = state.config.chain_previous();
    let rethrow = state.config.rethrow_after_capture();
    release_state(state);

    if chain {
        if let Some(previous) = previous {
            CHAINING_TID.store(tid, SeqCst);
            // Safety: the arguments are the ones we were called with.
            unsafe { chain_signal_handler(previous, sig_info, ucontext) };
            CHAINING_TID.store(0, SeqCst);
        }
    }
    if rethrow {
        raise_default(signum)
    } else {
        terminate()
    }
}

/// The installed crash trap. Dropping it uninstalls the trap.
///
/// Only one handler can be installed per process. The handle owns that installation:
/// [`CrashHandler::replace`] swaps the configuration and [`CrashHandler::uninstall`] gives the
/// signals back to whatever handled them before.
#[derive(Debug)]
pub struct CrashHandler {
    config: HandlerConfig,
    callback: Option<DumpCallback>,
    installed: bool,
}

impl CrashHandler {
    /// Installs the trap for the signals in `config`.
    ///
    /// Every buffer a capture may need is allocated here: the crash record, the thread park
    /// slots, the `/proc` scratch buffers, the alternate signal stack and the dump destination.
    pub fn install(config: HandlerConfig) -> Result<Self, InstallError> {
        Self::install_with_callback(config, None)
    }

    pub fn install_with_callback(
        config: HandlerConfig,
        callback: Option<DumpCallback>,
    ) -> Result<Self, InstallError> {
        if INSTALLED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_err()
        {
            return Err(InstallError::AlreadyInstalled);
        }
        match install_state(&config, callback) {
            Ok(state) => {
                CAPTURE_TIMEOUT_NS.store(config.capture_timeout().as_nanos() as u64, SeqCst);
                let signals: Vec<_> = state.previous.signals().collect();
                tracing::info!(
                    ?signals,
                    destination = ?config.destination(),
                    "Installed crash handler"
                );
                STATE.store(Box::into_raw(state), SeqCst);
                Ok(Self {
                    config,
                    callback,
                    installed: true,
                })
            }
            Err(e) => {
                INSTALLED.store(false, SeqCst);
                tracing::warn!("Unable to install the crash handler: {e}");
                Err(e)
            }
        }
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Uninstalls this handler and installs one for `config` in its place, keeping the
    /// callback. Returns the new handle and the configuration it replaced. On error no
    /// handler is installed.
    pub fn replace(mut self, config: HandlerConfig) -> Result<(Self, HandlerConfig), InstallError> {
        let callback = self.callback;
        let previous = self.config.clone();
        self.teardown();
        let handler = Self::install_with_callback(config, callback)?;
        tracing::debug!("Replaced crash handler configuration");
        Ok((handler, previous))
    }

    /// Restores the dispositions that were in place before [`CrashHandler::install`].
    ///
    /// Waits a grace period past the capture timeout for an in-flight capture. If the state
    /// is still not handed back the handler stays installed; use
    /// [`CrashHandler::try_uninstall`] to keep the handle in that case.
    pub fn uninstall(mut self) {
        self.teardown();
    }

    /// Like [`CrashHandler::uninstall`], but waits only the capture timeout and hands the
    /// handle back with [`CaptureError::Busy`] if a capture still owns the state.
    pub fn try_uninstall(mut self) -> Result<(), (Self, CaptureError)> {
        let wait = self.config.capture_timeout();
        if self.try_teardown(wait) {
            Ok(())
        } else {
            Err((self, CaptureError::Busy))
        }
    }

    /// Captures the whole process and writes a dump without crashing.
    ///
    /// Uses the same pre-allocated state as the trap. If a capture is already running, this
    /// waits for it up to the capture timeout.
    pub fn write_dump(&self) -> Result<DumpOutcome, CaptureError> {
        if !self.installed {
            return Err(CaptureError::NotInstalled);
        }
        let state = acquire_state(self.config.capture_timeout()).ok_or_else(|| {
            if INSTALLED.load(SeqCst) {
                CaptureError::Busy
            } else {
                CaptureError::NotInstalled
            }
        })?;
        let registers = current_registers();
        let fault = FaultContext {
            signal: 0,
            si_code: 0,
            pid: std::process::id(),
            tid: gettid() as u32,
            fault_address: 0,
            instruction_pointer: registers.instruction_pointer(),
            timestamp_ns: realtime_ns(),
            registers,
        };
        let outcome = capture_and_write(state, fault);
        release_state(state);

        if outcome.succeeded {
            tracing::debug!(?outcome, "Wrote on-demand dump");
            Ok(outcome)
        } else {
            tracing::warn!(?outcome, "On-demand dump failed");
            Err(CaptureError::DumpFailed(outcome))
        }
    }

    fn teardown(&mut self) {
        let wait = self.config.capture_timeout() + UNINSTALL_GRACE;
        if !self.try_teardown(wait) {
            // A capture never returned the state; the process is most likely going down.
            self.installed = false;
            tracing::warn!("Crash handler state is still in use, leaving the handler installed");
        }
    }

    /// Gives the signals back and frees the state. Returns false, leaving everything
    /// installed and `self` still owning the installation, if the state is not handed back
    /// within `wait`.
    fn try_teardown(&mut self, wait: Duration) -> bool {
        if !self.installed {
            return true;
        }
        let Some(state) = acquire_state(wait) else {
            return false;
        };
        self.installed = false;
        OWNER_TID.store(0, SeqCst);
        // Safety: `acquire_state` handed out the only reference; this turns it back into the Box.
        let mut state = unsafe { Box::from_raw(state as *mut TrapState) };
        state.previous.restore();
        restore_suspend_handler(state.suspend_signal, &state.suspend_previous);
        if let Some(alt_stack) = state.alt_stack.take() {
            alt_stack.uninstall();
        }
        drop(state);
        INSTALLED.store(false, SeqCst);
        tracing::info!("Uninstalled crash handler");
        true
    }
}

impl Drop for CrashHandler {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn install_state(
    config: &HandlerConfig,
    callback: Option<DumpCallback>,
) -> Result<Box<TrapState>, InstallError> {
    let suspend_signal = config
        .suspend_signal()
        .unwrap_or_else(|| libc::SIGRTMIN() + DEFAULT_SUSPEND_SIGNAL_OFFSET);
    let signals = config
        .signals()
        .iter()
        .map(|signum| interceptable_signal(*signum, suspend_signal))
        .collect::<Result<Vec<_>, _>>()?;

    let settings = CaptureSettings {
        limits: config.capture_limits(),
        max_stack_depth: config.max_stack_depth(),
        stack_capture_bytes: config.stack_capture_bytes(),
        timeout: config.capture_timeout(),
        suspend_signal,
    };
    let engine = CaptureEngine::new(settings).map_err(|e| {
        InstallError::InsufficientResources(format!("cannot open the memory reader: {e}"))
    })?;
    let target = DumpTarget::open(config.destination(), config.max_dump_bytes())?;
    let alt_stack =
        AltStack::install(config.alt_stack_size().unwrap_or_else(default_alt_stack_size))?;

    let suspend_previous = match install_suspend_handler(suspend_signal) {
        Ok(previous) => previous,
        Err(e) => {
            alt_stack.uninstall();
            return Err(InstallError::InsufficientResources(format!(
                "cannot install the thread suspend handler: {e}"
            )));
        }
    };
    // Safety: `handle_fault` only uses async-signal-safe functions.
    let previous = match unsafe { PreviousHandlers::register(&signals, handle_fault) } {
        Ok(previous) => previous,
        Err(e) => {
            restore_suspend_handler(suspend_signal, &suspend_previous);
            alt_stack.uninstall();
            return Err(e);
        }
    };
    tracing::debug!(
        alt_stack_bytes = alt_stack.size(),
        suspend_signal,
        base_name = target.base_name(),
        "Reserved crash capture resources"
    );

    Ok(Box::new(TrapState {
        config: config.clone(),
        engine,
        target,
        callback,
        previous,
        suspend_signal,
        suspend_previous,
        alt_stack: Some(alt_stack),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::suspend_test_lock;
    use crate::dump::read_dump_file;

    fn config_in(dir: &std::path::Path) -> HandlerConfig {
        let mut config = HandlerConfig::with_directory(dir).unwrap();
        config.set_suspend_signal(libc::SIGRTMIN() + 11).unwrap();
        config
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_install_twice_fails() {
        let _guard = suspend_test_lock();
        let dir = tempfile::tempdir().unwrap();
        let handler = CrashHandler::install(config_in(dir.path())).unwrap();
        assert!(matches!(
            CrashHandler::install(config_in(dir.path())),
            Err(InstallError::AlreadyInstalled)
        ));
        handler.uninstall();
        CrashHandler::install(config_in(dir.path())).unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_unsupported_signal_leaves_nothing_installed() {
        let _guard = suspend_test_lock();
        let dir = tempfile::tempdir().unwrap();
        let config = HandlerConfig::new(
            crate::shared::configuration::Destination::Directory(dir.path().to_path_buf()),
            1 << 20,
            vec![libc::SIGSEGV, libc::SIGKILL],
            false,
            true,
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(matches!(
            CrashHandler::install(config),
            Err(InstallError::UnsupportedSignal(libc::SIGKILL))
        ));
        assert!(!INSTALLED.load(SeqCst));
        assert!(STATE.load(SeqCst).is_null());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_write_dump_and_callback() {
        use std::sync::atomic::AtomicU32;
        static CALLS: AtomicU32 = AtomicU32::new(0);
        fn on_dump(outcome: &DumpOutcome) {
            if outcome.succeeded {
                CALLS.fetch_add(1, SeqCst);
            }
        }

        let _guard = suspend_test_lock();
        let dir = tempfile::tempdir().unwrap();
        let handler =
            CrashHandler::install_with_callback(config_in(dir.path()), Some(on_dump)).unwrap();
        let outcome = handler.write_dump().unwrap();
        assert_eq!(CALLS.load(SeqCst), 1);
        assert_eq!(outcome.faulting_tid, gettid() as u32);
        assert_eq!(outcome.signal, 0);

        let parsed = read_dump_file(dir.path().join(outcome.file_name().unwrap())).unwrap();
        assert_eq!(parsed.context.tid, outcome.faulting_tid);
        assert_eq!(parsed.threads[0].tid, outcome.faulting_tid);
        assert!(!parsed.modules.is_empty());
        handler.uninstall();
        assert!(!INSTALLED.load(SeqCst));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_try_uninstall_returns_handle_while_busy() {
        let _guard = suspend_test_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut config = HandlerConfig::new(
            crate::shared::configuration::Destination::Directory(dir.path().to_path_buf()),
            1 << 20,
            vec![],
            false,
            true,
            Duration::from_millis(50),
        )
        .unwrap();
        config.set_suspend_signal(libc::SIGRTMIN() + 11).unwrap();
        let handler = CrashHandler::install(config).unwrap();

        // Hold the state the way an in-flight capture would.
        let state = acquire_state(Duration::from_secs(1)).unwrap();
        let (handler, error) = handler.try_uninstall().unwrap_err();
        assert!(matches!(error, CaptureError::Busy));
        assert!(INSTALLED.load(SeqCst));
        assert!(matches!(handler.write_dump(), Err(CaptureError::Busy)));

        release_state(state);
        handler.try_uninstall().unwrap();
        assert!(!INSTALLED.load(SeqCst));
        assert!(STATE.load(SeqCst).is_null());
        CrashHandler::install(config_in(dir.path())).unwrap().uninstall();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_capture_ignores_sigpipe_only_while_writing() {
        fn sigpipe_ignored() -> bool {
            let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
            // Safety: a null new action only queries the disposition.
            unsafe { libc::sigaction(libc::SIGPIPE, ptr::null(), &mut current) };
            current.sa_sigaction == libc::SIG_IGN
        }

        let _lock = suspend_test_lock();
        let before = sigpipe_ignored();
        {
            let guard = ignore_sigpipe();
            assert!(guard.is_some());
            assert!(sigpipe_ignored());
        }
        assert_eq!(sigpipe_ignored(), before);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_replace_returns_previous_config() {
        let _guard = suspend_test_lock();
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let handler = CrashHandler::install(config_in(first.path())).unwrap();
        let (handler, previous) = handler.replace(config_in(second.path())).unwrap();
        assert_eq!(previous, config_in(first.path()));
        let outcome = handler.write_dump().unwrap();
        assert!(second.path().join(outcome.file_name().unwrap()).exists());
        drop(handler);
        assert!(!INSTALLED.load(SeqCst));
    }
}

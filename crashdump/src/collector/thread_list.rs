// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thread enumeration and suspension for the capture engine.
//!
//! Threads are listed from `/proc/self/task` with raw `getdents64(2)` calls into a caller
//! supplied buffer. To read another thread's registers the capturing thread sends it the
//! suspend signal: its handler copies the registers out of the signal context into a park
//! slot, acknowledges, and sleeps until the capture releases it or its own deadline passes.
//! No locks are taken on either side.

use crate::collector::platform::registers_from_ucontext;
use crate::crash_info::RegisterSet;
use crashdump_common::timeout::TimeoutManager;
use crashdump_common::unix_utils::{gettid, monotonic_ns, sleep_for, ErrnoGuard};
use libc::{c_int, c_void, siginfo_t, ucontext_t};
use nix::errno::Errno;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize};
use std::sync::atomic::Ordering::SeqCst;
use std::time::Duration;

/// How long a parked thread waits for its release before resuming on its own.
const MAX_PARK: Duration = Duration::from_secs(10);
const PARK_POLL: Duration = Duration::from_micros(200);
/// Bound on waiting for parked threads to leave their slots after a release.
const RESUME_WAIT: Duration = Duration::from_millis(100);

/// Lists the threads of this process into `out`, sorted by id.
/// Returns false when some thread could not be recorded.
pub(crate) fn list_threads(scratch: &mut [u8], out: &mut Vec<libc::pid_t>) -> bool {
    const TASK_DIR: &[u8] = b"/proc/self/task\0";
    out.clear();
    // Safety: TASK_DIR is nul terminated.
    let fd = unsafe {
        libc::open(
            TASK_DIR.as_ptr().cast(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return false;
    }
    let mut complete = true;
    loop {
        // Safety: the kernel writes at most `scratch.len()` bytes of dirents into `scratch`.
        let n = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                fd,
                scratch.as_mut_ptr(),
                scratch.len(),
            )
        };
        if n < 0 {
            if Errno::last() == Errno::EINTR {
                continue;
            }
            complete = false;
            break;
        }
        if n == 0 {
            break;
        }
        complete &= parse_dirents(&scratch[..n as usize], out);
    }
    // Safety: `fd` was opened above.
    unsafe { libc::close(fd) };
    out.sort_unstable();
    complete
}

/// Decodes `linux_dirent64` records whose names are thread ids.
fn parse_dirents(mut buf: &[u8], out: &mut Vec<libc::pid_t>) -> bool {
    // d_ino u64, d_off i64, d_reclen u16, d_type u8, d_name
    const NAME_OFFSET: usize = 19;
    let mut complete = true;
    while buf.len() >= NAME_OFFSET {
        let reclen = u16::from_ne_bytes([buf[16], buf[17]]) as usize;
        if reclen < NAME_OFFSET || reclen > buf.len() {
            return false;
        }
        let name = &buf[NAME_OFFSET..reclen];
        let name = &name[..name.iter().position(|b| *b == 0).unwrap_or(name.len())];
        if let Some(tid) = parse_tid(name) {
            if out.len() < out.capacity() {
                out.push(tid);
            } else {
                complete = false;
            }
        }
        buf = &buf[reclen..];
    }
    complete
}

fn parse_tid(name: &[u8]) -> Option<libc::pid_t> {
    if name.is_empty() || name.len() > 10 {
        return None;
    }
    let mut tid: i64 = 0;
    for b in name {
        if !b.is_ascii_digit() {
            return None;
        }
        tid = tid * 10 + (b - b'0') as i64;
    }
    libc::pid_t::try_from(tid).ok().filter(|t| *t > 0)
}

const SLOT_IDLE: u32 = 0;
const SLOT_REQUESTED: u32 = 1;
const SLOT_PARKING: u32 = 2;
const SLOT_PARKED: u32 = 3;
const SLOT_RESUMED: u32 = 4;
const SLOT_GONE: u32 = 5;

struct ParkSlot {
    tid: AtomicI32,
    state: AtomicU32,
    registers: UnsafeCell<RegisterSet>,
}

/// Park slots shared between the capturing thread and the suspend signal handler.
struct Session {
    slots: Box<[ParkSlot]>,
    active: AtomicUsize,
    release: AtomicBool,
    /// Monotonic time after which parked threads resume without waiting for the release.
    deadline_ns: AtomicU64,
}

// Safety: `registers` of a slot is only written by the thread that moved the slot from
// REQUESTED to PARKING, and only read by the capturing thread once the slot is PARKED.
unsafe impl Sync for Session {}

static SESSION: AtomicPtr<Session> = AtomicPtr::new(ptr::null_mut());

/// Handler for the suspend signal. Async-signal-safe: atomics and `nanosleep` only.
extern "C" fn handle_suspend_signal(_signum: c_int, _info: *mut siginfo_t, ucontext: *mut c_void) {
    let _errno = ErrnoGuard::new();
    let session = SESSION.load(SeqCst);
    if session.is_null() {
        return;
    }
    // Safety: a published session stays alive until every parked thread has resumed or the
    // resume wait has expired.
    let session = unsafe { &*session };
    let tid = gettid();
    let active = session.active.load(SeqCst).min(session.slots.len());
    let Some(slot) = session.slots[..active]
        .iter()
        .find(|slot| slot.tid.load(SeqCst) == tid)
    else {
        return;
    };
    if slot
        .state
        .compare_exchange(SLOT_REQUESTED, SLOT_PARKING, SeqCst, SeqCst)
        .is_err()
    {
        return;
    }
    // Safety: the compare_exchange above gives this thread exclusive access to the slot.
    unsafe { *slot.registers.get() = registers_from_ucontext(ucontext as *const ucontext_t) };
    slot.state.store(SLOT_PARKED, SeqCst);

    let deadline = session.deadline_ns.load(SeqCst);
    while !session.release.load(SeqCst) && monotonic_ns() < deadline {
        sleep_for(PARK_POLL);
    }
    slot.state.store(SLOT_RESUMED, SeqCst);
}

/// Installs the suspend signal handler, returning the previous disposition.
pub(crate) fn install_suspend_handler(signum: c_int) -> Result<libc::sigaction, Errno> {
    // Safety: sigaction is a plain-old-data struct, zero is a valid initial value.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handle_suspend_signal as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    // Safety: `action.sa_mask` is a valid sigset_t.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    // Safety: zero is a valid sigaction to be overwritten.
    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    // Safety: both pointers are valid.
    if unsafe { libc::sigaction(signum, &action, &mut previous) } != 0 {
        return Err(Errno::last());
    }
    Ok(previous)
}

pub(crate) fn restore_suspend_handler(signum: c_int, previous: &libc::sigaction) {
    // Safety: `previous` came from a successful sigaction call.
    unsafe { libc::sigaction(signum, previous, ptr::null_mut()) };
}

/// Parks and releases the other threads of the process around a capture.
pub(crate) struct ThreadSuspender {
    session: Box<Session>,
    signal: c_int,
}

impl ThreadSuspender {
    pub(crate) fn new(signal: c_int, max_threads: usize) -> Self {
        let slots = (0..max_threads)
            .map(|_| ParkSlot {
                tid: AtomicI32::new(0),
                state: AtomicU32::new(SLOT_IDLE),
                registers: UnsafeCell::new(RegisterSet::empty()),
            })
            .collect();
        Self {
            session: Box::new(Session {
                slots,
                active: AtomicUsize::new(0),
                release: AtomicBool::new(false),
                deadline_ns: AtomicU64::new(0),
            }),
            signal,
        }
    }

    /// Asks every thread in `tids` except `self_tid` to park, and waits until they have or
    /// `deadline` expires. Returns false if some thread did not acknowledge in time.
    pub(crate) fn suspend_all(
        &self,
        tids: &[libc::pid_t],
        self_tid: libc::pid_t,
        deadline: &TimeoutManager,
    ) -> bool {
        let session = &*self.session;
        session.release.store(false, SeqCst);
        session.deadline_ns.store(
            monotonic_ns().saturating_add(MAX_PARK.as_nanos() as u64),
            SeqCst,
        );
        let mut active = 0;
        for (slot, tid) in session
            .slots
            .iter()
            .zip(tids.iter().filter(|t| **t != self_tid))
        {
            slot.tid.store(*tid, SeqCst);
            slot.state.store(SLOT_REQUESTED, SeqCst);
            active += 1;
        }
        session.active.store(active, SeqCst);
        SESSION.store(session as *const Session as *mut Session, SeqCst);

        // Safety: no preconditions
        let pid = unsafe { libc::getpid() };
        for slot in &session.slots[..active] {
            let tid = slot.tid.load(SeqCst);
            // Safety: plain syscall; a thread that already exited yields ESRCH.
            let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, self.signal) };
            if rc != 0 {
                slot.state.store(SLOT_GONE, SeqCst);
            }
        }

        loop {
            let pending = session.slots[..active].iter().any(|slot| {
                matches!(slot.state.load(SeqCst), SLOT_REQUESTED | SLOT_PARKING)
            });
            if !pending {
                return true;
            }
            if deadline.expired() {
                return false;
            }
            sleep_for(PARK_POLL);
        }
    }

    /// Registers of `tid` if it is parked.
    pub(crate) fn registers_of(&self, tid: libc::pid_t) -> Option<RegisterSet> {
        let session = &*self.session;
        let active = session.active.load(SeqCst);
        let slot = session.slots[..active]
            .iter()
            .find(|slot| slot.tid.load(SeqCst) == tid)?;
        if slot.state.load(SeqCst) != SLOT_PARKED {
            return None;
        }
        // Safety: a PARKED slot is no longer written by its thread.
        Some(unsafe { *slot.registers.get() })
    }

    /// Lets every parked thread continue and unpublishes the session.
    pub(crate) fn resume_all(&self) {
        let session = &*self.session;
        let active = session.active.load(SeqCst);
        if active == 0 {
            return;
        }
        session.release.store(true, SeqCst);
        let wait = TimeoutManager::new(RESUME_WAIT);
        while !wait.expired()
            && session.slots[..active]
                .iter()
                .any(|slot| matches!(slot.state.load(SeqCst), SLOT_PARKING | SLOT_PARKED))
        {
            sleep_for(PARK_POLL);
        }
        // Threads that never saw the request must not park after the release.
        for slot in &session.slots[..active] {
            let _ = slot
                .state
                .compare_exchange(SLOT_REQUESTED, SLOT_IDLE, SeqCst, SeqCst);
        }
        let _ = SESSION.compare_exchange(
            session as *const Session as *mut Session,
            ptr::null_mut(),
            SeqCst,
            SeqCst,
        );
        session.active.store(0, SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirent(name: &[u8]) -> Vec<u8> {
        let reclen = (19 + name.len() + 1).next_multiple_of(8);
        let mut record = vec![0u8; reclen];
        record[16..18].copy_from_slice(&(reclen as u16).to_ne_bytes());
        record[19..19 + name.len()].copy_from_slice(name);
        record
    }

    #[test]
    fn test_parse_dirents() {
        let mut buf = Vec::new();
        for name in [&b"."[..], b"..", b"1234", b"17", b"abc"] {
            buf.extend(dirent(name));
        }
        let mut out = Vec::with_capacity(8);
        assert!(parse_dirents(&buf, &mut out));
        assert_eq!(out, vec![1234, 17]);

        let mut small = Vec::with_capacity(1);
        assert!(!parse_dirents(&buf, &mut small));
        assert_eq!(small, vec![1234]);
    }

    #[test]
    fn test_parse_tid() {
        assert_eq!(parse_tid(b"42"), Some(42));
        assert_eq!(parse_tid(b"0"), None);
        assert_eq!(parse_tid(b"99999999999"), None);
        assert_eq!(parse_tid(b"4a"), None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_list_threads_sees_spawned_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            tx.send(gettid()).unwrap();
            done_rx.recv().unwrap();
        });
        let other = rx.recv().unwrap();

        let mut scratch = vec![0u8; 256];
        let mut tids = Vec::with_capacity(1024);
        assert!(list_threads(&mut scratch, &mut tids));
        assert!(tids.contains(&gettid()));
        assert!(tids.contains(&other));
        assert!(tids.windows(2).all(|w| w[0] < w[1]));

        done_tx.send(()).unwrap();
        handle.join().unwrap();
    }
}

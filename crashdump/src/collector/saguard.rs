// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler};

// Lexically scoped suppression of signals the capture itself may cause.
// Writing the dump to a pipe or socket whose reader is gone raises SIGPIPE, and the process's
// own disposition for it may be to die before the dump is finished. While the guard lives the
// listed signals are ignored and blocked for the calling thread; dropping it restores both.
pub struct SaGuard<const N: usize> {
    old_sigactions: [(signal::Signal, SigAction); N],
    old_sigmask: signal::SigSet,
}

impl<const N: usize> SaGuard<N> {
    pub fn new(signals: &[signal::Signal; N]) -> nix::Result<Self> {
        let mut suppressed_signals = signal::SigSet::empty();
        for signal in signals {
            suppressed_signals.add(*signal);
        }

        // Only this thread's mask changes: the other threads are parked by the capture.
        let mut old_sigmask = signal::SigSet::empty();
        signal::pthread_sigmask(
            signal::SigmaskHow::SIG_BLOCK,
            Some(&suppressed_signals),
            Some(&mut old_sigmask),
        )?;

        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), signal::SigSet::empty());
        let mut old_sigactions = [(signal::Signal::SIGPIPE, ignore); N];
        for (i, &signal) in signals.iter().enumerate() {
            // Safety: installing SIG_IGN runs no user code.
            match unsafe { signal::sigaction(signal, &ignore) } {
                Ok(old_sigaction) => old_sigactions[i] = (signal, old_sigaction),
                Err(e) => {
                    for &(signal, old_sigaction) in &old_sigactions[..i] {
                        // Safety: restores a disposition returned by sigaction.
                        let _ = unsafe { signal::sigaction(signal, &old_sigaction) };
                    }
                    let _ = signal::pthread_sigmask(
                        signal::SigmaskHow::SIG_SETMASK,
                        Some(&old_sigmask),
                        None,
                    );
                    return Err(e);
                }
            }
        }

        Ok(Self {
            old_sigactions,
            old_sigmask,
        })
    }
}

impl<const N: usize> Drop for SaGuard<N> {
    fn drop(&mut self) {
        for &(signal, old_sigaction) in &self.old_sigactions {
            // Safety: restores a disposition returned by sigaction.
            unsafe {
                let _ = signal::sigaction(signal, &old_sigaction);
            }
        }

        let _ = signal::pthread_sigmask(
            signal::SigmaskHow::SIG_SETMASK,
            Some(&self.old_sigmask),
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    fn current_action(signal: Signal) -> SigHandler {
        let query = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), signal::SigSet::empty());
        // Safety: the original disposition is put back straight away.
        let old = unsafe { signal::sigaction(signal, &query) }.unwrap();
        unsafe { signal::sigaction(signal, &old) }.unwrap();
        old.handler()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_guard_ignores_and_restores() {
        let before = current_action(Signal::SIGPIPE);
        {
            let _guard = SaGuard::<1>::new(&[Signal::SIGPIPE]).unwrap();
            assert_eq!(current_action(Signal::SIGPIPE), SigHandler::SigIgn);
            let mask = signal::SigSet::thread_get_mask().unwrap();
            assert!(mask.contains(Signal::SIGPIPE));
        }
        assert_eq!(current_action(Signal::SIGPIPE), before);
        let mask = signal::SigSet::thread_get_mask().unwrap();
        assert!(!mask.contains(Signal::SIGPIPE));
    }
}

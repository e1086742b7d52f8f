// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frame pointer stack walking over memory that may be corrupt.
//!
//! On both x86_64 and aarch64 a function that keeps a frame pointer stores the caller's frame
//! pointer at `[fp]` and its own return address at `[fp + 8]`. Walking that chain only needs
//! word reads, which all go through a [`MemoryReader`], so a damaged stack ends the walk with
//! an error instead of a second fault.
//!
//! The walk is lazy: frames are produced one at a time and the caller can stop whenever it
//! runs out of room or time.

use crate::collector::memory_reader::{MemoryReader, ReadError};
use crate::collector::platform::WORD_SIZE;
use crate::crash_info::{Frame, ModuleInfo, RegisterSet};

/// Decides whether an address can be a return address.
pub trait CodeRanges {
    fn contains_code(&self, addr: u64) -> bool;
}

/// Accepts every non-null address.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyAddress;

impl CodeRanges for AnyAddress {
    fn contains_code(&self, addr: u64) -> bool {
        addr != 0
    }
}

/// An empty module list means nothing is known about the address space, so every address is
/// accepted.
impl CodeRanges for [ModuleInfo] {
    fn contains_code(&self, addr: u64) -> bool {
        self.is_empty() || self.iter().any(|m| m.contains(addr))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WalkError {
    #[error("frame record at {addr:#x} is not readable: {source}")]
    Unreadable {
        addr: u64,
        #[source]
        source: ReadError,
    },
    #[error("return address {addr:#x} is outside every known module")]
    ImplausibleReturnAddress { addr: u64 },
    #[error("frame pointer {addr:#x} does not move up the stack")]
    CorruptFramePointer { addr: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The walk has not finished.
    Running,
    /// A null frame pointer or return address: the outermost frame was reached.
    EndOfStack,
    DepthLimit,
    Unreadable,
    ImplausibleReturnAddress,
    CorruptFramePointer,
}

impl StopReason {
    /// Whether frames may be missing from the walk.
    pub fn is_truncation(self) -> bool {
        !matches!(self, StopReason::Running | StopReason::EndOfStack)
    }
}

pub struct FrameWalker<'a, R: ?Sized, C: ?Sized> {
    reader: &'a R,
    code: &'a C,
    max_depth: usize,
    yielded: usize,
    ip: u64,
    fp: u64,
    /// Lowest address the next frame record may start at.
    floor: u64,
    started: bool,
    stop: StopReason,
}

/// Walks the stack described by `registers`, yielding at most `max_depth` frames.
///
/// The first frame is the interrupted instruction itself, taken from the registers, so it is
/// reported even when it points outside every module (a call through a bad function pointer).
pub fn walk<'a, R: MemoryReader + ?Sized>(
    registers: &RegisterSet,
    reader: &'a R,
    max_depth: usize,
) -> FrameWalker<'a, R, AnyAddress> {
    FrameWalker {
        reader,
        code: &AnyAddress,
        max_depth,
        yielded: 0,
        ip: registers.instruction_pointer(),
        fp: registers.frame_pointer(),
        floor: registers.stack_pointer(),
        started: false,
        stop: StopReason::Running,
    }
}

impl<'a, R: MemoryReader + ?Sized, C: CodeRanges + ?Sized> FrameWalker<'a, R, C> {
    /// Rejects return addresses for which `code` returns false.
    pub fn with_code_ranges<C2: CodeRanges + ?Sized>(self, code: &'a C2) -> FrameWalker<'a, R, C2> {
        FrameWalker {
            reader: self.reader,
            code,
            max_depth: self.max_depth,
            yielded: self.yielded,
            ip: self.ip,
            fp: self.fp,
            floor: self.floor,
            started: self.started,
            stop: self.stop,
        }
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop
    }

    fn fail(&mut self, reason: StopReason, error: WalkError) -> Option<Result<Frame, WalkError>> {
        self.stop = reason;
        Some(Err(error))
    }

    fn step(&mut self) -> Option<Result<Frame, WalkError>> {
        if !self.started {
            self.started = true;
            if self.ip == 0 && self.fp == 0 {
                self.stop = StopReason::EndOfStack;
                return None;
            }
            return Some(Ok(Frame {
                return_address: self.ip,
                frame_base: (self.fp != 0).then_some(self.fp),
            }));
        }

        let fp = self.fp;
        if fp == 0 {
            self.stop = StopReason::EndOfStack;
            return None;
        }
        if fp % WORD_SIZE != 0 || fp < self.floor {
            return self.fail(
                StopReason::CorruptFramePointer,
                WalkError::CorruptFramePointer { addr: fp },
            );
        }
        let (saved_fp, return_address) = match self
            .reader
            .read_word(fp)
            .and_then(|saved| Ok((saved, self.reader.read_word(fp + WORD_SIZE)?)))
        {
            Ok(pair) => pair,
            Err(source) => {
                return self.fail(
                    StopReason::Unreadable,
                    WalkError::Unreadable { addr: fp, source },
                )
            }
        };
        if return_address == 0 {
            self.stop = StopReason::EndOfStack;
            return None;
        }
        if !self.code.contains_code(return_address) {
            return self.fail(
                StopReason::ImplausibleReturnAddress,
                WalkError::ImplausibleReturnAddress {
                    addr: return_address,
                },
            );
        }
        // The caller's record must sit strictly above this one.
        self.floor = fp + 2 * WORD_SIZE;
        self.fp = saved_fp;
        Some(Ok(Frame {
            return_address,
            frame_base: (saved_fp != 0).then_some(saved_fp),
        }))
    }
}

impl<R: MemoryReader + ?Sized, C: CodeRanges + ?Sized> Iterator for FrameWalker<'_, R, C> {
    type Item = Result<Frame, WalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stop != StopReason::Running {
            return None;
        }
        if self.yielded >= self.max_depth {
            self.stop = StopReason::DepthLimit;
            return None;
        }
        let item = self.step();
        if let Some(Ok(_)) = item {
            self.yielded += 1;
        }
        item
    }
}

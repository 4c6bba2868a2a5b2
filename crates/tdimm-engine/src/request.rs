//! Block requests, control commands and their completions
//!
//! A [`Request`] is owned by the caller until the engine (or the splitter)
//! invokes its completion. Every request is completed exactly once: dropping
//! a request that still holds its completion completes it with
//! [`IoError::Aborted`].

use crate::biogrp::SplitGroup;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tdimm_common::{Direction, IoError, IoResult};
use tracing::warn;

/// Caller completion, invoked with the result and the request latency
pub type CompletionFn = Box<dyn FnOnce(IoResult, Duration) + Send>;

/// Caller completion for control commands
pub type ControlCompletionFn = Box<dyn FnOnce(Result<u64, IoError>) + Send>;

/// Where a request's completion goes
pub enum Completion {
    /// Top-level request: call back into the submitter
    Callback(CompletionFn),
    /// Fragment of a split request: join into the owning group
    Part(Arc<SplitGroup>),
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("Callback"),
            Self::Part(group) => write!(f, "Part(total={})", group.total()),
        }
    }
}

/// Per-request flags set by the submitter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    /// Caller waits synchronously on this request
    pub sync: bool,
    /// All earlier work must finish before this request starts
    pub barrier: bool,
}

impl RequestFlags {
    #[must_use]
    pub const fn serializing(&self) -> bool {
        self.sync || self.barrier
    }
}

bitflags! {
    /// Flags the splitter and engine attach to a request
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct SplitFlags: u8 {
        /// Fragment of a larger request
        const IS_PART = 0x01;
        /// Replica produced by `replicate`
        const REPLICA = 0x02;
        /// Piece of a split discard
        const DISCARD_PIECE = 0x04;
        /// Put back on the queue after a failed admission
        const REQUEUED = 0x08;
    }
}

/// A window onto a shared data buffer
///
/// Fragments of one request share the parent's allocation, each looking at
/// its own byte range.
#[derive(Clone, Default)]
pub struct IoBuf {
    data: Arc<Mutex<Vec<u8>>>,
    start: usize,
    len: usize,
}

impl std::fmt::Debug for IoBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuf")
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

impl IoBuf {
    /// Zero-filled buffer of `len` bytes
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            data: Arc::new(Mutex::new(data)),
            start: 0,
            len,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sub-window of this window; clamped to the window end
    #[must_use]
    pub fn window(&self, offset: usize, len: usize) -> Self {
        let offset = offset.min(self.len);
        Self {
            data: Arc::clone(&self.data),
            start: self.start + offset,
            len: len.min(self.len - offset),
        }
    }

    /// Copy out of the window starting at `offset`
    ///
    /// Copies at most up to the window end; an offset past it copies nothing.
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) {
        let data = self.data.lock();
        let from = self.start + offset;
        let n = dst.len().min(self.len.saturating_sub(offset));
        if n == 0 {
            return;
        }
        dst[..n].copy_from_slice(&data[from..from + n]);
    }

    /// Copy into the window starting at `offset`
    pub fn copy_from(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.lock();
        let to = self.start + offset;
        let n = src.len().min(self.len.saturating_sub(offset));
        if n == 0 {
            return;
        }
        data[to..to + n].copy_from_slice(&src[..n]);
    }

    /// Copy of the window contents
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let data = self.data.lock();
        data[self.start..self.start + self.len].to_vec()
    }
}

/// Strided extent of a discard piece
///
/// `stripes` stripes of `stripe_bytes` each, the first at the request
/// offset and each following one `stride_bytes` further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardExtent {
    pub backend: u32,
    pub stripe_bytes: u64,
    pub stride_bytes: u64,
    pub stripes: u64,
}

impl DiscardExtent {
    /// Device byte range touched, from first stripe start to last stripe end
    #[must_use]
    pub const fn span(&self, offset: u64) -> (u64, u64) {
        let last = offset + (self.stripes - 1) * self.stride_bytes;
        (offset, last + self.stripe_bytes)
    }
}

/// A block I/O request
pub struct Request {
    pub direction: Direction,
    /// Device-relative byte offset
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
    pub flags: RequestFlags,
    pub split_flags: SplitFlags,
    /// Data to write, or destination of a read
    pub buf: IoBuf,
    /// Strided layout of a discard piece
    pub discard: Option<DiscardExtent>,
    /// Caller-chosen tag, carried into logs
    pub tag: u64,
    completion: Option<Completion>,
    submitted: Instant,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("direction", &self.direction)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("split_flags", &self.split_flags)
            .field("tag", &self.tag)
            .field("completion", &self.completion)
            .finish_non_exhaustive()
    }
}

impl Request {
    /// Create a request; data buffers and completion are attached with the
    /// builder methods
    #[must_use]
    pub fn new(direction: Direction, offset: u64, size: u64) -> Self {
        Self {
            direction,
            offset,
            size,
            flags: RequestFlags::default(),
            split_flags: SplitFlags::empty(),
            buf: IoBuf::default(),
            discard: None,
            tag: 0,
            completion: None,
            submitted: Instant::now(),
        }
    }

    /// Read `buf.len()` bytes at `offset` into `buf`
    #[must_use]
    pub fn read(offset: u64, buf: IoBuf) -> Self {
        let size = buf.len() as u64;
        Self::new(Direction::Read, offset, size).with_buf(buf)
    }

    /// Write `buf` at `offset`
    #[must_use]
    pub fn write(offset: u64, buf: IoBuf) -> Self {
        let size = buf.len() as u64;
        Self::new(Direction::Write, offset, size).with_buf(buf)
    }

    /// Discard `size` bytes at `offset`
    #[must_use]
    pub fn discard(offset: u64, size: u64) -> Self {
        Self::new(Direction::Discard, offset, size)
    }

    #[must_use]
    pub fn with_buf(mut self, buf: IoBuf) -> Self {
        self.buf = buf;
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    /// Attach the caller completion
    #[must_use]
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(IoResult, Duration) + Send + 'static,
    {
        self.completion = Some(Completion::Callback(Box::new(f)));
        self
    }

    pub(crate) fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Run `f` with the result just before the request's own completion
    pub(crate) fn observe<F>(&mut self, f: F)
    where
        F: FnOnce(IoResult) + Send + 'static,
    {
        let inner = self.completion.take();
        self.completion = Some(Completion::Callback(Box::new(move |res, elapsed| {
            f(res);
            match inner {
                Some(Completion::Callback(g)) => g(res, elapsed),
                Some(Completion::Part(group)) => {
                    group.complete_part(res, Instant::now());
                }
                None => {}
            }
        })));
    }

    /// End offset (exclusive)
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Whether this request is a fragment of a split group
    #[must_use]
    pub const fn is_part(&self) -> bool {
        self.split_flags.contains(SplitFlags::IS_PART)
    }

    /// The group this fragment belongs to
    #[must_use]
    pub fn group(&self) -> Option<&Arc<SplitGroup>> {
        match &self.completion {
            Some(Completion::Part(group)) => Some(group),
            _ => None,
        }
    }

    /// Device byte range this request touches
    #[must_use]
    pub const fn span(&self) -> (u64, u64) {
        match &self.discard {
            Some(extent) => extent.span(self.offset),
            None => (self.offset, self.offset + self.size),
        }
    }

    /// Time since the request was created
    #[must_use]
    pub fn age(&self) -> Duration {
        self.submitted.elapsed()
    }

    /// Complete the request, measuring latency from submission
    pub fn complete(mut self, result: IoResult) {
        let elapsed = self.submitted.elapsed();
        self.finish(result, elapsed);
    }

    /// Complete the request with an explicit latency
    pub(crate) fn complete_with(mut self, result: IoResult, elapsed: Duration) {
        self.finish(result, elapsed);
    }

    fn finish(&mut self, result: IoResult, elapsed: Duration) {
        match self.completion.take() {
            Some(Completion::Callback(f)) => f(result, elapsed),
            Some(Completion::Part(group)) => {
                group.complete_part(result, Instant::now());
            }
            None => {}
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.completion.is_some() {
            warn!(
                "request {} at {} (+{}) dropped without completion",
                self.direction, self.offset, self.size
            );
            self.finish(Err(IoError::Aborted), self.submitted.elapsed());
        }
    }
}

/// Control operations served alongside block I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Nop,
    GetParam(u32),
    SetParam(u32, u64),
    Flush,
}

/// A queued control ("user") command
pub struct ControlCommand {
    pub op: ControlOp,
    completion: Option<ControlCompletionFn>,
}

impl std::fmt::Debug for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlCommand")
            .field("op", &self.op)
            .finish_non_exhaustive()
    }
}

impl ControlCommand {
    #[must_use]
    pub fn new<F>(op: ControlOp, f: F) -> Self
    where
        F: FnOnce(Result<u64, IoError>) + Send + 'static,
    {
        Self {
            op,
            completion: Some(Box::new(f)),
        }
    }

    pub fn complete(mut self, result: Result<u64, IoError>) {
        if let Some(f) = self.completion.take() {
            f(result);
        }
    }
}

impl Drop for ControlCommand {
    fn drop(&mut self) {
        if let Some(f) = self.completion.take() {
            warn!("control command {:?} dropped without completion", self.op);
            f(Err(IoError::Aborted));
        }
    }
}

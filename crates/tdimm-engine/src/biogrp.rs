//! Request splitting and fragment reassembly
//!
//! A request that cannot be served by a single command is broken into
//! fragments joined by a [`SplitGroup`]. Each fragment completes into the
//! group; the completion that brings `finished` up to `total` is the only one
//! allowed to touch the original request, and it does so after the atomic
//! increment without holding any lock across it.
//!
//! `total` starts at one and is raised before every fragment except the last
//! is handed off, so a fragment completing synchronously inside the callback
//! can never observe `finished == total` while more fragments are still to
//! come.

use crate::request::{Completion, DiscardExtent, IoBuf, Request, SplitFlags};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::Instant;
use tdimm_common::{Direction, Error, IoError, IoResult, MAX_SPLIT_FRAGMENTS};
use tracing::trace;

/// Aggregation record joining fragment completions into one completion
pub struct SplitGroup {
    original: Mutex<Option<Request>>,
    total: AtomicU32,
    finished: AtomicU32,
    result: AtomicU8,
    created: Instant,
}

impl std::fmt::Debug for SplitGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitGroup")
            .field("total", &self.total())
            .field("finished", &self.finished())
            .field("result", &self.result.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SplitGroup {
    fn new(original: Request, total: u32) -> Arc<Self> {
        Arc::new(Self {
            original: Mutex::new(Some(original)),
            total: AtomicU32::new(total),
            finished: AtomicU32::new(0),
            result: AtomicU8::new(0),
            created: Instant::now(),
        })
    }

    /// Fragments the group waits for
    pub fn total(&self) -> u32 {
        self.total.load(Ordering::Acquire)
    }

    /// Fragments completed so far
    pub fn finished(&self) -> u32 {
        self.finished.load(Ordering::Acquire)
    }

    /// Sticky aggregate result
    pub fn result(&self) -> IoResult {
        IoError::to_result(self.result.load(Ordering::Acquire))
    }

    /// Join one fragment's completion into the group
    ///
    /// Returns true when this call completed the original request.
    pub fn complete_part(&self, result: IoResult, now: Instant) -> bool {
        if let Err(err) = result {
            // First failure wins.
            let _ = self
                .result
                .compare_exchange(0, err.code(), Ordering::AcqRel, Ordering::Acquire);
        }

        let finished = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        let total = self.total.load(Ordering::Acquire);
        debug_assert!(finished <= total, "split group over-completed");
        if finished < total {
            return false;
        }

        let original = self.original.lock().take();
        match original {
            Some(request) => {
                let result = self.result();
                trace!(
                    "split group for {} at {} done: {} fragments, {:?}",
                    request.direction, request.offset, total, result
                );
                request.complete_with(result, now.saturating_duration_since(self.created));
                true
            }
            None => false,
        }
    }

    fn open_window(&self) {
        self.total.fetch_add(1, Ordering::AcqRel);
    }
}

/// A request handed back because it could not be split
#[derive(Debug)]
pub struct Rejected {
    pub request: Request,
    pub error: Error,
}

impl Rejected {
    /// Fail the rejected request to its submitter
    pub fn fail(self) {
        let err = self.error.io_error();
        self.request.complete(Err(err));
    }
}

/// Byte ranges produced by cutting `[offset, offset + size)` at every
/// multiple of `fragment_size`
pub fn fragment_spans(offset: u64, size: u64, fragment_size: u64) -> impl Iterator<Item = (u64, u64)> {
    let end = offset + size;
    let mut pos = offset;
    std::iter::from_fn(move || {
        if pos >= end || fragment_size == 0 {
            return None;
        }
        let boundary = (pos / fragment_size + 1) * fragment_size;
        let next = boundary.min(end);
        let span = (pos, next - pos);
        pos = next;
        Some(span)
    })
}

/// Number of fragments `split` would produce
#[must_use]
pub fn fragment_count(offset: u64, size: u64, fragment_size: u64) -> usize {
    if size == 0 || fragment_size == 0 {
        return 0;
    }
    let first = offset / fragment_size;
    let last = (offset + size - 1) / fragment_size;
    usize::try_from(last - first + 1).unwrap_or(usize::MAX)
}

struct Template {
    direction: Direction,
    offset: u64,
    flags: crate::request::RequestFlags,
    buf: IoBuf,
    tag: u64,
}

impl Template {
    fn of(request: &Request) -> Self {
        Self {
            direction: request.direction,
            offset: request.offset,
            flags: request.flags,
            buf: request.buf.clone(),
            tag: request.tag,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn fragment(&self, group: &Arc<SplitGroup>, offset: u64, size: u64, extra: SplitFlags) -> Request {
        let buf = if self.direction == Direction::Discard {
            IoBuf::default()
        } else {
            self.buf.window((offset - self.offset) as usize, size as usize)
        };
        let mut fragment = Request::new(self.direction, offset, size)
            .with_buf(buf)
            .with_flags(self.flags)
            .with_tag(self.tag)
            .with_completion(Completion::Part(Arc::clone(group)));
        fragment.split_flags.insert(SplitFlags::IS_PART | extra);
        fragment
    }
}

fn check_count(request: Request, count: usize) -> Result<Request, Rejected> {
    if count == 0 {
        return Err(Rejected {
            request,
            error: Error::invalid_request("empty request cannot be split"),
        });
    }
    if count > MAX_SPLIT_FRAGMENTS {
        return Err(Rejected {
            request,
            error: Error::TooManyFragments {
                count,
                max: MAX_SPLIT_FRAGMENTS,
            },
        });
    }
    Ok(request)
}

/// Split a request at `fragment_size` boundaries
///
/// The callback receives every fragment synchronously, in ascending offset
/// order. Returns the number of fragments created.
pub fn split<F>(request: Request, fragment_size: u64, mut callback: F) -> Result<usize, Rejected>
where
    F: FnMut(&Arc<SplitGroup>, Request),
{
    let count = fragment_count(request.offset, request.size, fragment_size);
    let request = check_count(request, count)?;
    let template = Template::of(&request);
    let spans: Vec<(u64, u64)> = fragment_spans(request.offset, request.size, fragment_size).collect();

    let group = SplitGroup::new(request, 1);
    for (i, (offset, size)) in spans.into_iter().enumerate() {
        let fragment = template.fragment(&group, offset, size, SplitFlags::empty());
        if i + 1 < count {
            group.open_window();
        }
        callback(&group, fragment);
    }
    Ok(count)
}

/// Produce `n` fragments that each carry the whole request
///
/// Used for mirrored writes; `total` is set to `n` up front.
pub fn replicate<F>(request: Request, n: usize, mut callback: F) -> Result<usize, Rejected>
where
    F: FnMut(&Arc<SplitGroup>, Request),
{
    let request = check_count(request, n)?;
    let template = Template::of(&request);
    let (offset, size) = (request.offset, request.size);

    #[allow(clippy::cast_possible_truncation)]
    let group = SplitGroup::new(request, n as u32);
    for _ in 0..n {
        callback(&group, template.fragment(&group, offset, size, SplitFlags::REPLICA));
    }
    Ok(n)
}

/// Hardware layout discards are split against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardGeometry {
    pub sector_size: u64,
    pub stripe_bytes: u64,
    pub backends: u64,
    /// Stripes one trim command may cover on a single backend
    pub max_stripes: u64,
}

/// One piece of a split discard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardPiece {
    pub offset: u64,
    pub size: u64,
    pub extent: Option<DiscardExtent>,
}

/// Number of fragments `split_discard` produces for a request
///
/// Pure function of the request and the discard geometry: one fragment for a
/// request inside a single stripe, otherwise one fragment each for the
/// unaligned front and back pieces plus, for the aligned middle, one per
/// backend that receives stripes (further divided when a backend's share
/// exceeds `max_stripes`).
#[must_use]
pub fn discard_fragment_count(offset: u64, size: u64, geo: &DiscardGeometry) -> usize {
    let Some((start, end)) = sector_bounds(offset, size, geo.sector_size) else {
        return 0;
    };
    let stripe = geo.stripe_bytes;
    if start / stripe == (end - 1) / stripe {
        return 1;
    }

    let front = usize::from(start % stripe != 0);
    let back = usize::from(end % stripe != 0);
    let first = start.div_ceil(stripe);
    let last = end / stripe;
    let middle = last.saturating_sub(first);

    let mut pieces = 0u64;
    for j in 0..geo.backends.min(middle) {
        let share = backend_share(middle, geo.backends, j);
        pieces += share.div_ceil(geo.max_stripes.max(1));
    }
    front + back + usize::try_from(pieces).unwrap_or(usize::MAX)
}

fn backend_share(middle: u64, backends: u64, j: u64) -> u64 {
    middle / backends + u64::from(j < middle % backends)
}

fn sector_bounds(offset: u64, size: u64, sector: u64) -> Option<(u64, u64)> {
    let sector = sector.max(1);
    let start = offset.div_ceil(sector) * sector;
    let end = (offset + size) / sector * sector;
    (start < end).then_some((start, end))
}

/// Lay out the pieces of a discard in ascending offset order
#[must_use]
pub fn plan_discard(offset: u64, size: u64, geo: &DiscardGeometry) -> Vec<DiscardPiece> {
    let Some((start, end)) = sector_bounds(offset, size, geo.sector_size) else {
        return Vec::new();
    };
    let stripe = geo.stripe_bytes;
    if start / stripe == (end - 1) / stripe {
        return vec![DiscardPiece {
            offset: start,
            size: end - start,
            extent: None,
        }];
    }

    let mut pieces = Vec::new();
    let first = start.div_ceil(stripe);
    let last = end / stripe;
    if start % stripe != 0 {
        pieces.push(DiscardPiece {
            offset: start,
            size: first * stripe - start,
            extent: None,
        });
    }

    let middle = last.saturating_sub(first);
    let backends = geo.backends.max(1);
    let max_stripes = geo.max_stripes.max(1);
    let mut strided = Vec::new();
    for j in 0..backends.min(middle) {
        let share = backend_share(middle, backends, j);
        let mut done = 0;
        while done < share {
            let count = (share - done).min(max_stripes);
            let first_stripe = first + j + done * backends;
            let backend = u32::try_from(first_stripe % backends).unwrap_or(u32::MAX);
            strided.push(DiscardPiece {
                offset: first_stripe * stripe,
                size: count * stripe,
                extent: Some(DiscardExtent {
                    backend,
                    stripe_bytes: stripe,
                    stride_bytes: stripe * backends,
                    stripes: count,
                }),
            });
            done += count;
        }
    }
    strided.sort_by_key(|p| p.offset);
    pieces.extend(strided);

    if end % stripe != 0 {
        pieces.push(DiscardPiece {
            offset: last * stripe,
            size: end - last * stripe,
            extent: None,
        });
    }
    pieces
}

/// Split a discard along stripe and backend boundaries
pub fn split_discard<F>(request: Request, geo: &DiscardGeometry, mut callback: F) -> Result<usize, Rejected>
where
    F: FnMut(&Arc<SplitGroup>, Request),
{
    if request.direction != Direction::Discard {
        return Err(Rejected {
            request,
            error: Error::invalid_request("split_discard on a non-discard request"),
        });
    }
    let pieces = plan_discard(request.offset, request.size, geo);
    let count = pieces.len();
    let request = check_count(request, count)?;
    let template = Template::of(&request);

    let group = SplitGroup::new(request, 1);
    for (i, piece) in pieces.into_iter().enumerate() {
        let mut fragment = template.fragment(&group, piece.offset, piece.size, SplitFlags::DISCARD_PIECE);
        fragment.discard = piece.extent;
        if i + 1 < count {
            group.open_window();
        }
        callback(&group, fragment);
    }
    Ok(count)
}

//! Command tokens
//!
//! A token is one in-flight hardware command slot. Tokens live in a fixed
//! arena and are threaded onto exactly one list at a time by index links, so
//! moving a token between lists is O(1) and removal during a scan only needs
//! the scan to work from a snapshot of ids.

use crate::hal::CommandWord;
use crate::pool::BufferId;
use crate::request::{ControlCommand, ControlOp, DiscardExtent, Request};
use std::time::Instant;
use tdimm_common::{Error, IoResult, Result};

/// Index of a token in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(pub u16);

impl TokenId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Workload class a token serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    /// Block I/O
    Block,
    /// Control commands
    Control,
    /// Deallocations and sequence advances issued by the engine itself
    Maintenance,
}

/// Command a token carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
    Trim,
    /// Release a device read buffer
    Dealloc,
    Control(ControlOp),
    /// Synthetic command that consumes a sequence number without payload
    SeqAdvance,
}

impl Op {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Trim => "trim",
            Self::Dealloc => "dealloc",
            Self::Control(_) => "control",
            Self::SeqAdvance => "seq-advance",
        }
    }

    /// Whether the command modifies media
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::Trim)
    }
}

/// Lists a token can be on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenList {
    Free,
    /// Allocated, being prepared for dispatch
    Staged,
    /// Dispatched, in dispatch order
    Active,
    TimedOut,
    /// Finished on the device, waiting for deferred status
    Resumable,
    /// Waiting to be retried
    Repeat,
    /// Finished, waiting for its completion to be delivered
    Completed,
}

const LISTS: usize = 7;

impl TokenList {
    const fn slot(self) -> usize {
        match self {
            Self::Free => 0,
            Self::Staged => 1,
            Self::Active => 2,
            Self::TimedOut => 3,
            Self::Resumable => 4,
            Self::Repeat => 5,
            Self::Completed => 6,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Staged => "staged",
            Self::Active => "active",
            Self::TimedOut => "timedout",
            Self::Resumable => "resumable",
            Self::Repeat => "repeat",
            Self::Completed => "completed",
        }
    }
}

/// Outcome of one copy in a dual/triple write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecOutcome {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

/// Phase of a read-modify-write token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmwPhase {
    /// Reading the full page
    Read,
    /// Writing the merged page back
    Write,
}

/// One hardware command slot
#[derive(Debug)]
pub struct Token {
    pub id: TokenId,
    pub ty: TokenType,
    pub op: Op,
    list: TokenList,
    pub result: IoResult,
    pub retries: u32,
    pub resets: u32,
    pub timeouts: u32,

    pub core_buf: Option<BufferId>,
    pub wr_buf: Option<BufferId>,
    pub rd_buf: Option<BufferId>,
    /// Read buffer released by piggy-backing on this command
    pub dealloc_buf: Option<BufferId>,

    pub request: Option<Request>,
    pub control: Option<ControlCommand>,
    /// Value returned by a control command
    pub control_value: u64,

    /// Sequence number, assigned on first dispatch
    pub seq: Option<u64>,
    /// First sector addressed
    pub lba: u64,
    /// Sectors transferred
    pub sectors: u32,
    /// Device byte range used for collision checks
    pub span: (u64, u64),
    pub discard: Option<DiscardExtent>,
    pub cmd: Option<CommandWord>,
    pub started: Option<Instant>,

    pub rmw: Option<RmwPhase>,
    /// Write-polarity bit, toggled on every dispatch
    pub odd: bool,
    pub independent_dealloc: bool,
    pub early_commit: bool,
    /// Completed on the device, extended status still outstanding
    pub ext_deferred: bool,

    /// Other copy of a dual/triple write
    pub buddy: Option<TokenId>,
    pub sec: SecOutcome,

    /// Full-page staging area for RMW and partial reads
    pub scratch: Vec<u8>,

    prev: Option<TokenId>,
    next: Option<TokenId>,
}

impl Token {
    fn new(id: TokenId) -> Self {
        Self {
            id,
            ty: TokenType::Block,
            op: Op::Read,
            list: TokenList::Free,
            result: Ok(()),
            retries: 0,
            resets: 0,
            timeouts: 0,
            core_buf: None,
            wr_buf: None,
            rd_buf: None,
            dealloc_buf: None,
            request: None,
            control: None,
            control_value: 0,
            seq: None,
            lba: 0,
            sectors: 0,
            span: (0, 0),
            discard: None,
            cmd: None,
            started: None,
            rmw: None,
            odd: false,
            independent_dealloc: false,
            early_commit: false,
            ext_deferred: false,
            buddy: None,
            sec: SecOutcome::Pending,
            scratch: Vec::new(),
            prev: None,
            next: None,
        }
    }

    /// List the token is currently on
    #[must_use]
    pub const fn list(&self) -> TokenList {
        self.list
    }

    /// Whether the token holds any buffer
    #[must_use]
    pub const fn holds_buffers(&self) -> bool {
        self.core_buf.is_some() || self.wr_buf.is_some() || self.rd_buf.is_some()
    }

    /// Whether `[start, end)` overlaps the token's span
    #[must_use]
    pub const fn overlaps(&self, start: u64, end: u64) -> bool {
        self.span.0 < end && start < self.span.1
    }

    fn clear(&mut self) {
        let id = self.id;
        let (prev, next, list) = (self.prev, self.next, self.list);
        *self = Self::new(id);
        self.prev = prev;
        self.next = next;
        self.list = list;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ListHead {
    head: Option<TokenId>,
    tail: Option<TokenId>,
    len: usize,
}

/// Fixed arena of tokens threaded onto per-state lists
#[derive(Debug)]
pub struct TokenPool {
    tokens: Vec<Token>,
    lists: [ListHead; LISTS],
}

impl TokenPool {
    /// Create a pool of `count` free tokens
    pub fn new(count: usize) -> Result<Self> {
        if count == 0 || count > usize::from(u16::MAX) {
            return Err(Error::configuration(format!("token count {count} out of range")));
        }
        let mut pool = Self {
            tokens: Vec::with_capacity(count),
            lists: [ListHead::default(); LISTS],
        };
        for i in 0..count {
            let id = TokenId(u16::try_from(i).map_err(|_| Error::internal("token id overflow"))?);
            pool.tokens.push(Token::new(id));
            pool.link_back(id, TokenList::Free);
        }
        Ok(pool)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub const fn len(&self, list: TokenList) -> usize {
        self.lists[list.slot()].len
    }

    /// Tokens not on the free list
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.capacity() - self.len(TokenList::Free)
    }

    /// Take a token off the free list; it lands on the staged list
    pub fn allocate(&mut self, ty: TokenType) -> Option<TokenId> {
        let id = self.lists[TokenList::Free.slot()].head?;
        self.move_to(id, TokenList::Staged);
        let token = &mut self.tokens[id.index()];
        token.clear();
        token.ty = ty;
        Some(id)
    }

    /// Return a token to the free list
    ///
    /// The caller must have released its buffers and delivered its
    /// completion.
    pub fn free(&mut self, id: TokenId) {
        debug_assert!(self.tokens[id.index()].list != TokenList::Free, "{id} double free");
        debug_assert!(!self.tokens[id.index()].holds_buffers(), "{id} freed holding buffers");
        self.tokens[id.index()].clear();
        self.move_to(id, TokenList::Free);
    }

    /// Move a token to the tail of `list`
    pub fn move_to(&mut self, id: TokenId, list: TokenList) {
        self.unlink(id);
        self.link_back(id, list);
    }

    /// Move a token to the head of `list`
    pub fn push_front(&mut self, id: TokenId, list: TokenList) {
        self.unlink(id);
        let head = &mut self.lists[list.slot()];
        let old = head.head;
        head.head = Some(id);
        if head.tail.is_none() {
            head.tail = Some(id);
        }
        head.len += 1;
        if let Some(old) = old {
            self.tokens[old.index()].prev = Some(id);
        }
        let token = &mut self.tokens[id.index()];
        token.prev = None;
        token.next = old;
        token.list = list;
    }

    #[must_use]
    pub fn get(&self, id: TokenId) -> &Token {
        &self.tokens[id.index()]
    }

    pub fn get_mut(&mut self, id: TokenId) -> &mut Token {
        &mut self.tokens[id.index()]
    }

    /// First token on `list`
    #[must_use]
    pub const fn head(&self, list: TokenList) -> Option<TokenId> {
        self.lists[list.slot()].head
    }

    /// Ids on `list` in order, safe to mutate the pool while iterating
    #[must_use]
    pub fn snapshot(&self, list: TokenList) -> Vec<TokenId> {
        let mut out = Vec::with_capacity(self.len(list));
        let mut cur = self.head(list);
        while let Some(id) = cur {
            out.push(id);
            cur = self.tokens[id.index()].next;
        }
        out
    }

    /// Iterate over the tokens on `list`
    pub fn iter(&self, list: TokenList) -> impl Iterator<Item = &Token> + '_ {
        let mut cur = self.head(list);
        std::iter::from_fn(move || {
            let id = cur?;
            let token = &self.tokens[id.index()];
            cur = token.next;
            Some(token)
        })
    }

    /// Whether any allocated token satisfies `pred`
    pub fn any_live<F>(&self, pred: F) -> bool
    where
        F: Fn(&Token) -> bool,
    {
        self.tokens
            .iter()
            .any(|t| t.list != TokenList::Free && pred(t))
    }

    /// Allocated tokens satisfying `pred`
    pub fn count_live<F>(&self, pred: F) -> usize
    where
        F: Fn(&Token) -> bool,
    {
        self.tokens
            .iter()
            .filter(|t| t.list != TokenList::Free && pred(t))
            .count()
    }

    /// Verify list membership bookkeeping
    pub fn check_invariants(&self) -> Result<()> {
        let mut seen = vec![false; self.tokens.len()];
        for list in [
            TokenList::Free,
            TokenList::Staged,
            TokenList::Active,
            TokenList::TimedOut,
            TokenList::Resumable,
            TokenList::Repeat,
            TokenList::Completed,
        ] {
            let ids = self.snapshot(list);
            if ids.len() != self.len(list) {
                return Err(Error::internal(format!(
                    "{} list length {} but {} linked",
                    list.as_str(),
                    self.len(list),
                    ids.len()
                )));
            }
            for id in ids {
                if std::mem::replace(&mut seen[id.index()], true) {
                    return Err(Error::internal(format!("{id} on more than one list")));
                }
                if self.tokens[id.index()].list != list {
                    return Err(Error::internal(format!("{id} tagged with wrong list")));
                }
            }
        }
        if let Some(i) = seen.iter().position(|s| !s) {
            return Err(Error::internal(format!("token {i} on no list")));
        }
        Ok(())
    }

    fn link_back(&mut self, id: TokenId, list: TokenList) {
        let head = &mut self.lists[list.slot()];
        let old_tail = head.tail;
        head.tail = Some(id);
        if head.head.is_none() {
            head.head = Some(id);
        }
        head.len += 1;
        if let Some(tail) = old_tail {
            self.tokens[tail.index()].next = Some(id);
        }
        let token = &mut self.tokens[id.index()];
        token.prev = old_tail;
        token.next = None;
        token.list = list;
    }

    fn unlink(&mut self, id: TokenId) {
        let (prev, next, list) = {
            let t = &self.tokens[id.index()];
            (t.prev, t.next, t.list)
        };
        let head = &mut self.lists[list.slot()];
        if head.head == Some(id) {
            head.head = next;
        }
        if head.tail == Some(id) {
            head.tail = prev;
        }
        head.len -= 1;
        if let Some(p) = prev {
            self.tokens[p.index()].next = next;
        }
        if let Some(n) = next {
            self.tokens[n.index()].prev = prev;
        }
        let token = &mut self.tokens[id.index()];
        token.prev = None;
        token.next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashSet;

    #[test]
    fn test_allocate_until_exhausted() {
        let mut pool = TokenPool::new(4).unwrap();
        let ids: Vec<_> = (0..4).map(|_| pool.allocate(TokenType::Block).unwrap()).collect();
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 4);
        assert!(pool.allocate(TokenType::Block).is_none());
        assert_eq!(pool.len(TokenList::Staged), 4);

        pool.free(ids[2]);
        assert_eq!(pool.allocate(TokenType::Control), Some(ids[2]));
        assert_eq!(pool.get(ids[2]).ty, TokenType::Control);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_active_list_keeps_dispatch_order() {
        let mut pool = TokenPool::new(8).unwrap();
        let ids: Vec<_> = (0..5).map(|_| pool.allocate(TokenType::Block).unwrap()).collect();
        for &id in ids.iter().rev() {
            pool.move_to(id, TokenList::Active);
        }
        let expected: Vec<_> = ids.iter().rev().copied().collect();
        assert_eq!(pool.snapshot(TokenList::Active), expected);

        // Remove from the middle while walking a snapshot.
        for id in pool.snapshot(TokenList::Active) {
            if id.0 % 2 == 0 {
                pool.move_to(id, TokenList::Completed);
            }
        }
        assert!(pool.iter(TokenList::Active).all(|t| t.id.0 % 2 == 1));
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_push_front() {
        let mut pool = TokenPool::new(3).unwrap();
        let a = pool.allocate(TokenType::Block).unwrap();
        let b = pool.allocate(TokenType::Block).unwrap();
        pool.move_to(a, TokenList::Repeat);
        pool.push_front(b, TokenList::Repeat);
        assert_eq!(pool.snapshot(TokenList::Repeat), vec![b, a]);
        assert_eq!(pool.head(TokenList::Repeat), Some(b));
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_random_moves_preserve_membership() {
        let lists = [
            TokenList::Staged,
            TokenList::Active,
            TokenList::TimedOut,
            TokenList::Resumable,
            TokenList::Repeat,
            TokenList::Completed,
        ];
        let mut rng = rand::thread_rng();
        let mut pool = TokenPool::new(32).unwrap();
        let mut live = Vec::new();
        for _ in 0..5000 {
            match rng.gen_range(0..4) {
                0 => {
                    if let Some(id) = pool.allocate(TokenType::Block) {
                        live.push(id);
                    }
                }
                1 if !live.is_empty() => {
                    let id = live.swap_remove(rng.gen_range(0..live.len()));
                    pool.free(id);
                }
                2 if !live.is_empty() => {
                    let id = live[rng.gen_range(0..live.len())];
                    pool.push_front(id, lists[rng.gen_range(0..lists.len())]);
                }
                _ if !live.is_empty() => {
                    let id = live[rng.gen_range(0..live.len())];
                    pool.move_to(id, lists[rng.gen_range(0..lists.len())]);
                }
                _ => {}
            }
        }
        pool.check_invariants().unwrap();
        assert_eq!(pool.in_use(), live.len());
    }

    #[test]
    fn test_overlap() {
        let mut pool = TokenPool::new(1).unwrap();
        let id = pool.allocate(TokenType::Block).unwrap();
        pool.get_mut(id).span = (4096, 8192);
        let t = pool.get(id);
        assert!(t.overlaps(0, 4097));
        assert!(t.overlaps(8191, 9000));
        assert!(!t.overlaps(8192, 9000));
        assert!(!t.overlaps(0, 4096));
    }

    #[test]
    fn test_rejects_bad_size() {
        assert!(TokenPool::new(0).is_err());
        assert!(TokenPool::new(70_000).is_err());
    }
}

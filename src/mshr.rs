use crate::address;
use std::collections::VecDeque;

/// Miss status handling entry.
///
/// Holds the number of requests using the bucket and the requests waiting
/// to be woken up once the current occupant retires.
#[derive(Debug)]
pub struct Entry<W> {
    in_use: usize,
    waiting: VecDeque<W>,
    #[cfg(debug_assertions)]
    pending: VecDeque<W>,
    #[cfg(debug_assertions)]
    blocker: Option<W>,
}

impl<W> Default for Entry<W> {
    fn default() -> Self {
        Self {
            in_use: 0,
            waiting: VecDeque::new(),
            #[cfg(debug_assertions)]
            pending: VecDeque::new(),
            #[cfg(debug_assertions)]
            blocker: None,
        }
    }
}

impl<W> Entry<W> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.in_use
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }
}

/// Miss queue serializing requests to the same line.
///
/// Addresses are hashed into `next_power_of_two(size) * 4` buckets.
/// Unrelated lines that collide are serialized as well.
#[derive(Debug)]
pub struct MissQueue<W> {
    name: String,
    log2_line_size: u32,
    num_entries: i64,
    max_sub_entries: usize,
    free_entries: i64,
    mask: u64,
    entries: Box<[Entry<W>]>,
}

impl<W> MissQueue<W>
where
    W: Clone + PartialEq + std::fmt::Debug,
{
    #[must_use]
    pub fn new(name: impl Into<String>, size: usize, line_size: usize, max_sub_entries: usize) -> Self {
        assert!(size > 0 && size < 1024 * 32 * 32, "invalid miss queue size {size}");
        assert!(line_size.is_power_of_two());
        let num_buckets = size.next_power_of_two() * 4;
        let entries = (0..num_buckets).map(|_| Entry::default()).collect();
        Self {
            name: name.into(),
            log2_line_size: line_size.ilog2(),
            num_entries: size as i64,
            max_sub_entries,
            free_entries: size as i64,
            mask: num_buckets as u64 - 1,
            entries,
        }
    }

    #[inline]
    fn bucket(&self, addr: address) -> usize {
        let line = addr >> self.log2_line_size;
        ((line ^ (line >> 11)) & self.mask) as usize
    }

    #[must_use]
    pub fn entry(&self, addr: address) -> &Entry<W> {
        &self.entries[self.bucket(addr)]
    }

    /// Whether a request may queue behind the current occupant.
    #[must_use]
    pub fn can_accept(&self, addr: address) -> bool {
        if self.free_entries <= 0 {
            return false;
        }
        self.entry(addr).in_use < self.max_sub_entries
    }

    /// Whether nothing occupies the bucket of `addr`.
    #[must_use]
    pub fn can_issue(&self, addr: address) -> bool {
        let entry = self.entry(addr);
        debug_assert!(entry.in_use > 0 || entry.waiting.is_empty());
        entry.in_use == 0
    }

    #[must_use]
    pub fn free_entries(&self) -> i64 {
        self.free_entries
    }

    #[must_use]
    pub fn has_free_entries(&self) -> bool {
        self.free_entries > 0
    }

    /// Claims the bucket for a fresh request.
    pub fn block_entry(&mut self, addr: address, req: W) {
        debug_assert!(self.free_entries <= self.num_entries);
        self.free_entries -= 1;
        debug_assert!(self.free_entries >= 0, "{}: negative free entries", self.name);

        let pos = self.bucket(addr);
        let entry = &mut self.entries[pos];
        assert_eq!(entry.in_use, 0, "{}: blocking busy entry for {:#x}", self.name, addr);
        entry.in_use += 1;

        #[cfg(debug_assertions)]
        {
            debug_assert!(entry.pending.is_empty());
            entry.pending.push_back(req.clone());
            entry.blocker = Some(req);
        }
        #[cfg(not(debug_assertions))]
        let _ = req;
    }

    /// Queues `req` behind the occupant of the bucket.
    ///
    /// Returns `false` when the bucket or the queue is full.
    pub fn add_entry(&mut self, addr: address, req: W) -> bool {
        if !self.can_accept(addr) {
            log::trace!("{}: cannot accept {:?} for {:#x}", self.name, req, addr);
            return false;
        }
        debug_assert!(self.free_entries <= self.num_entries);
        self.free_entries -= 1;
        debug_assert!(self.free_entries >= 0, "{}: negative free entries", self.name);

        let pos = self.bucket(addr);
        let entry = &mut self.entries[pos];
        debug_assert!(entry.in_use > 0, "queueing behind an idle entry");
        entry.in_use += 1;
        entry.waiting.push_back(req.clone());

        #[cfg(debug_assertions)]
        {
            debug_assert!(!entry.pending.is_empty());
            entry.pending.push_back(req);
        }
        true
    }

    /// Releases the bucket held by `req`.
    ///
    /// Returns the next waiting request, which must be woken up by the caller.
    pub fn retire(&mut self, addr: address, req: &W) -> Option<W> {
        let pos = self.bucket(addr);
        let entry = &mut self.entries[pos];
        assert!(entry.in_use > 0, "{}: retiring idle entry for {:#x}", self.name, addr);

        #[cfg(debug_assertions)]
        {
            let front = entry.pending.pop_front();
            debug_assert_eq!(
                front.as_ref(),
                Some(req),
                "{}: requests must retire in arrival order",
                self.name
            );
            if let Some(blocker) = entry.blocker.take() {
                debug_assert_eq!(&blocker, req);
            }
        }
        #[cfg(not(debug_assertions))]
        let _ = req;

        self.free_entries += 1;
        debug_assert!(self.free_entries <= self.num_entries);
        entry.in_use -= 1;

        let next = entry.waiting.pop_front();
        debug_assert!(entry.in_use > 0 || next.is_none());
        next
    }
}

impl<W> std::fmt::Display for MissQueue<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MissQueue[{}]", self.name)?;
        for (pos, entry) in self.entries.iter().enumerate() {
            if entry.in_use > 0 {
                write!(f, " [{pos}].in_use={}", entry.in_use)?;
            }
        }
        Ok(())
    }
}

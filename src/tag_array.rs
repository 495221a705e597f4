use crate::address;

/// State kept per cache line.
pub trait Block: Default + std::fmt::Debug {
    /// Whether the line holds a tag.
    fn is_allocated(&self) -> bool;

    /// Whether replacing the line needs to notify anyone.
    fn is_valid(&self) -> bool;
}

/// Set associative line store with LRU replacement.
#[derive(Debug)]
pub struct TagArray<B> {
    lines: Vec<B>,
    tags: Vec<address>,
    last_access: Vec<u64>,
    num_sets: usize,
    assoc: usize,
    line_size_log2: u32,
    num_access: u64,
}

impl<B> TagArray<B>
where
    B: Block,
{
    #[must_use]
    pub fn new(size: usize, assoc: usize, line_size: usize) -> Self {
        assert!(line_size.is_power_of_two(), "line size must be a power of two");
        assert!(assoc > 0 && size >= assoc * line_size);
        let num_lines = size / line_size;
        let num_sets = num_lines / assoc;
        Self {
            lines: (0..num_lines).map(|_| B::default()).collect(),
            tags: vec![0; num_lines],
            last_access: vec![0; num_lines],
            num_sets,
            assoc,
            line_size_log2: line_size.ilog2(),
            num_access: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn block_addr(&self, addr: address) -> address {
        addr & !((1 << self.line_size_log2) - 1)
    }

    #[inline]
    #[must_use]
    pub fn set_index(&self, addr: address) -> usize {
        ((addr >> self.line_size_log2) % self.num_sets as u64) as usize
    }

    fn ways(&self, addr: address) -> std::ops::Range<usize> {
        let set = self.set_index(addr);
        set * self.assoc..(set + 1) * self.assoc
    }

    /// Finds the line holding `addr` without touching replacement state.
    #[must_use]
    pub fn probe(&self, addr: address) -> Option<usize> {
        let tag = self.block_addr(addr);
        self.ways(addr)
            .find(|&idx| self.tags[idx] == tag && self.lines[idx].is_allocated())
    }

    /// Finds the line holding `addr`, marking it most recently used if `touch` is set.
    pub fn lookup(&mut self, addr: address, touch: bool) -> Option<usize> {
        let idx = self.probe(addr)?;
        if touch {
            self.num_access += 1;
            self.last_access[idx] = self.num_access;
        }
        log::trace!(
            "tag_array::lookup({:#x}) => set={} way={}",
            addr,
            self.set_index(addr),
            idx % self.assoc
        );
        Some(idx)
    }

    /// Picks the line for `addr`.
    ///
    /// Free or invalid ways are used first, then the least recently used.
    /// Returns the line index and the address previously held by the way.
    /// The line keeps its old state until the caller resets it.
    pub fn fill_or_replace(&mut self, addr: address) -> (usize, Option<address>) {
        debug_assert!(self.probe(addr).is_none(), "{addr:#x} is already resident");
        let ways = self.ways(addr);
        let idx = ways
            .clone()
            .find(|&idx| !self.lines[idx].is_allocated() || !self.lines[idx].is_valid())
            .or_else(|| ways.min_by_key(|&idx| self.last_access[idx]))
            .unwrap_or_else(|| unreachable!("sets have at least one way"));

        let evicted = self.lines[idx].is_allocated().then_some(self.tags[idx]);
        log::trace!(
            "tag_array::fill({:#x}) => way={} evicted={:?}",
            addr,
            idx % self.assoc,
            evicted.map(|evicted| format!("{evicted:#x}"))
        );

        self.num_access += 1;
        self.tags[idx] = self.block_addr(addr);
        self.last_access[idx] = self.num_access;
        (idx, evicted)
    }

    #[must_use]
    pub fn line(&self, idx: usize) -> &B {
        &self.lines[idx]
    }

    pub fn line_mut(&mut self, idx: usize) -> &mut B {
        &mut self.lines[idx]
    }

    /// Address held by the line at `idx`.
    #[must_use]
    pub fn tag(&self, idx: usize) -> address {
        self.tags[idx]
    }

    #[must_use]
    pub fn num_lines(&self) -> usize {
        self.lines.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (address, &B)> + '_ {
        self.tags
            .iter()
            .zip(self.lines.iter())
            .filter(|(_, line)| line.is_allocated())
            .map(|(tag, line)| (*tag, line))
    }
}

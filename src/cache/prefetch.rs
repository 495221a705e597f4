use crate::address;

/// Line offsets of the next-line prefetcher, roughly geometric.
const PROGRESSION: [u64; 8] = [1, 3, 6, 25, 15, 76, 63, 229];

/// Size of the region sampled by the mega-line prefetcher.
pub const MEGA_REGION: u64 = 1024;

/// Maximum number of lines the mega-line prefetcher requests at once.
pub const MEGA_MAX_LINES: usize = 32;

/// Addresses requested by the next-line prefetcher after a demand miss to `addr`.
#[must_use]
pub fn next_line_targets(
    addr: address,
    line_size: u64,
    distance: u64,
    stride: u64,
    degree: usize,
) -> Vec<address> {
    let base = addr + distance * line_size;
    (0..degree)
        .map(|i| {
            let delta = PROGRESSION.get(i).copied().unwrap_or(i as u64 * 67);
            base + delta * stride * line_size
        })
        .collect()
}

/// Start of the mega-line region containing `addr`.
#[inline]
#[must_use]
pub fn mega_region(addr: address) -> address {
    addr & !(MEGA_REGION - 1)
}

/// Periodic sampler deciding when a region is dense enough to fetch in full.
#[derive(Debug, Clone)]
pub struct MegaSampler {
    ratio: f64,
    counter: usize,
}

impl MegaSampler {
    /// `lines_per_kib` lines touched per region trigger the prefetch.
    #[must_use]
    pub fn new(line_size: usize, lines_per_kib: usize) -> Self {
        let mut ratio = (line_size * lines_per_kib) as f64 / MEGA_REGION as f64;
        if ratio == 0.0 || ratio > 1.0 {
            // never triggers
            ratio = 2.0;
        }
        Self { ratio, counter: 0 }
    }

    #[must_use]
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.ratio < 1.0
    }

    /// Counts an allocation and returns whether this one samples.
    pub fn tick(&mut self) -> bool {
        let sample = self.counter > 8;
        self.counter += 1;
        if sample {
            self.counter = 0;
        }
        sample
    }

    /// Whether `hits` out of `total` sampled lines justify fetching the rest.
    #[must_use]
    pub fn should_fetch(&self, hits: usize, total: usize) -> bool {
        if total == 0 {
            return false;
        }
        let ratio = hits as f64 / total as f64;
        ratio > self.ratio && ratio < 1.0
    }
}

use crate::{
    address, config,
    event::{Event, Scheduler},
    fifo::Fifo,
    request::{Pool, Request, RequestId},
    Cycle,
};

/// Bandwidth model of a shared resource.
///
/// The variant is selected from the number of units and the number of
/// cycles each access occupies a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Port {
    /// No contention.
    Unlimited,
    /// One unit accepting an access every cycle.
    FullyPipelined { next: Cycle },
    /// Several units, each accepting an access every cycle.
    FullyNPipelined {
        units: usize,
        next: Cycle,
        free: usize,
    },
    /// One unit busy for `occ` cycles per access.
    Pipelined { occ: Cycle, next: Cycle },
    /// Several units, each busy for `occ` cycles per access.
    NPipelined { occ: Cycle, busy_until: Vec<Cycle> },
}

impl Port {
    #[must_use]
    pub fn new(units: usize, occ: Cycle) -> Self {
        match (units, occ) {
            (0, _) | (_, 0) => Self::Unlimited,
            (1, 1) => Self::FullyPipelined { next: 0 },
            (units, 1) => Self::FullyNPipelined {
                units,
                next: 0,
                free: 0,
            },
            (1, occ) => Self::Pipelined { occ, next: 0 },
            (units, occ) => Self::NPipelined {
                occ,
                busy_until: vec![0; units],
            },
        }
    }

    /// Reserves and returns the next cycle the port can be used.
    pub fn next_slot(&mut self, now: Cycle) -> Cycle {
        match self {
            Self::Unlimited => now,
            Self::FullyPipelined { next } => {
                let slot = (*next).max(now);
                *next = slot + 1;
                slot
            }
            Self::FullyNPipelined { units, next, free } => {
                if *next < now {
                    *next = now;
                    *free = *units - 1;
                } else if *free > 0 {
                    *free -= 1;
                } else {
                    *next += 1;
                    *free = *units - 1;
                }
                *next
            }
            Self::Pipelined { occ, next } => {
                let slot = (*next).max(now);
                *next = slot + *occ;
                slot
            }
            Self::NPipelined { occ, busy_until } => {
                if let Some(unit) = busy_until.iter_mut().find(|busy| **busy < now) {
                    *unit = now + *occ;
                    return now;
                }
                let Some(unit) = busy_until.iter_mut().min_by_key(|busy| **busy) else {
                    return now;
                };
                let slot = *unit;
                *unit += *occ;
                slot
            }
        }
    }

    /// Next cycle the port could be used, without reserving it.
    #[must_use]
    pub fn calc_next_slot(&self, now: Cycle) -> Cycle {
        match self {
            Self::Unlimited => now,
            Self::FullyPipelined { next } | Self::Pipelined { next, .. } => (*next).max(now),
            Self::FullyNPipelined { next, free, .. } => {
                if *next < now {
                    now
                } else {
                    *next + Cycle::from(*free == 0)
                }
            }
            Self::NPipelined { busy_until, .. } => {
                if busy_until.iter().any(|busy| *busy < now) {
                    now
                } else {
                    busy_until.iter().copied().min().unwrap_or(now)
                }
            }
        }
    }

    /// Cycles until the next slot, reserving it.
    pub fn next_slot_delta(&mut self, now: Cycle) -> Cycle {
        self.next_slot(now) - now
    }

    /// Keeps the port busy until `until`.
    pub fn occupy_until(&mut self, now: Cycle, until: Cycle) {
        if *self == Self::Unlimited {
            return;
        }
        let mut slot = now;
        while slot < until {
            slot = self.next_slot(now);
        }
    }
}

/// Whether [`PortModel::request`] scheduled the request or queued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Issued,
    Queued,
}

/// Banked tag/data ports and admission control of a cache.
#[derive(Debug)]
pub struct PortModel {
    name: String,
    banks: Vec<Port>,
    bank_mask: u64,
    bank_shift: u32,
    bank_size: usize,
    line_size: usize,
    fill_line_size: usize,
    send_fill: Port,

    nc_delay: Cycle,
    tag_delay: Cycle,
    data_delay: Cycle,

    max_requests: usize,
    cur_requests: usize,
    max_prefetch: usize,
    cur_prefetch: usize,
    drop_prefetch: bool,

    block_time: Cycle,
    /// Last cycle a fill or set state from below is handled.
    up_order: Cycle,
    overflow: Fifo<RequestId>,
}

impl PortModel {
    #[must_use]
    pub fn new(name: impl Into<String>, config: &config::Cache) -> Self {
        let num_banks = config.port_banks.max(1);
        let banks = (0..num_banks)
            .map(|_| Port::new(config.port_num, config.port_occ))
            .collect();
        let bank_shift = config
            .bank_shift
            .unwrap_or_else(|| config.line_size.ilog2());
        let data_delay = config.delay - config.miss_delay;
        Self {
            name: name.into(),
            banks,
            bank_mask: num_banks as u64 - 1,
            bank_shift,
            bank_size: 1 << bank_shift,
            line_size: config.line_size,
            fill_line_size: config.fill_line_size.unwrap_or(config.line_size),
            send_fill: Port::new(config.send_port_num, config.send_port_occ),
            nc_delay: config.nc_miss_delay.unwrap_or(config.miss_delay),
            tag_delay: config.delay - data_delay,
            data_delay,
            max_requests: if config.max_requests == 0 {
                32768
            } else {
                config.max_requests
            },
            cur_requests: 0,
            max_prefetch: config.max_prefetch,
            cur_prefetch: 0,
            drop_prefetch: config.drop_prefetch,
            block_time: 0,
            up_order: 0,
            overflow: Fifo::new(),
        }
    }

    #[inline]
    fn bank(&self, addr: address) -> usize {
        ((addr >> self.bank_shift) & self.bank_mask) as usize
    }

    /// Number of demand requests in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.cur_requests
    }

    #[must_use]
    pub fn in_flight_prefetches(&self) -> usize {
        self.cur_prefetch
    }

    #[must_use]
    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    #[must_use]
    pub fn tag_delay(&self) -> Cycle {
        self.tag_delay
    }

    #[must_use]
    pub fn data_delay(&self) -> Cycle {
        self.data_delay
    }

    /// Admits a new request or parks it in the overflow queue.
    pub fn request(&mut self, scheduler: &mut Scheduler, pool: &Pool, id: RequestId) -> Admission {
        let req = &pool[id];
        if !req.is_retrying() && !req.is_prefetch() {
            if self.cur_requests >= self.max_requests {
                log::trace!("{}: overflow {}", self.name, req);
                self.overflow.enqueue(id);
                return Admission::Queued;
            }
            self.drain_overflow(scheduler, pool);
            if !self.overflow.is_empty() {
                self.overflow.enqueue(id);
                return Admission::Queued;
            }
        }
        self.issue(scheduler, pool, id);
        Admission::Issued
    }

    fn issue(&mut self, scheduler: &mut Scheduler, pool: &Pool, id: RequestId) {
        let req = &pool[id];
        let now = scheduler.now();
        assert!(!req.is_dropped(), "issuing dropped {req}");

        if !req.is_retrying() {
            if req.is_prefetch() && self.max_prefetch > 0 {
                self.cur_prefetch += 1;
            } else {
                self.cur_requests += 1;
            }
        }

        let when = if req.is_warmup() {
            now
        } else if req.is_non_cacheable() {
            now + self.nc_delay
        } else {
            let bank = self.bank(req.addr);
            self.banks[bank].next_slot(now) + self.tag_delay
        };
        scheduler.schedule_at(when, Event::Redo(id));
    }

    fn drain_overflow(&mut self, scheduler: &mut Scheduler, pool: &Pool) {
        while let Some(queued) = self.overflow.dequeue() {
            self.issue(scheduler, pool, queued);
            if self.cur_requests >= self.max_requests {
                break;
            }
            if self.cur_prefetch > self.max_prefetch {
                break;
            }
        }
    }

    /// Releases the slot held by the request and admits queued requests.
    ///
    /// Must run before the request is acked.
    pub fn retire(&mut self, scheduler: &mut Scheduler, pool: &Pool, id: RequestId) {
        if pool[id].is_prefetch() && self.max_prefetch > 0 {
            assert!(self.cur_prefetch > 0, "{}: retiring idle prefetch slot", self.name);
            self.cur_prefetch -= 1;
        } else {
            assert!(self.cur_requests > 0, "{}: retiring idle request slot", self.name);
            self.cur_requests -= 1;
        }
        self.drain_overflow(scheduler, pool);
    }

    pub fn start_prefetch(&mut self, req: &Request) {
        assert!(req.is_prefetch());
        assert!(!req.is_dropped());
        if self.max_prefetch > 0 {
            self.cur_prefetch += 1;
        } else {
            self.cur_requests += 1;
        }
    }

    /// Half the request slots are kept for demand reads.
    #[must_use]
    pub fn is_busy(&self, _addr: address) -> bool {
        self.cur_requests >= self.max_requests / 2
    }

    fn should_drop(&self, booked: Cycle, now: Cycle, req: &Request) -> bool {
        self.drop_prefetch && req.is_prefetch() && booked > now + 8
    }

    /// Cycle a served request leaves the cache.
    pub fn req_done(&mut self, now: Cycle, req: &mut Request, retrying: bool) -> Cycle {
        if req.is_warmup() || req.is_dropped() {
            return now + 1;
        }
        if self.should_drop(self.send_fill.calc_next_slot(now), now, req) {
            req.set_dropped();
            return now + 1;
        }
        let mut when = self.send_fill.next_slot(now);
        if !retrying && !req.is_non_cacheable() {
            when += self.data_delay;
        }
        when.max(now + 1)
    }

    /// Cycle a filled request is forwarded up.
    pub fn req_ack_done(&mut self, now: Cycle, req: &mut Request) -> Cycle {
        if req.is_warmup() || req.is_dropped() {
            return now + 1;
        }
        if self.should_drop(self.send_fill.calc_next_slot(now), now, req) {
            req.set_dropped();
            return now + 1;
        }
        self.send_fill.next_slot(now) + 1
    }

    /// Books every bank a line fill touches and keeps them busy until the
    /// slowest one is done.
    pub fn reserve_fill_across_banks(&mut self, now: Cycle, addr: address) -> Cycle {
        let mut slots: Vec<(usize, Cycle)> = Vec::new();
        let mut latest = now;
        for (chunk, fill) in (0..self.line_size)
            .step_by(self.fill_line_size)
            .enumerate()
        {
            for offset in (0..self.fill_line_size).step_by(self.bank_size) {
                let bank = self.bank(addr + (fill + offset) as address);
                let slot = self.banks[bank].next_slot(now) + chunk as Cycle;
                latest = latest.max(slot);
                slots.push((bank, slot));
            }
        }
        for (bank, slot) in slots {
            if slot < latest {
                self.banks[bank].occupy_until(now, latest);
            }
        }
        latest
    }

    fn fill_bank_use(&mut self, now: Cycle, req: &Request) -> Cycle {
        if req.is_non_cacheable() || (req.is_prefetch() && req.is_dropped()) {
            return now;
        }
        self.reserve_fill_across_banks(now, req.addr)
    }

    pub fn request_ack(&mut self, scheduler: &mut Scheduler, pool: &mut Pool, id: RequestId) {
        let now = scheduler.now();
        let req = &mut pool[id];
        let until = if self.should_drop(self.block_time, now, req) {
            req.set_dropped();
            now + 1
        } else if req.is_warmup() || req.is_dropped() {
            now + 1
        } else {
            self.fill_bank_use(now, req)
        };
        self.block_time = until;
        let until = if req.is_warmup() {
            until
        } else {
            until.max(self.up_order)
        };
        self.up_order = self.up_order.max(until);
        scheduler.schedule_at(until, Event::Redo(id));
    }

    /// Set states are handled in arrival order with the fills from below.
    pub fn set_state(&mut self, scheduler: &mut Scheduler, id: RequestId) {
        let when = (scheduler.now() + 1).max(self.up_order);
        self.up_order = when;
        scheduler.schedule_at(when, Event::Redo(id));
    }

    pub fn set_state_ack(&mut self, scheduler: &mut Scheduler, id: RequestId) {
        scheduler.schedule(1, Event::Redo(id));
    }

    pub fn displace(&mut self, scheduler: &mut Scheduler, pool: &Pool, id: RequestId) {
        let now = scheduler.now();
        let until = self.fill_bank_use(now, &pool[id]);
        self.block_time = until;
        scheduler.schedule_at(until, Event::Redo(id));
    }
}

use crate::{
    address,
    builder::{self, Hierarchy},
    cache::{CoherentCache, State},
    config::{self, Config},
    event::{Callback, Event, Scheduler},
    mem_obj::{dispatch, Context, MemObject, ObjectId},
    request::{Pool, Request, RequestId, Signature},
    stats,
    sync::{Arc, Mutex},
    trace::{self, Op},
    Cycle,
};
use indexmap::IndexMap;

/// Drives a memory hierarchy with accesses from the cores.
#[derive(Debug)]
pub struct Simulator {
    hierarchy: Hierarchy,
    scheduler: Scheduler,
    pool: Pool,
    latency: Arc<Mutex<stats::Latency>>,
}

impl Simulator {
    #[must_use]
    pub fn new(hierarchy: Hierarchy) -> Self {
        Self {
            hierarchy,
            scheduler: Scheduler::new(),
            pool: Pool::new(),
            latency: Arc::new(Mutex::new(stats::Latency::default())),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, config::Errors> {
        Ok(Self::new(builder::build(config)?))
    }

    #[must_use]
    pub fn now(&self) -> Cycle {
        self.scheduler.now()
    }

    #[must_use]
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    #[must_use]
    pub fn cache(&self, name: &str) -> Option<Arc<Mutex<CoherentCache>>> {
        self.hierarchy.cache(name)
    }

    /// Coherence state of `addr` in the cache called `name`.
    #[must_use]
    pub fn state(&self, name: &str, addr: address) -> Option<State> {
        self.cache(name).map(|cache| cache.lock().state(addr))
    }

    /// Requests still in flight.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pool.len()
    }

    fn first_level(&self, core: usize) -> ObjectId {
        assert!(
            core < self.hierarchy.num_cores(),
            "core {core} out of range ({} cores)",
            self.hierarchy.num_cores()
        );
        match self.hierarchy.first_level(core).first() {
            Some(id) => *id,
            None => panic!("core {core} has no first level device"),
        }
    }

    fn context(&mut self) -> Context<'_> {
        Context {
            scheduler: &mut self.scheduler,
            pool: &mut self.pool,
            objects: self.hierarchy.objects(),
        }
    }

    fn start(&mut self, req: Request) -> RequestId {
        log::debug!("issue {req}");
        let id = self.pool.insert(req);
        self.scheduler.schedule(0, Event::Start(id));
        id
    }

    /// Issues an access of `core` in the current cycle.
    ///
    /// Prefetches are best effort and return no handle.
    pub fn issue(
        &mut self,
        core: usize,
        op: Op,
        addr: address,
        callback: Option<Callback>,
    ) -> Option<RequestId> {
        let target = self.first_level(core);
        let now = self.now();
        let req = match op {
            Op::Read => Request::read(target, addr, now),
            Op::Write => Request::write(target, addr, now),
            Op::NonCacheableRead => Request::non_cacheable_read(target, addr, now),
            Op::NonCacheableWrite => Request::non_cacheable_write(target, addr, now),
            Op::Prefetch => {
                self.prefetch(core, addr, callback);
                return None;
            }
        };
        Some(self.start(req.with_callback(callback)))
    }

    /// Issues an access that fills the hierarchy without contention.
    pub fn warmup(
        &mut self,
        core: usize,
        addr: address,
        write: bool,
        callback: Option<Callback>,
    ) -> RequestId {
        let target = self.first_level(core);
        let now = self.now();
        let req = if write {
            Request::warmup_write(target, addr, now)
        } else {
            Request::warmup_read(target, addr, now)
        };
        self.start(req.with_callback(callback))
    }

    /// Asks the first level cache of `core` to prefetch `addr`.
    pub fn prefetch(&mut self, core: usize, addr: address, callback: Option<Callback>) {
        let object = self.hierarchy.object(self.first_level(core));
        let mut object = object.try_lock();
        let mut ctx = self.context();
        object.try_prefetch(&mut ctx, addr, 0, Signature::STRIDE, 0, callback);
    }

    /// Installs `addr` along the path of `core` without simulating it.
    ///
    /// Returns the latency the access would have had.
    pub fn fast_forward(&mut self, core: usize, addr: address, write: bool) -> Cycle {
        let object = self.hierarchy.object(self.first_level(core));
        let mut object = object.try_lock();
        let mut ctx = self.context();
        if write {
            object.fast_forward_write(&mut ctx, addr)
        } else {
            object.fast_forward_read(&mut ctx, addr)
        }
    }

    /// Runs the next event, returning its cycle.
    pub fn step(&mut self) -> Option<Cycle> {
        let (cycle, event) = self.scheduler.pop()?;
        let mut ctx = self.context();
        dispatch(&mut ctx, event);
        Some(cycle)
    }

    /// Runs every event up to and including `cycle`.
    pub fn run_until(&mut self, cycle: Cycle) {
        while self
            .scheduler
            .next_cycle()
            .is_some_and(|next| next <= cycle)
        {
            self.step();
        }
        self.scheduler.advance_to(cycle);
    }

    /// Runs until no events are left and returns the final cycle.
    pub fn run_until_idle(&mut self) -> Cycle {
        while self.step().is_some() {}
        self.now()
    }

    fn record_latency(&self) -> Callback {
        let latency = Arc::clone(&self.latency);
        let start = self.now();
        Callback::new(move |done| latency.lock().record(done - start))
    }

    /// Issues every access at its cycle and runs until the hierarchy is idle.
    pub fn run_trace(&mut self, accesses: &[trace::Access]) -> Result<Cycle, trace::Error> {
        let cores = self.hierarchy.num_cores();
        if let Some(access) = accesses.iter().find(|access| access.core >= cores) {
            return Err(trace::Error::UnknownCore {
                core: access.core,
                cores,
            });
        }
        for access in accesses {
            self.run_until(access.cycle);
            let callback = match access.op {
                Op::Prefetch => None,
                _ => Some(self.record_latency()),
            };
            self.issue(access.core, access.op, access.addr, callback);
        }
        Ok(self.run_until_idle())
    }

    #[must_use]
    pub fn latency(&self) -> stats::Latency {
        self.latency.lock().clone()
    }

    /// Statistics of every object that keeps some, by instance name.
    #[must_use]
    pub fn stats(&self) -> IndexMap<String, stats::Stats> {
        self.hierarchy
            .names()
            .filter_map(|(name, id)| {
                let object = self.hierarchy.object(id);
                let stats = object.lock().stats();
                stats.map(|stats| (name.to_string(), stats))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::Simulator;
    use crate::{
        address,
        cache::State,
        config::Config,
        event::Callback,
        request::Action,
        stats::Stats,
        sync::{Arc, Mutex},
        trace::{self, Op},
        Cycle,
    };
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    const X: address = 0x1000;

    fn two_cores(dl1: &str, l2: &str) -> eyre::Result<Simulator> {
        with_cores(2, dl1, l2)
    }

    fn with_cores(cores: usize, dl1: &str, l2: &str) -> eyre::Result<Simulator> {
        let yaml = format!(
            r#"
cores: {cores}
first_level: ["dl1 DL1"]
sections:
  dl1: {{ type: cache, line_size: 64, delay: 5, miss_delay: 2, lower_level: "l2 L2 shared", {dl1} }}
  l2: {{ type: cache, line_size: 64, delay: 10, miss_delay: 4, lower_level: "mem Memory shared", {l2} }}
  mem: {{ type: memory, delay: 31 }}
"#
        );
        let config = Config::from_yaml(&yaml)?;
        Ok(Simulator::from_config(&config)?)
    }

    /// Issues the access and returns its latency once the hierarchy is idle.
    fn access(sim: &mut Simulator, core: usize, op: Op, addr: address) -> eyre::Result<Cycle> {
        let done = Arc::new(Mutex::new(None));
        let callback = {
            let done = Arc::clone(&done);
            Callback::new(move |cycle| *done.lock() = Some(cycle))
        };
        let start = sim.now();
        sim.issue(core, op, addr, Some(callback));
        sim.run_until_idle();
        let cycle = done.lock().take();
        let cycle = cycle.ok_or_else(|| eyre::eyre!("{op} of {addr:#x} by core {core} never completed"))?;
        diff::assert_eq!(sim.pending(), 0);
        Ok(cycle - start)
    }

    /// Issues all accesses in the current cycle and returns their latencies
    /// once the hierarchy is idle.
    fn access_together(
        sim: &mut Simulator,
        accesses: &[(usize, Op, address)],
    ) -> eyre::Result<Vec<Cycle>> {
        let start = sim.now();
        let done: Vec<Arc<Mutex<Option<Cycle>>>> = accesses
            .iter()
            .map(|_| Arc::new(Mutex::new(None)))
            .collect();
        for (&(core, op, addr), done) in accesses.iter().zip(&done) {
            let done = Arc::clone(done);
            let callback = Callback::new(move |cycle| *done.lock() = Some(cycle));
            sim.issue(core, op, addr, Some(callback));
        }
        sim.run_until_idle();
        diff::assert_eq!(sim.pending(), 0);
        accesses
            .iter()
            .zip(&done)
            .map(|(&(core, op, addr), done)| {
                let cycle = done.lock().take();
                cycle
                    .map(|cycle| cycle - start)
                    .ok_or_else(|| eyre::eyre!("{op} of {addr:#x} by core {core} never completed"))
            })
            .collect()
    }

    /// States of `addr` in the first level cache of every core.
    fn first_level_states(sim: &Simulator, addr: address) -> eyre::Result<Vec<State>> {
        (0..sim.hierarchy().num_cores())
            .map(|core| state(sim, &format!("DL1({core})"), addr))
            .collect()
    }

    /// An exclusive or modified copy is the only valid copy of the line.
    fn assert_single_writer(sim: &Simulator, addr: address) -> eyre::Result<()> {
        let states = first_level_states(sim, addr)?;
        let owners = states
            .iter()
            .filter(|state| matches!(state, State::MODIFIED | State::EXCLUSIVE))
            .count();
        let valid = states.iter().filter(|state| **state != State::INVALID).count();
        assert!(
            owners == 0 || valid == 1,
            "{addr:#x} has an owner next to other copies: {states:?}"
        );
        Ok(())
    }

    fn memory_reads(sim: &Simulator) -> eyre::Result<u64> {
        match sim.stats().get("Memory") {
            Some(Stats::Memory(stats)) => Ok(stats.reads),
            _ => eyre::bail!("missing memory stats"),
        }
    }

    fn state(sim: &Simulator, cache: &str, addr: address) -> eyre::Result<State> {
        sim.state(cache, addr)
            .ok_or_else(|| eyre::eyre!("no cache called {cache}"))
    }

    fn cache_stats(sim: &Simulator, cache: &str) -> eyre::Result<crate::stats::Cache> {
        match sim.stats().get(cache) {
            Some(Stats::Cache(stats)) => Ok(stats.clone()),
            _ => eyre::bail!("no cache stats for {cache}"),
        }
    }

    #[test]
    fn warm_hit_takes_the_cache_delay() -> eyre::Result<()> {
        crate::testing::init_logging();
        let mut sim = two_cores("size: 1024, assoc: 2", "size: 8192, assoc: 4")?;

        let miss = access(&mut sim, 0, Op::Read, X)?;
        assert!(miss > 31, "miss took only {miss} cycles");
        diff::assert_eq!(access(&mut sim, 0, Op::Read, X)?, 5);

        let stats = cache_stats(&sim, "DL1(0)")?;
        diff::assert_eq!(stats.hits(), 1);
        diff::assert_eq!(stats.misses(), 1);
        diff::assert_eq!(stats.hit_rate(), 0.5);
        Ok(())
    }

    #[test]
    fn second_reader_shares_the_line() -> eyre::Result<()> {
        crate::testing::init_logging();
        let mut sim = two_cores("size: 1024, assoc: 2", "size: 8192, assoc: 4")?;

        access(&mut sim, 0, Op::Read, X)?;
        diff::assert_eq!(state(&sim, "DL1(0)", X)?, State::EXCLUSIVE);
        diff::assert_eq!(state(&sim, "L2", X)?, State::EXCLUSIVE);

        access(&mut sim, 1, Op::Read, X)?;
        diff::assert_eq!(state(&sim, "DL1(0)", X)?, State::SHARED);
        diff::assert_eq!(state(&sim, "DL1(1)", X)?, State::SHARED);
        diff::assert_eq!(state(&sim, "L2", X)?, State::EXCLUSIVE);

        let l2 = sim.cache("L2").ok_or_else(|| eyre::eyre!("missing L2"))?;
        let l2 = l2.lock();
        let line = l2.line(X).ok_or_else(|| eyre::eyre!("L2 lost the line"))?;
        diff::assert_eq!(line.share_state(), State::SHARED);
        diff::assert_eq!(line.sharing_count(), 2);
        Ok(())
    }

    #[test]
    fn write_invalidates_other_sharers() -> eyre::Result<()> {
        crate::testing::init_logging();
        let mut sim = two_cores("size: 1024, assoc: 2", "size: 8192, assoc: 4")?;

        access(&mut sim, 0, Op::Read, X)?;
        access(&mut sim, 1, Op::Read, X)?;
        access(&mut sim, 0, Op::Write, X)?;

        diff::assert_eq!(state(&sim, "DL1(0)", X)?, State::MODIFIED);
        diff::assert_eq!(state(&sim, "DL1(1)", X)?, State::INVALID);

        let stats = cache_stats(&sim, "DL1(0)")?;
        diff::assert_eq!(stats.miss_state.total(), 1);
        // both the read and the upgrade waited for a sharer
        let stats = cache_stats(&sim, "L2")?;
        diff::assert_eq!(stats.half_miss.total(), 2);
        Ok(())
    }

    #[test]
    fn dirty_owner_is_downgraded_by_a_read() -> eyre::Result<()> {
        crate::testing::init_logging();
        let mut sim = two_cores("size: 1024, assoc: 2", "size: 8192, assoc: 4")?;

        access(&mut sim, 0, Op::Write, X)?;
        diff::assert_eq!(state(&sim, "DL1(0)", X)?, State::MODIFIED);

        access(&mut sim, 1, Op::Read, X)?;
        diff::assert_eq!(state(&sim, "DL1(0)", X)?, State::SHARED);
        diff::assert_eq!(state(&sim, "DL1(1)", X)?, State::SHARED);
        diff::assert_eq!(state(&sim, "L2", X)?, State::MODIFIED);
        Ok(())
    }

    #[test]
    fn dirty_eviction_writes_back() -> eyre::Result<()> {
        crate::testing::init_logging();
        // two sets of one way
        let mut sim = two_cores("size: 128, assoc: 1", "size: 8192, assoc: 4")?;

        access(&mut sim, 0, Op::Write, X)?;
        access(&mut sim, 0, Op::Read, X + 128)?;

        diff::assert_eq!(state(&sim, "DL1(0)", X)?, State::INVALID);
        diff::assert_eq!(state(&sim, "DL1(0)", X + 128)?, State::EXCLUSIVE);
        diff::assert_eq!(state(&sim, "L2", X)?, State::MODIFIED);

        let stats = cache_stats(&sim, "DL1(0)")?;
        diff::assert_eq!(stats.write_back, 1);
        diff::assert_eq!(stats.displaced_send, 1);
        diff::assert_eq!(cache_stats(&sim, "L2")?.displaced_recv, 1);
        Ok(())
    }

    #[test]
    fn inclusive_eviction_invalidates_upper_copies() -> eyre::Result<()> {
        crate::testing::init_logging();
        let mut sim = two_cores("size: 1024, assoc: 2", "size: 128, assoc: 1")?;

        access(&mut sim, 0, Op::Read, X)?;
        access(&mut sim, 0, Op::Read, X + 128)?;

        diff::assert_eq!(state(&sim, "L2", X)?, State::INVALID);
        diff::assert_eq!(state(&sim, "DL1(0)", X)?, State::INVALID);
        diff::assert_eq!(state(&sim, "DL1(0)", X + 128)?, State::EXCLUSIVE);
        diff::assert_eq!(cache_stats(&sim, "L2")?.inv_all, 1);

        let Some(Stats::Memory(memory)) = sim.stats().get("Memory").cloned() else {
            eyre::bail!("missing memory stats");
        };
        diff::assert_eq!(memory.reads, 2);
        Ok(())
    }

    #[test]
    fn next_line_prefetch_fills_ahead() -> eyre::Result<()> {
        crate::testing::init_logging();
        let mut sim = two_cores(
            "size: 1024, assoc: 2, nlp_degree: 1, nlp_distance: 2",
            "size: 8192, assoc: 4",
        )?;

        access(&mut sim, 0, Op::Read, X)?;
        let ahead = X + 3 * 64;
        {
            let dl1 = sim.cache("DL1(0)").ok_or_else(|| eyre::eyre!("missing DL1(0)"))?;
            let dl1 = dl1.lock();
            let line = dl1.line(ahead).ok_or_else(|| eyre::eyre!("line was not prefetched"))?;
            assert!(line.is_prefetch());
            diff::assert_eq!(line.state(), State::EXCLUSIVE);
        }

        diff::assert_eq!(access(&mut sim, 0, Op::Read, ahead)?, 5);
        let stats = cache_stats(&sim, "DL1(0)")?;
        diff::assert_eq!(stats.prefetch_useful, 1);
        diff::assert_eq!(stats.hits(), 1);
        Ok(())
    }

    #[test]
    fn fast_forward_installs_lines() -> eyre::Result<()> {
        crate::testing::init_logging();
        let mut sim = two_cores("size: 1024, assoc: 2", "size: 8192, assoc: 4")?;

        // dl1, l2 and memory each add one cycle
        diff::assert_eq!(sim.fast_forward(0, X, false), 3);
        diff::assert_eq!(sim.fast_forward(0, X, false), 1);
        diff::assert_eq!(state(&sim, "DL1(0)", X)?, State::EXCLUSIVE);

        sim.fast_forward(1, X + 64, true);
        diff::assert_eq!(state(&sim, "DL1(1)", X + 64)?, State::MODIFIED);
        diff::assert_eq!(state(&sim, "L2", X + 64)?, State::EXCLUSIVE);
        diff::assert_eq!(sim.pending(), 0);
        Ok(())
    }

    #[test]
    fn runs_a_trace() -> eyre::Result<()> {
        crate::testing::init_logging();
        let mut sim = two_cores("size: 1024, assoc: 2", "size: 8192, assoc: 4")?;
        let accesses = trace::parse(
            "\
0 0 r 1000
0 1 r 2000
100 0 w 1000
200 1 r 1000
300 0 p 4000
"
            .as_bytes(),
        )?;
        let end = sim.run_trace(&accesses)?;
        assert!(end >= 300);
        diff::assert_eq!(sim.pending(), 0);
        diff::assert_eq!(sim.latency().accesses, 4);
        diff::assert_eq!(state(&sim, "DL1(1)", X)?, State::SHARED);
        diff::assert_eq!(state(&sim, "L2", X)?, State::MODIFIED);

        let unknown = trace::parse("0 2 r 1000".as_bytes())?;
        assert!(matches!(
            sim.run_trace(&unknown),
            Err(trace::Error::UnknownCore { core: 2, cores: 2 })
        ));
        Ok(())
    }

    #[test]
    fn runs_the_sample_configuration() -> eyre::Result<()> {
        crate::testing::init_logging();
        let manifest_dir = std::path::PathBuf::from(std::env!("CARGO_MANIFEST_DIR"));
        let config = Config::from_path(manifest_dir.join("configs/two_core.yaml"))?;
        let mut sim = Simulator::from_config(&config)?;
        let accesses = trace::from_path(manifest_dir.join("traces/pingpong.trace"))?;
        sim.run_trace(&accesses)?;
        diff::assert_eq!(sim.pending(), 0);
        diff::assert_eq!(sim.latency().accesses, 9);
        diff::assert_eq!(
            sim.hierarchy().names().map(|(name, _)| name).collect::<Vec<_>>(),
            vec!["DL1(0)", "L2", "MemBus", "Memory", "DL1(1)"]
        );

        // both cores wrote 0x1000 in turn before sharing it again
        diff::assert_eq!(state(&sim, "DL1(0)", X)?, State::SHARED);
        diff::assert_eq!(state(&sim, "DL1(1)", X)?, State::SHARED);
        diff::assert_eq!(state(&sim, "L2", X)?, State::MODIFIED);
        diff::assert_eq!(state(&sim, "DL1(1)", 0x1040)?, State::EXCLUSIVE);
        diff::assert_eq!(state(&sim, "DL1(0)", 0x8000)?, State::EXCLUSIVE);
        for addr in [X, 0x1040, 0x8000] {
            assert_single_writer(&sim, addr)?;
        }
        let stats = cache_stats(&sim, "DL1(1)")?;
        diff::assert_eq!(stats.set_state.get(Action::SET_INVALID), 1);
        diff::assert_eq!(stats.set_state.get(Action::SET_SHARED), 1);
        Ok(())
    }

    #[test]
    fn same_cycle_writes_leave_a_single_owner() -> eyre::Result<()> {
        crate::testing::init_logging();
        let mut sim = two_cores("size: 1024, assoc: 2", "size: 8192, assoc: 4")?;

        access(&mut sim, 0, Op::Read, X)?;
        access(&mut sim, 1, Op::Read, X)?;
        diff::assert_eq!(first_level_states(&sim, X)?, vec![State::SHARED, State::SHARED]);

        // both upgrades reach the shared level in the same cycle
        let latencies = access_together(&mut sim, &[(0, Op::Write, X), (1, Op::Write, X)])?;
        diff::assert_eq!(latencies.len(), 2);

        let states = first_level_states(&sim, X)?;
        let holders: Vec<_> = states.iter().filter(|state| **state != State::INVALID).collect();
        diff::assert_eq!(holders, vec![&State::MODIFIED]);
        diff::assert_eq!(states, vec![State::INVALID, State::MODIFIED]);
        // the first writer handed its dirty copy back
        diff::assert_eq!(state(&sim, "L2", X)?, State::MODIFIED);
        diff::assert_eq!(sim.pending(), 0);
        Ok(())
    }

    #[test]
    fn waiters_on_a_line_are_served_in_arrival_order() -> eyre::Result<()> {
        crate::testing::init_logging();
        let mut sim = with_cores(4, "size: 1024, assoc: 2", "size: 8192, assoc: 4")?;

        let reads: Vec<_> = (0..4).map(|core| (core, Op::Read, X)).collect();
        let latencies = access_together(&mut sim, &reads)?;
        let mut sorted = latencies.clone();
        sorted.sort_unstable();
        diff::assert_eq!(latencies, sorted);
        assert!(latencies[0] < latencies[1], "{latencies:?}");

        diff::assert_eq!(first_level_states(&sim, X)?, vec![State::SHARED; 4]);
        let l2 = sim.cache("L2").ok_or_else(|| eyre::eyre!("missing L2"))?;
        {
            let l2 = l2.lock();
            let line = l2.line(X).ok_or_else(|| eyre::eyre!("L2 lost the line"))?;
            diff::assert_eq!(line.sharing_count(), 4);
            diff::assert_eq!(l2.queued(X), 0);
        }
        // only the first reader went to memory, the others waited for it
        diff::assert_eq!(memory_reads(&sim)?, 1);
        diff::assert_eq!(cache_stats(&sim, "L2")?.half_miss.total(), 3);
        diff::assert_eq!(cache_stats(&sim, "L2")?.misses(), 1);
        Ok(())
    }

    #[test]
    fn full_miss_entry_is_polled_again() -> eyre::Result<()> {
        crate::testing::init_logging();
        // two requests per line entry at most
        let mut sim = two_cores("size: 1024, assoc: 2, max_requests: 2", "size: 8192, assoc: 4")?;

        sim.prefetch(0, X, None);
        let done = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let done = Arc::clone(&done);
            let callback = Callback::new(move |cycle| done.lock().push(cycle));
            sim.issue(0, Op::Read, X, Some(callback));
        }

        // the prefetch and the first read hold the entry, the second read polls
        sim.run_until(10);
        let dl1 = sim.cache("DL1(0)").ok_or_else(|| eyre::eyre!("missing DL1(0)"))?;
        diff::assert_eq!(dl1.lock().queued(X), 2);
        diff::assert_eq!(dl1.lock().in_flight(), 2);
        assert!(done.lock().is_empty());

        sim.run_until_idle();
        diff::assert_eq!(done.lock().len(), 2);
        diff::assert_eq!(sim.pending(), 0);
        diff::assert_eq!(dl1.lock().queued(X), 0);
        diff::assert_eq!(dl1.lock().in_flight(), 0);
        diff::assert_eq!(state(&sim, "DL1(0)", X)?, State::EXCLUSIVE);
        diff::assert_eq!(memory_reads(&sim)?, 1);
        Ok(())
    }

    #[test]
    fn port_overflow_admits_every_request() -> eyre::Result<()> {
        crate::testing::init_logging();
        let mut sim = two_cores(
            "size: 1024, assoc: 2, max_requests: 2",
            "size: 8192, assoc: 4, max_requests: 1",
        )?;

        let reads: Vec<_> = (0..6).map(|i| (0, Op::Read, X + 64 * i)).collect();
        let latencies = access_together(&mut sim, &reads)?;
        diff::assert_eq!(latencies.len(), 6);
        // at most two requests are served at a time
        let slowest = latencies.iter().copied().max().unwrap_or_default();
        let fastest = latencies.iter().copied().min().unwrap_or_default();
        assert!(slowest >= 3 * fastest, "{latencies:?}");

        let dl1 = sim.cache("DL1(0)").ok_or_else(|| eyre::eyre!("missing DL1(0)"))?;
        diff::assert_eq!(dl1.lock().in_flight(), 0);
        diff::assert_eq!(dl1.lock().resident_lines(), 6);
        diff::assert_eq!(cache_stats(&sim, "DL1(0)")?.misses(), 6);
        diff::assert_eq!(memory_reads(&sim)?, 6);
        for i in 0..6 {
            assert_single_writer(&sim, X + 64 * i)?;
        }
        Ok(())
    }

    #[test]
    fn lone_writer_leaves_the_lower_level_exclusive() -> eyre::Result<()> {
        crate::testing::init_logging();
        let mut sim = two_cores("size: 1024, assoc: 2", "size: 8192, assoc: 4")?;

        access(&mut sim, 0, Op::Write, X)?;
        diff::assert_eq!(state(&sim, "DL1(0)", X)?, State::MODIFIED);
        diff::assert_eq!(state(&sim, "DL1(1)", X)?, State::INVALID);
        diff::assert_eq!(state(&sim, "L2", X)?, State::EXCLUSIVE);

        let l2 = sim.cache("L2").ok_or_else(|| eyre::eyre!("missing L2"))?;
        let l2 = l2.lock();
        let line = l2.line(X).ok_or_else(|| eyre::eyre!("L2 lost the line"))?;
        diff::assert_eq!(line.share_state(), State::EXCLUSIVE);
        diff::assert_eq!(line.sharers().to_vec(), vec![0]);
        Ok(())
    }

    #[test]
    fn directory_only_notifies_recorded_sharers() -> eyre::Result<()> {
        crate::testing::init_logging();
        for directory in [true, false] {
            let mut sim = with_cores(
                3,
                "size: 1024, assoc: 2",
                &format!("size: 8192, assoc: 4, directory: {directory}"),
            )?;
            access(&mut sim, 0, Op::Read, X)?;
            access(&mut sim, 1, Op::Read, X)?;
            access(&mut sim, 2, Op::Read, X + 64)?;
            access(&mut sim, 0, Op::Write, X)?;

            diff::assert_eq!(
                first_level_states(&sim, X)?,
                vec![State::MODIFIED, State::INVALID, State::INVALID]
            );
            let set_states = |cache: &str| -> eyre::Result<u64> {
                Ok(cache_stats(&sim, cache)?.set_state.total())
            };
            diff::assert_eq!(set_states("DL1(0)")?, 1);
            diff::assert_eq!(set_states("DL1(1)")?, 1);
            // without a directory the bystander sees the sharing and the upgrade
            let bystander = if directory { 0 } else { 2 };
            diff::assert_eq!(set_states("DL1(2)")?, bystander);
            diff::assert_eq!(state(&sim, "DL1(2)", X + 64)?, State::EXCLUSIVE);
        }
        Ok(())
    }

    #[test]
    fn directory_evicts_a_single_sharer() -> eyre::Result<()> {
        crate::testing::init_logging();
        // two sets of one way below three cores
        let mut sim = with_cores(3, "size: 1024, assoc: 2", "size: 128, assoc: 1, directory: true")?;

        access(&mut sim, 0, Op::Read, X)?;
        access(&mut sim, 1, Op::Read, X)?;
        access(&mut sim, 0, Op::Write, X)?;
        access(&mut sim, 2, Op::Read, X + 128)?;

        diff::assert_eq!(state(&sim, "L2", X)?, State::INVALID);
        diff::assert_eq!(
            first_level_states(&sim, X)?,
            vec![State::INVALID, State::INVALID, State::INVALID]
        );
        diff::assert_eq!(state(&sim, "DL1(2)", X + 128)?, State::EXCLUSIVE);
        let stats = cache_stats(&sim, "L2")?;
        diff::assert_eq!(stats.inv_one, 1);
        diff::assert_eq!(stats.inv_all, 0);
        diff::assert_eq!(cache_stats(&sim, "DL1(2)")?.set_state.total(), 0);
        Ok(())
    }

    #[test]
    fn victim_cache_keeps_displaced_lines() -> eyre::Result<()> {
        crate::testing::init_logging();
        let mut sim = two_cores(
            "size: 128, assoc: 1",
            "size: 8192, assoc: 4, victim: true, inclusive: false",
        )?;

        access(&mut sim, 0, Op::Write, X)?;
        // fills pass through without allocating
        diff::assert_eq!(state(&sim, "L2", X)?, State::INVALID);

        access(&mut sim, 0, Op::Read, X + 128)?;
        diff::assert_eq!(state(&sim, "DL1(0)", X)?, State::INVALID);
        diff::assert_eq!(state(&sim, "L2", X)?, State::MODIFIED);
        diff::assert_eq!(state(&sim, "L2", X + 128)?, State::INVALID);
        diff::assert_eq!(memory_reads(&sim)?, 2);

        access(&mut sim, 0, Op::Read, X)?;
        diff::assert_eq!(memory_reads(&sim)?, 2);
        diff::assert_eq!(cache_stats(&sim, "L2")?.hits(), 1);
        diff::assert_eq!(state(&sim, "DL1(0)", X)?, State::EXCLUSIVE);
        Ok(())
    }

    #[test]
    fn just_directory_tracks_sharers_without_data() -> eyre::Result<()> {
        crate::testing::init_logging();
        let mut sim = two_cores(
            "size: 1024, assoc: 2",
            "size: 8192, assoc: 4, directory: true, just_directory: true",
        )?;

        access(&mut sim, 0, Op::Read, X)?;
        access(&mut sim, 1, Op::Read, X)?;
        diff::assert_eq!(first_level_states(&sim, X)?, vec![State::SHARED, State::SHARED]);
        diff::assert_eq!(state(&sim, "L2", X)?, State::INVALID);
        {
            let l2 = sim.cache("L2").ok_or_else(|| eyre::eyre!("missing L2"))?;
            let l2 = l2.lock();
            let line = l2.line(X).ok_or_else(|| eyre::eyre!("L2 forgot the sharers"))?;
            diff::assert_eq!(line.share_state(), State::SHARED);
            diff::assert_eq!(line.sharing_count(), 2);
        }

        access(&mut sim, 0, Op::Write, X)?;
        diff::assert_eq!(first_level_states(&sim, X)?, vec![State::MODIFIED, State::INVALID]);
        diff::assert_eq!(state(&sim, "L2", X)?, State::INVALID);
        diff::assert_eq!(memory_reads(&sim)?, 1);
        Ok(())
    }

    #[test]
    fn mega_line_prefetch_fetches_dense_regions() -> eyre::Result<()> {
        crate::testing::init_logging();
        let mut sim = two_cores(
            "size: 4096, assoc: 2, mega_lines1k: 8, prefetch_degree: 1",
            "size: 16384, assoc: 4",
        )?;
        let region: address = 0x4000;

        // the tenth allocation samples a region with ten of its sixteen lines present
        for i in 0..10 {
            access(&mut sim, 0, Op::Read, region + 64 * i)?;
        }
        let stats = cache_stats(&sim, "DL1(0)")?;
        diff::assert_eq!(stats.mega_sampled, 1);
        diff::assert_eq!(stats.mega_fetched, 1);
        diff::assert_eq!(stats.send_prefetch, 6);
        {
            let dl1 = sim.cache("DL1(0)").ok_or_else(|| eyre::eyre!("missing DL1(0)"))?;
            let dl1 = dl1.lock();
            for i in 10..16 {
                let line = dl1
                    .line(region + 64 * i)
                    .ok_or_else(|| eyre::eyre!("line {i} was not fetched"))?;
                assert!(line.is_prefetch());
            }
            diff::assert_eq!(dl1.resident_lines(), 16);
        }

        diff::assert_eq!(access(&mut sim, 0, Op::Read, region + 64 * 12)?, 5);
        diff::assert_eq!(cache_stats(&sim, "DL1(0)")?.prefetch_useful, 1);
        Ok(())
    }

    #[test]
    fn random_accesses_keep_a_single_writer() -> eyre::Result<()> {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        crate::testing::init_logging();
        // four lines per first level cache, no evictions in the shared level
        let mut sim = with_cores(
            4,
            "size: 256, assoc: 2",
            "size: 8192, assoc: 4, directory: true",
        )?;
        let lines: Vec<address> = (0..12).map(|i| 0x10000 + 64 * i).collect();
        let mut rng = StdRng::seed_from_u64(42);

        let mut completed = 0;
        for _ in 0..300 {
            // each core issues at most one access per round
            let mut accesses = Vec::new();
            for core in 0..4 {
                if !rng.gen_bool(0.6) {
                    continue;
                }
                let op = if rng.gen_bool(0.3) { Op::Write } else { Op::Read };
                accesses.push((core, op, lines[rng.gen_range(0..lines.len())]));
            }
            completed += access_together(&mut sim, &accesses)?.len();

            for &addr in &lines {
                assert_single_writer(&sim, addr)?;
                let l2 = sim
                    .cache("L2")
                    .is_some_and(|l2| l2.lock().line(addr).is_some());
                let cached = first_level_states(&sim, addr)?
                    .iter()
                    .any(|state| *state != State::INVALID);
                assert!(!cached || l2, "{addr:#x} is cached above but not in L2");
            }
        }
        assert!(completed > 500, "only {completed} accesses completed");
        diff::assert_eq!(sim.pending(), 0);
        Ok(())
    }
}

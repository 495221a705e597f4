pub mod block;
pub mod prefetch;

pub use block::{Line, State};

use crate::{
    address, config,
    event::{Callback, Event},
    mem_obj::{Context, MemObject, ObjectId},
    mshr::MissQueue,
    port::PortModel,
    request::{Action, Kind, Request, RequestId, Signature},
    router::Router,
    stats,
    tag_array::TagArray,
    Cycle,
};
use console::style;
use prefetch::MegaSampler;

/// Outcome of notifying the sharers above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notify {
    /// Nothing to wait for.
    Done,
    /// Set state acks are pending, the request resumes once they arrive.
    Wait,
    /// The request is a prefetch that would need invalidations.
    Drop,
}

/// Coherent cache.
///
/// Tracks MESI state per line and, for inclusive caches, which up
/// neighbours share a copy. Requests are serialized per line by the miss
/// queue and timed by the port model.
#[derive(Debug)]
pub struct CoherentCache {
    id: ObjectId,
    name: String,
    router: Router,
    config: config::Cache,
    tags: TagArray<Line>,
    ports: PortModel,
    mshr: MissQueue<RequestId>,
    mega: MegaSampler,
    last_up_msg: Cycle,
    stats: stats::Cache,
}

impl std::fmt::Display for CoherentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.name, self.config)
    }
}

impl CoherentCache {
    #[must_use]
    pub fn new(id: ObjectId, name: impl Into<String>, config: &config::Cache) -> Self {
        let name = name.into();
        let mshr_line_size = if config.allocate_miss {
            config.line_size
        } else {
            64
        };
        let mshr = MissQueue::new(
            format!("{name}_mshr"),
            128 * config.max_requests,
            mshr_line_size,
            config.max_requests,
        );
        Self {
            id,
            router: Router::new(id),
            config: config.clone(),
            tags: TagArray::new(config.size, config.assoc, config.line_size),
            ports: PortModel::new(name.clone(), config),
            mshr,
            mega: MegaSampler::new(config.line_size, config.mega_lines1k),
            last_up_msg: 0,
            stats: stats::Cache::default(),
            name,
        }
    }

    #[must_use]
    pub fn config(&self) -> &config::Cache {
        &self.config
    }

    /// Resident line holding `addr`.
    #[must_use]
    pub fn line(&self, addr: address) -> Option<&Line> {
        self.tags.probe(addr).map(|idx| self.tags.line(idx))
    }

    /// Coherence state of `addr`, invalid when not resident.
    #[must_use]
    pub fn state(&self, addr: address) -> State {
        self.line(addr).map_or(State::INVALID, Line::state)
    }

    #[must_use]
    pub fn resident_lines(&self) -> usize {
        self.tags.iter().count()
    }

    /// Demand requests currently holding a port slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.ports.in_flight()
    }

    /// Requests holding or waiting for the miss queue entry of `addr`.
    #[must_use]
    pub fn queued(&self, addr: address) -> usize {
        self.mshr.entry(addr).len()
    }

    #[must_use]
    pub fn cache_stats(&self) -> &stats::Cache {
        &self.stats
    }

    /// Delay for the next message sent up, keeping them in order.
    fn in_order_up_message(&mut self, now: Cycle, mut delay: Cycle) -> Cycle {
        if self.last_up_msg > now {
            delay += self.last_up_msg - now;
        }
        self.last_up_msg = now + delay;
        delay
    }

    /// Same as [`Self::in_order_up_message`] for an absolute cycle.
    fn in_order_up_message_at(&mut self, now: Cycle, mut when: Cycle) -> Cycle {
        if self.last_up_msg > when {
            when = self.last_up_msg;
        } else {
            self.last_up_msg = when;
        }
        if when == now {
            when + 1
        } else {
            when
        }
    }

    fn lookup(&mut self, req: &Request) -> Option<usize> {
        if req.is_prefetch() {
            self.tags.probe(req.addr)
        } else {
            self.tags.lookup(req.addr, true)
        }
    }

    /// Releases the miss queue entry and wakes up the next waiter.
    fn retire_mshr(&mut self, ctx: &mut Context<'_>, addr: address, id: RequestId) {
        if let Some(next) = self.mshr.retire(addr, &id) {
            log::trace!("{}: wake up {}", self.name, next);
            ctx.scheduler.schedule(0, Event::Redo(next));
        }
    }

    /// Terminates a dropped prefetch at its home or sends it back up.
    fn finish_dropped(&mut self, ctx: &mut Context<'_>, id: RequestId) {
        let req = &mut ctx.pool[id];
        if req.is_home() {
            ctx.pool.ack(id, ctx.scheduler);
            return;
        }
        if req.kind == Kind::REQ {
            req.convert_to_req_ack(req.action);
        }
        let delay = self.in_order_up_message(ctx.now(), 0);
        self.router.schedule_req_ack(ctx, id, delay);
    }

    fn drop_prefetch(&mut self, ctx: &mut Context<'_>, id: RequestId) {
        log::trace!("{}: drop {}", self.name, ctx.pool[id]);
        self.stats.prefetch_dropped += 1;
        ctx.pool[id].set_dropped();
        self.finish_dropped(ctx, id);
    }

    fn must_forward_req_down(&mut self, ctx: &mut Context<'_>, id: RequestId, miss: bool) {
        let req = &mut ctx.pool[id];
        if !req.is_prefetch() {
            if miss {
                self.stats.miss_line.inc(req.action);
            } else {
                self.stats.miss_state.inc(req.action);
            }
        }
        if req.action == Action::SET_DIRTY {
            req.adjust_action(Action::SET_EXCLUSIVE);
        }
        assert!(!req.is_retrying(), "forwarding retrying {req}");
        self.router.schedule_req(ctx, id, 0);
    }

    fn notify_lower_levels(&self, line: &Line, req: &Request) -> bool {
        if self.config.just_directory || !self.config.coherent || req.kind == Kind::REQ_ACK {
            return false;
        }
        line.should_notify_lower_levels(req.action, !self.config.coherent)
    }

    /// Sends set states to the other sharers of the line.
    fn notify_higher_levels(&mut self, ctx: &mut Context<'_>, idx: usize, id: RequestId) -> Notify {
        let req = &ctx.pool[id];
        debug_assert!(
            !self.notify_lower_levels(self.tags.line(idx), req),
            "lower levels are notified first"
        );
        if req.is_top_coherent() || self.config.victim {
            return Notify::Done;
        }
        debug_assert!(!req.is_home());

        let port = self.router.creator_port(req);
        if !self.tags.line(idx).should_notify_higher_levels(req, port) {
            return Notify::Done;
        }
        if req.is_prefetch() {
            return Notify::Drop;
        }

        let action = Line::others_need(req.orig_action);
        if action == Action::SET_SHARED
            && req.kind == Kind::REQ_ACK
            && req.action == Action::SET_EXCLUSIVE
        {
            ctx.pool[id].force_action(Action::SET_SHARED);
        }

        let delay = self.in_order_up_message(ctx.now(), 0);
        let line = self.tags.line(idx);
        log::debug!(
            "{}: {} {} for {}",
            style(&self.name).cyan(),
            style("notify sharers").yellow(),
            line,
            ctx.pool[id]
        );
        if !self.config.directory || line.is_broadcast_needed() {
            self.router.send_set_state_others(ctx, id, action, delay);
        } else {
            let sharers = line.sharers().to_vec();
            for pos in sharers.into_iter().filter(|pos| Some(*pos) != port) {
                let sent = self.router.send_set_state_pos(ctx, pos, id, action, delay);
                debug_assert_eq!(sent, 1);
            }
        }

        if ctx.pool[id].has_pending_set_state_ack() {
            Notify::Wait
        } else {
            Notify::Done
        }
    }

    /// Notifies the levels above and below about the line at `victim_addr` leaving the cache.
    fn displace_line(
        &mut self,
        ctx: &mut Context<'_>,
        victim_addr: address,
        trigger: RequestId,
        line: &Line,
    ) {
        debug_assert!(line.is_valid());
        if self.config.inclusive && !ctx.pool[trigger].is_top_coherent() {
            let count = line.sharing_count();
            if self.config.directory && count == 0 {
                self.stats.inv_none += 1;
                if line.is_prefetch() {
                    return;
                }
            } else {
                let now = ctx.now();
                let inv = Request::set_state(self.id, self.id, Action::SET_INVALID, victim_addr, now);
                let inv = ctx.pool.insert(inv);
                let delay = self.in_order_up_message(now, 0);
                let sent = match line.first_sharer() {
                    Some(pos) if self.config.directory && count == 1 => {
                        self.stats.inv_one += 1;
                        self.router
                            .send_set_state_pos(ctx, pos, inv, Action::SET_INVALID, delay)
                    }
                    _ => {
                        self.stats.inv_all += 1;
                        self.router
                            .send_set_state_all(ctx, inv, Action::SET_INVALID, delay)
                    }
                };
                if sent == 0 {
                    ctx.pool.ack(inv, ctx.scheduler);
                }
            }
        } else if line.is_prefetch() {
            // unused prefetches leave silently
            return;
        }

        self.stats.displaced_send += 1;
        if line.needs_disp() {
            log::trace!("{}: displace {:#x} dirty", self.name, victim_addr);
            self.router.send_dirty_disp(ctx, victim_addr, 1);
            self.stats.write_back += 1;
        } else {
            log::trace!("{}: displace {:#x} clean", self.name, victim_addr);
            self.router
                .send_clean_disp(ctx, victim_addr, line.is_prefetch(), 1);
        }
    }

    /// Allocates a line for the request, displacing the previous occupant.
    fn allocate_line(&mut self, ctx: &mut Context<'_>, addr: address, trigger: RequestId) -> usize {
        let (prefetch, pc) = {
            let req = &ctx.pool[trigger];
            (req.is_prefetch(), req.pc)
        };
        let (idx, evicted) = self.tags.fill_or_replace(addr);
        self.stats.line_fill += 1;

        let old = std::mem::replace(self.tags.line_mut(idx), Line::allocated(prefetch));
        if let Some(evicted) = evicted.filter(|_| old.is_valid()) {
            if old.is_prefetch() && !prefetch {
                self.stats.prefetch_wasteful += 1;
            }
            self.displace_line(ctx, evicted, trigger, &old);
        }
        if prefetch {
            self.stats.prefetch_line_fill += 1;
        }

        if self.mega.is_enabled() && self.mega.tick() {
            self.mega_prefetch(ctx, addr, pc);
        }
        debug_assert_eq!(self.tags.line(idx).sharing_count(), 0);
        idx
    }

    /// Samples the region around `addr` and fetches its missing lines if it is dense.
    fn mega_prefetch(&mut self, ctx: &mut Context<'_>, addr: address, pc: address) {
        self.stats.mega_sampled += 1;
        let region = prefetch::mega_region(addr);
        let line_size = self.config.line_size as u64;
        let num_lines = prefetch::MEGA_REGION / line_size;

        let mut hits = 0;
        let mut missing = Vec::new();
        for i in 0..num_lines {
            let line_addr = region + line_size * i * self.config.nlp_stride;
            if !self.mshr.can_issue(line_addr) || self.tags.probe(line_addr).is_some() {
                // pending requests count as hits
                hits += 1;
            } else if missing.len() < prefetch::MEGA_MAX_LINES {
                missing.push(line_addr);
            }
        }
        if self.mega.should_fetch(hits, num_lines as usize) {
            self.stats.mega_fetched += 1;
            for line_addr in missing {
                self.try_prefetch(ctx, line_addr, 1, Signature::MEGA, pc, None);
            }
        }
    }

    fn ack_set_state(&mut self, ctx: &mut Context<'_>, id: RequestId, action: Action, needs_disp: bool) {
        ctx.pool[id].convert_to_set_state_ack(action, needs_disp);
        self.router.schedule_set_state_ack(ctx, id, 0);
    }
}

impl MemObject for CoherentCache {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn router(&self) -> &Router {
        &self.router
    }

    fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    fn request(&mut self, ctx: &mut Context<'_>, id: RequestId) {
        let req = &mut ctx.pool[id];
        if req.addr == 0 {
            ctx.pool.ack_after(id, 1, ctx.scheduler);
            return;
        }
        if self.config.coherent {
            req.try_set_top_coherent(self.id);
        }
        log::debug!(
            "{}: {} {}",
            style(&self.name).cyan(),
            style("request").bold(),
            req
        );
        self.ports.request(ctx.scheduler, ctx.pool, id);
    }

    fn request_ack(&mut self, ctx: &mut Context<'_>, id: RequestId) {
        let req = &mut ctx.pool[id];
        if req.is_retrying() {
            req.clear_retrying();
        } else {
            self.stats.req_ack.inc(req.action);
        }
        log::debug!(
            "{}: {} {}",
            style(&self.name).cyan(),
            style("request ack").green(),
            req
        );
        self.ports.request_ack(ctx.scheduler, ctx.pool, id);
    }

    fn set_state(&mut self, ctx: &mut Context<'_>, id: RequestId) {
        let req = &mut ctx.pool[id];
        if !self.config.coherent {
            req.convert_to_set_state_ack(Action::SET_INVALID, true);
        }
        self.stats.set_state.inc(req.action);
        log::debug!(
            "{}: {} {}",
            style(&self.name).cyan(),
            style("set state").magenta(),
            req
        );
        self.ports.set_state(ctx.scheduler, id);
    }

    fn set_state_ack(&mut self, ctx: &mut Context<'_>, id: RequestId) {
        log::trace!("{}: set state ack {}", self.name, ctx.pool[id]);
        self.ports.set_state_ack(ctx.scheduler, id);
    }

    fn displace(&mut self, ctx: &mut Context<'_>, id: RequestId) {
        self.stats.displaced_recv += 1;
        log::trace!("{}: displace {}", self.name, ctx.pool[id]);
        self.ports.displace(ctx.scheduler, ctx.pool, id);
    }

    fn do_req(&mut self, ctx: &mut Context<'_>, id: RequestId) {
        let addr = ctx.pool[id].addr;
        let retrying = ctx.pool[id].is_retrying();

        if retrying {
            ctx.pool[id].clear_retrying();
            debug_assert!(!self.mshr.can_issue(addr), "retrying {} without entry", ctx.pool[id]);
        } else {
            if !self.mshr.can_issue(addr) {
                if ctx.pool[id].is_prefetch() {
                    self.ports.retire(ctx.scheduler, ctx.pool, id);
                    self.drop_prefetch(ctx, id);
                    return;
                }
                ctx.pool[id].set_retrying();
                if !self.mshr.add_entry(addr, id) {
                    // no room to wait, poll again
                    ctx.pool[id].clear_retrying();
                    ctx.scheduler.schedule(1, Event::Redo(id));
                }
                return;
            }
            self.mshr.block_entry(addr, id);
        }

        if ctx.pool[id].is_non_cacheable() {
            self.router.schedule_req(ctx, id, 0);
            return;
        }

        let (prefetch, signature, pc) = {
            let req = &ctx.pool[id];
            (req.is_prefetch(), req.signature, req.pc)
        };
        let mut idx = self.lookup(&ctx.pool[id]);

        if !self.config.allocate_miss && idx.is_none() {
            let mega_line = prefetch::mega_region(addr) == addr && signature == Signature::MEGA;
            if !mega_line {
                self.router.schedule_req(ctx, id, 0);
                return;
            }
        }

        if self.config.nlp_degree > 0 && !retrying && !prefetch {
            let targets = prefetch::next_line_targets(
                addr,
                self.config.line_size as u64,
                self.config.nlp_distance,
                self.config.nlp_stride,
                self.config.nlp_degree,
            );
            for (degree, target) in targets.into_iter().enumerate() {
                self.try_prefetch(ctx, target, degree as u32, Signature::NEXT_LINE, pc, None);
            }
        }

        if idx.is_some() && prefetch && ctx.pool[id].is_home() {
            // already resident
            self.stats.prefetch_dropped += 1;
            ctx.pool[id].set_dropped();
        }

        if self.config.just_directory && retrying && idx.is_none() {
            idx = Some(self.allocate_line(ctx, addr, id));
        }

        let Some(idx) = idx else {
            log::debug!("{}: {} {}", style(&self.name).cyan(), style("miss").red(), ctx.pool[id]);
            self.must_forward_req_down(ctx, id, true);
            return;
        };

        if self.tags.line(idx).is_prefetch() && !prefetch {
            self.stats.prefetch_useful += 1;
        }
        self.tags.line_mut(idx).set_prefetch(false);

        if self.notify_lower_levels(self.tags.line(idx), &ctx.pool[id]) {
            log::debug!(
                "{}: {} {}",
                style(&self.name).cyan(),
                style("state miss").red(),
                ctx.pool[id]
            );
            self.must_forward_req_down(ctx, id, false);
            return;
        }

        debug_assert!(!ctx.pool[id].has_pending_set_state_ack());
        match self.notify_higher_levels(ctx, idx, id) {
            Notify::Wait => {
                ctx.pool[id].set_retrying();
                return;
            }
            Notify::Drop => {
                self.ports.retire(ctx.scheduler, ctx.pool, id);
                self.drop_prefetch(ctx, id);
                self.retire_mshr(ctx, addr, id);
                return;
            }
            Notify::Done => {}
        }
        if ctx.pool[id].is_dropped() {
            self.ports.retire(ctx.scheduler, ctx.pool, id);
            self.finish_dropped(ctx, id);
            self.retire_mshr(ctx, addr, id);
            return;
        }

        let port = self.router.creator_port(&ctx.pool[id]);
        self.tags.line_mut(idx).adjust_state(&ctx.pool[id], port);

        let now = ctx.now();
        let when = self.ports.req_done(now, &mut ctx.pool[id], retrying);

        if self.config.just_directory {
            if self.tags.line(idx).needs_disp() {
                self.router.send_dirty_disp(ctx, addr, 1);
            }
            self.tags.line_mut(idx).force_invalid();
        }

        if !prefetch {
            let action = ctx.pool[id].action;
            if retrying {
                self.stats.half_miss.inc(action);
            } else {
                self.stats.hit.inc(action);
            }
        }

        log::debug!(
            "{}: {} {} done at {when}: {}",
            style(&self.name).cyan(),
            style("hit").green(),
            ctx.pool[id],
            self.tags.line(idx)
        );

        self.ports.retire(ctx.scheduler, ctx.pool, id);
        if ctx.pool[id].is_home() {
            ctx.pool.ack_at(id, when, ctx.scheduler);
        } else {
            // set states sent to other sharers later must not overtake this ack
            let when = if ctx.pool[id].is_warmup() {
                when
            } else {
                self.in_order_up_message_at(now, when)
            };
            ctx.pool[id].convert_to_req_ack(self.tags.line(idx).req_ack_needs());
            self.router.schedule_req_ack_at(ctx, id, when);
        }
        self.retire_mshr(ctx, addr, id);
    }

    fn do_req_ack(&mut self, ctx: &mut Context<'_>, id: RequestId) {
        ctx.pool[id].recover_action();
        let addr = ctx.pool[id].addr;

        let (dropped, non_cacheable) = {
            let req = &ctx.pool[id];
            (req.is_dropped(), req.is_non_cacheable())
        };
        if !dropped && !non_cacheable {
            let (prefetch, home) = {
                let req = &ctx.pool[id];
                (req.is_prefetch(), req.is_home())
            };
            let mut idx = self.lookup(&ctx.pool[id]);
            match idx {
                None => {
                    let allocate = (!self.config.victim && self.config.allocate_miss)
                        || (!self.config.allocate_miss && home);
                    if allocate {
                        idx = Some(self.allocate_line(ctx, addr, id));
                    }
                }
                Some(idx) => {
                    // a state change was requested from the lower levels
                    self.tags.line_mut(idx).set_prefetch(prefetch);
                    match self.notify_higher_levels(ctx, idx, id) {
                        Notify::Wait => return,
                        Notify::Drop => {
                            self.ports.retire(ctx.scheduler, ctx.pool, id);
                            self.drop_prefetch(ctx, id);
                            self.retire_mshr(ctx, addr, id);
                            return;
                        }
                        Notify::Done => {}
                    }
                }
            }

            if let Some(idx) = idx {
                let port = self.router.creator_port(&ctx.pool[id]);
                let line = self.tags.line_mut(idx);
                line.adjust_state(&ctx.pool[id], port);
                if self.config.just_directory {
                    line.force_invalid();
                }
                log::trace!("{}: filled {:#x}: {}", self.name, addr, line);
            } else {
                debug_assert!(self.config.victim || !self.config.allocate_miss);
            }
        }

        let now = ctx.now();
        let mut when = self.ports.req_ack_done(now, &mut ctx.pool[id]);
        if !ctx.pool[id].is_warmup() {
            when = self.in_order_up_message_at(now, when);
        }

        self.ports.retire(ctx.scheduler, ctx.pool, id);
        if ctx.pool[id].is_home() {
            ctx.pool.ack_at(id, when, ctx.scheduler);
        } else {
            self.router.schedule_req_ack_at(ctx, id, when);
        }
        self.retire_mshr(ctx, addr, id);
    }

    fn do_set_state(&mut self, ctx: &mut Context<'_>, id: RequestId) {
        debug_assert!(!ctx.pool[id].is_home());
        if !self.config.inclusive || !self.config.coherent {
            self.ack_set_state(ctx, id, Action::SET_INVALID, false);
            return;
        }

        let (addr, action) = {
            let req = &ctx.pool[id];
            (req.addr, req.action)
        };
        let idx = self.tags.probe(addr);

        if self.config.victim {
            self.stats.inv_all += 1;
            let delay = self.in_order_up_message(ctx.now(), 0);
            let sent = self.router.send_set_state_all(ctx, id, action, delay);
            if let Some(idx) = idx {
                self.tags.line_mut(idx).invalidate();
            }
            if sent == 0 {
                self.ack_set_state(ctx, id, Action::SET_INVALID, false);
            }
            return;
        }

        let Some(idx) = idx else {
            self.ack_set_state(ctx, id, Action::SET_INVALID, false);
            return;
        };

        let port = self.router.creator_port(&ctx.pool[id]);
        if self.tags.line(idx).sharing_count() > 0 {
            if let Some(port) = port {
                self.tags.line_mut(idx).remove_sharer(port);
            }
            let delay = self.in_order_up_message(ctx.now(), 0);
            let line = self.tags.line(idx);
            let sent = match line.first_sharer() {
                Some(pos) if self.config.directory && line.sharing_count() == 1 => {
                    self.stats.inv_one += 1;
                    self.router.send_set_state_pos(ctx, pos, id, action, delay)
                }
                _ => {
                    self.stats.inv_all += 1;
                    self.router.send_set_state_all(ctx, id, action, delay)
                }
            };
            assert!(sent > 0, "{}: no sharer notified for {}", self.name, ctx.pool[id]);
        } else {
            self.stats.inv_none += 1;
            let line = self.tags.line_mut(idx);
            let needs_disp = line.needs_disp();
            line.adjust_state(&ctx.pool[id], port);
            self.ack_set_state(ctx, id, action, needs_disp);
        }
    }

    fn do_set_state_ack(&mut self, ctx: &mut Context<'_>, id: RequestId) {
        let addr = ctx.pool[id].addr;
        if let Some(idx) = self.tags.probe(addr) {
            let port = self.router.creator_port(&ctx.pool[id]);
            let line = self.tags.line_mut(idx);
            let needs_disp = line.needs_disp();
            line.adjust_state(&ctx.pool[id], port);
            if needs_disp {
                ctx.pool[id].set_needs_disp();
            }
        }

        if ctx.pool[id].is_home() {
            ctx.pool.ack(id, ctx.scheduler);
        } else {
            self.router.schedule_set_state_ack(ctx, id, 1);
        }
    }

    fn do_disp(&mut self, ctx: &mut Context<'_>, id: RequestId) {
        let (addr, prefetch) = {
            let req = &ctx.pool[id];
            (req.addr, req.is_prefetch())
        };
        let mut idx = self.tags.probe(addr);
        if idx.is_none() && self.config.victim && self.config.allocate_miss && !prefetch {
            idx = Some(self.allocate_line(ctx, addr, id));
        }
        if let Some(idx) = idx {
            let port = self.router.creator_port(&ctx.pool[id]);
            self.tags.line_mut(idx).adjust_state(&ctx.pool[id], port);
        }

        if self.config.just_directory {
            if let Some(idx) = idx {
                let line = self.tags.line_mut(idx);
                if line.sharing_count() == 0 {
                    line.invalidate();
                }
            }
            self.router.schedule_disp(ctx, id, 1);
            self.stats.write_back += 1;
        } else if !self.config.allocate_miss && idx.is_none() {
            self.router.schedule_disp(ctx, id, 1);
            self.stats.write_back += 1;
        } else {
            ctx.pool.ack(id, ctx.scheduler);
        }
    }

    fn try_prefetch(
        &mut self,
        ctx: &mut Context<'_>,
        addr: address,
        degree: u32,
        signature: Signature,
        pc: address,
        callback: Option<Callback>,
    ) {
        if addr >> 8 == 0 {
            return;
        }
        self.stats.try_prefetch += 1;

        if self.tags.probe(addr).is_some() {
            self.stats.prefetch_hit_line += 1;
            if let Some(callback) = callback {
                ctx.scheduler.schedule(0, Event::Callback(callback));
            }
            return;
        }
        if !self.mshr.can_issue(addr) {
            self.stats.prefetch_hit_pending += 1;
            return;
        }

        let not_allocating = !self.config.allocate_miss
            && (signature != Signature::MEGA || prefetch::mega_region(addr) != addr);
        let busy = self.ports.is_busy(addr)
            || degree > self.config.prefetch_degree
            || self.config.victim;
        if not_allocating || busy {
            self.stats.prefetch_hit_busy += 1;
            self.router
                .try_prefetch(ctx, addr, degree, signature, pc, callback);
            return;
        }

        self.stats.send_prefetch += 1;
        let mut req = Request::prefetch_read(self.id, addr, signature, degree, ctx.now())
            .with_callback(callback)
            .with_pc(pc);
        req.try_set_top_coherent(self.id);
        log::debug!(
            "{}: {} {}",
            style(&self.name).cyan(),
            style("prefetch").blue(),
            req
        );
        self.ports.start_prefetch(&req);
        let id = ctx.pool.insert(req);
        self.router.schedule_req(ctx, id, 1);
        self.mshr.block_entry(addr, id);
    }

    fn fast_forward_read(&mut self, ctx: &mut Context<'_>, addr: address) -> Cycle {
        if self.tags.lookup(addr, true).is_some() {
            return 1;
        }
        let (idx, _) = self.tags.fill_or_replace(addr);
        let line = self.tags.line_mut(idx);
        *line = Line::allocated(false);
        // other copies are not invalidated
        line.set_exclusive();
        self.router.fast_forward_read(ctx, addr) + 1
    }

    fn fast_forward_write(&mut self, ctx: &mut Context<'_>, addr: address) -> Cycle {
        let idx = match self.tags.lookup(addr, true) {
            Some(idx) => idx,
            None => {
                let (idx, _) = self.tags.fill_or_replace(addr);
                *self.tags.line_mut(idx) = Line::allocated(false);
                idx
            }
        };
        let line = self.tags.line_mut(idx);
        if self.router.is_top_level() {
            line.set_modified();
        } else {
            line.set_exclusive();
        }
        self.router.fast_forward_write(ctx, addr) + 1
    }

    fn is_busy(&self, addr: address) -> bool {
        self.ports.is_busy(addr)
    }

    fn stats(&self) -> Option<stats::Stats> {
        Some(stats::Stats::Cache(self.stats.clone()))
    }
}

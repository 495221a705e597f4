use crate::{
    address, config,
    event::Callback,
    mem_obj::{Context, MemObject, ObjectId},
    request::{Action, RequestId, Signature},
    router::Router,
    stats, Cycle,
};
use std::collections::HashSet;

/// Fixed latency memory at the bottom of the hierarchy.
///
/// Every access hits. With cold misses disabled, the first access to a
/// line completes after a single cycle.
#[derive(Debug)]
pub struct Memory {
    id: ObjectId,
    name: String,
    router: Router,
    delay: Cycle,
    log2_line_size: u32,
    cold_misses: bool,
    /// Lines touched so far, one entry per distinct line of the footprint.
    ///
    /// Only filled when cold misses are disabled.
    warm: HashSet<address>,
    stats: stats::Memory,
}

impl Memory {
    #[must_use]
    pub fn new(id: ObjectId, name: impl Into<String>, config: &config::Memory) -> Self {
        Self {
            id,
            name: name.into(),
            router: Router::new(id),
            delay: config.delay,
            log2_line_size: config.line_size.ilog2(),
            cold_misses: config.cold_misses,
            warm: HashSet::new(),
            stats: stats::Memory::default(),
        }
    }

    /// Distinct lines that already paid their first touch.
    #[must_use]
    pub fn warm_lines(&self) -> usize {
        self.warm.len()
    }

    fn unexpected(&self, ctx: &Context<'_>, req: RequestId) -> ! {
        panic!("{}: memory cannot handle {}", self.name, ctx.pool[req])
    }
}

impl MemObject for Memory {
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

    fn do_req(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        let request = &mut ctx.pool[req];
        let mut delay = self.delay;
        if request.is_warmup() {
            delay = 1;
        }
        if !self.cold_misses && self.warm.insert(request.addr >> self.log2_line_size) {
            delay = 1;
        }
        // zero latency memories still answer in a later cycle
        let delay = delay.max(1);

        self.stats.reads += 1;
        self.stats.total_latency += delay;
        if request.is_home() {
            ctx.pool.ack_after(req, delay, ctx.scheduler);
            return;
        }
        let action = match request.action {
            Action::SET_VALID | Action::SET_EXCLUSIVE => Action::SET_EXCLUSIVE,
            _ => Action::SET_DIRTY,
        };
        request.convert_to_req_ack(action);
        log::trace!("{}: {} in {delay}", self.name, request);
        self.router.schedule_req_ack(ctx, req, delay);
    }

    fn do_req_ack(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        self.unexpected(ctx, req);
    }

    fn do_set_state(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        self.unexpected(ctx, req);
    }

    fn do_set_state_ack(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        self.unexpected(ctx, req);
    }

    fn do_disp(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        self.stats.write_backs += 1;
        ctx.pool.ack_after(req, self.delay.max(1), ctx.scheduler);
    }

    fn try_prefetch(
        &mut self,
        _ctx: &mut Context<'_>,
        _addr: address,
        _degree: u32,
        _signature: Signature,
        _pc: address,
        _callback: Option<Callback>,
    ) {
        // everything is resident
    }

    fn fast_forward_read(&mut self, _ctx: &mut Context<'_>, _addr: address) -> Cycle {
        1
    }

    fn fast_forward_write(&mut self, _ctx: &mut Context<'_>, _addr: address) -> Cycle {
        1
    }

    fn is_busy(&self, _addr: address) -> bool {
        false
    }

    fn stats(&self) -> Option<stats::Stats> {
        Some(stats::Stats::Memory(self.stats.clone()))
    }
}

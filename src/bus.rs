use crate::{
    address, config,
    event::Callback,
    mem_obj::{Context, MemObject, ObjectId},
    port::Port,
    request::{Action, RequestId, Signature},
    router::Router,
    Cycle,
};

/// Shared bus between levels of the hierarchy.
///
/// Requests use the command port, data carrying messages the data port.
/// Set states from below are broadcast to every node above.
#[derive(Debug)]
pub struct Bus {
    id: ObjectId,
    name: String,
    router: Router,
    delay: Cycle,
    data_port: Port,
    cmd_port: Port,
    last_up_msg: Cycle,
}

impl Bus {
    #[must_use]
    pub fn new(id: ObjectId, name: impl Into<String>, config: &config::Bus) -> Self {
        Self {
            id,
            name: name.into(),
            router: Router::new(id),
            delay: config.delay,
            data_port: Port::new(config.port_num, config.port_occ),
            cmd_port: Port::new(config.port_num, 1),
            last_up_msg: 0,
        }
    }

    /// Delay for the next message sent up, so none overtakes an earlier one.
    fn in_order_up(&mut self, now: Cycle, delay: Cycle) -> Cycle {
        let when = (now + delay).max(self.last_up_msg);
        self.last_up_msg = when;
        when - now
    }
}

impl MemObject for Bus {
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
        let delay = self.cmd_port.next_slot_delta(ctx.now()) + self.delay;
        log::trace!("{}: forward {} in {delay}", self.name, ctx.pool[req]);
        self.router.schedule_req(ctx, req, delay);
    }

    fn do_req_ack(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        let delay = self.data_port.next_slot_delta(ctx.now()) + self.delay;
        if ctx.pool[req].is_home() {
            let when = ctx.now() + delay;
            ctx.pool.ack_at(req, when, ctx.scheduler);
            return;
        }
        let delay = self.in_order_up(ctx.now(), delay);
        self.router.schedule_req_ack(ctx, req, delay);
    }

    fn do_set_state(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        if self.router.is_top_level() {
            // nothing above can share the line
            ctx.pool[req].convert_to_set_state_ack(Action::SET_INVALID, false);
            self.router.schedule_set_state_ack(ctx, req, 1);
            return;
        }
        let action = ctx.pool[req].action;
        let delay = self.in_order_up(ctx.now(), self.delay);
        self.router.send_set_state_all(ctx, req, action, delay);
    }

    fn do_set_state_ack(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        if ctx.pool[req].is_home() {
            ctx.pool.ack(req, ctx.scheduler);
            return;
        }
        self.router.schedule_set_state_ack(ctx, req, self.delay);
    }

    fn do_disp(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        let delay = self.data_port.next_slot_delta(ctx.now()) + self.delay;
        self.router.schedule_disp(ctx, req, delay);
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
        self.router
            .try_prefetch(ctx, addr, degree, signature, pc, callback);
    }

    fn fast_forward_read(&mut self, _ctx: &mut Context<'_>, _addr: address) -> Cycle {
        self.delay
    }

    fn fast_forward_write(&mut self, _ctx: &mut Context<'_>, _addr: address) -> Cycle {
        self.delay
    }

    fn is_busy(&self, _addr: address) -> bool {
        false
    }
}

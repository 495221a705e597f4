use crate::{
    address,
    event::{Callback, Event},
    mem_obj::{Context, ObjectId},
    request::{Action, Request, RequestId, Signature},
    Cycle,
};
use std::collections::HashMap;

/// Links of a memory object to its neighbours.
///
/// `up` neighbours are closer to the cores, `down` neighbours closer to
/// memory. The route table maps every object above this one to the `up`
/// position leading to it.
#[derive(Debug, Clone)]
pub struct Router {
    id: ObjectId,
    up: Vec<ObjectId>,
    down: Vec<ObjectId>,
    up_map: HashMap<ObjectId, usize>,
}

impl Router {
    #[must_use]
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            up: Vec::new(),
            down: Vec::new(),
            up_map: HashMap::new(),
        }
    }

    pub fn add_up_node(&mut self, node: ObjectId) -> usize {
        self.up.push(node);
        self.up.len() - 1
    }

    pub fn add_down_node(&mut self, node: ObjectId) {
        self.down.push(node);
    }

    /// Records that `node` is reached through up position `pos`.
    pub fn add_route(&mut self, node: ObjectId, pos: usize) {
        assert!(pos < self.up.len());
        self.up_map.entry(node).or_insert(pos);
    }

    #[must_use]
    pub fn up_nodes(&self) -> &[ObjectId] {
        &self.up
    }

    #[must_use]
    pub fn down_nodes(&self) -> &[ObjectId] {
        &self.down
    }

    #[inline]
    #[must_use]
    pub fn is_top_level(&self) -> bool {
        self.up.is_empty()
    }

    /// Up position leading to the creator of the request.
    #[must_use]
    pub fn creator_port(&self, req: &Request) -> Option<usize> {
        self.up_map.get(&req.creator).copied()
    }

    fn down_node(&self) -> ObjectId {
        match self.down.first() {
            Some(node) => *node,
            None => panic!("{} has no lower level", self.id),
        }
    }

    fn route_to(&self, node: ObjectId) -> ObjectId {
        match self.up_map.get(&node) {
            Some(&pos) => self.up[pos],
            None => panic!("{} has no route to {}", self.id, node),
        }
    }

    fn start(ctx: &mut Context<'_>, next: ObjectId, id: RequestId, when: Cycle) {
        ctx.pool[id].set_next_hop(next);
        ctx.scheduler.schedule_at(when, Event::Start(id));
    }

    pub fn schedule_req(&self, ctx: &mut Context<'_>, id: RequestId, delay: Cycle) {
        let when = ctx.now() + delay;
        Self::start(ctx, self.down_node(), id, when);
    }

    pub fn schedule_req_pos(&self, ctx: &mut Context<'_>, pos: usize, id: RequestId, delay: Cycle) {
        let when = ctx.now() + delay;
        Self::start(ctx, self.down[pos], id, when);
    }

    /// Sends the ack towards the home node of the request.
    pub fn schedule_req_ack(&self, ctx: &mut Context<'_>, id: RequestId, delay: Cycle) {
        let when = ctx.now() + delay;
        self.schedule_req_ack_at(ctx, id, when);
    }

    pub fn schedule_req_ack_at(&self, ctx: &mut Context<'_>, id: RequestId, when: Cycle) {
        let next = self.route_to(ctx.pool[id].home);
        Self::start(ctx, next, id, when);
    }

    pub fn schedule_req_ack_pos(
        &self,
        ctx: &mut Context<'_>,
        pos: usize,
        id: RequestId,
        delay: Cycle,
    ) {
        let when = ctx.now() + delay;
        Self::start(ctx, self.up[pos], id, when);
    }

    pub fn schedule_set_state_ack(&self, ctx: &mut Context<'_>, id: RequestId, delay: Cycle) {
        let when = ctx.now() + delay;
        Self::start(ctx, self.down_node(), id, when);
    }

    pub fn schedule_disp(&self, ctx: &mut Context<'_>, id: RequestId, delay: Cycle) {
        let when = ctx.now() + delay;
        Self::start(ctx, self.down_node(), id, when);
    }

    pub fn send_dirty_disp(&self, ctx: &mut Context<'_>, addr: address, delay: Cycle) {
        let down = self.down_node();
        let id = ctx
            .pool
            .insert(Request::dirty_disp(down, self.id, addr, ctx.now()));
        ctx.scheduler.schedule(delay, Event::Start(id));
    }

    pub fn send_clean_disp(
        &self,
        ctx: &mut Context<'_>,
        addr: address,
        prefetch: bool,
        delay: Cycle,
    ) {
        let down = self.down_node();
        let id = ctx
            .pool
            .insert(Request::clean_disp(down, self.id, addr, prefetch, ctx.now()));
        ctx.scheduler.schedule(delay, Event::Start(id));
    }

    /// Sends a set state for `orig` to the up neighbour at `pos`.
    fn send_set_state(
        &self,
        ctx: &mut Context<'_>,
        pos: usize,
        orig: RequestId,
        action: Action,
        delay: Cycle,
    ) {
        let addr = ctx.pool[orig].addr;
        let child = Request::set_state(self.id, self.id, action, addr, ctx.now());
        let child = ctx.pool.insert(child);
        ctx.pool.add_pending_set_state_ack(orig, child);
        self.schedule_set_state(ctx, pos, child, delay);
    }

    /// Sends an existing set state to the up neighbour at `pos`.
    pub fn schedule_set_state(&self, ctx: &mut Context<'_>, pos: usize, id: RequestId, delay: Cycle) {
        let when = ctx.now() + delay;
        Self::start(ctx, self.up[pos], id, when);
    }

    /// Sends a set state to every up neighbour.
    pub fn send_set_state_all(
        &self,
        ctx: &mut Context<'_>,
        orig: RequestId,
        action: Action,
        delay: Cycle,
    ) -> usize {
        for pos in 0..self.up.len() {
            self.send_set_state(ctx, pos, orig, action, delay);
        }
        self.up.len()
    }

    /// Sends a set state to every up neighbour except the one leading to the creator.
    pub fn send_set_state_others(
        &self,
        ctx: &mut Context<'_>,
        orig: RequestId,
        action: Action,
        delay: Cycle,
    ) -> usize {
        let creator_port = self.creator_port(&ctx.pool[orig]);
        let mut sent = 0;
        for pos in 0..self.up.len() {
            if Some(pos) == creator_port {
                continue;
            }
            self.send_set_state(ctx, pos, orig, action, delay);
            sent += 1;
        }
        sent
    }

    /// Sends a set state to the up neighbour at `pos`, unless it leads to the creator.
    pub fn send_set_state_pos(
        &self,
        ctx: &mut Context<'_>,
        pos: usize,
        orig: RequestId,
        action: Action,
        delay: Cycle,
    ) -> usize {
        if Some(pos) == self.creator_port(&ctx.pool[orig]) {
            return 0;
        }
        self.send_set_state(ctx, pos, orig, action, delay);
        1
    }

    pub fn try_prefetch(
        &self,
        ctx: &mut Context<'_>,
        addr: address,
        degree: u32,
        signature: Signature,
        pc: address,
        callback: Option<Callback>,
    ) {
        // without a lower level the prefetch is dropped
        if let Some(down) = self.down.first() {
            let object = ctx.object(*down);
            let mut object = object.try_lock();
            object.try_prefetch(ctx, addr, degree, signature, pc, callback);
        }
    }

    pub fn fast_forward_read(&self, ctx: &mut Context<'_>, addr: address) -> Cycle {
        match self.down.first() {
            Some(down) => {
                let object = ctx.object(*down);
                let mut object = object.try_lock();
                object.fast_forward_read(ctx, addr)
            }
            None => 0,
        }
    }

    pub fn fast_forward_write(&self, ctx: &mut Context<'_>, addr: address) -> Cycle {
        match self.down.first() {
            Some(down) => {
                let object = ctx.object(*down);
                let mut object = object.try_lock();
                object.fast_forward_write(ctx, addr)
            }
            None => 0,
        }
    }

    #[must_use]
    pub fn is_busy_pos(&self, ctx: &Context<'_>, pos: usize, addr: address) -> bool {
        let object = ctx.object(self.down[pos]);
        let object = object.try_lock();
        object.is_busy(addr)
    }
}

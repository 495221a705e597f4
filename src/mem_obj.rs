use crate::{
    address,
    event::{Callback, Event, Scheduler},
    request::{Action, Kind, Pool, RequestId, Signature},
    router::Router,
    stats::Stats,
    sync::{Arc, Mutex},
    Cycle,
};
use serde::{Deserialize, Serialize};

/// Index of a memory object in the hierarchy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ObjectId(pub usize);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj{}", self.0)
    }
}

pub type Object = Arc<Mutex<dyn MemObject>>;

/// Simulation state handed to every memory object operation.
pub struct Context<'a> {
    pub scheduler: &'a mut Scheduler,
    pub pool: &'a mut Pool,
    pub objects: &'a [Object],
}

impl<'a> Context<'a> {
    #[inline]
    #[must_use]
    pub fn now(&self) -> Cycle {
        self.scheduler.now()
    }

    #[must_use]
    pub fn object(&self, id: ObjectId) -> Object {
        Arc::clone(&self.objects[id.0])
    }
}

/// A node of the memory hierarchy.
///
/// Entry points receive messages routed to the object. Handlers (`do_*`)
/// run once the object is ready to process them. Objects without timing
/// of their own forward entry points to the handlers directly.
pub trait MemObject: std::fmt::Debug + Send {
    fn id(&self) -> ObjectId;

    fn name(&self) -> &str;

    fn router(&self) -> &Router;

    fn router_mut(&mut self) -> &mut Router;

    fn request(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        self.do_req(ctx, req);
    }

    fn request_ack(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        self.do_req_ack(ctx, req);
    }

    fn set_state(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        self.do_set_state(ctx, req);
    }

    fn set_state_ack(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        self.do_set_state_ack(ctx, req);
    }

    fn displace(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        self.do_disp(ctx, req);
    }

    fn do_req(&mut self, ctx: &mut Context<'_>, req: RequestId);

    fn do_req_ack(&mut self, ctx: &mut Context<'_>, req: RequestId);

    fn do_set_state(&mut self, ctx: &mut Context<'_>, req: RequestId);

    fn do_set_state_ack(&mut self, ctx: &mut Context<'_>, req: RequestId);

    fn do_disp(&mut self, ctx: &mut Context<'_>, req: RequestId);

    fn try_prefetch(
        &mut self,
        ctx: &mut Context<'_>,
        addr: address,
        degree: u32,
        signature: Signature,
        pc: address,
        callback: Option<Callback>,
    );

    /// Installs the line without timing and returns the latency it would have taken.
    fn fast_forward_read(&mut self, ctx: &mut Context<'_>, addr: address) -> Cycle;

    fn fast_forward_write(&mut self, ctx: &mut Context<'_>, addr: address) -> Cycle;

    fn is_busy(&self, addr: address) -> bool;

    fn stats(&self) -> Option<Stats> {
        None
    }
}

/// Runs a scheduled message event on the object that currently holds the request.
pub fn dispatch(ctx: &mut Context<'_>, event: Event) {
    match event {
        Event::Callback(callback) => callback.call(ctx.now()),
        Event::Start(id) => {
            let req = &ctx.pool[id];
            let (target, kind) = (req.current, req.kind);
            let object = ctx.object(target);
            let mut object = object.try_lock();
            log::trace!("{}: start {}", object.name(), ctx.pool[id]);
            match kind {
                Kind::REQ => object.request(ctx, id),
                Kind::REQ_ACK => object.request_ack(ctx, id),
                Kind::SET_STATE => object.set_state(ctx, id),
                Kind::SET_STATE_ACK => object.set_state_ack(ctx, id),
                Kind::DISP => object.displace(ctx, id),
            }
        }
        Event::Redo(id) => {
            let req = &ctx.pool[id];
            let (target, kind) = (req.current, req.kind);
            let object = ctx.object(target);
            let mut object = object.try_lock();
            match kind {
                Kind::REQ => object.do_req(ctx, id),
                Kind::REQ_ACK => object.do_req_ack(ctx, id),
                Kind::SET_STATE => object.do_set_state(ctx, id),
                Kind::SET_STATE_ACK => object.do_set_state_ack(ctx, id),
                Kind::DISP => object.do_disp(ctx, id),
            }
        }
    }
}

/// Null memory object that completes everything it receives.
#[derive(Debug)]
pub struct Dummy {
    id: ObjectId,
    name: String,
    router: Router,
}

impl Dummy {
    #[must_use]
    pub fn new(id: ObjectId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            router: Router::new(id),
        }
    }

    fn complete(&self, ctx: &mut Context<'_>, id: RequestId) {
        let req = &mut ctx.pool[id];
        if req.is_home() {
            ctx.pool.ack(id, ctx.scheduler);
            return;
        }
        match req.kind {
            Kind::REQ => {
                req.convert_to_req_ack(Action::SET_EXCLUSIVE);
                self.router.schedule_req_ack(ctx, id, 1);
            }
            Kind::SET_STATE => {
                req.convert_to_set_state_ack(Action::SET_INVALID, false);
                self.router.schedule_set_state_ack(ctx, id, 1);
            }
            _ => ctx.pool.ack(id, ctx.scheduler),
        }
    }
}

impl MemObject for Dummy {
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
        self.complete(ctx, req);
    }

    fn do_req_ack(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        self.complete(ctx, req);
    }

    fn do_set_state(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        self.complete(ctx, req);
    }

    fn do_set_state_ack(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        self.complete(ctx, req);
    }

    fn do_disp(&mut self, ctx: &mut Context<'_>, req: RequestId) {
        self.complete(ctx, req);
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
    }

    fn fast_forward_read(&mut self, _ctx: &mut Context<'_>, _addr: address) -> Cycle {
        0
    }

    fn fast_forward_write(&mut self, _ctx: &mut Context<'_>, _addr: address) -> Cycle {
        0
    }

    fn is_busy(&self, _addr: address) -> bool {
        false
    }
}

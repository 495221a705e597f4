use crate::{
    address,
    event::{Callback, Event, Scheduler},
    mem_obj::ObjectId,
    Cycle,
};
use serde::{Deserialize, Serialize};

/// Message kind.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::EnumIter,
    strum::EnumCount,
    strum::Display,
    Serialize,
    Deserialize,
)]
pub enum Kind {
    REQ,
    REQ_ACK,
    SET_STATE,
    SET_STATE_ACK,
    DISP,
}

/// Coherence action carried by a message.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::EnumIter,
    strum::EnumCount,
    strum::Display,
    Serialize,
    Deserialize,
)]
pub enum Action {
    SET_INVALID,
    SET_VALID,
    SET_DIRTY,
    SET_SHARED,
    SET_EXCLUSIVE,
    MMU,
    VPC_WRITE_UPDATE,
}

/// Source of a prefetch.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, strum::Display, Serialize, Deserialize,
)]
pub enum Signature {
    #[default]
    NONE,
    NEXT_LINE,
    STRIDE,
    MEGA,
}

/// A memory transaction.
///
/// The same record travels through the hierarchy and is mutated in place,
/// e.g. a `REQ` is turned into its `REQ_ACK` by the level that serves it.
#[derive(Debug)]
pub struct Request {
    pub uid: u64,
    pub addr: address,
    pub kind: Kind,
    pub action: Action,
    pub orig_action: Action,

    pub creator: ObjectId,
    pub home: ObjectId,
    pub top_coherent: Option<ObjectId>,
    pub current: ObjectId,
    pub prev: Option<ObjectId>,
    first_cache: Option<(ObjectId, Action)>,

    pending_set_state_acks: usize,
    set_state_ack_orig: Option<RequestId>,

    pub start: Cycle,
    pub pc: address,
    pub signature: Signature,
    pub degree: u32,

    prefetch: bool,
    dropped: bool,
    retrying: bool,
    needs_disp: bool,
    warmup: bool,
    non_cacheable: bool,

    callback: Option<Callback>,
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({}@{:#x}",
            self.kind, self.action, self.addr
        )?;
        if self.prefetch {
            f.write_str(",pf")?;
        }
        if self.dropped {
            f.write_str(",dropped")?;
        }
        if self.retrying {
            f.write_str(",retry")?;
        }
        write!(f, ")#{}", self.uid)
    }
}

impl Request {
    fn new(obj: ObjectId, addr: address, action: Action, now: Cycle) -> Self {
        Self {
            uid: 0,
            addr,
            kind: Kind::REQ,
            action,
            orig_action: action,
            creator: obj,
            home: obj,
            top_coherent: None,
            current: obj,
            prev: None,
            first_cache: None,
            pending_set_state_acks: 0,
            set_state_ack_orig: None,
            start: now,
            pc: 0,
            signature: Signature::NONE,
            degree: 0,
            prefetch: false,
            dropped: false,
            retrying: false,
            needs_disp: false,
            warmup: false,
            non_cacheable: false,
            callback: None,
        }
    }

    #[must_use]
    pub fn with_callback(mut self, callback: Option<Callback>) -> Self {
        self.callback = callback;
        self
    }

    #[must_use]
    pub fn with_pc(mut self, pc: address) -> Self {
        self.pc = pc;
        self
    }

    #[must_use]
    pub fn read(obj: ObjectId, addr: address, now: Cycle) -> Self {
        Self::new(obj, addr, Action::SET_VALID, now)
    }

    #[must_use]
    pub fn write(obj: ObjectId, addr: address, now: Cycle) -> Self {
        Self::new(obj, addr, Action::SET_DIRTY, now)
    }

    #[must_use]
    pub fn prefetch_read(
        obj: ObjectId,
        addr: address,
        signature: Signature,
        degree: u32,
        now: Cycle,
    ) -> Self {
        let mut req = Self::new(obj, addr, Action::SET_VALID, now);
        req.prefetch = true;
        req.signature = signature;
        req.degree = degree;
        req
    }

    #[must_use]
    pub fn non_cacheable_read(obj: ObjectId, addr: address, now: Cycle) -> Self {
        let mut req = Self::read(obj, addr, now);
        req.non_cacheable = true;
        req
    }

    #[must_use]
    pub fn non_cacheable_write(obj: ObjectId, addr: address, now: Cycle) -> Self {
        let mut req = Self::write(obj, addr, now);
        req.non_cacheable = true;
        req
    }

    #[must_use]
    pub fn warmup_read(obj: ObjectId, addr: address, now: Cycle) -> Self {
        let mut req = Self::read(obj, addr, now);
        req.warmup = true;
        req
    }

    #[must_use]
    pub fn warmup_write(obj: ObjectId, addr: address, now: Cycle) -> Self {
        let mut req = Self::write(obj, addr, now);
        req.warmup = true;
        req
    }

    /// Writeback of a modified line evicted by `creator`, delivered to `obj`.
    #[must_use]
    pub fn dirty_disp(obj: ObjectId, creator: ObjectId, addr: address, now: Cycle) -> Self {
        let mut req = Self::new(obj, addr, Action::SET_DIRTY, now);
        req.kind = Kind::DISP;
        req.creator = creator;
        req.top_coherent = Some(creator);
        req
    }

    /// Notice that `creator` dropped a clean line.
    #[must_use]
    pub fn clean_disp(
        obj: ObjectId,
        creator: ObjectId,
        addr: address,
        prefetch: bool,
        now: Cycle,
    ) -> Self {
        let mut req = Self::new(obj, addr, Action::SET_VALID, now);
        req.kind = Kind::DISP;
        req.prefetch = prefetch;
        req.creator = creator;
        req.top_coherent = Some(creator);
        req
    }

    #[must_use]
    pub fn set_state(
        obj: ObjectId,
        creator: ObjectId,
        action: Action,
        addr: address,
        now: Cycle,
    ) -> Self {
        let mut req = Self::new(obj, addr, action, now);
        req.kind = Kind::SET_STATE;
        req.creator = creator;
        req
    }

    /// Moves the request to its next hop.
    pub fn set_next_hop(&mut self, next: ObjectId) {
        self.prev = Some(self.current);
        self.current = next;
    }

    #[inline]
    #[must_use]
    pub fn is_home(&self) -> bool {
        self.home == self.current
    }

    #[inline]
    #[must_use]
    pub fn is_top_coherent(&self) -> bool {
        self.top_coherent == Some(self.current)
    }

    pub fn try_set_top_coherent(&mut self, obj: ObjectId) {
        if self.top_coherent.is_none() {
            self.top_coherent = Some(obj);
        }
    }

    /// Promotes the action while the request travels down.
    ///
    /// Only the first level that promotes records the action it replaced.
    pub fn adjust_action(&mut self, action: Action) {
        if self.first_cache.is_some() {
            return;
        }
        assert_eq!(self.kind, Kind::REQ, "only requests can be promoted: {self}");
        assert_eq!(action, Action::SET_EXCLUSIVE);
        self.first_cache = Some((self.current, self.action));
        self.action = action;
    }

    /// Restores the action replaced by `adjust_action` at the level that promoted it.
    pub fn recover_action(&mut self) {
        assert!(
            self.kind == Kind::REQ_ACK || self.prefetch,
            "recovering action of {self}"
        );
        if let Some((cache, action)) = self.first_cache {
            if cache == self.current {
                self.first_cache = None;
                self.action = action;
            }
        }
    }

    pub fn force_action(&mut self, action: Action) {
        self.action = action;
    }

    pub fn convert_to_req_ack(&mut self, action: Action) {
        assert_eq!(self.kind, Kind::REQ, "cannot ack {self}");
        self.kind = Kind::REQ_ACK;
        self.action = action;
    }

    pub fn convert_to_set_state_ack(&mut self, action: Action, needs_disp: bool) {
        assert_eq!(self.kind, Kind::SET_STATE, "cannot ack {self}");
        self.kind = Kind::SET_STATE_ACK;
        self.action = action;
        self.creator = self.current;
        self.needs_disp = needs_disp;
    }

    pub fn set_dropped(&mut self) {
        assert!(self.prefetch, "only prefetches can be dropped: {self}");
        self.dropped = true;
    }

    pub fn set_needs_disp(&mut self) {
        assert_eq!(self.kind, Kind::SET_STATE_ACK);
        self.needs_disp = true;
    }

    pub fn set_retrying(&mut self) {
        self.retrying = true;
    }

    pub fn clear_retrying(&mut self) {
        self.retrying = false;
    }

    #[inline]
    #[must_use]
    pub fn is_prefetch(&self) -> bool {
        self.prefetch
    }

    #[inline]
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    #[inline]
    #[must_use]
    pub fn is_retrying(&self) -> bool {
        self.retrying
    }

    #[inline]
    #[must_use]
    pub fn is_warmup(&self) -> bool {
        self.warmup
    }

    #[inline]
    #[must_use]
    pub fn is_non_cacheable(&self) -> bool {
        self.non_cacheable
    }

    #[inline]
    #[must_use]
    pub fn needs_disp(&self) -> bool {
        self.needs_disp
    }

    /// Set state ack that must leave the home line modified.
    #[must_use]
    pub fn is_set_state_ack_disp(&self) -> bool {
        self.kind == Kind::SET_STATE_ACK && self.needs_disp
    }

    #[must_use]
    pub fn has_pending_set_state_ack(&self) -> bool {
        self.pending_set_state_acks > 0
    }
}

/// Generation checked handle to a pooled [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    index: u32,
    generation: u32,
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    request: Option<Request>,
}

/// Pool of in-flight requests.
///
/// Slots are reused once a request is acked. Every reuse bumps the slot
/// generation, so a handle kept past its `ack` panics on access.
#[derive(Debug, Default)]
pub struct Pool {
    slots: Vec<Slot>,
    free: Vec<usize>,
    next_uid: u64,
    live: usize,
}

impl std::ops::Index<RequestId> for Pool {
    type Output = Request;

    fn index(&self, id: RequestId) -> &Self::Output {
        match self.get(id) {
            Some(req) => req,
            None => panic!("stale request handle {id}"),
        }
    }
}

impl std::ops::IndexMut<RequestId> for Pool {
    fn index_mut(&mut self, id: RequestId) -> &mut Self::Output {
        match self.get_mut(id) {
            Some(req) => req,
            None => panic!("stale request handle {id}"),
        }
    }
}

impl Pool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mut req: Request) -> RequestId {
        req.uid = self.next_uid;
        self.next_uid += 1;
        self.live += 1;

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        debug_assert!(slot.request.is_none());
        slot.request = Some(req);
        RequestId {
            index: index as u32,
            generation: slot.generation,
        }
    }

    #[must_use]
    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.request.as_ref())
    }

    #[must_use]
    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.request.as_mut())
    }

    #[must_use]
    pub fn contains(&self, id: RequestId) -> bool {
        self.get(id).is_some()
    }

    /// Number of requests in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn remove(&mut self, id: RequestId) -> Request {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.request.is_some());
        let Some(slot) = slot else {
            panic!("request {id} acked twice");
        };
        let req = slot.request.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index as usize);
        self.live -= 1;
        match req {
            Some(req) => req,
            None => unreachable!(),
        }
    }

    /// Links `child` to the request waiting for its set state ack.
    pub fn add_pending_set_state_ack(&mut self, orig: RequestId, child: RequestId) {
        self[orig].pending_set_state_acks += 1;
        self[child].set_state_ack_orig = Some(orig);
    }

    /// Terminates the request in the current cycle.
    pub fn ack(&mut self, id: RequestId, scheduler: &mut Scheduler) {
        let now = scheduler.now();
        self.ack_at(id, now, scheduler);
    }

    pub fn ack_after(&mut self, id: RequestId, delay: Cycle, scheduler: &mut Scheduler) {
        assert!(delay > 0);
        let when = scheduler.now() + delay;
        self.ack_at(id, when, scheduler);
    }

    /// Terminates the request and returns it to the pool.
    ///
    /// The continuation runs at `when`, unless the request was dropped.
    pub fn ack_at(&mut self, id: RequestId, when: Cycle, scheduler: &mut Scheduler) {
        let req = self.remove(id);
        log::trace!("ack {} at {}", req, when);

        if let Some(callback) = req.callback {
            if !req.dropped {
                scheduler.schedule_at(when, Event::Callback(callback));
            }
        }
        if req.kind == Kind::SET_STATE_ACK {
            if let Some(orig) = req.set_state_ack_orig {
                self.set_state_ack_done(orig, req.needs_disp, when, scheduler);
            }
        }
    }

    fn set_state_ack_done(
        &mut self,
        id: RequestId,
        needs_disp: bool,
        when: Cycle,
        scheduler: &mut Scheduler,
    ) {
        let orig = &mut self[id];
        assert!(orig.pending_set_state_acks > 0, "unexpected ack for {orig}");
        orig.pending_set_state_acks -= 1;
        orig.needs_disp |= needs_disp;
        if orig.pending_set_state_acks > 0 {
            return;
        }
        match orig.kind {
            Kind::REQ | Kind::REQ_ACK => {}
            Kind::SET_STATE => {
                let (action, needs_disp) = (orig.action, orig.needs_disp);
                orig.convert_to_set_state_ack(action, needs_disp);
            }
            Kind::SET_STATE_ACK | Kind::DISP => {
                panic!("{orig} cannot wait for set state acks")
            }
        }
        scheduler.schedule_at(when, Event::Redo(id));
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, Kind, Pool, Request};
    use crate::{
        event::{Callback, Event, Scheduler},
        mem_obj::ObjectId,
        sync::{Arc, Mutex},
    };
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    const L1: ObjectId = ObjectId(0);
    const L2: ObjectId = ObjectId(1);

    #[test]
    fn adjust_then_recover_restores_action() {
        let mut req = Request::write(L1, 0x100, 0);
        req.set_next_hop(L2);
        req.adjust_action(Action::SET_EXCLUSIVE);
        diff::assert_eq!(req.action, Action::SET_EXCLUSIVE);

        req.convert_to_req_ack(Action::SET_EXCLUSIVE);
        // recovering at another level leaves the action alone
        req.set_next_hop(ObjectId(2));
        req.recover_action();
        diff::assert_eq!(req.action, Action::SET_EXCLUSIVE);

        req.set_next_hop(L2);
        req.recover_action();
        diff::assert_eq!(req.action, Action::SET_DIRTY);
        req.recover_action();
        diff::assert_eq!(req.action, Action::SET_DIRTY);
    }

    #[test]
    fn only_first_promotion_is_recorded() {
        let mut req = Request::write(L1, 0x100, 0);
        req.adjust_action(Action::SET_EXCLUSIVE);
        req.set_next_hop(L2);
        req.adjust_action(Action::SET_EXCLUSIVE);
        req.convert_to_req_ack(Action::SET_SHARED);
        req.recover_action();
        diff::assert_eq!(req.action, Action::SET_SHARED);
    }

    #[test]
    fn set_state_ack_conversion_moves_creator() {
        let mut req = Request::set_state(L2, L2, Action::SET_INVALID, 0x40, 0);
        req.set_next_hop(L1);
        req.convert_to_set_state_ack(Action::SET_INVALID, true);
        diff::assert_eq!(req.kind, Kind::SET_STATE_ACK);
        diff::assert_eq!(req.creator, L1);
        assert!(req.is_set_state_ack_disp());
    }

    #[test]
    #[should_panic(expected = "only prefetches")]
    fn demand_requests_cannot_be_dropped() {
        Request::read(L1, 0x100, 0).set_dropped();
    }

    #[test]
    fn ack_schedules_callback_and_recycles_slot() -> eyre::Result<()> {
        let done = Arc::new(Mutex::new(None));
        let mut pool = Pool::new();
        let mut scheduler = Scheduler::new();

        let callback = {
            let done = Arc::clone(&done);
            Callback::new(move |cycle| *done.lock() = Some(cycle))
        };
        let id = pool.insert(Request::read(L1, 0x100, 0).with_callback(Some(callback)));
        diff::assert_eq!(pool.len(), 1);
        pool.ack_after(id, 4, &mut scheduler);
        diff::assert_eq!(pool.len(), 0);
        assert!(!pool.contains(id));

        let (cycle, event) = scheduler.pop().ok_or(eyre::eyre!("no callback"))?;
        match event {
            Event::Callback(callback) => callback.call(cycle),
            other => eyre::bail!("expected callback, got {other:?}"),
        }
        diff::assert_eq!(*done.lock(), Some(4));

        let reused = pool.insert(Request::read(L1, 0x200, 0));
        assert_ne!(reused, id);
        Ok(())
    }

    #[test]
    fn dropped_prefetch_discards_callback() {
        let mut pool = Pool::new();
        let mut scheduler = Scheduler::new();
        let mut req = Request::prefetch_read(L1, 0x1000, super::Signature::NEXT_LINE, 0, 0)
            .with_callback(Some(Callback::new(|_| panic!("must not run"))));
        req.set_dropped();
        let id = pool.insert(req);
        pool.ack(id, &mut scheduler);
        assert!(scheduler.is_empty());
    }

    #[test]
    #[should_panic(expected = "acked twice")]
    fn double_ack_panics() {
        let mut pool = Pool::new();
        let mut scheduler = Scheduler::new();
        let id = pool.insert(Request::read(L1, 0x100, 0));
        pool.ack(id, &mut scheduler);
        pool.ack(id, &mut scheduler);
    }

    #[test]
    fn last_set_state_ack_resumes_waiting_request() -> eyre::Result<()> {
        let mut pool = Pool::new();
        let mut scheduler = Scheduler::new();

        let mut orig = Request::set_state(L1, L1, Action::SET_INVALID, 0x40, 0);
        orig.set_next_hop(L2);
        let orig = pool.insert(orig);

        let mut children = Vec::new();
        for _ in 0..2 {
            let mut child = Request::set_state(L2, L2, Action::SET_INVALID, 0x40, 0);
            child.set_next_hop(ObjectId(3));
            let child = pool.insert(child);
            pool.add_pending_set_state_ack(orig, child);
            children.push(child);
        }

        pool[children[0]].convert_to_set_state_ack(Action::SET_INVALID, true);
        pool[children[0]].set_next_hop(L2);
        pool.ack(children[0], &mut scheduler);
        assert!(scheduler.is_empty());
        assert!(pool[orig].has_pending_set_state_ack());

        pool[children[1]].convert_to_set_state_ack(Action::SET_INVALID, false);
        pool[children[1]].set_next_hop(L2);
        pool.ack(children[1], &mut scheduler);

        let (_, event) = scheduler.pop().ok_or(eyre::eyre!("orig not resumed"))?;
        assert!(matches!(event, Event::Redo(id) if id == orig));
        diff::assert_eq!(pool[orig].kind, Kind::SET_STATE_ACK);
        diff::assert_eq!(pool[orig].creator, L2);
        assert!(pool[orig].needs_disp());
        Ok(())
    }
}

use crate::{
    request::{Action, Kind, Request},
    tag_array,
};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Once this many sharers are recorded, the line can only be invalidated by broadcast.
pub const MAX_SHARERS: usize = 64;

#[derive(
    Debug, Default, Clone, Copy, Hash, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
pub enum State {
    MODIFIED,
    EXCLUSIVE,
    SHARED,
    #[default]
    INVALID,
}

/// Coherence state of a cache line.
///
/// `share_state` summarizes what the caches above hold, `sharers` are the
/// up positions holding a copy.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Line {
    state: State,
    share_state: State,
    sharers: SmallVec<[usize; 8]>,
    prefetch: bool,
    allocated: bool,
}

impl tag_array::Block for Line {
    fn is_allocated(&self) -> bool {
        self.allocated
    }

    fn is_valid(&self) -> bool {
        self.is_valid()
    }
}

impl std::fmt::Display for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(share={}, sharers={:?}{})",
            self.state,
            self.share_state,
            self.sharers.as_slice(),
            if self.prefetch { ", pf" } else { "" }
        )
    }
}

impl Line {
    /// Freshly allocated line, invalid until the first state adjustment.
    #[must_use]
    pub fn allocated(prefetch: bool) -> Self {
        Self {
            prefetch,
            allocated: true,
            ..Self::default()
        }
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    #[must_use]
    pub fn share_state(&self) -> State {
        self.share_state
    }

    pub fn set_exclusive(&mut self) {
        self.state = State::EXCLUSIVE;
    }

    pub fn set_modified(&mut self) {
        self.state = State::MODIFIED;
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state != State::INVALID || self.share_state != State::INVALID
    }

    #[inline]
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.state == State::SHARED
    }

    /// Dirty lines are written back when displaced.
    #[inline]
    #[must_use]
    pub fn needs_disp(&self) -> bool {
        self.state == State::MODIFIED
    }

    #[inline]
    #[must_use]
    pub fn is_prefetch(&self) -> bool {
        self.prefetch
    }

    pub fn set_prefetch(&mut self, prefetch: bool) {
        self.prefetch = prefetch;
    }

    /// Drops the local data but keeps the tag and sharer information.
    pub fn force_invalid(&mut self) {
        self.state = State::INVALID;
    }

    /// Releases the line.
    pub fn invalidate(&mut self) {
        self.state = State::INVALID;
        self.share_state = State::INVALID;
        self.sharers.clear();
        self.allocated = false;
    }

    pub fn clear_sharing(&mut self) {
        self.sharers.clear();
    }

    #[inline]
    #[must_use]
    pub fn sharing_count(&self) -> usize {
        self.sharers.len()
    }

    #[must_use]
    pub fn sharers(&self) -> &[usize] {
        &self.sharers
    }

    #[must_use]
    pub fn first_sharer(&self) -> Option<usize> {
        self.sharers.first().copied()
    }

    #[inline]
    #[must_use]
    pub fn is_broadcast_needed(&self) -> bool {
        self.sharers.len() >= MAX_SHARERS
    }

    /// Action the other sharers need for a request with `action`.
    #[must_use]
    pub fn others_need(action: Action) -> Action {
        match action {
            Action::SET_VALID => Action::SET_SHARED,
            Action::SET_DIRTY => Action::SET_INVALID,
            other => panic!("no sharer action for {other}"),
        }
    }

    /// Action granted to the requester above.
    #[must_use]
    pub fn req_ack_needs(&self) -> Action {
        match self.share_state {
            State::MODIFIED => Action::SET_DIRTY,
            State::EXCLUSIVE => Action::SET_EXCLUSIVE,
            State::SHARED => Action::SET_SHARED,
            State::INVALID => Action::SET_INVALID,
        }
    }

    #[must_use]
    pub fn should_notify_lower_levels(&self, action: Action, incoherent: bool) -> bool {
        if incoherent {
            return self.state == State::INVALID;
        }
        match action {
            Action::SET_VALID => self.state == State::INVALID,
            Action::SET_INVALID => true,
            Action::MMU | Action::SET_DIRTY | Action::SET_EXCLUSIVE => {
                self.state != State::MODIFIED && self.state != State::EXCLUSIVE
            }
            Action::SET_SHARED => self.state != State::SHARED && self.state != State::EXCLUSIVE,
            Action::VPC_WRITE_UPDATE => panic!("unexpected {action} request"),
        }
    }

    /// Whether sharers other than the requester at `port` must be notified.
    #[must_use]
    pub fn should_notify_higher_levels(&self, req: &Request, port: Option<usize>) -> bool {
        match self.sharers.as_slice() {
            [] => return false,
            [only] if Some(*only) == port => return false,
            _ => {}
        }
        match req.action {
            Action::SET_VALID | Action::SET_SHARED => self.share_state != State::SHARED,
            Action::SET_DIRTY | Action::SET_EXCLUSIVE | Action::SET_INVALID => true,
            other => panic!("unexpected {other} in {req}"),
        }
    }

    /// Local state after applying the action of `req`.
    #[must_use]
    pub fn next_state(&self, req: &Request) -> State {
        match req.action {
            Action::SET_VALID if self.state == State::INVALID => State::EXCLUSIVE,
            Action::SET_VALID => self.state,
            Action::SET_INVALID => State::INVALID,
            Action::SET_DIRTY => State::MODIFIED,
            Action::SET_SHARED => State::SHARED,
            Action::SET_EXCLUSIVE => State::EXCLUSIVE,
            other => panic!("cannot adjust state for {other} in {req}"),
        }
    }

    /// Applies `req`, arriving from up position `port`, to the line.
    pub fn adjust_state(&mut self, req: &Request, port: Option<usize>) {
        let old_state = self.state;
        self.state = self.next_state(req);

        let allowed: &[Action] = match req.kind {
            Kind::REQ => &[Action::SET_EXCLUSIVE, Action::SET_DIRTY, Action::SET_VALID],
            Kind::REQ_ACK => &[Action::SET_EXCLUSIVE, Action::SET_DIRTY, Action::SET_SHARED],
            Kind::DISP => &[Action::SET_DIRTY, Action::SET_VALID],
            Kind::SET_STATE | Kind::SET_STATE_ACK => &[Action::SET_SHARED, Action::SET_INVALID],
        };
        assert!(allowed.contains(&req.action), "unexpected action in {req}");

        match req.kind {
            Kind::DISP => {
                assert_ne!(self.state, State::INVALID, "displacing invalid line: {req}");
                if let Some(port) = port {
                    self.remove_sharer(port);
                }
                if req.action == Action::SET_DIRTY {
                    self.state = State::MODIFIED;
                } else if self.sharers.is_empty() {
                    self.state = State::INVALID;
                }
            }
            Kind::SET_STATE_ACK => {
                if req.action == Action::SET_INVALID {
                    if self.is_broadcast_needed() {
                        // the broadcast went out, fall back to tracking
                        self.sharers.truncate(MAX_SHARERS - 1);
                    }
                    if let Some(port) = port {
                        self.remove_sharer(port);
                    }
                } else if self.share_state != State::INVALID {
                    self.share_state = State::SHARED;
                }
                if req.is_home() {
                    self.state = if req.is_set_state_ack_disp() {
                        State::MODIFIED
                    } else {
                        old_state
                    };
                }
            }
            Kind::SET_STATE => {}
            Kind::REQ | Kind::REQ_ACK => {
                assert_ne!(self.state, State::INVALID, "{req} left line invalid");
                if old_state != State::INVALID && !req.is_top_coherent() {
                    self.state = old_state;
                }
                if req.kind == Kind::REQ_ACK && !req.is_top_coherent() {
                    self.state = match req.action {
                        Action::SET_DIRTY if old_state == State::INVALID => State::EXCLUSIVE,
                        Action::SET_DIRTY => old_state,
                        Action::SET_SHARED => State::SHARED,
                        Action::SET_EXCLUSIVE => State::EXCLUSIVE,
                        other => panic!("unexpected {other} in {req}"),
                    };
                }
                self.add_sharer(port);
                self.share_state = match self.sharers.len() {
                    0 => State::INVALID,
                    1 if self.state == State::SHARED => State::SHARED,
                    1 => State::EXCLUSIVE,
                    _ => State::SHARED,
                };
            }
        }

        self.check_invariants();

        if self.state == State::INVALID && self.share_state == State::INVALID {
            self.invalidate();
        }
    }

    fn check_invariants(&self) {
        let count = self.sharers.len();
        assert!(
            count <= 1 || !matches!(self.share_state, State::EXCLUSIVE | State::MODIFIED),
            "{count} sharers with share state {}",
            self.share_state
        );
        assert_eq!(
            count == 0,
            self.share_state == State::INVALID,
            "{count} sharers with share state {}",
            self.share_state
        );
    }

    pub fn add_sharer(&mut self, port: Option<usize>) {
        if self.is_broadcast_needed() {
            assert_eq!(self.share_state, State::SHARED);
            return;
        }
        let Some(port) = port else {
            if self.sharers.is_empty() {
                self.share_state = State::INVALID;
            }
            return;
        };
        if !self.sharers.contains(&port) {
            self.sharers.push(port);
        }
    }

    pub fn remove_sharer(&mut self, port: usize) {
        if self.is_broadcast_needed() {
            return;
        }
        if let Some(pos) = self.sharers.iter().position(|sharer| *sharer == port) {
            self.sharers.remove(pos);
            if self.sharers.is_empty() {
                self.share_state = State::INVALID;
            }
        }
    }
}

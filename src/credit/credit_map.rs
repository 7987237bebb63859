use std::pin::pin;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};
use crate::member_addr::MemberAddr;
use crate::wait::WaitError;

struct CreditMapState {
    credits: FxHashMap<MemberAddr, i64>,
    /// The lowest credits of all members, minus what was consumed since the last flush. This is
    ///  what a multicast is checked against.
    min_credits: i64,
    /// Credits consumed by multicasts since the last flush, not yet subtracted from the
    ///  individual members.
    accumulated: i64,
    last_credit_request: Option<Instant>,
    num_blockings: u64,
    epoch: u64,
}

impl CreditMapState {
    /// subtracts accumulated credits from every member
    fn flush(&mut self) {
        if self.accumulated > 0 {
            let accumulated = self.accumulated;
            for credits in self.credits.values_mut() {
                *credits = std::cmp::max(0, *credits - accumulated);
            }
            self.accumulated = 0;
        }
    }

    fn lowest_credits(&self, max_credits: i64) -> i64 {
        self.credits.values()
            .copied()
            .min()
            .unwrap_or(max_credits)
    }
}

/// Credits for multicasts: a multicast goes to every member, so it needs credits from every
///  member.
///
/// Multicasts are checked against the lowest credits of all members. Consumed credits are not
///  subtracted from each member right away but accumulated, and only flushed to the members
///  when a member's credits change.
pub struct CreditMap {
    max_credits: i64,
    credit_request_interval: Duration,
    state: Mutex<CreditMapState>,
    changed: Notify,
}

impl CreditMap {
    pub fn new(max_credits: i64, credit_request_interval: Duration) -> CreditMap {
        assert!(max_credits >= 0, "max credits must not be negative: {}", max_credits);
        CreditMap {
            max_credits,
            credit_request_interval,
            state: Mutex::new(CreditMapState {
                credits: FxHashMap::default(),
                min_credits: max_credits,
                accumulated: 0,
                last_credit_request: None,
                num_blockings: 0,
                epoch: 0,
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CreditMapState> {
        self.state.lock().expect("credit map lock poisoned")
    }

    pub fn max_credits(&self) -> i64 {
        self.max_credits
    }

    pub fn min_credits(&self) -> i64 {
        self.lock().min_credits
    }

    pub fn num_blockings(&self) -> u64 {
        self.lock().num_blockings
    }

    pub fn members(&self) -> Vec<MemberAddr> {
        self.lock().credits.keys().copied().collect()
    }

    pub fn contains(&self, member: &MemberAddr) -> bool {
        self.lock().credits.contains_key(member)
    }

    /// current credits of a member, with credits consumed by multicasts taken into account
    pub fn get(&self, member: &MemberAddr) -> Option<i64> {
        let state = self.lock();
        state.credits.get(member)
            .map(|c| std::cmp::max(0, c - state.accumulated))
    }

    /// Adds a member with max credits. Returns false if the member was present already.
    pub fn add_member(&self, member: MemberAddr) -> bool {
        let mut state = self.lock();
        if state.credits.contains_key(&member) {
            return false;
        }
        state.flush();
        state.credits.insert(member, self.max_credits);
        state.min_credits = state.lowest_credits(self.max_credits);
        debug!("added {:?} to the multicast credits", member);
        true
    }

    /// Removes a member. If that member had the lowest credits, blocked multicasts may be able
    ///  to proceed now.
    pub fn remove_member(&self, member: &MemberAddr) -> bool {
        let unblocked = {
            let mut state = self.lock();
            state.flush();
            if state.credits.remove(member).is_none() {
                return false;
            }
            debug!("removed {:?} from the multicast credits", member);
            self.update_min_credits(&mut state)
        };
        if unblocked {
            self.changed.notify_waiters();
        }
        true
    }

    /// Removes all members that are not in `view`
    pub fn retain_members(&self, view: &[MemberAddr]) {
        let unblocked = {
            let mut state = self.lock();
            state.flush();
            let before = state.credits.len();
            state.credits.retain(|member, _| view.contains(member));
            if state.credits.len() == before {
                return;
            }
            debug!("removed {} members from the multicast credits", before - state.credits.len());
            self.update_min_credits(&mut state)
        };
        if unblocked {
            self.changed.notify_waiters();
        }
    }

    /// recomputes min credits, returning true if they went up
    fn update_min_credits(&self, state: &mut CreditMapState) -> bool {
        let new_min = state.lowest_credits(self.max_credits);
        let increased = new_min > state.min_credits;
        state.min_credits = new_min;
        increased
    }

    /// Consumes `credits` from every member, waiting until all members have enough. Returns
    ///  [WaitError::TimedOut] if that does not happen during `timeout`, and
    ///  [WaitError::Interrupted] if the map is reset while waiting.
    pub async fn decrement(&self, credits: i64, timeout: Duration) -> Result<(), WaitError> {
        assert!(credits >= 0, "cannot decrement a negative amount of credits: {}", credits);

        let deadline = Instant::now() + timeout;
        let epoch = self.lock().epoch;
        let mut blocked = false;

        loop {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.epoch != epoch {
                    debug!("multicast credits were reset while waiting for {} credits", credits);
                    return Err(WaitError::Interrupted);
                }
                if credits <= state.min_credits {
                    state.accumulated += credits;
                    state.min_credits -= credits;
                    trace!("consumed {} multicast credits, min credits now {}", credits, state.min_credits);
                    return Ok(());
                }
                if !blocked {
                    blocked = true;
                    state.num_blockings += 1;
                    trace!("waiting for {} multicast credits, min credits {}", credits, state.min_credits);
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                debug!("timed out waiting for {} multicast credits", credits);
                return Err(WaitError::TimedOut);
            }
        }
    }

    /// Adds credits granted by `member`. If this raises the lowest credits of all members, every
    ///  blocked multicast is woken up to re-check, so several waiters of different sizes can be
    ///  unblocked by a single replenishment.
    pub fn replenish(&self, member: &MemberAddr, credits: i64) {
        let unblocked = {
            let mut state = self.lock();
            let Some(&current) = state.credits.get(member) else {
                debug!("received {} credits from {:?} which is not a member - ignoring", credits, member);
                return;
            };

            // only the member(s) with the lowest credits can raise the minimum
            let potential_update = current - state.accumulated <= state.min_credits;

            state.flush();
            if credits > 0 {
                let max_credits = self.max_credits;
                if let Some(c) = state.credits.get_mut(member) {
                    *c = std::cmp::min(max_credits, c.saturating_add(credits));
                }
            }
            trace!("replenished {} credits from {:?}", credits, member);

            potential_update && self.update_min_credits(&mut state)
        };

        if unblocked {
            self.changed.notify_waiters();
        }
    }

    /// members whose credits are below `threshold`, i.e. that should be asked for credits
    pub fn members_with_insufficient_credits(&self, threshold: i64) -> Vec<MemberAddr> {
        let state = self.lock();
        state.credits.iter()
            .filter(|(_, &c)| c - state.accumulated < threshold)
            .map(|(&m, _)| m)
            .collect()
    }

    /// Returns true if no credit request was signalled during the last credit request interval,
    ///  and records a credit request.
    pub fn need_to_send_credit_request(&self) -> bool {
        let mut state = self.lock();
        let now = Instant::now();
        match state.last_credit_request {
            Some(last) if now.duration_since(last) < self.credit_request_interval => false,
            _ => {
                state.last_credit_request = Some(now);
                true
            }
        }
    }

    /// Restores max credits for all members and releases all blocked multicasts with
    ///  [WaitError::Interrupted].
    pub fn reset(&self) {
        {
            let mut state = self.lock();
            state.epoch += 1;
            state.accumulated = 0;
            for credits in state.credits.values_mut() {
                *credits = self.max_credits;
            }
            state.min_credits = self.max_credits;
            state.last_credit_request = None;
        }
        self.changed.notify_waiters();
    }
}

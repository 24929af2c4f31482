//! The subchannel decoration grpclb applies to every backend connection.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt::{Debug, Display};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use crate::client::load_balancing::grpclb::client_stats::GrpclbClientStats;
use crate::client::load_balancing::{Subchannel, WorkScheduler};
use crate::client::name_resolution::Address;

/// The per-address annotation carrying the LB token the balancer assigned to
/// a backend and the stats object usage should be attributed to.
///
/// Placed on each address produced from a serverlist; the policy reads it
/// back when the child policy creates a subchannel for that address.  Fed
/// with an empty token and no stats for fallback addresses.
#[derive(Clone)]
pub struct TokenAndClientStats {
    lb_token: Bytes,
    client_stats: Option<Arc<GrpclbClientStats>>,
}

impl TokenAndClientStats {
    pub fn new(lb_token: Bytes, client_stats: Option<Arc<GrpclbClientStats>>) -> Self {
        TokenAndClientStats {
            lb_token,
            client_stats,
        }
    }

    pub fn lb_token(&self) -> &Bytes {
        &self.lb_token
    }

    pub fn client_stats(&self) -> Option<&Arc<GrpclbClientStats>> {
        self.client_stats.as_ref()
    }

    fn stats_addr(&self) -> usize {
        self.client_stats
            .as_ref()
            .map_or(0, |s| Arc::as_ptr(s) as usize)
    }
}

impl Debug for TokenAndClientStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TokenAndClientStats(token={:?}, stats={:#x})",
            String::from_utf8_lossy(&self.lb_token),
            self.stats_addr()
        )
    }
}

// Compared lexicographically by token bytes, then by stats identity, so that
// addresses dedup correctly across serverlist generations.
impl PartialEq for TokenAndClientStats {
    fn eq(&self, other: &Self) -> bool {
        self.lb_token == other.lb_token && self.stats_addr() == other.stats_addr()
    }
}

impl Eq for TokenAndClientStats {}

impl PartialOrd for TokenAndClientStats {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TokenAndClientStats {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lb_token
            .cmp(&other.lb_token)
            .then_with(|| self.stats_addr().cmp(&other.stats_addr()))
    }
}

/// State shared between the policy and the subchannel wrappers it hands to
/// the child policy.
///
/// Wrappers are released on arbitrary threads whenever the child policy
/// drops them.  The release queue carries the wrapped subchannels back onto
/// the policy's serialized context, where they are inserted into the
/// deletion cache.  Once the policy is shutting down, released subchannels
/// are simply dropped.
pub(crate) struct PolicyShared {
    shutting_down: AtomicBool,
    released_subchannels: Mutex<Vec<Arc<dyn Subchannel>>>,
    work_scheduler: Arc<dyn WorkScheduler>,
}

impl PolicyShared {
    pub fn new(work_scheduler: Arc<dyn WorkScheduler>) -> Self {
        PolicyShared {
            shutting_down: AtomicBool::new(false),
            released_subchannels: Mutex::new(Vec::new()),
            work_scheduler,
        }
    }

    pub fn set_shutting_down(&self) {
        self.shutting_down.store(true, AtomicOrdering::Release);
    }

    fn release_subchannel(&self, subchannel: Arc<dyn Subchannel>) {
        if self.shutting_down.load(AtomicOrdering::Acquire) {
            return;
        }
        self.released_subchannels.lock().unwrap().push(subchannel);
        self.work_scheduler.schedule_work();
    }

    pub fn take_released_subchannels(&self) -> Vec<Arc<dyn Subchannel>> {
        std::mem::take(&mut *self.released_subchannels.lock().unwrap())
    }
}

/// Decorates the subchannel of one balancer-provided backend with its LB
/// token and the stats handle the picker attaches to calls on it.
///
/// On release the wrapped subchannel is not dropped immediately; it is
/// queued into the policy's subchannel cache so that transient serverlist
/// churn does not tear connections down.  The back-reference to the policy
/// is weak: wrappers never keep the policy alive.
pub(crate) struct SubchannelWrapper {
    wrapped: Arc<dyn Subchannel>,
    lb_token: Bytes,
    client_stats: Option<Arc<GrpclbClientStats>>,
    policy: Weak<PolicyShared>,
}

impl SubchannelWrapper {
    pub fn new(
        wrapped: Arc<dyn Subchannel>,
        lb_token: Bytes,
        client_stats: Option<Arc<GrpclbClientStats>>,
        policy: Weak<PolicyShared>,
    ) -> Self {
        SubchannelWrapper {
            wrapped,
            lb_token,
            client_stats,
            policy,
        }
    }

    pub fn lb_token(&self) -> &Bytes {
        &self.lb_token
    }

    pub fn client_stats(&self) -> Option<&Arc<GrpclbClientStats>> {
        self.client_stats.as_ref()
    }

    pub fn wrapped_subchannel(&self) -> Arc<dyn Subchannel> {
        self.wrapped.clone()
    }
}

impl Subchannel for SubchannelWrapper {
    fn address(&self) -> Address {
        self.wrapped.address()
    }

    fn connect(&self) {
        self.wrapped.connect();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Display for SubchannelWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "grpclb({})", self.wrapped)
    }
}

impl Drop for SubchannelWrapper {
    fn drop(&mut self) {
        if let Some(policy) = self.policy.upgrade() {
            policy.release_subchannel(self.wrapped.clone());
        }
    }
}

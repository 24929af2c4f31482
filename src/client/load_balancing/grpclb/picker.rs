//! The per-pick fast path.

use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;

use tonic::metadata::MetadataValue;
use tonic::Status;
use tracing::warn;

use crate::client::load_balancing::grpclb::client_stats::GrpclbClientStats;
use crate::client::load_balancing::grpclb::serverlist::Serverlist;
use crate::client::load_balancing::grpclb::subchannel::SubchannelWrapper;
use crate::client::load_balancing::{PickResult, Picker, SubchannelCallTracker};
use crate::service::Request;

/// The metadata key carrying the backend's LB token on every call, consumed
/// by the balancer-aware backend.
pub const LB_TOKEN_METADATA_KEY: &str = "lb-token";

/// The pick attribute carrying the stats handle for a call, consumed by the
/// client-load-reporting filter.
#[derive(Clone)]
pub struct ClientStatsAttribute(pub Arc<GrpclbClientStats>);

impl Debug for ClientStatsAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientStatsAttribute({:p})", Arc::as_ptr(&self.0))
    }
}

impl PartialEq for ClientStatsAttribute {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ClientStatsAttribute {}

impl PartialOrd for ClientStatsAttribute {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClientStatsAttribute {
    fn cmp(&self, other: &Self) -> Ordering {
        (Arc::as_ptr(&self.0) as usize).cmp(&(Arc::as_ptr(&other.0) as usize))
    }
}

/// Interposes on every pick to apply balancer-directed drops, then delegates
/// to the child policy's picker and decorates complete picks with the
/// backend's LB token and the stats handle.
///
/// The serverlist is nullable: the policy supplies it only when the child is
/// READY or when every entry is a drop.  Queued picks are retried against
/// later pickers, so consulting the drop index for them would count the same
/// call more than once.
pub(crate) struct GrpclbPicker {
    serverlist: Option<Arc<Serverlist>>,
    child_picker: Arc<dyn Picker>,
    client_stats: Option<Arc<GrpclbClientStats>>,
}

impl GrpclbPicker {
    pub fn new(
        serverlist: Option<Arc<Serverlist>>,
        child_picker: Arc<dyn Picker>,
        client_stats: Option<Arc<GrpclbClientStats>>,
    ) -> Self {
        GrpclbPicker {
            serverlist,
            child_picker,
            client_stats,
        }
    }
}

impl Picker for GrpclbPicker {
    fn pick(&self, request: &Request) -> PickResult {
        // Check if we should drop the call.
        if let Some(drop_token) = self.serverlist.as_ref().and_then(|sl| sl.should_drop()) {
            // Update the stats to indicate the number of dropped calls.
            // This has to happen here rather than in the load-reporting
            // filter, because no subchannel call (and therefore no filter)
            // exists for dropped calls.
            if let Some(client_stats) = &self.client_stats {
                client_stats.call_dropped(&drop_token);
            }
            return PickResult::Drop(Status::unavailable("drop directed by grpclb balancer"));
        }

        // Forward the pick to the child policy.
        let result = self.child_picker.pick(request);
        let PickResult::Pick(mut pick) = result else {
            return result;
        };

        let Some(wrapper) = pick.subchannel.as_any().downcast_ref::<SubchannelWrapper>() else {
            // Subchannel not created through this policy; pass it through
            // untouched.
            return PickResult::Pick(pick);
        };

        if let Some(client_stats) = wrapper.client_stats() {
            // Attach the stats handle for the load-reporting filter and
            // install a tracker that balances the handle when the pick is
            // abandoned before a subchannel call is started.
            pick.attributes = pick
                .attributes
                .add(ClientStatsAttribute(client_stats.clone()));
            pick.call_tracker = Some(Box::new(GrpclbCallTracker {
                client_stats: Some(client_stats.clone()),
                inner: pick.call_tracker.take(),
            }));
            client_stats.call_started();
        }

        // Encode the LB token in metadata.
        if !wrapper.lb_token().is_empty() {
            match std::str::from_utf8(wrapper.lb_token())
                .ok()
                .and_then(|token| MetadataValue::try_from(token).ok())
            {
                Some(value) => {
                    pick.metadata.insert(LB_TOKEN_METADATA_KEY, value);
                }
                None => warn!(
                    "LB token {:?} is not a valid metadata value; omitting it",
                    wrapper.lb_token()
                ),
            }
        }

        // Unwrap the subchannel to pass up to the channel.
        pick.subchannel = wrapper.wrapped_subchannel();
        PickResult::Pick(pick)
    }
}

/// Releases the picker's stats handle exactly once: when the subchannel call
/// starts, ownership has moved to the load-reporting filter through the pick
/// attributes; when the pick is abandoned instead, the handle is dropped
/// with the tracker.
struct GrpclbCallTracker {
    client_stats: Option<Arc<GrpclbClientStats>>,
    inner: Option<Box<dyn SubchannelCallTracker>>,
}

impl SubchannelCallTracker for GrpclbCallTracker {
    fn call_started(&mut self) {
        if let Some(inner) = &mut self.inner {
            inner.call_started();
        }
        self.client_stats.take();
    }

    fn call_finished(&mut self, status: &Status) {
        if let Some(inner) = &mut self.inner {
            inner.call_finished(status);
        }
    }
}

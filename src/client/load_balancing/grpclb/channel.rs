//! The policy's view of the channel used to talk to the balancer.
//!
//! The balancer channel itself (transport, connection management, pick_first
//! across the balancer addresses) is owned by the channel machinery outside
//! this crate.  The policy only starts BalanceLoad streams on it, replaces
//! its address list when the resolver produces a new one, and watches its
//! connectivity state for the fallback-at-startup check.

use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tonic::Status;

use crate::client::load_balancing::grpclb::proto::{LoadBalanceRequest, LoadBalanceResponse};
use crate::client::name_resolution::Address;
use crate::client::ConnectivityState;

/// A channel to the balancer.
pub trait BalancerChannel: Send + Sync {
    /// Starts a `/grpc.lb.v1.LoadBalancer/BalanceLoad` stream on the channel.
    ///
    /// The call is made wait-for-ready.  A deadline of None means the call
    /// has no deadline.  Dropping both halves of the returned stream cancels
    /// the call.
    fn balance_load(&self, deadline: Option<Duration>) -> BalancerStream;

    /// Replaces the set of balancer addresses the channel connects to.
    fn update_addresses(&self, addresses: Vec<Address>);

    /// Returns a watch over the channel's connectivity state.
    fn connectivity_state(&self) -> watch::Receiver<ConnectivityState>;

    /// Drops any connection backoff the channel is currently applying so the
    /// next attempt happens immediately.
    fn reset_connect_backoff(&self);
}

/// One streaming BalanceLoad call.
///
/// Requests are pushed through `requests`; the send future completing means
/// the transport has accepted the message.  Responses arrive on `responses`,
/// which terminates with the call's trailing status (an `Err` item, or
/// channel closure if the implementation cannot produce one).
pub struct BalancerStream {
    pub requests: mpsc::Sender<LoadBalanceRequest>,
    pub responses: mpsc::UnboundedReceiver<Result<LoadBalanceResponse, Status>>,
}

/// Creates [`BalancerChannel`] instances for the policy.
///
/// The channel machinery provides a factory through the resolver update's
/// attributes (see [`BalancerChannelFactoryArg`]); tests substitute fakes the
/// same way.  The balancer channel inherits the parent channel's args minus
/// its LB policy name, service config, authority overrides and call
/// credentials; that construction happens behind this trait.
pub trait BalancerChannelFactory: Send + Sync {
    /// Creates a channel to the balancer for a parent channel with the given
    /// dataplane authority.
    fn create_channel(&self, authority: &str) -> Arc<dyn BalancerChannel>;
}

/// The resolver-update attribute carrying the balancer address list, as
/// produced by the resolver for targets that have balancer-enabled SRV
/// records (or equivalents).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BalancerAddresses(pub Vec<Address>);

/// The resolver-update attribute carrying the balancer channel factory.
#[derive(Clone)]
pub struct BalancerChannelFactoryArg(pub Arc<dyn BalancerChannelFactory>);

impl Debug for BalancerChannelFactoryArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BalancerChannelFactoryArg({:p})", Arc::as_ptr(&self.0))
    }
}

impl PartialEq for BalancerChannelFactoryArg {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for BalancerChannelFactoryArg {}

impl PartialOrd for BalancerChannelFactoryArg {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BalancerChannelFactoryArg {
    fn cmp(&self, other: &Self) -> Ordering {
        (Arc::as_ptr(&self.0) as *const () as usize)
            .cmp(&(Arc::as_ptr(&other.0) as *const () as usize))
    }
}

//! The grpclb LB policy.
//!
//! grpclb keeps a long-lived streaming call open to an external balancer
//! server, feeds the balancer-returned serverlist (or the resolver-supplied
//! fallback addresses) to a child policy, interposes on every pick to apply
//! balancer-directed drops and attach LB tokens, and periodically reports
//! per-call statistics back to the balancer.
//!
//! Every asynchronous completion (balancer stream activity, timers, the
//! balancer channel's connectivity watch, subchannel releases) is queued and
//! drained inside [`LbPolicy::work`], which the channel serializes with the
//! other policy entry points; only the serverlist's drop index and the
//! client stats counters are touched from application threads.

pub mod channel;
pub mod proto;

pub(crate) mod client_stats;
pub(crate) mod serverlist;
pub(crate) mod subchannel;

mod config;
mod lb_call;
mod picker;


pub use client_stats::GrpclbClientStats;
pub use picker::{ClientStatsAttribute, LB_TOKEN_METADATA_KEY};
pub use subchannel::TokenAndClientStats;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::attributes::Attributes;
use crate::client::load_balancing::grpclb::channel::{
    BalancerAddresses, BalancerChannel, BalancerChannelFactoryArg,
};
use crate::client::load_balancing::grpclb::config::GrpclbConfig;
use crate::client::load_balancing::grpclb::lb_call::BalancerCall;
use crate::client::load_balancing::grpclb::picker::GrpclbPicker;
use crate::client::load_balancing::grpclb::proto::LoadBalanceResponse;
use crate::client::load_balancing::grpclb::serverlist::Serverlist;
use crate::client::load_balancing::grpclb::subchannel::{PolicyShared, SubchannelWrapper};
use crate::client::load_balancing::{
    ChannelController, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, Subchannel,
    SubchannelState, WeakSubchannel, WorkScheduler, GLOBAL_LB_REGISTRY,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};
use crate::client::name_resolution::backoff::{ExponentialBackoff, DEFAULT_EXPONENTIAL_CONFIG};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::client::ConnectivityState;
use crate::rt::{BoxedTaskHandle, Runtime};

pub static POLICY_NAME: &str = "grpclb";
static START: Once = Once::new();

/// Per-channel knobs for the policy, delivered through the resolver update's
/// attributes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct GrpclbOptions {
    /// The deadline applied to each balancer call.  None means no deadline.
    pub call_timeout: Option<Duration>,

    /// How long to wait for the balancer at startup before falling back to
    /// the resolver-supplied backend addresses.
    pub fallback_at_startup_timeout: Duration,

    /// How long a released subchannel is kept alive so that transient
    /// serverlist churn does not tear down its connection.
    pub subchannel_cache_interval: Duration,
}

impl Default for GrpclbOptions {
    fn default() -> Self {
        GrpclbOptions {
            call_timeout: None,
            fallback_at_startup_timeout: Duration::from_millis(10_000),
            subchannel_cache_interval: Duration::from_millis(10_000),
        }
    }
}

/// Child-update attribute marking the endpoints as coming from a grpclb
/// balancer rather than the resolver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct IsBackendFromGrpclb(pub bool);

/// Child-update attribute enabling the client-load-reporting filter on
/// subchannels created for these endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct EnableLoadReportingFilter(pub bool);

/// Child-update attribute inhibiting per-endpoint health checking; the
/// balancer is authoritative for the health of the backends it returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct InhibitHealthChecking(pub bool);

/// Registers grpclb as an LB policy.
pub fn reg() {
    START.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(GrpclbBuilder {});
    });
}

struct GrpclbBuilder {}

impl LbPolicyBuilder for GrpclbBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(GrpclbPolicy::new(options))
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(Some(LbConfig::new(GrpclbConfig::parse(config)?)))
    }
}

/// A completion delivered to the policy's serialized context through its
/// event queue.
pub(crate) enum GrpclbEvent {
    InitialRequestSent { call_id: u64 },
    LoadReportSent { call_id: u64 },
    SendFailed { call_id: u64, error: String },
    BalancerMessage {
        call_id: u64,
        response: LoadBalanceResponse,
    },
    CallEnded { call_id: u64, status: Status },
    LoadReportTimerFired { call_id: u64 },
    FallbackTimerFired,
    RetryTimerFired,
    SubchannelCacheTimerFired,
    BalancerChannelState(ConnectivityState),
}

/// Queues events from background tasks and wakes the policy through the
/// channel's work scheduler.  Drained inside work().
pub(crate) struct EventQueue {
    events: Mutex<VecDeque<GrpclbEvent>>,
    work_scheduler: Arc<dyn WorkScheduler>,
}

impl EventQueue {
    fn new(work_scheduler: Arc<dyn WorkScheduler>) -> Self {
        EventQueue {
            events: Mutex::new(VecDeque::new()),
            work_scheduler,
        }
    }

    pub(crate) fn push(&self, event: GrpclbEvent) {
        self.events.lock().unwrap().push_back(event);
        self.work_scheduler.schedule_work();
    }

    fn pop(&self) -> Option<GrpclbEvent> {
        self.events.lock().unwrap().pop_front()
    }
}

// Lets the child policy request work without the policy confusing the
// request with its own events.
struct ChildWorkScheduler {
    pending: Arc<AtomicBool>,
    parent: Arc<dyn WorkScheduler>,
}

impl WorkScheduler for ChildWorkScheduler {
    fn schedule_work(&self) {
        self.pending.store(true, Ordering::Release);
        self.parent.schedule_work();
    }
}

pub(crate) struct GrpclbPolicy {
    work_scheduler: Arc<dyn WorkScheduler>,
    runtime: Arc<dyn Runtime>,
    events: Arc<EventQueue>,
    shared: Arc<PolicyShared>,

    options: GrpclbOptions,
    config: Option<GrpclbConfig>,
    authority: String,

    // The channel for communicating with the balancer, created on the first
    // update that carries balancer addresses.
    lb_channel: Option<Arc<dyn BalancerChannel>>,
    connectivity_watch: Option<BoxedTaskHandle>,

    // The current balancer call.  Reset whenever the call is no longer
    // needed (the call ended, or the policy is going away).
    lb_call: Option<BalancerCall>,
    next_lb_call_id: u64,
    lb_call_backoff: ExponentialBackoff,
    retry_timer: Option<BoxedTaskHandle>,

    // The deserialized serverlist from the balancer.  None until one has
    // arrived.
    serverlist: Option<Arc<Serverlist>>,

    // Fallback state.
    fallback_mode: bool,
    fallback_backend_endpoints: Result<Vec<Endpoint>, String>,
    resolution_note: Option<String>,
    fallback_at_startup_checks_pending: bool,
    fallback_timer: Option<BoxedTaskHandle>,

    // The child policy the backends are fed to.
    child_policy: Option<Box<dyn LbPolicy>>,
    child_builder_name: Option<&'static str>,
    child_work_pending: Arc<AtomicBool>,
    child_policy_ready: bool,
    subchannel_to_wrapper: HashMap<WeakSubchannel, Weak<SubchannelWrapper>>,

    // Deleted-subchannel caching.
    cached_subchannels: BTreeMap<Instant, Vec<Arc<dyn Subchannel>>>,
    cache_timer: Option<BoxedTaskHandle>,
}

impl GrpclbPolicy {
    fn new(options: LbPolicyOptions) -> Self {
        let events = Arc::new(EventQueue::new(options.work_scheduler.clone()));
        let shared = Arc::new(PolicyShared::new(options.work_scheduler.clone()));
        GrpclbPolicy {
            work_scheduler: options.work_scheduler,
            runtime: options.runtime,
            events,
            shared,
            options: GrpclbOptions::default(),
            config: None,
            authority: String::new(),
            lb_channel: None,
            connectivity_watch: None,
            lb_call: None,
            next_lb_call_id: 0,
            lb_call_backoff: ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG).unwrap(),
            retry_timer: None,
            serverlist: None,
            fallback_mode: false,
            fallback_backend_endpoints: Ok(vec![]),
            resolution_note: None,
            fallback_at_startup_checks_pending: false,
            fallback_timer: None,
            child_policy: None,
            child_builder_name: None,
            child_work_pending: Arc::new(AtomicBool::new(false)),
            child_policy_ready: false,
            subchannel_to_wrapper: HashMap::new(),
            cached_subchannels: BTreeMap::new(),
            cache_timer: None,
        }
    }

    fn handle_event(&mut self, event: GrpclbEvent, channel_controller: &mut dyn ChannelController) {
        match event {
            GrpclbEvent::InitialRequestSent { call_id } => {
                self.handle_initial_request_sent(call_id);
            }
            GrpclbEvent::LoadReportSent { call_id } => self.handle_load_report_sent(call_id),
            GrpclbEvent::SendFailed { call_id, error } => {
                self.handle_send_failed(call_id, error, channel_controller);
            }
            GrpclbEvent::BalancerMessage { call_id, response } => {
                self.handle_balancer_message(call_id, response, channel_controller);
            }
            GrpclbEvent::CallEnded { call_id, status } => {
                self.handle_call_ended(call_id, status, channel_controller);
            }
            GrpclbEvent::LoadReportTimerFired { call_id } => {
                self.handle_load_report_timer(call_id);
            }
            GrpclbEvent::FallbackTimerFired => self.handle_fallback_timer(channel_controller),
            GrpclbEvent::RetryTimerFired => self.handle_retry_timer(),
            GrpclbEvent::SubchannelCacheTimerFired => self.handle_subchannel_cache_timer(),
            GrpclbEvent::BalancerChannelState(state) => {
                self.handle_balancer_channel_state(state, channel_controller);
            }
        }
    }

    //
    // Fallback handling.
    //

    fn start_fallback_timer(&mut self) {
        let events = self.events.clone();
        let sleep = self.runtime.sleep(self.options.fallback_at_startup_timeout);
        self.fallback_timer = Some(self.runtime.spawn(Box::pin(async move {
            sleep.await;
            events.push(GrpclbEvent::FallbackTimerFired);
        })));
    }

    pub(super) fn cancel_fallback_timer(&mut self) {
        if let Some(timer) = self.fallback_timer.take() {
            timer.abort();
        }
    }

    fn start_connectivity_watch(&mut self) {
        let Some(channel) = &self.lb_channel else {
            return;
        };
        let mut state_rx = channel.connectivity_state();
        let events = self.events.clone();
        self.connectivity_watch = Some(self.runtime.spawn(Box::pin(async move {
            loop {
                let state = *state_rx.borrow_and_update();
                events.push(GrpclbEvent::BalancerChannelState(state));
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        })));
    }

    pub(super) fn cancel_connectivity_watch(&mut self) {
        if let Some(watch) = self.connectivity_watch.take() {
            watch.abort();
        }
    }

    fn handle_fallback_timer(&mut self, channel_controller: &mut dyn ChannelController) {
        // If a serverlist arrived after the timer fired but before this ran,
        // don't fall back.
        if !self.fallback_at_startup_checks_pending {
            return;
        }
        info!("no response from balancer after fallback timeout; entering fallback mode");
        self.fallback_at_startup_checks_pending = false;
        self.fallback_timer = None;
        self.cancel_connectivity_watch();
        self.fallback_mode = true;
        self.create_or_update_child_policy(channel_controller);
    }

    fn handle_balancer_channel_state(
        &mut self,
        state: ConnectivityState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if !self.fallback_at_startup_checks_pending
            || state != ConnectivityState::TransientFailure
        {
            return;
        }
        // Cancel the fallback timer and go into fallback mode immediately.
        info!("balancer channel in state TRANSIENT_FAILURE; entering fallback mode");
        self.fallback_at_startup_checks_pending = false;
        self.cancel_fallback_timer();
        self.fallback_mode = true;
        self.create_or_update_child_policy(channel_controller);
        // The channel state no longer matters once in fallback mode.
        self.cancel_connectivity_watch();
    }

    pub(super) fn maybe_enter_fallback_mode_after_startup(
        &mut self,
        channel_controller: &mut dyn ChannelController,
    ) {
        // Enter fallback mode if all of the following are true:
        // - We are not currently in fallback mode.
        // - We are not currently waiting for the initial fallback timeout.
        // - We are not currently in contact with the balancer.
        // - The child policy is not in state READY.
        if !self.fallback_mode
            && !self.fallback_at_startup_checks_pending
            && !self.lb_call.as_ref().is_some_and(|call| call.seen_serverlist)
            && !self.child_policy_ready
        {
            info!(
                "lost contact with balancer and backends from most recent serverlist; entering \
                 fallback mode"
            );
            self.fallback_mode = true;
            self.create_or_update_child_policy(channel_controller);
        }
    }

    //
    // Child policy handling.
    //

    pub(super) fn create_or_update_child_policy(
        &mut self,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(config) = self.config.clone() else {
            return;
        };
        let is_backend_from_grpclb = !self.fallback_mode;
        let (endpoints, resolution_note) = if self.fallback_mode {
            match &self.fallback_backend_endpoints {
                Ok(endpoints) => {
                    // The fallback backend list may be empty, in which case
                    // the child policy will fail the picks.
                    let endpoints: Vec<Endpoint> =
                        endpoints.iter().map(null_lb_token_endpoint).collect();
                    let resolution_note = endpoints.is_empty().then(|| {
                        format!(
                            "grpclb in fallback mode without any fallback addresses: {}",
                            self.resolution_note.clone().unwrap_or_default()
                        )
                    });
                    (Ok(endpoints), resolution_note)
                }
                Err(error) => (Err(error.clone()), None),
            }
        } else {
            let Some(serverlist) = &self.serverlist else {
                debug_assert!(false, "child policy updated with neither serverlist nor fallback");
                return;
            };
            let client_stats = self.lb_call.as_ref().and_then(|call| call.client_stats.clone());
            let endpoints = serverlist.backend_endpoints(client_stats.as_ref());
            let resolution_note = endpoints
                .is_empty()
                .then(|| "empty serverlist from grpclb balancer".to_string());
            (Ok(endpoints), resolution_note)
        };
        let mut attributes = Attributes::new()
            .add(IsBackendFromGrpclb(is_backend_from_grpclb))
            .add(EnableLoadReportingFilter(true));
        if is_backend_from_grpclb {
            attributes = attributes.add(InhibitHealthChecking(true));
        }
        let update = ResolverUpdate {
            attributes,
            endpoints,
            service_config: Ok(None),
            resolution_note,
        };

        // Create the child policy if needed.  A config switching to a
        // different child policy replaces the old child outright.
        if self.child_builder_name != Some(config.child_policy_builder.name()) {
            self.child_policy = None;
        }
        if self.child_policy.is_none() {
            let work_scheduler = Arc::new(ChildWorkScheduler {
                pending: self.child_work_pending.clone(),
                parent: self.work_scheduler.clone(),
            });
            self.child_policy = Some(config.child_policy_builder.build(LbPolicyOptions {
                work_scheduler,
                runtime: self.runtime.clone(),
            }));
            self.child_builder_name = Some(config.child_policy_builder.name());
            debug!("created new child policy {}", config.child_policy_builder.name());
        }

        let mut child_controller =
            GrpclbChildController::new(channel_controller, self.shared.clone());
        let result = self.child_policy.as_mut().unwrap().resolver_update(
            update,
            config.child_policy_config.as_ref(),
            &mut child_controller,
        );
        // A child that rejects an update does not fail the policy update.
        if let Err(error) = result {
            warn!("child policy rejected update: {error}");
        }
        let parts = child_controller.into_parts();
        self.absorb_child_controller(parts, channel_controller);
    }

    fn absorb_child_controller(
        &mut self,
        parts: ChildControllerParts,
        channel_controller: &mut dyn ChannelController,
    ) {
        for (subchannel, wrapper) in parts.created_subchannels {
            self.subchannel_to_wrapper
                .insert(WeakSubchannel::new(&subchannel), wrapper);
        }
        for state in parts.picker_updates {
            self.handle_child_picker_update(state, channel_controller);
        }
        // Re-resolution cannot help while the backends come from the
        // balancer; forward the request only in fallback mode.
        if parts.resolution_requested && self.fallback_mode {
            channel_controller.request_resolution();
        }
    }

    fn handle_child_picker_update(
        &mut self,
        state: LbState,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.child_policy_ready = state.connectivity_state == ConnectivityState::Ready;
        // Enter fallback mode if needed.
        self.maybe_enter_fallback_mode_after_startup(channel_controller);
        // Give the picker the serverlist so that it can handle drops, except
        // when the child reports a state other than READY.  Queued picks are
        // retried against later pickers, and counting a drop for each retry
        // would drop too many calls.  The exception is a serverlist that is
        // all drops, where there is nothing to queue against.
        let serverlist = if state.connectivity_state == ConnectivityState::Ready
            || self
                .serverlist
                .as_ref()
                .is_some_and(|serverlist| serverlist.contains_all_drop_entries())
        {
            self.serverlist.clone()
        } else {
            None
        };
        let client_stats = self.lb_call.as_ref().and_then(|call| call.client_stats.clone());
        debug!(
            "updating picker: state={} serverlist={} client_stats={}",
            state.connectivity_state,
            serverlist.is_some(),
            client_stats.is_some(),
        );
        channel_controller.update_picker(LbState {
            connectivity_state: state.connectivity_state,
            picker: Arc::new(GrpclbPicker::new(serverlist, state.picker, client_stats)),
        });
    }

    //
    // Subchannel caching.
    //

    fn cache_released_subchannels(&mut self) {
        let released = self.shared.take_released_subchannels();
        if released.is_empty() {
            return;
        }
        let deletion_time = Instant::now() + self.options.subchannel_cache_interval;
        debug!("caching {} released subchannels", released.len());
        self.cached_subchannels
            .entry(deletion_time)
            .or_default()
            .extend(released);
        if self.cache_timer.is_none() {
            self.start_subchannel_cache_timer();
        }
    }

    fn start_subchannel_cache_timer(&mut self) {
        let Some(deletion_time) = self.cached_subchannels.keys().next().copied() else {
            return;
        };
        let delay = deletion_time.saturating_duration_since(Instant::now());
        let events = self.events.clone();
        let sleep = self.runtime.sleep(delay);
        self.cache_timer = Some(self.runtime.spawn(Box::pin(async move {
            sleep.await;
            events.push(GrpclbEvent::SubchannelCacheTimerFired);
        })));
    }

    fn handle_subchannel_cache_timer(&mut self) {
        if self.cache_timer.take().is_none() {
            return;
        }
        if let Some((_, subchannels)) = self.cached_subchannels.pop_first() {
            debug!("removing {} subchannels from cache", subchannels.len());
        }
        if !self.cached_subchannels.is_empty() {
            self.start_subchannel_cache_timer();
        }
    }
}

impl LbPolicy for GrpclbPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        debug!("grpclb received resolver update");
        let is_initial_update = self.lb_channel.is_none();
        let config = match config.and_then(|c| c.convert_to::<GrpclbConfig>()) {
            Some(config) => (*config).clone(),
            None => GrpclbConfig::default_config()?,
        };
        self.config = Some(config);
        if is_initial_update {
            if let Some(options) = update.attributes.get::<GrpclbOptions>() {
                self.options = options.clone();
            }
            self.authority = channel_controller.authority();
        }

        // Update the fallback address list and resolution note.
        self.fallback_backend_endpoints = update.endpoints.clone();
        self.resolution_note = update.resolution_note.clone();

        // Update the balancer channel from the balancer address list.
        let balancer_addresses = update
            .attributes
            .get::<BalancerAddresses>()
            .map(|addresses| addresses.0.clone())
            .unwrap_or_default();
        if balancer_addresses.is_empty() {
            // Keep serving with whatever state we have, but tell the channel
            // this update was unusable.
            if self.child_policy.is_some() {
                self.create_or_update_child_policy(channel_controller);
            }
            return Err("balancer address list must be non-empty".into());
        }
        if self.lb_channel.is_none() {
            let Some(factory) = update.attributes.get::<BalancerChannelFactoryArg>() else {
                return Err("no balancer channel factory in channel args".into());
            };
            self.lb_channel = Some(factory.0.create_channel(&self.authority));
        }
        if let Some(lb_channel) = &self.lb_channel {
            lb_channel.update_addresses(balancer_addresses);
        }

        // Update the existing child policy, if any.
        if self.child_policy.is_some() {
            self.create_or_update_child_policy(channel_controller);
        }

        // On the first update, start the fallback-at-startup checks and the
        // balancer call.
        if is_initial_update {
            self.fallback_at_startup_checks_pending = true;
            self.start_fallback_timer();
            // If the balancer channel reports TRANSIENT_FAILURE before the
            // timer fires, fallback starts immediately.
            self.start_connectivity_watch();
            self.start_balancer_call();
        }
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        // Deliver the update to the child through the wrapper it knows.
        let key = WeakSubchannel::new(&subchannel);
        let Some(wrapper) = self
            .subchannel_to_wrapper
            .get(&key)
            .and_then(|wrapper| wrapper.upgrade())
        else {
            // The child has already released this subchannel.
            self.subchannel_to_wrapper
                .retain(|_, wrapper| wrapper.strong_count() > 0);
            return;
        };
        let Some(child_policy) = self.child_policy.as_mut() else {
            return;
        };
        let mut child_controller = GrpclbChildController::new(channel_controller, self.shared.clone());
        child_policy.subchannel_update(wrapper, state, &mut child_controller);
        let parts = child_controller.into_parts();
        self.absorb_child_controller(parts, channel_controller);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        // Subchannels released by wrappers on arbitrary threads.
        self.cache_released_subchannels();
        // Work requested by the child policy.
        if self.child_work_pending.swap(false, Ordering::AcqRel) {
            if let Some(child_policy) = self.child_policy.as_mut() {
                let mut child_controller =
                    GrpclbChildController::new(channel_controller, self.shared.clone());
                child_policy.work(&mut child_controller);
                let parts = child_controller.into_parts();
                self.absorb_child_controller(parts, channel_controller);
            }
        }
        // Completions from the balancer call, timers and the connectivity
        // watch.
        while let Some(event) = self.events.pop() {
            self.handle_event(event, channel_controller);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(child_policy) = self.child_policy.as_mut() {
            let mut child_controller =
                GrpclbChildController::new(channel_controller, self.shared.clone());
            child_policy.exit_idle(&mut child_controller);
            let parts = child_controller.into_parts();
            self.absorb_child_controller(parts, channel_controller);
        }
    }

    fn reset_backoff(&mut self) {
        if let Some(lb_channel) = &self.lb_channel {
            lb_channel.reset_connect_backoff();
        }
        if let Some(child_policy) = self.child_policy.as_mut() {
            child_policy.reset_backoff();
        }
    }
}

impl Drop for GrpclbPolicy {
    fn drop(&mut self) {
        self.shared.set_shutting_down();
        // Ends the balancer call and its timers.
        self.lb_call = None;
        self.cancel_fallback_timer();
        self.cancel_connectivity_watch();
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.cache_timer.take() {
            timer.abort();
        }
        self.cached_subchannels.clear();
        self.child_policy = None;
        self.lb_channel = None;
    }
}

// Decorates fallback endpoints the same way serverlist endpoints are
// decorated, with an empty token and no stats.
fn null_lb_token_endpoint(endpoint: &Endpoint) -> Endpoint {
    let addresses = endpoint
        .addresses
        .iter()
        .map(|address| Address {
            attributes: address
                .attributes
                .add(TokenAndClientStats::new(Bytes::new(), None)),
            ..address.clone()
        })
        .collect();
    Endpoint {
        addresses,
        attributes: endpoint.attributes.clone(),
    }
}

struct ChildControllerParts {
    created_subchannels: Vec<(Arc<dyn Subchannel>, Weak<SubchannelWrapper>)>,
    picker_updates: Vec<LbState>,
    resolution_requested: bool,
}

/// The controller handed to the child policy.  Wraps subchannels the child
/// creates with the LB token and stats of their address, and buffers picker
/// updates and re-resolution requests so the policy can post-process them.
struct GrpclbChildController<'a> {
    parent: &'a mut dyn ChannelController,
    shared: Arc<PolicyShared>,
    created_subchannels: Vec<(Arc<dyn Subchannel>, Weak<SubchannelWrapper>)>,
    picker_updates: Vec<LbState>,
    resolution_requested: bool,
}

impl<'a> GrpclbChildController<'a> {
    fn new(parent: &'a mut dyn ChannelController, shared: Arc<PolicyShared>) -> Self {
        GrpclbChildController {
            parent,
            shared,
            created_subchannels: vec![],
            picker_updates: vec![],
            resolution_requested: false,
        }
    }

    fn into_parts(self) -> ChildControllerParts {
        ChildControllerParts {
            created_subchannels: self.created_subchannels,
            picker_updates: self.picker_updates,
            resolution_requested: self.resolution_requested,
        }
    }
}

impl ChannelController for GrpclbChildController<'_> {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel = self.parent.new_subchannel(address);
        let (lb_token, client_stats) = match address.attributes.get::<TokenAndClientStats>() {
            Some(arg) => (arg.lb_token().clone(), arg.client_stats().cloned()),
            None => {
                warn!("no TokenAndClientStats for address {address}; using an empty token");
                (Bytes::new(), None)
            }
        };
        let wrapper = Arc::new(SubchannelWrapper::new(
            subchannel.clone(),
            lb_token,
            client_stats,
            Arc::downgrade(&self.shared),
        ));
        self.created_subchannels
            .push((subchannel, Arc::downgrade(&wrapper)));
        wrapper
    }

    fn update_picker(&mut self, update: LbState) {
        self.picker_updates.push(update);
    }

    fn request_resolution(&mut self) {
        self.resolution_requested = true;
    }

    fn authority(&self) -> String {
        self.parent.authority()
    }
}

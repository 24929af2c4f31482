//! The streaming call to the balancer and its load-reporting pipeline.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tonic::Status;
use tracing::{debug, error, info};

use crate::client::load_balancing::grpclb::channel::{BalancerChannel, BalancerStream};
use crate::client::load_balancing::grpclb::client_stats::GrpclbClientStats;
use crate::client::load_balancing::grpclb::proto::load_balance_request::LoadBalanceRequestType;
use crate::client::load_balancing::grpclb::proto::load_balance_response::LoadBalanceResponseType;
use crate::client::load_balancing::grpclb::proto::{
    ClientStats, ClientStatsPerToken, InitialLoadBalanceRequest, InitialLoadBalanceResponse,
    LoadBalanceRequest, ServerList,
};
use crate::client::load_balancing::grpclb::serverlist::Serverlist;
use crate::client::load_balancing::grpclb::{EventQueue, GrpclbEvent, GrpclbPolicy};
use crate::client::load_balancing::ChannelController;
use crate::rt::{BoxedTaskHandle, Runtime};

/// One streaming call to the balancer and the state attached to it.
///
/// The call owns two background tasks: a sender that pushes the initial
/// request and subsequent load reports onto the stream, and a receiver that
/// turns stream activity into policy events.  Both identify themselves with
/// the call's id; events from a call that is no longer current are ignored
/// by the policy.  Dropping the call aborts both tasks and any armed
/// load-report timer, which cancels the underlying RPC.
pub(super) struct BalancerCall {
    pub(super) id: u64,

    report_tx: mpsc::UnboundedSender<LoadBalanceRequest>,
    send_task: BoxedTaskHandle,
    recv_task: BoxedTaskHandle,

    /// Set once an INITIAL response has been seen; a second one is invalid.
    pub(super) seen_initial_response: bool,
    /// Set once a SERVERLIST has been seen on this call.
    pub(super) seen_serverlist: bool,

    /// The stats for client-side load reporting associated with this call.
    /// Created when the first serverlist is put to use.
    pub(super) client_stats: Option<Arc<GrpclbClientStats>>,
    pub(super) client_stats_report_interval: Option<Duration>,
    pub(super) load_report_timer: Option<BoxedTaskHandle>,
    last_report_counters_were_zero: bool,
    /// A report came due while a send was still in flight; send it as soon
    /// as that send completes.
    load_report_is_due: bool,
    /// A message has been handed to the sender task and its completion has
    /// not been observed yet.
    send_pending: bool,
}

impl BalancerCall {
    pub(super) fn start(
        id: u64,
        channel: &Arc<dyn BalancerChannel>,
        runtime: &Arc<dyn Runtime>,
        events: &Arc<EventQueue>,
        service_name: String,
        deadline: Option<Duration>,
    ) -> Self {
        let BalancerStream {
            requests,
            mut responses,
        } = channel.balance_load(deadline);

        let initial_request = LoadBalanceRequest {
            load_balance_request_type: Some(LoadBalanceRequestType::InitialRequest(
                InitialLoadBalanceRequest { name: service_name },
            )),
        };

        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<LoadBalanceRequest>();
        let send_events = events.clone();
        let send_task = runtime.spawn(Box::pin(async move {
            if requests.send(initial_request).await.is_err() {
                send_events.push(GrpclbEvent::SendFailed {
                    call_id: id,
                    error: "balancer stream closed while sending initial request".to_string(),
                });
                return;
            }
            send_events.push(GrpclbEvent::InitialRequestSent { call_id: id });
            while let Some(request) = report_rx.recv().await {
                if requests.send(request).await.is_err() {
                    send_events.push(GrpclbEvent::SendFailed {
                        call_id: id,
                        error: "balancer stream closed while sending load report".to_string(),
                    });
                    return;
                }
                send_events.push(GrpclbEvent::LoadReportSent { call_id: id });
            }
        }));

        let recv_events = events.clone();
        let recv_task = runtime.spawn(Box::pin(async move {
            loop {
                match responses.recv().await {
                    Some(Ok(response)) => recv_events.push(GrpclbEvent::BalancerMessage {
                        call_id: id,
                        response,
                    }),
                    Some(Err(status)) => {
                        recv_events.push(GrpclbEvent::CallEnded {
                            call_id: id,
                            status,
                        });
                        return;
                    }
                    None => {
                        recv_events.push(GrpclbEvent::CallEnded {
                            call_id: id,
                            status: Status::unavailable("balancer stream closed without status"),
                        });
                        return;
                    }
                }
            }
        }));

        BalancerCall {
            id,
            report_tx,
            send_task,
            recv_task,
            seen_initial_response: false,
            seen_serverlist: false,
            client_stats: None,
            client_stats_report_interval: None,
            load_report_timer: None,
            last_report_counters_were_zero: false,
            load_report_is_due: false,
            // The initial request is in flight from construction.
            send_pending: true,
        }
    }

    fn send_load_report(&mut self, request: LoadBalanceRequest) {
        self.send_pending = true;
        // A closed channel means the sender task already reported a failure;
        // the call is on its way out.
        let _ = self.report_tx.send(request);
    }
}

impl Drop for BalancerCall {
    fn drop(&mut self) {
        self.send_task.abort();
        self.recv_task.abort();
        if let Some(timer) = self.load_report_timer.take() {
            timer.abort();
        }
    }
}

fn duration_from_proto(proto: prost_types::Duration) -> Duration {
    if proto.seconds < 0 || proto.nanos < 0 {
        return Duration::ZERO;
    }
    Duration::new(proto.seconds as u64, proto.nanos as u32)
}

impl GrpclbPolicy {
    fn is_current_call(&self, call_id: u64) -> bool {
        self.lb_call.as_ref().map(|call| call.id) == Some(call_id)
    }

    pub(super) fn start_balancer_call(&mut self) {
        debug_assert!(self.lb_call.is_none());
        let Some(channel) = &self.lb_channel else {
            return;
        };
        let service_name = self
            .config
            .as_ref()
            .map(|config| config.service_name.clone())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.authority.clone());
        let id = self.next_lb_call_id;
        self.next_lb_call_id += 1;
        debug!("starting balancer call {id} for service '{service_name}'");
        self.lb_call = Some(BalancerCall::start(
            id,
            channel,
            &self.runtime,
            &self.events,
            service_name,
            self.options.call_timeout,
        ));
    }

    pub(super) fn handle_initial_request_sent(&mut self, call_id: u64) {
        if !self.is_current_call(call_id) {
            return;
        }
        let call = self.lb_call.as_mut().unwrap();
        call.send_pending = false;
        // If a load report came due before the initial request finished
        // sending, send it now.
        if call.load_report_is_due {
            call.load_report_is_due = false;
            self.send_client_load_report();
        }
    }

    pub(super) fn handle_load_report_sent(&mut self, call_id: u64) {
        if !self.is_current_call(call_id) {
            return;
        }
        self.lb_call.as_mut().unwrap().send_pending = false;
        self.schedule_next_client_load_report();
    }

    pub(super) fn handle_send_failed(
        &mut self,
        call_id: u64,
        error: String,
        channel_controller: &mut dyn ChannelController,
    ) {
        if !self.is_current_call(call_id) {
            return;
        }
        error!("balancer call {call_id} failed to send: {error}");
        self.handle_call_ended(call_id, Status::unavailable(error), channel_controller);
    }

    pub(super) fn handle_load_report_timer(&mut self, call_id: u64) {
        if !self.is_current_call(call_id) {
            return;
        }
        let call = self.lb_call.as_mut().unwrap();
        call.load_report_timer = None;
        // Wait for any in-flight send to complete before reporting; its
        // completion sends the deferred report.
        if call.send_pending {
            call.load_report_is_due = true;
        } else {
            self.send_client_load_report();
        }
    }

    fn schedule_next_client_load_report(&mut self) {
        let Some(call) = self.lb_call.as_mut() else {
            return;
        };
        let Some(interval) = call.client_stats_report_interval else {
            return;
        };
        let call_id = call.id;
        let events = self.events.clone();
        let sleep = self.runtime.sleep(interval);
        call.load_report_timer = Some(self.runtime.spawn(Box::pin(async move {
            sleep.await;
            events.push(GrpclbEvent::LoadReportTimerFired { call_id });
        })));
    }

    fn send_client_load_report(&mut self) {
        let Some(call) = self.lb_call.as_mut() else {
            return;
        };
        let Some(client_stats) = &call.client_stats else {
            return;
        };
        let snapshot = client_stats.get_and_reset();
        // Skip the report if the counters were all zero in the last report
        // and are still all zero.
        if snapshot.is_zero() {
            if call.last_report_counters_were_zero {
                self.schedule_next_client_load_report();
                return;
            }
            call.last_report_counters_were_zero = true;
        } else {
            call.last_report_counters_were_zero = false;
        }
        let request = LoadBalanceRequest {
            load_balance_request_type: Some(LoadBalanceRequestType::ClientStats(ClientStats {
                timestamp: Some(SystemTime::now().into()),
                num_calls_started: snapshot.num_calls_started,
                num_calls_finished: snapshot.num_calls_finished,
                num_calls_finished_with_client_failed_to_send: snapshot
                    .num_calls_finished_with_client_failed_to_send,
                num_calls_finished_known_received: snapshot.num_calls_finished_known_received,
                calls_finished_with_drop: snapshot
                    .drop_token_counts
                    .into_iter()
                    .map(|(token, num_calls)| ClientStatsPerToken {
                        load_balance_token: String::from_utf8_lossy(&token).into_owned(),
                        num_calls,
                    })
                    .collect(),
            })),
        };
        call.send_load_report(request);
    }

    pub(super) fn handle_balancer_message(
        &mut self,
        call_id: u64,
        response: crate::client::load_balancing::grpclb::proto::LoadBalanceResponse,
        channel_controller: &mut dyn ChannelController,
    ) {
        if !self.is_current_call(call_id) {
            return;
        }
        let Some(response_type) = response.load_balance_response_type else {
            error!("invalid LB response received: no response type set; ignoring");
            return;
        };
        match response_type {
            LoadBalanceResponseType::InitialResponse(initial) => {
                self.handle_initial_response(initial);
            }
            LoadBalanceResponseType::ServerList(server_list) => {
                self.handle_serverlist(server_list, channel_controller);
            }
            LoadBalanceResponseType::FallbackResponse(_) => {
                self.handle_fallback_response(channel_controller);
            }
        }
    }

    fn handle_initial_response(&mut self, initial: InitialLoadBalanceResponse) {
        let Some(call) = self.lb_call.as_mut() else {
            return;
        };
        if call.seen_initial_response {
            error!("invalid LB response received: duplicate initial response; ignoring");
            return;
        }
        let interval = initial
            .client_stats_report_interval
            .map(duration_from_proto)
            .unwrap_or_default();
        if interval.is_zero() {
            debug!("received initial LB response; client load reporting NOT enabled");
        } else {
            let interval = interval.max(Duration::from_secs(1));
            debug!("received initial LB response; client load reporting interval = {interval:?}");
            call.client_stats_report_interval = Some(interval);
        }
        call.seen_initial_response = true;
    }

    fn handle_serverlist(
        &mut self,
        server_list: ServerList,
        channel_controller: &mut dyn ChannelController,
    ) {
        let serverlist = Arc::new(Serverlist::from_proto(&server_list.servers));
        debug!(
            "serverlist with {} servers received:\n{}",
            serverlist.len(),
            serverlist.as_text()
        );
        let mut schedule_first_report = false;
        if let Some(call) = self.lb_call.as_mut() {
            call.seen_serverlist = true;
            // Start sending client load reports only after we start using a
            // serverlist returned from the current call.
            if call.client_stats_report_interval.is_some() && call.client_stats.is_none() {
                call.client_stats = Some(Arc::new(GrpclbClientStats::default()));
                schedule_first_report = true;
            }
        }
        if schedule_first_report {
            self.schedule_next_client_load_report();
        }
        // Check if the serverlist differs from the previous one.
        if self
            .serverlist
            .as_ref()
            .is_some_and(|current| **current == *serverlist)
        {
            debug!("incoming server list identical to current, ignoring");
            return;
        }
        if self.fallback_mode {
            info!("received serverlist from balancer; exiting fallback mode");
            self.fallback_mode = false;
        }
        if self.fallback_at_startup_checks_pending {
            self.fallback_at_startup_checks_pending = false;
            self.cancel_fallback_timer();
            self.cancel_connectivity_watch();
        }
        self.serverlist = Some(serverlist);
        self.create_or_update_child_policy(channel_controller);
    }

    fn handle_fallback_response(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.fallback_mode {
            return;
        }
        info!("entering fallback mode as requested by balancer");
        if self.fallback_at_startup_checks_pending {
            self.fallback_at_startup_checks_pending = false;
            self.cancel_fallback_timer();
            self.cancel_connectivity_watch();
        }
        self.fallback_mode = true;
        self.create_or_update_child_policy(channel_controller);
        // Reset the serverlist, so that if the balancer exits fallback mode
        // by sending the serverlist we were previously using, it is not
        // mistaken for a duplicate.
        self.serverlist = None;
    }

    pub(super) fn handle_call_ended(
        &mut self,
        call_id: u64,
        status: Status,
        channel_controller: &mut dyn ChannelController,
    ) {
        // A call that is no longer current was ended deliberately; no
        // further action is required for it.
        if !self.is_current_call(call_id) {
            return;
        }
        info!("balancer call {call_id} ended: {status:?}");
        let call = self.lb_call.take().unwrap();
        let seen_initial_response = call.seen_initial_response;
        debug_assert!(!(self.fallback_at_startup_checks_pending && call.seen_serverlist));
        drop(call);

        if self.fallback_at_startup_checks_pending {
            // Short-circuit the startup fallback timeout.
            info!("balancer call finished without receiving serverlist; entering fallback mode");
            self.fallback_at_startup_checks_pending = false;
            self.cancel_fallback_timer();
            self.cancel_connectivity_watch();
            self.fallback_mode = true;
            self.create_or_update_child_policy(channel_controller);
        } else {
            self.maybe_enter_fallback_mode_after_startup(channel_controller);
        }
        channel_controller.request_resolution();
        if seen_initial_response {
            // The balancer was reachable; reset the backoff and restart the
            // call immediately.
            self.lb_call_backoff.reset();
            self.start_balancer_call();
        } else {
            self.start_balancer_call_retry_timer();
        }
    }

    fn start_balancer_call_retry_timer(&mut self) {
        let delay = self.lb_call_backoff.backoff_duration();
        info!("connection to LB server lost; retrying in {delay:?}");
        let events = self.events.clone();
        let sleep = self.runtime.sleep(delay);
        self.retry_timer = Some(self.runtime.spawn(Box::pin(async move {
            sleep.await;
            events.push(GrpclbEvent::RetryTimerFired);
        })));
    }

    pub(super) fn handle_retry_timer(&mut self) {
        self.retry_timer = None;
        if self.lb_call.is_none() {
            debug!("restarting call to LB server");
            self.start_balancer_call();
        }
    }
}

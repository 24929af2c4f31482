/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::any::Any;
use std::error::Error;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::load_balancing::{
    ChannelController, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, Subchannel,
    SubchannelState, GLOBAL_LB_REGISTRY,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};
use crate::service::{Message, Request};

#[derive(Debug)]
pub(crate) struct EmptyMessage {}
impl Message for EmptyMessage {}

pub(crate) fn new_request() -> Request {
    Request::new(Box::pin(tokio_stream::once(
        Box::new(EmptyMessage {}) as Box<dyn Message>
    )))
}

/// A test subchannel that forwards connect calls to a channel.  This allows
/// tests to verify when a subchannel is asked to connect.
pub(crate) struct TestSubchannel {
    address: Address,
    tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl TestSubchannel {
    pub(crate) fn new(address: Address, tx_events: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self { address, tx_events }
    }
}

impl Subchannel for TestSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn connect(&self) {
        let _ = self.tx_events.send(TestEvent::Connect(self.address.clone()));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Display for TestSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

pub(crate) enum TestEvent {
    NewSubchannel(Arc<dyn Subchannel>),
    UpdatePicker(LbState),
    RequestResolution,
    Connect(Address),
}

impl Debug for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({})", sc.address()),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::Connect(addr) => write!(f, "Connect({})", addr.address),
        }
    }
}

/// A test channel controller that forwards calls to a channel.  This allows
/// tests to verify when a channel controller is asked to create subchannels
/// or update the picker.
pub(crate) struct TestChannelController {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
    pub(crate) authority: String,
}

impl TestChannelController {
    pub(crate) fn new(tx_events: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self {
            tx_events,
            authority: "test.example.com".to_string(),
        }
    }
}

impl ChannelController for TestChannelController {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel: Arc<dyn Subchannel> =
            Arc::new(TestSubchannel::new(address.clone(), self.tx_events.clone()));
        let _ = self
            .tx_events
            .send(TestEvent::NewSubchannel(subchannel.clone()));
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        let _ = self.tx_events.send(TestEvent::UpdatePicker(update));
    }

    fn request_resolution(&mut self) {
        let _ = self.tx_events.send(TestEvent::RequestResolution);
    }

    fn authority(&self) -> String {
        self.authority.clone()
    }
}

/// State shared with the closures of a stub policy.
pub(crate) struct StubPolicyData {
    pub lb_policy_options: LbPolicyOptions,
    pub test_data: Option<Box<dyn Any + Send>>,
}

type ResolverUpdateFunc = Arc<
    dyn Fn(
            &mut StubPolicyData,
            ResolverUpdate,
            Option<&LbConfig>,
            &mut dyn ChannelController,
        ) -> Result<(), Box<dyn Error + Send + Sync>>
        + Send
        + Sync,
>;
type SubchannelUpdateFunc = Arc<
    dyn Fn(&mut StubPolicyData, Arc<dyn Subchannel>, &SubchannelState, &mut dyn ChannelController)
        + Send
        + Sync,
>;
type WorkFunc = Arc<dyn Fn(&mut StubPolicyData, &mut dyn ChannelController) + Send + Sync>;
type ParseConfigFunc = Arc<
    dyn Fn(&ParsedJsonLbConfig) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>>
        + Send
        + Sync,
>;

/// The overridable behaviors of a stub policy.  Unset functions are no-ops.
#[derive(Clone, Default)]
pub(crate) struct StubPolicyFuncs {
    pub resolver_update: Option<ResolverUpdateFunc>,
    pub subchannel_update: Option<SubchannelUpdateFunc>,
    pub work: Option<WorkFunc>,
    pub parse_config: Option<ParseConfigFunc>,
}

/// Registers a stub policy under the given name, whose instances delegate to
/// the provided closures.
pub(crate) fn reg_stub_policy(name: &'static str, funcs: StubPolicyFuncs) {
    GLOBAL_LB_REGISTRY.add_builder(StubPolicyBuilder { name, funcs });
}

struct StubPolicyBuilder {
    name: &'static str,
    funcs: StubPolicyFuncs,
}

impl LbPolicyBuilder for StubPolicyBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(StubPolicy {
            funcs: self.funcs.clone(),
            data: StubPolicyData {
                lb_policy_options: options,
                test_data: None,
            },
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        match &self.funcs.parse_config {
            Some(parse_config) => parse_config(config),
            None => Ok(None),
        }
    }
}

struct StubPolicy {
    funcs: StubPolicyFuncs,
    data: StubPolicyData,
}

impl LbPolicy for StubPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        match &self.funcs.resolver_update {
            Some(resolver_update) => {
                resolver_update(&mut self.data, update, config, channel_controller)
            }
            None => Ok(()),
        }
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if let Some(subchannel_update) = &self.funcs.subchannel_update {
            subchannel_update(&mut self.data, subchannel, state, channel_controller);
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(work) = &self.funcs.work {
            work(&mut self.data, channel_controller);
        }
    }

    fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {}
}

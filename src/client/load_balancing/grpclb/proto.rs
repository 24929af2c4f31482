//! Message types for the `grpc.lb.v1.LoadBalancer` service, mirroring
//! `grpc/lb/v1/load_balancer.proto`.

use bytes::Bytes;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoadBalanceRequest {
    #[prost(oneof = "load_balance_request::LoadBalanceRequestType", tags = "1, 2")]
    pub load_balance_request_type: Option<load_balance_request::LoadBalanceRequestType>,
}

pub mod load_balance_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum LoadBalanceRequestType {
        /// This message should be sent on the first request to the load
        /// balancer.
        #[prost(message, tag = "1")]
        InitialRequest(super::InitialLoadBalanceRequest),
        /// The client stats should be periodically reported to the load
        /// balancer based on the duration defined in the
        /// InitialLoadBalanceResponse.
        #[prost(message, tag = "2")]
        ClientStats(super::ClientStats),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitialLoadBalanceRequest {
    /// The name of the load balanced service (e.g., service.googleapis.com).
    /// Its length should be less than 256 bytes.  The name might include a
    /// port number.
    #[prost(string, tag = "1")]
    pub name: String,
}

/// Contains the number of calls finished for a particular load balance token.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientStatsPerToken {
    /// See Server.load_balance_token.
    #[prost(string, tag = "1")]
    pub load_balance_token: String,

    /// The total number of RPCs that finished associated with the token.
    #[prost(int64, tag = "2")]
    pub num_calls: i64,
}

/// Contains client level statistics that are useful to load balancing. Each
/// count except the timestamp should be reset to zero after reporting the
/// stats.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientStats {
    /// The timestamp of generating the report.
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<::prost_types::Timestamp>,

    /// The total number of RPCs that started.
    #[prost(int64, tag = "2")]
    pub num_calls_started: i64,

    /// The total number of RPCs that finished.
    #[prost(int64, tag = "3")]
    pub num_calls_finished: i64,

    /// The total number of RPCs that failed to reach a server except dropped
    /// RPCs.
    #[prost(int64, tag = "6")]
    pub num_calls_finished_with_client_failed_to_send: i64,

    /// The total number of RPCs that finished and are known to have been
    /// received by a server.
    #[prost(int64, tag = "7")]
    pub num_calls_finished_known_received: i64,

    /// The list of dropped calls.
    #[prost(message, repeated, tag = "8")]
    pub calls_finished_with_drop: Vec<ClientStatsPerToken>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoadBalanceResponse {
    #[prost(oneof = "load_balance_response::LoadBalanceResponseType", tags = "1, 2, 3")]
    pub load_balance_response_type: Option<load_balance_response::LoadBalanceResponseType>,
}

pub mod load_balance_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum LoadBalanceResponseType {
        /// This message should be sent on the first response to the client.
        #[prost(message, tag = "1")]
        InitialResponse(super::InitialLoadBalanceResponse),
        /// Contains the list of servers selected by the load balancer. The
        /// client should send requests to these servers in the specified
        /// order.
        #[prost(message, tag = "2")]
        ServerList(super::ServerList),
        /// If this field is set, then the client should eagerly enter
        /// fallback mode (even if there are existing, healthy connections to
        /// backends).
        #[prost(message, tag = "3")]
        FallbackResponse(super::FallbackResponse),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FallbackResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitialLoadBalanceResponse {
    /// This interval defines how often the client should send the client
    /// stats to the load balancer. Stats should only be reported when the
    /// duration is positive.
    #[prost(message, optional, tag = "2")]
    pub client_stats_report_interval: Option<::prost_types::Duration>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerList {
    /// Contains a list of servers selected by the load balancer. The list
    /// will be updated when server resolutions change or as needed to
    /// balance load across more servers. The client should consume the
    /// server list in order unless instructed otherwise via the client
    /// config.
    #[prost(message, repeated, tag = "1")]
    pub servers: Vec<Server>,
}

/// Contains server information. When the drop field is not true, use the
/// other fields.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Server {
    /// A resolved address for the server, serialized in network-byte-order.
    /// It may either be an IPv4 or IPv6 address.
    #[prost(bytes = "bytes", tag = "1")]
    pub ip_address: Bytes,

    /// A resolved port number for the server.
    #[prost(int32, tag = "2")]
    pub port: i32,

    /// An opaque but printable token for load reporting. The client must
    /// include the token of the picked server into the initial metadata when
    /// it starts a call to that server. The token is used by the server to
    /// verify the request and to allow the server to report load to the gRPC
    /// LB system. The token is also used in client stats for reporting
    /// dropped calls.
    ///
    /// Its length can be variable but must be less than 50 bytes.
    #[prost(string, tag = "3")]
    pub load_balance_token: String,

    /// Indicates whether this particular request should be dropped by the
    /// client. If the request is dropped, there will be a corresponding entry
    /// in ClientStats.calls_finished_with_drop.
    #[prost(bool, tag = "4")]
    pub drop: bool,
}

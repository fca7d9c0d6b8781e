//! The relay core: request context, pricing, quota accounting, the adapter
//! contract, and the orchestrator that drives one request end to end.
//!
//! This crate performs no HTTP IO of its own. Adapters (qgate-channel) own
//! the upstream wire; the inbound HTTP layer (apps/qgate) owns the client
//! socket behind the [`sink::ClientSink`] abstraction.

pub mod adapter;
pub mod channel;
pub mod error;
pub mod info;
pub mod ledger;
pub mod pricing;
pub mod relay;
pub mod sink;
pub mod thinking;
pub mod token;

pub use adapter::{
    AdapterFactory, AdapterRegistry, ChannelAdapter, UpstreamBody, UpstreamResponse, Usage,
};
pub use channel::Channel;
pub use error::{
    apply_status_code_remap, normalize_upstream_error, scrub_transport_message, RelayError,
};
pub use info::{ApiType, InboundRequest, RelayInfo, RelayMode, ThinkingVariant};
pub use ledger::{
    LogUsageSink, MemoryLedger, NoopUsageSink, QuotaLedger, Reservation, SharedUsageSink,
    UsageRecord, UsageSink,
};
pub use pricing::{ModelPrice, PriceData, PriceTable, PricingOracle};
pub use relay::{Relay, RelayDeps};
pub use sink::{BufferSink, ClientSink, HttpSink, SinkError, StreamHead};
pub use token::{count_prompt_tokens, TiktokenCounter, TokenCounter};

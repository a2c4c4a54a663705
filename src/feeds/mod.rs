//! Upstream market-data sources: the streaming price feed and the snapshot
//! poller, plus the typed REST client they share.

pub mod coincap_rest;
pub mod coincap_ws;
pub mod sampler;

pub use coincap_rest::CoinCapRestClient;
pub use coincap_ws::PriceFeedConsumer;
pub use sampler::SnapshotSampler;

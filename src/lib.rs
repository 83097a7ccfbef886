pub mod broker;
pub mod config;
pub mod errors;
pub mod fanout;
pub mod feed;
pub mod follow_reactor;
pub mod http;
pub mod message;
pub mod metrics;
pub mod recovery;
pub mod ring_buffer;
pub mod timeline_cache;
pub mod timeline_store;
pub mod warm_sweep;
pub mod worker;

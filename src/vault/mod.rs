pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod glacier;
pub mod ledger;
pub mod local_store;
pub mod paths;
pub mod pipeline;
pub mod producer;
pub mod store;
pub mod transport;
pub mod treehash;
pub mod util;
pub mod warn;

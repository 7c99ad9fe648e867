pub mod config;
pub mod coordinator;
pub mod entry;
pub mod logging;
pub mod matching;
pub mod query;
pub mod storage;
pub mod stream;
pub mod tap;
pub mod trace;

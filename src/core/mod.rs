//! Core modules: the command gate, the executor, the audit ledger and the
//! model provenance envelope, plus the shared primitives they use.

pub mod cancel;
pub mod config;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod gate;
pub mod ledger;
pub mod model_client;
pub mod output;
pub mod session;
pub mod time;

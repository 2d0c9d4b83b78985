//! Reliability, deduplication, and worker-pool dispatch for a CoAP endpoint.
//!
//! Built around [`coap_wire`]'s pure packet codec: this crate owns the UDP
//! socket, retransmits CONfirmable messages until ACKed, deduplicates
//! retried work, chains block-wise transfers, and fans inbound requests out
//! to a small pool of worker threads.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod net;
pub mod resource;
pub mod retry;
pub mod transaction;
pub mod worker;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, What, When};
pub use net::Addrd;
pub use resource::{Resource, ResourceManager};
pub use transaction::TransactionPool;

//! Media Engine
//!
//! Workers, routers, transports, producers and consumers. The signaling
//! layer drives this module; it never talks to clients itself.

mod consumer;
pub mod dtls;
mod error;
mod media;
mod producer;
mod router;
mod transport;
mod worker;

pub use consumer::{Consumer, ConsumerStats, CONSUMER_PACKET_CHANNEL_CAPACITY};
pub use error::EngineError;
pub use producer::{Producer, ProducerStats};
pub use router::{CloseReport, ProduceRequest, Router, RouterEvent};
pub use transport::WebRtcTransport;
pub use worker::{Worker, WorkerPool, WorkerSettings};

/// NATS integration module
///
/// Provides the live transport used to subscribe to sources and the
/// JetStream publisher used to fan composed documents back out

pub mod envelope;
pub mod publisher;
pub mod transport;

pub use envelope::StreamEnvelope;
pub use publisher::{NatsConfig, NatsPublisher};
pub use transport::NatsTransport;

//! # Databroker: Live Data Mapping Engine
//!
//! Databroker keeps live connections to vendor sources, caches the latest
//! event per entity and maps vendor documents onto declarative output
//! schemas.
//!
//! ## Features
//!
//! - **Schema transformer**: JSON-Schema-like mapping trees with `source` paths, `value` templates, constants and defaults
//! - **Placeholder substitution**: typed `${path}` templates resolved against vendor documents
//! - **Value handlers**: `Date.*` and `String.*` operations plus named domain helpers
//! - **Serialized queue**: per-key FIFO execution for reconnects and other exclusive work
//! - **Streaming dispatcher**: per-source connections, entity cache, wildcard queries and stream consumers
//! - **NATS integration**: live transport over NATS subjects and JetStream publishing of composed documents
//!
//! ## Example: Schema
//!
//! ```yaml
//! $id: https://standards.oftrust.net/v2/Context/Identity/Product/Elevator/
//! type: object
//! properties:
//!   "@type":
//!     type: string
//!     const: Elevator
//!   idLocal:
//!     type: string
//!     source: unitId
//!   name:
//!     type: string
//!     value: "Elevator ${unitId} (${building.name})"
//!   updated:
//!     type: string
//!     source: ts
//!     function: Date.toISOString
//! ```

// Mapping core
pub mod extraction;
pub mod template;
pub mod handler_registry;
pub mod schema;
pub mod transformer;

// Streaming runtime
pub mod queue;
pub mod cache;
pub mod transport;
pub mod consumer;
pub mod dispatcher;

// NATS integration
pub mod nats;

pub mod config;
pub mod error;

// Re-export key types
pub use extraction::{FieldPath, PathSegment};
pub use template::{Template, substitute, iso_timestamp};
pub use handler_registry::{HandlerRegistry, HandlerSpec, HandlerInput, parse_timestamp};
pub use schema::{SchemaNode, SchemaCatalog, SchemaType, SourcePath};
pub use transformer::Transformer;

pub use queue::{SerializedQueue, TicketId, TicketState};
pub use cache::{EntityCache, CacheHit};
pub use transport::{LiveTransport, TransportFactory, EventStream, MemoryTransport};
pub use consumer::{StreamConsumer, StreamContext, ConsumerRegistry, LogConsumer, NatsPublishConsumer};
pub use dispatcher::{Dispatcher, DispatcherOptions, ConnectionState};

pub use nats::{NatsConfig, NatsPublisher, NatsTransport, StreamEnvelope};

pub use config::{BrokerConfig, SourceConfig, HandshakeConfig};
pub use error::{
    HandlerError, TemplateError, SchemaError, TransformError, TransportError,
    ConnectionError, ConsumerError, ConfigError, EventError,
};

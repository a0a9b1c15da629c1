/*!
# EdgeFleet core

Client-side runtime for a fleet of edge nodes reached over pub/sub:

- `store` / `facade`: what the client knows about the fleet (node state, liveness, network view)
- `requests`: correlation of asynchronous notifications with the commands that caused them
- `schema` / `models`: schema-validated pipelines, capture threads and plugin instances
- `dispatch` / `client` / `transport`: inbound routing and outbound commands
*/

pub mod catalog;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod facade;
pub mod models;
pub mod requests;
pub mod schema;
pub mod store;
pub mod transport;

pub use catalog::{DirectoryCatalog, SchemaCatalog, StaticCatalog};
pub use client::FleetClient;
pub use config::{load_config, ClientConfig, StateConfig, StateMode};
pub use dispatch::{Dispatched, Dispatcher, EventType};
pub use error::{
    CatalogError, ClientError, ConfigError, RequestError, StoreError, TransportError, ValidationError,
};
pub use facade::{Fleet, FleetMember, NodeStatus, StateFacade, StoreMode};
pub use models::{DataCaptureThread, Pipeline, PluginInstance, Schedule};
pub use requests::{
    AllTargetsOk, Notification, NotificationPath, PathKey, RequestRegistry, RequestTimeouts,
    RequestTracker, Resolution, ResolutionStrategy,
};
pub use schema::{Config, SchemaDefinition};
pub use store::{LocalStore, MemoryBackend, SharedStore, StateStore, Subscriber};
pub use transport::{MqttTransport, Signer, Transport, Unsigned};

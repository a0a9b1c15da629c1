/*!
# EdgeFleet DevKit - test tooling for fleet clients

- mock transport recording published commands
- builders for heartbeats, notifications and network payloads
- schema builders and on-disk catalogs
- a harness wiring a complete in-process client, with simulated nodes
*/

pub mod mqtt_stub;
pub mod schema_helpers;
pub mod test_utils;

pub use mqtt_stub::{EdgeMessageBuilder, MockMessage, MockTransport};
pub use schema_helpers::{write_catalog, SchemaBuilder};
pub use test_utils::{init_tracing, Reply, TestHarness};

//! Transport layer.
//!
//! - [`RequestBuilder`] turns a tile request into a [`TileHttpRequest`]
//! - [`TileTransport`] executes a request synchronously (pooled strategy)
//! - [`PipelineFactory`] executes requests as event streams, one logical
//!   connection per tile (pipelined strategy)

mod pipeline;
mod request;
mod transport;

pub use pipeline::{
    ConnectionEvent, ConnectionId, EventReceiver, EventSender, HttpPipelineFactory,
    PipelineFactory,
};
pub use request::{RequestBuilder, TileHttpRequest, UrlTemplateBuilder, DEFAULT_TILE_FORMAT};
pub use transport::{HttpTransport, TileTransport, DEFAULT_TRANSPORT_TIMEOUT};

//! # Observability Module
//!
//! - **Structured Logging**: pretty or JSON logs filtered by `RUST_LOG`
//! - **Request Tracing**: request IDs attached to every HTTP request span
//!
//! ## Usage
//!
//! ```rust,ignore
//! use axum::Router;
//! use keel_node::observability::{init_logging, request_id_middleware, LogFormat};
//!
//! init_logging("info", LogFormat::Json);
//!
//! let app: Router<()> =
//!     Router::new().layer(axum::middleware::from_fn(request_id_middleware));
//! ```

mod logging;
pub mod middleware;

pub use logging::{default_filter, init_logging, LogFormat};
pub use middleware::{request_id_middleware, RequestId, REQUEST_ID_HEADER};

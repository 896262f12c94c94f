//! # Draftline Client
//!
//! Async round trips for [`draftline_engine`]: the orchestrator that sends
//! operation batches to the save endpoint and settles the responses, the
//! throttle that collapses recalculations, and the HTTP endpoint.
//!
//! ```no_run
//! use draftline_client::{Config, HttpEndpoint, Orchestrator, SerdeCodec};
//! use draftline_engine::{presets, Document, Entity, ReconciliationContext};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_env()?;
//! let doc = Document::new(Entity::new("order-1", presets::CUSTOMER_ORDER));
//! let ctx = ReconciliationContext::new_document(presets::customer_order_schema(), doc)?;
//!
//! let orchestrator = Orchestrator::new(
//!     ctx,
//!     HttpEndpoint::from_config(&config)?,
//!     SerdeCodec,
//!     config.throttle,
//! );
//! orchestrator.save().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod orchestrator;
pub mod throttle;

pub use codec::{DocumentCodec, SerdeCodec};
pub use config::{Config, ConfigError};
pub use endpoint::{HttpEndpoint, OperationResult, SaveAction, SaveEndpoint};
pub use error::{ClientError, ClientResult, EndpointError};
pub use orchestrator::{Orchestrator, RoundTripOutcome};
pub use throttle::Throttle;

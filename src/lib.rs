//! # TekScope-RS: Serial Oscilloscope Bridge
//!
//! Bridges an oscilloscope with a binary serial protocol and a serial control
//! surface (encoders, switches, LEDs) to any number of network subscribers.
//! Decoded captures and control changes are pushed to every subscriber as
//! newline-delimited JSON.
//!
//! ## Architecture
//!
//! - **Backend**: the acquisition loop drives the scope (`S G`, `S B`), decodes
//!   each memory dump and publishes it
//! - **Controls**: the control panel loop parses 2-byte event frames and runs
//!   each control's action (capture setting changes, LED writes, UI echoes)
//! - **Fan-out**: a registry of subscribers, fed by both loops and filled by a
//!   TCP listener
//! - **Communication**: the loops only share the write-through capture settings
//!   and the fan-out registry; each owns its serial link
//!
//! ## Configuration
//!
//! Settings live in a TOML file, by default under the platform config
//! directory in `tekscope-rs/tekscope.toml`. See [`config::ServiceConfig`].
//!
//! ## Example
//!
//! ```ignore
//! use tekscope_rs::{
//!     backend::{PortLink, ScopeService},
//!     config::ServiceConfig,
//!     fanout::FanoutRegistry,
//! };
//!
//! let config = ServiceConfig::load_or_default(None)?;
//! let scope = PortLink::open_scope("/dev/ttyUSB0", &config.scope)?;
//! let panel = PortLink::open_panel("/dev/ttyUSB1", &config.panel)?;
//!
//! let fanout = Arc::new(FanoutRegistry::new());
//! let service = ScopeService::start(&config, Box::new(scope), Box::new(panel), fanout)?;
//! // ...
//! service.stop();
//! ```

pub mod backend;
pub mod config;
pub mod controls;
pub mod error;
pub mod fanout;
pub mod types;

// Re-export commonly used types
pub use backend::{ScopeService, ServiceReport};
pub use config::{CaptureConfig, ServiceConfig};
pub use controls::ControlRegistry;
pub use error::{ProtocolError, Result, ScopeError};
pub use fanout::{FanoutRegistry, SubscriberId, SubscriberServer};
pub use types::{Record, Sample};

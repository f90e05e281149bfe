//! Flowline Engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Checkpointed ingestion and transformation of flows.
//!
//! # Components
//!
//! - **Processor pipeline** ([`processor`]): pulls pages from checkpointed
//!   sources, validates them and writes write-once packages
//! - **File ingestion** ([`controller`]): polls an inbox, ingests one file per
//!   tick and never consumes a logged file twice
//! - **Checkpoint ledger** ([`ledger`]) and **source adapter** ([`source`])
//! - **Processing loop** ([`engine`]) with per-record fault isolation
//! - **Retry** ([`retry`]), **storage** ([`storage`]), **scheduling** ([`schedule`])
//!
//! # Example
//!
//! ```no_run
//! use flowline_engine::{
//!     config::EngineConfig,
//!     model::FlowId,
//!     processor::{Processor, ProcessorSettings},
//!     source::VecSource,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::from_env()?;
//!     let settings = ProcessorSettings::new(FlowId::from("assets"), "device", &config);
//!     let processor = Processor::builder(settings, config.state_repository(), |raw: &String| {
//!         Ok(raw.to_uppercase())
//!     })
//!     .with_record_source("device_export", Arc::new(VecSource::new(vec!["a".to_string()])))
//!     .build()?;
//!
//!     processor.run_once().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod controller;
pub mod engine;
pub mod ledger;
pub mod model;
pub mod processor;
pub mod retry;
pub mod rules;
pub mod schedule;
pub mod source;
pub mod storage;

pub use config::{EngineConfig, FlowDefinition, FlowsFile};
pub use controller::{ControllerRegistry, FlowController, FlowControllerService, TickEvent, TickOutcome};
pub use engine::{ErrorPolicy, ItemProcessor, ProcessorEngine, RunSummary};
pub use model::{Checkpoint, Flow, FlowFile, FlowId};
pub use processor::{Processor, ProcessorSettings, RunOutcome};
pub use retry::{Retry, RetryConfig};

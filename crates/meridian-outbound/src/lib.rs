//! # meridian-outbound
//!
//! Outbound traffic scheduler for the Meridian virtual-world server.
//!
//! Every tick, thousands of simulated objects and a handful of peer servers
//! compete for one outbound byte budget. This crate decides which buffered
//! message is handed to the network next: a two-stage weighted fair queueing
//! engine in which an inner scheduler arbitrates between source objects
//! (client fairness) and an outer scheduler arbitrates between destination
//! servers under the global rate cap, tolerating transport backpressure
//! without ever reordering a flow's own messages.
//!
//! ## Crate structure
//!
//! - [`types`] — identity newtypes and the outbound message carrier
//! - [`scheduler`] — generic weighted fair scheduler (one per stage)
//! - [`pipeline`] — two-stage composition and the per-tick service pass
//! - [`backpressure`] — transport outcome handling and depth reporting
//! - [`transport`] — transport and statistics collaborator seams
//! - [`config`] — validated pipeline/runtime configuration
//! - [`stats`] — serializable pipeline counters
//! - [`runtime`] — dedicated worker thread driving the pipeline
//!
//! The crate owns no sockets and no wire format; payload bytes are opaque.

mod flow;

pub mod backpressure;
pub mod config;
pub mod pipeline;
pub mod runtime;
pub mod scheduler;
pub mod stats;
pub mod transport;
pub mod types;

pub use backpressure::DepthReport;
pub use config::{
    ConfigError, PipelineConfig, PipelineConfigInput, RuntimeConfig, SystemTrafficPolicy,
};
pub use pipeline::{EnqueueError, PipelineEvent, SendPipeline};
pub use runtime::{OutboundRuntime, SubmitError};
pub use scheduler::{Drained, FairScheduler, SchedulerError, Selection};
pub use stats::PipelineStats;
pub use transport::{NullSink, SendOutcome, StatsSink, Transport};
pub use types::{FlowKey, ObjectId, OutboundMessage, ServerId};

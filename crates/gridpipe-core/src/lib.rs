//! Pipeline orchestration over grid execution backends.
//!
//! A [`Pipeline`] runs registered [`Stage`] implementations strictly in
//! configured order against one [`GridClient`] backend. Stages submit map
//! and vanilla operations through the per-run [`Dispatcher`], which stages
//! the code archive and checkpoints before anything reaches the backend,
//! and pass scalars to later stages through the [`ContextBag`].

pub mod archive;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod ignore;
pub mod pipeline;
pub mod secrets;
pub mod stage;

pub use archive::{BuiltArchive, CodePackager, OpKind};
pub use checkpoint::CheckpointRequest;
pub use config::{ExtraPath, PipelineConfig, UploadManifest};
pub use context::{ContextBag, ContextValue};
pub use dispatch::{Dispatcher, ExecutionResult, MapRequest, VanillaRequest};
pub use error::PipelineError;
pub use ignore::IgnoreRules;
pub use pipeline::Pipeline;
pub use secrets::Secrets;
pub use stage::{Stage, StageContext};

pub use gridpipe_client::{GridClient, Mode};
pub use gridpipe_ir::{QueryOp, Row, TablePath};

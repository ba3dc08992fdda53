//! Stage contract and the context a running stage works with.

use gridpipe_client::GridClient;
use serde::de::DeserializeOwned;

use crate::config::PipelineConfig;
use crate::context::ContextBag;
use crate::dispatch::{Dispatcher, ExecutionResult, MapRequest, VanillaRequest};
use crate::error::PipelineError;
use crate::secrets::Secrets;

/// One named unit of pipeline work.
///
/// A stage issues operations through its [`StageContext`] and communicates
/// with later stages through tables and the context bag. Implementations
/// must not assume anything about other stages beyond declared order.
pub trait Stage {
    fn name(&self) -> &str;

    fn run(&mut self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError>;
}

/// Everything a stage may touch while it runs.
pub struct StageContext<'a> {
    pub client: &'a dyn GridClient,
    pub config: &'a PipelineConfig,
    /// Parsed `stages/<name>/config.yaml`; `Null` when the stage has none.
    pub stage_config: serde_yaml::Value,
    pub secrets: &'a Secrets,
    pub dispatcher: &'a mut Dispatcher,
    pub bag: &'a mut ContextBag,
}

impl StageContext<'_> {
    pub fn run_map(&mut self, request: &MapRequest) -> Result<ExecutionResult, PipelineError> {
        self.dispatcher.run_map(self.client, request)
    }

    pub fn run_vanilla(
        &mut self,
        request: &VanillaRequest,
    ) -> Result<ExecutionResult, PipelineError> {
        self.dispatcher.run_vanilla(self.client, request)
    }

    /// Deserialize the stage config into a typed parameter struct.
    pub fn stage_config_as<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        Ok(serde_yaml::from_value(self.stage_config.clone())?)
    }
}

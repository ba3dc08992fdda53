//! Pipeline orchestration: registered stages over one backend.

use gridpipe_client::{create_client, GridClient};
use tracing::{info, info_span};

use crate::config::{self, PipelineConfig};
use crate::context::ContextBag;
use crate::dispatch::Dispatcher;
use crate::error::PipelineError;
use crate::secrets::Secrets;
use crate::stage::{Stage, StageContext};

/// Owns the backend client, the secrets, and the registered stages.
///
/// Stages execute strictly sequentially in the order the configuration
/// declares them. Each run gets its own [`Dispatcher`] and [`ContextBag`];
/// nothing is shared between runs except backend state.
pub struct Pipeline {
    config: PipelineConfig,
    secrets: Secrets,
    client: Box<dyn GridClient>,
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// The backend is chosen once here, from the configured mode.
    pub fn new(config: PipelineConfig, secrets: Secrets) -> Result<Self, PipelineError> {
        let options = config.client_options(&secrets);
        let client = create_client(config.mode, &options)?;
        Ok(Self {
            config,
            secrets,
            client,
            stages: Vec::new(),
        })
    }

    /// Build against a caller-supplied backend.
    pub fn with_client(
        config: PipelineConfig,
        secrets: Secrets,
        client: Box<dyn GridClient>,
    ) -> Self {
        Self {
            config,
            secrets,
            client,
            stages: Vec::new(),
        }
    }

    pub fn register(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(stage);
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn client(&self) -> &dyn GridClient {
        self.client.as_ref()
    }

    /// Run the configured stages in declared order; an empty selection runs
    /// them all. Unknown selection names and configured stages without a
    /// registered implementation fail before any stage executes. The first
    /// stage error halts the run; earlier stages' side effects stay.
    pub fn run(&mut self, selection: &[String]) -> Result<ContextBag, PipelineError> {
        for name in selection {
            if !self.config.stages.iter().any(|s| s == name) {
                return Err(PipelineError::UnknownStage(name.clone()));
            }
        }
        let selected: Vec<String> = self
            .config
            .stages
            .iter()
            .filter(|s| selection.is_empty() || selection.contains(*s))
            .cloned()
            .collect();
        let mut order = Vec::with_capacity(selected.len());
        for name in &selected {
            match self.stages.iter().position(|s| s.name() == name.as_str()) {
                Some(index) => order.push(index),
                None => return Err(PipelineError::UnknownStage(name.clone())),
            }
        }

        let code_root = self.config.resolve_code_root()?;
        let mut dispatcher = Dispatcher::new(&self.config, &self.secrets, code_root.clone());
        let mut bag = ContextBag::new();
        info!(
            mode = %self.config.mode,
            stages = selected.len(),
            "pipeline starting"
        );

        for (name, index) in selected.iter().zip(order) {
            let span = info_span!("stage", name = %name);
            let _guard = span.enter();
            info!(stage = %name, "stage starting");

            let stage_config = config::load_stage_config(&code_root, name)?;
            let mut ctx = StageContext {
                client: self.client.as_ref(),
                config: &self.config,
                stage_config,
                secrets: &self.secrets,
                dispatcher: &mut dispatcher,
                bag: &mut bag,
            };
            if let Err(source) = self.stages[index].run(&mut ctx) {
                return Err(PipelineError::Stage {
                    name: name.clone(),
                    source: Box::new(source),
                });
            }
            info!(stage = %name, "stage complete");
        }

        Ok(bag)
    }
}

use std::path::Path;

use anyhow::{Context, Result};
use gridpipe_client::create_client;
use gridpipe_core::{PipelineConfig, Secrets, TablePath};

/// Execute the `count` command: row count of one staged table through the
/// configured backend.
pub fn execute(config_path: &Path, secrets_path: &Path, table: &str) -> Result<()> {
    let config = PipelineConfig::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let secrets = Secrets::load_optional(secrets_path)?;
    let client = create_client(config.mode, &config.client_options(&secrets))?;

    let path = TablePath::new(table);
    let count = client
        .row_count(&path)
        .with_context(|| format!("failed to count {path}"))?;
    println!("{count}");
    Ok(())
}

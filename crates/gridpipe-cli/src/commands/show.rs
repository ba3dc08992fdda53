use std::path::Path;

use anyhow::{Context, Result};
use gridpipe_client::create_client;
use gridpipe_core::{PipelineConfig, Secrets, TablePath};

/// Execute the `show` command: print the first `limit` rows of a staged
/// table, one JSON object per line.
pub fn execute(config_path: &Path, secrets_path: &Path, table: &str, limit: usize) -> Result<()> {
    let config = PipelineConfig::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let secrets = Secrets::load_optional(secrets_path)?;
    let client = create_client(config.mode, &config.client_options(&secrets))?;

    let path = TablePath::new(table);
    let rows = client
        .read_table(&path)
        .with_context(|| format!("failed to read {path}"))?;
    for row in rows.take(limit) {
        let row = row?;
        println!("{}", serde_json::to_string(&row)?);
    }
    Ok(())
}

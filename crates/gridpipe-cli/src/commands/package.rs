use std::path::Path;

use anyhow::{Context, Result};
use gridpipe_core::{CodePackager, PipelineConfig};

/// Execute the `package` command: build the code archive and print what went
/// into it. Nothing is uploaded.
pub fn execute(config_path: &Path) -> Result<()> {
    let config = PipelineConfig::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let code_root = config.resolve_code_root()?;

    let archive = CodePackager::new(&code_root, &config.upload, &config.stages)
        .build()
        .context("failed to build the code archive")?;

    for entry in &archive.entries {
        println!("{entry}");
    }
    println!();
    println!(
        "{} files, {} bytes compressed",
        archive.entries.len(),
        archive.bytes.len()
    );
    if archive.stages.is_empty() {
        println!("stages packaged: none");
    } else {
        println!("stages packaged: {}", archive.stages.join(", "));
    }
    println!("sha256 {}", archive.sha256);
    Ok(())
}

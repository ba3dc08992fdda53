use std::path::Path;

use anyhow::{Context, Result};
use gridpipe_core::archive::{self, OpKind};
use gridpipe_core::config::load_stage_config;
use gridpipe_core::{CodePackager, Mode, PipelineConfig, Secrets};

/// Execute the `check` command: validate configuration, secrets, and the
/// upload manifest without touching any backend.
pub fn execute(config_path: &Path, secrets_path: &Path) -> Result<()> {
    let config = PipelineConfig::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    config.resources.validate()?;
    anyhow::ensure!(!config.stages.is_empty(), "no stages configured");
    println!(
        "{:16} OK ({} mode, {} stages)",
        "Configuration:",
        config.mode,
        config.stages.len()
    );

    let secrets = Secrets::load_optional(secrets_path)?;
    if secrets.is_empty() {
        println!("{:16} none loaded", "Secrets:");
    } else {
        println!("{:16} {} entries", "Secrets:", secrets.len());
    }

    let code_root = config.resolve_code_root()?;
    anyhow::ensure!(
        code_root.is_dir(),
        "code root {} does not exist",
        code_root.display()
    );

    for stage in &config.stages {
        load_stage_config(&code_root, stage)
            .with_context(|| format!("stage '{stage}' config does not parse"))?;
        let kinds: Vec<&str> = [OpKind::Map, OpKind::Vanilla]
            .into_iter()
            .filter(|kind| code_root.join(archive::stage_entry(stage, *kind)).is_file())
            .map(OpKind::as_str)
            .collect();
        let label = format!("Stage {stage}:");
        if kinds.is_empty() {
            println!("{label:16} no entry scripts");
        } else {
            println!("{label:16} {}", kinds.join(", "));
        }
    }

    // The archive only matters when operations will run on the cluster.
    match config.mode {
        Mode::Remote => {
            let archive = CodePackager::new(&code_root, &config.upload, &config.stages)
                .build()
                .context("upload manifest does not package")?;
            println!(
                "{:16} OK ({} files, sha256 {})",
                "Code archive:",
                archive.entries.len(),
                &archive.sha256[..12]
            );
        }
        Mode::Local => {
            println!("{:16} skipped (local mode)", "Code archive:");
        }
    }

    println!("\nAll checks passed.");
    Ok(())
}

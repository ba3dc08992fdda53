//! Deterministic code archive packaging.
//!
//! The archive carries everything a cluster job needs to run stage code: the
//! `runtime/` support directory, one `stages/<name>/` subtree per packaged
//! stage, any extra modules and paths the pipeline declares, and one wrapper
//! script per stage and operation kind at the archive root. The same inputs
//! always produce the same bytes: sorted entries, zeroed timestamps, fixed
//! ownership and permissions.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use gridpipe_ir::TablePath;
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::config::UploadManifest;
use crate::error::PipelineError;
use crate::ignore::IgnoreRules;

/// Implicit archive target for the runtime-support directory.
pub const RUNTIME_TARGET: &str = "runtime";
/// Archive target namespace for stage subtrees.
pub const STAGES_TARGET: &str = "stages";
/// File name the archive takes in the job sandbox and under the deploy root.
pub const ARCHIVE_NAME: &str = "code.tar.gz";

const RESERVED_TARGETS: [&str; 2] = [RUNTIME_TARGET, STAGES_TARGET];

/// The two operation shapes a stage can run on workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Map,
    Vanilla,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Map => "map",
            OpKind::Vanilla => "vanilla",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wrapper script name for one stage and operation kind.
pub fn wrapper_name(stage: &str, kind: OpKind) -> String {
    format!("operation_wrapper_{stage}_{kind}.sh")
}

/// Entry script a stage's workers run, relative to the code root and to the
/// extracted archive alike.
pub fn stage_entry(stage: &str, kind: OpKind) -> PathBuf {
    PathBuf::from(format!("{STAGES_TARGET}/{stage}/src/{kind}.sh"))
}

/// Command a cluster sandbox runs: extract the staged archive, then hand off
/// to the stage's wrapper script.
pub fn bootstrap_command(stage: &str, kind: OpKind) -> String {
    let script = format!(
        "set -e\ntar -xzf {ARCHIVE_NAME}\n./{}",
        wrapper_name(stage, kind)
    );
    format!("bash -c '{}'", script.replace('\'', "'\"'\"'"))
}

/// Where the archive is uploaded, under the deployment root.
pub fn deploy_path(deploy_root: &str) -> TablePath {
    TablePath::new(format!("{deploy_root}/.build/{ARCHIVE_NAME}"))
}

/// A finished archive, held in memory until uploaded.
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    /// Gzip-compressed tar bytes.
    pub bytes: Vec<u8>,
    /// Hex SHA-256 fingerprint of `bytes`.
    pub sha256: String,
    /// Sorted archive member paths.
    pub entries: Vec<String>,
    /// Stages whose subtrees made it into the archive.
    pub stages: Vec<String>,
}

impl BuiltArchive {
    pub fn contains(&self, entry: &str) -> bool {
        self.entries.binary_search_by(|e| e.as_str().cmp(entry)).is_ok()
    }
}

/// Assembles the code archive from the code root and the upload manifest.
pub struct CodePackager<'a> {
    code_root: &'a Path,
    manifest: &'a UploadManifest,
    stages: &'a [String],
}

enum Origin {
    Runtime,
    Stage(String),
    Extra,
}

struct Source {
    target: String,
    dir: PathBuf,
    origin: Origin,
    describe: String,
}

impl<'a> CodePackager<'a> {
    pub fn new(code_root: &'a Path, manifest: &'a UploadManifest, stages: &'a [String]) -> Self {
        Self {
            code_root,
            manifest,
            stages,
        }
    }

    /// Build the archive. Target naming is validated lexically before any
    /// source file is read; a missing runtime or extra source directory is a
    /// validation error, while a stage without its own subtree is simply not
    /// packaged.
    pub fn build(&self) -> Result<BuiltArchive, PipelineError> {
        let sources = self.resolve_sources()?;

        let mut files: Vec<(PathBuf, Vec<u8>, u32)> = Vec::new();
        let mut packaged_stages: Vec<String> = Vec::new();

        for source in &sources {
            if !source.dir.is_dir() {
                match source.origin {
                    Origin::Stage(_) => {
                        debug!(stage = %source.describe, "stage has no code directory, skipping");
                        continue;
                    }
                    Origin::Runtime | Origin::Extra => {
                        return Err(PipelineError::Validation(format!(
                            "upload source {} does not exist",
                            source.dir.display()
                        )));
                    }
                }
            }
            if let Origin::Stage(name) = &source.origin {
                packaged_stages.push(name.clone());
            }
            collect_source(source, &mut files)?;
        }

        let packaged: BTreeMap<String, ()> = files
            .iter()
            .map(|(path, _, _)| (path.display().to_string(), ()))
            .collect();
        for stage in &packaged_stages {
            let requirements = format!("{STAGES_TARGET}/{stage}/requirements.txt");
            let has_requirements = packaged.contains_key(&requirements);
            for kind in [OpKind::Map, OpKind::Vanilla] {
                files.push((
                    PathBuf::from(wrapper_name(stage, kind)),
                    wrapper_script(stage, kind, has_requirements).into_bytes(),
                    0o755,
                ));
            }
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));

        let bytes = write_archive(&files)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let sha256 = format!("{:x}", hasher.finalize());

        Ok(BuiltArchive {
            bytes,
            sha256,
            entries: files.iter().map(|(p, _, _)| p.display().to_string()).collect(),
            stages: packaged_stages,
        })
    }

    /// Map every configured source to its archive target. Duplicate targets,
    /// reserved targets claimed by extras, and sources escaping the code root
    /// all fail here, before the filesystem is touched.
    fn resolve_sources(&self) -> Result<Vec<Source>, PipelineError> {
        let mut sources = Vec::new();
        sources.push(Source {
            target: RUNTIME_TARGET.to_string(),
            dir: self.code_root.join(RUNTIME_TARGET),
            origin: Origin::Runtime,
            describe: "the runtime directory".to_string(),
        });

        for stage in self.stages {
            sources.push(Source {
                target: format!("{STAGES_TARGET}/{stage}"),
                dir: self.code_root.join(STAGES_TARGET).join(stage),
                origin: Origin::Stage(stage.clone()),
                describe: format!("stage '{stage}'"),
            });
        }

        for module in &self.manifest.modules {
            let folded = module.replace('.', "/");
            check_extra_target(&folded, module)?;
            sources.push(Source {
                dir: resolve_within(self.code_root, &folded)?,
                target: folded,
                origin: Origin::Extra,
                describe: format!("module '{module}'"),
            });
        }

        for path in &self.manifest.paths {
            let dir = resolve_within(self.code_root, &path.source)?;
            let target = match path.target.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                Some(explicit) => explicit.to_string(),
                None => match dir.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => {
                        return Err(PipelineError::Configuration(format!(
                            "upload path '{}' has no usable target name",
                            path.source
                        )))
                    }
                },
            };
            check_extra_target(&target, &path.source)?;
            sources.push(Source {
                target,
                dir,
                origin: Origin::Extra,
                describe: format!("path '{}'", path.source),
            });
        }

        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for source in &sources {
            if let Some(first) = seen.insert(&source.target, &source.describe) {
                return Err(PipelineError::Configuration(format!(
                    "upload target '{}' is claimed by both {} and {}",
                    source.target, first, source.describe
                )));
            }
        }

        Ok(sources)
    }
}

/// Reserved names and traversal are rejected for extra-source targets.
fn check_extra_target(target: &str, source: &str) -> Result<(), PipelineError> {
    if RESERVED_TARGETS.contains(&target) {
        return Err(PipelineError::Configuration(format!(
            "upload target '{target}' is reserved"
        )));
    }
    let path = Path::new(target);
    if path.is_absolute()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(PipelineError::Configuration(format!(
            "upload target '{target}' (from '{source}') is not a plain relative name"
        )));
    }
    Ok(())
}

/// Lexical containment check: the resolved source never leaves the code
/// root, without consulting the filesystem.
fn resolve_within(code_root: &Path, source: &str) -> Result<PathBuf, PipelineError> {
    let escape = || {
        PipelineError::Configuration(format!("upload source '{source}' escapes the code root"))
    };
    let relative = Path::new(source);
    if relative.is_absolute() {
        return Err(escape());
    }
    let mut stack: Vec<&std::ffi::OsStr> = Vec::new();
    for component in relative.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => stack.push(part),
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err(escape());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape()),
        }
    }
    if stack.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "upload source '{source}' does not name a directory inside the code root"
        )));
    }
    let mut resolved = code_root.to_path_buf();
    for part in stack {
        resolved.push(part);
    }
    Ok(resolved)
}

/// Walk one source directory, honoring its `.gridignore`, and queue every
/// surviving file under the source's target.
fn collect_source(
    source: &Source,
    files: &mut Vec<(PathBuf, Vec<u8>, u32)>,
) -> Result<(), PipelineError> {
    let rules = IgnoreRules::load(&source.dir)?;
    let mut kept = 0usize;
    for entry in WalkDir::new(&source.dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(&source.dir) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if rules.is_ignored(rel) {
            debug!(file = %rel.display(), source = %source.describe, "ignored");
            continue;
        }
        let data = fs::read(entry.path())?;
        files.push((Path::new(&source.target).join(rel), data, 0o644));
        kept += 1;
    }
    debug!(source = %source.describe, files = kept, "collected");
    Ok(())
}

/// Per-stage wrapper run inside the extracted sandbox: environment first,
/// optional dependency install, then the entry script.
fn wrapper_script(stage: &str, kind: OpKind, has_requirements: bool) -> String {
    let mut script = format!(
        "#!/bin/bash\n\
         set -e\n\
         \n\
         SANDBOX_ROOT=\"$(pwd)\"\n\
         \n\
         export PYTHONPATH=\"${{PYTHONPATH}}:${{SANDBOX_ROOT}}\"\n\
         export JOB_CONFIG_PATH=\"${{SANDBOX_ROOT}}/{STAGES_TARGET}/{stage}/config.yaml\"\n"
    );
    if has_requirements {
        script.push_str(&format!(
            "\npip install --user -r {STAGES_TARGET}/{stage}/requirements.txt\n"
        ));
    }
    script.push_str(&format!("\nbash {}\n", stage_entry(stage, kind).display()));
    script
}

/// Serialize the sorted file list as a gzip-compressed tar with normalized
/// metadata.
fn write_archive(files: &[(PathBuf, Vec<u8>, u32)]) -> Result<Vec<u8>, PipelineError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data, mode) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        builder.append_data(&mut header, path, data.as_slice())?;
    }
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

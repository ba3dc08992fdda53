//! Newline-delimited JSON table files.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use gridpipe_ir::Row;

use crate::error::ClientError;

pub(crate) fn to_jsonl_bytes(rows: &[Row]) -> Result<Vec<u8>, ClientError> {
    let mut out = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut out, row)?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Parse newline-delimited JSON, skipping blank lines.
pub(crate) fn parse_jsonl(text: &str) -> Result<Vec<Row>, ClientError> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(ClientError::from))
        .collect()
}

/// Append to or atomically replace a JSONL file.
pub(crate) fn write_jsonl(path: &Path, rows: &[Row], append: bool) -> Result<(), ClientError> {
    if append && path.exists() {
        let file = OpenOptions::new().append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&to_jsonl_bytes(rows)?)?;
        writer.flush()?;
        return Ok(());
    }
    replace_file(path, &to_jsonl_bytes(rows)?)
}

/// Write bytes to a temporary sibling and rename it over `path`. A
/// partially-written file is never visible under the final name.
pub(crate) fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), ClientError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(path);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

/// Copy `src` over `dest` through a temporary sibling rename.
pub(crate) fn copy_replace(src: &Path, dest: &Path) -> Result<(), ClientError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(dest);
    fs::copy(src, &tmp)?;
    fs::rename(&tmp, dest)?;
    Ok(())
}

/// Number of non-empty lines.
pub(crate) fn count_rows(path: &Path) -> Result<u64, ClientError> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0u64;
    for line in reader.lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

/// Lazy row iterator over a JSONL file.
pub(crate) fn stream_jsonl(
    path: &Path,
) -> Result<impl Iterator<Item = Result<Row, ClientError>>, ClientError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(reader.lines().filter_map(|line| match line {
        Ok(l) if l.trim().is_empty() => None,
        Ok(l) => Some(serde_json::from_str::<Row>(&l).map_err(ClientError::from)),
        Err(e) => Some(Err(ClientError::from(e))),
    }))
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use super::output::{
    format_completions, format_index_summary, format_missing, format_suggestions, MissingReport,
};
use super::OutputFormat;
use crate::index::SymbolIndex;
use crate::scanner::scan_missing_symbols_with;

pub const DEFAULT_INDEX_DIR: &str = ".impfix";

/// Resolve the index directory from the flag or the default location.
pub fn index_dir(flag: Option<&str>) -> PathBuf {
    match flag {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(DEFAULT_INDEX_DIR),
    }
}

pub fn run_index(path: &str, index_dir: &Path, format: &OutputFormat) -> Result<String> {
    let root = PathBuf::from(path)
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", path))?;
    let mut index = SymbolIndex::open_or_create(index_dir)?;
    let updated = index.add_location(&root)?;
    index.save()?;
    info!(root = %root.display(), updated, "location indexed");
    Ok(format_index_summary(updated, format))
}

pub fn run_update(index_dir: &Path, format: &OutputFormat) -> Result<String> {
    let mut index = SymbolIndex::open_or_create(index_dir)?;
    let updated = index.update_all()?;
    index.save()?;
    Ok(format_index_summary(updated, format))
}

/// Scan one file for undefined names and suggest imports for each.
/// Returns the report and whether anything is missing.
pub fn run_check(
    file: &str,
    index_dir: &Path,
    no_update: bool,
    format: &OutputFormat,
) -> Result<(String, bool)> {
    let path = PathBuf::from(file)
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", file))?;
    let source =
        fs::read_to_string(&path).with_context(|| format!("cannot read {}", path.display()))?;
    let dir = path.parent().unwrap_or(Path::new("")).to_path_buf();

    let mut index = SymbolIndex::open_or_create(index_dir)?;
    if !no_update {
        index.update_all()?;
        index.save()?;
    }

    let missing = scan_missing_symbols_with(index.loader(), &source, &dir)?;
    let mut reports: Vec<MissingReport> = missing
        .into_iter()
        .map(|(name, usage)| MissingReport {
            suggestions: index.suggest_imports(&name),
            usage: usage.describe(),
            name,
        })
        .collect();
    reports.sort_by(|a, b| a.name.cmp(&b.name));
    let has_missing = !reports.is_empty();
    Ok((format_missing(&reports, format), has_missing))
}

pub fn run_find(symbol: &str, index_dir: &Path, format: &OutputFormat) -> Result<String> {
    let index = SymbolIndex::open_or_create(index_dir)?;
    let suggestions = index.find_symbol(symbol);
    Ok(format_suggestions(symbol, &suggestions, format))
}

pub fn run_complete(prefix: &str, index_dir: &Path, format: &OutputFormat) -> Result<String> {
    let index = SymbolIndex::open_or_create(index_dir)?;
    let entries = index.complete(prefix);
    Ok(format_completions(&entries, format))
}

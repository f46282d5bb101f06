//! Dependency discovery for scripts.
//!
//! A script declares a dependency with a comment whose body starts with
//! `@include`:
//!
//! ```text
//! //@include util.cs
//! # @include "helpers/common.sh"
//! ```
//!
//! Names resolve against the including file's directory, then the global
//! includes directory, then the configured search paths. Includes are
//! followed transitively. A name that resolves nowhere is still tracked (as
//! the path it would have in the script's directory) so creating it later
//! invalidates the cached artifact.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use hearth_core::Config;

use crate::error::{io_err, CacheError};

const DIRECTIVE: &str = "@include";

/// Extract the `@include` names declared in `source`, in order.
pub fn scan_includes(source: &str) -> Vec<String> {
    source.lines().filter_map(parse_directive).collect()
}

fn parse_directive(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    let body = trimmed
        .strip_prefix("//")
        .or_else(|| trimmed.strip_prefix('#'))?
        .trim_start();
    let rest = body.strip_prefix(DIRECTIVE)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let name = rest.trim().trim_matches(|c| c == '"' || c == '\'');
    (!name.is_empty()).then(|| name.to_string())
}

/// Resolves `@include` names to files.
#[derive(Debug, Clone, Default)]
pub struct IncludeResolver {
    roots: Vec<PathBuf>,
}

impl IncludeResolver {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Global includes directory first, then search paths.
    pub fn from_config(config: &Config) -> Self {
        let mut roots = vec![config.includes_dir.clone()];
        roots.extend(config.search_paths.iter().cloned());
        Self { roots }
    }

    /// Every file `script_path` depends on, transitively, sorted and deduplicated.
    pub fn resolve(&self, script_path: &Path, source: &str) -> Result<Vec<PathBuf>, CacheError> {
        let mut seen = BTreeSet::new();
        let mut pending: Vec<(PathBuf, String)> = scan_includes(source)
            .into_iter()
            .map(|name| (base_dir(script_path), name))
            .collect();

        while let Some((dir, name)) = pending.pop() {
            let path = self.locate(&dir, &name);
            if !seen.insert(path.clone()) {
                continue;
            }
            let contents = match std::fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                // Binary includes are fingerprinted but not scanned.
                Err(err) if err.kind() == ErrorKind::InvalidData => continue,
                Err(err) => return Err(io_err(&path, err)),
            };
            let nested_dir = base_dir(&path);
            pending.extend(
                scan_includes(&contents)
                    .into_iter()
                    .map(|nested| (nested_dir.clone(), nested)),
            );
        }

        Ok(seen.into_iter().collect())
    }

    fn locate(&self, dir: &Path, name: &str) -> PathBuf {
        let direct = dir.join(name);
        if Path::new(name).is_absolute() || direct.exists() {
            return direct;
        }
        self.roots
            .iter()
            .map(|root| root.join(name))
            .find(|candidate| candidate.exists())
            .unwrap_or(direct)
    }
}

fn base_dir(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

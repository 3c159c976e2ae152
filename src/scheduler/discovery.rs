//! Finding job files under the job root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::job::{JOB_EXTENSION, JobDefinition};

/// Every job file under `root`, keyed by job name. A missing root yields
/// nothing.
pub fn job_files(root: &Path) -> Vec<(String, PathBuf)> {
    let mut found = Vec::new();
    walk(root, root, &mut found);
    found.sort();
    found
}

fn walk(root: &Path, dir: &Path, found: &mut Vec<(String, PathBuf)>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), "Failed to read job directory: {}", e);
            return;
        }
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        if file_name.to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            walk(root, &path, found);
        } else if path.extension().is_some_and(|ext| ext == JOB_EXTENSION)
            && let Some(name) = job_name(root, &path)
        {
            found.push((name, path));
        }
    }
}

/// Job name for a file: its path relative to `root`, extension stripped,
/// components joined with `/`.
pub fn job_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?.with_extension("");
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Parse every job under `root`. Files that fail to parse are logged and
/// left out.
pub fn discover(root: &Path) -> HashMap<String, JobDefinition> {
    let mut jobs = HashMap::new();
    for (name, path) in job_files(root) {
        match JobDefinition::load(&name, &path) {
            Ok(job) => {
                jobs.insert(name, job);
            }
            Err(e) => {
                tracing::warn!(job = %name, path = %path.display(), "Skipping job file: {}", e);
            }
        }
    }
    jobs
}

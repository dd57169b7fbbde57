//! Filesystem safety rail. A single pure predicate every destructive call
//! routes through: resolve symlinks, then require both a recognized
//! temporary-storage prefix and a literal marker substring in the resolved
//! path before agreeing to delete anything.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

/// Present in every path this crate is willing to `remove_dir_all` on.
/// Chosen so a misconfigured `sessions_dir` pointing outside a scratch
/// area can never be wiped, even if it happens to sit under a temp prefix.
const SAFE_MARKER: &str = "motion-sentry";

fn safe_prefixes() -> Vec<PathBuf> {
    let mut prefixes = vec![std::env::temp_dir()];
    let ramdisk = PathBuf::from("/mnt/ramdisk");
    if ramdisk.exists() {
        prefixes.push(ramdisk);
    }
    prefixes
}

pub fn is_safe_to_delete(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }

    let resolved = match fs::canonicalize(path) {
        Ok(p) => p,
        Err(_) => return false,
    };

    let resolved_str = resolved.to_string_lossy();
    if !resolved_str.contains(SAFE_MARKER) {
        warn!("refusing to delete {resolved_str}: missing safety marker");
        return false;
    }

    for prefix in safe_prefixes() {
        if let Ok(canon_prefix) = fs::canonicalize(&prefix) {
            if resolved.starts_with(&canon_prefix) {
                return true;
            }
        }
    }

    warn!("refusing to delete {resolved_str}: not under a recognized temp prefix");
    false
}

/// Removes `path` recursively, but only if [`is_safe_to_delete`] agrees.
pub fn safe_rmtree(path: &Path) {
    if is_safe_to_delete(path) {
        if let Err(e) = fs::remove_dir_all(path) {
            warn!("failed removing {}: {e}", path.display());
        }
    }
}

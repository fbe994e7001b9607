//! Output naming for worker scripts.
//!
//! Two workers may be handed the same configuration at the same time. They
//! still produce distinct files as long as they name outputs from the
//! configuration id and the `file_ctr` returned by work selection, and keep
//! them under the per-configuration storage directory.

use std::path::{Path, PathBuf};

const TIER2_UNIT: i64 = 100;
const TIER1_UNIT: i64 = TIER2_UNIT * 1000;

/// `root/tier1_XXX/tier2_XXX/tier3_XXXXXXXXX` for a configuration.
pub fn storage_path(root: &Path, config_id: i64) -> PathBuf {
    let tier1 = config_id / TIER1_UNIT;
    let tier2 = (config_id - TIER1_UNIT * tier1) / TIER2_UNIT;
    root.join(format!("tier1_{tier1:03}"))
        .join(format!("tier2_{tier2:03}"))
        .join(format!("tier3_{config_id:09}"))
}

/// `out_<project>_<config_id>_<file_ctr>.<extension>`, zero padded.
pub fn output_file_name(project: &str, config_id: i64, file_ctr: i64, extension: &str) -> String {
    let extension = extension.trim_start_matches('.');
    format!("out_{project}_{config_id:09}_{file_ctr:03}.{extension}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_path_tiers() {
        let root = Path::new("/storage/wcte");
        assert_eq!(
            storage_path(root, 0),
            PathBuf::from("/storage/wcte/tier1_000/tier2_000/tier3_000000000")
        );
        assert_eq!(
            storage_path(root, 1_234_567),
            PathBuf::from("/storage/wcte/tier1_012/tier2_345/tier3_001234567")
        );
    }

    #[test]
    fn test_output_file_name() {
        assert_eq!(
            output_file_name("wcte", 42, 7, "root"),
            "out_wcte_000000042_007.root"
        );
        assert_eq!(
            output_file_name("wcte", 42, 7, ".h5"),
            "out_wcte_000000042_007.h5"
        );
    }
}

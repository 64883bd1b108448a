//! 入出力: 2D検出の読み込みと再構成結果の書き出し

pub mod c3d;
pub mod openpose;
pub mod trc;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::error::RunManifest;
use crate::pipeline::Reconstruction;
use crate::pose::{HierarchyNode, Skeleton};
use crate::sync::SyncReport;

/// スケルトン階層（軌跡と並べて下流に渡す）
pub fn skeleton_json(skeleton: &Skeleton) -> Result<String> {
    #[derive(Serialize)]
    struct Doc<'a> {
        model: &'a str,
        hierarchy: HierarchyNode,
    }
    Ok(serde_json::to_string_pretty(&Doc {
        model: skeleton.name(),
        hierarchy: skeleton.hierarchy(),
    })?)
}

/// 欠損マニフェストと同期結果
pub fn manifest_json(manifest: &RunManifest, sync: &SyncReport) -> Result<String> {
    #[derive(Serialize)]
    struct Doc<'a> {
        sync: &'a SyncReport,
        #[serde(flatten)]
        manifest: &'a RunManifest,
    }
    Ok(serde_json::to_string_pretty(&Doc { sync, manifest })?)
}

/// 出力ディレクトリに一式を書き出し、書いたファイルを返す
pub fn export_all(
    dir: &Path,
    stem: &str,
    reconstruction: &Reconstruction,
    skeleton: &Skeleton,
    make_c3d: bool,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let mut written = Vec::new();

    for person in reconstruction.persons() {
        let trc = dir.join(format!("{}_person{:02}.trc", stem, person));
        trc::save_trc(&trc, reconstruction, skeleton, person)?;
        written.push(trc);
        if make_c3d {
            let c3d = dir.join(format!("{}_person{:02}.c3d", stem, person));
            c3d::save_c3d(&c3d, reconstruction, skeleton, person)?;
            written.push(c3d);
        }
    }

    let skeleton_path = dir.join(format!("{}_skeleton.json", stem));
    fs::write(&skeleton_path, skeleton_json(skeleton)?)
        .with_context(|| format!("Failed to write {}", skeleton_path.display()))?;
    written.push(skeleton_path);

    let manifest_path = dir.join(format!("{}_manifest.json", stem));
    fs::write(
        &manifest_path,
        manifest_json(&reconstruction.manifest, &reconstruction.sync)?,
    )
    .with_context(|| format!("Failed to write {}", manifest_path.display()))?;
    written.push(manifest_path);

    info!(files = written.len(), dir = %dir.display(), "results exported");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExcludedCamera, GapReason, GapRecord, GapResolution};

    #[test]
    fn test_skeleton_json_hierarchy() {
        let skeleton = Skeleton::halpe26();
        let value: serde_json::Value = serde_json::from_str(&skeleton_json(&skeleton).unwrap()).unwrap();
        assert_eq!(value["model"], "HALPE_26");
        assert_eq!(value["hierarchy"]["name"], "Hip");
        assert_eq!(value["hierarchy"]["id"], 19);
        let first_child = &value["hierarchy"]["children"][0];
        assert_eq!(first_child["name"], "RHip");
        assert_eq!(first_child["children"][0]["name"], "RKnee");
    }

    #[test]
    fn test_manifest_json() {
        let manifest = RunManifest {
            excluded_cameras: vec![ExcludedCamera {
                camera: "cam_03".to_string(),
                reason: GapReason::Unsynchronized,
                correlation: Some(0.12),
            }],
            gaps: vec![GapRecord {
                frame: 3,
                person: Some(0),
                joint: Some(16),
                reason: GapReason::InsufficientViews,
                resolution: GapResolution::Interpolated,
            }],
        };
        let sync = SyncReport {
            reference: "cam_01".to_string(),
            offsets: Vec::new(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&manifest_json(&manifest, &sync).unwrap()).unwrap();
        assert_eq!(value["sync"]["reference"], "cam_01");
        assert_eq!(value["excluded_cameras"][0]["reason"], "Unsynchronized");
        assert_eq!(value["gaps"][0]["joint"], 16);
        assert_eq!(value["gaps"][0]["resolution"], "Interpolated");
    }
}

//! OpenPose 形式の2D検出JSONの読み込み
//!
//! カメラごとに1ディレクトリ、1フレーム1ファイル:
//! `{"people": [{"pose_keypoints_2d": [x0, y0, c0, x1, y1, c1, ...]}]}`

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::calibration::CalibrationStore;
use crate::pose::{CameraStream, Detection2D};

#[derive(Debug, Deserialize)]
struct FrameFile {
    #[serde(default)]
    people: Vec<PersonEntry>,
}

#[derive(Debug, Deserialize)]
struct PersonEntry {
    #[serde(default)]
    pose_keypoints_2d: Vec<f64>,
}

/// 1フレーム分のJSONを解釈
pub fn parse_frame(content: &str, camera: usize, frame: usize) -> Result<Vec<Detection2D>> {
    let file: FrameFile = serde_json::from_str(content)?;
    Ok(file
        .people
        .iter()
        .map(|p| Detection2D::from_flat(camera, frame, &p.pose_keypoints_2d))
        .filter(|d| !d.keypoints.is_empty())
        .collect())
}

fn sorted_entries(dir: &Path, want_dirs: bool) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            if want_dirs {
                p.is_dir()
            } else {
                p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
            }
        })
        .collect();
    entries.sort();
    Ok(entries)
}

/// 1カメラ分のディレクトリを読む（ファイル名順 = フレーム順）
pub fn load_camera_dir(dir: &Path, camera: &str, index: usize) -> Result<CameraStream> {
    let files = sorted_entries(dir, false)?;
    let frames = files
        .iter()
        .enumerate()
        .map(|(frame, path)| {
            let content =
                fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
            parse_frame(&content, index, frame).with_context(|| format!("Failed to parse {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CameraStream::new(camera, frames))
}

/// `pose_dir` 直下のカメラごとのディレクトリを読む
///
/// ディレクトリ名にカメラ名を（英数字で区切られずに）含むものを優先し、
/// 残りは名前順にキャリブレーションのカメラ（名前順）と対にする。
pub fn load_pose_dir(pose_dir: &Path, calibration: &CalibrationStore) -> Result<Vec<CameraStream>> {
    let mut dirs = sorted_entries(pose_dir, true)?;
    let mut names: Vec<&str> = calibration.names();
    names.sort_unstable();

    let mut pairs: Vec<(PathBuf, &str)> = Vec::new();
    names.retain(|name| {
        let found = dirs.iter().position(|d| {
            d.file_name()
                .and_then(|f| f.to_str())
                .is_some_and(|f| names_camera(f, name))
        });
        match found {
            Some(i) => {
                pairs.push((dirs.remove(i), *name));
                false
            }
            None => true,
        }
    });
    if dirs.len() != names.len() {
        warn!(
            directories = dirs.len(),
            cameras = names.len(),
            "pose directories and calibrated cameras differ in number"
        );
    }
    pairs.extend(dirs.into_iter().zip(names));

    let mut streams = Vec::with_capacity(pairs.len());
    for (dir, name) in pairs {
        let index = calibration.index_of(name).unwrap_or_default();
        let stream = load_camera_dir(&dir, name, index)?;
        info!(camera = name, dir = %dir.display(), frames = stream.len(), "loaded 2D detections");
        streams.push(stream);
    }
    streams.sort_by_key(|s| calibration.index_of(&s.camera));
    Ok(streams)
}

/// `dir` がカメラ名 `camera` を単語として含むか（`cam_1` は `cam_10` に一致しない）
fn names_camera(dir: &str, camera: &str) -> bool {
    if camera.is_empty() {
        return false;
    }
    dir.match_indices(camera).any(|(i, _)| {
        let before = dir[..i].chars().next_back();
        let after = dir[i + camera.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triangulation::tests::ring_cameras;

    const FRAME: &str = r#"{
        "version": 1.3,
        "people": [
            {"person_id": [-1], "pose_keypoints_2d": [100.0, 200.0, 0.9, 0.0, 0.0, 0.0, 50.5, 60.5, 0.4]},
            {"person_id": [-1], "pose_keypoints_2d": [0.0, 0.0, 0.0]}
        ]
    }"#;

    #[test]
    fn test_parse_frame() {
        let dets = parse_frame(FRAME, 2, 7).unwrap();
        // 全関節が未観測の人物は捨てる
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!((d.camera, d.frame), (2, 7));
        assert_eq!(d.get(0).unwrap().x, 100.0);
        assert!(d.get(1).is_none());
        assert_eq!(d.get(2).unwrap().confidence, 0.4);
    }

    #[test]
    fn test_parse_empty_and_invalid() {
        assert!(parse_frame(r#"{"people": []}"#, 0, 0).unwrap().is_empty());
        assert!(parse_frame("{}", 0, 0).unwrap().is_empty());
        assert!(parse_frame("not json", 0, 0).is_err());
    }

    #[test]
    fn test_load_pose_dir_pairs_by_name() {
        let root = tempfile::tempdir().unwrap();
        let calib = CalibrationStore::new(ring_cameras(2)).unwrap();
        // cam_02 は名前で、もう一方は残りとして対応付く
        for (dir, frames) in [("cam_02_json", 3), ("other", 2)] {
            let path = root.path().join(dir);
            fs::create_dir(&path).unwrap();
            for f in 0..frames {
                fs::write(path.join(format!("frame_{:06}.json", f)), FRAME).unwrap();
            }
        }
        fs::write(root.path().join("notes.txt"), "ignored").unwrap();

        let streams = load_pose_dir(root.path(), &calib).unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].camera, "cam_01");
        assert_eq!(streams[0].len(), 2);
        assert_eq!(streams[1].camera, "cam_02");
        assert_eq!(streams[1].len(), 3);
        assert_eq!(streams[1].frames[2][0].camera, 1);
        assert_eq!(streams[1].frames[2][0].frame, 2);
    }

    #[test]
    fn test_names_camera() {
        assert!(names_camera("cam_1", "cam_1"));
        assert!(names_camera("trial_cam_1_json", "cam_1"));
        assert!(!names_camera("cam_10", "cam_1"));
        assert!(!names_camera("mycam_1", "cam_1"));
        assert!(names_camera("cam_10-cam_1", "cam_1"));
    }

    #[test]
    fn test_load_pose_dir_prefix_names() {
        let root = tempfile::tempdir().unwrap();
        let mut cameras = ring_cameras(2);
        cameras[0].name = "cam_1".to_string();
        cameras[1].name = "cam_10".to_string();
        let calib = CalibrationStore::new(cameras).unwrap();
        for (dir, frames) in [("cam_10", 3), ("cam_1_json", 2)] {
            let path = root.path().join(dir);
            fs::create_dir(&path).unwrap();
            for f in 0..frames {
                fs::write(path.join(format!("frame_{:06}.json", f)), FRAME).unwrap();
            }
        }

        let streams = load_pose_dir(root.path(), &calib).unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!((streams[0].camera.as_str(), streams[0].len()), ("cam_1", 2));
        assert_eq!((streams[1].camera.as_str(), streams[1].len()), ("cam_10", 3));
    }
}

//! カメラキャリブレーションの読み込み・変換
//!
//! ネイティブTOML、リグJSON、Qualisys `.qca.txt`、Vicon `.xcp` を読み、
//! どれもワールド→カメラ外部パラメータの [`Camera`] に揃える。

pub mod camera;
pub mod native;
pub mod qualisys;
pub mod rig_json;
pub mod vicon;
mod xml;

pub use camera::Camera;

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CalibrationError;

/// キャリブレーションファイル形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationFormat {
    Native,
    RigJson,
    Qualisys,
    Vicon,
}

impl CalibrationFormat {
    /// 拡張子から形式を推定
    pub fn detect<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let name = path
            .as_ref()
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".qca.txt") || name.ends_with(".qca") {
            Ok(Self::Qualisys)
        } else if name.ends_with(".xcp") {
            Ok(Self::Vicon)
        } else if name.ends_with(".toml") {
            Ok(Self::Native)
        } else if name.ends_with(".json") {
            Ok(Self::RigJson)
        } else {
            Err(CalibrationError::UnsupportedFormat(name))
        }
    }

    pub fn parse_name(name: &str) -> Result<Self, CalibrationError> {
        match name.to_ascii_lowercase().as_str() {
            "native" | "toml" => Ok(Self::Native),
            "json" | "rig" | "rig_json" => Ok(Self::RigJson),
            "qualisys" | "qca" => Ok(Self::Qualisys),
            "vicon" | "xcp" => Ok(Self::Vicon),
            other => Err(CalibrationError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// セッション内の全カメラ（読み込み後は不変）
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    cameras: Vec<Camera>,
}

impl CalibrationStore {
    pub fn new(cameras: Vec<Camera>) -> Result<Self, CalibrationError> {
        if cameras.is_empty() {
            return Err(CalibrationError::Empty);
        }
        let mut seen = HashSet::new();
        for cam in &cameras {
            if !seen.insert(cam.name.as_str()) {
                return Err(CalibrationError::InvalidValue {
                    camera: cam.name.clone(),
                    field: "name".to_string(),
                    reason: "duplicate camera name".to_string(),
                });
            }
            if cam.intrinsic.try_inverse().is_none() {
                return Err(CalibrationError::InvalidValue {
                    camera: cam.name.clone(),
                    field: "intrinsic".to_string(),
                    reason: "matrix is singular".to_string(),
                });
            }
        }
        Ok(Self { cameras })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let format = CalibrationFormat::detect(&path)?;
        Self::load_as(path, format)
    }

    pub fn load_as<P: AsRef<Path>>(path: P, format: CalibrationFormat) -> Result<Self, CalibrationError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| CalibrationError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let store = Self::parse_str(&content, format)?;
        info!(
            path = %path.display(),
            ?format,
            cameras = store.len(),
            "calibration loaded"
        );
        Ok(store)
    }

    pub fn parse_str(content: &str, format: CalibrationFormat) -> Result<Self, CalibrationError> {
        let cameras = match format {
            CalibrationFormat::Native => native::parse(content)?,
            CalibrationFormat::RigJson => rig_json::parse(content)?,
            CalibrationFormat::Qualisys => qualisys::parse(content)?,
            CalibrationFormat::Vicon => vicon::parse(content)?,
        };
        Self::new(cameras)
    }

    pub fn to_native_string(&self) -> Result<String, CalibrationError> {
        native::write(&self.cameras)
    }

    pub fn save_native<P: AsRef<Path>>(&self, path: P) -> Result<(), CalibrationError> {
        let path = path.as_ref();
        let text = self.to_native_string()?;
        fs::write(path, text).map_err(|source| CalibrationError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn cameras(&self) -> &[Camera] {
        &self.cameras
    }

    pub fn get(&self, index: usize) -> Option<&Camera> {
        self.cameras.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.cameras.iter().position(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.cameras.iter().map(|c| c.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point3, Vector3};

    fn ring(n: usize) -> Vec<Camera> {
        (0..n)
            .map(|i| {
                let a = i as f64 * std::f64::consts::TAU / n as f64;
                Camera::look_at(
                    &format!("cam_{:02}", i + 1),
                    50.0,
                    1280,
                    720,
                    Point3::new(4.0 * a.cos(), 4.0 * a.sin(), 1.5),
                    Point3::new(0.0, 0.0, 1.0),
                    Vector3::z(),
                )
            })
            .collect()
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(CalibrationFormat::detect("a/Calib.qca.txt").unwrap(), CalibrationFormat::Qualisys);
        assert_eq!(CalibrationFormat::detect("x.xcp").unwrap(), CalibrationFormat::Vicon);
        assert_eq!(CalibrationFormat::detect("calib.toml").unwrap(), CalibrationFormat::Native);
        assert_eq!(CalibrationFormat::detect("calib.json").unwrap(), CalibrationFormat::RigJson);
        assert!(CalibrationFormat::detect("calib.yaml").is_err());
    }

    #[test]
    fn test_store_rejects_duplicates_and_empty() {
        assert!(matches!(CalibrationStore::new(vec![]), Err(CalibrationError::Empty)));
        let mut cams = ring(2);
        cams[1].name = cams[0].name.clone();
        assert!(CalibrationStore::new(cams).is_err());
    }

    #[test]
    fn test_save_and_load_native() {
        let store = CalibrationStore::new(ring(3)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Calib.toml");
        store.save_native(&path).unwrap();
        let loaded = CalibrationStore::load(&path).unwrap();
        assert_eq!(loaded.names(), vec!["cam_01", "cam_02", "cam_03"]);
        assert_eq!(loaded.index_of("cam_03"), Some(2));
        let p = Point3::new(0.2, -0.1, 1.3);
        for (a, b) in store.cameras().iter().zip(loaded.cameras()) {
            let pa = a.project(&p).unwrap();
            let pb = b.project(&p).unwrap();
            assert!((pa - pb).norm() < 1e-6);
        }
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            CalibrationStore::load("/nonexistent/calib.toml"),
            Err(CalibrationError::Io { .. })
        ));
    }
}

//! ネイティブTOML形式
//!
//! ```toml
//! [cam_01]
//! name = "cam_01"
//! size = [1920.0, 1080.0]
//! matrix = [[fx, 0.0, cx], [0.0, fy, cy], [0.0, 0.0, 1.0]]
//! distortions = [k1, k2, p1, p2]
//! rotation = [rx, ry, rz]      # Rodrigues
//! translation = [tx, ty, tz]   # meters
//! fisheye = false
//! ```

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use super::Camera;
use crate::error::CalibrationError;

#[derive(Debug, Serialize, Deserialize)]
struct NativeCamera {
    #[serde(default)]
    name: Option<String>,
    size: [f64; 2],
    matrix: [[f64; 3]; 3],
    distortions: Vec<f64>,
    rotation: [f64; 3],
    translation: [f64; 3],
    #[serde(default)]
    fisheye: bool,
}

#[derive(Debug, Serialize)]
struct Metadata {
    adjusted: bool,
    error: f64,
}

pub fn parse(content: &str) -> Result<Vec<Camera>, CalibrationError> {
    let table: toml::Table = toml::from_str(content)?;
    let mut cameras = Vec::new();

    for (key, value) in table {
        if key == "metadata" {
            continue;
        }
        let entry = value.try_into::<NativeCamera>()?;
        let name = entry.name.unwrap_or_else(|| key.clone());
        if entry.distortions.len() > 5 {
            return Err(CalibrationError::InvalidValue {
                camera: name,
                field: "distortions".to_string(),
                reason: format!("expected at most 5 coefficients, got {}", entry.distortions.len()),
            });
        }
        if entry.size[0] <= 0.0 || entry.size[1] <= 0.0 {
            return Err(CalibrationError::InvalidValue {
                camera: name,
                field: "size".to_string(),
                reason: format!("{:?}", entry.size),
            });
        }
        let m = entry.matrix;
        let intrinsic = Matrix3::new(
            m[0][0], m[0][1], m[0][2],
            m[1][0], m[1][1], m[1][2],
            m[2][0], m[2][1], m[2][2],
        );
        let camera = Camera::from_rodrigues(
            &name,
            entry.size[0].round() as u32,
            entry.size[1].round() as u32,
            intrinsic,
            &entry.distortions,
            entry.rotation,
            entry.translation,
        )
        .with_fisheye(entry.fisheye);
        cameras.push(camera);
    }

    Ok(cameras)
}

pub fn write(cameras: &[Camera]) -> Result<String, CalibrationError> {
    let mut table = toml::Table::new();
    for cam in cameras {
        let k = &cam.intrinsic;
        // 通常モデルは k3=0 なら4係数で書く
        let n_coeffs = if cam.fisheye || cam.dist_coeffs[4] != 0.0 { 5 } else { 4 };
        let entry = NativeCamera {
            name: Some(cam.name.clone()),
            size: [cam.width as f64, cam.height as f64],
            matrix: [
                [k[(0, 0)], k[(0, 1)], k[(0, 2)]],
                [k[(1, 0)], k[(1, 1)], k[(1, 2)]],
                [k[(2, 0)], k[(2, 1)], k[(2, 2)]],
            ],
            distortions: cam.dist_coeffs[..n_coeffs].to_vec(),
            rotation: cam.rvec().into(),
            translation: cam.translation.into(),
            fisheye: cam.fisheye,
        };
        table.insert(cam.name.clone(), toml::Value::try_from(entry)?);
    }
    table.insert(
        "metadata".to_string(),
        toml::Value::try_from(Metadata {
            adjusted: false,
            error: 0.0,
        })?,
    );
    Ok(toml::to_string(&table)?)
}

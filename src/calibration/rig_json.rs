//! キャプチャリグが出力するJSON形式（Rodrigues回転 + 並進）

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use super::Camera;
use crate::error::CalibrationError;

/// ボードパラメータ（再現用に保存されているだけで変換には使わない）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardParams {
    pub dictionary: String,
    pub squares_x: i32,
    pub squares_y: i32,
    pub square_length: f32,
    pub marker_length: f32,
}

/// 単一カメラのキャリブレーション結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraCalibration {
    pub camera_index: i32,
    #[serde(default)]
    pub name: Option<String>,
    pub width: u32,
    pub height: u32,
    /// 内部パラメータ行列 K (row-major 3x3)
    pub intrinsic_matrix: [f64; 9],
    /// 歪み係数
    pub dist_coeffs: Vec<f64>,
    /// 回転ベクトル (Rodrigues)
    pub rvec: [f64; 3],
    /// 並進ベクトル
    pub tvec: [f64; 3],
    /// 再投影誤差
    #[serde(default)]
    pub reprojection_error: f64,
}

/// マルチカメラキャリブレーション結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiCameraCalibration {
    #[serde(default)]
    pub board: Option<BoardParams>,
    pub cameras: Vec<CameraCalibration>,
}

pub fn parse(content: &str) -> Result<Vec<Camera>, CalibrationError> {
    let cal: MultiCameraCalibration = serde_json::from_str(content)?;
    cal.cameras.iter().map(to_camera).collect()
}

fn to_camera(c: &CameraCalibration) -> Result<Camera, CalibrationError> {
    let name = c
        .name
        .clone()
        .unwrap_or_else(|| format!("cam_{:02}", c.camera_index));
    if c.dist_coeffs.len() > 5 {
        return Err(CalibrationError::InvalidValue {
            camera: name,
            field: "dist_coeffs".to_string(),
            reason: format!("expected at most 5 coefficients, got {}", c.dist_coeffs.len()),
        });
    }
    // row-major → nalgebra
    let k = Matrix3::from_row_slice(&c.intrinsic_matrix);
    Ok(Camera::from_rodrigues(
        &name,
        c.width,
        c.height,
        k,
        &c.dist_coeffs,
        c.rvec,
        c.tvec,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rig_json() {
        let content = r#"{
            "board": {"dictionary": "DICT_4X4_50", "squares_x": 5, "squares_y": 4,
                      "square_length": 0.04, "marker_length": 0.03},
            "cameras": [
                {"camera_index": 0, "width": 1280, "height": 960,
                 "intrinsic_matrix": [900.0, 0.0, 640.0, 0.0, 905.0, 480.0, 0.0, 0.0, 1.0],
                 "dist_coeffs": [0.1, -0.2, 0.0, 0.0, 0.05],
                 "rvec": [0.0, 0.0, 0.0], "tvec": [0.0, 0.0, 0.0],
                 "reprojection_error": 0.4},
                {"camera_index": 2, "width": 1280, "height": 960,
                 "intrinsic_matrix": [900.0, 0.0, 640.0, 0.0, 900.0, 480.0, 0.0, 0.0, 1.0],
                 "dist_coeffs": [],
                 "rvec": [0.0, 0.3, 0.0], "tvec": [-1.0, 0.0, 0.2]}
            ]
        }"#;
        let cams = parse(content).unwrap();
        assert_eq!(cams.len(), 2);
        assert_eq!(cams[0].name, "cam_00");
        assert_eq!(cams[1].name, "cam_02");
        assert_eq!(cams[0].intrinsic[(1, 1)], 905.0);
        assert_eq!(cams[0].dist_coeffs[4], 0.05);
        assert!(!cams[1].has_distortion());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(parse("{\"cameras\": [{}]}"), Err(CalibrationError::Json(_))));
    }
}

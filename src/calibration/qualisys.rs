//! Qualisys `.qca.txt` 形式
//!
//! - `transform`: カメラ姿勢（カメラ→ワールド回転 r11..r33、位置 x/y/z はミリメートル）
//! - `intrinsic`: センサー上のサブピクセル単位。`fov_video` の解像度に換算する

use nalgebra::{Matrix3, Rotation3, Vector3};

use super::xml::{parse_tree, Element};
use super::Camera;
use crate::error::CalibrationError;

/// サブピクセル単位（1ピクセル = 64）
const SUBPIXEL: f64 = 64.0;

pub fn parse(content: &str) -> Result<Vec<Camera>, CalibrationError> {
    let tree = parse_tree(content)?;
    let mut elements = Vec::new();
    tree.descendants_named("camera", &mut elements);

    let mut cameras = Vec::new();
    for (i, el) in elements.iter().enumerate() {
        // active="0" のカメラはキャリブレーションに含まれない
        if el.attr("active") == Some("0") {
            continue;
        }
        let name = el
            .attr("serial")
            .map(|s| format!("cam_{}", s))
            .unwrap_or_else(|| format!("cam_{:02}", i + 1));
        cameras.push(to_camera(&name, el)?);
    }

    if cameras.is_empty() {
        return Err(CalibrationError::Empty);
    }
    Ok(cameras)
}

fn missing(camera: &str, field: &str) -> CalibrationError {
    CalibrationError::MissingField {
        camera: camera.to_string(),
        field: field.to_string(),
    }
}

fn to_camera(name: &str, el: &Element) -> Result<Camera, CalibrationError> {
    let fov = el.child("fov_video").ok_or_else(|| missing(name, "fov_video"))?;
    let width = fov.require_f64(name, "right")? - fov.require_f64(name, "left")? + 1.0;
    let height = fov.require_f64(name, "bottom")? - fov.require_f64(name, "top")? + 1.0;
    if width <= 0.0 || height <= 0.0 {
        return Err(CalibrationError::InvalidValue {
            camera: name.to_string(),
            field: "fov_video".to_string(),
            reason: format!("{}x{}", width, height),
        });
    }

    let intr = el.child("intrinsic").ok_or_else(|| missing(name, "intrinsic"))?;
    let fu = intr.require_f64(name, "focalLengthU")?;
    let fv = intr.require_f64(name, "focalLengthV")?;
    let cu = intr.require_f64(name, "centerPointU")?;
    let cv = intr.require_f64(name, "centerPointV")?;

    // センサー範囲が与えられていればビデオ解像度へ換算、なければサブピクセル→ピクセルのみ
    let sensor_u = (
        intr.optional_f64(name, "sensorMinU")?,
        intr.optional_f64(name, "sensorMaxU")?,
    );
    let sensor_v = (
        intr.optional_f64(name, "sensorMinV")?,
        intr.optional_f64(name, "sensorMaxV")?,
    );
    let (fx, cx) = match sensor_u {
        (Some(min), Some(max)) if max > min => {
            let scale = width / (max - min);
            (fu * scale, (cu - min) * scale)
        }
        _ => (fu / SUBPIXEL, cu / SUBPIXEL),
    };
    let (fy, cy) = match sensor_v {
        (Some(min), Some(max)) if max > min => {
            let scale = height / (max - min);
            (fv * scale, (cv - min) * scale)
        }
        _ => (fv / SUBPIXEL, cv / SUBPIXEL),
    };
    let k = Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0);

    let dist = [
        intr.optional_f64(name, "radialDistortion1")?.unwrap_or(0.0),
        intr.optional_f64(name, "radialDistortion2")?.unwrap_or(0.0),
        intr.optional_f64(name, "tangentalDistortion1")?.unwrap_or(0.0),
        intr.optional_f64(name, "tangentalDistortion2")?.unwrap_or(0.0),
        intr.optional_f64(name, "radialDistortion3")?.unwrap_or(0.0),
    ];

    let tf = el.child("transform").ok_or_else(|| missing(name, "transform"))?;
    let position = Vector3::new(
        tf.require_f64(name, "x")?,
        tf.require_f64(name, "y")?,
        tf.require_f64(name, "z")?,
    ) / 1000.0;
    let mut r = Matrix3::zeros();
    for row in 0..3 {
        for col in 0..3 {
            r[(row, col)] = tf.require_f64(name, &format!("r{}{}", row + 1, col + 1))?;
        }
    }
    // カメラ→ワールド を ワールド→カメラ に反転
    let rotation = Rotation3::from_matrix_unchecked(r.transpose());
    let translation = -(rotation * position);

    Ok(Camera::new(
        name,
        width.round() as u32,
        height.round() as u32,
        k,
        &dist,
        rotation,
        translation,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<calibration source="qtm" created="2024-01-01">
  <results std-dev="0.4" min-max-diff="1.2"/>
  <cameras>
    <camera active="1" avg-residual="0.31" serial="28519" model="Miqus Video" viewrotation="0">
      <fov_marker left="0" top="0" right="1919" bottom="1087"/>
      <fov_video left="0" top="0" right="1919" bottom="1079"/>
      <transform x="1000" y="-2000" z="1500" r11="1" r12="0" r13="0" r21="0" r22="0" r23="1" r31="0" r32="-1" r33="0"/>
      <intrinsic focallength="6.0" sensorMinU="0" sensorMaxU="122880" sensorMinV="0" sensorMaxV="69120"
                 focalLengthU="76800" focalLengthV="76800" centerPointU="61440" centerPointV="34560"
                 skew="0" radialDistortion1="-0.1" radialDistortion2="0.02" radialDistortion3="0"
                 tangentalDistortion1="0.001" tangentalDistortion2="0"/>
    </camera>
    <camera active="0" serial="99999"/>
  </cameras>
</calibration>"#;

    #[test]
    fn test_parse_qualisys() {
        let cams = parse(SAMPLE).unwrap();
        assert_eq!(cams.len(), 1);
        let cam = &cams[0];
        assert_eq!(cam.name, "cam_28519");
        assert_eq!((cam.width, cam.height), (1920, 1080));
        // 76800 / 122880 * 1920 = 1200
        assert_relative_eq!(cam.intrinsic[(0, 0)], 1200.0, epsilon = 1e-9);
        assert_relative_eq!(cam.intrinsic[(0, 2)], 960.0, epsilon = 1e-9);
        assert_relative_eq!(cam.intrinsic[(1, 2)], 540.0, epsilon = 1e-9);
        assert_relative_eq!(cam.dist_coeffs[0], -0.1);
        assert_relative_eq!(cam.center(), Point3::new(1.0, -2.0, 1.5), epsilon = 1e-9);
    }

    #[test]
    fn test_camera_axis_from_transform() {
        let cam = &parse(SAMPLE).unwrap()[0];
        // r の3列目 (0, 1, 0) がカメラの光軸 → ワールド+Y方向の点は画像中央
        let p = cam.project(&Point3::new(1.0, 1.0, 1.5)).unwrap();
        assert_relative_eq!(p.x, 960.0, epsilon = 1e-6);
        assert_relative_eq!(p.y, 540.0, epsilon = 1e-6);
    }

    #[test]
    fn test_missing_intrinsic() {
        let doc = r#"<calibration><cameras><camera serial="1">
            <fov_video left="0" top="0" right="99" bottom="99"/>
            <transform x="0" y="0" z="0" r11="1" r12="0" r13="0" r21="0" r22="1" r23="0" r31="0" r32="0" r33="1"/>
            </camera></cameras></calibration>"#;
        assert!(matches!(
            parse(doc),
            Err(CalibrationError::MissingField { .. })
        ));
    }
}

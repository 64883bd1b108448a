//! Vicon `.xcp` 形式
//!
//! `Camera` 要素ごとに最初の `KeyFrame` を使う。
//! ORIENTATION はワールド→カメラ回転の四元数 (x y z w)、POSITION はカメラ中心（ミリメートル）。
//! VICON_RADIAL2 は (歪み中心x, 歪み中心y, k1, k2, ...)。歪み中心は主点と同一とみなす。

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};

use super::xml::{parse_tree, Element};
use super::Camera;
use crate::error::CalibrationError;

pub fn parse(content: &str) -> Result<Vec<Camera>, CalibrationError> {
    let tree = parse_tree(content)?;
    let mut elements = Vec::new();
    tree.descendants_named("Camera", &mut elements);

    let cameras = elements
        .iter()
        .enumerate()
        .map(|(i, el)| {
            let id = el.attr("USERID").or_else(|| el.attr("DEVICEID"));
            let name = match id {
                Some(id) => format!("cam_{}", id),
                None => format!("cam_{:02}", i + 1),
            };
            to_camera(&name, el)
        })
        .collect::<Result<Vec<_>, _>>()?;

    if cameras.is_empty() {
        return Err(CalibrationError::Empty);
    }
    Ok(cameras)
}

fn invalid(camera: &str, field: &str, reason: String) -> CalibrationError {
    CalibrationError::InvalidValue {
        camera: camera.to_string(),
        field: field.to_string(),
        reason,
    }
}

fn to_camera(name: &str, el: &Element) -> Result<Camera, CalibrationError> {
    let size = el.require_f64_list(name, "SENSOR_SIZE")?;
    if size.len() != 2 || size[0] <= 0.0 || size[1] <= 0.0 {
        return Err(invalid(name, "SENSOR_SIZE", format!("{:?}", size)));
    }
    let aspect = el.optional_f64(name, "PIXEL_ASPECT_RATIO")?.unwrap_or(1.0);

    let mut frames = Vec::new();
    el.descendants_named("KeyFrame", &mut frames);
    let key = frames.first().ok_or_else(|| CalibrationError::MissingField {
        camera: name.to_string(),
        field: "KeyFrame".to_string(),
    })?;

    let f = key.require_f64(name, "FOCAL_LENGTH")?;
    let pp = key.require_f64_list(name, "PRINCIPAL_POINT")?;
    if pp.len() != 2 {
        return Err(invalid(name, "PRINCIPAL_POINT", format!("{:?}", pp)));
    }
    let k = Matrix3::new(f, 0.0, pp[0], 0.0, f / aspect, pp[1], 0.0, 0.0, 1.0);

    let mut dist = [0.0; 4];
    if key.attr("VICON_RADIAL2").is_some() {
        let radial = key.require_f64_list(name, "VICON_RADIAL2")?;
        if radial.len() >= 4 {
            dist[0] = radial[2];
            dist[1] = radial[3];
        }
    }

    let q = key.require_f64_list(name, "ORIENTATION")?;
    if q.len() != 4 {
        return Err(invalid(name, "ORIENTATION", format!("{:?}", q)));
    }
    let quat = Quaternion::new(q[3], q[0], q[1], q[2]);
    if quat.norm() < 1e-12 {
        return Err(invalid(name, "ORIENTATION", "zero quaternion".to_string()));
    }
    let rotation = UnitQuaternion::from_quaternion(quat).to_rotation_matrix();

    let pos = key.require_f64_list(name, "POSITION")?;
    if pos.len() != 3 {
        return Err(invalid(name, "POSITION", format!("{:?}", pos)));
    }
    let center = Vector3::new(pos[0], pos[1], pos[2]) / 1000.0;
    let translation = -(rotation * center);

    Ok(Camera::new(
        name,
        size[0].round() as u32,
        size[1].round() as u32,
        k,
        &dist,
        rotation,
        translation,
    ))
}

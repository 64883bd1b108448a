use nalgebra::{Matrix3, Matrix3x4, Point2, Point3, Rotation3, Vector3};

/// 1台のカメラのキャリブレーション（内部・外部パラメータ）
///
/// 外部パラメータはワールド→カメラ変換 `x_cam = R * x_world + t`。
/// カメラ座標系は OpenCV 準拠（+Z 前方、+Y 下方向）。
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// 内部パラメータ行列 K
    pub intrinsic: Matrix3<f64>,
    /// 歪み係数 [k1, k2, p1, p2, k3]（fisheye の場合は [k1, k2, k3, k4, 0]）
    pub dist_coeffs: [f64; 5],
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
    pub fisheye: bool,
    /// 射影行列 P = K[R|t]
    projection: Matrix3x4<f64>,
}

impl Camera {
    pub fn new(
        name: &str,
        width: u32,
        height: u32,
        intrinsic: Matrix3<f64>,
        dist_coeffs: &[f64],
        rotation: Rotation3<f64>,
        translation: Vector3<f64>,
    ) -> Self {
        let mut dc = [0.0; 5];
        for (dst, src) in dc.iter_mut().zip(dist_coeffs) {
            *dst = *src;
        }
        let projection = build_projection(&intrinsic, &rotation, &translation);
        Self {
            name: name.to_string(),
            width,
            height,
            intrinsic,
            dist_coeffs: dc,
            rotation,
            translation,
            fisheye: false,
            projection,
        }
    }

    pub fn with_fisheye(mut self, fisheye: bool) -> Self {
        self.fisheye = fisheye;
        self
    }

    /// Rodrigues回転ベクトル + 並進ベクトルから構築
    pub fn from_rodrigues(
        name: &str,
        width: u32,
        height: u32,
        intrinsic: Matrix3<f64>,
        dist_coeffs: &[f64],
        rvec: [f64; 3],
        tvec: [f64; 3],
    ) -> Self {
        let rotation = Rotation3::from_scaled_axis(Vector3::from(rvec));
        Self::new(
            name,
            width,
            height,
            intrinsic,
            dist_coeffs,
            rotation,
            Vector3::from(tvec),
        )
    }

    /// 垂直画角・カメラ位置・注視点から歪みなしカメラを構築
    ///
    /// - fov_v_deg: 垂直画角（度）
    /// - up: ワールド座標の上方向
    pub fn look_at(
        name: &str,
        fov_v_deg: f64,
        width: u32,
        height: u32,
        eye: Point3<f64>,
        target: Point3<f64>,
        up: Vector3<f64>,
    ) -> Self {
        let w = width as f64;
        let h = height as f64;

        // 正方ピクセル、主点は画像中心
        let fy = h / (2.0 * (fov_v_deg.to_radians() / 2.0).tan());
        let fx = fy;
        let k = Matrix3::new(fx, 0.0, w / 2.0, 0.0, fy, h / 2.0, 0.0, 0.0, 1.0);

        // 行 = カメラ軸（右, 下, 前）をワールドで表したもの
        let z = (target - eye).normalize();
        let x = z.cross(&up).normalize();
        let y = z.cross(&x);
        let r = Matrix3::from_rows(&[x.transpose(), y.transpose(), z.transpose()]);
        let rotation = Rotation3::from_matrix_unchecked(r);
        let t = -(rotation * eye.coords);

        Self::new(name, width, height, k, &[], rotation, t)
    }

    pub fn projection(&self) -> &Matrix3x4<f64> {
        &self.projection
    }

    /// Rodrigues回転ベクトル
    pub fn rvec(&self) -> Vector3<f64> {
        self.rotation.scaled_axis()
    }

    /// ワールド座標でのカメラ中心 C = -R^T t
    pub fn center(&self) -> Point3<f64> {
        Point3::from(-(self.rotation.inverse() * self.translation))
    }

    pub fn has_distortion(&self) -> bool {
        self.dist_coeffs.iter().any(|&c| c != 0.0)
    }

    /// 3D点を理想ピンホールモデルで投影（カメラ後方なら None）
    pub fn project(&self, point: &Point3<f64>) -> Option<Point2<f64>> {
        let p = self.projection * point.to_homogeneous();
        if p[2] <= 1e-9 {
            return None;
        }
        Some(Point2::new(p[0] / p[2], p[1] / p[2]))
    }

    /// 歪みモデルを適用した投影（実カメラ画像上の位置）
    pub fn project_distorted(&self, point: &Point3<f64>) -> Option<Point2<f64>> {
        let pc = self.rotation * point.coords + self.translation;
        if pc.z <= 1e-9 {
            return None;
        }
        let (x, y) = (pc.x / pc.z, pc.y / pc.z);
        let (xd, yd) = if self.fisheye {
            self.distort_fisheye(x, y)
        } else {
            self.distort_normalized(x, y)
        };
        let k = &self.intrinsic;
        Some(Point2::new(
            k[(0, 0)] * xd + k[(0, 1)] * yd + k[(0, 2)],
            k[(1, 1)] * yd + k[(1, 2)],
        ))
    }

    fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.dist_coeffs;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        (
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    fn distort_fisheye(&self, x: f64, y: f64) -> (f64, f64) {
        let r = (x * x + y * y).sqrt();
        if r < 1e-12 {
            return (x, y);
        }
        let theta = r.atan();
        let scale = fisheye_theta_d(theta, &self.dist_coeffs) / r;
        (x * scale, y * scale)
    }

    /// 歪んだピクセル座標を歪み補正して理想ピクセル座標に変換
    /// Newton-Raphson法による歪み補正（大きな歪み係数でも収束）
    pub fn undistort_point(&self, u_dist: f64, v_dist: f64) -> (f64, f64) {
        if !self.has_distortion() {
            return (u_dist, v_dist);
        }

        let fx = self.intrinsic[(0, 0)];
        let fy = self.intrinsic[(1, 1)];
        let cx = self.intrinsic[(0, 2)];
        let cy = self.intrinsic[(1, 2)];

        // ピクセル→正規化カメラ座標（歪みあり = ターゲット）
        let yd = (v_dist - cy) / fy;
        let xd = (u_dist - cx - self.intrinsic[(0, 1)] * yd) / fx;

        let (x, y) = if self.fisheye {
            self.undistort_fisheye(xd, yd)
        } else {
            self.undistort_normalized(xd, yd)
        };

        (fx * x + self.intrinsic[(0, 1)] * y + cx, fy * y + cy)
    }

    fn undistort_normalized(&self, xd: f64, yd: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.dist_coeffs;

        // Newton-Raphson: 順方向歪みモデル f(x,y) = target を解く
        let mut x = xd;
        let mut y = yd;
        let mut best = (x, y);
        let mut best_residual = f64::MAX;

        for _ in 0..30 {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r4 * r2;
            let dr_dr2 = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

            let fx_val = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x) - xd;
            let fy_val = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y - yd;

            let residual = fx_val * fx_val + fy_val * fy_val;
            if residual < best_residual {
                best_residual = residual;
                best = (x, y);
            }
            if residual < 1e-24 {
                break;
            }

            // ヤコビアン（対称）
            let j00 = radial + 2.0 * x * x * dr_dr2 + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = 2.0 * x * y * dr_dr2 + 2.0 * p1 * x + 2.0 * p2 * y;
            let j11 = radial + 2.0 * y * y * dr_dr2 + 6.0 * p1 * y + 2.0 * p2 * x;

            let det = j00 * j11 - j01 * j01;
            if det.abs() < 1e-15 {
                break; // 特異ヤコビアン → best値を使用
            }

            x -= (j11 * fx_val - j01 * fy_val) / det;
            y -= (-j01 * fx_val + j00 * fy_val) / det;
        }

        best
    }

    fn undistort_fisheye(&self, xd: f64, yd: f64) -> (f64, f64) {
        let theta_d = (xd * xd + yd * yd).sqrt();
        if theta_d < 1e-12 {
            return (xd, yd);
        }
        let [k1, k2, k3, k4, _] = self.dist_coeffs;
        let mut theta = theta_d;
        for _ in 0..20 {
            let t2 = theta * theta;
            let f = fisheye_theta_d(theta, &self.dist_coeffs) - theta_d;
            let df = 1.0 + 3.0 * k1 * t2 + 5.0 * k2 * t2 * t2 + 7.0 * k3 * t2.powi(3) + 9.0 * k4 * t2.powi(4);
            if df.abs() < 1e-15 {
                break;
            }
            let step = f / df;
            theta -= step;
            if step.abs() < 1e-14 {
                break;
            }
        }
        let scale = theta.tan() / theta_d;
        (xd * scale, yd * scale)
    }

    /// ワールド座標の視線（原点 = カメラ中心、単位方向ベクトル）
    /// pixel は歪み補正済みの座標
    pub fn ray(&self, pixel: &Point2<f64>) -> Option<(Point3<f64>, Vector3<f64>)> {
        let k_inv = self.intrinsic.try_inverse()?;
        let dir_cam = k_inv * Vector3::new(pixel.x, pixel.y, 1.0);
        let dir = (self.rotation.inverse() * dir_cam).normalize();
        Some((self.center(), dir))
    }

    /// このカメラの点 x に対し `other` 上のエピポーラ線 l = F x を与える基礎行列
    pub fn fundamental_to(&self, other: &Camera) -> Option<Matrix3<f64>> {
        let r_rel = other.rotation * self.rotation.inverse();
        let t_rel = other.translation - r_rel * self.translation;
        let essential = t_rel.cross_matrix() * r_rel.matrix();
        let k_self_inv = self.intrinsic.try_inverse()?;
        let k_other_inv = other.intrinsic.try_inverse()?;
        Some(k_other_inv.transpose() * essential * k_self_inv)
    }
}

fn fisheye_theta_d(theta: f64, coeffs: &[f64; 5]) -> f64 {
    let [k1, k2, k3, k4, _] = *coeffs;
    let t2 = theta * theta;
    theta * (1.0 + k1 * t2 + k2 * t2 * t2 + k3 * t2.powi(3) + k4 * t2.powi(4))
}

fn build_projection(k: &Matrix3<f64>, r: &Rotation3<f64>, t: &Vector3<f64>) -> Matrix3x4<f64> {
    // P = K * [R | t]
    let mut rt = Matrix3x4::zeros();
    rt.fixed_view_mut::<3, 3>(0, 0).copy_from(r.matrix());
    rt.fixed_view_mut::<3, 1>(0, 3).copy_from(t);
    k * rt
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn front_camera() -> Camera {
        Camera::look_at(
            "cam",
            55.0,
            640,
            480,
            Point3::new(0.0, -3.0, 1.0),
            Point3::new(0.0, 0.0, 1.0),
            Vector3::z(),
        )
    }

    #[test]
    fn test_look_at_projects_target_to_center() {
        let cam = front_camera();
        let p = cam.project(&Point3::new(0.0, 0.0, 1.0)).unwrap();
        assert_relative_eq!(p.x, 320.0, epsilon = 1e-9);
        assert_relative_eq!(p.y, 240.0, epsilon = 1e-9);
        // 上にある点は画像の上側（v が小さい）
        let above = cam.project(&Point3::new(0.0, 0.0, 1.5)).unwrap();
        assert!(above.y < 240.0);
        // 右（+X）にある点は画像の右側
        let right = cam.project(&Point3::new(0.5, 0.0, 1.0)).unwrap();
        assert!(right.x > 320.0);
    }

    #[test]
    fn test_point_behind_camera() {
        let cam = front_camera();
        assert!(cam.project(&Point3::new(0.0, -5.0, 1.0)).is_none());
    }

    #[test]
    fn test_center() {
        let cam = front_camera();
        assert_relative_eq!(cam.center(), Point3::new(0.0, -3.0, 1.0), epsilon = 1e-9);
    }

    #[test]
    fn test_rodrigues_roundtrip() {
        let cam = front_camera();
        let rebuilt = Camera::from_rodrigues(
            "cam",
            640,
            480,
            cam.intrinsic,
            &[],
            cam.rvec().into(),
            cam.translation.into(),
        );
        assert_relative_eq!(rebuilt.projection(), cam.projection(), epsilon = 1e-9);
    }

    #[test]
    fn test_undistort_inverts_distortion() {
        let base = front_camera();
        let cam = Camera::new(
            "cam",
            640,
            480,
            base.intrinsic,
            &[-0.25, 0.08, 0.001, -0.0005, 0.0],
            base.rotation,
            base.translation,
        );
        let point = Point3::new(0.6, 0.2, 1.4);
        let ideal = cam.project(&point).unwrap();
        let distorted = cam.project_distorted(&point).unwrap();
        assert!((ideal - distorted).norm() > 1.0);
        let (u, v) = cam.undistort_point(distorted.x, distorted.y);
        assert_relative_eq!(u, ideal.x, epsilon = 1e-6);
        assert_relative_eq!(v, ideal.y, epsilon = 1e-6);
    }

    #[test]
    fn test_undistort_fisheye() {
        let base = front_camera();
        let cam = Camera::new(
            "fish",
            640,
            480,
            base.intrinsic,
            &[0.05, -0.01, 0.002, 0.0],
            base.rotation,
            base.translation,
        )
        .with_fisheye(true);
        let point = Point3::new(-0.8, 0.3, 0.4);
        let ideal = cam.project(&point).unwrap();
        let distorted = cam.project_distorted(&point).unwrap();
        let (u, v) = cam.undistort_point(distorted.x, distorted.y);
        assert_relative_eq!(u, ideal.x, epsilon = 1e-6);
        assert_relative_eq!(v, ideal.y, epsilon = 1e-6);
    }

    #[test]
    fn test_no_distortion_passthrough() {
        let cam = front_camera();
        assert_eq!(cam.undistort_point(12.5, 99.0), (12.5, 99.0));
    }

    #[test]
    fn test_fundamental_epipolar_constraint() {
        let a = front_camera();
        let b = Camera::look_at(
            "b",
            60.0,
            640,
            480,
            Point3::new(3.0, 0.5, 1.5),
            Point3::new(0.0, 0.0, 1.0),
            Vector3::z(),
        );
        let f = a.fundamental_to(&b).unwrap();
        for p in [Point3::new(0.1, 0.2, 0.9), Point3::new(-0.4, 0.1, 1.7)] {
            let xa = a.project(&p).unwrap().to_homogeneous();
            let xb = b.project(&p).unwrap().to_homogeneous();
            let residual = xb.dot(&(f * xa));
            assert!(residual.abs() < 1e-6, "x_b^T F x_a = {}", residual);
        }
    }

    #[test]
    fn test_ray_passes_through_point() {
        let cam = front_camera();
        let p = Point3::new(0.3, 0.4, 1.2);
        let pixel = cam.project(&p).unwrap();
        let (origin, dir) = cam.ray(&pixel).unwrap();
        let v = p - origin;
        let dist = (v - dir * v.dot(&dir)).norm();
        assert!(dist < 1e-9);
    }
}

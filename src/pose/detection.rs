use std::collections::BTreeMap;

use nalgebra::Point2;

/// 単一の2Dキーポイント（ピクセル座標）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint2D {
    pub x: f64,
    pub y: f64,
    /// 信頼度スコア (0.0〜1.0)。0 は未観測
    pub confidence: f64,
}

impl Keypoint2D {
    pub fn new(x: f64, y: f64, confidence: f64) -> Self {
        Self { x, y, confidence }
    }

    /// 信頼度が閾値以上か（未観測は常に false）
    pub fn is_valid(&self, threshold: f64) -> bool {
        self.confidence > 0.0 && self.confidence >= threshold && self.x.is_finite() && self.y.is_finite()
    }

    pub fn point(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
}

impl Default for Keypoint2D {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            confidence: 0.0,
        }
    }
}

/// 1カメラ・1フレーム・1人分の検出結果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Detection2D {
    /// キャリブレーション上のカメラインデックス
    pub camera: usize,
    pub frame: usize,
    /// 関節ID → キーポイント
    pub keypoints: BTreeMap<usize, Keypoint2D>,
}

impl Detection2D {
    pub fn new(camera: usize, frame: usize) -> Self {
        Self {
            camera,
            frame,
            keypoints: BTreeMap::new(),
        }
    }

    /// OpenPose形式の平坦な配列 [x0, y0, c0, x1, y1, c1, ...] から構築
    /// 配列インデックスがそのまま関節IDになる
    pub fn from_flat(camera: usize, frame: usize, values: &[f64]) -> Self {
        let keypoints = values
            .chunks_exact(3)
            .enumerate()
            .filter(|(_, c)| c[2] > 0.0)
            .map(|(id, c)| (id, Keypoint2D::new(c[0], c[1], c[2])))
            .collect();
        Self {
            camera,
            frame,
            keypoints,
        }
    }

    pub fn with_keypoint(mut self, joint: usize, keypoint: Keypoint2D) -> Self {
        self.keypoints.insert(joint, keypoint);
        self
    }

    /// 関節IDで観測済みキーポイントを取得（信頼度0は未観測扱い）
    pub fn get(&self, joint: usize) -> Option<&Keypoint2D> {
        self.keypoints.get(&joint).filter(|k| k.confidence > 0.0)
    }

    /// 閾値以上の信頼度で観測された関節
    pub fn valid(&self, joint: usize, threshold: f64) -> Option<&Keypoint2D> {
        self.keypoints.get(&joint).filter(|k| k.is_valid(threshold))
    }

    /// 観測済みキーポイントの平均信頼度
    pub fn average_confidence(&self) -> f64 {
        let observed: Vec<f64> = self
            .keypoints
            .values()
            .filter(|k| k.confidence > 0.0)
            .map(|k| k.confidence)
            .collect();
        if observed.is_empty() {
            0.0
        } else {
            observed.iter().sum::<f64>() / observed.len() as f64
        }
    }

    pub fn observed_count(&self, threshold: f64) -> usize {
        self.keypoints.values().filter(|k| k.is_valid(threshold)).count()
    }
}

/// 1カメラ分の検出列（フレームごとに0人以上）
#[derive(Debug, Clone, Default)]
pub struct CameraStream {
    /// キャリブレーション上のカメラ名
    pub camera: String,
    pub frames: Vec<Vec<Detection2D>>,
}

impl CameraStream {
    pub fn new(camera: &str, frames: Vec<Vec<Detection2D>>) -> Self {
        Self {
            camera: camera.to_string(),
            frames,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// 信頼度が最大の検出（同期用の単一人物シグナルに使う）
    pub fn most_confident(&self, frame: usize) -> Option<&Detection2D> {
        self.frames.get(frame)?.iter().max_by(|a, b| {
            a.average_confidence()
                .partial_cmp(&b.average_confidence())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypoint_is_valid() {
        let kp = Keypoint2D::new(10.0, 20.0, 0.7);
        assert!(kp.is_valid(0.5));
        assert!(!kp.is_valid(0.8));
        assert!(!Keypoint2D::default().is_valid(0.0));
    }

    #[test]
    fn test_from_flat_skips_unobserved() {
        let values = [1.0, 2.0, 0.9, 0.0, 0.0, 0.0, 5.0, 6.0, 0.4];
        let det = Detection2D::from_flat(1, 7, &values);
        assert_eq!(det.keypoints.len(), 2);
        assert!(det.get(1).is_none());
        assert_eq!(det.get(2).map(|k| k.x), Some(5.0));
        assert_eq!(det.camera, 1);
        assert_eq!(det.frame, 7);
    }

    #[test]
    fn test_zero_confidence_is_unobserved() {
        let det = Detection2D::new(0, 0).with_keypoint(3, Keypoint2D::new(1.0, 1.0, 0.0));
        assert!(det.get(3).is_none());
        assert_eq!(det.average_confidence(), 0.0);
    }

    #[test]
    fn test_average_confidence() {
        let det = Detection2D::new(0, 0)
            .with_keypoint(0, Keypoint2D::new(0.0, 0.0, 0.5))
            .with_keypoint(1, Keypoint2D::new(0.0, 0.0, 1.0));
        assert!((det.average_confidence() - 0.75).abs() < 1e-12);
        assert_eq!(det.observed_count(0.6), 1);
    }

    #[test]
    fn test_most_confident() {
        let low = Detection2D::new(0, 0).with_keypoint(0, Keypoint2D::new(0.0, 0.0, 0.2));
        let high = Detection2D::new(0, 0).with_keypoint(0, Keypoint2D::new(9.0, 0.0, 0.8));
        let stream = CameraStream::new("cam01", vec![vec![low, high]]);
        assert_eq!(stream.most_confident(0).map(|d| d.keypoints[&0].x), Some(9.0));
        assert!(stream.most_confident(1).is_none());
    }
}

//! カメラ間の時間同期
//!
//! カメラごとに2Dキーポイント速度の和を「動きの強さ」シグナルとし、基準カメラとの
//! 相互相関が最大になるフレームずれを求める。ずれは `f_cam = f_ref + offset`。

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{FillPolicy, InterpolationKind, SyncConfig};
use crate::error::{ExcludedCamera, GapReason, PipelineError};
use crate::pose::{CameraStream, Detection2D, Skeleton};
use crate::postprocess::filter::{Butterworth, Smoother};
use crate::postprocess::GapFiller;

/// 相関計算に必要な最小重なりフレーム数
const MIN_OVERLAP: usize = 3;

/// 1カメラの同期結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraOffset {
    pub camera: String,
    /// 同期できなければ None
    pub offset: Option<i64>,
    pub correlation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub reference: String,
    pub offsets: Vec<CameraOffset>,
}

impl SyncReport {
    /// 同期しない場合（全カメラ offset 0）
    pub fn identity(streams: &[CameraStream]) -> Self {
        Self {
            reference: streams.first().map(|s| s.camera.clone()).unwrap_or_default(),
            offsets: streams
                .iter()
                .map(|s| CameraOffset {
                    camera: s.camera.clone(),
                    offset: Some(0),
                    correlation: 1.0,
                })
                .collect(),
        }
    }

    pub fn excluded(&self) -> Vec<ExcludedCamera> {
        self.offsets
            .iter()
            .filter(|o| o.offset.is_none())
            .map(|o| ExcludedCamera {
                camera: o.camera.clone(),
                reason: GapReason::Unsynchronized,
                correlation: Some(o.correlation),
            })
            .collect()
    }

    pub fn offset_of(&self, camera: &str) -> Option<i64> {
        self.offsets.iter().find(|o| o.camera == camera).and_then(|o| o.offset)
    }
}

pub struct Synchronizer<'a> {
    config: &'a SyncConfig,
    skeleton: &'a Skeleton,
    frame_rate: f64,
    /// 検出列ごとのキャリブレーション上のカメラ番号（空なら並び順そのもの）
    camera_indices: Vec<usize>,
}

impl<'a> Synchronizer<'a> {
    pub fn new(config: &'a SyncConfig, skeleton: &'a Skeleton, frame_rate: f64) -> Self {
        Self {
            config,
            skeleton,
            frame_rate,
            camera_indices: Vec::new(),
        }
    }

    /// `approx_time_maxspeed` はキャリブレーションのカメラ順なので、
    /// 一部のカメラだけを同期するときは各検出列のカメラ番号を渡す
    pub fn with_camera_indices(mut self, indices: Vec<usize>) -> Self {
        self.camera_indices = indices;
        self
    }

    /// シグナルに使う関節
    fn joints(&self) -> Vec<usize> {
        match self.config.keypoints_to_consider.names() {
            Some(names) => names
                .iter()
                .filter_map(|n| {
                    let joint = self.skeleton.joint_by_name(n);
                    if joint.is_none() {
                        warn!(joint = %n, "unknown keypoint in keypoints_to_consider, ignored");
                    }
                    joint.map(|j| j.id)
                })
                .collect(),
            None => self.skeleton.ids(),
        }
    }

    /// 最も確からしい人物のキーポイント速度の和（フレームごと）
    pub fn motion_signal(&self, stream: &CameraStream) -> Vec<f64> {
        let n = stream.len();
        let mut speed = vec![0.0; n];
        if n < 2 {
            return speed;
        }

        let filler = GapFiller::new(InterpolationKind::Linear, usize::MAX, FillPolicy::LastValue);
        let filter = Butterworth::new(self.config.filter_order, self.config.filter_cutoff, self.frame_rate);
        let main: Vec<Option<&Detection2D>> = (0..n).map(|f| stream.most_confident(f)).collect();

        for joint in self.joints() {
            let mut xy: Vec<Option<[f64; 2]>> = main
                .iter()
                .map(|d| {
                    d.and_then(|d| d.valid(joint, self.config.likelihood_threshold))
                        .map(|kp| [kp.x, kp.y])
                })
                .collect();
            if xy.iter().all(Option::is_none) {
                continue;
            }
            filler.fill(&mut xy);

            let xs = filter.smooth(&xy.iter().map(|p| p.map(|p| p[0])).collect::<Vec<_>>());
            let ys = filter.smooth(&xy.iter().map(|p| p.map(|p| p[1])).collect::<Vec<_>>());
            for t in 1..n {
                if let (Some(x0), Some(x1), Some(y0), Some(y1)) = (xs[t - 1], xs[t], ys[t - 1], ys[t]) {
                    speed[t] += ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt();
                }
            }
        }
        speed[0] = speed[1];
        speed
    }

    /// 最大速度フレーム（指定があればそれを使う）
    fn max_speed_frame(&self, stream: usize, signal: &[f64]) -> i64 {
        let camera = self.camera_indices.get(stream).copied().unwrap_or(stream);
        if let Some(&secs) = self
            .config
            .approx_time_maxspeed
            .seconds()
            .and_then(|s| s.get(camera))
        {
            return (secs * self.frame_rate).round() as i64;
        }
        argmax(signal) as i64
    }

    /// 全カメラのオフセットを推定
    pub fn synchronize(&self, streams: &[CameraStream]) -> Result<SyncReport, PipelineError> {
        let reference = if self.config.reference_camera.is_empty() {
            0
        } else {
            streams
                .iter()
                .position(|s| s.camera == self.config.reference_camera)
                .ok_or_else(|| PipelineError::UnknownCamera(self.config.reference_camera.clone()))?
        };
        let Some(ref_stream) = streams.get(reference) else {
            return Ok(SyncReport::identity(streams));
        };

        let signals: Vec<Vec<f64>> = streams.iter().map(|s| self.motion_signal(s)).collect();
        let half_window = (self.config.time_range_around_maxspeed * self.frame_rate).round().max(1.0) as i64;
        let ref_center = self.max_speed_frame(reference, &signals[reference]);

        let lo = (ref_center - half_window).max(0) as usize;
        let hi = ((ref_center + half_window + 1).max(0) as usize).min(signals[reference].len());
        let window = lo..hi.max(lo);

        let mut offsets = Vec::with_capacity(streams.len());
        for (i, stream) in streams.iter().enumerate() {
            if i == reference {
                offsets.push(CameraOffset {
                    camera: stream.camera.clone(),
                    offset: Some(0),
                    correlation: 1.0,
                });
                continue;
            }
            let expected = self.max_speed_frame(i, &signals[i]) - ref_center;
            let (lag, corr) = best_lag(
                &signals[reference],
                &signals[i],
                window.clone(),
                expected - half_window..=expected + half_window,
            );
            let offset = (corr >= self.config.min_correlation).then_some(lag);
            match offset {
                Some(lag) => info!(camera = %stream.camera, offset = lag, correlation = corr, "camera synchronized"),
                None => warn!(
                    camera = %stream.camera,
                    correlation = corr,
                    min = self.config.min_correlation,
                    "camera could not be synchronized, excluded"
                ),
            }
            offsets.push(CameraOffset {
                camera: stream.camera.clone(),
                offset,
                correlation: corr,
            });
        }

        debug!(reference = %ref_stream.camera, center = ref_center, half_window, "sync window");
        Ok(SyncReport {
            reference: ref_stream.camera.clone(),
            offsets,
        })
    }
}

fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

/// ピアソン相関（分散ゼロなら 0）
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let ma = a[..n].iter().sum::<f64>() / n as f64;
    let mb = b[..n].iter().sum::<f64>() / n as f64;
    let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
    for (x, y) in a[..n].iter().zip(&b[..n]) {
        sab += (x - ma) * (y - mb);
        saa += (x - ma).powi(2);
        sbb += (y - mb).powi(2);
    }
    if saa < 1e-12 || sbb < 1e-12 {
        return 0.0;
    }
    sab / (saa * sbb).sqrt()
}

/// 基準シグナルの `window` 区間に対し `signal[t + lag]` の相関が最大となる lag
///
/// 同値なら |lag| が小さい方、さらに同値なら負の方を選ぶ。
pub fn best_lag(
    reference: &[f64],
    signal: &[f64],
    window: std::ops::Range<usize>,
    lags: std::ops::RangeInclusive<i64>,
) -> (i64, f64) {
    let min_overlap = MIN_OVERLAP.max(window.len().div_ceil(2));
    let mut best: Option<(i64, f64)> = None;

    for lag in lags {
        let (mut a, mut b) = (Vec::new(), Vec::new());
        for t in window.clone() {
            let s = t as i64 + lag;
            if s < 0 || s as usize >= signal.len() {
                continue;
            }
            a.push(reference[t]);
            b.push(signal[s as usize]);
        }
        if a.len() < min_overlap {
            continue;
        }
        let corr = pearson(&a, &b);
        let better = match best {
            None => true,
            Some((best_lag, best_corr)) => {
                if (corr - best_corr).abs() > 1e-12 {
                    corr > best_corr
                } else {
                    (lag.abs(), lag) < (best_lag.abs(), best_lag)
                }
            }
        };
        if better {
            best = Some((lag, corr));
        }
    }
    best.unwrap_or((0, 0.0))
}

/// オフセットを適用し、基準カメラのフレーム番号に揃えた検出列を返す
///
/// 同期できなかったカメラは元のまま（除外は呼び出し側が扱う）。
pub fn align_streams(streams: &[CameraStream], report: &SyncReport) -> Vec<CameraStream> {
    let len = streams
        .iter()
        .find(|s| s.camera == report.reference)
        .map(|s| s.len())
        .unwrap_or_else(|| streams.iter().map(|s| s.len()).max().unwrap_or(0));

    streams
        .iter()
        .map(|stream| {
            let offset = report.offset_of(&stream.camera).unwrap_or(0);
            let frames = (0..len)
                .map(|f| {
                    let src = f as i64 + offset;
                    if src < 0 {
                        return Vec::new();
                    }
                    stream
                        .frames
                        .get(src as usize)
                        .map(|dets| {
                            dets.iter()
                                .map(|d| Detection2D { frame: f, ..d.clone() })
                                .collect()
                        })
                        .unwrap_or_default()
                })
                .collect();
            CameraStream::new(&stream.camera, frames)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::Keypoint2D;

    /// t = event で急加速する手首の動き
    fn wrist_track(camera: usize, n: usize, event: f64, wrist: usize) -> CameraStream {
        let frames = (0..n)
            .map(|f| {
                let t = f as f64;
                let x = 600.0 + 250.0 * ((t - event) / 3.0).tanh() + 10.0 * ((t - event) * 0.3).sin();
                let y = 400.0 + 5.0 * ((t - event) * 0.17).cos();
                vec![Detection2D::new(camera, f).with_keypoint(wrist, Keypoint2D::new(x, y, 0.9))]
            })
            .collect();
        CameraStream::new(&format!("cam_{:02}", camera + 1), frames)
    }

    fn static_track(camera: usize, n: usize, wrist: usize) -> CameraStream {
        let frames = (0..n)
            .map(|f| vec![Detection2D::new(camera, f).with_keypoint(wrist, Keypoint2D::new(300.0, 300.0, 0.9))])
            .collect();
        CameraStream::new(&format!("cam_{:02}", camera + 1), frames)
    }

    fn setup() -> (Skeleton, SyncConfig, usize) {
        let skeleton = Skeleton::halpe26();
        let wrist = skeleton.joint_by_name("RWrist").unwrap().id;
        let config = SyncConfig {
            keypoints_to_consider: crate::config::KeypointSelection::Names(vec!["RWrist".to_string()]),
            time_range_around_maxspeed: 1.0,
            ..Default::default()
        };
        (skeleton, config, wrist)
    }

    #[test]
    fn test_pearson() {
        assert!((pearson(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]) - 1.0).abs() < 1e-12);
        assert!((pearson(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]) + 1.0).abs() < 1e-12);
        assert_eq!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn test_best_lag_tie_prefers_smallest_shift() {
        // 周期2の信号は偶数ずれで全て相関1
        let r: Vec<f64> = (0..20).map(|i| (i % 2) as f64).collect();
        let (lag, corr) = best_lag(&r, &r, 4..16, -4..=4);
        assert_eq!(lag, 0);
        assert!((corr - 1.0).abs() < 1e-12);
        let (lag, _) = best_lag(&r, &r, 4..16, -3..=3);
        assert_eq!(lag, 0);
        let (lag, _) = best_lag(&r, &r, 4..16, 1..=3);
        assert_eq!(lag, 2);
    }

    #[test]
    fn test_recovers_known_offset() {
        let (skeleton, config, wrist) = setup();
        let streams = vec![
            wrist_track(0, 120, 50.0, wrist),
            wrist_track(1, 120, 57.0, wrist),
            wrist_track(2, 120, 46.0, wrist),
        ];
        let report = Synchronizer::new(&config, &skeleton, 30.0).synchronize(&streams).unwrap();
        assert_eq!(report.reference, "cam_01");
        let offsets: Vec<Option<i64>> = report.offsets.iter().map(|o| o.offset).collect();
        assert_eq!(offsets, vec![Some(0), Some(7), Some(-4)]);
        assert!(report.excluded().is_empty());
    }

    #[test]
    fn test_static_camera_excluded() {
        let (skeleton, config, wrist) = setup();
        let streams = vec![wrist_track(0, 120, 50.0, wrist), static_track(1, 120, wrist)];
        let report = Synchronizer::new(&config, &skeleton, 30.0).synchronize(&streams).unwrap();
        assert_eq!(report.offsets[1].offset, None);
        let excluded = report.excluded();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].camera, "cam_02");
        assert_eq!(excluded[0].reason, GapReason::Unsynchronized);
    }

    #[test]
    fn test_deterministic() {
        let (skeleton, config, wrist) = setup();
        let streams = vec![
            wrist_track(0, 90, 40.0, wrist),
            wrist_track(1, 90, 43.0, wrist),
        ];
        let sync = Synchronizer::new(&config, &skeleton, 30.0);
        let a = sync.synchronize(&streams).unwrap();
        let b = sync.synchronize(&streams).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_manual_event_times_follow_calibration_order() {
        let (skeleton, mut config, wrist) = setup();
        // cam_01 は検出なし。時刻はキャリブレーション順に4台分
        config.approx_time_maxspeed = crate::config::MaxSpeedTime::Seconds(vec![0.0, 50.0 / 30.0, 57.0 / 30.0, 46.0 / 30.0]);
        config.time_range_around_maxspeed = 0.3;
        let streams = vec![
            wrist_track(1, 120, 50.0, wrist),
            wrist_track(2, 120, 57.0, wrist),
            wrist_track(3, 120, 46.0, wrist),
        ];
        let report = Synchronizer::new(&config, &skeleton, 30.0)
            .with_camera_indices(vec![1, 2, 3])
            .synchronize(&streams)
            .unwrap();
        assert_eq!(report.reference, "cam_02");
        let offsets: Vec<Option<i64>> = report.offsets.iter().map(|o| o.offset).collect();
        assert_eq!(offsets, vec![Some(0), Some(7), Some(-4)]);
    }

    #[test]
    fn test_unknown_reference() {
        let (skeleton, mut config, wrist) = setup();
        config.reference_camera = "nope".to_string();
        let streams = vec![wrist_track(0, 30, 10.0, wrist)];
        assert!(matches!(
            Synchronizer::new(&config, &skeleton, 30.0).synchronize(&streams),
            Err(PipelineError::UnknownCamera(_))
        ));
    }

    #[test]
    fn test_align_streams() {
        let (_, _, wrist) = setup();
        let streams = vec![wrist_track(0, 10, 5.0, wrist), wrist_track(1, 10, 7.0, wrist)];
        let report = SyncReport {
            reference: "cam_01".to_string(),
            offsets: vec![
                CameraOffset { camera: "cam_01".to_string(), offset: Some(0), correlation: 1.0 },
                CameraOffset { camera: "cam_02".to_string(), offset: Some(2), correlation: 0.9 },
            ],
        };
        let aligned = align_streams(&streams, &report);
        assert_eq!(aligned[1].len(), 10);
        // 基準フレーム3 = cam_02 のフレーム5
        let kp = aligned[1].frames[3][0].get(wrist).unwrap();
        let orig = streams[1].frames[5][0].get(wrist).unwrap();
        assert_eq!(kp, orig);
        assert_eq!(aligned[1].frames[3][0].frame, 3);
        assert!(aligned[1].frames[8].is_empty());
    }
}

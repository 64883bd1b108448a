use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::pose::JointDef;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub pose: PoseConfig,
    #[serde(default)]
    pub synchronization: SyncConfig,
    #[serde(default)]
    pub person_association: AssociationConfig,
    #[serde(default)]
    pub triangulation: TriangulationConfig,
    #[serde(default)]
    pub filtering: FilteringConfig,
}

// --- project ---

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    /// 複数人モード（false なら1人を想定）
    #[serde(default)]
    pub multi_person: bool,
    /// フレームレート (fps)
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,
    /// 処理範囲 [start, end)（基準カメラのフレーム番号）。空なら全フレーム
    #[serde(default)]
    pub frame_range: Vec<usize>,
}

fn default_frame_rate() -> f64 { 30.0 }

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            multi_person: false,
            frame_rate: default_frame_rate(),
            frame_range: Vec::new(),
        }
    }
}

impl ProjectConfig {
    pub fn frame_range(&self) -> Option<(usize, usize)> {
        match self.frame_range.as_slice() {
            [start, end] => Some((*start, *end)),
            _ => None,
        }
    }
}

// --- pose ---

#[derive(Debug, Deserialize, Clone)]
pub struct PoseConfig {
    /// HALPE_26 | BODY_25 | CUSTOM
    #[serde(default = "default_pose_model")]
    pub pose_model: String,
    /// pose_model = "CUSTOM" の場合の関節定義
    #[serde(default)]
    pub custom: Vec<JointDef>,
}

fn default_pose_model() -> String { "HALPE_26".to_string() }

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            pose_model: default_pose_model(),
            custom: Vec::new(),
        }
    }
}

// --- synchronization ---

/// "all" もしくは関節名のリスト
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum KeypointSelection {
    Keyword(String),
    Names(Vec<String>),
}

impl KeypointSelection {
    /// 明示的に指定された関節名（"all" なら None）
    pub fn names(&self) -> Option<&[String]> {
        match self {
            Self::Keyword(_) => None,
            Self::Names(names) => Some(names),
        }
    }
}

/// "auto" もしくはカメラごとの最大速度時刻（秒）
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum MaxSpeedTime {
    Keyword(String),
    Seconds(Vec<f64>),
}

impl MaxSpeedTime {
    pub fn seconds(&self) -> Option<&[f64]> {
        match self {
            Self::Keyword(_) => None,
            Self::Seconds(s) => Some(s),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 基準カメラ名（空なら先頭カメラ）
    #[serde(default)]
    pub reference_camera: String,
    #[serde(default = "default_keypoints_to_consider")]
    pub keypoints_to_consider: KeypointSelection,
    #[serde(default = "default_approx_time_maxspeed")]
    pub approx_time_maxspeed: MaxSpeedTime,
    /// 最大速度時刻の前後何秒を探索するか
    #[serde(default = "default_time_range_around_maxspeed")]
    pub time_range_around_maxspeed: f64,
    #[serde(default = "default_sync_likelihood_threshold")]
    pub likelihood_threshold: f64,
    /// 速度シグナル平滑化のカットオフ周波数 (Hz)
    #[serde(default = "default_sync_filter_cutoff")]
    pub filter_cutoff: f64,
    #[serde(default = "default_sync_filter_order")]
    pub filter_order: usize,
    /// これ未満の相関しか得られないカメラは同期失敗として除外
    #[serde(default = "default_min_correlation")]
    pub min_correlation: f64,
}

fn default_true() -> bool { true }
fn default_keypoints_to_consider() -> KeypointSelection { KeypointSelection::Keyword("all".to_string()) }
fn default_approx_time_maxspeed() -> MaxSpeedTime { MaxSpeedTime::Keyword("auto".to_string()) }
fn default_time_range_around_maxspeed() -> f64 { 2.0 }
fn default_sync_likelihood_threshold() -> f64 { 0.4 }
fn default_sync_filter_cutoff() -> f64 { 6.0 }
fn default_sync_filter_order() -> usize { 4 }
fn default_min_correlation() -> f64 { 0.3 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reference_camera: String::new(),
            keypoints_to_consider: default_keypoints_to_consider(),
            approx_time_maxspeed: default_approx_time_maxspeed(),
            time_range_around_maxspeed: default_time_range_around_maxspeed(),
            likelihood_threshold: default_sync_likelihood_threshold(),
            filter_cutoff: default_sync_filter_cutoff(),
            filter_order: default_sync_filter_order(),
            min_correlation: default_min_correlation(),
        }
    }
}

// --- person_association ---

#[derive(Debug, Deserialize, Clone)]
pub struct AssociationConfig {
    #[serde(default = "default_likelihood_threshold_association")]
    pub likelihood_threshold_association: f64,
    #[serde(default)]
    pub single_person: SinglePersonConfig,
    #[serde(default)]
    pub multi_person: MultiPersonConfig,
}

fn default_likelihood_threshold_association() -> f64 { 0.3 }

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            likelihood_threshold_association: default_likelihood_threshold_association(),
            single_person: SinglePersonConfig::default(),
            multi_person: MultiPersonConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinglePersonConfig {
    /// 追跡キーポイントの再投影誤差閾値（ピクセル）
    #[serde(default = "default_reproj_error_threshold_association")]
    pub reproj_error_threshold_association: f64,
    #[serde(default = "default_tracked_keypoint")]
    pub tracked_keypoint: String,
}

fn default_reproj_error_threshold_association() -> f64 { 20.0 }
fn default_tracked_keypoint() -> String { "Neck".to_string() }

impl Default for SinglePersonConfig {
    fn default() -> Self {
        Self {
            reproj_error_threshold_association: default_reproj_error_threshold_association(),
            tracked_keypoint: default_tracked_keypoint(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MultiPersonConfig {
    /// 仮三角測量の平均再構成誤差閾値（メートル）
    #[serde(default = "default_reconstruction_error_threshold")]
    pub reconstruction_error_threshold: f64,
    #[serde(default = "default_min_affinity")]
    pub min_affinity: f64,
    /// 1フレームあたりの許容移動量（メートル）。トラックとの対応付けのゲート
    #[serde(default = "default_max_track_displacement")]
    pub max_track_displacement: f64,
    /// 未観測のままこのフレーム数を超えたトラックを終了する
    #[serde(default = "default_track_timeout")]
    pub track_timeout: usize,
}

fn default_reconstruction_error_threshold() -> f64 { 0.1 }
fn default_min_affinity() -> f64 { 0.2 }
fn default_max_track_displacement() -> f64 { 0.5 }
fn default_track_timeout() -> usize { 10 }

impl Default for MultiPersonConfig {
    fn default() -> Self {
        Self {
            reconstruction_error_threshold: default_reconstruction_error_threshold(),
            min_affinity: default_min_affinity(),
            max_track_displacement: default_max_track_displacement(),
            track_timeout: default_track_timeout(),
        }
    }
}

// --- triangulation ---

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationKind {
    #[default]
    Linear,
    Cubic,
    Nearest,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    #[default]
    LastValue,
    Nan,
    Zeros,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TriangulationConfig {
    #[serde(default = "default_reproj_error_threshold_triangulation")]
    pub reproj_error_threshold_triangulation: f64,
    #[serde(default = "default_likelihood_threshold_triangulation")]
    pub likelihood_threshold_triangulation: f64,
    #[serde(default = "default_min_cameras_for_triangulation")]
    pub min_cameras_for_triangulation: usize,
    /// この長さ以下の欠損を補間する（フレーム数）
    #[serde(default = "default_interp_if_gap_smaller_than")]
    pub interp_if_gap_smaller_than: usize,
    #[serde(default)]
    pub interpolation: InterpolationKind,
    #[serde(default)]
    pub fill_large_gaps_with: FillPolicy,
    #[serde(default, rename = "handle_LR_swap")]
    pub handle_lr_swap: bool,
    #[serde(default)]
    pub undistort_points: bool,
    #[serde(default = "default_true")]
    pub make_c3d: bool,
}

fn default_reproj_error_threshold_triangulation() -> f64 { 15.0 }
fn default_likelihood_threshold_triangulation() -> f64 { 0.3 }
fn default_min_cameras_for_triangulation() -> usize { 2 }
fn default_interp_if_gap_smaller_than() -> usize { 10 }

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            reproj_error_threshold_triangulation: default_reproj_error_threshold_triangulation(),
            likelihood_threshold_triangulation: default_likelihood_threshold_triangulation(),
            min_cameras_for_triangulation: default_min_cameras_for_triangulation(),
            interp_if_gap_smaller_than: default_interp_if_gap_smaller_than(),
            interpolation: InterpolationKind::default(),
            fill_large_gaps_with: FillPolicy::default(),
            handle_lr_swap: false,
            undistort_points: false,
            make_c3d: true,
        }
    }
}

// --- filtering ---

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    #[default]
    Butterworth,
    Kalman,
    Gaussian,
    #[serde(rename = "LOESS", alias = "loess")]
    Loess,
    Median,
    OneEuro,
    None,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FilteringConfig {
    #[serde(default, rename = "type")]
    pub filter_type: FilterType,
    #[serde(default)]
    pub butterworth: ButterworthConfig,
    #[serde(default)]
    pub kalman: KalmanConfig,
    #[serde(default)]
    pub gaussian: GaussianConfig,
    #[serde(default, rename = "LOESS", alias = "loess")]
    pub loess: LoessConfig,
    #[serde(default)]
    pub median: MedianConfig,
    #[serde(default)]
    pub one_euro: OneEuroConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ButterworthConfig {
    #[serde(default = "default_butterworth_order")]
    pub order: usize,
    #[serde(default = "default_cut_off_frequency")]
    pub cut_off_frequency: f64,
}

fn default_butterworth_order() -> usize { 4 }
fn default_cut_off_frequency() -> f64 { 6.0 }

impl Default for ButterworthConfig {
    fn default() -> Self {
        Self {
            order: default_butterworth_order(),
            cut_off_frequency: default_cut_off_frequency(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KalmanConfig {
    /// 観測の信頼度 / プロセスの信頼度
    #[serde(default = "default_trust_ratio")]
    pub trust_ratio: f64,
    /// RTSスムーザ（後ろ向きパス）を適用するか
    #[serde(default = "default_true")]
    pub smooth: bool,
}

fn default_trust_ratio() -> f64 { 500.0 }

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            trust_ratio: default_trust_ratio(),
            smooth: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GaussianConfig {
    #[serde(default = "default_sigma_kernel")]
    pub sigma_kernel: f64,
}

fn default_sigma_kernel() -> f64 { 1.0 }

impl Default for GaussianConfig {
    fn default() -> Self {
        Self { sigma_kernel: default_sigma_kernel() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoessConfig {
    #[serde(default = "default_nb_values_used")]
    pub nb_values_used: usize,
}

fn default_nb_values_used() -> usize { 5 }

impl Default for LoessConfig {
    fn default() -> Self {
        Self { nb_values_used: default_nb_values_used() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MedianConfig {
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
}

fn default_kernel_size() -> usize { 3 }

impl Default for MedianConfig {
    fn default() -> Self {
        Self { kernel_size: default_kernel_size() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OneEuroConfig {
    #[serde(default = "default_min_cutoff")]
    pub min_cutoff: f64,
    #[serde(default)]
    pub beta: f64,
    #[serde(default = "default_d_cutoff")]
    pub d_cutoff: f64,
}

fn default_min_cutoff() -> f64 { 1.0 }
fn default_d_cutoff() -> f64 { 1.0 }

impl Default for OneEuroConfig {
    fn default() -> Self {
        Self {
            min_cutoff: default_min_cutoff(),
            beta: 0.0,
            d_cutoff: default_d_cutoff(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// ファイルがなければデフォルト設定、あれば読み込む（壊れていればエラー）
    pub fn load_if_present<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("{} not found; using default configuration", path.display());
            Ok(Self::default())
        }
    }

    /// 読めなければデフォルト設定で続行する
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{:#}; using default configuration", e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let tri = &self.triangulation;
        if tri.min_cameras_for_triangulation < 2 {
            bail!(
                "min_cameras_for_triangulation must be >= 2 (got {})",
                tri.min_cameras_for_triangulation
            );
        }
        if tri.reproj_error_threshold_triangulation <= 0.0 {
            bail!("reproj_error_threshold_triangulation must be positive");
        }
        if !(0.0..=1.0).contains(&tri.likelihood_threshold_triangulation) {
            bail!("likelihood_threshold_triangulation must be within [0, 1]");
        }
        if self.project.frame_rate <= 0.0 {
            bail!("frame_rate must be positive (got {})", self.project.frame_rate);
        }
        if let Some((start, end)) = self.project.frame_range() {
            if start >= end {
                bail!("frame_range start {} must be < end {}", start, end);
            }
        } else if !self.project.frame_range.is_empty() {
            bail!("frame_range must be empty or [start, end]");
        }
        let assoc = &self.person_association;
        if !(0.0..=1.0).contains(&assoc.likelihood_threshold_association) {
            bail!("likelihood_threshold_association must be within [0, 1]");
        }
        if assoc.multi_person.min_affinity < 0.0 || assoc.multi_person.min_affinity > 1.0 {
            bail!("min_affinity must be within [0, 1]");
        }
        let filt = &self.filtering;
        match filt.filter_type {
            FilterType::Butterworth => {
                if filt.butterworth.order == 0 {
                    bail!("butterworth order must be >= 1");
                }
                let nyquist = self.project.frame_rate / 2.0;
                if filt.butterworth.cut_off_frequency <= 0.0
                    || filt.butterworth.cut_off_frequency >= nyquist
                {
                    bail!(
                        "butterworth cut_off_frequency must be within (0, {}) Hz",
                        nyquist
                    );
                }
            }
            FilterType::Kalman if filt.kalman.trust_ratio <= 0.0 => {
                bail!("kalman trust_ratio must be positive");
            }
            FilterType::Gaussian if filt.gaussian.sigma_kernel <= 0.0 => {
                bail!("gaussian sigma_kernel must be positive");
            }
            FilterType::Loess if filt.loess.nb_values_used < 2 => {
                bail!("LOESS nb_values_used must be >= 2");
            }
            FilterType::Median if filt.median.kernel_size % 2 == 0 => {
                bail!("median kernel_size must be odd (got {})", filt.median.kernel_size);
            }
            _ => {}
        }
        if self.synchronization.enabled && self.synchronization.time_range_around_maxspeed <= 0.0 {
            bail!("time_range_around_maxspeed must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.triangulation.min_cameras_for_triangulation, 2);
        assert_eq!(config.triangulation.interp_if_gap_smaller_than, 10);
        assert_eq!(config.triangulation.interpolation, InterpolationKind::Linear);
        assert_eq!(config.filtering.filter_type, FilterType::Butterworth);
        assert_eq!(config.person_association.single_person.tracked_keypoint, "Neck");
        assert!(config.synchronization.keypoints_to_consider.names().is_none());
        assert!(config.synchronization.approx_time_maxspeed.seconds().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sections() {
        let content = r#"
            [project]
            multi_person = true
            frame_rate = 60
            frame_range = [10, 200]

            [synchronization]
            keypoints_to_consider = ["RWrist", "LWrist"]
            approx_time_maxspeed = [1.5, 1.6, 1.4]

            [triangulation]
            handle_LR_swap = true
            fill_large_gaps_with = "nan"
            interpolation = "cubic"

            [filtering]
            type = "LOESS"
            [filtering.LOESS]
            nb_values_used = 9
        "#;
        let config: Config = toml::from_str(content).unwrap();
        assert!(config.project.multi_person);
        assert_eq!(config.project.frame_rate, 60.0);
        assert_eq!(config.project.frame_range(), Some((10, 200)));
        assert_eq!(
            config.synchronization.keypoints_to_consider.names().map(|n| n.len()),
            Some(2)
        );
        assert_eq!(
            config.synchronization.approx_time_maxspeed.seconds(),
            Some(&[1.5, 1.6, 1.4][..])
        );
        assert!(config.triangulation.handle_lr_swap);
        assert_eq!(config.triangulation.fill_large_gaps_with, FillPolicy::Nan);
        assert_eq!(config.triangulation.interpolation, InterpolationKind::Cubic);
        assert_eq!(config.filtering.filter_type, FilterType::Loess);
        assert_eq!(config.filtering.loess.nb_values_used, 9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_custom_skeleton_section() {
        let content = r#"
            [pose]
            pose_model = "CUSTOM"
            [[pose.custom]]
            name = "Root"
            id = 0
            children = [1]
            [[pose.custom]]
            name = "Tip"
            id = 1
        "#;
        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(config.pose.custom.len(), 2);
        assert!(config.pose.custom[1].children.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.triangulation.min_cameras_for_triangulation = 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.filtering.filter_type = FilterType::Median;
        config.filtering.median.kernel_size = 4;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.filtering.butterworth.cut_off_frequency = 20.0; // Nyquist = 15 Hz
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/Config.toml");
        assert_eq!(config.project.frame_rate, 30.0);
    }

    #[test]
    fn test_load_if_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Config.toml");
        let config = Config::load_if_present(&path).unwrap();
        assert_eq!(config.project.frame_rate, 30.0);

        fs::write(&path, "[project]\nframe_rate = 60.0\n").unwrap();
        assert_eq!(Config::load_if_present(&path).unwrap().project.frame_rate, 60.0);

        // 存在するが壊れているファイルはデフォルトにしない
        fs::write(&path, "[triangulation]\nmin_cameras_for_triangulation = 1\n").unwrap();
        assert!(Config::load_if_present(&path).is_err());
        fs::write(&path, "not toml [").unwrap();
        assert!(Config::load_if_present(&path).is_err());
    }
}

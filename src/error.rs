use serde::Serialize;
use thiserror::Error;

// --- 致命的エラー ---

/// キャリブレーション読み込み・変換エラー
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("failed to read calibration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TOML calibration parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML calibration write error: {0}")]
    TomlWrite(#[from] toml::ser::Error),
    #[error("JSON calibration parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XML calibration parse error: {0}")]
    Xml(String),
    #[error("missing field `{field}` for camera {camera}")]
    MissingField { camera: String, field: String },
    #[error("invalid value for `{field}` of camera {camera}: {reason}")]
    InvalidValue {
        camera: String,
        field: String,
        reason: String,
    },
    #[error("unsupported calibration format: {0}")]
    UnsupportedFormat(String),
    #[error("calibration contains no cameras")]
    Empty,
}

/// スケルトン定義の構造エラー
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SkeletonError {
    #[error("skeleton has no joints")]
    Empty,
    #[error("duplicate joint id {0}")]
    DuplicateId(usize),
    #[error("duplicate joint name {0:?}")]
    DuplicateName(String),
    #[error("joint {parent:?} references unknown child id {child}")]
    UnknownChild { parent: String, child: usize },
    #[error("joint {0:?} has more than one parent")]
    MultipleParents(String),
    #[error("skeleton has no root joint (every joint has a parent)")]
    NoRoot,
    #[error("skeleton has several root joints: {0:?}")]
    MultipleRoots(Vec<String>),
    #[error("joint {0:?} is part of a cycle")]
    Cycle(String),
    #[error("unknown skeleton model {0:?}")]
    UnknownModel(String),
}

/// パイプライン全体を中断するエラー
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("calibration format error: {0}")]
    CalibrationFormat(#[from] CalibrationError),
    #[error("malformed skeleton model: {0}")]
    MalformedSkeleton(#[from] SkeletonError),
    #[error("camera stream {0:?} has no calibration entry")]
    UnknownCamera(String),
    #[error("only {usable} usable cameras, at least {required} required for triangulation")]
    NotEnoughCameras { usable: usize, required: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
}

// --- 非致命的な欠損（マニフェストに記録） ---

/// フレーム・関節単位の欠損理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GapReason {
    /// 有効な観測カメラ数が最小数未満
    InsufficientViews,
    /// 外れ値除去後も再投影誤差が閾値を超えた
    ExcessiveReprojectionError,
    /// 人物対応付けが一意に決まらずグループを破棄した
    AssociationAmbiguity,
    /// 同期オフセットを決定できずカメラを除外した
    Unsynchronized,
}

/// 欠損サンプルの後処理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GapResolution {
    Interpolated,
    Held,
    Zeroed,
    Unfilled,
}

/// 除外されたカメラ
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExcludedCamera {
    pub camera: String,
    pub reason: GapReason,
    /// 同期時の最大相関（同期失敗時のみ）
    pub correlation: Option<f64>,
}

/// 欠損1件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GapRecord {
    pub frame: usize,
    pub person: Option<usize>,
    pub joint: Option<usize>,
    pub reason: GapReason,
    pub resolution: GapResolution,
}

/// 実行結果のうち欠損に関する記録
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunManifest {
    pub excluded_cameras: Vec<ExcludedCamera>,
    pub gaps: Vec<GapRecord>,
}

impl RunManifest {
    pub fn count(&self, reason: GapReason) -> usize {
        self.gaps.iter().filter(|g| g.reason == reason).count()
    }

    pub fn gaps_for(&self, person: usize, joint: usize) -> impl Iterator<Item = &GapRecord> {
        self.gaps
            .iter()
            .filter(move |g| g.person == Some(person) && g.joint == Some(joint))
    }
}

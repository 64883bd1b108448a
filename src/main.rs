//! 多視点2D検出から3D関節軌跡を再構成する
//!
//! Usage:
//!   multiview-pose --config Config.toml --calibration Calib.toml --pose-dir pose --output pose-3d

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use multiview_pose::calibration::CalibrationStore;
use multiview_pose::config::Config;
use multiview_pose::io::{self, openpose};
use multiview_pose::pipeline::Pipeline;
use multiview_pose::pose::Skeleton;

#[derive(Parser)]
#[command(name = "multiview-pose", version = env!("GIT_VERSION"), about = "Reconstruct 3D keypoint trajectories from synchronized 2D detections")]
struct Cli {
    /// TOML 設定ファイル。存在しなければデフォルト設定、存在して読めなければエラー
    #[arg(
        long,
        short,
        default_value = "Config.toml",
        help = "TOML config; defaults are used if the file is missing, an unreadable or invalid file is an error"
    )]
    config: PathBuf,

    /// キャリブレーション（.toml / .json / .qca.txt / .xcp）
    #[arg(long)]
    calibration: PathBuf,

    /// カメラごとのOpenPose JSONディレクトリを含むディレクトリ
    #[arg(long, default_value = "pose")]
    pose_dir: PathBuf,

    /// 出力ディレクトリ
    #[arg(long, short, default_value = "pose-3d")]
    output: PathBuf,

    /// 出力ファイル名の接頭辞
    #[arg(long, default_value = "trial")]
    name: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    info!("multiview-pose ({})", env!("GIT_VERSION"));

    let config = Config::load_if_present(&cli.config)?;
    let skeleton = Skeleton::from_model(&config.pose.pose_model, &config.pose.custom)
        .with_context(|| format!("Invalid pose model {}", config.pose.pose_model))?;
    let calibration = CalibrationStore::load(&cli.calibration)
        .with_context(|| format!("Failed to load calibration {}", cli.calibration.display()))?;

    let streams = openpose::load_pose_dir(&cli.pose_dir, &calibration)?;
    let reconstruction = Pipeline::new(&config, &calibration, &skeleton).run(&streams)?;

    let files = io::export_all(
        &cli.output,
        &cli.name,
        &reconstruction,
        &skeleton,
        config.triangulation.make_c3d,
    )?;
    for f in files {
        println!("{}", f.display());
    }
    Ok(())
}

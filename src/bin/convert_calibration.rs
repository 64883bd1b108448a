//! キャリブレーションを独自TOML形式に変換する
//!
//! Usage:
//!   convert_calibration <input(.qca.txt|.xcp|.json|.toml)> <output.toml> [--format qualisys]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use multiview_pose::calibration::{CalibrationFormat, CalibrationStore};

#[derive(Parser)]
#[command(name = "convert_calibration", version = env!("GIT_VERSION"), about = "Convert a camera calibration to the native TOML format")]
struct Cli {
    input: PathBuf,
    output: PathBuf,

    /// 拡張子から判定できない場合の形式 (native | json | qualisys | vicon)
    #[arg(long)]
    format: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let format = match &cli.format {
        Some(name) => CalibrationFormat::parse_name(name)?,
        None => CalibrationFormat::detect(&cli.input)?,
    };
    let store = CalibrationStore::load_as(&cli.input, format)
        .with_context(|| format!("Failed to read {}", cli.input.display()))?;
    store
        .save_native(&cli.output)
        .with_context(|| format!("Failed to write {}", cli.output.display()))?;

    info!(cameras = store.len(), output = %cli.output.display(), "calibration converted");
    for name in store.names() {
        println!("{}", name);
    }
    Ok(())
}

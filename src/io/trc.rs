//! TRC（OpenSim のマーカー軌跡テキスト形式）の書き出し
//!
//! 座標は Y-up に変換する: (x, y, z) → (y, z, x)。単位はメートル、欠損は空欄。

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::pipeline::Reconstruction;
use crate::pose::Skeleton;

/// Z-up のワールド座標を TRC の Y-up に
pub fn to_y_up(p: [f64; 3]) -> [f64; 3] {
    [p[1], p[2], p[0]]
}

pub fn write_trc<W: Write>(
    out: &mut W,
    file_name: &str,
    reconstruction: &Reconstruction,
    skeleton: &Skeleton,
    person: usize,
) -> Result<()> {
    let (start, end) = reconstruction.frame_range;
    let rate = reconstruction.frame_rate;
    let markers: Vec<_> = skeleton
        .joints()
        .map(|j| (j.name.as_str(), reconstruction.trajectory(person, j.id)))
        .collect();
    let frames = end - start;

    writeln!(out, "PathFileType\t4\t(X/Y/Z)\t{}", file_name)?;
    writeln!(
        out,
        "DataRate\tCameraRate\tNumFrames\tNumMarkers\tUnits\tOrigDataRate\tOrigDataStartFrame\tOrigNumFrames"
    )?;
    writeln!(
        out,
        "{}\t{}\t{}\t{}\tm\t{}\t{}\t{}",
        rate,
        rate,
        frames,
        markers.len(),
        rate,
        start,
        frames
    )?;

    let names: Vec<String> = markers.iter().map(|(name, _)| format!("{}\t\t", name)).collect();
    writeln!(out, "Frame#\tTime\t{}", names.join("\t").trim_end())?;
    let axes: Vec<String> = (1..=markers.len())
        .map(|i| format!("X{i}\tY{i}\tZ{i}"))
        .collect();
    writeln!(out, "\t\t{}", axes.join("\t"))?;
    writeln!(out)?;

    for frame in start..end {
        write!(out, "{}\t{:.6}", frame, frame as f64 / rate)?;
        for (_, traj) in &markers {
            match traj.and_then(|t| t.get(frame)) {
                Some(p) => {
                    let [x, y, z] = to_y_up(p);
                    write!(out, "\t{:.6}\t{:.6}\t{:.6}", x, y, z)?;
                }
                None => write!(out, "\t\t\t")?,
            }
        }
        writeln!(out)?;
    }
    Ok(())
}

pub fn save_trc<P: AsRef<Path>>(
    path: P,
    reconstruction: &Reconstruction,
    skeleton: &Skeleton,
    person: usize,
) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    write_trc(&mut out, name, reconstruction, skeleton, person)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunManifest;
    use crate::postprocess::Trajectory;
    use crate::sync::SyncReport;

    fn reconstruction(skeleton: &Skeleton) -> Reconstruction {
        let hip = skeleton.joint_by_name("Hip").unwrap().id;
        let mut traj = Trajectory::new(0, hip, 10, 3);
        traj.set(10, [1.0, 2.0, 3.0]);
        traj.set(12, [1.5, 2.5, 3.5]);
        Reconstruction {
            frame_range: (10, 13),
            frame_rate: 50.0,
            sync: SyncReport::identity(&[]),
            keypoints: Vec::new(),
            trajectories: vec![traj],
            manifest: RunManifest::default(),
        }
    }

    #[test]
    fn test_y_up() {
        assert_eq!(to_y_up([1.0, 2.0, 3.0]), [2.0, 3.0, 1.0]);
    }

    #[test]
    fn test_write_trc() {
        let skeleton = Skeleton::halpe26();
        let rec = reconstruction(&skeleton);
        let mut buf = Vec::new();
        write_trc(&mut buf, "person0.trc", &rec, &skeleton, 0).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "PathFileType\t4\t(X/Y/Z)\tperson0.trc");
        assert_eq!(lines[2], format!("50\t50\t3\t{}\tm\t50\t10\t3", skeleton.len()));
        assert!(lines[3].starts_with("Frame#\tTime\tHip\t\t\tRHip"));
        assert!(lines[4].starts_with("\t\tX1\tY1\tZ1\tX2"));
        assert_eq!(lines[5], "");
        assert_eq!(lines.len(), 6 + 3);

        // Hip は先頭のマーカー
        let row: Vec<&str> = lines[6].split('\t').collect();
        assert_eq!(row[0], "10");
        assert_eq!(row[1], "0.200000");
        assert_eq!(&row[2..5], &["2.000000", "3.000000", "1.000000"]);
        assert_eq!(row.len(), 2 + 3 * skeleton.len());
        assert!(row[5..].iter().all(|c| c.is_empty()));

        // 欠損フレーム
        let row: Vec<&str> = lines[7].split('\t').collect();
        assert!(row[2..5].iter().all(|c| c.is_empty()));
    }

    #[test]
    fn test_save_trc() {
        let dir = tempfile::tempdir().unwrap();
        let skeleton = Skeleton::halpe26();
        let path = dir.path().join("out.trc");
        save_trc(&path, &reconstruction(&skeleton), &skeleton, 0).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("PathFileType\t4\t(X/Y/Z)\tout.trc\n"));
    }
}

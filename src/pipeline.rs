//! 1セッション分の再構成
//!
//! 同期 → フレーム順の人物対応付け → フレーム並列の三角測量 → 軌跡ごと並列の後処理。

use std::collections::{BTreeMap, HashMap};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::association::{self, FrameAssociation};
use crate::calibration::CalibrationStore;
use crate::config::Config;
use crate::error::{ExcludedCamera, GapReason, GapRecord, GapResolution, PipelineError, RunManifest};
use crate::pose::{CameraStream, Detection2D, Skeleton};
use crate::postprocess::{PostProcessor, Trajectory};
use crate::sync::{align_streams, SyncReport, Synchronizer};
use crate::triangulation::{Keypoint3D, PersonReconstruction, Triangulator};

/// 再構成結果
#[derive(Debug, Clone)]
pub struct Reconstruction {
    /// 処理したフレーム範囲 [start, end)（基準カメラのフレーム番号）
    pub frame_range: (usize, usize),
    pub frame_rate: f64,
    pub sync: SyncReport,
    /// 後処理前の三角測量結果
    pub keypoints: Vec<Keypoint3D>,
    /// (人物, 関節) 順
    pub trajectories: Vec<Trajectory>,
    pub manifest: RunManifest,
}

impl Reconstruction {
    pub fn persons(&self) -> Vec<usize> {
        let mut persons: Vec<usize> = self.trajectories.iter().map(|t| t.person).collect();
        persons.dedup();
        persons
    }

    pub fn trajectory(&self, person: usize, joint: usize) -> Option<&Trajectory> {
        self.trajectories
            .iter()
            .find(|t| t.person == person && t.joint == joint)
    }

    pub fn trajectories_of(&self, person: usize) -> impl Iterator<Item = &Trajectory> {
        self.trajectories.iter().filter(move |t| t.person == person)
    }
}

pub struct Pipeline<'a> {
    config: &'a Config,
    calibration: &'a CalibrationStore,
    skeleton: &'a Skeleton,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, calibration: &'a CalibrationStore, skeleton: &'a Skeleton) -> Self {
        Self {
            config,
            calibration,
            skeleton,
        }
    }

    /// 検出列をキャリブレーションのカメラ順に並べ直す（検出のない カメラは空）
    fn order_streams(&self, streams: &[CameraStream]) -> Result<Vec<Option<CameraStream>>, PipelineError> {
        let mut ordered: Vec<Option<CameraStream>> = vec![None; self.calibration.len()];
        for stream in streams {
            let index = self
                .calibration
                .index_of(&stream.camera)
                .ok_or_else(|| PipelineError::UnknownCamera(stream.camera.clone()))?;
            if ordered[index].is_some() {
                return Err(PipelineError::Config(format!(
                    "more than one detection stream for camera {}",
                    stream.camera
                )));
            }
            let frames = stream
                .frames
                .iter()
                .enumerate()
                .map(|(f, dets)| {
                    dets.iter()
                        .map(|d| Detection2D {
                            camera: index,
                            frame: f,
                            ..d.clone()
                        })
                        .collect()
                })
                .collect();
            ordered[index] = Some(CameraStream::new(&stream.camera, frames));
        }
        Ok(ordered)
    }

    /// `indices[i]` は `present[i]` のキャリブレーション上のカメラ番号
    fn synchronize(&self, present: &[CameraStream], indices: Vec<usize>) -> Result<SyncReport, PipelineError> {
        let sync = &self.config.synchronization;
        if !sync.enabled || present.len() < 2 {
            return Ok(SyncReport::identity(present));
        }
        Synchronizer::new(sync, self.skeleton, self.config.project.frame_rate)
            .with_camera_indices(indices)
            .synchronize(present)
    }

    pub fn run(&self, streams: &[CameraStream]) -> Result<Reconstruction, PipelineError> {
        let cameras = self.calibration.cameras();
        let ordered = self.order_streams(streams)?;

        let mut manifest = RunManifest::default();
        for (i, slot) in ordered.iter().enumerate() {
            if slot.is_none() {
                warn!(camera = %cameras[i].name, "no detections for camera, excluded");
                manifest.excluded_cameras.push(ExcludedCamera {
                    camera: cameras[i].name.clone(),
                    reason: GapReason::InsufficientViews,
                    correlation: None,
                });
            }
        }

        // --- 同期 ---
        let (indices, present): (Vec<usize>, Vec<CameraStream>) = ordered
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.clone().map(|s| (i, s)))
            .unzip();
        let report = self.synchronize(&present, indices)?;
        manifest.excluded_cameras.extend(report.excluded());
        let aligned = align_streams(&present, &report);

        let mut by_camera: Vec<Option<&CameraStream>> = vec![None; cameras.len()];
        for stream in &aligned {
            if let Some(i) = self.calibration.index_of(&stream.camera) {
                if report.offset_of(&stream.camera).is_some() {
                    by_camera[i] = Some(stream);
                }
            }
        }
        let excluded: Vec<usize> = (0..cameras.len()).filter(|&i| by_camera[i].is_none()).collect();
        let required = self.config.triangulation.min_cameras_for_triangulation;
        let usable = cameras.len() - excluded.len();
        if usable < required {
            return Err(PipelineError::NotEnoughCameras { usable, required });
        }

        let total = aligned.iter().map(|s| s.len()).max().unwrap_or(0);
        let (start, end) = match self.config.project.frame_range() {
            Some((s, e)) => (s.min(total), e.min(total)),
            None => (0, total),
        };
        info!(
            cameras = usable,
            excluded = excluded.len(),
            frames = end - start,
            multi_person = self.config.project.multi_person,
            "reconstruction started"
        );

        // --- 人物対応付け（フレーム順） ---
        let mut associator = association::from_config(
            self.config.project.multi_person,
            cameras,
            self.skeleton,
            &self.config.person_association,
            &self.config.triangulation,
        )?;
        let associations: Vec<FrameAssociation> = (start..end)
            .map(|f| {
                let slices: Vec<&[Detection2D]> = by_camera
                    .iter()
                    .map(|s| s.and_then(|s| s.frames.get(f)).map_or(&[][..], |d| d.as_slice()))
                    .collect();
                associator.associate(f, &slices)
            })
            .collect();

        // --- 三角測量（フレーム並列） ---
        let triangulator = Triangulator::new(cameras, &self.config.triangulation).with_excluded(&excluded);
        let reconstructed: Vec<Vec<(usize, usize, PersonReconstruction)>> = associations
            .par_iter()
            .map(|fa| {
                fa.persons
                    .iter()
                    .map(|p| {
                        let views: Vec<&Detection2D> = p.views.iter().collect();
                        let rec = triangulator.reconstruct_person(self.skeleton, fa.frame, p.person, &views);
                        (fa.frame, p.person, rec)
                    })
                    .collect()
            })
            .collect();

        let mut keypoints = Vec::new();
        let mut reasons: HashMap<(usize, usize, usize), GapReason> = HashMap::new();
        let mut swaps = 0;
        for (frame, person, rec) in reconstructed.into_iter().flatten() {
            swaps += rec.swaps.len();
            for (joint, reason) in rec.gaps {
                reasons.insert((frame, person, joint), reason);
            }
            keypoints.extend(rec.keypoints);
        }
        if swaps > 0 {
            info!(swaps, "left/right swaps corrected");
        }
        for fa in &associations {
            for dropped in &fa.dropped {
                match dropped.person {
                    Some(person) => {
                        for joint in self.skeleton.ids() {
                            reasons.insert((fa.frame, person, joint), GapReason::AssociationAmbiguity);
                        }
                    }
                    None => manifest.gaps.push(GapRecord {
                        frame: fa.frame,
                        person: None,
                        joint: None,
                        reason: GapReason::AssociationAmbiguity,
                        resolution: GapResolution::Unfilled,
                    }),
                }
            }
        }

        // --- 軌跡の組み立てと後処理（軌跡並列） ---
        let mut spans: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
        for track in associator.tracks() {
            let span = if self.config.project.multi_person {
                let mut observed = track.observed_frames();
                let Some(first) = observed.next() else { continue };
                let last = observed.last().unwrap_or(first);
                (first, last + 1)
            } else {
                (start, end)
            };
            spans.insert(track.id, span);
        }

        let mut grouped: BTreeMap<(usize, usize), Vec<&Keypoint3D>> = BTreeMap::new();
        for kp in &keypoints {
            grouped.entry((kp.person, kp.joint)).or_default().push(kp);
        }
        let mut trajectories: Vec<Trajectory> = spans
            .iter()
            .flat_map(|(&person, &(s, e))| {
                let grouped = &grouped;
                self.skeleton.ids().into_iter().map(move |joint| {
                    let kps = grouped.get(&(person, joint)).map(|v| v.as_slice()).unwrap_or(&[]);
                    Trajectory::from_keypoints(person, joint, s, e, kps.iter().copied())
                })
            })
            .collect();

        let processor = PostProcessor::from_config(
            &self.config.triangulation,
            &self.config.filtering,
            self.config.project.frame_rate,
        );
        let resolutions: Vec<Vec<(usize, GapResolution)>> =
            trajectories.par_iter_mut().map(|t| processor.process(t)).collect();

        for (traj, res) in trajectories.iter().zip(resolutions) {
            for (frame, resolution) in res {
                let reason = reasons
                    .get(&(frame, traj.person, traj.joint))
                    .copied()
                    .unwrap_or(GapReason::InsufficientViews);
                manifest.gaps.push(GapRecord {
                    frame,
                    person: Some(traj.person),
                    joint: Some(traj.joint),
                    reason,
                    resolution,
                });
            }
        }
        manifest.gaps.sort_by_key(|g| (g.frame, g.person, g.joint));

        for reason in [
            GapReason::InsufficientViews,
            GapReason::ExcessiveReprojectionError,
            GapReason::AssociationAmbiguity,
        ] {
            let count = manifest.count(reason);
            if count > 0 {
                debug!(?reason, count, "gaps");
            }
        }
        info!(
            persons = spans.len(),
            keypoints = keypoints.len(),
            gaps = manifest.gaps.len(),
            filter = processor.filter().name(),
            "reconstruction finished"
        );

        Ok(Reconstruction {
            frame_range: (start, end),
            frame_rate: self.config.project.frame_rate,
            sync: report,
            keypoints,
            trajectories,
            manifest,
        })
    }
}

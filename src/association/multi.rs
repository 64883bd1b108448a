use std::collections::BTreeMap;

use nalgebra::{Point2, Point3, Vector3};
use tracing::{debug, info};

use super::{observation, with_camera, Associator, DroppedGroup, FrameAssociation, PersonObservation, PersonTrack};
use crate::calibration::Camera;
use crate::config::{AssociationConfig, TriangulationConfig};
use crate::pose::Detection2D;
use crate::triangulation::{triangulate_weighted, Observation};

/// 検出ノード（カメラ, フレーム内インデックス）
type Node = (usize, usize);

/// 複数人物モード
///
/// 1. 異なるカメラの検出ペアごとに、共通関節の視線（半直線）同士の最短距離の平均から親和度を求める
/// 2. 親和度の高いペアから順に、カメラが重複せず併合後の仮三角測量が閾値以内ならグループを併合する
/// 3. グループを仮に三角測量し、視線と3D点の平均距離が閾値を超えるものは破棄
/// 4. 残ったグループを重心の近いトラックに割り当て、余ったものは新規トラック
pub struct MultiPersonAssociator<'a> {
    cameras: &'a [Camera],
    likelihood_threshold: f64,
    reconstruction_threshold: f64,
    min_affinity: f64,
    max_displacement: f64,
    timeout: usize,
    undistort: bool,
    tracks: Vec<PersonTrack>,
}

/// 仮三角測量を通ったグループ
struct Group {
    members: Vec<Node>,
    centroid: Point3<f64>,
}

impl<'a> MultiPersonAssociator<'a> {
    pub fn new(cameras: &'a [Camera], association: &AssociationConfig, triangulation: &TriangulationConfig) -> Self {
        let multi = &association.multi_person;
        Self {
            cameras,
            likelihood_threshold: association.likelihood_threshold_association,
            reconstruction_threshold: multi.reconstruction_error_threshold,
            min_affinity: multi.min_affinity,
            max_displacement: multi.max_track_displacement,
            timeout: multi.track_timeout,
            undistort: triangulation.undistort_points,
            tracks: Vec::new(),
        }
    }

    fn pixel(&self, obs: &Observation) -> Point2<f64> {
        if self.undistort {
            let (u, v) = self.cameras[obs.camera].undistort_point(obs.point.x, obs.point.y);
            Point2::new(u, v)
        } else {
            obs.point
        }
    }

    fn ray(&self, obs: &Observation) -> Option<(Point3<f64>, Vector3<f64>)> {
        self.cameras.get(obs.camera)?.ray(&self.pixel(obs))
    }

    /// カメラ `ca` の検出 `a` とカメラ `cb` の検出 `b` の親和度 (0..=1)。共通の有効関節がなければ 0
    pub fn affinity(&self, (ca, a): (usize, &Detection2D), (cb, b): (usize, &Detection2D)) -> f64 {
        let mut distances = Vec::new();
        for &joint in a.keypoints.keys() {
            let (Some(oa), Some(ob)) = (
                observation(a, joint, self.likelihood_threshold).map(|o| Observation { camera: ca, ..o }),
                observation(b, joint, self.likelihood_threshold).map(|o| Observation { camera: cb, ..o }),
            ) else {
                continue;
            };
            if let (Some(ra), Some(rb)) = (self.ray(&oa), self.ray(&ob)) {
                distances.push(ray_distance(&ra, &rb));
            }
        }
        if distances.is_empty() {
            return 0.0;
        }
        let mean = distances.iter().sum::<f64>() / distances.len() as f64;
        (1.0 - mean / self.reconstruction_threshold).max(0.0)
    }

    /// 親和度の高い順にグループ化（1グループにつき1カメラ1検出）
    fn cluster(&self, detections: &[&[Detection2D]]) -> Vec<Vec<Node>> {
        let nodes: Vec<Node> = detections
            .iter()
            .enumerate()
            .take(self.cameras.len())
            .flat_map(|(c, dets)| (0..dets.len()).map(move |i| (c, i)))
            .collect();

        let mut edges: Vec<(f64, Node, Node)> = Vec::new();
        for (k, &a) in nodes.iter().enumerate() {
            for &b in &nodes[k + 1..] {
                if a.0 == b.0 {
                    continue;
                }
                let w = self.affinity((a.0, &detections[a.0][a.1]), (b.0, &detections[b.0][b.1]));
                if w > 0.0 && w >= self.min_affinity {
                    edges.push((w, a, b));
                }
            }
        }
        // 親和度降順、同値はノード順
        edges.sort_by(|x, y| y.0.total_cmp(&x.0).then((x.1, x.2).cmp(&(y.1, y.2))));

        let mut group_of: BTreeMap<Node, usize> = nodes.iter().enumerate().map(|(g, &n)| (n, g)).collect();
        let mut groups: Vec<Vec<Node>> = nodes.iter().map(|&n| vec![n]).collect();

        for (_, a, b) in edges {
            let (ga, gb) = (group_of[&a], group_of[&b]);
            if ga == gb {
                continue;
            }
            let overlap = groups[ga].iter().any(|m| groups[gb].iter().any(|n| n.0 == m.0));
            if overlap {
                continue;
            }
            let merged: Vec<Node> = groups[ga].iter().chain(&groups[gb]).copied().collect();
            if !self.consistent(detections, &merged) {
                continue;
            }
            let (keep, merge) = (ga.min(gb), ga.max(gb));
            let moved = std::mem::take(&mut groups[merge]);
            for n in &moved {
                group_of.insert(*n, keep);
            }
            groups[keep].extend(moved);
        }

        groups
            .into_iter()
            .filter(|g| g.len() >= 2)
            .map(|mut g| {
                g.sort_unstable();
                g
            })
            .collect()
    }

    fn consistent(&self, detections: &[&[Detection2D]], members: &[Node]) -> bool {
        matches!(self.provisional(detections, members), Some((_, error)) if error <= self.reconstruction_threshold)
    }

    /// 仮三角測量。(重心, 視線と3D点の平均距離)
    fn provisional(&self, detections: &[&[Detection2D]], members: &[Node]) -> Option<(Point3<f64>, f64)> {
        let views: Vec<&Detection2D> = members.iter().map(|&(c, i)| &detections[c][i]).collect();
        let mut joints: Vec<usize> = views.iter().flat_map(|d| d.keypoints.keys().copied()).collect();
        joints.sort_unstable();
        joints.dedup();

        let mut positions = Vec::new();
        let mut errors = Vec::new();
        for joint in joints {
            let obs: Vec<Observation> = members
                .iter()
                .zip(&views)
                .filter_map(|(&(c, _), d)| {
                    observation(d, joint, self.likelihood_threshold).map(|o| Observation { camera: c, ..o })
                })
                .map(|o| Observation {
                    point: self.pixel(&o),
                    ..o
                })
                .collect();
            if obs.len() < 2 {
                continue;
            }
            let Some(p) = triangulate_weighted(self.cameras, &obs) else {
                continue;
            };
            let dist: Vec<f64> = obs
                .iter()
                .filter_map(|o| self.cameras[o.camera].ray(&o.point))
                .map(|(origin, dir)| point_ray_distance(&p, &origin, &dir))
                .collect();
            if dist.is_empty() {
                continue;
            }
            errors.push(dist.iter().sum::<f64>() / dist.len() as f64);
            positions.push(p.coords);
        }
        if positions.is_empty() {
            return None;
        }
        let n = positions.len() as f64;
        let centroid = Point3::from(positions.iter().sum::<Vector3<f64>>() / n);
        Some((centroid, errors.iter().sum::<f64>() / errors.len() as f64))
    }

    /// 重心の近い順にトラックへ割り当て。戻り値はグループごとのトラックID
    fn match_tracks(&mut self, frame: usize, groups: &[Group]) -> Vec<usize> {
        let mut pairs: Vec<(f64, usize, usize)> = Vec::new();
        for (t, track) in self.tracks.iter().enumerate() {
            if !track.is_live() {
                continue;
            }
            let Some(pos) = track.position() else { continue };
            let gate = self.max_displacement * track.frames_since_seen(frame).max(1) as f64;
            for (g, group) in groups.iter().enumerate() {
                let d = (group.centroid - pos).norm();
                if d <= gate {
                    pairs.push((d, t, g));
                }
            }
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then((a.1, a.2).cmp(&(b.1, b.2))));

        let mut assigned: Vec<Option<usize>> = vec![None; groups.len()];
        let mut used = vec![false; self.tracks.len()];
        for (_, t, g) in pairs {
            if used[t] || assigned[g].is_some() {
                continue;
            }
            used[t] = true;
            assigned[g] = Some(t);
        }

        // 今回観測されなかったトラック
        for (t, track) in self.tracks.iter_mut().enumerate() {
            if !used[t] && track.is_live() && track.miss(self.timeout) {
                info!(track = track.id, last_seen = track.last_seen(), "person track ended");
            }
        }

        assigned
            .into_iter()
            .map(|slot| match slot {
                Some(t) => t,
                None => {
                    let id = self.tracks.len();
                    info!(track = id, frame, "new person track");
                    self.tracks.push(PersonTrack::new(id, frame));
                    id
                }
            })
            .collect()
    }
}

impl Associator for MultiPersonAssociator<'_> {
    fn associate(&mut self, frame: usize, detections: &[&[Detection2D]]) -> FrameAssociation {
        let mut result = FrameAssociation {
            frame,
            ..Default::default()
        };

        let mut groups = Vec::new();
        for members in self.cluster(detections) {
            match self.provisional(detections, &members) {
                Some((centroid, error)) if error <= self.reconstruction_threshold => {
                    groups.push(Group { members, centroid });
                }
                _ => {
                    debug!(frame, cameras = ?members.iter().map(|m| m.0).collect::<Vec<_>>(), "group dropped");
                    result.dropped.push(DroppedGroup {
                        person: None,
                        cameras: members.iter().map(|m| m.0).collect(),
                    });
                }
            }
        }

        // トラックIDはインデックスと一致する
        let ids = self.match_tracks(frame, &groups);
        for (group, id) in groups.iter().zip(ids) {
            let views = group
                .members
                .iter()
                .map(|&(c, i)| with_camera(&detections[c][i], c))
                .collect();
            self.tracks[id].hit(frame, Some(group.centroid), group.members.iter().copied().collect());
            result.persons.push(PersonObservation { person: id, views });
        }
        result.persons.sort_by_key(|p| p.person);
        result
    }

    fn tracks(&self) -> &[PersonTrack] {
        &self.tracks
    }
}

/// 2本の視線（カメラ中心から前方への半直線）の最短距離
fn ray_distance(a: &(Point3<f64>, Vector3<f64>), b: &(Point3<f64>, Vector3<f64>)) -> f64 {
    let (oa, da) = a;
    let (ob, db) = b;
    let w = oa - ob;
    let (aa, ab, bb) = (da.dot(da), da.dot(db), db.dot(db));
    let (d, e) = (da.dot(&w), db.dot(&w));

    let denom = aa * bb - ab * ab;
    if denom > 1e-12 {
        let s = (ab * e - bb * d) / denom;
        let t = (aa * e - ab * d) / denom;
        if s >= 0.0 && t >= 0.0 {
            return (w + da * s - db * t).norm();
        }
    }
    // 最近点がどちらかのカメラの背後なら、端点 s = 0 か t = 0 の上で最小
    let t = (e / bb).max(0.0);
    let s = (-d / aa).max(0.0);
    (w - db * t).norm().min((w + da * s).norm())
}

/// 点と半直線の距離（`dir` は単位ベクトル）
fn point_ray_distance(p: &Point3<f64>, origin: &Point3<f64>, dir: &Vector3<f64>) -> f64 {
    let v = p - origin;
    if v.dot(dir) < 0.0 {
        return v.norm();
    }
    v.cross(dir).norm()
}

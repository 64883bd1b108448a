//! 人物トラックの状態遷移
//!
//! Active → Occluded{missed} → Ended。Occluded 中に再観測されれば Active に戻る。

use std::collections::BTreeMap;

use nalgebra::Point3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// 直近フレームで観測された
    Active,
    /// 連続 `missed` フレーム未観測
    Occluded { missed: usize },
    /// タイムアウトで終了（最後に観測されたフレーム）
    Ended { last_seen: usize },
}

/// フレームをまたいで同一人物を表すトラック
#[derive(Debug, Clone)]
pub struct PersonTrack {
    pub id: usize,
    state: TrackState,
    first_frame: usize,
    last_seen: usize,
    position: Option<Point3<f64>>,
    /// フレーム → (カメラ → そのカメラのフレーム内検出インデックス)
    views: BTreeMap<usize, BTreeMap<usize, usize>>,
}

impl PersonTrack {
    pub fn new(id: usize, frame: usize) -> Self {
        Self {
            id,
            state: TrackState::Active,
            first_frame: frame,
            last_seen: frame,
            position: None,
            views: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.state, TrackState::Ended { .. })
    }

    pub fn first_frame(&self) -> usize {
        self.first_frame
    }

    pub fn last_seen(&self) -> usize {
        self.last_seen
    }

    /// 最後に観測された重心
    pub fn position(&self) -> Option<Point3<f64>> {
        self.position
    }

    /// 最後の観測からの経過フレーム数
    pub fn frames_since_seen(&self, frame: usize) -> usize {
        frame.saturating_sub(self.last_seen)
    }

    /// 観測あり
    pub fn hit(&mut self, frame: usize, position: Option<Point3<f64>>, views: BTreeMap<usize, usize>) {
        if !self.is_live() {
            return;
        }
        self.state = TrackState::Active;
        self.last_seen = frame;
        if position.is_some() {
            self.position = position;
        }
        self.views.insert(frame, views);
    }

    /// 観測なし。`timeout` フレームを超えて未観測なら終了し true を返す
    pub fn miss(&mut self, timeout: usize) -> bool {
        let missed = match self.state {
            TrackState::Active => 1,
            TrackState::Occluded { missed } => missed + 1,
            TrackState::Ended { .. } => return false,
        };
        if missed > timeout {
            self.state = TrackState::Ended {
                last_seen: self.last_seen,
            };
            return true;
        }
        self.state = TrackState::Occluded { missed };
        false
    }

    pub fn views_at(&self, frame: usize) -> Option<&BTreeMap<usize, usize>> {
        self.views.get(&frame)
    }

    /// 観測されたフレーム（昇順）
    pub fn observed_frames(&self) -> impl Iterator<Item = usize> + '_ {
        self.views.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occlusion_and_resume() {
        let mut track = PersonTrack::new(3, 0);
        track.hit(0, Some(Point3::origin()), BTreeMap::from([(0, 0), (1, 0)]));
        assert!(!track.miss(2));
        assert_eq!(track.state(), TrackState::Occluded { missed: 1 });
        assert!(!track.miss(2));
        track.hit(3, None, BTreeMap::from([(1, 1)]));
        assert_eq!(track.state(), TrackState::Active);
        assert_eq!(track.last_seen(), 3);
        // 位置がない観測では直前の位置を保持
        assert_eq!(track.position(), Some(Point3::origin()));
        assert_eq!(track.observed_frames().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(track.views_at(3).and_then(|v| v.get(&1)), Some(&1));
    }

    #[test]
    fn test_timeout_ends_track() {
        let mut track = PersonTrack::new(0, 5);
        track.hit(5, None, BTreeMap::new());
        assert!(!track.miss(1));
        assert!(track.miss(1));
        assert_eq!(track.state(), TrackState::Ended { last_seen: 5 });
        assert!(!track.is_live());
        // 終了後は復帰しない
        track.hit(9, None, BTreeMap::new());
        assert!(!track.is_live());
        assert!(!track.miss(1));
    }
}

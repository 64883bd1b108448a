//! 関節ツリー（スケルトンモデル）
//!
//! 関節はアリーナ（`Vec<Joint>`）に格納し、親子関係はアリーナ上の
//! インデックスで持つ。外部とのやり取りには検出器が出力する関節IDを使う。

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::SkeletonError;

/// 設定ファイル・組み込み定義から読む関節定義（子は関節IDで指定）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointDef {
    pub name: String,
    pub id: usize,
    #[serde(default)]
    pub children: Vec<usize>,
}

impl JointDef {
    pub fn new(name: &str, id: usize, children: &[usize]) -> Self {
        Self {
            name: name.to_string(),
            id,
            children: children.to_vec(),
        }
    }
}

/// アリーナ上の関節
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joint {
    pub name: String,
    pub id: usize,
    /// 親関節のアリーナインデックス（ルートはNone）
    pub parent: Option<usize>,
    /// 子関節のアリーナインデックス
    pub children: Vec<usize>,
}

/// 書き出し用の入れ子表現
#[derive(Debug, Clone, Serialize)]
pub struct HierarchyNode {
    pub name: String,
    pub id: usize,
    pub children: Vec<HierarchyNode>,
}

#[derive(Debug, Clone)]
pub struct Skeleton {
    name: String,
    joints: Vec<Joint>,
    root: usize,
    index_by_id: HashMap<usize, usize>,
}

// HALPE_26: Hip → RHip → RKnee → RAnkle → RBigToe → RSmallToe が最深（6段）
// 目・耳は下流の筋骨格モデルで使わないためツリーに含めない
const HALPE_26: &[(&str, usize, &[usize])] = &[
    ("Hip", 19, &[12, 11, 18]),
    ("RHip", 12, &[14]),
    ("RKnee", 14, &[16]),
    ("RAnkle", 16, &[21, 25]),
    ("RBigToe", 21, &[23]),
    ("RSmallToe", 23, &[]),
    ("RHeel", 25, &[]),
    ("LHip", 11, &[13]),
    ("LKnee", 13, &[15]),
    ("LAnkle", 15, &[20, 24]),
    ("LBigToe", 20, &[22]),
    ("LSmallToe", 22, &[]),
    ("LHeel", 24, &[]),
    ("Neck", 18, &[17, 6, 5]),
    ("Head", 17, &[0]),
    ("Nose", 0, &[]),
    ("RShoulder", 6, &[8]),
    ("RElbow", 8, &[10]),
    ("RWrist", 10, &[]),
    ("LShoulder", 5, &[7]),
    ("LElbow", 7, &[9]),
    ("LWrist", 9, &[]),
];

// OpenPose BODY_25
const BODY_25: &[(&str, usize, &[usize])] = &[
    ("CHip", 8, &[9, 12, 1]),
    ("RHip", 9, &[10]),
    ("RKnee", 10, &[11]),
    ("RAnkle", 11, &[22, 24]),
    ("RBigToe", 22, &[23]),
    ("RSmallToe", 23, &[]),
    ("RHeel", 24, &[]),
    ("LHip", 12, &[13]),
    ("LKnee", 13, &[14]),
    ("LAnkle", 14, &[19, 21]),
    ("LBigToe", 19, &[20]),
    ("LSmallToe", 20, &[]),
    ("LHeel", 21, &[]),
    ("Neck", 1, &[0, 2, 5]),
    ("Nose", 0, &[]),
    ("RShoulder", 2, &[3]),
    ("RElbow", 3, &[4]),
    ("RWrist", 4, &[]),
    ("LShoulder", 5, &[6]),
    ("LElbow", 6, &[7]),
    ("LWrist", 7, &[]),
];

fn table_to_defs(table: &[(&str, usize, &[usize])]) -> Vec<JointDef> {
    table
        .iter()
        .map(|(name, id, children)| JointDef::new(name, *id, children))
        .collect()
}

impl Skeleton {
    /// 関節定義からスケルトンを構築し、木構造であることを検証する
    pub fn from_defs(name: &str, defs: &[JointDef]) -> Result<Self, SkeletonError> {
        if defs.is_empty() {
            return Err(SkeletonError::Empty);
        }

        let mut index_by_id = HashMap::with_capacity(defs.len());
        let mut names = HashSet::with_capacity(defs.len());
        for (i, def) in defs.iter().enumerate() {
            if index_by_id.insert(def.id, i).is_some() {
                return Err(SkeletonError::DuplicateId(def.id));
            }
            if !names.insert(def.name.as_str()) {
                return Err(SkeletonError::DuplicateName(def.name.clone()));
            }
        }

        let mut parent: Vec<Option<usize>> = vec![None; defs.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); defs.len()];
        for (i, def) in defs.iter().enumerate() {
            for &child_id in &def.children {
                let j = *index_by_id
                    .get(&child_id)
                    .ok_or_else(|| SkeletonError::UnknownChild {
                        parent: def.name.clone(),
                        child: child_id,
                    })?;
                if j == i {
                    return Err(SkeletonError::Cycle(def.name.clone()));
                }
                if parent[j].is_some() {
                    return Err(SkeletonError::MultipleParents(defs[j].name.clone()));
                }
                parent[j] = Some(i);
                children[i].push(j);
            }
        }

        let roots: Vec<usize> = (0..defs.len()).filter(|&i| parent[i].is_none()).collect();
        let root = match roots.as_slice() {
            // 全関節に親がある = どこかが循環している
            [] => return Err(SkeletonError::Cycle(defs[0].name.clone())),
            [r] => *r,
            _ => {
                return Err(SkeletonError::MultipleRoots(
                    roots.iter().map(|&r| defs[r].name.clone()).collect(),
                ))
            }
        };

        // ルートから到達できない関節は親を辿るとループする
        let mut visited = vec![false; defs.len()];
        let mut stack = vec![root];
        while let Some(i) = stack.pop() {
            visited[i] = true;
            stack.extend(children[i].iter().copied().filter(|&c| !visited[c]));
        }
        if let Some(i) = visited.iter().position(|v| !v) {
            return Err(SkeletonError::Cycle(defs[i].name.clone()));
        }

        let joints = defs
            .iter()
            .enumerate()
            .map(|(i, def)| Joint {
                name: def.name.clone(),
                id: def.id,
                parent: parent[i],
                children: std::mem::take(&mut children[i]),
            })
            .collect();

        Ok(Self {
            name: name.to_string(),
            joints,
            root,
            index_by_id,
        })
    }

    pub fn halpe26() -> Self {
        Self::from_defs("HALPE_26", &table_to_defs(HALPE_26)).expect("builtin HALPE_26 is a tree")
    }

    pub fn body25() -> Self {
        Self::from_defs("BODY_25", &table_to_defs(BODY_25)).expect("builtin BODY_25 is a tree")
    }

    /// モデル名から組み込みスケルトンを選ぶ。`CUSTOM` の場合は `custom` を使う
    pub fn from_model(model: &str, custom: &[JointDef]) -> Result<Self, SkeletonError> {
        match model.to_ascii_uppercase().as_str() {
            "HALPE_26" | "HALPE26" => Self::from_defs("HALPE_26", &table_to_defs(HALPE_26)),
            "BODY_25" | "BODY25" => Self::from_defs("BODY_25", &table_to_defs(BODY_25)),
            "CUSTOM" => Self::from_defs("CUSTOM", custom),
            _ => Err(SkeletonError::UnknownModel(model.to_string())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    pub fn root(&self) -> &Joint {
        &self.joints[self.root]
    }

    pub fn joints(&self) -> impl Iterator<Item = &Joint> {
        self.joints.iter()
    }

    pub fn joint_by_id(&self, id: usize) -> Option<&Joint> {
        self.index_by_id.get(&id).map(|&i| &self.joints[i])
    }

    pub fn joint_by_name(&self, name: &str) -> Option<&Joint> {
        self.joints.iter().find(|j| j.name == name)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.index_by_id.contains_key(&id)
    }

    /// ルートから深さ優先（先行順）で並べた関節ID
    pub fn ids(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.joints.len());
        let mut stack = vec![self.root];
        while let Some(i) = stack.pop() {
            out.push(self.joints[i].id);
            // 定義順に出力するため逆順に積む
            stack.extend(self.joints[i].children.iter().rev().copied());
        }
        out
    }

    pub fn parent_of(&self, id: usize) -> Option<&Joint> {
        let j = self.joint_by_id(id)?;
        j.parent.map(|p| &self.joints[p])
    }

    pub fn children_of(&self, id: usize) -> Vec<&Joint> {
        self.joint_by_id(id)
            .map(|j| j.children.iter().map(|&c| &self.joints[c]).collect())
            .unwrap_or_default()
    }

    /// 関節からルートまでのIDの列（自身を含む）
    pub fn chain_to_root(&self, id: usize) -> Vec<usize> {
        let mut chain = Vec::new();
        let mut current = self.index_by_id.get(&id).copied();
        while let Some(i) = current {
            chain.push(self.joints[i].id);
            current = self.joints[i].parent;
        }
        chain
    }

    /// ツリーの段数（ルートのみなら1）
    pub fn depth(&self) -> usize {
        let mut max_depth = 0;
        let mut stack = vec![(self.root, 1usize)];
        while let Some((i, d)) = stack.pop() {
            max_depth = max_depth.max(d);
            stack.extend(self.joints[i].children.iter().map(|&c| (c, d + 1)));
        }
        max_depth
    }

    /// 左右対称な関節ペア（左ID, 右ID）
    ///
    /// 名前が "L"/"R" で始まり残りが一致するものをペアとみなす（LAnkle/RAnkle）。
    pub fn symmetric_pairs(&self) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for joint in &self.joints {
            let Some(rest) = joint.name.strip_prefix('L') else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            let right_name = format!("R{}", rest);
            if let Some(right) = self.joint_by_name(&right_name) {
                pairs.push((joint.id, right.id));
            }
        }
        pairs.sort_unstable();
        pairs
    }

    /// 元の定義形式に戻す（設定ファイルへの書き戻し用）
    pub fn to_defs(&self) -> Vec<JointDef> {
        self.joints
            .iter()
            .map(|j| JointDef {
                name: j.name.clone(),
                id: j.id,
                children: j.children.iter().map(|&c| self.joints[c].id).collect(),
            })
            .collect()
    }

    pub fn hierarchy(&self) -> HierarchyNode {
        self.node(self.root)
    }

    fn node(&self, i: usize) -> HierarchyNode {
        let j = &self.joints[i];
        HierarchyNode {
            name: j.name.clone(),
            id: j.id,
            children: j.children.iter().map(|&c| self.node(c)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halpe26_structure() {
        let sk = Skeleton::halpe26();
        assert_eq!(sk.len(), 22);
        assert_eq!(sk.root().name, "Hip");
        assert_eq!(sk.depth(), 6);
        assert_eq!(sk.joint_by_name("RAnkle").map(|j| j.id), Some(16));
        assert_eq!(sk.parent_of(16).map(|j| j.name.as_str()), Some("RKnee"));
    }

    #[test]
    fn test_body25_structure() {
        let sk = Skeleton::body25();
        assert_eq!(sk.root().id, 8);
        assert_eq!(sk.chain_to_root(23), vec![23, 22, 11, 10, 9, 8]);
    }

    #[test]
    fn test_ids_unique_and_preorder() {
        let sk = Skeleton::halpe26();
        let ids = sk.ids();
        assert_eq!(ids[0], 19);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(ids.len(), sk.len());
    }

    #[test]
    fn test_symmetric_pairs() {
        let sk = Skeleton::halpe26();
        let pairs = sk.symmetric_pairs();
        assert!(pairs.contains(&(15, 16))); // LAnkle, RAnkle
        assert!(pairs.contains(&(11, 12))); // LHip, RHip
        assert_eq!(pairs.len(), 9);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let defs = vec![
            JointDef::new("Root", 0, &[1]),
            JointDef::new("A", 1, &[]),
            JointDef::new("B", 1, &[]),
        ];
        assert_eq!(
            Skeleton::from_defs("x", &defs).unwrap_err(),
            SkeletonError::DuplicateId(1)
        );
    }

    #[test]
    fn test_cycle_rejected() {
        // Root → A → B → A
        let defs = vec![
            JointDef::new("Root", 0, &[1]),
            JointDef::new("A", 1, &[2]),
            JointDef::new("B", 2, &[1]),
        ];
        assert!(matches!(
            Skeleton::from_defs("x", &defs),
            Err(SkeletonError::MultipleParents(_)) | Err(SkeletonError::Cycle(_))
        ));

        // 親なしが存在しない完全な循環
        let defs = vec![JointDef::new("A", 1, &[2]), JointDef::new("B", 2, &[1])];
        assert!(matches!(
            Skeleton::from_defs("x", &defs),
            Err(SkeletonError::Cycle(_))
        ));

        // ルートとは別に閉じた循環がある
        let defs = vec![
            JointDef::new("Root", 0, &[]),
            JointDef::new("A", 1, &[2]),
            JointDef::new("B", 2, &[1]),
        ];
        assert!(matches!(
            Skeleton::from_defs("x", &defs),
            Err(SkeletonError::Cycle(_))
        ));
    }

    #[test]
    fn test_self_child_rejected() {
        let defs = vec![JointDef::new("Root", 0, &[0])];
        assert_eq!(
            Skeleton::from_defs("x", &defs).unwrap_err(),
            SkeletonError::Cycle("Root".to_string())
        );
    }

    #[test]
    fn test_multiple_roots_and_unknown_child() {
        let defs = vec![JointDef::new("A", 0, &[]), JointDef::new("B", 1, &[])];
        assert!(matches!(
            Skeleton::from_defs("x", &defs),
            Err(SkeletonError::MultipleRoots(_))
        ));

        let defs = vec![JointDef::new("A", 0, &[7])];
        assert!(matches!(
            Skeleton::from_defs("x", &defs),
            Err(SkeletonError::UnknownChild { child: 7, .. })
        ));
    }

    #[test]
    fn test_to_defs_roundtrip_preserves_tree() {
        let sk = Skeleton::body25();
        let rebuilt = Skeleton::from_defs("copy", &sk.to_defs()).unwrap();
        assert_eq!(rebuilt.ids(), sk.ids());
        assert_eq!(rebuilt.hierarchy().children.len(), 3);
    }

    #[test]
    fn test_unknown_model() {
        assert_eq!(
            Skeleton::from_model("COCO_133", &[]).unwrap_err(),
            SkeletonError::UnknownModel("COCO_133".to_string())
        );
        assert_eq!(Skeleton::from_model("halpe_26", &[]).unwrap().len(), 22);
    }
}

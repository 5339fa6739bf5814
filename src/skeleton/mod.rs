//! 骨骼层级
//!
//! `BoneSet` 持有扁平的骨骼数组，按父子深度排好更新顺序；
//! 每个 `BoneLink` 记录静止姿态、本帧动画值和求得的世界矩阵。
//! IK 链在层级变换之后由 `IkSolver` 逐条求解。

mod bone_link;
mod bone_set;
mod ik_solver;

pub use bone_link::{AxisLimit, BoneDesc, BoneFlags, BoneKind, BoneLink, BoneType};
pub use bone_set::BoneSet;
pub use ik_solver::{IkDesc, IkOutcome, IkSettings, IkSolver};

use glam::{Mat4, Quat, Vec3};

/// 刚体姿态（位置 + 旋转）
///
/// 骨骼没有缩放通道，从世界矩阵分解时丢弃缩放分量。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoneTransform {
    pub translation: Vec3,
    pub rotation: Quat,
}

impl Default for BoneTransform {
    fn default() -> Self {
        Self { translation: Vec3::ZERO, rotation: Quat::IDENTITY }
    }
}

impl BoneTransform {
    #[inline]
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.translation)
    }

    #[inline]
    pub fn from_matrix(m: Mat4) -> Self {
        let (_, rotation, translation) = m.to_scale_rotation_translation();
        Self { translation, rotation: rotation.normalize() }
    }
}

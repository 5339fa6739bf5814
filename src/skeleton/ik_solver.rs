//! IK 求解器
//!
//! 设计原则：
//! - CCD 迭代求解，迭代次数固定，不使用时间限制
//! - 每步旋转角度受 `max_angle` 限制
//! - 单轴骨骼（膝盖等）每次增量后重新投影到允许轴上
//! - 所有向量运算都有 epsilon 保护，退化输入只会导致"不动"

use glam::{Quat, Vec3};

use super::bone_link::BoneLink;
use super::bone_set::update_subtree;

// ============================================================================
// 加载描述与设置
// ============================================================================

/// 加载器提供的扁平 IK 链描述
#[derive(Clone, Debug)]
pub struct IkDesc {
    /// 目的地骨骼（IK 骨骼本身，要到达的位置）
    pub destination: usize,
    /// 目标骨骼（被驱动去接近目的地的末端）
    pub target: usize,
    /// 链骨骼，离目标骨骼最近的在前
    pub chain: Vec<usize>,
    /// 迭代次数
    pub iterations: u32,
    /// 单步最大旋转角度 (弧度)
    pub max_angle: f32,
}

/// IK 数值阈值
#[derive(Clone, Copy, Debug)]
pub struct IkSettings {
    /// 收敛距离
    pub distance_epsilon: f32,
    /// 向量长度阈值
    pub vector_epsilon: f32,
    /// 最小旋转角度
    pub angle_epsilon: f32,
}

impl Default for IkSettings {
    fn default() -> Self {
        Self {
            distance_epsilon: 1.0e-4,
            vector_epsilon: 1.0e-6,
            angle_epsilon: 1.0e-6,
        }
    }
}

/// 单次求解结果
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IkOutcome {
    /// 尚未求解
    Idle,
    /// 已关闭
    Disabled,
    /// 目标或链骨骼由物理驱动，跳过
    Skipped,
    /// 在第 `iterations` 次迭代前收敛
    Converged { iterations: u32 },
    /// 用完迭代次数，保留最佳姿态
    Exhausted { iterations: u32, distance: f32 },
}

// ============================================================================
// IK 求解器
// ============================================================================

/// IK 求解器
#[derive(Clone, Debug)]
pub struct IkSolver {
    pub destination: usize,
    pub target: usize,
    pub chain: Vec<usize>,
    pub iterations: u32,
    pub max_angle: f32,
    /// 是否启用
    pub enabled: bool,
    pub settings: IkSettings,
}

impl IkSolver {
    /// 创建新的 IK 求解器
    pub fn new(desc: &IkDesc, settings: IkSettings) -> Self {
        Self {
            destination: desc.destination,
            target: desc.target,
            chain: desc.chain.clone(),
            iterations: desc.iterations,
            max_angle: desc.max_angle.abs(),
            enabled: true,
            settings,
        }
    }

    /// 求解 IK
    pub fn solve(&self, bones: &mut [BoneLink], children: &[Vec<usize>]) -> IkOutcome {
        if !self.enabled {
            return IkOutcome::Disabled;
        }
        if bones[self.target].is_simulated() || self.chain.iter().any(|&i| bones[i].is_simulated()) {
            return IkOutcome::Skipped;
        }

        // 初始化 IK 链骨骼
        for &link in &self.chain {
            bones[link].ik_rotate = Quat::IDENTITY;
            bones[link].set_enable_ik(true);
            bones[link].compute_local_transform();
            update_subtree(bones, children, link);
        }

        let mut best_distance = f32::MAX;
        let mut best_rotations: Vec<Quat> = vec![Quat::IDENTITY; self.chain.len()];

        for iteration in 0..self.iterations {
            let distance = self.distance(bones);
            if distance < best_distance {
                best_distance = distance;
                self.store_rotations(bones, &mut best_rotations);
            }
            if distance < self.settings.distance_epsilon {
                return IkOutcome::Converged { iterations: iteration };
            }
            self.solve_iteration(bones, children);
        }

        let mut distance = self.distance(bones);
        if distance > best_distance {
            // 恢复最佳结果
            for (&link, &rotation) in self.chain.iter().zip(&best_rotations) {
                bones[link].ik_rotate = rotation;
                bones[link].compute_local_transform();
                update_subtree(bones, children, link);
            }
            distance = best_distance;
        }

        if distance < self.settings.distance_epsilon {
            IkOutcome::Converged { iterations: self.iterations }
        } else {
            IkOutcome::Exhausted { iterations: self.iterations, distance }
        }
    }

    /// 单次迭代：按链顺序（离目标最近的在前）旋转每根骨骼
    fn solve_iteration(&self, bones: &mut [BoneLink], children: &[Vec<usize>]) {
        let eps = self.settings.vector_epsilon;

        for &link in &self.chain {
            let destination_pos = bones[self.destination].position();
            let target_pos = bones[self.target].position();

            let inv_link = bones[link].local_to_world.inverse();
            let local_destination = inv_link.transform_point3(destination_pos);
            let local_target = inv_link.transform_point3(target_pos);

            if local_destination.length() < eps || local_target.length() < eps {
                continue;
            }
            let destination_vec = local_destination.normalize();
            let target_vec = local_target.normalize();

            let axis = target_vec.cross(destination_vec);
            if axis.length() < eps {
                continue;
            }
            let axis = axis.normalize();

            let angle = target_vec
                .dot(destination_vec)
                .clamp(-1.0, 1.0)
                .acos()
                .min(self.max_angle);
            if angle < self.settings.angle_epsilon {
                continue;
            }

            let bone = &mut bones[link];
            let base = bone.animation_rotate * bone.append_rotate;
            let mut chain_rot = bone.ik_rotate * base * Quat::from_axis_angle(axis, angle);
            if let Some(limit) = bone.angle_limit() {
                chain_rot = limit.constrain(chain_rot);
            }

            bone.ik_rotate = (chain_rot * base.inverse()).normalize();
            bone.compute_local_transform();
            update_subtree(bones, children, link);
        }
    }

    #[inline]
    fn distance(&self, bones: &[BoneLink]) -> f32 {
        let d: Vec3 = bones[self.destination].position() - bones[self.target].position();
        d.length()
    }

    fn store_rotations(&self, bones: &[BoneLink], out: &mut [Quat]) {
        for (slot, &link) in out.iter_mut().zip(&self.chain) {
            *slot = bones[link].ik_rotate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::{AxisLimit, BoneDesc, BoneSet};

    /// 根 → 上臂 → 下臂 → 末端，外加一个独立的 IK 目的地骨骼
    fn two_bone_arm(destination: Vec3, iterations: u32, max_angle: f32) -> BoneSet {
        let descs = vec![
            BoneDesc::new("root", None, Vec3::ZERO),
            BoneDesc::new("upper", Some(0), Vec3::ZERO),
            BoneDesc::new("lower", Some(1), Vec3::new(0.0, 1.0, 0.0)),
            BoneDesc::new("tip", Some(2), Vec3::new(0.0, 2.0, 0.0)),
            BoneDesc::new("ik", Some(0), destination),
        ];
        let iks = vec![IkDesc {
            destination: 4,
            target: 3,
            chain: vec![2, 1],
            iterations,
            max_angle,
        }];
        BoneSet::build(&descs, &iks).expect("valid skeleton")
    }

    fn tip_distance(bones: &BoneSet) -> f32 {
        let tip = bones.get_bone(3).unwrap().position();
        let ik = bones.get_bone(4).unwrap().position();
        (tip - ik).length()
    }

    #[test]
    fn test_reachable_destination_converges() {
        let mut bones = two_bone_arm(Vec3::new(1.2, 0.8, 0.0), 100, 1.0);
        bones.solver_settings_mut(0).unwrap().distance_epsilon = 1.0e-3;
        bones.begin_update();
        bones.update_transforms();

        let outcome = bones.solve_ik()[0];
        assert!(matches!(outcome, IkOutcome::Converged { .. }), "{:?}", outcome);
        assert!(tip_distance(&bones) < 1.0e-3);
    }

    #[test]
    fn test_unreachable_destination_uses_whole_budget() {
        let mut bones = two_bone_arm(Vec3::new(0.0, 5.0, 0.0), 25, 0.5);
        bones.begin_update();
        bones.update_transforms();

        match bones.solve_ik()[0] {
            IkOutcome::Exhausted { iterations, distance } => {
                assert_eq!(iterations, 25);
                assert!(distance.is_finite());
                assert!((distance - 3.0).abs() < 1e-4);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        for bone in bones.bones() {
            assert!(bone.local_to_world.is_finite());
        }
    }

    #[test]
    fn test_unreachable_bent_chain_stays_finite() {
        let mut bones = two_bone_arm(Vec3::new(4.0, 3.0, 0.0), 30, 0.3);
        bones.begin_update();
        bones.set_bone_animation(2, Vec3::ZERO, Quat::from_rotation_z(1.0));
        bones.update_transforms();

        match bones.solve_ik()[0] {
            IkOutcome::Exhausted { iterations, distance } => {
                assert_eq!(iterations, 30);
                // 完全伸直时距离为 5 - 2
                assert!(distance >= 3.0 - 1e-3);
                assert!(distance.is_finite());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_coincident_points_degrade_to_no_movement() {
        let descs = vec![
            BoneDesc::new("root", None, Vec3::ZERO),
            BoneDesc::new("a", Some(0), Vec3::ZERO),
            BoneDesc::new("tip", Some(1), Vec3::ZERO),
            BoneDesc::new("ik", Some(0), Vec3::new(0.0, 1.0, 0.0)),
        ];
        let iks = vec![IkDesc { destination: 3, target: 2, chain: vec![1], iterations: 10, max_angle: 1.0 }];
        let mut bones = BoneSet::build(&descs, &iks).unwrap();
        bones.begin_update();
        bones.update_transforms();

        let outcome = bones.solve_ik()[0];
        assert!(matches!(outcome, IkOutcome::Exhausted { iterations: 10, .. }));
        assert_eq!(bones.get_bone(1).unwrap().ik_rotate, Quat::IDENTITY);
    }

    #[test]
    fn test_empty_chain_is_harmless() {
        let descs = vec![
            BoneDesc::new("root", None, Vec3::ZERO),
            BoneDesc::new("tip", Some(0), Vec3::Y),
            BoneDesc::new("ik", Some(0), Vec3::X),
        ];
        let iks = vec![IkDesc { destination: 2, target: 1, chain: vec![], iterations: 5, max_angle: 1.0 }];
        let mut bones = BoneSet::build(&descs, &iks).unwrap();
        bones.begin_update();
        bones.update_transforms();
        assert!(matches!(bones.solve_ik()[0], IkOutcome::Exhausted { iterations: 5, .. }));
    }

    #[test]
    fn test_simulated_target_skips_solve() {
        let mut bones = two_bone_arm(Vec3::new(1.0, 1.0, 0.0), 20, 1.0);
        bones.begin_update();
        bones.update_transforms();
        bones.set_simulated(3, true);

        assert_eq!(bones.solve_ik()[0], IkOutcome::Skipped);
        assert_eq!(bones.get_bone(2).unwrap().ik_rotate, Quat::IDENTITY);
    }

    #[test]
    fn test_knee_stays_on_its_axis() {
        let mut descs = vec![
            BoneDesc::new("root", None, Vec3::ZERO),
            BoneDesc::new("leg", Some(0), Vec3::new(0.0, 2.0, 0.0)),
            BoneDesc::new("knee", Some(1), Vec3::new(0.0, 1.0, 0.0)),
            BoneDesc::new("ankle", Some(2), Vec3::ZERO),
            BoneDesc::new("leg_ik", Some(0), Vec3::new(0.3, 0.4, 0.5)),
        ];
        descs[2].angle_limit = Some(AxisLimit::knee());
        let iks = vec![IkDesc { destination: 4, target: 3, chain: vec![2, 1], iterations: 40, max_angle: 0.5 }];
        let mut bones = BoneSet::build(&descs, &iks).unwrap();
        bones.begin_update();
        bones.update_transforms();
        bones.solve_ik();

        let knee = bones.get_bone(2).unwrap();
        let local = knee.local_rotation();
        assert!(local.y.abs() < 1e-5 && local.z.abs() < 1e-5);
        assert!(AxisLimit::knee().signed_angle(local) >= AxisLimit::knee().lower - 1e-5);
    }
}

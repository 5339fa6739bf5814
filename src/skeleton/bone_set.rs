//! 骨骼集合
//!
//! 管理整个骨骼层次结构：加载时校验与缓存，每帧按深度顺序更新变换、
//! 驱动 IK、处理扭转/连动骨骼以及接收物理结果。

use std::collections::HashMap;

use glam::{Mat4, Quat, Vec3};

use super::bone_link::{BoneDesc, BoneKind, BoneLink, BoneType};
use super::ik_solver::{IkDesc, IkOutcome, IkSettings, IkSolver};
use super::BoneTransform;
use crate::{MmdError, Result};

/// 中心骨骼的常见名称
const CENTER_BONE_NAMES: [&str; 2] = ["センター", "center"];

/// 骨骼集合
#[derive(Clone, Debug)]
pub struct BoneSet {
    bones: Vec<BoneLink>,
    name_to_index: HashMap<String, usize>,
    /// 按深度排序的索引（父骨骼总在子骨骼之前）
    sorted_indices: Vec<usize>,
    /// 子骨骼缓存
    children: Vec<Vec<usize>>,
    ik_solvers: Vec<IkSolver>,
    ik_outcomes: Vec<IkOutcome>,
    center_bone: Option<usize>,
}

impl BoneSet {
    /// 由扁平描述构建骨骼集合
    pub fn build(descs: &[BoneDesc], iks: &[IkDesc]) -> Result<Self> {
        Self::build_with_settings(descs, iks, IkSettings::default())
    }

    pub fn build_with_settings(descs: &[BoneDesc], iks: &[IkDesc], settings: IkSettings) -> Result<Self> {
        let count = descs.len();

        // 名称唯一
        let mut name_to_index = HashMap::with_capacity(count);
        for (i, desc) in descs.iter().enumerate() {
            if name_to_index.insert(desc.name.clone(), i).is_some() {
                return Err(MmdError::DuplicateBoneName(desc.name.clone()));
            }
        }

        // 父骨骼引用
        for (i, desc) in descs.iter().enumerate() {
            if let Some(parent) = desc.parent {
                if parent >= count || parent == i {
                    return Err(MmdError::DanglingParent { bone: desc.name.clone(), parent });
                }
            }
        }

        let depths = compute_depths(descs)?;

        let mut bones = Vec::with_capacity(count);
        for (i, desc) in descs.iter().enumerate() {
            let kind = resolve_kind(i, desc, count)?;
            let mut bone = BoneLink::from_desc(desc, kind);
            bone.internal_id = i;
            bone.depth = depths[i];
            bone.body_shift = match desc.parent {
                Some(parent) => desc.position - descs[parent].position,
                None => desc.position,
            };
            bones.push(bone);
        }

        let ik_solvers = iks
            .iter()
            .enumerate()
            .map(|(index, ik)| validate_ik(index, ik, count).map(|_| IkSolver::new(ik, settings)))
            .collect::<Result<Vec<_>>>()?;

        // 稳定排序：同深度保持原始顺序
        let mut sorted_indices: Vec<usize> = (0..count).collect();
        sorted_indices.sort_by_key(|&i| depths[i]);

        let mut children = vec![Vec::new(); count];
        for &i in &sorted_indices {
            if let Some(parent) = descs[i].parent {
                children[parent].push(i);
            }
        }

        let center_bone = CENTER_BONE_NAMES
            .iter()
            .find_map(|name| name_to_index.get(*name).copied())
            .or_else(|| bones.iter().position(|b| b.kind == BoneKind::MotionIndependent))
            .or_else(|| bones.iter().position(|b| b.is_root()));

        let ik_outcomes = vec![IkOutcome::Idle; ik_solvers.len()];
        let mut set = Self {
            bones,
            name_to_index,
            sorted_indices,
            children,
            ik_solvers,
            ik_outcomes,
            center_bone,
        };
        set.reset_pose();

        log::info!(
            "骨骼集合构建完成: {} 个骨骼, {} 条 IK 链",
            set.bones.len(),
            set.ik_solvers.len()
        );
        Ok(set)
    }

    // ========================================
    // 查询
    // ========================================

    #[inline]
    pub fn bone_count(&self) -> usize {
        self.bones.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    #[inline]
    pub fn bones(&self) -> &[BoneLink] {
        &self.bones
    }

    #[inline]
    pub fn get_bone(&self, index: usize) -> Option<&BoneLink> {
        self.bones.get(index)
    }

    #[inline]
    pub fn get_bone_mut(&mut self, index: usize) -> Option<&mut BoneLink> {
        self.bones.get_mut(index)
    }

    pub fn find_bone_by_name(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// 按深度排序的更新顺序
    #[inline]
    pub fn sorted_indices(&self) -> &[usize] {
        &self.sorted_indices
    }

    #[inline]
    pub fn children_of(&self, index: usize) -> &[usize] {
        self.children.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 中心骨骼（重定位偏移作用的骨骼）
    #[inline]
    pub fn center_bone(&self) -> Option<usize> {
        self.center_bone
    }

    pub fn set_center_bone(&mut self, index: Option<usize>) {
        self.center_bone = index.filter(|&i| i < self.bones.len());
    }

    /// 骨骼的世界变换
    pub fn world_transform(&self, index: usize) -> Option<BoneTransform> {
        self.bones.get(index).map(|b| BoneTransform::from_matrix(b.local_to_world))
    }

    #[inline]
    pub fn world_matrix(&self, index: usize) -> Option<Mat4> {
        self.bones.get(index).map(|b| b.local_to_world)
    }

    /// 所有骨骼的世界矩阵（按原始索引）
    pub fn global_transforms(&self) -> Vec<Mat4> {
        self.bones.iter().map(|b| b.local_to_world).collect()
    }

    /// 蒙皮矩阵：世界矩阵 * 初始位置的逆平移
    pub fn skinning_matrices(&self) -> Vec<Mat4> {
        self.bones
            .iter()
            .map(|b| b.local_to_world * Mat4::from_translation(-b.initial_position))
            .collect()
    }

    // ========================================
    // 动画输入
    // ========================================

    /// 每帧开始：清除 IK/附加旋转和物理标志
    ///
    /// 动画值保留到被新的动画结果覆盖，动作快照需要读取上一帧的值。
    pub fn begin_update(&mut self) {
        for bone in &mut self.bones {
            bone.ik_rotate = Quat::IDENTITY;
            bone.append_rotate = Quat::IDENTITY;
            bone.set_simulated(false);
            bone.set_enable_ik(false);
        }
    }

    /// 回到初始姿态
    pub fn reset_pose(&mut self) {
        for bone in &mut self.bones {
            bone.reset_animation();
            bone.set_simulated(false);
            bone.set_enable_ik(false);
        }
        self.update_transforms();
    }

    pub fn set_bone_animation(&mut self, index: usize, translation: Vec3, rotation: Quat) {
        if let Some(bone) = self.bones.get_mut(index) {
            bone.set_animation(translation, rotation);
        }
    }

    pub fn bone_animation(&self, index: usize) -> Option<(Vec3, Quat)> {
        self.bones.get(index).map(|b| (b.animation_translate, b.animation_rotate))
    }

    /// 所有骨骼的当前动画值（用于快照）
    pub fn animation_values(&self) -> Vec<(Vec3, Quat)> {
        self.bones.iter().map(|b| (b.animation_translate, b.animation_rotate)).collect()
    }

    // ========================================
    // 变换更新
    // ========================================

    /// 按深度顺序重新计算所有骨骼的本地与世界变换
    pub fn update_transforms(&mut self) {
        for &i in &self.sorted_indices {
            self.bones[i].compute_local_transform();
            let parent_world = self.bones[i].parent_index.map(|p| self.bones[p].local_to_world);
            self.bones[i].compose_world(parent_world);
        }
    }

    /// 依次求解所有 IK 链，返回每条链的结果
    pub fn solve_ik(&mut self) -> &[IkOutcome] {
        for (solver, outcome) in self.ik_solvers.iter().zip(self.ik_outcomes.iter_mut()) {
            *outcome = solver.solve(&mut self.bones, &self.children);
        }
        &self.ik_outcomes
    }

    /// 扭转/连动骨骼：按深度顺序叠加目标骨骼旋转，然后刷新世界变换
    ///
    /// 负系数使用目标旋转的逆。
    pub fn apply_follow_rotations(&mut self) {
        let mut touched = false;
        for &i in &self.sorted_indices {
            if let BoneKind::TwistFollow { target, coefficient } = self.bones[i].kind {
                let source = self.bones[target].local_rotation();
                let append = if coefficient >= 0.0 {
                    Quat::IDENTITY.slerp(source, coefficient)
                } else {
                    Quat::IDENTITY.slerp(source.inverse(), -coefficient)
                };
                self.bones[i].append_rotate = append.normalize();
                touched = true;
            }
        }
        if touched {
            self.update_transforms();
        }
    }

    // ========================================
    // IK 控制
    // ========================================

    #[inline]
    pub fn ik_solvers(&self) -> &[IkSolver] {
        &self.ik_solvers
    }

    /// 最近一次求解的结果
    #[inline]
    pub fn ik_outcomes(&self) -> &[IkOutcome] {
        &self.ik_outcomes
    }

    pub fn solver_settings_mut(&mut self, index: usize) -> Option<&mut IkSettings> {
        self.ik_solvers.get_mut(index).map(|s| &mut s.settings)
    }

    /// 按目的地骨骼开关 IK 链，返回是否找到
    pub fn set_ik_enabled(&mut self, destination: usize, enabled: bool) -> bool {
        let mut found = false;
        for solver in self.ik_solvers.iter_mut().filter(|s| s.destination == destination) {
            solver.enabled = enabled;
            found = true;
        }
        found
    }

    // ========================================
    // 物理交接
    // ========================================

    pub fn set_simulated(&mut self, index: usize, simulated: bool) {
        if let Some(bone) = self.bones.get_mut(index) {
            bone.set_simulated(simulated);
        }
    }

    /// 写入物理结果：模拟骨骼直接采用物理世界变换，
    /// 其余骨骼按深度顺序从父骨骼重新合成
    pub fn commit_simulated(&mut self, transforms: &[(usize, Mat4)]) {
        for &(index, world) in transforms {
            if let Some(bone) = self.bones.get_mut(index) {
                bone.local_to_world = world;
                bone.set_simulated(true);
            }
        }
        if transforms.is_empty() {
            return;
        }

        for &i in &self.sorted_indices {
            let parent_world = self.bones[i].parent_index.map(|p| self.bones[p].local_to_world);
            if self.bones[i].is_simulated() {
                // 记录相对父骨骼的变换，供查询使用
                if let Some(parent) = parent_world {
                    self.bones[i].local_to_parent = parent.inverse() * self.bones[i].local_to_world;
                }
            } else {
                self.bones[i].compose_world(parent_world);
            }
        }
    }
}

/// 从索引 `index` 开始更新整棵子树的世界变换
pub(crate) fn update_subtree(bones: &mut [BoneLink], children: &[Vec<usize>], index: usize) {
    let mut stack = vec![index];
    while let Some(i) = stack.pop() {
        let parent_world = bones[i].parent_index.map(|p| bones[p].local_to_world);
        bones[i].compose_world(parent_world);
        stack.extend(children[i].iter().copied());
    }
}

fn compute_depths(descs: &[BoneDesc]) -> Result<Vec<usize>> {
    let count = descs.len();
    let mut depths = vec![0usize; count];
    for (i, desc) in descs.iter().enumerate() {
        let mut depth = 0;
        let mut current = desc.parent;
        while let Some(parent) = current {
            depth += 1;
            if depth > count {
                return Err(MmdError::ParentCycle { bone: desc.name.clone() });
            }
            current = descs[parent].parent;
        }
        depths[i] = depth;
    }
    Ok(depths)
}

/// 确定骨骼种类：扭转/连动 > 单轴限制 > 运动独立 > 普通
fn resolve_kind(index: usize, desc: &BoneDesc, count: usize) -> Result<BoneKind> {
    if let Some(target) = desc.target {
        if target >= count {
            return Err(MmdError::DanglingTarget { bone: desc.name.clone(), target: Some(target) });
        }
    }

    if desc.bone_type.follows_target() {
        let target = match desc.target {
            Some(t) if t != index => t,
            other => return Err(MmdError::DanglingTarget { bone: desc.name.clone(), target: other }),
        };
        let coefficient = if desc.bone_type == BoneType::UnderRotate { 1.0 } else { desc.rotation_coefficient };
        return Ok(BoneKind::TwistFollow { target, coefficient });
    }

    if let Some(limit) = desc.angle_limit {
        return Ok(BoneKind::AngleLimited(limit));
    }
    if desc.motion_independent {
        return Ok(BoneKind::MotionIndependent);
    }
    Ok(BoneKind::Plain)
}

fn validate_ik(index: usize, ik: &IkDesc, count: usize) -> Result<()> {
    let malformed = |reason: String| MmdError::MalformedIk { index, reason };

    if ik.destination >= count {
        return Err(malformed(format!("destination #{} out of range", ik.destination)));
    }
    if ik.target >= count {
        return Err(malformed(format!("target #{} out of range", ik.target)));
    }
    if ik.destination == ik.target {
        return Err(malformed("destination and target are the same bone".to_string()));
    }
    for &link in &ik.chain {
        if link >= count {
            return Err(malformed(format!("chain bone #{} out of range", link)));
        }
        if link == ik.target || link == ik.destination {
            return Err(malformed(format!("chain bone #{} is the target or destination", link)));
        }
    }
    if !ik.max_angle.is_finite() {
        return Err(malformed("max angle is not finite".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(len: usize) -> Vec<BoneDesc> {
        (0..len)
            .map(|i| BoneDesc::new(format!("bone{}", i), i.checked_sub(1), Vec3::new(0.0, i as f32, 0.0)))
            .collect()
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let mut descs = chain(3);
        descs[2].name = "bone0".into();
        assert!(matches!(BoneSet::build(&descs, &[]), Err(MmdError::DuplicateBoneName(n)) if n == "bone0"));
    }

    #[test]
    fn test_dangling_parent_is_rejected() {
        let mut descs = chain(2);
        descs[1].parent = Some(7);
        assert!(matches!(BoneSet::build(&descs, &[]), Err(MmdError::DanglingParent { parent: 7, .. })));
    }

    #[test]
    fn test_parent_cycle_is_rejected() {
        let mut descs = chain(3);
        descs[0].parent = Some(2);
        assert!(matches!(BoneSet::build(&descs, &[]), Err(MmdError::ParentCycle { .. })));
    }

    #[test]
    fn test_twist_without_target_is_rejected() {
        let mut descs = chain(3);
        descs[2].bone_type = BoneType::Twist;
        assert!(matches!(BoneSet::build(&descs, &[]), Err(MmdError::DanglingTarget { target: None, .. })));

        descs[2].target = Some(40);
        assert!(matches!(BoneSet::build(&descs, &[]), Err(MmdError::DanglingTarget { target: Some(40), .. })));
    }

    #[test]
    fn test_malformed_ik_is_rejected() {
        let descs = chain(3);
        let iks = [IkDesc { destination: 0, target: 2, chain: vec![9], iterations: 4, max_angle: 1.0 }];
        assert!(matches!(BoneSet::build(&descs, &iks), Err(MmdError::MalformedIk { index: 0, .. })));
    }

    #[test]
    fn test_sorted_order_puts_parents_first() {
        // 子骨骼在描述中排在父骨骼之前
        let descs = vec![
            BoneDesc::new("child", Some(2), Vec3::new(0.0, 2.0, 0.0)),
            BoneDesc::new("root", None, Vec3::ZERO),
            BoneDesc::new("mid", Some(1), Vec3::new(0.0, 1.0, 0.0)),
        ];
        let set = BoneSet::build(&descs, &[]).unwrap();
        assert_eq!(set.sorted_indices(), &[1, 2, 0]);

        for (pos, &i) in set.sorted_indices().iter().enumerate() {
            if let Some(parent) = set.get_bone(i).unwrap().parent_index {
                let parent_pos = set.sorted_indices().iter().position(|&j| j == parent).unwrap();
                assert!(parent_pos < pos);
            }
        }
    }

    #[test]
    fn test_rest_pose_matches_initial_positions() {
        let set = BoneSet::build(&chain(4), &[]).unwrap();
        for bone in set.bones() {
            assert!((bone.position() - bone.initial_position).length() < 1e-6);
        }
    }

    #[test]
    fn test_world_transform_follows_parent_rotation() {
        let mut set = BoneSet::build(&chain(3), &[]).unwrap();
        set.begin_update();
        set.set_bone_animation(0, Vec3::ZERO, Quat::from_rotation_z(std::f32::consts::FRAC_PI_2));
        set.update_transforms();

        // 绕 Z 旋转 90°：(0, 2, 0) → (-2, 0, 0)
        let tip = set.get_bone(2).unwrap().position();
        assert!((tip - Vec3::new(-2.0, 0.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_follow_rotation_applies_coefficient() {
        let mut descs = chain(3);
        descs[2].parent = Some(0);
        descs[2].bone_type = BoneType::FollowRotate;
        descs[2].target = Some(1);
        descs[2].rotation_coefficient = 0.5;
        let mut set = BoneSet::build(&descs, &[]).unwrap();

        set.begin_update();
        set.set_bone_animation(1, Vec3::ZERO, Quat::from_rotation_y(1.0));
        set.update_transforms();
        set.apply_follow_rotations();

        let follow = set.get_bone(2).unwrap().local_rotation();
        assert!(follow.angle_between(Quat::from_rotation_y(0.5)) < 1e-5);
    }

    #[test]
    fn test_negative_coefficient_uses_inverse() {
        let mut descs = chain(3);
        descs[2].bone_type = BoneType::Twist;
        descs[2].target = Some(0);
        descs[2].rotation_coefficient = -1.0;
        let mut set = BoneSet::build(&descs, &[]).unwrap();

        set.begin_update();
        set.set_bone_animation(0, Vec3::ZERO, Quat::from_rotation_x(0.6));
        set.update_transforms();
        set.apply_follow_rotations();

        let twist = set.get_bone(2).unwrap().append_rotate;
        assert!(twist.angle_between(Quat::from_rotation_x(-0.6)) < 1e-5);
    }

    #[test]
    fn test_under_rotate_forces_full_coefficient() {
        let mut descs = chain(3);
        descs[2].bone_type = BoneType::UnderRotate;
        descs[2].target = Some(1);
        descs[2].rotation_coefficient = 0.1;
        let set = BoneSet::build(&descs, &[]).unwrap();
        assert_eq!(set.get_bone(2).unwrap().kind, BoneKind::TwistFollow { target: 1, coefficient: 1.0 });
    }

    #[test]
    fn test_commit_simulated_moves_children() {
        let mut set = BoneSet::build(&chain(3), &[]).unwrap();
        let world = Mat4::from_translation(Vec3::new(3.0, 1.0, 0.0));
        set.commit_simulated(&[(1, world)]);

        assert!(set.get_bone(1).unwrap().is_simulated());
        assert!((set.get_bone(1).unwrap().position() - Vec3::new(3.0, 1.0, 0.0)).length() < 1e-6);
        // 子骨骼跟随物理结果
        assert!((set.get_bone(2).unwrap().position() - Vec3::new(3.0, 2.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn test_center_bone_by_name() {
        let mut descs = chain(3);
        descs[1].name = "センター".into();
        let set = BoneSet::build(&descs, &[]).unwrap();
        assert_eq!(set.center_bone(), Some(1));
        assert_eq!(set.find_bone_by_name("センター"), Some(1));
    }

    #[test]
    fn test_set_ik_enabled_by_destination() {
        let descs = chain(4);
        let iks = [IkDesc { destination: 0, target: 3, chain: vec![2, 1], iterations: 4, max_angle: 1.0 }];
        let mut set = BoneSet::build(&descs, &iks).unwrap();
        assert!(set.set_ik_enabled(0, false));
        assert!(!set.set_ik_enabled(2, false));
        assert_eq!(set.solve_ik()[0], IkOutcome::Disabled);
    }
}

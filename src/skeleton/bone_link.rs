//! 骨骼节点
//!
//! BoneLink 是骨骼系统的核心单元，每个 BoneLink 代表骨骼层次中的一个节点。
//! 静态数据（名称、父子关系、初始位置、骨骼种类）加载后不变；
//! 动态数据（动画平移/旋转、IK 旋转、附加旋转、世界变换）每帧更新。

use bitflags::bitflags;
use glam::{Mat4, Quat, Vec3};
use std::f32::consts::PI;

// ============================================================================
// 骨骼类型
// ============================================================================

/// 骨骼类型（PMD 骨骼类型字节）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BoneType {
    /// 旋转
    #[default]
    Rotate,
    /// 旋转 + 移动
    RotateAndMove,
    /// IK 目的地
    IkDestination,
    /// 未知
    Unknown,
    /// IK 影响下
    UnderIk,
    /// 旋转影响下
    UnderRotate,
    /// IK 目标
    IkTarget,
    /// 不显示
    Invisible,
    /// 扭转
    Twist,
    /// 旋转连动
    FollowRotate,
}

impl BoneType {
    /// 从 PMD 骨骼类型字节解码，未知值映射为 `Unknown`
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => BoneType::Rotate,
            1 => BoneType::RotateAndMove,
            2 => BoneType::IkDestination,
            4 => BoneType::UnderIk,
            5 => BoneType::UnderRotate,
            6 => BoneType::IkTarget,
            7 => BoneType::Invisible,
            8 => BoneType::Twist,
            9 => BoneType::FollowRotate,
            _ => BoneType::Unknown,
        }
    }

    /// 是否从目标骨骼继承旋转
    #[inline]
    pub fn follows_target(self) -> bool {
        matches!(self, BoneType::UnderRotate | BoneType::Twist | BoneType::FollowRotate)
    }

    #[inline]
    pub fn is_movable(self) -> bool {
        matches!(self, BoneType::RotateAndMove | BoneType::IkDestination)
    }
}

// ============================================================================
// 单轴角度限制
// ============================================================================

/// 单轴角度限制（膝盖等）
///
/// 旋转被投影到 `axis` 上（扭转分量），绕轴角度限制在 `[lower, upper]`。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AxisLimit {
    /// 允许旋转的轴（单位向量）
    pub axis: Vec3,
    /// 角度下限 (弧度)
    pub lower: f32,
    /// 角度上限 (弧度)
    pub upper: f32,
}

impl AxisLimit {
    pub fn new(axis: Vec3, lower: f32, upper: f32) -> Self {
        let axis = axis.try_normalize().unwrap_or(Vec3::X);
        let (lower, upper) = if lower <= upper { (lower, upper) } else { (upper, lower) };
        Self { axis, lower, upper }
    }

    /// 膝盖预设：绕 X 轴，[0.5°, 180°]
    ///
    /// 下限大于 0，膝盖在 IK 中不会被伸直到反关节方向。
    pub fn knee() -> Self {
        Self::new(Vec3::X, 0.5_f32.to_radians(), PI)
    }

    /// 将旋转投影到限制轴上（只保留绕轴的扭转分量）
    pub fn project(&self, rotation: Quat) -> Quat {
        let along = self.axis * Vec3::new(rotation.x, rotation.y, rotation.z).dot(self.axis);
        let twist = Quat::from_xyzw(along.x, along.y, along.z, rotation.w);
        if twist.length_squared() < 1e-12 {
            Quat::IDENTITY
        } else {
            twist.normalize()
        }
    }

    /// 旋转绕限制轴的有符号角度，范围 (-π, π]
    pub fn signed_angle(&self, rotation: Quat) -> f32 {
        let s = Vec3::new(rotation.x, rotation.y, rotation.z).dot(self.axis);
        let mut angle = 2.0 * s.atan2(rotation.w);
        if angle > PI {
            angle -= 2.0 * PI;
        } else if angle <= -PI {
            angle += 2.0 * PI;
        }
        angle
    }

    /// 投影并限制角度范围
    pub fn constrain(&self, rotation: Quat) -> Quat {
        let angle = self.signed_angle(self.project(rotation)).clamp(self.lower, self.upper);
        Quat::from_axis_angle(self.axis, angle)
    }
}

// ============================================================================
// 骨骼种类
// ============================================================================

/// 特殊骨骼行为（加载时由类型和标志确定）
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BoneKind {
    /// 普通骨骼
    Plain,
    /// 扭转/旋转连动：叠加目标骨骼旋转的 `coefficient` 比例
    TwistFollow { target: usize, coefficient: f32 },
    /// 单轴限制
    AngleLimited(AxisLimit),
    /// 运动独立：位置不继承父骨骼平移，只链接旋转
    MotionIndependent,
}

// ============================================================================
// 骨骼标志
// ============================================================================

bitflags! {
    /// 骨骼运行时标志位
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BoneFlags: u32 {
        /// 可旋转
        const ROTATABLE = 1 << 0;
        /// 可移动
        const MOVABLE = 1 << 1;
        /// 显示
        const VISIBLE = 1 << 2;
        /// 当前受 IK 控制
        const IK_ENABLED = 1 << 3;
        /// 本帧由物理驱动
        const SIMULATED = 1 << 4;
    }
}

// ============================================================================
// 加载描述
// ============================================================================

/// 加载器提供的扁平骨骼描述
#[derive(Clone, Debug)]
pub struct BoneDesc {
    pub name: String,
    /// 父骨骼索引（`None` 表示根骨骼）
    pub parent: Option<usize>,
    pub bone_type: BoneType,
    /// 初始位置（模型空间）
    pub position: Vec3,
    /// 扭转/连动骨骼的目标骨骼
    pub target: Option<usize>,
    /// 旋转系数
    pub rotation_coefficient: f32,
    pub angle_limit: Option<AxisLimit>,
    pub motion_independent: bool,
}

impl BoneDesc {
    pub fn new(name: impl Into<String>, parent: Option<usize>, position: Vec3) -> Self {
        Self {
            name: name.into(),
            parent,
            bone_type: BoneType::Rotate,
            position,
            target: None,
            rotation_coefficient: 1.0,
            angle_limit: None,
            motion_independent: false,
        }
    }
}

// ============================================================================
// 骨骼节点
// ============================================================================

/// 骨骼节点
///
/// 变换计算：`local_to_world = parent.local_to_world * local_to_parent`
#[derive(Clone, Debug)]
pub struct BoneLink {
    // ========================================
    // 静态数据（初始化后不变）
    // ========================================
    /// 骨骼名称
    pub name: String,

    /// 骨骼内部索引
    pub(crate) internal_id: usize,

    /// 父骨骼索引
    pub parent_index: Option<usize>,

    /// 层级深度（根为 0，用于排序）
    pub depth: usize,

    pub bone_type: BoneType,

    pub kind: BoneKind,

    /// 骨骼标志
    pub flags: BoneFlags,

    /// 初始位置（模型空间）
    pub initial_position: Vec3,

    /// 相对于父骨骼的偏移（在 build 时计算）
    pub body_shift: Vec3,

    // ========================================
    // 动态数据（每帧更新）
    // ========================================
    /// 动画平移
    pub animation_translate: Vec3,

    /// 动画旋转
    pub animation_rotate: Quat,

    /// IK 旋转
    pub ik_rotate: Quat,

    /// 附加旋转（扭转/连动结果）
    pub append_rotate: Quat,

    /// 本地变换矩阵
    pub local_to_parent: Mat4,

    /// 全局变换矩阵
    pub local_to_world: Mat4,
}

impl BoneLink {
    /// 创建新骨骼
    pub fn new(name: String) -> Self {
        Self {
            name,
            internal_id: 0,
            parent_index: None,
            depth: 0,
            bone_type: BoneType::Rotate,
            kind: BoneKind::Plain,
            flags: BoneFlags::ROTATABLE | BoneFlags::VISIBLE,
            initial_position: Vec3::ZERO,
            body_shift: Vec3::ZERO,
            animation_translate: Vec3::ZERO,
            animation_rotate: Quat::IDENTITY,
            ik_rotate: Quat::IDENTITY,
            append_rotate: Quat::IDENTITY,
            local_to_parent: Mat4::IDENTITY,
            local_to_world: Mat4::IDENTITY,
        }
    }

    /// 从加载描述创建（种类由 BoneSet 校验后填入）
    pub(crate) fn from_desc(desc: &BoneDesc, kind: BoneKind) -> Self {
        let mut bone = Self::new(desc.name.clone());
        bone.parent_index = desc.parent;
        bone.bone_type = desc.bone_type;
        bone.kind = kind;
        bone.initial_position = desc.position;

        let mut flags = BoneFlags::ROTATABLE;
        if desc.bone_type.is_movable() || desc.motion_independent {
            flags.insert(BoneFlags::MOVABLE);
        }
        if !matches!(desc.bone_type, BoneType::Invisible | BoneType::IkTarget) {
            flags.insert(BoneFlags::VISIBLE);
        }
        bone.flags = flags;
        bone
    }

    // ========================================
    // 访问器
    // ========================================

    /// 骨骼索引
    #[inline]
    pub fn link_id(&self) -> usize {
        self.internal_id
    }

    /// 是否为根骨骼
    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent_index.is_none()
    }

    /// 获取世界位置
    #[inline]
    pub fn position(&self) -> Vec3 {
        self.local_to_world.col(3).truncate()
    }

    /// 获取世界旋转
    #[inline]
    pub fn rotation(&self) -> Quat {
        Quat::from_mat4(&self.local_to_world).normalize()
    }

    /// 本地旋转 = IK 旋转 * 动画旋转 * 附加旋转
    #[inline]
    pub fn local_rotation(&self) -> Quat {
        self.ik_rotate * self.animation_rotate * self.append_rotate
    }

    // ========================================
    // 变换计算
    // ========================================

    /// 重置动画状态
    #[inline]
    pub fn reset_animation(&mut self) {
        self.animation_translate = Vec3::ZERO;
        self.animation_rotate = Quat::IDENTITY;
        self.ik_rotate = Quat::IDENTITY;
        self.append_rotate = Quat::IDENTITY;
    }

    /// 写入动画值；单轴骨骼的旋转被投影到允许轴上
    pub fn set_animation(&mut self, translation: Vec3, rotation: Quat) {
        self.animation_translate = translation;
        self.animation_rotate = match self.kind {
            BoneKind::AngleLimited(limit) => limit.project(rotation),
            _ => rotation,
        };
    }

    /// 计算本地变换 (local_to_parent)
    pub fn compute_local_transform(&mut self) {
        let translate = self.body_shift + self.animation_translate;
        self.local_to_parent = Mat4::from_rotation_translation(self.local_rotation(), translate);
    }

    /// 由父骨骼世界变换合成本骨骼世界变换
    ///
    /// 运动独立骨骼只继承父骨骼的旋转，位置保持为 `初始位置 + 动画平移`。
    pub(crate) fn compose_world(&mut self, parent_world: Option<Mat4>) {
        self.local_to_world = match (self.kind, parent_world) {
            (BoneKind::MotionIndependent, Some(parent)) => {
                let (_, parent_rotation, _) = parent.to_scale_rotation_translation();
                Mat4::from_rotation_translation(
                    parent_rotation * self.local_rotation(),
                    self.initial_position + self.animation_translate,
                )
            }
            (_, Some(parent)) => parent * self.local_to_parent,
            (_, None) => self.local_to_parent,
        };
    }

    // ========================================
    // 标志检查方法
    // ========================================

    #[inline]
    pub fn is_rotatable(&self) -> bool {
        self.flags.contains(BoneFlags::ROTATABLE)
    }

    #[inline]
    pub fn is_movable(&self) -> bool {
        self.flags.contains(BoneFlags::MOVABLE)
    }

    #[inline]
    pub fn is_visible(&self) -> bool {
        self.flags.contains(BoneFlags::VISIBLE)
    }

    #[inline]
    pub fn is_simulated(&self) -> bool {
        self.flags.contains(BoneFlags::SIMULATED)
    }

    #[inline]
    pub fn set_simulated(&mut self, simulated: bool) {
        self.flags.set(BoneFlags::SIMULATED, simulated);
    }

    #[inline]
    pub fn enable_ik(&self) -> bool {
        self.flags.contains(BoneFlags::IK_ENABLED)
    }

    #[inline]
    pub fn set_enable_ik(&mut self, enabled: bool) {
        self.flags.set(BoneFlags::IK_ENABLED, enabled);
    }

    #[inline]
    pub fn angle_limit(&self) -> Option<AxisLimit> {
        match self.kind {
            BoneKind::AngleLimited(limit) => Some(limit),
            _ => None,
        }
    }
}

impl Default for BoneLink {
    fn default() -> Self {
        Self::new(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bone_type_from_raw() {
        assert_eq!(BoneType::from_raw(0), BoneType::Rotate);
        assert_eq!(BoneType::from_raw(8), BoneType::Twist);
        assert_eq!(BoneType::from_raw(3), BoneType::Unknown);
        assert_eq!(BoneType::from_raw(200), BoneType::Unknown);
    }

    #[test]
    fn test_axis_limit_projects_out_of_axis_rotation() {
        let limit = AxisLimit::new(Vec3::X, -PI, PI);
        let rotation = Quat::from_rotation_y(0.5) * Quat::from_rotation_x(0.7);
        let projected = limit.project(rotation);

        // 投影结果只有 X 分量
        assert!(projected.y.abs() < 1e-6);
        assert!(projected.z.abs() < 1e-6);
        assert!((projected.length() - 1.0).abs() < 1e-5);
        assert!(limit.signed_angle(projected) > 0.0);
    }

    #[test]
    fn test_knee_cannot_bend_backward() {
        let knee = AxisLimit::knee();
        let backward = Quat::from_rotation_x(-0.8);
        let constrained = knee.constrain(backward);
        assert!((knee.signed_angle(constrained) - knee.lower).abs() < 1e-5);

        let forward = Quat::from_rotation_x(1.2);
        let constrained = knee.constrain(forward);
        assert!((knee.signed_angle(constrained) - 1.2).abs() < 1e-5);
    }

    #[test]
    fn test_set_animation_projects_limited_bone() {
        let mut bone = BoneLink::new("左ひざ".to_string());
        bone.kind = BoneKind::AngleLimited(AxisLimit::knee());
        bone.set_animation(Vec3::ZERO, Quat::from_rotation_z(0.4) * Quat::from_rotation_x(0.3));
        assert!(bone.animation_rotate.z.abs() < 1e-6);
        assert!(bone.animation_rotate.y.abs() < 1e-6);
    }

    #[test]
    fn test_motion_independent_ignores_parent_translation() {
        let mut bone = BoneLink::new("センター".to_string());
        bone.kind = BoneKind::MotionIndependent;
        bone.initial_position = Vec3::new(0.0, 8.0, 0.0);
        bone.animation_translate = Vec3::new(1.0, 0.0, 0.0);
        bone.compute_local_transform();

        let parent = Mat4::from_rotation_translation(Quat::from_rotation_y(0.3), Vec3::new(5.0, 5.0, 5.0));
        bone.compose_world(Some(parent));

        assert!((bone.position() - Vec3::new(1.0, 8.0, 0.0)).length() < 1e-5);
        assert!(bone.rotation().angle_between(Quat::from_rotation_y(0.3)) < 1e-4);
    }
}

//! 关键帧定义

use glam::{Quat, Vec3};

use super::bezier_curve::BezierCurve;

/// 按帧号排序的关键帧
pub trait Keyframe {
    fn frame_index(&self) -> u32;
}

/// 骨骼关键帧
///
/// 插值曲线作用于"以本帧为终点"的区段（前一帧 → 本帧）。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoneKeyframe {
    pub frame_index: u32,
    /// 本地平移
    pub translation: Vec3,
    /// 本地旋转
    pub orientation: Quat,
    pub interpolation_x: BezierCurve,
    pub interpolation_y: BezierCurve,
    pub interpolation_z: BezierCurve,
    pub interpolation_r: BezierCurve,
}

impl BoneKeyframe {
    /// 线性插值关键帧
    pub fn new(frame_index: u32, translation: Vec3, orientation: Quat) -> Self {
        Self {
            frame_index,
            translation,
            orientation: orientation.normalize(),
            interpolation_x: BezierCurve::linear(),
            interpolation_y: BezierCurve::linear(),
            interpolation_z: BezierCurve::linear(),
            interpolation_r: BezierCurve::linear(),
        }
    }

    /// 设置 X/Y/Z/旋转 四组 VMD 插值参数
    pub fn with_parameters(mut self, parameters: [[u8; 4]; 4]) -> Self {
        self.interpolation_x = BezierCurve::from_parameters(parameters[0]);
        self.interpolation_y = BezierCurve::from_parameters(parameters[1]);
        self.interpolation_z = BezierCurve::from_parameters(parameters[2]);
        self.interpolation_r = BezierCurve::from_parameters(parameters[3]);
        self
    }

    /// 所有通道使用同一条曲线
    pub fn with_curve(mut self, curve: BezierCurve) -> Self {
        self.interpolation_x = curve;
        self.interpolation_y = curve;
        self.interpolation_z = curve;
        self.interpolation_r = curve;
        self
    }
}

impl Keyframe for BoneKeyframe {
    #[inline]
    fn frame_index(&self) -> u32 {
        self.frame_index
    }
}

/// Morph 关键帧（线性插值）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MorphKeyframe {
    pub frame_index: u32,
    pub weight: f32,
}

impl MorphKeyframe {
    pub fn new(frame_index: u32, weight: f32) -> Self {
        Self { frame_index, weight }
    }
}

impl Keyframe for MorphKeyframe {
    #[inline]
    fn frame_index(&self) -> u32 {
        self.frame_index
    }
}

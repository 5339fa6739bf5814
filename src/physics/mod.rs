//! 物理系统
//!
//! 每帧的两阶段交接（由 PoseResolver 驱动）：
//! 1. 运动学骨骼把动画后的世界变换推给物理
//! 2. 固定步长子步模拟
//! 3. 模拟骨骼从物理取回世界变换，覆盖动画结果
//!
//! 物理引擎通过 `PhysicsBackend` 接入；`RapierWorld` 是基于 Rapier3D 的实现。

mod bridge;
pub mod config;
mod rapier_world;

pub use bridge::PhysicsBridge;
pub use config::{get_config, reset_config, set_config, PhysicsConfig};
pub use rapier_world::{BodyDesc, JointDesc, RapierWorld};

use glam::Mat4;

/// 刚体与骨骼的关系
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicsMode {
    /// 跟随骨骼（运动学）
    Kinematic,
    /// 完全由物理驱动
    Simulated,
    /// 物理驱动旋转，位置跟随骨骼
    SimulatedWithBonePosition,
}

impl PhysicsMode {
    #[inline]
    pub fn is_simulated(self) -> bool {
        !matches!(self, PhysicsMode::Kinematic)
    }
}

/// 物理后端
///
/// 所有变换都是模型空间的骨骼世界矩阵；刚体相对骨骼的偏移由后端自己维护。
pub trait PhysicsBackend: Send {
    /// 绑定到骨骼的刚体：(骨骼索引, 模式)，同一骨骼可以出现多次
    fn bindings(&self) -> Vec<(usize, PhysicsMode)>;

    /// 推送运动学骨骼的世界变换
    fn push_kinematic(&mut self, bone: usize, bone_world: Mat4);

    /// 推进一个子步
    fn step(&mut self, dt: f32);

    /// 取回模拟骨骼的世界变换；`bone_world` 是动画结果，用于只取旋转的模式
    fn pull_simulated(&self, bone: usize, bone_world: Mat4) -> Option<Mat4>;

    /// 以骨骼世界变换重置该骨骼刚体的状态（位置与速度）
    fn reseed(&mut self, bone: usize, bone_world: Mat4);

    /// 切换骨骼刚体的模式
    fn set_mode(&mut self, bone: usize, mode: PhysicsMode);

    /// 恢复初始状态
    fn reset(&mut self) {}
}

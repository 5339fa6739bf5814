//! MMD 骨骼姿态运行时
//!
//! 每帧流程：动作求值 → 骨骼层级变换 → IK → 物理 → 提交最终变换。
//!
//! - `skeleton`: 骨骼、骨骼集合、IK 求解器
//! - `animation`: 关键帧轨道、贝塞尔插值、动作控制器与动作管理器
//! - `morph`: 表情权重
//! - `physics`: 物理桥接（运动学/模拟骨骼的交接）
//! - `pose_resolver`: 单模型每帧调度

pub mod animation;
pub mod morph;
pub mod physics;
pub mod pose_resolver;
pub mod skeleton;

pub use animation::{
    BezierCurve, BoneKeyframe, BoneMotionTrack, Motion, MotionController, MotionEvent,
    MotionManager, MotionOptions, MorphKeyframe, MorphMotionTrack, PlayerState,
};
pub use morph::MorphManager;
pub use physics::{PhysicsBackend, PhysicsBridge, PhysicsMode, RapierWorld};
pub use pose_resolver::{ModelDesc, PoseResolver};
pub use skeleton::{
    AxisLimit, BoneDesc, BoneKind, BoneLink, BoneSet, BoneTransform, BoneType, IkDesc, IkOutcome,
    IkSolver,
};

use thiserror::Error;

/// 运行时错误
///
/// 只在加载/初始化阶段返回；每帧运行路径不产生错误。
#[derive(Debug, Error)]
pub enum MmdError {
    #[error("duplicate bone name '{0}'")]
    DuplicateBoneName(String),

    #[error("bone '{bone}' references missing parent #{parent}")]
    DanglingParent { bone: String, parent: usize },

    #[error("bone '{bone}' is part of a parent cycle")]
    ParentCycle { bone: String },

    #[error("bone '{bone}' references missing target bone #{target:?}")]
    DanglingTarget { bone: String, target: Option<usize> },

    #[error("IK chain #{index} is malformed: {reason}")]
    MalformedIk { index: usize, reason: String },

    #[error("physics binding references missing bone #{0}")]
    UnknownBone(usize),

    #[error("physics setup failed: {0}")]
    PhysicsSetup(String),
}

pub type Result<T> = std::result::Result<T, MmdError>;

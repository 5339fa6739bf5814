//! 动画系统
//!
//! - `bezier_curve`: VMD 缓动曲线
//! - `keyframe` / `motion_track`: 关键帧与带游标的轨道求值
//! - `motion`: 按名称索引的轨道集合
//! - `motion_controller`: 单个播放器的绑定、求值与快照过渡
//! - `motion_manager`: 多动作生命周期与优先级合成

mod bezier_curve;
mod keyframe;
mod motion;
mod motion_controller;
mod motion_manager;
mod motion_track;

pub use bezier_curve::{BezierCurve, Curve};
pub use keyframe::{BoneKeyframe, Keyframe, MorphKeyframe};
pub use motion::Motion;
pub use motion_controller::{
    BoneSample, MorphSample, MotionController, BONE_START_MARGIN_FRAME, FACE_START_MARGIN_FRAME,
};
pub use motion_manager::{MotionEvent, MotionManager, MotionOptions, PlayerState};
pub use motion_track::{BoneMotionTrack, MorphMotionTrack, MotionTrack, TrackCursor};

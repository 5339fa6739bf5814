//! 动作控制器
//!
//! 单个播放器的求值器：把动作轨道绑定到骨骼/Morph 索引，按帧求值，
//! 并在快照存在时从快照姿态线性过渡到新动作。

use std::sync::Arc;

use glam::{Quat, Vec3};

use super::motion::Motion;
use super::motion_track::{MotionTrack, TrackCursor};
use crate::morph::MorphManager;
use crate::skeleton::BoneSet;

/// 骨骼快照过渡帧数
pub const BONE_START_MARGIN_FRAME: f32 = 20.0;
/// 表情快照过渡帧数
pub const FACE_START_MARGIN_FRAME: f32 = 6.0;

/// 单骨骼求值结果
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoneSample {
    pub bone: usize,
    pub translation: Vec3,
    pub rotation: Quat,
}

/// 单 Morph 求值结果
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MorphSample {
    pub morph: usize,
    pub weight: f32,
}

#[derive(Clone, Debug)]
struct BoneChannel {
    track: usize,
    bone: usize,
    cursor: TrackCursor,
}

#[derive(Clone, Debug)]
struct MorphChannel {
    track: usize,
    morph: usize,
    cursor: TrackCursor,
}

/// 冻结的姿态
#[derive(Clone, Debug)]
struct Snapshot {
    bones: Vec<(Vec3, Quat)>,
    morphs: Vec<f32>,
    elapsed: f32,
}

impl Snapshot {
    #[inline]
    fn bone_amount(&self) -> Option<f32> {
        (self.elapsed < BONE_START_MARGIN_FRAME).then(|| self.elapsed / BONE_START_MARGIN_FRAME)
    }

    #[inline]
    fn face_amount(&self) -> Option<f32> {
        (self.elapsed < FACE_START_MARGIN_FRAME).then(|| self.elapsed / FACE_START_MARGIN_FRAME)
    }
}

/// 动作控制器
#[derive(Clone, Debug)]
pub struct MotionController {
    motion: Arc<Motion>,
    ignore_static: bool,
    bone_channels: Vec<BoneChannel>,
    morph_channels: Vec<MorphChannel>,
    snapshot: Option<Snapshot>,
    bone_output: Vec<BoneSample>,
    morph_output: Vec<MorphSample>,
}

impl MotionController {
    /// 创建并绑定轨道
    ///
    /// `ignore_static` 为真时跳过只有一个关键帧的轨道（非全身动作）。
    pub fn new(motion: Arc<Motion>, bones: &BoneSet, morphs: &MorphManager, ignore_static: bool) -> Self {
        let mut controller = Self {
            motion,
            ignore_static,
            bone_channels: Vec::new(),
            morph_channels: Vec::new(),
            snapshot: None,
            bone_output: Vec::new(),
            morph_output: Vec::new(),
        };
        controller.bind(bones, morphs);
        controller
    }

    fn bind(&mut self, bones: &BoneSet, morphs: &MorphManager) {
        self.bone_channels.clear();
        self.morph_channels.clear();

        for (track, data) in self.motion.bone_tracks().iter().enumerate() {
            if data.is_empty() || (self.ignore_static && data.is_static()) {
                continue;
            }
            if let Some(bone) = bones.find_bone_by_name(&data.name) {
                self.bone_channels.push(BoneChannel { track, bone, cursor: TrackCursor::default() });
            }
        }
        for (track, data) in self.motion.morph_tracks().iter().enumerate() {
            if data.is_empty() || (self.ignore_static && data.is_static()) {
                continue;
            }
            if let Some(morph) = morphs.find_morph_by_name(&data.name) {
                self.morph_channels.push(MorphChannel { track, morph, cursor: TrackCursor::default() });
            }
        }

        log::debug!(
            "动作绑定: {}/{} 骨骼轨道, {}/{} 表情轨道",
            self.bone_channels.len(),
            self.motion.bone_tracks().len(),
            self.morph_channels.len(),
            self.motion.morph_tracks().len()
        );
    }

    /// 替换动作数据，保留快照
    pub fn rebind(&mut self, motion: Arc<Motion>, bones: &BoneSet, morphs: &MorphManager) {
        self.motion = motion;
        self.bind(bones, morphs);
    }

    #[inline]
    pub fn motion(&self) -> &Arc<Motion> {
        &self.motion
    }

    #[inline]
    pub fn max_frame(&self) -> f32 {
        self.motion.max_frame() as f32
    }

    pub fn touches_bone(&self, bone: usize) -> bool {
        self.bone_channels.iter().any(|c| c.bone == bone)
    }

    /// 不经过游标和快照，直接求某骨骼在某帧的动作值
    pub fn sample_bone(&self, bone: usize, frame: f32) -> Option<(Vec3, Quat)> {
        let channel = self.bone_channels.iter().find(|c| c.bone == bone)?;
        let mut cursor = TrackCursor::default();
        Some(self.motion.bone_tracks()[channel.track].evaluate(frame, &mut cursor))
    }

    pub fn reset_cursors(&mut self) {
        for channel in &mut self.bone_channels {
            channel.cursor.reset();
        }
        for channel in &mut self.morph_channels {
            channel.cursor.reset();
        }
    }

    // ========================================
    // 快照
    // ========================================

    /// 冻结当前姿态；中心骨骼记录去掉重定位偏移后的值
    pub fn take_snap(&mut self, bones: &BoneSet, morphs: &MorphManager, center: Option<(usize, Vec3)>) {
        let mut pose = bones.animation_values();
        if let Some((index, offset)) = center {
            if let Some(value) = pose.get_mut(index) {
                value.0 -= offset;
            }
        }
        self.snapshot = Some(Snapshot { bones: pose, morphs: morphs.weights(), elapsed: 0.0 });
    }

    /// 改写快照中单个骨骼的位移
    pub fn set_snap_translation(&mut self, bone: usize, translation: Vec3) {
        if let Some(value) = self.snapshot.as_mut().and_then(|s| s.bones.get_mut(bone)) {
            value.0 = translation;
        }
    }

    #[inline]
    pub fn has_snap(&self) -> bool {
        self.snapshot.is_some()
    }

    /// 推进快照过渡；过渡完成后丢弃快照
    pub fn advance_snap(&mut self, delta: f32) {
        if let Some(snapshot) = &mut self.snapshot {
            snapshot.elapsed += delta.max(0.0);
            if snapshot.bone_amount().is_none() && snapshot.face_amount().is_none() {
                self.snapshot = None;
            }
        }
    }

    // ========================================
    // 求值
    // ========================================

    /// 求值指定帧，结果通过 `bone_output`/`morph_output` 读取
    pub fn evaluate(&mut self, frame: f32) {
        self.bone_output.clear();
        self.morph_output.clear();

        let motion = &self.motion;
        let snapshot = self.snapshot.as_ref();
        let bone_amount = snapshot.and_then(Snapshot::bone_amount);
        let face_amount = snapshot.and_then(Snapshot::face_amount);

        for channel in &mut self.bone_channels {
            let (mut translation, mut rotation) =
                motion.bone_tracks()[channel.track].evaluate(frame, &mut channel.cursor);
            if let (Some(amount), Some(snap)) = (bone_amount, snapshot) {
                if let Some(&(from_t, from_r)) = snap.bones.get(channel.bone) {
                    translation = from_t.lerp(translation, amount);
                    rotation = from_r.slerp(rotation, amount).normalize();
                }
            }
            self.bone_output.push(BoneSample { bone: channel.bone, translation, rotation });
        }

        for channel in &mut self.morph_channels {
            let mut weight = motion.morph_tracks()[channel.track].evaluate(frame, &mut channel.cursor);
            if let (Some(amount), Some(snap)) = (face_amount, snapshot) {
                if let Some(&from) = snap.morphs.get(channel.morph) {
                    weight = from + (weight - from) * amount;
                }
            }
            self.morph_output.push(MorphSample { morph: channel.morph, weight });
        }
    }

    #[inline]
    pub fn bone_output(&self) -> &[BoneSample] {
        &self.bone_output
    }

    #[inline]
    pub fn morph_output(&self) -> &[MorphSample] {
        &self.morph_output
    }
}

//! 动画轨道
//!
//! 存储单个骨骼或 Morph 的所有关键帧（按帧号升序），并提供带游标缓存的插值求值。

use glam::{Quat, Vec3};

use super::bezier_curve::Curve;
use super::keyframe::{BoneKeyframe, Keyframe, MorphKeyframe};

/// 求值游标：缓存上次所在的区段起点
///
/// 时间单调前进时查找是均摊 O(1)；查询早于缓存区段时从头开始查找。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackCursor {
    pub last_key: usize,
}

impl TrackCursor {
    #[inline]
    pub fn reset(&mut self) {
        self.last_key = 0;
    }
}

/// 动画轨道 trait
pub trait MotionTrack {
    type Frame;

    /// 求值指定时间（帧，可带小数）
    fn evaluate(&self, time: f32, cursor: &mut TrackCursor) -> Self::Frame;

    /// 获取轨道长度
    fn len(&self) -> usize;

    /// 是否为空
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 获取最大帧索引
    fn max_frame_index(&self) -> u32;
}

// ============================================================================
// 公共查找
// ============================================================================

/// 插入或替换同帧号的关键帧，保持升序
fn insert_sorted<K: Keyframe>(keyframes: &mut Vec<K>, keyframe: K) -> Option<K> {
    match keyframes.binary_search_by_key(&keyframe.frame_index(), |k| k.frame_index()) {
        Ok(pos) => Some(std::mem::replace(&mut keyframes[pos], keyframe)),
        Err(pos) => {
            keyframes.insert(pos, keyframe);
            None
        }
    }
}

fn remove_sorted<K: Keyframe>(keyframes: &mut Vec<K>, frame_index: u32) -> Option<K> {
    keyframes
        .binary_search_by_key(&frame_index, |k| k.frame_index())
        .ok()
        .map(|pos| keyframes.remove(pos))
}

/// 查找满足 `keys[i].frame <= time` 的最大 i（调用方保证 time >= keys[0].frame）
fn locate<K: Keyframe>(keyframes: &[K], time: f32, cursor: &mut TrackCursor) -> usize {
    let mut i = cursor.last_key.min(keyframes.len() - 1);
    if time < keyframes[i].frame_index() as f32 {
        i = 0;
    }
    while i + 1 < keyframes.len() && keyframes[i + 1].frame_index() as f32 <= time {
        i += 1;
    }
    cursor.last_key = i;
    i
}

/// 区段内的线性进度
#[inline]
fn coefficient(prev: u32, next: u32, time: f32) -> f32 {
    let span = next.saturating_sub(prev) as f32;
    if span <= 0.0 {
        1.0
    } else {
        ((time - prev as f32) / span).clamp(0.0, 1.0)
    }
}

// ============================================================================
// 骨骼轨道
// ============================================================================

/// 骨骼动画轨道
#[derive(Debug, Clone, Default)]
pub struct BoneMotionTrack {
    pub name: String,
    keyframes: Vec<BoneKeyframe>,
}

impl BoneMotionTrack {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), keyframes: Vec::new() }
    }

    /// 插入关键帧；同帧号时替换并返回旧关键帧
    pub fn insert_keyframe(&mut self, keyframe: BoneKeyframe) -> Option<BoneKeyframe> {
        insert_sorted(&mut self.keyframes, keyframe)
    }

    /// 移除关键帧
    pub fn remove_keyframe(&mut self, frame_index: u32) -> Option<BoneKeyframe> {
        remove_sorted(&mut self.keyframes, frame_index)
    }

    pub fn find(&self, frame_index: u32) -> Option<&BoneKeyframe> {
        self.keyframes
            .binary_search_by_key(&frame_index, |k| k.frame_index)
            .ok()
            .map(|pos| &self.keyframes[pos])
    }

    #[inline]
    pub fn keyframes(&self) -> &[BoneKeyframe] {
        &self.keyframes
    }

    /// 不超过一个关键帧的轨道视为静态
    #[inline]
    pub fn is_static(&self) -> bool {
        self.keyframes.len() <= 1
    }
}

impl MotionTrack for BoneMotionTrack {
    type Frame = (Vec3, Quat);

    fn evaluate(&self, time: f32, cursor: &mut TrackCursor) -> Self::Frame {
        let (first, last) = match (self.keyframes.first(), self.keyframes.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return (Vec3::ZERO, Quat::IDENTITY),
        };
        if time <= first.frame_index as f32 {
            return (first.translation, first.orientation);
        }
        if time >= last.frame_index as f32 {
            cursor.last_key = self.keyframes.len() - 1;
            return (last.translation, last.orientation);
        }

        let i = locate(&self.keyframes, time, cursor);
        let prev = &self.keyframes[i];
        let next = &self.keyframes[i + 1];
        let coef = coefficient(prev.frame_index, next.frame_index, time);

        // 区段曲线取自后一帧
        let amounts = Vec3::new(
            next.interpolation_x.value(coef),
            next.interpolation_y.value(coef),
            next.interpolation_z.value(coef),
        );
        let translation = prev.translation + (next.translation - prev.translation) * amounts;
        let orientation = prev
            .orientation
            .slerp(next.orientation, next.interpolation_r.value(coef))
            .normalize();
        (translation, orientation)
    }

    fn len(&self) -> usize {
        self.keyframes.len()
    }

    fn max_frame_index(&self) -> u32 {
        self.keyframes.last().map(|k| k.frame_index).unwrap_or(0)
    }
}

// ============================================================================
// Morph 轨道
// ============================================================================

/// Morph 动画轨道
#[derive(Debug, Clone, Default)]
pub struct MorphMotionTrack {
    pub name: String,
    keyframes: Vec<MorphKeyframe>,
}

impl MorphMotionTrack {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), keyframes: Vec::new() }
    }

    pub fn insert_keyframe(&mut self, keyframe: MorphKeyframe) -> Option<MorphKeyframe> {
        insert_sorted(&mut self.keyframes, keyframe)
    }

    pub fn remove_keyframe(&mut self, frame_index: u32) -> Option<MorphKeyframe> {
        remove_sorted(&mut self.keyframes, frame_index)
    }

    #[inline]
    pub fn keyframes(&self) -> &[MorphKeyframe] {
        &self.keyframes
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.keyframes.len() <= 1
    }
}

impl MotionTrack for MorphMotionTrack {
    type Frame = f32;

    fn evaluate(&self, time: f32, cursor: &mut TrackCursor) -> Self::Frame {
        let (first, last) = match (self.keyframes.first(), self.keyframes.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return 0.0,
        };
        if time <= first.frame_index as f32 {
            return first.weight;
        }
        if time >= last.frame_index as f32 {
            cursor.last_key = self.keyframes.len() - 1;
            return last.weight;
        }

        let i = locate(&self.keyframes, time, cursor);
        let prev = &self.keyframes[i];
        let next = &self.keyframes[i + 1];
        let coef = coefficient(prev.frame_index, next.frame_index, time);
        prev.weight + (next.weight - prev.weight) * coef
    }

    fn len(&self) -> usize {
        self.keyframes.len()
    }

    fn max_frame_index(&self) -> u32 {
        self.keyframes.last().map(|k| k.frame_index).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::BezierCurve;
    use glam::Vec2;

    fn track_0_30_60() -> BoneMotionTrack {
        let mut track = BoneMotionTrack::new("arm");
        track.insert_keyframe(BoneKeyframe::new(0, Vec3::new(0.0, 0.0, 0.0), Quat::IDENTITY));
        track.insert_keyframe(BoneKeyframe::new(30, Vec3::new(3.0, 0.0, 0.0), Quat::from_rotation_y(0.5)));
        track.insert_keyframe(BoneKeyframe::new(60, Vec3::new(6.0, 1.0, 0.0), Quat::from_rotation_y(1.0)));
        track
    }

    #[test]
    fn test_boundary_clamp() {
        let track = track_0_30_60();
        let mut cursor = TrackCursor::default();

        let (t, r) = track.evaluate(-10.0, &mut cursor);
        assert_eq!(t, Vec3::ZERO);
        assert_eq!(r, Quat::IDENTITY);

        let (t, r) = track.evaluate(1000.0, &mut cursor);
        assert_eq!(t, Vec3::new(6.0, 1.0, 0.0));
        assert!(r.angle_between(Quat::from_rotation_y(1.0)) < 1e-6);
    }

    #[test]
    fn test_empty_and_single_key() {
        let mut cursor = TrackCursor::default();
        let empty = BoneMotionTrack::new("none");
        assert_eq!(empty.evaluate(12.0, &mut cursor), (Vec3::ZERO, Quat::IDENTITY));

        let mut single = BoneMotionTrack::new("one");
        single.insert_keyframe(BoneKeyframe::new(15, Vec3::ONE, Quat::from_rotation_x(0.2)));
        for time in [0.0, 15.0, 99.0] {
            let (t, _) = single.evaluate(time, &mut cursor);
            assert_eq!(t, Vec3::ONE);
        }
    }

    #[test]
    fn test_midpoint_identity() {
        let track = track_0_30_60();
        let mut cursor = TrackCursor::default();
        let (t, r) = track.evaluate(15.0, &mut cursor);
        assert!((t - Vec3::new(1.5, 0.0, 0.0)).length() < 1e-4);
        assert!(r.angle_between(Quat::from_rotation_y(0.25)) < 1e-4);
    }

    #[test]
    fn test_midpoint_identity_with_bezier_keys() {
        // (0,0)-(1,1) 为恒等曲线；(0.5,0)-(0.5,1) 关于中点对称
        let curves = [
            BezierCurve::new(Vec2::ZERO, Vec2::ONE),
            BezierCurve::new(Vec2::new(0.5, 0.0), Vec2::new(0.5, 1.0)),
        ];
        for curve in curves {
            let mut track = BoneMotionTrack::new("arm");
            track.insert_keyframe(BoneKeyframe::new(0, Vec3::ZERO, Quat::IDENTITY).with_curve(curve));
            track.insert_keyframe(
                BoneKeyframe::new(10, Vec3::new(2.0, 4.0, -6.0), Quat::from_rotation_x(1.0)).with_curve(curve),
            );

            let mut cursor = TrackCursor::default();
            let (t, r) = track.evaluate(5.0, &mut cursor);
            assert!((t - Vec3::new(1.0, 2.0, -3.0)).length() < 1e-4, "{:?}: {:?}", curve, t);
            assert!(r.angle_between(Quat::from_rotation_x(0.5)) < 1e-4, "{:?}: {:?}", curve, r);
        }
    }

    #[test]
    fn test_segment_uses_next_key_curve() {
        let ease = BezierCurve::new(Vec2::new(0.42, 0.0), Vec2::new(1.0, 1.0));
        let mut track = BoneMotionTrack::new("arm");
        track.insert_keyframe(BoneKeyframe::new(0, Vec3::ZERO, Quat::IDENTITY));
        track.insert_keyframe(BoneKeyframe::new(10, Vec3::X * 10.0, Quat::IDENTITY).with_curve(ease));

        let mut cursor = TrackCursor::default();
        let (t, _) = track.evaluate(5.0, &mut cursor);
        assert!(t.x < 5.0);
    }

    #[test]
    fn test_duplicate_frame_replaces() {
        let mut track = track_0_30_60();
        let old = track.insert_keyframe(BoneKeyframe::new(30, Vec3::Y, Quat::IDENTITY));
        assert!(old.is_some());
        assert_eq!(track.len(), 3);
        assert_eq!(track.find(30).unwrap().translation, Vec3::Y);
    }

    #[test]
    fn test_cursor_restarts_on_backward_query() {
        let track = track_0_30_60();
        let mut cursor = TrackCursor::default();
        let forward = track.evaluate(45.0, &mut cursor);
        assert_eq!(cursor.last_key, 1);

        let back = track.evaluate(10.0, &mut cursor);
        assert_eq!(cursor.last_key, 0);

        let mut fresh = TrackCursor::default();
        assert_eq!(back, track.evaluate(10.0, &mut fresh));
        assert_eq!(forward, track.evaluate(45.0, &mut cursor));
    }

    #[test]
    fn test_morph_linear() {
        let mut track = MorphMotionTrack::new("まばたき");
        track.insert_keyframe(MorphKeyframe::new(0, 0.0));
        track.insert_keyframe(MorphKeyframe::new(10, 1.0));
        let mut cursor = TrackCursor::default();
        assert!((track.evaluate(2.5, &mut cursor) - 0.25).abs() < 1e-6);
        assert_eq!(track.evaluate(-3.0, &mut cursor), 0.0);
        assert_eq!(track.evaluate(30.0, &mut cursor), 1.0);
        assert_eq!(track.max_frame_index(), 10);
    }
}

//! 动作数据
//!
//! 一个动作由若干按名称索引的骨骼轨道和 Morph 轨道组成。
//! 播放期间只读，多个播放器通过 `Arc<Motion>` 共享。

use std::collections::HashMap;

use super::keyframe::{BoneKeyframe, MorphKeyframe};
use super::motion_track::{BoneMotionTrack, MorphMotionTrack, MotionTrack};

/// 动作数据
#[derive(Debug, Clone, Default)]
pub struct Motion {
    bone_tracks: Vec<BoneMotionTrack>,
    bone_index: HashMap<String, usize>,
    morph_tracks: Vec<MorphMotionTrack>,
    morph_index: HashMap<String, usize>,
}

impl Motion {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================
    // 编辑
    // ========================================

    /// 插入骨骼关键帧（同帧号替换）
    pub fn insert_bone_keyframe(&mut self, bone_name: &str, keyframe: BoneKeyframe) -> Option<BoneKeyframe> {
        let index = match self.bone_index.get(bone_name) {
            Some(&i) => i,
            None => {
                self.bone_tracks.push(BoneMotionTrack::new(bone_name));
                self.bone_index.insert(bone_name.to_string(), self.bone_tracks.len() - 1);
                self.bone_tracks.len() - 1
            }
        };
        self.bone_tracks[index].insert_keyframe(keyframe)
    }

    /// 插入 Morph 关键帧（同帧号替换）
    pub fn insert_morph_keyframe(&mut self, morph_name: &str, keyframe: MorphKeyframe) -> Option<MorphKeyframe> {
        let index = match self.morph_index.get(morph_name) {
            Some(&i) => i,
            None => {
                self.morph_tracks.push(MorphMotionTrack::new(morph_name));
                self.morph_index.insert(morph_name.to_string(), self.morph_tracks.len() - 1);
                self.morph_tracks.len() - 1
            }
        };
        self.morph_tracks[index].insert_keyframe(keyframe)
    }

    pub fn remove_bone_keyframe(&mut self, bone_name: &str, frame_index: u32) -> Option<BoneKeyframe> {
        let index = *self.bone_index.get(bone_name)?;
        self.bone_tracks[index].remove_keyframe(frame_index)
    }

    pub fn remove_morph_keyframe(&mut self, morph_name: &str, frame_index: u32) -> Option<MorphKeyframe> {
        let index = *self.morph_index.get(morph_name)?;
        self.morph_tracks[index].remove_keyframe(frame_index)
    }

    // ========================================
    // 查询
    // ========================================

    /// 所有轨道中的最大帧号
    pub fn max_frame(&self) -> u32 {
        let bones = self.bone_tracks.iter().map(|t| t.max_frame_index());
        let morphs = self.morph_tracks.iter().map(|t| t.max_frame_index());
        bones.chain(morphs).max().unwrap_or(0)
    }

    /// 没有任何关键帧
    pub fn is_empty(&self) -> bool {
        self.bone_tracks.iter().all(|t| t.is_empty()) && self.morph_tracks.iter().all(|t| t.is_empty())
    }

    pub fn contains_bone_track(&self, bone_name: &str) -> bool {
        self.bone_index.contains_key(bone_name)
    }

    pub fn find_bone_track(&self, bone_name: &str) -> Option<&BoneMotionTrack> {
        self.bone_index.get(bone_name).map(|&i| &self.bone_tracks[i])
    }

    pub fn find_morph_track(&self, morph_name: &str) -> Option<&MorphMotionTrack> {
        self.morph_index.get(morph_name).map(|&i| &self.morph_tracks[i])
    }

    #[inline]
    pub fn bone_tracks(&self) -> &[BoneMotionTrack] {
        &self.bone_tracks
    }

    #[inline]
    pub fn morph_tracks(&self) -> &[MorphMotionTrack] {
        &self.morph_tracks
    }

    pub fn bone_track_names(&self) -> impl Iterator<Item = &str> {
        self.bone_tracks.iter().map(|t| t.name.as_str())
    }

    pub fn morph_track_names(&self) -> impl Iterator<Item = &str> {
        self.morph_tracks.iter().map(|t| t.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    #[test]
    fn test_insert_and_query() {
        let mut motion = Motion::new();
        assert!(motion.is_empty());

        motion.insert_bone_keyframe("右腕", BoneKeyframe::new(0, Vec3::ZERO, Quat::IDENTITY));
        motion.insert_bone_keyframe("右腕", BoneKeyframe::new(45, Vec3::ZERO, Quat::IDENTITY));
        motion.insert_morph_keyframe("あ", MorphKeyframe::new(80, 1.0));

        assert!(!motion.is_empty());
        assert!(motion.contains_bone_track("右腕"));
        assert_eq!(motion.max_frame(), 80);
        assert_eq!(motion.find_bone_track("右腕").unwrap().len(), 2);
        assert_eq!(motion.bone_track_names().collect::<Vec<_>>(), vec!["右腕"]);

        assert!(motion.remove_bone_keyframe("右腕", 45).is_some());
        assert!(motion.remove_bone_keyframe("左腕", 0).is_none());
        assert_eq!(motion.find_bone_track("右腕").unwrap().max_frame_index(), 0);
    }
}

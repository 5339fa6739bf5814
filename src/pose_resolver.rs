//! 单模型姿态调度
//!
//! 每帧固定顺序：
//! 1. 动作管理器推进并合成，写入骨骼动画值/Morph 权重
//! 2. 清除上一帧的 IK/付与结果，标记物理骨骼
//! 3. 层级变换 → IK → 付与（捩り/回転付与）
//! 4. 物理桥接：推送运动学骨骼 → 子步模拟 → 取回模拟骨骼

use std::sync::Arc;

use glam::{Mat4, Quat, Vec3};
use rayon::prelude::*;

use crate::animation::{Motion, MotionEvent, MotionManager, MotionOptions};
use crate::morph::MorphManager;
use crate::physics::{PhysicsBridge, PhysicsMode};
use crate::skeleton::{BoneDesc, BoneSet, IkDesc, IkOutcome};
use crate::Result;

/// 动作帧率（VMD 固定 30 FPS）
pub const MOTION_FPS: f32 = 30.0;

/// 模型描述（扁平化的骨骼/IK/Morph 列表）
#[derive(Debug, Clone, Default)]
pub struct ModelDesc {
    pub bones: Vec<BoneDesc>,
    pub iks: Vec<IkDesc>,
    pub morphs: Vec<String>,
}

/// 单模型姿态解算器
#[derive(Debug)]
pub struct PoseResolver {
    bones: BoneSet,
    morphs: MorphManager,
    motions: MotionManager,
    physics: Option<PhysicsBridge>,
    /// 累计帧数
    time: f32,
}

impl PoseResolver {
    pub fn new(desc: &ModelDesc) -> Result<Self> {
        let bones = BoneSet::build(&desc.bones, &desc.iks)?;
        let morphs = MorphManager::from_names(desc.morphs.iter().cloned());
        Ok(Self {
            bones,
            morphs,
            motions: MotionManager::new(),
            physics: None,
            time: 0.0,
        })
    }

    /// 挂接物理；绑定到不存在骨骼时失败
    pub fn with_physics(mut self, bridge: PhysicsBridge) -> Result<Self> {
        self.set_physics(bridge)?;
        Ok(self)
    }

    pub fn set_physics(&mut self, bridge: PhysicsBridge) -> Result<()> {
        bridge.validate(self.bones.bone_count())?;
        self.physics = Some(bridge);
        Ok(())
    }

    pub fn take_physics(&mut self) -> Option<PhysicsBridge> {
        self.physics.take()
    }

    // ========================================
    // 访问器
    // ========================================

    #[inline]
    pub fn bones(&self) -> &BoneSet {
        &self.bones
    }

    #[inline]
    pub fn bones_mut(&mut self) -> &mut BoneSet {
        &mut self.bones
    }

    #[inline]
    pub fn morphs(&self) -> &MorphManager {
        &self.morphs
    }

    #[inline]
    pub fn motions(&self) -> &MotionManager {
        &self.motions
    }

    #[inline]
    pub fn motions_mut(&mut self) -> &mut MotionManager {
        &mut self.motions
    }

    #[inline]
    pub fn physics(&self) -> Option<&PhysicsBridge> {
        self.physics.as_ref()
    }

    /// 累计播放帧数
    #[inline]
    pub fn time(&self) -> f32 {
        self.time
    }

    // ========================================
    // 动作
    // ========================================

    pub fn start_motion(&mut self, name: &str, motion: Arc<Motion>, options: MotionOptions) -> bool {
        self.motions.start_motion(name, motion, options, &self.bones, &self.morphs)
    }

    /// 批量开始动作；单个失败不影响其余动作，返回失败的名称
    pub fn start_motions<'a, I>(&mut self, requests: I) -> Vec<String>
    where
        I: IntoIterator<Item = (&'a str, Arc<Motion>, MotionOptions)>,
    {
        let mut failed = Vec::new();
        for (name, motion, options) in requests {
            if !self.start_motion(name, motion, options) {
                failed.push(name.to_string());
            }
        }
        if !failed.is_empty() {
            log::warn!("{} 个动作未能开始: {:?}", failed.len(), failed);
        }
        failed
    }

    pub fn delete_motion(&mut self, name: &str) -> bool {
        self.motions.delete_motion(name)
    }

    /// 动作的中心骨骼从 `center` 开始播放
    pub fn set_override_first(&mut self, name: &str, center: Vec3) -> bool {
        self.motions.set_override_first(name, center, &self.bones)
    }

    pub fn drain_events(&mut self) -> Vec<MotionEvent> {
        self.motions.drain_events()
    }

    // ========================================
    // 每帧
    // ========================================

    /// 推进 `delta_frames` 帧（30 FPS 帧单位）并解算姿态
    pub fn tick(&mut self, delta_frames: f32) {
        let delta = if delta_frames.is_finite() { delta_frames } else { 0.0 };
        self.time += delta;

        self.motions.update(self.time, &mut self.bones, &mut self.morphs);

        self.bones.begin_update();
        if let Some(bridge) = &self.physics {
            bridge.mark_simulated(&mut self.bones);
        }
        self.bones.update_transforms();
        self.bones.solve_ik();
        self.bones.apply_follow_rotations();

        if let Some(bridge) = &mut self.physics {
            bridge.update(delta.max(0.0) / MOTION_FPS, &mut self.bones);
        }
    }

    /// 开关物理；关闭时模拟骨骼交还动画
    pub fn set_physics_enabled(&mut self, enabled: bool) {
        if let Some(bridge) = &mut self.physics {
            bridge.set_enabled(enabled, &self.bones);
        }
    }

    pub fn is_physics_enabled(&self) -> bool {
        self.physics.as_ref().is_some_and(|b| b.is_enabled())
    }

    pub fn set_bone_physics_mode(&mut self, bone: usize, mode: PhysicsMode) -> bool {
        match &mut self.physics {
            Some(bridge) => bridge.set_bone_mode(bone, mode, &self.bones),
            None => false,
        }
    }

    pub fn reset_physics(&mut self) {
        if let Some(bridge) = &mut self.physics {
            bridge.reset(&self.bones);
        }
    }

    // ========================================
    // 输出
    // ========================================

    pub fn world_matrix(&self, bone: usize) -> Option<Mat4> {
        self.bones.world_matrix(bone)
    }

    /// 世界位置与旋转
    pub fn world_pose(&self, bone: usize) -> Option<(Vec3, Quat)> {
        self.bones
            .world_transform(bone)
            .map(|t| (t.translation, t.rotation))
    }

    pub fn global_transforms(&self) -> Vec<Mat4> {
        self.bones.global_transforms()
    }

    pub fn skinning_matrices(&self) -> Vec<Mat4> {
        self.bones.skinning_matrices()
    }

    pub fn ik_outcomes(&self) -> &[IkOutcome] {
        self.bones.ik_outcomes()
    }

    pub fn morph_weights(&self) -> Vec<f32> {
        self.morphs.weights()
    }
}

/// 多个模型互不依赖，可并行推进
pub fn tick_models(models: &mut [PoseResolver], delta_frames: f32) {
    models.par_iter_mut().for_each(|model| model.tick(delta_frames));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::BoneKeyframe;
    use crate::skeleton::AxisLimit;

    fn arm_model() -> ModelDesc {
        ModelDesc {
            bones: vec![
                BoneDesc::new("センター", None, Vec3::ZERO),
                BoneDesc::new("upper", Some(0), Vec3::ZERO),
                BoneDesc::new("lower", Some(1), Vec3::new(0.0, 1.0, 0.0)),
                BoneDesc::new("tip", Some(2), Vec3::new(0.0, 2.0, 0.0)),
                BoneDesc::new("ik", Some(0), Vec3::new(1.2, 0.8, 0.0)),
            ],
            iks: vec![IkDesc {
                destination: 4,
                target: 3,
                chain: vec![2, 1],
                iterations: 100,
                max_angle: 1.0,
            }],
            morphs: vec!["smile".into()],
        }
    }

    fn still_motion(bone: &str, translation: Vec3) -> Arc<Motion> {
        let mut motion = Motion::new();
        motion.insert_bone_keyframe(bone, BoneKeyframe::new(0, translation, Quat::IDENTITY));
        motion.insert_bone_keyframe(bone, BoneKeyframe::new(60, translation, Quat::IDENTITY));
        Arc::new(motion)
    }

    #[test]
    fn test_tick_runs_ik_after_motion() {
        let mut resolver = PoseResolver::new(&arm_model()).unwrap();
        resolver.bones_mut().solver_settings_mut(0).unwrap().distance_epsilon = 1.0e-3;
        let options = MotionOptions { smooth: false, ..MotionOptions::default() };
        // 动作移动 IK 目的地骨骼
        assert!(resolver.start_motion("walk", still_motion("ik", Vec3::new(-0.4, 0.0, 0.0)), options));
        resolver.tick(0.0);

        let destination = resolver.world_pose(4).unwrap().0;
        assert!((destination - Vec3::new(0.8, 0.8, 0.0)).length() < 1e-5);
        let tip = resolver.world_pose(3).unwrap().0;
        assert!((tip - destination).length() < 1e-2, "tip {:?} destination {:?}", tip, destination);
        assert!(matches!(resolver.ik_outcomes()[0], IkOutcome::Converged { .. }));
    }

    #[test]
    fn test_knee_limited_chain_stays_finite() {
        let mut desc = arm_model();
        desc.bones[2].angle_limit = Some(AxisLimit::knee());
        let mut resolver = PoseResolver::new(&desc).unwrap();
        resolver.tick(1.0);
        assert!(resolver.global_transforms().iter().all(|m| m.is_finite()));
    }

    #[test]
    fn test_start_motions_reports_failures() {
        let mut resolver = PoseResolver::new(&arm_model()).unwrap();
        let failed = resolver.start_motions([
            ("ok", still_motion("upper", Vec3::ZERO), MotionOptions::default()),
            ("empty", Arc::new(Motion::new()), MotionOptions::default()),
        ]);
        assert_eq!(failed, vec!["empty".to_string()]);
        assert!(resolver.motions().is_running("ok"));
    }

    #[test]
    fn test_time_accumulates() {
        let mut resolver = PoseResolver::new(&arm_model()).unwrap();
        resolver.tick(1.5);
        resolver.tick(f32::NAN);
        resolver.tick(2.0);
        assert_eq!(resolver.time(), 3.5);
        assert!(!resolver.is_physics_enabled());
    }

    #[test]
    fn test_tick_models_in_parallel() {
        let mut models: Vec<PoseResolver> = (0..4).map(|_| PoseResolver::new(&arm_model()).unwrap()).collect();
        for (i, model) in models.iter_mut().enumerate() {
            let offset = Vec3::new(0.0, i as f32, 0.0);
            let options = MotionOptions { smooth: false, ..MotionOptions::default() };
            model.start_motion("pose", still_motion("センター", offset), options);
        }
        tick_models(&mut models, 1.0);

        for (i, model) in models.iter().enumerate() {
            let center = model.world_pose(0).unwrap().0;
            assert!((center.y - i as f32).abs() < 1e-5);
        }
    }
}

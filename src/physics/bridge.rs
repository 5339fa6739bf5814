//! 物理桥接
//!
//! 把可变帧间隔拆成有上限的固定步长子步，并在骨骼与物理后端之间交换变换。

use glam::Mat4;

use super::config::get_config;
use super::{PhysicsBackend, PhysicsMode};
use crate::skeleton::BoneSet;
use crate::{MmdError, Result};

#[derive(Debug, Clone, Copy)]
struct Binding {
    bone: usize,
    mode: PhysicsMode,
}

/// 物理桥接
pub struct PhysicsBridge {
    backend: Box<dyn PhysicsBackend>,
    bindings: Vec<Binding>,
    /// 固定步长 (秒)
    fixed_step: f32,
    max_substeps: u32,
    enabled: bool,
    last_substeps: u32,
    /// 取回结果缓冲区（复用内存）
    pulled: Vec<(usize, Mat4)>,
}

impl std::fmt::Debug for PhysicsBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicsBridge")
            .field("bindings", &self.bindings)
            .field("fixed_step", &self.fixed_step)
            .field("max_substeps", &self.max_substeps)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl PhysicsBridge {
    /// 以给定模拟帧率创建
    pub fn setup(backend: Box<dyn PhysicsBackend>, simulation_fps: f32) -> Result<Self> {
        if !simulation_fps.is_finite() || simulation_fps <= 0.0 {
            return Err(MmdError::PhysicsSetup(format!("invalid simulation fps {}", simulation_fps)));
        }
        let config = get_config();
        let bindings: Vec<Binding> = backend
            .bindings()
            .into_iter()
            .map(|(bone, mode)| Binding { bone, mode })
            .collect();

        if config.debug_log {
            log::info!("物理桥接: FPS={}, 最大子步={}, 绑定={}", simulation_fps, config.max_substep_count, bindings.len());
        }

        Ok(Self {
            backend,
            bindings,
            fixed_step: 1.0 / simulation_fps,
            max_substeps: config.max_substep_count.max(1),
            enabled: true,
            last_substeps: 0,
            pulled: Vec::new(),
        })
    }

    /// 检查绑定的骨骼是否都存在
    pub fn validate(&self, bone_count: usize) -> Result<()> {
        match self.bindings.iter().find(|b| b.bone >= bone_count) {
            Some(binding) => Err(MmdError::UnknownBone(binding.bone)),
            None => Ok(()),
        }
    }

    pub fn with_max_substeps(mut self, max_substeps: u32) -> Self {
        self.max_substeps = max_substeps.max(1);
        self
    }

    #[inline]
    pub fn fixed_step(&self) -> f32 {
        self.fixed_step
    }

    #[inline]
    pub fn max_substeps(&self) -> u32 {
        self.max_substeps
    }

    /// 上次 update 实际执行的子步数
    #[inline]
    pub fn last_substeps(&self) -> u32 {
        self.last_substeps
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 子步划分：n = ceil(dt / fixed)，限制在 [1, max]；每步不超过固定步长
    pub fn substeps(&self, dt: f32) -> (u32, f32) {
        if !dt.is_finite() || dt <= 0.0 {
            return (0, 0.0);
        }
        // 容差避免 dt 恰为步长整数倍时多出一步
        let wanted = (dt / self.fixed_step - 1.0e-4).ceil();
        let count = if wanted >= self.max_substeps as f32 { self.max_substeps } else { (wanted as u32).max(1) };
        let step = (dt / count as f32).min(self.fixed_step);
        (count, step)
    }

    /// 当前由物理驱动的骨骼
    pub fn simulated_bones(&self) -> impl Iterator<Item = usize> + '_ {
        let enabled = self.enabled;
        self.bindings
            .iter()
            .filter(move |b| enabled && b.mode.is_simulated())
            .map(|b| b.bone)
    }

    /// 在 IK 之前标记模拟骨骼
    pub fn mark_simulated(&self, bones: &mut BoneSet) {
        for bone in self.simulated_bones() {
            bones.set_simulated(bone, true);
        }
    }

    /// 每帧更新：推送运动学骨骼 → 子步模拟 → 取回模拟骨骼并写入骨骼集合
    pub fn update(&mut self, dt: f32, bones: &mut BoneSet) {
        if !self.enabled {
            // 关闭时物理状态持续跟随动画，重新开启时不会跳变
            self.reseed_all(bones);
            self.last_substeps = 0;
            return;
        }

        for binding in self.bindings.iter().filter(|b| !b.mode.is_simulated()) {
            if let Some(world) = bones.world_matrix(binding.bone) {
                self.backend.push_kinematic(binding.bone, world);
            }
        }

        let (count, step) = self.substeps(dt);
        for _ in 0..count {
            self.backend.step(step);
        }
        self.last_substeps = count;

        self.pulled.clear();
        for binding in self.bindings.iter().filter(|b| b.mode.is_simulated()) {
            if self.pulled.iter().any(|(bone, _)| *bone == binding.bone) {
                continue;
            }
            let Some(animated) = bones.world_matrix(binding.bone) else {
                continue;
            };
            if let Some(world) = self.backend.pull_simulated(binding.bone, animated) {
                if world.is_finite() {
                    self.pulled.push((binding.bone, world));
                }
            }
        }
        bones.commit_simulated(&self.pulled);
    }

    /// 开关物理；关闭时所有模拟骨骼交还动画，并以动画姿态重置物理状态
    pub fn set_enabled(&mut self, enabled: bool, bones: &BoneSet) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        self.reseed_all(bones);
        log::debug!("物理{}", if enabled { "开启" } else { "关闭" });
    }

    /// 切换单个骨骼的模式；模拟 → 运动学时以当前骨骼姿态重置物理状态
    pub fn set_bone_mode(&mut self, bone: usize, mode: PhysicsMode, bones: &BoneSet) -> bool {
        let mut found = false;
        for binding in self.bindings.iter_mut().filter(|b| b.bone == bone) {
            let was_simulated = binding.mode.is_simulated();
            binding.mode = mode;
            found = true;
            if was_simulated && !mode.is_simulated() {
                if let Some(world) = bones.world_matrix(bone) {
                    self.backend.reseed(bone, world);
                }
            }
        }
        if found {
            self.backend.set_mode(bone, mode);
        }
        found
    }

    /// 恢复物理初始状态，再把所有绑定对齐到当前骨骼姿态
    pub fn reset(&mut self, bones: &BoneSet) {
        self.backend.reset();
        self.reseed_all(bones);
        log::debug!("物理已重置");
    }

    fn reseed_all(&mut self, bones: &BoneSet) {
        for binding in &self.bindings {
            if let Some(world) = bones.world_matrix(binding.bone) {
                self.backend.reseed(binding.bone, world);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::BoneDesc;
    use glam::Vec3;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Log {
        steps: Vec<f32>,
        pushed: Vec<usize>,
        reseeded: Vec<usize>,
        resets: usize,
    }

    /// 模拟骨骼固定在 (0, -1, 0)
    struct FixedBackend {
        log: Arc<Mutex<Log>>,
    }

    impl PhysicsBackend for FixedBackend {
        fn bindings(&self) -> Vec<(usize, PhysicsMode)> {
            vec![(0, PhysicsMode::Kinematic), (1, PhysicsMode::Simulated)]
        }
        fn push_kinematic(&mut self, bone: usize, _bone_world: Mat4) {
            self.log.lock().unwrap().pushed.push(bone);
        }
        fn step(&mut self, dt: f32) {
            self.log.lock().unwrap().steps.push(dt);
        }
        fn pull_simulated(&self, _bone: usize, _bone_world: Mat4) -> Option<Mat4> {
            Some(Mat4::from_translation(Vec3::new(0.0, -1.0, 0.0)))
        }
        fn reseed(&mut self, bone: usize, _bone_world: Mat4) {
            self.log.lock().unwrap().reseeded.push(bone);
        }
        fn set_mode(&mut self, _bone: usize, _mode: PhysicsMode) {}
        fn reset(&mut self) {
            let mut log = self.log.lock().unwrap();
            log.reseeded.clear();
            log.resets += 1;
        }
    }

    fn setup() -> (PhysicsBridge, Arc<Mutex<Log>>, BoneSet) {
        let log = Arc::new(Mutex::new(Log::default()));
        let bridge = PhysicsBridge::setup(Box::new(FixedBackend { log: log.clone() }), 60.0)
            .unwrap()
            .with_max_substeps(4);
        let bones = BoneSet::build(
            &[
                BoneDesc::new("root", None, Vec3::ZERO),
                BoneDesc::new("hair", Some(0), Vec3::Y),
                BoneDesc::new("hair_tip", Some(1), Vec3::Y * 2.0),
            ],
            &[],
        )
        .unwrap();
        (bridge, log, bones)
    }

    #[test]
    fn test_invalid_fps_is_rejected() {
        let log = Arc::new(Mutex::new(Log::default()));
        let result = PhysicsBridge::setup(Box::new(FixedBackend { log }), 0.0);
        assert!(matches!(result, Err(MmdError::PhysicsSetup(_))));
    }

    #[test]
    fn test_substeps_are_bounded() {
        let (bridge, _, _) = setup();
        let fixed = bridge.fixed_step();

        let (count, step) = bridge.substeps(1.0 / 30.0);
        assert_eq!(count, 2);
        assert!(step <= fixed + 1e-7);

        // 超过上限时丢弃多余时间，每步仍不超过固定步长
        let (count, step) = bridge.substeps(1.0);
        assert_eq!(count, 4);
        assert!(step <= fixed + 1e-7);

        assert_eq!(bridge.substeps(0.0), (0, 0.0));
        assert_eq!(bridge.substeps(-1.0).0, 0);
    }

    #[test]
    fn test_update_pushes_steps_and_pulls() {
        let (mut bridge, log, mut bones) = setup();
        bridge.update(1.0 / 30.0, &mut bones);

        let log = log.lock().unwrap();
        assert_eq!(log.pushed, vec![0]);
        assert_eq!(log.steps.len(), 2);
        assert!(bones.get_bone(1).unwrap().is_simulated());
        assert!((bones.get_bone(1).unwrap().position() - Vec3::new(0.0, -1.0, 0.0)).length() < 1e-6);
        // 子骨骼跟随模拟骨骼
        assert!((bones.get_bone(2).unwrap().position() - Vec3::ZERO).length() < 1e-6);
    }

    #[test]
    fn test_disable_reseeds_and_skips_stepping() {
        let (mut bridge, log, mut bones) = setup();
        bridge.set_enabled(false, &bones);
        assert_eq!(bridge.simulated_bones().count(), 0);

        bridge.update(1.0 / 30.0, &mut bones);
        assert_eq!(bridge.last_substeps(), 0);
        assert!(!bones.get_bone(1).unwrap().is_simulated());

        let log = log.lock().unwrap();
        assert!(log.steps.is_empty());
        assert!(log.reseeded.contains(&1));
    }

    #[test]
    fn test_set_bone_mode_reseeds_on_handback() {
        let (mut bridge, log, bones) = setup();
        assert!(bridge.set_bone_mode(1, PhysicsMode::Kinematic, &bones));
        assert!(!bridge.set_bone_mode(7, PhysicsMode::Kinematic, &bones));
        assert_eq!(log.lock().unwrap().reseeded, vec![1]);
        assert_eq!(bridge.simulated_bones().count(), 0);
    }

    #[test]
    fn test_reset_reseeds_from_current_pose() {
        let (mut bridge, log, mut bones) = setup();
        bridge.update(1.0 / 30.0, &mut bones);
        log.lock().unwrap().reseeded.push(99);

        bridge.reset(&bones);
        let log = log.lock().unwrap();
        assert_eq!(log.resets, 1);
        // 后端重置之后才重新对齐
        assert_eq!(log.reseeded, vec![0, 1]);
    }

    #[test]
    fn test_validate_unknown_bone() {
        let (bridge, _, _) = setup();
        assert!(bridge.validate(3).is_ok());
        assert!(matches!(bridge.validate(1), Err(MmdError::UnknownBone(1))));
    }
}

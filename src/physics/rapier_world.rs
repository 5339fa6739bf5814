//! Rapier3D 物理世界
//!
//! 每个刚体绑定一根骨骼，记录刚体相对骨骼的偏移矩阵。
//! 碰撞体只用于质量与简单接触（球体），关节为球铰。

use std::collections::HashMap;

use glam::{Mat4, Quat, Vec3};
use rapier3d::na::{Quaternion, Translation3, UnitQuaternion};
use rapier3d::prelude::*;

use super::config::get_config;
use super::{PhysicsBackend, PhysicsMode};
use crate::{MmdError, Result};

/// Rapier Isometry 类型别名
pub type Pose = Isometry<Real>;

// ============================================================================
// 加载描述
// ============================================================================

/// 刚体描述
#[derive(Debug, Clone)]
pub struct BodyDesc {
    pub name: String,
    /// 关联的骨骼索引
    pub bone: usize,
    pub mode: PhysicsMode,
    /// 球体半径
    pub radius: f32,
    pub mass: f32,
    /// 初始姿态下刚体的世界变换（模型空间）
    pub transform: Mat4,
    pub linear_damping: f32,
    pub angular_damping: f32,
    /// 碰撞组 (0..15)
    pub group: u8,
    /// 碰撞掩码
    pub group_mask: u16,
}

impl BodyDesc {
    pub fn new(name: impl Into<String>, bone: usize, mode: PhysicsMode, transform: Mat4) -> Self {
        Self {
            name: name.into(),
            bone,
            mode,
            radius: 0.5,
            mass: 1.0,
            transform,
            linear_damping: 0.5,
            angular_damping: 0.5,
            group: 0,
            group_mask: 0,
        }
    }
}

/// 球铰关节描述
#[derive(Debug, Clone)]
pub struct JointDesc {
    pub name: String,
    pub body_a: usize,
    pub body_b: usize,
    /// 关节锚点（模型空间）
    pub anchor: Vec3,
}

// ============================================================================
// 刚体
// ============================================================================

#[derive(Debug, Clone)]
struct RapierBody {
    name: String,
    bone: usize,
    mode: PhysicsMode,
    handle: RigidBodyHandle,
    /// 刚体相对于骨骼的偏移矩阵
    offset: Mat4,
    inv_offset: Mat4,
    initial: Pose,
}

impl RapierBody {
    fn body_type(mode: PhysicsMode) -> RigidBodyType {
        match mode {
            PhysicsMode::Kinematic => RigidBodyType::KinematicPositionBased,
            PhysicsMode::Simulated | PhysicsMode::SimulatedWithBonePosition => RigidBodyType::Dynamic,
        }
    }

    /// 根据骨骼全局变换计算刚体应有的世界变换
    fn body_pose(&self, bone_world: Mat4) -> Pose {
        mat4_to_isometry(bone_world * self.offset)
    }

    /// 从刚体的世界变换反推骨骼的全局变换
    fn bone_world(&self, pose: &Pose, animated: Mat4) -> Mat4 {
        let mut world = isometry_to_mat4(pose) * self.inv_offset;
        if self.mode == PhysicsMode::SimulatedWithBonePosition {
            // 只取旋转，位置保留动画结果
            world.w_axis = animated.w_axis;
        }
        world
    }
}

// ============================================================================
// 物理世界
// ============================================================================

/// Rapier3D 物理世界
pub struct RapierWorld {
    pipeline: PhysicsPipeline,
    integration_parameters: IntegrationParameters,
    island_manager: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    rigid_body_set: RigidBodySet,
    collider_set: ColliderSet,
    impulse_joint_set: ImpulseJointSet,
    multibody_joint_set: MultibodyJointSet,
    ccd_solver: CCDSolver,
    query_pipeline: QueryPipeline,
    gravity: Vector<Real>,
    bodies: Vec<RapierBody>,
    /// 骨骼 → 刚体索引
    bone_to_bodies: HashMap<usize, Vec<usize>>,
    joint_count: usize,
    max_linear_velocity: f32,
    max_angular_velocity: f32,
}

impl RapierWorld {
    /// 创建空的物理世界（参数来自全局配置）
    pub fn new() -> Self {
        let config = get_config();

        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = 1.0 / config.physics_fps.max(1.0);
        integration_parameters.num_solver_iterations =
            std::num::NonZeroUsize::new(config.solver_iterations.max(1)).unwrap_or(std::num::NonZeroUsize::MIN);

        Self {
            pipeline: PhysicsPipeline::new(),
            integration_parameters,
            island_manager: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            rigid_body_set: RigidBodySet::new(),
            collider_set: ColliderSet::new(),
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
            gravity: vector![0.0, config.gravity_y, 0.0],
            bodies: Vec::new(),
            bone_to_bodies: HashMap::new(),
            joint_count: 0,
            max_linear_velocity: config.max_linear_velocity,
            max_angular_velocity: config.max_angular_velocity,
        }
    }

    /// 一次性创建所有刚体和关节
    ///
    /// `bone_world` 为初始姿态下的骨骼世界矩阵，用于计算刚体相对骨骼的偏移。
    pub fn build(bodies: &[BodyDesc], joints: &[JointDesc], bone_world: &[Mat4]) -> Result<Self> {
        let config = get_config();
        let mut world = Self::new();

        for desc in bodies {
            let bone = *bone_world.get(desc.bone).ok_or(MmdError::UnknownBone(desc.bone))?;
            world.add_body(desc, bone, &config)?;
        }

        if config.joints_enabled {
            for joint in joints {
                world.add_joint(joint)?;
            }
        }

        log::info!(
            "物理世界构建完成: {} 个刚体, {} 个关节",
            world.bodies.len(),
            world.joint_count
        );
        Ok(world)
    }

    fn add_body(&mut self, desc: &BodyDesc, bone_world: Mat4, config: &super::PhysicsConfig) -> Result<usize> {
        if !(desc.radius > 0.0) || !desc.transform.is_finite() {
            return Err(MmdError::PhysicsSetup(format!("rigid body '{}' has an invalid shape", desc.name)));
        }

        let initial = mat4_to_isometry(desc.transform);
        let rigid_body = RigidBodyBuilder::new(RapierBody::body_type(desc.mode))
            .position(initial)
            .linear_damping(desc.linear_damping * config.linear_damping_scale)
            .angular_damping(desc.angular_damping * config.angular_damping_scale)
            .can_sleep(false)
            .build();
        let handle = self.rigid_body_set.insert(rigid_body);

        let groups = InteractionGroups::new(
            Group::from_bits_truncate(1 << desc.group.min(15)),
            Group::from_bits_truncate(desc.group_mask as u32),
        );
        let builder = ColliderBuilder::ball(desc.radius)
            .collision_groups(groups)
            .solver_groups(groups);
        let collider = if desc.mode == PhysicsMode::Kinematic {
            builder.density(0.0)
        } else {
            builder.mass(desc.mass.max(1.0e-3) * config.mass_scale)
        };
        self.collider_set
            .insert_with_parent(collider.build(), handle, &mut self.rigid_body_set);

        let offset = bone_world.inverse() * desc.transform;
        let index = self.bodies.len();
        self.bodies.push(RapierBody {
            name: desc.name.clone(),
            bone: desc.bone,
            mode: desc.mode,
            handle,
            offset,
            inv_offset: offset.inverse(),
            initial,
        });
        self.bone_to_bodies.entry(desc.bone).or_default().push(index);
        Ok(index)
    }

    fn add_joint(&mut self, desc: &JointDesc) -> Result<()> {
        let missing = |index: usize| MmdError::PhysicsSetup(format!("joint '{}' references missing body #{}", desc.name, index));
        let a = self.bodies.get(desc.body_a).ok_or_else(|| missing(desc.body_a))?;
        let b = self.bodies.get(desc.body_b).ok_or_else(|| missing(desc.body_b))?;

        let anchor = point![desc.anchor.x, desc.anchor.y, desc.anchor.z];
        let local_a = a.initial.inverse_transform_point(&anchor);
        let local_b = b.initial.inverse_transform_point(&anchor);
        let joint = SphericalJointBuilder::new()
            .local_anchor1(local_a)
            .local_anchor2(local_b)
            .build();
        self.impulse_joint_set.insert(a.handle, b.handle, joint, true);
        self.joint_count += 1;
        Ok(())
    }

    // ========================================
    // 查询与控制
    // ========================================

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn joint_count(&self) -> usize {
        self.joint_count
    }

    pub fn body_names(&self) -> impl Iterator<Item = &str> {
        self.bodies.iter().map(|b| b.name.as_str())
    }

    pub fn set_gravity(&mut self, gravity: Vec3) {
        self.gravity = vector![gravity.x, gravity.y, gravity.z];
    }

    pub fn gravity(&self) -> Vec3 {
        Vec3::new(self.gravity.x, self.gravity.y, self.gravity.z)
    }

    /// 刚体当前世界变换
    pub fn body_transform(&self, index: usize) -> Option<Mat4> {
        let body = self.bodies.get(index)?;
        self.rigid_body_set.get(body.handle).map(|rb| isometry_to_mat4(rb.position()))
    }

    pub fn body_linear_velocity(&self, index: usize) -> Option<Vec3> {
        let body = self.bodies.get(index)?;
        self.rigid_body_set.get(body.handle).map(|rb| {
            let v = rb.linvel();
            Vec3::new(v.x, v.y, v.z)
        })
    }

    pub fn set_body_linear_velocity(&mut self, index: usize, velocity: Vec3) {
        if let Some(body) = self.bodies.get(index) {
            if let Some(rb) = self.rigid_body_set.get_mut(body.handle) {
                rb.set_linvel(vector![velocity.x, velocity.y, velocity.z], true);
            }
        }
    }

    /// 限制刚体速度，防止物理爆炸
    fn clamp_velocities(&mut self) {
        for body in self.bodies.iter().filter(|b| b.mode.is_simulated()) {
            let Some(rb) = self.rigid_body_set.get_mut(body.handle) else {
                continue;
            };

            let linvel = *rb.linvel();
            let speed = linvel.norm();
            if speed > self.max_linear_velocity {
                rb.set_linvel(linvel * (self.max_linear_velocity / speed), true);
            }

            let angvel = *rb.angvel();
            let spin = angvel.norm();
            if spin > self.max_angular_velocity {
                rb.set_angvel(angvel * (self.max_angular_velocity / spin), true);
            }
        }
    }

    fn teleport(rigid_body_set: &mut RigidBodySet, handle: RigidBodyHandle, pose: Pose) {
        if let Some(rb) = rigid_body_set.get_mut(handle) {
            rb.set_position(pose, true);
            rb.set_linvel(Vector::<Real>::zeros(), true);
            rb.set_angvel(Vector::<Real>::zeros(), true);
        }
    }
}

impl Default for RapierWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicsBackend for RapierWorld {
    fn bindings(&self) -> Vec<(usize, PhysicsMode)> {
        self.bodies.iter().map(|b| (b.bone, b.mode)).collect()
    }

    fn push_kinematic(&mut self, bone: usize, bone_world: Mat4) {
        let Some(indices) = self.bone_to_bodies.get(&bone) else {
            return;
        };
        for &index in indices {
            let body = &self.bodies[index];
            if body.mode != PhysicsMode::Kinematic {
                continue;
            }
            if let Some(rb) = self.rigid_body_set.get_mut(body.handle) {
                rb.set_next_kinematic_position(body.body_pose(bone_world));
            }
        }
    }

    fn step(&mut self, dt: f32) {
        self.integration_parameters.dt = dt;
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            Some(&mut self.query_pipeline),
            &(),
            &(),
        );
        self.clamp_velocities();
    }

    fn pull_simulated(&self, bone: usize, bone_world: Mat4) -> Option<Mat4> {
        let body = self
            .bone_to_bodies
            .get(&bone)?
            .iter()
            .map(|&i| &self.bodies[i])
            .find(|b| b.mode.is_simulated())?;
        let rb = self.rigid_body_set.get(body.handle)?;
        Some(body.bone_world(rb.position(), bone_world))
    }

    fn reseed(&mut self, bone: usize, bone_world: Mat4) {
        let Some(indices) = self.bone_to_bodies.get(&bone) else {
            return;
        };
        for &index in indices {
            let body = &self.bodies[index];
            Self::teleport(&mut self.rigid_body_set, body.handle, body.body_pose(bone_world));
        }
    }

    fn set_mode(&mut self, bone: usize, mode: PhysicsMode) {
        let Some(indices) = self.bone_to_bodies.get(&bone) else {
            return;
        };
        for &index in indices {
            let body = &mut self.bodies[index];
            body.mode = mode;
            if let Some(rb) = self.rigid_body_set.get_mut(body.handle) {
                rb.set_body_type(RapierBody::body_type(mode), true);
            }
        }
    }

    /// 重置所有刚体到初始状态
    fn reset(&mut self) {
        for body in &self.bodies {
            Self::teleport(&mut self.rigid_body_set, body.handle, body.initial);
        }
    }
}

// ============================================================================
// glam ↔ Rapier 转换
// ============================================================================

/// 将 glam Mat4 转换为 Rapier Isometry
pub fn mat4_to_isometry(mat: Mat4) -> Pose {
    let (_, rotation, translation) = mat.to_scale_rotation_translation();
    let rotation = rotation.normalize();
    Isometry::from_parts(
        Translation3::new(translation.x, translation.y, translation.z),
        UnitQuaternion::from_quaternion(Quaternion::new(rotation.w, rotation.x, rotation.y, rotation.z)),
    )
}

/// 将 Rapier Isometry 转换为 glam Mat4
pub fn isometry_to_mat4(iso: &Pose) -> Mat4 {
    let t = iso.translation.vector;
    // UnitQuaternion: coords 包含 [i, j, k, w]
    let q = iso.rotation.coords;
    Mat4::from_rotation_translation(Quat::from_xyzw(q[0], q[1], q[2], q[3]), Vec3::new(t.x, t.y, t.z))
}

//! 动作播放管理器
//!
//! 管理多个同时播放的动作（按名称区分的播放槽）：
//! - 生命周期：开始 → 播放/循环 → 结束淡出 → 待删除 → 下次 update 清除
//! - 合成：按优先级升序叠加，高优先级的播放器覆盖低优先级的同名骨骼
//! - 重定位：循环行走类动作累积中心骨骼偏移

use std::sync::Arc;

use glam::{Quat, Vec3};

use super::motion::Motion;
use super::motion_controller::MotionController;
use crate::morph::MorphManager;
use crate::skeleton::BoneSet;

// ============================================================================
// 选项、状态与事件
// ============================================================================

/// 动作开始选项
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionOptions {
    /// 全身动作；为 false 时忽略只有一个关键帧的静态轨道
    pub full_body: bool,
    /// 只播放一次（结束后淡出并删除）
    pub once: bool,
    /// 开始/循环/回退时通过快照平滑过渡
    pub smooth: bool,
    /// 保持角色当前位置继续播放
    pub reposition: bool,
    /// 优先级，越大越优先
    pub priority: i32,
    /// 循环起始帧
    pub loop_at: f32,
    /// 骨骼结束淡出帧数
    pub ending_bone_blend_frames: f32,
    /// 表情结束淡出帧数
    pub ending_face_blend_frames: f32,
    /// 混合权重 0..1
    pub weight: f32,
}

impl Default for MotionOptions {
    fn default() -> Self {
        Self {
            full_body: true,
            once: false,
            smooth: true,
            reposition: false,
            priority: 0,
            loop_at: 0.0,
            ending_bone_blend_frames: 20.0,
            ending_face_blend_frames: 5.0,
            weight: 1.0,
        }
    }
}

/// 播放器状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerState {
    Running,
    /// 本次 update 中发生了循环
    Looped,
    /// 结束淡出中
    Ending,
    /// 等待下次 update 清除
    PendingDelete,
}

/// 生命周期通知
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MotionEvent {
    Started(String),
    Looped(String),
    /// 单次动作播放到末尾，开始淡出
    CompletionPending(String),
    Purged(String),
}

// ============================================================================
// 播放器
// ============================================================================

#[derive(Clone, Debug)]
struct MotionPlayer {
    name: String,
    controller: MotionController,
    options: MotionOptions,
    state: PlayerState,
    current_frame: f32,
    previous_frame: f32,
    ending_bone_left: f32,
    ending_face_left: f32,
    center_offset: Vec3,
    /// 中心骨骼从外部指定的位置开始
    override_center: bool,
    sequence: u64,
}

impl MotionPlayer {
    fn is_active(&self) -> bool {
        self.state != PlayerState::PendingDelete
    }

    fn ending_ratio(left: f32, total: f32) -> f32 {
        if total <= 0.0 {
            0.0
        } else {
            (left / total).clamp(0.0, 1.0)
        }
    }

    fn bone_weight(&self) -> f32 {
        let fade = match self.state {
            PlayerState::Running | PlayerState::Looped => 1.0,
            PlayerState::Ending => Self::ending_ratio(self.ending_bone_left, self.options.ending_bone_blend_frames),
            PlayerState::PendingDelete => 0.0,
        };
        fade * self.options.weight
    }

    fn face_weight(&self) -> f32 {
        let fade = match self.state {
            PlayerState::Running | PlayerState::Looped => 1.0,
            PlayerState::Ending => Self::ending_ratio(self.ending_face_left, self.options.ending_face_blend_frames),
            PlayerState::PendingDelete => 0.0,
        };
        fade * self.options.weight
    }

    fn begin_ending(&mut self) {
        self.ending_bone_left = self.options.ending_bone_blend_frames.max(0.0);
        self.ending_face_left = self.options.ending_face_blend_frames.max(0.0);
        self.state = if self.ending_bone_left <= 0.0 && self.ending_face_left <= 0.0 {
            PlayerState::PendingDelete
        } else {
            PlayerState::Ending
        };
    }

    /// 中心骨骼是否叠加偏移
    fn offsets_center(&self) -> bool {
        self.options.reposition || self.override_center
    }

    fn snapshot(&mut self, bones: &BoneSet, morphs: &MorphManager) {
        let center = bones.center_bone().map(|c| (c, self.center_offset));
        self.controller.take_snap(bones, morphs, center);
    }

    /// 中心骨骼在两帧之间的水平位移
    fn center_travel(&self, center: Option<usize>, from: f32, to: f32) -> Vec3 {
        let travel = center
            .and_then(|c| Some(self.controller.sample_bone(c, to)?.0 - self.controller.sample_bone(c, from)?.0))
            .unwrap_or(Vec3::ZERO);
        Vec3::new(travel.x, 0.0, travel.z)
    }

    /// 推进时间并求值，返回生命周期是否变化
    fn advance(&mut self, delta: f32, bones: &BoneSet, morphs: &MorphManager, events: &mut Vec<MotionEvent>) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut changed = false;
        self.controller.advance_snap(delta);

        // 回退（时间倒流或外部设置了更早的帧）走快照路径
        let backward = delta < 0.0 || self.current_frame < self.previous_frame;
        if backward && self.options.smooth {
            self.snapshot(bones, morphs);
        }

        self.current_frame = (self.current_frame + delta).max(0.0);
        if self.state == PlayerState::Looped {
            self.state = PlayerState::Running;
        }

        let max_frame = self.controller.max_frame();
        match self.state {
            PlayerState::Running if self.options.once => {
                if self.current_frame >= max_frame {
                    self.current_frame = max_frame;
                    self.begin_ending();
                    events.push(MotionEvent::CompletionPending(self.name.clone()));
                    log::debug!("动作 '{}' 播放完毕，开始淡出", self.name);
                    changed = true;
                }
            }
            PlayerState::Running => {
                let loop_at = self.options.loop_at.clamp(0.0, max_frame);
                let span = max_frame - loop_at;
                if self.current_frame > max_frame {
                    if span > 0.0 {
                        let overflow = (self.current_frame - max_frame).rem_euclid(span);
                        self.current_frame = loop_at + overflow;
                        if self.options.reposition {
                            self.center_offset += self.center_travel(bones.center_bone(), loop_at, max_frame);
                        }
                        if self.options.smooth {
                            self.snapshot(bones, morphs);
                        }
                        self.state = PlayerState::Looped;
                        events.push(MotionEvent::Looped(self.name.clone()));
                        changed = true;
                    } else {
                        self.current_frame = max_frame;
                    }
                }
            }
            PlayerState::Ending => {
                self.current_frame = self.current_frame.min(max_frame);
                let step = delta.max(0.0);
                self.ending_bone_left = (self.ending_bone_left - step).max(0.0);
                self.ending_face_left = (self.ending_face_left - step).max(0.0);
                if self.ending_bone_left <= 0.0 && self.ending_face_left <= 0.0 {
                    self.state = PlayerState::PendingDelete;
                    changed = true;
                }
            }
            PlayerState::Looped | PlayerState::PendingDelete => {}
        }

        self.controller.evaluate(self.current_frame);
        self.previous_frame = self.current_frame;
        changed
    }
}

// ============================================================================
// 管理器
// ============================================================================

/// 动作播放管理器
#[derive(Clone, Debug, Default)]
pub struct MotionManager {
    players: Vec<MotionPlayer>,
    events: Vec<MotionEvent>,
    last_time: Option<f32>,
    next_sequence: u64,
}

impl MotionManager {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================
    // 生命周期
    // ========================================

    /// 开始播放动作；同名播放器会被替换
    ///
    /// 动作没有关键帧时返回 false，播放状态不变。
    pub fn start_motion(
        &mut self,
        name: &str,
        motion: Arc<Motion>,
        options: MotionOptions,
        bones: &BoneSet,
        morphs: &MorphManager,
    ) -> bool {
        if motion.is_empty() {
            log::warn!("动作 '{}' 没有关键帧，忽略", name);
            return false;
        }

        let controller = MotionController::new(motion, bones, morphs, !options.full_body);
        let center = bones.center_bone();
        let center_offset = match (options.reposition, center) {
            (true, Some(c)) => {
                let current = bones.bone_animation(c).map(|(t, _)| t).unwrap_or(Vec3::ZERO);
                let start = controller.sample_bone(c, 0.0).map(|(t, _)| t).unwrap_or(Vec3::ZERO);
                Vec3::new(current.x - start.x, 0.0, current.z - start.z)
            }
            _ => Vec3::ZERO,
        };

        let mut player = MotionPlayer {
            name: name.to_string(),
            controller,
            options,
            state: PlayerState::Running,
            current_frame: 0.0,
            previous_frame: 0.0,
            ending_bone_left: 0.0,
            ending_face_left: 0.0,
            center_offset,
            override_center: false,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        if options.smooth {
            player.snapshot(bones, morphs);
        }

        let replaced = match self.players.iter_mut().find(|p| p.name == name) {
            Some(slot) => {
                *slot = player;
                true
            }
            None => {
                self.players.push(player);
                false
            }
        };
        log::debug!("动作 '{}' 开始播放 (替换: {})", name, replaced);
        self.events.push(MotionEvent::Started(name.to_string()));
        true
    }

    /// 替换正在播放的动作数据，保留时间与混合状态
    pub fn swap_motion(&mut self, name: &str, motion: Arc<Motion>, bones: &BoneSet, morphs: &MorphManager) -> bool {
        if motion.is_empty() {
            log::warn!("动作 '{}' 没有关键帧，忽略替换", name);
            return false;
        }
        match self.player_mut(name) {
            Some(player) => {
                player.controller.rebind(motion, bones, morphs);
                true
            }
            None => false,
        }
    }

    /// 标记删除：开始结束淡出
    ///
    /// 已在淡出中时保持原淡出进度；已等待清除的播放器返回 false。
    pub fn delete_motion(&mut self, name: &str) -> bool {
        let Some(player) = self.players.iter_mut().find(|p| p.name == name) else {
            return false;
        };
        match player.state {
            PlayerState::PendingDelete => false,
            PlayerState::Ending => true,
            PlayerState::Running | PlayerState::Looped => {
                player.begin_ending();
                log::debug!("动作 '{}' 被删除，开始淡出", name);
                self.events.push(MotionEvent::CompletionPending(name.to_string()));
                true
            }
        }
    }

    /// 立即移除所有播放器
    pub fn clear(&mut self) {
        for player in self.players.drain(..) {
            self.events.push(MotionEvent::Purged(player.name));
        }
    }

    /// 每帧更新
    ///
    /// `absolute_time` 为累计帧数。先清除上次标记删除的播放器，再推进所有播放器，
    /// 最后按优先级合成并写入骨骼/Morph。返回是否有生命周期变化。
    pub fn update(&mut self, absolute_time: f32, bones: &mut BoneSet, morphs: &mut MorphManager) -> bool {
        let mut changed = self.purge();

        let delta = self.last_time.map(|t| absolute_time - t).unwrap_or(0.0);
        self.last_time = Some(absolute_time);

        for player in &mut self.players {
            changed |= player.advance(delta, bones, morphs, &mut self.events);
        }

        self.resolve(bones, morphs);
        changed
    }

    fn purge(&mut self) -> bool {
        let before = self.players.len();
        let events = &mut self.events;
        self.players.retain(|player| {
            if player.is_active() {
                return true;
            }
            log::debug!("动作 '{}' 已清除", player.name);
            events.push(MotionEvent::Purged(player.name.clone()));
            false
        });
        before != self.players.len()
    }

    /// 按优先级合成所有播放器的结果
    fn resolve(&self, bones: &mut BoneSet, morphs: &mut MorphManager) {
        let mut bone_acc = vec![(Vec3::ZERO, Quat::IDENTITY); bones.bone_count()];
        let mut morph_acc = vec![0.0_f32; morphs.morph_count()];
        let center = bones.center_bone();

        let mut order: Vec<&MotionPlayer> = self.players.iter().filter(|p| p.is_active()).collect();
        order.sort_by_key(|p| (p.options.priority, p.sequence));

        for player in &order {
            let weight = player.bone_weight();
            if weight > 0.0 {
                for sample in player.controller.bone_output() {
                    let is_center = Some(sample.bone) == center;
                    let translation = if is_center && player.offsets_center() {
                        sample.translation + player.center_offset
                    } else {
                        sample.translation
                    };
                    blend_bone(&mut bone_acc[sample.bone], translation, sample.rotation, weight);
                }
            }

            let weight = player.face_weight();
            if weight > 0.0 {
                for sample in player.controller.morph_output() {
                    let acc = &mut morph_acc[sample.morph];
                    *acc = if weight >= 1.0 { sample.weight } else { *acc + (sample.weight - *acc) * weight };
                }
            }
        }

        for (index, (translation, rotation)) in bone_acc.into_iter().enumerate() {
            bones.set_bone_animation(index, translation, rotation);
        }
        for (index, weight) in morph_acc.into_iter().enumerate() {
            morphs.set_morph_weight(index, weight);
        }
    }

    // ========================================
    // 播放器控制
    // ========================================

    fn player(&self, name: &str) -> Option<&MotionPlayer> {
        self.players.iter().find(|p| p.name == name)
    }

    fn player_mut(&mut self, name: &str) -> Option<&mut MotionPlayer> {
        self.players.iter_mut().find(|p| p.name == name)
    }

    pub fn set_priority(&mut self, name: &str, priority: i32) -> bool {
        self.player_mut(name).map(|p| p.options.priority = priority).is_some()
    }

    pub fn set_weight(&mut self, name: &str, weight: f32) -> bool {
        self.player_mut(name).map(|p| p.options.weight = weight.clamp(0.0, 1.0)).is_some()
    }

    pub fn set_loop_at(&mut self, name: &str, frame: f32) -> bool {
        self.player_mut(name).map(|p| p.options.loop_at = frame.max(0.0)).is_some()
    }

    pub fn set_ending_blend_frames(&mut self, name: &str, bone_frames: f32, face_frames: f32) -> bool {
        self.player_mut(name)
            .map(|p| {
                p.options.ending_bone_blend_frames = bone_frames.max(0.0);
                p.options.ending_face_blend_frames = face_frames.max(0.0);
            })
            .is_some()
    }

    /// 让动作的中心骨骼从 `center` 开始，之后只叠加动作自身的位移
    ///
    /// 动作不驱动中心骨骼或模型没有中心骨骼时返回 false。
    pub fn set_override_first(&mut self, name: &str, center: Vec3, bones: &BoneSet) -> bool {
        let Some(c) = bones.center_bone() else {
            return false;
        };
        let Some(player) = self.player_mut(name) else {
            return false;
        };
        let Some((start, _)) = player.controller.sample_bone(c, player.current_frame) else {
            return false;
        };
        player.center_offset = center - start;
        player.override_center = true;
        // 快照过渡不应把中心骨骼拉回旧位置
        player.controller.set_snap_translation(c, start);
        log::debug!("动作 '{}' 中心骨骼从 {:?} 开始", name, center);
        true
    }

    pub fn is_override_first(&self, name: &str) -> bool {
        self.player(name).is_some_and(|p| p.override_center)
    }

    /// 是否在播放（含淡出中）
    pub fn is_running(&self, name: &str) -> bool {
        self.player(name).map(|p| p.is_active()).unwrap_or(false)
    }

    pub fn player_state(&self, name: &str) -> Option<PlayerState> {
        self.player(name).map(|p| p.state)
    }

    pub fn player_names(&self) -> impl Iterator<Item = &str> {
        self.players.iter().map(|p| p.name.as_str())
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// 当前有效骨骼权重（含结束淡出）
    pub fn bone_weight(&self, name: &str) -> Option<f32> {
        self.player(name).map(|p| p.bone_weight())
    }

    pub fn face_weight(&self, name: &str) -> Option<f32> {
        self.player(name).map(|p| p.face_weight())
    }

    pub fn current_frame(&self, name: &str) -> Option<f32> {
        self.player(name).map(|p| p.current_frame)
    }

    /// 设置当前帧；早于上次求值的帧时，下次 update 走快照路径
    pub fn set_current_frame(&mut self, name: &str, frame: f32) -> bool {
        self.player_mut(name).map(|p| p.current_frame = frame.max(0.0)).is_some()
    }

    /// 上次求值的帧
    pub fn previous_frame(&self, name: &str) -> Option<f32> {
        self.player(name).map(|p| p.previous_frame)
    }

    pub fn set_previous_frame(&mut self, name: &str, frame: f32) -> bool {
        self.player_mut(name).map(|p| p.previous_frame = frame.max(0.0)).is_some()
    }

    /// 中心骨骼偏移（重定位累计或指定起点）
    pub fn center_offset(&self, name: &str) -> Option<Vec3> {
        self.player(name).map(|p| p.center_offset)
    }

    /// 取出所有待处理通知
    pub fn drain_events(&mut self) -> Vec<MotionEvent> {
        std::mem::take(&mut self.events)
    }
}

/// weight >= 1 时直接覆盖，否则在已有结果上插值
#[inline]
fn blend_bone(acc: &mut (Vec3, Quat), translation: Vec3, rotation: Quat, weight: f32) {
    if weight >= 1.0 {
        *acc = (translation, rotation);
    } else {
        acc.0 = acc.0.lerp(translation, weight);
        acc.1 = acc.1.slerp(rotation, weight).normalize();
    }
}

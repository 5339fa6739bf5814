//! Morph 管理器

use std::collections::HashMap;

/// 单个 Morph 的运行时状态
#[derive(Clone, Debug, PartialEq)]
pub struct Morph {
    pub name: String,
    pub weight: f32,
}

impl Morph {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), weight: 0.0 }
    }

    #[inline]
    pub fn set_weight(&mut self, weight: f32) {
        self.weight = weight;
    }

    #[inline]
    pub fn reset(&mut self) {
        self.weight = 0.0;
    }
}

/// Morph 管理器
#[derive(Clone, Debug, Default)]
pub struct MorphManager {
    morphs: Vec<Morph>,
    name_to_index: HashMap<String, usize>,
}

impl MorphManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由名称列表创建；重名的 Morph 只保留第一个的名称索引
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut manager = Self::new();
        for name in names {
            manager.add_morph(Morph::new(name));
        }
        manager
    }

    /// 添加 Morph
    pub fn add_morph(&mut self, morph: Morph) {
        let index = self.morphs.len();
        self.name_to_index.entry(morph.name.clone()).or_insert(index);
        self.morphs.push(morph);
    }

    /// 通过名称查找 Morph
    pub fn find_morph_by_name(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn morph_count(&self) -> usize {
        self.morphs.len()
    }

    pub fn get_morph(&self, index: usize) -> Option<&Morph> {
        self.morphs.get(index)
    }

    /// 设置 Morph 权重
    pub fn set_morph_weight(&mut self, index: usize, weight: f32) {
        if let Some(morph) = self.morphs.get_mut(index) {
            morph.set_weight(weight);
        }
    }

    /// 获取 Morph 权重
    pub fn get_morph_weight(&self, index: usize) -> f32 {
        self.morphs.get(index).map(|m| m.weight).unwrap_or(0.0)
    }

    /// 所有权重（按索引）
    pub fn weights(&self) -> Vec<f32> {
        self.morphs.iter().map(|m| m.weight).collect()
    }

    /// 重置所有 Morph 权重
    pub fn reset_all_weights(&mut self) {
        for morph in &mut self.morphs {
            morph.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_by_name() {
        let mut manager = MorphManager::from_names(["あ", "い", "まばたき"]);
        let blink = manager.find_morph_by_name("まばたき").unwrap();
        manager.set_morph_weight(blink, 0.75);
        manager.set_morph_weight(99, 1.0);

        assert_eq!(manager.morph_count(), 3);
        assert_eq!(manager.get_morph_weight(blink), 0.75);
        assert_eq!(manager.get_morph_weight(99), 0.0);

        manager.reset_all_weights();
        assert!(manager.weights().iter().all(|&w| w == 0.0));
    }
}

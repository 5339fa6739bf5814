//! 表情（Morph）系统
//!
//! 只维护每个 Morph 的权重；顶点/材质变形由渲染端负责。

mod manager;

pub use manager::{Morph, MorphManager};

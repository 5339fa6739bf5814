//! 贝塞尔曲线
//!
//! VMD 关键帧的缓动曲线。端点固定为 (0,0) 和 (1,1)，两个控制点在 [0,1]² 内。
//! 求值时先用牛顿迭代解 x(t) = u，再返回 y(t)；牛顿法失败时退回二分法。

use glam::Vec2;

/// 曲线 trait
pub trait Curve {
    fn value(&self, v: f32) -> f32;
}

const NEWTON_ITERATIONS: usize = 8;
const BISECTION_ITERATIONS: usize = 32;
const SOLVE_EPSILON: f32 = 1.0e-6;

/// 三次贝塞尔曲线
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BezierCurve {
    /// 控制点1
    c0: Vec2,
    /// 控制点2
    c1: Vec2,
    /// 控制点在对角线上，等价于线性插值
    linear: bool,
}

impl BezierCurve {
    /// 创建新的贝塞尔曲线，控制点会被限制到 [0,1]²
    pub fn new(c0: Vec2, c1: Vec2) -> Self {
        let c0 = c0.clamp(Vec2::ZERO, Vec2::ONE);
        let c1 = c1.clamp(Vec2::ZERO, Vec2::ONE);
        let linear = (c0.x - c0.y).abs() < SOLVE_EPSILON && (c1.x - c1.y).abs() < SOLVE_EPSILON;
        Self { c0, c1, linear }
    }

    /// 线性曲线（VMD 默认值 20,20,107,107）
    pub fn linear() -> Self {
        Self::new(Vec2::new(20.0 / 127.0, 20.0 / 127.0), Vec2::new(107.0 / 127.0, 107.0 / 127.0))
    }

    /// 从 VMD 参数创建贝塞尔曲线
    ///
    /// VMD 使用 [0, 127] 范围的控制点参数：`[x1, y1, x2, y2]`
    pub fn from_parameters(parameters: [u8; 4]) -> Self {
        let c0 = Vec2::new(parameters[0] as f32 / 127.0, parameters[1] as f32 / 127.0);
        let c1 = Vec2::new(parameters[2] as f32 / 127.0, parameters[3] as f32 / 127.0);
        Self::new(c0, c1)
    }

    /// 导出为 VMD 参数格式
    pub fn to_parameters(&self) -> [u8; 4] {
        [
            (self.c0.x * 127.0).round() as u8,
            (self.c0.y * 127.0).round() as u8,
            (self.c1.x * 127.0).round() as u8,
            (self.c1.y * 127.0).round() as u8,
        ]
    }

    #[inline]
    pub fn is_linear(&self) -> bool {
        self.linear
    }

    #[inline]
    pub fn control_points(&self) -> (Vec2, Vec2) {
        (self.c0, self.c1)
    }

    /// B(t) = 3(1-t)²t·c0 + 3(1-t)t²·c1 + t³，单分量
    #[inline]
    fn sample(p0: f32, p1: f32, t: f32) -> f32 {
        let it = 1.0 - t;
        3.0 * it * it * t * p0 + 3.0 * it * t * t * p1 + t * t * t
    }

    #[inline]
    fn sample_derivative(p0: f32, p1: f32, t: f32) -> f32 {
        let it = 1.0 - t;
        3.0 * it * it * p0 + 6.0 * it * t * (p1 - p0) + 3.0 * t * t * (1.0 - p1)
    }

    /// 解 x(t) = u
    fn solve_t(&self, u: f32) -> f32 {
        let mut t = u;
        for _ in 0..NEWTON_ITERATIONS {
            let x = Self::sample(self.c0.x, self.c1.x, t) - u;
            if x.abs() < SOLVE_EPSILON {
                return t;
            }
            let dx = Self::sample_derivative(self.c0.x, self.c1.x, t);
            if dx.abs() < SOLVE_EPSILON {
                break;
            }
            t -= x / dx;
            if !(0.0..=1.0).contains(&t) {
                break;
            }
        }

        // 二分法兜底（x(t) 在 [0,1] 上单调）
        let (mut lo, mut hi) = (0.0_f32, 1.0_f32);
        t = u;
        for _ in 0..BISECTION_ITERATIONS {
            let x = Self::sample(self.c0.x, self.c1.x, t);
            if (x - u).abs() < SOLVE_EPSILON {
                break;
            }
            if x < u {
                lo = t;
            } else {
                hi = t;
            }
            t = 0.5 * (lo + hi);
        }
        t
    }
}

impl Default for BezierCurve {
    fn default() -> Self {
        Self::linear()
    }
}

impl Curve for BezierCurve {
    /// 输入 [0,1] 的线性进度，返回缓动后的进度
    fn value(&self, v: f32) -> f32 {
        let u = v.clamp(0.0, 1.0);
        if self.linear || u <= 0.0 || u >= 1.0 {
            return u;
        }
        let t = self.solve_t(u);
        Self::sample(self.c0.y, self.c1.y, t).clamp(0.0, 1.0)
    }
}

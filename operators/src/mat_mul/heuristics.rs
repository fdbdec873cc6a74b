use std::collections::HashMap;

/// 矩阵乘的实现变体。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum GemmKernelType {
    /// 直接读取两个操作数。
    Native,
    /// 右操作数预先重排，常量权重时只重排一次。
    ReshapedOnlyRhs,
    /// 两个操作数都重排。
    ReshapedLhsAndRhs,
}

/// 决定变体的问题规模。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GemmShape {
    pub batch: usize,
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

/// 变体选择的阈值和用户覆盖表。
#[derive(Clone, Debug)]
pub struct GemmHeuristics {
    /// `k` 小于此值时重排不划算。
    pub min_reshape_k: usize,
    /// `m` 不小于此值时左操作数也重排。
    pub lhs_reshape_m: usize,
    overrides: HashMap<GemmShape, GemmKernelType>,
}

impl Default for GemmHeuristics {
    fn default() -> Self {
        Self {
            min_reshape_k: 8,
            lhs_reshape_m: 256,
            overrides: HashMap::new(),
        }
    }
}

impl GemmHeuristics {
    /// 为特定规模指定变体，优先于所有规则。
    #[inline]
    pub fn with_override(mut self, shape: GemmShape, kind: GemmKernelType) -> Self {
        self.overrides.insert(shape, kind);
        self
    }

    pub fn select(&self, shape: GemmShape, constant_weights: bool) -> GemmKernelType {
        if let Some(&kind) = self.overrides.get(&shape) {
            return kind;
        }
        if !constant_weights || shape.m == 1 || shape.k < self.min_reshape_k {
            GemmKernelType::Native
        } else if shape.m >= self.lhs_reshape_m {
            GemmKernelType::ReshapedLhsAndRhs
        } else {
            GemmKernelType::ReshapedOnlyRhs
        }
    }
}

#[test]
fn test_select() {
    use GemmKernelType::*;

    let h = GemmHeuristics::default();
    let shape = |m, k| GemmShape {
        batch: 1,
        m,
        n: 64,
        k,
    };
    assert_eq!(h.select(shape(64, 64), false), Native);
    assert_eq!(h.select(shape(1, 64), true), Native);
    assert_eq!(h.select(shape(64, 4), true), Native);
    assert_eq!(h.select(shape(64, 64), true), ReshapedOnlyRhs);
    assert_eq!(h.select(shape(256, 64), true), ReshapedLhsAndRhs);

    let h = h.with_override(shape(256, 64), Native);
    assert_eq!(h.select(shape(256, 64), true), Native);
}

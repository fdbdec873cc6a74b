/// 融合在输出阶段的激活函数，都可以化为一次截断。
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Activation {
    /// `max(0, x)`
    Relu,
    /// `min(a, max(0, x))`
    BoundedRelu(f32),
    /// `min(a, max(b, x))`
    LuBoundedRelu(f32, f32),
}

impl Activation {
    /// 截断区间 `[lo, hi]`。
    #[inline]
    pub fn bounds(self) -> (f32, f32) {
        match self {
            Self::Relu => (0., f32::INFINITY),
            Self::BoundedRelu(a) => (0., a),
            Self::LuBoundedRelu(a, b) => (b, a),
        }
    }

    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        let (lo, hi) = self.bounds();
        x.max(lo).min(hi)
    }
}

/// 可选激活的截断区间，没有激活时不截断。
#[inline]
pub(crate) fn clamp_bounds(act: Option<Activation>) -> (f32, f32) {
    act.map_or((f32::NEG_INFINITY, f32::INFINITY), Activation::bounds)
}

#[test]
fn test_activation() {
    assert_eq!(Activation::Relu.apply(-1.), 0.);
    assert_eq!(Activation::Relu.apply(3.), 3.);
    assert_eq!(Activation::BoundedRelu(6.).apply(7.), 6.);
    assert_eq!(Activation::LuBoundedRelu(1., -1.).apply(-2.), -1.);
    assert_eq!(clamp_bounds(None).0, f32::NEG_INFINITY);
}

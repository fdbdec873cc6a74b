use std::ops::Range;

/// 迭代空间的一个维度。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Dimension {
    pub start: usize,
    pub end: usize,
    pub step: usize,
}

impl Dimension {
    #[inline]
    pub const fn new(start: usize, end: usize, step: usize) -> Self {
        Self { start, end, step }
    }

    #[inline]
    pub const fn whole(end: usize) -> Self {
        Self::new(0, end, 1)
    }

    #[inline]
    pub const fn num_iterations(&self) -> usize {
        if self.end <= self.start || self.step == 0 {
            0
        } else {
            (self.end - self.start).div_ceil(self.step)
        }
    }

    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// 核函数的三维迭代空间。
///
/// x、y 描述单个工作项覆盖的平面，z 枚举彼此独立的工作项。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Window {
    pub x: Dimension,
    pub y: Dimension,
    pub z: Dimension,
}

impl Window {
    /// 一维的工作项枚举。
    #[inline]
    pub const fn items(n: usize) -> Self {
        Self {
            x: Dimension::whole(1),
            y: Dimension::whole(1),
            z: Dimension::whole(n),
        }
    }

    #[inline]
    pub const fn new(x: Dimension, y: Dimension, z: Dimension) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub const fn num_items(&self) -> usize {
        self.z.num_iterations()
    }

    /// 迭代空间是否为空。
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.x.num_iterations() == 0
            || self.y.num_iterations() == 0
            || self.z.num_iterations() == 0
    }
}

/// 核函数读取越过张量边界的最大距离。
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct BorderSize {
    pub top: usize,
    pub right: usize,
    pub bottom: usize,
    pub left: usize,
}

impl BorderSize {
    pub const ZERO: Self = Self::uniform(0);

    #[inline]
    pub const fn uniform(n: usize) -> Self {
        Self {
            top: n,
            right: n,
            bottom: n,
            left: n,
        }
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.top == 0 && self.right == 0 && self.bottom == 0 && self.left == 0
    }

    /// 逐边取较大者。
    #[inline]
    pub fn max(self, other: Self) -> Self {
        Self {
            top: self.top.max(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
            left: self.left.max(other.left),
        }
    }
}

#[test]
fn test_window() {
    assert_eq!(Dimension::new(0, 10, 4).num_iterations(), 3);
    assert_eq!(Dimension::new(5, 5, 1).num_iterations(), 0);
    let w = Window::items(7);
    assert_eq!(w.num_items(), 7);
    assert!(!w.is_empty());
    assert!(Window::items(0).is_empty());

    let b = BorderSize::uniform(1).max(BorderSize {
        bottom: 3,
        ..BorderSize::ZERO
    });
    assert_eq!((b.top, b.bottom), (1, 3));
    assert!(BorderSize::ZERO.is_zero());
}

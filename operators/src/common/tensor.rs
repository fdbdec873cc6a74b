use std::fmt;

/// 张量元素的数据类型。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DataType {
    /// 无类型字节，用于辅助存储。
    U8,
    S32,
    F16,
    F32,
    /// 非对称量化的无符号 8 位整数。
    QAsymm8,
    /// 非对称量化的有符号 8 位整数。
    QAsymm8Signed,
}

impl DataType {
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::U8 | Self::QAsymm8 | Self::QAsymm8Signed => 1,
            Self::F16 => 2,
            Self::S32 | Self::F32 => 4,
        }
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::F32)
    }

    #[inline]
    pub const fn is_quantized(self) -> bool {
        matches!(self, Self::QAsymm8 | Self::QAsymm8Signed)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::U8 => "u8",
            Self::S32 => "s32",
            Self::F16 => "f16",
            Self::F32 => "f32",
            Self::QAsymm8 => "qasymm8",
            Self::QAsymm8Signed => "qasymm8_signed",
        };
        f.write_str(name)
    }
}

/// 四维张量的维度排列。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DataLayout {
    Nchw,
    Nhwc,
}

/// 量化参数，`real = scale * (q - offset)`。
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct QuantInfo {
    pub scale: f32,
    pub offset: i32,
}

impl Default for QuantInfo {
    #[inline]
    fn default() -> Self {
        Self {
            scale: 1.,
            offset: 0,
        }
    }
}

impl QuantInfo {
    #[inline]
    pub const fn new(scale: f32, offset: i32) -> Self {
        Self { scale, offset }
    }

    #[inline]
    pub fn dequantize(&self, q: i32) -> f32 {
        self.scale * (q - self.offset) as f32
    }

    #[inline]
    pub fn quantize(&self, x: f32) -> i32 {
        (x / self.scale).round() as i32 + self.offset
    }
}

/// 张量描述，构造后不可变。
#[derive(Clone, PartialEq, Debug)]
pub struct TensorDesc {
    dt: DataType,
    shape: Vec<usize>,
    layout: DataLayout,
    quant: QuantInfo,
}

impl TensorDesc {
    #[inline]
    pub fn new(dt: DataType, shape: &[usize]) -> Self {
        Self {
            dt,
            shape: shape.to_vec(),
            layout: DataLayout::Nchw,
            quant: QuantInfo::default(),
        }
    }

    /// 一段无类型的字节。
    #[inline]
    pub fn bytes(size: usize) -> Self {
        Self::new(DataType::U8, &[size])
    }

    #[inline]
    pub fn with_layout(mut self, layout: DataLayout) -> Self {
        self.layout = layout;
        self
    }

    #[inline]
    pub fn with_quant(mut self, quant: QuantInfo) -> Self {
        self.quant = quant;
        self
    }

    #[inline]
    pub const fn dt(&self) -> DataType {
        self.dt
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub const fn layout(&self) -> DataLayout {
        self.layout
    }

    #[inline]
    pub const fn quant(&self) -> QuantInfo {
        self.quant
    }

    #[inline]
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// 连续存储所需的字节数。
    #[inline]
    pub fn size(&self) -> usize {
        self.element_count() * self.dt.size()
    }

    /// 以元素为单位的连续步长。
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = self
            .shape
            .iter()
            .rev()
            .scan(1, |mul, &d| {
                let stride = *mul;
                *mul *= d;
                Some(stride)
            })
            .collect::<Vec<_>>();
        strides.reverse();
        strides
    }

    /// 按布局读出四维张量的 `[n, c, h, w]`。
    pub fn nchw(&self) -> Option<[usize; 4]> {
        let &[a, b, c, d] = &*self.shape else {
            return None;
        };
        Some(match self.layout {
            DataLayout::Nchw => [a, b, c, d],
            DataLayout::Nhwc => [a, d, b, c],
        })
    }

    /// 按布局构造四维张量的形状。
    pub fn from_nchw(dt: DataType, layout: DataLayout, [n, c, h, w]: [usize; 4]) -> Self {
        let shape = match layout {
            DataLayout::Nchw => [n, c, h, w],
            DataLayout::Nhwc => [n, h, w, c],
        };
        Self::new(dt, &shape).with_layout(layout)
    }

    /// 形状与类型都一致。
    #[inline]
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.dt == other.dt && self.shape == other.shape && self.layout == other.layout
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{:?}", self.dt, self.shape)?;
        if self.ndim() == 4 {
            write!(f, "({:?})", self.layout)?;
        }
        Ok(())
    }
}

#[test]
fn test_desc() {
    let desc = TensorDesc::from_nchw(DataType::F16, DataLayout::Nhwc, [2, 3, 4, 5]);
    assert_eq!(desc.shape(), &[2, 4, 5, 3]);
    assert_eq!(desc.nchw(), Some([2, 3, 4, 5]));
    assert_eq!(desc.size(), 2 * 3 * 4 * 5 * 2);
    assert_eq!(desc.strides(), [60, 15, 3, 1]);
    assert_eq!(desc.to_string(), "f16[2, 4, 5, 3](Nhwc)");
    assert_eq!(TensorDesc::bytes(7).nchw(), None);

    let q = QuantInfo::new(0.5, 10);
    assert_eq!(q.quantize(1.), 12);
    assert_eq!(q.dequantize(12), 1.);
}

use crate::{
    args_not_support, shape_mismatch, shape_not_support, type_mismatch, type_not_support,
    utils::{dims4, rank_error},
    Activation, DataLayout, DataType, Operands, Slot, Status, TensorDesc,
};

/// 输出尺寸不能整除时的取整方式。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub enum DimensionRounding {
    #[default]
    Floor,
    Ceil,
}

/// 步长和四边填充。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PadStrideInfo {
    /// `(x, y)` 方向的步长。
    pub stride: (usize, usize),
    pub pad_left: usize,
    pub pad_right: usize,
    pub pad_top: usize,
    pub pad_bottom: usize,
    pub round: DimensionRounding,
}

impl Default for PadStrideInfo {
    #[inline]
    fn default() -> Self {
        Self::new(1, 1, 0, 0)
    }
}

impl PadStrideInfo {
    /// 对称填充。
    #[inline]
    pub const fn new(stride_x: usize, stride_y: usize, pad_x: usize, pad_y: usize) -> Self {
        Self {
            stride: (stride_x, stride_y),
            pad_left: pad_x,
            pad_right: pad_x,
            pad_top: pad_y,
            pad_bottom: pad_y,
            round: DimensionRounding::Floor,
        }
    }

    /// 分别指定四边填充。
    #[inline]
    pub const fn with_pads(mut self, left: usize, right: usize, top: usize, bottom: usize) -> Self {
        self.pad_left = left;
        self.pad_right = right;
        self.pad_top = top;
        self.pad_bottom = bottom;
        self
    }

    #[inline]
    pub const fn with_rounding(mut self, round: DimensionRounding) -> Self {
        self.round = round;
        self
    }

    #[inline]
    pub const fn has_padding(&self) -> bool {
        self.pad_left + self.pad_right + self.pad_top + self.pad_bottom != 0
    }

    #[inline]
    pub const fn is_unit_stride(&self) -> bool {
        self.stride.0 == 1 && self.stride.1 == 1
    }

    /// 计算输出的 `(w, h)`，卷积核覆盖不到任何输出时返回 `None`。
    pub fn scaled_dimensions(
        &self,
        (w, h): (usize, usize),
        (kw, kh): (usize, usize),
        dilation: Size2D,
    ) -> Option<(usize, usize)> {
        let scale = |len: usize, pads: usize, k: usize, d: usize, s: usize| {
            let extent = (k.checked_sub(1)?) * d + 1;
            let span = (len + pads).checked_sub(extent)?;
            if s == 0 {
                return None;
            }
            Some(match self.round {
                DimensionRounding::Floor => span / s + 1,
                DimensionRounding::Ceil => span.div_ceil(s) + 1,
            })
        };
        Some((
            scale(w, self.pad_left + self.pad_right, kw, dilation.width, self.stride.0)?,
            scale(h, self.pad_top + self.pad_bottom, kh, dilation.height, self.stride.1)?,
        ))
    }
}

/// 二维尺寸。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Size2D {
    pub width: usize,
    pub height: usize,
}

impl Size2D {
    pub const ONE: Self = Self::new(1, 1);

    #[inline]
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }
}

/// 二维卷积的配置参数。
///
/// `src` 和 `dst` 是 `[n, c, h, w]`（或对应的 NHWC）张量；
/// `weights` 与 `src` 同布局，NCHW 为 `[m, c, kh, kw]`，NHWC 为 `[m, kh, kw, c]`；
/// `bias` 为 `[m]`，量化时类型为 `S32`。
#[derive(Clone, Debug)]
pub struct Conv2dInfo {
    pub src: TensorDesc,
    pub weights: TensorDesc,
    pub bias: Option<TensorDesc>,
    pub dst: TensorDesc,
    pub conv: PadStrideInfo,
    pub dilation: Size2D,
    pub activation: Option<Activation>,
    /// 允许牺牲精度换取速度，影响 Winograd 的适用范围。
    pub fast_math: bool,
}

/// 通过公共检查后的卷积规模。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConvShape {
    pub dt: DataType,
    pub layout: DataLayout,
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
    pub m: usize,
    pub kh: usize,
    pub kw: usize,
    pub oh: usize,
    pub ow: usize,
}

impl Conv2dInfo {
    /// 按输入和权重推断输出，推断失败时输出为空形状，由 [`validate`](Self::validate) 报告。
    pub fn new(src: TensorDesc, weights: TensorDesc, conv: PadStrideInfo) -> Self {
        let mut ans = Self {
            dst: TensorDesc::new(src.dt(), &[]),
            src,
            weights,
            bias: None,
            conv,
            dilation: Size2D::ONE,
            activation: None,
            fast_math: false,
        };
        ans.infer_dst();
        ans
    }

    #[inline]
    pub fn with_dilation(mut self, dilation: Size2D) -> Self {
        self.dilation = dilation;
        self.infer_dst();
        self
    }

    #[inline]
    pub fn with_bias(mut self, bias: TensorDesc) -> Self {
        self.bias = Some(bias);
        self
    }

    #[inline]
    pub fn with_activation(mut self, act: Activation) -> Self {
        self.activation = Some(act);
        self
    }

    #[inline]
    pub fn with_fast_math(mut self, fast_math: bool) -> Self {
        self.fast_math = fast_math;
        self
    }

    /// 运行时张量包应满足的操作数描述。
    ///
    /// 准备之后权重可能已被释放，因此只在出现时核对。
    pub fn operands(&self) -> Operands {
        let mut ans = Operands::new()
            .with(Slot::Src0, &self.src)
            .with_optional(Slot::Src1, &self.weights)
            .with(Slot::Dst, &self.dst);
        if let Some(bias) = &self.bias {
            ans = ans.with(Slot::Src2, bias)
        }
        ans
    }

    fn infer_dst(&mut self) {
        let (Some([n, _, h, w]), Some([m, _, kh, kw])) = (self.src.nchw(), self.weights.nchw())
        else {
            return;
        };
        if let Some((ow, oh)) = self.conv.scaled_dimensions((w, h), (kw, kh), self.dilation) {
            self.dst = TensorDesc::from_nchw(self.src.dt(), self.src.layout(), [n, m, oh, ow])
                .with_quant(self.src.quant())
        }
    }

    /// 所有方法共同的前置检查。
    pub fn validate(&self) -> Result<ConvShape, Status> {
        let Self {
            src,
            weights,
            bias,
            dst,
            conv,
            dilation,
            ..
        } = self;

        let dt = src.dt();
        if !dt.is_float() && !dt.is_quantized() {
            return Err(type_not_support(format!("convolution on {dt}")));
        }
        if weights.dt() != dt || dst.dt() != dt {
            return Err(type_mismatch(format!(
                "src {src}, weights {weights}, dst {dst}"
            )));
        }
        let layout = src.layout();
        if weights.layout() != layout || dst.layout() != layout {
            return Err(args_not_support(format!(
                "mixed layouts: src {src}, weights {weights}, dst {dst}"
            )));
        }

        let [n, c, h, w] = dims4("src", src)?;
        let [m, ck, kh, kw] = dims4("weights", weights)?;
        if [n, c, h, w, m, kh, kw].contains(&0) {
            return Err(shape_not_support(format!("zero-sized convolution {src} * {weights}")));
        }
        if c != ck {
            return Err(shape_mismatch(format!(
                "src has {c} channels, weights {weights} expect {ck}"
            )));
        }
        if conv.stride.0 == 0 || conv.stride.1 == 0 || dilation.width == 0 || dilation.height == 0
        {
            return Err(args_not_support(format!(
                "stride {:?} and dilation {dilation:?} must be positive",
                conv.stride
            )));
        }
        let Some((ew, eh)) = conv.scaled_dimensions((w, h), (kw, kh), *dilation) else {
            return Err(shape_not_support(format!(
                "kernel {kh}x{kw} is larger than the padded input {src}"
            )));
        };
        let [ny, my, oh, ow] = dims4("dst", dst)?;
        if [ny, my, oh, ow] != [n, m, eh, ew] {
            return Err(shape_mismatch(format!(
                "dst {dst}, [{n}, {m}, {eh}, {ew}] expected"
            )));
        }

        if let Some(bias) = bias {
            let expect = if dt.is_quantized() { DataType::S32 } else { dt };
            if bias.dt() != expect {
                return Err(type_mismatch(format!("bias {bias}, {expect} expected")));
            }
            let &[mb] = bias.shape() else {
                return Err(rank_error("bias", 1, bias.ndim()));
            };
            if mb != m {
                return Err(shape_mismatch(format!("bias {bias} for {m} output channels")));
            }
        }

        Ok(ConvShape {
            dt,
            layout,
            n,
            c,
            h,
            w,
            m,
            kh,
            kw,
            oh,
            ow,
        })
    }
}

impl ConvShape {
    /// 四维张量中 `(n, c, h, w)` 位置的线性下标。
    #[inline]
    pub(crate) fn index(
        layout: DataLayout,
        [_, c_, h_, w_]: [usize; 4],
        [n, c, h, w]: [usize; 4],
    ) -> usize {
        match layout {
            DataLayout::Nchw => ((n * c_ + c) * h_ + h) * w_ + w,
            DataLayout::Nhwc => ((n * h_ + h) * w_ + w) * c_ + c,
        }
    }

    #[inline]
    pub(crate) fn src_index(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        Self::index(self.layout, [self.n, self.c, self.h, self.w], [n, c, h, w])
    }

    #[inline]
    pub(crate) fn weight_index(&self, m: usize, c: usize, y: usize, x: usize) -> usize {
        Self::index(self.layout, [self.m, self.c, self.kh, self.kw], [m, c, y, x])
    }

    #[inline]
    pub(crate) fn dst_index(&self, n: usize, m: usize, h: usize, w: usize) -> usize {
        Self::index(self.layout, [self.n, self.m, self.oh, self.ow], [n, m, h, w])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ErrorKind, QuantInfo};

    fn desc(dt: DataType, nchw: [usize; 4]) -> TensorDesc {
        TensorDesc::from_nchw(dt, DataLayout::Nchw, nchw)
    }

    #[test]
    fn test_scaled_dimensions() {
        let conv = PadStrideInfo::new(2, 2, 0, 0).with_pads(0, 1, 0, 1);
        assert_eq!(
            conv.scaled_dimensions((224, 224), (3, 3), Size2D::ONE),
            Some((112, 112))
        );
        let ceil = PadStrideInfo::new(2, 2, 0, 0).with_rounding(DimensionRounding::Ceil);
        assert_eq!(ceil.scaled_dimensions((6, 6), (3, 3), Size2D::ONE), Some((3, 3)));
        assert_eq!(
            PadStrideInfo::default().scaled_dimensions((5, 5), (3, 3), Size2D::new(2, 2)),
            Some((1, 1))
        );
        assert_eq!(
            PadStrideInfo::default().scaled_dimensions((2, 2), (3, 3), Size2D::ONE),
            None
        );
    }

    #[test]
    fn test_infer_and_validate() {
        let info = Conv2dInfo::new(
            desc(DataType::F32, [2, 8, 10, 12]),
            desc(DataType::F32, [4, 8, 3, 3]),
            PadStrideInfo::new(1, 1, 1, 1),
        );
        assert_eq!(info.dst.shape(), &[2, 4, 10, 12]);
        let shape = info.validate().unwrap();
        assert_eq!((shape.oh, shape.ow, shape.m), (10, 12, 4));

        let nhwc = Conv2dInfo::new(
            TensorDesc::from_nchw(DataType::F16, DataLayout::Nhwc, [1, 3, 7, 7]),
            TensorDesc::from_nchw(DataType::F16, DataLayout::Nhwc, [5, 3, 3, 3]),
            PadStrideInfo::new(2, 2, 0, 0),
        );
        assert_eq!(nhwc.dst.shape(), &[1, 3, 3, 5]);
        assert!(nhwc.validate().is_ok());
    }

    #[test]
    fn test_rejects() {
        let base = || {
            Conv2dInfo::new(
                desc(DataType::F32, [1, 4, 8, 8]),
                desc(DataType::F32, [2, 4, 3, 3]),
                PadStrideInfo::default(),
            )
        };

        let mut info = base();
        info.weights = desc(DataType::F16, [2, 4, 3, 3]);
        assert_eq!(info.validate().unwrap_err().kind, ErrorKind::TypeMismatch);

        let info = Conv2dInfo::new(
            desc(DataType::F32, [1, 4, 0, 8]),
            desc(DataType::F32, [2, 4, 3, 3]),
            PadStrideInfo::default(),
        );
        assert_eq!(info.validate().unwrap_err().kind, ErrorKind::ShapeNotSupport);

        let info = Conv2dInfo::new(
            desc(DataType::F32, [1, 4, 2, 2]),
            desc(DataType::F32, [2, 4, 3, 3]),
            PadStrideInfo::default(),
        );
        assert_eq!(info.validate().unwrap_err().kind, ErrorKind::ShapeNotSupport);

        let mut info = base();
        info.weights = desc(DataType::F32, [2, 3, 3, 3]);
        assert_eq!(info.validate().unwrap_err().kind, ErrorKind::ShapeMismatch);

        let info = base().with_bias(TensorDesc::new(DataType::F32, &[3]));
        assert_eq!(info.validate().unwrap_err().kind, ErrorKind::ShapeMismatch);

        let mut info = base();
        info.dst = desc(DataType::F32, [1, 2, 8, 8]);
        assert_eq!(info.validate().unwrap_err().kind, ErrorKind::ShapeMismatch);

        let info = Conv2dInfo::new(
            desc(DataType::S32, [1, 4, 8, 8]),
            desc(DataType::S32, [2, 4, 3, 3]),
            PadStrideInfo::default(),
        );
        assert_eq!(info.validate().unwrap_err().kind, ErrorKind::TypeNotSupport);
    }

    #[test]
    fn test_quantized_bias() {
        let q = QuantInfo::new(0.1, 3);
        let info = Conv2dInfo::new(
            desc(DataType::QAsymm8, [1, 4, 8, 8]).with_quant(q),
            desc(DataType::QAsymm8, [2, 4, 3, 3]),
            PadStrideInfo::default(),
        );
        assert_eq!(info.dst.quant(), q);
        let ok = info.clone().with_bias(TensorDesc::new(DataType::S32, &[2]));
        assert!(ok.validate().is_ok());
        let bad = info.with_bias(TensorDesc::new(DataType::QAsymm8, &[2]));
        assert_eq!(bad.validate().unwrap_err().kind, ErrorKind::TypeMismatch);
    }
}

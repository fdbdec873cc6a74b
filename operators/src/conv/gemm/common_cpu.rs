use crate::{
    conv::{ConvShape, PadStrideInfo, Size2D},
    scheduler::{LocalWorkSize, Tuning},
    BorderSize, DataType, Kernel, QuantInfo, Slot, Status, TensorPack, Window,
};
use rayon::prelude::*;

/// 把每个输出位置的感受野展开成一行，输出 `[n, oh·ow, c·kh·kw]`。
///
/// 浮点输入展开为 `f32`；量化输入展开为 `i32` 编码，越界处填输入零点。
pub(crate) struct Im2ColKernel {
    shape: ConvShape,
    conv: PadStrideInfo,
    dilation: Size2D,
    pad_value: i32,
    tuning: Tuning,
}

impl Im2ColKernel {
    pub fn new(shape: ConvShape, conv: PadStrideInfo, dilation: Size2D, src_quant: QuantInfo) -> Self {
        Self {
            shape,
            conv,
            dilation,
            pad_value: if shape.dt.is_quantized() {
                src_quant.offset
            } else {
                0
            },
            tuning: Tuning::default(),
        }
    }
}

impl Kernel for Im2ColKernel {
    fn name(&self) -> &'static str {
        "im2col"
    }

    fn config_id(&self) -> String {
        let ConvShape {
            dt, n, c, h, w, kh, kw, ..
        } = self.shape;
        let (sx, sy) = self.conv.stride;
        format!(
            "{}_{dt}_{:?}_{n}x{c}x{h}x{w}_k{kh}x{kw}_s{sy}x{sx}_d{}x{}",
            self.name(),
            self.shape.layout,
            self.dilation.height,
            self.dilation.width
        )
    }

    fn build_options(&self) -> Vec<String> {
        let mut options = vec![
            format!("-DDATA_TYPE={}", self.shape.dt),
            format!("-DKERNEL_WIDTH={}", self.shape.kw),
            format!("-DKERNEL_HEIGHT={}", self.shape.kh),
        ];
        if self.conv.has_padding() {
            options.push(format!("-DPAD_VALUE={}", self.pad_value))
        }
        if self.dilation != Size2D::ONE {
            options.push("-DDILATION".into())
        }
        options
    }

    fn window(&self) -> Window {
        Window::items(self.shape.n * self.shape.oh * self.shape.ow)
    }

    fn border_size(&self) -> BorderSize {
        let conv = &self.conv;
        BorderSize {
            top: conv.pad_top,
            right: conv.pad_right,
            bottom: conv.pad_bottom,
            left: conv.pad_left,
        }
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize) -> Result<(), Status> {
        let shape = self.shape;
        let ConvShape { c: c_, h, w, kh, kw, oh, ow, .. } = shape;
        let (sx, sy) = self.conv.stride;
        let (pt, pl) = (self.conv.pad_top, self.conv.pad_left);
        let Size2D {
            width: dx,
            height: dy,
        } = self.dilation;
        let k = c_ * kh * kw;
        let pad_value = self.pad_value;

        // 感受野中每个元素在输入中的下标，越界为 None
        let source = move |row: usize, col: usize| {
            let (n, p) = (row / (oh * ow), row % (oh * ow));
            let (oy, ox) = (p / ow, p % ow);
            let (c, r) = (col / (kh * kw), col % (kh * kw));
            let (ky, kx) = (r / kw, r % kw);
            let iy = (oy * sy + ky * dy).checked_sub(pt).filter(|&iy| iy < h)?;
            let ix = (ox * sx + kx * dx).checked_sub(pl).filter(|&ix| ix < w)?;
            Some(shape.src_index(n, c, iy, ix))
        };

        let rows = window.z.range().into_par_iter().with_min_len(lws.get());
        let src = pack.require(Slot::Src0)?;
        let dst = pack.require(Slot::Dst)?;
        if shape.dt.is_quantized() {
            let src = src.quants()?;
            let dst = dst.typed::<i32>()?;
            rows.for_each(|row| {
                for col in 0..k {
                    let val = source(row, col).map_or(pad_value, |i| unsafe { src.get(i) });
                    unsafe { dst.write(row * k + col, val) }
                }
            })
        } else {
            let src = src.floats()?;
            let dst = dst.typed::<f32>()?;
            rows.for_each(|row| {
                for col in 0..k {
                    let val = source(row, col).map_or(0., |i| unsafe { src.get(i) });
                    unsafe { dst.write(row * k + col, val) }
                }
            })
        }
        Ok(())
    }
}

/// 把权重重排为 `[c·kh·kw, m]`，浮点为 `f32`，量化为 `i32` 编码。
pub(crate) struct WeightsReshapeKernel {
    shape: ConvShape,
    tuning: Tuning,
}

impl WeightsReshapeKernel {
    pub fn new(shape: ConvShape) -> Self {
        Self {
            shape,
            tuning: Tuning::default(),
        }
    }
}

impl Kernel for WeightsReshapeKernel {
    fn name(&self) -> &'static str {
        "weights_reshape"
    }

    fn config_id(&self) -> String {
        let ConvShape {
            dt, m, c, kh, kw, ..
        } = self.shape;
        format!("{}_{dt}_{:?}_{m}x{c}x{kh}x{kw}", self.name(), self.shape.layout)
    }

    fn build_options(&self) -> Vec<String> {
        vec![format!("-DDATA_TYPE={}", self.shape.dt)]
    }

    fn window(&self) -> Window {
        Window::items(self.shape.m)
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize) -> Result<(), Status> {
        let shape = self.shape;
        let ConvShape {
            m: m_, c: c_, kh, kw, ..
        } = shape;
        let index = move |m: usize, col: usize| {
            let (c, r) = (col / (kh * kw), col % (kh * kw));
            shape.weight_index(m, c, r / kw, r % kw)
        };

        let k = c_ * kh * kw;
        let outputs = window.z.range().into_par_iter().with_min_len(lws.get());
        let src = pack.require(Slot::Src1)?;
        let dst = pack.require(Slot::Dst)?;
        if shape.dt.is_quantized() {
            let src = src.quants()?;
            let dst = dst.typed::<i32>()?;
            outputs.for_each(|m| {
                for col in 0..k {
                    unsafe { dst.write(col * m_ + m, src.get(index(m, col))) }
                }
            })
        } else {
            let src = src.floats()?;
            let dst = dst.typed::<f32>()?;
            outputs.for_each(|m| {
                for col in 0..k {
                    unsafe { dst.write(col * m_ + m, src.get(index(m, col))) }
                }
            })
        }
        Ok(())
    }
}

/// 8 位量化矩阵乘，`i32` 累加 `Σ (a - a_offset)(b - b_offset)`。
///
/// `a` 为 `[batch·m, k]`，`b` 为 `[k, n]`，输出 `[batch·m, n]`。
pub(crate) struct GemmLowpKernel {
    pub rows: usize,
    pub n: usize,
    pub k: usize,
    pub a_offset: i32,
    pub b_offset: i32,
    pub tuning: Tuning,
}

impl Kernel for GemmLowpKernel {
    fn name(&self) -> &'static str {
        "gemmlowp_mm_native"
    }

    fn config_id(&self) -> String {
        format!("{}_{}x{}x{}", self.name(), self.rows, self.n, self.k)
    }

    fn build_options(&self) -> Vec<String> {
        vec![
            format!("-DA_OFFSET={}", self.a_offset),
            format!("-DB_OFFSET={}", self.b_offset),
        ]
    }

    fn window(&self) -> Window {
        Window::items(self.rows)
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize) -> Result<(), Status> {
        let &Self {
            n,
            k,
            a_offset,
            b_offset,
            ..
        } = self;
        let a = pack.require(Slot::Src0)?.typed::<i32>()?;
        let b = pack.require(Slot::Src1)?.typed::<i32>()?;
        let dst = pack.require(Slot::Dst)?.typed::<i32>()?;
        window
            .z
            .range()
            .into_par_iter()
            .with_min_len(lws.get())
            .for_each(|i| {
                let mut acc = vec![0i32; n];
                for p in 0..k {
                    let lhs = unsafe { a.read(i * k + p) } - a_offset;
                    if lhs != 0 {
                        for (j, acc) in acc.iter_mut().enumerate() {
                            *acc += lhs * (unsafe { b.read(p * n + j) } - b_offset)
                        }
                    }
                }
                for (j, val) in acc.into_iter().enumerate() {
                    unsafe { dst.write(i * n + j, val) }
                }
            });
        Ok(())
    }
}

/// 输出阶段：加偏置、反量化再量化、激活，并按输出布局写回。
///
/// 输入为 `[n, oh·ow, m]` 的矩阵乘结果，浮点为 `f32`，量化为 `i32` 累加值。
pub(crate) struct OutputStageKernel {
    pub shape: ConvShape,
    pub has_bias: bool,
    pub bounds: (f32, f32),
    /// 量化时累加值到实数的比例，即输入与权重比例之积。
    pub multiplier: f32,
    pub dst_quant: QuantInfo,
    pub tuning: Tuning,
}

impl Kernel for OutputStageKernel {
    fn name(&self) -> &'static str {
        "conv_output_stage"
    }

    fn config_id(&self) -> String {
        let ConvShape {
            dt, n, m, oh, ow, ..
        } = self.shape;
        format!("{}_{dt}_{:?}_{n}x{m}x{oh}x{ow}", self.name(), self.shape.layout)
    }

    fn build_options(&self) -> Vec<String> {
        let mut options = vec![format!("-DDATA_TYPE={}", self.shape.dt)];
        if self.has_bias {
            options.push("-DHAS_BIAS".into())
        }
        if self.shape.dt.is_quantized() {
            options.push(format!("-DRESULT_MULTIPLIER={}", self.multiplier))
        }
        options
    }

    fn window(&self) -> Window {
        Window::items(self.shape.n * self.shape.oh * self.shape.ow)
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize) -> Result<(), Status> {
        let shape = self.shape;
        let ConvShape { m: m_, oh, ow, .. } = shape;
        let (lo, hi) = self.bounds;
        let (multiplier, dq) = (self.multiplier, self.dst_quant);
        let position = move |row: usize| {
            let (n, p) = (row / (oh * ow), row % (oh * ow));
            (n, p / ow, p % ow)
        };

        let rows = window.z.range().into_par_iter().with_min_len(lws.get());
        let bias = self
            .has_bias
            .then(|| pack.require(Slot::Src2))
            .transpose()?;
        let src = pack.require(Slot::Src0)?;
        let dst = pack.require(Slot::Dst)?;
        match shape.dt {
            DataType::F32 | DataType::F16 => {
                let bias = bias.map(|b| b.floats()).transpose()?;
                let src = src.typed::<f32>()?;
                let dst = dst.floats()?;
                rows.for_each(|row| {
                    let (n, oy, ox) = position(row);
                    for m in 0..m_ {
                        let b = bias.map_or(0., |b| unsafe { b.get(m) });
                        let val = (unsafe { src.read(row * m_ + m) } + b).max(lo).min(hi);
                        unsafe { dst.set(shape.dst_index(n, m, oy, ox), val) }
                    }
                })
            }
            _ => {
                let bias = bias.map(|b| b.typed::<i32>()).transpose()?;
                let src = src.typed::<i32>()?;
                let dst = dst.quants()?;
                rows.for_each(|row| {
                    let (n, oy, ox) = position(row);
                    for m in 0..m_ {
                        let b = bias.map_or(0, |b| unsafe { b.read(m) });
                        let acc = unsafe { src.read(row * m_ + m) } + b;
                        let real = (acc as f32 * multiplier).max(lo).min(hi);
                        unsafe { dst.set(shape.dst_index(n, m, oy, ox), dq.quantize(real)) }
                    }
                })
            }
        }
        Ok(())
    }
}

use crate::{
    conv::{ConvShape, PadStrideInfo},
    scheduler::{LocalWorkSize, Tuning},
    BorderSize, Kernel, QuantInfo, Slot, Status, TensorPack, Window,
};
use rayon::prelude::*;
use std::ops::Range;

/// 逐输出位置直接累加感受野，融合偏置、激活和再量化。
pub(crate) struct DirectConvKernel {
    pub shape: ConvShape,
    pub conv: PadStrideInfo,
    pub has_bias: bool,
    pub bounds: (f32, f32),
    pub quant: [QuantInfo; 3],
    pub tuning: Tuning,
}

impl DirectConvKernel {
    /// 感受野在填充后输入中的起点，以及落在原输入内的卷积核范围。
    #[inline]
    fn field(&self, oy: usize, ox: usize) -> ([usize; 2], [Range<usize>; 2]) {
        let ConvShape { h, w, kh, kw, .. } = self.shape;
        let (sx, sy) = self.conv.stride;
        let clip = |start: usize, pad: usize, k: usize, len: usize| {
            let lo = pad.saturating_sub(start);
            let hi = k.min((len + pad).saturating_sub(start));
            lo..hi.max(lo)
        };
        let (y0, x0) = (oy * sy, ox * sx);
        let ry = clip(y0, self.conv.pad_top, kh, h);
        let rx = clip(x0, self.conv.pad_left, kw, w);
        ([y0, x0], [ry, rx])
    }
}

impl Kernel for DirectConvKernel {
    fn name(&self) -> &'static str {
        "direct_conv2d"
    }

    fn config_id(&self) -> String {
        let ConvShape {
            dt, n, c, h, w, m, kh, kw, ..
        } = self.shape;
        let (sx, sy) = self.conv.stride;
        format!(
            "{}_{dt}_{:?}_{n}x{c}x{h}x{w}_{m}_k{kh}x{kw}_s{sy}x{sx}",
            self.name(),
            self.shape.layout
        )
    }

    fn build_options(&self) -> Vec<String> {
        let (sx, sy) = self.conv.stride;
        let mut options = vec![
            format!("-DDATA_TYPE={}", self.shape.dt),
            format!("-DDATA_LAYOUT={:?}", self.shape.layout).to_uppercase(),
            format!("-DWEIGHTS_WIDTH={}", self.shape.kw),
            format!("-DWEIGHTS_HEIGHT={}", self.shape.kh),
            format!("-DSTRIDE_X={sx}"),
            format!("-DSTRIDE_Y={sy}"),
        ];
        if self.has_bias {
            options.push("-DHAS_BIAS".into())
        }
        if self.shape.dt.is_quantized() {
            let [src, weights, dst] = self.quant;
            options.push(format!("-DINPUT_OFFSET={}", src.offset));
            options.push(format!("-DWEIGHTS_OFFSET={}", weights.offset));
            options.push(format!("-DOUTPUT_OFFSET={}", dst.offset));
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
        let ConvShape {
            c: c_, m: m_, oh, ow, ..
        } = shape;
        let (pt, pl) = (self.conv.pad_top, self.conv.pad_left);
        let (lo, hi) = self.bounds;
        let [sq, wq, dq] = self.quant;
        let position = move |i: usize| {
            let (n, p) = (i / (oh * ow), i % (oh * ow));
            (n, p / ow, p % ow)
        };

        let outputs = window.z.range().into_par_iter().with_min_len(lws.get());
        let bias = self
            .has_bias
            .then(|| pack.require(Slot::Src2))
            .transpose()?;
        let src = pack.require(Slot::Src0)?;
        let weights = pack.require(Slot::Src1)?;
        let dst = pack.require(Slot::Dst)?;

        if shape.dt.is_quantized() {
            let bias = bias.map(|b| b.typed::<i32>()).transpose()?;
            let (src, weights, dst) = (src.quants()?, weights.quants()?, dst.quants()?);
            let multiplier = sq.scale * wq.scale;
            outputs.for_each(|i| {
                let (n, oy, ox) = position(i);
                let ([y0, x0], [ry, rx]) = self.field(oy, ox);
                for m in 0..m_ {
                    let mut acc = bias.map_or(0, |b| unsafe { b.read(m) });
                    for c in 0..c_ {
                        for ky in ry.clone() {
                            for kx in rx.clone() {
                                let (iy, ix) = (y0 + ky - pt, x0 + kx - pl);
                                let a = unsafe { src.get(shape.src_index(n, c, iy, ix)) };
                                let b = unsafe { weights.get(shape.weight_index(m, c, ky, kx)) };
                                acc += (a - sq.offset) * (b - wq.offset)
                            }
                        }
                    }
                    let real = (acc as f32 * multiplier).max(lo).min(hi);
                    unsafe { dst.set(shape.dst_index(n, m, oy, ox), dq.quantize(real)) }
                }
            })
        } else {
            let bias = bias.map(|b| b.floats()).transpose()?;
            let (src, weights, dst) = (src.floats()?, weights.floats()?, dst.floats()?);
            outputs.for_each(|i| {
                let (n, oy, ox) = position(i);
                let ([y0, x0], [ry, rx]) = self.field(oy, ox);
                for m in 0..m_ {
                    let mut acc = bias.map_or(0., |b| unsafe { b.get(m) });
                    for c in 0..c_ {
                        for ky in ry.clone() {
                            for kx in rx.clone() {
                                let (iy, ix) = (y0 + ky - pt, x0 + kx - pl);
                                acc += unsafe {
                                    src.get(shape.src_index(n, c, iy, ix))
                                        * weights.get(shape.weight_index(m, c, ky, kx))
                                }
                            }
                        }
                    }
                    unsafe { dst.set(shape.dst_index(n, m, oy, ox), acc.max(lo).min(hi)) }
                }
            })
        }
        Ok(())
    }
}

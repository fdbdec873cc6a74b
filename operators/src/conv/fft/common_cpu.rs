use super::Spectrum;
use crate::{
    conv::ConvShape,
    scheduler::{LocalWorkSize, Tuning},
    Kernel, Slot, Status, SyncPtr, TensorPack, Window,
};
use rayon::prelude::*;
use rustfft::{num_complex::Complex32, Fft, FftPlanner};
use std::sync::Arc;

/// 一对行、列方向的变换计划。
#[derive(Clone)]
pub(crate) struct Plan2d {
    spectrum: Spectrum,
    rows: Arc<dyn Fft<f32>>,
    cols: Arc<dyn Fft<f32>>,
}

impl Plan2d {
    pub fn forward(spectrum: Spectrum) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            spectrum,
            rows: planner.plan_fft_forward(spectrum.width),
            cols: planner.plan_fft_forward(spectrum.height),
        }
    }

    pub fn inverse(spectrum: Spectrum) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            spectrum,
            rows: planner.plan_fft_inverse(spectrum.width),
            cols: planner.plan_fft_inverse(spectrum.height),
        }
    }

    /// 对 `[height, width]` 的平面原地做二维变换，不归一化。
    pub fn process(&self, plane: &mut [Complex32]) {
        let Spectrum { height: h, width: w } = self.spectrum;
        self.rows.process(plane);
        let mut column = vec![Complex32::default(); h];
        for x in 0..w {
            for (y, v) in column.iter_mut().enumerate() {
                *v = plane[y * w + x]
            }
            self.cols.process(&mut column);
            for (y, v) in column.iter().enumerate() {
                plane[y * w + x] = *v
            }
        }
    }
}

#[inline]
unsafe fn load(ptr: SyncPtr<f32>, plane: usize, len: usize) -> Vec<Complex32> {
    (0..len)
        .map(|i| {
            let base = (plane * len + i) * 2;
            Complex32::new(ptr.read(base), ptr.read(base + 1))
        })
        .collect()
}

#[inline]
unsafe fn store(ptr: SyncPtr<f32>, plane: usize, data: &[Complex32]) {
    for (i, v) in data.iter().enumerate() {
        let base = (plane * data.len() + i) * 2;
        ptr.write(base, v.re);
        ptr.write(base + 1, v.im)
    }
}

/// 每个输入平面补零后做正变换，输出 `[n, c, fh, fw, 2]`。
pub(crate) struct InputFftKernel {
    shape: ConvShape,
    spectrum: Spectrum,
    plan: Plan2d,
    tuning: Tuning,
}

impl InputFftKernel {
    pub fn new(shape: ConvShape, spectrum: Spectrum) -> Self {
        Self {
            shape,
            spectrum,
            plan: Plan2d::forward(spectrum),
            tuning: Tuning::default(),
        }
    }
}

impl Kernel for InputFftKernel {
    fn name(&self) -> &'static str {
        "fft_conv_input"
    }

    fn config_id(&self) -> String {
        let ConvShape { n, c, h, w, .. } = self.shape;
        let Spectrum { height, width } = self.spectrum;
        format!("{}_{n}x{c}x{h}x{w}_{height}x{width}", self.name())
    }

    fn build_options(&self) -> Vec<String> {
        self.spectrum.build_options()
    }

    fn window(&self) -> Window {
        Window::items(self.shape.n * self.shape.c)
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize) -> Result<(), Status> {
        let shape = self.shape;
        let Spectrum { height, width } = self.spectrum;
        let src = pack.require(Slot::Src0)?.floats()?;
        let dst = pack.require(Slot::Dst)?.typed::<f32>()?;
        window
            .z
            .range()
            .into_par_iter()
            .with_min_len(lws.get())
            .for_each(|plane| {
                let (n, c) = (plane / shape.c, plane % shape.c);
                let mut buf = vec![Complex32::default(); height * width];
                for y in 0..shape.h {
                    for x in 0..shape.w {
                        buf[y * width + x].re = unsafe { src.get(shape.src_index(n, c, y, x)) }
                    }
                }
                self.plan.process(&mut buf);
                unsafe { store(dst, plane, &buf) }
            });
        Ok(())
    }
}

/// 翻转后的卷积核补零做正变换，输出 `[m, c, fh, fw, 2]`。
///
/// 翻转把互相关化为卷积，频域上只需逐点相乘。
pub(crate) struct FilterFftKernel {
    shape: ConvShape,
    spectrum: Spectrum,
    plan: Plan2d,
    tuning: Tuning,
}

impl FilterFftKernel {
    pub fn new(shape: ConvShape, spectrum: Spectrum) -> Self {
        Self {
            shape,
            spectrum,
            plan: Plan2d::forward(spectrum),
            tuning: Tuning::default(),
        }
    }
}

impl Kernel for FilterFftKernel {
    fn name(&self) -> &'static str {
        "fft_conv_filter"
    }

    fn config_id(&self) -> String {
        let ConvShape { m, c, kh, kw, .. } = self.shape;
        let Spectrum { height, width } = self.spectrum;
        format!("{}_{m}x{c}x{kh}x{kw}_{height}x{width}", self.name())
    }

    fn build_options(&self) -> Vec<String> {
        self.spectrum.build_options()
    }

    fn window(&self) -> Window {
        Window::items(self.shape.m * self.shape.c)
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize) -> Result<(), Status> {
        let shape = self.shape;
        let ConvShape { kh, kw, .. } = shape;
        let Spectrum { height, width } = self.spectrum;
        let src = pack.require(Slot::Src1)?.floats()?;
        let dst = pack.require(Slot::Dst)?.typed::<f32>()?;
        window
            .z
            .range()
            .into_par_iter()
            .with_min_len(lws.get())
            .for_each(|plane| {
                let (m, c) = (plane / shape.c, plane % shape.c);
                let mut buf = vec![Complex32::default(); height * width];
                for y in 0..kh {
                    for x in 0..kw {
                        let val = unsafe { src.get(shape.weight_index(m, c, kh - 1 - y, kw - 1 - x)) };
                        buf[y * width + x].re = val
                    }
                }
                self.plan.process(&mut buf);
                unsafe { store(dst, plane, &buf) }
            });
        Ok(())
    }
}

/// 每个频率上对输入通道求和：`Y[n, m] = Σ_c X[n, c] · W[m, c]`。
pub(crate) struct ReduceKernel {
    shape: ConvShape,
    spectrum: Spectrum,
    tuning: Tuning,
}

impl ReduceKernel {
    pub fn new(shape: ConvShape, spectrum: Spectrum) -> Self {
        Self {
            shape,
            spectrum,
            tuning: Tuning::default(),
        }
    }
}

impl Kernel for ReduceKernel {
    fn name(&self) -> &'static str {
        "fft_conv_reduce"
    }

    fn config_id(&self) -> String {
        let ConvShape { n, c, m, .. } = self.shape;
        let Spectrum { height, width } = self.spectrum;
        format!("{}_{n}x{c}x{m}_{height}x{width}", self.name())
    }

    fn window(&self) -> Window {
        Window::items(self.shape.n * self.shape.m)
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize) -> Result<(), Status> {
        let ConvShape { c: c_, m: m_, .. } = self.shape;
        let len = self.spectrum.len();
        let input = pack.require(Slot::Src0)?.typed::<f32>()?;
        let filter = pack.require(Slot::Src1)?.typed::<f32>()?;
        let dst = pack.require(Slot::Dst)?.typed::<f32>()?;
        window
            .z
            .range()
            .into_par_iter()
            .with_min_len(lws.get())
            .for_each(|plane| {
                let (n, m) = (plane / m_, plane % m_);
                let mut acc = vec![Complex32::default(); len];
                for c in 0..c_ {
                    let x = unsafe { load(input, n * c_ + c, len) };
                    let w = unsafe { load(filter, m * c_ + c, len) };
                    for ((acc, x), w) in acc.iter_mut().zip(x).zip(w) {
                        *acc += x * w
                    }
                }
                unsafe { store(dst, plane, &acc) }
            });
        Ok(())
    }
}

/// 逆变换后裁剪出输出、归一化，融合偏置和激活并按输出布局写回。
pub(crate) struct OutputIfftKernel {
    shape: ConvShape,
    spectrum: Spectrum,
    plan: Plan2d,
    /// 裁剪起点，即卷积核尺寸减一再减去前侧填充。
    offset: (usize, usize),
    has_bias: bool,
    bounds: (f32, f32),
    tuning: Tuning,
}

impl OutputIfftKernel {
    pub fn new(
        shape: ConvShape,
        spectrum: Spectrum,
        offset: (usize, usize),
        has_bias: bool,
        bounds: (f32, f32),
    ) -> Self {
        Self {
            shape,
            spectrum,
            plan: Plan2d::inverse(spectrum),
            offset,
            has_bias,
            bounds,
            tuning: Tuning::default(),
        }
    }
}

impl Kernel for OutputIfftKernel {
    fn name(&self) -> &'static str {
        "fft_conv_output"
    }

    fn config_id(&self) -> String {
        let ConvShape { n, m, oh, ow, .. } = self.shape;
        let Spectrum { height, width } = self.spectrum;
        format!("{}_{n}x{m}x{oh}x{ow}_{height}x{width}", self.name())
    }

    fn build_options(&self) -> Vec<String> {
        let mut options = self.spectrum.build_options();
        options.push(format!("-DDATA_LAYOUT={:?}", self.shape.layout).to_uppercase());
        if self.has_bias {
            options.push("-DHAS_BIAS".into())
        }
        options
    }

    fn window(&self) -> Window {
        Window::items(self.shape.n * self.shape.m)
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize) -> Result<(), Status> {
        let shape = self.shape;
        let Spectrum { width, .. } = self.spectrum;
        let len = self.spectrum.len();
        let scale = (len as f32).recip();
        let (y0, x0) = self.offset;
        let (lo, hi) = self.bounds;

        let src = pack.require(Slot::Src0)?.typed::<f32>()?;
        let bias = if self.has_bias {
            Some(pack.require(Slot::Src2)?.floats()?)
        } else {
            None
        };
        let dst = pack.require(Slot::Dst)?.floats()?;
        window
            .z
            .range()
            .into_par_iter()
            .with_min_len(lws.get())
            .for_each(|plane| {
                let (n, m) = (plane / shape.m, plane % shape.m);
                let mut buf = unsafe { load(src, plane, len) };
                self.plan.process(&mut buf);
                let b = bias.map_or(0., |b| unsafe { b.get(m) });
                for oy in 0..shape.oh {
                    for ox in 0..shape.ow {
                        let val = buf[(oy + y0) * width + ox + x0].re * scale + b;
                        unsafe { dst.set(shape.dst_index(n, m, oy, ox), val.max(lo).min(hi)) }
                    }
                }
            });
        Ok(())
    }
}

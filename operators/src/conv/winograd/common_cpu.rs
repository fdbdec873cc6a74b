use super::{
    transform::{sandwich, WinogradTransform},
    Tiling,
};
use crate::{
    conv::ConvShape,
    scheduler::{LocalWorkSize, Tuning},
    BorderSize, Kernel, Slot, Status, TensorPack, Window,
};
use rayon::prelude::*;

/// 把输入复制到零填充的 `f32` NCHW 暂存区，补齐填充和末尾不完整的分块。
pub(crate) struct FillBorderKernel {
    shape: ConvShape,
    tiling: Tiling,
    tuning: Tuning,
}

impl FillBorderKernel {
    pub fn new(shape: ConvShape, tiling: Tiling) -> Self {
        Self {
            shape,
            tiling,
            tuning: Tuning::default(),
        }
    }
}

impl Kernel for FillBorderKernel {
    fn name(&self) -> &'static str {
        "fill_border"
    }

    fn config_id(&self) -> String {
        let ConvShape { dt, n, c, h, w, .. } = self.shape;
        let Tiling { hp, wp, .. } = self.tiling;
        format!("{}_{dt}_{n}x{c}x{h}x{w}_{hp}x{wp}", self.name())
    }

    fn build_options(&self) -> Vec<String> {
        vec![
            format!("-DDATA_TYPE={}", self.shape.dt),
            format!("-DDATA_LAYOUT={:?}", self.shape.layout).to_uppercase(),
        ]
    }

    fn window(&self) -> Window {
        Window::items(self.shape.n * self.shape.c)
    }

    fn border_size(&self) -> BorderSize {
        let ConvShape { h, w, .. } = self.shape;
        let Tiling {
            pad_top,
            pad_left,
            hp,
            wp,
            ..
        } = self.tiling;
        BorderSize {
            top: pad_top,
            right: wp.saturating_sub(pad_left + w),
            bottom: hp.saturating_sub(pad_top + h),
            left: pad_left,
        }
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize) -> Result<(), Status> {
        let shape = self.shape;
        let Tiling {
            pad_top,
            pad_left,
            hp,
            wp,
            ..
        } = self.tiling;
        let src = pack.require(Slot::Src0)?.floats()?;
        let dst = pack.require(Slot::Dst)?.typed::<f32>()?;
        window
            .z
            .range()
            .into_par_iter()
            .with_min_len(lws.get())
            .for_each(|plane| unsafe {
                let (n, c) = (plane / shape.c, plane % shape.c);
                for y in 0..hp {
                    let sy = y.checked_sub(pad_top).filter(|&sy| sy < shape.h);
                    for x in 0..wp {
                        let sx = x.checked_sub(pad_left).filter(|&sx| sx < shape.w);
                        let val = match (sy, sx) {
                            (Some(sy), Some(sx)) => src.get(shape.src_index(n, c, sy, sx)),
                            _ => 0.,
                        };
                        dst.write((plane * hp + y) * wp + x, val)
                    }
                }
            });
        Ok(())
    }
}

/// 对每个输入分块计算 `BT · d · BTᵀ`，输出 `[α², n·tiles, c]`。
pub(crate) struct InputTransformKernel {
    shape: ConvShape,
    tiling: Tiling,
    th: WinogradTransform,
    tw: WinogradTransform,
    tuning: Tuning,
}

impl InputTransformKernel {
    pub fn new(shape: ConvShape, tiling: Tiling) -> Self {
        Self {
            shape,
            th: tiling.transform_h(),
            tw: tiling.transform_w(),
            tiling,
            tuning: Tuning::default(),
        }
    }
}

impl Kernel for InputTransformKernel {
    fn name(&self) -> &'static str {
        "winograd_input_transform"
    }

    fn config_id(&self) -> String {
        let ConvShape { n, c, kh, kw, .. } = self.shape;
        let Tiling { tiles_h, tiles_w, .. } = self.tiling;
        format!(
            "{}_F({}x{},{kh}x{kw})_{n}x{c}_{tiles_h}x{tiles_w}",
            self.name(),
            self.tiling.tile.height,
            self.tiling.tile.width
        )
    }

    fn build_options(&self) -> Vec<String> {
        self.tiling.build_options()
    }

    fn window(&self) -> Window {
        Window::items(self.shape.n * self.tiling.tiles())
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize) -> Result<(), Status> {
        let Self {
            shape,
            tiling,
            th,
            tw,
            ..
        } = self;
        let (ah, aw) = (th.alpha(), tw.alpha());
        let Tiling {
            tile, hp, wp, tiles_w, ..
        } = *tiling;
        let tiles = tiling.tiles();
        let rows = shape.n * tiles;
        let c_ = shape.c;
        let src = pack.require(Slot::Src0)?.typed::<f32>()?;
        let dst = pack.require(Slot::Dst)?.typed::<f32>()?;

        window
            .z
            .range()
            .into_par_iter()
            .with_min_len(lws.get())
            .for_each(|row| {
                let (n, t) = (row / tiles, row % tiles);
                let y0 = (t / tiles_w) * tile.height;
                let x0 = (t % tiles_w) * tile.width;
                let mut d = vec![0f32; ah * aw];
                for c in 0..c_ {
                    let plane = (n * c_ + c) * hp;
                    for i in 0..ah {
                        for j in 0..aw {
                            d[i * aw + j] = unsafe { src.read((plane + y0 + i) * wp + x0 + j) }
                        }
                    }
                    let v = sandwich(&th.bt, &d, &tw.bt);
                    for (xi, &val) in v.iter().enumerate() {
                        unsafe { dst.write((xi * rows + row) * c_ + c, val) }
                    }
                }
            });
        Ok(())
    }
}

/// 对每个卷积核计算 `G · g · Gᵀ`，输出 `[α², c, m]`。
pub(crate) struct FilterTransformKernel {
    shape: ConvShape,
    tiling: Tiling,
    th: WinogradTransform,
    tw: WinogradTransform,
    tuning: Tuning,
}

impl FilterTransformKernel {
    pub fn new(shape: ConvShape, tiling: Tiling) -> Self {
        Self {
            shape,
            th: tiling.transform_h(),
            tw: tiling.transform_w(),
            tiling,
            tuning: Tuning::default(),
        }
    }
}

impl Kernel for FilterTransformKernel {
    fn name(&self) -> &'static str {
        "winograd_filter_transform"
    }

    fn config_id(&self) -> String {
        let ConvShape { m, c, kh, kw, .. } = self.shape;
        format!(
            "{}_F({}x{},{kh}x{kw})_{m}x{c}",
            self.name(),
            self.tiling.tile.height,
            self.tiling.tile.width
        )
    }

    fn build_options(&self) -> Vec<String> {
        self.tiling.build_options()
    }

    fn window(&self) -> Window {
        Window::items(self.shape.m)
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize) -> Result<(), Status> {
        let Self { shape, th, tw, .. } = self;
        let ConvShape { m: m_, c: c_, kh, kw, .. } = *shape;
        let src = pack.require(Slot::Src1)?.floats()?;
        let dst = pack.require(Slot::Dst)?.typed::<f32>()?;

        window
            .z
            .range()
            .into_par_iter()
            .with_min_len(lws.get())
            .for_each(|m| {
                let mut g = vec![0f32; kh * kw];
                for c in 0..c_ {
                    for y in 0..kh {
                        for x in 0..kw {
                            g[y * kw + x] = unsafe { src.get(shape.weight_index(m, c, y, x)) }
                        }
                    }
                    let u = sandwich(&th.g, &g, &tw.g);
                    for (xi, &val) in u.iter().enumerate() {
                        unsafe { dst.write((xi * c_ + c) * m_ + m, val) }
                    }
                }
            });
        Ok(())
    }
}

/// 对每个输出分块计算 `AT · M · ATᵀ`，融合偏置和激活后按输出布局写回。
pub(crate) struct OutputTransformKernel {
    shape: ConvShape,
    tiling: Tiling,
    th: WinogradTransform,
    tw: WinogradTransform,
    has_bias: bool,
    bounds: (f32, f32),
    tuning: Tuning,
}

impl OutputTransformKernel {
    pub fn new(shape: ConvShape, tiling: Tiling, has_bias: bool, bounds: (f32, f32)) -> Self {
        Self {
            shape,
            th: tiling.transform_h(),
            tw: tiling.transform_w(),
            tiling,
            has_bias,
            bounds,
            tuning: Tuning::default(),
        }
    }
}

impl Kernel for OutputTransformKernel {
    fn name(&self) -> &'static str {
        "winograd_output_transform"
    }

    fn config_id(&self) -> String {
        let ConvShape { n, m, oh, ow, .. } = self.shape;
        format!(
            "{}_F({}x{})_{}_{n}x{m}x{oh}x{ow}",
            self.name(),
            self.tiling.tile.height,
            self.tiling.tile.width,
            self.shape.dt
        )
    }

    fn build_options(&self) -> Vec<String> {
        let mut options = self.tiling.build_options();
        options.push(format!("-DDATA_TYPE={}", self.shape.dt));
        if self.has_bias {
            options.push("-DHAS_BIAS".into())
        }
        if self.bounds.0.is_finite() || self.bounds.1.is_finite() {
            options.push("-DFUSED_ACTIVATION".into())
        }
        options
    }

    fn window(&self) -> Window {
        Window::items(self.shape.n * self.tiling.tiles())
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize) -> Result<(), Status> {
        let Self {
            shape,
            tiling,
            th,
            tw,
            ..
        } = self;
        let (ah, aw) = (th.alpha(), tw.alpha());
        let Tiling { tile, tiles_w, .. } = *tiling;
        let tiles = tiling.tiles();
        let rows = shape.n * tiles;
        let m_ = shape.m;
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
            .for_each(|row| {
                let (n, t) = (row / tiles, row % tiles);
                let y0 = (t / tiles_w) * tile.height;
                let x0 = (t % tiles_w) * tile.width;
                let mut acc = vec![0f32; ah * aw];
                for m in 0..m_ {
                    for (xi, val) in acc.iter_mut().enumerate() {
                        *val = unsafe { src.read((xi * rows + row) * m_ + m) }
                    }
                    let y = sandwich(&th.at, &acc, &tw.at);
                    let b = bias.map_or(0., |b| unsafe { b.get(m) });
                    for i in 0..tile.height {
                        let oy = y0 + i;
                        if oy >= shape.oh {
                            break;
                        }
                        for j in 0..tile.width {
                            let ox = x0 + j;
                            if ox >= shape.ow {
                                break;
                            }
                            let val = (y[i * tile.width + j] + b).max(lo).min(hi);
                            unsafe { dst.set(shape.dst_index(n, m, oy, ox), val) }
                        }
                    }
                }
            });
        Ok(())
    }
}

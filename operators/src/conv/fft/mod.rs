mod common_cpu;

use super::{Conv2dInfo, ConvShape, Size2D};
use crate::{
    args_not_support, clamp_bounds,
    handle::{CommandQueue, DeviceInfo},
    scheduler::Scheduler,
    shape_not_support, type_not_support, AuxHandle, DataType, Lifetime, MemoryRequirement,
    Operands, Operator, Requirements, Slot, Status, Tensor, TensorDesc, TensorPack,
};
use common_cpu::{FilterFftKernel, InputFftKernel, OutputIfftKernel, ReduceKernel};
use std::sync::Arc;

/// 输入频谱。
pub const INPUT_SPECTRUM: Slot = Slot::Aux(0);
/// 卷积核频谱。
pub const FILTER_SPECTRUM: Slot = Slot::Aux(1);
/// 按通道归约后的频谱。
pub const OUTPUT_SPECTRUM: Slot = Slot::Aux(2);

/// 频域平面的尺寸，两个方向都是 2 的幂，足以容纳线性卷积不发生回绕。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Spectrum {
    pub height: usize,
    pub width: usize,
}

impl Spectrum {
    fn new(shape: &ConvShape) -> Self {
        Self {
            height: (shape.h + shape.kh - 1).next_power_of_two(),
            width: (shape.w + shape.kw - 1).next_power_of_two(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.height * self.width
    }

    /// 以交错实部虚部的 `f32` 存储若干个平面。
    fn desc(&self, planes: [usize; 2]) -> TensorDesc {
        TensorDesc::new(DataType::F32, &[planes[0], planes[1], self.height, self.width, 2])
    }

    fn build_options(&self) -> Vec<String> {
        vec![
            format!("-DFFT_HEIGHT={}", self.height),
            format!("-DFFT_WIDTH={}", self.width),
        ]
    }
}

fn check(info: &Conv2dInfo) -> Result<ConvShape, Status> {
    let shape = info.validate()?;
    if shape.dt != DataType::F32 {
        return Err(type_not_support(format!("fft convolution on {}", shape.dt)));
    }
    if !info.conv.is_unit_stride() || info.dilation != Size2D::ONE {
        return Err(args_not_support(format!(
            "fft convolution with stride {:?} and dilation {:?}",
            info.conv.stride, info.dilation
        )));
    }
    if shape.kh % 2 == 0 || shape.kw % 2 == 0 {
        return Err(shape_not_support(format!(
            "fft convolution with even {}x{} kernel",
            shape.kh, shape.kw
        )));
    }
    let conv = &info.conv;
    let (px, py) = (shape.kw / 2, shape.kh / 2);
    if [conv.pad_left, conv.pad_right] != [px, px] || [conv.pad_top, conv.pad_bottom] != [py, py] {
        return Err(args_not_support(format!(
            "fft convolution requires same padding, got {conv:?}"
        )));
    }
    Ok(shape)
}

/// 频域卷积：输入和卷积核分别变换，逐频率按通道归约，再逆变换裁剪出输出。
///
/// 张量包中 `Src0` 为输入，`Src1` 为权重，`Src2` 为可选偏置，`Dst` 为输出。
pub struct FftConv2d {
    input_fft: Arc<InputFftKernel>,
    filter_fft: Arc<FilterFftKernel>,
    reduce: Arc<ReduceKernel>,
    output_ifft: Arc<OutputIfftKernel>,
    input_spectrum: AuxHandle,
    filter_spectrum: AuxHandle,
    output_spectrum: AuxHandle,
    reqs: Requirements,
    operands: Operands,
    filter_cache: Option<Tensor>,
    prepared: bool,
}

impl Operator for FftConv2d {
    type Info = Conv2dInfo;

    fn validate(info: &Conv2dInfo) -> Result<(), Status> {
        check(info).map(|_| ())
    }

    fn configure(info: &Conv2dInfo, _device: &DeviceInfo) -> Result<Self, Status> {
        let shape = check(info)?;
        let spectrum = Spectrum::new(&shape);
        let ConvShape { n, c, m, kh, kw, .. } = shape;

        let x_desc = spectrum.desc([n, c]);
        let w_desc = spectrum.desc([m, c]);
        let y_desc = spectrum.desc([n, m]);
        let reqs = Requirements::merge(
            [
                (INPUT_SPECTRUM, &x_desc, Lifetime::Temporary),
                (FILTER_SPECTRUM, &w_desc, Lifetime::Persistent),
                (OUTPUT_SPECTRUM, &y_desc, Lifetime::Temporary),
            ]
            .map(|(slot, desc, lifetime)| MemoryRequirement::new(slot, desc.size(), lifetime)),
        );
        log::debug!(
            "fft conv {kh}x{kw} over {}x{} spectrum",
            spectrum.height,
            spectrum.width
        );

        let offset = (kh - 1 - info.conv.pad_top, kw - 1 - info.conv.pad_left);
        Ok(Self {
            input_fft: Arc::new(InputFftKernel::new(shape, spectrum)),
            filter_fft: Arc::new(FilterFftKernel::new(shape, spectrum)),
            reduce: Arc::new(ReduceKernel::new(shape, spectrum)),
            output_ifft: Arc::new(OutputIfftKernel::new(
                shape,
                spectrum,
                offset,
                info.bias.is_some(),
                clamp_bounds(info.activation),
            )),
            input_spectrum: reqs.handle(INPUT_SPECTRUM, x_desc)?,
            filter_spectrum: reqs.handle(FILTER_SPECTRUM, w_desc)?,
            output_spectrum: reqs.handle(OUTPUT_SPECTRUM, y_desc)?,
            reqs,
            operands: info.operands(),
            filter_cache: None,
            prepared: false,
        })
    }

    fn workspace(&self) -> Vec<MemoryRequirement> {
        self.reqs.to_vec()
    }

    #[inline]
    fn is_prepared(&self) -> bool {
        self.prepared
    }

    fn prepare<Q: CommandQueue>(
        &mut self,
        pack: &TensorPack,
        scheduler: &mut Scheduler<Q>,
    ) -> Result<(), Status> {
        if self.prepared {
            return Ok(());
        }
        let weights = pack.require(Slot::Src1)?;
        let spectrum = self
            .filter_spectrum
            .resolve_cached(pack, &mut self.filter_cache)?;
        let sub = TensorPack::new()
            .with(Slot::Src1, weights)
            .with(Slot::Dst, &spectrum);
        scheduler.enqueue_op(&self.filter_fft, &sub, false)?;
        weights.mark_as_unused();
        self.prepared = true;
        Ok(())
    }

    fn run<Q: CommandQueue>(
        &mut self,
        pack: &TensorPack,
        scheduler: &mut Scheduler<Q>,
    ) -> Result<(), Status> {
        self.operands.check(pack)?;
        self.prepare(pack, scheduler)?;

        let x = self.input_spectrum.resolve(pack)?.into_tensor();
        let sub = TensorPack::new()
            .with(Slot::Src0, pack.require(Slot::Src0)?)
            .with(Slot::Dst, &x);
        scheduler.enqueue_op(&self.input_fft, &sub, false)?;

        let w = self
            .filter_spectrum
            .resolve_cached(pack, &mut self.filter_cache)?;
        let y = self.output_spectrum.resolve(pack)?.into_tensor();
        let sub = TensorPack::new()
            .with(Slot::Src0, &x)
            .with(Slot::Src1, &w)
            .with(Slot::Dst, &y);
        scheduler.enqueue_op(&self.reduce, &sub, false)?;

        let mut sub = TensorPack::new()
            .with(Slot::Src0, &y)
            .with(Slot::Dst, pack.require(Slot::Dst)?);
        if let Some(bias) = pack.get(Slot::Src2) {
            sub.add(Slot::Src2, bias)
        }
        scheduler.enqueue_op(&self.output_ifft, &sub, true)
    }
}

mod common_cpu;

use super::{Conv2dInfo, ConvShape, Size2D};
use crate::{
    args_not_support, clamp_bounds,
    handle::{CommandQueue, DeviceInfo},
    scheduler::{Scheduler, Tuning},
    shape_not_support, DataLayout, MemoryRequirement, Operands, Operator, Slot, Status,
    TensorPack,
};
use common_cpu::DirectConvKernel;
use std::sync::Arc;

/// NCHW 下直接卷积支持的方形卷积核。
const NCHW_KERNELS: [usize; 4] = [1, 3, 5, 9];
/// NCHW 下直接卷积支持的最大步长。
const NCHW_MAX_STRIDE: usize = 3;

fn check(info: &Conv2dInfo) -> Result<ConvShape, Status> {
    let shape = info.validate()?;
    if info.dilation != Size2D::ONE {
        return Err(args_not_support(format!(
            "direct convolution with dilation {:?}",
            info.dilation
        )));
    }
    if shape.layout == DataLayout::Nchw {
        let (sx, sy) = info.conv.stride;
        if shape.kh != shape.kw || !NCHW_KERNELS.contains(&shape.kw) {
            return Err(shape_not_support(format!(
                "direct convolution on NCHW with {}x{} kernel",
                shape.kh, shape.kw
            )));
        }
        if sx > NCHW_MAX_STRIDE || sy > NCHW_MAX_STRIDE {
            return Err(args_not_support(format!(
                "direct convolution on NCHW with stride {:?}",
                info.conv.stride
            )));
        }
    }
    Ok(shape)
}

/// 单核函数的直接卷积，不需要辅助存储。
///
/// 张量包中 `Src0` 为输入，`Src1` 为权重，`Src2` 为可选偏置，`Dst` 为输出。
pub struct DirectConv2d {
    kernel: Arc<DirectConvKernel>,
    operands: Operands,
    prepared: bool,
}

impl Operator for DirectConv2d {
    type Info = Conv2dInfo;

    fn validate(info: &Conv2dInfo) -> Result<(), Status> {
        check(info).map(|_| ())
    }

    fn configure(info: &Conv2dInfo, _device: &DeviceInfo) -> Result<Self, Status> {
        let shape = check(info)?;
        log::debug!(
            "direct conv {}x{} on {} {:?}",
            shape.kh,
            shape.kw,
            shape.dt,
            shape.layout
        );
        Ok(Self {
            kernel: Arc::new(DirectConvKernel {
                shape,
                conv: info.conv,
                has_bias: info.bias.is_some(),
                bounds: clamp_bounds(info.activation),
                quant: [info.src.quant(), info.weights.quant(), info.dst.quant()],
                tuning: Tuning::default(),
            }),
            operands: info.operands(),
            prepared: false,
        })
    }

    fn workspace(&self) -> Vec<MemoryRequirement> {
        Vec::new()
    }

    #[inline]
    fn is_prepared(&self) -> bool {
        self.prepared
    }

    fn prepare<Q: CommandQueue>(
        &mut self,
        _pack: &TensorPack,
        _scheduler: &mut Scheduler<Q>,
    ) -> Result<(), Status> {
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
        let mut sub = TensorPack::new()
            .with(Slot::Src0, pack.require(Slot::Src0)?)
            .with(Slot::Src1, pack.require(Slot::Src1)?)
            .with(Slot::Dst, pack.require(Slot::Dst)?);
        if let Some(bias) = pack.get(Slot::Src2) {
            sub.add(Slot::Src2, bias)
        }
        scheduler.enqueue_op(&self.kernel, &sub, true)
    }
}

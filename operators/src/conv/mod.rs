mod args;
mod direct;
mod fft;
mod gemm;
mod method;
mod winograd;

#[cfg(test)]
mod test_utils;

pub use args::{Conv2dInfo, ConvShape, DimensionRounding, PadStrideInfo, Size2D};
pub use direct::DirectConv2d;
pub use fft::FftConv2d;
pub use gemm::GemmConv2d;
pub use method::{select, select_with, ConvolutionMethod, KnownConfig, SelectorConfig, SrganRule};
pub use winograd::{winograd_output_tile, Matrix, WinogradConv2d, WinogradTransform};

use crate::{
    handle::{CommandQueue, DeviceInfo},
    scheduler::Scheduler,
    MemoryRequirement, Operator, Slot, Status, Tensor, TensorPack,
};

/// 由方法选择器决定实现的二维卷积。
///
/// 张量包中 `Src0` 为输入，`Src1` 为权重，`Src2` 为可选偏置，`Dst` 为输出。
pub enum Conv2d {
    Gemm(GemmConv2d),
    Direct(DirectConv2d),
    Winograd(WinogradConv2d),
    Fft(FftConv2d),
}

macro_rules! dispatch {
    ($self:expr, $op:ident => $body:expr) => {
        match $self {
            Self::Gemm($op) => $body,
            Self::Direct($op) => $body,
            Self::Winograd($op) => $body,
            Self::Fft($op) => $body,
        }
    };
}

impl Conv2d {
    #[inline]
    pub fn method(&self) -> ConvolutionMethod {
        match self {
            Self::Gemm(_) => ConvolutionMethod::Gemm,
            Self::Direct(_) => ConvolutionMethod::Direct,
            Self::Winograd(_) => ConvolutionMethod::Winograd,
            Self::Fft(_) => ConvolutionMethod::Fft,
        }
    }

    /// 以指定方法配置，不经过选择器。
    pub fn configure_with(
        info: &Conv2dInfo,
        device: &DeviceInfo,
        method: ConvolutionMethod,
    ) -> Result<Self, Status> {
        Ok(match method {
            ConvolutionMethod::Gemm => Self::Gemm(GemmConv2d::configure(info, device)?),
            ConvolutionMethod::Direct => Self::Direct(DirectConv2d::configure(info, device)?),
            ConvolutionMethod::Winograd => Self::Winograd(WinogradConv2d::configure(info, device)?),
            ConvolutionMethod::Fft => Self::Fft(FftConv2d::configure(info, device)?),
        })
    }
}

impl Operator for Conv2d {
    type Info = Conv2dInfo;

    /// GEMM 接受所有通过公共检查的配置。
    fn validate(info: &Conv2dInfo) -> Result<(), Status> {
        GemmConv2d::validate(info)
    }

    fn configure(info: &Conv2dInfo, device: &DeviceInfo) -> Result<Self, Status> {
        let method = select(info, device.target)?;
        Self::configure_with(info, device, method)
    }

    fn workspace(&self) -> Vec<MemoryRequirement> {
        dispatch!(self, op => op.workspace())
    }

    fn is_prepared(&self) -> bool {
        dispatch!(self, op => op.is_prepared())
    }

    fn prepare<Q: CommandQueue>(
        &mut self,
        pack: &TensorPack,
        scheduler: &mut Scheduler<Q>,
    ) -> Result<(), Status> {
        dispatch!(self, op => op.prepare(pack, scheduler))
    }

    fn run<Q: CommandQueue>(
        &mut self,
        pack: &TensorPack,
        scheduler: &mut Scheduler<Q>,
    ) -> Result<(), Status> {
        dispatch!(self, op => op.run(pack, scheduler))
    }
}

/// 子算子的张量包：带上流水线的全部工作空间槽，再放入指定的操作数。
fn with_workspace(pack: &TensorPack, operands: &[(Slot, &Tensor)]) -> TensorPack {
    let mut sub = TensorPack::new();
    for (slot, t) in pack.iter().filter(|(slot, _)| matches!(slot, Slot::Aux(_))) {
        sub.add(slot, t)
    }
    for &(slot, t) in operands {
        sub.add(slot, t)
    }
    sub
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        handle::{common_cpu::DeviceQueue, GpuTarget},
        memory::{Managed, WorkspacePool},
        Activation, DataType,
    };
    use test_utils::Case;

    #[test]
    fn test_polymorphic() {
        let device = DeviceInfo::new(GpuTarget::G76);
        let cases = [
            (Case::nchw(DataType::F32, [1, 16, 12, 12], 16, 3, 1), ConvolutionMethod::Winograd),
            (
                Case::nchw(DataType::F32, [1, 16, 12, 12], 8, 3, 1)
                    .with_conv(PadStrideInfo::new(1, 1, 2, 2), Size2D::new(2, 2)),
                ConvolutionMethod::Gemm,
            ),
            (Case::nchw(DataType::F32, [1, 4, 10, 10], 8, 3, 1), ConvolutionMethod::Gemm),
            (Case::nchw(DataType::F32, [1, 24, 14, 14], 8, 7, 3), ConvolutionMethod::Fft),
            (
                Case::nhwc(DataType::F32, [1, 32, 9, 9], 16, [5, 5], [2, 2]),
                ConvolutionMethod::Direct,
            ),
            (
                Case::nhwc(DataType::QAsymm8, [1, 16, 8, 8], 8, [3, 3], [1, 1]),
                ConvolutionMethod::Gemm,
            ),
        ];
        for (case, method) in cases {
            let case = case.with_bias().with_activation(Activation::Relu);
            let op = Conv2d::configure(&case.info, &device).unwrap();
            assert_eq!(op.method(), method);
            let (abs, rel) = if case.info.src.dt().is_quantized() {
                (1., 0.)
            } else {
                (1e-3, 1e-3)
            };
            case.run::<Conv2d>(&device, abs, rel);
        }
    }

    #[test]
    fn test_forced_methods_agree() {
        let device = DeviceInfo::default();
        let case = Case::nchw(DataType::F32, [2, 16, 11, 11], 8, 3, 1).with_bias();
        let methods = [
            ConvolutionMethod::Gemm,
            ConvolutionMethod::Direct,
            ConvolutionMethod::Winograd,
            ConvolutionMethod::Fft,
        ];
        let mut scheduler: Scheduler<DeviceQueue> = Scheduler::new();
        scheduler.default_init(None, None, device.target).unwrap();
        for method in methods {
            let mut op = Conv2d::configure_with(&case.info, &device, method).unwrap();
            let pack = case.pack();
            op.run(&pack, &mut scheduler).unwrap();
            case.check(&pack, &mut scheduler, 1e-3, 1e-3);
        }
    }

    #[test]
    fn test_managed_with_shared_pool() {
        let device = DeviceInfo::default();
        let a = Case::nchw(DataType::F32, [1, 16, 10, 10], 16, 3, 1);
        let b = Case::nchw(DataType::F32, [1, 8, 9, 9], 4, 3, 1).with_bias();

        let mut scheduler: Scheduler = Scheduler::new();
        scheduler.default_init(None, None, device.target).unwrap();
        let mut pool = WorkspacePool::new();
        let mut first = Managed::new(Conv2d::configure(&a.info, &device).unwrap());
        let mut second = Managed::new(
            Conv2d::configure_with(&b.info, &device, ConvolutionMethod::Gemm).unwrap(),
        );

        let (pa, pb) = (a.pack(), b.pack());
        for _ in 0..2 {
            first.run(&pa, &mut scheduler, Some(&mut pool)).unwrap();
            a.check(&pa, &mut scheduler, 1e-3, 1e-3);
            second.run(&pb, &mut scheduler, Some(&mut pool)).unwrap();
            b.check(&pb, &mut scheduler, 1e-3, 1e-3);
        }
        assert!(pool.size() > 0);
    }

    #[test]
    fn test_configure_rejects() {
        let device = DeviceInfo::default();
        // F16 的 Winograd 需要快速数学
        let case = Case::nchw(DataType::F16, [1, 3, 8, 8], 4, 3, 1);
        assert!(Conv2d::configure_with(&case.info, &device, ConvolutionMethod::Winograd).is_err());

        let mut bad = case.info.clone();
        bad.weights = crate::TensorDesc::new(DataType::F32, &[4, 3, 3]);
        assert!(Conv2d::validate(&bad).is_err());
        assert!(Conv2d::configure(&bad, &device).is_err());
    }
}

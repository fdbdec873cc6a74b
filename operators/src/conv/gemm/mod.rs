mod common_cpu;

use super::{with_workspace, Conv2dInfo, ConvShape};
use crate::{
    clamp_bounds,
    handle::{CommandQueue, DeviceInfo},
    mat_mul::{Gemm, GemmInfo},
    scheduler::{Scheduler, Tuning},
    AuxHandle, DataType, Lifetime, MemoryRequirement, Operands, Operator, Requirements, Slot,
    Status, Tensor, TensorDesc, TensorPack,
};
use common_cpu::{GemmLowpKernel, Im2ColKernel, OutputStageKernel, WeightsReshapeKernel};
use std::sync::Arc;

/// 展开后的输入。
pub const IM2COL_OUTPUT: Slot = Slot::Aux(0);
/// 重排为 `[k, m]` 的权重。
pub const RESHAPED_WEIGHTS: Slot = Slot::Aux(1);
/// 矩阵乘的结果。
pub const GEMM_OUTPUT: Slot = Slot::Aux(2);

/// 矩阵乘的两种实现。
enum Product {
    /// 浮点，委托给批量矩阵乘算子。
    Float(Gemm),
    /// 8 位量化，`i32` 累加。
    Lowp(Arc<GemmLowpKernel>),
}

/// 展开后做矩阵乘的卷积，接受所有通过公共检查的配置。
///
/// 张量包中 `Src0` 为输入，`Src1` 为权重，`Src2` 为可选偏置，`Dst` 为输出。
pub struct GemmConv2d {
    im2col: Arc<Im2ColKernel>,
    weights_reshape: Arc<WeightsReshapeKernel>,
    product: Product,
    output_stage: Arc<OutputStageKernel>,
    columns: AuxHandle,
    weights: AuxHandle,
    output: AuxHandle,
    reqs: Requirements,
    operands: Operands,
    weights_cache: Option<Tensor>,
    prepared: bool,
}

impl GemmConv2d {
    /// 浮点路径使用的矩阵乘，量化路径为 `None`。
    #[inline]
    pub fn gemm(&self) -> Option<&Gemm> {
        match &self.product {
            Product::Float(gemm) => Some(gemm),
            Product::Lowp(_) => None,
        }
    }

    /// 重排后的权重在准备后是否还会被读取。
    fn keeps_weights(&self) -> bool {
        !self.gemm().is_some_and(Gemm::caches_rhs)
    }
}

impl Operator for GemmConv2d {
    type Info = Conv2dInfo;

    fn validate(info: &Conv2dInfo) -> Result<(), Status> {
        info.validate().map(|_| ())
    }

    fn configure(info: &Conv2dInfo, device: &DeviceInfo) -> Result<Self, Status> {
        let shape = info.validate()?;
        let ConvShape {
            n, c, m, kh, kw, oh, ow, ..
        } = shape;
        let (p, k) = (oh * ow, c * kh * kw);
        let quantized = shape.dt.is_quantized();
        let acc = if quantized {
            DataType::S32
        } else {
            DataType::F32
        };

        let cols_desc = TensorDesc::new(acc, &[n, p, k]);
        let weights_desc = TensorDesc::new(acc, &[1, k, m]);
        let out_desc = TensorDesc::new(acc, &[n, p, m]);

        let (product, weights_lifetime, extra) = if quantized {
            let kernel = GemmLowpKernel {
                rows: n * p,
                n: m,
                k,
                a_offset: info.src.quant().offset,
                b_offset: info.weights.quant().offset,
                tuning: Tuning::default(),
            };
            (Product::Lowp(Arc::new(kernel)), Lifetime::Persistent, Vec::new())
        } else {
            let mut gemm_info = GemmInfo::new(cols_desc.clone(), weights_desc.clone());
            gemm_info.dst = out_desc.clone();
            let gemm = Gemm::configure(&gemm_info, device)?.embedded();
            let lifetime = if gemm.caches_rhs() {
                Lifetime::Prepare
            } else {
                Lifetime::Persistent
            };
            let extra = gemm.workspace();
            (Product::Float(gemm), lifetime, extra)
        };

        let own = [
            (IM2COL_OUTPUT, &cols_desc, Lifetime::Temporary),
            (RESHAPED_WEIGHTS, &weights_desc, weights_lifetime),
            (GEMM_OUTPUT, &out_desc, Lifetime::Temporary),
        ]
        .map(|(slot, desc, lifetime)| MemoryRequirement::new(slot, desc.size(), lifetime));
        let reqs = Requirements::merge(own.into_iter().chain(extra));

        let src_quant = info.src.quant();
        let multiplier = src_quant.scale * info.weights.quant().scale;
        log::debug!(
            "gemm conv {n}x{c}x{}x{} k{kh}x{kw} as [{}, {p}, {k}] x [{k}, {m}] on {}",
            shape.h,
            shape.w,
            n,
            shape.dt
        );

        Ok(Self {
            im2col: Arc::new(Im2ColKernel::new(shape, info.conv, info.dilation, src_quant)),
            weights_reshape: Arc::new(WeightsReshapeKernel::new(shape)),
            product,
            output_stage: Arc::new(OutputStageKernel {
                shape,
                has_bias: info.bias.is_some(),
                bounds: clamp_bounds(info.activation),
                multiplier,
                dst_quant: info.dst.quant(),
                tuning: Tuning::default(),
            }),
            columns: reqs.handle(IM2COL_OUTPUT, cols_desc)?,
            weights: reqs.handle(RESHAPED_WEIGHTS, weights_desc)?,
            output: reqs.handle(GEMM_OUTPUT, out_desc)?,
            reqs,
            operands: info.operands(),
            weights_cache: None,
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
        let reshaped = self.weights.resolve_cached(pack, &mut self.weights_cache)?;
        let sub = TensorPack::new()
            .with(Slot::Src1, weights)
            .with(Slot::Dst, &reshaped);
        scheduler.enqueue_op(&self.weights_reshape, &sub, false)?;
        weights.mark_as_unused();

        if let Product::Float(gemm) = &mut self.product {
            let sub = with_workspace(pack, &[(Slot::Src1, &reshaped)]);
            gemm.prepare(&sub, scheduler)?;
        }
        if !self.keeps_weights() {
            self.weights_cache = None
        }
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

        let src = pack.require(Slot::Src0)?;
        let dst = pack.require(Slot::Dst)?;

        let columns = self.columns.resolve(pack)?.into_tensor();
        let sub = TensorPack::new()
            .with(Slot::Src0, src)
            .with(Slot::Dst, &columns);
        scheduler.enqueue_op(&self.im2col, &sub, false)?;

        let output = self.output.resolve(pack)?.into_tensor();
        let keeps_weights = self.keeps_weights();
        let weights = if keeps_weights {
            Some(self.weights.resolve_cached(pack, &mut self.weights_cache)?)
        } else {
            None
        };
        match &mut self.product {
            Product::Float(gemm) => {
                let mut operands = vec![(Slot::Src0, &columns), (Slot::Dst, &output)];
                if let Some(w) = &weights {
                    operands.push((Slot::Src1, w))
                }
                gemm.run(&with_workspace(pack, &operands), scheduler)?
            }
            Product::Lowp(kernel) => {
                let mut sub = TensorPack::new()
                    .with(Slot::Src0, &columns)
                    .with(Slot::Dst, &output);
                if let Some(w) = &weights {
                    sub.add(Slot::Src1, w)
                }
                scheduler.enqueue_op(kernel, &sub, false)?
            }
        }

        let mut sub = TensorPack::new()
            .with(Slot::Src0, &output)
            .with(Slot::Dst, dst);
        if let Some(bias) = pack.get(Slot::Src2) {
            sub.add(Slot::Src2, bias)
        }
        scheduler.enqueue_op(&self.output_stage, &sub, true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        conv::{
            test_utils::{rejects_mismatched, Case},
            PadStrideInfo, Size2D,
        },
        handle::recording::{count_submits, RecordingQueue},
        Activation,
    };

    #[test]
    fn test_float() {
        let cases = [
            Case::nchw(DataType::F32, [2, 3, 9, 7], 5, 3, 1).with_bias(),
            Case::nchw(DataType::F32, [1, 4, 6, 6], 2, 1, 0),
            Case::nhwc(DataType::F32, [1, 6, 8, 5], 4, [3, 2], [1, 0]).with_bias(),
            Case::nchw(DataType::F16, [1, 8, 7, 7], 4, 3, 1),
            Case::nchw(DataType::F32, [1, 3, 11, 10], 4, 3, 2)
                .with_conv(PadStrideInfo::new(2, 1, 1, 2), Size2D::new(2, 3)),
            Case::nhwc(DataType::F32, [2, 5, 12, 12], 6, [5, 5], [0, 0])
                .with_conv(PadStrideInfo::new(2, 2, 1, 1), Size2D::ONE),
        ];
        for case in cases {
            let case = case.with_activation(Activation::Relu);
            case.run::<GemmConv2d>(&DeviceInfo::default(), 1e-3, 1e-3);
        }
    }

    #[test]
    fn test_quantized() {
        let cases = [
            Case::nchw(DataType::QAsymm8, [1, 4, 7, 7], 6, 3, 1).with_bias(),
            Case::nhwc(DataType::QAsymm8, [2, 3, 6, 5], 4, [3, 3], [1, 1]),
            Case::nchw(DataType::QAsymm8Signed, [1, 5, 8, 8], 3, 3, 1).with_bias(),
            Case::nhwc(DataType::QAsymm8Signed, [1, 4, 9, 9], 5, [3, 3], [1, 1])
                .with_conv(PadStrideInfo::new(2, 2, 2, 2), Size2D::new(2, 2))
                .with_bias(),
        ];
        for case in cases {
            let case = case.with_activation(Activation::BoundedRelu(6.));
            case.run::<GemmConv2d>(&DeviceInfo::default(), 1., 0.);
        }
    }

    #[test]
    fn test_weights_reshaped_once() {
        for dt in [DataType::F32, DataType::QAsymm8] {
            let case = Case::nchw(dt, [1, 8, 10, 10], 8, 3, 1);
            let device = DeviceInfo::default();
            let mut op = GemmConv2d::configure(&case.info, &device).unwrap();
            assert_eq!(op.gemm().is_some(), !dt.is_quantized());

            let (queue, log) = RecordingQueue::new(device);
            let mut scheduler = Scheduler::new();
            scheduler.init(queue, None);
            let pack = case.pack();
            for _ in 0..3 {
                op.run(&pack, &mut scheduler).unwrap();
            }
            op.prepare(&pack, &mut scheduler).unwrap();
            assert_eq!(count_submits(&log, "weights_reshape"), 1);
            assert_eq!(count_submits(&log, "im2col"), 3);
            assert_eq!(count_submits(&log, "conv_output_stage"), 3);
            assert!(!pack.require(Slot::Src1).unwrap().is_used());
            // 每次运行只在输出阶段冲刷
            assert_eq!(scheduler.stats().unwrap().flushes, 3);
            let (abs, rel) = if dt.is_quantized() { (1., 0.) } else { (1e-3, 1e-3) };
            case.check(&pack, &mut scheduler, abs, rel);
        }
    }

    #[test]
    fn test_workspace() {
        let device = DeviceInfo::default();
        let case = Case::nchw(DataType::QAsymm8Signed, [1, 4, 6, 6], 3, 3, 1);
        let op = GemmConv2d::configure(&case.info, &device).unwrap();
        let reqs = Requirements::merge(op.workspace());
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs.get(IM2COL_OUTPUT).unwrap().size, 36 * 36 * 4);
        assert_eq!(
            reqs.get(RESHAPED_WEIGHTS).unwrap().lifetime,
            Lifetime::Persistent
        );
        assert_eq!(reqs.get(GEMM_OUTPUT).unwrap().lifetime, Lifetime::Temporary);
    }

    #[test]
    fn test_operand_shapes() {
        let small = Case::nchw(DataType::F32, [1, 4, 6, 6], 4, 3, 1).with_bias();
        let large = Case::nchw(DataType::F32, [1, 4, 12, 12], 4, 3, 1).with_bias();
        rejects_mismatched::<GemmConv2d>(&small, &large, &DeviceInfo::default(), 1e-3, 1e-3);

        let small = Case::nchw(DataType::QAsymm8, [1, 3, 5, 5], 2, 3, 0);
        let large = Case::nchw(DataType::QAsymm8, [1, 3, 9, 9], 2, 3, 0);
        rejects_mismatched::<GemmConv2d>(&small, &large, &DeviceInfo::default(), 1., 0.);
    }
}

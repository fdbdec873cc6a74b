pub mod common_cpu;

mod args;
mod heuristics;
mod micro;

pub use args::GemmInfo;
pub use heuristics::{GemmHeuristics, GemmKernelType, GemmShape};
pub use micro::{MatMut, MatRef, MicroKernel};

use crate::{
    clamp_bounds,
    handle::{CommandQueue, DeviceInfo},
    scheduler::{Scheduler, Tuning},
    AuxHandle, DataType, Lifetime, MemoryRequirement, Operands, Operator, Requirements, Slot,
    Status, Tensor, TensorDesc, TensorPack,
};
use common_cpu::{MatMulKernel, ReshapeLhsKernel, ReshapeRhsKernel};
use std::sync::Arc;

/// 重排后的左操作数。
pub const LHS_RESHAPED: Slot = Slot::Aux(16);
/// 重排后的右操作数。
pub const RHS_RESHAPED: Slot = Slot::Aux(17);

/// 批量矩阵乘。
///
/// 张量包中 `Src0` 为左操作数，`Src1` 为右操作数，`Src2` 为可选偏置，`Dst` 为输出。
pub struct Gemm {
    kind: GemmKernelType,
    shape: GemmShape,
    constant_weights: bool,
    mm: Arc<MatMulKernel>,
    reshape_lhs: Option<(Arc<ReshapeLhsKernel>, AuxHandle)>,
    reshape_rhs: Option<(Arc<ReshapeRhsKernel>, AuxHandle)>,
    reqs: Requirements,
    operands: Operands,
    rhs_cache: Option<Tensor>,
    prepared: bool,
    flush: bool,
}

impl Gemm {
    #[inline]
    pub fn kind(&self) -> GemmKernelType {
        self.kind
    }

    #[inline]
    pub fn shape(&self) -> GemmShape {
        self.shape
    }

    /// 右操作数是否在准备阶段重排并常驻，此时原始权重在准备后不再被读取。
    #[inline]
    pub fn caches_rhs(&self) -> bool {
        self.constant_weights && self.reshape_rhs.is_some()
    }

    /// 作为流水线的中间阶段，提交后不冲刷队列。
    #[inline]
    pub fn embedded(mut self) -> Self {
        self.flush = false;
        self
    }

    /// 以指定变体和内核配置，不经过启发式。
    pub fn configure_with(
        info: &GemmInfo,
        kind: GemmKernelType,
        micro: MicroKernel,
    ) -> Result<Self, Status> {
        let (dt, shape, b_batch) = info.shape()?;
        let GemmShape { batch, m, n, k } = shape;
        let lhs_packed = kind == GemmKernelType::ReshapedLhsAndRhs;
        let rhs_packed = kind != GemmKernelType::Native;

        let mut reqs = Vec::new();
        if lhs_packed {
            reqs.push(MemoryRequirement::new(
                LHS_RESHAPED,
                batch * k * m * 4,
                Lifetime::Temporary,
            ))
        }
        if rhs_packed {
            let lifetime = if info.constant_weights {
                Lifetime::Persistent
            } else {
                Lifetime::Temporary
            };
            reqs.push(MemoryRequirement::new(
                RHS_RESHAPED,
                b_batch * n * k * 4,
                lifetime,
            ))
        }
        let reqs = Requirements::merge(reqs);

        let reshape_lhs = if lhs_packed {
            let desc = TensorDesc::new(DataType::F32, &[batch, k, m]);
            Some((
                Arc::new(ReshapeLhsKernel::new(dt, shape)),
                reqs.handle(LHS_RESHAPED, desc)?,
            ))
        } else {
            None
        };
        let reshape_rhs = if rhs_packed {
            let desc = TensorDesc::new(DataType::F32, &[b_batch, n, k]);
            Some((
                Arc::new(ReshapeRhsKernel::new(dt, shape, b_batch)),
                reqs.handle(RHS_RESHAPED, desc)?,
            ))
        } else {
            None
        };

        let mm = Arc::new(MatMulKernel {
            dt,
            shape,
            b_batch,
            alpha: info.alpha,
            has_bias: info.bias.is_some(),
            bounds: clamp_bounds(info.activation),
            lhs_packed,
            rhs_packed,
            micro,
            tuning: Tuning::default(),
        });
        log::debug!("gemm {batch}x{m}x{n}x{k} on {dt} uses {kind:?}");

        Ok(Self {
            kind,
            shape,
            constant_weights: info.constant_weights,
            mm,
            reshape_lhs,
            reshape_rhs,
            reqs,
            operands: info.operands(),
            rhs_cache: None,
            prepared: false,
            flush: true,
        })
    }

    fn reshape_rhs<Q: CommandQueue>(
        &mut self,
        pack: &TensorPack,
        scheduler: &mut Scheduler<Q>,
    ) -> Result<Option<Tensor>, Status> {
        let Some((kernel, handle)) = &self.reshape_rhs else {
            return Ok(None);
        };
        let b = pack.require(Slot::Src1)?;
        let dst = if self.constant_weights {
            handle.resolve_cached(pack, &mut self.rhs_cache)?
        } else {
            handle.resolve(pack)?.into_tensor()
        };
        let sub = TensorPack::new().with(Slot::Src1, b).with(Slot::Dst, &dst);
        scheduler.enqueue_op(kernel, &sub, false)?;
        Ok(Some(dst))
    }
}

impl Operator for Gemm {
    type Info = GemmInfo;

    fn validate(info: &GemmInfo) -> Result<(), Status> {
        info.shape().map(|_| ())
    }

    fn configure(info: &GemmInfo, device: &DeviceInfo) -> Result<Self, Status> {
        let (_, shape, _) = info.shape()?;
        let kind = device.gemm.select(shape, info.constant_weights);
        Self::configure_with(info, kind, MicroKernel::default())
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
        if self.caches_rhs() {
            self.reshape_rhs(pack, scheduler)?;
            pack.require(Slot::Src1)?.mark_as_unused();
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

        let mut sub = TensorPack::new();
        if let Some(bias) = pack.get(Slot::Src2) {
            sub.add(Slot::Src2, bias)
        }
        sub.add(Slot::Dst, pack.require(Slot::Dst)?);

        let a = pack.require(Slot::Src0)?;
        match &self.reshape_lhs {
            Some((kernel, handle)) => {
                let lhs = handle.resolve(pack)?.into_tensor();
                let reshape = TensorPack::new().with(Slot::Src0, a).with(Slot::Dst, &lhs);
                scheduler.enqueue_op(kernel, &reshape, false)?;
                sub.add(Slot::Src0, &lhs)
            }
            None => sub.add(Slot::Src0, a),
        }

        if self.caches_rhs() {
            let (_, handle) = self
                .reshape_rhs
                .as_ref()
                .ok_or_else(|| crate::invariant_violation("reshaped rhs missing"))?;
            let rhs = handle.resolve_cached(pack, &mut self.rhs_cache)?;
            sub.add(Slot::Src1, &rhs)
        } else {
            match self.reshape_rhs(pack, scheduler)? {
                Some(rhs) => sub.add(Slot::Src1, &rhs),
                None => sub.add(Slot::Src1, pack.require(Slot::Src1)?),
            }
        }

        scheduler.enqueue_op(&self.mm, &sub, self.flush)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        handle::recording::{count_submits, RecordingQueue},
        test_utils::{assert_close, float_tensor, random_f32, rounded},
        Activation,
    };
    use half::f16;

    fn reference(a: &[f32], b: &[f32], bias: &[f32], shape: GemmShape, shared: bool) -> Vec<f32> {
        let GemmShape { batch, m, n, k } = shape;
        let mut ans = vec![0.; batch * m * n];
        for bt in 0..batch {
            let bb = if shared { 0 } else { bt };
            for i in 0..m {
                for j in 0..n {
                    let mut acc = bias.get(j).copied().unwrap_or(0.);
                    for p in 0..k {
                        acc += a[bt * m * k + i * k + p] * b[bb * k * n + p * n + j];
                    }
                    ans[bt * m * n + i * n + j] = acc;
                }
            }
        }
        ans
    }

    fn check(dt: DataType, kind: GemmKernelType, shape: GemmShape, shared: bool) {
        let GemmShape { batch, m, n, k } = shape;
        let b_batch = if shared { 1 } else { batch };
        let a = random_f32(batch * m * k);
        let b = random_f32(b_batch * k * n);
        let bias = random_f32(n);

        let a_desc = TensorDesc::new(dt, &[batch, m, k]);
        let b_desc = TensorDesc::new(dt, &[b_batch, k, n]);
        let mut info = GemmInfo::new(a_desc.clone(), b_desc.clone());
        info.bias = Some(TensorDesc::new(dt, &[n]));

        let (queue, log) = RecordingQueue::new(DeviceInfo::default());
        let mut scheduler = Scheduler::new();
        scheduler.init(queue, None);

        let mut gemm = Gemm::configure_with(&info, kind, MicroKernel::Portable).unwrap();
        let dst = Tensor::new(info.dst.clone());
        let pack = TensorPack::new()
            .with(Slot::Src0, &float_tensor(a_desc, &a))
            .with(Slot::Src1, &float_tensor(b_desc, &b))
            .with(Slot::Src2, &float_tensor(info.bias.clone().unwrap(), &bias))
            .with(Slot::Dst, &dst);
        gemm.run(&pack, &mut scheduler).unwrap();
        gemm.run(&pack, &mut scheduler).unwrap();

        let (ans, abs, rel) = match dt {
            DataType::F32 => (dst.to_vec::<f32, _>(&mut scheduler).unwrap(), 1e-5, 1e-4),
            DataType::F16 => {
                let ans = dst.to_vec::<f16, _>(&mut scheduler).unwrap();
                (ans.into_iter().map(f16::to_f32).collect(), 1e-2, 1e-2)
            }
            _ => unreachable!(),
        };
        let (a, b, bias) = match dt {
            DataType::F16 => (
                rounded::<f16>(&a),
                rounded::<f16>(&b),
                rounded::<f16>(&bias),
            ),
            _ => (a, b, bias),
        };
        assert_close(&ans, &reference(&a, &b, &bias, shape, shared), abs, rel);

        let rhs_reshapes = count_submits(&log, "gemm_reshape_rhs");
        match kind {
            GemmKernelType::Native => assert_eq!(rhs_reshapes, 0),
            _ => assert_eq!(rhs_reshapes, 1),
        }
        let lhs_reshapes = count_submits(&log, "gemm_reshape_lhs");
        match kind {
            GemmKernelType::ReshapedLhsAndRhs => assert_eq!(lhs_reshapes, 2),
            _ => assert_eq!(lhs_reshapes, 0),
        }
    }

    #[test]
    fn test_variants() {
        let shape = GemmShape {
            batch: 3,
            m: 17,
            n: 9,
            k: 13,
        };
        for kind in [
            GemmKernelType::Native,
            GemmKernelType::ReshapedOnlyRhs,
            GemmKernelType::ReshapedLhsAndRhs,
        ] {
            check(DataType::F32, kind, shape, false);
            check(DataType::F32, kind, shape, true);
        }
        check(DataType::F16, GemmKernelType::ReshapedOnlyRhs, shape, false);
        check(DataType::F16, GemmKernelType::Native, shape, true);
    }

    #[test]
    fn test_heuristic_configure() {
        let a = TensorDesc::new(DataType::F32, &[1, 300, 64]);
        let b = TensorDesc::new(DataType::F32, &[1, 64, 32]);
        let mut info = GemmInfo::new(a, b);
        let device = DeviceInfo::default();

        let gemm = Gemm::configure(&info, &device).unwrap();
        assert_eq!(gemm.kind(), GemmKernelType::ReshapedLhsAndRhs);
        assert!(gemm.caches_rhs());
        let reqs = gemm.workspace();
        assert_eq!(reqs.len(), 2);
        assert!(reqs
            .iter()
            .any(|r| r.slot == RHS_RESHAPED && r.lifetime == Lifetime::Persistent));

        info.constant_weights = false;
        let gemm = Gemm::configure(&info, &device).unwrap();
        assert_eq!(gemm.kind(), GemmKernelType::Native);
        assert!(gemm.workspace().is_empty());
    }

    #[test]
    fn test_activation_and_alpha() {
        let a = TensorDesc::new(DataType::F32, &[1, 2, 2]);
        let b = TensorDesc::new(DataType::F32, &[1, 2, 2]);
        let mut info = GemmInfo::new(a.clone(), b.clone());
        info.alpha = 2.;
        info.activation = Some(Activation::BoundedRelu(5.));

        let (queue, _) = RecordingQueue::new(DeviceInfo::default());
        let mut scheduler = Scheduler::new();
        scheduler.init(queue, None);
        let mut gemm =
            Gemm::configure_with(&info, GemmKernelType::Native, MicroKernel::Reference).unwrap();
        let dst = Tensor::new(info.dst.clone());
        let pack = TensorPack::new()
            .with(Slot::Src0, &float_tensor(a, &[1., 2., 3., 4.]))
            .with(Slot::Src1, &float_tensor(b, &[1., 0., 0., -1.]))
            .with(Slot::Dst, &dst);
        gemm.run(&pack, &mut scheduler).unwrap();
        assert_eq!(dst.to_vec::<f32, _>(&mut scheduler).unwrap(), [2., 0., 5., 0.]);
    }

    #[test]
    fn test_shape_errors() {
        let a = TensorDesc::new(DataType::F32, &[2, 4, 5]);
        let b = TensorDesc::new(DataType::F32, &[2, 6, 3]);
        assert!(Gemm::validate(&GemmInfo::new(a.clone(), b)).is_err());
        let b = TensorDesc::new(DataType::S32, &[2, 5, 3]);
        assert!(Gemm::validate(&GemmInfo::new(a.clone(), b)).is_err());
        let b = TensorDesc::new(DataType::F32, &[3, 5, 3]);
        assert!(Gemm::validate(&GemmInfo::new(a, b)).is_err());
    }

    #[test]
    fn test_operand_shapes() {
        let a = TensorDesc::new(DataType::F32, &[2, 4, 5]);
        let b = TensorDesc::new(DataType::F32, &[2, 5, 3]);
        let info = GemmInfo::new(a.clone(), b.clone());
        let (queue, log) = RecordingQueue::new(DeviceInfo::default());
        let mut scheduler = Scheduler::new();
        scheduler.init(queue, None);
        let mut gemm =
            Gemm::configure_with(&info, GemmKernelType::ReshapedOnlyRhs, MicroKernel::Reference)
                .unwrap();
        assert!(gemm.caches_rhs());

        let tensor = |desc: &TensorDesc| {
            float_tensor(desc.clone(), &random_f32(desc.element_count()))
        };
        let pack = |a: &TensorDesc, b: &TensorDesc, dst: &TensorDesc| {
            TensorPack::new()
                .with(Slot::Src0, &tensor(a))
                .with(Slot::Src1, &tensor(b))
                .with(Slot::Dst, &Tensor::new(dst.clone()))
        };

        let larger = TensorDesc::new(DataType::F32, &[2, 8, 5]);
        let smaller = TensorDesc::new(DataType::F32, &[2, 2, 3]);
        let shared = TensorDesc::new(DataType::F32, &[1, 5, 3]);
        for bad in [
            pack(&larger, &b, &info.dst),
            pack(&a, &b, &smaller),
            pack(&a, &shared, &info.dst),
        ] {
            let err = gemm.run(&bad, &mut scheduler).unwrap_err();
            assert_eq!(err.kind, crate::ErrorKind::InvariantViolation);
        }
        assert!(log.lock().unwrap().is_empty());
        assert!(!gemm.is_prepared());

        let mut pack = pack(&a, &b, &info.dst);
        gemm.run(&pack, &mut scheduler).unwrap();
        // 重排结果缓存后右操作数可以缺省
        pack.remove(Slot::Src1);
        gemm.run(&pack, &mut scheduler).unwrap();
        assert_eq!(count_submits(&log, "gemm_reshape_rhs"), 1);
        assert_eq!(count_submits(&log, "gemm_mm_reshaped_only_rhs"), 2);
    }
}

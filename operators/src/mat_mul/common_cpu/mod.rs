use super::{GemmShape, MatMut, MatRef, MicroKernel};
use crate::{
    scheduler::{LocalWorkSize, Tuning},
    DataType, FloatPtr, Kernel, Slot, Status, SyncPtr, TensorPack, Window,
};
use rayon::prelude::*;

/// 操作数的存储方式。
#[derive(Clone, Copy)]
enum Operand {
    /// 按原始行主序存储，类型与算子一致。
    Plain(FloatPtr),
    /// 重排后的转置存储，总是 `f32`。
    Packed(SyncPtr<f32>),
}

impl Operand {
    /// 取出一个矩阵的视图，`f16` 数据先展开到 `scratch`。
    unsafe fn view(
        self,
        offset: usize,
        len: usize,
        plain: (isize, isize),
        packed: (isize, isize),
        scratch: &mut Vec<f32>,
    ) -> MatRef {
        let (ptr, (rs, cs)) = match self {
            Self::Packed(p) => (p.ptr().add(offset).cast_const(), packed),
            Self::Plain(FloatPtr::F32(p)) => (p.ptr().add(offset).cast_const(), plain),
            Self::Plain(fp) => {
                *scratch = fp.load(offset, len);
                (scratch.as_ptr(), plain)
            }
        };
        MatRef { ptr, rs, cs }
    }
}

fn operand(pack: &TensorPack, slot: Slot, packed: bool) -> Result<Operand, Status> {
    let t = pack.require(slot)?;
    Ok(if packed {
        Operand::Packed(t.typed()?)
    } else {
        Operand::Plain(t.floats()?)
    })
}

/// 把 `[batch, m, k]` 的左操作数重排为 `f32` 的 `[batch, k, m]`。
pub(crate) struct ReshapeLhsKernel {
    dt: DataType,
    batch: usize,
    m: usize,
    k: usize,
    tuning: Tuning,
}

impl ReshapeLhsKernel {
    pub fn new(dt: DataType, shape: GemmShape) -> Self {
        Self {
            dt,
            batch: shape.batch,
            m: shape.m,
            k: shape.k,
            tuning: Tuning::default(),
        }
    }
}

impl Kernel for ReshapeLhsKernel {
    fn name(&self) -> &'static str {
        "gemm_reshape_lhs"
    }

    fn config_id(&self) -> String {
        format!("{}_{}_{}x{}x{}", self.name(), self.dt, self.batch, self.m, self.k)
    }

    fn build_options(&self) -> Vec<String> {
        vec![format!("-DDATA_TYPE={}", self.dt), "-DTRANSPOSE".into()]
    }

    fn window(&self) -> Window {
        Window::items(self.batch)
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize) -> Result<(), Status> {
        let &Self { m, k, .. } = self;
        let src = pack.require(Slot::Src0)?.floats()?;
        let dst = pack.require(Slot::Dst)?.typed::<f32>()?;
        window
            .z
            .range()
            .into_par_iter()
            .with_min_len(lws.get())
            .for_each(|b| unsafe {
                for i in 0..m {
                    for p in 0..k {
                        dst.write(b * k * m + p * m + i, src.get(b * m * k + i * k + p))
                    }
                }
            });
        Ok(())
    }
}

/// 把 `[batch, k, n]` 的右操作数重排为 `f32` 的 `[batch, n, k]`。
pub(crate) struct ReshapeRhsKernel {
    dt: DataType,
    batch: usize,
    k: usize,
    n: usize,
    tuning: Tuning,
}

impl ReshapeRhsKernel {
    pub fn new(dt: DataType, shape: GemmShape, b_batch: usize) -> Self {
        Self {
            dt,
            batch: b_batch,
            k: shape.k,
            n: shape.n,
            tuning: Tuning::default(),
        }
    }
}

impl Kernel for ReshapeRhsKernel {
    fn name(&self) -> &'static str {
        "gemm_reshape_rhs"
    }

    fn config_id(&self) -> String {
        format!("{}_{}_{}x{}x{}", self.name(), self.dt, self.batch, self.k, self.n)
    }

    fn build_options(&self) -> Vec<String> {
        vec![format!("-DDATA_TYPE={}", self.dt), "-DTRANSPOSE".into()]
    }

    fn window(&self) -> Window {
        Window::items(self.batch)
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize) -> Result<(), Status> {
        let &Self { k, n, .. } = self;
        let src = pack.require(Slot::Src1)?.floats()?;
        let dst = pack.require(Slot::Dst)?.typed::<f32>()?;
        window
            .z
            .range()
            .into_par_iter()
            .with_min_len(lws.get())
            .for_each(|b| unsafe {
                for p in 0..k {
                    for j in 0..n {
                        dst.write(b * n * k + j * k + p, src.get(b * k * n + p * n + j))
                    }
                }
            });
        Ok(())
    }
}

/// 矩阵乘主核函数，融合了缩放、偏置和激活。
pub(crate) struct MatMulKernel {
    pub dt: DataType,
    pub shape: GemmShape,
    pub b_batch: usize,
    pub alpha: f32,
    pub has_bias: bool,
    pub bounds: (f32, f32),
    pub lhs_packed: bool,
    pub rhs_packed: bool,
    pub micro: MicroKernel,
    pub tuning: Tuning,
}

impl Kernel for MatMulKernel {
    fn name(&self) -> &'static str {
        match (self.lhs_packed, self.rhs_packed) {
            (false, false) => "gemm_mm_native",
            (false, true) => "gemm_mm_reshaped_only_rhs",
            (true, _) => "gemm_mm_reshaped",
        }
    }

    fn config_id(&self) -> String {
        let GemmShape { batch, m, n, k } = self.shape;
        format!("{}_{}_{batch}x{m}x{n}x{k}", self.name(), self.dt)
    }

    fn build_options(&self) -> Vec<String> {
        let mut options = vec![format!("-DDATA_TYPE={}", self.dt)];
        if self.has_bias {
            options.push("-DBETA".into())
        }
        if self.bounds.0.is_finite() || self.bounds.1.is_finite() {
            options.push("-DFUSED_ACTIVATION".into())
        }
        if self.b_batch == 1 && self.shape.batch > 1 {
            options.push("-DRHS_BROADCAST".into())
        }
        options
    }

    fn window(&self) -> Window {
        Window::items(self.shape.batch)
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize) -> Result<(), Status> {
        let GemmShape { m, n, k, .. } = self.shape;
        let lhs = operand(pack, Slot::Src0, self.lhs_packed)?;
        let rhs = operand(pack, Slot::Src1, self.rhs_packed)?;
        let bias = if self.has_bias {
            Some(pack.require(Slot::Src2)?.floats()?)
        } else {
            None
        };
        let dst = pack.require(Slot::Dst)?.floats()?;
        let (lo, hi) = self.bounds;
        let shared_rhs = self.b_batch == 1;
        let (alpha, micro) = (self.alpha, self.micro);

        window
            .z
            .range()
            .into_par_iter()
            .with_min_len(lws.get())
            .for_each(|b| unsafe {
                let mut lhs_buf = Vec::new();
                let mut rhs_buf = Vec::new();
                let lhs = lhs.view(b * m * k, m * k, (k as _, 1), (1, m as _), &mut lhs_buf);
                let bb = if shared_rhs { 0 } else { b };
                let rhs = rhs.view(bb * k * n, k * n, (n as _, 1), (1, k as _), &mut rhs_buf);

                let mut out = vec![0f32; m * n];
                let out_mat = MatMut {
                    ptr: out.as_mut_ptr(),
                    rs: n as _,
                    cs: 1,
                };
                micro.run(m, n, k, out_mat, lhs, rhs, alpha);

                for i in 0..m {
                    for j in 0..n {
                        let mut v = out[i * n + j];
                        if let Some(bias) = bias {
                            v += bias.get(j)
                        }
                        dst.set(b * m * n + i * n + j, v.max(lo).min(hi))
                    }
                }
            });
        Ok(())
    }
}

use super::GemmShape;
use crate::{
    shape_mismatch, type_not_support,
    utils::{rank_error, type_distinct},
    Activation, DataType, Operands, Slot, Status, TensorDesc,
};

/// 批量矩阵乘 `dst[b] = alpha * a[b] × w[b] + bias`。
///
/// `a` 为 `[batch, m, k]`，`w` 为 `[batch, k, n]` 或 `[1, k, n]`（各批共享），
/// `bias` 为 `[n]`，`dst` 为 `[batch, m, n]`。
#[derive(Clone, Debug)]
pub struct GemmInfo {
    pub a: TensorDesc,
    pub b: TensorDesc,
    pub bias: Option<TensorDesc>,
    pub dst: TensorDesc,
    pub alpha: f32,
    pub activation: Option<Activation>,
    /// 右操作数在多次运行间不变，可以只重排一次。
    pub constant_weights: bool,
}

impl GemmInfo {
    pub fn new(a: TensorDesc, b: TensorDesc) -> Self {
        let dst = match (a.shape(), b.shape()) {
            (&[batch, m, _], &[_, _, n]) => TensorDesc::new(a.dt(), &[batch, m, n]),
            _ => TensorDesc::new(a.dt(), &[]),
        };
        Self {
            a,
            b,
            bias: None,
            dst,
            alpha: 1.,
            activation: None,
            constant_weights: true,
        }
    }

    /// 运行时张量包应满足的操作数描述，右操作数重排缓存后可以缺省。
    pub(super) fn operands(&self) -> Operands {
        let mut ans = Operands::new()
            .with(Slot::Src0, &self.a)
            .with_optional(Slot::Src1, &self.b)
            .with(Slot::Dst, &self.dst);
        if let Some(bias) = &self.bias {
            ans = ans.with(Slot::Src2, bias)
        }
        ans
    }

    pub(super) fn shape(&self) -> Result<(DataType, GemmShape, usize), Status> {
        let dt = type_distinct(&[self.a.dt(), self.b.dt(), self.dst.dt()])?;
        if !dt.is_float() {
            return Err(type_not_support(format!("gemm on {dt}")));
        }

        let &[batch, m, k] = self.a.shape() else {
            return Err(rank_error("a", 3, self.a.ndim()));
        };
        let &[b_batch, k_, n] = self.b.shape() else {
            return Err(rank_error("b", 3, self.b.ndim()));
        };
        let &[batch_, m_, n_] = self.dst.shape() else {
            return Err(rank_error("dst", 3, self.dst.ndim()));
        };
        if k != k_ || m != m_ || n != n_ || batch != batch_ || (b_batch != batch && b_batch != 1)
        {
            return Err(shape_mismatch(format!(
                "{} × {} -> {}",
                self.a, self.b, self.dst
            )));
        }
        if let Some(bias) = &self.bias {
            if bias.dt() != dt || bias.shape() != [n] {
                return Err(shape_mismatch(format!("bias {bias} for n = {n}")));
            }
        }
        let shape = GemmShape { batch, m, n, k };
        Ok((dt, shape, b_batch))
    }
}

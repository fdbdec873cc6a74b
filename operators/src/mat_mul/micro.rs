/// 只读矩阵视图，步长以元素计。
#[derive(Clone, Copy)]
pub struct MatRef {
    pub ptr: *const f32,
    pub rs: isize,
    pub cs: isize,
}

/// 可写矩阵视图。
#[derive(Clone, Copy)]
pub struct MatMut {
    pub ptr: *mut f32,
    pub rs: isize,
    pub cs: isize,
}

/// 计算 `dst = alpha * lhs × rhs` 的内核。
///
/// 可替换的实现。调度和重排都不依赖具体内核。
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub enum MicroKernel {
    /// 基于 `gemm` 库的可移植实现。
    #[default]
    Portable,
    /// 逐元素的朴素实现，用于交叉验证。
    Reference,
}

impl MicroKernel {
    /// # Safety
    ///
    /// 三个视图在 `m × k`、`k × n`、`m × n` 范围内有效，`dst` 与输入不重叠。
    pub unsafe fn run(
        self,
        m: usize,
        n: usize,
        k: usize,
        dst: MatMut,
        lhs: MatRef,
        rhs: MatRef,
        alpha: f32,
    ) {
        match self {
            Self::Portable => gemm::gemm(
                m,
                n,
                k,
                dst.ptr,
                dst.cs,
                dst.rs,
                false,
                lhs.ptr,
                lhs.cs,
                lhs.rs,
                rhs.ptr,
                rhs.cs,
                rhs.rs,
                0.,
                alpha,
                false,
                false,
                false,
                gemm::Parallelism::Rayon(0),
            ),
            Self::Reference => {
                for i in 0..m as isize {
                    for j in 0..n as isize {
                        let mut acc = 0.;
                        for p in 0..k as isize {
                            acc += *lhs.ptr.offset(i * lhs.rs + p * lhs.cs)
                                * *rhs.ptr.offset(p * rhs.rs + j * rhs.cs);
                        }
                        *dst.ptr.offset(i * dst.rs + j * dst.cs) = alpha * acc;
                    }
                }
            }
        }
    }
}

#[test]
fn test_kernels_agree() {
    use crate::test_utils::{assert_close, random_f32};

    let (m, n, k) = (7, 5, 9);
    let a = random_f32(m * k);
    // 列主序的右操作数
    let b = random_f32(k * n);
    let mut portable = vec![0f32; m * n];
    let mut reference = vec![0f32; m * n];
    for (kernel, dst) in [
        (MicroKernel::Portable, &mut portable),
        (MicroKernel::Reference, &mut reference),
    ] {
        unsafe {
            kernel.run(
                m,
                n,
                k,
                MatMut {
                    ptr: dst.as_mut_ptr(),
                    rs: n as _,
                    cs: 1,
                },
                MatRef {
                    ptr: a.as_ptr(),
                    rs: k as _,
                    cs: 1,
                },
                MatRef {
                    ptr: b.as_ptr(),
                    rs: 1,
                    cs: k as _,
                },
                2.,
            )
        }
    }
    assert_close(&portable, &reference, 1e-5, 1e-4);
    let expect = 2. * (0..k).map(|p| a[p] * b[p]).sum::<f32>();
    assert!((reference[0] - expect).abs() < 1e-5);
}

/// 行主序的小矩阵。
#[derive(Clone, PartialEq, Debug)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Matrix {
    #[inline]
    pub fn at(&self, i: usize, j: usize) -> f32 {
        self.data[i * self.cols + j]
    }

    fn from_f64(rows: usize, cols: usize, f: impl Fn(usize, usize) -> f64) -> Self {
        let data = (0..rows)
            .flat_map(|i| (0..cols).map(move |j| (i, j)))
            .map(|(i, j)| f(i, j) as f32)
            .collect();
        Self { rows, cols, data }
    }
}

/// 一维 F(m, r) 的 Cook–Toom 变换矩阵。
///
/// 对长度 `m + r - 1` 的输入 `d` 和长度 `r` 的卷积核 `g`，
/// `AT · ((G · g) ⊙ (BT · d))` 等于 `d` 与 `g` 的 `m` 点相关。
#[derive(Clone, Debug)]
pub struct WinogradTransform {
    pub output: usize,
    pub kernel: usize,
    /// `m × α`
    pub at: Matrix,
    /// `α × r`
    pub g: Matrix,
    /// `α × α`
    pub bt: Matrix,
}

impl WinogradTransform {
    pub fn new(output: usize, kernel: usize) -> Self {
        assert!(output > 0 && kernel > 0);
        let alpha = output + kernel - 1;
        let points = points(alpha - 1);
        // 有限点上的 Vandermonde 行，无穷远点取最高次系数
        let eval = |i: usize, j: usize, k: usize| match points.get(i) {
            Some(&p) => p.powi(j as _),
            None if j == k - 1 => 1.,
            None => 0.,
        };
        let v = (0..alpha)
            .map(|i| (0..alpha).map(|j| eval(i, j, alpha)).collect())
            .collect::<Vec<Vec<_>>>();
        let c = invert(v);

        Self {
            output,
            kernel,
            at: Matrix::from_f64(output, alpha, |i, j| eval(j, i, output)),
            g: Matrix::from_f64(alpha, kernel, |i, j| eval(i, j, kernel)),
            bt: Matrix::from_f64(alpha, alpha, |i, j| c[j][i]),
        }
    }

    #[inline]
    pub fn alpha(&self) -> usize {
        self.output + self.kernel - 1
    }
}

/// 插值点 `0, 1, -1, 2, -2, 1/2, -1/2, 3, -3, 1/3, -1/3, ...` 的前 `n` 个。
fn points(n: usize) -> Vec<f64> {
    let mut ans = vec![0.];
    let mut i = 1.;
    while ans.len() < n {
        ans.extend([i, -i]);
        if i > 1. {
            ans.extend([1. / i, -1. / i]);
        }
        i += 1.;
    }
    ans.truncate(n);
    ans
}

/// 列主元 Gauss–Jordan 消元求逆，插值点互异保证可逆。
fn invert(mut a: Vec<Vec<f64>>) -> Vec<Vec<f64>> {
    let n = a.len();
    let mut inv = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1. } else { 0. }).collect())
        .collect::<Vec<Vec<f64>>>();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&x, &y| a[x][col].abs().total_cmp(&a[y][col].abs()))
            .unwrap_or(col);
        a.swap(col, pivot);
        inv.swap(col, pivot);

        let p = a[col][col];
        for j in 0..n {
            a[col][j] /= p;
            inv[col][j] /= p;
        }
        for i in (0..n).filter(|&i| i != col) {
            let f = a[i][col];
            if f != 0. {
                for j in 0..n {
                    a[i][j] -= f * a[col][j];
                    inv[i][j] -= f * inv[col][j];
                }
            }
        }
    }
    inv
}

/// 计算 `left · x · rightᵀ`，`x` 为 `left.cols × right.cols`。
pub(super) fn sandwich(left: &Matrix, x: &[f32], right: &Matrix) -> Vec<f32> {
    debug_assert_eq!(x.len(), left.cols * right.cols);
    let mut tmp = vec![0f32; left.rows * right.cols];
    for i in 0..left.rows {
        for k in 0..left.cols {
            let l = left.at(i, k);
            if l != 0. {
                for j in 0..right.cols {
                    tmp[i * right.cols + j] += l * x[k * right.cols + j]
                }
            }
        }
    }
    let mut ans = vec![0f32; left.rows * right.rows];
    for i in 0..left.rows {
        for j in 0..right.rows {
            ans[i * right.rows + j] = (0..right.cols)
                .map(|k| tmp[i * right.cols + k] * right.at(j, k))
                .sum();
        }
    }
    ans
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{assert_close, random_f32};

    fn apply(m: &Matrix, x: &[f32]) -> Vec<f32> {
        (0..m.rows)
            .map(|i| (0..m.cols).map(|j| m.at(i, j) * x[j]).sum())
            .collect()
    }

    #[test]
    fn test_f23() {
        let t = WinogradTransform::new(2, 3);
        // 点 {0, 1, -1, ∞} 生成的经典矩阵
        assert_eq!(
            t.at.data,
            [1., 1., 1., 0., 0., 1., -1., 1.]
        );
        assert_eq!(
            t.g.data,
            [1., 0., 0., 1., 1., 1., 1., -1., 1., 0., 0., 1.]
        );
        assert_eq!(t.bt.rows, 4);
    }

    #[test]
    fn test_correlation() {
        for (m, r, tol) in [
            (1, 1, 1e-6),
            (2, 3, 1e-5),
            (4, 3, 1e-4),
            (6, 3, 1e-3),
            (4, 1, 1e-4),
            (2, 5, 1e-4),
            (4, 5, 1e-3),
            (2, 7, 1e-3),
        ] {
            let t = WinogradTransform::new(m, r);
            assert_eq!((t.at.rows, t.at.cols), (m, t.alpha()));
            let d = random_f32(t.alpha());
            let g = random_f32(r);
            let u = apply(&t.g, &g);
            let v = apply(&t.bt, &d);
            let prod = u.iter().zip(&v).map(|(a, b)| a * b).collect::<Vec<_>>();
            let y = apply(&t.at, &prod);
            let expect = (0..m)
                .map(|i| (0..r).map(|j| d[i + j] * g[j]).sum())
                .collect::<Vec<f32>>();
            assert_close(&y, &expect, tol, tol);
        }
    }

    #[test]
    fn test_sandwich() {
        let left = Matrix {
            rows: 1,
            cols: 2,
            data: vec![1., 2.],
        };
        let right = Matrix {
            rows: 2,
            cols: 3,
            data: vec![1., 0., 0., 0., 0., 1.],
        };
        let x = [1., 2., 3., 4., 5., 6.];
        // [1, 2] · x = [9, 12, 15]
        assert_eq!(sandwich(&left, &x, &right), [9., 15.]);
    }
}

use super::{Conv2dInfo, ConvShape, PadStrideInfo, Size2D};
use crate::{
    handle::{recording::RecordingQueue, CommandQueue, DeviceInfo},
    scheduler::Scheduler,
    test_utils::{assert_close, float_tensor, random_f32, rounded},
    Activation, DataLayout, DataType, ErrorKind, Operator, QuantInfo, Slot, Tensor, TensorDesc,
    TensorPack,
};
use half::f16;
use rand::Rng;

/// 一组随机卷积数据及其朴素参考结果。
///
/// 浮点数据保存舍入后的值，量化数据保存整数编码。
pub(crate) struct Case {
    pub info: Conv2dInfo,
    pub src: Vec<f32>,
    pub weights: Vec<f32>,
    pub bias: Option<Vec<f32>>,
}

fn random_data(desc: &TensorDesc) -> Vec<f32> {
    let n = desc.element_count();
    let mut rng = rand::thread_rng();
    match desc.dt() {
        DataType::F32 => random_f32(n),
        DataType::F16 => rounded::<f16>(&random_f32(n)),
        DataType::QAsymm8 => (0..n).map(|_| rng.gen_range(0..=255) as f32).collect(),
        DataType::QAsymm8Signed => (0..n).map(|_| rng.gen_range(-128..=127) as f32).collect(),
        DataType::S32 => (0..n).map(|_| rng.gen_range(-200..=200) as f32).collect(),
        dt => panic!("no random data for {dt}"),
    }
}

fn tensor(desc: &TensorDesc, data: &[f32]) -> Tensor {
    let desc = desc.clone();
    match desc.dt() {
        DataType::F32 | DataType::F16 => float_tensor(desc, data),
        DataType::QAsymm8 => {
            let data = data.iter().map(|&x| x as u8).collect::<Vec<_>>();
            Tensor::from_slice(desc, &data).unwrap()
        }
        DataType::QAsymm8Signed => {
            let data = data.iter().map(|&x| x as i8).collect::<Vec<_>>();
            Tensor::from_slice(desc, &data).unwrap()
        }
        DataType::S32 => {
            let data = data.iter().map(|&x| x as i32).collect::<Vec<_>>();
            Tensor::from_slice(desc, &data).unwrap()
        }
        dt => panic!("no tensor for {dt}"),
    }
}

impl Case {
    pub fn new(info: Conv2dInfo) -> Self {
        Self {
            src: random_data(&info.src),
            weights: random_data(&info.weights),
            bias: info.bias.as_ref().map(random_data),
            info,
        }
    }

    /// 单位步长的方形卷积核。
    pub fn nchw(dt: DataType, nchw: [usize; 4], m: usize, k: usize, pad: usize) -> Self {
        Self::nchw_kernel(dt, nchw, m, [k, k], [pad, pad])
    }

    pub fn nchw_kernel(
        dt: DataType,
        nchw: [usize; 4],
        m: usize,
        kernel: [usize; 2],
        pads: [usize; 2],
    ) -> Self {
        Self::with_layout(DataLayout::Nchw, dt, nchw, m, kernel, pads)
    }

    pub fn nhwc(dt: DataType, nchw: [usize; 4], m: usize, kernel: [usize; 2], pads: [usize; 2]) -> Self {
        Self::with_layout(DataLayout::Nhwc, dt, nchw, m, kernel, pads)
    }

    fn with_layout(
        layout: DataLayout,
        dt: DataType,
        [n, c, h, w]: [usize; 4],
        m: usize,
        [kh, kw]: [usize; 2],
        [ph, pw]: [usize; 2],
    ) -> Self {
        let (src_q, w_q) = if dt.is_quantized() {
            (QuantInfo::new(0.05, 3), QuantInfo::new(0.02, -2))
        } else {
            Default::default()
        };
        let src = TensorDesc::from_nchw(dt, layout, [n, c, h, w]).with_quant(src_q);
        let weights = TensorDesc::from_nchw(dt, layout, [m, c, kh, kw]).with_quant(w_q);
        let mut info = Conv2dInfo::new(src, weights, PadStrideInfo::new(1, 1, pw, ph));
        if dt.is_quantized() {
            info.dst = info.dst.clone().with_quant(QuantInfo::new(0.25, 1));
        }
        Self::new(info)
    }

    /// 以新的步长、填充和空洞重新推断输出，数据保持不变。
    pub fn with_conv(mut self, conv: PadStrideInfo, dilation: Size2D) -> Self {
        let quant = self.info.dst.quant();
        let mut info = Conv2dInfo::new(self.info.src.clone(), self.info.weights.clone(), conv)
            .with_dilation(dilation);
        info.dst = info.dst.clone().with_quant(quant);
        info.bias = self.info.bias.take();
        info.activation = self.info.activation;
        info.fast_math = self.info.fast_math;
        self.info = info;
        self
    }

    pub fn with_bias(mut self) -> Self {
        let m = self.info.weights.nchw().unwrap()[0];
        let dt = if self.info.src.dt().is_quantized() {
            DataType::S32
        } else {
            self.info.src.dt()
        };
        let desc = TensorDesc::new(dt, &[m]);
        self.bias = Some(random_data(&desc));
        self.info.bias = Some(desc);
        self
    }

    pub fn with_activation(mut self, act: Activation) -> Self {
        self.info.activation = Some(act);
        self
    }

    pub fn with_fast_math(mut self) -> Self {
        self.info.fast_math = true;
        self
    }

    /// 新建输入、权重、偏置和全新的输出张量。
    pub fn pack(&self) -> TensorPack {
        let info = &self.info;
        let mut pack = TensorPack::new()
            .with(Slot::Src0, &tensor(&info.src, &self.src))
            .with(Slot::Src1, &tensor(&info.weights, &self.weights))
            .with(Slot::Dst, &Tensor::new(info.dst.clone()));
        if let (Some(desc), Some(bias)) = (&info.bias, &self.bias) {
            pack.add(Slot::Src2, &tensor(desc, bias))
        }
        pack
    }

    /// 逐点计算的参考结果，按输出布局排列；量化时为输出编码。
    pub fn expected(&self) -> Vec<f32> {
        let info = &self.info;
        let shape = info.validate().unwrap();
        let ConvShape {
            n: n_,
            c: c_,
            h,
            w,
            m: m_,
            kh,
            kw,
            oh,
            ow,
            ..
        } = shape;
        let (sx, sy) = info.conv.stride;
        let Size2D {
            width: dx,
            height: dy,
        } = info.dilation;
        let (sq, wq, dq) = (info.src.quant(), info.weights.quant(), info.dst.quant());
        let quantized = shape.dt.is_quantized();
        let real = |q: f32, quant: QuantInfo| {
            if quantized {
                quant.dequantize(q as i32)
            } else {
                q
            }
        };

        let mut ans = vec![0.; n_ * m_ * oh * ow];
        for n in 0..n_ {
            for m in 0..m_ {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut acc = match &self.bias {
                            Some(b) if quantized => b[m] * sq.scale * wq.scale,
                            Some(b) => b[m],
                            None => 0.,
                        };
                        for c in 0..c_ {
                            for ky in 0..kh {
                                let Some(iy) = (oy * sy + ky * dy).checked_sub(info.conv.pad_top)
                                else {
                                    continue;
                                };
                                for kx in 0..kw {
                                    let Some(ix) =
                                        (ox * sx + kx * dx).checked_sub(info.conv.pad_left)
                                    else {
                                        continue;
                                    };
                                    if iy < h && ix < w {
                                        acc += real(self.src[shape.src_index(n, c, iy, ix)], sq)
                                            * real(
                                                self.weights[shape.weight_index(m, c, ky, kx)],
                                                wq,
                                            );
                                    }
                                }
                            }
                        }
                        if let Some(act) = info.activation {
                            acc = act.apply(acc)
                        }
                        if quantized {
                            let (lo, hi) = match shape.dt {
                                DataType::QAsymm8 => (0, 255),
                                _ => (-128, 127),
                            };
                            acc = dq.quantize(acc).clamp(lo, hi) as f32
                        }
                        ans[shape.dst_index(n, m, oy, ox)] = acc;
                    }
                }
            }
        }
        ans
    }

    /// 同步后读出输出并与参考结果比较。
    pub fn check<Q: CommandQueue>(
        &self,
        pack: &TensorPack,
        scheduler: &mut Scheduler<Q>,
        abs: f64,
        rel: f64,
    ) {
        let dst = pack.require(Slot::Dst).unwrap();
        let ans = match dst.desc().dt() {
            DataType::F32 => dst.to_vec::<f32, _>(scheduler).unwrap(),
            DataType::F16 => dst
                .to_vec::<f16, _>(scheduler)
                .unwrap()
                .into_iter()
                .map(f16::to_f32)
                .collect(),
            DataType::QAsymm8 => dst
                .to_vec::<u8, _>(scheduler)
                .unwrap()
                .into_iter()
                .map(f32::from)
                .collect(),
            DataType::QAsymm8Signed => dst
                .to_vec::<i8, _>(scheduler)
                .unwrap()
                .into_iter()
                .map(f32::from)
                .collect(),
            dt => panic!("unexpected dst type {dt}"),
        };
        assert_close(&ans, &self.expected(), abs, rel);
    }

    /// 在模拟设备上配置并运行两次，每次都与参考结果比较。
    pub fn run<O: Operator<Info = Conv2dInfo>>(&self, device: &DeviceInfo, abs: f64, rel: f64) {
        let mut op = O::configure(&self.info, device).unwrap();
        let mut scheduler: Scheduler = Scheduler::new();
        scheduler
            .default_init(None, Some(device.gemm.clone()), device.target)
            .unwrap();
        let pack = self.pack();
        for _ in 0..2 {
            op.run(&pack, &mut scheduler).unwrap();
            self.check(&pack, &mut scheduler, abs, rel);
        }
        assert!(op.is_prepared());
    }
}

/// 为 `small` 配置的算子拒绝 `large` 的张量包，反之亦然，且不提交任何核函数。
///
/// 两个用例除输入输出尺寸外应当相同，之后用正确的张量包仍能运行。
pub(crate) fn rejects_mismatched<O: Operator<Info = Conv2dInfo>>(
    small: &Case,
    large: &Case,
    device: &DeviceInfo,
    abs: f64,
    rel: f64,
) {
    let mut op = O::configure(&small.info, device).unwrap();
    let mut big = O::configure(&large.info, device).unwrap();
    let (queue, log) = RecordingQueue::new(device.clone());
    let mut scheduler = Scheduler::new();
    scheduler.init(queue, None);

    let err = op.run(&large.pack(), &mut scheduler).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvariantViolation);
    let err = big.run(&small.pack(), &mut scheduler).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvariantViolation);

    // 只有输出不符
    let mut pack = small.pack();
    pack.add(Slot::Dst, &Tensor::new(large.info.dst.clone()));
    let err = op.run(&pack, &mut scheduler).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvariantViolation);

    assert!(log.lock().unwrap().is_empty());
    assert!(!op.is_prepared());

    let pack = small.pack();
    op.run(&pack, &mut scheduler).unwrap();
    small.check(&pack, &mut scheduler, abs, rel);
}

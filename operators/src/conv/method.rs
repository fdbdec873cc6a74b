use super::{
    Conv2dInfo, ConvShape, DirectConv2d, FftConv2d, PadStrideInfo, Size2D, WinogradConv2d,
};
use crate::{handle::GpuTarget, DataLayout, Operator, Status};
use std::{collections::HashMap, sync::OnceLock};

/// 卷积的实现方法。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ConvolutionMethod {
    Gemm,
    Direct,
    Winograd,
    Fft,
}

/// 已知拓扑中的一个卷积配置及其最佳方法。
#[derive(Clone, Debug)]
pub struct KnownConfig {
    /// 输入的 `(w, h)`。
    pub input: Size2D,
    /// 卷积核的 `(w, h)`。
    pub kernel: Size2D,
    /// `(ifm, ofm)`。
    pub channels: Size2D,
    pub conv: PadStrideInfo,
    pub layout: DataLayout,
    pub method: ConvolutionMethod,
}

impl KnownConfig {
    fn matches(&self, info: &Conv2dInfo, shape: &ConvShape) -> bool {
        let conv = &info.conv;
        self.input == Size2D::new(shape.w, shape.h)
            && self.kernel == Size2D::new(shape.kw, shape.kh)
            && self.channels == Size2D::new(shape.c, shape.m)
            && self.conv.stride == conv.stride
            && self.conv.pad_left == conv.pad_left
            && self.conv.pad_right == conv.pad_right
            && self.conv.pad_top == conv.pad_top
            && self.conv.pad_bottom == conv.pad_bottom
            && self.layout == shape.layout
    }
}

/// 超分辨率网络中的大图大核卷积，直接卷积更快。
#[derive(Clone, Copy, Debug)]
pub struct SrganRule {
    /// 输入高度须大于此值。
    pub min_input_h: usize,
    /// 输出高度须大于此值。
    pub min_output_h: usize,
    pub kernel_h: usize,
    /// 上填充须小于此值。
    pub max_pad_top: usize,
}

impl SrganRule {
    fn matches(&self, info: &Conv2dInfo, shape: &ConvShape) -> bool {
        shape.h > self.min_input_h
            && shape.oh > self.min_output_h
            && shape.kh == self.kernel_h
            && info.conv.pad_top < self.max_pad_top
    }
}

/// 方法选择的经验阈值和已知配置表。
#[derive(Clone, Debug)]
pub struct SelectorConfig {
    pub known: Vec<KnownConfig>,
    pub srgan: SrganRule,
    /// 输入通道少于此值时变换开销摊不开。
    pub min_channels: usize,
    /// NCHW 下卷积核高度大于此值才考虑 FFT。
    pub fft_min_kernel: usize,
    /// NHWC 下直接卷积的卷积核尺寸阈值。
    pub nhwc_direct_kernel: HashMap<GpuTarget, usize>,
    pub nhwc_direct_kernel_default: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        use ConvolutionMethod::{Direct, Gemm};
        use DataLayout::{Nchw, Nhwc};

        let known = |input, kernel, (ifm, ofm), conv, layout, method| KnownConfig {
            input: Size2D::new(input, input),
            kernel: Size2D::new(kernel, kernel),
            channels: Size2D::new(ifm, ofm),
            conv,
            layout,
            method,
        };
        let mobilenet = PadStrideInfo::new(2, 2, 0, 0).with_pads(0, 1, 0, 1);
        Self {
            known: vec![
                // AlexNet
                known(27, 5, (48, 128), PadStrideInfo::new(1, 1, 2, 2), Nchw, Direct),
                // VGG16 / VGG19
                known(224, 3, (3, 64), PadStrideInfo::new(1, 1, 1, 1), Nchw, Direct),
                // MobileNet
                known(224, 3, (3, 32), mobilenet, Nchw, Gemm),
                known(160, 3, (3, 24), mobilenet, Nchw, Gemm),
                known(224, 3, (3, 32), mobilenet, Nhwc, Gemm),
                known(160, 3, (3, 24), mobilenet, Nhwc, Gemm),
            ],
            srgan: SrganRule {
                min_input_h: 720,
                min_output_h: 720,
                kernel_h: 9,
                max_pad_top: 3,
            },
            min_channels: 16,
            fft_min_kernel: 5,
            nhwc_direct_kernel: [
                (GpuTarget::G76, 5),
                (GpuTarget::G77, 5),
                (GpuTarget::G78, 5),
                (GpuTarget::G71, 7),
                (GpuTarget::G72, 7),
                (GpuTarget::Midgard, 7),
                (GpuTarget::Bifrost, 7),
            ]
            .into(),
            nhwc_direct_kernel_default: 5,
        }
    }
}

impl SelectorConfig {
    /// 进程内共享的默认配置。
    pub fn global() -> &'static Self {
        static CONFIG: OnceLock<SelectorConfig> = OnceLock::new();
        CONFIG.get_or_init(Self::default)
    }

    #[inline]
    pub fn direct_kernel_threshold(&self, target: GpuTarget) -> usize {
        self.nhwc_direct_kernel
            .get(&target)
            .copied()
            .unwrap_or(self.nhwc_direct_kernel_default)
    }
}

/// 以默认配置选择方法。
#[inline]
pub fn select(info: &Conv2dInfo, target: GpuTarget) -> Result<ConvolutionMethod, Status> {
    select_with(info, target, SelectorConfig::global())
}

/// 为卷积选择实现方法。
///
/// 公共检查失败时返回错误；各方法自身的检查失败只影响路由，最终总能回落到 GEMM。
/// 结果只取决于参数，不读取任何设备状态。
pub fn select_with(
    info: &Conv2dInfo,
    target: GpuTarget,
    config: &SelectorConfig,
) -> Result<ConvolutionMethod, Status> {
    use ConvolutionMethod::*;

    let shape = info.validate()?;
    let method = if let Some(known) = config.known.iter().find(|it| it.matches(info, &shape)) {
        known.method
    } else if info.dilation != Size2D::ONE {
        Gemm
    } else {
        let direct = || DirectConv2d::validate(info).is_ok();
        let winograd = || WinogradConv2d::validate(info).is_ok();
        let srgan = config.srgan.matches(info, &shape);
        let enough_channels = shape.c >= config.min_channels;

        match shape.layout {
            DataLayout::Nchw => {
                if srgan && direct() {
                    Direct
                } else if shape.kh > config.fft_min_kernel
                    && shape.c > shape.m
                    && FftConv2d::validate(info).is_ok()
                {
                    Fft
                } else if !enough_channels {
                    Gemm
                } else if winograd() {
                    Winograd
                } else {
                    Gemm
                }
            }
            DataLayout::Nhwc => {
                let threshold = config.direct_kernel_threshold(target);
                if srgan && direct() {
                    Direct
                } else if !shape.dt.is_float() {
                    Gemm
                } else if enough_channels && winograd() {
                    Winograd
                } else if shape.kw >= threshold
                    && shape.kh >= threshold
                    && enough_channels
                    && shape.c > shape.m
                    && direct()
                {
                    Direct
                } else {
                    Gemm
                }
            }
        }
    };
    log::debug!(
        "conv {} * {} on {target:?} selects {method:?}",
        info.src,
        info.weights
    );
    Ok(method)
}

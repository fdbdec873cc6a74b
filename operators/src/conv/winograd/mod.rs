mod common_cpu;
mod transform;

pub use transform::{Matrix, WinogradTransform};

use super::{with_workspace, Conv2dInfo, ConvShape, Size2D};
use crate::{
    args_not_support, clamp_bounds,
    handle::{CommandQueue, DeviceInfo},
    mat_mul::{Gemm, GemmInfo},
    method_not_support,
    scheduler::Scheduler,
    type_not_support, AuxHandle, DataLayout, DataType, Lifetime, MemoryRequirement, Operands,
    Operator, Requirements, Slot, Status, Tensor, TensorDesc, TensorPack,
};
use common_cpu::{FillBorderKernel, FilterTransformKernel, InputTransformKernel, OutputTransformKernel};
use std::sync::Arc;

/// 零填充后的输入。
pub const BORDERED_INPUT: Slot = Slot::Aux(0);
/// 变换后的输入。
pub const TRANSFORMED_INPUT: Slot = Slot::Aux(1);
/// 变换后的卷积核。
pub const TRANSFORMED_FILTER: Slot = Slot::Aux(2);
/// 批量矩阵乘的结果。
pub const GEMM_OUTPUT: Slot = Slot::Aux(3);

/// 按卷积核尺寸选择输出分块。
///
/// 3×3 一般取 4×4，NCHW 下输入的宽或高不超过 4 时取 2×2；5×5 取 4×4；7×7 取 2×2。
/// 一维卷积核在单位轴上保持 1。不支持的卷积核返回 `None`。
pub fn winograd_output_tile(input: Size2D, kernel: Size2D, layout: DataLayout) -> Option<Size2D> {
    let small = layout == DataLayout::Nchw && (input.width <= 4 || input.height <= 4);
    let tile = |k| match k {
        3 if small => Some(2),
        3 | 5 => Some(4),
        7 => Some(2),
        _ => None,
    };
    match (kernel.width, kernel.height) {
        (1, 1) => None,
        (1, k) => Some(Size2D::new(1, tile(k)?)),
        (k, 1) => Some(Size2D::new(tile(k)?, 1)),
        (kw, kh) if kw == kh => {
            let t = tile(kw)?;
            Some(Size2D::new(t, t))
        }
        _ => None,
    }
}

/// 需要快速数学才能保证可接受精度的配置。
fn requires_fast_math(dt: DataType, tile: Size2D, kernel: Size2D) -> bool {
    let large = |t: usize, k: usize| (t == 4 && k == 5) || (t == 2 && k == 7);
    dt == DataType::F16 || large(tile.width, kernel.width) || large(tile.height, kernel.height)
}

/// 分块规划。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Tiling {
    pub tile: Size2D,
    pub kernel: Size2D,
    pub tiles_h: usize,
    pub tiles_w: usize,
    /// 暂存区的高和宽。
    pub hp: usize,
    pub wp: usize,
    pub pad_top: usize,
    pub pad_left: usize,
}

impl Tiling {
    fn new(shape: &ConvShape, info: &Conv2dInfo, tile: Size2D) -> Self {
        let tiles_h = shape.oh.div_ceil(tile.height);
        let tiles_w = shape.ow.div_ceil(tile.width);
        Self {
            tile,
            kernel: Size2D::new(shape.kw, shape.kh),
            tiles_h,
            tiles_w,
            hp: tiles_h * tile.height + shape.kh - 1,
            wp: tiles_w * tile.width + shape.kw - 1,
            pad_top: info.conv.pad_top,
            pad_left: info.conv.pad_left,
        }
    }

    #[inline]
    pub fn tiles(&self) -> usize {
        self.tiles_h * self.tiles_w
    }

    #[inline]
    pub fn transform_h(&self) -> WinogradTransform {
        WinogradTransform::new(self.tile.height, self.kernel.height)
    }

    #[inline]
    pub fn transform_w(&self) -> WinogradTransform {
        WinogradTransform::new(self.tile.width, self.kernel.width)
    }

    /// `α_h · α_w`
    #[inline]
    pub fn alpha2(&self) -> usize {
        (self.tile.height + self.kernel.height - 1) * (self.tile.width + self.kernel.width - 1)
    }

    fn build_options(&self) -> Vec<String> {
        vec![
            format!("-DOUTPUT_TILE_W={}", self.tile.width),
            format!("-DOUTPUT_TILE_H={}", self.tile.height),
            format!("-DKERNEL_SIZE={}x{}", self.kernel.width, self.kernel.height),
        ]
    }
}

/// 检查 Winograd 特有的约束，返回输出分块。
fn check(info: &Conv2dInfo) -> Result<(ConvShape, Size2D), Status> {
    let shape = info.validate()?;
    match shape.dt {
        DataType::F32 | DataType::F16 => {}
        dt => return Err(type_not_support(format!("winograd on {dt}"))),
    }
    if !info.conv.is_unit_stride() || info.dilation != Size2D::ONE {
        return Err(args_not_support(format!(
            "winograd with stride {:?} and dilation {:?}",
            info.conv.stride, info.dilation
        )));
    }
    let kernel = Size2D::new(shape.kw, shape.kh);
    let input = Size2D::new(shape.w, shape.h);
    let Some(tile) = winograd_output_tile(input, kernel, shape.layout) else {
        return Err(method_not_support(format!(
            "winograd for {}x{} kernel",
            shape.kh, shape.kw
        )));
    };
    let conv = &info.conv;
    if conv.pad_left.max(conv.pad_right) > shape.kw / 2
        || conv.pad_top.max(conv.pad_bottom) > shape.kh / 2
    {
        return Err(args_not_support(format!(
            "winograd padding {conv:?} exceeds half of the {}x{} kernel",
            shape.kh, shape.kw
        )));
    }
    if !info.fast_math && requires_fast_math(shape.dt, tile, kernel) {
        return Err(method_not_support(format!(
            "winograd F({}x{}, {}x{}) on {} requires fast math",
            tile.height, tile.width, shape.kh, shape.kw, shape.dt
        )));
    }
    Ok((shape, tile))
}

/// Winograd 卷积流水线：填充、输入变换、批量矩阵乘、输出变换，卷积核变换在准备阶段完成一次。
///
/// 张量包中 `Src0` 为输入，`Src1` 为权重，`Src2` 为可选偏置，`Dst` 为输出。
pub struct WinogradConv2d {
    tiling: Tiling,
    fill_border: Arc<FillBorderKernel>,
    input_transform: Arc<InputTransformKernel>,
    filter_transform: Arc<FilterTransformKernel>,
    output_transform: Arc<OutputTransformKernel>,
    gemm: Gemm,
    bordered: AuxHandle,
    transformed_input: AuxHandle,
    transformed_filter: AuxHandle,
    gemm_output: AuxHandle,
    reqs: Requirements,
    operands: Operands,
    filter_cache: Option<Tensor>,
    prepared: bool,
}

impl WinogradConv2d {
    #[inline]
    pub fn output_tile(&self) -> Size2D {
        self.tiling.tile
    }

    #[inline]
    pub fn gemm(&self) -> &Gemm {
        &self.gemm
    }
}

impl Operator for WinogradConv2d {
    type Info = Conv2dInfo;

    fn validate(info: &Conv2dInfo) -> Result<(), Status> {
        check(info).map(|_| ())
    }

    fn configure(info: &Conv2dInfo, device: &DeviceInfo) -> Result<Self, Status> {
        let (shape, tile) = check(info)?;
        let tiling = Tiling::new(&shape, info, tile);
        let ConvShape { n, c, m, .. } = shape;
        let alpha2 = tiling.alpha2();
        let rows = n * tiling.tiles();

        let f32_desc = |shape: &[usize]| TensorDesc::new(DataType::F32, shape);
        let v_desc = f32_desc(&[alpha2, rows, c]);
        let u_desc = f32_desc(&[alpha2, c, m]);
        let m_desc = f32_desc(&[alpha2, rows, m]);
        let mut gemm_info = GemmInfo::new(v_desc.clone(), u_desc.clone());
        gemm_info.dst = m_desc.clone();
        let gemm = Gemm::configure(&gemm_info, device)?.embedded();

        let filter_lifetime = if gemm.caches_rhs() {
            Lifetime::Prepare
        } else {
            Lifetime::Persistent
        };
        let border_desc = f32_desc(&[n, c, tiling.hp, tiling.wp]);
        let own = [
            (BORDERED_INPUT, &border_desc, Lifetime::Temporary),
            (TRANSFORMED_INPUT, &v_desc, Lifetime::Temporary),
            (TRANSFORMED_FILTER, &u_desc, filter_lifetime),
            (GEMM_OUTPUT, &m_desc, Lifetime::Temporary),
        ]
        .map(|(slot, desc, lifetime)| MemoryRequirement::new(slot, desc.size(), lifetime));
        let reqs = Requirements::merge(own.into_iter().chain(gemm.workspace()));

        log::debug!(
            "winograd F({}x{}, {}x{}) over {} tiles, gemm {:?}",
            tile.height,
            tile.width,
            shape.kh,
            shape.kw,
            tiling.tiles(),
            gemm.kind()
        );

        Ok(Self {
            fill_border: Arc::new(FillBorderKernel::new(shape, tiling)),
            input_transform: Arc::new(InputTransformKernel::new(shape, tiling)),
            filter_transform: Arc::new(FilterTransformKernel::new(shape, tiling)),
            output_transform: Arc::new(OutputTransformKernel::new(
                shape,
                tiling,
                info.bias.is_some(),
                clamp_bounds(info.activation),
            )),
            gemm,
            bordered: reqs.handle(BORDERED_INPUT, border_desc)?,
            transformed_input: reqs.handle(TRANSFORMED_INPUT, v_desc)?,
            transformed_filter: reqs.handle(TRANSFORMED_FILTER, u_desc)?,
            gemm_output: reqs.handle(GEMM_OUTPUT, m_desc)?,
            tiling,
            reqs,
            operands: info.operands(),
            filter_cache: None,
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
        let u = self
            .transformed_filter
            .resolve_cached(pack, &mut self.filter_cache)?;
        let sub = TensorPack::new()
            .with(Slot::Src1, weights)
            .with(Slot::Dst, &u);
        scheduler.enqueue_op(&self.filter_transform, &sub, false)?;
        weights.mark_as_unused();

        let sub = with_workspace(pack, &[(Slot::Src1, &u)]);
        self.gemm.prepare(&sub, scheduler)?;
        if self.gemm.caches_rhs() {
            self.filter_cache = None
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

        let bordered = self.bordered.resolve(pack)?.into_tensor();
        let sub = TensorPack::new()
            .with(Slot::Src0, src)
            .with(Slot::Dst, &bordered);
        scheduler.enqueue_op(&self.fill_border, &sub, false)?;

        let v = self.transformed_input.resolve(pack)?.into_tensor();
        let sub = TensorPack::new()
            .with(Slot::Src0, &bordered)
            .with(Slot::Dst, &v);
        scheduler.enqueue_op(&self.input_transform, &sub, false)?;

        let m = self.gemm_output.resolve(pack)?.into_tensor();
        let sub = if self.gemm.caches_rhs() {
            with_workspace(pack, &[(Slot::Src0, &v), (Slot::Dst, &m)])
        } else {
            let u = self
                .transformed_filter
                .resolve_cached(pack, &mut self.filter_cache)?;
            with_workspace(pack, &[(Slot::Src0, &v), (Slot::Src1, &u), (Slot::Dst, &m)])
        };
        self.gemm.run(&sub, scheduler)?;

        let mut sub = TensorPack::new().with(Slot::Src0, &m).with(Slot::Dst, dst);
        if let Some(bias) = pack.get(Slot::Src2) {
            sub.add(Slot::Src2, bias)
        }
        scheduler.enqueue_op(&self.output_transform, &sub, true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        conv::{
            test_utils::{rejects_mismatched, Case},
            PadStrideInfo,
        },
        handle::recording::{count_submits, RecordingQueue},
        memory::{Managed, WorkspacePool},
        Activation, ErrorKind,
    };

    #[test]
    fn test_output_tile() {
        let big = Size2D::new(32, 32);
        let tile = |k: (usize, usize), input, layout| {
            winograd_output_tile(input, Size2D::new(k.0, k.1), layout)
        };
        assert_eq!(tile((3, 3), big, DataLayout::Nchw), Some(Size2D::new(4, 4)));
        assert_eq!(
            tile((3, 3), Size2D::new(4, 4), DataLayout::Nchw),
            Some(Size2D::new(2, 2))
        );
        assert_eq!(
            tile((3, 3), Size2D::new(4, 4), DataLayout::Nhwc),
            Some(Size2D::new(4, 4))
        );
        assert_eq!(tile((5, 5), big, DataLayout::Nchw), Some(Size2D::new(4, 4)));
        assert_eq!(tile((7, 7), big, DataLayout::Nhwc), Some(Size2D::new(2, 2)));
        assert_eq!(tile((3, 1), big, DataLayout::Nchw), Some(Size2D::new(4, 1)));
        assert_eq!(tile((1, 7), big, DataLayout::Nchw), Some(Size2D::new(1, 2)));
        assert_eq!(tile((1, 1), big, DataLayout::Nchw), None);
        assert_eq!(tile((9, 9), big, DataLayout::Nchw), None);
        assert_eq!(tile((3, 5), big, DataLayout::Nchw), None);
    }

    #[test]
    fn test_validate() {
        let case = |k: usize, pad: usize| Case::nchw(DataType::F32, [1, 8, 12, 12], 8, k, pad);
        assert!(WinogradConv2d::validate(&case(3, 1).info).is_ok());
        assert!(WinogradConv2d::validate(&case(3, 2).info).is_err());
        assert!(WinogradConv2d::validate(&case(5, 2).info).is_err());
        assert!(WinogradConv2d::validate(&case(5, 2).info.with_fast_math(true)).is_ok());
        assert!(WinogradConv2d::validate(&case(9, 4).info).is_err());

        let half = Case::nchw(DataType::F16, [1, 8, 12, 12], 8, 3, 1);
        let err = WinogradConv2d::validate(&half.info).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MethodNotSupport);
        assert!(WinogradConv2d::validate(&half.info.with_fast_math(true)).is_ok());

        let base = case(3, 1).info;
        let strided = Conv2dInfo::new(base.src, base.weights, PadStrideInfo::new(2, 2, 1, 1));
        assert!(WinogradConv2d::validate(&strided).is_err());
    }

    #[test]
    fn test_scenario() {
        let case = Case::nchw(DataType::F32, [1, 16, 32, 32], 16, 3, 1).with_bias();
        let device = DeviceInfo::default();
        let mut op = WinogradConv2d::configure(&case.info, &device).unwrap();
        assert_eq!(op.output_tile(), Size2D::new(4, 4));

        let (queue, log) = RecordingQueue::new(device);
        let mut scheduler = Scheduler::new();
        scheduler.init(queue, None);

        let pack = case.pack();
        op.run(&pack, &mut scheduler).unwrap();
        assert_eq!(count_submits(&log, "winograd_filter_transform"), 1);
        assert!(!pack.require(Slot::Src1).unwrap().is_used());
        case.check(&pack, &mut scheduler, 1e-4, 1e-3);

        op.run(&pack, &mut scheduler).unwrap();
        op.prepare(&pack, &mut scheduler).unwrap();
        assert_eq!(count_submits(&log, "winograd_filter_transform"), 1);
        assert_eq!(count_submits(&log, "winograd_input_transform"), 2);
        assert_eq!(count_submits(&log, "winograd_output_transform"), 2);
        case.check(&pack, &mut scheduler, 1e-4, 1e-3);
    }

    #[test]
    fn test_stage_order() {
        use crate::handle::recording::Record;

        let case = Case::nchw(DataType::F32, [1, 16, 8, 8], 16, 3, 1);
        let device = DeviceInfo::default();
        let mut op = WinogradConv2d::configure(&case.info, &device).unwrap();
        let (queue, log) = RecordingQueue::new(device);
        let mut scheduler = Scheduler::new();
        scheduler.init(queue, None);
        op.run(&case.pack(), &mut scheduler).unwrap();

        let submits = log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| match r {
                Record::Submit(name) => Some(*name),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            submits,
            [
                "winograd_filter_transform",
                "gemm_reshape_rhs",
                "fill_border",
                "winograd_input_transform",
                "gemm_mm_reshaped_only_rhs",
                "winograd_output_transform",
            ]
        );
        // 只有最后一个阶段冲刷
        assert_eq!(scheduler.stats().unwrap().flushes, 1);
    }

    #[test]
    fn test_variants() {
        let cases = [
            Case::nchw(DataType::F32, [2, 16, 9, 11], 8, 3, 1).with_bias(),
            Case::nchw(DataType::F32, [1, 4, 4, 4], 6, 3, 0),
            Case::nhwc(DataType::F32, [1, 16, 10, 7], 12, [3, 3], [1, 1]),
            Case::nhwc(DataType::F32, [1, 5, 6, 9], 3, [1, 3], [0, 1]).with_bias(),
            Case::nchw_kernel(DataType::F32, [1, 3, 9, 8], 4, [3, 1], [1, 0]),
        ];
        for case in cases {
            let case = case.with_activation(Activation::BoundedRelu(1.5));
            case.run::<WinogradConv2d>(&DeviceInfo::default(), 1e-4, 1e-3);
        }

        let fast = [
            Case::nchw(DataType::F32, [1, 8, 13, 13], 4, 5, 2),
            Case::nchw(DataType::F32, [1, 8, 11, 11], 4, 7, 3),
            Case::nchw(DataType::F16, [1, 8, 10, 10], 4, 3, 1),
            Case::nchw_kernel(DataType::F32, [1, 3, 9, 8], 4, [5, 1], [2, 0]),
        ];
        for case in fast {
            let case = case.with_fast_math();
            case.run::<WinogradConv2d>(&DeviceInfo::default(), 2e-2, 2e-2);
        }
    }

    #[test]
    fn test_native_gemm_keeps_filter() {
        // 矩阵乘不缓存重排结果时变换后的卷积核常驻
        let case = Case::nchw(DataType::F32, [1, 16, 8, 8], 16, 3, 1);
        let mut device = DeviceInfo::default();
        device.gemm.min_reshape_k = usize::MAX;
        let op = WinogradConv2d::configure(&case.info, &device).unwrap();
        assert!(!op.gemm().caches_rhs());
        let reqs = Requirements::merge(op.workspace());
        assert_eq!(
            reqs.get(TRANSFORMED_FILTER).unwrap().lifetime,
            Lifetime::Persistent
        );
        case.run::<WinogradConv2d>(&device, 1e-4, 1e-3);
    }

    #[test]
    fn test_managed_workspace() {
        let case = Case::nchw(DataType::F32, [1, 16, 12, 12], 16, 3, 1).with_bias();
        let device = DeviceInfo::default();
        let op = WinogradConv2d::configure(&case.info, &device).unwrap();
        let reqs = Requirements::merge(op.workspace());
        assert_eq!(reqs.get(BORDERED_INPUT).unwrap().lifetime, Lifetime::Temporary);
        assert_eq!(reqs.get(TRANSFORMED_FILTER).unwrap().lifetime, Lifetime::Prepare);
        assert!(reqs.get(crate::mat_mul::RHS_RESHAPED).is_some());

        let mut scheduler: Scheduler = Scheduler::new();
        scheduler.default_init(None, None, Default::default()).unwrap();
        let mut pool = WorkspacePool::new();
        let mut managed = Managed::new(op);
        let pack = case.pack();
        managed.run(&pack, &mut scheduler, Some(&mut pool)).unwrap();
        case.check(&pack, &mut scheduler, 1e-4, 1e-3);
        managed.run(&pack, &mut scheduler, Some(&mut pool)).unwrap();
        case.check(&pack, &mut scheduler, 1e-4, 1e-3);
        assert!(managed.op().is_prepared());
    }

    #[test]
    fn test_stale_workspace() {
        let small = Case::nchw(DataType::F32, [1, 16, 8, 8], 16, 3, 1);
        let large = Case::nchw(DataType::F32, [1, 16, 16, 16], 16, 3, 1);
        let device = DeviceInfo::default();

        let mut scheduler: Scheduler = Scheduler::new();
        scheduler.default_init(None, None, Default::default()).unwrap();

        let op = WinogradConv2d::configure(&small.info, &device).unwrap();
        let mut ws = crate::memory::Workspace::new(op.workspace());
        ws.acquire(None).unwrap();
        let mut stale = TensorPack::new();
        ws.bind(&mut stale);

        // 为更大的形状配置，却沿用旧的工作空间
        let mut op = WinogradConv2d::configure(&large.info, &device).unwrap();
        let mut pack = large.pack();
        pack.extend(&stale);
        let err = op.run(&pack, &mut scheduler).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvariantViolation);

        // 重新声明并获取后可以运行
        let mut managed = Managed::new(WinogradConv2d::configure(&small.info, &device).unwrap());
        managed.run(&small.pack(), &mut scheduler, None).unwrap();
        managed.reconfigure(&large.info, &device).unwrap();
        let pack = large.pack();
        managed.run(&pack, &mut scheduler, None).unwrap();
        large.check(&pack, &mut scheduler, 1e-4, 1e-3);
    }

    #[test]
    fn test_operand_shapes() {
        let small = Case::nchw(DataType::F32, [1, 16, 8, 8], 16, 3, 1);
        let large = Case::nchw(DataType::F32, [1, 16, 16, 16], 16, 3, 1);
        rejects_mismatched::<WinogradConv2d>(&small, &large, &DeviceInfo::default(), 1e-4, 1e-3);
    }
}

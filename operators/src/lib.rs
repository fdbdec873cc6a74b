// #![deny(warnings)]

mod common;

pub mod conv;
pub mod handle;
pub mod mat_mul;
pub mod memory;
pub mod scheduler;

pub use common::*;

use handle::{CommandQueue, DeviceInfo};
use scheduler::{LocalWorkSize, Scheduler, Tuning};

/// 设备核函数。
///
/// 核函数在配置时确定全部静态参数，执行时从张量包中取出张量。
/// 同一实例可能被调优器在相同参数上重复执行，因此执行必须是幂等的。
pub trait Kernel: Send + Sync {
    /// 核函数名，也是程序缓存键的一部分。
    fn name(&self) -> &'static str;
    /// 区分同名核函数不同配置的标识，作为调优表的键。
    fn config_id(&self) -> String;
    /// 编译选项。
    fn build_options(&self) -> Vec<String> {
        Vec::new()
    }
    /// 配置时确定的迭代空间。
    fn window(&self) -> Window;
    /// 读取越过输入边界的最大距离。
    fn border_size(&self) -> BorderSize {
        BorderSize::ZERO
    }
    /// 实例上的调优结果。
    fn tuning(&self) -> &Tuning;
    /// 在窗口上执行。
    fn run_op(&self, pack: &TensorPack, window: &Window, lws: LocalWorkSize)
        -> Result<(), Status>;
}

/// 可管理辅助存储的算子。
///
/// 配置只做验证和规划，不接触设备；准备阶段做一次性的权重变换；运行阶段向调度器提交核函数。
pub trait Operator: Sized {
    /// 算子的配置参数。
    type Info;

    /// 检查参数是否受支持，不创建任何对象。
    fn validate(info: &Self::Info) -> Result<(), Status>;

    /// 根据参数和设备信息规划执行方案。
    fn configure(info: &Self::Info, device: &DeviceInfo) -> Result<Self, Status>;

    /// 算子及其子算子需要的辅助存储。
    fn workspace(&self) -> Vec<MemoryRequirement>;

    /// 准备阶段是否已经完成。
    fn is_prepared(&self) -> bool;

    /// 一次性的准备工作，重复调用没有效果。
    fn prepare<Q: CommandQueue>(
        &mut self,
        pack: &TensorPack,
        scheduler: &mut Scheduler<Q>,
    ) -> Result<(), Status>;

    /// 提交一次执行，必要时先完成准备。
    fn run<Q: CommandQueue>(
        &mut self,
        pack: &TensorPack,
        scheduler: &mut Scheduler<Q>,
    ) -> Result<(), Status>;
}

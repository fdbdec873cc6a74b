mod tuner;

pub use tuner::{LocalWorkSize, Tuner, TunerMode, Tuning};

use crate::{
    handle::{
        common_cpu::DeviceQueue, Command, CommandQueue, DeviceInfo, Event, GpuTarget, Program,
        ProgramKey,
    },
    mat_mul::GemmHeuristics,
    usage_error, CacheLevel, CacheSize, Kernel, Status, TensorPack,
};
use lru::LruCache;
use std::{collections::HashMap, sync::Arc, time::Instant};

/// 设备命令调度器。
///
/// 持有唯一的命令队列，负责作业链、核函数调优和显式同步。
/// 调度器是显式传递的值，所有调度调用都要求 `&mut`，由调用者串行化。
pub struct Scheduler<Q = DeviceQueue> {
    state: Option<State<Q>>,
    cache_size: CacheSize,
}

struct State<Q> {
    queue: Q,
    tuner: Option<Tuner>,
    chain: JobChain,
    programs: LruCache<ProgramKey, Program>,
    stats: SchedulerStats,
}

#[derive(Clone, Copy, Default, Debug)]
struct JobChain {
    enabled: bool,
    size: usize,
    count: usize,
}

/// 调度器的运行统计。
#[derive(Clone, Default, Debug)]
pub struct SchedulerStats {
    pub enqueued: usize,
    pub flushes: usize,
    pub programs_built: usize,
    pub kernels_tuned: usize,
    submitted: HashMap<&'static str, usize>,
}

impl SchedulerStats {
    /// 指定名字的核函数被提交的次数。
    #[inline]
    pub fn submitted(&self, name: &str) -> usize {
        self.submitted.get(name).copied().unwrap_or(0)
    }
}

impl<Q> Default for Scheduler<Q> {
    #[inline]
    fn default() -> Self {
        Self {
            state: None,
            cache_size: CacheSize::default(),
        }
    }
}

impl<Q: CommandQueue> Scheduler<Q> {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定程序缓存的容量，只影响之后的初始化。
    #[inline]
    pub fn with_cache_size(mut self, cache_size: CacheSize) -> Self {
        self.cache_size = cache_size;
        self
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// 绑定队列。已初始化时什么也不做。
    pub fn init(&mut self, queue: Q, tuner: Option<Tuner>) {
        if self.state.is_some() {
            log::debug!("scheduler already initialized, ignoring init");
            return;
        }
        log::info!(
            "scheduler initialized on {} (tuner: {:?})",
            queue.device().name,
            tuner.as_ref().map(|t| t.mode),
        );
        self.state = Some(State {
            queue,
            tuner,
            chain: JobChain::default(),
            programs: self.cache_size.new_cache(CacheLevel::High),
            stats: SchedulerStats::default(),
        })
    }

    /// 等待旧队列排空后重新初始化。
    pub fn reinit(&mut self, queue: Q, tuner: Option<Tuner>) {
        if let Some(mut old) = self.state.take() {
            if let Err(e) = old.queue.finish() {
                log::warn!("previous queue finished with fault: {e}");
            }
        }
        self.init(queue, tuner)
    }

    fn state(&self) -> Result<&State<Q>, Status> {
        self.state
            .as_ref()
            .ok_or_else(|| usage_error("scheduler is not initialized"))
    }

    fn state_mut(&mut self) -> Result<&mut State<Q>, Status> {
        self.state
            .as_mut()
            .ok_or_else(|| usage_error("scheduler is not initialized"))
    }

    #[inline]
    pub fn device(&self) -> Result<&DeviceInfo, Status> {
        Ok(self.state()?.queue.device())
    }

    #[inline]
    pub fn tuner(&self) -> Option<&Tuner> {
        self.state.as_ref()?.tuner.as_ref()
    }

    #[inline]
    pub fn tuner_mut(&mut self) -> Option<&mut Tuner> {
        self.state.as_mut()?.tuner.as_mut()
    }

    #[inline]
    pub fn stats(&self) -> Result<&SchedulerStats, Status> {
        Ok(&self.state()?.stats)
    }

    /// 每提交 `size` 个核函数冲刷一次队列，忽略调用者的 `flush` 参数。
    ///
    /// `size` 为 0 时返回用法错误，作业链状态不变。
    pub fn enable_job_chaining(&mut self, size: usize) -> Result<(), Status> {
        let state = self.state_mut()?;
        if size == 0 {
            return Err(usage_error("job chain size must be positive"));
        }
        state.chain = JobChain {
            enabled: true,
            size,
            count: 0,
        };
        Ok(())
    }

    pub fn disable_job_chaining(&mut self) -> Result<(), Status> {
        self.state_mut()?.chain = JobChain::default();
        Ok(())
    }

    /// 提交不需要张量参数的核函数。
    #[inline]
    pub fn enqueue<K: Kernel + 'static>(
        &mut self,
        kernel: &Arc<K>,
        flush: bool,
    ) -> Result<(), Status> {
        self.enqueue_op(kernel, &TensorPack::new(), flush)
    }

    /// 在核函数的整个窗口上提交一次执行。
    pub fn enqueue_op<K: Kernel + 'static>(
        &mut self,
        kernel: &Arc<K>,
        pack: &TensorPack,
        flush: bool,
    ) -> Result<(), Status> {
        let state = self.state_mut()?;
        if let Some((slot, _)) = pack.iter().find(|(_, t)| t.buffer().is_mapped()) {
            return Err(usage_error(format!(
                "{slot} of {} is mapped to host",
                kernel.name()
            )));
        }

        let window = kernel.window();
        if window.is_empty() {
            log::debug!("{} has an empty window, skipped", kernel.name());
            return Ok(());
        }

        let program = state.program(&**kernel)?;
        let lws = match kernel.tuning().get() {
            Some(lws) => lws,
            None => state.tune(kernel.clone(), pack, &program)?,
        };

        state.queue.submit(Command {
            program,
            kernel: kernel.clone(),
            pack: pack.clone(),
            window,
            lws,
        })?;
        state.stats.enqueued += 1;
        *state.stats.submitted.entry(kernel.name()).or_default() += 1;

        state.after_enqueue(flush)
    }

    /// 不经运行地确定核函数的工作划分：调优表中有记录时取记录，否则取默认值。
    pub fn tune_kernel_static(&mut self, kernel: &dyn Kernel) -> Result<(), Status> {
        let state = self.state_mut()?;
        state.tune_static(kernel);
        Ok(())
    }

    /// 送出已提交的命令，不等待。
    pub fn flush(&mut self) -> Result<(), Status> {
        let state = self.state_mut()?;
        state.stats.flushes += 1;
        state.queue.flush()
    }

    /// 阻塞直到所有已提交的工作完成。
    pub fn sync(&mut self) -> Result<(), Status> {
        self.state_mut()?.queue.finish()
    }

    /// 插入一个同步事件，事件完成时之前的所有工作都已完成。
    pub fn enqueue_sync_event(&mut self) -> Result<Event, Status> {
        self.state_mut()?.queue.marker()
    }
}

impl<Q: CommandQueue> State<Q> {
    fn program(&mut self, kernel: &dyn Kernel) -> Result<Program, Status> {
        let key = ProgramKey {
            name: kernel.name().to_string(),
            options: kernel.build_options(),
            device: self.queue.device().name.clone(),
        };
        if let Some(program) = self.programs.get(&key) {
            return Ok(program.clone());
        }
        let program = self.queue.build_program(&key.name, &key.options)?;
        log::debug!("built program {} {:?}", key.name, key.options);
        self.stats.programs_built += 1;
        self.programs.put(key, program.clone());
        Ok(program)
    }

    fn tune(
        &mut self,
        kernel: Arc<dyn Kernel>,
        pack: &TensorPack,
        program: &Program,
    ) -> Result<LocalWorkSize, Status> {
        let dynamic = self.tuner.as_ref().is_some_and(|t| {
            t.tune_new_kernels && t.lookup(&kernel.config_id()).is_none()
        });
        if dynamic {
            self.tune_dynamic(kernel.clone(), pack, program)?;
        } else {
            self.tune_static(&*kernel);
        }
        Ok(kernel.tuning().get().unwrap_or(LocalWorkSize::DEFAULT))
    }

    fn tune_static(&mut self, kernel: &dyn Kernel) {
        let lws = self
            .tuner
            .as_ref()
            .and_then(|t| t.lookup(&kernel.config_id()))
            .unwrap_or(LocalWorkSize::DEFAULT);
        if kernel.tuning().set(lws) {
            self.stats.kernels_tuned += 1;
        }
    }

    /// 在真实参数上逐个尝试候选划分，取最快者。要求核函数幂等。
    fn tune_dynamic(
        &mut self,
        kernel: Arc<dyn Kernel>,
        pack: &TensorPack,
        program: &Program,
    ) -> Result<(), Status> {
        let Some(mode) = self.tuner.as_ref().map(|t| t.mode) else {
            return Ok(());
        };
        let window = kernel.window();
        self.queue.finish()?;

        let mut best = (LocalWorkSize::DEFAULT, u128::MAX);
        for lws in mode.candidates(window.num_items(), self.queue.device().compute_units) {
            let time = Instant::now();
            self.queue.submit(Command {
                program: program.clone(),
                kernel: kernel.clone(),
                pack: pack.clone(),
                window,
                lws,
            })?;
            self.queue.finish()?;
            let nanos = time.elapsed().as_nanos();
            if nanos < best.1 {
                best = (lws, nanos);
            }
        }

        let config_id = kernel.config_id();
        log::debug!("tuned {config_id}: {:?} in {}ns", best.0, best.1);
        if let Some(tuner) = self.tuner.as_mut() {
            tuner.insert(config_id, best.0);
        }
        if kernel.tuning().set(best.0) {
            self.stats.kernels_tuned += 1;
        }
        Ok(())
    }

    fn after_enqueue(&mut self, flush: bool) -> Result<(), Status> {
        let flush = if self.chain.enabled {
            self.chain.count += 1;
            if self.chain.count >= self.chain.size {
                self.chain.count = 0;
                true
            } else {
                false
            }
        } else {
            flush
        };
        if flush {
            self.stats.flushes += 1;
            self.queue.flush()?;
        }
        Ok(())
    }
}

impl Scheduler<DeviceQueue> {
    /// 在模拟设备上初始化，已初始化时什么也不做。
    pub fn default_init(
        &mut self,
        tuner: Option<Tuner>,
        heuristics: Option<GemmHeuristics>,
        target: GpuTarget,
    ) -> Result<(), Status> {
        if self.is_initialized() {
            log::debug!("scheduler already initialized, ignoring default_init");
            return Ok(());
        }
        let queue = default_queue(heuristics, target)?;
        self.init(queue, tuner);
        Ok(())
    }

    /// 丢弃现有状态，在模拟设备上重新初始化。
    pub fn default_reinit(
        &mut self,
        tuner: Option<Tuner>,
        heuristics: Option<GemmHeuristics>,
        target: GpuTarget,
    ) -> Result<(), Status> {
        let queue = default_queue(heuristics, target)?;
        self.reinit(queue, tuner);
        Ok(())
    }
}

fn default_queue(
    heuristics: Option<GemmHeuristics>,
    target: GpuTarget,
) -> Result<DeviceQueue, Status> {
    let mut info = DeviceInfo::new(target);
    if let Some(heuristics) = heuristics {
        info.gemm = heuristics;
    }
    DeviceQueue::new(info)
}

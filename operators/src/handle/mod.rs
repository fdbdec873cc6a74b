pub mod common_cpu;

use crate::{mat_mul::GemmHeuristics, scheduler::LocalWorkSize, Kernel, Status, TensorPack, Window};
use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, PoisonError},
};

/// 设备架构，影响方法选择的阈值。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum GpuTarget {
    Midgard,
    Bifrost,
    Valhall,
    G71,
    G72,
    G51,
    G52,
    G76,
    G77,
    G78,
    G710,
}

impl Default for GpuTarget {
    #[inline]
    fn default() -> Self {
        Self::Valhall
    }
}

/// 只读的设备信息，配置阶段据此做决策。
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub target: GpuTarget,
    pub compute_units: usize,
    pub gemm: GemmHeuristics,
}

impl DeviceInfo {
    pub fn new(target: GpuTarget) -> Self {
        Self {
            name: format!("emulated-{target:?}").to_lowercase(),
            target,
            compute_units: rayon::current_num_threads(),
            gemm: GemmHeuristics::default(),
        }
    }
}

impl Default for DeviceInfo {
    #[inline]
    fn default() -> Self {
        Self::new(GpuTarget::default())
    }
}

/// 程序缓存的键。
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ProgramKey {
    pub name: String,
    pub options: Vec<String>,
    pub device: String,
}

/// 编译好的设备程序。
#[derive(Clone, Debug)]
pub struct Program {
    pub key: ProgramKey,
    pub id: u64,
}

/// 提交到队列的一次核函数执行。
pub struct Command {
    pub program: Program,
    pub kernel: Arc<dyn Kernel>,
    pub pack: TensorPack,
    pub window: Window,
    pub lws: LocalWorkSize,
}

impl Command {
    #[inline]
    pub fn execute(&self) -> Result<(), Status> {
        self.kernel.run_op(&self.pack, &self.window, self.lws)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Command")
            .field("kernel", &self.kernel.name())
            .field("program", &self.program.id)
            .field("window", &self.window)
            .field("lws", &self.lws)
            .finish()
    }
}

/// 队列中的同步点。
#[derive(Clone, Default)]
pub struct Event(Arc<(Mutex<bool>, Condvar)>);

impl Event {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        let (lock, cvar) = &*self.0;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        *self.0 .0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 阻塞直到事件之前的工作全部完成。
    pub fn wait(&self) {
        let (lock, cvar) = &*self.0;
        let mut done = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = cvar.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// 顺序执行的设备命令队列。
///
/// 提交是异步的，只有 [`finish`](CommandQueue::finish) 阻塞。
pub trait CommandQueue: Send {
    /// 队列所属设备的信息。
    fn device(&self) -> &DeviceInfo;
    /// 为核函数编译程序。
    fn build_program(&mut self, name: &str, options: &[String]) -> Result<Program, Status>;
    /// 把命令放入队列，不保证开始执行。
    fn submit(&mut self, command: Command) -> Result<(), Status>;
    /// 把已提交的命令送往设备。
    fn flush(&mut self) -> Result<(), Status>;
    /// 等待所有命令完成，报告执行期间的设备故障。
    fn finish(&mut self) -> Result<(), Status>;
    /// 在队列中插入一个事件，之前的命令完成后事件完成。
    fn marker(&mut self) -> Result<Event, Status>;
}

#[cfg(test)]
pub(crate) mod recording {
    use super::{Command, CommandQueue, DeviceInfo, Event, Program, ProgramKey};
    use crate::Status;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, PartialEq, Eq, Debug)]
    pub enum Record {
        Build(String),
        Submit(&'static str),
        Flush,
        Finish,
        Marker,
    }

    /// 在提交时就地执行命令并记录调用顺序的队列。
    pub struct RecordingQueue {
        info: DeviceInfo,
        log: Arc<Mutex<Vec<Record>>>,
        next_id: u64,
    }

    impl RecordingQueue {
        pub fn new(info: DeviceInfo) -> (Self, Arc<Mutex<Vec<Record>>>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            let queue = Self {
                info,
                log: log.clone(),
                next_id: 0,
            };
            (queue, log)
        }

        fn push(&self, record: Record) {
            self.log.lock().unwrap().push(record)
        }
    }

    impl CommandQueue for RecordingQueue {
        fn device(&self) -> &DeviceInfo {
            &self.info
        }

        fn build_program(&mut self, name: &str, options: &[String]) -> Result<Program, Status> {
            self.push(Record::Build(name.to_string()));
            self.next_id += 1;
            Ok(Program {
                key: ProgramKey {
                    name: name.to_string(),
                    options: options.to_vec(),
                    device: self.info.name.clone(),
                },
                id: self.next_id,
            })
        }

        fn submit(&mut self, command: Command) -> Result<(), Status> {
            self.push(Record::Submit(command.kernel.name()));
            command.execute()
        }

        fn flush(&mut self) -> Result<(), Status> {
            self.push(Record::Flush);
            Ok(())
        }

        fn finish(&mut self) -> Result<(), Status> {
            self.push(Record::Finish);
            Ok(())
        }

        fn marker(&mut self) -> Result<Event, Status> {
            self.push(Record::Marker);
            let event = Event::new();
            event.complete();
            Ok(event)
        }
    }

    /// 统计日志中某个核函数的提交次数。
    pub fn count_submits(log: &Mutex<Vec<Record>>, name: &str) -> usize {
        log.lock()
            .unwrap()
            .iter()
            .filter(|r| matches!(r, Record::Submit(n) if *n == name))
            .count()
    }
}

#[test]
fn test_event() {
    let event = Event::new();
    assert!(!event.is_complete());
    let remote = event.clone();
    let t = std::thread::spawn(move || remote.complete());
    event.wait();
    assert!(event.is_complete());
    t.join().unwrap();
}

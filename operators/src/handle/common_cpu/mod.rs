use super::{Command, CommandQueue, DeviceInfo, Event, GpuTarget, Program, ProgramKey};
use crate::{execution_failed, Status};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};

enum Work {
    Batch(Vec<Command>),
    Marker(Event),
}

type Fault = Arc<Mutex<Option<Status>>>;

/// 在主机上模拟的设备队列。
///
/// 命令按提交顺序在专属的工作线程上执行，核函数内部再用 rayon 并行。
/// 一旦某条命令失败，队列进入故障状态：后续命令被丢弃，同步时报告故障。
pub struct DeviceQueue {
    info: DeviceInfo,
    sender: Option<flume::Sender<Work>>,
    worker: Option<JoinHandle<()>>,
    pending: Vec<Command>,
    fault: Fault,
    next_program: u64,
}

impl DeviceQueue {
    pub fn new(info: DeviceInfo) -> Result<Self, Status> {
        let (sender, receiver) = flume::unbounded();
        let fault = Fault::default();
        let worker = thread::Builder::new()
            .name(format!("{}-queue", info.name))
            .spawn({
                let fault = fault.clone();
                move || serve(receiver, fault)
            })
            .map_err(|e| execution_failed(format!("failed to spawn device worker: {e}")))?;
        Ok(Self {
            info,
            sender: Some(sender),
            worker: Some(worker),
            pending: Vec::new(),
            fault,
            next_program: 0,
        })
    }

    #[inline]
    pub fn with_target(target: GpuTarget) -> Result<Self, Status> {
        Self::new(DeviceInfo::new(target))
    }

    fn fault(&self) -> Option<Status> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn send(&self, work: Work) -> Result<(), Status> {
        self.sender
            .as_ref()
            .ok_or_else(|| execution_failed("device queue closed"))?
            .send(work)
            .map_err(|_| execution_failed("device worker stopped"))
    }
}

fn serve(receiver: flume::Receiver<Work>, fault: Fault) {
    while let Ok(work) = receiver.recv() {
        match work {
            Work::Batch(commands) => {
                for command in commands {
                    if fault
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .is_some()
                    {
                        break;
                    }
                    let result = catch_unwind(AssertUnwindSafe(|| command.execute()))
                        .unwrap_or_else(|_| {
                            Err(execution_failed(format!("{} panicked", command.kernel.name())))
                        });
                    if let Err(e) = result {
                        log::error!("{} failed on device: {e}", command.kernel.name());
                        *fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
                    }
                }
            }
            Work::Marker(event) => event.complete(),
        }
    }
}

impl CommandQueue for DeviceQueue {
    #[inline]
    fn device(&self) -> &DeviceInfo {
        &self.info
    }

    fn build_program(&mut self, name: &str, options: &[String]) -> Result<Program, Status> {
        if name.is_empty() {
            return Err(execution_failed("program name is empty"));
        }
        self.next_program += 1;
        Ok(Program {
            key: ProgramKey {
                name: name.to_string(),
                options: options.to_vec(),
                device: self.info.name.clone(),
            },
            id: self.next_program,
        })
    }

    fn submit(&mut self, command: Command) -> Result<(), Status> {
        if let Some(e) = self.fault() {
            return Err(e);
        }
        self.pending.push(command);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Status> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        self.send(Work::Batch(batch))
    }

    fn finish(&mut self) -> Result<(), Status> {
        self.marker()?.wait();
        match self.fault() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn marker(&mut self) -> Result<Event, Status> {
        self.flush()?;
        let event = Event::new();
        self.send(Work::Marker(event.clone()))?;
        Ok(event)
    }
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        self.pending.clear();
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

//! 辅助存储管理：按槽聚合子算子的需求，为每个槽提供唯一的一块存储。

use crate::{
    handle::CommandQueue, scheduler::Scheduler, Buffer, Lifetime, MemoryRequirement,
    Operator, Requirements, Slot, Status, Tensor, TensorDesc, TensorPack, ALIGN,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Range,
};

/// 多个工作空间共享的临时存储。
///
/// 所有注册者的临时槽都从同一块存储中划分，因为队列是顺序执行的，
/// 不同算子的临时数据不会同时存活。存储增长时代数加一，旧的视图在下次获取时重新绑定。
#[derive(Default)]
pub struct WorkspacePool {
    arena: Option<Buffer>,
    generation: u64,
}

impl WorkspacePool {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 共享存储的字节数，各临时槽按 [`ALIGN`] 对齐后累加。
    #[inline]
    pub fn size(&self) -> usize {
        self.arena.as_ref().map_or(0, Buffer::len)
    }

    #[inline]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    fn reserve(&mut self, size: usize) -> (Buffer, u64) {
        match &self.arena {
            Some(arena) if arena.len() >= size => (arena.clone(), self.generation),
            _ => {
                self.generation += 1;
                log::debug!(
                    "workspace pool grows to {size} bytes (generation {})",
                    self.generation
                );
                let arena = Buffer::new(size);
                self.arena = Some(arena.clone());
                (arena, self.generation)
            }
        }
    }
}

struct Arena {
    /// 来自共享池时记录池的代数。
    generation: Option<u64>,
    views: BTreeMap<Slot, Tensor>,
}

/// 一个流水线实例的工作空间。
#[derive(Default)]
pub struct Workspace {
    reqs: Requirements,
    temporary: Option<Arena>,
    owned: BTreeMap<Slot, Tensor>,
    released: BTreeSet<Slot>,
}

impl Workspace {
    pub fn new(reqs: impl IntoIterator<Item = MemoryRequirement>) -> Self {
        Self {
            reqs: Requirements::merge(reqs),
            ..Default::default()
        }
    }

    /// 重新配置后重新声明需求，不再满足需求的存储被丢弃。
    pub fn declare(&mut self, reqs: impl IntoIterator<Item = MemoryRequirement>) {
        self.reqs = Requirements::merge(reqs);
        self.temporary = None;
        self.released.clear();
        let reqs = &self.reqs;
        self.owned.retain(|slot, t| {
            reqs.get(*slot).is_some_and(|req| {
                req.lifetime != Lifetime::Temporary && t.buffer().len() >= req.size
            })
        });
    }

    #[inline]
    pub fn requirements(&self) -> &Requirements {
        &self.reqs
    }

    #[inline]
    pub fn size_of(&self, slot: Slot) -> Option<usize> {
        self.reqs.get(slot).map(|req| req.size)
    }

    /// 为每个已声明的槽准备存储。临时槽在提供共享池时从池中划分。
    pub fn acquire(&mut self, pool: Option<&mut WorkspacePool>) -> Result<(), Status> {
        let (layout, total) = self.temporary_layout();
        match pool {
            Some(pool) => {
                let (arena, generation) = pool.reserve(total);
                if self.temporary.as_ref().and_then(|a| a.generation) != Some(generation) {
                    self.temporary = Some(Arena {
                        generation: Some(generation),
                        views: views(&arena, &layout)?,
                    });
                }
            }
            None => {
                if self.temporary.as_ref().map_or(true, |a| a.generation.is_some()) {
                    self.temporary = Some(Arena {
                        generation: None,
                        views: views(&Buffer::new(total), &layout)?,
                    });
                }
            }
        }

        for req in self.reqs.iter() {
            if req.lifetime == Lifetime::Temporary || self.released.contains(&req.slot) {
                continue;
            }
            let fits = self
                .owned
                .get(&req.slot)
                .is_some_and(|t| t.buffer().len() >= req.size);
            if !fits {
                self.owned
                    .insert(req.slot, Tensor::new(TensorDesc::bytes(req.size)));
            }
        }
        Ok(())
    }

    /// 把存储放入张量包。
    pub fn bind(&self, pack: &mut TensorPack) {
        if let Some(arena) = &self.temporary {
            for (&slot, t) in &arena.views {
                pack.add(slot, t)
            }
        }
        for (&slot, t) in &self.owned {
            pack.add(slot, t)
        }
    }

    /// 回收指定寿命的存储。回收的准备期存储不会再被获取，直到重新声明。
    pub fn release(&mut self, lifetime: Lifetime) {
        match lifetime {
            Lifetime::Temporary => self.temporary = None,
            Lifetime::Prepare | Lifetime::Persistent => {
                for req in self.reqs.iter().filter(|req| req.lifetime == lifetime) {
                    if self.owned.remove(&req.slot).is_some() && lifetime == Lifetime::Prepare {
                        log::debug!("released {} after prepare", req.slot);
                    }
                    if lifetime == Lifetime::Prepare {
                        self.released.insert(req.slot);
                    }
                }
            }
        }
    }

    /// 当前持有的存储总量。
    pub fn allocated(&self) -> usize {
        let temporary = self
            .temporary
            .as_ref()
            .filter(|a| a.generation.is_none())
            .map_or(0, |a| a.views.values().map(|t| t.buffer().len()).sum());
        let owned = self.owned.values().map(|t| t.buffer().len()).sum::<usize>();
        temporary + owned
    }

    fn temporary_layout(&self) -> (Vec<(Slot, Range<usize>)>, usize) {
        let mut offset = 0;
        let layout = self
            .reqs
            .iter()
            .filter(|req| req.lifetime == Lifetime::Temporary)
            .map(|req| {
                let range = offset..offset + req.size;
                offset += req.size.div_ceil(ALIGN) * ALIGN;
                (req.slot, range)
            })
            .collect();
        (layout, offset)
    }
}

fn views(
    arena: &Buffer,
    layout: &[(Slot, Range<usize>)],
) -> Result<BTreeMap<Slot, Tensor>, Status> {
    layout
        .iter()
        .map(|(slot, range)| {
            let view = arena.slice(range.clone()).ok_or_else(|| {
                crate::invariant_violation(format!("{slot} exceeds the workspace arena"))
            })?;
            Ok((*slot, Tensor::from_buffer(TensorDesc::bytes(range.len()), view)?))
        })
        .collect()
}

/// 带工作空间的算子：每次运行前获取并绑定存储，准备完成后回收准备期存储。
pub struct Managed<O> {
    op: O,
    workspace: Workspace,
}

impl<O: Operator> Managed<O> {
    pub fn new(op: O) -> Self {
        let workspace = Workspace::new(op.workspace());
        Self { op, workspace }
    }

    #[inline]
    pub fn op(&self) -> &O {
        &self.op
    }

    #[inline]
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// 用新的参数重新配置算子，并重新声明工作空间。
    pub fn reconfigure(
        &mut self,
        info: &O::Info,
        device: &crate::handle::DeviceInfo,
    ) -> Result<(), Status> {
        self.op = O::configure(info, device)?;
        self.workspace.declare(self.op.workspace());
        Ok(())
    }

    pub fn prepare<Q: CommandQueue>(
        &mut self,
        pack: &TensorPack,
        scheduler: &mut Scheduler<Q>,
        pool: Option<&mut WorkspacePool>,
    ) -> Result<(), Status> {
        let pack = self.bind(pack, pool)?;
        self.op.prepare(&pack, scheduler)?;
        self.workspace.release(Lifetime::Prepare);
        Ok(())
    }

    pub fn run<Q: CommandQueue>(
        &mut self,
        pack: &TensorPack,
        scheduler: &mut Scheduler<Q>,
        pool: Option<&mut WorkspacePool>,
    ) -> Result<(), Status> {
        let pack = self.bind(pack, pool)?;
        self.op.run(&pack, scheduler)?;
        if self.op.is_prepared() {
            self.workspace.release(Lifetime::Prepare)
        }
        Ok(())
    }

    fn bind(
        &mut self,
        pack: &TensorPack,
        pool: Option<&mut WorkspacePool>,
    ) -> Result<TensorPack, Status> {
        self.workspace.acquire(pool)?;
        let mut pack = pack.clone();
        self.workspace.bind(&mut pack);
        Ok(pack)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn reqs() -> Vec<MemoryRequirement> {
        vec![
            MemoryRequirement::new(Slot::Aux(0), 100, Lifetime::Temporary),
            MemoryRequirement::new(Slot::Aux(1), 10, Lifetime::Temporary),
            MemoryRequirement::new(Slot::Aux(1), 20, Lifetime::Temporary),
            MemoryRequirement::new(Slot::Aux(1), 15, Lifetime::Temporary),
            MemoryRequirement::new(Slot::Aux(2), 32, Lifetime::Prepare),
            MemoryRequirement::new(Slot::Aux(3), 48, Lifetime::Persistent),
        ]
    }

    #[test]
    fn test_one_buffer_per_slot() {
        let mut ws = Workspace::new(reqs());
        assert_eq!(ws.size_of(Slot::Aux(1)), Some(20));
        assert_eq!(ws.size_of(Slot::Aux(9)), None);

        ws.acquire(None).unwrap();
        let mut pack = TensorPack::new();
        ws.bind(&mut pack);
        assert_eq!(pack.len(), 4);
        let a0 = pack.get(Slot::Aux(0)).unwrap().buffer().clone();
        let a1 = pack.get(Slot::Aux(1)).unwrap().buffer().clone();
        assert_eq!(a1.len(), 20);
        assert!(a0.shares_storage(&a1));
        assert_eq!(ws.allocated(), 100 + 20 + 32 + 48);

        // 重复获取不重新分配
        ws.acquire(None).unwrap();
        let mut again = TensorPack::new();
        ws.bind(&mut again);
        let p2 = pack.get(Slot::Aux(2)).unwrap().buffer();
        assert!(again.get(Slot::Aux(2)).unwrap().buffer().shares_storage(p2));
    }

    #[test]
    fn test_release() {
        let mut ws = Workspace::new(reqs());
        ws.acquire(None).unwrap();
        ws.release(Lifetime::Prepare);
        ws.acquire(None).unwrap();
        let mut pack = TensorPack::new();
        ws.bind(&mut pack);
        assert!(!pack.contains(Slot::Aux(2)));
        assert!(pack.contains(Slot::Aux(3)));

        ws.release(Lifetime::Temporary);
        let mut pack = TensorPack::new();
        ws.bind(&mut pack);
        assert!(!pack.contains(Slot::Aux(0)));

        ws.declare(reqs());
        ws.acquire(None).unwrap();
        let mut pack = TensorPack::new();
        ws.bind(&mut pack);
        assert!(pack.contains(Slot::Aux(2)));
    }

    #[test]
    fn test_pool() {
        let mut pool = WorkspacePool::new();
        let mut small = Workspace::new([MemoryRequirement::new(
            Slot::Aux(0),
            64,
            Lifetime::Temporary,
        )]);
        let mut large = Workspace::new([MemoryRequirement::new(
            Slot::Aux(0),
            1000,
            Lifetime::Temporary,
        )]);

        small.acquire(Some(&mut pool)).unwrap();
        assert_eq!(pool.size(), 64);
        assert_eq!(pool.generation(), 1);
        // 每个临时槽按 ALIGN 对齐
        large.acquire(Some(&mut pool)).unwrap();
        assert_eq!(pool.size(), 1000usize.div_ceil(ALIGN) * ALIGN);
        assert_eq!(pool.size(), 1024);
        assert_eq!(pool.generation(), 2);
        assert_eq!(small.allocated(), 0);

        small.acquire(Some(&mut pool)).unwrap();
        let mut a = TensorPack::new();
        small.bind(&mut a);
        let mut b = TensorPack::new();
        large.bind(&mut b);
        let a = a.get(Slot::Aux(0)).unwrap().buffer();
        let b = b.get(Slot::Aux(0)).unwrap().buffer();
        assert!(a.shares_storage(b));
        assert_eq!(pool.generation(), 2);
    }
}

use super::{invariant_violation, Slot, Status, Tensor, TensorDesc, TensorPack};
use std::{collections::BTreeMap, ops::Deref};

/// 辅助存储需要存活多久。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Lifetime {
    /// 只在一次运行内有效。
    Temporary,
    /// 只在准备阶段使用，准备完成后可以回收。
    Prepare,
    /// 与算子实例同寿命。
    Persistent,
}

/// 子算子声明的一项辅助存储需求，大小以字节计。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemoryRequirement {
    pub slot: Slot,
    pub size: usize,
    pub lifetime: Lifetime,
}

impl MemoryRequirement {
    #[inline]
    pub const fn new(slot: Slot, size: usize, lifetime: Lifetime) -> Self {
        Self {
            slot,
            size,
            lifetime,
        }
    }
}

/// 按槽合并后的需求表，每个槽只保留一项。
#[derive(Clone, Default, PartialEq, Debug)]
pub struct Requirements(BTreeMap<Slot, MemoryRequirement>);

impl Requirements {
    /// 同一槽的多个声明取最大尺寸和最长寿命。
    pub fn merge(reqs: impl IntoIterator<Item = MemoryRequirement>) -> Self {
        let mut map = BTreeMap::<Slot, MemoryRequirement>::new();
        for req in reqs {
            map.entry(req.slot)
                .and_modify(|it| {
                    it.size = it.size.max(req.size);
                    it.lifetime = it.lifetime.max(req.lifetime);
                })
                .or_insert(req);
        }
        Self(map)
    }

    #[inline]
    pub fn get(&self, slot: Slot) -> Option<&MemoryRequirement> {
        self.0.get(&slot)
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &MemoryRequirement> {
        self.0.values()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn to_vec(&self) -> Vec<MemoryRequirement> {
        self.0.values().copied().collect()
    }

    /// 为已声明的槽创建句柄。
    pub fn handle(&self, slot: Slot, desc: TensorDesc) -> Result<AuxHandle, Status> {
        let Some(req) = self.get(slot) else {
            return Err(invariant_violation(format!("{slot} is not declared")));
        };
        if desc.size() > req.size {
            return Err(invariant_violation(format!(
                "{desc} does not fit the {} bytes declared for {slot}",
                req.size
            )));
        }
        Ok(AuxHandle {
            slot,
            desc,
            lifetime: req.lifetime,
        })
    }
}

/// 配置阶段得到的辅助张量句柄，运行时解析为实际存储。
#[derive(Clone, Debug)]
pub struct AuxHandle {
    slot: Slot,
    desc: TensorDesc,
    lifetime: Lifetime,
}

/// 解析得到的辅助张量。
pub enum AuxTensor {
    /// 来自调用者提供的工作空间。
    Pool(Tensor),
    /// 工作空间未提供，临时分配。
    Private(Tensor),
}

impl Deref for AuxTensor {
    type Target = Tensor;
    #[inline]
    fn deref(&self) -> &Tensor {
        match self {
            Self::Pool(t) | Self::Private(t) => t,
        }
    }
}

impl AuxTensor {
    #[inline]
    pub fn into_tensor(self) -> Tensor {
        match self {
            Self::Pool(t) | Self::Private(t) => t,
        }
    }

    #[inline]
    pub fn is_private(&self) -> bool {
        matches!(self, Self::Private(_))
    }
}

impl AuxHandle {
    #[inline]
    pub const fn slot(&self) -> Slot {
        self.slot
    }

    #[inline]
    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    #[inline]
    pub const fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// 张量包提供该槽时取其视图，否则私有分配。
    ///
    /// 提供的存储小于配置时的尺寸说明工作空间已过期，报告不变量错误而不截断。
    pub fn resolve(&self, pack: &TensorPack) -> Result<AuxTensor, Status> {
        match pack.get(self.slot) {
            Some(t) => self.view(t).map(AuxTensor::Pool),
            None => {
                log::warn!("{} not supplied, allocating {} privately", self.slot, self.desc);
                Ok(AuxTensor::Private(Tensor::new(self.desc.clone())))
            }
        }
    }

    /// 与 [`resolve`](Self::resolve) 相同，但私有分配的结果保存在 `cache` 中跨运行复用。
    pub fn resolve_cached(
        &self,
        pack: &TensorPack,
        cache: &mut Option<Tensor>,
    ) -> Result<Tensor, Status> {
        match pack.get(self.slot) {
            Some(t) => self.view(t),
            None => Ok(cache
                .get_or_insert_with(|| {
                    log::warn!("{} not supplied, keeping a private {}", self.slot, self.desc);
                    Tensor::new(self.desc.clone())
                })
                .clone()),
        }
    }

    fn view(&self, t: &Tensor) -> Result<Tensor, Status> {
        t.view(self.desc.clone()).map_err(|e| {
            invariant_violation(format!("stale workspace at {}: {}", self.slot, e.info))
        })
    }
}

use crate::{args_not_support, Status};
use std::{collections::HashMap, fmt::Write, sync::OnceLock};

/// 每个并行任务至少处理的工作项数。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LocalWorkSize(pub usize);

impl LocalWorkSize {
    pub const DEFAULT: Self = Self(1);

    #[inline]
    pub const fn get(self) -> usize {
        if self.0 == 0 {
            1
        } else {
            self.0
        }
    }
}

/// 核函数实例上的调优结果，只能写入一次。
#[derive(Default, Debug)]
pub struct Tuning(OnceLock<LocalWorkSize>);

impl Tuning {
    #[inline]
    pub fn get(&self) -> Option<LocalWorkSize> {
        self.0.get().copied()
    }

    /// 写入调优结果，已经调优过时返回 `false`。
    #[inline]
    pub fn set(&self, lws: LocalWorkSize) -> bool {
        self.0.set(lws).is_ok()
    }

    #[inline]
    pub fn is_tuned(&self) -> bool {
        self.0.get().is_some()
    }
}

/// 动态调优的搜索范围。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TunerMode {
    /// 2 的所有幂。
    Exhaustive,
    /// 4 的所有幂。
    Normal,
    /// 只比较单项和均分两个候选。
    Rapid,
}

impl TunerMode {
    pub fn candidates(self, items: usize, threads: usize) -> Vec<LocalWorkSize> {
        let items = items.max(1);
        let mut ans = match self {
            Self::Rapid => vec![1, items.div_ceil(threads.max(1))],
            Self::Normal | Self::Exhaustive => {
                let factor = if self == Self::Normal { 4 } else { 2 };
                let mut ans = Vec::new();
                let mut n = 1;
                while n <= items {
                    ans.push(n);
                    n *= factor;
                }
                ans
            }
        };
        ans.sort_unstable();
        ans.dedup();
        ans.into_iter().map(LocalWorkSize).collect()
    }
}

/// 核函数调优器，维护 `config_id → LocalWorkSize` 表。
#[derive(Clone, Debug)]
pub struct Tuner {
    pub mode: TunerMode,
    /// 是否对表中没有的核函数做动态调优。
    pub tune_new_kernels: bool,
    table: HashMap<String, LocalWorkSize>,
}

impl Tuner {
    pub fn new(mode: TunerMode) -> Self {
        Self {
            mode,
            tune_new_kernels: true,
            table: HashMap::new(),
        }
    }

    #[inline]
    pub fn lookup(&self, config_id: &str) -> Option<LocalWorkSize> {
        self.table.get(config_id).copied()
    }

    #[inline]
    pub fn insert(&mut self, config_id: String, lws: LocalWorkSize) {
        self.table.insert(config_id, lws);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// 导出调优表，每行 `config_id;lws`，按键排序。
    pub fn export(&self) -> String {
        let mut entries = self.table.iter().collect::<Vec<_>>();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        let mut ans = String::new();
        for (id, lws) in entries {
            let _ = writeln!(ans, "{id};{}", lws.0);
        }
        ans
    }

    /// 导入 [`export`](Self::export) 格式的调优表，覆盖已有条目。
    pub fn import(&mut self, text: &str) -> Result<usize, Status> {
        let mut count = 0;
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed = line
                .rsplit_once(';')
                .and_then(|(id, lws)| Some((id, lws.trim().parse::<usize>().ok()?)));
            let Some((id, lws)) = parsed else {
                return Err(args_not_support(format!(
                    "malformed tuning entry at line {}: {line}",
                    i + 1
                )));
            };
            self.insert(id.to_string(), LocalWorkSize(lws));
            count += 1;
        }
        Ok(count)
    }
}

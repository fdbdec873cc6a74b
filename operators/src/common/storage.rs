use super::{
    element::{FloatPtr, QuantPtr},
    invariant_violation, type_mismatch, type_not_support, Blob, DataType, Element, Status, SyncPtr,
    TensorDesc,
};
use crate::{handle::CommandQueue, scheduler::Scheduler};
use std::{
    marker::PhantomData,
    mem::size_of,
    ops::{Deref, DerefMut, Range},
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
        Arc,
    },
};

struct Storage {
    blob: Blob,
    mapped: AtomicUsize,
    used: AtomicBool,
}

/// 设备存储的共享句柄，可以是一段存储的视图。
///
/// 克隆句柄不复制数据。
#[derive(Clone)]
pub struct Buffer {
    storage: Arc<Storage>,
    offset: usize,
    len: usize,
}

impl Buffer {
    pub fn new(size: usize) -> Self {
        Self {
            storage: Arc::new(Storage {
                blob: Blob::new(size),
                mapped: AtomicUsize::new(0),
                used: AtomicBool::new(true),
            }),
            offset: 0,
            len: size,
        }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 同一存储上的子区域。
    pub fn slice(&self, range: Range<usize>) -> Option<Self> {
        if range.start > range.end || range.end > self.len {
            return None;
        }
        Some(Self {
            storage: self.storage.clone(),
            offset: self.offset + range.start,
            len: range.len(),
        })
    }

    #[inline]
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.storage.mapped.load(SeqCst) > 0
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        unsafe { self.storage.blob.as_ptr().add(self.offset) }
    }
}

/// 张量：描述加上存储句柄。
#[derive(Clone)]
pub struct Tensor {
    desc: TensorDesc,
    buffer: Buffer,
}

impl Tensor {
    /// 分配一个清零的张量。
    #[inline]
    pub fn new(desc: TensorDesc) -> Self {
        let buffer = Buffer::new(desc.size());
        Self { desc, buffer }
    }

    /// 在已有存储上解释出张量，存储不足时报错而不是截断。
    pub fn from_buffer(desc: TensorDesc, buffer: Buffer) -> Result<Self, Status> {
        if buffer.len() < desc.size() {
            return Err(invariant_violation(format!(
                "buffer of {} bytes cannot hold {desc} ({} bytes)",
                buffer.len(),
                desc.size(),
            )));
        }
        Ok(Self { desc, buffer })
    }

    /// 用主机数据初始化一个新张量。新存储尚未对设备可见，不需要同步。
    pub fn from_slice<T: Element>(desc: TensorDesc, data: &[T]) -> Result<Self, Status> {
        check_element::<T>(&desc)?;
        if data.len() != desc.element_count() {
            return Err(invariant_violation(format!(
                "{} elements provided for {desc}",
                data.len()
            )));
        }
        let ans = Self::new(desc);
        unsafe { ans.ptr::<T>().copy_from_nonoverlapping(data.as_ptr(), data.len()) };
        Ok(ans)
    }

    #[inline]
    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    #[inline]
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// 以另一个描述重新解释同一存储。
    #[inline]
    pub fn view(&self, desc: TensorDesc) -> Result<Self, Status> {
        Self::from_buffer(desc, self.buffer.clone())
    }

    /// 存储不再被需要，内存管理器可以回收它。
    #[inline]
    pub fn mark_as_unused(&self) {
        self.buffer.storage.used.store(false, SeqCst)
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.buffer.storage.used.load(SeqCst)
    }

    /// 同步队列后把张量映射到主机。映射期间张量不能参与调度。
    pub fn map<T: Element, Q: CommandQueue>(
        &self,
        scheduler: &mut Scheduler<Q>,
    ) -> Result<Mapping<T>, Status> {
        check_element::<T>(&self.desc)?;
        scheduler.sync()?;
        self.buffer.storage.mapped.fetch_add(1, SeqCst);
        Ok(Mapping {
            buffer: self.buffer.clone(),
            len: self.desc.element_count(),
            _phantom: PhantomData,
        })
    }

    /// 同步后读出全部元素。
    pub fn to_vec<T: Element, Q: CommandQueue>(
        &self,
        scheduler: &mut Scheduler<Q>,
    ) -> Result<Vec<T>, Status> {
        Ok(self.map::<T, Q>(scheduler)?.to_vec())
    }

    /// 设备侧访问，由核函数在执行时调用。
    #[inline]
    pub(crate) fn ptr<T>(&self) -> *mut T {
        self.buffer.as_ptr().cast()
    }

    /// 带类型检查的设备侧访问。
    #[inline]
    pub(crate) fn typed<T: Element>(&self) -> Result<SyncPtr<T>, Status> {
        check_element::<T>(&self.desc)?;
        Ok(SyncPtr::new(self.ptr()))
    }

    pub(crate) fn floats(&self) -> Result<FloatPtr, Status> {
        match self.desc.dt() {
            DataType::F32 => Ok(FloatPtr::F32(self.typed()?)),
            DataType::F16 => Ok(FloatPtr::F16(self.typed()?)),
            dt => Err(type_not_support(format!("{dt} is not a float type"))),
        }
    }

    pub(crate) fn quants(&self) -> Result<QuantPtr, Status> {
        match self.desc.dt() {
            DataType::QAsymm8 => Ok(QuantPtr::U8(self.typed()?)),
            DataType::QAsymm8Signed => Ok(QuantPtr::I8(self.typed()?)),
            dt => Err(type_not_support(format!("{dt} is not a quantized type"))),
        }
    }
}

fn check_element<T: Element>(desc: &TensorDesc) -> Result<(), Status> {
    if T::accepts(desc.dt()) && size_of::<T>() == desc.dt().size() {
        Ok(())
    } else {
        Err(type_mismatch(format!(
            "{desc} accessed as {}",
            std::any::type_name::<T>()
        )))
    }
}

/// 映射到主机的张量内容，释放时解除映射。
pub struct Mapping<T> {
    buffer: Buffer,
    len: usize,
    _phantom: PhantomData<T>,
}

impl<T> Deref for Mapping<T> {
    type Target = [T];
    #[inline]
    fn deref(&self) -> &[T] {
        unsafe { from_raw_parts(self.buffer.as_ptr().cast(), self.len) }
    }
}

impl<T> DerefMut for Mapping<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { from_raw_parts_mut(self.buffer.as_ptr().cast(), self.len) }
    }
}

impl<T> Drop for Mapping<T> {
    #[inline]
    fn drop(&mut self) {
        self.buffer.storage.mapped.fetch_sub(1, SeqCst);
    }
}

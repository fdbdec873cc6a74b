use super::DataType;
use half::f16;

mod private {
    pub trait Sealed {}
}

/// 可以存入张量的元素类型。
pub trait Element: private::Sealed + Copy + Default + Send + Sync + 'static {
    fn accepts(dt: DataType) -> bool;
}

/// 浮点元素，计算时提升到 `f32`。
pub trait Float: Element {
    fn to_f32(self) -> f32;
    fn from_f32(x: f32) -> Self;
}

/// 8 位量化元素。
pub trait Quantized: Element {
    const MIN: i32;
    const MAX: i32;
    fn to_i32(self) -> i32;
    /// 饱和截断到元素的表示范围。
    fn saturate(x: i32) -> Self;
}

macro_rules! element {
    ($ty:ty: $($dt:ident)|+) => {
        impl private::Sealed for $ty {}
        impl Element for $ty {
            #[inline]
            fn accepts(dt: DataType) -> bool {
                matches!(dt, $(DataType::$dt)|+)
            }
        }
    };
}

element!(f32: F32);
element!(f16: F16);
element!(u8: U8 | QAsymm8);
element!(i8: QAsymm8Signed);
element!(i32: S32);

impl Float for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
    #[inline]
    fn from_f32(x: f32) -> Self {
        x
    }
}

impl Float for f16 {
    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
    #[inline]
    fn from_f32(x: f32) -> Self {
        f16::from_f32(x)
    }
}

macro_rules! quantized {
    ($ty:ty) => {
        impl Quantized for $ty {
            const MIN: i32 = <$ty>::MIN as i32;
            const MAX: i32 = <$ty>::MAX as i32;
            #[inline]
            fn to_i32(self) -> i32 {
                self as i32
            }
            #[inline]
            fn saturate(x: i32) -> Self {
                x.clamp(<Self as Quantized>::MIN, <Self as Quantized>::MAX) as $ty
            }
        }
    };
}

quantized!(u8);
quantized!(i8);

/// 在并行任务间共享的裸指针，各任务写入互不重叠的区域。
#[derive(Clone, Copy)]
pub(crate) struct SyncPtr<T>(*mut T);

unsafe impl<T> Send for SyncPtr<T> {}
unsafe impl<T> Sync for SyncPtr<T> {}

impl<T> SyncPtr<T> {
    #[inline]
    pub fn new(ptr: *mut T) -> Self {
        Self(ptr)
    }

    #[inline]
    pub fn ptr(self) -> *mut T {
        self.0
    }

    /// # Safety
    ///
    /// `i` 在分配范围内，且没有其他任务同时写入该元素。
    #[inline]
    pub unsafe fn read(self, i: usize) -> T {
        self.0.add(i).read()
    }

    /// # Safety
    ///
    /// `i` 在分配范围内，且没有其他任务同时访问该元素。
    #[inline]
    pub unsafe fn write(self, i: usize, val: T) {
        self.0.add(i).write(val)
    }
}

/// 按运行时类型读写的浮点存储，计算统一在 `f32` 上进行。
#[derive(Clone, Copy)]
pub(crate) enum FloatPtr {
    F32(SyncPtr<f32>),
    F16(SyncPtr<f16>),
}

impl FloatPtr {
    /// # Safety
    ///
    /// 见 [`SyncPtr::read`]。
    #[inline]
    pub unsafe fn get(self, i: usize) -> f32 {
        match self {
            Self::F32(p) => p.read(i),
            Self::F16(p) => p.read(i).to_f32(),
        }
    }

    /// # Safety
    ///
    /// 见 [`SyncPtr::write`]。
    #[inline]
    pub unsafe fn set(self, i: usize, val: f32) {
        match self {
            Self::F32(p) => p.write(i, val),
            Self::F16(p) => p.write(i, f16::from_f32(val)),
        }
    }

    /// 连续读出一段元素。
    ///
    /// # Safety
    ///
    /// 见 [`SyncPtr::read`]。
    pub unsafe fn load(self, offset: usize, len: usize) -> Vec<f32> {
        (offset..offset + len).map(|i| self.get(i)).collect()
    }
}

/// 按运行时类型读写的 8 位量化存储。
#[derive(Clone, Copy)]
pub(crate) enum QuantPtr {
    U8(SyncPtr<u8>),
    I8(SyncPtr<i8>),
}

impl QuantPtr {
    /// # Safety
    ///
    /// 见 [`SyncPtr::read`]。
    #[inline]
    pub unsafe fn get(self, i: usize) -> i32 {
        match self {
            Self::U8(p) => p.read(i).to_i32(),
            Self::I8(p) => p.read(i).to_i32(),
        }
    }

    /// 写入并饱和截断。
    ///
    /// # Safety
    ///
    /// 见 [`SyncPtr::write`]。
    #[inline]
    pub unsafe fn set(self, i: usize, val: i32) {
        match self {
            Self::U8(p) => p.write(i, u8::saturate(val)),
            Self::I8(p) => p.write(i, i8::saturate(val)),
        }
    }

    #[inline]
    pub fn range(self) -> (i32, i32) {
        match self {
            Self::U8(_) => (u8::MIN as _, u8::MAX as _),
            Self::I8(_) => (i8::MIN as _, i8::MAX as _),
        }
    }
}

#[test]
fn test_element() {
    assert!(u8::accepts(DataType::QAsymm8));
    assert!(!u8::accepts(DataType::QAsymm8Signed));
    assert_eq!(<f16 as Float>::from_f32(1.5).to_f32(), 1.5);
    assert_eq!(i8::saturate(300), 127);
    assert_eq!(u8::saturate(-3), 0);
    assert_eq!(u8::saturate(256), 255);
    assert_eq!(i8::saturate(-129), -128);
    assert_eq!(i8::saturate(-5), -5);
    assert_eq!(<u8 as Quantized>::MAX, 255);
    assert_eq!(<i8 as Quantized>::MIN, -128);
}

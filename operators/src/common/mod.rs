mod activation;
mod blob;
mod diversity;
mod element;
mod error;
mod pack;
mod storage;
mod tensor;
mod window;
mod workspace;

pub use activation::Activation;
pub use blob::{Blob, ALIGN};
pub use diversity::{CacheLevel, CacheSize};
pub use element::{Element, Float, Quantized};
pub use error::{functions::*, ErrorCategory, ErrorKind, Status};
pub use pack::{Operands, Slot, TensorPack};
pub use storage::{Buffer, Mapping, Tensor};
pub use tensor::{DataLayout, DataType, QuantInfo, TensorDesc};
pub use window::{BorderSize, Dimension, Window};
pub use workspace::{AuxHandle, AuxTensor, Lifetime, MemoryRequirement, Requirements};

pub(crate) use activation::clamp_bounds;
pub(crate) use element::{FloatPtr, SyncPtr};

pub mod utils {
    use super::{rank_not_support, type_mismatch, DataType, Status, TensorDesc};

    #[inline]
    pub(crate) fn type_distinct(pairs: &[DataType]) -> Result<DataType, Status> {
        let [dt, tail @ ..] = pairs else {
            unreachable!("pairs empty");
        };
        if tail.iter().all(|it| it == dt) {
            Ok(*dt)
        } else {
            Err(type_mismatch(format!("{pairs:?} are not distinct")))
        }
    }

    #[inline]
    pub(crate) fn rank_error(arg: &str, expected: usize, actual: usize) -> Status {
        rank_not_support(format!("{arg}.ndim = {actual}, {expected} expected"))
    }

    /// 读出四维张量的 `[n, c, h, w]`。
    #[inline]
    pub(crate) fn dims4(arg: &str, desc: &TensorDesc) -> Result<[usize; 4], Status> {
        desc.nchw().ok_or_else(|| rank_error(arg, 4, desc.ndim()))
    }
}

use super::{args_not_support, invariant_violation, type_mismatch, Status, Tensor, TensorDesc};
use std::{collections::BTreeMap, fmt};

/// 张量在一次调度中的角色。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Slot {
    Src0,
    Src1,
    Src2,
    Dst,
    /// 辅助存储，编号由声明它的算子决定。
    Aux(u32),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Aux(n) => write!(f, "aux{n}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// 一次调度用到的全部张量。
#[derive(Clone, Default)]
pub struct TensorPack(BTreeMap<Slot, Tensor>);

impl TensorPack {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with(mut self, slot: Slot, tensor: &Tensor) -> Self {
        self.add(slot, tensor);
        self
    }

    #[inline]
    pub fn add(&mut self, slot: Slot, tensor: &Tensor) {
        self.0.insert(slot, tensor.clone());
    }

    #[inline]
    pub fn remove(&mut self, slot: Slot) -> Option<Tensor> {
        self.0.remove(&slot)
    }

    #[inline]
    pub fn get(&self, slot: Slot) -> Option<&Tensor> {
        self.0.get(&slot)
    }

    /// 取出必需的张量。
    #[inline]
    pub fn require(&self, slot: Slot) -> Result<&Tensor, Status> {
        self.get(slot)
            .ok_or_else(|| args_not_support(format!("{slot} missing in tensor pack")))
    }

    #[inline]
    pub fn contains(&self, slot: Slot) -> bool {
        self.0.contains_key(&slot)
    }

    #[inline]
    pub fn extend(&mut self, other: &TensorPack) {
        self.0
            .extend(other.0.iter().map(|(&k, v)| (k, v.clone())))
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
    pub fn iter(&self) -> impl Iterator<Item = (Slot, &Tensor)> {
        self.0.iter().map(|(&k, v)| (k, v))
    }
}

/// 配置时确定的操作数描述，运行时逐一与张量包核对。
#[derive(Clone, Default, Debug)]
pub struct Operands(Vec<(Slot, TensorDesc, bool)>);

impl Operands {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 必须出现在张量包中的操作数。
    #[inline]
    pub fn with(mut self, slot: Slot, desc: &TensorDesc) -> Self {
        self.0.push((slot, desc.clone(), true));
        self
    }

    /// 可以缺省的操作数，出现时仍要核对。
    #[inline]
    pub fn with_optional(mut self, slot: Slot, desc: &TensorDesc) -> Self {
        self.0.push((slot, desc.clone(), false));
        self
    }

    /// 张量包中的操作数类型、形状和布局都必须与配置一致。
    ///
    /// 形状不符时需要重新配置，既不截断也不越界。
    pub fn check(&self, pack: &TensorPack) -> Result<(), Status> {
        for (slot, desc, required) in &self.0 {
            let tensor = if *required {
                pack.require(*slot)?
            } else {
                match pack.get(*slot) {
                    Some(t) => t,
                    None => continue,
                }
            };
            let actual = tensor.desc();
            if actual.dt() != desc.dt() {
                return Err(type_mismatch(format!(
                    "{slot} is {actual}, configured as {desc}"
                )));
            }
            if !actual.is_compatible(desc) {
                return Err(invariant_violation(format!(
                    "{slot} is {actual}, configured as {desc}, reconfigure first"
                )));
            }
        }
        Ok(())
    }
}

#[test]
fn test_pack() {
    use super::{DataType, TensorDesc};

    let a = Tensor::new(TensorDesc::new(DataType::F32, &[4]));
    let b = Tensor::new(TensorDesc::new(DataType::F32, &[8]));
    let mut pack = TensorPack::new().with(Slot::Src0, &a);
    assert!(pack.contains(Slot::Src0));
    assert!(pack.require(Slot::Dst).is_err());

    let other = TensorPack::new().with(Slot::Aux(2), &b);
    pack.extend(&other);
    assert_eq!(pack.len(), 2);
    assert_eq!(pack.get(Slot::Aux(2)).unwrap().desc().shape(), &[8]);

    assert!(pack.remove(Slot::Src0).is_some());
    assert!(!pack.contains(Slot::Src0));
    assert_eq!(Slot::Aux(3).to_string(), "aux3");
}

#[test]
fn test_operands() {
    use super::{DataLayout, DataType, ErrorKind};

    let desc = |shape: &[usize]| TensorDesc::new(DataType::F32, shape);
    let operands = Operands::new()
        .with(Slot::Src0, &desc(&[2, 3]))
        .with_optional(Slot::Src1, &desc(&[3]));

    let src = Tensor::new(desc(&[2, 3]));
    assert!(operands.check(&TensorPack::new().with(Slot::Src0, &src)).is_ok());
    let err = operands.check(&TensorPack::new()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ArgsNotSupport);

    let larger = Tensor::new(desc(&[2, 6]));
    let err = operands
        .check(&TensorPack::new().with(Slot::Src0, &larger))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvariantViolation);

    let smaller = Tensor::new(desc(&[2]));
    let pack = TensorPack::new().with(Slot::Src0, &src).with(Slot::Src1, &smaller);
    assert_eq!(operands.check(&pack).unwrap_err().kind, ErrorKind::InvariantViolation);

    let half = Tensor::new(TensorDesc::new(DataType::F16, &[2, 3]));
    let err = operands
        .check(&TensorPack::new().with(Slot::Src0, &half))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeMismatch);

    let nchw = TensorDesc::from_nchw(DataType::F32, DataLayout::Nchw, [1, 2, 2, 2]);
    let nhwc = Tensor::new(TensorDesc::from_nchw(DataType::F32, DataLayout::Nhwc, [1, 2, 2, 2]));
    let operands = Operands::new().with(Slot::Dst, &nchw);
    let err = operands
        .check(&TensorPack::new().with(Slot::Dst, &nhwc))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvariantViolation);
}

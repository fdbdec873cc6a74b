use std::{error::Error, fmt};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    TypeNotSupport,
    TypeMismatch,
    RankNotSupport,
    ShapeNotSupport,
    ShapeMismatch,
    ArgsNotSupport,
    MethodNotSupport,
    InvariantViolation,
    UsageError,
    ExecutionFailed,
}

/// 错误所属的处理类别。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorCategory {
    /// 形状、类型或参数组合非法，配置阶段同步发现，不会重试。
    Configuration,
    /// 某个具体算法无法处理该配置，方法选择器将其视为路由信息。
    Unsupported,
    /// 运行期间设备提交失败，致命且不重试。
    DeviceExecution,
    /// 调用顺序错误，例如未初始化就调度。
    Usage,
    /// 运行时张量与配置阶段的假设不一致，需要重新配置。
    InvariantViolation,
}

impl ErrorKind {
    pub const fn category(self) -> ErrorCategory {
        use ErrorKind::*;
        match self {
            TypeNotSupport | TypeMismatch | RankNotSupport | ShapeNotSupport | ShapeMismatch
            | ArgsNotSupport => ErrorCategory::Configuration,
            MethodNotSupport => ErrorCategory::Unsupported,
            InvariantViolation => ErrorCategory::InvariantViolation,
            UsageError => ErrorCategory::Usage,
            ExecutionFailed => ErrorCategory::DeviceExecution,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Status {
    pub kind: ErrorKind,
    pub info: String,
}

impl Status {
    #[inline]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.info)
    }
}

impl Error for Status {}

pub(super) mod functions {
    use super::{ErrorKind::*, Status};

    macro_rules! builder {
        ($ty:ident: $name:ident $kind:expr) => {
            #[inline]
            pub fn $name(info: impl Into<String>) -> $ty {
                $ty {
                    kind: $kind,
                    info: info.into(),
                }
            }
        };
    }

    builder!(Status: type_not_support    TypeNotSupport    );
    builder!(Status: type_mismatch       TypeMismatch      );
    builder!(Status: rank_not_support    RankNotSupport    );
    builder!(Status: shape_not_support   ShapeNotSupport   );
    builder!(Status: shape_mismatch      ShapeMismatch     );
    builder!(Status: args_not_support    ArgsNotSupport    );
    builder!(Status: method_not_support  MethodNotSupport  );
    builder!(Status: invariant_violation InvariantViolation);
    builder!(Status: usage_error         UsageError        );

    builder!(Status: execution_failed    ExecutionFailed   );
}

#[test]
fn test_category() {
    use functions::*;

    assert_eq!(
        shape_mismatch("[1, 2] vs [2, 1]").category(),
        ErrorCategory::Configuration
    );
    assert_eq!(
        method_not_support("winograd").category(),
        ErrorCategory::Unsupported
    );
    assert_eq!(usage_error("").category(), ErrorCategory::Usage);
    let e = execution_failed("queue lost");
    assert_eq!(e.category(), ErrorCategory::DeviceExecution);
    assert_eq!(e.to_string(), "ExecutionFailed: queue lost");
}

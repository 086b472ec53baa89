use std::{io, time::Duration};
use tether_core::{CoreError, ErrorCategory, RetryAdvice, codes};

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: codes::TRANSPORT_ACCEPT_FAILED,
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: codes::TRANSPORT_ACCEPT_FAILED,
    message: "tcp accept",
};
pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: codes::TRANSPORT_CONNECT_FAILED,
    message: "tcp resolve",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: codes::TRANSPORT_CONNECT_FAILED,
    message: "tcp connect",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: codes::TRANSPORT_CONNECT_FAILED,
    message: "tcp configure",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: codes::ENDPOINT_READ_FAILED,
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: codes::ENDPOINT_WRITE_FAILED,
    message: "tcp write",
};

/// 地址解析失败。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("unsupported address scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("no addresses resolved for `{0}`")]
    NoAddresses(String),
}

impl From<AddressError> for CoreError {
    fn from(err: AddressError) -> Self {
        CoreError::new(codes::TRANSPORT_CONNECT_FAILED, format!("tcp resolve: {err}"))
            .with_category(ErrorCategory::NonRetryable)
            .with_cause(err)
    }
}

/// 将 IO 错误映射为 [`CoreError`]，并附带错误分类。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> CoreError {
    let category = categorize_io_error(&error);
    CoreError::new(kind.code, format!("{}: {}", kind.message, error))
        .with_category(category)
        .with_cause(error)
}

/// 构造超时错误。
pub(crate) fn timeout_error(kind: OperationKind) -> CoreError {
    CoreError::new(kind.code, format!("{} timed out", kind.message))
        .with_category(ErrorCategory::Timeout)
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock | ErrorKind::Interrupted => {
            ErrorCategory::Retryable(RetryAdvice::after(Duration::from_millis(5)))
        }
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe => ErrorCategory::Unavailable,
        ErrorKind::AddrInUse => {
            ErrorCategory::Retryable(RetryAdvice::after(Duration::from_millis(50)))
        }
        _ => ErrorCategory::NonRetryable,
    }
}

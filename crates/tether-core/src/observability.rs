use std::sync::OnceLock;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

static INSTALLED: OnceLock<String> = OnceLock::new();

/// 默认日志过滤指令；可被 `RUST_LOG` 覆盖。
pub const DEFAULT_FILTER: &str = "info";

/// 日志安装失败原因。
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("tether logging 已完成安装，禁止重复调用 install_logging")]
    AlreadyInstalled,
    #[error("全局 tracing Subscriber 已被外部设置")]
    SubscriberAlreadySet,
    #[error("设置全局 Subscriber 失败: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 安装进程级日志。
///
/// # 教案式说明
/// - **意图（Why）**：宿主进程只需调用一次即可看到子通道状态变化、握手进度与重连节奏；
///   库代码本身只发 `tracing` 事件，从不安装 Subscriber。
/// - **逻辑（How）**：`registry + EnvFilter + fmt` 组装后设为全局默认；
///   过滤指令取 `RUST_LOG`，缺省为 [`DEFAULT_FILTER`]。
/// - **契约（What）**：重复调用返回 [`LoggingError::AlreadyInstalled`]；
///   外部已设置 Subscriber 时返回 [`LoggingError::SubscriberAlreadySet`]。
pub fn install_logging() -> Result<(), LoggingError> {
    if INSTALLED.get().is_some() {
        return Err(LoggingError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(LoggingError::SubscriberAlreadySet);
    }

    let filter = build_env_filter();
    let directive = filter.to_string();
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;

    INSTALLED
        .set(directive)
        .map_err(|_| LoggingError::AlreadyInstalled)
}

/// 已安装的过滤指令。
pub fn installed_filter() -> Option<&'static str> {
    INSTALLED.get().map(String::as_str)
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

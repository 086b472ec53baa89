use crate::args::{ChannelArgs, IntegerOptions, keys};
use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::time::Instant;

pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_MULTIPLIER: f64 = 1.6;
pub const DEFAULT_JITTER: f64 = 0.2;
pub const DEFAULT_MIN_BACKOFF_MS: u64 = 20_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 120_000;

const ARG_RANGE: IntegerOptions = IntegerOptions::new(0, 100, i32::MAX as i64);

/// 重连退避参数。
///
/// 字段以毫秒计，便于直接写在 TOML 配置中。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
            min_backoff_ms: DEFAULT_MIN_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl BackoffConfig {
    /// 固定间隔：不增长、无抖动。
    pub fn fixed(interval_ms: u64) -> Self {
        Self {
            initial_backoff_ms: interval_ms,
            multiplier: 1.0,
            jitter: 0.0,
            min_backoff_ms: interval_ms,
            max_backoff_ms: interval_ms,
        }
    }

    /// 从通道参数构造。
    ///
    /// # 契约说明（What）
    /// - 参数按出现顺序依次生效，取值限定在 `[100, i32::MAX]` 毫秒，越界沿用此前的值；
    /// - `grpc.testing.fixed_reconnect_backoff_ms` 同时覆盖 initial/min/max，
    ///   并关闭增长与抖动；其后出现的 min/max/initial 参数会重新打开它们。
    pub fn from_channel_args(args: &ChannelArgs) -> Self {
        let mut config = Self::default();
        let mut fixed = false;
        for arg in args.iter() {
            match &*arg.key {
                keys::FIXED_RECONNECT_BACKOFF_MS => {
                    fixed = true;
                    let value = arg.as_int(IntegerOptions {
                        default: config.initial_backoff_ms as i64,
                        ..ARG_RANGE
                    }) as u64;
                    config.initial_backoff_ms = value;
                    config.min_backoff_ms = value;
                    config.max_backoff_ms = value;
                }
                keys::MIN_RECONNECT_BACKOFF_MS => {
                    fixed = false;
                    config.min_backoff_ms = arg.as_int(IntegerOptions {
                        default: config.min_backoff_ms as i64,
                        ..ARG_RANGE
                    }) as u64;
                }
                keys::MAX_RECONNECT_BACKOFF_MS => {
                    fixed = false;
                    config.max_backoff_ms = arg.as_int(IntegerOptions {
                        default: config.max_backoff_ms as i64,
                        ..ARG_RANGE
                    }) as u64;
                }
                keys::INITIAL_RECONNECT_BACKOFF_MS => {
                    fixed = false;
                    config.initial_backoff_ms = arg.as_int(IntegerOptions {
                        default: config.initial_backoff_ms as i64,
                        ..ARG_RANGE
                    }) as u64;
                }
                _ => {}
            }
        }
        if fixed {
            config.multiplier = 1.0;
            config.jitter = 0.0;
        }
        config
    }

    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// 指数退避状态机。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 子通道失败后的重连节奏：首次尝试立即进行，之后的间隔按倍率增长并加入抖动，
///   避免大量客户端同时重连。
///
/// ## 逻辑（How）
/// - `begin` 把当前间隔重置为 `initial` 并返回 `now + initial`；
/// - `step` 令 `current = min(current * multiplier, max)`，在
///   `[-jitter * current, +jitter * current]` 内加抖动，最终截止时间不早于 `now + min`；
/// - 抖动来源是 SplitMix64 序列，可用 [`with_seed`](Self::with_seed) 固定，测试因此可复现。
///
/// ## 契约（What）
/// - 调用方在一次决策中只取一次 `now` 并传入；
/// - 无抖动时相邻两次 `step` 的间隔满足 `next = min(max, prev * multiplier)`。
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    rng: u64,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_seed(config, entropy_seed())
    }

    pub fn with_seed(mut config: BackoffConfig, seed: u64) -> Self {
        if !config.multiplier.is_finite() || config.multiplier < 1.0 {
            config.multiplier = 1.0;
        }
        if !config.jitter.is_finite() {
            config.jitter = 0.0;
        }
        config.jitter = config.jitter.clamp(0.0, 1.0);
        let current = config.initial();
        Self {
            config,
            current,
            rng: seed,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// 当前（未加抖动的）间隔。
    pub fn current(&self) -> Duration {
        self.current
    }

    /// 开始新一轮退避，返回首次重试时刻。
    pub fn begin(&mut self, now: Instant) -> Instant {
        self.current = self.config.initial();
        now + self.current
    }

    /// 推进一步，返回下一次尝试时刻。
    pub fn step(&mut self, now: Instant) -> Instant {
        let max = self.config.max();
        let grown = self.current.as_secs_f64() * self.config.multiplier;
        self.current = if grown >= max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(grown)
        };

        let spread = self.current.as_secs_f64() * self.config.jitter;
        let offset = (self.next_unit() * 2.0 - 1.0) * spread;
        let delay = Duration::from_secs_f64((self.current.as_secs_f64() + offset).max(0.0));
        (now + delay).max(now + self.config.min())
    }

    /// 回到初始间隔；下一次 `begin` 之前调用 `step` 会从 `initial` 开始增长。
    pub fn reset(&mut self) {
        self.current = self.config.initial();
    }

    fn next_unit(&mut self) -> f64 {
        self.rng = self.rng.wrapping_add(0x9E3779B97F4A7C15);
        let mixed = mix64(self.rng);
        (mixed >> 11) as f64 / ((1u64 << 53) as f64)
    }
}

fn entropy_seed() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();
    mix64(nanos ^ COUNTER.fetch_add(1, Ordering::Relaxed).rotate_left(32))
}

#[inline]
fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D049BB133111EB);
    x ^ (x >> 31)
}

use crate::error::{CoreError, codes};
use std::{
    any::{Any, type_name},
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};
use tracing::warn;

/// 通道参数键。
///
/// 键名与既有部署保持兼容，因此保留 `grpc.` 前缀。
pub mod keys {
    /// 子通道要连接的地址（例如 `ipv4:127.0.0.1:443`）。
    pub const SUBCHANNEL_ADDRESS: &str = "grpc.subchannel_address";
    /// HTTP CONNECT 隧道的目标服务器 `host:port`；存在即启用代理握手。
    pub const HTTP_CONNECT_SERVER: &str = "grpc.http_connect_server";
    /// 附加在 CONNECT 请求上的头部，`\n` 分隔的 `key:value` 列表。
    pub const HTTP_CONNECT_HEADERS: &str = "grpc.http_connect_headers";
    pub const MIN_RECONNECT_BACKOFF_MS: &str = "grpc.min_reconnect_backoff_ms";
    pub const MAX_RECONNECT_BACKOFF_MS: &str = "grpc.max_reconnect_backoff_ms";
    pub const INITIAL_RECONNECT_BACKOFF_MS: &str = "grpc.initial_reconnect_backoff_ms";
    /// 测试用：固定重连间隔，禁用抖动与指数增长。
    pub const FIXED_RECONNECT_BACKOFF_MS: &str = "grpc.testing.fixed_reconnect_backoff_ms";
    /// 指针参数：`Arc<dyn SecurityConnector>`。
    pub const SECURITY_CONNECTOR: &str = "grpc.security_connector";
    /// 指针参数：握手成功后写入的认证上下文。
    pub const AUTH_CONTEXT: &str = "grpc.auth_context";
    /// 拨号成功后、握手开始前写给对端的原始字节。
    pub const INITIAL_CONNECT_STRING: &str = "grpc.initial_connect_string";
    /// 加密端点单帧最大长度。
    pub const MAX_FRAME_SIZE: &str = "grpc.max_frame_size";
    /// 握手整体超时；与连接截止时间取较早者。
    pub const HANDSHAKE_TIMEOUT_MS: &str = "grpc.handshake_timeout_ms";
}

/// 整数参数的取值约束。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntegerOptions {
    pub default: i64,
    pub min: i64,
    pub max: i64,
}

impl IntegerOptions {
    pub const fn new(default: i64, min: i64, max: i64) -> Self {
        Self { default, min, max }
    }
}

/// 指针参数：任意共享对象，按身份比较。
#[derive(Clone)]
pub struct PointerArg {
    identity: usize,
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl PointerArg {
    /// 包装一个值；身份为新分配的地址。
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        let value: Arc<dyn Any + Send + Sync> = Arc::new(value);
        Self {
            identity: Arc::as_ptr(&value) as *const () as usize,
            type_name: type_name::<T>(),
            value,
        }
    }

    /// 包装一个共享对象；身份取自 `value` 指向的对象，
    /// 因此同一 `Arc` 的多次包装相等。读取时使用 `Arc<T>` 作为类型参数。
    pub fn from_arc<T: ?Sized + Send + Sync + 'static>(value: Arc<T>) -> Self {
        let identity = Arc::as_ptr(&value) as *const () as usize;
        Self {
            identity,
            type_name: type_name::<Arc<T>>(),
            value: Arc::new(value),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for PointerArg {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity && self.type_name == other.type_name
    }
}

impl Eq for PointerArg {}

impl Hash for PointerArg {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
        self.type_name.hash(state);
    }
}

impl fmt::Debug for PointerArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} @ {:#x}>", self.type_name, self.identity)
    }
}

/// 参数值。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArgValue {
    Integer(i64),
    String(Arc<str>),
    Pointer(PointerArg),
}

/// 单个键值对。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelArg {
    pub key: Arc<str>,
    pub value: ArgValue,
}

impl ChannelArg {
    pub fn integer(key: &str, value: i64) -> Self {
        Self {
            key: Arc::from(key),
            value: ArgValue::Integer(value),
        }
    }

    pub fn string(key: &str, value: &str) -> Self {
        Self {
            key: Arc::from(key),
            value: ArgValue::String(Arc::from(value)),
        }
    }

    pub fn pointer(key: &str, value: PointerArg) -> Self {
        Self {
            key: Arc::from(key),
            value: ArgValue::Pointer(value),
        }
    }

    /// 按 `options` 解释为整数；类型不符或越界时记录告警并返回默认值。
    pub fn as_int(&self, options: IntegerOptions) -> i64 {
        let key = &*self.key;
        match &self.value {
            ArgValue::Integer(value) if *value < options.min => {
                warn!(key, value, min = options.min, "channel arg ignored: below minimum");
                options.default
            }
            ArgValue::Integer(value) if *value > options.max => {
                warn!(key, value, max = options.max, "channel arg ignored: above maximum");
                options.default
            }
            ArgValue::Integer(value) => *value,
            _ => {
                warn!(key, "channel arg ignored: it must be an integer");
                options.default
            }
        }
    }
}

/// 不可变的通道参数集合。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 参数在子通道、连接器与各个握手器之间层层传递，每一层都可能“复制并增删”；
///   写时复制的 `Arc<Vec<_>>` 让只读路径零拷贝。
///
/// ## 逻辑（How）
/// - 每个键至多出现一次；`with_*` 会先移除同名键再追加；
/// - 相等性与哈希按插入顺序逐项比较，指针参数按对象身份比较，
///   因此可直接作为子通道去重的键。
///
/// ## 契约（What）
/// - 所有 `with_*` / `without` 返回新集合，原集合不变；
/// - [`get_int`](Self::get_int) 对非法值记录告警并回退默认值，不返回错误。
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ChannelArgs {
    entries: Arc<Vec<ChannelArg>>,
}

impl ChannelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelArg> {
        self.entries.iter()
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.entries
            .iter()
            .find(|arg| &*arg.key == key)
            .map(|arg| &arg.value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// 读取整数参数并校验范围。
    ///
    /// 缺失时返回 `options.default`；类型不符或越界时记录告警并返回默认值。
    pub fn get_int(&self, key: &str, options: IntegerOptions) -> i64 {
        self.entries
            .iter()
            .find(|arg| &*arg.key == key)
            .map_or(options.default, |arg| arg.as_int(options))
    }

    /// 读取字符串参数；类型不符时记录告警并视为缺失。
    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            ArgValue::String(value) => Some(value.as_ref()),
            _ => {
                warn!(key, "channel arg ignored: it must be a string");
                None
            }
        }
    }

    /// 读取指针参数并按类型向下转型。
    pub fn get_pointer<T: Any>(&self, key: &str) -> Option<&T> {
        match self.get(key)? {
            ArgValue::Pointer(pointer) => pointer.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn with_int(&self, key: &str, value: i64) -> Self {
        self.with(ChannelArg::integer(key, value))
    }

    pub fn with_string(&self, key: &str, value: &str) -> Self {
        self.with(ChannelArg::string(key, value))
    }

    pub fn with_pointer(&self, key: &str, value: PointerArg) -> Self {
        self.with(ChannelArg::pointer(key, value))
    }

    /// 追加或替换一个参数。
    pub fn with(&self, arg: ChannelArg) -> Self {
        self.copy_and_add_and_remove(&[], [arg])
    }

    pub fn without(&self, key: &str) -> Self {
        self.copy_and_add_and_remove(&[key], [])
    }

    /// 复制集合，移除 `remove` 中的键，再追加 `add`（同名键以新值为准）。
    pub fn copy_and_add_and_remove(
        &self,
        remove: &[&str],
        add: impl IntoIterator<Item = ChannelArg>,
    ) -> Self {
        let add: Vec<ChannelArg> = add.into_iter().collect();
        let mut entries: Vec<ChannelArg> = self
            .entries
            .iter()
            .filter(|arg| {
                !remove.contains(&&*arg.key) && !add.iter().any(|new| new.key == arg.key)
            })
            .cloned()
            .collect();
        for arg in add {
            if let Some(slot) = entries.iter_mut().find(|existing| existing.key == arg.key) {
                *slot = arg;
            } else {
                entries.push(arg);
            }
        }
        Self {
            entries: Arc::new(entries),
        }
    }

    /// 以 `other` 覆盖本集合的同名键。
    pub fn merge(&self, other: &ChannelArgs) -> Self {
        self.copy_and_add_and_remove(&[], other.entries.iter().cloned())
    }

    /// 从 TOML 文本加载参数。
    ///
    /// # 契约说明（What）
    /// - 嵌套表按 `.` 拼接为键，例如 `[grpc] max_frame_size = 1` 得到 `grpc.max_frame_size`；
    /// - 整数与字符串原样保存，布尔映射为 `0/1`；
    /// - 浮点、数组与日期时间返回 [`codes::ARGS_INVALID`]。
    pub fn from_toml_str(text: &str) -> Result<Self, CoreError> {
        let table: toml::Table = toml::from_str(text).map_err(|err| {
            CoreError::new(codes::ARGS_INVALID, "channel args are not valid TOML").with_cause(err)
        })?;
        let mut entries = Vec::new();
        flatten_toml("", &table, &mut entries)?;
        Ok(ChannelArgs::new().copy_and_add_and_remove(&[], entries))
    }
}

fn flatten_toml(
    prefix: &str,
    table: &toml::Table,
    out: &mut Vec<ChannelArg>,
) -> Result<(), CoreError> {
    for (name, value) in table {
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            toml::Value::Integer(v) => out.push(ChannelArg::integer(&key, *v)),
            toml::Value::String(v) => out.push(ChannelArg::string(&key, v)),
            toml::Value::Boolean(v) => out.push(ChannelArg::integer(&key, i64::from(*v))),
            toml::Value::Table(nested) => flatten_toml(&key, nested, out)?,
            other => {
                return Err(CoreError::new(
                    codes::ARGS_INVALID,
                    format!("channel arg `{key}` has unsupported type {}", other.type_str()),
                ));
            }
        }
    }
    Ok(())
}

impl fmt::Debug for ChannelArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for arg in self.entries.iter() {
            match &arg.value {
                ArgValue::Integer(v) => map.entry(&arg.key, v),
                ArgValue::String(v) => map.entry(&arg.key, v),
                ArgValue::Pointer(v) => map.entry(&arg.key, v),
            };
        }
        map.finish()
    }
}

impl FromIterator<ChannelArg> for ChannelArgs {
    fn from_iter<I: IntoIterator<Item = ChannelArg>>(iter: I) -> Self {
        ChannelArgs::new().copy_and_add_and_remove(&[], iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use tracing_test::traced_test;

    fn hash_of(args: &ChannelArgs) -> u64 {
        let mut hasher = DefaultHasher::new();
        args.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn with_replaces_existing_key() {
        let args = ChannelArgs::new()
            .with_int(keys::MAX_FRAME_SIZE, 1)
            .with_int(keys::MAX_FRAME_SIZE, 2);
        assert_eq!(args.len(), 1);
        assert_eq!(
            args.get_int(keys::MAX_FRAME_SIZE, IntegerOptions::new(0, 0, 10)),
            2
        );
    }

    #[traced_test]
    #[test]
    fn get_int_rejects_out_of_range_and_wrong_type() {
        let options = IntegerOptions::new(7, 100, 1000);
        let low = ChannelArgs::new().with_int("k", 5);
        assert_eq!(low.get_int("k", options), 7);

        let high = ChannelArgs::new().with_int("k", 5000);
        assert_eq!(high.get_int("k", options), 7);

        let wrong = ChannelArgs::new().with_string("k", "x");
        assert_eq!(wrong.get_int("k", options), 7);
        assert!(logs_contain("it must be an integer"));
    }

    #[test]
    fn original_is_untouched_by_copy() {
        let base = ChannelArgs::new().with_string(keys::SUBCHANNEL_ADDRESS, "ipv4:1.2.3.4:5");
        let stripped = base.without(keys::SUBCHANNEL_ADDRESS);
        assert!(base.contains(keys::SUBCHANNEL_ADDRESS));
        assert!(stripped.is_empty());
    }

    #[test]
    fn pointer_args_compare_by_identity() {
        let shared: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        let a = ChannelArgs::new().with_pointer("p", PointerArg::from_arc(shared.clone()));
        let b = ChannelArgs::new().with_pointer("p", PointerArg::from_arc(shared.clone()));
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let other: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        let c = ChannelArgs::new().with_pointer("p", PointerArg::from_arc(other));
        assert_ne!(a, c);

        let fetched = a
            .get_pointer::<Arc<dyn Fn() + Send + Sync>>("p")
            .expect("类型匹配时应能取回指针");
        assert!(Arc::ptr_eq(fetched, &shared));
    }

    #[test]
    fn toml_tables_flatten_into_dotted_keys() {
        let args = ChannelArgs::from_toml_str(
            r#"
            [grpc]
            min_reconnect_backoff_ms = 250
            http_connect_server = "backend:443"

            [grpc.testing]
            fixed_reconnect_backoff_ms = 10
            "#,
        )
        .expect("合法 TOML");
        let any = IntegerOptions::new(0, i64::MIN, i64::MAX);
        assert_eq!(args.get_int(keys::MIN_RECONNECT_BACKOFF_MS, any), 250);
        assert_eq!(args.get_int(keys::FIXED_RECONNECT_BACKOFF_MS, any), 10);
        assert_eq!(args.get_string(keys::HTTP_CONNECT_SERVER), Some("backend:443"));
    }

    #[test]
    fn toml_rejects_floats() {
        let err = ChannelArgs::from_toml_str("ratio = 1.5").expect_err("浮点不受支持");
        assert_eq!(err.code(), codes::ARGS_INVALID);
    }
}

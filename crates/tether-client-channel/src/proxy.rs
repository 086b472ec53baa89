use tether_core::{ChannelArgs, CoreError, codes, keys};
use tracing::{debug, warn};

/// 代理映射钩子：子通道创建时决定是否改道。
///
/// 返回 `Some((address, args))` 时，子通道拨号 `address` 并使用改写后的参数。
pub trait ProxyMapper: Send + Sync + 'static {
    fn map_address(&self, address: &str, args: &ChannelArgs) -> Option<(String, ChannelArgs)>;
}

/// 依次读取的代理环境变量。
pub const PROXY_ENV_VARS: [&str; 3] = ["grpc_proxy", "https_proxy", "http_proxy"];
/// 依次读取的排除列表环境变量。
pub const NO_PROXY_ENV_VARS: [&str; 2] = ["no_grpc_proxy", "no_proxy"];

/// 经 HTTP CONNECT 代理改道的映射器。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 部署在出口代理之后的客户端只能连到代理；真正的目标放进
///   `grpc.http_connect_server`，由 [`tether_handshake::HttpConnectHandshaker`] 在握手时发出 CONNECT。
///
/// ## 逻辑（How）
/// - 代理地址接受 `http://host:port[/]` 或裸 `host:port`，其他 scheme 视为配置错误；
/// - 排除列表为逗号分隔的主机名，`*` 匹配全部，`example.com` 同时匹配其子域名。
///
/// ## 契约（What）
/// - 目标已经带有 `grpc.http_connect_server` 时不再改道，避免双重隧道。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpProxyMapper {
    proxy: String,
    no_proxy: Vec<String>,
}

impl HttpProxyMapper {
    pub fn new(proxy_uri: &str, no_proxy: Option<&str>) -> Result<Self, CoreError> {
        let proxy = parse_proxy_authority(proxy_uri)?;
        let no_proxy = no_proxy
            .map(|list| {
                list.split(',')
                    .map(|host| host.trim().trim_start_matches('.').to_ascii_lowercase())
                    .filter(|host| !host.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self { proxy, no_proxy })
    }

    /// 从进程环境读取代理设置；未设置或格式错误时返回 `None`。
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// 同 [`from_env`](Self::from_env)，但变量经由 `lookup` 读取。
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let (name, uri) = PROXY_ENV_VARS.iter().find_map(|name| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .map(|value| (*name, value))
        })?;
        let no_proxy = NO_PROXY_ENV_VARS
            .iter()
            .find_map(|name| lookup(name).filter(|value| !value.trim().is_empty()));
        match Self::new(&uri, no_proxy.as_deref()) {
            Ok(mapper) => {
                debug!(variable = name, proxy = %mapper.proxy, "using http proxy");
                Some(mapper)
            }
            Err(err) => {
                warn!(variable = name, value = %uri, error = %err, "ignoring proxy setting");
                None
            }
        }
    }

    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    fn excluded(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.no_proxy.iter().any(|entry| {
            entry == "*"
                || host == *entry
                || host
                    .strip_suffix(entry.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

impl ProxyMapper for HttpProxyMapper {
    fn map_address(&self, address: &str, args: &ChannelArgs) -> Option<(String, ChannelArgs)> {
        if args.contains(keys::HTTP_CONNECT_SERVER) {
            return None;
        }
        let target = address
            .strip_prefix("ipv4:")
            .or_else(|| address.strip_prefix("ipv6:"))
            .unwrap_or(address);
        if self.excluded(host_of(target)) {
            debug!(%target, "target excluded from proxying");
            return None;
        }
        debug!(%target, proxy = %self.proxy, "routing subchannel through http proxy");
        Some((
            self.proxy.clone(),
            args.with_string(keys::HTTP_CONNECT_SERVER, target),
        ))
    }
}

fn parse_proxy_authority(uri: &str) -> Result<String, CoreError> {
    let uri = uri.trim();
    let rest = match uri.split_once("://") {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") => rest,
        Some((scheme, _)) => {
            return Err(CoreError::new(
                codes::ARGS_INVALID,
                format!("'{scheme}' scheme not supported in proxy URI"),
            ));
        }
        None => uri,
    };
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.contains('@') {
        return Err(CoreError::new(
            codes::ARGS_INVALID,
            "userinfo not supported in proxy URI",
        ));
    }
    if authority.is_empty() {
        return Err(CoreError::new(codes::ARGS_INVALID, "proxy URI has no authority"));
    }
    Ok(authority.to_owned())
}

/// `host:port`、`[v6]:port` 或裸主机名中的主机部分。
fn host_of(target: &str) -> &str {
    if let Some(rest) = target.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match target.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => target,
    }
}

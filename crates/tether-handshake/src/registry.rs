use crate::{
    handshaker::HandshakerRole, http_connect::HttpConnectHandshakerFactory,
    manager::HandshakeManager, security::SecurityHandshakerFactory,
};
use std::{fmt, sync::Arc};
use tether_core::ChannelArgs;
use tracing::debug;

/// 握手器工厂：按通道参数决定是否向管理器追加握手器。
pub trait HandshakerFactory: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn add_handshakers(&self, args: &ChannelArgs, manager: &HandshakeManager);
}

/// 按角色分组的工厂表。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 连接器不应硬编码“先代理、后安全”；各握手器在进程启动时自行登记，
///   连接器只按角色遍历工厂表。
///
/// ## 逻辑（How）
/// - 每个角色一条有序列表；`at_start` 为真时插到队首，否则追加到队尾；
/// - 登记需要 `&mut self`，注册表一旦放进 `Arc` 共享就只读。
///
/// ## 契约（What）
/// - 同一角色内，工厂的调用顺序即握手器执行顺序；
/// - 工厂之间不互相感知。
#[derive(Default)]
pub struct HandshakerRegistry {
    client: Vec<Arc<dyn HandshakerFactory>>,
    server: Vec<Arc<dyn HandshakerFactory>>,
}

impl HandshakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置工厂：客户端先 HTTP CONNECT、后安全握手；服务端只有安全握手。
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            false,
            HandshakerRole::Client,
            Arc::new(SecurityHandshakerFactory::new(HandshakerRole::Client)),
        );
        registry.register(true, HandshakerRole::Client, Arc::new(HttpConnectHandshakerFactory));
        registry.register(
            false,
            HandshakerRole::Server,
            Arc::new(SecurityHandshakerFactory::new(HandshakerRole::Server)),
        );
        registry
    }

    pub fn register(
        &mut self,
        at_start: bool,
        role: HandshakerRole,
        factory: Arc<dyn HandshakerFactory>,
    ) {
        debug!(factory = factory.name(), ?role, at_start, "handshaker factory registered");
        let list = self.list_mut(role);
        if at_start {
            list.insert(0, factory);
        } else {
            list.push(factory);
        }
    }

    /// 依序调用该角色的全部工厂。
    pub fn add_handshakers(&self, role: HandshakerRole, args: &ChannelArgs, manager: &HandshakeManager) {
        for factory in self.factories(role) {
            factory.add_handshakers(args, manager);
        }
    }

    pub fn factories(&self, role: HandshakerRole) -> &[Arc<dyn HandshakerFactory>] {
        match role {
            HandshakerRole::Client => &self.client,
            HandshakerRole::Server => &self.server,
        }
    }

    fn list_mut(&mut self, role: HandshakerRole) -> &mut Vec<Arc<dyn HandshakerFactory>> {
        match role {
            HandshakerRole::Client => &mut self.client,
            HandshakerRole::Server => &mut self.server,
        }
    }
}

impl fmt::Debug for HandshakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |list: &[Arc<dyn HandshakerFactory>]| list.iter().map(|f| f.name()).collect::<Vec<_>>();
        f.debug_struct("HandshakerRegistry")
            .field("client", &names(&self.client))
            .field("server", &names(&self.server))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshaker::FailHandshaker;

    struct Named(&'static str);

    impl HandshakerFactory for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn add_handshakers(&self, _args: &ChannelArgs, manager: &HandshakeManager) {
            manager.add(FailHandshaker::new());
        }
    }

    #[test]
    fn at_start_prepends_and_roles_are_independent() {
        let mut registry = HandshakerRegistry::new();
        registry.register(false, HandshakerRole::Client, Arc::new(Named("tail")));
        registry.register(true, HandshakerRole::Client, Arc::new(Named("head")));
        registry.register(false, HandshakerRole::Server, Arc::new(Named("server")));

        let client: Vec<_> = registry
            .factories(HandshakerRole::Client)
            .iter()
            .map(|f| f.name())
            .collect();
        assert_eq!(client, vec!["head", "tail"]);
        assert_eq!(registry.factories(HandshakerRole::Server).len(), 1);

        let manager = HandshakeManager::new();
        registry.add_handshakers(HandshakerRole::Client, &ChannelArgs::new(), &manager);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn defaults_put_proxy_before_security() {
        let registry = HandshakerRegistry::with_defaults();
        let client: Vec<_> = registry
            .factories(HandshakerRole::Client)
            .iter()
            .map(|f| f.name())
            .collect();
        assert_eq!(client, vec!["http_connect", "security"]);
    }
}

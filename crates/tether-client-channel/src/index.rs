use crate::{
    connector::ConnectorFactory,
    proxy::ProxyMapper,
    subchannel::{Subchannel, WeakSubchannel},
};
use dashmap::{DashMap, mapref::entry::Entry};
use std::sync::{Arc, Weak};
use tether_core::ChannelArgs;
use tracing::trace;

type IndexMap = DashMap<SubchannelKey, WeakSubchannel>;

/// 去重键：连接器工厂身份、目标地址与通道参数。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubchannelKey {
    factory: usize,
    address: String,
    args: ChannelArgs,
}

impl SubchannelKey {
    pub fn new(factory: &Arc<dyn ConnectorFactory>, address: &str, args: &ChannelArgs) -> Self {
        Self {
            factory: Arc::as_ptr(factory) as *const () as usize,
            address: address.to_owned(),
            args: args.clone(),
        }
    }
}

/// 子通道登记在索引中的位置，断开时据此注销。
pub(crate) struct Registration {
    map: Weak<IndexMap>,
    key: SubchannelKey,
}

impl Registration {
    pub(crate) fn unregister(&self, subchannel: &WeakSubchannel) {
        let Some(map) = self.map.upgrade() else {
            return;
        };
        let removed = map
            .remove_if(&self.key, |_, registered| registered.ptr_eq(subchannel))
            .is_some();
        trace!(address = %self.key.address, removed, "subchannel unregistered");
    }
}

/// 子通道去重索引。
///
/// # 教案式注释
/// - **意图 (Why)**：同一连接器工厂、同一地址、同一参数的多次创建请求共享一个子通道，
///   避免对同一后端重复建连；
/// - **逻辑 (How)**：只有真正新建子通道时才向工厂要一个连接器，子通道独占它；
/// - **契约 (What)**：索引只保存 [`WeakSubchannel`]，不延长子通道寿命；
///   子通道断开时自行注销，且只移除登记的正是自己的那一项；
/// - **风险 (Trade-offs)**：`get_or_create` 在持有分片写锁时构造子通道，构造过程不得回调索引。
#[derive(Clone, Debug, Default)]
pub struct SubchannelIndex {
    inner: Arc<IndexMap>,
}

impl SubchannelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回已存在且存活的子通道，否则创建并登记一个新的。
    pub fn get_or_create(
        &self,
        factory: &Arc<dyn ConnectorFactory>,
        address: &str,
        args: &ChannelArgs,
    ) -> Subchannel {
        self.get_or_create_with_proxy_mapper(factory, address, args, None)
    }

    /// 同 [`get_or_create`](Self::get_or_create)；键取映射前的地址与参数。
    pub fn get_or_create_with_proxy_mapper(
        &self,
        factory: &Arc<dyn ConnectorFactory>,
        address: &str,
        args: &ChannelArgs,
        mapper: Option<&dyn ProxyMapper>,
    ) -> Subchannel {
        let key = SubchannelKey::new(factory, address, args);
        let create = || {
            let subchannel = Subchannel::create_with_proxy_mapper(
                factory.create_connector(),
                address,
                args,
                mapper,
            );
            subchannel.set_registration(Registration {
                map: Arc::downgrade(&self.inner),
                key: key.clone(),
            });
            subchannel
        };
        match self.inner.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(existing) = occupied.get().upgrade() {
                    trace!(%address, "reusing subchannel from index");
                    return existing;
                }
                let subchannel = create();
                occupied.insert(subchannel.downgrade());
                subchannel
            }
            Entry::Vacant(vacant) => {
                let subchannel = create();
                vacant.insert(subchannel.downgrade());
                subchannel
            }
        }
    }

    /// 当前登记的条目数（含尚未注销的已断开子通道）。
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

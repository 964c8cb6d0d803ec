//! 请求/应答关联表
//!
//! 每个待决请求 = `(node_id, tag, oneshot::Sender)`。发起方注册后带超时等待
//! 接收端；分发任务收到应答时按节点和标签找到条目并完成它。
//! 已完成的条目立即移除；发起方超时离开后留下的条目（接收端已关闭）
//! 在下一次访问时惰性清理。

use parking_lot::Mutex;
use std::fmt::Debug;
use tokio::sync::oneshot;
use tracing::trace;

struct Pending<T, V> {
    node_id: u8,
    tag: T,
    tx: oneshot::Sender<V>,
}

/// 关联表
pub struct Registry<T, V> {
    name: &'static str,
    entries: Mutex<Vec<Pending<T, V>>>,
}

impl<T, V> Registry<T, V>
where
    T: Debug + Clone,
    V: Clone,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// 注册一个待决请求
    pub fn register(&self, node_id: u8, tag: T) -> oneshot::Receiver<V> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock();
        entries.retain(|p| !p.tx.is_closed());
        trace!("{}: register node {} {:?}", self.name, node_id, tag);
        entries.push(Pending { node_id, tag, tx });
        rx
    }

    /// 以 `value` 完成该节点上所有满足 `matches` 的存活条目，返回完成数
    pub fn resolve(&self, node_id: u8, matches: impl Fn(&T) -> bool, value: V) -> usize {
        let mut entries = self.entries.lock();
        let mut delivered = 0;
        let mut i = 0;
        while i < entries.len() {
            let entry = &entries[i];
            if entry.tx.is_closed() {
                entries.swap_remove(i);
                continue;
            }
            if entry.node_id == node_id && matches(&entry.tag) {
                let Pending { tag, tx, .. } = entries.swap_remove(i);
                if tx.send(value.clone()).is_ok() {
                    trace!("{}: resolved node {} {:?}", self.name, node_id, tag);
                    delivered += 1;
                }
                continue;
            }
            i += 1;
        }
        delivered
    }

    /// 该节点上仍存活的条目数
    pub fn pending(&self, node_id: u8) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|p| !p.tx.is_closed());
        entries.iter().filter(|p| p.node_id == node_id).count()
    }

    /// 丢弃该节点的全部条目（节点重启）
    pub fn drop_node(&self, node_id: u8) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|p| p.node_id != node_id);
        before - entries.len()
    }
}

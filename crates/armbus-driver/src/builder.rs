//! Builder 模式实现
//!
//! 提供链式构造 `Driver` 实例的便捷方式。

use crate::driver::Driver;
use crate::error::DriverError;
use crate::transport::TransportConfig;
use armbus_can::SplittableAdapter;
use std::time::Duration;

/// 驱动配置
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub transport: TransportConfig,
    /// 二进制解释器命令的最大尝试次数（至少 1）
    pub max_attempts: u32,
    /// 组地址（节点 10）覆盖的成员节点
    pub group_members: Vec<u8>,
    /// OS 命令状态轮询间隔
    pub os_poll_interval: Duration,
    /// 故障广播通道容量
    pub fault_channel_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            max_attempts: 1,
            group_members: Vec::new(),
            os_poll_interval: Duration::from_millis(10),
            fault_channel_capacity: 64,
        }
    }
}

/// Driver Builder（链式构造）
///
/// # Example
///
/// ```no_run
/// # async fn demo() -> Result<(), armbus_driver::DriverError> {
/// use armbus_can::SocketCanAdapter;
/// use armbus_driver::DriverBuilder;
/// use std::time::Duration;
///
/// let adapter = SocketCanAdapter::new("can0")?;
/// let driver = DriverBuilder::new()
///     .response_timeout(Duration::from_millis(500))
///     .group_members([1, 2, 3, 4])
///     .build(adapter)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct DriverBuilder {
    config: DriverConfig,
}

impl DriverBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 整体替换配置
    pub fn config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.send_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.response_timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts.max(1);
        self
    }

    pub fn group_members(mut self, members: impl IntoIterator<Item = u8>) -> Self {
        self.config.group_members = members.into_iter().collect();
        self
    }

    pub fn os_poll_interval(mut self, interval: Duration) -> Self {
        self.config.os_poll_interval = interval;
        self
    }

    /// 拆分适配器并启动传输任务
    ///
    /// 必须在 tokio 运行时内调用。
    pub fn build<A>(self, adapter: A) -> Result<Driver, DriverError>
    where
        A: SplittableAdapter,
        A::RxAdapter: Send + 'static,
        A::TxAdapter: Send + 'static,
    {
        Driver::start(adapter, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let builder = DriverBuilder::new()
            .max_attempts(0)
            .group_members([1, 2, 3])
            .response_timeout(Duration::from_millis(250));
        assert_eq!(builder.config.max_attempts, 1);
        assert_eq!(builder.config.group_members, vec![1, 2, 3]);
        assert_eq!(
            builder.config.transport.response_timeout,
            Duration::from_millis(250)
        );
    }
}

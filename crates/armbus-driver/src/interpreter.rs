//! 驱动器二进制解释器与 OS 解释器
//!
//! 二进制解释器：RPDO2 请求 / TPDO2 应答，按 `(寄存器, 索引)` 关联。
//! 组地址（节点 10）一帧发给整个轴组，为每个成员各注册一个条目，
//! 全部成员应答后才返回。
//!
//! OS 解释器：`0x1024:0` 设为立即求值 → 分段下载命令文本到 `0x1023:1`
//! → 轮询 `0x1023:2` 状态 → 按需上传 `0x1023:3` 应答。

use crate::driver::{Driver, Shared};
use crate::error::DriverError;
use crate::transport::FramePriority;
use armbus_can::ArmFrame;
use armbus_protocol::{
    BinaryValue, CommandKind, GROUP_NODE_ID, InterpreterFrame, OBJ_OS_COMMAND, OBJ_OS_MODE,
    OS_MODE_EVALUATE_IMMEDIATELY, OS_SUB_COMMAND, OS_SUB_REPLY, OS_SUB_STATUS, OsReply, OsStatus,
    ProtocolError, Register,
};
use smallvec::SmallVec;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 二进制解释器关联标签
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterTag {
    pub register: Register,
    pub index: u16,
}

/// 查询应答：每个应答节点一个值
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryReply {
    pub values: SmallVec<[(u8, BinaryValue); 4]>,
}

impl QueryReply {
    /// 第一个（单节点时唯一的）值
    pub fn value(&self) -> Option<BinaryValue> {
        self.values.first().map(|(_, v)| *v)
    }

    pub fn for_node(&self, node: u8) -> Option<BinaryValue> {
        self.values.iter().find(|(n, _)| *n == node).map(|(_, v)| *v)
    }
}

impl fmt::Display for QueryReply {
    /// 逗号连接各成员的值
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (_, value)) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", value)?;
        }
        Ok(())
    }
}

impl Shared {
    pub(crate) fn handle_interpreter_response(&self, frame: ArmFrame) {
        let node = frame.node_id();
        let reply = match InterpreterFrame::decode(frame.data_slice()) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Undecodable interpreter reply from node {}: {}", node, e);
                return;
            },
        };
        let delivered = self.interpreter.resolve(
            node,
            |tag| tag.register == reply.register && tag.index == reply.index,
            reply,
        );
        if delivered == 0 {
            debug!(
                "Unsolicited interpreter reply from node {}: {}[{}]",
                node, reply.register, reply.index
            );
        }
    }

    fn members_of(&self, node: u8) -> Result<SmallVec<[u8; 4]>, DriverError> {
        if node != GROUP_NODE_ID {
            return Ok(SmallVec::from_slice(&[node]));
        }
        if self.config.group_members.is_empty() {
            return Err(DriverError::NotReady(
                "group address used without configured group members".to_string(),
            ));
        }
        Ok(SmallVec::from_slice(&self.config.group_members))
    }
}

impl Driver {
    /// 单次尝试：发送并收齐所有成员的应答
    async fn interpreter_once(
        &self,
        node: u8,
        request: InterpreterFrame,
        kind: CommandKind,
        timeout: Duration,
    ) -> Result<QueryReply, DriverError> {
        let members = self.shared.members_of(node)?;
        let tag = InterpreterTag {
            register: request.register,
            index: request.index,
        };
        let receivers: SmallVec<[_; 4]> = members
            .iter()
            .map(|m| (*m, self.shared.interpreter.register(*m, tag)))
            .collect();

        self.shared
            .enqueue(request.to_frame(node)?, FramePriority::Low)
            .await?;

        let deadline = Instant::now() + timeout;
        let mut reply = QueryReply::default();
        for (member, rx) in receivers {
            let response = match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(response)) => response,
                Ok(Err(_)) => return Err(DriverError::NodeRestarted(member)),
                Err(_) => {
                    debug!(
                        "No reply to {}[{}] from node {}",
                        request.register, request.index, member
                    );
                    return Err(DriverError::Timeout);
                },
            };

            match kind {
                CommandKind::Query => {
                    let value = response.value.ok_or_else(|| {
                        ProtocolError::ParseError(format!(
                            "{}[{}] reply from node {} has no value",
                            request.register, request.index, member
                        ))
                    })?;
                    reply.values.push((member, value));
                },
                CommandKind::Set => {
                    let expected = request.value.unwrap_or(BinaryValue::Int(0));
                    let echo = response.value.unwrap_or(BinaryValue::Int(0));
                    if !expected.echo_matches(echo) {
                        return Err(DriverError::CommandMismatch {
                            command: format!("{}[{}]@{}", request.register, request.index, member),
                            expected: expected.to_string(),
                            actual: echo.to_string(),
                        });
                    }
                    reply.values.push((member, echo));
                },
                CommandKind::Execute => {
                    if let Some(value) = response.value {
                        reply.values.push((member, value));
                    }
                },
            }
        }
        Ok(reply)
    }

    /// 按 `max_attempts` 重试，耗尽后附带命令/索引/节点上下文
    async fn interpreter_command(
        &self,
        node: u8,
        request: InterpreterFrame,
        kind: CommandKind,
        timeout: Duration,
    ) -> Result<QueryReply, DriverError> {
        let attempts = self.shared.config.max_attempts.max(1);
        let mut last_error = DriverError::Timeout;
        for attempt in 1..=attempts {
            match self.interpreter_once(node, request, kind, timeout).await {
                Ok(reply) => {
                    debug!(
                        "{}[{}] on node {}: {:?} -> {}",
                        request.register, request.index, node, kind, reply
                    );
                    return Ok(reply);
                },
                Err(e @ DriverError::NotReady(_)) => return Err(e),
                Err(e) => {
                    warn!(
                        "{}[{}] on node {} failed (attempt {}/{}): {}",
                        request.register, request.index, node, attempt, attempts, e
                    );
                    last_error = e;
                },
            }
        }
        Err(DriverError::Command {
            command: request.register.to_string(),
            index: request.index,
            node,
            source: Box::new(last_error),
        })
    }

    /// 读寄存器；组地址返回每个成员的值
    pub async fn query(
        &self,
        node: u8,
        register: Register,
        index: u16,
    ) -> Result<QueryReply, DriverError> {
        let timeout = self.shared.config.transport.response_timeout;
        let request = InterpreterFrame::query(register, index);
        self.interpreter_command(node, request, CommandKind::Query, timeout)
            .await
    }

    /// 读单节点寄存器值
    pub async fn query_value(
        &self,
        node: u8,
        register: Register,
        index: u16,
    ) -> Result<BinaryValue, DriverError> {
        let reply = self.query(node, register, index).await?;
        reply.value().ok_or_else(|| {
            DriverError::Protocol(ProtocolError::ParseError(format!(
                "empty reply to {}[{}] from node {}",
                register, index, node
            )))
        })
    }

    /// 写寄存器并校验回显（浮点 1% 容差）
    pub async fn set(
        &self,
        node: u8,
        register: Register,
        index: u16,
        value: impl Into<BinaryValue>,
    ) -> Result<(), DriverError> {
        let timeout = self.shared.config.transport.response_timeout;
        let request = InterpreterFrame::set(register, index, value.into());
        self.interpreter_command(node, request, CommandKind::Set, timeout)
            .await
            .map(|_| ())
    }

    /// 执行命令（BG、ST、SV 等），等待确认
    pub async fn execute(&self, node: u8, register: Register) -> Result<(), DriverError> {
        let timeout = self.shared.config.transport.response_timeout;
        self.execute_with_timeout(node, register, timeout).await
    }

    pub async fn execute_with_timeout(
        &self,
        node: u8,
        register: Register,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let request = InterpreterFrame::execute(register, 0);
        self.interpreter_command(node, request, CommandKind::Execute, timeout)
            .await
            .map(|_| ())
    }

    /// 通过 OS 解释器执行文本命令
    ///
    /// `want_reply` 为真且设备给出应答时返回解码后的 `OsReply`。
    pub async fn os_command(
        &self,
        node: u8,
        command: &str,
        want_reply: bool,
        timeout: Duration,
    ) -> Result<Option<OsReply>, DriverError> {
        debug!("OS command on node {}: {:?}", node, command);
        self.sdo_download_u8(node, OBJ_OS_MODE, 0, OS_MODE_EVALUATE_IMMEDIATELY)
            .await?;
        self.sdo_download_segmented(node, OBJ_OS_COMMAND, OS_SUB_COMMAND, command.as_bytes())
            .await?;

        let deadline = Instant::now() + timeout;
        let status = loop {
            let raw = self.sdo_upload_u8(node, OBJ_OS_COMMAND, OS_SUB_STATUS).await?;
            let status = OsStatus::decode(raw)?;
            if status.is_done() {
                break status;
            }
            if Instant::now() >= deadline {
                warn!("OS command {:?} on node {} still executing", command, node);
                return Err(DriverError::Timeout);
            }
            tokio::time::sleep(self.shared.config.os_poll_interval).await;
        };

        let has_reply = matches!(status, OsStatus::CompletedWithReply | OsStatus::ErrorWithReply);
        let reply = if has_reply && (want_reply || status.is_error()) {
            let data = self.sdo_upload(node, OBJ_OS_COMMAND, OS_SUB_REPLY).await?;
            Some(OsReply::parse(data.bytes())?)
        } else {
            None
        };

        if status.is_error() {
            let message = match reply {
                Some(OsReply::Text(text)) => text,
                Some(OsReply::Number(n)) => n.to_string(),
                None => "no error text".to_string(),
            };
            return Err(DriverError::OsCommand {
                node,
                command: command.to_string(),
                message,
            });
        }
        Ok(if want_reply { reply } else { None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DriverBuilder;
    use armbus_can::MockCanBus;

    /// 模拟固件：查询回 100+node，写入原样回显
    fn echo_firmware(bus: &MockCanBus, members: &'static [u8]) {
        bus.set_responder(move |frame| {
            if frame.function_code() != 6 {
                return vec![];
            }
            let Ok(request) = InterpreterFrame::decode(frame.data_slice()) else {
                return vec![];
            };
            let targets: Vec<u8> = if frame.node_id() == GROUP_NODE_ID {
                members.to_vec()
            } else {
                vec![frame.node_id()]
            };
            targets
                .into_iter()
                .map(|node| {
                    let value = if request.query {
                        BinaryValue::Int(100 + node as i32)
                    } else {
                        request.value.unwrap_or(BinaryValue::Int(0))
                    };
                    let reply = InterpreterFrame {
                        value: Some(value),
                        ..request
                    };
                    let bytes = reply.encode().unwrap();
                    ArmFrame::new(0x280 + node as u32, &bytes)
                })
                .collect()
        });
    }

    #[test]
    fn test_query_reply_display() {
        let mut reply = QueryReply::default();
        reply.values.push((1, BinaryValue::Int(5)));
        reply.values.push((2, BinaryValue::Float(1.5)));
        assert_eq!(reply.to_string(), "5,1.5");
        assert_eq!(reply.for_node(2), Some(BinaryValue::Float(1.5)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_node_query_and_set() {
        let bus = MockCanBus::new();
        echo_firmware(&bus, &[]);
        let driver = DriverBuilder::new().build(bus.clone()).unwrap();

        let value = driver.query_value(3, Register::Px, 0).await.unwrap();
        assert_eq!(value, BinaryValue::Int(103));
        assert_eq!(bus.sent_frames()[0].data_slice(), &[b'P', b'X', 0, 0x40, 0, 0, 0, 0]);

        driver.set(3, Register::Sp, 0, 5000).await.unwrap();
        let sent = bus.sent_frames();
        assert_eq!(sent[1].id, 0x303);
        assert_eq!(sent[1].data_slice(), &[b'S', b'P', 0, 0, 0x88, 0x13, 0, 0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_group_query_joins_members() {
        let bus = MockCanBus::new();
        echo_firmware(&bus, &[1, 2, 3]);
        let driver = DriverBuilder::new()
            .group_members([1, 2, 3])
            .build(bus.clone())
            .unwrap();

        let reply = driver.query(GROUP_NODE_ID, Register::Mo, 0).await.unwrap();
        assert_eq!(reply.to_string(), "101,102,103");
        assert_eq!(bus.sent_frames().len(), 1);
        assert_eq!(bus.sent_frames()[0].id, 0x30A);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_echo_mismatch_after_attempts() {
        let bus = MockCanBus::new();
        bus.set_responder(|frame| {
            let Ok(request) = InterpreterFrame::decode(frame.data_slice()) else {
                return vec![];
            };
            let reply = InterpreterFrame {
                value: Some(BinaryValue::Float(2.0)),
                ..request
            };
            let bytes = reply.encode().unwrap();
            vec![ArmFrame::new(0x280 + frame.node_id() as u32, &bytes)]
        });
        let driver = DriverBuilder::new()
            .max_attempts(2)
            .build(bus.clone())
            .unwrap();

        let err = driver.set(1, Register::Ac, 0, 1.0f32).await.unwrap_err();
        match err {
            DriverError::Command {
                command,
                node,
                source,
                ..
            } => {
                assert_eq!(command, "AC");
                assert_eq!(node, 1);
                assert!(matches!(*source, DriverError::CommandMismatch { .. }));
            },
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(bus.sent_frames().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_float_echo_within_tolerance() {
        let bus = MockCanBus::new();
        bus.set_responder(|frame| {
            let Ok(request) = InterpreterFrame::decode(frame.data_slice()) else {
                return vec![];
            };
            let reply = InterpreterFrame {
                value: Some(BinaryValue::Float(100.5)),
                ..request
            };
            let bytes = reply.encode().unwrap();
            vec![ArmFrame::new(0x280 + frame.node_id() as u32, &bytes)]
        });
        let driver = DriverBuilder::new().build(bus).unwrap();
        driver.set(1, Register::Ac, 0, 100.0f32).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_group_without_members_is_not_ready() {
        let bus = MockCanBus::new();
        let driver = DriverBuilder::new().build(bus).unwrap();
        let err = driver.query(GROUP_NODE_ID, Register::Mo, 0).await.unwrap_err();
        assert!(matches!(err, DriverError::NotReady(_)));
    }
}

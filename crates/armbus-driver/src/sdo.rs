//! SDO 协议引擎
//!
//! 每个节点只有一个 SDO 服务通道，因此同一节点的事务由 `SdoLocks`
//! 串行化；不同节点之间可以并发。每一步交换都先注册关联条目再发帧，
//! 分发任务按 `(对象, 子索引, 交换类型)` 完成它。

use crate::driver::{Driver, Shared};
use crate::error::DriverError;
use crate::transport::FramePriority;
use armbus_can::ArmFrame;
use armbus_protocol::sdo::{
    EXPEDITED_MAX, SdoResponse, SegmentCursor, abort_frame, abort_message,
    expedited_download_frame, segment_frame, segmented_download_initiate_frame,
    upload_initiate_frame, upload_segment_frame,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 分段上传的最大字节数
const MAX_UPLOAD_BYTES: usize = 64 * 1024;

/// 中止码：SDO 协议超时
const ABORT_TIMEOUT: u32 = 0x0504_0000;
/// 中止码：toggle 未交替
const ABORT_TOGGLE: u32 = 0x0503_0000;

/// 交换类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoExchange {
    /// 等待下载初始化应答
    Download,
    /// 等待上传初始化应答
    Upload,
    /// 等待段应答 / 上传数据段
    Segment,
}

/// SDO 关联标签
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdoTag {
    pub index: u16,
    pub sub_index: u8,
    pub exchange: SdoExchange,
}

impl SdoTag {
    fn accepts(&self, response: &SdoResponse) -> bool {
        let same_object = response.object() == Some((self.index, self.sub_index));
        match response {
            SdoResponse::DownloadAck { .. } => {
                self.exchange == SdoExchange::Download && same_object
            },
            SdoResponse::UploadExpedited { .. } | SdoResponse::UploadSegmented { .. } => {
                self.exchange == SdoExchange::Upload && same_object
            },
            SdoResponse::SegmentAck { .. } | SdoResponse::UploadSegment { .. } => {
                self.exchange == SdoExchange::Segment
            },
            SdoResponse::Abort { .. } => self.exchange == SdoExchange::Segment || same_object,
        }
    }
}

/// 每节点 SDO 通道锁
#[derive(Default)]
pub(crate) struct SdoLocks {
    locks: Mutex<HashMap<u8, Arc<tokio::sync::Mutex<()>>>>,
}

impl SdoLocks {
    fn channel(&self, node_id: u8) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(node_id).or_default().clone()
    }
}

/// 上传结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdoData {
    /// 加速传输，长度有效（数值）
    Expedited { data: [u8; 4], len: usize },
    /// 加速传输，未给出长度（按 4 字节字符串处理）
    ExpeditedString([u8; 4]),
    /// 分段传输
    Segmented(Vec<u8>),
}

impl SdoData {
    pub fn bytes(&self) -> &[u8] {
        match self {
            SdoData::Expedited { data, len } => &data[..*len],
            SdoData::ExpeditedString(data) => data,
            SdoData::Segmented(data) => data,
        }
    }

    /// 前 4 字节按小端解释
    pub fn as_u32(&self) -> u32 {
        let mut raw = [0u8; 4];
        let bytes = self.bytes();
        let len = bytes.len().min(4);
        raw[..len].copy_from_slice(&bytes[..len]);
        u32::from_le_bytes(raw)
    }

    /// 按字符串解释，去掉尾部 NUL
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(self.bytes())
            .trim_end_matches('\0')
            .to_string()
    }
}

impl Shared {
    pub(crate) fn handle_sdo_response(&self, frame: ArmFrame) {
        let node = frame.node_id();
        let response = match SdoResponse::try_from(frame) {
            Ok(response) => response,
            Err(e) => {
                warn!("Malformed SDO response from node {}: {}", node, e);
                return;
            },
        };
        if self.sdo.resolve(node, |tag| tag.accepts(&response), response) == 0 {
            debug!("Unsolicited SDO response from node {}: {:?}", node, response);
        }
    }
}

impl Driver {
    /// 一次请求/应答交换
    async fn sdo_exchange(
        &self,
        node: u8,
        tag: SdoTag,
        frame: ArmFrame,
        timeout: Duration,
    ) -> Result<SdoResponse, DriverError> {
        let rx = self.shared.sdo.register(node, tag);
        self.shared.enqueue(frame, FramePriority::Low).await?;

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(DriverError::NodeRestarted(node)),
            Err(_) => {
                warn!(
                    "SDO timeout: node {} 0x{:04X}:{} ({:?})",
                    node, tag.index, tag.sub_index, tag.exchange
                );
                let abort = abort_frame(node, tag.index, tag.sub_index, ABORT_TIMEOUT);
                let _ = self.shared.enqueue(abort, FramePriority::Low).await;
                return Err(DriverError::SdoTimeout {
                    node,
                    index: tag.index,
                    sub_index: tag.sub_index,
                });
            },
        };

        if let SdoResponse::Abort {
            index,
            sub_index,
            code,
        } = response
        {
            let message = abort_message(code);
            warn!(
                "SDO abort from node {} 0x{:04X}:{}: 0x{:08X} {}",
                node, index, sub_index, code, message
            );
            return Err(DriverError::SdoAbort {
                node,
                index,
                sub_index,
                code,
                message,
            });
        }
        Ok(response)
    }

    /// SDO 下载（写），≤4 字节走加速传输，否则分段
    pub async fn sdo_download(
        &self,
        node: u8,
        index: u16,
        sub_index: u8,
        data: &[u8],
    ) -> Result<(), DriverError> {
        let timeout = self.shared.config.transport.response_timeout;
        let channel = self.shared.sdo_locks.channel(node);
        let _guard = channel.lock().await;

        if data.len() <= EXPEDITED_MAX && !data.is_empty() {
            self.download_expedited(node, index, sub_index, data, timeout)
                .await
        } else {
            self.download_segmented(node, index, sub_index, data, timeout)
                .await
        }
    }

    /// 强制分段下载（OS 解释器命令文本）
    pub async fn sdo_download_segmented(
        &self,
        node: u8,
        index: u16,
        sub_index: u8,
        data: &[u8],
    ) -> Result<(), DriverError> {
        let timeout = self.shared.config.transport.response_timeout;
        let channel = self.shared.sdo_locks.channel(node);
        let _guard = channel.lock().await;
        self.download_segmented(node, index, sub_index, data, timeout)
            .await
    }

    async fn download_expedited(
        &self,
        node: u8,
        index: u16,
        sub_index: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let frame = expedited_download_frame(node, index, sub_index, data)?;
        let tag = SdoTag {
            index,
            sub_index,
            exchange: SdoExchange::Download,
        };
        match self.sdo_exchange(node, tag, frame, timeout).await? {
            SdoResponse::DownloadAck { .. } => {
                debug!(
                    "SDO write node {} 0x{:04X}:{} = {:02X?}",
                    node, index, sub_index, data
                );
                Ok(())
            },
            other => Err(unexpected(node, &other)),
        }
    }

    async fn download_segmented(
        &self,
        node: u8,
        index: u16,
        sub_index: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let initiate = segmented_download_initiate_frame(node, index, sub_index, data.len() as u32);
        let tag = SdoTag {
            index,
            sub_index,
            exchange: SdoExchange::Download,
        };
        match self.sdo_exchange(node, tag, initiate, timeout).await? {
            SdoResponse::DownloadAck { .. } => {},
            other => return Err(unexpected(node, &other)),
        }

        let segment_tag = SdoTag {
            exchange: SdoExchange::Segment,
            ..tag
        };
        for segment in SegmentCursor::new(data) {
            let frame = segment_frame(node, &segment);
            match self.sdo_exchange(node, segment_tag, frame, timeout).await? {
                SdoResponse::SegmentAck { toggle } if toggle == segment.toggle => {},
                SdoResponse::SegmentAck { .. } => {
                    let abort = abort_frame(node, index, sub_index, ABORT_TOGGLE);
                    let _ = self.shared.enqueue(abort, FramePriority::Low).await;
                    return Err(DriverError::SdoProtocol {
                        node,
                        reason: format!(
                            "segment ack toggle mismatch on 0x{:04X}:{}",
                            index, sub_index
                        ),
                    });
                },
                other => return Err(unexpected(node, &other)),
            }
        }
        debug!(
            "SDO segmented write node {} 0x{:04X}:{} ({} bytes)",
            node,
            index,
            sub_index,
            data.len()
        );
        Ok(())
    }

    /// SDO 上传（读）
    pub async fn sdo_upload(
        &self,
        node: u8,
        index: u16,
        sub_index: u8,
    ) -> Result<SdoData, DriverError> {
        let timeout = self.shared.config.transport.response_timeout;
        let channel = self.shared.sdo_locks.channel(node);
        let _guard = channel.lock().await;

        let tag = SdoTag {
            index,
            sub_index,
            exchange: SdoExchange::Upload,
        };
        let frame = upload_initiate_frame(node, index, sub_index);
        let size = match self.sdo_exchange(node, tag, frame, timeout).await? {
            SdoResponse::UploadExpedited {
                data,
                len,
                size_indicated: true,
                ..
            } => return Ok(SdoData::Expedited { data, len }),
            SdoResponse::UploadExpedited { data, .. } => {
                return Ok(SdoData::ExpeditedString(data));
            },
            SdoResponse::UploadSegmented { size, .. } => size as usize,
            other => return Err(unexpected(node, &other)),
        };

        let segment_tag = SdoTag {
            exchange: SdoExchange::Segment,
            ..tag
        };
        let mut buffer = Vec::with_capacity(size.min(MAX_UPLOAD_BYTES));
        let mut toggle = false;
        loop {
            let frame = upload_segment_frame(node, toggle);
            match self.sdo_exchange(node, segment_tag, frame, timeout).await? {
                SdoResponse::UploadSegment {
                    toggle: got,
                    last,
                    data,
                    len,
                } => {
                    if got != toggle {
                        let abort = abort_frame(node, index, sub_index, ABORT_TOGGLE);
                        let _ = self.shared.enqueue(abort, FramePriority::Low).await;
                        return Err(DriverError::SdoProtocol {
                            node,
                            reason: format!(
                                "upload segment toggle mismatch on 0x{:04X}:{} (expected {})",
                                index, sub_index, toggle as u8
                            ),
                        });
                    }
                    buffer.extend_from_slice(&data[..len]);
                    if last {
                        break;
                    }
                    if buffer.len() > MAX_UPLOAD_BYTES {
                        return Err(DriverError::SdoProtocol {
                            node,
                            reason: format!("segmented upload exceeds {} bytes", MAX_UPLOAD_BYTES),
                        });
                    }
                    toggle = !toggle;
                },
                other => return Err(unexpected(node, &other)),
            }
        }

        if size != 0 && buffer.len() != size {
            warn!(
                "SDO upload node {} 0x{:04X}:{}: announced {} bytes, received {}",
                node,
                index,
                sub_index,
                size,
                buffer.len()
            );
        }
        Ok(SdoData::Segmented(buffer))
    }

    pub async fn sdo_download_u8(
        &self,
        node: u8,
        index: u16,
        sub: u8,
        value: u8,
    ) -> Result<(), DriverError> {
        self.sdo_download(node, index, sub, &[value]).await
    }

    pub async fn sdo_download_u16(
        &self,
        node: u8,
        index: u16,
        sub: u8,
        value: u16,
    ) -> Result<(), DriverError> {
        self.sdo_download(node, index, sub, &value.to_le_bytes()).await
    }

    pub async fn sdo_download_u32(
        &self,
        node: u8,
        index: u16,
        sub: u8,
        value: u32,
    ) -> Result<(), DriverError> {
        self.sdo_download(node, index, sub, &value.to_le_bytes()).await
    }

    pub async fn sdo_download_i32(
        &self,
        node: u8,
        index: u16,
        sub: u8,
        value: i32,
    ) -> Result<(), DriverError> {
        self.sdo_download(node, index, sub, &value.to_le_bytes()).await
    }

    pub async fn sdo_upload_u8(&self, node: u8, index: u16, sub: u8) -> Result<u8, DriverError> {
        Ok(self.sdo_upload(node, index, sub).await?.as_u32() as u8)
    }

    pub async fn sdo_upload_u16(&self, node: u8, index: u16, sub: u8) -> Result<u16, DriverError> {
        Ok(self.sdo_upload(node, index, sub).await?.as_u32() as u16)
    }

    pub async fn sdo_upload_u32(&self, node: u8, index: u16, sub: u8) -> Result<u32, DriverError> {
        Ok(self.sdo_upload(node, index, sub).await?.as_u32())
    }

    pub async fn sdo_upload_i32(&self, node: u8, index: u16, sub: u8) -> Result<i32, DriverError> {
        Ok(self.sdo_upload(node, index, sub).await?.as_u32() as i32)
    }

    pub async fn sdo_upload_string(
        &self,
        node: u8,
        index: u16,
        sub: u8,
    ) -> Result<String, DriverError> {
        Ok(self.sdo_upload(node, index, sub).await?.as_string())
    }
}

fn unexpected(node: u8, response: &SdoResponse) -> DriverError {
    DriverError::SdoProtocol {
        node,
        reason: format!("unexpected response {:?}", response),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DriverBuilder;
    use armbus_can::MockCanBus;

    fn reply(node: u8, bytes: [u8; 8]) -> ArmFrame {
        ArmFrame::new(0x580 + node as u32, &bytes)
    }

    #[test]
    fn test_tag_matching() {
        let download = SdoTag {
            index: 0x6040,
            sub_index: 0,
            exchange: SdoExchange::Download,
        };
        assert!(download.accepts(&SdoResponse::DownloadAck {
            index: 0x6040,
            sub_index: 0
        }));
        assert!(!download.accepts(&SdoResponse::DownloadAck {
            index: 0x6041,
            sub_index: 0
        }));
        assert!(!download.accepts(&SdoResponse::SegmentAck { toggle: false }));
        assert!(download.accepts(&SdoResponse::Abort {
            index: 0x6040,
            sub_index: 0,
            code: 1
        }));

        let segment = SdoTag {
            exchange: SdoExchange::Segment,
            ..download
        };
        assert!(segment.accepts(&SdoResponse::SegmentAck { toggle: true }));
        assert!(segment.accepts(&SdoResponse::Abort {
            index: 0x1023,
            sub_index: 1,
            code: 1
        }));
    }

    #[test]
    fn test_sdo_data_accessors() {
        let data = SdoData::Expedited {
            data: [0x37, 0x06, 0xAA, 0xBB],
            len: 2,
        };
        assert_eq!(data.bytes(), &[0x37, 0x06]);
        assert_eq!(data.as_u32(), 0x0637);

        let text = SdoData::ExpeditedString(*b"Go\0\0");
        assert_eq!(text.as_string(), "Go");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_expedited_download_ack() {
        let bus = MockCanBus::new();
        bus.set_responder(|frame| {
            if frame.id == 0x603 {
                let mut ack = [0u8; 8];
                ack[0] = 0x60;
                ack[1..4].copy_from_slice(&frame.data[1..4]);
                vec![reply(3, ack)]
            } else {
                vec![]
            }
        });
        let driver = DriverBuilder::new().build(bus.clone()).unwrap();

        driver.sdo_download_u16(3, 0x6040, 0, 0x000F).await.unwrap();
        let sent = bus.sent_frames();
        assert_eq!(sent[0].data, [0x2B, 0x40, 0x60, 0x00, 0x0F, 0x00, 0x00, 0x00]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_download_sends_terminal_segment() {
        let bus = MockCanBus::new();
        bus.set_responder(|frame| {
            let cmd = frame.data[0];
            let mut ack = [0u8; 8];
            if cmd == 0x21 {
                ack[0] = 0x60;
                ack[1..4].copy_from_slice(&frame.data[1..4]);
            } else {
                ack[0] = 0x20 | (cmd & 0x10);
            }
            vec![reply(5, ack)]
        });
        let driver = DriverBuilder::new().build(bus.clone()).unwrap();

        driver.sdo_download(5, 0x1023, 1, &[]).await.unwrap();
        let sent = bus.sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].data, [0x21, 0x23, 0x10, 0x01, 0, 0, 0, 0]);
        assert_eq!(sent[1].data, [0x0F, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_abort_maps_to_message() {
        let bus = MockCanBus::new();
        bus.set_responder(|frame| {
            let mut abort = [0x80, 0, 0, 0, 0x00, 0x00, 0x02, 0x06];
            abort[1..4].copy_from_slice(&frame.data[1..4]);
            vec![reply(1, abort)]
        });
        let driver = DriverBuilder::new().build(bus).unwrap();

        let err = driver.sdo_upload(1, 0x2000, 1).await.unwrap_err();
        match err {
            DriverError::SdoAbort { code, message, .. } => {
                assert_eq!(code, 0x0602_0000);
                assert_eq!(message, "Object does not exist in the object dictionary");
            },
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_sends_abort() {
        let bus = MockCanBus::new();
        let driver = DriverBuilder::new()
            .response_timeout(Duration::from_millis(30))
            .build(bus.clone())
            .unwrap();

        let err = driver.sdo_upload(4, 0x6064, 0).await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::SdoTimeout {
                node: 4,
                index: 0x6064,
                sub_index: 0
            }
        ));
        let sent = bus.sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].data[0], 0x80);
        assert_eq!(sent[1].data[4..8], ABORT_TIMEOUT.to_le_bytes());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_segmented_upload_toggle_mismatch_is_fatal() {
        let bus = MockCanBus::new();
        bus.set_responder(|frame| match frame.data[0] {
            0x40 => vec![reply(2, [0x41, 0x08, 0x10, 0x00, 10, 0, 0, 0])],
            // 第一段应答错误地带 toggle=1
            0x60 => vec![reply(2, [0x10, b'a', b'b', b'c', b'd', b'e', b'f', b'g'])],
            _ => vec![],
        });
        let driver = DriverBuilder::new().build(bus.clone()).unwrap();

        let err = driver.sdo_upload(2, 0x1008, 0).await.unwrap_err();
        assert!(matches!(err, DriverError::SdoProtocol { node: 2, .. }));
        // 初始化 + 一次分段请求 + 中止，不重试
        assert_eq!(bus.sent_frames().len(), 3);
    }
}

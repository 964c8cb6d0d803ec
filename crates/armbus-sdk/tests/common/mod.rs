//! 脚本化驱动器模拟（挂在 MockCanBus 应答器上）
//!
//! 模拟内容：
//! - NMT 复位通信 → 每个在线节点回 boot-up
//! - SDO 服务端：加速/分段下载，加速/分段上传，未知对象回中止
//! - 二进制解释器：查询返回寄存器值，写入回显，组地址展开到全部节点
//! - OS 解释器：`0x1023:1` 命令，`0x1023:2` 状态（先报告一次执行中；`ODD` 给出未知状态），`0x1023:3` 应答
//! - 控制字新设定点 → TPDO1（目标到达 + 目标位置）

#![allow(dead_code)]

use armbus_sdk::can::MockCanBus;
use armbus_sdk::protocol::{ArmFrame, BinaryValue, InterpreterFrame, Register};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

const ABORT_NO_OBJECT: u32 = 0x0602_0000;

#[derive(Default)]
pub struct SimState {
    pub nodes: BTreeSet<u8>,
    pub objects: HashMap<(u8, u16, u8), Vec<u8>>,
    pub registers: HashMap<(u8, Register, u16), BinaryValue>,
    pub os_commands: Vec<(u8, String)>,
    /// 运动完成后是否上报 TPDO1
    pub complete_moves: bool,
    /// XQ 程序启动后上报的数字输入
    pub home_inputs: Option<u32>,
    downloads: HashMap<u8, (u16, u8, Vec<u8>)>,
    uploads: HashMap<u8, (Vec<u8>, usize)>,
    os_pending: HashMap<u8, u8>,
}

#[derive(Clone)]
pub struct DriveSim {
    pub state: Arc<Mutex<SimState>>,
}

impl DriveSim {
    pub fn new(nodes: &[u8]) -> Self {
        let state = SimState {
            nodes: nodes.iter().copied().collect(),
            complete_moves: true,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn attach(&self, bus: &MockCanBus) {
        let state = self.state.clone();
        bus.set_responder(move |frame| state.lock().unwrap().respond(frame));
    }

    pub fn object(&self, node: u8, index: u16, sub: u8) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(&(node, index, sub)).cloned()
    }

    pub fn set_object(&self, node: u8, index: u16, sub: u8, value: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((node, index, sub), value.to_vec());
    }

    pub fn set_register(&self, node: u8, register: Register, index: u16, value: BinaryValue) {
        self.state
            .lock()
            .unwrap()
            .registers
            .insert((node, register, index), value);
    }

    pub fn register(&self, node: u8, register: Register, index: u16) -> Option<BinaryValue> {
        self.state
            .lock()
            .unwrap()
            .registers
            .get(&(node, register, index))
            .copied()
    }

    pub fn os_commands(&self) -> Vec<(u8, String)> {
        self.state.lock().unwrap().os_commands.clone()
    }
}

fn sdo_reply(node: u8, data: [u8; 8]) -> ArmFrame {
    ArmFrame::new(0x580 + node as u32, &data)
}

fn abort(node: u8, index: u16, sub: u8, code: u32) -> ArmFrame {
    let i = index.to_le_bytes();
    let c = code.to_le_bytes();
    sdo_reply(node, [0x80, i[0], i[1], sub, c[0], c[1], c[2], c[3]])
}

impl SimState {
    fn respond(&mut self, frame: &ArmFrame) -> Vec<ArmFrame> {
        let node = frame.node_id();
        match frame.function_code() {
            0 => self.nmt(frame),
            6 => self.interpreter(frame),
            12 if self.nodes.contains(&node) => self.sdo(node, frame.data_slice()),
            _ => vec![],
        }
    }

    fn nmt(&mut self, frame: &ArmFrame) -> Vec<ArmFrame> {
        let data = frame.data_slice();
        if data.len() == 2 && data[0] == 0x82 {
            let target = data[1];
            return self
                .nodes
                .iter()
                .filter(|n| target == 0 || **n == target)
                .map(|n| ArmFrame::new(0x700 + *n as u32, &[0x00]))
                .collect();
        }
        vec![]
    }

    fn interpreter(&mut self, frame: &ArmFrame) -> Vec<ArmFrame> {
        let Ok(request) = InterpreterFrame::decode(frame.data_slice()) else {
            return vec![];
        };
        let targets: Vec<u8> = if frame.node_id() == 10 {
            self.nodes.iter().copied().collect()
        } else if self.nodes.contains(&frame.node_id()) {
            vec![frame.node_id()]
        } else {
            vec![]
        };

        targets
            .into_iter()
            .map(|node| {
                let key = (node, request.register, request.index);
                let value = if request.query {
                    Some(*self.registers.get(&key).unwrap_or(&BinaryValue::Int(0)))
                } else if let Some(value) = request.value {
                    self.registers.insert(key, value);
                    Some(value)
                } else {
                    None
                };
                let reply = InterpreterFrame { value, ..request };
                let bytes = reply.encode().unwrap();
                ArmFrame::new(0x280 + node as u32, &bytes)
            })
            .collect()
    }

    fn sdo(&mut self, node: u8, d: &[u8]) -> Vec<ArmFrame> {
        let cmd = d[0];
        let index = u16::from_le_bytes([d[1], d[2]]);
        let sub = d[3];
        let (i0, i1) = (d[1], d[2]);

        match cmd >> 5 {
            // 下载初始化
            1 => {
                if cmd & 0x02 != 0 {
                    let n = if cmd & 0x01 != 0 { 4 - ((cmd >> 2) & 0x03) as usize } else { 4 };
                    let value = d[4..4 + n].to_vec();
                    let mut extra = self.store(node, index, sub, value);
                    let mut out = vec![sdo_reply(node, [0x60, i0, i1, sub, 0, 0, 0, 0])];
                    out.append(&mut extra);
                    out
                } else {
                    self.downloads.insert(node, (index, sub, Vec::new()));
                    vec![sdo_reply(node, [0x60, i0, i1, sub, 0, 0, 0, 0])]
                }
            },
            // 下载段
            0 => {
                let toggle = (cmd >> 4) & 1;
                let n = 7 - ((cmd >> 1) & 0x07) as usize;
                let last = cmd & 1 != 0;
                let Some(entry) = self.downloads.get_mut(&node) else {
                    return vec![abort(node, 0, 0, 0x0504_0001)];
                };
                entry.2.extend_from_slice(&d[1..1 + n]);
                let mut out = vec![sdo_reply(node, [0x20 | (toggle << 4), 0, 0, 0, 0, 0, 0, 0])];
                if last {
                    if let Some((index, sub, value)) = self.downloads.remove(&node) {
                        out.append(&mut self.store(node, index, sub, value));
                    }
                }
                out
            },
            // 上传初始化
            2 => {
                let Some(value) = self.read(node, index, sub) else {
                    return vec![abort(node, index, sub, ABORT_NO_OBJECT)];
                };
                if value.len() <= 4 {
                    let n = value.len();
                    let mut data = [0x43 | (((4 - n) as u8) << 2), i0, i1, sub, 0, 0, 0, 0];
                    data[4..4 + n].copy_from_slice(&value);
                    vec![sdo_reply(node, data)]
                } else {
                    let size = (value.len() as u32).to_le_bytes();
                    self.uploads.insert(node, (value, 0));
                    vec![sdo_reply(node, [0x41, i0, i1, sub, size[0], size[1], size[2], size[3]])]
                }
            },
            // 上传段请求
            3 => {
                let toggle = (cmd >> 4) & 1;
                let Some((value, offset)) = self.uploads.get_mut(&node) else {
                    return vec![abort(node, 0, 0, 0x0504_0001)];
                };
                let n = (value.len() - *offset).min(7);
                let mut data = [0u8; 8];
                data[1..1 + n].copy_from_slice(&value[*offset..*offset + n]);
                *offset += n;
                let last = *offset >= value.len();
                data[0] = (toggle << 4) | (((7 - n) as u8) << 1) | last as u8;
                if last {
                    self.uploads.remove(&node);
                }
                vec![sdo_reply(node, data)]
            },
            // 中止
            4 => {
                self.downloads.remove(&node);
                self.uploads.remove(&node);
                vec![]
            },
            _ => vec![abort(node, index, sub, 0x0504_0001)],
        }
    }

    fn read(&mut self, node: u8, index: u16, sub: u8) -> Option<Vec<u8>> {
        if (index, sub) == (0x1023, 2) {
            // 第一次查询报告执行中
            let polls = self.os_pending.entry(node).or_insert(0);
            *polls += 1;
            if *polls == 1 {
                return Some(vec![255]);
            }
        }
        self.objects.get(&(node, index, sub)).cloned()
    }

    /// 写入对象，返回副作用产生的帧
    fn store(&mut self, node: u8, index: u16, sub: u8, value: Vec<u8>) -> Vec<ArmFrame> {
        let mut out = Vec::new();
        match (index, sub) {
            (0x1023, 1) => {
                let text = String::from_utf8_lossy(&value).to_string();
                self.os_pending.insert(node, 0);
                let (status, reply): (u8, &[u8]) = if text.starts_with("XQ##") {
                    if let Some(inputs) = self.home_inputs {
                        out.push(ArmFrame::new(0x380 + node as u32, &inputs.to_le_bytes()));
                    }
                    (0, b"")
                } else if text == "BAD" {
                    (3, b"EUnknown command")
                } else if text == "ODD" {
                    (7, b"")
                } else {
                    (1, b"N42.5")
                };
                self.objects.insert((node, 0x1023, 2), vec![status]);
                self.objects.insert((node, 0x1023, 3), reply.to_vec());
                self.os_commands.push((node, text));
            },
            (0x6040, 0) => {
                let word = u16::from_le_bytes([value[0], value[1]]);
                match word & 0x000F {
                    0x000F => {
                        self.registers.insert((node, Register::Mo, 0), BinaryValue::Int(1));
                    },
                    0x0006 | 0x0007 => {
                        self.registers.insert((node, Register::Mo, 0), BinaryValue::Int(0));
                    },
                    _ => {},
                }
                if word & 0x0010 != 0 && self.complete_moves {
                    let target = self
                        .objects
                        .get(&(node, 0x607A, 0))
                        .map(|v| i32::from_le_bytes([v[0], v[1], v[2], v[3]]))
                        .unwrap_or(0);
                    let mut payload = [0u8; 6];
                    payload[..2].copy_from_slice(&0x0637u16.to_le_bytes());
                    payload[2..].copy_from_slice(&target.to_le_bytes());
                    out.push(ArmFrame::new(0x180 + node as u32, &payload));
                }
            },
            _ => {},
        }
        self.objects.insert((node, index, sub), value);
        out
    }
}

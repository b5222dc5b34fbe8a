//! Mock transport and router simulator
//!
//! `MockTransport` keeps a receive queue and a log of every write and read so
//! tests can assert on bus ordering. An optional responder produces the
//! router's answer for each written frame; [`RouterSim`] is a responder that
//! behaves like a router for the mode and control commands.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::protocol::commands::{code, opcode};
use crate::protocol::serial::{encode_serial_response, CMD_PREFIX};

use super::traits::{BusTransport, TransportCounters, TransportError, TransportStats};

/// Produces the router's reply frames for one written command frame
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// One observed operation on the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    Write(Vec<u8>),
    Read(Vec<u8>),
}

#[derive(Default)]
struct MockState {
    receive_queue: VecDeque<u8>,
    ops: Vec<LinkOp>,
    responder: Option<Responder>,
    closed: bool,
    fail_writes: bool,
    fail_reads: bool,
}

/// In-memory transport
pub struct MockTransport {
    state: Mutex<MockState>,
    data_ready: Notify,
    counters: TransportCounters,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockTransport")
            .field("pending", &state.receive_queue.len())
            .field("ops", &state.ops.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            data_ready: Notify::new(),
            counters: TransportCounters::default(),
        }
    }

    pub fn with_responder(responder: Responder) -> Self {
        let mock = Self::new();
        mock.state.lock().responder = Some(responder);
        mock
    }

    /// Queue bytes as if the router had sent them
    pub fn add_receive_data(&self, data: &[u8]) {
        self.state.lock().receive_queue.extend(data.iter().copied());
        self.data_ready.notify_one();
    }

    /// Simulate the device disappearing
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.data_ready.notify_one();
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Make every read fail with an I/O error, like a dying USB adapter
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
        self.data_ready.notify_one();
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().receive_queue.len()
    }

    pub fn ops(&self) -> Vec<LinkOp> {
        self.state.lock().ops.clone()
    }

    /// Frames written by the hub, in order
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                LinkOp::Write(frame) => Some(frame.clone()),
                LinkOp::Read(_) => None,
            })
            .collect()
    }

    /// Opcodes of the written command frames, in order
    pub fn sent_opcodes(&self) -> Vec<u8> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| frame.get(3).copied())
            .collect()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }
}

#[async_trait]
impl BusTransport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn write_all(&self, data: &[u8]) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed("mock link closed".to_string()));
            }
            if state.fail_writes {
                return Err(TransportError::Io("simulated write failure".to_string()));
            }
            state.ops.push(LinkOp::Write(data.to_vec()));
            if let Some(responder) = state.responder.as_mut() {
                let replies = responder(data);
                for reply in replies {
                    state.receive_queue.extend(reply);
                }
            }
        }
        self.counters.record_sent(data.len());
        self.data_ready.notify_one();
        Ok(())
    }

    async fn read_exact(
        &self,
        buf: &mut [u8],
        read_timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        let deadline = read_timeout.map(|limit| Instant::now() + limit);
        loop {
            {
                let mut state = self.state.lock();
                if state.fail_reads {
                    return Err(TransportError::Io("simulated read failure".to_string()));
                }
                if state.receive_queue.len() >= buf.len() {
                    for slot in buf.iter_mut() {
                        *slot = state.receive_queue.pop_front().unwrap_or_default();
                    }
                    state.ops.push(LinkOp::Read(buf.to_vec()));
                    self.counters.record_received(buf.len());
                    return Ok(());
                }
                if state.closed {
                    return Err(TransportError::Closed("mock link closed".to_string()));
                }
            }

            match (deadline, read_timeout) {
                (Some(deadline), Some(limit)) => {
                    if tokio::time::timeout_at(deadline, self.data_ready.notified())
                        .await
                        .is_err()
                    {
                        return Err(TransportError::Timeout(limit));
                    }
                },
                _ => self.data_ready.notified().await,
            }
        }
    }

    async fn discard_pending(&self) -> Result<usize, TransportError> {
        let mut state = self.state.lock();
        let count = state.receive_queue.len();
        state.receive_queue.clear();
        self.counters.record_discarded(count);
        Ok(count)
    }

    fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}

/// Scripted router
///
/// Answers mode and control commands the way the router firmware does and
/// echoes every other command followed by `OK`. Boot attempts answered with
/// "booting" can be configured to exercise the probe retry. Modules added
/// with [`with_module`](Self::with_module) are listed and answer status reads
/// with their mirror.
#[derive(Debug, Default)]
pub struct RouterSim {
    operate: bool,
    booting_answers: u32,
    reject_operate: bool,
    modules: BTreeMap<u8, Vec<u8>>,
}

impl RouterSim {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the first `count` probes with the booting code
    pub fn booting_for(mut self, count: u32) -> Self {
        self.booting_answers = count;
        self
    }

    /// Refuse SET_OPR_MODE
    pub fn rejecting_operate(mut self) -> Self {
        self.reject_operate = true;
        self
    }

    /// Attach a module; its id is the first mirror byte
    pub fn with_module(mut self, mirror: Vec<u8>) -> Self {
        let id = mirror.first().copied().unwrap_or_default();
        self.modules.insert(id, mirror);
        self
    }

    pub fn into_responder(mut self) -> Responder {
        Box::new(move |frame| self.respond(frame))
    }

    pub fn respond(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        if frame.len() < 5 || frame[0] != CMD_PREFIX {
            return Vec::new();
        }
        let router = frame[1];
        let op = frame[3];
        let args = &frame[4..frame.len() - 1];

        match op {
            opcode::SET_OPR_MODE => {
                if self.reject_operate {
                    return vec![encode_serial_response(router, code::MODE_ACK, &[0])];
                }
                self.operate = true;
                vec![encode_serial_response(router, code::MODE_ACK, &[1])]
            },
            opcode::START_MIRROR => vec![encode_serial_response(router, code::MODE_ACK, &[1])],
            opcode::START_EVENTS => {
                vec![encode_serial_response(router, code::SYSTEM_EVENT, &[254, 0])]
            },
            opcode::STOP_EVENTS => {
                vec![encode_serial_response(router, code::SYSTEM_EVENT, &[255, 0])]
            },
            opcode::GET_RT_MODULES => {
                let mut data = vec![self.modules.len() as u8];
                data.extend(self.modules.keys());
                vec![encode_serial_response(router, op, &data)]
            },
            opcode::GET_MOD_STATUS
                if args.first().is_some_and(|m| self.modules.contains_key(m)) =>
            {
                let module = args[0];
                let mut data = vec![module];
                data.extend_from_slice(&self.modules[&module]);
                vec![encode_serial_response(router, op, &data)]
            },
            opcode::STOP_MIRROR => {
                if self.booting_answers > 0 {
                    self.booting_answers -= 1;
                    return vec![encode_serial_response(router, code::ROUTER_BOOTING, &[])];
                }
                if self.operate {
                    self.operate = false;
                    vec![encode_serial_response(router, code::MODE_ACK, &[0])]
                } else {
                    vec![encode_serial_response(router, code::ROUTER_AVAILABLE, &[])]
                }
            },
            _ => {
                let mut data = args.to_vec();
                data.extend_from_slice(b"OK");
                vec![encode_serial_response(router, op, &data)]
            },
        }
    }
}

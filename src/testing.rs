//! An in-process stand-in for an Optima controller, bound to a loopback
//! UDP socket. Answers discovery, the U_CONNECT handshake, pings and
//! register commands the way the firmware does, and records everything it
//! sees so tests can assert on the wire traffic.

use crate::tunnel::{self, command, packet_flags, packet_type, Header, SetpointWrite};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;

pub(crate) struct FakeController {
    pub addr: SocketAddr,
    inner: Arc<Inner>,
    task: tokio::task::JoinHandle<()>,
}

struct Inner {
    socket: Arc<UdpSocket>,
    device_id: String,
    server_id: u32,
    datapoint_values: Mutex<Vec<i16>>,
    setpoint_values: Mutex<Vec<u16>>,
    writes: Mutex<Vec<SetpointWrite>>,
    /// `(sequence id, command id)` of every DATA frame received.
    data_requests: Mutex<Vec<(u16, u8)>>,
    /// Drop every datagram on the floor.
    silent: AtomicBool,
    /// Keep handshaking but stop answering DATA frames.
    silent_data: AtomicBool,
    peer: Mutex<Option<SocketAddr>>,
}

impl FakeController {
    pub async fn spawn(device_id: &str, server_id: u32) -> FakeController {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let inner = Arc::new(Inner {
            socket,
            device_id: device_id.to_owned(),
            server_id,
            datapoint_values: Mutex::new(Vec::new()),
            setpoint_values: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            data_requests: Mutex::new(Vec::new()),
            silent: AtomicBool::new(false),
            silent_data: AtomicBool::new(false),
            peer: Mutex::new(None),
        });
        let task = tokio::spawn(run(Arc::clone(&inner)));
        FakeController { addr, inner, task }
    }

    pub fn set_silent(&self, silent: bool) {
        self.inner.silent.store(silent, Ordering::Relaxed);
    }

    pub fn set_silent_data(&self, silent: bool) {
        self.inner.silent_data.store(silent, Ordering::Relaxed);
    }

    pub fn set_datapoint_values(&self, values: Vec<i16>) {
        *self.inner.datapoint_values.lock().unwrap() = values;
    }

    pub fn set_setpoint_values(&self, values: Vec<u16>) {
        *self.inner.setpoint_values.lock().unwrap() = values;
    }

    pub fn writes(&self) -> Vec<SetpointWrite> {
        self.inner.writes.lock().unwrap().clone()
    }

    pub fn data_requests(&self) -> Vec<(u16, u8)> {
        self.inner.data_requests.lock().unwrap().clone()
    }

    /// Injects a DATA reply with a sequence number of the test's choosing
    /// at the last peer seen.
    pub async fn send_unsolicited(&self, seq: u16) {
        let peer = self.inner.peer.lock().unwrap().expect("no peer seen yet");
        let frame = tunnel::build_data_packet(
            0,
            self.inner.server_id,
            seq,
            packet_flags::RESPONSE,
            &[0x00, 0x00],
        );
        self.inner.socket.send_to(&frame, peer).await.unwrap();
    }
}

impl Drop for FakeController {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(inner: Arc<Inner>) {
    let mut buffer = [0u8; 2048];
    loop {
        let Ok((len, peer)) = inner.socket.recv_from(&mut buffer).await else {
            return;
        };
        *inner.peer.lock().unwrap() = Some(peer);
        if inner.silent.load(Ordering::Relaxed) {
            continue;
        }
        let frame = &buffer[..len];
        if frame.len() >= 12 && frame[..4] == tunnel::DISCOVERY_REQUEST_TYPE.to_be_bytes() {
            let reply = discovery_reply(&inner.device_id);
            let _ = inner.socket.send_to(&reply, peer).await;
            continue;
        }
        let Some(header) = Header::parse(frame) else {
            continue;
        };
        match header.packet_type {
            packet_type::U_CONNECT => {
                let reply = connect_reply(header.client_id, inner.server_id);
                let _ = inner.socket.send_to(&reply, peer).await;
            }
            packet_type::DATA => {
                let Some((seq, cmd)) = tunnel::parse_data_response(frame) else {
                    continue;
                };
                let cmd_id = cmd.get(3).copied().unwrap_or(0);
                inner.data_requests.lock().unwrap().push((seq, cmd_id));
                if inner.silent_data.load(Ordering::Relaxed) {
                    continue;
                }
                let Some(reply_command) = answer(&inner, cmd_id, cmd) else {
                    continue;
                };
                let reply = tunnel::build_data_packet(
                    header.client_id,
                    inner.server_id,
                    seq,
                    packet_flags::RESPONSE,
                    &reply_command,
                );
                let _ = inner.socket.send_to(&reply, peer).await;
            }
            _ => {}
        }
    }
}

fn answer(inner: &Inner, cmd_id: u8, cmd: &[u8]) -> Option<Vec<u8>> {
    match cmd_id {
        command::PING => {
            let mut body = Vec::with_capacity(20);
            body.extend(77u32.to_be_bytes());
            body.extend(2010u32.to_be_bytes());
            body.extend(0u32.to_be_bytes());
            body.extend(78u32.to_be_bytes());
            body.extend(2011u32.to_be_bytes());
            Some(body)
        }
        command::DATAPOINT_READLIST => {
            let requested = usize::from(u16::from_be_bytes([*cmd.get(4)?, *cmd.get(5)?]));
            let values = inner.datapoint_values.lock().unwrap().clone();
            let mut body = Vec::with_capacity(2 + requested * 2);
            body.extend((requested as u16).to_be_bytes());
            for value in values.iter().take(requested) {
                body.extend(value.to_be_bytes());
            }
            Some(body)
        }
        command::SETPOINT_READLIST => {
            let requested = usize::from(u16::from_be_bytes([*cmd.get(4)?, *cmd.get(5)?]));
            let values = inner.setpoint_values.lock().unwrap().clone();
            let mut body = Vec::with_capacity(3 + requested * 2);
            body.push(0);
            body.extend((requested as u16).to_be_bytes());
            for value in values.iter().take(requested) {
                body.extend(value.to_be_bytes());
            }
            Some(body)
        }
        command::SETPOINT_WRITELIST => {
            let count = usize::from(u16::from_be_bytes([*cmd.get(4)?, *cmd.get(5)?]));
            let mut writes = inner.writes.lock().unwrap();
            for entry in 0..count {
                let base = 6 + entry * 7;
                let bytes = cmd.get(base..base + 7)?;
                writes.push(SetpointWrite {
                    id: bytes[0],
                    value: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
                    param: u16::from_be_bytes([bytes[5], bytes[6]]),
                });
            }
            Some(vec![0x00, 0x00])
        }
        _ => None,
    }
}

fn discovery_reply(device_id: &str) -> Vec<u8> {
    let mut frame = vec![0u8; tunnel::DISCOVERY_ID_OFFSET];
    frame[..4].copy_from_slice(&tunnel::DISCOVERY_RESPONSE_TYPE.to_be_bytes());
    frame.extend(device_id.as_bytes());
    frame.push(0);
    frame
}

fn connect_reply(client_id: u32, server_id: u32) -> Vec<u8> {
    let mut frame = Header {
        client_id,
        server_id: 0,
        packet_type: packet_type::U_CONNECT,
        flags: packet_flags::RESPONSE,
        sequence_id: 0,
        length: 28,
    }
    .to_bytes()
    .to_vec();
    frame.extend([0u8; 4]);
    frame.extend(tunnel::CONNECT_STATUS_OK.to_be_bytes());
    frame.extend(server_id.to_be_bytes());
    frame
}

//! In-process device simulator for integration tests
//!
//! Speaks MBAP framing over TCP and serves holding/input registers and coils
//! from in-memory maps. Addresses marked as failing answer with an
//! "illegal data address" exception, and responses can be delayed to force
//! timeouts or keep a request in flight.

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const ILLEGAL_FUNCTION: u8 = 0x01;
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

#[derive(Default)]
struct SimState {
    holding: Mutex<HashMap<u16, u16>>,
    input: Mutex<HashMap<u16, u16>>,
    coils: Mutex<HashMap<u16, bool>>,
    failing: Mutex<HashSet<u16>>,
    delay: Mutex<Duration>,
    requests: AtomicUsize,
    connections: AtomicUsize,
}

impl SimState {
    fn covers_failing(&self, address: u16, quantity: u16) -> bool {
        let failing = self.failing.lock();
        (address..address.saturating_add(quantity)).any(|a| failing.contains(&a))
    }

    fn handle(&self, pdu: &[u8]) -> Vec<u8> {
        let function = pdu[0];
        let field = |i: usize| u16::from_be_bytes([pdu[i], pdu[i + 1]]);
        let exception = |code: u8| vec![function | 0x80, code];

        match function {
            0x01 | 0x02 => {
                let (address, quantity) = (field(1), field(3));
                if self.covers_failing(address, quantity) {
                    return exception(ILLEGAL_DATA_ADDRESS);
                }
                let coils = self.coils.lock();
                let mut packed = vec![0u8; (quantity as usize).div_ceil(8)];
                for i in 0..quantity {
                    if coils.get(&(address + i)).copied().unwrap_or(false) {
                        packed[(i / 8) as usize] |= 1 << (i % 8);
                    }
                }
                let mut response = vec![function, packed.len() as u8];
                response.extend(packed);
                response
            },
            0x03 | 0x04 => {
                let (address, quantity) = (field(1), field(3));
                if self.covers_failing(address, quantity) {
                    return exception(ILLEGAL_DATA_ADDRESS);
                }
                let bank = if function == 0x03 {
                    self.holding.lock()
                } else {
                    self.input.lock()
                };
                let mut response = vec![function, (quantity * 2) as u8];
                for i in 0..quantity {
                    let Some(word) = bank.get(&(address + i)) else {
                        return exception(ILLEGAL_DATA_ADDRESS);
                    };
                    response.extend_from_slice(&word.to_be_bytes());
                }
                response
            },
            0x05 => {
                let (address, value) = (field(1), field(3));
                self.coils.lock().insert(address, value == 0xFF00);
                pdu[..5].to_vec()
            },
            0x06 => {
                let (address, value) = (field(1), field(3));
                if self.covers_failing(address, 1) {
                    return exception(ILLEGAL_DATA_ADDRESS);
                }
                self.holding.lock().insert(address, value);
                pdu[..5].to_vec()
            },
            0x10 => {
                let (address, quantity) = (field(1), field(3));
                if self.covers_failing(address, quantity) {
                    return exception(ILLEGAL_DATA_ADDRESS);
                }
                let mut holding = self.holding.lock();
                for i in 0..quantity {
                    holding.insert(address + i, field(6 + i as usize * 2));
                }
                pdu[..5].to_vec()
            },
            _ => exception(ILLEGAL_FUNCTION),
        }
    }
}

/// TCP device simulator bound to an ephemeral localhost port
pub struct DeviceSimulator {
    addr: SocketAddr,
    state: Arc<SimState>,
    accept_task: JoinHandle<()>,
}

impl DeviceSimulator {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(SimState::default());

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = serve(stream, state).await;
                });
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_holding(&self, address: u16, words: &[u16]) {
        let mut holding = self.state.holding.lock();
        for (i, word) in words.iter().enumerate() {
            holding.insert(address + i as u16, *word);
        }
    }

    pub fn holding(&self, address: u16) -> Option<u16> {
        self.state.holding.lock().get(&address).copied()
    }

    pub fn set_input(&self, address: u16, words: &[u16]) {
        let mut input = self.state.input.lock();
        for (i, word) in words.iter().enumerate() {
            input.insert(address + i as u16, *word);
        }
    }

    pub fn set_coil(&self, address: u16, on: bool) {
        self.state.coils.lock().insert(address, on);
    }

    /// Answer reads/writes touching `address` with an exception
    pub fn fail_address(&self, address: u16) {
        self.state.failing.lock().insert(address);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Close the listener; connections already accepted keep being served
    pub async fn stop_accepting(&mut self) {
        self.accept_task.abort();
        let _ = (&mut self.accept_task).await;
    }
}

impl Drop for DeviceSimulator {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(mut stream: TcpStream, state: Arc<SimState>) -> std::io::Result<()> {
    loop {
        let mut header = [0u8; 7];
        stream.read_exact(&mut header).await?;
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut pdu = vec![0u8; length.saturating_sub(1)];
        stream.read_exact(&mut pdu).await?;
        state.requests.fetch_add(1, Ordering::SeqCst);

        let response = state.handle(&pdu);
        let delay = *state.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut frame = Vec::with_capacity(7 + response.len());
        frame.extend_from_slice(&header[0..4]);
        frame.extend_from_slice(&((response.len() + 1) as u16).to_be_bytes());
        frame.push(header[6]);
        frame.extend_from_slice(&response);
        stream.write_all(&frame).await?;
    }
}

/// Port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

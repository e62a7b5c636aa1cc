//! Duplex byte transports.
//!
//! The session consumes an opaque [`Transport`]: blocking writes, a receive
//! callback fired from a transport-owned thread, and a close operation.
//! Opening is a concern of each concrete type (the real port opens in its
//! constructor, test pairs are born open).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{LedlinkError, Result};

/// Receive callback. Invoked from the transport's RX thread; must be safe
/// to run concurrently with [`Transport::write_bytes`].
pub type RxCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Opaque duplex byte transport.
pub trait Transport: Send + Sync {
    /// Write the whole buffer, blocking as needed.
    fn write_bytes(&self, data: &[u8]) -> Result<()>;

    /// Install the receive callback, replacing any previous one.
    fn set_rx_callback(&self, cb: RxCallback);

    /// Stop delivery and release the underlying device.
    fn close(&self);
}

/// In-memory transport pair for tests.
///
/// Each `write_bytes` delivers synchronously into the peer's callback, so a
/// test can script the device side with plain function calls. Written
/// frames are also kept in a per-side log for assertions.
pub struct FakeSerialPort {
    rx_cb: Mutex<Option<RxCallback>>,
    peer: Mutex<Weak<FakeSerialPort>>,
    open: AtomicBool,
    tx_log: Mutex<Vec<Vec<u8>>>,
}

impl FakeSerialPort {
    /// Create two endpoints wired to each other.
    pub fn pair() -> (Arc<FakeSerialPort>, Arc<FakeSerialPort>) {
        let a = Arc::new(FakeSerialPort::new());
        let b = Arc::new(FakeSerialPort::new());
        *a.peer.lock().unwrap() = Arc::downgrade(&b);
        *b.peer.lock().unwrap() = Arc::downgrade(&a);
        (a, b)
    }

    fn new() -> FakeSerialPort {
        FakeSerialPort {
            rx_cb: Mutex::new(None),
            peer: Mutex::new(Weak::new()),
            open: AtomicBool::new(true),
            tx_log: Mutex::new(Vec::new()),
        }
    }

    /// Every buffer written to this side, oldest first.
    pub fn tx_log(&self) -> Vec<Vec<u8>> {
        self.tx_log.lock().unwrap().clone()
    }

    /// Reopen after a close (tests only).
    pub fn reopen(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    fn deliver(&self, data: &[u8]) {
        // Clone the callback out so delivery never holds the slot lock;
        // handlers are free to write back into this port reentrantly.
        let cb = self.rx_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(data);
        }
    }
}

impl Transport for FakeSerialPort {
    fn write_bytes(&self, data: &[u8]) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(LedlinkError::transport("port closed"));
        }
        self.tx_log.lock().unwrap().push(data.to_vec());
        let peer = self.peer.lock().unwrap().upgrade();
        if let Some(peer) = peer {
            if peer.open.load(Ordering::SeqCst) {
                peer.deliver(data);
            }
        }
        Ok(())
    }

    fn set_rx_callback(&self, cb: RxCallback) {
        *self.rx_cb.lock().unwrap() = Some(cb);
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Physical serial port adapter.
///
/// Opens 8N1 with the requested read timeout and runs a polling RX thread
/// forwarding every received chunk to the installed callback. Read errors
/// are logged and retried; they never tear the session down.
#[cfg(feature = "serial")]
pub struct SerialPortTransport {
    writer: Mutex<Option<Box<dyn serialport::SerialPort>>>,
    rx_cb: Mutex<Option<RxCallback>>,
    stop: AtomicBool,
}

#[cfg(feature = "serial")]
impl SerialPortTransport {
    /// Open `port_name` and start the RX thread.
    pub fn open(port_name: &str, baud: u32, timeout_ms: u64) -> Result<Arc<SerialPortTransport>> {
        use std::io::Read;
        use std::time::Duration;
        use tracing::{debug, error, info};

        let port = serialport::new(port_name, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(timeout_ms))
            .open()
            .map_err(|e| LedlinkError::transport(format!("open {port_name}: {e}")))?;
        let mut reader = port
            .try_clone()
            .map_err(|e| LedlinkError::transport(format!("clone {port_name}: {e}")))?;

        let transport = Arc::new(SerialPortTransport {
            writer: Mutex::new(Some(port)),
            rx_cb: Mutex::new(None),
            stop: AtomicBool::new(false),
        });

        let worker = Arc::clone(&transport);
        let name = port_name.to_string();
        std::thread::Builder::new()
            .name(format!("serial-rx-{name}"))
            .spawn(move || {
                let mut chunk = [0u8; 4096];
                while !worker.stop.load(Ordering::SeqCst) {
                    match reader.bytes_to_read() {
                        Ok(0) => std::thread::sleep(Duration::from_millis(1)),
                        Ok(n) => {
                            let want = (n as usize).min(chunk.len());
                            match reader.read(&mut chunk[..want]) {
                                Ok(0) => {}
                                Ok(got) => {
                                    let cb = worker.rx_cb.lock().unwrap().clone();
                                    if let Some(cb) = cb {
                                        cb(&chunk[..got]);
                                    }
                                }
                                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                                Err(e) => {
                                    error!("serial read failed: {e}");
                                    std::thread::sleep(Duration::from_millis(10));
                                }
                            }
                        }
                        Err(e) => {
                            error!("serial poll failed: {e}");
                            std::thread::sleep(Duration::from_millis(10));
                        }
                    }
                }
                debug!("serial rx thread stopped");
            })
            .map_err(|e| LedlinkError::transport(format!("spawn rx thread: {e}")))?;

        info!("serial opened: port={port_name} baud={baud} timeout_ms={timeout_ms}");
        Ok(transport)
    }
}

#[cfg(feature = "serial")]
impl Transport for SerialPortTransport {
    fn write_bytes(&self, data: &[u8]) -> Result<()> {
        use std::io::Write;

        let mut guard = self.writer.lock().unwrap();
        let Some(port) = guard.as_mut() else {
            return Err(LedlinkError::transport("serial port is not open"));
        };
        port.write_all(data)
            .map_err(|e| LedlinkError::transport(format!("serial write failed: {e}")))
    }

    fn set_rx_callback(&self, cb: RxCallback) {
        *self.rx_cb.lock().unwrap() = Some(cb);
    }

    fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.writer.lock().unwrap().take();
    }
}

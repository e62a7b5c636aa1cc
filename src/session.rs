//! Serial session: the protocol state machine over a transport.
//!
//! One session owns one transport. Incoming bytes are decoded on the
//! transport's RX thread; device requests (B1) are answered and serviced
//! there, acknowledgements (BF) are recorded for whichever thread is
//! blocked in [`Session::send_and_wait_ack`]. A dedicated thread keeps the
//! heartbeat cadence. Nothing on the RX path may abort the session: decode
//! errors become AF replies, send failures become offline accounting.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, info, trace, warn};

use crate::config::{CommConfig, DuplicateAckMode};
use crate::mapping::Payload;
use crate::protocol::codec::{build_a0, build_a1, build_af, decode_stream, encode_frame};
use crate::protocol::{AckCode, Frame, FrameType};
use crate::transport::Transport;

/// Produces the next A1 payload when the device asks for work.
pub type RequestHandler = Box<dyn FnMut() -> Payload + Send>;

/// Observes the AND-reduced outcome of each A1 transmission cycle.
pub type ResultHook = Box<dyn FnMut(bool) + Send>;

/// Link state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Offline,
}

/// Runtime parameters, usually derived from `comm.*` configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Default per-attempt ACK wait.
    pub ack_timeout: Duration,
    /// Per-A1-chunk ACK wait.
    pub cmd_timeout: Duration,
    /// Maximum A1 VAL bytes per frame.
    pub bytes_per_frame: usize,
    /// Pause between A1 chunks.
    pub inter_frame_gap: Duration,
    pub heartbeat_interval: Duration,
    /// Consecutive send failures before the session goes offline.
    pub offline_threshold: u32,
    /// Attempts per ACK wait (1 disables retries).
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub duplicate_ack_mode: DuplicateAckMode,
    /// Start the heartbeat scheduler on session creation.
    pub enable_heartbeat: bool,
}

impl SessionOptions {
    /// Derive options from the `comm` configuration section.
    ///
    /// With retries enabled the per-attempt wait comes from the retry
    /// policy; otherwise the generic ACK timeout applies.
    pub fn from_comm(comm: &CommConfig) -> SessionOptions {
        let (attempts, ack_timeout_ms) = if comm.retry.enabled {
            (comm.retry.max_attempts.max(1), comm.retry.ack_timeout_ms)
        } else {
            (1, comm.ack_timeout_ms)
        };
        SessionOptions {
            ack_timeout: Duration::from_millis(ack_timeout_ms),
            cmd_timeout: Duration::from_millis(comm.cmd_timeout_ms),
            bytes_per_frame: comm.bytes_per_frame,
            inter_frame_gap: Duration::from_millis(comm.inter_frame_gap_ms),
            heartbeat_interval: Duration::from_secs_f64(comm.heartbeat_interval_seconds),
            offline_threshold: comm.offline_failure_threshold,
            retry_attempts: attempts,
            retry_backoff: Duration::from_millis(comm.retry.backoff_ms),
            duplicate_ack_mode: comm.duplicate_ack_mode,
            enable_heartbeat: comm.enable_heartbeat,
        }
    }
}

/// B1 bookkeeping and connectivity state, guarded together.
struct LinkState {
    state: SessionState,
    offline_failures: u32,
    last_remote_seq: Option<u16>,
    last_b1_seq: Option<u16>,
    expected_remote_seq: Option<u16>,
    last_b1_ack_code: AckCode,
}

struct SessionInner {
    name: String,
    transport: Arc<dyn Transport>,
    opts: SessionOptions,
    seq: AtomicU16,
    rx_buf: Mutex<Vec<u8>>,
    awaiting: Mutex<HashSet<u16>>,
    acked: Mutex<HashMap<u16, u8>>,
    link: Mutex<LinkState>,
    /// Serializes A1 transmission cycles so chunks never interleave.
    a1_gate: Mutex<()>,
    request_handler: Mutex<Option<RequestHandler>>,
    on_a1_result: Mutex<Option<ResultHook>>,
}

/// A protocol session bound to one transport.
pub struct Session {
    inner: Arc<SessionInner>,
    heartbeat: Mutex<Option<Sender<()>>>,
}

impl Session {
    /// Create a session, install its RX callback, and (per options) start
    /// the heartbeat scheduler.
    pub fn new(
        transport: Arc<dyn Transport>,
        request_handler: Option<RequestHandler>,
        name: &str,
        opts: SessionOptions,
    ) -> Session {
        let inner = Arc::new(SessionInner {
            name: name.to_string(),
            transport: Arc::clone(&transport),
            opts,
            seq: AtomicU16::new(0),
            rx_buf: Mutex::new(Vec::new()),
            awaiting: Mutex::new(HashSet::new()),
            acked: Mutex::new(HashMap::new()),
            link: Mutex::new(LinkState {
                state: SessionState::Disconnected,
                offline_failures: 0,
                last_remote_seq: None,
                last_b1_seq: None,
                expected_remote_seq: None,
                last_b1_ack_code: AckCode::Ok,
            }),
            a1_gate: Mutex::new(()),
            request_handler: Mutex::new(request_handler),
            on_a1_result: Mutex::new(None),
        });

        let rx = Arc::clone(&inner);
        transport.set_rx_callback(Arc::new(move |data: &[u8]| rx.on_bytes(data)));

        let session = Session {
            inner,
            heartbeat: Mutex::new(None),
        };
        if session.inner.opts.enable_heartbeat {
            session.start_heartbeat(None);
        }
        session
    }

    /// Install the A1 outcome hook.
    pub fn set_on_a1_result(&self, hook: ResultHook) {
        *self.inner.on_a1_result.lock().unwrap() = Some(hook);
    }

    /// Current link state.
    pub fn state(&self) -> SessionState {
        self.inner.link.lock().unwrap().state
    }

    /// Consecutive ACK timeouts since the last received ACK.
    pub fn offline_failures(&self) -> u32 {
        self.inner.link.lock().unwrap().offline_failures
    }

    /// Sequence of the most recent frame from the peer, if any.
    pub fn last_remote_seq(&self) -> Option<u16> {
        self.inner.link.lock().unwrap().last_remote_seq
    }

    /// Allocate the next outbound sequence number (wraps modulo 2^16).
    pub fn next_seq(&self) -> u16 {
        self.inner.next_seq()
    }

    /// Send a frame and wait for its BF, applying the retry policy.
    pub fn send_and_wait_ack(&self, frame: &Frame, timeout: Option<Duration>) -> bool {
        self.inner.send_and_wait_ack(frame, timeout, None)
    }

    /// Send one heartbeat with the full retry policy.
    pub fn send_heartbeat(&self, timeout: Option<Duration>) -> bool {
        let frame = build_a0(self.inner.next_seq());
        self.inner.send_and_wait_ack(&frame, timeout, None)
    }

    /// Transmit a payload as one or more A1 frames.
    pub fn send_a1_payload(&self, payload: &Payload) -> bool {
        self.inner.send_a1_payload(payload)
    }

    /// Start the heartbeat scheduler (idempotent).
    ///
    /// The schedule is deadline based: `next += interval` after each beat,
    /// re-anchored to now when a beat overruns the interval, so drift never
    /// accumulates. Beats from this thread are single-shot; retrying would
    /// stretch the cadence and blur the offline accounting.
    pub fn start_heartbeat(&self, interval: Option<Duration>) {
        let mut guard = self.heartbeat.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let inner = Arc::clone(&self.inner);
        let interval = interval.unwrap_or(inner.opts.heartbeat_interval);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-hb", inner.name))
            .spawn(move || {
                let mut next = Instant::now();
                loop {
                    inner.send_heartbeat_once();
                    next += interval;
                    let now = Instant::now();
                    let delay = if next > now {
                        next - now
                    } else {
                        next = now;
                        Duration::ZERO
                    };
                    match stop_rx.recv_timeout(delay) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
            });
        match spawned {
            Ok(_handle) => {
                *guard = Some(stop_tx);
                info!("heartbeat scheduler started interval={interval:?}");
            }
            Err(e) => warn!("heartbeat scheduler failed to start: {e}"),
        }
    }

    /// Signal the heartbeat scheduler to stop at its next poll.
    pub fn stop_heartbeat(&self) {
        if self.heartbeat.lock().unwrap().take().is_some() {
            info!("heartbeat scheduler stopping");
        }
    }

    /// Close the transport and stop the heartbeat.
    pub fn shutdown(&self) {
        self.stop_heartbeat();
        self.inner.transport.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

impl SessionInner {
    fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn send_frame(&self, frame: &Frame) {
        let blob = encode_frame(frame);
        trace!("TX HEX: {}", hex_dump(&blob, 64));
        if let Err(e) = self.transport.write_bytes(&blob) {
            warn!("write failed for {:?} seq={}: {e}", frame.frame_type, frame.seq);
            return;
        }
        debug!(
            "TX {:?} seq={} len={}",
            frame.frame_type,
            frame.seq,
            frame.val.len()
        );
    }

    fn set_state(link: &mut LinkState, name: &str, new_state: SessionState) {
        if link.state != new_state {
            info!("session {name} state {:?} -> {:?}", link.state, new_state);
            link.state = new_state;
        }
    }

    /// Any received ACK proves the link: clear failures, go connected.
    fn mark_connected(&self) {
        let mut link = self.link.lock().unwrap();
        link.offline_failures = 0;
        Self::set_state(&mut link, &self.name, SessionState::Connected);
    }

    fn send_and_wait_ack(
        &self,
        frame: &Frame,
        timeout: Option<Duration>,
        attempts_override: Option<u32>,
    ) -> bool {
        let attempts = attempts_override
            .unwrap_or(self.opts.retry_attempts)
            .max(1);
        let backoff = if attempts > 1 {
            self.opts.retry_backoff
        } else {
            Duration::ZERO
        };
        let per_try = timeout.unwrap_or(self.opts.ack_timeout);
        let seq = frame.seq;

        for attempt in 0..attempts {
            self.awaiting.lock().unwrap().insert(seq);
            self.send_frame(frame);
            let deadline = Instant::now() + per_try;
            loop {
                if let Some(code) = self.acked.lock().unwrap().remove(&seq) {
                    self.awaiting.lock().unwrap().remove(&seq);
                    self.mark_connected();
                    return code == AckCode::Ok.wire();
                }
                if Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            self.awaiting.lock().unwrap().remove(&seq);
            if attempt + 1 < attempts {
                if !backoff.is_zero() {
                    std::thread::sleep(backoff);
                }
                continue;
            }
        }

        let mut link = self.link.lock().unwrap();
        link.offline_failures += 1;
        debug!(
            "ack timeout seq={seq} failures={}/{}",
            link.offline_failures, self.opts.offline_threshold
        );
        if link.offline_failures >= self.opts.offline_threshold {
            Self::set_state(&mut link, &self.name, SessionState::Offline);
        }
        false
    }

    /// Heartbeat-thread variant: one attempt, no backoff.
    fn send_heartbeat_once(&self) -> bool {
        let frame = build_a0(self.next_seq());
        self.send_and_wait_ack(&frame, None, Some(1))
    }

    /// Transport RX entry point. Decodes under the buffer lock, then
    /// handles the results with no lock held so replies can reenter.
    fn on_bytes(&self, data: &[u8]) {
        trace!("RX HEX: {}", hex_dump(data, 64));
        let mut errors: Vec<(AckCode, u16)> = Vec::new();
        let mut garbage: Vec<Vec<u8>> = Vec::new();
        let frames = {
            let mut buf = self.rx_buf.lock().unwrap();
            buf.extend_from_slice(data);
            decode_stream(
                &mut buf,
                |code, seq| errors.push((code, seq)),
                |chunk| garbage.push(chunk.to_vec()),
            )
        };
        for (code, seq) in errors {
            debug!("decode error -> AF code=0x{:02X} seq={seq}", code.wire());
            self.send_frame(&build_af(seq, code));
        }
        for chunk in garbage {
            // Non-protocol bytes are device chatter; route them to the
            // dedicated sink as replacement-lossy ASCII.
            info!(target: "device", "{}", ascii_lossy(&chunk));
        }
        for frame in frames {
            self.handle_frame(frame);
        }
    }

    fn handle_frame(&self, frame: Frame) {
        self.link.lock().unwrap().last_remote_seq = Some(frame.seq);
        match frame.frame_type {
            FrameType::Bf => {
                let code = frame.val.first().copied().unwrap_or(0);
                self.acked.lock().unwrap().insert(frame.seq, code);
                self.mark_connected();
            }
            FrameType::B0 => {
                self.send_frame(&build_af(frame.seq, AckCode::Ok));
                self.mark_connected();
            }
            FrameType::B1 => self.handle_b1(frame.seq),
            // Host-role frames are not expected from the peer.
            FrameType::A0 | FrameType::A1 | FrameType::Af => {
                debug!("ignoring {:?} seq={}", frame.frame_type, frame.seq)
            }
        }
    }

    /// Three-way B1 sequence discipline: duplicate, out-of-order, in-order.
    fn handle_b1(&self, seq: u16) {
        enum Verdict {
            Duplicate(AckCode),
            OutOfOrder(AckCode, u16),
            InOrder,
        }

        let verdict = {
            let mut link = self.link.lock().unwrap();
            if link.last_b1_seq == Some(seq) {
                let code = match self.opts.duplicate_ack_mode {
                    DuplicateAckMode::DuplicateCode => AckCode::Duplicate,
                    DuplicateAckMode::EchoLast => link.last_b1_ack_code,
                };
                Verdict::Duplicate(code)
            } else {
                match link.last_b1_seq {
                    Some(last) if seq != last.wrapping_add(1) => {
                        let expected = last.wrapping_add(1);
                        let code = if seq < expected {
                            AckCode::SeqTooSmall
                        } else {
                            AckCode::SeqTooLarge
                        };
                        link.last_b1_ack_code = code;
                        Verdict::OutOfOrder(code, expected)
                    }
                    _ => {
                        link.last_b1_seq = Some(seq);
                        link.expected_remote_seq = Some(seq.wrapping_add(1));
                        link.last_b1_ack_code = AckCode::Ok;
                        Verdict::InOrder
                    }
                }
            }
        };

        match verdict {
            Verdict::Duplicate(code) => {
                debug!("dup B1 seq={seq} code=0x{:02X}", code.wire());
                self.send_frame(&build_af(seq, code));
            }
            Verdict::OutOfOrder(code, expected) => {
                debug!("ooo B1 seq={seq} expected={expected} code=0x{:02X}", code.wire());
                self.send_frame(&build_af(seq, code));
            }
            Verdict::InOrder => {
                self.send_frame(&build_af(seq, AckCode::Ok));
                let payload = {
                    let mut handler = self.request_handler.lock().unwrap();
                    match handler.as_mut() {
                        Some(handler) => handler(),
                        None => Payload::empty(),
                    }
                };
                self.send_a1_payload(&payload);
            }
        }
    }

    /// Chunk and transmit one payload, waiting for each chunk's BF.
    ///
    /// An empty payload still produces one zero-item A1, clearing the
    /// display while keeping the request/response cadence intact.
    fn send_a1_payload(&self, payload: &Payload) -> bool {
        let _serialized = self.a1_gate.lock().unwrap();
        let chunk_items = (self.opts.bytes_per_frame / 2).max(1);
        let mut all_ok = true;

        if payload.indices.is_empty() {
            let frame = build_a1(&[], self.next_seq(), None, None);
            all_ok = self.send_and_wait_ack(&frame, Some(self.opts.cmd_timeout), None);
        } else {
            let total = payload.indices.len();
            let mut start = 0;
            while start < total {
                let end = (start + chunk_items).min(total);
                let attrs = payload.attrs.as_deref().map(|a| clamp_slice(a, start, end));
                let colors = payload.colors.as_deref().map(|c| clamp_slice(c, start, end));
                let frame = build_a1(&payload.indices[start..end], self.next_seq(), attrs, colors);
                let ok = self.send_and_wait_ack(&frame, Some(self.opts.cmd_timeout), None);
                all_ok = all_ok && ok;
                start = end;
                if start < total && !self.opts.inter_frame_gap.is_zero() {
                    std::thread::sleep(self.opts.inter_frame_gap);
                }
            }
        }

        if let Some(hook) = self.on_a1_result.lock().unwrap().as_mut() {
            hook(all_ok);
        }
        all_ok
    }
}

/// Slice `data[start..end]`, clamped to its actual length.
fn clamp_slice(data: &[u8], start: usize, end: usize) -> &[u8] {
    let lo = start.min(data.len());
    let hi = end.min(data.len());
    &data[lo..hi]
}

fn ascii_lossy(data: &[u8]) -> String {
    data.iter()
        .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
        .collect()
}

fn hex_dump(data: &[u8], limit: usize) -> String {
    let mut out = String::new();
    for &byte in data.iter().take(limit) {
        let _ = write!(out, "{byte:02X} ");
    }
    if data.len() > limit {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FakeSerialPort;
    use pretty_assertions::assert_eq;

    fn fast_opts() -> SessionOptions {
        SessionOptions {
            ack_timeout: Duration::from_millis(40),
            cmd_timeout: Duration::from_millis(200),
            bytes_per_frame: 512,
            inter_frame_gap: Duration::ZERO,
            heartbeat_interval: Duration::from_secs(60),
            offline_threshold: 3,
            retry_attempts: 1,
            retry_backoff: Duration::from_millis(5),
            duplicate_ack_mode: DuplicateAckMode::DuplicateCode,
            enable_heartbeat: false,
        }
    }

    /// Scripted device side of a fake pair: records every decoded frame
    /// and, when enabled, acknowledges host A0/A1 with BF(OK).
    struct Device {
        port: Arc<FakeSerialPort>,
        frames: Arc<Mutex<Vec<Frame>>>,
    }

    impl Device {
        fn new(port: Arc<FakeSerialPort>, auto_ack: bool) -> Device {
            Device::with_ack_filter(port, auto_ack, |_| true)
        }

        /// `ack_when` decides, per received ack-able frame ordinal, whether
        /// a BF is sent back.
        fn with_ack_filter(
            port: Arc<FakeSerialPort>,
            auto_ack: bool,
            ack_when: impl Fn(usize) -> bool + Send + Sync + 'static,
        ) -> Device {
            let frames: Arc<Mutex<Vec<Frame>>> = Arc::new(Mutex::new(Vec::new()));
            let buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
            let ackable = Arc::new(Mutex::new(0usize));
            let sink = Arc::clone(&frames);
            let writer = Arc::clone(&port);
            port.set_rx_callback(Arc::new(move |data: &[u8]| {
                let decoded = {
                    let mut buf = buf.lock().unwrap();
                    buf.extend_from_slice(data);
                    decode_stream(&mut buf, |_, _| {}, |_| {})
                };
                for frame in decoded {
                    let is_ackable = matches!(frame.frame_type, FrameType::A0 | FrameType::A1);
                    let seq = frame.seq;
                    sink.lock().unwrap().push(frame);
                    if auto_ack && is_ackable {
                        let ordinal = {
                            let mut n = ackable.lock().unwrap();
                            let v = *n;
                            *n += 1;
                            v
                        };
                        if ack_when(ordinal) {
                            let bf = Frame {
                                frame_type: FrameType::Bf,
                                seq,
                                val: vec![AckCode::Ok.wire()],
                            };
                            let _ = writer.write_bytes(&encode_frame(&bf));
                        }
                    }
                }
            }));
            Device { port, frames }
        }

        fn send(&self, frame: &Frame) {
            self.port.write_bytes(&encode_frame(frame)).unwrap();
        }

        fn send_raw(&self, bytes: &[u8]) {
            self.port.write_bytes(bytes).unwrap();
        }

        fn frames_of(&self, frame_type: FrameType) -> Vec<Frame> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter(|f| f.frame_type == frame_type)
                .cloned()
                .collect()
        }
    }

    fn b1(seq: u16) -> Frame {
        Frame {
            frame_type: FrameType::B1,
            seq,
            val: Vec::new(),
        }
    }

    #[test]
    fn test_a1_happy_path() {
        let (host, peer) = FakeSerialPort::pair();
        let device = Device::new(peer, true);
        let session = Session::new(host, None, "s1", fast_opts());

        let payload = Payload {
            indices: vec![0x0001, 0x0002],
            attrs: None,
            colors: None,
        };
        assert!(session.send_a1_payload(&payload));
        assert_eq!(session.state(), SessionState::Connected);

        let sent = device.frames_of(FrameType::A1);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].val, vec![0x01, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn test_duplicate_b1_not_redispatched() {
        let (host, peer) = FakeSerialPort::pair();
        let device = Device::new(peer, true);
        let calls = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&calls);
        let handler: RequestHandler = Box::new(move || {
            *counter.lock().unwrap() += 1;
            Payload {
                indices: vec![7],
                attrs: None,
                colors: None,
            }
        });
        let session = Session::new(host, Some(handler), "s2", fast_opts());

        device.send(&b1(7));
        device.send(&b1(7));
        drop(session);

        assert_eq!(*calls.lock().unwrap(), 1);
        let afs = device.frames_of(FrameType::Af);
        assert_eq!(afs.len(), 2);
        assert_eq!(afs[0].seq, 7);
        assert_eq!(afs[0].val, vec![0x00]);
        assert_eq!(afs[1].seq, 7);
        assert_eq!(afs[1].val, vec![0x02]); // DUPLICATE
    }

    #[test]
    fn test_out_of_order_b1() {
        let (host, peer) = FakeSerialPort::pair();
        let device = Device::new(peer, true);
        let calls = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&calls);
        let handler: RequestHandler = Box::new(move || {
            *counter.lock().unwrap() += 1;
            Payload::empty()
        });
        let session = Session::new(host, Some(handler), "s3", fast_opts());

        device.send(&b1(5));
        device.send(&b1(7));
        device.send(&b1(4));
        drop(session);

        // Only the in-order request reached the handler.
        assert_eq!(*calls.lock().unwrap(), 1);
        let afs = device.frames_of(FrameType::Af);
        assert_eq!(afs.len(), 3);
        assert_eq!((afs[0].seq, afs[0].val[0]), (5, 0x00));
        assert_eq!((afs[1].seq, afs[1].val[0]), (7, 0x04)); // SEQ_TOO_LARGE
        assert_eq!((afs[2].seq, afs[2].val[0]), (4, 0x03)); // SEQ_TOO_SMALL
    }

    #[test]
    fn test_duplicate_echo_last_mode() {
        let (host, peer) = FakeSerialPort::pair();
        let device = Device::new(peer, true);
        let mut opts = fast_opts();
        opts.duplicate_ack_mode = DuplicateAckMode::EchoLast;
        let _session = Session::new(host, None, "s-echo", opts);

        device.send(&b1(5)); // in-order, AF 0x00
        device.send(&b1(9)); // out of order, AF 0x04 recorded
        device.send(&b1(5)); // duplicate of last accepted: echoes 0x04

        let afs = device.frames_of(FrameType::Af);
        assert_eq!(afs.len(), 3);
        assert_eq!(afs[2].seq, 5);
        assert_eq!(afs[2].val, vec![0x04]);
    }

    #[test]
    fn test_checksum_corruption_answered_and_recovered() {
        let (host, peer) = FakeSerialPort::pair();
        let device = Device::new(peer, true);
        let session = Session::new(host, None, "s4", fast_opts());

        let mut corrupt = encode_frame(&b1(9));
        let last = corrupt.len() - 1;
        corrupt[last] = corrupt[last].wrapping_add(1);
        device.send_raw(&corrupt);

        let afs = device.frames_of(FrameType::Af);
        assert_eq!(afs.len(), 1);
        assert_eq!((afs[0].seq, afs[0].val[0]), (9, 0x06)); // CHECKSUM_ERROR

        // Subsequent traffic parses normally.
        device.send(&Frame {
            frame_type: FrameType::B0,
            seq: 10,
            val: Vec::new(),
        });
        assert_eq!(session.state(), SessionState::Connected);
        let afs = device.frames_of(FrameType::Af);
        assert_eq!((afs[1].seq, afs[1].val[0]), (10, 0x00));
    }

    #[test]
    fn test_heartbeat_ack_connects() {
        let (host, peer) = FakeSerialPort::pair();
        let _device = Device::new(peer, true);
        let session = Session::new(host, None, "s-hb", fast_opts());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.send_heartbeat(None));
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.offline_failures(), 0);
    }

    #[test]
    fn test_offline_after_consecutive_timeouts_then_recovery() {
        let (host, peer) = FakeSerialPort::pair();
        let device = Device::new(peer, false); // never acks
        let mut opts = fast_opts();
        opts.ack_timeout = Duration::from_millis(10);
        opts.offline_threshold = 2;
        let session = Session::new(host, None, "s-off", opts);

        assert!(!session.send_heartbeat(None));
        assert_eq!(session.offline_failures(), 1);
        assert!(!session.send_heartbeat(None));
        assert_eq!(session.offline_failures(), 2);
        assert_eq!(session.state(), SessionState::Offline);

        // Any valid device frame restores the link.
        device.send(&Frame {
            frame_type: FrameType::B0,
            seq: 1,
            val: Vec::new(),
        });
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.offline_failures(), 0);
    }

    #[test]
    fn test_retry_succeeds_on_second_attempt() {
        let (host, peer) = FakeSerialPort::pair();
        // Drop the first ack-able frame, answer from the second on.
        let device = Device::with_ack_filter(peer, true, |ordinal| ordinal >= 1);
        let mut opts = fast_opts();
        opts.retry_attempts = 3;
        opts.ack_timeout = Duration::from_millis(15);
        let session = Session::new(host, None, "s-retry", opts);

        assert!(session.send_heartbeat(None));
        // Both attempts carried the same sequence number.
        let beats = device.frames_of(FrameType::A0);
        assert_eq!(beats.len(), 2);
        assert_eq!(beats[0].seq, beats[1].seq);
    }

    #[test]
    fn test_a1_fragmentation() {
        let (host, peer) = FakeSerialPort::pair();
        let device = Device::new(peer, true);
        let mut opts = fast_opts();
        opts.bytes_per_frame = 4; // two items per frame
        let session = Session::new(host, None, "s-frag", opts);

        let payload = Payload {
            indices: vec![1, 2, 3, 4, 5],
            attrs: Some(vec![1, 0, 0, 0, 1]),
            colors: Some(vec![0, 0, 1, 1, 2]),
        };
        assert!(session.send_a1_payload(&payload));

        let chunks = device.frames_of(FrameType::A1);
        assert_eq!(chunks.len(), 3);
        let lens: Vec<usize> = chunks.iter().map(|f| f.val.len()).collect();
        assert_eq!(lens, vec![4, 4, 2]);
        // Sequences are fresh and strictly increasing.
        assert!(chunks.windows(2).all(|w| w[1].seq == w[0].seq + 1));
        // The tail item keeps its attribute and color through slicing.
        let tail = u16::from_le_bytes([chunks[2].val[0], chunks[2].val[1]]);
        let item = crate::protocol::A1Item::unpack(tail);
        assert_eq!(item.led_id, 5);
        assert!(item.blink);
        assert_eq!(item.color, 2);
    }

    #[test]
    fn test_empty_payload_still_sends_one_frame() {
        let (host, peer) = FakeSerialPort::pair();
        let device = Device::new(peer, true);
        let session = Session::new(host, None, "s-empty", fast_opts());
        let outcomes: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        session.set_on_a1_result(Box::new(move |ok| sink.lock().unwrap().push(ok)));

        assert!(session.send_a1_payload(&Payload::empty()));
        let chunks = device.frames_of(FrameType::A1);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].val.is_empty());
        assert_eq!(*outcomes.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_b1_drives_handler_payload_and_result_hook() {
        let (host, peer) = FakeSerialPort::pair();
        let device = Device::new(peer, true);
        let handler: RequestHandler = Box::new(|| Payload {
            indices: vec![3, 6],
            attrs: None,
            colors: Some(vec![0, 1]),
        });
        let session = Session::new(host, Some(handler), "s-flow", fast_opts());
        let outcomes: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        session.set_on_a1_result(Box::new(move |ok| sink.lock().unwrap().push(ok)));

        device.send(&b1(0));

        let a1s = device.frames_of(FrameType::A1);
        assert_eq!(a1s.len(), 1);
        let first = crate::protocol::A1Item::unpack(u16::from_le_bytes([
            a1s[0].val[0],
            a1s[0].val[1],
        ]));
        let second = crate::protocol::A1Item::unpack(u16::from_le_bytes([
            a1s[0].val[2],
            a1s[0].val[3],
        ]));
        assert_eq!((first.led_id, first.color), (3, 0));
        assert_eq!((second.led_id, second.color), (6, 1));
        assert_eq!(*outcomes.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_garbage_does_not_disturb_protocol() {
        let (host, peer) = FakeSerialPort::pair();
        let device = Device::new(peer, true);
        let session = Session::new(host, None, "s-noise", fast_opts());
        device.send_raw(b"hello from bootloader\r\n");
        device.send(&Frame {
            frame_type: FrameType::B0,
            seq: 0,
            val: Vec::new(),
        });
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_periodic_heartbeat_scheduler() {
        let (host, peer) = FakeSerialPort::pair();
        let device = Device::new(peer, true);
        let mut opts = fast_opts();
        opts.enable_heartbeat = true;
        opts.heartbeat_interval = Duration::from_millis(20);
        let session = Session::new(host, None, "s-sched", opts);
        std::thread::sleep(Duration::from_millis(120));
        session.stop_heartbeat();
        let beats = device.frames_of(FrameType::A0).len();
        assert!(beats >= 3, "expected several heartbeats, got {beats}");
        std::thread::sleep(Duration::from_millis(60));
        let after_stop = device.frames_of(FrameType::A0).len();
        assert!(after_stop <= beats + 1, "scheduler kept beating after stop");
    }
}

//! ledlink - Upper-Computer LED Matrix Controller
//!
//! This library drives an LED matrix display over a framed binary serial
//! protocol. Job files describing colored "paintings" are ingested from a
//! watch directory, assembled into RGB triplets, remapped from slot
//! positions to physical LED identifiers, and streamed to the device with
//! heartbeats, acknowledgements, and retries.
//!
//! # Architecture
//!
//! - **Codec** ([`protocol`]): frame encode/decode with checksum and
//!   per-type payload validation over an append-only receive buffer
//! - **Transport** ([`transport`]): duplex byte I/O with an RX callback;
//!   a real serial adapter and an in-memory pair for tests
//! - **Mapping** ([`mapping`]): SP table parsing and the serpentine,
//!   block-offset SP→LED remap
//! - **Pipeline** ([`ingress`], [`grouping`], [`dispatcher`]): atomic
//!   two-phase file ingress, triplet grouping, dispatch and archiving
//! - **Session** ([`session`]): the protocol state machine with heartbeat
//!   scheduling, ACK wait/retry, and B1 sequence discipline
//!
//! # Quick Start
//!
//! ```no_run
//! use ledlink::config::Config;
//! use ledlink::session::{Session, SessionOptions};
//! use ledlink::transport::FakeSerialPort;
//!
//! let cfg = Config::default();
//! let (port, _peer) = FakeSerialPort::pair();
//! let session = Session::new(port, None, "demo", SessionOptions::from_comm(&cfg.comm));
//! session.send_heartbeat(None);
//! ```
//!
//! Data flows `watch/` → ingress → `work/` → grouping → dispatcher →
//! session → device, with device verdicts archiving each triplet to
//! `done/` or `error/`.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod grouping;
pub mod ingress;
pub mod mapping;
pub mod printer;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{LedlinkError, Result};
pub use grouping::{Color, Grouping, Triplet};
pub use ingress::Ingress;
pub use mapping::{Mapper, Payload};
pub use protocol::{AckCode, Frame, FrameType};
pub use session::{Session, SessionOptions, SessionState};
pub use transport::{FakeSerialPort, Transport};

/// Get version information for this library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

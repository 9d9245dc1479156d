//! Low-latency market-data ingestion: UDP multicast capture, ITCH 5.0
//! decoding into canonical records, per-instrument limit order books, and
//! lock-free fan-out to in-process subscribers.
//!
//! The pipeline runs on three named threads. The capture thread recv()s
//! datagrams into pooled slots and hands slot indices through an SPSC
//! ring; the decode thread turns packets into [`types::NormalizedMessage`]
//! records, maintains the books, and copies each record into every
//! subscriber's private ring; the dispatch thread drains those rings and
//! runs the subscriber callbacks. Nothing on the message path takes a
//! lock.

pub mod affinity;
pub mod book;
pub mod capture;
pub mod clock;
pub mod decoder;
pub mod dispatch;
pub mod engine;
pub mod hw;
pub mod pool;
pub mod ring;
pub mod stats;
pub mod types;

pub use crate::book::{Order, OrderBook, PriceLevel};
pub use crate::capture::{CaptureConfig, UdpCapture};
pub use crate::decoder::{Decoder, DecoderRegistry, Itch50Decoder};
pub use crate::dispatch::{ClosureSubscriber, Dispatcher, Subscriber};
pub use crate::engine::{Engine, EngineConfig, EngineStatistics};
pub use crate::pool::ObjectPool;
pub use crate::ring::{MpscRing, SpscRing};
pub use crate::stats::{LatencyRecorder, LatencyStats};
pub use crate::types::{
    InstrumentId, MessageKind, NormalizedMessage, OrderId, PacketView, Price, Quantity, Side,
};

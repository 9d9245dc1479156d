//! Hardware-offload adapter boundary.
//!
//! An accelerator (FPGA NIC, kernel-bypass card) can mirror the book feed
//! over a fixed 64-byte message. The engine treats the adapter as optional
//! and runs software-only when none is present; this module defines the
//! wire shape and the [`Offload`] capability plus the no-op fallback.

use crate::types::{InstrumentId, Price, Quantity, Side};
use bytemuck::{Pod, Zeroable};

/// Fixed 64-byte frame exchanged with an offload device, one cache line.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, align(64))]
pub struct HwMessage {
    pub sequence_number: u64,
    pub hw_timestamp: u64,
    pub command: u8,
    pub kind: u8,
    pub _pad0: [u8; 2],
    pub instrument_id: InstrumentId,
    pub error_code: u32,
    pub _pad1: [u8; 4],
    /// Interpreted per `kind`; see [`HwOrderPayload`] and [`HwQuotePayload`].
    pub payload: [u8; 32],
}

#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct HwOrderPayload {
    pub price: Price,
    pub quantity: Quantity,
    pub order_id: u64,
    pub side: u8,
    pub _pad: [u8; 7],
}

#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct HwQuotePayload {
    pub bid_price: Price,
    pub bid_quantity: Quantity,
    pub ask_price: Price,
    pub ask_quantity: Quantity,
}

impl HwMessage {
    pub fn order_payload(&self) -> HwOrderPayload {
        bytemuck::pod_read_unaligned(&self.payload)
    }

    pub fn quote_payload(&self) -> HwQuotePayload {
        bytemuck::pod_read_unaligned(&self.payload)
    }

    pub fn set_order_payload(&mut self, payload: HwOrderPayload) {
        self.payload = bytemuck::cast(payload);
    }

    pub fn set_quote_payload(&mut self, payload: HwQuotePayload) {
        self.payload = bytemuck::cast(payload);
    }
}

impl Default for HwMessage {
    fn default() -> Self {
        Self::zeroed()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HwQuote {
    pub bid_price: Price,
    pub bid_quantity: Quantity,
    pub ask_price: Price,
    pub ask_quantity: Quantity,
    pub valid: bool,
}

/// Capability surface of an offload device. All calls are non-blocking;
/// false means the device refused or had nothing to deliver.
pub trait Offload: Send {
    fn send(&mut self, msg: &HwMessage) -> bool;

    fn recv(&mut self, msg: &mut HwMessage) -> bool;

    fn best_quote(&self, instrument: InstrumentId, out: &mut HwQuote) -> bool;

    fn send_batch(&mut self, msgs: &[HwMessage]) -> usize {
        let mut sent = 0;
        for msg in msgs {
            if !self.send(msg) {
                break;
            }
            sent += 1;
        }
        sent
    }

    fn recv_batch(&mut self, out: &mut [HwMessage]) -> usize {
        let mut received = 0;
        for msg in out.iter_mut() {
            if !self.recv(msg) {
                break;
            }
            received += 1;
        }
        received
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Software-only stand-in used when no accelerator is configured. Accepts
/// and discards sends; never produces messages or quotes.
#[derive(Default)]
pub struct SoftwareOffload {
    accepted: u64,
}

impl SoftwareOffload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }
}

impl Offload for SoftwareOffload {
    fn send(&mut self, _msg: &HwMessage) -> bool {
        self.accepted += 1;
        true
    }

    fn recv(&mut self, _msg: &mut HwMessage) -> bool {
        false
    }

    fn best_quote(&self, _instrument: InstrumentId, out: &mut HwQuote) -> bool {
        *out = HwQuote::default();
        false
    }
}

/// Build an order-shaped offload frame.
pub fn order_message(
    sequence: u64,
    instrument: InstrumentId,
    order_id: u64,
    price: Price,
    quantity: Quantity,
    side: Side,
) -> HwMessage {
    let mut msg = HwMessage {
        sequence_number: sequence,
        instrument_id: instrument,
        ..Default::default()
    };
    msg.set_order_payload(HwOrderPayload {
        price,
        quantity,
        order_id,
        side: side as u8,
        _pad: [0; 7],
    });
    msg
}

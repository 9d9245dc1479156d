//! NASDAQ TotalView-ITCH 5.0 decoding.
//!
//! A packet is a back-to-back sequence of frames, each a 2-byte big-endian
//! length (which counts itself) followed by the message. Every message
//! starts with the common header: stock locate (u16), tracking number
//! (u16), timestamp (u64, nanoseconds since midnight), then the ASCII
//! message type at offset 12. All integers are big-endian.

use super::{Decoder, DecoderStats};
use crate::types::{
    InstrumentId, MessageKind, NormalizedMessage, PacketView, Side, wire_price_to_internal,
};
use hashbrown::HashMap;

const HEADER_SIZE: usize = 13;

// Message sizes excluding the 2-byte framing length.
const SYSTEM_EVENT_SIZE: usize = 14;
const STOCK_DIRECTORY_SIZE: usize = 41;
const ADD_ORDER_SIZE: usize = 38;
const ADD_ORDER_MPID_SIZE: usize = 42;
const ORDER_EXECUTED_SIZE: usize = 33;
const ORDER_EXECUTED_PRICE_SIZE: usize = 38;
const ORDER_CANCEL_SIZE: usize = 25;
const ORDER_DELETE_SIZE: usize = 21;
const ORDER_REPLACE_SIZE: usize = 37;
const TRADE_SIZE: usize = 46;

#[inline]
fn be_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

#[inline]
fn be_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
fn be_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

#[inline]
fn side_from_indicator(indicator: u8) -> Side {
    match indicator {
        b'B' => Side::Buy,
        b'S' => Side::Sell,
        _ => Side::Invalid,
    }
}

/// Session phase markers carried by 'S' frames. The raw code rides in the
/// normalized record's quantity field; this gives it a name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemEventCode {
    StartOfMessages = b'O',
    StartOfSystemHours = b'S',
    StartOfMarketHours = b'Q',
    EndOfMarketHours = b'M',
    EndOfSystemHours = b'E',
    EndOfMessages = b'C',
}

impl SystemEventCode {
    pub fn from_u8(raw: u8) -> Option<SystemEventCode> {
        match raw {
            b'O' => Some(SystemEventCode::StartOfMessages),
            b'S' => Some(SystemEventCode::StartOfSystemHours),
            b'Q' => Some(SystemEventCode::StartOfMarketHours),
            b'M' => Some(SystemEventCode::EndOfMarketHours),
            b'E' => Some(SystemEventCode::EndOfSystemHours),
            b'C' => Some(SystemEventCode::EndOfMessages),
            _ => None,
        }
    }
}

/// Stock-locate interning. Directory ('R') frames bind a locate to its
/// 8-byte space-padded symbol; a locate seen before its directory entry
/// gets the deterministic synthetic id `locate as InstrumentId`.
#[derive(Default)]
pub struct SymbolTable {
    by_locate: HashMap<u16, InstrumentId>,
    names: HashMap<InstrumentId, [u8; 8]>,
    by_name: HashMap<[u8; 8], InstrumentId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn intern(&mut self, locate: u16) -> InstrumentId {
        *self
            .by_locate
            .entry(locate)
            .or_insert(locate as InstrumentId)
    }

    pub fn record_directory(&mut self, locate: u16, symbol: [u8; 8]) -> InstrumentId {
        let id = self.intern(locate);
        self.names.insert(id, symbol);
        self.by_name.insert(symbol, id);
        id
    }

    pub fn symbol(&self, id: InstrumentId) -> Option<&[u8; 8]> {
        self.names.get(&id)
    }

    /// Reverse lookup; `symbol` is right-padded with spaces to 8 bytes.
    pub fn resolve(&self, symbol: &str) -> Option<InstrumentId> {
        let bytes = symbol.as_bytes();
        if bytes.len() > 8 {
            return None;
        }
        let mut padded = [b' '; 8];
        padded[..bytes.len()].copy_from_slice(bytes);
        self.by_name.get(&padded).copied()
    }

    pub fn len(&self) -> usize {
        self.by_locate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_locate.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_locate.clear();
        self.names.clear();
        self.by_name.clear();
    }
}

pub struct Itch50Decoder {
    symbols: SymbolTable,
    /// Last tracking number per locate, for gap observation.
    tracking: HashMap<u16, u16>,
    check_sequences: bool,
    messages_parsed: u64,
    parse_errors: u64,
    sequence_gaps: u64,
}

impl Itch50Decoder {
    pub fn new() -> Self {
        Self {
            symbols: SymbolTable::new(),
            tracking: HashMap::new(),
            check_sequences: false,
            messages_parsed: 0,
            parse_errors: 0,
            sequence_gaps: 0,
        }
    }

    pub fn with_sequence_checking(mut self, enabled: bool) -> Self {
        self.check_sequences = enabled;
        self
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    fn observe_tracking(&mut self, locate: u16, tracking: u16) {
        if !self.check_sequences {
            return;
        }
        if let Some(last) = self.tracking.insert(locate, tracking) {
            if last.wrapping_add(1) != tracking {
                self.sequence_gaps += 1;
            }
        }
    }

    /// Decode one message (framing already stripped). `None` means either
    /// an unsupported type (skipped silently) or a validation failure
    /// (counted).
    fn decode_message(
        &mut self,
        body: &[u8],
        packet: &PacketView<'_>,
    ) -> Option<NormalizedMessage> {
        if body.len() < HEADER_SIZE {
            self.parse_errors += 1;
            return None;
        }

        let locate = be_u16(body, 0);
        let tracking = be_u16(body, 2);
        let exchange_timestamp = be_u64(body, 4);
        let message_type = body[12];

        let mut msg = NormalizedMessage::default();
        msg.exchange_timestamp = exchange_timestamp;
        msg.local_timestamp = packet.timestamp;
        msg.sequence = packet.sequence;

        let ok = match message_type {
            b'S' => self.decode_system_event(body, &mut msg),
            b'R' => self.decode_stock_directory(body, locate, &mut msg),
            b'A' => self.decode_add_order(body, locate, false, &mut msg),
            b'F' => self.decode_add_order(body, locate, true, &mut msg),
            b'E' => self.decode_order_executed(body, locate, false, &mut msg),
            b'C' => self.decode_order_executed(body, locate, true, &mut msg),
            b'X' => self.decode_order_cancel(body, locate, &mut msg),
            b'D' => self.decode_order_delete(body, locate, &mut msg),
            b'U' => self.decode_order_replace(body, locate, &mut msg),
            b'P' => self.decode_trade(body, locate, &mut msg),
            // Unsupported type: advance past the frame, no record, no error.
            _ => return None,
        };

        if !ok {
            self.parse_errors += 1;
            return None;
        }
        self.observe_tracking(locate, tracking);
        Some(msg)
    }

    fn decode_system_event(&mut self, body: &[u8], msg: &mut NormalizedMessage) -> bool {
        if body.len() < SYSTEM_EVENT_SIZE {
            return false;
        }
        msg.set_kind(MessageKind::SystemEvent);
        // System events are session-wide, not instrument-specific; the
        // event code rides in the quantity field.
        msg.instrument_id = 0;
        msg.quantity = body[13] as u64;
        true
    }

    fn decode_stock_directory(
        &mut self,
        body: &[u8],
        locate: u16,
        msg: &mut NormalizedMessage,
    ) -> bool {
        if body.len() < STOCK_DIRECTORY_SIZE {
            return false;
        }
        let mut symbol = [0u8; 8];
        symbol.copy_from_slice(&body[13..21]);
        let id = self.symbols.record_directory(locate, symbol);

        msg.set_kind(MessageKind::SystemEvent);
        msg.instrument_id = id;
        true
    }

    fn decode_add_order(
        &mut self,
        body: &[u8],
        locate: u16,
        with_mpid: bool,
        msg: &mut NormalizedMessage,
    ) -> bool {
        let required = if with_mpid {
            ADD_ORDER_MPID_SIZE
        } else {
            ADD_ORDER_SIZE
        };
        if body.len() < required {
            return false;
        }

        msg.set_kind(MessageKind::OrderAdd);
        msg.instrument_id = self.symbols.intern(locate);
        msg.order_id = be_u64(body, 13);
        msg.set_side(side_from_indicator(body[21]));
        msg.quantity = be_u32(body, 22) as u64;
        // Stock symbol at 26..34 duplicates the directory mapping; the
        // trailing 4-byte MPID attribution on 'F' is discarded.
        msg.price = wire_price_to_internal(be_u32(body, 34));
        true
    }

    fn decode_order_executed(
        &mut self,
        body: &[u8],
        locate: u16,
        with_price: bool,
        msg: &mut NormalizedMessage,
    ) -> bool {
        let required = if with_price {
            ORDER_EXECUTED_PRICE_SIZE
        } else {
            ORDER_EXECUTED_SIZE
        };
        if body.len() < required {
            return false;
        }

        msg.set_kind(MessageKind::OrderExecute);
        msg.instrument_id = self.symbols.intern(locate);
        msg.order_id = be_u64(body, 13);
        msg.quantity = be_u32(body, 21) as u64;
        // Match number at 25..33 is not carried in the normalized record.
        if with_price {
            msg.price = wire_price_to_internal(be_u32(body, 34));
        }
        true
    }

    fn decode_order_cancel(
        &mut self,
        body: &[u8],
        locate: u16,
        msg: &mut NormalizedMessage,
    ) -> bool {
        if body.len() < ORDER_CANCEL_SIZE {
            return false;
        }
        // Partial reduction: quantity carries the cancelled share count.
        msg.set_kind(MessageKind::OrderModify);
        msg.instrument_id = self.symbols.intern(locate);
        msg.order_id = be_u64(body, 13);
        msg.quantity = be_u32(body, 21) as u64;
        true
    }

    fn decode_order_delete(
        &mut self,
        body: &[u8],
        locate: u16,
        msg: &mut NormalizedMessage,
    ) -> bool {
        if body.len() < ORDER_DELETE_SIZE {
            return false;
        }
        msg.set_kind(MessageKind::OrderDelete);
        msg.instrument_id = self.symbols.intern(locate);
        msg.order_id = be_u64(body, 13);
        true
    }

    fn decode_order_replace(
        &mut self,
        body: &[u8],
        locate: u16,
        msg: &mut NormalizedMessage,
    ) -> bool {
        if body.len() < ORDER_REPLACE_SIZE {
            return false;
        }
        // The record carries the replacement order: new reference, new
        // shares, new price. The original reference (13..21) does not fit
        // the normalized shape and is dropped.
        msg.set_kind(MessageKind::OrderModify);
        msg.instrument_id = self.symbols.intern(locate);
        msg.order_id = be_u64(body, 21);
        msg.quantity = be_u32(body, 29) as u64;
        msg.price = wire_price_to_internal(be_u32(body, 33));
        true
    }

    fn decode_trade(&mut self, body: &[u8], locate: u16, msg: &mut NormalizedMessage) -> bool {
        if body.len() < TRADE_SIZE {
            return false;
        }
        msg.set_kind(MessageKind::Trade);
        msg.instrument_id = self.symbols.intern(locate);
        msg.order_id = be_u64(body, 13);
        msg.set_side(side_from_indicator(body[21]));
        msg.quantity = be_u32(body, 22) as u64;
        msg.price = wire_price_to_internal(be_u32(body, 34));
        true
    }
}

impl Default for Itch50Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for Itch50Decoder {
    fn parse(&mut self, packet: &PacketView<'_>, out: &mut [NormalizedMessage]) -> usize {
        if !packet.is_valid() || out.is_empty() {
            return 0;
        }

        let data = packet.data;
        let mut offset = 0;
        let mut emitted = 0;

        while data.len() - offset >= 3 && emitted < out.len() {
            let frame_len = be_u16(data, offset) as usize;
            if frame_len < 3 || frame_len > data.len() - offset {
                // Partial frame mid-packet: drop the tail, count once.
                self.parse_errors += 1;
                break;
            }

            let body = &data[offset + 2..offset + frame_len];
            if let Some(msg) = self.decode_message(body, packet) {
                out[emitted] = msg;
                emitted += 1;
            }
            offset += frame_len;
        }

        self.messages_parsed += emitted as u64;
        emitted
    }

    fn name(&self) -> &'static str {
        "ITCH-5.0"
    }

    fn reset(&mut self) {
        self.symbols.clear();
        self.tracking.clear();
        self.messages_parsed = 0;
        self.parse_errors = 0;
        self.sequence_gaps = 0;
    }

    fn stats(&self) -> DecoderStats {
        DecoderStats {
            messages_parsed: self.messages_parsed,
            parse_errors: self.parse_errors,
            sequence_gaps: self.sequence_gaps,
        }
    }
}

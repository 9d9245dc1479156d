use bytemuck::{Pod, Zeroable};

/// Fixed-point price, scaled by 10^8. Signed so spreads and deltas stay
/// representable without casts.
pub type Price = i64;
pub type Quantity = u64;
pub type OrderId = u64;
pub type MatchNumber = u64;
pub type InstrumentId = u32;
/// Nanoseconds. Exchange timestamps count from midnight, local timestamps
/// from process start (see [`crate::clock`]).
pub type Timestamp = u64;
pub type SequenceNumber = u64;

/// Internal price scale (10^-8 ticks).
pub const PRICE_SCALE: i64 = 100_000_000;
/// ITCH carries prices at 10^-4; multiply once at decode entry.
pub const WIRE_PRICE_MULTIPLIER: i64 = 10_000;

pub const INVALID_ORDER_ID: OrderId = 0;
pub const INVALID_INSTRUMENT_ID: InstrumentId = 0;
/// Spread sentinel when one side of the book is empty.
pub const SPREAD_UNAVAILABLE: Price = -1;

pub const CACHE_LINE_SIZE: usize = 64;
/// Jumbo-frame sized packet slots.
pub const MAX_PACKET_SIZE: usize = 9000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Side {
    /// Transient decode-failure state, never stored in a book.
    Invalid = 0,
    Buy = 1,
    Sell = 2,
}

impl Side {
    #[inline]
    pub fn from_u8(raw: u8) -> Side {
        match raw {
            1 => Side::Buy,
            2 => Side::Sell,
            _ => Side::Invalid,
        }
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Side::Invalid
    }

    #[inline]
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
            Side::Invalid => Side::Invalid,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Unknown = 0,
    Trade = 1,
    Quote = 2,
    OrderAdd = 3,
    OrderModify = 4,
    OrderDelete = 5,
    OrderExecute = 6,
    Imbalance = 7,
    SystemEvent = 8,
}

impl MessageKind {
    #[inline]
    pub fn from_u8(raw: u8) -> MessageKind {
        match raw {
            1 => MessageKind::Trade,
            2 => MessageKind::Quote,
            3 => MessageKind::OrderAdd,
            4 => MessageKind::OrderModify,
            5 => MessageKind::OrderDelete,
            6 => MessageKind::OrderExecute,
            7 => MessageKind::Imbalance,
            8 => MessageKind::SystemEvent,
            _ => MessageKind::Unknown,
        }
    }
}

/// Canonical record emitted by decoders and fanned out to subscribers.
///
/// Exactly one cache line, plain data only. Crosses ring boundaries by
/// value, so `kind` and `side` are stored raw with typed accessors.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, align(64))]
pub struct NormalizedMessage {
    pub kind: u8,
    pub side: u8,
    pub _pad0: [u8; 2],
    pub instrument_id: InstrumentId,
    pub order_id: OrderId,
    /// Internal 10^-8 scale.
    pub price: Price,
    pub quantity: Quantity,
    /// Exchange clock, nanoseconds since midnight.
    pub exchange_timestamp: Timestamp,
    /// Capture timestamp of the carrying packet.
    pub local_timestamp: Timestamp,
    /// Capture sequence of the carrying packet.
    pub sequence: SequenceNumber,
    pub _pad1: [u8; 8],
}

impl NormalizedMessage {
    #[inline]
    pub fn kind(&self) -> MessageKind {
        MessageKind::from_u8(self.kind)
    }

    #[inline]
    pub fn side(&self) -> Side {
        Side::from_u8(self.side)
    }

    #[inline]
    pub fn set_kind(&mut self, kind: MessageKind) {
        self.kind = kind as u8;
    }

    #[inline]
    pub fn set_side(&mut self, side: Side) {
        self.side = side as u8;
    }
}

impl Default for NormalizedMessage {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Raw datagram slot. Lives in the capture pool; rings carry slot indices,
/// never the 9KB payload.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, align(64))]
pub struct Packet {
    pub data: [u8; MAX_PACKET_SIZE],
    pub length: u32,
    pub _pad: [u8; 4],
    pub timestamp: Timestamp,
    pub sequence: SequenceNumber,
}

impl Packet {
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }
}

/// Borrowed window over a capture slot. Valid only until the slot is
/// released back to the capture pool.
#[derive(Clone, Copy, Debug)]
pub struct PacketView<'a> {
    pub data: &'a [u8],
    pub timestamp: Timestamp,
    pub sequence: SequenceNumber,
}

impl<'a> PacketView<'a> {
    #[inline]
    pub fn new(data: &'a [u8], timestamp: Timestamp, sequence: SequenceNumber) -> Self {
        Self {
            data,
            timestamp,
            sequence,
        }
    }

    #[inline]
    pub fn from_packet(packet: &'a Packet) -> Self {
        Self {
            data: packet.payload(),
            timestamp: packet.timestamp,
            sequence: packet.sequence,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.data.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Convert a wire price (10^-4) to the internal 10^-8 scale.
#[inline]
pub fn wire_price_to_internal(wire: u32) -> Price {
    wire as i64 * WIRE_PRICE_MULTIPLIER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_message_is_one_cache_line() {
        assert_eq!(size_of::<NormalizedMessage>(), 64);
        assert_eq!(align_of::<NormalizedMessage>(), 64);
    }

    #[test]
    fn packet_is_cache_line_multiple() {
        assert_eq!(size_of::<Packet>() % 64, 0);
    }

    #[test]
    fn side_round_trip() {
        assert_eq!(Side::from_u8(Side::Buy as u8), Side::Buy);
        assert_eq!(Side::from_u8(Side::Sell as u8), Side::Sell);
        assert_eq!(Side::from_u8(7), Side::Invalid);
        assert!(!Side::Invalid.is_valid());
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }

    #[test]
    fn kind_round_trip() {
        for raw in 0u8..=9 {
            let kind = MessageKind::from_u8(raw);
            if raw <= 8 {
                assert_eq!(kind as u8, raw);
            } else {
                assert_eq!(kind, MessageKind::Unknown);
            }
        }
    }

    #[test]
    fn wire_price_scaling() {
        // $150.0000 on the wire is 1_500_000 at 1e-4.
        assert_eq!(wire_price_to_internal(1_500_000), 15_000_000_000);
        assert_eq!(wire_price_to_internal(0), 0);
    }
}

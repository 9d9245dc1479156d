mod itch;

pub use itch::{Itch50Decoder, SymbolTable, SystemEventCode};

use crate::types::{MessageKind, NormalizedMessage, PacketView};
use hashbrown::HashMap;

#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderStats {
    pub messages_parsed: u64,
    pub parse_errors: u64,
    pub sequence_gaps: u64,
}

/// Wire-protocol decoder. One packet in, zero or more normalized records
/// out. Owned and driven by exactly one thread.
pub trait Decoder: Send {
    /// Write at most `out.len()` records, return the count written.
    /// Malformed framing is counted, never propagated.
    fn parse(&mut self, packet: &PacketView<'_>, out: &mut [NormalizedMessage]) -> usize;

    fn name(&self) -> &'static str;

    fn initialize(&mut self) {}

    fn reset(&mut self) {}

    fn stats(&self) -> DecoderStats {
        DecoderStats::default()
    }
}

/// Emits one SystemEvent record per packet carrying the payload length.
/// Useful for bring-up and wiring tests before a real protocol is chosen.
#[derive(Default)]
pub struct PassthroughDecoder {
    parsed: u64,
}

impl Decoder for PassthroughDecoder {
    fn parse(&mut self, packet: &PacketView<'_>, out: &mut [NormalizedMessage]) -> usize {
        if out.is_empty() || !packet.is_valid() {
            return 0;
        }
        let mut msg = NormalizedMessage::default();
        msg.set_kind(MessageKind::SystemEvent);
        msg.quantity = packet.len() as u64;
        msg.local_timestamp = packet.timestamp;
        msg.sequence = packet.sequence;
        out[0] = msg;
        self.parsed += 1;
        1
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn reset(&mut self) {
        self.parsed = 0;
    }

    fn stats(&self) -> DecoderStats {
        DecoderStats {
            messages_parsed: self.parsed,
            ..Default::default()
        }
    }
}

pub type DecoderFactory = fn() -> Box<dyn Decoder>;

/// Name to constructor table for multi-protocol builds. The engine owns at
/// most one decoder at a time and refuses to swap it while running.
pub struct DecoderRegistry {
    factories: HashMap<&'static str, DecoderFactory>,
}

impl DecoderRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry pre-seeded with the built-in decoders.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("ITCH-5.0", || Box::new(Itch50Decoder::new()));
        registry.register("passthrough", || Box::<PassthroughDecoder>::default());
        registry
    }

    /// Returns false when the name was already taken.
    pub fn register(&mut self, name: &'static str, factory: DecoderFactory) -> bool {
        match self.factories.entry(name) {
            hashbrown::hash_map::Entry::Occupied(_) => false,
            hashbrown::hash_map::Entry::Vacant(entry) => {
                entry.insert(factory);
                true
            }
        }
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn Decoder>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_creates_builtins() {
        let registry = DecoderRegistry::with_defaults();
        assert!(registry.contains("ITCH-5.0"));
        let decoder = registry.create("ITCH-5.0").unwrap();
        assert_eq!(decoder.name(), "ITCH-5.0");
        assert!(registry.create("FIX-4.2").is_none());
        assert_eq!(registry.names(), vec!["ITCH-5.0", "passthrough"]);
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = DecoderRegistry::with_defaults();
        assert!(!registry.register("ITCH-5.0", || Box::<PassthroughDecoder>::default()));
    }

    #[test]
    fn passthrough_echoes_packet_metadata() {
        let mut decoder = PassthroughDecoder::default();
        let payload = [1u8, 2, 3];
        let view = PacketView::new(&payload, 777, 42);
        let mut out = [NormalizedMessage::default(); 4];
        assert_eq!(decoder.parse(&view, &mut out), 1);
        assert_eq!(out[0].kind(), MessageKind::SystemEvent);
        assert_eq!(out[0].quantity, 3);
        assert_eq!(out[0].local_timestamp, 777);
        assert_eq!(out[0].sequence, 42);
        assert_eq!(decoder.stats().messages_parsed, 1);
    }

    #[test]
    fn passthrough_respects_empty_output() {
        let mut decoder = PassthroughDecoder::default();
        let payload = [1u8];
        let view = PacketView::new(&payload, 0, 0);
        assert_eq!(decoder.parse(&view, &mut []), 0);
    }
}

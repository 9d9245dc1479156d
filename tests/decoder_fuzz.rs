use proptest::prelude::*;
use tickflow::Itch50Decoder;
use tickflow::decoder::Decoder;
use tickflow::types::{NormalizedMessage, PacketView};

proptest! {
    /// Arbitrary bytes must never panic the decoder, and record counts
    /// stay within the framing bound (a frame needs at least 3 bytes).
    #[test]
    fn arbitrary_payloads_never_panic(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let mut decoder = Itch50Decoder::new();
        let view = PacketView::new(&payload, 1, 1);
        let mut out = [NormalizedMessage::default(); 512];
        let count = decoder.parse(&view, &mut out);
        prop_assert!(count <= payload.len() / 3);
    }

    /// Truncating a packet at an arbitrary point must keep every emitted
    /// record identical to a prefix of the full parse.
    #[test]
    fn truncation_yields_record_prefix(cut in 0usize..200) {
        let mut frames = Vec::new();
        for i in 0..8u64 {
            let mut msg = Vec::new();
            msg.extend_from_slice(&1u16.to_be_bytes());
            msg.extend_from_slice(&(i as u16).to_be_bytes());
            msg.extend_from_slice(&(1_000 + i).to_be_bytes());
            msg.push(b'D');
            msg.extend_from_slice(&(100 + i).to_be_bytes());
            let length = (msg.len() + 2) as u16;
            frames.extend_from_slice(&length.to_be_bytes());
            frames.extend_from_slice(&msg);
        }

        let full = {
            let mut decoder = Itch50Decoder::new();
            let view = PacketView::new(&frames, 1, 1);
            let mut out = [NormalizedMessage::default(); 16];
            let count = decoder.parse(&view, &mut out);
            out[..count].to_vec()
        };

        let cut = cut.min(frames.len());
        let mut decoder = Itch50Decoder::new();
        let view = PacketView::new(&frames[..cut], 1, 1);
        let mut out = [NormalizedMessage::default(); 16];
        let count = decoder.parse(&view, &mut out);

        prop_assert!(count <= full.len());
        for i in 0..count {
            prop_assert_eq!(out[i].order_id, full[i].order_id);
            prop_assert_eq!(out[i].kind, full[i].kind);
        }
    }
}

//! Drives the decoder and books with a generated ITCH session: directory
//! frames for a handful of symbols followed by a long randomized stream
//! of adds, executions, cancels and deletes, cross-checked against a
//! shadow model.

mod common;

use common::*;
use hashbrown::HashMap;
use std::sync::Arc;
use tickflow::book::{Order, OrderBook};
use tickflow::decoder::Decoder;
use tickflow::types::{MessageKind, NormalizedMessage, PacketView, Price, Quantity};
use tickflow::{Itch50Decoder, ObjectPool};

const SYMBOLS: [(u16, &str); 4] = [(1, "AAPL"), (2, "MSFT"), (3, "NVDA"), (4, "INTC")];

struct ModelOrder {
    locate: u16,
    price: Price,
    remaining: Quantity,
    buy: bool,
}

struct Xorshift(u64);

impl Xorshift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[test]
fn generated_session_keeps_books_consistent() {
    let mut rng = Xorshift(0x9E37_79B9_7F4A_7C15);
    let pool = Arc::new(ObjectPool::<Order>::new(65_536).unwrap());
    let mut decoder = Itch50Decoder::new().with_sequence_checking(false);
    let mut books: HashMap<u16, OrderBook> = SYMBOLS
        .iter()
        .map(|&(locate, _)| (locate, OrderBook::new(locate as u32, pool.clone())))
        .collect();
    let mut model: HashMap<u64, ModelOrder> = HashMap::new();

    // Session preamble: system start plus the directory.
    let mut frames = vec![system_event(0, 1, 0, b'O')];
    for &(locate, name) in &SYMBOLS {
        frames.push(stock_directory(locate, 1, 0, name));
    }

    let mut next_order_id = 1u64;
    let mut tracking = 2u16;
    for _ in 0..4_000 {
        let roll = rng.next();
        let live_ids: Vec<u64> = model.keys().copied().collect();

        if live_ids.is_empty() || roll % 10 < 4 {
            // Add a fresh order.
            let locate = SYMBOLS[(roll % 4) as usize].0;
            let buy = roll & 8 == 0;
            let price_wire = 9_000 + (rng.next() % 40) as u32 * 25;
            let shares = 1 + (rng.next() % 900) as u32;
            let id = next_order_id;
            next_order_id += 1;
            frames.push(add_order(
                locate,
                tracking,
                0,
                id,
                if buy { b'B' } else { b'S' },
                shares,
                SYMBOLS[(roll % 4) as usize].1,
                price_wire,
            ));
            model.insert(
                id,
                ModelOrder {
                    locate,
                    price: price_wire as i64 * 10_000,
                    remaining: shares as u64,
                    buy,
                },
            );
        } else {
            let id = live_ids[(rng.next() % live_ids.len() as u64) as usize];
            let order = model.get_mut(&id).unwrap();
            match roll % 10 {
                4..=5 => {
                    // Partial or full execution.
                    let executed = 1 + (rng.next() % order.remaining.max(1)) as u32;
                    frames.push(order_executed(order.locate, tracking, 0, id, executed, roll));
                    if executed as u64 >= order.remaining {
                        model.remove(&id);
                    } else {
                        order.remaining -= executed as u64;
                    }
                }
                6..=7 => {
                    // Partial cancel trims shares.
                    let cancelled = 1 + (rng.next() % order.remaining.max(1)) as u32;
                    frames.push(order_cancel(order.locate, tracking, 0, id, cancelled));
                    if cancelled as u64 >= order.remaining {
                        model.remove(&id);
                    } else {
                        order.remaining -= cancelled as u64;
                    }
                }
                _ => {
                    frames.push(order_delete(order.locate, tracking, 0, id));
                    model.remove(&id);
                }
            }
        }
        tracking = tracking.wrapping_add(1);
    }

    // Feed the stream in multi-frame packets, applying book-kind records
    // exactly the way the decode thread does.
    let total_frames = frames.len();
    let mut sequence = 0u64;
    let mut emitted = 0usize;
    for chunk in frames.chunks(8) {
        sequence += 1;
        let payload = packet(chunk);
        let view = PacketView::new(&payload, sequence * 1_000, sequence);
        let mut out = [NormalizedMessage::default(); 8];
        let count = decoder.parse(&view, &mut out);
        emitted += count;

        for msg in &out[..count] {
            if matches!(
                msg.kind(),
                MessageKind::OrderAdd
                    | MessageKind::OrderModify
                    | MessageKind::OrderExecute
                    | MessageKind::OrderDelete
            ) {
                let book = books.get_mut(&(msg.instrument_id as u16)).unwrap();
                assert!(book.apply(msg), "model only emits applicable mutations");
            }
        }

        if sequence % 64 == 0 {
            for book in books.values() {
                book.validate().unwrap();
            }
        }
    }

    // Every frame decodes to exactly one record, error free.
    assert_eq!(emitted, total_frames);
    let stats = decoder.stats();
    assert_eq!(stats.messages_parsed, total_frames as u64);
    assert_eq!(stats.parse_errors, 0);
    assert_eq!(decoder.symbols().len(), SYMBOLS.len());

    // Books agree with the shadow model, order by order.
    let mut live_per_book: HashMap<u16, usize> = HashMap::new();
    for (&id, expected) in &model {
        let book = &books[&expected.locate];
        let order = book
            .get_order(id)
            .unwrap_or_else(|| panic!("order {} missing from book {}", id, expected.locate));
        assert_eq!(order.quantity, expected.remaining);
        assert_eq!(order.price, expected.price);
        *live_per_book.entry(expected.locate).or_default() += 1;
    }
    for &(locate, _) in &SYMBOLS {
        let book = &books[&locate];
        assert_eq!(
            book.total_orders(),
            live_per_book.get(&locate).copied().unwrap_or(0)
        );
        book.validate().unwrap();

        // The touch matches the model's extremes.
        let best_bid = model
            .values()
            .filter(|o| o.locate == locate && o.buy)
            .map(|o| o.price)
            .max();
        let best_ask = model
            .values()
            .filter(|o| o.locate == locate && !o.buy)
            .map(|o| o.price)
            .min();
        assert_eq!(book.best_bid().map(|l| l.price), best_bid);
        assert_eq!(book.best_ask().map(|l| l.price), best_ask);
    }

    // Tear the session down and confirm the shared pool balances.
    for book in books.values_mut() {
        book.clear();
    }
    assert_eq!(pool.allocated_count(), 0);
}

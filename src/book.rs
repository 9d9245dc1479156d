use crate::clock::monotonic_ns;
use crate::pool::{NIL, ObjectPool};
use crate::types::{
    InstrumentId, MessageKind, NormalizedMessage, OrderId, Price, Quantity, SPREAD_UNAVAILABLE,
    Side, Timestamp,
};
use hashbrown::HashMap;
use std::sync::Arc;

pub const DEFAULT_MAX_PRICE_LEVELS: usize = 1000;

/// A resting order. Lives in the shared order pool; `prev`/`next` are pool
/// slot indices forming the FIFO chain of its price level.
#[derive(Clone, Copy, Debug)]
pub struct Order {
    pub id: OrderId,
    pub price: Price,
    pub quantity: Quantity,
    pub side: Side,
    pub timestamp: Timestamp,
    pub(crate) next: u32,
    pub(crate) prev: u32,
}

/// One price on one side: aggregate quantity plus the FIFO chain ends.
#[derive(Clone, Copy, Debug)]
pub struct PriceLevel {
    pub price: Price,
    pub total_quantity: Quantity,
    pub order_count: u32,
    pub(crate) head: u32,
    pub(crate) tail: u32,
}

impl PriceLevel {
    fn new(price: Price) -> Self {
        Self {
            price,
            total_quantity: 0,
            order_count: 0,
            head: NIL,
            tail: NIL,
        }
    }
}

/// One side of a book: a dense price-sorted array of levels plus a
/// price-to-position map. Inserts and removals shift the tail of the
/// array and re-point the moved entries.
struct BookSide {
    levels: Vec<PriceLevel>,
    index: HashMap<Price, usize>,
    /// Bids sort descending, asks ascending.
    descending: bool,
}

impl BookSide {
    fn new(descending: bool, max_levels: usize) -> Self {
        Self {
            levels: Vec::with_capacity(max_levels.min(4096)),
            index: HashMap::with_capacity(max_levels.min(4096)),
            descending,
        }
    }

    fn insertion_point(&self, price: Price) -> usize {
        if self.descending {
            self.levels.partition_point(|level| level.price > price)
        } else {
            self.levels.partition_point(|level| level.price < price)
        }
    }

    fn insert_level(&mut self, position: usize, price: Price) {
        self.levels.insert(position, PriceLevel::new(price));
        for i in position + 1..self.levels.len() {
            self.index.insert(self.levels[i].price, i);
        }
        self.index.insert(price, position);
    }

    fn remove_level(&mut self, position: usize) {
        let removed = self.levels.remove(position);
        self.index.remove(&removed.price);
        for i in position..self.levels.len() {
            self.index.insert(self.levels[i].price, i);
        }
    }

    fn clear(&mut self) {
        self.levels.clear();
        self.index.clear();
    }
}

/// Price-time priority book for a single instrument.
///
/// Exactly one thread mutates a book (enforced by `&mut self`); its order
/// slots come from the shared pool and belong to this book alone, which is
/// what makes the raw slot accesses below sound.
pub struct OrderBook {
    instrument: InstrumentId,
    max_levels: usize,
    bids: BookSide,
    asks: BookSide,
    orders: HashMap<OrderId, u32>,
    pool: Arc<ObjectPool<Order>>,
}

impl OrderBook {
    pub fn new(instrument: InstrumentId, pool: Arc<ObjectPool<Order>>) -> Self {
        Self::with_max_levels(instrument, pool, DEFAULT_MAX_PRICE_LEVELS)
    }

    pub fn with_max_levels(
        instrument: InstrumentId,
        pool: Arc<ObjectPool<Order>>,
        max_levels: usize,
    ) -> Self {
        assert!(max_levels > 0, "max_levels must be positive");
        Self {
            instrument,
            max_levels,
            bids: BookSide::new(true, max_levels),
            asks: BookSide::new(false, max_levels),
            orders: HashMap::with_capacity(1024),
            pool,
        }
    }

    #[inline]
    fn order_at(&self, idx: u32) -> &Order {
        unsafe { self.pool.slot(idx) }
    }

    #[inline]
    fn order_at_mut(&mut self, idx: u32) -> &mut Order {
        unsafe { self.pool.slot_mut(idx) }
    }

    #[inline]
    fn side_mut(&mut self, side: Side) -> &mut BookSide {
        match side {
            Side::Buy => &mut self.bids,
            _ => &mut self.asks,
        }
    }

    /// Rejects duplicate ids, zero quantity, non-positive prices, a full
    /// side, and pool exhaustion. All rejections leave the book unchanged.
    pub fn add_order(&mut self, id: OrderId, price: Price, quantity: Quantity, side: Side) -> bool {
        if !side.is_valid() || quantity == 0 || price <= 0 || self.orders.contains_key(&id) {
            return false;
        }

        let max_levels = self.max_levels;
        let side_book = self.side_mut(side);
        let (position, created_level) = match side_book.index.get(&price) {
            Some(&position) => (position, false),
            None => {
                if side_book.levels.len() >= max_levels {
                    return false;
                }
                let position = side_book.insertion_point(price);
                side_book.insert_level(position, price);
                (position, true)
            }
        };

        let order = Order {
            id,
            price,
            quantity,
            side,
            timestamp: monotonic_ns(),
            next: NIL,
            prev: NIL,
        };
        let Some(idx) = self.pool.construct(order) else {
            if created_level {
                self.side_mut(side).remove_level(position);
            }
            return false;
        };

        let tail = self.side_mut(side).levels[position].tail;
        if tail == NIL {
            let level = &mut self.side_mut(side).levels[position];
            level.head = idx;
            level.tail = idx;
        } else {
            self.order_at_mut(tail).next = idx;
            self.order_at_mut(idx).prev = tail;
            self.side_mut(side).levels[position].tail = idx;
        }

        let level = &mut self.side_mut(side).levels[position];
        level.total_quantity += quantity;
        level.order_count += 1;

        self.orders.insert(id, idx);
        true
    }

    /// Set an order's quantity. Zero means cancel. Price changes arrive as
    /// protocol replaces and are applied by the caller as delete-then-add.
    pub fn modify_order(&mut self, id: OrderId, new_quantity: Quantity) -> bool {
        if new_quantity == 0 {
            return self.cancel_order(id);
        }
        let Some(&idx) = self.orders.get(&id) else {
            return false;
        };

        let order = self.order_at_mut(idx);
        let old_quantity = order.quantity;
        order.quantity = new_quantity;
        order.timestamp = monotonic_ns();
        let (price, side) = (order.price, order.side);

        let side_book = self.side_mut(side);
        if let Some(&position) = side_book.index.get(&price) {
            let level = &mut side_book.levels[position];
            level.total_quantity = level.total_quantity - old_quantity + new_quantity;
        }
        true
    }

    /// Reduce an order by `quantity`; removes it when nothing remains.
    /// Covers executions and partial cancels.
    pub fn execute_order(&mut self, id: OrderId, quantity: Quantity) -> bool {
        let Some(&idx) = self.orders.get(&id) else {
            return false;
        };
        let remaining = self.order_at(idx).quantity;
        if quantity >= remaining {
            return self.cancel_order(id);
        }

        let order = self.order_at_mut(idx);
        order.quantity -= quantity;
        let (price, side) = (order.price, order.side);

        let side_book = self.side_mut(side);
        if let Some(&position) = side_book.index.get(&price) {
            side_book.levels[position].total_quantity -= quantity;
        }
        true
    }

    /// Remove an order entirely and return its slot to the pool. Empty
    /// levels are removed; no empty level is ever retained.
    pub fn cancel_order(&mut self, id: OrderId) -> bool {
        let Some(idx) = self.orders.remove(&id) else {
            return false;
        };
        let order = *self.order_at(idx);

        let Some(&position) = self.side_mut(order.side).index.get(&order.price) else {
            debug_assert!(false, "order {} has no level at price {}", id, order.price);
            self.pool.deallocate(idx);
            return false;
        };

        // Unlink from the FIFO chain.
        if order.prev != NIL {
            self.order_at_mut(order.prev).next = order.next;
        } else {
            self.side_mut(order.side).levels[position].head = order.next;
        }
        if order.next != NIL {
            self.order_at_mut(order.next).prev = order.prev;
        } else {
            self.side_mut(order.side).levels[position].tail = order.prev;
        }

        let side_book = self.side_mut(order.side);
        let level = &mut side_book.levels[position];
        level.total_quantity -= order.quantity;
        level.order_count -= 1;
        if level.order_count == 0 {
            side_book.remove_level(position);
        }

        self.pool.deallocate(idx);
        true
    }

    /// Apply a normalized record. Returns whether the book changed.
    /// Trades and system events never mutate the book.
    pub fn apply(&mut self, msg: &NormalizedMessage) -> bool {
        match msg.kind() {
            MessageKind::OrderAdd => {
                self.add_order(msg.order_id, msg.price, msg.quantity, msg.side())
            }
            // OrderModify carries a share reduction (protocol cancels and
            // replaces both normalize here; see decoder notes).
            MessageKind::OrderModify | MessageKind::OrderExecute => {
                self.execute_order(msg.order_id, msg.quantity)
            }
            MessageKind::OrderDelete => self.cancel_order(msg.order_id),
            _ => false,
        }
    }

    #[inline]
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.levels.first()
    }

    #[inline]
    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.levels.first()
    }

    #[inline]
    pub fn bid_level(&self, depth: usize) -> Option<&PriceLevel> {
        self.bids.levels.get(depth)
    }

    #[inline]
    pub fn ask_level(&self, depth: usize) -> Option<&PriceLevel> {
        self.asks.levels.get(depth)
    }

    #[inline]
    pub fn bid_depth(&self) -> usize {
        self.bids.levels.len()
    }

    #[inline]
    pub fn ask_depth(&self) -> usize {
        self.asks.levels.len()
    }

    /// Midpoint of the touch, or zero when either side is empty.
    pub fn mid_price(&self) -> Price {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => (bid.price + ask.price) / 2,
            _ => 0,
        }
    }

    /// Touch spread, or [`SPREAD_UNAVAILABLE`] when either side is empty.
    pub fn spread(&self) -> Price {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => ask.price - bid.price,
            _ => SPREAD_UNAVAILABLE,
        }
    }

    pub fn get_order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id).map(|&idx| self.order_at(idx))
    }

    #[inline]
    pub fn total_orders(&self) -> usize {
        self.orders.len()
    }

    #[inline]
    pub fn instrument(&self) -> InstrumentId {
        self.instrument
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Order ids at a level in time priority, oldest first.
    pub fn level_order_ids(&self, side: Side, depth: usize) -> Vec<OrderId> {
        let side_book = match side {
            Side::Buy => &self.bids,
            _ => &self.asks,
        };
        let mut ids = Vec::new();
        let Some(level) = side_book.levels.get(depth) else {
            return ids;
        };
        let mut cursor = level.head;
        while cursor != NIL && ids.len() <= level.order_count as usize {
            let order = self.order_at(cursor);
            ids.push(order.id);
            cursor = order.next;
        }
        ids
    }

    /// Remove every order and level, returning all slots to the pool.
    pub fn clear(&mut self) {
        for (_, idx) in self.orders.drain() {
            self.pool.deallocate(idx);
        }
        self.bids.clear();
        self.asks.clear();
    }

    /// Structural self-check of every invariant the book promises. Meant
    /// for tests and assertions, not the hot path.
    pub fn validate(&self) -> Result<(), String> {
        let mut chained_orders = 0usize;
        for (side_book, label) in [(&self.bids, "bid"), (&self.asks, "ask")] {
            let mut last_price: Option<Price> = None;
            for (position, level) in side_book.levels.iter().enumerate() {
                if let Some(last) = last_price {
                    let ordered = if side_book.descending {
                        level.price < last
                    } else {
                        level.price > last
                    };
                    if !ordered {
                        return Err(format!(
                            "{} levels not strictly ordered at depth {}: {} after {}",
                            label, position, level.price, last
                        ));
                    }
                }
                last_price = Some(level.price);

                if level.order_count == 0 {
                    return Err(format!("empty {} level retained at {}", label, level.price));
                }
                match side_book.index.get(&level.price) {
                    Some(&mapped) if mapped == position => {}
                    other => {
                        return Err(format!(
                            "{} price index for {} is {:?}, expected {}",
                            label, level.price, other, position
                        ));
                    }
                }

                // Walk the FIFO chain.
                let mut count = 0u32;
                let mut quantity: Quantity = 0;
                let mut cursor = level.head;
                let mut prev = NIL;
                while cursor != NIL {
                    if count > level.order_count {
                        return Err(format!("cycle in {} chain at {}", label, level.price));
                    }
                    let order = self.order_at(cursor);
                    if order.price != level.price {
                        return Err(format!(
                            "order {} price {} differs from level {}",
                            order.id, order.price, level.price
                        ));
                    }
                    if order.prev != prev {
                        return Err(format!("broken prev link at order {}", order.id));
                    }
                    if self.orders.get(&order.id) != Some(&cursor) {
                        return Err(format!("order {} not indexed to its slot", order.id));
                    }
                    count += 1;
                    quantity += order.quantity;
                    prev = cursor;
                    cursor = order.next;
                }
                if prev != level.tail {
                    return Err(format!("tail mismatch at {} level {}", label, level.price));
                }
                if count != level.order_count {
                    return Err(format!(
                        "{} level {} counts {} orders, chain has {}",
                        label, level.price, level.order_count, count
                    ));
                }
                if quantity != level.total_quantity {
                    return Err(format!(
                        "{} level {} quantity {} != chain sum {}",
                        label, level.price, level.total_quantity, quantity
                    ));
                }
                chained_orders += count as usize;
            }
            if side_book.index.len() != side_book.levels.len() {
                return Err(format!("{} price index has stale entries", label));
            }
        }

        if chained_orders != self.orders.len() {
            return Err(format!(
                "id map holds {} orders, chains hold {}",
                self.orders.len(),
                chained_orders
            ));
        }
        Ok(())
    }
}

impl Drop for OrderBook {
    fn drop(&mut self) {
        for (_, idx) in self.orders.drain() {
            self.pool.deallocate(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> OrderBook {
        let pool = Arc::new(ObjectPool::<Order>::new(4096).unwrap());
        OrderBook::new(1, pool)
    }

    #[test]
    fn add_rejects_bad_input() {
        let mut book = book();
        assert!(!book.add_order(1, 100, 0, Side::Buy));
        assert!(!book.add_order(1, 0, 10, Side::Buy));
        assert!(!book.add_order(1, -5, 10, Side::Buy));
        assert!(!book.add_order(1, 100, 10, Side::Invalid));
        assert!(book.add_order(1, 100, 10, Side::Buy));
        assert!(!book.add_order(1, 200, 10, Side::Buy), "duplicate id");
        book.validate().unwrap();
    }

    #[test]
    fn fifo_time_priority_within_level() {
        let mut book = book();
        for id in 1..=3 {
            assert!(book.add_order(id, 500, 10, Side::Buy));
        }
        assert_eq!(book.level_order_ids(Side::Buy, 0), vec![1, 2, 3]);

        // Cancelling the middle order keeps the remaining order intact.
        assert!(book.cancel_order(2));
        assert_eq!(book.level_order_ids(Side::Buy, 0), vec![1, 3]);
        book.validate().unwrap();
    }

    #[test]
    fn add_then_cancel_restores_empty_book() {
        let mut book = book();
        assert!(book.add_order(7, 1234, 50, Side::Sell));
        assert_eq!(book.ask_depth(), 1);
        assert!(book.cancel_order(7));
        assert_eq!(book.ask_depth(), 0);
        assert_eq!(book.total_orders(), 0);
        assert!(book.best_ask().is_none());
        assert_eq!(book.pool.allocated_count(), 0);
        book.validate().unwrap();
    }

    #[test]
    fn modify_updates_level_quantity() {
        let mut book = book();
        book.add_order(1, 100, 40, Side::Buy);
        book.add_order(2, 100, 60, Side::Buy);
        assert_eq!(book.best_bid().unwrap().total_quantity, 100);

        assert!(book.modify_order(1, 10));
        assert_eq!(book.best_bid().unwrap().total_quantity, 70);
        assert_eq!(book.get_order(1).unwrap().quantity, 10);

        // Modify to zero is cancel.
        assert!(book.modify_order(1, 0));
        assert_eq!(book.best_bid().unwrap().total_quantity, 60);
        assert!(book.get_order(1).is_none());
        book.validate().unwrap();
    }

    #[test]
    fn modify_same_quantity_is_observable_noop() {
        let mut book = book();
        book.add_order(1, 100, 40, Side::Buy);
        let before = *book.get_order(1).unwrap();
        assert!(book.modify_order(1, 40));
        let after = *book.get_order(1).unwrap();
        assert_eq!(after.quantity, before.quantity);
        assert_eq!(after.price, before.price);
        assert!(after.timestamp >= before.timestamp);
        book.validate().unwrap();
    }

    #[test]
    fn execute_reduces_then_removes() {
        let mut book = book();
        book.add_order(1, 100, 100, Side::Buy);
        assert!(book.execute_order(1, 30));
        assert_eq!(book.get_order(1).unwrap().quantity, 70);
        assert_eq!(book.best_bid().unwrap().total_quantity, 70);

        assert!(book.execute_order(1, 70));
        assert!(book.get_order(1).is_none());
        assert!(book.best_bid().is_none());
        book.validate().unwrap();
    }

    #[test]
    fn execute_overfill_removes_order() {
        let mut book = book();
        book.add_order(1, 100, 10, Side::Sell);
        assert!(book.execute_order(1, 500));
        assert_eq!(book.total_orders(), 0);
        book.validate().unwrap();
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let mut book = book();
        assert!(!book.modify_order(9, 10));
        assert!(!book.execute_order(9, 10));
        assert!(!book.cancel_order(9));
    }

    #[test]
    fn sides_sort_opposite_directions() {
        let mut book = book();
        book.add_order(1, 10_000, 100, Side::Buy);
        book.add_order(2, 10_200, 200, Side::Buy);
        book.add_order(3, 10_100, 150, Side::Buy);
        book.add_order(4, 10_400, 100, Side::Sell);
        book.add_order(5, 10_300, 200, Side::Sell);
        book.add_order(6, 10_350, 150, Side::Sell);

        let bid_prices: Vec<_> = (0..3).map(|i| book.bid_level(i).unwrap().price).collect();
        let ask_prices: Vec<_> = (0..3).map(|i| book.ask_level(i).unwrap().price).collect();
        assert_eq!(bid_prices, vec![10_200, 10_100, 10_000]);
        assert_eq!(ask_prices, vec![10_300, 10_350, 10_400]);
        assert_eq!(book.mid_price(), 10_250);
        assert_eq!(book.spread(), 100);
        book.validate().unwrap();
    }

    #[test]
    fn spread_sentinel_when_one_sided() {
        let mut book = book();
        assert_eq!(book.spread(), SPREAD_UNAVAILABLE);
        assert_eq!(book.mid_price(), 0);
        book.add_order(1, 100, 10, Side::Buy);
        assert_eq!(book.spread(), SPREAD_UNAVAILABLE);
        assert_eq!(book.mid_price(), 0);
    }

    #[test]
    fn depth_queries_out_of_range() {
        let mut book = book();
        book.add_order(1, 100, 10, Side::Buy);
        assert!(book.bid_level(0).is_some());
        assert!(book.bid_level(1).is_none());
        assert!(book.ask_level(0).is_none());
    }

    #[test]
    fn side_full_rejects_new_level() {
        let pool = Arc::new(ObjectPool::<Order>::new(64).unwrap());
        let mut book = OrderBook::with_max_levels(1, pool, 3);
        for i in 0..3u64 {
            assert!(book.add_order(i + 1, 100 + i as i64, 10, Side::Buy));
        }
        // A fourth distinct price must be refused, but stacking onto an
        // existing level still works.
        assert!(!book.add_order(99, 500, 10, Side::Buy));
        assert!(book.add_order(100, 101, 10, Side::Buy));
        book.validate().unwrap();
    }

    #[test]
    fn pool_exhaustion_rolls_back_level() {
        let pool = Arc::new(ObjectPool::<Order>::new(1).unwrap());
        let mut book = OrderBook::new(1, pool);
        assert!(book.add_order(1, 100, 10, Side::Buy));
        assert!(!book.add_order(2, 200, 10, Side::Buy));
        assert_eq!(book.bid_depth(), 1);
        book.validate().unwrap();
    }

    #[test]
    fn clear_returns_all_slots() {
        let pool = Arc::new(ObjectPool::<Order>::new(128).unwrap());
        let mut book = OrderBook::new(1, pool.clone());
        for i in 0..50u64 {
            book.add_order(i + 1, 100 + (i % 7) as i64, 10, Side::Buy);
        }
        book.clear();
        assert_eq!(pool.allocated_count(), 0);
        assert_eq!(book.total_orders(), 0);
        assert_eq!(book.bid_depth(), 0);
        book.validate().unwrap();
    }

    #[test]
    fn drop_returns_slots_to_shared_pool() {
        let pool = Arc::new(ObjectPool::<Order>::new(128).unwrap());
        {
            let mut book = OrderBook::new(1, pool.clone());
            for i in 0..10u64 {
                book.add_order(i + 1, 100, 10, Side::Buy);
            }
            assert_eq!(pool.allocated_count(), 10);
        }
        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn apply_routes_by_kind() {
        let mut book = book();
        let mut add = NormalizedMessage::default();
        add.set_kind(MessageKind::OrderAdd);
        add.set_side(Side::Buy);
        add.order_id = 1;
        add.price = 100;
        add.quantity = 50;
        assert!(book.apply(&add));

        let mut exec = NormalizedMessage::default();
        exec.set_kind(MessageKind::OrderExecute);
        exec.order_id = 1;
        exec.quantity = 20;
        assert!(book.apply(&exec));
        assert_eq!(book.get_order(1).unwrap().quantity, 30);

        let mut del = NormalizedMessage::default();
        del.set_kind(MessageKind::OrderDelete);
        del.order_id = 1;
        assert!(book.apply(&del));
        assert!(book.is_empty());

        let mut trade = NormalizedMessage::default();
        trade.set_kind(MessageKind::Trade);
        assert!(!book.apply(&trade));
        book.validate().unwrap();
    }
}

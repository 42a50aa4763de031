use std::collections::HashMap;

use crate::{
    order::OrderId,
    types::{Side, INVALID_MAX, INVALID_MIN},
};

/// One side of a symbol's resting-order store: scaled-price buckets holding
/// order ids in arrival order, plus a cached extremum.
///
/// The extremum is maintained incrementally on insert and recomputed lazily on
/// removal, only when the bucket that held it becomes empty.
pub struct SideBook {
    side: Side,
    buckets: HashMap<i64, Vec<OrderId>>,
    best: i64,
}

impl SideBook {
    fn new(side: Side) -> Self {
        Self {
            side,
            buckets: HashMap::new(),
            best: Self::empty_best(side),
        }
    }

    fn empty_best(side: Side) -> i64 {
        match side {
            Side::Buy => INVALID_MIN,
            Side::Sell => INVALID_MAX,
        }
    }

    /// Returns the best resting price: the maximum for the buy side, the
    /// minimum for the sell side. [`INVALID_MIN`]/[`INVALID_MAX`] when empty.
    #[inline]
    pub fn best(&self) -> i64 {
        self.best
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn insert(&mut self, price_int: i64, order_id: OrderId) {
        self.buckets.entry(price_int).or_default().push(order_id);
        let improves = match self.side {
            Side::Buy => price_int > self.best,
            Side::Sell => price_int < self.best,
        };
        if improves {
            self.best = price_int;
        }
    }

    pub fn remove(&mut self, price_int: i64, order_id: OrderId) {
        let Some(bucket) = self.buckets.get_mut(&price_int) else {
            return;
        };
        if let Some(pos) = bucket.iter().position(|id| *id == order_id) {
            bucket.remove(pos);
        }
        if bucket.is_empty() {
            self.buckets.remove(&price_int);
            if price_int == self.best {
                self.best = match self.side {
                    Side::Buy => self.buckets.keys().copied().max().unwrap_or(INVALID_MIN),
                    Side::Sell => self.buckets.keys().copied().min().unwrap_or(INVALID_MAX),
                };
            }
        }
    }

    /// Returns the order ids resting at `price_int`, in arrival order. The
    /// ids are copied out so the caller may mutate the book while walking
    /// them.
    pub fn ids_at(&self, price_int: i64) -> Vec<OrderId> {
        self.buckets.get(&price_int).cloned().unwrap_or_default()
    }

    /// Returns every resting price level, ordered from best to worst.
    pub fn prices(&self) -> Vec<i64> {
        let mut prices: Vec<i64> = self.buckets.keys().copied().collect();
        match self.side {
            Side::Buy => prices.sort_unstable_by(|a, b| b.cmp(a)),
            Side::Sell => prices.sort_unstable(),
        }
        prices
    }
}

/// Both sides of one symbol's resting-order store.
pub struct OrderBook {
    pub bids: SideBook,
    pub asks: SideBook,
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            bids: SideBook::new(Side::Buy),
            asks: SideBook::new(Side::Sell),
        }
    }

    pub fn side_mut(&mut self, side: Side) -> &mut SideBook {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    /// Returns every resting order id on both sides.
    pub fn all_ids(&self) -> Vec<OrderId> {
        self.bids
            .buckets
            .values()
            .chain(self.asks.buckets.values())
            .flatten()
            .copied()
            .collect()
    }
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extremum_tracks_inserts() {
        let mut bids = SideBook::new(Side::Buy);
        assert_eq!(bids.best(), INVALID_MIN);
        bids.insert(100, 1);
        bids.insert(102, 2);
        bids.insert(101, 3);
        assert_eq!(bids.best(), 102);

        let mut asks = SideBook::new(Side::Sell);
        asks.insert(105, 4);
        asks.insert(103, 5);
        assert_eq!(asks.best(), 103);
    }

    #[test]
    fn extremum_recomputes_when_best_bucket_empties() {
        let mut bids = SideBook::new(Side::Buy);
        bids.insert(100, 1);
        bids.insert(102, 2);
        bids.insert(102, 3);

        // removing one of two orders keeps the level
        bids.remove(102, 2);
        assert_eq!(bids.best(), 102);
        bids.remove(102, 3);
        assert_eq!(bids.best(), 100);
        bids.remove(100, 1);
        assert_eq!(bids.best(), INVALID_MIN);
        assert!(bids.is_empty());
    }

    #[test]
    fn bucket_preserves_arrival_order() {
        let mut asks = SideBook::new(Side::Sell);
        asks.insert(100, 7);
        asks.insert(100, 3);
        asks.insert(100, 9);
        assert_eq!(asks.ids_at(100), vec![7, 3, 9]);
        asks.remove(100, 3);
        assert_eq!(asks.ids_at(100), vec![7, 9]);
    }

    #[test]
    fn prices_ordered_best_to_worst() {
        let mut bids = SideBook::new(Side::Buy);
        bids.insert(100, 1);
        bids.insert(103, 2);
        bids.insert(101, 3);
        assert_eq!(bids.prices(), vec![103, 101, 100]);

        let mut asks = SideBook::new(Side::Sell);
        asks.insert(104, 4);
        asks.insert(102, 5);
        assert_eq!(asks.prices(), vec![102, 104]);
    }

    #[test]
    fn removing_unknown_id_is_a_no_op() {
        let mut bids = SideBook::new(Side::Buy);
        bids.insert(100, 1);
        bids.remove(100, 2);
        bids.remove(99, 1);
        assert_eq!(bids.ids_at(100), vec![1]);
    }
}

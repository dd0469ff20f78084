//! Opening credits with shrink debt.
//!
//! A pool starts with `total` credits. Taking one admits a command into the
//! stage the pool guards; giving one back releases the admission. Resizing
//! below the number of credits currently out does not fail and does not
//! revoke anything in flight: the shortfall is recorded as debt, and
//! returned credits pay the debt down before becoming available again. The
//! pool therefore never goes negative and never blocks a completion.

use serde::{Deserialize, Serialize};

/// Snapshot of a pool for stats reporting.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditStats {
    pub total: u32,
    pub available: u32,
    pub debt: u32,
}

/// Counted admissions for one scheduling stage.
#[derive(Clone, Debug)]
pub struct CreditPool {
    total: u32,
    available: u32,
    debt: u32,
}

impl CreditPool {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            available: total,
            debt: 0,
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn debt(&self) -> u32 {
        self.debt
    }

    /// Credits currently admitted (taken and not yet returned).
    pub fn in_use(&self) -> u32 {
        // Outstanding admissions beyond the shrunken total show up as debt.
        self.total + self.debt - self.available
    }

    /// Consume one credit. The caller gates on [`CreditPool::available`]
    /// before admitting work; taking from an empty pool is a bug.
    pub fn take(&mut self) {
        assert!(self.available > 0, "take from empty credit pool");
        self.available -= 1;
    }

    /// Return one credit. Pays down shrink debt before the credit becomes
    /// available again.
    pub fn give(&mut self) {
        if self.debt > 0 {
            self.debt -= 1;
            return;
        }
        self.available += 1;
        assert!(
            self.available <= self.total,
            "credit pool overfull: {} of {}",
            self.available,
            self.total
        );
    }

    /// Change the pool size. Growing adds credits immediately; shrinking
    /// removes available credits first and books the remainder as debt.
    pub fn resize(&mut self, new_total: u32) {
        if new_total >= self.total {
            let grown = new_total - self.total;
            // Growth pays down debt before adding availability.
            let toward_debt = grown.min(self.debt);
            self.debt -= toward_debt;
            self.available += grown - toward_debt;
        } else {
            let mut shrink = self.total - new_total;
            let from_available = shrink.min(self.available);
            self.available -= from_available;
            shrink -= from_available;
            self.debt += shrink;
        }
        self.total = new_total;
    }

    pub fn stats(&self) -> CreditStats {
        CreditStats {
            total: self.total,
            available: self.available,
            debt: self.debt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_and_give_round_trip() {
        let mut pool = CreditPool::new(2);
        pool.take();
        pool.take();
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.in_use(), 2);
        pool.give();
        assert_eq!(pool.available(), 1);
        pool.give();
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn grow_adds_availability() {
        let mut pool = CreditPool::new(1);
        pool.take();
        pool.resize(3);
        assert_eq!(pool.total(), 3);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn shrink_consumes_available_first() {
        let mut pool = CreditPool::new(4);
        pool.take();
        pool.resize(2);
        assert_eq!(pool.total(), 2);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.debt(), 0);
    }

    #[test]
    fn shrink_below_in_use_books_debt() {
        let mut pool = CreditPool::new(4);
        for _ in 0..3 {
            pool.take();
        }
        pool.resize(1);
        assert_eq!(pool.total(), 1);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.debt(), 2);
        assert_eq!(pool.in_use(), 3);
    }

    #[test]
    fn returns_pay_debt_before_availability() {
        let mut pool = CreditPool::new(3);
        for _ in 0..3 {
            pool.take();
        }
        pool.resize(1);
        assert_eq!(pool.debt(), 2);
        pool.give();
        assert_eq!(pool.debt(), 1);
        assert_eq!(pool.available(), 0);
        pool.give();
        assert_eq!(pool.debt(), 0);
        assert_eq!(pool.available(), 0);
        pool.give();
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn grow_while_in_debt_pays_debt_first() {
        let mut pool = CreditPool::new(2);
        pool.take();
        pool.take();
        pool.resize(0);
        assert_eq!(pool.debt(), 2);
        pool.resize(3);
        assert_eq!(pool.debt(), 0);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn stats_snapshot() {
        let mut pool = CreditPool::new(2);
        pool.take();
        assert_eq!(
            pool.stats(),
            CreditStats {
                total: 2,
                available: 1,
                debt: 0
            }
        );
    }

    #[test]
    #[should_panic(expected = "take from empty credit pool")]
    fn take_from_empty_panics() {
        let mut pool = CreditPool::new(0);
        pool.take();
    }

    #[test]
    #[should_panic(expected = "credit pool overfull")]
    fn extra_give_panics() {
        let mut pool = CreditPool::new(1);
        pool.give();
    }
}

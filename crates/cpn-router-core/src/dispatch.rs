//! Dispatch sequence
//!
//! Discretizes one policy row into a circular queue of instance indices.
//! Each weight is scaled to `slots` and rounded; every round then takes one
//! unit from each instance with quota left, shuffles that round and
//! appends it. Popping from the front and pushing to the back cycles the
//! schedule forever at the rounded frequencies.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::VecDeque;

/// Circular dispatch schedule for one policy row
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSequence {
    row: Vec<f64>,
    queue: VecDeque<usize>,
}

impl DispatchSequence {
    pub fn build<R: Rng + ?Sized>(row: &[f64], slots: usize, rng: &mut R) -> Self {
        let mut quota: Vec<usize> = row
            .iter()
            .map(|w| {
                let units = (w * slots as f64).round();
                if units.is_finite() && units > 0.0 {
                    units as usize
                } else {
                    0
                }
            })
            .collect();

        // Everything rounded away: keep the heaviest instance
        if quota.iter().all(|q| *q == 0) {
            let heaviest = row
                .iter()
                .enumerate()
                .fold(None, |best: Option<(usize, f64)>, (i, &w)| match best {
                    Some((_, b)) if w <= b => best,
                    _ => Some((i, w)),
                });
            if let Some((i, _)) = heaviest {
                quota[i] = 1;
            }
        }

        let mut queue = VecDeque::with_capacity(quota.iter().sum());
        loop {
            let mut round: Vec<usize> = quota
                .iter_mut()
                .enumerate()
                .filter(|(_, q)| **q > 0)
                .map(|(i, q)| {
                    *q -= 1;
                    i
                })
                .collect();
            if round.is_empty() {
                break;
            }
            round.shuffle(rng);
            queue.extend(round);
        }

        Self {
            row: row.to_vec(),
            queue,
        }
    }

    /// Next instance; the index moves to the back of the queue
    pub fn next(&mut self) -> Option<usize> {
        let index = self.queue.pop_front()?;
        self.queue.push_back(index);
        Some(index)
    }

    /// Instance `next` would return
    pub fn peek(&self) -> Option<usize> {
        self.queue.front().copied()
    }

    /// Bit-for-bit comparison with the row this sequence was built from
    pub fn matches_row(&self, row: &[f64]) -> bool {
        self.row.len() == row.len()
            && self
                .row
                .iter()
                .zip(row)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }

    pub fn row(&self) -> &[f64] {
        &self.row
    }

    /// One full cycle in dispatch order
    pub fn cycle(&self) -> Vec<usize> {
        self.queue.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

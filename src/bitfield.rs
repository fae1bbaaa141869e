use log::debug;
use std::collections::BTreeSet;

/// Number of alarm bits packed into one word.
pub const WORD_BITS: usize = 32;

/// Alarm bit count used when the configuration doesn't say otherwise.
pub const DEFAULT_ALARM_BITS: usize = 896;

/// Largest alarm count accepted from configuration.
pub const MAX_ALARM_BITS: usize = 65536;

/// Number of words needed to hold `alarm_bits` alarms.
pub fn word_count(alarm_bits: usize) -> usize {
    alarm_bits / WORD_BITS + (alarm_bits % WORD_BITS != 0) as usize
}

/// Word holding the alarm with the given index.
pub fn word_index(index: usize) -> usize {
    index / WORD_BITS
}

/// Position of the alarm within its word.
pub fn bit_position(index: usize) -> u32 {
    (index % WORD_BITS) as u32
}

pub fn bit_value(word: u32, bit: u32) -> bool {
    (word >> bit) & 1 != 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Triggered, // false -> true
    Cleared,   // true -> false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub index: usize,
    pub edge: Edge,
}

/// Keeps the last known value of every alarm bit and reports edges
/// between successive observations of the same word.
///
/// Each word has two masks: which bits have been observed at least once
/// and their last value. Bits beyond the alarm count are always masked
/// out so they never become active.
#[derive(Debug, Clone)]
pub struct BitfieldStateTracker {
    alarm_bits: usize,
    observed: Vec<u32>,
    values: Vec<u32>,
}

impl BitfieldStateTracker {
    pub fn new(alarm_bits: usize) -> BitfieldStateTracker {
        let words = word_count(alarm_bits);
        BitfieldStateTracker {
            alarm_bits,
            observed: vec![0; words],
            values: vec![0; words],
        }
    }

    pub fn alarm_bits(&self) -> usize {
        self.alarm_bits
    }

    pub fn word_count(&self) -> usize {
        self.values.len()
    }

    // Bits of word `word_index` that map to a valid alarm index
    fn valid_mask(&self, word_index: usize) -> u32 {
        let first = word_index * WORD_BITS;
        if first >= self.alarm_bits {
            return 0;
        }
        let remaining = self.alarm_bits - first;
        if remaining >= WORD_BITS {
            u32::MAX
        } else {
            (1u32 << remaining) - 1
        }
    }

    /// Record a freshly read word and return the transitions it caused,
    /// in ascending index order.
    ///
    /// The first observation of a bit only establishes its baseline, a bit
    /// that is already set when monitoring starts is not reported as
    /// triggered.
    pub fn apply(&mut self, word_index: usize, word: u32) -> Vec<Transition> {
        let mut transitions = Vec::new();
        if word_index >= self.values.len() {
            debug!("Ignoring word {} outside the alarm table", word_index);
            return transitions;
        }
        let valid = self.valid_mask(word_index);
        let word = word & valid;
        let observed = self.observed[word_index];
        let changed = (self.values[word_index] ^ word) & observed;
        if changed != 0 {
            let first = word_index * WORD_BITS;
            for bit in 0..WORD_BITS as u32 {
                if bit_value(changed, bit) {
                    let edge = if bit_value(word, bit) {
                        Edge::Triggered
                    } else {
                        Edge::Cleared
                    };
                    transitions.push(Transition {
                        index: first + bit as usize,
                        edge,
                    });
                }
            }
        }
        self.values[word_index] = word;
        self.observed[word_index] = observed | valid;
        transitions
    }

    /// Last known value of an alarm, `None` until it has been observed.
    pub fn state(&self, index: usize) -> Option<bool> {
        if index >= self.alarm_bits {
            return None;
        }
        let word = word_index(index);
        let bit = bit_position(index);
        if bit_value(self.observed[word], bit) {
            Some(bit_value(self.values[word], bit))
        } else {
            None
        }
    }

    pub fn active_count(&self) -> usize {
        self.values.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn active_indices(&self) -> BTreeSet<usize> {
        let mut active = BTreeSet::new();
        for (word_index, word) in self.values.iter().enumerate() {
            let mut bits = *word;
            while bits != 0 {
                let bit = bits.trailing_zeros();
                active.insert(word_index * WORD_BITS + bit as usize);
                bits &= bits - 1;
            }
        }
        active
    }

    /// Forget everything, the next observation of each word is a baseline again.
    pub fn reset(&mut self) {
        self.observed.iter_mut().for_each(|w| *w = 0);
        self.values.iter_mut().for_each(|w| *w = 0);
    }
}

#[test]
fn test_word_layout() {
    assert_eq!(word_count(DEFAULT_ALARM_BITS), 28);
    assert_eq!(word_count(0), 0);
    assert_eq!(word_count(1), 1);
    assert_eq!(word_count(32), 1);
    assert_eq!(word_count(33), 2);
    assert_eq!(word_count(usize::MAX), usize::MAX / 32 + 1);
    assert_eq!(word_index(191), 5);
    assert_eq!(bit_position(191), 31);
    assert_eq!(word_index(160), 5);
    assert_eq!(bit_position(160), 0);
}

#[test]
fn test_bit_extraction() {
    for bit in 0..32 {
        assert_eq!(bit_value(0b10, bit), bit == 1);
    }
}

#[test]
fn test_first_observation_is_baseline() {
    let mut tracker = BitfieldStateTracker::new(DEFAULT_ALARM_BITS);
    assert!(tracker.apply(0, 0b10).is_empty());
    assert_eq!(tracker.active_indices(), BTreeSet::from([1]));
    assert_eq!(tracker.state(1), Some(true));
    assert_eq!(tracker.state(0), Some(false));
    assert_eq!(tracker.state(32), None);
}

#[test]
fn test_edges() {
    let mut tracker = BitfieldStateTracker::new(DEFAULT_ALARM_BITS);
    tracker.apply(0, 0b10);
    assert!(tracker.apply(0, 0b10).is_empty());
    assert_eq!(
        tracker.apply(0, 0b00),
        vec![Transition {
            index: 1,
            edge: Edge::Cleared
        }]
    );
    assert_eq!(
        tracker.apply(0, 0x8000_0005),
        vec![
            Transition {
                index: 0,
                edge: Edge::Triggered
            },
            Transition {
                index: 2,
                edge: Edge::Triggered
            },
            Transition {
                index: 31,
                edge: Edge::Triggered
            },
        ]
    );
    assert_eq!(tracker.active_count(), 3);
}

#[test]
fn test_partial_last_word() {
    // 40 alarms: the second word only has 8 valid bits
    let mut tracker = BitfieldStateTracker::new(40);
    assert_eq!(tracker.word_count(), 2);
    tracker.apply(1, 0);
    let transitions = tracker.apply(1, 0xffff_ffff);
    assert_eq!(transitions.len(), 8);
    assert_eq!(transitions.last().map(|t| t.index), Some(39));
    assert_eq!(tracker.active_count(), 8);
    assert!(tracker.apply(2, 0xffff_ffff).is_empty());
    assert_eq!(tracker.active_count(), 8);
}

#[test]
fn test_reset() {
    let mut tracker = BitfieldStateTracker::new(64);
    tracker.apply(0, 0b1);
    tracker.apply(1, 0b1);
    tracker.reset();
    assert_eq!(tracker.active_count(), 0);
    assert_eq!(tracker.state(0), None);
    // Baseline again, no trigger
    assert!(tracker.apply(0, 0b11).is_empty());
    assert_eq!(tracker.active_count(), 2);
}

#[test]
fn test_active_count_matches_indices() {
    let mut tracker = BitfieldStateTracker::new(DEFAULT_ALARM_BITS);
    let words = [0u32, 0xdead_beef, 0x1, 0x8000_0000, 0x0f0f_0f0f];
    for (i, w) in words.iter().enumerate() {
        tracker.apply(i * 5, *w);
    }
    let active = tracker.active_indices();
    assert_eq!(tracker.active_count(), active.len());
    let true_states = (0..DEFAULT_ALARM_BITS)
        .filter(|i| tracker.state(*i) == Some(true))
        .count();
    assert_eq!(true_states, active.len());
}

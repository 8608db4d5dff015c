//! Integer range sets over primitive-type domains.
//!
//! A [`LongRangeSet`] is an ordered set of disjoint closed intervals inside
//! one primitive type's domain, represented as a `BTreeMap` from interval
//! start to interval end. All arithmetic is over a 64-bit signed
//! representation regardless of the declared width.
//!
//! The comparison constructors (`gt`, `ge`, …) double as partition
//! refiners: they split the receiver at the constant boundary so the
//! receiver stays a common refinement of every comparison seen so far,
//! while the returned set is the true side over the full type domain.
//! Splits only ever subdivide; nothing is coarsened.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fmt;

/// Domain of one primitive type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeRange {
    pub min: i64,
    pub max: i64,
    pub signature: &'static str,
}

impl TypeRange {
    /// Domain for a primitive signature; `None` for unsupported types.
    pub fn for_signature(signature: &str) -> Option<TypeRange> {
        let range = match signature {
            "Z" => TypeRange { min: 0, max: 1, signature: "Z" },
            "B" => TypeRange { min: i64::from(i8::MIN), max: i64::from(i8::MAX), signature: "B" },
            "S" => TypeRange { min: i64::from(i16::MIN), max: i64::from(i16::MAX), signature: "S" },
            "I" => TypeRange { min: i64::from(i32::MIN), max: i64::from(i32::MAX), signature: "I" },
            "J" => TypeRange { min: i64::MIN, max: i64::MAX, signature: "J" },
            "C" => TypeRange { min: 0, max: 0xFFFF, signature: "C" },
            _ => return None,
        };
        Some(range)
    }

    pub fn is_signature_supported(signature: &str) -> bool {
        Self::for_signature(signature).is_some()
    }

    /// The domain's boundary values and their outside neighbors.
    pub fn add_borders_to(&self, borders: &mut HashSet<i64>) {
        borders.insert(self.min);
        if self.min > i64::MIN {
            borders.insert(self.min - 1);
        }
        borders.insert(self.max);
        if self.max < i64::MAX {
            borders.insert(self.max + 1);
        }
    }
}

/// Disjoint closed intervals within one type domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongRangeSet {
    map: BTreeMap<i64, i64>,
    range: TypeRange,
}

impl LongRangeSet {
    /// The full domain of a primitive signature.
    pub fn full(signature: &str) -> Option<Self> {
        let range = TypeRange::for_signature(signature)?;
        let mut map = BTreeMap::new();
        map.insert(range.min, range.max);
        Some(Self { map, range })
    }

    fn with_range(range: TypeRange) -> Self {
        Self {
            map: BTreeMap::new(),
            range,
        }
    }

    /// Interval clamped into the type domain; empty when nothing remains.
    fn of(range: TypeRange, from: i64, to: i64) -> Self {
        let from = from.max(range.min);
        let to = to.min(range.max);
        let mut set = Self::with_range(range);
        if from <= to {
            set.map.insert(from, to);
        }
        set
    }

    /// Fresh empty set over the same domain.
    pub fn empty(&self) -> Self {
        Self::with_range(self.range)
    }

    pub fn signature(&self) -> &'static str {
        self.range.signature
    }

    pub fn type_range(&self) -> TypeRange {
        self.range
    }

    /// Split the interval containing `number` into `[.., number]` and
    /// `[number + 1, ..]`. No-op when `number` falls outside or on an
    /// interval boundary.
    pub fn split_greater(&mut self, number: i64) {
        if number == i64::MAX {
            return;
        }
        let Some((&start, &end)) = self.map.range(..=number).next_back() else {
            return;
        };
        if number >= end {
            return;
        }
        self.map.insert(start, number);
        self.map.insert(number + 1, end);
    }

    /// True side of `> value` over the full domain; refines the receiver.
    pub fn gt(&mut self, value: i64) -> Self {
        self.split_greater(value);
        if value == i64::MAX {
            return Self::with_range(self.range);
        }
        Self::of(self.range, value + 1, self.range.max)
    }

    /// True side of `>= value`; refines the receiver.
    pub fn ge(&mut self, value: i64) -> Self {
        if value != i64::MIN {
            self.split_greater(value - 1);
        }
        Self::of(self.range, value, self.range.max)
    }

    /// True side of `< value`; refines the receiver.
    pub fn lt(&mut self, value: i64) -> Self {
        if value == i64::MIN {
            return Self::with_range(self.range);
        }
        self.split_greater(value - 1);
        Self::of(self.range, self.range.min, value - 1)
    }

    /// True side of `<= value`; refines the receiver.
    pub fn le(&mut self, value: i64) -> Self {
        self.split_greater(value);
        Self::of(self.range, self.range.min, value)
    }

    /// True side of `== value`; refines the receiver.
    pub fn eq(&mut self, value: i64) -> Self {
        self.split_greater(value);
        if value != i64::MIN {
            self.split_greater(value - 1);
        }
        Self::of(self.range, value, value)
    }

    /// True side of `!= value`; refines the receiver.
    pub fn ne(&mut self, value: i64) -> Self {
        self.split_greater(value);
        if value != i64::MIN {
            self.split_greater(value - 1);
        }
        let mut result = if value == i64::MIN {
            Self::with_range(self.range)
        } else {
            Self::of(self.range, self.range.min, value - 1)
        };
        if value < self.range.max {
            result.map.insert(value + 1, self.range.max);
        }
        result
    }

    /// Type-domain borders (used for border-comparison reporting).
    pub fn add_borders_to(&self, borders: &mut HashSet<i64>) {
        self.range.add_borders_to(borders);
    }

    pub fn contains(&self, value: i64) -> bool {
        self.map
            .range(..=value)
            .next_back()
            .map(|(_, &end)| end >= value)
            .unwrap_or(false)
    }

    pub fn intersects(&self, other: &LongRangeSet) -> bool {
        for (&start, &end) in &self.map {
            if other.map.range(start..=end).next().is_some() {
                return true;
            }
            if let Some((_, &head_end)) = other.map.range(..start).next_back() {
                if head_end >= start {
                    return true;
                }
            }
        }
        false
    }

    fn add_interval(&mut self, mut start: i64, mut end: i64) {
        if self.map.is_empty() {
            self.map.insert(start, end);
            return;
        }
        if end < i64::MAX {
            if let Some(tail_end) = self.map.remove(&(end + 1)) {
                end = tail_end;
            }
            if let Some((_, &head_end)) = self.map.range(..=end).next_back() {
                if head_end > end {
                    end = head_end;
                }
            }
        }
        if let Some((&head_start, &head_end)) = self.map.range(..start).next_back() {
            // a predecessor key exists, so start > i64::MIN
            if head_end >= start - 1 {
                self.map.remove(&head_start);
                start = head_start;
            }
        }
        let absorbed: Vec<i64> = self.map.range(start..end).map(|(&k, _)| k).collect();
        for key in absorbed {
            self.map.remove(&key);
        }
        self.map.remove(&end);
        self.map.insert(start, end);
    }

    /// Union `other` into `self`, normalizing touching intervals.
    pub fn add(&mut self, other: &LongRangeSet) {
        for (&start, &end) in &other.map {
            self.add_interval(start, end);
        }
    }

    /// Structural equality of the interval sets.
    pub fn same(&self, other: &LongRangeSet) -> bool {
        self.map == other.map
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Covers the whole type domain in one interval.
    pub fn is_full(&self) -> bool {
        if self.map.len() != 1 {
            return false;
        }
        let (&start, &end) = self.map.iter().next().expect("len checked");
        start <= self.range.min && end >= self.range.max
    }

    /// The minimal sub-ranges of the partition, one set per interval.
    pub fn sub_ranges(&self) -> impl Iterator<Item = LongRangeSet> + '_ {
        self.map
            .iter()
            .map(move |(&start, &end)| Self::of(self.range, start, end))
    }
}

impl fmt::Display for LongRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (&start, &end) in &self.map {
            if !first {
                write!(f, "+")?;
            }
            first = false;
            if start == end {
                write!(f, "{{{start}}}")?;
            } else {
                write!(f, "[{start}, {end}]")?;
            }
        }
        Ok(())
    }
}

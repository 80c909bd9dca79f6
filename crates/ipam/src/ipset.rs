//! IP-set algebra
//!
//! [`IPSet`] is an immutable value type holding IPv4 and IPv6 addresses as
//! coalesced, inclusive ranges in one `BTreeMap` per family, keyed by the
//! first address of each range. Lookups seek with `BTreeMap::range`, so they
//! cost `O(log R)` in the range count. Mutation goes through [`IPSetBuilder`],
//! which keeps the same normalized representation so that freezing is a plain
//! copy.
//!
//! Addresses of both families are widened to `u128` internally; the family is
//! tracked by which sequence a range lives in.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address family of an IP, prefix or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl IpFamily {
    /// Family of an address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Family of a prefix
    pub fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => IpFamily::V4,
            IpNet::V6(_) => IpFamily::V6,
        }
    }

    /// Prefix length of a single address (32 or 128)
    pub fn max_prefix_len(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("IPv4"),
            IpFamily::V6 => f.write_str("IPv6"),
        }
    }
}

/// Inclusive address range `[from, to]` of a single family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IPRange {
    /// First address
    pub from: IpAddr,
    /// Last address (inclusive)
    pub to: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    lo: u128,
    hi: u128,
}

fn widen(addr: IpAddr) -> (IpFamily, u128) {
    match addr {
        IpAddr::V4(v4) => (IpFamily::V4, u32::from(v4) as u128),
        IpAddr::V6(v6) => (IpFamily::V6, u128::from(v6)),
    }
}

fn narrow(family: IpFamily, value: u128) -> IpAddr {
    match family {
        IpFamily::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
        IpFamily::V6 => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

fn net_span(net: &IpNet) -> (IpFamily, Span) {
    let (family, lo) = widen(net.network());
    let (_, hi) = widen(net.broadcast());
    (family, Span { lo, hi })
}

/// Mask of the host part for a prefix leaving `host_bits` bits.
fn host_mask(host_bits: u32) -> u128 {
    if host_bits >= 128 {
        u128::MAX
    } else {
        (1u128 << host_bits) - 1
    }
}

/// Round `value` up to the next multiple of `2^host_bits`.
fn align_up(value: u128, host_bits: u32) -> Option<u128> {
    let mask = host_mask(host_bits);
    if value & mask == 0 {
        Some(value)
    } else {
        (value | mask).checked_add(1)
    }
}

/// First address to last address, both inclusive. Ranges never overlap or
/// touch.
type Spans = BTreeMap<u128, u128>;

fn insert_span(spans: &mut Spans, new: Span) {
    let (mut lo, mut hi) = (new.lo, new.hi);
    if let Some((&l, &h)) = spans.range(..=lo).next_back() {
        if h.saturating_add(1) >= lo {
            lo = l;
            hi = hi.max(h);
        }
    }
    loop {
        let Some((&l, &h)) = spans.range(lo..).next() else {
            break;
        };
        if l > hi.saturating_add(1) {
            break;
        }
        hi = hi.max(h);
        spans.remove(&l);
    }
    spans.insert(lo, hi);
}

fn remove_span(spans: &mut Spans, cut: Span) {
    if let Some((&l, &h)) = spans.range(..cut.lo).next_back() {
        if h >= cut.lo {
            spans.insert(l, cut.lo - 1);
            if h > cut.hi {
                spans.insert(cut.hi + 1, h);
                return;
            }
        }
    }
    let covered: Vec<(u128, u128)> = spans.range(cut.lo..=cut.hi).map(|(&l, &h)| (l, h)).collect();
    for (l, h) in covered {
        spans.remove(&l);
        if h > cut.hi {
            spans.insert(cut.hi + 1, h);
        }
    }
}

/// Range holding `value`
fn holder(spans: &Spans, value: u128) -> Option<Span> {
    spans
        .range(..=value)
        .next_back()
        .filter(|&(_, &hi)| hi >= value)
        .map(|(&lo, &hi)| Span { lo, hi })
}

/// Range holding `value`, else the first range above it
fn holder_or_next(spans: &Spans, value: u128) -> Option<Span> {
    holder(spans, value).or_else(|| spans.range(value..).next().map(|(&lo, &hi)| Span { lo, hi }))
}

fn spans_contain(spans: &Spans, value: u128) -> bool {
    holder(spans, value).is_some()
}

fn spans_contain_span(spans: &Spans, span: Span) -> bool {
    holder(spans, span.lo).is_some_and(|s| s.hi >= span.hi)
}

/// Immutable set of IPv4 and IPv6 addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IPSet {
    v4: Spans,
    v6: Spans,
}

impl IPSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set covering the union of `prefixes`
    pub fn from_prefixes<'a>(prefixes: impl IntoIterator<Item = &'a IpNet>) -> Self {
        let mut builder = IPSetBuilder::new();
        for prefix in prefixes {
            builder.add_prefix(prefix);
        }
        builder.build()
    }

    fn spans(&self, family: IpFamily) -> &Spans {
        match family {
            IpFamily::V4 => &self.v4,
            IpFamily::V6 => &self.v6,
        }
    }

    /// Builder seeded with the contents of this set
    pub fn builder(&self) -> IPSetBuilder {
        IPSetBuilder {
            v4: self.v4.clone(),
            v6: self.v6.clone(),
        }
    }

    /// True when the set holds no address of either family
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// True when at least one address of `family` is present
    pub fn has_family(&self, family: IpFamily) -> bool {
        !self.spans(family).is_empty()
    }

    /// Membership test, `O(log R)`
    pub fn contains(&self, addr: IpAddr) -> bool {
        let (family, value) = widen(addr);
        spans_contain(self.spans(family), value)
    }

    /// True when every address of `prefix` is in the set
    pub fn contains_prefix(&self, prefix: &IpNet) -> bool {
        let (family, span) = net_span(prefix);
        spans_contain_span(self.spans(family), span)
    }

    /// Number of addresses of `family`, saturating at `u128::MAX`
    pub fn len(&self, family: IpFamily) -> u128 {
        self.spans(family)
            .iter()
            .fold(0u128, |acc, (lo, hi)| acc.saturating_add((hi - lo).saturating_add(1)))
    }

    /// Ordered ranges, IPv4 first
    pub fn ranges(&self) -> impl Iterator<Item = IPRange> + '_ {
        let v4 = self.v4.iter().map(|s| (IpFamily::V4, s));
        let v6 = self.v6.iter().map(|s| (IpFamily::V6, s));
        v4.chain(v6).map(|(family, (&lo, &hi))| IPRange {
            from: narrow(family, lo),
            to: narrow(family, hi),
        })
    }

    /// Union of two sets
    pub fn union(&self, other: &IPSet) -> IPSet {
        let mut builder = self.builder();
        builder.add_set(other);
        builder.build()
    }

    /// Addresses of `self` not in `other`
    pub fn difference(&self, other: &IPSet) -> IPSet {
        let mut builder = self.builder();
        builder.remove_set(other);
        builder.build()
    }

    /// Carve the numerically lowest aligned prefix of length `bits`.
    ///
    /// Returns the prefix and the set without it, or `None` when no range can
    /// hold such a prefix. The search seeks from one aligned candidate to the
    /// next, so ranges lying between two candidates are never visited and a
    /// single-address request (`/32`, `/128`) is served by the first range.
    pub fn remove_free_prefix(&self, family: IpFamily, bits: u8) -> Option<(IpNet, IPSet)> {
        let width = family.max_prefix_len();
        if bits > width {
            return None;
        }
        let host_bits = u32::from(width - bits);
        let mask = host_mask(host_bits);
        let spans = self.spans(family);

        let (&first, _) = spans.first_key_value()?;
        let mut candidate = align_up(first, host_bits)?;
        let span = loop {
            let range = holder_or_next(spans, candidate)?;
            let start = align_up(range.lo.max(candidate), host_bits)?;
            let end = start.checked_add(mask)?;
            if end <= range.hi {
                break Span { lo: start, hi: end };
            }
            candidate = align_up(range.hi.checked_add(1)?, host_bits)?;
        };

        let prefix = match family {
            IpFamily::V4 => IpNet::V4(Ipv4Net::new(Ipv4Addr::from(span.lo as u32), bits).ok()?),
            IpFamily::V6 => IpNet::V6(Ipv6Net::new(Ipv6Addr::from(span.lo), bits).ok()?),
        };
        let mut builder = self.builder();
        builder.remove_prefix(&prefix);
        Some((prefix, builder.build()))
    }
}

impl fmt::Display for IPSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for range in self.ranges() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if range.from == range.to {
                write!(f, "{}", range.from)?;
            } else {
                write!(f, "{}-{}", range.from, range.to)?;
            }
        }
        Ok(())
    }
}

/// Mutable builder for [`IPSet`].
#[derive(Debug, Clone, Default)]
pub struct IPSetBuilder {
    v4: Spans,
    v6: Spans,
}

impl IPSetBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self::default()
    }

    fn spans_mut(&mut self, family: IpFamily) -> &mut Spans {
        match family {
            IpFamily::V4 => &mut self.v4,
            IpFamily::V6 => &mut self.v6,
        }
    }

    /// Add a single address
    pub fn add(&mut self, addr: IpAddr) -> &mut Self {
        let (family, value) = widen(addr);
        insert_span(self.spans_mut(family), Span { lo: value, hi: value });
        self
    }

    /// Remove a single address
    pub fn remove(&mut self, addr: IpAddr) -> &mut Self {
        let (family, value) = widen(addr);
        remove_span(self.spans_mut(family), Span { lo: value, hi: value });
        self
    }

    /// Add every address of `prefix`
    pub fn add_prefix(&mut self, prefix: &IpNet) -> &mut Self {
        let (family, span) = net_span(prefix);
        insert_span(self.spans_mut(family), span);
        self
    }

    /// Remove every address of `prefix`
    pub fn remove_prefix(&mut self, prefix: &IpNet) -> &mut Self {
        let (family, span) = net_span(prefix);
        remove_span(self.spans_mut(family), span);
        self
    }

    /// Add an inclusive range; ranges mixing families are ignored
    pub fn add_range(&mut self, range: IPRange) -> &mut Self {
        let (family, lo) = widen(range.from);
        let (to_family, hi) = widen(range.to);
        if family == to_family && lo <= hi {
            insert_span(self.spans_mut(family), Span { lo, hi });
        }
        self
    }

    /// Add all addresses of `set`
    pub fn add_set(&mut self, set: &IPSet) -> &mut Self {
        for (&lo, &hi) in &set.v4 {
            insert_span(&mut self.v4, Span { lo, hi });
        }
        for (&lo, &hi) in &set.v6 {
            insert_span(&mut self.v6, Span { lo, hi });
        }
        self
    }

    /// Remove all addresses of `set`
    pub fn remove_set(&mut self, set: &IPSet) -> &mut Self {
        for (&lo, &hi) in &set.v4 {
            remove_span(&mut self.v4, Span { lo, hi });
        }
        for (&lo, &hi) in &set.v6 {
            remove_span(&mut self.v6, Span { lo, hi });
        }
        self
    }

    /// Freeze into an immutable set
    pub fn build(&self) -> IPSet {
        IPSet {
            v4: self.v4.clone(),
            v6: self.v6.clone(),
        }
    }
}

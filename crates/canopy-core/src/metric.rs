//! Distance metrics, split planes, and traversal priorities.
//!
//! Each metric keeps an internal distance that is cheap to rank with, and
//! converts it to the caller-facing value only when reporting results:
//!
//! | Metric    | Internal            | Reported                  |
//! |-----------|---------------------|---------------------------|
//! | angular   | `2 − 2·cos θ`       | `sqrt(2 − 2·cos θ)`       |
//! | euclidean | `‖a − b‖²`          | `‖a − b‖`                 |
//! | manhattan | `Σ |a_i − b_i|`     | same                      |
//! | dot       | `−a·b`              | `1 − a·b`                 |
//! | hamming   | `popcount(a ⊕ b)`   | same                      |

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::node::{Node, NodeLayout, NodeMut};
use crate::simd;

/// Random bit draws before a hamming split falls back to scanning every bit.
const HAMMING_SPLIT_TRIES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Angular,
    Euclidean,
    Manhattan,
    #[serde(rename = "dot")]
    DotProduct,
    Hamming,
}

/// Child slot of a split node: `children[0]` is left, `children[1]` right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Left = 0,
    Right = 1,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Angular,
        Metric::Euclidean,
        Metric::Manhattan,
        Metric::DotProduct,
        Metric::Hamming,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::Angular => "angular",
            Metric::Euclidean => "euclidean",
            Metric::Manhattan => "manhattan",
            Metric::DotProduct => "dot",
            Metric::Hamming => "hamming",
        }
    }

    /// Stable on-disk tag.
    pub(crate) fn tag(self) -> u32 {
        match self {
            Metric::Angular => 0,
            Metric::Euclidean => 1,
            Metric::Manhattan => 2,
            Metric::DotProduct => 3,
            Metric::Hamming => 4,
        }
    }

    pub(crate) fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.tag() == tag)
    }

    /// Internal distance between two item slots.
    #[inline]
    pub(crate) fn distance(self, a: Node<'_>, b: Node<'_>) -> f32 {
        match self {
            Metric::Angular => {
                let (x, y) = (a.vector(), b.vector());
                let pp = simd::dot_product(x, x);
                let qq = simd::dot_product(y, y);
                let pq = simd::dot_product(x, y);
                let ppqq = pp * qq;
                if ppqq > 0.0 {
                    2.0 - 2.0 * pq / ppqq.sqrt()
                } else {
                    2.0
                }
            }
            Metric::Euclidean => simd::l2_distance_squared(a.vector(), b.vector()),
            Metric::Manhattan => simd::manhattan_distance(a.vector(), b.vector()),
            Metric::DotProduct => -simd::dot_product(a.vector(), b.vector()),
            Metric::Hamming => simd::hamming_distance(a.words(), b.words()) as f32,
        }
    }

    /// Convert an internal distance to the reported one.
    #[inline]
    pub fn normalized_distance(self, distance: f32) -> f32 {
        match self {
            Metric::Angular | Metric::Euclidean => distance.max(0.0).sqrt(),
            Metric::Manhattan | Metric::Hamming => distance.max(0.0),
            Metric::DotProduct => 1.0 + distance,
        }
    }

    /// Signed offset of `x` from a split plane. Hamming returns the tested bit.
    #[inline]
    pub(crate) fn margin(self, plane: Node<'_>, x: Node<'_>) -> f32 {
        match self {
            Metric::Angular => simd::dot_product(plane.vector(), x.vector()),
            Metric::Euclidean | Metric::Manhattan => {
                plane.extra() + simd::dot_product(plane.vector(), x.vector())
            }
            Metric::DotProduct => {
                simd::dot_product(plane.vector(), x.vector()) + plane.extra() * x.extra()
            }
            Metric::Hamming => {
                // Bits past the vector's words read as unset
                let bit = plane.words()[0];
                usize::try_from(bit / 64)
                    .ok()
                    .and_then(|w| x.words().get(w))
                    .map_or(0.0, |word| ((word >> (bit % 64)) & 1) as f32)
            }
        }
    }

    /// Which child `x` belongs to. Points on the plane go to a random side.
    pub(crate) fn side<R: Rng>(self, plane: Node<'_>, x: Node<'_>, rng: &mut R) -> Side {
        let margin = self.margin(plane, x);
        if margin > 0.0 {
            Side::Right
        } else if margin < 0.0 || self == Metric::Hamming || !rng.gen::<bool>() {
            Side::Left
        } else {
            Side::Right
        }
    }

    /// Priority given to every tree root.
    pub(crate) fn initial_priority(self, dimensions: usize) -> f32 {
        match self {
            // One unit is spent per disagreeing bit, so this never saturates
            Metric::Hamming => dimensions as f32,
            _ => f32::INFINITY,
        }
    }

    /// Priority of descending into `side` from a node reached at `priority`.
    #[inline]
    pub(crate) fn child_priority(self, priority: f32, margin: f32, side: Side) -> f32 {
        match (self, side) {
            (Metric::Hamming, side) => {
                if (margin > 0.0) == (side == Side::Right) {
                    priority
                } else {
                    priority - 1.0
                }
            }
            (_, Side::Right) => priority.min(margin),
            (_, Side::Left) => priority.min(-margin),
        }
    }

    /// Write a split plane separating `sample` into `plane`.
    ///
    /// `sample` must hold at least two items.
    pub(crate) fn create_split<R: Rng>(
        self,
        layout: &NodeLayout,
        sample: &[Node<'_>],
        rng: &mut R,
        plane: &mut NodeMut<'_>,
    ) {
        debug_assert!(sample.len() >= 2);
        plane.clear();

        match self {
            Metric::Hamming => {
                let bit = hamming_split_bit(layout.dimensions(), sample, rng);
                plane.words_mut()[0] = bit as u64;
            }
            Metric::Angular => {
                let (a, b) = two_points(sample, rng);
                let (na, nb) = (simd::norm(a.vector()), simd::norm(b.vector()));
                let normal = plane.vector_mut();
                for (z, n) in normal.iter_mut().enumerate() {
                    *n = unit(a.vector()[z], na) - unit(b.vector()[z], nb);
                }
                simd::l2_normalize(normal);
            }
            Metric::Euclidean | Metric::Manhattan => {
                let (a, b) = two_points(sample, rng);
                let (x, y) = (a.vector(), b.vector());
                let normal = plane.vector_mut();
                for (z, n) in normal.iter_mut().enumerate() {
                    *n = x[z] - y[z];
                }
                simd::l2_normalize(normal);
                // The plane passes through the midpoint of a and b
                let bias = -normal
                    .iter()
                    .enumerate()
                    .map(|(z, n)| n * (x[z] + y[z]) / 2.0)
                    .sum::<f32>();
                plane.header_mut().extra = bias;
            }
            Metric::DotProduct => {
                let (a, b) = two_points(sample, rng);
                // Angular split in the lifted space: the last coordinate is `extra`
                let lifted_norm = |n: Node<'_>| {
                    (simd::dot_product(n.vector(), n.vector()) + n.extra() * n.extra()).sqrt()
                };
                let (na, nb) = (lifted_norm(a), lifted_norm(b));
                let lift = unit(a.extra(), na) - unit(b.extra(), nb);
                let normal = plane.vector_mut();
                for (z, n) in normal.iter_mut().enumerate() {
                    *n = unit(a.vector()[z], na) - unit(b.vector()[z], nb);
                }
                let norm = (simd::dot_product(normal, normal) + lift * lift).sqrt();
                if norm > f32::EPSILON {
                    normal.iter_mut().for_each(|n| *n /= norm);
                    plane.header_mut().extra = lift / norm;
                } else {
                    plane.header_mut().extra = lift;
                }
            }
        }
    }

    /// Set the lift coordinate of every item so that all lifted vectors share
    /// the same norm. No-op for metrics other than dot.
    pub(crate) fn prepare_items(self, layout: &NodeLayout, region: &mut [u8], n_items: u32) {
        if self != Metric::DotProduct {
            return;
        }
        let sq_norm = |node: Node<'_>| simd::dot_product(node.vector(), node.vector());

        let max_sq_norm = (0..n_items)
            .map(|id| layout.node(region, id))
            .filter(|node| node.n_descendants() == 1)
            .map(sq_norm)
            .fold(0.0f32, f32::max);

        for id in 0..n_items {
            let mut slot = layout.node_mut(region, id);
            if slot.as_node().n_descendants() != 1 {
                continue;
            }
            let sq = sq_norm(slot.as_node());
            slot.header_mut().extra = (max_sq_norm - sq).max(0.0).sqrt();
        }
    }
}

/// Two distinct random members of `sample`.
fn two_points<'a, R: Rng>(sample: &[Node<'a>], rng: &mut R) -> (Node<'a>, Node<'a>) {
    let i = rng.gen_range(0..sample.len());
    let mut j = rng.gen_range(0..sample.len() - 1);
    if j >= i {
        j += 1;
    }
    (sample[i], sample[j])
}

#[inline]
fn unit(component: f32, norm: f32) -> f32 {
    if norm > 0.0 {
        component / norm
    } else {
        0.0
    }
}

fn hamming_split_bit<R: Rng>(bits: usize, sample: &[Node<'_>], rng: &mut R) -> usize {
    let test = |node: &Node<'_>, bit: usize| (node.words()[bit / 64] >> (bit % 64)) & 1;
    let separates = |bit: usize| {
        let first = test(&sample[0], bit);
        sample[1..].iter().any(|node| test(node, bit) != first)
    };

    (0..HAMMING_SPLIT_TRIES)
        .map(|_| rng.gen_range(0..bits))
        .find(|&bit| separates(bit))
        .or_else(|| (0..bits).find(|&bit| separates(bit)))
        .unwrap_or(0)
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| Error::UnknownMetric(s.to_string()))
    }
}

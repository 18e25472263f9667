// SPDX-License-Identifier: Apache-2.0
//! Rejection sampling over indexed sets.

use std::hash::Hash;

use rand::Rng;

use crate::indexed_set::IndexedSet;

/// Bounded number of uniform draws before falling back to a filtering scan.
const MAX_ATTEMPTS: usize = 100;

/// Uniformly chooses an element of `population` that is not in `excluded`.
///
/// Fast path: up to [`MAX_ATTEMPTS`] uniform draws, each rejected if it lies
/// in the exclusion set — O(1) per draw when the exclusion set is a small
/// fraction of the population. Fallback: one O(n) scan collecting the valid
/// elements, then a uniform draw among them.
///
/// Returns `None` when every element of the population is excluded (or the
/// population is empty).
pub fn rejection_sample<'a, T, K, R>(
    population: &'a IndexedSet<T, K>,
    excluded: Option<&IndexedSet<T, K>>,
    rng: &mut R,
) -> Option<&'a T>
where
    T: Clone + Eq + Hash,
    K: Clone + Eq + Hash,
    R: Rng + ?Sized,
{
    if population.is_empty() {
        return None;
    }
    let is_excluded = |item: &T| excluded.is_some_and(|ex| ex.contains(item));
    for _ in 0..MAX_ATTEMPTS {
        let choice = population.random(rng)?;
        if !is_excluded(choice) {
            return Some(choice);
        }
    }
    let valid: Vec<&T> = population.iter().filter(|item| !is_excluded(item)).collect();
    if valid.is_empty() {
        None
    } else {
        valid.get(rng.gen_range(0..valid.len())).copied()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn set_of(values: impl IntoIterator<Item = u32>) -> IndexedSet<u32, u32> {
        let mut set = IndexedSet::new();
        for v in values {
            set.add(v).unwrap();
        }
        set
    }

    #[test]
    fn never_returns_an_excluded_element() {
        let population = set_of(0..10);
        let excluded = set_of(0..9);
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..50 {
            let choice = rejection_sample(&population, Some(&excluded), &mut rng);
            assert_eq!(choice, Some(&9));
        }
    }

    #[test]
    fn fully_excluded_population_yields_none() {
        let population = set_of(0..5);
        let excluded = set_of(0..5);
        let mut rng = SmallRng::seed_from_u64(2);
        assert_eq!(rejection_sample(&population, Some(&excluded), &mut rng), None);
    }

    #[test]
    fn no_exclusions_behaves_like_uniform_choice() {
        let population = set_of([3]);
        let mut rng = SmallRng::seed_from_u64(3);
        assert_eq!(rejection_sample(&population, None, &mut rng), Some(&3));
    }
}

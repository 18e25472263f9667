// SPDX-License-Identifier: Apache-2.0
//! Shared model builders for the sitemix benchmarks.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use sitemix_core::{AgentPattern, Expr, Pattern, Rule, SitePattern, System};

/// A reversible heterodimerization model over `n` As and `n` Bs.
///
/// The classic two-rule benchmark: a large mixture, small rules, so step
/// cost is dominated by index maintenance rather than matching.
#[must_use]
pub fn heterodimerization(n: usize, seed: u64) -> System {
    let site = |label: &str| SitePattern::new(label);
    let free_a = Pattern::new(vec![AgentPattern::new("A", [site("x").empty()])]).unwrap();
    let free_b = Pattern::new(vec![AgentPattern::new("B", [site("x").empty()])]).unwrap();
    let unbound = Pattern::new(vec![
        AgentPattern::new("A", [site("x").empty()]),
        AgentPattern::new("B", [site("x").empty()]),
    ])
    .unwrap();
    let bound = Pattern::new(vec![
        AgentPattern::new("A", [site("x").bond(1)]),
        AgentPattern::new("B", [site("x").bond(1)]),
    ])
    .unwrap();

    let bind = Rule::new(unbound.clone(), bound.clone(), 1e-3).unwrap();
    let unbind = Rule::new(bound.clone(), unbound, 2.5).unwrap();
    let pairs = bound.into_component().unwrap();

    System::builder()
        .rule(bind)
        .rule(unbind)
        .observable("AB", Expr::count(pairs))
        .init(free_a, n)
        .init(free_b, n)
        .seed(seed)
        .build()
        .unwrap()
}

// SPDX-License-Identifier: Apache-2.0
//! Rule application walks: driving selections by hand and checking the
//! observable counts after every applied update.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use rand::rngs::SmallRng;
use rand::SeedableRng;
use sitemix_core::{AgentPattern, Component, Mixture, Pattern, Rule, SitePattern};

fn site(label: &str) -> SitePattern {
    SitePattern::new(label)
}

fn component(agents: Vec<AgentPattern>) -> Component {
    Pattern::new(agents).unwrap().into_component().unwrap()
}

fn prepare(mixture_pattern: &Pattern, copies: usize, rule: &Rule, observables: &[Component]) -> Mixture {
    let mut mixture = Mixture::new();
    mixture.instantiate(mixture_pattern, copies).unwrap();
    for c in rule.left().components() {
        mixture.track_component(c).unwrap();
    }
    for c in observables {
        mixture.track_component(c).unwrap();
    }
    mixture
}

#[test]
fn unbinding_runs_to_completion() {
    let n = 10;
    let bound = Pattern::new(vec![
        AgentPattern::new("A", [site("a").bond(1)]),
        AgentPattern::new("B", [site("b").bond(1)]),
    ])
    .unwrap();
    let free = Pattern::new(vec![
        AgentPattern::new("A", [site("a").empty()]),
        AgentPattern::new("B", [site("b").empty()]),
    ])
    .unwrap();
    let rule = Rule::new(bound.clone(), free, 1.0).unwrap();

    let observables = vec![
        component(vec![
            AgentPattern::new("A", [site("a").bond(1)]),
            AgentPattern::new("B", [site("b").bond(1)]),
        ]),
        component(vec![AgentPattern::new("A", [site("a").empty()])]),
        component(vec![AgentPattern::new("B", [site("b").link_wildcard()])]),
    ];
    let mut mixture = prepare(&bound, n, &rule, &observables);
    let mut rng = SmallRng::seed_from_u64(11);

    assert_eq!(rule.n_embeddings(&mixture), n as u64);
    assert_eq!(mixture.embedding_count(&observables[0]), Some(n));
    assert_eq!(mixture.embedding_count(&observables[1]), Some(0));

    for i in 1..=n {
        let update = rule.select(&mixture, &mut rng).expect("embeddings remain");
        assert_eq!(update.edges_to_remove().len(), 1);
        mixture.apply_update(update).unwrap();

        assert_eq!(mixture.embedding_count(&observables[0]), Some(n - i));
        assert_eq!(mixture.embedding_count(&observables[1]), Some(i));
        assert_eq!(mixture.embedding_count(&observables[2]), Some(n));
    }
    assert_eq!(rule.n_embeddings(&mixture), 0);
}

#[test]
fn bond_creation_saturates() {
    let n = 4;
    let free = Pattern::new(vec![
        AgentPattern::new("A", [site("a").empty()]),
        AgentPattern::new("B", [site("b").empty()]),
    ])
    .unwrap();
    let bound = Pattern::new(vec![
        AgentPattern::new("A", [site("a").bond(1)]),
        AgentPattern::new("B", [site("b").bond(1)]),
    ])
    .unwrap();
    let rule = Rule::new(free.clone(), bound.clone(), 1.0).unwrap();
    let pairs = bound.into_component().unwrap();

    let mut mixture = prepare(&free, n, &rule, std::slice::from_ref(&pairs));
    let mut rng = SmallRng::seed_from_u64(5);

    assert_eq!(rule.n_embeddings(&mixture), (n * n) as u64);
    assert_eq!(mixture.embedding_count(&pairs), Some(0));

    for _ in 0..n {
        let update = rule.select(&mixture, &mut rng).expect("free sites remain");
        assert_eq!(update.edges_to_add().len(), 1);
        mixture.apply_update(update).unwrap();
    }
    assert_eq!(mixture.embedding_count(&pairs), Some(n));
    assert_eq!(rule.n_embeddings(&mixture), 0);
}

#[test]
fn mixed_rewrite_moves_bonds_and_states() {
    // A(a[1]), B(b[1], x[3]), C(c[2]{p}), D(d[2]{p}, x[3])
    //   -> A(a[1]), B(b[.], x[3]), C(c[1]{u}), D(d[.]{p}, x[3])
    // per application: two bonds removed, one added, one state changed.
    let n = 50;
    let mixture_pattern = Pattern::new(vec![
        AgentPattern::new("A", [site("a").bond(1)]),
        AgentPattern::new("B", [site("b").bond(1), site("x").bond(3)]),
        AgentPattern::new("C", [site("c").bond(2).state("p")]),
        AgentPattern::new("D", [site("d").bond(2).state("p"), site("x").bond(3)]),
    ])
    .unwrap();
    let left = mixture_pattern.clone();
    let right = Pattern::new(vec![
        AgentPattern::new("A", [site("a").bond(1)]),
        AgentPattern::new("B", [site("b").empty(), site("x").bond(3)]),
        AgentPattern::new("C", [site("c").bond(1).state("u")]),
        AgentPattern::new("D", [site("d").empty().state("p"), site("x").bond(3)]),
    ])
    .unwrap();
    let rule = Rule::new(left, right, 1.0).unwrap();

    let observables = vec![
        component(vec![
            AgentPattern::new("A", [site("a").bond(1)]),
            AgentPattern::new("B", [site("b").bond(1), site("x").bond(3)]),
            AgentPattern::new("C", [site("c").bond(2).state("p")]),
            AgentPattern::new("D", [site("d").bond(2).state("p"), site("x").bond(3)]),
        ]),
        component(vec![
            AgentPattern::new("A", [site("a").bond(1)]),
            AgentPattern::new("C", [site("c").bond(1)]),
        ]),
        component(vec![AgentPattern::new("B", [site("b").bound()])]),
        component(vec![AgentPattern::new("C", [site("c").state("u")])]),
    ];
    let mut mixture = prepare(&mixture_pattern, n, &rule, &observables);
    let mut rng = SmallRng::seed_from_u64(23);

    assert_eq!(rule.n_embeddings(&mixture), n as u64);
    assert_eq!(mixture.embedding_count(&observables[0]), Some(n));
    assert_eq!(mixture.embedding_count(&observables[1]), Some(0));

    for i in 1..=n {
        let update = rule.select(&mixture, &mut rng).expect("embeddings remain");
        assert_eq!(update.edges_to_remove().len(), 2);
        assert_eq!(update.edges_to_add().len(), 1);
        assert_eq!(update.state_changes().len(), 1);
        mixture.apply_update(update).unwrap();

        assert_eq!(mixture.embedding_count(&observables[0]), Some(n - i));
        assert_eq!(mixture.embedding_count(&observables[1]), Some(i));
        assert_eq!(mixture.embedding_count(&observables[2]), Some(n - i));
        assert_eq!(mixture.embedding_count(&observables[3]), Some(i));
    }
}

#[test]
fn unimolecular_selection_uses_one_complex() {
    // Dimers whose sites are all {u}; the unimolecular rule flips both
    // states inside one complex per application.
    let n = 20;
    let dimer = Pattern::new(vec![
        AgentPattern::new("A", [site("a").bond(1).state("u")]),
        AgentPattern::new("B", [site("b").bond(1).state("u")]),
    ])
    .unwrap();
    let left = Pattern::new(vec![
        AgentPattern::new("A", [site("a").state("u")]),
        AgentPattern::new("B", [site("b").state("u")]),
    ])
    .unwrap();
    let right = Pattern::new(vec![
        AgentPattern::new("A", [site("a").state("p")]),
        AgentPattern::new("B", [site("b").state("p")]),
    ])
    .unwrap();
    let rule = Rule::unimolecular(left, right, 1.0).unwrap();
    let fresh = component(vec![
        AgentPattern::new("A", [site("a").bond(1).state("u")]),
        AgentPattern::new("B", [site("b").bond(1).state("u")]),
    ]);

    let mut mixture = prepare(&dimer, n, &rule, std::slice::from_ref(&fresh));
    let mut rng = SmallRng::seed_from_u64(3);

    for i in 1..=n {
        assert_eq!(rule.n_embeddings(&mixture), (n - i + 1) as u64);
        let update = rule.select(&mixture, &mut rng).expect("complexes remain");
        mixture.apply_update(update).unwrap();
        assert_eq!(mixture.embedding_count(&fresh), Some(n - i));
    }
    assert_eq!(rule.n_embeddings(&mixture), 0);
}

#[test]
fn bimolecular_dimerization_counts_pairs_of_complexes() {
    // A(a{u}) agents dimerize across complexes: after i applications the
    // weight is 2 · C(n−2i, 2).
    let n = 30usize;
    let single = Pattern::new(vec![AgentPattern::new("A", [site("a").empty().state("u")])])
        .unwrap();
    let left = Pattern::new(vec![
        AgentPattern::new("A", [site("a").state("u")]),
        AgentPattern::new("A", [site("a").state("u")]),
    ])
    .unwrap();
    let right = Pattern::new(vec![
        AgentPattern::new("A", [site("a").bond(1).state("p")]),
        AgentPattern::new("A", [site("a").bond(1).state("p")]),
    ])
    .unwrap();
    let rule = Rule::bimolecular(left, right, 1.0).unwrap();
    let dimer = component(vec![
        AgentPattern::new("A", [site("a").bond(1).state("p")]),
        AgentPattern::new("A", [site("a").bond(1).state("p")]),
    ]);

    let mut mixture = prepare(&single, n, &rule, std::slice::from_ref(&dimer));
    let mut rng = SmallRng::seed_from_u64(17);

    let choose2 = |k: usize| (k * k.saturating_sub(1) / 2) as u64;
    for i in 1..=(n / 2) {
        assert_eq!(rule.n_embeddings(&mixture), 2 * choose2(n - 2 * (i - 1)));
        let update = rule.select(&mixture, &mut rng).expect("free monomers remain");
        mixture.apply_update(update).unwrap();
        // The dimer observable counts both automorphic images.
        assert_eq!(mixture.embedding_count(&dimer), Some(2 * i));
    }
    assert_eq!(rule.n_embeddings(&mixture), 0);
}

#[test]
fn agent_creation_and_deletion_conserve_the_tally() {
    // A() -> A(), X(): each application adds one X; X() -> (empty slot)
    // removes one.
    let a = Pattern::new(vec![AgentPattern::new("A", [])]).unwrap();
    let spawn_left = Pattern::from_slots(vec![
        Some(AgentPattern::new("A", [])),
        None,
    ])
    .unwrap();
    let spawn_right = Pattern::new(vec![
        AgentPattern::new("A", []),
        AgentPattern::new("X", []),
    ])
    .unwrap();
    let spawn = Rule::new(spawn_left, spawn_right, 1.0).unwrap();

    let decay_left = Pattern::new(vec![AgentPattern::new("X", [])]).unwrap();
    let decay_right = Pattern::from_slots(vec![None]).unwrap();
    let decay = Rule::new(decay_left, decay_right, 1.0).unwrap();

    let mut mixture = Mixture::new();
    mixture.instantiate(&a, 1).unwrap();
    for c in spawn.left().components().iter().chain(decay.left().components()) {
        mixture.track_component(c).unwrap();
    }
    let mut rng = SmallRng::seed_from_u64(9);

    for _ in 0..5 {
        let update = spawn.select(&mixture, &mut rng).expect("A persists");
        assert_eq!(update.created_agents().len(), 1);
        mixture.apply_update(update).unwrap();
    }
    assert_eq!(mixture.agents_of_type("X").len(), 5);
    assert_eq!(mixture.agent_count(), 6);

    for i in (0..5usize).rev() {
        let update = decay.select(&mixture, &mut rng).expect("an X remains");
        assert_eq!(update.removed_agents().len(), 1);
        mixture.apply_update(update).unwrap();
        assert_eq!(mixture.agents_of_type("X").len(), i);
    }
    assert_eq!(decay.n_embeddings(&mixture), 0);
    assert_eq!(mixture.agent_count(), 1);
}

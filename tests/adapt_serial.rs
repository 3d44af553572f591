//! Serial adaptation scenarios: global refinement, marker-driven circular
//! refinement with a balance-disabled region, and the structural invariants
//! that must hold after every mutation.

use para_octree::{NoComm, Octant, ParaTree};

fn assert_structural_invariants(tree: &ParaTree<NoComm>) {
    let dim = tree.get_dim();
    let mut prev: Option<(u64, u8)> = None;
    for idx in 0..tree.get_num_octants() {
        let oct: &Octant = tree.get_octant(idx);
        let key = (oct.morton(dim), oct.level());
        if let Some(p) = prev {
            assert!(key > p, "octants not strictly Morton-sorted at {idx}");
        }
        prev = Some(key);

        assert!(oct.level() <= tree.get_max_level());
        let size = oct.size();
        for axis in 0..dim as usize {
            let c = oct.coords()[axis];
            assert_eq!(c % size, 0, "anchor misaligned at {idx}");
            assert!(c + size <= tree.get_max_length());
        }
    }
}

#[test]
fn single_root_then_two_global_refines() {
    let mut tree = ParaTree::new(2, NoComm).unwrap();
    assert_eq!(tree.get_num_octants(), 1);
    assert_eq!(tree.get_level(0), 0);

    tree.adapt_global_refine(false).unwrap();
    assert!(tree.adapt_global_refine(false).unwrap());

    assert_eq!(tree.get_num_octants(), 16);
    let cell = (tree.get_octant(0).size() as u64).pow(2);
    for i in 0..16 {
        assert_eq!(tree.get_level(i), 2);
        assert_eq!(tree.get_morton(i), i as u64 * cell);
        assert!(tree.get_is_new_r(i));
        assert!(!tree.get_is_new_c(i));
    }
    assert_structural_invariants(&tree);
}

#[test]
fn circular_region_refinement_with_balance_off_region() {
    let mut tree = ParaTree::new(2, NoComm).unwrap();
    tree.adapt_global_refine(false).unwrap();

    let (xc, yc, radius) = (0.5, 0.5, 0.4);

    // 2:1 balance through faces only, disabled on the right half.
    tree.set_balance_codim(1).unwrap();
    for i in 0..tree.get_num_octants() {
        if tree.get_center(i)[0] > xc {
            tree.set_balance(i, false).unwrap();
        }
    }

    for _ in 0..6 {
        for i in 0..tree.get_num_octants() {
            let center = tree.get_center(i);
            let (x, y) = (center[0], center[1]);
            if (x - xc).powi(2) + (y - yc).powi(2) < radius * radius && y < yc {
                tree.set_marker(i, 1).unwrap();
            }
        }
        // Newly created octants keep the balance flag of their parent.
        let before = tree.get_num_octants();
        tree.adapt(false).unwrap();
        assert!(tree.get_num_octants() >= before);
    }

    assert_structural_invariants(&tree);
    assert!(tree.check_21_balance());
    assert_eq!(tree.get_local_max_depth(), 7);

    // Octants well inside the refined region reached level 7; the margin
    // keeps boundary-straddling cells out of the check.
    for i in 0..tree.get_num_octants() {
        let center = tree.get_center(i);
        let (x, y) = (center[0], center[1]);
        if (x - xc).powi(2) + (y - yc).powi(2) < 0.3 * 0.3 && y < 0.4 {
            assert!(
                tree.get_level(i) >= 7,
                "octant {i} at ({x:.3}, {y:.3}) has level {}",
                tree.get_level(i)
            );
        }
    }

    // The disabled half may violate 2:1, and with this refinement pattern
    // it actually does somewhere along the centerline.
    let mut unbalanced_exists = false;
    for i in 0..tree.get_num_octants() {
        if tree.get_balance(i) {
            continue;
        }
        for f in 0..tree.get_nfaces() {
            let (neigh, is_ghost) = tree.find_neighbours(i, f, 1);
            for (k, &n) in neigh.iter().enumerate() {
                assert!(!is_ghost[k]);
                let delta = tree.get_level(n) as i16 - tree.get_level(i) as i16;
                if delta.abs() > 1 {
                    unbalanced_exists = true;
                }
            }
        }
    }
    assert!(unbalanced_exists);
}

#[test]
fn adapt_with_zero_markers_returns_false() {
    let mut tree = ParaTree::new(2, NoComm).unwrap();
    tree.adapt_global_refine(false).unwrap();
    tree.adapt_global_refine(false).unwrap();
    let count = tree.get_num_octants();
    let status = tree.get_status();

    assert!(!tree.adapt(false).unwrap());
    assert!(!tree.adapt(true).unwrap());
    assert_eq!(tree.get_num_octants(), count);
    assert_eq!(tree.get_status(), status);
}

#[test]
fn global_coarse_collapses_families() {
    let mut tree = ParaTree::new(2, NoComm).unwrap();
    tree.adapt_global_refine(false).unwrap();
    tree.adapt_global_refine(false).unwrap();
    assert_eq!(tree.get_num_octants(), 16);

    assert!(tree.adapt_global_coarse(false).unwrap());
    assert_eq!(tree.get_num_octants(), 4);
    for i in 0..4 {
        assert_eq!(tree.get_level(i), 1);
        assert!(tree.get_is_new_c(i));
    }
    assert_structural_invariants(&tree);
}

#[test]
fn coarsening_stops_at_the_root() {
    let mut tree = ParaTree::new(3, NoComm).unwrap();
    tree.adapt_global_refine(false).unwrap();
    assert_eq!(tree.get_num_octants(), 8);

    tree.adapt_global_coarse(false).unwrap();
    assert_eq!(tree.get_num_octants(), 1);
    assert_eq!(tree.get_level(0), 0);

    // The root cannot coarsen further.
    assert!(!tree.adapt_global_coarse(false).unwrap());
    assert_eq!(tree.get_num_octants(), 1);
}

#[test]
fn settled_markers_are_a_balance_fixpoint() {
    let mut tree = ParaTree::new(2, NoComm).unwrap();
    tree.adapt_global_refine(false).unwrap();
    tree.adapt_global_refine(false).unwrap();

    tree.set_marker(0, 3).unwrap();
    tree.settle_markers().unwrap();

    let markers: Vec<i8> = (0..tree.get_num_octants())
        .map(|i| tree.get_marker(i))
        .collect();

    // A second settle must not raise anything further.
    tree.settle_markers().unwrap();
    let again: Vec<i8> = (0..tree.get_num_octants())
        .map(|i| tree.get_marker(i))
        .collect();
    assert_eq!(markers, again);

    // And adapting the settled markers yields a balanced tree.
    tree.adapt(false).unwrap();
    assert!(tree.check_21_balance());
    assert_structural_invariants(&tree);
}

#[test]
fn connectivity_shares_corner_nodes() {
    let mut tree = ParaTree::new(2, NoComm).unwrap();
    tree.adapt_global_refine(false).unwrap();
    tree.set_marker(0, 1).unwrap();
    tree.adapt(false).unwrap();
    tree.compute_connectivity();

    // Every pair of octants sharing a logical corner references the same
    // node index.
    let n = tree.get_num_octants();
    for a in 0..n {
        for b in 0..n {
            if a == b {
                continue;
            }
            for ka in 0..tree.get_nnodes() {
                for kb in 0..tree.get_nnodes() {
                    let key_a = tree.compute_node_persistent_key(a, ka);
                    let key_b = tree.compute_node_persistent_key(b, kb);
                    if key_a == key_b {
                        assert_eq!(
                            tree.get_connectivity(a)[ka as usize],
                            tree.get_connectivity(b)[kb as usize]
                        );
                    }
                }
            }
        }
    }

    // Node coordinates are consistent with the octant corners.
    for i in 0..n {
        for k in 0..tree.get_nnodes() {
            let node = tree.get_connectivity(i)[k as usize];
            assert_eq!(tree.get_node_coordinates(node), tree.get_node(i, k));
        }
    }
}

#[test]
fn intersections_enumerate_shared_faces() {
    let mut tree = ParaTree::new(2, NoComm).unwrap();
    tree.adapt_global_refine(false).unwrap();
    tree.set_marker(0, 1).unwrap();
    tree.adapt(false).unwrap();
    tree.compute_intersections();

    // 7 octants: quadrant 0 is split in four. Interior faces: 4 inside the
    // split quadrant, 2 + 2 hanging faces against quadrants 1 and 2, and 2
    // between the coarse quadrants.
    let inner = (0..tree.get_num_intersections())
        .filter(|&i| !tree.get_intersection(i).is_bound)
        .count();
    assert_eq!(inner, 10);

    for i in 0..tree.get_num_intersections() {
        let inter = *tree.get_intersection(i);
        if inter.is_bound {
            assert_eq!(inter.owners[0], inter.owners[1]);
            continue;
        }
        let [h_in, h_out] = tree.get_intersection_owners(&inter);
        let level_in = tree.resolve(h_in).level();
        let level_out = tree.resolve(h_out).level();
        let finer_level = tree.get_intersection_level(&inter);
        assert_eq!(finer_level, level_in.max(level_out));
        assert!((level_in as i16 - level_out as i16).abs() <= 1);
    }
}

#[test]
fn periodic_domain_wraps_neighbours() {
    let mut tree = ParaTree::new(2, NoComm).unwrap();
    tree.set_periodic(0).unwrap();
    assert!(tree.get_periodic()[0] && tree.get_periodic()[1]);

    tree.adapt_global_refine(false).unwrap();
    // Leftmost bottom cell: across -x it wraps to the rightmost column.
    let (neigh, _) = tree.find_neighbours(0, 0, 1);
    assert_eq!(neigh.len(), 1);
    assert!(tree.get_center(neigh[0])[0] > 0.5);

    // The non-periodic -y face still has no neighbor.
    let (neigh, _) = tree.find_neighbours(0, 2, 1);
    assert!(neigh.is_empty());
}

#[test]
fn randomized_adapt_rounds_keep_invariants() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(0x0c7a_17ee);
    let mut tree = ParaTree::new(2, NoComm).unwrap();
    tree.adapt_global_refine(false).unwrap();

    for _ in 0..5 {
        for i in 0..tree.get_num_octants() {
            tree.set_marker(i, rng.gen_range(-1..=1)).unwrap();
        }
        tree.adapt(false).unwrap();
        assert!(tree.check_21_balance());
        assert_structural_invariants(&tree);
    }
}

#[test]
fn multi_level_markers_refine_stepwise() {
    let mut tree = ParaTree::new(2, NoComm).unwrap();
    tree.set_marker(0, 3).unwrap();
    tree.adapt(false).unwrap();

    // The root refines three levels; 2:1 balance holds trivially.
    assert_eq!(tree.get_local_max_depth(), 3);
    assert_eq!(tree.get_num_octants(), 64);
    assert_structural_invariants(&tree);
}

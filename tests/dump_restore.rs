//! Binary dump format checks: exact version-1 layout, full-dump extras and
//! failure behavior on corrupted headers.

use para_octree::{NoComm, OctreeError, Operation, ParaTree};

/// Header bytes before the octant records, for `n_faces` periodic flags:
/// version(4) nproc(4) dim(1) serial(1) layers(8) max_depth(1) status(8)
/// codim(1) periodic(n_faces).
fn header_len(n_faces: usize) -> usize {
    4 + 4 + 1 + 1 + 8 + 1 + 8 + 1 + n_faces
}

/// One octant record: level(1) x(4) y(4) z(4) ghost_layer(4) info(16)
/// balance(1) marker(1).
const OCTANT_RECORD: usize = 1 + 4 + 4 + 4 + 4 + 16 + 1 + 1;

#[test]
fn version1_layout_of_a_root_dump() {
    let tree = ParaTree::new(2, NoComm).unwrap();
    let mut buf = Vec::new();
    tree.dump(&mut buf, false).unwrap();

    // header + counts(8) + one octant + 3 partition arrays + full flag.
    let expected = header_len(4) + 8 + OCTANT_RECORD + 3 * 8 + 1;
    assert_eq!(buf.len(), expected);

    assert_eq!(i32::from_le_bytes(buf[0..4].try_into().unwrap()), 1);
    assert_eq!(i32::from_le_bytes(buf[4..8].try_into().unwrap()), 1);
    assert_eq!(buf[8], 2, "dimension byte");
    assert_eq!(buf[9], 1, "serial byte");
    assert_eq!(
        u64::from_le_bytes(buf[10..18].try_into().unwrap()),
        1,
        "ghost layers"
    );
    assert_eq!(buf[18] as i8, 0, "max depth");
    // status(8) at 19..27, codim at 27.
    assert_eq!(buf[27], 1, "balance codimension");
    // periodic flags all clear.
    assert_eq!(&buf[28..32], &[0, 0, 0, 0]);
    // local and global octant counts.
    assert_eq!(u32::from_le_bytes(buf[32..36].try_into().unwrap()), 1);
    assert_eq!(u32::from_le_bytes(buf[36..40].try_into().unwrap()), 1);
    // The root record: level 0 at the domain origin, internal.
    assert_eq!(buf[40], 0, "root level");
    assert_eq!(u32::from_le_bytes(buf[41..45].try_into().unwrap()), 0);
    assert_eq!(
        i32::from_le_bytes(buf[53..57].try_into().unwrap()),
        -1,
        "ghost layer of an internal octant"
    );
    // No full section.
    assert_eq!(*buf.last().unwrap(), 0);
}

#[test]
fn full_dump_appends_the_mapping_state() {
    let mut tree = ParaTree::new(2, NoComm).unwrap();
    tree.adapt_global_refine(false).unwrap();
    tree.set_marker(0, 1).unwrap();
    tree.adapt(true).unwrap();
    assert_eq!(tree.get_last_operation(), Operation::AdaptMapped);

    let mut plain = Vec::new();
    tree.dump(&mut plain, false).unwrap();
    let mut full = Vec::new();
    tree.dump(&mut full, true).unwrap();

    // op tag(4) + map_len(8) + 7 entries(28) + bros_len(8).
    assert_eq!(full.len(), plain.len() + 4 + 8 + 7 * 4 + 8);
    assert_eq!(plain.last(), Some(&0));

    let restored = ParaTree::restore(&mut full.as_slice(), NoComm).unwrap();
    assert_eq!(restored.get_last_operation(), Operation::AdaptMapped);
    for i in 0..restored.get_num_octants() {
        assert_eq!(restored.get_mapping(i).unwrap(), tree.get_mapping(i).unwrap());
    }

    // A plain dump restores into the initial operation state, mapping gone.
    let restored = ParaTree::restore(&mut plain.as_slice(), NoComm).unwrap();
    assert_eq!(restored.get_last_operation(), Operation::Init);
    assert!(matches!(
        restored.get_mapping(0),
        Err(OctreeError::MappingUnavailable)
    ));
}

#[test]
fn periodic_flags_survive_the_round_trip() {
    let mut tree = ParaTree::new(3, NoComm).unwrap();
    tree.set_periodic(4).unwrap();
    tree.adapt_global_refine(false).unwrap();

    let mut buf = Vec::new();
    tree.dump(&mut buf, false).unwrap();
    let restored = ParaTree::restore(&mut buf.as_slice(), NoComm).unwrap();

    assert_eq!(restored.get_periodic(), tree.get_periodic());
    assert!(restored.get_periodic()[4] && restored.get_periodic()[5]);
}

#[test]
fn truncated_stream_fails_cleanly() {
    let mut tree = ParaTree::new(2, NoComm).unwrap();
    tree.adapt_global_refine(false).unwrap();
    let mut buf = Vec::new();
    tree.dump(&mut buf, false).unwrap();

    buf.truncate(buf.len() / 2);
    assert!(matches!(
        ParaTree::restore(&mut buf.as_slice(), NoComm),
        Err(OctreeError::Io(_))
    ));
}

#[test]
fn dumped_state_is_observably_identical() {
    let mut tree = ParaTree::new(3, NoComm).unwrap();
    tree.adapt_global_refine(false).unwrap();
    tree.set_marker(5, 1).unwrap();
    tree.set_marker(2, -1).unwrap();
    tree.adapt(false).unwrap();
    tree.set_balance(0, false).unwrap();
    tree.set_marker(1, -1).unwrap();

    let mut buf = Vec::new();
    tree.dump(&mut buf, true).unwrap();
    let restored = ParaTree::restore(&mut buf.as_slice(), NoComm).unwrap();

    assert_eq!(restored.get_num_octants(), tree.get_num_octants());
    assert_eq!(restored.get_status(), tree.get_status());
    assert_eq!(restored.get_balance_codim(), tree.get_balance_codim());
    for i in 0..tree.get_num_octants() {
        assert_eq!(restored.get_level(i), tree.get_level(i));
        assert_eq!(restored.get_morton(i), tree.get_morton(i));
        assert_eq!(restored.get_marker(i), tree.get_marker(i));
        assert_eq!(restored.get_balance(i), tree.get_balance(i));
        assert_eq!(restored.get_is_new_r(i), tree.get_is_new_r(i));
        assert_eq!(restored.get_is_new_c(i), tree.get_is_new_c(i));
        assert_eq!(restored.get_persistent_idx(i), tree.get_persistent_idx(i));
    }
}

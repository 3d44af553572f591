//! The process-local portion of the linear octree.
//!
//! `LocalTree` owns a strictly Morton-sorted vector of internal octants plus
//! the mirrored ghost octants of neighboring processes, and implements every
//! serial building block of the tree: neighbor search by face/edge/node,
//! the refinement and coarsening sweeps, the local 2:1 balance fixpoint and
//! the lazily built connectivity and intersection views.
//!
//! Octants are ordered by `(anchor Morton, level)`; ancestors precede
//! descendants with the same anchor. Indices into `octants` and `ghosts` are
//! only stable between mutations.

use crate::tree::constants::{TreeConstants, MAX_LENGTH, MAX_LEVEL};
use crate::tree::morton;
use crate::tree::octant::Octant;

/// Handle to an octant in its container: `(local index, ghost flag)`.
///
/// Replaces octant pointers in all public APIs; handles are invalidated by
/// any adapt or load balance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TreeHandle {
    pub idx: u32,
    pub is_ghost: bool,
}

/// Kind of a codimension entity of an octant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    Face,
    Edge,
    Node,
}

/// An oriented face shared by two octants (or one octant and the domain
/// boundary).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Intersection {
    /// Owner indices: `owners[0]` is always internal, `owners[1]` may be a
    /// ghost. Boundary intersections repeat the internal owner.
    pub owners: [u32; 2],
    /// Face index relative to `owners[0]`.
    pub face: u8,
    /// Which owner is the finer one (0 or 1).
    pub finer: u8,
    /// Whether `owners[1]` lives in the ghost container.
    pub out_is_ghost: bool,
    /// Whether this is a domain-boundary face.
    pub is_bound: bool,
    /// Whether the face crosses a partition boundary.
    pub is_pbound: bool,
}

struct StraddleHead {
    local_count: usize,
    ghost_bros: Vec<u32>,
}

struct StraddleTail {
    start: usize,
    ghost_bros: Vec<u32>,
}

/// Morton-sorted storage and serial algorithms of one process's octants.
pub struct LocalTree {
    dim: u8,
    tc: &'static TreeConstants,
    pub(crate) octants: Vec<Octant>,
    pub(crate) ghosts: Vec<Octant>,
    pub(crate) ghost_global_ids: Vec<u64>,
    /// `(source rank, first ghost index, count)` per contributing rank, in
    /// ascending rank order. Receivers of marker exchanges write into these
    /// spans.
    pub(crate) ghost_rank_spans: Vec<(usize, u32, u32)>,
    first_desc_morton: u64,
    last_desc_morton: u64,
    local_max_depth: u8,
    periodic: [bool; 6],
    balance_codim: u8,
    /// Ghost indices completing a sibling family that starts on a previous
    /// rank (head straddle) after the last coarsening sweep.
    pub(crate) first_ghost_bros: Vec<u32>,
    /// Ghost indices completing a sibling family whose first child is the
    /// local tail (tail straddle) after the last coarsening sweep.
    pub(crate) last_ghost_bros: Vec<u32>,
    nodes: Vec<[u32; 3]>,
    connectivity: Vec<Vec<u32>>,
    ghosts_connectivity: Vec<Vec<u32>>,
    intersections: Vec<Intersection>,
}

impl LocalTree {
    /// Create a tree holding the single root octant.
    pub fn with_root(tc: &'static TreeConstants) -> Self {
        let root = Octant::root(tc);
        let dim = tc.dim;
        let first = root.morton(dim);
        let last = root.last_desc_morton(dim);
        Self {
            dim,
            tc,
            octants: vec![root],
            ghosts: Vec::new(),
            ghost_global_ids: Vec::new(),
            ghost_rank_spans: Vec::new(),
            first_desc_morton: first,
            last_desc_morton: last,
            local_max_depth: 0,
            periodic: [false; 6],
            balance_codim: 1,
            first_ghost_bros: Vec::new(),
            last_ghost_bros: Vec::new(),
            nodes: Vec::new(),
            connectivity: Vec::new(),
            ghosts_connectivity: Vec::new(),
            intersections: Vec::new(),
        }
    }

    /// Create an empty tree (used by restore).
    pub fn empty(tc: &'static TreeConstants) -> Self {
        let mut tree = Self::with_root(tc);
        tree.octants.clear();
        tree.first_desc_morton = u64::MAX;
        tree.last_desc_morton = 0;
        tree
    }

    #[inline]
    pub fn dim(&self) -> u8 {
        self.dim
    }

    #[inline]
    pub fn constants(&self) -> &'static TreeConstants {
        self.tc
    }

    #[inline]
    pub fn num_octants(&self) -> u32 {
        self.octants.len() as u32
    }

    #[inline]
    pub fn num_ghosts(&self) -> u32 {
        self.ghosts.len() as u32
    }

    #[inline]
    pub fn octant(&self, idx: u32) -> &Octant {
        &self.octants[idx as usize]
    }

    #[inline]
    pub fn octant_mut(&mut self, idx: u32) -> &mut Octant {
        &mut self.octants[idx as usize]
    }

    #[inline]
    pub fn ghost(&self, idx: u32) -> &Octant {
        &self.ghosts[idx as usize]
    }

    /// Resolve a handle against the internal or ghost container.
    #[inline]
    pub fn resolve(&self, handle: TreeHandle) -> &Octant {
        if handle.is_ghost {
            &self.ghosts[handle.idx as usize]
        } else {
            &self.octants[handle.idx as usize]
        }
    }

    #[inline]
    pub fn local_max_depth(&self) -> u8 {
        self.local_max_depth
    }

    #[inline]
    pub fn first_desc_morton(&self) -> u64 {
        self.first_desc_morton
    }

    #[inline]
    pub fn last_desc_morton(&self) -> u64 {
        self.last_desc_morton
    }

    #[inline]
    pub fn periodic(&self) -> &[bool; 6] {
        &self.periodic
    }

    /// Mark a face (and its opposite) as periodic.
    pub fn set_periodic(&mut self, face: u8) {
        self.periodic[face as usize] = true;
        self.periodic[self.tc.opp_face[face as usize] as usize] = true;
    }

    #[inline]
    pub fn balance_codim(&self) -> u8 {
        self.balance_codim
    }

    pub fn set_balance_codim(&mut self, codim: u8) {
        self.balance_codim = codim;
    }

    /// Recompute the cached local Morton endpoints.
    pub fn update_descendants(&mut self) {
        self.first_desc_morton = self
            .octants
            .first()
            .map(|o| o.morton(self.dim))
            .unwrap_or(u64::MAX);
        self.last_desc_morton = self
            .octants
            .last()
            .map(|o| o.last_desc_morton(self.dim))
            .unwrap_or(0);
    }

    /// Recompute the deepest local level.
    pub fn update_local_max_depth(&mut self) {
        self.local_max_depth = self.octants.iter().map(|o| o.level()).max().unwrap_or(0);
    }

    // ----------------------------------------------------------------- //
    // Entities                                                          //
    // ----------------------------------------------------------------- //

    /// Map a codimension to the entity kind for this dimension.
    pub fn entity_kind(&self, codim: u8) -> Option<EntityKind> {
        match (self.dim, codim) {
            (_, 1) => Some(EntityKind::Face),
            (3, 2) => Some(EntityKind::Edge),
            (2, 2) | (3, 3) => Some(EntityKind::Node),
            _ => None,
        }
    }

    /// Number of entities of the given kind per octant.
    pub fn entity_count(&self, kind: EntityKind) -> u8 {
        match kind {
            EntityKind::Face => self.tc.n_faces,
            EntityKind::Edge => self.tc.n_edges,
            EntityKind::Node => self.tc.n_nodes,
        }
    }

    fn entity_coeff(&self, kind: EntityKind, idx: u8) -> [i8; 3] {
        match kind {
            EntityKind::Face => self.tc.normals[idx as usize],
            EntityKind::Edge => self.tc.edge_coeffs[idx as usize],
            EntityKind::Node => self.tc.node_coeffs[idx as usize],
        }
    }

    /// Closed bounding box of an entity in the octant's own frame.
    fn entity_box(&self, oct: &Octant, kind: EntityKind, idx: u8) -> ([u32; 3], [u32; 3]) {
        match kind {
            EntityKind::Face => {
                let nodes = &self.tc.face_node[idx as usize];
                let min = oct.logical_node(nodes[0]);
                let max = oct.logical_node(nodes[self.tc.n_nodes_per_face as usize - 1]);
                (min, max)
            }
            EntityKind::Edge => {
                let nodes = &self.tc.edge_node[idx as usize];
                (oct.logical_node(nodes[0]), oct.logical_node(nodes[1]))
            }
            EntityKind::Node => {
                let p = oct.logical_node(idx);
                (p, p)
            }
        }
    }

    /// Anchor of the same-size virtual neighbor block across an entity, with
    /// the periodic shift that was applied per axis. `None` when the entity
    /// lies on a non-periodic domain boundary.
    fn virtual_block(&self, oct: &Octant, coeff: [i8; 3]) -> Option<([u32; 3], [i64; 3])> {
        let s = oct.size() as i64;
        let mut anchor = [0u32; 3];
        let mut shift = [0i64; 3];
        for axis in 0..self.dim as usize {
            let mut c = oct.coord(axis) as i64 + s * coeff[axis] as i64;
            if c < 0 {
                if !self.periodic[2 * axis] {
                    return None;
                }
                c += MAX_LENGTH as i64;
                shift[axis] = MAX_LENGTH as i64;
            } else if c >= MAX_LENGTH as i64 {
                if !self.periodic[2 * axis] {
                    return None;
                }
                c -= MAX_LENGTH as i64;
                shift[axis] = -(MAX_LENGTH as i64);
            }
            anchor[axis] = c as u32;
        }
        Some((anchor, shift))
    }

    // ----------------------------------------------------------------- //
    // Neighbor search                                                   //
    // ----------------------------------------------------------------- //

    /// Find all leaves adjacent to `oct` through one of its entities.
    ///
    /// Results are `(indices, ghost flags)` in Morton order; a strictly
    /// coarser neighbor is unique, finer neighbors are all returned. The
    /// octant itself is never part of the result, even through a periodic
    /// wrap.
    pub fn find_neighbours(
        &self,
        oct: &Octant,
        entity_idx: u8,
        entity_codim: u8,
        only_internal: bool,
    ) -> (Vec<u32>, Vec<bool>) {
        let Some(kind) = self.entity_kind(entity_codim) else {
            return (Vec::new(), Vec::new());
        };
        debug_assert!(entity_idx < self.entity_count(kind));
        self.find_neighbours_by_kind(oct, kind, entity_idx, only_internal)
    }

    fn find_neighbours_by_kind(
        &self,
        oct: &Octant,
        kind: EntityKind,
        entity_idx: u8,
        only_internal: bool,
    ) -> (Vec<u32>, Vec<bool>) {
        let dim = self.dim;
        let coeff = self.entity_coeff(kind, entity_idx);
        let Some((banchor, shift)) = self.virtual_block(oct, coeff) else {
            return (Vec::new(), Vec::new());
        };

        let s = oct.size();
        let m0 = morton::encode(dim, banchor[0], banchor[1], banchor[2]);
        let m1 = morton::encode(
            dim,
            banchor[0] + s - 1,
            banchor[1] + s - 1,
            if dim == 3 { banchor[2] + s - 1 } else { 0 },
        );

        let (emin, emax) = self.entity_box(oct, kind, entity_idx);
        let ebox_min = [
            emin[0] as i64 + shift[0],
            emin[1] as i64 + shift[1],
            emin[2] as i64 + shift[2],
        ];
        let ebox_max = [
            emax[0] as i64 + shift[0],
            emax[1] as i64 + shift[1],
            emax[2] as i64 + shift[2],
        ];

        let self_key = (oct.morton(dim), oct.level());
        let mut found: Vec<(u64, u8, u32, bool)> = Vec::new();
        self.collect_in_block(&self.octants, false, m0, m1, ebox_min, ebox_max, self_key, &mut found);
        if !only_internal {
            self.collect_in_block(&self.ghosts, true, m0, m1, ebox_min, ebox_max, self_key, &mut found);
        }
        found.sort_unstable();

        let mut neighbours = Vec::with_capacity(found.len());
        let mut is_ghost = Vec::with_capacity(found.len());
        for (_, _, idx, ghost) in found {
            neighbours.push(idx);
            is_ghost.push(ghost);
        }
        (neighbours, is_ghost)
    }

    /// Collect the leaves of `list` that live inside the virtual block
    /// `[m0, m1]` (or contain its anchor) and touch the entity box.
    #[allow(clippy::too_many_arguments)]
    fn collect_in_block(
        &self,
        list: &[Octant],
        ghost: bool,
        m0: u64,
        m1: u64,
        ebox_min: [i64; 3],
        ebox_max: [i64; 3],
        self_key: (u64, u8),
        found: &mut Vec<(u64, u8, u32, bool)>,
    ) {
        let dim = self.dim;
        let lo = list.partition_point(|c| c.morton(dim) < m0);

        let mut push_if_adjacent = |idx: usize, cand: &Octant| {
            let key = (cand.morton(dim), cand.level());
            if key == self_key {
                return;
            }
            let cs = cand.size() as i64;
            for axis in 0..dim as usize {
                let cmin = cand.coord(axis) as i64;
                let cmax = cmin + cs;
                if ebox_max[axis] < cmin || ebox_min[axis] > cmax {
                    return;
                }
            }
            found.push((key.0, key.1, idx as u32, ghost));
        };

        // A leaf anchored before the block can only be relevant if it
        // contains the block anchor, in which case it covers the whole block
        // and is the unique coarser-or-equal neighbor in this list.
        if lo > 0 {
            let cand = &list[lo - 1];
            if cand.last_desc_morton(dim) >= m0 {
                push_if_adjacent(lo - 1, cand);
            }
        }

        let mut i = lo;
        while i < list.len() {
            let cand = &list[i];
            if cand.morton(dim) > m1 {
                break;
            }
            push_if_adjacent(i, cand);
            i += 1;
        }
    }

    /// Find the neighbors through every codimension entity (the 1-ring).
    pub fn find_all_codim_neighbours(
        &self,
        oct: &Octant,
        only_internal: bool,
    ) -> (Vec<u32>, Vec<bool>) {
        let mut seen = std::collections::BTreeSet::new();
        let mut ordered: Vec<(u64, u8, u32, bool)> = Vec::new();
        for codim in 1..=self.tc.max_balance_codim() {
            let Some(kind) = self.entity_kind(codim) else {
                continue;
            };
            for entity in 0..self.entity_count(kind) {
                let (neigh, ghost) = self.find_neighbours_by_kind(oct, kind, entity, only_internal);
                for (k, idx) in neigh.into_iter().enumerate() {
                    if seen.insert((ghost[k], idx)) {
                        let cand = if ghost[k] {
                            &self.ghosts[idx as usize]
                        } else {
                            &self.octants[idx as usize]
                        };
                        ordered.push((cand.morton(self.dim), cand.level(), idx, ghost[k]));
                    }
                }
            }
        }
        ordered.sort_unstable();
        let mut neighbours = Vec::with_capacity(ordered.len());
        let mut is_ghost = Vec::with_capacity(ordered.len());
        for (_, _, idx, ghost) in ordered {
            neighbours.push(idx);
            is_ghost.push(ghost);
        }
        (neighbours, is_ghost)
    }

    /// Find every octant sharing the given corner node, through any
    /// codimension.
    pub fn find_all_node_neighbours(&self, oct: &Octant, node: u8) -> (Vec<u32>, Vec<bool>) {
        let node_point = oct.logical_node(node);
        let mut seen = std::collections::BTreeSet::new();
        let mut ordered: Vec<(u64, u8, u32, bool)> = Vec::new();

        let consider = |idx: u32, ghost: bool, tree: &Self| {
            let cand = if ghost {
                &tree.ghosts[idx as usize]
            } else {
                &tree.octants[idx as usize]
            };
            // The shared corner must lie on the candidate.
            let cs = cand.size();
            for axis in 0..tree.dim as usize {
                let cmin = cand.coord(axis);
                let cmax = cmin + cs;
                let p = node_point[axis];
                // Periodic wraps move the corner by a full domain length.
                let on = p >= cmin && p <= cmax
                    || p + MAX_LENGTH >= cmin && p + MAX_LENGTH <= cmax
                    || p >= cmin + MAX_LENGTH && p <= cmax + MAX_LENGTH;
                if !on {
                    return None;
                }
            }
            Some((cand.morton(tree.dim), cand.level(), idx, ghost))
        };

        // Candidates come from the entities incident to the node.
        let gather = |kind: EntityKind, entity: u8, ordered: &mut Vec<(u64, u8, u32, bool)>, seen: &mut std::collections::BTreeSet<(bool, u32)>| {
            let (neigh, ghost) = self.find_neighbours_by_kind(oct, kind, entity, false);
            for (k, idx) in neigh.into_iter().enumerate() {
                if seen.insert((ghost[k], idx)) {
                    if let Some(entry) = consider(idx, ghost[k], self) {
                        ordered.push(entry);
                    }
                }
            }
        };

        for &face in &self.tc.node_face[node as usize][..self.dim as usize] {
            gather(EntityKind::Face, face, &mut ordered, &mut seen);
        }
        if self.dim == 3 {
            for (e, nodes) in self.tc.edge_node.iter().enumerate() {
                if nodes[0] == node || nodes[1] == node {
                    gather(EntityKind::Edge, e as u8, &mut ordered, &mut seen);
                }
            }
        }
        gather(EntityKind::Node, node, &mut ordered, &mut seen);

        ordered.sort_unstable();
        let mut neighbours = Vec::with_capacity(ordered.len());
        let mut is_ghost = Vec::with_capacity(ordered.len());
        for (_, _, idx, ghost) in ordered {
            neighbours.push(idx);
            is_ghost.push(ghost);
        }
        (neighbours, is_ghost)
    }

    /// Enumerate the anchors of the level-`finest_level` cells adjacent to
    /// `oct` across one of its entities, honoring periodic wraps.
    ///
    /// Every actual leaf touching the entity contains at least one of these
    /// cells, so looking up their owners in the partition table discovers
    /// every rank with octants across the entity. Returns `false` when the
    /// entity lies on a non-periodic domain boundary.
    pub fn virtual_entity_cells(
        &self,
        oct: &Octant,
        kind: EntityKind,
        entity_idx: u8,
        finest_level: u8,
        out: &mut Vec<[u32; 3]>,
    ) -> bool {
        out.clear();
        let coeff = self.entity_coeff(kind, entity_idx);
        let Some((banchor, _)) = self.virtual_block(oct, coeff) else {
            return false;
        };

        let finest_level = finest_level.clamp(oct.level(), MAX_LEVEL);
        let s = oct.size();
        let sf = self.tc.lengths[finest_level as usize];
        let per_axis = s / sf;

        // Fixed axes take the block column nearest the entity; free axes
        // sweep the block.
        let mut base = [0u32; 3];
        let mut steps = [1u32; 3];
        for axis in 0..self.dim as usize {
            match coeff[axis] {
                1 => base[axis] = banchor[axis],
                -1 => base[axis] = banchor[axis] + s - sf,
                _ => {
                    base[axis] = banchor[axis];
                    steps[axis] = per_axis;
                }
            }
        }

        for kz in 0..steps[2] {
            for ky in 0..steps[1] {
                for kx in 0..steps[0] {
                    out.push([base[0] + kx * sf, base[1] + ky * sf, base[2] + kz * sf]);
                }
            }
        }
        true
    }

    // ----------------------------------------------------------------- //
    // Lookup                                                            //
    // ----------------------------------------------------------------- //

    /// Index of the internal leaf whose range contains the Morton key.
    pub fn owner_of_morton(&self, key: u64) -> Option<u32> {
        Self::owner_of_morton_in(&self.octants, self.dim, key)
    }

    /// Index of the ghost leaf whose range contains the Morton key.
    pub fn ghost_owner_of_morton(&self, key: u64) -> Option<u32> {
        Self::owner_of_morton_in(&self.ghosts, self.dim, key)
    }

    fn owner_of_morton_in(list: &[Octant], dim: u8, key: u64) -> Option<u32> {
        let hi = list.partition_point(|o| o.morton(dim) <= key);
        if hi == 0 {
            return None;
        }
        let cand = &list[hi - 1];
        (cand.last_desc_morton(dim) >= key).then_some((hi - 1) as u32)
    }

    fn find_exact(list: &[Octant], dim: u8, key: u64, level: u8) -> Option<u32> {
        let lo = list.partition_point(|o| (o.morton(dim), o.level()) < (key, level));
        let cand = list.get(lo)?;
        (cand.morton(dim) == key && cand.level() == level).then_some(lo as u32)
    }

    // ----------------------------------------------------------------- //
    // Refinement                                                        //
    // ----------------------------------------------------------------- //

    /// One refinement sweep: replace every octant with a positive marker by
    /// its children. Returns whether anything was refined; callers loop
    /// until the sweep is a no-op, which drains multi-level markers.
    pub fn refine(&mut self, mut map_idx: Option<&mut Vec<u32>>) -> bool {
        let n_marked = self.octants.iter().filter(|o| o.marker() > 0).count();
        if n_marked == 0 {
            return false;
        }

        let n_children = self.tc.n_children as usize;
        let grown = self.octants.len() + n_marked * (n_children - 1);
        let mut out = Vec::with_capacity(grown);
        let mut out_map = map_idx.as_ref().map(|_| Vec::with_capacity(grown));

        for (i, oct) in self.octants.iter().enumerate() {
            if oct.marker() > 0 {
                let child_marker = oct.marker() - 1;
                for mut child in oct.build_children(self.tc) {
                    child.set_marker(child_marker);
                    out.push(child);
                    if let (Some(out_map), Some(map)) = (out_map.as_mut(), map_idx.as_deref()) {
                        out_map.push(map[i]);
                    }
                }
            } else {
                out.push(*oct);
                if let (Some(out_map), Some(map)) = (out_map.as_mut(), map_idx.as_deref()) {
                    out_map.push(map[i]);
                }
            }
        }

        self.octants = out;
        if let (Some(map), Some(out_map)) = (map_idx.as_deref_mut(), out_map) {
            *map = out_map;
        }
        self.update_local_max_depth();
        self.clear_derived();
        true
    }

    /// Preset every marker to +1, then run one refinement sweep.
    pub fn global_refine(&mut self, map_idx: Option<&mut Vec<u32>>) -> bool {
        for oct in &mut self.octants {
            oct.set_marker(1);
        }
        self.refine(map_idx)
    }

    // ----------------------------------------------------------------- //
    // Coarsening                                                        //
    // ----------------------------------------------------------------- //

    fn check_head_straddle(&self) -> Option<StraddleHead> {
        let first = *self.octants.first()?;
        if first.level() == 0 || first.is_first_child() || first.marker() >= 0 {
            return None;
        }
        let father = first.build_father(self.tc);
        let family = father.build_children(self.tc);
        let first_key = first.morton(self.dim);

        let mut ghost_bros = Vec::new();
        let mut local_count = 0usize;
        for member in &family {
            let key = member.morton(self.dim);
            let level = member.level();
            if let Some(idx) = Self::find_exact(&self.octants, self.dim, key, level) {
                if idx as usize != local_count || self.octants[idx as usize].marker() >= 0 {
                    return None;
                }
                local_count += 1;
            } else if let Some(g) = Self::find_exact(&self.ghosts, self.dim, key, level) {
                if self.ghosts[g as usize].marker() >= 0 {
                    return None;
                }
                if key < first_key {
                    ghost_bros.push(g);
                }
            } else {
                return None;
            }
        }
        if local_count == 0 {
            return None;
        }
        Some(StraddleHead {
            local_count,
            ghost_bros,
        })
    }

    fn check_tail_straddle(&self) -> Option<StraddleTail> {
        let last = *self.octants.last()?;
        if last.level() == 0 || last.marker() >= 0 {
            return None;
        }
        let father = last.build_father(self.tc);
        let family = father.build_children(self.tc);

        let start =
            Self::find_exact(&self.octants, self.dim, family[0].morton(self.dim), family[0].level())?
                as usize;

        let n = self.octants.len();
        let mut ghost_bros = Vec::new();
        for (k, member) in family.iter().enumerate() {
            let key = member.morton(self.dim);
            let level = member.level();
            let pos = start + k;
            if pos < n {
                let cand = &self.octants[pos];
                if cand.morton(self.dim) != key || cand.level() != level || cand.marker() >= 0 {
                    return None;
                }
            } else if let Some(g) = Self::find_exact(&self.ghosts, self.dim, key, level) {
                if self.ghosts[g as usize].marker() >= 0 {
                    return None;
                }
                ghost_bros.push(g);
            } else {
                return None;
            }
        }
        if ghost_bros.is_empty() {
            // The family is fully local; the regular sweep handles it.
            return None;
        }
        Some(StraddleTail { start, ghost_bros })
    }

    /// One coarsening sweep: collapse every complete sibling family whose
    /// markers are all negative into its father. Families straddling a
    /// partition boundary are resolved against the ghost brothers; the rank
    /// owning the first child builds the father, the others drop their
    /// members. Returns whether anything changed.
    pub fn coarse(&mut self, mut map_idx: Option<&mut Vec<u32>>) -> bool {
        let n = self.octants.len();
        if n == 0 {
            return false;
        }
        let n_children = self.tc.n_children as usize;
        let head = self.check_head_straddle();
        let tail = self.check_tail_straddle();

        let mut out = Vec::with_capacity(n);
        let mut out_map = map_idx.as_ref().map(|_| Vec::with_capacity(n));
        let mut first_ghost_bros = Vec::new();
        let mut last_ghost_bros = Vec::new();
        let mut changed = false;

        let mut i = 0usize;
        if let Some(h) = head {
            i = h.local_count;
            first_ghost_bros = h.ghost_bros;
            changed = true;
        }

        while i < n {
            if let Some(t) = &tail {
                if i == t.start {
                    let mut marker = self.octants[i..].iter().map(|o| o.marker()).max().unwrap();
                    for &g in &t.ghost_bros {
                        marker = marker.max(self.ghosts[g as usize].marker());
                    }
                    let mut father = self.octants[i].build_father(self.tc);
                    father.set_marker(marker.saturating_add(1));
                    out.push(father);
                    if let (Some(out_map), Some(map)) = (out_map.as_mut(), map_idx.as_deref()) {
                        out_map.push(map[i]);
                    }
                    last_ghost_bros = t.ghost_bros.clone();
                    changed = true;
                    i = n;
                    break;
                }
            }

            let oct = self.octants[i];
            if oct.marker() < 0 && oct.is_first_child() && i + n_children <= n {
                let father = oct.build_father(self.tc);
                let family = father.build_children(self.tc);
                let whole_family = family.iter().enumerate().all(|(k, member)| {
                    let cand = &self.octants[i + k];
                    cand.level() == member.level()
                        && cand.morton(self.dim) == member.morton(self.dim)
                        && cand.marker() < 0
                });
                if whole_family {
                    let marker = self.octants[i..i + n_children]
                        .iter()
                        .map(|o| o.marker())
                        .max()
                        .unwrap();
                    let mut father = father;
                    father.set_marker(marker.saturating_add(1));
                    out.push(father);
                    if let (Some(out_map), Some(map)) = (out_map.as_mut(), map_idx.as_deref()) {
                        out_map.push(map[i]);
                    }
                    i += n_children;
                    changed = true;
                    continue;
                }
            }

            out.push(oct);
            if let (Some(out_map), Some(map)) = (out_map.as_mut(), map_idx.as_deref()) {
                out_map.push(map[i]);
            }
            i += 1;
        }

        if !changed {
            return false;
        }

        self.octants = out;
        if let (Some(map), Some(out_map)) = (map_idx.as_deref_mut(), out_map) {
            *map = out_map;
        }
        self.first_ghost_bros = first_ghost_bros;
        self.last_ghost_bros = last_ghost_bros;
        self.update_local_max_depth();
        self.update_descendants();
        self.clear_derived();
        true
    }

    /// Preset every marker to -1, then run one coarsening sweep.
    pub fn global_coarse(&mut self, map_idx: Option<&mut Vec<u32>>) -> bool {
        for oct in &mut self.octants {
            oct.set_marker(-1);
        }
        for ghost in &mut self.ghosts {
            ghost.set_marker(-1);
        }
        self.coarse(map_idx)
    }

    /// Forget the straddling-family caches of the last coarsening.
    pub fn clear_ghost_bros(&mut self) {
        self.first_ghost_bros.clear();
        self.last_ghost_bros.clear();
    }

    /// Ghost brothers of the families currently straddling the partition
    /// boundaries, without coarsening anything.
    pub(crate) fn straddle_ghost_bros(&self) -> (Vec<u32>, Vec<u32>) {
        let first = self
            .check_head_straddle()
            .map(|h| h.ghost_bros)
            .unwrap_or_default();
        let last = self
            .check_tail_straddle()
            .map(|t| t.ghost_bros)
            .unwrap_or_default();
        (first, last)
    }

    // ----------------------------------------------------------------- //
    // 2:1 balance (local part)                                          //
    // ----------------------------------------------------------------- //

    fn balance_entities(&self) -> Vec<(EntityKind, u8)> {
        let mut entities = Vec::new();
        for codim in 1..=self.balance_codim {
            if let Some(kind) = self.entity_kind(codim) {
                entities.push((kind, self.entity_count(kind)));
            }
        }
        entities
    }

    /// Run the local 2:1 marker fixpoint.
    ///
    /// Octants with a non-zero marker (and, when `balance_new` is set, the
    /// octants freshly created by adaptation) seed the propagation; when
    /// `from_ghosts` is set the ghost markers received from remote processes
    /// seed it as well. Only internal octants are ever modified. Returns
    /// whether any marker was raised.
    pub fn local_balance(&mut self, balance_new: bool, from_ghosts: bool) -> bool {
        let entities = self.balance_entities();
        let mut any = false;

        loop {
            let mut changed = false;

            for idx in 0..self.octants.len() {
                let oct = self.octants[idx];
                if !oct.balance() {
                    continue;
                }
                let seeds = oct.marker() != 0
                    || (balance_new && (oct.is_new_refined() || oct.is_new_coarsened()));
                if !seeds {
                    continue;
                }
                changed |= self.balance_around(&oct, Some(idx), &entities);
            }

            if from_ghosts {
                for gidx in 0..self.ghosts.len() {
                    let ghost = self.ghosts[gidx];
                    if !ghost.balance() {
                        continue;
                    }
                    let seeds = ghost.marker() != 0
                        || (balance_new && (ghost.is_new_refined() || ghost.is_new_coarsened()));
                    if !seeds {
                        continue;
                    }
                    changed |= self.balance_around(&ghost, None, &entities);
                }
            }

            if changed {
                any = true;
            } else {
                break;
            }
        }
        any
    }

    /// Enforce the 2:1 constraint between `oct` and all its neighbors.
    /// `own_idx` is the octant's internal index, `None` for ghosts.
    fn balance_around(
        &mut self,
        oct: &Octant,
        own_idx: Option<usize>,
        entities: &[(EntityKind, u8)],
    ) -> bool {
        let mut changed = false;
        let target = oct.target_level();

        for &(kind, count) in entities {
            for entity in 0..count {
                let (neigh, is_ghost) = self.find_neighbours_by_kind(oct, kind, entity, false);
                for (k, &nidx) in neigh.iter().enumerate() {
                    if is_ghost[k] {
                        let nb = self.ghosts[nidx as usize];
                        if !nb.balance() {
                            continue;
                        }
                        // Ghosts cannot be modified here; the owning rank
                        // raises them once it sees our markers. We only pick
                        // up the constraint they impose on us.
                        if let Some(own) = own_idx {
                            let nb_target = nb.target_level();
                            if nb_target - target > 1 {
                                let raised = (nb_target - 1 - oct.level() as i16) as i8;
                                if raised > self.octants[own].marker() {
                                    self.octants[own].set_marker(raised);
                                    changed = true;
                                }
                            }
                        }
                    } else {
                        let nb = self.octants[nidx as usize];
                        if !nb.balance() {
                            continue;
                        }
                        let nb_target = nb.target_level();
                        if target - nb_target > 1 {
                            let raised = (target - 1 - nb.level() as i16) as i8;
                            if raised > nb.marker() {
                                self.octants[nidx as usize].set_marker(raised);
                                changed = true;
                            }
                        } else if let Some(own) = own_idx {
                            if nb_target - target > 1 {
                                let raised = (nb_target - 1 - oct.level() as i16) as i8;
                                if raised > self.octants[own].marker() {
                                    self.octants[own].set_marker(raised);
                                    changed = true;
                                }
                            }
                        }
                    }
                }
            }
        }
        changed
    }

    /// Verify the 2:1 level constraint across the configured codimensions.
    pub fn check_21_balance(&self) -> bool {
        let entities = self.balance_entities();
        for oct in &self.octants {
            if !oct.balance() {
                continue;
            }
            for &(kind, count) in &entities {
                for entity in 0..count {
                    let (neigh, is_ghost) = self.find_neighbours_by_kind(oct, kind, entity, false);
                    for (k, &nidx) in neigh.iter().enumerate() {
                        let nb = if is_ghost[k] {
                            &self.ghosts[nidx as usize]
                        } else {
                            &self.octants[nidx as usize]
                        };
                        if !nb.balance() {
                            continue;
                        }
                        if (nb.level() as i16 - oct.level() as i16).abs() > 1 {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    // ----------------------------------------------------------------- //
    // Connectivity                                                      //
    // ----------------------------------------------------------------- //

    /// Build the deduplicated node list and the per-octant corner indices.
    pub fn compute_connectivity(&mut self) {
        let dim = self.dim;
        let n_nodes = self.tc.n_nodes;

        let mut keyed: Vec<(u64, [u32; 3])> = Vec::with_capacity(
            (self.octants.len() + self.ghosts.len()) * n_nodes as usize,
        );
        for oct in self.octants.iter().chain(self.ghosts.iter()) {
            for k in 0..n_nodes {
                keyed.push((oct.node_persistent_key(dim, k), oct.logical_node(k)));
            }
        }

        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            keyed.par_sort_unstable_by_key(|(key, _)| *key);
        }
        #[cfg(not(feature = "rayon"))]
        keyed.sort_unstable_by_key(|(key, _)| *key);
        keyed.dedup_by_key(|(key, _)| *key);

        let keys: Vec<u64> = keyed.iter().map(|(key, _)| *key).collect();
        self.nodes = keyed.into_iter().map(|(_, coords)| coords).collect();

        let index_of = |oct: &Octant| -> Vec<u32> {
            (0..n_nodes)
                .map(|k| {
                    let key = oct.node_persistent_key(dim, k);
                    keys.binary_search(&key).expect("node key missing") as u32
                })
                .collect()
        };

        self.connectivity = self.octants.iter().map(index_of).collect();
        self.ghosts_connectivity = self.ghosts.iter().map(index_of).collect();
    }

    /// Drop the connectivity arrays.
    pub fn clear_connectivity(&mut self) {
        self.nodes.clear();
        self.connectivity.clear();
        self.ghosts_connectivity.clear();
    }

    #[inline]
    pub fn has_connectivity(&self) -> bool {
        !self.connectivity.is_empty()
    }

    #[inline]
    pub fn nodes(&self) -> &[[u32; 3]] {
        &self.nodes
    }

    #[inline]
    pub fn connectivity(&self) -> &[Vec<u32>] {
        &self.connectivity
    }

    #[inline]
    pub fn ghosts_connectivity(&self) -> &[Vec<u32>] {
        &self.ghosts_connectivity
    }

    // ----------------------------------------------------------------- //
    // Intersections                                                     //
    // ----------------------------------------------------------------- //

    /// Enumerate every face shared by two octants, plus the boundary faces.
    ///
    /// Each geometric face appears exactly once: coarser-to-finer faces are
    /// recorded on the coarser internal side, equal-level internal pairs on
    /// the lower index, and faces against a coarser ghost on the internal
    /// side.
    pub fn compute_intersections(&mut self) {
        self.intersections.clear();

        for idx in 0..self.octants.len() {
            let oct = self.octants[idx];
            for f in 0..self.tc.n_faces {
                if oct.bound(f) && !self.periodic[f as usize] {
                    self.intersections.push(Intersection {
                        owners: [idx as u32, idx as u32],
                        face: f,
                        finer: 0,
                        out_is_ghost: false,
                        is_bound: true,
                        is_pbound: false,
                    });
                    continue;
                }
                let (neigh, is_ghost) = self.find_neighbours_by_kind(&oct, EntityKind::Face, f, false);
                for (k, &nidx) in neigh.iter().enumerate() {
                    let nb = if is_ghost[k] {
                        &self.ghosts[nidx as usize]
                    } else {
                        &self.octants[nidx as usize]
                    };
                    if nb.level() < oct.level() && !is_ghost[k] {
                        // Recorded from the coarser internal side.
                        continue;
                    }
                    if nb.level() == oct.level() && !is_ghost[k] && (nidx as usize) < idx {
                        continue;
                    }
                    let finer = if nb.level() > oct.level() { 1 } else { 0 };
                    self.intersections.push(Intersection {
                        owners: [idx as u32, nidx],
                        face: f,
                        finer,
                        out_is_ghost: is_ghost[k],
                        is_bound: false,
                        is_pbound: is_ghost[k],
                    });
                }
            }
        }
    }

    #[inline]
    pub fn intersections(&self) -> &[Intersection] {
        &self.intersections
    }

    /// Drop intersections and connectivity; indices into the octant vector
    /// are about to be invalidated.
    pub fn clear_derived(&mut self) {
        self.intersections.clear();
        self.clear_connectivity();
    }

    // ----------------------------------------------------------------- //
    // Ghost storage                                                     //
    // ----------------------------------------------------------------- //

    /// Replace the ghost containers (built by the halo exchange).
    pub fn set_ghosts(
        &mut self,
        ghosts: Vec<Octant>,
        global_ids: Vec<u64>,
        rank_spans: Vec<(usize, u32, u32)>,
    ) {
        debug_assert_eq!(ghosts.len(), global_ids.len());
        self.ghosts = ghosts;
        self.ghost_global_ids = global_ids;
        self.ghost_rank_spans = rank_spans;
    }

    #[inline]
    pub fn ghost_global_ids(&self) -> &[u64] {
        &self.ghost_global_ids
    }

    /// Local ghost index of the given global index, if mirrored here.
    pub fn ghost_local_idx(&self, global_idx: u64) -> Option<u32> {
        // Ghosts are Morton-sorted and so are their global ids.
        self.ghost_global_ids
            .binary_search(&global_idx)
            .ok()
            .map(|i| i as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree2() -> LocalTree {
        LocalTree::with_root(TreeConstants::get(2).unwrap())
    }

    fn refine_all(tree: &mut LocalTree, times: usize) {
        for _ in 0..times {
            tree.global_refine(None);
        }
    }

    #[test]
    fn global_refine_produces_morton_sequence() {
        let mut tree = tree2();
        refine_all(&mut tree, 2);
        assert_eq!(tree.num_octants(), 16);
        for (i, oct) in tree.octants.iter().enumerate() {
            assert_eq!(oct.level(), 2);
            // Sixteen level-2 quadrants have consecutive block keys.
            let cell = (oct.size() as u64).pow(2);
            assert_eq!(oct.morton(2), i as u64 * cell);
            assert!(oct.is_new_refined());
        }
    }

    #[test]
    fn refine_keeps_sort_and_alignment() {
        let mut tree = tree2();
        refine_all(&mut tree, 1);
        tree.octant_mut(2).set_marker(2);
        while tree.refine(None) {}

        let mut prev = None;
        for oct in &tree.octants {
            let key = (oct.morton(2), oct.level());
            if let Some(p) = prev {
                assert!(key > p, "octants out of order");
            }
            prev = Some(key);
            let s = oct.size();
            assert_eq!(oct.coords()[0] % s, 0);
            assert_eq!(oct.coords()[1] % s, 0);
        }
        // One quadrant refined twice: 3 + 4 + 12 leaves... 3 untouched
        // level-1 quadrants plus 16 level-3 leaves.
        assert_eq!(tree.num_octants(), 3 + 16);
    }

    #[test]
    fn refine_tracks_mapping_to_parents() {
        let mut tree = tree2();
        refine_all(&mut tree, 1);
        let mut map: Vec<u32> = (0..tree.num_octants()).collect();
        tree.octant_mut(1).set_marker(1);
        while tree.refine(Some(&mut map)) {}

        assert_eq!(tree.num_octants(), 7);
        assert_eq!(map, vec![0, 1, 1, 1, 1, 2, 3]);
    }

    #[test]
    fn coarse_collapses_family() {
        let mut tree = tree2();
        refine_all(&mut tree, 2);
        // Mark the first family (children of the first level-1 quadrant).
        for i in 0..4 {
            tree.octant_mut(i).set_marker(-1);
        }
        assert!(tree.coarse(None));
        assert_eq!(tree.num_octants(), 13);
        let first = tree.octant(0);
        assert_eq!(first.level(), 1);
        assert!(first.is_new_coarsened());
        assert_eq!(first.marker(), 0);
        assert!(!tree.coarse(None));
    }

    #[test]
    fn coarse_requires_whole_family() {
        let mut tree = tree2();
        refine_all(&mut tree, 2);
        for i in 0..3 {
            tree.octant_mut(i).set_marker(-1);
        }
        assert!(!tree.coarse(None));
        assert_eq!(tree.num_octants(), 16);
    }

    #[test]
    fn face_neighbours_across_levels() {
        let mut tree = tree2();
        refine_all(&mut tree, 1);
        // Refine the first quadrant once more; its +x neighbor stays coarse.
        tree.octant_mut(0).set_marker(1);
        while tree.refine(None) {}
        // Octants: 4 level-2 leaves in the lower-left, then 3 level-1.
        assert_eq!(tree.num_octants(), 7);

        // The coarse right quadrant sees two finer neighbors across -x.
        let right = *tree.octant(4);
        assert_eq!(right.level(), 1);
        let (neigh, ghost) = tree.find_neighbours(&right, 0, 1, false);
        assert_eq!(ghost, vec![false, false]);
        let levels: Vec<u8> = neigh.iter().map(|&i| tree.octant(i).level()).collect();
        assert_eq!(levels, vec![2, 2]);

        // A fine leaf sees the single coarse neighbor across +x.
        let fine = *tree.octant(1);
        let (neigh, _) = tree.find_neighbours(&fine, 1, 1, false);
        assert_eq!(neigh.len(), 1);
        assert_eq!(tree.octant(neigh[0]).level(), 1);

        // Domain boundary: no neighbors across -x of the first leaf.
        let corner = *tree.octant(0);
        let (neigh, _) = tree.find_neighbours(&corner, 0, 1, false);
        assert!(neigh.is_empty());
    }

    #[test]
    fn node_neighbours_at_center() {
        let mut tree = tree2();
        refine_all(&mut tree, 1);
        // Node 3 of quadrant 0 is the domain center, shared by all four.
        let oct = *tree.octant(0);
        let (neigh, _) = tree.find_neighbours(&oct, 3, 2, false);
        assert_eq!(neigh, vec![3]);

        let (all, ghost) = tree.find_all_node_neighbours(&oct, 3);
        assert_eq!(all.len(), 3);
        assert!(ghost.iter().all(|&g| !g));
    }

    #[test]
    fn periodic_wrap_finds_opposite_side() {
        let mut tree = tree2();
        tree.set_periodic(0);
        refine_all(&mut tree, 1);
        let left = *tree.octant(0);
        let (neigh, _) = tree.find_neighbours(&left, 0, 1, false);
        // Wraps around to the right column.
        assert_eq!(neigh.len(), 1);
        assert_eq!(tree.octant(neigh[0]).coords()[0], MAX_LENGTH / 2);
    }

    #[test]
    fn local_balance_limits_level_jump() {
        let mut tree = tree2();
        refine_all(&mut tree, 1);
        tree.octant_mut(0).set_marker(2);
        let changed = tree.local_balance(false, false);
        assert!(changed);
        // Face neighbors of quadrant 0 must end within one level.
        assert!(tree.octant(1).marker() >= 1);
        assert!(tree.octant(2).marker() >= 1);
        while tree.refine(None) {}
        assert!(tree.check_21_balance());
    }

    #[test]
    fn balance_disabled_octants_are_ignored() {
        let mut tree = tree2();
        refine_all(&mut tree, 1);
        tree.octant_mut(1).set_balance(false);
        tree.octant_mut(0).set_marker(2);
        tree.local_balance(false, false);
        assert_eq!(tree.octant(1).marker(), 0);
    }

    #[test]
    fn connectivity_dedupes_shared_corners() {
        let mut tree = tree2();
        refine_all(&mut tree, 1);
        tree.compute_connectivity();
        // Four quadrants share a 3x3 logical grid of nodes.
        assert_eq!(tree.nodes().len(), 9);
        let center = tree.connectivity()[0][3];
        assert_eq!(tree.connectivity()[1][2], center);
        assert_eq!(tree.connectivity()[2][1], center);
        assert_eq!(tree.connectivity()[3][0], center);
    }

    #[test]
    fn intersections_cover_each_face_once() {
        let mut tree = tree2();
        refine_all(&mut tree, 1);
        tree.compute_intersections();
        let inner: Vec<_> = tree
            .intersections()
            .iter()
            .filter(|i| !i.is_bound)
            .collect();
        let bound = tree.intersections().len() - inner.len();
        // 2x2 grid: four interior faces, eight boundary faces.
        assert_eq!(inner.len(), 4);
        assert_eq!(bound, 8);
    }
}

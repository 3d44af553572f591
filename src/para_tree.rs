//! The public octree: a distributed linear octree over the unit cube.
//!
//! A `ParaTree` owns the process-local octants, the replicated partition
//! table and the communicator, and drives the distributed pipelines:
//! marker-based adaptation with 2:1 balance, load balancing with optional
//! weights and family compactness, and multi-layer ghost-halo maintenance.
//!
//! Freshly constructed trees are *serial*: every rank holds the complete
//! tree. The first `load_balance` call distributes it; from then on every
//! rank owns one contiguous Morton range and mirrors remote octants inside
//! its ghost halo.
//!
//! Local indices are only stable between mutations; the `status` counter
//! changes whenever indices may have moved, and external caches keyed by
//! local index must be invalidated when it does.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::algs::balance::balance_21;
use crate::algs::ghost::{build_halo, BordersPerProc};
use crate::algs::load_balance::{
    apply_family_constraint, compute_partition_uniform, compute_partition_weighted,
    current_partition_counts, eval_recv_ranges, eval_send_ranges, LoadBalanceData,
    LoadBalanceRanges, NoData,
};
use crate::comm::{
    all_gather, all_reduce_max_i8, all_reduce_or, exchange_buffers, tags, Communicator,
    ExchangeCommTags,
};
use crate::error::OctreeError;
use crate::geometry::{CoordinateMapper, UnitCube};
use crate::tree::constants::{TreeConstants, INFO_ITEM_COUNT, MAX_LENGTH, MAX_LEVEL};
use crate::tree::local::{Intersection, LocalTree, TreeHandle};
use crate::tree::morton;
use crate::tree::octant::{Octant, OctantWire};
use crate::tree::partition::PartitionTable;

/// Version tag of the binary dump format.
const DUMP_VERSION: i32 = 1;

/// Largest supported halo width; the ring index must fit the octant's
/// signed layer field.
const MAX_GHOST_LAYERS: usize = 127;

/// Sentinel returned by point-owner queries for points outside the domain.
pub const NO_OWNER: u32 = u32::MAX;

/// The last structural operation performed on the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Init,
    PreAdapt,
    AdaptMapped,
    AdaptUnmapped,
    LoadBalanceFirst,
    LoadBalance,
}

impl Operation {
    fn to_i32(self) -> i32 {
        match self {
            Operation::Init => 0,
            Operation::PreAdapt => 1,
            Operation::AdaptMapped => 2,
            Operation::AdaptUnmapped => 3,
            Operation::LoadBalanceFirst => 4,
            Operation::LoadBalance => 5,
        }
    }

    fn from_i32(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => Operation::Init,
            1 => Operation::PreAdapt,
            2 => Operation::AdaptMapped,
            3 => Operation::AdaptUnmapped,
            4 => Operation::LoadBalanceFirst,
            5 => Operation::LoadBalance,
            _ => return None,
        })
    }
}

/// Distributed parallel linear octree (2D quadtree / 3D octree).
pub struct ParaTree<C: Communicator> {
    comm: C,
    rank: usize,
    nproc: usize,
    dim: u8,
    tc: &'static TreeConstants,
    octree: LocalTree,
    partition: PartitionTable,
    /// Partition snapshot taken before the last structural change; feeds
    /// the post-load-balance mapping.
    partition_range_global_idx0: Vec<u64>,
    serial: bool,
    global_num_octants: u64,
    max_depth: i8,
    status: u64,
    last_op: Operation,
    map_idx: Vec<u32>,
    tol: f64,
    nof_ghost_layers: usize,
    borders_per_proc: BordersPerProc,
    load_balance_ranges: LoadBalanceRanges,
    mapper: Box<dyn CoordinateMapper>,
}

impl<C: Communicator> std::fmt::Debug for ParaTree<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParaTree")
            .field("rank", &self.rank)
            .field("nproc", &self.nproc)
            .field("dim", &self.dim)
            .field("serial", &self.serial)
            .field("global_num_octants", &self.global_num_octants)
            .field("max_depth", &self.max_depth)
            .field("status", &self.status)
            .field("last_op", &self.last_op)
            .finish()
    }
}

impl<C: Communicator> ParaTree<C> {
    /// Build a tree holding the root octant, replicated on every rank of
    /// `comm`.
    pub fn new(dim: u8, comm: C) -> Result<Self, OctreeError> {
        let tc = TreeConstants::get(dim)?;
        let octree = LocalTree::with_root(tc);
        let rank = comm.rank();
        let nproc = comm.size();
        let partition = PartitionTable::new_serial(
            nproc,
            1,
            octree.first_desc_morton(),
            octree.last_desc_morton(),
        );
        Ok(Self {
            comm,
            rank,
            nproc,
            dim,
            tc,
            octree,
            partition,
            partition_range_global_idx0: vec![0; nproc],
            serial: true,
            global_num_octants: 1,
            max_depth: 0,
            status: 0,
            last_op: Operation::Init,
            map_idx: Vec::new(),
            tol: 1.0e-14,
            nof_ghost_layers: 1,
            borders_per_proc: BTreeMap::new(),
            load_balance_ranges: LoadBalanceRanges::default(),
            mapper: Box::new(UnitCube),
        })
    }

    /// Replace the coordinate mapper used by the physical getters.
    pub fn set_mapper(&mut self, mapper: Box<dyn CoordinateMapper>) {
        self.mapper = mapper;
    }

    // ----------------------------------------------------------------- //
    // Basic state                                                       //
    // ----------------------------------------------------------------- //

    #[inline]
    pub fn get_dim(&self) -> u8 {
        self.dim
    }

    #[inline]
    pub fn get_rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn get_nproc(&self) -> usize {
        self.nproc
    }

    /// Whether every rank still holds the full tree.
    #[inline]
    pub fn is_serial(&self) -> bool {
        self.serial
    }

    #[inline]
    pub fn get_status(&self) -> u64 {
        self.status
    }

    #[inline]
    pub fn get_last_operation(&self) -> Operation {
        self.last_op
    }

    #[inline]
    pub fn get_num_octants(&self) -> u32 {
        self.octree.num_octants()
    }

    #[inline]
    pub fn get_num_ghosts(&self) -> u32 {
        self.octree.num_ghosts()
    }

    #[inline]
    pub fn get_global_num_octants(&self) -> u64 {
        self.global_num_octants
    }

    #[inline]
    pub fn get_local_max_depth(&self) -> u8 {
        self.octree.local_max_depth()
    }

    /// Deepest level reached anywhere in the tree.
    #[inline]
    pub fn get_max_depth(&self) -> i8 {
        self.max_depth
    }

    #[inline]
    pub fn get_max_level(&self) -> u8 {
        MAX_LEVEL
    }

    #[inline]
    pub fn get_max_length(&self) -> u32 {
        MAX_LENGTH
    }

    #[inline]
    pub fn get_nfaces(&self) -> u8 {
        self.tc.n_faces
    }

    #[inline]
    pub fn get_nedges(&self) -> u8 {
        self.tc.n_edges
    }

    #[inline]
    pub fn get_nnodes(&self) -> u8 {
        self.tc.n_nodes
    }

    #[inline]
    pub fn get_nchildren(&self) -> u8 {
        self.tc.n_children
    }

    #[inline]
    pub fn get_nnodes_per_face(&self) -> u8 {
        self.tc.n_nodes_per_face
    }

    /// The per-dimension constant tables.
    #[inline]
    pub fn get_tree_constants(&self) -> &'static TreeConstants {
        self.tc
    }

    #[inline]
    pub fn get_tol(&self) -> f64 {
        self.tol
    }

    pub fn set_tol(&mut self, tol: f64) {
        self.tol = tol;
    }

    #[inline]
    pub fn get_periodic(&self) -> &[bool; 6] {
        self.octree.periodic()
    }

    /// Mark a face and its opposite as periodic.
    pub fn set_periodic(&mut self, face: u8) -> Result<(), OctreeError> {
        if face >= self.tc.n_faces {
            return Err(OctreeError::InvalidOctantIndex(face as u32));
        }
        self.octree.set_periodic(face);
        Ok(())
    }

    #[inline]
    pub fn get_balance_codim(&self) -> u8 {
        self.octree.balance_codim()
    }

    /// Set the 2:1 balance codimension (1: faces, 2: +edges in 3D / nodes
    /// in 2D, 3: +nodes in 3D).
    pub fn set_balance_codim(&mut self, codim: u8) -> Result<(), OctreeError> {
        if self.last_op == Operation::PreAdapt {
            return Err(OctreeError::AdaptionPending);
        }
        if codim < 1 || codim > self.tc.max_balance_codim() {
            return Err(OctreeError::InvalidBalanceCodim(codim, self.dim));
        }
        self.octree.set_balance_codim(codim);
        Ok(())
    }

    #[inline]
    pub fn get_nof_ghost_layers(&self) -> usize {
        self.nof_ghost_layers
    }

    /// Set the halo width in neighborhood rings and rebuild the halo when
    /// the tree is already distributed.
    pub fn set_nof_ghost_layers(&mut self, n_layers: usize) -> Result<(), OctreeError> {
        if n_layers == 0 || n_layers > MAX_GHOST_LAYERS {
            return Err(OctreeError::InvalidGhostLayers(n_layers, MAX_GHOST_LAYERS));
        }
        if n_layers == self.nof_ghost_layers {
            return Ok(());
        }
        self.nof_ghost_layers = n_layers;
        if !self.serial && self.nproc > 1 {
            self.compute_ghost_halo()?;
        }
        Ok(())
    }

    /// Per-rank source lists of the current halo.
    #[inline]
    pub fn get_borders_per_proc(&self) -> &BordersPerProc {
        &self.borders_per_proc
    }

    /// Exchange ranges recorded by the last load balance.
    #[inline]
    pub fn get_load_balance_ranges(&self) -> &LoadBalanceRanges {
        &self.load_balance_ranges
    }

    // ----------------------------------------------------------------- //
    // Octant access                                                     //
    // ----------------------------------------------------------------- //

    #[inline]
    pub fn get_octant(&self, idx: u32) -> &Octant {
        self.octree.octant(idx)
    }

    #[inline]
    pub fn get_ghost_octant(&self, idx: u32) -> &Octant {
        self.octree.ghost(idx)
    }

    /// Resolve a `(index, ghost)` handle.
    #[inline]
    pub fn resolve(&self, handle: TreeHandle) -> &Octant {
        self.octree.resolve(handle)
    }

    #[inline]
    pub fn get_level(&self, idx: u32) -> u8 {
        self.octree.octant(idx).level()
    }

    #[inline]
    pub fn get_marker(&self, idx: u32) -> i8 {
        self.octree.octant(idx).marker()
    }

    #[inline]
    pub fn get_balance(&self, idx: u32) -> bool {
        self.octree.octant(idx).balance()
    }

    #[inline]
    pub fn get_morton(&self, idx: u32) -> u64 {
        self.octree.octant(idx).morton(self.dim)
    }

    #[inline]
    pub fn get_last_desc_morton(&self, idx: u32) -> u64 {
        self.octree.octant(idx).last_desc_morton(self.dim)
    }

    /// Morton endpoints of the local partition.
    #[inline]
    pub fn get_first_desc_morton(&self) -> u64 {
        self.octree.first_desc_morton()
    }

    #[inline]
    pub fn get_local_last_desc_morton(&self) -> u64 {
        self.octree.last_desc_morton()
    }

    #[inline]
    pub fn get_bound(&self, idx: u32, face: u8) -> bool {
        self.octree.octant(idx).bound(face)
    }

    #[inline]
    pub fn is_bound(&self, idx: u32) -> bool {
        self.octree.octant(idx).is_bound(self.tc)
    }

    #[inline]
    pub fn get_pbound(&self, idx: u32, face: u8) -> bool {
        self.octree.octant(idx).pbound(face)
    }

    #[inline]
    pub fn is_pbound(&self, idx: u32) -> bool {
        self.octree.octant(idx).is_pbound(self.tc)
    }

    #[inline]
    pub fn get_is_new_r(&self, idx: u32) -> bool {
        self.octree.octant(idx).is_new_refined()
    }

    #[inline]
    pub fn get_is_new_c(&self, idx: u32) -> bool {
        self.octree.octant(idx).is_new_coarsened()
    }

    #[inline]
    pub fn get_ghost_layer(&self, ghost_idx: u32) -> i8 {
        self.octree.ghost(ghost_idx).ghost_layer()
    }

    /// Morton key shifted left eight bits with the level packed below.
    #[inline]
    pub fn get_persistent_idx(&self, idx: u32) -> u64 {
        self.octree.octant(idx).persistent_idx(self.dim)
    }

    /// Stable node key for connectivity deduplication.
    #[inline]
    pub fn compute_node_persistent_key(&self, idx: u32, node: u8) -> u64 {
        self.octree.octant(idx).node_persistent_key(self.dim, node)
    }

    /// Local indices of the octants without any partition-boundary face.
    pub fn get_internal_octant_indices(&self) -> Vec<u32> {
        (0..self.get_num_octants())
            .filter(|&i| !self.is_pbound(i))
            .collect()
    }

    /// Local indices of the partition-boundary octants.
    pub fn get_pbound_octant_indices(&self) -> Vec<u32> {
        (0..self.get_num_octants())
            .filter(|&i| self.is_pbound(i))
            .collect()
    }

    // ----------------------------------------------------------------- //
    // Global indexing                                                   //
    // ----------------------------------------------------------------- //

    /// Global index of a local octant.
    pub fn get_global_idx(&self, idx: u32) -> u64 {
        if self.serial {
            idx as u64
        } else {
            self.partition.global_offset(self.rank) + idx as u64
        }
    }

    /// Global index of a local ghost.
    #[inline]
    pub fn get_ghost_global_idx(&self, ghost_idx: u32) -> u64 {
        self.octree.ghost_global_ids()[ghost_idx as usize]
    }

    /// Local index of a global index owned by this rank.
    pub fn get_local_idx(&self, global_idx: u64) -> Option<u32> {
        if self.serial {
            return (global_idx < self.global_num_octants).then_some(global_idx as u32);
        }
        let offset = self.partition.global_offset(self.rank);
        let last = self.partition.last_global_idx()[self.rank];
        (global_idx >= offset && global_idx <= last).then(|| (global_idx - offset) as u32)
    }

    /// Local ghost index of a global index mirrored in the halo.
    #[inline]
    pub fn get_ghost_local_idx(&self, global_idx: u64) -> Option<u32> {
        self.octree.ghost_local_idx(global_idx)
    }

    /// Whether a global index belongs to this rank.
    pub fn is_internal(&self, global_idx: u64) -> bool {
        self.get_local_idx(global_idx).is_some()
    }

    /// Rank owning a global index; `None` past the end of the tree.
    pub fn get_owner_rank(&self, global_idx: u64) -> Option<usize> {
        self.partition.owner_of_global(global_idx)
    }

    /// Rank owning the element with the given Morton key.
    pub fn find_owner(&self, key: u64) -> Option<usize> {
        self.partition.find_owner(key)
    }

    /// The replicated partition table.
    #[inline]
    pub fn get_partition_table(&self) -> &PartitionTable {
        &self.partition
    }

    // ----------------------------------------------------------------- //
    // Physical getters                                                  //
    // ----------------------------------------------------------------- //

    /// Physical coordinates of the octant anchor.
    pub fn get_coordinates(&self, idx: u32) -> [f64; 3] {
        self.mapper.map_point(self.octree.octant(idx).coords())
    }

    #[inline]
    pub fn get_x(&self, idx: u32) -> f64 {
        self.mapper.map_x(self.octree.octant(idx).coords()[0])
    }

    #[inline]
    pub fn get_y(&self, idx: u32) -> f64 {
        self.mapper.map_y(self.octree.octant(idx).coords()[1])
    }

    #[inline]
    pub fn get_z(&self, idx: u32) -> f64 {
        self.mapper.map_z(self.octree.octant(idx).coords()[2])
    }

    /// Physical edge length of an octant.
    #[inline]
    pub fn get_size(&self, idx: u32) -> f64 {
        self.get_size_of(self.octree.octant(idx))
    }

    #[inline]
    pub fn get_size_of(&self, oct: &Octant) -> f64 {
        self.mapper.map_size(oct.size())
    }

    /// Physical face area of an octant.
    #[inline]
    pub fn get_area(&self, idx: u32) -> f64 {
        self.mapper.map_area(self.octree.octant(idx).size(), self.dim)
    }

    /// Physical volume of an octant.
    #[inline]
    pub fn get_volume(&self, idx: u32) -> f64 {
        self.mapper.map_volume(self.octree.octant(idx).size(), self.dim)
    }

    /// Physical center of an octant.
    #[inline]
    pub fn get_center(&self, idx: u32) -> [f64; 3] {
        self.get_center_of(self.octree.octant(idx))
    }

    pub fn get_center_of(&self, oct: &Octant) -> [f64; 3] {
        let anchor = self.mapper.map_point(oct.coords());
        let half = 0.5 * self.mapper.map_size(oct.size());
        let mut center = [0.0; 3];
        for axis in 0..self.dim as usize {
            center[axis] = anchor[axis] + half;
        }
        center
    }

    /// Physical center of one face of an octant.
    #[inline]
    pub fn get_face_center(&self, idx: u32, face: u8) -> [f64; 3] {
        self.get_face_center_of(self.octree.octant(idx), face)
    }

    pub fn get_face_center_of(&self, oct: &Octant, face: u8) -> [f64; 3] {
        let mut center = self.get_center_of(oct);
        let half = 0.5 * self.mapper.map_size(oct.size());
        let normal = self.tc.normals[face as usize];
        for axis in 0..self.dim as usize {
            center[axis] += normal[axis] as f64 * half;
        }
        center
    }

    /// Physical center of one edge of a 3D octant.
    #[inline]
    pub fn get_edge_center(&self, idx: u32, edge: u8) -> [f64; 3] {
        self.get_edge_center_of(self.octree.octant(idx), edge)
    }

    pub fn get_edge_center_of(&self, oct: &Octant, edge: u8) -> [f64; 3] {
        let mut center = self.get_center_of(oct);
        let half = 0.5 * self.mapper.map_size(oct.size());
        let coeff = self.tc.edge_coeffs[edge as usize];
        for axis in 0..self.dim as usize {
            center[axis] += coeff[axis] as f64 * half;
        }
        center
    }

    /// Physical coordinates of one corner node.
    #[inline]
    pub fn get_node(&self, idx: u32, node: u8) -> [f64; 3] {
        self.mapper.map_point(self.octree.octant(idx).logical_node(node))
    }

    /// Physical coordinates of all corner nodes.
    pub fn get_octant_nodes(&self, idx: u32) -> Vec<[f64; 3]> {
        let oct = self.octree.octant(idx);
        (0..self.tc.n_nodes)
            .map(|k| self.mapper.map_point(oct.logical_node(k)))
            .collect()
    }

    /// Outward unit normal of one face.
    pub fn get_normal(&self, idx: u32, face: u8) -> [f64; 3] {
        let _ = self.octree.octant(idx);
        let normal = self.tc.normals[face as usize];
        [normal[0] as f64, normal[1] as f64, normal[2] as f64]
    }

    /// Physical size of an octant of the given level.
    pub fn level_to_size(&self, level: u8) -> f64 {
        self.mapper.map_size(self.tc.lengths[level as usize])
    }

    /// Physical size of the smallest local octant.
    pub fn get_local_min_size(&self) -> f64 {
        self.level_to_size(self.octree.local_max_depth())
    }

    /// Physical size of the largest local octant.
    pub fn get_local_max_size(&self) -> f64 {
        let min_level = (0..self.get_num_octants())
            .map(|i| self.get_level(i))
            .min()
            .unwrap_or(0);
        self.level_to_size(min_level)
    }

    /// Node of an octant pointing towards its family center.
    pub fn get_family_splitting_node(&self, oct: &Octant) -> u8 {
        oct.family_splitting_node(self.tc)
    }

    /// The octants a target octant would turn into under a testing marker.
    pub fn expected_octant_adapt(&self, oct: &Octant, marker: i8) -> Vec<Octant> {
        if marker > 0 {
            oct.build_children(self.tc)
        } else if marker < 0 {
            vec![oct.build_father(self.tc)]
        } else {
            vec![*oct]
        }
    }

    // ----------------------------------------------------------------- //
    // Neighbor queries                                                  //
    // ----------------------------------------------------------------- //

    /// Neighbors of a local octant through one entity.
    pub fn find_neighbours(&self, idx: u32, entity_idx: u8, codim: u8) -> (Vec<u32>, Vec<bool>) {
        let oct = *self.octree.octant(idx);
        self.octree.find_neighbours(&oct, entity_idx, codim, false)
    }

    /// Neighbors of an arbitrary octant value through one entity.
    pub fn find_neighbours_of(
        &self,
        oct: &Octant,
        entity_idx: u8,
        codim: u8,
    ) -> (Vec<u32>, Vec<bool>) {
        self.octree.find_neighbours(oct, entity_idx, codim, false)
    }

    /// Internal neighbors of a ghost octant through one entity.
    pub fn find_ghost_neighbours(
        &self,
        ghost_idx: u32,
        entity_idx: u8,
        codim: u8,
    ) -> (Vec<u32>, Vec<bool>) {
        let oct = *self.octree.ghost(ghost_idx);
        self.octree.find_neighbours(&oct, entity_idx, codim, true)
    }

    /// The full 1-ring of a local octant.
    pub fn find_all_codim_neighbours(&self, idx: u32) -> (Vec<u32>, Vec<bool>) {
        let oct = *self.octree.octant(idx);
        self.octree.find_all_codim_neighbours(&oct, false)
    }

    /// Every octant sharing a corner node with a local octant.
    pub fn find_all_node_neighbours(&self, idx: u32, node: u8) -> (Vec<u32>, Vec<bool>) {
        let oct = *self.octree.octant(idx);
        self.octree.find_all_node_neighbours(&oct, node)
    }

    // ----------------------------------------------------------------- //
    // Point location                                                    //
    // ----------------------------------------------------------------- //

    fn point_to_morton(&self, point: &[f64; 3]) -> Option<u64> {
        let mut logical = [0u32; 3];
        for axis in 0..self.dim as usize {
            let raw = match axis {
                0 => self.mapper.unmap_x(point[0]),
                1 => self.mapper.unmap_y(point[1]),
                _ => self.mapper.unmap_z(point[2]),
            };
            if raw < -self.tol || raw > MAX_LENGTH as f64 + self.tol {
                return None;
            }
            logical[axis] = (raw.floor().max(0.0) as u32).min(MAX_LENGTH - 1);
        }
        Some(morton::encode(self.dim, logical[0], logical[1], logical[2]))
    }

    /// Local index of the internal octant containing the point, or
    /// [`NO_OWNER`] when the point is outside the local partition.
    pub fn get_point_owner_idx(&self, point: &[f64; 3]) -> u32 {
        self.point_to_morton(point)
            .and_then(|key| self.octree.owner_of_morton(key))
            .unwrap_or(NO_OWNER)
    }

    /// Like [`get_point_owner_idx`](Self::get_point_owner_idx), but also
    /// searches the ghost halo; the flag reports where the octant lives.
    pub fn get_point_owner_idx_and_ghost(&self, point: &[f64; 3]) -> (u32, bool) {
        let Some(key) = self.point_to_morton(point) else {
            return (NO_OWNER, false);
        };
        if let Some(idx) = self.octree.owner_of_morton(key) {
            return (idx, false);
        }
        if let Some(idx) = self.octree.ghost_owner_of_morton(key) {
            return (idx, true);
        }
        (NO_OWNER, false)
    }

    /// Rank owning the point, through the partition table.
    pub fn get_point_owner_rank(&self, point: &[f64; 3]) -> Option<usize> {
        let key = self.point_to_morton(point)?;
        if self.serial {
            return Some(self.rank);
        }
        self.partition.find_owner(key)
    }

    // ----------------------------------------------------------------- //
    // Markers                                                           //
    // ----------------------------------------------------------------- //

    /// Request refinement (positive) or coarsening (negative) of an octant
    /// at the next adapt.
    pub fn set_marker(&mut self, idx: u32, marker: i8) -> Result<(), OctreeError> {
        if self.last_op == Operation::PreAdapt {
            return Err(OctreeError::AdaptionPending);
        }
        if idx >= self.get_num_octants() {
            return Err(OctreeError::InvalidOctantIndex(idx));
        }
        self.octree.octant_mut(idx).set_marker(marker);
        Ok(())
    }

    /// Enable or disable 2:1 balancing for an octant.
    pub fn set_balance(&mut self, idx: u32, balance: bool) -> Result<(), OctreeError> {
        if self.last_op == Operation::PreAdapt {
            return Err(OctreeError::AdaptionPending);
        }
        if idx >= self.get_num_octants() {
            return Err(OctreeError::InvalidOctantIndex(idx));
        }
        self.octree.octant_mut(idx).set_balance(balance);
        Ok(())
    }

    // ----------------------------------------------------------------- //
    // Adaptation pipeline                                               //
    // ----------------------------------------------------------------- //

    /// Settle the markers into a 2:1-consistent state without adapting.
    pub fn settle_markers(&mut self) -> Result<(), OctreeError> {
        log::debug!("settle markers");
        self.run_balance(false)
    }

    /// Run the pre-adapt balance; an `adapt` call is mandatory afterwards.
    pub fn preadapt(&mut self) -> Result<(), OctreeError> {
        log::debug!("pre-adapt");
        self.run_balance(false)?;
        self.last_op = Operation::PreAdapt;
        Ok(())
    }

    /// Whether any octant anywhere carries a non-zero marker.
    pub fn check_to_adapt(&self) -> bool {
        let local = (0..self.get_num_octants()).any(|i| self.get_marker(i) != 0);
        if self.nproc == 1 {
            local
        } else {
            all_reduce_or(&self.comm, tags::REDUCE, local)
        }
    }

    fn run_balance(&mut self, balance_new: bool) -> Result<(), OctreeError> {
        balance_21(
            &self.comm,
            &mut self.octree,
            &self.borders_per_proc,
            self.serial || self.nproc == 1,
            balance_new,
        )
    }

    /// Adapt the tree according to the octant markers.
    ///
    /// With `mapping` enabled the old-to-new index mapping of this single
    /// adapt is recorded and can be queried through
    /// [`get_mapping`](Self::get_mapping). Returns whether the global
    /// octant count changed on any rank.
    pub fn adapt(&mut self, mapping: bool) -> Result<bool, OctreeError> {
        let done = self.private_adapt(mapping)?;
        self.status += done as u64;
        Ok(done)
    }

    fn private_adapt(&mut self, mapping: bool) -> Result<bool, OctreeError> {
        log::debug!(
            "adapt: {} octants before refine/coarse",
            self.global_num_octants
        );
        self.load_balance_ranges.clear();
        let distributed = !self.serial && self.nproc > 1;
        let nocts0 = self.get_num_octants();

        for idx in 0..nocts0 {
            let oct = self.octree.octant_mut(idx);
            oct.set_new_refined(false);
            oct.set_new_coarsened(false);
        }
        self.octree.clear_ghost_bros();

        if mapping {
            self.map_idx = (0..nocts0).collect();
        } else {
            self.map_idx.clear();
        }

        // 2:1 balance, unless a pre-adapt already settled the markers.
        if self.last_op != Operation::PreAdapt {
            self.run_balance(false)?;
        }

        // Refine.
        let mut map = std::mem::take(&mut self.map_idx);
        while self
            .octree
            .refine(mapping.then_some(&mut map))
        {}
        let mut local_done = self.get_num_octants() > nocts0;
        self.update_adapt();
        if distributed {
            self.compute_ghost_halo()?;
        }
        log::debug!("adapt: {} octants after refine", self.global_num_octants);
        let nocts1 = self.get_num_octants();

        // Coarse.
        while self.octree.coarse(mapping.then_some(&mut map)) {}
        self.map_idx = map;
        self.update_after_coarse();
        if distributed {
            self.compute_ghost_halo()?;
        }
        local_done |= self.get_num_octants() < nocts1;
        log::debug!("adapt: {} octants after coarse", self.global_num_octants);

        let global_done = if self.nproc > 1 {
            all_reduce_or(&self.comm, tags::REDUCE, local_done)
        } else {
            local_done
        };

        self.last_op = if mapping {
            Operation::AdaptMapped
        } else {
            Operation::AdaptUnmapped
        };
        Ok(global_done)
    }

    /// Refine every octant by one level.
    pub fn adapt_global_refine(&mut self, mapping: bool) -> Result<bool, OctreeError> {
        log::debug!("adapt (global refine)");
        let distributed = !self.serial && self.nproc > 1;
        let nocts0 = self.get_num_octants();

        for idx in 0..nocts0 {
            let oct = self.octree.octant_mut(idx);
            oct.set_new_refined(false);
            oct.set_new_coarsened(false);
        }
        self.map_idx = (0..nocts0).collect();

        for idx in 0..nocts0 {
            self.octree.octant_mut(idx).set_marker(1);
        }
        let mut map = std::mem::take(&mut self.map_idx);
        while self.octree.refine(Some(&mut map)) {}
        self.map_idx = map;

        let local_done = self.get_num_octants() > nocts0;
        self.update_adapt();
        if distributed {
            self.compute_ghost_halo()?;
        }

        let global_done = if self.nproc > 1 {
            all_reduce_or(&self.comm, tags::REDUCE, local_done)
        } else {
            local_done
        };
        self.last_op = if mapping {
            Operation::AdaptMapped
        } else {
            Operation::AdaptUnmapped
        };
        self.status += global_done as u64;
        Ok(global_done)
    }

    /// Coarsen every octant by one level where families allow it.
    pub fn adapt_global_coarse(&mut self, mapping: bool) -> Result<bool, OctreeError> {
        log::debug!("adapt (global coarse)");
        let distributed = !self.serial && self.nproc > 1;
        let nocts0 = self.get_num_octants();

        for idx in 0..nocts0 {
            let oct = self.octree.octant_mut(idx);
            oct.set_new_refined(false);
            oct.set_new_coarsened(false);
        }
        self.octree.clear_ghost_bros();
        if mapping {
            self.map_idx = (0..nocts0).collect();
        } else {
            self.map_idx.clear();
        }

        self.run_balance(false)?;

        let mut map = std::mem::take(&mut self.map_idx);
        if self.octree.global_coarse(mapping.then_some(&mut map)) {
            while self.octree.coarse(mapping.then_some(&mut map)) {}
        }
        self.update_after_coarse();
        if distributed {
            self.compute_ghost_halo()?;
        }

        // Coarsening may have broken 2:1 against untouched regions; patch
        // by balancing the new octants and refining the raises away.
        self.run_balance(true)?;
        while self.octree.refine(mapping.then_some(&mut map)) {}
        self.map_idx = map;
        self.update_adapt();
        if distributed {
            self.compute_ghost_halo()?;
        }

        let local_done = self.get_num_octants() < nocts0;
        let global_done = if self.nproc > 1 {
            all_reduce_or(&self.comm, tags::REDUCE, local_done)
        } else {
            local_done
        };
        self.last_op = if mapping {
            Operation::AdaptMapped
        } else {
            Operation::AdaptUnmapped
        };
        self.status += global_done as u64;
        Ok(global_done)
    }

    // ----------------------------------------------------------------- //
    // Mapping                                                           //
    // ----------------------------------------------------------------- //

    /// Old local indices of the octants a new octant came from, with ghost
    /// flags.
    ///
    /// Only answers for the most recent operation: after an adapt with
    /// mapping, refinement products report their parent's old index,
    /// coarsening products all pre-coarse children (ghost brothers
    /// included); operation chains are not composed.
    pub fn get_mapping(&self, idx: u32) -> Result<(Vec<u32>, Vec<bool>), OctreeError> {
        if self.last_op != Operation::AdaptMapped {
            return Err(OctreeError::MappingUnavailable);
        }
        if idx as usize >= self.map_idx.len() {
            return Err(OctreeError::InvalidOctantIndex(idx));
        }

        if self.get_is_new_c(idx) {
            let n_children = self.tc.n_children as usize;
            let last_ghost_bros = &self.octree.last_ghost_bros;
            let n_internal = if idx == self.get_num_octants() - 1 {
                n_children - last_ghost_bros.len()
            } else {
                n_children
            };

            let mut mapper = Vec::with_capacity(n_children);
            let mut is_ghost = Vec::with_capacity(n_children);
            for i in 0..n_internal {
                mapper.push(self.map_idx[idx as usize] + i as u32);
                is_ghost.push(false);
            }
            for i in n_internal..n_children {
                mapper.push(last_ghost_bros[i - n_internal]);
                is_ghost.push(true);
            }
            Ok((mapper, is_ghost))
        } else {
            Ok((vec![self.map_idx[idx as usize]], vec![false]))
        }
    }

    /// Mapping including origin ranks; also answers after a load balance,
    /// reporting each octant's pre-balance owner and local index there.
    pub fn get_mapping_with_ranks(
        &self,
        idx: u32,
    ) -> Result<(Vec<u32>, Vec<bool>, Vec<usize>), OctreeError> {
        match self.last_op {
            Operation::AdaptMapped => {
                let (mapper, is_ghost) = self.get_mapping(idx)?;
                let ranks = vec![self.rank; mapper.len()];
                Ok((mapper, is_ghost, ranks))
            }
            Operation::LoadBalance | Operation::LoadBalanceFirst => {
                let gidx = self.get_global_idx(idx);
                for (iproc, &last) in self.partition_range_global_idx0.iter().enumerate() {
                    if last >= gidx {
                        let offset = if iproc > 0 {
                            self.partition_range_global_idx0[iproc - 1] + 1
                        } else {
                            0
                        };
                        let origin = if self.last_op == Operation::LoadBalanceFirst {
                            self.rank
                        } else {
                            iproc
                        };
                        return Ok((vec![(gidx - offset) as u32], vec![false], vec![origin]));
                    }
                }
                Err(OctreeError::MappingUnavailable)
            }
            _ => Err(OctreeError::MappingUnavailable),
        }
    }

    /// After `preadapt`, the octants with non-zero markers (straddling
    /// ghost brothers included) as `(indices, markers, ghost flags)`.
    pub fn get_pre_mapping(&self) -> Result<(Vec<u32>, Vec<i8>, Vec<bool>), OctreeError> {
        if self.last_op != Operation::PreAdapt {
            return Err(OctreeError::MappingUnavailable);
        }

        let (first_bros, last_bros) = self.octree.straddle_ghost_bros();

        let mut idx = Vec::new();
        let mut markers = Vec::new();
        let mut is_ghost = Vec::new();

        for &g in &first_bros {
            idx.push(g);
            markers.push(self.octree.ghost(g).marker());
            is_ghost.push(true);
        }
        for i in 0..self.get_num_octants() {
            let marker = self.get_marker(i);
            if marker != 0 {
                idx.push(i);
                markers.push(marker);
                is_ghost.push(false);
            }
        }
        for &g in &last_bros {
            idx.push(g);
            markers.push(self.octree.ghost(g).marker());
            is_ghost.push(true);
        }
        Ok((idx, markers, is_ghost))
    }

    // ----------------------------------------------------------------- //
    // Load balance                                                      //
    // ----------------------------------------------------------------- //

    /// Redistribute the octants evenly (or by weight) across the ranks.
    ///
    /// `family_level` keeps sibling families compact: it counts levels
    /// above the deepest one present, and families at that level never
    /// straddle a process boundary afterwards.
    pub fn load_balance(
        &mut self,
        family_level: Option<u8>,
        weights: Option<&[f64]>,
    ) -> Result<(), OctreeError> {
        self.load_balance_with_data(family_level, weights, &mut NoData)
    }

    /// Load balance carrying a user payload along the moved octants.
    pub fn load_balance_with_data(
        &mut self,
        family_level: Option<u8>,
        weights: Option<&[f64]>,
        data: &mut dyn LoadBalanceData,
    ) -> Result<(), OctreeError> {
        log::debug!("load balance");
        if self.nproc == 1 {
            self.last_op = Operation::LoadBalance;
            return Ok(());
        }
        let target = self.compute_target_partition(family_level, weights);
        self.private_load_balance(&target, data)
    }

    /// Compute the exchange ranges of a hypothetical load balance without
    /// moving anything.
    pub fn eval_load_balance_ranges(
        &self,
        family_level: Option<u8>,
        weights: Option<&[f64]>,
    ) -> LoadBalanceRanges {
        if self.nproc == 1 {
            return LoadBalanceRanges::default();
        }
        let target = self.compute_target_partition(family_level, weights);
        let current = current_partition_counts(
            &self.partition,
            self.serial,
            self.rank,
            self.get_num_octants(),
        );
        LoadBalanceRanges {
            serial: self.serial,
            send: eval_send_ranges(&current, &target, self.rank),
            recv: eval_recv_ranges(&current, &target, self.rank),
        }
    }

    fn compute_target_partition(
        &self,
        family_level: Option<u8>,
        weights: Option<&[f64]>,
    ) -> Vec<u32> {
        let mut partition = match weights {
            None => compute_partition_uniform(self.global_num_octants, self.nproc),
            Some(weights) => {
                debug_assert!(weights.len() >= self.get_num_octants() as usize);
                compute_partition_weighted(
                    &self.comm,
                    &weights[..self.get_num_octants() as usize],
                    self.serial,
                    self.global_num_octants,
                    self.nproc,
                )
            }
        };
        if let Some(level) = family_level {
            apply_family_constraint(
                &self.comm,
                &self.octree,
                &self.partition,
                self.serial,
                self.max_depth,
                level,
                &mut partition,
            );
        }
        partition
    }

    fn private_load_balance(
        &mut self,
        target: &[u32],
        data: &mut dyn LoadBalanceData,
    ) -> Result<(), OctreeError> {
        let was_serial = self.serial;
        let current = current_partition_counts(
            &self.partition,
            was_serial,
            self.rank,
            self.get_num_octants(),
        );
        let send_ranges = eval_send_ranges(&current, target, self.rank);
        let recv_ranges = eval_recv_ranges(&current, target, self.rank);

        let target_offset: u64 = target[..self.rank].iter().map(|&c| c as u64).sum();
        let target_count = target[self.rank];

        if was_serial {
            // Every rank holds the whole tree: slice the target range out
            // locally and realign the payload.
            let offset = target_offset as u32;
            let mut gathered: Vec<Vec<u8>> = Vec::with_capacity(target_count as usize);
            for i in 0..target_count {
                let mut buf = Vec::new();
                data.gather(offset + i, &mut buf);
                gathered.push(buf);
            }
            for (i, buf) in gathered.iter().enumerate() {
                data.scatter(i as u32, buf);
            }
            let slice = self.octree.octants
                [offset as usize..(offset + target_count) as usize]
                .to_vec();
            self.octree.octants = slice;
        } else {
            // Ship the outgoing octants and the user payload.
            let mut octant_sends: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
            let mut payload_sends: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
            for (&dest, &(begin, end)) in &send_ranges {
                let mut obuf = Vec::with_capacity((end - begin) as usize * OctantWire::BINARY_SIZE);
                let mut pbuf = Vec::new();
                let mut item = Vec::new();
                for idx in begin..end {
                    obuf.extend_from_slice(bytemuck::bytes_of(&OctantWire::from(
                        self.octree.octant(idx),
                    )));
                    item.clear();
                    data.gather(idx, &mut item);
                    pbuf.extend_from_slice(&(item.len() as u32).to_le_bytes());
                    pbuf.extend_from_slice(&item);
                }
                octant_sends.insert(dest, obuf);
                payload_sends.insert(dest, pbuf);
            }

            let received = exchange_buffers(
                &self.comm,
                ExchangeCommTags::from_base(tags::LOAD_BALANCE),
                &octant_sends,
            )?;
            let payload_received = exchange_buffers(
                &self.comm,
                ExchangeCommTags::from_base(tags::LOAD_BALANCE_DATA),
                &payload_sends,
            )?;

            // Stitch the new local list: receives from lower ranks, the
            // kept mid-range, receives from higher ranks. The target
            // partition preserves the global Morton order, so plain
            // concatenation in rank order is already sorted.
            let current_offset: u64 = current[..self.rank].iter().map(|&c| c as u64).sum();
            let current_end = current_offset + current[self.rank] as u64;
            let keep_begin = current_offset.max(target_offset);
            let keep_end = current_end.min(target_offset + target_count as u64);

            let mut new_octants: Vec<Octant> = Vec::with_capacity(target_count as usize);
            for (&sender, buf) in &received {
                if sender >= self.rank {
                    continue;
                }
                for chunk in buf.chunks_exact(OctantWire::BINARY_SIZE) {
                    let wire: OctantWire = bytemuck::pod_read_unaligned(chunk);
                    new_octants.push(wire.to_octant());
                }
            }
            let kept_new_begin = new_octants.len() as u32;
            if keep_begin < keep_end {
                let lo = (keep_begin - current_offset) as usize;
                let hi = (keep_end - current_offset) as usize;
                new_octants.extend_from_slice(&self.octree.octants[lo..hi]);
            }
            for (&sender, buf) in &received {
                if sender <= self.rank {
                    continue;
                }
                for chunk in buf.chunks_exact(OctantWire::BINARY_SIZE) {
                    let wire: OctantWire = bytemuck::pod_read_unaligned(chunk);
                    new_octants.push(wire.to_octant());
                }
            }
            debug_assert_eq!(new_octants.len(), target_count as usize);

            // Realign the kept payload, then scatter the received one at
            // the new indices given by the receive ranges.
            if keep_begin < keep_end {
                let old_base = (keep_begin - current_offset) as u32;
                let count = (keep_end - keep_begin) as u32;
                let mut gathered: Vec<Vec<u8>> = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let mut buf = Vec::new();
                    data.gather(old_base + i, &mut buf);
                    gathered.push(buf);
                }
                for (i, buf) in gathered.iter().enumerate() {
                    data.scatter(kept_new_begin + i as u32, buf);
                }
            }
            for (&sender, &(begin, end)) in &recv_ranges {
                let Some(buf) = payload_received.get(&sender) else {
                    continue;
                };
                let mut cursor = 0usize;
                for idx in begin..end {
                    let len = u32::from_le_bytes(
                        buf[cursor..cursor + 4].try_into().expect("framed payload"),
                    ) as usize;
                    cursor += 4;
                    data.scatter(idx, &buf[cursor..cursor + len]);
                    cursor += len;
                }
            }

            self.octree.octants = new_octants;
        }

        // Publish the new partition.
        self.serial = false;
        self.octree.clear_derived();
        self.octree.clear_ghost_bros();
        self.octree.update_local_max_depth();
        self.octree.update_descendants();
        self.update_load_balance();
        self.compute_ghost_halo()?;

        self.load_balance_ranges = LoadBalanceRanges {
            serial: was_serial,
            send: send_ranges,
            recv: recv_ranges,
        };
        self.last_op = if was_serial {
            Operation::LoadBalanceFirst
        } else {
            Operation::LoadBalance
        };
        self.status += 1;

        log::debug!(
            "load balance: rank {} now owns {} octants",
            self.rank,
            self.get_num_octants()
        );
        Ok(())
    }

    // ----------------------------------------------------------------- //
    // Partition bookkeeping                                             //
    // ----------------------------------------------------------------- //

    /// Refresh counts, global size and maximum depth after a refinement or
    /// coarsening phase.
    fn update_adapt(&mut self) {
        self.partition_range_global_idx0 = self.partition.last_global_idx().to_vec();
        if self.serial || self.nproc == 1 {
            self.max_depth = self.octree.local_max_depth() as i8;
            self.global_num_octants = self.get_num_octants() as u64;
            self.partition = PartitionTable::new_serial(
                self.nproc,
                self.global_num_octants,
                self.octree.first_desc_morton(),
                self.octree.last_desc_morton(),
            );
        } else {
            self.max_depth = all_reduce_max_i8(
                &self.comm,
                tags::REDUCE,
                self.octree.local_max_depth() as i8,
            );
            let counts = all_gather(
                &self.comm,
                tags::PARTITION,
                self.get_num_octants() as u64,
            );
            self.global_num_octants = counts.iter().sum();
            self.partition.update_from_counts(&counts);
        }
    }

    /// Like [`update_adapt`](Self::update_adapt), but coarsening can move
    /// the partition endpoints, so the descendant ranges are refreshed too.
    fn update_after_coarse(&mut self) {
        self.update_adapt();
        if !self.serial && self.nproc > 1 {
            self.octree.update_descendants();
            self.exchange_descendants();
        }
    }

    fn update_load_balance(&mut self) {
        self.partition_range_global_idx0 = self.partition.last_global_idx().to_vec();
        let counts = all_gather(
            &self.comm,
            tags::PARTITION,
            self.get_num_octants() as u64,
        );
        self.global_num_octants = counts.iter().sum();
        self.partition.update_from_counts(&counts);
        self.exchange_descendants();
    }

    fn exchange_descendants(&mut self) {
        let first = all_gather(
            &self.comm,
            tags::DESCENDANTS,
            self.octree.first_desc_morton(),
        );
        let last = all_gather(
            &self.comm,
            tags::DESCENDANTS,
            self.octree.last_desc_morton(),
        );
        self.partition.update_descendants(first, last);
    }

    /// Rebuild the ghost halo and the per-rank source lists.
    fn compute_ghost_halo(&mut self) -> Result<(), OctreeError> {
        if self.serial || self.nproc == 1 {
            self.borders_per_proc.clear();
            self.octree.set_ghosts(Vec::new(), Vec::new(), Vec::new());
            return Ok(());
        }
        self.borders_per_proc = build_halo(
            &self.comm,
            &mut self.octree,
            &self.partition,
            self.nof_ghost_layers,
        )?;
        Ok(())
    }

    // ----------------------------------------------------------------- //
    // Connectivity & intersections                                      //
    // ----------------------------------------------------------------- //

    /// Build the deduplicated node numbering for internal and ghost
    /// octants.
    pub fn compute_connectivity(&mut self) {
        self.octree.compute_connectivity();
    }

    pub fn clear_connectivity(&mut self) {
        self.octree.clear_connectivity();
    }

    /// Rebuild the connectivity from the current octants.
    pub fn update_connectivity(&mut self) {
        self.octree.clear_connectivity();
        self.octree.compute_connectivity();
    }

    #[inline]
    pub fn get_num_nodes(&self) -> u32 {
        self.octree.nodes().len() as u32
    }

    /// Node indices of one internal octant.
    pub fn get_connectivity(&self, idx: u32) -> &[u32] {
        &self.octree.connectivity()[idx as usize]
    }

    /// Node indices of one ghost octant.
    pub fn get_ghost_connectivity(&self, ghost_idx: u32) -> &[u32] {
        &self.octree.ghosts_connectivity()[ghost_idx as usize]
    }

    /// Logical coordinates of a connectivity node.
    pub fn get_node_logical_coordinates(&self, node: u32) -> [u32; 3] {
        self.octree.nodes()[node as usize]
    }

    /// Physical coordinates of a connectivity node.
    pub fn get_node_coordinates(&self, node: u32) -> [f64; 3] {
        self.mapper.map_point(self.octree.nodes()[node as usize])
    }

    /// Build the face-intersection list.
    pub fn compute_intersections(&mut self) {
        self.octree.compute_intersections();
    }

    #[inline]
    pub fn get_num_intersections(&self) -> u32 {
        self.octree.intersections().len() as u32
    }

    #[inline]
    pub fn get_intersection(&self, idx: u32) -> &Intersection {
        &self.octree.intersections()[idx as usize]
    }

    /// The two owner handles of an intersection.
    pub fn get_intersection_owners(&self, inter: &Intersection) -> [TreeHandle; 2] {
        [
            TreeHandle {
                idx: inter.owners[0],
                is_ghost: false,
            },
            TreeHandle {
                idx: inter.owners[1],
                is_ghost: inter.out_is_ghost,
            },
        ]
    }

    fn intersection_finer_octant(&self, inter: &Intersection) -> (&Octant, u8) {
        if inter.finer == 0 || inter.is_bound {
            (self.octree.octant(inter.owners[0]), inter.face)
        } else {
            let oct = if inter.out_is_ghost {
                self.octree.ghost(inter.owners[1])
            } else {
                self.octree.octant(inter.owners[1])
            };
            (oct, self.tc.opp_face[inter.face as usize])
        }
    }

    /// Level of the finer side of an intersection.
    pub fn get_intersection_level(&self, inter: &Intersection) -> u8 {
        self.intersection_finer_octant(inter).0.level()
    }

    /// Physical size (edge length of the finer side) of an intersection.
    pub fn get_intersection_size(&self, inter: &Intersection) -> f64 {
        self.get_size_of(self.intersection_finer_octant(inter).0)
    }

    /// Physical area of an intersection.
    pub fn get_intersection_area(&self, inter: &Intersection) -> f64 {
        self.mapper
            .map_area(self.intersection_finer_octant(inter).0.size(), self.dim)
    }

    /// Physical center of an intersection.
    pub fn get_intersection_center(&self, inter: &Intersection) -> [f64; 3] {
        let (oct, face) = self.intersection_finer_octant(inter);
        self.get_face_center_of(oct, face)
    }

    /// Outward normal of an intersection, oriented out of `owners[0]`.
    pub fn get_intersection_normal(&self, inter: &Intersection) -> [f64; 3] {
        let normal = self.tc.normals[inter.face as usize];
        [normal[0] as f64, normal[1] as f64, normal[2] as f64]
    }

    // ----------------------------------------------------------------- //
    // Diagnostics                                                       //
    // ----------------------------------------------------------------- //

    /// Verify the 2:1 constraint across the whole distributed tree.
    pub fn check_21_balance(&self) -> bool {
        let local = self.octree.check_21_balance();
        if self.nproc == 1 {
            local
        } else {
            !all_reduce_or(&self.comm, tags::REDUCE, !local)
        }
    }

    // ----------------------------------------------------------------- //
    // Dump / restore                                                    //
    // ----------------------------------------------------------------- //

    /// Version of the binary dump format written by [`dump`](Self::dump).
    pub fn get_dump_version(&self) -> i32 {
        DUMP_VERSION
    }

    /// Write the tree state to a stream.
    ///
    /// With `full` enabled the mapping state of the last operation is
    /// included, so a restore can continue where the dump was taken.
    pub fn dump<W: Write>(&self, stream: &mut W, full: bool) -> Result<(), OctreeError> {
        let mut w = BinWriter::new(stream);

        w.i32(DUMP_VERSION)?;
        w.i32(self.nproc as i32)?;
        w.u8(self.dim)?;
        w.u8(self.serial as u8)?;
        w.u64(self.nof_ghost_layers as u64)?;
        w.i8(self.max_depth)?;
        w.u64(self.status)?;
        w.u8(self.get_balance_codim())?;

        for f in 0..self.tc.n_faces as usize {
            w.u8(self.octree.periodic()[f] as u8)?;
        }

        let n_octants = self.get_num_octants();
        w.u32(n_octants)?;
        w.u32(self.global_num_octants as u32)?;

        for idx in 0..n_octants {
            let oct = self.octree.octant(idx);
            let coords = oct.coords();
            w.u8(oct.level())?;
            w.u32(coords[0])?;
            w.u32(coords[1])?;
            w.u32(coords[2])?;
            w.i32(oct.ghost_layer() as i32)?;
            for bit in oct.info_bits() {
                w.u8(bit)?;
            }
            w.u8(oct.balance() as u8)?;
            w.i8(oct.marker())?;
        }

        for &desc in self.partition.first_desc() {
            w.u64(desc)?;
        }
        for &desc in self.partition.last_desc() {
            w.u64(desc)?;
        }
        for &last in self.partition.last_global_idx() {
            w.u64(last)?;
        }

        w.u8(full as u8)?;
        if full {
            w.i32(self.last_op.to_i32())?;
            match self.last_op {
                Operation::AdaptMapped => {
                    w.u64(self.map_idx.len() as u64)?;
                    for &entry in &self.map_idx {
                        w.u32(entry)?;
                    }
                    w.u64(self.octree.last_ghost_bros.len() as u64)?;
                    for &entry in &self.octree.last_ghost_bros {
                        w.u32(entry)?;
                    }
                }
                Operation::LoadBalance | Operation::LoadBalanceFirst => {
                    for &entry in &self.partition_range_global_idx0 {
                        w.u64(entry)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Rebuild a tree from a dump taken on the same number of processes.
    pub fn restore<R: Read>(stream: &mut R, comm: C) -> Result<Self, OctreeError> {
        let mut r = BinReader::new(stream);

        let version = r.i32()?;
        if version != DUMP_VERSION {
            return Err(OctreeError::DumpVersionMismatch {
                expected: DUMP_VERSION,
                found: version,
            });
        }

        let saved_nproc = r.i32()? as usize;
        if saved_nproc != comm.size() {
            return Err(OctreeError::ProcessCountMismatch {
                saved: saved_nproc,
                current: comm.size(),
            });
        }

        let dim = r.u8()?;
        let mut tree = ParaTree::new(dim, comm)?;
        tree.serial = r.u8()? != 0;
        tree.nof_ghost_layers = r.u64()? as usize;
        tree.max_depth = r.i8()?;
        tree.status = r.u64()?;
        let balance_codim = r.u8()?;

        tree.octree = LocalTree::empty(tree.tc);
        tree.octree.set_balance_codim(balance_codim);
        for f in 0..tree.tc.n_faces {
            if r.u8()? != 0 {
                tree.octree.set_periodic(f);
            }
        }

        let n_octants = r.u32()?;
        tree.global_num_octants = r.u32()? as u64;
        tree.octree.octants.reserve(n_octants as usize);
        for _ in 0..n_octants {
            let level = r.u8()?;
            if level > MAX_LEVEL {
                return Err(OctreeError::InvalidLevel(level, MAX_LEVEL));
            }
            let x = r.u32()?;
            let y = r.u32()?;
            let z = r.u32()?;
            let mut oct = Octant::new(tree.tc, level, x, y, z);
            let ghost_layer = r.i32()?;
            oct.set_ghost_layer(ghost_layer as i8);
            let mut bits = [0u8; INFO_ITEM_COUNT];
            for bit in bits.iter_mut() {
                *bit = r.u8()?;
            }
            oct.set_info_bits(&bits);
            oct.set_balance(r.u8()? != 0);
            oct.set_marker(r.i8()?);
            tree.octree.octants.push(oct);
        }
        tree.octree.update_local_max_depth();
        tree.octree.update_descendants();

        let nproc = tree.nproc;
        let mut first_desc = vec![0u64; nproc];
        let mut last_desc = vec![0u64; nproc];
        let mut last_idx = vec![0u64; nproc];
        for entry in first_desc.iter_mut() {
            *entry = r.u64()?;
        }
        for entry in last_desc.iter_mut() {
            *entry = r.u64()?;
        }
        for entry in last_idx.iter_mut() {
            *entry = r.u64()?;
        }
        tree.partition = PartitionTable::from_raw(last_idx, first_desc, last_desc);

        if !tree.serial {
            tree.compute_ghost_halo()?;
        }

        tree.map_idx.clear();
        tree.partition_range_global_idx0 = vec![0; nproc];
        tree.last_op = Operation::Init;

        if r.u8()? != 0 {
            let raw_op = r.i32()?;
            let op = Operation::from_i32(raw_op).ok_or(OctreeError::Io(format!(
                "unknown operation tag {raw_op} in dump"
            )))?;
            tree.last_op = op;
            match op {
                Operation::AdaptMapped => {
                    let map_len = r.u64()? as usize;
                    tree.map_idx = Vec::with_capacity(map_len);
                    for _ in 0..map_len {
                        tree.map_idx.push(r.u32()?);
                    }
                    let bros_len = r.u64()? as usize;
                    tree.octree.last_ghost_bros = Vec::with_capacity(bros_len);
                    for _ in 0..bros_len {
                        tree.octree.last_ghost_bros.push(r.u32()?);
                    }
                }
                Operation::LoadBalance | Operation::LoadBalanceFirst => {
                    for p in 0..nproc {
                        tree.partition_range_global_idx0[p] = r.u64()?;
                    }
                }
                _ => {}
            }
        }

        Ok(tree)
    }
}

// --------------------------------------------------------------------- //
// Binary stream helpers                                                 //
// --------------------------------------------------------------------- //

struct BinWriter<'a, W: Write> {
    stream: &'a mut W,
}

impl<'a, W: Write> BinWriter<'a, W> {
    fn new(stream: &'a mut W) -> Self {
        Self { stream }
    }

    fn u8(&mut self, v: u8) -> Result<(), OctreeError> {
        self.stream.write_all(&[v])?;
        Ok(())
    }

    fn i8(&mut self, v: i8) -> Result<(), OctreeError> {
        self.stream.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn i32(&mut self, v: i32) -> Result<(), OctreeError> {
        self.stream.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn u32(&mut self, v: u32) -> Result<(), OctreeError> {
        self.stream.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn u64(&mut self, v: u64) -> Result<(), OctreeError> {
        self.stream.write_all(&v.to_le_bytes())?;
        Ok(())
    }
}

struct BinReader<'a, R: Read> {
    stream: &'a mut R,
}

impl<'a, R: Read> BinReader<'a, R> {
    fn new(stream: &'a mut R) -> Self {
        Self { stream }
    }

    fn u8(&mut self) -> Result<u8, OctreeError> {
        let mut buf = [0u8; 1];
        self.stream.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn i8(&mut self) -> Result<i8, OctreeError> {
        Ok(self.u8()? as i8)
    }

    fn i32(&mut self) -> Result<i32, OctreeError> {
        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn u32(&mut self) -> Result<u32, OctreeError> {
        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, OctreeError> {
        let mut buf = [0u8; 8];
        self.stream.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;

    fn tree2() -> ParaTree<NoComm> {
        ParaTree::new(2, NoComm).unwrap()
    }

    #[test]
    fn rejects_invalid_dimension() {
        assert!(matches!(
            ParaTree::new(5, NoComm),
            Err(OctreeError::InvalidDimension(5))
        ));
    }

    #[test]
    fn two_global_refines_make_sixteen_leaves() {
        let mut tree = tree2();
        assert!(tree.adapt_global_refine(false).unwrap());
        assert!(tree.adapt_global_refine(false).unwrap());

        assert_eq!(tree.get_num_octants(), 16);
        assert_eq!(tree.get_global_num_octants(), 16);
        for i in 0..16 {
            assert_eq!(tree.get_level(i), 2);
            assert!(tree.get_is_new_r(i));
            let cell = (tree.get_octant(i).size() as u64).pow(2);
            assert_eq!(tree.get_morton(i), i as u64 * cell);
        }
    }

    #[test]
    fn adapt_without_markers_is_a_noop() {
        let mut tree = tree2();
        tree.adapt_global_refine(false).unwrap();
        let status = tree.get_status();
        assert!(!tree.adapt(false).unwrap());
        assert_eq!(tree.get_num_octants(), 4);
        assert_eq!(tree.get_status(), status);
        assert!(!tree.check_to_adapt());
    }

    #[test]
    fn adapt_runs_refine_and_coarse() {
        let mut tree = tree2();
        tree.adapt_global_refine(false).unwrap();
        tree.set_marker(0, 1).unwrap();
        assert!(tree.adapt(false).unwrap());
        assert_eq!(tree.get_num_octants(), 7);

        // Coarsen the four new leaves back.
        for i in 0..4 {
            tree.set_marker(i, -1).unwrap();
        }
        assert!(tree.adapt(false).unwrap());
        assert_eq!(tree.get_num_octants(), 4);
        assert!(tree.get_is_new_c(0));
    }

    #[test]
    fn mapping_tracks_refinement_parents() {
        let mut tree = tree2();
        tree.adapt_global_refine(false).unwrap();
        tree.set_marker(2, 1).unwrap();
        tree.adapt(true).unwrap();

        assert_eq!(tree.get_num_octants(), 7);
        // Octants 0 and 1 are untouched, octants 2..6 come from parent 2.
        assert_eq!(tree.get_mapping(0).unwrap().0, vec![0]);
        assert_eq!(tree.get_mapping(1).unwrap().0, vec![1]);
        for i in 2..6 {
            let (mapper, is_ghost) = tree.get_mapping(i).unwrap();
            assert_eq!(mapper, vec![2]);
            assert_eq!(is_ghost, vec![false]);
        }
        assert_eq!(tree.get_mapping(6).unwrap().0, vec![3]);
    }

    #[test]
    fn mapping_expands_coarsened_children() {
        let mut tree = tree2();
        tree.adapt_global_refine(false).unwrap();
        tree.adapt_global_refine(false).unwrap();
        for i in 4..8 {
            tree.set_marker(i, -1).unwrap();
        }
        tree.adapt(true).unwrap();

        assert_eq!(tree.get_num_octants(), 13);
        let new_c: Vec<u32> = (0..13).filter(|&i| tree.get_is_new_c(i)).collect();
        assert_eq!(new_c, vec![4]);
        let (mapper, is_ghost) = tree.get_mapping(4).unwrap();
        assert_eq!(mapper, vec![4, 5, 6, 7]);
        assert!(is_ghost.iter().all(|&g| !g));
    }

    #[test]
    fn preadapt_freezes_markers() {
        let mut tree = tree2();
        tree.adapt_global_refine(false).unwrap();
        tree.set_marker(0, 1).unwrap();
        tree.preadapt().unwrap();
        assert!(matches!(
            tree.set_marker(1, 1),
            Err(OctreeError::AdaptionPending)
        ));
        assert!(matches!(
            tree.set_balance(1, false),
            Err(OctreeError::AdaptionPending)
        ));
        let (idx, markers, ghost) = tree.get_pre_mapping().unwrap();
        assert_eq!(idx, vec![0]);
        assert_eq!(markers, vec![1]);
        assert_eq!(ghost, vec![false]);
        tree.adapt(false).unwrap();
        assert!(tree.set_marker(1, 1).is_ok());
    }

    #[test]
    fn balance_refines_neighbors_of_deep_cells() {
        let mut tree = tree2();
        tree.adapt_global_refine(false).unwrap();
        tree.set_marker(0, 2).unwrap();
        tree.adapt(false).unwrap();
        assert!(tree.check_21_balance());
        // Quadrants 1 and 2 were dragged one level down by the balance.
        assert!(tree.get_num_octants() > 7);
    }

    #[test]
    fn point_owner_lookup() {
        let mut tree = tree2();
        tree.adapt_global_refine(false).unwrap();
        let idx = tree.get_point_owner_idx(&[0.75, 0.25, 0.0]);
        assert_eq!(idx, 1);
        assert_eq!(tree.get_point_owner_idx(&[2.0, 0.0, 0.0]), NO_OWNER);
        assert_eq!(tree.get_point_owner_rank(&[0.1, 0.1, 0.0]), Some(0));
    }

    #[test]
    fn persistent_idx_packs_level() {
        let mut tree = tree2();
        tree.adapt_global_refine(false).unwrap();
        let idx = tree.get_persistent_idx(1);
        assert_eq!(idx & 0xff, 1);
        assert_eq!(idx >> 8, tree.get_morton(1));
    }

    #[test]
    fn ghost_layer_bounds_are_enforced() {
        let mut tree = tree2();
        assert!(tree.set_nof_ghost_layers(2).is_ok());
        assert!(matches!(
            tree.set_nof_ghost_layers(0),
            Err(OctreeError::InvalidGhostLayers(0, _))
        ));
        assert!(matches!(
            tree.set_nof_ghost_layers(1000),
            Err(OctreeError::InvalidGhostLayers(1000, _))
        ));
    }

    #[test]
    fn balance_codim_validation() {
        let mut tree = tree2();
        assert!(tree.set_balance_codim(2).is_ok());
        assert!(matches!(
            tree.set_balance_codim(3),
            Err(OctreeError::InvalidBalanceCodim(3, 2))
        ));
        let mut tree3 = ParaTree::new(3, NoComm).unwrap();
        assert!(tree3.set_balance_codim(3).is_ok());
    }

    #[test]
    fn dump_restore_round_trip_serial() {
        let mut tree = tree2();
        tree.adapt_global_refine(false).unwrap();
        tree.set_marker(0, 1).unwrap();
        tree.adapt(true).unwrap();
        tree.set_balance(2, false).unwrap();

        let mut buf = Vec::new();
        tree.dump(&mut buf, true).unwrap();

        let restored = ParaTree::restore(&mut buf.as_slice(), NoComm).unwrap();
        assert_eq!(restored.get_num_octants(), tree.get_num_octants());
        assert_eq!(restored.get_global_num_octants(), tree.get_global_num_octants());
        assert_eq!(restored.get_status(), tree.get_status());
        assert_eq!(restored.get_last_operation(), Operation::AdaptMapped);
        for i in 0..tree.get_num_octants() {
            assert_eq!(restored.get_level(i), tree.get_level(i));
            assert_eq!(restored.get_morton(i), tree.get_morton(i));
            assert_eq!(restored.get_marker(i), tree.get_marker(i));
            assert_eq!(restored.get_balance(i), tree.get_balance(i));
            assert_eq!(restored.get_global_idx(i), tree.get_global_idx(i));
            for f in 0..tree.get_nfaces() {
                assert_eq!(restored.get_bound(i, f), tree.get_bound(i, f));
            }
        }
        // The mapping survives a full dump.
        assert_eq!(
            restored.get_mapping(0).unwrap(),
            tree.get_mapping(0).unwrap()
        );
    }

    #[test]
    fn restore_rejects_wrong_version() {
        let tree = tree2();
        let mut buf = Vec::new();
        tree.dump(&mut buf, false).unwrap();
        buf[0] = 9;
        assert!(matches!(
            ParaTree::restore(&mut buf.as_slice(), NoComm),
            Err(OctreeError::DumpVersionMismatch { found: 9, .. })
        ));
    }

    #[test]
    fn local_max_size_is_the_true_maximum() {
        let mut tree = tree2();
        tree.adapt_global_refine(false).unwrap();
        tree.set_marker(3, 1).unwrap();
        tree.adapt(false).unwrap();
        // Coarsest remaining octant is level 1 even though the last octant
        // in Morton order is finer.
        assert_eq!(tree.get_local_max_size(), 0.5);
        assert_eq!(tree.get_local_min_size(), 0.25);
    }
}

//! A single octant: level, integer anchor and per-octant state.
//!
//! Octants are plain values; everything dimension-dependent takes the
//! [`TreeConstants`] table. An octant occupies
//! `[x, x+s) x [y, y+s) x [z, z+s)` with `s = 2^(MAX_LEVEL - level)`, and its
//! anchor coordinates are always multiples of `s`. In 2D the z coordinate is
//! zero and the z extent collapses.

use bytemuck::{Pod, Zeroable};

use crate::tree::constants::{TreeConstants, MAX_LENGTH, MAX_LEVEL};
use crate::tree::morton;

// Info bit layout. Bits 0..5 are per-face domain-boundary flags, 6..11 the
// per-face partition-boundary flags, then the adaptation flags; the
// remaining bits up to INFO_ITEM_COUNT are reserved.
const INFO_BOUND0: u16 = 0;
const INFO_PBOUND0: u16 = 6;
const INFO_NEW_REFINED: u16 = 12;
const INFO_NEW_COARSENED: u16 = 13;
const INFO_AUX: u16 = 14;

/// One cell of the linear octree, identified by `(level, anchor)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Octant {
    x: u32,
    y: u32,
    z: u32,
    level: u8,
    marker: i8,
    ghost_layer: i8,
    balance: bool,
    info: u16,
}

impl Octant {
    /// The root octant covering the whole domain.
    pub fn root(tc: &TreeConstants) -> Self {
        let mut oct = Self {
            x: 0,
            y: 0,
            z: 0,
            level: 0,
            marker: 0,
            ghost_layer: -1,
            balance: true,
            info: 0,
        };
        oct.update_bounds(tc);
        oct
    }

    /// Build an octant from raw parts; boundary flags are derived from the
    /// coordinates.
    pub fn new(tc: &TreeConstants, level: u8, x: u32, y: u32, z: u32) -> Self {
        debug_assert!(level <= MAX_LEVEL);
        let mut oct = Self {
            x,
            y,
            z,
            level,
            marker: 0,
            ghost_layer: -1,
            balance: true,
            info: 0,
        };
        oct.update_bounds(tc);
        oct
    }

    #[inline]
    pub fn coords(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    #[inline]
    pub fn coord(&self, axis: usize) -> u32 {
        [self.x, self.y, self.z][axis]
    }

    #[inline]
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Logical edge length of this octant.
    #[inline]
    pub fn size(&self) -> u32 {
        1 << (MAX_LEVEL - self.level)
    }

    #[inline]
    pub fn marker(&self) -> i8 {
        self.marker
    }

    /// Set the refinement marker, clamped so the resulting level stays in
    /// `[0, MAX_LEVEL]`.
    pub fn set_marker(&mut self, marker: i8) {
        let lo = -(self.level as i16);
        let hi = (MAX_LEVEL - self.level) as i16;
        self.marker = (marker as i16).clamp(lo, hi) as i8;
    }

    /// The level this octant requests after adaptation.
    #[inline]
    pub fn target_level(&self) -> i16 {
        self.level as i16 + self.marker as i16
    }

    #[inline]
    pub fn balance(&self) -> bool {
        self.balance
    }

    #[inline]
    pub fn set_balance(&mut self, balance: bool) {
        self.balance = balance;
    }

    #[inline]
    pub fn ghost_layer(&self) -> i8 {
        self.ghost_layer
    }

    #[inline]
    pub fn set_ghost_layer(&mut self, layer: i8) {
        self.ghost_layer = layer;
    }

    #[inline]
    pub fn is_ghost(&self) -> bool {
        self.ghost_layer >= 0
    }

    // --- info bits ---

    #[inline]
    fn info_bit(&self, bit: u16) -> bool {
        self.info & (1 << bit) != 0
    }

    #[inline]
    fn set_info_bit(&mut self, bit: u16, value: bool) {
        if value {
            self.info |= 1 << bit;
        } else {
            self.info &= !(1 << bit);
        }
    }

    /// Whether face `f` lies on the domain boundary.
    #[inline]
    pub fn bound(&self, f: u8) -> bool {
        self.info_bit(INFO_BOUND0 + f as u16)
    }

    /// Whether any face lies on the domain boundary.
    pub fn is_bound(&self, tc: &TreeConstants) -> bool {
        (0..tc.n_faces).any(|f| self.bound(f))
    }

    /// Whether face `f` touches another process's partition.
    #[inline]
    pub fn pbound(&self, f: u8) -> bool {
        self.info_bit(INFO_PBOUND0 + f as u16)
    }

    #[inline]
    pub fn set_pbound(&mut self, f: u8, value: bool) {
        self.set_info_bit(INFO_PBOUND0 + f as u16, value);
    }

    /// Whether any face touches another process's partition.
    pub fn is_pbound(&self, tc: &TreeConstants) -> bool {
        (0..tc.n_faces).any(|f| self.pbound(f))
    }

    #[inline]
    pub fn is_new_refined(&self) -> bool {
        self.info_bit(INFO_NEW_REFINED)
    }

    #[inline]
    pub fn set_new_refined(&mut self, value: bool) {
        self.set_info_bit(INFO_NEW_REFINED, value);
    }

    #[inline]
    pub fn is_new_coarsened(&self) -> bool {
        self.info_bit(INFO_NEW_COARSENED)
    }

    #[inline]
    pub fn set_new_coarsened(&mut self, value: bool) {
        self.set_info_bit(INFO_NEW_COARSENED, value);
    }

    #[inline]
    pub fn aux(&self) -> bool {
        self.info_bit(INFO_AUX)
    }

    #[inline]
    pub fn set_aux(&mut self, value: bool) {
        self.set_info_bit(INFO_AUX, value);
    }

    /// Serialize the info bits in dump order.
    pub fn info_bits(&self) -> [u8; crate::tree::constants::INFO_ITEM_COUNT] {
        let mut bits = [0u8; crate::tree::constants::INFO_ITEM_COUNT];
        for (k, bit) in bits.iter_mut().enumerate() {
            *bit = self.info_bit(k as u16) as u8;
        }
        bits
    }

    /// Restore the info bits from dump order.
    pub fn set_info_bits(&mut self, bits: &[u8]) {
        self.info = 0;
        for (k, &bit) in bits.iter().enumerate().take(16) {
            self.set_info_bit(k as u16, bit != 0);
        }
    }

    /// Recompute the domain-boundary flags from the anchor coordinates.
    pub fn update_bounds(&mut self, tc: &TreeConstants) {
        let s = self.size();
        for axis in 0..tc.dim as usize {
            let c = self.coord(axis);
            self.set_info_bit(INFO_BOUND0 + 2 * axis as u16, c == 0);
            self.set_info_bit(INFO_BOUND0 + 2 * axis as u16 + 1, c + s == MAX_LENGTH);
        }
    }

    // --- Morton arithmetic ---

    /// Morton key of the anchor; also the first descendant of this octant.
    #[inline]
    pub fn morton(&self, dim: u8) -> u64 {
        morton::encode(dim, self.x, self.y, self.z)
    }

    /// Morton key of the deepest last descendant.
    pub fn last_desc_morton(&self, dim: u8) -> u64 {
        let s = self.size() - 1;
        if dim == 2 {
            morton::encode(dim, self.x + s, self.y + s, 0)
        } else {
            morton::encode(dim, self.x + s, self.y + s, self.z + s)
        }
    }

    /// Persistent identifier: anchor Morton with the level packed in the low
    /// eight bits.
    #[inline]
    pub fn persistent_idx(&self, dim: u8) -> u64 {
        (self.morton(dim) << 8) | self.level as u64
    }

    /// Position of this octant within its sibling family.
    pub fn child_index(&self) -> u8 {
        let s = self.size();
        let mut index = ((self.x / s) & 1) as u8;
        index |= (((self.y / s) & 1) as u8) << 1;
        index |= (((self.z / s) & 1) as u8) << 2;
        index
    }

    /// Whether this octant is the first (Morton-lowest) child of its father.
    #[inline]
    pub fn is_first_child(&self) -> bool {
        self.level > 0 && self.child_index() == 0
    }

    /// Build the `2^dim` children in Morton order.
    ///
    /// Children inherit the balance flag, get the refinement flag set and
    /// their markers cleared; the caller adjusts markers as needed.
    pub fn build_children(&self, tc: &TreeConstants) -> Vec<Octant> {
        debug_assert!(self.level < MAX_LEVEL);
        let half = self.size() / 2;
        let mut children = Vec::with_capacity(tc.n_children as usize);
        for c in 0..tc.n_children as u32 {
            let mut child = Octant::new(
                tc,
                self.level + 1,
                self.x + half * (c & 1),
                self.y + half * ((c >> 1) & 1),
                self.z + half * ((c >> 2) & 1),
            );
            child.balance = self.balance;
            child.set_new_refined(true);
            children.push(child);
        }
        children
    }

    /// Build the father octant.
    pub fn build_father(&self, tc: &TreeConstants) -> Octant {
        debug_assert!(self.level > 0);
        let s2 = self.size() * 2;
        let mut father = Octant::new(
            tc,
            self.level - 1,
            self.x - self.x % s2,
            self.y - self.y % s2,
            self.z - self.z % s2,
        );
        father.balance = self.balance;
        father.set_new_coarsened(true);
        father
    }

    /// Logical coordinates of corner node `k`.
    #[inline]
    pub fn logical_node(&self, k: u8) -> [u32; 3] {
        let s = self.size();
        [
            self.x + s * (k as u32 & 1),
            self.y + s * ((k as u32 >> 1) & 1),
            self.z + s * ((k as u32 >> 2) & 1),
        ]
    }

    /// Logical coordinates of all corner nodes.
    pub fn logical_nodes(&self, tc: &TreeConstants) -> Vec<[u32; 3]> {
        (0..tc.n_nodes).map(|k| self.logical_node(k)).collect()
    }

    /// Stable key for node deduplication: the Morton key of the node
    /// coordinates at full resolution, independent of the owning octant.
    #[inline]
    pub fn node_persistent_key(&self, dim: u8, k: u8) -> u64 {
        let [nx, ny, nz] = self.logical_node(k);
        morton::encode(dim, nx, ny, nz)
    }

    /// Outward integer normal of face `f`.
    #[inline]
    pub fn normal(&self, tc: &TreeConstants, f: u8) -> [i8; 3] {
        tc.normals[f as usize]
    }

    /// The corner node splitting this octant from the rest of its family
    /// (the node pointing towards the family center).
    pub fn family_splitting_node(&self, tc: &TreeConstants) -> u8 {
        (tc.n_children - 1) - self.child_index()
    }
}

/// Fixed-layout record for shipping octants between ranks and for the
/// binary dump. All integers little-endian on the wire.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct OctantWire {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub level: u8,
    pub marker: i8,
    pub balance: u8,
    pub ghost_layer: i8,
    pub info: u16,
    pub _pad: [u8; 2],
}

impl OctantWire {
    /// Serialized size of one octant record.
    pub const BINARY_SIZE: usize = core::mem::size_of::<OctantWire>();
}

impl From<&Octant> for OctantWire {
    fn from(oct: &Octant) -> Self {
        Self {
            x: oct.x,
            y: oct.y,
            z: oct.z,
            level: oct.level,
            marker: oct.marker,
            balance: oct.balance as u8,
            ghost_layer: oct.ghost_layer,
            info: oct.info,
            _pad: [0; 2],
        }
    }
}

impl OctantWire {
    /// Rebuild an octant from its wire record.
    pub fn to_octant(&self) -> Octant {
        Octant {
            x: self.x,
            y: self.y,
            z: self.z,
            level: self.level,
            marker: self.marker,
            ghost_layer: self.ghost_layer,
            balance: self.balance != 0,
            info: self.info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::constants::TreeConstants;

    #[test]
    fn root_covers_domain() {
        let tc = TreeConstants::get(2).unwrap();
        let root = Octant::root(tc);
        assert_eq!(root.size(), MAX_LENGTH);
        assert!(root.bound(0) && root.bound(1) && root.bound(2) && root.bound(3));
        assert_eq!(root.morton(2), 0);
    }

    #[test]
    fn children_partition_the_father() {
        for dim in [2u8, 3] {
            let tc = TreeConstants::get(dim).unwrap();
            let father = Octant::new(tc, 2, 0, 1 << 18, 0);
            let children = father.build_children(tc);
            assert_eq!(children.len(), tc.n_children as usize);

            // Children are contiguous in Morton order and refine the father.
            let base = father.morton(dim);
            let span = (children[0].size() as u64).pow(dim as u32);
            for (c, child) in children.iter().enumerate() {
                assert_eq!(child.level(), father.level() + 1);
                assert_eq!(child.morton(dim), base + c as u64 * span);
                assert!(child.is_new_refined());
                assert_eq!(child.build_father(tc).coords(), father.coords());
            }
            assert_eq!(
                children.last().unwrap().last_desc_morton(dim),
                father.last_desc_morton(dim)
            );
        }
    }

    #[test]
    fn marker_clamps_to_valid_levels() {
        let tc = TreeConstants::get(3).unwrap();
        let mut oct = Octant::new(tc, 1, 0, 0, 0);
        oct.set_marker(-5);
        assert_eq!(oct.marker(), -1);
        oct.set_marker(5);
        assert_eq!(oct.marker(), 5);
        let mut deep = Octant::new(tc, MAX_LEVEL, 0, 0, 0);
        deep.set_marker(3);
        assert_eq!(deep.marker(), 0);
    }

    #[test]
    fn node_keys_are_shared_between_touching_octants() {
        let tc = TreeConstants::get(2).unwrap();
        let half = MAX_LENGTH / 2;
        let a = Octant::new(tc, 1, 0, 0, 0);
        let b = Octant::new(tc, 1, half, 0, 0);
        // a's node 1 and b's node 0 are the same logical corner.
        assert_eq!(a.node_persistent_key(2, 1), b.node_persistent_key(2, 0));
    }

    #[test]
    fn wire_round_trip() {
        let tc = TreeConstants::get(3).unwrap();
        let mut oct = Octant::new(tc, 4, 64, 128, 192);
        oct.set_marker(-1);
        oct.set_balance(false);
        oct.set_pbound(3, true);
        oct.set_new_coarsened(true);

        let wire = OctantWire::from(&oct);
        let bytes = bytemuck::bytes_of(&wire).to_vec();
        let back: OctantWire = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(back.to_octant(), oct);
    }

    #[test]
    fn family_splitting_node_points_inward() {
        let tc = TreeConstants::get(3).unwrap();
        let father = Octant::new(tc, 3, 0, 0, 0);
        for child in father.build_children(tc) {
            let node = child.family_splitting_node(tc);
            // The splitting node of every child is the family center.
            let center = child.logical_node(node);
            let s = child.size();
            assert_eq!(center, [s, s, s]);
        }
    }
}

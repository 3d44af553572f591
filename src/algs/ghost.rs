//! Ghost-halo construction.
//!
//! The halo is not built directly: each process identifies the internal
//! octants that must be visible to a neighboring process (its "sources"),
//! then ships them. The first layer of sources is the set of
//! process-border octants, discovered by looking up the owners of the
//! virtual neighbor cells across every face, edge and node. Further layers
//! grow ring by ring through per-target-rank accretions: the population
//! holds the sources found so far, the internal seeds are expanded locally
//! and the foreign seeds are handed to the rank that owns them after every
//! growth step.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::comm::{all_reduce_max_i8, exchange_buffers, tags, Communicator, ExchangeCommTags};
use crate::error::OctreeError;
use crate::tree::local::{EntityKind, LocalTree};
use crate::tree::morton;
use crate::tree::octant::{Octant, OctantWire};
use crate::tree::partition::PartitionTable;

/// Per-octant source lists: for every neighbor rank, the Morton-sorted
/// local indices of the internal octants mirrored there.
pub type BordersPerProc = BTreeMap<usize, Vec<u32>>;

/// Work object growing the source set for one target rank.
struct Accretion {
    target_rank: usize,
    /// Internal sources found so far, keyed by global index, valued by ring.
    population: HashMap<u64, i32>,
    /// Internal octants whose neighborhoods are still to be expanded here.
    internal_seeds: HashMap<u64, i32>,
    /// Remote octants whose neighborhoods must be expanded by their owner.
    foreign_seeds: HashMap<u64, i32>,
}

impl Accretion {
    fn new(target_rank: usize) -> Self {
        Self {
            target_rank,
            population: HashMap::new(),
            internal_seeds: HashMap::new(),
            foreign_seeds: HashMap::new(),
        }
    }
}

/// Serialized size of one ghost record on the wire.
const GHOST_ENTRY_SIZE: usize = 8 + OctantWire::BINARY_SIZE + 4;

/// Rebuild the ghost halo: discover the sources for every neighboring
/// process through `n_layers` rings, exchange them and materialize the
/// ghost containers. Returns the per-rank source lists.
pub fn build_halo<C: Communicator>(
    comm: &C,
    tree: &mut LocalTree,
    partition: &PartitionTable,
    n_layers: usize,
) -> Result<BordersPerProc, OctreeError> {
    // The virtual-cell enumeration needs the deepest level present anywhere.
    let local_depth = tree.local_max_depth() as i8;
    let max_depth = all_reduce_max_i8(comm, tags::REDUCE, local_depth).max(0) as u8;

    let mut borders = discover_first_layer(comm, tree, partition, max_depth);

    // Ring index of every source, aligned with `borders`.
    let mut source_layers: BTreeMap<usize, Vec<i32>> = borders
        .iter()
        .map(|(&target, sources)| (target, vec![0i32; sources.len()]))
        .collect();

    // The first ghost layer must exist before the accretions grow: the
    // 1-rings of the seeds reach across process boundaries only through
    // these ghosts.
    materialize_ghosts(comm, tree, partition, &borders, &source_layers)?;

    if n_layers > 1 {
        let mut accretions = initialize_accretions(comm, partition, &borders, n_layers);
        let mut one_rings: HashMap<u32, Vec<u64>> = HashMap::new();

        for _layer in 1..n_layers {
            exchange_accretions(comm, partition, &mut accretions)?;
            grow_accretions(comm, tree, partition, &mut accretions, &mut one_rings);
        }
        // Propagate the foreign seeds of the last growth to their owners;
        // their population entries complete the last source layer.
        exchange_accretions(comm, partition, &mut accretions)?;

        let offset = partition.global_offset(comm.rank());
        borders.clear();
        source_layers.clear();
        for accretion in &accretions {
            let mut sources: Vec<u32> = accretion
                .population
                .keys()
                .map(|&gidx| (gidx - offset) as u32)
                .collect();
            sources.sort_unstable();
            let layers = sources
                .iter()
                .map(|&local| accretion.population[&(offset + local as u64)])
                .collect();
            borders.insert(accretion.target_rank, sources);
            source_layers.insert(accretion.target_rank, layers);
        }

        materialize_ghosts(comm, tree, partition, &borders, &source_layers)?;
    }

    Ok(borders)
}

/// Find the process-border octants, set their pbound flags and build the
/// first layer of sources.
fn discover_first_layer<C: Communicator>(
    comm: &C,
    tree: &mut LocalTree,
    partition: &PartitionTable,
    max_depth: u8,
) -> BordersPerProc {
    let rank = comm.rank();
    let dim = tree.dim();
    let tc = tree.constants();

    let mut borders: BordersPerProc = BTreeMap::new();
    let mut cells: Vec<[u32; 3]> = Vec::new();

    for idx in 0..tree.num_octants() {
        let oct = *tree.octant(idx);
        let mut neigh_procs = std::collections::BTreeSet::new();

        for f in 0..tc.n_faces {
            let mut face_pbound = false;
            if tree.virtual_entity_cells(&oct, EntityKind::Face, f, max_depth, &mut cells) {
                for cell in &cells {
                    let key = morton::encode(dim, cell[0], cell[1], cell[2]);
                    if let Some(owner) = partition.find_owner(key) {
                        if owner != rank {
                            neigh_procs.insert(owner);
                            face_pbound = true;
                        }
                    }
                }
            }
            tree.octant_mut(idx).set_pbound(f, face_pbound);
        }

        if dim == 3 {
            for e in 0..tc.n_edges {
                if tree.virtual_entity_cells(&oct, EntityKind::Edge, e, max_depth, &mut cells) {
                    for cell in &cells {
                        let key = morton::encode(dim, cell[0], cell[1], cell[2]);
                        if let Some(owner) = partition.find_owner(key) {
                            if owner != rank {
                                neigh_procs.insert(owner);
                            }
                        }
                    }
                }
            }
        }

        for n in 0..tc.n_nodes {
            if tree.virtual_entity_cells(&oct, EntityKind::Node, n, max_depth, &mut cells) {
                for cell in &cells {
                    let key = morton::encode(dim, cell[0], cell[1], cell[2]);
                    if let Some(owner) = partition.find_owner(key) {
                        if owner != rank {
                            neigh_procs.insert(owner);
                        }
                    }
                }
            }
        }

        for proc in neigh_procs {
            borders.entry(proc).or_default().push(idx);
        }
    }

    borders
}

fn initialize_accretions<C: Communicator>(
    comm: &C,
    partition: &PartitionTable,
    borders: &BordersPerProc,
    n_layers: usize,
) -> Vec<Accretion> {
    const FIRST_LAYER: i32 = 0;
    let offset = partition.global_offset(comm.rank());

    let mut accretions = Vec::with_capacity(borders.len());
    for (&target_rank, sources) in borders {
        let mut accretion = Accretion::new(target_rank);
        accretion.population.reserve(n_layers * sources.len());
        accretion.internal_seeds.reserve(sources.len());
        for &local_idx in sources {
            let global_idx = offset + local_idx as u64;
            accretion.population.insert(global_idx, FIRST_LAYER);
            accretion.internal_seeds.insert(global_idx, FIRST_LAYER);
        }
        accretions.push(accretion);
    }
    accretions
}

/// Expand every accretion by the 1-rings of its internal seeds.
fn grow_accretions<C: Communicator>(
    comm: &C,
    tree: &LocalTree,
    partition: &PartitionTable,
    accretions: &mut [Accretion],
    one_rings: &mut HashMap<u32, Vec<u64>>,
) {
    let rank = comm.rank();
    let offset = partition.global_offset(rank);
    let last = partition.last_global_idx()[rank];

    for accretion in accretions.iter_mut() {
        if accretion.internal_seeds.is_empty() {
            continue;
        }
        let seeds = std::mem::take(&mut accretion.internal_seeds);

        for (&seed_global, &seed_layer) in &seeds {
            let seed_local = (seed_global - offset) as u32;
            let ring = one_rings.entry(seed_local).or_insert_with(|| {
                let oct = *tree.octant(seed_local);
                let (neigh, is_ghost) = tree.find_all_codim_neighbours(&oct, false);
                let mut ring = Vec::with_capacity(neigh.len() + 1);
                for (k, idx) in neigh.into_iter().enumerate() {
                    if is_ghost[k] {
                        ring.push(tree.ghost_global_ids()[idx as usize]);
                    } else {
                        ring.push(offset + idx as u64);
                    }
                }
                ring.push(seed_global);
                ring
            });

            for &neigh_global in ring.iter() {
                if accretion.population.contains_key(&neigh_global) {
                    continue;
                }
                let is_internal = neigh_global >= offset && neigh_global <= last;
                if is_internal {
                    accretion.population.insert(neigh_global, seed_layer + 1);
                    accretion.internal_seeds.insert(neigh_global, seed_layer + 1);
                } else if let Some(owner) = partition.owner_of_global(neigh_global) {
                    if owner != accretion.target_rank {
                        accretion
                            .foreign_seeds
                            .entry(neigh_global)
                            .or_insert(seed_layer + 1);
                    }
                }
            }
        }
    }
}

/// Hand every foreign seed to the rank owning it; the owner continues the
/// accretion locally.
fn exchange_accretions<C: Communicator>(
    comm: &C,
    partition: &PartitionTable,
    accretions: &mut Vec<Accretion>,
) -> Result<(), OctreeError> {
    // owner rank -> target rank -> seeds
    let mut foreign: BTreeMap<usize, BTreeMap<usize, Vec<(u64, i32)>>> = BTreeMap::new();
    for accretion in accretions.iter_mut() {
        for (&global_idx, &layer) in &accretion.foreign_seeds {
            let owner = partition
                .owner_of_global(global_idx)
                .expect("foreign seed past end of tree");
            foreign
                .entry(owner)
                .or_default()
                .entry(accretion.target_rank)
                .or_default()
                .push((global_idx, layer));
        }
        accretion.foreign_seeds.clear();
    }

    let mut sends: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    for (owner, per_target) in &foreign {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(per_target.len() as u64).to_le_bytes());
        for (&target, seeds) in per_target {
            buf.extend_from_slice(&(target as u64).to_le_bytes());
            buf.extend_from_slice(&(seeds.len() as u64).to_le_bytes());
            for &(global_idx, layer) in seeds {
                buf.extend_from_slice(&global_idx.to_le_bytes());
                buf.extend_from_slice(&layer.to_le_bytes());
            }
        }
        sends.insert(*owner, buf);
    }

    let received = exchange_buffers(
        comm,
        ExchangeCommTags::from_base(tags::ACCRETION),
        &sends,
    )?;

    for (_sender, buf) in received {
        let mut cursor = ByteReader::new(&buf);
        let n_accretions = cursor.read_u64()?;
        for _ in 0..n_accretions {
            let target_rank = cursor.read_u64()? as usize;
            let accretion = match accretions
                .iter_mut()
                .find(|a| a.target_rank == target_rank)
            {
                Some(existing) => existing,
                None => {
                    accretions.push(Accretion::new(target_rank));
                    accretions.last_mut().unwrap()
                }
            };
            let n_seeds = cursor.read_u64()?;
            for _ in 0..n_seeds {
                let global_idx = cursor.read_u64()?;
                let layer = cursor.read_i32()?;
                // Received seeds are internal by construction.
                accretion.population.entry(global_idx).or_insert(layer);
                accretion.internal_seeds.entry(global_idx).or_insert(layer);
            }
        }
    }

    Ok(())
}

/// Ship the sources and store the received octants as the ghost containers,
/// concatenated in ascending source-rank order (which is Morton order).
fn materialize_ghosts<C: Communicator>(
    comm: &C,
    tree: &mut LocalTree,
    partition: &PartitionTable,
    borders: &BordersPerProc,
    source_layers: &BTreeMap<usize, Vec<i32>>,
) -> Result<(), OctreeError> {
    let rank = comm.rank();
    let offset = partition.global_offset(rank);
    let dim = tree.dim();

    let mut sends: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    for (&target, sources) in borders {
        let layers = &source_layers[&target];
        let mut buf = Vec::with_capacity(sources.len() * GHOST_ENTRY_SIZE);
        for (k, &local_idx) in sources.iter().enumerate() {
            let oct = tree.octant(local_idx);
            buf.extend_from_slice(&(offset + local_idx as u64).to_le_bytes());
            buf.extend_from_slice(bytemuck::bytes_of(&OctantWire::from(oct)));
            buf.extend_from_slice(&layers[k].to_le_bytes());
        }
        sends.insert(target, buf);
    }

    let received = exchange_buffers(comm, ExchangeCommTags::from_base(tags::GHOSTS), &sends)?;

    let total: usize = received.values().map(|b| b.len() / GHOST_ENTRY_SIZE).sum();
    let mut ghosts: Vec<Octant> = Vec::with_capacity(total);
    let mut global_ids: Vec<u64> = Vec::with_capacity(total);
    let mut spans: Vec<(usize, u32, u32)> = Vec::with_capacity(received.len());

    for (sender, buf) in &received {
        let count = buf.len() / GHOST_ENTRY_SIZE;
        spans.push((*sender, ghosts.len() as u32, count as u32));
        let mut cursor = ByteReader::new(buf);
        for _ in 0..count {
            let global_idx = cursor.read_u64()?;
            let wire: OctantWire =
                bytemuck::pod_read_unaligned(cursor.read_bytes(OctantWire::BINARY_SIZE)?);
            let layer = cursor.read_i32()?;
            let mut ghost = wire.to_octant();
            ghost.set_ghost_layer(layer as i8);
            global_ids.push(global_idx);
            ghosts.push(ghost);
        }
    }

    debug_assert!(ghosts.windows(2).all(|w| {
        (w[0].morton(dim), w[0].level()) < (w[1].morton(dim), w[1].level())
    }));

    tree.set_ghosts(ghosts, global_ids, spans);
    Ok(())
}

/// Minimal little-endian byte reader for the halo wire formats.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], OctreeError> {
        if self.pos + len > self.buf.len() {
            return Err(OctreeError::CommFailure(
                "truncated exchange buffer".to_string(),
            ));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, OctreeError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32, OctreeError> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }
}

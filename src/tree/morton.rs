//! Morton (Z-order) encoding of logical octant coordinates.
//!
//! Keys interleave the low [`MAX_LEVEL`](crate::tree::constants::MAX_LEVEL)
//! bits of the anchor coordinates: two-way for quadtrees, three-way for
//! octrees. The induced total order is consistent with a depth-first
//! traversal of the tree, which is what keeps the linear representation
//! sorted through refinement and coarsening.

/// Spread the low 21 bits of `x` into every third bit of a 64-bit word.
#[inline]
const fn spread_by_3(x: u32) -> u64 {
    let mut x = x as u64 & 0x1f_ffff;
    x = (x | (x << 32)) & 0x001f_0000_0000_ffff;
    x = (x | (x << 16)) & 0x001f_0000_ff00_00ff;
    x = (x | (x << 8)) & 0x100f_00f0_0f00_f00f;
    x = (x | (x << 4)) & 0x10c3_0c30_c30c_30c3;
    x = (x | (x << 2)) & 0x1249_2492_4924_9249;
    x
}

/// Compact every third bit of a 64-bit word into the low 21 bits.
#[inline]
const fn compact_by_3(x: u64) -> u32 {
    let mut x = x & 0x1249_2492_4924_9249;
    x = (x | (x >> 2)) & 0x10c3_0c30_c30c_30c3;
    x = (x | (x >> 4)) & 0x100f_00f0_0f00_f00f;
    x = (x | (x >> 8)) & 0x001f_0000_ff00_00ff;
    x = (x | (x >> 16)) & 0x001f_0000_0000_ffff;
    x = (x | (x >> 32)) & 0x001f_ffff;
    x as u32
}

/// Spread the low 32 bits of `x` into every other bit of a 64-bit word.
#[inline]
const fn spread_by_2(x: u32) -> u64 {
    let mut x = x as u64;
    x = (x | (x << 16)) & 0x0000_ffff_0000_ffff;
    x = (x | (x << 8)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x << 4)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    x = (x | (x << 1)) & 0x5555_5555_5555_5555;
    x
}

/// Compact every other bit of a 64-bit word into the low 32 bits.
#[inline]
const fn compact_by_2(x: u64) -> u32 {
    let mut x = x & 0x5555_5555_5555_5555;
    x = (x | (x >> 1)) & 0x3333_3333_3333_3333;
    x = (x | (x >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x >> 4)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x >> 8)) & 0x0000_ffff_0000_ffff;
    x = (x | (x >> 16)) & 0x0000_0000_ffff_ffff;
    x as u32
}

/// Encode logical coordinates into a Morton key.
///
/// For `dim == 2` the z coordinate is ignored.
#[inline]
pub fn encode(dim: u8, x: u32, y: u32, z: u32) -> u64 {
    if dim == 2 {
        spread_by_2(x) | (spread_by_2(y) << 1)
    } else {
        spread_by_3(x) | (spread_by_3(y) << 1) | (spread_by_3(z) << 2)
    }
}

/// Decode a Morton key back into logical coordinates.
///
/// For `dim == 2` the returned z coordinate is zero.
#[inline]
pub fn decode(dim: u8, key: u64) -> [u32; 3] {
    if dim == 2 {
        [compact_by_2(key), compact_by_2(key >> 1), 0]
    } else {
        [compact_by_3(key), compact_by_3(key >> 1), compact_by_3(key >> 2)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unit_steps_interleave() {
        assert_eq!(encode(3, 0, 0, 0), 0);
        assert_eq!(encode(3, 1, 0, 0), 1);
        assert_eq!(encode(3, 0, 1, 0), 2);
        assert_eq!(encode(3, 0, 0, 1), 4);
        assert_eq!(encode(3, 1, 1, 1), 7);

        assert_eq!(encode(2, 1, 0, 0), 1);
        assert_eq!(encode(2, 0, 1, 0), 2);
        assert_eq!(encode(2, 1, 1, 0), 3);
    }

    #[test]
    fn decode_ignores_z_in_2d() {
        let key = encode(2, 1023, 77, 0);
        assert_eq!(decode(2, key), [1023, 77, 0]);
    }

    proptest! {
        #[test]
        fn round_trip_3d(x in 0u32..(1 << 21), y in 0u32..(1 << 21), z in 0u32..(1 << 21)) {
            let key = encode(3, x, y, z);
            prop_assert_eq!(decode(3, key), [x, y, z]);
        }

        #[test]
        fn round_trip_2d(x in 0u32..(1 << 20), y in 0u32..(1 << 20)) {
            let key = encode(2, x, y, 0);
            prop_assert_eq!(decode(2, key), [x, y, 0]);
        }

        #[test]
        fn octant_block_keys_are_contiguous(x in 0u32..(1 << 19), y in 0u32..(1 << 19), z in 0u32..(1 << 19)) {
            // An aligned 2x2x2 block occupies eight consecutive keys.
            let (x, y, z) = (x & !1, y & !1, z & !1);
            let base = encode(3, x, y, z);
            for dz in 0..2u32 {
                for dy in 0..2u32 {
                    for dx in 0..2u32 {
                        let key = encode(3, x + dx, y + dy, z + dz);
                        prop_assert_eq!(key, base + (dx + 2 * dy + 4 * dz) as u64);
                    }
                }
            }
        }
    }
}

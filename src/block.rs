//! The fixed block-kind enumeration and its static per-kind metadata.
//!
//! Block behavior (placement rules, ticking, redstone, crafting, ...) is an external
//! collaborator's concern; this module only fixes the identity of a block and the facts
//! the meshing and water code need: is it solid, transparent, alpha-tested, a water
//! block, and how tall it renders.

/// A block identifier, stored as a dense `u16` so a whole chunk column array
/// (`CHUNK_SIDE * WORLD_HEIGHT * CHUNK_SIDE` of them) stays compact and `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct BlockId(pub u16);

impl BlockId {
    pub const AIR: BlockId = BlockId(0);
    pub const STONE: BlockId = BlockId(1);
    pub const DIRT: BlockId = BlockId(2);
    pub const GRASS: BlockId = BlockId(3);
    pub const WATER_SOURCE: BlockId = BlockId(4);
    pub const WATER_FLOWING: BlockId = BlockId(5);
    pub const LEAVES: BlockId = BlockId(6);
    pub const GLASS: BlockId = BlockId(7);

    #[inline]
    pub fn info(self) -> BlockInfo {
        block_info(self)
    }

    #[inline]
    pub fn is_air(self) -> bool {
        self == Self::AIR
    }

    #[inline]
    pub fn is_water(self) -> bool {
        self == Self::WATER_SOURCE || self == Self::WATER_FLOWING
    }

    /// A water block that is not a source block: the "transient residue" the dirty
    /// tracker and save repository care about (spec.md §4.4, §4.3).
    #[inline]
    pub fn is_flowing_water(self) -> bool {
        self == Self::WATER_FLOWING
    }
}

/// Static, per-kind rendering/physics facts used by the mesh pipeline and the water
/// collaborator hook. Never mutated at runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockInfo {
    /// Whether the block occludes neighboring faces for face-culling purposes.
    pub solid: bool,
    /// Whether the block lets light/visibility through even though it may be solid.
    pub transparent: bool,
    /// Whether the block's faces are drawn with alpha testing (foliage, glass panes).
    pub alpha_tested: bool,
    /// Whether this is a water block (source or flowing).
    pub is_water: bool,
    /// Visual height of the top face, in sixteenths of a block (16 = full cube).
    pub visual_height: u8,
}

const AIR_INFO: BlockInfo = BlockInfo {
    solid: false,
    transparent: true,
    alpha_tested: false,
    is_water: false,
    visual_height: 0,
};

const OPAQUE_CUBE: BlockInfo = BlockInfo {
    solid: true,
    transparent: false,
    alpha_tested: false,
    is_water: false,
    visual_height: 16,
};

const WATER_SOURCE_INFO: BlockInfo = BlockInfo {
    solid: false,
    transparent: true,
    alpha_tested: false,
    is_water: true,
    visual_height: 14,
};

const WATER_FLOWING_INFO: BlockInfo = BlockInfo {
    solid: false,
    transparent: true,
    alpha_tested: false,
    is_water: true,
    visual_height: 12,
};

const LEAVES_INFO: BlockInfo = BlockInfo {
    solid: true,
    transparent: true,
    alpha_tested: true,
    is_water: false,
    visual_height: 16,
};

const GLASS_INFO: BlockInfo = BlockInfo {
    solid: true,
    transparent: true,
    alpha_tested: false,
    is_water: false,
    visual_height: 16,
};

/// Look up the static metadata for a block id. Unknown ids default to an opaque cube,
/// which is the safer default for face culling (never under-cull).
fn block_info(id: BlockId) -> BlockInfo {
    match id {
        BlockId::AIR => AIR_INFO,
        BlockId::WATER_SOURCE => WATER_SOURCE_INFO,
        BlockId::WATER_FLOWING => WATER_FLOWING_INFO,
        BlockId::LEAVES => LEAVES_INFO,
        BlockId::GLASS => GLASS_INFO,
        _ => OPAQUE_CUBE,
    }
}

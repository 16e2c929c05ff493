// Dense voxel grids
//
// A grid is a flat row-major array of cells, index = x + y*W + z*W*H.
// Zero is empty; any other value is a packed 0x00RRGGBB color.

use crate::backend::error::{RenderError, Result};
use bytemuck::{Pod, Zeroable};
use glam::{UVec3, UVec4, Vec3, Vec4};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelGrid {
    dims: UVec3,
    cells: Vec<u32>,
}

impl VoxelGrid {
    pub fn new(dims: UVec3, cells: Vec<u32>) -> Result<Self> {
        let expected = cell_count(dims)?;
        if cells.len() != expected {
            return Err(RenderError::InvalidVoxelGrid(format!(
                "{}x{}x{} grid needs {} cells, got {}",
                dims.x,
                dims.y,
                dims.z,
                expected,
                cells.len()
            )));
        }
        Ok(Self { dims, cells })
    }

    pub fn empty(dims: UVec3) -> Result<Self> {
        let count = cell_count(dims)?;
        Ok(Self {
            dims,
            cells: vec![0; count],
        })
    }

    /// A solid ball of `radius` cells centred in the grid, shaded from
    /// blue at the bottom to orange at the top.
    pub fn filled_sphere(dims: UVec3, radius: f32) -> Result<Self> {
        let mut grid = Self::empty(dims)?;
        let center = dims.as_vec3() * 0.5;

        for z in 0..dims.z {
            for y in 0..dims.y {
                for x in 0..dims.x {
                    let cell = Vec3::new(x as f32, y as f32, z as f32) + 0.5;
                    if cell.distance(center) > radius {
                        continue;
                    }
                    let t = (y as f32 + 0.5) / dims.y as f32;
                    let color = Vec3::new(0.2, 0.4, 0.9).lerp(Vec3::new(1.0, 0.6, 0.2), t);
                    let index = grid.index(x, y, z);
                    grid.cells[index] = pack_color(color);
                }
            }
        }

        Ok(grid)
    }

    pub fn dims(&self) -> UVec3 {
        self.dims
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.cells)
    }

    pub fn index(&self, x: u32, y: u32, z: u32) -> usize {
        (x + y * self.dims.x + z * self.dims.x * self.dims.y) as usize
    }

    pub fn get(&self, x: u32, y: u32, z: u32) -> Option<u32> {
        if x >= self.dims.x || y >= self.dims.y || z >= self.dims.z {
            return None;
        }
        Some(self.cells[self.index(x, y, z)])
    }

    pub fn filled(&self) -> usize {
        self.cells.iter().filter(|&&cell| cell != 0).count()
    }
}

fn cell_count(dims: UVec3) -> Result<usize> {
    if dims.min_element() == 0 {
        return Err(RenderError::InvalidVoxelGrid(format!(
            "dimensions must be non-zero, got {}x{}x{}",
            dims.x, dims.y, dims.z
        )));
    }
    dims.x
        .checked_mul(dims.y)
        .and_then(|xy| xy.checked_mul(dims.z))
        .map(|count| count as usize)
        .ok_or_else(|| RenderError::InvalidVoxelGrid("grid has more than u32::MAX cells".into()))
}

/// Pack a linear [0, 1] color into 0x00RRGGBB; never returns 0 (empty).
pub fn pack_color(color: Vec3) -> u32 {
    let [r, g, b] = (color.clamp(Vec3::ZERO, Vec3::ONE) * 255.0).round().to_array();
    let packed = ((r as u32) << 16) | ((g as u32) << 8) | b as u32;
    packed.max(1)
}

/// Push constant block of the voxel compute shader.
///
/// Mirrors `layout(push_constant) uniform Params { uvec4 grid_size; vec4 camera; }`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct VoxelPushConstants {
    pub grid_size: UVec4,
    /// xyz: eye position in grid space, w: elapsed seconds
    pub camera: Vec4,
}

impl VoxelPushConstants {
    /// Camera orbiting the grid centre once every ~12.5 seconds.
    pub fn orbit(dims: UVec3, elapsed: f32) -> Self {
        let center = dims.as_vec3() * 0.5;
        let distance = dims.max_element() as f32 * 1.6;
        let angle = elapsed * 0.5;
        let eye = center
            + Vec3::new(
                angle.cos() * distance,
                dims.y as f32 * 0.4,
                angle.sin() * distance,
            );

        Self {
            grid_size: dims.extend(0),
            camera: eye.extend(elapsed),
        }
    }
}

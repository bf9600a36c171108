use super::interner::MatrixInterner;
use crate::core::gfx::RenderQuad;
use bytemuck::{Pod, Zeroable};
use cgmath::{Matrix4, SquareMatrix};
use log::warn;
use std::mem;

/// One accumulated quad, exactly as the GPU sees it. Mirrors the std430
/// struct in `quad.vert`; the array stride there is 64 bytes, so the
/// explicit tail padding is load-bearing.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct QuadRecord {
    /// left, top, right, bottom in scene units.
    pub rect: [f32; 4],
    /// Texture-coordinate rect, same corner convention.
    pub uv_rect: [f32; 4],
    /// Per-corner RGBA8, packed little-endian, corner order
    /// top-left, top-right, bottom-right, bottom-left.
    pub colors: [u32; 4],
    /// world index (low 16 bits) | view index << 16 | projection index << 24.
    /// After `pack` these are offsets into the combined uniform array.
    pub matrices: u32,
    pub slot: u32,
    pub _pad: [u32; 2],
}

pub const QUAD_RECORD_SIZE: usize = mem::size_of::<QuadRecord>();
const INDICES_PER_QUAD: usize = 6;
const MATRIX_SIZE: usize = mem::size_of::<[f32; 16]>();

/// View and projection indices are packed into 8-bit fields that must also
/// absorb the projection-block offset at pack time, so their combined
/// per-frame population is capped at 256.
const NARROW_MATRIX_LIMIT: usize = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackOutput {
    pub quad_count: u32,
    pub index_count: u32,
    pub matrix_count: u32,
}

/// Central buffer of pending quads for the current frame. Grows across
/// submissions, is packed into the persistent mapped buffers exactly once
/// per frame, then cleared together with the three interners.
pub struct QuadBatch {
    quads: Vec<QuadRecord>,
    indices: Vec<u16>,
    world: MatrixInterner,
    view: MatrixInterner,
    projection: MatrixInterner,
    centering: Matrix4<f32>,
    quad_capacity: usize,
    index_capacity: usize,
    uniform_capacity: usize,
}

impl QuadBatch {
    pub fn new(quad_capacity: usize, index_capacity: usize, uniform_capacity: usize) -> Self {
        Self {
            quads: Vec::new(),
            indices: Vec::new(),
            world: MatrixInterner::new(),
            view: MatrixInterner::new(),
            projection: MatrixInterner::new(),
            centering: Matrix4::identity(),
            quad_capacity,
            index_capacity,
            uniform_capacity,
        }
    }

    /// Compatibility transform folded into the view matrix at submission
    /// time, rather than carried as a separate uniform.
    pub fn set_centering(&mut self, centering: Matrix4<f32>) {
        self.centering = centering;
    }

    pub fn quad_count(&self) -> usize {
        self.quads.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    /// Appends a batch of quads sharing one transform/texture state.
    /// Returns false (and drops the whole batch, logged) when any fixed
    /// capacity would be exceeded; previously accumulated data is never
    /// disturbed.
    pub fn submit(
        &mut self,
        quads: &[RenderQuad],
        world: &Matrix4<f32>,
        view: &Matrix4<f32>,
        projection: &Matrix4<f32>,
        uv_translate: [f32; 2],
        slot: u32,
    ) -> bool {
        if quads.is_empty() {
            return true;
        }

        let total = self.quads.len() + quads.len();
        if total * QUAD_RECORD_SIZE > self.quad_capacity {
            warn!(
                "dropping {} quads: quad buffer full ({} of {} bytes used)",
                quads.len(),
                self.quads.len() * QUAD_RECORD_SIZE,
                self.quad_capacity
            );
            return false;
        }
        if total * INDICES_PER_QUAD * mem::size_of::<u16>() > self.index_capacity {
            warn!("dropping {} quads: index buffer full", quads.len());
            return false;
        }

        let centered_view = view * self.centering;
        let world_index = self.world.intern(world);
        let view_index = self.view.intern(&centered_view);
        let proj_index = self.projection.intern(projection);

        if view_index > 255 || proj_index > 255 {
            warn!(
                "dropping {} quads: narrow matrix index overflow (view {view_index}, projection {proj_index})",
                quads.len()
            );
            return false;
        }
        if self.view.len() + self.projection.len() > NARROW_MATRIX_LIMIT {
            warn!(
                "dropping {} quads: {} view + {} projection matrices exceed the packed-index limit of {NARROW_MATRIX_LIMIT}",
                quads.len(),
                self.view.len(),
                self.projection.len()
            );
            return false;
        }
        let matrix_total = self.world.len() + self.view.len() + self.projection.len();
        if matrix_total * MATRIX_SIZE > self.uniform_capacity {
            warn!(
                "dropping {} quads: {matrix_total} interned matrices exceed the uniform buffer",
                quads.len()
            );
            return false;
        }

        let matrices =
            u32::from(world_index) | (u32::from(view_index) << 16) | (u32::from(proj_index) << 24);

        for quad in quads {
            let base = (self.quads.len() * 4) as u16;
            self.quads.push(QuadRecord {
                rect: quad.rect,
                uv_rect: [
                    quad.uv_rect[0] + uv_translate[0],
                    quad.uv_rect[1] + uv_translate[1],
                    quad.uv_rect[2] + uv_translate[0],
                    quad.uv_rect[3] + uv_translate[1],
                ],
                colors: [
                    u32::from_le_bytes(quad.colors[0]),
                    u32::from_le_bytes(quad.colors[1]),
                    u32::from_le_bytes(quad.colors[2]),
                    u32::from_le_bytes(quad.colors[3]),
                ],
                matrices,
                slot,
                _pad: [0; 2],
            });
            // Two triangles sharing the corner-0/corner-2 diagonal.
            self.indices.extend_from_slice(&[
                base,
                base + 1,
                base + 2,
                base + 2,
                base + 3,
                base,
            ]);
        }
        true
    }

    /// Packs the frame's accumulated state into the destination buffers:
    /// quad records (matrix indices rewritten to offsets into the combined
    /// uniform array), 16-bit indices, and the uniform array laid out as
    /// projection block, view block, world block, in that order.
    ///
    /// The destinations are the persistent mapped buffers at frame end; the
    /// caller records the single indexed draw from the returned counts and
    /// then calls `reset`.
    pub fn pack(
        &mut self,
        quad_dst: &mut [u8],
        index_dst: &mut [u8],
        uniform_dst: &mut [u8],
    ) -> PackOutput {
        let proj_count = self.projection.len() as u32;
        let view_count = self.view.len() as u32;

        for record in &mut self.quads {
            let world = record.matrices & 0xffff;
            let view = (record.matrices >> 16) & 0xff;
            let proj = (record.matrices >> 24) & 0xff;
            record.matrices = (world + proj_count + view_count)
                | ((view + proj_count) << 16)
                | (proj << 24);
        }

        let quad_bytes: &[u8] = bytemuck::cast_slice(&self.quads);
        quad_dst[..quad_bytes.len()].copy_from_slice(quad_bytes);

        let index_bytes: &[u8] = bytemuck::cast_slice(&self.indices);
        index_dst[..index_bytes.len()].copy_from_slice(index_bytes);

        let mut offset = 0;
        for block in [&self.projection, &self.view, &self.world] {
            let bytes: &[u8] = bytemuck::cast_slice(block.entries());
            uniform_dst[offset..offset + bytes.len()].copy_from_slice(bytes);
            offset += bytes.len();
        }

        PackOutput {
            quad_count: self.quads.len() as u32,
            index_count: self.indices.len() as u32,
            matrix_count: proj_count + view_count + self.world.len() as u32,
        }
    }

    /// Clears all accumulator state and the three interners. Called once
    /// per frame, after `pack` has issued the GPU copy.
    pub fn reset(&mut self) {
        self.quads.clear();
        self.indices.clear();
        self.world.reset();
        self.view.reset();
        self.projection.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: usize = 1024;

    fn white_quad(rect: [f32; 4]) -> RenderQuad {
        RenderQuad {
            rect,
            uv_rect: [0.0, 0.0, 1.0, 1.0],
            colors: [[255; 4]; 4],
        }
    }

    fn batch() -> QuadBatch {
        QuadBatch::new(64 * KIB, 12 * KIB, 16 * KIB)
    }

    fn mats() -> (Matrix4<f32>, Matrix4<f32>, Matrix4<f32>) {
        (
            Matrix4::from_scale(2.0),
            Matrix4::from_scale(3.0),
            Matrix4::from_scale(4.0),
        )
    }

    #[test]
    fn six_indices_per_quad_referencing_valid_corners() {
        let mut b = batch();
        let (w, v, p) = mats();
        let quads: Vec<_> = (0..5)
            .map(|i| white_quad([i as f32, 0.0, i as f32 + 1.0, 1.0]))
            .collect();
        assert!(b.submit(&quads, &w, &v, &p, [0.0, 0.0], 1));
        assert!(b.submit(&quads[..2], &w, &v, &p, [0.0, 0.0], 1));

        assert_eq!(b.index_count(), 6 * b.quad_count());
        let mut quad_dst = vec![0u8; 64 * KIB];
        let mut index_dst = vec![0u8; 12 * KIB];
        let mut uniform_dst = vec![0u8; 16 * KIB];
        let out = b.pack(&mut quad_dst, &mut index_dst, &mut uniform_dst);
        let indices: &[u16] = bytemuck::cast_slice(&index_dst[..out.index_count as usize * 2]);
        assert!(indices.iter().all(|&i| (i as u32) < 4 * out.quad_count));
    }

    #[test]
    fn capacity_boundary_is_exact() {
        // Room for exactly four quads.
        let mut b = QuadBatch::new(4 * QUAD_RECORD_SIZE, KIB, 16 * KIB);
        let (w, v, p) = mats();
        let quad = white_quad([0.0, 0.0, 1.0, 1.0]);

        assert!(b.submit(&[quad; 4], &w, &v, &p, [0.0, 0.0], 1));
        assert_eq!(b.quad_count(), 4);
        // One more must be refused without disturbing what's there.
        assert!(!b.submit(&[quad], &w, &v, &p, [0.0, 0.0], 1));
        assert_eq!(b.quad_count(), 4);
        assert_eq!(b.index_count(), 24);
    }

    #[test]
    fn refused_batch_is_all_or_nothing() {
        let mut b = QuadBatch::new(4 * QUAD_RECORD_SIZE, KIB, 16 * KIB);
        let (w, v, p) = mats();
        let quad = white_quad([0.0, 0.0, 1.0, 1.0]);
        assert!(b.submit(&[quad; 3], &w, &v, &p, [0.0, 0.0], 1));
        // Three in, two more would overflow: the whole pair is dropped.
        assert!(!b.submit(&[quad; 2], &w, &v, &p, [0.0, 0.0], 1));
        assert_eq!(b.quad_count(), 3);
    }

    #[test]
    fn packed_records_round_trip() {
        let mut b = batch();
        let world = Matrix4::from_scale(2.0);
        let view = Matrix4::from_scale(3.0);
        let proj = Matrix4::from_scale(4.0);
        let quad = RenderQuad {
            rect: [10.0, 20.0, 30.0, 40.0],
            uv_rect: [0.0, 0.25, 0.5, 0.75],
            colors: [
                [255, 0, 0, 255],
                [0, 255, 0, 255],
                [0, 0, 255, 255],
                [255, 255, 255, 128],
            ],
        };
        assert!(b.submit(&[quad], &world, &view, &proj, [0.1, 0.2], 5));

        let mut quad_dst = vec![0u8; KIB];
        let mut index_dst = vec![0u8; KIB];
        let mut uniform_dst = vec![0u8; 16 * KIB];
        let out = b.pack(&mut quad_dst, &mut index_dst, &mut uniform_dst);
        assert_eq!(out.quad_count, 1);
        assert_eq!(out.index_count, 6);
        assert_eq!(out.matrix_count, 3);

        let records: &[QuadRecord] = bytemuck::cast_slice(&quad_dst[..QUAD_RECORD_SIZE]);
        let r = records[0];
        assert_eq!(r.rect, [10.0, 20.0, 30.0, 40.0]);
        let expected_uv = [0.1, 0.45, 0.6, 0.95];
        for (got, want) in r.uv_rect.iter().zip(expected_uv) {
            assert!((got - want).abs() < 1e-6);
        }
        assert_eq!(r.colors[0], u32::from_le_bytes([255, 0, 0, 255]));
        assert_eq!(r.colors[3], u32::from_le_bytes([255, 255, 255, 128]));
        assert_eq!(r.slot, 5);

        // Uniform layout is projection, view, world; with one of each the
        // post-offset indices are proj 0, view 1, world 2.
        assert_eq!(r.matrices & 0xffff, 2);
        assert_eq!((r.matrices >> 16) & 0xff, 1);
        assert_eq!(r.matrices >> 24, 0);

        let uniforms: &[[f32; 16]] = bytemuck::cast_slice(&uniform_dst[..3 * MATRIX_SIZE]);
        let flatten = |m: &Matrix4<f32>| {
            let cols: [[f32; 4]; 4] = (*m).into();
            let mut out = [0.0f32; 16];
            for (i, c) in cols.iter().enumerate() {
                out[i * 4..i * 4 + 4].copy_from_slice(c);
            }
            out
        };
        assert_eq!(uniforms[0], flatten(&proj));
        assert_eq!(uniforms[1], flatten(&view));
        assert_eq!(uniforms[2], flatten(&world));
    }

    #[test]
    fn centering_is_folded_into_the_view() {
        let mut b = batch();
        let (w, v, p) = mats();
        b.set_centering(Matrix4::from_translation(cgmath::Vector3::new(
            5.0, 0.0, 0.0,
        )));
        let quad = white_quad([0.0, 0.0, 1.0, 1.0]);
        assert!(b.submit(&[quad], &w, &v, &p, [0.0, 0.0], 0));

        let mut quad_dst = vec![0u8; KIB];
        let mut index_dst = vec![0u8; KIB];
        let mut uniform_dst = vec![0u8; 16 * KIB];
        b.pack(&mut quad_dst, &mut index_dst, &mut uniform_dst);
        let uniforms: &[[f32; 16]] = bytemuck::cast_slice(&uniform_dst[..3 * MATRIX_SIZE]);
        let centered: [[f32; 4]; 4] =
            (v * Matrix4::from_translation(cgmath::Vector3::new(5.0, 0.0, 0.0))).into();
        // View block starts after the single projection entry.
        assert_eq!(uniforms[1][12], centered[3][0]);
    }

    #[test]
    fn reset_clears_quads_indices_and_interners() {
        let mut b = batch();
        let (w, v, p) = mats();
        assert!(b.submit(&[white_quad([0.0; 4])], &w, &v, &p, [0.0, 0.0], 0));
        b.reset();
        assert_eq!(b.quad_count(), 0);
        assert_eq!(b.index_count(), 0);
        // Interners restart at zero after reset.
        assert!(b.submit(&[white_quad([0.0; 4])], &w, &v, &p, [0.0, 0.0], 0));
        let mut quad_dst = vec![0u8; KIB];
        let mut index_dst = vec![0u8; KIB];
        let mut uniform_dst = vec![0u8; 16 * KIB];
        let out = b.pack(&mut quad_dst, &mut index_dst, &mut uniform_dst);
        assert_eq!(out.matrix_count, 3);
    }

    #[test]
    fn submission_order_is_preserved_in_the_index_stream() {
        let mut b = batch();
        let (w, v, p) = mats();
        b.submit(&[white_quad([0.0; 4])], &w, &v, &p, [0.0, 0.0], 0);
        b.submit(&[white_quad([1.0; 4])], &w, &v, &p, [0.0, 0.0], 0);
        let mut quad_dst = vec![0u8; KIB];
        let mut index_dst = vec![0u8; KIB];
        let mut uniform_dst = vec![0u8; 16 * KIB];
        let out = b.pack(&mut quad_dst, &mut index_dst, &mut uniform_dst);
        let indices: &[u16] = bytemuck::cast_slice(&index_dst[..out.index_count as usize * 2]);
        assert_eq!(indices, &[0, 1, 2, 2, 3, 0, 4, 5, 6, 6, 7, 4]);
    }
}

mod backends;

use backends::vulkan;
use cgmath::{Matrix4, SquareMatrix};
use image::RgbaImage;
use log::warn;
use std::error::Error;
use winit::window::Window;

pub use backends::vulkan::{MAX_SLOTS, MAX_TEXTURE_SIZE};

// --- Public Data Contract ---

/// Opaque, process-unique identifier for a texture owned by the renderer.
pub type TextureHandle = u32;

/// One corner of an immediate-mode primitive: position, texture
/// coordinate, and an 8-bit RGBA color.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpriteVertex {
    pub pos: [f32; 2],
    pub uv: [f32; 2],
    pub color: [u8; 4],
}

/// The batched drawable: an axis-aligned rectangle with per-corner colors.
/// Corner order everywhere is top-left, top-right, bottom-right,
/// bottom-left; `rect` and `uv_rect` are left, top, right, bottom.
#[derive(Clone, Copy, Debug)]
pub struct RenderQuad {
    pub rect: [f32; 4],
    pub uv_rect: [f32; 4],
    pub colors: [[u8; 4]; 4],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendMode {
    Alpha,
    Add,
    Multiply,
    Subtract,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CullMode {
    None,
    Back,
    Front,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZTestMode {
    Off,
    WriteOnPass,
    WriteOnFail,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SamplerFilter {
    Linear,
    Nearest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SamplerWrap {
    Clamp,
    Repeat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub filter: SamplerFilter,
    pub wrap: SamplerWrap,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: SamplerFilter::Linear,
            wrap: SamplerWrap::Clamp,
        }
    }
}

/// Channel layout of the one pixel format the renderer accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelFormatDesc {
    pub bits_per_pixel: u32,
    /// Red, green, blue, alpha masks over the packed 32-bit pixel.
    pub masks: [u32; 4],
}

/// 8-bit-per-channel RGBA, byte order R G B A.
pub const fn pixel_format_desc() -> PixelFormatDesc {
    PixelFormatDesc {
        bits_per_pixel: 32,
        masks: [0xFF00_0000, 0x00FF_0000, 0x0000_FF00, 0x0000_00FF],
    }
}

// --- Public API Facade ---

/// The renderer's public face: owns the Vulkan backend state plus the
/// immediate-mode state machine (current matrices, bound texture, sampler
/// and raster state) that draw submissions capture. Drive it with
/// `begin_frame` / draw calls / `end_frame`, strictly from one thread.
pub struct Display {
    state: vulkan::State,
    world: Matrix4<f32>,
    view: Matrix4<f32>,
    projection: Matrix4<f32>,
    texture_translate: [f32; 2],
    texture: Option<TextureHandle>,
    sampler: SamplerDesc,
    blend: BlendMode,
    cull: CullMode,
    z_test: ZTestMode,
    z_write: bool,
    alpha_test: bool,
}

impl Display {
    /// Brings up the whole backend against an existing window. A failure
    /// here is recoverable: the message describes what's missing so the
    /// caller can report it and fall back to a different renderer.
    pub fn init(window: &Window, vsync: bool, gfx_debug: bool) -> Result<Self, Box<dyn Error>> {
        let state = vulkan::init(window, vsync, gfx_debug)?;
        Ok(Self {
            state,
            world: Matrix4::identity(),
            view: Matrix4::identity(),
            projection: Matrix4::identity(),
            texture_translate: [0.0, 0.0],
            texture: None,
            sampler: SamplerDesc::default(),
            blend: BlendMode::Alpha,
            cull: CullMode::None,
            z_test: ZTestMode::Off,
            z_write: false,
            alpha_test: true,
        })
    }

    pub fn api_description(&self) -> &'static str {
        "Vulkan"
    }

    pub fn begin_frame(&mut self) -> Result<(), Box<dyn Error>> {
        vulkan::begin_frame(&mut self.state)
    }

    pub fn end_frame(&mut self) -> Result<(), Box<dyn Error>> {
        vulkan::end_frame(&mut self.state)
    }

    /// Resize notification from the windowing layer. The swapchain is
    /// recreated at the next `begin_frame`.
    pub fn resolution_changed(&mut self) {
        vulkan::resolution_changed(&mut self.state);
    }

    // --- Transform state ---

    pub fn set_world(&mut self, m: Matrix4<f32>) {
        self.world = m;
    }

    pub fn set_view(&mut self, m: Matrix4<f32>) {
        self.view = m;
    }

    pub fn set_projection(&mut self, m: Matrix4<f32>) {
        self.projection = m;
    }

    /// Compatibility transform multiplied into the view at submission time
    /// (e.g. to center a fixed-aspect playfield).
    pub fn set_centering(&mut self, m: Matrix4<f32>) {
        vulkan::set_centering(&mut self.state, m);
    }

    /// Texture-coordinate offset applied CPU-side to subsequent quads, for
    /// atlas scroll effects.
    pub fn set_texture_translate(&mut self, x: f32, y: f32) {
        self.texture_translate = [x, y];
    }

    // --- Texture binding state ---

    pub fn set_texture(&mut self, texture: Option<TextureHandle>) {
        self.texture = texture;
    }

    pub fn set_texture_filtering(&mut self, linear: bool) {
        self.sampler.filter = if linear {
            SamplerFilter::Linear
        } else {
            SamplerFilter::Nearest
        };
    }

    pub fn set_texture_wrapping(&mut self, wrap: bool) {
        self.sampler.wrap = if wrap {
            SamplerWrap::Repeat
        } else {
            SamplerWrap::Clamp
        };
    }

    // --- Raster state. Recorded for callers that replay a command log;
    // the batched pipeline renders with standard alpha blending and no
    // depth, which is all the content this backend targets ever uses. ---

    pub fn set_blend_mode(&mut self, mode: BlendMode) {
        self.blend = mode;
    }

    pub fn set_cull_mode(&mut self, mode: CullMode) {
        self.cull = mode;
    }

    pub fn set_z_test_mode(&mut self, mode: ZTestMode) {
        self.z_test = mode;
    }

    pub fn set_z_write(&mut self, enabled: bool) {
        self.z_write = enabled;
    }

    pub fn set_alpha_test(&mut self, enabled: bool) {
        self.alpha_test = enabled;
    }

    /// No depth buffer exists; kept for command-log compatibility.
    pub fn clear_z_buffer(&mut self) {}

    pub fn blend_mode(&self) -> BlendMode {
        self.blend
    }

    pub fn cull_mode(&self) -> CullMode {
        self.cull
    }

    pub fn is_z_write_enabled(&self) -> bool {
        self.z_write
    }

    pub fn is_z_test_enabled(&self) -> bool {
        self.z_test != ZTestMode::Off
    }

    pub fn is_alpha_test_enabled(&self) -> bool {
        self.alpha_test
    }

    // --- Textures ---

    pub fn create_texture(
        &mut self,
        pixels: &RgbaImage,
        sampler: SamplerDesc,
    ) -> Result<TextureHandle, Box<dyn Error>> {
        vulkan::create_texture(&mut self.state, pixels, sampler)
    }

    /// Full-surface replacement; partial updates are out of scope.
    pub fn update_texture(
        &mut self,
        handle: TextureHandle,
        pixels: &RgbaImage,
    ) -> Result<(), Box<dyn Error>> {
        vulkan::update_texture(&mut self.state, handle, pixels)
    }

    pub fn delete_texture(&mut self, handle: TextureHandle) {
        if self.texture == Some(handle) {
            self.texture = None;
        }
        vulkan::delete_texture(&mut self.state, handle);
    }

    pub fn max_texture_size(&self) -> u32 {
        vulkan::max_texture_size(&self.state)
    }

    /// The binding slot a texture currently occupies, if any. Observability
    /// hook for callers and tests; slots are frame-internal otherwise.
    pub fn texture_slot(&self, handle: TextureHandle) -> Option<u32> {
        vulkan::texture_slot(&self.state, handle)
    }

    /// Padded power-of-two dimensions of a texture. Texture coordinates
    /// address the padded image, so sprites scale their uvs by
    /// source/padded.
    pub fn texture_dimensions(&self, handle: TextureHandle) -> Option<(u32, u32)> {
        vulkan::texture_dimensions(&self.state, handle)
    }

    pub fn frame_count(&self) -> u64 {
        vulkan::frame_counter(&self.state)
    }

    // --- Draw entry points ---

    /// The primary batched path: quads drawn with the current transform,
    /// texture, and sampler state.
    pub fn push_quads(&mut self, quads: &[RenderQuad]) {
        vulkan::submit_quads(
            &mut self.state,
            quads,
            &self.world,
            &self.view,
            &self.projection,
            self.texture_translate,
            self.texture,
            self.sampler,
        );
    }

    /// Immediate-mode quads: each consecutive group of four vertices is one
    /// quad, corners 0 and 2 forming the diagonal.
    pub fn draw_quads(&mut self, vertices: &[SpriteVertex]) {
        let quads = quads_from_vertices(vertices);
        self.push_quads(&quads);
    }

    /// Quad strip: pairs of vertices share edges; vertices 2i..2i+3 form
    /// quad i.
    pub fn draw_quad_strip(&mut self, vertices: &[SpriteVertex]) {
        let quads = quads_from_strip(vertices);
        self.push_quads(&quads);
    }

    pub fn draw_fan(&mut self, _vertices: &[SpriteVertex]) {
        panic!("triangle fans are not implemented by the batched renderer");
    }

    pub fn draw_strip(&mut self, _vertices: &[SpriteVertex]) {
        panic!("triangle strips are not implemented by the batched renderer");
    }

    pub fn draw_triangles(&mut self, _vertices: &[SpriteVertex]) {
        panic!("raw triangle lists are not implemented by the batched renderer");
    }

    /// Swapchain readback is not wired up; callers treat `None` as
    /// "screenshots unavailable".
    pub fn create_screenshot(&mut self) -> Option<RgbaImage> {
        warn!("screenshot requested but readback is unsupported");
        None
    }

    pub fn cleanup(&mut self) {
        vulkan::cleanup(&mut self.state);
    }
}

/// Groups of four vertices into axis-aligned quads. Trailing vertices that
/// do not fill a group are dropped, matching the legacy API's tolerance.
fn quads_from_vertices(vertices: &[SpriteVertex]) -> Vec<RenderQuad> {
    vertices
        .chunks_exact(4)
        .map(|v| RenderQuad {
            rect: [v[0].pos[0], v[0].pos[1], v[2].pos[0], v[2].pos[1]],
            uv_rect: [v[0].uv[0], v[0].uv[1], v[2].uv[0], v[2].uv[1]],
            colors: [v[0].color, v[1].color, v[2].color, v[3].color],
        })
        .collect()
}

/// Quad-strip vertices come in top/bottom pairs; each new pair closes a
/// quad against the previous one.
fn quads_from_strip(vertices: &[SpriteVertex]) -> Vec<RenderQuad> {
    if vertices.len() < 4 {
        return Vec::new();
    }
    (0..=(vertices.len() - 4))
        .step_by(2)
        .map(|i| {
            let (tl, bl, tr, br) = (
                &vertices[i],
                &vertices[i + 1],
                &vertices[i + 2],
                &vertices[i + 3],
            );
            RenderQuad {
                rect: [tl.pos[0], tl.pos[1], br.pos[0], br.pos[1]],
                uv_rect: [tl.uv[0], tl.uv[1], br.uv[0], br.uv[1]],
                colors: [tl.color, tr.color, br.color, bl.color],
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_is_rgba8_with_byte_order_masks() {
        let desc = pixel_format_desc();
        assert_eq!(desc.bits_per_pixel, 32);
        assert_eq!(
            desc.masks,
            [0xFF00_0000, 0x00FF_0000, 0x0000_FF00, 0x0000_00FF]
        );
        // Masks cover the pixel exactly once.
        assert_eq!(desc.masks.iter().fold(0u32, |acc, m| acc | m), u32::MAX);
        assert_eq!(desc.masks.iter().map(|m| m.count_ones()).sum::<u32>(), 32);
    }

    fn vertex(x: f32, y: f32, u: f32, v: f32, c: u8) -> SpriteVertex {
        SpriteVertex {
            pos: [x, y],
            uv: [u, v],
            color: [c; 4],
        }
    }

    #[test]
    fn four_vertices_make_one_quad() {
        let quads = quads_from_vertices(&[
            vertex(0.0, 0.0, 0.0, 0.0, 1),
            vertex(8.0, 0.0, 1.0, 0.0, 2),
            vertex(8.0, 8.0, 1.0, 1.0, 3),
            vertex(0.0, 8.0, 0.0, 1.0, 4),
        ]);
        assert_eq!(quads.len(), 1);
        assert_eq!(quads[0].rect, [0.0, 0.0, 8.0, 8.0]);
        assert_eq!(quads[0].uv_rect, [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(quads[0].colors, [[1; 4], [2; 4], [3; 4], [4; 4]]);
    }

    #[test]
    fn trailing_partial_group_is_dropped() {
        let quads = quads_from_vertices(&[
            vertex(0.0, 0.0, 0.0, 0.0, 1),
            vertex(8.0, 0.0, 1.0, 0.0, 2),
            vertex(8.0, 8.0, 1.0, 1.0, 3),
            vertex(0.0, 8.0, 0.0, 1.0, 4),
            vertex(9.0, 9.0, 0.0, 0.0, 5),
        ]);
        assert_eq!(quads.len(), 1);
    }

    #[test]
    fn strip_shares_vertex_pairs_between_quads() {
        // Three pairs -> two quads sharing the middle pair.
        let quads = quads_from_strip(&[
            vertex(0.0, 0.0, 0.0, 0.0, 1),
            vertex(0.0, 8.0, 0.0, 1.0, 2),
            vertex(4.0, 0.0, 0.5, 0.0, 3),
            vertex(4.0, 8.0, 0.5, 1.0, 4),
            vertex(8.0, 0.0, 1.0, 0.0, 5),
            vertex(8.0, 8.0, 1.0, 1.0, 6),
        ]);
        assert_eq!(quads.len(), 2);
        assert_eq!(quads[0].rect, [0.0, 0.0, 4.0, 8.0]);
        assert_eq!(quads[1].rect, [4.0, 0.0, 8.0, 8.0]);
    }

    #[test]
    fn strip_shorter_than_one_quad_is_empty() {
        assert!(quads_from_strip(&[vertex(0.0, 0.0, 0.0, 0.0, 1); 3]).is_empty());
    }
}

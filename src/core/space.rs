use cgmath::Matrix4;

/// Orthographic projection for a window of the given pixel size, mapping
/// (0,0) at the top-left to Vulkan clip space. Vulkan's framebuffer y axis
/// points down, so no flip is needed: (0,0) -> (-1,-1), (w,h) -> (1,1).
/// Depth is collapsed to z = 0 (the batch draws flat quads).
pub fn ortho_for_window(width: u32, height: u32) -> Matrix4<f32> {
    let w = width.max(1) as f32;
    let h = height.max(1) as f32;
    #[rustfmt::skip]
    let m = Matrix4::new(
        2.0 / w, 0.0,     0.0, 0.0,
        0.0,     2.0 / h, 0.0, 0.0,
        0.0,     0.0,     0.0, 0.0,
        -1.0,    -1.0,    0.0, 1.0,
    );
    m
}

/// Translation used to re-center rendering when the logical scene size does
/// not match the window, e.g. pillarboxing a 4:3 playfield on a 16:9
/// window. Folded into the view matrix at submission time.
pub fn centering_translation(offset_x: f32, offset_y: f32) -> Matrix4<f32> {
    Matrix4::from_translation(cgmath::Vector3::new(offset_x, offset_y, 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::Vector4;

    #[test]
    fn ortho_maps_corners_to_clip_space() {
        let m = ortho_for_window(640, 480);
        let tl = m * Vector4::new(0.0, 0.0, 0.0, 1.0);
        let br = m * Vector4::new(640.0, 480.0, 0.0, 1.0);
        assert_eq!((tl.x, tl.y), (-1.0, -1.0));
        assert_eq!((br.x, br.y), (1.0, 1.0));
    }

    #[test]
    fn ortho_never_divides_by_zero() {
        let m = ortho_for_window(0, 0);
        let v = m * Vector4::new(1.0, 1.0, 0.0, 1.0);
        assert!(v.x.is_finite() && v.y.is_finite());
    }
}

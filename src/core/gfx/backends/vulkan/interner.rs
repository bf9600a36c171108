use cgmath::Matrix4;

/// Hard ceiling on interned matrices per category per frame. Legitimate
/// content stays orders of magnitude below this; hitting it means a runaway
/// submission loop, so it is an assertion rather than a recoverable error.
pub const MAX_INTERNED: usize = 65535;

/// Per-frame deduplication of 4x4 transforms. Returns a stable small index
/// for each distinct bit pattern; matrices that differ only past float
/// equality (e.g. -0.0 vs 0.0) are distinct on purpose, since the GPU
/// consumes the exact bits.
pub struct MatrixInterner {
    entries: Vec<[f32; 16]>,
}

impl MatrixInterner {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Scans existing entries from most-recently-added backward; repeated
    /// transforms (the same sprite's world matrix across a batch) are the
    /// common case and match on the first probe.
    pub fn intern(&mut self, matrix: &Matrix4<f32>) -> u16 {
        let flat = flatten(matrix);
        for (i, entry) in self.entries.iter().enumerate().rev() {
            if bits_equal(entry, &flat) {
                return i as u16;
            }
        }
        assert!(
            self.entries.len() < MAX_INTERNED,
            "matrix interner exhausted ({MAX_INTERNED} entries in one frame)"
        );
        self.entries.push(flat);
        (self.entries.len() - 1) as u16
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw column-major floats, in interning order. Valid until `reset`.
    pub fn entries(&self) -> &[[f32; 16]] {
        &self.entries
    }

    /// Called exactly once per frame, after the frame's GPU copy has been
    /// issued. Indices handed out earlier are invalid from here on.
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

fn flatten(m: &Matrix4<f32>) -> [f32; 16] {
    let cols: [[f32; 4]; 4] = (*m).into();
    let mut out = [0.0f32; 16];
    for (i, col) in cols.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(col);
    }
    out
}

fn bits_equal(a: &[f32; 16], b: &[f32; 16]) -> bool {
    a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::SquareMatrix;

    #[test]
    fn interning_is_idempotent() {
        let mut interner = MatrixInterner::new();
        let m = Matrix4::from_scale(2.0);
        assert_eq!(interner.intern(&m), 0);
        assert_eq!(interner.intern(&m), 0);
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn distinct_matrices_get_distinct_indices() {
        let mut interner = MatrixInterner::new();
        let a = interner.intern(&Matrix4::identity());
        let b = interner.intern(&Matrix4::from_scale(3.0));
        assert_ne!(a, b);
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn reset_restarts_numbering_at_zero() {
        let mut interner = MatrixInterner::new();
        interner.intern(&Matrix4::from_scale(2.0));
        interner.intern(&Matrix4::from_scale(3.0));
        interner.reset();
        assert!(interner.is_empty());
        assert_eq!(interner.intern(&Matrix4::from_scale(2.0)), 0);
    }

    #[test]
    fn comparison_is_bitwise_not_float_equality() {
        let mut interner = MatrixInterner::new();
        let pos = Matrix4::from_translation(cgmath::Vector3::new(0.0f32, 0.0, 0.0));
        let neg = Matrix4::from_translation(cgmath::Vector3::new(-0.0f32, 0.0, 0.0));
        let a = interner.intern(&pos);
        let b = interner.intern(&neg);
        assert_ne!(a, b);
    }

    #[test]
    fn most_recent_entry_wins_the_scan() {
        let mut interner = MatrixInterner::new();
        interner.intern(&Matrix4::identity());
        let recent = interner.intern(&Matrix4::from_scale(5.0));
        // A repeat of the most recent transform must resolve without
        // touching older entries.
        assert_eq!(interner.intern(&Matrix4::from_scale(5.0)), recent);
    }
}

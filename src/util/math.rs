//! Instance transform layout.

use glam::Mat4;

/// Row-major 3x4 matrix, the transform layout of a top-level instance.
pub type TransformRows = [[f32; 4]; 3];

/// Identity instance transform.
pub const IDENTITY_ROWS: TransformRows = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

/// Expand instance rows to a full affine matrix.
#[inline]
pub fn rows_to_mat4(rows: &TransformRows) -> Mat4 {
    Mat4::from_cols_array_2d(&[rows[0], rows[1], rows[2], [0.0, 0.0, 0.0, 1.0]]).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_identity_rows() {
        assert_eq!(rows_to_mat4(&IDENTITY_ROWS), Mat4::IDENTITY);
    }

    #[test]
    fn test_translation_in_last_column() {
        let rows = [[1.0, 0.0, 0.0, 1.0], [0.0, 1.0, 0.0, 2.0], [0.0, 0.0, 1.0, 3.0]];
        let m = rows_to_mat4(&rows);
        assert_eq!(m, Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(m.transform_point3(Vec3::ZERO), Vec3::new(1.0, 2.0, 3.0));
    }
}

//! Stereo projection math shared by the controller and diagnostics.
//!
//! All formulas follow the nvidia-equivalent stereo correction: a vertex at
//! view-space depth `w` is shifted in clip space by
//! `separation * (w - convergence)` per eye, so objects at the convergence
//! distance land at screen depth and nearer objects pop out of the screen.

/// Row-major 4x4 matrix in the row-vector convention used by the injection
/// host (v' = v * M).
pub type Mat4 = [[f32; 4]; 4];

/// Clip-space x shift applied to one eye for a vertex at depth `w`.
pub fn adjustment(w: f32, separation: f32, convergence: f32) -> f32 {
    separation * (w - convergence)
}

/// Screen-space parallax after the perspective divide.
///
/// Negative for objects in front of the convergence plane (crossed
/// disparity, "pop out"), positive behind it.
pub fn screen_parallax(w: f32, separation: f32, convergence: f32) -> f32 {
    if w == 0.0 {
        return 0.0;
    }
    separation * (1.0 - convergence / w)
}

/// Largest convergence whose crossed parallax at depth `w` stays within
/// `budget` (both in normalized screen units).
///
/// Derivation: the crossed-parallax magnitude at depth w is
/// `separation * (convergence / w - 1)` once convergence exceeds w, so the
/// comfort bound solves `separation * (c / w - 1) == budget` for c.
pub fn max_comfortable_convergence(w: f32, separation: f32, budget: f32) -> f32 {
    w * (1.0 + budget / separation)
}

/// Build a standard left-handed projection matrix.
pub fn projection(near: f32, far: f32, fov_horiz_deg: f32, fov_vert_deg: f32) -> Mat4 {
    let w = 1.0 / (fov_horiz_deg.to_radians() / 2.0).tan();
    let h = 1.0 / (fov_vert_deg.to_radians() / 2.0).tan();
    let q = far / (far - near);

    [
        [w, 0.0, 0.0, 0.0],
        [0.0, h, 0.0, 0.0],
        [0.0, 0.0, q, 1.0],
        [0.0, 0.0, -q * near, 0.0],
    ]
}

/// Recover the near and far clipping planes from a projection matrix.
///
/// Returns `None` for matrices without the standard projection structure
/// (q in m22, -q*near in m32).
pub fn find_near_far(m: &Mat4) -> Option<(f32, f32)> {
    let q = m[2][2];
    if !q.is_finite() || q == 0.0 || (q - 1.0).abs() < f32::EPSILON {
        return None;
    }
    let near = -m[3][2] / q;
    if !near.is_finite() || near <= 0.0 {
        return None;
    }
    let far = q * near / (q - 1.0);
    Some((near, far))
}

/// Horizontal field of view of a projection matrix, in degrees.
pub fn fov_w(m: &Mat4) -> f32 {
    (2.0 * (1.0 / m[0][0]).atan()).to_degrees()
}

/// Vertical field of view of a projection matrix, in degrees.
pub fn fov_h(m: &Mat4) -> f32 {
    (2.0 * (1.0 / m[1][1]).atan()).to_degrees()
}

use crate::types::{Landmark, PoseResult};

/// BlazePose body connections (33-point schema).
pub const CONNECTIONS: &[(usize, usize)] = &[
    // face
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 7),
    (0, 4),
    (4, 5),
    (5, 6),
    (6, 8),
    (9, 10),
    // torso
    (11, 12),
    (11, 23),
    (12, 24),
    (23, 24),
    // left arm and hand
    (11, 13),
    (13, 15),
    (15, 17),
    (15, 19),
    (15, 21),
    (17, 19),
    // right arm and hand
    (12, 14),
    (14, 16),
    (16, 18),
    (16, 20),
    (16, 22),
    (18, 20),
    // left leg
    (23, 25),
    (25, 27),
    (27, 29),
    (27, 31),
    (29, 31),
    // right leg
    (24, 26),
    (26, 28),
    (28, 30),
    (28, 32),
    (30, 32),
];

pub const SKELETON_LINE_THICKNESS: i32 = 4;

/// Depth range mapped onto point radii; nearer points (smaller z) draw larger.
const NEAR_Z: f32 = -0.15;
const FAR_Z: f32 = 0.1;
const NEAR_RADIUS: f32 = 10.0;
const FAR_RADIUS: f32 = 1.0;

const LINE_COLOR: [u8; 4] = [255, 255, 255, 255];
const POINT_COLOR: [u8; 4] = [170, 255, 0, 255];

/// Point radius in pixels for a landmark depth.
pub fn point_radius(z: f32) -> i32 {
    let t = ((z - NEAR_Z) / (FAR_Z - NEAR_Z)).clamp(0.0, 1.0);
    let radius = NEAR_RADIUS + t * (FAR_RADIUS - NEAR_RADIUS);
    radius.round() as i32
}

fn to_pixels(landmark: &Landmark, width: u32, height: u32) -> (f32, f32) {
    (landmark.x * width as f32, landmark.y * height as f32)
}

/// Draws the pose connections and landmark points onto an RGBA buffer of
/// `width`×`height`. Landmarks are frame-normalized.
pub fn draw_pose(buffer: &mut [u8], width: u32, height: u32, pose: &PoseResult) {
    let landmarks = pose.landmarks();
    if landmarks.is_empty() {
        return;
    }

    for &(a, b) in CONNECTIONS {
        if let (Some(la), Some(lb)) = (landmarks.get(a), landmarks.get(b)) {
            draw_line(
                buffer,
                width,
                height,
                &to_pixels(la, width, height),
                &to_pixels(lb, width, height),
                LINE_COLOR,
                SKELETON_LINE_THICKNESS,
            );
        }
    }

    for landmark in landmarks {
        if !(landmark.x.is_finite() && landmark.y.is_finite()) {
            continue;
        }
        let (x, y) = to_pixels(landmark, width, height);
        draw_circle(
            buffer,
            width,
            height,
            (x as i32, y as i32),
            point_radius(landmark.z),
            POINT_COLOR,
        );
    }
}

fn draw_line(
    buffer: &mut [u8],
    width: u32,
    height: u32,
    p0: &(f32, f32),
    p1: &(f32, f32),
    color: [u8; 4],
    thickness: i32,
) {
    if !(p0.0.is_finite() && p0.1.is_finite() && p1.0.is_finite() && p1.1.is_finite()) {
        return;
    }
    // Keep far-off-frame segments from walking millions of pixels.
    let limit = (width.max(height) as f32) * 4.0;
    let clamp = |v: f32| v.clamp(-limit, limit) as i32;

    let (mut x0, mut y0) = (clamp(p0.0), clamp(p0.1));
    let (x1, y1) = (clamp(p1.0), clamp(p1.1));
    let dx = (x1 - x0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let dy = -(y1 - y0).abs();
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let radius = (thickness.max(1) - 1) / 2;

    loop {
        for ox in -radius..=radius {
            for oy in -radius..=radius {
                if ox.abs() + oy.abs() <= radius {
                    put_pixel_safe(buffer, width, height, x0 + ox, y0 + oy, color);
                }
            }
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

fn draw_circle(
    buffer: &mut [u8],
    width: u32,
    height: u32,
    center: (i32, i32),
    radius: i32,
    color: [u8; 4],
) {
    let (cx, cy) = center;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                put_pixel_safe(buffer, width, height, cx + dx, cy + dy, color);
            }
        }
    }
}

fn put_pixel_safe(buffer: &mut [u8], width: u32, height: u32, x: i32, y: i32, color: [u8; 4]) {
    if x < 0 || y < 0 {
        return;
    }
    let (ux, uy) = (x as u32, y as u32);
    if ux >= width || uy >= height {
        return;
    }
    let idx = (uy as usize * width as usize + ux as usize) * 4;
    if idx + 3 < buffer.len() {
        buffer[idx..idx + 4].copy_from_slice(&color);
    }
}

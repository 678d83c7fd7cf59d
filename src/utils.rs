use egui::{Color32, Painter, Pos2, Stroke};

pub struct AppUtils;

impl AppUtils {
    // 计算点到线段的最短距离
    pub fn point_to_line_segment_distance(p: Pos2, a: Pos2, b: Pos2) -> f32 {
        let ab = Pos2::new(b.x - a.x, b.y - a.y);
        let ap = Pos2::new(p.x - a.x, p.y - a.y);
        let ab_sq = ab.x * ab.x + ab.y * ab.y;

        if ab_sq < 0.0001 {
            // a 和 b 几乎重合
            return (p.x - a.x).hypot(p.y - a.y);
        }

        let t = ((ap.x * ab.x + ap.y * ab.y) / ab_sq).clamp(0.0, 1.0);
        let closest = Pos2::new(a.x + t * ab.x, a.y + t * ab.y);
        (p.x - closest.x).hypot(p.y - closest.y)
    }

    // 线段（含圆头）覆盖的像素范围，已裁剪到画布内
    pub fn segment_pixel_bounds(
        a: Pos2,
        b: Pos2,
        half_width: f32,
        width: u32,
        height: u32,
    ) -> Option<(u32, u32, u32, u32)> {
        if width == 0 || height == 0 {
            return None;
        }
        let min_x = (a.x.min(b.x) - half_width).floor();
        let min_y = (a.y.min(b.y) - half_width).floor();
        let max_x = (a.x.max(b.x) + half_width).ceil();
        let max_y = (a.y.max(b.y) + half_width).ceil();

        if max_x < 0.0 || max_y < 0.0 || min_x >= width as f32 || min_y >= height as f32 {
            return None;
        }

        let clamp = |v: f32, limit: u32| v.clamp(0.0, (limit - 1) as f32) as u32;
        Some((
            clamp(min_x, width),
            clamp(min_y, height),
            clamp(max_x, width),
            clamp(max_y, height),
        ))
    }

    pub fn draw_size_preview(painter: &Painter, pos: Pos2, size: f32) {
        const SIZE_PREVIEW_BORDER_WIDTH: f32 = 2.0;
        let radius = size / 2.0;
        painter.circle_filled(pos, radius, Color32::from_black_alpha(120));
        painter.circle_stroke(
            pos,
            radius,
            Stroke::new(SIZE_PREVIEW_BORDER_WIDTH, Color32::WHITE),
        );
    }

    // 色板颜色的名字（用于悬停提示）
    pub fn swatch_name(color: Color32) -> &'static str {
        match (color.r(), color.g(), color.b()) {
            (255, 255, 255) => "white",
            (0, 0, 0) => "black",
            (238, 51, 51) => "red",
            (230, 73, 128) => "pink",
            (190, 75, 219) => "purple",
            (137, 50, 0) => "brown",
            (34, 139, 230) => "blue",
            (51, 51, 238) => "indigo",
            (64, 192, 87) => "green",
            (0, 170, 0) => "dark green",
            (250, 176, 5) => "yellow",
            (253, 126, 20) => "orange",
            _ => "custom",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_to_segment_interior_and_ends() {
        let a = Pos2::new(0.0, 0.0);
        let b = Pos2::new(10.0, 0.0);
        assert!((AppUtils::point_to_line_segment_distance(Pos2::new(5.0, 3.0), a, b) - 3.0).abs() < 1e-5);
        assert!((AppUtils::point_to_line_segment_distance(Pos2::new(13.0, 4.0), a, b) - 5.0).abs() < 1e-5);
        // 退化线段
        assert!((AppUtils::point_to_line_segment_distance(Pos2::new(3.0, 4.0), a, a) - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_segment_bounds_are_clipped() {
        let bounds = AppUtils::segment_pixel_bounds(
            Pos2::new(-5.0, 2.0),
            Pos2::new(4.0, 2.0),
            2.5,
            8,
            8,
        );
        assert_eq!(bounds, Some((0, 0, 7, 5)));

        let outside =
            AppUtils::segment_pixel_bounds(Pos2::new(50.0, 50.0), Pos2::new(60.0, 60.0), 1.0, 8, 8);
        assert_eq!(outside, None);
    }
}

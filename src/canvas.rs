use std::io::Cursor;

use base64::Engine as _;
use egui::{Color32, Pos2, Vec2};
use image::{ExtendedColorType, ImageEncoder as _, Rgba, RgbaImage};

use crate::utils::AppUtils;

// 黑板底色，橡皮擦也用它
pub const BACKGROUND_COLOR: Color32 = Color32::BLACK;

#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error("canvas is not mounted yet")]
    NotMounted,

    #[error("failed to encode canvas as png: {0}")]
    Encode(#[from] image::ImageError),
}

// 画布坐标（逻辑点）
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PointerEvent {
    Down(Pos2),
    Move(Pos2),
    Up,
    Leave,
    Cancel,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Brush {
    pub color: Color32,
    pub width: f32,
}

// 物理像素
pub struct Raster {
    image: RgbaImage,
}

impl Raster {
    pub fn new(width: u32, height: u32, fill: Color32) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, to_rgba(fill)),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn fill(&mut self, color: Color32) {
        let rgba = to_rgba(color);
        for pixel in self.image.pixels_mut() {
            *pixel = rgba;
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Color32> {
        if x >= self.width() || y >= self.height() {
            return None;
        }
        let [r, g, b, a] = self.image.get_pixel(x, y).0;
        Some(Color32::from_rgba_unmultiplied(r, g, b, a))
    }

    /// Paint a round-capped segment from `a` to `b`. Returns the pixel region touched.
    pub fn stroke_segment(
        &mut self,
        a: Pos2,
        b: Pos2,
        color: Color32,
        width: f32,
    ) -> Option<PixelRegion> {
        let half_width = (width / 2.0).max(0.5);
        let (x0, y0, x1, y1) =
            AppUtils::segment_pixel_bounds(a, b, half_width, self.width(), self.height())?;

        let rgba = to_rgba(color);
        for y in y0..=y1 {
            for x in x0..=x1 {
                let center = Pos2::new(x as f32 + 0.5, y as f32 + 0.5);
                if AppUtils::point_to_line_segment_distance(center, a, b) <= half_width {
                    self.image.put_pixel(x, y, rgba);
                }
            }
        }
        Some(PixelRegion { x0, y0, x1, y1 })
    }

    // 旧内容复制到左上角
    fn resized(&self, width: u32, height: u32, fill: Color32) -> Self {
        let mut next = Self::new(width, height, fill);
        for y in 0..self.height().min(height) {
            for x in 0..self.width().min(width) {
                next.image.put_pixel(x, y, *self.image.get_pixel(x, y));
            }
        }
        next
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut bytes = Vec::new();
        image::codecs::png::PngEncoder::new(Cursor::new(&mut bytes)).write_image(
            self.image.as_raw(),
            self.width(),
            self.height(),
            ExtendedColorType::Rgba8,
        )?;
        Ok(bytes)
    }

    pub fn to_color_image(&self) -> egui::ColorImage {
        egui::ColorImage::from_rgba_unmultiplied(
            [self.width() as usize, self.height() as usize],
            self.image.as_raw(),
        )
    }

    pub fn region_image(&self, region: PixelRegion) -> egui::ColorImage {
        let [width, height] = region.size();
        let view = image::imageops::crop_imm(
            &self.image,
            region.x0,
            region.y0,
            width as u32,
            height as u32,
        )
        .to_image();
        egui::ColorImage::from_rgba_unmultiplied([width, height], view.as_raw())
    }
}

/// Inclusive pixel rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRegion {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelRegion {
    pub fn union(self, other: Self) -> Self {
        Self {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    pub fn origin(&self) -> [usize; 2] {
        [self.x0 as usize, self.y0 as usize]
    }

    pub fn size(&self) -> [usize; 2] {
        [
            (self.x1 - self.x0 + 1) as usize,
            (self.y1 - self.y0 + 1) as usize,
        ]
    }
}

// 纹理更新：整张或局部
pub enum CanvasUpload {
    Full(egui::ColorImage),
    Partial {
        origin: [usize; 2],
        image: egui::ColorImage,
    },
}

// 一帧内与画布有关的指针输入
#[derive(Clone, Copy, Debug, Default)]
pub struct PointerFrame {
    pub pressed: bool,     // 主键在画布上按下
    pub released: bool,    // 主键松开
    pub moving: bool,      // 指针移动
    pub pos: Option<Pos2>, // 画布坐标
    pub over_canvas: bool, // 指针在画布上，且没有被工具栏等遮住
    pub gone: bool,        // 指针离开窗口
    pub cancelled: bool,   // 触摸被取消
}

impl PointerFrame {
    pub fn events(&self, is_drawing: bool) -> Vec<PointerEvent> {
        if self.pressed {
            return match self.pos {
                Some(pos) if self.over_canvas => vec![PointerEvent::Down(pos)],
                _ => Vec::new(),
            };
        }
        if !is_drawing {
            return Vec::new();
        }
        if self.cancelled {
            return vec![PointerEvent::Cancel];
        }

        match self.pos {
            Some(pos) if self.over_canvas => {
                let mut events = Vec::new();
                if self.moving {
                    events.push(PointerEvent::Move(pos));
                }
                if self.released {
                    events.push(PointerEvent::Up);
                }
                events
            }
            Some(_) => vec![PointerEvent::Leave],
            None if self.gone => vec![PointerEvent::Leave],
            None if self.released => vec![PointerEvent::Up],
            None => Vec::new(),
        }
    }
}

fn to_rgba(color: Color32) -> Rgba<u8> {
    Rgba(color.to_srgba_unmultiplied())
}

pub struct CanvasSurface {
    raster: Option<Raster>,
    scale: f32,                      // 设备像素比
    is_drawing: bool,                // 是否正在绘制
    last_point: Option<Pos2>,        // 当前路径的末端（物理像素）
    full_upload: bool,               // 需要整张上传
    dirty_region: Option<PixelRegion>, // 需要局部上传的区域
}

impl Default for CanvasSurface {
    fn default() -> Self {
        Self {
            raster: None,
            scale: 1.0,
            is_drawing: false,
            last_point: None,
            full_upload: false,
            dirty_region: None,
        }
    }
}

impl CanvasSurface {
    /// Called every frame. Returns `true` if the raster was (re)allocated.
    pub fn mount(&mut self, size: Vec2, pixels_per_point: f32) -> bool {
        let scale = if pixels_per_point > 0.0 {
            pixels_per_point
        } else {
            1.0
        };
        let width = (size.x * scale).round().max(1.0) as u32;
        let height = (size.y * scale).round().max(1.0) as u32;

        let raster = match self.raster.take() {
            Some(raster) if raster.width() == width && raster.height() == height => {
                self.raster = Some(raster);
                self.scale = scale;
                return false;
            }
            Some(raster) => {
                log::debug!(
                    "canvas resized from {}x{} to {width}x{height}",
                    raster.width(),
                    raster.height()
                );
                raster.resized(width, height, BACKGROUND_COLOR)
            }
            None => {
                log::info!("canvas mounted at {width}x{height} (scale {scale})");
                Raster::new(width, height, BACKGROUND_COLOR)
            }
        };

        self.raster = Some(raster);
        self.scale = scale;
        self.request_full_upload();
        true
    }

    pub fn is_mounted(&self) -> bool {
        self.raster.is_some()
    }

    pub fn is_drawing(&self) -> bool {
        self.is_drawing
    }

    pub fn raster(&self) -> Option<&Raster> {
        self.raster.as_ref()
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    // 返回是否改动了像素
    pub fn handle_pointer(&mut self, event: PointerEvent, brush: Brush) -> bool {
        match event {
            PointerEvent::Down(pos) => {
                if self.raster.is_none() {
                    return false;
                }
                self.last_point = Some(self.to_physical(pos));
                self.is_drawing = true;
                false
            }
            PointerEvent::Move(pos) => {
                if !self.is_drawing {
                    return false;
                }
                let to = self.to_physical(pos);
                let from = self.last_point.unwrap_or(to);
                let width = brush.width * self.scale;
                let Some(raster) = self.raster.as_mut() else {
                    return false;
                };
                let touched = raster.stroke_segment(from, to, brush.color, width);
                self.last_point = Some(to);
                if let Some(region) = touched {
                    self.dirty_region = Some(match self.dirty_region {
                        Some(dirty) => dirty.union(region),
                        None => region,
                    });
                }
                touched.is_some()
            }
            PointerEvent::Up | PointerEvent::Leave | PointerEvent::Cancel => {
                self.is_drawing = false;
                self.last_point = None;
                false
            }
        }
    }

    pub fn clear(&mut self) {
        if let Some(raster) = self.raster.as_mut() {
            raster.fill(BACKGROUND_COLOR);
            self.request_full_upload();
        }
        self.is_drawing = false;
        self.last_point = None;
    }

    pub fn snapshot_data_url(&self) -> Result<String, SnapshotError> {
        let raster = self.raster.as_ref().ok_or(SnapshotError::NotMounted)?;
        let png = raster.encode_png()?;
        Ok(format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(png)
        ))
    }

    pub fn request_full_upload(&mut self) {
        self.full_upload = true;
        self.dirty_region = None;
    }

    /// What changed since the last call: the whole raster after mount, resize or clear,
    /// otherwise only the region strokes touched.
    pub fn take_upload(&mut self) -> Option<CanvasUpload> {
        let raster = self.raster.as_ref()?;
        if std::mem::take(&mut self.full_upload) {
            self.dirty_region = None;
            return Some(CanvasUpload::Full(raster.to_color_image()));
        }
        let region = self.dirty_region.take()?;
        Some(CanvasUpload::Partial {
            origin: region.origin(),
            image: raster.region_image(region),
        })
    }

    fn to_physical(&self, pos: Pos2) -> Pos2 {
        Pos2::new(pos.x * self.scale, pos.y * self.scale)
    }
}

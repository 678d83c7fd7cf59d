use egui::{Color32, CursorIcon, FontId, Pos2, Rect, Sense, Stroke, Vec2};

use crate::canvas::{CanvasUpload, PointerFrame};
use crate::config::Config;
use crate::overlay::overlay_id;
use crate::recognition::{Dispatcher, RecognitionClient};
use crate::state::{ApplyOutcome, ERASER_SIZE_RANGE, SWATCHES, ScreenState};
use crate::typeset::{TypesetPass, TypesetService, TypesetStyle};
use crate::utils::AppUtils;

// 结果文字四周的留白
const OVERLAY_PADDING: f32 = 8.0;
const SWATCH_SIZE: f32 = 16.0;

pub struct MathboardApp {
    state: ScreenState,
    dispatcher: Option<Dispatcher>,            // 识别请求
    typesetter: TypesetService,                // 排版引擎
    pass: TypesetPass,                         // 排版结果
    canvas_texture: Option<egui::TextureHandle>, // 画布纹理
    active_drag: Option<(String, Vec2)>,       // 正在拖动的结果及累计位移
    style: TypesetStyle,
}

impl MathboardApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        config: &Config,
        typesetter: TypesetService,
    ) -> Self {
        cc.egui_ctx.set_visuals(egui::Visuals::dark());

        let dispatcher = match Dispatcher::new(RecognitionClient::new(config)) {
            Ok(dispatcher) => Some(dispatcher),
            Err(err) => {
                log::error!("recognition disabled: {err}");
                None
            }
        };

        Self {
            state: ScreenState::default(),
            dispatcher,
            typesetter,
            pass: TypesetPass::default(),
            canvas_texture: None,
            active_drag: None,
            style: TypesetStyle::default(),
        }
    }

    fn drain_completions(&mut self) {
        let Some(dispatcher) = self.dispatcher.as_mut() else {
            return;
        };
        for completion in dispatcher.drain() {
            if let ApplyOutcome::Applied(count) = self.state.apply_completion(completion) {
                log::info!("{count} result(s) added");
            }
        }
    }

    fn submit(&mut self, ctx: &egui::Context) {
        let Some(dispatcher) = self.dispatcher.as_mut() else {
            log::error!("error sending data: recognition client unavailable");
            return;
        };
        match self.state.begin_submit() {
            Ok((ticket, request)) => dispatcher.submit(ticket, request, ctx),
            Err(err) => log::error!("error sending data: {err}"),
        }
    }

    fn in_flight(&self) -> usize {
        self.dispatcher.as_ref().map_or(0, Dispatcher::in_flight)
    }
}

impl eframe::App for MathboardApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if self.typesetter.poll(ctx) {
            // 引擎就绪前跳过的排版在这里补上
            self.pass.invalidate();
        }
        self.drain_completions();

        // 上一帧请求的重置在这里执行
        self.state.process_reset();

        // Typesetting runs one frame after the list changed
        self.pass
            .tick(self.state.overlays.items(), &self.typesetter, &self.style);
        if self.pass.notify_changed(
            self.state.overlays.revision(),
            self.state.overlays.is_empty(),
        ) {
            ctx.request_repaint();
        }

        // Toolbar window
        let content_rect = ctx.available_rect();
        let margin = 8.0;

        egui::Window::new("Toolbar")
            .title_bar(false)
            .resizable(false)
            .pivot(egui::Align2::CENTER_TOP)
            .default_pos([content_rect.center().x, content_rect.min.y + margin])
            .show(ctx, |ui| {
                self.render_toolbar(ui);
            });

        // Main canvas area
        egui::CentralPanel::default()
            .frame(egui::Frame::NONE)
            .show(ctx, |ui| {
                self.render_canvas(ui);
            });

        // Eraser toggle
        egui::Area::new(egui::Id::new("eraser_toggle"))
            .anchor(egui::Align2::RIGHT_BOTTOM, [-20.0, -20.0])
            .show(ctx, |ui| {
                let (label, fill) = if self.state.is_erasing {
                    ("Eraser: on", Color32::from_rgb(185, 28, 28))
                } else {
                    ("Eraser: off", Color32::from_gray(60))
                };
                if ui
                    .add(egui::Button::new(label).fill(fill).corner_radius(12.0))
                    .clicked()
                {
                    self.state.toggle_eraser();
                }
            });
    }
}

impl MathboardApp {
    fn render_toolbar(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            if ui.button("Reset").clicked() {
                self.state.request_reset();
                ui.ctx().request_repaint();
            }

            ui.separator();

            // Color swatches
            for color in SWATCHES {
                let (rect, response) =
                    ui.allocate_exact_size(Vec2::splat(SWATCH_SIZE), Sense::click());
                let selected = !self.state.is_erasing && self.state.color == color;
                let border = if selected {
                    Stroke::new(2.0, Color32::WHITE)
                } else {
                    Stroke::new(1.0, Color32::from_gray(200))
                };
                ui.painter().circle(rect.center(), SWATCH_SIZE / 2.0, color, border);

                if response
                    .on_hover_text(AppUtils::swatch_name(color))
                    .clicked()
                {
                    self.state.set_color(color);
                }
            }

            ui.separator();

            if ui.button("Run").clicked() {
                self.submit(ui.ctx());
            }
            if self.in_flight() > 0 {
                ui.spinner();
            }
        });

        // Eraser related settings
        if self.state.is_erasing {
            ui.horizontal(|ui| {
                ui.label("Eraser size:");
                let mut size = self.state.eraser_size;
                let slider_response = ui.add(egui::Slider::new(&mut size, ERASER_SIZE_RANGE));
                self.state.set_eraser_size(size);

                self.state.show_size_preview =
                    slider_response.dragged() || slider_response.hovered();
            });
        } else {
            self.state.show_size_preview = false;
        }
    }

    fn render_canvas(&mut self, ui: &mut egui::Ui) {
        let (rect, response) =
            ui.allocate_exact_size(ui.available_size(), Sense::click_and_drag());

        self.state
            .surface
            .mount(rect.size(), ui.ctx().pixels_per_point());

        self.handle_canvas_input(ui, rect, &response);

        if let Some(upload) = self.state.surface.take_upload() {
            let options = egui::TextureOptions::LINEAR;
            if let Some(texture) = self.canvas_texture.as_mut() {
                match upload {
                    CanvasUpload::Full(image) => texture.set(image, options),
                    CanvasUpload::Partial { origin, image } => {
                        texture.set_partial(origin, image, options);
                    }
                }
            } else {
                match upload {
                    CanvasUpload::Full(image) => {
                        self.canvas_texture =
                            Some(ui.ctx().load_texture("canvas", image, options));
                    }
                    // 还没有纹理，下一帧整张上传
                    CanvasUpload::Partial { .. } => {
                        self.state.surface.request_full_upload();
                        ui.ctx().request_repaint();
                    }
                }
            }
        }

        let painter = ui.painter_at(rect);
        if let Some(texture) = &self.canvas_texture {
            painter.image(
                texture.id(),
                rect,
                Rect::from_min_max(Pos2::ZERO, Pos2::new(1.0, 1.0)),
                Color32::WHITE,
            );
        }

        if self.state.is_erasing
            && let Some(pos) = response.hover_pos()
        {
            AppUtils::draw_size_preview(&painter, pos, self.state.eraser_size);
        }
        if self.state.show_size_preview {
            AppUtils::draw_size_preview(&painter, rect.center(), self.state.eraser_size);
        }

        if response.hovered() {
            ui.ctx().set_cursor_icon(CursorIcon::Crosshair);
        }

        self.render_overlays(ui, rect);
    }

    // 把 egui 的指针输入翻译成画布事件
    fn handle_canvas_input(&mut self, ui: &egui::Ui, rect: Rect, response: &egui::Response) {
        let pointer_pos = ui.input(|i| i.pointer.interact_pos());
        // 工具栏和橡皮擦按钮盖住的地方不算画布
        let over_canvas = pointer_pos.is_some_and(|pos| {
            rect.contains(pos) && ui.ctx().layer_id_at(pos) == Some(ui.layer_id())
        });

        let pressed_on_canvas = response.is_pointer_button_down_on();

        let frame = ui.input(|i| PointerFrame {
            pressed: i.pointer.primary_pressed() && pressed_on_canvas,
            released: i.pointer.primary_released(),
            moving: i.pointer.is_moving(),
            pos: pointer_pos.map(|pos| (pos - rect.min).to_pos2()),
            over_canvas,
            gone: i.events.iter().any(|e| matches!(e, egui::Event::PointerGone)),
            cancelled: i.events.iter().any(|e| {
                matches!(
                    e,
                    egui::Event::Touch {
                        phase: egui::TouchPhase::Cancel,
                        ..
                    }
                )
            }),
        });

        for event in frame.events(self.state.surface.is_drawing()) {
            self.state.handle_pointer(event);
        }
    }

    fn render_overlays(&mut self, ui: &egui::Ui, canvas_rect: Rect) {
        let painter = ui.painter_at(canvas_rect);
        let mut finished = None;

        for (index, item) in self.state.overlays.items().iter().enumerate() {
            let id = overlay_id(index);

            let galley = match self.pass.rendered(index) {
                Some(job) => painter.layout_job(job.clone()),
                None => painter.layout_no_wrap(
                    item.text.clone(),
                    FontId::proportional(self.style.font_size),
                    self.style.color,
                ),
            };

            let offset = match &self.active_drag {
                Some((drag_id, delta)) if *drag_id == id => *delta,
                _ => Vec2::ZERO,
            };
            let min = canvas_rect.min + item.position.to_vec2() + offset;
            let item_rect =
                Rect::from_min_size(min, galley.size() + Vec2::splat(OVERLAY_PADDING * 2.0));

            let response = ui.interact(item_rect, ui.id().with(&id), Sense::drag());
            if response.drag_started() {
                self.active_drag = Some((id.clone(), Vec2::ZERO));
            }
            if response.dragged() {
                if let Some((drag_id, delta)) = self.active_drag.as_mut()
                    && *drag_id == id
                {
                    *delta += response.drag_delta();
                }
                ui.ctx().set_cursor_icon(CursorIcon::Grabbing);
            } else if response.hovered() {
                ui.ctx().set_cursor_icon(CursorIcon::Grab);
            }
            if response.drag_stopped() {
                finished = self.active_drag.take();
            }

            painter.galley(min + Vec2::splat(OVERLAY_PADDING), galley, self.style.color);
        }

        // Commit the drag once the pointer is released
        if let Some((id, delta)) = finished {
            self.state.overlays.end_drag(&id, delta);
        }
    }
}

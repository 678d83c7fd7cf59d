use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use egui::{Color32, Pos2};

use crate::canvas::{BACKGROUND_COLOR, Brush, CanvasSurface, PointerEvent, SnapshotError};
use crate::overlay::{OverlayItem, OverlayList};
use crate::recognition::{CalculateRequest, Completion, Evaluation, SubmitTicket};

pub const PEN_WIDTH: f32 = 5.0;
pub const DEFAULT_ERASER_SIZE: f32 = 12.0;
pub const ERASER_SIZE_RANGE: RangeInclusive<f32> = 5.0..=50.0;

// 第一条结果的位置
pub const RESULT_ORIGIN: Pos2 = Pos2::new(10.0, 50.0);
pub const RESULT_ROW_HEIGHT: f32 = 15.0;

pub type VariableBindings = BTreeMap<String, String>;

// 重置状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetState {
    Idle,      // 空闲
    Requested, // 已请求，下一帧执行
}

// 处理识别结果的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(usize), // 追加的结果数量
    Stale,          // 重置之前发出的请求
    Failed,         // 请求失败，状态不变
}

// 色板
pub const SWATCHES: [Color32; 12] = [
    Color32::from_rgb(255, 255, 255), // 白色
    Color32::from_rgb(0, 0, 0),       // 黑色
    Color32::from_rgb(238, 51, 51),   // 红色
    Color32::from_rgb(230, 73, 128),  // 粉色
    Color32::from_rgb(190, 75, 219),  // 紫色
    Color32::from_rgb(137, 50, 0),    // 棕色
    Color32::from_rgb(34, 139, 230),  // 蓝色
    Color32::from_rgb(51, 51, 238),   // 靛色
    Color32::from_rgb(64, 192, 87),   // 绿色
    Color32::from_rgb(0, 170, 0),     // 深绿
    Color32::from_rgb(250, 176, 5),   // 黄色
    Color32::from_rgb(253, 126, 20),  // 橙色
];

pub struct ScreenState {
    pub surface: CanvasSurface,   // 画布
    pub overlays: OverlayList,    // 识别结果
    bindings: VariableBindings,   // 变量绑定
    pub color: Color32,           // 画笔颜色
    pub is_erasing: bool,         // 是否为橡皮擦
    pub eraser_size: f32,         // 橡皮擦大小
    pub show_size_preview: bool,  // 是否显示橡皮擦大小预览
    reset: ResetState,            // 重置状态机
    session: u64,                 // 每次重置加一
}

impl Default for ScreenState {
    fn default() -> Self {
        Self {
            surface: CanvasSurface::default(),
            overlays: OverlayList::default(),
            bindings: VariableBindings::new(),
            color: Color32::WHITE,
            is_erasing: false,
            eraser_size: DEFAULT_ERASER_SIZE,
            show_size_preview: false,
            reset: ResetState::Idle,
            session: 0,
        }
    }
}

impl ScreenState {
    /// Position of the `index`-th result counted from an empty board.
    pub fn result_position(index: usize) -> Pos2 {
        Pos2::new(
            RESULT_ORIGIN.x,
            RESULT_ORIGIN.y + RESULT_ROW_HEIGHT * index as f32,
        )
    }

    // 橡皮擦就是用底色画
    pub fn brush(&self) -> Brush {
        if self.is_erasing {
            Brush {
                color: BACKGROUND_COLOR,
                width: self.eraser_size,
            }
        } else {
            Brush {
                color: self.color,
                width: PEN_WIDTH,
            }
        }
    }

    pub fn set_color(&mut self, color: Color32) {
        self.color = color;
    }

    pub fn toggle_eraser(&mut self) {
        self.is_erasing = !self.is_erasing;
    }

    pub fn set_eraser_size(&mut self, size: f32) {
        self.eraser_size = size.clamp(*ERASER_SIZE_RANGE.start(), *ERASER_SIZE_RANGE.end());
    }

    pub fn handle_pointer(&mut self, event: PointerEvent) -> bool {
        let brush = self.brush();
        self.surface.handle_pointer(event, brush)
    }

    pub fn bindings(&self) -> &VariableBindings {
        &self.bindings
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn reset_state(&self) -> ResetState {
        self.reset
    }

    pub fn request_reset(&mut self) {
        self.reset = ResetState::Requested;
    }

    /// Carry out a requested reset. Returns `true` if one was performed.
    pub fn process_reset(&mut self) -> bool {
        if self.reset != ResetState::Requested {
            return false;
        }

        self.surface.clear();
        self.overlays.clear();
        self.bindings.clear();
        self.session += 1;
        self.reset = ResetState::Idle;
        log::info!("board reset (session {})", self.session);
        true
    }

    /// Snapshot the canvas and the bindings for one submission.
    pub fn begin_submit(&self) -> Result<(SubmitTicket, CalculateRequest), SnapshotError> {
        let image = self.surface.snapshot_data_url()?;
        let ticket = SubmitTicket {
            session: self.session,
            base_count: self.overlays.len(),
        };
        let request = CalculateRequest {
            image,
            dict_of_vars: self.bindings.clone(),
        };
        Ok((ticket, request))
    }

    pub fn apply_completion(&mut self, completion: Completion) -> ApplyOutcome {
        let Completion { ticket, outcome } = completion;

        if ticket.session != self.session {
            log::debug!(
                "dropping result of session {} (now {})",
                ticket.session,
                self.session
            );
            return ApplyOutcome::Stale;
        }

        match outcome {
            Ok(evaluations) => {
                ApplyOutcome::Applied(self.apply_evaluations(ticket.base_count, evaluations))
            }
            Err(err) => {
                log::error!("error sending data: {err}");
                ApplyOutcome::Failed
            }
        }
    }

    /// Merge assignments into the bindings and append one overlay per evaluation, in
    /// response order.
    ///
    /// Rows are counted from `base_count`, the overlay count when the request was sent,
    /// so two requests in flight at once can land on the same rows.
    pub fn apply_evaluations(&mut self, base_count: usize, evaluations: Vec<Evaluation>) -> usize {
        let count = evaluations.len();
        let mut items = Vec::with_capacity(count);

        for (i, evaluation) in evaluations.into_iter().enumerate() {
            let markup = evaluation.markup();
            if evaluation.assign {
                self.bindings.insert(evaluation.expr, evaluation.result);
            }
            items.push(OverlayItem::with_position(
                markup,
                Self::result_position(base_count + i),
            ));
        }

        self.overlays.extend(items);
        count
    }
}

use std::sync::Arc;

use base64::Engine as _;
use egui::{Pos2, Vec2};
use mathboard::canvas::PointerEvent;
use mathboard::recognition::{Completion, Evaluation};
use mathboard::state::{ApplyOutcome, ScreenState};
use mathboard::typeset::{PlainText, TypesetPass, TypesetService, TypesetStyle};

fn board(width: f32, height: f32, pixels_per_point: f32) -> ScreenState {
    let mut state = ScreenState::default();
    state
        .surface
        .mount(Vec2::new(width, height), pixels_per_point);
    state
}

fn draw_line(state: &mut ScreenState, from: Pos2, to: Pos2) {
    state.handle_pointer(PointerEvent::Down(from));
    state.handle_pointer(PointerEvent::Move(to));
    state.handle_pointer(PointerEvent::Up);
}

#[test]
fn test_snapshot_is_png_at_device_resolution() {
    let mut state = board(40.0, 30.0, 2.0);
    draw_line(&mut state, Pos2::new(5.0, 5.0), Pos2::new(30.0, 20.0));

    let (ticket, request) = state.begin_submit().unwrap();
    assert_eq!(ticket.base_count, 0);
    assert!(request.dict_of_vars.is_empty());

    let encoded = request
        .image
        .strip_prefix("data:image/png;base64,")
        .unwrap();
    let png = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .unwrap();
    let decoded = image::load_from_memory(&png).unwrap().to_rgba8();
    assert_eq!(decoded.dimensions(), (80, 60));

    // stroke drawn in white on black
    assert_eq!(decoded.get_pixel(10, 10).0, [255, 255, 255, 255]);
    assert_eq!(decoded.get_pixel(79, 0).0, [0, 0, 0, 255]);
}

#[test]
fn test_submit_apply_typeset_reset_cycle() {
    let mut state = board(64.0, 64.0, 1.0);
    let service = TypesetService::ready(Arc::new(PlainText));
    let style = TypesetStyle::default();
    let mut pass = TypesetPass::default();

    draw_line(&mut state, Pos2::new(4.0, 4.0), Pos2::new(40.0, 40.0));
    let (ticket, _) = state.begin_submit().unwrap();
    let outcome = state.apply_completion(Completion {
        ticket,
        outcome: Ok(vec![
            Evaluation::new("x", "5", true),
            Evaluation::new("x * 2", "10", false),
        ]),
    });
    assert_eq!(outcome, ApplyOutcome::Applied(2));

    // second request carries the binding from the first one
    let (second, request) = state.begin_submit().unwrap();
    assert_eq!(second.base_count, 2);
    assert_eq!(
        request.dict_of_vars.get("x").map(String::as_str),
        Some("5")
    );

    // typesetting happens on the frame after the change
    assert!(!pass.tick(state.overlays.items(), &service, &style));
    assert!(pass.notify_changed(state.overlays.revision(), state.overlays.is_empty()));
    assert!(pass.tick(state.overlays.items(), &service, &style));
    let first = pass.rendered(0).unwrap();
    assert_eq!(first.text, r"\(\LARGE{x = 5}\)");
    assert!(pass.rendered(1).is_some());

    state.request_reset();
    assert!(state.process_reset());
    assert!(state.overlays.is_empty());
    assert!(state.bindings().is_empty());

    // the emptied list clears rendered output without another pass
    assert!(!pass.notify_changed(state.overlays.revision(), state.overlays.is_empty()));
    assert!(pass.rendered(0).is_none());

    // the request sent before the reset comes back late
    let late = state.apply_completion(Completion {
        ticket: second,
        outcome: Ok(vec![Evaluation::new("y", "1", true)]),
    });
    assert_eq!(late, ApplyOutcome::Stale);
    assert!(state.overlays.is_empty());
    assert!(state.bindings().is_empty());

    // the canvas is blank again
    let raster = state.surface.raster().unwrap();
    assert_eq!(raster.pixel(20, 20), Some(egui::Color32::BLACK));
}

#[test]
fn test_dragged_result_keeps_new_position_across_appends() {
    let mut state = board(64.0, 64.0, 1.0);
    state.apply_evaluations(0, vec![Evaluation::new("a", "1", false)]);

    assert!(
        state
            .overlays
            .end_drag("latex-0", Vec2::new(100.0, 20.0))
    );
    state.apply_evaluations(1, vec![Evaluation::new("b", "2", false)]);

    assert_eq!(
        state.overlays.positions(),
        vec![Pos2::new(110.0, 70.0), Pos2::new(10.0, 65.0)]
    );
}

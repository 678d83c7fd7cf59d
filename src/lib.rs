//! A blackboard for handwritten math: draw, press *Run*, get typeset results back.

#![warn(clippy::all, rust_2018_idioms)]

mod app;
pub mod canvas;
pub mod config;
pub mod overlay;
pub mod recognition;
pub mod state;
pub mod typeset;
mod utils;

pub use app::MathboardApp;
pub use config::Config;

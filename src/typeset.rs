//! Math typesetting for the result overlays.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, TryRecvError};

use egui::text::{LayoutJob, TextFormat};
use egui::{Align, Color32, FontFamily, FontId};

use crate::overlay::OverlayItem;

pub const MATH_FONT_FAMILY: &str = "math";

#[derive(thiserror::Error, Debug)]
pub enum TypesetError {
    #[error("failed to start typesetting engine loader: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("typesetting engine loader stopped before finishing")]
    Disconnected,
}

// 行内公式定界符
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delimiters {
    pairs: Vec<(String, String)>,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self::new([("$", "$"), ("\\(", "\\)")])
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Math(&'a str),
}

impl Delimiters {
    pub fn new<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            pairs: pairs
                .into_iter()
                .filter(|(open, close)| !open.is_empty() && !close.is_empty())
                .map(|(open, close)| (open.to_owned(), close.to_owned()))
                .collect(),
        }
    }

    /// Split markup into plain text and delimited math. An opening delimiter without a
    /// matching close is left as text.
    pub fn split<'a>(&self, markup: &'a str) -> Vec<Segment<'a>> {
        let mut segments = Vec::new();
        let mut rest = markup;

        while !rest.is_empty() {
            let opening = self
                .pairs
                .iter()
                .filter_map(|(open, close)| rest.find(open.as_str()).map(|at| (at, open, close)))
                .min_by_key(|(at, _, _)| *at);

            let Some((at, open, close)) = opening else {
                segments.push(Segment::Text(rest));
                break;
            };

            let body_start = at + open.len();
            let Some(body_len) = rest.get(body_start..).and_then(|body| body.find(close.as_str()))
            else {
                segments.push(Segment::Text(rest));
                break;
            };

            if at > 0 {
                segments.push(Segment::Text(&rest[..at]));
            }
            segments.push(Segment::Math(&rest[body_start..body_start + body_len]));
            rest = &rest[body_start + body_len + close.len()..];
        }

        segments
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TypesetStyle {
    pub color: Color32,
    pub font_size: f32,
}

impl Default for TypesetStyle {
    fn default() -> Self {
        Self {
            color: Color32::WHITE,
            font_size: 16.0,
        }
    }
}

pub trait Typesetter: Send + Sync {
    fn layout(&self, markup: &str, style: &TypesetStyle) -> LayoutJob;
}

// 原样输出
pub struct PlainText;

impl Typesetter for PlainText {
    fn layout(&self, markup: &str, style: &TypesetStyle) -> LayoutJob {
        LayoutJob::simple_singleline(
            markup.to_owned(),
            FontId::proportional(style.font_size),
            style.color,
        )
    }
}

pub struct MathTypesetter {
    delimiters: Delimiters,
    family: FontFamily,
}

impl Default for MathTypesetter {
    fn default() -> Self {
        Self::new(Delimiters::default(), FontFamily::Proportional)
    }
}

impl MathTypesetter {
    pub fn new(delimiters: Delimiters, family: FontFamily) -> Self {
        Self { delimiters, family }
    }
}

impl Typesetter for MathTypesetter {
    fn layout(&self, markup: &str, style: &TypesetStyle) -> LayoutJob {
        let mut job = LayoutJob::default();
        for segment in self.delimiters.split(markup) {
            match segment {
                Segment::Text(text) => append_run(
                    &mut job,
                    &Run {
                        text: text.to_owned(),
                        scale: 1.0,
                        script: Script::Normal,
                    },
                    &FontFamily::Proportional,
                    style,
                ),
                Segment::Math(tex) => {
                    for run in render_tex(tex) {
                        append_run(&mut job, &run, &self.family, style);
                    }
                }
            }
        }
        job
    }
}

fn append_run(job: &mut LayoutJob, run: &Run, family: &FontFamily, style: &TypesetStyle) {
    if run.text.is_empty() {
        return;
    }
    let valign = match run.script {
        Script::Super => Align::TOP,
        Script::Normal | Script::Sub => Align::BOTTOM,
    };
    job.append(
        &run.text,
        0.0,
        TextFormat {
            font_id: FontId::new(style.font_size * run.scale, family.clone()),
            color: style.color,
            valign,
            ..Default::default()
        },
    );
}

// ----------------------------------------------------------------------------
// TeX subset

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Command(String),
    Open,
    Close,
    Sup,
    Sub,
    Char(char),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Script {
    Normal,
    Super,
    Sub,
}

#[derive(Clone, Debug, PartialEq)]
struct Run {
    text: String,
    scale: f32,
    script: Script,
}

#[derive(Clone, Copy)]
struct TexStyle {
    scale: f32,
    script: Script,
}

impl TexStyle {
    fn scripted(self, script: Script) -> Self {
        Self {
            scale: self.scale * 0.7,
            script,
        }
    }
}

fn tokenize(tex: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = tex.chars().peekable();

    while let Some(c) = chars.next() {
        let token = match c {
            '\\' => {
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if !next.is_ascii_alphabetic() {
                        break;
                    }
                    name.push(next);
                    chars.next();
                }
                if name.is_empty() {
                    match chars.next() {
                        Some(symbol) => Token::Command(symbol.to_string()),
                        None => Token::Char('\\'),
                    }
                } else {
                    Token::Command(name)
                }
            }
            '{' => Token::Open,
            '}' => Token::Close,
            '^' => Token::Sup,
            '_' => Token::Sub,
            other => Token::Char(other),
        };
        tokens.push(token);
    }

    tokens
}

fn size_factor(command: &str) -> Option<f32> {
    Some(match command {
        "tiny" => 0.5,
        "scriptsize" => 0.7,
        "footnotesize" => 0.8,
        "small" => 0.9,
        "normalsize" => 1.0,
        "large" => 1.2,
        "Large" => 1.44,
        "LARGE" => 1.728,
        "huge" => 2.074,
        "Huge" => 2.488,
        _ => return None,
    })
}

fn symbol(command: &str) -> Option<&'static str> {
    Some(match command {
        "alpha" => "α",
        "beta" => "β",
        "gamma" => "γ",
        "delta" => "δ",
        "epsilon" | "varepsilon" => "ε",
        "zeta" => "ζ",
        "eta" => "η",
        "theta" => "θ",
        "lambda" => "λ",
        "mu" => "μ",
        "pi" => "π",
        "rho" => "ρ",
        "sigma" => "σ",
        "tau" => "τ",
        "phi" | "varphi" => "φ",
        "omega" => "ω",
        "Gamma" => "Γ",
        "Delta" => "Δ",
        "Theta" => "Θ",
        "Lambda" => "Λ",
        "Pi" => "Π",
        "Sigma" => "Σ",
        "Phi" => "Φ",
        "Omega" => "Ω",
        "times" => "×",
        "cdot" => "·",
        "div" => "÷",
        "pm" => "±",
        "mp" => "∓",
        "leq" | "le" => "≤",
        "geq" | "ge" => "≥",
        "neq" | "ne" => "≠",
        "approx" => "≈",
        "infty" => "∞",
        "to" | "rightarrow" => "→",
        "leftarrow" => "←",
        "Rightarrow" => "⇒",
        "sum" => "∑",
        "prod" => "∏",
        "int" => "∫",
        "partial" => "∂",
        "circ" => "∘",
        "degree" => "°",
        "sin" => "sin",
        "cos" => "cos",
        "tan" => "tan",
        "log" => "log",
        "ln" => "ln",
        "exp" => "exp",
        "lim" => "lim",
        "," | ";" | ":" | " " => " ",
        "quad" => "  ",
        "qquad" => "    ",
        "{" => "{",
        "}" => "}",
        "%" => "%",
        "$" => "$",
        "&" => "&",
        "#" => "#",
        "_" => "_",
        "\\" => " ",
        _ => return None,
    })
}

// 超过这个嵌套深度的组原样输出
const MAX_GROUP_DEPTH: usize = 64;

struct TexRenderer {
    tokens: Vec<Token>,
    pos: usize,
    runs: Vec<Run>,
    depth: usize,
}

fn render_tex(tex: &str) -> Vec<Run> {
    let mut renderer = TexRenderer {
        tokens: tokenize(tex),
        pos: 0,
        runs: Vec::new(),
        depth: 0,
    };
    renderer.sequence(
        TexStyle {
            scale: 1.0,
            script: Script::Normal,
        },
        false,
    );
    renderer.runs
}

impl TexRenderer {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn push(&mut self, text: &str, style: TexStyle) {
        if let Some(last) = self.runs.last_mut()
            && last.script == style.script
            && (last.scale - style.scale).abs() < f32::EPSILON
        {
            last.text.push_str(text);
            return;
        }
        self.runs.push(Run {
            text: text.to_owned(),
            scale: style.scale,
            script: style.script,
        });
    }

    /// Render until the end of input, or until the closing brace of the current group.
    fn sequence(&mut self, mut style: TexStyle, in_group: bool) {
        let base_scale = style.scale;
        while let Some(token) = self.next() {
            match token {
                Token::Close if in_group => return,
                Token::Close => {}
                Token::Open => self.group(style),
                Token::Sup => self.argument(style.scripted(Script::Super)),
                Token::Sub => self.argument(style.scripted(Script::Sub)),
                Token::Char(c) => self.push(c.encode_utf8(&mut [0; 4]), style),
                Token::Command(name) => {
                    // 字号命令作用到当前组结束
                    if let Some(factor) = size_factor(&name) {
                        style.scale = base_scale * factor;
                    } else {
                        self.command(&name, style);
                    }
                }
            }
        }
    }

    fn argument(&mut self, style: TexStyle) {
        match self.next() {
            Some(Token::Open) => self.group(style),
            Some(Token::Char(c)) => self.push(c.encode_utf8(&mut [0; 4]), style),
            Some(Token::Command(name)) if self.depth < MAX_GROUP_DEPTH => {
                self.depth += 1;
                self.command(&name, style);
                self.depth -= 1;
            }
            Some(Token::Command(name)) => {
                let raw = format!("\\{name}");
                self.push(&raw, style);
            }
            Some(Token::Close | Token::Sup | Token::Sub) => self.pos -= 1,
            None => {}
        }
    }

    fn group(&mut self, style: TexStyle) {
        if self.depth >= MAX_GROUP_DEPTH {
            self.raw_group(style);
            return;
        }
        self.depth += 1;
        self.sequence(style, true);
        self.depth -= 1;
    }

    // 已读过 `{`，原样输出到匹配的 `}`
    fn raw_group(&mut self, style: TexStyle) {
        let mut text = String::from("{");
        let mut open = 1usize;
        while let Some(token) = self.next() {
            match token {
                Token::Open => {
                    open += 1;
                    text.push('{');
                }
                Token::Close => {
                    text.push('}');
                    open -= 1;
                    if open == 0 {
                        break;
                    }
                }
                Token::Sup => text.push('^'),
                Token::Sub => text.push('_'),
                Token::Char(c) => text.push(c),
                Token::Command(name) => {
                    text.push('\\');
                    text.push_str(&name);
                }
            }
        }
        self.push(&text, style);
    }

    fn command(&mut self, name: &str, style: TexStyle) {
        match name {
            "frac" | "dfrac" | "tfrac" => {
                self.push("(", style);
                self.argument(style);
                self.push(")/(", style);
                self.argument(style);
                self.push(")", style);
            }
            "sqrt" => {
                self.push("√(", style);
                self.argument(style);
                self.push(")", style);
            }
            "text" | "mathrm" | "mathbf" | "mathit" | "operatorname" | "textbf" => {
                self.argument(style);
            }
            "left" | "right" | "displaystyle" => {}
            other => match symbol(other) {
                Some(text) => self.push(text, style),
                None => {
                    let raw = format!("\\{other}");
                    self.push(&raw, style);
                }
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Engine lifecycle

pub struct MathFont {
    pub name: String,
    pub bytes: Vec<u8>,
}

enum EngineState {
    Loading(Receiver<Option<MathFont>>),
    Ready(Arc<dyn Typesetter>),
    Unavailable,
}

pub struct TypesetService {
    state: EngineState,
    delimiters: Delimiters,
}

impl TypesetService {
    /// Start loading in the background. Call [`Self::poll`] every frame.
    pub fn load(delimiters: Delimiters) -> Self {
        let state = match spawn_loader() {
            Ok(rx) => EngineState::Loading(rx),
            Err(err) => {
                log::error!("{err}");
                EngineState::Unavailable
            }
        };
        Self { state, delimiters }
    }

    pub fn ready(engine: Arc<dyn Typesetter>) -> Self {
        Self {
            state: EngineState::Ready(engine),
            delimiters: Delimiters::default(),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            state: EngineState::Unavailable,
            delimiters: Delimiters::default(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, EngineState::Ready(_))
    }

    pub fn engine(&self) -> Option<&Arc<dyn Typesetter>> {
        match &self.state {
            EngineState::Ready(engine) => Some(engine),
            EngineState::Loading(_) | EngineState::Unavailable => None,
        }
    }

    /// Check on the loader. Returns `true` on the call where the engine becomes ready.
    pub fn poll(&mut self, ctx: &egui::Context) -> bool {
        let EngineState::Loading(rx) = &self.state else {
            return false;
        };

        let loaded = match rx.try_recv() {
            Ok(font) => font,
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Disconnected) => {
                log::error!("{}", TypesetError::Disconnected);
                self.state = EngineState::Unavailable;
                return false;
            }
        };

        let family = match loaded {
            Some(font) => {
                log::info!("typesetting with math font {:?}", font.name);
                install_math_font(ctx, font);
                FontFamily::Name(MATH_FONT_FAMILY.into())
            }
            None => {
                log::info!("no math font found, typesetting with the default font");
                FontFamily::Proportional
            }
        };

        self.state = EngineState::Ready(Arc::new(MathTypesetter::new(
            self.delimiters.clone(),
            family,
        )));
        true
    }
}

fn install_math_font(ctx: &egui::Context, font: MathFont) {
    let mut fonts = egui::FontDefinitions::default();
    fonts.font_data.insert(
        font.name.clone(),
        Arc::new(egui::FontData::from_owned(font.bytes)),
    );

    // 数学字体缺字时回退到默认字体
    let mut family = vec![font.name];
    if let Some(proportional) = fonts.families.get(&FontFamily::Proportional) {
        family.extend(proportional.iter().cloned());
    }
    fonts
        .families
        .insert(FontFamily::Name(MATH_FONT_FAMILY.into()), family);

    ctx.set_fonts(fonts);
}

#[cfg(not(target_arch = "wasm32"))]
fn spawn_loader() -> Result<Receiver<Option<MathFont>>, TypesetError> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("typeset-loader".to_owned())
        .spawn(move || {
            if tx.send(find_math_font()).is_err() {
                log::debug!("typesetting engine dropped before loading finished");
            }
        })?;
    Ok(rx)
}

// 网页端没有系统字体可扫描，直接就绪
#[cfg(target_arch = "wasm32")]
fn spawn_loader() -> Result<Receiver<Option<MathFont>>, TypesetError> {
    let (tx, rx) = mpsc::channel();
    if tx.send(None).is_err() {
        return Err(TypesetError::Disconnected);
    }
    Ok(rx)
}

#[cfg(not(target_arch = "wasm32"))]
fn find_math_font() -> Option<MathFont> {
    const MATH_FONT_NAMES: [&str; 6] = [
        "STIX Two Math",
        "Latin Modern Math",
        "Cambria Math",
        "TeX Gyre Termes Math",
        "DejaVu Serif",
        "Noto Serif",
    ];

    let mut font_db = fontdb::Database::new();
    font_db.load_system_fonts();

    MATH_FONT_NAMES.iter().find_map(|font_name| {
        let face_id = font_db.query(&fontdb::Query {
            families: &[fontdb::Family::Name(font_name)],
            weight: fontdb::Weight::NORMAL,
            stretch: fontdb::Stretch::Normal,
            style: fontdb::Style::Normal,
        })?;
        let bytes = font_db.with_face_data(face_id, |data, _| data.to_vec())?;
        Some(MathFont {
            name: (*font_name).to_owned(),
            bytes,
        })
    })
}

// ----------------------------------------------------------------------------
// Typesetting pass

/// Re-renders the overlays after the list changes, one frame later.
#[derive(Default)]
pub struct TypesetPass {
    seen_revision: Option<u64>,
    scheduled: bool,
    rendered: Vec<LayoutJob>,
}

impl TypesetPass {
    /// Report the current overlay list. Returns `true` if a pass was scheduled, in which
    /// case the caller should request another frame.
    pub fn notify_changed(&mut self, revision: u64, is_empty: bool) -> bool {
        if self.seen_revision == Some(revision) {
            return false;
        }
        self.seen_revision = Some(revision);
        if is_empty {
            self.rendered.clear();
            self.scheduled = false;
            return false;
        }
        self.scheduled = true;
        true
    }

    /// Run the scheduled pass, if any. Without an engine the pass is dropped and the
    /// overlays keep whatever they showed before.
    pub fn tick(
        &mut self,
        items: &[OverlayItem],
        service: &TypesetService,
        style: &TypesetStyle,
    ) -> bool {
        if !self.scheduled {
            return false;
        }
        self.scheduled = false;

        let Some(engine) = service.engine() else {
            log::debug!("typesetting engine not ready, skipping pass");
            return false;
        };
        self.rendered = items
            .iter()
            .map(|item| engine.layout(&item.text, style))
            .collect();
        true
    }

    /// Forget the last reported list so the next [`Self::notify_changed`] schedules a
    /// pass even if nothing changed.
    pub fn invalidate(&mut self) {
        self.seen_revision = None;
    }

    pub fn rendered(&self, index: usize) -> Option<&LayoutJob> {
        self.rendered.get(index)
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(markup: &str) -> LayoutJob {
        MathTypesetter::default().layout(markup, &TypesetStyle::default())
    }

    #[test]
    fn test_split_both_delimiter_pairs() {
        let delimiters = Delimiters::default();
        assert_eq!(
            delimiters.split(r"a \(x\) b $y$"),
            vec![
                Segment::Text("a "),
                Segment::Math("x"),
                Segment::Text(" b "),
                Segment::Math("y"),
            ]
        );
    }

    #[test]
    fn test_split_unclosed_is_text() {
        let delimiters = Delimiters::default();
        assert_eq!(delimiters.split(r"\(x"), vec![Segment::Text(r"\(x")]);
        assert_eq!(delimiters.split("plain"), vec![Segment::Text("plain")]);
        assert!(delimiters.split("").is_empty());
    }

    #[test]
    fn test_large_group_scales_font() {
        let job = layout(r"\(\LARGE{x = 5}\)");
        assert_eq!(job.text, "x = 5");
        let size = job.sections[0].format.font_id.size;
        assert!((size - 16.0 * 1.728).abs() < 1e-3);
    }

    #[test]
    fn test_scripts_and_symbols() {
        let job = layout(r"$x^{2} \times \pi_0$");
        assert_eq!(job.text, "x2 × π0");

        let sup = job
            .sections
            .iter()
            .find(|s| &job.text[s.byte_range.clone()] == "2")
            .unwrap();
        assert_eq!(sup.format.valign, Align::TOP);
        assert!(sup.format.font_id.size < 16.0);

        let sub = job.sections.last().unwrap();
        assert_eq!(&job.text[sub.byte_range.clone()], "0");
        assert_eq!(sub.format.valign, Align::BOTTOM);
    }

    #[test]
    fn test_frac_and_sqrt() {
        assert_eq!(layout(r"\(\frac{1}{2}\)").text, "(1)/(2)");
        assert_eq!(layout(r"\(\sqrt{x+1}\)").text, "√(x+1)");
    }

    #[test]
    fn test_deep_nesting_falls_back_to_raw_text() {
        let depth = 100_000;
        let markup = format!(r"\({}x{}\)", "{".repeat(depth), "}".repeat(depth));
        let job = layout(&markup);
        assert!(job.text.contains('x'));
        assert!(job.text.contains("{{"));

        let roots = format!(r"\({}2\)", r"\sqrt".repeat(depth));
        assert!(layout(&roots).text.contains(r"\sqrt"));

        // 正常深度照常渲染
        assert_eq!(layout(r"\({{{x}}}\)").text, "x");
    }

    #[test]
    fn test_unknown_command_is_kept() {
        assert_eq!(layout(r"\(\foo x\)").text, r"\foo x");
    }

    #[test]
    fn test_plain_text_keeps_markup() {
        let job = PlainText.layout(r"\(\LARGE{x = 5}\)", &TypesetStyle::default());
        assert_eq!(job.text, r"\(\LARGE{x = 5}\)");
    }

    #[test]
    fn test_pass_waits_for_next_tick() {
        let service = TypesetService::ready(Arc::new(MathTypesetter::default()));
        let items = vec![OverlayItem::new(r"\(\LARGE{x = 5}\)")];
        let mut pass = TypesetPass::default();

        assert!(!pass.tick(&items, &service, &TypesetStyle::default()));
        assert!(pass.notify_changed(1, false));
        assert!(pass.rendered(0).is_none());

        assert!(pass.tick(&items, &service, &TypesetStyle::default()));
        assert_eq!(pass.rendered(0).unwrap().text, "x = 5");

        // 同一版本不再排版
        assert!(!pass.notify_changed(1, false));
    }

    #[test]
    fn test_pass_without_engine_waits_for_next_change() {
        let service = TypesetService::unavailable();
        let items = vec![OverlayItem::new(r"\(y\)")];
        let mut pass = TypesetPass::default();

        assert!(pass.notify_changed(1, false));
        assert!(!pass.tick(&items, &service, &TypesetStyle::default()));
        assert!(!pass.is_scheduled());
        assert!(pass.rendered(0).is_none());

        // 引擎就绪后重新排版同一版本
        let service = TypesetService::ready(Arc::new(PlainText));
        assert!(!pass.notify_changed(1, false));
        pass.invalidate();
        assert!(pass.notify_changed(1, false));
        assert!(pass.tick(&items, &service, &TypesetStyle::default()));
        assert!(pass.rendered(0).is_some());
    }

    #[test]
    fn test_pass_clears_on_empty_list() {
        let service = TypesetService::ready(Arc::new(PlainText));
        let items = vec![OverlayItem::new("a")];
        let mut pass = TypesetPass::default();
        pass.notify_changed(1, false);
        pass.tick(&items, &service, &TypesetStyle::default());
        assert!(pass.rendered(0).is_some());

        assert!(!pass.notify_changed(2, true));
        assert!(pass.rendered(0).is_none());
    }
}

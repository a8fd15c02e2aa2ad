//! Turning chunks of transitions into drawing primitives.
//!
//! Shapes are positioned in time relative to the start of the column they
//! belong to, and in row units vertically, so a column's output does not
//! depend on the zoom level or on where the column is on screen.

use std::{fmt::Write, ops::Range};

use wavecore::{netlist::SignalEncoding, store::RangeQuery, ChunkMetadata, Value};

use crate::session::DisplayedSignal;

/// Vertical distance between the tops of two rows, in row heights.
pub const ROW_PITCH: f32 = 1.4;

/// Roughly how many ruler ticks a column gets.
const TICKS_PER_COLUMN: f64 = 4.0;

/// A run of whole chunks rendered as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpan {
    pub index: usize,
    pub chunks: Range<usize>,
    /// Time of the left edge.
    pub start: f64,
    /// Time of the right edge.
    pub end: f64,
}

impl ColumnSpan {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Time since the start of the column.
    pub t: f64,
    pub y: f32,
}

fn pt(t: f64, y: f32) -> Point {
    Point { t, y }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Line(Vec<Point>),
    /// A ruler line at `t`, labelled with the absolute time.
    Tick { t: f64, label: String },
    /// A value written in the space between two changes.
    Label {
        start: f64,
        end: f64,
        y: f32,
        text: String,
    },
}

/// The seam between the viewport cache and whatever draws the waves.
pub trait ChunkRenderer {
    /// The part of a column that must appear as soon as it scrolls into
    /// view, before any wave data is drawn.
    fn render_ruler(&self, column: &ColumnSpan, chunking: &ChunkMetadata, out: &mut Vec<Shape>);

    /// Draw one signal in row `row`. `data` holds the transitions in the
    /// column's chunks plus the values either side of them.
    fn render_signal(
        &self,
        column: &ColumnSpan,
        row: usize,
        signal: &DisplayedSignal,
        data: &RangeQuery,
        out: &mut Vec<Shape>,
    );
}

/// Draws single bit signals as lines and everything else as buses with the
/// value written inside.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaveRenderer;

/// Tick spacing: the smallest 1, 2 or 5 times a power of ten that is at
/// least `target`, and never less than one time unit.
pub fn ruler_step(target: f64) -> f64 {
    if !(target > 1.0) {
        return 1.0;
    }
    let magnitude = 10f64.powf(target.log10().floor());
    let fact = [1.0, 2.0, 5.0]
        .into_iter()
        .find(|f| f * magnitude >= target)
        .unwrap_or(10.0);
    fact * magnitude
}

pub fn format_time(time: f64, time_scale: u32, time_unit: &str) -> String {
    format!("{}{}", time * time_scale as f64, time_unit)
}

impl ChunkRenderer for WaveRenderer {
    fn render_ruler(&self, column: &ColumnSpan, chunking: &ChunkMetadata, out: &mut Vec<Shape>) {
        let step = ruler_step(column.duration() / TICKS_PER_COLUMN);
        // Integer tick numbers so adjacent columns agree exactly on where
        // the ticks are.
        let mut k = (column.start / step).ceil() as u64;
        loop {
            let t = k as f64 * step;
            if t >= column.end {
                break;
            }
            out.push(Shape::Tick {
                t: t - column.start,
                label: format_time(t, chunking.time_scale, &chunking.time_unit),
            });
            k += 1;
        }
    }

    fn render_signal(
        &self,
        column: &ColumnSpan,
        row: usize,
        signal: &DisplayedSignal,
        data: &RangeQuery,
        out: &mut Vec<Shape>,
    ) {
        let segments = segments(column, data);
        let top = row as f32 * ROW_PITCH;
        if signal.width == 1 && signal.encoding == SignalEncoding::Bits {
            draw_bit(&segments, top, out);
        } else {
            draw_bus(&segments, top, column.duration() / 256.0, signal, out);
        }
    }
}

/// The values held across the column as `(from, value)` pairs with times
/// relative to the column start, plus the time the last one ends.
fn segments<'a>(column: &ColumnSpan, data: &'a RangeQuery) -> (Vec<(f64, &'a Value)>, f64) {
    let mut segments = vec![(0.0, &data.entry.value)];
    for transition in data.transitions {
        let t = transition.time as f64 - column.start;
        if t <= 0.0 {
            segments[0].1 = &transition.value;
        } else {
            segments.push((t, &transition.value));
        }
    }
    // Without anything after the column the last transition is the end of
    // the trace.
    let end = match data.exit {
        Some(_) => column.duration(),
        None => segments.last().map_or(0.0, |s| s.0),
    };
    (segments, end)
}

fn draw_bit((segments, end): &(Vec<(f64, &Value)>, f64), top: f32, out: &mut Vec<Shape>) {
    let level = |v: &Value| match v.as_bytes().first() {
        Some(b'1' | b'h') => top,
        Some(b'0' | b'l') => top + 1.0,
        _ => top + 0.5,
    };

    let mut points = Vec::with_capacity(segments.len() * 2 + 1);
    let mut prev: Option<f32> = None;
    for &(t, value) in segments {
        let y = level(value);
        match prev {
            Some(p) if p == y => continue,
            Some(p) => {
                points.push(pt(t, p));
                points.push(pt(t, y));
            }
            None => points.push(pt(t, y)),
        }
        prev = Some(y);
    }
    if let Some(p) = prev {
        points.push(pt(*end, p));
    }
    out.push(Shape::Line(points));
}

fn draw_bus(
    (segments, end): &(Vec<(f64, &Value)>, f64),
    top: f32,
    slant: f64,
    signal: &DisplayedSignal,
    out: &mut Vec<Shape>,
) {
    // Multiple bits get drawn like this:
    //
    // _____ⵃ⁐⁐⁐⁐X⁐⁐⁐⁐Ⲗ____
    //   0       1      2      0
    //
    // On a split a second line is started and on a join one of them is
    // finished.
    //
    // Line 0: _____/⎺⎺⎺⎺\____/
    // Line 1:      \____/⎺⎺⎺⎺\___
    let at = |t: f64, level: f32| pt(t, top + 1.0 - level);

    let mut line_bottom: Vec<Point> = Vec::new();
    let mut line_top: Vec<Point> = Vec::new();
    let mut prev: Option<(f64, &Value)> = None;

    for &(t, value) in segments {
        let is_zero = value.is_all_zero();
        match prev {
            None => {
                line_bottom.push(at(t, 0.0));
                if !is_zero {
                    line_top.push(at(t, 1.0));
                }
            }
            Some((_, p)) if p == value => continue,
            Some((from, p)) => {
                let prev_is_zero = p.is_all_zero();
                if !prev_is_zero {
                    label(from, t, top, p, signal, out);
                }
                match (prev_is_zero, is_zero) {
                    (true, true) => line_bottom.push(at(t, 0.0)),
                    (true, false) => {
                        // ⵃ
                        line_bottom.push(at(t, 0.0));
                        line_bottom.push(at(t + slant, 1.0));
                        line_top.push(at(t + slant / 2.0, 0.5));
                        line_top.push(at(t + slant, 0.0));
                        std::mem::swap(&mut line_top, &mut line_bottom);
                    }
                    (false, true) => {
                        // Ⲗ
                        line_top.push(at(t, 1.0));
                        line_top.push(at(t + slant, 0.0));
                        line_bottom.push(at(t, 0.0));
                        line_bottom.push(at(t + slant / 2.0, 0.5));
                        std::mem::swap(&mut line_top, &mut line_bottom);
                        // The old bottom line ends at the join.
                        out.push(Shape::Line(std::mem::take(&mut line_top)));
                    }
                    (false, false) => {
                        // X
                        line_bottom.push(at(t, 0.0));
                        line_bottom.push(at(t + slant, 1.0));
                        line_top.push(at(t, 1.0));
                        line_top.push(at(t + slant, 0.0));
                        std::mem::swap(&mut line_top, &mut line_bottom);
                    }
                }
            }
        }
        prev = Some((t, value));
    }

    if let Some((from, value)) = prev {
        if !value.is_all_zero() {
            label(from, *end, top, value, signal, out);
            line_top.push(at(*end, 1.0));
        }
        line_bottom.push(at(*end, 0.0));
    }
    for line in [line_bottom, line_top] {
        if !line.is_empty() {
            out.push(Shape::Line(line));
        }
    }
}

fn label(start: f64, end: f64, top: f32, value: &Value, signal: &DisplayedSignal, out: &mut Vec<Shape>) {
    if end <= start {
        return;
    }
    let text = match signal.encoding {
        SignalEncoding::Bits => value.format(signal.format),
        SignalEncoding::Real | SignalEncoding::String => value.as_str().to_owned(),
    };
    out.push(Shape::Label {
        start,
        end,
        y: top + 0.5,
        text,
    });
}

/// Lays columns out side by side as an SVG document.
pub struct SvgWriter {
    body: String,
    /// Time at the left edge of the image.
    origin: f64,
    zoom: f64,
    row_px: f64,
}

impl SvgWriter {
    pub fn new(origin: f64, zoom: f64, row_px: f64) -> Self {
        Self {
            body: String::new(),
            origin,
            zoom,
            row_px,
        }
    }

    fn x(&self, column: &ColumnSpan, t: f64) -> f64 {
        (column.start + t - self.origin) * self.zoom
    }

    fn y(&self, y: f32) -> f64 {
        // Leave room for the ruler labels.
        20.0 + y as f64 * self.row_px
    }

    pub fn column<'a>(&mut self, column: &ColumnSpan, shapes: impl IntoIterator<Item = &'a Shape>) {
        for shape in shapes {
            // Writing to a String cannot fail.
            let _ = match shape {
                Shape::Line(points) => {
                    let points: Vec<String> = points
                        .iter()
                        .map(|p| format!("{:.2},{:.2}", self.x(column, p.t), self.y(p.y)))
                        .collect();
                    writeln!(
                        self.body,
                        r#"<polyline points="{}" fill="none" stroke="black"/>"#,
                        points.join(" ")
                    )
                }
                Shape::Tick { t, label } => {
                    let x = self.x(column, *t);
                    writeln!(
                        self.body,
                        r#"<line x1="{x:.2}" y1="12" x2="{x:.2}" y2="100%" stroke="grey"/><text x="{x:.2}" y="10" font-size="8" text-anchor="middle">{}</text>"#,
                        escape(label)
                    )
                }
                Shape::Label { start, end, y, text } => {
                    let x = (self.x(column, *start) + self.x(column, *end)) / 2.0;
                    writeln!(
                        self.body,
                        r#"<text x="{x:.2}" y="{:.2}" font-size="10" text-anchor="middle" dominant-baseline="middle">{}</text>"#,
                        self.y(*y),
                        escape(text)
                    )
                }
            };
        }
    }

    pub fn finish(self, width: f64, rows: usize) -> String {
        let height = self.y(rows as f32 * ROW_PITCH) + 4.0;
        format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{width:.0}\" height=\"{height:.0}\">\n{}</svg>\n",
            self.body
        )
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod test {
    use super::*;
    use wavecore::{netlist::NodeId, NumericFormat, SignalRef, Transition};

    fn span() -> ColumnSpan {
        ColumnSpan {
            index: 1,
            chunks: 1..2,
            start: 100.0,
            end: 200.0,
        }
    }

    fn displayed(width: u32) -> DisplayedSignal {
        DisplayedSignal {
            node: NodeId(0),
            signal: SignalRef(0),
            width,
            encoding: SignalEncoding::Bits,
            format: NumericFormat::Hex,
        }
    }

    fn transitions(changes: &[(u64, &str)]) -> Vec<Transition> {
        changes
            .iter()
            .map(|(t, v)| Transition::new(*t, Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_ruler_step() {
        assert_eq!(ruler_step(7.0), 10.0);
        assert_eq!(ruler_step(130.0), 200.0);
        assert_eq!(ruler_step(2.5), 5.0);
        assert_eq!(ruler_step(500.0), 500.0);
        assert_eq!(ruler_step(0.3), 1.0);
        assert_eq!(ruler_step(0.0), 1.0);
    }

    #[test]
    fn test_ruler_ticks() {
        let chunking = ChunkMetadata {
            chunk_time: 100.0,
            chunk_count: 4,
            time_end: 400,
            default_zoom: 5.12,
            time_scale: 10,
            time_unit: "ps".to_owned(),
        };
        let mut out = Vec::new();
        WaveRenderer.render_ruler(&span(), &chunking, &mut out);
        let ticks: Vec<(f64, &str)> = out
            .iter()
            .map(|s| match s {
                Shape::Tick { t, label } => (*t, label.as_str()),
                _ => panic!("not a tick"),
            })
            .collect();
        assert_eq!(
            ticks,
            vec![
                (0.0, "1000ps"),
                (50.0, "1500ps"),
            ]
        );
    }

    #[test]
    fn test_single_bit() {
        let all = transitions(&[(0, "0"), (150, "1"), (180, "x"), (250, "0")]);
        let data = RangeQuery {
            entry: &all[0],
            transitions: &all[1..3],
            exit: all.get(3),
            first_index: 1,
        };
        let mut out = Vec::new();
        WaveRenderer.render_signal(&span(), 2, &displayed(1), &data, &mut out);
        let top = 2.0 * ROW_PITCH;
        assert_eq!(
            out,
            vec![Shape::Line(vec![
                pt(0.0, top + 1.0),
                pt(50.0, top + 1.0),
                pt(50.0, top),
                pt(80.0, top),
                pt(80.0, top + 0.5),
                pt(100.0, top + 0.5),
            ])]
        );
    }

    #[test]
    fn test_bus_labels() {
        // The change at 100 is exactly on the column edge.
        let all = transitions(&[(0, "0000"), (100, "1010"), (120, "0000"), (160, "xxxx"), (190, "xxxx")]);
        let data = RangeQuery {
            entry: &all[0],
            transitions: &all[1..],
            exit: None,
            first_index: 1,
        };
        let mut out = Vec::new();
        WaveRenderer.render_signal(&span(), 0, &displayed(4), &data, &mut out);
        let labels: Vec<(f64, f64, &str)> = out
            .iter()
            .filter_map(|s| match s {
                Shape::Label { start, end, text, .. } => Some((*start, *end, text.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(labels, vec![(0.0, 20.0, "a"), (60.0, 90.0, "x")]);

        // One line finished at the join, then the two lines of the final
        // bus, both ending where the trace ends.
        let lines: Vec<&Vec<Point>> = out
            .iter()
            .filter_map(|s| match s {
                Shape::Line(points) => Some(points),
                _ => None,
            })
            .collect();
        assert_eq!(lines.len(), 3);
        for line in &lines[1..] {
            assert_eq!(line.last().map(|p| p.t), Some(90.0));
        }
    }

    #[test]
    fn test_svg_is_deterministic() {
        let shapes = vec![
            Shape::Tick {
                t: 0.0,
                label: "a<b".to_owned(),
            },
            Shape::Line(vec![pt(0.0, 1.0), pt(10.0, 1.0)]),
        ];
        let render = || {
            let mut svg = SvgWriter::new(100.0, 2.0, 20.0);
            svg.column(&span(), &shapes);
            svg.finish(200.0, 1)
        };
        let a = render();
        assert_eq!(a, render());
        assert!(a.contains("a&lt;b"));
        assert!(a.contains(r#"points="0.00,40.00 20.00,40.00""#));
    }
}

//! The state of one view onto a document: where it is scrolled to, how far
//! it is zoomed, and which signals are shown.

use wavecore::{
    netlist::{NodeId, SignalEncoding},
    ChunkMetadata, Netlist, NumericFormat, SignalRef,
};

/// A row in the wave view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayedSignal {
    pub node: NodeId,
    pub signal: SignalRef,
    pub width: u32,
    pub encoding: SignalEncoding,
    pub format: NumericFormat,
}

#[derive(Debug, Clone)]
pub struct ViewSession {
    /// Time at the left edge of the viewport.
    pub scroll: f64,
    /// Pixels per time unit.
    pub zoom: f64,
    pub displayed: Vec<DisplayedSignal>,
    pub selected: Option<NodeId>,
    time_end: u64,
}

impl ViewSession {
    /// A session scrolled to the start at the document's default zoom.
    pub fn new(chunking: &ChunkMetadata) -> Self {
        Self {
            scroll: 0.0,
            zoom: chunking.default_zoom,
            displayed: Vec::new(),
            selected: None,
            time_end: chunking.time_end,
        }
    }

    /// Add a signal row. Returns the row, or None if `node` is not a signal.
    pub fn display(&mut self, netlist: &Netlist, node: NodeId) -> Option<usize> {
        let info = netlist.get(node)?.signal()?;
        self.displayed.push(DisplayedSignal {
            node,
            signal: info.signal,
            width: info.width,
            encoding: info.encoding,
            format: info.numeric_format,
        });
        Some(self.displayed.len() - 1)
    }

    /// Remove a row. The selection is cleared once its last row is gone.
    pub fn remove(&mut self, row: usize) -> Option<DisplayedSignal> {
        let removed = (row < self.displayed.len()).then(|| self.displayed.remove(row))?;
        if self.selected == Some(removed.node)
            && !self.displayed.iter().any(|r| r.node == removed.node)
        {
            self.selected = None;
        }
        Some(removed)
    }

    /// Change the radix of every row showing `node`.
    pub fn set_format(&mut self, node: NodeId, format: NumericFormat) -> bool {
        let mut changed = false;
        for row in self.displayed.iter_mut().filter(|r| r.node == node) {
            changed |= row.format != format;
            row.format = format;
        }
        changed
    }

    pub fn select(&mut self, node: Option<NodeId>) {
        self.selected = node;
    }

    pub fn scroll_to(&mut self, time: f64) {
        self.scroll = time.clamp(0.0, self.time_end as f64);
    }

    /// Zoom by `factor`, keeping `anchor` (a time) at the same place on
    /// screen.
    pub fn zoom_by(&mut self, factor: f64, anchor: f64) {
        if !(factor.is_finite() && factor > 0.0) {
            return;
        }
        let offset = (anchor - self.scroll) * self.zoom;
        self.zoom *= factor;
        self.scroll_to(anchor - offset / self.zoom);
    }

    /// Times visible in a viewport `width_px` wide.
    pub fn visible(&self, width_px: f64) -> std::ops::Range<f64> {
        self.scroll..self.scroll + width_px / self.zoom
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use wavecore::{netlist::NetlistBuilder, netlist::SignalInfo};

    fn chunking() -> ChunkMetadata {
        ChunkMetadata {
            chunk_time: 100.0,
            chunk_count: 10,
            time_end: 1000,
            default_zoom: 5.12,
            time_scale: 1,
            time_unit: "ns".to_owned(),
        }
    }

    #[test]
    fn test_zoom_keeps_anchor() {
        let mut session = ViewSession::new(&chunking());
        session.scroll_to(200.0);
        session.zoom = 2.0;
        session.zoom_by(4.0, 300.0);
        assert_eq!(session.zoom, 8.0);
        // 300 was 200px from the left edge and still is.
        assert_eq!(session.scroll, 275.0);
        session.scroll_to(-5.0);
        assert_eq!(session.scroll, 0.0);
        assert_eq!(session.visible(80.0), 0.0..10.0);
    }

    #[test]
    fn test_display_and_format() {
        let mut builder = NetlistBuilder::new();
        let top = builder.push_scope("top".into(), "module".into(), String::new());
        let data = builder.add_signal(
            "data".into(),
            SignalInfo {
                width: 8,
                signal_id: "#".into(),
                signal: SignalRef(0),
                var_type: "wire".into(),
                encoding: SignalEncoding::Bits,
                numeric_format: NumericFormat::Hex,
            },
        );
        builder.pop_scope();
        let netlist = builder.finish();

        let mut session = ViewSession::new(&chunking());
        assert_eq!(session.display(&netlist, top), None);
        assert_eq!(session.display(&netlist, data), Some(0));
        assert_eq!(session.display(&netlist, data), Some(1));
        assert!(session.set_format(data, NumericFormat::Decimal));
        assert!(!session.set_format(data, NumericFormat::Decimal));
        assert!(session
            .displayed
            .iter()
            .all(|r| r.format == NumericFormat::Decimal));
        session.select(Some(data));
        assert_eq!(session.remove(1).map(|r| r.width), Some(8));
        assert_eq!(session.remove(1), None);
        assert_eq!(session.selected, Some(data));
        assert!(session.remove(0).is_some());
        assert_eq!(session.selected, None);
    }
}

/// How the viewport is laid out and how much render work is done at once.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportConfig {
    /// Width of the visible wave area in pixels.
    pub viewport_width_px: f64,
    /// Columns kept rendered beyond each side of the visible area.
    pub prefetch_columns: usize,
    /// Columns narrower than this at the current zoom are merged, four at a
    /// time, until they are at least this wide.
    pub min_column_width_px: f64,
    /// Signal rows rendered before a render task yields.
    pub signals_per_slice: usize,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            viewport_width_px: 1024.0,
            prefetch_columns: 1,
            min_column_width_px: 128.0,
            signals_per_slice: 16,
        }
    }
}

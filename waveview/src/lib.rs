//! Viewport side of the waveform viewer: which chunks of time are rendered,
//! how they are rendered, and when.
//!
//! The [`cache::ViewportCache`] keeps rendered columns for the part of the
//! trace in view. Rendering is split into small [`scheduler`] slices so a
//! caller driving a UI can interleave it with input handling.

pub mod cache;
pub mod config;
pub mod render;
pub mod scheduler;
pub mod session;

pub use cache::{EntryState, ViewportCache};
pub use config::ViewportConfig;
pub use render::{ChunkRenderer, ColumnSpan, Shape, SvgWriter, WaveRenderer};
pub use session::{DisplayedSignal, ViewSession};

use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use crossbeam_channel::RecvTimeoutError;
use log::{info, warn};
use wavecore::{
    netlist::NodeKind, DocumentState, LoadOptions, Loader, Netlist, NodeId, Update,
};
use waveview::{SvgWriter, ViewSession, ViewportCache, ViewportConfig};

/// Rows shown in the rendered viewport.
const MAX_ROWS: usize = 32;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (path, svg_path) = match args.as_slice() {
        [path] => (PathBuf::from(path), None),
        [path, svg] => (PathBuf::from(path), Some(PathBuf::from(svg))),
        _ => bail!("Usage: wavescan <trace.vcd|trace.fst> [viewport.svg]"),
    };

    let loader = Loader::spawn(&path, LoadOptions::default());
    let mut state = DocumentState::new();
    loop {
        let event = match loader.events().recv_timeout(PROGRESS_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                info!("Loading {}: {}%", path.display(), loader.progress());
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match state.apply(event) {
            Some(Update::NetlistReady) => {
                if let Some(store) = state.store() {
                    print_netlist(store.netlist());
                }
            }
            Some(Update::Failed(reason)) => bail!("Loading {} failed: {reason}", path.display()),
            _ => {}
        }
    }
    if !state.is_finished() {
        bail!("Loading {} stopped early", path.display());
    }
    for diagnostic in &state.diagnostics {
        warn!("{diagnostic}");
    }

    let store = state.store().context("No document loaded")?;
    let metadata = store.metadata();
    let chunking = store.chunking().context("Chunking was never derived")?;

    println!();
    println!("format        {:?}", metadata.format);
    if !metadata.date.is_empty() {
        println!("date          {}", metadata.date);
    }
    if !metadata.version.is_empty() {
        println!("version       {}", metadata.version);
    }
    println!("modules       {}", metadata.module_count);
    println!("signals       {}", metadata.signal_count);
    println!("chunk_time    {}", chunking.chunk_time);
    println!("chunk_count   {}", chunking.chunk_count);
    println!("time_end      {}", chunking.time_end);
    println!("default_zoom  {}", chunking.default_zoom);
    println!("time_scale    {}", chunking.time_scale);
    println!("time_unit     {}", chunking.time_unit);
    for (time, dumping) in &metadata.dump_activity {
        println!("dump {:3}      {time}", if *dumping { "on" } else { "off" });
    }

    let config = ViewportConfig::default();
    let mut session = ViewSession::new(chunking);
    let nodes: Vec<NodeId> = store
        .netlist()
        .signals()
        .map(|(id, _, _)| id)
        .take(MAX_ROWS)
        .collect();
    for node in nodes {
        session.display(store.netlist(), node);
    }

    let mut cache = ViewportCache::new(config.clone(), chunking.clone());
    cache.set_window(&session, store);
    cache.run_until_idle(store);
    let window = cache.window();
    println!(
        "rendered columns {}..{} ({} chunks each)",
        window.start,
        window.end,
        cache.chunks_in_column()
    );

    if let Some(svg_path) = svg_path {
        let mut svg = SvgWriter::new(session.scroll, session.zoom, 16.0);
        for column in window {
            if let (Some(span), Some(shapes)) = (cache.span_of_entry(column), cache.shapes(column)) {
                svg.column(span, shapes);
            }
        }
        let text = svg.finish(config.viewport_width_px, session.displayed.len());
        std::fs::write(&svg_path, text)
            .with_context(|| format!("Writing {}", svg_path.display()))?;
        println!("wrote {}", svg_path.display());
    }
    Ok(())
}

fn print_netlist(netlist: &Netlist) {
    fn show(netlist: &Netlist, id: NodeId, depth: usize) {
        let Some(node) = netlist.get(id) else {
            return;
        };
        let indent = "  ".repeat(depth);
        match &node.kind {
            NodeKind::Scope(scope) => {
                println!("{indent}{} ({})", node.name, scope.scope_type);
                for child in netlist.children(id) {
                    show(netlist, *child, depth + 1);
                }
            }
            NodeKind::Signal(signal) => {
                println!(
                    "{indent}{} {} [{}] #{}",
                    signal.var_type, node.name, signal.width, signal.signal_id
                );
            }
        }
    }

    for root in netlist.roots() {
        show(netlist, *root, 0);
    }
    println!(
        "{} scopes, {} signals",
        netlist.scope_count(),
        netlist.signal_count()
    );
}

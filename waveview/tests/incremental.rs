use wavecore::{DocumentState, LoadOptions, Loader, MemorySource, Update};
use waveview::{EntryState, SvgWriter, ViewSession, ViewportCache, ViewportConfig};

fn vcd(end: u64) -> String {
    let mut text = String::from(
        "$timescale 1ps $end
$scope module top $end
$var wire 1 ! clk $end
$var wire 4 \" nibble $end
$scope module core $end
$var real 64 # temp $end
$upscope $end
$upscope $end
$enddefinitions $end
",
    );
    for t in 0..end {
        text.push_str(&format!("#{t}\n{}!\n", t % 2));
        if t % 4 == 0 {
            text.push_str(&format!("b{:b} \"\n", (t / 4) % 16));
        }
        if t % 50 == 0 {
            text.push_str(&format!("r{}.5 #\n", t / 50));
        }
    }
    text
}

fn config() -> ViewportConfig {
    ViewportConfig {
        viewport_width_px: 1536.0,
        prefetch_columns: 1,
        ..Default::default()
    }
}

fn render(cache: &ViewportCache, session: &ViewSession) -> String {
    let mut svg = SvgWriter::new(session.scroll, session.zoom, 16.0);
    for column in cache.window() {
        svg.column(
            cache.span_of_entry(column).unwrap(),
            cache.shapes(column).unwrap(),
        );
    }
    svg.finish(config().viewport_width_px, session.displayed.len())
}

#[test]
fn test_viewport_follows_loader() {
    let _ = env_logger::builder().is_test(true).try_init();
    let text = vcd(1500);
    let loader = Loader::spawn_source(
        Box::new(MemorySource::new(text.into_bytes())),
        None,
        LoadOptions {
            transfer_chunk_len: 100,
            ..Default::default()
        },
    );

    let mut state = DocumentState::new();
    let mut view: Option<(ViewSession, ViewportCache)> = None;
    let mut shallow_seen = false;
    for event in loader.events().iter() {
        match state.apply(event) {
            Some(Update::ChunkingReady) => {
                let store = state.store().unwrap();
                let chunking = store.chunking().unwrap().clone();
                let mut session = ViewSession::new(&chunking);
                let netlist = store.netlist();
                for (id, _, _) in netlist.signals() {
                    session.display(netlist, id);
                }
                let mut cache = ViewportCache::new(config(), chunking);
                cache.set_window(&session, store);
                // No transitions yet, only rulers.
                shallow_seen = cache
                    .window()
                    .all(|c| cache.state(c) == Some(EntryState::ShallowPending));
                view = Some((session, cache));
            }
            Some(Update::SignalReady(signal)) => {
                let store = state.store().unwrap();
                let (_, cache) = view.as_mut().unwrap();
                cache.on_new_transition_data(signal, store);
                // Let it get part way before the next signal arrives.
                cache.run_slice(store);
            }
            Some(Update::Failed(reason)) => panic!("{reason}"),
            _ => {}
        }
    }
    assert!(state.is_finished());
    assert!(shallow_seen);

    let store = state.store().unwrap();
    let (session, mut cache) = view.unwrap();
    cache.run_until_idle(store);
    assert_eq!(cache.in_flight(), 0);
    assert_eq!(cache.window(), 0..4);
    assert!(cache
        .window()
        .all(|c| cache.state(c) == Some(EntryState::Ready)));

    // The same view rendered in one go from the finished store.
    let mut fresh = ViewportCache::new(config(), store.chunking().unwrap().clone());
    fresh.set_window(&session, store);
    fresh.run_until_idle(store);
    assert_eq!(render(&cache, &session), render(&fresh, &session));
}

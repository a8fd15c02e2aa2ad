use std::path::PathBuf;

use wavecore::{
    load_document, DiskSource, DocumentState, FileFormat, LoadOptions, Loader, NumericFormat,
};

const TRACE: &str = "$date
  Mon Jan  1 00:00:00 2024
$end
$version
  testbench 1.0
$end
$timescale 10ps $end
$scope module tb $end
$var wire 1 ! clk $end
$var reg 8 \" data [7:0] $end
$scope module dut $end
$var wire 1 ! clk_in $end
$var real 64 # level $end
$upscope $end
$upscope $end
$enddefinitions $end
$dumpvars
0!
bxxxxxxxx \"
r0 #
$end
#10
1!
b1010 \"
#20
0!
r2.5 #
#30
1!
b11111111 \"
#40
0!
";

fn write_trace(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("wavecore-{}-{name}.vcd", std::process::id()));
    std::fs::write(&path, TRACE).unwrap();
    path
}

#[test]
fn test_loader_matches_direct_load() {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = write_trace("direct");

    let options = LoadOptions {
        chunk_size: 7,
        transfer_chunk_len: 3,
        ..Default::default()
    };
    let mut state = DocumentState::new();
    Loader::spawn(&path, options.clone()).finish_into(&mut state);
    assert!(state.is_finished(), "{:?}", state.failure());

    let mut source = DiskSource::open(&path).unwrap();
    let direct = load_document(&mut source, Some(path.as_path()), &options).unwrap();
    std::fs::remove_file(&path).unwrap();

    let loaded = state.store().unwrap();
    assert_eq!(loaded.chunking(), direct.store.chunking());
    for signal in direct.store.loaded_signals() {
        assert_eq!(
            loaded.sequence(signal).unwrap().transitions(),
            direct.store.sequence(signal).unwrap().transitions()
        );
        assert_eq!(
            loaded.sequence(signal).unwrap().chunk_start(),
            direct.store.sequence(signal).unwrap().chunk_start()
        );
    }

    let metadata = loaded.metadata();
    assert_eq!(metadata.format, FileFormat::Vcd);
    assert_eq!((metadata.time_scale, metadata.time_unit.as_str()), (10, "ps"));
    assert_eq!(metadata.module_count, 2);
    assert_eq!(metadata.signal_count, 4);
    assert_eq!(metadata.time_end, 41);
    assert!(metadata.version.contains("testbench"));

    // `tb.clk` and `tb.dut.clk_in` share one sequence.
    let netlist = loaded.netlist();
    let clk = netlist.get(netlist.find("tb.clk").unwrap()).unwrap();
    let clk_in = netlist.get(netlist.find("tb.dut.clk_in").unwrap()).unwrap();
    assert_eq!(clk.signal().unwrap().signal, clk_in.signal().unwrap().signal);

    let data = netlist.find("tb.data[7:0]").unwrap();
    let data_ref = netlist.get(data).unwrap().signal().unwrap().signal;
    let at = loaded.value_at_time(data_ref, 15).unwrap();
    assert_eq!(at.value.as_str(), "00001010");
    assert_eq!(at.since, 10);
    assert!(!at.changed);
    assert_eq!(at.value.format(NumericFormat::Hex), "0a");

    let level = netlist.find("tb.dut.level").unwrap();
    let level_ref = netlist.get(level).unwrap().signal().unwrap().signal;
    let at = loaded.value_at_time(level_ref, 20).unwrap();
    assert_eq!(at.value.as_str(), "2.5");
    assert!(at.changed);
}

#[test]
fn test_missing_file_fails() {
    let path = std::env::temp_dir().join("wavecore-this-file-does-not-exist.vcd");
    let mut state = DocumentState::new();
    Loader::spawn(&path, LoadOptions::default()).finish_into(&mut state);
    assert!(!state.is_finished());
    assert!(state.failure().unwrap().starts_with("Opening"));
}

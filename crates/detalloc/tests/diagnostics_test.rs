//! The log sink is process-wide, so it is exercised by a single test.

use std::{fmt, sync::Mutex};

use detalloc::{AllocatorFlags, Config, DetAllocator, LogLevel, PoolConfig, log, required_size};

static RECORDS: Mutex<Vec<(LogLevel, String)>> = Mutex::new(Vec::new());

fn capture(level: LogLevel, message: fmt::Arguments<'_>) {
    RECORDS.lock().unwrap().push((level, message.to_string()));
}

fn take_records() -> Vec<(LogLevel, String)> {
    std::mem::take(&mut *RECORDS.lock().unwrap())
}

#[test]
fn diagnostics_reach_the_log_sink() {
    log::set_sink(Some(capture));
    log::set_max_level(LogLevel::Info);

    let config = Config::from_pools(&[PoolConfig::new(32, 2), PoolConfig::new(64, 2)])
        .unwrap()
        .with_flags(AllocatorFlags::STATS | AllocatorFlags::VALIDATION);
    let mut buffer = vec![0_u8; required_size(&config).unwrap()];
    let mut allocator = DetAllocator::init(&mut buffer, &config).unwrap();

    let records = take_records();
    assert!(
        records
            .iter()
            .any(|(level, msg)| *level == LogLevel::Info && msg.starts_with("allocator initialized"))
    );
    // Per-pool details are below the threshold.
    assert!(records.iter().all(|(level, _)| *level >= LogLevel::Info));

    // Successful operations stay silent.
    let ptr = allocator.alloc(40).unwrap();
    allocator.free(ptr.as_ptr()).unwrap();
    assert!(take_records().is_empty());

    allocator.alloc(100).unwrap_err();
    let records = take_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, LogLevel::Warn);
    assert!(records[0].1.starts_with("no size class fits the request"));

    allocator.debug_print();
    let lines: Vec<_> = take_records().into_iter().map(|(_, msg)| msg).collect();
    assert!(lines[0].starts_with("detalloc "));
    assert!(lines.iter().any(|line| line.starts_with("operations: allocs=1, frees=1, failed=0")));
    assert_eq!(lines.last().map(String::as_str), Some("validation: ok"));

    let mut report = String::new();
    allocator.write_report(&mut report).unwrap();
    assert_eq!(report.lines().collect::<Vec<_>>(), lines);

    allocator.destroy().unwrap();
    let records = take_records();
    assert!(records[0].1.starts_with("allocator destroyed"));
    let mut report = String::new();
    allocator.write_report(&mut report).unwrap();
    assert_eq!(report, "allocator not initialized\n");

    log::set_sink(None);
    allocator.alloc(1).unwrap_err();
    assert!(take_records().is_empty());
}

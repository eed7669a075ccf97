use criterion::{black_box, criterion_group, criterion_main, Criterion};
use muxherd::layout::TabSpec;
use muxherd::process::{find_matches, parse_ps_line, ProcessEntry, TabPattern};
use std::path::Path;

// ── Helpers ─────────────────────────────────────────────────────────

const PROGRAMS: &[&str] = &[
    "/usr/bin/python3 -m http.server 8080",
    "node /srv/app/server.js --port 3000",
    "tail -f /var/log/syslog",
    "cargo watch -x test",
    "/bin/bash --login",
    "ssh -N -L 5432:localhost:5432 db",
    "htop",
    "vim /home/bench/notes.md",
];

fn make_table(n: usize) -> Vec<ProcessEntry> {
    (0..n)
        .map(|i| {
            let cmdline = PROGRAMS[i % PROGRAMS.len()].to_string();
            let name = cmdline
                .split_whitespace()
                .next()
                .and_then(|p| p.rsplit('/').next())
                .unwrap_or_default()
                .to_string();
            ProcessEntry {
                pid: 1000 + i as u32,
                name,
                cmdline,
                status: "S".to_string(),
                start_time: Some(1_700_000_000 + i as u64),
            }
        })
        .collect()
}

// ── Benchmarks ──────────────────────────────────────────────────────

fn bench_find_matches(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_matches");
    let home = Path::new("/home/bench");
    let tab = TabSpec::new("notes", "~", "vim ~/notes.md");

    for n in [100, 1_000, 10_000] {
        let table = make_table(n);
        group.bench_function(format!("{n}_processes"), |b| {
            b.iter(|| find_matches(black_box(&tab), black_box(&table), Some(home), Some(1), None));
        });
    }

    group.finish();
}

fn bench_pattern_new(c: &mut Criterion) {
    let home = Path::new("/home/bench");
    c.bench_function("tab_pattern_new", |b| {
        b.iter(|| TabPattern::new(black_box("python3 -m http.server 8080 --directory ~/www"), Some(home)));
    });
}

fn bench_parse_ps_line(c: &mut Criterion) {
    let line = "  4242 Tue Oct 14 09:15:02 2025 Ss   node /srv/app/server.js --port 3000";
    c.bench_function("parse_ps_line", |b| {
        b.iter(|| parse_ps_line(black_box(line)));
    });
}

criterion_group!(benches, bench_find_matches, bench_pattern_new, bench_parse_ps_line);
criterion_main!(benches);

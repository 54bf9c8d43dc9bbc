use criterion::{criterion_group, criterion_main, Criterion};
use std::io::BufReader;

use apfs_reader::{Container, EntryKind};

fn open_appfs() -> Option<BufReader<std::fs::File>> {
    let path = std::path::Path::new("tests/appfs.raw");
    if !path.exists() {
        return None;
    }
    let file = std::fs::File::open(path).ok()?;
    Some(BufReader::new(file))
}

fn bench_open(c: &mut Criterion) {
    if open_appfs().is_none() {
        eprintln!("Skipping benchmarks - appfs.raw not found");
        return;
    }

    c.bench_function("apfs_open", |b| {
        b.iter(|| {
            let reader = open_appfs().unwrap();
            let _container = Container::open(reader).unwrap();
        })
    });
}

fn bench_list_root(c: &mut Criterion) {
    let reader = match open_appfs() {
        Some(r) => r,
        None => return,
    };

    let container = Container::open(reader).unwrap();
    let volume = container.volume_by_index(0).unwrap();

    c.bench_function("apfs_list_root", |b| {
        b.iter(|| {
            let _entries = volume.list_directory("/").unwrap();
        })
    });
}

fn bench_walk_all(c: &mut Criterion) {
    if open_appfs().is_none() {
        return;
    }

    c.bench_function("apfs_walk_all", |b| {
        b.iter(|| {
            let reader = open_appfs().unwrap();
            let container = Container::open(reader).unwrap();
            let volume = container.volume_by_index(0).unwrap();
            let _entries = volume.walk().unwrap();
        })
    });
}

fn bench_stat(c: &mut Criterion) {
    let reader = match open_appfs() {
        Some(r) => r,
        None => return,
    };

    let container = Container::open(reader).unwrap();
    let volume = container.volume_by_index(0).unwrap();

    let walk = volume.walk().unwrap();
    let file_path = walk
        .iter()
        .find(|e| e.entry.kind == EntryKind::File && e.entry.size > 0)
        .map(|e| e.path.clone());

    if let Some(path) = file_path {
        c.bench_function("apfs_stat", |b| {
            b.iter(|| {
                let _stat = volume.stat(&path).unwrap();
            })
        });
    }
}

fn bench_read_small_file(c: &mut Criterion) {
    let reader = match open_appfs() {
        Some(r) => r,
        None => return,
    };

    let container = Container::open(reader).unwrap();
    let volume = container.volume_by_index(0).unwrap();

    let walk = volume.walk().unwrap();
    let file_path = walk
        .iter()
        .find(|e| e.entry.kind == EntryKind::File && e.entry.size > 0 && e.entry.size < 100_000)
        .map(|e| e.path.clone());

    if let Some(path) = file_path {
        c.bench_function("apfs_read_small_file", |b| {
            b.iter(|| {
                let _data = volume.read_file(&path).unwrap();
            })
        });
    }
}

fn bench_stat_many(c: &mut Criterion) {
    let reader = match open_appfs() {
        Some(r) => r,
        None => return,
    };

    let container = Container::open(reader).unwrap();
    let volume = container.volume_by_index(0).unwrap();

    let walk = volume.walk().unwrap();
    let file_paths: Vec<_> = walk
        .iter()
        .filter(|e| e.entry.kind == EntryKind::File)
        .take(50)
        .map(|e| e.path.clone())
        .collect();

    if file_paths.is_empty() {
        return;
    }

    c.bench_function("apfs_stat_many", |b| {
        b.iter(|| {
            for path in &file_paths {
                let _ = volume.stat(path).unwrap();
            }
        })
    });
}

fn bench_read_large_file(c: &mut Criterion) {
    let reader = match open_appfs() {
        Some(r) => r,
        None => return,
    };

    let container = Container::open(reader).unwrap();
    let volume = container.volume_by_index(0).unwrap();

    let walk = volume.walk().unwrap();
    let file_path = walk
        .iter()
        .find(|e| e.entry.kind == EntryKind::File && e.entry.size > 1_000_000)
        .map(|e| e.path.clone());

    if let Some(path) = file_path {
        c.bench_function("apfs_read_large_file", |b| {
            b.iter(|| {
                let _data = volume.read_file(&path).unwrap();
            })
        });
    }
}

criterion_group!(
    benches,
    bench_open,
    bench_list_root,
    bench_walk_all,
    bench_stat,
    bench_read_small_file,
    bench_stat_many,
    bench_read_large_file
);
criterion_main!(benches);

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use geo_types::{polygon, LineString};
use integrator::config::Tolerances;
use integrator::conflation::ConflationEngine;
use integrator::geometry::clip_line_to_polygon;
use integrator::models::{RoadFeature, SourceLayer};

fn road(alias: &str, coords: Vec<(f64, f64)>) -> RoadFeature {
    RoadFeature {
        alias: alias.to_string(),
        key: String::new(),
        attributes: BTreeMap::new(),
        source_name: alias.to_uppercase(),
        extraction_date: "2026-01-15".to_string(),
        map_tile: "bench".to_string(),
        geometry: LineString::from(coords),
    }
}

/// `rows` east-west roads 50m apart per source. Each lower source repeats
/// the roads above it with a small offset and adds a north-south road.
fn layers(rows: usize) -> Vec<SourceLayer> {
    let sources = [("dra", 0.0), ("ften", 2.5), ("og", -4.0)];
    sources
        .iter()
        .enumerate()
        .map(|(rank, (alias, offset))| {
            let mut features: Vec<RoadFeature> = (0..rows)
                .map(|row| {
                    let y = row as f64 * 50.0 + offset;
                    let coords = (0..=20).map(|step| (step as f64 * 100.0, y)).collect();
                    road(alias, coords)
                })
                .collect();
            let x = 75.0 + rank as f64 * 300.0;
            features.push(road(alias, vec![(x, 0.0), (x, rows as f64 * 50.0)]));
            SourceLayer::new(*alias, rank as u32 + 1, features)
        })
        .collect()
}

fn benchmark_conflate_tile(c: &mut Criterion) {
    let engine = ConflationEngine::with_geo_backend(Tolerances::default());
    let mut group = c.benchmark_group("conflate_tile");

    for rows in [10, 50, 200] {
        let input = layers(rows);
        group.bench_with_input(BenchmarkId::from_parameter(rows), &input, |b, input| {
            b.iter(|| engine.conflate("bench", black_box(input.clone())));
        });
    }

    group.finish();
}

fn benchmark_clip_to_tile(c: &mut Criterion) {
    let tile = polygon![
        (x: 0.0, y: 0.0),
        (x: 1000.0, y: 0.0),
        (x: 1000.0, y: 1000.0),
        (x: 0.0, y: 1000.0),
    ];
    // zigzag crossing the tile boundary many times
    let coords: Vec<(f64, f64)> = (0..500)
        .map(|i| (i as f64 * 5.0 - 250.0, if i % 2 == 0 { -50.0 } else { 1050.0 }))
        .collect();
    let line = LineString::from(coords);

    c.bench_function("clip_line_to_polygon", |b| {
        b.iter(|| clip_line_to_polygon(black_box(&line), black_box(&tile)));
    });
}

criterion_group!(benches, benchmark_conflate_tile, benchmark_clip_to_tile);
criterion_main!(benches);

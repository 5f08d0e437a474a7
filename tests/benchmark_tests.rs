//! Performance benchmarks for the tick and framing hot paths

use server::game::{World, WorldSettings};
use server::transport::ChannelId;
use shared::{ClientMessage, FrameBuffer, Snapshot};
use std::time::{Duration, Instant};

fn busy_world(players: u64, bullets: usize, items: usize) -> World {
    let mut world = World::new(WorldSettings {
        tick_duration: Duration::from_millis(50),
        item_spawn_interval: Duration::from_secs(5),
        seed: Some(99),
    });

    for channel in 1..=players {
        world.add_player(ChannelId(channel), None);
    }
    for i in 0..bullets {
        let angle = i as f64 * 0.1;
        world.spawn_bullet("P1", 300, 200, angle.cos(), angle.sin());
    }
    for i in 0..items {
        world.spawn_item_at(50 + (i as i32 * 37) % 500, 50 + (i as i32 * 53) % 300);
    }
    world
}

/// Benchmarks one world tick with a crowded play field
#[test]
fn benchmark_world_tick() {
    let iterations = 1_000;
    let mut total = Duration::ZERO;

    for _ in 0..iterations {
        let mut world = busy_world(64, 200, 50);
        let start = Instant::now();
        let snapshot = world.tick();
        total += start.elapsed();
        assert!(snapshot.is_some());
    }

    println!(
        "World tick: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        total,
        total.as_micros() as f64 / iterations as f64
    );

    // A 20 Hz tick has 50ms; the simulation should use a tiny slice of it
    assert!(total.as_millis() / iterations < 5);
}

/// Benchmarks snapshot serialization
#[test]
fn benchmark_snapshot_encode() {
    let mut world = busy_world(64, 200, 50);
    let snapshot: Snapshot = world.tick().unwrap();

    let iterations = 1_000;
    let start = Instant::now();
    let mut bytes = 0;

    for _ in 0..iterations {
        bytes += snapshot.encode().unwrap().len();
    }

    let duration = start.elapsed();
    println!(
        "Snapshot encode: {} iterations, {} bytes in {:?} ({:.2} μs/iter)",
        iterations,
        bytes,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks framing of a byte stream delivered in small chunks
#[test]
fn benchmark_framing() {
    let message = ClientMessage::Move { x: 123, y: 321 }.encode().unwrap();
    let stream: Vec<u8> = message.iter().copied().cycle().take(message.len() * 10_000).collect();

    let start = Instant::now();
    let mut buffer = FrameBuffer::new();
    let mut count = 0;

    for chunk in stream.chunks(7) {
        count += buffer.push(chunk).count();
    }

    let duration = start.elapsed();
    println!(
        "Framing: {} messages from {} bytes in {:?}",
        count,
        stream.len(),
        duration
    );

    assert_eq!(count, 10_000);
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks inbound message decoding
#[test]
fn benchmark_message_decode() {
    let line = br#"{"action":"shoot","x":100,"y":100,"dx":0.6,"dy":0.8,"player":"Alice"}"#;

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let _ = ClientMessage::decode(line).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Message decode: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

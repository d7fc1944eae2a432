use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000;
/// Hours reserved per run, so repeated runs against one server rarely collide.
const RUN_HOURS: i64 = 10_000;

struct Target {
    host: String,
    port: u16,
    service_user: String,
    password: String,
}

impl Target {
    async fn connect_as(&self, user: &str) -> Client {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname("chalet")
            .user(user)
            .password(&self.password);

        let (client, conn) = config.connect(NoTls).await.expect("connect failed");
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                eprintln!("connection error: {e}");
            }
        });
        client
    }

    /// Register a throwaway user and return a session acting as them.
    async fn guest(&self) -> Client {
        let anon = self.connect_as(&self.service_user).await;
        let id = Ulid::new();
        anon.batch_execute(&format!(
            "INSERT INTO users (id, name, email, password) VALUES ('{id}', 'Bench {id}', 'bench-{id}@chalet.test', 'benchmark')"
        ))
        .await
        .unwrap();
        self.connect_as(&id.to_string()).await
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn insert_sql(start: i64, end: i64) -> String {
    format!(
        r#"INSERT INTO bookings (id, start, "end") VALUES ('{}', {start}, {end})"#,
        Ulid::new()
    )
}

async fn phase1_sequential(target: &Target, base: i64) {
    let client = target.guest().await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = base + (i as i64) * HOUR;
        let t = Instant::now();
        client.batch_execute(&insert_sql(s, s + HOUR)).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Every guest races for the same slots. Exactly one insert per slot may win.
async fn phase2_contended(target: &Arc<Target>, base: i64) {
    let n_guests = 16;
    let n_slots = 200;
    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));

    let mut guests = Vec::with_capacity(n_guests);
    for _ in 0..n_guests {
        guests.push(target.guest().await);
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for client in guests {
        let wins = wins.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            for slot in 0..n_slots {
                let s = base + slot * HOUR;
                match client.batch_execute(&insert_sql(s, s + HOUR)).await {
                    Ok(()) => wins.fetch_add(1, Ordering::Relaxed),
                    Err(_) => conflicts.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let wins = wins.load(Ordering::Relaxed);
    let conflicts = conflicts.load(Ordering::Relaxed);
    println!(
        "  {n_guests} guests x {n_slots} slots: {wins} won, {conflicts} rejected in {:.2}s",
        elapsed.as_secs_f64()
    );
    if wins != n_slots as usize {
        println!("  !! expected exactly {n_slots} winners");
    }
}

async fn phase3_read_under_load(target: &Arc<Target>, base: i64) {
    let stop = Arc::new(AtomicBool::new(false));

    let mut writer_handles = Vec::new();
    for w in 0..4i64 {
        let stop = stop.clone();
        let client = target.guest().await;
        writer_handles.push(tokio::spawn(async move {
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) && i < 1000 {
                let s = base + (w * 1000 + i) * HOUR;
                let _ = client.batch_execute(&insert_sql(s, s + HOUR)).await;
                i += 1;
            }
        }));
    }

    let reader = target.guest().await;
    let n_reads = 500;
    let mut latencies = Vec::with_capacity(n_reads);
    for i in 0..n_reads as i64 {
        let s = base + (i % 4000) * HOUR;
        let t = Instant::now();
        reader
            .simple_query(&format!(
                r#"SELECT * FROM free_windows WHERE start >= {s} AND "end" <= {}"#,
                s + 48 * HOUR
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("free_windows latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    let target = Arc::new(Target {
        host: std::env::var("CHALET_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("CHALET_PORT")
            .unwrap_or_else(|_| "5433".into())
            .parse()
            .expect("invalid CHALET_PORT"),
        service_user: std::env::var("CHALET_SERVICE_USER").unwrap_or_else(|_| "chalet".into()),
        password: std::env::var("CHALET_PASSWORD").unwrap_or_else(|_| "chalet".into()),
    });

    // Bookings share one timeline, so each run and each phase gets its own hours.
    let base = ((Ulid::new().random() % 5000) as i64) * RUN_HOURS * HOUR;

    println!("=== chalet contention benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&target, base).await;

    println!("\n[phase 2] contended writes on shared slots");
    phase2_contended(&target, base + 2500 * HOUR).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&target, base + 3000 * HOUR).await;

    println!("\n=== benchmark complete ===");
}

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, Utc};
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const MINUTE: i64 = 60_000;
const OPEN_MIN: i64 = 540;
const SLOTS_PER_DAY: i64 = 18;

async fn connect(host: &str, port: u16, password: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("slotwise")
        .user("bench")
        .password(password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
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

/// Start instant of the `n`th 30-minute slot counted from `first_day` at opening time.
fn slot_start(first_day: NaiveDate, n: i64) -> i64 {
    let day = first_day + Days::new((n / SLOTS_PER_DAY) as u64);
    let midnight = day.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis();
    midnight + (OPEN_MIN + (n % SLOTS_PER_DAY) * 30) * MINUTE
}

struct Shop {
    service: Ulid,
    staff: Vec<Ulid>,
}

async fn setup(client: &Client, staff_count: usize) -> Shop {
    let service = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO services (id, name, duration_min) VALUES ('{service}', 'bench cut', 30)"
        ))
        .await
        .unwrap();

    let mut staff = Vec::new();
    for i in 0..staff_count {
        let id = Ulid::new();
        client
            .batch_execute(&format!(
                "INSERT INTO staff (id, name) VALUES ('{id}', 'bench-{i}');
                 INSERT INTO staff_services (staff_id, service_id) VALUES ('{id}', '{service}');"
            ))
            .await
            .unwrap();
        for weekday in 0..7 {
            client
                .batch_execute(&format!(
                    "INSERT INTO working_hours (staff_id, weekday, start_min, end_min) VALUES ('{id}', {weekday}, 540, 1080)"
                ))
                .await
                .unwrap();
        }
        staff.push(id);
    }

    println!("  created {} staff offering one service", staff.len());
    Shop { service, staff }
}

fn booking_sql(shop: &Shop, staff: Ulid, start: i64, session: Option<&str>) -> String {
    let session = session.map_or_else(|| "NULL".to_string(), |s| format!("'{s}'"));
    format!(
        r#"INSERT INTO appointments (id, staff_id, service_id, start, "end", customer_name, customer_email, customer_phone, session_id)
           VALUES ('{}', '{staff}', '{}', {start}, {}, 'Bench Customer', 'bench@example.com', NULL, {session})"#,
        Ulid::new(),
        shop.service,
        start + 30 * MINUTE,
    )
}

async fn phase1_sequential(host: &str, port: u16, password: &str, shop: &Shop, first_day: NaiveDate) {
    let client = connect(host, port, password).await;
    let staff = shop.staff[0];
    let n = 500;
    let mut latencies = Vec::with_capacity(n);

    let started = Instant::now();
    for i in 0..n as i64 {
        let sql = booking_sql(shop, staff, slot_start(first_day, i), None);
        let t = Instant::now();
        client.batch_execute(&sql).await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = started.elapsed();

    println!(
        "  {n} bookings in {:.2}s ({:.0} ops/s)",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("book", &mut latencies);
}

/// Every client races for the same slot each round. Exactly one must win.
async fn phase2_same_slot(host: &str, port: u16, password: &str, shop: Arc<Shop>, first_day: NaiveDate) {
    let racers = 32;
    let rounds = 50;
    let staff = shop.staff[1 % shop.staff.len()];
    let mut clients = Vec::with_capacity(racers);
    for _ in 0..racers {
        clients.push(Arc::new(connect(host, port, password).await));
    }

    let mut latencies = Vec::new();
    let mut bad_rounds = 0;
    let started = Instant::now();
    for round in 0..rounds {
        let start = slot_start(first_day, round);
        let end = start + 30 * MINUTE;
        let winners = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(racers);
        for (i, client) in clients.iter().enumerate() {
            let client = client.clone();
            let winners = winners.clone();
            handles.push(tokio::spawn(async move {
                let sql = format!(
                    r#"INSERT INTO reservations (staff_id, start, "end", session_id) VALUES ('{staff}', {start}, {end}, 'race-{round}-{i}')"#
                );
                let t = Instant::now();
                match client.simple_query(&sql).await {
                    Ok(_) => {
                        winners.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let code = e.as_db_error().map(|db| db.code().code().to_string());
                        if code.as_deref() != Some("23P01") {
                            eprintln!("unexpected error: {e}");
                        }
                    }
                }
                t.elapsed()
            }));
        }
        for h in handles {
            latencies.push(h.await.unwrap());
        }
        if winners.load(Ordering::Relaxed) != 1 {
            bad_rounds += 1;
        }
    }
    let elapsed = started.elapsed();

    println!(
        "  {rounds} rounds x {racers} racers in {:.2}s, rounds without exactly one winner: {bad_rounds}",
        elapsed.as_secs_f64()
    );
    print_latency("reserve (contended)", &mut latencies);
}

/// Hold then commit, one session per client, each on its own staff member.
async fn phase3_hold_and_commit(host: &str, port: u16, password: &str, shop: Arc<Shop>, first_day: NaiveDate) {
    let per_client = 100;
    let mut handles = Vec::new();
    let started = Instant::now();

    for (c, &staff) in shop.staff.iter().enumerate().skip(2) {
        let shop = shop.clone();
        let client = connect(host, port, password).await;
        handles.push(tokio::spawn(async move {
            let mut holds = Vec::with_capacity(per_client);
            let mut commits = Vec::with_capacity(per_client);
            for i in 0..per_client as i64 {
                let start = slot_start(first_day, i);
                let session = format!("cart-{c}-{i}");
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        r#"INSERT INTO reservations (staff_id, start, "end", session_id) VALUES ('{staff}', {start}, {}, '{session}')"#,
                        start + 30 * MINUTE
                    ))
                    .await
                    .unwrap();
                holds.push(t.elapsed());

                let t = Instant::now();
                client
                    .batch_execute(&booking_sql(&shop, staff, start, Some(&session)))
                    .await
                    .unwrap();
                commits.push(t.elapsed());
            }
            (holds, commits)
        }));
    }

    let mut holds = Vec::new();
    let mut commits = Vec::new();
    for h in handles {
        let (h, c) = h.await.unwrap();
        holds.extend(h);
        commits.extend(c);
    }
    let elapsed = started.elapsed();

    println!(
        "  {} hold+commit pairs in {:.2}s ({:.0} pairs/s)",
        commits.len(),
        elapsed.as_secs_f64(),
        commits.len() as f64 / elapsed.as_secs_f64()
    );
    print_latency("reserve", &mut holds);
    print_latency("commit", &mut commits);
}

async fn phase4_reads_under_load(host: &str, port: u16, password: &str, shop: Arc<Shop>, first_day: NaiveDate) {
    let staff = shop.staff[0];
    let writer_shop = shop.clone();
    let writer_client = connect(host, port, password).await;
    let writer = tokio::spawn(async move {
        // Phase 1 filled the first 500 slots of this staff member.
        for i in 500..800 {
            let _ = writer_client
                .batch_execute(&booking_sql(&writer_shop, staff, slot_start(first_day, i), None))
                .await;
        }
    });

    let reader = connect(host, port, password).await;
    let mut latencies = Vec::new();
    for i in 0..300u64 {
        let date = first_day + Days::new(i % 45);
        let t = Instant::now();
        reader
            .simple_query(&format!(
                "SELECT * FROM availability WHERE staff_id = '{staff}' AND date = '{date}' AND duration_min = 30"
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    writer.await.unwrap();

    print_latency("availability (day)", &mut latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTWISE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTWISE_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTWISE_PORT");
    let password = std::env::var("SLOTWISE_PASSWORD").unwrap_or_else(|_| "slotwise".into());

    println!("=== slotwise contention benchmark ===");
    println!("target: {host}:{port}\n");

    // Far enough ahead that lead time and the today buffer never apply.
    let first_day = Utc::now().date_naive() + Days::new(30);

    println!("[setup]");
    let setup_client = connect(&host, port, &password).await;
    let shop = Arc::new(setup(&setup_client, 8).await);
    drop(setup_client);

    println!("\n[phase 1] sequential bookings, one staff member");
    phase1_sequential(&host, port, &password, &shop, first_day).await;

    println!("\n[phase 2] many sessions racing for one slot");
    phase2_same_slot(&host, port, &password, shop.clone(), first_day).await;

    println!("\n[phase 3] hold then commit, one client per staff member");
    phase3_hold_and_commit(&host, port, &password, shop.clone(), first_day).await;

    println!("\n[phase 4] availability reads under booking load");
    phase4_reads_under_load(&host, port, &password, shop, first_day).await;

    println!("\n=== benchmark complete ===");
}

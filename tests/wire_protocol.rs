use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotwise::clock::SystemClock;
use slotwise::config::Policy;
use slotwise::engine::Engine;
use slotwise::wire::{self, SlotwiseFactory};

const PASSWORD: &str = "slotwise";

// ── Test infrastructure ──────────────────────────────────────

struct TestServer {
    addr: SocketAddr,
    _dir: TempDir,
}

async fn start_test_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(&dir.path().join("slotwise.wal"), Policy::default(), Arc::new(SystemClock)).unwrap();
    let factory = Arc::new(SlotwiseFactory::new(Arc::new(engine), PASSWORD.to_string()));

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    TestServer { addr, _dir: dir }
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotwise")
        .user("app")
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn query_error(client: &Client, sql: &str) -> tokio_postgres::Error {
    match client.simple_query(sql).await {
        Ok(_) => panic!("expected an error from: {sql}"),
        Err(e) => e,
    }
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = query_error(client, sql).await;
    err.as_db_error().unwrap().code().code().to_string()
}

/// A week from now, so lead times and "today" trimming never interfere.
fn next_week() -> NaiveDate {
    Utc::now().date_naive() + Days::new(7)
}

/// Millisecond instant of `minutes` after midnight UTC on `date`.
fn at(date: NaiveDate, minutes: i64) -> i64 {
    date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis() + minutes * 60_000
}

struct Salon {
    staff: Ulid,
    haircut: Ulid,
}

/// One staff member open 09:00–18:00 every day, offering a 30-minute haircut.
async fn salon(client: &Client) -> Salon {
    let (staff, haircut) = (Ulid::new(), Ulid::new());
    client
        .batch_execute(&format!(
            "INSERT INTO services (id, name, duration_min) VALUES ('{haircut}', 'Haircut', 30);
             INSERT INTO staff (id, name) VALUES ('{staff}', 'Ana');
             INSERT INTO staff_services (staff_id, service_id) VALUES ('{staff}', '{haircut}');"
        ))
        .await
        .unwrap();
    for weekday in 0..7 {
        client
            .batch_execute(&format!(
                "INSERT INTO working_hours (staff_id, weekday, start_min, end_min) VALUES ('{staff}', {weekday}, 540, 1080)"
            ))
            .await
            .unwrap();
    }
    Salon { staff, haircut }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn catalog_and_availability_roundtrip() {
    let server = start_test_server().await;
    let client = connect(server.addr).await;
    let Salon { staff, haircut } = salon(&client).await;

    let services = rows(&client, "SELECT * FROM services").await;
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].get("name"), Some("Haircut"));

    let listed = rows(&client, "SELECT * FROM staff").await;
    assert_eq!(listed[0].get("service_ids"), Some(haircut.to_string().as_str()));

    let day = next_week();
    let slots = rows(
        &client,
        &format!("SELECT * FROM availability WHERE staff_id = '{staff}' AND date = '{day}' AND duration_min = 30"),
    )
    .await;
    assert_eq!(slots.len(), 18);
    assert_eq!(slots[0].get("start"), Some(at(day, 540).to_string().as_str()));
    assert_eq!(slots[0].get("split_required"), Some("f"));

    let month = format!("{}", day.format("%Y-%m"));
    let counts = rows(
        &client,
        &format!("SELECT * FROM month_availability WHERE staff_id = '{staff}' AND month = '{month}' AND service_ids = '{haircut}'"),
    )
    .await;
    let row = counts
        .iter()
        .find(|r| r.get("date") == Some(day.to_string().as_str()))
        .unwrap();
    assert_eq!(row.get("slots"), Some("18"));
}

#[tokio::test]
async fn reserve_commit_and_conflicts() {
    let server = start_test_server().await;
    let client = connect(server.addr).await;
    let Salon { staff, haircut } = salon(&client).await;
    let day = next_week();
    let (start, end) = (at(day, 600), at(day, 630));

    let held = rows(
        &client,
        &format!(r#"INSERT INTO reservations (staff_id, start, "end", session_id) VALUES ('{staff}', {start}, {end}, 'cart-1')"#),
    )
    .await;
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].get("session_id"), Some("cart-1"));

    let other = connect(server.addr).await;
    let code = sqlstate(
        &other,
        &format!(r#"INSERT INTO reservations (staff_id, start, "end", session_id) VALUES ('{staff}', {start}, {end}, 'cart-2')"#),
    )
    .await;
    assert_eq!(code, "23P01");

    let book = |id: Ulid, session: &str| {
        format!(
            r#"INSERT INTO appointments (id, staff_id, service_id, start, "end", customer_name, customer_email, customer_phone, session_id)
               VALUES ('{id}', '{staff}', '{haircut}', {start}, {end}, 'Bo', 'bo@example.com', NULL, '{session}')"#
        )
    };
    let err = query_error(&other, &book(Ulid::new(), "cart-2")).await;
    let db = err.as_db_error().unwrap();
    assert_eq!(db.code().code(), "23P01");
    assert!(db.message().starts_with("SLOT_TAKEN"));

    let appointment = Ulid::new();
    client.batch_execute(&book(appointment, "cart-1")).await.unwrap();
    assert!(rows(&client, &format!("SELECT * FROM reservations WHERE staff_id = '{staff}'")).await.is_empty());

    let listed = rows(&client, &format!("SELECT * FROM appointments WHERE staff_id = '{staff}'")).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(appointment.to_string().as_str()));
    assert_eq!(listed[0].get("status"), Some("PENDING"));

    client
        .batch_execute(&format!(
            "INSERT INTO appointment_status (appointment_id, status) VALUES ('{appointment}', 'CANCELED')"
        ))
        .await
        .unwrap();
    let one = rows(&client, &format!("SELECT * FROM appointments WHERE id = '{appointment}'")).await;
    assert_eq!(one[0].get("status"), Some("CANCELED"));
}

#[tokio::test]
async fn extended_protocol_binds_text_parameters() {
    let server = start_test_server().await;
    let client = connect(server.addr).await;
    let Salon { staff, .. } = salon(&client).await;
    let day = next_week();

    let found = client
        .query(
            "SELECT * FROM availability WHERE staff_id = $1 AND date = $2 AND duration_min = $3",
            &[&staff.to_string(), &day.to_string(), &"60"],
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 9);
    assert_eq!(found[0].get::<_, i64>("start"), at(day, 540));
    assert!(!found[0].get::<_, bool>("split_required"));

    let deleted = client
        .execute("DELETE FROM staff_services WHERE staff_id = $1 AND service_id = $2", &[
            &staff.to_string(),
            &Ulid::new().to_string(),
        ])
        .await
        .unwrap();
    assert_eq!(deleted, 0);
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let server = start_test_server().await;
    let client = connect(server.addr).await;
    let Salon { staff, .. } = salon(&client).await;
    let day = next_week();

    assert_eq!(sqlstate(&client, "SELEC nonsense").await, "42601");
    assert_eq!(
        sqlstate(
            &client,
            &format!("SELECT * FROM availability WHERE staff_id = '{staff}' AND date = '{day}' AND duration_min = 0")
        )
        .await,
        "22023"
    );
    assert_eq!(sqlstate(&client, &format!("DELETE FROM appointments WHERE id = '{}'", Ulid::new())).await, "P0002");
    assert_eq!(sqlstate(&client, &format!("INSERT INTO staff (id) VALUES ('{staff}')")).await, "23505");

    let unknown = rows(
        &client,
        &format!("SELECT * FROM availability WHERE staff_id = '{}' AND date = '{day}' AND duration_min = 30", Ulid::new()),
    )
    .await;
    assert!(unknown.is_empty());
}

#[tokio::test]
async fn organisation_time_off_blocks_the_morning() {
    let server = start_test_server().await;
    let client = connect(server.addr).await;
    let Salon { staff, .. } = salon(&client).await;
    let day = next_week();

    client
        .batch_execute(&format!(
            "INSERT INTO time_off (id, staff_id, date, start_min, end_min, reason) VALUES ('{}', NULL, '{day}', 540, 720, 'training')",
            Ulid::new()
        ))
        .await
        .unwrap();
    assert_eq!(rows(&client, "SELECT * FROM time_off").await.len(), 1);

    let slots = rows(
        &client,
        &format!("SELECT * FROM availability WHERE staff_id = '{staff}' AND date = '{day}' AND duration_min = 30"),
    )
    .await;
    assert_eq!(slots.len(), 12);
    assert_eq!(slots[0].get("start"), Some(at(day, 720).to_string().as_str()));
}

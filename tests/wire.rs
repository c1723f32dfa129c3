use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use atrium::tenant::TenantManager;
use atrium::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("atrium_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "atrium".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect_db(addr: SocketAddr, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("atrium")
        .password("atrium");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    connect_db(addr, "test").await
}

fn data_rows(messages: &[SimpleQueryMessage]) -> Vec<&SimpleQueryRow> {
    messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn insert_sql(room: &str, date: &str, start: &str, end: &str) -> String {
    format!(
        "INSERT INTO bookings (room_id, date, start_time, end_time, name, email, department, meeting_title) \
         VALUES ('{room}', '{date}', '{start}', '{end}', 'Alice', 'alice@example.com', 'Engineering', 'Planning')"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn insert_and_select_roundtrip() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(
            "INSERT INTO bookings (room_id, date, start_time, end_time, name, email, department, meeting_title, notes) \
             VALUES ('tspi-east', '2024-06-03', '09:00', '10:00', 'Alice', 'alice@example.com', 'Engineering', 'Quarterly review', 'bring projector')",
        )
        .await
        .unwrap();

    let messages = client
        .simple_query("SELECT * FROM bookings WHERE room_id = 'tspi-east' AND date = '2024-06-03'")
        .await
        .unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 1);

    let row = rows[0];
    assert!(!row.get("id").unwrap().is_empty());
    assert_eq!(row.get("room_id"), Some("tspi-east"));
    assert_eq!(row.get("date"), Some("2024-06-03"));
    assert_eq!(row.get("start_time"), Some("09:00"));
    assert_eq!(row.get("end_time"), Some("10:00"));
    assert_eq!(row.get("name"), Some("Alice"));
    assert_eq!(row.get("email"), Some("alice@example.com"));
    assert_eq!(row.get("department"), Some("Engineering"));
    assert_eq!(row.get("meeting_title"), Some("Quarterly review"));
    assert_eq!(row.get("notes"), Some("bring projector"));
    let created_at: i64 = row.get("created_at").unwrap().parse().unwrap();
    assert!(created_at > 0);
}

#[tokio::test]
async fn insert_returning_exposes_assigned_fields() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let sql = format!(
        "{} RETURNING *",
        insert_sql("tspi-east", "2024-06-03", "09:00", "10:00")
    );
    let messages = client.simple_query(&sql).await.unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 1);

    // The id is server-assigned and must parse as a ULID
    let id = rows[0].get("id").unwrap();
    Ulid::from_string(id).unwrap();
    assert_eq!(rows[0].get("start_time"), Some("09:00"));
    assert_eq!(rows[0].get("notes"), None);
}

#[tokio::test]
async fn overlapping_insert_rejected_as_exclusion_violation() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(&insert_sql("tspi-east", "2024-06-03", "09:00", "10:00"))
        .await
        .unwrap();

    let err = client
        .batch_execute(&insert_sql("tspi-east", "2024-06-03", "09:30", "10:30"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));
}

#[tokio::test]
async fn adjacent_insert_accepted() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(&insert_sql("tspi-east", "2024-06-03", "09:00", "10:00"))
        .await
        .unwrap();
    client
        .batch_execute(&insert_sql("tspi-east", "2024-06-03", "10:00", "11:00"))
        .await
        .unwrap();

    let messages = client
        .simple_query("SELECT * FROM bookings WHERE room_id = 'tspi-east'")
        .await
        .unwrap();
    assert_eq!(data_rows(&messages).len(), 2);
}

#[tokio::test]
async fn multi_row_insert_is_atomic() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(&insert_sql("tspi-east", "2024-06-03", "09:00", "10:00"))
        .await
        .unwrap();

    // First row is free, second collides; neither may land
    let err = client
        .batch_execute(
            "INSERT INTO bookings (room_id, date, start_time, end_time, name, email, department, meeting_title) VALUES \
             ('tspi-east', '2024-06-03', '08:00', '09:00', 'Alice', 'alice@example.com', 'Engineering', 'Planning'), \
             ('tspi-east', '2024-06-03', '09:30', '10:30', 'Alice', 'alice@example.com', 'Engineering', 'Planning')",
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));

    let messages = client
        .simple_query("SELECT * FROM bookings WHERE room_id = 'tspi-east' AND date = '2024-06-03'")
        .await
        .unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("start_time"), Some("09:00"));
}

#[tokio::test]
async fn self_conflicting_batch_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let err = client
        .batch_execute(
            "INSERT INTO bookings (room_id, date, start_time, end_time, name, email, department, meeting_title) VALUES \
             ('tspi-east', '2024-06-03', '09:00', '10:00', 'Alice', 'alice@example.com', 'Engineering', 'Planning'), \
             ('tspi-east', '2024-06-03', '09:30', '10:30', 'Alice', 'alice@example.com', 'Engineering', 'Planning')",
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));

    let messages = client.simple_query("SELECT * FROM bookings").await.unwrap();
    assert!(data_rows(&messages).is_empty());
}

#[tokio::test]
async fn mixed_batch_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    // Two rooms in one INSERT is not one commit request
    let err = client
        .batch_execute(
            "INSERT INTO bookings (room_id, date, start_time, end_time, name, email, department, meeting_title) VALUES \
             ('tspi-east', '2024-06-03', '09:00', '10:00', 'Alice', 'alice@example.com', 'Engineering', 'Planning'), \
             ('tspi-bess', '2024-06-03', '09:00', '10:00', 'Alice', 'alice@example.com', 'Engineering', 'Planning')",
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::FEATURE_NOT_SUPPORTED));
}

#[tokio::test]
async fn delete_booking_then_double_delete() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let sql = format!(
        "{} RETURNING *",
        insert_sql("tspi-east", "2024-06-03", "09:00", "10:00")
    );
    let messages = client.simple_query(&sql).await.unwrap();
    let id = data_rows(&messages)[0].get("id").unwrap().to_string();

    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{id}'"))
        .await
        .unwrap();

    let messages = client.simple_query("SELECT * FROM bookings").await.unwrap();
    assert!(data_rows(&messages).is_empty());

    // Second delete of the same id is an error, not a silent success
    let err = client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{id}'"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::RAISE_EXCEPTION));
}

#[tokio::test]
async fn conflicts_query_reports_overlap() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(&insert_sql("tspi-east", "2024-06-03", "09:00", "10:00"))
        .await
        .unwrap();

    let messages = client
        .simple_query(
            "SELECT * FROM conflicts WHERE room_id = 'tspi-east' AND date = '2024-06-03' \
             AND start_time = '09:30' AND end_time = '10:30'",
        )
        .await
        .unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 1);
    assert!(matches!(rows[0].get("conflict"), Some("t") | Some("true")));

    let messages = client
        .simple_query(
            "SELECT * FROM conflicts WHERE room_id = 'tspi-east' AND date = '2024-06-03' \
             AND start_time = '10:00' AND end_time = '11:00'",
        )
        .await
        .unwrap();
    let rows = data_rows(&messages);
    assert!(matches!(rows[0].get("conflict"), Some("f") | Some("false")));
}

#[tokio::test]
async fn conflicts_query_exclude_id_skips_own_booking() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let sql = format!(
        "{} RETURNING *",
        insert_sql("tspi-east", "2024-06-03", "09:00", "10:00")
    );
    let messages = client.simple_query(&sql).await.unwrap();
    let id = data_rows(&messages)[0].get("id").unwrap().to_string();

    let messages = client
        .simple_query(&format!(
            "SELECT * FROM conflicts WHERE room_id = 'tspi-east' AND date = '2024-06-03' \
             AND start_time = '09:00' AND end_time = '11:00' AND exclude_id = '{id}'"
        ))
        .await
        .unwrap();
    assert!(matches!(
        data_rows(&messages)[0].get("conflict"),
        Some("f") | Some("false")
    ));
}

#[tokio::test]
async fn malformed_time_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let err = client
        .batch_execute(&insert_sql("tspi-east", "2024-06-03", "9:00", "10:00"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::INVALID_DATETIME_FORMAT));

    let err = client
        .batch_execute(&insert_sql("tspi-east", "2024-06-03", "10:00", "09:00"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::INVALID_DATETIME_FORMAT));
}

#[tokio::test]
async fn sites_do_not_share_schedules() {
    let (addr, _tm) = start_test_server().await;

    let east = connect_db(addr, "east_campus").await;
    let west = connect_db(addr, "west_campus").await;

    east.batch_execute(&insert_sql("tspi-east", "2024-06-03", "09:00", "10:00"))
        .await
        .unwrap();
    // Same room and slot in another site is a different schedule entirely
    west.batch_execute(&insert_sql("tspi-east", "2024-06-03", "09:00", "10:00"))
        .await
        .unwrap();

    let messages = west.simple_query("SELECT * FROM bookings").await.unwrap();
    assert_eq!(data_rows(&messages).len(), 1);
}

#[tokio::test]
async fn concurrent_clients_race_for_one_slot() {
    let (addr, _tm) = start_test_server().await;

    let a = connect(addr).await;
    let b = connect(addr).await;

    let sql = insert_sql("tspi-east", "2024-06-03", "09:00", "10:00");
    let (ra, rb) = tokio::join!(a.batch_execute(&sql), b.batch_execute(&sql));

    let wins = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "exactly one of two racing inserts may land");
    let loser = if ra.is_err() { ra.unwrap_err() } else { rb.unwrap_err() };
    assert_eq!(loser.code(), Some(&SqlState::EXCLUSION_VIOLATION));

    let messages = a
        .simple_query("SELECT * FROM bookings WHERE room_id = 'tspi-east' AND date = '2024-06-03'")
        .await
        .unwrap();
    assert_eq!(data_rows(&messages).len(), 1);
}

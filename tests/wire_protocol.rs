use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};

use drivetime::limits::MAX_LINE_LEN;
use drivetime::notify::NotifyHub;
use drivetime::persist::{MemoryKvStore, PersistOptions};
use drivetime::schedule::Scheduler;
use drivetime::wire;

// ── Test infrastructure ──────────────────────────────────────

type Client = Framed<TcpStream, LinesCodec>;

async fn start_test_server() -> (SocketAddr, Arc<MemoryKvStore>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = Arc::new(Scheduler::new(kv.clone(), PersistOptions::default()));
    let hub = Arc::new(NotifyHub::new());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let scheduler = scheduler.clone();
            let hub = hub.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, scheduler, hub).await;
            });
        }
    });

    (addr, kv)
}

async fn connect(addr: SocketAddr) -> Client {
    let socket = TcpStream::connect(addr).await.unwrap();
    Framed::new(socket, LinesCodec::new())
}

/// Next line from the server, parsed, with a timeout.
async fn recv(client: &mut Client, timeout: Duration) -> Option<Value> {
    let line = tokio::time::timeout(timeout, client.next())
        .await
        .ok()
        .flatten()?
        .unwrap();
    Some(serde_json::from_str(&line).unwrap())
}

async fn call(client: &mut Client, request: Value) -> Value {
    client.send(request.to_string()).await.unwrap();
    loop {
        let line = recv(client, Duration::from_secs(5)).await.expect("no response");
        if line.get("event").is_none() {
            return line;
        }
    }
}

fn booking_id(response: &Value) -> String {
    response["data"]["booking"]["id"].as_str().unwrap().to_string()
}

// ── Scenarios ────────────────────────────────────────────────

#[tokio::test]
async fn request_approve_and_conflict() {
    let (addr, _) = start_test_server().await;
    let mut instructor = connect(addr).await;
    let mut student_a = connect(addr).await;
    let mut student_b = connect(addr).await;

    let slot = call(
        &mut instructor,
        json!({"op":"add_availability","instructorId":"inst",
               "start":"2024-01-08T09:00:00Z","end":"2024-01-08T17:00:00Z"}),
    )
    .await;
    assert_eq!(slot["ok"], true);

    let request = json!({"op":"create_booking","instructorId":"inst",
        "start":"2024-01-08T10:00:00Z","end":"2024-01-08T10:30:00Z","createdBy":"student"});
    let mut first_req = request.clone();
    first_req["studentId"] = json!("student-1");
    let first = call(&mut student_a, first_req).await;
    assert_eq!(first["data"]["booking"]["status"], "pending");

    let mut second_req = request;
    second_req["studentId"] = json!("student-2");
    let second = call(&mut student_b, second_req).await;
    assert_eq!(second["data"]["booking"]["status"], "pending");

    let approved = call(
        &mut instructor,
        json!({"op":"set_booking_status","bookingId":booking_id(&first),"status":"approved"}),
    )
    .await;
    assert_eq!(approved["ok"], true);
    assert_eq!(approved["data"]["booking"]["status"], "approved");
    assert_eq!(approved["data"]["contested"][0]["id"], booking_id(&second));

    let refused = call(
        &mut instructor,
        json!({"op":"set_booking_status","bookingId":booking_id(&second),"status":"approved"}),
    )
    .await;
    assert_eq!(refused["ok"], false);
    assert_eq!(refused["error"]["kind"], "conflict");

    let listed = call(
        &mut instructor,
        json!({"op":"list_bookings","instructorId":"inst"}),
    )
    .await;
    let statuses: Vec<&str> = listed["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses.iter().filter(|s| **s == "approved").count(), 1);
}

#[tokio::test]
async fn subscribers_receive_their_events() {
    let (addr, _) = start_test_server().await;
    let mut student = connect(addr).await;
    let mut instructor = connect(addr).await;

    let subscribed = call(&mut student, json!({"op":"subscribe","userId":"student-1"})).await;
    assert_eq!(subscribed, json!({"ok":true,"data":{"userId":"student-1"}}));

    call(
        &mut instructor,
        json!({"op":"add_availability","instructorId":"inst",
               "start":"2024-01-08T09:00:00Z","end":"2024-01-08T12:00:00Z"}),
    )
    .await;
    let placed = call(
        &mut instructor,
        json!({"op":"create_booking","studentId":"student-1","instructorId":"inst",
               "start":"2024-01-08T09:00:00Z","end":"2024-01-08T10:00:00Z","createdBy":"instructor"}),
    )
    .await;
    assert_eq!(placed["data"]["booking"]["status"], "approved");

    // availability of the instructor is not the student's business
    let pushed = recv(&mut student, Duration::from_secs(5)).await.unwrap();
    assert_eq!(pushed["event"]["type"], "booking_created");
    assert_eq!(pushed["event"]["booking"]["id"], booking_id(&placed));

    call(
        &mut instructor,
        json!({"op":"set_booking_status","bookingId":booking_id(&placed),"status":"rejected"}),
    )
    .await;
    let pushed = recv(&mut student, Duration::from_secs(5)).await.unwrap();
    assert_eq!(pushed["event"]["type"], "booking_status_changed");
    assert_eq!(pushed["event"]["previous"], "approved");
    assert_eq!(pushed["event"]["booking"]["status"], "rejected");
}

#[tokio::test]
async fn malformed_input_keeps_connection_open() {
    let (addr, _) = start_test_server().await;
    let mut client = connect(addr).await;

    client.send("this is not json".to_string()).await.unwrap();
    let response = recv(&mut client, Duration::from_secs(5)).await.unwrap();
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["kind"], "validation");

    let bad_time = call(
        &mut client,
        json!({"op":"slot_at","instructorId":"inst","at":"tomorrow at noon"}),
    )
    .await;
    assert_eq!(bad_time["error"]["kind"], "validation");

    let bad_id = call(&mut client, json!({"op":"remove_availability","slotId":"nope"})).await;
    assert_eq!(bad_id["error"]["kind"], "validation");

    let missing = call(
        &mut client,
        json!({"op":"remove_availability","slotId":"01ARZ3NDEKTSV4RRFFQ69G5FAV"}),
    )
    .await;
    assert_eq!(missing["error"]["kind"], "not_found");

    let listed = call(&mut client, json!({"op":"list_availability","instructorId":"inst"})).await;
    assert_eq!(listed, json!({"ok":true,"data":[]}));
}

#[tokio::test]
async fn over_long_line_is_answered_then_closed() {
    let (addr, _) = start_test_server().await;
    let mut client = connect(addr).await;

    // no newline, so the server consumes every byte before it gives up
    let oversized = vec![b'x'; MAX_LINE_LEN + 1];
    client.get_mut().write_all(&oversized).await.unwrap();

    let response = recv(&mut client, Duration::from_secs(5)).await.unwrap();
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["kind"], "limit_exceeded");

    let end = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("connection left open");
    assert!(end.is_none());
}

#[tokio::test]
async fn resolve_week_over_the_wire() {
    let (addr, _) = start_test_server().await;
    let mut client = connect(addr).await;

    call(
        &mut client,
        json!({"op":"add_availability","instructorId":"inst",
               "start":"2024-01-08T08:00:00Z","end":"2024-01-08T12:00:00Z"}),
    )
    .await;
    call(
        &mut client,
        json!({"op":"create_booking","studentId":"student-1","instructorId":"inst",
               "start":"2024-01-08T09:00:00Z","end":"2024-01-08T11:00:00Z","createdBy":"instructor"}),
    )
    .await;

    let week = call(
        &mut client,
        json!({"op":"resolve_week","view":{"as":"instructor","instructorId":"inst"},
               "weekOf":"2024-01-08","startHour":8,"endHour":12,"now":"2024-01-01T00:00:00Z"}),
    )
    .await;
    let cells = week["data"]["cells"].as_array().unwrap();
    let kinds: Vec<&str> = cells[..4]
        .iter()
        .map(|c| c["content"]["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["availability", "booking", "booking", "availability"]);
    assert_eq!(cells[1]["content"]["isFirst"], true);
    assert_eq!(cells[2]["content"]["isFirst"], false);
    assert_eq!(cells[2]["content"]["isLast"], false);

    let again = call(
        &mut client,
        json!({"op":"resolve_week","view":{"as":"instructor","instructorId":"inst"},
               "weekOf":"2024-01-08","startHour":8,"endHour":12,"now":"2024-01-01T00:00:00Z"}),
    )
    .await;
    assert_eq!(week, again);
}

#[tokio::test]
async fn flush_persists_through_the_store() {
    let (addr, kv) = start_test_server().await;
    let mut client = connect(addr).await;

    call(
        &mut client,
        json!({"op":"add_availability","instructorId":"inst",
               "start":"2024-01-08T09:00:00Z","end":"2024-01-08T10:00:00Z"}),
    )
    .await;
    let flushed = call(&mut client, json!({"op":"flush"})).await;
    assert_eq!(flushed["data"]["persisted"], true);

    let stored: Value = serde_json::from_str(&kv.raw("availability").unwrap()).unwrap();
    assert_eq!(stored[0]["instructorId"], "inst");
}

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mathboard::Config;
use mathboard::recognition::{
    CalculateRequest, Dispatcher, Evaluation, RecognitionClient, RecognitionError, SubmitTicket,
};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

struct Captured {
    request_line: String,
    body: String,
}

/// Answer exactly one request with `status` and `body`, reporting what was received.
async fn serve_once(
    status: &'static str,
    body: &'static str,
) -> (SocketAddr, oneshot::Receiver<Captured>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let captured = read_request(&mut socket).await;
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        tx.send(captured).ok();
    });

    (addr, rx)
}

async fn read_request(socket: &mut TcpStream) -> Captured {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before the request was complete");
        buf.extend_from_slice(&chunk[..n]);

        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).into_owned();
        let length = head
            .lines()
            .find_map(|line| {
                let (key, value) = line.split_once(':')?;
                if key.trim().eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);

        let body_start = end + 4;
        if buf.len() >= body_start + length {
            return Captured {
                request_line: head.lines().next().unwrap_or_default().to_owned(),
                body: String::from_utf8_lossy(&buf[body_start..body_start + length]).into_owned(),
            };
        }
    }
}

fn client_for(addr: SocketAddr) -> RecognitionClient {
    // trailing slash on purpose
    let config = Config::from_base_url(&format!("http://{addr}/")).unwrap();
    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    RecognitionClient::with_http(&config, http)
}

fn sample_request() -> CalculateRequest {
    let mut dict_of_vars = BTreeMap::new();
    dict_of_vars.insert("x".to_owned(), "5".to_owned());
    CalculateRequest {
        image: "data:image/png;base64,iVBORw0KGgo=".to_owned(),
        dict_of_vars,
    }
}

#[tokio::test]
async fn test_calculate_posts_snapshot_and_decodes_results() {
    let (addr, captured) = serve_once(
        "200 OK",
        r#"{"message":"Image processed","status":"success","data":[{"expr":"x","result":"5","assign":true},{"expr":"x + 1","result":6,"assign":false}]}"#,
    )
    .await;

    let evaluations = client_for(addr).calculate(&sample_request()).await.unwrap();
    assert_eq!(
        evaluations,
        vec![
            Evaluation::new("x", "5", true),
            Evaluation::new("x + 1", "6", false),
        ]
    );

    let captured = captured.await.unwrap();
    assert_eq!(captured.request_line, "POST /calculate/ HTTP/1.1");
    let body: serde_json::Value = serde_json::from_str(&captured.body).unwrap();
    assert_eq!(
        body,
        serde_json::json!({
            "image": "data:image/png;base64,iVBORw0KGgo=",
            "dict_of_vars": { "x": "5" }
        })
    );
}

#[tokio::test]
async fn test_server_error_is_reported() {
    let (addr, _captured) = serve_once("500 Internal Server Error", r#"{"detail":"boom"}"#).await;

    let err = client_for(addr)
        .calculate(&sample_request())
        .await
        .unwrap_err();
    assert!(
        matches!(err, RecognitionError::Status(status) if status.as_u16() == 500),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_unparsable_body_is_a_decode_error() {
    let (addr, _captured) = serve_once("200 OK", "not json at all").await;

    let err = client_for(addr)
        .calculate(&sample_request())
        .await
        .unwrap_err();
    assert!(
        matches!(err, RecognitionError::Decode(_)),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_unreachable_service_is_a_transport_error() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let err = client_for(addr)
        .calculate(&sample_request())
        .await
        .unwrap_err();
    assert!(
        matches!(err, RecognitionError::Transport(_)),
        "unexpected error: {err}"
    );
}

#[test]
fn test_dispatcher_hands_back_completion_with_ticket() {
    let server = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let (addr, _captured) = server.block_on(serve_once(
        "200 OK",
        r#"{"data":[{"expr":"2 + 2","result":"4"}]}"#,
    ));

    let mut dispatcher = Dispatcher::new(client_for(addr)).unwrap();
    let ticket = SubmitTicket {
        session: 3,
        base_count: 2,
    };
    dispatcher.submit(ticket, sample_request(), &egui::Context::default());
    assert_eq!(dispatcher.in_flight(), 1);

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut done = Vec::new();
    while done.is_empty() {
        assert!(Instant::now() < deadline, "no completion within 10s");
        done = dispatcher.drain();
        std::thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(done.len(), 1);
    assert_eq!(dispatcher.in_flight(), 0);
    let completion = done.remove(0);
    assert_eq!(completion.ticket, ticket);
    assert_eq!(
        completion.outcome.unwrap(),
        vec![Evaluation::new("2 + 2", "4", false)]
    );
}

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::cookie::Jar;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use booking_session_core::http::ReqwestBackend;
use booking_session_core::realtime::{DomainEventKind, TungsteniteConnector};
use booking_session_core::{ConnectionState, Identity, LivenessConfig, LivenessCore};

#[derive(Clone)]
struct ServerState {
    frames: mpsc::UnboundedSender<Value>,
}

fn has_session(headers: &HeaderMap) -> bool {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.split(';').any(|cookie| cookie.trim() == "session=fresh"))
}

async fn refresh() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(SET_COOKIE, "session=fresh; Path=/")],
        Json(json!({
            "user": {"id":"u-7","email":"lee@example.com","emailVerified":true,"roles":["USER"]}
        })),
    )
}

async fn notifications(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<ServerState>,
) -> Response {
    if !has_session(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: ServerState) {
    let opening = [
        json!({"type":"PING","timestamp":99}),
        json!({"type":"APPOINTMENT_REMINDER","appointmentId":5,"title":"Tomorrow 09:00"}),
    ];
    for frame in opening {
        if socket.send(WsMessage::Text(frame.to_string())).await.is_err() {
            return;
        }
    }
    while let Some(Ok(message)) = socket.recv().await {
        if let WsMessage::Text(text) = message {
            if let Ok(frame) = serde_json::from_str(&text) {
                let _ = state.frames.send(frame);
            }
        }
    }
}

async fn spawn_server() -> (String, mpsc::UnboundedReceiver<Value>) {
    let (frames, received) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/api/auth/refresh", post(refresh))
        .route("/ws/notifications", get(notifications))
        .with_state(ServerState { frames });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/api/"), received)
}

#[test_timeout::tokio_timeout_test(20)]
async fn bootstrapped_session_opens_authenticated_socket() {
    let (base, mut received) = spawn_server().await;
    let config = LivenessConfig::new(&base).unwrap();
    let core = LivenessCore::build(config).unwrap();
    let mut messages = core.realtime().subscribe_messages();
    let mut states = core.realtime().subscribe_state();

    let snapshot = core.start().await;
    assert!(snapshot.is_authenticated());
    timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    let event = timeout(Duration::from_secs(5), messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, DomainEventKind::AppointmentReminder);
    assert_eq!(event.title.as_deref(), Some("Tomorrow 09:00"));

    let pong = timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
    assert_eq!(pong, json!({"type":"PONG","timestamp":99}));
    let ack = timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
    assert_eq!(ack, json!({"type":"ACK","appointmentId":5}));

    core.logout().await;
    timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(!core.session().snapshot().is_authenticated());
    core.shutdown();
}

#[test_timeout::tokio_timeout_test(20)]
async fn rejected_upgrade_enters_backoff() {
    let (base, _received) = spawn_server().await;
    let config = LivenessConfig::new(&base).unwrap();
    let backend = Arc::new(ReqwestBackend::new(config.api_base.clone(), Arc::new(Jar::default())).unwrap());
    let connector = Arc::new(TungsteniteConnector::new(None));
    let core = LivenessCore::assemble(config, backend, connector);
    let mut states = core.realtime().subscribe_state();

    core.session().set_identity(Some(Identity {
        id: "u-7".into(),
        email: "lee@example.com".into(),
        email_verified: true,
        roles: Default::default(),
    }));

    timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == ConnectionState::Reconnecting),
    )
    .await
    .unwrap()
    .unwrap();
    core.shutdown();
}

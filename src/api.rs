use crate::client::ClientHandle;
use crate::errors::{BridgeResult, ErrorBody};
use crate::lsp::WebSocketTransport;
use crate::models::{AvailablePortsResponse, CreatePortMappingRequest, PingResponse, PortMapping};
use crate::router::{AppState, BridgeRouter};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{delete, get};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};
use utoipa::OpenApi as UtoipaOpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(Deserialize)]
struct ReloadParams {
    reload: Option<bool>,
}

#[derive(UtoipaOpenApi)]
#[openapi(
    paths(ping, list_ports, available_ports, create_port, delete_port),
    components(schemas(
        PingResponse,
        PortMapping,
        CreatePortMappingRequest,
        AvailablePortsResponse,
        ErrorBody
    )),
    tags((name = "bridge", description = "Workspace bridge control endpoints"))
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    let openapi = ApiDoc::openapi();
    let swagger_routes: Router<AppState> =
        SwaggerUi::new("/docs").url("/openapi.json", openapi).into();

    Router::new()
        .route("/ping", get(ping))
        // Both envelope sockets share one dispatcher
        .route("/ws", get(envelope_socket))
        .route("/terminal", get(envelope_socket))
        .route("/lsp/{name}", get(lsp_socket))
        .route("/ports", get(list_ports).post(create_port))
        .route("/ports/available", get(available_ports))
        .route("/ports/{internal}/{external}", delete(delete_port))
        .merge(swagger_routes)
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/ping",
    responses((status = 200, description = "Bridge is up", body = PingResponse))
)]
async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        message: "Bridge is active".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/ports",
    responses(
        (status = 200, description = "Current port mappings", body = [PortMapping]),
        (status = 500, description = "Config directory unreadable", body = ErrorBody)
    )
)]
async fn list_ports(State(state): State<AppState>) -> BridgeResult<Json<Vec<PortMapping>>> {
    Ok(Json(state.ports.list_current_mapping().await?))
}

#[utoipa::path(
    get,
    path = "/ports/available",
    responses((status = 200, description = "Allow-listed external ports not yet mapped", body = AvailablePortsResponse))
)]
async fn available_ports(State(state): State<AppState>) -> BridgeResult<Json<AvailablePortsResponse>> {
    let ports = state.ports.list_available_external_ports().await?;
    Ok(Json(AvailablePortsResponse { ports }))
}

#[utoipa::path(
    post,
    path = "/ports",
    request_body = CreatePortMappingRequest,
    responses(
        (status = 201, description = "Mapping written", body = PortMapping),
        (status = 400, description = "Port not allowed", body = ErrorBody),
        (status = 409, description = "External port already mapped", body = ErrorBody),
        (status = 502, description = "Proxy reload failed", body = ErrorBody)
    )
)]
async fn create_port(
    State(state): State<AppState>,
    Json(request): Json<CreatePortMappingRequest>,
) -> BridgeResult<(StatusCode, Json<PortMapping>)> {
    let mapping = state
        .ports
        .create(
            request.internal_port,
            request.external_port,
            request.reload.unwrap_or(true),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(mapping)))
}

#[utoipa::path(
    delete,
    path = "/ports/{internal}/{external}",
    params(
        ("internal" = u16, Path, description = "Workspace port"),
        ("external" = u16, Path, description = "Public port"),
        ("reload" = Option<bool>, Query, description = "Reload the proxy afterwards (default true)")
    ),
    responses(
        (status = 204, description = "Mapping removed"),
        (status = 404, description = "No such mapping", body = ErrorBody),
        (status = 502, description = "Proxy reload failed", body = ErrorBody)
    )
)]
async fn delete_port(
    State(state): State<AppState>,
    Path((internal, external)): Path<(u16, u16)>,
    Query(params): Query<ReloadParams>,
) -> BridgeResult<StatusCode> {
    state
        .ports
        .delete(internal, external, params.reload.unwrap_or(true))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn envelope_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let router = BridgeRouter::new(state);
    ws.on_upgrade(move |socket| serve_envelopes(socket, router))
}

async fn lsp_socket(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        state.lsp.serve(&name, WebSocketTransport::new(socket)).await;
    })
}

async fn serve_envelopes(socket: WebSocket, router: BridgeRouter) {
    let (client, mut outbound) = ClientHandle::new();
    let connection = client.id();
    info!(%connection, "envelope socket connected");

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let router = router.clone();
                let client = client.clone();
                let text = text.to_string();
                tokio::spawn(async move {
                    let frame = router.handle_text(&text, &client).await;
                    client.send(&frame);
                });
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%connection, error = %e, "socket read failed");
                break;
            }
        }
    }

    // Terminals may still hold this handle; stop writing for them.
    writer.abort();
    info!(%connection, "envelope socket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(dir: &TempDir) -> Router {
        let mut config = BridgeConfig::for_root(dir.path());
        config.proxy.reload_command = Vec::new();
        build_router(AppState::new(&config))
    }

    #[tokio::test]
    async fn ping_reports_active() {
        let dir = TempDir::new().unwrap();
        let response = app(&dir)
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, serde_json::json!({"message": "Bridge is active"}));
    }

    #[tokio::test]
    async fn port_mapping_http_flow() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ports")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"internalPort":8080,"externalPort":3000}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ports")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"internalPort":9000,"externalPort":3000}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/ports").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mappings: Vec<PortMapping> = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            mappings,
            vec![PortMapping {
                internal_port: 8080,
                external_port: 3000
            }]
        );

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/ports/8080/3000?reload=false")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/ports/8080/3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disallowed_port_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let response = app(&dir)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ports")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"internalPort":8080,"externalPort":22}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["code"], "bad_request");
    }
}

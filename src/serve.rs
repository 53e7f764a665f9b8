//! JSON bridge for external viewers
//!
//! `timefiles serve` → answers overview snapshots and liveness probes over
//! local HTTP. The core never renders; a viewer process polls this bridge
//! and draws the task tree itself.

use crate::db::{Database, OverviewRange};
use serde::Serialize;
use tiny_http::{Header, Method, Request, Response, Server};

#[derive(Serialize)]
struct ApiResponse<T> {
    ok: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn failure(error: String) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Start the bridge server. Blocks until the process is interrupted.
pub fn start_bridge(db: &Database, port: u16) -> std::io::Result<()> {
    let addr = format!("127.0.0.1:{}", port);
    let server =
        Server::http(&addr).map_err(|e| std::io::Error::other(e.to_string()))?;

    eprintln!("timefiles bridge listening on http://{}", addr);
    eprintln!("  GET /api/overview?range=all|day|week|today");
    eprintln!("  GET /api/ping");

    for request in server.incoming_requests() {
        if let Err(e) = handle_request(db, request) {
            eprintln!("Error: {}", e);
        }
    }

    Ok(())
}

fn handle_request(db: &Database, request: Request) -> std::io::Result<()> {
    let url = request.url().to_string();
    let path = url.split('?').next().unwrap_or("/");
    let method = request.method().clone();

    match (&method, path) {
        (&Method::Get, "/api/ping") => {
            let body = match db.ping() {
                Ok(answer) => ApiResponse::success(answer.to_string()),
                Err(e) => ApiResponse::failure(e.to_string()),
            };
            respond_json(request, &body)
        }

        (&Method::Get, "/api/overview") => {
            let range = query_param(&url, "range").unwrap_or_else(|| "all".to_string());
            let body = match range
                .parse::<OverviewRange>()
                .and_then(|range| db.get_overview(range))
            {
                Ok(snapshot) => ApiResponse::success(snapshot),
                Err(e) => ApiResponse::failure(e.to_string()),
            };
            respond_json(request, &body)
        }

        _ => {
            let response = Response::from_string("Not found").with_status_code(404);
            request.respond(response)
        }
    }
}

fn respond_json<T: Serialize>(request: Request, body: &T) -> std::io::Result<()> {
    let json = serde_json::to_string(body)?;
    let response = Response::from_string(json).with_header(
        Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
    );
    request.respond(response)
}

fn query_param(url: &str, key: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name == key && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

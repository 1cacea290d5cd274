//! Page server – serves the player page and the player script.
//!
//! Routes:
//!   GET  /            → 301 to /index.html
//!   GET  /index.html  → rendered page template
//!   GET  /jsmpg.js    → player script
//!   anything else     → 404
//!
//! HEAD is answered with the same headers as GET and no body.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use plantcam_common::config::Config;

use crate::error::PipelineError;

pub const INDEX_FILE: &str = "index.html";
pub const SCRIPT_FILE: &str = "jsmpg.js";

/// Page template and player script, read once at startup.
#[derive(Debug, Clone)]
pub struct PageAssets {
    pub index_template: String,
    pub player_script: String,
}

impl PageAssets {
    /// Read both resources from `dir`. A missing file is fatal.
    pub fn load(dir: &Path) -> Result<Self, PipelineError> {
        let read = |name: &str| {
            let path = dir.join(name);
            std::fs::read_to_string(&path).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => PipelineError::MissingAsset(path),
                _ => PipelineError::Io(e),
            })
        };
        Ok(Self {
            index_template: read(INDEX_FILE)?,
            player_script: read(SCRIPT_FILE)?,
        })
    }
}

/// Substitute `$NAME` and `${NAME}` placeholders; `$$` is a literal `$`.
///
/// Placeholders without a value are left as written.
pub fn render_template(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
            continue;
        }

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) if is_identifier(&braced[..end]) => (&braced[..end], end + 2),
                _ => ("", 0),
            }
        } else {
            let len = identifier_len(after);
            (&after[..len], len)
        };

        match vars.get(name) {
            Some(value) if consumed > 0 => {
                out.push_str(value);
                rest = &after[consumed..];
            }
            _ => {
                out.push('$');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn identifier_len(s: &str) -> usize {
    let mut len = 0;
    for (i, c) in s.char_indices() {
        let ok = c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit());
        if !ok {
            break;
        }
        len = i + c.len_utf8();
    }
    len
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && identifier_len(s) == s.len()
}

/// Values injected into the page template.
pub fn template_vars(config: &Config) -> HashMap<&'static str, String> {
    HashMap::from([
        ("WS_PORT", config.ws_port.to_string()),
        ("WIDTH", config.width.to_string()),
        ("HEIGHT", config.height.to_string()),
        ("COLOR", config.color.clone()),
        ("BGCOLOR", config.bgcolor.clone()),
    ])
}

struct PageState {
    index_html: String,
    player_script: String,
}

/// Build the page router. The template is rendered once, since the
/// configuration does not change during a run.
pub fn router(assets: &PageAssets, config: &Config) -> Router {
    let state = Arc::new(PageState {
        index_html: render_template(&assets.index_template, &template_vars(config)),
        player_script: assets.player_script.clone(),
    });

    Router::new()
        .route("/", get(root_redirect))
        .route("/index.html", get(index))
        .route("/jsmpg.js", get(player_script))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve pages on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Page server listening on http://{addr}");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("Page server stopped");
    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn root_redirect() -> Response {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, "/index.html")],
    )
        .into_response()
}

async fn index(State(state): State<Arc<PageState>>) -> Response {
    content_response("text/html; charset=utf-8", state.index_html.clone())
}

async fn player_script(State(state): State<Arc<PageState>>) -> Response {
    content_response("application/javascript", state.player_script.clone())
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "File not found").into_response()
}

fn content_response(content_type: &'static str, body: String) -> Response {
    let len = body.len();
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
            (header::LAST_MODIFIED, http_date(chrono::Utc::now())),
        ],
        Body::from(body),
    )
        .into_response()
}

/// RFC 7231 IMF-fixdate.
fn http_date(t: chrono::DateTime<chrono::Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

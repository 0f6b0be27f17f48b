//! HTTP surface (§6 "HTTP serves files under `public/`"): the local WS
//! hub's route plus a fallback that serves the embedded web UI. Modelled
//! on the receiver's `ui_server` module — same embed/placeholder split,
//! same blocked-prefix + GET/HEAD validation via `ui-assets`.

use axum::http::{Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::app_state::AppState;
use crate::local_hub;

#[cfg(feature = "embed-ui")]
#[derive(rust_embed::Embed)]
#[folder = "public/"]
struct UiAssets;

/// Paths reserved for the WS endpoint; never served as UI assets.
const BLOCKED_PREFIXES: &[&str] = &["/ws"];

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(local_hub::ws_handler))
        .fallback(serve_ui)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the embedded web UI, falling back to `index.html` for
/// extension-less (client-routed) paths. With `embed-ui` disabled,
/// returns a placeholder page.
async fn serve_ui(method: Method, uri: Uri) -> Response {
    let path = match ui_assets::validate_ui_request(&method, &uri, BLOCKED_PREFIXES) {
        Ok(path) => path,
        Err(err) => return err.into_response(),
    };

    #[cfg(feature = "embed-ui")]
    {
        ui_assets::serve_embedded_ui::<UiAssets>(path)
    }
    #[cfg(not(feature = "embed-ui"))]
    {
        let _ = path;
        ui_assets::non_embedded_placeholder("sessiond")
    }
}

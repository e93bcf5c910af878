//! HTTP front end: a plain form, canned examples and a JSON synthesis API.
//!
//! | Route | |
//! |-------|---|
//! | `GET /` | HTML form |
//! | `GET /api/examples` | canned example requests |
//! | `POST /api/synthesize` | run one [`SynthesisRequest`] |
//! | `GET /audio/{file}` | generated WAV files |
//! | `GET /healthz` | model and device info |

use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::synthesis::{
    ParameterError, SpeechModel, SynthesisRequest, SynthesisResult, SynthesisStatus, Synthesizer,
};

/// Text pre-filled in the form.
pub const DEFAULT_TEXT: &str = "A todo el mundo le gusta el jarabe para la tos, el olor del jarabe para la tos. Pero nadie lo usa como perfume.";

/// Example sentences offered under the form.
pub fn examples() -> Vec<SynthesisRequest> {
    vec![
        SynthesisRequest::new(
            "Hola, soy Pedro. Bienvenidos a mi demostración de clonación de voz.",
            0.7,
            0.85,
            50,
            67,
        ),
        SynthesisRequest::new(
            "La inteligencia artificial ha avanzado mucho en los últimos años.",
            0.5,
            0.9,
            40,
            42,
        ),
        SynthesisRequest::new(
            "¿Cómo va todo? Espero que estés teniendo un excelente día.",
            0.8,
            0.8,
            60,
            123,
        ),
    ]
}

/// Static facts reported by `/healthz`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub model: String,
    pub device: String,
    pub language: String,
    pub sample_rate: u32,
}

pub struct AppState<M: SpeechModel> {
    pub synthesizer: Arc<Synthesizer<M>>,
    pub semaphore: Arc<Semaphore>,
    pub info: ServiceInfo,
}

impl<M: SpeechModel> AppState<M> {
    pub fn new(synthesizer: Synthesizer<M>, max_concurrency: usize, info: ServiceInfo) -> Self {
        Self {
            synthesizer: Arc::new(synthesizer),
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            info,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

/// Form submission; omitted sampling fields take the form defaults.
#[derive(Debug, Deserialize)]
struct SynthesizeBody {
    text: String,
    temperature: Option<f64>,
    top_p: Option<f64>,
    top_k: Option<usize>,
    /// Any JSON integer; negative seeds wrap into the u64 range
    seed: Option<serde_json::Number>,
}

impl TryFrom<SynthesizeBody> for SynthesisRequest {
    type Error = ParameterError;

    fn try_from(body: SynthesizeBody) -> Result<Self, ParameterError> {
        let seed = match body.seed {
            Some(n) => seed_from_number(&n)?,
            None => 42,
        };
        Ok(SynthesisRequest::new(
            body.text,
            body.temperature.unwrap_or(0.7),
            body.top_p.unwrap_or(0.85),
            body.top_k.unwrap_or(50),
            seed,
        ))
    }
}

fn seed_from_number(n: &serde_json::Number) -> Result<u64, ParameterError> {
    if let Some(v) = n.as_u64() {
        return Ok(v);
    }
    match n.as_i64() {
        Some(v) => Ok(v as u64),
        None => Err(ParameterError::Seed(n.to_string())),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SynthesizeResponse {
    pub status: String,
    pub message: String,
    pub audio_url: Option<String>,
    pub sample_rate: Option<u32>,
    pub duration_secs: Option<f32>,
}

fn status_kind(status: &SynthesisStatus) -> &'static str {
    match status {
        SynthesisStatus::Success => "success",
        SynthesisStatus::EmptyInput => "empty_input",
        SynthesisStatus::InvalidParameters(_) => "invalid_parameters",
        SynthesisStatus::Failed(_) => "failed",
    }
}

async fn index() -> Html<String> {
    Html(FORM_HTML.replace("{{DEFAULT_TEXT}}", DEFAULT_TEXT))
}

async fn list_examples() -> Json<Vec<SynthesisRequest>> {
    Json(examples())
}

async fn health<M: SpeechModel + 'static>(State(state): State<Arc<AppState<M>>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "model": state.info.model,
        "device": state.info.device,
        "language": state.info.language,
        "sample_rate": state.info.sample_rate,
    }))
}

async fn synthesize<M: SpeechModel + 'static>(
    State(state): State<Arc<AppState<M>>>,
    body: Result<Json<SynthesizeBody>, JsonRejection>,
) -> Result<Json<SynthesizeResponse>, ApiError> {
    let Json(body) = body?;
    let request = match SynthesisRequest::try_from(body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "rejected synthesis request");
            let status = SynthesisStatus::InvalidParameters(e.to_string());
            return Ok(Json(respond(&SynthesisResult::without_audio(status))));
        }
    };

    let _permit = state
        .semaphore
        .acquire()
        .await
        .map_err(|e| ApiError::internal(format!("generation queue closed: {e}")))?;
    let synthesizer = state.synthesizer.clone();
    let result = tokio::task::spawn_blocking(move || synthesizer.synthesize(&request))
        .await
        .map_err(|e| ApiError::internal(format!("task join error: {e}")))?;

    Ok(Json(respond(&result)))
}

fn respond(result: &SynthesisResult) -> SynthesizeResponse {
    let audio_url = result
        .path
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|name| format!("/audio/{}", name.to_string_lossy()));

    SynthesizeResponse {
        status: status_kind(&result.status).to_string(),
        message: result.status.to_string(),
        audio_url,
        sample_rate: result.audio.as_ref().map(|a| a.sample_rate),
        duration_secs: result.audio.as_ref().map(|a| a.duration()),
    }
}

async fn audio_file<M: SpeechModel + 'static>(
    State(state): State<Arc<AppState<M>>>,
    UrlPath(file): UrlPath<String>,
) -> Result<Response, ApiError> {
    let valid = file.ends_with(".wav")
        && file
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        && !file.contains("..");
    if !valid {
        return Err(ApiError::bad_request("invalid audio file name"));
    }

    let path = state.synthesizer.output_dir().join(&file);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::not_found(format!("no audio named {file}")))?;
    Ok(([(header::CONTENT_TYPE, "audio/wav")], bytes).into_response())
}

pub fn router<M: SpeechModel + 'static>(state: Arc<AppState<M>>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/examples", get(list_examples))
        .route("/api/synthesize", post(synthesize::<M>))
        .route("/audio/:file", get(audio_file::<M>))
        .route("/healthz", get(health::<M>))
        .with_state(state)
}

/// Bind `host:port`, moving to the next port on failure, for at most
/// `attempts` ports. Returns the listener and the port it holds.
pub async fn bind_with_retry(host: &str, port: u16, attempts: u16) -> Result<(TcpListener, u16)> {
    for offset in 0..attempts {
        let Some(candidate) = port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                if offset > 0 {
                    tracing::info!(port = bound, "bound after {offset} failed attempts");
                }
                return Ok((listener, bound));
            }
            Err(e) => {
                tracing::warn!(port = candidate, error = %e, "port unavailable, trying the next one");
            }
        }
    }
    anyhow::bail!(
        "Could not find an open port after multiple attempts. (tried {attempts} ports from {host}:{port})"
    )
}

/// Serve `app` on `listener` until the process is stopped.
pub async fn serve(listener: TcpListener, app: Router) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("Listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

const FORM_HTML: &str = r#"<!doctype html>
<html lang="es">
<head>
<meta charset="utf-8">
<title>Voice Cloning Demo</title>
<style>
body { font-family: sans-serif; max-width: 760px; margin: 2em auto; padding: 0 1em; }
textarea { width: 100%; }
label { display: block; margin-top: .8em; }
#examples li { cursor: pointer; text-decoration: underline; margin: .3em 0; }
</style>
</head>
<body>
<h1>Voice Cloning Demo</h1>
<p>Enter text in Spanish and adjust the parameters to generate speech in the cloned voice.</p>
<form id="form">
  <label>Text to Synthesize
    <textarea id="text" rows="3">{{DEFAULT_TEXT}}</textarea>
  </label>
  <details>
    <summary>Advanced Parameters</summary>
    <label>Temperature <output id="temperature-v">0.7</output>
      <input id="temperature" type="range" min="0.1" max="1" step="0.05" value="0.7">
    </label>
    <label>Top-p <output id="top_p-v">0.85</output>
      <input id="top_p" type="range" min="0.1" max="1" step="0.05" value="0.85">
    </label>
    <label>Top-k <output id="top_k-v">50</output>
      <input id="top_k" type="range" min="1" max="100" step="1" value="50">
    </label>
    <label>Seed <input id="seed" type="number" value="42" min="0"></label>
  </details>
  <p><button type="submit">Generate Speech</button></p>
</form>
<audio id="audio" controls></audio>
<p id="status"></p>
<h2>Examples</h2>
<ul id="examples"></ul>
<script>
const $ = (id) => document.getElementById(id);
for (const id of ["temperature", "top_p", "top_k"]) {
  $(id).addEventListener("input", () => { $(id + "-v").textContent = $(id).value; });
}
function fill(ex) {
  $("text").value = ex.text;
  for (const id of ["temperature", "top_p", "top_k"]) {
    $(id).value = ex[id];
    $(id + "-v").textContent = ex[id];
  }
  $("seed").value = ex.seed;
}
fetch("/api/examples").then((r) => r.json()).then((list) => {
  for (const ex of list) {
    const li = document.createElement("li");
    li.textContent = ex.text;
    li.onclick = () => fill(ex);
    $("examples").appendChild(li);
  }
});
$("form").addEventListener("submit", async (ev) => {
  ev.preventDefault();
  $("status").textContent = "Generating...";
  const body = {
    text: $("text").value,
    temperature: parseFloat($("temperature").value),
    top_p: parseFloat($("top_p").value),
    top_k: parseInt($("top_k").value, 10),
    seed: parseInt($("seed").value, 10),
  };
  const res = await fetch("/api/synthesize", {
    method: "POST",
    headers: { "Content-Type": "application/json" },
    body: JSON.stringify(body),
  });
  let out;
  try { out = await res.json(); }
  catch (e) { out = { error: "❌ Error generating audio: HTTP " + res.status }; }
  $("status").textContent = out.message || out.error;
  if (out.audio_url) { $("audio").src = out.audio_url; $("audio").play(); }
  else { $("audio").removeAttribute("src"); }
});
</script>
</body>
</html>
"#;

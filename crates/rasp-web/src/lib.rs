//! Axum + Askama dashboard for launching pipeline runs and tailing their
//! event logs while they execute.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use askama::Template;
use axum::{
    extract::{Form, Path as AxumPath, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use rasp_core::{BufferSink, Industry};
use rasp_pipeline::{RunRequest, RunSummary, DEFAULT_APPLE_COUNTRY};
use serde::Deserialize;
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rasp-web";

#[derive(Debug, Clone)]
pub enum RunState {
    Running,
    Finished(RunSummary),
    Failed(String),
}

impl RunState {
    fn label(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Finished(_) => "finished",
            RunState::Failed(_) => "failed",
        }
    }
}

/// One launched run: its request parameters, live event buffer, and outcome.
pub struct RunHandle {
    pub id: Uuid,
    pub industry: Industry,
    pub app_label: String,
    pub started_at: DateTime<Utc>,
    pub sink: Arc<BufferSink>,
    pub state: Mutex<RunState>,
}

impl RunHandle {
    fn new(id: Uuid, request: &RunRequest) -> Arc<Self> {
        let app_label = request
            .primary_app_id()
            .unwrap_or("unknown")
            .to_string();
        Arc::new(Self {
            id,
            industry: request.industry,
            app_label,
            started_at: Utc::now(),
            sink: Arc::new(BufferSink::new()),
            state: Mutex::new(RunState::Running),
        })
    }
}

#[derive(Clone, Default)]
pub struct AppState {
    runs: Arc<Mutex<Vec<Arc<RunHandle>>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_run(&self, id: Uuid) -> Option<Arc<RunHandle>> {
        self.runs.lock().unwrap().iter().find(|r| r.id == id).cloned()
    }
}

#[derive(Debug, Deserialize)]
struct LaunchForm {
    industry: String,
    #[serde(default)]
    google_app_id: String,
    #[serde(default)]
    apple_app_name: String,
    #[serde(default)]
    country: String,
}

#[derive(Debug, Clone)]
struct RunRow {
    id: String,
    industry: String,
    app_label: String,
    started_at: String,
    state: &'static str,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    industries: Vec<&'static str>,
    default_country: &'static str,
    runs: Vec<RunRow>,
}

#[derive(Template)]
#[template(path = "run.html")]
struct RunTemplate {
    run: RunRow,
    polling: bool,
}

#[derive(Template)]
#[template(path = "run_log_partial.html")]
struct RunLogPartialTemplate {
    lines: Vec<String>,
    outcome: String,
    done: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/runs", post(launch_run_handler))
        .route("/runs/{id}", get(run_detail_handler))
        .route("/runs/{id}/log", get(run_log_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("RASP_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState::new())).await?;
    Ok(())
}

fn run_row(handle: &RunHandle) -> RunRow {
    RunRow {
        id: handle.id.to_string(),
        industry: handle.industry.to_string(),
        app_label: handle.app_label.clone(),
        started_at: handle.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        state: handle.state.lock().unwrap().label(),
    }
}

async fn index_handler(State(state): State<AppState>) -> Response {
    let mut runs: Vec<RunRow> = state
        .runs
        .lock()
        .unwrap()
        .iter()
        .map(|h| run_row(h))
        .collect();
    runs.reverse(); // newest first
    render_html(IndexTemplate {
        industries: Industry::ALL.iter().map(|i| i.key()).collect(),
        default_country: DEFAULT_APPLE_COUNTRY,
        runs,
    })
}

async fn launch_run_handler(
    State(state): State<AppState>,
    Form(form): Form<LaunchForm>,
) -> Response {
    let industry = match Industry::from_str(&form.industry) {
        Ok(industry) => industry,
        Err(err) => {
            return (StatusCode::UNPROCESSABLE_ENTITY, Html(err.to_string())).into_response()
        }
    };

    let mut request = RunRequest::new(industry);
    if !form.google_app_id.trim().is_empty() {
        request = request.with_google_app_id(form.google_app_id.trim());
    }
    if !form.apple_app_name.trim().is_empty() {
        let country = if form.country.trim().is_empty() {
            DEFAULT_APPLE_COUNTRY
        } else {
            form.country.trim()
        };
        request = request.with_apple_app(form.apple_app_name.trim(), country);
    }
    if request.primary_app_id().is_none() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Html("provide a Google Play app id or an App Store app name".to_string()),
        )
            .into_response();
    }

    let id = Uuid::new_v4();
    let handle = RunHandle::new(id, &request);
    state.runs.lock().unwrap().push(handle.clone());

    tokio::spawn(async move {
        let outcome = rasp_pipeline::run_from_env(&request, handle.sink.clone()).await;
        let mut run_state = handle.state.lock().unwrap();
        *run_state = match outcome {
            Ok(summary) => RunState::Finished(summary),
            Err(err) => RunState::Failed(format!("{err:#}")),
        };
    });

    Redirect::to(&format!("/runs/{id}")).into_response()
}

async fn run_detail_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.find_run(id) {
        Some(handle) => {
            let polling = matches!(*handle.state.lock().unwrap(), RunState::Running);
            render_html(RunTemplate {
                run: run_row(&handle),
                polling,
            })
        }
        None => (StatusCode::NOT_FOUND, Html("Run not found".to_string())).into_response(),
    }
}

async fn run_log_handler(State(state): State<AppState>, AxumPath(id): AxumPath<Uuid>) -> Response {
    let Some(handle) = state.find_run(id) else {
        return (StatusCode::NOT_FOUND, Html("Run not found".to_string())).into_response();
    };
    let run_state = handle.state.lock().unwrap().clone();
    let (outcome, done) = match &run_state {
        RunState::Running => (String::new(), false),
        RunState::Finished(summary) => (
            format!(
                "status {:?}: {} scraped, {} new, {} synced",
                summary.status, summary.scraped, summary.novel, summary.synced
            ),
            true,
        ),
        RunState::Failed(err) => (format!("failed: {err}"), true),
    };
    render_html(RunLogPartialTemplate {
        lines: handle.sink.rendered_lines(),
        outcome,
        done,
    })
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

use serde::Serialize;
use warp::{http::StatusCode, Filter};
use tracing::{debug, info};

use crate::emulator::CpuSnapshot;
use crate::io::{Button, SoundLatches};
use crate::metrics::{gather_metrics, init_metrics, record_api_request, Timer};
use crate::scheduler::{Remote, RunState};

#[derive(Debug, Clone, Serialize)]
pub struct EmulatorState {
    pub id: String,
    pub run_state: RunState,
    pub cpu: CpuSnapshot,
    pub inputs: [u8; 3],
    pub sound: SoundLatches,
    pub watchdog: u8,
}

#[derive(Debug, Serialize)]
pub struct InputChange {
    pub button: Button,
    pub pressed: bool,
    pub port: u8,
    pub value: u8,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

fn current_state(remote: &Remote) -> EmulatorState {
    let latches = &remote.latches;
    EmulatorState {
        id: remote.id.clone(),
        run_state: remote.control.state(),
        cpu: remote.snapshot(),
        inputs: [
            latches.input(0).unwrap_or(0),
            latches.input(1).unwrap_or(0),
            latches.input(2).unwrap_or(0),
        ],
        sound: latches.sound(),
        watchdog: latches.watchdog(),
    }
}

/// Every route of the debug surface, for serving or for `warp::test`.
pub fn routes(
    remote: Remote,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    // Get emulator state
    let get_state = warp::path("state")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_remote(remote.clone()))
        .and_then(get_state_handler);

    // Pause, resume, step or stop the emulation thread
    let control = warp::path!(String)
        .and(warp::post())
        .and(with_remote(remote.clone()))
        .and_then(control_handler);

    // Press or release a cabinet button
    let input = warp::path!("input" / String / String)
        .and(warp::post())
        .and(with_remote(remote.clone()))
        .and_then(input_handler);

    // Read video RAM
    let video = warp::path("video")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_remote(remote))
        .and_then(video_handler);

    // Metrics endpoint
    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(metrics_handler);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type"])
        .allow_methods(vec!["GET", "POST"]);

    get_state
        .or(metrics)
        .or(video)
        .or(input)
        .or(control)
        .with(cors)
}

pub async fn run_server(remote: Remote, port: u16) {
    init_metrics();

    info!("debug server for emulator {} on http://127.0.0.1:{}", remote.id, port);
    info!("  GET  /state                          - CPU snapshot and run state");
    info!("  POST /pause | /resume | /step | /stop - drive the emulation thread");
    info!("  POST /input/:button/press|release    - set or clear an input bit");
    info!("  GET  /video                          - video RAM bytes");
    info!("  GET  /metrics                        - Prometheus metrics endpoint");

    warp::serve(routes(remote)).run(([127, 0, 0, 1], port)).await;
}

fn with_remote(
    remote: Remote,
) -> impl Filter<Extract = (Remote,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || remote.clone())
}

async fn get_state_handler(remote: Remote) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let response = ApiResponse::success(current_state(&remote));
    record_api_request("GET", "/state", 200, timer.elapsed());
    Ok(warp::reply::json(&response))
}

async fn control_handler(
    action: String,
    remote: Remote,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let control = &remote.control;

    let outcome = match action.as_str() {
        "pause" => control
            .pause()
            .then_some(())
            .ok_or("emulation is not running"),
        "resume" => control
            .resume()
            .then_some(())
            .ok_or("emulation is not paused"),
        "step" => {
            if control.step() {
                let waiting = std::sync::Arc::clone(control);
                // The step completes on the emulation thread.
                match tokio::task::spawn_blocking(move || waiting.wait_until_settled()).await {
                    Ok(state) => debug!("step settled in state {:?}", state),
                    Err(err) => debug!("waiting for step failed: {}", err),
                }
                Ok(())
            } else {
                Err("pause the emulator before stepping")
            }
        }
        "stop" => {
            control.stop();
            Ok(())
        }
        _ => return Err(warp::reject::not_found()),
    };

    let endpoint = format!("/{}", action);
    let (response, status) = match outcome {
        Ok(()) => (ApiResponse::success(current_state(&remote)), StatusCode::OK),
        Err(msg) => (ApiResponse::error(msg.to_string()), StatusCode::CONFLICT),
    };
    record_api_request("POST", &endpoint, status.as_u16(), timer.elapsed());
    Ok(warp::reply::with_status(warp::reply::json(&response), status))
}

async fn input_handler(
    button: String,
    action: String,
    remote: Remote,
) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();

    let pressed = match action.as_str() {
        "press" => Some(true),
        "release" => Some(false),
        _ => None,
    };
    let result = match (button.parse::<Button>(), pressed) {
        (Ok(button), Some(pressed)) => {
            remote.latches.set_button(button, pressed);
            Ok(InputChange {
                button,
                pressed,
                port: button.port(),
                value: remote.latches.input(button.port()).unwrap_or(0),
            })
        }
        (Err(msg), _) => Err(msg),
        (_, None) => Err(format!("unknown action '{}', use press or release", action)),
    };

    let (response, status) = match result {
        Ok(change) => (ApiResponse::success(change), StatusCode::OK),
        Err(msg) => (ApiResponse::error(msg), StatusCode::BAD_REQUEST),
    };
    record_api_request("POST", "/input/:button/:action", status.as_u16(), timer.elapsed());
    Ok(warp::reply::with_status(warp::reply::json(&response), status))
}

async fn video_handler(remote: Remote) -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();
    let response = ApiResponse::success(remote.video.snapshot());
    record_api_request("GET", "/video", 200, timer.elapsed());
    Ok(warp::reply::json(&response))
}

async fn metrics_handler() -> Result<impl warp::Reply, warp::Rejection> {
    let timer = Timer::new();

    match gather_metrics() {
        Ok(metrics_text) => {
            record_api_request("GET", "/metrics", 200, timer.elapsed());
            Ok(warp::reply::with_header(
                metrics_text,
                "content-type",
                "text/plain; version=0.0.4",
            ))
        }
        Err(_) => {
            record_api_request("GET", "/metrics", 500, timer.elapsed());
            Ok(warp::reply::with_header(
                "Error encoding metrics".to_string(),
                "content-type",
                "text/plain",
            ))
        }
    }
}

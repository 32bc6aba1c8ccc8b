//! HTTP surface: camera control, the MJPEG live feed, and read-only
//! attendance and roster queries.

use crate::controller::{OpenFrameSource, SessionController, StartOutcome, StopOutcome};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Local, NaiveDate};
use rollcall_core::Identity;
use rollcall_store::{AttendanceRecord, AttendanceStore, StoreError};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Part boundary for the multipart MJPEG stream.
const FEED_BOUNDARY: &str = "frame";

pub struct AppState<O: OpenFrameSource> {
    pub controller: Arc<SessionController<O>>,
    pub store: Arc<AttendanceStore>,
}

impl<O: OpenFrameSource> Clone for AppState<O> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            store: self.store.clone(),
        }
    }
}

pub fn router<O: OpenFrameSource>(state: AppState<O>) -> Router {
    Router::new()
        .route("/api/camera/start", post(start_camera::<O>))
        .route("/api/camera/stop", post(stop_camera::<O>))
        .route("/video/feed", get(video_feed::<O>))
        .route("/api/attendance/today", get(attendance_today::<O>))
        .route("/api/students", get(list_students::<O>))
        .with_state(state)
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    message: String,
}

#[derive(Serialize)]
struct AttendanceTodayResponse {
    date: NaiveDate,
    total_students: usize,
    present_count: usize,
    students: Vec<AttendanceRecord>,
}

#[derive(Serialize)]
struct StudentsResponse {
    count: usize,
    students: Vec<Identity>,
}

async fn start_camera<O: OpenFrameSource>(State(state): State<AppState<O>>) -> Response {
    // Opens the device and spawns the capture thread; keep it off the async
    // workers.
    let controller = state.controller.clone();
    match tokio::task::spawn_blocking(move || controller.start()).await {
        Ok(Ok(StartOutcome::Started)) => Json(StatusResponse {
            status: "running",
            message: "camera session started".into(),
        })
        .into_response(),
        Ok(Ok(StartOutcome::AlreadyRunning)) => Json(StatusResponse {
            status: "running",
            message: "camera session already running".into(),
        })
        .into_response(),
        Ok(Err(err)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(StatusResponse {
                status: "idle",
                message: err.to_string(),
            }),
        )
            .into_response(),
        Err(err) => task_failed(err),
    }
}

async fn stop_camera<O: OpenFrameSource>(State(state): State<AppState<O>>) -> Response {
    // Stop joins the capture thread before acking.
    let controller = state.controller.clone();
    match tokio::task::spawn_blocking(move || controller.stop()).await {
        Ok(StopOutcome::Stopped) => Json(StatusResponse {
            status: "idle",
            message: "camera session stopped".into(),
        })
        .into_response(),
        Ok(StopOutcome::WasIdle) => Json(StatusResponse {
            status: "idle",
            message: "camera was not running".into(),
        })
        .into_response(),
        Err(err) => task_failed(err),
    }
}

/// Long-lived multipart/x-mixed-replace stream of annotated JPEG frames.
async fn video_feed<O: OpenFrameSource>(State(state): State<AppState<O>>) -> Response {
    let rx = state.controller.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(jpeg) => Some(Ok::<_, Infallible>(feed_part(&jpeg))),
        // A lagged viewer just skips ahead to the newest frame.
        Err(_) => None,
    });

    match Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={FEED_BOUNDARY}"),
        )
        .body(Body::from_stream(stream))
    {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "failed to build feed response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn attendance_today<O: OpenFrameSource>(State(state): State<AppState<O>>) -> Response {
    let today = Local::now().date_naive();
    let store = state.store.clone();
    let result = tokio::task::spawn_blocking(move || {
        let students = store.attendance_on(today)?;
        let total_students = store.student_count()?;
        Ok::<_, StoreError>((students, total_students))
    })
    .await;

    match result {
        Ok(Ok((students, total_students))) => Json(AttendanceTodayResponse {
            date: today,
            total_students,
            present_count: students.len(),
            students,
        })
        .into_response(),
        Ok(Err(err)) => store_failed(err),
        Err(err) => task_failed(err),
    }
}

async fn list_students<O: OpenFrameSource>(State(state): State<AppState<O>>) -> Response {
    let store = state.store.clone();
    let result = tokio::task::spawn_blocking(move || store.students()).await;

    match result {
        Ok(Ok(students)) => Json(StudentsResponse {
            count: students.len(),
            students,
        })
        .into_response(),
        Ok(Err(err)) => store_failed(err),
        Err(err) => task_failed(err),
    }
}

fn store_failed(err: StoreError) -> Response {
    tracing::error!(error = %err, "store query failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(StatusResponse {
            status: "error",
            message: err.to_string(),
        }),
    )
        .into_response()
}

fn task_failed(err: tokio::task::JoinError) -> Response {
    tracing::error!(error = %err, "handler task failed");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

/// One multipart body part: boundary line, part headers, JPEG bytes.
fn feed_part(jpeg: &[u8]) -> Vec<u8> {
    let mut part = Vec::with_capacity(jpeg.len() + 80);
    part.extend_from_slice(
        format!(
            "--{FEED_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            jpeg.len()
        )
        .as_bytes(),
    );
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn test_feed_part_framing() {
        let jpeg = [0xFFu8, 0xD8, 0xFF, 0xD9];
        let part = feed_part(&jpeg);
        let text = String::from_utf8_lossy(&part[..part.len() - jpeg.len() - 2]);
        assert!(text.starts_with("--frame\r\n"));
        assert!(text.contains("Content-Type: image/jpeg\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(part.ends_with(b"\xFF\xD9\r\n"));
    }

    #[test]
    fn test_attendance_today_response_shape() {
        let response = AttendanceTodayResponse {
            date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            total_students: 30,
            present_count: 1,
            students: vec![AttendanceRecord {
                student_id: "S001".into(),
                display_name: "Student S001".into(),
                department: "CSE".into(),
                date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
                time: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                status: "Present".into(),
            }],
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["date"], "2026-03-02");
        assert_eq!(value["total_students"], 30);
        assert_eq!(value["present_count"], 1);
        assert_eq!(value["students"][0]["student_id"], "S001");
        assert_eq!(value["students"][0]["time"], "09:30:00");
    }

    #[test]
    fn test_students_response_shape() {
        let response = StudentsResponse {
            count: 1,
            students: vec![Identity {
                student_id: "S001".into(),
                display_name: "Student S001".into(),
                department: "CSE".into(),
                year: "3".into(),
                section: "A".into(),
            }],
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["count"], 1);
        assert_eq!(value["students"][0]["section"], "A");
    }
}

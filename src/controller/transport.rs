//! Controller to worker transport.
//!
//! Workers listen on a TCP port. Control messages are framed as a 4-byte
//! big-endian length followed by a JSON body. A job push is the framed
//! `PUSH_JOB` message followed by `package_size` raw bytes, and the worker
//! replies with the unframed bytes `ACK`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::DEFAULT_WORKER_PORT;
use crate::scheduler::job::JobStatus;
use crate::scheduler::worker::CurrentLoad;
use crate::storage::NewCrash;

/// Largest control frame accepted from a worker.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Reply a worker sends after receiving a job package.
pub const ACK: &[u8] = b"ACK";

/// Errors that can occur while talking to a worker.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame of {0} bytes exceeds limit")]
    FrameTooLarge(u32),

    #[error("Worker did not acknowledge job: {0:?}")]
    NotAcknowledged(String),

    #[error("Worker reported an error: {0}")]
    Worker(String),
}

/// Control messages sent to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    PushJob {
        job_id: i64,
        config: serde_json::Value,
        package_size: u64,
    },
    StatusRequest,
    CrashRequest {
        job_id: i64,
    },
}

/// Per-job state reported by a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    #[serde(default)]
    pub running: Option<bool>,
    /// Explicit outcome: `completed` or `failed`.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub vm_count: u32,
    #[serde(default)]
    pub crashes: u64,
}

impl JobReport {
    /// Terminal status the worker reports for the job, if any.
    ///
    /// An explicit `state` wins. Otherwise a job the worker reports as no
    /// longer running has completed.
    pub fn terminal_status(&self) -> Option<JobStatus> {
        match self.state.as_deref() {
            Some("completed") => Some(JobStatus::Completed),
            Some("failed") => Some(JobStatus::Failed),
            Some(_) => None,
            None if self.running == Some(false) => Some(JobStatus::Completed),
            None => None,
        }
    }
}

/// Reply to `STATUS_REQUEST`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Reports keyed by job ID.
    #[serde(default)]
    pub status: BTreeMap<i64, JobReport>,
    /// Load measured by the worker itself.
    #[serde(default)]
    pub load: Option<CurrentLoad>,
}

impl StatusResponse {
    /// VM slots in use across all reported jobs.
    pub fn used_vms(&self) -> u32 {
        self.status.values().map(|r| r.vm_count).sum()
    }
}

/// A crash as sent by a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    #[serde(default)]
    pub testcase_path: Option<String>,
    #[serde(default)]
    pub crash_type: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub exploitability: Option<String>,
    #[serde(default)]
    pub crash_file: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub duplicate_count: u32,
}

impl From<CrashReport> for NewCrash {
    fn from(report: CrashReport) -> Self {
        NewCrash {
            testcase_path: report.testcase_path,
            crash_type: report.crash_type,
            details: report.details,
            signature: report.signature,
            exploitability: report.exploitability,
            crash_file: report.crash_file,
            timestamp: report
                .timestamp
                .and_then(|secs| DateTime::<Utc>::from_timestamp_millis((secs * 1000.0) as i64)),
            duplicate_count: report.duplicate_count,
        }
    }
}

/// Reply to `CRASH_REQUEST`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrashResponse {
    #[serde(default)]
    pub crashes: Vec<CrashReport>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Client side of the worker protocol.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Sends a job and its package. Succeeds only if the worker acknowledges.
    async fn push_job(
        &self,
        worker_ip: &str,
        job_id: i64,
        config: &serde_json::Value,
        package: &[u8],
    ) -> Result<(), TransportError>;

    /// Asks a worker for its per-job status.
    async fn request_status(&self, worker_ip: &str) -> Result<StatusResponse, TransportError>;

    /// Asks a worker for the crashes found by one job.
    async fn request_crashes(
        &self,
        worker_ip: &str,
        job_id: i64,
    ) -> Result<Vec<CrashReport>, TransportError>;
}

/// Writes one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len()).map_err(|_| TransportError::FrameTooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed JSON frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

async fn with_timeout<F, T>(timeout: Duration, fut: F) -> Result<T, TransportError>
where
    F: std::future::Future<Output = Result<T, TransportError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
}

/// TCP implementation of [`WorkerTransport`]. Opens one connection per
/// operation.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    port: u16,
    push_timeout: Duration,
    request_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            port: DEFAULT_WORKER_PORT,
            push_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl TcpTransport {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_timeouts(mut self, push: Duration, request: Duration) -> Self {
        self.push_timeout = push;
        self.request_timeout = request;
        self
    }

    async fn connect(&self, worker_ip: &str) -> Result<TcpStream, TransportError> {
        let stream = TcpStream::connect((worker_ip, self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        worker_ip: &str,
        message: &ControlMessage,
    ) -> Result<T, TransportError> {
        with_timeout(self.request_timeout, async {
            let mut stream = self.connect(worker_ip).await?;
            write_frame(&mut stream, message).await?;
            read_frame(&mut stream).await
        })
        .await
    }
}

#[async_trait]
impl WorkerTransport for TcpTransport {
    async fn push_job(
        &self,
        worker_ip: &str,
        job_id: i64,
        config: &serde_json::Value,
        package: &[u8],
    ) -> Result<(), TransportError> {
        let message = ControlMessage::PushJob {
            job_id,
            config: config.clone(),
            package_size: package.len() as u64,
        };

        with_timeout(self.push_timeout, async {
            let mut stream = self.connect(worker_ip).await?;
            write_frame(&mut stream, &message).await?;
            stream.write_all(package).await?;
            stream.flush().await?;

            let mut reply = Vec::with_capacity(ACK.len());
            let mut buf = [0u8; 64];
            while reply.len() < ACK.len() {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                reply.extend_from_slice(&buf[..n]);
            }

            if reply.as_slice() == ACK {
                debug!(worker_ip, job_id, bytes = package.len(), "Worker acknowledged job");
                Ok(())
            } else {
                Err(TransportError::NotAcknowledged(
                    String::from_utf8_lossy(&reply).into_owned(),
                ))
            }
        })
        .await
    }

    async fn request_status(&self, worker_ip: &str) -> Result<StatusResponse, TransportError> {
        self.request(worker_ip, &ControlMessage::StatusRequest).await
    }

    async fn request_crashes(
        &self,
        worker_ip: &str,
        job_id: i64,
    ) -> Result<Vec<CrashReport>, TransportError> {
        let response: CrashResponse = self
            .request(worker_ip, &ControlMessage::CrashRequest { job_id })
            .await?;

        match response.error {
            Some(error) if response.crashes.is_empty() => Err(TransportError::Worker(error)),
            _ => Ok(response.crashes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_wire_names() {
        let json = serde_json::to_value(ControlMessage::StatusRequest).unwrap();
        assert_eq!(json, serde_json::json!({"type": "STATUS_REQUEST"}));

        let json = serde_json::to_value(ControlMessage::CrashRequest { job_id: 4 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "CRASH_REQUEST", "job_id": 4}));

        let json = serde_json::to_value(ControlMessage::PushJob {
            job_id: 1,
            config: serde_json::json!({"fuzzer": "afl"}),
            package_size: 10,
        })
        .unwrap();
        assert_eq!(json["type"], "PUSH_JOB");
        assert_eq!(json["package_size"], 10);
    }

    #[test]
    fn test_status_response_parses_string_job_keys() {
        let raw = r#"{
            "type": "STATUS_RESPONSE",
            "status": {
                "3": {"running": true, "vm_count": 2, "crashes": 1, "db_path": "/tmp/x.db"},
                "7": {"running": false, "vm_count": 1}
            }
        }"#;
        let response: StatusResponse = serde_json::from_str(raw).unwrap();

        assert_eq!(response.used_vms(), 3);
        assert!(response.load.is_none());
        assert_eq!(response.status[&3].terminal_status(), None);
        assert_eq!(response.status[&7].terminal_status(), Some(JobStatus::Completed));
    }

    #[test]
    fn test_explicit_state_wins() {
        let report = JobReport {
            running: Some(false),
            state: Some("failed".to_string()),
            error: Some("harness died".to_string()),
            ..Default::default()
        };
        assert_eq!(report.terminal_status(), Some(JobStatus::Failed));
    }

    #[test]
    fn test_crash_report_timestamp_conversion() {
        let report: CrashReport =
            serde_json::from_str(r#"{"crash_type": "SIGSEGV", "timestamp": 1700000000}"#).unwrap();
        let crash: NewCrash = report.into();

        assert_eq!(crash.crash_type.as_deref(), Some("SIGSEGV"));
        assert_eq!(crash.timestamp.map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_frame_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, &ControlMessage::CrashRequest { job_id: 9 })
            .await
            .unwrap();
        let received: ControlMessage = read_frame(&mut server).await.unwrap();

        assert_eq!(received, ControlMessage::CrashRequest { job_id: 9 });
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_LEN + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame::<_, ControlMessage>(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge(_)));
    }
}

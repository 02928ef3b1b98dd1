//! Operations against the container daemon.
//!
//! One connection per operation: the daemon either closes the connection
//! after the response or upgrades it (exec). Unary operations run under a
//! 30-second deadline; streaming reads (build progress, exec frames) under
//! a 300-second per-read deadline.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::db::models::LogStream;
use crate::errors::DaemonError;

use super::http::{api_error, DaemonConnection, STREAM_TIMEOUT, UNARY_TIMEOUT};
use super::mux::FrameDecoder;
use super::ndjson::{image_id_from_progress, BuildEvent, BuildProgressParser};
use super::socket::resolve_socket_path;
use super::tar::single_file_archive;

/// How many progress lines a build error retains for diagnostics.
pub const BUILD_PROGRESS_TAIL: usize = 100;

#[derive(Clone)]
pub struct DaemonClient {
    socket: PathBuf,
}

/// Container creation parameters, serialized in the daemon's field naming.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ContainerSpec {
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Cmd")]
    pub cmd: Vec<String>,
    #[serde(rename = "Env")]
    pub env: Vec<String>,
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "User", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "Tty")]
    pub tty: bool,
    #[serde(rename = "Labels")]
    pub labels: std::collections::HashMap<String, String>,
    #[serde(rename = "HostConfig")]
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct HostConfig {
    #[serde(rename = "Binds")]
    pub binds: Vec<String>,
    #[serde(rename = "NetworkMode")]
    pub network_mode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecSpec {
    #[serde(rename = "Cmd")]
    pub cmd: Vec<String>,
    #[serde(rename = "AttachStdout")]
    pub attach_stdout: bool,
    #[serde(rename = "AttachStderr")]
    pub attach_stderr: bool,
    #[serde(rename = "Tty")]
    pub tty: bool,
    #[serde(rename = "Env", skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "User", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl ExecSpec {
    pub fn new(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            attach_stdout: true,
            attach_stderr: true,
            tty: false,
            env: Vec::new(),
            user: None,
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerState {
    pub running: bool,
    pub status: String,
}

#[derive(Deserialize)]
struct IdResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct ExecInspectResponse {
    #[serde(rename = "ExitCode")]
    exit_code: Option<i64>,
}

#[derive(Deserialize)]
struct ContainerInspectResponse {
    #[serde(rename = "State")]
    state: InspectState,
}

#[derive(Deserialize)]
struct InspectState {
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "Status")]
    status: String,
}

impl DaemonClient {
    /// Client against the resolved daemon socket (cached process-wide).
    pub fn from_env() -> Result<Self, DaemonError> {
        Ok(Self {
            socket: resolve_socket_path()?,
        })
    }

    /// Client against an explicit socket path (tests, operator override).
    pub fn with_socket(socket: PathBuf) -> Self {
        Self { socket }
    }

    /// GET `/_ping`.
    pub async fn ping(&self) -> Result<(), DaemonError> {
        let path = "/_ping";
        let mut conn = DaemonConnection::open(&self.socket, path).await?;
        conn.send_request("GET", &[], None).await?;
        let head = conn.read_head(UNARY_TIMEOUT).await?;
        let body = conn.read_body(&head, UNARY_TIMEOUT).await?;
        if head.status >= 400 {
            return Err(api_error(path, head.status, &body));
        }
        Ok(())
    }

    /// Build an image from a recipe. The recipe is wrapped as a
    /// single-entry tar named `Dockerfile` and posted with chunked
    /// transfer-encoding. Progress lines are forwarded to `on_progress`;
    /// the image id comes from an `aux` record or a `Successfully built`
    /// marker. An `errorDetail` line fails the build regardless of earlier
    /// progress.
    pub async fn build_image(
        &self,
        recipe: &str,
        tag: &str,
        on_progress: &mut (dyn FnMut(&str) + Send),
    ) -> Result<String, DaemonError> {
        let path = format!("/build?t={}&dockerfile=Dockerfile", urlencode(tag));
        let archive = single_file_archive("Dockerfile", recipe.as_bytes());

        let mut conn = DaemonConnection::open(&self.socket, &path).await?;
        conn.send_chunked_request(
            "POST",
            &[("Content-Type", "application/x-tar")],
            &archive,
        )
        .await?;
        let head = conn.read_head(STREAM_TIMEOUT).await?;
        if head.status >= 400 {
            let body = conn.read_body(&head, UNARY_TIMEOUT).await?;
            return Err(api_error(&path, head.status, &body));
        }

        let mut parser = BuildProgressParser::new();
        let mut tail: Vec<String> = Vec::new();
        let mut image_id: Option<String> = None;
        let mut error: Option<String> = None;

        {
            let mut on_bytes = |bytes: &[u8]| {
                for event in parser.feed(bytes) {
                    apply_build_event(event, on_progress, &mut tail, &mut image_id, &mut error);
                }
            };
            conn.stream_body(&head, STREAM_TIMEOUT, &mut on_bytes).await?;
        }
        for event in parser.finish() {
            apply_build_event(event, on_progress, &mut tail, &mut image_id, &mut error);
        }

        if let Some(message) = error {
            return Err(DaemonError::Build {
                message,
                progress: tail,
            });
        }
        image_id.ok_or(DaemonError::Build {
            message: "build stream ended without an image id".to_string(),
            progress: tail,
        })
    }

    /// POST `/containers/create` then `/containers/{id}/start`; returns the
    /// container id.
    pub async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, DaemonError> {
        let id = self.create_container(spec).await?;
        self.start_container(&id).await?;
        Ok(id)
    }

    pub async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DaemonError> {
        let path = "/containers/create";
        let body = serde_json::to_vec(spec)
            .map_err(|e| DaemonError::protocol(path, format!("spec encoding: {}", e)))?;
        let response: IdResponse = self.unary_json("POST", path, Some(&body)).await?;
        Ok(response.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), DaemonError> {
        let path = format!("/containers/{}/start", id);
        let mut conn = DaemonConnection::open(&self.socket, &path).await?;
        conn.send_request("POST", &[("Content-Type", "application/json")], None)
            .await?;
        let head = conn.read_head(UNARY_TIMEOUT).await?;
        let body = conn.read_body(&head, UNARY_TIMEOUT).await?;
        // 304: already started.
        if head.status >= 400 {
            return Err(api_error(&path, head.status, &body));
        }
        Ok(())
    }

    /// Run a command in the container, streaming multiplexed output to
    /// `sink` as it arrives. Returns the exit code after the stream closes.
    pub async fn exec_streaming(
        &self,
        container_id: &str,
        spec: &ExecSpec,
        sink: &mut (dyn FnMut(LogStream, &[u8]) + Send),
    ) -> Result<i64, DaemonError> {
        // Create the exec instance.
        let create_path = format!("/containers/{}/exec", container_id);
        let body = serde_json::to_vec(spec)
            .map_err(|e| DaemonError::protocol(&create_path, format!("spec encoding: {}", e)))?;
        let created: IdResponse = self.unary_json("POST", &create_path, Some(&body)).await?;
        let exec_id = created.id;

        // Start it with a connection upgrade; the remainder of the stream
        // carries multiplexed frames.
        let start_path = format!("/exec/{}/start", exec_id);
        let mut conn = DaemonConnection::open(&self.socket, &start_path).await?;
        conn.send_request(
            "POST",
            &[
                ("Content-Type", "application/json"),
                ("Connection", "Upgrade"),
                ("Upgrade", "tcp"),
            ],
            Some(br#"{"Detach":false,"Tty":false}"#),
        )
        .await?;
        let head = conn.read_head(STREAM_TIMEOUT).await?;
        if head.status >= 400 {
            let body = conn.read_body(&head, UNARY_TIMEOUT).await?;
            return Err(api_error(&start_path, head.status, &body));
        }

        let mut decoder = FrameDecoder::new();
        let mut chunk = Vec::with_capacity(16 * 1024);
        loop {
            chunk.clear();
            let n = conn.read_upgraded(&mut chunk, STREAM_TIMEOUT).await?;
            if n == 0 {
                break;
            }
            for frame in decoder.feed(&chunk) {
                sink(frame.stream, &frame.payload);
            }
        }
        if let Some(partial) = decoder.finish() {
            sink(partial.stream, &partial.payload);
        }

        // The exec instance records the exit code once the stream is done.
        let inspect_path = format!("/exec/{}/json", exec_id);
        let inspect: ExecInspectResponse = self.unary_json("GET", &inspect_path, None).await?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }

    /// GET `/containers/{id}/json`; `None` when the container is gone.
    pub async fn inspect_container(
        &self,
        id: &str,
    ) -> Result<Option<ContainerState>, DaemonError> {
        let path = format!("/containers/{}/json", id);
        let mut conn = DaemonConnection::open(&self.socket, &path).await?;
        conn.send_request("GET", &[], None).await?;
        let head = conn.read_head(UNARY_TIMEOUT).await?;
        let body = conn.read_body(&head, UNARY_TIMEOUT).await?;
        if head.status == 404 {
            return Ok(None);
        }
        if head.status >= 400 {
            return Err(api_error(&path, head.status, &body));
        }
        let inspect: ContainerInspectResponse = serde_json::from_slice(&body)
            .map_err(|e| DaemonError::protocol(&path, format!("inspect decoding: {}", e)))?;
        Ok(Some(ContainerState {
            running: inspect.state.running,
            status: inspect.state.status,
        }))
    }

    /// Stop then force-remove a container. Not-running and already-gone
    /// responses are ignored so teardown stays idempotent.
    pub async fn stop_and_remove(&self, id: &str) -> Result<(), DaemonError> {
        let stop_path = format!("/containers/{}/stop?t=10", id);
        let mut conn = DaemonConnection::open(&self.socket, &stop_path).await?;
        conn.send_request("POST", &[], None).await?;
        let head = conn.read_head(UNARY_TIMEOUT).await?;
        let body = conn.read_body(&head, UNARY_TIMEOUT).await?;
        if head.status >= 400 && head.status != 404 {
            let err = api_error(&stop_path, head.status, &body);
            if !is_not_running(&err) {
                return Err(err);
            }
        }

        let remove_path = format!("/containers/{}?force=true", id);
        let mut conn = DaemonConnection::open(&self.socket, &remove_path).await?;
        conn.send_request("DELETE", &[], None).await?;
        let head = conn.read_head(UNARY_TIMEOUT).await?;
        let body = conn.read_body(&head, UNARY_TIMEOUT).await?;
        if head.status >= 400 && head.status != 404 {
            return Err(api_error(&remove_path, head.status, &body));
        }
        Ok(())
    }

    async fn unary_json<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<T, DaemonError> {
        let mut conn = DaemonConnection::open(&self.socket, path).await?;
        let headers: &[(&str, &str)] = if body.is_some() {
            &[("Content-Type", "application/json")]
        } else {
            &[]
        };
        conn.send_request(method, headers, body).await?;
        let head = conn.read_head(UNARY_TIMEOUT).await?;
        let response_body = conn.read_body(&head, UNARY_TIMEOUT).await?;
        if head.status >= 400 {
            return Err(api_error(path, head.status, &response_body));
        }
        serde_json::from_slice(&response_body)
            .map_err(|e| DaemonError::protocol(path, format!("response decoding: {}", e)))
    }
}

fn apply_build_event(
    event: BuildEvent,
    on_progress: &mut (dyn FnMut(&str) + Send),
    tail: &mut Vec<String>,
    image_id: &mut Option<String>,
    error: &mut Option<String>,
) {
    match event {
        BuildEvent::Progress(line) => {
            if let Some(id) = image_id_from_progress(&line) {
                *image_id = Some(id);
            }
            on_progress(&line);
            tail.push(line);
            if tail.len() > BUILD_PROGRESS_TAIL {
                let excess = tail.len() - BUILD_PROGRESS_TAIL;
                tail.drain(..excess);
            }
        }
        BuildEvent::ImageId(id) => *image_id = Some(id),
        BuildEvent::Error(message) => {
            if error.is_none() {
                *error = Some(message);
            }
        }
    }
}

fn is_not_running(err: &DaemonError) -> bool {
    match err {
        DaemonError::Api { status, message, .. } => {
            *status == 304 || message.contains("is not running")
        }
        _ => false,
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::testutil::{
        chunked_ndjson_response, exec_upgrade_response, fake_daemon, response,
    };

    #[tokio::test]
    async fn test_ping_success() {
        let (socket, _dir) = fake_daemon(vec![response("200 OK", "", "OK")]).await;
        let client = DaemonClient::with_socket(socket);
        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_api_error_is_decoded() {
        let (socket, _dir) = fake_daemon(vec![response(
            "500 Internal Server Error",
            "Content-Type: application/json\r\n",
            "{\"message\":\"daemon on fire\"}",
        )])
        .await;
        let client = DaemonClient::with_socket(socket);
        let err = client.ping().await.unwrap_err();
        match err {
            DaemonError::Api { status, message, path } => {
                assert_eq!(status, 500);
                assert_eq!(message, "daemon on fire");
                assert_eq!(path, "/_ping");
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_error_when_socket_missing() {
        let dir = tempfile::tempdir().unwrap();
        let client = DaemonClient::with_socket(dir.path().join("absent.sock"));
        assert!(matches!(
            client.ping().await.unwrap_err(),
            DaemonError::Transport { .. }
        ));
    }

    #[tokio::test]
    async fn test_build_image_streams_progress_and_returns_id() {
        let ndjson = concat!(
            "{\"stream\":\"Step 1/2 : FROM node:20\\n\"}\n",
            "{\"stream\":\"Step 2/2 : RUN true\\n\"}\n",
            "{\"aux\":{\"ID\":\"sha256:cafe\"}}\n",
        );
        let (socket, _dir) = fake_daemon(vec![chunked_ndjson_response(ndjson)]).await;
        let client = DaemonClient::with_socket(socket);
        let mut progress = Vec::new();
        let id = client
            .build_image("FROM node:20\nRUN true\n", "uc-workspace-acme-widget:1", &mut |line| {
                progress.push(line.to_string())
            })
            .await
            .unwrap();
        assert_eq!(id, "sha256:cafe");
        assert_eq!(progress.len(), 2);
        assert!(progress[0].contains("FROM node:20"));
    }

    #[tokio::test]
    async fn test_build_error_detail_fails_with_tail() {
        let ndjson = concat!(
            "{\"stream\":\"Step 1/2 : FROM node:20\\n\"}\n",
            "{\"errorDetail\":{\"message\":\"unknown instruction: FRMO\"}}\n",
        );
        let (socket, _dir) = fake_daemon(vec![chunked_ndjson_response(ndjson)]).await;
        let client = DaemonClient::with_socket(socket);
        let err = client
            .build_image("FRMO node:20\n", "uc-workspace-x:1", &mut |_| {})
            .await
            .unwrap_err();
        match err {
            DaemonError::Build { message, progress } => {
                assert_eq!(message, "unknown instruction: FRMO");
                assert_eq!(progress.len(), 1);
            }
            other => panic!("Expected Build error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_and_start() {
        let (socket, _dir) = fake_daemon(vec![
            response(
                "201 Created",
                "Content-Type: application/json\r\n",
                "{\"Id\":\"abc123\",\"Warnings\":[]}",
            ),
            response("204 No Content", "", ""),
        ])
        .await;
        let client = DaemonClient::with_socket(socket);
        let spec = ContainerSpec {
            image: "uc-workspace-acme-widget:1".to_string(),
            cmd: vec!["tail".into(), "-f".into(), "/home/agent/agent.log".into()],
            tty: true,
            host_config: HostConfig {
                binds: vec![],
                network_mode: "host".to_string(),
            },
            ..Default::default()
        };
        let id = client.create_and_start(&spec).await.unwrap();
        assert_eq!(id, "abc123");
    }

    #[tokio::test]
    async fn test_exec_streaming_full_flow() {
        // Frame: stdout "hello\n" then stderr "warn".
        let upgrade = exec_upgrade_response(&[(1, b"hello\n"), (2, b"warn")]);

        let (socket, _dir) = fake_daemon(vec![
            response(
                "201 Created",
                "Content-Type: application/json\r\n",
                "{\"Id\":\"exec42\"}",
            ),
            upgrade,
            response(
                "200 OK",
                "Content-Type: application/json\r\n",
                "{\"ExitCode\":0,\"Running\":false}",
            ),
        ])
        .await;

        let client = DaemonClient::with_socket(socket);
        let mut collected: Vec<(LogStream, Vec<u8>)> = Vec::new();
        let exit = client
            .exec_streaming(
                "abc123",
                &ExecSpec::new(vec!["bash".into(), "-lc".into(), "echo hello".into()]),
                &mut |stream, bytes| collected.push((stream, bytes.to_vec())),
            )
            .await
            .unwrap();
        assert_eq!(exit, 0);
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0], (LogStream::Stdout, b"hello\n".to_vec()));
        assert_eq!(collected[1], (LogStream::Stderr, b"warn".to_vec()));
    }

    #[tokio::test]
    async fn test_stop_and_remove_ignores_gone_container() {
        let (socket, _dir) = fake_daemon(vec![
            response(
                "404 Not Found",
                "Content-Type: application/json\r\n",
                "{\"message\":\"No such container\"}",
            ),
            response(
                "404 Not Found",
                "Content-Type: application/json\r\n",
                "{\"message\":\"No such container\"}",
            ),
        ])
        .await;
        let client = DaemonClient::with_socket(socket);
        client.stop_and_remove("gone").await.unwrap();
    }

    #[tokio::test]
    async fn test_inspect_absent_container_is_none() {
        let (socket, _dir) = fake_daemon(vec![response(
            "404 Not Found",
            "Content-Type: application/json\r\n",
            "{\"message\":\"No such container\"}",
        )])
        .await;
        let client = DaemonClient::with_socket(socket);
        assert!(client.inspect_container("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inspect_running_container() {
        let (socket, _dir) = fake_daemon(vec![response(
            "200 OK",
            "Content-Type: application/json\r\n",
            "{\"Id\":\"abc\",\"State\":{\"Running\":true,\"Status\":\"running\"}}",
        )])
        .await;
        let client = DaemonClient::with_socket(socket);
        let state = client.inspect_container("abc").await.unwrap().unwrap();
        assert!(state.running);
        assert_eq!(state.status, "running");
    }

    #[test]
    fn test_container_spec_serializes_daemon_field_names() {
        let spec = ContainerSpec {
            image: "img".to_string(),
            cmd: vec!["tail".into()],
            env: vec!["GITHUB_TOKEN=t".into()],
            working_dir: Some("/home/agent/repo".into()),
            user: Some("agent".into()),
            tty: true,
            labels: [("ucoder.workspace".to_string(), "7".to_string())]
                .into_iter()
                .collect(),
            host_config: HostConfig {
                binds: vec!["/a:/b:ro".into()],
                network_mode: "host".into(),
            },
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["Image"], "img");
        assert_eq!(value["HostConfig"]["NetworkMode"], "host");
        assert_eq!(value["HostConfig"]["Binds"][0], "/a:/b:ro");
        assert_eq!(value["Labels"]["ucoder.workspace"], "7");
        assert_eq!(value["WorkingDir"], "/home/agent/repo");
    }

    #[test]
    fn test_exec_spec_defaults() {
        let spec = ExecSpec::new(vec!["true".into()]);
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["AttachStdout"], true);
        assert_eq!(value["AttachStderr"], true);
        assert_eq!(value["Tty"], false);
        assert!(value.get("User").is_none());
    }

    #[test]
    fn test_urlencode_tag() {
        assert_eq!(urlencode("uc-workspace-acme-widget:3"), "uc-workspace-acme-widget:3");
        assert_eq!(urlencode("a b"), "a%20b");
    }
}

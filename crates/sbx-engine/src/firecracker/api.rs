//! Client for the Firecracker control API over its unix socket.
//!
//! Model types follow the machine's swagger definition; only the endpoints
//! the engine drives are covered.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};

pub struct FirecrackerApi {
    socket_path: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: i64,
    pub smt: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub enum ActionType {
    InstanceStart,
    SendCtrlAltDel,
}

#[derive(Serialize)]
struct InstanceActionInfo {
    action_type: ActionType,
}

/// Subset of `GET /` the engine consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub state: InstanceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum InstanceState {
    #[serde(rename = "Not started")]
    NotStarted,
    Running,
    Paused,
}

#[derive(Debug, Deserialize)]
struct FaultMessage {
    fault_message: String,
}

impl FirecrackerApi {
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            client: Client::unix(),
        }
    }

    /// Poll `GET /` until the VMM answers, within `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.socket_path.exists() && self.instance_info().await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "firecracker API at {} did not become ready within {:?}",
                    self.socket_path.display(),
                    timeout
                );
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn instance_info(&self) -> Result<InstanceInfo> {
        let body = self.request(Method::GET, "/", None).await?;
        serde_json::from_slice(&body).context("decoding instance info")
    }

    pub async fn put_machine_config(&self, config: &MachineConfig) -> Result<()> {
        self.put_json("/machine-config", config).await
    }

    pub async fn put_boot_source(&self, source: &BootSource) -> Result<()> {
        self.put_json("/boot-source", source).await
    }

    pub async fn put_drive(&self, drive: &Drive) -> Result<()> {
        self.put_json(&format!("/drives/{}", drive.drive_id), drive)
            .await
    }

    pub async fn put_network_interface(&self, iface: &NetworkInterface) -> Result<()> {
        self.put_json(&format!("/network-interfaces/{}", iface.iface_id), iface)
            .await
    }

    pub async fn action(&self, action_type: ActionType) -> Result<()> {
        self.put_json("/actions", &InstanceActionInfo { action_type })
            .await
    }

    async fn put_json<S: Serialize>(&self, path: &str, body: &S) -> Result<()> {
        let payload = serde_json::to_vec(body)?;
        self.request(Method::PUT, path, Some(payload)).await?;
        Ok(())
    }

    async fn request(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Bytes> {
        let uri: hyper::Uri = Uri::new(&self.socket_path, path).into();
        let request = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header(hyper::header::ACCEPT, "application/json")
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .context("building API request")?;

        let response = self
            .client
            .request(request)
            .await
            .with_context(|| format!("firecracker API {} {}", method, path))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .context("reading API response body")?
            .to_bytes();

        if status == StatusCode::OK || status == StatusCode::NO_CONTENT {
            return Ok(bytes);
        }

        let fault = serde_json::from_slice::<FaultMessage>(&bytes)
            .map(|f| f.fault_message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
        bail!("firecracker API {} {} returned {}: {}", method, path, status, fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_config_wire_format() {
        let config = MachineConfig {
            vcpu_count: 2,
            mem_size_mib: 1024,
            smt: false,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(json["vcpu_count"], 2);
        assert_eq!(json["mem_size_mib"], 1024);
        assert_eq!(json["smt"], false);
    }

    #[test]
    fn test_boot_source_omits_absent_args() {
        let source = BootSource {
            kernel_image_path: "/jail/vmlinux".to_string(),
            boot_args: None,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&source).unwrap()).unwrap();
        assert!(json.get("boot_args").is_none());
    }

    #[test]
    fn test_action_wire_format() {
        let json = serde_json::to_string(&InstanceActionInfo {
            action_type: ActionType::InstanceStart,
        })
        .unwrap();
        assert_eq!(json, r#"{"action_type":"InstanceStart"}"#);
    }

    #[test]
    fn test_instance_state_parses_not_started() {
        let info: InstanceInfo = serde_json::from_str(
            r#"{"app_name":"Firecracker","id":"sb","state":"Not started","vmm_version":"1.10.0"}"#,
        )
        .unwrap();
        assert_eq!(info.state, InstanceState::NotStarted);
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_without_socket() {
        let api = FirecrackerApi::new(Path::new("/nonexistent/api.socket"));
        let err = api.wait_ready(Duration::from_millis(80)).await.unwrap_err();
        assert!(err.to_string().contains("did not become ready"));
    }
}

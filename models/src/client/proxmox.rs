/*!
A `HypervisorClient` for the Proxmox VE REST API, authenticated with an API token.

Mutating endpoints return a task id (UPID); every mutation waits for its task to stop before returning.
*/

use super::error::{self, Result};
use super::HypervisorClient;
use crate::node::{DownloadRequest, VmHandle, VmRequest};

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use snafu::{ensure, OptionExt, ResultExt};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{event, instrument, Level};

const PROXMOX_ENDPOINT_ENV_VAR: &str = "PROXMOX_ENDPOINT";
const PROXMOX_TOKEN_ID_ENV_VAR: &str = "PROXMOX_TOKEN_ID";
const PROXMOX_TOKEN_SECRET_ENV_VAR: &str = "PROXMOX_TOKEN_SECRET";
const PROXMOX_INSECURE_ENV_VAR: &str = "PROXMOX_INSECURE";

const TASK_POLL_INTERVAL: Duration = Duration::from_secs(2);
// Large ISO downloads are the slowest tasks we wait for.
const TASK_MAX_POLLS: u32 = 900;

/// Connection settings for the Proxmox VE API.
#[derive(Clone)]
pub struct ProxmoxSettings {
    /// e.g. `https://pve01.lan:8006`
    pub endpoint: String,
    /// e.g. `root@pam!talosforge`
    pub token_id: String,
    pub token_secret: String,
    /// Accept self-signed certificates.
    pub insecure: bool,
}

impl fmt::Debug for ProxmoxSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxmoxSettings")
            .field("endpoint", &self.endpoint)
            .field("token_id", &self.token_id)
            .field("token_secret", &"<redacted>")
            .field("insecure", &self.insecure)
            .finish()
    }
}

fn required_env(variable: &str) -> Result<String> {
    std::env::var(variable)
        .ok()
        .filter(|value| !value.is_empty())
        .context(error::MissingHypervisorSettingSnafu { variable })
}

impl ProxmoxSettings {
    pub fn from_env() -> Result<Self> {
        let insecure = match std::env::var(PROXMOX_INSECURE_ENV_VAR) {
            Ok(value) => value
                .to_lowercase()
                .parse::<bool>()
                .ok()
                .context(error::InvalidHypervisorSettingSnafu {
                    variable: PROXMOX_INSECURE_ENV_VAR,
                    value,
                })?,
            Err(_) => false,
        };

        Ok(ProxmoxSettings {
            endpoint: required_env(PROXMOX_ENDPOINT_ENV_VAR)?
                .trim_end_matches('/')
                .to_string(),
            token_id: required_env(PROXMOX_TOKEN_ID_ENV_VAR)?,
            token_secret: required_env(PROXMOX_TOKEN_SECRET_ENV_VAR)?,
            insecure,
        })
    }

    fn authorization(&self) -> String {
        format!("PVEAPIToken={}={}", self.token_id, self.token_secret)
    }
}

/// Every Proxmox API response wraps its payload in `data`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct QemuEntry {
    vmid: u32,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    exitstatus: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorageEntry {
    volid: String,
}

/// Escapes a value for use as a single URL path segment.
fn encode_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            ':' => "%3A".to_string(),
            '/' => "%2F".to_string(),
            '@' => "%40".to_string(),
            '!' => "%21".to_string(),
            other => other.to_string(),
        })
        .collect()
}

/// The form parameters of `POST /nodes/{node}/qemu` for a VM request.
pub(crate) fn vm_params(request: &VmRequest, vm_id: u32) -> Vec<(String, String)> {
    let nameservers = request
        .cloud_init
        .dns_servers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");

    vec![
        ("vmid", vm_id.to_string()),
        ("name", request.name.clone()),
        ("bios", request.bios.clone()),
        (
            "efidisk0",
            format!(
                "{}:1,efitype={},format={}",
                request.efi_disk.datastore, request.efi_disk.efi_type, request.efi_disk.format
            ),
        ),
        ("cores", request.cpu.cores.to_string()),
        ("sockets", request.cpu.sockets.to_string()),
        ("cpu", request.cpu.cpu_type.clone()),
        ("memory", request.memory_mb.to_string()),
        (
            request.disk.interface.as_str(),
            format!(
                "{}:{},format={}",
                request.disk.datastore, request.disk.size_gb, request.disk.format
            ),
        ),
        (
            "net0",
            format!("{},bridge={}", request.nic.model, request.nic.bridge),
        ),
        (
            request.cloud_init.interface.as_str(),
            format!("{}:cloudinit", request.cloud_init.datastore),
        ),
        ("citype", request.cloud_init.init_type.clone()),
        (
            "ipconfig0",
            format!(
                "ip={},gw={}",
                request.cloud_init.address, request.cloud_init.gateway
            ),
        ),
        ("nameserver", nameservers),
        (
            request.cdrom.interface.as_str(),
            format!("{},media=cdrom", request.cdrom.file_id),
        ),
        ("boot", format!("order={}", request.boot_order.join(";"))),
        ("agent", format!("enabled=1,type={}", request.agent_type)),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect()
}

#[derive(Clone, Debug)]
pub struct ProxmoxClient {
    settings: Arc<ProxmoxSettings>,
    http_client: reqwest::Client,
    task_poll_interval: Duration,
    task_max_polls: u32,
    /// `/cluster/nextid` does not reserve the id it returns, so VM creations are serialized until the VM exists.
    create_lock: Arc<Mutex<()>>,
}

impl ProxmoxClient {
    pub fn new(settings: ProxmoxSettings) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(settings.insecure)
            .build()
            .context(error::HypervisorClientBuildSnafu)?;
        Ok(ProxmoxClient {
            settings: Arc::new(settings),
            http_client,
            task_poll_interval: TASK_POLL_INTERVAL,
            task_max_polls: TASK_MAX_POLLS,
            create_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(String, String)]>,
        query: Option<&[(&str, &str)]>,
    ) -> Result<T> {
        let url = format!("{}/api2/json{}", self.settings.endpoint, path);
        let mut request = self
            .http_client
            .request(method.clone(), &url)
            .header(reqwest::header::AUTHORIZATION, self.settings.authorization());
        if let Some(form) = form {
            request = request.form(form);
        }
        if let Some(query) = query {
            request = request.query(query);
        }

        let response = request.send().await.context(error::HypervisorRequestSnafu {
            method: method.as_str(),
            path,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return error::HypervisorResponseSnafu {
                method: method.as_str(),
                path,
                status_code: status,
                response: body,
            }
            .fail();
        }

        let envelope = response
            .json::<Envelope<T>>()
            .await
            .context(error::HypervisorRequestSnafu {
                method: method.as_str(),
                path,
            })?;
        Ok(envelope.data)
    }

    async fn wait_for_task(&self, hypervisor_node: &str, upid: &str) -> Result<()> {
        let path = format!(
            "/nodes/{}/tasks/{}/status",
            encode_segment(hypervisor_node),
            encode_segment(upid)
        );
        for _ in 0..self.task_max_polls {
            let status: TaskStatus = self.call(Method::GET, &path, None, None).await?;
            if status.status == "stopped" {
                let exit_status = status.exitstatus.unwrap_or_default();
                ensure!(
                    exit_status == "OK",
                    error::HypervisorTaskFailedSnafu { upid, exit_status }
                );
                return Ok(());
            }
            sleep(self.task_poll_interval).await;
        }

        error::HypervisorTaskTimeoutSnafu {
            upid,
            polls: self.task_max_polls,
        }
        .fail()
    }

    async fn next_vm_id(&self) -> Result<u32> {
        // Depending on the version, the next id is returned as a string or as a number.
        let value: serde_json::Value = self.call(Method::GET, "/cluster/nextid", None, None).await?;
        let id = match &value {
            serde_json::Value::String(id) => id.parse().ok(),
            serde_json::Value::Number(id) => id.as_u64().and_then(|id| u32::try_from(id).ok()),
            _ => None,
        };
        id.context(error::InvalidVmIdSnafu {
            value: value.to_string(),
        })
    }
}

#[async_trait]
impl HypervisorClient for ProxmoxClient {
    #[instrument(skip(self), err)]
    async fn find_vm(&self, hypervisor_node: &str, name: &str) -> Result<Option<VmHandle>> {
        let path = format!("/nodes/{}/qemu", encode_segment(hypervisor_node));
        let vms: Vec<QemuEntry> = self.call(Method::GET, &path, None, None).await?;
        Ok(vms
            .into_iter()
            .find(|vm| vm.name.as_deref() == Some(name))
            .map(|vm| VmHandle {
                vm_id: vm.vmid,
                name: name.to_string(),
                hypervisor_node: hypervisor_node.to_string(),
            }))
    }

    #[instrument(skip(self, request), fields(vm = %request.name), err)]
    async fn create_vm(&self, request: &VmRequest) -> Result<VmHandle> {
        let node = encode_segment(&request.hypervisor_node);

        let vm_id = {
            let _reservation = self.create_lock.lock().await;
            let vm_id = self.next_vm_id().await?;
            let params = vm_params(request, vm_id);
            let upid: String = self
                .call(
                    Method::POST,
                    &format!("/nodes/{}/qemu", node),
                    Some(params.as_slice()),
                    None,
                )
                .await?;
            self.wait_for_task(&request.hypervisor_node, &upid).await?;
            vm_id
        };
        event!(Level::INFO, vm_id, "Created VM");

        let upid: String = self
            .call(
                Method::POST,
                &format!("/nodes/{}/qemu/{}/status/start", node, vm_id),
                Some(&[][..]),
                None,
            )
            .await?;
        self.wait_for_task(&request.hypervisor_node, &upid).await?;
        event!(Level::INFO, vm_id, "Started VM");

        Ok(VmHandle {
            vm_id,
            name: request.name.clone(),
            hypervisor_node: request.hypervisor_node.clone(),
        })
    }

    #[instrument(skip(self, request), fields(file = %request.file_name), err)]
    async fn download_file(&self, request: &DownloadRequest) -> Result<String> {
        let node = encode_segment(&request.hypervisor_node);
        let storage_path = format!(
            "/nodes/{}/storage/{}/content",
            node,
            encode_segment(&request.datastore)
        );
        let file_id = request.file_id();

        let existing: Vec<StorageEntry> = self
            .call(
                Method::GET,
                &storage_path,
                None,
                Some(&[("content", request.content_type.as_str())][..]),
            )
            .await?;
        if existing.iter().any(|entry| entry.volid == file_id) {
            if !request.overwrite {
                event!(Level::INFO, %file_id, "File already present, keeping it");
                return Ok(file_id);
            }
            event!(Level::INFO, %file_id, "Replacing existing file");
            let deleted: Option<String> = self
                .call(
                    Method::DELETE,
                    &format!("{}/{}", storage_path, encode_segment(&file_id)),
                    None,
                    None,
                )
                .await?;
            if let Some(upid) = deleted {
                self.wait_for_task(&request.hypervisor_node, &upid).await?;
            }
        }

        let form = vec![
            ("url".to_string(), request.url.clone()),
            ("content".to_string(), request.content_type.clone()),
            ("filename".to_string(), request.file_name.clone()),
        ];
        let download_path = format!(
            "/nodes/{}/storage/{}/download-url",
            node,
            encode_segment(&request.datastore)
        );
        let upid: String = self
            .call(Method::POST, &download_path, Some(form.as_slice()), None)
            .await?;
        self.wait_for_task(&request.hypervisor_node, &upid).await?;

        Ok(file_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::test::fake_node;
    use crate::cluster::{HypervisorSettings, NodeRole};
    use axum::extract::{Form, Path, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Json, Response};
    use axum::routing::{get, post};
    use axum::Router;
    use serde_json::json;
    use std::collections::{HashMap, HashSet};

    /// The VM ids allocated on a fake Proxmox host.
    type Allocated = Arc<std::sync::Mutex<HashSet<u32>>>;

    fn request(name: &str, address: &str) -> VmRequest {
        let node = fake_node(name, address, NodeRole::Worker);
        VmRequest::for_node(
            &node,
            &HypervisorSettings::default(),
            "10.0.0.1".parse().unwrap(),
            &["10.0.0.1".parse().unwrap()],
            "local:iso/talos.iso",
        )
    }

    async fn next_id(State(allocated): State<Allocated>) -> Json<serde_json::Value> {
        let id = {
            let allocated = allocated.lock().unwrap();
            (100..).find(|id| !allocated.contains(id)).unwrap()
        };
        // Give a concurrent caller time to ask for the same id.
        sleep(Duration::from_millis(20)).await;
        Json(json!({ "data": id.to_string() }))
    }

    async fn create_qemu(
        State(allocated): State<Allocated>,
        Path(node): Path<String>,
        Form(params): Form<HashMap<String, String>>,
    ) -> Response {
        let vm_id: u32 = params["vmid"].parse().unwrap();
        if !allocated.lock().unwrap().insert(vm_id) {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("unable to create VM {} - config file already exists", vm_id),
            )
                .into_response();
        }
        Json(json!({ "data": format!("UPID:{}:qmcreate:{}", node, vm_id) })).into_response()
    }

    async fn start_qemu(Path((node, vm_id)): Path<(String, u32)>) -> Json<serde_json::Value> {
        Json(json!({ "data": format!("UPID:{}:qmstart:{}", node, vm_id) }))
    }

    async fn task_status() -> Json<serde_json::Value> {
        Json(json!({ "data": { "status": "stopped", "exitstatus": "OK" } }))
    }

    /// Serves the qemu endpoints of a single Proxmox host on an ephemeral port.
    async fn fake_proxmox(allocated: Allocated) -> ProxmoxSettings {
        let app = Router::new()
            .route("/api2/json/cluster/nextid", get(next_id))
            .route("/api2/json/nodes/:node/qemu", post(create_qemu))
            .route(
                "/api2/json/nodes/:node/qemu/:vmid/status/start",
                post(start_qemu),
            )
            .route("/api2/json/nodes/:node/tasks/:upid/status", get(task_status))
            .with_state(allocated);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        ProxmoxSettings {
            endpoint: format!("http://{}", address),
            token_id: "root@pam!talosforge".to_string(),
            token_secret: "s3cr3t".to_string(),
            insecure: false,
        }
    }

    #[tokio::test]
    async fn test_concurrent_creates_get_distinct_ids() {
        let allocated = Allocated::default();
        let client = ProxmoxClient::new(fake_proxmox(allocated.clone()).await).unwrap();

        let first = request("w-1", "10.0.0.21");
        let second = request("w-2", "10.0.0.22");
        let (first, second) = tokio::join!(client.create_vm(&first), client.create_vm(&second));
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_ne!(first.vm_id, second.vm_id);
        let mut ids = vec![first.vm_id, second.vm_id];
        ids.sort_unstable();
        assert_eq!(ids, vec![100, 101]);
        assert_eq!(allocated.lock().unwrap().len(), 2);
        assert_eq!(first.name, "w-1");
    }

    #[tokio::test]
    async fn test_clones_share_creation_order() {
        let allocated = Allocated::default();
        let client = ProxmoxClient::new(fake_proxmox(allocated.clone()).await).unwrap();
        let other = client.clone();

        let first = request("w-1", "10.0.0.21");
        let second = request("w-2", "10.0.0.22");
        let (first, second) = tokio::join!(client.create_vm(&first), other.create_vm(&second));

        assert_ne!(first.unwrap().vm_id, second.unwrap().vm_id);
    }

    #[test]
    fn test_vm_params() {
        let node = fake_node("cp-1", "10.0.0.10", NodeRole::ControlPlane);
        let request = VmRequest::for_node(
            &node,
            &HypervisorSettings::default(),
            "10.0.0.1".parse().unwrap(),
            &["10.0.0.1".parse().unwrap(), "1.1.1.1".parse().unwrap()],
            "local:iso/talos.iso",
        );
        let params: HashMap<String, String> = vm_params(&request, 105).into_iter().collect();

        let expected = vec![
            ("vmid", "105"),
            ("name", "cp-1"),
            ("bios", "ovmf"),
            ("efidisk0", "local-lvm:1,efitype=4m,format=raw"),
            ("cores", "2"),
            ("sockets", "1"),
            ("cpu", "host"),
            ("memory", "2048"),
            ("scsi0", "local-lvm:20,format=raw"),
            ("net0", "virtio,bridge=vmbr0"),
            ("ide0", "local-lvm:cloudinit"),
            ("citype", "nocloud"),
            ("ipconfig0", "ip=10.0.0.10/24,gw=10.0.0.1"),
            ("nameserver", "10.0.0.1 1.1.1.1"),
            ("ide2", "local:iso/talos.iso,media=cdrom"),
            ("boot", "order=scsi0"),
            ("agent", "enabled=1,type=virtio"),
        ];
        assert_eq!(params.len(), expected.len());
        for (key, value) in expected {
            assert_eq!(params.get(key).map(String::as_str), Some(value), "{}", key);
        }
    }

    #[test]
    fn test_encode_segment() {
        assert_eq!(encode_segment("local:iso/talos.iso"), "local%3Aiso%2Ftalos.iso");
        assert_eq!(encode_segment("pve01"), "pve01");
    }

    #[test]
    fn test_settings_debug_redacts_secret() {
        let settings = ProxmoxSettings {
            endpoint: "https://pve01:8006".to_string(),
            token_id: "root@pam!talosforge".to_string(),
            token_secret: "s3cr3t".to_string(),
            insecure: true,
        };
        assert!(!format!("{:?}", settings).contains("s3cr3t"));
        assert_eq!(settings.authorization(), "PVEAPIToken=root@pam!talosforge=s3cr3t");
    }
}

//! vSphere Automation API client
//!
//! Implements the vCenter REST surface used by the VMops controllers.
//! Mutations are submitted with the `vmw-task=true` invocation style and
//! return task handles that are polled at `/api/cis/tasks/{id}`.

use crate::error::VsphereError;
use crate::models::*;
use crate::vsphere_trait::HypervisorBackend;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

const SESSION_HEADER: &str = "vmware-api-session-id";

/// vSphere Automation API client
pub struct VsphereClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    session: RwLock<Option<String>>,
}

impl std::fmt::Debug for VsphereClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsphereClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct PowerInfo {
    state: PowerState,
}

impl VsphereClient {
    /// Create a new vSphere client
    ///
    /// # Arguments
    /// * `base_url` - vCenter base URL (e.g., "https://vcenter.lab:443")
    /// * `username` - SSO user, e.g. "administrator@vsphere.local"
    /// * `password` - SSO password
    pub fn new(
        base_url: String,
        username: String,
        password: String,
    ) -> Result<Self, VsphereError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(VsphereError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
            session: RwLock::new(None),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Open an authenticated session against vCenter.
    ///
    /// Must be called once before any other operation. The returned session
    /// identifier is replayed on every subsequent request.
    ///
    /// # Returns
    /// * `Ok(())` - Credentials are valid and vCenter is reachable
    /// * `Err(VsphereError)` - Credentials are invalid or vCenter is unreachable
    pub async fn login(&self) -> Result<(), VsphereError> {
        let url = format!("{}/api/session", self.base_url);
        debug!("Opening vCenter session for {}", self.username);

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(VsphereError::Http)?;

        let status = response.status();
        if status == 401 || status == 403 {
            let body = response.text().await.unwrap_or_default();
            return Err(VsphereError::Authentication(format!(
                "vCenter rejected credentials: {} - {}",
                status, body
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VsphereError::Api(format!(
                "Failed to open session: {} - {}",
                status, body
            )));
        }

        let session_id: String = response.json().await.map_err(VsphereError::Http)?;
        *self.session.write().await = Some(session_id);
        debug!("vCenter session established");
        Ok(())
    }

    /// Close the current session, if one is open
    pub async fn logout(&self) -> Result<(), VsphereError> {
        let Some(session_id) = self.session.write().await.take() else {
            return Ok(());
        };
        let url = format!("{}/api/session", self.base_url);
        debug!("Closing vCenter session");

        self.client
            .delete(&url)
            .header(SESSION_HEADER, session_id)
            .send()
            .await
            .map_err(VsphereError::Http)?;
        Ok(())
    }

    async fn session_id(&self) -> Result<String, VsphereError> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(|| VsphereError::Authentication("no open session; call login() first".to_string()))
    }

    /// Map a non-success response to the matching error kind
    async fn error_for(
        context: &str,
        response: reqwest::Response,
    ) -> VsphereError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == 401 || status == 403 {
            VsphereError::Authentication(format!("{}: {} - {}", context, status, body))
        } else if status == 404 {
            VsphereError::NotFound(format!("{}: {}", context, body))
        } else if status == 400 {
            VsphereError::InvalidRequest(format!("{}: {}", context, body))
        } else {
            VsphereError::Api(format!("{}: {} - {}", context, status, body))
        }
    }

    /// POST a JSON body to a task-style endpoint and parse the task id
    async fn post_task<B: serde::Serialize>(
        &self,
        url: String,
        context: &str,
        body: Option<&B>,
    ) -> Result<RemoteTask, VsphereError> {
        debug!("POST {}", url);
        let mut request = self
            .client
            .post(&url)
            .header(SESSION_HEADER, self.session_id().await?)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(VsphereError::Http)?;
        if !response.status().is_success() {
            return Err(Self::error_for(context, response).await);
        }

        let task_id: String = response.json().await.map_err(VsphereError::Http)?;
        Ok(RemoteTask { id: task_id })
    }

    /// GET a JSON resource
    async fn get_json<T: for<'de> serde::Deserialize<'de>>(
        &self,
        url: String,
        context: &str,
    ) -> Result<T, VsphereError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .header(SESSION_HEADER, self.session_id().await?)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(VsphereError::Http)?;

        if !response.status().is_success() {
            return Err(Self::error_for(context, response).await);
        }

        // Capture the body so decode failures carry useful context
        let text = response.text().await.map_err(VsphereError::Http)?;
        serde_json::from_str(&text).map_err(|e| {
            VsphereError::Api(format!(
                "error decoding response body: {} - Response (first 500 chars): {}",
                e,
                text.chars().take(500).collect::<String>()
            ))
        })
    }
}

#[async_trait::async_trait]
impl HypervisorBackend for VsphereClient {
    async fn create_vm(&self, spec: &VmCreateRequest) -> Result<RemoteTask, VsphereError> {
        let url = format!("{}/api/vcenter/vm?vmw-task=true", self.base_url);
        debug!("Creating VM {} ({} controllers in initial spec)", spec.name, spec.device_changes.len());
        self.post_task(url, &format!("Failed to create VM {}", spec.name), Some(spec))
            .await
    }

    async fn reconfigure_vm(
        &self,
        vm_id: &str,
        changes: &[DeviceChange],
    ) -> Result<RemoteTask, VsphereError> {
        if changes.is_empty() {
            return Err(VsphereError::InvalidRequest(
                "reconfiguration requires at least one device change".to_string(),
            ));
        }
        let url = format!(
            "{}/api/vcenter/vm/{}/hardware?vmw-task=true",
            self.base_url, vm_id
        );
        debug!("Reconfiguring VM {} with {} device changes", vm_id, changes.len());

        #[derive(serde::Serialize)]
        struct Body<'a> {
            device_changes: &'a [DeviceChange],
        }
        self.post_task(
            url,
            &format!("Failed to reconfigure VM {}", vm_id),
            Some(&Body { device_changes: changes }),
        )
        .await
    }

    async fn list_devices(&self, vm_id: &str) -> Result<Vec<DeviceInfo>, VsphereError> {
        let url = format!(
            "{}/api/vcenter/vm/{}/hardware/devices",
            self.base_url, vm_id
        );
        self.get_json(url, &format!("Failed to list devices of VM {}", vm_id))
            .await
    }

    async fn vm_info(&self, vm_id: &str) -> Result<VmInfo, VsphereError> {
        let url = format!("{}/api/vcenter/vm/{}", self.base_url, vm_id);
        self.get_json(url, &format!("Failed to fetch VM {}", vm_id)).await
    }

    async fn unregister_vm(&self, vm_id: &str) -> Result<(), VsphereError> {
        let url = format!(
            "{}/api/vcenter/vm/{}?action=unregister",
            self.base_url, vm_id
        );
        debug!("Unregistering VM {} from inventory", vm_id);

        let response = self
            .client
            .post(&url)
            .header(SESSION_HEADER, self.session_id().await?)
            .send()
            .await
            .map_err(VsphereError::Http)?;

        if !response.status().is_success() {
            return Err(Self::error_for(&format!("Failed to unregister VM {}", vm_id), response).await);
        }
        Ok(())
    }

    async fn register_vm(&self, request: &RegisterRequest) -> Result<RemoteTask, VsphereError> {
        let url = format!(
            "{}/api/vcenter/vm?action=register&vmw-task=true",
            self.base_url
        );
        debug!("Registering VM {} from {}", request.name, request.path);
        self.post_task(
            url,
            &format!("Failed to register VM from {}", request.path),
            Some(request),
        )
        .await
    }

    async fn power_on(&self, vm_id: &str) -> Result<RemoteTask, VsphereError> {
        let url = format!(
            "{}/api/vcenter/vm/{}/power?action=start&vmw-task=true",
            self.base_url, vm_id
        );
        debug!("Powering on VM {}", vm_id);
        self.post_task::<()>(url, &format!("Failed to power on VM {}", vm_id), None)
            .await
    }

    async fn power_off(&self, vm_id: &str) -> Result<RemoteTask, VsphereError> {
        let url = format!(
            "{}/api/vcenter/vm/{}/power?action=stop&vmw-task=true",
            self.base_url, vm_id
        );
        debug!("Powering off VM {}", vm_id);
        self.post_task::<()>(url, &format!("Failed to power off VM {}", vm_id), None)
            .await
    }

    async fn power_state(&self, vm_id: &str) -> Result<PowerState, VsphereError> {
        let url = format!("{}/api/vcenter/vm/{}/power", self.base_url, vm_id);
        let info: PowerInfo = self
            .get_json(url, &format!("Failed to read power state of VM {}", vm_id))
            .await?;
        Ok(info.state)
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<(), VsphereError> {
        let url = format!("{}/api/vcenter/vm/{}", self.base_url, vm_id);
        debug!("Deleting VM {}", vm_id);

        let response = self
            .client
            .delete(&url)
            .header(SESSION_HEADER, self.session_id().await?)
            .send()
            .await
            .map_err(VsphereError::Http)?;

        if !response.status().is_success() {
            return Err(Self::error_for(&format!("Failed to delete VM {}", vm_id), response).await);
        }
        Ok(())
    }

    async fn upload_iso(
        &self,
        datastore: &str,
        ds_path: &str,
        local_path: &std::path::Path,
    ) -> Result<String, VsphereError> {
        let url = format!(
            "{}/folder/{}?dsName={}",
            self.base_url,
            urlencoding::encode(ds_path),
            urlencoding::encode(datastore)
        );
        debug!("Uploading {} to [{}] {}", local_path.display(), datastore, ds_path);

        let bytes = tokio::fs::read(local_path).await.map_err(|e| {
            VsphereError::InvalidRequest(format!(
                "cannot read ISO {}: {}",
                local_path.display(),
                e
            ))
        })?;

        let response = self
            .client
            .put(&url)
            .header(SESSION_HEADER, self.session_id().await?)
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(VsphereError::Http)?;

        if !response.status().is_success() {
            return Err(Self::error_for(&format!("Failed to upload ISO to [{}] {}", datastore, ds_path), response).await);
        }
        Ok(format!("[{}] {}", datastore, ds_path))
    }

    async fn wait_for_task(
        &self,
        task: &RemoteTask,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<TaskOutcome, VsphereError> {
        let url = format!("{}/api/cis/tasks/{}", self.base_url, task.id);
        let started = tokio::time::Instant::now();

        loop {
            let status: TaskStatus = self
                .get_json(url.clone(), &format!("Failed to poll task {}", task.id))
                .await?;

            match status.state {
                TaskState::Succeeded => {
                    debug!("Task {} succeeded", task.id);
                    return Ok(TaskOutcome {
                        entity_id: status.entity_id,
                    });
                }
                TaskState::Failed => {
                    return Err(VsphereError::Task {
                        task_id: task.id.clone(),
                        message: status
                            .error_message
                            .unwrap_or_else(|| "task failed without a message".to_string()),
                    });
                }
                TaskState::Queued | TaskState::Running => {
                    if started.elapsed() >= timeout {
                        return Err(VsphereError::TaskTimeout {
                            task_id: task.id.clone(),
                            waited: started.elapsed(),
                        });
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }
}

//! Remote Executor: run a command in a container over the cluster exec endpoint

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// What to run and where
#[derive(Clone, Debug, PartialEq)]
pub struct ExecRequest {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
    /// Bytes written to the command's stdin before it is closed. `None`
    /// opens no stdin stream at all.
    pub stdin: Option<Vec<u8>>,
}

/// Captured output of a command that exited successfully
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Executes commands inside running containers.
///
/// Implementations never retry.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput>;
}

/// Executor backed by the Kubernetes pod exec subresource
#[derive(Clone)]
pub struct KubeExecutor {
    client: Client,
}

impl KubeExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteExecutor for KubeExecutor {
    async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        if request.command.is_empty() {
            return Err(Error::validation("exec request has an empty command"));
        }

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &request.namespace);

        let pod = pods
            .get_opt(&request.pod)
            .await
            .map_err(connection_error)?
            .ok_or_else(|| {
                Error::not_found(format!("pod {}/{}", request.namespace, request.pod))
            })?;

        let has_container = pod
            .spec
            .as_ref()
            .is_some_and(|spec| spec.containers.iter().any(|c| c.name == request.container));
        if !has_container {
            return Err(Error::not_found(format!(
                "container {} in pod {}/{}",
                request.container, request.namespace, request.pod
            )));
        }

        let params = AttachParams::default()
            .container(request.container.as_str())
            .stdin(request.stdin.is_some())
            .stdout(true)
            .stderr(true)
            .tty(false);

        info!(
            namespace = %request.namespace,
            pod = %request.pod,
            container = %request.container,
            program = %request.command[0],
            "Starting remote execution"
        );

        let mut attached = pods
            .exec(&request.pod, request.command.clone(), &params)
            .await
            .map_err(exec_error)?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let stdin = attached.stdin();
        let status = attached.take_status();

        let write_stdin = async move {
            if let (Some(mut writer), Some(data)) = (stdin, request.stdin.as_deref()) {
                writer.write_all(data).await?;
                writer.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };

        let (written, stdout, stderr) =
            tokio::join!(write_stdin, read_stream(stdout), read_stream(stderr));
        let stdout = stdout?;
        let stderr = stderr?;
        if let Err(e) = written {
            warn!(error = %e, pod = %request.pod, "Remote stdin closed early");
        }

        let status = match status {
            Some(status) => status.await,
            None => None,
        };

        if let Err(e) = attached.join().await {
            debug!(error = %e, "Exec stream did not shut down cleanly");
        }

        if let Some(status) = status {
            if status.status.as_deref() == Some("Failure") {
                let message = status
                    .message
                    .unwrap_or_else(|| "command exited unsuccessfully".to_string());
                return Err(Error::RemoteExecution {
                    message,
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                });
            }
        }

        debug!(
            pod = %request.pod,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "Remote execution finished"
        );

        Ok(ExecOutput { stdout, stderr })
    }
}

async fn read_stream<R: AsyncRead + Unpin>(reader: Option<R>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn connection_error(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => Error::not_found(resp.message),
        other => Error::Connection(other.to_string()),
    }
}

fn exec_error(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => Error::not_found(resp.message),
        kube::Error::Api(resp) => Error::RemoteExecution {
            message: resp.message,
            stderr: String::new(),
        },
        other => Error::Connection(other.to_string()),
    }
}

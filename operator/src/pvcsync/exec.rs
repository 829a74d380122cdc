use crate::util::Error;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, api::AttachParams};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs a command inside a pod and collects its output and exit code.
/// `stdin` is streamed to the process before reading output; the whole
/// exchange is bounded by `timeout`.
pub async fn exec_pod(
    client: &Client,
    namespace: &str,
    pod: &str,
    command: &[&str],
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<ExecOutput, Error> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = AttachParams::default()
        .stdin(stdin.is_some())
        .stdout(true)
        .stderr(true);
    let run = async {
        let mut attached = pods.exec(pod, command.to_vec(), &params).await?;

        if let Some(data) = stdin
            && let Some(mut writer) = attached.stdin()
        {
            writer
                .write_all(data)
                .await
                .map_err(|e| Error::UserInput(format!("exec stdin write: {e}")))?;
            writer
                .shutdown()
                .await
                .map_err(|e| Error::UserInput(format!("exec stdin close: {e}")))?;
        }

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut reader) = attached.stdout() {
            reader.read_to_string(&mut stdout).await.ok();
        }
        if let Some(mut reader) = attached.stderr() {
            reader.read_to_string(&mut stderr).await.ok();
        }

        let status = match attached.take_status() {
            Some(fut) => fut.await,
            None => None,
        };
        attached.join().await.ok();

        let exit_code = match status {
            Some(s) if s.status.as_deref() == Some("Success") => 0,
            Some(s) => s
                .details
                .as_ref()
                .and_then(|d| d.causes.as_ref())
                .and_then(|causes| {
                    causes
                        .iter()
                        .find(|c| c.reason.as_deref() == Some("ExitCode"))
                })
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.parse::<i32>().ok())
                .unwrap_or(1),
            None => 1,
        };

        Ok::<_, Error>(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    };
    match tokio::time::timeout(timeout, run).await {
        Ok(result) => result,
        Err(_) => Err(Error::UserInput(format!(
            "exec in pod '{namespace}/{pod}' timed out after {:?}",
            timeout
        ))),
    }
}

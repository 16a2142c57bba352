use crate::core::{FlowError, OvsCtl};
use tokio::process::Command;
use tracing::trace;

/// Runs `ovs-ofctl` against a bridge.
#[derive(Clone, Debug)]
pub struct OvsOfctl {
    bridge: String,
}

impl OvsOfctl {
    pub fn new(bridge: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
        }
    }

    async fn exec(&self, command: &str, directive: &str) -> Result<(), FlowError> {
        trace!(bridge = %self.bridge, %command, %directive, "ovs-ofctl");
        let output = Command::new("ovs-ofctl")
            .args(["-O", "OpenFlow13", command, &self.bridge, directive])
            .output()
            .await?;
        if output.status.success() {
            return Ok(());
        }

        let mut captured = String::from_utf8_lossy(&output.stderr).into_owned();
        captured.push_str(&String::from_utf8_lossy(&output.stdout));
        Err(FlowError::Command {
            command: command.to_string(),
            status: output.status.to_string(),
            output: captured.trim().to_string(),
        })
    }
}

#[async_trait::async_trait]
impl OvsCtl for OvsOfctl {
    async fn add_flow(&self, directive: &str) -> Result<(), FlowError> {
        self.exec("add-flow", directive).await
    }

    async fn del_flows(&self, directive: &str) -> Result<(), FlowError> {
        self.exec("del-flows", directive).await
    }
}

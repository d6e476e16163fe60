use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use data_model::NodeId;
use tokio::process::Command;
use tracing::info;

/// Performs the actual sandbox work. The coordination core only does the
/// bookkeeping around these actions; the virtualization tooling behind them
/// is an external collaborator.
#[async_trait]
pub trait VmProvider: Send + Sync {
    /// Creates a fresh sandbox VM under the given id.
    async fn build_clean(&self, vm: &NodeId) -> Result<()>;

    /// Destroys the named VM.
    async fn destroy(&self, vm: &NodeId) -> Result<()>;
}

/// Shells out to operator-configured commands. The VM's id is exposed to
/// the command through the `VMFLEET_VM_ID` environment variable.
pub struct CommandProvider {
    create_command: String,
    destroy_command: String,
}

impl CommandProvider {
    pub fn new(create_command: String, destroy_command: String) -> Self {
        Self {
            create_command,
            destroy_command,
        }
    }
}

#[async_trait]
impl VmProvider for CommandProvider {
    async fn build_clean(&self, vm: &NodeId) -> Result<()> {
        run_command(&self.create_command, vm)
            .await
            .context("create command failed")
    }

    async fn destroy(&self, vm: &NodeId) -> Result<()> {
        run_command(&self.destroy_command, vm)
            .await
            .context("destroy command failed")
    }
}

async fn run_command(command: &str, vm: &NodeId) -> Result<()> {
    info!(vm_id = %vm, command, "running vm provider command");
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .env("VMFLEET_VM_ID", vm.to_string())
        .status()
        .await?;
    if !status.success() {
        return Err(anyhow!("command exited with {status}"));
    }
    Ok(())
}
